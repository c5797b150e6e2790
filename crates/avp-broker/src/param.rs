//! Cached broker parameters.
//!
//! One [`Parameter`] exists per name advertised by `list_data`; aliases are
//! extra map entries pointing at the same `Arc<Parameter>`, so both names
//! observe identical state. A cached value is authoritative only while the
//! parameter is subscribed and the sample is younger than the stale window;
//! otherwise [`DeviceClient::value`](crate::DeviceClient::value) refreshes
//! it with a `status` call before returning. [`Parameter::mem_value`] skips
//! that check entirely.

use chrono::{Local, NaiveDateTime};
use serde_json::Value;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use avp_rpc::timestamp;

/// Read/write capability of a parameter, from the `type` field of
/// `list_data`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessClass {
    ReadOnly,
    ReadWrite,
    WriteOnly,
    NotImplemented,
}

impl AccessClass {
    /// Parse the wire form (`"RO"`, `"RW"`, `"WO"`, `"NI"`). Anything else
    /// is an instrument quirk the caller skips over.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "RO" => Some(Self::ReadOnly),
            "RW" => Some(Self::ReadWrite),
            "WO" => Some(Self::WriteOnly),
            "NI" => Some(Self::NotImplemented),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_readable(self) -> bool {
        matches!(self, Self::ReadOnly | Self::ReadWrite)
    }

    #[must_use]
    pub fn is_writable(self) -> bool {
        matches!(self, Self::ReadWrite | Self::WriteOnly)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ReadOnly => "RO",
            Self::ReadWrite => "RW",
            Self::WriteOnly => "WO",
            Self::NotImplemented => "NI",
        }
    }
}

#[derive(Debug, Default)]
struct CachedValue {
    value: Option<Value>,
    units: Option<String>,
    sample_time: Option<NaiveDateTime>,
    sample_time_raw: Option<String>,
    tz: Option<String>,
    set_to: Option<Value>,
    set_at: Option<NaiveDateTime>,
}

/// One device attribute and its last known state.
#[derive(Debug)]
pub struct Parameter {
    broker: String,
    name: String,
    access: AccessClass,
    stale_after: Duration,
    subscribed: AtomicBool,
    state: RwLock<CachedValue>,
}

impl Parameter {
    #[must_use]
    pub fn new(
        broker: impl Into<String>,
        name: impl Into<String>,
        access: AccessClass,
        units: Option<String>,
        stale_after: Duration,
    ) -> Self {
        Self {
            broker: broker.into(),
            name: name.into(),
            access,
            stale_after,
            subscribed: AtomicBool::new(false),
            state: RwLock::new(CachedValue {
                units,
                ..CachedValue::default()
            }),
        }
    }

    /// The name the broker itself recognizes (aliases resolve to this).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn broker(&self) -> &str {
        &self.broker
    }

    #[must_use]
    pub fn access(&self) -> AccessClass {
        self.access
    }

    #[must_use]
    pub fn units(&self) -> Option<String> {
        self.read().units.clone()
    }

    /// Last cached value, stale or not. No refresh is triggered.
    #[must_use]
    pub fn mem_value(&self) -> Option<Value> {
        self.read().value.clone()
    }

    #[must_use]
    pub fn sample_time(&self) -> Option<NaiveDateTime> {
        self.read().sample_time
    }

    /// Sample time in the packed wire form.
    #[must_use]
    pub fn sample_time_raw(&self) -> Option<String> {
        self.read().sample_time_raw.clone()
    }

    #[must_use]
    pub fn tz(&self) -> Option<String> {
        self.read().tz.clone()
    }

    #[must_use]
    pub fn subscribed(&self) -> bool {
        self.subscribed.load(Ordering::SeqCst)
    }

    pub(crate) fn set_subscribed(&self, subscribed: bool) {
        self.subscribed.store(subscribed, Ordering::SeqCst);
    }

    /// Value passed to the most recent `set`, for audit.
    #[must_use]
    pub fn set_to(&self) -> Option<Value> {
        self.read().set_to.clone()
    }

    #[must_use]
    pub fn set_at(&self) -> Option<NaiveDateTime> {
        self.read().set_at
    }

    /// True when there is no sample yet or the last one is older than the
    /// stale window.
    #[must_use]
    pub fn is_stale(&self) -> bool {
        let Some(sample_time) = self.read().sample_time else {
            return true;
        };
        let age = Local::now().naive_local() - sample_time;
        age > chrono::Duration::from_std(self.stale_after).unwrap_or(chrono::Duration::MAX)
    }

    /// Apply a value received from the broker (status reply or
    /// notification). `sample_time_raw` falls back to the message-level
    /// time when the parameter carried none of its own.
    pub(crate) fn apply_update(
        &self,
        value: Value,
        units: Option<&str>,
        sample_time_raw: Option<&str>,
        tz: Option<&str>,
    ) {
        let mut state = self.write();
        let units_now = units.map(str::to_string).or_else(|| state.units.clone());
        let value = if units_now.as_deref().is_some_and(|u| u.eq_ignore_ascii_case("boolean")) {
            coerce_boolean(value)
        } else {
            value
        };
        state.value = Some(value);
        state.units = units_now;
        if let Some(raw) = sample_time_raw {
            state.sample_time_raw = Some(raw.to_string());
            state.sample_time = timestamp::parse_packed(raw);
        }
        if let Some(tz) = tz {
            state.tz = Some(tz.to_string());
        }
    }

    /// Record the audit trail of a `set` call.
    pub(crate) fn record_set(&self, value: Value) {
        let mut state = self.write();
        state.set_to = Some(value);
        state.set_at = Some(Local::now().naive_local());
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, CachedValue> {
        self.state.read().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, CachedValue> {
        self.state.write().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Coerce the string/ordinal booleans some brokers (lisst, isco) send into
/// real booleans.
#[must_use]
pub(crate) fn coerce_boolean(value: Value) -> Value {
    match value {
        Value::Bool(_) => value,
        Value::String(s) => match s.to_ascii_lowercase().as_str() {
            "true" | "t" | "yes" | "1" => Value::Bool(true),
            "false" | "f" | "no" | "0" => Value::Bool(false),
            _ => Value::String(s),
        },
        Value::Number(n) => Value::Bool(n.as_f64().unwrap_or(0.0) != 0.0),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meters_param(access: AccessClass) -> Parameter {
        Parameter::new(
            "sonde",
            "depth_m",
            access,
            Some("m".to_string()),
            Duration::from_secs(10),
        )
    }

    #[test]
    fn test_access_class_parse() {
        assert_eq!(AccessClass::parse("RO"), Some(AccessClass::ReadOnly));
        assert_eq!(AccessClass::parse("RW"), Some(AccessClass::ReadWrite));
        assert_eq!(AccessClass::parse("WO"), Some(AccessClass::WriteOnly));
        assert_eq!(AccessClass::parse("NI"), Some(AccessClass::NotImplemented));
        assert_eq!(AccessClass::parse("XX"), None);
        assert_eq!(AccessClass::parse(""), None);
    }

    #[test]
    fn test_access_predicates() {
        assert!(AccessClass::ReadOnly.is_readable());
        assert!(!AccessClass::ReadOnly.is_writable());
        assert!(AccessClass::ReadWrite.is_readable());
        assert!(AccessClass::ReadWrite.is_writable());
        assert!(!AccessClass::WriteOnly.is_readable());
        assert!(AccessClass::WriteOnly.is_writable());
        assert!(!AccessClass::NotImplemented.is_readable());
        assert!(!AccessClass::NotImplemented.is_writable());
    }

    #[test]
    fn test_new_parameter_is_stale() {
        let param = meters_param(AccessClass::ReadOnly);
        assert!(param.is_stale());
        assert!(param.mem_value().is_none());
        assert!(!param.subscribed());
    }

    #[test]
    fn test_apply_update_caches_value_and_time() {
        let param = meters_param(AccessClass::ReadOnly);
        let now = timestamp::format_packed(Local::now().naive_local());
        param.apply_update(json!(2.31), None, Some(&now), Some("America/New_York"));

        assert_eq!(param.mem_value().unwrap(), json!(2.31));
        assert_eq!(param.sample_time_raw().unwrap(), now);
        assert_eq!(param.tz().unwrap(), "America/New_York");
        assert!(!param.is_stale());
    }

    #[test]
    fn test_old_sample_is_stale() {
        let param = meters_param(AccessClass::ReadOnly);
        let old = Local::now().naive_local() - chrono::Duration::seconds(11);
        param.apply_update(json!(1.0), None, Some(&timestamp::format_packed(old)), None);
        assert!(param.is_stale());
    }

    #[test]
    fn test_boolean_unit_coerces_strings() {
        let param = Parameter::new(
            "lisst",
            "pumping",
            AccessClass::ReadOnly,
            Some("boolean".to_string()),
            Duration::from_secs(10),
        );
        param.apply_update(json!("true"), None, None, None);
        assert_eq!(param.mem_value().unwrap(), json!(true));

        param.apply_update(json!("false"), None, None, None);
        assert_eq!(param.mem_value().unwrap(), json!(false));

        param.apply_update(json!(0), None, None, None);
        assert_eq!(param.mem_value().unwrap(), json!(false));
    }

    #[test]
    fn test_non_boolean_unit_keeps_strings() {
        let param = meters_param(AccessClass::ReadOnly);
        param.apply_update(json!("true"), None, None, None);
        assert_eq!(param.mem_value().unwrap(), json!("true"));
    }

    #[test]
    fn test_units_from_status_overwrite_discovery() {
        let param = meters_param(AccessClass::ReadOnly);
        param.apply_update(json!(1.5), Some("ft"), None, None);
        assert_eq!(param.units().unwrap(), "ft");
    }

    #[test]
    fn test_record_set_audit() {
        let param = meters_param(AccessClass::ReadWrite);
        assert!(param.set_to().is_none());
        param.record_set(json!(5));
        assert_eq!(param.set_to().unwrap(), json!(5));
        assert!(param.set_at().is_some());
    }

    #[test]
    fn test_coerce_boolean_variants() {
        assert_eq!(coerce_boolean(json!("T")), json!(true));
        assert_eq!(coerce_boolean(json!("no")), json!(false));
        assert_eq!(coerce_boolean(json!(1)), json!(true));
        assert_eq!(coerce_boolean(json!(true)), json!(true));
        assert_eq!(coerce_boolean(json!("maybe")), json!("maybe"));
        assert_eq!(coerce_boolean(json!(null)), json!(null));
    }
}
