//! The public device API: schema discovery, get/set, subscriptions, the
//! control-token protocol and broker lifecycle.
//!
//! One `DeviceClient` fronts one broker process. Parameters are created
//! dynamically from the broker's `list_data` advertisement; configured
//! aliases are bound to the same underlying [`Parameter`], so
//! `client.param("depth")` and `client.param("depth_m")` observe identical
//! state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use avp_rpc::{RpcError, SUSPENDED_UNSUBSCRIBE, TOKEN_HELD, timestamp};

use crate::config::BrokerConfig;
use crate::error::{BrokerError, Result};
use crate::param::{AccessClass, Parameter, coerce_boolean};
use crate::router::{Callback, CallbackMap, NotificationRouter, SubscriptionMap};
use crate::transport::Transport;

/// How long `connect` waits for the socket before deferring discovery.
const CONNECT_WAIT: Duration = Duration::from_secs(2);

/// `_structure_data` retries while the broker reports the instrument
/// itself disconnected (common right after supervisor startup).
const DISCOVERY_TRIES: u32 = 8;
const DISCOVERY_PAUSE: Duration = Duration::from_secs(2);

/// Brokers send a double-precision minimum instead of null when they have
/// no real value yet.
const MINIMUM_VALUE: f64 = 1e-300;

/// Java-side failures that arrive disguised as a string `result`.
const JAVA_FAILURES: [&str; 2] = [
    "java.lang.NullPointerException",
    "java.lang.ClassCastException: java.sql.Timestamp cannot be cast to java.lang.String",
];

/// Liveness flags cached from the most recent `broker_status` reply and
/// consulted by every collaborator (cast logic, scheduler, console).
#[derive(Debug, Clone, Default)]
pub struct BrokerStatus {
    pub power_on: bool,
    pub db_connected: bool,
    pub instr_connected: bool,
    pub suspended: bool,
    pub last_db_time: Option<String>,
    pub last_data_time: Option<String>,
    pub start_time: Option<String>,
}

/// Subscription request options; the defaults ask for on-change updates in
/// terse style.
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    /// `on_new` instead of `on_change` updates.
    pub on_new: bool,
    pub min_interval_ms: Option<u64>,
    pub max_interval_ms: Option<u64>,
    pub verbose: bool,
    /// Skip unknown names silently instead of logging an error.
    pub ignore_missing: bool,
}

/// Power subcommands accepted by the brokers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerCommand {
    On,
    Off,
    Check,
}

impl PowerCommand {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::On => "on",
            Self::Off => "off",
            Self::Check => "check",
        }
    }
}

/// Generic client for one instrument broker.
pub struct DeviceClient {
    broker_name: String,
    program_name: String,
    config: BrokerConfig,
    transport: Transport,
    /// Advertised names plus aliases; aliases share the Arc.
    params: RwLock<HashMap<String, Arc<Parameter>>>,
    subscriptions: SubscriptionMap,
    callbacks: CallbackMap,
    router: JoinHandle<()>,
    initialized: AtomicBool,
    /// Local belief that we hold the control token. A belief only: a
    /// competing process can force-acquire at any moment without this
    /// client being told, so it may disagree with [`token_owner`]'s
    /// server-side truth. See [`Self::token_held`].
    ///
    /// [`token_owner`]: Self::token_owner
    token_held: AtomicBool,
    status: RwLock<BrokerStatus>,
}

impl DeviceClient {
    /// Connect to a broker and discover its parameter schema.
    ///
    /// The client is returned even when the broker is unreachable: the
    /// transport keeps retrying in the background and discovery runs on
    /// the first successful `resume_broker` or explicit [`discover`].
    ///
    /// [`discover`]: Self::discover
    pub async fn connect(
        broker_name: &str,
        config: BrokerConfig,
        program_name: &str,
    ) -> Result<Self> {
        let (transport, notifications) = Transport::connect(broker_name, &config.host, config.port);
        let subscriptions: SubscriptionMap = Arc::new(RwLock::new(HashMap::new()));
        let callbacks: CallbackMap = Arc::new(RwLock::new(HashMap::new()));
        let router = NotificationRouter::spawn(
            broker_name,
            notifications,
            Arc::clone(&subscriptions),
            Arc::clone(&callbacks),
        );

        let client = Self {
            broker_name: broker_name.to_string(),
            program_name: program_name.to_string(),
            config,
            transport,
            params: RwLock::new(HashMap::new()),
            subscriptions,
            callbacks,
            router,
            initialized: AtomicBool::new(false),
            token_held: AtomicBool::new(false),
            status: RwLock::new(BrokerStatus::default()),
        };

        if client.transport.wait_connected(CONNECT_WAIT).await {
            if let Err(e) = client.discover().await {
                warn!(broker = %client.broker_name, "initial discovery failed: {e}");
            }
        } else {
            warn!(
                broker = %client.broker_name,
                "broker not reachable yet, deferring schema discovery"
            );
        }
        Ok(client)
    }

    /// Release the token if we believe we hold it, then stop the router
    /// and close the socket.
    pub async fn disconnect(&self) {
        if self.token_held() {
            if let Err(e) = self.token_release().await {
                warn!(broker = %self.broker_name, "token release on disconnect failed: {e}");
            }
        }
        self.router.abort();
        self.transport.shutdown();
    }

    /// Are we connected to the broker's socket?
    #[must_use]
    pub fn connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Has `list_data` discovery completed?
    #[must_use]
    pub fn initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn broker_name(&self) -> &str {
        &self.broker_name
    }

    /// Look up a parameter (or alias) for direct
    /// `value`/`units`/`sample_time`/`subscribed` access.
    #[must_use]
    pub fn param(&self, name: &str) -> Option<Arc<Parameter>> {
        self.params_read().get(name).cloned()
    }

    /// Names of all discovered parameters, aliases included.
    #[must_use]
    pub fn parameter_names(&self) -> Vec<String> {
        self.params_read().keys().cloned().collect()
    }

    /// Liveness flags from the last `broker_status` call.
    #[must_use]
    pub fn status_flags(&self) -> BrokerStatus {
        self.status
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    // ---- schema discovery ------------------------------------------------

    /// Query `list_data` and create one [`Parameter`] per advertised item.
    ///
    /// Safe to call again after a broker restart: existing parameters are
    /// kept, new ones added. Items with an unrecognized access class are
    /// skipped, not errors. Returns the number of parameters added.
    ///
    /// # Errors
    ///
    /// Fails when the socket is down, when the broker never reports its
    /// instrument connected, or when `list_data` itself fails.
    pub async fn discover(&self) -> Result<usize> {
        // The broker may be up while its instrument is still connecting.
        let _ = self.broker_status().await;
        if !self.connected() {
            self.initialized.store(false, Ordering::SeqCst);
            return Err(RpcError::transport(format!(
                "cannot discover {} schema while socket not connected",
                self.broker_name
            ))
            .into());
        }
        let mut tries = DISCOVERY_TRIES;
        while !self.status_flags().instr_connected && tries > 0 {
            tries -= 1;
            tokio::time::sleep(DISCOVERY_PAUSE).await;
            let _ = self.broker_status().await;
        }
        if !self.status_flags().instr_connected {
            self.initialized.store(false, Ordering::SeqCst);
            info!(
                broker = %self.broker_name,
                "cannot build schema while instrument not connected"
            );
            return Err(RpcError::transport(format!(
                "{} instrument not connected",
                self.broker_name
            ))
            .into());
        }

        let data_list = self
            .call("list_data", Some(json!(["units", "type"])), None)
            .await?;
        let Value::Object(data_list) = data_list else {
            return Err(RpcError::transport(format!(
                "list_data returned a non-object: {data_list}"
            ))
            .into());
        };

        let mut added = 0;
        {
            let mut params = self.params_write();
            for (name, item) in &data_list {
                let access_raw = item.get("type").and_then(Value::as_str).unwrap_or("");
                let Some(access) = AccessClass::parse(access_raw) else {
                    info!(
                        broker = %self.broker_name,
                        parameter = %name,
                        access = %access_raw,
                        "skipping parameter of unknown type"
                    );
                    continue;
                };
                if params.contains_key(name) {
                    debug!(broker = %self.broker_name, parameter = %name, "already known");
                    continue;
                }
                let units = item
                    .get("units")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                params.insert(
                    name.clone(),
                    Arc::new(Parameter::new(
                        &self.broker_name,
                        name,
                        access,
                        units,
                        self.config.stale_time(),
                    )),
                );
                added += 1;
            }

            // Aliases bind to the same entry, never a copy.
            for (alias, target) in &self.config.aliases {
                if let Some(param) = params.get(target).cloned() {
                    params.entry(alias.clone()).or_insert(param);
                } else {
                    warn!(
                        broker = %self.broker_name,
                        alias = %alias,
                        target = %target,
                        "alias target not advertised by broker"
                    );
                }
            }
        }

        self.initialized.store(true, Ordering::SeqCst);
        debug!(broker = %self.broker_name, added, "schema discovery complete");
        Ok(added)
    }

    // ---- reads -----------------------------------------------------------

    /// Fetch current values for `names` with one batched `status` call.
    ///
    /// Unknown and unreadable names are rejected locally, identifying the
    /// offending name, before anything is sent. Returned values are keyed
    /// by the requested names (aliases included).
    ///
    /// # Errors
    ///
    /// [`BrokerError::UnknownParameter`], [`BrokerError::NotReadable`],
    /// or any transport/server failure from the `status` call.
    pub async fn get_value(&self, names: &[&str]) -> Result<HashMap<String, Value>> {
        self.require_initialized()?;

        let mut real_names: Vec<String> = Vec::with_capacity(names.len());
        for &name in names {
            if name == "message_time" {
                // Never requested; the broker includes it regardless.
                continue;
            }
            let param = self.lookup(name)?;
            if !param.access().is_readable() {
                warn!(broker = %self.broker_name, parameter = %name, "not readable");
                return Err(BrokerError::NotReadable {
                    broker: self.broker_name.clone(),
                    name: name.to_string(),
                });
            }
            let real = param.name().to_string();
            if !real_names.contains(&real) {
                real_names.push(real);
            }
        }

        let status = self.status_rpc(&real_names, false, None).await?;
        let mut values = HashMap::new();
        for &name in names {
            if name == "message_time" {
                continue;
            }
            // lookup succeeded above, the map has not shrunk since
            let Some(param) = self.param(name) else {
                continue;
            };
            let value = status
                .get(param.name())
                .and_then(|entry| entry.get("value"))
                .cloned()
                .unwrap_or(Value::Null);
            values.insert(name.to_string(), value);
        }
        Ok(values)
    }

    /// Read one parameter with the staleness contract: subscribed and
    /// fresh values come from cache, anything else costs one `status`
    /// round-trip first. [`Parameter::mem_value`] via [`Self::param`] is
    /// the escape hatch that skips the refresh.
    ///
    /// # Errors
    ///
    /// Unknown or unreadable names, or a failed refresh RPC.
    pub async fn value(&self, name: &str) -> Result<Value> {
        self.require_initialized()?;
        let param = self.lookup(name)?;
        if !param.access().is_readable() {
            return Err(BrokerError::NotReadable {
                broker: self.broker_name.clone(),
                name: name.to_string(),
            });
        }
        if !param.subscribed() || param.is_stale() {
            self.status_rpc(&[param.name().to_string()], false, None)
                .await?;
        }
        Ok(param.mem_value().unwrap_or(Value::Null))
    }

    // ---- writes ----------------------------------------------------------

    /// Set writable parameters with one batched `set` call.
    ///
    /// Non-writable or unknown names are declined locally (logged, never
    /// sent). Each parameter actually sent records `set_to`/`set_at` for
    /// audit. With `write_store` the broker also persists the value.
    ///
    /// # Errors
    ///
    /// [`BrokerError::InvalidArgument`] for an empty `values`,
    /// [`BrokerError::NotWritable`] when nothing in `values` is writable
    /// (no RPC is issued), or any failure from the `set` call.
    pub async fn set(&self, values: &HashMap<String, Value>, write_store: bool) -> Result<Value> {
        self.require_initialized()?;
        if values.is_empty() {
            return Err(BrokerError::InvalidArgument(
                "set called with no values".to_string(),
            ));
        }

        let mut checked = serde_json::Map::new();
        let mut first_rejected: Option<String> = None;
        for (name, value) in values {
            let Some(param) = self.param(name) else {
                warn!(broker = %self.broker_name, parameter = %name, "set: no such parameter");
                first_rejected.get_or_insert_with(|| name.clone());
                continue;
            };
            if !param.access().is_writable() {
                warn!(broker = %self.broker_name, parameter = %name, "set: not writable");
                first_rejected.get_or_insert_with(|| name.clone());
                continue;
            }
            param.record_set(value.clone());
            checked.insert(param.name().to_string(), value.clone());
        }

        if checked.is_empty() {
            return Err(BrokerError::NotWritable {
                broker: self.broker_name.clone(),
                name: first_rejected.unwrap_or_default(),
            });
        }
        if write_store {
            checked.insert("write_store".to_string(), Value::Bool(true));
        }
        self.call("set", Some(Value::Object(checked)), None).await
    }

    // ---- subscriptions ---------------------------------------------------

    /// Subscribe to push updates for `names`.
    ///
    /// Merge semantics: a name is subscribed or it is not. Re-subscribing
    /// is a no-op, and there is no per-caller reference counting:
    /// unsubscribing later removes the parameter for everyone.
    /// `message_time` is tracked implicitly whenever anything else is.
    ///
    /// # Errors
    ///
    /// Fails if the client is uninitialized or the `subscribe` RPC fails.
    pub async fn add_subscriptions(
        &self,
        names: &[&str],
        options: &SubscribeOptions,
    ) -> Result<Value> {
        self.require_initialized()?;

        let mut checked: Vec<String> = Vec::new();
        {
            let params = self.params_read();
            let mut subs = self
                .subscriptions
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let mut names_to_add: Vec<&str> = names.to_vec();
            names_to_add.push("message_time");
            for name in names_to_add {
                let Some(param) = params.get(name) else {
                    if options.ignore_missing {
                        debug!(broker = %self.broker_name, parameter = %name, "skipping unknown");
                    } else {
                        error!(broker = %self.broker_name, parameter = %name, "cannot subscribe to unknown parameter");
                    }
                    continue;
                };
                let real = param.name().to_string();
                if subs.contains_key(name) || subs.contains_key(&real) {
                    debug!(broker = %self.broker_name, parameter = %name, "already subscribed");
                    continue;
                }
                subs.insert(name.to_string(), Arc::clone(param));
                subs.insert(real.clone(), Arc::clone(param));
                param.set_subscribed(true);
                if real != "message_time" {
                    checked.push(real);
                }
            }
        }

        if checked.is_empty() {
            debug!(broker = %self.broker_name, "no new subscriptions to add");
            return Ok(Value::Null);
        }

        let mut request = json!({
            "data": checked,
            "style": if options.verbose { "verbose" } else { "terse" },
            "updates": if options.on_new { "on_new" } else { "on_change" },
        });
        if let Some(ms) = options.min_interval_ms {
            request["min_update_ms"] = json!(ms);
        }
        if let Some(ms) = options.max_interval_ms {
            request["max_update_ms"] = json!(ms);
        }
        self.call("subscribe", Some(request), None).await
    }

    /// Cancel push updates for `names`.
    ///
    /// Aliases and `message_time` are handled locally; everything else is
    /// one batched `unsubscribe` RPC. The broker refuses to unsubscribe
    /// while suspended; that specific code is an expected outcome and is
    /// logged at debug.
    ///
    /// # Errors
    ///
    /// Any failure from the `unsubscribe` RPC, including the
    /// while-suspended refusal.
    pub async fn unsubscribe(&self, names: &[&str]) -> Result<Value> {
        let mut checked: Vec<String> = Vec::new();
        {
            let params = self.params_read();
            let mut subs = self
                .subscriptions
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            for &name in names {
                let Some(param) = params.get(name) else {
                    debug!(broker = %self.broker_name, parameter = %name, "unsubscribe: unknown");
                    continue;
                };
                let real = param.name();
                if !subs.contains_key(real) {
                    debug!(broker = %self.broker_name, parameter = %name, "not subscribed");
                    continue;
                }
                if name != real {
                    // Alias entry only; the broker knows nothing of it.
                    subs.remove(name);
                    continue;
                }
                if real == "message_time" {
                    subs.remove(name);
                    param.set_subscribed(false);
                    continue;
                }
                if !checked.contains(&real.to_string()) {
                    checked.push(real.to_string());
                }
            }
        }

        let mut result = Value::Null;
        if !checked.is_empty() {
            let rpc = self
                .call("unsubscribe", Some(json!({"data": checked})), None)
                .await;
            {
                let params = self.params_read();
                let mut subs = self
                    .subscriptions
                    .write()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                for name in &checked {
                    subs.remove(name);
                    if let Some(param) = params.get(name) {
                        param.set_subscribed(false);
                    }
                }
            }
            match rpc {
                Ok(value) => result = value,
                Err(e) => {
                    if e.code() == Some(SUSPENDED_UNSUBSCRIBE) {
                        debug!(broker = %self.broker_name, "unsubscribe while suspended: {e}");
                    } else {
                        error!(broker = %self.broker_name, "unsubscribe failed: {e}");
                    }
                    return Err(e);
                }
            }
        }

        // A registry holding only message_time is pointless; drop it too.
        let leftover: Vec<String> = {
            let subs = self
                .subscriptions
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            subs.keys().cloned().collect()
        };
        if leftover == ["message_time"] {
            let mut subs = self
                .subscriptions
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some(param) = subs.remove("message_time") {
                param.set_subscribed(false);
            }
        }
        Ok(result)
    }

    /// Unsubscribe from everything and clear all callbacks.
    pub async fn unsubscribe_all(&self) -> Result<()> {
        let names: Vec<String> = {
            let subs = self
                .subscriptions
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            subs.keys().cloned().collect()
        };
        if !names.is_empty() {
            debug!(broker = %self.broker_name, ?names, "unsubscribing all");
            let refs: Vec<&str> = names.iter().map(String::as_str).collect();
            let _ = self.unsubscribe(&refs).await;
        }
        self.callbacks
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clear();
        let mut subs = self
            .subscriptions
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for param in subs.values() {
            param.set_subscribed(false);
        }
        subs.clear();
        Ok(())
    }

    /// Register a handler for a parameter's push updates. The subscription
    /// need not exist yet; the router matches by name when data arrives.
    /// Handlers run on their own spawned tasks and receive
    /// `(sample_time, parameter)`. Aliases are not matched.
    pub fn add_callback(&self, name: &str, callback: Callback) {
        self.callbacks
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(name.to_string(), callback);
    }

    /// Remove handlers by parameter name.
    pub fn remove_callback(&self, names: &[&str]) {
        let mut callbacks = self
            .callbacks
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for &name in names {
            if callbacks.remove(name).is_none() {
                debug!(broker = %self.broker_name, parameter = %name, "no such callback");
            }
        }
    }

    // ---- control token ---------------------------------------------------

    /// Do we believe we hold the control token?
    ///
    /// This is the client's local belief, not ground truth: a competing
    /// process can `tokenForceAcquire` at any time and the server does not
    /// notify the displaced holder. Verify with [`Self::token_owner`] when
    /// it matters.
    #[must_use]
    pub fn token_held(&self) -> bool {
        self.token_held.load(Ordering::SeqCst)
    }

    /// Name of the current token holder, `""` when unowned.
    ///
    /// # Errors
    ///
    /// Transport or server failure.
    pub async fn token_owner(&self) -> Result<String> {
        let result = self.call("tokenOwner", None, None).await?;
        match result {
            Value::String(owner) => Ok(owner),
            Value::Null => Ok(String::new()),
            other => Err(RpcError::transport(format!(
                "tokenOwner returned a non-string: {other}"
            ))
            .into()),
        }
    }

    /// Plain acquire. Losing the race for the token is expected; the
    /// contention code is logged as a warning, anything else as an error.
    ///
    /// # Errors
    ///
    /// The server's refusal (contention code [`TOKEN_HELD`]) or any
    /// transport failure. Either way the local belief becomes "not held".
    pub async fn token_acquire(&self, component: &str) -> Result<Value> {
        let name = self.requester(component);
        let result = self
            .call("tokenAcquire", Some(json!({"name": name})), None)
            .await;
        match &result {
            Ok(_) => self.token_held.store(true, Ordering::SeqCst),
            Err(e) => {
                if e.code() == Some(TOKEN_HELD) {
                    warn!(broker = %self.broker_name, "token contention: {e}");
                } else {
                    error!(broker = %self.broker_name, "token acquire failed: {e}");
                }
                self.token_held.store(false, Ordering::SeqCst);
            }
        }
        result
    }

    /// Force acquire, displacing any current holder. The server treats
    /// this as always succeeding for an authorized client.
    ///
    /// # Errors
    ///
    /// Transport failure only, in which case the belief becomes "not
    /// held".
    pub async fn token_force_acquire(&self, component: &str) -> Result<Value> {
        let name = self.requester(component);
        let result = self
            .call("tokenForceAcquire", Some(json!({"name": name})), None)
            .await;
        match &result {
            Ok(_) => self.token_held.store(true, Ordering::SeqCst),
            Err(e) => {
                error!(broker = %self.broker_name, "token force acquire failed: {e}");
                self.token_held.store(false, Ordering::SeqCst);
            }
        }
        result
    }

    /// Release the token. The belief flips to "not held" only when the
    /// server confirms the release.
    ///
    /// # Errors
    ///
    /// The server's refusal or transport failure; the belief is unchanged.
    pub async fn token_release(&self) -> Result<Value> {
        let result = self.call("tokenRelease", None, None).await?;
        self.token_held.store(false, Ordering::SeqCst);
        Ok(result)
    }

    /// Acquire the token with the standard decision tree:
    ///
    /// 1. held under our own program name (another component of this
    ///    process) -> force-acquire;
    /// 2. unowned -> plain acquire;
    /// 3. held by someone else -> plain acquire, or force-acquire when
    ///    `override_owner` is set.
    ///
    /// # Errors
    ///
    /// Contention or transport failures from the chosen acquire call.
    pub async fn acquire_token(&self, component: &str, override_owner: bool) -> Result<Value> {
        let owner = match self.token_owner().await {
            Ok(owner) => owner,
            Err(e) => {
                debug!(broker = %self.broker_name, "owner query failed, trying plain acquire: {e}");
                String::new()
            }
        };

        let result = if owner.contains(&self.program_name) {
            debug!(
                broker = %self.broker_name,
                %owner,
                "token owned by self, force-acquiring"
            );
            self.token_force_acquire(component).await
        } else if owner.is_empty() {
            debug!(broker = %self.broker_name, "token unowned, acquiring");
            self.token_acquire(component).await
        } else if override_owner {
            info!(
                broker = %self.broker_name,
                %owner,
                "override set, force-acquiring token"
            );
            self.token_force_acquire(component).await
        } else {
            self.token_acquire(component).await
        };

        if result.is_ok() {
            if let Ok(owner) = self.token_owner().await {
                debug!(broker = %self.broker_name, %owner, "token acquired");
            }
        }
        result
    }

    // ---- lifecycle -------------------------------------------------------

    /// Switch or query instrument power.
    ///
    /// # Errors
    ///
    /// Transport or server failure.
    pub async fn power(&self, command: PowerCommand) -> Result<Value> {
        self.call("power", Some(json!({"status": command.as_str()})), None)
            .await
    }

    /// Ask the broker process to exit. Any token belief is dropped; the
    /// server side is gone with the process.
    ///
    /// # Errors
    ///
    /// Transport or server failure.
    pub async fn shutdown_broker(&self) -> Result<Value> {
        self.token_held.store(false, Ordering::SeqCst);
        self.call("shutdown", None, None).await
    }

    /// Suspend instrument sampling.
    ///
    /// # Errors
    ///
    /// Transport or server failure.
    pub async fn suspend_broker(&self) -> Result<Value> {
        self.call("suspend", None, None).await
    }

    /// Resume instrument sampling. Uses the longer resume timeout, and
    /// runs schema discovery when it has not completed yet (the broker
    /// may have been suspended since before this client started).
    ///
    /// # Errors
    ///
    /// Transport or server failure.
    pub async fn resume_broker(&self) -> Result<Value> {
        let result = self
            .call("resume", None, Some(self.config.resume_timeout()))
            .await?;
        if !self.initialized() {
            info!(broker = %self.broker_name, "initializing after resume");
            if let Err(e) = self.discover().await {
                warn!(broker = %self.broker_name, "post-resume discovery failed: {e}");
            }
        }
        Ok(result)
    }

    /// Fetch the broker's own status and cache the liveness flags other
    /// components poll (`power_on`, `instr_connected`, `suspended`, ...).
    ///
    /// # Errors
    ///
    /// Transport or server failure; cached flags keep their last values.
    pub async fn broker_status(&self) -> Result<Value> {
        let result = self.call("broker_status", None, None).await?;
        let flag = |key: &str| {
            result
                .get(key)
                .is_some_and(|v| coerce_boolean(v.clone()) == Value::Bool(true))
        };
        let text = |key: &str| {
            result
                .get(key)
                .filter(|v| !v.is_null())
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
        };
        {
            let mut status = self
                .status
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            status.power_on = flag("power_on");
            status.db_connected = flag("db_connected");
            status.instr_connected = flag("instr_connected");
            status.suspended = flag("suspended");
            status.last_db_time = text("last_db_time");
            status.last_data_time = text("last_data_time");
            status.start_time = text("start_time");
        }
        Ok(result)
    }

    // ---- internals -------------------------------------------------------

    /// One RPC round-trip plus result normalization.
    async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let timeout = timeout.unwrap_or_else(|| self.config.socket_timeout());
        let result = self.transport.call(method, params, timeout).await?;
        Ok(normalize_result(result)?)
    }

    /// Batched `status` request; updates every requested parameter's cache
    /// from the reply and returns the raw result object.
    async fn status_rpc(
        &self,
        names: &[String],
        verbose: bool,
        timeout: Option<Duration>,
    ) -> Result<serde_json::Map<String, Value>> {
        let style = if verbose { "verbose" } else { "terse" };
        let result = self
            .call("status", Some(json!({"data": names, "style": style})), timeout)
            .await?;
        let Value::Object(map) = result else {
            return Err(RpcError::transport(format!(
                "status returned a non-object: {result}"
            ))
            .into());
        };

        let (message_time_raw, tz) = match map.get("message_time") {
            Some(Value::Object(timedict)) => (
                timedict
                    .get("value")
                    .and_then(timestamp::packed_string)
                    .unwrap_or_else(timestamp::now_packed),
                timedict
                    .get("units")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            ),
            _ => (timestamp::now_packed(), None),
        };

        let params = self.params_read();
        for name in names {
            let Some(param) = params.get(name) else {
                continue;
            };
            let Some(Value::Object(entry)) = map.get(name) else {
                debug!(broker = %self.broker_name, parameter = %name, "missing from status reply");
                continue;
            };
            let Some(value) = entry.get("value") else {
                continue;
            };
            let value = scrub_minimum(value.clone());
            let units = entry.get("units").and_then(Value::as_str);
            let sample_raw = entry
                .get("sample_time")
                .and_then(timestamp::packed_string)
                .unwrap_or_else(|| message_time_raw.clone());
            param.apply_update(value, units, Some(&sample_raw), tz.as_deref());
        }
        Ok(map)
    }

    fn requester(&self, component: &str) -> String {
        format!("{}.{component}", self.program_name)
    }

    fn lookup(&self, name: &str) -> Result<Arc<Parameter>> {
        self.param(name).ok_or_else(|| BrokerError::UnknownParameter {
            broker: self.broker_name.clone(),
            name: name.to_string(),
        })
    }

    fn require_initialized(&self) -> Result<()> {
        if self.initialized() {
            Ok(())
        } else {
            warn!(broker = %self.broker_name, "broker structure has not been initialized");
            Err(BrokerError::NotInitialized {
                broker: self.broker_name.clone(),
            })
        }
    }

    fn params_read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<Parameter>>> {
        self.params
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn params_write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<Parameter>>> {
        self.params
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Strip the layers the brokers wrap around a useful result: a string
/// `"ok"` and result objects pass through, known Java exception strings
/// become transport-class errors.
fn normalize_result(result: Value) -> std::result::Result<Value, RpcError> {
    if let Value::String(s) = &result {
        if JAVA_FAILURES.contains(&s.as_str()) {
            return Err(RpcError::transport(s.clone()));
        }
    }
    Ok(result)
}

/// Brokers return the double-precision minimum when they have no real
/// value; map it to null.
fn scrub_minimum(value: Value) -> Value {
    if let Some(v) = value.as_f64() {
        if v > 0.0 && v <= MINIMUM_VALUE {
            return Value::Null;
        }
    }
    value
}
