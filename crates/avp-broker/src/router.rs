//! Notification routing: from the transport's FIFO channel into the
//! parameter cache and out to user callbacks.
//!
//! A single consumer task drains the channel in strict arrival order;
//! later notifications for a parameter are never applied before earlier
//! ones. Callbacks run in their own spawned tasks so a slow handler cannot
//! stall the drain. That concurrency is unbounded, exactly like the
//! original thread-per-callback dispatch; bounding it would change
//! observable timing for subscribers.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::NaiveDateTime;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use avp_rpc::{Notification, timestamp};

use crate::param::Parameter;

/// Handler invoked with the sample time and the updated parameter.
pub type Callback = Arc<dyn Fn(Option<NaiveDateTime>, Arc<Parameter>) + Send + Sync>;

/// Shared parameter-name -> entry maps. Registered/removed by the client,
/// read by the router.
pub(crate) type SubscriptionMap = Arc<RwLock<HashMap<String, Arc<Parameter>>>>;
pub(crate) type CallbackMap = Arc<RwLock<HashMap<String, Callback>>>;

pub(crate) struct NotificationRouter {
    broker: String,
    rx: mpsc::UnboundedReceiver<Notification>,
    subscriptions: SubscriptionMap,
    callbacks: CallbackMap,
    /// Set after a per-parameter server error has been logged; cleared by
    /// the next good value so a stuck instrument logs once, not per
    /// update.
    subscription_error: bool,
}

impl NotificationRouter {
    pub(crate) fn spawn(
        broker: &str,
        rx: mpsc::UnboundedReceiver<Notification>,
        subscriptions: SubscriptionMap,
        callbacks: CallbackMap,
    ) -> JoinHandle<()> {
        let router = Self {
            broker: broker.to_string(),
            rx,
            subscriptions,
            callbacks,
            subscription_error: false,
        };
        tokio::spawn(router.run())
    }

    async fn run(mut self) {
        while let Some(notification) = self.rx.recv().await {
            self.process(notification);
        }
        debug!(broker = %self.broker, "notification channel closed, router stopping");
    }

    fn process(&mut self, notification: Notification) {
        if notification.method != "subscription" {
            debug!(
                broker = %self.broker,
                method = %notification.method,
                "ignoring non-subscription notification"
            );
            return;
        }
        let Some(Value::Object(mut params)) = notification.params else {
            debug!(broker = %self.broker, "subscription notification without params");
            return;
        };

        // message_time is shared by every parameter in the message and is
        // itself a subscribable pseudo-parameter.
        let (message_time_raw, tz) = match params.remove("message_time") {
            Some(Value::Object(timedict)) => {
                let raw = timedict
                    .get("value")
                    .and_then(timestamp::packed_string)
                    .unwrap_or_else(timestamp::now_packed);
                let tz = timedict
                    .get("units")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                (raw, tz)
            }
            _ => (timestamp::now_packed(), None),
        };

        for (key, entry) in params {
            let param = self
                .subscriptions
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .get(&key)
                .cloned();
            let Some(param) = param else {
                // Expected race: updates still in flight after an
                // unsubscribe.
                debug!(
                    broker = %self.broker,
                    parameter = %key,
                    "notification for parameter not in subscription registry"
                );
                continue;
            };
            let Value::Object(entry) = entry else {
                debug!(broker = %self.broker, parameter = %key, "malformed entry");
                continue;
            };

            if let Some(value) = entry.get("value") {
                self.subscription_error = false;
                let sample_raw = entry
                    .get("sample_time")
                    .and_then(timestamp::packed_string)
                    .unwrap_or_else(|| message_time_raw.clone());
                param.apply_update(value.clone(), None, Some(&sample_raw), tz.as_deref());
                self.dispatch_callback(&key, &param);
            } else if let Some(message) = entry.get("message") {
                if !self.subscription_error {
                    error!(
                        broker = %self.broker,
                        parameter = %key,
                        code = ?entry.get("code"),
                        "server-side parameter error: {message}"
                    );
                }
                self.subscription_error = true;
            } else {
                if !self.subscription_error {
                    debug!(broker = %self.broker, parameter = %key, "entry has no value");
                }
                self.subscription_error = true;
            }
        }

        let message_time_param = self
            .subscriptions
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get("message_time")
            .cloned();
        if let Some(param) = message_time_param {
            param.apply_update(
                Value::String(message_time_raw.clone()),
                None,
                Some(&message_time_raw),
                tz.as_deref(),
            );
        }
    }

    fn dispatch_callback(&self, key: &str, param: &Arc<Parameter>) {
        let callback = self
            .callbacks
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(key)
            .cloned();
        if let Some(callback) = callback {
            let param = Arc::clone(param);
            let sample_time = param.sample_time();
            tokio::spawn(async move {
                callback(sample_time, param);
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param::AccessClass;
    use serde_json::json;
    use std::time::Duration;

    fn registries(names: &[(&str, &str)]) -> (SubscriptionMap, CallbackMap) {
        let mut map = HashMap::new();
        for (name, units) in names {
            let param = Arc::new(Parameter::new(
                "sonde",
                *name,
                AccessClass::ReadOnly,
                Some((*units).to_string()),
                Duration::from_secs(10),
            ));
            param.set_subscribed(true);
            map.insert((*name).to_string(), param);
        }
        (
            Arc::new(RwLock::new(map)),
            Arc::new(RwLock::new(HashMap::new())),
        )
    }

    fn subscription(entries: Value) -> Notification {
        Notification::new("subscription", Some(entries))
    }

    async fn drain(
        subscriptions: &SubscriptionMap,
        callbacks: &CallbackMap,
        notifications: Vec<Notification>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = NotificationRouter::spawn(
            "sonde",
            rx,
            Arc::clone(subscriptions),
            Arc::clone(callbacks),
        );
        for n in notifications {
            tx.send(n).unwrap();
        }
        drop(tx);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_fifo_later_value_wins() {
        let (subs, cbs) = registries(&[("depth_m", "m")]);
        let n1 = subscription(json!({
            "message_time": {"value": "20260829120000000"},
            "depth_m": {"value": 1.0}
        }));
        let n2 = subscription(json!({
            "message_time": {"value": "20260829120001000"},
            "depth_m": {"value": 2.0}
        }));
        drain(&subs, &cbs, vec![n1, n2]).await;

        let param = subs.read().unwrap().get("depth_m").cloned().unwrap();
        assert_eq!(param.mem_value().unwrap(), json!(2.0));
        assert_eq!(param.sample_time_raw().unwrap(), "20260829120001000");
    }

    #[tokio::test]
    async fn test_boolean_unit_coerced_from_notification() {
        let (subs, cbs) = registries(&[("pumping", "boolean")]);
        let n = subscription(json!({
            "message_time": {"value": "20260829120000000"},
            "pumping": {"value": "true"}
        }));
        drain(&subs, &cbs, vec![n]).await;

        let param = subs.read().unwrap().get("pumping").cloned().unwrap();
        assert_eq!(param.mem_value().unwrap(), json!(true));
    }

    #[tokio::test]
    async fn test_unknown_key_ignored() {
        let (subs, cbs) = registries(&[("depth_m", "m")]);
        let n = subscription(json!({
            "message_time": {"value": "20260829120000000"},
            "not_subscribed": {"value": 9.9},
            "depth_m": {"value": 3.5}
        }));
        drain(&subs, &cbs, vec![n]).await;

        let param = subs.read().unwrap().get("depth_m").cloned().unwrap();
        assert_eq!(param.mem_value().unwrap(), json!(3.5));
        assert!(subs.read().unwrap().get("not_subscribed").is_none());
    }

    #[tokio::test]
    async fn test_per_parameter_sample_time_preferred() {
        let (subs, cbs) = registries(&[("depth_m", "m")]);
        let n = subscription(json!({
            "message_time": {"value": "20260829120000000"},
            "depth_m": {"value": 1.2, "sample_time": "20260829115959500"}
        }));
        drain(&subs, &cbs, vec![n]).await;

        let param = subs.read().unwrap().get("depth_m").cloned().unwrap();
        assert_eq!(param.sample_time_raw().unwrap(), "20260829115959500");
    }

    #[tokio::test]
    async fn test_callback_dispatched_with_sample_time() {
        let (subs, cbs) = registries(&[("depth_m", "m")]);
        let (cb_tx, mut cb_rx) = mpsc::unbounded_channel();
        cbs.write().unwrap().insert(
            "depth_m".to_string(),
            Arc::new(move |sample_time, param: Arc<Parameter>| {
                let _ = cb_tx.send((sample_time, param.mem_value()));
            }),
        );

        let n = subscription(json!({
            "message_time": {"value": "20260829120000000"},
            "depth_m": {"value": 4.2}
        }));
        drain(&subs, &cbs, vec![n]).await;

        let (sample_time, value) = tokio::time::timeout(Duration::from_secs(2), cb_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(sample_time.is_some());
        assert_eq!(value.unwrap(), json!(4.2));
    }

    #[tokio::test]
    async fn test_message_time_pseudo_parameter_updated() {
        let (subs, cbs) = registries(&[("depth_m", "m"), ("message_time", "EST")]);
        let n = subscription(json!({
            "message_time": {"value": "20260829120000000", "units": "America/New_York"},
            "depth_m": {"value": 1.0}
        }));
        drain(&subs, &cbs, vec![n]).await;

        let param = subs.read().unwrap().get("message_time").cloned().unwrap();
        assert_eq!(param.mem_value().unwrap(), json!("20260829120000000"));
        assert_eq!(param.tz().unwrap(), "America/New_York");
    }

    #[tokio::test]
    async fn test_server_error_entry_does_not_clobber_value() {
        let (subs, cbs) = registries(&[("depth_m", "m")]);
        let good = subscription(json!({
            "message_time": {"value": "20260829120000000"},
            "depth_m": {"value": 5.0}
        }));
        let bad = subscription(json!({
            "message_time": {"value": "20260829120001000"},
            "depth_m": {"message": "sensor fault", "code": -31900}
        }));
        drain(&subs, &cbs, vec![good, bad]).await;

        let param = subs.read().unwrap().get("depth_m").cloned().unwrap();
        assert_eq!(param.mem_value().unwrap(), json!(5.0));
    }
}
