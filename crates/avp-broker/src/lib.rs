//! Client library for the platform's instrument brokers.
//!
//! Each physical instrument (sonde, met station, winch, pump, ...) is
//! fronted by a broker process speaking line-delimited JSON-RPC over TCP.
//! [`DeviceClient`] is the one entry point: it connects, discovers the
//! broker's parameter schema, and then offers cached reads, validated
//! writes, push subscriptions, the control-token protocol and the broker
//! lifecycle calls.
//!
//! ```no_run
//! use avp_broker::{BrokerConfig, DeviceClient};
//!
//! # async fn run() -> avp_broker::Result<()> {
//! let config = BrokerConfig::new("avp3", 8001);
//! let sonde = DeviceClient::connect("sonde", config, "sched").await?;
//! let depth = sonde.value("depth_m").await?;
//! println!("depth: {depth}");
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod param;
pub mod router;
pub mod transport;

pub use client::{BrokerStatus, DeviceClient, PowerCommand, SubscribeOptions};
pub use config::{BrokerConfig, load_config};
pub use error::{BrokerError, Result};
pub use param::{AccessClass, Parameter};
pub use router::Callback;
pub use transport::Transport;
