//! Wire protocol shared by AVP broker clients.
//!
//! Instrument brokers (sonde, winch motor, GPS, wind, sampler, ...) speak a
//! JSON-RPC dialect over newline-delimited TCP: requests carry an integer
//! `id`, replies echo it, and unsolicited subscription updates arrive with
//! no `id` at all.
//!
//! # Architecture
//!
//! - [`protocol`]: message types (Request, Reply, Notification) and error codes
//! - [`codec`]: newline-delimited JSON codec for message framing
//! - [`timestamp`]: the brokers' packed `YYYYMMDDHHMMSSfff` timestamp format
//!
//! # Example
//!
//! ```
//! use avp_rpc::{Message, Request};
//!
//! let req = Request::new("status", 7, Some(serde_json::json!({"data": ["depth_m"]})));
//! let line = serde_json::to_string(&req).unwrap();
//! assert!(line.contains("\"id\":7"));
//!
//! // Inbound objects are classified by the presence of `id`.
//! let msg = Message::parse(r#"{"result":"ok","id":7}"#).unwrap();
//! assert!(msg.is_reply());
//! ```

pub mod codec;
pub mod protocol;
pub mod timestamp;

pub use codec::{CodecError, LineDelimitedCodec};
pub use protocol::{
    Message, Notification, Reply, Request, RpcError, SUSPENDED_UNSUBSCRIBE, TOKEN_HELD,
    TRANSPORT_FAILURE,
};
pub use timestamp::{format_packed, packed_string, parse_packed};
