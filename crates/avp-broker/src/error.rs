use avp_rpc::RpcError;
use thiserror::Error;

/// Errors surfaced by the device client.
///
/// Transport, protocol and contention failures all arrive as [`Rpc`]
/// values carrying the wire `{code, message}` pair, so call sites can
/// match on codes uniformly (code 0 marks a client-side transport
/// failure). The remaining variants are application errors detected
/// locally, before any RPC is sent.
///
/// [`Rpc`]: BrokerError::Rpc
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("{0}")]
    Rpc(#[from] RpcError),

    #[error("{broker} has no parameter '{name}'")]
    UnknownParameter { broker: String, name: String },

    #[error("{broker}.{name} is not readable")]
    NotReadable { broker: String, name: String },

    #[error("{broker}.{name} is not writable")]
    NotWritable { broker: String, name: String },

    #[error("{broker} broker structure has not been initialized")]
    NotInitialized { broker: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BrokerError {
    /// Wire error code, if this wraps an RPC failure.
    #[must_use]
    pub fn code(&self) -> Option<i32> {
        match self {
            BrokerError::Rpc(e) => Some(e.code),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;

#[cfg(test)]
mod tests {
    use super::*;
    use avp_rpc::TOKEN_HELD;

    #[test]
    fn test_rpc_error_keeps_code() {
        let err: BrokerError = RpcError::new(TOKEN_HELD, "token held").into();
        assert_eq!(err.code(), Some(-31929));
        assert!(err.to_string().contains("token held"));
    }

    #[test]
    fn test_local_errors_have_no_code() {
        let err = BrokerError::UnknownParameter {
            broker: "sonde".to_string(),
            name: "bogus".to_string(),
        };
        assert_eq!(err.code(), None);
        assert!(err.to_string().contains("bogus"));
        assert!(err.to_string().contains("sonde"));
    }

    #[test]
    fn test_not_readable_display() {
        let err = BrokerError::NotReadable {
            broker: "sonde".to_string(),
            name: "wipe_cmd".to_string(),
        };
        assert_eq!(err.to_string(), "sonde.wipe_cmd is not readable");
    }

    #[test]
    fn test_transport_sentinel_code() {
        let err: BrokerError = RpcError::transport("Not connected to broker.").into();
        assert_eq!(err.code(), Some(0));
    }
}
