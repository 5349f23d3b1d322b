//! The broker contract.
//!
//! The kernel never talks to a transport directly: it publishes payloads on
//! named channels and receives what others publish on the channels it
//! subscribed to. Delivery is asynchronous relative to `publish` and assumed
//! to preserve order per channel.

use async_trait::async_trait;
use busrpc_types::RpcError;
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors from the transport layer.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid payload encoding: {0}")]
    Payload(#[from] base64::DecodeError),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: u32, max: u32 },
    #[error("Client fell behind: more than {max} messages queued")]
    Lagged { max: usize },
}

impl From<WireError> for RpcError {
    fn from(e: WireError) -> Self {
        match e {
            WireError::Json(e) => RpcError::Serialization(e.to_string()),
            WireError::Payload(e) => RpcError::Serialization(e.to_string()),
            other => RpcError::Transport(other.to_string()),
        }
    }
}

/// A payload delivered on a subscribed channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    /// The channel it was published on.
    pub channel: String,
    /// Raw payload bytes.
    pub payload: Vec<u8>,
}

/// Receiving end registered with [`Broker::subscribe`].
pub type MessageSink = mpsc::UnboundedSender<BrokerMessage>;

/// One connection to a publish/subscribe broker.
///
/// A connection is the unit of subscription: `unsubscribe` and `close` only
/// affect the channels this connection subscribed to.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Publish `payload` to every subscriber of `channel`.
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), WireError>;

    /// Start delivering messages published on `channels` to `sink`.
    async fn subscribe(&self, channels: &[String], sink: MessageSink) -> Result<(), WireError>;

    /// Stop delivering messages published on `channels`.
    async fn unsubscribe(&self, channels: &[String]) -> Result<(), WireError>;

    /// Release every subscription and tear the connection down.
    async fn close(&self) -> Result<(), WireError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_error_conversion() {
        let err: RpcError = WireError::ConnectionClosed.into();
        assert_eq!(err, RpcError::Transport("Connection closed".to_string()));

        let json_err = serde_json::from_str::<String>("nope").unwrap_err();
        let err: RpcError = WireError::Json(json_err).into();
        assert!(matches!(err, RpcError::Serialization(_)));
    }
}
