//! Connection state and endpoint callback types.
//!
//! Each endpoint keeps one slot per callback kind. Registering a callback
//! replaces the previous one; there is no fan-out at this layer, so callers
//! that need several subscribers compose them inside a single callback.

use std::sync::Arc;

use serde_json::Value;

use sio_core::error::SioError;

use crate::client::EndpointClient;
use crate::connection::Acknowledger;
use crate::pending::CompletionCallback;

/// Receives the outcome of a connect or namespace join.
pub type ConnectCallback = CompletionCallback<EndpointClient>;

/// Receives the payload of an error frame addressed to the endpoint.
pub type ErrorCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Receives `None` for a clean disconnect, or the error that ended the connection.
pub type DisconnectCallback = Arc<dyn Fn(Option<&SioError>) + Send + Sync>;

/// Fired when the stream is re-established for an endpoint that was connected before.
pub type ReconnectCallback = Arc<dyn Fn() + Send + Sync>;

/// Receives plain-text messages.
pub type StringCallback = Arc<dyn Fn(&str, Option<Acknowledger>) + Send + Sync>;

/// Receives JSON messages.
pub type JsonCallback = Arc<dyn Fn(&Value, Option<Acknowledger>) + Send + Sync>;

/// Receives every event that has no named listener: `(name, args, ack)`.
pub type EventCallback = Arc<dyn Fn(&str, &[Value], Option<Acknowledger>) + Send + Sync>;

/// Receives one named event: `(args, ack)`.
pub type NamedEventCallback = Arc<dyn Fn(&[Value], Option<Acknowledger>) + Send + Sync>;

/// Connection state of a transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected and not trying to connect.
    Disconnected,
    /// Opening the stream for the first time.
    Connecting,
    /// Stream is open and frames are flowing.
    Connected,
    /// Stream was lost, retrying with backoff.
    Reconnecting,
    /// Retries exhausted, will not reconnect.
    Failed,
}

impl ConnectionState {
    /// Whether the state is final for the connection.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Reconnecting => write!(f, "reconnecting"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Single-slot callback storage for one endpoint.
#[derive(Default, Clone)]
pub(crate) struct CallbackSlots {
    pub error: Option<ErrorCallback>,
    pub disconnect: Option<DisconnectCallback>,
    pub reconnect: Option<ReconnectCallback>,
    pub string: Option<StringCallback>,
    pub json: Option<JsonCallback>,
    pub event: Option<EventCallback>,
    pub named: std::collections::HashMap<String, NamedEventCallback>,
}
