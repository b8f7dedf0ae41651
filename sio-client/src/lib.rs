//! sio-client - socket.io v0.9 client engine.
//!
//! This crate provides the protocol engine behind a socket.io connection:
//! - Handshake negotiation and session parameters
//! - One persistent stream multiplexing many endpoints (namespaces)
//! - Heartbeats and automatic reconnection with exponential backoff and jitter
//! - Acknowledgement correlation in both directions
//! - A cancellable pending-connect future with optional callback dispatch
//! - HTTP and WebSocket transports, plus an in-memory stream for embedding and tests

pub mod ack;
pub mod client;
pub mod connection;
pub mod events;
pub mod handshake;
pub mod memory;
pub mod packet;
pub mod pending;
pub mod transport;

// Re-export key types
pub use ack::{AckCallback, AckCorrelator};
pub use client::EndpointClient;
pub use connection::{reconnect_delay, Acknowledger, TransportConnection};
pub use events::ConnectionState;
pub use handshake::{connect, Negotiator, Session, SocketIoRequest};
pub use memory::{MemoryConnector, MemoryListener, MemoryPeer};
pub use packet::{EventPayload, Packet, PacketType};
pub use pending::{ChannelDispatcher, DispatchQueue, Dispatcher, PendingConnect};
pub use transport::{
    FrameSink, FrameSource, FrameStream, HttpTransport, ReqwestTransport, StreamConnector,
    WebSocketConnector,
};

pub use sio_core::{ClientConfig, SioError, SioResult};
