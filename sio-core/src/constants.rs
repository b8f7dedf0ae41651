//! Protocol and client-wide constants.

/// Client version.
pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Path of the v1 protocol under the server base URI.
pub const PROTOCOL_PATH: &str = "/socket.io/1/";

/// The only persistent transport this client speaks.
pub const PERSISTENT_TRANSPORT: &str = "websocket";

/// Endpoint name of the default (root) namespace.
pub const ROOT_ENDPOINT: &str = "";

/// Heartbeat frame: type 2, no id, no endpoint, no payload.
pub const HEARTBEAT_FRAME: &str = "2::";

/// Default HTTP user agent for the handshake request.
pub fn user_agent() -> String {
    format!("sio-client/{CLIENT_VERSION}")
}
