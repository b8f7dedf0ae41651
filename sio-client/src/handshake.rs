//! Handshake negotiation.
//!
//! One HTTP request to `<base>/socket.io/1/` yields the session parameters;
//! the persistent stream is then opened at `<base>/socket.io/1/websocket/<sid>/`.
//! The caller's connect callback fires only once that stream is up, or once
//! the requested namespace has been joined over it.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use sio_core::config::ClientConfig;
use sio_core::constants::{PERSISTENT_TRANSPORT, PROTOCOL_PATH, ROOT_ENDPOINT};
use sio_core::error::{SioError, SioResult};

use crate::client::EndpointClient;
use crate::connection::TransportConnection;
use crate::pending::{Dispatcher, PendingConnect};
use crate::transport::{HttpTransport, ReqwestTransport, StreamConnector, WebSocketConnector};

/// Session parameters returned by the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub session_id: String,
    /// Client heartbeat period: half the server's heartbeat timeout. 0 = disabled.
    pub heartbeat_interval_ms: u64,
    /// Silence after which the server drops the session. 0 = unknown.
    pub close_timeout_ms: u64,
    pub transports: HashSet<String>,
}

impl Session {
    /// Parse a handshake body `sid:heartbeat:close:transport,transport`.
    pub fn parse(body: &str) -> SioResult<Self> {
        let fields: Vec<&str> = body.trim().splitn(4, ':').collect();
        if fields.len() < 4 {
            return Err(SioError::Protocol(format!("malformed handshake response {body:?}")));
        }
        let session_id = fields[0].trim();
        if session_id.is_empty() {
            return Err(SioError::Protocol("handshake response has no session id".into()));
        }

        let heartbeat_secs = parse_seconds(fields[1], "heartbeat timeout")?;
        // An unreadable close timeout means unknown, not a bad handshake.
        let close_secs = fields[2].trim().parse::<u64>().unwrap_or(0);
        let transports = fields[3]
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect();

        Ok(Self {
            session_id: session_id.to_string(),
            heartbeat_interval_ms: to_millis(heartbeat_secs / 2, "heartbeat timeout")?,
            close_timeout_ms: to_millis(close_secs, "close timeout")?,
            transports,
        })
    }

    pub fn supports(&self, transport: &str) -> bool {
        self.transports.contains(transport)
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        (self.heartbeat_interval_ms > 0).then(|| Duration::from_millis(self.heartbeat_interval_ms))
    }

    pub fn close_timeout(&self) -> Option<Duration> {
        (self.close_timeout_ms > 0).then(|| Duration::from_millis(self.close_timeout_ms))
    }

    fn transport_list(&self) -> String {
        let mut names: Vec<&str> = self.transports.iter().map(String::as_str).collect();
        names.sort_unstable();
        names.join(",")
    }
}

fn parse_seconds(field: &str, what: &str) -> SioResult<u64> {
    let field = field.trim();
    if field.is_empty() {
        return Ok(0);
    }
    field
        .parse()
        .map_err(|_| SioError::Protocol(format!("bad {what} {field:?} in handshake response")))
}

fn to_millis(secs: u64, what: &str) -> SioResult<u64> {
    secs.checked_mul(1000)
        .ok_or_else(|| SioError::Protocol(format!("{what} of {secs}s out of range")))
}

/// Where and how to connect.
#[derive(Clone)]
pub struct SocketIoRequest {
    base: String,
    namespace: Option<String>,
    query: Option<String>,
    dispatcher: Option<Arc<dyn Dispatcher>>,
}

impl SocketIoRequest {
    /// Connect to the server at `address` (scheme optional).
    pub fn new(address: &str) -> Self {
        let mut base = ClientConfig::sanitize_server_address(address);
        if let Some(stripped) = base.strip_suffix(PROTOCOL_PATH.trim_end_matches('/')) {
            base = stripped.to_string();
        }
        Self {
            base,
            namespace: None,
            query: None,
            dispatcher: None,
        }
    }

    /// Join `namespace` once the connection is up and complete with that client.
    pub fn with_namespace(mut self, namespace: &str) -> Self {
        self.namespace = match namespace {
            "" | "/" => None,
            ns => Some(ns.to_string()),
        };
        self
    }

    /// Query string for the handshake and stream URLs. Overrides the configured one.
    pub fn with_query(mut self, query: &str) -> Self {
        self.query = Some(query.trim_start_matches('?').to_string());
        self
    }

    /// Run the completion callback on `dispatcher` instead of inline.
    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn Dispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    fn query<'a>(&'a self, config: &'a ClientConfig) -> Option<&'a str> {
        self.query
            .as_deref()
            .or(config.handshake.query.as_deref())
            .map(|q| q.trim_start_matches('?'))
            .filter(|q| !q.is_empty())
    }

    pub fn handshake_url(&self, config: &ClientConfig) -> String {
        let url = format!("{}{}", self.base, PROTOCOL_PATH);
        with_query(url, self.query(config))
    }

    pub fn stream_url(&self, config: &ClientConfig, session_id: &str) -> String {
        let url = format!(
            "{}{}{}/{}/",
            self.base, PROTOCOL_PATH, PERSISTENT_TRANSPORT, session_id
        );
        with_query(url, self.query(config))
    }
}

fn with_query(url: String, query: Option<&str>) -> String {
    match query {
        Some(query) => format!("{url}?{query}"),
        None => url,
    }
}

/// Performs handshakes and sets up connections.
pub struct Negotiator {
    config: ClientConfig,
    http: Arc<dyn HttpTransport>,
    connector: Arc<dyn StreamConnector>,
}

impl Negotiator {
    /// Negotiator over HTTP and WebSocket.
    pub fn new(config: ClientConfig) -> SioResult<Self> {
        let http = Arc::new(ReqwestTransport::new(&config.handshake)?);
        let connector = Arc::new(WebSocketConnector::new(&config.handshake));
        Self::with_transports(config, http, connector)
    }

    /// Negotiator over caller-supplied transports.
    pub fn with_transports(
        config: ClientConfig,
        http: Arc<dyn HttpTransport>,
        connector: Arc<dyn StreamConnector>,
    ) -> SioResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            http,
            connector,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Start connecting. Await the returned future or poll it for the client.
    pub fn connect(&self, request: SocketIoRequest) -> PendingConnect {
        self.start(request, None)
    }

    /// Start connecting; `callback` receives the outcome exactly once unless
    /// the returned future is cancelled first.
    pub fn connect_with_callback<F>(&self, request: SocketIoRequest, callback: F) -> PendingConnect
    where
        F: FnOnce(SioResult<EndpointClient>) + Send + 'static,
    {
        self.start(request, Some(Box::new(callback)))
    }

    fn start(
        &self,
        request: SocketIoRequest,
        callback: Option<crate::events::ConnectCallback>,
    ) -> PendingConnect {
        let pending = PendingConnect::new(request.dispatcher.clone(), callback);

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => {
                report_error(&pending, SioError::Internal(format!("no async runtime: {e}")));
                return pending;
            }
        };

        let task = runtime.spawn(negotiate(
            self.config.clone(),
            self.http.clone(),
            self.connector.clone(),
            request,
            pending.clone(),
        ));
        pending.set_parent(task.abort_handle());
        pending
    }
}

/// Connect to `address` using the user's config file, or the defaults when
/// there is none (see [`ClientConfig::default_config_path`]).
pub async fn connect(address: &str) -> SioResult<EndpointClient> {
    Negotiator::new(ClientConfig::load_default()?)?
        .connect(SocketIoRequest::new(address))
        .await
}

async fn negotiate(
    config: ClientConfig,
    http: Arc<dyn HttpTransport>,
    connector: Arc<dyn StreamConnector>,
    request: SocketIoRequest,
    pending: PendingConnect,
) {
    let url = request.handshake_url(&config);
    debug!("handshake: {url}");

    let body = match http.execute(&url).await {
        Ok(body) => body,
        Err(e) => return report_error(&pending, e),
    };
    let session = match Session::parse(&body) {
        Ok(session) => session,
        Err(e) => return report_error(&pending, e),
    };
    if !session.supports(PERSISTENT_TRANSPORT) {
        return report_error(
            &pending,
            SioError::UnsupportedTransport(session.transport_list()),
        );
    }
    if pending.is_cancelled() {
        return;
    }

    info!(
        session = %session.session_id,
        heartbeat_ms = session.heartbeat_interval_ms,
        close_timeout_ms = session.close_timeout_ms,
        "handshake complete"
    );
    let stream_url = request.stream_url(&config, &session.session_id);
    let connection = TransportConnection::new(session, stream_url, config, connector);

    let root = match request.namespace.clone() {
        None => {
            let pending = pending.clone();
            EndpointClient::new(
                connection.clone(),
                ROOT_ENDPOINT,
                Some(Box::new(move |result: SioResult<EndpointClient>| {
                    settle(&pending, result, None)
                })),
            )
        }
        Some(namespace) => {
            let pending = pending.clone();
            EndpointClient::new_anchor(
                connection.clone(),
                ROOT_ENDPOINT,
                Some(Box::new(move |result: SioResult<EndpointClient>| match result {
                    Ok(anchor) => {
                        let keep = anchor.clone();
                        anchor.join_namespace(&namespace, move |joined| {
                            settle(&pending, joined, Some(keep))
                        });
                    }
                    Err(e) => settle(&pending, Err(e), None),
                })),
            )
        }
    };

    if let Err(e) = connection.connect(&root) {
        return report_error(&pending, e);
    }
    connection.reconnect();
}

/// Deliver the final outcome. A client nobody will receive is closed again.
fn settle(pending: &PendingConnect, result: SioResult<EndpointClient>, anchor: Option<EndpointClient>) {
    let client = result.as_ref().ok().cloned();
    let delivered = pending.set_complete(result);
    match client {
        Some(client) if delivered => {
            info!(endpoint = %client.endpoint(), "socket.io connected");
        }
        Some(client) => {
            debug!("connect outcome discarded, closing {:?}", client.endpoint());
            client.disconnect();
            if let Some(anchor) = anchor {
                anchor.disconnect();
            }
        }
        None => {
            if let Some(anchor) = anchor {
                anchor.disconnect();
            }
        }
    }
}

fn report_error(pending: &PendingConnect, error: SioError) {
    warn!("socket.io negotiation failed: {error}");
    pending.set_complete(Err(error));
}
