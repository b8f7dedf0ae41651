//! Transport interfaces consumed by the engine.
//!
//! The handshake needs one HTTP request returning a text body; the session
//! needs an ordered, reliable, bidirectional text-frame stream. Both are
//! traits so the engine can run over any implementation; the defaults use
//! `reqwest` and `tokio-tungstenite`.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use reqwest::Client;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace};

use sio_core::config::HandshakeConfig;
use sio_core::constants;
use sio_core::error::{SioError, SioResult};

/// Executes the handshake request.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Issue the request and return the raw response body.
    async fn execute(&self, url: &str) -> SioResult<String>;
}

/// Opens persistent frame streams.
#[async_trait]
pub trait StreamConnector: Send + Sync {
    async fn open(&self, url: &str) -> SioResult<FrameStream>;
}

/// Outbound half of a frame stream.
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, frame: String) -> SioResult<()>;
    async fn close(&mut self) -> SioResult<()>;
}

/// Inbound half of a frame stream. Yields frames in arrival order and
/// `None` once the peer has closed the stream.
#[async_trait]
pub trait FrameSource: Send {
    async fn next_frame(&mut self) -> Option<SioResult<String>>;
}

/// An open persistent stream, split into its two halves.
pub struct FrameStream {
    pub sink: Box<dyn FrameSink>,
    pub source: Box<dyn FrameSource>,
}

/// Map an `http(s)` URL onto the matching `ws(s)` scheme.
pub fn websocket_url(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        url.to_string()
    }
}

fn header_pairs(config: &HandshakeConfig) -> Vec<(String, String)> {
    let mut headers: Vec<(String, String)> = config
        .custom_headers
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    headers.sort();
    headers
}

// ---- HTTP ----

/// Handshake transport over `reqwest`.
#[derive(Clone)]
pub struct ReqwestTransport {
    inner: Client,
    custom_headers: Vec<(String, String)>,
}

impl ReqwestTransport {
    pub fn new(config: &HandshakeConfig) -> SioResult<Self> {
        let mut builder = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .user_agent(constants::user_agent());

        if config.accept_invalid_certs {
            builder = builder.danger_accept_invalid_certs(true);
        }

        let inner = builder
            .build()
            .map_err(|e| SioError::Handshake(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            inner,
            custom_headers: header_pairs(config),
        })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn execute(&self, url: &str) -> SioResult<String> {
        let mut builder = self.inner.post(url);
        for (key, value) in &self.custom_headers {
            builder = builder.header(key.as_str(), value.as_str());
        }

        debug!("POST {url}");
        let response = builder
            .send()
            .await
            .map_err(|e| SioError::Handshake(format!("request to {url} failed: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| SioError::Handshake(format!("failed to read handshake body: {e}")))?;

        if !status.is_success() {
            return Err(SioError::Handshake(format!(
                "server answered {status}: {}",
                body.trim()
            )));
        }
        Ok(body)
    }
}

// ---- WebSocket ----

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Persistent stream connector over `tokio-tungstenite`.
#[derive(Clone, Default)]
pub struct WebSocketConnector {
    custom_headers: Vec<(String, String)>,
}

impl WebSocketConnector {
    pub fn new(config: &HandshakeConfig) -> Self {
        Self {
            custom_headers: header_pairs(config),
        }
    }
}

#[async_trait]
impl StreamConnector for WebSocketConnector {
    async fn open(&self, url: &str) -> SioResult<FrameStream> {
        let url = websocket_url(url);
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| SioError::Stream(format!("invalid stream url {url}: {e}")))?;
        for (key, value) in &self.custom_headers {
            let name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| SioError::Config(format!("bad header name {key:?}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| SioError::Config(format!("bad header value for {key:?}: {e}")))?;
            request.headers_mut().insert(name, value);
        }

        let (ws, _response) = connect_async(request)
            .await
            .map_err(|e| SioError::Stream(format!("websocket connect to {url}: {e}")))?;
        debug!("websocket open: {url}");

        let (sink, source) = ws.split();
        Ok(FrameStream {
            sink: Box::new(WsSink(sink)),
            source: Box::new(WsSource(source)),
        })
    }
}

struct WsSink(SplitSink<WsStream, Message>);

#[async_trait]
impl FrameSink for WsSink {
    async fn send(&mut self, frame: String) -> SioResult<()> {
        self.0
            .send(Message::Text(frame.into()))
            .await
            .map_err(|e| SioError::Stream(format!("websocket send: {e}")))
    }

    async fn close(&mut self) -> SioResult<()> {
        self.0
            .close()
            .await
            .map_err(|e| SioError::Stream(format!("websocket close: {e}")))
    }
}

struct WsSource(SplitStream<WsStream>);

#[async_trait]
impl FrameSource for WsSource {
    async fn next_frame(&mut self) -> Option<SioResult<String>> {
        loop {
            match self.0.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text.as_str().to_owned())),
                Ok(Message::Close(frame)) => {
                    debug!("websocket closed by peer: {frame:?}");
                    return None;
                }
                Ok(other) => trace!("skipping non-text websocket message ({} bytes)", other.len()),
                Err(e) => return Some(Err(SioError::Stream(format!("websocket receive: {e}")))),
            }
        }
    }
}
