//! Shared test utilities for integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use sio_client::{
    EndpointClient, HttpTransport, MemoryConnector, MemoryListener, MemoryPeer, Negotiator,
    SocketIoRequest,
};
use sio_core::config::ClientConfig;
use sio_core::error::{SioError, SioResult};

/// Upper bound for anything a test awaits.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Handshake transport answering every request with a fixed outcome.
pub struct StaticHttp {
    outcome: Option<SioResult<String>>,
    requests: Mutex<Vec<String>>,
}

impl StaticHttp {
    pub fn ok(body: &str) -> Arc<Self> {
        Arc::new(Self {
            outcome: Some(Ok(body.to_string())),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn failing(error: SioError) -> Arc<Self> {
        Arc::new(Self {
            outcome: Some(Err(error)),
            requests: Mutex::new(Vec::new()),
        })
    }

    /// Never answers.
    pub fn hanging() -> Arc<Self> {
        Arc::new(Self {
            outcome: None,
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl HttpTransport for StaticHttp {
    async fn execute(&self, url: &str) -> SioResult<String> {
        self.requests.lock().push(url.to_string());
        match &self.outcome {
            Some(outcome) => outcome.clone(),
            None => std::future::pending().await,
        }
    }
}

/// Configuration with short reconnect delays and no jitter.
pub fn create_test_config() -> ClientConfig {
    let mut config = ClientConfig::default();
    config.reconnect.base_delay_ms = 10;
    config.reconnect.max_delay_ms = 40;
    config.reconnect.max_attempts = 2;
    config.reconnect.jitter_factor = 0.0;
    config
}

/// A server whose handshake answers `body` and whose streams stay in memory.
pub struct TestServer {
    pub http: Arc<StaticHttp>,
    pub connector: Arc<MemoryConnector>,
    pub listener: MemoryListener,
    pub negotiator: Negotiator,
}

impl TestServer {
    pub fn new(body: &str) -> Self {
        Self::with_http(StaticHttp::ok(body), create_test_config())
    }

    pub fn with_http(http: Arc<StaticHttp>, config: ClientConfig) -> Self {
        let (connector, listener) = MemoryConnector::new();
        let negotiator = Negotiator::with_transports(config, http.clone(), connector.clone())
            .expect("test config is valid");
        Self {
            http,
            connector,
            listener,
            negotiator,
        }
    }

    /// Wait for the client to open its next stream.
    pub async fn accept(&mut self) -> MemoryPeer {
        within(self.listener.accept())
            .await
            .expect("listener closed")
    }

    /// Connect to the root endpoint and return the client and the server side.
    pub async fn connect_root(&mut self) -> (EndpointClient, MemoryPeer) {
        let pending = self.negotiator.connect(SocketIoRequest::new("http://test.local"));
        let peer = self.accept().await;
        let client = within(pending).await.expect("root connect failed");
        (client, peer)
    }
}

/// Await `future`, failing the test if it takes longer than [`TEST_TIMEOUT`].
pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(TEST_TIMEOUT, future)
        .await
        .expect("timed out")
}

/// Shared list for recording callback invocations.
pub fn recorder<T>() -> Arc<Mutex<Vec<T>>> {
    Arc::new(Mutex::new(Vec::new()))
}

/// Poll `check` until it holds, yielding to other tasks in between.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    within(async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
}
