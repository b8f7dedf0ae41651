//! Transport connection: one persistent stream shared by many endpoints.
//!
//! Owns the stream for a negotiated session and:
//! - serializes outgoing frames from every endpoint through a single writer task
//! - routes inbound frames, in arrival order, to the endpoint they address
//! - sends heartbeats and watches for a silent stream
//! - reconnects with exponential backoff and jitter, re-joining endpoints
//! - fails pending acknowledgements when the stream they were written to is lost

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, trace, warn};

use sio_core::config::{ClientConfig, ReconnectConfig};
use sio_core::constants::ROOT_ENDPOINT;
use sio_core::error::{SioError, SioResult};

use crate::ack::{AckCallback, AckCorrelator};
use crate::client::EndpointClient;
use crate::events::ConnectionState;
use crate::handshake::Session;
use crate::packet::{parse_ack_data, Packet, PacketType};
use crate::transport::{FrameSink, FrameSource, FrameStream, StreamConnector};

/// The live stream, if any. `generation` increases with every successful open
/// so tasks belonging to an older stream can recognize themselves as stale.
struct Link {
    generation: u64,
    writer: Option<mpsc::UnboundedSender<String>>,
    tasks: Vec<JoinHandle<()>>,
}

struct Inner {
    session: Session,
    stream_url: String,
    config: ClientConfig,
    connector: Arc<dyn StreamConnector>,
    registry: Mutex<HashMap<String, EndpointClient>>,
    acks: Arc<AckCorrelator>,
    link: Mutex<Link>,
    connected: AtomicBool,
    reconnecting: AtomicBool,
    /// Set once the connection is torn down or has given up; never cleared.
    closed: AtomicBool,
    state_tx: watch::Sender<ConnectionState>,
    shutdown: Notify,
}

/// Shared handle to the transport connection of one session.
#[derive(Clone)]
pub struct TransportConnection {
    inner: Arc<Inner>,
}

impl TransportConnection {
    pub(crate) fn new(
        session: Session,
        stream_url: String,
        config: ClientConfig,
        connector: Arc<dyn StreamConnector>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                session,
                stream_url,
                config,
                connector,
                registry: Mutex::new(HashMap::new()),
                acks: Arc::new(AckCorrelator::new()),
                link: Mutex::new(Link {
                    generation: 0,
                    writer: None,
                    tasks: Vec::new(),
                }),
                connected: AtomicBool::new(false),
                reconnecting: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                state_tx,
                shutdown: Notify::new(),
            }),
        }
    }

    pub fn session(&self) -> &Session {
        &self.inner.session
    }

    pub fn stream_url(&self) -> &str {
        &self.inner.stream_url
    }

    /// Whether the persistent stream is currently open.
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst) && !self.inner.closed.load(Ordering::SeqCst)
    }

    /// Whether the connection was torn down or gave up reconnecting.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    /// Subscribe to connection state changes.
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Names of the registered endpoints, sorted.
    pub fn endpoints(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.registry.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of acknowledgements still outstanding.
    pub fn pending_acks(&self) -> usize {
        self.inner.acks.pending_count()
    }

    fn set_state(&self, new_state: ConnectionState) {
        self.inner.state_tx.send_if_modified(|state| {
            if *state == new_state {
                return false;
            }
            info!("connection state: {} -> {}", *state, new_state);
            *state = new_state;
            true
        });
    }

    fn lookup(&self, endpoint: &str) -> Option<EndpointClient> {
        self.inner.registry.lock().get(endpoint).cloned()
    }

    // ---- Outgoing ----

    /// Frame and send a packet on behalf of `endpoint`.
    ///
    /// With `ack`, the packet carries a fresh message id and the callback is
    /// parked until the matching ack frame arrives. If the frame cannot be
    /// written, the call fails and so does the acknowledgement, immediately.
    pub fn emit_raw(
        &self,
        kind: PacketType,
        endpoint: &str,
        payload: String,
        ack: Option<AckCallback>,
    ) -> SioResult<()> {
        let mut packet = Packet::new(kind, endpoint, payload);
        let ack_id = ack.map(|callback| self.inner.acks.register_next(callback));
        if let Some(id) = ack_id {
            packet = packet.with_ack_id(id);
        }

        match self.send_frame(packet.encode()) {
            Ok(()) => {
                if let Some(id) = ack_id {
                    self.arm_ack_timeout(id);
                }
                Ok(())
            }
            Err(error) => {
                if let Some(id) = ack_id {
                    self.inner.acks.fail(id, error.clone());
                }
                Err(error)
            }
        }
    }

    /// Queue a raw frame on the live stream.
    pub(crate) fn send_frame(&self, frame: String) -> SioResult<()> {
        let link = self.inner.link.lock();
        let writer = link.writer.as_ref().ok_or(SioError::NotConnected)?;
        writer
            .send(frame)
            .map_err(|_| SioError::Stream("writer closed".into()))
    }

    /// Queue a frame only if `generation` is still the live stream.
    fn send_on(&self, generation: u64, frame: String) -> SioResult<()> {
        let link = self.inner.link.lock();
        if link.generation != generation {
            return Err(SioError::NotConnected);
        }
        let writer = link.writer.as_ref().ok_or(SioError::NotConnected)?;
        writer
            .send(frame)
            .map_err(|_| SioError::Stream("writer closed".into()))
    }

    fn arm_ack_timeout(&self, id: u64) {
        let Some(limit) = self.inner.config.acknowledgement.timeout() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let acks = self.inner.acks.clone();
                handle.spawn(async move {
                    sleep(limit).await;
                    if acks.fail(id, SioError::AckTimeout(id)) {
                        debug!("acknowledgement {id} timed out after {limit:?}");
                    }
                });
            }
            Err(_) => debug!("no runtime available, acknowledgement {id} has no timeout"),
        }
    }

    // ---- Endpoint registry ----

    /// Register an endpoint client and join its namespace.
    ///
    /// Non-root endpoints send a connect frame over the shared stream and
    /// become usable once the server answers with its own connect frame. If
    /// the stream is down, the join is sent on the next reconnect.
    pub fn connect(&self, client: &EndpointClient) -> SioResult<()> {
        let endpoint = client.endpoint().to_string();
        if self.is_closed() {
            return Err(SioError::NotConnected);
        }
        {
            let mut registry = self.inner.registry.lock();
            if registry.contains_key(&endpoint) {
                return Err(SioError::DuplicateEndpoint(endpoint));
            }
            registry.insert(endpoint.clone(), client.clone());
        }

        if endpoint == ROOT_ENDPOINT {
            // The root endpoint is connected by the stream opening itself.
            if self.is_connected() {
                let generation = self.inner.link.lock().generation;
                client.handle_connect(generation);
            }
            return Ok(());
        }

        debug!("joining endpoint {endpoint:?}");
        if self.is_connected() {
            if let Err(e) = self.send_frame(Packet::connect(&endpoint).encode()) {
                debug!("join for {endpoint:?} deferred to next reconnect: {e}");
            }
        }
        Ok(())
    }

    /// Remove an endpoint client and leave its namespace.
    ///
    /// Returns false if the client was not registered. When no user-held
    /// client remains, the stream is torn down and not reopened.
    pub fn disconnect(&self, client: &EndpointClient) -> bool {
        let endpoint = client.endpoint().to_string();
        let (removed, others_remain, explicit_remain) = {
            let mut registry = self.inner.registry.lock();
            let removed = match registry.get(&endpoint) {
                Some(registered) if registered.same_as(client) => {
                    registry.remove(&endpoint);
                    true
                }
                _ => false,
            };
            (
                removed,
                !registry.is_empty(),
                registry.values().any(|c| !c.is_anchor()),
            )
        };
        client.mark_disconnected();
        if !removed {
            return false;
        }

        // Leaving the root namespace closes the whole socket server-side.
        let root_with_others = endpoint == ROOT_ENDPOINT && others_remain;
        if self.is_connected() && !root_with_others {
            if let Err(e) = self.send_frame(Packet::disconnect(&endpoint).encode()) {
                debug!("disconnect frame for {endpoint:?} not sent: {e}");
            }
        }
        info!("endpoint {endpoint:?} disconnected");

        if !explicit_remain {
            self.teardown();
        }
        true
    }

    /// Drop an endpoint on the server's request.
    fn evict(&self, endpoint: &str) -> Option<EndpointClient> {
        let (client, explicit_remain) = {
            let mut registry = self.inner.registry.lock();
            let client = registry.remove(endpoint);
            (client, registry.values().any(|c| !c.is_anchor()))
        };
        if client.is_some() && !explicit_remain {
            self.teardown();
        }
        client
    }

    // ---- Stream lifecycle ----

    /// (Re)establish the persistent stream in the background.
    ///
    /// No-op while the stream is open, while an attempt is already running,
    /// or after the connection was closed.
    pub fn reconnect(&self) {
        if self.is_closed() {
            debug!("reconnect skipped: connection closed");
            return;
        }
        if self.is_connected() {
            debug!("reconnect skipped: stream already open");
            return;
        }
        if self.inner.reconnecting.swap(true, Ordering::SeqCst) {
            debug!("reconnect already in progress");
            return;
        }
        let this = self.clone();
        tokio::spawn(async move { this.reconnect_loop().await });
    }

    async fn reconnect_loop(&self) {
        if self.state() == ConnectionState::Disconnected {
            self.set_state(ConnectionState::Connecting);
        } else {
            self.set_state(ConnectionState::Reconnecting);
        }

        let policy = &self.inner.config.reconnect;
        let mut retries = 0u32;
        loop {
            if self.is_closed() {
                self.inner.reconnecting.store(false, Ordering::SeqCst);
                return;
            }

            match self.inner.connector.open(&self.inner.stream_url).await {
                Ok(stream) => {
                    self.inner.reconnecting.store(false, Ordering::SeqCst);
                    if self.is_closed() {
                        debug!("stream opened after close, discarding");
                        return;
                    }
                    if retries > 0 {
                        info!("reconnected successfully after {retries} retr(ies)");
                    }
                    self.attach(stream);
                    return;
                }
                Err(e) => {
                    if !e.is_retryable() || !policy.allows_retry(retries) {
                        error!("giving up on stream after {retries} retr(ies): {e}");
                        self.inner.reconnecting.store(false, Ordering::SeqCst);
                        self.fail_terminally(e);
                        return;
                    }

                    let delay = reconnect_delay(policy, retries);
                    retries += 1;
                    warn!(
                        "stream open failed ({e}), retry {retries} in {:.1}s",
                        delay.as_secs_f64()
                    );

                    tokio::select! {
                        _ = sleep(delay) => {},
                        _ = self.inner.shutdown.notified() => {
                            info!("reconnection cancelled by disconnect");
                            self.inner.reconnecting.store(false, Ordering::SeqCst);
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Install a freshly opened stream.
    fn attach(&self, stream: FrameStream) {
        let FrameStream { sink, source } = stream;
        let (tx, rx) = mpsc::unbounded_channel();
        let (generation, stale) = {
            let mut link = self.inner.link.lock();
            link.generation += 1;
            link.writer = Some(tx);
            (link.generation, std::mem::take(&mut link.tasks))
        };
        for task in stale {
            task.abort();
        }
        tokio::spawn(write_loop(self.clone(), generation, sink, rx));

        self.inner.connected.store(true, Ordering::SeqCst);
        self.set_state(ConnectionState::Connected);
        if self.is_closed() {
            // Torn down while the stream was being installed.
            {
                let mut link = self.inner.link.lock();
                if link.generation == generation {
                    link.writer = None;
                }
            }
            self.inner.connected.store(false, Ordering::SeqCst);
            self.set_state(ConnectionState::Disconnected);
            debug!("stream closed during attach");
            return;
        }
        info!(
            session = %self.inner.session.session_id,
            generation,
            "stream open"
        );

        // Collected before the root callback runs: joins issued from inside
        // it already send their own connect frame.
        let rejoin: Vec<String> = self
            .inner
            .registry
            .lock()
            .keys()
            .filter(|name| name.as_str() != ROOT_ENDPOINT)
            .cloned()
            .collect();

        // The root endpoint is connected before any inbound frame is routed.
        self.report_connect(ROOT_ENDPOINT, generation);
        for endpoint in rejoin {
            debug!("re-joining endpoint {endpoint:?}");
            if let Err(e) = self.send_on(generation, Packet::connect(&endpoint).encode()) {
                debug!("re-join of {endpoint:?} not sent: {e}");
            }
        }

        // Without heartbeats an idle session is silent, so silence proves nothing.
        let watchdog = match self.inner.session.heartbeat_interval() {
            Some(_) if self.inner.config.heartbeat.watchdog => self.inner.session.close_timeout(),
            _ => None,
        };
        let mut tasks = vec![tokio::spawn(read_loop(
            self.clone(),
            generation,
            source,
            watchdog,
        ))];
        if self.inner.config.heartbeat.enabled {
            if let Some(period) = self.inner.session.heartbeat_interval() {
                tasks.push(tokio::spawn(heartbeat_loop(self.clone(), generation, period)));
            }
        }

        let mut link = self.inner.link.lock();
        if link.generation == generation && link.writer.is_some() {
            link.tasks.extend(tasks);
        } else {
            for task in tasks {
                task.abort();
            }
        }
    }

    /// Whether `generation` is still the live stream.
    fn is_live(&self, generation: u64) -> bool {
        let link = self.inner.link.lock();
        link.generation == generation && link.writer.is_some()
    }

    /// Handle the loss of stream `generation`: fail its pending
    /// acknowledgements and start reconnecting.
    fn on_stream_lost(&self, generation: u64, error: SioError) {
        let tasks = {
            let mut link = self.inner.link.lock();
            if link.generation != generation || link.writer.is_none() {
                return;
            }
            link.writer = None;
            std::mem::take(&mut link.tasks)
        };
        self.inner.connected.store(false, Ordering::SeqCst);
        for task in tasks {
            task.abort();
        }

        if self.is_closed() {
            return;
        }
        warn!("stream lost: {error}");
        self.inner.acks.fail_all(SioError::AckAbandoned);

        if self.inner.registry.lock().is_empty() {
            self.teardown();
            return;
        }
        self.set_state(ConnectionState::Reconnecting);
        self.reconnect();
    }

    /// Give up: every registered endpoint learns the connection is gone.
    fn fail_terminally(&self, error: SioError) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.connected.store(false, Ordering::SeqCst);
        self.set_state(ConnectionState::Failed);
        self.inner.acks.fail_all(SioError::AckAbandoned);

        let clients: Vec<EndpointClient> = self
            .inner
            .registry
            .lock()
            .drain()
            .map(|(_, client)| client)
            .collect();
        for client in clients {
            client.handle_terminal_failure(&error);
        }
    }

    /// Close the stream for good after the last endpoint left.
    fn teardown(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let anchors: Vec<EndpointClient> = self
            .inner
            .registry
            .lock()
            .drain()
            .map(|(_, client)| client)
            .collect();
        for anchor in anchors {
            anchor.mark_disconnected();
        }

        // Dropping the writer lets it flush queued frames and close the sink.
        let tasks = {
            let mut link = self.inner.link.lock();
            link.writer = None;
            std::mem::take(&mut link.tasks)
        };
        for task in tasks {
            task.abort();
        }
        self.inner.connected.store(false, Ordering::SeqCst);
        self.inner.shutdown.notify_waiters();
        self.inner.acks.fail_all(SioError::AckAbandoned);
        self.set_state(ConnectionState::Disconnected);
        info!(session = %self.inner.session.session_id, "transport connection closed");
    }

    // ---- Inbound routing ----

    fn report_connect(&self, endpoint: &str, generation: u64) {
        match self.lookup(endpoint) {
            Some(client) => client.handle_connect(generation),
            None => debug!("connect for unregistered endpoint {endpoint:?} dropped"),
        }
    }

    /// Route one inbound frame. Runs on the reader task, one frame at a time.
    fn route(&self, generation: u64, frame: &str) {
        trace!("recv {frame}");
        let packet = match Packet::decode(frame) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("dropping malformed frame: {e}");
                return;
            }
        };

        match packet.kind {
            PacketType::Heartbeat => trace!("heartbeat received"),
            PacketType::Noop => {}
            PacketType::Connect => self.report_connect(&packet.endpoint, generation),
            PacketType::Disconnect => self.handle_remote_disconnect(&packet.endpoint),
            PacketType::Ack => match parse_ack_data(&packet.data) {
                Some((id, args)) => {
                    self.inner.acks.resolve(id, args);
                }
                None => debug!("dropping malformed ack {:?}", packet.data),
            },
            PacketType::Error => self.handle_remote_error(&packet.endpoint, &packet.data),
            PacketType::Message | PacketType::Json | PacketType::Event => {
                self.route_payload(packet)
            }
        }
    }

    fn route_payload(&self, packet: Packet) {
        let Some(client) = self.lookup(&packet.endpoint) else {
            debug!(
                "dropping {} frame for unregistered endpoint {:?}",
                packet.kind, packet.endpoint
            );
            return;
        };

        let acknowledger = match packet.id {
            Some(id) if packet.ack_with_data => Some(Acknowledger {
                connection: self.clone(),
                endpoint: packet.endpoint.clone(),
                id,
            }),
            Some(id) => {
                if let Err(e) = self.send_frame(Packet::ack(&packet.endpoint, id, None).encode()) {
                    debug!("automatic ack {id} not sent: {e}");
                }
                None
            }
            None => None,
        };
        client.handle_payload(packet.kind, &packet.data, acknowledger);
    }

    fn handle_remote_disconnect(&self, endpoint: &str) {
        if endpoint == ROOT_ENDPOINT {
            info!("server closed the connection");
            let clients: Vec<EndpointClient> = self
                .inner
                .registry
                .lock()
                .values()
                .cloned()
                .collect();
            for client in clients {
                client.handle_remote_disconnect();
            }
            self.teardown();
            return;
        }
        match self.evict(endpoint) {
            Some(client) => {
                info!("server closed endpoint {endpoint:?}");
                client.handle_remote_disconnect();
            }
            None => debug!("disconnect for unregistered endpoint {endpoint:?} dropped"),
        }
    }

    fn handle_remote_error(&self, endpoint: &str, reason: &str) {
        let Some(client) = self.lookup(endpoint) else {
            debug!("error for unregistered endpoint {endpoint:?} dropped: {reason}");
            return;
        };
        if client.has_joined() {
            client.handle_error(reason);
            return;
        }
        // An error before the join completed is the server refusing it.
        warn!("server refused endpoint {endpoint:?}: {reason}");
        if let Some(client) = self.evict(endpoint) {
            client.handle_join_refused(reason);
        }
    }
}

/// Reconnection delay using exponential backoff with jitter.
///
/// Sequence with the defaults: 1s, 2s, 4s, 8s, 16s, capped at 30s, each
/// with +/- 30% jitter.
pub fn reconnect_delay(policy: &ReconnectConfig, attempt: u32) -> Duration {
    let base = policy.base_delay().as_secs_f64();
    let max = policy.max_delay().as_secs_f64();

    let exponential = (base * 2.0_f64.powi(attempt.min(30) as i32)).min(max);

    let jitter_range = exponential * policy.jitter_factor;
    let jitter = (rand::random::<f64>() * 2.0 - 1.0) * jitter_range;

    Duration::from_secs_f64((exponential + jitter).max(0.0))
}

async fn write_loop(
    connection: TransportConnection,
    generation: u64,
    mut sink: Box<dyn FrameSink>,
    mut rx: mpsc::UnboundedReceiver<String>,
) {
    while let Some(frame) = rx.recv().await {
        trace!("send {frame}");
        if let Err(e) = sink.send(frame).await {
            connection.on_stream_lost(generation, e);
            return;
        }
    }
    if let Err(e) = sink.close().await {
        debug!("stream close: {e}");
    }
}

async fn read_loop(
    connection: TransportConnection,
    generation: u64,
    mut source: Box<dyn FrameSource>,
    watchdog: Option<Duration>,
) {
    loop {
        let next = match watchdog {
            Some(limit) => match timeout(limit, source.next_frame()).await {
                Ok(next) => next,
                Err(_) => {
                    connection.on_stream_lost(
                        generation,
                        SioError::Stream(format!("no frame received for {limit:?}")),
                    );
                    return;
                }
            },
            None => source.next_frame().await,
        };

        match next {
            Some(Ok(frame)) => connection.route(generation, &frame),
            Some(Err(e)) => {
                connection.on_stream_lost(generation, e);
                return;
            }
            None => {
                connection.on_stream_lost(generation, SioError::Stream("stream closed by peer".into()));
                return;
            }
        }

        if !connection.is_live(generation) {
            return;
        }
    }
}

async fn heartbeat_loop(connection: TransportConnection, generation: u64, period: Duration) {
    let Some(first) = Instant::now().checked_add(period) else {
        debug!("heartbeat period {period:?} out of range, not sending heartbeats");
        return;
    };
    let mut ticker = tokio::time::interval_at(first, period);
    loop {
        ticker.tick().await;
        if let Err(e) = connection.send_on(generation, Packet::heartbeat().encode()) {
            connection.on_stream_lost(generation, e);
            return;
        }
        trace!("heartbeat sent");
    }
}

/// Answers an inbound message whose sender asked for data back.
pub struct Acknowledger {
    connection: TransportConnection,
    endpoint: String,
    id: u64,
}

impl Acknowledger {
    /// Id of the message being acknowledged.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Send the acknowledgement with `args`.
    pub fn ack(self, args: Vec<Value>) -> SioResult<()> {
        self.connection
            .send_frame(Packet::ack(&self.endpoint, self.id, Some(&args)).encode())
    }
}

impl std::fmt::Debug for Acknowledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Acknowledger")
            .field("endpoint", &self.endpoint)
            .field("id", &self.id)
            .finish()
    }
}
