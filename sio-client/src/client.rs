//! Endpoint client: the per-namespace handle an application holds.
//!
//! Many endpoint clients share one [`TransportConnection`]. Each keeps its
//! own flags and callback slots; emits are framed with the client's
//! endpoint and handed to the shared connection.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, info};

use sio_core::error::{SioError, SioResult};

use crate::ack::AckCallback;
use crate::connection::{Acknowledger, TransportConnection};
use crate::events::{CallbackSlots, ConnectCallback};
use crate::packet::{EventPayload, PacketType};

struct ClientInner {
    endpoint: String,
    connection: TransportConnection,
    /// Root client kept alive only to carry a namespace requested at connect time.
    anchor: bool,
    /// Set by the first server connect for this endpoint.
    joined: AtomicBool,
    /// Terminal. Never cleared once set.
    disconnected: AtomicBool,
    /// Stream generation of the last connect seen, 0 before the first.
    generation: AtomicU64,
    connect_callback: Mutex<Option<ConnectCallback>>,
    callbacks: Mutex<CallbackSlots>,
}

/// Handle to one endpoint (namespace) of a transport connection.
///
/// Cloning is cheap; all clones refer to the same endpoint.
#[derive(Clone)]
pub struct EndpointClient {
    inner: Arc<ClientInner>,
}

impl EndpointClient {
    pub(crate) fn new(
        connection: TransportConnection,
        endpoint: impl Into<String>,
        on_connect: Option<ConnectCallback>,
    ) -> Self {
        Self::build(connection, endpoint.into(), on_connect, false)
    }

    pub(crate) fn new_anchor(
        connection: TransportConnection,
        endpoint: impl Into<String>,
        on_connect: Option<ConnectCallback>,
    ) -> Self {
        Self::build(connection, endpoint.into(), on_connect, true)
    }

    fn build(
        connection: TransportConnection,
        endpoint: String,
        on_connect: Option<ConnectCallback>,
        anchor: bool,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                endpoint,
                connection,
                anchor,
                joined: AtomicBool::new(false),
                disconnected: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                connect_callback: Mutex::new(on_connect),
                callbacks: Mutex::new(CallbackSlots::default()),
            }),
        }
    }

    /// Endpoint name; empty for the default endpoint.
    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    /// The shared connection this endpoint is multiplexed over.
    pub fn connection(&self) -> &TransportConnection {
        &self.inner.connection
    }

    /// True only while this endpoint is joined, not disconnected, and the
    /// shared connection is up.
    pub fn is_connected(&self) -> bool {
        self.has_joined() && !self.is_disconnected() && self.inner.connection.is_connected()
    }

    pub fn is_disconnected(&self) -> bool {
        self.inner.disconnected.load(Ordering::SeqCst)
    }

    // ---- Emit ----

    /// Send a plain-text message.
    pub fn emit(&self, message: &str) {
        self.send(PacketType::Message, message.to_string(), None);
    }

    /// Send a plain-text message and wait for the server's acknowledgement.
    pub fn emit_with_ack<F>(&self, message: &str, ack: F)
    where
        F: FnOnce(SioResult<Vec<Value>>) + Send + 'static,
    {
        self.send(PacketType::Message, message.to_string(), Some(Box::new(ack)));
    }

    /// Send a JSON message.
    pub fn emit_json(&self, value: &Value) {
        self.send(PacketType::Json, value.to_string(), None);
    }

    pub fn emit_json_with_ack<F>(&self, value: &Value, ack: F)
    where
        F: FnOnce(SioResult<Vec<Value>>) + Send + 'static,
    {
        self.send(PacketType::Json, value.to_string(), Some(Box::new(ack)));
    }

    /// Send a named event.
    ///
    /// `args` should serialize to an array; any other value is sent as the
    /// single argument, and `null` as no arguments. If `args` cannot be
    /// serialized the event is not sent.
    pub fn emit_event<A: Serialize + ?Sized>(&self, name: &str, args: &A) {
        match event_payload(name, args) {
            Ok(payload) => self.send(PacketType::Event, payload, None),
            Err(e) => debug!("event {name:?} on {:?} not sent: {e}", self.inner.endpoint),
        }
    }

    /// Send a named event and wait for the server's acknowledgement.
    ///
    /// A payload that cannot be serialized fails `ack` right away.
    pub fn emit_event_with_ack<A, F>(&self, name: &str, args: &A, ack: F)
    where
        A: Serialize + ?Sized,
        F: FnOnce(SioResult<Vec<Value>>) + Send + 'static,
    {
        match event_payload(name, args) {
            Ok(payload) => self.send(PacketType::Event, payload, Some(Box::new(ack))),
            Err(e) => {
                debug!("event {name:?} on {:?} not sent: {e}", self.inner.endpoint);
                ack(Err(e));
            }
        }
    }

    /// Send a named event and await the acknowledgement arguments.
    pub async fn emit_event_acked<A: Serialize + ?Sized>(
        &self,
        name: &str,
        args: &A,
    ) -> SioResult<Vec<Value>> {
        let (tx, rx) = oneshot::channel();
        self.emit_event_with_ack(name, args, move |result| {
            let _ = tx.send(result);
        });
        rx.await.unwrap_or(Err(SioError::Cancelled))
    }

    fn send(&self, kind: PacketType, payload: String, ack: Option<AckCallback>) {
        if self.is_disconnected() {
            debug!("{kind} on disconnected endpoint {:?} dropped", self.inner.endpoint);
            if let Some(ack) = ack {
                ack(Err(SioError::NotConnected));
            }
            return;
        }
        if let Err(e) = self
            .inner
            .connection
            .emit_raw(kind, &self.inner.endpoint, payload, ack)
        {
            debug!("{kind} on {:?} not sent: {e}", self.inner.endpoint);
        }
    }

    // ---- Lifecycle ----

    /// Leave the endpoint.
    ///
    /// The disconnect callback runs with no error once, whatever state the
    /// shared connection is in. Calling it again does nothing.
    ///
    /// An endpoint the server already closed, or whose connection gave up
    /// reconnecting, has had its disconnect callback invoked at that point;
    /// this call then returns without invoking it a second time.
    pub fn disconnect(&self) {
        if self.inner.disconnected.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.connection.disconnect(self);
        self.inner.connect_callback.lock().take();

        let callback = self.inner.callbacks.lock().disconnect.clone();
        if let Some(callback) = callback {
            callback(None);
        }
    }

    /// Join another namespace over the same connection.
    ///
    /// `callback` receives the new client once the server confirms the join,
    /// or the reason it could not be joined.
    pub fn join_namespace<F>(&self, name: &str, callback: F)
    where
        F: FnOnce(SioResult<EndpointClient>) + Send + 'static,
    {
        if self.is_disconnected() {
            callback(Err(SioError::NotConnected));
            return;
        }
        let client = EndpointClient::new(self.inner.connection.clone(), name, Some(Box::new(callback)));
        if let Err(e) = self.inner.connection.connect(&client) {
            debug!("join of {name:?} rejected: {e}");
            client.mark_disconnected();
            if let Some(callback) = client.take_connect_callback() {
                callback(Err(e));
            }
        }
    }

    /// Join another namespace and await the new client.
    pub async fn join(&self, name: &str) -> SioResult<EndpointClient> {
        let (tx, rx) = oneshot::channel();
        self.join_namespace(name, move |result| {
            let _ = tx.send(result);
        });
        rx.await.unwrap_or(Err(SioError::Cancelled))
    }

    // ---- Callback registration ----

    pub fn set_error_callback<F>(&self, f: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.inner.callbacks.lock().error = Some(Arc::new(f));
    }

    pub fn set_disconnect_callback<F>(&self, f: F)
    where
        F: Fn(Option<&SioError>) + Send + Sync + 'static,
    {
        self.inner.callbacks.lock().disconnect = Some(Arc::new(f));
    }

    pub fn set_reconnect_callback<F>(&self, f: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.callbacks.lock().reconnect = Some(Arc::new(f));
    }

    pub fn set_string_callback<F>(&self, f: F)
    where
        F: Fn(&str, Option<Acknowledger>) + Send + Sync + 'static,
    {
        self.inner.callbacks.lock().string = Some(Arc::new(f));
    }

    pub fn set_json_callback<F>(&self, f: F)
    where
        F: Fn(&Value, Option<Acknowledger>) + Send + Sync + 'static,
    {
        self.inner.callbacks.lock().json = Some(Arc::new(f));
    }

    /// Receives events that have no listener registered with [`Self::on`].
    pub fn set_event_callback<F>(&self, f: F)
    where
        F: Fn(&str, &[Value], Option<Acknowledger>) + Send + Sync + 'static,
    {
        self.inner.callbacks.lock().event = Some(Arc::new(f));
    }

    /// Listen for one named event, replacing any earlier listener for it.
    pub fn on<F>(&self, event: &str, f: F)
    where
        F: Fn(&[Value], Option<Acknowledger>) + Send + Sync + 'static,
    {
        self.inner
            .callbacks
            .lock()
            .named
            .insert(event.to_string(), Arc::new(f));
    }

    /// Remove the listener for `event`. Returns false if there was none.
    pub fn off(&self, event: &str) -> bool {
        self.inner.callbacks.lock().named.remove(event).is_some()
    }

    // ---- Called by the connection ----

    pub(crate) fn is_anchor(&self) -> bool {
        self.inner.anchor
    }

    pub(crate) fn same_as(&self, other: &EndpointClient) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn has_joined(&self) -> bool {
        self.inner.joined.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_disconnected(&self) {
        self.inner.disconnected.store(true, Ordering::SeqCst);
    }

    pub(crate) fn take_connect_callback(&self) -> Option<ConnectCallback> {
        self.inner.connect_callback.lock().take()
    }

    /// The server (or the stream opening, for the root endpoint) confirmed
    /// this endpoint on stream `generation`.
    pub(crate) fn handle_connect(&self, generation: u64) {
        if self.is_disconnected() {
            return;
        }
        let previous = self.inner.generation.swap(generation, Ordering::SeqCst);
        if previous == generation {
            return;
        }

        if previous == 0 {
            self.inner.joined.store(true, Ordering::SeqCst);
            info!("endpoint {:?} connected", self.inner.endpoint);
            if let Some(callback) = self.take_connect_callback() {
                callback(Ok(self.clone()));
            }
        } else {
            info!("endpoint {:?} reconnected", self.inner.endpoint);
            let callback = self.inner.callbacks.lock().reconnect.clone();
            if let Some(callback) = callback {
                callback();
            }
        }
    }

    pub(crate) fn handle_error(&self, reason: &str) {
        if self.is_disconnected() {
            return;
        }
        let callback = self.inner.callbacks.lock().error.clone();
        match callback {
            Some(callback) => callback(reason),
            None => debug!("unhandled error on {:?}: {reason}", self.inner.endpoint),
        }
    }

    /// The server answered the join with an error frame.
    pub(crate) fn handle_join_refused(&self, reason: &str) {
        self.mark_disconnected();
        if let Some(callback) = self.take_connect_callback() {
            callback(Err(SioError::Protocol(format!("join refused: {reason}"))));
        }
    }

    /// The server closed this endpoint. No callback runs twice and nothing
    /// is delivered afterwards.
    pub(crate) fn handle_remote_disconnect(&self) {
        if self.inner.disconnected.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(callback) = self.take_connect_callback() {
            callback(Err(SioError::Protocol(format!(
                "endpoint {:?} closed by server",
                self.inner.endpoint
            ))));
            return;
        }
        let callback = self.inner.callbacks.lock().disconnect.clone();
        if let Some(callback) = callback {
            callback(None);
        }
    }

    /// The connection gave up for good.
    pub(crate) fn handle_terminal_failure(&self, error: &SioError) {
        if self.inner.disconnected.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(callback) = self.take_connect_callback() {
            callback(Err(error.clone()));
            return;
        }
        let callback = self.inner.callbacks.lock().disconnect.clone();
        if let Some(callback) = callback {
            callback(Some(error));
        }
    }

    pub(crate) fn handle_payload(&self, kind: PacketType, data: &str, ack: Option<Acknowledger>) {
        if self.is_disconnected() || !self.has_joined() {
            debug!("{kind} for inactive endpoint {:?} dropped", self.inner.endpoint);
            return;
        }

        match kind {
            PacketType::Message => {
                let callback = self.inner.callbacks.lock().string.clone();
                match callback {
                    Some(callback) => callback(data, ack),
                    None => debug!("no string callback on {:?}", self.inner.endpoint),
                }
            }
            PacketType::Json => {
                let value: Value = match serde_json::from_str(data) {
                    Ok(value) => value,
                    Err(e) => {
                        debug!("dropping malformed json message: {e}");
                        return;
                    }
                };
                let callback = self.inner.callbacks.lock().json.clone();
                match callback {
                    Some(callback) => callback(&value, ack),
                    None => debug!("no json callback on {:?}", self.inner.endpoint),
                }
            }
            PacketType::Event => {
                let Some(event) = EventPayload::parse(data) else {
                    debug!("dropping malformed event {data:?}");
                    return;
                };
                let (named, generic) = {
                    let slots = self.inner.callbacks.lock();
                    (slots.named.get(&event.name).cloned(), slots.event.clone())
                };
                if let Some(listener) = named {
                    listener(&event.args, ack);
                } else if let Some(callback) = generic {
                    callback(&event.name, &event.args, ack);
                } else {
                    debug!("no listener for event {:?} on {:?}", event.name, self.inner.endpoint);
                }
            }
            other => debug!("{other} is not a payload frame"),
        }
    }
}

impl std::fmt::Debug for EndpointClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointClient")
            .field("endpoint", &self.inner.endpoint)
            .field("joined", &self.has_joined())
            .field("disconnected", &self.is_disconnected())
            .finish()
    }
}

fn event_payload<A: Serialize + ?Sized>(name: &str, args: &A) -> SioResult<String> {
    let args = match serde_json::to_value(args)? {
        Value::Array(items) => items,
        Value::Null => Vec::new(),
        single => vec![single],
    };
    let payload = EventPayload {
        name: name.to_string(),
        args,
    };
    Ok(serde_json::to_string(&payload)?)
}
