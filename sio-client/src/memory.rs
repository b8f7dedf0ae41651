//! In-process stream transport.
//!
//! [`MemoryConnector`] hands every opened stream's server half to a
//! [`MemoryListener`] as a [`MemoryPeer`]. Frames travel over unbounded
//! channels in order. Dropping a peer closes the client's stream.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use sio_core::constants::HEARTBEAT_FRAME;
use sio_core::error::{SioError, SioResult};

use crate::transport::{FrameSink, FrameSource, FrameStream, StreamConnector};

/// Connector whose streams terminate in this process.
pub struct MemoryConnector {
    accept_tx: mpsc::UnboundedSender<MemoryPeer>,
    refuse_next: AtomicU32,
    opened: Mutex<Vec<String>>,
}

/// Receives the server half of every stream opened through a [`MemoryConnector`].
pub struct MemoryListener {
    accept_rx: mpsc::UnboundedReceiver<MemoryPeer>,
}

/// Server half of one in-memory stream.
pub struct MemoryPeer {
    url: String,
    to_client: mpsc::UnboundedSender<SioResult<String>>,
    from_client: mpsc::UnboundedReceiver<String>,
}

impl MemoryConnector {
    pub fn new() -> (Arc<Self>, MemoryListener) {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            accept_tx,
            refuse_next: AtomicU32::new(0),
            opened: Mutex::new(Vec::new()),
        });
        (connector, MemoryListener { accept_rx })
    }

    /// Refuse the next `count` opens with a stream error.
    pub fn refuse_next(&self, count: u32) {
        self.refuse_next.store(count, Ordering::SeqCst);
    }

    /// URLs of every open attempt so far, refused ones included.
    pub fn opened_urls(&self) -> Vec<String> {
        self.opened.lock().clone()
    }
}

#[async_trait]
impl StreamConnector for MemoryConnector {
    async fn open(&self, url: &str) -> SioResult<FrameStream> {
        self.opened.lock().push(url.to_string());

        let refused = self
            .refuse_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(SioError::Stream(format!("connection refused: {url}")));
        }

        let (to_client, client_rx) = mpsc::unbounded_channel();
        let (client_tx, from_client) = mpsc::unbounded_channel();
        let peer = MemoryPeer {
            url: url.to_string(),
            to_client,
            from_client,
        };
        self.accept_tx
            .send(peer)
            .map_err(|_| SioError::Stream("memory listener dropped".into()))?;

        Ok(FrameStream {
            sink: Box::new(MemorySink { tx: client_tx }),
            source: Box::new(MemorySource { rx: client_rx }),
        })
    }
}

impl MemoryListener {
    /// Wait for the next stream to be opened.
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.accept_rx.recv().await
    }

    /// Take an already-opened stream without waiting.
    pub fn try_accept(&mut self) -> Option<MemoryPeer> {
        self.accept_rx.try_recv().ok()
    }
}

impl MemoryPeer {
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Send a frame to the client. Returns false if the client side is gone.
    pub fn send(&self, frame: impl Into<String>) -> bool {
        self.to_client.send(Ok(frame.into())).is_ok()
    }

    /// Make the client's next read fail with `error`.
    pub fn fail(&self, error: SioError) {
        let _ = self.to_client.send(Err(error));
    }

    /// Next frame written by the client; `None` once the client closed its sink.
    pub async fn recv(&mut self) -> Option<String> {
        self.from_client.recv().await
    }

    /// Next frame that is not a heartbeat.
    pub async fn recv_data(&mut self) -> Option<String> {
        loop {
            let frame = self.recv().await?;
            if frame != HEARTBEAT_FRAME {
                return Some(frame);
            }
        }
    }

    /// A frame the client already wrote, if any.
    pub fn try_recv(&mut self) -> Option<String> {
        self.from_client.try_recv().ok()
    }
}

struct MemorySink {
    tx: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, frame: String) -> SioResult<()> {
        self.tx
            .send(frame)
            .map_err(|_| SioError::Stream("peer closed the stream".into()))
    }

    async fn close(&mut self) -> SioResult<()> {
        // Dropping the sender is the close signal; swap in a dead channel.
        let (dead, _) = mpsc::unbounded_channel();
        self.tx = dead;
        Ok(())
    }
}

struct MemorySource {
    rx: mpsc::UnboundedReceiver<SioResult<String>>,
}

#[async_trait]
impl FrameSource for MemorySource {
    async fn next_frame(&mut self) -> Option<SioResult<String>> {
        self.rx.recv().await
    }
}
