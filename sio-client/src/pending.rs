//! Pending-connect future and completion dispatch.
//!
//! A [`PendingConnect`] is a single-assignment cell: the first call to
//! [`PendingConnect::set_complete`] wins and every later one is a no-op, so
//! a negotiation can never report both failure and success. It is also a
//! [`Future`], and it can carry a completion callback that runs either
//! inline or on a caller-supplied [`Dispatcher`].

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::debug;

use sio_core::error::{SioError, SioResult};

use crate::client::EndpointClient;

/// A unit of work handed to a [`Dispatcher`].
pub type Job = Box<dyn FnOnce() + Send>;

/// Callback receiving the outcome of a pending connect.
pub type CompletionCallback<T> = Box<dyn FnOnce(SioResult<T>) + Send>;

/// An execution context that completion callbacks can be posted to.
pub trait Dispatcher: Send + Sync {
    fn dispatch(&self, job: Job);
}

impl<F> Dispatcher for F
where
    F: Fn(Job) + Send + Sync,
{
    fn dispatch(&self, job: Job) {
        self(job)
    }
}

/// Dispatcher that queues jobs for a single consumer loop, e.g. a UI thread.
#[derive(Clone)]
pub struct ChannelDispatcher {
    tx: mpsc::UnboundedSender<Job>,
}

/// The consumer side of a [`ChannelDispatcher`].
pub struct DispatchQueue {
    rx: mpsc::UnboundedReceiver<Job>,
}

impl ChannelDispatcher {
    pub fn new() -> (Self, DispatchQueue) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, DispatchQueue { rx })
    }
}

impl Dispatcher for ChannelDispatcher {
    fn dispatch(&self, job: Job) {
        if self.tx.send(job).is_err() {
            debug!("dispatch queue closed, dropping job");
        }
    }
}

impl DispatchQueue {
    /// Run queued jobs until every dispatcher handle is dropped.
    pub async fn run(mut self) {
        while let Some(job) = self.rx.recv().await {
            job();
        }
    }

    /// Run the jobs queued so far without waiting. Returns how many ran.
    pub fn run_pending(&mut self) -> usize {
        let mut ran = 0;
        while let Ok(job) = self.rx.try_recv() {
            job();
            ran += 1;
        }
        ran
    }

    /// Wait for and run exactly one job.
    pub async fn run_one(&mut self) -> bool {
        match self.rx.recv().await {
            Some(job) => {
                job();
                true
            }
            None => false,
        }
    }
}

struct State<T> {
    outcome: Option<SioResult<T>>,
    cancelled: bool,
    callback: Option<CompletionCallback<T>>,
    wakers: Vec<Waker>,
    parent: Option<AbortHandle>,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    dispatcher: Option<Arc<dyn Dispatcher>>,
}

/// Asynchronous, cancellable result of a negotiation in progress.
pub struct PendingConnect<T = EndpointClient> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for PendingConnect<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> PendingConnect<T> {
    pub fn new(
        dispatcher: Option<Arc<dyn Dispatcher>>,
        callback: Option<CompletionCallback<T>>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    outcome: None,
                    cancelled: false,
                    callback,
                    wakers: Vec::new(),
                    parent: None,
                }),
                dispatcher,
            }),
        }
    }

    /// Attach the in-flight operation that cancelling should abort.
    pub fn set_parent(&self, parent: AbortHandle) {
        let mut state = self.shared.state.lock();
        if state.cancelled {
            parent.abort();
        } else if state.outcome.is_none() {
            state.parent = Some(parent);
        }
    }

    /// Complete with `result`. Returns false if already completed or cancelled.
    pub fn set_complete(&self, result: SioResult<T>) -> bool {
        let (callback, wakers) = {
            let mut state = self.shared.state.lock();
            if state.cancelled || state.outcome.is_some() {
                return false;
            }
            state.outcome = Some(result.clone());
            state.parent = None;
            (state.callback.take(), std::mem::take(&mut state.wakers))
        };

        for waker in wakers {
            waker.wake();
        }

        if let Some(callback) = callback {
            match &self.shared.dispatcher {
                Some(dispatcher) => dispatcher.dispatch(Box::new(move || callback(result))),
                None => callback(result),
            }
        }
        true
    }

    /// Cancel the pending operation.
    ///
    /// The completion callback will never run. Returns false if the result
    /// was already set (cancelling after completion is a no-op).
    pub fn cancel(&self) -> bool {
        let (parent, wakers) = {
            let mut state = self.shared.state.lock();
            if state.outcome.is_some() || state.cancelled {
                return false;
            }
            state.cancelled = true;
            state.callback = None;
            (state.parent.take(), std::mem::take(&mut state.wakers))
        };
        if let Some(parent) = parent {
            parent.abort();
        }
        for waker in wakers {
            waker.wake();
        }
        debug!("pending connect cancelled");
        true
    }

    pub fn is_done(&self) -> bool {
        self.shared.state.lock().outcome.is_some()
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.state.lock().cancelled
    }
}

impl<T: Clone> Future for PendingConnect<T> {
    type Output = SioResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.shared.state.lock();
        if let Some(outcome) = &state.outcome {
            return Poll::Ready(outcome.clone());
        }
        if state.cancelled {
            return Poll::Ready(Err(SioError::Cancelled));
        }
        if !state.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            state.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}
