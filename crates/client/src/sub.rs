//! Subscription handles.
//!
//! A [`Sub`] is the caller-facing side of a subscription: it drains the
//! event queue, tracks the ready state, and can update or cancel the
//! underlying request. The socket keeps a matching [`SubEntry`] in its
//! table; both sides share one [`SubShared`] cell.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use nostr_sync_core::{Event, Filter};
use tokio::sync::{Mutex, mpsc};

use crate::error::Result;
use crate::socket::Socket;

/// Lifecycle of a subscription.
///
/// `Cancelled` is terminal: a cancelled subscription never becomes pending
/// or ready again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubState {
    /// Waiting for the end-of-stored-events marker.
    Pending,
    /// Stored events are drained; the stream is now live.
    Ready,
    /// Torn down, by either side.
    Cancelled,
}

/// State shared between a [`Sub`] handle and the socket's table entry.
#[derive(Debug)]
pub(crate) struct SubShared {
    filter: StdMutex<Filter>,
    state: StdMutex<SubState>,
    remote_cancel: AtomicBool,
}

impl SubShared {
    pub(crate) fn new(filter: Filter) -> Self {
        Self {
            filter: StdMutex::new(filter),
            state: StdMutex::new(SubState::Pending),
            remote_cancel: AtomicBool::new(false),
        }
    }

    pub(crate) fn filter(&self) -> Filter {
        self.filter.lock().expect("filter lock poisoned").clone()
    }

    pub(crate) fn merge_filter(&self, other: Filter) {
        self.filter.lock().expect("filter lock poisoned").merge(other);
    }

    pub(crate) fn state(&self) -> SubState {
        *self.state.lock().expect("state lock poisoned")
    }

    pub(crate) fn set_state(&self, next: SubState) {
        let mut state = self.state.lock().expect("state lock poisoned");
        // Cancellation is absorbing.
        if *state != SubState::Cancelled {
            *state = next;
        }
    }

    pub(crate) fn mark_remote_cancel(&self) {
        self.remote_cancel.store(true, Ordering::SeqCst);
    }

    pub(crate) fn remote_cancelled(&self) -> bool {
        self.remote_cancel.load(Ordering::SeqCst)
    }
}

/// The socket's side of a subscription: shared state plus the delivery queue.
pub(crate) struct SubEntry {
    pub(crate) shared: Arc<SubShared>,
    pub(crate) tx: mpsc::UnboundedSender<Event>,
}

/// Handle to a live subscription. Cheap to clone; clones share one queue,
/// so each delivered event is seen by exactly one `recv` call.
#[derive(Clone)]
pub struct Sub {
    id: String,
    socket: Socket,
    shared: Arc<SubShared>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Event>>>,
}

impl Sub {
    pub(crate) fn new(
        id: String,
        socket: Socket,
        shared: Arc<SubShared>,
        rx: mpsc::UnboundedReceiver<Event>,
    ) -> Self {
        Self {
            id,
            socket,
            shared,
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SubState {
        self.shared.state()
    }

    /// The filter currently associated with this subscription.
    pub fn filter(&self) -> Filter {
        self.shared.filter()
    }

    /// Receive the next matching event. Returns `None` once the
    /// subscription is cancelled and the queue is drained.
    pub async fn recv(&self) -> Option<Event> {
        self.rx.lock().await.recv().await
    }

    /// Take an already-queued event without waiting.
    pub fn try_recv(&self) -> Option<Event> {
        self.rx.try_lock().ok()?.try_recv().ok()
    }

    /// Broaden this subscription in place.
    ///
    /// Merges `filter` into the current one and re-sends the request under
    /// the same id, which resets the state to pending until the relay
    /// replays its end-of-stored-events marker.
    pub async fn update(&self, filter: Option<Filter>) -> Result<()> {
        if let Some(filter) = filter {
            self.shared.merge_filter(filter);
        }
        self.socket.resubscribe(&self.id).await
    }

    /// Cancel this subscription. Local teardown is immediate; the `CLOSE`
    /// frame goes out best-effort.
    pub async fn cancel(&self) {
        self.socket.cancel(&self.id).await;
    }

    /// Resolve once the end-of-stored-events marker arrives.
    pub async fn when_ready(&self) -> Result<()> {
        if self.state() == SubState::Ready {
            return Ok(());
        }
        self.socket.when_sub(&self.id).await
    }

    /// Resolve once the relay acknowledges teardown of this subscription.
    pub async fn when_cancel(&self) -> Result<String> {
        if self.shared.remote_cancelled() {
            return Ok(String::new());
        }
        self.socket.when_cancel(&self.id).await
    }
}
