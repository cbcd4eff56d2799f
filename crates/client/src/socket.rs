//! Relay socket engine.
//!
//! A [`Socket`] owns one websocket connection to a relay, a table of live
//! subscriptions, and an outbox of events buffered while disconnected.
//! Inbound frames are read by a single spawned task and dispatched serially,
//! so handler effects are observed in arrival order. Every notable state
//! change is mirrored onto a broadcast channel of [`SocketEvent`] signals,
//! which the `when_*` waiters consume.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use nostr_sync_core::{Event, Filter, SignerError, UnsignedEvent, event_digest, verify_event};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, warn};
use url::Url;

use crate::error::{ClientError, Result};
use crate::message::{ClientMessage, RelayMessage};
use crate::sub::{Sub, SubEntry, SubShared, SubState};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Capacity of the signal broadcast channel.
const SIGNAL_CAPACITY: usize = 256;

/// Tuning knobs for the socket engine.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Number of dial attempts before `connect` gives up.
    pub connect_retries: u32,
    /// Time slot for a single dial attempt. An attempt that fails early
    /// waits out the rest of its slot before the next one starts.
    pub connect_timeout: Duration,
    /// Window for receipt, subscription, and cancellation waiters.
    pub receipt_timeout: Duration,
    /// Pacing delay between frames when flushing after a reconnect.
    pub send_delta: Duration,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            connect_retries: 10,
            connect_timeout: Duration::from_millis(500),
            receipt_timeout: Duration::from_secs(4),
            send_delta: Duration::from_secs(1),
        }
    }
}

/// Signals emitted by the socket as it changes state.
#[derive(Debug, Clone)]
pub enum SocketEvent {
    /// The transport reconnected after having been connected before.
    Connected,
    /// The first connection completed and buffered work was flushed.
    Ready,
    /// The transport dropped or was closed.
    Closed,
    /// A subscription received its end-of-stored-events marker.
    Subscribed { sub_id: String },
    /// A subscription was torn down.
    Cancelled {
        sub_id: String,
        reason: String,
        /// True when the relay acknowledged or initiated the teardown.
        remote: bool,
    },
    /// A receipt arrived for a published event.
    Receipt {
        id: String,
        accepted: bool,
        reason: String,
    },
    /// A human-readable notice from the relay.
    Notice(String),
    /// An inbound payload was dropped at the protocol boundary.
    Rejected { reason: String, payload: String },
    /// The websocket transport reported an error.
    TransportError(String),
}

/// Receipt for a published event, correlated by event id.
#[derive(Debug, Clone)]
pub struct Receipt {
    pub id: String,
    pub accepted: bool,
    pub reason: String,
}

/// A relay connection with buffered publishing and live subscriptions.
///
/// Cheap to clone; clones share the same connection and tables.
#[derive(Clone)]
pub struct Socket {
    config: Arc<SocketConfig>,
    address: Arc<RwLock<Option<Url>>>,
    writer: Arc<Mutex<Option<WsSink>>>,
    pub(crate) subs: Arc<Mutex<HashMap<String, SubEntry>>>,
    pub(crate) outbox: Arc<Mutex<Vec<Event>>>,
    initialized: Arc<AtomicBool>,
    reader: Arc<Mutex<Option<JoinHandle<()>>>>,
    connect_guard: Arc<Mutex<()>>,
    signals: broadcast::Sender<SocketEvent>,
}

impl Socket {
    pub fn new(config: SocketConfig) -> Self {
        let (signals, _) = broadcast::channel(SIGNAL_CAPACITY);
        Self {
            config: Arc::new(config),
            address: Arc::new(RwLock::new(None)),
            writer: Arc::new(Mutex::new(None)),
            subs: Arc::new(Mutex::new(HashMap::new())),
            outbox: Arc::new(Mutex::new(Vec::new())),
            initialized: Arc::new(AtomicBool::new(false)),
            reader: Arc::new(Mutex::new(None)),
            connect_guard: Arc::new(Mutex::new(())),
            signals,
        }
    }

    pub fn config(&self) -> &SocketConfig {
        &self.config
    }

    /// The relay address from the most recent `connect` call.
    pub async fn address(&self) -> Option<String> {
        self.address.read().await.as_ref().map(Url::to_string)
    }

    /// Whether the transport is currently open.
    pub async fn is_connected(&self) -> bool {
        self.writer.lock().await.is_some()
    }

    /// Whether the first connection has completed.
    pub fn is_ready(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Subscribe to the signal stream.
    pub fn signals(&self) -> broadcast::Receiver<SocketEvent> {
        self.signals.subscribe()
    }

    pub(crate) fn emit(&self, event: SocketEvent) {
        // Only fails when no receiver is listening, which is fine.
        let _ = self.signals.send(event);
    }

    /// Connect to a relay, or re-target to a new address.
    ///
    /// Idempotent: calling with the current address while connected is a
    /// no-op. On (re)connect, live subscriptions are replayed first and the
    /// outbox is flushed in FIFO order, with `send_delta` pacing between
    /// frames. Fails with [`ClientError::ConnectTimeout`] once the retry
    /// budget runs out.
    pub async fn connect(&self, address: &str) -> Result<()> {
        let _guard = self.connect_guard.lock().await;

        let url = parse_relay_url(address)?;
        let same_address = self.address.read().await.as_ref() == Some(&url);
        if same_address && self.is_connected().await {
            debug!(%url, "already connected");
            return Ok(());
        }

        // Tear down any previous transport before dialing.
        if let Some(handle) = self.reader.lock().await.take() {
            handle.abort();
        }
        *self.writer.lock().await = None;
        *self.address.write().await = Some(url.clone());

        let stream = self.dial(&url).await?;
        let (sink, source) = stream.split();
        *self.writer.lock().await = Some(sink);
        self.spawn_reader(source).await;

        self.flush_pending().await;

        if self.initialized.swap(true, Ordering::SeqCst) {
            self.emit(SocketEvent::Connected);
        } else {
            self.emit(SocketEvent::Ready);
        }
        Ok(())
    }

    async fn dial(&self, url: &Url) -> Result<WsStream> {
        for attempt in 0..=self.config.connect_retries {
            let started = Instant::now();
            match timeout(self.config.connect_timeout, connect_async(url.as_str())).await {
                Ok(Ok((stream, _response))) => {
                    debug!(%url, attempt, "websocket handshake complete");
                    return Ok(stream);
                }
                Ok(Err(e)) => {
                    debug!(%url, attempt, error = %e, "dial failed");
                    // A fast failure waits out the rest of its attempt slot,
                    // keeping the total budget at attempts x connect_timeout.
                    if let Some(pause) = self.config.connect_timeout.checked_sub(started.elapsed())
                    {
                        tokio::time::sleep(pause).await;
                    }
                }
                Err(_) => {
                    debug!(%url, attempt, "dial attempt timed out");
                }
            }
        }
        warn!(%url, "connection retry budget exhausted");
        Err(ClientError::ConnectTimeout)
    }

    async fn spawn_reader(&self, mut source: WsSource) {
        let socket = self.clone();
        let handle = tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                match frame {
                    Ok(Message::Text(text)) => socket.dispatch(text.as_str()).await,
                    Ok(Message::Ping(payload)) => {
                        let mut writer = socket.writer.lock().await;
                        if let Some(sink) = writer.as_mut() {
                            let _ = sink.send(Message::Pong(payload)).await;
                        }
                    }
                    Ok(Message::Close(_)) => {
                        debug!("relay closed the connection");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "websocket read error");
                        socket.emit(SocketEvent::TransportError(e.to_string()));
                        break;
                    }
                }
            }
            *socket.writer.lock().await = None;
            socket.emit(SocketEvent::Closed);
        });
        *self.reader.lock().await = Some(handle);
    }

    /// Route one inbound frame. Runs on the reader task only.
    async fn dispatch(&self, text: &str) {
        let message = match RelayMessage::from_json(text) {
            Ok(message) => message,
            Err(crate::error::MessageError::UnknownType(kind)) => {
                debug!(%kind, "ignoring unknown relay message");
                return;
            }
            Err(e) => {
                self.emit(SocketEvent::Rejected {
                    reason: format!("malformed relay message: {e}"),
                    payload: text.to_string(),
                });
                return;
            }
        };

        match message {
            RelayMessage::Event { sub_id, event } => {
                let mut subs = self.subs.lock().await;
                let Some(entry) = subs.get(&sub_id) else {
                    self.emit(SocketEvent::Rejected {
                        reason: format!("no subscription with id {sub_id}"),
                        payload: text.to_string(),
                    });
                    return;
                };
                if !verify_event(&event).unwrap_or(false) {
                    self.emit(SocketEvent::Rejected {
                        reason: "event failed signature verification".to_string(),
                        payload: text.to_string(),
                    });
                    return;
                }
                if entry.tx.send(event).is_err() {
                    // Receiver was dropped without cancelling.
                    debug!(%sub_id, "subscription receiver gone, removing entry");
                    subs.remove(&sub_id);
                }
            }
            RelayMessage::Eose { sub_id } => {
                let known = {
                    let subs = self.subs.lock().await;
                    match subs.get(&sub_id) {
                        Some(entry) => {
                            entry.shared.set_state(SubState::Ready);
                            true
                        }
                        None => false,
                    }
                };
                if known {
                    self.emit(SocketEvent::Subscribed { sub_id });
                } else {
                    debug!(%sub_id, "eose for unknown subscription");
                }
            }
            RelayMessage::Ok {
                event_id,
                accepted,
                reason,
            } => {
                self.emit(SocketEvent::Receipt {
                    id: event_id,
                    accepted,
                    reason,
                });
            }
            RelayMessage::Closed { sub_id, reason } => {
                // The entry may already be gone when this is the relay's
                // acknowledgement of our own CLOSE frame. The signal still
                // goes out so cancellation waiters can resolve.
                if let Some(entry) = self.subs.lock().await.remove(&sub_id) {
                    entry.shared.set_state(SubState::Cancelled);
                    entry.shared.mark_remote_cancel();
                }
                self.emit(SocketEvent::Cancelled {
                    sub_id,
                    reason,
                    remote: true,
                });
            }
            RelayMessage::Notice { message } => {
                debug!(%message, "relay notice");
                self.emit(SocketEvent::Notice(message));
            }
        }
    }

    /// Replay live subscriptions, then drain the outbox in FIFO order.
    async fn flush_pending(&self) {
        let reqs: Vec<(String, Filter)> = {
            let subs = self.subs.lock().await;
            subs.iter()
                .filter(|(_, entry)| entry.shared.state() != SubState::Cancelled)
                .map(|(id, entry)| (id.clone(), entry.shared.filter()))
                .collect()
        };
        let events: Vec<Event> = self.outbox.lock().await.drain(..).collect();

        let mut first = true;
        for (sub_id, filter) in reqs {
            if !first {
                tokio::time::sleep(self.config.send_delta).await;
            }
            first = false;
            if let Err(e) = self.send_frame(&ClientMessage::Req { sub_id, filter }).await {
                warn!(error = %e, "failed to replay subscription");
            }
        }
        for event in events {
            if !first {
                tokio::time::sleep(self.config.send_delta).await;
            }
            first = false;
            let id = event.id.clone();
            if let Err(e) = self.send_frame(&ClientMessage::Event(event)).await {
                warn!(%id, error = %e, "failed to flush buffered event");
            }
        }
    }

    async fn send_frame(&self, message: &ClientMessage) -> Result<()> {
        let text = message.to_json()?;
        let mut writer = self.writer.lock().await;
        match writer.as_mut() {
            Some(sink) => match sink.send(Message::Text(text.into())).await {
                Ok(()) => Ok(()),
                Err(e) => {
                    *writer = None;
                    Err(ClientError::Transport(e.to_string()))
                }
            },
            None => Err(ClientError::NotConnected),
        }
    }

    /// Publish a signed event. Never fails: while disconnected the event is
    /// buffered and flushed on the next successful `connect`.
    pub async fn publish(&self, event: Event) {
        match self.send_frame(&ClientMessage::Event(event.clone())).await {
            Ok(()) => debug!(id = %event.id, "published event"),
            Err(e) => {
                debug!(id = %event.id, error = %e, "buffering event for next connect");
                self.outbox.lock().await.push(event);
            }
        }
    }

    /// Sign and publish an unsigned event, then wait for its receipt.
    ///
    /// The receipt waiter is registered before the frame leaves, so a fast
    /// relay cannot slip its `OK` past us.
    pub async fn send<F>(&self, event: UnsignedEvent, sign_fn: F) -> Result<Receipt>
    where
        F: FnOnce(&[u8; 32]) -> std::result::Result<String, SignerError>,
    {
        let signed = sign_event(event, sign_fn)?;
        let id = signed.id.clone();
        let signals = self.signals.subscribe();
        self.publish(signed).await;
        self.await_receipt(signals, &id).await
    }

    /// Open a subscription. The entry is registered locally before any frame
    /// is sent, so a deferred `connect` will replay it.
    pub async fn subscribe(&self, filter: Filter, sub_id: Option<String>) -> Sub {
        let sub_id = sub_id.unwrap_or_else(generate_sub_id);
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(SubShared::new(filter.clone()));
        self.subs
            .lock()
            .await
            .insert(sub_id.clone(), SubEntry { shared: shared.clone(), tx });
        debug!(%sub_id, "registered subscription");

        if let Err(e) = self.send_frame(&ClientMessage::Req { sub_id: sub_id.clone(), filter }).await
        {
            debug!(%sub_id, error = %e, "subscription deferred until connect");
        }
        Sub::new(sub_id, self.clone(), shared, rx)
    }

    /// Re-send the `REQ` frame for a live subscription under its existing id.
    pub(crate) async fn resubscribe(&self, sub_id: &str) -> Result<()> {
        let filter = {
            let subs = self.subs.lock().await;
            let entry = subs.get(sub_id).ok_or(ClientError::NotInitialized("subscription"))?;
            entry.shared.set_state(SubState::Pending);
            entry.shared.filter()
        };
        match self
            .send_frame(&ClientMessage::Req { sub_id: sub_id.to_string(), filter })
            .await
        {
            Ok(()) => Ok(()),
            // Deferred: the entry stays in the table and replays on connect.
            Err(ClientError::NotConnected) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Cancel a subscription.
    ///
    /// The local entry is removed immediately regardless of transport state.
    /// A `CLOSE` frame is sent best-effort when connected; relay-side
    /// acknowledgement is only observable through [`Socket::when_cancel`].
    pub async fn cancel(&self, sub_id: &str) {
        let entry = self.subs.lock().await.remove(sub_id);
        let Some(entry) = entry else {
            return;
        };
        entry.shared.set_state(SubState::Cancelled);
        if let Err(e) = self
            .send_frame(&ClientMessage::Close { sub_id: sub_id.to_string() })
            .await
        {
            debug!(sub_id, error = %e, "close frame not sent");
        }
        self.emit(SocketEvent::Cancelled {
            sub_id: sub_id.to_string(),
            reason: "cancelled by client".to_string(),
            remote: false,
        });
    }

    /// Close the transport and cancel all live subscriptions locally.
    pub async fn close(&self) {
        let _guard = self.connect_guard.lock().await;

        if let Some(handle) = self.reader.lock().await.take() {
            handle.abort();
        }
        if let Some(mut sink) = self.writer.lock().await.take() {
            let _ = sink.close().await;
        }

        let entries: Vec<(String, SubEntry)> = self.subs.lock().await.drain().collect();
        for (sub_id, entry) in entries {
            entry.shared.set_state(SubState::Cancelled);
            self.emit(SocketEvent::Cancelled {
                sub_id,
                reason: "socket closed".to_string(),
                remote: false,
            });
        }
        self.emit(SocketEvent::Closed);
    }

    /// One-shot fetch on an existing socket: subscribe, collect until the
    /// end-of-stored-events marker, cancel, return the batch.
    pub async fn prefetch(&self, filter: Filter) -> Result<Vec<Event>> {
        let sub = self.subscribe(filter, None).await;
        let events = collect_until_ready(self, &sub).await?;
        sub.cancel().await;
        Ok(events)
    }

    /// One-shot fetch on a throwaway socket: connect, collect the stored
    /// events matching `filter`, tear everything down.
    pub async fn query(address: &str, filter: Filter, config: SocketConfig) -> Result<Vec<Event>> {
        let socket = Socket::new(config);
        // Register before dialing so the request rides the connect flush.
        let sub = socket.subscribe(filter, None).await;
        socket.connect(address).await?;
        let events = collect_until_ready(&socket, &sub).await;
        sub.cancel().await;
        socket.close().await;
        events
    }

    /// Resolve once the transport is open.
    pub async fn when_connected(&self) -> Result<()> {
        let mut signals = self.signals.subscribe();
        if self.is_connected().await {
            return Ok(());
        }
        let budget =
            self.config.connect_timeout * (self.config.connect_retries.saturating_add(1));
        await_signal(&mut signals, budget, ClientError::ConnectTimeout, |signal| {
            matches!(signal, SocketEvent::Connected | SocketEvent::Ready).then_some(Ok(()))
        })
        .await
    }

    /// Resolve once a subscription receives its end-of-stored-events marker.
    pub async fn when_sub(&self, sub_id: &str) -> Result<()> {
        let mut signals = self.signals.subscribe();
        {
            let subs = self.subs.lock().await;
            if let Some(entry) = subs.get(sub_id)
                && entry.shared.state() == SubState::Ready
            {
                return Ok(());
            }
        }
        let timeout_err = ClientError::SubscribeTimeout { sub_id: sub_id.to_string() };
        await_signal(&mut signals, self.config.receipt_timeout, timeout_err, |signal| {
            match signal {
                SocketEvent::Subscribed { sub_id: id } if id == sub_id => Some(Ok(())),
                SocketEvent::Cancelled { sub_id: id, reason, .. } if id == sub_id => {
                    Some(Err(ClientError::Transport(format!(
                        "subscription cancelled: {reason}"
                    ))))
                }
                _ => None,
            }
        })
        .await
    }

    /// Resolve once the relay acknowledges a subscription teardown.
    ///
    /// Locally-initiated teardown does not resolve this waiter; against an
    /// unreachable relay it times out even though the subscription is
    /// already gone from the local table.
    pub async fn when_cancel(&self, sub_id: &str) -> Result<String> {
        let mut signals = self.signals.subscribe();
        let timeout_err = ClientError::CancelTimeout { sub_id: sub_id.to_string() };
        await_signal(&mut signals, self.config.receipt_timeout, timeout_err, |signal| {
            match signal {
                SocketEvent::Cancelled { sub_id: id, reason, remote: true } if id == sub_id => {
                    Some(Ok(reason))
                }
                _ => None,
            }
        })
        .await
    }

    /// Resolve on the next receipt for the given event id.
    pub async fn when_receipt(&self, event_id: &str) -> Result<Receipt> {
        let signals = self.signals.subscribe();
        self.await_receipt(signals, event_id).await
    }

    async fn await_receipt(
        &self,
        mut signals: broadcast::Receiver<SocketEvent>,
        event_id: &str,
    ) -> Result<Receipt> {
        let timeout_err = ClientError::ReceiptTimeout { id: event_id.to_string() };
        await_signal(&mut signals, self.config.receipt_timeout, timeout_err, |signal| {
            match signal {
                SocketEvent::Receipt { id, accepted, reason } if id == event_id => {
                    if accepted {
                        Some(Ok(Receipt { id, accepted, reason }))
                    } else {
                        Some(Err(ClientError::PublishRejected { id, reason }))
                    }
                }
                _ => None,
            }
        })
        .await
    }
}

/// Compute the id of an unsigned event, sign it, and assemble the result.
pub fn sign_event<F>(event: UnsignedEvent, sign_fn: F) -> Result<Event>
where
    F: FnOnce(&[u8; 32]) -> std::result::Result<String, SignerError>,
{
    let digest = event_digest(&event)?;
    let sig = sign_fn(&digest)?;
    Ok(event.into_signed(hex::encode(digest), sig))
}

/// Random subscription identifier.
pub(crate) fn generate_sub_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

fn parse_relay_url(address: &str) -> Result<Url> {
    let url = Url::parse(address).map_err(|e| ClientError::InvalidAddress(e.to_string()))?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(ClientError::InvalidAddress(format!(
            "unsupported scheme: {other}"
        ))),
    }
}

/// Wait for the first signal the matcher accepts, bounded by `window`.
async fn await_signal<T>(
    signals: &mut broadcast::Receiver<SocketEvent>,
    window: Duration,
    timeout_err: ClientError,
    mut matcher: impl FnMut(SocketEvent) -> Option<Result<T>>,
) -> Result<T> {
    let wait = async {
        loop {
            match signals.recv().await {
                Ok(signal) => {
                    if let Some(outcome) = matcher(signal) {
                        return outcome;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(missed = n, "signal receiver lagged");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(ClientError::NotConnected);
                }
            }
        }
    };
    match timeout(window, wait).await {
        Ok(outcome) => outcome,
        Err(_) => Err(timeout_err),
    }
}

/// Drain a subscription until its end-of-stored-events marker arrives.
async fn collect_until_ready(socket: &Socket, sub: &Sub) -> Result<Vec<Event>> {
    let mut events = Vec::new();
    let ready = socket.when_sub(sub.id());
    tokio::pin!(ready);
    loop {
        tokio::select! {
            maybe = sub.recv() => match maybe {
                Some(event) => events.push(event),
                None => break,
            },
            outcome = &mut ready => {
                outcome?;
                break;
            }
        }
    }
    // Stored events may still sit in the queue behind the marker.
    while let Some(event) = sub.try_recv() {
        events.push(event);
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr_sync_core::{Keys, Signer};

    fn test_event(keys: &Keys, content: &str) -> Event {
        let unsigned = UnsignedEvent {
            pubkey: keys.pubkey(),
            created_at: 1_700_000_000,
            kind: 1,
            tags: vec![],
            content: content.to_string(),
        };
        sign_event(unsigned, |digest| keys.sign(digest)).unwrap()
    }

    #[test]
    fn test_parse_relay_url() {
        assert!(parse_relay_url("wss://relay.example.com").is_ok());
        assert!(parse_relay_url("ws://127.0.0.1:8080").is_ok());
        assert!(matches!(
            parse_relay_url("https://relay.example.com"),
            Err(ClientError::InvalidAddress(_))
        ));
        assert!(matches!(
            parse_relay_url("not a url"),
            Err(ClientError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_generate_sub_id_is_unique() {
        let a = generate_sub_id();
        let b = generate_sub_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[tokio::test]
    async fn test_publish_buffers_while_disconnected() {
        let socket = Socket::new(SocketConfig::default());
        let keys = Keys::generate();

        socket.publish(test_event(&keys, "first")).await;
        socket.publish(test_event(&keys, "second")).await;

        let outbox = socket.outbox.lock().await;
        assert_eq!(outbox.len(), 2);
        assert_eq!(outbox[0].content, "first");
        assert_eq!(outbox[1].content, "second");
    }

    #[tokio::test]
    async fn test_subscribe_registers_before_connect() {
        let socket = Socket::new(SocketConfig::default());
        let filter = Filter::new().kinds(vec![30000]);
        let sub = socket.subscribe(filter.clone(), None).await;

        let subs = socket.subs.lock().await;
        let entry = subs.get(sub.id()).expect("entry registered");
        assert_eq!(entry.shared.filter(), filter);
        assert_eq!(entry.shared.state(), SubState::Pending);
    }

    #[tokio::test]
    async fn test_cancel_removes_entry_locally() {
        let socket = Socket::new(SocketConfig::default());
        let sub = socket.subscribe(Filter::new(), None).await;
        let sub_id = sub.id().to_string();

        sub.cancel().await;

        assert!(socket.subs.lock().await.get(&sub_id).is_none());
        assert_eq!(sub.state(), SubState::Cancelled);
    }

    #[tokio::test]
    async fn test_when_cancel_times_out_without_remote_ack() {
        let config = SocketConfig {
            receipt_timeout: Duration::from_millis(50),
            ..SocketConfig::default()
        };
        let socket = Socket::new(config);
        let sub = socket.subscribe(Filter::new(), None).await;
        let sub_id = sub.id().to_string();

        // Local teardown emits a non-remote signal, which the waiter ignores.
        let waiter = socket.when_cancel(&sub_id);
        tokio::pin!(waiter);
        socket.cancel(&sub_id).await;

        assert!(matches!(
            waiter.await,
            Err(ClientError::CancelTimeout { .. })
        ));
        assert!(socket.subs.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_routes_events_to_subscription() {
        let socket = Socket::new(SocketConfig::default());
        let keys = Keys::generate();
        let sub = socket.subscribe(Filter::new(), Some("sub1".to_string())).await;

        let event = test_event(&keys, "hello");
        let frame = serde_json::to_string(&serde_json::json!(["EVENT", "sub1", event])).unwrap();
        socket.dispatch(&frame).await;

        let received = sub.try_recv().expect("event delivered");
        assert_eq!(received.content, "hello");
    }

    #[tokio::test]
    async fn test_dispatch_bounces_unknown_subscription() {
        let socket = Socket::new(SocketConfig::default());
        let keys = Keys::generate();
        let mut signals = socket.signals();

        let event = test_event(&keys, "stray");
        let frame = serde_json::to_string(&serde_json::json!(["EVENT", "nope", event])).unwrap();
        socket.dispatch(&frame).await;

        match signals.try_recv().unwrap() {
            SocketEvent::Rejected { reason, .. } => {
                assert!(reason.contains("no subscription"));
            }
            other => panic!("unexpected signal: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_dispatch_bounces_invalid_signature() {
        let socket = Socket::new(SocketConfig::default());
        let keys = Keys::generate();
        let sub = socket.subscribe(Filter::new(), Some("sub1".to_string())).await;
        let mut signals = socket.signals();

        let mut event = test_event(&keys, "tampered");
        event.content = "altered".to_string();
        let frame = serde_json::to_string(&serde_json::json!(["EVENT", "sub1", event])).unwrap();
        socket.dispatch(&frame).await;

        match signals.try_recv().unwrap() {
            SocketEvent::Rejected { reason, .. } => {
                assert!(reason.contains("signature"));
            }
            other => panic!("unexpected signal: {other:?}"),
        }
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_dispatch_eose_marks_sub_ready() {
        let socket = Socket::new(SocketConfig::default());
        let sub = socket.subscribe(Filter::new(), Some("sub1".to_string())).await;
        assert_eq!(sub.state(), SubState::Pending);

        socket.dispatch(r#"["EOSE","sub1"]"#).await;
        assert_eq!(sub.state(), SubState::Ready);
    }

    #[tokio::test]
    async fn test_dispatch_closed_tears_down_sub() {
        let socket = Socket::new(SocketConfig::default());
        let sub = socket.subscribe(Filter::new(), Some("sub1".to_string())).await;
        let mut signals = socket.signals();

        socket.dispatch(r#"["CLOSED","sub1","error: too many subs"]"#).await;

        assert_eq!(sub.state(), SubState::Cancelled);
        assert!(socket.subs.lock().await.is_empty());
        match signals.try_recv().unwrap() {
            SocketEvent::Cancelled { sub_id, reason, remote } => {
                assert_eq!(sub_id, "sub1");
                assert_eq!(reason, "error: too many subs");
                assert!(remote);
            }
            other => panic!("unexpected signal: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_receipt_waiter_resolves_on_ok() {
        let socket = Socket::new(SocketConfig::default());
        let waiter = tokio::spawn({
            let socket = socket.clone();
            async move { socket.when_receipt("ev1").await }
        });
        // Let the waiter register its signal receiver first.
        tokio::task::yield_now().await;

        socket.dispatch(r#"["OK","ev1",true,""]"#).await;
        let receipt = waiter.await.unwrap().unwrap();
        assert!(receipt.accepted);
        assert_eq!(receipt.id, "ev1");
    }

    #[tokio::test]
    async fn test_receipt_waiter_rejects_on_nack() {
        let socket = Socket::new(SocketConfig::default());
        let waiter = tokio::spawn({
            let socket = socket.clone();
            async move { socket.when_receipt("ev1").await }
        });
        tokio::task::yield_now().await;

        socket.dispatch(r#"["OK","ev1",false,"invalid: bad sig"]"#).await;
        match waiter.await.unwrap() {
            Err(ClientError::PublishRejected { id, reason }) => {
                assert_eq!(id, "ev1");
                assert_eq!(reason, "invalid: bad sig");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_receipt_waiter_ignores_other_ids() {
        let config = SocketConfig {
            receipt_timeout: Duration::from_millis(50),
            ..SocketConfig::default()
        };
        let socket = Socket::new(config);
        let waiter = tokio::spawn({
            let socket = socket.clone();
            async move { socket.when_receipt("ev1").await }
        });
        tokio::task::yield_now().await;

        socket.dispatch(r#"["OK","other",true,""]"#).await;
        assert!(matches!(
            waiter.await.unwrap(),
            Err(ClientError::ReceiptTimeout { .. })
        ));
    }
}
