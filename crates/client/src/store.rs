//! Encrypted, replicated state store.
//!
//! A [`Store`] keeps one JSON-serializable value synchronized with a relay
//! under a shared secret. Remote updates arrive through a live subscription,
//! pass last-write-wins arbitration on `created_at`, and are committed
//! through a single-shot debounce so a replay burst collapses into one
//! visible state change. Local updates are encrypted, tagged, signed, and
//! published through the socket, then committed immediately.
//!
//! Each published event carries a key-wrap tag that lets the author's
//! signer recover the store secret later; [`Store::list`] uses it to
//! enumerate a signer's stores on a relay without knowing any secret up
//! front.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use nostr_sync_core::{
    Event, Filter, Signer, UnsignedEvent, check_store_key, combine_filters, decrypt_content,
    decrypt_store_key, encrypt_content, has_entry, is_envelope, is_hash, now, sha256_hex,
    wrap_store_key,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{ClientError, Result};
use crate::socket::{Socket, SocketConfig, sign_event};
use crate::sub::Sub;

/// Event kind used for store records.
pub const DEFAULT_STORE_KIND: u16 = 30000;

/// Capacity of the store signal channel.
const SIGNAL_CAPACITY: usize = 64;

/// Tuning knobs for a store.
#[derive(Clone)]
pub struct StoreConfig {
    /// Quiet window after an inbound update before it is committed.
    pub buffer_timer: Duration,
    /// Event kind for store records.
    pub kind: u16,
    /// Extra filter constraints merged into the store subscription.
    pub filter: Filter,
    /// Extra tags attached to every published record.
    pub tags: Vec<Vec<String>>,
    /// Socket to ride on. A fresh one is created at `connect` if absent.
    pub socket: Option<Socket>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            buffer_timer: Duration::from_secs(2),
            kind: DEFAULT_STORE_KIND,
            filter: Filter::new().limit(10),
            tags: Vec::new(),
            socket: None,
        }
    }
}

/// Signals emitted as the store changes state.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    /// The first state commit completed.
    Ready,
    /// A later state commit completed.
    Update,
    /// An inbound event was dropped before reaching state.
    Rejected { reason: String, event: Event },
    /// The store was shut down.
    Close,
}

/// A record discovered by [`Store::list`].
#[derive(Debug, Clone, PartialEq)]
pub struct StoreRecord {
    /// Topic id of the store.
    pub store_id: String,
    /// Author of the record.
    pub pubkey: String,
    /// Recovered store secret, hex encoded.
    pub secret: String,
    /// Timestamp of the newest surviving record.
    pub updated_at: u64,
}

struct StoreState<T> {
    data: Option<T>,
    prev: Option<T>,
    updated_at: Option<u64>,
    pending: Option<(T, u64)>,
}

struct StoreInner<T> {
    secret: [u8; 32],
    store_id: String,
    kind: u16,
    tags: Vec<Vec<String>>,
    filter: Filter,
    buffer_timer: Duration,
    signer: Arc<dyn Signer>,
    state: StdMutex<StoreState<T>>,
    debounce: StdMutex<Option<JoinHandle<()>>>,
    initialized: AtomicBool,
    socket: Mutex<Option<Socket>>,
    sub: Mutex<Option<Sub>>,
    signals: broadcast::Sender<StoreEvent>,
}

/// Encrypted replicated store bound to one secret and one signer.
///
/// Cheap to clone; clones share all state.
pub struct Store<T> {
    inner: Arc<StoreInner<T>>,
}

impl<T> Clone for Store<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Store<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Bind a store to a shared secret and a signer.
    ///
    /// The secret must be 64 lowercase-insensitive hex characters. The
    /// topic id is the hex sha256 of the decoded secret bytes, and the
    /// subscription filter is pinned to the configured kind plus a `d` tag
    /// holding that id.
    pub fn new(secret: &str, signer: Arc<dyn Signer>, config: StoreConfig) -> Result<Self> {
        if !is_hash(secret) {
            return Err(ClientError::InvalidSecret(
                "secret must be 64 hex characters".to_string(),
            ));
        }
        let bytes: [u8; 32] = hex::decode(secret)
            .map_err(|e| ClientError::InvalidSecret(e.to_string()))?
            .try_into()
            .map_err(|_| ClientError::InvalidSecret("secret must be 32 bytes".to_string()))?;
        let store_id = sha256_hex(&bytes);
        let filter = combine_filters([
            config.filter,
            Filter::new()
                .kinds(vec![config.kind])
                .tag("d", vec![store_id.clone()]),
        ]);
        let (signals, _) = broadcast::channel(SIGNAL_CAPACITY);
        Ok(Self {
            inner: Arc::new(StoreInner {
                secret: bytes,
                store_id,
                kind: config.kind,
                tags: config.tags,
                filter,
                buffer_timer: config.buffer_timer,
                signer,
                state: StdMutex::new(StoreState {
                    data: None,
                    prev: None,
                    updated_at: None,
                    pending: None,
                }),
                debounce: StdMutex::new(None),
                initialized: AtomicBool::new(false),
                socket: Mutex::new(config.socket),
                sub: Mutex::new(None),
                signals,
            }),
        })
    }

    /// Topic id of this store.
    pub fn id(&self) -> &str {
        &self.inner.store_id
    }

    /// The shared secret, hex encoded.
    pub fn secret(&self) -> String {
        hex::encode(self.inner.secret)
    }

    /// Pubkey of the bound signer.
    pub fn pubkey(&self) -> String {
        self.inner.signer.pubkey()
    }

    /// The subscription filter for this store.
    pub fn filter(&self) -> Filter {
        self.inner.filter.clone()
    }

    /// Whether the first state commit has happened.
    pub fn is_ready(&self) -> bool {
        self.inner.initialized.load(Ordering::SeqCst)
    }

    /// Current state. Fails until the first commit.
    pub fn data(&self) -> Result<T> {
        self.inner
            .state
            .lock()
            .expect("state lock poisoned")
            .data
            .clone()
            .ok_or(ClientError::NotInitialized("store data"))
    }

    /// State before the most recent commit.
    pub fn prev(&self) -> Result<T> {
        self.inner
            .state
            .lock()
            .expect("state lock poisoned")
            .prev
            .clone()
            .ok_or(ClientError::NotInitialized("store data"))
    }

    /// Timestamp of the most recent commit.
    pub fn updated_at(&self) -> Result<u64> {
        self.inner
            .state
            .lock()
            .expect("state lock poisoned")
            .updated_at
            .ok_or(ClientError::NotInitialized("store data"))
    }

    /// Hex sha256 of the current state's JSON serialization.
    pub fn hash(&self) -> Result<String> {
        let json = serde_json::to_string(&self.data()?)?;
        Ok(sha256_hex(json.as_bytes()))
    }

    /// Subscribe to the store's signal stream.
    pub fn signals(&self) -> broadcast::Receiver<StoreEvent> {
        self.inner.signals.subscribe()
    }

    /// Connect to a relay and start replicating.
    ///
    /// Opens the store subscription before dialing, so the request rides
    /// the connect flush.
    pub async fn connect(&self, address: &str) -> Result<()> {
        let socket = {
            let mut guard = self.inner.socket.lock().await;
            guard
                .get_or_insert_with(|| Socket::new(SocketConfig::default()))
                .clone()
        };
        let sub = socket.subscribe(self.inner.filter.clone(), None).await;
        *self.inner.sub.lock().await = Some(sub.clone());

        let inner = self.inner.clone();
        tokio::spawn(async move {
            while let Some(event) = sub.recv().await {
                inner.handle_event(event);
            }
        });
        socket.connect(address).await
    }

    /// Connect and seed the store with an initial value.
    pub async fn init(&self, address: &str, data: T) -> Result<()> {
        self.connect(address).await?;
        self.update(data).await
    }

    /// Publish a new state with the current timestamp.
    pub async fn update(&self, data: T) -> Result<()> {
        self.publish_state(data, now(), Vec::new()).await
    }

    /// Publish a new state with an explicit timestamp.
    pub async fn update_at(&self, data: T, updated_at: u64) -> Result<()> {
        self.publish_state(data, updated_at, Vec::new()).await
    }

    /// Publish a tombstone record for this store.
    ///
    /// The record carries the current state plus a `deleted` marker tag,
    /// which excludes it from [`Store::list`] results.
    pub async fn delete(&self) -> Result<()> {
        let data = self.data()?;
        self.publish_state(data, now(), vec![deleted_tag()]).await
    }

    async fn publish_state(&self, data: T, updated_at: u64, extra_tags: Vec<Vec<String>>) -> Result<()> {
        {
            let state = self.inner.state.lock().expect("state lock poisoned");
            if let Some(current) = state.updated_at
                && updated_at < current
            {
                return Err(ClientError::StaleTimestamp {
                    incoming: updated_at,
                    current,
                });
            }
        }

        let json = serde_json::to_string(&data)?;
        let content = encrypt_content(&json, &self.inner.secret)?;

        let mut tags = self.inner.tags.clone();
        tags.push(vec!["d".to_string(), self.inner.store_id.clone()]);
        tags.push(vec!["hash".to_string(), sha256_hex(json.as_bytes())]);
        tags.push(wrap_store_key(
            &self.inner.secret,
            &content,
            self.inner.signer.as_ref(),
        )?);
        tags.extend(extra_tags);

        let unsigned = UnsignedEvent {
            pubkey: self.inner.signer.pubkey(),
            created_at: updated_at,
            kind: self.inner.kind,
            tags,
            content,
        };
        let signer = self.inner.signer.clone();
        let event = sign_event(unsigned, |digest| signer.sign(digest))?;

        let socket = self
            .inner
            .socket
            .lock()
            .await
            .clone()
            .ok_or(ClientError::NotInitialized("store socket"))?;
        socket.publish(event).await;

        // Local updates commit immediately, without the inbound debounce.
        {
            let mut state = self.inner.state.lock().expect("state lock poisoned");
            state.prev = state.data.take().or_else(|| Some(data.clone()));
            state.data = Some(data);
            state.updated_at = Some(updated_at);
        }
        self.inner.emit_commit();
        Ok(())
    }

    /// Re-request stored state from the relay under the existing
    /// subscription id.
    pub async fn refresh(&self) -> Result<()> {
        let sub = self.inner.sub.lock().await.clone();
        match sub {
            Some(sub) => sub.update(None).await,
            None => Err(ClientError::NotInitialized("store subscription")),
        }
    }

    /// Resolve once the first state commit lands.
    pub async fn when_ready(&self) -> Result<()> {
        let mut signals = self.inner.signals.subscribe();
        if self.is_ready() {
            return Ok(());
        }
        loop {
            match signals.recv().await {
                Ok(StoreEvent::Ready | StoreEvent::Update) => return Ok(()),
                Ok(StoreEvent::Close) => {
                    return Err(ClientError::NotInitialized("store closed"));
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    if self.is_ready() {
                        return Ok(());
                    }
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(ClientError::NotInitialized("store closed"));
                }
            }
        }
    }

    /// Cancel the subscription, close the socket, and stop the debounce.
    pub async fn close(&self) {
        if let Some(handle) = self
            .inner
            .debounce
            .lock()
            .expect("debounce lock poisoned")
            .take()
        {
            handle.abort();
        }
        if let Some(sub) = self.inner.sub.lock().await.take() {
            sub.cancel().await;
        }
        if let Some(socket) = self.inner.socket.lock().await.take() {
            socket.close().await;
        }
        let _ = self.inner.signals.send(StoreEvent::Close);
    }

    /// Enumerate a signer's stores on a relay.
    ///
    /// Fetches candidate records, drops tombstones, keeps only events whose
    /// key-wrap tag this signer can open, and recovers each store secret.
    pub async fn list(
        address: &str,
        signer: Arc<dyn Signer>,
        filter: Option<Filter>,
    ) -> Result<Vec<StoreRecord>> {
        let base = filter.unwrap_or_else(|| Filter::new().kinds(vec![DEFAULT_STORE_KIND]));
        let filter = combine_filters([base, Filter::new().authors(vec![signer.pubkey()])]);
        let events = Socket::query(address, filter, SocketConfig::default()).await?;

        let mut records = Vec::new();
        for event in events {
            if has_entry("deleted", &event.tags) {
                continue;
            }
            if !check_store_key(&event, signer.as_ref()) {
                continue;
            }
            match decrypt_store_key(&event, signer.as_ref()) {
                Ok(secret) => records.push(StoreRecord {
                    store_id: sha256_hex(&secret),
                    pubkey: event.pubkey.clone(),
                    secret: hex::encode(secret),
                    updated_at: event.created_at,
                }),
                Err(e) => debug!(id = %event.id, error = %e, "unable to recover store key"),
            }
        }
        Ok(records)
    }

    #[cfg(test)]
    pub(crate) fn handle_inbound(&self, event: Event) {
        self.inner.handle_event(event);
    }
}

impl<T> StoreInner<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Arbitrate and stage one inbound event. Runs on the subscription
    /// consumer task.
    fn handle_event(self: &Arc<Self>, event: Event) {
        {
            // Arbitrate against the staged timestamp too, so a burst inside
            // the quiet window still resolves last-write-wins.
            let state = self.state.lock().expect("state lock poisoned");
            let current = state
                .pending
                .as_ref()
                .map(|(_, staged_at)| *staged_at)
                .max(state.updated_at);
            if let Some(current) = current
                && event.created_at <= current
            {
                debug!(
                    id = %event.id,
                    incoming = event.created_at,
                    current,
                    "dropping stale store event"
                );
                return;
            }
        }

        if !is_envelope(&event.content) {
            self.reject("store content is not encrypted", event);
            return;
        }
        let plaintext = match decrypt_content(&event.content, &self.secret) {
            Ok(plaintext) => plaintext,
            Err(_) => {
                self.reject("unable to decrypt store content", event);
                return;
            }
        };
        let data: T = match serde_json::from_str(&plaintext) {
            Ok(data) => data,
            Err(_) => {
                self.reject("store content failed validation", event);
                return;
            }
        };

        {
            let mut state = self.state.lock().expect("state lock poisoned");
            state.pending = Some((data, event.created_at));
        }
        self.arm_debounce();
    }

    /// Restart the quiet-window timer. Only the last staged value within
    /// the window is committed.
    fn arm_debounce(self: &Arc<Self>) {
        let mut debounce = self.debounce.lock().expect("debounce lock poisoned");
        if let Some(handle) = debounce.take() {
            handle.abort();
        }
        let inner = self.clone();
        *debounce = Some(tokio::spawn(async move {
            tokio::time::sleep(inner.buffer_timer).await;
            inner.commit_pending();
        }));
    }

    fn commit_pending(&self) {
        let committed = {
            let mut state = self.state.lock().expect("state lock poisoned");
            match state.pending.take() {
                Some((data, staged_at)) => {
                    state.prev = state.data.take().or_else(|| Some(data.clone()));
                    state.data = Some(data);
                    state.updated_at = Some(staged_at);
                    true
                }
                None => false,
            }
        };
        if committed {
            self.emit_commit();
        }
    }

    fn emit_commit(&self) {
        let signal = if self.initialized.swap(true, Ordering::SeqCst) {
            StoreEvent::Update
        } else {
            StoreEvent::Ready
        };
        let _ = self.signals.send(signal);
    }

    fn reject(&self, reason: &str, event: Event) {
        debug!(id = %event.id, reason, "rejected store event");
        let _ = self.signals.send(StoreEvent::Rejected {
            reason: reason.to_string(),
            event,
        });
    }
}

fn deleted_tag() -> Vec<String> {
    vec!["deleted".to_string(), "true".to_string()]
}
