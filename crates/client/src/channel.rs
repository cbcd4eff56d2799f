//! Ephemeral encrypted messaging channel.
//!
//! A [`Channel`] exchanges short-lived messages among holders of a shared
//! secret. Messages are JSON triples `[subject, hash, body]` sealed in a
//! content envelope and published as ephemeral events, and the default
//! subscription only watches the future (`since` now). There is no
//! persistence and no arbitration; every decryptable message is delivered
//! in arrival order.

use std::sync::{Arc, Mutex as StdMutex};

use nostr_sync_core::{
    Event, Filter, Signer, UnsignedEvent, combine_filters, decrypt_content, encrypt_content,
    is_envelope, is_hash, now, sha256_hex,
};
use serde_json::Value;
use tokio::sync::{Mutex, broadcast};
use tracing::debug;

use crate::error::{ClientError, Result};
use crate::socket::{Socket, SocketConfig, sign_event};
use crate::sub::Sub;

/// Event kind used for channel messages. Ephemeral: relays serve these to
/// live subscribers but do not retain them.
pub const DEFAULT_CHANNEL_KIND: u16 = 20000;

/// Capacity of the channel signal stream.
const SIGNAL_CAPACITY: usize = 128;

/// Tuning knobs for a channel.
#[derive(Clone)]
pub struct ChannelConfig {
    /// Deliver our own messages back to us.
    pub echo: bool,
    /// Event kind for channel messages.
    pub kind: u16,
    /// Extra filter constraints merged into the channel subscription.
    /// When absent, the subscription starts at the current timestamp.
    pub filter: Option<Filter>,
    /// Extra tags attached to every published message.
    pub tags: Vec<Vec<String>>,
    /// Socket to ride on. A fresh one is created at `connect` if absent.
    pub socket: Option<Socket>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            echo: false,
            kind: DEFAULT_CHANNEL_KIND,
            filter: None,
            tags: Vec::new(),
            socket: None,
        }
    }
}

/// A decrypted channel message.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelMessage {
    /// Application-defined message label.
    pub subject: String,
    /// Sender-computed hex sha256 of the body.
    pub hash: String,
    /// Message payload.
    pub body: String,
    /// Pubkey of the sender.
    pub sender: String,
    /// Timestamp of the carrying event.
    pub sent_at: u64,
}

/// Signals emitted as the channel changes state.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// The channel subscription is live.
    Ready,
    /// A message arrived and decrypted cleanly.
    Message(ChannelMessage),
    /// An inbound event was dropped before delivery.
    Rejected { reason: String, event: Event },
    /// The channel was shut down.
    Close,
}

/// Topic bindings established at `connect`.
struct ChannelTopic {
    secret: [u8; 32],
    id: String,
}

struct ChannelInner {
    echo: bool,
    kind: u16,
    tags: Vec<Vec<String>>,
    base_filter: Option<Filter>,
    signer: Arc<dyn Signer>,
    topic: StdMutex<Option<ChannelTopic>>,
    socket: Mutex<Option<Socket>>,
    sub: Mutex<Option<Sub>>,
    signals: broadcast::Sender<ChannelEvent>,
}

/// Ephemeral encrypted channel bound to a signer.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    pub fn new(signer: Arc<dyn Signer>, config: ChannelConfig) -> Self {
        let (signals, _) = broadcast::channel(SIGNAL_CAPACITY);
        Self {
            inner: Arc::new(ChannelInner {
                echo: config.echo,
                kind: config.kind,
                tags: config.tags,
                base_filter: config.filter,
                signer,
                topic: StdMutex::new(None),
                socket: Mutex::new(config.socket),
                sub: Mutex::new(None),
                signals,
            }),
        }
    }

    /// Topic id of this channel. Fails before `connect`.
    pub fn id(&self) -> Result<String> {
        let topic = self.inner.topic.lock().expect("topic lock poisoned");
        topic
            .as_ref()
            .map(|t| t.id.clone())
            .ok_or(ClientError::NotInitialized("channel topic"))
    }

    /// The shared secret, hex encoded. Fails before `connect`.
    pub fn secret(&self) -> Result<String> {
        let topic = self.inner.topic.lock().expect("topic lock poisoned");
        topic
            .as_ref()
            .map(|t| hex::encode(t.secret))
            .ok_or(ClientError::NotInitialized("channel topic"))
    }

    /// Pubkey of the bound signer.
    pub fn pubkey(&self) -> String {
        self.inner.signer.pubkey()
    }

    /// Subscribe to the channel's signal stream.
    pub fn signals(&self) -> broadcast::Receiver<ChannelEvent> {
        self.inner.signals.subscribe()
    }

    /// Bind to a topic and connect to a relay.
    ///
    /// The secret must be 64 hex characters; the topic id is the hex
    /// sha256 of the decoded secret bytes. The subscription is registered
    /// before dialing and, unless overridden by the configured filter,
    /// only watches events from the current timestamp forward.
    pub async fn connect(&self, address: &str, secret: &str) -> Result<()> {
        if !is_hash(secret) {
            return Err(ClientError::InvalidSecret(
                "secret must be 64 hex characters".to_string(),
            ));
        }
        let bytes: [u8; 32] = hex::decode(secret)
            .map_err(|e| ClientError::InvalidSecret(e.to_string()))?
            .try_into()
            .map_err(|_| ClientError::InvalidSecret("secret must be 32 bytes".to_string()))?;
        let topic_id = sha256_hex(&bytes);

        let base = self
            .inner
            .base_filter
            .clone()
            .unwrap_or_else(|| Filter::new().since(now()));
        let filter = combine_filters([
            base,
            Filter::new()
                .kinds(vec![self.inner.kind])
                .tag("d", vec![topic_id.clone()]),
        ]);

        *self.inner.topic.lock().expect("topic lock poisoned") = Some(ChannelTopic {
            secret: bytes,
            id: topic_id,
        });

        let socket = {
            let mut guard = self.inner.socket.lock().await;
            guard
                .get_or_insert_with(|| Socket::new(SocketConfig::default()))
                .clone()
        };
        let sub = socket.subscribe(filter, None).await;
        *self.inner.sub.lock().await = Some(sub.clone());

        let inner = self.inner.clone();
        tokio::spawn(async move {
            while let Some(event) = sub.recv().await {
                inner.handle_event(event);
            }
        });
        socket.connect(address).await?;
        let _ = self.inner.signals.send(ChannelEvent::Ready);
        Ok(())
    }

    /// Encrypt and publish one message to the channel.
    pub async fn send(&self, subject: &str, body: &str) -> Result<()> {
        let (secret, topic_id) = {
            let topic = self.inner.topic.lock().expect("topic lock poisoned");
            let topic = topic
                .as_ref()
                .ok_or(ClientError::NotInitialized("channel topic"))?;
            (topic.secret, topic.id.clone())
        };

        let payload = serde_json::to_string(&serde_json::json!([
            subject,
            sha256_hex(body.as_bytes()),
            body
        ]))?;
        let content = encrypt_content(&payload, &secret)?;

        let mut tags = self.inner.tags.clone();
        tags.push(vec!["d".to_string(), topic_id]);

        let unsigned = UnsignedEvent {
            pubkey: self.inner.signer.pubkey(),
            created_at: now(),
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
            .ok_or(ClientError::NotInitialized("channel socket"))?;
        socket.publish(event).await;
        Ok(())
    }

    /// Resolve with the next message carrying the given subject.
    ///
    /// Messages with other subjects are skipped. Returns `None` once the
    /// channel closes.
    pub async fn on_subject(&self, subject: &str) -> Option<ChannelMessage> {
        let mut signals = self.inner.signals.subscribe();
        loop {
            match signals.recv().await {
                Ok(ChannelEvent::Message(message)) if message.subject == subject => {
                    return Some(message);
                }
                Ok(ChannelEvent::Close) => return None,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, subject, "subject listener lagged behind");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Resolve once the channel subscription receives its
    /// end-of-stored-events marker.
    pub async fn when_ready(&self) -> Result<()> {
        let sub = self.inner.sub.lock().await.clone();
        match sub {
            Some(sub) => sub.when_ready().await,
            None => Err(ClientError::NotInitialized("channel subscription")),
        }
    }

    /// Cancel the subscription and close the socket.
    pub async fn close(&self) {
        if let Some(sub) = self.inner.sub.lock().await.take() {
            sub.cancel().await;
        }
        if let Some(socket) = self.inner.socket.lock().await.take() {
            socket.close().await;
        }
        let _ = self.inner.signals.send(ChannelEvent::Close);
    }

    #[cfg(test)]
    pub(crate) fn handle_inbound(&self, event: Event) {
        self.inner.handle_event(event);
    }
}

impl ChannelInner {
    /// Decrypt and deliver one inbound event. Runs on the subscription
    /// consumer task.
    fn handle_event(&self, event: Event) {
        if !self.echo && event.pubkey == self.signer.pubkey() {
            debug!(id = %event.id, "skipping own channel message");
            return;
        }
        let secret = {
            let topic = self.topic.lock().expect("topic lock poisoned");
            match topic.as_ref() {
                Some(topic) => topic.secret,
                None => return,
            }
        };

        if !is_envelope(&event.content) {
            self.reject("channel message is not encrypted", event);
            return;
        }
        let plaintext = match decrypt_content(&event.content, &secret) {
            Ok(plaintext) => plaintext,
            Err(_) => {
                self.reject("unable to decrypt channel message", event);
                return;
            }
        };
        let parts: Vec<Value> = match serde_json::from_str(&plaintext) {
            Ok(parts) => parts,
            Err(_) => {
                self.reject("channel message failed validation", event);
                return;
            }
        };
        let (Some(subject), Some(hash), Some(body)) = (
            parts.first().and_then(Value::as_str),
            parts.get(1).and_then(Value::as_str),
            parts.get(2).and_then(Value::as_str),
        ) else {
            self.reject("channel message failed validation", event);
            return;
        };

        let message = ChannelMessage {
            subject: subject.to_string(),
            hash: hash.to_string(),
            body: body.to_string(),
            sender: event.pubkey.clone(),
            sent_at: event.created_at,
        };
        let _ = self.signals.send(ChannelEvent::Message(message));
    }

    fn reject(&self, reason: &str, event: Event) {
        debug!(id = %event.id, reason, "rejected channel event");
        let _ = self.signals.send(ChannelEvent::Rejected {
            reason: reason.to_string(),
            event,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr_sync_core::{Keys, get_entry, verify_event};

    const SECRET: &str = "9f8e7d6c5b4a39281706f5e4d3c2b1a09f8e7d6c5b4a39281706f5e4d3c2b1a0";

    fn secret_bytes() -> [u8; 32] {
        hex::decode(SECRET).unwrap().try_into().unwrap()
    }

    fn bound_channel(echo: bool) -> Channel {
        let keys = Arc::new(Keys::generate());
        let channel = Channel::new(
            keys,
            ChannelConfig {
                echo,
                socket: Some(Socket::new(SocketConfig::default())),
                ..ChannelConfig::default()
            },
        );
        // Bind the topic without dialing.
        *channel.inner.topic.lock().unwrap() = Some(ChannelTopic {
            secret: secret_bytes(),
            id: sha256_hex(&secret_bytes()),
        });
        channel
    }

    fn message_event(keys: &Keys, subject: &str, body: &str, topic_id: &str) -> Event {
        let payload = serde_json::to_string(&serde_json::json!([
            subject,
            sha256_hex(body.as_bytes()),
            body
        ]))
        .unwrap();
        let content = encrypt_content(&payload, &secret_bytes()).unwrap();
        let unsigned = UnsignedEvent {
            pubkey: keys.pubkey(),
            created_at: now(),
            kind: DEFAULT_CHANNEL_KIND,
            tags: vec![vec!["d".to_string(), topic_id.to_string()]],
            content,
        };
        sign_event(unsigned, |digest| keys.sign(digest)).unwrap()
    }

    #[tokio::test]
    async fn test_connect_requires_valid_secret() {
        let keys = Arc::new(Keys::generate());
        let channel = Channel::new(keys, ChannelConfig::default());
        let result = channel.connect("ws://127.0.0.1:1", "nothex").await;
        assert!(matches!(result, Err(ClientError::InvalidSecret(_))));
    }

    #[tokio::test]
    async fn test_send_publishes_sealed_triple() {
        let channel = bound_channel(false);
        channel.send("greeting", "hello world").await.unwrap();

        let socket = channel.inner.socket.lock().await.clone().unwrap();
        let outbox = socket.outbox.lock().await;
        assert_eq!(outbox.len(), 1);
        let event = &outbox[0];

        assert!(verify_event(event).unwrap());
        assert_eq!(event.kind, DEFAULT_CHANNEL_KIND);
        assert!(is_envelope(&event.content));
        let d = get_entry("d", &event.tags).unwrap();
        assert_eq!(d[1], channel.id().unwrap());

        let plaintext = decrypt_content(&event.content, &secret_bytes()).unwrap();
        let parts: Vec<Value> = serde_json::from_str(&plaintext).unwrap();
        assert_eq!(parts[0], "greeting");
        assert_eq!(parts[1], sha256_hex(b"hello world"));
        assert_eq!(parts[2], "hello world");
    }

    #[tokio::test]
    async fn test_inbound_message_is_delivered() {
        let channel = bound_channel(false);
        let mut signals = channel.signals();
        let peer = Keys::generate();

        let event = message_event(&peer, "ping", "payload", &channel.id().unwrap());
        let sender = event.pubkey.clone();
        channel.handle_inbound(event);

        match signals.try_recv().unwrap() {
            ChannelEvent::Message(message) => {
                assert_eq!(message.subject, "ping");
                assert_eq!(message.body, "payload");
                assert_eq!(message.hash, sha256_hex(b"payload"));
                assert_eq!(message.sender, sender);
            }
            other => panic!("unexpected signal: {other:?}"),
        }
    }

    fn own_message(channel: &Channel) -> Event {
        let payload =
            serde_json::to_string(&serde_json::json!(["s", sha256_hex(b"b"), "b"])).unwrap();
        let content = encrypt_content(&payload, &secret_bytes()).unwrap();
        let unsigned = UnsignedEvent {
            pubkey: channel.pubkey(),
            created_at: now(),
            kind: DEFAULT_CHANNEL_KIND,
            tags: vec![],
            content,
        };
        let signer = channel.inner.signer.clone();
        sign_event(unsigned, |d| signer.sign(d)).unwrap()
    }

    #[tokio::test]
    async fn test_own_messages_skipped_unless_echo() {
        let channel = bound_channel(false);
        let mut signals = channel.signals();
        channel.handle_inbound(own_message(&channel));
        assert!(signals.try_recv().is_err());

        let echoing = bound_channel(true);
        let mut echo_signals = echoing.signals();
        echoing.handle_inbound(own_message(&echoing));
        assert!(matches!(
            echo_signals.try_recv().unwrap(),
            ChannelEvent::Message(_)
        ));
    }

    #[tokio::test]
    async fn test_on_subject_skips_other_subjects() {
        let channel = bound_channel(false);
        let peer = Keys::generate();
        let topic_id = channel.id().unwrap();

        let waiter = tokio::spawn({
            let channel = channel.clone();
            async move { channel.on_subject("wanted").await }
        });
        tokio::task::yield_now().await;

        channel.handle_inbound(message_event(&peer, "noise", "skip me", &topic_id));
        channel.handle_inbound(message_event(&peer, "wanted", "take me", &topic_id));

        let message = waiter.await.unwrap().unwrap();
        assert_eq!(message.subject, "wanted");
        assert_eq!(message.body, "take me");
    }

    #[tokio::test]
    async fn test_on_subject_resolves_none_on_close() {
        let channel = bound_channel(false);
        let waiter = tokio::spawn({
            let channel = channel.clone();
            async move { channel.on_subject("anything").await }
        });
        tokio::task::yield_now().await;

        channel.close().await;
        assert!(waiter.await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_inbound_rejections() {
        let channel = bound_channel(false);
        let mut signals = channel.signals();
        let peer = Keys::generate();

        let plain = UnsignedEvent {
            pubkey: peer.pubkey(),
            created_at: now(),
            kind: DEFAULT_CHANNEL_KIND,
            tags: vec![],
            content: "plaintext".to_string(),
        };
        channel.handle_inbound(sign_event(plain, |d| peer.sign(d)).unwrap());
        match signals.try_recv().unwrap() {
            ChannelEvent::Rejected { reason, .. } => assert!(reason.contains("not encrypted")),
            other => panic!("unexpected signal: {other:?}"),
        }

        // Valid envelope but not a [subject, hash, body] triple.
        let content = encrypt_content("{\"a\":1}", &secret_bytes()).unwrap();
        let malformed = UnsignedEvent {
            pubkey: peer.pubkey(),
            created_at: now(),
            kind: DEFAULT_CHANNEL_KIND,
            tags: vec![],
            content,
        };
        channel.handle_inbound(sign_event(malformed, |d| peer.sign(d)).unwrap());
        match signals.try_recv().unwrap() {
            ChannelEvent::Rejected { reason, .. } => assert!(reason.contains("validation")),
            other => panic!("unexpected signal: {other:?}"),
        }
    }
}
