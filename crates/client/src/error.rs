//! Error taxonomy for the client engine.

use nostr_sync_core::{EnvelopeError, EventError, KeyWrapError, SignerError};
use thiserror::Error;

/// Errors surfaced by the socket, subscriptions, stores, and channels.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The connection retry budget ran out without a completed handshake.
    #[error("connection attempt timed out")]
    ConnectTimeout,

    /// No receipt arrived for a published event within the receipt window.
    #[error("timed out waiting for receipt of event {id}")]
    ReceiptTimeout { id: String },

    /// No end-of-stored-events marker arrived for a subscription in time.
    #[error("timed out waiting for subscription {sub_id}")]
    SubscribeTimeout { sub_id: String },

    /// No relay-side cancellation acknowledgement arrived in time.
    #[error("timed out waiting for cancellation of subscription {sub_id}")]
    CancelTimeout { sub_id: String },

    /// The relay refused a published event.
    #[error("event {id} rejected by relay: {reason}")]
    PublishRejected { id: String, reason: String },

    /// An operation needed a live transport and none was available.
    #[error("socket is not connected")]
    NotConnected,

    /// The relay address could not be parsed or uses an unsupported scheme.
    #[error("invalid relay address: {0}")]
    InvalidAddress(String),

    /// The websocket transport failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// A shared secret failed validation.
    #[error("invalid secret: {0}")]
    InvalidSecret(String),

    /// State was read before the component finished initializing.
    #[error("not initialized: {0}")]
    NotInitialized(&'static str),

    /// A local update carried a timestamp older than current state.
    #[error("stale timestamp: {incoming} is older than {current}")]
    StaleTimestamp { incoming: u64, current: u64 },

    #[error("message error: {0}")]
    Message(#[from] MessageError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("event error: {0}")]
    Event(#[from] EventError),

    #[error("signer error: {0}")]
    Signer(#[from] SignerError),

    #[error("envelope error: {0}")]
    Envelope(#[from] EnvelopeError),

    #[error("key wrap error: {0}")]
    KeyWrap(#[from] KeyWrapError),
}

/// Errors from encoding or decoding wire messages.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("invalid message json: {0}")]
    InvalidJson(String),

    #[error("message is not a json array")]
    NotAnArray,

    #[error("message is missing required fields")]
    MissingFields,

    #[error("unknown message type: {0}")]
    UnknownType(String),
}

pub type Result<T> = std::result::Result<T, ClientError>;
