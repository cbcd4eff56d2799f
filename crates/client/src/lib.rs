//! Relay client engine: socket, subscriptions, encrypted stores, and
//! ephemeral channels.
//!
//! The [`Socket`] owns one relay connection and multiplexes subscriptions
//! over it, buffering published events while disconnected. A [`Sub`] drains
//! one subscription's event stream. On top of the socket sit two encrypted
//! surfaces bound to a shared secret: the [`Store`], which replicates one
//! JSON value with last-write-wins arbitration, and the [`Channel`], which
//! delivers ephemeral messages with no persistence.

mod channel;
mod error;
mod message;
mod socket;
mod store;
mod sub;

pub use channel::{
    Channel, ChannelConfig, ChannelEvent, ChannelMessage, DEFAULT_CHANNEL_KIND,
};
pub use error::{ClientError, MessageError, Result};
pub use message::{ClientMessage, RelayMessage};
pub use socket::{Receipt, Socket, SocketConfig, SocketEvent, sign_event};
pub use store::{
    DEFAULT_STORE_KIND, Store, StoreConfig, StoreEvent, StoreRecord,
};
pub use sub::{Sub, SubState};
