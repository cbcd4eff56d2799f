//! Wire messages exchanged with a relay.
//!
//! Every frame is a JSON array whose first element names the message type.
//! Client to relay: `EVENT`, `REQ`, `CLOSE`. Relay to client: `EVENT`,
//! `OK`, `EOSE`, `CLOSED`, `NOTICE`.

use nostr_sync_core::{Event, Filter};
use serde_json::{Value, json};

use crate::error::MessageError;

/// Messages sent from the client to a relay.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// Publish an event: `["EVENT", <event>]`
    Event(Event),
    /// Open or update a subscription: `["REQ", <sub_id>, <filter>]`
    Req { sub_id: String, filter: Filter },
    /// Cancel a subscription: `["CLOSE", <sub_id>]`
    Close { sub_id: String },
}

impl ClientMessage {
    pub fn to_json(&self) -> Result<String, MessageError> {
        let value = match self {
            ClientMessage::Event(event) => {
                json!(["EVENT", event])
            }
            ClientMessage::Req { sub_id, filter } => {
                json!(["REQ", sub_id, filter])
            }
            ClientMessage::Close { sub_id } => {
                json!(["CLOSE", sub_id])
            }
        };
        serde_json::to_string(&value).map_err(|e| MessageError::InvalidJson(e.to_string()))
    }
}

/// Messages received from a relay.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    /// An event matching a subscription: `["EVENT", <sub_id>, <event>]`
    Event { sub_id: String, event: Event },
    /// Receipt for a published event: `["OK", <event_id>, <ok>, <reason>]`
    Ok {
        event_id: String,
        accepted: bool,
        reason: String,
    },
    /// End of stored events for a subscription: `["EOSE", <sub_id>]`
    Eose { sub_id: String },
    /// Relay-side subscription teardown: `["CLOSED", <sub_id>, <reason>]`
    Closed { sub_id: String, reason: String },
    /// Human-readable relay notice: `["NOTICE", <message>]`
    Notice { message: String },
}

impl RelayMessage {
    pub fn from_json(json: &str) -> Result<Self, MessageError> {
        let value: Value =
            serde_json::from_str(json).map_err(|e| MessageError::InvalidJson(e.to_string()))?;
        let array = value.as_array().ok_or(MessageError::NotAnArray)?;
        let kind = array
            .first()
            .and_then(Value::as_str)
            .ok_or(MessageError::MissingFields)?;

        match kind {
            "EVENT" => {
                let sub_id = str_at(array, 1)?;
                let event = array.get(2).ok_or(MessageError::MissingFields)?;
                let event: Event = serde_json::from_value(event.clone())
                    .map_err(|e| MessageError::InvalidJson(e.to_string()))?;
                Ok(RelayMessage::Event { sub_id, event })
            }
            "OK" => {
                let event_id = str_at(array, 1)?;
                let accepted = array
                    .get(2)
                    .and_then(Value::as_bool)
                    .ok_or(MessageError::MissingFields)?;
                let reason = str_at(array, 3).unwrap_or_default();
                Ok(RelayMessage::Ok {
                    event_id,
                    accepted,
                    reason,
                })
            }
            "EOSE" => {
                let sub_id = str_at(array, 1)?;
                Ok(RelayMessage::Eose { sub_id })
            }
            "CLOSED" => {
                let sub_id = str_at(array, 1)?;
                let reason = str_at(array, 2).unwrap_or_default();
                Ok(RelayMessage::Closed { sub_id, reason })
            }
            "NOTICE" => {
                let message = str_at(array, 1)?;
                Ok(RelayMessage::Notice { message })
            }
            other => Err(MessageError::UnknownType(other.to_string())),
        }
    }
}

fn str_at(array: &[Value], index: usize) -> Result<String, MessageError> {
    array
        .get(index)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or(MessageError::MissingFields)
}
