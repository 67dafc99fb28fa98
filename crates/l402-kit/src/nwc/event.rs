//! NIP-01 events and relay frames.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};

use super::crypto::SessionKeys;
use crate::macaroon::unix_now;

/// NIP-47 wallet request.
pub const KIND_NWC_REQUEST: u16 = 23194;
/// NIP-47 wallet response.
pub const KIND_NWC_RESPONSE: u16 = 23195;
/// NIP-47 wallet notification (settlement push).
pub const KIND_NWC_NOTIFICATION: u16 = 23196;

/// A signed Nostr event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    pub sig: String,
}

impl Event {
    /// Event id per NIP-01: sha256 of the compact JSON array
    /// `[0, pubkey, created_at, kind, tags, content]`.
    pub fn compute_id(
        pubkey: &str,
        created_at: u64,
        kind: u16,
        tags: &[Vec<String>],
        content: &str,
    ) -> [u8; 32] {
        let serialized = json!([0, pubkey, created_at, kind, tags, content]).to_string();
        Sha256::digest(serialized.as_bytes()).into()
    }

    /// First value of the first tag named `name`.
    pub fn tag(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|tag| tag.first().map(String::as_str) == Some(name))
            .and_then(|tag| tag.get(1))
            .map(String::as_str)
    }

    /// Recomputes the id and checks it against the stored one.
    pub fn id_is_valid(&self) -> bool {
        let computed = Self::compute_id(
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        );
        self.id == hex::encode(computed)
    }

    pub fn id_bytes(&self) -> Option<[u8; 32]> {
        let bytes = hex::decode(&self.id).ok()?;
        bytes.try_into().ok()
    }
}

/// Builds and signs an event with the session keypair.
pub fn build_signed(keys: &SessionKeys, kind: u16, tags: Vec<Vec<String>>, content: String) -> Event {
    let pubkey = keys.own_pubkey_hex().to_string();
    let created_at = unix_now();
    let id = Event::compute_id(&pubkey, created_at, kind, &tags, &content);
    let sig = hex::encode(keys.sign_id(&id).serialize());
    Event {
        id: hex::encode(id),
        pubkey,
        created_at,
        kind,
        tags,
        content,
        sig,
    }
}

/// Inbound relay frame.
#[derive(Debug, Clone)]
pub enum RelayMessage {
    Event { subscription: String, event: Event },
    Ok { event_id: String, accepted: bool, message: String },
    Eose(String),
    Closed { subscription: String, message: String },
    Notice(String),
    Unknown,
}

/// Parses one inbound relay frame. Returns `None` for frames that are not
/// valid JSON arrays.
pub fn parse_relay_message(raw: &str) -> Option<RelayMessage> {
    let value: Value = serde_json::from_str(raw).ok()?;
    let frame = value.as_array()?;
    match frame.first()?.as_str()? {
        "EVENT" => {
            let subscription = frame.get(1)?.as_str()?.to_string();
            let event: Event = serde_json::from_value(frame.get(2)?.clone()).ok()?;
            Some(RelayMessage::Event { subscription, event })
        }
        "OK" => Some(RelayMessage::Ok {
            event_id: frame.get(1)?.as_str()?.to_string(),
            accepted: frame.get(2)?.as_bool()?,
            message: frame
                .get(3)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        }),
        "EOSE" => Some(RelayMessage::Eose(frame.get(1)?.as_str()?.to_string())),
        "CLOSED" => Some(RelayMessage::Closed {
            subscription: frame.get(1)?.as_str()?.to_string(),
            message: frame
                .get(2)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        }),
        "NOTICE" => Some(RelayMessage::Notice(
            frame.get(1).and_then(Value::as_str).unwrap_or_default().to_string(),
        )),
        _ => Some(RelayMessage::Unknown),
    }
}

/// `["REQ", <sub_id>, <filter>]` frame.
pub fn req_frame(sub_id: &str, filter: &Value) -> String {
    json!(["REQ", sub_id, filter]).to_string()
}

/// `["EVENT", <event>]` frame.
pub fn event_frame(event: &Event) -> String {
    json!(["EVENT", event]).to_string()
}

/// `["CLOSE", <sub_id>]` frame.
pub fn close_frame(sub_id: &str) -> String {
    json!(["CLOSE", sub_id]).to_string()
}
