use std::collections::BTreeMap;

use crate::domain::Jid;

/// Everything the session collaborator can tell us, in arrival order.
#[derive(Clone, Debug)]
pub enum SessionEvent {
    /// Protocol version negotiated at bootstrap.
    Version(VersionInfo),
    ConnectionUpdate(ConnectionUpdate),
    MessagesUpsert(MessagesUpsert),
    CredentialsUpdate(CredentialUpdate),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionInfo {
    pub version: Vec<u32>,
    pub is_latest: bool,
}

impl VersionInfo {
    pub fn dotted(&self) -> String {
        self.version
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join(".")
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

/// Why the connection closed, as reported by the session collaborator.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DisconnectInfo {
    pub status_code: Option<u16>,
    pub message: Option<String>,
}

/// One connection-state transition. Any field may be absent.
#[derive(Clone, Debug, Default)]
pub struct ConnectionUpdate {
    pub connection: Option<ConnectionState>,
    pub last_disconnect: Option<DisconnectInfo>,
    /// Pairing payload to show the operator (QR contents).
    pub qr: Option<String>,
}

impl ConnectionUpdate {
    pub fn state(connection: ConnectionState) -> Self {
        Self {
            connection: Some(connection),
            ..Self::default()
        }
    }

    pub fn closed(status_code: Option<u16>, message: Option<&str>) -> Self {
        Self {
            connection: Some(ConnectionState::Closed),
            last_disconnect: Some(DisconnectInfo {
                status_code,
                message: message.map(str::to_string),
            }),
            qr: None,
        }
    }
}

/// Notification tag on a message batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UpsertKind {
    /// A new message delivered live.
    Notify,
    /// History sync or self-sent message.
    Append,
    Other(String),
}

impl UpsertKind {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "notify" => Self::Notify,
            "append" => Self::Append,
            other => Self::Other(other.to_string()),
        }
    }
}

#[derive(Clone, Debug)]
pub struct MessagesUpsert {
    pub kind: UpsertKind,
    pub messages: Vec<InboundMessage>,
}

/// A single inbound message. Only the fields the dispatcher reads are modeled.
#[derive(Clone, Debug, Default)]
pub struct InboundMessage {
    pub sender: Option<Jid>,
    /// `None` when the message carries no content payload (e.g. protocol stubs).
    pub content: Option<MessageContent>,
}

#[derive(Clone, Debug, Default)]
pub struct MessageContent {
    /// Plain conversational text.
    pub conversation: Option<String>,
    /// Text of an extended (formatted / link preview / quoted) message.
    pub extended_text: Option<String>,
}

impl InboundMessage {
    pub fn text(sender: &str, text: &str) -> Self {
        Self {
            sender: Some(Jid(sender.to_string())),
            content: Some(MessageContent {
                conversation: Some(text.to_string()),
                extended_text: None,
            }),
        }
    }

    /// Conversation text first, extended text as fallback. Empty strings count as absent.
    pub fn text_content(&self) -> Option<&str> {
        let content = self.content.as_ref()?;
        content
            .conversation
            .as_deref()
            .filter(|s| !s.is_empty())
            .or_else(|| content.extended_text.as_deref().filter(|s| !s.is_empty()))
    }
}

/// Opaque authentication material pushed by the session collaborator.
///
/// `keys` entries mapped to `None` must be removed from the store.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CredentialUpdate {
    pub creds: Option<serde_json::Value>,
    pub keys: BTreeMap<String, Option<serde_json::Value>>,
}

/// Everything the store holds for one paired device.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Credentials {
    pub creds: Option<serde_json::Value>,
    pub keys: BTreeMap<String, serde_json::Value>,
}

impl Credentials {
    pub fn is_empty(&self) -> bool {
        self.creds.is_none() && self.keys.is_empty()
    }
}
