use chrono::{DateTime, Utc};

/// A conversation partner as returned by the contact listing.
#[derive(Debug, Clone, PartialEq)]
pub struct Contact {
    pub id: i64,
    pub name: String,
    pub avatar: Option<String>,
    /// Preview of the newest message, when the server sends one.
    pub last_message: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub unread: Option<u32>,
    /// Server-assigned room key when a conversation already exists. Filled
    /// in with the locally derived key after a contact refresh, so callers
    /// can always address the room.
    pub room_key: Option<String>,
}

/// One entry in a conversation: either a canonical server record or a
/// locally-echoed send that is still waiting for one.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Server id for confirmed records, `local-<uuid>` for echoes.
    pub id: String,
    pub room_key: String,
    pub sender_id: i64,
    pub text: Option<String>,
    pub attachment: Option<Attachment>,
    pub sent_at: DateTime<Utc>,
    /// True for messages this client created optimistically.
    pub local_echo: bool,
    pub delivery: DeliveryState,
    /// Store-assigned insertion order for local echoes, 0 for server
    /// records. Breaks timestamp ties between echoes that have no stable
    /// server id yet.
    pub local_seq: u64,
}

/// Reference to an uploaded file, carried inside a message.
#[derive(Debug, Clone, PartialEq)]
pub struct Attachment {
    pub url: String,
    pub kind: AttachmentKind,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AttachmentKind {
    Image,
    File,
}

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum DeliveryState {
    Pending,   // Local echo, transport not answered yet
    Sent,      // Accepted by the server, canonical record still outstanding
    Failed,    // Send rejected, kept visible so the user can retry
    Confirmed, // Canonical server record
}

impl DeliveryState {
    /// A local echo still waiting for its server counterpart.
    pub fn awaiting_server(&self) -> bool {
        matches!(self, DeliveryState::Pending | DeliveryState::Sent)
    }
}

/// Which side of the two-party relationship this session acts as. Each role
/// sees the opposite side as its contacts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Role {
    Seeker,
    Provider,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Seeker => "seeker",
            Role::Provider => "provider",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "seeker" => Ok(Role::Seeker),
            "provider" => Ok(Role::Provider),
            other => Err(format!(
                "unknown role '{}', expected 'seeker' or 'provider'",
                other
            )),
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
