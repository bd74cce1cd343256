/// Shared types for the inbox: view models, backend wire records and events
use crate::state::InboxStatus;
use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use tracing::debug;

/// `message_type` value the backend uses for image messages
pub const IMAGE_MESSAGE_TYPE: i64 = 2;

/// Stable conversation identifier (the backend sends either strings or integers)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(pub String);

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConversationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Message identifier, unique within one conversation
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ─── View models ─────────────────────────────────────────────────────────────

/// One row of the chat list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: ConversationId,
    /// Contact name, or the phone number when the name is empty
    pub display_name: String,
    pub phone: String,
    pub avatar_url: Option<String>,
    pub last_message_preview: String,
    /// Presentation-only: "HH:MM" today, "DD/MM/YYYY" otherwise
    pub last_message_time: String,
    pub last_message_at: Option<DateTime<Utc>>,
    /// Last message came from the contact and the chat is not resolved
    pub is_unread: bool,
    /// Lazily populated; empty until the thread is fetched
    #[serde(default)]
    pub messages: Vec<Message>,
}

impl ConversationSummary {
    /// Chat-list search: case-insensitive match on name or phone
    pub fn matches(&self, query: &str) -> bool {
        let query = query.trim().to_lowercase();
        if query.is_empty() {
            return true;
        }
        self.display_name.to_lowercase().contains(&query) || self.phone.contains(&query)
    }
}

/// One message in a thread
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub text: String,
    /// Sent by the operator / tenant side
    pub is_outbound: bool,
    pub timestamp: DateTime<Utc>,
    pub is_image: bool,
    pub image_url: Option<String>,
}

/// Normalized result of one conversation fetch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversationPage {
    pub conversations: Vec<ConversationSummary>,
    pub total: usize,
    pub filtered: usize,
}

// ─── Wire records ────────────────────────────────────────────────────────────

/// Response envelope shared by every backend endpoint
#[derive(Debug, Deserialize)]
pub struct Envelope<T> {
    pub status: String,
    pub data: Option<T>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub summary: Option<RawSummary>,
}

impl<T> Envelope<T> {
    pub fn is_success(&self) -> bool {
        self.status.eq_ignore_ascii_case("success")
    }

    /// Best human-readable reason for a failed envelope
    pub fn failure_reason(&self) -> String {
        self.error
            .clone()
            .or_else(|| self.message.clone())
            .unwrap_or_else(|| format!("backend returned status \"{}\"", self.status))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawSummary {
    #[serde(default)]
    pub total_conversations: Option<usize>,
    #[serde(default)]
    pub filtered_conversations: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawConversation {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub last_message: Option<String>,
    #[serde(default)]
    pub last_reply_at: Option<String>,
    #[serde(default, deserialize_with = "de_flag")]
    pub resolved_chat: bool,
    #[serde(default, deserialize_with = "de_flag")]
    pub is_last_message_by_contact: bool,
}

impl RawConversation {
    pub fn into_summary(self, now: DateTime<Local>) -> ConversationSummary {
        let phone = self.phone.unwrap_or_default();
        let display_name = match self.name {
            Some(name) if !name.trim().is_empty() => name,
            _ => phone.clone(),
        };
        let last_message_at = self.last_reply_at.as_deref().and_then(parse_timestamp);
        let last_message_time = last_message_at
            .map(|ts| format_last_message_time(ts, now))
            .unwrap_or_default();

        ConversationSummary {
            id: ConversationId(self.id),
            display_name,
            phone,
            avatar_url: self.avatar.filter(|a| !a.is_empty()),
            last_message_preview: self.last_message.unwrap_or_default(),
            last_message_time,
            last_message_at,
            is_unread: self.is_last_message_by_contact && !self.resolved_chat,
            messages: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawMessage {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default, deserialize_with = "de_flag")]
    pub is_message_by_contact: bool,
    #[serde(default)]
    pub message_type: Option<serde_json::Value>,
    #[serde(default)]
    pub header_image: Option<String>,
}

impl RawMessage {
    fn is_image(&self) -> bool {
        match &self.message_type {
            Some(serde_json::Value::Number(n)) => n.as_i64() == Some(IMAGE_MESSAGE_TYPE),
            Some(serde_json::Value::String(s)) => s.trim() == IMAGE_MESSAGE_TYPE.to_string(),
            _ => false,
        }
    }

    pub fn into_message(self) -> Message {
        let is_image = self.is_image();
        let timestamp = match self.created_at.as_deref().and_then(parse_timestamp) {
            Some(ts) => ts,
            None => {
                debug!("message {} has no usable created_at: {:?}", self.id, self.created_at);
                DateTime::<Utc>::UNIX_EPOCH
            }
        };
        Message {
            id: MessageId(self.id),
            text: self.value.unwrap_or_default(),
            is_outbound: !self.is_message_by_contact,
            timestamp,
            is_image,
            image_url: if is_image {
                self.header_image.filter(|u| !u.is_empty())
            } else {
                None
            },
        }
    }
}

// ─── Events ──────────────────────────────────────────────────────────────────

/// State changes published to views (and streamed over the bridge's SSE)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboxEvent {
    /// The held conversation list was replaced
    ConversationsUpdated {
        total: usize,
        unread: usize,
        refreshed_at: DateTime<Utc>,
    },
    /// New or changed conversations since the last notification
    NewContent {
        conversation_ids: Vec<ConversationId>,
        notified: bool,
    },
    ActiveConversationChanged {
        conversation_id: Option<ConversationId>,
    },
    /// Thread of the active conversation changed
    MessagesUpdated {
        conversation_id: ConversationId,
        added: usize,
        scroll_to_bottom: bool,
    },
    StatusChanged { status: InboxStatus },
    /// Loading indicator of a user-triggered pass turned on or off
    LoadingChanged { loading: bool },
    MessageSent { phone: String },
    SendFailed { error: String },
    SendErrorCleared,
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

/// Accepts RFC 3339 or `YYYY-MM-DD HH:MM:SS` (taken as UTC)
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| Utc.from_utc_datetime(&naive))
}

pub fn format_last_message_time(ts: DateTime<Utc>, now: DateTime<Local>) -> String {
    let local = ts.with_timezone(&Local);
    if local.date_naive() == now.date_naive() {
        local.format("%H:%M").to_string()
    } else {
        local.format("%d/%m/%Y").to_string()
    }
}

fn de_id<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Text(String),
        Signed(i64),
        Unsigned(u64),
    }
    Ok(match RawId::deserialize(d)? {
        RawId::Text(s) => s,
        RawId::Signed(n) => n.to_string(),
        RawId::Unsigned(n) => n.to_string(),
    })
}

fn de_flag<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<bool, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawFlag {
        Bool(bool),
        Int(i64),
        Text(String),
    }
    Ok(match Option::<RawFlag>::deserialize(d)? {
        None => false,
        Some(RawFlag::Bool(b)) => b,
        Some(RawFlag::Int(n)) => n != 0,
        Some(RawFlag::Text(s)) => matches!(s.trim(), "1" | "true" | "TRUE" | "True"),
    })
}
