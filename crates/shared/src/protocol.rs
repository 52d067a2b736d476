use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::domain::{GroupId, MessageId, UserId};

/// Frames the client pushes over the event channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ClientFrame {
    PrivateMessage(PrivateMessageOut),
    GroupMessage(GroupMessageOut),
    TypingStart(TypingTarget),
    TypingStop(TypingTarget),
    MarkGroupMessagesRead(GroupRef),
}

impl ClientFrame {
    pub fn name(&self) -> &'static str {
        match self {
            Self::PrivateMessage(_) => "privateMessage",
            Self::GroupMessage(_) => "groupMessage",
            Self::TypingStart(_) => "typingStart",
            Self::TypingStop(_) => "typingStop",
            Self::MarkGroupMessagesRead(_) => "markGroupMessagesRead",
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrivateMessageOut {
    pub recipient_id: UserId,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupMessageOut {
    pub group_id: GroupId,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingTarget {
    pub to: UserId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingSource {
    pub from: UserId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupRef {
    pub group_id: GroupId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    PrivateMessageReceived,
    GroupMessageReceived,
    TypingStart,
    TypingStop,
    UserStatusChange,
    InitialFriendsStatus,
    GroupMessagesRead,
    GroupMessageError,
    Unauthorized,
    DuplicateConnection,
}

impl EventKind {
    pub const ALL: [EventKind; 10] = [
        EventKind::PrivateMessageReceived,
        EventKind::GroupMessageReceived,
        EventKind::TypingStart,
        EventKind::TypingStop,
        EventKind::UserStatusChange,
        EventKind::InitialFriendsStatus,
        EventKind::GroupMessagesRead,
        EventKind::GroupMessageError,
        EventKind::Unauthorized,
        EventKind::DuplicateConnection,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::PrivateMessageReceived => "privateMessageReceived",
            Self::GroupMessageReceived => "groupMessageReceived",
            Self::TypingStart => "typingStart",
            Self::TypingStop => "typingStop",
            Self::UserStatusChange => "userStatusChange",
            Self::InitialFriendsStatus => "initialFriendsStatus",
            Self::GroupMessagesRead => "groupMessagesRead",
            Self::GroupMessageError => "groupMessageError",
            Self::Unauthorized => "unauthorized",
            Self::DuplicateConnection => "duplicateConnection",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }
}

/// Events pushed by the server. Decoded at the channel boundary with
/// [`decode_server_frame`]; the serialized form is the same envelope.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerEvent {
    PrivateMessageReceived(PrivateMessageIn),
    GroupMessageReceived(GroupMessageIn),
    TypingStart(TypingSource),
    TypingStop(TypingSource),
    UserStatusChange(StatusChange),
    InitialFriendsStatus(Vec<FriendStatus>),
    GroupMessagesRead(GroupRef),
    GroupMessageError(GroupMessageFailure),
    Unauthorized(Notice),
    DuplicateConnection(Notice),
}

impl ServerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::PrivateMessageReceived(_) => EventKind::PrivateMessageReceived,
            Self::GroupMessageReceived(_) => EventKind::GroupMessageReceived,
            Self::TypingStart(_) => EventKind::TypingStart,
            Self::TypingStop(_) => EventKind::TypingStop,
            Self::UserStatusChange(_) => EventKind::UserStatusChange,
            Self::InitialFriendsStatus(_) => EventKind::InitialFriendsStatus,
            Self::GroupMessagesRead(_) => EventKind::GroupMessagesRead,
            Self::GroupMessageError(_) => EventKind::GroupMessageError,
            Self::Unauthorized(_) => EventKind::Unauthorized,
            Self::DuplicateConnection(_) => EventKind::DuplicateConnection,
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrivateMessageIn {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,
    pub from: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_name: Option<String>,
    #[serde(default)]
    pub message: String,
    #[serde(
        default,
        deserialize_with = "lenient_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupMessageIn {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,
    pub group_id: GroupId,
    #[serde(deserialize_with = "sender_id")]
    pub from: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_name: Option<String>,
    #[serde(default)]
    pub message: String,
    #[serde(
        default,
        deserialize_with = "lenient_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusChange {
    pub user_id: UserId,
    pub is_online: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FriendStatus {
    pub id: UserId,
    pub is_online: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupMessageFailure {
    pub group_id: GroupId,
    #[serde(default)]
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("unknown event `{0}`")]
    UnknownEvent(String),
    #[error("invalid payload for `{event}`: {source}")]
    InvalidPayload {
        event: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Deserialize)]
struct RawFrame {
    event: String,
    #[serde(default)]
    data: Value,
}

/// Decodes one text frame into a typed event.
pub fn decode_server_frame(text: &str) -> Result<ServerEvent, FrameError> {
    let raw: RawFrame = serde_json::from_str(text).map_err(FrameError::Malformed)?;
    let kind = EventKind::from_name(&raw.event).ok_or(FrameError::UnknownEvent(raw.event))?;
    let data = raw.data;

    let event = match kind {
        EventKind::PrivateMessageReceived => {
            ServerEvent::PrivateMessageReceived(payload(kind, data)?)
        }
        EventKind::GroupMessageReceived => ServerEvent::GroupMessageReceived(payload(kind, data)?),
        EventKind::TypingStart => ServerEvent::TypingStart(payload(kind, data)?),
        EventKind::TypingStop => ServerEvent::TypingStop(payload(kind, data)?),
        EventKind::UserStatusChange => ServerEvent::UserStatusChange(payload(kind, data)?),
        EventKind::InitialFriendsStatus => ServerEvent::InitialFriendsStatus(payload(kind, data)?),
        EventKind::GroupMessagesRead => ServerEvent::GroupMessagesRead(payload(kind, data)?),
        EventKind::GroupMessageError => ServerEvent::GroupMessageError(payload(kind, data)?),
        EventKind::Unauthorized => ServerEvent::Unauthorized(notice(data)),
        EventKind::DuplicateConnection => ServerEvent::DuplicateConnection(notice(data)),
    };
    Ok(event)
}

fn payload<T: DeserializeOwned>(kind: EventKind, data: Value) -> Result<T, FrameError> {
    serde_json::from_value(data).map_err(|source| FrameError::InvalidPayload {
        event: kind.name(),
        source,
    })
}

fn notice(data: Value) -> Notice {
    match data {
        Value::String(message) => Notice {
            message: Some(message),
        },
        other => serde_json::from_value(other).unwrap_or_default(),
    }
}

fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(raw)) => DateTime::parse_from_rfc3339(&raw)
            .ok()
            .map(|parsed| parsed.with_timezone(&Utc)),
        Some(Value::Number(millis)) => millis
            .as_i64()
            .and_then(DateTime::<Utc>::from_timestamp_millis),
        _ => None,
    })
}

fn sender_id<'de, D>(deserializer: D) -> Result<UserId, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum SenderRepr {
        Id(UserId),
        Member { id: UserId },
    }

    Ok(match SenderRepr::deserialize(deserializer)? {
        SenderRepr::Id(id) | SenderRepr::Member { id } => id,
    })
}

// REST payloads.

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FriendsResponse {
    #[serde(default)]
    pub friends: Vec<FriendSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FriendSummary {
    pub friend_details: FriendDetails,
    #[serde(default)]
    pub messages: Vec<HistoryMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unread_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_online: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FriendDetails {
    pub id: UserId,
    pub name: String,
    #[serde(default)]
    pub user_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

/// A 1:1 message as embedded in the friend list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,
    #[serde(default)]
    pub content: String,
    #[serde(
        default,
        deserialize_with = "lenient_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub timestamp: Option<DateTime<Utc>>,
    pub is_sent: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_read: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_delivered: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupMember {
    pub id: UserId,
    pub name: String,
    #[serde(default)]
    pub user_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupSummary {
    pub id: GroupId,
    pub name: String,
    /// Members in server-defined order.
    #[serde(default)]
    pub users: Vec<GroupMember>,
    #[serde(default)]
    pub chats: Vec<GroupMessageRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupInfo {
    pub id: GroupId,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupMessageRecord {
    pub id: MessageId,
    #[serde(default)]
    pub content: String,
    #[serde(
        rename = "timeStamp",
        default,
        deserialize_with = "lenient_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub read: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    pub from: GroupMember,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<GroupInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub file_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileUrlResponse {
    pub url: String,
}
