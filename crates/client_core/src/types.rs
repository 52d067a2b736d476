use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared::domain::{ConversationRef, MessageId, UserId};

/// Provisional identity allocated by the store for every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LocalId(pub u64);

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "local-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Outbound,
    Inbound,
}

/// `Pending → Sent → Delivered → Read`, with `Failed` as a terminal branch
/// off `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Pending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl DeliveryState {
    fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Failed => 0,
            Self::Sent => 1,
            Self::Delivered => 2,
            Self::Read => 3,
        }
    }

    /// Returns the state after observing `next`; never moves backwards and
    /// never leaves `Failed`.
    pub fn advance(self, next: DeliveryState) -> DeliveryState {
        match (self, next) {
            (Self::Failed, _) => self,
            (Self::Pending, Self::Failed) => Self::Failed,
            (_, Self::Failed) => self,
            _ if next.rank() > self.rank() => next,
            _ => self,
        }
    }

    pub fn is_confirmed(self) -> bool {
        self.rank() >= Self::Sent.rank()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// Server-side storage path returned by the upload endpoint.
    pub path: String,
    pub name: Option<String>,
    pub size_bytes: Option<u64>,
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub server_id: Option<MessageId>,
    pub local_id: LocalId,
    pub conversation: ConversationRef,
    pub sender: UserId,
    pub sender_name: Option<String>,
    pub content: String,
    pub attachment: Option<Attachment>,
    pub created_at: DateTime<Utc>,
    pub direction: Direction,
    pub delivery: DeliveryState,
    pub read: bool,
}

impl Message {
    pub fn is_unread_inbound(&self) -> bool {
        self.direction == Direction::Inbound && !self.read
    }

    pub fn attachment_path(&self) -> Option<&str> {
        self.attachment.as_ref().map(|attachment| attachment.path.as_str())
    }
}

/// A message as observed from the server: a push event or a history row.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub server_id: Option<MessageId>,
    pub sender: UserId,
    pub sender_name: Option<String>,
    pub content: String,
    pub attachment: Option<Attachment>,
    pub timestamp: DateTime<Utc>,
    /// Delivery state reported by the server for our own messages.
    pub delivery: Option<DeliveryState>,
    pub read: bool,
}

/// A local file waiting to be uploaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentUpload {
    pub file_name: String,
    pub mime_type: Option<String>,
    pub bytes: Vec<u8>,
}

/// What the user composed. Kept intact across failures for re-send.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Draft {
    pub text: String,
    pub attachment: Option<AttachmentUpload>,
}

impl Draft {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            attachment: None,
        }
    }

    pub fn with_attachment(mut self, attachment: AttachmentUpload) -> Self {
        self.attachment = Some(attachment);
        self
    }

    pub fn is_sendable(&self) -> bool {
        !self.text.trim().is_empty() || self.attachment.is_some()
    }
}

/// What gets recorded optimistically once the draft has been dispatched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub content: String,
    pub attachment: Option<Attachment>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ServerConfirmation {
    pub server_id: Option<MessageId>,
}
