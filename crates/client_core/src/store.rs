//! Canonical per-conversation message sequences.
//!
//! Every message gets a [`LocalId`] from a session-wide counter. Merging is
//! keyed on the server id when both sides carry one; otherwise an entry with
//! the same sender, text and attachment path inside the recency window is
//! treated as the same message.

use std::{
    collections::HashMap,
    time::Duration,
};

use chrono::{DateTime, Utc};
use shared::{
    domain::{ConversationRef, UserId},
    protocol::{GroupMessageIn, GroupMessageRecord, HistoryMessage, PrivateMessageIn},
};
use tracing::{debug, warn};

use crate::{
    error::SyncError,
    types::{
        Attachment, DeliveryState, Direction, InboundMessage, LocalId, Message, OutgoingMessage,
        ServerConfirmation,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Appended(LocalId),
    /// A provisional entry picked up its server identity.
    Reconciled(LocalId),
    /// A duplicate delivery of something already stored.
    Updated(LocalId),
}

/// What a history page changed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HistoryMerge {
    pub appended: usize,
    /// Provisional sends the page confirmed.
    pub reconciled: Vec<LocalId>,
}

impl MergeOutcome {
    pub fn local_id(self) -> LocalId {
        match self {
            Self::Appended(id) | Self::Reconciled(id) | Self::Updated(id) => id,
        }
    }

    pub fn is_new(self) -> bool {
        matches!(self, Self::Appended(_))
    }
}

#[derive(Debug)]
pub struct ConversationStore {
    self_id: UserId,
    recency_window_ms: i64,
    next_local_id: u64,
    conversations: HashMap<ConversationRef, Vec<Message>>,
    // Our own live-pushed messages that arrived before any provisional
    // entry claimed them, with their server timestamps.
    unclaimed_echoes: HashMap<LocalId, DateTime<Utc>>,
}

impl ConversationStore {
    pub fn new(self_id: UserId, recency_window: Duration) -> Self {
        Self {
            self_id,
            recency_window_ms: i64::try_from(recency_window.as_millis()).unwrap_or(i64::MAX),
            next_local_id: 0,
            conversations: HashMap::new(),
            unclaimed_echoes: HashMap::new(),
        }
    }

    pub fn self_id(&self) -> UserId {
        self.self_id
    }

    pub fn allocate_local_id(&mut self) -> LocalId {
        self.next_local_id += 1;
        LocalId(self.next_local_id)
    }

    /// Merges a server-observed message. Never rejects: an empty inbound
    /// message is still stored because the sender already committed it.
    pub fn append_inbound(
        &mut self,
        conversation: ConversationRef,
        inbound: InboundMessage,
    ) -> MergeOutcome {
        self.merge(conversation, inbound, true)
    }

    fn merge(
        &mut self,
        conversation: ConversationRef,
        inbound: InboundMessage,
        live: bool,
    ) -> MergeOutcome {
        let window_ms = self.recency_window_ms;
        let messages = self.conversations.entry(conversation).or_default();

        let by_server_id = inbound
            .server_id
            .and_then(|id| messages.iter().position(|m| m.server_id == Some(id)));

        if let Some(index) = by_server_id {
            if messages[index].sender == inbound.sender {
                let existing = &mut messages[index];
                let was_pending = existing.delivery == DeliveryState::Pending;
                absorb(existing, inbound);
                return if was_pending {
                    MergeOutcome::Reconciled(existing.local_id)
                } else {
                    MergeOutcome::Updated(existing.local_id)
                };
            }
            let conflict = SyncError::MergeConflict {
                conversation,
                detail: format!(
                    "server id already held by sender {}, re-delivered from {}",
                    messages[index].sender, inbound.sender
                ),
            };
            warn!(conversation = %conversation, "store: {conflict}; appending");
        } else if let Some(index) = recent_match(messages, &inbound, window_ms) {
            let existing = &mut messages[index];
            let was_pending = existing.delivery == DeliveryState::Pending;
            absorb(existing, inbound);
            return if was_pending {
                MergeOutcome::Reconciled(existing.local_id)
            } else {
                MergeOutcome::Updated(existing.local_id)
            };
        }

        self.next_local_id += 1;
        let local_id = LocalId(self.next_local_id);
        let direction = if inbound.sender == self.self_id {
            Direction::Outbound
        } else {
            Direction::Inbound
        };
        let delivery = match direction {
            Direction::Outbound => inbound.delivery.unwrap_or(DeliveryState::Sent),
            Direction::Inbound => inbound.delivery.unwrap_or(DeliveryState::Delivered),
        };
        if live && direction == Direction::Outbound {
            self.unclaimed_echoes.insert(local_id, inbound.timestamp);
        }
        messages.push(Message {
            server_id: inbound.server_id,
            local_id,
            conversation,
            sender: inbound.sender,
            sender_name: inbound.sender_name,
            content: inbound.content,
            attachment: inbound.attachment,
            created_at: inbound.timestamp,
            direction,
            delivery,
            read: inbound.read || direction == Direction::Outbound,
        });
        MergeOutcome::Appended(local_id)
    }

    /// Appends a `pending` outbound entry and returns its provisional id.
    pub fn record_optimistic_send(
        &mut self,
        conversation: ConversationRef,
        outgoing: OutgoingMessage,
    ) -> Result<LocalId, SyncError> {
        self.record_optimistic_send_at(conversation, outgoing, Utc::now())
    }

    pub(crate) fn record_optimistic_send_at(
        &mut self,
        conversation: ConversationRef,
        outgoing: OutgoingMessage,
        now: DateTime<Utc>,
    ) -> Result<LocalId, SyncError> {
        if outgoing.content.trim().is_empty() && outgoing.attachment.is_none() {
            return Err(SyncError::InvalidMessage);
        }

        let window_ms = self.recency_window_ms;
        self.unclaimed_echoes
            .retain(|_, created_at| within(*created_at, now, window_ms));
        let attachment_path = outgoing.attachment.as_ref().map(|a| a.path.clone());
        let echoed = self.conversations.get(&conversation).and_then(|messages| {
            messages
                .iter()
                .find(|m| {
                    self.unclaimed_echoes.contains_key(&m.local_id)
                        && m.content == outgoing.content
                        && m.attachment_path() == attachment_path.as_deref()
                        && within(m.created_at, now, window_ms)
                })
                .map(|m| m.local_id)
        });
        if let Some(local_id) = echoed {
            self.unclaimed_echoes.remove(&local_id);
            debug!(conversation = %conversation, %local_id, "store: send already echoed");
            return Ok(local_id);
        }

        let local_id = self.allocate_local_id();
        self.conversations
            .entry(conversation)
            .or_default()
            .push(Message {
                server_id: None,
                local_id,
                conversation,
                sender: self.self_id,
                sender_name: None,
                content: outgoing.content,
                attachment: outgoing.attachment,
                created_at: now,
                direction: Direction::Outbound,
                delivery: DeliveryState::Pending,
                read: true,
            });
        Ok(local_id)
    }

    /// `pending → sent` on confirmation, `pending → failed` otherwise.
    pub fn reconcile(
        &mut self,
        local_id: LocalId,
        outcome: Result<ServerConfirmation, String>,
    ) -> Result<DeliveryState, SyncError> {
        let message = self
            .find_mut(local_id)
            .ok_or(SyncError::UnknownMessage(local_id))?;
        match outcome {
            Ok(confirmation) => {
                if message.server_id.is_none() {
                    message.server_id = confirmation.server_id;
                }
                message.delivery = message.delivery.advance(DeliveryState::Sent);
            }
            Err(reason) => {
                message.delivery = message.delivery.advance(DeliveryState::Failed);
                warn!(
                    conversation = %message.conversation,
                    %local_id,
                    "store: send failed: {reason}"
                );
            }
        }
        Ok(message.delivery)
    }

    /// Marks every inbound message read; returns how many changed.
    pub fn mark_read(&mut self, conversation: ConversationRef) -> usize {
        let Some(messages) = self.conversations.get_mut(&conversation) else {
            return 0;
        };
        let mut changed = 0;
        for message in messages.iter_mut().filter(|m| m.is_unread_inbound()) {
            message.read = true;
            changed += 1;
        }
        changed
    }

    /// Server-side read sync: inbound entries become read and our own
    /// confirmed entries advance to `read`.
    pub fn apply_read_receipt(&mut self, conversation: ConversationRef) -> usize {
        let mut changed = self.mark_read(conversation);
        if let Some(messages) = self.conversations.get_mut(&conversation) {
            for message in messages
                .iter_mut()
                .filter(|m| m.direction == Direction::Outbound && m.delivery.is_confirmed())
            {
                if message.delivery != DeliveryState::Read {
                    message.delivery = DeliveryState::Read;
                    changed += 1;
                }
            }
        }
        changed
    }

    pub fn unread_count(&self, conversation: ConversationRef) -> usize {
        self.messages(conversation)
            .iter()
            .filter(|m| m.is_unread_inbound())
            .count()
    }

    /// Merges a fetched page, then re-sorts by timestamp to repair gaps left
    /// by tail-appends across a reconnect.
    pub fn apply_history(
        &mut self,
        conversation: ConversationRef,
        history: Vec<InboundMessage>,
    ) -> HistoryMerge {
        let mut merged = HistoryMerge::default();
        for message in history {
            match self.merge(conversation, message, false) {
                MergeOutcome::Appended(_) => merged.appended += 1,
                MergeOutcome::Reconciled(local_id) => merged.reconciled.push(local_id),
                MergeOutcome::Updated(_) => {}
            }
        }
        if let Some(messages) = self.conversations.get_mut(&conversation) {
            messages.sort_by_key(|m| m.created_at);
        }
        merged
    }

    pub fn remove(&mut self, local_id: LocalId) -> Option<Message> {
        self.unclaimed_echoes.remove(&local_id);
        for messages in self.conversations.values_mut() {
            if let Some(index) = messages.iter().position(|m| m.local_id == local_id) {
                return Some(messages.remove(index));
            }
        }
        None
    }

    pub fn find(&self, local_id: LocalId) -> Option<&Message> {
        self.conversations
            .values()
            .flat_map(|messages| messages.iter())
            .find(|m| m.local_id == local_id)
    }

    fn find_mut(&mut self, local_id: LocalId) -> Option<&mut Message> {
        self.conversations
            .values_mut()
            .flat_map(|messages| messages.iter_mut())
            .find(|m| m.local_id == local_id)
    }

    /// For a self-echo that does not name its recipient: the direct
    /// conversation holding a matching pending send, if any.
    pub fn locate_pending_echo(
        &self,
        content: &str,
        attachment_path: Option<&str>,
        timestamp: DateTime<Utc>,
    ) -> Option<ConversationRef> {
        self.conversations
            .iter()
            .filter(|(conversation, _)| matches!(conversation, ConversationRef::Direct(_)))
            .flat_map(|(_, messages)| messages.iter())
            .filter(|m| {
                m.delivery == DeliveryState::Pending
                    && m.content == content
                    && m.attachment_path() == attachment_path
                    && within(m.created_at, timestamp, self.recency_window_ms)
            })
            .min_by_key(|m| m.local_id)
            .map(|m| m.conversation)
    }

    pub fn oldest_pending(&self, conversation: ConversationRef) -> Option<LocalId> {
        self.messages(conversation)
            .iter()
            .find(|m| m.direction == Direction::Outbound && m.delivery == DeliveryState::Pending)
            .map(|m| m.local_id)
    }

    pub fn messages(&self, conversation: ConversationRef) -> &[Message] {
        self.conversations
            .get(&conversation)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn last_message(&self, conversation: ConversationRef) -> Option<&Message> {
        self.messages(conversation).last()
    }

    pub fn conversations(&self) -> impl Iterator<Item = ConversationRef> + '_ {
        self.conversations.keys().copied()
    }

    pub fn clear(&mut self) {
        self.conversations.clear();
        self.unclaimed_echoes.clear();
    }
}

fn within(a: DateTime<Utc>, b: DateTime<Utc>, window_ms: i64) -> bool {
    (a - b).num_milliseconds().abs() <= window_ms
}

fn recent_match(messages: &[Message], inbound: &InboundMessage, window_ms: i64) -> Option<usize> {
    let attachment_path = inbound.attachment.as_ref().map(|a| a.path.as_str());
    let candidates = messages.iter().enumerate().filter(|(_, m)| {
        m.delivery != DeliveryState::Failed
            && m.sender == inbound.sender
            && m.content == inbound.content
            && m.attachment_path() == attachment_path
            && !(m.server_id.is_some() && inbound.server_id.is_some())
            && within(m.created_at, inbound.timestamp, window_ms)
    });

    let mut fallback = None;
    for (index, message) in candidates {
        if message.delivery == DeliveryState::Pending {
            return Some(index);
        }
        fallback.get_or_insert(index);
    }
    fallback
}

fn absorb(existing: &mut Message, inbound: InboundMessage) {
    if existing.server_id.is_none() {
        existing.server_id = inbound.server_id;
    }
    let observed = match existing.direction {
        Direction::Outbound => inbound.delivery.unwrap_or(DeliveryState::Sent),
        Direction::Inbound => inbound.delivery.unwrap_or(DeliveryState::Delivered),
    };
    existing.delivery = existing.delivery.advance(observed);
    existing.read |= inbound.read;
    if existing.sender_name.is_none() {
        existing.sender_name = inbound.sender_name;
    }
    if existing.attachment.is_none() {
        existing.attachment = inbound.attachment;
    }
}

fn attachment(
    path: Option<String>,
    name: Option<String>,
    size_bytes: Option<u64>,
    mime_type: Option<String>,
) -> Option<Attachment> {
    let path = path.filter(|path| !path.is_empty())?;
    Some(Attachment {
        path,
        name,
        size_bytes,
        mime_type,
    })
}

impl InboundMessage {
    /// `received_at` stands in for a missing or unparseable timestamp.
    pub fn from_private(event: PrivateMessageIn, received_at: DateTime<Utc>) -> Self {
        Self {
            server_id: event.id,
            sender: event.from,
            sender_name: event.from_name,
            content: event.message,
            attachment: attachment(event.file_path, event.file_name, event.file_size, event.file_type),
            timestamp: event.timestamp.unwrap_or(received_at),
            delivery: None,
            read: false,
        }
    }

    pub fn from_group(event: GroupMessageIn, received_at: DateTime<Utc>) -> Self {
        Self {
            server_id: event.id,
            sender: event.from,
            sender_name: event.from_name,
            content: event.message,
            attachment: attachment(event.file_path, event.file_name, event.file_size, event.file_type),
            timestamp: event.timestamp.unwrap_or(received_at),
            delivery: None,
            read: false,
        }
    }

    /// A row from the friend list. `is_sent` rows are ours.
    pub fn from_history(row: HistoryMessage, self_id: UserId, peer: UserId) -> Self {
        let is_read = row.is_read.unwrap_or(false);
        let delivery = row.is_sent.then(|| {
            if is_read {
                DeliveryState::Read
            } else if row.is_delivered.unwrap_or(false) {
                DeliveryState::Delivered
            } else {
                DeliveryState::Sent
            }
        });
        Self {
            server_id: row.id,
            sender: if row.is_sent { self_id } else { peer },
            sender_name: None,
            content: row.content,
            attachment: attachment(row.file_path, row.file_name, row.file_size, row.mime_type),
            timestamp: row.timestamp.unwrap_or_default(),
            delivery,
            read: row.is_sent || is_read,
        }
    }

    pub fn from_group_record(record: GroupMessageRecord, self_id: UserId) -> Self {
        let ours = record.from.id == self_id;
        Self {
            server_id: Some(record.id),
            sender: record.from.id,
            sender_name: Some(record.from.name),
            content: record.content,
            attachment: attachment(
                record.file_path,
                record.file_name,
                record.file_size,
                record.mime_type,
            ),
            timestamp: record.timestamp.unwrap_or_default(),
            delivery: ours.then_some(DeliveryState::Sent),
            read: ours || record.read,
        }
    }
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
