//! Optimistic send path: `composing → (uploading) → pending → sent | failed`.
//!
//! The store holds what the user sees; the outbox only remembers drafts that
//! have not been confirmed yet so a failed one can be re-sent as-is.

use std::collections::HashMap;

use shared::{
    domain::ConversationRef,
    protocol::{ClientFrame, GroupMessageOut, PrivateMessageOut},
};
use tracing::{debug, info, warn};

use crate::{
    error::{SendFailure, SyncError},
    types::{Attachment, AttachmentUpload, Draft, LocalId, OutgoingMessage},
    ChatClient, ClientEvent,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStage {
    Uploading,
    Pending,
    Failed,
}

#[derive(Debug, Clone)]
pub struct OutboxEntry {
    pub conversation: ConversationRef,
    pub draft: Draft,
    /// Reused on retry so a file is uploaded once.
    pub uploaded: Option<Attachment>,
    pub stage: SendStage,
    pub error: Option<String>,
}

#[derive(Debug, Default)]
pub struct Outbox {
    entries: HashMap<LocalId, OutboxEntry>,
}

impl Outbox {
    pub fn begin_upload(&mut self, local_id: LocalId, conversation: ConversationRef, draft: Draft) {
        self.entries.insert(
            local_id,
            OutboxEntry {
                conversation,
                draft,
                uploaded: None,
                stage: SendStage::Uploading,
                error: None,
            },
        );
    }

    pub fn track(
        &mut self,
        local_id: LocalId,
        conversation: ConversationRef,
        draft: Draft,
        uploaded: Option<Attachment>,
    ) {
        self.entries.insert(
            local_id,
            OutboxEntry {
                conversation,
                draft,
                uploaded,
                stage: SendStage::Pending,
                error: None,
            },
        );
    }

    /// The server confirmed the message; nothing left to retry.
    pub fn confirm(&mut self, local_id: LocalId) -> Option<OutboxEntry> {
        self.entries.remove(&local_id)
    }

    pub fn fail(&mut self, local_id: LocalId, error: impl Into<String>) -> bool {
        match self.entries.get_mut(&local_id) {
            Some(entry) => {
                entry.stage = SendStage::Failed;
                entry.error = Some(error.into());
                true
            }
            None => false,
        }
    }

    pub fn take_failed(&mut self, local_id: LocalId) -> Option<OutboxEntry> {
        match self.entries.get(&local_id) {
            Some(entry) if entry.stage == SendStage::Failed => self.entries.remove(&local_id),
            _ => None,
        }
    }

    pub fn stage(&self, local_id: LocalId) -> Option<SendStage> {
        self.entries.get(&local_id).map(|entry| entry.stage)
    }

    pub fn failed(&self) -> impl Iterator<Item = (LocalId, &OutboxEntry)> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.stage == SendStage::Failed)
            .map(|(id, entry)| (*id, entry))
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

pub(crate) fn outgoing_frame(conversation: ConversationRef, outgoing: &OutgoingMessage) -> ClientFrame {
    let attachment = outgoing.attachment.as_ref();
    match conversation {
        ConversationRef::Direct(peer) => ClientFrame::PrivateMessage(PrivateMessageOut {
            recipient_id: peer,
            message: outgoing.content.clone(),
            file_path: attachment.map(|a| a.path.clone()),
            file_type: attachment.and_then(|a| a.mime_type.clone()),
        }),
        ConversationRef::Group(group_id) => ClientFrame::GroupMessage(GroupMessageOut {
            group_id,
            message: outgoing.content.clone(),
            file_path: attachment.map(|a| a.path.clone()),
            file_name: attachment.and_then(|a| a.name.clone()),
            file_size: attachment.and_then(|a| a.size_bytes),
            file_type: attachment.and_then(|a| a.mime_type.clone()),
        }),
    }
}

impl ChatClient {
    /// Uploads the attachment (if any), emits the message and records it as
    /// `pending` straight away. On failure the draft comes back untouched.
    pub async fn send(
        &self,
        conversation: ConversationRef,
        draft: Draft,
    ) -> Result<LocalId, SendFailure> {
        self.dispatch_draft(conversation, draft, None).await
    }

    /// User-initiated re-send of a `failed` message. The failed entry is
    /// replaced by a fresh `pending` one.
    pub async fn retry(&self, local_id: LocalId) -> Result<LocalId, SendFailure> {
        let entry = {
            let mut state = self.inner.lock().await;
            let Some(entry) = state.outbox.take_failed(local_id) else {
                return Err(SendFailure {
                    error: SyncError::UnknownMessage(local_id),
                    draft: Draft::default(),
                    local_id: None,
                });
            };
            state.store.remove(local_id);
            entry
        };
        info!(conversation = %entry.conversation, %local_id, "outbox: retrying send");
        let _ = self.events.send(ClientEvent::ConversationUpdated {
            conversation: entry.conversation,
        });
        self.dispatch_draft(entry.conversation, entry.draft, entry.uploaded)
            .await
    }

    async fn dispatch_draft(
        &self,
        conversation: ConversationRef,
        draft: Draft,
        uploaded: Option<Attachment>,
    ) -> Result<LocalId, SendFailure> {
        if !draft.is_sendable() {
            return Err(SendFailure {
                error: SyncError::InvalidMessage,
                draft,
                local_id: None,
            });
        }

        let to_upload = match uploaded {
            Some(_) => None,
            None => draft.attachment.clone(),
        };
        let attachment = match to_upload {
            Some(upload) => match self.upload(conversation, &draft, upload).await {
                Ok(attachment) => Some(attachment),
                Err((upload_id, reason)) => {
                    return Err(SendFailure {
                        error: SyncError::UploadFailure(reason),
                        draft,
                        local_id: Some(upload_id),
                    });
                }
            },
            None => uploaded,
        };

        let outgoing = OutgoingMessage {
            content: draft.text.clone(),
            attachment: attachment.clone(),
        };
        let frame = outgoing_frame(conversation, &outgoing);

        // Emit and record under one lock so an echo cannot overtake the
        // provisional entry.
        let mut state = self.inner.lock().await;
        let emitted = self.channel.emit(&frame).await;
        let local_id = match state.store.record_optimistic_send(conversation, outgoing) {
            Ok(local_id) => local_id,
            Err(error) => {
                return Err(SendFailure {
                    error,
                    draft,
                    local_id: None,
                })
            }
        };

        match emitted {
            Ok(()) => {
                state.outbox.track(local_id, conversation, draft, attachment);
                if let Some(peer) = conversation.direct_peer() {
                    self.end_typing(&mut state, peer).await;
                }
                debug!(conversation = %conversation, %local_id, "outbox: message pending");
                let _ = self
                    .events
                    .send(ClientEvent::ConversationUpdated { conversation });
                Ok(local_id)
            }
            Err(err) => {
                let reason = err.to_string();
                let _ = state.store.reconcile(local_id, Err(reason.clone()));
                state
                    .outbox
                    .track(local_id, conversation, draft.clone(), attachment);
                state.outbox.fail(local_id, reason.clone());
                let _ = self.events.send(ClientEvent::SendFailed {
                    conversation,
                    local_id: Some(local_id),
                    reason,
                });
                Err(SendFailure {
                    error: SyncError::Channel(err),
                    draft,
                    local_id: Some(local_id),
                })
            }
        }
    }

    /// Returns the uploaded attachment, or the id of the failed outbox entry
    /// and the reason.
    async fn upload(
        &self,
        conversation: ConversationRef,
        draft: &Draft,
        upload: AttachmentUpload,
    ) -> Result<Attachment, (LocalId, String)> {
        let upload_id = {
            let mut state = self.inner.lock().await;
            let upload_id = state.store.allocate_local_id();
            state
                .outbox
                .begin_upload(upload_id, conversation, draft.clone());
            upload_id
        };

        match self.api.upload_file(&upload).await {
            Ok(response) => {
                self.inner.lock().await.outbox.confirm(upload_id);
                Ok(Attachment {
                    path: response.file_path,
                    name: Some(upload.file_name),
                    size_bytes: Some(upload.bytes.len() as u64),
                    mime_type: upload.mime_type,
                })
            }
            Err(err) => {
                let reason = err.to_string();
                warn!(conversation = %conversation, "outbox: upload failed: {reason}");
                self.inner.lock().await.outbox.fail(upload_id, reason.clone());
                let _ = self.events.send(ClientEvent::SendFailed {
                    conversation,
                    local_id: Some(upload_id),
                    reason: reason.clone(),
                });
                Err((upload_id, reason))
            }
        }
    }

    /// The server refused a group message; the oldest pending send in that
    /// group is the one it refers to.
    pub(crate) async fn fail_oldest_pending(&self, conversation: ConversationRef, reason: String) {
        let mut state = self.inner.lock().await;
        let Some(local_id) = state.store.oldest_pending(conversation) else {
            warn!(conversation = %conversation, "outbox: server rejected a message we have no record of: {reason}");
            return;
        };
        let _ = state.store.reconcile(local_id, Err(reason.clone()));
        state.outbox.fail(local_id, reason.clone());
        let _ = self.events.send(ClientEvent::SendFailed {
            conversation,
            local_id: Some(local_id),
            reason,
        });
    }
}

#[cfg(test)]
#[path = "tests/outbox_tests.rs"]
mod tests;
