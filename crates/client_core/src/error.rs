use shared::domain::{ConversationRef, UserId};
use thiserror::Error;

use crate::types::{Draft, LocalId};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("no credential supplied for the event channel")]
    MissingCredential,
    #[error("event channel rejected the credential: {0}")]
    Rejected(String),
    #[error("event channel is not connected")]
    NotConnected,
    #[error("event channel transport failure: {0}")]
    Transport(String),
    #[error("failed to encode frame: {0}")]
    Protocol(String),
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("merge conflict in {conversation}: {detail}")]
    MergeConflict {
        conversation: ConversationRef,
        detail: String,
    },
    #[error("attachment upload failed: {0}")]
    UploadFailure(String),
    #[error("unknown sender {0}")]
    UnknownSender(UserId),
    #[error("stale result for {0} discarded")]
    StaleRequest(ConversationRef),
    #[error("message has neither text nor attachment")]
    InvalidMessage,
    #[error("api request failed: {0}")]
    Api(String),
    #[error("no message with local id {0}")]
    UnknownMessage(LocalId),
}

/// A send that did not reach `pending`/`sent`. The draft is handed back
/// untouched so the caller can keep it in the composer.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct SendFailure {
    #[source]
    pub error: SyncError,
    pub draft: Draft,
    /// Handle for `retry` when the outbox kept the failed draft.
    pub local_id: Option<LocalId>,
}
