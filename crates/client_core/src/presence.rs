use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use shared::{
    domain::{ConversationRef, UserId},
    protocol::{ClientFrame, TypingTarget},
};
use tokio::time::Instant;
use tracing::debug;

use crate::{error::SyncError, identity::IdentityResolver, ChatClient, ClientEvent, EngineState};

/// Online set plus per-conversation typing sets. Typing entries expire on
/// their own after `safety_expiry` so a lost stop never sticks.
#[derive(Debug)]
pub struct PresenceTracker {
    online: HashSet<UserId>,
    typing: HashMap<ConversationRef, HashMap<UserId, Instant>>,
    safety_expiry: Duration,
    // Once the server has sent a snapshot, REST directory hints are stale.
    snapshot_seen: bool,
}

impl PresenceTracker {
    pub fn new(safety_expiry: Duration) -> Self {
        Self {
            online: HashSet::new(),
            typing: HashMap::new(),
            safety_expiry,
            snapshot_seen: false,
        }
    }

    /// Replaces the online set; the snapshot is authoritative.
    pub fn apply_snapshot(&mut self, statuses: impl IntoIterator<Item = (UserId, bool)>) {
        self.snapshot_seen = true;
        self.online = statuses
            .into_iter()
            .filter_map(|(id, is_online)| is_online.then_some(id))
            .collect();
    }

    pub fn apply_online_delta(&mut self, participant: UserId, is_online: bool) -> bool {
        if is_online {
            self.online.insert(participant)
        } else {
            self.online.remove(&participant)
        }
    }

    /// Seeds presence from the friends listing. Ignored once a snapshot has
    /// arrived, since the listing may be older than it.
    pub fn apply_directory_hint(&mut self, participant: UserId, is_online: bool) -> bool {
        if self.snapshot_seen {
            return false;
        }
        self.apply_online_delta(participant, is_online)
    }

    pub fn is_online(&self, participant: UserId) -> bool {
        self.online.contains(&participant)
    }

    pub fn online(&self) -> Vec<UserId> {
        let mut online: Vec<_> = self.online.iter().copied().collect();
        online.sort();
        online
    }

    /// Returns whether the typing set changed. A repeated start only
    /// refreshes the entry's age.
    pub fn apply_typing_start(
        &mut self,
        participant: UserId,
        conversation: ConversationRef,
        now: Instant,
        resolver: &IdentityResolver,
    ) -> bool {
        if !resolver.is_known(participant) {
            debug!(user_id = participant.0, "presence: typing from unknown participant ignored");
            return false;
        }
        self.typing
            .entry(conversation)
            .or_default()
            .insert(participant, now)
            .is_none()
    }

    pub fn apply_typing_stop(&mut self, participant: UserId, conversation: ConversationRef) -> bool {
        let Some(set) = self.typing.get_mut(&conversation) else {
            return false;
        };
        let removed = set.remove(&participant).is_some();
        if set.is_empty() {
            self.typing.remove(&conversation);
        }
        removed
    }

    /// Drops expired entries and returns the conversations that changed.
    pub fn prune_typing(&mut self, now: Instant) -> Vec<ConversationRef> {
        let ceiling = self.safety_expiry;
        let mut changed = Vec::new();
        self.typing.retain(|conversation, set| {
            let before = set.len();
            set.retain(|_, started| now.saturating_duration_since(*started) < ceiling);
            if set.len() != before {
                changed.push(*conversation);
            }
            !set.is_empty()
        });
        changed
    }

    pub fn typing_in(&mut self, conversation: ConversationRef, now: Instant) -> Vec<UserId> {
        self.prune_typing(now);
        let mut typing: Vec<_> = self
            .typing
            .get(&conversation)
            .map(|set| set.keys().copied().collect())
            .unwrap_or_default();
        typing.sort();
        typing
    }

    pub fn clear(&mut self) {
        self.online.clear();
        self.typing.clear();
        self.snapshot_seen = false;
    }
}

impl ChatClient {
    /// Call on every keystroke. Emits `typingStart` once per burst and
    /// `typingStop` after the debounce interval without further calls.
    /// Groups carry no typing frames.
    pub async fn notify_typing(
        self: &Arc<Self>,
        conversation: ConversationRef,
    ) -> Result<(), SyncError> {
        let Some(peer) = conversation.direct_peer() else {
            return Ok(());
        };

        let mut state = self.inner.lock().await;
        let burst_running = match state.typing_timers.remove(&peer) {
            Some(previous) => {
                previous.abort();
                true
            }
            None => false,
        };
        if !burst_running {
            self.channel
                .emit(&ClientFrame::TypingStart(TypingTarget { to: peer }))
                .await?;
        }

        let client = Arc::clone(self);
        let debounce = self.config.typing_debounce();
        state.typing_timers.insert(
            peer,
            tokio::spawn(async move {
                tokio::time::sleep(debounce).await;
                let mut state = client.inner.lock().await;
                state.typing_timers.remove(&peer);
                client.emit_typing_stop(peer).await;
            }),
        );
        Ok(())
    }

    /// Tells `peer` we stopped typing and cancels any running burst timer.
    pub(crate) async fn end_typing(&self, state: &mut EngineState, peer: UserId) {
        if let Some(timer) = state.typing_timers.remove(&peer) {
            timer.abort();
        }
        self.emit_typing_stop(peer).await;
    }

    async fn emit_typing_stop(&self, peer: UserId) {
        if let Err(err) = self
            .channel
            .emit(&ClientFrame::TypingStop(TypingTarget { to: peer }))
            .await
        {
            debug!(user_id = peer.0, "presence: typing stop not sent: {err}");
        }
    }

    pub(crate) async fn sweep_typing(&self) {
        let now = Instant::now();
        let mut state = self.inner.lock().await;
        for conversation in state.presence.prune_typing(now) {
            let participants = state.presence.typing_in(conversation, now);
            let _ = self.events.send(ClientEvent::TypingChanged {
                conversation,
                participants,
            });
        }
    }
}

#[cfg(test)]
#[path = "tests/presence_tests.rs"]
mod tests;
