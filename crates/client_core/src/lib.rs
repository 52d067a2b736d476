use std::{collections::HashMap, sync::Arc};

use chrono::Utc;
use shared::{
    domain::{ConversationRef, UserId},
    protocol::{
        ClientFrame, EventKind, GroupMessageIn, GroupRef, PrivateMessageIn, ServerEvent,
        TypingSource,
    },
};
use tokio::{
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, info, warn};

pub mod api;
pub mod channel;
pub mod config;
pub mod error;
pub mod identity;
pub mod outbox;
pub mod presence;
pub mod session;
pub mod store;
pub mod transport;
pub mod types;

pub use api::{ChatApi, HttpChatApi, MissingChatApi};
pub use channel::{
    ChannelSignal, ChannelState, Connection, Connector, EventChannel, HandlerId, ReconnectPolicy,
};
pub use config::{load_config, SyncConfig};
pub use error::{ChannelError, SendFailure, SyncError};
pub use outbox::SendStage;
pub use session::{Credential, SessionContext};
pub use transport::WsConnector;
pub use types::{
    Attachment, AttachmentUpload, DeliveryState, Direction, Draft, LocalId, Message,
};

use identity::IdentityResolver;
use outbox::Outbox;
use presence::PresenceTracker;
use store::{ConversationStore, MergeOutcome};
use types::InboundMessage;

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    ConversationUpdated {
        conversation: ConversationRef,
    },
    MessageReceived {
        conversation: ConversationRef,
        local_id: LocalId,
    },
    PresenceChanged {
        user_id: UserId,
        is_online: bool,
    },
    PresenceSnapshot {
        online: Vec<UserId>,
    },
    TypingChanged {
        conversation: ConversationRef,
        participants: Vec<UserId>,
    },
    ChannelStateChanged(ChannelState),
    /// The channel came back after a drop and the directory was refetched.
    Reconnected,
    SendFailed {
        conversation: ConversationRef,
        local_id: Option<LocalId>,
        reason: String,
    },
    UnknownSenderSynthesized {
        conversation: ConversationRef,
        user_id: UserId,
    },
    /// The server ended the session; a new credential is needed.
    SessionRejected {
        reason: String,
    },
    Error(String),
}

/// One row of the conversation list, in sidebar order.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationSummary {
    pub conversation: ConversationRef,
    pub title: String,
    pub placeholder: bool,
    pub last_message: Option<Message>,
    pub unread: usize,
    pub online: bool,
    pub typing: Vec<UserId>,
}

pub(crate) struct EngineState {
    resolver: IdentityResolver,
    store: ConversationStore,
    presence: PresenceTracker,
    outbox: Outbox,
    active: Option<ConversationRef>,
    selection_epoch: u64,
    selection_task: Option<JoinHandle<()>>,
    typing_timers: HashMap<UserId, JoinHandle<()>>,
}

impl EngineState {
    /// Merges a history page and retires the sends it confirmed.
    fn merge_history(&mut self, conversation: ConversationRef, history: Vec<InboundMessage>) {
        let merged = self.store.apply_history(conversation, history);
        for local_id in merged.reconciled {
            self.outbox.confirm(local_id);
        }
    }
}

/// Session orchestrator. Owns the only [`EventChannel`] and is the only
/// caller of `connect`/`disconnect`; everything else goes through the
/// engine lock so push events and user actions apply one at a time.
pub struct ChatClient {
    session: SessionContext,
    config: SyncConfig,
    api: Arc<dyn ChatApi>,
    channel: EventChannel,
    inner: Mutex<EngineState>,
    events: broadcast::Sender<ClientEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    handlers: Mutex<Vec<HandlerId>>,
}

impl ChatClient {
    pub fn new(
        session: SessionContext,
        config: SyncConfig,
        api: Arc<dyn ChatApi>,
        connector: Arc<dyn Connector>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        let state = EngineState {
            resolver: IdentityResolver::new(),
            store: ConversationStore::new(session.user_id, config.recency_window()),
            presence: PresenceTracker::new(config.typing_safety_expiry()),
            outbox: Outbox::default(),
            active: None,
            selection_epoch: 0,
            selection_task: None,
            typing_timers: HashMap::new(),
        };
        Arc::new(Self {
            channel: EventChannel::new(connector, config.reconnect_policy()),
            session,
            config,
            api,
            inner: Mutex::new(state),
            events,
            tasks: Mutex::new(Vec::new()),
            handlers: Mutex::new(Vec::new()),
        })
    }

    /// WebSocket channel and HTTP API, both derived from the session's
    /// server URL.
    pub fn with_http(session: SessionContext, config: SyncConfig) -> Result<Arc<Self>, ChannelError> {
        let connector = WsConnector::from_server_url(&session.server_url)?;
        let api = HttpChatApi::new(&session);
        Ok(Self::new(session, config, Arc::new(api), Arc::new(connector)))
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn session(&self) -> &SessionContext {
        &self.session
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Loads the directory, wires every push event into the engine and
    /// opens the channel. A directory failure is reported but not fatal.
    pub async fn start(self: &Arc<Self>) -> Result<(), SyncError> {
        let mut handlers = self.handlers.lock().await;
        if !handlers.is_empty() {
            debug!("client: already started");
            return Ok(());
        }

        if let Err(err) = self.refresh_directory().await {
            warn!("client: directory fetch failed: {err}");
            let _ = self.events.send(ClientEvent::Error(err.to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        for kind in EventKind::ALL {
            let tx = tx.clone();
            let id = self
                .channel
                .on(kind, move |event| {
                    let _ = tx.send(event.clone());
                })
                .await;
            handlers.push(id);
        }
        drop(tx);

        let mut tasks = self.tasks.lock().await;
        let signals = self.channel.subscribe();
        tasks.push(tokio::spawn(Arc::clone(self).run_dispatch(rx, signals)));

        if let Err(err) = self.channel.connect(&self.session.credential).await {
            for id in handlers.drain(..) {
                self.channel.off(id).await;
            }
            for task in tasks.drain(..) {
                task.abort();
            }
            return Err(err.into());
        }

        let client = Arc::clone(self);
        let sweep_every = self.config.typing_sweep_interval();
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_every);
            loop {
                ticker.tick().await;
                client.sweep_typing().await;
            }
        }));

        info!(user_id = self.session.user_id.0, "client: session started");
        Ok(())
    }

    /// Fetches friends and groups and merges them, embedded history
    /// included, into the resolver and the store.
    pub async fn refresh_directory(&self) -> Result<(), SyncError> {
        let friends = self
            .api
            .fetch_friends()
            .await
            .map_err(|err| SyncError::Api(err.to_string()))?;
        let groups = self
            .api
            .fetch_groups()
            .await
            .map_err(|err| SyncError::Api(err.to_string()))?;
        let self_id = self.session.user_id;
        let (friend_count, group_count) = (friends.len(), groups.len());

        let mut touched = Vec::with_capacity(friend_count + group_count);
        {
            let mut state = self.inner.lock().await;
            state.resolver.merge_summaries(&friends, &groups);
            for summary in friends {
                let peer = summary.friend_details.id;
                let conversation = ConversationRef::Direct(peer);
                if let Some(is_online) = summary.is_online {
                    state.presence.apply_directory_hint(peer, is_online);
                }
                let history = summary
                    .messages
                    .into_iter()
                    .map(|row| InboundMessage::from_history(row, self_id, peer))
                    .collect();
                state.merge_history(conversation, history);
                touched.push(conversation);
            }
            for summary in groups {
                let conversation = ConversationRef::Group(summary.id);
                let history = summary
                    .chats
                    .into_iter()
                    .map(|record| InboundMessage::from_group_record(record, self_id))
                    .collect();
                state.merge_history(conversation, history);
                touched.push(conversation);
            }
        }

        for conversation in touched {
            let _ = self
                .events
                .send(ClientEvent::ConversationUpdated { conversation });
        }
        info!(friends = friend_count, groups = group_count, "client: directory loaded");
        Ok(())
    }

    async fn run_dispatch(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<ServerEvent>,
        mut signals: broadcast::Receiver<ChannelSignal>,
    ) {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle_server_event(event).await,
                    None => break,
                },
                signal = signals.recv() => match signal {
                    Ok(ChannelSignal::StateChanged(state)) => {
                        let _ = self.events.send(ClientEvent::ChannelStateChanged(state));
                    }
                    Ok(ChannelSignal::Connected { reconnected: true }) => self.on_reconnected().await,
                    Ok(ChannelSignal::Connected { reconnected: false }) => {}
                    Ok(ChannelSignal::GaveUp { reason }) => {
                        warn!("client: channel gave up: {reason}");
                        let _ = self.events.send(ClientEvent::Error(reason));
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "client: missed channel signals");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        debug!("client: dispatch loop finished");
    }

    async fn on_reconnected(&self) {
        info!("client: channel reconnected; resyncing");
        if let Err(err) = self.refresh_directory().await {
            warn!("client: resync after reconnect failed: {err}");
            let _ = self.events.send(ClientEvent::Error(err.to_string()));
        }

        let active = self.inner.lock().await.active;
        if let Some(conversation @ ConversationRef::Group(group_id)) = active {
            match self
                .api
                .fetch_group_messages(group_id, self.config.history_page_size)
                .await
            {
                Ok(records) => {
                    let self_id = self.session.user_id;
                    let history = records
                        .into_iter()
                        .map(|record| InboundMessage::from_group_record(record, self_id))
                        .collect();
                    self.inner.lock().await.merge_history(conversation, history);
                    let _ = self
                        .events
                        .send(ClientEvent::ConversationUpdated { conversation });
                }
                Err(err) => warn!(conversation = %conversation, "client: history refetch failed: {err}"),
            }
        }
        let _ = self.events.send(ClientEvent::Reconnected);
    }

    pub(crate) async fn handle_server_event(&self, event: ServerEvent) {
        match event {
            ServerEvent::PrivateMessageReceived(message) => self.on_private_message(message).await,
            ServerEvent::GroupMessageReceived(message) => self.on_group_message(message).await,
            ServerEvent::TypingStart(TypingSource { from }) => {
                let conversation = ConversationRef::Direct(from);
                let mut guard = self.inner.lock().await;
                let state = &mut *guard;
                if state
                    .presence
                    .apply_typing_start(from, conversation, Instant::now(), &state.resolver)
                {
                    self.publish_typing(state, conversation);
                }
            }
            ServerEvent::TypingStop(TypingSource { from }) => {
                let conversation = ConversationRef::Direct(from);
                let mut state = self.inner.lock().await;
                if state.presence.apply_typing_stop(from, conversation) {
                    self.publish_typing(&mut state, conversation);
                }
            }
            ServerEvent::UserStatusChange(change) => {
                let changed = self
                    .inner
                    .lock()
                    .await
                    .presence
                    .apply_online_delta(change.user_id, change.is_online);
                if changed {
                    let _ = self.events.send(ClientEvent::PresenceChanged {
                        user_id: change.user_id,
                        is_online: change.is_online,
                    });
                }
            }
            ServerEvent::InitialFriendsStatus(statuses) => {
                let mut state = self.inner.lock().await;
                state
                    .presence
                    .apply_snapshot(statuses.iter().map(|status| (status.id, status.is_online)));
                let online = state.presence.online();
                let _ = self.events.send(ClientEvent::PresenceSnapshot { online });
            }
            ServerEvent::GroupMessagesRead(GroupRef { group_id }) => {
                let conversation = ConversationRef::Group(group_id);
                self.inner
                    .lock()
                    .await
                    .store
                    .apply_read_receipt(conversation);
                let _ = self
                    .events
                    .send(ClientEvent::ConversationUpdated { conversation });
            }
            ServerEvent::GroupMessageError(failure) => {
                let reason = if failure.error.is_empty() {
                    "group message rejected".to_string()
                } else {
                    failure.error
                };
                self.fail_oldest_pending(ConversationRef::Group(failure.group_id), reason)
                    .await;
            }
            ServerEvent::Unauthorized(notice) => {
                self.end_session_from_server(
                    notice
                        .message
                        .unwrap_or_else(|| "credential rejected".to_string()),
                )
                .await;
            }
            ServerEvent::DuplicateConnection(notice) => {
                self.end_session_from_server(
                    notice
                        .message
                        .unwrap_or_else(|| "signed in from another connection".to_string()),
                )
                .await;
            }
        }
    }

    async fn on_private_message(&self, message: PrivateMessageIn) {
        let self_id = self.session.user_id;
        let from = message.from;
        let to = message.to;
        let mut inbound = InboundMessage::from_private(message, Utc::now());

        let mut guard = self.inner.lock().await;
        let state = &mut *guard;
        let conversation = if from == self_id {
            let located = to.map(ConversationRef::Direct).or_else(|| {
                state.store.locate_pending_echo(
                    &inbound.content,
                    inbound.attachment.as_ref().map(|a| a.path.as_str()),
                    inbound.timestamp,
                )
            });
            match located {
                Some(conversation) => conversation,
                None => {
                    warn!("client: own message echoed without a recipient; ignoring");
                    return;
                }
            }
        } else {
            let resolution = state.resolver.resolve_or_placeholder(from);
            if resolution.synthesized {
                let _ = self.events.send(ClientEvent::UnknownSenderSynthesized {
                    conversation: resolution.conversation,
                    user_id: from,
                });
            }
            if inbound.sender_name.is_none() {
                inbound.sender_name = state.resolver.profile(from).map(|p| p.name.clone());
            }
            resolution.conversation
        };

        let outcome = state.store.append_inbound(conversation, inbound);
        let acknowledge = self.after_append(state, conversation, from, outcome);
        drop(guard);
        if acknowledge {
            self.acknowledge_active(conversation).await;
        }
    }

    async fn on_group_message(&self, message: GroupMessageIn) {
        let from = message.from;
        let group_id = message.group_id;
        let conversation = ConversationRef::Group(group_id);
        let mut inbound = InboundMessage::from_group(message, Utc::now());

        let mut guard = self.inner.lock().await;
        let state = &mut *guard;
        state.resolver.ensure_group(group_id);
        if inbound.sender_name.is_none() {
            let name = state
                .resolver
                .member_name(group_id, from)
                .map(str::to_string)
                .or_else(|| state.resolver.profile(from).map(|p| p.name.clone()))
                .unwrap_or_else(|| format!("User {from}"));
            inbound.sender_name = Some(name);
        }

        let outcome = state.store.append_inbound(conversation, inbound);
        let acknowledge = self.after_append(state, conversation, from, outcome);
        drop(guard);
        if acknowledge {
            self.acknowledge_active(conversation).await;
        }
    }

    /// Shared bookkeeping after a merge. Returns whether the server should
    /// hear that the message was read because its conversation is open.
    fn after_append(
        &self,
        state: &mut EngineState,
        conversation: ConversationRef,
        from: UserId,
        outcome: MergeOutcome,
    ) -> bool {
        if let MergeOutcome::Reconciled(local_id) = outcome {
            state.outbox.confirm(local_id);
        }
        let from_peer = from != self.session.user_id;
        if from_peer && state.presence.apply_typing_stop(from, conversation) {
            self.publish_typing(state, conversation);
        }

        let event = match outcome {
            MergeOutcome::Appended(local_id) => ClientEvent::MessageReceived {
                conversation,
                local_id,
            },
            _ => ClientEvent::ConversationUpdated { conversation },
        };
        let _ = self.events.send(event);

        let acknowledge = outcome.is_new()
            && from_peer
            && self.config.mark_read_while_active
            && state.active == Some(conversation);
        if acknowledge {
            state.store.mark_read(conversation);
        }
        acknowledge
    }

    async fn acknowledge_active(&self, conversation: ConversationRef) {
        match conversation {
            ConversationRef::Group(_) => {
                if let Err(err) = self.notify_read(conversation).await {
                    debug!(conversation = %conversation, "client: read notice not sent: {err}");
                }
            }
            ConversationRef::Direct(peer) => {
                let api = Arc::clone(&self.api);
                tokio::spawn(async move {
                    if let Err(err) = api.mark_direct_read(peer).await {
                        warn!(user_id = peer.0, "client: mark read failed: {err}");
                    }
                });
            }
        }
    }

    fn publish_typing(&self, state: &mut EngineState, conversation: ConversationRef) {
        let participants = state.presence.typing_in(conversation, Instant::now());
        let _ = self.events.send(ClientEvent::TypingChanged {
            conversation,
            participants,
        });
    }

    async fn end_session_from_server(&self, reason: String) {
        warn!("client: server ended the session: {reason}");
        self.channel.disconnect().await;
        self.handlers.lock().await.clear();
        let _ = self.events.send(ClientEvent::SessionRejected { reason });
    }

    /// Makes `conversation` the open one: loads its history, then marks it
    /// read. Any load still running for the previous selection is
    /// cancelled, and a late result is discarded.
    pub async fn select_conversation(self: &Arc<Self>, conversation: ConversationRef) {
        let mut state = self.inner.lock().await;
        state.selection_epoch += 1;
        let epoch = state.selection_epoch;
        state.active = Some(conversation);
        if let Some(previous) = state.selection_task.take() {
            previous.abort();
        }
        let client = Arc::clone(self);
        state.selection_task = Some(tokio::spawn(async move {
            client.load_selection(conversation, epoch).await;
        }));
        debug!(conversation = %conversation, epoch, "client: conversation selected");
    }

    pub async fn clear_selection(&self) {
        let mut state = self.inner.lock().await;
        state.selection_epoch += 1;
        state.active = None;
        if let Some(previous) = state.selection_task.take() {
            previous.abort();
        }
    }

    pub async fn active_conversation(&self) -> Option<ConversationRef> {
        self.inner.lock().await.active
    }

    async fn load_selection(&self, conversation: ConversationRef, epoch: u64) {
        if let ConversationRef::Group(group_id) = conversation {
            let fetched = self
                .api
                .fetch_group_messages(group_id, self.config.history_page_size)
                .await;
            let mut state = self.inner.lock().await;
            if state.selection_epoch != epoch {
                debug!("client: {}", SyncError::StaleRequest(conversation));
                return;
            }
            match fetched {
                Ok(records) => {
                    let self_id = self.session.user_id;
                    let history = records
                        .into_iter()
                        .map(|record| InboundMessage::from_group_record(record, self_id))
                        .collect();
                    state.merge_history(conversation, history);
                }
                Err(err) => {
                    warn!(conversation = %conversation, "client: history load failed: {err}");
                    let _ = self.events.send(ClientEvent::Error(err.to_string()));
                }
            }
        }

        {
            let mut state = self.inner.lock().await;
            if state.selection_epoch != epoch {
                debug!("client: {}", SyncError::StaleRequest(conversation));
                return;
            }
            state.store.mark_read(conversation);
        }
        if let Err(err) = self.notify_read(conversation).await {
            warn!(conversation = %conversation, "client: read notice failed: {err}");
        }
        let _ = self
            .events
            .send(ClientEvent::ConversationUpdated { conversation });
    }

    /// Marks every inbound message in `conversation` read and tells the
    /// server once. Returns how many messages changed.
    pub async fn mark_read(&self, conversation: ConversationRef) -> Result<usize, SyncError> {
        let changed = self.inner.lock().await.store.mark_read(conversation);
        let _ = self
            .events
            .send(ClientEvent::ConversationUpdated { conversation });
        self.notify_read(conversation).await?;
        Ok(changed)
    }

    async fn notify_read(&self, conversation: ConversationRef) -> Result<(), SyncError> {
        match conversation {
            ConversationRef::Group(group_id) => {
                self.channel
                    .emit(&ClientFrame::MarkGroupMessagesRead(GroupRef { group_id }))
                    .await?
            }
            ConversationRef::Direct(peer) => self
                .api
                .mark_direct_read(peer)
                .await
                .map_err(|err| SyncError::Api(err.to_string()))?,
        }
        Ok(())
    }

    pub async fn unread_count(&self, conversation: ConversationRef) -> usize {
        self.inner.lock().await.store.unread_count(conversation)
    }

    pub async fn messages(&self, conversation: ConversationRef) -> Vec<Message> {
        self.inner.lock().await.store.messages(conversation).to_vec()
    }

    pub async fn typing_in(&self, conversation: ConversationRef) -> Vec<UserId> {
        self.inner
            .lock()
            .await
            .presence
            .typing_in(conversation, Instant::now())
    }

    pub async fn is_online(&self, user_id: UserId) -> bool {
        self.inner.lock().await.presence.is_online(user_id)
    }

    pub async fn send_stage(&self, local_id: LocalId) -> Option<SendStage> {
        self.inner.lock().await.outbox.stage(local_id)
    }

    pub async fn channel_state(&self) -> ChannelState {
        self.channel.state().await
    }

    pub async fn conversation_list(&self) -> Vec<ConversationSummary> {
        let now = Instant::now();
        let mut guard = self.inner.lock().await;
        let state = &mut *guard;

        let mut order: Vec<ConversationRef> = state.resolver.slots().to_vec();
        for conversation in state.store.conversations() {
            if !order.contains(&conversation) {
                order.push(conversation);
            }
        }

        let mut list = Vec::with_capacity(order.len());
        for conversation in order {
            let placeholder = match conversation {
                ConversationRef::Direct(id) => state
                    .resolver
                    .profile(id)
                    .map_or(true, |profile| profile.placeholder),
                ConversationRef::Group(id) => state
                    .resolver
                    .group(id)
                    .map_or(true, |group| group.placeholder),
            };
            list.push(ConversationSummary {
                conversation,
                title: state.resolver.display_name(conversation),
                placeholder,
                last_message: state.store.last_message(conversation).cloned(),
                unread: state.store.unread_count(conversation),
                online: conversation
                    .direct_peer()
                    .is_some_and(|peer| state.presence.is_online(peer)),
                typing: state.presence.typing_in(conversation, now),
            });
        }
        list
    }

    /// Resolves a stored attachment path to a time-limited download URL.
    pub async fn file_url(&self, path: &str) -> Result<String, SyncError> {
        self.api
            .file_url(path)
            .await
            .map_err(|err| SyncError::Api(err.to_string()))
    }

    /// Closes the channel, stops background work and evicts all session
    /// state.
    pub async fn shutdown(&self) {
        let handler_ids: Vec<HandlerId> = self.handlers.lock().await.drain(..).collect();
        for id in handler_ids {
            self.channel.off(id).await;
        }
        self.channel.disconnect().await;
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }

        let mut state = self.inner.lock().await;
        if let Some(task) = state.selection_task.take() {
            task.abort();
        }
        for (_, timer) in state.typing_timers.drain() {
            timer.abort();
        }
        state.selection_epoch += 1;
        state.active = None;
        state.store.clear();
        state.resolver.clear();
        state.presence.clear();
        state.outbox.clear();
        info!(user_id = self.session.user_id.0, "client: session closed");
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
