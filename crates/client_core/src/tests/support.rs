//! In-memory fakes shared by the engine tests.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use shared::{
    domain::{GroupId, MessageId, UserId},
    protocol::{
        ClientFrame, FriendDetails, FriendSummary, GroupMember, GroupMessageIn,
        GroupMessageRecord, GroupSummary, PrivateMessageIn, ServerEvent, UploadResponse,
    },
};
use tokio::{
    sync::{broadcast, mpsc, Mutex, Notify},
    time::timeout,
};

use crate::{
    api::ChatApi,
    channel::{Connection, Connector},
    config::SyncConfig,
    error::ChannelError,
    session::{Credential, SessionContext},
    types::AttachmentUpload,
    ChatClient, ClientEvent,
};

pub(crate) const WAIT: Duration = Duration::from_secs(2);

/// The server end of one fake transport session.
pub(crate) struct TestLink {
    to_client: mpsc::UnboundedSender<String>,
    from_client: mpsc::UnboundedReceiver<String>,
}

impl TestLink {
    pub(crate) fn push(&self, event: &ServerEvent) {
        self.push_raw(&event.encode().expect("encode event"));
    }

    pub(crate) fn push_raw(&self, raw: &str) {
        self.to_client
            .send(raw.to_string())
            .expect("client is listening");
    }

    pub(crate) async fn next_frame(&mut self) -> ClientFrame {
        let raw = timeout(WAIT, self.from_client.recv())
            .await
            .expect("frame in time")
            .expect("link open");
        serde_json::from_str(&raw).expect("client frame")
    }

    pub(crate) fn drain_frames(&mut self) -> Vec<ClientFrame> {
        let mut frames = Vec::new();
        while let Ok(raw) = self.from_client.try_recv() {
            frames.push(serde_json::from_str(&raw).expect("client frame"));
        }
        frames
    }
}

pub(crate) struct TestConnector {
    links: mpsc::UnboundedSender<TestLink>,
    attempts: AtomicUsize,
    failures: std::sync::Mutex<VecDeque<ChannelError>>,
}

impl TestConnector {
    pub(crate) fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<TestLink>) {
        let (links, links_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                links,
                attempts: AtomicUsize::new(0),
                failures: std::sync::Mutex::new(VecDeque::new()),
            }),
            links_rx,
        )
    }

    pub(crate) fn fail_next(&self, err: ChannelError) {
        self.failures.lock().expect("failures lock").push_back(err);
    }

    pub(crate) fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for TestConnector {
    async fn connect(&self, _credential: &Credential) -> Result<Connection, ChannelError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.failures.lock().expect("failures lock").pop_front() {
            return Err(err);
        }
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let _ = self.links.send(TestLink {
            to_client: inbound_tx,
            from_client: outbound_rx,
        });
        Ok(Connection {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

pub(crate) async fn next_link(links: &mut mpsc::UnboundedReceiver<TestLink>) -> TestLink {
    timeout(WAIT, links.recv())
        .await
        .expect("connection in time")
        .expect("connector alive")
}

#[derive(Default)]
pub(crate) struct TestApiState {
    pub friends: Vec<FriendSummary>,
    pub groups: Vec<GroupSummary>,
    pub group_history: HashMap<GroupId, Vec<GroupMessageRecord>>,
    pub marked_direct: Vec<UserId>,
    pub uploads: Vec<String>,
    pub fail_upload: bool,
    pub fail_friends: bool,
}

/// Scriptable [`ChatApi`]. `hold_history` parks history requests for one
/// group until the returned gate is notified so tests can interleave
/// selection switches.
#[derive(Default)]
pub(crate) struct TestApi {
    pub state: Mutex<TestApiState>,
    history_gates: Mutex<HashMap<GroupId, Arc<Notify>>>,
}

impl TestApi {
    pub(crate) fn new(state: TestApiState) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(state),
            history_gates: Mutex::new(HashMap::new()),
        })
    }

    pub(crate) async fn hold_history(&self, group_id: GroupId) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.history_gates
            .lock()
            .await
            .insert(group_id, Arc::clone(&gate));
        gate
    }
}

#[async_trait]
impl ChatApi for TestApi {
    async fn fetch_friends(&self) -> Result<Vec<FriendSummary>> {
        let state = self.state.lock().await;
        if state.fail_friends {
            return Err(anyhow!("friends unavailable"));
        }
        Ok(state.friends.clone())
    }

    async fn fetch_groups(&self) -> Result<Vec<GroupSummary>> {
        Ok(self.state.lock().await.groups.clone())
    }

    async fn fetch_group_messages(
        &self,
        group_id: GroupId,
        _limit: u32,
    ) -> Result<Vec<GroupMessageRecord>> {
        let gate = self.history_gates.lock().await.remove(&group_id);
        if let Some(gate) = gate {
            gate.notified().await;
        }
        Ok(self
            .state
            .lock()
            .await
            .group_history
            .get(&group_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn mark_direct_read(&self, friend_id: UserId) -> Result<()> {
        self.state.lock().await.marked_direct.push(friend_id);
        Ok(())
    }

    async fn upload_file(&self, upload: &AttachmentUpload) -> Result<UploadResponse> {
        let mut state = self.state.lock().await;
        if state.fail_upload {
            return Err(anyhow!("storage unavailable"));
        }
        state.uploads.push(upload.file_name.clone());
        Ok(UploadResponse {
            file_path: format!("uploads/{}", upload.file_name),
        })
    }

    async fn file_url(&self, path: &str) -> Result<String> {
        Ok(format!("https://files.test/{path}"))
    }
}

pub(crate) fn friend(id: i64, name: &str) -> FriendSummary {
    FriendSummary {
        friend_details: FriendDetails {
            id: UserId(id),
            name: name.to_string(),
            user_name: name.to_lowercase(),
            avatar: None,
        },
        messages: Vec::new(),
        unread_count: None,
        is_online: None,
    }
}

pub(crate) fn member(id: i64, name: &str) -> GroupMember {
    GroupMember {
        id: UserId(id),
        name: name.to_string(),
        user_name: name.to_lowercase(),
        avatar: None,
    }
}

pub(crate) fn group(id: i64, name: &str, users: Vec<GroupMember>) -> GroupSummary {
    GroupSummary {
        id: GroupId(id),
        name: name.to_string(),
        users,
        chats: Vec::new(),
    }
}

/// Polls `check` until it holds or [`WAIT`] elapses.
pub(crate) async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        if check().await {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub(crate) const ME: UserId = UserId(1);

/// Short timers so debounce, expiry and reconnect finish quickly.
pub(crate) fn test_config() -> SyncConfig {
    SyncConfig {
        typing_debounce_ms: 100,
        typing_safety_expiry_ms: 300,
        typing_sweep_interval_ms: 20,
        reconnect_initial_delay_ms: 10,
        reconnect_max_delay_ms: 40,
        reconnect_max_attempts: Some(3),
        ..SyncConfig::default()
    }
}

/// A started client wired to fakes, with the first link already open.
pub(crate) struct Harness {
    pub client: Arc<ChatClient>,
    pub api: Arc<TestApi>,
    pub connector: Arc<TestConnector>,
    pub links: mpsc::UnboundedReceiver<TestLink>,
    pub link: TestLink,
    pub events: broadcast::Receiver<ClientEvent>,
}

impl Harness {
    pub(crate) async fn start(state: TestApiState) -> Self {
        Self::start_with(state, test_config()).await
    }

    pub(crate) async fn start_with(state: TestApiState, config: SyncConfig) -> Self {
        let api = TestApi::new(state);
        let (connector, mut links) = TestConnector::new();
        let session = SessionContext::new(ME, "Me", Credential::new("token"), "http://chat.test");
        let client = ChatClient::new(session, config, api.clone(), connector.clone());
        let events = client.subscribe_events();
        client.start().await.expect("start");
        let link = next_link(&mut links).await;
        Self {
            client,
            api,
            connector,
            links,
            link,
            events,
        }
    }

    /// Next event matching `wanted`, skipping everything else.
    pub(crate) async fn next_event<F>(&mut self, wanted: F) -> ClientEvent
    where
        F: Fn(&ClientEvent) -> bool,
    {
        let events = &mut self.events;
        timeout(WAIT, async {
            loop {
                match events.recv().await {
                    Ok(event) if wanted(&event) => return event,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
                }
            }
        })
        .await
        .expect("event in time")
    }
}

pub(crate) fn private_message(from: i64, to: Option<i64>, text: &str, id: Option<i64>) -> ServerEvent {
    ServerEvent::PrivateMessageReceived(PrivateMessageIn {
        id: id.map(MessageId),
        from: UserId(from),
        to: to.map(UserId),
        from_name: None,
        message: text.to_string(),
        timestamp: Some(Utc::now()),
        file_path: None,
        file_name: None,
        file_size: None,
        file_type: None,
    })
}

pub(crate) fn group_message(group_id: i64, from: i64, text: &str, id: Option<i64>) -> ServerEvent {
    ServerEvent::GroupMessageReceived(GroupMessageIn {
        id: id.map(MessageId),
        group_id: GroupId(group_id),
        from: UserId(from),
        from_name: None,
        message: text.to_string(),
        timestamp: Some(Utc::now()),
        file_path: None,
        file_name: None,
        file_size: None,
        file_type: None,
    })
}

pub(crate) fn group_record(id: i64, from: GroupMember, text: &str, read: bool) -> GroupMessageRecord {
    GroupMessageRecord {
        id: MessageId(id),
        content: text.to_string(),
        timestamp: Some(Utc::now()),
        read,
        file_path: None,
        file_name: None,
        file_size: None,
        mime_type: None,
        from,
        group: None,
    }
}
