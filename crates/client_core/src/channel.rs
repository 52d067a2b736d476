//! Typed event channel over a reconnecting push transport.
//!
//! The adapter never buffers outbound frames and never reorders inbound
//! ones, but it also makes no promise about ordering across a reconnect:
//! dependents listen for [`ChannelSignal::Connected`] with
//! `reconnected: true` and re-request whatever they may have missed.

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use shared::protocol::{decode_server_frame, ClientFrame, EventKind, FrameError, ServerEvent};
use tokio::{
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{error::ChannelError, session::Credential};

pub type EventHandler = Arc<dyn Fn(&ServerEvent) + Send + Sync>;

/// Registration token returned by [`EventChannel::on`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Connecting,
    Open,
    Reconnecting,
    Closing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelSignal {
    StateChanged(ChannelState),
    Connected { reconnected: bool },
    GaveUp { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
            max_attempts: Some(10),
        }
    }
}

impl ReconnectPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

/// One live transport session as a pair of text-frame queues. The transport
/// closes `inbound` when the underlying connection drops.
pub struct Connection {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, credential: &Credential) -> Result<Connection, ChannelError>;
}

pub struct EventChannel {
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    shared: Arc<ChannelShared>,
}

struct ChannelShared {
    inner: Mutex<ChannelInner>,
    signals: broadcast::Sender<ChannelSignal>,
}

struct ChannelInner {
    state: ChannelState,
    credential: Option<Credential>,
    outbound: Option<mpsc::UnboundedSender<String>>,
    handlers: HashMap<EventKind, Vec<(HandlerId, EventHandler)>>,
    next_handler_id: u64,
    reader: Option<JoinHandle<()>>,
    // Bumped on every connect/disconnect so stale readers can tell they lost.
    generation: u64,
}

impl EventChannel {
    pub fn new(connector: Arc<dyn Connector>, policy: ReconnectPolicy) -> Self {
        let (signals, _) = broadcast::channel(64);
        Self {
            connector,
            policy,
            shared: Arc::new(ChannelShared {
                inner: Mutex::new(ChannelInner {
                    state: ChannelState::Idle,
                    credential: None,
                    outbound: None,
                    handlers: HashMap::new(),
                    next_handler_id: 1,
                    reader: None,
                    generation: 0,
                }),
                signals,
            }),
        }
    }

    pub async fn state(&self) -> ChannelState {
        self.shared.inner.lock().await.state
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelSignal> {
        self.shared.signals.subscribe()
    }

    /// Opens the channel. A no-op while already connecting, open or
    /// reconnecting.
    pub async fn connect(&self, credential: &Credential) -> Result<(), ChannelError> {
        if credential.is_empty() {
            return Err(ChannelError::MissingCredential);
        }

        let generation = {
            let mut inner = self.shared.inner.lock().await;
            match inner.state {
                ChannelState::Connecting | ChannelState::Open | ChannelState::Reconnecting => {
                    debug!(state = ?inner.state, "channel: connect ignored; already active");
                    return Ok(());
                }
                ChannelState::Idle | ChannelState::Closing => {}
            }
            inner.generation += 1;
            inner.credential = Some(credential.clone());
            self.shared.transition(&mut inner, ChannelState::Connecting);
            inner.generation
        };

        let connection = match self.connector.connect(credential).await {
            Ok(connection) => connection,
            Err(err) => {
                let mut inner = self.shared.inner.lock().await;
                if inner.generation == generation {
                    inner.credential = None;
                    self.shared.transition(&mut inner, ChannelState::Idle);
                }
                warn!("channel: connect failed: {err}");
                return Err(err);
            }
        };

        let mut inner = self.shared.inner.lock().await;
        if inner.generation != generation || inner.state != ChannelState::Connecting {
            return Err(ChannelError::Transport(
                "connect superseded by disconnect".into(),
            ));
        }
        inner.outbound = Some(connection.outbound);
        inner.reader = Some(tokio::spawn(run_reader(
            Arc::clone(&self.connector),
            self.policy,
            Arc::clone(&self.shared),
            connection.inbound,
            generation,
        )));
        self.shared.transition(&mut inner, ChannelState::Open);
        let _ = self
            .shared
            .signals
            .send(ChannelSignal::Connected { reconnected: false });
        info!("channel: connected");
        Ok(())
    }

    /// Registers `handler` for `kind`. Every handler registered for a kind
    /// fires, in registration order.
    pub async fn on<F>(&self, kind: EventKind, handler: F) -> HandlerId
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        let mut inner = self.shared.inner.lock().await;
        let id = HandlerId(inner.next_handler_id);
        inner.next_handler_id += 1;
        inner
            .handlers
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Removes exactly the handler registered under `id`.
    pub async fn off(&self, id: HandlerId) -> bool {
        let mut inner = self.shared.inner.lock().await;
        let mut removed = false;
        for list in inner.handlers.values_mut() {
            let before = list.len();
            list.retain(|(handler_id, _)| *handler_id != id);
            removed |= list.len() != before;
        }
        inner.handlers.retain(|_, list| !list.is_empty());
        removed
    }

    pub async fn handler_count(&self, kind: EventKind) -> usize {
        self.shared
            .inner
            .lock()
            .await
            .handlers
            .get(&kind)
            .map_or(0, Vec::len)
    }

    /// Sends immediately, or fails with [`ChannelError::NotConnected`].
    pub async fn emit(&self, frame: &ClientFrame) -> Result<(), ChannelError> {
        let encoded = frame
            .encode()
            .map_err(|err| ChannelError::Protocol(err.to_string()))?;
        let inner = self.shared.inner.lock().await;
        if inner.state != ChannelState::Open {
            return Err(ChannelError::NotConnected);
        }
        let outbound = inner.outbound.as_ref().ok_or(ChannelError::NotConnected)?;
        outbound
            .send(encoded)
            .map_err(|_| ChannelError::NotConnected)?;
        debug!(event = frame.name(), "channel: emitted frame");
        Ok(())
    }

    /// Tears the channel down and drops every registered handler.
    pub async fn disconnect(&self) {
        let reader = {
            let mut inner = self.shared.inner.lock().await;
            inner.generation += 1;
            inner.credential = None;
            inner.outbound = None;
            inner.handlers.clear();
            if inner.state != ChannelState::Idle {
                self.shared.transition(&mut inner, ChannelState::Closing);
            }
            inner.reader.take()
        };

        if let Some(reader) = reader {
            reader.abort();
        }

        let mut inner = self.shared.inner.lock().await;
        if inner.state != ChannelState::Idle {
            self.shared.transition(&mut inner, ChannelState::Idle);
            info!("channel: disconnected");
        }
    }
}

impl Drop for EventChannel {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.shared.inner.try_lock() {
            if let Some(reader) = inner.reader.take() {
                reader.abort();
            }
        }
    }
}

impl ChannelShared {
    fn transition(&self, inner: &mut ChannelInner, next: ChannelState) {
        if inner.state == next {
            return;
        }
        debug!(from = ?inner.state, to = ?next, "channel: state change");
        inner.state = next;
        let _ = self.signals.send(ChannelSignal::StateChanged(next));
    }

    async fn dispatch(&self, frame: &str) {
        let event = match decode_server_frame(frame) {
            Ok(event) => event,
            Err(FrameError::UnknownEvent(name)) => {
                warn!(event = %name, "channel: ignoring unknown event");
                return;
            }
            Err(err) => {
                warn!("channel: dropping undecodable frame: {err}");
                return;
            }
        };

        let handlers: Vec<EventHandler> = {
            let inner = self.inner.lock().await;
            inner
                .handlers
                .get(&event.kind())
                .map(|list| list.iter().map(|(_, handler)| Arc::clone(handler)).collect())
                .unwrap_or_default()
        };
        if handlers.is_empty() {
            debug!(event = event.kind().name(), "channel: no handler registered");
        }
        for handler in handlers {
            handler(&event);
        }
    }

    async fn begin_reconnect(&self, generation: u64) -> Option<Credential> {
        let mut inner = self.inner.lock().await;
        if inner.generation != generation || inner.state != ChannelState::Open {
            return None;
        }
        inner.outbound = None;
        self.transition(&mut inner, ChannelState::Reconnecting);
        warn!("channel: transport dropped; reconnecting");
        inner.credential.clone()
    }

    async fn finish_reconnect(
        &self,
        generation: u64,
        outbound: mpsc::UnboundedSender<String>,
    ) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.generation != generation || inner.state != ChannelState::Reconnecting {
            return false;
        }
        inner.outbound = Some(outbound);
        self.transition(&mut inner, ChannelState::Open);
        let _ = self
            .signals
            .send(ChannelSignal::Connected { reconnected: true });
        info!("channel: reconnected");
        true
    }

    async fn give_up(&self, generation: u64, reason: String) {
        let mut inner = self.inner.lock().await;
        if inner.generation != generation {
            return;
        }
        inner.credential = None;
        inner.outbound = None;
        inner.reader = None;
        self.transition(&mut inner, ChannelState::Idle);
        warn!("channel: giving up: {reason}");
        let _ = self.signals.send(ChannelSignal::GaveUp { reason });
    }
}

async fn run_reader(
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    shared: Arc<ChannelShared>,
    mut inbound: mpsc::UnboundedReceiver<String>,
    generation: u64,
) {
    loop {
        while let Some(frame) = inbound.recv().await {
            shared.dispatch(&frame).await;
        }

        let Some(credential) = shared.begin_reconnect(generation).await else {
            return;
        };

        match reconnect(connector.as_ref(), &policy, &credential).await {
            Ok(connection) => {
                if !shared.finish_reconnect(generation, connection.outbound).await {
                    return;
                }
                inbound = connection.inbound;
            }
            Err(reason) => {
                shared.give_up(generation, reason).await;
                return;
            }
        }
    }
}

async fn reconnect(
    connector: &dyn Connector,
    policy: &ReconnectPolicy,
    credential: &Credential,
) -> Result<Connection, String> {
    let mut attempt = 0u32;
    loop {
        if let Some(max_attempts) = policy.max_attempts {
            if attempt >= max_attempts {
                return Err(format!("reconnect failed after {attempt} attempts"));
            }
        }
        tokio::time::sleep(policy.delay_for(attempt)).await;

        match connector.connect(credential).await {
            Ok(connection) => return Ok(connection),
            Err(err @ (ChannelError::Rejected(_) | ChannelError::MissingCredential)) => {
                return Err(err.to_string());
            }
            Err(err) => {
                warn!(attempt, "channel: reconnect attempt failed: {err}");
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/channel_tests.rs"]
mod tests;
