use crate::dispatcher::CommandDispatcher;
use crate::protocol;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Buffer,
    Recording,
    Streaming,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buffer => write!(f, "buffer"),
            Self::Recording => write!(f, "recording"),
            Self::Streaming => write!(f, "streaming"),
        }
    }
}

/// Change notifications for presentation layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    StateChanged { kind: OperationKind, active: bool },
    PendingChanged { kind: OperationKind, pending: bool },
    ConnectivityChanged { connected: bool },
}

#[derive(Debug, Default, Clone, Copy)]
struct KindState {
    active: bool,
    pending: bool,
}

#[derive(Debug, Default)]
struct SessionState {
    buffer: KindState,
    recording: KindState,
    streaming: KindState,
    connected: bool,
}

impl SessionState {
    fn kind(&self, kind: OperationKind) -> &KindState {
        match kind {
            OperationKind::Buffer => &self.buffer,
            OperationKind::Recording => &self.recording,
            OperationKind::Streaming => &self.streaming,
        }
    }

    fn kind_mut(&mut self, kind: OperationKind) -> &mut KindState {
        match kind {
            OperationKind::Buffer => &mut self.buffer,
            OperationKind::Recording => &mut self.recording,
            OperationKind::Streaming => &mut self.streaming,
        }
    }
}

/// Tracks whether buffer/recording/streaming are active, arbitrates
/// concurrent start/stop requests, and reconciles its optimistic view
/// against authoritative polling of the backend.
///
/// While an operation is pending its displayed active value is frozen;
/// only the operation's own completion updates it. Polling touches
/// non-pending kinds only.
pub struct SessionController {
    dispatcher: Arc<CommandDispatcher>,
    state: Mutex<SessionState>,
    op_lock: tokio::sync::Mutex<()>,
    polling: AtomicBool,
    events: broadcast::Sender<SessionEvent>,
    debounce: Duration,
}

impl SessionController {
    pub fn new(dispatcher: Arc<CommandDispatcher>, debounce: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            dispatcher,
            state: Mutex::new(SessionState::default()),
            op_lock: tokio::sync::Mutex::new(()),
            polling: AtomicBool::new(false),
            events,
            debounce,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn is_active(&self, kind: OperationKind) -> bool {
        self.state.lock().unwrap().kind(kind).active
    }

    pub fn is_pending(&self, kind: OperationKind) -> bool {
        self.state.lock().unwrap().kind(kind).pending
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().unwrap().connected
    }

    /// Starts (`target_active = true`) or stops the given operation.
    /// Refused without any network call when the kind is already pending.
    /// Only an acknowledged `true` from the backend counts as success; a
    /// missing or negative acknowledgement leaves state unchanged.
    pub async fn toggle_operation(&self, kind: OperationKind, target_active: bool) -> bool {
        if !self.mark_pending(kind) {
            return false;
        }

        // Single-flight across all kinds: the backend connection supports
        // only one outstanding exchange.
        let _op = self.op_lock.lock().await;

        let reply = match (kind, target_active) {
            (OperationKind::Buffer, true) => self.dispatcher.start_replay_buffer().await,
            (OperationKind::Buffer, false) => self.dispatcher.stop_replay_buffer().await,
            (OperationKind::Recording, true) => self.dispatcher.start_recording().await,
            (OperationKind::Recording, false) => self.dispatcher.stop_recording().await,
            (OperationKind::Streaming, true) => self.dispatcher.start_streaming().await,
            (OperationKind::Streaming, false) => self.dispatcher.stop_streaming().await,
        };

        let success = reply == Some(true);
        if success {
            self.set_active(kind, target_active);
        } else {
            tracing::warn!(%kind, target_active, ?reply, "toggle failed");
        }

        self.settle_and_clear(kind).await;
        success
    }

    /// One-shot save of the replay buffer. Requires the buffer to be active
    /// and not pending; does not change the active state.
    pub async fn save_buffer(&self) -> bool {
        if !self.is_active(OperationKind::Buffer) {
            return false;
        }
        if !self.mark_pending(OperationKind::Buffer) {
            return false;
        }

        let _op = self.op_lock.lock().await;
        let success = self.dispatcher.save_replay_buffer().await.is_some();
        self.settle_and_clear(OperationKind::Buffer).await;
        success
    }

    /// One-shot split of the current recording file. Requires an active,
    /// non-pending recording; does not change the active state.
    pub async fn split_recording(&self) -> bool {
        if !self.is_active(OperationKind::Recording) {
            return false;
        }
        if !self.mark_pending(OperationKind::Recording) {
            return false;
        }

        let _op = self.op_lock.lock().await;
        let success = self.dispatcher.split_recording().await.is_some();
        self.settle_and_clear(OperationKind::Recording).await;
        success
    }

    pub async fn set_scene(&self, name: &str) -> bool {
        let _op = self.op_lock.lock().await;
        self.dispatcher.set_scene(name).await.is_some()
    }

    pub async fn current_scene(&self) -> Option<String> {
        self.dispatcher
            .get_current_scene()
            .await
            .map(|(_, scene)| scene)
    }

    pub async fn scenes(&self) -> Option<Vec<String>> {
        self.dispatcher
            .get_scenes()
            .await
            .map(|(_, payload)| protocol::parse_scene_list(&payload))
    }

    /// Refreshes the authoritative view. The replay-buffer query doubles as
    /// the connectivity probe; kinds with an operation in flight are left
    /// untouched so the poll cannot flicker against it. Overlapping calls
    /// are dropped. Never fails; a broken backend only flips connectivity.
    pub async fn poll_states(&self) -> bool {
        if self.polling.swap(true, Ordering::AcqRel) {
            return self.is_connected();
        }

        let buffer = self.dispatcher.is_replay_buffer_active().await;
        let connected = buffer.is_some();
        self.set_connected(connected);

        if connected {
            let recording = self.dispatcher.is_recording_active().await;
            let streaming = self.dispatcher.is_streaming_active().await;

            self.reconcile(OperationKind::Buffer, buffer);
            self.reconcile(OperationKind::Recording, recording);
            self.reconcile(OperationKind::Streaming, streaming);
        }

        self.polling.store(false, Ordering::Release);
        connected
    }

    /// Drives `poll_states` on a fixed interval until the owning task is
    /// dropped or aborted.
    pub async fn run_poll_loop(&self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.poll_states().await;
        }
    }

    /// Debounce, then clear the pending flag. The delay absorbs the
    /// backend's internal settle time before it reports consistent state.
    async fn settle_and_clear(&self, kind: OperationKind) {
        tokio::time::sleep(self.debounce).await;
        self.clear_pending(kind);
    }

    fn mark_pending(&self, kind: OperationKind) -> bool {
        {
            let mut state = self.state.lock().unwrap();
            let entry = state.kind_mut(kind);
            if entry.pending {
                return false;
            }
            entry.pending = true;
        }
        self.notify(SessionEvent::PendingChanged {
            kind,
            pending: true,
        });
        true
    }

    fn clear_pending(&self, kind: OperationKind) {
        self.state.lock().unwrap().kind_mut(kind).pending = false;
        self.notify(SessionEvent::PendingChanged {
            kind,
            pending: false,
        });
    }

    fn set_active(&self, kind: OperationKind, active: bool) {
        self.state.lock().unwrap().kind_mut(kind).active = active;
        self.notify(SessionEvent::StateChanged { kind, active });
    }

    fn set_connected(&self, connected: bool) {
        {
            let mut state = self.state.lock().unwrap();
            if state.connected == connected {
                return;
            }
            state.connected = connected;
        }
        tracing::info!(connected, "backend connectivity changed");
        self.notify(SessionEvent::ConnectivityChanged { connected });
    }

    fn reconcile(&self, kind: OperationKind, polled: Option<bool>) {
        let Some(active) = polled else {
            return;
        };
        {
            let mut state = self.state.lock().unwrap();
            let entry = state.kind_mut(kind);
            if entry.pending || entry.active == active {
                return;
            }
            entry.active = active;
        }
        self.notify(SessionEvent::StateChanged { kind, active });
    }

    fn notify(&self, event: SessionEvent) {
        // No subscribers is fine; presentation layers come and go.
        let _ = self.events.send(event);
    }
}
