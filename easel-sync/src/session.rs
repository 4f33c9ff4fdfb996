//! The session actor: one task per canvas/client pair.
//!
//! ```text
//! SessionHandle ──Command──►┐
//! channel ─────ChannelNotice─┤   ┌────────────────────────────┐
//! flush deadline ───────────┼──►│ SyncSession (select! loop)  │──► SyncEngine
//! retry deadline ───────────┤   │  + ConnectionSupervisor     │
//! maintenance tick ─────────┘   └────────────────────────────┘
//! ```
//!
//! Every mutation of the engine happens inside this loop, so the engine
//! needs no locking. Store flushes are debounced: each change pushes the
//! deadline out by `flush_debounce`, but never past `max_flush_delay` from
//! the first pending change.

use easel_core::CanvasObject;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};

use crate::engine::{ConnectionStatus, EngineStats, LocalChangeReport, SyncEngine};
use crate::error::{SyncError, SyncResult};
use crate::oplog::FlushReport;
use crate::supervisor::{ConnectionSupervisor, LinkState, SupervisorAction};
use crate::transport::{BroadcastChannel, ChannelNotice, ChannelStatus, NoticeSink};

const COMMAND_BUFFER: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStats {
    pub engine: EngineStats,
    pub link: LinkState,
    pub connect_attempts: u64,
    pub backoff_attempt: u32,
}

enum Command {
    ApplyLocal {
        objects: Vec<CanvasObject>,
        reply: oneshot::Sender<LocalChangeReport>,
    },
    Objects {
        reply: oneshot::Sender<Vec<CanvasObject>>,
    },
    Status {
        reply: oneshot::Sender<ConnectionStatus>,
    },
    Stats {
        reply: oneshot::Sender<SessionStats>,
    },
    FlushNow {
        reply: oneshot::Sender<FlushReport>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable front end of a running session.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    objects: watch::Receiver<Vec<CanvasObject>>,
    status: watch::Receiver<ConnectionStatus>,
}

impl SessionHandle {
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> SyncResult<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| SyncError::SessionClosed)?;
        rx.await.map_err(|_| SyncError::SessionClosed)
    }

    /// Submit the full proposed object set from the UI.
    pub async fn apply_local_change(&self, objects: Vec<CanvasObject>) -> SyncResult<LocalChangeReport> {
        self.request(|reply| Command::ApplyLocal { objects, reply }).await
    }

    pub async fn objects(&self) -> SyncResult<Vec<CanvasObject>> {
        self.request(|reply| Command::Objects { reply }).await
    }

    pub async fn status(&self) -> SyncResult<ConnectionStatus> {
        self.request(|reply| Command::Status { reply }).await
    }

    pub async fn stats(&self) -> SyncResult<SessionStats> {
        self.request(|reply| Command::Stats { reply }).await
    }

    /// Persist and flush immediately instead of waiting for the debounce.
    pub async fn flush_now(&self) -> SyncResult<FlushReport> {
        self.request(|reply| Command::FlushNow { reply }).await
    }

    /// Persist, flush once more and close the channel.
    pub async fn shutdown(&self) -> SyncResult<()> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    pub fn subscribe_objects(&self) -> watch::Receiver<Vec<CanvasObject>> {
        self.objects.clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

pub struct SyncSession {
    engine: SyncEngine,
    supervisor: ConnectionSupervisor,
    commands: mpsc::Receiver<Command>,
    notice_tx: NoticeSink,
    notices: mpsc::UnboundedReceiver<ChannelNotice>,
    flush_deadline: Option<Instant>,
    first_pending: Option<Instant>,
    connect_attempts: u64,
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

impl SyncSession {
    /// Start the session task. Without a channel the row store is treated
    /// as always reachable.
    pub fn spawn(mut engine: SyncEngine, channel: Option<Box<dyn BroadcastChannel>>) -> SessionHandle {
        let (command_tx, commands) = mpsc::channel(COMMAND_BUFFER);
        let (notice_tx, notices) = mpsc::unbounded_channel();

        if let Some(channel) = channel {
            engine.attach_channel(channel);
        }
        let handle = SessionHandle {
            commands: command_tx,
            objects: engine.subscribe_objects(),
            status: engine.subscribe_status(),
        };

        let supervisor = ConnectionSupervisor::new(engine.config().backoff_base, engine.config().backoff_max);
        let session = Self {
            engine,
            supervisor,
            commands,
            notice_tx,
            notices,
            flush_deadline: None,
            first_pending: None,
            connect_attempts: 0,
        };
        tokio::spawn(session.run());
        handle
    }

    async fn run(mut self) {
        let canvas_id = self.engine.canvas_id();
        log::info!(
            "Sync session started for canvas {canvas_id} as {}",
            self.engine.identity().user_id
        );

        if self.engine.has_channel() {
            self.connect();
        } else {
            self.engine.set_connected(true);
            self.resync();
        }

        let mut maintenance = tokio::time::interval(self.engine.config().maintenance_interval);
        maintenance.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let flush_at = self.flush_deadline;
            let retry_at = self.supervisor.next_retry();

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if !self.handle_command(command) {
                            break;
                        }
                    }
                    None => {
                        self.shutdown();
                        break;
                    }
                },
                Some(notice) = self.notices.recv() => self.handle_notice(notice),
                _ = sleep_until_opt(flush_at) => self.persist_pass(),
                _ = sleep_until_opt(retry_at) => {
                    if self.supervisor.due(Instant::now()) {
                        self.connect();
                    }
                }
                _ = maintenance.tick() => {
                    if self.engine.collect_tombstones() > 0 {
                        self.schedule_persist();
                    }
                }
            }
        }

        log::info!("Sync session for canvas {canvas_id} stopped");
    }

    /// Returns `false` once the session should stop.
    fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::ApplyLocal { objects, reply } => {
                let report = self.engine.apply_local_change(objects);
                if !report.is_empty() {
                    self.schedule_persist();
                }
                let _ = reply.send(report);
            }
            Command::Objects { reply } => {
                let _ = reply.send(self.engine.objects());
            }
            Command::Status { reply } => {
                let _ = reply.send(self.engine.status());
            }
            Command::Stats { reply } => {
                let _ = reply.send(SessionStats {
                    engine: self.engine.stats(),
                    link: self.supervisor.state(),
                    connect_attempts: self.connect_attempts,
                    backoff_attempt: self.supervisor.attempt(),
                });
            }
            Command::FlushNow { reply } => {
                self.clear_deadline();
                self.save_snapshot();
                let _ = reply.send(self.engine.flush_store());
            }
            Command::Shutdown { reply } => {
                self.shutdown();
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    fn handle_notice(&mut self, notice: ChannelNotice) {
        match notice {
            ChannelNotice::Event(event) => {
                if self.engine.apply_remote_change(event).is_applied() {
                    self.schedule_persist();
                }
            }
            ChannelNotice::Status(ChannelStatus::Connected) => {
                if self.supervisor.on_connected() == SupervisorAction::Resync {
                    self.engine.set_connected(true);
                    self.resync();
                }
            }
            ChannelNotice::Status(ChannelStatus::Error(reason)) => {
                log::warn!("Channel for canvas {} failed: {reason}", self.engine.canvas_id());
                self.engine.set_connected(false);
                if let SupervisorAction::RetryAt(at) = self.supervisor.on_lost(Instant::now()) {
                    log::debug!("Reconnect scheduled in {:?}", at.saturating_duration_since(Instant::now()));
                }
            }
            ChannelNotice::Status(ChannelStatus::Closed) => {
                log::info!("Channel for canvas {} closed", self.engine.canvas_id());
                self.engine.set_connected(false);
                self.supervisor.on_closed();
            }
        }
    }

    fn connect(&mut self) {
        let canvas_id = self.engine.canvas_id();
        let sink = self.notice_tx.clone();
        self.supervisor.start_attempt();
        self.connect_attempts += 1;

        let result = match self.engine.channel_mut() {
            Some(channel) => channel.connect(canvas_id, sink),
            None => return,
        };
        if let Err(e) = result {
            log::warn!("Connect attempt for canvas {canvas_id} failed: {e}");
            self.supervisor.on_lost(Instant::now());
        }
    }

    /// Flush the queue first, then pull the store and merge it.
    fn resync(&mut self) {
        let report = self.engine.flush_store();
        if !report.is_clean() {
            log::debug!("Resync flush left {} operations queued", report.remaining);
        }
        if let Err(e) = self.engine.fetch_and_reconcile() {
            log::warn!("Store reconciliation for canvas {} failed: {e}", self.engine.canvas_id());
        }
        if self.engine.is_snapshot_dirty() || !self.engine.queue().is_empty() {
            self.schedule_persist();
        }
    }

    fn schedule_persist(&mut self) {
        let now = Instant::now();
        let config = self.engine.config();
        let first = *self.first_pending.get_or_insert(now);
        let deadline = (now + config.flush_debounce).min(first + config.max_flush_delay);
        self.flush_deadline = Some(deadline);
    }

    fn clear_deadline(&mut self) {
        self.flush_deadline = None;
        self.first_pending = None;
    }

    fn persist_pass(&mut self) {
        self.clear_deadline();
        self.save_snapshot();

        if !self.engine.is_connected() || self.engine.queue().is_empty() {
            return;
        }
        let report = self.engine.flush_store();
        if report.remaining > 0 {
            // Retry failed groups on a later pass.
            self.flush_deadline = Some(Instant::now() + self.engine.config().max_flush_delay);
        }
    }

    fn save_snapshot(&mut self) {
        if !self.engine.is_snapshot_dirty() {
            return;
        }
        if let Err(e) = self.engine.persist_snapshot() {
            log::warn!("Snapshot write failed: {e}");
        }
    }

    fn shutdown(&mut self) {
        self.clear_deadline();
        if let Err(e) = self.engine.persist_snapshot() {
            log::warn!("Final snapshot write failed: {e}");
        }
        if self.engine.is_connected() && !self.engine.queue().is_empty() {
            let report = self.engine.flush_store();
            if report.remaining > 0 {
                log::warn!("{} operations still queued at shutdown", report.remaining);
            }
        }
        if let Some(channel) = self.engine.channel_mut() {
            channel.disconnect();
        }
        self.engine.set_connected(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::config::SyncConfig;
    use crate::engine::{ClientIdentity, EngineParts};
    use crate::storage::{MemoryRowStore, MemoryStorage, StoreWrite};
    use crate::time::SystemTimeSource;
    use uuid::Uuid;

    fn engine(store: Arc<MemoryRowStore>) -> SyncEngine {
        SyncEngine::open(EngineParts {
            canvas_id: Uuid::new_v4(),
            identity: ClientIdentity::new("alice", "Alice"),
            config: SyncConfig::for_testing(),
            store,
            storage: Arc::new(MemoryStorage::new()),
            time: Arc::new(SystemTimeSource),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_drag_burst_coalesces_to_one_write() {
        let store = Arc::new(MemoryRowStore::new());
        let engine = engine(store.clone());
        let canvas_id = engine.canvas_id();
        let handle = SyncSession::spawn(engine, None);

        let mut obj = CanvasObject::rect(0.0, 0.0, 10.0, 10.0);
        for step in 0..10 {
            obj.x = step as f32;
            handle.apply_local_change(vec![obj.clone()]).await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(store.writes().is_empty(), "debounce window still open");

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(store.writes(), vec![StoreWrite::Upsert { id: obj.id, version: 10 }]);
        assert_eq!(store.row(canvas_id, obj.id).unwrap().x, 9.0);
        assert_eq!(handle.status().await.unwrap().queued, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_continuous_burst_flushes_at_cap() {
        let store = Arc::new(MemoryRowStore::new());
        let handle = SyncSession::spawn(engine(store.clone()), None);

        let mut obj = CanvasObject::rect(0.0, 0.0, 10.0, 10.0);
        // 30ms apart: always inside the 50ms debounce, so only the cap fires.
        for step in 0..25 {
            obj.x = step as f32;
            handle.apply_local_change(vec![obj.clone()]).await.unwrap();
            tokio::time::sleep(Duration::from_millis(30)).await;
        }
        assert!(!store.writes().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_flushes_and_closes() {
        let store = Arc::new(MemoryRowStore::new());
        let handle = SyncSession::spawn(engine(store.clone()), None);
        let obj = CanvasObject::rect(0.0, 0.0, 1.0, 1.0);
        handle.apply_local_change(vec![obj.clone()]).await.unwrap();

        handle.shutdown().await.unwrap();
        assert_eq!(store.writes().len(), 1);
        assert!(matches!(handle.objects().await, Err(SyncError::SessionClosed)));
    }

    #[tokio::test]
    async fn test_flush_now_skips_debounce() {
        let store = Arc::new(MemoryRowStore::new());
        let handle = SyncSession::spawn(engine(store.clone()), None);
        let obj = CanvasObject::rect(0.0, 0.0, 1.0, 1.0);
        handle.apply_local_change(vec![obj]).await.unwrap();

        let report = handle.flush_now().await.unwrap();
        assert_eq!(report.applied, 1);
        assert_eq!(handle.status().await.unwrap().queued, 0);
        assert_eq!(handle.objects().await.unwrap().len(), 1);
        assert_eq!(handle.stats().await.unwrap().connect_attempts, 0);
    }
}
