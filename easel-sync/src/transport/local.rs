//! In-process fan-out over tokio broadcast rooms.
//!
//! One [`LocalHub`] plays the role of the relay for every client in the
//! process. Each canvas gets a broadcast room; every [`LocalChannel`] in the
//! room sees every event except its own. The hub has an online switch so
//! tests can cut all channels at once and bring them back.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::{BroadcastChannel, ChannelNotice, ChannelStatus, NoticeSink, TransportError};
use crate::protocol::ChangeEvent;

struct HubInner {
    rooms: Mutex<HashMap<Uuid, broadcast::Sender<ChangeEvent>>>,
    online: watch::Sender<bool>,
    capacity: usize,
    events_sent: AtomicU64,
}

impl HubInner {
    fn rooms(&self) -> MutexGuard<'_, HashMap<Uuid, broadcast::Sender<ChangeEvent>>> {
        self.rooms.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Join a room, creating it if needed. Empty rooms are swept on the way.
    fn subscribe(&self, canvas_id: Uuid) -> broadcast::Receiver<ChangeEvent> {
        let mut rooms = self.rooms();
        rooms.retain(|id, tx| *id == canvas_id || tx.receiver_count() > 0);
        rooms
            .entry(canvas_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Drop rooms nobody is subscribed to.
    fn prune(&self) {
        self.rooms().retain(|_, tx| tx.receiver_count() > 0);
    }

    fn existing_room(&self, canvas_id: Uuid) -> Option<broadcast::Sender<ChangeEvent>> {
        self.rooms().get(&canvas_id).cloned()
    }
}

/// Shared hub; clones refer to the same rooms.
#[derive(Clone)]
pub struct LocalHub {
    inner: Arc<HubInner>,
}

impl LocalHub {
    pub fn new(capacity: usize) -> Self {
        let (online, _) = watch::channel(true);
        Self {
            inner: Arc::new(HubInner {
                rooms: Mutex::new(HashMap::new()),
                online,
                capacity: capacity.max(1),
                events_sent: AtomicU64::new(0),
            }),
        }
    }

    /// A channel for one client of this hub.
    pub fn channel(&self, client_id: Uuid) -> LocalChannel {
        LocalChannel {
            hub: self.inner.clone(),
            client_id,
            canvas_id: None,
            connected: Arc::new(AtomicBool::new(false)),
            task: None,
        }
    }

    /// Simulate an outage (`false`) or recovery (`true`).
    ///
    /// Going offline reports `Error` to every connected channel.
    pub fn set_online(&self, online: bool) {
        self.inner.online.send_replace(online);
        log::debug!("Local hub is now {}", if online { "online" } else { "offline" });
    }

    pub fn is_online(&self) -> bool {
        *self.inner.online.borrow()
    }

    /// Subscribers currently attached to a canvas room.
    pub fn subscriber_count(&self, canvas_id: Uuid) -> usize {
        self.inner
            .existing_room(canvas_id)
            .map_or(0, |room| room.receiver_count())
    }

    pub fn room_count(&self) -> usize {
        self.inner.rooms().len()
    }

    pub fn events_sent(&self) -> u64 {
        self.inner.events_sent.load(Ordering::Relaxed)
    }
}

impl Default for LocalHub {
    fn default() -> Self {
        Self::new(256)
    }
}

pub struct LocalChannel {
    hub: Arc<HubInner>,
    client_id: Uuid,
    canvas_id: Option<Uuid>,
    connected: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl LocalChannel {
    pub fn client_id(&self) -> Uuid {
        self.client_id
    }

    fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.connected.store(false, Ordering::SeqCst);
    }
}

impl BroadcastChannel for LocalChannel {
    fn connect(&mut self, canvas_id: Uuid, sink: NoticeSink) -> Result<(), TransportError> {
        self.stop();
        self.canvas_id = Some(canvas_id);

        let hub = self.hub.clone();
        let mut rx = hub.subscribe(canvas_id);
        let mut online = hub.online.subscribe();
        let connected = self.connected.clone();
        let client_id = self.client_id;

        self.task = Some(tokio::spawn(async move {
            if !*online.borrow_and_update() {
                drop(rx);
                hub.prune();
                let _ = sink.send(ChannelNotice::Status(ChannelStatus::Error("hub offline".into())));
                return;
            }

            connected.store(true, Ordering::SeqCst);
            let _ = sink.send(ChannelNotice::Status(ChannelStatus::Connected));

            let status = loop {
                tokio::select! {
                    changed = online.changed() => {
                        if changed.is_err() {
                            break ChannelStatus::Closed;
                        }
                        if !*online.borrow_and_update() {
                            break ChannelStatus::Error("hub went offline".into());
                        }
                    }
                    received = rx.recv() => match received {
                        Ok(event) => {
                            if event.origin == client_id {
                                continue;
                            }
                            if sink.send(ChannelNotice::Event(event)).is_err() {
                                // Session is gone.
                                break ChannelStatus::Closed;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("Client {client_id} lagged by {n} events on canvas {canvas_id}");
                        }
                        Err(broadcast::error::RecvError::Closed) => break ChannelStatus::Closed,
                    }
                }
            };

            drop(rx);
            hub.prune();
            connected.store(false, Ordering::SeqCst);
            let _ = sink.send(ChannelNotice::Status(status));
        }));
        Ok(())
    }

    fn send(&self, event: &ChangeEvent) -> Result<(), TransportError> {
        let canvas_id = self.canvas_id.ok_or(TransportError::NotConnected)?;
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        // No receivers is not an error: the room may simply be empty.
        if let Some(room) = self.hub.existing_room(canvas_id) {
            let _ = room.send(event.clone());
        }
        self.hub.events_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn disconnect(&mut self) {
        self.stop();
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl Drop for LocalChannel {
    fn drop(&mut self) {
        self.stop();
    }
}
