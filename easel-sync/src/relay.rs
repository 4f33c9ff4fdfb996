//! WebSocket relay with per-canvas rooms.
//!
//! ```text
//! Client A ──┐                         ┌──► Client B
//!             ├── Room (canvas_id) ─────┤
//! Client C ──┘   broadcast::Sender     └──► Client C (not A)
//! ```
//!
//! The relay holds no canvas state. It validates each change frame and
//! fans it out to the other peers of the room; durability is the row
//! store's job.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::protocol::{ProtocolError, RelayFrame};

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind_addr: String,
    /// Frames buffered per peer before a slow peer starts lagging.
    pub room_capacity: usize,
    pub max_peers_per_room: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9191".to_string(),
            room_capacity: 256,
            max_peers_per_room: 100,
        }
    }
}

impl RelayConfig {
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            room_capacity: 64,
            max_peers_per_room: 8,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub frames_relayed: u64,
    pub frames_rejected: u64,
    pub active_rooms: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// A validated frame on its way to the other peers of a room.
#[derive(Debug, Clone)]
struct Relayed {
    from: Uuid,
    bytes: Arc<Vec<u8>>,
}

struct Room {
    sender: broadcast::Sender<Relayed>,
    peers: HashSet<Uuid>,
}

impl Room {
    fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            peers: HashSet::new(),
        }
    }
}

type Rooms = Arc<RwLock<HashMap<Uuid, Room>>>;

pub struct RelayServer {
    config: RelayConfig,
    rooms: Rooms,
    stats: Arc<RwLock<RelayStats>>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            rooms: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(RelayStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    /// Bind `bind_addr` and serve until the listener fails.
    pub async fn run(&self) -> Result<(), RelayError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), RelayError> {
        log::info!("Relay listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let rooms = self.rooms.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, rooms, stats, config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    pub async fn stats(&self) -> RelayStats {
        self.stats.read().await.clone()
    }

    pub async fn peer_count(&self, canvas_id: Uuid) -> usize {
        self.rooms
            .read()
            .await
            .get(&canvas_id)
            .map_or(0, |room| room.peers.len())
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    rooms: Rooms,
    stats: Arc<RwLock<RelayStats>>,
    config: RelayConfig,
) -> Result<(), RelayError> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    {
        let mut s = stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }

    let mut joined: Option<(Uuid, Uuid)> = None;
    let mut room_rx: Option<broadcast::Receiver<Relayed>> = None;

    let result = loop {
        tokio::select! {
            msg = ws_receiver.next() => match msg {
                Some(Ok(Message::Binary(data))) => {
                    let frame = match RelayFrame::decode(&data) {
                        Ok(frame) => frame,
                        Err(e) => {
                            log::warn!("Rejected frame from {addr}: {e}");
                            stats.write().await.frames_rejected += 1;
                            continue;
                        }
                    };
                    match frame {
                        RelayFrame::Join { canvas_id, client_id } => {
                            if joined.is_some() {
                                log::warn!("Duplicate join from {addr} ignored");
                                continue;
                            }
                            let mut rooms_w = rooms.write().await;
                            let room = rooms_w
                                .entry(canvas_id)
                                .or_insert_with(|| Room::new(config.room_capacity));
                            if room.peers.len() >= config.max_peers_per_room {
                                drop(rooms_w);
                                log::warn!("Canvas {canvas_id} is full; refusing {client_id}");
                                let _ = ws_sender.send(Message::Close(None)).await;
                                break Ok(());
                            }
                            room.peers.insert(client_id);
                            room_rx = Some(room.sender.subscribe());
                            let room_count = rooms_w.len();
                            drop(rooms_w);

                            stats.write().await.active_rooms = room_count;
                            joined = Some((canvas_id, client_id));
                            log::info!("Client {client_id} joined canvas {canvas_id} from {addr}");
                        }
                        RelayFrame::Change(event) => {
                            let Some((canvas_id, client_id)) = joined else {
                                log::warn!("Change before join from {addr}");
                                stats.write().await.frames_rejected += 1;
                                continue;
                            };
                            if event.canvas_id != canvas_id {
                                log::warn!("Client {client_id} sent a change for foreign canvas {}", event.canvas_id);
                                stats.write().await.frames_rejected += 1;
                                continue;
                            }
                            let sender = rooms.read().await.get(&canvas_id).map(|room| room.sender.clone());
                            if let Some(sender) = sender {
                                let relayed = Relayed {
                                    from: client_id,
                                    bytes: Arc::new(data.to_vec()),
                                };
                                let _ = sender.send(relayed);
                                stats.write().await.frames_relayed += 1;
                            }
                        }
                        RelayFrame::Leave => break Ok(()),
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    if let Err(e) = ws_sender.send(Message::Pong(data)).await {
                        break Err(e.into());
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    log::debug!("Connection closed from {addr}");
                    break Ok(());
                }
                Some(Err(e)) => break Err(e.into()),
                _ => {}
            },

            relayed = async {
                match room_rx.as_mut() {
                    Some(rx) => rx.recv().await,
                    None => std::future::pending().await,
                }
            } => match relayed {
                Ok(relayed) => {
                    if joined.is_some_and(|(_, me)| me == relayed.from) {
                        continue;
                    }
                    if let Err(e) = ws_sender.send(Message::Binary(relayed.bytes.to_vec().into())).await {
                        break Err(e.into());
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("Peer at {addr} lagged by {n} frames");
                }
                Err(broadcast::error::RecvError::Closed) => break Ok(()),
            },
        }
    };

    if let Some((canvas_id, client_id)) = joined {
        let mut rooms_w = rooms.write().await;
        if let Some(room) = rooms_w.get_mut(&canvas_id) {
            room.peers.remove(&client_id);
            if room.peers.is_empty() {
                rooms_w.remove(&canvas_id);
            }
        }
        let room_count = rooms_w.len();
        drop(rooms_w);
        stats.write().await.active_rooms = room_count;
        log::info!("Client {client_id} left canvas {canvas_id}");
    }
    stats.write().await.active_connections -= 1;

    result
}
