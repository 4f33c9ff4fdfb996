//! WebSocket client for the relay server.
//!
//! Connects to `url`, announces itself with a `Join` frame and then pumps
//! frames both ways from a single task. Outgoing events go through a bounded
//! buffer; a full buffer drops the send rather than stalling the session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use super::{BroadcastChannel, ChannelNotice, ChannelStatus, NoticeSink, TransportError};
use crate::protocol::{ChangeEvent, RelayFrame};

const OUTGOING_BUFFER: usize = 256;

pub struct WsChannel {
    url: String,
    client_id: Uuid,
    connected: Arc<AtomicBool>,
    outgoing: Option<mpsc::Sender<Vec<u8>>>,
    task: Option<JoinHandle<()>>,
}

impl WsChannel {
    pub fn new(url: impl Into<String>, client_id: Uuid) -> Self {
        Self {
            url: url.into(),
            client_id,
            connected: Arc::new(AtomicBool::new(false)),
            outgoing: None,
            task: None,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn stop(&mut self) {
        self.outgoing = None;
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.connected.store(false, Ordering::SeqCst);
    }
}

async fn run_connection(
    url: String,
    canvas_id: Uuid,
    client_id: Uuid,
    mut out_rx: mpsc::Receiver<Vec<u8>>,
    connected: Arc<AtomicBool>,
    sink: NoticeSink,
) -> ChannelStatus {
    let ws_stream = match tokio_tungstenite::connect_async(&url).await {
        Ok((stream, _)) => stream,
        Err(e) => return ChannelStatus::Error(format!("connect to {url} failed: {e}")),
    };
    let (mut writer, mut reader) = ws_stream.split();

    let join = RelayFrame::Join { canvas_id, client_id };
    let bytes = match join.encode() {
        Ok(bytes) => bytes,
        Err(e) => return ChannelStatus::Error(e.to_string()),
    };
    if let Err(e) = writer.send(Message::Binary(bytes.into())).await {
        return ChannelStatus::Error(format!("join failed: {e}"));
    }

    connected.store(true, Ordering::SeqCst);
    let _ = sink.send(ChannelNotice::Status(ChannelStatus::Connected));
    log::info!("Client {client_id} joined canvas {canvas_id} via {url}");

    loop {
        tokio::select! {
            outgoing = out_rx.recv() => match outgoing {
                Some(data) => {
                    if let Err(e) = writer.send(Message::Binary(data.into())).await {
                        return ChannelStatus::Error(format!("send failed: {e}"));
                    }
                }
                None => {
                    if let Ok(leave) = RelayFrame::Leave.encode() {
                        let _ = writer.send(Message::Binary(leave.into())).await;
                    }
                    let _ = writer.send(Message::Close(None)).await;
                    return ChannelStatus::Closed;
                }
            },
            incoming = reader.next() => match incoming {
                Some(Ok(Message::Binary(data))) => match RelayFrame::decode(&data) {
                    Ok(RelayFrame::Change(event)) => {
                        if event.origin == client_id {
                            continue;
                        }
                        if sink.send(ChannelNotice::Event(event)).is_err() {
                            return ChannelStatus::Closed;
                        }
                    }
                    Ok(other) => log::trace!("Ignoring relay frame {other:?}"),
                    Err(e) => log::warn!("Dropping undecodable frame from {url}: {e}"),
                },
                Some(Ok(Message::Ping(data))) => {
                    let _ = writer.send(Message::Pong(data)).await;
                }
                // Only our own disconnect is a clean close; the relay going
                // away must trigger a reconnect.
                Some(Ok(Message::Close(_))) | None => {
                    return ChannelStatus::Error("closed by server".into());
                }
                Some(Err(e)) => return ChannelStatus::Error(e.to_string()),
                _ => {}
            },
        }
    }
}

impl BroadcastChannel for WsChannel {
    fn connect(&mut self, canvas_id: Uuid, sink: NoticeSink) -> Result<(), TransportError> {
        self.stop();

        let (out_tx, out_rx) = mpsc::channel(OUTGOING_BUFFER);
        self.outgoing = Some(out_tx);

        let url = self.url.clone();
        let client_id = self.client_id;
        let connected = self.connected.clone();
        self.task = Some(tokio::spawn(async move {
            let status = run_connection(url, canvas_id, client_id, out_rx, connected.clone(), sink.clone()).await;
            connected.store(false, Ordering::SeqCst);
            if let ChannelStatus::Error(reason) = &status {
                log::warn!("Relay connection for client {client_id} lost: {reason}");
            }
            let _ = sink.send(ChannelNotice::Status(status));
        }));
        Ok(())
    }

    fn send(&self, event: &ChangeEvent) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let outgoing = self.outgoing.as_ref().ok_or(TransportError::NotConnected)?;
        let bytes = RelayFrame::Change(event.clone())
            .encode()
            .map_err(|e| TransportError::Encode(e.to_string()))?;
        outgoing.try_send(bytes).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::Backpressure,
            mpsc::error::TrySendError::Closed(_) => TransportError::NotConnected,
        })
    }

    fn disconnect(&mut self) {
        self.stop();
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl Drop for WsChannel {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn test_connect_failure_reports_error() {
        // Bind then drop to get a port with nothing listening.
        let port = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let mut ch = WsChannel::new(format!("ws://127.0.0.1:{port}"), Uuid::new_v4());
        let (tx, mut rx) = mpsc::unbounded_channel();
        ch.connect(Uuid::new_v4(), tx).unwrap();

        let notice = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        assert!(matches!(notice, ChannelNotice::Status(ChannelStatus::Error(_))));
        assert!(!ch.is_connected());
    }

    #[tokio::test]
    async fn test_server_close_reports_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let _join = ws.next().await;
            let _ = ws.send(Message::Close(None)).await;
        });

        let mut ch = WsChannel::new(format!("ws://127.0.0.1:{port}"), Uuid::new_v4());
        let (tx, mut rx) = mpsc::unbounded_channel();
        ch.connect(Uuid::new_v4(), tx).unwrap();

        let first = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        assert_eq!(first, ChannelNotice::Status(ChannelStatus::Connected));
        let second = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        assert!(matches!(second, ChannelNotice::Status(ChannelStatus::Error(_))));
        assert!(!ch.is_connected());
    }

    #[test]
    fn test_send_before_connect_fails() {
        let ch = WsChannel::new("ws://127.0.0.1:1", Uuid::new_v4());
        assert_eq!(ch.url(), "ws://127.0.0.1:1");
        let meta = easel_core::EditorMeta::new("u", "U", 1);
        let event = ChangeEvent::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            crate::protocol::Change::Deleted { object_id: Uuid::new_v4() },
            1,
            &meta,
        );
        assert!(matches!(ch.send(&event), Err(TransportError::NotConnected)));
    }
}
