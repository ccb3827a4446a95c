//! # Streaming Session
//!
//! One task per accepted `/ws/telemetry` connection. On every tick the session
//! re-reads the snapshot and sends it as a text frame (or the offline payload
//! when the snapshot is unavailable). Client frames are read only to notice a
//! close; their content is ignored.
//!
//! A session ends when the peer closes, the socket errors, or a send fails.
//! The end is local to the session: nothing else is notified or cancelled.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info};
use uuid::Uuid;

use crate::pacer::Pacer;
use crate::state::{snapshot_or_offline, StateStore};

/// Why a session stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// The client sent a close frame or disconnected.
    PeerClosed,
    /// Writing a frame failed.
    SendFailed(String),
    /// Reading from the socket failed.
    ReadFailed(String),
}

/// Upper bound on one frame send when no other limit is configured.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(3);

pub struct StreamSession {
    id: Uuid,
    store: Arc<dyn StateStore>,
    send_timeout: Duration,
}

impl StreamSession {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            id: Uuid::new_v4(),
            store,
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }

    /// Bound each frame send. A peer that stops reading (or a half-open
    /// connection) ends the session with [`SessionEnd::SendFailed`] once a
    /// send has been pending this long.
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Stream snapshots over `ws` until the connection goes away.
    pub async fn run<S, P>(self, ws: WebSocketStream<S>, mut pacer: P) -> SessionEnd
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
        P: Pacer,
    {
        info!(session = %self.id, "telemetry session opened");
        let (mut sink, mut incoming) = ws.split();
        let mut frames_sent: u64 = 0;

        let end = loop {
            tokio::select! {
                _ = pacer.tick() => {
                    let payload = snapshot_or_offline(self.store.as_ref()).to_string();
                    match tokio::time::timeout(self.send_timeout, sink.send(WsMessage::Text(payload))).await {
                        Ok(Ok(())) => frames_sent += 1,
                        Ok(Err(e)) => break SessionEnd::SendFailed(e.to_string()),
                        Err(_) => break SessionEnd::SendFailed("send timed out".to_string()),
                    }
                }
                msg = incoming.next() => match msg {
                    Some(Ok(WsMessage::Close(_))) | None => {
                        let _ = tokio::time::timeout(self.send_timeout, sink.close()).await;
                        break SessionEnd::PeerClosed;
                    }
                    Some(Ok(_)) => {}
                    // EOF without a close frame: the peer went away.
                    Some(Err(WsError::ConnectionClosed
                        | WsError::AlreadyClosed
                        | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake))) => {
                        break SessionEnd::PeerClosed;
                    }
                    Some(Err(e)) => break SessionEnd::ReadFailed(e.to_string()),
                },
            }
        };

        match &end {
            SessionEnd::PeerClosed => {
                info!(session = %self.id, frames_sent, "telemetry session closed by peer")
            }
            other => debug!(session = %self.id, frames_sent, reason = ?other, "telemetry session ended"),
        }
        end
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pacer::ManualPacer;
    use crate::state::MemoryStateStore;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::ReadBuf;
    use tokio_tungstenite::tungstenite::protocol::Role;

    async fn ws_pair() -> (
        WebSocketStream<tokio::io::DuplexStream>,
        WebSocketStream<tokio::io::DuplexStream>,
    ) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let server = WebSocketStream::from_raw_socket(a, Role::Server, None).await;
        let client = WebSocketStream::from_raw_socket(b, Role::Client, None).await;
        (server, client)
    }

    async fn next_text(client: &mut WebSocketStream<tokio::io::DuplexStream>) -> serde_json::Value {
        let msg = tokio::time::timeout(Duration::from_secs(2), client.next())
            .await
            .expect("frame within timeout")
            .expect("stream open")
            .expect("frame ok");
        match msg {
            WsMessage::Text(t) => serde_json::from_str(&t).unwrap(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn sends_offline_payload_when_snapshot_missing() {
        let store = Arc::new(MemoryStateStore::new());
        let (server, mut client) = ws_pair().await;
        let (handle, pacer) = ManualPacer::new();
        let task = tokio::spawn(StreamSession::new(store).run(server, pacer));

        handle.advance();
        assert_eq!(next_text(&mut client).await, serde_json::json!({"error": "offline"}));

        client.close(None).await.unwrap();
        let end = tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert_eq!(end, SessionEnd::PeerClosed);
    }

    #[tokio::test]
    async fn each_tick_reads_fresh_snapshot() {
        let store = Arc::new(MemoryStateStore::new());
        store.set_snapshot(&serde_json::json!({"tick": 1}));
        let (server, mut client) = ws_pair().await;
        let (handle, pacer) = ManualPacer::new();
        let task = tokio::spawn(StreamSession::new(store.clone()).run(server, pacer));

        handle.advance();
        assert_eq!(next_text(&mut client).await["tick"], 1);

        store.set_snapshot(&serde_json::json!({"tick": 2}));
        handle.advance();
        assert_eq!(next_text(&mut client).await["tick"], 2);

        client.close(None).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn client_messages_are_ignored() {
        let store = Arc::new(MemoryStateStore::new());
        store.set_snapshot(&serde_json::json!({"nodes": 3}));
        let (server, mut client) = ws_pair().await;
        let (handle, pacer) = ManualPacer::new();
        let task = tokio::spawn(StreamSession::new(store).run(server, pacer));

        client
            .send(WsMessage::Text(r#"{"command":"run_tests"}"#.into()))
            .await
            .unwrap();
        handle.advance();
        assert_eq!(next_text(&mut client).await["nodes"], 3);
        assert!(!task.is_finished());

        client.close(None).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn dropped_client_is_peer_closed() {
        let store = Arc::new(MemoryStateStore::new());
        let (server, client) = ws_pair().await;
        let (_handle, pacer) = ManualPacer::new();
        let task = tokio::spawn(StreamSession::new(store).run(server, pacer));

        drop(client);
        let end = tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert_eq!(end, SessionEnd::PeerClosed);
    }

    /// Transport whose reads never complete and whose writes always fail.
    struct BrokenWrites;

    impl AsyncRead for BrokenWrites {
        fn poll_read(self: Pin<&mut Self>, _cx: &mut Context<'_>, _buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
            Poll::Pending
        }
    }

    impl AsyncWrite for BrokenWrites {
        fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, _buf: &[u8]) -> Poll<std::io::Result<usize>> {
            Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn write_failure_ends_session() {
        let store = Arc::new(MemoryStateStore::new());
        store.set_snapshot(&serde_json::json!({"nodes": 1}));
        let ws = WebSocketStream::from_raw_socket(BrokenWrites, Role::Server, None).await;
        let (handle, pacer) = ManualPacer::new();
        let task = tokio::spawn(StreamSession::new(store).run(ws, pacer));

        handle.advance();
        let end = tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert!(matches!(end, SessionEnd::SendFailed(_)), "{end:?}");
    }

    #[tokio::test]
    async fn stalled_reader_ends_session_after_send_timeout() {
        let store = Arc::new(MemoryStateStore::new());
        store.set_snapshot(&serde_json::json!({"blob": "x".repeat(4096)}));
        let (a, b) = tokio::io::duplex(1024);
        let server = WebSocketStream::from_raw_socket(a, Role::Server, None).await;
        // Kept alive but never read from.
        let _client = b;

        let (handle, pacer) = ManualPacer::new();
        let session = StreamSession::new(store).with_send_timeout(Duration::from_millis(100));
        let task = tokio::spawn(session.run(server, pacer));

        for _ in 0..20 {
            handle.advance();
        }
        let end = tokio::time::timeout(Duration::from_secs(3), task)
            .await
            .expect("session must not hang on a stalled peer")
            .unwrap();
        assert_eq!(end, SessionEnd::SendFailed("send timed out".into()));
    }

    #[tokio::test]
    async fn no_frames_after_peer_close() {
        let store = Arc::new(MemoryStateStore::new());
        store.set_snapshot(&serde_json::json!({"nodes": 1}));
        let (server, mut client) = ws_pair().await;
        let (handle, pacer) = ManualPacer::new();
        let task = tokio::spawn(StreamSession::new(store).run(server, pacer));

        client.close(None).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert!(!handle.advance(), "pacer dropped with the finished session");
    }

    #[test]
    fn session_ids_are_unique() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let a = StreamSession::new(store.clone());
        let b = StreamSession::new(store);
        assert_ne!(a.id(), b.id());
    }
}
