// src/conn.rs - WebSocket connection wrapper with serialized writes and idempotent close

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::Serialize;
use std::pin::Pin;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_util::sync::CancellationToken;

/// Bounded wait for the close handshake before the transport is dropped.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum ConnError {
    #[error("connection closed")]
    Closed,
    #[error("websocket error: {0}")]
    Ws(#[from] WsError),
    #[error("failed to encode frame: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("close handshake timed out")]
    CloseTimeout,
}

impl ConnError {
    /// True when the error only reports that the peer is already gone.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            ConnError::Closed
                | ConnError::Ws(WsError::ConnectionClosed)
                | ConnError::Ws(WsError::AlreadyClosed)
        )
    }
}

type FrameSink = Pin<Box<dyn Sink<WsMessage, Error = WsError> + Send>>;
type FrameStream = Pin<Box<dyn Stream<Item = Result<WsMessage, WsError>> + Send>>;

struct Writer {
    sink: FrameSink,
    closed: bool,
}

/// Write half of a WebSocket. Every write holds an exclusive lock for the
/// duration of one frame, so concurrent senders never interleave.
pub struct WsConn {
    writer: Mutex<Writer>,
    closed: CancellationToken,
}

/// Read half of a WebSocket. Exactly one task owns it.
pub struct WsReader {
    stream: FrameStream,
    closed: CancellationToken,
}

/// Split a WebSocket into its shared write half and single-owner read half.
pub fn split_socket<S>(ws: WebSocketStream<S>) -> (WsConn, WsReader)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = ws.split();
    let sink: FrameSink = Box::pin(sink);
    let stream: FrameStream = Box::pin(stream);
    let closed = CancellationToken::new();
    (
        WsConn {
            writer: Mutex::new(Writer { sink, closed: false }),
            closed: closed.clone(),
        },
        WsReader { stream, closed },
    )
}

impl WsConn {
    pub async fn write_message(&self, message: WsMessage) -> Result<(), ConnError> {
        let mut writer = self.writer.lock().await;
        if writer.closed || self.closed.is_cancelled() {
            return Err(ConnError::Closed);
        }
        writer.sink.send(message).await?;
        Ok(())
    }

    /// Encode `value` as JSON and send it as a single text frame.
    pub async fn write_json<T: Serialize>(&self, value: &T) -> Result<(), ConnError> {
        let text = serde_json::to_string(value)?;
        self.write_message(WsMessage::Text(text.into())).await
    }

    pub async fn close(&self) -> Result<(), ConnError> {
        self.close_with_timeout(CLOSE_TIMEOUT).await
    }

    /// Send a normal-closure frame and shut the sink down. The first caller
    /// performs the close; later callers return `Ok(())` without touching the
    /// socket. Gives up after `limit`, dropping pending handshake work.
    pub async fn close_with_timeout(&self, limit: Duration) -> Result<(), ConnError> {
        self.closed.cancel();

        let handshake = async {
            let mut writer = self.writer.lock().await;
            if writer.closed {
                return Ok(());
            }
            writer.closed = true;

            let frame = CloseFrame {
                code: CloseCode::Normal,
                reason: "".into(),
            };
            match writer.sink.send(WsMessage::Close(Some(frame))).await {
                Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => {}
                Err(e) => return Err(ConnError::Ws(e)),
            }
            match writer.sink.close().await {
                Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(()),
                Err(e) => Err(ConnError::Ws(e)),
            }
        };

        tokio::time::timeout(limit, handshake)
            .await
            .map_err(|_| ConnError::CloseTimeout)?
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the connection has been closed locally.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }
}

impl WsReader {
    /// Next frame from the peer, or `None` once the stream ended or the
    /// connection was closed from this side.
    pub async fn read_message(&mut self) -> Option<Result<WsMessage, WsError>> {
        tokio::select! {
            _ = self.closed.cancelled() => None,
            next = self.stream.next() => next,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::io::DuplexStream;
    use tokio_tungstenite::tungstenite::protocol::Role;

    async fn pair() -> (WebSocketStream<DuplexStream>, WebSocketStream<DuplexStream>) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let client = WebSocketStream::from_raw_socket(a, Role::Client, None).await;
        let server = WebSocketStream::from_raw_socket(b, Role::Server, None).await;
        (client, server)
    }

    #[tokio::test]
    async fn test_concurrent_writes_are_whole_frames() {
        let (client, server) = pair().await;
        let (conn, _reader) = split_socket(client);
        let conn = Arc::new(conn);
        let (_peer_conn, mut peer_reader) = split_socket(server);

        let mut tasks = Vec::new();
        for i in 0..16 {
            let conn = conn.clone();
            tasks.push(tokio::spawn(async move {
                conn.write_json(&serde_json::json!({ "n": i, "pad": "x".repeat(512) }))
                    .await
                    .unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let mut seen = Vec::new();
        for _ in 0..16 {
            match peer_reader.read_message().await {
                Some(Ok(WsMessage::Text(text))) => {
                    let value: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
                    seen.push(value["n"].as_u64().unwrap());
                }
                other => panic!("Unexpected frame: {:?}", other),
            }
        }
        seen.sort();
        assert_eq!(seen, (0..16).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (client, _server) = pair().await;
        let (conn, _reader) = split_socket(client);

        assert!(!conn.is_closed());
        conn.close().await.unwrap();
        assert!(conn.is_closed());
        conn.close().await.unwrap();

        match conn.write_message(WsMessage::Text("late".into())).await {
            Err(ConnError::Closed) => {}
            other => panic!("Unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_local_close_stops_reader() {
        let (client, _server) = pair().await;
        let (conn, mut reader) = split_socket(client);

        conn.close().await.unwrap();
        assert!(reader.read_message().await.is_none());
    }

    #[tokio::test]
    async fn test_peer_sees_normal_close() {
        let (client, server) = pair().await;
        let (conn, _reader) = split_socket(client);
        let (_peer_conn, mut peer_reader) = split_socket(server);

        conn.close().await.unwrap();
        match peer_reader.read_message().await {
            Some(Ok(WsMessage::Close(Some(frame)))) => assert_eq!(frame.code, CloseCode::Normal),
            other => panic!("Unexpected frame: {:?}", other),
        }
    }
}
