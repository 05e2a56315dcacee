// src/session.rs - WebSocket session table and frame relaying over a tunnel

use crate::conn::{WsConn, WsReader};
use crate::protocol::{FrameKind, MessageKind, WebsocketClosePayload, WebsocketMessagePayload};
use crate::registry::SyncMap;
use crate::tunnel::Tunnel;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{Instrument, debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session {0} is already registered")]
    Duplicate(String),
}

enum Outbound {
    Frame(WsMessage),
    Close,
}

/// How long frames for a not yet reserved session are kept.
const EARLY_FRAME_TTL: Duration = Duration::from_secs(5);
const EARLY_FRAME_LIMIT: usize = 64;

#[derive(Clone)]
struct Session {
    outbound: mpsc::UnboundedSender<Outbound>,
}

struct EarlyFrames {
    since: Instant,
    items: Vec<Outbound>,
}

/// Local WebSocket connections bridged over one tunnel, keyed by session id.
///
/// Frames for a session are queued and written by a single task, so they
/// reach the local socket in the order the tunnel delivered them.
///
/// The peer may start relaying a session before this side has reserved its
/// id. Such frames are held for a short while and replayed on reservation.
#[derive(Default)]
pub struct Sessions {
    table: SyncMap<Session>,
    early: Mutex<HashMap<String, EarlyFrames>>,
}

/// A reserved session id whose local socket is not connected yet. Frames
/// that arrive in the meantime are buffered.
pub struct SessionSlot {
    id: String,
    outbound: mpsc::UnboundedReceiver<Outbound>,
}

impl SessionSlot {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Start writing queued and future frames to `conn`.
    pub fn attach(self, conn: WsConn) {
        let SessionSlot { id, mut outbound } = self;
        tokio::spawn(
            async move {
                while let Some(item) = outbound.recv().await {
                    match item {
                        Outbound::Frame(frame) => {
                            if let Err(e) = conn.write_message(frame).await {
                                debug!(session_id = %id, error = %e, "WebSocket session write failed.");
                                break;
                            }
                        }
                        Outbound::Close => break,
                    }
                }
                if let Err(e) = conn.close().await {
                    debug!(session_id = %id, error = %e, "WebSocket session close did not complete cleanly.");
                }
            }
            .in_current_span(),
        );
    }
}

impl Sessions {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Claim `id`. A second claim on a live id is rejected, never replaced.
    pub fn reserve(&self, id: &str) -> Result<SessionSlot, SessionError> {
        let mut early = self.early();
        if self.table.contains(id) {
            return Err(SessionError::Duplicate(id.to_string()));
        }

        // Held frames are queued before the id becomes visible to `deliver`.
        let (tx, rx) = mpsc::unbounded_channel();
        let mut closed = false;
        if let Some(held) = early.remove(id) {
            debug!(session_id = %id, frames = held.items.len(), "Replaying early WebSocket frames.");
            for item in held.items {
                closed |= matches!(item, Outbound::Close);
                let _ = tx.send(item);
            }
        }
        if !closed {
            self.table.set_if_absent(id, Session { outbound: tx });
        }

        Ok(SessionSlot {
            id: id.to_string(),
            outbound: rx,
        })
    }

    /// Queue a frame for the session. Frames for ids not reserved yet are
    /// held briefly.
    pub fn deliver(&self, payload: WebsocketMessagePayload) {
        let frame = match payload.kind {
            FrameKind::Text => match String::from_utf8(payload.data) {
                Ok(text) => WsMessage::Text(text.into()),
                Err(e) => {
                    warn!(session_id = %payload.session_id, error = %e, "Dropping text frame with invalid UTF-8.");
                    return;
                }
            },
            FrameKind::Binary => WsMessage::Binary(payload.data.into()),
        };
        self.route(&payload.session_id, Outbound::Frame(frame));
    }

    /// Close requested by the peer. A close for an id not reserved yet is
    /// held like a frame, so the session ends right after it is reserved.
    pub fn close_from_peer(&self, id: &str) {
        if self.close_session(id) {
            debug!(session_id = %id, "WebSocket session closed by peer.");
        } else {
            self.route(id, Outbound::Close);
        }
    }

    fn route(&self, id: &str, item: Outbound) {
        if let Some(session) = self.table.get(id) {
            let _ = session.outbound.send(item);
            return;
        }

        let mut early = self.early();
        if let Some(session) = self.table.get(id) {
            let _ = session.outbound.send(item);
            return;
        }

        early.retain(|_, held| held.since.elapsed() < EARLY_FRAME_TTL);
        let held = early.entry(id.to_string()).or_insert_with(|| EarlyFrames {
            since: Instant::now(),
            items: Vec::new(),
        });
        if held.items.len() >= EARLY_FRAME_LIMIT {
            debug!(session_id = %id, "Frame for unknown WebSocket session dropped.");
            return;
        }
        held.items.push(item);
    }

    fn early(&self) -> MutexGuard<'_, HashMap<String, EarlyFrames>> {
        self.early.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Deregister the session and close its socket once queued frames are out.
    /// Returns `false` if it was already gone.
    pub fn close_session(&self, id: &str) -> bool {
        match self.table.delete(id) {
            Some(session) => {
                let _ = session.outbound.send(Outbound::Close);
                true
            }
            None => false,
        }
    }

    pub fn close_all(&self) {
        self.early().clear();
        let mut closed = 0usize;
        self.table.range_and_clear(|_, session| {
            let _ = session.outbound.send(Outbound::Close);
            closed += 1;
        });
        if closed > 0 {
            debug!(sessions = closed, "Closed WebSocket sessions.");
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.table.contains(id)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Wire the session message handlers into `tunnel` and close every session
    /// when it goes down.
    pub fn install(self: &Arc<Self>, tunnel: &Tunnel) {
        let sessions = self.clone();
        tunnel.register_inline_handler(MessageKind::WebsocketMessage, move |_, message| {
            match message.decode_payload::<WebsocketMessagePayload>() {
                Ok(payload) => sessions.deliver(payload),
                Err(e) => warn!(id = %message.id, error = %e, "Dropping undecodable WebSocket frame."),
            }
        });

        let sessions = self.clone();
        tunnel.register_inline_handler(MessageKind::WebsocketClose, move |_, message| {
            match message.decode_payload::<WebsocketClosePayload>() {
                Ok(payload) => sessions.close_from_peer(&payload.session_id),
                Err(e) => warn!(id = %message.id, error = %e, "Dropping undecodable WebSocket close."),
            }
        });

        let sessions = self.clone();
        tunnel.set_close_handler(move || sessions.close_all());
    }
}

/// Relay frames read from a local socket into the tunnel until either side
/// goes away. When the local side ends first, the peer is told to close its
/// end of the session.
pub async fn forward_frames(tunnel: Tunnel, sessions: Arc<Sessions>, session_id: String, mut reader: WsReader) {
    debug!(session_id = %session_id, "WebSocket session relay started.");

    loop {
        let frame = tokio::select! {
            _ = tunnel.done() => break,
            frame = reader.read_message() => frame,
        };

        let (kind, data) = match frame {
            Some(Ok(WsMessage::Text(text))) => (FrameKind::Text, text.as_bytes().to_vec()),
            Some(Ok(WsMessage::Binary(bytes))) => (FrameKind::Binary, bytes.to_vec()),
            Some(Ok(WsMessage::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                debug!(session_id = %session_id, error = %e, "WebSocket session read failed.");
                break;
            }
        };

        let payload = WebsocketMessagePayload {
            session_id: session_id.clone(),
            kind,
            data,
        };
        if let Err(e) = tunnel.send(MessageKind::WebsocketMessage, &payload).await {
            debug!(session_id = %session_id, error = %e, "Failed to relay WebSocket frame.");
            break;
        }
    }

    if sessions.close_session(&session_id) && !tunnel.is_closed() {
        let payload = WebsocketClosePayload {
            session_id: session_id.clone(),
        };
        if let Err(e) = tunnel.send(MessageKind::WebsocketClose, &payload).await {
            debug!(session_id = %session_id, error = %e, "Failed to send WebSocket close.");
        }
    }

    debug!(session_id = %session_id, "WebSocket session relay finished.");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::split_socket;
    use tokio::io::DuplexStream;
    use tokio_tungstenite::WebSocketStream;
    use tokio_tungstenite::tungstenite::protocol::Role;

    async fn socket_pair() -> (WebSocketStream<DuplexStream>, WebSocketStream<DuplexStream>) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (
            WebSocketStream::from_raw_socket(a, Role::Client, None).await,
            WebSocketStream::from_raw_socket(b, Role::Server, None).await,
        )
    }

    fn frame(session_id: &str, text: &str) -> WebsocketMessagePayload {
        WebsocketMessagePayload {
            session_id: session_id.to_string(),
            kind: FrameKind::Text,
            data: text.as_bytes().to_vec(),
        }
    }

    #[test]
    fn test_duplicate_reservation_rejected() {
        let sessions = Sessions::new();
        let _slot = sessions.reserve("s1").unwrap();

        match sessions.reserve("s1") {
            Err(SessionError::Duplicate(id)) => assert_eq!(id, "s1"),
            Ok(_) => panic!("Duplicate session accepted"),
        }
        assert_eq!(sessions.len(), 1);
    }

    #[tokio::test]
    async fn test_frames_buffered_until_attach_arrive_in_order() {
        let sessions = Sessions::new();
        let slot = sessions.reserve("s1").unwrap();

        for i in 0..5 {
            sessions.deliver(frame("s1", &i.to_string()));
        }

        let (local, remote) = socket_pair().await;
        let (conn, _reader) = split_socket(local);
        let (_remote_conn, mut remote_reader) = split_socket(remote);
        slot.attach(conn);

        for i in 0..5 {
            match remote_reader.read_message().await {
                Some(Ok(WsMessage::Text(text))) => assert_eq!(text.as_str(), i.to_string()),
                other => panic!("Unexpected frame: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_close_session_closes_socket() {
        let sessions = Sessions::new();
        let slot = sessions.reserve("s1").unwrap();
        let (local, remote) = socket_pair().await;
        let (conn, _reader) = split_socket(local);
        let (_remote_conn, mut remote_reader) = split_socket(remote);
        slot.attach(conn);

        sessions.deliver(frame("s1", "last"));
        assert!(sessions.close_session("s1"));
        assert!(!sessions.close_session("s1"));
        assert!(!sessions.contains("s1"));

        match remote_reader.read_message().await {
            Some(Ok(WsMessage::Text(text))) => assert_eq!(text.as_str(), "last"),
            other => panic!("Unexpected frame: {:?}", other),
        }
        match remote_reader.read_message().await {
            Some(Ok(WsMessage::Close(_))) => {}
            other => panic!("Unexpected frame: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_early_frames_replayed_on_reserve() {
        let sessions = Sessions::new();
        sessions.deliver(frame("s1", "first"));
        sessions.deliver(frame("s1", "second"));
        assert!(sessions.is_empty());

        let slot = sessions.reserve("s1").unwrap();
        sessions.deliver(frame("s1", "third"));

        let (local, remote) = socket_pair().await;
        let (conn, _reader) = split_socket(local);
        let (_remote_conn, mut remote_reader) = split_socket(remote);
        slot.attach(conn);

        for expected in ["first", "second", "third"] {
            match remote_reader.read_message().await {
                Some(Ok(WsMessage::Text(text))) => assert_eq!(text.as_str(), expected),
                other => panic!("Unexpected frame: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_early_close_ends_session_after_reserve() {
        let sessions = Sessions::new();
        sessions.deliver(frame("s1", "bye"));
        sessions.close_from_peer("s1");

        let slot = sessions.reserve("s1").unwrap();
        assert!(!sessions.contains("s1"));

        let (local, remote) = socket_pair().await;
        let (conn, _reader) = split_socket(local);
        let (_remote_conn, mut remote_reader) = split_socket(remote);
        slot.attach(conn);

        match remote_reader.read_message().await {
            Some(Ok(WsMessage::Text(text))) => assert_eq!(text.as_str(), "bye"),
            other => panic!("Unexpected frame: {:?}", other),
        }
        match remote_reader.read_message().await {
            Some(Ok(WsMessage::Close(_))) => {}
            other => panic!("Unexpected frame: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_close_all_empties_table() {
        let sessions = Sessions::new();
        let _a = sessions.reserve("a").unwrap();
        let _b = sessions.reserve("b").unwrap();

        sessions.close_all();
        assert!(sessions.is_empty());
    }
}
