// src/tunnel.rs - Bidirectional tunnel engine shared by client and server

use crate::conn::{ConnError, WsConn, WsReader, split_socket};
use crate::protocol::{Message, MessageKind, ProtocolError};
use crate::registry::SyncMap;
use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::any::Any;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::error::ProtocolError as WsProtocolError;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, info, warn};

/// Close wait used when the peer already started the close handshake.
const PEER_CLOSE_TIMEOUT: Duration = Duration::from_millis(100);

/// Replies queued for a consumer whose channel is full. Past this the
/// consumer is cut off.
pub const REPLY_BACKLOG_LIMIT: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("tunnel closed")]
    Closed,
    #[error("message id {0} already has a pending reply")]
    DuplicateId(String),
    #[error("tunnel is already listening")]
    AlreadyListening,
    #[error("timed out waiting for reply")]
    Timeout,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Conn(ConnError),
    #[error("transport error: {0}")]
    Transport(#[from] WsError),
}

impl From<ConnError> for TunnelError {
    fn from(e: ConnError) -> Self {
        match e {
            ConnError::Closed => TunnelError::Closed,
            other => TunnelError::Conn(other),
        }
    }
}

type HandlerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type TaskHandler = Arc<dyn Fn(Tunnel, Message) -> HandlerFuture + Send + Sync>;
type InlineHandler = Arc<dyn Fn(&Tunnel, Message) + Send + Sync>;

#[derive(Clone)]
enum Handler {
    /// Runs on a fresh task per message.
    Task(TaskHandler),
    /// Runs on the receive loop itself, in arrival order. Must not block.
    Inline(InlineHandler),
}
type CloseHandler = Box<dyn FnOnce() + Send>;

enum ConsumerState {
    /// Channel had room for everything so far.
    Direct(mpsc::Sender<Message>),
    /// Channel filled up once; everything since goes through one forwarder
    /// task in arrival order.
    Backlogged {
        queue: mpsc::UnboundedSender<Message>,
        depth: Arc<AtomicUsize>,
    },
    Dropped,
}

/// One registered receiver of replies.
struct Consumer {
    state: StdMutex<ConsumerState>,
}

impl Consumer {
    fn new(tx: mpsc::Sender<Message>) -> Arc<Self> {
        Arc::new(Self {
            state: StdMutex::new(ConsumerState::Direct(tx)),
        })
    }

    /// Hand `message` over without waiting, keeping arrival order.
    fn offer(&self, message: Message) {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let next = match &*state {
            ConsumerState::Direct(tx) => match tx.try_send(message) {
                Ok(()) => None,
                Err(mpsc::error::TrySendError::Closed(_)) => Some(ConsumerState::Dropped),
                Err(mpsc::error::TrySendError::Full(message)) => {
                    let (queue, pending) = mpsc::unbounded_channel();
                    let depth = Arc::new(AtomicUsize::new(1));
                    let _ = queue.send(message);
                    tokio::spawn(forward_backlog(tx.clone(), pending, depth.clone()));
                    Some(ConsumerState::Backlogged { queue, depth })
                }
            },
            ConsumerState::Backlogged { queue, depth } => {
                if depth.load(Ordering::Acquire) >= REPLY_BACKLOG_LIMIT {
                    warn!(re = %message.re, limit = REPLY_BACKLOG_LIMIT, "Reply consumer too slow, cutting it off.");
                    Some(ConsumerState::Dropped)
                } else {
                    depth.fetch_add(1, Ordering::AcqRel);
                    queue.send(message).is_err().then_some(ConsumerState::Dropped)
                }
            }
            ConsumerState::Dropped => None,
        };
        if let Some(next) = next {
            *state = next;
        }
    }
}

async fn forward_backlog(tx: mpsc::Sender<Message>, mut pending: mpsc::UnboundedReceiver<Message>, depth: Arc<AtomicUsize>) {
    while let Some(message) = pending.recv().await {
        depth.fetch_sub(1, Ordering::AcqRel);
        if tx.send(message).await.is_err() {
            break;
        }
    }
}

struct Inner {
    conn: WsConn,
    reader: Mutex<Option<WsReader>>,
    replies: SyncMap<Vec<Arc<Consumer>>>,
    handlers: DashMap<MessageKind, Handler>,
    context: DashMap<String, Arc<dyn Any + Send + Sync>>,
    closing: StdMutex<bool>,
    closed: CancellationToken,
    close_handler: StdMutex<Option<CloseHandler>>,
    last_receive: StdMutex<Instant>,
    span: Span,
}

/// One end of a tunnel. Cheap to clone; all clones share the same socket.
#[derive(Clone)]
pub struct Tunnel {
    inner: Arc<Inner>,
}

/// Keeps a reply registration alive. Dropping it removes the id from the
/// correlation registry, so abandoned requests never accumulate.
pub struct Correlation {
    id: String,
    tunnel: Tunnel,
}

impl Correlation {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for Correlation {
    fn drop(&mut self) {
        self.tunnel.inner.replies.delete(&self.id);
    }
}

impl Tunnel {
    /// Wrap an established WebSocket. `span` carries the fields every log
    /// line from this tunnel should include.
    pub fn new<S>(ws: WebSocketStream<S>, span: Span) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (conn, reader) = split_socket(ws);
        Self {
            inner: Arc::new(Inner {
                conn,
                reader: Mutex::new(Some(reader)),
                replies: SyncMap::new(),
                handlers: DashMap::new(),
                context: DashMap::new(),
                closing: StdMutex::new(false),
                closed: CancellationToken::new(),
                close_handler: StdMutex::new(None),
                last_receive: StdMutex::new(Instant::now()),
                span,
            }),
        }
    }

    pub fn span(&self) -> &Span {
        &self.inner.span
    }

    /// Send an unsolicited message. Returns the id it was sent under.
    pub async fn send<P: Serialize>(&self, kind: MessageKind, payload: &P) -> Result<String, TunnelError> {
        let message = Message::new(kind, payload)?;
        self.write(&message).await?;
        Ok(message.id)
    }

    /// Send a message and route every reply carrying its id to `consumer`.
    ///
    /// The registration is made before the frame is written, so a fast reply
    /// can never race ahead of it. Keep the returned [`Correlation`] for as
    /// long as replies are wanted.
    pub async fn send_with_correlation<P: Serialize>(
        &self,
        kind: MessageKind,
        payload: &P,
        consumer: mpsc::Sender<Message>,
    ) -> Result<Correlation, TunnelError> {
        let message = Message::new(kind, payload)?;
        if !self.inner.replies.set_if_absent(message.id.clone(), vec![Consumer::new(consumer)]) {
            return Err(TunnelError::DuplicateId(message.id));
        }
        let correlation = Correlation {
            id: message.id.clone(),
            tunnel: self.clone(),
        };

        // Close drains the registry after flagging; checking here covers inserts
        // that landed after the drain.
        if self.is_closed() {
            return Err(TunnelError::Closed);
        }

        self.write(&message).await?;
        Ok(correlation)
    }

    /// Attach another consumer to a pending id. Returns `false` when the id
    /// has no live registration.
    pub fn subscribe(&self, id: &str, consumer: mpsc::Sender<Message>) -> bool {
        self.inner
            .replies
            .update(id, |consumers| consumers.push(Consumer::new(consumer)))
    }

    /// Route messages whose `re` is `id` to `consumer`, for an id the peer
    /// chose. Used to hear back about a request this side is serving.
    pub fn watch(&self, id: &str, consumer: mpsc::Sender<Message>) -> Result<Correlation, TunnelError> {
        if !self.inner.replies.set_if_absent(id, vec![Consumer::new(consumer)]) {
            return Err(TunnelError::DuplicateId(id.to_string()));
        }
        let correlation = Correlation {
            id: id.to_string(),
            tunnel: self.clone(),
        };
        if self.is_closed() {
            return Err(TunnelError::Closed);
        }
        Ok(correlation)
    }

    /// Send a message and wait for its first reply.
    pub async fn request<P: Serialize>(
        &self,
        kind: MessageKind,
        payload: &P,
        limit: Option<Duration>,
    ) -> Result<Message, TunnelError> {
        let (tx, mut rx) = mpsc::channel(1);
        let _correlation = self.send_with_correlation(kind, payload, tx).await?;

        let reply = match limit {
            Some(limit) => tokio::time::timeout(limit, rx.recv())
                .await
                .map_err(|_| TunnelError::Timeout)?,
            None => rx.recv().await,
        };
        reply.ok_or(TunnelError::Closed)
    }

    /// Reply to `re`. Replies are terminal and never registered.
    pub async fn send_response<P: Serialize>(
        &self,
        kind: MessageKind,
        re: &str,
        payload: &P,
    ) -> Result<(), TunnelError> {
        let mut message = Message::new(kind, payload)?;
        message.re = re.to_string();
        self.write(&message).await
    }

    async fn write(&self, message: &Message) -> Result<(), TunnelError> {
        self.inner.conn.write_json(message).await?;
        Ok(())
    }

    /// Install the handler for unsolicited messages of `kind`, replacing any
    /// previous one.
    pub fn register_handler<F, Fut>(&self, kind: MessageKind, handler: F)
    where
        F: Fn(Tunnel, Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: TaskHandler = Arc::new(move |tunnel, message| Box::pin(handler(tunnel, message)));
        self.inner.handlers.insert(kind, Handler::Task(handler));
    }

    /// Install a handler that runs directly on the receive loop, so messages
    /// of `kind` are seen strictly in arrival order. It must return quickly
    /// and never block.
    pub fn register_inline_handler<F>(&self, kind: MessageKind, handler: F)
    where
        F: Fn(&Tunnel, Message) + Send + Sync + 'static,
    {
        self.inner.handlers.insert(kind, Handler::Inline(Arc::new(handler)));
    }

    /// Like [`register_handler`](Self::register_handler), decoding the payload
    /// first. Messages whose payload does not decode are logged and dropped.
    pub fn on<T, F, Fut>(&self, kind: MessageKind, handler: F)
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(Tunnel, Message, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.register_handler(kind, move |tunnel, message| {
            let handler = handler.clone();
            async move {
                match message.decode_payload::<T>() {
                    Ok(payload) => handler(tunnel, message, payload).await,
                    Err(e) => warn!(
                        id = %message.id,
                        kind = %message.kind,
                        error = %e,
                        "Dropping message with undecodable payload."
                    ),
                }
            }
        });
    }

    /// Run the receive loop until the peer goes away, a transport error
    /// occurs, or `cancel` fires. Only one listener may run per tunnel.
    pub async fn listen(&self, cancel: CancellationToken) -> Result<(), TunnelError> {
        let mut reader = self
            .inner
            .reader
            .lock()
            .await
            .take()
            .ok_or(TunnelError::AlreadyListening)?;

        self.receive_loop(&mut reader, cancel)
            .instrument(self.inner.span.clone())
            .await
    }

    async fn receive_loop(&self, reader: &mut WsReader, cancel: CancellationToken) -> Result<(), TunnelError> {
        debug!("Tunnel receive loop started.");

        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Tunnel listener cancelled.");
                    self.close().await;
                    return Ok(());
                }
                frame = reader.read_message() => frame,
            };

            let frame = match frame {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => return self.handle_read_error(e).await,
                None => {
                    if !self.is_closed() {
                        info!("Tunnel connection ended by peer.");
                        self.shutdown(true).await;
                    }
                    return Ok(());
                }
            };

            self.touch();

            let decoded = match frame {
                WsMessage::Text(text) => Message::from_json(text.as_str()),
                WsMessage::Binary(bytes) => Message::from_slice(&bytes),
                WsMessage::Close(close) => {
                    match close {
                        Some(frame) if frame.code != CloseCode::Normal && frame.code != CloseCode::Away => {
                            error!(code = u16::from(frame.code), reason = %frame.reason.as_str(), "Tunnel closed abnormally by peer.");
                        }
                        _ => info!("Tunnel closed by peer."),
                    }
                    self.shutdown(true).await;
                    return Ok(());
                }
                _ => continue,
            };

            match decoded {
                Ok(message) => self.dispatch(message),
                Err(e) => warn!(error = %e, "Dropping undecodable tunnel frame."),
            }
        }
    }

    async fn handle_read_error(&self, e: WsError) -> Result<(), TunnelError> {
        match e {
            WsError::ConnectionClosed
            | WsError::AlreadyClosed
            | WsError::Protocol(WsProtocolError::ResetWithoutClosingHandshake) => {
                info!("Tunnel connection dropped by peer.");
                self.shutdown(true).await;
                Ok(())
            }
            e => {
                error!(error = %e, "Tunnel read failed.");
                self.shutdown(false).await;
                Err(TunnelError::Transport(e))
            }
        }
    }

    fn dispatch(&self, message: Message) {
        if message.is_reply() {
            self.deliver(message);
            return;
        }

        let handler = self.inner.handlers.get(&message.kind).map(|h| h.value().clone());
        let Some(handler) = handler else {
            debug!(id = %message.id, kind = %message.kind, "No handler for message kind.");
            return;
        };

        match handler {
            Handler::Task(handler) => {
                tokio::spawn(handler(self.clone(), message).instrument(self.inner.span.clone()));
            }
            Handler::Inline(handler) => handler(self, message),
        }
    }

    fn deliver(&self, message: Message) {
        let Some(consumers) = self.inner.replies.get(&message.re) else {
            debug!(re = %message.re, kind = %message.kind, "Undeliverable response dropped.");
            return;
        };

        for consumer in consumers {
            consumer.offer(message.clone());
        }
    }

    fn touch(&self) {
        if let Ok(mut last) = self.inner.last_receive.lock() {
            *last = Instant::now();
        }
    }

    /// When the last frame of any kind arrived from the peer.
    pub fn last_receive_time(&self) -> Instant {
        self.inner
            .last_receive
            .lock()
            .map(|last| *last)
            .unwrap_or_else(|poisoned| *poisoned.into_inner())
    }

    /// Close the tunnel from this side. Safe to call any number of times.
    pub async fn close(&self) {
        self.shutdown(false).await;
    }

    async fn shutdown(&self, peer_closed: bool) {
        {
            let mut closing = match self.inner.closing.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if *closing {
                return;
            }
            *closing = true;
        }

        self.inner.closed.cancel();

        let mut released = 0usize;
        self.inner.replies.range_and_clear(|_, consumers| {
            released += consumers.len();
            drop(consumers);
        });
        if released > 0 {
            debug!(waiters = released, "Released pending reply waiters.");
        }

        let result = if peer_closed {
            self.inner.conn.close_with_timeout(PEER_CLOSE_TIMEOUT).await
        } else {
            self.inner.conn.close().await
        };
        if let Err(e) = result {
            debug!(error = %e, "Tunnel connection close did not complete cleanly.");
        }

        let handler = self.inner.close_handler.lock().ok().and_then(|mut h| h.take());
        if let Some(handler) = handler {
            handler();
        }

        info!("Tunnel closed.");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Resolves once the tunnel is closed.
    pub async fn done(&self) {
        self.inner.closed.cancelled().await
    }

    /// Token cancelled when the tunnel closes, for use in spawned tasks.
    pub fn done_token(&self) -> CancellationToken {
        self.inner.closed.clone()
    }

    /// Callback run once, after the tunnel has closed.
    pub fn set_close_handler(&self, handler: impl FnOnce() + Send + 'static) {
        if let Ok(mut slot) = self.inner.close_handler.lock() {
            *slot = Some(Box::new(handler));
        }
    }

    pub fn set_context<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.inner.context.insert(key.into(), Arc::new(value));
    }

    pub fn get_context<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let value = self.inner.context.get(key)?.value().clone();
        value.downcast::<T>().ok()
    }

    pub fn pending_replies(&self) -> usize {
        self.inner.replies.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{HttpRequestPayload, HttpResponse, HttpResponsePayload, TextPayload};
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio_tungstenite::tungstenite::protocol::Role;

    async fn tunnel_pair() -> (Tunnel, Tunnel) {
        let (a, b) = tokio::io::duplex(256 * 1024);
        let client = WebSocketStream::from_raw_socket(a, Role::Client, None).await;
        let server = WebSocketStream::from_raw_socket(b, Role::Server, None).await;
        (
            Tunnel::new(client, tracing::info_span!("tunnel", side = "client")),
            Tunnel::new(server, tracing::info_span!("tunnel", side = "server")),
        )
    }

    fn spawn_listener(tunnel: &Tunnel) -> tokio::task::JoinHandle<Result<(), TunnelError>> {
        let tunnel = tunnel.clone();
        tokio::spawn(async move { tunnel.listen(CancellationToken::new()).await })
    }

    fn echo_http(tunnel: &Tunnel) {
        tunnel.on(MessageKind::HttpRequest, |tunnel, message, request: HttpRequestPayload| async move {
            let payload = HttpResponsePayload {
                error: None,
                response: HttpResponse {
                    status: 200,
                    headers: Default::default(),
                    body: request.path.into_bytes(),
                },
            };
            tunnel
                .send_response(MessageKind::HttpResponse, &message.id, &payload)
                .await
                .unwrap();
        });
    }

    fn get(path: &str) -> HttpRequestPayload {
        HttpRequestPayload {
            method: "GET".to_string(),
            path: path.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_request_reply_round_trip() {
        let (client, server) = tunnel_pair().await;
        echo_http(&client);
        spawn_listener(&client);
        spawn_listener(&server);

        let reply = server
            .request(MessageKind::HttpRequest, &get("/hello"), Some(Duration::from_secs(5)))
            .await
            .unwrap();

        let payload: HttpResponsePayload = reply.expect(MessageKind::HttpResponse).unwrap();
        assert_eq!(payload.response.status, 200);
        assert_eq!(payload.response.body, b"/hello");
        assert_eq!(server.pending_replies(), 0);
    }

    #[tokio::test]
    async fn test_close_releases_all_waiters() {
        let (client, server) = tunnel_pair().await;
        spawn_listener(&client);
        spawn_listener(&server);

        let mut waiters = Vec::new();
        for i in 0..8 {
            let server = server.clone();
            waiters.push(tokio::spawn(async move {
                server
                    .request(MessageKind::HttpRequest, &get(&format!("/{}", i)), None)
                    .await
            }));
        }

        while server.pending_replies() < 8 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        server.close().await;
        assert!(server.is_closed());

        for waiter in waiters {
            let result = tokio::time::timeout(Duration::from_secs(2), waiter)
                .await
                .expect("waiter stayed blocked after close")
                .unwrap();
            match result {
                Err(TunnelError::Closed) => {}
                other => panic!("Unexpected result: {:?}", other.map(|m| m.kind)),
            }
        }

        server.close().await;
        assert!(server.is_closed());
        assert_eq!(server.pending_replies(), 0);
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (_client, server) = tunnel_pair().await;
        server.close().await;

        match server.request(MessageKind::HttpRequest, &get("/"), None).await {
            Err(TunnelError::Closed) => {}
            other => panic!("Unexpected result: {:?}", other.map(|m| m.kind)),
        }
        assert_eq!(server.pending_replies(), 0);
    }

    #[tokio::test]
    async fn test_timeout_deregisters() {
        let (client, server) = tunnel_pair().await;
        spawn_listener(&client);
        spawn_listener(&server);

        match server
            .request(MessageKind::HttpRequest, &get("/slow"), Some(Duration::from_millis(50)))
            .await
        {
            Err(TunnelError::Timeout) => {}
            other => panic!("Unexpected result: {:?}", other.map(|m| m.kind)),
        }
        assert_eq!(server.pending_replies(), 0);
    }

    #[tokio::test]
    async fn test_peer_close_stops_listener_and_runs_close_handler() {
        let (client, server) = tunnel_pair().await;
        let notified = Arc::new(AtomicBool::new(false));
        let flag = notified.clone();
        server.set_close_handler(move || flag.store(true, Ordering::SeqCst));

        let listener = spawn_listener(&server);
        spawn_listener(&client);
        client.close().await;

        let result = tokio::time::timeout(Duration::from_secs(2), listener)
            .await
            .expect("listener did not stop")
            .unwrap();
        assert!(result.is_ok());
        assert!(server.is_closed());
        assert!(notified.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_cancel_closes_tunnel() {
        let (client, server) = tunnel_pair().await;
        spawn_listener(&client);
        let cancel = CancellationToken::new();
        let listener = {
            let server = server.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { server.listen(cancel).await })
        };

        cancel.cancel();
        listener.await.unwrap().unwrap();
        assert!(server.is_closed());
        tokio::time::timeout(Duration::from_secs(2), client.done())
            .await
            .expect("peer did not observe close");
    }

    #[tokio::test]
    async fn test_second_listen_rejected() {
        let (_client, server) = tunnel_pair().await;
        spawn_listener(&server);
        tokio::time::sleep(Duration::from_millis(10)).await;

        match server.listen(CancellationToken::new()).await {
            Err(TunnelError::AlreadyListening) => {}
            other => panic!("Unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_panicking_handler_does_not_stop_loop() {
        let (client, server) = tunnel_pair().await;
        client.on(MessageKind::Text, |_, _, _: TextPayload| async move {
            panic!("handler failure");
        });
        echo_http(&client);
        spawn_listener(&client);
        spawn_listener(&server);

        server
            .send(MessageKind::Text, &TextPayload { text: "boom".into() })
            .await
            .unwrap();
        let reply = server
            .request(MessageKind::HttpRequest, &get("/after"), Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(reply.kind, MessageKind::HttpResponse);
    }

    #[tokio::test]
    async fn test_undecodable_frame_is_skipped() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let raw = WebSocketStream::from_raw_socket(a, Role::Client, None).await;
        let server = Tunnel::new(
            WebSocketStream::from_raw_socket(b, Role::Server, None).await,
            tracing::info_span!("tunnel"),
        );
        let (raw_conn, _raw_reader) = split_socket(raw);

        let (tx, mut rx) = mpsc::channel(1);
        server.on(MessageKind::Text, move |_, _, text: TextPayload| {
            let tx = tx.clone();
            async move {
                tx.send(text.text).await.unwrap();
            }
        });
        spawn_listener(&server);

        raw_conn
            .write_message(WsMessage::Text("definitely not json".into()))
            .await
            .unwrap();
        raw_conn.write_json(&Message::text("still alive").unwrap()).await.unwrap();

        let text = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(text, "still alive");
        assert!(!server.is_closed());
    }

    #[tokio::test]
    async fn test_subscribe_adds_consumer() {
        let (client, server) = tunnel_pair().await;
        client.register_handler(MessageKind::HttpRequest, |_, _| async {});
        spawn_listener(&client);
        spawn_listener(&server);

        let (first_tx, mut first_rx) = mpsc::channel(1);
        let (second_tx, mut second_rx) = mpsc::channel(1);
        let correlation = server
            .send_with_correlation(MessageKind::HttpRequest, &get("/x"), first_tx)
            .await
            .unwrap();
        assert!(server.subscribe(correlation.id(), second_tx));
        assert!(!server.subscribe("missing", mpsc::channel(1).0));

        let mut reply = Message::new(MessageKind::HttpResponse, &HttpResponsePayload::default()).unwrap();
        reply.re = correlation.id().to_string();
        client.write(&reply).await.unwrap();

        let first = first_rx.recv().await.unwrap();
        let second = second_rx.recv().await.unwrap();
        assert_eq!(first.id, second.id);

        drop(correlation);
        assert_eq!(server.pending_replies(), 0);
    }

    #[tokio::test]
    async fn test_inline_handler_preserves_order() {
        let (client, server) = tunnel_pair().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        client.register_inline_handler(MessageKind::Text, move |_, message| {
            if let Ok(text) = message.decode_payload::<TextPayload>() {
                let _ = tx.send(text.text);
            }
        });
        spawn_listener(&client);
        spawn_listener(&server);

        for i in 0..50 {
            server
                .send(MessageKind::Text, &TextPayload { text: i.to_string() })
                .await
                .unwrap();
        }

        for i in 0..50 {
            assert_eq!(rx.recv().await.unwrap(), i.to_string());
        }
    }

    fn reply_to(re: &str, kind: MessageKind, text: &str) -> Message {
        let mut message = Message::new(kind, &TextPayload { text: text.to_string() }).unwrap();
        message.re = re.to_string();
        message
    }

    #[tokio::test]
    async fn test_full_consumer_keeps_arrival_order() {
        let (_client, server) = tunnel_pair().await;
        let (tx, mut rx) = mpsc::channel(2);
        let correlation = server
            .send_with_correlation(MessageKind::SseRequest, &get("/events"), tx)
            .await
            .unwrap();

        for i in 0..200 {
            server.deliver(reply_to(correlation.id(), MessageKind::SseMessage, &i.to_string()));
        }
        server.deliver(reply_to(correlation.id(), MessageKind::SseClose, ""));

        for i in 0..200 {
            let message = rx.recv().await.unwrap();
            assert_eq!(message.kind, MessageKind::SseMessage);
            let text: TextPayload = message.decode_payload().unwrap();
            assert_eq!(text.text, i.to_string());
        }
        assert_eq!(rx.recv().await.unwrap().kind, MessageKind::SseClose);
    }

    #[tokio::test]
    async fn test_backlog_limit_cuts_off_slow_consumer() {
        let (_client, server) = tunnel_pair().await;
        let (tx, mut rx) = mpsc::channel(1);
        let correlation = server
            .send_with_correlation(MessageKind::SseRequest, &get("/events"), tx)
            .await
            .unwrap();

        for i in 0..REPLY_BACKLOG_LIMIT + 100 {
            server.deliver(reply_to(correlation.id(), MessageKind::SseMessage, &i.to_string()));
        }

        let mut received = 0;
        while let Some(message) = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("consumer was never released")
        {
            let text: TextPayload = message.decode_payload().unwrap();
            assert_eq!(text.text, received.to_string());
            received += 1;
        }
        assert_eq!(received, REPLY_BACKLOG_LIMIT + 1);
    }

    #[tokio::test]
    async fn test_watch_routes_peer_replies() {
        let (client, server) = tunnel_pair().await;
        spawn_listener(&client);
        spawn_listener(&server);

        let (tx, mut rx) = mpsc::channel(1);
        let watched = client.watch("request-1", tx).unwrap();
        match client.watch("request-1", mpsc::channel(1).0) {
            Err(TunnelError::DuplicateId(id)) => assert_eq!(id, "request-1"),
            other => panic!("Unexpected result: {:?}", other.map(|c| c.id().to_string())),
        }

        server
            .send_response(MessageKind::SseClose, "request-1", &TextPayload { text: "stop".into() })
            .await
            .unwrap();
        let message = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.kind, MessageKind::SseClose);

        drop(watched);
        assert_eq!(client.pending_replies(), 0);
    }

    #[tokio::test]
    async fn test_context_storage() {
        let (_client, server) = tunnel_pair().await;
        server.set_context("name", "foo".to_string());

        assert_eq!(server.get_context::<String>("name").as_deref().map(String::as_str), Some("foo"));
        assert!(server.get_context::<u32>("name").is_none());
        assert!(server.get_context::<String>("missing").is_none());
    }
}
