// src/svc/handlers/sse.rs - Server-Sent Events relayed through a tunnel

use crate::BoxError;
use crate::protocol::{
    Message, MessageKind, SSE_SEQUENCE_BASE, SseClosePayload, SseMessagePayload, SseRequestPayload, headers_from,
};
use crate::streaming::with_sse_headers;
use crate::svc::ServiceContext;
use crate::svc::tunnel_mgmt::ServerTunnel;
use crate::svc::types::*;
use crate::svc::utils::{forwarded_path, text_response};
use crate::tunnel::{Correlation, Tunnel};
use async_stream::stream;
use bytes::Bytes;
use http_body_util::StreamBody;
use http_body_util::combinators::BoxBody;
use hyper::body::Frame;
use hyper::{Request, Response, StatusCode, body::Incoming};
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Events that may be in flight for one stream before the tunnel has to wait.
const SSE_CHANNEL_CAPACITY: usize = 100;

/// Restores sequence order for one event stream.
///
/// Sequence 0 means the sender does not number its events. If the very
/// first event carries 0, the stream is taken to come from such a sender and
/// events are passed through in arrival order from then on.
#[derive(Debug, Default)]
pub struct ReorderBuffer {
    /// Next sequence to emit; 0 until the first numbered event.
    expected: u64,
    pending: BTreeMap<u64, String>,
    legacy: bool,
}

impl ReorderBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept one event and return the data that can be written now, in order.
    pub fn push(&mut self, message: SseMessagePayload) -> Vec<String> {
        if self.legacy {
            return vec![message.data];
        }

        if message.sequence == 0 && self.expected == 0 && self.pending.is_empty() {
            debug!("Event stream without sequence numbers, writing in arrival order.");
            self.legacy = true;
            return vec![message.data];
        }

        if self.expected == 0 {
            self.expected = SSE_SEQUENCE_BASE;
        }

        if message.sequence < self.expected {
            warn!(sequence = message.sequence, expected = self.expected, "Received outdated SSE message.");
            return Vec::new();
        }

        if message.sequence > self.expected {
            debug!(sequence = message.sequence, expected = self.expected, "Buffering out-of-order SSE message.");
            self.pending.insert(message.sequence, message.data);
            return Vec::new();
        }

        let mut ready = vec![message.data];
        self.expected += 1;
        while let Some(data) = self.pending.remove(&self.expected) {
            ready.push(data);
            self.expected += 1;
        }
        ready
    }

    /// Everything still buffered, in sequence order, gaps skipped.
    pub fn flush(&mut self) -> Vec<String> {
        std::mem::take(&mut self.pending).into_values().collect()
    }

    pub fn is_legacy(&self) -> bool {
        self.legacy
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

/// Ask the tunnel client to open the event stream and relay its events to
/// the caller as they come in.
///
/// The response head waits for the first event, so a target that cannot be
/// reached still gets a 502. A stream that stays silent past the request
/// timeout is answered with 200 and relayed once events arrive.
pub async fn handle_sse_request(
    req: Request<Incoming>,
    context: ServiceContext,
    tunnel: ServerTunnel,
) -> Result<Response<ResponseBody>, BoxError> {
    let request = SseRequestPayload {
        path: forwarded_path(req.uri()),
        headers: headers_from(req.headers()),
    };

    info!(tunnel = %tunnel.name, path = %request.path, "Forwarding SSE request.");

    let (tx, mut rx) = mpsc::channel(SSE_CHANNEL_CAPACITY);
    let correlation = match tunnel
        .tunnel
        .send_with_correlation(MessageKind::SseRequest, &request, tx)
        .await
    {
        Ok(correlation) => correlation,
        Err(e) => {
            warn!(tunnel = %tunnel.name, error = %e, "Failed to send SSE request.");
            return Ok(text_response(StatusCode::BAD_GATEWAY, "Bad Gateway"));
        }
    };

    let first = match context.config.request_timeout() {
        Some(limit) => tokio::time::timeout(limit, rx.recv()).await.ok(),
        None => Some(rx.recv().await),
    };
    let first = match first {
        Some(Some(message)) => {
            if let Some(error) = upstream_error(&message) {
                warn!(tunnel = %tunnel.name, error = %error, "Event source could not be opened.");
                return Ok(text_response(StatusCode::BAD_GATEWAY, "Bad Gateway"));
            }
            Some(message)
        }
        Some(None) => {
            warn!(tunnel = %tunnel.name, "Tunnel closed before the event stream opened.");
            return Ok(text_response(StatusCode::BAD_GATEWAY, "Bad Gateway"));
        }
        None => {
            debug!(tunnel = %tunnel.name, "No event yet, opening the stream anyway.");
            None
        }
    };

    let guard = CallerGuard {
        tunnel: tunnel.tunnel.clone(),
        id: correlation.id().to_string(),
        finished: false,
    };
    let body = BoxBody::new(StreamBody::new(event_stream(correlation, guard, first, rx)));
    Ok(with_sse_headers(Response::builder().status(StatusCode::OK)).body(body)?)
}

fn upstream_error(message: &Message) -> Option<String> {
    if message.kind != MessageKind::SseClose {
        return None;
    }
    match message.decode_payload::<SseClosePayload>() {
        Ok(close) => close.error,
        Err(e) => Some(e.to_string()),
    }
}

/// Tells the tunnel client to stop streaming when the caller goes away
/// before the stream ended.
struct CallerGuard {
    tunnel: Tunnel,
    id: String,
    finished: bool,
}

impl Drop for CallerGuard {
    fn drop(&mut self) {
        if self.finished || self.tunnel.is_closed() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let tunnel = self.tunnel.clone();
        let id = std::mem::take(&mut self.id);
        runtime.spawn(async move {
            debug!(id = %id, "SSE caller went away, stopping the stream.");
            let payload = SseClosePayload {
                error: Some("caller disconnected".to_string()),
            };
            if let Err(e) = tunnel.send_response(MessageKind::SseClose, &id, &payload).await {
                debug!(id = %id, error = %e, "Failed to stop SSE stream.");
            }
        });
    }
}

/// What one message does to the relayed stream.
#[derive(Debug, PartialEq)]
enum Step {
    Write(Vec<String>),
    Finish(Vec<String>),
}

fn apply(buffer: &mut ReorderBuffer, id: &str, message: Message) -> Step {
    match message.kind {
        MessageKind::SseMessage => match message.decode_payload::<SseMessagePayload>() {
            Ok(event) => Step::Write(buffer.push(event)),
            Err(e) => {
                error!(id = %id, error = %e, "Failed to decode SSE message.");
                Step::Finish(buffer.flush())
            }
        },
        MessageKind::SseClose => {
            if let Ok(SseClosePayload { error: Some(error) }) = message.decode_payload() {
                warn!(id = %id, error = %error, "Event source failed.");
            }
            Step::Finish(buffer.flush())
        }
        kind => {
            error!(id = %id, kind = %kind, "Received unexpected message kind on SSE stream.");
            Step::Finish(Vec::new())
        }
    }
}

/// Body of the relayed stream. Holding `correlation` keeps the replies
/// routed here; dropping the body (caller gone) releases it.
fn event_stream(
    correlation: Correlation,
    mut guard: CallerGuard,
    first: Option<Message>,
    mut rx: mpsc::Receiver<Message>,
) -> impl futures_util::Stream<Item = Result<Frame<Bytes>, BoxError>> + Send + Sync + 'static {
    let id = correlation.id().to_string();
    stream! {
        let _correlation = correlation;
        let mut buffer = ReorderBuffer::new();
        let mut next = first;

        loop {
            let message = match next.take() {
                Some(message) => message,
                None => match rx.recv().await {
                    Some(message) => message,
                    None => break,
                },
            };
            match apply(&mut buffer, &id, message) {
                Step::Write(ready) => {
                    for data in ready {
                        yield Ok(event_frame(data));
                    }
                }
                Step::Finish(rest) => {
                    for data in rest {
                        yield Ok(event_frame(data));
                    }
                    break;
                }
            }
        }
        guard.finished = true;
        debug!(id = %id, "SSE stream closed.");
    }
}

fn event_frame(data: String) -> Frame<Bytes> {
    let mut event = data;
    event.push_str("\n\n");
    Frame::data(Bytes::from(event))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(data: &str, sequence: u64) -> SseMessagePayload {
        SseMessagePayload {
            data: data.to_string(),
            sequence,
        }
    }

    #[test]
    fn test_reorders_out_of_order_events() {
        let mut buffer = ReorderBuffer::new();
        assert!(buffer.push(event("two", 2)).is_empty());
        assert_eq!(buffer.pending(), 1);
        assert_eq!(buffer.push(event("one", 1)), vec!["one", "two"]);
        assert_eq!(buffer.push(event("three", 3)), vec!["three"]);
        assert_eq!(buffer.pending(), 0);
    }

    #[test]
    fn test_drains_consecutive_run() {
        let mut buffer = ReorderBuffer::new();
        assert!(buffer.push(event("d", 4)).is_empty());
        assert!(buffer.push(event("b", 2)).is_empty());
        assert!(buffer.push(event("c", 3)).is_empty());
        assert_eq!(buffer.push(event("a", 1)), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_first_unnumbered_event_means_legacy() {
        let mut buffer = ReorderBuffer::new();
        assert_eq!(buffer.push(event("x", 0)), vec!["x"]);
        assert!(buffer.is_legacy());
        assert_eq!(buffer.push(event("y", 0)), vec!["y"]);
        assert_eq!(buffer.push(event("z", 7)), vec!["z"]);
    }

    #[test]
    fn test_late_zero_is_not_legacy() {
        let mut buffer = ReorderBuffer::new();
        assert_eq!(buffer.push(event("a", 1)), vec!["a"]);
        assert!(buffer.push(event("stray", 0)).is_empty());
        assert!(!buffer.is_legacy());
        assert_eq!(buffer.push(event("b", 2)), vec!["b"]);
    }

    #[test]
    fn test_zero_while_buffering_is_not_legacy() {
        let mut buffer = ReorderBuffer::new();
        assert!(buffer.push(event("b", 2)).is_empty());
        assert!(buffer.push(event("stray", 0)).is_empty());
        assert!(!buffer.is_legacy());
    }

    #[test]
    fn test_outdated_events_dropped() {
        let mut buffer = ReorderBuffer::new();
        assert_eq!(buffer.push(event("a", 1)), vec!["a"]);
        assert!(buffer.push(event("a again", 1)).is_empty());
        assert_eq!(buffer.push(event("b", 2)), vec!["b"]);
    }

    #[test]
    fn test_flush_returns_buffered_in_order() {
        let mut buffer = ReorderBuffer::new();
        assert!(buffer.push(event("e", 5)).is_empty());
        assert!(buffer.push(event("c", 3)).is_empty());
        assert_eq!(buffer.flush(), vec!["c", "e"]);
        assert_eq!(buffer.pending(), 0);
    }

    fn reply(kind: MessageKind, payload: &impl serde::Serialize) -> Message {
        let mut message = Message::new(kind, payload).unwrap();
        message.re = "request-1".to_string();
        message
    }

    #[test]
    fn test_upstream_error_only_from_failed_close() {
        let failed = reply(
            MessageKind::SseClose,
            &SseClosePayload {
                error: Some("HTTP status server error (500)".into()),
            },
        );
        assert_eq!(upstream_error(&failed).as_deref(), Some("HTTP status server error (500)"));

        let clean = reply(MessageKind::SseClose, &SseClosePayload { error: None });
        assert_eq!(upstream_error(&clean), None);

        let data = reply(MessageKind::SseMessage, &event("data: hi", 1));
        assert_eq!(upstream_error(&data), None);
    }

    #[test]
    fn test_apply_writes_then_finishes_with_buffered() {
        let mut buffer = ReorderBuffer::new();
        assert_eq!(
            apply(&mut buffer, "request-1", reply(MessageKind::SseMessage, &event("b", 2))),
            Step::Write(Vec::new())
        );
        assert_eq!(
            apply(&mut buffer, "request-1", reply(MessageKind::SseMessage, &event("a", 1))),
            Step::Write(vec!["a".to_string(), "b".to_string()])
        );
        assert_eq!(
            apply(&mut buffer, "request-1", reply(MessageKind::SseMessage, &event("d", 4))),
            Step::Write(Vec::new())
        );
        assert_eq!(
            apply(&mut buffer, "request-1", reply(MessageKind::SseClose, &SseClosePayload::default())),
            Step::Finish(vec!["d".to_string()])
        );
    }

    #[test]
    fn test_unnumbered_sender_streams_in_arrival_order() {
        // Senders that count from zero are taken as unnumbered.
        let mut buffer = ReorderBuffer::new();
        assert_eq!(buffer.push(event("a", 0)), vec!["a"]);
        assert_eq!(buffer.push(event("b", 1)), vec!["b"]);
        assert_eq!(buffer.push(event("c", 2)), vec!["c"]);
        assert!(buffer.is_legacy());
    }

    #[test]
    fn test_event_frame_terminates_record() {
        let frame = event_frame("data: hi".to_string());
        assert_eq!(frame.into_data().unwrap(), Bytes::from_static(b"data: hi\n\n"));
    }
}
