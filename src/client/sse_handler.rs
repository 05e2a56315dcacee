use std::io;
use std::sync::Arc;

use futures_util::TryStreamExt;
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;
use tokio_util::io::StreamReader;
use tracing::{debug, error, info, warn};

use super::Target;
use crate::BoxError;
use crate::protocol::{Message, MessageKind, SSE_SEQUENCE_BASE, SseClosePayload, SseMessagePayload, SseRequestPayload};
use crate::tunnel::Tunnel;

/// Stream an event source from the target back through the tunnel, one
/// numbered message per SSE record, then close the stream.
pub async fn handle_sse_request(target: Arc<Target>, tunnel: Tunnel, message: Message, request: SseRequestPayload) {
    info!(path = %request.path, "SSE request received.");

    // The server answers on this id when its caller has gone away.
    let (stop_tx, mut stop_rx) = mpsc::channel(1);
    let _watch = match tunnel.watch(&message.id, stop_tx) {
        Ok(watch) => Some(watch),
        Err(e) => {
            debug!(id = %message.id, error = %e, "Cannot watch for SSE cancellation.");
            None
        }
    };

    let result = tokio::select! {
        result = stream_events(&target, &tunnel, &message.id, request) => result,
        _ = tunnel.done() => {
            debug!(id = %message.id, "Tunnel closed while streaming events.");
            return;
        }
        Some(_) = stop_rx.recv() => {
            info!(id = %message.id, "SSE caller disconnected, stream stopped.");
            return;
        }
    };

    let close = match result {
        Ok(sent) => {
            info!(id = %message.id, events = sent, "SSE stream finished.");
            SseClosePayload { error: None }
        }
        Err(e) => {
            warn!(id = %message.id, error = %e, "SSE stream failed.");
            SseClosePayload {
                error: Some(e.to_string()),
            }
        }
    };

    if let Err(e) = tunnel.send_response(MessageKind::SseClose, &message.id, &close).await {
        error!(id = %message.id, error = %e, "Failed to send SSE close.");
    }
}

/// Returns how many events were forwarded.
async fn stream_events(
    target: &Target,
    tunnel: &Tunnel,
    re: &str,
    request: SseRequestPayload,
) -> Result<u64, BoxError> {
    let response = target
        .http()
        .get(target.url(&request.path))
        .headers(target.request_headers(&request.headers))
        .send()
        .await?
        .error_for_status()?;

    let body = Box::pin(response.bytes_stream().map_err(io::Error::other));
    let mut lines = StreamReader::new(body).lines();

    let mut sequence = SSE_SEQUENCE_BASE;
    let mut record: Vec<String> = Vec::new();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            if !record.is_empty() {
                send_event(tunnel, re, record.join("\n"), sequence).await?;
                record.clear();
                sequence += 1;
            }
            continue;
        }
        record.push(line.to_string());
    }

    if !record.is_empty() {
        send_event(tunnel, re, record.join("\n"), sequence).await?;
        sequence += 1;
    }

    Ok(sequence - SSE_SEQUENCE_BASE)
}

async fn send_event(tunnel: &Tunnel, re: &str, data: String, sequence: u64) -> Result<(), BoxError> {
    let payload = SseMessagePayload { data, sequence };
    tunnel.send_response(MessageKind::SseMessage, re, &payload).await?;
    Ok(())
}
