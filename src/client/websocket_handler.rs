use std::sync::Arc;

use reqwest::header::{HeaderValue, ORIGIN};
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{Instrument, error, info, warn};

use super::Target;
use crate::BoxError;
use crate::conn::split_socket;
use crate::protocol::{
    HttpResponse, Message, MessageKind, WebsocketCreateRequestPayload, WebsocketCreateResponsePayload, headers_from,
};
use crate::session::forward_frames;
use crate::tunnel::Tunnel;

type BackendSocket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Dial the backend WebSocket for a new session and report the outcome.
/// On success the session is registered before the reply goes out, and
/// frames start flowing once it has.
pub async fn handle_create_request(
    target: Arc<Target>,
    tunnel: Tunnel,
    message: Message,
    request: WebsocketCreateRequestPayload,
) {
    let url = target.websocket_url(&request.path);
    info!(url = %url, origin = %request.origin, "WebSocket session requested.");

    let (socket, handshake) = match dial(&target, &url, &request.origin).await {
        Ok(connected) => connected,
        Err(e) => {
            warn!(url = %url, error = %e, "Failed to dial backend WebSocket.");
            let payload = WebsocketCreateResponsePayload {
                session_id: String::new(),
                error: Some(e.to_string()),
                http_response: rejected_handshake(&e),
            };
            send_reply(&tunnel, &message, &payload).await;
            return;
        }
    };

    let session_id = uuid::Uuid::new_v4().to_string();
    let slot = match target.sessions().reserve(&session_id) {
        Ok(slot) => slot,
        Err(e) => {
            error!(session_id = %session_id, error = %e, "Failed to register WebSocket session.");
            let payload = WebsocketCreateResponsePayload {
                error: Some(e.to_string()),
                ..Default::default()
            };
            send_reply(&tunnel, &message, &payload).await;
            return;
        }
    };

    let (conn, reader) = split_socket(socket);
    slot.attach(conn);

    let payload = WebsocketCreateResponsePayload {
        session_id: session_id.clone(),
        error: None,
        http_response: Some(handshake),
    };
    if !send_reply(&tunnel, &message, &payload).await {
        target.sessions().close_session(&session_id);
        return;
    }

    info!(session_id = %session_id, "WebSocket session established.");
    tokio::spawn(
        forward_frames(tunnel.clone(), target.sessions().clone(), session_id, reader).instrument(tunnel.span().clone()),
    );
}

async fn dial(target: &Target, url: &str, origin: &str) -> Result<(BackendSocket, HttpResponse), BoxError> {
    let mut request = url.into_client_request()?;
    let headers = request.headers_mut();
    if !origin.is_empty() {
        headers.insert(ORIGIN, HeaderValue::from_str(origin)?);
    }
    target.apply_extra_headers(headers);

    let (socket, response) = connect_async(request).await?;
    let handshake = HttpResponse {
        status: response.status().as_u16(),
        headers: headers_from(response.headers()),
        body: Vec::new(),
    };
    Ok((socket, handshake))
}

/// The backend's HTTP answer when it refused the upgrade.
fn rejected_handshake(error: &BoxError) -> Option<HttpResponse> {
    match error.downcast_ref::<WsError>() {
        Some(WsError::Http(response)) => Some(HttpResponse {
            status: response.status().as_u16(),
            headers: headers_from(response.headers()),
            body: response.body().as_deref().map(<[u8]>::to_vec).unwrap_or_default(),
        }),
        _ => None,
    }
}

async fn send_reply(tunnel: &Tunnel, message: &Message, payload: &WebsocketCreateResponsePayload) -> bool {
    match tunnel
        .send_response(MessageKind::WebsocketCreateResponse, &message.id, payload)
        .await
    {
        Ok(()) => true,
        Err(e) => {
            error!(id = %message.id, error = %e, "Failed to send WebSocket create response.");
            false
        }
    }
}
