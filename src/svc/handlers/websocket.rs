use crate::BoxError;
use crate::client::{ALLOW_IP_HEADER, AUTH_TOKEN_HEADER};
use crate::config::parse_network;
use crate::conn::split_socket;
use crate::protocol::{Message, MessageKind, WebsocketClosePayload, WebsocketCreateRequestPayload, WebsocketCreateResponsePayload};
use crate::session::forward_frames;
use crate::svc::ServiceContext;
use crate::svc::tunnel_mgmt::{ServerTunnel, run_tunnel};
use crate::svc::types::*;
use crate::svc::utils::{
    boxed_body, calculate_websocket_accept_key, forwarded_path, is_websocket_upgrade, query_param, text_response,
};
use crate::tunnel::{Correlation, Tunnel};
use hyper::header::{CONNECTION, HeaderMap, ORIGIN, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, UPGRADE};
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode, body::Incoming};
use hyper_util::rt::TokioIo;
use ipnet::IpNet;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::protocol::{Role, WebSocketConfig};
use tracing::{Instrument, debug, error, info, warn};

/// How long a timed-out create keeps listening for its reply.
const LATE_CREATE_WAIT: Duration = Duration::from_secs(120);

/// Handle tunnel registration upgrades from tunnel clients
pub async fn handle_registration(
    req: Request<Incoming>,
    context: ServiceContext,
) -> Result<Response<ResponseBody>, BoxError> {
    let Some(name) = query_param(req.uri(), "name").filter(|name| !name.trim().is_empty()) else {
        return Ok(text_response(StatusCode::BAD_REQUEST, "name is required"));
    };

    if !is_websocket_upgrade(req.headers()) {
        return Ok(text_response(StatusCode::BAD_REQUEST, "websocket upgrade required"));
    }

    let Some(accept_key) = accept_key(req.headers()) else {
        return Ok(text_response(StatusCode::BAD_REQUEST, "Missing Sec-WebSocket-Key"));
    };

    let allowed_ips = match allowed_networks(req.headers()) {
        Ok(networks) => networks,
        Err(entry) => {
            warn!(tunnel = %name, entry = %entry, "Registration with invalid allow-list rejected.");
            return Ok(text_response(StatusCode::BAD_REQUEST, "invalid allowed IP range"));
        }
    };

    // Claimed before upgrading so a conflict still gets a real HTTP answer.
    let Some(reservation) = context.tunnels.reserve(&name) else {
        info!(tunnel = %name, "Registration for a name already in use rejected.");
        return Ok(text_response(StatusCode::BAD_REQUEST, "name is already used"));
    };

    info!(
        tunnel = %name,
        allowed_ips = allowed_ips.len(),
        token = req.headers().contains_key(AUTH_TOKEN_HEADER),
        "Tunnel registration accepted."
    );

    let response = switching_protocols(accept_key)?;

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                let span = tracing::info_span!("tunnel", side = "server", name = %name);
                let tunnel = Tunnel::new(server_socket(upgraded).await, span.clone());
                let tunnel = ServerTunnel::new(name, tunnel, allowed_ips);
                run_tunnel(reservation, tunnel, context).instrument(span).await;
            }
            Err(e) => {
                error!(tunnel = %name, error = %e, "Tunnel registration upgrade failed.");
            }
        }
    });

    Ok(response)
}

/// Handle WebSocket upgrade requests from browsers (to be proxied through tunnels)
pub async fn handle_websocket_upgrade_request(
    req: Request<Incoming>,
    context: ServiceContext,
    tunnel: ServerTunnel,
) -> Result<Response<ResponseBody>, BoxError> {
    let Some(accept_key) = accept_key(req.headers()) else {
        return Ok(text_response(StatusCode::BAD_REQUEST, "Missing Sec-WebSocket-Key"));
    };

    let request = WebsocketCreateRequestPayload {
        origin: req
            .headers()
            .get(ORIGIN)
            .and_then(|h| h.to_str().ok())
            .unwrap_or("")
            .to_string(),
        path: forwarded_path(req.uri()),
    };

    info!(tunnel = %tunnel.name, path = %request.path, "WebSocket upgrade request received.");

    let (tx, mut rx) = mpsc::channel(1);
    let correlation = match tunnel
        .tunnel
        .send_with_correlation(MessageKind::WebsocketCreateRequest, &request, tx)
        .await
    {
        Ok(correlation) => correlation,
        Err(e) => {
            warn!(tunnel = %tunnel.name, error = %e, "Failed to send WebSocket create.");
            return Ok(text_response(StatusCode::BAD_GATEWAY, "Bad Gateway"));
        }
    };

    let reply = match context.config.request_timeout() {
        Some(limit) => tokio::time::timeout(limit, rx.recv()).await,
        None => Ok(rx.recv().await),
    };
    let reply = match reply {
        Ok(Some(reply)) => reply,
        Ok(None) => {
            warn!(tunnel = %tunnel.name, "Tunnel closed during WebSocket create.");
            return Ok(text_response(StatusCode::BAD_GATEWAY, "Bad Gateway"));
        }
        Err(_) => {
            warn!(tunnel = %tunnel.name, "Tunnel client did not answer WebSocket create in time.");
            tokio::spawn(
                close_late_session(tunnel.tunnel.clone(), correlation, rx).instrument(tunnel.tunnel.span().clone()),
            );
            return Ok(text_response(StatusCode::GATEWAY_TIMEOUT, "Gateway Timeout"));
        }
    };
    drop(correlation);

    let created = match reply.expect::<WebsocketCreateResponsePayload>(MessageKind::WebsocketCreateResponse) {
        Ok(created) => created,
        Err(e) => {
            error!(tunnel = %tunnel.name, error = %e, "Invalid WebSocket create response.");
            return Ok(text_response(StatusCode::INTERNAL_SERVER_ERROR, ""));
        }
    };

    if let Some(error) = created.error {
        let status = created.http_response.as_ref().map(|r| r.status);
        warn!(tunnel = %tunnel.name, error = %error, backend_status = ?status, "Backend WebSocket refused.");
        return Ok(text_response(StatusCode::BAD_GATEWAY, "Bad Gateway"));
    }
    if created.session_id.is_empty() {
        error!(tunnel = %tunnel.name, "WebSocket create response without session id.");
        return Ok(text_response(StatusCode::BAD_GATEWAY, "Bad Gateway"));
    }

    let session_id = created.session_id;
    let slot = match tunnel.sessions.reserve(&session_id) {
        Ok(slot) => slot,
        Err(e) => {
            error!(tunnel = %tunnel.name, error = %e, "Failed to register WebSocket session.");
            send_close(&tunnel.tunnel, &session_id).await;
            return Ok(text_response(StatusCode::INTERNAL_SERVER_ERROR, ""));
        }
    };

    let response = switching_protocols(accept_key)?;

    let span = tunnel.tunnel.span().clone();
    tokio::spawn(
        async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    let (conn, reader) = split_socket(server_socket(upgraded).await);
                    slot.attach(conn);
                    info!(session_id = %session_id, "WebSocket proxy established.");
                    forward_frames(tunnel.tunnel, tunnel.sessions, session_id, reader).await;
                }
                Err(e) => {
                    error!(session_id = %session_id, error = %e, "WebSocket upgrade failed.");
                    drop(slot);
                    if tunnel.sessions.close_session(&session_id) {
                        send_close(&tunnel.tunnel, &session_id).await;
                    }
                }
            }
        }
        .instrument(span),
    );

    debug!("WebSocket upgrade response sent.");
    Ok(response)
}

fn accept_key(headers: &HeaderMap) -> Option<String> {
    headers
        .get(SEC_WEBSOCKET_KEY)
        .and_then(|h| h.to_str().ok())
        .filter(|key| !key.is_empty())
        .map(calculate_websocket_accept_key)
}

fn switching_protocols(accept_key: String) -> Result<Response<ResponseBody>, BoxError> {
    Ok(Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(CONNECTION, "Upgrade")
        .header(UPGRADE, "websocket")
        .header(SEC_WEBSOCKET_ACCEPT, accept_key)
        .body(boxed_body(""))?)
}

async fn server_socket(upgraded: Upgraded) -> WebSocketStream<TokioIo<Upgraded>> {
    WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, Some(WebSocketConfig::default())).await
}

/// Every `X-TT-Allow-IP` entry, comma separated or repeated. Returns the
/// first entry that does not parse.
fn allowed_networks(headers: &HeaderMap) -> Result<Vec<IpNet>, String> {
    let mut networks = Vec::new();
    for value in headers.get_all(ALLOW_IP_HEADER) {
        let value = value.to_str().map_err(|_| "<non-ascii>".to_string())?;
        for entry in value.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            networks.push(parse_network(entry).ok_or_else(|| entry.to_string())?);
        }
    }
    Ok(networks)
}

/// Wait for a create reply that came too late for its caller and close the
/// session the client opened for it.
async fn close_late_session(tunnel: Tunnel, correlation: Correlation, mut rx: mpsc::Receiver<Message>) {
    let _correlation = correlation;
    let reply = tokio::select! {
        _ = tunnel.done() => return,
        _ = tokio::time::sleep(LATE_CREATE_WAIT) => {
            debug!("No late WebSocket create reply arrived.");
            return;
        }
        reply = rx.recv() => reply,
    };

    let Some(reply) = reply else {
        return;
    };
    match reply.expect::<WebsocketCreateResponsePayload>(MessageKind::WebsocketCreateResponse) {
        Ok(created) if !created.session_id.is_empty() => {
            info!(session_id = %created.session_id, "Closing WebSocket session created after its caller gave up.");
            send_close(&tunnel, &created.session_id).await;
        }
        Ok(_) => {}
        Err(e) => debug!(error = %e, "Ignoring invalid late WebSocket create reply."),
    }
}

async fn send_close(tunnel: &Tunnel, session_id: &str) {
    let payload = WebsocketClosePayload {
        session_id: session_id.to_string(),
    };
    if let Err(e) = tunnel.send(MessageKind::WebsocketClose, &payload).await {
        debug!(session_id, error = %e, "Failed to send WebSocket close.");
    }
}
