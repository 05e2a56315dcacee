// src/svc/utils.rs - Utility functions for service handlers

use crate::svc::types::*;
use base64::Engine;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{CONNECTION, HOST, UPGRADE};
use hyper::{HeaderMap, Response, StatusCode, Uri};
use sha1::{Digest, Sha1};
use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};

/// Routing header naming the tunnel when the host carries no subdomain.
pub const TUNNEL_HEADER: &str = "X-TT-Tunnel";
pub const FORWARDED_FOR_HEADER: &str = "X-Forwarded-For";

/// Check if a request is a WebSocket upgrade
pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    let connection_header = headers
        .get(CONNECTION)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("");

    let upgrade_header = headers
        .get(UPGRADE)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("");

    connection_header.to_lowercase().contains("upgrade") && upgrade_header.eq_ignore_ascii_case("websocket")
}

/// Create a boxed body from text/bytes
pub fn boxed_body(text: impl Into<Bytes>) -> ResponseBody {
    Full::new(text.into())
        .map_err(|e: Infallible| -> crate::BoxError { Box::new(e) })
        .boxed()
}

/// Plain-text response with the given status.
pub fn text_response(status: StatusCode, text: impl Into<Bytes>) -> Response<ResponseBody> {
    let mut response = Response::new(boxed_body(text));
    *response.status_mut() = status;
    response
}

/// Tunnel a request is addressed to: the subdomain label under `hostname`,
/// falling back to the routing header.
pub fn tunnel_name(headers: &HeaderMap, hostname: &str) -> Option<String> {
    subdomain_label(headers, hostname).or_else(|| {
        headers
            .get(TUNNEL_HEADER)
            .and_then(|h| h.to_str().ok())
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
    })
}

fn subdomain_label(headers: &HeaderMap, hostname: &str) -> Option<String> {
    let host = headers.get(HOST).and_then(|h| h.to_str().ok())?;
    let host = host.split(':').next().unwrap_or(host).to_ascii_lowercase();
    let label = host.strip_suffix(&format!(".{}", hostname.to_ascii_lowercase()))?;

    let valid = !label.is_empty()
        && label
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    valid.then(|| label.to_string())
}

/// Path and query as forwarded through the tunnel.
pub fn forwarded_path(uri: &Uri) -> String {
    match uri.query() {
        Some(query) => format!("{}?{}", uri.path(), query),
        None => uri.path().to_string(),
    }
}

/// Address the request originated from: the first `X-Forwarded-For` hop
/// when present, otherwise the peer address.
pub fn client_ip(headers: &HeaderMap, remote_addr: SocketAddr) -> IpAddr {
    headers
        .get(FORWARDED_FOR_HEADER)
        .and_then(|h| h.to_str().ok())
        .and_then(|value| value.split(',').next())
        .and_then(|first| first.trim().parse::<IpAddr>().ok())
        .unwrap_or_else(|| remote_addr.ip())
}

/// First value of a query parameter.
pub fn query_param(uri: &Uri, key: &str) -> Option<String> {
    let query = uri.query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
}

/// Calculate WebSocket accept key for upgrade handshake
const WS_MAGIC: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
pub fn calculate_websocket_accept_key(ws_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(ws_key.as_bytes());
    hasher.update(WS_MAGIC); // WebSocket magic string
    let hash = hasher.finalize();
    base64::engine::general_purpose::STANDARD.encode(hash)
}
