// src/svc/handlers/tunnel.rs - HTTP tunnel request handling

use crate::BoxError;
use crate::protocol::{HttpRequestPayload, HttpResponse, HttpResponsePayload, MessageKind, headers_from, is_hop_by_hop};
use crate::svc::ServiceContext;
use crate::svc::tunnel_mgmt::ServerTunnel;
use crate::svc::types::*;
use crate::svc::utils::{boxed_body, forwarded_path, text_response};
use crate::tunnel::TunnelError;
use http_body_util::BodyExt;
use hyper::header::{HeaderName, HeaderValue};
use hyper::{Request, Response, StatusCode, body::Incoming};
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Handle HTTP requests that should be tunneled to clients
pub async fn handle_tunnel_request(
    req: Request<Incoming>,
    context: ServiceContext,
    tunnel: ServerTunnel,
) -> Result<Response<ResponseBody>, BoxError> {
    let method = req.method().to_string();
    let path = forwarded_path(req.uri());
    let headers = headers_from(req.headers());

    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(tunnel = %tunnel.name, error = %e, "Failed to read request body.");
            return Ok(text_response(StatusCode::BAD_REQUEST, "Failed to read request body"));
        }
    };

    info!(tunnel = %tunnel.name, method = %method, path = %path, "Forwarding HTTP request.");

    let payload = HttpRequestPayload {
        method,
        path,
        headers,
        body: body.to_vec(),
    };

    let started = Instant::now();
    let reply = match tunnel
        .tunnel
        .request(MessageKind::HttpRequest, &payload, context.config.request_timeout())
        .await
    {
        Ok(reply) => reply,
        Err(TunnelError::Timeout) => {
            warn!(tunnel = %tunnel.name, elapsed = ?started.elapsed(), "Tunnel client did not answer in time.");
            return Ok(text_response(StatusCode::GATEWAY_TIMEOUT, "Gateway Timeout"));
        }
        Err(e) => {
            warn!(tunnel = %tunnel.name, error = %e, "HTTP round trip through tunnel failed.");
            return Ok(text_response(StatusCode::BAD_GATEWAY, "Bad Gateway"));
        }
    };

    let response = match reply.expect::<HttpResponsePayload>(MessageKind::HttpResponse) {
        Ok(response) => response,
        Err(e) => {
            error!(tunnel = %tunnel.name, error = %e, "Invalid HTTP response from tunnel client.");
            return Ok(text_response(StatusCode::INTERNAL_SERVER_ERROR, ""));
        }
    };

    if let Some(error) = response.error {
        warn!(tunnel = %tunnel.name, error = %error, "Tunnel client could not reach its target.");
        return Ok(text_response(StatusCode::BAD_GATEWAY, "Bad Gateway"));
    }

    debug!(
        tunnel = %tunnel.name,
        status = response.response.status,
        duration = ?started.elapsed(),
        "Received response through tunnel."
    );
    Ok(build_response(response.response))
}

/// Turn the relayed response into one for the original caller. Headers that
/// belong to the target's own connection are left out.
fn build_response(relayed: HttpResponse) -> Response<ResponseBody> {
    let Ok(status) = StatusCode::from_u16(relayed.status) else {
        warn!(status = relayed.status, "Relayed response carries an invalid status.");
        return text_response(StatusCode::BAD_GATEWAY, "Bad Gateway");
    };

    let mut response = Response::new(boxed_body(relayed.body));
    *response.status_mut() = status;

    let headers = response.headers_mut();
    for (name, values) in &relayed.headers {
        if is_hop_by_hop(name) {
            continue;
        }
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            continue;
        };
        for value in values {
            if let Ok(value) = HeaderValue::from_str(value) {
                headers.append(name.clone(), value);
            }
        }
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Headers;

    #[test]
    fn test_build_response_copies_status_headers_and_body() {
        let relayed = HttpResponse {
            status: 201,
            headers: Headers::from([
                ("Set-Cookie".to_string(), vec!["a=1".to_string(), "b=2".to_string()]),
                ("Transfer-Encoding".to_string(), vec!["chunked".to_string()]),
                ("Content-Type".to_string(), vec!["text/plain".to_string()]),
            ]),
            body: b"ok".to_vec(),
        };

        let response = build_response(relayed);
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers().get_all("set-cookie").iter().count(), 2);
        assert!(response.headers().get("transfer-encoding").is_none());
        assert_eq!(response.headers()["content-type"], "text/plain");
    }

    #[test]
    fn test_build_response_rejects_invalid_status() {
        let relayed = HttpResponse {
            status: 42,
            ..Default::default()
        };
        assert_eq!(build_response(relayed).status(), StatusCode::BAD_GATEWAY);
    }
}
