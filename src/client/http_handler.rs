use std::sync::Arc;

use tracing::{debug, error, info, warn};

use super::Target;
use crate::BoxError;
use crate::protocol::{HttpRequestPayload, HttpResponse, HttpResponsePayload, Message, MessageKind, headers_from};
use crate::tunnel::Tunnel;

/// Replay a tunneled HTTP request against the target and send back its
/// response, or just the error when the target could not be reached.
pub async fn handle_http_request(target: Arc<Target>, tunnel: Tunnel, message: Message, request: HttpRequestPayload) {
    info!(method = %request.method, path = %request.path, "HTTP request received.");

    let payload = match forward_request(&target, request).await {
        Ok(response) => {
            debug!(id = %message.id, status = response.status, bytes = response.body.len(), "Target responded.");
            HttpResponsePayload { error: None, response }
        }
        Err(e) => {
            warn!(id = %message.id, error = %e, "Request to target failed.");
            HttpResponsePayload::failed(e)
        }
    };

    if let Err(e) = tunnel
        .send_response(MessageKind::HttpResponse, &message.id, &payload)
        .await
    {
        error!(id = %message.id, error = %e, "Failed to send HTTP response through tunnel.");
    }
}

async fn forward_request(target: &Target, request: HttpRequestPayload) -> Result<HttpResponse, BoxError> {
    let method = reqwest::Method::from_bytes(request.method.as_bytes())?;
    let url = target.url(&request.path);

    let mut builder = target
        .http()
        .request(method, url)
        .headers(target.request_headers(&request.headers));
    if !request.body.is_empty() {
        builder = builder.body(request.body);
    }

    let response = builder.send().await?;
    let status = response.status().as_u16();
    let headers = headers_from(response.headers());
    let body = response.bytes().await?;

    Ok(HttpResponse {
        status,
        headers,
        body: body.to_vec(),
    })
}
