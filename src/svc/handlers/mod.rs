pub mod sse;
pub mod tunnel;
pub mod websocket;

use crate::BoxError;
use crate::streaming::is_sse_request;
use crate::svc::ServiceContext;
use crate::svc::types::*;
use crate::svc::utils::{client_ip, is_websocket_upgrade, text_response, tunnel_name};
use hyper::{Request, Response, StatusCode, body::Incoming};
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tower::Service;
use tracing::{debug, info, warn};

const WELCOME: &str = "Welcome to tunnelmux. Register a tunnel at /register?name=<name>.";

#[derive(Clone)]
pub struct UnifiedService {
    context: ServiceContext,
    remote_addr: SocketAddr,
}

impl UnifiedService {
    pub fn new(context: ServiceContext, remote_addr: SocketAddr) -> Self {
        Self { context, remote_addr }
    }
}

impl Service<Request<Incoming>> for UnifiedService {
    type Response = Response<ResponseBody>;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Incoming>) -> Self::Future {
        let context = self.context.clone();
        let remote_addr = self.remote_addr;
        Box::pin(async move { route_request(req, context, remote_addr).await })
    }
}

async fn route_request(
    req: Request<Incoming>,
    context: ServiceContext,
    remote_addr: SocketAddr,
) -> Result<Response<ResponseBody>, BoxError> {
    let path = req.uri().path().to_string();
    let is_websocket = is_websocket_upgrade(req.headers());

    debug!(
        method = %req.method(),
        path = %path,
        websocket = is_websocket,
        remote = %remote_addr,
        "Incoming HTTP request received."
    );

    if let Some(name) = tunnel_name(req.headers(), &context.config.server.hostname) {
        return proxy_request(req, context, remote_addr, name).await;
    }

    match path.as_str() {
        "/register" => websocket::handle_registration(req, context).await,
        "/" => Ok(text_response(StatusCode::OK, WELCOME)),
        _ => {
            debug!(path = %path, "Request without tunnel name rejected.");
            Ok(text_response(StatusCode::BAD_REQUEST, "tunnel name not provided"))
        }
    }
}

async fn proxy_request(
    req: Request<Incoming>,
    context: ServiceContext,
    remote_addr: SocketAddr,
    name: String,
) -> Result<Response<ResponseBody>, BoxError> {
    let Some(tunnel) = context.tunnels.get(&name) else {
        info!(tunnel = %name, "Tunnel not found.");
        return Ok(text_response(StatusCode::SERVICE_UNAVAILABLE, "Tunnel not available"));
    };

    let ip = client_ip(req.headers(), remote_addr);
    if !tunnel.allows(ip) {
        warn!(tunnel = %name, ip = %ip, "Request from address outside the allow-list rejected.");
        return Ok(text_response(StatusCode::FORBIDDEN, "Forbidden"));
    }

    if is_websocket_upgrade(req.headers()) {
        websocket::handle_websocket_upgrade_request(req, context, tunnel).await
    } else if is_sse_request(req.headers(), req.uri()) {
        sse::handle_sse_request(req, context, tunnel).await
    } else {
        tunnel::handle_tunnel_request(req, context, tunnel).await
    }
}
