// src/client/mod.rs - Tunnel client: registration and target-facing handlers

use std::collections::BTreeMap;
use std::sync::Arc;

use reqwest::Client as HttpClient;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ClientConfig, ConfigError};
use crate::protocol::{Headers, MessageKind, TextPayload, is_hop_by_hop};
use crate::session::Sessions;
use crate::tunnel::{Tunnel, TunnelError};

pub mod http_handler;
pub mod sse_handler;
pub mod websocket_handler;

pub const ALLOW_IP_HEADER: &str = "X-TT-Allow-IP";
pub const AUTH_TOKEN_HEADER: &str = "X-Auth-Token";

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to build HTTP client: {0}")]
    Http(#[from] reqwest::Error),
    #[error("failed to connect to server: {0}")]
    Connect(#[from] WsError),
    #[error("server rejected registration ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error(transparent)]
    Tunnel(#[from] TunnelError),
}

/// What the client-side handlers need to reach the exposed service.
pub struct Target {
    base: String,
    http: HttpClient,
    headers: BTreeMap<String, String>,
    sessions: Arc<Sessions>,
}

impl Target {
    /// `base` joined with the forwarded path and query.
    pub fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base, path)
        } else {
            format!("{}/{}", self.base, path)
        }
    }

    /// Same as [`url`](Self::url) with the scheme switched to ws/wss.
    pub fn websocket_url(&self, path: &str) -> String {
        let url = self.url(path);
        if let Some(rest) = url.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = url.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            url
        }
    }

    /// Forwarded request headers minus hop-by-hop ones, with the configured
    /// target headers layered on top.
    pub fn request_headers(&self, forwarded: &Headers) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, values) in forwarded {
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
        self.apply_extra_headers(&mut headers);
        headers
    }

    pub fn apply_extra_headers(&self, headers: &mut HeaderMap) {
        for (name, value) in &self.headers {
            if let (Ok(name), Ok(value)) = (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
                headers.insert(name, value);
            }
        }
    }

    pub fn http(&self) -> &HttpClient {
        &self.http
    }

    pub fn sessions(&self) -> &Arc<Sessions> {
        &self.sessions
    }
}

pub struct TunnelClient {
    config: ClientConfig,
    http_client: HttpClient,
}

impl TunnelClient {
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        config.validate()?;
        let http_client = HttpClient::builder()
            .redirect(reqwest::redirect::Policy::none())
            .danger_accept_invalid_certs(config.client.insecure)
            .build()?;
        Ok(Self { config, http_client })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Register with the server and return the tunnel, handlers installed but
    /// not yet listening.
    pub async fn connect(&self) -> Result<Tunnel, ClientError> {
        let settings = &self.config.client;
        let url = self.config.registration_url()?;

        let mut request = url.as_str().into_client_request()?;
        let headers = request.headers_mut();
        for (name, value) in &settings.server_headers {
            let (name, value) = header_pair(name, value)?;
            headers.insert(name, value);
        }
        if let Some(token) = &settings.token {
            let (name, value) = header_pair(AUTH_TOKEN_HEADER, token)?;
            headers.insert(name, value);
        }
        for network in self.config.allowed_networks()? {
            let (name, value) = header_pair(ALLOW_IP_HEADER, &network.to_string())?;
            headers.append(name, value);
        }

        debug!(url = %url, "Connecting to tunnel server.");
        let (ws, _) = connect_async(request).await.map_err(|e| match e {
            WsError::Http(response) => ClientError::Rejected {
                status: response.status().as_u16(),
                message: response
                    .body()
                    .as_deref()
                    .map(|body| String::from_utf8_lossy(body).trim().to_string())
                    .unwrap_or_default(),
            },
            other => ClientError::Connect(other),
        })?;

        let span = tracing::info_span!("tunnel", side = "client", name = %settings.name);
        let tunnel = Tunnel::new(ws, span);
        let sessions = Sessions::new();
        sessions.install(&tunnel);

        let target = Arc::new(Target {
            base: settings.target.trim_end_matches('/').to_string(),
            http: self.http_client.clone(),
            headers: settings.target_headers.clone(),
            sessions,
        });
        install_handlers(&tunnel, target);

        info!(name = %settings.name, target = %settings.target, "Tunnel connected.");
        Ok(tunnel)
    }

    /// Connect and serve until the tunnel closes or `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), ClientError> {
        let tunnel = self.connect().await?;
        tunnel.listen(shutdown).await?;
        Ok(())
    }
}

fn install_handlers(tunnel: &Tunnel, target: Arc<Target>) {
    tunnel.on(MessageKind::Text, handle_text);

    let http_target = target.clone();
    tunnel.on(MessageKind::HttpRequest, move |tunnel, message, request| {
        http_handler::handle_http_request(http_target.clone(), tunnel, message, request)
    });

    let ws_target = target.clone();
    tunnel.on(MessageKind::WebsocketCreateRequest, move |tunnel, message, request| {
        websocket_handler::handle_create_request(ws_target.clone(), tunnel, message, request)
    });

    tunnel.on(MessageKind::SseRequest, move |tunnel, message, request| {
        sse_handler::handle_sse_request(target.clone(), tunnel, message, request)
    });
}

async fn handle_text(tunnel: Tunnel, _message: crate::protocol::Message, payload: TextPayload) {
    match payload.text.as_str() {
        "ping" => {
            let pong = TextPayload { text: "pong".to_string() };
            if let Err(e) = tunnel.send(MessageKind::Text, &pong).await {
                warn!(error = %e, "Failed to answer keepalive ping.");
            }
        }
        text => {
            if let Some(url) = text.split_whitespace().find(|word| word.contains("://")) {
                let url = url.trim_end_matches(['.', '!', ',']).to_string();
                info!(url = %url, "Tunnel is ready.");
                tunnel.set_context("public_url", url);
            }
            info!(text, "Message from server.");
        }
    }
}

fn header_pair(name: &str, value: &str) -> Result<(HeaderName, HeaderValue), ConfigError> {
    let invalid = || ConfigError::InvalidHeader(format!("{}={}", name, value));
    let name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| invalid())?;
    let value = HeaderValue::from_str(value).map_err(|_| invalid())?;
    Ok((name, value))
}
