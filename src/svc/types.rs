// src/svc/types.rs - Core types shared by the server handlers

use crate::BoxError;
use crate::config::ServerConfig;
use crate::svc::tunnel_mgmt::TunnelRegistry;
use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub type ResponseBody = BoxBody<Bytes, BoxError>;

/// Context passed to unified service handlers
#[derive(Clone)]
pub struct ServiceContext {
    pub tunnels: Arc<TunnelRegistry>,
    pub config: Arc<ServerConfig>,
    /// Cancelled on server shutdown; registered tunnels listen on a child.
    pub shutdown: CancellationToken,
}

impl ServiceContext {
    pub fn new(config: ServerConfig, shutdown: CancellationToken) -> Self {
        Self {
            tunnels: TunnelRegistry::new(),
            config: Arc::new(config),
            shutdown,
        }
    }
}
