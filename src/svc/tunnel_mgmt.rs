// src/svc/tunnel_mgmt.rs - Registered tunnels and their lifecycle on the server

use crate::protocol::{MessageKind, TextPayload};
use crate::registry::SyncMap;
use crate::session::Sessions;
use crate::svc::ServiceContext;
use crate::tunnel::Tunnel;
use ipnet::IpNet;
use std::net::IpAddr;
use std::sync::{Arc, OnceLock};
use tokio::time::{Instant, interval_at};
use tracing::{Instrument, debug, error, info, warn};

/// A registered client connection and the per-tunnel state the handlers use.
#[derive(Clone)]
pub struct ServerTunnel {
    pub name: String,
    pub tunnel: Tunnel,
    pub sessions: Arc<Sessions>,
    pub allowed_ips: Arc<Vec<IpNet>>,
}

impl ServerTunnel {
    pub fn new(name: impl Into<String>, tunnel: Tunnel, allowed_ips: Vec<IpNet>) -> Self {
        let sessions = Sessions::new();
        sessions.install(&tunnel);
        Self {
            name: name.into(),
            tunnel,
            sessions,
            allowed_ips: Arc::new(allowed_ips),
        }
    }

    /// An empty allow-list admits everyone.
    pub fn allows(&self, addr: IpAddr) -> bool {
        self.allowed_ips.is_empty() || self.allowed_ips.iter().any(|net| net.contains(&addr))
    }
}

type Slot = Arc<OnceLock<ServerTunnel>>;

/// Names claimed by connected clients. A name is reserved before the
/// WebSocket upgrade and filled in once the tunnel exists.
#[derive(Default)]
pub struct TunnelRegistry {
    tunnels: SyncMap<Slot>,
}

/// Exclusive claim on a tunnel name, released on drop.
pub struct Reservation {
    name: String,
    slot: Slot,
    registry: Arc<TunnelRegistry>,
}

impl Reservation {
    pub fn name(&self) -> &str {
        &self.name
    }

    fn fill(&self, tunnel: ServerTunnel) {
        if self.slot.set(tunnel).is_err() {
            warn!(tunnel = %self.name, "Tunnel slot was already filled.");
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.registry
            .tunnels
            .delete_if(&self.name, |slot| Arc::ptr_eq(slot, &self.slot));
    }
}

impl TunnelRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Claim `name`, or `None` if another client holds it.
    pub fn reserve(self: &Arc<Self>, name: &str) -> Option<Reservation> {
        let slot: Slot = Arc::new(OnceLock::new());
        if !self.tunnels.set_if_absent(name, slot.clone()) {
            return None;
        }
        Some(Reservation {
            name: name.to_string(),
            slot,
            registry: self.clone(),
        })
    }

    /// The live tunnel for `name`. Names still mid-registration are not
    /// routable yet.
    pub fn get(&self, name: &str) -> Option<ServerTunnel> {
        self.tunnels.get(name)?.get().cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.tunnels.keys()
    }
}

/// Serve a freshly registered tunnel until it closes, then release its name.
pub async fn run_tunnel(reservation: Reservation, tunnel: ServerTunnel, context: ServiceContext) {
    let name = reservation.name().to_string();
    let handle = tunnel.tunnel.clone();

    handle.on(MessageKind::Text, handle_text);
    reservation.fill(tunnel);
    info!(tunnel = %name, "Tunnel registered.");

    if context.config.server.hello_message {
        let hello = TextPayload {
            text: format!(
                "Welcome to tunnelmux! Your tunnel is ready at {}",
                context.config.public_url(&name)
            ),
        };
        if let Err(e) = handle.send(MessageKind::Text, &hello).await {
            warn!(tunnel = %name, error = %e, "Failed to send welcome message.");
        }
    }

    if let Some(period) = context.config.keepalive_interval() {
        tokio::spawn(keepalive(handle.clone(), period).instrument(handle.span().clone()));
    }

    if let Err(e) = handle.listen(context.shutdown.child_token()).await {
        error!(tunnel = %name, error = %e, "Tunnel ended with error.");
    }

    drop(reservation);
    info!(tunnel = %name, "Tunnel unregistered.");
}

async fn keepalive(tunnel: Tunnel, period: std::time::Duration) {
    let mut ticker = interval_at(Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = tunnel.done() => break,
            _ = ticker.tick() => {
                let ping = TextPayload { text: "ping".to_string() };
                if let Err(e) = tunnel.send(MessageKind::Text, &ping).await {
                    debug!(error = %e, "Keepalive ping failed.");
                    break;
                }
            }
        }
    }
}

async fn handle_text(_tunnel: Tunnel, _message: crate::protocol::Message, payload: TextPayload) {
    match payload.text.as_str() {
        "pong" => debug!("Keepalive pong received."),
        text => info!(text, "Message from client."),
    }
}
