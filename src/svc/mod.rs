pub mod handlers;
pub mod servers;
pub mod tunnel_mgmt;
pub mod types;
pub mod utils;

pub use handlers::UnifiedService;
pub use servers::{serve_listener, start_http_server};
pub use tunnel_mgmt::{ServerTunnel, TunnelRegistry};
pub use types::*;
