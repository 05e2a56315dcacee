// src/lib.rs
pub mod client;
pub mod config;
pub mod conn;
pub mod logging;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod streaming;
pub mod svc;
pub mod tunnel;

pub use client::{ClientError, TunnelClient};
pub use config::*;
pub use logging::initialize_tracing;
pub use protocol::{Message, MessageKind};
pub use tunnel::{Tunnel, TunnelError};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
