// src/config.rs - Server and client configuration

use clap::Parser;
use hyper::header::{HeaderName, HeaderValue};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("name is required")]
    MissingName,
    #[error("target is required")]
    MissingTarget,
    #[error("invalid target {0:?}: expected an http:// or https:// URL")]
    InvalidTarget(String),
    #[error("invalid allowed IP range {0:?}")]
    InvalidNetwork(String),
    #[error("invalid header {0:?}")]
    InvalidHeader(String),
    #[error("invalid server address {0:?}")]
    InvalidServer(String),
    #[error("failed to access config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to write config file: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Server configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub server: ServerSettings,
    pub limits: LimitSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub bind: String,
    pub port: u16,
    /// Root domain; tunnels are reachable at `<name>.<hostname>`.
    pub hostname: String,
    /// Scheme used in public tunnel URLs (`http` or `https`).
    pub access_scheme: String,
    /// Port shown in public tunnel URLs when it differs from the scheme default.
    pub access_port: Option<u16>,
    pub hello_message: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitSettings {
    pub request_timeout_secs: u64,
    pub keepalive_interval_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 8080,
            hostname: "localhost".to_string(),
            access_scheme: "http".to_string(),
            access_port: None,
            hello_message: true,
        }
    }
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            request_timeout_secs: 30,
            keepalive_interval_secs: 15,
        }
    }
}

/// Client configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub client: ClientSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    /// Base URL of the service being exposed, e.g. `http://localhost:3000`.
    pub target: String,
    pub name: String,
    pub server_host: String,
    pub server_port: Option<u16>,
    /// Plain `ws://` to the server and no certificate checks toward the target.
    pub insecure: bool,
    pub reconnect_attempts: u32,
    pub reconnect_delay_secs: u64,
    pub allowed_ips: Vec<String>,
    pub target_headers: BTreeMap<String, String>,
    pub server_headers: BTreeMap<String, String>,
    pub token: Option<String>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            target: String::new(),
            name: String::new(),
            server_host: "localhost".to_string(),
            server_port: None,
            insecure: false,
            reconnect_attempts: 5,
            reconnect_delay_secs: 3,
            allowed_ips: Vec::new(),
            target_headers: BTreeMap::new(),
            server_headers: BTreeMap::new(),
            token: None,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "tunnelmux-server")]
#[command(about = "Tunnel multiplexer server")]
pub struct ServerArgs {
    #[arg(short, long, default_value = "server.toml")]
    pub config: PathBuf,
    #[arg(long)]
    pub bind: Option<String>,
    #[arg(short, long)]
    pub port: Option<u16>,
    #[arg(long)]
    pub hostname: Option<String>,
    #[arg(long)]
    pub access_scheme: Option<String>,
    #[arg(long)]
    pub access_port: Option<u16>,
    #[arg(long)]
    pub request_timeout_secs: Option<u64>,
    #[arg(long)]
    pub no_hello: bool,
    #[arg(long)]
    pub generate_config: bool,
    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Parser, Debug)]
#[command(name = "tunnelmux-client")]
#[command(about = "Tunnel multiplexer client")]
pub struct ClientArgs {
    /// Target to expose, e.g. http://localhost:3000
    pub target: Option<String>,
    #[arg(short, long, default_value = "client.toml")]
    pub config: PathBuf,
    #[arg(short, long)]
    pub name: Option<String>,
    #[arg(short, long)]
    pub server_host: Option<String>,
    #[arg(short = 'p', long)]
    pub server_port: Option<u16>,
    #[arg(short = 'k', long)]
    pub insecure: bool,
    /// Allowed caller IP range (CIDR); repeatable
    #[arg(short = 'a', long = "allow-ip")]
    pub allow_ips: Vec<String>,
    /// Header added to requests toward the target, as `Name=Value`; repeatable
    #[arg(short = 'H', long = "header")]
    pub headers: Vec<String>,
    /// Header added to the registration request, as `Name=Value`; repeatable
    #[arg(long = "server-header")]
    pub server_headers: Vec<String>,
    #[arg(short, long)]
    pub token: Option<String>,
    #[arg(long)]
    pub reconnect_attempts: Option<u32>,
    #[arg(long)]
    pub generate_config: bool,
    #[arg(short, long)]
    pub verbose: bool,
}

impl ServerConfig {
    pub fn load(args: &ServerArgs) -> Result<Self, ConfigError> {
        let mut config = if args.config.exists() {
            let content = fs::read_to_string(&args.config)?;
            toml::from_str(&content)?
        } else {
            tracing::info!(path = ?args.config, "Config file not found, using defaults.");
            Self::default()
        };

        // Override with CLI arguments
        if let Some(bind) = &args.bind {
            config.server.bind = bind.clone();
        }
        if let Some(port) = args.port {
            config.server.port = port;
        }
        if let Some(hostname) = &args.hostname {
            config.server.hostname = hostname.clone();
        }
        if let Some(scheme) = &args.access_scheme {
            config.server.access_scheme = scheme.clone();
        }
        if let Some(port) = args.access_port {
            config.server.access_port = Some(port);
        }
        if let Some(secs) = args.request_timeout_secs {
            config.limits.request_timeout_secs = secs;
        }
        if args.no_hello {
            config.server.hello_message = false;
        }

        Ok(config)
    }

    pub fn generate_default_file(path: &PathBuf) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(&Self::default())?;
        fs::write(path, content)?;
        tracing::info!(path = ?path, "Generated default server config.");
        Ok(())
    }

    pub fn http_addr(&self) -> String {
        format!("{}:{}", self.server.bind, self.server.port)
    }

    /// Public URL under which the tunnel `name` is reachable.
    pub fn public_url(&self, name: &str) -> String {
        let scheme = &self.server.access_scheme;
        let default_port = if scheme == "https" { 443 } else { 80 };
        match self.server.access_port {
            Some(port) if port != default_port => {
                format!("{}://{}.{}:{}", scheme, name, self.server.hostname, port)
            }
            _ => format!("{}://{}.{}", scheme, name, self.server.hostname),
        }
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        match self.limits.request_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn keepalive_interval(&self) -> Option<Duration> {
        match self.limits.keepalive_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

impl ClientConfig {
    pub fn load(args: &ClientArgs) -> Result<Self, ConfigError> {
        let mut config = if args.config.exists() {
            let content = fs::read_to_string(&args.config)?;
            toml::from_str(&content)?
        } else {
            tracing::info!(path = ?args.config, "Config file not found, using defaults.");
            Self::default()
        };

        let client = &mut config.client;
        if let Some(target) = &args.target {
            client.target = target.clone();
        }
        if let Some(name) = &args.name {
            client.name = name.clone();
        }
        if let Some(host) = &args.server_host {
            client.server_host = host.clone();
        }
        if let Some(port) = args.server_port {
            client.server_port = Some(port);
        }
        if args.insecure {
            client.insecure = true;
        }
        if !args.allow_ips.is_empty() {
            client.allowed_ips = args.allow_ips.clone();
        }
        for header in &args.headers {
            let (name, value) = parse_header_arg(header)?;
            client.target_headers.insert(name, value);
        }
        for header in &args.server_headers {
            let (name, value) = parse_header_arg(header)?;
            client.server_headers.insert(name, value);
        }
        if let Some(token) = &args.token {
            client.token = Some(token.clone());
        }
        if let Some(attempts) = args.reconnect_attempts {
            client.reconnect_attempts = attempts;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn generate_default_file(path: &PathBuf) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(&Self::default())?;
        fs::write(path, content)?;
        tracing::info!(path = ?path, "Generated default client config.");
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let client = &self.client;
        if client.name.trim().is_empty() {
            return Err(ConfigError::MissingName);
        }
        if client.target.trim().is_empty() {
            return Err(ConfigError::MissingTarget);
        }
        match Url::parse(&client.target) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {}
            _ => return Err(ConfigError::InvalidTarget(client.target.clone())),
        }
        self.allowed_networks()?;
        for (name, value) in client.target_headers.iter().chain(&client.server_headers) {
            validate_header(name, value)?;
        }
        self.registration_url()?;
        Ok(())
    }

    pub fn allowed_networks(&self) -> Result<Vec<IpNet>, ConfigError> {
        self.client
            .allowed_ips
            .iter()
            .map(|entry| parse_network(entry).ok_or_else(|| ConfigError::InvalidNetwork(entry.clone())))
            .collect()
    }

    /// `ws(s)://host[:port]/register?name=<name>`
    pub fn registration_url(&self) -> Result<Url, ConfigError> {
        let client = &self.client;
        let scheme = if client.insecure { "ws" } else { "wss" };
        let authority = match client.server_port {
            Some(port) => format!("{}:{}", client.server_host, port),
            None => client.server_host.clone(),
        };

        let mut url = Url::parse(&format!("{}://{}/register", scheme, authority))
            .map_err(|_| ConfigError::InvalidServer(authority.clone()))?;
        if url.host_str().is_none_or(str::is_empty) {
            return Err(ConfigError::InvalidServer(authority));
        }
        url.query_pairs_mut().append_pair("name", &client.name);
        Ok(url)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.client.reconnect_delay_secs)
    }
}

/// Parse a CIDR range, accepting a bare address as a single-host range.
pub fn parse_network(entry: &str) -> Option<IpNet> {
    let entry = entry.trim();
    entry
        .parse::<IpNet>()
        .ok()
        .or_else(|| entry.parse::<IpAddr>().ok().map(IpNet::from))
}

fn parse_header_arg(arg: &str) -> Result<(String, String), ConfigError> {
    let (name, value) = arg
        .split_once('=')
        .or_else(|| arg.split_once(':'))
        .ok_or_else(|| ConfigError::InvalidHeader(arg.to_string()))?;
    let (name, value) = (name.trim().to_string(), value.trim().to_string());
    validate_header(&name, &value)?;
    Ok((name, value))
}

fn validate_header(name: &str, value: &str) -> Result<(), ConfigError> {
    if HeaderName::from_bytes(name.as_bytes()).is_err() || HeaderValue::from_str(value).is_err() {
        return Err(ConfigError::InvalidHeader(format!("{}={}", name, value)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_config() -> ClientConfig {
        let mut config = ClientConfig::default();
        config.client.name = "foo".to_string();
        config.client.target = "http://localhost:3000".to_string();
        config.client.server_host = "tunnel.example.com".to_string();
        config
    }

    #[test]
    fn test_defaults_require_name_and_target() {
        match ClientConfig::default().validate() {
            Err(ConfigError::MissingName) => {}
            other => panic!("Unexpected result: {:?}", other),
        }

        let mut config = client_config();
        config.client.target.clear();
        match config.validate() {
            Err(ConfigError::MissingTarget) => {}
            other => panic!("Unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_valid_config_passes() {
        let mut config = client_config();
        config.client.allowed_ips = vec!["10.0.0.0/8".into(), "::/0".into(), "192.168.1.7".into()];
        config.client.target_headers.insert("X-Api-Key".into(), "secret".into());
        config.validate().unwrap();
        assert_eq!(config.allowed_networks().unwrap().len(), 3);
    }

    #[test]
    fn test_invalid_cidr_rejected() {
        let mut config = client_config();
        config.client.allowed_ips = vec!["10.0.0.0/99".into()];
        match config.validate() {
            Err(ConfigError::InvalidNetwork(entry)) => assert_eq!(entry, "10.0.0.0/99"),
            other => panic!("Unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_target_must_be_http_url() {
        let mut config = client_config();
        config.client.target = "localhost:3000".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::InvalidTarget(_))));
    }

    #[test]
    fn test_registration_url() {
        let mut config = client_config();
        assert_eq!(
            config.registration_url().unwrap().as_str(),
            "wss://tunnel.example.com/register?name=foo"
        );

        config.client.insecure = true;
        config.client.server_port = Some(8080);
        assert_eq!(
            config.registration_url().unwrap().as_str(),
            "ws://tunnel.example.com:8080/register?name=foo"
        );

        config.client.server_port = None;
        config.client.server_host = "127.0.0.1:9000".to_string();
        assert_eq!(
            config.registration_url().unwrap().as_str(),
            "ws://127.0.0.1:9000/register?name=foo"
        );
    }

    #[test]
    fn test_public_url() {
        let mut config = ServerConfig::default();
        config.server.hostname = "example.com".to_string();
        assert_eq!(config.public_url("foo"), "http://foo.example.com");

        config.server.access_port = Some(8080);
        assert_eq!(config.public_url("foo"), "http://foo.example.com:8080");

        config.server.access_scheme = "https".to_string();
        config.server.access_port = Some(443);
        assert_eq!(config.public_url("foo"), "https://foo.example.com");
    }

    #[test]
    fn test_header_args() {
        assert_eq!(
            parse_header_arg("X-Foo=bar").unwrap(),
            ("X-Foo".to_string(), "bar".to_string())
        );
        assert_eq!(
            parse_header_arg("Authorization: Bearer abc").unwrap(),
            ("Authorization".to_string(), "Bearer abc".to_string())
        );
        assert!(parse_header_arg("no separator").is_err());
        assert!(parse_header_arg("bad name=value").is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: ClientConfig = toml::from_str(
            r#"
            [client]
            name = "foo"
            target = "http://localhost:3000"
            "#,
        )
        .unwrap();
        assert_eq!(config.client.reconnect_attempts, 5);
        assert_eq!(config.client.server_host, "localhost");

        let server: ServerConfig = toml::from_str("[server]\nport = 9000\n").unwrap();
        assert_eq!(server.server.port, 9000);
        assert_eq!(server.limits.request_timeout_secs, 30);
    }

    #[test]
    fn test_default_config_round_trips_through_toml() {
        let content = toml::to_string_pretty(&ServerConfig::default()).unwrap();
        let parsed: ServerConfig = toml::from_str(&content).unwrap();
        assert_eq!(parsed.http_addr(), "0.0.0.0:8080");
        assert_eq!(parsed.request_timeout(), Some(Duration::from_secs(30)));
    }
}
