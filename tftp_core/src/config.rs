use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

use crate::transfer::constants::{MAX_RETRIES, MAX_SESSIONS, RECV_TIMEOUT, RECV_TRIES, TFTP_PORT};

const APP_QUALIFIER: &str = "org";
const APP_ORGANIZATION: &str = "tftp";
const APP_NAME: &str = "tftp_rs";
const SERVER_CONFIG_FILE: &str = "server.json";
const CLIENT_CONFIG_FILE: &str = "client.json";
const SERVER_ROOT_DIR: &str = "tftpServer";
const CLIENT_ROOT_DIR: &str = "tftpClient";

pub const ENV_CONFIG_DIR: &str = "TFTP_CONFIG_DIR";
pub const ENV_SERVER_ROOT: &str = "TFTP_SERVER_ROOT";
pub const ENV_CLIENT_ROOT: &str = "TFTP_CLIENT_ROOT";
pub const ENV_TIMEOUT_MS: &str = "TFTP_TIMEOUT_MS";
pub const ENV_MAX_RETRIES: &str = "TFTP_MAX_RETRIES";

/// Timing and retry budget of a single session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Per-attempt receive timeout
    #[serde(rename = "timeout_ms", with = "duration_ms")]
    pub timeout: Duration,
    /// Timeouts absorbed by one receive call before it fails
    pub recv_tries: u32,
    /// Consecutive invalid or missing responses before the session aborts
    pub max_retries: u32,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            timeout: RECV_TIMEOUT,
            recv_tries: RECV_TRIES,
            max_retries: MAX_RETRIES,
        }
    }
}

impl TransferConfig {
    fn apply_env(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        if let Some(ms) = parse_var::<u64>(lookup, ENV_TIMEOUT_MS) {
            self.timeout = Duration::from_millis(ms);
        }
        if let Some(retries) = parse_var::<u32>(lookup, ENV_MAX_RETRIES) {
            self.max_retries = retries.max(1);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_ip: IpAddr,
    pub port: u16,
    pub root_dir: PathBuf,
    /// Sessions allowed to run at once; further requests are refused
    pub max_sessions: usize,
    pub transfer: TransferConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: TFTP_PORT,
            root_dir: home_dir().join(SERVER_ROOT_DIR),
            max_sessions: MAX_SESSIONS,
            transfer: TransferConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load `server.json` (if any), then apply `.env` and environment overrides
    pub fn load() -> Self {
        let _ = dotenvy::dotenv();
        let mut config: Self = load_json(SERVER_CONFIG_FILE);
        config.apply_env(&|key: &str| std::env::var(key).ok());
        config
    }

    pub fn apply_env(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        if let Some(root) = lookup(ENV_SERVER_ROOT).filter(|v| !v.is_empty()) {
            self.root_dir = PathBuf::from(root);
        }
        self.transfer.apply_env(lookup);
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_ip, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Local address the ephemeral session socket binds to
    pub bind_ip: IpAddr,
    pub server: SocketAddr,
    pub root_dir: PathBuf,
    /// Compress before writes and decompress after reads
    pub compress: bool,
    pub transfer: TransferConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            server: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), TFTP_PORT),
            root_dir: home_dir().join(CLIENT_ROOT_DIR),
            compress: true,
            transfer: TransferConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Load `client.json` (if any), then apply `.env` and environment overrides
    pub fn load() -> Self {
        let _ = dotenvy::dotenv();
        let mut config: Self = load_json(CLIENT_CONFIG_FILE);
        config.apply_env(&|key: &str| std::env::var(key).ok());
        config
    }

    pub fn apply_env(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        if let Some(root) = lookup(ENV_CLIENT_ROOT).filter(|v| !v.is_empty()) {
            self.root_dir = PathBuf::from(root);
        }
        self.transfer.apply_env(lookup);
    }
}

fn home_dir() -> PathBuf {
    directories::UserDirs::new()
        .map(|dirs| dirs.home_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Get the path of a config file
fn get_config_path(file: &str) -> Option<PathBuf> {
    if let Ok(dir) = std::env::var(ENV_CONFIG_DIR) {
        return Some(PathBuf::from(dir).join(file));
    }

    ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, APP_NAME)
        .map(|dirs| dirs.config_dir().join(file))
}

/// Read a config file, falling back to defaults when missing or malformed
fn load_json<T: Default + for<'de> Deserialize<'de>>(file: &str) -> T {
    let path = match get_config_path(file) {
        Some(p) => p,
        None => return T::default(),
    };

    match fs::read_to_string(&path) {
        Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
            warn!("Ignoring malformed config {}: {}", path.display(), e);
            T::default()
        }),
        Err(_) => T::default(),
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring invalid {}={}", key, raw);
            None
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
