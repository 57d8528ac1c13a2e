//! SSH Configuration

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::fingerprint::ShaAlgorithm;
use super::types::{MethodType, TraceType};

/// SSH connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshConfig {
    /// Remote host address
    pub host: String,

    /// SSH port (default: 22)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Username for authentication
    pub username: String,

    /// Connect and per-call readiness timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Request zlib compression
    #[serde(default = "default_true")]
    pub compress: bool,

    /// Start the session in blocking mode
    #[serde(default = "default_true")]
    pub blocking: bool,

    /// Client banner; a default libssh2 banner is used unless it starts with `SSH-`
    #[serde(default)]
    pub banner: String,

    /// Algorithm preferences per method category
    #[serde(default)]
    pub methods: BTreeMap<MethodType, String>,

    /// Library trace categories
    #[serde(default)]
    pub trace: Vec<TraceType>,

    /// Digest used for the host key fingerprint handed to the delegate
    #[serde(default)]
    pub fingerprint_algorithm: ShaAlgorithm,

    /// Chunk size for channel reads and copies
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Names skipped by directory listings
    #[serde(default = "default_ignored_files")]
    pub ignored_files: Vec<String>,

    /// Keepalive interval in seconds
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_secs: u64,

    /// Optional HTTP CONNECT or SOCKS5 proxy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxyConfig>,
}

impl SshConfig {
    pub fn new(host: impl Into<String>, port: u16, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            timeout_secs: default_timeout(),
            compress: true,
            blocking: true,
            banner: String::new(),
            methods: BTreeMap::new(),
            trace: Vec::new(),
            fingerprint_algorithm: ShaAlgorithm::default(),
            buffer_size: default_buffer_size(),
            ignored_files: default_ignored_files(),
            keepalive_interval_secs: default_keepalive_interval(),
            proxy: None,
        }
    }

    pub fn with_proxy(mut self, proxy: ProxyConfig) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn with_method(mut self, method: MethodType, preference: impl Into<String>) -> Self {
        self.methods.insert(method, preference.into());
        self
    }

    pub fn with_banner(mut self, banner: impl Into<String>) -> Self {
        self.banner = banner.into();
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }

    /// `host:port` form used in log lines.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Banner sent to the server.
    pub fn client_banner(&self) -> String {
        if self.banner.starts_with("SSH-") {
            self.banner.clone()
        } else {
            format!(
                "SSH-2.0-libssh2_{}-{}_{}",
                LIBSSH2_VERSION,
                env!("CARGO_PKG_NAME"),
                env!("CARGO_PKG_VERSION")
            )
        }
    }
}

/// libssh2 version advertised in the default banner.
pub const LIBSSH2_VERSION: &str = "1.11.0";

/// Proxy traversed before the SSH handshake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProxyConfig {
    /// HTTP CONNECT tunnel
    Http {
        host: String,
        port: u16,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        password: Option<String>,
    },

    /// SOCKS5 (RFC 1928) with optional username/password (RFC 1929)
    Socks5 {
        host: String,
        port: u16,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        password: Option<String>,
    },
}

impl ProxyConfig {
    pub fn http(host: impl Into<String>, port: u16) -> Self {
        Self::Http {
            host: host.into(),
            port,
            username: None,
            password: None,
        }
    }

    pub fn socks5(host: impl Into<String>, port: u16) -> Self {
        Self::Socks5 {
            host: host.into(),
            port,
            username: None,
            password: None,
        }
    }

    pub fn with_credentials(self, user: impl Into<String>, pass: impl Into<String>) -> Self {
        match self {
            Self::Http { host, port, .. } => Self::Http {
                host,
                port,
                username: Some(user.into()),
                password: Some(pass.into()),
            },
            Self::Socks5 { host, port, .. } => Self::Socks5 {
                host,
                port,
                username: Some(user.into()),
                password: Some(pass.into()),
            },
        }
    }

    pub fn host(&self) -> &str {
        match self {
            Self::Http { host, .. } | Self::Socks5 { host, .. } => host,
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            Self::Http { port, .. } | Self::Socks5 { port, .. } => *port,
        }
    }

    /// Username and password, only when both are set.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match self {
            Self::Http {
                username: Some(user),
                password: Some(pass),
                ..
            }
            | Self::Socks5 {
                username: Some(user),
                password: Some(pass),
                ..
            } => Some((user.as_str(), pass.as_str())),
            _ => None,
        }
    }
}

fn default_port() -> u16 {
    22
}

fn default_timeout() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

fn default_buffer_size() -> usize {
    0x4000
}

fn default_ignored_files() -> Vec<String> {
    vec![".".to_string(), "..".to_string(), ".DS_Store".to_string()]
}

fn default_keepalive_interval() -> u64 {
    5
}
