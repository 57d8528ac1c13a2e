//! Plain value types shared by the session, channel and SFTP layers

use serde::{Deserialize, Serialize};

use super::fingerprint::{fingerprint, ShaAlgorithm};

/// Lifecycle of a session handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Uninitialized,
    Connected,
    Handshaking,
    Established,
    Authenticating,
    Authenticated,
    ClosingDown,
    Closed,
}

/// Directions the library is blocked on after a would-block return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockDirections {
    None,
    Inbound,
    Outbound,
    Both,
}

impl BlockDirections {
    pub fn inbound(self) -> bool {
        matches!(self, BlockDirections::Inbound | BlockDirections::Both)
    }

    pub fn outbound(self) -> bool {
        matches!(self, BlockDirections::Outbound | BlockDirections::Both)
    }
}

/// Negotiable algorithm categories (`LIBSSH2_METHOD_*`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MethodType {
    Kex,
    HostKey,
    CryptCs,
    CryptSc,
    MacCs,
    MacSc,
    CompCs,
    CompSc,
    LangCs,
    LangSc,
    SignAlgo,
}

/// Library trace categories (`LIBSSH2_TRACE_*`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceType {
    Trans,
    Kex,
    Auth,
    Conn,
    Scp,
    Sftp,
    Error,
    Publickey,
    Socket,
}

impl TraceType {
    pub fn mask(self) -> i32 {
        match self {
            TraceType::Trans => 1 << 1,
            TraceType::Kex => 1 << 2,
            TraceType::Auth => 1 << 3,
            TraceType::Conn => 1 << 4,
            TraceType::Scp => 1 << 5,
            TraceType::Sftp => 1 << 6,
            TraceType::Error => 1 << 7,
            TraceType::Publickey => 1 << 8,
            TraceType::Socket => 1 << 9,
        }
    }
}

/// Combined trace bitmask for a set of categories.
pub fn trace_mask(types: &[TraceType]) -> i32 {
    types.iter().fold(0, |mask, t| mask | t.mask())
}

/// Terminal type requested with a PTY.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PtyType {
    Vanilla,
    Vt100,
    Vt102,
    Vt220,
    Ansi,
    #[default]
    Xterm,
}

impl PtyType {
    pub fn name(self) -> &'static str {
        match self {
            PtyType::Vanilla => "vanilla",
            PtyType::Vt100 => "vt100",
            PtyType::Vt102 => "vt102",
            PtyType::Vt220 => "vt220",
            PtyType::Ansi => "ansi",
            PtyType::Xterm => "xterm",
        }
    }
}

/// Authentication methods a server may advertise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    None,
    Password,
    Publickey,
    KeyboardInteractive,
}

impl AuthType {
    pub fn name(self) -> &'static str {
        match self {
            AuthType::None => "none",
            AuthType::Password => "password",
            AuthType::Publickey => "publickey",
            AuthType::KeyboardInteractive => "keyboard-interactive",
        }
    }

    /// Parse the server's comma separated method list, skipping unknown names.
    pub fn parse_list(list: &str) -> Vec<AuthType> {
        list.split(',')
            .filter_map(|name| match name.trim() {
                "none" => Some(AuthType::None),
                "password" => Some(AuthType::Password),
                "publickey" => Some(AuthType::Publickey),
                "keyboard-interactive" => Some(AuthType::KeyboardInteractive),
                _ => None,
            })
            .collect()
    }
}

/// Host key algorithm reported by the library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostKeyType {
    Unknown,
    Rsa,
    Dss,
    Ecdsa256,
    Ecdsa384,
    Ecdsa521,
    Ed25519,
}

impl HostKeyType {
    pub fn name(self) -> &'static str {
        match self {
            HostKeyType::Unknown => "unknown",
            HostKeyType::Rsa => "ssh-rsa",
            HostKeyType::Dss => "ssh-dss",
            HostKeyType::Ecdsa256 => "ecdsa-sha2-nistp256",
            HostKeyType::Ecdsa384 => "ecdsa-sha2-nistp384",
            HostKeyType::Ecdsa521 => "ecdsa-sha2-nistp521",
            HostKeyType::Ed25519 => "ssh-ed25519",
        }
    }
}

/// Server host key as presented during the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostKey {
    pub kind: HostKeyType,
    /// Raw key blob
    pub data: Vec<u8>,
    /// Display fingerprint, e.g. `SHA1:ab:cd:...`
    pub fingerprint: String,
}

impl HostKey {
    pub fn new(kind: HostKeyType, data: Vec<u8>, algorithm: ShaAlgorithm) -> Self {
        let fingerprint = fingerprint(algorithm, &data);
        Self {
            kind,
            data,
            fingerprint,
        }
    }
}

/// Channel data stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamId {
    Stdout,
    Stderr,
}

impl StreamId {
    pub fn from_stderr(stderr: bool) -> Self {
        if stderr {
            StreamId::Stderr
        } else {
            StreamId::Stdout
        }
    }

    /// SSH extended data id (`SSH_EXTENDED_DATA_STDERR` is 1).
    pub fn id(self) -> i32 {
        match self {
            StreamId::Stdout => 0,
            StreamId::Stderr => 1,
        }
    }
}
