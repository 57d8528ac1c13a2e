//! SSH Error types

use std::fmt;

use thiserror::Error;

use super::proxy::ProxyError;

/// libssh2 session error codes the engine reacts to.
pub mod codes {
    pub const NONE: i32 = 0;
    /// Also used for "no live handle" on this side of the binding.
    pub const SOCKET_NONE: i32 = -1;
    pub const ALLOC: i32 = -6;
    pub const SOCKET_SEND: i32 = -7;
    pub const TIMEOUT: i32 = -9;
    pub const SOCKET_DISCONNECT: i32 = -13;
    pub const FILE: i32 = -16;
    pub const METHOD_NONE: i32 = -17;
    pub const AUTHENTICATION_FAILED: i32 = -18;
    pub const CHANNEL_FAILURE: i32 = -21;
    pub const CHANNEL_CLOSED: i32 = -26;
    pub const SOCKET_TIMEOUT: i32 = -30;
    pub const SFTP_PROTOCOL: i32 = -31;
    pub const EAGAIN: i32 = -37;
    pub const BAD_USE: i32 = -39;
    pub const SOCKET_RECV: i32 = -43;
}

/// Name of an SFTP status code (`SSH_FX_*`).
pub fn sftp_status_name(code: i32) -> &'static str {
    match code {
        0 => "OK",
        1 => "EOF",
        2 => "NO_SUCH_FILE",
        3 => "PERMISSION_DENIED",
        4 => "FAILURE",
        5 => "BAD_MESSAGE",
        6 => "NO_CONNECTION",
        7 => "CONNECTION_LOST",
        8 => "OP_UNSUPPORTED",
        9 => "INVALID_HANDLE",
        10 => "NO_SUCH_PATH",
        11 => "FILE_ALREADY_EXISTS",
        12 => "WRITE_PROTECT",
        13 => "NO_MEDIA",
        14 => "NO_SPACE_ON_FILESYSTEM",
        15 => "QUOTA_EXCEEDED",
        16 => "UNKNOWN_PRINCIPAL",
        17 => "LOCK_CONFLICT",
        18 => "DIR_NOT_EMPTY",
        19 => "NOT_A_DIRECTORY",
        20 => "INVALID_FILENAME",
        21 => "LINK_LOOP",
        _ => "UNKNOWN",
    }
}

/// Where a protocol error code comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// libssh2 session error (`LIBSSH2_ERROR_*`)
    Session(i32),
    /// SFTP status returned by the server (`SSH_FX_*`)
    Sftp(i32),
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::Session(code) => write!(f, "libssh2 {}", code),
            ErrorCode::Sftp(code) => write!(f, "sftp {}", sftp_status_name(*code)),
        }
    }
}

/// Error reported by the protocol library for a single call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} ({code})")]
pub struct ProtocolError {
    code: ErrorCode,
    message: String,
}

impl ProtocolError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn session(code: i32, message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Session(code), message)
    }

    pub fn sftp(code: i32, message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Sftp(code), message)
    }

    /// The library's "would block" sentinel.
    pub fn would_block() -> Self {
        Self::session(codes::EAGAIN, "would block")
    }

    /// A call was attempted without the handle it needs.
    pub fn no_handle(what: &str) -> Self {
        Self::session(codes::SOCKET_NONE, format!("{} is not open", what))
    }

    /// Local I/O failure inside an adapter.
    pub fn io(err: &std::io::Error) -> Self {
        Self::session(codes::FILE, err.to_string())
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_session_code(&self, code: i32) -> bool {
        self.code == ErrorCode::Session(code)
    }

    pub fn is_would_block(&self) -> bool {
        self.is_session_code(codes::EAGAIN)
    }
}

#[derive(Error, Debug)]
pub enum SshError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Proxy error: {0}")]
    Proxy(#[from] ProxyError),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Host key rejected: {0}")]
    HostKeyRejected(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Authentication method not offered by server: {0}")]
    MethodNotAdvertised(String),

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("SFTP error: {0}")]
    Sftp(String),

    #[error("SSH protocol error: {0}")]
    Protocol(ProtocolError),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Transfer aborted: {0}")]
    TransferAborted(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Background task failed: {0}")]
    TaskFailed(String),
}

impl From<ProtocolError> for SshError {
    fn from(err: ProtocolError) -> Self {
        match err.code() {
            ErrorCode::Session(codes::SOCKET_NONE) => SshError::NotConnected,
            ErrorCode::Session(codes::EAGAIN) => {
                SshError::Timeout("socket did not become ready".to_string())
            }
            ErrorCode::Session(codes::TIMEOUT) | ErrorCode::Session(codes::SOCKET_TIMEOUT) => {
                SshError::Timeout(err.message().to_string())
            }
            ErrorCode::Sftp(_) => SshError::Sftp(err.to_string()),
            ErrorCode::Session(_) => SshError::Protocol(err),
        }
    }
}

impl From<tokio::task::JoinError> for SshError {
    fn from(err: tokio::task::JoinError) -> Self {
        SshError::TaskFailed(err.to_string())
    }
}

// Errors cross API boundaries as plain strings
impl serde::Serialize for SshError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
