//! SSH module - sessions on top of libssh2
//!
//! This module provides the session core: transport (direct or through an
//! HTTP CONNECT / SOCKS5 proxy), handshake with host key verification,
//! authentication, keepalive and teardown.
//!
//! # Features
//! - One call serializer per session guarding every library handle
//! - Non-blocking library calls driven by socket readiness
//! - Host key fingerprints (MD5, SHA1, SHA2 family)
//! - Password, public key, keyboard-interactive and `none` authentication
//! - Session and channel event delegates

mod auth;
pub mod backend;
pub(crate) mod call;
mod config;
mod delegate;
mod error;
mod fingerprint;
mod keepalive;
pub mod proxy;
pub mod readiness;
pub mod serializer;
mod session;
pub mod transport;
mod types;

pub use backend::{Backend, Connector, Libssh2Connector, Libssh2Session};
pub use config::{ProxyConfig, SshConfig, LIBSSH2_VERSION};
pub use delegate::{ChannelDelegate, SessionDelegate, SessionHooks};
pub use error::{codes, sftp_status_name, ErrorCode, ProtocolError, SshError};
pub use fingerprint::{fingerprint, render_digest, ShaAlgorithm};
pub use proxy::{connect_via_proxy, ProxyError};
pub use serializer::CallSerializer;
pub use session::Session;
pub(crate) use session::SessionInner;
pub use transport::{probe_banner, TrafficObserver, Transport};
pub use types::{
    trace_mask, AuthType, BlockDirections, HostKey, HostKeyType, MethodType, PtyType,
    SessionState, StreamId, TraceType,
};
