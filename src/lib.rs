//! OxideSSH - client side SSH2 engine
//!
//! A [`Session`] owns one connection: transport, handshake, authentication,
//! keepalive, a primary channel (shell or subsystem) with its output poller,
//! one-shot exec channels, SCP and SFTP. Every library call on a session is
//! serialized, so a session can be shared freely between tasks.
//!
//! ```no_run
//! # async fn demo() -> Result<(), oxidessh::SshError> {
//! use oxidessh::{Session, SshConfig};
//!
//! let session = Session::new(SshConfig::new("example.org", 22, "deploy"));
//! session.connect().await?;
//! session.handshake().await?;
//! session.authenticate_password("secret").await?;
//! let output = session.exec_capture("uname -a").await?;
//! println!("{}", output.stdout_text());
//! session.close().await;
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod sftp;
pub mod ssh;
pub mod stream;

pub use channel::ExecOutput;
pub use sftp::{FileInfo, FilePermissions, FileType, Statvfs, TransferControl};
pub use ssh::{
    ChannelDelegate, HostKey, ProxyConfig, PtyType, Session, SessionDelegate, SessionState,
    SshConfig, SshError,
};
pub use stream::{copy, Sink, Source};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install a fmt subscriber filtered by `RUST_LOG`, `info` by default.
///
/// Returns an error if a global subscriber is already set.
pub fn init_logging() -> Result<(), tracing_subscriber::util::TryInitError> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .try_init()
}
