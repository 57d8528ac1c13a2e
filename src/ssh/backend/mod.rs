//! Protocol backend seam
//!
//! The engine drives the protocol library through these traits. Every call
//! is made with the session's call serializer held, and any call may return
//! the would-block sentinel ([`ProtocolError::would_block`]); the engine then
//! waits for socket readiness and retries. The production implementation
//! wraps the `ssh2` crate (libssh2).

use std::path::Path;
use std::time::Duration;

use super::config::SshConfig;
use super::delegate::SessionHooks;
use super::error::ProtocolError;
use super::transport::Transport;
use super::types::{BlockDirections, HostKeyType, MethodType, StreamId};
use crate::sftp::Statvfs;

pub mod libssh2;
#[cfg(test)]
pub(crate) mod scripted;

pub use self::libssh2::{Libssh2Connector, Libssh2Session};

/// Creates a session handle bound to a connected transport.
pub trait Connector<B: Backend>: Send + Sync + 'static {
    fn open(
        &self,
        transport: &Transport,
        config: &SshConfig,
        hooks: SessionHooks,
    ) -> Result<B, ProtocolError>;
}

/// A libssh2-shaped session handle.
pub trait Backend: Send + 'static {
    type Channel: ChannelBackend;
    type Sftp: SftpBackend;

    fn set_method_pref(&mut self, method: MethodType, prefs: &str) -> Result<(), ProtocolError>;
    fn set_compress(&mut self, compress: bool);
    fn set_allow_sigpipe(&mut self, allow: bool);
    fn set_blocking(&mut self, blocking: bool);
    fn is_blocking(&self) -> bool;
    fn set_timeout(&mut self, timeout: Duration);
    fn set_banner(&mut self, banner: &str) -> Result<(), ProtocolError>;
    fn set_trace(&mut self, mask: i32);

    fn handshake(&mut self) -> Result<(), ProtocolError>;
    /// Directions the last would-block return was waiting on.
    fn block_directions(&self) -> BlockDirections;
    fn host_key(&self) -> Option<(HostKeyType, Vec<u8>)>;
    fn remote_banner(&self) -> Option<String>;
    /// Negotiated algorithm for a method category.
    fn methods(&self, method: MethodType) -> Option<String>;
    fn last_error(&self) -> Option<ProtocolError>;

    /// Comma separated list of methods the server accepts for `username`.
    fn auth_methods(&mut self, username: &str) -> Result<String, ProtocolError>;
    fn authenticated(&self) -> bool;
    fn userauth_password(&mut self, username: &str, password: &str) -> Result<(), ProtocolError>;
    fn userauth_pubkey_file(
        &mut self,
        username: &str,
        public_key: Option<&Path>,
        private_key: &Path,
        passphrase: Option<&str>,
    ) -> Result<(), ProtocolError>;
    fn userauth_pubkey_memory(
        &mut self,
        username: &str,
        public_key: Option<&str>,
        private_key: &str,
        passphrase: Option<&str>,
    ) -> Result<(), ProtocolError>;
    fn userauth_keyboard_interactive(
        &mut self,
        username: &str,
        respond: &mut dyn FnMut(&str) -> String,
    ) -> Result<(), ProtocolError>;

    fn keepalive_config(&mut self, want_reply: bool, interval_secs: u32);
    /// Returns seconds until the next keepalive is due.
    fn keepalive_send(&mut self) -> Result<u32, ProtocolError>;
    fn disconnect(&mut self, description: &str) -> Result<(), ProtocolError>;

    fn channel_open_session(
        &mut self,
        window_size: u32,
        packet_size: u32,
    ) -> Result<Self::Channel, ProtocolError>;
    fn channel_direct_tcpip(
        &mut self,
        host: &str,
        port: u16,
        originator: (&str, u16),
    ) -> Result<Self::Channel, ProtocolError>;
    fn channel_direct_streamlocal(
        &mut self,
        socket_path: &str,
        originator: (&str, u16),
    ) -> Result<Self::Channel, ProtocolError>;
    /// Open an SCP download; also returns the declared file size.
    fn scp_recv(&mut self, path: &Path) -> Result<(Self::Channel, u64), ProtocolError>;
    fn scp_send(&mut self, path: &Path, mode: i32, size: u64) -> Result<Self::Channel, ProtocolError>;
    fn sftp_init(&mut self) -> Result<Self::Sftp, ProtocolError>;
}

/// A channel handle. Freed on drop.
pub trait ChannelBackend: Send + 'static {
    fn request_pty(&mut self, term: &str, width: u32, height: u32) -> Result<(), ProtocolError>;
    fn request_pty_size(&mut self, width: u32, height: u32) -> Result<(), ProtocolError>;
    fn setenv(&mut self, name: &str, value: &str) -> Result<(), ProtocolError>;
    /// Start `shell`, `exec` (with the command as message) or `subsystem`.
    fn process_startup(&mut self, request: &str, message: Option<&str>) -> Result<(), ProtocolError>;
    /// `Ok(0)` means end of stream.
    fn read(&mut self, stream: StreamId, buf: &mut [u8]) -> Result<usize, ProtocolError>;
    fn write(&mut self, stream: StreamId, data: &[u8]) -> Result<usize, ProtocolError>;
    /// Remote sent EOF.
    fn eof(&self) -> bool;
    /// Exit status, 0 until one is received.
    fn exit_status(&self) -> i32;
    fn send_eof(&mut self) -> Result<(), ProtocolError>;
    fn wait_eof(&mut self) -> Result<(), ProtocolError>;
    fn close(&mut self) -> Result<(), ProtocolError>;
    fn wait_close(&mut self) -> Result<(), ProtocolError>;
}

/// Raw SFTP attributes; absent fields were not sent by the server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SftpAttributes {
    pub size: Option<u64>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub perm: Option<u32>,
    pub atime: Option<u64>,
    pub mtime: Option<u64>,
}

/// One `readdir` result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDirEntry {
    pub name: String,
    /// `ls -l` style line, when the server provides one
    pub longname: Option<String>,
    pub attrs: SftpAttributes,
}

/// How a remote file is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    /// Write, creating or truncating
    Write,
}

/// An SFTP sub-session. Freed on drop.
pub trait SftpBackend: Send + 'static {
    type File: FileBackend;

    fn stat(&mut self, path: &Path) -> Result<SftpAttributes, ProtocolError>;
    fn setstat(&mut self, path: &Path, attrs: SftpAttributes) -> Result<(), ProtocolError>;
    fn mkdir(&mut self, path: &Path, mode: i32) -> Result<(), ProtocolError>;
    fn rmdir(&mut self, path: &Path) -> Result<(), ProtocolError>;
    fn unlink(&mut self, path: &Path) -> Result<(), ProtocolError>;
    /// Rename with overwrite, atomic and native flags.
    fn rename(&mut self, src: &Path, dst: &Path) -> Result<(), ProtocolError>;
    fn symlink(&mut self, path: &Path, target: &Path) -> Result<(), ProtocolError>;
    fn readlink(&mut self, path: &Path) -> Result<String, ProtocolError>;
    fn realpath(&mut self, path: &Path) -> Result<String, ProtocolError>;
    fn statvfs(&mut self, path: &Path) -> Result<Statvfs, ProtocolError>;
    fn open_file(&mut self, path: &Path, mode: OpenMode, permissions: i32) -> Result<Self::File, ProtocolError>;
    fn open_dir(&mut self, path: &Path) -> Result<Self::File, ProtocolError>;
}

/// An open SFTP file or directory handle. Freed on drop.
pub trait FileBackend: Send + 'static {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, ProtocolError>;
    fn write(&mut self, data: &[u8]) -> Result<usize, ProtocolError>;
    /// Next directory entry, `None` once the listing is exhausted.
    fn readdir(&mut self) -> Result<Option<RawDirEntry>, ProtocolError>;
}

/// File handle type of a backend.
pub type FileOf<B> = <<B as Backend>::Sftp as SftpBackend>::File;
