//! Channel management
//!
//! A session has at most one primary channel: an interactive shell, an exec
//! or subsystem channel, or a direct TCP/IP or stream-local forward.
//! Replacing it frees the previous one first. One-shot command execution
//! ([`exec`]) and SCP ([`scp`]) use channels of their own.

pub mod exec;
pub mod scp;
pub(crate) mod shell;

use std::io::Read;

use bytes::Bytes;
use tracing::{debug, info};

use crate::ssh::backend::{Backend, ChannelBackend};
use crate::ssh::call::{retry, Handles};
use crate::ssh::{codes, ProtocolError, Session, SessionInner, SshError, StreamId};
use crate::stream::adapters::{ChannelSink, ChannelTarget};
use crate::stream::{copy, ReaderSource};

pub use exec::ExecOutput;
pub use scp::DEFAULT_SCP_MODE;
pub use shell::{DEFAULT_COLUMNS, DEFAULT_ROWS, POLL_TICK};

/// Receive window for new session channels (2 MiB)
pub const WINDOW_SIZE: u32 = 2 * 1024 * 1024;
/// Maximum packet size for new session channels
pub const PACKET_SIZE: u32 = 32768;

/// Open a session channel with the default window and packet sizes.
pub(crate) fn new_channel<B: Backend>(h: &mut Handles<B>) -> Result<B::Channel, ProtocolError> {
    h.session_mut()?.channel_open_session(WINDOW_SIZE, PACKET_SIZE)
}

impl<B: Backend> SessionInner<B> {
    /// Replace the primary channel with the one `open` creates.
    pub(crate) fn install_primary(
        &self,
        mut open: impl FnMut(&mut Handles<B>) -> Result<B::Channel, ProtocolError>,
    ) -> Result<u64, SshError> {
        self.close_shell();
        let serial = self
            .call(true, |h| {
                let channel = open(h)?;
                Ok(h.install_channel(channel))
            })
            .map_err(|e| SshError::ChannelError(e.to_string()))?;
        debug!("Session {} primary channel #{} open", self.id, serial);
        Ok(serial)
    }

    pub(crate) fn open_channel(&self, lang: Option<&str>) -> Result<(), SshError> {
        self.install_primary(new_channel)?;
        if let Some(lang) = lang {
            self.setenv("LANG", lang)?;
        }
        Ok(())
    }

    /// Run `op` on the primary channel.
    pub(crate) fn primary<T>(
        &self,
        mut op: impl FnMut(&mut B::Channel) -> Result<T, ProtocolError>,
    ) -> Result<T, SshError> {
        self.call(true, |h| op(h.channel_mut()?)).map_err(|e| {
            if e.is_session_code(codes::SOCKET_NONE) {
                SshError::NotConnected
            } else {
                SshError::ChannelError(e.to_string())
            }
        })
    }

    pub(crate) fn request_pty_size(&self, width: u32, height: u32) -> Result<(), SshError> {
        self.primary(|c| c.request_pty_size(width, height))
    }

    pub(crate) fn setenv(&self, name: &str, value: &str) -> Result<(), SshError> {
        self.primary(|c| c.setenv(name, value))
    }

    pub(crate) fn exec(&self, command: &str) -> Result<(), SshError> {
        self.primary(|c| c.process_startup("exec", Some(command)))?;
        info!("Session {} exec: {}", self.id, command);
        Ok(())
    }

    pub(crate) fn subsystem(&self, name: &str) -> Result<(), SshError> {
        self.primary(|c| c.process_startup("subsystem", Some(name)))?;
        info!("Session {} subsystem {} started", self.id, name);
        Ok(())
    }

    /// Read up to one buffer from the primary channel.
    ///
    /// Without `wait`, an empty result means nothing was buffered.
    pub(crate) fn read(&self, stderr: bool, wait: bool) -> Result<Bytes, SshError> {
        let stream = StreamId::from_stderr(stderr);
        let mut buf = vec![0u8; self.config.buffer_size];
        match self.call(wait, |h| h.channel_mut()?.read(stream, &mut buf)) {
            Ok(n) => {
                buf.truncate(n);
                Ok(Bytes::from(buf))
            }
            Err(err) if !wait && err.is_would_block() => Ok(Bytes::new()),
            Err(err) => Err(err.into()),
        }
    }

    pub(crate) fn write(&self, data: &[u8], stderr: bool) -> Result<usize, SshError> {
        let stream = StreamId::from_stderr(stderr);
        let written = self.primary(|c| c.write(stream, data))?;
        if written == 0 {
            return Err(SshError::ChannelError("channel accepted no data".to_string()));
        }
        Ok(written)
    }

    /// Copy everything `reader` yields into the primary channel.
    pub(crate) fn write_from(&self, reader: &mut dyn Read, stderr: bool) -> Result<u64, SshError> {
        let serial = self
            .exclusive(|h| h.channel.as_ref().map(|slot| slot.serial))
            .ok_or(SshError::NotConnected)?;
        let mut source = ReaderSource::new(reader);
        let mut sink = ChannelSink::new(
            self,
            ChannelTarget::Primary(serial),
            StreamId::from_stderr(stderr),
        );
        let written = copy(&mut source, &mut sink, self.config.buffer_size, |_| true)?;
        debug!("Session {} wrote {} bytes to the primary channel", self.id, written);
        Ok(written)
    }

    /// Send EOF once; later calls and channels the peer already closed succeed quietly.
    pub(crate) fn send_eof(&self) -> Result<(), SshError> {
        self.call(true, |h| {
            let slot = h
                .channel
                .as_mut()
                .ok_or_else(|| ProtocolError::no_handle("channel"))?;
            if slot.eof_sent || slot.handle.eof() {
                return Ok(());
            }
            slot.handle.send_eof()?;
            slot.eof_sent = true;
            Ok(())
        })?;
        Ok(())
    }

    /// Whether the primary channel may still produce output.
    pub(crate) fn is_read(&self) -> bool {
        let connected = self.is_connected();
        self.exclusive(|h| {
            h.channel
                .as_ref()
                .is_some_and(|slot| !(slot.handle.eof() || slot.handle.exit_status() != 0))
        }) && connected
    }

    /// Stop the poller and free the primary channel. Idempotent.
    pub(crate) fn close_shell(&self) {
        self.close_primary(None);
    }

    /// Close the primary channel only while it is still the one with `serial`.
    pub(crate) fn close_shell_if(&self, serial: u64) {
        self.close_primary(Some(serial));
    }

    fn close_primary(&self, only: Option<u64>) {
        let poller_stopped = self.stop_poller_for(only);
        let connected = self.is_connected();

        let closed = self.serializer.with_exclusive_access(|h| {
            let current = h.channel.as_ref().map(|slot| slot.serial);
            if only.is_some_and(|serial| current != Some(serial)) {
                return false;
            }
            let Some(mut slot) = h.channel.take() else {
                return false;
            };
            let readable = !slot.handle.eof() && slot.handle.exit_status() == 0;
            if readable && !slot.eof_sent {
                let _ = retry(h, true, |_| slot.handle.send_eof());
            }
            if connected {
                let _ = retry(h, true, |_| slot.handle.wait_eof());
                let _ = retry(h, true, |_| slot.handle.close());
                let _ = retry(h, true, |_| slot.handle.wait_close());
            }
            true
        });

        if let Some(delegate) = self.delegates.channel() {
            if poller_stopped {
                delegate.connect(false);
            }
            if closed {
                delegate.disconnect();
            }
        }
        if closed {
            info!("Session {} primary channel closed", self.id);
        }
    }

    pub(crate) fn free_channel(&self) {
        self.close_shell();
    }

    pub(crate) fn tcpip(
        &self,
        host: &str,
        port: u16,
        originator_host: &str,
        originator_port: u16,
    ) -> Result<(), SshError> {
        self.install_primary(|h| {
            h.session_mut()?
                .channel_direct_tcpip(host, port, (originator_host, originator_port))
        })?;
        info!(
            "Session {} direct-tcpip channel to {}:{}",
            self.id, host, port
        );
        Ok(())
    }

    pub(crate) fn streamlocal(
        &self,
        socket_path: &str,
        originator_host: &str,
        originator_port: u16,
    ) -> Result<(), SshError> {
        self.install_primary(|h| {
            h.session_mut()?
                .channel_direct_streamlocal(socket_path, (originator_host, originator_port))
        })?;
        info!(
            "Session {} direct-streamlocal channel to {}",
            self.id, socket_path
        );
        Ok(())
    }
}

impl<B: Backend> Session<B> {
    /// Replace the primary channel with a fresh session channel, optionally setting `LANG`.
    pub async fn open_channel(&self, lang: Option<&str>) -> Result<(), SshError> {
        let lang = lang.map(str::to_string);
        self.run(move |s| s.open_channel(lang.as_deref())).await
    }

    pub async fn request_pty_size(&self, width: u32, height: u32) -> Result<(), SshError> {
        self.run(move |s| s.request_pty_size(width, height)).await
    }

    pub async fn setenv(&self, name: &str, value: &str) -> Result<(), SshError> {
        let (name, value) = (name.to_string(), value.to_string());
        self.run(move |s| s.setenv(&name, &value)).await
    }

    /// Start `command` on the primary channel.
    pub async fn exec(&self, command: &str) -> Result<(), SshError> {
        let command = command.to_string();
        self.run(move |s| s.exec(&command)).await
    }

    pub async fn subsystem(&self, name: &str) -> Result<(), SshError> {
        let name = name.to_string();
        self.run(move |s| s.subsystem(&name)).await
    }

    pub async fn read(&self, stderr: bool, wait: bool) -> Result<Bytes, SshError> {
        self.run(move |s| s.read(stderr, wait)).await
    }

    pub async fn write(&self, data: Bytes, stderr: bool) -> Result<usize, SshError> {
        self.run(move |s| s.write(&data, stderr)).await
    }

    /// Stream a reader into the primary channel, e.g. as a command's stdin.
    pub async fn write_from<R>(&self, mut reader: R, stderr: bool) -> Result<u64, SshError>
    where
        R: Read + Send + 'static,
    {
        self.run(move |s| s.write_from(&mut reader, stderr)).await
    }

    pub async fn send_eof(&self) -> Result<(), SshError> {
        self.run(|s| s.send_eof()).await
    }

    pub async fn is_read(&self) -> bool {
        self.run(|s| Ok(s.is_read())).await.unwrap_or(false)
    }

    pub async fn close_shell(&self) {
        let _ = self
            .run(|s| {
                s.close_shell();
                Ok(())
            })
            .await;
    }

    pub async fn free_channel(&self) {
        self.close_shell().await;
    }

    /// Replace the primary channel with a direct TCP/IP forward to `host:port`.
    pub async fn tcpip(
        &self,
        host: &str,
        port: u16,
        originator_host: &str,
        originator_port: u16,
    ) -> Result<(), SshError> {
        let (host, originator_host) = (host.to_string(), originator_host.to_string());
        self.run(move |s| s.tcpip(&host, port, &originator_host, originator_port))
            .await
    }

    /// Replace the primary channel with a forward to a Unix socket on the server.
    pub async fn streamlocal(
        &self,
        socket_path: &str,
        originator_host: &str,
        originator_port: u16,
    ) -> Result<(), SshError> {
        let (socket_path, originator_host) = (socket_path.to_string(), originator_host.to_string());
        self.run(move |s| s.streamlocal(&socket_path, &originator_host, originator_port))
            .await
    }
}
