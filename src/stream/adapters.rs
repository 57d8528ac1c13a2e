//! Sources and sinks bound to a live session
//!
//! Each adapter touches its library handles only through the session's
//! call serializer, and refuses to run once the session handle it was opened
//! against has been freed.

use std::path::{Path, PathBuf};

use tracing::debug;

use super::{Sink, Source};
use crate::ssh::backend::{Backend, ChannelBackend, FileBackend, FileOf, OpenMode, SftpBackend};
use crate::ssh::call::Handles;
use crate::ssh::{ProtocolError, SessionInner, StreamId};

/// Which channel a channel adapter reads or writes.
pub(crate) enum ChannelTarget<'a, C> {
    /// The session's primary channel, as long as it is still the one with this serial
    Primary(u64),
    /// A channel owned by the caller
    Borrowed(&'a mut C),
}

fn with_target<'h, B: Backend>(
    handles: &'h mut Handles<B>,
    target: &'h mut ChannelTarget<'_, B::Channel>,
    generation: u64,
) -> Result<&'h mut B::Channel, ProtocolError> {
    handles.ensure_generation(generation)?;
    match target {
        ChannelTarget::Primary(serial) => handles.channel_with_serial(*serial),
        ChannelTarget::Borrowed(channel) => Ok(&mut **channel),
    }
}

fn current_generation<B: Backend>(session: &SessionInner<B>) -> Result<u64, ProtocolError> {
    session
        .generation()
        .ok_or_else(|| ProtocolError::no_handle("session"))
}

/// Reads one stream of a channel.
///
/// With `wait == false` a would-block read ends the copy instead of
/// waiting, which is how the shell poller drains what is already buffered.
pub(crate) struct ChannelSource<'a, B: Backend> {
    session: &'a SessionInner<B>,
    target: ChannelTarget<'a, B::Channel>,
    stream: StreamId,
    wait: bool,
    generation: u64,
    done: bool,
}

impl<'a, B: Backend> ChannelSource<'a, B> {
    pub(crate) fn new(
        session: &'a SessionInner<B>,
        target: ChannelTarget<'a, B::Channel>,
        stream: StreamId,
        wait: bool,
    ) -> Self {
        Self {
            session,
            target,
            stream,
            wait,
            generation: 0,
            done: false,
        }
    }
}

impl<B: Backend> Source for ChannelSource<'_, B> {
    fn open(&mut self) -> Result<(), ProtocolError> {
        self.generation = current_generation(self.session)?;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, ProtocolError> {
        let (target, stream, generation) = (&mut self.target, self.stream, self.generation);
        let result = self.session.call(self.wait, |h| {
            with_target(h, target, generation)?.read(stream, buf)
        });
        match result {
            Ok(0) => {
                self.done = true;
                Ok(0)
            }
            Ok(n) => Ok(n),
            Err(err) if !self.wait && err.is_would_block() => {
                self.done = true;
                Ok(0)
            }
            Err(err) => {
                self.done = true;
                Err(err)
            }
        }
    }

    fn has_bytes_available(&self) -> bool {
        !self.done
    }
}

/// Writes to one stream of a channel.
pub(crate) struct ChannelSink<'a, B: Backend> {
    session: &'a SessionInner<B>,
    target: ChannelTarget<'a, B::Channel>,
    stream: StreamId,
    generation: u64,
    failed: bool,
}

impl<'a, B: Backend> ChannelSink<'a, B> {
    pub(crate) fn new(
        session: &'a SessionInner<B>,
        target: ChannelTarget<'a, B::Channel>,
        stream: StreamId,
    ) -> Self {
        Self {
            session,
            target,
            stream,
            generation: 0,
            failed: false,
        }
    }
}

impl<B: Backend> Sink for ChannelSink<'_, B> {
    fn open(&mut self) -> Result<(), ProtocolError> {
        self.generation = current_generation(self.session)?;
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, ProtocolError> {
        let (target, stream, generation) = (&mut self.target, self.stream, self.generation);
        self.session
            .call(true, |h| with_target(h, target, generation)?.write(stream, data))
            .inspect_err(|_| self.failed = true)
    }

    fn has_space_available(&self) -> bool {
        !self.failed
    }
}

/// SFTP sub-session plus one open file, released together under the serializer.
struct SftpFile<B: Backend> {
    sftp: Option<B::Sftp>,
    file: Option<FileOf<B>>,
}

impl<B: Backend> SftpFile<B> {
    fn new() -> Self {
        Self {
            sftp: None,
            file: None,
        }
    }

    fn open(
        &mut self,
        session: &SessionInner<B>,
        generation: u64,
        path: &Path,
        mode: OpenMode,
        permissions: i32,
    ) -> Result<Option<u64>, ProtocolError> {
        let sftp = session.call(true, |h| {
            h.ensure_generation(generation)?;
            h.session_mut()?.sftp_init()
        })?;
        let sftp = self.sftp.insert(sftp);
        let size = match mode {
            OpenMode::Read => {
                let attrs = session.call(true, |h| {
                    h.ensure_generation(generation)?;
                    sftp.stat(path)
                })?;
                Some(attrs.size.unwrap_or(0))
            }
            OpenMode::Write => None,
        };
        let file = session.call(true, |h| {
            h.ensure_generation(generation)?;
            sftp.open_file(path, mode, permissions)
        })?;
        self.file = Some(file);
        Ok(size)
    }

    fn file<'h>(
        file: &'h mut Option<FileOf<B>>,
        handles: &Handles<B>,
        generation: u64,
    ) -> Result<&'h mut FileOf<B>, ProtocolError> {
        handles.ensure_generation(generation)?;
        file.as_mut().ok_or_else(|| ProtocolError::no_handle("file"))
    }

    fn release(&mut self, session: &SessionInner<B>) {
        if self.sftp.is_none() && self.file.is_none() {
            return;
        }
        let (file, sftp) = (self.file.take(), self.sftp.take());
        session.exclusive(|_| {
            drop(file);
            drop(sftp);
        });
    }
}

/// Reads a remote file over SFTP.
pub(crate) struct SftpSource<'a, B: Backend> {
    session: &'a SessionInner<B>,
    path: PathBuf,
    handle: SftpFile<B>,
    size: u64,
    got: u64,
    generation: u64,
    failed: bool,
}

impl<'a, B: Backend> SftpSource<'a, B> {
    pub(crate) fn new(session: &'a SessionInner<B>, path: impl Into<PathBuf>) -> Self {
        Self {
            session,
            path: path.into(),
            handle: SftpFile::new(),
            size: 0,
            got: 0,
            generation: 0,
            failed: false,
        }
    }

    /// Size reported by `stat` when the file was opened.
    pub(crate) fn size(&self) -> u64 {
        self.size
    }
}

impl<B: Backend> Source for SftpSource<'_, B> {
    fn open(&mut self) -> Result<(), ProtocolError> {
        self.generation = current_generation(self.session)?;
        let size = self
            .handle
            .open(self.session, self.generation, &self.path, OpenMode::Read, 0)?;
        self.size = size.unwrap_or(0);
        debug!("Reading {} ({} bytes)", self.path.display(), self.size);
        Ok(())
    }

    fn close(&mut self) {
        self.handle.release(self.session);
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, ProtocolError> {
        let (file, generation) = (&mut self.handle.file, self.generation);
        let result = self.session.call(true, |h| {
            SftpFile::<B>::file(file, h, generation)?.read(buf)
        });
        match result {
            Ok(n) => {
                self.got += n as u64;
                Ok(n)
            }
            Err(err) => {
                self.failed = true;
                Err(err)
            }
        }
    }

    fn has_bytes_available(&self) -> bool {
        !self.failed && self.got < self.size
    }
}

impl<B: Backend> Drop for SftpSource<'_, B> {
    fn drop(&mut self) {
        self.handle.release(self.session);
    }
}

/// Writes a remote file over SFTP, creating or truncating it.
pub(crate) struct SftpSink<'a, B: Backend> {
    session: &'a SessionInner<B>,
    path: PathBuf,
    permissions: i32,
    handle: SftpFile<B>,
    generation: u64,
    failed: bool,
}

impl<'a, B: Backend> SftpSink<'a, B> {
    pub(crate) fn new(session: &'a SessionInner<B>, path: impl Into<PathBuf>, permissions: i32) -> Self {
        Self {
            session,
            path: path.into(),
            permissions,
            handle: SftpFile::new(),
            generation: 0,
            failed: false,
        }
    }
}

impl<B: Backend> Sink for SftpSink<'_, B> {
    fn open(&mut self) -> Result<(), ProtocolError> {
        self.generation = current_generation(self.session)?;
        self.handle.open(
            self.session,
            self.generation,
            &self.path,
            OpenMode::Write,
            self.permissions,
        )?;
        Ok(())
    }

    fn close(&mut self) {
        self.handle.release(self.session);
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, ProtocolError> {
        let (file, generation) = (&mut self.handle.file, self.generation);
        self.session
            .call(true, |h| SftpFile::<B>::file(file, h, generation)?.write(data))
            .inspect_err(|_| self.failed = true)
    }

    fn has_space_available(&self) -> bool {
        !self.failed
    }
}

impl<B: Backend> Drop for SftpSink<'_, B> {
    fn drop(&mut self) {
        self.handle.release(self.session);
    }
}

/// Send EOF, wait for the peer's EOF and close, ignoring failures.
fn finish_channel<B: Backend>(
    session: &SessionInner<B>,
    channel: Option<B::Channel>,
    generation: u64,
) {
    let Some(mut channel) = channel else {
        return;
    };
    session.exclusive(|h| {
        if h.ensure_generation(generation).is_ok() {
            let _ = crate::ssh::call::retry(h, true, |_| channel.send_eof());
            let _ = crate::ssh::call::retry(h, true, |_| channel.wait_eof());
            let _ = crate::ssh::call::retry(h, true, |_| channel.close());
            let _ = crate::ssh::call::retry(h, true, |_| channel.wait_close());
        }
        drop(channel);
    });
}

/// Reads an SCP download, never past the size the server declared.
pub(crate) struct ScpSource<'a, B: Backend> {
    session: &'a SessionInner<B>,
    path: PathBuf,
    channel: Option<B::Channel>,
    size: u64,
    got: u64,
    generation: u64,
    done: bool,
}

impl<'a, B: Backend> ScpSource<'a, B> {
    pub(crate) fn new(session: &'a SessionInner<B>, path: impl Into<PathBuf>) -> Self {
        Self {
            session,
            path: path.into(),
            channel: None,
            size: 0,
            got: 0,
            generation: 0,
            done: false,
        }
    }

    /// Size the server declared for the file.
    pub(crate) fn size(&self) -> u64 {
        self.size
    }
}

impl<B: Backend> Source for ScpSource<'_, B> {
    fn open(&mut self) -> Result<(), ProtocolError> {
        let generation = current_generation(self.session)?;
        self.generation = generation;
        let path = &self.path;
        let (channel, size) = self.session.call(true, |h| {
            h.ensure_generation(generation)?;
            h.session_mut()?.scp_recv(path)
        })?;
        self.channel = Some(channel);
        self.size = size;
        debug!("SCP receiving {} ({} bytes)", self.path.display(), size);
        Ok(())
    }

    fn close(&mut self) {
        finish_channel(self.session, self.channel.take(), self.generation);
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, ProtocolError> {
        let remaining = usize::try_from(self.size.saturating_sub(self.got)).unwrap_or(usize::MAX);
        let len = buf.len().min(remaining);
        let (channel, generation) = (&mut self.channel, self.generation);
        let result = self.session.call(true, |h| {
            h.ensure_generation(generation)?;
            channel
                .as_mut()
                .ok_or_else(|| ProtocolError::no_handle("channel"))?
                .read(StreamId::Stdout, &mut buf[..len])
        });
        match result {
            Ok(0) => {
                self.done = true;
                Ok(0)
            }
            Ok(n) => {
                self.got += n as u64;
                Ok(n)
            }
            Err(err) => {
                self.done = true;
                Err(err)
            }
        }
    }

    fn has_bytes_available(&self) -> bool {
        !self.done && self.channel.is_some() && self.got < self.size
    }
}

impl<B: Backend> Drop for ScpSource<'_, B> {
    fn drop(&mut self) {
        finish_channel(self.session, self.channel.take(), self.generation);
    }
}

/// Writes an SCP upload whose size is declared up front.
pub(crate) struct ScpSink<'a, B: Backend> {
    session: &'a SessionInner<B>,
    path: PathBuf,
    mode: i32,
    size: u64,
    channel: Option<B::Channel>,
    sent: u64,
    generation: u64,
    failed: bool,
}

impl<'a, B: Backend> ScpSink<'a, B> {
    pub(crate) fn new(session: &'a SessionInner<B>, path: impl Into<PathBuf>, mode: i32, size: u64) -> Self {
        Self {
            session,
            path: path.into(),
            mode,
            size,
            channel: None,
            sent: 0,
            generation: 0,
            failed: false,
        }
    }
}

impl<B: Backend> Sink for ScpSink<'_, B> {
    fn open(&mut self) -> Result<(), ProtocolError> {
        let generation = current_generation(self.session)?;
        self.generation = generation;
        let (path, mode, size) = (&self.path, self.mode, self.size);
        let channel = self.session.call(true, |h| {
            h.ensure_generation(generation)?;
            h.session_mut()?.scp_send(path, mode, size)
        })?;
        self.channel = Some(channel);
        debug!("SCP sending {} ({} bytes)", self.path.display(), size);
        Ok(())
    }

    fn close(&mut self) {
        finish_channel(self.session, self.channel.take(), self.generation);
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, ProtocolError> {
        let remaining = usize::try_from(self.size.saturating_sub(self.sent)).unwrap_or(usize::MAX);
        let data = &data[..data.len().min(remaining)];
        let (channel, generation) = (&mut self.channel, self.generation);
        let result = self.session.call(true, |h| {
            h.ensure_generation(generation)?;
            channel
                .as_mut()
                .ok_or_else(|| ProtocolError::no_handle("channel"))?
                .write(StreamId::Stdout, data)
        });
        match result {
            Ok(n) => {
                self.sent += n as u64;
                Ok(n)
            }
            Err(err) => {
                self.failed = true;
                Err(err)
            }
        }
    }

    fn has_space_available(&self) -> bool {
        !self.failed && self.sent < self.size
    }
}

impl<B: Backend> Drop for ScpSink<'_, B> {
    fn drop(&mut self) {
        finish_channel(self.session, self.channel.take(), self.generation);
    }
}
