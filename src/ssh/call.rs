//! Handle set guarded by the call serializer, and the retrying call combinator

use std::sync::Arc;
use std::time::Duration;

use super::backend::Backend;
use super::error::ProtocolError;
use super::readiness;
use super::transport::Transport;

/// Primary channel plus whether we already sent EOF on it.
pub(crate) struct ChannelSlot<C> {
    pub(crate) handle: C,
    pub(crate) eof_sent: bool,
    pub(crate) serial: u64,
}

/// Everything that must only be touched by one library call at a time.
pub(crate) struct Handles<B: Backend> {
    pub(crate) session: Option<B>,
    pub(crate) channel: Option<ChannelSlot<B::Channel>>,
    pub(crate) sftp: Option<B::Sftp>,
    pub(crate) socket: Option<Arc<Transport>>,
    pub(crate) timeout: Duration,
    /// Bumped whenever the session handle is created or freed
    pub(crate) generation: u64,
    /// Bumped whenever a primary channel is installed
    pub(crate) channel_serial: u64,
}

impl<B: Backend> Handles<B> {
    pub(crate) fn new(timeout: Duration) -> Self {
        Self {
            session: None,
            channel: None,
            sftp: None,
            socket: None,
            timeout,
            generation: 0,
            channel_serial: 0,
        }
    }

    /// Make `handle` the primary channel, returning its serial.
    pub(crate) fn install_channel(&mut self, handle: B::Channel) -> u64 {
        self.channel_serial += 1;
        self.channel = Some(ChannelSlot {
            handle,
            eof_sent: false,
            serial: self.channel_serial,
        });
        self.channel_serial
    }

    pub(crate) fn session_mut(&mut self) -> Result<&mut B, ProtocolError> {
        self.session
            .as_mut()
            .ok_or_else(|| ProtocolError::no_handle("session"))
    }

    pub(crate) fn channel_mut(&mut self) -> Result<&mut B::Channel, ProtocolError> {
        self.channel
            .as_mut()
            .map(|slot| &mut slot.handle)
            .ok_or_else(|| ProtocolError::no_handle("channel"))
    }

    /// The primary channel, provided it is still the one with `serial`.
    pub(crate) fn channel_with_serial(&mut self, serial: u64) -> Result<&mut B::Channel, ProtocolError> {
        match self.channel.as_mut() {
            Some(slot) if slot.serial == serial => Ok(&mut slot.handle),
            _ => Err(ProtocolError::no_handle("channel")),
        }
    }

    pub(crate) fn sftp_mut(&mut self) -> Result<&mut B::Sftp, ProtocolError> {
        self.sftp
            .as_mut()
            .ok_or_else(|| ProtocolError::no_handle("sftp"))
    }

    /// Fails unless the session handle is still the one `generation` was taken from.
    pub(crate) fn ensure_generation(&self, generation: u64) -> Result<(), ProtocolError> {
        if self.session.is_some() && self.generation == generation {
            Ok(())
        } else {
            Err(ProtocolError::no_handle("session"))
        }
    }

    /// Wait for the directions the library is blocked on.
    pub(crate) fn wait_socket(&self) -> i32 {
        readiness::wait_socket(
            self.socket.as_ref().map(|s| s.raw_fd()),
            self.session.as_ref().map(|s| s.block_directions()),
            self.timeout,
        )
    }
}

/// Run `op`, waiting for readiness and retrying while it would block.
///
/// With `wait == false` the first result is returned as is. When a readiness
/// wait times out or fails, the would-block result is returned.
pub(crate) fn retry<B, T>(
    handles: &mut Handles<B>,
    wait: bool,
    mut op: impl FnMut(&mut Handles<B>) -> Result<T, ProtocolError>,
) -> Result<T, ProtocolError>
where
    B: Backend,
{
    loop {
        match op(handles) {
            Err(err) if wait && err.is_would_block() => {
                if handles.wait_socket() <= 0 {
                    return Err(err);
                }
            }
            result => return result,
        }
    }
}
