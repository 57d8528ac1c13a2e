//! One-shot command execution on a dedicated channel

use bytes::{Bytes, BytesMut};
use serde::Serialize;
use tracing::{debug, info};

use super::new_channel;
use crate::ssh::backend::{Backend, ChannelBackend};
use crate::ssh::{ProtocolError, Session, SessionInner, SshError, StreamId};
use crate::stream::adapters::{ChannelSource, ChannelTarget};
use crate::stream::{copy, PipeSink};

/// Marker echoed back by [`Session::is_echo`]
const ECHO_MARKER: &str = ">TEST<";

/// Captured result of a command.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecOutput {
    #[serde(with = "lossy")]
    pub stdout: Bytes,
    #[serde(with = "lossy")]
    pub stderr: Bytes,
    pub exit_status: i32,
}

impl ExecOutput {
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    pub fn success(&self) -> bool {
        self.exit_status == 0
    }
}

mod lossy {
    use bytes::Bytes;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(data: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&String::from_utf8_lossy(data))
    }
}

impl<B: Backend> SessionInner<B> {
    /// Run `command` on its own channel, streaming output to the callbacks.
    ///
    /// A callback returning `false` stops reading that stream. Returns the
    /// exit status.
    pub(crate) fn exec_streaming(
        &self,
        command: &str,
        on_stdout: &mut dyn FnMut(&[u8]) -> bool,
        on_stderr: &mut dyn FnMut(&[u8]) -> bool,
    ) -> Result<i32, SshError> {
        let generation = self.generation().ok_or(SshError::NotConnected)?;
        let mut channel = self
            .call(true, |h| {
                h.ensure_generation(generation)?;
                new_channel(h)
            })
            .map_err(|e| SshError::ChannelError(e.to_string()))?;
        debug!("Session {} exec channel open: {}", self.id, command);

        let result = self.run_command(&mut channel, generation, command, on_stdout, on_stderr);
        self.exclusive(|_| drop(channel));
        result
    }

    /// Serialized, retrying call on a channel owned by the caller.
    fn on_channel<T>(
        &self,
        channel: &mut B::Channel,
        generation: u64,
        mut op: impl FnMut(&mut B::Channel) -> Result<T, ProtocolError>,
    ) -> Result<T, ProtocolError> {
        self.call(true, |h| {
            h.ensure_generation(generation)?;
            op(channel)
        })
    }

    fn run_command(
        &self,
        channel: &mut B::Channel,
        generation: u64,
        command: &str,
        on_stdout: &mut dyn FnMut(&[u8]) -> bool,
        on_stderr: &mut dyn FnMut(&[u8]) -> bool,
    ) -> Result<i32, SshError> {
        self.on_channel(channel, generation, |c| c.process_startup("exec", Some(command)))
            .map_err(|e| SshError::ChannelError(e.to_string()))?;

        let forwards: [(StreamId, &mut dyn FnMut(&[u8]) -> bool); 2] = [
            (StreamId::Stdout, &mut *on_stdout),
            (StreamId::Stderr, &mut *on_stderr),
        ];
        for (stream, forward) in forwards {
            let mut source =
                ChannelSource::new(self, ChannelTarget::Borrowed(&mut *channel), stream, true);
            let mut sink = PipeSink::new(|data: &[u8]| forward(data));
            copy(&mut source, &mut sink, self.config.buffer_size, |_| true)?;
        }

        self.on_channel(channel, generation, |c| c.close())?;
        self.on_channel(channel, generation, |c| c.wait_close())?;
        let status = self.exclusive(|_| channel.exit_status());
        info!(
            "Session {} exec finished with status {}: {}",
            self.id, status, command
        );
        Ok(status)
    }

    pub(crate) fn exec_capture(&self, command: &str) -> Result<ExecOutput, SshError> {
        let mut stdout = BytesMut::new();
        let mut stderr = BytesMut::new();
        let exit_status = self.exec_streaming(
            command,
            &mut |data: &[u8]| {
                stdout.extend_from_slice(data);
                true
            },
            &mut |data: &[u8]| {
                stderr.extend_from_slice(data);
                true
            },
        )?;
        Ok(ExecOutput {
            stdout: stdout.freeze(),
            stderr: stderr.freeze(),
            exit_status,
        })
    }

    pub(crate) fn is_echo(&self) -> bool {
        match self.exec_capture(&format!("echo \"{}\"", ECHO_MARKER)) {
            Ok(output) => output.stdout_text().trim().starts_with(ECHO_MARKER),
            Err(e) => {
                debug!("Session {} echo probe failed: {}", self.id, e);
                false
            }
        }
    }
}

impl<B: Backend> Session<B> {
    /// Run `command` on a new channel and collect its output.
    pub async fn exec_capture(&self, command: &str) -> Result<ExecOutput, SshError> {
        let command = command.to_string();
        self.run(move |s| s.exec_capture(&command)).await
    }

    /// Run `command` on a new channel, passing output chunks to the callbacks as they arrive.
    pub async fn exec_streaming<O, E>(
        &self,
        command: &str,
        mut on_stdout: O,
        mut on_stderr: E,
    ) -> Result<i32, SshError>
    where
        O: FnMut(&[u8]) -> bool + Send + 'static,
        E: FnMut(&[u8]) -> bool + Send + 'static,
    {
        let command = command.to_string();
        self.run(move |s| s.exec_streaming(&command, &mut on_stdout, &mut on_stderr))
            .await
    }

    /// Whether the server runs commands and echoes their output.
    pub async fn is_echo(&self) -> bool {
        self.run(|s| Ok(s.is_echo())).await.unwrap_or(false)
    }
}
