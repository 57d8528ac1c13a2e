//! Interactive shell and its output poller
//!
//! The poller runs on its own thread. Every tick it waits up to
//! [`POLL_TICK`] for the session socket to become readable, then drains the
//! primary channel's stdout and stderr without waiting and hands the data to
//! the channel delegate outside the serializer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::new_channel;
use crate::ssh::backend::{Backend, ChannelBackend};
use crate::ssh::readiness::wait_readable;
use crate::ssh::{codes, ProtocolError, PtyType, Session, SessionInner, SshError, StreamId};
use crate::stream::adapters::{ChannelSource, ChannelTarget};
use crate::stream::{copy, PipeSink};

/// Longest the poller sleeps between drains
pub const POLL_TICK: Duration = Duration::from_millis(100);

/// Default terminal size
pub const DEFAULT_COLUMNS: u32 = 80;
pub const DEFAULT_ROWS: u32 = 24;

/// Handle on a running poller thread.
pub(crate) struct ShellPoller {
    cancel: CancellationToken,
    /// Serial of the primary channel this poller drains
    serial: u64,
}

impl ShellPoller {
    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }
}

enum Drained {
    /// Channel still open
    Open(Vec<(StreamId, Bytes)>),
    /// Channel finished or failed; close it after delivering this
    Finished(Vec<(StreamId, Bytes)>),
}

impl<B: Backend> SessionInner<B> {
    /// Cancel the poller, if one runs. Returns whether one did.
    pub(crate) fn stop_poller(&self) -> bool {
        self.stop_poller_for(None)
    }

    /// Like [`stop_poller`](Self::stop_poller), but leaves a poller serving
    /// another channel than `serial` alone.
    pub(crate) fn stop_poller_for(&self, serial: Option<u64>) -> bool {
        let poller = {
            let mut slot = self.poller.lock();
            match (serial, slot.as_ref()) {
                (Some(serial), Some(poller)) if poller.serial != serial => None,
                _ => slot.take(),
            }
        };
        match poller {
            Some(poller) => {
                poller.cancel();
                debug!("Session {} shell poller stopped", self.id);
                true
            }
            None => false,
        }
    }

    fn start_poller(&self, serial: u64) -> Result<(), SshError> {
        let fd = self.transport().ok_or(SshError::NotConnected)?.raw_fd();
        let cancel = CancellationToken::new();
        let session = self.weak_self.clone();
        let (thread_cancel, paused) = (cancel.clone(), self.poll_paused.clone());

        std::thread::Builder::new()
            .name(format!("shell-poller-{}", &self.id[..8.min(self.id.len())]))
            .spawn(move || run_poller(session, serial, fd, thread_cancel, paused))?;

        if let Some(previous) = self.poller.lock().replace(ShellPoller { cancel, serial }) {
            previous.cancel();
        }
        Ok(())
    }

    pub(crate) fn suspend_poll(&self) {
        self.poll_paused.store(true, Ordering::SeqCst);
    }

    pub(crate) fn resume_poll(&self) {
        self.poll_paused.store(false, Ordering::SeqCst);
    }

    /// Read whatever the channel with `serial` has buffered, without waiting.
    fn drain_shell(&self, serial: u64) -> Drained {
        let mut chunks = Vec::new();
        let mut failure: Option<ProtocolError> = None;

        for stream in [StreamId::Stdout, StreamId::Stderr] {
            let mut source =
                ChannelSource::new(self, ChannelTarget::Primary(serial), stream, false);
            let mut sink = PipeSink::new(|data: &[u8]| {
                chunks.push((stream, Bytes::copy_from_slice(data)));
                true
            });
            if let Err(err) = copy(&mut source, &mut sink, self.config.buffer_size, |_| true) {
                failure = Some(err);
                break;
            }
        }

        match failure {
            Some(err) if err.is_session_code(codes::SOCKET_RECV) => {
                warn!("Session {} shell read failed: {}", self.id, err);
                Drained::Finished(chunks)
            }
            Some(err) => {
                debug!("Session {} shell drain stopped: {}", self.id, err);
                Drained::Finished(chunks)
            }
            None if self.is_read() => Drained::Open(chunks),
            None => Drained::Finished(chunks),
        }
    }

    fn deliver(&self, chunks: Vec<(StreamId, Bytes)>) {
        if chunks.is_empty() {
            return;
        }
        let Some(delegate) = self.delegates.channel() else {
            return;
        };
        for (stream, data) in chunks {
            match stream {
                StreamId::Stdout => delegate.stdout(&data),
                StreamId::Stderr => delegate.stderr(&data),
            }
        }
    }

    /// Open a shell on a new primary channel, with a PTY unless `pty` is `None`.
    pub(crate) fn shell(&self, pty: Option<PtyType>, width: u32, height: u32) -> Result<(), SshError> {
        let serial = self.install_primary(new_channel)?;
        let result = self.start_shell(serial, pty, width, height);
        if let Err(err) = &result {
            warn!("Session {} shell failed to start: {}", self.id, err);
            self.close_shell();
        }
        result
    }

    fn start_shell(
        &self,
        serial: u64,
        pty: Option<PtyType>,
        width: u32,
        height: u32,
    ) -> Result<(), SshError> {
        self.set_blocking(false)?;
        self.start_poller(serial)?;
        if let Some(pty) = pty {
            self.primary(|c| c.request_pty(pty.name(), width, height))?;
        }
        self.primary(|c| c.process_startup("shell", None))?;

        if let Some(delegate) = self.delegates.channel() {
            delegate.connect(true);
        }
        info!(
            "Session {} shell started ({}x{}, pty {:?})",
            self.id, width, height, pty
        );
        Ok(())
    }
}

fn run_poller<B: Backend>(
    session: Weak<SessionInner<B>>,
    serial: u64,
    fd: std::os::unix::io::RawFd,
    cancel: CancellationToken,
    paused: Arc<AtomicBool>,
) {
    while !cancel.is_cancelled() {
        if paused.load(Ordering::SeqCst) {
            std::thread::sleep(POLL_TICK);
            continue;
        }
        if wait_readable(fd, POLL_TICK) < 0 {
            debug!("Shell poller socket wait failed, stopping");
            break;
        }
        if cancel.is_cancelled() {
            break;
        }
        if paused.load(Ordering::SeqCst) {
            continue;
        }
        let Some(inner) = session.upgrade() else {
            break;
        };
        match inner.drain_shell(serial) {
            Drained::Open(chunks) => inner.deliver(chunks),
            Drained::Finished(chunks) => {
                inner.deliver(chunks);
                if !cancel.is_cancelled() {
                    inner.close_shell_if(serial);
                }
                break;
            }
        }
    }
}

impl<B: Backend> Session<B> {
    /// Start an interactive shell on a new primary channel.
    ///
    /// Output is delivered to the channel delegate until the shell ends or
    /// [`close_shell`](Session::close_shell) is called.
    pub async fn shell(&self, pty: Option<PtyType>, width: u32, height: u32) -> Result<(), SshError> {
        self.run(move |s| s.shell(pty, width, height)).await
    }

    /// Shell with an xterm PTY of the default size.
    pub async fn default_shell(&self) -> Result<(), SshError> {
        self.shell(Some(PtyType::default()), DEFAULT_COLUMNS, DEFAULT_ROWS)
            .await
    }

    /// Stop delivering shell output until [`resume_poll`](Session::resume_poll).
    pub fn suspend_poll(&self) {
        self.inner.suspend_poll();
    }

    pub fn resume_poll(&self) {
        self.inner.resume_poll();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::backend::scripted::{authenticated, Recorder, Script};

    async fn wait_for(mut done: impl FnMut() -> bool) -> bool {
        for _ in 0..100 {
            if done() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    fn primary_serial<B: Backend>(inner: &SessionInner<B>) -> Option<u64> {
        inner.exclusive(|handles| handles.channel.as_ref().map(|slot| slot.serial))
    }

    fn stdout_of(recorder: &Recorder) -> String {
        String::from_utf8_lossy(&recorder.stdout()).into_owned()
    }

    #[tokio::test]
    async fn test_shell_delivers_output() {
        let script = Script {
            shell_output: b"Welcome to scripted\r\n$ ".to_vec(),
            ..Script::default()
        };
        let h = authenticated(script).await;

        h.session.default_shell().await.unwrap();
        assert!(h.recorder.has("channel_connect:true"));
        assert_eq!(h.state.called("pty:xterm:80x24"), 1);
        assert_eq!(h.state.called("startup:shell"), 1);
        assert!(!h.session.is_blocking().await);

        assert!(wait_for(|| stdout_of(&h.recorder).ends_with("$ ")).await);
        assert_eq!(stdout_of(&h.recorder), "Welcome to scripted\r\n$ ");

        h.session.close_shell().await;
        assert!(h.recorder.has("channel_connect:false"));
        assert_eq!(h.recorder.count("channel_disconnect"), 1);
    }

    #[tokio::test]
    async fn test_shell_closes_on_read_failure() {
        let script = Script {
            shell_output: b"bye\n".to_vec(),
            shell_read_error: Some(ProtocolError::session(codes::SOCKET_RECV, "recv failed")),
            ..Script::default()
        };
        let h = authenticated(script).await;
        h.session.shell(None, 120, 40).await.unwrap();
        assert_eq!(h.state.called("pty:"), 0);

        assert!(wait_for(|| h.recorder.has("channel_disconnect")).await);
        assert_eq!(stdout_of(&h.recorder), "bye\n");
        assert!(!h.session.is_read().await);
        // Closing again is a no-op
        h.session.close_shell().await;
        assert_eq!(h.recorder.count("channel_disconnect"), 1);
    }

    #[tokio::test]
    async fn test_pty_resize_while_polling() {
        let h = authenticated(Script::default()).await;
        h.session.shell(Some(PtyType::Vt100), 80, 24).await.unwrap();

        for width in [100, 120, 132] {
            h.session.request_pty_size(width, 40).await.unwrap();
        }
        assert_eq!(h.state.called("pty_size:"), 3);
        assert_eq!(h.state.called("pty:vt100:80x24"), 1);
        h.session.close().await;
    }

    #[tokio::test]
    async fn test_suspended_poller_delivers_nothing() {
        let script = Script {
            shell_output: b"queued".to_vec(),
            ..Script::default()
        };
        let h = authenticated(script).await;
        h.session.suspend_poll();
        h.session.shell(None, 80, 24).await.unwrap();

        tokio::time::sleep(POLL_TICK * 3).await;
        assert!(h.recorder.stdout().is_empty());

        h.session.resume_poll();
        assert!(wait_for(|| stdout_of(&h.recorder) == "queued").await);
        h.session.close_shell().await;
    }

    #[tokio::test]
    async fn test_stale_close_leaves_new_shell_running() {
        let h = authenticated(Script::default()).await;
        h.session.shell(None, 80, 24).await.unwrap();
        let first = primary_serial(&h.session.inner);
        h.session.shell(None, 80, 24).await.unwrap();
        let second = primary_serial(&h.session.inner);
        assert_ne!(first, second);
        let disconnects = h.recorder.count("channel_disconnect");

        // A poller still finishing the first shell must not touch the second
        h.session.inner.close_shell_if(first.unwrap());
        assert_eq!(h.recorder.count("channel_disconnect"), disconnects);
        assert_eq!(h.recorder.count("channel_connect:false"), 1);
        assert!(h.session.inner.poller.lock().is_some());
        assert_eq!(primary_serial(&h.session.inner), second);

        h.session.inner.close_shell_if(second.unwrap());
        assert_eq!(h.recorder.count("channel_disconnect"), disconnects + 1);
        assert!(h.session.inner.poller.lock().is_none());
    }

    #[tokio::test]
    async fn test_new_shell_replaces_old() {
        let h = authenticated(Script::default()).await;
        h.session.shell(None, 80, 24).await.unwrap();
        h.session.shell(None, 80, 24).await.unwrap();

        assert_eq!(h.recorder.count("channel_connect:true"), 2);
        assert_eq!(h.recorder.count("channel_connect:false"), 1);
        assert_eq!(h.recorder.count("channel_disconnect"), 1);
        h.session.free().await;
        assert_eq!(h.recorder.count("channel_disconnect"), 2);
    }
}
