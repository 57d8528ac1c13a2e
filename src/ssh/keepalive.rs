//! Session keepalive
//!
//! The library is told to expect replies, then a tokio interval task sends
//! one non-retrying keepalive per tick. A failed send on the socket, or a
//! session that has gone away, ends the task.

use std::sync::Weak;
use std::time::Duration;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::backend::Backend;
use super::error::{codes, ProtocolError, SshError};
use super::session::{Session, SessionInner};

impl<B: Backend> SessionInner<B> {
    pub(crate) fn cancel_keepalive(&self) {
        if let Some(token) = self.keepalive.lock().take() {
            token.cancel();
            debug!("Session {} keepalive cancelled", self.id);
        }
    }

    /// Make `token` the running keepalive's, cancelling whichever it replaces.
    pub(crate) fn install_keepalive(&self, token: CancellationToken) {
        if let Some(previous) = self.keepalive.lock().replace(token) {
            previous.cancel();
        }
    }

    pub(crate) fn keepalive_active(&self) -> bool {
        self.keepalive
            .lock()
            .as_ref()
            .is_some_and(|token| !token.is_cancelled())
    }

    fn send_keepalive(&self) -> Result<u32, ProtocolError> {
        self.call(false, |h| h.session_mut()?.keepalive_send())
    }
}

/// Whether a failed keepalive means the connection is gone.
fn is_fatal(err: &ProtocolError) -> bool {
    err.is_session_code(codes::SOCKET_SEND) || err.is_session_code(codes::SOCKET_NONE)
}

async fn run_keepalive<B: Backend>(
    session: Weak<SessionInner<B>>,
    id: String,
    every: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(inner) = session.upgrade() else {
            break;
        };
        let sent = tokio::task::spawn_blocking(move || inner.send_keepalive()).await;
        match sent {
            Ok(Ok(next)) => debug!("Session {} keepalive sent, next due in {}s", id, next),
            Ok(Err(err)) if err.is_would_block() => {}
            Ok(Err(err)) if is_fatal(&err) => {
                warn!("Session {} keepalive failed, stopping: {}", id, err);
                cancel.cancel();
                break;
            }
            Ok(Err(err)) => debug!("Session {} keepalive error: {}", id, err),
            Err(err) => {
                warn!("Session {} keepalive task failed: {}", id, err);
                break;
            }
        }
    }
    debug!("Session {} keepalive task finished", id);
}

impl<B: Backend> Session<B> {
    /// Start sending keepalives every `interval`. Requires an authenticated session.
    ///
    /// Replaces a running keepalive.
    pub async fn keepalive(&self, interval: Duration) -> Result<(), SshError> {
        let secs = u32::try_from(interval.as_secs().max(1)).unwrap_or(u32::MAX);
        self.run(move |s| {
            if !s.is_authenticated() {
                return Err(SshError::NotConnected);
            }
            s.cancel_keepalive();
            s.exclusive(|h| {
                h.session_mut()?.keepalive_config(true, secs);
                Ok::<_, ProtocolError>(())
            })?;
            Ok(())
        })
        .await?;

        let cancel = CancellationToken::new();
        self.inner.install_keepalive(cancel.clone());
        tokio::spawn(run_keepalive(
            std::sync::Arc::downgrade(&self.inner),
            self.inner.id.clone(),
            interval,
            cancel,
        ));
        info!(
            "Session {} keepalive every {:?}",
            self.inner.id, interval
        );
        Ok(())
    }

    /// Keepalive at the configured interval.
    pub async fn start_keepalive(&self) -> Result<(), SshError> {
        self.keepalive(self.inner.config.keepalive_interval()).await
    }

    pub fn cancel_keepalive(&self) {
        self.inner.cancel_keepalive();
    }

    pub fn keepalive_active(&self) -> bool {
        self.inner.keepalive_active()
    }
}
