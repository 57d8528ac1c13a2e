//! Event delegates
//!
//! Sessions report lifecycle, traffic and library diagnostics to a
//! [`SessionDelegate`]; the primary channel reports output and online state
//! to a [`ChannelDelegate`]. Both are optional and may be swapped or cleared
//! at any time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, trace, warn};

use super::transport::TrafficObserver;
use super::types::HostKey;

/// Session level events.
pub trait SessionDelegate: Send + Sync {
    /// Decide whether to trust the server host key. Returning `false` aborts the handshake.
    fn handshake(&self, host_key: &HostKey) -> bool;

    /// Answer one keyboard-interactive prompt.
    fn keyboard_interactive(&self, _prompt: &str) -> String {
        String::new()
    }

    /// Authentication succeeded.
    fn authenticate(&self) {}

    /// The server or the library ended the session.
    fn disconnect(&self, _message: &str) {}

    fn send(&self, _bytes: usize) {}

    fn recv(&self, _bytes: usize) {}

    fn debug(&self, _message: &str) {}

    fn trace(&self, _message: &str) {}
}

/// Primary channel events.
pub trait ChannelDelegate: Send + Sync {
    fn stdout(&self, data: &[u8]);

    fn stderr(&self, data: &[u8]);

    /// Shell went online (`true`) or its poller stopped (`false`).
    fn connect(&self, _online: bool) {}

    /// The primary channel was freed.
    fn disconnect(&self) {}
}

/// Delegate slots owned by a session.
pub(crate) struct Delegates {
    session: RwLock<Option<Arc<dyn SessionDelegate>>>,
    channel: RwLock<Option<Arc<dyn ChannelDelegate>>>,
}

impl Delegates {
    pub(crate) fn new() -> Self {
        Self {
            session: RwLock::new(None),
            channel: RwLock::new(None),
        }
    }

    pub(crate) fn session(&self) -> Option<Arc<dyn SessionDelegate>> {
        self.session.read().clone()
    }

    pub(crate) fn channel(&self) -> Option<Arc<dyn ChannelDelegate>> {
        self.channel.read().clone()
    }

    pub(crate) fn set_session(&self, delegate: Option<Arc<dyn SessionDelegate>>) {
        *self.session.write() = delegate;
    }

    pub(crate) fn set_channel(&self, delegate: Option<Arc<dyn ChannelDelegate>>) {
        *self.channel.write() = delegate;
    }

    pub(crate) fn clear(&self) {
        self.set_session(None);
        self.set_channel(None);
    }
}

impl TrafficObserver for Delegates {
    fn sent(&self, bytes: usize) {
        if let Some(delegate) = self.session() {
            delegate.send(bytes);
        }
    }

    fn received(&self, bytes: usize) {
        if let Some(delegate) = self.session() {
            delegate.recv(bytes);
        }
    }
}

/// Callbacks a backend invokes from inside a library call.
///
/// A disconnect only marks the session; the teardown it implies runs after
/// the current serialized call has released the handle.
#[derive(Clone)]
pub struct SessionHooks {
    inner: Arc<HookState>,
}

struct HookState {
    session_id: String,
    delegates: Arc<Delegates>,
    disconnected: AtomicBool,
}

impl SessionHooks {
    pub(crate) fn new(session_id: String, delegates: Arc<Delegates>) -> Self {
        Self {
            inner: Arc::new(HookState {
                session_id,
                delegates,
                disconnected: AtomicBool::new(false),
            }),
        }
    }

    /// The peer or the library dropped the connection.
    pub fn disconnect(&self, reason: i32, message: &str) {
        warn!(
            "Session {} disconnected (reason {}): {}",
            self.inner.session_id, reason, message
        );
        self.inner.disconnected.store(true, Ordering::SeqCst);
        if let Some(delegate) = self.inner.delegates.session() {
            delegate.disconnect(message);
        }
    }

    pub fn debug(&self, always_display: bool, message: &str) {
        debug!(
            "Session {} server debug (display={}): {}",
            self.inner.session_id, always_display, message
        );
        if let Some(delegate) = self.inner.delegates.session() {
            delegate.debug(message);
        }
    }

    pub fn trace(&self, message: &str) {
        trace!("Session {}: {}", self.inner.session_id, message);
        if let Some(delegate) = self.inner.delegates.session() {
            delegate.trace(message);
        }
    }

    /// Consume a pending disconnect mark.
    pub(crate) fn take_disconnect(&self) -> bool {
        self.inner.disconnected.swap(false, Ordering::SeqCst)
    }
}
