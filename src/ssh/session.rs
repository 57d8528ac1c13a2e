//! SSH Session management
//!
//! [`Session`] is a cheap, cloneable handle on one SSH connection. All
//! protocol work happens on tokio's blocking pool: the async methods move
//! into `spawn_blocking`, enter the call serializer and drive the backend,
//! waiting on socket readiness whenever the library would block.

use std::net::Shutdown;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::backend::{Backend, Connector, Libssh2Connector, Libssh2Session};
use super::call::{retry, Handles};
use super::config::SshConfig;
use super::delegate::{ChannelDelegate, Delegates, SessionDelegate, SessionHooks};
use super::error::{ProtocolError, SshError};
use super::fingerprint::{fingerprint, ShaAlgorithm};
use super::serializer::CallSerializer;
use super::transport::{probe_banner, TrafficObserver, Transport};
use super::types::{trace_mask, HostKey, MethodType, SessionState};
use crate::channel::shell::ShellPoller;

/// Shared state behind a [`Session`].
pub(crate) struct SessionInner<B: Backend> {
    pub(crate) id: String,
    pub(crate) config: SshConfig,
    connector: Box<dyn Connector<B>>,
    pub(crate) serializer: CallSerializer<Handles<B>>,
    transport: RwLock<Option<Arc<Transport>>>,
    pub(crate) delegates: Arc<Delegates>,
    hooks: SessionHooks,
    state: Mutex<SessionState>,
    last_error: Mutex<Option<String>>,
    pub(crate) keepalive: Mutex<Option<CancellationToken>>,
    pub(crate) poller: Mutex<Option<ShellPoller>>,
    pub(crate) poll_paused: Arc<AtomicBool>,
    pub(crate) weak_self: Weak<SessionInner<B>>,
}

impl<B: Backend> SessionInner<B> {
    fn new(config: SshConfig, connector: Box<dyn Connector<B>>) -> Arc<Self> {
        let id = Uuid::new_v4().to_string();
        let delegates = Arc::new(Delegates::new());
        let hooks = SessionHooks::new(id.clone(), delegates.clone());
        let timeout = config.timeout();
        Arc::new_cyclic(|weak_self| Self {
            id,
            config,
            connector,
            serializer: CallSerializer::new(Handles::new(timeout)),
            transport: RwLock::new(None),
            delegates,
            hooks,
            state: Mutex::new(SessionState::Uninitialized),
            last_error: Mutex::new(None),
            keepalive: Mutex::new(None),
            poller: Mutex::new(None),
            poll_paused: Arc::new(AtomicBool::new(false)),
            weak_self: weak_self.clone(),
        })
    }

    pub(crate) fn transport(&self) -> Option<Arc<Transport>> {
        self.transport.read().clone()
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.transport().is_some_and(|t| t.is_connected())
    }

    pub(crate) fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: SessionState) {
        let mut current = self.state.lock();
        if *current != state {
            debug!("Session {} state {:?} -> {:?}", self.id, *current, state);
            *current = state;
        }
    }

    pub(crate) fn record_error(&self, err: &ProtocolError) {
        *self.last_error.lock() = Some(err.to_string());
    }

    pub(crate) fn record_message(&self, message: String) {
        *self.last_error.lock() = Some(message);
    }

    /// Run `body` with the handles locked, then honour a disconnect reported during it.
    pub(crate) fn exclusive<T>(&self, body: impl FnOnce(&mut Handles<B>) -> T) -> T {
        let out = self.serializer.with_exclusive_access(body);
        self.after_call();
        out
    }

    /// Serialized, retrying library call.
    pub(crate) fn call<T>(
        &self,
        wait: bool,
        op: impl FnMut(&mut Handles<B>) -> Result<T, ProtocolError>,
    ) -> Result<T, ProtocolError> {
        let result = self.exclusive(|h| retry(h, wait, op));
        if let Err(err) = &result {
            if !err.is_would_block() {
                self.record_error(err);
            }
        }
        result
    }

    fn after_call(&self) {
        if self.hooks.take_disconnect() {
            warn!("Session {} lost its connection, tearing down", self.id);
            self.free();
        }
    }

    /// Current handle generation, if a session handle exists.
    pub(crate) fn generation(&self) -> Option<u64> {
        self.serializer
            .with_exclusive_access(|h| h.session.as_ref().map(|_| h.generation))
    }

    /// Bind a connected transport, dropping any handle tied to the previous one.
    pub(crate) fn attach(&self, transport: Transport) {
        self.free();
        let transport = Arc::new(transport);
        if let Some(old) = self.transport.write().replace(transport.clone()) {
            old.shutdown(Shutdown::Both);
        }
        self.serializer
            .with_exclusive_access(|h| h.socket = Some(transport.clone()));
        self.set_state(SessionState::Connected);
        info!(
            "Session {} connected to {}",
            self.id,
            self.config.address()
        );
    }

    pub(crate) fn handshake(&self) -> Result<(), SshError> {
        let transport = self.transport().ok_or(SshError::NotConnected)?;
        if self.serializer.with_exclusive_access(|h| h.session.is_some()) {
            self.free();
        }
        self.set_state(SessionState::Handshaking);
        self.hooks.take_disconnect();

        let backend = match self
            .connector
            .open(&transport, &self.config, self.hooks.clone())
        {
            Ok(backend) => backend,
            Err(err) => {
                self.record_error(&err);
                self.set_state(SessionState::Connected);
                return Err(SshError::HandshakeFailed(err.to_string()));
            }
        };

        let config = &self.config;
        let timeout = config.timeout();
        let result = self.exclusive(|h| {
            h.session = Some(backend);
            h.socket = Some(transport.clone());
            h.timeout = timeout;
            h.generation += 1;

            let session = h.session_mut()?;
            for (method, prefs) in &config.methods {
                if let Err(e) = session.set_method_pref(*method, prefs) {
                    warn!("Ignoring {:?} preference {:?}: {}", method, prefs, e);
                }
            }
            session.set_compress(config.compress);
            session.set_allow_sigpipe(false);
            session.set_timeout(timeout);
            session.set_banner(&config.client_banner())?;
            session.set_trace(trace_mask(&config.trace));
            session.set_blocking(config.blocking);

            retry(h, true, |h| h.session_mut()?.handshake())?;
            Ok::<_, ProtocolError>(h.session.as_ref().and_then(|s| s.host_key()))
        });

        let host_key = match result {
            Ok(Some((kind, data))) => HostKey::new(kind, data, config.fingerprint_algorithm),
            Ok(None) => {
                self.record_message("server presented no host key".to_string());
                self.free_session();
                return Err(SshError::HandshakeFailed(
                    "server presented no host key".to_string(),
                ));
            }
            Err(err) => {
                warn!("Session {} handshake failed: {}", self.id, err);
                self.record_error(&err);
                self.free_session();
                return Err(SshError::HandshakeFailed(err.to_string()));
            }
        };

        let accepted = self
            .delegates
            .session()
            .is_some_and(|delegate| delegate.handshake(&host_key));
        if !accepted {
            warn!(
                "Session {} rejected {} host key {}",
                self.id,
                host_key.kind.name(),
                host_key.fingerprint
            );
            self.record_message(format!("host key {} rejected", host_key.fingerprint));
            self.free_session();
            return Err(SshError::HostKeyRejected(host_key.fingerprint));
        }

        self.set_state(SessionState::Established);
        info!(
            "Session {} handshake with {} complete, {} host key {}",
            self.id,
            config.address(),
            host_key.kind.name(),
            host_key.fingerprint
        );
        Ok(())
    }

    pub(crate) fn host_key(&self) -> Option<HostKey> {
        self.exclusive(|h| h.session.as_ref().and_then(|s| s.host_key()))
            .map(|(kind, data)| HostKey::new(kind, data, self.config.fingerprint_algorithm))
    }

    pub(crate) fn methods(&self, method: MethodType) -> Option<String> {
        self.exclusive(|h| h.session.as_ref().and_then(|s| s.methods(method)))
    }

    pub(crate) fn server_banner(&self) -> Option<String> {
        self.exclusive(|h| h.session.as_ref().and_then(|s| s.remote_banner()))
    }

    pub(crate) fn is_compressed(&self) -> bool {
        let zlib = |method| {
            self.methods(method)
                .is_some_and(|name| name.starts_with("zlib"))
        };
        zlib(MethodType::CompCs) && zlib(MethodType::CompSc)
    }

    pub(crate) fn is_blocking(&self) -> bool {
        self.exclusive(|h| h.session.as_ref().is_some_and(|s| s.is_blocking()))
    }

    pub(crate) fn set_blocking(&self, blocking: bool) -> Result<(), SshError> {
        self.exclusive(|h| {
            h.session_mut()?.set_blocking(blocking);
            Ok::<_, ProtocolError>(())
        })?;
        Ok(())
    }

    pub(crate) fn last_error(&self) -> Option<String> {
        self.exclusive(|h| h.session.as_ref().and_then(|s| s.last_error()))
            .map(|e| e.to_string())
            .or_else(|| self.last_error.lock().clone())
    }

    /// Polite disconnect and free of the session handle, children first. Idempotent.
    pub(crate) fn free_session(&self) {
        self.cancel_keepalive();
        let poller_stopped = self.stop_poller();
        let connected = self.is_connected();

        let (freed, had_channel) = self.serializer.with_exclusive_access(|h| {
            let Some(session) = h.session.as_mut() else {
                return (false, false);
            };
            self.set_state(SessionState::ClosingDown);
            session.set_blocking(false);
            let had_channel = h.channel.take().is_some();
            h.sftp = None;
            if connected {
                if let Err(e) = retry(h, false, |h| h.session_mut()?.disconnect("Bye-Bye")) {
                    debug!("Session {} disconnect message not sent: {}", self.id, e);
                }
            }
            h.session = None;
            h.generation += 1;
            (true, had_channel)
        });

        if let Some(delegate) = self.delegates.channel() {
            if poller_stopped {
                delegate.connect(false);
            }
            if had_channel {
                delegate.disconnect();
            }
        }
        if freed {
            info!("Session {} freed", self.id);
        }
        self.set_state(SessionState::Closed);
    }

    /// Close the shell, free SFTP, then free the session.
    pub(crate) fn free(&self) {
        self.close_shell();
        self.free_sftp();
        self.free_session();
    }

    /// Tear everything down and release the transport.
    pub(crate) fn close(&self) {
        if let Some(transport) = self.transport() {
            transport.shutdown(Shutdown::Read);
        }
        self.stop_poller();
        self.serializer.wait_for_idle();
        self.delegates.clear();
        self.free();
        if let Some(transport) = self.transport.write().take() {
            transport.shutdown(Shutdown::Both);
        }
        self.serializer.with_exclusive_access(|h| h.socket = None);
        self.set_state(SessionState::Closed);
        info!("Session {} closed", self.id);
    }
}

impl<B: Backend> Drop for SessionInner<B> {
    fn drop(&mut self) {
        if let Some(token) = self.keepalive.get_mut().take() {
            token.cancel();
        }
        if let Some(poller) = self.poller.get_mut().take() {
            poller.cancel();
        }
        let connected = self
            .transport
            .get_mut()
            .as_ref()
            .is_some_and(|t| t.is_connected());
        let handles = self.serializer.get_mut();
        if let Some(session) = handles.session.as_mut() {
            session.set_blocking(false);
        }
        handles.channel = None;
        handles.sftp = None;
        if let Some(mut session) = handles.session.take() {
            if connected {
                let _ = session.disconnect("Bye-Bye");
            }
        }
        if let Some(transport) = self.transport.get_mut().take() {
            transport.shutdown(Shutdown::Both);
        }
        debug!("Session {} dropped", self.id);
    }
}

/// An SSH connection and its primary channel and SFTP handles.
pub struct Session<B: Backend = Libssh2Session> {
    pub(crate) inner: Arc<SessionInner<B>>,
}

impl<B: Backend> Clone for Session<B> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl Session<Libssh2Session> {
    /// Session backed by libssh2.
    pub fn new(config: SshConfig) -> Self {
        Self::with_connector(config, Libssh2Connector)
    }
}

impl<B: Backend> Session<B> {
    pub fn with_connector(config: SshConfig, connector: impl Connector<B>) -> Self {
        Self {
            inner: SessionInner::new(config, Box::new(connector)),
        }
    }

    /// Run a blocking body on the blocking pool.
    pub(crate) async fn run<T, F>(&self, body: F) -> Result<T, SshError>
    where
        F: FnOnce(&SessionInner<B>) -> Result<T, SshError> + Send + 'static,
        T: Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || body(&inner)).await?
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn config(&self) -> &SshConfig {
        &self.inner.config
    }

    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    pub fn set_session_delegate(&self, delegate: Arc<dyn SessionDelegate>) {
        self.inner.delegates.set_session(Some(delegate));
    }

    pub fn set_channel_delegate(&self, delegate: Arc<dyn ChannelDelegate>) {
        self.inner.delegates.set_channel(Some(delegate));
    }

    pub fn clear_delegates(&self) {
        self.inner.delegates.clear();
    }

    /// Connect to the configured host (through the proxy, if any).
    ///
    /// On failure any existing handle is left untouched.
    pub async fn connect(&self) -> Result<(), SshError> {
        let observer: Arc<dyn TrafficObserver> = self.inner.delegates.clone();
        info!(
            "Session {} connecting to {}",
            self.inner.id,
            self.inner.config.address()
        );
        match Transport::connect(&self.inner.config, Some(observer)).await {
            Ok(transport) => self.connect_with(transport).await,
            Err(e) => {
                warn!("Session {} connect failed: {}", self.inner.id, e);
                self.inner.record_message(e.to_string());
                Err(e)
            }
        }
    }

    /// Use an already connected transport.
    pub async fn connect_with(&self, transport: Transport) -> Result<(), SshError> {
        self.run(move |s| {
            s.attach(transport);
            Ok(())
        })
        .await
    }

    /// Create the protocol handle, handshake and verify the host key with the session delegate.
    pub async fn handshake(&self) -> Result<(), SshError> {
        self.run(|s| s.handshake()).await
    }

    /// Whether an SSH server answers at the configured address.
    pub async fn check_active(config: &SshConfig) -> bool {
        probe_banner(config).await
    }

    pub async fn host_key(&self) -> Option<HostKey> {
        self.run(|s| Ok(s.host_key())).await.ok().flatten()
    }

    /// Host key fingerprint in `ALGO:...` form.
    pub async fn fingerprint(&self, algorithm: ShaAlgorithm) -> Option<String> {
        self.host_key()
            .await
            .map(|key| fingerprint(algorithm, &key.data))
    }

    pub async fn server_banner(&self) -> Option<String> {
        self.run(|s| Ok(s.server_banner())).await.ok().flatten()
    }

    pub fn client_banner(&self) -> String {
        self.inner.config.client_banner()
    }

    /// Negotiated algorithm for a method category.
    pub async fn methods(&self, method: MethodType) -> Option<String> {
        self.run(move |s| Ok(s.methods(method))).await.ok().flatten()
    }

    pub async fn is_compressed(&self) -> bool {
        self.run(|s| Ok(s.is_compressed())).await.unwrap_or(false)
    }

    pub async fn is_blocking(&self) -> bool {
        self.run(|s| Ok(s.is_blocking())).await.unwrap_or(false)
    }

    pub async fn set_blocking(&self, blocking: bool) -> Result<(), SshError> {
        self.run(move |s| s.set_blocking(blocking)).await
    }

    pub async fn last_error(&self) -> Option<String> {
        self.run(|s| Ok(s.last_error())).await.ok().flatten()
    }

    pub fn bytes_sent(&self) -> u64 {
        self.inner.transport().map_or(0, |t| t.bytes_sent())
    }

    pub fn bytes_received(&self) -> u64 {
        self.inner.transport().map_or(0, |t| t.bytes_received())
    }

    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    /// Disconnect and free the session handle. Idempotent.
    pub async fn free_session(&self) {
        let _ = self
            .run(|s| {
                s.free_session();
                Ok(())
            })
            .await;
    }

    /// Close the shell, free SFTP and free the session. Idempotent.
    pub async fn free(&self) {
        let _ = self
            .run(|s| {
                s.free();
                Ok(())
            })
            .await;
    }

    /// Tear down everything, including the transport. Idempotent.
    pub async fn close(&self) {
        let _ = self
            .run(|s| {
                s.close();
                Ok(())
            })
            .await;
    }
}
