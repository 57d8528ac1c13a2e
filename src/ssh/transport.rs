//! Socket transport
//!
//! libssh2 drives a plain blocking-capable descriptor. We give it one end of
//! a local socket pair and relay the other end to the TCP connection (direct
//! or tunnelled through a proxy). The relay counts every byte in each
//! direction and reports chunks to an optional observer, which is how send
//! and receive notifications reach the session delegate.

use std::net::Shutdown;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::SshConfig;
use super::error::SshError;
use super::proxy::connect_via_proxy;

/// Relay chunk size
const RELAY_BUFFER: usize = 32 * 1024;

/// Receives per-chunk traffic notifications from the relay.
pub trait TrafficObserver: Send + Sync {
    fn sent(&self, bytes: usize);
    fn received(&self, bytes: usize);
}

#[derive(Debug, Default)]
struct Counters {
    sent: AtomicU64,
    received: AtomicU64,
}

/// Connected socket handed to the protocol library.
pub struct Transport {
    library_end: UnixStream,
    hostname: String,
    counters: Arc<Counters>,
    connected: Arc<AtomicBool>,
    relay: Option<CancellationToken>,
}

impl Transport {
    /// Connect to the configured host, directly or through the configured proxy.
    pub async fn connect(
        config: &SshConfig,
        observer: Option<Arc<dyn TrafficObserver>>,
    ) -> Result<Self, SshError> {
        let timeout = config.timeout();
        let stream = match &config.proxy {
            Some(proxy) => connect_via_proxy(proxy, &config.host, config.port, timeout).await?,
            None => connect_tcp(&config.host, config.port, timeout).await?,
        };
        Self::relay(stream, config.host.clone(), observer)
    }

    /// Wrap a connected TCP stream and start relaying it.
    ///
    /// Must be called from within a tokio runtime.
    pub fn relay(
        stream: TcpStream,
        hostname: String,
        observer: Option<Arc<dyn TrafficObserver>>,
    ) -> Result<Self, SshError> {
        let (library_end, relay_end) = UnixStream::pair()?;
        relay_end.set_nonblocking(true)?;
        let relay_end = tokio::net::UnixStream::from_std(relay_end)?;

        let counters = Arc::new(Counters::default());
        let connected = Arc::new(AtomicBool::new(true));
        let cancel = CancellationToken::new();

        tokio::spawn(run_relay(
            stream,
            relay_end,
            counters.clone(),
            connected.clone(),
            observer,
            cancel.clone(),
            hostname.clone(),
        ));

        Ok(Self {
            library_end,
            hostname,
            counters,
            connected,
            relay: Some(cancel),
        })
    }

    /// Use an already connected local stream as the library socket, with no relay.
    pub fn from_stream(stream: UnixStream, hostname: impl Into<String>) -> Self {
        Self {
            library_end: stream,
            hostname: hostname.into(),
            counters: Arc::new(Counters::default()),
            connected: Arc::new(AtomicBool::new(true)),
            relay: None,
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Descriptor polled by the readiness waiter.
    pub fn raw_fd(&self) -> RawFd {
        self.library_end.as_raw_fd()
    }

    /// A second handle on the library socket for the protocol library to own.
    pub fn library_stream(&self) -> std::io::Result<UnixStream> {
        self.library_end.try_clone()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.counters.sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.counters.received.load(Ordering::Relaxed)
    }

    /// Shut down one or both directions of the library socket.
    pub fn shutdown(&self, how: Shutdown) {
        if let Err(e) = self.library_end.shutdown(how) {
            debug!("Shutdown of transport to {} ({:?}): {}", self.hostname, how, e);
        }
        if how == Shutdown::Both {
            self.connected.store(false, Ordering::SeqCst);
            if let Some(relay) = &self.relay {
                relay.cancel();
            }
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        if let Some(relay) = &self.relay {
            relay.cancel();
        }
    }
}

/// TCP connect bounded by `timeout`.
pub async fn connect_tcp(host: &str, port: u16, timeout: Duration) -> Result<TcpStream, SshError> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
        .await
        .map_err(|_| SshError::Timeout(format!("connecting to {}:{}", host, port)))?
        .map_err(|e| SshError::ConnectionFailed(format!("{}:{}: {}", host, port, e)))?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

async fn run_relay(
    tcp: TcpStream,
    local: tokio::net::UnixStream,
    counters: Arc<Counters>,
    connected: Arc<AtomicBool>,
    observer: Option<Arc<dyn TrafficObserver>>,
    cancel: CancellationToken,
    hostname: String,
) {
    let (mut tcp_read, mut tcp_write) = tcp.into_split();
    let (mut local_read, mut local_write) = local.into_split();

    let outbound = async {
        let mut buf = vec![0u8; RELAY_BUFFER];
        loop {
            let n = match local_read.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            if let Err(e) = tcp_write.write_all(&buf[..n]).await {
                warn!("Relay write to {} failed: {}", hostname, e);
                break;
            }
            counters.sent.fetch_add(n as u64, Ordering::Relaxed);
            if let Some(observer) = &observer {
                observer.sent(n);
            }
        }
        let _ = tcp_write.shutdown().await;
    };

    let inbound = async {
        let mut buf = vec![0u8; RELAY_BUFFER];
        loop {
            let n = match tcp_read.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            if local_write.write_all(&buf[..n]).await.is_err() {
                break;
            }
            counters.received.fetch_add(n as u64, Ordering::Relaxed);
            if let Some(observer) = &observer {
                observer.received(n);
            }
        }
        let _ = local_write.shutdown().await;
    };

    tokio::select! {
        _ = cancel.cancelled() => {
            debug!("Relay for {} cancelled", hostname);
        }
        // Each direction runs until its own EOF, so a half-close still
        // delivers whatever the other side sends back
        _ = async { tokio::join!(outbound, inbound) } => {}
    }

    connected.store(false, Ordering::SeqCst);
    info!(
        "Relay for {} stopped (sent {} bytes, received {} bytes)",
        hostname,
        counters.sent.load(Ordering::Relaxed),
        counters.received.load(Ordering::Relaxed)
    );
}

/// Check that something speaking SSH listens at the configured address.
///
/// Sends the client banner and expects the reply to start with `SSH-`.
pub async fn probe_banner(config: &SshConfig) -> bool {
    let timeout = config.timeout();
    let probe = async {
        let mut stream = match &config.proxy {
            Some(proxy) => connect_via_proxy(proxy, &config.host, config.port, timeout).await?,
            None => connect_tcp(&config.host, config.port, timeout).await?,
        };
        stream
            .write_all(format!("{}\r\n", config.client_banner()).as_bytes())
            .await?;
        let mut reply = [0u8; 4];
        stream.read_exact(&mut reply).await?;
        Ok::<_, SshError>(&reply == b"SSH-")
    };

    match tokio::time::timeout(timeout, probe).await {
        Ok(Ok(active)) => active,
        Ok(Err(e)) => {
            debug!("Probe of {} failed: {}", config.address(), e);
            false
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::sync::atomic::AtomicUsize;
    use tokio::net::TcpListener;

    #[derive(Default)]
    struct Recorder {
        sent: AtomicUsize,
        received: AtomicUsize,
    }

    impl TrafficObserver for Recorder {
        fn sent(&self, bytes: usize) {
            self.sent.fetch_add(bytes, Ordering::SeqCst);
        }

        fn received(&self, bytes: usize) {
            self.received.fetch_add(bytes, Ordering::SeqCst);
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_relay_counts_both_directions() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            socket.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"hello");
            socket.write_all(b"world!").await.unwrap();
        });

        let recorder = Arc::new(Recorder::default());
        let tcp = connect_tcp("127.0.0.1", addr.port(), Duration::from_secs(5))
            .await
            .unwrap();
        let transport =
            Transport::relay(tcp, "127.0.0.1".into(), Some(recorder.clone())).unwrap();

        let mut library = transport.library_stream().unwrap();
        let reply = tokio::task::spawn_blocking(move || {
            library.write_all(b"hello").unwrap();
            let mut buf = [0u8; 6];
            library.read_exact(&mut buf).unwrap();
            buf
        })
        .await
        .unwrap();
        assert_eq!(&reply, b"world!");
        server.await.unwrap();

        // Counters are bumped after each relayed write completes
        for _ in 0..100 {
            if transport.bytes_sent() == 5 && transport.bytes_received() == 6 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(transport.bytes_sent(), 5);
        assert_eq!(transport.bytes_received(), 6);
        assert_eq!(recorder.sent.load(Ordering::SeqCst), 5);
        assert_eq!(recorder.received.load(Ordering::SeqCst), 6);

        transport.shutdown(Shutdown::Both);
        assert!(!transport.is_connected());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_relay_keeps_reading_after_half_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            socket.read_to_end(&mut request).await.unwrap();
            assert_eq!(request, b"last request");
            socket.write_all(b"final reply").await.unwrap();
        });

        let tcp = connect_tcp("127.0.0.1", addr.port(), Duration::from_secs(5))
            .await
            .unwrap();
        let transport = Transport::relay(tcp, "127.0.0.1".into(), None).unwrap();
        let mut library = transport.library_stream().unwrap();
        library.write_all(b"last request").unwrap();
        transport.shutdown(Shutdown::Write);

        let reply = tokio::task::spawn_blocking(move || {
            let mut buf = Vec::new();
            library.read_to_end(&mut buf).unwrap();
            buf
        })
        .await
        .unwrap();
        server.await.unwrap();
        assert_eq!(reply, b"final reply");
        assert_eq!(transport.bytes_received(), 11);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config = SshConfig::new("127.0.0.1", port, "nobody");
        let err = Transport::connect(&config, None).await.err().unwrap();
        assert!(matches!(
            err,
            SshError::ConnectionFailed(_) | SshError::Timeout(_)
        ));
    }

    #[tokio::test]
    async fn test_probe_banner() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"SSH-2.0-OpenSSH_9.6\r\n").await.unwrap();
            let mut buf = [0u8; 64];
            let _ = socket.read(&mut buf).await;
        });

        let config = SshConfig::new("127.0.0.1", port, "nobody");
        assert!(probe_banner(&config).await);
    }

    #[tokio::test]
    async fn test_probe_rejects_non_ssh() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"HTTP/1.1 400 Bad Request\r\n").await.unwrap();
        });

        let config = SshConfig::new("127.0.0.1", port, "nobody");
        assert!(!probe_banner(&config).await);
    }

    #[test]
    fn test_from_stream_shutdown() {
        let (ours, _theirs) = UnixStream::pair().unwrap();
        let transport = Transport::from_stream(ours, "local");
        assert!(transport.is_connected());
        assert!(transport.raw_fd() >= 0);
        transport.shutdown(Shutdown::Read);
        assert!(transport.is_connected());
        transport.shutdown(Shutdown::Both);
        assert!(!transport.is_connected());
    }
}
