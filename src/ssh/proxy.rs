//! Proxy traversal before the SSH handshake
//!
//! Supports HTTP CONNECT tunnels and SOCKS5 (RFC 1928) with optional
//! username/password sub-negotiation (RFC 1929). Both run on the raw TCP
//! stream and leave it positioned at the first byte of the tunnelled
//! connection.

use std::net::IpAddr;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info};

use super::config::ProxyConfig;

/// SOCKS5 protocol constants
mod socks5 {
    pub const VERSION: u8 = 0x05;
    pub const AUTH_NONE: u8 = 0x00;
    pub const AUTH_PASSWORD: u8 = 0x02;
    pub const AUTH_PASSWORD_VERSION: u8 = 0x01;
    pub const AUTH_PASSWORD_SUCCESS: u8 = 0x00;
    pub const CMD_CONNECT: u8 = 0x01;
    pub const ATYP_IPV4: u8 = 0x01;
    pub const ATYP_DOMAIN: u8 = 0x03;
    pub const ATYP_IPV6: u8 = 0x04;
    pub const REP_SUCCESS: u8 = 0x00;
}

/// Longest HTTP response head we accept from a proxy.
const MAX_HTTP_HEAD: usize = 8192;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Proxy I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Proxy did not answer within {0:?}")]
    Timeout(Duration),

    #[error("HTTP CONNECT rejected: {0}")]
    HttpRejected(String),

    #[error("SOCKS5 protocol violation: {0}")]
    Socks5Protocol(String),

    #[error("SOCKS5 proxy accepted none of the offered authentication methods")]
    Socks5NoAcceptableMethod,

    #[error("SOCKS5 authentication rejected (status {0:#04x})")]
    Socks5AuthRejected(u8),

    #[error("SOCKS5 connect failed: {0}")]
    Socks5ConnectFailed(&'static str),
}

/// Connect to `proxy` and open a tunnel to `host:port` through it.
pub async fn connect_via_proxy(
    proxy: &ProxyConfig,
    host: &str,
    port: u16,
    timeout: Duration,
) -> Result<TcpStream, ProxyError> {
    let tunnel = async {
        let mut stream = TcpStream::connect((proxy.host(), proxy.port())).await?;
        stream.set_nodelay(true)?;
        match proxy {
            ProxyConfig::Http { .. } => {
                http_connect(&mut stream, host, port, proxy.credentials()).await?
            }
            ProxyConfig::Socks5 { .. } => {
                socks5_connect(&mut stream, host, port, proxy.credentials()).await?
            }
        }
        Ok::<_, ProxyError>(stream)
    };

    let stream = tokio::time::timeout(timeout, tunnel)
        .await
        .map_err(|_| ProxyError::Timeout(timeout))??;
    info!(
        "Tunnel to {}:{} established via proxy {}:{}",
        host,
        port,
        proxy.host(),
        proxy.port()
    );
    Ok(stream)
}

fn authority(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Issue `CONNECT host:port` and require a 200 status line.
pub async fn http_connect<S>(
    stream: &mut S,
    host: &str,
    port: u16,
    credentials: Option<(&str, &str)>,
) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let target = authority(host, port);
    let mut request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n");
    if let Some((user, pass)) = credentials {
        let token = STANDARD.encode(format!("{}:{}", user, pass));
        request.push_str(&format!("Proxy-Authorization: Basic {}\r\n", token));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let head = read_http_head(stream).await?;
    let status_line = head.lines().next().unwrap_or_default();
    let status = status_line.split_whitespace().nth(1);
    if status != Some("200") {
        return Err(ProxyError::HttpRejected(status_line.to_string()));
    }
    debug!("HTTP CONNECT to {} accepted: {}", target, status_line);
    Ok(())
}

/// Read the response head byte by byte so no tunnelled data is consumed.
async fn read_http_head<S>(stream: &mut S) -> Result<String, ProxyError>
where
    S: AsyncRead + Unpin,
{
    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_HTTP_HEAD {
            return Err(ProxyError::HttpRejected("response head too large".into()));
        }
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(ProxyError::HttpRejected(
                "proxy closed the connection".into(),
            ));
        }
        head.push(byte[0]);
    }
    Ok(String::from_utf8_lossy(&head).into_owned())
}

/// Run the SOCKS5 greeting, optional password auth and CONNECT request.
pub async fn socks5_connect<S>(
    stream: &mut S,
    host: &str,
    port: u16,
    credentials: Option<(&str, &str)>,
) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Phase 1: method negotiation
    let method = if credentials.is_some() {
        socks5::AUTH_PASSWORD
    } else {
        socks5::AUTH_NONE
    };
    stream.write_all(&[socks5::VERSION, 1, method]).await?;

    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;
    if reply[0] != socks5::VERSION {
        return Err(ProxyError::Socks5Protocol(format!(
            "unexpected version {} in method reply",
            reply[0]
        )));
    }
    match (reply[1], credentials) {
        (socks5::AUTH_NONE, _) => {}
        (socks5::AUTH_PASSWORD, Some((user, pass))) => {
            socks5_password_auth(stream, user, pass).await?
        }
        _ => return Err(ProxyError::Socks5NoAcceptableMethod),
    }

    // Phase 2: connect request
    let mut request = vec![socks5::VERSION, socks5::CMD_CONNECT, 0x00];
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            request.push(socks5::ATYP_IPV4);
            request.extend_from_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) => {
            request.push(socks5::ATYP_IPV6);
            request.extend_from_slice(&ip.octets());
        }
        Err(_) => {
            let len = u8::try_from(host.len()).map_err(|_| {
                ProxyError::Socks5Protocol(format!("host name too long: {} bytes", host.len()))
            })?;
            request.push(socks5::ATYP_DOMAIN);
            request.push(len);
            request.extend_from_slice(host.as_bytes());
        }
    }
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[0] != socks5::VERSION {
        return Err(ProxyError::Socks5Protocol(format!(
            "unexpected version {} in connect reply",
            head[0]
        )));
    }
    if head[1] != socks5::REP_SUCCESS {
        return Err(ProxyError::Socks5ConnectFailed(reply_message(head[1])));
    }

    // Skip the bound address
    let remaining = match head[3] {
        socks5::ATYP_IPV4 => 4 + 2,
        socks5::ATYP_IPV6 => 16 + 2,
        socks5::ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize + 2
        }
        other => {
            return Err(ProxyError::Socks5Protocol(format!(
                "unknown address type {} in connect reply",
                other
            )))
        }
    };
    let mut bound = vec![0u8; remaining];
    stream.read_exact(&mut bound).await?;

    debug!("SOCKS5 CONNECT to {} accepted", authority(host, port));
    Ok(())
}

async fn socks5_password_auth<S>(stream: &mut S, user: &str, pass: &str) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let user_len = u8::try_from(user.len())
        .map_err(|_| ProxyError::Socks5Protocol("username longer than 255 bytes".into()))?;
    let pass_len = u8::try_from(pass.len())
        .map_err(|_| ProxyError::Socks5Protocol("password longer than 255 bytes".into()))?;

    let mut request = Vec::with_capacity(3 + user.len() + pass.len());
    request.push(socks5::AUTH_PASSWORD_VERSION);
    request.push(user_len);
    request.extend_from_slice(user.as_bytes());
    request.push(pass_len);
    request.extend_from_slice(pass.as_bytes());
    stream.write_all(&request).await?;

    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;
    if reply[1] != socks5::AUTH_PASSWORD_SUCCESS {
        return Err(ProxyError::Socks5AuthRejected(reply[1]));
    }
    Ok(())
}

fn reply_message(code: u8) -> &'static str {
    match code {
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown reply code",
    }
}
