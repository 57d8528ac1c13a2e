//! SCP transfers
//!
//! Uploads declare their size before any data is sent. Downloads are only
//! successful when every byte the server declared has arrived.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::ssh::backend::Backend;
use crate::ssh::{Session, SessionInner, SshError};
use crate::stream::adapters::{ScpSink, ScpSource};
use crate::stream::{copy, ReaderSource, WriterSink};

/// Mode used when the local file's permissions are unknown
pub const DEFAULT_SCP_MODE: i32 = 0o644;

impl<B: Backend> SessionInner<B> {
    pub(crate) fn scp_send(
        &self,
        reader: &mut dyn Read,
        size: u64,
        remote: &Path,
        mode: i32,
        progress: &mut dyn FnMut(u64) -> bool,
    ) -> Result<u64, SshError> {
        let mut source = ReaderSource::new(reader);
        let mut sink = ScpSink::new(self, remote, mode, size);
        let sent = copy(&mut source, &mut sink, self.config.buffer_size, progress)?;
        info!(
            "Session {} SCP sent {}/{} bytes to {}",
            self.id,
            sent,
            size,
            remote.display()
        );
        Ok(sent)
    }

    pub(crate) fn scp_recv(
        &self,
        remote: &Path,
        writer: &mut dyn Write,
        progress: &mut dyn FnMut(u64) -> bool,
    ) -> Result<u64, SshError> {
        let mut source = ScpSource::new(self, remote);
        let mut sink = WriterSink::new(writer);
        let received = copy(&mut source, &mut sink, self.config.buffer_size, progress)?;
        let declared = source.size();
        if received != declared {
            warn!(
                "Session {} SCP download of {} stopped at {}/{} bytes",
                self.id,
                remote.display(),
                received,
                declared
            );
            return Err(SshError::TransferAborted(format!(
                "{}: received {} of {} bytes",
                remote.display(),
                received,
                declared
            )));
        }
        info!(
            "Session {} SCP received {} bytes from {}",
            self.id,
            received,
            remote.display()
        );
        Ok(received)
    }
}

fn local_mode(file: &File) -> i32 {
    use std::os::unix::fs::PermissionsExt;
    file.metadata()
        .map(|m| (m.permissions().mode() & 0o777) as i32)
        .unwrap_or(DEFAULT_SCP_MODE)
}

impl<B: Backend> Session<B> {
    /// Upload `size` bytes from `reader` to `remote`.
    ///
    /// Returns the bytes sent; fewer than `size` when `progress` stopped the copy.
    pub async fn scp_send<R, P>(
        &self,
        mut reader: R,
        size: u64,
        remote: impl Into<PathBuf>,
        mode: i32,
        mut progress: P,
    ) -> Result<u64, SshError>
    where
        R: Read + Send + 'static,
        P: FnMut(u64) -> bool + Send + 'static,
    {
        let remote = remote.into();
        self.run(move |s| s.scp_send(&mut reader, size, &remote, mode, &mut progress))
            .await
    }

    /// Upload a local file, keeping its permission bits.
    pub async fn scp_send_file<P>(
        &self,
        local: impl Into<PathBuf>,
        remote: impl Into<PathBuf>,
        mut progress: P,
    ) -> Result<u64, SshError>
    where
        P: FnMut(u64) -> bool + Send + 'static,
    {
        let (local, remote) = (local.into(), remote.into());
        self.run(move |s| {
            let mut file = File::open(&local)?;
            let size = file.metadata()?.len();
            let mode = local_mode(&file);
            s.scp_send(&mut file, size, &remote, mode, &mut progress)
        })
        .await
    }

    /// Download `remote` into `writer`, handing the writer back with the byte count.
    pub async fn scp_recv<W, P>(
        &self,
        remote: impl Into<PathBuf>,
        mut writer: W,
        mut progress: P,
    ) -> Result<(u64, W), SshError>
    where
        W: Write + Send + 'static,
        P: FnMut(u64) -> bool + Send + 'static,
    {
        let remote = remote.into();
        self.run(move |s| {
            let received = s.scp_recv(&remote, &mut writer, &mut progress)?;
            Ok((received, writer))
        })
        .await
    }

    /// Download `remote` into a local file, created or truncated.
    pub async fn scp_recv_file<P>(
        &self,
        remote: impl Into<PathBuf>,
        local: impl Into<PathBuf>,
        mut progress: P,
    ) -> Result<u64, SshError>
    where
        P: FnMut(u64) -> bool + Send + 'static,
    {
        let (remote, local) = (remote.into(), local.into());
        self.run(move |s| {
            let mut file = File::create(&local)?;
            s.scp_recv(&remote, &mut file, &mut progress)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::backend::scripted::{authenticated, Script};
    use std::io::Cursor;

    fn script_with_file(path: &str, content: &[u8]) -> Script {
        let mut script = Script::default();
        script.files.insert(path.to_string(), content.to_vec());
        script
    }

    #[tokio::test]
    async fn test_scp_recv_into_memory() {
        let h = authenticated(script_with_file("/etc/motd", b"hello from scp\n")).await;

        let (n, out) = h
            .session
            .scp_recv("/etc/motd", Vec::new(), |_| true)
            .await
            .unwrap();
        assert_eq!(n, 15);
        assert_eq!(out, b"hello from scp\n");
        assert_eq!(h.state.called("send_eof"), 1);
    }

    #[tokio::test]
    async fn test_scp_recv_detects_truncation() {
        let mut script = script_with_file("/var/log/big.log", b"only part");
        script.scp_declared_size = Some(1024);
        let h = authenticated(script).await;

        let err = h
            .session
            .scp_recv("/var/log/big.log", Vec::new(), |_| true)
            .await
            .unwrap_err();
        assert!(matches!(err, SshError::TransferAborted(_)));
    }

    #[tokio::test]
    async fn test_scp_recv_cancelled_is_an_error() {
        let h = authenticated(script_with_file("/data.bin", &[7u8; 50_000])).await;
        let err = h
            .session
            .scp_recv("/data.bin", Vec::new(), |n| n < 0x4000)
            .await
            .unwrap_err();
        assert!(matches!(err, SshError::TransferAborted(_)));
    }

    #[tokio::test]
    async fn test_scp_send_from_reader() {
        let h = authenticated(Script::default()).await;
        let data = b"#!/bin/sh\necho hi\n".to_vec();

        let sent = h
            .session
            .scp_send(Cursor::new(data.clone()), data.len() as u64, "/tmp/hi.sh", 0o755, |_| true)
            .await
            .unwrap();
        assert_eq!(sent, data.len() as u64);
        assert_eq!(h.state.called("scp_send:/tmp/hi.sh:755:18"), 1);
        assert_eq!(h.state.script().files["/tmp/hi.sh"], data);
    }

    #[tokio::test]
    async fn test_scp_send_progress_cancel_returns_count() {
        let h = authenticated(Script::default()).await;
        let data = vec![1u8; 0x4000 * 3];

        let sent = h
            .session
            .scp_send(Cursor::new(data), 0x4000 * 3, "/tmp/blob", 0o600, |n| n < 0x4000)
            .await
            .unwrap();
        assert_eq!(sent, 0x4000);
    }

    #[tokio::test]
    async fn test_scp_file_round_trip() {
        let h = authenticated(Script::default()).await;
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("notes.txt");
        std::fs::write(&local, b"line one\nline two\n").unwrap();

        let sent = h
            .session
            .scp_send_file(&local, "/home/tester/notes.txt", |_| true)
            .await
            .unwrap();
        assert_eq!(sent, 18);

        let copy_path = dir.path().join("copy.txt");
        let received = h
            .session
            .scp_recv_file("/home/tester/notes.txt", &copy_path, |_| true)
            .await
            .unwrap();
        assert_eq!(received, 18);
        assert_eq!(std::fs::read(&copy_path).unwrap(), b"line one\nline two\n");
    }
}
