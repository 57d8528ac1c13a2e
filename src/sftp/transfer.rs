//! SFTP uploads and downloads
//!
//! Each transfer opens its own SFTP handle and file, copies in
//! `buffer_size` chunks and releases both when done. Progress callbacks get
//! the running byte count and may stop the transfer between chunks by
//! returning `false`; [`TransferControl`] packages that for callers that
//! want to cancel from elsewhere.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::types::{FilePermissions, TransferDirection};
use crate::ssh::backend::Backend;
use crate::ssh::{Session, SessionInner, SshError};
use crate::stream::adapters::{SftpSink, SftpSource};
use crate::stream::{copy, ReaderSource, WriterSink};

/// Cancellation flag and byte counter shared with a running transfer.
#[derive(Debug, Clone, Default)]
pub struct TransferControl {
    cancelled: Arc<AtomicBool>,
    transferred: Arc<AtomicU64>,
}

impl TransferControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Bytes moved so far.
    pub fn transferred(&self) -> u64 {
        self.transferred.load(Ordering::SeqCst)
    }

    /// Progress callback that records the count and stops once cancelled.
    pub fn progress(&self) -> impl FnMut(u64) -> bool + Send + 'static {
        let control = self.clone();
        move |total| {
            control.transferred.store(total, Ordering::SeqCst);
            !control.is_cancelled()
        }
    }
}

impl<B: Backend> SessionInner<B> {
    pub(crate) fn sftp_upload(
        &self,
        reader: &mut dyn Read,
        remote: &Path,
        permissions: FilePermissions,
        progress: &mut dyn FnMut(u64) -> bool,
    ) -> Result<u64, SshError> {
        let mut source = ReaderSource::new(reader);
        let mut sink = SftpSink::new(self, remote, permissions.mode() as i32);
        let sent = copy(&mut source, &mut sink, self.config.buffer_size, progress)?;
        self.log_transfer(TransferDirection::Upload, remote, sent);
        Ok(sent)
    }

    pub(crate) fn sftp_download(
        &self,
        remote: &Path,
        writer: &mut dyn Write,
        progress: &mut dyn FnMut(u64) -> bool,
    ) -> Result<u64, SshError> {
        let mut source = SftpSource::new(self, remote);
        let mut sink = WriterSink::new(writer);
        let mut cancelled = false;
        let received = copy(&mut source, &mut sink, self.config.buffer_size, |total| {
            let keep_going = progress(total);
            cancelled |= !keep_going;
            keep_going
        })?;
        if received < source.size() {
            if !cancelled {
                warn!(
                    "Session {} download of {} ended early at {}/{} bytes",
                    self.id,
                    remote.display(),
                    received,
                    source.size()
                );
                return Err(SshError::TransferAborted(format!(
                    "{}: received {} of {} bytes",
                    remote.display(),
                    received,
                    source.size()
                )));
            }
            debug!(
                "Session {} download of {} cancelled at {}/{} bytes",
                self.id,
                remote.display(),
                received,
                source.size()
            );
        }
        self.log_transfer(TransferDirection::Download, remote, received);
        Ok(received)
    }

    fn log_transfer(&self, direction: TransferDirection, remote: &Path, bytes: u64) {
        info!(
            "Session {} SFTP {:?} of {} finished: {} bytes",
            self.id,
            direction,
            remote.display(),
            bytes
        );
    }
}

fn local_permissions(file: &File) -> FilePermissions {
    use std::os::unix::fs::PermissionsExt;
    file.metadata()
        .map(|m| FilePermissions::from_mode(m.permissions().mode()))
        .unwrap_or_default()
}

impl<B: Backend> Session<B> {
    /// Write everything `reader` yields to `remote`, creating or truncating it.
    pub async fn upload<R, P>(
        &self,
        mut reader: R,
        remote: impl Into<PathBuf>,
        permissions: FilePermissions,
        mut progress: P,
    ) -> Result<u64, SshError>
    where
        R: Read + Send + 'static,
        P: FnMut(u64) -> bool + Send + 'static,
    {
        let remote = remote.into();
        self.run(move |s| s.sftp_upload(&mut reader, &remote, permissions, &mut progress))
            .await
    }

    /// Upload a local file, keeping its permission bits.
    pub async fn upload_file<P>(
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
            let permissions = local_permissions(&file);
            s.sftp_upload(&mut file, &remote, permissions, &mut progress)
        })
        .await
    }

    /// Read `remote` into `writer`, handing the writer back with the byte count.
    pub async fn download<W, P>(
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
            let received = s.sftp_download(&remote, &mut writer, &mut progress)?;
            Ok((received, writer))
        })
        .await
    }

    pub async fn download_file<P>(
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
            s.sftp_download(&remote, &mut file, &mut progress)
        })
        .await
    }
}
