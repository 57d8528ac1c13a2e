//! SFTP subsystem on a session
//!
//! The session keeps one primary SFTP handle, opened with
//! [`Session::open_sftp`] and released with [`Session::free_sftp`] or when
//! the session is freed. File operations below go through it; transfers open
//! their own handle (see [`super::transfer`]).

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::types::{FileInfo, FilePermissions, Statvfs};
use crate::ssh::backend::{Backend, FileBackend, OpenMode, SftpAttributes, SftpBackend};
use crate::ssh::{ProtocolError, Session, SessionInner, SshError};

impl<B: Backend> SessionInner<B> {
    /// Start a fresh SFTP subsystem, freeing any handle opened before.
    pub(crate) fn open_sftp(&self) -> Result<(), SshError> {
        let mut replaced = false;
        self.call(true, |h| {
            replaced |= h.sftp.take().is_some();
            let sftp = h.session_mut()?.sftp_init()?;
            h.sftp = Some(sftp);
            Ok(())
        })?;
        if replaced {
            info!("Session {} SFTP subsystem reopened", self.id);
        } else {
            info!("Session {} SFTP subsystem opened", self.id);
        }
        Ok(())
    }

    /// Release the primary SFTP handle. Safe to call repeatedly.
    pub(crate) fn free_sftp(&self) {
        let freed = self.exclusive(|h| h.sftp.take().is_some());
        if freed {
            debug!("Session {} SFTP subsystem freed", self.id);
        }
    }

    pub(crate) fn has_sftp(&self) -> bool {
        self.serializer.with_exclusive_access(|h| h.sftp.is_some())
    }

    fn sftp_call<T>(
        &self,
        mut op: impl FnMut(&mut B::Sftp) -> Result<T, ProtocolError>,
    ) -> Result<T, SshError> {
        Ok(self.call(true, |h| op(h.sftp_mut()?))?)
    }

    pub(crate) fn sftp_stat(&self, path: &Path) -> Result<FileInfo, SshError> {
        let attrs = self.sftp_call(|s| s.stat(path))?;
        Ok(FileInfo::from_attributes("", &attrs))
    }

    pub(crate) fn sftp_mkdir(&self, path: &Path, permissions: FilePermissions) -> Result<(), SshError> {
        info!("Session {} creating directory: {}", self.id, path.display());
        self.sftp_call(|s| s.mkdir(path, permissions.mode() as i32))
    }

    /// Create an empty file, truncating an existing one.
    pub(crate) fn sftp_mkfile(&self, path: &Path, permissions: FilePermissions) -> Result<(), SshError> {
        let file = self.sftp_call(|s| s.open_file(path, OpenMode::Write, permissions.mode() as i32))?;
        self.exclusive(|_| drop(file));
        Ok(())
    }

    pub(crate) fn sftp_rmdir(&self, path: &Path) -> Result<(), SshError> {
        info!("Session {} removing directory: {}", self.id, path.display());
        self.sftp_call(|s| s.rmdir(path))
    }

    pub(crate) fn sftp_rename(&self, src: &Path, dst: &Path) -> Result<(), SshError> {
        info!(
            "Session {} renaming {} to {}",
            self.id,
            src.display(),
            dst.display()
        );
        self.sftp_call(|s| s.rename(src, dst))
    }

    pub(crate) fn sftp_unlink(&self, path: &Path) -> Result<(), SshError> {
        info!("Session {} deleting: {}", self.id, path.display());
        self.sftp_call(|s| s.unlink(path))
    }

    pub(crate) fn sftp_symlink(&self, path: &Path, target: &Path) -> Result<(), SshError> {
        self.sftp_call(|s| s.symlink(path, target))
    }

    pub(crate) fn sftp_readlink(&self, path: &Path) -> Result<String, SshError> {
        self.sftp_call(|s| s.readlink(path))
    }

    pub(crate) fn sftp_realpath(&self, path: &Path) -> Result<String, SshError> {
        self.sftp_call(|s| s.realpath(path))
    }

    pub(crate) fn sftp_chown(&self, path: &Path, uid: u32, gid: u32) -> Result<(), SshError> {
        let attrs = SftpAttributes {
            uid: Some(uid),
            gid: Some(gid),
            ..SftpAttributes::default()
        };
        self.sftp_call(|s| s.setstat(path, attrs.clone()))
    }

    pub(crate) fn sftp_chmod(&self, path: &Path, permissions: FilePermissions) -> Result<(), SshError> {
        let attrs = SftpAttributes {
            perm: Some(permissions.mode()),
            ..SftpAttributes::default()
        };
        self.sftp_call(|s| s.setstat(path, attrs.clone()))
    }

    pub(crate) fn sftp_statvfs(&self, path: &Path) -> Result<Statvfs, SshError> {
        self.sftp_call(|s| s.statvfs(path))
    }

    /// Entries of a remote directory, without the configured ignored names.
    pub(crate) fn sftp_list_dir(&self, path: &Path) -> Result<Vec<FileInfo>, SshError> {
        debug!("Session {} listing directory: {}", self.id, path.display());
        let mut dir = self.sftp_call(|s| s.open_dir(path))?;

        let mut entries = Vec::new();
        let result = loop {
            match self.call(true, |h| {
                h.sftp_mut()?;
                dir.readdir()
            }) {
                Ok(Some(entry)) => {
                    if !self.config.ignored_files.iter().any(|n| *n == entry.name) {
                        entries.push(FileInfo::from_entry(entry));
                    }
                }
                Ok(None) => break Ok(()),
                Err(err) => break Err(SshError::from(err)),
            }
        };
        self.exclusive(|_| drop(dir));
        result?;

        debug!(
            "Session {} listed {} entries in {}",
            self.id,
            entries.len(),
            path.display()
        );
        Ok(entries)
    }
}

impl<B: Backend> Session<B> {
    /// Start the SFTP subsystem, replacing a handle that is already open.
    pub async fn open_sftp(&self) -> Result<(), SshError> {
        self.run(|s| s.open_sftp()).await
    }

    pub async fn free_sftp(&self) {
        // Teardown never fails
        let _ = self
            .run(|s| {
                s.free_sftp();
                Ok(())
            })
            .await;
    }

    pub async fn has_sftp(&self) -> bool {
        self.run(|s| Ok(s.has_sftp())).await.unwrap_or(false)
    }

    pub async fn stat(&self, path: impl Into<PathBuf>) -> Result<FileInfo, SshError> {
        let path = path.into();
        self.run(move |s| s.sftp_stat(&path)).await
    }

    /// Create a directory, `rw-r--r--` unless `permissions` says otherwise.
    pub async fn mkdir(
        &self,
        path: impl Into<PathBuf>,
        permissions: Option<FilePermissions>,
    ) -> Result<(), SshError> {
        let path = path.into();
        let permissions = permissions.unwrap_or_default();
        self.run(move |s| s.sftp_mkdir(&path, permissions)).await
    }

    pub async fn mkfile(
        &self,
        path: impl Into<PathBuf>,
        permissions: Option<FilePermissions>,
    ) -> Result<(), SshError> {
        let path = path.into();
        let permissions = permissions.unwrap_or_default();
        self.run(move |s| s.sftp_mkfile(&path, permissions)).await
    }

    pub async fn rmdir(&self, path: impl Into<PathBuf>) -> Result<(), SshError> {
        let path = path.into();
        self.run(move |s| s.sftp_rmdir(&path)).await
    }

    /// Rename, overwriting `dst` if it exists.
    pub async fn rename(
        &self,
        src: impl Into<PathBuf>,
        dst: impl Into<PathBuf>,
    ) -> Result<(), SshError> {
        let (src, dst) = (src.into(), dst.into());
        self.run(move |s| s.sftp_rename(&src, &dst)).await
    }

    pub async fn unlink(&self, path: impl Into<PathBuf>) -> Result<(), SshError> {
        let path = path.into();
        self.run(move |s| s.sftp_unlink(&path)).await
    }

    /// Create a symbolic link at `path` pointing to `target`.
    pub async fn symlink(
        &self,
        path: impl Into<PathBuf>,
        target: impl Into<PathBuf>,
    ) -> Result<(), SshError> {
        let (path, target) = (path.into(), target.into());
        self.run(move |s| s.sftp_symlink(&path, &target)).await
    }

    pub async fn readlink(&self, path: impl Into<PathBuf>) -> Result<String, SshError> {
        let path = path.into();
        self.run(move |s| s.sftp_readlink(&path)).await
    }

    pub async fn realpath(&self, path: impl Into<PathBuf>) -> Result<String, SshError> {
        let path = path.into();
        self.run(move |s| s.sftp_realpath(&path)).await
    }

    pub async fn chown(&self, path: impl Into<PathBuf>, uid: u32, gid: u32) -> Result<(), SshError> {
        let path = path.into();
        self.run(move |s| s.sftp_chown(&path, uid, gid)).await
    }

    pub async fn chmod(
        &self,
        path: impl Into<PathBuf>,
        permissions: FilePermissions,
    ) -> Result<(), SshError> {
        let path = path.into();
        self.run(move |s| s.sftp_chmod(&path, permissions)).await
    }

    pub async fn statvfs(&self, path: impl Into<PathBuf>) -> Result<Statvfs, SshError> {
        let path = path.into();
        self.run(move |s| s.sftp_statvfs(&path)).await
    }

    pub async fn list_dir(&self, path: impl Into<PathBuf>) -> Result<Vec<FileInfo>, SshError> {
        let path = path.into();
        self.run(move |s| s.sftp_list_dir(&path)).await
    }
}
