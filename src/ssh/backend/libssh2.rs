//! libssh2 backend over the `ssh2` crate
//!
//! `ssh2` does not expose libssh2's debug and disconnect callbacks, so a
//! disconnect is recognised from `LIBSSH2_ERROR_SOCKET_DISCONNECT` returns and
//! reported through the session hooks. Library tracing goes to stderr via
//! `libssh2_trace` when a trace mask is configured.

use std::io::{self, Read, Write};
use std::path::Path;
use std::time::Duration;

use ssh2::{
    DisconnectCode, KeyboardInteractivePrompt, OpenFlags, OpenType, Prompt, RenameFlags,
    TraceFlags,
};

use super::{
    Backend, ChannelBackend, Connector, FileBackend, OpenMode, RawDirEntry, SftpAttributes,
    SftpBackend,
};
use crate::sftp::Statvfs;
use crate::ssh::config::SshConfig;
use crate::ssh::delegate::SessionHooks;
use crate::ssh::error::{codes, ErrorCode, ProtocolError, SshError};
use crate::ssh::transport::Transport;
use crate::ssh::types::{BlockDirections, HostKeyType, MethodType, StreamId};

/// Opens libssh2 sessions on a transport's library socket.
#[derive(Debug, Clone, Copy, Default)]
pub struct Libssh2Connector;

impl Connector<Libssh2Session> for Libssh2Connector {
    fn open(
        &self,
        transport: &Transport,
        _config: &SshConfig,
        hooks: SessionHooks,
    ) -> Result<Libssh2Session, ProtocolError> {
        let mut session = ssh2::Session::new().map_err(|e| convert(&e))?;
        let stream = transport
            .library_stream()
            .map_err(|e| ProtocolError::session(codes::SOCKET_NONE, e.to_string()))?;
        session.set_tcp_stream(stream);
        Ok(Libssh2Session { session, hooks })
    }
}

fn convert(err: &ssh2::Error) -> ProtocolError {
    let code = match err.code() {
        ssh2::ErrorCode::Session(code) => ErrorCode::Session(code),
        ssh2::ErrorCode::SFTP(code) => ErrorCode::Sftp(code),
    };
    ProtocolError::new(code, err.message())
}

impl From<ssh2::Error> for ProtocolError {
    fn from(err: ssh2::Error) -> Self {
        convert(&err)
    }
}

impl From<ssh2::Error> for SshError {
    fn from(err: ssh2::Error) -> Self {
        convert(&err).into()
    }
}

fn convert_io(err: io::Error) -> ProtocolError {
    if let Some(inner) = err.get_ref().and_then(|e| e.downcast_ref::<ssh2::Error>()) {
        return convert(inner);
    }
    match err.kind() {
        io::ErrorKind::WouldBlock => ProtocolError::would_block(),
        io::ErrorKind::TimedOut => ProtocolError::session(codes::TIMEOUT, err.to_string()),
        _ => ProtocolError::session(codes::SOCKET_RECV, err.to_string()),
    }
}

/// Map a result and report a dropped connection to the hooks.
fn observe<T>(hooks: &SessionHooks, result: Result<T, ProtocolError>) -> Result<T, ProtocolError> {
    if let Err(err) = &result {
        if err.is_session_code(codes::SOCKET_DISCONNECT) {
            hooks.disconnect(codes::SOCKET_DISCONNECT, err.message());
        }
    }
    result
}

fn method_type(method: MethodType) -> Option<ssh2::MethodType> {
    Some(match method {
        MethodType::Kex => ssh2::MethodType::Kex,
        MethodType::HostKey => ssh2::MethodType::HostKey,
        MethodType::CryptCs => ssh2::MethodType::CryptCs,
        MethodType::CryptSc => ssh2::MethodType::CryptSc,
        MethodType::MacCs => ssh2::MethodType::MacCs,
        MethodType::MacSc => ssh2::MethodType::MacSc,
        MethodType::CompCs => ssh2::MethodType::CompCs,
        MethodType::CompSc => ssh2::MethodType::CompSc,
        MethodType::LangCs => ssh2::MethodType::LangCs,
        MethodType::LangSc => ssh2::MethodType::LangSc,
        MethodType::SignAlgo => return None,
    })
}

fn host_key_type(kind: ssh2::HostKeyType) -> HostKeyType {
    match kind {
        ssh2::HostKeyType::Rsa => HostKeyType::Rsa,
        ssh2::HostKeyType::Dss => HostKeyType::Dss,
        ssh2::HostKeyType::Ecdsa256 => HostKeyType::Ecdsa256,
        ssh2::HostKeyType::Ecdsa384 => HostKeyType::Ecdsa384,
        ssh2::HostKeyType::Ecdsa521 => HostKeyType::Ecdsa521,
        ssh2::HostKeyType::Ed25519 => HostKeyType::Ed25519,
        _ => HostKeyType::Unknown,
    }
}

fn attributes(stat: &ssh2::FileStat) -> SftpAttributes {
    SftpAttributes {
        size: stat.size,
        uid: stat.uid,
        gid: stat.gid,
        perm: stat.perm,
        atime: stat.atime,
        mtime: stat.mtime,
    }
}

/// libssh2 session handle. Dropping it frees the session.
pub struct Libssh2Session {
    session: ssh2::Session,
    hooks: SessionHooks,
}

impl Libssh2Session {
    fn check<T>(&self, result: Result<T, ssh2::Error>) -> Result<T, ProtocolError> {
        observe(&self.hooks, result.map_err(|e| convert(&e)))
    }

    fn channel(&self, result: Result<ssh2::Channel, ssh2::Error>) -> Result<Libssh2Channel, ProtocolError> {
        let channel = self.check(result)?;
        Ok(Libssh2Channel {
            channel,
            hooks: self.hooks.clone(),
        })
    }
}

struct Responder<'a> {
    respond: &'a mut dyn FnMut(&str) -> String,
}

impl KeyboardInteractivePrompt for Responder<'_> {
    fn prompt<'b>(
        &mut self,
        _username: &str,
        _instructions: &str,
        prompts: &[Prompt<'b>],
    ) -> Vec<String> {
        prompts.iter().map(|p| (self.respond)(&p.text)).collect()
    }
}

impl Backend for Libssh2Session {
    type Channel = Libssh2Channel;
    type Sftp = Libssh2Sftp;

    fn set_method_pref(&mut self, method: MethodType, prefs: &str) -> Result<(), ProtocolError> {
        let Some(kind) = method_type(method) else {
            return Err(ProtocolError::session(
                codes::METHOD_NONE,
                format!("{:?} preferences are not supported by this libssh2 binding", method),
            ));
        };
        self.check(self.session.method_pref(kind, prefs))
    }

    fn set_compress(&mut self, compress: bool) {
        self.session.set_compress(compress);
    }

    fn set_allow_sigpipe(&mut self, allow: bool) {
        self.session.set_allow_sigpipe(allow);
    }

    fn set_blocking(&mut self, blocking: bool) {
        self.session.set_blocking(blocking);
    }

    fn is_blocking(&self) -> bool {
        self.session.is_blocking()
    }

    fn set_timeout(&mut self, timeout: Duration) {
        let millis = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX);
        self.session.set_timeout(millis);
    }

    fn set_banner(&mut self, banner: &str) -> Result<(), ProtocolError> {
        self.check(self.session.set_banner(banner))
    }

    fn set_trace(&mut self, mask: i32) {
        if mask != 0 {
            self.session.trace(TraceFlags::from_bits_truncate(mask));
        }
    }

    fn handshake(&mut self) -> Result<(), ProtocolError> {
        let result = self.session.handshake();
        self.check(result)
    }

    fn block_directions(&self) -> BlockDirections {
        match self.session.block_directions() {
            ssh2::BlockDirections::None => BlockDirections::None,
            ssh2::BlockDirections::Inbound => BlockDirections::Inbound,
            ssh2::BlockDirections::Outbound => BlockDirections::Outbound,
            ssh2::BlockDirections::Both => BlockDirections::Both,
        }
    }

    fn host_key(&self) -> Option<(HostKeyType, Vec<u8>)> {
        self.session
            .host_key()
            .map(|(data, kind)| (host_key_type(kind), data.to_vec()))
    }

    fn remote_banner(&self) -> Option<String> {
        self.session.banner().map(str::to_string)
    }

    fn methods(&self, method: MethodType) -> Option<String> {
        self.session.methods(method_type(method)?).map(str::to_string)
    }

    fn last_error(&self) -> Option<ProtocolError> {
        ssh2::Error::last_session_error(&self.session).map(|e| convert(&e))
    }

    fn auth_methods(&mut self, username: &str) -> Result<String, ProtocolError> {
        let result = self.session.auth_methods(username).map(str::to_string);
        self.check(result)
    }

    fn authenticated(&self) -> bool {
        self.session.authenticated()
    }

    fn userauth_password(&mut self, username: &str, password: &str) -> Result<(), ProtocolError> {
        self.check(self.session.userauth_password(username, password))
    }

    fn userauth_pubkey_file(
        &mut self,
        username: &str,
        public_key: Option<&Path>,
        private_key: &Path,
        passphrase: Option<&str>,
    ) -> Result<(), ProtocolError> {
        self.check(
            self.session
                .userauth_pubkey_file(username, public_key, private_key, passphrase),
        )
    }

    fn userauth_pubkey_memory(
        &mut self,
        username: &str,
        public_key: Option<&str>,
        private_key: &str,
        passphrase: Option<&str>,
    ) -> Result<(), ProtocolError> {
        self.check(
            self.session
                .userauth_pubkey_memory(username, public_key, private_key, passphrase),
        )
    }

    fn userauth_keyboard_interactive(
        &mut self,
        username: &str,
        respond: &mut dyn FnMut(&str) -> String,
    ) -> Result<(), ProtocolError> {
        let mut responder = Responder { respond };
        let result = self
            .session
            .userauth_keyboard_interactive(username, &mut responder);
        self.check(result)
    }

    fn keepalive_config(&mut self, want_reply: bool, interval_secs: u32) {
        self.session.set_keepalive(want_reply, interval_secs);
    }

    fn keepalive_send(&mut self) -> Result<u32, ProtocolError> {
        self.check(self.session.keepalive_send())
    }

    fn disconnect(&mut self, description: &str) -> Result<(), ProtocolError> {
        let result =
            self.session
                .disconnect(Some(DisconnectCode::ByApplication), description, None);
        result.map_err(|e| convert(&e))
    }

    fn channel_open_session(
        &mut self,
        window_size: u32,
        packet_size: u32,
    ) -> Result<Libssh2Channel, ProtocolError> {
        let result = self
            .session
            .channel_open("session", window_size, packet_size, None);
        self.channel(result)
    }

    fn channel_direct_tcpip(
        &mut self,
        host: &str,
        port: u16,
        originator: (&str, u16),
    ) -> Result<Libssh2Channel, ProtocolError> {
        let result = self.session.channel_direct_tcpip(host, port, Some(originator));
        self.channel(result)
    }

    fn channel_direct_streamlocal(
        &mut self,
        socket_path: &str,
        originator: (&str, u16),
    ) -> Result<Libssh2Channel, ProtocolError> {
        let result = self
            .session
            .channel_direct_streamlocal(socket_path, Some(originator));
        self.channel(result)
    }

    fn scp_recv(&mut self, path: &Path) -> Result<(Libssh2Channel, u64), ProtocolError> {
        let (channel, stat) = self.check(self.session.scp_recv(path))?;
        Ok((
            Libssh2Channel {
                channel,
                hooks: self.hooks.clone(),
            },
            stat.size(),
        ))
    }

    fn scp_send(&mut self, path: &Path, mode: i32, size: u64) -> Result<Libssh2Channel, ProtocolError> {
        let result = self.session.scp_send(path, mode, size, None);
        self.channel(result)
    }

    fn sftp_init(&mut self) -> Result<Libssh2Sftp, ProtocolError> {
        let sftp = self.check(self.session.sftp())?;
        Ok(Libssh2Sftp {
            sftp,
            hooks: self.hooks.clone(),
        })
    }
}

/// libssh2 channel. Dropping it frees the channel.
pub struct Libssh2Channel {
    channel: ssh2::Channel,
    hooks: SessionHooks,
}

impl Libssh2Channel {
    fn check<T>(&self, result: Result<T, ssh2::Error>) -> Result<T, ProtocolError> {
        observe(&self.hooks, result.map_err(|e| convert(&e)))
    }
}

impl ChannelBackend for Libssh2Channel {
    fn request_pty(&mut self, term: &str, width: u32, height: u32) -> Result<(), ProtocolError> {
        let result = self
            .channel
            .request_pty(term, None, Some((width, height, 0, 0)));
        self.check(result)
    }

    fn request_pty_size(&mut self, width: u32, height: u32) -> Result<(), ProtocolError> {
        let result = self.channel.request_pty_size(width, height, None, None);
        self.check(result)
    }

    fn setenv(&mut self, name: &str, value: &str) -> Result<(), ProtocolError> {
        let result = self.channel.setenv(name, value);
        self.check(result)
    }

    fn process_startup(&mut self, request: &str, message: Option<&str>) -> Result<(), ProtocolError> {
        let result = self.channel.process_startup(request, message);
        self.check(result)
    }

    fn read(&mut self, stream: StreamId, buf: &mut [u8]) -> Result<usize, ProtocolError> {
        let result = self.channel.stream(stream.id()).read(buf).map_err(convert_io);
        observe(&self.hooks, result)
    }

    fn write(&mut self, stream: StreamId, data: &[u8]) -> Result<usize, ProtocolError> {
        let result = self.channel.stream(stream.id()).write(data).map_err(convert_io);
        observe(&self.hooks, result)
    }

    fn eof(&self) -> bool {
        self.channel.eof()
    }

    fn exit_status(&self) -> i32 {
        self.channel.exit_status().unwrap_or(0)
    }

    fn send_eof(&mut self) -> Result<(), ProtocolError> {
        let result = self.channel.send_eof();
        self.check(result)
    }

    fn wait_eof(&mut self) -> Result<(), ProtocolError> {
        let result = self.channel.wait_eof();
        self.check(result)
    }

    fn close(&mut self) -> Result<(), ProtocolError> {
        let result = self.channel.close();
        self.check(result)
    }

    fn wait_close(&mut self) -> Result<(), ProtocolError> {
        let result = self.channel.wait_close();
        self.check(result)
    }
}

/// libssh2 SFTP sub-session.
pub struct Libssh2Sftp {
    sftp: ssh2::Sftp,
    hooks: SessionHooks,
}

impl Libssh2Sftp {
    fn check<T>(&self, result: Result<T, ssh2::Error>) -> Result<T, ProtocolError> {
        observe(&self.hooks, result.map_err(|e| convert(&e)))
    }

    fn file(&self, result: Result<ssh2::File, ssh2::Error>) -> Result<Libssh2File, ProtocolError> {
        let file = self.check(result)?;
        Ok(Libssh2File {
            file,
            hooks: self.hooks.clone(),
        })
    }
}

impl SftpBackend for Libssh2Sftp {
    type File = Libssh2File;

    fn stat(&mut self, path: &Path) -> Result<SftpAttributes, ProtocolError> {
        self.check(self.sftp.stat(path)).map(|stat| attributes(&stat))
    }

    fn setstat(&mut self, path: &Path, attrs: SftpAttributes) -> Result<(), ProtocolError> {
        let stat = ssh2::FileStat {
            size: attrs.size,
            uid: attrs.uid,
            gid: attrs.gid,
            perm: attrs.perm,
            atime: attrs.atime,
            mtime: attrs.mtime,
        };
        self.check(self.sftp.setstat(path, stat))
    }

    fn mkdir(&mut self, path: &Path, mode: i32) -> Result<(), ProtocolError> {
        self.check(self.sftp.mkdir(path, mode))
    }

    fn rmdir(&mut self, path: &Path) -> Result<(), ProtocolError> {
        self.check(self.sftp.rmdir(path))
    }

    fn unlink(&mut self, path: &Path) -> Result<(), ProtocolError> {
        self.check(self.sftp.unlink(path))
    }

    fn rename(&mut self, src: &Path, dst: &Path) -> Result<(), ProtocolError> {
        let flags = RenameFlags::OVERWRITE | RenameFlags::ATOMIC | RenameFlags::NATIVE;
        self.check(self.sftp.rename(src, dst, Some(flags)))
    }

    fn symlink(&mut self, path: &Path, target: &Path) -> Result<(), ProtocolError> {
        self.check(self.sftp.symlink(path, target))
    }

    fn readlink(&mut self, path: &Path) -> Result<String, ProtocolError> {
        self.check(self.sftp.readlink(path))
            .map(|p| p.to_string_lossy().into_owned())
    }

    fn realpath(&mut self, path: &Path) -> Result<String, ProtocolError> {
        self.check(self.sftp.realpath(path))
            .map(|p| p.to_string_lossy().into_owned())
    }

    fn statvfs(&mut self, path: &Path) -> Result<Statvfs, ProtocolError> {
        // statvfs needs a handle; directories and regular files both work
        let opened = self.sftp.opendir(path).or_else(|_| self.sftp.open(path));
        let mut handle = self.check(opened)?;
        let raw = self.check(handle.statvfs())?;
        Ok(Statvfs {
            bsize: raw.f_bsize,
            frsize: raw.f_frsize,
            blocks: raw.f_blocks,
            bfree: raw.f_bfree,
            bavail: raw.f_bavail,
            files: raw.f_files,
            ffree: raw.f_ffree,
            favail: raw.f_favail,
            fsid: raw.f_fsid,
            flag: raw.f_flag,
            namemax: raw.f_namemax,
        })
    }

    fn open_file(&mut self, path: &Path, mode: OpenMode, permissions: i32) -> Result<Libssh2File, ProtocolError> {
        let flags = match mode {
            OpenMode::Read => OpenFlags::READ,
            OpenMode::Write => OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
        };
        let result = self.sftp.open_mode(path, flags, permissions, OpenType::File);
        self.file(result)
    }

    fn open_dir(&mut self, path: &Path) -> Result<Libssh2File, ProtocolError> {
        let result = self.sftp.opendir(path);
        self.file(result)
    }
}

/// libssh2 SFTP file or directory handle.
pub struct Libssh2File {
    file: ssh2::File,
    hooks: SessionHooks,
}

impl FileBackend for Libssh2File {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, ProtocolError> {
        observe(&self.hooks, self.file.read(buf).map_err(convert_io))
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, ProtocolError> {
        observe(&self.hooks, self.file.write(data).map_err(convert_io))
    }

    fn readdir(&mut self) -> Result<Option<RawDirEntry>, ProtocolError> {
        match self.file.readdir() {
            Ok((path, stat)) => Ok(Some(RawDirEntry {
                name: path.to_string_lossy().into_owned(),
                longname: None,
                attrs: attributes(&stat),
            })),
            // End of listing is reported as LIBSSH2_ERROR_FILE
            Err(e) if matches!(e.code(), ssh2::ErrorCode::Session(c) if c == codes::FILE) => Ok(None),
            Err(e) => observe(&self.hooks, Err(convert(&e))),
        }
    }
}
