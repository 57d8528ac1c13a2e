//! In-memory backend driven by a script, for tests
//!
//! Every library call enters a non-reentrant guard that panics when two
//! calls overlap, so any breach of call serialization fails the test that
//! caused it.

use std::collections::{HashMap, VecDeque};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};

use super::{
    Backend, ChannelBackend, Connector, FileBackend, OpenMode, RawDirEntry, SftpAttributes,
    SftpBackend,
};
use crate::sftp::Statvfs;
use crate::ssh::config::SshConfig;
use crate::ssh::delegate::{ChannelDelegate, SessionDelegate, SessionHooks};
use crate::ssh::error::{codes, ProtocolError};
use crate::ssh::transport::Transport;
use crate::ssh::session::Session;
use crate::ssh::types::{BlockDirections, HostKey, HostKeyType, MethodType, StreamId};

/// What the fake server does.
#[derive(Clone)]
pub(crate) struct Script {
    pub handshake_would_block: usize,
    pub handshake_error: Option<ProtocolError>,
    pub host_key: Option<(HostKeyType, Vec<u8>)>,
    pub auth_methods: String,
    pub password: String,
    pub accept_pubkey: bool,
    pub exec_stdout: Vec<u8>,
    pub exec_stderr: Vec<u8>,
    pub exit_status: i32,
    /// Hold exec stderr back until stdout has reached EOF
    pub exec_stderr_late: bool,
    pub shell_output: Vec<u8>,
    pub shell_read_error: Option<ProtocolError>,
    pub dir_entries: Vec<RawDirEntry>,
    pub files: HashMap<String, Vec<u8>>,
    pub links: HashMap<String, String>,
    pub keepalive_error: Option<ProtocolError>,
    pub scp_declared_size: Option<u64>,
    /// Size SFTP `stat` reports instead of the file's real length
    pub sftp_stat_size: Option<u64>,
    /// Time each call spends inside the library
    pub hold: Duration,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            handshake_would_block: 0,
            handshake_error: None,
            host_key: Some((HostKeyType::Ed25519, b"scripted-host-key".to_vec())),
            auth_methods: "publickey,password,keyboard-interactive".to_string(),
            password: "secret".to_string(),
            accept_pubkey: false,
            exec_stdout: Vec::new(),
            exec_stderr: Vec::new(),
            exit_status: 0,
            exec_stderr_late: false,
            shell_output: Vec::new(),
            shell_read_error: None,
            dir_entries: Vec::new(),
            files: HashMap::new(),
            links: HashMap::new(),
            keepalive_error: None,
            scp_declared_size: None,
            sftp_stat_size: None,
            hold: Duration::ZERO,
        }
    }
}

/// Shared script plus observations made while it runs.
pub(crate) struct ScriptState {
    script: Mutex<Script>,
    busy: AtomicBool,
    readiness: AtomicUsize,
    eof_sent: AtomicUsize,
    keepalives: AtomicUsize,
    log: Mutex<Vec<String>>,
}

struct Busy<'a> {
    state: &'a ScriptState,
}

impl Drop for Busy<'_> {
    fn drop(&mut self) {
        self.state.busy.store(false, Ordering::SeqCst);
    }
}

impl ScriptState {
    pub(crate) fn new() -> Arc<Self> {
        Self::with_script(Script::default())
    }

    pub(crate) fn with_script(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script),
            busy: AtomicBool::new(false),
            readiness: AtomicUsize::new(0),
            eof_sent: AtomicUsize::new(0),
            keepalives: AtomicUsize::new(0),
            log: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock()
    }

    fn enter(&self, call: &str) -> Busy<'_> {
        if self.busy.swap(true, Ordering::SeqCst) {
            panic!("overlapping library call: {}", call);
        }
        self.log.lock().push(call.to_string());
        let hold = self.script.lock().hold;
        if !hold.is_zero() {
            std::thread::sleep(hold);
        }
        Busy { state: self }
    }

    pub(crate) fn readiness_queries(&self) -> usize {
        self.readiness.load(Ordering::SeqCst)
    }

    pub(crate) fn eof_sent(&self) -> usize {
        self.eof_sent.load(Ordering::SeqCst)
    }

    pub(crate) fn keepalives(&self) -> usize {
        self.keepalives.load(Ordering::SeqCst)
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    pub(crate) fn called(&self, prefix: &str) -> usize {
        self.log.lock().iter().filter(|c| c.starts_with(prefix)).count()
    }
}

fn sftp_missing(path: &Path) -> ProtocolError {
    ProtocolError::sftp(2, format!("{}: no such file", path.display()))
}

fn key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Hands out [`ScriptedSession`]s sharing one script.
pub(crate) struct ScriptedConnector {
    pub(crate) state: Arc<ScriptState>,
}

impl Connector<ScriptedSession> for ScriptedConnector {
    fn open(
        &self,
        _transport: &Transport,
        _config: &SshConfig,
        hooks: SessionHooks,
    ) -> Result<ScriptedSession, ProtocolError> {
        let mut session = ScriptedSession::new(self.state.clone());
        session.hooks = Some(hooks);
        Ok(session)
    }
}

pub(crate) struct ScriptedSession {
    state: Arc<ScriptState>,
    hooks: Option<SessionHooks>,
    blocking: bool,
    authenticated: bool,
    handshake_would_block: usize,
    compress: bool,
}

impl ScriptedSession {
    pub(crate) fn new(state: Arc<ScriptState>) -> Self {
        let handshake_would_block = state.script().handshake_would_block;
        Self {
            state,
            hooks: None,
            blocking: true,
            authenticated: false,
            handshake_would_block,
            compress: false,
        }
    }

    /// Simulate the server dropping the connection during a call.
    pub(crate) fn drop_connection(&self) -> ProtocolError {
        if let Some(hooks) = &self.hooks {
            hooks.disconnect(codes::SOCKET_DISCONNECT, "connection reset");
        }
        ProtocolError::session(codes::SOCKET_DISCONNECT, "connection reset")
    }

    fn channel(&self) -> ScriptedChannel {
        ScriptedChannel::new(self.state.clone())
    }
}

impl Backend for ScriptedSession {
    type Channel = ScriptedChannel;
    type Sftp = ScriptedSftp;

    fn set_method_pref(&mut self, method: MethodType, prefs: &str) -> Result<(), ProtocolError> {
        let _busy = self.state.enter(&format!("method_pref:{:?}:{}", method, prefs));
        Ok(())
    }

    fn set_compress(&mut self, compress: bool) {
        self.compress = compress;
    }

    fn set_allow_sigpipe(&mut self, _allow: bool) {}

    fn set_blocking(&mut self, blocking: bool) {
        self.blocking = blocking;
    }

    fn is_blocking(&self) -> bool {
        self.blocking
    }

    fn set_timeout(&mut self, _timeout: Duration) {}

    fn set_banner(&mut self, banner: &str) -> Result<(), ProtocolError> {
        let _busy = self.state.enter(&format!("banner:{}", banner));
        Ok(())
    }

    fn set_trace(&mut self, _mask: i32) {}

    fn handshake(&mut self) -> Result<(), ProtocolError> {
        let _busy = self.state.enter("handshake");
        if self.handshake_would_block > 0 {
            self.handshake_would_block -= 1;
            return Err(ProtocolError::would_block());
        }
        match self.state.script().handshake_error.clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn block_directions(&self) -> BlockDirections {
        self.state.readiness.fetch_add(1, Ordering::SeqCst);
        BlockDirections::Inbound
    }

    fn host_key(&self) -> Option<(HostKeyType, Vec<u8>)> {
        let _busy = self.state.enter("host_key");
        self.state.script().host_key.clone()
    }

    fn remote_banner(&self) -> Option<String> {
        Some("SSH-2.0-Scripted_1.0".to_string())
    }

    fn methods(&self, method: MethodType) -> Option<String> {
        match method {
            MethodType::CompCs | MethodType::CompSc if self.compress => {
                Some("zlib@openssh.com".to_string())
            }
            MethodType::CompCs | MethodType::CompSc => Some("none".to_string()),
            MethodType::Kex => Some("curve25519-sha256".to_string()),
            _ => None,
        }
    }

    fn last_error(&self) -> Option<ProtocolError> {
        None
    }

    fn auth_methods(&mut self, _username: &str) -> Result<String, ProtocolError> {
        let _busy = self.state.enter("auth_methods");
        Ok(self.state.script().auth_methods.clone())
    }

    fn authenticated(&self) -> bool {
        self.authenticated
    }

    fn userauth_password(&mut self, _username: &str, password: &str) -> Result<(), ProtocolError> {
        let _busy = self.state.enter("userauth_password");
        if password == self.state.script().password {
            self.authenticated = true;
            Ok(())
        } else {
            Err(ProtocolError::session(
                codes::AUTHENTICATION_FAILED,
                "Authentication failed (username/password)",
            ))
        }
    }

    fn userauth_pubkey_file(
        &mut self,
        _username: &str,
        _public_key: Option<&Path>,
        _private_key: &Path,
        _passphrase: Option<&str>,
    ) -> Result<(), ProtocolError> {
        let state = self.state.clone();
        let _busy = state.enter("userauth_pubkey_file");
        self.pubkey_result()
    }

    fn userauth_pubkey_memory(
        &mut self,
        _username: &str,
        _public_key: Option<&str>,
        _private_key: &str,
        _passphrase: Option<&str>,
    ) -> Result<(), ProtocolError> {
        let state = self.state.clone();
        let _busy = state.enter("userauth_pubkey_memory");
        self.pubkey_result()
    }

    fn userauth_keyboard_interactive(
        &mut self,
        _username: &str,
        respond: &mut dyn FnMut(&str) -> String,
    ) -> Result<(), ProtocolError> {
        let _busy = self.state.enter("userauth_keyboard_interactive");
        let answer = respond("Password: ");
        if answer == self.state.script().password {
            self.authenticated = true;
            Ok(())
        } else {
            Err(ProtocolError::session(
                codes::AUTHENTICATION_FAILED,
                "Authentication failed (keyboard-interactive)",
            ))
        }
    }

    fn keepalive_config(&mut self, want_reply: bool, interval_secs: u32) {
        let _busy = self
            .state
            .enter(&format!("keepalive_config:{}:{}", want_reply, interval_secs));
    }

    fn keepalive_send(&mut self) -> Result<u32, ProtocolError> {
        let _busy = self.state.enter("keepalive_send");
        self.state.keepalives.fetch_add(1, Ordering::SeqCst);
        match self.state.script().keepalive_error.clone() {
            Some(err) => Err(err),
            None => Ok(5),
        }
    }

    fn disconnect(&mut self, description: &str) -> Result<(), ProtocolError> {
        let _busy = self.state.enter(&format!("disconnect:{}", description));
        Ok(())
    }

    fn channel_open_session(
        &mut self,
        window_size: u32,
        packet_size: u32,
    ) -> Result<ScriptedChannel, ProtocolError> {
        let _busy = self
            .state
            .enter(&format!("channel_open:{}:{}", window_size, packet_size));
        Ok(self.channel())
    }

    fn channel_direct_tcpip(
        &mut self,
        host: &str,
        port: u16,
        originator: (&str, u16),
    ) -> Result<ScriptedChannel, ProtocolError> {
        let _busy = self.state.enter(&format!(
            "direct_tcpip:{}:{}:{}:{}",
            host, port, originator.0, originator.1
        ));
        Ok(self.channel())
    }

    fn channel_direct_streamlocal(
        &mut self,
        socket_path: &str,
        originator: (&str, u16),
    ) -> Result<ScriptedChannel, ProtocolError> {
        let _busy = self.state.enter(&format!(
            "direct_streamlocal:{}:{}:{}",
            socket_path, originator.0, originator.1
        ));
        Ok(self.channel())
    }

    fn scp_recv(&mut self, path: &Path) -> Result<(ScriptedChannel, u64), ProtocolError> {
        let _busy = self.state.enter(&format!("scp_recv:{}", path.display()));
        let (content, declared) = {
            let script = self.state.script();
            let content = script
                .files
                .get(&key(path))
                .cloned()
                .ok_or_else(|| ProtocolError::session(codes::FILE, "scp: no such file"))?;
            let declared = script.scp_declared_size.unwrap_or(content.len() as u64);
            (content, declared)
        };
        let mut channel = self.channel();
        channel.stdout.extend(content);
        channel.eof_when_drained = true;
        Ok((channel, declared))
    }

    fn scp_send(&mut self, path: &Path, mode: i32, size: u64) -> Result<ScriptedChannel, ProtocolError> {
        let _busy = self
            .state
            .enter(&format!("scp_send:{}:{:o}:{}", path.display(), mode, size));
        self.state.script().files.insert(key(path), Vec::new());
        let mut channel = self.channel();
        channel.upload = Some(key(path));
        Ok(channel)
    }

    fn sftp_init(&mut self) -> Result<ScriptedSftp, ProtocolError> {
        let _busy = self.state.enter("sftp_init");
        Ok(ScriptedSftp {
            state: self.state.clone(),
        })
    }
}

impl ScriptedSession {
    fn pubkey_result(&mut self) -> Result<(), ProtocolError> {
        if self.state.script().accept_pubkey {
            self.authenticated = true;
            Ok(())
        } else {
            Err(ProtocolError::session(
                codes::AUTHENTICATION_FAILED,
                "Authentication failed (publickey)",
            ))
        }
    }
}

pub(crate) struct ScriptedChannel {
    state: Arc<ScriptState>,
    stdout: VecDeque<u8>,
    stderr: VecDeque<u8>,
    late_stderr: VecDeque<u8>,
    eof_when_drained: bool,
    read_error: Option<ProtocolError>,
    remote_eof: bool,
    exit_status: i32,
    upload: Option<String>,
}

impl ScriptedChannel {
    pub(crate) fn new(state: Arc<ScriptState>) -> Self {
        Self {
            state,
            stdout: VecDeque::new(),
            stderr: VecDeque::new(),
            late_stderr: VecDeque::new(),
            eof_when_drained: false,
            read_error: None,
            remote_eof: false,
            exit_status: 0,
            upload: None,
        }
    }
}

impl ChannelBackend for ScriptedChannel {
    fn request_pty(&mut self, term: &str, width: u32, height: u32) -> Result<(), ProtocolError> {
        let _busy = self.state.enter(&format!("pty:{}:{}x{}", term, width, height));
        Ok(())
    }

    fn request_pty_size(&mut self, width: u32, height: u32) -> Result<(), ProtocolError> {
        let _busy = self.state.enter(&format!("pty_size:{}x{}", width, height));
        Ok(())
    }

    fn setenv(&mut self, name: &str, value: &str) -> Result<(), ProtocolError> {
        let _busy = self.state.enter(&format!("setenv:{}={}", name, value));
        Ok(())
    }

    fn process_startup(&mut self, request: &str, message: Option<&str>) -> Result<(), ProtocolError> {
        let _busy = self
            .state
            .enter(&format!("startup:{}:{}", request, message.unwrap_or_default()));
        let script = self.state.script();
        match request {
            "exec" => {
                self.stdout.extend(script.exec_stdout.iter().copied());
                if script.exec_stderr_late {
                    self.late_stderr.extend(script.exec_stderr.iter().copied());
                } else {
                    self.stderr.extend(script.exec_stderr.iter().copied());
                }
                self.exit_status = script.exit_status;
                self.eof_when_drained = true;
            }
            "shell" => {
                self.stdout.extend(script.shell_output.iter().copied());
                self.read_error = script.shell_read_error.clone();
            }
            _ => {}
        }
        Ok(())
    }

    fn read(&mut self, stream: StreamId, buf: &mut [u8]) -> Result<usize, ProtocolError> {
        let _busy = self.state.enter(&format!("read:{}", stream.id()));
        if stream == StreamId::Stdout && self.stdout.is_empty() {
            let late = std::mem::take(&mut self.late_stderr);
            self.stderr.extend(late);
        }
        let source = match stream {
            StreamId::Stdout => &mut self.stdout,
            StreamId::Stderr => &mut self.stderr,
        };
        if source.is_empty() {
            if let Some(err) = self.read_error.take() {
                return Err(err);
            }
            if self.eof_when_drained {
                self.remote_eof = true;
                return Ok(0);
            }
            return Err(ProtocolError::would_block());
        }
        let n = buf.len().min(source.len());
        for (slot, byte) in buf.iter_mut().zip(source.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn write(&mut self, stream: StreamId, data: &[u8]) -> Result<usize, ProtocolError> {
        let _busy = self
            .state
            .enter(&format!("write:{}:{}", stream.id(), data.len()));
        if let Some(path) = &self.upload {
            if let Some(file) = self.state.script().files.get_mut(path) {
                file.extend_from_slice(data);
            }
        }
        Ok(data.len())
    }

    fn eof(&self) -> bool {
        self.remote_eof
    }

    fn exit_status(&self) -> i32 {
        self.exit_status
    }

    fn send_eof(&mut self) -> Result<(), ProtocolError> {
        let _busy = self.state.enter("send_eof");
        self.state.eof_sent.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn wait_eof(&mut self) -> Result<(), ProtocolError> {
        let _busy = self.state.enter("wait_eof");
        self.remote_eof = true;
        Ok(())
    }

    fn close(&mut self) -> Result<(), ProtocolError> {
        let _busy = self.state.enter("close");
        Ok(())
    }

    fn wait_close(&mut self) -> Result<(), ProtocolError> {
        let _busy = self.state.enter("wait_close");
        Ok(())
    }
}

pub(crate) struct ScriptedSftp {
    state: Arc<ScriptState>,
}

impl SftpBackend for ScriptedSftp {
    type File = ScriptedFile;

    fn stat(&mut self, path: &Path) -> Result<SftpAttributes, ProtocolError> {
        let _busy = self.state.enter(&format!("stat:{}", path.display()));
        let script = self.state.script();
        let data = script.files.get(&key(path)).ok_or_else(|| sftp_missing(path))?;
        Ok(SftpAttributes {
            size: Some(script.sftp_stat_size.unwrap_or(data.len() as u64)),
            uid: Some(1000),
            gid: Some(1000),
            perm: Some(0o100644),
            atime: Some(1_700_000_000),
            mtime: Some(1_700_000_000),
        })
    }

    fn setstat(&mut self, path: &Path, attrs: SftpAttributes) -> Result<(), ProtocolError> {
        let _busy = self.state.enter(&format!(
            "setstat:{}:uid={:?}:gid={:?}:perm={:?}",
            path.display(),
            attrs.uid,
            attrs.gid,
            attrs.perm.map(|p| format!("{:o}", p))
        ));
        Ok(())
    }

    fn mkdir(&mut self, path: &Path, mode: i32) -> Result<(), ProtocolError> {
        let _busy = self.state.enter(&format!("mkdir:{}:{:o}", path.display(), mode));
        Ok(())
    }

    fn rmdir(&mut self, path: &Path) -> Result<(), ProtocolError> {
        let _busy = self.state.enter(&format!("rmdir:{}", path.display()));
        Ok(())
    }

    fn unlink(&mut self, path: &Path) -> Result<(), ProtocolError> {
        let _busy = self.state.enter(&format!("unlink:{}", path.display()));
        self.state
            .script()
            .files
            .remove(&key(path))
            .map(|_| ())
            .ok_or_else(|| sftp_missing(path))
    }

    fn rename(&mut self, src: &Path, dst: &Path) -> Result<(), ProtocolError> {
        let _busy = self
            .state
            .enter(&format!("rename:{}:{}", src.display(), dst.display()));
        let mut script = self.state.script();
        let data = script.files.remove(&key(src)).ok_or_else(|| sftp_missing(src))?;
        script.files.insert(key(dst), data);
        Ok(())
    }

    fn symlink(&mut self, path: &Path, target: &Path) -> Result<(), ProtocolError> {
        let _busy = self
            .state
            .enter(&format!("symlink:{}:{}", path.display(), target.display()));
        self.state.script().links.insert(key(path), key(target));
        Ok(())
    }

    fn readlink(&mut self, path: &Path) -> Result<String, ProtocolError> {
        let _busy = self.state.enter(&format!("readlink:{}", path.display()));
        self.state
            .script()
            .links
            .get(&key(path))
            .cloned()
            .ok_or_else(|| sftp_missing(path))
    }

    fn realpath(&mut self, path: &Path) -> Result<String, ProtocolError> {
        let _busy = self.state.enter(&format!("realpath:{}", path.display()));
        let path = key(path);
        Ok(match path.as_str() {
            "." | "" => "/home/scripted".to_string(),
            p if p.starts_with('/') => p.to_string(),
            p => format!("/home/scripted/{}", p),
        })
    }

    fn statvfs(&mut self, path: &Path) -> Result<Statvfs, ProtocolError> {
        let _busy = self.state.enter(&format!("statvfs:{}", path.display()));
        Ok(Statvfs {
            bsize: 4096,
            frsize: 4096,
            blocks: 1000,
            bfree: 250,
            bavail: 200,
            files: 64,
            ffree: 32,
            favail: 32,
            fsid: 7,
            flag: 0,
            namemax: 255,
        })
    }

    fn open_file(&mut self, path: &Path, mode: OpenMode, permissions: i32) -> Result<ScriptedFile, ProtocolError> {
        let _busy = self.state.enter(&format!(
            "open:{}:{:?}:{:o}",
            path.display(),
            mode,
            permissions
        ));
        let mut script = self.state.script();
        let file = match mode {
            OpenMode::Read => {
                let data = script.files.get(&key(path)).ok_or_else(|| sftp_missing(path))?;
                ScriptedFile {
                    state: self.state.clone(),
                    data: data.iter().copied().collect(),
                    entries: VecDeque::new(),
                    target: None,
                }
            }
            OpenMode::Write => {
                script.files.insert(key(path), Vec::new());
                ScriptedFile {
                    state: self.state.clone(),
                    data: VecDeque::new(),
                    entries: VecDeque::new(),
                    target: Some(key(path)),
                }
            }
        };
        Ok(file)
    }

    fn open_dir(&mut self, path: &Path) -> Result<ScriptedFile, ProtocolError> {
        let _busy = self.state.enter(&format!("opendir:{}", path.display()));
        Ok(ScriptedFile {
            state: self.state.clone(),
            data: VecDeque::new(),
            entries: self.state.script().dir_entries.iter().cloned().collect(),
            target: None,
        })
    }
}

pub(crate) struct ScriptedFile {
    state: Arc<ScriptState>,
    data: VecDeque<u8>,
    entries: VecDeque<RawDirEntry>,
    target: Option<String>,
}

impl FileBackend for ScriptedFile {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, ProtocolError> {
        let _busy = self.state.enter("file_read");
        let n = buf.len().min(self.data.len());
        for (slot, byte) in buf.iter_mut().zip(self.data.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, ProtocolError> {
        let _busy = self.state.enter("file_write");
        if let Some(target) = &self.target {
            if let Some(file) = self.state.script().files.get_mut(target) {
                file.extend_from_slice(data);
            }
        }
        Ok(data.len())
    }

    fn readdir(&mut self) -> Result<Option<RawDirEntry>, ProtocolError> {
        let _busy = self.state.enter("readdir");
        Ok(self.entries.pop_front())
    }
}

/// Delegate that records every event it sees.
#[derive(Default)]
pub(crate) struct Recorder {
    pub accept_host_key: bool,
    pub answer: String,
    events: Mutex<Vec<String>>,
    stdout: Mutex<Vec<u8>>,
    stderr: Mutex<Vec<u8>>,
}

impl Recorder {
    pub(crate) fn new(accept_host_key: bool) -> Arc<Self> {
        Arc::new(Self {
            accept_host_key,
            answer: "secret".to_string(),
            ..Default::default()
        })
    }

    pub(crate) fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    pub(crate) fn has(&self, prefix: &str) -> bool {
        self.events.lock().iter().any(|e| e.starts_with(prefix))
    }

    pub(crate) fn count(&self, prefix: &str) -> usize {
        self.events.lock().iter().filter(|e| e.starts_with(prefix)).count()
    }

    pub(crate) fn stdout(&self) -> Vec<u8> {
        self.stdout.lock().clone()
    }

    pub(crate) fn stderr(&self) -> Vec<u8> {
        self.stderr.lock().clone()
    }

    fn push(&self, event: String) {
        self.events.lock().push(event);
    }
}

impl SessionDelegate for Recorder {
    fn handshake(&self, host_key: &HostKey) -> bool {
        self.push(format!("handshake:{}", host_key.fingerprint));
        self.accept_host_key
    }

    fn keyboard_interactive(&self, prompt: &str) -> String {
        self.push(format!("prompt:{}", prompt));
        self.answer.clone()
    }

    fn authenticate(&self) {
        self.push("authenticate".to_string());
    }

    fn disconnect(&self, message: &str) {
        self.push(format!("disconnect:{}", message));
    }
}

impl ChannelDelegate for Recorder {
    fn stdout(&self, data: &[u8]) {
        self.stdout.lock().extend_from_slice(data);
    }

    fn stderr(&self, data: &[u8]) {
        self.stderr.lock().extend_from_slice(data);
    }

    fn connect(&self, online: bool) {
        self.push(format!("channel_connect:{}", online));
    }

    fn disconnect(&self) {
        self.push("channel_disconnect".to_string());
    }
}

/// A scripted session attached to one end of a socket pair.
pub(crate) struct Harness {
    pub session: Session<ScriptedSession>,
    pub state: Arc<ScriptState>,
    pub recorder: Arc<Recorder>,
    /// Far end of the library socket; write to it to make the socket readable
    pub peer: UnixStream,
}

pub(crate) async fn harness(script: Script, accept_host_key: bool) -> Harness {
    let state = ScriptState::with_script(script);
    let session = Session::with_connector(
        SshConfig::new("scripted", 22, "tester"),
        ScriptedConnector {
            state: state.clone(),
        },
    );
    let recorder = Recorder::new(accept_host_key);
    session.set_session_delegate(recorder.clone());
    session.set_channel_delegate(recorder.clone());

    let (ours, peer) = UnixStream::pair().expect("socket pair");
    session
        .connect_with(Transport::from_stream(ours, "scripted"))
        .await
        .expect("attach transport");
    Harness {
        session,
        state,
        recorder,
        peer,
    }
}

/// [`harness`] already through handshake and password authentication.
pub(crate) async fn authenticated(script: Script) -> Harness {
    let h = harness(script, true).await;
    h.session.handshake().await.expect("handshake");
    h.session
        .authenticate_password("secret")
        .await
        .expect("password auth");
    h
}
