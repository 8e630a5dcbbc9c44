//! Remote shell sessions over SSH and the per-host session registry
//!
//! All engine components talk to a host through the [`RemoteShell`] trait so
//! they can be exercised against `mock::ScriptedShell` in tests. Commands on
//! one shell run strictly one after another.

use crate::error::ConnectHint;
use crate::{EngineConfig, Error, HostAuth, HostCredential, Result};
use serde::{Deserialize, Serialize};
use ssh2::{Channel, Session};
use std::borrow::Cow;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use uuid::Uuid;

const HEREDOC_PREFIX: &str = "WG_REMOTE_EOF";

/// Output from a remote command execution
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Trimmed stdout, or `None` when the command failed or printed nothing
    pub fn text(&self) -> Option<&str> {
        let out = self.stdout.trim();
        if self.success() && !out.is_empty() {
            Some(out)
        } else {
            None
        }
    }
}

/// Quote a value for safe interpolation into a remote `sh` command
pub fn quote(value: &str) -> Cow<'_, str> {
    shell_escape::escape(Cow::Borrowed(value))
}

/// Build an `sh` command that writes `contents` to `path` via a quoted heredoc
///
/// Every call picks its own delimiter, so a generated script that itself
/// embeds heredocs can be uploaded through this path.
pub fn heredoc_write_command(path: &str, contents: &str, mode: u32) -> Result<String> {
    let delimiter = format!("{}_{}", HEREDOC_PREFIX, Uuid::new_v4().simple());
    heredoc_command(path, contents, mode, &delimiter)
}

fn heredoc_command(path: &str, contents: &str, mode: u32, delimiter: &str) -> Result<String> {
    if contents.lines().any(|l| l == delimiter) {
        return Err(Error::validation(format!(
            "Refusing to upload {}: contents contain the heredoc delimiter",
            path
        )));
    }
    let parent = Path::new(path)
        .parent()
        .and_then(|p| p.to_str())
        .filter(|p| !p.is_empty())
        .unwrap_or("/");
    let newline = if contents.ends_with('\n') { "" } else { "\n" };
    Ok(format!(
        "mkdir -p {dir} && cat > {file} <<'{delimiter}'\n{contents}{newline}{delimiter}\nchmod {mode:o} {file}",
        dir = quote(parent),
        file = quote(path),
    ))
}

/// A sequential command channel to one host
pub trait RemoteShell: Send + Sync {
    /// Identifier of the host this shell is bound to
    fn host_id(&self) -> &str;

    /// Run one command and capture its output
    fn exec(&self, command: &str) -> Result<CommandOutput>;

    /// Run a command that may outlast the ordinary command timeout
    fn exec_with_timeout(&self, command: &str, _timeout: Duration) -> Result<CommandOutput> {
        self.exec(command)
    }

    /// Write a whole file on the host, creating its parent directory
    fn write_file(&self, path: &str, contents: &str, mode: u32) -> Result<()> {
        let cmd = heredoc_write_command(path, contents, mode)?;
        let out = self.exec(&cmd)?;
        if !out.success() {
            return Err(Error::Io(std::io::Error::other(format!(
                "writing {} failed: {}",
                path,
                out.stderr.trim()
            ))));
        }
        Ok(())
    }

    /// Release the underlying connection
    fn disconnect(&self) {}
}

/// Shared handle to an open session
pub type SessionHandle = Arc<dyn RemoteShell>;

/// SSH-backed [`RemoteShell`]
pub struct SshShell {
    host_id: String,
    command_timeout: Duration,
    session: Mutex<Session>,
}

impl SshShell {
    /// Open and authenticate an SSH session for `credential`
    pub fn connect(credential: &HostCredential, config: &EngineConfig) -> Result<Self> {
        credential.validate().map_err(Error::validation)?;
        let host = credential.host.trim();
        let port = credential.port;
        let fail = |hint: ConnectHint, message: String| Error::Connection {
            host: host.to_string(),
            port,
            hint,
            message,
        };

        log::info!("connecting to {}:{} as {}", host, port, credential.username);

        let addrs: Vec<SocketAddr> = (host, port)
            .to_socket_addrs()
            .map_err(|e| fail(ConnectHint::Unresolvable, format!("DNS resolution failed: {}", e)))?
            .collect();
        if addrs.is_empty() {
            return Err(fail(
                ConnectHint::Unresolvable,
                "No addresses resolved".to_string(),
            ));
        }

        let timeout = Duration::from_secs(config.ssh.connect_timeout_secs);
        let mut last_err = None;
        let mut tcp = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => {
                    tcp = Some(stream);
                    break;
                }
                Err(e) => last_err = Some(e),
            }
        }
        let tcp = match tcp {
            Some(stream) => stream,
            None => {
                let (hint, message) = match last_err {
                    Some(e) => (classify_io_error(&e), e.to_string()),
                    None => (ConnectHint::Other, "no address reachable".to_string()),
                };
                return Err(fail(hint, message));
            }
        };

        let mut sess = Session::new()
            .map_err(|e| fail(ConnectHint::Other, format!("session init failed: {}", e)))?;
        sess.set_tcp_stream(tcp);
        sess.set_timeout(u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX));
        sess.handshake()
            .map_err(|e| fail(ConnectHint::Other, format!("handshake failed: {}", e)))?;

        match &credential.auth {
            HostAuth::Password { password } => {
                sess.userauth_password(&credential.username, password)
                    .map_err(|e| fail(ConnectHint::AuthenticationFailed, e.to_string()))?;
            }
            HostAuth::PrivateKey { path, passphrase } => {
                if !path.exists() {
                    return Err(fail(
                        ConnectHint::KeyRejected,
                        format!("private key file not found: {}", path.display()),
                    ));
                }
                sess.userauth_pubkey_file(&credential.username, None, path, passphrase.as_deref())
                    .map_err(|e| fail(ConnectHint::KeyRejected, e.to_string()))?;
            }
        }
        if !sess.authenticated() {
            let hint = match credential.auth {
                HostAuth::Password { .. } => ConnectHint::AuthenticationFailed,
                HostAuth::PrivateKey { .. } => ConnectHint::KeyRejected,
            };
            return Err(fail(hint, "server did not accept credentials".to_string()));
        }

        let command_timeout = Duration::from_secs(config.ssh.command_timeout_secs);
        sess.set_timeout(u32::try_from(command_timeout.as_millis()).unwrap_or(u32::MAX));

        log::info!("connected to {}:{}", host, port);
        Ok(Self {
            host_id: credential.id.clone(),
            command_timeout,
            session: Mutex::new(sess),
        })
    }

    fn session(&self) -> std::sync::MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Read stdout and stderr of a non-blocking channel side by side until EOF,
/// so a command that fills one stream never waits on the other
fn drain(channel: &mut Channel, timeout: Duration) -> Result<(Vec<u8>, Vec<u8>)> {
    let deadline = Instant::now() + timeout;
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut buf = [0u8; 16 * 1024];
    loop {
        let mut progressed = read_chunk(channel, &mut buf, &mut stdout)?;
        progressed |= read_chunk(&mut channel.stderr(), &mut buf, &mut stderr)?;
        if progressed {
            continue;
        }
        if channel.eof() {
            return Ok((stdout, stderr));
        }
        if Instant::now() >= deadline {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("command did not finish within {}s", timeout.as_secs()),
            )));
        }
        thread::sleep(Duration::from_millis(10));
    }
}

fn read_chunk(reader: &mut impl Read, buf: &mut [u8], out: &mut Vec<u8>) -> Result<bool> {
    match reader.read(buf) {
        Ok(0) => Ok(false),
        Ok(n) => {
            out.extend_from_slice(&buf[..n]);
            Ok(true)
        }
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(false),
        Err(e) => Err(e.into()),
    }
}

fn classify_io_error(e: &std::io::Error) -> ConnectHint {
    match e.kind() {
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => ConnectHint::TimedOut,
        std::io::ErrorKind::ConnectionRefused => ConnectHint::Refused,
        _ => ConnectHint::Other,
    }
}

impl RemoteShell for SshShell {
    fn host_id(&self) -> &str {
        &self.host_id
    }

    fn exec(&self, command: &str) -> Result<CommandOutput> {
        self.exec_with_timeout(command, self.command_timeout)
    }

    fn exec_with_timeout(&self, command: &str, timeout: Duration) -> Result<CommandOutput> {
        let sess = self.session();
        let mut channel = sess.channel_session()?;
        channel.exec(command)?;

        sess.set_blocking(false);
        let drained = drain(&mut channel, timeout);
        sess.set_blocking(true);
        let (stdout, stderr) = drained?;
        channel.wait_close()?;
        let exit_code = channel.exit_status()?;

        log::debug!(
            "[{}] exit={} stdout={}B stderr={}B: {}",
            self.host_id,
            exit_code,
            stdout.len(),
            stderr.len(),
            command.lines().next().unwrap_or_default()
        );
        Ok(CommandOutput {
            exit_code,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }

    fn write_file(&self, path: &str, contents: &str, mode: u32) -> Result<()> {
        if let Some(parent) = Path::new(path).parent().and_then(|p| p.to_str()) {
            if !parent.is_empty() {
                self.exec(&format!("mkdir -p {}", quote(parent)))?;
            }
        }
        let sess = self.session();
        let bytes = contents.as_bytes();
        let mut remote = sess.scp_send(Path::new(path), mode as i32, bytes.len() as u64, None)?;
        remote.write_all(bytes)?;
        remote.send_eof()?;
        remote.wait_eof()?;
        remote.close()?;
        remote.wait_close()?;
        log::debug!("[{}] uploaded {} ({}B)", self.host_id, path, bytes.len());
        Ok(())
    }

    fn disconnect(&self) {
        if let Err(e) = self.session().disconnect(None, "closing", None) {
            log::debug!("[{}] disconnect: {}", self.host_id, e);
        }
    }
}

/// Owns at most one live session per server id
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, SessionHandle>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn sessions(&self) -> std::sync::MutexGuard<'_, HashMap<String, SessionHandle>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Open a new SSH session, disposing any previous one for the same id
    pub fn connect(&self, credential: &HostCredential, config: &EngineConfig) -> Result<SessionHandle> {
        self.close(&credential.id);
        let shell: SessionHandle = Arc::new(SshShell::connect(credential, config)?);
        self.register(shell.clone());
        Ok(shell)
    }

    /// Install an already-open shell, disposing any previous one for its id
    pub fn register(&self, shell: SessionHandle) {
        let previous = self.sessions().insert(shell.host_id().to_string(), shell);
        if let Some(old) = previous {
            log::info!("replacing session for {}", old.host_id());
            old.disconnect();
        }
    }

    pub fn get(&self, host_id: &str) -> Result<SessionHandle> {
        self.sessions()
            .get(host_id)
            .cloned()
            .ok_or_else(|| Error::SessionNotFound(host_id.to_string()))
    }

    pub fn is_connected(&self, host_id: &str) -> bool {
        self.sessions().contains_key(host_id)
    }

    /// Close the session for `host_id`, returning whether one existed
    pub fn close(&self, host_id: &str) -> bool {
        let removed = self.sessions().remove(host_id);
        match removed {
            Some(shell) => {
                shell.disconnect();
                true
            }
            None => false,
        }
    }

    pub fn close_all(&self) {
        let drained: Vec<SessionHandle> = self.sessions().drain().map(|(_, s)| s).collect();
        for shell in drained {
            shell.disconnect();
        }
    }
}
