//! Remote commands through the system `ssh` client, multiplexed over one control connection
//! per host.

use super::{
    AttemptFuture,
    Capability,
    Capture,
};
use crate::{
    catalog::{
        CapabilityKind,
        QueryDefinition,
        Request,
    },
    error::{
        AttemptError,
        SshError,
    },
    target::Target,
};
use cluster_diag_config::SshConfig;
use std::{
    path::{
        Path,
        PathBuf,
    },
    process::Stdio,
};
use temp_dir::TempDir;
use tokio::{
    io::AsyncWriteExt as _,
    process::Command,
    sync::OnceCell,
};

/// `ssh` reserves this exit status for its own errors.
const SSH_TRANSPORT_EXIT: i32 = 255;

/// A master connection to one host. Commands reuse it until [`SshSession::close`] or drop.
pub struct SshSession {
    binary: PathBuf,
    host: String,
    destination: String,
    port: u16,
    sudo: bool,
    sudo_password: Option<String>,
    socket: PathBuf,
    // Holds the control socket, removed on drop.
    _control_dir: TempDir,
    closed: bool,
}

impl std::fmt::Debug for SshSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshSession")
            .field("destination", &self.destination)
            .field("port", &self.port)
            .field("sudo", &self.sudo)
            .field("socket", &self.socket)
            .finish()
    }
}

impl SshSession {
    #[instrument(level = "debug", skip(config))]
    pub async fn open(config: &SshConfig, host: &str) -> Result<Self, SshError> {
        let binary = which::which("ssh")?;
        let control_dir = TempDir::new().map_err(|err| SshError::ControlDir(err.to_string()))?;
        let socket = control_dir.child("ctl");
        let destination = match &config.user {
            Some(user) => format!("{user}@{host}"),
            None => host.to_string(),
        };
        let sudo_password = if config.sudo {
            config.sudo_password().map_err(|err| SshError::Connect {
                host: host.to_string(),
                detail: err.to_string(),
            })?
        } else {
            None
        };

        // The master forks into the background, so its stderr goes to a file rather than a pipe
        // that would stay open for the lifetime of the connection.
        let log_path = control_dir.child("master.log");
        let log = std::fs::File::create(&log_path)?;

        let mut command = Command::new(&binary);
        command
            .args(master_args(config, &socket, &destination))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(log)
            .kill_on_drop(true);

        let timeout = config.connect_timeout() * 2;
        let status = tokio::time::timeout(timeout, command.status())
            .await
            .map_err(|_| SshError::ConnectTimeout {
                host: host.to_string(),
                timeout,
            })??;

        if !status.success() {
            let detail = std::fs::read_to_string(&log_path).unwrap_or_default();
            return Err(SshError::Connect {
                host: host.to_string(),
                detail: detail.trim().to_string(),
            });
        }

        debug!(%destination, "ssh session established");
        Ok(Self {
            binary,
            host: host.to_string(),
            destination,
            port: config.port,
            sudo: config.sudo,
            sudo_password,
            socket,
            _control_dir: control_dir,
            closed: false,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Runs `command` on the host. Exit status 255 and signals are transport failures, any other
    /// status is a capture.
    pub async fn run(&self, command: &str, expect_nonzero: bool) -> Result<Capture, AttemptError> {
        let remote = remote_command(command, self.sudo);
        let input = sudo_input(self.sudo, self.sudo_password.as_deref());
        let mut child = Command::new(&self.binary)
            .args(client_args(&self.socket, self.port, &self.destination))
            .arg(&remote)
            .stdin(if input.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| AttemptError::Transport(format!("cannot start ssh: {err}")))?;

        if let (Some(input), Some(mut stdin)) = (input, child.stdin.take()) {
            stdin
                .write_all(input.as_bytes())
                .await
                .map_err(|err| AttemptError::Transport(format!("cannot pass the sudo password: {err}")))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|err| AttemptError::Transport(format!("ssh did not finish: {err}")))?;

        match output.status.code() {
            None => Err(AttemptError::Transport("ssh was terminated by a signal".to_string())),
            Some(SSH_TRANSPORT_EXIT) => Err(AttemptError::Transport(format!(
                "ssh exited with status {SSH_TRANSPORT_EXIT}: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ))),
            Some(code) => Ok(Capture {
                body: combine_output(output.stdout, &output.stderr),
                http_status: None,
                exit_code: Some(code),
                success: code == 0 || expect_nonzero,
                detail: (code != 0).then(|| format!("exit status {code}")),
            }),
        }
    }

    /// Stops the master connection.
    pub async fn close(mut self) {
        self.closed = true;
        let result = Command::new(&self.binary)
            .args(exit_args(&self.socket, &self.destination))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        match result {
            Ok(status) if status.success() => debug!(destination = %self.destination, "ssh session closed"),
            Ok(status) => warn!(destination = %self.destination, %status, "ssh master did not exit cleanly"),
            Err(err) => warn!(destination = %self.destination, "Failed to stop ssh master: {err}"),
        }
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let _ = std::process::Command::new(&self.binary)
            .args(exit_args(&self.socket, &self.destination))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
    }
}

fn master_args(config: &SshConfig, socket: &Path, destination: &str) -> Vec<String> {
    let mut args = vec![
        "-M".to_string(),
        "-N".to_string(),
        "-f".to_string(),
        "-S".to_string(),
        socket.display().to_string(),
        "-o".to_string(),
        "ControlPersist=yes".to_string(),
        "-o".to_string(),
        "BatchMode=yes".to_string(),
        "-o".to_string(),
        format!("ConnectTimeout={}", config.connect_timeout_secs),
        "-p".to_string(),
        config.port.to_string(),
    ];
    if let Some(key) = &config.key_file {
        args.extend(["-i".to_string(), key.display().to_string()]);
        args.extend(["-o".to_string(), "IdentitiesOnly=yes".to_string()]);
    }
    match (&config.known_hosts_file, config.trust_remote) {
        (Some(file), _) => args.extend(["-o".to_string(), format!("UserKnownHostsFile={}", file.display())]),
        (None, true) => args.extend(["-o".to_string(), "UserKnownHostsFile=/dev/null".to_string()]),
        (None, false) => {}
    }
    let checking = if config.trust_remote { "no" } else { "yes" };
    args.extend(["-o".to_string(), format!("StrictHostKeyChecking={checking}")]);
    args.push(destination.to_string());
    args
}

fn client_args(socket: &Path, port: u16, destination: &str) -> Vec<String> {
    vec![
        "-S".to_string(),
        socket.display().to_string(),
        "-o".to_string(),
        "ControlMaster=no".to_string(),
        "-o".to_string(),
        "BatchMode=yes".to_string(),
        "-p".to_string(),
        port.to_string(),
        destination.to_string(),
        "--".to_string(),
    ]
}

fn exit_args(socket: &Path, destination: &str) -> Vec<String> {
    vec![
        "-S".to_string(),
        socket.display().to_string(),
        "-O".to_string(),
        "exit".to_string(),
        destination.to_string(),
    ]
}

/// The sudo password, if any, arrives on stdin, never on the command line.
fn remote_command(command: &str, sudo: bool) -> String {
    if sudo {
        format!("sudo -S -p '' {command}")
    } else {
        command.to_string()
    }
}

/// What the remote command reads on stdin. Without sudo the password is never sent.
fn sudo_input(sudo: bool, password: Option<&str>) -> Option<String> {
    password.filter(|_| sudo).map(|password| format!("{password}\n"))
}

fn combine_output(mut stdout: Vec<u8>, stderr: &[u8]) -> Vec<u8> {
    if !stderr.is_empty() {
        if !stdout.is_empty() && !stdout.ends_with(b"\n") {
            stdout.push(b'\n');
        }
        stdout.extend_from_slice(b"--- stderr ---\n");
        stdout.extend_from_slice(stderr);
    }
    stdout
}

/// SSH capability of one target's collector. The session opens on first use and a failure to
/// open it is remembered, so later queries fail fast.
pub struct SshBackend {
    config: SshConfig,
    host: String,
    session: OnceCell<Result<SshSession, String>>,
}

impl SshBackend {
    pub fn new(config: SshConfig, host: impl Into<String>) -> Self {
        Self {
            config,
            host: host.into(),
            session: OnceCell::new(),
        }
    }

    async fn session(&self) -> Result<&SshSession, AttemptError> {
        let session = self
            .session
            .get_or_init(|| async {
                SshSession::open(&self.config, &self.host).await.map_err(|err| {
                    warn!(host = %self.host, "{err}");
                    err.to_string()
                })
            })
            .await;
        session
            .as_ref()
            .map_err(|err| AttemptError::Unavailable(format!("ssh session unavailable: {err}")))
    }

    /// Closes the session if one was opened.
    pub async fn close(self) {
        if let Some(Ok(session)) = self.session.into_inner() {
            session.close().await;
        }
    }
}

impl Capability for SshBackend {
    fn kind(&self) -> CapabilityKind {
        CapabilityKind::Ssh
    }

    fn attempt<'a>(&'a self, query: &'a QueryDefinition, rendered: &'a str, _target: &'a Target) -> AttemptFuture<'a> {
        Box::pin(async move {
            if !matches!(query.request, Request::Ssh { .. }) {
                return Err(AttemptError::Request(format!("{} is not a remote command", query.name)));
            }
            let session = self.session().await?;
            trace!(host = %session.host(), command = rendered, "running remote command");
            session.run(rendered, query.expect_nonzero).await
        })
    }
}
