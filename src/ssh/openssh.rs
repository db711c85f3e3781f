//! External-binary SSH strategy (OpenSSH ControlMaster)
//!
//! # Flow
//!
//! 1. Spawn `ssh -N -o ControlMaster=yes -o ControlPath=...` as the master.
//! 2. Poll `ssh -O check` until the control socket answers, watching the
//!    child and its stderr for early death (auth rejection, unreachable
//!    host).
//! 3. Add and replace forwards with `ssh -O forward` / `ssh -O cancel`,
//!    run commands as one-shot `ssh` invocations over the same master.
//! 4. Tear down with `ssh -O exit`, escalating to SIGTERM and then kill.
//!
//! Passwords never touch the command line or a file. When one is already
//! known the connector serves it from a session-private prompt broker and
//! points `SSH_ASKPASS` at the relay helper; otherwise the first attempt
//! runs in batch mode so a rejection surfaces quickly and the caller can
//! prompt.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::broker::PromptBroker;
use crate::config::{AuthOverrides, SshTunnelConfig};
use crate::control::CommandOutput;
use crate::error::TunnelError;
use crate::prompt::StaticSecret;

use super::{looks_like_auth_failure, ForwardSpec, SshConnector, SshSession};

const MASTER_POLL_INTERVAL: Duration = Duration::from_millis(200);
const EXIT_GRACE: Duration = Duration::from_secs(3);
const TERM_GRACE: Duration = Duration::from_secs(2);

/// Name of the askpass relay binary shipped alongside the main one.
pub const ASKPASS_HELPER_NAME: &str = "lazytunnel-askpass";

/// How the master process obtains a password, if it needs one.
enum AskpassMode {
    /// `SSH_ASKPASS` relays the prompt to a broker socket.
    Relay { socket: PathBuf, helper: PathBuf },
    /// No prompting; key or agent auth only, fail fast otherwise.
    Batch,
}

/// Build the full argument list for the master process.
fn build_master_args(config: &SshTunnelConfig, mode: &AskpassMode, ctl_path: &Path) -> Vec<String> {
    let mut args = vec![
        "-N".to_string(),
        "-o".to_string(),
        "ControlMaster=yes".to_string(),
        "-o".to_string(),
        format!("ControlPath={}", ctl_path.display()),
        "-o".to_string(),
        "ExitOnForwardFailure=yes".to_string(),
        "-o".to_string(),
        "ServerAliveInterval=30".to_string(),
        "-o".to_string(),
        "ServerAliveCountMax=3".to_string(),
        "-o".to_string(),
        "StrictHostKeyChecking=accept-new".to_string(),
        "-o".to_string(),
        format!("ConnectTimeout={}", config.connect_timeout_secs),
    ];

    match mode {
        AskpassMode::Relay { .. } => {
            // One prompt per attempt; the retry loop lives in the worker,
            // not inside ssh.
            args.push("-o".to_string());
            args.push("NumberOfPasswordPrompts=1".to_string());
        }
        AskpassMode::Batch => {
            args.push("-o".to_string());
            args.push("BatchMode=yes".to_string());
        }
    }

    if let Some(key_path) = &config.key_path {
        args.push("-i".to_string());
        args.push(key_path.display().to_string());
        args.push("-o".to_string());
        args.push("IdentitiesOnly=yes".to_string());
    }

    args.push("-p".to_string());
    args.push(config.port.to_string());
    args.push("-l".to_string());
    args.push(config.username.clone());
    args.push(config.host.clone());
    args
}

/// Locate the askpass relay binary: explicit config, then a sibling of the
/// running binary, then bare name resolution through PATH.
fn resolve_helper(config: &SshTunnelConfig) -> PathBuf {
    if let Some(helper) = &config.askpass_helper {
        return helper.clone();
    }
    if let Ok(exe) = std::env::current_exe() {
        let sibling = exe.with_file_name(ASKPASS_HELPER_NAME);
        if sibling.exists() {
            return sibling;
        }
    }
    PathBuf::from(ASKPASS_HELPER_NAME)
}

/// Turn an early master exit into the right error.
fn classify_exit(status: Option<i32>, stderr: &str) -> TunnelError {
    let detail = stderr
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .unwrap_or("ssh exited without diagnostics")
        .trim()
        .to_string();
    if looks_like_auth_failure(stderr) {
        TunnelError::AuthFailed(detail)
    } else {
        match status {
            Some(code) => TunnelError::ConnectFailed(format!("ssh exited ({}): {}", code, detail)),
            None => TunnelError::ConnectFailed(format!("ssh killed by signal: {}", detail)),
        }
    }
}

/// Collect the child's stderr into a shared buffer, line by line.
fn spawn_stderr_collector(
    stderr: tokio::process::ChildStderr,
) -> Arc<parking_lot::Mutex<String>> {
    let buffer = Arc::new(parking_lot::Mutex::new(String::new()));
    let sink = buffer.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!("ssh: {}", line);
            let mut b = sink.lock();
            b.push_str(&line);
            b.push('\n');
        }
    });
    buffer
}

/// A session backed by an OpenSSH ControlMaster process.
struct OpensshSession {
    child: Child,
    ctl_path: PathBuf,
    host: String,
    port: u16,
    username: String,
    forward: Option<ForwardSpec>,
    // Keeps the control socket directory alive for the session.
    _ctl_dir: TempDir,
}

impl OpensshSession {
    /// Base invocation for anything multiplexed over the master.
    fn control_command(&self) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-o")
            .arg(format!("ControlPath={}", self.ctl_path.display()))
            .arg("-p")
            .arg(self.port.to_string())
            .arg("-l")
            .arg(&self.username)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }

    async fn control_op(&self, op: &str, flag: Option<&str>) -> Result<(), TunnelError> {
        let mut cmd = self.control_command();
        cmd.arg("-O").arg(op);
        if let Some(flag) = flag {
            cmd.arg("-L").arg(flag);
        }
        cmd.arg(&self.host);
        let output = cmd
            .output()
            .await
            .map_err(|e| TunnelError::ForwardFailed(format!("failed to run ssh -O {}: {}", op, e)))?;
        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(TunnelError::ForwardFailed(format!(
                "ssh -O {} failed: {}",
                op,
                stderr.trim()
            )))
        }
    }
}

#[async_trait]
impl SshSession for OpensshSession {
    async fn forward(&mut self, spec: &ForwardSpec) -> Result<(), TunnelError> {
        if let Some(old) = self.forward.take() {
            info!("cancelling forward {}", old.to_flag());
            if let Err(e) = self.control_op("cancel", Some(&old.to_flag())).await {
                // The master may have dropped it already; the new forward
                // request decides whether that matters.
                warn!("cancel of previous forward failed: {}", e);
            }
        }
        self.control_op("forward", Some(&spec.to_flag())).await?;
        info!("local forward established: {}", spec.to_flag());
        self.forward = Some(spec.clone());
        Ok(())
    }

    async fn run(&mut self, command: &str) -> Result<CommandOutput, TunnelError> {
        let mut cmd = self.control_command();
        cmd.arg("-o").arg("BatchMode=yes").arg(&self.host).arg("--").arg(command);
        let output = cmd
            .output()
            .await
            .map_err(|e| TunnelError::CommandFailed(format!("failed to run ssh: {}", e)))?;
        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_status: output.status.code(),
        })
    }

    async fn close(&mut self) -> Option<i32> {
        if self.control_op("exit", None).await.is_err() {
            debug!("ssh -O exit failed; falling back to signals");
        }

        if let Ok(Ok(status)) = tokio::time::timeout(EXIT_GRACE, self.child.wait()).await {
            debug!("ssh master exited: {}", status);
            return status.code();
        }

        #[cfg(unix)]
        if let Some(pid) = self.child.id() {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            warn!("ssh master ignored -O exit; sending SIGTERM to {}", pid);
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            if let Ok(Ok(status)) = tokio::time::timeout(TERM_GRACE, self.child.wait()).await {
                return status.code();
            }
        }

        warn!("killing unresponsive ssh master");
        let _ = self.child.kill().await;
        self.child.wait().await.ok().and_then(|s| s.code())
    }
}

/// Connector that drives the system `ssh` binary.
pub struct OpensshConnector;

impl OpensshConnector {
    /// Ask the master whether it is alive with `ssh -O check`.
    async fn master_alive(ctl_path: &Path, host: &str) -> bool {
        let result = Command::new("ssh")
            .arg("-o")
            .arg(format!("ControlPath={}", ctl_path.display()))
            .arg("-O")
            .arg("check")
            .arg(host)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        matches!(result, Ok(status) if status.success())
    }
}

#[async_trait]
impl SshConnector for OpensshConnector {
    async fn connect(
        &self,
        config: &SshTunnelConfig,
        overrides: &AuthOverrides,
    ) -> Result<Box<dyn SshSession>, TunnelError> {
        let ctl_dir = tempfile::Builder::new()
            .prefix("lazytunnel-ssh-")
            .tempdir()
            .map_err(|e| TunnelError::ConnectFailed(format!("cannot create control dir: {}", e)))?;
        let ctl_path = ctl_dir.path().join("ctl.sock");

        // A known password is served from a private, in-memory broker for
        // exactly this connection attempt; it is never written anywhere.
        let mut private_broker = None;
        let mode = if let Some(password) = overrides.effective_password(config) {
            let mut broker = PromptBroker::new(Arc::new(StaticSecret(password.to_string())));
            let socket = broker.start().await?;
            private_broker = Some(broker);
            AskpassMode::Relay { socket, helper: resolve_helper(config) }
        } else if let Some(socket) = &config.askpass_socket {
            AskpassMode::Relay { socket: socket.clone(), helper: resolve_helper(config) }
        } else {
            AskpassMode::Batch
        };

        let args = build_master_args(config, &mode, &ctl_path);
        info!(
            "starting ssh master for {}@{}:{}",
            config.username, config.host, config.port
        );
        debug!("ssh {}", args.join(" "));

        let mut cmd = Command::new("ssh");
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let AskpassMode::Relay { socket, helper } = &mode {
            // SSH_ASKPASS_REQUIRE=force (OpenSSH 8.4+) makes ssh use the
            // helper even with a tty attached; DISPLAY satisfies older
            // versions that refuse askpass without it.
            cmd.env("SSH_ASKPASS", helper)
                .env("SSH_ASKPASS_REQUIRE", "force")
                .env("LAZYTUNNEL_ASKPASS_SOCKET", socket);
            if std::env::var_os("DISPLAY").is_none() {
                cmd.env("DISPLAY", ":0");
            }
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| TunnelError::ConnectFailed(format!("cannot spawn ssh: {}", e)))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| TunnelError::ConnectFailed("ssh stderr unavailable".to_string()))?;
        let stderr_buf = spawn_stderr_collector(stderr);

        let deadline = Instant::now() + config.connect_timeout();
        let established = loop {
            if let Some(status) = child
                .try_wait()
                .map_err(|e| TunnelError::ConnectFailed(format!("cannot poll ssh: {}", e)))?
            {
                let stderr = stderr_buf.lock().clone();
                break Err(classify_exit(status.code(), &stderr));
            }
            if Self::master_alive(&ctl_path, &config.host).await {
                break Ok(());
            }
            if Instant::now() >= deadline {
                let _ = child.kill().await;
                break Err(TunnelError::ConnectFailed(format!(
                    "ssh master for {} not ready within {:?}",
                    config.host,
                    config.connect_timeout()
                )));
            }
            tokio::time::sleep(MASTER_POLL_INTERVAL).await;
        };

        // The password was consumed (or not); the private relay endpoint
        // has no further business existing.
        if let Some(mut broker) = private_broker {
            broker.stop().await;
        }
        established?;

        info!("ssh master ready for {}", config.host);
        Ok(Box::new(OpensshSession {
            child,
            ctl_path,
            host: config.host.clone(),
            port: config.port,
            username: config.username.clone(),
            forward: None,
            _ctl_dir: ctl_dir,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> SshTunnelConfig {
        SshTunnelConfig::new("bastion.internal").with_username("deploy")
    }

    fn relay_mode() -> AskpassMode {
        AskpassMode::Relay {
            socket: PathBuf::from("/tmp/x.sock"),
            helper: PathBuf::from("/usr/libexec/lazytunnel-askpass"),
        }
    }

    #[test]
    fn test_master_args_batch_mode() {
        let config = test_config();
        let args = build_master_args(&config, &AskpassMode::Batch, Path::new("/tmp/ctl"));

        assert_eq!(args[0], "-N");
        assert!(args.contains(&"ControlMaster=yes".to_string()));
        assert!(args.contains(&"ControlPath=/tmp/ctl".to_string()));
        assert!(args.contains(&"ExitOnForwardFailure=yes".to_string()));
        assert!(args.contains(&"StrictHostKeyChecking=accept-new".to_string()));
        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert!(!args.contains(&"NumberOfPasswordPrompts=1".to_string()));
        assert_eq!(args.last(), Some(&"bastion.internal".to_string()));
    }

    #[test]
    fn test_master_args_relay_limits_prompts() {
        let config = test_config();
        let args = build_master_args(&config, &relay_mode(), Path::new("/tmp/ctl"));

        assert!(args.contains(&"NumberOfPasswordPrompts=1".to_string()));
        assert!(!args.contains(&"BatchMode=yes".to_string()));
    }

    #[test]
    fn test_master_args_include_key() {
        let mut config = test_config();
        config.key_path = Some(PathBuf::from("/home/deploy/.ssh/id_ed25519"));
        let args = build_master_args(&config, &AskpassMode::Batch, Path::new("/tmp/ctl"));

        let i = args.iter().position(|a| a == "-i").unwrap();
        assert_eq!(args[i + 1], "/home/deploy/.ssh/id_ed25519");
        assert!(args.contains(&"IdentitiesOnly=yes".to_string()));
    }

    #[test]
    fn test_master_args_port_and_user() {
        let mut config = test_config();
        config.port = 2222;
        let args = build_master_args(&config, &AskpassMode::Batch, Path::new("/tmp/ctl"));

        let p = args.iter().position(|a| a == "-p").unwrap();
        assert_eq!(args[p + 1], "2222");
        let l = args.iter().position(|a| a == "-l").unwrap();
        assert_eq!(args[l + 1], "deploy");
    }

    #[test]
    fn test_resolve_helper_prefers_config() {
        let mut config = test_config();
        config.askpass_helper = Some(PathBuf::from("/opt/custom/askpass"));
        assert_eq!(resolve_helper(&config), PathBuf::from("/opt/custom/askpass"));
    }

    #[test]
    fn test_classify_exit_auth() {
        let err = classify_exit(Some(255), "deploy@bastion: Permission denied (password).\n");
        match err {
            TunnelError::AuthFailed(detail) => assert!(detail.contains("Permission denied")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_classify_exit_network() {
        let err = classify_exit(Some(255), "ssh: connect to host bastion: Connection refused\n");
        match err {
            TunnelError::ConnectFailed(detail) => {
                assert!(detail.contains("Connection refused"));
                assert!(detail.contains("255"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_classify_exit_silent() {
        let err = classify_exit(None, "");
        match err {
            TunnelError::ConnectFailed(detail) => assert!(detail.contains("signal")),
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
