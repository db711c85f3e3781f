//! SSH worker task
//!
//! # Flow
//!
//! The worker owns the SSH session; the controller owns everything else.
//! Right after spawn the worker sends `Started` as a liveness handshake,
//! then serves the control channel: one request at a time, one reply per
//! request. `Connect` may interleave an `AuthRequired` / `AuthResponse`
//! exchange before its reply while the credential retry loop runs; a
//! password accepted there stays with the worker, so a later `Connect`
//! reuses it unprompted.
//!
//! `Shutdown` answers `Ok`, then `Exited`, then ends the task. A dropped
//! controller ends the task too, closing the session on the way out.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{AuthOverrides, SshTunnelConfig};
use crate::control::{ControlChannel, ControlMessage};
use crate::error::TunnelError;
use crate::ssh::{connector_for, ForwardSpec, SshConnector, SshSession};

/// Most connection attempts a single `Connect` will make. The first runs
/// with whatever credentials are already on hand; each retry is preceded
/// by exactly one password prompt.
pub const AUTH_MAX_ATTEMPTS: u32 = 3;

/// Owner handle for a spawned worker task.
pub struct WorkerHandle {
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Wait up to `deadline` for the worker to finish. Returns whether it
    /// did; an overrunning worker is aborted.
    pub async fn join(mut self, deadline: Duration) -> bool {
        match tokio::time::timeout(deadline, &mut self.task).await {
            Ok(_) => true,
            Err(_) => {
                warn!("worker did not stop within {:?}; aborting", deadline);
                self.task.abort();
                false
            }
        }
    }

    pub fn abort(&self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Spawn a worker for `config` with the backend its config names.
pub fn spawn_worker(config: SshTunnelConfig) -> (WorkerHandle, ControlChannel) {
    let connector: Arc<dyn SshConnector> = Arc::from(connector_for(&config));
    spawn_worker_with_connector(config, connector)
}

/// Spawn a worker around an explicit connector. Seam for tests and for
/// callers composing their own backend.
pub fn spawn_worker_with_connector(
    config: SshTunnelConfig,
    connector: Arc<dyn SshConnector>,
) -> (WorkerHandle, ControlChannel) {
    let (controller_end, worker_end) = ControlChannel::pair();
    let task = tokio::spawn(serve(config, connector, worker_end));
    (WorkerHandle { task }, controller_end)
}

async fn serve(config: SshTunnelConfig, connector: Arc<dyn SshConnector>, mut channel: ControlChannel) {
    if channel
        .send(ControlMessage::Started { pid: std::process::id() })
        .await
        .is_err()
    {
        debug!("controller gone before the startup handshake");
        return;
    }

    // Passwords learned through prompt retries accumulate here for the
    // worker's whole lifetime, so a reconnect reuses them instead of
    // prompting again.
    let mut session: Option<Box<dyn SshSession>> = None;
    let mut overrides = AuthOverrides::default();

    loop {
        let msg = match channel.recv().await {
            Ok(msg) => msg,
            Err(_) => {
                debug!("control channel closed; ending worker");
                break;
            }
        };
        debug!("worker handling {}", msg.tag());

        let reply = match msg {
            ControlMessage::Connect => {
                if let Some(mut old) = session.take() {
                    debug!("closing previous session before reconnect");
                    old.close().await;
                }
                match connect_with_retry(&config, connector.as_ref(), &mut overrides, &mut channel).await {
                    Ok(new_session) => {
                        session = Some(new_session);
                        ControlMessage::ok()
                    }
                    Err(TunnelError::ChannelClosed) => break,
                    Err(e) => {
                        warn!("connect failed: {}", e);
                        ControlMessage::error(e.to_string())
                    }
                }
            }
            ControlMessage::Forward {
                local_host,
                local_port,
                remote_host,
                remote_port,
            } => {
                let spec = ForwardSpec {
                    local_host,
                    local_port,
                    remote_host,
                    remote_port,
                };
                match session.as_mut() {
                    Some(s) => match s.forward(&spec).await {
                        Ok(()) => ControlMessage::ok(),
                        Err(e) => {
                            warn!("forward failed: {}", e);
                            ControlMessage::error(e.to_string())
                        }
                    },
                    None => ControlMessage::error(TunnelError::NotConnected.to_string()),
                }
            }
            ControlMessage::RunCommand { command } => match session.as_mut() {
                Some(s) => match s.run(&command).await {
                    Ok(output) => ControlMessage::ok_with(&output),
                    Err(e) => ControlMessage::error(e.to_string()),
                },
                None => ControlMessage::error(TunnelError::NotConnected.to_string()),
            },
            ControlMessage::GetHome => match session.as_mut() {
                Some(s) => match resolve_home(s.as_mut()).await {
                    Ok(home) => ControlMessage::ok_with(&home),
                    Err(e) => ControlMessage::error(e.to_string()),
                },
                None => ControlMessage::error(TunnelError::NotConnected.to_string()),
            },
            ControlMessage::Shutdown => {
                let code = match session.take() {
                    Some(mut s) => s.close().await.unwrap_or(0),
                    None => 0,
                };
                let _ = channel.send(ControlMessage::ok()).await;
                let _ = channel.send(ControlMessage::Exited { code }).await;
                info!("worker shut down (code {})", code);
                return;
            }
            other => {
                warn!("unexpected {} on control channel", other.tag());
                ControlMessage::error(TunnelError::UnknownMessage(other.tag().to_string()).to_string())
            }
        };

        if channel.send(reply).await.is_err() {
            break;
        }
    }

    // The controller vanished mid-session.
    let code = match session.take() {
        Some(mut s) => s.close().await.unwrap_or(0),
        None => 0,
    };
    let _ = channel.send(ControlMessage::Exited { code }).await;
}

/// Drive connection attempts, prompting through the channel between them.
/// Only credential-family failures earn a prompt and a retry; anything else
/// surfaces immediately. `overrides` outlives the call: passwords gathered
/// here stay merged for later connects on the same worker.
async fn connect_with_retry(
    config: &SshTunnelConfig,
    connector: &dyn SshConnector,
    overrides: &mut AuthOverrides,
    channel: &mut ControlChannel,
) -> Result<Box<dyn SshSession>, TunnelError> {
    let mut attempt: u32 = 1;

    loop {
        match connector.connect(config, overrides).await {
            Ok(session) => return Ok(session),
            Err(e) if e.is_auth_failure() => {
                warn!("authentication attempt {} failed: {}", attempt, e);
                if attempt >= AUTH_MAX_ATTEMPTS {
                    return Err(TunnelError::AuthExhausted { attempts: attempt });
                }
                channel.send(ControlMessage::AuthRequired).await?;
                let secret = match channel.recv().await? {
                    ControlMessage::AuthResponse { secret } => secret,
                    other => {
                        return Err(TunnelError::UnknownMessage(other.tag().to_string()));
                    }
                };
                if secret.is_empty() {
                    return Err(TunnelError::AuthDeclined("no password provided".to_string()));
                }
                overrides.merge_password(secret);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// `$HOME` of the remote account, via the session's command path.
async fn resolve_home(session: &mut dyn SshSession) -> Result<String, TunnelError> {
    let output = session.run("echo $HOME").await?;
    let home = output.stdout.trim();
    if home.is_empty() {
        return Err(TunnelError::CommandFailed(format!(
            "home directory query produced no output (stderr: {})",
            output.stderr.trim()
        )));
    }
    Ok(home.to_string())
}
