//! Tunnel lifecycle controller
//!
//! # Flow
//!
//! The controller brings a tunnel up in a fixed order: wire the credential
//! broker (when the backend needs one), spawn the worker and wait for its
//! startup handshake, connect, open the forward, then poll the local port
//! until it accepts connections. Teardown runs the same order backwards:
//! `Shutdown` over the channel, wait for `Ok` and `Exited`, reap the worker
//! task, stop the broker.
//!
//! While a `Connect` is outstanding the worker may ask for a password with
//! `AuthRequired`; the controller answers from its [`SecretPrompt`] without
//! blocking the runtime.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::broker::PromptBroker;
use crate::config::{SshBackendKind, SshTunnelConfig};
use crate::control::{CommandOutput, ControlChannel, ControlMessage};
use crate::error::TunnelError;
use crate::prompt::{SecretPrompt, TerminalPrompt};
use crate::ssh::{connector_for, SshConnector};
use crate::worker::{spawn_worker_with_connector, WorkerHandle};

const PORT_POLL_TIMEOUT: Duration = Duration::from_millis(500);
const PORT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Deadlines for the controller's interactions with the worker and the
/// local endpoint.
#[derive(Debug, Clone)]
pub struct Timeouts {
    /// Worker spawn to `Started`.
    pub worker_start: Duration,
    /// Each reply while a `Connect` is outstanding. Generous because a
    /// human may be typing a password.
    pub auth_reply: Duration,
    /// Replies to ordinary requests.
    pub request: Duration,
    /// The whole shutdown handshake, and the worker join after it.
    pub shutdown: Duration,
    /// Local port readiness after the forward is up.
    pub ready: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            worker_start: Duration::from_secs(5),
            auth_reply: Duration::from_secs(60),
            request: Duration::from_secs(30),
            shutdown: Duration::from_secs(3),
            ready: Duration::from_secs(15),
        }
    }
}

/// Owner of one tunnel: its worker task, its control channel, and the
/// credential broker when one is wired in.
pub struct TunnelController {
    config: SshTunnelConfig,
    channel: ControlChannel,
    worker: Option<WorkerHandle>,
    broker: Option<PromptBroker>,
    prompt: Arc<dyn SecretPrompt>,
    timeouts: Timeouts,
}

impl TunnelController {
    /// Bring a tunnel fully up: spawn, connect, forward, wait for the local
    /// port. Prompts on the terminal if the server wants a password.
    pub async fn start(config: SshTunnelConfig) -> Result<Self, TunnelError> {
        Self::start_with(config, Arc::new(TerminalPrompt), Timeouts::default()).await
    }

    /// [`start`](Self::start) with an explicit prompt and deadlines.
    pub async fn start_with(
        config: SshTunnelConfig,
        prompt: Arc<dyn SecretPrompt>,
        timeouts: Timeouts,
    ) -> Result<Self, TunnelError> {
        let mut controller = Self::spawn_with(config, prompt, timeouts).await?;
        match controller.bring_up().await {
            Ok(()) => Ok(controller),
            Err(e) => {
                controller.stop().await;
                Err(e)
            }
        }
    }

    async fn bring_up(&mut self) -> Result<(), TunnelError> {
        self.connect().await?;
        self.forward().await?;
        self.wait_ready().await?;
        info!("tunnel ready on {}", self.local_addr());
        Ok(())
    }

    /// Spawn the worker (and broker, when the backend calls for one)
    /// without connecting yet.
    pub async fn spawn_with(
        mut config: SshTunnelConfig,
        prompt: Arc<dyn SecretPrompt>,
        timeouts: Timeouts,
    ) -> Result<Self, TunnelError> {
        // The external backend prompts through an askpass socket rather
        // than the control channel's auth exchange. Serve one from this
        // process unless the config already points at an endpoint.
        let mut broker = None;
        if config.backend == SshBackendKind::Openssh
            && config.askpass_socket.is_none()
            && prompt.is_interactive()
        {
            let mut b = PromptBroker::new(prompt.clone());
            let socket = b.start().await?;
            debug!("credential broker listening on {}", socket.display());
            config.askpass_socket = Some(socket);
            broker = Some(b);
        }

        let connector: Arc<dyn SshConnector> = Arc::from(connector_for(&config));
        match Self::spawn_with_connector(config, connector, prompt, timeouts).await {
            Ok(mut controller) => {
                controller.broker = broker;
                Ok(controller)
            }
            Err(e) => {
                if let Some(mut b) = broker {
                    b.stop().await;
                }
                Err(e)
            }
        }
    }

    /// Spawn around an explicit connector. No broker wiring happens here.
    pub async fn spawn_with_connector(
        config: SshTunnelConfig,
        connector: Arc<dyn SshConnector>,
        prompt: Arc<dyn SecretPrompt>,
        timeouts: Timeouts,
    ) -> Result<Self, TunnelError> {
        let (worker, mut channel) = spawn_worker_with_connector(config.clone(), connector);
        match await_startup(&mut channel, timeouts.worker_start).await {
            Ok(pid) => debug!("worker running (pid {})", pid),
            Err(e) => {
                worker.abort();
                return Err(e);
            }
        }
        Ok(Self {
            config,
            channel,
            worker: Some(worker),
            broker: None,
            prompt,
            timeouts,
        })
    }

    /// Establish the SSH session, answering password prompts as they come.
    pub async fn connect(&mut self) -> Result<(), TunnelError> {
        self.channel.send(ControlMessage::Connect).await?;
        loop {
            match self
                .channel
                .recv_timeout(self.timeouts.auth_reply, "connect")
                .await?
            {
                ControlMessage::Ok { .. } => return Ok(()),
                ControlMessage::Error { message } => return Err(classify_worker_error(message)),
                ControlMessage::AuthRequired => {
                    let secret = self.obtain_secret().await;
                    self.channel
                        .send(ControlMessage::AuthResponse { secret })
                        .await?;
                }
                other => return Err(TunnelError::UnknownMessage(other.tag().to_string())),
            }
        }
    }

    /// Open the forward the config describes.
    pub async fn forward(&mut self) -> Result<(), TunnelError> {
        let (remote_host, remote_port) = (self.config.remote_host.clone(), self.config.remote_port);
        self.forward_to(&remote_host, remote_port).await
    }

    /// Open (or replace) the forward to an explicit remote endpoint, keeping
    /// the configured local one.
    pub async fn forward_to(
        &mut self,
        remote_host: &str,
        remote_port: u16,
    ) -> Result<(), TunnelError> {
        self.request(
            ControlMessage::Forward {
                local_host: self.config.local_host.clone(),
                local_port: self.config.local_port,
                remote_host: remote_host.to_string(),
                remote_port,
            },
            "forward",
        )
        .await?;
        Ok(())
    }

    /// Run a command on the remote host.
    pub async fn run_command(&mut self, command: &str) -> Result<CommandOutput, TunnelError> {
        let payload = self
            .request(
                ControlMessage::RunCommand {
                    command: command.to_string(),
                },
                "run_command",
            )
            .await?;
        parse_output(payload)
    }

    /// The remote account's home directory.
    pub async fn get_home(&mut self) -> Result<String, TunnelError> {
        let payload = self.request(ControlMessage::GetHome, "get_home").await?;
        payload
            .as_ref()
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| TunnelError::Worker("home reply carried no path".to_string()))
    }

    /// Poll the local endpoint until it accepts a TCP connection.
    pub async fn wait_ready(&self) -> Result<(), TunnelError> {
        wait_for_local_port(&self.local_addr(), self.timeouts.ready).await
    }

    /// Tear the tunnel down in order, returning the session's exit code when
    /// the worker reported one. Always reaps the worker and the broker, even
    /// when the handshake goes sideways.
    pub async fn stop(mut self) -> Option<i32> {
        let mut code = None;
        if self.channel.send(ControlMessage::Shutdown).await.is_ok() {
            loop {
                match self
                    .channel
                    .recv_timeout(self.timeouts.shutdown, "shutdown")
                    .await
                {
                    Ok(ControlMessage::Ok { .. }) => continue,
                    Ok(ControlMessage::Exited { code: c }) => {
                        code = Some(c);
                        break;
                    }
                    Ok(other) => {
                        warn!("unexpected {} during shutdown", other.tag());
                        continue;
                    }
                    Err(e) => {
                        debug!("shutdown handshake ended early: {}", e);
                        break;
                    }
                }
            }
        }

        if let Some(worker) = self.worker.take() {
            if !worker.join(self.timeouts.shutdown).await {
                warn!("worker task aborted during shutdown");
            }
        }
        if let Some(mut broker) = self.broker.take() {
            broker.stop().await;
        }
        info!("tunnel stopped (code {:?})", code);
        code
    }

    /// The local endpoint as `host:port`.
    pub fn local_addr(&self) -> String {
        self.config.local_addr()
    }

    pub fn config(&self) -> &SshTunnelConfig {
        &self.config
    }

    /// Whether the worker task is still running.
    pub fn is_worker_alive(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }

    /// One request, one reply.
    async fn request(
        &mut self,
        msg: ControlMessage,
        op: &'static str,
    ) -> Result<Option<Value>, TunnelError> {
        self.channel.send(msg).await?;
        match self.channel.recv_timeout(self.timeouts.request, op).await? {
            ControlMessage::Ok { payload } => Ok(payload),
            ControlMessage::Error { message } => Err(classify_worker_error(message)),
            other => Err(TunnelError::UnknownMessage(other.tag().to_string())),
        }
    }

    /// Ask the prompt for a password off the runtime, held to the
    /// `auth_reply` deadline. An absent, cancelled, or overdue answer becomes
    /// the empty secret, which the worker reads as declined.
    async fn obtain_secret(&self) -> String {
        let prompt = self.prompt.clone();
        let text = format!("{}@{}'s password: ", self.config.username, self.config.host);
        let read = tokio::task::spawn_blocking(move || prompt.read_secret(&text, false));
        match tokio::time::timeout(self.timeouts.auth_reply, read).await {
            Ok(answer) => answer.ok().flatten().unwrap_or_default(),
            Err(_) => {
                warn!(
                    "no password entered within {:?}; treating the prompt as declined",
                    self.timeouts.auth_reply
                );
                String::new()
            }
        }
    }
}

/// Wait for the worker's `Started` handshake.
async fn await_startup(
    channel: &mut ControlChannel,
    deadline: Duration,
) -> Result<u32, TunnelError> {
    match channel.recv_timeout(deadline, "worker startup").await {
        Ok(ControlMessage::Started { pid }) => Ok(pid),
        Ok(other) => Err(TunnelError::UnknownMessage(other.tag().to_string())),
        Err(TunnelError::RequestTimeout(_)) => Err(TunnelError::WorkerStartTimeout(deadline)),
        Err(e) => Err(e),
    }
}

/// Re-raise a worker `Error` reply as the typed failure it describes, where
/// the message identifies one.
fn classify_worker_error(message: String) -> TunnelError {
    if message == "SSH not connected" {
        return TunnelError::NotConnected;
    }
    if let Some(tag) = message.strip_prefix("Unknown message: ") {
        return TunnelError::UnknownMessage(tag.to_string());
    }
    if let Some(reason) = message.strip_prefix("Authentication declined: ") {
        return TunnelError::AuthDeclined(reason.to_string());
    }
    TunnelError::Worker(message)
}

/// Decode a `run_command` payload.
fn parse_output(payload: Option<Value>) -> Result<CommandOutput, TunnelError> {
    let value = payload.ok_or_else(|| {
        TunnelError::Worker("command reply carried no output".to_string())
    })?;
    serde_json::from_value(value)
        .map_err(|e| TunnelError::Worker(format!("malformed command output: {}", e)))
}

/// Poll `addr` until a TCP connect succeeds or `deadline` passes.
pub async fn wait_for_local_port(addr: &str, deadline: Duration) -> Result<(), TunnelError> {
    let start = tokio::time::Instant::now();
    loop {
        if let Ok(Ok(_stream)) =
            tokio::time::timeout(PORT_POLL_TIMEOUT, TcpStream::connect(addr)).await
        {
            debug!("{} accepted a connection after {:?}", addr, start.elapsed());
            return Ok(());
        }
        if start.elapsed() >= deadline {
            return Err(TunnelError::ReadinessTimeout {
                addr: addr.to_string(),
                waited: start.elapsed(),
            });
        }
        tokio::time::sleep(PORT_POLL_INTERVAL).await;
    }
}
