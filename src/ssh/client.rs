//! Library-mediated SSH strategy (russh)
//!
//! # Architecture
//!
//! Only one task owns the russh `Handle`. The session object and the
//! forward listener reach it through a cloneable [`SessionController`]
//! that sends commands over an mpsc channel, which keeps the handle free
//! of locks held across `.await` and protocol violations from concurrent
//! access. The forward listener is its own task: a local `TcpListener`
//! accept loop that bridges each connection onto a direct-tcpip channel.

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle, Msg};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::PublicKey;
use russh::{Channel, ChannelMsg};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{AuthOverrides, SshTunnelConfig};
use crate::control::CommandOutput;
use crate::error::TunnelError;

use super::{ForwardSpec, SshConnector, SshSession};

const SESSION_CHANNEL_DEPTH: usize = 64;
const LISTENER_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Statistics for a running port forward.
#[derive(Debug, Clone, Default)]
pub struct ForwardStats {
    /// Total connections handled.
    pub connection_count: u64,
    /// Connections open right now.
    pub active_connections: u64,
    /// Bytes local -> remote.
    pub bytes_sent: u64,
    /// Bytes remote -> local.
    pub bytes_received: u64,
}

/// Commands sent to the handle owner task.
enum SessionCommand {
    OpenDirectTcpip {
        host: String,
        port: u32,
        originator_host: String,
        originator_port: u32,
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },
    Exec {
        command: String,
        reply_tx: oneshot::Sender<Result<CommandOutput, TunnelError>>,
    },
    Disconnect,
}

/// Cloneable command side of the handle owner task. Anything holding one
/// has full session control, so it stays crate-private.
#[derive(Clone)]
struct SessionController {
    cmd_tx: mpsc::Sender<SessionCommand>,
    disconnect_tx: broadcast::Sender<()>,
}

impl SessionController {
    fn subscribe_disconnect(&self) -> broadcast::Receiver<()> {
        self.disconnect_tx.subscribe()
    }

    async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u32,
        originator_host: &str,
        originator_port: u32,
    ) -> Result<Channel<Msg>, TunnelError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(SessionCommand::OpenDirectTcpip {
                host: host.to_string(),
                port,
                originator_host: originator_host.to_string(),
                originator_port,
                reply_tx,
            })
            .await
            .map_err(|_| TunnelError::NotConnected)?;
        reply_rx
            .await
            .map_err(|_| TunnelError::NotConnected)?
            .map_err(|e| TunnelError::ForwardFailed(e.to_string()))
    }

    async fn exec(&self, command: &str) -> Result<CommandOutput, TunnelError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(SessionCommand::Exec {
                command: command.to_string(),
                reply_tx,
            })
            .await
            .map_err(|_| TunnelError::NotConnected)?;
        reply_rx.await.map_err(|_| TunnelError::NotConnected)?
    }

    /// Ask the owner task to disconnect and wait for it to wind down.
    async fn disconnect(&self) {
        let _ = self.cmd_tx.send(SessionCommand::Disconnect).await;
        // The owner task closes its receiver on the way out.
        let _ = tokio::time::timeout(Duration::from_secs(2), self.cmd_tx.closed()).await;
    }
}

/// Spawn the handle owner task. Consumes the handle; returns the command
/// side.
fn spawn_session_owner(handle: Handle<ClientHandler>, label: String) -> SessionController {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<SessionCommand>(SESSION_CHANNEL_DEPTH);
    let (disconnect_tx, _) = broadcast::channel::<()>(1);
    let disconnect_tx_task = disconnect_tx.clone();

    tokio::spawn(async move {
        let mut handle = handle; // sole owner from here on
        debug!("session owner task started for {}", label);

        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                SessionCommand::OpenDirectTcpip {
                    host,
                    port,
                    originator_host,
                    originator_port,
                    reply_tx,
                } => {
                    let result = handle
                        .channel_open_direct_tcpip(&host, port, &originator_host, originator_port)
                        .await;
                    if reply_tx.send(result).is_err() {
                        warn!("caller dropped before receiving direct-tcpip channel");
                        // The channel drops here; the server closes its side.
                    }
                }
                SessionCommand::Exec { command, reply_tx } => {
                    let result = run_remote_command(&mut handle, &command).await;
                    let _ = reply_tx.send(result);
                }
                SessionCommand::Disconnect => break,
            }
        }

        // Cleanup: tell the forward listener first, then fail whatever is
        // still queued, then say goodbye to the server.
        let _ = disconnect_tx_task.send(());
        drain_pending_commands(&mut cmd_rx);
        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "Tunnel closed", "en")
            .await;
        debug!("session owner task terminated for {}", label);
    });

    SessionController { cmd_tx, disconnect_tx }
}

/// Fail all queued commands with a disconnected error.
fn drain_pending_commands(cmd_rx: &mut mpsc::Receiver<SessionCommand>) {
    cmd_rx.close();
    while let Ok(cmd) = cmd_rx.try_recv() {
        match cmd {
            SessionCommand::OpenDirectTcpip { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            SessionCommand::Exec { reply_tx, .. } => {
                let _ = reply_tx.send(Err(TunnelError::NotConnected));
            }
            SessionCommand::Disconnect => {}
        }
    }
}

/// Run one command over a fresh session channel and collect its output.
async fn run_remote_command(
    handle: &mut Handle<ClientHandler>,
    command: &str,
) -> Result<CommandOutput, TunnelError> {
    let mut channel = handle
        .channel_open_session()
        .await
        .map_err(|e| TunnelError::CommandFailed(e.to_string()))?;
    channel
        .exec(true, command)
        .await
        .map_err(|e| TunnelError::CommandFailed(e.to_string()))?;

    let mut output = CommandOutput::default();
    loop {
        let Some(msg) = channel.wait().await else {
            break;
        };
        match msg {
            ChannelMsg::Data { data } => {
                output.stdout.push_str(&String::from_utf8_lossy(&data));
            }
            ChannelMsg::ExtendedData { data, ext } if ext == 1 => {
                output.stderr.push_str(&String::from_utf8_lossy(&data));
            }
            ChannelMsg::ExitStatus { exit_status } => {
                output.exit_status = Some(exit_status as i32);
            }
            ChannelMsg::Close => break,
            _ => {}
        }
    }
    Ok(output)
}

/// Handle to a running forward listener task.
struct ForwardGuard {
    bound_addr: SocketAddr,
    stop_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
    stats: Arc<parking_lot::RwLock<ForwardStats>>,
}

impl ForwardGuard {
    /// Stop the accept loop and wait for the task, so the port is provably
    /// free before a replacement bind.
    async fn close(mut self) {
        let _ = self.stop_tx.send(()).await;
        if tokio::time::timeout(LISTENER_CLOSE_TIMEOUT, &mut self.task)
            .await
            .is_err()
        {
            warn!("forward listener on {} did not stop in time; aborting", self.bound_addr);
            self.task.abort();
        }
        let stats = self.stats.read();
        debug!(
            "forward listener on {} closed: {} connections, {} B out, {} B in",
            self.bound_addr, stats.connection_count, stats.bytes_sent, stats.bytes_received
        );
    }
}

/// Bind the local endpoint and spawn the accept loop.
async fn start_forward_listener(
    controller: SessionController,
    spec: &ForwardSpec,
) -> Result<ForwardGuard, TunnelError> {
    let local_addr = spec.local_addr();
    let listener = TcpListener::bind(&local_addr).await.map_err(|e| {
        match e.kind() {
            std::io::ErrorKind::AddrInUse => TunnelError::ForwardFailed(format!(
                "port already in use: {}. Another application may be using this port.",
                local_addr
            )),
            std::io::ErrorKind::PermissionDenied => TunnelError::ForwardFailed(format!(
                "permission denied binding to {}. Ports below 1024 require elevated privileges.",
                local_addr
            )),
            std::io::ErrorKind::AddrNotAvailable => TunnelError::ForwardFailed(format!(
                "address not available: {}",
                local_addr
            )),
            _ => TunnelError::ForwardFailed(format!("failed to bind {}: {}", local_addr, e)),
        }
    })?;

    let bound_addr = listener
        .local_addr()
        .map_err(|e| TunnelError::ForwardFailed(format!("failed to read bound address: {}", e)))?;

    info!(
        "local forward listening: {} -> {}:{}",
        bound_addr, spec.remote_host, spec.remote_port
    );

    let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);
    let stats = Arc::new(parking_lot::RwLock::new(ForwardStats::default()));
    let stats_task = stats.clone();
    let mut disconnect_rx = controller.subscribe_disconnect();
    let remote_host = spec.remote_host.clone();
    let remote_port = spec.remote_port;

    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = disconnect_rx.recv() => {
                    info!("local forward stopped: SSH session ended");
                    break;
                }
                _ = stop_rx.recv() => {
                    debug!("local forward stopped by request");
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            if let Err(e) = stream.set_nodelay(true) {
                                warn!("failed to set TCP_NODELAY: {}", e);
                            }
                            debug!("accepted {} for forward", peer_addr);
                            {
                                let mut s = stats_task.write();
                                s.connection_count += 1;
                                s.active_connections += 1;
                            }

                            let controller = controller.clone();
                            let remote_host = remote_host.clone();
                            let stats_conn = stats_task.clone();
                            tokio::spawn(async move {
                                let result = bridge_connection(
                                    controller,
                                    stream,
                                    &remote_host,
                                    remote_port,
                                    stats_conn.clone(),
                                )
                                .await;
                                {
                                    let mut s = stats_conn.write();
                                    s.active_connections = s.active_connections.saturating_sub(1);
                                }
                                if let Err(e) = result {
                                    warn!("forward connection error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            warn!("forward accept error: {}", e);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
            }
        }
        // Listener drops here, releasing the port.
    });

    Ok(ForwardGuard { bound_addr, stop_tx, task, stats })
}

/// Shuttle one accepted connection over a direct-tcpip channel.
async fn bridge_connection(
    controller: SessionController,
    mut local: TcpStream,
    remote_host: &str,
    remote_port: u16,
    stats: Arc<parking_lot::RwLock<ForwardStats>>,
) -> Result<(), TunnelError> {
    let channel = controller
        .open_direct_tcpip(remote_host, remote_port as u32, "127.0.0.1", 0)
        .await?;
    let mut remote = channel.into_stream();

    match tokio::io::copy_bidirectional(&mut local, &mut remote).await {
        Ok((sent, received)) => {
            let mut s = stats.write();
            s.bytes_sent += sent;
            s.bytes_received += received;
            debug!("forward connection closed ({} out, {} in)", sent, received);
        }
        Err(e) => debug!("forward bridge ended: {}", e),
    }
    Ok(())
}

/// A connected russh session.
struct LibrarySession {
    controller: SessionController,
    forward: Option<ForwardGuard>,
}

#[async_trait]
impl SshSession for LibrarySession {
    async fn forward(&mut self, spec: &ForwardSpec) -> Result<(), TunnelError> {
        if let Some(old) = self.forward.take() {
            info!("replacing forward listener on {}", old.bound_addr);
            old.close().await;
        }
        let guard = start_forward_listener(self.controller.clone(), spec).await?;
        self.forward = Some(guard);
        Ok(())
    }

    async fn run(&mut self, command: &str) -> Result<CommandOutput, TunnelError> {
        self.controller.exec(command).await
    }

    async fn close(&mut self) -> Option<i32> {
        if let Some(forward) = self.forward.take() {
            forward.close().await;
        }
        self.controller.disconnect().await;
        None
    }
}

/// russh callback handler.
struct ClientHandler {
    host: String,
    port: u16,
}

impl ClientHandler {
    fn new(host: String, port: u16) -> Self {
        Self { host, port }
    }
}

impl client::Handler for ClientHandler {
    type Error = TunnelError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        // Tunnel targets are operator-configured hosts; accept and log the
        // key instead of maintaining a known_hosts store here. The openssh
        // backend applies accept-new via the real known_hosts.
        warn!(
            "accepting {} host key for {}:{} without verification",
            server_public_key.algorithm().as_str(),
            self.host,
            self.port
        );
        Ok(true)
    }
}

/// Connector for the in-process russh strategy.
pub struct LibraryConnector;

#[async_trait]
impl SshConnector for LibraryConnector {
    async fn connect(
        &self,
        config: &SshTunnelConfig,
        overrides: &AuthOverrides,
    ) -> Result<Box<dyn SshSession>, TunnelError> {
        let addr = format!("{}:{}", config.host, config.port);
        info!("connecting to {} as {}", addr, config.username);

        let socket_addr = addr
            .to_socket_addrs()
            .map_err(|e| TunnelError::ConnectFailed(format!("failed to resolve {}: {}", addr, e)))?
            .next()
            .ok_or_else(|| TunnelError::ConnectFailed(format!("no address found for {}", addr)))?;

        let ssh_config = client::Config {
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
            ..Default::default()
        };

        let mut handle = tokio::time::timeout(
            config.connect_timeout(),
            client::connect(
                Arc::new(ssh_config),
                socket_addr,
                ClientHandler::new(config.host.clone(), config.port),
            ),
        )
        .await
        .map_err(|_| TunnelError::ConnectFailed(format!("connection to {} timed out", addr)))?
        .map_err(|e| TunnelError::ConnectFailed(e.to_string()))?;

        debug!("handshake complete for {}", addr);
        authenticate(&mut handle, config, overrides).await?;
        info!("authenticated to {} as {}", addr, config.username);

        let controller = spawn_session_owner(handle, addr);
        Ok(Box::new(LibrarySession { controller, forward: None }))
    }
}

/// One credential offer within an attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
enum AuthOffer<'a> {
    Password(&'a str),
    Key(&'a Path),
    None,
}

impl AuthOffer<'_> {
    fn method(&self) -> &'static str {
        match self {
            AuthOffer::Password(_) => "password",
            AuthOffer::Key(_) => "publickey",
            AuthOffer::None => "none",
        }
    }
}

/// The offers one attempt makes, in order: override password before config
/// password, then the configured key. None-auth is only worth offering when
/// nothing else is on hand; servers that require a credential reject it,
/// which is exactly what sends the worker into its prompt loop.
fn auth_plan<'a>(config: &'a SshTunnelConfig, overrides: &'a AuthOverrides) -> Vec<AuthOffer<'a>> {
    let mut plan = Vec::new();
    if let Some(password) = overrides.effective_password(config) {
        plan.push(AuthOffer::Password(password));
    }
    if let Some(key_path) = &config.key_path {
        plan.push(AuthOffer::Key(key_path.as_path()));
    }
    if plan.is_empty() {
        plan.push(AuthOffer::None);
    }
    plan
}

/// Walk the attempt's offers until the server accepts one. A rejected offer
/// falls through to the next, so a stale password still leaves the key a
/// chance. Rejection of the whole plan comes back as `AuthFailed` so the
/// worker can prompt and retry; transport and key-loading problems are hard
/// connect failures.
async fn authenticate(
    handle: &mut Handle<ClientHandler>,
    config: &SshTunnelConfig,
    overrides: &AuthOverrides,
) -> Result<(), TunnelError> {
    let plan = auth_plan(config, overrides);
    let offered = plan
        .iter()
        .map(AuthOffer::method)
        .collect::<Vec<_>>()
        .join(",");

    for offer in plan {
        let accepted = match offer {
            AuthOffer::Password(password) => handle
                .authenticate_password(&config.username, password)
                .await
                .map_err(|e| TunnelError::ConnectFailed(e.to_string()))?
                .success(),
            AuthOffer::Key(key_path) => {
                let key = russh::keys::load_secret_key(key_path, None).map_err(|e| {
                    TunnelError::ConnectFailed(format!(
                        "cannot load key {}: {}",
                        key_path.display(),
                        e
                    ))
                })?;
                handle
                    .authenticate_publickey(
                        &config.username,
                        PrivateKeyWithHashAlg::new(Arc::new(key), None),
                    )
                    .await
                    .map_err(|e| TunnelError::ConnectFailed(e.to_string()))?
                    .success()
            }
            AuthOffer::None => handle
                .authenticate_none(&config.username)
                .await
                .map_err(|e| TunnelError::ConnectFailed(e.to_string()))?
                .success(),
        };
        if accepted {
            return Ok(());
        }
        debug!("{} auth rejected for {}", offer.method(), config.username);
    }

    Err(TunnelError::AuthFailed(format!(
        "permission denied for {} ({})",
        config.username, offered
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Controller whose owner task answers every channel request with a
    /// disconnect error. Enough to exercise the listener machinery.
    fn stub_controller() -> SessionController {
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<SessionCommand>(8);
        let (disconnect_tx, _) = broadcast::channel::<()>(1);
        tokio::spawn(async move {
            while let Some(cmd) = cmd_rx.recv().await {
                match cmd {
                    SessionCommand::OpenDirectTcpip { reply_tx, .. } => {
                        let _ = reply_tx.send(Err(russh::Error::Disconnect));
                    }
                    SessionCommand::Exec { reply_tx, .. } => {
                        let _ = reply_tx.send(Err(TunnelError::NotConnected));
                    }
                    SessionCommand::Disconnect => break,
                }
            }
        });
        SessionController { cmd_tx, disconnect_tx }
    }

    #[tokio::test]
    async fn test_listener_binds_and_releases_port() {
        let spec = ForwardSpec {
            local_host: "127.0.0.1".to_string(),
            local_port: 0,
            remote_host: "127.0.0.1".to_string(),
            remote_port: 50051,
        };
        let guard = start_forward_listener(stub_controller(), &spec).await.unwrap();
        let bound = guard.bound_addr;

        // Port is held while the guard lives...
        assert!(TcpListener::bind(bound).await.is_err());

        // ...and free again once close() returns.
        guard.close().await;
        assert!(TcpListener::bind(bound).await.is_ok());
    }

    #[tokio::test]
    async fn test_bind_conflict_is_actionable() {
        let holder = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = holder.local_addr().unwrap().port();

        let spec = ForwardSpec {
            local_host: "127.0.0.1".to_string(),
            local_port: port,
            remote_host: "127.0.0.1".to_string(),
            remote_port: 50051,
        };
        let err = start_forward_listener(stub_controller(), &spec)
            .await
            .err()
            .expect("bind should conflict");
        match err {
            TunnelError::ForwardFailed(message) => {
                assert!(message.contains("already in use"), "got: {}", message);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_failed_channel_open_counts_connection() {
        let spec = ForwardSpec {
            local_host: "127.0.0.1".to_string(),
            local_port: 0,
            remote_host: "127.0.0.1".to_string(),
            remote_port: 50051,
        };
        let guard = start_forward_listener(stub_controller(), &spec).await.unwrap();

        // Connect; the stub rejects the channel open, so the bridge ends
        // immediately, but the accept was still counted.
        let _client = TcpStream::connect(guard.bound_addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let stats = guard.stats.read().clone();
        assert_eq!(stats.connection_count, 1);
        assert_eq!(stats.active_connections, 0);

        guard.close().await;
    }

    #[tokio::test]
    async fn test_session_close_stops_listener() {
        let controller = stub_controller();
        let spec = ForwardSpec {
            local_host: "127.0.0.1".to_string(),
            local_port: 0,
            remote_host: "127.0.0.1".to_string(),
            remote_port: 50051,
        };
        let mut session = LibrarySession { controller, forward: None };
        session.forward(&spec).await.unwrap();
        let bound = session.forward.as_ref().unwrap().bound_addr;

        assert!(session.close().await.is_none());
        assert!(TcpListener::bind(bound).await.is_ok());
    }

    #[tokio::test]
    async fn test_forward_replacement_reuses_port() {
        // Reserve a concrete port, then free it for the session to use.
        let holder = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = holder.local_addr().unwrap().port();
        drop(holder);

        let mut session = LibrarySession { controller: stub_controller(), forward: None };
        let mut spec = ForwardSpec {
            local_host: "127.0.0.1".to_string(),
            local_port: port,
            remote_host: "127.0.0.1".to_string(),
            remote_port: 50051,
        };
        session.forward(&spec).await.unwrap();

        // Retargeting on the same local port only works if the previous
        // listener is fully released before the new bind.
        spec.remote_port = 50052;
        session.forward(&spec).await.unwrap();
        assert_eq!(session.forward.as_ref().unwrap().bound_addr.port(), port);

        session.close().await;
    }

    #[test]
    fn test_auth_plan_offers_password_then_key() {
        // A stale password must not end the attempt while a key is configured.
        let config = SshTunnelConfig::new("db.internal")
            .with_password("stale")
            .with_key_path("/home/alice/.ssh/id_ed25519");
        let overrides = AuthOverrides::default();
        assert_eq!(
            auth_plan(&config, &overrides),
            vec![
                AuthOffer::Password("stale"),
                AuthOffer::Key(Path::new("/home/alice/.ssh/id_ed25519")),
            ]
        );
    }

    #[test]
    fn test_auth_plan_prefers_learned_password() {
        let config = SshTunnelConfig::new("db.internal").with_password("old");
        let mut overrides = AuthOverrides::default();
        overrides.merge_password("fresh".to_string());
        assert_eq!(
            auth_plan(&config, &overrides),
            vec![AuthOffer::Password("fresh")]
        );
    }

    #[test]
    fn test_auth_plan_without_credentials_offers_none() {
        let config = SshTunnelConfig::new("db.internal");
        let overrides = AuthOverrides::default();
        assert_eq!(auth_plan(&config, &overrides), vec![AuthOffer::None]);
    }
}
