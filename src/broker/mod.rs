//! Credential prompt broker
//!
//! A local Unix-socket rendezvous that lets an externally spawned `ssh`
//! (through its askpass program) ask the operator for a password via this
//! process instead of a terminal it does not have.
//!
//! # Flow
//!
//! The broker binds a socket under a private 0700 directory and serves one
//! client at a time: read one request line, put the question to the prompt
//! source, write one response line, close. A second client waits in the OS
//! accept backlog until the first exchange is over. `stop()` interrupts the
//! accept wait, joins the serve task, and removes the endpoint; it is safe
//! to call at any time, any number of times.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::TunnelError;
use crate::prompt::SecretPrompt;

mod protocol;
pub use protocol::{PromptRequest, PromptResponse};

const SOCKET_NAME: &str = "askpass.sock";
const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Single-listener prompt relay. See the module docs for the lifecycle.
pub struct PromptBroker {
    prompt: Arc<dyn SecretPrompt>,
    configured_path: Option<PathBuf>,
    socket_path: Option<PathBuf>,
    owned_dir: Option<tempfile::TempDir>,
    stop_tx: Option<mpsc::Sender<()>>,
    serve_task: Option<JoinHandle<()>>,
    running: Arc<AtomicBool>,
}

impl PromptBroker {
    /// Broker that owns its socket home: a fresh 0700 temp directory per
    /// `start()`.
    pub fn new(prompt: Arc<dyn SecretPrompt>) -> Self {
        Self {
            prompt,
            configured_path: None,
            socket_path: None,
            owned_dir: None,
            stop_tx: None,
            serve_task: None,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Broker bound to an explicit endpoint path.
    pub fn with_socket_path(prompt: Arc<dyn SecretPrompt>, path: impl Into<PathBuf>) -> Self {
        let mut broker = Self::new(prompt);
        broker.configured_path = Some(path.into());
        broker
    }

    /// Bind the endpoint and spawn the serve task. Returns the bound socket
    /// path. Calling `start` on a running broker is a no-op returning the
    /// existing path.
    pub async fn start(&mut self) -> Result<PathBuf, TunnelError> {
        if self.serve_task.is_some() {
            if let Some(path) = &self.socket_path {
                return Ok(path.clone());
            }
        }

        let path = match &self.configured_path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                path.clone()
            }
            None => {
                let dir = tempfile::Builder::new()
                    .prefix("lazytunnel-askpass-")
                    .tempdir()?;
                fs::set_permissions(dir.path(), fs::Permissions::from_mode(0o700))?;
                let path = dir.path().join(SOCKET_NAME);
                self.owned_dir = Some(dir);
                path
            }
        };

        // A previous run may have left a stale endpoint behind.
        if path.exists() {
            fs::remove_file(&path)?;
        }

        let listener = UnixListener::bind(&path)?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;

        let (stop_tx, stop_rx) = mpsc::channel::<()>(1);
        self.running.store(true, Ordering::SeqCst);
        let running = self.running.clone();
        let prompt = self.prompt.clone();
        let task = tokio::spawn(serve(listener, prompt, stop_rx, running));

        info!("askpass broker listening on {}", path.display());
        self.socket_path = Some(path.clone());
        self.stop_tx = Some(stop_tx);
        self.serve_task = Some(task);
        Ok(path)
    }

    /// Stop serving and remove the endpoint. Idempotent, and safe to call
    /// on a broker that never started.
    pub async fn stop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(()).await;
        }
        if let Some(mut task) = self.serve_task.take() {
            if tokio::time::timeout(STOP_JOIN_TIMEOUT, &mut task).await.is_err() {
                warn!("askpass broker did not stop in time; aborting");
                task.abort();
            }
        }
        self.running.store(false, Ordering::SeqCst);
        self.cleanup_socket();
    }

    /// The bound endpoint while running.
    pub fn socket_path(&self) -> Option<&Path> {
        self.socket_path.as_deref()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn cleanup_socket(&mut self) {
        if let Some(path) = self.socket_path.take() {
            if let Err(e) = fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    debug!("askpass socket removal failed: {}", e);
                }
            }
        }
        if let Some(dir) = self.owned_dir.take() {
            if let Err(e) = dir.close() {
                debug!("askpass dir removal failed: {}", e);
            }
        }
    }
}

impl Drop for PromptBroker {
    fn drop(&mut self) {
        // Abandon path: no graceful join possible here, but the task must
        // not outlive the broker and the endpoint must not litter.
        if let Some(task) = self.serve_task.take() {
            task.abort();
        }
        self.running.store(false, Ordering::SeqCst);
        self.cleanup_socket();
    }
}

async fn serve(
    listener: UnixListener,
    prompt: Arc<dyn SecretPrompt>,
    mut stop_rx: mpsc::Receiver<()>,
    running: Arc<AtomicBool>,
) {
    loop {
        tokio::select! {
            _ = stop_rx.recv() => {
                debug!("askpass broker stop requested");
                break;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        if let Err(e) = serve_client(stream, prompt.clone()).await {
                            debug!("askpass client exchange failed: {}", e);
                        }
                    }
                    Err(e) => {
                        warn!("askpass accept error: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }
    running.store(false, Ordering::SeqCst);
}

/// One request/response exchange. Malformed or empty requests are dropped
/// without an answer; the broker must outlive any misbehaving client.
async fn serve_client(stream: UnixStream, prompt: Arc<dyn SecretPrompt>) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut line = String::new();
    let n = BufReader::new(read_half).read_line(&mut line).await?;
    if n == 0 || line.trim().is_empty() {
        return Ok(()); // client connected and went away
    }

    let request: PromptRequest = match serde_json::from_str(line.trim()) {
        Ok(request) => request,
        Err(e) => {
            debug!("askpass request was not valid JSON: {}", e);
            return Ok(());
        }
    };

    debug!("askpass prompt requested (echo: {})", request.echo);
    let answered = tokio::task::spawn_blocking(move || {
        prompt.read_secret(&request.prompt, request.echo)
    })
    .await
    .unwrap_or(None);

    let response = match answered {
        Some(password) => PromptResponse { password, cancelled: false },
        None => PromptResponse { password: String::new(), cancelled: true },
    };

    let mut payload = serde_json::to_vec(&response)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    payload.push(b'\n');
    write_half.write_all(&payload).await?;
    write_half.flush().await?;
    Ok(())
}

/// One prompt round trip against a broker endpoint, from the client side.
///
/// Degrades the way askpass programs must: an unreachable broker, a
/// malformed reply, and an operator cancellation all come back as an empty
/// secret rather than an error.
pub async fn request_secret(socket: &Path, prompt: &str, echo: bool) -> String {
    match request_secret_inner(socket, prompt, echo).await {
        Ok(response) if !response.cancelled => response.password,
        Ok(_) => String::new(),
        Err(e) => {
            debug!("askpass request failed: {}", e);
            String::new()
        }
    }
}

async fn request_secret_inner(
    socket: &Path,
    prompt: &str,
    echo: bool,
) -> std::io::Result<PromptResponse> {
    let stream = UnixStream::connect(socket).await?;
    let (read_half, mut write_half) = stream.into_split();

    let request = PromptRequest { prompt: prompt.to_string(), echo };
    let mut payload = serde_json::to_vec(&request)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    payload.push(b'\n');
    write_half.write_all(&payload).await?;
    write_half.flush().await?;

    let mut line = String::new();
    BufReader::new(read_half).read_line(&mut line).await?;
    serde_json::from_str(line.trim())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompt::{NoPrompt, StaticSecret};

    #[tokio::test]
    async fn test_serves_a_password() {
        let mut broker = PromptBroker::new(Arc::new(StaticSecret("hunter2".to_string())));
        let socket = broker.start().await.unwrap();
        assert!(broker.is_running());

        let secret = request_secret(&socket, "Password: ", false).await;
        assert_eq!(secret, "hunter2");

        broker.stop().await;
    }

    #[tokio::test]
    async fn test_socket_is_private() {
        let mut broker = PromptBroker::new(Arc::new(StaticSecret("s".to_string())));
        let socket = broker.start().await.unwrap();

        let socket_mode = fs::metadata(&socket).unwrap().permissions().mode();
        assert_eq!(socket_mode & 0o777, 0o600);
        let dir_mode = fs::metadata(socket.parent().unwrap())
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(dir_mode & 0o777, 0o700);

        broker.stop().await;
    }

    #[tokio::test]
    async fn test_cancellation_is_reported() {
        let mut broker = PromptBroker::new(Arc::new(NoPrompt));
        let socket = broker.start().await.unwrap();

        let response = request_secret_inner(&socket, "Password: ", false)
            .await
            .unwrap();
        assert!(response.cancelled);
        assert!(response.password.is_empty());

        // The degraded client view of the same exchange.
        let secret = request_secret(&socket, "Password: ", false).await;
        assert_eq!(secret, "");

        broker.stop().await;
    }

    #[tokio::test]
    async fn test_survives_malformed_request() {
        let mut broker = PromptBroker::new(Arc::new(StaticSecret("still-here".to_string())));
        let socket = broker.start().await.unwrap();

        // Garbage line: the broker drops the client without an answer.
        {
            let stream = UnixStream::connect(&socket).await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            write_half.write_all(b"not json at all\n").await.unwrap();
            let mut line = String::new();
            let n = BufReader::new(read_half).read_line(&mut line).await.unwrap();
            assert_eq!(n, 0, "expected EOF, got {:?}", line);
        }

        // The next well-formed client is served normally.
        let secret = request_secret(&socket, "Password: ", false).await;
        assert_eq!(secret, "still-here");

        broker.stop().await;
    }

    #[tokio::test]
    async fn test_stop_removes_endpoint_and_home() {
        let mut broker = PromptBroker::new(Arc::new(StaticSecret("s".to_string())));
        let socket = broker.start().await.unwrap();
        let home = socket.parent().unwrap().to_path_buf();
        assert!(socket.exists());

        broker.stop().await;
        assert!(!socket.exists());
        assert!(!home.exists());
        assert!(!broker.is_running());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_safe_without_start() {
        let mut never_started = PromptBroker::new(Arc::new(NoPrompt));
        never_started.stop().await;
        never_started.stop().await;

        let mut broker = PromptBroker::new(Arc::new(StaticSecret("s".to_string())));
        broker.start().await.unwrap();
        broker.stop().await;
        broker.stop().await;
    }

    #[tokio::test]
    async fn test_stale_endpoint_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SOCKET_NAME);
        fs::write(&path, b"stale").unwrap();

        let mut broker =
            PromptBroker::with_socket_path(Arc::new(StaticSecret("fresh".to_string())), &path);
        let socket = broker.start().await.unwrap();
        assert_eq!(socket, path);

        let secret = request_secret(&socket, "Password: ", false).await;
        assert_eq!(secret, "fresh");

        broker.stop().await;
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_serial_clients_are_both_served() {
        let mut broker = PromptBroker::new(Arc::new(StaticSecret("shared".to_string())));
        let socket = broker.start().await.unwrap();

        let first = request_secret(&socket, "one: ", false);
        let second = request_secret(&socket, "two: ", false);
        let (a, b) = tokio::join!(first, second);
        assert_eq!(a, "shared");
        assert_eq!(b, "shared");

        broker.stop().await;
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let mut broker = PromptBroker::new(Arc::new(StaticSecret("round-two".to_string())));
        let first_socket = broker.start().await.unwrap();
        broker.stop().await;

        let second_socket = broker.start().await.unwrap();
        assert_ne!(first_socket, second_socket);
        let secret = request_secret(&second_socket, "Password: ", false).await;
        assert_eq!(secret, "round-two");

        broker.stop().await;
    }
}
