//! Tunnel configuration
//!
//! One immutable value describes a tunnel: the SSH endpoint, the credential
//! sources, the forward endpoints, and the backend choice. Loaders and the
//! `with_*` builders produce new values; nothing mutates a config that is
//! already in use by a worker.

use std::env;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Which SSH strategy the worker uses to reach the remote host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SshBackendKind {
    /// In-process session via russh.
    #[default]
    Library,
    /// The system `ssh` binary driven as a ControlMaster.
    Openssh,
}

impl SshBackendKind {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "library" => Some(SshBackendKind::Library),
            "openssh" => Some(SshBackendKind::Openssh),
            _ => None,
        }
    }
}

/// Tunnel configuration. Construct with [`SshTunnelConfig::new`] or
/// [`SshTunnelConfig::from_env`].
#[derive(Clone, Serialize, Deserialize)]
pub struct SshTunnelConfig {
    /// SSH server host.
    pub host: String,
    /// SSH server port.
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    /// Login user.
    #[serde(default = "default_username")]
    pub username: String,
    /// Private key path, if key auth is wanted.
    #[serde(default)]
    pub key_path: Option<PathBuf>,
    /// Password, if already known. Held in memory only: skipped by serde so
    /// it can never land in a config file, and redacted from `Debug`.
    #[serde(skip)]
    pub password: Option<String>,
    /// Local bind address for the port forward.
    #[serde(default = "default_local_host")]
    pub local_host: String,
    /// Local bind port for the port forward.
    #[serde(default = "default_forward_port")]
    pub local_port: u16,
    /// Remote target host, as seen from the SSH server.
    #[serde(default = "default_local_host")]
    pub remote_host: String,
    /// Remote target port.
    #[serde(default = "default_forward_port")]
    pub remote_port: u16,
    /// Askpass broker endpoint, when one is managed externally. Left unset,
    /// the controller creates its own when the backend needs a relay.
    #[serde(default)]
    pub askpass_socket: Option<PathBuf>,
    /// Explicit path of the `lazytunnel-askpass` helper. Left unset, a
    /// sibling of the current executable is tried, then `$PATH`.
    #[serde(default)]
    pub askpass_helper: Option<PathBuf>,
    /// SSH strategy.
    #[serde(default)]
    pub backend: SshBackendKind,
    /// Connection deadline in seconds (handshake plus one auth attempt).
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_username() -> String {
    whoami::username()
}

fn default_local_host() -> String {
    "127.0.0.1".to_string()
}

fn default_forward_port() -> u16 {
    9000
}

fn default_connect_timeout_secs() -> u64 {
    30
}

impl SshTunnelConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_ssh_port(),
            username: default_username(),
            key_path: None,
            password: None,
            local_host: default_local_host(),
            local_port: default_forward_port(),
            remote_host: default_local_host(),
            remote_port: default_forward_port(),
            askpass_socket: None,
            askpass_helper: None,
            backend: SshBackendKind::default(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }

    /// Build a config from `LAZYTUNNEL_*` environment variables, falling
    /// back to the defaults above for anything unset.
    pub fn from_env() -> Self {
        let mut config = Self::new(env_or("LAZYTUNNEL_SSH_HOST", "127.0.0.1"));
        config.port = env_parsed("LAZYTUNNEL_SSH_PORT", config.port);
        if let Some(user) = env_nonempty("LAZYTUNNEL_SSH_USER") {
            config.username = user;
        }
        config.key_path = env_nonempty("LAZYTUNNEL_SSH_KEY_PATH").map(PathBuf::from);
        config.password = env_nonempty("LAZYTUNNEL_SSH_PASSWORD");
        config.local_host = env_or("LAZYTUNNEL_LOCAL_HOST", &config.local_host);
        config.local_port = env_parsed("LAZYTUNNEL_LOCAL_PORT", config.local_port);
        config.remote_host = env_or("LAZYTUNNEL_REMOTE_HOST", &config.remote_host);
        config.remote_port = env_parsed("LAZYTUNNEL_REMOTE_PORT", config.remote_port);
        config.askpass_socket = env_nonempty("LAZYTUNNEL_ASKPASS_SOCKET").map(PathBuf::from);
        if let Some(backend) = env_nonempty("LAZYTUNNEL_SSH_BACKEND") {
            match SshBackendKind::parse(&backend) {
                Some(kind) => config.backend = kind,
                None => warn!(
                    "unrecognized LAZYTUNNEL_SSH_BACKEND value {:?}; using {:?}",
                    backend, config.backend
                ),
            }
        }
        config
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = username.into();
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_key_path(mut self, key_path: impl Into<PathBuf>) -> Self {
        self.key_path = Some(key_path.into());
        self
    }

    pub fn with_forward(
        mut self,
        local_port: u16,
        remote_host: impl Into<String>,
        remote_port: u16,
    ) -> Self {
        self.local_port = local_port;
        self.remote_host = remote_host.into();
        self.remote_port = remote_port;
        self
    }

    pub fn with_askpass_socket(mut self, socket: impl Into<PathBuf>) -> Self {
        self.askpass_socket = Some(socket.into());
        self
    }

    pub fn with_backend(mut self, backend: SshBackendKind) -> Self {
        self.backend = backend;
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// `host:port` of the local forward endpoint.
    pub fn local_addr(&self) -> String {
        format!("{}:{}", self.local_host, self.local_port)
    }
}

impl fmt::Debug for SshTunnelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshTunnelConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("key_path", &self.key_path)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("local_host", &self.local_host)
            .field("local_port", &self.local_port)
            .field("remote_host", &self.remote_host)
            .field("remote_port", &self.remote_port)
            .field("askpass_socket", &self.askpass_socket)
            .field("askpass_helper", &self.askpass_helper)
            .field("backend", &self.backend)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .finish()
    }
}

/// Credentials learned during a worker session, merged over the config when
/// building a connection attempt. Kept separate so a prompt reply never
/// mutates the config itself.
#[derive(Clone, Default)]
pub struct AuthOverrides {
    pub password: Option<String>,
}

impl AuthOverrides {
    pub fn merge_password(&mut self, secret: String) {
        self.password = Some(secret);
    }

    /// Override password first, config password second.
    pub fn effective_password<'a>(&'a self, config: &'a SshTunnelConfig) -> Option<&'a str> {
        self.password.as_deref().or(config.password.as_deref())
    }
}

impl fmt::Debug for AuthOverrides {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthOverrides")
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.is_empty())
}

fn env_or(key: &str, default: &str) -> String {
    env_nonempty(key).unwrap_or_else(|| default.to_string())
}

fn env_parsed(key: &str, default: u16) -> u16 {
    match env_nonempty(key) {
        Some(value) => match value.parse() {
            Ok(parsed) => parsed,
            Err(_) => {
                warn!("{} value {:?} is not a port number; using {}", key, value, default);
                default
            }
        },
        None => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Env vars are process-global; serialize the tests that touch them.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_defaults() {
        let config = SshTunnelConfig::new("example.com");
        assert_eq!(config.port, 22);
        assert_eq!(config.local_host, "127.0.0.1");
        assert_eq!(config.local_port, 9000);
        assert_eq!(config.remote_port, 9000);
        assert_eq!(config.backend, SshBackendKind::Library);
        assert_eq!(config.connect_timeout(), Duration::from_secs(30));
        assert!(config.password.is_none());
    }

    #[test]
    fn test_builders_produce_new_values() {
        let base = SshTunnelConfig::new("example.com");
        let tuned = base
            .clone()
            .with_port(2222)
            .with_username("deploy")
            .with_forward(8080, "10.0.0.5", 50051)
            .with_backend(SshBackendKind::Openssh);
        assert_eq!(base.port, 22);
        assert_eq!(tuned.port, 2222);
        assert_eq!(tuned.username, "deploy");
        assert_eq!(tuned.local_addr(), "127.0.0.1:8080");
        assert_eq!(tuned.remote_host, "10.0.0.5");
        assert_eq!(tuned.backend, SshBackendKind::Openssh);
    }

    #[test]
    fn test_from_env_overrides() {
        let _guard = ENV_LOCK.lock().unwrap();
        env::set_var("LAZYTUNNEL_SSH_HOST", "hpc.example.com");
        env::set_var("LAZYTUNNEL_SSH_PORT", "2222");
        env::set_var("LAZYTUNNEL_SSH_USER", "alice");
        env::set_var("LAZYTUNNEL_REMOTE_PORT", "50051");
        env::set_var("LAZYTUNNEL_SSH_BACKEND", "openssh");

        let config = SshTunnelConfig::from_env();
        assert_eq!(config.host, "hpc.example.com");
        assert_eq!(config.port, 2222);
        assert_eq!(config.username, "alice");
        assert_eq!(config.remote_port, 50051);
        assert_eq!(config.backend, SshBackendKind::Openssh);

        for key in [
            "LAZYTUNNEL_SSH_HOST",
            "LAZYTUNNEL_SSH_PORT",
            "LAZYTUNNEL_SSH_USER",
            "LAZYTUNNEL_REMOTE_PORT",
            "LAZYTUNNEL_SSH_BACKEND",
        ] {
            env::remove_var(key);
        }
    }

    #[test]
    fn test_from_env_bad_values_fall_back() {
        let _guard = ENV_LOCK.lock().unwrap();
        env::set_var("LAZYTUNNEL_SSH_PORT", "not-a-port");
        env::set_var("LAZYTUNNEL_SSH_BACKEND", "telnet");

        let config = SshTunnelConfig::from_env();
        assert_eq!(config.port, 22);
        assert_eq!(config.backend, SshBackendKind::Library);

        env::remove_var("LAZYTUNNEL_SSH_PORT");
        env::remove_var("LAZYTUNNEL_SSH_BACKEND");
    }

    #[test]
    fn test_password_redacted_and_not_serialized() {
        let config = SshTunnelConfig::new("example.com").with_password("hunter2");
        let debug = format!("{:?}", config);
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("<redacted>"));

        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("hunter2"));
    }

    #[test]
    fn test_override_password_wins() {
        let config = SshTunnelConfig::new("example.com").with_password("from-config");
        let mut overrides = AuthOverrides::default();
        assert_eq!(overrides.effective_password(&config), Some("from-config"));
        overrides.merge_password("from-prompt".to_string());
        assert_eq!(overrides.effective_password(&config), Some("from-prompt"));
        assert!(!format!("{:?}", overrides).contains("from-prompt"));
    }
}
