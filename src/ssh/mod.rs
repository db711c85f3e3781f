//! SSH strategies
//!
//! One capability, two implementations: an in-process russh session and a
//! driven system `ssh` binary. The worker owns exactly one [`SshSession`]
//! at a time and neither knows nor cares which strategy built it.

mod client;
mod openssh;

pub use client::{ForwardStats, LibraryConnector};
pub use openssh::OpensshConnector;

use async_trait::async_trait;

use crate::config::{AuthOverrides, SshBackendKind, SshTunnelConfig};
use crate::control::CommandOutput;
use crate::error::TunnelError;

/// One local-forward endpoint pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardSpec {
    pub local_host: String,
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
}

impl ForwardSpec {
    pub fn local_addr(&self) -> String {
        format!("{}:{}", self.local_host, self.local_port)
    }

    /// The OpenSSH `-L` argument form.
    pub fn to_flag(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.local_host, self.local_port, self.remote_host, self.remote_port
        )
    }
}

/// Builds connected sessions. Chosen once per worker from the config.
#[async_trait]
pub trait SshConnector: Send + Sync {
    /// One connection attempt. Credential-family failures come back as
    /// [`TunnelError::AuthFailed`] so the worker's retry loop can tell them
    /// from transport trouble.
    async fn connect(
        &self,
        config: &SshTunnelConfig,
        overrides: &AuthOverrides,
    ) -> Result<Box<dyn SshSession>, TunnelError>;
}

/// A live SSH session owning at most one local-forward listener.
#[async_trait]
pub trait SshSession: Send {
    /// Open the local forward described by `spec`. Any previous listener is
    /// closed, and its release awaited, strictly before the new bind.
    async fn forward(&mut self, spec: &ForwardSpec) -> Result<(), TunnelError>;

    /// Run a command on the remote host and wait for it to finish.
    async fn run(&mut self, command: &str) -> Result<CommandOutput, TunnelError>;

    /// Close the forward and the connection, in that order. Returns the
    /// backend exit code where one exists (the external `ssh` process).
    async fn close(&mut self) -> Option<i32>;
}

/// The connector for the configured backend.
pub fn connector_for(config: &SshTunnelConfig) -> Box<dyn SshConnector> {
    match config.backend {
        SshBackendKind::Library => Box::new(LibraryConnector),
        SshBackendKind::Openssh => Box::new(OpensshConnector),
    }
}

/// Whether diagnostic text points at a credential problem. Matches what both
/// OpenSSH and SSH libraries actually print; anything else is treated as
/// transport or protocol trouble.
pub fn looks_like_auth_failure(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("permission denied") || lower.contains("authentication")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_spec_flag_form() {
        let spec = ForwardSpec {
            local_host: "127.0.0.1".to_string(),
            local_port: 9000,
            remote_host: "10.0.0.5".to_string(),
            remote_port: 50051,
        };
        assert_eq!(spec.to_flag(), "127.0.0.1:9000:10.0.0.5:50051");
        assert_eq!(spec.local_addr(), "127.0.0.1:9000");
    }

    #[test]
    fn test_auth_failure_text_classification() {
        assert!(looks_like_auth_failure("Permission denied (publickey,password)."));
        assert!(looks_like_auth_failure("server: Authentication failed"));
        assert!(!looks_like_auth_failure("connect to host example.com port 22: Connection refused"));
        assert!(!looks_like_auth_failure("Network is unreachable"));
    }
}
