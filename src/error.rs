//! Tunnel error types

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TunnelError {
    /// The peer end of the control channel is gone.
    #[error("Control channel closed")]
    ChannelClosed,

    #[error("Worker did not report startup within {0:?}")]
    WorkerStartTimeout(Duration),

    #[error("Authentication failed after {attempts} attempts")]
    AuthExhausted { attempts: u32 },

    #[error("Authentication declined: {0}")]
    AuthDeclined(String),

    #[error("SSH not connected")]
    NotConnected,

    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Port forward failed: {0}")]
    ForwardFailed(String),

    #[error("Command failed: {0}")]
    CommandFailed(String),

    #[error("{addr} did not become connectable within {waited:?}")]
    ReadinessTimeout { addr: String, waited: Duration },

    #[error("No reply to {0} within the request deadline")]
    RequestTimeout(&'static str),

    #[error("Unknown message: {0}")]
    UnknownMessage(String),

    /// A failure the worker reported over the control channel, re-raised at
    /// the controller call site.
    #[error("{0}")]
    Worker(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TunnelError {
    /// Whether this failure belongs to the credential family, i.e. a fresh
    /// secret could plausibly fix it. Only these drive the connect retry
    /// loop; transport and protocol trouble never does.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, TunnelError::AuthFailed(_))
    }
}

impl From<russh::Error> for TunnelError {
    fn from(err: russh::Error) -> Self {
        TunnelError::ConnectFailed(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // These two display strings double as wire messages; the worker emits
    // them verbatim inside Error replies.
    #[test]
    fn test_wire_facing_messages() {
        assert_eq!(TunnelError::NotConnected.to_string(), "SSH not connected");
        assert_eq!(
            TunnelError::UnknownMessage("ping".to_string()).to_string(),
            "Unknown message: ping"
        );
    }

    #[test]
    fn test_auth_failure_classification() {
        assert!(TunnelError::AuthFailed("permission denied".into()).is_auth_failure());
        assert!(!TunnelError::ConnectFailed("no route to host".into()).is_auth_failure());
        assert!(!TunnelError::AuthExhausted { attempts: 3 }.is_auth_failure());
    }
}
