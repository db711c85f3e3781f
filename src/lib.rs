//! lazytunnel - SSH tunnels that manage themselves
//!
//! A tunnel here is a worker task owning one SSH session, driven over a
//! typed control channel by a [`TunnelController`] that brings the whole
//! thing up in order: connect, forward, wait for the local port to accept.
//! Password prompts flow back through the same channel, or through a small
//! Unix-socket credential broker when the OpenSSH binary does the dialing.
//!
//! ```no_run
//! use lazytunnel::{SshTunnelConfig, TunnelController};
//!
//! # async fn demo() -> Result<(), lazytunnel::TunnelError> {
//! let config = SshTunnelConfig::new("bastion.example.com")
//!     .with_username("deploy")
//!     .with_forward(9000, "10.0.0.5", 5432);
//! let controller = TunnelController::start(config).await?;
//! // 127.0.0.1:9000 now reaches 10.0.0.5:5432 through the bastion.
//! controller.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod config;
pub mod control;
pub mod controller;
pub mod error;
pub mod prompt;
pub mod ssh;
pub mod worker;

pub use broker::PromptBroker;
pub use config::{AuthOverrides, SshBackendKind, SshTunnelConfig};
pub use control::{CommandOutput, ControlChannel, ControlMessage};
pub use controller::{Timeouts, TunnelController};
pub use error::TunnelError;
pub use prompt::{NoPrompt, SecretPrompt, StaticSecret, TerminalPrompt};
pub use ssh::{ForwardSpec, SshConnector, SshSession};
pub use worker::{spawn_worker, spawn_worker_with_connector, WorkerHandle};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize logging
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}
