//! lazytunnel CLI: bring up the tunnel the environment describes and hold
//! it until interrupted.
//!
//! Configuration comes entirely from `LAZYTUNNEL_*` variables (see
//! [`SshTunnelConfig::from_env`]); the local endpoint is printed on stdout
//! once it accepts connections, so scripts can wait on the line.

use lazytunnel::{init_logging, SshTunnelConfig, TunnelController};
use tracing::{error, info};

#[tokio::main]
async fn main() {
    init_logging();

    let config = SshTunnelConfig::from_env();
    info!(
        "starting tunnel: {} -> {}@{}:{} -> {}:{}",
        config.local_addr(),
        config.username,
        config.host,
        config.port,
        config.remote_host,
        config.remote_port
    );

    let controller = match TunnelController::start(config).await {
        Ok(controller) => controller,
        Err(e) => {
            error!("tunnel failed to start: {}", e);
            std::process::exit(1);
        }
    };

    println!("{}", controller.local_addr());

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("cannot wait for interrupt: {}", e);
    }

    info!("interrupt received; shutting down");
    match controller.stop().await {
        Some(code) if code != 0 => std::process::exit(code),
        _ => {}
    }
}
