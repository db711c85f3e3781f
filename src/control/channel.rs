//! Duplex control channel
//!
//! Two bounded mpsc pipes glued into a pair of ends. Messages arrive in the
//! order they were sent per direction; a dropped peer surfaces as
//! `ChannelClosed` on both send and receive. The one-request-in-flight
//! discipline belongs to the protocol, not the channel.

use std::time::Duration;

use tokio::sync::mpsc;

use super::message::ControlMessage;
use crate::error::TunnelError;

const CHANNEL_DEPTH: usize = 64;

/// One end of a control channel pair.
pub struct ControlChannel {
    tx: mpsc::Sender<ControlMessage>,
    rx: mpsc::Receiver<ControlMessage>,
}

impl ControlChannel {
    /// Create a connected pair. By convention the first end goes to the
    /// controller and the second to the worker, but the ends are symmetric.
    pub fn pair() -> (ControlChannel, ControlChannel) {
        let (a_tx, a_rx) = mpsc::channel(CHANNEL_DEPTH);
        let (b_tx, b_rx) = mpsc::channel(CHANNEL_DEPTH);
        (
            ControlChannel { tx: a_tx, rx: b_rx },
            ControlChannel { tx: b_tx, rx: a_rx },
        )
    }

    /// Send one message, transferring ownership to the peer.
    pub async fn send(&self, msg: ControlMessage) -> Result<(), TunnelError> {
        self.tx.send(msg).await.map_err(|_| TunnelError::ChannelClosed)
    }

    /// Wait for the next message from the peer.
    pub async fn recv(&mut self) -> Result<ControlMessage, TunnelError> {
        self.rx.recv().await.ok_or(TunnelError::ChannelClosed)
    }

    /// Wait for the next message with a deadline. `op` names the
    /// outstanding request so a timeout error says what it was waiting for.
    pub async fn recv_timeout(
        &mut self,
        deadline: Duration,
        op: &'static str,
    ) -> Result<ControlMessage, TunnelError> {
        match tokio::time::timeout(deadline, self.rx.recv()).await {
            Ok(Some(msg)) => Ok(msg),
            Ok(None) => Err(TunnelError::ChannelClosed),
            Err(_) => Err(TunnelError::RequestTimeout(op)),
        }
    }

    /// Whether the peer end has been dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
