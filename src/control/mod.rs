//! Control channel between the tunnel controller and its worker.

mod channel;
mod message;

pub use channel::ControlChannel;
pub use message::{CommandOutput, ControlMessage};
