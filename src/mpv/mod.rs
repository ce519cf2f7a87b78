//! MPV control - spawns and supervises an external MPV player via JSON IPC.
//!
//! Architecture:
//! - `protocol.rs` - JSON command/response types and the reply policy
//! - `transport.rs` - Ordered delivery strategies (socat, nc, Unix socket)
//! - `process.rs` - MPV binary detection, spawning, exit watching, termination
//! - `session.rs` - Playback state machine and auto-restart policy
//! - `worker.rs` - Single consumer task that owns the session
//! - `controller.rs` - Public handle that queues commands to the worker

mod controller;
mod process;
mod protocol;
mod session;
mod transport;
mod worker;

#[cfg(test)]
mod testutil;

pub use controller::{PlayerController, PlayerError};
pub use process::{build_args, find_mpv, ProcessError, ProcessHandle};
pub use protocol::{ControlMessage, ControlResponse};
pub use session::{PlaybackState, PlayerStatus, RestartStatus, StatusReport};
pub use transport::{HelperTransport, NativeTransport, Transport, TransportChain, TransportError};
