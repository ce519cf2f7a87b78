//! Supervised control of an external MPV player.
//!
//! [`PlayerController`] owns one MPV process at a time, serializes play/stop
//! requests through a single worker task, swaps media in place over MPV's
//! JSON IPC when it can, and restarts playback when MPV dies on its own.

pub mod config;
pub mod mpv;

pub use config::{ConfigError, PlayerConfig};
pub use mpv::{
  PlaybackState, PlayerController, PlayerError, PlayerStatus, RestartStatus, StatusReport,
};
