//! Player configuration with persistence.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("Failed to read config: {0}")]
  Io(#[from] std::io::Error),
  #[error("Failed to parse config: {0}")]
  Parse(#[from] serde_json::Error),
  #[error("Invalid config: {0}")]
  Invalid(String),
}

/// Player configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerConfig {
  /// Custom MPV executable path (None = auto-detect).
  #[serde(default)]
  pub mpv_path: Option<PathBuf>,

  /// Additional MPV command-line arguments, placed before the URL.
  #[serde(default)]
  pub mpv_args: Vec<String>,

  /// Where MPV writes its debug log.
  #[serde(default = "default_log_file")]
  pub log_file: PathBuf,

  /// User agent MPV presents to stream servers.
  #[serde(default = "default_user_agent")]
  pub user_agent: String,

  /// Deliver IPC commands over the socket only, skipping socat/nc.
  #[serde(default)]
  pub native_ipc_only: bool,

  /// Restart MPV after it exits without a stop request.
  #[serde(default = "default_true")]
  pub auto_restart: bool,

  /// How long play/stop wait for the command queue.
  #[serde(default = "default_command_timeout_ms")]
  pub command_timeout_ms: u64,

  /// Time between SIGTERM and SIGKILL.
  #[serde(default = "default_grace_period_ms")]
  pub grace_period_ms: u64,

  /// Deadline for a socat/nc helper run.
  #[serde(default = "default_helper_timeout_ms")]
  pub helper_timeout_ms: u64,

  /// Read/write timeout on the IPC socket.
  #[serde(default = "default_socket_timeout_ms")]
  pub socket_timeout_ms: u64,

  /// Delay before the first restart attempt; doubles per attempt.
  #[serde(default = "default_restart_delay_ms")]
  pub restart_delay_ms: u64,

  /// Ceiling for the restart delay.
  #[serde(default = "default_max_restart_delay_ms")]
  pub max_restart_delay_ms: u64,

  /// Consecutive restart attempts before giving up.
  #[serde(default = "default_max_restarts")]
  pub max_restarts: u32,

  /// A process that ran this long resets the restart budget when it exits.
  #[serde(default = "default_stable_after_ms")]
  pub stable_after_ms: u64,
}

fn default_log_file() -> PathBuf {
  std::env::temp_dir().join("mpv_debug.log")
}

fn default_user_agent() -> String {
  "Tivimate".to_string()
}

fn default_true() -> bool {
  true
}

fn default_command_timeout_ms() -> u64 {
  5000
}

fn default_grace_period_ms() -> u64 {
  2000
}

fn default_helper_timeout_ms() -> u64 {
  1000
}

fn default_socket_timeout_ms() -> u64 {
  1500
}

fn default_restart_delay_ms() -> u64 {
  1000
}

fn default_max_restart_delay_ms() -> u64 {
  30_000
}

fn default_max_restarts() -> u32 {
  5
}

fn default_stable_after_ms() -> u64 {
  30_000
}

impl Default for PlayerConfig {
  fn default() -> Self {
    Self {
      mpv_path: None,
      mpv_args: Vec::new(),
      log_file: default_log_file(),
      user_agent: default_user_agent(),
      native_ipc_only: false,
      auto_restart: true,
      command_timeout_ms: default_command_timeout_ms(),
      grace_period_ms: default_grace_period_ms(),
      helper_timeout_ms: default_helper_timeout_ms(),
      socket_timeout_ms: default_socket_timeout_ms(),
      restart_delay_ms: default_restart_delay_ms(),
      max_restart_delay_ms: default_max_restart_delay_ms(),
      max_restarts: default_max_restarts(),
      stable_after_ms: default_stable_after_ms(),
    }
  }
}

impl PlayerConfig {
  /// Load from a JSON file; missing fields take their defaults.
  pub fn load(path: &Path) -> Result<Self, ConfigError> {
    let raw = std::fs::read_to_string(path)?;
    let config: Self = serde_json::from_str(&raw)?;
    config.validate()?;
    Ok(config)
  }

  /// Validate configuration values.
  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.user_agent.trim().is_empty() {
      return Err(ConfigError::Invalid("User agent cannot be empty".into()));
    }
    if self.command_timeout_ms == 0 {
      return Err(ConfigError::Invalid("Command timeout must be positive".into()));
    }
    if self.grace_period_ms == 0 {
      return Err(ConfigError::Invalid("Grace period must be positive".into()));
    }
    if self.helper_timeout_ms == 0 || self.socket_timeout_ms == 0 {
      return Err(ConfigError::Invalid("IPC timeouts must be positive".into()));
    }
    if self.max_restart_delay_ms < self.restart_delay_ms {
      return Err(ConfigError::Invalid(
        "Maximum restart delay cannot be below the initial delay".into(),
      ));
    }
    if let Some(path) = &self.mpv_path {
      if path.as_os_str().is_empty() {
        return Err(ConfigError::Invalid("MPV path cannot be empty".into()));
      }
    }
    Ok(())
  }

  pub fn command_timeout(&self) -> Duration {
    Duration::from_millis(self.command_timeout_ms)
  }

  pub fn grace_period(&self) -> Duration {
    Duration::from_millis(self.grace_period_ms)
  }

  pub fn helper_timeout(&self) -> Duration {
    Duration::from_millis(self.helper_timeout_ms)
  }

  pub fn socket_timeout(&self) -> Duration {
    Duration::from_millis(self.socket_timeout_ms)
  }

  pub fn stable_after(&self) -> Duration {
    Duration::from_millis(self.stable_after_ms)
  }
}
