//! Playback session state and the auto-restart policy.

use std::time::Duration;

use serde::{Serialize, Serializer};

use super::process::ProcessHandle;
use crate::config::PlayerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum PlaybackState {
  Inactive,
  /// Spawn requested, not yet confirmed.
  Starting,
  Active,
  /// Termination requested, exit not yet observed.
  Stopping,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum RestartStatus {
  Idle,
  Pending { attempt: u32, delay_ms: u64 },
  GaveUp { attempts: u32 },
}

/// Exponential backoff with a ceiling and an attempt budget.
#[derive(Debug, Clone)]
pub struct RestartPolicy {
  pub base_delay: Duration,
  pub max_delay: Duration,
  pub max_attempts: u32,
  pub stable_after: Duration,
}

impl RestartPolicy {
  pub fn from_config(config: &PlayerConfig) -> Self {
    Self {
      base_delay: Duration::from_millis(config.restart_delay_ms),
      max_delay: Duration::from_millis(config.max_restart_delay_ms),
      max_attempts: config.max_restarts,
      stable_after: config.stable_after(),
    }
  }

  /// Delay before 1-based `attempt`.
  pub fn delay_for(&self, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
    self
      .base_delay
      .checked_mul(factor)
      .unwrap_or(self.max_delay)
      .min(self.max_delay)
  }
}

/// What the worker should do about a process exit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitDecision {
  /// Exit was expected (manual stop) or restarts are off.
  Settle,
  Restart {
    url: String,
    attempt: u32,
    delay: Duration,
    epoch: u64,
  },
  GiveUp {
    attempts: u32,
  },
}

/// Mutable session fields. Only the worker task holds one.
#[derive(Debug)]
pub struct Session {
  state: PlaybackState,
  url: Option<String>,
  auto_restart: bool,
  manual_stop: bool,
  attempts: u32,
  epoch: u64,
  restart: RestartStatus,
  policy: RestartPolicy,
}

impl Session {
  pub fn new(auto_restart: bool, policy: RestartPolicy) -> Self {
    Self {
      state: PlaybackState::Inactive,
      url: None,
      auto_restart,
      manual_stop: false,
      attempts: 0,
      epoch: 0,
      restart: RestartStatus::Idle,
      policy,
    }
  }

  pub fn state(&self) -> PlaybackState {
    self.state
  }

  pub fn url(&self) -> Option<&str> {
    self.url.as_deref()
  }

  pub fn restart(&self) -> &RestartStatus {
    &self.restart
  }

  pub fn set_auto_restart(&mut self, enabled: bool) {
    self.auto_restart = enabled;
    if !enabled && matches!(self.restart, RestartStatus::Pending { .. }) {
      self.epoch += 1;
      self.restart = RestartStatus::Idle;
    }
  }

  pub fn set_state(&mut self, state: PlaybackState) {
    if self.state != state {
      log::debug!("Playback state {:?} -> {:?}", self.state, state);
      self.state = state;
    }
  }

  /// Caller asked for `url`. Resets the restart budget and cancels pending restarts.
  pub fn begin_play(&mut self, url: &str) {
    self.url = Some(url.to_string());
    self.manual_stop = false;
    self.attempts = 0;
    self.epoch += 1;
    self.restart = RestartStatus::Idle;
  }

  /// Caller asked to stop. The next exit must not restart.
  pub fn begin_stop(&mut self) {
    self.manual_stop = true;
    self.epoch += 1;
    self.restart = RestartStatus::Idle;
    if self.state != PlaybackState::Inactive {
      self.set_state(PlaybackState::Stopping);
    }
  }

  /// The current process exited after running for `uptime`.
  pub fn on_exit(&mut self, uptime: Duration) -> ExitDecision {
    self.set_state(PlaybackState::Inactive);

    let url = match &self.url {
      Some(url) if self.auto_restart && !self.manual_stop => url.clone(),
      _ => return ExitDecision::Settle,
    };

    if uptime >= self.policy.stable_after {
      self.attempts = 0;
    }

    if self.attempts >= self.policy.max_attempts {
      self.restart = RestartStatus::GaveUp {
        attempts: self.attempts,
      };
      return ExitDecision::GiveUp {
        attempts: self.attempts,
      };
    }

    self.attempts += 1;
    let delay = self.policy.delay_for(self.attempts);
    self.restart = RestartStatus::Pending {
      attempt: self.attempts,
      delay_ms: delay.as_millis() as u64,
    };
    ExitDecision::Restart {
      url,
      attempt: self.attempts,
      delay,
      epoch: self.epoch,
    }
  }

  /// URL to restart with, if the restart scheduled at `epoch` is still wanted.
  pub fn accept_restart(&self, epoch: u64) -> Option<String> {
    if epoch != self.epoch || self.manual_stop || !self.auto_restart {
      return None;
    }
    self.url.clone()
  }

  pub fn restart_spawned(&mut self) {
    self.restart = RestartStatus::Idle;
  }

  pub fn restart_failed(&mut self) {
    self.restart = RestartStatus::GaveUp {
      attempts: self.attempts,
    };
  }
}

/// Snapshot published by the worker after every change.
#[derive(Debug, Clone)]
pub struct PlayerStatus {
  pub state: PlaybackState,
  pub url: Option<String>,
  pub restart: RestartStatus,
  pub process: Option<ProcessHandle>,
}

impl PlayerStatus {
  pub fn inactive() -> Self {
    Self {
      state: PlaybackState::Inactive,
      url: None,
      restart: RestartStatus::Idle,
      process: None,
    }
  }

  pub fn is_active(&self) -> bool {
    self.state == PlaybackState::Active
  }

  pub fn pid(&self) -> Option<u32> {
    self.process.as_ref().map(ProcessHandle::pid)
  }

  pub fn report(&self) -> StatusReport {
    StatusReport {
      active: self.is_active(),
      state: self.state,
      url: self.url.clone(),
      pid: self.pid(),
      restart: self.restart.clone(),
    }
  }
}

impl Serialize for PlayerStatus {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    self.report().serialize(serializer)
  }
}

/// Status shape returned to the HTTP layer.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
  pub active: bool,
  pub state: PlaybackState,
  pub url: Option<String>,
  pub pid: Option<u32>,
  pub restart: RestartStatus,
}
