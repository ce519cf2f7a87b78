//! Single consumer that owns the playback session.
//!
//! Every mutating operation arrives as a [`Command`] and runs to completion
//! before the next one starts. Process exits arrive on a separate event
//! stream and are applied between commands.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;

use super::controller::PlayerError;
use super::process::{log_tail, ExitEvent, ProcessError, Supervisor};
use super::protocol::ControlMessage;
use super::session::{ExitDecision, PlaybackState, PlayerStatus, RestartPolicy, Session};
use super::transport::TransportChain;
use crate::config::PlayerConfig;

pub(crate) type Reply = oneshot::Sender<Result<(), PlayerError>>;

/// Queued unit of work for the worker.
pub(crate) enum Command {
  Play { url: String, reply: Reply },
  Stop { reply: Reply },
  SetAutoRestart { enabled: bool, reply: Reply },
  /// Scheduled by the restart policy; stale epochs are dropped.
  Restart { epoch: u64 },
  Shutdown { reply: Reply },
}

/// Extra time allowed past the grace period for SIGKILL to land.
const KILL_SLACK: Duration = Duration::from_secs(1);

const LOG_TAIL_BYTES: usize = 500;

pub(crate) struct Worker {
  config: Arc<PlayerConfig>,
  session: Session,
  supervisor: Supervisor,
  transport: Arc<TransportChain>,
  commands_tx: async_channel::Sender<Command>,
  commands: async_channel::Receiver<Command>,
  events: async_channel::Receiver<ExitEvent>,
  status: watch::Sender<PlayerStatus>,
  cancel: CancellationToken,
  // Holds the IPC endpoint; removed from disk when the worker is dropped.
  _socket_dir: TempDir,
}

pub(crate) struct WorkerParts {
  pub config: Arc<PlayerConfig>,
  pub transport: Arc<TransportChain>,
  pub socket_dir: TempDir,
  pub endpoint: PathBuf,
  pub commands_tx: async_channel::Sender<Command>,
  pub commands: async_channel::Receiver<Command>,
  pub status: watch::Sender<PlayerStatus>,
  pub cancel: CancellationToken,
}

impl Worker {
  pub(crate) fn new(parts: WorkerParts) -> Self {
    let (events_tx, events) = async_channel::bounded(16);
    let session = Session::new(
      parts.config.auto_restart,
      RestartPolicy::from_config(&parts.config),
    );

    Self {
      supervisor: Supervisor::new(parts.endpoint, events_tx),
      session,
      config: parts.config,
      transport: parts.transport,
      commands_tx: parts.commands_tx,
      commands: parts.commands,
      events,
      status: parts.status,
      cancel: parts.cancel,
      _socket_dir: parts.socket_dir,
    }
  }

  pub(crate) async fn run(mut self) {
    log::info!(
      "Player worker started (endpoint: {})",
      self.supervisor.endpoint().display()
    );

    loop {
      tokio::select! {
        biased;
        _ = self.cancel.cancelled() => {
          self.abort();
          self.publish();
          break;
        }
        Ok(event) = self.events.recv() => self.on_exit(event),
        cmd = self.commands.recv() => match cmd {
          Ok(cmd) => {
            if !self.handle(cmd).await {
              break;
            }
          }
          Err(_) => break,
        },
      }
    }

    self.commands.close();
    self.refuse_queued();
    log::info!("Player worker stopped");
  }

  /// Answer whatever was queued behind the shutdown.
  fn refuse_queued(&self) {
    while let Ok(cmd) = self.commands.try_recv() {
      let reply = match cmd {
        Command::Play { reply, .. }
        | Command::Stop { reply }
        | Command::SetAutoRestart { reply, .. }
        | Command::Shutdown { reply } => reply,
        Command::Restart { .. } => continue,
      };
      let _ = reply.send(Err(PlayerError::ShutDown));
    }
  }

  /// Run one command. Returns false once the worker should exit.
  /// Status is published before the reply goes out.
  async fn handle(&mut self, cmd: Command) -> bool {
    let (result, reply, keep_running) = match cmd {
      Command::Play { url, reply } => (self.play(&url).await, Some(reply), true),
      Command::Stop { reply } => (self.stop(), Some(reply), true),
      Command::SetAutoRestart { enabled, reply } => {
        log::info!("Auto-restart {}", if enabled { "enabled" } else { "disabled" });
        self.session.set_auto_restart(enabled);
        (Ok(()), Some(reply), true)
      }
      Command::Restart { epoch } => {
        self.restart(epoch).await;
        (Ok(()), None, true)
      }
      Command::Shutdown { reply } => {
        // New submissions fail from here on.
        self.commands.close();
        (self.shutdown().await, Some(reply), false)
      }
    };

    self.publish();
    if let Some(reply) = reply {
      let _ = reply.send(result);
    }
    keep_running
  }

  fn publish(&self) {
    self.status.send_replace(PlayerStatus {
      state: self.session.state(),
      url: self.session.url().map(str::to_string),
      restart: self.session.restart().clone(),
      process: self.supervisor.current().cloned(),
    });
  }

  async fn play(&mut self, url: &str) -> Result<(), PlayerError> {
    self.session.begin_play(url);

    if self.session.state() == PlaybackState::Active && self.supervisor.is_alive() {
      log::info!("MPV already running, trying to change URL with loadfile command");
      match self
        .transport
        .command(self.supervisor.endpoint(), &ControlMessage::loadfile(url))
        .await
      {
        Ok(_) => {
          log::info!("Successfully changed URL to: {}", url);
          return Ok(());
        }
        Err(e) => log::warn!("Failed to change URL with loadfile, will restart MPV: {}", e),
      }
    }

    self.launch(url).await
  }

  /// Stop whatever runs now, then spawn a fresh process for `url`.
  async fn launch(&mut self, url: &str) -> Result<(), PlayerError> {
    self.retire().await;

    self.session.set_state(PlaybackState::Starting);
    self.publish();

    match self.supervisor.start(&self.config, url) {
      Ok(_) => {
        self.session.set_state(PlaybackState::Active);
        Ok(())
      }
      Err(e) => {
        log::error!("Error starting MPV: {}", e);
        self.session.set_state(PlaybackState::Inactive);
        Err(e.into())
      }
    }
  }

  /// Terminate the current process and wait (bounded) for it to go away.
  async fn retire(&mut self) {
    let Some(handle) = self.supervisor.current().cloned() else {
      return;
    };

    if !handle.has_exited() {
      log::info!(
        "Stopping existing player (pid {}, up {:?}) before starting new one",
        handle.pid(),
        handle.uptime()
      );
      self.session.set_state(PlaybackState::Stopping);
      self.publish();

      if let Err(e) = handle.terminate(self.config.grace_period()) {
        log::warn!("Error stopping existing player: {}", e);
      }
      if !handle.wait_exit(self.config.grace_period() + KILL_SLACK).await {
        log::warn!("Timeout waiting for player (pid {}) to stop", handle.pid());
      }
    }

    // Its exit event is stale from here on.
    self.supervisor.release(handle.generation());
  }

  fn stop(&mut self) -> Result<(), PlayerError> {
    log::info!("Stopping MPV player");
    self.session.begin_stop();

    let handle = match self.supervisor.current().cloned() {
      Some(handle) if !handle.has_exited() => handle,
      Some(handle) => {
        self.supervisor.release(handle.generation());
        self.session.set_state(PlaybackState::Inactive);
        return Ok(());
      }
      None => {
        log::info!("No active MPV process to stop");
        self.session.set_state(PlaybackState::Inactive);
        return Ok(());
      }
    };

    handle.terminate(self.config.grace_period())?;
    Ok(())
  }

  async fn restart(&mut self, epoch: u64) {
    let Some(url) = self.session.accept_restart(epoch) else {
      log::debug!("Dropping stale restart request");
      return;
    };

    log::info!("Auto-restarting MPV with URL: {}", url);
    match self.launch(&url).await {
      Ok(()) => self.session.restart_spawned(),
      Err(e) => {
        log::error!("Auto-restart failed, giving up: {}", e);
        self.session.restart_failed();
      }
    }
  }

  fn on_exit(&mut self, event: ExitEvent) {
    if !self.supervisor.release(event.generation) {
      log::debug!("Ignoring exit of retired MPV process (pid {})", event.pid);
      return;
    }

    log::info!(
      "MPV process (pid {}) ended after {:?} with code {:?}",
      event.pid,
      event.uptime,
      event.code
    );

    match self.session.on_exit(event.uptime) {
      ExitDecision::Settle => {}
      ExitDecision::Restart {
        url,
        attempt,
        delay,
        epoch,
      } => {
        log::warn!(
          "MPV exited unexpectedly; restart {}/{} for {} in {:?}",
          attempt,
          self.config.max_restarts,
          url,
          delay
        );
        self.dump_log_tail();

        let commands = self.commands_tx.clone();
        tokio::spawn(async move {
          tokio::time::sleep(delay).await;
          if commands.send(Command::Restart { epoch }).await.is_err() {
            log::debug!("Restart not queued; player is shutting down");
          }
        });
      }
      ExitDecision::GiveUp { attempts } => {
        log::error!(
          "MPV keeps exiting; giving up after {} restart attempts",
          attempts
        );
        self.dump_log_tail();
      }
    }

    self.publish();
  }

  fn dump_log_tail(&self) {
    let path = self.config.log_file.clone();
    tokio::spawn(async move {
      // Give MPV's log writer a moment to flush.
      tokio::time::sleep(Duration::from_millis(500)).await;
      match tokio::task::spawn_blocking(move || log_tail(&path, LOG_TAIL_BYTES)).await {
        Ok(Ok(tail)) => log::warn!(
          "MPV log file contents (last {} bytes):\n{}",
          LOG_TAIL_BYTES,
          tail
        ),
        Ok(Err(e)) => log::debug!("Error reading MPV log file: {}", e),
        Err(e) => log::debug!("Log tail task failed: {}", e),
      }
    });
  }

  async fn shutdown(&mut self) -> Result<(), PlayerError> {
    log::info!("Shutting down player session");
    self.session.begin_stop();

    let Some(handle) = self.supervisor.current().cloned() else {
      self.session.set_state(PlaybackState::Inactive);
      return Ok(());
    };
    self.supervisor.release(handle.generation());
    self.session.set_state(PlaybackState::Inactive);

    if handle.has_exited() {
      return Ok(());
    }
    handle.terminate(self.config.grace_period())?;
    let exited = handle
      .wait_exit(self.config.grace_period() + KILL_SLACK)
      .await;
    if !exited && handle.is_alive() {
      log::error!(
        "MPV process (pid {}) survived forced termination",
        handle.pid()
      );
      return Err(ProcessError::StillAlive(handle.pid()).into());
    }
    Ok(())
  }

  /// Cancellation path: no time to wait, kill outright.
  fn abort(&mut self) {
    if let Some(handle) = self.supervisor.current().cloned() {
      if let Err(e) = handle.kill() {
        log::error!("Error killing MPV process: {}", e);
      }
      self.supervisor.release(handle.generation());
    }
    self.session.begin_stop();
    self.session.set_state(PlaybackState::Inactive);
  }
}
