//! Public handle for controlling one supervised MPV session.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::process::{ProcessError, ProcessHandle};
use super::protocol::{self, ControlMessage};
use super::session::PlayerStatus;
use super::transport::{TransportChain, TransportError};
use super::worker::{Command, Reply, Worker, WorkerParts};
use crate::config::{ConfigError, PlayerConfig};

#[derive(Error, Debug)]
pub enum PlayerError {
  #[error("Process error: {0}")]
  Process(#[from] ProcessError),
  #[error("IPC error: {0}")]
  Transport(#[from] TransportError),
  #[error("Config error: {0}")]
  Config(#[from] ConfigError),
  #[error("Failed to create socket directory: {0}")]
  TempDir(std::io::Error),
  #[error("Timed out waiting for player, command queue might be blocked")]
  QueueBlocked,
  #[error("Player has been shut down")]
  ShutDown,
  #[error("Player is not active")]
  NotActive,
}

const COMMAND_QUEUE: usize = 10;

/// Handle to a supervised MPV session.
///
/// All mutating calls are queued to a single worker task. Must be created
/// inside a Tokio runtime.
pub struct PlayerController {
  commands: async_channel::Sender<Command>,
  status: watch::Receiver<PlayerStatus>,
  transport: Arc<TransportChain>,
  endpoint: PathBuf,
  command_timeout: Duration,
  shutdown_timeout: Duration,
  cancel: CancellationToken,
  worker: Mutex<Option<JoinHandle<()>>>,
}

impl PlayerController {
  /// Create a controller using the transport chain the config asks for.
  pub fn new(config: PlayerConfig) -> Result<Self, PlayerError> {
    let transport = if config.native_ipc_only {
      TransportChain::native_only(config.socket_timeout())
    } else {
      TransportChain::standard(config.helper_timeout(), config.socket_timeout())
    };
    Self::with_transport(config, transport)
  }

  pub fn with_transport(
    config: PlayerConfig,
    transport: TransportChain,
  ) -> Result<Self, PlayerError> {
    config.validate()?;

    let socket_dir = tempfile::Builder::new()
      .prefix("mpv-socket-")
      .tempdir()
      .map_err(PlayerError::TempDir)?;
    let nanos = SystemTime::now()
      .duration_since(UNIX_EPOCH)
      .map(|d| d.as_nanos())
      .unwrap_or_default();
    let endpoint = socket_dir.path().join(format!("mpvsocket_{}", nanos));

    log::info!(
      "Creating player (IPC endpoint: {}, transports: {:?})",
      endpoint.display(),
      transport.names()
    );

    let config = Arc::new(config);
    let transport = Arc::new(transport);
    let (commands_tx, commands) = async_channel::bounded(COMMAND_QUEUE);
    let (status_tx, status) = watch::channel(PlayerStatus::inactive());
    let cancel = CancellationToken::new();

    let worker = Worker::new(WorkerParts {
      config: config.clone(),
      transport: transport.clone(),
      socket_dir,
      endpoint: endpoint.clone(),
      commands_tx: commands_tx.clone(),
      commands,
      status: status_tx,
      cancel: cancel.clone(),
    });
    let handle = tokio::spawn(worker.run());

    Ok(Self {
      commands: commands_tx,
      status,
      transport,
      endpoint,
      command_timeout: config.command_timeout(),
      shutdown_timeout: config.command_timeout() + config.grace_period() + Duration::from_secs(1),
      cancel,
      worker: Mutex::new(Some(handle)),
    })
  }

  /// Queue a command and wait for its reply, up to `timeout`.
  async fn submit(
    &self,
    timeout: Duration,
    build: impl FnOnce(Reply) -> Command,
  ) -> Result<(), PlayerError> {
    let (tx, rx) = oneshot::channel();
    let command = build(tx);

    let exchange = async {
      self
        .commands
        .send(command)
        .await
        .map_err(|_| PlayerError::ShutDown)?;
      rx.await.map_err(|_| PlayerError::ShutDown)?
    };

    match tokio::time::timeout(timeout, exchange).await {
      Ok(result) => result,
      Err(_) => Err(PlayerError::QueueBlocked),
    }
  }

  /// Play `url`, swapping media in place when MPV is already running.
  pub async fn play(&self, url: &str) -> Result<(), PlayerError> {
    log::info!("Play requested: {}", url);
    let url = url.to_string();
    self
      .submit(self.command_timeout, |reply| Command::Play { url, reply })
      .await
  }

  /// Stop playback. A no-op when nothing is running.
  pub async fn stop(&self) -> Result<(), PlayerError> {
    log::info!("Stop requested");
    self
      .submit(self.command_timeout, |reply| Command::Stop { reply })
      .await
  }

  pub async fn set_auto_restart(&self, enabled: bool) -> Result<(), PlayerError> {
    self
      .submit(self.command_timeout, |reply| Command::SetAutoRestart {
        enabled,
        reply,
      })
      .await
  }

  pub fn is_active(&self) -> bool {
    self.status.borrow().is_active()
  }

  pub fn status(&self) -> PlayerStatus {
    self.status.borrow().clone()
  }

  /// Receiver that sees every status change.
  pub fn subscribe(&self) -> watch::Receiver<PlayerStatus> {
    self.status.clone()
  }

  pub fn endpoint(&self) -> &Path {
    &self.endpoint
  }

  /// Probe the OS for the current process. Never changes session state.
  pub fn is_process_alive(&self) -> Result<bool, PlayerError> {
    if self.commands.is_closed() {
      return Err(PlayerError::ShutDown);
    }
    Ok(
      self
        .status
        .borrow()
        .process
        .as_ref()
        .is_some_and(ProcessHandle::is_alive),
    )
  }

  /// Ask MPV for the `media-title` property.
  pub async fn media_title(&self) -> Result<String, PlayerError> {
    if !self.is_active() {
      return Err(PlayerError::NotActive);
    }

    let response = self
      .transport
      .query(&self.endpoint, &ControlMessage::get_property("media-title"))
      .await?;
    log::debug!("Media title response: {:?}", response.data);
    Ok(protocol::media_title(response.data.as_ref()))
  }

  /// Terminate MPV, remove the socket directory and stop the worker.
  ///
  /// Only the first call does anything; later calls return `Ok(())`.
  pub async fn cleanup(&self) -> Result<(), PlayerError> {
    let Some(worker) = self.worker.lock().take() else {
      return Ok(());
    };

    let result = match self
      .submit(self.shutdown_timeout, |reply| Command::Shutdown { reply })
      .await
    {
      Err(PlayerError::ShutDown) => Ok(()),
      other => other,
    };

    // Covers a worker stuck past the shutdown timeout.
    self.cancel.cancel();
    if let Err(e) = worker.await {
      log::error!("Player worker task failed: {}", e);
    }

    log::info!("Player cleaned up");
    result
  }
}

impl Drop for PlayerController {
  fn drop(&mut self) {
    self.cancel.cancel();
  }
}
