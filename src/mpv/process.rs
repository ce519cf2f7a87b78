//! MPV process detection, spawning and termination.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::watch;

use crate::config::PlayerConfig;

#[derive(Error, Debug)]
pub enum ProcessError {
  #[error("MPV executable not found")]
  NotFound,
  #[error("Failed to spawn MPV: {0}")]
  SpawnFailed(#[from] std::io::Error),
  #[error("Failed to signal MPV (pid {pid}): {source}")]
  SignalFailed { pid: u32, source: std::io::Error },
  #[error("MPV (pid {0}) still alive after forced kill")]
  StillAlive(u32),
}

/// Find MPV executable in common locations.
pub fn find_mpv() -> Option<PathBuf> {
  // Check PATH first
  if let Ok(path) = which::which("mpv") {
    return Some(path);
  }

  #[cfg(target_os = "macos")]
  {
    let common_paths = [
      "/usr/local/bin/mpv",
      "/opt/homebrew/bin/mpv",
      "/Applications/mpv.app/Contents/MacOS/mpv",
    ];
    for path in common_paths {
      let p = PathBuf::from(path);
      if p.exists() {
        return Some(p);
      }
    }
  }

  #[cfg(target_os = "linux")]
  {
    let common_paths = ["/usr/bin/mpv", "/usr/local/bin/mpv", "/snap/bin/mpv"];
    for path in common_paths {
      let p = PathBuf::from(path);
      if p.exists() {
        return Some(p);
      }
    }
  }

  None
}

/// Full MPV command line for one playback session. The URL is always last.
pub fn build_args(config: &PlayerConfig, endpoint: &Path, url: &str) -> Vec<String> {
  let mut args: Vec<String> = [
    "--no-config",
    "--terminal=no",
    "--msg-level=all=debug",
  ]
  .iter()
  .map(|s| s.to_string())
  .collect();

  args.push(format!("--log-file={}", config.log_file.display()));

  args.extend(
    [
      "--audio-channels=stereo",
      "--ao=pulse,alsa,coreaudio",
      "--volume=100",
      "--audio-device=auto",
      "--vo=gpu",
      "--cache=yes",
      "--cache-secs=60",
      "--demuxer-max-bytes=500M",
      "--demuxer-max-back-bytes=100M",
      "--no-ytdl",
      "--ytdl=no",
      "--force-seekable=yes",
      "--network-timeout=30",
    ]
    .iter()
    .map(|s| s.to_string()),
  );

  args.push(format!("--user-agent={}", config.user_agent));

  args.extend(
    [
      "--stream-lavf-o=reconnect=1",
      "--stream-lavf-o=reconnect_at_eof=1",
      "--stream-lavf-o=reconnect_streamed=1",
      "--stream-lavf-o=reconnect_delay_max=5",
      "--hls-bitrate=max",
    ]
    .iter()
    .map(|s| s.to_string()),
  );

  args.push(format!("--input-ipc-server={}", endpoint.display()));
  args.extend(config.mpv_args.iter().cloned());
  args.push(url.to_string());
  args
}

fn send_signal(pid: u32, signal: libc::c_int) -> std::io::Result<()> {
  // SAFETY: kill(2) takes plain integers and touches no memory of ours.
  let rc = unsafe { libc::kill(pid as libc::pid_t, signal) };
  if rc == 0 {
    Ok(())
  } else {
    Err(std::io::Error::last_os_error())
  }
}

/// Reported by the exit watcher once the process is gone.
#[derive(Debug, Clone)]
pub struct ExitEvent {
  pub generation: u64,
  pub pid: u32,
  pub code: Option<i32>,
  pub uptime: Duration,
}

/// Cloneable probe of one spawned MPV process.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
  pid: u32,
  generation: u64,
  started_at: Instant,
  exited: watch::Receiver<bool>,
}

impl ProcessHandle {
  pub fn pid(&self) -> u32 {
    self.pid
  }

  pub fn generation(&self) -> u64 {
    self.generation
  }

  pub fn uptime(&self) -> Duration {
    self.started_at.elapsed()
  }

  pub fn has_exited(&self) -> bool {
    *self.exited.borrow()
  }

  /// Zero-signal liveness probe.
  pub fn is_alive(&self) -> bool {
    if self.has_exited() {
      return false;
    }
    match send_signal(self.pid, 0) {
      Ok(()) => true,
      Err(e) => e.raw_os_error() == Some(libc::EPERM),
    }
  }

  /// Wait until the exit watcher has reaped the process.
  pub async fn wait_exit(&self, timeout: Duration) -> bool {
    let mut exited = self.exited.clone();
    let done = tokio::time::timeout(timeout, exited.wait_for(|gone| *gone))
      .await
      .is_ok();
    done
  }

  /// SIGTERM now, SIGKILL once `grace` runs out.
  pub fn terminate(&self, grace: Duration) -> Result<(), ProcessError> {
    if self.has_exited() {
      return Ok(());
    }

    log::info!("Sending SIGTERM to MPV process (pid: {})", self.pid);
    if let Err(e) = send_signal(self.pid, libc::SIGTERM) {
      log::warn!("Error sending SIGTERM to MPV: {}; trying SIGKILL", e);
      return self.kill();
    }

    let handle = self.clone();
    tokio::spawn(async move {
      if !handle.wait_exit(grace).await && handle.is_alive() {
        log::warn!(
          "Forcing kill of MPV process (pid: {}) after {:?}",
          handle.pid,
          grace
        );
        if let Err(e) = handle.kill() {
          log::error!("{}", e);
        }
      }
    });

    Ok(())
  }

  /// SIGKILL immediately.
  pub fn kill(&self) -> Result<(), ProcessError> {
    if self.has_exited() {
      return Ok(());
    }
    send_signal(self.pid, libc::SIGKILL).map_err(|source| ProcessError::SignalFailed {
      pid: self.pid,
      source,
    })
  }
}

/// Owns the MPV child of one session and hands out [`ProcessHandle`]s.
pub struct Supervisor {
  endpoint: PathBuf,
  events: async_channel::Sender<ExitEvent>,
  current: Option<ProcessHandle>,
  next_generation: u64,
}

impl Supervisor {
  pub fn new(endpoint: PathBuf, events: async_channel::Sender<ExitEvent>) -> Self {
    Self {
      endpoint,
      events,
      current: None,
      next_generation: 1,
    }
  }

  pub fn endpoint(&self) -> &Path {
    &self.endpoint
  }

  pub fn current(&self) -> Option<&ProcessHandle> {
    self.current.as_ref()
  }

  pub fn is_alive(&self) -> bool {
    self.current.as_ref().is_some_and(ProcessHandle::is_alive)
  }

  /// Forget the handle if it belongs to `generation`. Returns whether it did.
  pub fn release(&mut self, generation: u64) -> bool {
    match &self.current {
      Some(handle) if handle.generation == generation => {
        self.current = None;
        true
      }
      _ => false,
    }
  }

  /// Spawn MPV for `url` and start watching it.
  pub fn start(&mut self, config: &PlayerConfig, url: &str) -> Result<ProcessHandle, ProcessError> {
    let mpv_exe = config
      .mpv_path
      .clone()
      .or_else(find_mpv)
      .ok_or(ProcessError::NotFound)?;

    if self.endpoint.exists() {
      let _ = std::fs::remove_file(&self.endpoint);
    }

    let args = build_args(config, &self.endpoint, url);
    log::info!("Starting MPV with URL: {}", url);
    log::info!("Debug logs will be saved to: {}", config.log_file.display());
    log::debug!("MPV command: {} {}", mpv_exe.display(), args.join(" "));

    let mut child = Command::new(&mpv_exe)
      .args(&args)
      .stdin(Stdio::null())
      .stdout(Stdio::null())
      .stderr(Stdio::piped())
      .spawn()?;

    let pid = child
      .id()
      .ok_or_else(|| std::io::Error::other("process exited before its pid was read"))?;
    let generation = self.next_generation;
    self.next_generation += 1;

    if let Some(stderr) = child.stderr.take() {
      tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        loop {
          match lines.next_line().await {
            Ok(Some(line)) => log::debug!("MPV stderr: {}", line),
            Ok(None) => break,
            Err(e) => {
              log::warn!("Error reading from MPV stderr: {}", e);
              break;
            }
          }
        }
      });
    }

    let (exited_tx, exited_rx) = watch::channel(false);
    let started_at = Instant::now();
    let events = self.events.clone();
    tokio::spawn(async move {
      let code = match child.wait().await {
        Ok(status) => {
          log::info!("MPV process (pid: {}) exited with: {}", pid, status);
          status.code()
        }
        Err(e) => {
          log::error!("wait() on MPV process (pid: {}) failed: {}", pid, e);
          None
        }
      };
      let _ = exited_tx.send(true);

      let event = ExitEvent {
        generation,
        pid,
        code,
        uptime: started_at.elapsed(),
      };
      if events.send(event).await.is_err() {
        log::debug!("Exit of MPV pid {} not delivered; controller is gone", pid);
      }
    });

    log::info!("MPV started with PID: {}", pid);
    let handle = ProcessHandle {
      pid,
      generation,
      started_at,
      exited: exited_rx,
    };
    self.current = Some(handle.clone());
    Ok(handle)
  }
}

/// Last `n` bytes of the MPV log file, cut on a char boundary.
pub fn log_tail(path: &Path, n: usize) -> std::io::Result<String> {
  let contents = std::fs::read(path)?;
  let text = String::from_utf8_lossy(&contents);
  if text.len() <= n {
    return Ok(text.into_owned());
  }
  let mut start = text.len() - n;
  while !text.is_char_boundary(start) {
    start += 1;
  }
  Ok(text[start..].to_string())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::mpv::testutil::{fake_player, test_config};

  #[test]
  fn test_args_shape() {
    let config = PlayerConfig::default();
    let endpoint = Path::new("/tmp/mpv-socket-x/mpvsocket_1");
    let args = build_args(&config, endpoint, "http://host/a.m3u8");

    assert_eq!(args.first().map(String::as_str), Some("--no-config"));
    assert_eq!(args.last().map(String::as_str), Some("http://host/a.m3u8"));
    assert!(args.contains(&"--input-ipc-server=/tmp/mpv-socket-x/mpvsocket_1".to_string()));
    assert!(args.contains(&"--user-agent=Tivimate".to_string()));
    assert!(args.contains(&"--stream-lavf-o=reconnect_streamed=1".to_string()));
    assert!(!args.contains(&"--input-ipc-server=/tmp/mpvsocket".to_string()));
  }

  #[test]
  fn test_extra_args_precede_url() {
    let config = PlayerConfig {
      mpv_args: vec!["--mute=yes".into()],
      ..PlayerConfig::default()
    };
    let args = build_args(&config, Path::new("/tmp/s"), "http://host/b");
    let n = args.len();
    assert_eq!(args[n - 2], "--mute=yes");
    assert_eq!(args[n - 1], "http://host/b");
  }

  #[test]
  fn test_log_tail_char_boundary() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mpv.log");
    std::fs::write(&path, "aaaé").unwrap();
    assert_eq!(log_tail(&path, 1).unwrap(), "");
    assert_eq!(log_tail(&path, 2).unwrap(), "é");
    assert_eq!(log_tail(&path, 100).unwrap(), "aaaé");
  }

  #[tokio::test]
  async fn test_spawn_failure() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), &dir.path().join("missing-mpv"));
    let (tx, _rx) = async_channel::bounded(4);
    let mut supervisor = Supervisor::new(dir.path().join("sock"), tx);

    let err = supervisor.start(&config, "http://host/a").unwrap_err();
    assert!(matches!(err, ProcessError::SpawnFailed(_)));
    assert!(supervisor.current().is_none());
  }

  #[tokio::test]
  async fn test_terminate_reports_exit() {
    let dir = tempfile::tempdir().unwrap();
    let player = fake_player(dir.path(), "exec sleep 30");
    let config = test_config(dir.path(), &player);
    let (tx, rx) = async_channel::bounded(4);
    let mut supervisor = Supervisor::new(dir.path().join("sock"), tx);

    let handle = supervisor.start(&config, "http://host/a").unwrap();
    assert!(handle.is_alive());
    assert!(supervisor.is_alive());

    handle.terminate(Duration::from_secs(2)).unwrap();
    assert!(handle.wait_exit(Duration::from_millis(2500)).await);
    assert!(!handle.is_alive());

    let event = rx.recv().await.unwrap();
    assert_eq!(event.generation, handle.generation());
    assert_eq!(event.pid, handle.pid());
    assert!(supervisor.release(event.generation));
    assert!(supervisor.current().is_none());
  }

  #[tokio::test]
  async fn test_terminate_escalates_to_kill() {
    let dir = tempfile::tempdir().unwrap();
    let player = fake_player(dir.path(), "trap '' TERM\nwhile true; do sleep 0.1; done");
    let config = test_config(dir.path(), &player);
    let (tx, _rx) = async_channel::bounded(4);
    let mut supervisor = Supervisor::new(dir.path().join("sock"), tx);

    let handle = supervisor.start(&config, "http://host/a").unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    handle.terminate(Duration::from_millis(300)).unwrap();

    assert!(!handle.wait_exit(Duration::from_millis(150)).await);
    assert!(handle.wait_exit(Duration::from_secs(2)).await);
    assert!(!handle.is_alive());
  }

  #[tokio::test]
  async fn test_generations_increase() {
    let dir = tempfile::tempdir().unwrap();
    let player = fake_player(dir.path(), "exec sleep 30");
    let config = test_config(dir.path(), &player);
    let (tx, _rx) = async_channel::bounded(4);
    let mut supervisor = Supervisor::new(dir.path().join("sock"), tx);

    let first = supervisor.start(&config, "http://host/a").unwrap();
    first.kill().unwrap();
    assert!(first.wait_exit(Duration::from_secs(2)).await);

    let second = supervisor.start(&config, "http://host/b").unwrap();
    assert!(second.generation() > first.generation());
    assert!(!supervisor.release(first.generation()));
    second.kill().unwrap();
    assert!(second.wait_exit(Duration::from_secs(2)).await);
  }
}
