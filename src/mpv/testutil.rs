//! Fixtures shared by the process and controller tests.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::Mutex;

use super::transport::{Transport, TransportError};
use crate::config::PlayerConfig;

/// Write an executable `/bin/sh` script that stands in for MPV.
pub fn fake_player(dir: &Path, body: &str) -> PathBuf {
  let path = dir.join("fake-mpv");
  std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
  std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
  path
}

/// Lines appended to `<dir>/starts` by a recording fake player.
pub fn count_starts(dir: &Path) -> usize {
  std::fs::read_to_string(dir.join("starts"))
    .map(|s| s.lines().count())
    .unwrap_or(0)
}

pub fn test_config(dir: &Path, player: &Path) -> PlayerConfig {
  PlayerConfig {
    mpv_path: Some(player.to_path_buf()),
    log_file: dir.join("mpv.log"),
    native_ipc_only: true,
    helper_timeout_ms: 500,
    socket_timeout_ms: 1000,
    restart_delay_ms: 100,
    max_restart_delay_ms: 400,
    ..PlayerConfig::default()
  }
}

/// Transport that records what it was asked to deliver.
#[derive(Clone)]
pub struct Recorder {
  lines: Arc<Mutex<Vec<String>>>,
  in_flight: Arc<AtomicUsize>,
  max_in_flight: Arc<AtomicUsize>,
  delay: Duration,
  fail: bool,
}

impl Recorder {
  pub fn new(delay: Duration, fail: bool) -> Self {
    Self {
      lines: Arc::new(Mutex::new(Vec::new())),
      in_flight: Arc::new(AtomicUsize::new(0)),
      max_in_flight: Arc::new(AtomicUsize::new(0)),
      delay,
      fail,
    }
  }

  pub fn lines(&self) -> Vec<String> {
    self.lines.lock().clone()
  }

  pub fn max_in_flight(&self) -> usize {
    self.max_in_flight.load(Ordering::SeqCst)
  }
}

impl Transport for Recorder {
  fn name(&self) -> &str {
    "recorder"
  }

  fn exchange<'a>(
    &'a self,
    _endpoint: &'a Path,
    line: &'a str,
  ) -> BoxFuture<'a, Result<Vec<u8>, TransportError>> {
    async move {
      let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
      self.max_in_flight.fetch_max(now, Ordering::SeqCst);
      tokio::time::sleep(self.delay).await;
      self.lines.lock().push(line.to_string());
      self.in_flight.fetch_sub(1, Ordering::SeqCst);

      if self.fail {
        Err(TransportError::Timeout("recorder".into()))
      } else {
        Ok(b"{\"error\":\"success\"}\n".to_vec())
      }
    }
    .boxed()
  }
}
