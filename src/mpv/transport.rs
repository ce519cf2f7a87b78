//! Delivery of control messages to the MPV IPC endpoint.
//!
//! A [`TransportChain`] holds an ordered list of [`Transport`] strategies.
//! Each message goes to the first strategy; the next one is only tried when
//! the previous one failed to execute.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::process::Command;
use tokio::time::Instant;

use super::protocol::{interpret_reply, parse_reply, ControlMessage, ControlResponse, Reply};

#[derive(Error, Debug)]
pub enum TransportError {
  #[error("IPC endpoint not available: {0}")]
  EndpointMissing(PathBuf),
  #[error("Failed to launch {tool}: {source}")]
  Spawn {
    tool: String,
    source: std::io::Error,
  },
  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),
  #[error("{tool} exited with {status}: {stderr}")]
  HelperFailed {
    tool: String,
    status: String,
    stderr: String,
  },
  #[error("{0} timed out")]
  Timeout(String),
  #[error("MPV error: {0}")]
  Rejected(String),
  #[error("Invalid reply: {0}")]
  InvalidReply(String),
  #[error("Failed to encode command: {0}")]
  Encode(#[from] serde_json::Error),
  #[error("All transports failed: {}", .0.join("; "))]
  Exhausted(Vec<String>),
}

/// One way of getting a line to the endpoint and reading back what it says.
pub trait Transport: Send + Sync {
  fn name(&self) -> &str;

  /// Deliver `line` (no trailing newline) and return the raw reply bytes.
  ///
  /// An error means the line was not delivered, so the chain may retry it
  /// with the next strategy.
  fn exchange<'a>(
    &'a self,
    endpoint: &'a Path,
    line: &'a str,
  ) -> BoxFuture<'a, Result<Vec<u8>, TransportError>>;
}

/// Pipes the message through an external tool such as `socat` or `nc`.
pub struct HelperTransport {
  program: String,
  args: Vec<String>,
  timeout: Duration,
}

impl HelperTransport {
  /// `program <args...> <endpoint>`, fed the message on stdin.
  pub fn new(program: impl Into<String>, args: &[&str], timeout: Duration) -> Self {
    Self {
      program: program.into(),
      args: args.iter().map(|a| a.to_string()).collect(),
      timeout,
    }
  }

  pub fn socat(timeout: Duration) -> Self {
    Self::new("socat", &["-"], timeout)
  }

  pub fn netcat(timeout: Duration) -> Self {
    Self::new("nc", &["-U"], timeout)
  }

  async fn run(&self, endpoint: &Path, line: &str) -> Result<Vec<u8>, TransportError> {
    let deadline = Instant::now() + self.timeout;
    let mut child = Command::new(&self.program)
      .args(&self.args)
      .arg(endpoint)
      .stdin(Stdio::piped())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .kill_on_drop(true)
      .spawn()
      .map_err(|source| TransportError::Spawn {
        tool: self.program.clone(),
        source,
      })?;

    if let Some(mut stdin) = child.stdin.take() {
      let write = async {
        stdin.write_all(line.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await
      };
      match tokio::time::timeout_at(deadline, write).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => return Err(TransportError::Timeout(self.program.clone())),
      }
      // Dropping stdin sends EOF.
    }

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let (out_pipe, err_pipe) = (child.stdout.take(), child.stderr.take());
    let finished = tokio::time::timeout_at(deadline, async {
      let (status, _, _) = tokio::join!(
        child.wait(),
        drain(out_pipe, &mut stdout),
        drain(err_pipe, &mut stderr),
      );
      status
    })
    .await;

    let status = match finished {
      Ok(status) => status?,
      Err(_) => {
        // The line is already written; retrying elsewhere would deliver it twice.
        log::debug!(
          "{} still running after delivering the command, stopping it",
          self.program
        );
        let _ = child.kill().await;
        return Ok(stdout);
      }
    };

    if !status.success() {
      return Err(TransportError::HelperFailed {
        tool: self.program.clone(),
        status: status.to_string(),
        stderr: String::from_utf8_lossy(&stderr).trim().to_string(),
      });
    }

    Ok(stdout)
  }
}

/// Copy a pipe into `buf` chunk by chunk, so a cancelled read keeps what arrived.
async fn drain<R>(pipe: Option<R>, buf: &mut Vec<u8>) -> std::io::Result<()>
where
  R: AsyncRead + Unpin,
{
  let Some(mut pipe) = pipe else {
    return Ok(());
  };
  let mut chunk = [0u8; 1024];
  loop {
    let n = pipe.read(&mut chunk).await?;
    if n == 0 {
      return Ok(());
    }
    buf.extend_from_slice(&chunk[..n]);
  }
}

impl Transport for HelperTransport {
  fn name(&self) -> &str {
    &self.program
  }

  fn exchange<'a>(
    &'a self,
    endpoint: &'a Path,
    line: &'a str,
  ) -> BoxFuture<'a, Result<Vec<u8>, TransportError>> {
    self.run(endpoint, line).boxed()
  }
}

/// Talks to the Unix socket directly.
pub struct NativeTransport {
  timeout: Duration,
}

impl NativeTransport {
  pub fn new(timeout: Duration) -> Self {
    Self { timeout }
  }

  async fn talk(endpoint: &Path, line: &str) -> Result<Vec<u8>, TransportError> {
    let mut stream = UnixStream::connect(endpoint).await?;
    stream.write_all(line.as_bytes()).await?;
    stream.write_all(b"\n").await?;
    stream.flush().await?;

    let mut lines = BufReader::new(stream).lines();
    while let Some(reply) = lines.next_line().await? {
      if is_event_line(&reply) {
        log::debug!("Skipping MPV event while waiting for reply: {}", reply);
        continue;
      }
      return Ok(reply.into_bytes());
    }
    Ok(Vec::new())
  }
}

fn is_event_line(line: &str) -> bool {
  serde_json::from_str::<serde_json::Value>(line)
    .map(|v| v.get("event").is_some() && v.get("error").is_none())
    .unwrap_or(false)
}

impl Transport for NativeTransport {
  fn name(&self) -> &str {
    "socket"
  }

  fn exchange<'a>(
    &'a self,
    endpoint: &'a Path,
    line: &'a str,
  ) -> BoxFuture<'a, Result<Vec<u8>, TransportError>> {
    async move {
      tokio::time::timeout(self.timeout, Self::talk(endpoint, line))
        .await
        .map_err(|_| TransportError::Timeout("socket".into()))?
    }
    .boxed()
  }
}

/// Ordered list of delivery strategies.
pub struct TransportChain {
  strategies: Vec<Box<dyn Transport>>,
}

impl TransportChain {
  pub fn new(strategies: Vec<Box<dyn Transport>>) -> Self {
    Self { strategies }
  }

  /// socat, then netcat, then the socket itself.
  pub fn standard(helper_timeout: Duration, socket_timeout: Duration) -> Self {
    for tool in ["socat", "nc"] {
      if which::which(tool).is_err() {
        log::warn!(
          "{} not found in PATH; IPC delivery will fall back to the next transport",
          tool
        );
      }
    }

    Self::new(vec![
      Box::new(HelperTransport::socat(helper_timeout)),
      Box::new(HelperTransport::netcat(helper_timeout)),
      Box::new(NativeTransport::new(socket_timeout)),
    ])
  }

  pub fn native_only(socket_timeout: Duration) -> Self {
    Self::new(vec![Box::new(NativeTransport::new(socket_timeout))])
  }

  pub fn names(&self) -> Vec<&str> {
    self.strategies.iter().map(|s| s.name()).collect()
  }

  /// Deliver a message, falling through strategies on execution errors.
  pub async fn send(
    &self,
    endpoint: &Path,
    message: &ControlMessage,
  ) -> Result<Vec<u8>, TransportError> {
    if !endpoint.exists() {
      return Err(TransportError::EndpointMissing(endpoint.to_path_buf()));
    }

    let line = message.to_line()?;
    log::info!("Sending MPV command: {}", line);

    let mut failures = Vec::new();
    for strategy in &self.strategies {
      match strategy.exchange(endpoint, &line).await {
        Ok(output) => {
          log::debug!(
            "MPV reply via {}: {}",
            strategy.name(),
            String::from_utf8_lossy(&output).trim()
          );
          return Ok(output);
        }
        Err(e) => {
          log::warn!("{} transport failed: {}", strategy.name(), e);
          failures.push(format!("{}: {}", strategy.name(), e));
        }
      }
    }

    Err(TransportError::Exhausted(failures))
  }

  /// Fire a command whose reply content does not matter.
  pub async fn command(
    &self,
    endpoint: &Path,
    message: &ControlMessage,
  ) -> Result<Option<ControlResponse>, TransportError> {
    let output = self.send(endpoint, message).await?;
    interpret_reply(&output).map_err(TransportError::Rejected)
  }

  /// Send a command whose reply must be parsed, e.g. a property read.
  pub async fn query(
    &self,
    endpoint: &Path,
    message: &ControlMessage,
  ) -> Result<ControlResponse, TransportError> {
    let output = self.send(endpoint, message).await?;
    match parse_reply(&output) {
      Reply::Parsed(response) if response.is_success() => Ok(response),
      Reply::Parsed(response) => Err(TransportError::Rejected(
        response.error_message().to_string(),
      )),
      Reply::Empty => Err(TransportError::InvalidReply("empty reply".into())),
      Reply::Unparsed(text) => Err(TransportError::InvalidReply(text)),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::{BufRead, BufReader as StdBufReader, Write};
  use std::os::unix::net::UnixListener;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Arc;

  struct Scripted {
    calls: Arc<AtomicUsize>,
    result: fn() -> Result<Vec<u8>, TransportError>,
  }

  impl Transport for Scripted {
    fn name(&self) -> &str {
      "scripted"
    }

    fn exchange<'a>(
      &'a self,
      _endpoint: &'a Path,
      _line: &'a str,
    ) -> BoxFuture<'a, Result<Vec<u8>, TransportError>> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      let result = (self.result)();
      async move { result }.boxed()
    }
  }

  fn failing() -> Result<Vec<u8>, TransportError> {
    Err(TransportError::Timeout("scripted".into()))
  }

  fn succeeding() -> Result<Vec<u8>, TransportError> {
    Ok(b"{\"error\":\"success\"}\n".to_vec())
  }

  fn scripted(
    result: fn() -> Result<Vec<u8>, TransportError>,
  ) -> (Box<dyn Transport>, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let transport = Box::new(Scripted {
      calls: calls.clone(),
      result,
    });
    (transport, calls)
  }

  /// An existing regular file passes the endpoint check.
  fn placeholder_endpoint(dir: &Path) -> PathBuf {
    let endpoint = dir.join("sock");
    std::fs::write(&endpoint, b"").unwrap();
    endpoint
  }

  /// Answers one connection with the given lines, then closes.
  fn serve(path: &Path, lines: &'static [&'static str]) -> std::thread::JoinHandle<String> {
    let listener = UnixListener::bind(path).unwrap();
    std::thread::spawn(move || {
      let (stream, _) = listener.accept().unwrap();
      let mut reader = StdBufReader::new(stream.try_clone().unwrap());
      let mut request = String::new();
      reader.read_line(&mut request).unwrap();
      let mut writer = stream;
      for line in lines {
        writer.write_all(line.as_bytes()).unwrap();
        writer.write_all(b"\n").unwrap();
      }
      request
    })
  }

  fn status_query() -> ControlMessage {
    ControlMessage::get_property("idle-active")
  }

  #[tokio::test]
  async fn test_missing_endpoint_short_circuits() {
    let (transport, calls) = scripted(succeeding);
    let chain = TransportChain::new(vec![transport]);

    let err = chain
      .send(Path::new("/nonexistent/mpvsocket"), &status_query())
      .await
      .unwrap_err();
    assert!(matches!(err, TransportError::EndpointMissing(_)));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
  }

  #[tokio::test]
  async fn test_falls_back_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let endpoint = placeholder_endpoint(dir.path());

    let (first, first_calls) = scripted(failing);
    let (second, second_calls) = scripted(succeeding);
    let (third, third_calls) = scripted(succeeding);
    let chain = TransportChain::new(vec![first, second, third]);

    let out = chain.send(&endpoint, &status_query()).await.unwrap();
    assert!(!out.is_empty());
    assert_eq!(first_calls.load(Ordering::SeqCst), 1);
    assert_eq!(second_calls.load(Ordering::SeqCst), 1);
    assert_eq!(third_calls.load(Ordering::SeqCst), 0);
  }

  #[tokio::test]
  async fn test_exhausted_lists_every_failure() {
    let dir = tempfile::tempdir().unwrap();
    let endpoint = placeholder_endpoint(dir.path());

    let (last, calls) = scripted(failing);
    let chain = TransportChain::new(vec![
      Box::new(HelperTransport::new(
        "remote-player-missing-helper",
        &[],
        Duration::from_millis(200),
      )),
      last,
    ]);

    match chain.send(&endpoint, &status_query()).await {
      Err(TransportError::Exhausted(failures)) => {
        assert_eq!(failures.len(), 2);
        assert!(failures[0].starts_with("remote-player-missing-helper"));
      }
      other => panic!("Expected exhausted chain, got {:?}", other),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_failing_helper_falls_through() {
    let dir = tempfile::tempdir().unwrap();
    let endpoint = placeholder_endpoint(dir.path());

    let (next, calls) = scripted(succeeding);
    let chain = TransportChain::new(vec![
      Box::new(HelperTransport::new(
        "sh",
        &["-c", "echo 'connection refused' >&2; exit 3"],
        Duration::from_secs(2),
      )),
      next,
    ]);

    chain.send(&endpoint, &status_query()).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_helper_output_is_the_reply() {
    let dir = tempfile::tempdir().unwrap();
    let endpoint = placeholder_endpoint(dir.path());

    let helper = HelperTransport::new(
      "sh",
      &["-c", r#"cat >/dev/null; echo '{"data":false,"error":"success"}'"#],
      Duration::from_secs(2),
    );
    let out = helper.exchange(&endpoint, "{}").await.unwrap();
    match parse_reply(&out) {
      Reply::Parsed(r) => assert_eq!(r.data, Some(serde_json::Value::Bool(false))),
      other => panic!("Expected reply, got {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_lingering_helper_counts_as_delivered() {
    let dir = tempfile::tempdir().unwrap();
    let endpoint = placeholder_endpoint(dir.path());

    // Like `nc -U` without `-N`: takes the line, then waits for the peer.
    // `$0` is the endpoint, appended after the script.
    let (next, calls) = scripted(succeeding);
    let chain = TransportChain::new(vec![
      Box::new(HelperTransport::new(
        "sh",
        &["-c", r#"cat >> "$0"; exec sleep 5"#],
        Duration::from_millis(300),
      )),
      next,
    ]);

    let started = std::time::Instant::now();
    let message = ControlMessage::loadfile("http://host/b");
    let reply = chain.command(&endpoint, &message).await.unwrap();
    assert!(reply.is_none());
    assert!(started.elapsed() < Duration::from_secs(2));

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    let delivered = std::fs::read_to_string(&endpoint).unwrap();
    assert_eq!(delivered, format!("{}\n", message.to_line().unwrap()));
  }

  #[tokio::test]
  async fn test_native_exchange_skips_events() {
    let dir = tempfile::tempdir().unwrap();
    let endpoint = dir.path().join("mpvsocket");
    let server = serve(
      &endpoint,
      &[
        r#"{"event":"file-loaded"}"#,
        r#"{"data":"Evening News","error":"success"}"#,
      ],
    );

    let transport = NativeTransport::new(Duration::from_secs(2));
    let line = ControlMessage::get_property("media-title").to_line().unwrap();
    let out = transport.exchange(&endpoint, &line).await.unwrap();

    let request = server.join().unwrap();
    assert_eq!(request.trim(), line);
    match parse_reply(&out) {
      Reply::Parsed(r) => assert_eq!(r.data, Some("Evening News".into())),
      other => panic!("Expected reply, got {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_native_exchange_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let endpoint = dir.path().join("mpvsocket");
    let listener = UnixListener::bind(&endpoint).unwrap();
    let holder = std::thread::spawn(move || {
      let (stream, _) = listener.accept().unwrap();
      std::thread::sleep(Duration::from_millis(600));
      drop(stream);
    });

    let transport = NativeTransport::new(Duration::from_millis(200));
    let err = transport.exchange(&endpoint, "{}").await.unwrap_err();
    assert!(matches!(err, TransportError::Timeout(_)));
    holder.join().unwrap();
  }

  #[tokio::test]
  async fn test_query_surfaces_rejection() {
    let dir = tempfile::tempdir().unwrap();
    let endpoint = dir.path().join("mpvsocket");
    let server = serve(&endpoint, &[r#"{"error":"property unavailable"}"#]);

    let chain = TransportChain::native_only(Duration::from_secs(2));
    let err = chain
      .query(&endpoint, &ControlMessage::get_property("media-title"))
      .await
      .unwrap_err();
    assert!(matches!(err, TransportError::Rejected(ref m) if m == "property unavailable"));
    server.join().unwrap();
  }
}
