//! MPV JSON IPC protocol types.
//!
//! Reference: https://mpv.io/manual/master/#json-ipc

use serde::{Deserialize, Serialize};

/// Command sent to MPV via IPC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlMessage {
  pub command: Vec<serde_json::Value>,
}

impl ControlMessage {
  pub fn new(args: Vec<serde_json::Value>) -> Self {
    Self { command: args }
  }

  /// Replace the current playlist entry with `url`.
  pub fn loadfile(url: &str) -> Self {
    Self::new(vec!["loadfile".into(), url.into(), "replace".into()])
  }

  /// Get a property value.
  pub fn get_property(name: &str) -> Self {
    Self::new(vec!["get_property".into(), name.into()])
  }

  /// Serialize to a single JSON line (without the trailing newline).
  pub fn to_line(&self) -> Result<String, serde_json::Error> {
    serde_json::to_string(self)
  }
}

/// Response from MPV for a command.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ControlResponse {
  /// Response data (command-specific).
  #[serde(default)]
  pub data: Option<serde_json::Value>,
  /// "success" or error message.
  #[serde(default)]
  pub error: Option<String>,
}

impl ControlResponse {
  /// A missing, empty or "success" error field all mean the command went through.
  pub fn is_success(&self) -> bool {
    match self.error.as_deref() {
      None | Some("") | Some("success") => true,
      Some(_) => false,
    }
  }

  pub fn error_message(&self) -> &str {
    self.error.as_deref().unwrap_or_default()
  }
}

/// Outcome of reading what the endpoint sent back.
#[derive(Debug, Clone)]
pub enum Reply {
  /// Nothing came back.
  Empty,
  /// Output was present but not JSON we understand.
  Unparsed(String),
  Parsed(ControlResponse),
}

/// Parse raw endpoint output.
///
/// Output may carry asynchronous event lines (`{"event": ...}`) next to the
/// reply; the first non-event line is taken as the reply.
pub fn parse_reply(raw: &[u8]) -> Reply {
  let text = String::from_utf8_lossy(raw);
  let trimmed = text.trim();
  if trimmed.is_empty() {
    return Reply::Empty;
  }

  for line in trimmed.lines().map(str::trim).filter(|l| !l.is_empty()) {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(line) else {
      continue;
    };
    if value.get("event").is_some() && value.get("error").is_none() {
      continue;
    }
    if let Ok(response) = serde_json::from_value::<ControlResponse>(value) {
      return Reply::Parsed(response);
    }
  }

  Reply::Unparsed(trimmed.to_string())
}

/// Lenient acceptance policy for fire-and-forget commands.
///
/// Empty and unparsable output both count as accepted; only a parsed reply
/// carrying a non-success error is a rejection.
pub fn interpret_reply(raw: &[u8]) -> Result<Option<ControlResponse>, String> {
  match parse_reply(raw) {
    Reply::Empty => Ok(None),
    Reply::Unparsed(text) => {
      log::warn!("Unparsable MPV reply treated as accepted: {}", text);
      Ok(None)
    }
    Reply::Parsed(response) if response.is_success() => Ok(Some(response)),
    Reply::Parsed(response) => Err(response.error_message().to_string()),
  }
}

/// Pull a displayable title out of a `get_property media-title` reply.
pub fn media_title(data: Option<&serde_json::Value>) -> String {
  match data {
    None | Some(serde_json::Value::Null) => String::new(),
    Some(serde_json::Value::String(s)) => s.clone(),
    Some(serde_json::Value::Object(map)) => match map.get("data") {
      Some(serde_json::Value::String(s)) => s.clone(),
      _ => serde_json::Value::Object(map.clone()).to_string(),
    },
    Some(other) => other.to_string(),
  }
}
