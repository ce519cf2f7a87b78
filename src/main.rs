//! remote-player: keep a stream playing in a supervised MPV process.
//!
//! Plays the first URL, live-swaps through the rest on an interval, prints a
//! JSON status line periodically, and tears everything down on Ctrl-C.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use remote_player::{PlayerConfig, PlayerController};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "remote-player", version, about)]
struct Args {
  /// JSON config file. Defaults to <config dir>/remote-player/config.json when present.
  #[arg(long)]
  config: Option<PathBuf>,

  /// MPV executable (overrides config and PATH lookup).
  #[arg(long)]
  mpv: Option<PathBuf>,

  /// Do not restart MPV when it exits on its own.
  #[arg(long)]
  no_auto_restart: bool,

  /// Talk to MPV over the socket only, without socat/nc.
  #[arg(long)]
  native_ipc: bool,

  /// Seconds between live swaps when several URLs are given.
  #[arg(long, default_value_t = 30)]
  swap_every: u64,

  /// Seconds between status lines.
  #[arg(long, default_value_t = 10)]
  status_every: u64,

  /// Stream URLs, played in order.
  #[arg(required = true)]
  urls: Vec<String>,
}

fn load_config(args: &Args) -> Result<PlayerConfig> {
  let path = args.config.clone().or_else(|| {
    dirs::config_dir()
      .map(|dir| dir.join("remote-player").join("config.json"))
      .filter(|path| path.exists())
  });

  let mut config = match path {
    Some(path) => {
      log::info!("Loading config from {}", path.display());
      PlayerConfig::load(&path).with_context(|| format!("load config {}", path.display()))?
    }
    None => PlayerConfig::default(),
  };

  if let Some(mpv) = &args.mpv {
    config.mpv_path = Some(mpv.clone());
  }
  if args.no_auto_restart {
    config.auto_restart = false;
  }
  if args.native_ipc {
    config.native_ipc_only = true;
  }
  config.validate()?;
  Ok(config)
}

async fn report(player: &PlayerController) -> Result<()> {
  let status = serde_json::to_string(&player.status())?;
  if player.is_active() {
    match player.media_title().await {
      Ok(title) => println!("{} title={:?}", status, title),
      Err(e) => println!("{} title unavailable: {}", status, e),
    }
  } else {
    println!("{}", status);
  }
  Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
  let args = Args::parse();
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,remote_player=debug")),
    )
    .init();

  let config = load_config(&args)?;
  let player = PlayerController::new(config).context("create player")?;

  let first = &args.urls[0];
  player
    .play(first)
    .await
    .with_context(|| format!("play {}", first))?;

  let mut swap = tokio::time::interval(Duration::from_secs(args.swap_every.max(1)));
  let mut status = tokio::time::interval(Duration::from_secs(args.status_every.max(1)));
  swap.tick().await;
  let mut next = 1;

  let ctrl_c = tokio::signal::ctrl_c();
  tokio::pin!(ctrl_c);

  loop {
    tokio::select! {
      _ = &mut ctrl_c => {
        log::info!("Interrupted, shutting down");
        break;
      }
      _ = status.tick() => report(&player).await?,
      _ = swap.tick(), if args.urls.len() > 1 => {
        let url = &args.urls[next % args.urls.len()];
        next += 1;
        if let Err(e) = player.play(url).await {
          log::warn!("Switching to {} failed: {}", url, e);
        }
      }
    }
  }

  player.cleanup().await.context("cleanup")?;
  Ok(())
}
