//! switchboard - boot a mixer session and print its node tree
//!
//! Loads configuration, boots one context against scsynth (or the in-process
//! loopback engine), adds tracks to the default mixer, prints the annotated
//! node tree and quits.

use anyhow::{Context as _, Result};
use clap::Parser;
use oscwire::{Launcher, LoopbackLauncher, ScsynthLauncher};
use std::path::PathBuf;
use std::sync::Arc;
use switchboard::{synthdefs, telemetry, Session, SessionOptions};
use switchconf::SwitchConfig;
use tracing::info;

#[derive(Parser)]
#[command(name = "switchboard")]
#[command(about = "Boot a mixer session and print its node tree")]
#[command(version)]
struct Cli {
    /// Config file replacing ./switchboard.toml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Use the in-process loopback engine instead of scsynth
    #[arg(long)]
    loopback: bool,

    /// Tracks to add to the default mixer
    #[arg(short, long, default_value = "0")]
    tracks: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = SwitchConfig::load_from(cli.config.as_deref()).context("loading config")?;
    telemetry::init(&config.infra.telemetry.log_level)?;

    let options = SessionOptions::from_config(&config)?;
    let launcher: Arc<dyn Launcher> = if cli.loopback {
        Arc::new(LoopbackLauncher::new(synthdefs::descriptors()))
    } else {
        Arc::new(ScsynthLauncher)
    };

    let session = Session::new(options, launcher).await?;
    session.boot().await.context("booting session")?;

    let mixer = session
        .mixers()
        .await
        .first()
        .copied()
        .context("session has no mixer")?;
    for _ in 0..cli.tracks {
        session.add_track(mixer).await?;
    }
    session.sync().await?;
    info!(tracks = cli.tracks + 1, "session ready");

    println!("{}", session.dump_tree().await?);
    session.quit().await?;
    Ok(())
}
