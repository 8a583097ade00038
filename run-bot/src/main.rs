//! Parley runner
//!
//! Reads configuration from the environment (and `.env`), installs logging,
//! then runs the Discord client until it stops.

use anyhow::Context;
use clap::Parser;
use parley_adaptor_discord::{start_discord, DiscordConfig};
use parley_core::{init_tracing, load_env};
use parley_provider_voice::{ElevenLabsVoiceEngine, SpeechSynthesizer};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "parley", about = "Presence-triggered voice companion for Discord")]
struct Cli {
    /// Log filter, overrides RUST_LOG (e.g. `debug` or `parley_adaptor_discord=trace`)
    #[arg(long, env = "PARLEY_LOG_LEVEL")]
    log_level: Option<String>,

    /// List the voices available to the ElevenLabs account and exit
    #[arg(long)]
    list_voices: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_file = load_env().context("Failed to load environment")?;
    let cli = Cli::parse();
    if let Some(level) = &cli.log_level {
        std::env::set_var("RUST_LOG", level);
    }
    init_tracing();
    match env_file {
        Some(path) => info!(path = %path.display(), "Loaded environment file"),
        None => warn!("No .env file found - using system environment variables only"),
    }

    let tts = Arc::new(ElevenLabsVoiceEngine::from_env());

    if cli.list_voices {
        let voices = tts
            .available_voices()
            .await
            .context("Failed to list ElevenLabs voices")?;
        for voice in voices {
            println!("{}\t{}\t{:?}", voice.id, voice.name, voice.gender);
        }
        return Ok(());
    }

    let config = DiscordConfig::from_env().context("Invalid Discord configuration")?;
    info!(
        voice = config.voice.is_some(),
        relay = config.webhook_url.is_some(),
        tts = %tts.name(),
        "Starting Parley"
    );

    start_discord(config, tts).await?;
    Ok(())
}
