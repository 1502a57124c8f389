use std::sync::Arc;

use anyhow::Context;
use tracing::{debug, info};

use crate::arena::{Arena, ArenaError};
use crate::auth::Credentials;
use crate::botcom::{EngineContext, WebRtcLauncher};
use crate::cli::Cli;
use crate::communicator::{Communicator, CommunicatorConfig};
use crate::config::Settings;
use crate::hardware;
use crate::media::{self, DiscardAudio, StaticTracks};
use crate::telemetry::logging;

const STREAM_ID: &str = "bot-box";

/// Wires every component together and runs until a fatal condition or Ctrl-C.
pub async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.env_file.as_deref() {
        Some(path) => {
            dotenvy::from_path(path)
                .with_context(|| format!("failed to load env file {}", path.display()))?;
        }
        None => {
            dotenvy::dotenv().ok();
        }
    }

    let log_config = cli.logging.to_config();
    logging::init(&log_config)?;
    debug!(log_level = ?log_config.level, log_file = ?log_config.file, "logging configured");

    let settings = Settings::load(cli.hardware).context("invalid configuration")?;
    info!(
        srv_url = %settings.srv_url,
        hardware = %settings.hardware.kind(),
        stun_urls = settings.stun_urls.len(),
        "starting bot-box"
    );

    let credentials = Arc::new(Credentials::mint(
        &settings.public_key,
        &settings.secret_key,
    )?);

    let hardware = hardware::spawn(&settings.hardware, settings.timing.hardware_reconnect)
        .await
        .context("failed to open the hardware transport")?;

    let (signaling, communicator) =
        Communicator::spawn(CommunicatorConfig::from_settings(&settings))?.into_parts();

    let api = media::build_api().context("failed to build the WebRTC API")?;
    let launcher = WebRtcLauncher::new(EngineContext {
        api: Arc::new(api),
        ice_servers: settings.stun_urls.clone(),
        media: Arc::new(StaticTracks::new(STREAM_ID)),
        audio: settings.audio,
        audio_sink: Arc::new(DiscardAudio::default()),
        hardware: hardware.commands.clone(),
    });

    let arena = Arena::new(
        credentials,
        signaling,
        Some(hardware.telemetry),
        Arc::new(launcher),
    );

    let outcome = tokio::select! {
        result = arena.run() => result,
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for Ctrl-C")?;
            info!("interrupted; shutting down");
            Ok(())
        }
    };

    communicator.shutdown().await;
    if let Err(ArenaError::RestartRequested) = &outcome {
        info!("exiting so the supervisor can restart the arena");
    }
    outcome.map_err(Into::into)
}
