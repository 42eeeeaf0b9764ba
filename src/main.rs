use std::path::PathBuf;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::assets::{AssetSource, DirectoryAssets};
use crate::config::{Config, OutputBackend};
use crate::handler::files::list_files;
use crate::handler::playback::{get_session, list_sessions, session_events, start_playback, stop_session};
use crate::playback::engine::{PlaybackOutcome, StreamingEngine};
use crate::playback::output::AudioOutput;
use crate::playback::paced::PacedOutput;
use crate::playback::session::SessionManager;

mod assets;
mod config;
mod handler;
mod media;
mod playback;

#[derive(Parser)]
#[command(name = "wavplay")]
#[command(about = "Stream PCM WAV files to an audio output", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the HTTP control API
    Serve,

    /// List playable files
    List,

    /// Play one file and wait for it to finish
    Play {
        /// File name inside the asset category
        name: String,
    },

    /// Write the sine-wave test WAV set
    GenerateFixtures {
        /// Output directory
        dir: PathBuf,
    },
}

// Application state
#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionManager>,
}

impl AppState {
    fn new(config: &Config) -> anyhow::Result<Self> {
        let output = build_output(config)?;
        let engine = StreamingEngine::new(output);

        let root = &config.assets.root;
        let source: Option<Arc<dyn AssetSource>> = if root.is_dir() {
            let assets = DirectoryAssets::new(root);
            info!("Serving assets from {:?}", assets.root().join(&config.assets.category));
            Some(Arc::new(assets))
        } else {
            error!("Asset directory {:?} does not exist, playback requests will be ignored", root);
            None
        };

        let sessions = SessionManager::new(
            source,
            config.assets.category.clone(),
            engine,
            config.playback.header_validation,
            config.playback.policy,
        );

        Ok(Self { sessions: Arc::new(sessions) })
    }
}

fn build_output(config: &Config) -> anyhow::Result<Arc<dyn AudioOutput>> {
    match config.playback.output {
        OutputBackend::Paced => Ok(Arc::new(PacedOutput::new(config.playback.latency_ms))),
        #[cfg(feature = "cpal")]
        OutputBackend::Device => Ok(Arc::new(crate::playback::device::CpalOutput::new(config.playback.latency_ms))),
        #[cfg(not(feature = "cpal"))]
        OutputBackend::Device => anyhow::bail!("playback.output = \"device\" requires building with the `cpal` feature"),
    }
}

pub(crate) fn router(state: AppState, cors: bool) -> Router {
    let router = Router::new()
        .route("/v1/files", get(list_files))
        .route("/v1/playback", get(list_sessions).post(start_playback))
        .route("/v1/playback/{id}", get(get_session).delete(stop_session))
        .route("/v1/playback/{id}/events", get(session_events))
        .with_state(state);

    if cors {
        router.layer(ServiceBuilder::new().layer(CorsLayer::permissive()))
    } else {
        router
    }
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(false);

    if config.logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    // Initialize tracing
    init_tracing(&config);

    match cli.command {
        Commands::Serve => serve(config).await,
        Commands::List => list(config).await,
        Commands::Play { name } => play(config, &name).await,
        Commands::GenerateFixtures { dir } => {
            let written = tokio::task::spawn_blocking(move || media::tone::write_fixture_set(&dir)).await??;
            info!("Wrote {} fixture files", written.len());
            Ok(())
        }
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let state = AppState::new(&config)?;
    let app = router(state.clone(), config.server.cors.enabled);

    // Start the server
    let listener = TcpListener::bind(&config.server.bind_addr).await?;
    info!("Server running on http://{}", listener.local_addr()?);

    let sessions = state.sessions.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Cannot listen for shutdown signal: {e}");
                std::future::pending::<()>().await;
            }
            info!("Shutting down, stopping active sessions");
            // Event streams end once their session is released
            sessions.shutdown().await;
        })
        .await?;

    Ok(())
}

async fn list(config: Config) -> anyhow::Result<()> {
    let state = AppState::new(&config)?;
    for name in state.sessions.list().await? {
        println!("{name}");
    }

    Ok(())
}

async fn play(config: Config, name: &str) -> anyhow::Result<()> {
    let state = AppState::new(&config)?;
    let handle = state.sessions.play(name).await?;
    info!("Playing '{}' on session {}", handle.name(), handle.id());

    let id = handle.id();
    let sessions = state.sessions.clone();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping playback");
            sessions.cancel(id).await;
        }
    });

    let report = handle.wait().await;
    interrupt.abort();
    let report = report?;
    println!(
        "{}: {:?}, {} bytes in {} chunks of {} bytes",
        name,
        report.outcome.state(),
        report.bytes_written,
        report.chunks_written,
        report.buffer_size
    );

    if let PlaybackOutcome::Failed(e) = report.outcome {
        anyhow::bail!("playback failed: {e}");
    }

    Ok(())
}
