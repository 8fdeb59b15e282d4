use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use voicetwin::config::UploadBackend;
use voicetwin::{
    create_router, AppState, BlobStore, Config, CoreError, CoreEvent, DirectoryBlobStore,
    NatsObjectStore, SessionPhase, StaticPermission, SyntheticDevice, VoiceTwin,
    VoiceTwinBuilder,
};

#[derive(Parser)]
#[command(name = "voicetwin", version, about = "Capture, play back and upload voice recordings")]
struct Cli {
    /// Configuration file (extension optional)
    #[arg(long, default_value = "config/voicetwin")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP control API
    Serve,
    /// Record for a fixed time, then optionally play back and upload
    Record {
        #[arg(long, default_value_t = 3)]
        seconds: u64,
        #[arg(long)]
        play: bool,
        #[arg(long)]
        upload: bool,
    },
    /// List stored recordings
    List,
    /// List upload tasks
    Uploads,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let cfg = Config::load(&cli.config)?;

    info!("{} v{}", cfg.service.name, env!("CARGO_PKG_VERSION"));
    info!("Data directory: {}", cfg.storage.data_dir().display());

    // Read-only commands leave queued uploads untouched
    let dispatch = matches!(cli.command, Command::Serve | Command::Record { .. });
    let core = Arc::new(start_core(&cfg, dispatch).await?);

    let outcome = match cli.command {
        Command::Serve => serve(&cfg, Arc::clone(&core)).await,
        Command::Record {
            seconds,
            play,
            upload,
        } => record(&core, seconds, play, upload).await,
        Command::List => {
            for recording in core.recordings().await {
                println!(
                    "{}  {:>6.1}s  {:>9} bytes  {}",
                    recording.id,
                    recording.duration_secs,
                    recording.byte_size,
                    recording.path.display()
                );
            }
            Ok(())
        }
        Command::Uploads => {
            for task in core.upload_tasks().await {
                println!(
                    "#{:<4} {}  {:?}  attempts={}  {}",
                    task.task_id,
                    task.recording_id,
                    task.status,
                    task.attempts,
                    task.remote_id.or(task.last_error).unwrap_or_default()
                );
            }
            Ok(())
        }
    };

    core.shutdown().await;
    outcome
}

async fn start_core(cfg: &Config, dispatch: bool) -> Result<VoiceTwin> {
    let blob: Arc<dyn BlobStore> = match cfg.upload.backend {
        UploadBackend::Directory => Arc::new(DirectoryBlobStore::new(cfg.upload.directory())),
        UploadBackend::Nats => Arc::new(
            NatsObjectStore::connect(&cfg.upload.nats_url, &cfg.upload.bucket)
                .await
                .context("Failed to open NATS object store")?,
        ),
    };

    let builder = VoiceTwinBuilder {
        data_dir: cfg.storage.data_dir(),
        session: cfg.audio.session_config(),
        queue: cfg.upload.queue_config(),
        device: Arc::new(SyntheticDevice::default()),
        permission: Arc::new(StaticPermission::new(cfg.audio.microphone_authorized)),
        blob,
    };

    let core = if dispatch {
        builder.start().await
    } else {
        builder.open().await
    }
    .context("Failed to start core")?;

    Ok(core)
}

async fn serve(cfg: &Config, core: Arc<VoiceTwin>) -> Result<()> {
    let addr = format!("{}:{}", cfg.service.http.bind, cfg.service.http.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("HTTP API listening on {}", addr);

    axum::serve(listener, create_router(AppState::new(core)))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
        })
        .await
        .context("HTTP server failed")?;

    Ok(())
}

async fn record(core: &VoiceTwin, seconds: u64, play: bool, upload: bool) -> Result<()> {
    let mut events = core.subscribe();

    let recording_id = core.begin_capture().await?;
    info!("Recording {} for {}s", recording_id, seconds);
    tokio::time::sleep(Duration::from_secs(seconds)).await;
    let recording = core.end_capture().await?;
    println!(
        "Saved {} ({:.1}s) to {}",
        recording.id,
        recording.duration_secs,
        recording.path.display()
    );

    if play {
        core.begin_playback(&recording.id).await?;
        let mut phase = core.session().watch_phase();
        phase
            .wait_for(|p| !matches!(p, SessionPhase::Playing { .. }))
            .await
            .context("Session closed during playback")?;
        println!("Playback finished");
    }

    if upload {
        core.enqueue_upload(&recording.id).await?;

        loop {
            match events.recv().await {
                Ok(CoreEvent::UploadSucceeded {
                    recording_id,
                    remote_id,
                    ..
                }) if recording_id == recording.id => {
                    println!("Uploaded to {}", remote_id);
                    break;
                }
                Ok(CoreEvent::UploadRetryScheduled {
                    recording_id,
                    next_attempt_at,
                    error,
                    ..
                }) if recording_id == recording.id => {
                    warn!("Upload failed ({}); retrying at {}", error, next_attempt_at);
                }
                Ok(CoreEvent::UploadFailed {
                    recording_id,
                    error,
                    ..
                }) if recording_id == recording.id => {
                    return Err(CoreError::UploadPermanent(error).into());
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(e) => return Err(e).context("Event stream closed"),
            }
        }
    }

    Ok(())
}
