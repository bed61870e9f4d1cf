use anyhow::{Context, Result};
use clap::Parser;
use loqa_voice::{
    create_router, AppState, Config, ErrorInfo, MediaDevices, PipelineStep, SessionSnapshot,
    TtsChunk, VoiceSession, WavFileDevices, WebRtcPeerFactory, WsConnector,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "loqa-voice", version, about = "Real-time voice session client")]
struct Args {
    /// Config file, without extension
    #[arg(long, default_value = "config/loqa-voice")]
    config: String,

    /// Stream a WAV file instead of the microphone
    #[arg(long)]
    wav: Option<PathBuf>,

    /// Expose the HTTP control API instead of starting right away
    #[arg(long)]
    serve: bool,

    /// Start listening as soon as the session is up
    #[arg(long)]
    listen: bool,

    /// Append the assistant's TTS audio, as received, to this file
    #[arg(long)]
    tts_out: Option<PathBuf>,

    /// Drive the pipeline from a local timer instead of the orchestrator
    #[cfg(feature = "simulation")]
    #[arg(long)]
    simulate: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build runtime")?;
    runtime.block_on(run(args))
}

fn audio_devices(args: &Args) -> Result<Arc<dyn MediaDevices>> {
    if let Some(path) = &args.wav {
        info!("Using WAV input: {}", path.display());
        return Ok(Arc::new(WavFileDevices::new(path.clone())));
    }

    #[cfg(feature = "native-audio")]
    return Ok(Arc::new(loqa_voice::audio::CpalDevices::new()));

    #[cfg(not(feature = "native-audio"))]
    anyhow::bail!("No audio input: pass --wav or build with the native-audio feature");
}

async fn run(args: Args) -> Result<()> {
    let cfg = Config::load(&args.config)?;

    info!("Loqa Voice v{}", env!("CARGO_PKG_VERSION"));
    info!("Loaded config: {}", cfg.service.name);
    info!("WHIP endpoint: {}", cfg.endpoints.whip_url);
    info!("Signaling endpoint: {}", cfg.endpoints.signaling_url);

    let devices = audio_devices(&args)?;
    let peers = Arc::new(WebRtcPeerFactory::new(cfg.audio.codec));
    let connector = Arc::new(WsConnector);

    #[cfg(feature = "simulation")]
    let session = if args.simulate {
        let tracker = Box::new(loqa_voice::pipeline::SimulatedPipeline::new(
            std::time::Duration::from_millis(800),
        ));
        VoiceSession::with_tracker(cfg.session_config(), devices, peers, connector, tracker)?
    } else {
        VoiceSession::new(cfg.session_config(), devices, peers, connector)?
    };
    #[cfg(not(feature = "simulation"))]
    let session = VoiceSession::new(cfg.session_config(), devices, peers, connector)?;

    let session = Arc::new(session);
    let reporter = tokio::spawn(report(session.subscribe()));
    let recorder = match &args.tts_out {
        Some(path) => {
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await
                .with_context(|| format!("Failed to open {}", path.display()))?;
            info!("Writing TTS audio to {}", path.display());
            Some(tokio::spawn(record_tts(session.tts_audio(), file, path.to_path_buf())))
        }
        None => None,
    };

    if args.serve {
        let addr = format!("{}:{}", cfg.service.http.bind, cfg.service.http.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;
        info!("HTTP control API listening on {}", addr);

        let state = AppState::new(session.clone())
            .with_cors_origins(cfg.service.http.cors_origins.clone());
        let app = create_router(state);
        tokio::select! {
            served = axum::serve(listener, app) => served.context("HTTP server failed")?,
            _ = tokio::signal::ctrl_c() => info!("Interrupted"),
        }
    } else {
        let session_id = session.start().await?;
        info!("Session {} running, press Ctrl-C to stop", session_id);

        if args.listen {
            session.start_listening().await?;
        }

        tokio::signal::ctrl_c()
            .await
            .context("Failed to wait for Ctrl-C")?;
        info!("Interrupted");
    }

    session.stop().await;
    reporter.abort();
    if let Some(recorder) = recorder {
        recorder.abort();
    }
    Ok(())
}

async fn record_tts(
    mut chunks: broadcast::Receiver<TtsChunk>,
    mut file: tokio::fs::File,
    path: PathBuf,
) {
    loop {
        match chunks.recv().await {
            Ok(chunk) => {
                if let Err(e) = write_chunk(&mut file, &chunk, &path).await {
                    warn!("{:#}", e);
                    return;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("TTS recorder fell behind, {} chunk(s) lost", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

async fn write_chunk(file: &mut tokio::fs::File, chunk: &TtsChunk, path: &Path) -> Result<()> {
    file.write_all(&chunk.audio)
        .await
        .with_context(|| format!("Failed to write TTS audio to {}", path.display()))?;
    file.flush().await?;
    Ok(())
}

/// Log pipeline steps, transcripts and replies as they change
async fn report(mut snapshots: watch::Receiver<SessionSnapshot>) {
    let mut step = PipelineStep::Idle;
    let mut transcript = String::new();
    let mut reply: Option<String> = None;
    let mut last_error: Option<ErrorInfo> = None;

    while snapshots.changed().await.is_ok() {
        let snap = snapshots.borrow_and_update().clone();

        if snap.pipeline.state.current_step != step {
            step = snap.pipeline.state.current_step;
            info!(
                "Pipeline: {:?} ({:.0}%)",
                step,
                snap.pipeline.state.progress * 100.0
            );
        }
        if snap.transcript != transcript {
            transcript = snap.transcript.clone();
            if !transcript.is_empty() {
                info!("You: {}", transcript);
            }
        }
        if snap.ai_response != reply {
            reply = snap.ai_response.clone();
            if let Some(text) = &reply {
                info!("Assistant: {}", text);
            }
        }
        if snap.error != last_error {
            last_error = snap.error.clone();
            if let Some(err) = &last_error {
                warn!("Session error ({:?}): {}", err.kind, err.message);
            }
        }
    }
}
