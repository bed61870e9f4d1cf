use super::backend::{CaptureConstraints, MediaDevices, MediaStream};
use super::level::{AudioSample, LevelAnalyser};
use crate::error::CaptureError;
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct ActiveCapture {
    stream: MediaStream,
    sampler: JoinHandle<()>,
}

/// Owns the microphone for one session and publishes its voice-activity level.
///
/// At most one stream is held at a time. `stop()` bumps an epoch so that a
/// device grant resolving after the stop is released instead of kept.
pub struct AudioCapture {
    devices: Arc<dyn MediaDevices>,
    constraints: CaptureConstraints,
    sample_interval: Duration,
    active: Mutex<Option<ActiveCapture>>,
    epoch: AtomicU64,
    level_tx: watch::Sender<AudioSample>,
}

impl AudioCapture {
    pub fn new(
        devices: Arc<dyn MediaDevices>,
        constraints: CaptureConstraints,
        sample_interval: Duration,
    ) -> Self {
        let (level_tx, _) = watch::channel(AudioSample::silent());
        Self {
            devices,
            constraints,
            sample_interval,
            active: Mutex::new(None),
            epoch: AtomicU64::new(0),
            level_tx,
        }
    }

    /// Acquire the microphone and start the level sampler.
    /// Returns the existing handle when already capturing.
    pub async fn start(&self) -> Result<MediaStream, CaptureError> {
        if let Some(active) = self.active.lock().await.as_ref() {
            debug!("Capture already active on {}", active.stream.id);
            return Ok(active.stream.clone());
        }

        let epoch = self.epoch.load(Ordering::SeqCst);
        info!("Requesting microphone from {}", self.devices.name());

        let stream = self.devices.get_user_media(&self.constraints).await?;

        let mut active = self.active.lock().await;
        if self.epoch.load(Ordering::SeqCst) != epoch {
            warn!("Microphone granted after stop, releasing {}", stream.id);
            stream.stop_all();
            return Err(CaptureError::Cancelled);
        }

        if let Some(existing) = active.as_ref() {
            // A concurrent start won the race
            stream.stop_all();
            return Ok(existing.stream.clone());
        }

        let track = stream.audio_track().ok_or_else(|| {
            CaptureError::DeviceUnavailable("stream carries no audio track".to_string())
        })?;

        let sampler = tokio::spawn(run_sampler(
            track.subscribe(),
            self.sample_interval,
            self.level_tx.clone(),
        ));

        info!("Microphone acquired: {} ({} track(s))", stream.id, stream.tracks.len());
        *active = Some(ActiveCapture {
            stream: stream.clone(),
            sampler,
        });

        Ok(stream)
    }

    /// Halt sampling and release every track. Safe to call repeatedly.
    pub async fn stop(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);

        let active = self.active.lock().await.take();
        if let Some(active) = active {
            active.sampler.abort();
            active.stream.stop_all();
            info!("Microphone released: {}", active.stream.id);
        }

        self.level_tx.send_replace(AudioSample::silent());
    }

    /// Synchronous `stop()` for drop paths. Skips the release when a
    /// concurrent caller holds the capture; that caller finishes it.
    pub fn release_now(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);

        let Ok(mut active) = self.active.try_lock() else {
            warn!("Capture busy during release, leaving it to its holder");
            return;
        };
        if let Some(active) = active.take() {
            active.sampler.abort();
            active.stream.stop_all();
            info!("Microphone released: {}", active.stream.id);
        }

        self.level_tx.send_replace(AudioSample::silent());
    }

    pub async fn is_active(&self) -> bool {
        self.active.lock().await.is_some()
    }

    /// Current stream, if any
    pub async fn stream(&self) -> Option<MediaStream> {
        self.active.lock().await.as_ref().map(|a| a.stream.clone())
    }

    pub fn levels(&self) -> watch::Receiver<AudioSample> {
        self.level_tx.subscribe()
    }
}

async fn run_sampler(
    mut frames: broadcast::Receiver<super::AudioFrame>,
    interval: Duration,
    level_tx: watch::Sender<AudioSample>,
) {
    let mut analyser = LevelAnalyser::new();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let level = analyser.level();
                level_tx.send_replace(AudioSample {
                    level,
                    timestamp: Utc::now(),
                });
            }
            frame = frames.recv() => match frame {
                Ok(frame) => analyser.push_frame(&frame),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("Level sampler skipped {} frames", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Capture track ended");
                    break;
                }
            },
        }
    }

    level_tx.send_replace(AudioSample::silent());
}
