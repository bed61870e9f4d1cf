use super::backend::{
    AudioFrame, BroadcastTrack, CaptureConstraints, MediaDevices, MediaStream, MediaTrack,
};
use crate::error::CaptureError;
use anyhow::{Context, Result};
use hound::WavReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Playback granularity of the file-backed microphone
const FRAME_MS: u64 = 20;

pub struct AudioFile {
    pub path: String,
    pub duration_seconds: f64,
    pub sample_rate: u32,
    pub channels: u16,
    pub samples: Vec<i16>,
}

impl AudioFile {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("Opening audio file: {}", path.display());

        let reader = WavReader::open(path).context("Failed to open WAV file")?;

        let spec = reader.spec();
        let samples: Vec<i16> = reader
            .into_samples::<i16>()
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to read audio samples")?;

        let duration_seconds =
            samples.len() as f64 / (spec.sample_rate as f64 * spec.channels as f64);

        info!(
            "Audio file loaded: {:.1}s, {}Hz, {} channels, {} samples",
            duration_seconds,
            spec.sample_rate,
            spec.channels,
            samples.len()
        );

        Ok(Self {
            path: path.display().to_string(),
            duration_seconds,
            sample_rate: spec.sample_rate,
            channels: spec.channels,
            samples,
        })
    }

    /// Split into fixed-length frames shaped by the capture constraints
    pub fn frames(&self, constraints: &CaptureConstraints, frame_ms: u64) -> Vec<AudioFrame> {
        let channels = self.channels.max(1) as usize;
        let per_frame = (self.sample_rate as u64 * frame_ms / 1000) as usize * channels;
        if per_frame == 0 {
            return Vec::new();
        }

        self.samples
            .chunks(per_frame)
            .enumerate()
            .map(|(i, chunk)| {
                let mut frame = AudioFrame {
                    samples: chunk.to_vec(),
                    sample_rate: self.sample_rate,
                    channels: self.channels,
                    timestamp_ms: i as u64 * frame_ms,
                };
                if constraints.channel_count == 1 {
                    frame = frame.to_mono();
                }
                frame.downsample(constraints.sample_rate)
            })
            .collect()
    }
}

/// Replays a WAV file in real time as if it were a microphone
pub struct WavFileDevices {
    path: PathBuf,
    looped: bool,
}

impl WavFileDevices {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            looped: true,
        }
    }

    /// Stop producing frames at end of file instead of starting over
    pub fn once(mut self) -> Self {
        self.looped = false;
        self
    }
}

#[async_trait::async_trait]
impl MediaDevices for WavFileDevices {
    async fn get_user_media(
        &self,
        constraints: &CaptureConstraints,
    ) -> Result<MediaStream, CaptureError> {
        let path = self.path.clone();
        let file = tokio::task::spawn_blocking(move || AudioFile::open(path))
            .await
            .map_err(|e| CaptureError::DeviceUnavailable(e.to_string()))?
            .map_err(|e| CaptureError::DeviceUnavailable(format!("{:#}", e)))?;

        let frames = file.frames(constraints, FRAME_MS);
        if frames.is_empty() {
            return Err(CaptureError::DeviceUnavailable(format!(
                "{} contains no audio",
                file.path
            )));
        }

        let (track, tx) = BroadcastTrack::new(format!("wav:{}", file.path));
        let looped = self.looped;

        let feeder = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(FRAME_MS));
            let mut elapsed_ms = 0u64;

            loop {
                for frame in &frames {
                    ticker.tick().await;
                    let mut frame = frame.clone();
                    frame.timestamp_ms = elapsed_ms;
                    elapsed_ms += FRAME_MS;
                    // No subscribers is fine; the sampler may not be attached yet
                    let _ = tx.send(frame);
                }

                if !looped {
                    debug!("WAV playback finished");
                    break;
                }
            }
        });
        track.on_stop(move || feeder.abort());

        Ok(MediaStream::new(vec![track as Arc<dyn MediaTrack>]))
    }

    fn name(&self) -> &str {
        "wav-file"
    }
}
