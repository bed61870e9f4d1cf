//! Default input device via cpal

use super::backend::{
    AudioFrame, BroadcastTrack, CaptureConstraints, MediaDevices, MediaStream, MediaTrack,
};
use crate::error::CaptureError;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, error, info};

/// Opens the host's default input device.
///
/// `cpal::Stream` is not `Send`, so every stream lives on its own thread
/// that holds it until the track is stopped.
pub struct CpalDevices;

impl CpalDevices {
    pub fn new() -> Self {
        Self
    }
}

impl Default for CpalDevices {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl MediaDevices for CpalDevices {
    async fn get_user_media(
        &self,
        constraints: &CaptureConstraints,
    ) -> Result<MediaStream, CaptureError> {
        let (track, tx) = BroadcastTrack::new("cpal:default");
        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let constraints = constraints.clone();

        std::thread::Builder::new()
            .name("cpal-capture".to_string())
            .spawn(move || {
                let stream = match open_stream(&constraints, tx) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                if ready_tx.send(Ok(())).is_err() {
                    // Requester went away before the grant; drop releases the device
                    return;
                }

                let _ = stop_rx.recv();
                drop(stream);
                debug!("cpal input stream released");
            })
            .map_err(|e| CaptureError::DeviceUnavailable(e.to_string()))?;

        ready_rx
            .await
            .map_err(|_| CaptureError::DeviceUnavailable("capture thread exited".to_string()))??;

        track.on_stop(move || {
            let _ = stop_tx.send(());
        });

        Ok(MediaStream::new(vec![track as Arc<dyn MediaTrack>]))
    }

    fn name(&self) -> &str {
        "cpal"
    }
}

fn open_stream(
    constraints: &CaptureConstraints,
    tx: broadcast::Sender<AudioFrame>,
) -> Result<cpal::Stream, CaptureError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| CaptureError::DeviceUnavailable("no input device available".to_string()))?;

    let wanted_rate = SampleRate(constraints.sample_rate);
    let supported = device
        .supported_input_configs()
        .map_err(|e| CaptureError::DeviceUnavailable(e.to_string()))?
        .find(|c| {
            c.channels() == constraints.channel_count
                && c.min_sample_rate() <= wanted_rate
                && c.max_sample_rate() >= wanted_rate
        })
        .ok_or_else(|| {
            CaptureError::DeviceUnavailable(format!(
                "no input config for {} Hz / {} channel(s)",
                constraints.sample_rate, constraints.channel_count
            ))
        })?;

    let config: StreamConfig = supported.with_sample_rate(wanted_rate).config();
    let sample_rate = config.sample_rate.0;
    let channels = config.channels;
    let frames_seen = AtomicU64::new(0);

    info!(
        device = device.name().unwrap_or_default(),
        sample_rate, channels, "opening input stream"
    );

    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let samples: Vec<i16> = data
                    .iter()
                    .map(|s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
                    .collect();
                let count = (samples.len() / channels.max(1) as usize) as u64;
                let offset = frames_seen.fetch_add(count, Ordering::Relaxed);

                let _ = tx.send(AudioFrame {
                    samples,
                    sample_rate,
                    channels,
                    timestamp_ms: offset * 1000 / sample_rate as u64,
                });
            },
            |err| {
                error!(error = %err, "audio capture error");
            },
            None,
        )
        .map_err(|e| match e {
            cpal::BuildStreamError::DeviceNotAvailable => {
                CaptureError::DeviceUnavailable(e.to_string())
            }
            other => CaptureError::PermissionDenied(other.to_string()),
        })?;

    stream
        .play()
        .map_err(|e| CaptureError::DeviceUnavailable(e.to_string()))?;

    Ok(stream)
}
