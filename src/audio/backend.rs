use crate::error::CaptureError;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::debug;

/// Frames buffered per subscriber before the slowest one starts lagging
const TRACK_BUFFER: usize = 64;

/// Audio sample data (16-bit PCM, interleaved)
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Raw audio samples (i16 PCM, interleaved)
    pub samples: Vec<i16>,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Number of channels
    pub channels: u16,
    /// Timestamp in milliseconds since capture started
    pub timestamp_ms: u64,
}

impl AudioFrame {
    /// Duration covered by this frame
    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate == 0 || self.channels == 0 {
            return 0;
        }
        let per_channel = self.samples.len() as u64 / self.channels as u64;
        per_channel * 1000 / self.sample_rate as u64
    }

    /// Downsample by decimation. Only integer ratios are honoured.
    pub fn downsample(self, target_rate: u32) -> AudioFrame {
        if self.sample_rate == target_rate || target_rate == 0 {
            return self;
        }

        let ratio = self.sample_rate / target_rate;
        if ratio <= 1 {
            return self; // Can't upsample
        }

        let channels = self.channels.max(1) as usize;
        let downsampled: Vec<i16> = self
            .samples
            .chunks_exact(channels)
            .step_by(ratio as usize)
            .flatten()
            .copied()
            .collect();

        AudioFrame {
            samples: downsampled,
            sample_rate: target_rate,
            channels: self.channels,
            timestamp_ms: self.timestamp_ms,
        }
    }

    /// Fold any channel layout down to mono by averaging
    pub fn to_mono(self) -> AudioFrame {
        if self.channels <= 1 {
            return self;
        }

        let channels = self.channels as usize;
        let mono_samples: Vec<i16> = self
            .samples
            .chunks_exact(channels)
            .map(|chunk| {
                let sum: i32 = chunk.iter().map(|s| *s as i32).sum();
                (sum / channels as i32) as i16
            })
            .collect();

        AudioFrame {
            samples: mono_samples,
            sample_rate: self.sample_rate,
            channels: 1,
            timestamp_ms: self.timestamp_ms,
        }
    }
}

/// Microphone request constraints
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CaptureConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
    pub sample_rate: u32,
    pub channel_count: u16,
}

impl CaptureConstraints {
    /// Unprocessed capture: every DSP stage off, fixed format.
    /// Transcription accuracy degrades when the signal is pre-filtered.
    pub fn raw(sample_rate: u32, channel_count: u16) -> Self {
        Self {
            echo_cancellation: false,
            noise_suppression: false,
            auto_gain_control: false,
            sample_rate,
            channel_count,
        }
    }
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self::raw(48000, 1)
    }
}

/// A live capture track handed out by a device
pub trait MediaTrack: Send + Sync {
    fn id(&self) -> &str;

    /// Receive frames produced from now on
    fn subscribe(&self) -> broadcast::Receiver<AudioFrame>;

    /// Release the underlying device. Must be idempotent.
    fn stop(&self);

    fn is_live(&self) -> bool;
}

/// The handle returned by a successful microphone request
#[derive(Clone)]
pub struct MediaStream {
    pub id: String,
    pub tracks: Vec<Arc<dyn MediaTrack>>,
}

impl MediaStream {
    pub fn new(tracks: Vec<Arc<dyn MediaTrack>>) -> Self {
        Self {
            id: format!("stream-{}", uuid::Uuid::new_v4()),
            tracks,
        }
    }

    pub fn audio_track(&self) -> Option<Arc<dyn MediaTrack>> {
        self.tracks.first().cloned()
    }

    /// Stop every track explicitly; dropping the handle does not release the device
    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }

    pub fn is_live(&self) -> bool {
        self.tracks.iter().any(|t| t.is_live())
    }
}

impl std::fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaStream")
            .field("id", &self.id)
            .field("tracks", &self.tracks.len())
            .finish()
    }
}

/// Source of microphone streams
///
/// Implementations:
/// - `WavFileDevices`: a WAV file replayed in real time (headless runs, tests)
/// - `CpalDevices`: the default input device (`native-audio` feature)
#[async_trait::async_trait]
pub trait MediaDevices: Send + Sync {
    /// Request the microphone. Resolves once the device is granted.
    async fn get_user_media(
        &self,
        constraints: &CaptureConstraints,
    ) -> Result<MediaStream, CaptureError>;

    /// Backend name for logging
    fn name(&self) -> &str;
}

type StopHook = Box<dyn FnOnce() + Send>;

/// Track fanning frames out over a broadcast channel.
///
/// Device backends push frames through the returned sender and register a
/// stop hook that releases whatever they hold.
pub struct BroadcastTrack {
    id: String,
    tx: broadcast::Sender<AudioFrame>,
    live: AtomicBool,
    on_stop: Mutex<Option<StopHook>>,
}

impl BroadcastTrack {
    pub fn new(id: impl Into<String>) -> (Arc<Self>, broadcast::Sender<AudioFrame>) {
        let (tx, _) = broadcast::channel(TRACK_BUFFER);
        let track = Arc::new(Self {
            id: id.into(),
            tx: tx.clone(),
            live: AtomicBool::new(true),
            on_stop: Mutex::new(None),
        });
        (track, tx)
    }

    pub fn on_stop(&self, hook: impl FnOnce() + Send + 'static) {
        if let Ok(mut slot) = self.on_stop.lock() {
            *slot = Some(Box::new(hook));
        }
    }
}

impl MediaTrack for BroadcastTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn subscribe(&self) -> broadcast::Receiver<AudioFrame> {
        self.tx.subscribe()
    }

    fn stop(&self) {
        if !self.live.swap(false, Ordering::SeqCst) {
            return;
        }

        debug!("Stopping track {}", self.id);
        let hook = self.on_stop.lock().ok().and_then(|mut slot| slot.take());
        if let Some(hook) = hook {
            hook();
        }
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }
}
