pub mod backend;
pub mod capture;
pub mod file;
pub mod level;

#[cfg(feature = "native-audio")]
pub mod cpal;

pub use backend::{
    AudioFrame, BroadcastTrack, CaptureConstraints, MediaDevices, MediaStream, MediaTrack,
};
pub use capture::AudioCapture;
pub use file::{AudioFile, WavFileDevices};
pub use level::{AudioSample, ConnectionQuality, LevelAnalyser};

#[cfg(feature = "native-audio")]
pub use self::cpal::CpalDevices;
