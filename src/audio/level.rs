//! Voice-activity level from frequency-domain energy.
//!
//! Mirrors a browser `AnalyserNode` configured with `fftSize = 256`: the most
//! recent 256 samples are Blackman-windowed, transformed, smoothed over time,
//! converted to decibels and mapped onto a byte scale between -100 dB and
//! -30 dB. The level is the mean of those bytes rescaled to 0-100.

use super::backend::AudioFrame;
use chrono::{DateTime, Utc};
use realfft::num_complex::Complex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;

pub const FFT_SIZE: usize = 256;
const BIN_COUNT: usize = FFT_SIZE / 2;
const MIN_DECIBELS: f32 = -100.0;
const MAX_DECIBELS: f32 = -30.0;
const SMOOTHING: f32 = 0.8;

/// One voice-activity reading
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AudioSample {
    /// Normalized level, 0-100
    pub level: f32,
    pub timestamp: DateTime<Utc>,
}

impl AudioSample {
    pub fn silent() -> Self {
        Self {
            level: 0.0,
            timestamp: Utc::now(),
        }
    }
}

/// Coarse link quality
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionQuality {
    Excellent,
    Good,
    Poor,
}

impl ConnectionQuality {
    /// Heuristic from the microphone level alone. Approximate; native
    /// transport statistics take precedence once available.
    pub fn from_level(level: f32) -> Self {
        if level > 50.0 {
            ConnectionQuality::Excellent
        } else if level > 20.0 {
            ConnectionQuality::Good
        } else {
            ConnectionQuality::Poor
        }
    }

    /// Latency-based score (100 minus round-trip penalties)
    pub fn from_round_trip_ms(rtt_ms: f64) -> Self {
        let penalty = if rtt_ms > 400.0 {
            50
        } else if rtt_ms > 200.0 {
            30
        } else if rtt_ms > 100.0 {
            15
        } else if rtt_ms > 50.0 {
            5
        } else {
            0
        };

        match 100 - penalty {
            score if score >= 80 => ConnectionQuality::Excellent,
            score if score >= 60 => ConnectionQuality::Good,
            _ => ConnectionQuality::Poor,
        }
    }
}

pub struct LevelAnalyser {
    fft: Arc<dyn realfft::RealToComplex<f32>>,
    window: Vec<f32>,
    history: VecDeque<f32>,
    smoothed: Vec<f32>,
}

impl LevelAnalyser {
    pub fn new() -> Self {
        let mut planner = realfft::RealFftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(FFT_SIZE);

        // Blackman, alpha = 0.16
        let n = FFT_SIZE as f32;
        let window = (0..FFT_SIZE)
            .map(|i| {
                let x = i as f32 / n;
                0.42 - 0.5 * (2.0 * std::f32::consts::PI * x).cos()
                    + 0.08 * (4.0 * std::f32::consts::PI * x).cos()
            })
            .collect();

        Self {
            fft,
            window,
            history: VecDeque::from(vec![0.0; FFT_SIZE]),
            smoothed: vec![0.0; BIN_COUNT],
        }
    }

    /// Feed captured audio; only the newest `FFT_SIZE` mono samples are kept
    pub fn push_frame(&mut self, frame: &AudioFrame) {
        let channels = frame.channels.max(1) as usize;
        for group in frame.samples.chunks_exact(channels) {
            let sum: f32 = group.iter().map(|s| *s as f32 / 32768.0).sum();
            self.history.push_back(sum / channels as f32);
        }

        while self.history.len() > FFT_SIZE {
            self.history.pop_front();
        }
    }

    /// Byte-scaled magnitude spectrum, `FFT_SIZE / 2` bins
    pub fn byte_frequency_data(&mut self) -> Vec<u8> {
        let mut input: Vec<f32> = self
            .history
            .iter()
            .zip(&self.window)
            .map(|(s, w)| s * w)
            .collect();
        let mut spectrum = vec![Complex::new(0.0f32, 0.0f32); FFT_SIZE / 2 + 1];

        if self.fft.process(&mut input, &mut spectrum).is_err() {
            return vec![0; BIN_COUNT];
        }

        let range = MAX_DECIBELS - MIN_DECIBELS;
        self.smoothed
            .iter_mut()
            .zip(&spectrum)
            .map(|(prev, bin)| {
                let magnitude = bin.norm() / FFT_SIZE as f32;
                *prev = SMOOTHING * *prev + (1.0 - SMOOTHING) * magnitude;

                if *prev <= 0.0 {
                    return 0;
                }
                let db = 20.0 * prev.log10();
                let scaled = (255.0 / range) * (db - MIN_DECIBELS);
                scaled.floor().clamp(0.0, 255.0) as u8
            })
            .collect()
    }

    /// Current voice-activity level, 0-100
    pub fn level(&mut self) -> f32 {
        let bins = self.byte_frequency_data();
        let average = bins.iter().map(|b| *b as f32).sum::<f32>() / bins.len() as f32;
        (average / 255.0 * 100.0).clamp(0.0, 100.0)
    }

    pub fn reset(&mut self) {
        self.history.iter_mut().for_each(|s| *s = 0.0);
        self.smoothed.iter_mut().for_each(|s| *s = 0.0);
    }
}

impl Default for LevelAnalyser {
    fn default() -> Self {
        Self::new()
    }
}
