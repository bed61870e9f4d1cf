use crate::audio::AudioFrame;
use crate::error::NegotiationError;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Packetisation interval of the outgoing track
pub const PACKET_MS: u64 = 20;

/// Codec of the outgoing audio track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackCodec {
    /// G.711 mu-law at 8 kHz
    #[default]
    Pcmu,
    /// Requires the `opus` feature
    Opus,
}

impl TrackCodec {
    pub fn mime_type(&self) -> &'static str {
        match self {
            TrackCodec::Pcmu => "audio/PCMU",
            TrackCodec::Opus => "audio/opus",
        }
    }

    pub fn clock_rate(&self) -> u32 {
        match self {
            TrackCodec::Pcmu => 8000,
            TrackCodec::Opus => 48000,
        }
    }

    pub fn channels(&self) -> u16 {
        match self {
            TrackCodec::Pcmu => 1,
            TrackCodec::Opus => 2,
        }
    }

    pub fn sdp_fmtp_line(&self) -> &'static str {
        match self {
            TrackCodec::Pcmu => "",
            TrackCodec::Opus => "minptime=10;useinbandfec=1",
        }
    }

    pub fn encoder(&self) -> Result<Box<dyn FrameEncoder>, NegotiationError> {
        match self {
            TrackCodec::Pcmu => Ok(Box::new(PcmuEncoder::new())),
            #[cfg(feature = "opus")]
            TrackCodec::Opus => Ok(Box::new(OpusEncoder::new()?)),
            #[cfg(not(feature = "opus"))]
            TrackCodec::Opus => Err(NegotiationError::OfferCreationFailed(
                "opus track requested but the opus feature is disabled".to_string(),
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EncodedPacket {
    pub data: Bytes,
    pub duration: Duration,
}

/// Turns captured PCM into codec packets of `PACKET_MS` each
pub trait FrameEncoder: Send {
    fn encode(&mut self, frame: AudioFrame) -> Vec<EncodedPacket>;
}

const ULAW_BIAS: i32 = 0x84;
const ULAW_CLIP: i32 = 32635;

/// G.711 mu-law companding of one sample
pub fn linear_to_ulaw(sample: i16) -> u8 {
    let mut pcm = sample as i32;
    let sign = if pcm < 0 {
        pcm = -pcm;
        0x80
    } else {
        0
    };

    pcm = pcm.min(ULAW_CLIP) + ULAW_BIAS;

    let mut exponent = 7;
    let mut mask = 0x4000;
    while exponent > 0 && pcm & mask == 0 {
        exponent -= 1;
        mask >>= 1;
    }

    let mantissa = (pcm >> (exponent + 3)) & 0x0F;
    !(sign | (exponent << 4) | mantissa) as u8
}

pub struct PcmuEncoder {
    pending: Vec<i16>,
}

impl PcmuEncoder {
    const RATE: u32 = 8000;
    const PACKET_SAMPLES: usize = (Self::RATE as u64 * PACKET_MS / 1000) as usize;

    pub fn new() -> Self {
        Self {
            pending: Vec::with_capacity(Self::PACKET_SAMPLES * 2),
        }
    }
}

impl Default for PcmuEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameEncoder for PcmuEncoder {
    fn encode(&mut self, frame: AudioFrame) -> Vec<EncodedPacket> {
        let frame = frame.to_mono().downsample(Self::RATE);
        self.pending.extend_from_slice(&frame.samples);

        let mut packets = Vec::new();
        while self.pending.len() >= Self::PACKET_SAMPLES {
            let payload: Vec<u8> = self
                .pending
                .drain(..Self::PACKET_SAMPLES)
                .map(linear_to_ulaw)
                .collect();
            packets.push(EncodedPacket {
                data: Bytes::from(payload),
                duration: Duration::from_millis(PACKET_MS),
            });
        }
        packets
    }
}

#[cfg(feature = "opus")]
pub struct OpusEncoder {
    encoder: audiopus::coder::Encoder,
    pending: Vec<i16>,
    output: Vec<u8>,
}

#[cfg(feature = "opus")]
impl OpusEncoder {
    const RATE: u32 = 48000;
    const PACKET_SAMPLES: usize = (Self::RATE as u64 * PACKET_MS / 1000) as usize;

    pub fn new() -> Result<Self, NegotiationError> {
        let encoder = audiopus::coder::Encoder::new(
            audiopus::SampleRate::Hz48000,
            audiopus::Channels::Mono,
            audiopus::Application::Voip,
        )
        .map_err(|e| NegotiationError::OfferCreationFailed(e.to_string()))?;

        Ok(Self {
            encoder,
            pending: Vec::with_capacity(Self::PACKET_SAMPLES * 2),
            output: vec![0u8; 1500],
        })
    }
}

#[cfg(feature = "opus")]
impl FrameEncoder for OpusEncoder {
    fn encode(&mut self, frame: AudioFrame) -> Vec<EncodedPacket> {
        let frame = frame.to_mono();

        if frame.sample_rate > 0 && frame.sample_rate < Self::RATE {
            // Sample-and-hold up to 48 kHz
            let repeat = (Self::RATE / frame.sample_rate) as usize;
            for s in &frame.samples {
                self.pending.extend(std::iter::repeat(*s).take(repeat));
            }
        } else {
            self.pending
                .extend_from_slice(&frame.downsample(Self::RATE).samples);
        }

        let mut packets = Vec::new();
        while self.pending.len() >= Self::PACKET_SAMPLES {
            let pcm: Vec<i16> = self.pending.drain(..Self::PACKET_SAMPLES).collect();
            match self.encoder.encode(&pcm, &mut self.output) {
                Ok(len) if len > 0 => packets.push(EncodedPacket {
                    data: Bytes::copy_from_slice(&self.output[..len]),
                    duration: Duration::from_millis(PACKET_MS),
                }),
                Ok(_) => {}
                Err(e) => tracing::warn!("Opus encode error: {}", e),
            }
        }
        packets
    }
}
