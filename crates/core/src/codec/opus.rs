//! Opus encode and decode over `audiopus`, generalized from the teacher's
//! PulseAudio-bound encoder: here the PCM source/sink is the MKV reader and
//! writer rather than a live capture device, so the facade takes and
//! returns plain `i16` sample slices.

use audiopus::coder::{Decoder as OpusDecoderInner, Encoder as OpusEncoderInner};
use audiopus::{Application, Channels, SampleRate};

use crate::error::MediaError;

const MAX_OPUS_FRAME_BYTES: usize = 4000;
/// Largest decoded frame size we ever ask `audiopus` for: 120ms at 48kHz
/// stereo, the maximum Opus frame duration.
const MAX_PCM_SAMPLES: usize = 48_000 * 2 * 120 / 1000;

fn to_channels(channels: u16) -> Result<Channels, MediaError> {
    match channels {
        1 => Ok(Channels::Mono),
        2 => Ok(Channels::Stereo),
        other => Err(MediaError::Encode(format!(
            "unsupported opus channel count: {other}"
        ))),
    }
}

fn to_sample_rate(rate: u32) -> Result<SampleRate, MediaError> {
    match rate {
        48000 => Ok(SampleRate::Hz48000),
        24000 => Ok(SampleRate::Hz24000),
        16000 => Ok(SampleRate::Hz16000),
        12000 => Ok(SampleRate::Hz12000),
        8000 => Ok(SampleRate::Hz8000),
        other => Err(MediaError::Encode(format!(
            "unsupported opus sample rate: {other}"
        ))),
    }
}

pub struct OpusEncoderFacade {
    inner: OpusEncoderInner,
    out_buf: Vec<u8>,
}

impl OpusEncoderFacade {
    pub fn new(sample_rate: u32, channels: u16) -> Result<Self, MediaError> {
        let inner = OpusEncoderInner::new(
            to_sample_rate(sample_rate)?,
            to_channels(channels)?,
            Application::Audio,
        )
        .map_err(|e| MediaError::Encode(format!("failed to open opus encoder: {e:?}")))?;
        Ok(Self {
            inner,
            out_buf: vec![0u8; MAX_OPUS_FRAME_BYTES],
        })
    }

    /// Encode one 10-20ms PCM frame (spec.md §4.11: "10 ms framing, 48 kHz
    /// mono/stereo only").
    pub fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>, MediaError> {
        let len = self
            .inner
            .encode(pcm, &mut self.out_buf)
            .map_err(|e| MediaError::Encode(format!("opus encode failed: {e:?}")))?;
        Ok(self.out_buf[..len].to_vec())
    }
}

pub struct OpusDecoderFacade {
    inner: OpusDecoderInner,
    channels: usize,
    out_buf: Vec<i16>,
}

impl OpusDecoderFacade {
    pub fn new(sample_rate: u32, channels: u16) -> Result<Self, MediaError> {
        let inner = OpusDecoderInner::new(to_sample_rate(sample_rate)?, to_channels(channels)?)
            .map_err(|e| MediaError::Decode(format!("failed to open opus decoder: {e:?}")))?;
        Ok(Self {
            inner,
            channels: channels as usize,
            out_buf: vec![0i16; MAX_PCM_SAMPLES],
        })
    }

    /// Decode one Opus packet into interleaved PCM samples. A library
    /// decode error is reported, not propagated as fatal — the ingress
    /// pipeline counts it and continues (spec.md §7.4).
    pub fn decode(&mut self, packet: &[u8]) -> Result<Vec<i16>, MediaError> {
        let samples_per_channel = self
            .inner
            .decode(
                Some(audiopus::packet::Packet::try_from(packet).map_err(|e| {
                    MediaError::Decode(format!("invalid opus packet: {e:?}"))
                })?),
                audiopus::MutSignals::try_from(&mut self.out_buf[..])
                    .map_err(|e| MediaError::Decode(format!("opus decode buffer error: {e:?}")))?,
                false,
            )
            .map_err(|e| MediaError::Decode(format!("opus decode failed: {e:?}")))?;
        Ok(self.out_buf[..samples_per_channel * self.channels].to_vec())
    }
}
