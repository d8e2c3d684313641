//! Codec frame decode: Opus (via the `opus` crate, N independent mono
//! decoders) or hand-rolled big-endian 24-bit PCM with a CRC-16 trailer
//! (spec.md §4.F).

use crate::config::AudioConfig;
use crate::error::CodecError;
use crate::stats::Stats;
use crate::util;

pub struct OpusState {
    decoders: Vec<opus::Decoder>,
    network_channel_count: usize,
    frame_size: usize,
    /// Which of the `network_channel_count` per-channel sub-packets the next
    /// `decode` call will fill. The sender SLIP-delimits one independent mono
    /// Opus packet per channel per audio frame, in channel order; a full
    /// interleaved frame is only ready once this cursor wraps back to zero.
    cursor: usize,
    accum: Vec<f32>,
    mono_scratch: Vec<f32>,
}

impl OpusState {
    fn new(network_channel_count: usize, frame_size: usize) -> Result<Self, CodecError> {
        let decoders = (0..network_channel_count)
            .map(|_| opus::Decoder::new(48_000, opus::Channels::Mono))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            decoders,
            network_channel_count,
            frame_size,
            cursor: 0,
            accum: vec![0.0; network_channel_count * frame_size],
            mono_scratch: vec![0.0; frame_size],
        })
    }

    /// Decodes one channel's Opus packet into the accumulator at the current
    /// cursor position. Returns `Some(&accum)` once every channel for this
    /// audio frame has been filled, `None` while still accumulating.
    fn decode(&mut self, packet: &[u8]) -> Result<Option<&[f32]>, CodecError> {
        let ch = self.cursor;
        let n = self.decoders[ch].decode_float(packet, &mut self.mono_scratch, false)?;
        if n != self.frame_size {
            return Err(CodecError::UnexpectedLength {
                got: n as i32,
                expected: self.frame_size,
            });
        }
        for (i, &s) in self.mono_scratch.iter().enumerate() {
            self.accum[i * self.network_channel_count + ch] = s;
        }
        self.cursor = (self.cursor + 1) % self.network_channel_count;
        if self.cursor == 0 {
            Ok(Some(&self.accum))
        } else {
            Ok(None)
        }
    }
}

pub struct PcmState {
    network_channel_count: usize,
    frame_size: usize,
    accum: Vec<f32>,
}

impl PcmState {
    fn new(network_channel_count: usize, frame_size: usize) -> Self {
        Self {
            network_channel_count,
            frame_size,
            accum: vec![0.0; network_channel_count * frame_size],
        }
    }

    /// Decodes one interleaved PCM frame with a trailing CRC-16. Returns
    /// `Ok(None)` (no samples produced, not a hard error) on CRC mismatch,
    /// matching the original's soft-fail on `result == -3`.
    fn decode(&mut self, packet: &[u8], stats: &Stats) -> Result<Option<&[f32]>, CodecError> {
        let expected = 3 * self.network_channel_count * self.frame_size + 2;
        if packet.len() != expected {
            return Err(CodecError::BadLength {
                got: packet.len(),
                expected,
            });
        }
        let sample_bytes = &packet[..packet.len() - 2];
        let crc_wire = util::read_u16_le(&packet[packet.len() - 2..]);
        let crc_calc = util::crc16(0xFFFF, sample_bytes);
        if crc_wire != crc_calc {
            stats
                .crc_fail_count
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            return Ok(None);
        }
        let total = self.network_channel_count * self.frame_size;
        for i in 0..total {
            self.accum[i] = util::s24_to_f32(sample_bytes, i);
        }
        Ok(Some(&self.accum))
    }
}

pub enum Codec {
    Opus(OpusState),
    Pcm(PcmState),
}

impl Codec {
    pub fn new(cfg: &AudioConfig, frame_size: usize) -> Result<Self, CodecError> {
        match cfg.encoding {
            crate::config::AudioEncoding::Opus => {
                Ok(Codec::Opus(OpusState::new(cfg.network_channel_count, frame_size)?))
            }
            crate::config::AudioEncoding::Pcm => {
                Ok(Codec::Pcm(PcmState::new(cfg.network_channel_count, frame_size)))
            }
        }
    }

    /// Decodes one recovered codec frame. Opus accumulates one channel's
    /// mono sub-packet at a time and only yields interleaved samples once
    /// every channel for the current audio frame has arrived; PCM always
    /// yields immediately (or `None` on a CRC failure).
    pub fn decode(&mut self, packet: &[u8], stats: &Stats) -> Result<Option<&[f32]>, CodecError> {
        match self {
            Codec::Opus(state) => state.decode(packet),
            Codec::Pcm(state) => state.decode(packet, stats),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pcm_round_trip_and_crc_check() {
        let network_channel_count = 2;
        let frame_size = 4;
        let mut bytes = vec![0u8; 3 * network_channel_count * frame_size];
        for i in 0..(network_channel_count * frame_size) {
            util::f32_to_s24(&mut bytes, i, (i as f32 / 10.0) - 0.3);
        }
        let crc = util::crc16(0xFFFF, &bytes);
        bytes.extend_from_slice(&crc.to_le_bytes());

        let stats = Stats::new(0, 0);
        let mut codec = Codec::new(
            &AudioConfig {
                encoding: crate::config::AudioEncoding::Pcm,
                network_channel_count,
                io_sample_rate: 48_000,
                device_name: "default".into(),
            },
            frame_size,
        )
        .unwrap();
        let samples = codec.decode(&bytes, &stats).unwrap();
        assert_eq!(samples.map(|s| s.len()), Some(network_channel_count * frame_size));
        assert_eq!(stats.crc_fail_count.load(std::sync::atomic::Ordering::Relaxed), 0);
    }

    #[test]
    fn pcm_crc_mismatch_is_soft_failure() {
        let network_channel_count = 1;
        let frame_size = 2;
        let mut bytes = vec![0u8; 3 * network_channel_count * frame_size + 2];
        bytes[bytes.len() - 2] = 0xAB;
        bytes[bytes.len() - 1] = 0xCD;

        let stats = Stats::new(0, 0);
        let mut codec = Codec::new(
            &AudioConfig {
                encoding: crate::config::AudioEncoding::Pcm,
                network_channel_count,
                io_sample_rate: 48_000,
                device_name: "default".into(),
            },
            frame_size,
        )
        .unwrap();
        let samples = codec.decode(&bytes, &stats).unwrap();
        assert!(samples.is_none());
        assert_eq!(stats.crc_fail_count.load(std::sync::atomic::Ordering::Relaxed), 1);
    }

    #[test]
    fn pcm_bad_length_is_hard_error() {
        let stats = Stats::new(0, 0);
        let mut codec = Codec::new(
            &AudioConfig {
                encoding: crate::config::AudioEncoding::Pcm,
                network_channel_count: 1,
                io_sample_rate: 48_000,
                device_name: "default".into(),
            },
            2,
        )
        .unwrap();
        let err = codec.decode(&[0u8; 3], &stats);
        assert!(err.is_err());
    }

    #[test]
    fn opus_multichannel_yields_only_once_all_channels_arrive() {
        let network_channel_count = 2;
        let frame_size = 160;
        let stats = Stats::new(0, 0);
        let mut codec = Codec::new(
            &AudioConfig {
                encoding: crate::config::AudioEncoding::Opus,
                network_channel_count,
                io_sample_rate: 48_000,
                device_name: "default".into(),
            },
            frame_size,
        )
        .unwrap();

        let mut encoder = opus::Encoder::new(48_000, opus::Channels::Mono, opus::Application::Audio).unwrap();
        let silence = vec![0f32; frame_size];
        let mut packet = vec![0u8; 256];
        let len = encoder.encode_float(&silence, &mut packet).unwrap();
        packet.truncate(len);

        // First channel's sub-packet: still accumulating, nothing yielded yet.
        let first = codec.decode(&packet, &stats).unwrap();
        assert!(first.is_none());

        // Second (last) channel's sub-packet completes the frame.
        let second = codec.decode(&packet, &stats).unwrap();
        assert_eq!(second.map(|s| s.len()), Some(network_channel_count * frame_size));
    }
}
