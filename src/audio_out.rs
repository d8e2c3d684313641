//! Realtime audio output callback driver (spec.md §4.H).

use std::sync::atomic::Ordering;
use std::sync::Arc;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};
use tracing::warn;

use crate::config::AudioConfig;
use crate::error::AudioError;
use crate::ring::RingConsumer;
use crate::stats::Stats;

pub struct AudioOut {
    stream: cpal::Stream,
}

impl AudioOut {
    /// Builds and starts a `cpal` output stream at `cfg.device_name`,
    /// falling back to the host default output device if no device matches
    /// that name. The callback never allocates: on an empty ring it
    /// substitutes silence and counts an underrun.
    pub fn start(
        cfg: &AudioConfig,
        mut consumer: RingConsumer,
        stats: Arc<Stats>,
    ) -> Result<Self, AudioError> {
        let host = cpal::default_host();
        let device = host
            .output_devices()?
            .find(|d| d.name().map(|n| n == cfg.device_name).unwrap_or(false))
            .or_else(|| {
                warn!(
                    device_name = %cfg.device_name,
                    "configured output device not found, falling back to default"
                );
                host.default_output_device()
            })
            .ok_or(AudioError::NoDevice)?;

        let stream_config = StreamConfig {
            channels: cfg.network_channel_count as u16,
            sample_rate: SampleRate(cfg.io_sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let channels = cfg.network_channel_count;
        let err_stats = stats.clone();
        let stream = device.build_output_stream(
            &stream_config,
            move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                for frame in data.chunks_mut(channels) {
                    for sample in frame.iter_mut() {
                        *sample = match consumer.pop() {
                            Some(s) => s,
                            None => {
                                stats.buffer_underrun_count.fetch_add(1, Ordering::Relaxed);
                                0.0
                            }
                        };
                    }
                }
            },
            move |err| {
                warn!(%err, "cpal output stream error");
                err_stats.audio_loop_xrun_count.fetch_add(1, Ordering::Relaxed);
            },
            None,
        )?;

        stream.play()?;
        Ok(Self { stream })
    }
}

impl Drop for AudioOut {
    fn drop(&mut self) {
        let _ = self.stream.pause();
    }
}
