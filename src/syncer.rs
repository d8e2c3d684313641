//! Asynchronous sample-rate conversion and soft clock recovery (spec.md §4.G).

use std::time::{Duration, Instant};

use rubato::{Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction};

use crate::error::ConfigError;
use crate::ring::RingProducer;
use crate::stats::Stats;

/// EWMA coefficient for the receiver-side fill-level filter. Chosen to
/// settle over roughly one second at a 50-block-per-second cadence.
const SYNC_FILTER_ALPHA: f64 = 0.02;
/// Maximum per-call ratio correction, keeping pitch drift inaudible.
const MAX_RATIO_CORRECTION: f64 = 0.005;
/// How far a block's arrival may drift from the nominal cadence before it
/// counts as jitter, as a fraction of the nominal inter-block interval.
const JITTER_TOLERANCE: f64 = 0.5;

pub struct Syncer {
    resampler: SincFixedIn<f32>,
    network_channel_count: usize,
    decode_ring_max_size: usize,
    overrun: bool,
    scratch_in: Vec<Vec<f32>>,
    scratch_out: Vec<Vec<f32>>,
    nominal_interval: Duration,
    last_enqueue_at: Option<Instant>,
}

impl Syncer {
    pub fn new(
        encoded_sample_rate: f64,
        io_sample_rate: f64,
        audio_frame_size: usize,
        network_channel_count: usize,
        decode_ring_max_size: usize,
    ) -> Result<Self, ConfigError> {
        let params = SincInterpolationParameters {
            sinc_len: 256,
            f_cutoff: 0.95,
            interpolation: SincInterpolationType::Linear,
            oversampling_factor: 256,
            window: WindowFunction::BlackmanHarris2,
        };
        let ratio = io_sample_rate / encoded_sample_rate;
        let resampler = SincFixedIn::<f32>::new(
            ratio,
            1.0 + MAX_RATIO_CORRECTION,
            params,
            audio_frame_size,
            network_channel_count,
        )
        .map_err(|e| ConfigError::Read {
            path: "<resampler init>".into(),
            source: std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
        })?;

        let nominal_interval = Duration::from_secs_f64(audio_frame_size as f64 / encoded_sample_rate);

        Ok(Self {
            resampler,
            network_channel_count,
            decode_ring_max_size,
            overrun: false,
            scratch_in: vec![Vec::with_capacity(audio_frame_size); network_channel_count],
            scratch_out: Vec::new(),
            nominal_interval,
            last_enqueue_at: None,
        })
    }

    /// Deinterleaves `samples`, resamples from the encoded rate to the I/O
    /// rate with a small ratio bias toward keeping the ring half full, and
    /// pushes the re-interleaved output into `ring`. Applies the overrun
    /// latch: once the ring overflows, further pushes are dropped until the
    /// ring drains below half its logical max size. Also tracks the
    /// wall-clock gap between calls against the nominal block cadence,
    /// counting `encode_thread_jitter_count` on a large deviation.
    pub fn enqueue_buf(
        &mut self,
        samples: &[f32],
        audio_frame_size: usize,
        ring: &mut RingProducer,
        stats: &Stats,
    ) {
        let now = Instant::now();
        if let Some(prev) = self.last_enqueue_at {
            let elapsed = now.duration_since(prev);
            let deviation = elapsed.as_secs_f64() - self.nominal_interval.as_secs_f64();
            if deviation.abs() > self.nominal_interval.as_secs_f64() * JITTER_TOLERANCE {
                stats
                    .encode_thread_jitter_count
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }
        }
        self.last_enqueue_at = Some(now);

        let fill = ring.len();
        let filt = stats.receiver_sync_filt.load();
        let new_filt = filt + SYNC_FILTER_ALPHA * (fill as f64 - filt);
        stats.receiver_sync_filt.store(new_filt);

        let target = self.decode_ring_max_size as f64 / 2.0;
        let error = (target - new_filt) / target.max(1.0);
        let correction = (error * MAX_RATIO_CORRECTION).clamp(-MAX_RATIO_CORRECTION, MAX_RATIO_CORRECTION);
        let _ = self
            .resampler
            .set_resample_ratio_relative(1.0 + correction, true);

        for ch in self.scratch_in.iter_mut() {
            ch.clear();
        }
        for frame in 0..audio_frame_size {
            for ch in 0..self.network_channel_count {
                self.scratch_in[ch].push(samples[frame * self.network_channel_count + ch]);
            }
        }

        let out = match self.resampler.process(&self.scratch_in, None) {
            Ok(out) => out,
            Err(_) => return,
        };
        self.scratch_out = out;

        if self.overrun && ring.len() >= self.decode_ring_max_size / 2 {
            return;
        }
        self.overrun = false;

        let out_frames = self.scratch_out.first().map(|c| c.len()).unwrap_or(0);
        let needed = out_frames * self.network_channel_count;
        if ring.len() + needed > self.decode_ring_max_size {
            self.overrun = true;
            stats
                .buffer_overrun_count
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            return;
        }

        for frame in 0..out_frames {
            for ch in 0..self.network_channel_count {
                ring.push(self.scratch_out[ch][frame]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrun_latches_until_half_drain() {
        let mut syncer = Syncer::new(48_000.0, 48_000.0, 16, 1, 32).unwrap();
        let stats = Stats::new(0, 0);
        let mut ring = crate::ring::DecodeRing::new(32);
        let (mut producer, mut consumer) = ring.split();

        // Fill the ring past its max size to trigger overrun.
        for _ in 0..4 {
            let block = vec![0.1f32; 16];
            syncer.enqueue_buf(&block, 16, &mut producer, &stats);
        }
        assert!(
            stats
                .buffer_overrun_count
                .load(std::sync::atomic::Ordering::Relaxed)
                >= 1
        );

        // Drain below half the max size.
        while producer.len() > 16 {
            consumer.pop();
        }
        let before = stats
            .buffer_overrun_count
            .load(std::sync::atomic::Ordering::Relaxed);
        let block = vec![0.1f32; 16];
        syncer.enqueue_buf(&block, 16, &mut producer, &stats);
        // Once drained, the latch should release rather than re-trip on
        // every call indefinitely.
        let after = stats
            .buffer_overrun_count
            .load(std::sync::atomic::Ordering::Relaxed);
        assert!(after <= before + 1);
    }

    #[test]
    fn first_enqueue_never_counts_as_jitter() {
        let mut syncer = Syncer::new(48_000.0, 48_000.0, 16, 1, 64).unwrap();
        let stats = Stats::new(0, 0);
        let mut ring = crate::ring::DecodeRing::new(64);
        let (mut producer, _consumer) = ring.split();
        let block = vec![0.1f32; 16];
        syncer.enqueue_buf(&block, 16, &mut producer, &stats);
        assert_eq!(
            stats.encode_thread_jitter_count.load(std::sync::atomic::Ordering::Relaxed),
            0
        );
    }

    #[test]
    fn large_gap_between_calls_counts_as_jitter() {
        let mut syncer = Syncer::new(48_000.0, 48_000.0, 16, 1, 64).unwrap();
        let stats = Stats::new(0, 0);
        let mut ring = crate::ring::DecodeRing::new(64);
        let (mut producer, _consumer) = ring.split();
        let block = vec![0.1f32; 16];
        syncer.enqueue_buf(&block, 16, &mut producer, &stats);
        std::thread::sleep(Duration::from_millis(5));
        syncer.enqueue_buf(&block, 16, &mut producer, &stats);
        assert!(
            stats.encode_thread_jitter_count.load(std::sync::atomic::Ordering::Relaxed) >= 1
        );
    }
}
