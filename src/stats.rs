//! Process-wide statistics surface (component I), threaded through every
//! component as an explicit `Arc<Stats>` rather than a global registry
//! (see DESIGN.md / SPEC_FULL.md §9).

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

pub const STREAM_METER_BINS: usize = 32;
pub const BLOCK_TIMING_RING_LEN: usize = 64;

/// A lock-free `f64` gauge cell: last-write-wins, bit-cast onto an `AtomicU64`.
#[derive(Default)]
pub struct GaugeCell(AtomicU64);

impl GaugeCell {
    pub fn new(v: f64) -> Self {
        Self(AtomicU64::new(v.to_bits()))
    }

    pub fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }

    pub fn store(&self, v: f64) {
        self.0.store(v.to_bits(), Ordering::Relaxed);
    }
}

#[derive(Default)]
pub struct EndpointStats {
    pub open: AtomicU32,
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
    pub errors: AtomicU32,
    pub last_sbn: std::sync::atomic::AtomicI32,
    pub send_congestion: AtomicU32,
}

impl EndpointStats {
    fn new() -> Self {
        Self {
            last_sbn: std::sync::atomic::AtomicI32::new(-1),
            ..Default::default()
        }
    }
}

/// A fixed-size ring of monotonically-written counters, matching
/// `statsCh1.blockTimingRing` in the original.
pub struct TimingRing {
    bins: Vec<AtomicU32>,
    pos: AtomicU32,
}

impl TimingRing {
    fn new(len: usize) -> Self {
        Self {
            bins: (0..len).map(|_| AtomicU32::new(0)).collect(),
            pos: AtomicU32::new(0),
        }
    }

    pub fn push(&self, value: u32) {
        let pos = self.pos.fetch_add(1, Ordering::Relaxed) as usize % self.bins.len();
        self.bins[pos].store(value, Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.bins.len()
    }

    pub fn get(&self, i: usize) -> u32 {
        self.bins[i].load(Ordering::Relaxed)
    }

    pub fn write_pos(&self) -> u32 {
        self.pos.load(Ordering::Relaxed) % self.bins.len() as u32
    }
}

#[derive(Default)]
pub struct AudioChannelStats {
    pub clipping_count: AtomicU32,
    pub level_fast: GaugeCell,
    pub level_slow: GaugeCell,
}

/// All receiver statistics cells. Constructed once per process and shared
/// via `Arc`.
pub struct Stats {
    pub dup_block_count: AtomicU32,
    pub ooo_block_count: AtomicU32,
    pub codec_error_count: AtomicU32,
    pub crc_fail_count: AtomicU32,
    pub buffer_overrun_count: AtomicU32,
    pub buffer_underrun_count: AtomicU32,
    pub audio_loop_xrun_count: AtomicU32,
    pub encode_thread_jitter_count: AtomicU32,
    pub stream_buffer_pos: std::sync::atomic::AtomicI32,
    pub receiver_sync_filt: GaugeCell,
    pub endpoints: Vec<EndpointStats>,
    pub audio_channels: Vec<AudioChannelStats>,
    pub stream_meter_bins: Vec<AtomicU32>,
    pub block_timing_ring: TimingRing,
}

impl Stats {
    pub fn new(endpoint_count: usize, audio_channel_count: usize) -> Self {
        Self {
            dup_block_count: AtomicU32::new(0),
            ooo_block_count: AtomicU32::new(0),
            codec_error_count: AtomicU32::new(0),
            crc_fail_count: AtomicU32::new(0),
            buffer_overrun_count: AtomicU32::new(0),
            buffer_underrun_count: AtomicU32::new(0),
            audio_loop_xrun_count: AtomicU32::new(0),
            encode_thread_jitter_count: AtomicU32::new(0),
            stream_buffer_pos: std::sync::atomic::AtomicI32::new(0),
            receiver_sync_filt: GaugeCell::new(0.0),
            endpoints: (0..endpoint_count).map(|_| EndpointStats::new()).collect(),
            audio_channels: (0..audio_channel_count)
                .map(|_| AudioChannelStats::default())
                .collect(),
            stream_meter_bins: (0..STREAM_METER_BINS).map(|_| AtomicU32::new(0)).collect(),
            block_timing_ring: TimingRing::new(BLOCK_TIMING_RING_LEN),
        }
    }
}

/// Maps raw bin counts onto `0..=255` for heatmap display, matching
/// `monitor.cpp`'s `mapStreamMeterBins`. Bins with a zero count stay zero;
/// any bin with a nonzero count maps to at least 1 so it remains visible.
pub fn map_stream_meter_bins(raw: &[u32]) -> Vec<u8> {
    let mut min = 0u32;
    let mut max = 0u32;
    for (i, &v) in raw.iter().enumerate() {
        if i == 0 {
            min = v;
            max = v;
        } else if v < min && v > 0 {
            min = v;
        } else if v > max {
            max = v;
        }
    }

    if min == max {
        return vec![0u8; raw.len()];
    }

    raw.iter()
        .map(|&v| {
            if v < min {
                0u8
            } else {
                let mapped = 255 * (v - min) / (max - min);
                if mapped == 0 {
                    1
                } else {
                    mapped as u8
                }
            }
        })
        .collect()
}

/// EWMA coefficients for the per-channel level meters. Not ported from
/// available original source (the producer-side call sites for
/// `clippingCounts`/`levelsFast`/`levelsSlow` live in audio/demux C sources
/// outside the retrieval pack) — a standard fast/slow dual-rate peak meter,
/// the idiom `monitor.cpp`'s field names imply.
const LEVEL_FAST_ALPHA: f64 = 0.3;
const LEVEL_SLOW_ALPHA: f64 = 0.02;
const CLIP_THRESHOLD: f32 = 0.999;

/// Updates per-channel clipping counts and fast/slow level meters from one
/// decoded interleaved frame, and buckets the loudest channel's peak into
/// `stream_meter_bins` for the telemetry heatmap.
pub fn update_audio_meters(stats: &Stats, samples: &[f32], network_channel_count: usize) {
    if network_channel_count == 0 {
        return;
    }
    let mut overall_peak = 0.0f32;
    for (c, ch_stats) in stats.audio_channels.iter().enumerate() {
        if c >= network_channel_count {
            break;
        }
        let mut peak = 0.0f32;
        let mut i = c;
        while i < samples.len() {
            let s = samples[i].abs();
            if s > peak {
                peak = s;
            }
            i += network_channel_count;
        }
        if peak >= CLIP_THRESHOLD {
            ch_stats.clipping_count.fetch_add(1, Ordering::Relaxed);
        }
        let peak = peak as f64;
        let fast = ch_stats.level_fast.load();
        ch_stats.level_fast.store(fast + LEVEL_FAST_ALPHA * (peak - fast));
        let slow = ch_stats.level_slow.load();
        ch_stats.level_slow.store(slow + LEVEL_SLOW_ALPHA * (peak - slow));

        if peak as f32 > overall_peak {
            overall_peak = peak as f32;
        }
    }

    let bin = ((overall_peak.clamp(0.0, 1.0) * (STREAM_METER_BINS - 1) as f32) as usize)
        .min(STREAM_METER_BINS - 1);
    stats.stream_meter_bins[bin].fetch_add(1, Ordering::Relaxed);
}

/// Flattens the timing ring into a linear byte buffer excluding the current
/// write head, matching `monitor.cpp`'s `mapBlockTimingRing`.
pub fn map_block_timing_ring(ring: &TimingRing) -> Vec<u8> {
    let len = ring.len();
    let mut pos = ring.write_pos() as usize;
    pos = (pos + 1) % len;
    let mut out = Vec::with_capacity(4 * (len - 1));
    for _ in 0..(len - 1) {
        out.extend_from_slice(&ring.get(pos).to_le_bytes());
        pos = (pos + 1) % len;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gauge_round_trips() {
        let g = GaugeCell::new(1.5);
        assert_eq!(g.load(), 1.5);
        g.store(-2.25);
        assert_eq!(g.load(), -2.25);
    }

    #[test]
    fn stream_meter_bins_constant_input_maps_to_zero() {
        let raw = vec![5u32; 4];
        assert_eq!(map_stream_meter_bins(&raw), vec![0u8; 4]);
    }

    #[test]
    fn stream_meter_bins_maps_range() {
        let raw = vec![0u32, 5, 10];
        let mapped = map_stream_meter_bins(&raw);
        assert_eq!(mapped[0], 0);
        assert_eq!(mapped[2], 255);
        assert!(mapped[1] > 0 && mapped[1] < 255);
    }

    #[test]
    fn update_audio_meters_flags_clipping_and_bumps_levels() {
        let stats = Stats::new(0, 2);
        let samples = [1.0f32, 0.1, -1.0, 0.2];
        update_audio_meters(&stats, &samples, 2);
        assert_eq!(stats.audio_channels[0].clipping_count.load(Ordering::Relaxed), 1);
        assert_eq!(stats.audio_channels[1].clipping_count.load(Ordering::Relaxed), 0);
        assert!(stats.audio_channels[0].level_fast.load() > 0.0);
        assert!(stats.audio_channels[1].level_fast.load() > 0.0);

        let total: u32 = stats.stream_meter_bins.iter().map(|b| b.load(Ordering::Relaxed)).sum();
        assert_eq!(total, 1);
    }
}
