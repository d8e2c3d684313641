//! Per-channel SBN ordering state machine and SLIP destuffer (spec.md §4.E).

use crate::error::FramingError;
use crate::stats::Stats;

/// SLIP byte-destuffer. Scratch is owned per-channel, never shared.
pub struct Destuffer {
    encoded_buf: Vec<u8>,
    esc: bool,
    max_len: usize,
}

impl Destuffer {
    pub fn new(max_len: usize) -> Self {
        Self {
            encoded_buf: Vec::with_capacity(max_len),
            esc: false,
            max_len,
        }
    }

    pub fn reset(&mut self) {
        self.encoded_buf.clear();
        self.esc = false;
    }

    /// Feeds one SLIP-framed block through the destuffer, invoking `on_frame`
    /// once for every completed (non-empty) frame encountered. Any
    /// [`FramingError`] leaves the destuffer reset and ready for the next
    /// block.
    pub fn feed(
        &mut self,
        block: &[u8],
        mut on_frame: impl FnMut(&[u8]),
    ) -> Result<(), FramingError> {
        for &b in block {
            if self.esc {
                self.esc = false;
                match b {
                    0xDC => self.encoded_buf.push(0xC0),
                    0xDD => self.encoded_buf.push(0xDB),
                    _ => {
                        self.reset();
                        return Err(FramingError::BadEscape);
                    }
                }
                continue;
            }
            match b {
                0xC0 => {
                    if !self.encoded_buf.is_empty() {
                        on_frame(&self.encoded_buf);
                        self.encoded_buf.clear();
                    }
                }
                0xDB => self.esc = true,
                _ => self.encoded_buf.push(b),
            }
            if self.encoded_buf.len() > self.max_len {
                self.reset();
                return Err(FramingError::Overflow);
            }
        }
        Ok(())
    }
}

/// Channel-local ordering/destuffing state, one instance per registered
/// channel id.
pub struct Channel {
    last_sbn: i16,
    destuffer: Destuffer,
    last_block_at: Option<std::time::Instant>,
}

impl Channel {
    pub fn new(max_encoded_packet_size: usize) -> Self {
        Self {
            last_sbn: -1,
            destuffer: Destuffer::new(max_encoded_packet_size),
            last_block_at: None,
        }
    }

    /// Applies the SBN-delta ordering table and, when in order, destuffs
    /// `buf`, invoking `on_frame` once per completed codec frame recovered.
    /// Also records the inter-block arrival time into `block_timing_ring`
    /// (milliseconds since the previous recovered block on this channel).
    pub fn on_block(&mut self, buf: &[u8], sbn: u8, stats: &Stats, mut on_frame: impl FnMut(&[u8])) {
        let now = std::time::Instant::now();
        if let Some(prev) = self.last_block_at {
            stats.block_timing_ring.push(now.duration_since(prev).as_millis() as u32);
        }
        self.last_block_at = Some(now);

        let sbn = sbn as i16;
        let first = self.last_sbn == -1;
        let delta = if first {
            1
        } else if self.last_sbn - sbn > 128 {
            256 - self.last_sbn + sbn
        } else {
            sbn - self.last_sbn
        };

        if first || delta == 1 {
            let _ = self.destuffer.feed(buf, &mut on_frame);
        } else if delta == 0 {
            stats.dup_block_count.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        } else if delta < 0 {
            stats.ooo_block_count.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        } else {
            stats
                .ooo_block_count
                .fetch_add((delta - 1) as u32, std::sync::atomic::Ordering::Relaxed);
            self.destuffer.reset();
        }

        self.last_sbn = sbn;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(n: u8) -> Vec<u8> {
        // one-byte "codec frame" n, SLIP-terminated
        vec![n, 0xC0]
    }

    #[test]
    fn straight_through_decodes_every_block() {
        let stats = Stats::new(0, 0);
        let mut ch = Channel::new(64);
        let mut seen = Vec::new();
        for sbn in 0u8..5 {
            ch.on_block(&block(sbn), sbn, &stats, |f| seen.push(f.to_vec()));
        }
        assert_eq!(seen, vec![vec![0], vec![1], vec![2], vec![3], vec![4]]);
        assert_eq!(stats.dup_block_count.load(std::sync::atomic::Ordering::Relaxed), 0);
        assert_eq!(stats.ooo_block_count.load(std::sync::atomic::Ordering::Relaxed), 0);
    }

    #[test]
    fn duplicate_block_is_counted_and_not_destuffed() {
        let stats = Stats::new(0, 0);
        let mut ch = Channel::new(64);
        let mut seen = Vec::new();
        ch.on_block(&block(0), 0, &stats, |f| seen.push(f.to_vec()));
        ch.on_block(&block(0), 0, &stats, |f| seen.push(f.to_vec()));
        assert_eq!(seen.len(), 1);
        assert_eq!(stats.dup_block_count.load(std::sync::atomic::Ordering::Relaxed), 1);
    }

    #[test]
    fn forward_gap_counts_ooo_and_resets_destuffer() {
        let stats = Stats::new(0, 0);
        let mut ch = Channel::new(64);
        let mut seen = Vec::new();
        ch.on_block(&block(0), 0, &stats, |f| seen.push(f.to_vec()));
        // jump from 0 to 3: delta == 3, counts 2 ooo, no destuff of block 3 itself
        ch.on_block(&block(3), 3, &stats, |f| seen.push(f.to_vec()));
        assert_eq!(seen.len(), 1);
        assert_eq!(stats.ooo_block_count.load(std::sync::atomic::Ordering::Relaxed), 2);
        // next in-order block after the gap resumes destuffing
        ch.on_block(&block(4), 4, &stats, |f| seen.push(f.to_vec()));
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn sbn_wraps_around_at_256() {
        let stats = Stats::new(0, 0);
        let mut ch = Channel::new(64);
        let mut seen = Vec::new();
        ch.on_block(&block(255), 255, &stats, |f| seen.push(f.to_vec()));
        ch.on_block(&block(0), 0, &stats, |f| seen.push(f.to_vec()));
        assert_eq!(seen, vec![vec![255], vec![0]]);
        assert_eq!(stats.dup_block_count.load(std::sync::atomic::Ordering::Relaxed), 0);
        assert_eq!(stats.ooo_block_count.load(std::sync::atomic::Ordering::Relaxed), 0);
    }

    #[test]
    fn reordered_earlier_sbn_is_out_of_order() {
        let stats = Stats::new(0, 0);
        let mut ch = Channel::new(64);
        let mut seen = Vec::new();
        ch.on_block(&block(5), 5, &stats, |f| seen.push(f.to_vec()));
        ch.on_block(&block(4), 4, &stats, |f| seen.push(f.to_vec()));
        assert_eq!(seen.len(), 1);
        assert_eq!(stats.ooo_block_count.load(std::sync::atomic::Ordering::Relaxed), 1);
    }

    #[test]
    fn destuffer_escapes_round_trip() {
        let mut d = Destuffer::new(64);
        let encoded = crate::util::slip_encode(&[0xC0, 0xDB, 0x01]);
        let mut seen = Vec::new();
        d.feed(&encoded, |f| seen.push(f.to_vec())).unwrap();
        assert_eq!(seen, vec![vec![0xC0, 0xDB, 0x01]]);
    }

    #[test]
    fn destuffer_overflow_resets_and_errors() {
        let mut d = Destuffer::new(4);
        let block = vec![1, 2, 3, 4, 5, 6];
        let mut seen: Vec<Vec<u8>> = Vec::new();
        let err = d.feed(&block, |f| seen.push(f.to_vec()));
        assert!(err.is_err());
        assert!(seen.is_empty());
    }

    #[test]
    fn destuffer_round_trips_random_payloads() {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            let len = rng.gen_range(0..64);
            let payload: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
            let encoded = crate::util::slip_encode(&payload);
            let mut d = Destuffer::new(256);
            let mut seen = Vec::new();
            d.feed(&encoded, |f| seen.push(f.to_vec())).unwrap();
            if payload.is_empty() {
                assert!(seen.is_empty());
            } else {
                assert_eq!(seen, vec![payload]);
            }
        }
    }
}
