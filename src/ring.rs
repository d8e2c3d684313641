//! SPSC decode ring: the handoff between the syncer (producer) and the
//! audio callback (consumer). Backed by `ringbuf::HeapRb`, which already
//! gives the exact occupied-length query the syncer needs to react to fill
//! level (spec.md §4.A).

use ringbuf::{HeapConsumer, HeapProducer, HeapRb};

use crate::util::round_up_pow2;

pub struct DecodeRing {
    producer: HeapProducer<f32>,
    consumer: HeapConsumer<f32>,
    capacity: usize,
}

/// Split halves returned by [`DecodeRing::split`]; producer is owned by the
/// syncer, consumer by the audio callback. Neither half is `Sync` with the
/// other on purpose — the SPSC contract is enforced at the type level.
pub struct RingProducer(HeapProducer<f32>);
pub struct RingConsumer(HeapConsumer<f32>);

impl DecodeRing {
    /// Allocates a ring whose capacity is the next power of two `>= min_capacity.max(2)`.
    pub fn new(min_capacity: usize) -> Self {
        let capacity = round_up_pow2(min_capacity.max(2) as u32) as usize;
        let rb = HeapRb::<f32>::new(capacity);
        let (producer, consumer) = rb.split();
        Self {
            producer,
            consumer,
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn split(self) -> (RingProducer, RingConsumer) {
        (RingProducer(self.producer), RingConsumer(self.consumer))
    }
}

impl RingProducer {
    /// Pushes one sample. Returns `false` (and drops the sample) if the ring
    /// is full — callers are expected to have already checked `len()`
    /// against the logical max size, per spec.md's "caller queries size
    /// first" contract; this is the last-resort backstop.
    pub fn push(&mut self, sample: f32) -> bool {
        self.0.push(sample).is_ok()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl RingConsumer {
    pub fn pop(&mut self) -> Option<f32> {
        self.0.pop()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_is_power_of_two() {
        let ring = DecodeRing::new(1000);
        assert_eq!(ring.capacity(), 1024);
        assert!(ring.capacity().is_power_of_two());
    }

    #[test]
    fn len_is_exact() {
        let ring = DecodeRing::new(8);
        let (mut p, mut c) = ring.split();
        assert_eq!(p.len(), 0);
        for i in 0..5 {
            assert!(p.push(i as f32));
        }
        assert_eq!(p.len(), 5);
        assert_eq!(c.pop(), Some(0.0));
        assert_eq!(p.len(), 4);
        assert_eq!(c.len(), 4);
    }
}
