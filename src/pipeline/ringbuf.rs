//! Fixed-depth slot ring backing a stage's output buffers

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use crossbeam::utils::CachePadded;
use flume::{Receiver, RecvTimeoutError, Sender};

use crate::error::{Result, VppError};

/// Slot ring with blocking acquire.
///
/// Slots are handed out in FIFO order of their release. At most `depth`
/// slots can be held at once; the next acquire blocks until one comes back
/// or the timeout expires.
pub struct FrameRing {
    depth: u32,
    free_tx: Sender<u32>,
    free_rx: Receiver<u32>,
    /// Bit per slot currently held by a consumer
    held: AtomicU64,

    /// Statistics
    stats: CachePadded<Stats>,
}

#[derive(Default)]
struct Stats {
    acquired: AtomicUsize,
    released: AtomicUsize,
    exhausted: AtomicUsize,
}

impl FrameRing {
    pub const MAX_DEPTH: u32 = 64;

    pub fn new(depth: u32) -> Result<Self> {
        if depth == 0 || depth > Self::MAX_DEPTH {
            return Err(VppError::InvalidArgument(format!(
                "ring depth {depth} not in 1..={}",
                Self::MAX_DEPTH
            )));
        }
        let (free_tx, free_rx) = flume::bounded(depth as usize);
        for slot in 0..depth {
            // Capacity equals depth, cannot fail
            let _ = free_tx.try_send(slot);
        }
        Ok(Self {
            depth,
            free_tx,
            free_rx,
            held: AtomicU64::new(0),
            stats: CachePadded::new(Stats::default()),
        })
    }

    /// Consumer: take a free slot, waiting up to `timeout`.
    pub fn acquire(&self, timeout: Duration) -> Result<u32> {
        match self.free_rx.recv_timeout(timeout) {
            Ok(slot) => {
                self.held.fetch_or(1 << slot, Ordering::AcqRel);
                self.stats.acquired.fetch_add(1, Ordering::Relaxed);
                Ok(slot)
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                self.stats.exhausted.fetch_add(1, Ordering::Relaxed);
                Err(VppError::Timeout {
                    op: "ring acquire",
                    timeout_ms: timeout.as_millis() as u32,
                })
            }
        }
    }

    /// Producer: give a slot back. Releasing a slot that is not held is an error.
    pub fn release(&self, slot: u32) -> Result<()> {
        if slot >= self.depth {
            return Err(VppError::InvalidArgument(format!(
                "slot {slot} outside ring of depth {}",
                self.depth
            )));
        }
        let bit = 1u64 << slot;
        let prev = self.held.fetch_and(!bit, Ordering::AcqRel);
        if prev & bit == 0 {
            return Err(VppError::InvalidArgument(format!("slot {slot} is not held")));
        }
        self.stats.released.fetch_add(1, Ordering::Relaxed);
        self.free_tx
            .try_send(slot)
            .map_err(|_| VppError::InvalidArgument(format!("slot {slot} could not be queued")))
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Slots currently held outside the ring
    pub fn outstanding(&self) -> u32 {
        self.held.load(Ordering::Acquire).count_ones()
    }

    /// (acquired, released, exhausted)
    pub fn stats(&self) -> (usize, usize, usize) {
        (
            self.stats.acquired.load(Ordering::Relaxed),
            self.stats.released.load(Ordering::Relaxed),
            self.stats.exhausted.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHORT: Duration = Duration::from_millis(20);

    #[test]
    fn exhaustion_is_detected() {
        let ring = FrameRing::new(3).unwrap();
        let held: Vec<u32> = (0..3).map(|_| ring.acquire(SHORT).unwrap()).collect();
        assert_eq!(held, vec![0, 1, 2]);
        assert_eq!(ring.outstanding(), 3);

        let err = ring.acquire(SHORT).unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(ring.stats().2, 1);

        ring.release(1).unwrap();
        assert_eq!(ring.acquire(SHORT).unwrap(), 1);
    }

    #[test]
    fn double_release_rejected() {
        let ring = FrameRing::new(2).unwrap();
        let slot = ring.acquire(SHORT).unwrap();
        ring.release(slot).unwrap();
        assert!(ring.release(slot).is_err());
        assert!(ring.release(5).is_err());
        assert_eq!(ring.outstanding(), 0);
    }

    #[test]
    fn depth_bounds() {
        assert!(FrameRing::new(0).is_err());
        assert!(FrameRing::new(65).is_err());
        assert_eq!(FrameRing::new(64).unwrap().depth(), 64);
    }
}
