//! Allocation of hardware codec pipeline ids

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tracing::{debug, error};

use crate::error::{Result, VppError};

/// Independent encode/decode instances the hardware can run at once
pub const MAX_PIPELINES: u8 = 8;

/// Bitmask allocator for pipeline ids `0..MAX_PIPELINES`.
///
/// One instance is shared (behind an `Arc`) by every encoder and decoder of
/// a process. Ids are handed out lowest first.
#[derive(Debug, Default)]
pub struct PipeIdAllocator {
    mask: AtomicU8,
}

impl PipeIdAllocator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Allocator with the ids in `mask` permanently taken.
    pub fn with_reserved(mask: u8) -> Arc<Self> {
        Arc::new(Self {
            mask: AtomicU8::new(mask),
        })
    }

    /// Claim the lowest free id.
    pub fn acquire_id(&self) -> Result<u8> {
        let mut claimed = None;
        let updated = self
            .mask
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |mask| {
                let id = (0..MAX_PIPELINES).find(|i| mask & (1 << i) == 0)?;
                claimed = Some(id);
                Some(mask | (1 << id))
            });
        match (updated, claimed) {
            (Ok(_), Some(id)) => {
                debug!(pipe_id = id, "pipeline id acquired");
                Ok(id)
            }
            _ => {
                error!("get pipe id failed, max pipeline num: {MAX_PIPELINES}");
                Err(VppError::NoFreePipeline { max: MAX_PIPELINES })
            }
        }
    }

    /// Give `id` back. Fails if it is out of range or not currently held.
    pub fn release_id(&self, id: u8) -> Result<()> {
        if id >= MAX_PIPELINES {
            return Err(VppError::InvalidPipeId(id));
        }
        let bit = 1u8 << id;
        let prev = self.mask.fetch_and(!bit, Ordering::AcqRel);
        if prev & bit == 0 {
            return Err(VppError::PipeIdNotHeld(id));
        }
        debug!(pipe_id = id, "pipeline id released");
        Ok(())
    }

    /// Claim an id that goes back when the lease is dropped.
    pub fn acquire(self: &Arc<Self>) -> Result<PipeIdLease> {
        let id = self.acquire_id()?;
        Ok(PipeIdLease {
            id,
            allocator: Arc::clone(self),
        })
    }

    pub fn in_use(&self) -> u8 {
        self.mask.load(Ordering::Acquire)
    }
}

/// Held pipeline id
#[derive(Debug)]
pub struct PipeIdLease {
    id: u8,
    allocator: Arc<PipeIdAllocator>,
}

impl PipeIdLease {
    pub fn id(&self) -> u8 {
        self.id
    }
}

impl Drop for PipeIdLease {
    fn drop(&mut self) {
        if let Err(e) = self.allocator.release_id(self.id) {
            error!("pipeline id lease release: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhaustive_and_non_overlapping() {
        let alloc = PipeIdAllocator::new();
        let ids: Vec<u8> = (0..8).map(|_| alloc.acquire_id().unwrap()).collect();
        assert_eq!(ids, (0..8).collect::<Vec<u8>>());
        assert!(matches!(
            alloc.acquire_id(),
            Err(VppError::NoFreePipeline { max: 8 })
        ));

        alloc.release_id(3).unwrap();
        assert_eq!(alloc.acquire_id().unwrap(), 3);
    }

    #[test]
    fn release_unheld_rejected() {
        let alloc = PipeIdAllocator::new();
        assert!(matches!(alloc.release_id(2), Err(VppError::PipeIdNotHeld(2))));
        assert!(matches!(alloc.release_id(9), Err(VppError::InvalidPipeId(9))));
    }

    #[test]
    fn lease_releases_on_drop() {
        let alloc = PipeIdAllocator::new();
        let a = alloc.acquire().unwrap();
        let b = alloc.acquire().unwrap();
        assert_eq!((a.id(), b.id()), (0, 1));
        drop(a);
        assert_eq!(alloc.in_use(), 0b10);
        assert_eq!(alloc.acquire().unwrap().id(), 0);
    }

    #[test]
    fn reserved_ids_skipped() {
        let alloc = PipeIdAllocator::with_reserved(0b0000_0111);
        assert_eq!(alloc.acquire_id().unwrap(), 3);
    }

    #[test]
    fn concurrent_acquire_is_unique() {
        let alloc = PipeIdAllocator::new();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let alloc = Arc::clone(&alloc);
                std::thread::spawn(move || alloc.acquire_id().unwrap())
            })
            .collect();
        let mut ids: Vec<u8> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        ids.sort_unstable();
        assert_eq!(ids, (0..8).collect::<Vec<u8>>());
        assert_eq!(alloc.in_use(), 0xff);
    }
}
