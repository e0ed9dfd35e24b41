use std::sync::atomic::{AtomicUsize, Ordering};

use memmap2::MmapOptions;
use tracing::warn;

use super::PlaneMemory;
use crate::error::{Error, Result};

/// Memory source for internal pools
pub trait Allocator: Send + Sync {
    /// Reserve `size` bytes, mapping them for CPU access when `map` is set.
    /// Returns the backing and the number of bytes charged.
    fn alloc(&self, size: usize, map: bool) -> Result<(PlaneMemory, usize)>;

    fn free(&self, charged: usize);

    fn in_use(&self) -> usize;
}

/// Anonymous-mmap allocator with a hard budget, standing in for ION carve-outs
pub struct MmapAllocator {
    budget: usize,
    used: AtomicUsize,
}

impl MmapAllocator {
    pub fn new(budget: usize) -> Self {
        Self {
            budget,
            used: AtomicUsize::new(0),
        }
    }

    pub fn with_budget_mb(mb: usize) -> Self {
        Self::new(mb * 1024 * 1024)
    }

    pub fn budget(&self) -> usize {
        self.budget
    }
}

/// Round up to the page size
pub fn page_align(size: usize) -> usize {
    let page = page_size::get();
    size.div_ceil(page) * page
}

impl Allocator for MmapAllocator {
    fn alloc(&self, size: usize, map: bool) -> Result<(PlaneMemory, usize)> {
        let charged = page_align(size);

        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                let next = used.checked_add(charged)?;
                (next <= self.budget).then_some(next)
            })
            .map_err(|used| Error::Allocation {
                pool: "mmap".into(),
                reason: format!(
                    "{} bytes requested, {} of {} in use",
                    charged, used, self.budget
                ),
            })?;

        if !map {
            return Ok((PlaneMemory::Reserved, charged));
        }

        match MmapOptions::new().len(charged).map_anon() {
            Ok(map) => Ok((PlaneMemory::Mapped(map), charged)),
            Err(e) => {
                warn!("anonymous map of {} bytes failed: {}", charged, e);
                self.used.fetch_sub(charged, Ordering::AcqRel);
                Err(Error::Allocation {
                    pool: "mmap".into(),
                    reason: e.to_string(),
                })
            }
        }
    }

    fn free(&self, charged: usize) {
        self.used.fetch_sub(charged, Ordering::AcqRel);
    }

    fn in_use(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }
}
