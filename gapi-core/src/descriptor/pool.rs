//! Allocation of binding tables out of descriptor pools.
//!
//! A binding table of a [`MergedLayout`] needs a fixed number of descriptors in each of the heaps
//! of the layout. Rather than creating a pool per binding table, the [`DescriptorPoolAllocator`]
//! creates pools with room for [`POOL_SIZE`] binding tables and hands out one *slot* of a pool at
//! a time. The slot determines where the descriptors of the binding table start in each heap.

use super::layout::{DescriptorHeap, MergedLayout};
use crate::OomError;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::{
    fmt,
    num::NonZeroU64,
    sync::atomic::{AtomicU64, Ordering},
};

/// The number of binding tables that a single pool has room for.
pub const POOL_SIZE: u32 = u128::BITS;

/// Creates the descriptor pools that a [`DescriptorPoolAllocator`] allocates from.
pub trait DescriptorPoolBackend: Send + Sync {
    /// Opaque handle to a descriptor pool.
    type Pool: Clone + Send;

    /// Creates a pool with room for `capacity` binding tables.
    ///
    /// `heaps` contains the total number of descriptors of each heap of the pool, which is already
    /// multiplied by `capacity`.
    fn create_pool(&self, heaps: &[DescriptorHeap], capacity: u32) -> Result<Self::Pool, OomError>;
}

/// Hands out slots of descriptor pools for the binding tables of a single layout.
///
/// The allocator is meant to be shared between threads through an `Arc`. Pools are created on
/// demand and are only released when the allocator is dropped.
pub struct DescriptorPoolAllocator<B: DescriptorPoolBackend> {
    id: AllocatorId,
    backend: B,
    // The heaps needed by one binding table.
    heaps: SmallVec<[DescriptorHeap; 2]>,
    pools: Mutex<Vec<Pool<B::Pool>>>,
}

struct Pool<P> {
    inner: P,
    // Bit `n` is set if slot `n` is in use.
    bitmap: u128,
}

impl<B: DescriptorPoolBackend> DescriptorPoolAllocator<B> {
    /// Creates an allocator for binding tables of `layout`. No pool is created until the first
    /// call to [`acquire`](Self::acquire).
    pub fn new(backend: B, layout: &MergedLayout) -> Self {
        DescriptorPoolAllocator {
            id: AllocatorId::next(),
            backend,
            heaps: layout.heaps().iter().copied().collect(),
            pools: Mutex::new(Vec::new()),
        }
    }

    /// Returns the backend that pools are created with.
    #[inline]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Returns the heaps that a single binding table needs.
    #[inline]
    pub fn heaps(&self) -> &[DescriptorHeap] {
        &self.heaps
    }

    /// Acquires storage for one binding table.
    ///
    /// The lowest free slot of the oldest pool that isn't full is used. If every pool is full, a
    /// new pool is created, and an error of the backend is returned as is.
    pub fn acquire(&self) -> Result<PoolAllocation<B::Pool>, OomError> {
        let mut pools = self.pools.lock();

        let index = match pools.iter().position(|pool| pool.bitmap != u128::MAX) {
            Some(index) => index,
            None => {
                let heaps: SmallVec<[_; 2]> = self
                    .heaps
                    .iter()
                    .map(|heap| DescriptorHeap {
                        heap_type: heap.heap_type,
                        descriptor_count: heap.descriptor_count * POOL_SIZE,
                    })
                    .collect();

                let inner = self
                    .backend
                    .create_pool(&heaps, POOL_SIZE)
                    .inspect_err(|err| log::warn!("failed to create a descriptor pool: {err}"))?;

                pools.push(Pool { inner, bitmap: 0 });
                log::debug!("created descriptor pool {}", pools.len() - 1);

                pools.len() - 1
            }
        };

        let pool = &mut pools[index];
        let slot = pool.bitmap.trailing_ones();
        pool.bitmap |= 1 << slot;

        Ok(PoolAllocation {
            allocator: self.id,
            pool: pool.inner.clone(),
            pool_index: index,
            slot,
            heap_offsets: self
                .heaps
                .iter()
                .map(|heap| heap.descriptor_count * slot)
                .collect(),
        })
    }

    /// Returns the slot of `allocation` to its pool.
    ///
    /// # Panics
    ///
    /// - Panics if `allocation` wasn't acquired from `self`.
    pub fn release(&self, allocation: PoolAllocation<B::Pool>) {
        assert_eq!(
            allocation.allocator, self.id,
            "the allocation was not acquired from this allocator",
        );

        let mut pools = self.pools.lock();
        let pool = &mut pools[allocation.pool_index];
        let mask = 1 << allocation.slot;

        // Allocations can't be cloned, so each slot is released at most once.
        debug_assert!(
            pool.bitmap & mask != 0,
            "slot {} of descriptor pool {} is already free",
            allocation.slot,
            allocation.pool_index,
        );

        pool.bitmap &= !mask;
    }

    /// Returns the number of pools that have been created so far.
    pub fn pool_count(&self) -> usize {
        self.pools.lock().len()
    }
}

impl<B: DescriptorPoolBackend + fmt::Debug> fmt::Debug for DescriptorPoolAllocator<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pools = self.pools.lock();

        f.debug_struct("DescriptorPoolAllocator")
            .field("backend", &self.backend)
            .field("heaps", &self.heaps)
            .field(
                "used_slots",
                &pools
                    .iter()
                    .map(|pool| pool.bitmap.count_ones())
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct AllocatorId(NonZeroU64);

impl AllocatorId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);

        AllocatorId(
            NonZeroU64::new(COUNTER.fetch_add(1, Ordering::Relaxed)).unwrap_or_else(|| {
                eprintln!("the descriptor pool allocator ID counter has overflown ...somehow");
                std::process::abort();
            }),
        )
    }
}

/// Storage for one binding table, acquired from a [`DescriptorPoolAllocator`].
///
/// A `PoolAllocation` must be handed back with [`DescriptorPoolAllocator::release`], which
/// consumes it. Dropping it leaks the slot until the allocator is dropped.
#[derive(Debug)]
pub struct PoolAllocation<P> {
    allocator: AllocatorId,
    pool: P,
    pool_index: usize,
    slot: u32,
    heap_offsets: SmallVec<[u32; 2]>,
}

impl<P> PoolAllocation<P> {
    /// Returns the pool that the binding table lives in.
    #[inline]
    pub fn pool(&self) -> &P {
        &self.pool
    }

    /// Returns the slot of the pool that the binding table occupies.
    #[inline]
    pub fn slot(&self) -> u32 {
        self.slot
    }

    /// Returns the offset of the first descriptor of the binding table in each heap of the pool,
    /// in the order of [`MergedLayout::heaps`].
    #[inline]
    pub fn heap_offsets(&self) -> &[u32] {
        &self.heap_offsets
    }
}
