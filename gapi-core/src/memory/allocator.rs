//! Suballocation of device memory pages.
//!
//! A [`SubAllocator`] owns a collection of *pages*, each of which is a single block of device
//! memory obtained from a [`MemoryProvider`]. Every page keeps a list of its free regions, sorted
//! by offset. Allocated regions are not represented at all; the caller holds them in the form of
//! an [`Allocation`].
//!
//! # Allocation
//!
//! A request is served by the first page, in creation order, that lives in the requested memory
//! heap, has enough bytes left and contains a free region that fits the request once its offset
//! is aligned. When no page qualifies, a new page of [`page_size`] bytes (or of the request size,
//! if that is larger) is obtained from the provider. [`allocate_dedicated`] always creates a new
//! page that is exactly as large as the request.
//!
//! Alignment padding in front of an allocation is kept as a free region of its own, so that it
//! can be merged back once its neighbour is freed.
//!
//! # Freeing
//!
//! A freed region is merged with the free regions directly before and after it. As soon as the
//! last allocation of a page is freed, the page is released back to the provider.
//!
//! [`page_size`]: SubAllocatorCreateInfo::page_size
//! [`allocate_dedicated`]: SubAllocator::allocate_dedicated

use self::host::{PoolAllocator, SlotId};
use super::{DeviceLayout, MemoryClass, MemoryProvider};
use crate::{DeviceSize, NonExhaustive, OomError};
use parking_lot::Mutex;
use std::{
    cmp,
    error::Error,
    fmt::{self, Display},
    num::NonZeroU64,
    sync::atomic::{AtomicU64, Ordering},
};

/// The size of the pages that are created when no dedicated allocation was requested.
pub const DEFAULT_PAGE_SIZE: DeviceSize = 128 * 1024 * 1024;

/// Suballocates [`Allocation`]s out of large pages of device memory.
///
/// The allocate and free paths of one allocator are serialized by a single mutex. They are
/// meant to be called when buffers and images are created or destroyed, not once per frame.
pub struct SubAllocator<P: MemoryProvider> {
    provider: P,
    page_size: DeviceSize,
    state: Mutex<State<P::DeviceMemory>>,
}

#[derive(Debug)]
struct State<M> {
    pages: Vec<Page<M>>,
}

impl<P: MemoryProvider> SubAllocator<P> {
    /// Creates a new `SubAllocator` that reserves its pages through `provider`.
    ///
    /// # Panics
    ///
    /// - Panics if `create_info.page_size` is zero.
    pub fn new(provider: P, create_info: SubAllocatorCreateInfo) -> Self {
        let SubAllocatorCreateInfo {
            page_size,
            _ne: _,
        } = create_info;

        assert!(page_size != 0, "the page size must not be zero");

        SubAllocator {
            provider,
            page_size,
            state: Mutex::new(State { pages: Vec::new() }),
        }
    }

    /// Returns the provider that the pages are reserved from.
    #[inline]
    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Returns the size of the pages that are shared between allocations.
    #[inline]
    pub fn page_size(&self) -> DeviceSize {
        self.page_size
    }

    /// Allocates `layout.size()` bytes in the memory described by `class`, aligned to
    /// `layout.alignment()`.
    ///
    /// Existing pages are shared by all requests with the same `class.heap_index`. The
    /// `memory_type_index` and `host_visible` of `class` only take effect when a new page is
    /// created, so [`Allocation::host_visible`] reports the page the allocation landed in, which
    /// can differ from the request. Callers that mix memory types within one heap should give
    /// them separate allocators.
    ///
    /// # Errors
    ///
    /// - Returns [`OutOfDeviceMemory`] if a new page was needed and the provider refused it.
    /// - Returns [`OutOfHostMemory`] if the bookkeeping for a new page could not be allocated. The
    ///   page is returned to the provider in that case.
    ///
    /// [`OutOfDeviceMemory`]: AllocationCreationError::OutOfDeviceMemory
    /// [`OutOfHostMemory`]: AllocationCreationError::OutOfHostMemory
    pub fn allocate(
        &self,
        layout: DeviceLayout,
        class: MemoryClass,
    ) -> Result<Allocation<P::DeviceMemory>, AllocationCreationError> {
        let size = layout.size();
        let mut state = self.state.lock();

        for page in &mut state.pages {
            if page.heap_index != class.heap_index || page.allocated + size > page.size {
                continue;
            }

            if let Some(offset) = page.allocate(layout) {
                log::trace!(
                    "allocated {size} bytes at offset {offset} of page {:?}",
                    page.id,
                );

                return Ok(page.allocation(offset, size));
            }
        }

        self.allocate_page(&mut *state, layout, class, cmp::max(self.page_size, size))
    }

    /// Allocates a new page that is exactly `layout.size()` bytes large and returns the whole page
    /// as an allocation.
    ///
    /// This is meant for resources that are larger than the page size, or that must not share
    /// their memory with other resources.
    ///
    /// # Errors
    ///
    /// The same as for [`allocate`](Self::allocate).
    pub fn allocate_dedicated(
        &self,
        layout: DeviceLayout,
        class: MemoryClass,
    ) -> Result<Allocation<P::DeviceMemory>, AllocationCreationError> {
        let mut state = self.state.lock();

        self.allocate_page(&mut *state, layout, class, layout.size())
    }

    fn allocate_page(
        &self,
        state: &mut State<P::DeviceMemory>,
        layout: DeviceLayout,
        class: MemoryClass,
        page_size: DeviceSize,
    ) -> Result<Allocation<P::DeviceMemory>, AllocationCreationError> {
        let Some(memory) = self.provider.allocate(page_size, class.memory_type_index) else {
            log::warn!(
                "the provider refused a page of {page_size} bytes of memory type {}",
                class.memory_type_index,
            );

            return Err(AllocationCreationError::OutOfDeviceMemory);
        };

        let id = PageId::next();
        let page = if state.pages.try_reserve(1).is_ok() {
            Page::new(id, memory.clone(), class, page_size)
        } else {
            None
        };

        // Nothing refers to the memory yet, so it can be handed back as is.
        let Some(mut page) = page else {
            unsafe { self.provider.free(memory, page_size, class.heap_index) };

            return Err(AllocationCreationError::OutOfHostMemory);
        };

        // A fresh page starts with a single free region at offset zero, which is aligned to
        // anything and at least as large as the request.
        let size = layout.size();
        let Some(offset) = page.allocate(layout) else {
            unsafe { self.provider.free(memory, page_size, class.heap_index) };

            return Err(AllocationCreationError::OutOfHostMemory);
        };

        log::debug!(
            "created page {id:?} of {page_size} bytes in heap {} ({} pages)",
            class.heap_index,
            state.pages.len() + 1,
        );

        let allocation = page.allocation(offset, size);
        state.pages.push(page);

        Ok(allocation)
    }

    /// Returns `allocation` to the page it was taken from.
    ///
    /// If this was the last allocation of the page, the page is released back to the provider.
    ///
    /// # Safety
    ///
    /// - The memory of `allocation` must not be in use by the device anymore.
    ///
    /// # Panics
    ///
    /// - Panics if `allocation` was not allocated by `self`.
    pub unsafe fn free(&self, allocation: Allocation<P::DeviceMemory>) {
        let mut state = self.state.lock();

        let Some(index) = state.pages.iter().position(|page| page.id == allocation.page) else {
            panic!(
                "the allocation belongs to page {:?}, which is not owned by this allocator",
                allocation.page,
            );
        };

        let page = &mut state.pages[index];
        page.free(allocation.offset, allocation.size);

        log::trace!(
            "freed {} bytes at offset {} of page {:?}",
            allocation.size,
            allocation.offset,
            allocation.page,
        );

        // TODO: keep a recently emptied page around for a while, so that a workload that keeps
        // crossing a page boundary doesn't reserve and release the same page over and over.
        if page.allocated == 0 {
            let page = state.pages.remove(index);

            log::debug!(
                "releasing page {:?} of {} bytes in heap {} ({} pages left)",
                page.id,
                page.size,
                page.heap_index,
                state.pages.len(),
            );

            unsafe { self.provider.free(page.memory, page.size, page.heap_index) };
        }
    }

    /// Returns the number of pages that are currently reserved.
    pub fn page_count(&self) -> usize {
        self.state.lock().pages.len()
    }

    /// Returns a snapshot of the pages that are currently reserved, in creation order.
    pub fn pages(&self) -> Vec<PageInfo> {
        self.state.lock().pages.iter().map(Page::info).collect()
    }

    /// Returns the total number of free bytes over all pages.
    ///
    /// Not all of these bytes may be usable for a given request, because of fragmentation and
    /// alignment.
    pub fn free_size(&self) -> DeviceSize {
        self.state
            .lock()
            .pages
            .iter()
            .map(|page| page.size - page.allocated)
            .sum()
    }
}

impl<P: MemoryProvider + fmt::Debug> fmt::Debug for SubAllocator<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubAllocator")
            .field("provider", &self.provider)
            .field("page_size", &self.page_size)
            .field("pages", &self.pages())
            .finish()
    }
}

impl<P: MemoryProvider> Drop for SubAllocator<P> {
    fn drop(&mut self) {
        for page in self.state.get_mut().pages.drain(..) {
            if page.allocated != 0 {
                log::warn!(
                    "page {:?} is released with {} bytes still allocated",
                    page.id,
                    page.allocated,
                );
            }

            unsafe { self.provider.free(page.memory, page.size, page.heap_index) };
        }
    }
}

/// Parameters to create a new [`SubAllocator`].
#[derive(Clone, Debug)]
pub struct SubAllocatorCreateInfo {
    /// The size of the pages that are shared between allocations. Larger requests get a page of
    /// their own size.
    ///
    /// The default value is [`DEFAULT_PAGE_SIZE`].
    pub page_size: DeviceSize,

    pub _ne: NonExhaustive,
}

impl Default for SubAllocatorCreateInfo {
    #[inline]
    fn default() -> Self {
        SubAllocatorCreateInfo {
            page_size: DEFAULT_PAGE_SIZE,
            _ne: NonExhaustive(()),
        }
    }
}

/// Identifies a page of a [`SubAllocator`]. Page IDs are unique for the lifetime of the process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageId(NonZeroU64);

impl PageId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);

        PageId(
            NonZeroU64::new(COUNTER.fetch_add(1, Ordering::Relaxed)).unwrap_or_else(|| {
                eprintln!("the page ID counter has overflown ...somehow");
                std::process::abort();
            }),
        )
    }
}

/// A range of bytes inside a page of a [`SubAllocator`].
///
/// An `Allocation` is not a resource by itself: dropping it leaks the range until the allocator
/// is dropped. It must be handed back with [`SubAllocator::free`], which consumes it.
#[derive(Debug, PartialEq, Eq)]
pub struct Allocation<M> {
    page: PageId,
    memory: M,
    offset: DeviceSize,
    size: DeviceSize,
    host_visible: bool,
}

impl<M> Allocation<M> {
    /// Returns the page that the allocation was taken from.
    #[inline]
    pub fn page(&self) -> PageId {
        self.page
    }

    /// Returns the device memory of the page that the allocation was taken from.
    #[inline]
    pub fn memory(&self) -> &M {
        &self.memory
    }

    /// Returns the offset of the allocation within its page.
    #[inline]
    pub fn offset(&self) -> DeviceSize {
        self.offset
    }

    /// Returns the size of the allocation in bytes.
    #[inline]
    pub fn size(&self) -> DeviceSize {
        self.size
    }

    /// Returns whether the memory can be mapped for access from the host.
    #[inline]
    pub fn host_visible(&self) -> bool {
        self.host_visible
    }
}

/// A snapshot of the state of one page of a [`SubAllocator`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PageInfo {
    pub id: PageId,
    pub heap_index: u32,
    pub host_visible: bool,
    /// The size of the page in bytes.
    pub size: DeviceSize,
    /// The sum of the sizes of the live allocations. Alignment padding is not included.
    pub allocated: DeviceSize,
    /// The free regions of the page as `(offset, size)` pairs, sorted by offset.
    pub free_regions: Vec<(DeviceSize, DeviceSize)>,
}

#[derive(Debug)]
struct Page<M> {
    id: PageId,
    memory: M,
    heap_index: u32,
    host_visible: bool,
    size: DeviceSize,
    allocated: DeviceSize,
    blocks: PoolAllocator<Block>,
    // Head of the free list, sorted by offset. Blocks are never empty.
    head: Option<SlotId>,
}

/// A free region of a page.
#[derive(Clone, Copy, Debug)]
struct Block {
    offset: DeviceSize,
    size: DeviceSize,
    next: Option<SlotId>,
}

impl Block {
    #[inline]
    fn end(&self) -> DeviceSize {
        self.offset + self.size
    }
}

impl<M: Clone> Page<M> {
    /// Returns `None` if the host is out of memory.
    fn new(id: PageId, memory: M, class: MemoryClass, size: DeviceSize) -> Option<Self> {
        let mut blocks = PoolAllocator::try_with_capacity(16)?;
        let head = blocks.try_allocate(Block {
            offset: 0,
            size,
            next: None,
        })?;

        Some(Page {
            id,
            memory,
            heap_index: class.heap_index,
            host_visible: class.host_visible,
            size,
            allocated: 0,
            blocks,
            head: Some(head),
        })
    }

    fn allocation(&self, offset: DeviceSize, size: DeviceSize) -> Allocation<M> {
        Allocation {
            page: self.id,
            memory: self.memory.clone(),
            offset,
            size,
            host_visible: self.host_visible,
        }
    }
}

impl<M> Page<M> {
    /// Finds the first free region that fits `layout` and returns the offset of the allocation.
    fn allocate(&mut self, layout: DeviceLayout) -> Option<DeviceSize> {
        let size = layout.size();
        let mut prev = None;
        let mut cursor = self.head;

        while let Some(id) = cursor {
            let block = *self.blocks.get(id);

            if size <= block.size {
                let padding = layout.padding_needed_at(block.offset);

                if padding == 0 {
                    return Some(self.take_front(prev, id, size));
                }

                if size + padding == block.size {
                    // Only the padding remains free.
                    self.blocks.get_mut(id).size = padding;
                    self.allocated += size;

                    return Some(block.offset + padding);
                }

                if size + padding < block.size {
                    let rest = Block {
                        offset: block.offset + padding,
                        size: block.size - padding,
                        next: block.next,
                    };

                    if let Some(rest_id) = self.blocks.try_allocate(rest) {
                        let block = self.blocks.get_mut(id);
                        block.size = padding;
                        block.next = Some(rest_id);

                        return Some(self.take_front(Some(id), rest_id, size));
                    }

                    log::warn!("out of host memory while splitting a free region of {:?}", self.id);
                }
            }

            prev = cursor;
            cursor = block.next;
        }

        None
    }

    /// Allocates `size` bytes from the front of the block `id`, unlinking the block if that
    /// consumes it.
    fn take_front(&mut self, prev: Option<SlotId>, id: SlotId, size: DeviceSize) -> DeviceSize {
        let block = self.blocks.get_mut(id);
        let offset = block.offset;
        block.offset += size;
        block.size -= size;
        self.allocated += size;

        if block.size == 0 {
            let next = block.next;
            self.link(prev, next);
            self.blocks.free(id);
        }

        offset
    }

    fn free(&mut self, offset: DeviceSize, size: DeviceSize) {
        assert!(
            size <= self.allocated && offset + size <= self.size,
            "the allocation at offset {offset} of {:?} was already freed",
            self.id,
        );

        self.allocated -= size;
        let end = offset + size;

        let mut prev = None;
        let mut cursor = self.head;

        while let Some(id) = cursor {
            let block = self.blocks.get(id);

            if block.offset >= end {
                break;
            }

            assert!(
                block.end() <= offset,
                "the allocation at offset {offset} of {:?} was already freed",
                self.id,
            );

            prev = cursor;
            cursor = block.next;
        }

        if let Some(prev_id) = prev {
            let block = self.blocks.get_mut(prev_id);

            if block.end() == offset {
                block.size += size;
                self.merge_with_next(prev_id);

                return;
            }
        }

        if let Some(next_id) = cursor {
            let block = self.blocks.get_mut(next_id);

            if block.offset == end {
                block.offset = offset;
                block.size += size;

                return;
            }
        }

        let block = Block {
            offset,
            size,
            next: cursor,
        };

        match self.blocks.try_allocate(block) {
            Some(id) => self.link(prev, Some(id)),
            None => log::warn!(
                "out of host memory while freeing {size} bytes at offset {offset} of {:?}, the \
                range stays unusable until the page is released",
                self.id,
            ),
        }
    }

    /// Absorbs the blocks following `id` for as long as they are contiguous with it.
    fn merge_with_next(&mut self, id: SlotId) {
        loop {
            let block = *self.blocks.get(id);
            let Some(next_id) = block.next else {
                return;
            };
            let next = *self.blocks.get(next_id);

            if block.end() != next.offset {
                return;
            }

            let block = self.blocks.get_mut(id);
            block.size += next.size;
            block.next = next.next;
            self.blocks.free(next_id);
        }
    }

    fn link(&mut self, prev: Option<SlotId>, next: Option<SlotId>) {
        match prev {
            Some(prev_id) => self.blocks.get_mut(prev_id).next = next,
            None => self.head = next,
        }
    }

    fn info(&self) -> PageInfo {
        let mut free_regions = Vec::new();
        let mut cursor = self.head;

        while let Some(id) = cursor {
            let block = self.blocks.get(id);
            free_regions.push((block.offset, block.size));
            cursor = block.next;
        }

        PageInfo {
            id: self.id,
            heap_index: self.heap_index,
            host_visible: self.host_visible,
            size: self.size,
            allocated: self.allocated,
            free_regions,
        }
    }
}

/// Error that can be returned when allocating from a [`SubAllocator`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocationCreationError {
    /// There is not enough memory on the host.
    OutOfHostMemory,

    /// There is not enough memory on the device.
    OutOfDeviceMemory,
}

impl Error for AllocationCreationError {}

impl Display for AllocationCreationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::OutOfHostMemory => "out of host memory",
            Self::OutOfDeviceMemory => "out of device memory",
        })
    }
}

impl From<OomError> for AllocationCreationError {
    #[inline]
    fn from(err: OomError) -> Self {
        match err {
            OomError::OutOfHostMemory => Self::OutOfHostMemory,
            OomError::OutOfDeviceMemory => Self::OutOfDeviceMemory,
        }
    }
}

mod host {
    use std::num::NonZeroUsize;

    /// Stores the blocks of a free list in one vector and hands out IDs relative to it.
    ///
    /// Freed slots are kept in a LIFO list and reused before the vector grows. Growing is
    /// fallible, so that running out of host memory while splitting or freeing a region can be
    /// handled instead of aborting.
    #[derive(Debug)]
    pub(super) struct PoolAllocator<T> {
        pool: Vec<T>,
        free_list: Vec<SlotId>,
    }

    impl<T> PoolAllocator<T> {
        pub fn try_with_capacity(capacity: usize) -> Option<Self> {
            let mut pool = Vec::new();
            let mut free_list = Vec::new();
            pool.try_reserve_exact(capacity).ok()?;
            free_list.try_reserve_exact(capacity).ok()?;

            Some(PoolAllocator { pool, free_list })
        }

        /// Stores `val` in a free slot and returns the ID of the slot, or returns `None` if the
        /// pool is full and can't grow.
        pub fn try_allocate(&mut self, val: T) -> Option<SlotId> {
            #[cfg(test)]
            if fail_injected() {
                return None;
            }

            if let Some(id) = self.free_list.pop() {
                self.pool[id.index()] = val;

                return Some(id);
            }

            // Reserve room in the free list as well, so that freeing never has to allocate.
            self.pool.try_reserve(1).ok()?;
            self.free_list
                .try_reserve(self.pool.capacity() - self.free_list.len())
                .ok()?;
            self.pool.push(val);

            NonZeroUsize::new(self.pool.len()).map(SlotId)
        }

        /// Returns the slot with the given ID to the pool. The ID must not be used afterward.
        pub fn free(&mut self, id: SlotId) {
            debug_assert!(!self.free_list.contains(&id));

            self.free_list.push(id);
        }

        pub fn get(&self, id: SlotId) -> &T {
            debug_assert!(!self.free_list.contains(&id));

            &self.pool[id.index()]
        }

        pub fn get_mut(&mut self, id: SlotId) -> &mut T {
            debug_assert!(!self.free_list.contains(&id));

            &mut self.pool[id.index()]
        }
    }

    #[cfg(test)]
    thread_local! {
        /// The number of upcoming `try_allocate` calls on this thread that act as if the host
        /// were out of memory.
        pub(super) static INJECTED_FAILURES: std::cell::Cell<u32> = const {
            std::cell::Cell::new(0)
        };
    }

    #[cfg(test)]
    fn fail_injected() -> bool {
        INJECTED_FAILURES.with(|failures| {
            let remaining = failures.get();
            failures.set(remaining.saturating_sub(1));

            remaining != 0
        })
    }

    /// ID of a slot in a [`PoolAllocator`], one-based so that `Option<SlotId>` stays the size of a
    /// `usize`.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub(super) struct SlotId(NonZeroUsize);

    impl SlotId {
        #[inline]
        fn index(self) -> usize {
            self.0.get() - 1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_queue::ArrayQueue;
    use std::{sync::Arc, thread};

    const MIB: DeviceSize = 1024 * 1024;

    const fn unwrap<T: Copy>(opt: Option<T>) -> T {
        match opt {
            Some(x) => x,
            None => panic!(),
        }
    }

    const DEVICE_LOCAL: MemoryClass = MemoryClass {
        heap_index: 0,
        memory_type_index: 0,
        host_visible: false,
    };

    const HOST_VISIBLE: MemoryClass = MemoryClass {
        heap_index: 1,
        memory_type_index: 2,
        host_visible: true,
    };

    /// Hands out increasing IDs as memory and keeps track of what is live.
    #[derive(Default)]
    struct TestProvider {
        next_id: AtomicU64,
        budget: Option<DeviceSize>,
        live: Mutex<Vec<(u64, DeviceSize, u32)>>,
        freed: Mutex<Vec<(u64, DeviceSize, u32)>>,
    }

    impl TestProvider {
        fn with_budget(budget: DeviceSize) -> Self {
            TestProvider {
                budget: Some(budget),
                ..Default::default()
            }
        }

        fn allocations(&self) -> u64 {
            self.next_id.load(Ordering::Relaxed)
        }
    }

    impl MemoryProvider for TestProvider {
        type DeviceMemory = u64;

        fn allocate(&self, size: DeviceSize, memory_type_index: u32) -> Option<u64> {
            let mut live = self.live.lock();
            let used = live.iter().map(|&(_, size, _)| size).sum::<DeviceSize>();

            if self.budget.is_some_and(|budget| used + size > budget) {
                return None;
            }

            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            live.push((id, size, memory_type_index));

            Some(id)
        }

        unsafe fn free(&self, memory: u64, size: DeviceSize, heap_index: u32) {
            let mut live = self.live.lock();
            let index = live.iter().position(|&(id, _, _)| id == memory).unwrap();
            let (_, live_size, _) = live.remove(index);
            assert_eq!(live_size, size);
            self.freed.lock().push((memory, size, heap_index));
        }
    }

    fn check_page_invariants(allocator: &SubAllocator<TestProvider>, live: &[Allocation<u64>]) {
        for page in allocator.pages() {
            let mut ranges = live
                .iter()
                .filter(|alloc| alloc.page() == page.id)
                .map(|alloc| (alloc.offset(), alloc.size()))
                .collect::<Vec<_>>();

            let sum = ranges.iter().map(|&(_, size)| size).sum::<DeviceSize>();
            assert_eq!(sum, page.allocated);
            assert!(page.allocated <= page.size);

            // Allocations and free regions must not overlap each other.
            ranges.extend(page.free_regions.iter().copied());
            ranges.sort_unstable();

            for pair in ranges.windows(2) {
                assert!(pair[0].0 + pair[0].1 <= pair[1].0, "{:?} overlaps", pair);
            }

            if let Some(&(offset, size)) = ranges.last() {
                assert!(offset + size <= page.size);
            }
        }
    }

    #[test]
    fn reuses_freed_block() {
        const LAYOUT_64: DeviceLayout = unwrap(DeviceLayout::from_size_alignment(64 * MIB, 256));
        const LAYOUT_32: DeviceLayout = unwrap(DeviceLayout::from_size_alignment(32 * MIB, 256));
        const LAYOUT_48: DeviceLayout = unwrap(DeviceLayout::from_size_alignment(48 * MIB, 256));

        let allocator = SubAllocator::new(TestProvider::default(), Default::default());
        assert_eq!(allocator.page_size(), DEFAULT_PAGE_SIZE);

        let a = allocator.allocate(LAYOUT_64, DEVICE_LOCAL).unwrap();
        let b = allocator.allocate(LAYOUT_32, DEVICE_LOCAL).unwrap();
        assert_eq!(a.page(), b.page());
        assert_eq!(allocator.pages()[0].allocated, 96 * MIB);
        assert_eq!(allocator.pages()[0].size, 128 * MIB);

        unsafe { allocator.free(a) };
        let c = allocator.allocate(LAYOUT_48, DEVICE_LOCAL).unwrap();

        assert_eq!(allocator.page_count(), 1);
        assert_eq!(allocator.provider().allocations(), 1);
        assert_eq!(c.page(), b.page());
        assert_eq!(c.offset(), 0);
        assert_eq!(c.offset() % 256, 0);

        check_page_invariants(&allocator, &[b, c]);
    }

    #[test]
    fn merges_adjacent_blocks() {
        let allocator = SubAllocator::new(
            TestProvider::default(),
            SubAllocatorCreateInfo {
                page_size: 1024,
                ..Default::default()
            },
        );
        let layout = |size| DeviceLayout::from_size_alignment(size, 1).unwrap();

        let a = allocator.allocate(layout(256), DEVICE_LOCAL).unwrap();
        let b = allocator.allocate(layout(256), DEVICE_LOCAL).unwrap();
        let c = allocator.allocate(layout(256), DEVICE_LOCAL).unwrap();
        let d = allocator.allocate(layout(256), DEVICE_LOCAL).unwrap();
        assert_eq!(allocator.free_size(), 0);

        // Free out of order so that both the left and the right merge are exercised.
        unsafe { allocator.free(c) };
        unsafe { allocator.free(a) };
        unsafe { allocator.free(b) };
        assert_eq!(allocator.pages()[0].free_regions, [(0, 768)]);

        let e = allocator.allocate(layout(768), DEVICE_LOCAL).unwrap();
        assert_eq!(e.offset(), 0);
        assert_eq!(allocator.page_count(), 1);
        assert_eq!(allocator.provider().allocations(), 1);

        check_page_invariants(&allocator, &[d, e]);
    }

    #[test]
    fn padding_cases() {
        let allocator = SubAllocator::new(
            TestProvider::default(),
            SubAllocatorCreateInfo {
                page_size: 1024,
                ..Default::default()
            },
        );
        let layout = |size, alignment| DeviceLayout::from_size_alignment(size, alignment).unwrap();

        let a = allocator.allocate(layout(100, 1), DEVICE_LOCAL).unwrap();
        assert_eq!(a.offset(), 0);

        // The padding exactly fills the front of the free region.
        let b = allocator.allocate(layout(896, 128), DEVICE_LOCAL).unwrap();
        assert_eq!(b.offset(), 128);
        assert_eq!(allocator.pages()[0].free_regions, [(100, 28)]);
        assert_eq!(allocator.pages()[0].allocated, 996);

        unsafe { allocator.free(b) };
        assert_eq!(allocator.pages()[0].free_regions, [(100, 924)]);

        // The region is split into the padding and the rest.
        let c = allocator.allocate(layout(64, 64), DEVICE_LOCAL).unwrap();
        assert_eq!(c.offset(), 128);
        assert_eq!(
            allocator.pages()[0].free_regions,
            [(100, 28), (192, 832)],
        );

        // The padding is still usable.
        let d = allocator.allocate(layout(28, 4), DEVICE_LOCAL).unwrap();
        assert_eq!(d.offset(), 100);

        check_page_invariants(&allocator, &[a, c, d]);
    }

    #[test]
    fn round_trip_releases_page() {
        const LAYOUT: DeviceLayout = unwrap(DeviceLayout::from_size_alignment(4096, 256));

        let allocator = SubAllocator::new(TestProvider::default(), Default::default());

        let a = allocator.allocate(LAYOUT, DEVICE_LOCAL).unwrap();
        let free_size = allocator.free_size();
        let regions = allocator.pages()[0].free_regions.clone();

        let b = allocator.allocate(LAYOUT, DEVICE_LOCAL).unwrap();
        unsafe { allocator.free(b) };

        assert_eq!(allocator.free_size(), free_size);
        assert_eq!(allocator.pages()[0].free_regions, regions);

        unsafe { allocator.free(a) };
        assert_eq!(allocator.page_count(), 0);
        assert!(allocator.provider().live.lock().is_empty());
        assert_eq!(*allocator.provider().freed.lock(), [(0, DEFAULT_PAGE_SIZE, 0)]);
    }

    #[test]
    fn separates_heaps() {
        const LAYOUT: DeviceLayout = unwrap(DeviceLayout::from_size_alignment(1024, 16));

        let allocator = SubAllocator::new(TestProvider::default(), Default::default());

        let a = allocator.allocate(LAYOUT, DEVICE_LOCAL).unwrap();
        let b = allocator.allocate(LAYOUT, HOST_VISIBLE).unwrap();

        assert_ne!(a.page(), b.page());
        assert!(!a.host_visible());
        assert!(b.host_visible());
        assert_eq!(allocator.provider().live.lock()[1].2, 2);

        unsafe { allocator.free(b) };
        assert_eq!(*allocator.provider().freed.lock(), [(1, DEFAULT_PAGE_SIZE, 1)]);
        unsafe { allocator.free(a) };
    }

    #[test]
    fn large_and_dedicated_pages() {
        let allocator = SubAllocator::new(
            TestProvider::default(),
            SubAllocatorCreateInfo {
                page_size: 1024,
                ..Default::default()
            },
        );
        let layout = |size| DeviceLayout::from_size_alignment(size, 1).unwrap();

        let small = allocator.allocate(layout(16), DEVICE_LOCAL).unwrap();
        let large = allocator.allocate(layout(4096), DEVICE_LOCAL).unwrap();
        let dedicated = allocator.allocate_dedicated(layout(16), DEVICE_LOCAL).unwrap();

        let pages = allocator.pages();
        assert_eq!(pages.len(), 3);
        assert_eq!(pages[1].size, 4096);
        assert_eq!(pages[2].size, 16);
        assert!(pages[2].free_regions.is_empty());
        assert_ne!(dedicated.page(), small.page());

        // A dedicated page is never shared.
        let other = allocator.allocate(layout(16), DEVICE_LOCAL).unwrap();
        assert_eq!(other.page(), small.page());

        unsafe { allocator.free(dedicated) };
        unsafe { allocator.free(large) };
        assert_eq!(allocator.page_count(), 1);

        check_page_invariants(&allocator, &[small, other]);
    }

    #[test]
    fn provider_failure() {
        let allocator = SubAllocator::new(
            TestProvider::with_budget(2048),
            SubAllocatorCreateInfo {
                page_size: 1024,
                ..Default::default()
            },
        );
        let layout = |size| DeviceLayout::from_size_alignment(size, 1).unwrap();

        let a = allocator.allocate(layout(1024), DEVICE_LOCAL).unwrap();
        assert_eq!(
            allocator.allocate(layout(2048), DEVICE_LOCAL),
            Err(AllocationCreationError::OutOfDeviceMemory),
        );
        assert_eq!(allocator.page_count(), 1);

        // The allocator is still usable after the failure.
        let b = allocator.allocate(layout(512), DEVICE_LOCAL).unwrap();
        assert_ne!(a.page(), b.page());

        check_page_invariants(&allocator, &[a, b]);
    }

    #[test]
    fn pages_are_shared_per_heap() {
        const LAYOUT: DeviceLayout = unwrap(DeviceLayout::from_size_alignment(16, 1));
        const MAPPABLE: MemoryClass = MemoryClass {
            memory_type_index: 1,
            host_visible: true,
            ..DEVICE_LOCAL
        };

        let allocator = SubAllocator::new(TestProvider::default(), Default::default());

        let a = allocator.allocate(LAYOUT, DEVICE_LOCAL).unwrap();
        let b = allocator.allocate(LAYOUT, MAPPABLE).unwrap();

        // Only the heap decides which page is used.
        assert_eq!(a.page(), b.page());
        assert!(!b.host_visible());
        assert_eq!(allocator.provider().allocations(), 1);

        check_page_invariants(&allocator, &[a, b]);
    }

    #[test]
    fn host_oom_returns_page() {
        const LAYOUT: DeviceLayout = unwrap(DeviceLayout::from_size_alignment(16, 1));

        let allocator = SubAllocator::new(TestProvider::default(), Default::default());

        host::INJECTED_FAILURES.with(|failures| failures.set(1));
        assert_eq!(
            allocator.allocate(LAYOUT, DEVICE_LOCAL),
            Err(AllocationCreationError::OutOfHostMemory),
        );

        // The page was reserved and then handed back.
        assert_eq!(allocator.provider().allocations(), 1);
        assert!(allocator.provider().live.lock().is_empty());
        assert_eq!(allocator.provider().freed.lock().len(), 1);
        assert_eq!(allocator.page_count(), 0);

        let a = allocator.allocate(LAYOUT, DEVICE_LOCAL).unwrap();
        check_page_invariants(&allocator, &[a]);
    }

    #[test]
    fn failed_split_moves_on() {
        let allocator = SubAllocator::new(
            TestProvider::default(),
            SubAllocatorCreateInfo {
                page_size: 1024,
                ..Default::default()
            },
        );

        let a = allocator
            .allocate(DeviceLayout::from_size_alignment(100, 1).unwrap(), DEVICE_LOCAL)
            .unwrap();

        // Serving this from the first page needs its free region to be split, which fails.
        host::INJECTED_FAILURES.with(|failures| failures.set(1));
        let b = allocator
            .allocate(DeviceLayout::from_size_alignment(64, 64).unwrap(), DEVICE_LOCAL)
            .unwrap();

        assert_eq!(allocator.page_count(), 2);
        assert_ne!(a.page(), b.page());
        assert_eq!(b.offset(), 0);

        let pages = allocator.pages();
        assert_eq!(pages[0].free_regions, [(100, 924)]);
        assert_eq!(pages[0].allocated, 100);

        check_page_invariants(&allocator, &[a, b]);
    }

    #[test]
    #[should_panic(expected = "not owned by this allocator")]
    fn free_to_wrong_allocator() {
        const LAYOUT: DeviceLayout = unwrap(DeviceLayout::from_size_alignment(16, 1));

        let first = SubAllocator::new(TestProvider::default(), Default::default());
        let second = SubAllocator::new(TestProvider::default(), Default::default());

        let _a = first.allocate(LAYOUT, DEVICE_LOCAL).unwrap();
        let b = second.allocate(LAYOUT, DEVICE_LOCAL).unwrap();
        unsafe { first.free(b) };
    }

    #[test]
    fn drop_releases_pages() {
        const LAYOUT: DeviceLayout = unwrap(DeviceLayout::from_size_alignment(16, 1));

        let provider = Arc::new(TestProvider::default());
        let allocator = SubAllocator::new(provider.clone(), Default::default());
        let _a = allocator.allocate(LAYOUT, DEVICE_LOCAL).unwrap();
        let _b = allocator.allocate(LAYOUT, HOST_VISIBLE).unwrap();
        assert_eq!(provider.live.lock().len(), 2);

        drop(allocator);

        assert!(provider.live.lock().is_empty());
        assert_eq!(provider.freed.lock().len(), 2);
    }

    #[test]
    fn random_sequence_invariants() {
        let allocator = SubAllocator::new(
            TestProvider::default(),
            SubAllocatorCreateInfo {
                page_size: 64 * 1024,
                ..Default::default()
            },
        );
        let mut live: Vec<Allocation<u64>> = Vec::new();
        let mut seed = 0x9e37_79b9_7f4a_7c15u64;
        let mut next = move || {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            seed
        };

        for step in 0..2000 {
            if live.is_empty() || next() % 3 != 0 {
                let size = next() % 8192 + 1;
                let alignment = 1 << (next() % 9);
                let layout = DeviceLayout::from_size_alignment(size, alignment).unwrap();
                let alloc = allocator.allocate(layout, DEVICE_LOCAL).unwrap();
                assert_eq!(alloc.offset() % alignment, 0);
                live.push(alloc);
            } else {
                let index = (next() % live.len() as u64) as usize;
                unsafe { allocator.free(live.swap_remove(index)) };
            }

            if step % 50 == 0 {
                check_page_invariants(&allocator, &live);
            }
        }

        check_page_invariants(&allocator, &live);

        for alloc in live {
            unsafe { allocator.free(alloc) };
        }

        assert_eq!(allocator.page_count(), 0);
        assert!(allocator.provider().live.lock().is_empty());
    }

    #[test]
    fn concurrent_allocations() {
        const THREADS: DeviceSize = 8;
        const ALLOCATIONS_PER_THREAD: DeviceSize = 100;
        const ALLOCATION_STEP: DeviceSize = 117;

        let allocator = SubAllocator::new(
            TestProvider::default(),
            SubAllocatorCreateInfo {
                page_size: 64 * 1024,
                ..Default::default()
            },
        );
        let allocs = ArrayQueue::new((ALLOCATIONS_PER_THREAD * THREADS) as usize);

        // Using threads to randomize allocation order.
        thread::scope(|scope| {
            for i in 1..=THREADS {
                let (allocator, allocs) = (&allocator, &allocs);

                scope.spawn(move || {
                    let layout =
                        DeviceLayout::from_size_alignment(i * ALLOCATION_STEP, 16).unwrap();

                    for _ in 0..ALLOCATIONS_PER_THREAD {
                        allocs
                            .push(allocator.allocate(layout, DEVICE_LOCAL).unwrap())
                            .unwrap();
                    }
                });
            }
        });

        let allocs = allocs.into_iter().collect::<Vec<_>>();
        check_page_invariants(&allocator, &allocs);

        let total = allocs.iter().map(Allocation::size).sum::<DeviceSize>();
        assert_eq!(
            allocator.pages().iter().map(|page| page.allocated).sum::<DeviceSize>(),
            total,
        );

        let mut allocs = allocs;

        thread::scope(|scope| {
            while !allocs.is_empty() {
                let at = allocs.len().saturating_sub(ALLOCATIONS_PER_THREAD as usize);
                let chunk = allocs.split_off(at);
                let allocator = &allocator;

                scope.spawn(move || {
                    for alloc in chunk {
                        unsafe { allocator.free(alloc) };
                    }
                });
            }
        });

        assert_eq!(allocator.page_count(), 0);
    }
}
