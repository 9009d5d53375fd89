//! Device memory allocation.
//!
//! Creating a dedicated block of device memory for every buffer and image is slow, and drivers
//! limit the number of live memory objects. The [`SubAllocator`] therefore reserves large *pages*
//! of device memory through a [`MemoryProvider`] and suballocates buffers and images out of them.
//!
//! The provider is the backend glue (Vulkan, DirectX 12, Metal): it knows how to reserve and
//! release raw device memory and nothing else. All bookkeeping happens on the host, inside the
//! allocator.
//!
//! [`SubAllocator`]: allocator::SubAllocator

pub use self::layout::{DeviceAlignment, DeviceLayout};
use crate::DeviceSize;
use std::sync::Arc;

pub mod allocator;
mod layout;

/// Reserves and releases raw blocks of device memory on behalf of a
/// [`SubAllocator`](allocator::SubAllocator).
pub trait MemoryProvider: Send + Sync {
    /// Opaque handle to a block of device memory.
    type DeviceMemory: Clone + Send;

    /// Reserves `size` bytes of memory of the given memory type.
    ///
    /// Returns [`None`] if the device refuses the request. This is treated as an ordinary
    /// out-of-memory condition by the caller.
    fn allocate(&self, size: DeviceSize, memory_type_index: u32) -> Option<Self::DeviceMemory>;

    /// Releases a block of memory previously returned by [`allocate`](Self::allocate).
    ///
    /// # Safety
    ///
    /// - `memory` must have been returned by `self.allocate` with the same `size`.
    /// - `memory` must not be in use by the device anymore.
    /// - `memory` must not be freed twice.
    unsafe fn free(&self, memory: Self::DeviceMemory, size: DeviceSize, heap_index: u32);
}

impl<P: MemoryProvider + ?Sized> MemoryProvider for Arc<P> {
    type DeviceMemory = P::DeviceMemory;

    #[inline]
    fn allocate(&self, size: DeviceSize, memory_type_index: u32) -> Option<Self::DeviceMemory> {
        (**self).allocate(size, memory_type_index)
    }

    #[inline]
    unsafe fn free(&self, memory: Self::DeviceMemory, size: DeviceSize, heap_index: u32) {
        unsafe { (**self).free(memory, size, heap_index) }
    }
}

/// Describes where an allocation must live.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct MemoryClass {
    /// The memory heap the allocation is taken from. Pages are only shared between requests with
    /// the same heap.
    pub heap_index: u32,

    /// The memory type that is passed to [`MemoryProvider::allocate`] when a new page is needed.
    pub memory_type_index: u32,

    /// Whether the memory can be mapped for access from the host.
    pub host_visible: bool,
}

/// Rounds `val` up to the nearest multiple of `alignment`.
#[inline(always)]
pub(crate) const fn align_up(val: DeviceSize, alignment: DeviceAlignment) -> DeviceSize {
    align_down(val.wrapping_add(alignment.as_devicesize() - 1), alignment)
}

/// Rounds `val` down to the nearest multiple of `alignment`.
#[inline(always)]
pub(crate) const fn align_down(val: DeviceSize, alignment: DeviceAlignment) -> DeviceSize {
    val & !(alignment.as_devicesize() - 1)
}
