//! Resource-binding and device-memory core of a multi-backend GPU abstraction layer.
//!
//! # Brief summary
//!
//! - The [`SubAllocator`](crate::memory::allocator::SubAllocator) carves buffer and image
//!   allocations out of large device-memory pages that it requests from a
//!   [`MemoryProvider`](crate::memory::MemoryProvider). Pages are returned to the provider as soon
//!   as their last allocation is freed.
//!
//! - [`merge`](crate::descriptor::layout::merge) unifies the binding lists reflected from each
//!   shader stage of a pipeline into one [`MergedLayout`](crate::descriptor::layout::MergedLayout):
//!   an ordered binding table, descriptor ranges grouped by visibility, descriptor heap sizes and
//!   the push-constant block.
//!
//! - A [`DescriptorPoolAllocator`](crate::descriptor::pool::DescriptorPoolAllocator) hands out
//!   binding-table slots of pools sized after a merged layout, and grows by whole pools.
//!
//! - The [`LayoutTracker`](crate::sync::tracker::LayoutTracker) records the layout every resource
//!   needs for the next batch of work inside one command stream and emits the minimal set of
//!   barriers when the recording reaches a flush point.
//!
//! The allocators are meant to be shared between recording threads behind an `Arc`. The tracker
//! belongs to exactly one recording context.

use std::{error::Error, fmt};

pub mod descriptor;
mod linear_map;
mod macros;
pub mod memory;
pub mod sync;

/// Represents memory size and offset values on a device.
/// Analogous to the Rust `usize` type on the host.
pub use ash::vk::DeviceSize;

/// A [`DeviceSize`] that is known not to equal zero.
pub type NonZeroDeviceSize = std::num::NonZeroU64;

/// Error type returned when a backend runs out of memory while creating an object.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OomError {
    /// There is no memory available on the host (ie. the CPU, RAM, etc.).
    OutOfHostMemory,
    /// There is no memory available on the device (ie. video memory).
    OutOfDeviceMemory,
}

impl Error for OomError {}

impl fmt::Display for OomError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        f.write_str(match self {
            OomError::OutOfHostMemory => "no memory available on the host",
            OomError::OutOfDeviceMemory => "no memory available on the graphical device",
        })
    }
}

/// A helper type for non-exhaustive structs.
///
/// This type cannot be constructed outside this crate. Structures with a field of this type can
/// only be constructed by calling a constructor function or `Default::default()`. The effect is
/// similar to the standard Rust `#[non_exhaustive]` attribute, except that it does not prevent
/// update syntax from being used.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NonExhaustive(pub(crate) ());
