use super::align_up;
use crate::{DeviceSize, NonZeroDeviceSize};
use std::{
    cmp::Ordering,
    fmt::{Debug, Formatter, Result as FmtResult},
};

/// Size and alignment of a block of device memory, analogous to std's
/// [`Layout`](std::alloc::Layout).
///
/// A `DeviceLayout` always has a non-zero size and a power-of-two alignment. Zero-sized or
/// misaligned requests are therefore rejected when the layout is built, before they ever reach an
/// allocator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DeviceLayout {
    size: NonZeroDeviceSize,
    alignment: DeviceAlignment,
}

impl DeviceLayout {
    /// The maximum size of a memory block after its layout's size has been rounded up to the
    /// nearest multiple of its layout's alignment.
    pub const MAX_SIZE: DeviceSize = DeviceAlignment::MAX.as_devicesize() - 1;

    /// Creates a new `DeviceLayout` from the given `size` and `alignment`.
    ///
    /// Returns [`None`] if `size` is zero, `alignment` is not a power of two, or if `size` would
    /// exceed [`DeviceLayout::MAX_SIZE`] when rounded up to the nearest multiple of `alignment`.
    #[inline]
    pub const fn from_size_alignment(size: DeviceSize, alignment: DeviceSize) -> Option<Self> {
        if let (Some(size), Some(alignment)) = (
            NonZeroDeviceSize::new(size),
            DeviceAlignment::new(alignment),
        ) {
            DeviceLayout::new(size, alignment)
        } else {
            None
        }
    }

    /// Creates a new `DeviceLayout` from the given `size` and `alignment`.
    ///
    /// Returns [`None`] if `size` would exceed [`DeviceLayout::MAX_SIZE`] when rounded up to the
    /// nearest multiple of `alignment`.
    #[inline]
    pub const fn new(size: NonZeroDeviceSize, alignment: DeviceAlignment) -> Option<Self> {
        // `MAX_SIZE` is `DeviceAlignment::MAX - 1`, so this can't underflow.
        if size.get() > Self::MAX_SIZE - (alignment.as_devicesize() - 1) {
            None
        } else {
            Some(DeviceLayout { size, alignment })
        }
    }

    /// Returns the size in bytes of a memory block of this layout.
    #[inline]
    pub const fn size(&self) -> DeviceSize {
        self.size.get()
    }

    /// Returns the minimum alignment for a memory block of this layout.
    #[inline]
    pub const fn alignment(&self) -> DeviceAlignment {
        self.alignment
    }

    /// Returns the amount of padding that needs to be added to `offset` such that the result is
    /// aligned to `self.alignment()`.
    #[inline]
    pub const fn padding_needed_at(&self, offset: DeviceSize) -> DeviceSize {
        align_up(offset, self.alignment).wrapping_sub(offset)
    }
}

/// A [`DeviceSize`] that is guaranteed to be a power of two.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct DeviceAlignment(NonZeroDeviceSize);

impl DeviceAlignment {
    /// The smallest possible alignment, 1.
    pub const MIN: Self = Self(NonZeroDeviceSize::MIN);

    /// The largest possible alignment, 2<sup>63</sup>.
    pub const MAX: Self = match NonZeroDeviceSize::new(1 << 63) {
        Some(alignment) => Self(alignment),
        None => unreachable!(),
    };

    /// Tries to create a `DeviceAlignment` from a [`DeviceSize`], returning [`None`] if it's not a
    /// power of two.
    #[inline]
    pub const fn new(alignment: DeviceSize) -> Option<Self> {
        if alignment.is_power_of_two() {
            match NonZeroDeviceSize::new(alignment) {
                Some(alignment) => Some(Self(alignment)),
                None => None,
            }
        } else {
            None
        }
    }

    /// Returns the alignment as a [`DeviceSize`].
    #[inline]
    pub const fn as_devicesize(self) -> DeviceSize {
        self.0.get()
    }

    /// Returns the base-2 logarithm of the alignment.
    #[inline]
    pub const fn log2(self) -> u32 {
        self.0.trailing_zeros()
    }
}

impl Debug for DeviceAlignment {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{:?} (1 << {:?})", self.0, self.log2())
    }
}

impl Default for DeviceAlignment {
    #[inline]
    fn default() -> Self {
        DeviceAlignment::MIN
    }
}

impl PartialOrd for DeviceAlignment {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DeviceAlignment {
    #[inline]
    fn cmp(&self, other: &Self) -> Ordering {
        self.as_devicesize().cmp(&other.as_devicesize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_invalid_layouts() {
        assert!(DeviceLayout::from_size_alignment(0, 1).is_none());
        assert!(DeviceLayout::from_size_alignment(16, 0).is_none());
        assert!(DeviceLayout::from_size_alignment(16, 3).is_none());
        assert!(DeviceLayout::from_size_alignment(DeviceLayout::MAX_SIZE, 2).is_none());

        let layout = DeviceLayout::from_size_alignment(16, 256).unwrap();
        assert_eq!(layout.size(), 16);
        assert_eq!(layout.alignment().as_devicesize(), 256);
        assert_eq!(layout.alignment().log2(), 8);
    }

    #[test]
    fn padding() {
        let layout = DeviceLayout::from_size_alignment(1, 64).unwrap();
        assert_eq!(layout.padding_needed_at(0), 0);
        assert_eq!(layout.padding_needed_at(1), 63);
        assert_eq!(layout.padding_needed_at(64), 0);
        assert_eq!(layout.padding_needed_at(100), 28);
    }
}
