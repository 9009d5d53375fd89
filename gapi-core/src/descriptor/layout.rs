//! Merging of per-stage binding lists into one pipeline layout.

use super::{Binding, DescriptorHeapType, DescriptorRangeType, ResourceClass, ShaderStages};
use foldhash::HashMap;
use smallvec::SmallVec;
use std::{
    collections::{btree_map::Entry, BTreeMap},
    error::Error,
    fmt,
    ops::Range,
};

/// The maximum size of a push-constant block, in bytes.
pub const MAX_PUSH_CONSTANT_SIZE: u32 = 256;

/// Merges the binding lists of the shader stages of one pipeline.
///
/// A slot that is declared by several stages becomes one binding that is visible to all of them.
/// Push constants of all stages are combined into one block, which is as large as the largest
/// declaration.
///
/// The result only depends on the set of bindings that are declared, not on the order of the
/// lists or of the bindings within them, so it can be used as a cache key.
///
/// # Errors
///
/// - Returns [`MergeError::ConflictingBinding`] if two stages declare the same slot with
///   different resource classes.
/// - Returns [`MergeError::PushConstantTooLarge`] if a push-constant block exceeds
///   [`MAX_PUSH_CONSTANT_SIZE`].
pub fn merge(stages: &[&[Binding]]) -> Result<MergedLayout, MergeError> {
    let mut bindings: BTreeMap<u32, Binding> = BTreeMap::new();
    let mut push_constant: Option<(u32, ShaderStages)> = None;

    for &binding in stages.iter().flat_map(|list| list.iter()) {
        if binding.stages.is_empty() {
            continue;
        }

        if binding.class == ResourceClass::PushConstant {
            let (size, stages) = push_constant.get_or_insert((0, ShaderStages::empty()));
            *size = (*size).max(binding.size);
            *stages |= binding.stages;

            continue;
        }

        match bindings.entry(binding.slot) {
            Entry::Vacant(entry) => {
                entry.insert(binding);
            }
            Entry::Occupied(mut entry) => {
                let existing = entry.get_mut();

                if existing.class != binding.class {
                    return Err(MergeError::ConflictingBinding {
                        slot: binding.slot,
                        first: existing.class,
                        second: binding.class,
                    });
                }

                existing.stages |= binding.stages;
                existing.size = existing.size.max(binding.size);
            }
        }
    }

    let push_constant = match push_constant {
        Some((size, stages)) if size > 0 => {
            if size > MAX_PUSH_CONSTANT_SIZE {
                return Err(MergeError::PushConstantTooLarge { size });
            }

            // The first register that no uniform buffer occupies.
            let register = (0..)
                .find(|slot| {
                    bindings
                        .get(slot)
                        .is_none_or(|binding| binding.class != ResourceClass::Uniform)
                })
                .unwrap_or(0);
            let size = size.next_multiple_of(4);

            Some(PushConstantBlock {
                stages,
                size,
                register,
            })
        }
        _ => None,
    };

    let mut ranges: Vec<DescriptorRange> = bindings
        .values()
        .flat_map(|binding| {
            binding
                .class
                .range_types()
                .iter()
                .map(|&range_type| DescriptorRange {
                    slot: binding.slot,
                    range_type,
                    stages: binding.stages,
                })
        })
        .collect();

    // Stable, so that ranges of the same group stay sorted by slot.
    ranges.sort_by_key(|range| (range.stages, range.range_type));

    let mut heaps: SmallVec<[DescriptorHeap; 2]> = SmallVec::new();
    let mut root_parameters: Vec<RootParameter> = Vec::new();
    let mut locations: BTreeMap<u32, SlotLocation> = BTreeMap::new();

    for (index, range) in ranges.iter().enumerate() {
        let heap_type = range.range_type.heap_type();
        let heap = match heaps.iter().position(|heap| heap.heap_type == heap_type) {
            Some(heap) => heap,
            None => {
                heaps.push(DescriptorHeap {
                    heap_type,
                    descriptor_count: 0,
                });
                heaps.len() - 1
            }
        };

        let same_group = root_parameters.last().is_some_and(|param| {
            param.stages == range.stages && param.range_type == range.range_type
        });

        if !same_group {
            root_parameters.push(RootParameter {
                stages: range.stages,
                range_type: range.range_type,
                ranges: index..index,
                heap,
                heap_offset: heaps[heap].descriptor_count,
            });
        }

        if let Some(param) = root_parameters.last_mut() {
            param.ranges.end += 1;
        }

        let location = HeapLocation {
            heap,
            offset: heaps[heap].descriptor_count,
        };
        heaps[heap].descriptor_count += 1;

        let slot = locations.entry(range.slot).or_default();

        if range.range_type == DescriptorRangeType::Sampler {
            slot.sampler = Some(location);
        } else {
            slot.resource = Some(location);
        }
    }

    Ok(MergedLayout {
        bindings: bindings.into_values().collect(),
        ranges,
        root_parameters,
        heaps,
        locations,
        push_constant,
    })
}

/// The binding layout of a whole pipeline, produced by [`merge`].
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MergedLayout {
    bindings: Vec<Binding>,
    ranges: Vec<DescriptorRange>,
    root_parameters: Vec<RootParameter>,
    heaps: SmallVec<[DescriptorHeap; 2]>,
    locations: BTreeMap<u32, SlotLocation>,
    push_constant: Option<PushConstantBlock>,
}

impl MergedLayout {
    /// Returns the merged bindings, sorted by slot. Push constants are not included.
    #[inline]
    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }

    /// Returns the descriptor ranges of the binding table, sorted by visibility and then by
    /// range type.
    #[inline]
    pub fn ranges(&self) -> &[DescriptorRange] {
        &self.ranges
    }

    /// Returns the groups of consecutive ranges that share both visibility and range type.
    #[inline]
    pub fn root_parameters(&self) -> &[RootParameter] {
        &self.root_parameters
    }

    /// Returns the descriptor heaps that a binding table of this layout needs, in the order in
    /// which they are first used.
    #[inline]
    pub fn heaps(&self) -> &[DescriptorHeap] {
        &self.heaps
    }

    /// Returns where the descriptors of `slot` are stored.
    #[inline]
    pub fn location(&self, slot: u32) -> Option<&SlotLocation> {
        self.locations.get(&slot)
    }

    /// Returns the merged push-constant block, if any stage declares one.
    #[inline]
    pub fn push_constant(&self) -> Option<&PushConstantBlock> {
        self.push_constant.as_ref()
    }

    /// Returns the number of descriptors of each type.
    ///
    /// The map is guaranteed to not contain any elements with a count of `0`.
    pub fn descriptor_counts(&self) -> HashMap<DescriptorRangeType, u32> {
        let mut descriptor_counts = HashMap::default();

        for range in &self.ranges {
            *descriptor_counts.entry(range.range_type).or_default() += 1;
        }

        descriptor_counts
    }
}

/// One descriptor of the binding table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DescriptorRange {
    pub slot: u32,
    pub range_type: DescriptorRangeType,
    pub stages: ShaderStages,
}

/// A group of consecutive [`DescriptorRange`]s with the same visibility and range type, which
/// the backend binds as one descriptor table.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RootParameter {
    pub stages: ShaderStages,
    pub range_type: DescriptorRangeType,

    /// The indices of the grouped ranges in [`MergedLayout::ranges`].
    pub ranges: Range<usize>,

    /// The index of the heap in [`MergedLayout::heaps`] that the descriptors are stored in.
    pub heap: usize,

    /// The offset, in descriptors, of the first descriptor of the group within one binding table.
    pub heap_offset: u32,
}

/// The number of descriptors of one heap that a single binding table needs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DescriptorHeap {
    pub heap_type: DescriptorHeapType,
    pub descriptor_count: u32,
}

/// Where the descriptors of a slot live within one binding table.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct SlotLocation {
    pub resource: Option<HeapLocation>,
    pub sampler: Option<HeapLocation>,
}

/// A descriptor's heap index and offset, in descriptors, within one binding table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HeapLocation {
    pub heap: usize,
    pub offset: u32,
}

/// The push constants of all stages of a pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PushConstantBlock {
    /// The stages that access the push constants.
    pub stages: ShaderStages,

    /// Size in bytes of the block. Always a multiple of 4.
    pub size: u32,

    /// The shader register that the block is bound to on backends that pass push constants as
    /// root constants: the first slot that is not taken by a uniform buffer.
    pub register: u32,
}

impl PushConstantBlock {
    /// Returns the number of 32-bit values in the block.
    #[inline]
    pub fn num_32bit_values(&self) -> u32 {
        self.size / 4
    }
}

/// Error that can happen when merging binding lists.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MergeError {
    /// Two stages declare the same slot with different resource classes.
    ConflictingBinding {
        slot: u32,
        first: ResourceClass,
        second: ResourceClass,
    },

    /// A push-constant block is larger than [`MAX_PUSH_CONSTANT_SIZE`].
    PushConstantTooLarge { size: u32 },
}

impl Error for MergeError {}

impl fmt::Display for MergeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConflictingBinding {
                slot,
                first,
                second,
            } => write!(
                f,
                "slot {} is declared as {:?} in one stage and as {:?} in another",
                slot, first, second,
            ),
            Self::PushConstantTooLarge { size } => write!(
                f,
                "a push-constant block of {} bytes exceeds the maximum of {} bytes",
                size, MAX_PUSH_CONSTANT_SIZE,
            ),
        }
    }
}
