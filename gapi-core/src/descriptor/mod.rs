//! Shader resource bindings and the storage they are written to.
//!
//! Shader reflection produces one list of [`Binding`]s per shader stage. Before a pipeline can be
//! created, these lists are merged into a single [`MergedLayout`], which describes the binding
//! table of the whole pipeline and how its descriptors are laid out in descriptor heaps.
//!
//! Binding tables are then allocated from a [`DescriptorPoolAllocator`] that is created from the
//! merged layout. It hands out one slot of pool storage per binding table and grows by creating
//! additional pools.
//!
//! [`MergedLayout`]: layout::MergedLayout
//! [`DescriptorPoolAllocator`]: pool::DescriptorPoolAllocator

use crate::macros::vulkan_bitflags;

pub mod layout;
pub mod pool;

vulkan_bitflags! {
    /// A set of shader stages.
    ShaderStages = ShaderStageFlags(u32);

    /// The vertex stage.
    VERTEX = VERTEX,

    /// The tessellation control stage.
    TESSELLATION_CONTROL = TESSELLATION_CONTROL,

    /// The tessellation evaluation stage.
    TESSELLATION_EVALUATION = TESSELLATION_EVALUATION,

    /// The geometry stage.
    GEOMETRY = GEOMETRY,

    /// The fragment stage.
    FRAGMENT = FRAGMENT,

    /// The compute stage.
    COMPUTE = COMPUTE,

    /// The task stage of a mesh shading pipeline.
    TASK = TASK_EXT,

    /// The mesh stage of a mesh shading pipeline.
    MESH = MESH_EXT,
}

impl ShaderStages {
    /// All the stages of a graphics pipeline.
    pub const ALL_GRAPHICS: Self = Self::VERTEX
        .union(Self::TESSELLATION_CONTROL)
        .union(Self::TESSELLATION_EVALUATION)
        .union(Self::GEOMETRY)
        .union(Self::FRAGMENT)
        .union(Self::TASK)
        .union(Self::MESH);
}

/// The kind of resource that a shader declares at a binding slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceClass {
    /// A uniform buffer.
    Uniform,

    /// A storage buffer that is only read.
    StorageRead,

    /// A storage buffer that is read and written.
    StorageReadWrite,

    /// A storage image that is only read.
    ImageRead,

    /// A storage image that is read and written.
    ImageReadWrite,

    /// A sampled image combined with its sampler.
    CombinedTextureSampler,

    /// A block of push constants. The slot of a push-constant binding is ignored.
    PushConstant,
}

impl ResourceClass {
    /// Returns the descriptor ranges that a binding of this class occupies, in order.
    ///
    /// A combined texture and sampler needs a descriptor in both the resource and the sampler
    /// heap. Push constants don't occupy any descriptor.
    #[inline]
    pub fn range_types(self) -> &'static [DescriptorRangeType] {
        match self {
            ResourceClass::Uniform => &[DescriptorRangeType::UniformBuffer],
            ResourceClass::StorageRead | ResourceClass::ImageRead => {
                &[DescriptorRangeType::ShaderResource]
            }
            ResourceClass::StorageReadWrite | ResourceClass::ImageReadWrite => {
                &[DescriptorRangeType::UnorderedAccess]
            }
            ResourceClass::CombinedTextureSampler => &[
                DescriptorRangeType::ShaderResource,
                DescriptorRangeType::Sampler,
            ],
            ResourceClass::PushConstant => &[],
        }
    }
}

/// A resource that a shader stage declares, as produced by shader reflection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Binding {
    /// The binding slot, shared by all stages of a pipeline.
    pub slot: u32,

    /// The kind of resource at the slot.
    pub class: ResourceClass,

    /// The stages that access the resource.
    ///
    /// Bindings with no stages are unused and are skipped when merging.
    pub stages: ShaderStages,

    /// The size in bytes of the resource, if known. Only push constants make use of it.
    pub size: u32,
}

impl Binding {
    /// Creates a `Binding` of a resource with no known size.
    #[inline]
    pub const fn new(slot: u32, class: ResourceClass, stages: ShaderStages) -> Self {
        Binding {
            slot,
            class,
            stages,
            size: 0,
        }
    }

    /// Creates a `Binding` of a push-constant block of `size` bytes.
    #[inline]
    pub const fn push_constant(size: u32, stages: ShaderStages) -> Self {
        Binding {
            slot: 0,
            class: ResourceClass::PushConstant,
            stages,
            size,
        }
    }
}

/// The kind of a contiguous range of descriptors in a binding table.
///
/// The order of the variants is the order in which ranges with the same visibility are laid out.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DescriptorRangeType {
    /// Read-only storage buffers and images, and the image half of combined samplers.
    ShaderResource,

    /// Read-write storage buffers and images.
    UnorderedAccess,

    /// Uniform buffers.
    UniformBuffer,

    /// The sampler half of combined samplers.
    Sampler,
}

impl DescriptorRangeType {
    /// Returns the heap that descriptors of this type are stored in.
    #[inline]
    pub fn heap_type(self) -> DescriptorHeapType {
        match self {
            DescriptorRangeType::Sampler => DescriptorHeapType::Sampler,
            _ => DescriptorHeapType::Resource,
        }
    }
}

/// A kind of descriptor heap.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DescriptorHeapType {
    /// Stores buffer and image descriptors.
    Resource,

    /// Stores sampler descriptors.
    Sampler,
}
