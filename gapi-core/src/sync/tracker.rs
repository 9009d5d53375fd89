//! Tracking of resource layouts inside one command stream.
//!
//! While commands are recorded, every use of a buffer or image announces the layout that the
//! resource must be in through [`LayoutTracker::set_layout`]. Nothing is emitted at that point.
//! When recording reaches a flush point (before a render pass begins, before a dispatch and at
//! the end of recording) [`LayoutTracker::flush`] compares the requested layouts with the ones the
//! resources are in and emits every necessary barrier in a single batch.
//!
//! The tracker doesn't carry any state from one command stream to the next. A resource that was
//! left in a known layout by a previous stream must be announced with [`LayoutTracker::import`],
//! and [`LayoutTracker::finalize`] puts it back into that layout at the end of recording.

use super::{AccessFlags, ImageLayout, PipelineStages};
use crate::linear_map::LinearMap;
use std::{error::Error, fmt, ops::Range};

macro_rules! resource_layouts {
    (
        $(
            $(#[$meta:meta])*
            $name:ident {
                stage_mask: [$($stage_flag:ident),*],
                access_mask: [$($access_flag:ident),*],
                image_layout: $image_layout:ident,
                valid_for: $($valid_for:ident)|+,
            }
        )*
    ) => {
        /// The way a resource is used by the commands that follow a flush point.
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        pub enum ResourceLayout {
            $(
                $(#[$meta])*
                $name,
            )*
        }

        impl ResourceLayout {
            /// Returns the pipeline stages that access an image in this layout.
            #[inline]
            #[must_use]
            pub const fn stage_mask(self) -> PipelineStages {
                match self {
                    $(
                        Self::$name => PipelineStages::empty()
                            $(.union(PipelineStages::$stage_flag))*,
                    )*
                }
            }

            /// Returns the memory accesses that are made to an image in this layout.
            #[inline]
            #[must_use]
            pub const fn access_mask(self) -> AccessFlags {
                match self {
                    $(
                        Self::$name => AccessFlags::empty()
                            $(.union(AccessFlags::$access_flag))*,
                    )*
                }
            }

            /// Returns the image layout that an image in this layout is transitioned to.
            #[inline]
            #[must_use]
            pub const fn image_layout(self) -> ImageLayout {
                match self {
                    $(
                        Self::$name => ImageLayout::$image_layout,
                    )*
                }
            }

            const fn valid_for(self) -> u8 {
                match self {
                    $(
                        Self::$name => $($valid_for)|+,
                    )*
                }
            }
        }
    };
}

const BUFFER: u8 = 1 << 0;
const IMAGE: u8 = 1 << 1;

resource_layouts! {
    /// The contents of the resource are unknown.
    Undefined {
        stage_mask: [TOP_OF_PIPE],
        access_mask: [],
        image_layout: UNDEFINED,
        valid_for: BUFFER | IMAGE,
    }

    /// The image is sampled from shaders.
    Sampler {
        stage_mask: [VERTEX_SHADER, FRAGMENT_SHADER, COMPUTE_SHADER],
        access_mask: [SHADER_READ],
        image_layout: SHADER_READ_ONLY_OPTIMAL,
        valid_for: IMAGE,
    }

    /// The image is a color attachment of a render pass.
    ColorAttach {
        stage_mask: [COLOR_ATTACHMENT_OUTPUT],
        access_mask: [COLOR_ATTACHMENT_READ, COLOR_ATTACHMENT_WRITE],
        image_layout: COLOR_ATTACHMENT_OPTIMAL,
        valid_for: IMAGE,
    }

    /// The image is the depth/stencil attachment of a render pass.
    DepthAttach {
        stage_mask: [EARLY_FRAGMENT_TESTS, LATE_FRAGMENT_TESTS],
        access_mask: [DEPTH_STENCIL_ATTACHMENT_READ, DEPTH_STENCIL_ATTACHMENT_WRITE],
        image_layout: DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        valid_for: IMAGE,
    }

    /// The image is the source of a transfer command.
    TransferSrc {
        stage_mask: [TRANSFER],
        access_mask: [TRANSFER_READ],
        image_layout: TRANSFER_SRC_OPTIMAL,
        valid_for: IMAGE,
    }

    /// The image is the destination of a transfer command.
    TransferDest {
        stage_mask: [TRANSFER],
        access_mask: [TRANSFER_WRITE],
        image_layout: TRANSFER_DST_OPTIMAL,
        valid_for: IMAGE,
    }

    /// The resource is read by compute shaders.
    ComputeRead {
        stage_mask: [COMPUTE_SHADER],
        access_mask: [MEMORY_READ, MEMORY_WRITE],
        image_layout: GENERAL,
        valid_for: BUFFER | IMAGE,
    }

    /// The resource is written by compute shaders.
    ComputeWrite {
        stage_mask: [COMPUTE_SHADER],
        access_mask: [MEMORY_READ, MEMORY_WRITE],
        image_layout: GENERAL,
        valid_for: BUFFER | IMAGE,
    }

    /// The resource is read and written by compute shaders.
    ComputeReadWrite {
        stage_mask: [COMPUTE_SHADER],
        access_mask: [MEMORY_READ, MEMORY_WRITE],
        image_layout: GENERAL,
        valid_for: BUFFER | IMAGE,
    }

    /// The image is handed to the presentation engine.
    Present {
        stage_mask: [COLOR_ATTACHMENT_OUTPUT],
        access_mask: [COLOR_ATTACHMENT_READ],
        image_layout: PRESENT_SRC_KHR,
        valid_for: IMAGE,
    }
}

impl ResourceLayout {
    /// Returns whether a resource of the given kind can be put in this layout.
    #[inline]
    pub const fn is_valid_for(self, resource: ResourceId) -> bool {
        let kind = if resource.is_buffer() { BUFFER } else { IMAGE };

        self.valid_for() & kind != 0
    }

    /// Returns the shader accesses that are made to a buffer in this layout.
    #[inline]
    pub const fn buffer_access(self) -> AccessFlags {
        match self {
            ResourceLayout::ComputeRead => AccessFlags::SHADER_READ,
            ResourceLayout::ComputeWrite => AccessFlags::SHADER_WRITE,
            ResourceLayout::ComputeReadWrite => {
                AccessFlags::SHADER_READ.union(AccessFlags::SHADER_WRITE)
            }
            _ => AccessFlags::empty(),
        }
    }

    /// Returns whether compute shaders write to a resource in this layout.
    #[inline]
    pub const fn is_compute_write(self) -> bool {
        matches!(
            self,
            ResourceLayout::ComputeWrite | ResourceLayout::ComputeReadWrite,
        )
    }
}

/// Identifies a resource inside a command stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceId {
    /// An image, identified by its backend handle.
    Image(u64),

    /// One of the images of a swapchain.
    SwapchainImage { swapchain: u64, image_index: u32 },

    /// A buffer, identified by its backend handle.
    Buffer(u64),
}

impl ResourceId {
    /// Returns whether the resource is a buffer.
    #[inline]
    pub const fn is_buffer(self) -> bool {
        matches!(self, ResourceId::Buffer(_))
    }
}

/// A transition of one resource, emitted by [`LayoutTracker::flush`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceBarrier {
    /// The resource that is transitioned.
    pub resource: ResourceId,

    /// The layout the resource was in.
    pub prev_layout: ResourceLayout,

    /// The layout the resource is transitioned to.
    pub next_layout: ResourceLayout,

    pub src_stages: PipelineStages,

    pub src_access: AccessFlags,

    pub dst_stages: PipelineStages,

    pub dst_access: AccessFlags,

    /// The image layout the image was in. This is [`ImageLayout::UNDEFINED`] when `discard` is
    /// set, and for buffers.
    pub old_image_layout: ImageLayout,

    /// The image layout the image is transitioned to. This is [`ImageLayout::UNDEFINED`] for
    /// buffers.
    pub new_image_layout: ImageLayout,

    /// Whether the previous contents of the resource may be thrown away.
    pub discard: bool,

    /// The mip levels that are transitioned.
    pub mip_levels: Range<u32>,
}

/// Receives the barriers of a [`LayoutTracker`], usually to record them in a command buffer.
pub trait BarrierSink {
    /// Records all of `barriers` as one pipeline barrier. `barriers` is never empty.
    fn pipeline_barrier(&mut self, barriers: &[ResourceBarrier]);
}

impl<S: BarrierSink + ?Sized> BarrierSink for &mut S {
    #[inline]
    fn pipeline_barrier(&mut self, barriers: &[ResourceBarrier]) {
        (**self).pipeline_barrier(barriers);
    }
}

/// Records the layouts resources need inside one command stream and emits the barriers between
/// them.
///
/// The tracker is owned by the recording context of one command stream and can't be shared
/// between threads while recording.
#[derive(Debug, Default)]
pub struct LayoutTracker {
    states: LinearMap<ResourceId, ResourceState>,
    barriers: Vec<ResourceBarrier>,
}

#[derive(Clone, Copy, Debug)]
struct ResourceState {
    current: ResourceLayout,
    pending: ResourceLayout,
    preserve: bool,
    // The layout the resource entered the command stream with, if it was imported.
    imported: Option<ResourceLayout>,
}

impl ResourceState {
    const fn new(layout: ResourceLayout) -> Self {
        ResourceState {
            current: layout,
            pending: layout,
            preserve: true,
            imported: None,
        }
    }
}

impl LayoutTracker {
    /// Creates a tracker that doesn't know about any resource.
    #[inline]
    pub fn new() -> Self {
        LayoutTracker::default()
    }

    /// Forgets about every resource, ready for a new command stream.
    pub fn begin(&mut self) {
        self.states.clear();
        self.barriers.clear();
    }

    /// Declares that `resource` enters the command stream in `layout`.
    ///
    /// # Panics
    ///
    /// - Panics if `resource` has already been used in the command stream.
    pub fn import(
        &mut self,
        resource: ResourceId,
        layout: ResourceLayout,
    ) -> Result<(), LayoutTransitionError> {
        assert!(
            !self.states.contains_key(&resource),
            "{resource:?} was imported after it was first used",
        );

        if !layout.is_valid_for(resource) {
            return Err(LayoutTransitionError::UnsupportedBufferLayout { resource, layout });
        }

        self.states.get_or_insert_with(resource, || ResourceState {
            imported: Some(layout),
            ..ResourceState::new(layout)
        });

        Ok(())
    }

    /// Requests that `resource` is in `layout` after the next flush.
    ///
    /// If `preserve` is `false`, the previous contents of the resource are allowed to be thrown
    /// away by the transition. A later call for the same resource before the flush replaces the
    /// request.
    pub fn set_layout(
        &mut self,
        resource: ResourceId,
        layout: ResourceLayout,
        preserve: bool,
    ) -> Result<(), LayoutTransitionError> {
        if resource.is_buffer() {
            if !layout.is_valid_for(resource) {
                return Err(LayoutTransitionError::UnsupportedBufferLayout { resource, layout });
            }
        } else if layout == ResourceLayout::Undefined {
            return Err(LayoutTransitionError::UndefinedTarget { resource });
        }

        let state = self
            .states
            .get_or_insert_with(resource, || ResourceState::new(ResourceLayout::Undefined));
        state.pending = layout;
        state.preserve = preserve;

        Ok(())
    }

    /// Returns the layout that `resource` is in as of the last flush, or [`None`] if the resource
    /// hasn't been used in the command stream.
    #[inline]
    pub fn current_layout(&self, resource: ResourceId) -> Option<ResourceLayout> {
        self.states.get(&resource).map(|state| state.current)
    }

    /// Emits the barriers for every resource whose requested layout differs from its current one,
    /// as a single call to `sink`. Nothing is emitted if no resource needs a barrier.
    pub fn flush(&mut self, mut sink: impl BarrierSink) {
        self.barriers.clear();

        for (&resource, state) in self.states.iter_mut() {
            if state.pending == state.current {
                continue;
            }

            let barrier = if resource.is_buffer() {
                buffer_barrier(resource, state)
            } else {
                Some(image_barrier(resource, state))
            };

            self.barriers.extend(barrier);
            state.current = state.pending;
        }

        if !self.barriers.is_empty() {
            log::trace!("flushing {} resource barriers", self.barriers.len());
            sink.pipeline_barrier(&self.barriers);
        }
    }

    /// Transitions every imported resource back to the layout it was imported with, and flushes.
    ///
    /// This must be called at the end of recording.
    pub fn finalize(&mut self, sink: impl BarrierSink) {
        for (_, state) in self.states.iter_mut() {
            match state.imported {
                Some(layout) if layout != ResourceLayout::Undefined => {
                    state.pending = layout;
                    state.preserve = true;
                }
                _ => {}
            }
        }

        self.flush(sink);
    }
}

fn image_barrier(resource: ResourceId, state: &ResourceState) -> ResourceBarrier {
    let prev = state.current;
    let next = state.pending;
    let discard = !state.preserve || prev == ResourceLayout::Undefined;

    ResourceBarrier {
        resource,
        prev_layout: prev,
        next_layout: next,
        src_stages: prev.stage_mask(),
        src_access: prev.access_mask(),
        dst_stages: next.stage_mask(),
        dst_access: next.access_mask(),
        old_image_layout: if discard {
            ImageLayout::UNDEFINED
        } else {
            prev.image_layout()
        },
        new_image_layout: next.image_layout(),
        discard,
        mip_levels: 0..ash::vk::REMAINING_MIP_LEVELS,
    }
}

fn buffer_barrier(resource: ResourceId, state: &ResourceState) -> Option<ResourceBarrier> {
    let prev = state.current;
    let next = state.pending;

    if next == ResourceLayout::Undefined {
        return None;
    }

    let src_access = if prev.is_compute_write() {
        AccessFlags::SHADER_WRITE
    } else if next.is_compute_write() {
        AccessFlags::SHADER_READ
    } else {
        // Two reads don't need to be ordered.
        return None;
    };

    Some(ResourceBarrier {
        resource,
        prev_layout: prev,
        next_layout: next,
        src_stages: PipelineStages::COMPUTE_SHADER,
        src_access,
        dst_stages: PipelineStages::COMPUTE_SHADER,
        dst_access: next.buffer_access(),
        old_image_layout: ImageLayout::UNDEFINED,
        new_image_layout: ImageLayout::UNDEFINED,
        discard: !state.preserve || prev == ResourceLayout::Undefined,
        mip_levels: 0..ash::vk::REMAINING_MIP_LEVELS,
    })
}

/// Error that can happen when requesting a layout for a resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LayoutTransitionError {
    /// An image was requested to be transitioned to [`ResourceLayout::Undefined`].
    UndefinedTarget { resource: ResourceId },

    /// A buffer was requested to be in a layout that only applies to images.
    UnsupportedBufferLayout {
        resource: ResourceId,
        layout: ResourceLayout,
    },
}

impl Error for LayoutTransitionError {}

impl fmt::Display for LayoutTransitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UndefinedTarget { resource } => write!(
                f,
                "{resource:?} can't be transitioned to the undefined layout",
            ),
            Self::UnsupportedBufferLayout { resource, layout } => write!(
                f,
                "{resource:?} is a buffer and can't be put in the {layout:?} layout",
            ),
        }
    }
}
