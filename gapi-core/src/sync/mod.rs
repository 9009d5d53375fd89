//! Synchronization of resource accesses within a command stream.
//!
//! Before the device can use a resource in a different way than it was last used, a barrier must
//! make the previous writes visible and, for images, move the image to the right layout. The
//! [`LayoutTracker`](tracker::LayoutTracker) works out which barriers are needed and hands them to
//! the backend in batches.

use crate::macros::vulkan_bitflags;

pub use ash::vk::ImageLayout;

pub mod tracker;

vulkan_bitflags! {
    /// A set of stages in a device's processing pipeline.
    PipelineStages = PipelineStageFlags(u32);

    /// A pseudo-stage representing the start of the pipeline.
    TOP_OF_PIPE = TOP_OF_PIPE,

    /// Indirect buffers are read.
    DRAW_INDIRECT = DRAW_INDIRECT,

    /// Vertex and index buffers are read.
    VERTEX_INPUT = VERTEX_INPUT,

    /// Vertex shaders are executed.
    VERTEX_SHADER = VERTEX_SHADER,

    /// Tessellation control shaders are executed.
    TESSELLATION_CONTROL_SHADER = TESSELLATION_CONTROL_SHADER,

    /// Tessellation evaluation shaders are executed.
    TESSELLATION_EVALUATION_SHADER = TESSELLATION_EVALUATION_SHADER,

    /// Geometry shaders are executed.
    GEOMETRY_SHADER = GEOMETRY_SHADER,

    /// Fragment shaders are executed.
    FRAGMENT_SHADER = FRAGMENT_SHADER,

    /// Early fragment tests (depth and stencil tests before fragment shading) are performed.
    EARLY_FRAGMENT_TESTS = EARLY_FRAGMENT_TESTS,

    /// Late fragment tests (depth and stencil tests after fragment shading) are performed.
    LATE_FRAGMENT_TESTS = LATE_FRAGMENT_TESTS,

    /// The final color values are output from the pipeline after blending.
    COLOR_ATTACHMENT_OUTPUT = COLOR_ATTACHMENT_OUTPUT,

    /// Compute shaders are executed.
    COMPUTE_SHADER = COMPUTE_SHADER,

    /// Copy, blit and clear commands are executed.
    TRANSFER = TRANSFER,

    /// A pseudo-stage representing the end of the pipeline.
    BOTTOM_OF_PIPE = BOTTOM_OF_PIPE,

    /// A pseudo-stage representing reads and writes to device memory on the host.
    HOST = HOST,

    /// The workload of all graphics pipeline stages.
    ALL_GRAPHICS = ALL_GRAPHICS,

    /// The workload of all pipeline stages.
    ALL_COMMANDS = ALL_COMMANDS,
}

vulkan_bitflags! {
    /// A set of memory access types that are included in a memory dependency.
    AccessFlags = AccessFlags(u32);

    /// Read access to an indirect buffer.
    INDIRECT_COMMAND_READ = INDIRECT_COMMAND_READ,

    /// Read access to an index buffer.
    INDEX_READ = INDEX_READ,

    /// Read access to a vertex buffer.
    VERTEX_ATTRIBUTE_READ = VERTEX_ATTRIBUTE_READ,

    /// Read access to a uniform buffer in a shader.
    UNIFORM_READ = UNIFORM_READ,

    /// Read access to a storage buffer, storage image or sampled image in a shader.
    SHADER_READ = SHADER_READ,

    /// Write access to a storage buffer or storage image in a shader.
    SHADER_WRITE = SHADER_WRITE,

    /// Read access to a color attachment during blending, logic operations or subpass load
    /// operations.
    COLOR_ATTACHMENT_READ = COLOR_ATTACHMENT_READ,

    /// Write access to a color attachment during render pass operations.
    COLOR_ATTACHMENT_WRITE = COLOR_ATTACHMENT_WRITE,

    /// Read access to a depth/stencil attachment during depth or stencil tests.
    DEPTH_STENCIL_ATTACHMENT_READ = DEPTH_STENCIL_ATTACHMENT_READ,

    /// Write access to a depth/stencil attachment during render pass operations.
    DEPTH_STENCIL_ATTACHMENT_WRITE = DEPTH_STENCIL_ATTACHMENT_WRITE,

    /// Read access to a buffer or image in a copy, blit or resolve command.
    TRANSFER_READ = TRANSFER_READ,

    /// Write access to a buffer or image in a copy, blit, resolve or clear command.
    TRANSFER_WRITE = TRANSFER_WRITE,

    /// Read access to a buffer or image on the host.
    HOST_READ = HOST_READ,

    /// Write access to a buffer or image on the host.
    HOST_WRITE = HOST_WRITE,

    /// Read access to any resource that isn't covered by a more specific flag.
    MEMORY_READ = MEMORY_READ,

    /// Write access to any resource that isn't covered by a more specific flag.
    MEMORY_WRITE = MEMORY_WRITE,
}

impl AccessFlags {
    /// Returns whether `self` contains any write access.
    #[inline]
    pub const fn contains_writes(self) -> bool {
        self.intersects(
            AccessFlags::SHADER_WRITE
                .union(AccessFlags::COLOR_ATTACHMENT_WRITE)
                .union(AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE)
                .union(AccessFlags::TRANSFER_WRITE)
                .union(AccessFlags::HOST_WRITE)
                .union(AccessFlags::MEMORY_WRITE),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_to_ash() {
        let stages = PipelineStages::VERTEX_SHADER | PipelineStages::FRAGMENT_SHADER;
        assert_eq!(
            ash::vk::PipelineStageFlags::from(stages),
            ash::vk::PipelineStageFlags::VERTEX_SHADER
                | ash::vk::PipelineStageFlags::FRAGMENT_SHADER,
        );

        let access = AccessFlags::from(ash::vk::AccessFlags::SHADER_READ);
        assert_eq!(access, AccessFlags::SHADER_READ);
        assert!(!access.contains_writes());
        assert!((access | AccessFlags::SHADER_WRITE).contains_writes());
        assert_eq!(format!("{:?}", AccessFlags::empty()), "empty()");
        assert_eq!(
            format!("{:?}", AccessFlags::TRANSFER_READ | AccessFlags::TRANSFER_WRITE),
            "TRANSFER_READ | TRANSFER_WRITE",
        );
    }
}
