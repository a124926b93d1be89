//! Ray tracing support via Vulkan KHR extensions.
//!
//! This module provides acceleration structure management (BLAS/TLAS),
//! the ray tracing pipeline, and its shader binding table.

pub mod acceleration;
pub mod pipeline;
pub mod sbt;

pub use acceleration::{
    pack_instances, AccelerationStructureRegistry, Aabb, BlasHandle, RtInstance, TlasHandle,
    IDENTITY_TRANSFORM,
};
pub use pipeline::{RayTracingPipeline, SbtRegion, ShaderBinaries, ShaderGroup, ShaderStage, SHADER_GROUPS};
pub use sbt::{SbtLayout, ShaderBindingTable};

/// Round `value` up to a multiple of `alignment` (0 leaves it unchanged).
pub fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment == 0 {
        value
    } else {
        value.div_ceil(alignment) * alignment
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 64), 0);
        assert_eq!(align_up(1, 64), 64);
        assert_eq!(align_up(64, 64), 64);
        assert_eq!(align_up(65, 64), 128);
        assert_eq!(align_up(20, 16), 32);
        assert_eq!(align_up(7, 0), 7);
    }
}
