//! Ray tracing pipeline: shader stages, shader groups and pipeline layout.
//!
//! [`SHADER_GROUPS`] is the single source of truth for group order. The
//! pipeline creates its groups from it and the shader binding table derives
//! its region slots from it.

use ash::vk;
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::{RenderError, Result, VkResultExt};
use crate::vulkan::VulkanContext;

/// Shader stages of the pipeline, in stage-array order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Raygen,
    Miss,
    ClosestHit,
    Intersection,
}

impl ShaderStage {
    pub const ALL: [ShaderStage; 4] = [
        ShaderStage::Raygen,
        ShaderStage::Miss,
        ShaderStage::ClosestHit,
        ShaderStage::Intersection,
    ];

    /// Position in the pipeline's stage array.
    pub const fn index(self) -> u32 {
        self as u32
    }

    /// SPIR-V file the stage is loaded from.
    pub fn file_name(self) -> &'static str {
        match self {
            ShaderStage::Raygen => "raygen.spv",
            ShaderStage::Miss => "miss.spv",
            ShaderStage::ClosestHit => "closest_hit.spv",
            ShaderStage::Intersection => "intersection.spv",
        }
    }

    pub fn flags(self) -> vk::ShaderStageFlags {
        match self {
            ShaderStage::Raygen => vk::ShaderStageFlags::RAYGEN_KHR,
            ShaderStage::Miss => vk::ShaderStageFlags::MISS_KHR,
            ShaderStage::ClosestHit => vk::ShaderStageFlags::CLOSEST_HIT_KHR,
            ShaderStage::Intersection => vk::ShaderStageFlags::INTERSECTION_KHR,
        }
    }
}

/// Shader binding table region a group's handle lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SbtRegion {
    Raygen,
    Miss,
    Hit,
}

/// A shader group of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderGroup {
    /// A single raygen or miss shader
    General { shader: ShaderStage },
    /// Closest-hit plus intersection shader for AABB geometry
    ProceduralHit {
        closest_hit: ShaderStage,
        intersection: ShaderStage,
    },
}

/// Group order shared by the pipeline and the shader binding table.
pub const SHADER_GROUPS: [ShaderGroup; 3] = [
    ShaderGroup::General { shader: ShaderStage::Raygen },
    ShaderGroup::General { shader: ShaderStage::Miss },
    ShaderGroup::ProceduralHit {
        closest_hit: ShaderStage::ClosestHit,
        intersection: ShaderStage::Intersection,
    },
];

impl ShaderGroup {
    pub fn region(&self) -> SbtRegion {
        match self {
            ShaderGroup::General { shader: ShaderStage::Raygen } => SbtRegion::Raygen,
            ShaderGroup::General { .. } => SbtRegion::Miss,
            ShaderGroup::ProceduralHit { .. } => SbtRegion::Hit,
        }
    }

    pub fn create_info(&self) -> vk::RayTracingShaderGroupCreateInfoKHR<'static> {
        let info = vk::RayTracingShaderGroupCreateInfoKHR::default()
            .general_shader(vk::SHADER_UNUSED_KHR)
            .closest_hit_shader(vk::SHADER_UNUSED_KHR)
            .any_hit_shader(vk::SHADER_UNUSED_KHR)
            .intersection_shader(vk::SHADER_UNUSED_KHR);

        match *self {
            ShaderGroup::General { shader } => info
                .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
                .general_shader(shader.index()),
            ShaderGroup::ProceduralHit {
                closest_hit,
                intersection,
            } => info
                .ty(vk::RayTracingShaderGroupTypeKHR::PROCEDURAL_HIT_GROUP)
                .closest_hit_shader(closest_hit.index())
                .intersection_shader(intersection.index()),
        }
    }
}

/// Index of the first group in `region`, if any group lives there.
pub fn first_group_in(region: SbtRegion) -> Option<usize> {
    SHADER_GROUPS.iter().position(|g| g.region() == region)
}

/// Number of groups in `region`.
pub fn groups_in(region: SbtRegion) -> usize {
    SHADER_GROUPS.iter().filter(|g| g.region() == region).count()
}

/// SPIR-V code for every stage.
pub struct ShaderBinaries {
    code: Vec<Vec<u32>>,
}

impl ShaderBinaries {
    /// Load every stage's SPIR-V from `dir`.
    pub fn load(dir: &Path) -> Result<Self> {
        let code = ShaderStage::ALL
            .iter()
            .map(|stage| read_spirv(&dir.join(stage.file_name())))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { code })
    }

    pub fn get(&self, stage: ShaderStage) -> &[u32] {
        &self.code[stage.index() as usize]
    }
}

fn read_spirv(path: &Path) -> Result<Vec<u32>> {
    let shader_load = |source| RenderError::ShaderLoad {
        path: PathBuf::from(path),
        source,
    };
    let mut file = File::open(path).map_err(shader_load)?;
    ash::util::read_spv(&mut file).map_err(shader_load)
}

/// The ray tracing pipeline and its layout.
pub struct RayTracingPipeline {
    pub handle: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub group_count: u32,
}

impl RayTracingPipeline {
    /// Build the pipeline over the single descriptor set layout.
    pub unsafe fn build(
        ctx: &VulkanContext,
        set_layout: vk::DescriptorSetLayout,
        binaries: &ShaderBinaries,
    ) -> Result<Self> {
        if ctx.rt.properties.max_ray_recursion_depth < 1 {
            return Err(RenderError::Unsupported(
                "device does not support ray recursion depth 1".into(),
            ));
        }

        let mut modules = Vec::with_capacity(ShaderStage::ALL.len());
        for stage in ShaderStage::ALL {
            let info = vk::ShaderModuleCreateInfo::default().code(binaries.get(stage));
            match ctx.device.create_shader_module(&info, None) {
                Ok(module) => modules.push(module),
                Err(e) => {
                    destroy_modules(ctx, &modules);
                    return Err(e).context("Failed to create shader module");
                }
            }
        }

        let result = Self::link(ctx, set_layout, &modules);

        // Modules are only needed while linking
        destroy_modules(ctx, &modules);

        let pipeline = result?;
        info!(groups = pipeline.group_count, "Ray tracing pipeline created");
        Ok(pipeline)
    }

    unsafe fn link(
        ctx: &VulkanContext,
        set_layout: vk::DescriptorSetLayout,
        modules: &[vk::ShaderModule],
    ) -> Result<Self> {
        let stages: Vec<_> = ShaderStage::ALL
            .iter()
            .zip(modules)
            .map(|(stage, &module)| {
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(stage.flags())
                    .module(module)
                    .name(c"main")
            })
            .collect();

        let groups: Vec<_> = SHADER_GROUPS.iter().map(|g| g.create_info()).collect();

        let set_layouts = [set_layout];
        let layout_info = vk::PipelineLayoutCreateInfo::default().set_layouts(&set_layouts);
        let layout = ctx
            .device
            .create_pipeline_layout(&layout_info, None)
            .context("Failed to create pipeline layout")?;

        let create_info = vk::RayTracingPipelineCreateInfoKHR::default()
            .stages(&stages)
            .groups(&groups)
            .max_pipeline_ray_recursion_depth(1)
            .layout(layout);

        let created = ctx
            .rt
            .pipeline
            .create_ray_tracing_pipelines(
                vk::DeferredOperationKHR::null(),
                vk::PipelineCache::null(),
                &[create_info],
                None,
            )
            .map_err(|(_, e)| e)
            .context("Failed to create ray tracing pipeline");

        let handle = match created {
            Ok(pipelines) => pipelines[0],
            Err(e) => {
                ctx.device.destroy_pipeline_layout(layout, None);
                return Err(e);
            }
        };

        Ok(Self {
            handle,
            layout,
            group_count: groups.len() as u32,
        })
    }

    /// Bind the pipeline and its descriptor set.
    pub unsafe fn bind(&self, ctx: &VulkanContext, cmd: vk::CommandBuffer, set: vk::DescriptorSet) {
        ctx.device
            .cmd_bind_pipeline(cmd, vk::PipelineBindPoint::RAY_TRACING_KHR, self.handle);
        ctx.device.cmd_bind_descriptor_sets(
            cmd,
            vk::PipelineBindPoint::RAY_TRACING_KHR,
            self.layout,
            0,
            &[set],
            &[],
        );
    }

    pub unsafe fn destroy(&mut self, ctx: &VulkanContext) {
        if self.handle != vk::Pipeline::null() {
            ctx.device.destroy_pipeline(self.handle, None);
            self.handle = vk::Pipeline::null();
        }
        if self.layout != vk::PipelineLayout::null() {
            ctx.device.destroy_pipeline_layout(self.layout, None);
            self.layout = vk::PipelineLayout::null();
        }
    }
}

unsafe fn destroy_modules(ctx: &VulkanContext, modules: &[vk::ShaderModule]) {
    for &module in modules {
        ctx.device.destroy_shader_module(module, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    // ============================================================
    // Group schema
    // ============================================================

    #[test]
    fn test_group_order() {
        assert_eq!(first_group_in(SbtRegion::Raygen), Some(0));
        assert_eq!(first_group_in(SbtRegion::Miss), Some(1));
        assert_eq!(first_group_in(SbtRegion::Hit), Some(2));
    }

    #[test]
    fn test_one_group_per_region() {
        assert_eq!(groups_in(SbtRegion::Raygen), 1);
        assert_eq!(groups_in(SbtRegion::Miss), 1);
        assert_eq!(groups_in(SbtRegion::Hit), 1);
    }

    #[test]
    fn test_general_group_info() {
        let info = SHADER_GROUPS[1].create_info();
        assert_eq!(info.ty, vk::RayTracingShaderGroupTypeKHR::GENERAL);
        assert_eq!(info.general_shader, ShaderStage::Miss.index());
        assert_eq!(info.closest_hit_shader, vk::SHADER_UNUSED_KHR);
        assert_eq!(info.intersection_shader, vk::SHADER_UNUSED_KHR);
    }

    #[test]
    fn test_procedural_hit_group_info() {
        let info = SHADER_GROUPS[2].create_info();
        assert_eq!(info.ty, vk::RayTracingShaderGroupTypeKHR::PROCEDURAL_HIT_GROUP);
        assert_eq!(info.general_shader, vk::SHADER_UNUSED_KHR);
        assert_eq!(info.closest_hit_shader, ShaderStage::ClosestHit.index());
        assert_eq!(info.any_hit_shader, vk::SHADER_UNUSED_KHR);
        assert_eq!(info.intersection_shader, ShaderStage::Intersection.index());
    }

    #[test]
    fn test_stage_indices_match_stage_array() {
        for (i, stage) in ShaderStage::ALL.iter().enumerate() {
            assert_eq!(stage.index() as usize, i);
        }
    }

    // ============================================================
    // ShaderBinaries::load
    // ============================================================

    const SPIRV_MAGIC: u32 = 0x0723_0203;

    fn write_fake_spirv(dir: &Path, stage: ShaderStage) {
        let words = [SPIRV_MAGIC, 0x0001_0400, stage.index(), 0];
        let mut file = File::create(dir.join(stage.file_name())).unwrap();
        for word in words {
            file.write_all(&word.to_le_bytes()).unwrap();
        }
    }

    #[test]
    fn test_load_reads_every_stage() {
        let dir = tempfile::tempdir().unwrap();
        for stage in ShaderStage::ALL {
            write_fake_spirv(dir.path(), stage);
        }

        let binaries = ShaderBinaries::load(dir.path()).unwrap();
        for stage in ShaderStage::ALL {
            let code = binaries.get(stage);
            assert_eq!(code.len(), 4);
            assert_eq!(code[0], SPIRV_MAGIC);
            assert_eq!(code[2], stage.index());
        }
    }

    #[test]
    fn test_missing_stage_names_the_file() {
        let dir = tempfile::tempdir().unwrap();
        write_fake_spirv(dir.path(), ShaderStage::Raygen);
        write_fake_spirv(dir.path(), ShaderStage::Miss);

        match ShaderBinaries::load(dir.path()) {
            Err(RenderError::ShaderLoad { path, .. }) => {
                assert_eq!(path, dir.path().join("closest_hit.spv"));
            }
            other => panic!("expected ShaderLoad error, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_truncated_spirv_rejected() {
        let dir = tempfile::tempdir().unwrap();
        for stage in ShaderStage::ALL {
            write_fake_spirv(dir.path(), stage);
        }
        std::fs::write(dir.path().join("miss.spv"), [0x03, 0x02, 0x23]).unwrap();

        assert!(matches!(
            ShaderBinaries::load(dir.path()),
            Err(RenderError::ShaderLoad { .. })
        ));
    }
}
