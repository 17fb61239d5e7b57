use ash::vk;
use color_eyre::eyre::{eyre, OptionExt, Result};
use crate::renderer::contexts::pipeline_ctx::pipeline_layout::PipelineLayout;
use crate::renderer::contexts::pipeline_ctx::shader_program::ShaderProgram;
use crate::renderer::resources::shader::ShaderStage;

/// Workgroup counts of one dispatch
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GroupCounts {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl GroupCounts {
    /// Groups of `local_size` invocations covering `width` x `height` items
    pub fn covering(width: u32, height: u32, local_size: (u32, u32)) -> Self {
        Self {
            x: width.div_ceil(local_size.0.max(1)),
            y: height.div_ceil(local_size.1.max(1)),
            z: 1,
        }
    }
}

/// Compute pipeline over a single `.comp` shader, dispatched with its group counts
pub struct ComputePipeline {
    pub program: ShaderProgram,
    group_counts: GroupCounts,

    handle: vk::Pipeline,
}

impl ComputePipeline {
    pub fn new(shader_name: &str) -> Self {
        Self {
            program: ShaderProgram::new(&[(ShaderStage::Compute, shader_name)]),
            group_counts: GroupCounts::default(),
            handle: vk::Pipeline::null(),
        }
    }

    pub fn handle(&self) -> vk::Pipeline {
        self.handle
    }

    pub fn group_counts(&self) -> GroupCounts {
        self.group_counts
    }

    pub fn set_group_counts(&mut self, x: u32, y: u32, z: u32) {
        self.group_counts = GroupCounts { x, y, z };
    }

    pub fn create(&mut self, device: &ash::Device, layout: &PipelineLayout) -> Result<()> {
        if self.handle != vk::Pipeline::null() {
            return Err(eyre!("Compute pipeline already created"));
        }

        self.program.create_shader_stages(device)?;
        let stage = self.program
            .stage_infos()
            .into_iter()
            .next()
            .ok_or_eyre("Compute pipeline has no shader stage")?;

        let info = vk::ComputePipelineCreateInfo::default()
            .stage(stage)
            .layout(layout.handle())
            .base_pipeline_index(-1);

        let result = unsafe {
            device.create_compute_pipelines(vk::PipelineCache::null(), &[info], None)
        };
        match result {
            Ok(pipelines) => {
                self.handle = pipelines
                    .into_iter()
                    .next()
                    .ok_or_eyre("Compute pipeline creation returned nothing")?;
                Ok(())
            }
            Err((_, e)) => {
                self.program.destroy_shader_stages(device);
                Err(eyre!("Failed to create compute pipeline: {}", e))
            }
        }
    }

    pub fn destroy(&mut self, device: &ash::Device) {
        if self.handle != vk::Pipeline::null() {
            unsafe {
                device.destroy_pipeline(self.handle, None);
            }
            self.handle = vk::Pipeline::null();
        }
        self.program.destroy_shader_stages(device);
    }

    /// Binds the pipeline and its descriptor sets on the compute bind point,
    /// pushes the optional constant at index 0 and dispatches the group counts
    pub fn execute(
        &self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        layout: &PipelineLayout,
        push_constant: Option<&[u8]>,
    ) -> Result<()> {
        if self.handle == vk::Pipeline::null() {
            return Err(eyre!("Compute pipeline is not created"));
        }
        unsafe {
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::COMPUTE, self.handle);
        }
        layout.bind(device, cmd, vk::PipelineBindPoint::COMPUTE);
        if let Some(bytes) = push_constant {
            layout.push_constant(device, cmd, 0, bytes)?;
        }

        let GroupCounts { x, y, z } = self.group_counts;
        unsafe {
            device.cmd_dispatch(cmd, x, y, z);
        }
        Ok(())
    }
}

impl Drop for ComputePipeline {
    fn drop(&mut self) {
        if self.handle != vk::Pipeline::null() {
            log::error!("Compute pipeline dropped without being destroyed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn program_holds_one_compute_stage() {
        let pipeline = ComputePipeline::new("histogram");
        let [shader] = pipeline.program.shaders() else {
            panic!("expected a single shader");
        };
        assert_eq!(shader.stage, ShaderStage::Compute);
        assert_eq!(shader.name, "histogram");
        assert_eq!(shader.stage.flags(), vk::ShaderStageFlags::COMPUTE);
        assert_eq!(pipeline.handle(), vk::Pipeline::null());
    }

    #[test]
    fn group_counts_start_empty_and_are_stored() {
        let mut pipeline = ComputePipeline::new("histogram");
        assert_eq!(pipeline.group_counts(), GroupCounts { x: 0, y: 0, z: 0 });
        pipeline.set_group_counts(8, 4, 2);
        assert_eq!(pipeline.group_counts(), GroupCounts { x: 8, y: 4, z: 2 });
    }

    #[test]
    fn covering_rounds_partial_groups_up() {
        assert_eq!(GroupCounts::covering(1920, 1080, (16, 16)), GroupCounts { x: 120, y: 68, z: 1 });
        assert_eq!(GroupCounts::covering(16, 1, (16, 16)), GroupCounts { x: 1, y: 1, z: 1 });
        assert_eq!(GroupCounts::covering(5, 5, (0, 0)), GroupCounts { x: 5, y: 5, z: 1 });
    }
}
