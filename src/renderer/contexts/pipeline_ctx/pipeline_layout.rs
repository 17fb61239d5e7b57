use ash::vk;
use color_eyre::eyre::{eyre, OptionExt, Result};
use smallvec::SmallVec;
use crate::renderer::contexts::resource_ctx::descriptor_set::{DescriptorSetHandle, DescriptorSetRegistry};

/// Descriptor sets and push constant ranges of a pipeline.
/// The set handles are captured on `create` and bound together on `bind`.
#[derive(Default)]
pub struct PipelineLayout {
    descriptor_sets: Vec<DescriptorSetHandle>,
    push_constants: Vec<vk::PushConstantRange>,

    handle: vk::PipelineLayout,
    vk_descriptor_sets: SmallVec<[vk::DescriptorSet; 4]>,
}

impl PipelineLayout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_descriptor_set(&mut self, set: DescriptorSetHandle) -> &mut Self {
        self.descriptor_sets.push(set);
        self
    }

    /// Declares a push constant of type `T` at offset 0, returning its index
    pub fn add_push_constant<T>(&mut self, stages: vk::ShaderStageFlags) -> usize {
        self.push_constants.push(vk::PushConstantRange {
            stage_flags: stages,
            offset: 0,
            size: size_of::<T>() as u32,
        });
        self.push_constants.len() - 1
    }

    pub fn push_constant_range(&self, index: usize) -> Option<&vk::PushConstantRange> {
        self.push_constants.get(index)
    }

    pub fn descriptor_sets(&self) -> &[DescriptorSetHandle] {
        &self.descriptor_sets
    }

    pub fn handle(&self) -> vk::PipelineLayout {
        self.handle
    }

    pub fn create(&mut self, device: &ash::Device, registry: &DescriptorSetRegistry) -> Result<()> {
        if self.handle != vk::PipelineLayout::null() {
            return Err(eyre!("Pipeline layout already created"));
        }

        let mut set_layouts = SmallVec::<[vk::DescriptorSetLayout; 4]>::new();
        let mut sets = SmallVec::<[vk::DescriptorSet; 4]>::new();
        for handle in &self.descriptor_sets {
            let set = registry.get(*handle)?;
            set_layouts.push(set.layout());
            sets.push(set.handle());
        }

        let info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&set_layouts)
            .push_constant_ranges(&self.push_constants);
        self.handle = unsafe { device.create_pipeline_layout(&info, None)? };
        self.vk_descriptor_sets = sets;
        Ok(())
    }

    pub fn destroy(&mut self, device: &ash::Device) {
        self.vk_descriptor_sets.clear();
        if self.handle != vk::PipelineLayout::null() {
            unsafe {
                device.destroy_pipeline_layout(self.handle, None);
            }
            self.handle = vk::PipelineLayout::null();
        }
    }

    /// Binds all captured sets starting at set 0
    pub fn bind(&self, device: &ash::Device, cmd: vk::CommandBuffer, bind_point: vk::PipelineBindPoint) {
        if self.vk_descriptor_sets.is_empty() {
            return;
        }
        unsafe {
            device.cmd_bind_descriptor_sets(cmd, bind_point, self.handle, 0, &self.vk_descriptor_sets, &[]);
        }
    }

    /// Pushes the first `size` bytes of `bytes` to the push constant declared at `index`
    pub fn push_constant(
        &self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        index: usize,
        bytes: &[u8],
    ) -> Result<()> {
        let range = self
            .push_constant_range(index)
            .ok_or_eyre(format!("Pipeline layout has no push constant {}", index))?;
        let size = range.size as usize;
        let bytes = bytes
            .get(..size)
            .ok_or_eyre(format!("Push constant needs {} bytes, got {}", size, bytes.len()))?;
        unsafe {
            device.cmd_push_constants(cmd, self.handle, range.stage_flags, range.offset, bytes);
        }
        Ok(())
    }

    /// Forgets declared sets and push constants
    pub fn reset(&mut self) {
        self.descriptor_sets.clear();
        self.push_constants.clear();
    }
}

impl Drop for PipelineLayout {
    fn drop(&mut self) {
        if self.handle != vk::PipelineLayout::null() {
            log::error!("Pipeline layout dropped without being destroyed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C)]
    #[allow(dead_code)]
    struct Light {
        position: [f32; 4],
        color: [f32; 4],
        intensity: f32,
    }

    #[test]
    fn push_constants_start_at_offset_zero() {
        let mut layout = PipelineLayout::new();
        let first = layout.add_push_constant::<Light>(vk::ShaderStageFlags::FRAGMENT);
        let second = layout.add_push_constant::<[f32; 4]>(vk::ShaderStageFlags::VERTEX);

        let light = layout.push_constant_range(first).unwrap();
        assert_eq!(light.offset, 0);
        assert_eq!(light.size, 36);
        assert_eq!(light.stage_flags, vk::ShaderStageFlags::FRAGMENT);
        assert_eq!(layout.push_constant_range(second).unwrap().size, 16);
        assert!(layout.push_constant_range(2).is_none());
    }

    #[test]
    fn reset_forgets_declarations() {
        let mut layout = PipelineLayout::new();
        layout.add_descriptor_set(DescriptorSetHandle(0))
            .add_descriptor_set(DescriptorSetHandle(1));
        layout.add_push_constant::<u32>(vk::ShaderStageFlags::ALL);
        assert_eq!(layout.descriptor_sets(), &[DescriptorSetHandle(0), DescriptorSetHandle(1)]);

        layout.reset();
        assert!(layout.descriptor_sets().is_empty());
        assert!(layout.push_constant_range(0).is_none());
        assert_eq!(layout.handle(), vk::PipelineLayout::null());
    }
}
