pub mod descriptor;
pub mod descriptor_set;
pub mod storage;

use crate::renderer::contexts::device_ctx::device::RenderDevice;
use crate::renderer::contexts::resource_ctx::descriptor_set::{DescriptorSetHandle, DescriptorSetRegistry};
use crate::renderer::contexts::resource_ctx::storage::ResourceStorage;

/// Responsibilities:
/// - Own the buffers and images a renderer declares, handing out index handles
/// - Own the descriptor sets and write them from the resources they reference
pub struct RenderResourceContext {
    pub storage: ResourceStorage,
    pub descriptor_sets: DescriptorSetRegistry,
}

impl RenderResourceContext {
    pub fn new() -> Self {
        Self {
            storage: ResourceStorage::new(),
            descriptor_sets: DescriptorSetRegistry::new(),
        }
    }

    /// Creates layouts, allocates the sets and writes every ready binding
    pub fn create_descriptor_sets(&mut self, dev: &RenderDevice) -> color_eyre::Result<()> {
        self.descriptor_sets.create_all(dev)?;
        self.descriptor_sets.update_all(dev, &self.storage);
        Ok(())
    }

    /// Safe to call on sets that were only partly created
    pub fn destroy_descriptor_sets(&mut self, dev: &RenderDevice) -> color_eyre::Result<()> {
        self.descriptor_sets.destroy_all(dev)
    }

    pub fn update_descriptor_sets(&self, dev: &RenderDevice) {
        self.descriptor_sets.update_all(dev, &self.storage);
    }

    pub fn update_descriptor_set_subset(
        &self,
        dev: &RenderDevice,
        subset: &[DescriptorSetHandle],
    ) -> color_eyre::Result<()> {
        self.descriptor_sets.update(dev, &self.storage, subset)
    }

    /// Forgets all declarations so the layout phase can run again
    pub fn reset(&mut self) {
        self.descriptor_sets.clear();
        self.storage.clear();
    }
}

impl Default for RenderResourceContext {
    fn default() -> Self {
        Self::new()
    }
}
