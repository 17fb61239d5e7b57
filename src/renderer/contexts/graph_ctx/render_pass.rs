use ash::vk;
use color_eyre::eyre::{eyre, OptionExt, Result};
use smallvec::SmallVec;
use crate::renderer::contexts::device_ctx::swapchain::Swapchain;
use crate::renderer::resources::image::Image;

type AttachmentViews = SmallVec<[vk::ImageView; 8]>;

/// Color target written by one pass and read as an input attachment by a later one
pub fn color_output_attachment(format: vk::Format) -> vk::AttachmentDescription {
    vk::AttachmentDescription {
        format,
        samples: vk::SampleCountFlags::TYPE_1,
        load_op: vk::AttachmentLoadOp::CLEAR,
        store_op: vk::AttachmentStoreOp::STORE,
        stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
        stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
        initial_layout: vk::ImageLayout::UNDEFINED,
        final_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        ..Default::default()
    }
}

/// Attachment whose content from a previous pass is kept and only read
pub fn preserved_input_attachment(format: vk::Format) -> vk::AttachmentDescription {
    vk::AttachmentDescription {
        format,
        samples: vk::SampleCountFlags::TYPE_1,
        load_op: vk::AttachmentLoadOp::LOAD,
        store_op: vk::AttachmentStoreOp::STORE,
        stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
        stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
        initial_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        final_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        ..Default::default()
    }
}

pub fn depth_stencil_attachment(format: vk::Format) -> vk::AttachmentDescription {
    vk::AttachmentDescription {
        format,
        samples: vk::SampleCountFlags::TYPE_1,
        load_op: vk::AttachmentLoadOp::CLEAR,
        store_op: vk::AttachmentStoreOp::STORE,
        stencil_load_op: vk::AttachmentLoadOp::CLEAR,
        stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
        initial_layout: vk::ImageLayout::UNDEFINED,
        final_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        ..Default::default()
    }
}

pub fn present_attachment(format: vk::Format) -> vk::AttachmentDescription {
    vk::AttachmentDescription {
        format,
        samples: vk::SampleCountFlags::TYPE_1,
        load_op: vk::AttachmentLoadOp::CLEAR,
        store_op: vk::AttachmentStoreOp::STORE,
        stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
        stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
        initial_layout: vk::ImageLayout::UNDEFINED,
        final_layout: vk::ImageLayout::PRESENT_SRC_KHR,
        ..Default::default()
    }
}

pub fn attachment_ref(attachment: u32, layout: vk::ImageLayout) -> vk::AttachmentReference {
    vk::AttachmentReference { attachment, layout }
}

/// Subpass topology by attachment index
#[derive(Debug, Clone, Default)]
pub struct Subpass {
    pub color_attachments: Vec<vk::AttachmentReference>,
    pub input_attachments: Vec<vk::AttachmentReference>,
    pub depth_stencil_attachment: Option<vk::AttachmentReference>,
}

impl Subpass {
    pub fn description(&self) -> vk::SubpassDescription<'_> {
        let mut description = vk::SubpassDescription::default()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&self.color_attachments)
            .input_attachments(&self.input_attachments);
        if let Some(depth) = &self.depth_stencil_attachment {
            description = description.depth_stencil_attachment(depth);
        }
        description
    }
}

/// One attachment list per swapchain image, each null view replaced by that image's view
pub fn substitute_swapchain_views(
    views: &[vk::ImageView],
    swapchain_views: &[vk::ImageView],
) -> Vec<AttachmentViews> {
    swapchain_views
        .iter()
        .map(|swapchain_view| {
            views
                .iter()
                .map(|view| if *view == vk::ImageView::null() { *swapchain_view } else { *view })
                .collect()
        })
        .collect()
}

/// Render pass declared attachment by attachment, then created once with its framebuffers
#[derive(Default)]
pub struct RenderPass {
    attachments: Vec<vk::AttachmentDescription>,
    subpasses: Vec<Subpass>,
    dependencies: Vec<vk::SubpassDependency>,

    handle: vk::RenderPass,
    framebuffers: Vec<vk::Framebuffer>,
    extent: vk::Extent2D,
}

impl RenderPass {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the index subpasses refer to the attachment by
    pub fn add_attachment(&mut self, attachment: vk::AttachmentDescription) -> u32 {
        self.attachments.push(attachment);
        (self.attachments.len() - 1) as u32
    }

    pub fn add_subpass(&mut self, subpass: Subpass) {
        self.subpasses.push(subpass);
    }

    pub fn add_dependency(&mut self, dependency: vk::SubpassDependency) {
        self.dependencies.push(dependency);
    }

    pub fn attachments(&self) -> &[vk::AttachmentDescription] {
        &self.attachments
    }

    pub fn subpasses(&self) -> &[Subpass] {
        &self.subpasses
    }

    pub fn handle(&self) -> vk::RenderPass {
        self.handle
    }

    pub fn framebuffers(&self) -> &[vk::Framebuffer] {
        &self.framebuffers
    }

    pub fn create(&mut self, device: &ash::Device) -> Result<()> {
        if self.handle != vk::RenderPass::null() {
            return Err(eyre!("Render pass already created"));
        }
        if self.subpasses.is_empty() {
            return Err(eyre!("Render pass has no subpass"));
        }
        let subpasses = self.subpasses
            .iter()
            .map(Subpass::description)
            .collect::<Vec<_>>();
        let info = vk::RenderPassCreateInfo::default()
            .attachments(&self.attachments)
            .subpasses(&subpasses)
            .dependencies(&self.dependencies);
        self.handle = unsafe { device.create_render_pass(&info, None)? };
        Ok(())
    }

    /// Destroys the handle and forgets the declarations
    pub fn destroy(&mut self, device: &ash::Device) {
        if self.handle != vk::RenderPass::null() {
            unsafe {
                device.destroy_render_pass(self.handle, None);
            }
            self.handle = vk::RenderPass::null();
        }
        self.subpasses.clear();
        self.attachments.clear();
        self.dependencies.clear();
    }

    /// One framebuffer per swapchain image. A null view in `views` stands for the swapchain image.
    pub fn create_framebuffers_for_swapchain(
        &mut self,
        device: &ash::Device,
        swapchain: &Swapchain,
        views: &[vk::ImageView],
    ) -> Result<()> {
        for attachment_views in substitute_swapchain_views(views, &swapchain.image_views) {
            self.push_framebuffer(device, swapchain.extent, &attachment_views, 1)?;
        }
        self.extent = swapchain.extent;
        Ok(())
    }

    pub fn create_framebuffer(
        &mut self,
        device: &ash::Device,
        extent: vk::Extent2D,
        views: &[vk::ImageView],
        layers: u32,
    ) -> Result<()> {
        self.push_framebuffer(device, extent, views, layers)?;
        self.extent = extent;
        Ok(())
    }

    /// Single framebuffer over the views of `images`, sized after the first one
    pub fn create_framebuffer_for_images(&mut self, device: &ash::Device, images: &[&Image]) -> Result<()> {
        let first = images
            .first()
            .ok_or_eyre("Framebuffer needs at least one image")?;
        let views = images.iter().map(|image| image.view()).collect::<AttachmentViews>();
        self.create_framebuffer(device, first.extent(), &views, first.array_layers)
    }

    pub fn destroy_framebuffers(&mut self, device: &ash::Device) {
        for framebuffer in self.framebuffers.drain(..) {
            unsafe {
                device.destroy_framebuffer(framebuffer, None);
            }
        }
    }

    /// Begins the pass on framebuffer `framebuffer_index`. Clear values follow attachment declaration order.
    pub fn begin(
        &self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        render_area: vk::Rect2D,
        clear_values: &[vk::ClearValue],
        framebuffer_index: usize,
    ) -> Result<()> {
        let framebuffer = *self.framebuffers
            .get(framebuffer_index)
            .ok_or_eyre(format!("Render pass has no framebuffer {}", framebuffer_index))?;
        let info = vk::RenderPassBeginInfo::default()
            .render_pass(self.handle)
            .framebuffer(framebuffer)
            .render_area(render_area)
            .clear_values(clear_values);
        unsafe {
            device.cmd_begin_render_pass(cmd, &info, vk::SubpassContents::INLINE);
        }
        Ok(())
    }

    /// Begins over the whole extent the framebuffers were created with
    pub fn begin_full(
        &self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        clear_values: &[vk::ClearValue],
        framebuffer_index: usize,
    ) -> Result<()> {
        let render_area = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: self.extent,
        };
        self.begin(device, cmd, render_area, clear_values, framebuffer_index)
    }

    pub fn end(&self, device: &ash::Device, cmd: vk::CommandBuffer) {
        unsafe {
            device.cmd_end_render_pass(cmd);
        }
    }

    fn push_framebuffer(
        &mut self,
        device: &ash::Device,
        extent: vk::Extent2D,
        views: &[vk::ImageView],
        layers: u32,
    ) -> Result<()> {
        if self.handle == vk::RenderPass::null() {
            return Err(eyre!("Framebuffers need a created render pass"));
        }
        let info = vk::FramebufferCreateInfo::default()
            .render_pass(self.handle)
            .attachments(views)
            .width(extent.width)
            .height(extent.height)
            .layers(layers);
        let framebuffer = unsafe { device.create_framebuffer(&info, None)? };
        self.framebuffers.push(framebuffer);
        Ok(())
    }
}

impl Drop for RenderPass {
    fn drop(&mut self) {
        if self.handle != vk::RenderPass::null() || !self.framebuffers.is_empty() {
            log::error!("Render pass dropped while its handle or framebuffers are alive");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[test]
    fn attachment_indices_follow_declaration_order() {
        let mut pass = RenderPass::new();
        let format = vk::Format::R32G32B32A32_SFLOAT;
        let albedo = pass.add_attachment(color_output_attachment(format));
        let normal = pass.add_attachment(color_output_attachment(format));
        let position = pass.add_attachment(color_output_attachment(format));
        let depth = pass.add_attachment(depth_stencil_attachment(vk::Format::D32_SFLOAT_S8_UINT));
        assert_eq!([albedo, normal, position, depth], [0, 1, 2, 3]);

        for attachment in &pass.attachments()[..3] {
            assert_eq!(attachment.format, format);
            assert_eq!(attachment.load_op, vk::AttachmentLoadOp::CLEAR);
            assert_eq!(attachment.store_op, vk::AttachmentStoreOp::STORE);
            assert_eq!(attachment.final_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        }

        pass.add_subpass(Subpass {
            color_attachments: [albedo, normal, position]
                .iter()
                .map(|i| attachment_ref(*i, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL))
                .collect(),
            input_attachments: Vec::new(),
            depth_stencil_attachment: Some(attachment_ref(depth, vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)),
        });

        let description = pass.subpasses()[0].description();
        assert_eq!(description.color_attachment_count, 3);
        assert_eq!(description.input_attachment_count, 0);
        let depth_ref = unsafe { *description.p_depth_stencil_attachment };
        assert_eq!(depth_ref.attachment, 3);
        assert_eq!(depth_ref.layout, vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);
    }

    #[test]
    fn subpass_without_depth_has_null_depth_reference() {
        let subpass = Subpass {
            color_attachments: vec![attachment_ref(0, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)],
            input_attachments: (1..4)
                .map(|i| attachment_ref(i, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL))
                .collect(),
            depth_stencil_attachment: None,
        };
        let description = subpass.description();
        assert_eq!(description.input_attachment_count, 3);
        assert!(description.p_depth_stencil_attachment.is_null());
    }

    #[test]
    fn null_view_is_replaced_by_each_swapchain_view() {
        let albedo = vk::ImageView::from_raw(10);
        let normal = vk::ImageView::from_raw(11);
        let swapchain_views = [vk::ImageView::from_raw(1), vk::ImageView::from_raw(2), vk::ImageView::from_raw(3)];

        let sets = substitute_swapchain_views(&[vk::ImageView::null(), albedo, normal], &swapchain_views);
        assert_eq!(sets.len(), 3);
        for (set, swapchain_view) in sets.iter().zip(&swapchain_views) {
            assert_eq!(set.as_slice(), &[*swapchain_view, albedo, normal]);
        }
    }

    #[test]
    fn views_without_placeholder_are_shared() {
        let depth = vk::ImageView::from_raw(4);
        let sets = substitute_swapchain_views(&[depth], &[vk::ImageView::from_raw(1), vk::ImageView::from_raw(2)]);
        assert!(sets.iter().all(|set| set.as_slice() == [depth]));
    }

    #[test]
    fn present_and_input_shapes() {
        let present = present_attachment(vk::Format::B8G8R8A8_UNORM);
        assert_eq!(present.final_layout, vk::ImageLayout::PRESENT_SRC_KHR);

        let input = preserved_input_attachment(vk::Format::R32G32B32A32_SFLOAT);
        assert_eq!(input.load_op, vk::AttachmentLoadOp::LOAD);
        assert_eq!(input.initial_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(input.final_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
    }
}
