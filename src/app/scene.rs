use std::path::Path;
use std::sync::{Arc, Mutex};
use ash::vk;
use color_eyre::eyre::{eyre, OptionExt, Result};
use glam::Vec3;
use crate::renderer::camera::Camera;
use crate::renderer::contexts::device_ctx::device::PhysicalDeviceInfo;
use crate::renderer::contexts::graph_ctx::render_pass::{
    attachment_ref, color_output_attachment, depth_stencil_attachment, preserved_input_attachment,
    present_attachment, RenderPass, Subpass,
};
use crate::renderer::contexts::pipeline_ctx::pipeline_layout::PipelineLayout;
use crate::renderer::contexts::pipeline_ctx::raster_pipeline::{DrawData, RasterPipeline};
use crate::renderer::contexts::pipeline_ctx::shader_program::ShaderProgram;
use crate::renderer::contexts::resource_ctx::descriptor_set::DescriptorSet;
use crate::renderer::contexts::resource_ctx::storage::{BufferHandle, ImageHandle};
use crate::renderer::contexts::resource_ctx::RenderResourceContext;
use crate::renderer::phases::{GraphicsContext, RenderPhases};
use crate::renderer::resources::image::Image;
use crate::renderer::resources::shader::ShaderStage;
use crate::renderer::resources::staged_buffer::StagedBuffer;
use crate::renderer::shader_data::{CameraUniform, LightSource};

const CUBE_COUNT: u32 = 3;
const CUBE_VERTEX_COUNT: u32 = 36;

#[derive(Debug, Clone, Copy)]
struct SceneHandles {
    camera_buffer: BufferHandle,
    depth: ImageHandle,
    albedo: ImageHandle,
    normal: ImageHandle,
    position: ImageHandle,
}

/// Deferred scene: a geometry pass fills the albedo, normal and position G-buffers,
/// then a lighting pass reads them as input attachments and shades the swapchain image
pub struct DeferredScene {
    pub camera: Arc<Mutex<Camera>>,
    pub lights: Vec<LightSource>,
    camera_uniform: Arc<Mutex<CameraUniform>>,
    handles: Option<SceneHandles>,

    rasterization_layout: PipelineLayout,
    lighting_layout: PipelineLayout,
    primitives: RasterPipeline,
    lighting: RasterPipeline,

    geometry_pass: RenderPass,
    lighting_pass: RenderPass,
}

impl DeferredScene {
    pub fn new(camera: Arc<Mutex<Camera>>) -> Self {
        Self {
            camera,
            lights: Vec::new(),
            camera_uniform: Arc::new(Mutex::new(CameraUniform::default())),
            handles: None,

            rasterization_layout: PipelineLayout::new(),
            lighting_layout: PipelineLayout::new(),
            primitives: RasterPipeline::new(ShaderProgram::new(&[
                (ShaderStage::Vertex, "primitives"),
                (ShaderStage::Fragment, "primitives"),
            ])),
            lighting: RasterPipeline::new(ShaderProgram::new(&[
                (ShaderStage::Vertex, "lighting"),
                (ShaderStage::Fragment, "lighting"),
            ])),

            geometry_pass: RenderPass::new(),
            lighting_pass: RenderPass::new(),
        }
    }

    fn handles(&self) -> Result<SceneHandles> {
        self.handles.ok_or_eyre("Scene layouts are not initialized")
    }

    fn declare_geometry_pass(&mut self, albedo: &Image, normal: &Image, position: &Image, depth: &Image) {
        let pass = &mut self.geometry_pass;
        let albedo_index = pass.add_attachment(color_output_attachment(albedo.format));
        let normal_index = pass.add_attachment(color_output_attachment(normal.format));
        let position_index = pass.add_attachment(color_output_attachment(position.format));
        let depth_index = pass.add_attachment(depth_stencil_attachment(depth.format));

        pass.add_subpass(Subpass {
            color_attachments: vec![
                attachment_ref(albedo_index, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL),
                attachment_ref(normal_index, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL),
                attachment_ref(position_index, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL),
            ],
            input_attachments: Vec::new(),
            depth_stencil_attachment: Some(
                attachment_ref(depth_index, vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL),
            ),
        });

        // The previous frame's lighting pass may still read the G-buffers
        pass.add_dependency(vk::SubpassDependency {
            src_subpass: vk::SUBPASS_EXTERNAL,
            dst_subpass: 0,
            src_stage_mask: vk::PipelineStageFlags::FRAGMENT_SHADER,
            dst_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
            src_access_mask: vk::AccessFlags::INPUT_ATTACHMENT_READ,
            dst_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            dependency_flags: vk::DependencyFlags::BY_REGION,
        });
        pass.add_dependency(vk::SubpassDependency {
            src_subpass: 0,
            dst_subpass: vk::SUBPASS_EXTERNAL,
            src_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            dst_stage_mask: vk::PipelineStageFlags::FRAGMENT_SHADER,
            src_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            dst_access_mask: vk::AccessFlags::INPUT_ATTACHMENT_READ,
            dependency_flags: vk::DependencyFlags::BY_REGION,
        });
    }

    fn declare_lighting_pass(&mut self, swapchain_format: vk::Format, albedo: &Image, normal: &Image, position: &Image) {
        let pass = &mut self.lighting_pass;
        let color_index = pass.add_attachment(present_attachment(swapchain_format));
        let input_indices = [albedo, normal, position]
            .map(|image| pass.add_attachment(preserved_input_attachment(image.format)));

        pass.add_subpass(Subpass {
            color_attachments: vec![
                attachment_ref(color_index, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL),
            ],
            input_attachments: input_indices
                .iter()
                .map(|index| attachment_ref(*index, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL))
                .collect(),
            depth_stencil_attachment: None,
        });

        // Waits for the acquired image and for the geometry pass of the same frame
        pass.add_dependency(vk::SubpassDependency {
            src_subpass: vk::SUBPASS_EXTERNAL,
            dst_subpass: 0,
            src_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            dst_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                | vk::PipelineStageFlags::FRAGMENT_SHADER,
            src_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            dst_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                | vk::AccessFlags::INPUT_ATTACHMENT_READ,
            dependency_flags: vk::DependencyFlags::empty(),
        });
    }
}

/// Accumulates every light into the swapchain image
fn additive_blend_attachment() -> vk::PipelineColorBlendAttachmentState {
    vk::PipelineColorBlendAttachmentState {
        blend_enable: vk::TRUE,
        src_color_blend_factor: vk::BlendFactor::ONE,
        dst_color_blend_factor: vk::BlendFactor::ONE,
        color_blend_op: vk::BlendOp::ADD,
        src_alpha_blend_factor: vk::BlendFactor::ONE,
        dst_alpha_blend_factor: vk::BlendFactor::ZERO,
        alpha_blend_op: vk::BlendOp::ADD,
        color_write_mask: vk::ColorComponentFlags::RGBA,
    }
}

impl RenderPhases for DeferredScene {
    fn score_physical_device(&self, score: &mut i32, info: &PhysicalDeviceInfo) {
        if info.device_type == vk::PhysicalDeviceType::DISCRETE_GPU {
            *score += 10;
        }
    }

    fn init_layouts(&mut self, resources: &mut RenderResourceContext) -> Result<()> {
        let storage = &mut resources.storage;

        let mut camera_buffer = StagedBuffer::new(
            "camera uniform",
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            size_of::<CameraUniform>() as u64,
        );
        camera_buffer.add_src_data(self.camera_uniform.clone());
        let camera_buffer = storage.add_staged_buffer(camera_buffer);

        let gbuffer_usage = vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::INPUT_ATTACHMENT;
        let depth = storage.add_image(Image::depth_stencil("depth", vk::ImageUsageFlags::empty()));
        let albedo = storage.add_image(Image::new(
            "gbuffer albedo",
            gbuffer_usage,
            1,
            1,
            &[vk::Format::R32G32B32A32_SFLOAT],
        ));
        let normal = storage.add_image(Image::new(
            "gbuffer normal",
            gbuffer_usage,
            1,
            1,
            &[vk::Format::R16G16B16_SNORM, vk::Format::R16G16B16A16_SNORM],
        ));
        let position = storage.add_image(Image::new(
            "gbuffer position",
            gbuffer_usage,
            1,
            1,
            &[vk::Format::R32G32B32_SFLOAT, vk::Format::R32G32B32A32_SFLOAT],
        ));

        // Camera and such
        let mut base_set = DescriptorSet::new(0);
        base_set.add_uniform_buffer(0, vk::ShaderStageFlags::ALL_GRAPHICS, camera_buffer);
        let base_set = resources.descriptor_sets.add(base_set);

        let mut gbuffer_set = DescriptorSet::new(1);
        gbuffer_set
            .add_input_attachment(0, vk::ShaderStageFlags::FRAGMENT, albedo)
            .add_input_attachment(1, vk::ShaderStageFlags::FRAGMENT, normal)
            .add_input_attachment(2, vk::ShaderStageFlags::FRAGMENT, position);
        let gbuffer_set = resources.descriptor_sets.add(gbuffer_set);

        self.rasterization_layout.add_descriptor_set(base_set);
        self.lighting_layout
            .add_descriptor_set(base_set)
            .add_descriptor_set(gbuffer_set);
        self.lighting_layout.add_push_constant::<LightSource>(vk::ShaderStageFlags::FRAGMENT);

        self.handles = Some(SceneHandles {
            camera_buffer,
            depth,
            albedo,
            normal,
            position,
        });
        Ok(())
    }

    fn configure_shaders(&mut self) -> Result<()> {
        // Geometry
        self.primitives.input_assembly.topology = vk::PrimitiveTopology::TRIANGLE_LIST;
        self.primitives.depth_stencil.depth_test_enable = vk::TRUE;
        self.primitives.depth_stencil.depth_write_enable = vk::TRUE;
        self.primitives.rasterizer.cull_mode = vk::CullModeFlags::NONE;
        self.primitives.set_data(DrawData::Generated { vertex_count: CUBE_VERTEX_COUNT });

        // Lighting
        self.lighting.input_assembly.topology = vk::PrimitiveTopology::TRIANGLE_STRIP;
        self.lighting.depth_stencil.depth_test_enable = vk::FALSE;
        self.lighting.depth_stencil.depth_write_enable = vk::FALSE;
        self.lighting.rasterizer.cull_mode = vk::CullModeFlags::NONE;
        self.lighting.set_data(DrawData::Generated { vertex_count: 3 });
        Ok(())
    }

    fn read_shaders(&mut self, shader_dir: &Path) -> Result<()> {
        self.primitives.program.read_shaders(shader_dir)?;
        self.lighting.program.read_shaders(shader_dir)
    }

    fn create_resources(&mut self, ctx: &mut GraphicsContext) -> Result<()> {
        let handles = self.handles()?;
        let extent = ctx.swapchain.extent;
        for image in [handles.depth, handles.albedo, handles.normal, handles.position] {
            ctx.resources.storage
                .image_mut(image)?
                .create(ctx.device, extent.width, extent.height, &[])?;
        }

        let mut camera = self.camera.lock().map_err(|e| eyre!(e.to_string()))?;
        camera.width = extent.width;
        camera.height = extent.height;
        camera.refresh_projection_matrix();
        Ok(())
    }

    fn destroy_resources(&mut self, ctx: &mut GraphicsContext) {
        ctx.resources.storage.destroy_images();
    }

    fn allocate_buffers(&mut self, ctx: &mut GraphicsContext) -> Result<()> {
        let handles = self.handles()?;
        ctx.resources.storage
            .staged_buffer_mut(handles.camera_buffer)?
            .allocate(ctx.device)
    }

    fn free_buffers(&mut self, ctx: &mut GraphicsContext) {
        ctx.resources.storage.free_buffers();
    }

    fn create_pipelines(&mut self, ctx: &mut GraphicsContext) -> Result<()> {
        let handles = self.handles()?;
        let device = ctx.device.logical.as_ref();
        let storage = &ctx.resources.storage;
        let depth = storage.image(handles.depth)?;
        let albedo = storage.image(handles.albedo)?;
        let normal = storage.image(handles.normal)?;
        let position = storage.image(handles.position)?;

        self.declare_geometry_pass(albedo, normal, position, depth);
        self.geometry_pass.create(device)?;
        self.geometry_pass.create_framebuffer_for_images(device, &[albedo, normal, position, depth])?;

        self.declare_lighting_pass(ctx.swapchain.format, albedo, normal, position);
        self.lighting_pass.create(device)?;
        self.lighting_pass.create_framebuffers_for_swapchain(
            device,
            ctx.swapchain,
            &[vk::ImageView::null(), albedo.view(), normal.view(), position.view()],
        )?;

        self.rasterization_layout.create(device, &ctx.resources.descriptor_sets)?;
        self.lighting_layout.create(device, &ctx.resources.descriptor_sets)?;

        self.primitives.set_render_pass(ctx.swapchain.extent, self.geometry_pass.handle(), 0);
        for _ in 0..3 {
            self.primitives.add_color_blend_attachment(false);
        }
        self.primitives.create(device, &self.rasterization_layout)?;

        self.lighting.set_render_pass_for_swapchain(ctx.swapchain, self.lighting_pass.handle(), 0);
        self.lighting.color_blend_attachments.push(additive_blend_attachment());
        self.lighting.create(device, &self.lighting_layout)?;
        Ok(())
    }

    fn destroy_pipelines(&mut self, ctx: &mut GraphicsContext) {
        let device = ctx.device.logical.as_ref();
        self.primitives.destroy(device);
        self.lighting.destroy(device);
        self.rasterization_layout.destroy(device);
        self.lighting_layout.destroy(device);
        for pass in [&mut self.geometry_pass, &mut self.lighting_pass] {
            pass.destroy_framebuffers(device);
            pass.destroy(device);
        }
    }

    fn record_graphics_command_buffer(
        &self,
        ctx: &GraphicsContext,
        cmd: vk::CommandBuffer,
        image_index: usize,
    ) -> Result<()> {
        let device = ctx.device.logical.as_ref();
        let black = vk::ClearValue {
            color: vk::ClearColorValue { float32: [0.0, 0.0, 0.0, 1.0] },
        };
        self.lighting_pass.begin_full(device, cmd, &[black; 4], image_index)?;
        for light in &self.lights {
            self.lighting.execute(device, cmd, &self.lighting_layout, 1, Some(bytemuck::bytes_of(light)))?;
        }
        self.lighting_pass.end(device, cmd);
        Ok(())
    }

    fn run_dynamic_graphics(
        &mut self,
        ctx: &mut GraphicsContext,
        cmd: vk::CommandBuffer,
        _image_index: usize,
    ) -> Result<()> {
        let handles = self.handles()?;
        ctx.resources.storage
            .staged_buffer_mut(handles.camera_buffer)?
            .update(ctx.device, cmd)?;

        let device = ctx.device.logical.as_ref();
        let transparent = vk::ClearValue {
            color: vk::ClearColorValue { float32: [0.0; 4] },
        };
        // Reverse depth clears to the far plane at 0
        let far = vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue { depth: 0.0, stencil: 0 },
        };
        self.geometry_pass.begin_full(device, cmd, &[transparent, transparent, transparent, far], 0)?;
        self.primitives.execute(device, cmd, &self.rasterization_layout, CUBE_COUNT, None)?;
        self.geometry_pass.end(device, cmd);
        Ok(())
    }

    fn frame_update(&mut self, _image_index: usize) -> Result<()> {
        let uniform = {
            let mut camera = self.camera.lock().map_err(|e| eyre!(e.to_string()))?;
            camera.refresh_view_matrix();
            camera.uniform()
        };
        *self.camera_uniform.lock().map_err(|e| eyre!(e.to_string()))? = uniform;
        Ok(())
    }

    fn load_scene(&mut self) -> Result<()> {
        self.lights = vec![
            LightSource::point(Vec3::new(0.0, 0.0, 5.0), Vec3::ONE, 40.0),
            LightSource::point(Vec3::new(-4.0, 2.0, 1.0), Vec3::new(1.0, 0.4, 0.2), 20.0),
            LightSource::spot(
                Vec3::new(4.0, 0.0, 3.0),
                Vec3::new(-1.0, 1.0, -1.0),
                Vec3::new(0.3, 0.5, 1.0),
                30.0,
                0.3,
                0.5,
            ),
        ];
        Ok(())
    }

    fn unload_scene(&mut self) {
        self.lights.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scene() -> DeferredScene {
        DeferredScene::new(Arc::new(Mutex::new(Camera::new())))
    }

    #[test]
    fn layouts_declare_camera_and_gbuffer_sets() {
        let mut scene = scene();
        let mut resources = RenderResourceContext::new();
        scene.init_layouts(&mut resources).unwrap();

        assert_eq!(resources.descriptor_sets.len(), 2);
        let [base_set, gbuffer_set] = scene.lighting_layout.descriptor_sets() else {
            panic!("lighting layout should reference two sets");
        };
        let base = resources.descriptor_sets.get(*base_set).unwrap();
        assert_eq!(base.set, 0);
        assert_eq!(
            base.bindings().map(|b| b.descriptor_type()).collect::<Vec<_>>(),
            vec![vk::DescriptorType::UNIFORM_BUFFER]
        );
        let gbuffers = resources.descriptor_sets.get(*gbuffer_set).unwrap();
        assert_eq!(gbuffers.bindings().count(), 3);
        assert!(gbuffers.bindings().all(|b| b.descriptor_type() == vk::DescriptorType::INPUT_ATTACHMENT));

        assert_eq!(gbuffers.set, 1);
        assert_eq!(scene.rasterization_layout.descriptor_sets(), &[*base_set]);
        let light_range = scene.lighting_layout.push_constant_range(0).unwrap();
        assert_eq!(light_range.size as usize, size_of::<LightSource>());
    }

    #[test]
    fn lighting_draws_one_unculled_strip() {
        let mut scene = scene();
        scene.configure_shaders().unwrap();
        assert_eq!(scene.lighting.input_assembly.topology, vk::PrimitiveTopology::TRIANGLE_STRIP);
        assert_eq!(scene.lighting.rasterizer.cull_mode, vk::CullModeFlags::NONE);
        assert_eq!(scene.lighting.depth_stencil.depth_test_enable, vk::FALSE);
        assert_eq!(scene.lighting.draw_data(), DrawData::Generated { vertex_count: 3 });
        assert_eq!(scene.primitives.depth_stencil.depth_write_enable, vk::TRUE);
    }

    #[test]
    fn frame_update_publishes_camera() {
        let mut scene = scene();
        scene.camera.lock().unwrap().world_position = Vec3::new(1.0, 2.0, 3.0);
        scene.frame_update(0).unwrap();
        let uniform = *scene.camera_uniform.lock().unwrap();
        assert_eq!(uniform.position_fov.truncate(), Vec3::new(1.0, 2.0, 3.0));
        assert_ne!(uniform.view, glam::Mat4::IDENTITY);
    }

    #[test]
    fn scene_loads_and_unloads_lights() {
        let mut scene = scene();
        scene.load_scene().unwrap();
        assert_eq!(scene.lights.len(), 3);
        scene.unload_scene();
        assert!(scene.lights.is_empty());
    }

    #[test]
    fn every_configured_shader_is_built() {
        let shader_dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("shaders-built");
        let mut scene = scene();
        scene.configure_shaders().unwrap();
        scene.read_shaders(&shader_dir).unwrap();
        assert!(scene.primitives.program.shaders().iter().all(|shader| shader.is_loaded()));
        assert!(scene.lighting.program.shaders().iter().all(|shader| shader.is_loaded()));
    }
}
