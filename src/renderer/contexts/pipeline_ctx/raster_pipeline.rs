use ash::vk;
use color_eyre::eyre::{eyre, OptionExt, Result};
use crate::renderer::contexts::device_ctx::swapchain::{full_viewport, Swapchain};
use crate::renderer::contexts::pipeline_ctx::pipeline_layout::PipelineLayout;
use crate::renderer::contexts::pipeline_ctx::shader_program::ShaderProgram;
use crate::renderer::resources::buffer::Buffer;

/// What `execute` draws
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawData {
    /// Vertices generated in the vertex shader from `gl_VertexIndex`
    Generated { vertex_count: u32 },
    Vertices {
        vertex_buffer: vk::Buffer,
        vertex_offset: u64,
        vertex_count: u32,
    },
    Indexed {
        vertex_buffer: vk::Buffer,
        vertex_offset: u64,
        index_buffer: vk::Buffer,
        index_offset: u64,
        index_count: u32,
    },
}

impl DrawData {
    /// Indexed draw over whole buffers, an `index_count` of 0 drawing every u32 index the buffer holds
    pub fn indexed(vertex_buffer: &Buffer, index_buffer: &Buffer, index_count: u32) -> Self {
        let index_count = if index_count > 0 {
            index_count
        } else {
            (index_buffer.size / size_of::<u32>() as u64) as u32
        };
        Self::Indexed {
            vertex_buffer: vertex_buffer.handle(),
            vertex_offset: 0,
            index_buffer: index_buffer.handle(),
            index_offset: 0,
            index_count,
        }
    }
}

/// Color blend state with the usual alpha blending factors
pub fn alpha_blend_attachment(blend_enable: bool) -> vk::PipelineColorBlendAttachmentState {
    vk::PipelineColorBlendAttachmentState {
        blend_enable: blend_enable.into(),
        src_color_blend_factor: vk::BlendFactor::SRC_ALPHA,
        dst_color_blend_factor: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
        color_blend_op: vk::BlendOp::ADD,
        src_alpha_blend_factor: vk::BlendFactor::ONE,
        dst_alpha_blend_factor: vk::BlendFactor::ZERO,
        alpha_blend_op: vk::BlendOp::ADD,
        color_write_mask: vk::ColorComponentFlags::RGBA,
    }
}

/// Graphics pipeline over a shader program, with its fixed-function state exposed for tweaking before `create`
pub struct RasterPipeline {
    pub program: ShaderProgram,

    pub rasterizer: vk::PipelineRasterizationStateCreateInfo<'static>,
    pub multisampling: vk::PipelineMultisampleStateCreateInfo<'static>,
    pub input_assembly: vk::PipelineInputAssemblyStateCreateInfo<'static>,
    pub depth_stencil: vk::PipelineDepthStencilStateCreateInfo<'static>,
    pub color_blend_attachments: Vec<vk::PipelineColorBlendAttachmentState>,
    pub dynamic_states: Vec<vk::DynamicState>,

    render_pass: vk::RenderPass,
    subpass: u32,
    extent: vk::Extent2D,
    draw: DrawData,

    handle: vk::Pipeline,
}

impl RasterPipeline {
    pub fn new(program: ShaderProgram) -> Self {
        Self {
            program,
            rasterizer: vk::PipelineRasterizationStateCreateInfo::default()
                .depth_clamp_enable(true)
                .rasterizer_discard_enable(false)
                .polygon_mode(vk::PolygonMode::FILL)
                .cull_mode(vk::CullModeFlags::BACK)
                .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
                .depth_bias_enable(false)
                .line_width(1.0),
            multisampling: vk::PipelineMultisampleStateCreateInfo::default()
                .rasterization_samples(vk::SampleCountFlags::TYPE_1)
                .sample_shading_enable(true)
                .min_sample_shading(0.2),
            input_assembly: vk::PipelineInputAssemblyStateCreateInfo::default()
                .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
                .primitive_restart_enable(false),
            // Reverse depth: nearer fragments have greater depth
            depth_stencil: vk::PipelineDepthStencilStateCreateInfo::default()
                .depth_test_enable(true)
                .depth_write_enable(true)
                .depth_compare_op(vk::CompareOp::GREATER)
                .depth_bounds_test_enable(false)
                .stencil_test_enable(false)
                .min_depth_bounds(0.0)
                .max_depth_bounds(1.0),
            color_blend_attachments: Vec::new(),
            dynamic_states: Vec::new(),

            render_pass: vk::RenderPass::null(),
            subpass: 0,
            extent: vk::Extent2D::default(),
            draw: DrawData::Generated { vertex_count: 0 },

            handle: vk::Pipeline::null(),
        }
    }

    pub fn handle(&self) -> vk::Pipeline {
        self.handle
    }

    pub fn draw_data(&self) -> DrawData {
        self.draw
    }

    pub fn set_data(&mut self, draw: DrawData) {
        self.draw = draw;
    }

    /// Targets `subpass` of `render_pass` with a viewport covering `extent`
    pub fn set_render_pass(&mut self, extent: vk::Extent2D, render_pass: vk::RenderPass, subpass: u32) {
        self.extent = extent;
        self.render_pass = render_pass;
        self.subpass = subpass;
    }

    pub fn set_render_pass_for_swapchain(&mut self, swapchain: &Swapchain, render_pass: vk::RenderPass, subpass: u32) {
        self.set_render_pass(swapchain.extent, render_pass, subpass);
    }

    pub fn add_color_blend_attachment(&mut self, blend_enable: bool) {
        self.color_blend_attachments.push(alpha_blend_attachment(blend_enable));
    }

    pub fn create(&mut self, device: &ash::Device, layout: &PipelineLayout) -> Result<()> {
        if self.handle != vk::Pipeline::null() {
            return Err(eyre!("Raster pipeline already created"));
        }
        if self.render_pass == vk::RenderPass::null() {
            return Err(eyre!("Raster pipeline has no render pass"));
        }

        self.program.create_shader_stages(device)?;
        let stages = self.program.stage_infos();

        let (viewport, scissor) = full_viewport(self.extent);
        let viewports = [viewport];
        let scissors = [scissor];
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewports(&viewports)
            .scissors(&scissors);

        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(self.program.bindings())
            .vertex_attribute_descriptions(self.program.attributes());

        let color_blending = vk::PipelineColorBlendStateCreateInfo::default()
            .logic_op_enable(false)
            .logic_op(vk::LogicOp::COPY)
            .attachments(&self.color_blend_attachments)
            .blend_constants([0.0; 4]);

        let dynamic_state = vk::PipelineDynamicStateCreateInfo::default()
            .dynamic_states(&self.dynamic_states);

        let mut info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&self.input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&self.rasterizer)
            .multisample_state(&self.multisampling)
            .depth_stencil_state(&self.depth_stencil)
            .color_blend_state(&color_blending)
            .layout(layout.handle())
            .render_pass(self.render_pass)
            .subpass(self.subpass)
            .base_pipeline_index(-1);
        if !self.dynamic_states.is_empty() {
            info = info.dynamic_state(&dynamic_state);
        }

        let result = unsafe {
            device.create_graphics_pipelines(vk::PipelineCache::null(), &[info], None)
        };
        match result {
            Ok(pipelines) => {
                self.handle = pipelines
                    .into_iter()
                    .next()
                    .ok_or_eyre("Graphics pipeline creation returned nothing")?;
                Ok(())
            }
            Err((_, e)) => {
                self.program.destroy_shader_stages(device);
                Err(eyre!("Failed to create graphics pipeline: {}", e))
            }
        }
    }

    /// Destroys the pipeline and its modules. Color blend attachments are cleared so they can be declared again.
    pub fn destroy(&mut self, device: &ash::Device) {
        if self.handle != vk::Pipeline::null() {
            unsafe {
                device.destroy_pipeline(self.handle, None);
            }
            self.handle = vk::Pipeline::null();
        }
        self.program.destroy_shader_stages(device);
        self.color_blend_attachments.clear();
    }

    /// Binds the pipeline and its descriptor sets, pushes the optional constant at index 0 and draws
    pub fn execute(
        &self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        layout: &PipelineLayout,
        instance_count: u32,
        push_constant: Option<&[u8]>,
    ) -> Result<()> {
        unsafe {
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, self.handle);
        }
        layout.bind(device, cmd, vk::PipelineBindPoint::GRAPHICS);
        if let Some(bytes) = push_constant {
            self.push_constant(device, cmd, layout, 0, bytes)?;
        }
        self.draw(device, cmd, instance_count);
        Ok(())
    }

    pub fn push_constant(
        &self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        layout: &PipelineLayout,
        index: usize,
        bytes: &[u8],
    ) -> Result<()> {
        layout.push_constant(device, cmd, index, bytes)
    }

    fn draw(&self, device: &ash::Device, cmd: vk::CommandBuffer, instance_count: u32) {
        unsafe {
            match self.draw {
                DrawData::Generated { vertex_count } => {
                    device.cmd_draw(cmd, vertex_count, instance_count, 0, 0);
                }
                DrawData::Vertices { vertex_buffer, vertex_offset, vertex_count } => {
                    device.cmd_bind_vertex_buffers(cmd, 0, &[vertex_buffer], &[vertex_offset]);
                    device.cmd_draw(cmd, vertex_count, instance_count, 0, 0);
                }
                DrawData::Indexed { vertex_buffer, vertex_offset, index_buffer, index_offset, index_count } => {
                    device.cmd_bind_vertex_buffers(cmd, 0, &[vertex_buffer], &[vertex_offset]);
                    device.cmd_bind_index_buffer(cmd, index_buffer, index_offset, vk::IndexType::UINT32);
                    // Vertex offset is already applied to the bound buffer
                    device.cmd_draw_indexed(cmd, index_count, instance_count, 0, 0, 0);
                }
            }
        }
    }
}

impl Drop for RasterPipeline {
    fn drop(&mut self) {
        if self.handle != vk::Pipeline::null() {
            log::error!("Raster pipeline dropped without being destroyed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::resources::shader::ShaderStage;

    fn lighting_pipeline() -> RasterPipeline {
        RasterPipeline::new(ShaderProgram::new(&[
            (ShaderStage::Vertex, "lighting"),
            (ShaderStage::Fragment, "lighting"),
        ]))
    }

    #[test]
    fn defaults_use_reverse_depth_and_back_culling() {
        let pipeline = lighting_pipeline();
        assert_eq!(pipeline.depth_stencil.depth_compare_op, vk::CompareOp::GREATER);
        assert_eq!(pipeline.depth_stencil.depth_test_enable, vk::TRUE);
        assert_eq!(pipeline.rasterizer.cull_mode, vk::CullModeFlags::BACK);
        assert_eq!(pipeline.rasterizer.front_face, vk::FrontFace::COUNTER_CLOCKWISE);
        assert_eq!(pipeline.rasterizer.line_width, 1.0);
        assert_eq!(pipeline.input_assembly.topology, vk::PrimitiveTopology::TRIANGLE_LIST);
        assert_eq!(pipeline.multisampling.rasterization_samples, vk::SampleCountFlags::TYPE_1);
        assert_eq!(pipeline.handle(), vk::Pipeline::null());
    }

    #[test]
    fn blend_attachment_defaults_to_alpha_blending() {
        let mut pipeline = lighting_pipeline();
        pipeline.add_color_blend_attachment(false);
        pipeline.add_color_blend_attachment(true);
        let [opaque, blended] = pipeline.color_blend_attachments.as_slice() else {
            panic!("expected two attachments");
        };
        assert_eq!(opaque.blend_enable, vk::FALSE);
        assert_eq!(blended.blend_enable, vk::TRUE);
        assert_eq!(blended.src_color_blend_factor, vk::BlendFactor::SRC_ALPHA);
        assert_eq!(blended.dst_color_blend_factor, vk::BlendFactor::ONE_MINUS_SRC_ALPHA);
        assert_eq!(blended.color_write_mask, vk::ColorComponentFlags::RGBA);
    }

    #[test]
    fn indexed_draw_counts_indices_from_buffer_size() {
        let vertices = Buffer::new("vertices", vk::BufferUsageFlags::VERTEX_BUFFER, 1024);
        let indices = Buffer::new("indices", vk::BufferUsageFlags::INDEX_BUFFER, 36 * 4);

        match DrawData::indexed(&vertices, &indices, 0) {
            DrawData::Indexed { index_count, vertex_offset, .. } => {
                assert_eq!(index_count, 36);
                assert_eq!(vertex_offset, 0);
            }
            other => panic!("unexpected draw data {:?}", other),
        }
        assert!(matches!(
            DrawData::indexed(&vertices, &indices, 6),
            DrawData::Indexed { index_count: 6, .. }
        ));
    }

    #[test]
    fn render_pass_target_sets_viewport_extent() {
        let mut pipeline = lighting_pipeline();
        pipeline.set_data(DrawData::Generated { vertex_count: 3 });
        assert_eq!(pipeline.draw_data(), DrawData::Generated { vertex_count: 3 });
        pipeline.set_render_pass(vk::Extent2D { width: 640, height: 480 }, vk::RenderPass::null(), 0);
        assert_eq!(pipeline.extent, vk::Extent2D { width: 640, height: 480 });
    }
}
