use std::ffi::CString;
use std::path::Path;
use ash::vk;
use color_eyre::Result;
use crate::renderer::resources::shader::{Shader, ShaderStage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexAttribute {
    pub location: u32,
    pub offset: u32,
    pub format: vk::Format,
}

/// The stages of one pipeline, their modules and the vertex input they expect
pub struct ShaderProgram {
    shaders: Vec<Shader>,
    modules: Vec<vk::ShaderModule>,
    entry_points: Vec<CString>,

    bindings: Vec<vk::VertexInputBindingDescription>,
    attributes: Vec<vk::VertexInputAttributeDescription>,
}

impl ShaderProgram {
    pub fn new(stages: &[(ShaderStage, &str)]) -> Self {
        Self {
            shaders: stages
                .iter()
                .map(|(stage, name)| Shader::new(*stage, name))
                .collect(),
            modules: Vec::new(),
            entry_points: Vec::new(),
            bindings: Vec::new(),
            attributes: Vec::new(),
        }
    }

    pub fn shaders(&self) -> &[Shader] {
        &self.shaders
    }

    /// Declares the next vertex buffer binding and its attributes
    pub fn add_vertex_input_binding(
        &mut self,
        stride: u32,
        input_rate: vk::VertexInputRate,
        attributes: &[VertexAttribute],
    ) {
        let binding = self.bindings.len() as u32;
        self.add_vertex_input_binding_at(binding, stride, input_rate, attributes);
    }

    pub fn add_vertex_input_binding_at(
        &mut self,
        binding: u32,
        stride: u32,
        input_rate: vk::VertexInputRate,
        attributes: &[VertexAttribute],
    ) {
        self.bindings.push(vk::VertexInputBindingDescription {
            binding,
            stride,
            input_rate,
        });
        self.attributes.extend(attributes.iter().map(|attr| vk::VertexInputAttributeDescription {
            location: attr.location,
            binding,
            format: attr.format,
            offset: attr.offset,
        }));
    }

    pub fn bindings(&self) -> &[vk::VertexInputBindingDescription] {
        &self.bindings
    }

    pub fn attributes(&self) -> &[vk::VertexInputAttributeDescription] {
        &self.attributes
    }

    pub fn read_shaders(&mut self, dir: &Path) -> Result<()> {
        for shader in &mut self.shaders {
            shader.read(dir)?;
        }
        Ok(())
    }

    /// Clears the vertex input declarations
    pub fn reset(&mut self) {
        self.bindings.clear();
        self.attributes.clear();
    }

    /// Creates one module per stage. Does nothing when the modules already exist.
    pub fn create_shader_stages(&mut self, device: &ash::Device) -> Result<()> {
        if !self.modules.is_empty() {
            return Ok(());
        }
        for shader in &self.shaders {
            let entry_point = CString::new(shader.entry_point.as_str())?;
            match shader.create_module(device) {
                Ok(module) => {
                    self.modules.push(module);
                    self.entry_points.push(entry_point);
                }
                Err(e) => {
                    self.destroy_shader_stages(device);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    pub fn stage_infos(&self) -> Vec<vk::PipelineShaderStageCreateInfo<'_>> {
        self.shaders
            .iter()
            .zip(&self.modules)
            .zip(&self.entry_points)
            .map(|((shader, module), entry_point)| {
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(shader.stage.flags())
                    .module(*module)
                    .name(entry_point)
            })
            .collect()
    }

    pub fn destroy_shader_stages(&mut self, device: &ash::Device) {
        for module in self.modules.drain(..) {
            unsafe {
                device.destroy_shader_module(module, None);
            }
        }
        self.entry_points.clear();
    }
}

impl Drop for ShaderProgram {
    fn drop(&mut self) {
        if !self.modules.is_empty() {
            log::error!("Shader program dropped with {} live modules", self.modules.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bindings_are_numbered_in_declaration_order() {
        let mut program = ShaderProgram::new(&[
            (ShaderStage::Vertex, "primitives"),
            (ShaderStage::Fragment, "primitives"),
        ]);
        program.add_vertex_input_binding(
            32,
            vk::VertexInputRate::VERTEX,
            &[
                VertexAttribute { location: 0, offset: 0, format: vk::Format::R32G32B32A32_SFLOAT },
                VertexAttribute { location: 1, offset: 16, format: vk::Format::R32G32B32A32_SFLOAT },
            ],
        );
        program.add_vertex_input_binding(
            64,
            vk::VertexInputRate::INSTANCE,
            &[VertexAttribute { location: 2, offset: 0, format: vk::Format::R32G32B32A32_SFLOAT }],
        );

        assert_eq!(program.bindings().len(), 2);
        assert_eq!(program.bindings()[1].binding, 1);
        assert_eq!(program.bindings()[1].input_rate, vk::VertexInputRate::INSTANCE);
        let attribute_bindings = program.attributes().iter().map(|a| a.binding).collect::<Vec<_>>();
        assert_eq!(attribute_bindings, vec![0, 0, 1]);
        assert_eq!(program.attributes()[1].offset, 16);

        program.reset();
        assert!(program.bindings().is_empty());
        assert!(program.attributes().is_empty());
        assert_eq!(program.shaders().len(), 2);
    }

    #[test]
    fn stages_keep_their_declared_kind() {
        let program = ShaderProgram::new(&[
            (ShaderStage::Vertex, "lighting"),
            (ShaderStage::Fragment, "lighting"),
        ]);
        let stages = program.shaders().iter().map(|s| s.stage).collect::<Vec<_>>();
        assert_eq!(stages, vec![ShaderStage::Vertex, ShaderStage::Fragment]);
        assert!(program.stage_infos().is_empty());
    }
}
