use std::io::Cursor;
use std::path::{Path, PathBuf};
use ash::vk;
use color_eyre::eyre::{eyre, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    TessellationControl,
    TessellationEvaluation,
    Geometry,
    Fragment,
    Compute,
    Mesh,
    Task,
    RayGen,
    Intersection,
    AnyHit,
    ClosestHit,
    Miss,
    Callable,
}

impl ShaderStage {
    pub const ALL: [ShaderStage; 14] = [
        Self::Vertex,
        Self::TessellationControl,
        Self::TessellationEvaluation,
        Self::Geometry,
        Self::Fragment,
        Self::Compute,
        Self::Mesh,
        Self::Task,
        Self::RayGen,
        Self::Intersection,
        Self::AnyHit,
        Self::ClosestHit,
        Self::Miss,
        Self::Callable,
    ];

    /// File suffix placed between the shader name and `.spv`
    pub fn suffix(self) -> &'static str {
        match self {
            Self::Vertex => "vert",
            Self::TessellationControl => "tesc",
            Self::TessellationEvaluation => "tese",
            Self::Geometry => "geom",
            Self::Fragment => "frag",
            Self::Compute => "comp",
            Self::Mesh => "mesh",
            Self::Task => "task",
            Self::RayGen => "rgen",
            Self::Intersection => "rint",
            Self::AnyHit => "rahit",
            Self::ClosestHit => "rchit",
            Self::Miss => "rmiss",
            Self::Callable => "rcall",
        }
    }

    pub fn flags(self) -> vk::ShaderStageFlags {
        match self {
            Self::Vertex => vk::ShaderStageFlags::VERTEX,
            Self::TessellationControl => vk::ShaderStageFlags::TESSELLATION_CONTROL,
            Self::TessellationEvaluation => vk::ShaderStageFlags::TESSELLATION_EVALUATION,
            Self::Geometry => vk::ShaderStageFlags::GEOMETRY,
            Self::Fragment => vk::ShaderStageFlags::FRAGMENT,
            Self::Compute => vk::ShaderStageFlags::COMPUTE,
            Self::Mesh => vk::ShaderStageFlags::MESH_EXT,
            Self::Task => vk::ShaderStageFlags::TASK_EXT,
            Self::RayGen => vk::ShaderStageFlags::RAYGEN_KHR,
            Self::Intersection => vk::ShaderStageFlags::INTERSECTION_KHR,
            Self::AnyHit => vk::ShaderStageFlags::ANY_HIT_KHR,
            Self::ClosestHit => vk::ShaderStageFlags::CLOSEST_HIT_KHR,
            Self::Miss => vk::ShaderStageFlags::MISS_KHR,
            Self::Callable => vk::ShaderStageFlags::CALLABLE_KHR,
        }
    }

    pub fn from_suffix(suffix: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|stage| stage.suffix() == suffix)
    }
}

/// Path of the compiled module for `name` at `stage`: `<dir>/<name>.<suffix>.spv`
pub fn shader_path(dir: &Path, name: &str, stage: ShaderStage) -> PathBuf {
    dir.join(format!("{}.{}.spv", name, stage.suffix()))
}

/// SPIR-V bytecode for one stage, loaded from disk and turned into a module on demand
pub struct Shader {
    pub stage: ShaderStage,
    pub name: String,
    pub entry_point: String,
    bytecode: Vec<u32>,
}

impl Shader {
    pub fn new(stage: ShaderStage, name: &str) -> Self {
        Self {
            stage,
            name: name.into(),
            entry_point: "main".into(),
            bytecode: Vec::new(),
        }
    }

    pub fn is_loaded(&self) -> bool {
        !self.bytecode.is_empty()
    }

    pub fn bytecode(&self) -> &[u32] {
        &self.bytecode
    }

    pub fn read(&mut self, dir: &Path) -> Result<()> {
        let path = shader_path(dir, &self.name, self.stage);
        let bytes = std::fs::read(&path)
            .map_err(|e| eyre!("Failed to read shader {:?}: {}", path, e))?;
        self.bytecode = decode_spirv(&bytes)
            .map_err(|e| eyre!("Shader {:?}: {}", path, e))?;
        log::debug!("Read shader {:?} ({} words)", path, self.bytecode.len());
        Ok(())
    }

    pub fn create_module(&self, device: &ash::Device) -> Result<vk::ShaderModule> {
        if !self.is_loaded() {
            return Err(eyre!("Shader '{}.{}' has not been read", self.name, self.stage.suffix()));
        }
        let info = vk::ShaderModuleCreateInfo::default().code(&self.bytecode);
        Ok(unsafe { device.create_shader_module(&info, None)? })
    }
}

const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Reads a SPIR-V file as words, swapping byte order when the magic number says so
pub fn decode_spirv(bytes: &[u8]) -> Result<Vec<u32>> {
    let words = ash::util::read_spv(&mut Cursor::new(bytes))?;
    match words.first() {
        Some(&SPIRV_MAGIC) => Ok(words),
        Some(magic) => Err(eyre!("Bad SPIR-V magic number {:#010x}", magic)),
        None => Err(eyre!("SPIR-V module is empty")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_stage_round_trips_through_its_suffix() {
        for stage in ShaderStage::ALL {
            assert_eq!(ShaderStage::from_suffix(stage.suffix()), Some(stage));
        }
        assert_eq!(ShaderStage::from_suffix("glsl"), None);
    }

    #[test]
    fn stage_flags_are_distinct() {
        let combined = ShaderStage::ALL
            .iter()
            .fold(vk::ShaderStageFlags::empty(), |acc, stage| {
                assert!(!acc.intersects(stage.flags()));
                acc | stage.flags()
            });
        assert!(combined.contains(vk::ShaderStageFlags::ALL_GRAPHICS));
    }

    #[test]
    fn path_follows_name_suffix_convention() {
        let path = shader_path(Path::new("shaders-built"), "lighting", ShaderStage::Fragment);
        assert_eq!(path, Path::new("shaders-built/lighting.frag.spv"));
    }

    #[test]
    fn spirv_decoding_checks_magic_and_length() {
        let mut bytes = SPIRV_MAGIC.to_ne_bytes().to_vec();
        bytes.extend_from_slice(&0x0001_0000u32.to_ne_bytes());
        assert_eq!(decode_spirv(&bytes).unwrap(), vec![SPIRV_MAGIC, 0x0001_0000]);

        assert!(decode_spirv(&bytes[..6]).is_err());
        assert!(decode_spirv(&[]).is_err());
        assert!(decode_spirv(&[0u8; 8]).is_err());
    }

    #[test]
    fn unread_shader_cannot_be_read_from_missing_dir() {
        let mut shader = Shader::new(ShaderStage::Vertex, "missing");
        assert!(!shader.is_loaded());
        assert!(shader.read(Path::new("/nonexistent-shader-dir")).is_err());
    }
}
