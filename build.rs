use color_eyre::Result;
use color_eyre::eyre::{eyre, OptionExt, WrapErr};
use naga::{
    back::spv, front::glsl::{Frontend, Options},
    valid::{Capabilities, ValidationFlags, Validator},
    ShaderStage
};
use std::{env, fs, path::Path};

fn main() -> Result<()> {
    println!("cargo:rerun-if-changed=shaders");

    compile_shaders()?;

    Ok(())
}

/// Compiles `shaders/<name>.<stage>` into `shaders-built/<name>.<stage>.spv`.
/// shaderc is used when its native library loads, naga otherwise. Any failure stops the build.
fn compile_shaders() -> Result<()> {
    let cargo_manifest_dir = env::var("CARGO_MANIFEST_DIR")?;
    let shaders_in_dir = Path::new(&cargo_manifest_dir).join("shaders");
    let shaders_out_dir = Path::new(&cargo_manifest_dir).join("shaders-built");
    fs::create_dir_all(&shaders_out_dir)?;

    let compiler = shaderc::Compiler::new();
    if compiler.is_none() {
        println!("cargo:warning=shaderc is unavailable, compiling shaders with naga");
    }

    for entry in fs::read_dir(shaders_in_dir)? {
        let path = entry?.path();

        let ext = path
            .extension()
            .and_then(|ext| ext.to_str())
            .ok_or_eyre(format!("Shader file has no extension: {:?}", path))?;
        let Some((kind, stage)) = shader_kinds(ext) else {
            println!("cargo:warning=Skipping non-GLSL file {:?}", path);
            continue;
        };

        let file_name = path
            .file_name()
            .ok_or_eyre("Shader file has no name")?
            .to_str()
            .ok_or_eyre("Shader file name is not valid UTF-8")?;
        let source = fs::read_to_string(&path)?;

        let words = match &compiler {
            Some(compiler) => compile_with_shaderc(compiler, &source, kind, file_name),
            None => compile_with_naga(&source, stage),
        }
        .wrap_err_with(|| format!("Failed to compile shader {}", file_name))?;

        let output_filepath = shaders_out_dir.join(format!("{}.spv", file_name));
        fs::write(output_filepath, bytemuck::cast_slice(&words))?;
    }

    Ok(())
}

fn shader_kinds(ext: &str) -> Option<(shaderc::ShaderKind, ShaderStage)> {
    match ext {
        "vert" => Some((shaderc::ShaderKind::Vertex, ShaderStage::Vertex)),
        "frag" => Some((shaderc::ShaderKind::Fragment, ShaderStage::Fragment)),
        "comp" => Some((shaderc::ShaderKind::Compute, ShaderStage::Compute)),
        _ => None,
    }
}

fn compile_with_shaderc(
    compiler: &shaderc::Compiler,
    source: &str,
    kind: shaderc::ShaderKind,
    file_name: &str,
) -> Result<Vec<u32>> {
    let mut options = shaderc::CompileOptions::new()
        .ok_or_eyre("Failed to create shaderc compile options")?;
    options.set_target_env(shaderc::TargetEnv::Vulkan, shaderc::EnvVersion::Vulkan1_2 as u32);
    options.set_optimization_level(shaderc::OptimizationLevel::Performance);

    let artifact = compiler.compile_into_spirv(source, kind, file_name, "main", Some(&options))?;
    if artifact.get_num_warnings() > 0 {
        println!("cargo:warning={}: {}", file_name, artifact.get_warning_messages());
    }
    Ok(artifact.as_binary().to_vec())
}

fn compile_with_naga(source: &str, stage: ShaderStage) -> Result<Vec<u32>> {
    let mut frontend = Frontend::default();
    let module = frontend
        .parse(&Options::from(stage), source)
        .map_err(|e| eyre!("{:?}", e))?;

    let mut validator = Validator::new(ValidationFlags::all(), Capabilities::all());
    let validation_info = validator.validate(&module)?;
    log::debug!("{:?}", validation_info);

    Ok(spv::write_vec(&module, &validation_info, &spv::Options::default(), None)?)
}
