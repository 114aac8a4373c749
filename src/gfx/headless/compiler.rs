//! 软件设备使用的着色器"编译器"
//!
//! 只读取源文件并生成带头部的伪字节码，用于在没有 DXC 的环境中走通
//! 与真实编译器相同的流程（文件缺失、profile 选择、参数构造）。

use std::fs;

use tracing::debug;

use crate::core::error::{GraphicsError, Result};
use crate::renderer::capability::DeviceCapabilities;
use crate::renderer::shader::{compile_arguments, CompileOptions, ShaderBlob, ShaderCompiler, ShaderDesc};

/// 伪字节码的魔数
pub const HEADLESS_BYTECODE_MAGIC: &[u8; 4] = b"HDXL";

pub struct HeadlessCompiler {
    options: CompileOptions,
}

impl HeadlessCompiler {
    pub fn new(options: CompileOptions) -> Self {
        Self { options }
    }
}

impl ShaderCompiler for HeadlessCompiler {
    fn compile(&self, capabilities: &DeviceCapabilities, desc: &ShaderDesc) -> Result<ShaderBlob> {
        let path = self.options.source_path(desc);
        let source = fs::read(&path).map_err(|err| {
            GraphicsError::ShaderCompilation(format!("failed to load '{}': {}", path.display(), err))
        })?;

        let args = compile_arguments(desc, capabilities.shader_model, &self.options);
        debug!(shader = %desc.file_name, args = %args.join(" "), "Compiling shader");

        let profile = args
            .iter()
            .position(|a| a == "-T")
            .and_then(|i| args.get(i + 1))
            .cloned()
            .unwrap_or_default();

        let mut bytecode = Vec::with_capacity(source.len() + 16);
        bytecode.extend_from_slice(HEADLESS_BYTECODE_MAGIC);
        bytecode.extend_from_slice(&(profile.len() as u32).to_le_bytes());
        bytecode.extend_from_slice(profile.as_bytes());
        bytecode.extend_from_slice(&source);

        Ok(ShaderBlob::from_bytes(desc.clone(), bytecode))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::PlaygroundError;
    use crate::gfx::headless::default_capabilities;
    use crate::renderer::shader::ShaderStage;

    #[test]
    fn test_missing_file_is_compilation_error() {
        let compiler = HeadlessCompiler::new(CompileOptions::new(false, "does/not/exist"));
        let desc = ShaderDesc::new(ShaderStage::Compute, "Missing.hlsl", "main");
        let result = compiler.compile(&default_capabilities(), &desc);
        assert!(matches!(
            result,
            Err(PlaygroundError::Graphics(GraphicsError::ShaderCompilation(_)))
        ));
    }

    #[test]
    fn test_bytecode_carries_profile() {
        let dir = std::env::temp_dir().join("compute_playground_compiler_test");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("Fill.hlsl"), "[numthreads(8, 8, 1)] void main() {}").unwrap();

        let compiler = HeadlessCompiler::new(CompileOptions::new(true, &dir));
        let desc = ShaderDesc::new(ShaderStage::Compute, "Fill.hlsl", "main");
        let blob = compiler.compile(&default_capabilities(), &desc).unwrap();

        assert_eq!(&blob.bytecode[..4], HEADLESS_BYTECODE_MAGIC);
        assert_eq!(&blob.bytecode[8..14], b"cs_6_8");
    }
}
