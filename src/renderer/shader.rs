//! 着色器描述与编译接口
//!
//! 编译器被视为不透明的外部协作者：输入（设备能力、文件、阶段），输出字节码或失败。
//! 目标 profile 由设备支持的最高着色器模型决定，例如 `cs_6_8`。
//!
//! 编译参数顺序：
//!
//! ```text
//! <file> -E <entry> -T <stage>_<major>_<minor> (-Od -Zi | -O3) -HV 2021 -WX -I <dir>
//! ```

use std::path::{Path, PathBuf};

use crate::core::error::Result;

use super::capability::{DeviceCapabilities, ShaderModel};

/// 着色器阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Pixel,
    Compute,
    /// 工作图与光追使用的库
    Library,
}

impl ShaderStage {
    pub fn profile_prefix(self) -> &'static str {
        match self {
            ShaderStage::Vertex => "vs",
            ShaderStage::Pixel => "ps",
            ShaderStage::Compute => "cs",
            ShaderStage::Library => "lib",
        }
    }
}

/// 目标 profile，例如 `lib_6_8`
pub fn target_profile(stage: ShaderStage, shader_model: ShaderModel) -> String {
    format!("{}_{}", stage.profile_prefix(), shader_model)
}

/// 一个待编译的着色器
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderDesc {
    pub stage: ShaderStage,
    /// 相对于着色器目录的文件名
    pub file_name: String,
    pub entry_point: String,
}

impl ShaderDesc {
    pub fn new(stage: ShaderStage, file_name: impl Into<String>, entry_point: impl Into<String>) -> Self {
        Self {
            stage,
            file_name: file_name.into(),
            entry_point: entry_point.into(),
        }
    }
}

/// 编译结果
#[derive(Debug, Clone)]
pub struct ShaderBlob {
    pub desc: ShaderDesc,
    pub bytecode: Vec<u8>,
}

impl ShaderBlob {
    pub fn from_bytes(desc: ShaderDesc, bytecode: Vec<u8>) -> Self {
        Self { desc, bytecode }
    }

    pub fn stage(&self) -> ShaderStage {
        self.desc.stage
    }

    pub fn is_empty(&self) -> bool {
        self.bytecode.is_empty()
    }
}

/// 编译选项
#[derive(Debug, Clone)]
pub struct CompileOptions {
    pub debug: bool,
    /// 着色器目录，同时作为 include 目录
    pub include_dir: PathBuf,
}

impl CompileOptions {
    pub fn new(debug: bool, include_dir: impl Into<PathBuf>) -> Self {
        Self {
            debug,
            include_dir: include_dir.into(),
        }
    }

    pub fn source_path(&self, desc: &ShaderDesc) -> PathBuf {
        self.include_dir.join(&desc.file_name)
    }
}

/// 构造传给编译器的参数列表
pub fn compile_arguments(desc: &ShaderDesc, shader_model: ShaderModel, options: &CompileOptions) -> Vec<String> {
    let mut args = vec![desc.file_name.clone()];

    if !desc.entry_point.is_empty() {
        args.push("-E".to_string());
        args.push(desc.entry_point.clone());
    }

    args.push("-T".to_string());
    args.push(target_profile(desc.stage, shader_model));

    if options.debug {
        args.push("-Od".to_string());
        args.push("-Zi".to_string());
    } else {
        args.push("-O3".to_string());
    }

    args.push("-HV".to_string());
    args.push("2021".to_string());
    args.push("-WX".to_string());
    args.push("-I".to_string());
    args.push(path_arg(&options.include_dir));
    args
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// 着色器编译器
pub trait ShaderCompiler {
    /// 编译一个着色器；失败时返回带编译器输出的 [`GraphicsError::ShaderCompilation`]
    ///
    /// [`GraphicsError::ShaderCompilation`]: crate::core::error::GraphicsError::ShaderCompilation
    fn compile(&self, capabilities: &DeviceCapabilities, desc: &ShaderDesc) -> Result<ShaderBlob>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_uses_max_shader_model() {
        assert_eq!(target_profile(ShaderStage::Compute, ShaderModel::SM_6_8), "cs_6_8");
        assert_eq!(target_profile(ShaderStage::Library, ShaderModel::SM_6_6), "lib_6_6");
        assert_eq!(target_profile(ShaderStage::Pixel, ShaderModel::SM_5_1), "ps_5_1");
    }

    #[test]
    fn test_debug_arguments() {
        let desc = ShaderDesc::new(ShaderStage::Vertex, "Triangle.hlsl", "vs_main");
        let args = compile_arguments(&desc, ShaderModel::SM_6_6, &CompileOptions::new(true, "shaders"));
        assert_eq!(
            args,
            vec!["Triangle.hlsl", "-E", "vs_main", "-T", "vs_6_6", "-Od", "-Zi", "-HV", "2021", "-WX", "-I", "shaders"]
        );
    }

    #[test]
    fn test_release_arguments_without_entry() {
        let desc = ShaderDesc::new(ShaderStage::Library, "WorkGraph.hlsl", "");
        let args = compile_arguments(&desc, ShaderModel::SM_6_8, &CompileOptions::new(false, "shaders"));
        assert!(!args.contains(&"-E".to_string()));
        assert!(args.contains(&"-O3".to_string()));
        assert!(!args.contains(&"-Zi".to_string()));
        assert_eq!(args[2], "lib_6_8");
    }
}
