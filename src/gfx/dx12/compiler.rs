//! DXC 着色器编译
//!
//! 使用 `IDxcCompiler3`，target profile 跟随设备支持的最高着色器模型。
//! 编译器输出中的错误与警告全部进入错误消息，`-WX` 让警告也视为失败。

use std::ffi::c_void;

use tracing::{debug, warn};
use windows::core::PCWSTR;
use windows::Win32::Graphics::Direct3D::Dxc::*;

use crate::core::error::{GraphicsError, Result};
use crate::renderer::capability::DeviceCapabilities;
use crate::renderer::shader::{compile_arguments, CompileOptions, ShaderBlob, ShaderCompiler, ShaderDesc};

use super::check::{check, wide};

pub struct DxcCompiler {
    utils: IDxcUtils,
    compiler: IDxcCompiler3,
    include_handler: IDxcIncludeHandler,
    options: CompileOptions,
}

impl DxcCompiler {
    pub fn new(options: CompileOptions) -> Result<Self> {
        unsafe {
            let utils: IDxcUtils = check("DxcCreateInstance(DxcUtils)", DxcCreateInstance(&CLSID_DxcUtils))?;
            let compiler: IDxcCompiler3 =
                check("DxcCreateInstance(DxcCompiler)", DxcCreateInstance(&CLSID_DxcCompiler))?;
            let include_handler = check("CreateDefaultIncludeHandler", utils.CreateDefaultIncludeHandler())?;
            Ok(Self {
                utils,
                compiler,
                include_handler,
                options,
            })
        }
    }
}

fn blob_bytes(blob: &IDxcBlob) -> Vec<u8> {
    unsafe { std::slice::from_raw_parts(blob.GetBufferPointer() as *const u8, blob.GetBufferSize()).to_vec() }
}

fn compiler_output(result: &IDxcResult) -> String {
    unsafe {
        let mut errors: Option<IDxcBlobUtf8> = None;
        if result.GetOutput(DXC_OUT_ERRORS, &mut errors, std::ptr::null_mut()).is_err() {
            return String::new();
        }
        match errors {
            Some(errors) if errors.GetStringLength() > 0 => {
                let text = std::slice::from_raw_parts(errors.GetStringPointer().0, errors.GetStringLength());
                String::from_utf8_lossy(text).into_owned()
            }
            _ => String::new(),
        }
    }
}

impl ShaderCompiler for DxcCompiler {
    fn compile(&self, capabilities: &DeviceCapabilities, desc: &ShaderDesc) -> Result<ShaderBlob> {
        let path = self.options.source_path(desc);
        let path_wide = wide(&path.to_string_lossy());

        let args = compile_arguments(desc, capabilities.shader_model, &self.options);
        debug!(shader = %desc.file_name, args = %args.join(" "), "Compiling shader with DXC");
        let args_wide: Vec<Vec<u16>> = args.iter().map(|a| wide(a)).collect();
        let arg_ptrs: Vec<PCWSTR> = args_wide.iter().map(|a| PCWSTR(a.as_ptr())).collect();

        unsafe {
            let source = self
                .utils
                .LoadFile(PCWSTR(path_wide.as_ptr()), None)
                .map_err(|err| {
                    GraphicsError::ShaderCompilation(format!("failed to load '{}': {}", path.display(), err.message()))
                })?;

            let buffer = DxcBuffer {
                Ptr: source.GetBufferPointer() as *const c_void,
                Size: source.GetBufferSize(),
                // 0 表示由编译器探测编码
                Encoding: 0,
            };

            let result: IDxcResult = check(
                "IDxcCompiler3::Compile",
                self.compiler.Compile(&buffer, Some(&arg_ptrs), &self.include_handler),
            )?;

            let output = compiler_output(&result);
            let status = check("IDxcResult::GetStatus", result.GetStatus())?;
            if status.is_err() {
                return Err(GraphicsError::ShaderCompilation(format!("{}:\n{}", desc.file_name, output)).into());
            }
            if !output.is_empty() {
                warn!(shader = %desc.file_name, "{}", output);
            }

            let mut object: Option<IDxcBlob> = None;
            check(
                "IDxcResult::GetOutput(DXC_OUT_OBJECT)",
                result.GetOutput(DXC_OUT_OBJECT, &mut object, std::ptr::null_mut()),
            )?;
            let object = object.ok_or_else(|| {
                GraphicsError::ShaderCompilation(format!("{}: compiler produced no object", desc.file_name))
            })?;

            Ok(ShaderBlob::from_bytes(desc.clone(), blob_bytes(&object)))
        }
    }
}
