//! PIX 与 RenderDoc 的程序化抓帧
//!
//! 两个工具都要在创建设备之前注入，否则无法挂接 D3D12 调用，所以主程序在
//! 创建后端前调用 [`preload_capture_library`]。之后的 `load` 只会增加模块
//! 引用计数并解析导出函数。

use std::ffi::{c_char, c_void, CStr, CString};
use std::path::{Path, PathBuf};

use tracing::{debug, info};
use windows::core::{s, w, BOOL, HRESULT, PCWSTR};
use windows::Win32::Foundation::HMODULE;
use windows::Win32::System::LibraryLoader::{GetProcAddress, LoadLibraryExW, LOAD_LIBRARY_FLAGS};
use windows::Win32::UI::Shell::ShellExecuteW;
use windows::Win32::UI::WindowsAndMessaging::SW_SHOWNORMAL;

use crate::core::config::{CaptureConfig, CaptureTool};
use crate::core::error::{GraphicsError, PlaygroundError, Result};
use crate::renderer::capture::{
    capture_file_path, ensure_capture_directory, next_renderdoc_prefix, PIX_EXTENSION, PIX_TEMPLATE,
    RENDERDOC_EXTENSION,
};

use super::check::{check, wide};

const PIX_LIBRARY: &str = "dependencies\\pix\\bin\\WinPixGpuCapturer.dll";
const RENDERDOC_LIBRARY: &str = "dependencies\\renderdoc\\bin\\renderdoc.dll";
/// eRENDERDOC_API_Version_1_6_0
const RENDERDOC_API_VERSION: i32 = 10600;

fn load_library(path: &str) -> Result<HMODULE> {
    let path = wide(path);
    unsafe { check("LoadLibraryExW", LoadLibraryExW(PCWSTR(path.as_ptr()), None, LOAD_LIBRARY_FLAGS(0))) }
}

fn capture_error(message: impl Into<String>) -> PlaygroundError {
    GraphicsError::CommandExecution(message.into()).into()
}

/// 在设备创建前加载配置的抓帧工具
pub fn preload_capture_library(config: &CaptureConfig) {
    let library = match config.tool {
        CaptureTool::None => return,
        CaptureTool::Pix => PIX_LIBRARY,
        CaptureTool::RenderDoc => RENDERDOC_LIBRARY,
    };
    match load_library(library) {
        Ok(_) => debug!(library, "Capture library injected"),
        Err(err) => debug!(library, "Capture library not preloaded: {}", err),
    }
}

// ---------------------------------------------------------------------
// PIX
// ---------------------------------------------------------------------

/// PIXCaptureParameters 中 GPU 抓帧的部分，尾部留出联合体其余成员的空间
#[repr(C)]
struct PixGpuCaptureParameters {
    file_name: PCWSTR,
    reserved: [u64; 4],
}

type BeginGpuCapture = unsafe extern "system" fn(*const PixGpuCaptureParameters) -> HRESULT;
type EndGpuCapture = unsafe extern "system" fn(BOOL) -> HRESULT;

pub struct PixCapture {
    begin: BeginGpuCapture,
    end: EndGpuCapture,
    directory: PathBuf,
    current: Option<PathBuf>,
}

impl PixCapture {
    pub fn load(directory: &Path) -> Result<Self> {
        let module = load_library(PIX_LIBRARY)?;
        unsafe {
            let begin = GetProcAddress(module, s!("BeginProgrammaticGpuCapture"))
                .ok_or_else(|| capture_error("BeginProgrammaticGpuCapture export missing"))?;
            let end = GetProcAddress(module, s!("EndProgrammaticGpuCapture"))
                .ok_or_else(|| capture_error("EndProgrammaticGpuCapture export missing"))?;

            Ok(Self {
                begin: std::mem::transmute::<unsafe extern "system" fn() -> isize, BeginGpuCapture>(begin),
                end: std::mem::transmute::<unsafe extern "system" fn() -> isize, EndGpuCapture>(end),
                directory: directory.to_path_buf(),
                current: None,
            })
        }
    }

    pub fn start(&mut self) -> Result<()> {
        ensure_capture_directory(&self.directory)?;
        let path = capture_file_path(&self.directory, PIX_TEMPLATE, PIX_EXTENSION);
        let file_name = wide(&path.to_string_lossy());
        let parameters = PixGpuCaptureParameters {
            file_name: PCWSTR(file_name.as_ptr()),
            reserved: [0; 4],
        };

        unsafe {
            check("BeginProgrammaticGpuCapture", (self.begin)(&parameters).ok())?;
        }
        debug!(path = %path.display(), "PIX capture started");
        self.current = Some(path);
        Ok(())
    }

    pub fn end(&mut self) -> Result<PathBuf> {
        unsafe {
            check("EndProgrammaticGpuCapture", (self.end)(BOOL(0)).ok())?;
        }
        self.current
            .take()
            .ok_or_else(|| capture_error("PIX capture ended without a start"))
    }
}

// ---------------------------------------------------------------------
// RenderDoc
// ---------------------------------------------------------------------

type GetApi = unsafe extern "C" fn(i32, *mut *mut c_void) -> i32;

/// RENDERDOC_API_1_6_0 中直到 EndFrameCapture 的函数表
#[repr(C)]
struct RenderDocApi {
    get_api_version: *const c_void,
    set_capture_option_u32: *const c_void,
    set_capture_option_f32: *const c_void,
    get_capture_option_u32: *const c_void,
    get_capture_option_f32: *const c_void,
    set_focus_toggle_keys: *const c_void,
    set_capture_keys: *const c_void,
    get_overlay_bits: *const c_void,
    mask_overlay_bits: *const c_void,
    remove_hooks: *const c_void,
    unload_crash_handler: *const c_void,
    set_capture_file_path_template: unsafe extern "C" fn(*const c_char),
    get_capture_file_path_template: *const c_void,
    get_num_captures: unsafe extern "C" fn() -> u32,
    get_capture: unsafe extern "C" fn(u32, *mut c_char, *mut u32, *mut u64) -> u32,
    trigger_capture: *const c_void,
    is_target_control_connected: *const c_void,
    launch_replay_ui: *const c_void,
    set_active_window: *const c_void,
    start_frame_capture: unsafe extern "C" fn(*mut c_void, *mut c_void),
    is_frame_capturing: *const c_void,
    end_frame_capture: unsafe extern "C" fn(*mut c_void, *mut c_void) -> u32,
}

pub struct RenderDocCapture {
    api: &'static RenderDocApi,
    directory: PathBuf,
    prefix: Option<String>,
}

impl RenderDocCapture {
    pub fn load(directory: &Path) -> Result<Self> {
        let module = load_library(RENDERDOC_LIBRARY)?;
        unsafe {
            let get_api = GetProcAddress(module, s!("RENDERDOC_GetAPI"))
                .ok_or_else(|| capture_error("RENDERDOC_GetAPI export missing"))?;
            let get_api = std::mem::transmute::<unsafe extern "system" fn() -> isize, GetApi>(get_api);

            let mut api: *mut c_void = std::ptr::null_mut();
            if get_api(RENDERDOC_API_VERSION, &mut api) != 1 || api.is_null() {
                return Err(capture_error("RenderDoc API 1.6.0 unavailable"));
            }

            info!("RenderDoc API 1.6.0 acquired");
            Ok(Self {
                api: &*(api as *const RenderDocApi),
                directory: directory.to_path_buf(),
                prefix: None,
            })
        }
    }

    pub fn start(&mut self) -> Result<()> {
        ensure_capture_directory(&self.directory)?;
        let prefix = next_renderdoc_prefix(&self.directory)?;
        let template = CString::new(self.directory.join(&prefix).to_string_lossy().into_owned())
            .map_err(|err| capture_error(format!("capture path contains NUL: {}", err)))?;

        unsafe {
            (self.api.set_capture_file_path_template)(template.as_ptr());
            // 空设备与窗口表示抓取当前活动的那一个
            (self.api.start_frame_capture)(std::ptr::null_mut(), std::ptr::null_mut());
        }
        debug!(prefix = %prefix, "RenderDoc capture started");
        self.prefix = Some(prefix);
        Ok(())
    }

    pub fn end(&mut self) -> Result<PathBuf> {
        let prefix = self
            .prefix
            .take()
            .ok_or_else(|| capture_error("RenderDoc capture ended without a start"))?;

        unsafe {
            if (self.api.end_frame_capture)(std::ptr::null_mut(), std::ptr::null_mut()) == 0 {
                return Err(capture_error("EndFrameCapture failed"));
            }
            if let Some(path) = self.latest_capture() {
                return Ok(path);
            }
        }

        Ok(capture_file_path(
            &self.directory,
            &format!("{}_capture", prefix),
            RENDERDOC_EXTENSION,
        ))
    }

    /// RenderDoc 记录的最后一个抓帧文件
    unsafe fn latest_capture(&self) -> Option<PathBuf> {
        let count = (self.api.get_num_captures)();
        let index = count.checked_sub(1)?;

        let mut length = 0u32;
        if (self.api.get_capture)(index, std::ptr::null_mut(), &mut length, std::ptr::null_mut()) == 0 || length == 0 {
            return None;
        }
        let mut buffer = vec![0 as c_char; length as usize];
        if (self.api.get_capture)(index, buffer.as_mut_ptr(), &mut length, std::ptr::null_mut()) == 0 {
            return None;
        }
        let path = CStr::from_ptr(buffer.as_ptr()).to_string_lossy().into_owned();
        Some(PathBuf::from(path))
    }
}

/// 用系统关联的程序（PIX、qrenderdoc）打开抓帧文件
pub fn open_capture_file(path: &Path) -> Result<()> {
    let file = wide(&path.to_string_lossy());
    let instance = unsafe { ShellExecuteW(None, w!("open"), PCWSTR(file.as_ptr()), PCWSTR::null(), PCWSTR::null(), SW_SHOWNORMAL) };
    // 返回值不大于 32 表示失败
    if instance.0 as isize <= 32 {
        return Err(capture_error(format!(
            "ShellExecute failed for '{}' ({})",
            path.display(),
            instance.0 as isize
        )));
    }
    Ok(())
}
