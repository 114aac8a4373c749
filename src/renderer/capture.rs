//! GPU 抓帧
//!
//! 支持 PIX 与 RenderDoc 两种工具，均从工作目录下的 `dependencies/<tool>/bin`
//! 动态加载。工具缺失时记录警告，抓帧变为空操作，程序照常运行。
//!
//! 抓帧文件写入 `captures/`，文件名使用模板加上磁盘上尚不存在的最小编号：
//! `pix_capture.wpix`、`pix_capture_2.wpix`、`pix_capture_3.wpix` ……

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::core::config::{CaptureConfig, CaptureTool};
use crate::core::error::Result;

#[cfg(target_os = "windows")]
use crate::gfx::dx12::capture::{PixCapture, RenderDocCapture};

/// PIX 抓帧文件名模板
pub const PIX_TEMPLATE: &str = "pix_capture";
pub const PIX_EXTENSION: &str = "wpix";
pub const RENDERDOC_EXTENSION: &str = "rdc";

/// 模板对应的第一个未被占用的路径
///
/// 编号从 2 开始，与 RenderDoc 自己的命名方式一致。
pub fn capture_file_path(directory: &Path, template: &str, extension: &str) -> PathBuf {
    let mut path = directory.join(format!("{}.{}", template, extension));
    let mut index = 2u32;
    while path.exists() {
        path = directory.join(format!("{}_{}.{}", template, index, extension));
        index += 1;
    }
    path
}

/// RenderDoc 的文件名前缀 `rdc_{k}`，k 比目录中已有的最大编号大 1
pub fn next_renderdoc_prefix(directory: &Path) -> io::Result<String> {
    let entries = match fs::read_dir(directory) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok("rdc_0".to_string()),
        Err(err) => return Err(err),
    };

    let mut next = 0u32;
    for entry in entries {
        let name = entry?.file_name();
        if let Some(index) = renderdoc_index(&name.to_string_lossy()) {
            next = next.max(index + 1);
        }
    }
    Ok(format!("rdc_{}", next))
}

/// 解析 `rdc_<k>_capture...` 中的 k
fn renderdoc_index(file_name: &str) -> Option<u32> {
    let rest = file_name.strip_prefix("rdc_")?;
    let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
    if digits == 0 || !rest[digits..].starts_with("_capture") {
        return None;
    }
    rest[..digits].parse().ok()
}

/// 确保抓帧目录存在
pub fn ensure_capture_directory(directory: &Path) -> io::Result<()> {
    if !directory.exists() {
        fs::create_dir_all(directory)?;
    }
    Ok(())
}

/// 当前配置的抓帧后端
pub enum GpuCapture {
    #[cfg(target_os = "windows")]
    Pix(PixCapture),
    #[cfg(target_os = "windows")]
    RenderDoc(RenderDocCapture),
    Null,
}

impl GpuCapture {
    /// 按配置加载抓帧工具，加载失败时退化为 `Null`
    pub fn from_config(config: &CaptureConfig) -> Self {
        match config.tool {
            CaptureTool::None => GpuCapture::Null,
            #[cfg(target_os = "windows")]
            CaptureTool::Pix => match PixCapture::load(&config.directory) {
                Ok(capture) => {
                    info!("PIX GPU capturer loaded");
                    GpuCapture::Pix(capture)
                }
                Err(err) => {
                    warn!("PIX not available, captures disabled: {}", err);
                    GpuCapture::Null
                }
            },
            #[cfg(target_os = "windows")]
            CaptureTool::RenderDoc => match RenderDocCapture::load(&config.directory) {
                Ok(capture) => {
                    info!("RenderDoc loaded");
                    GpuCapture::RenderDoc(capture)
                }
                Err(err) => {
                    warn!("RenderDoc not available, captures disabled: {}", err);
                    GpuCapture::Null
                }
            },
            #[cfg(not(target_os = "windows"))]
            tool => {
                warn!(?tool, "GPU capture tools are only available on Windows");
                GpuCapture::Null
            }
        }
    }

    pub fn is_active(&self) -> bool {
        !matches!(self, GpuCapture::Null)
    }

    pub fn start_capture(&mut self) {
        let result: Result<()> = match self {
            #[cfg(target_os = "windows")]
            GpuCapture::Pix(capture) => capture.start(),
            #[cfg(target_os = "windows")]
            GpuCapture::RenderDoc(capture) => capture.start(),
            GpuCapture::Null => Ok(()),
        };
        if let Err(err) = result {
            warn!("Failed to start capture: {}", err);
        }
    }

    /// 结束抓帧，返回写入的文件路径
    pub fn end_capture(&mut self) -> Option<PathBuf> {
        let result: Option<Result<PathBuf>> = match self {
            #[cfg(target_os = "windows")]
            GpuCapture::Pix(capture) => Some(capture.end()),
            #[cfg(target_os = "windows")]
            GpuCapture::RenderDoc(capture) => Some(capture.end()),
            GpuCapture::Null => None,
        };

        match result? {
            Ok(path) => {
                info!(path = %path.display(), "Capture written");
                Some(path)
            }
            Err(err) => {
                warn!("Failed to end capture: {}", err);
                None
            }
        }
    }

    /// 用系统关联的程序打开抓帧文件，没有加载工具时什么也不做
    pub fn open_capture(&self, path: &Path) {
        if !self.is_active() {
            debug!(path = %path.display(), "No capture tool loaded, file not opened");
            return;
        }

        #[cfg(target_os = "windows")]
        if let Err(err) = crate::gfx::dx12::capture::open_capture_file(path) {
            warn!(path = %path.display(), "Failed to open capture: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("compute_playground_{}", name));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_capture_path_skips_existing_files() {
        let dir = scratch_dir("capture_names");
        assert_eq!(
            capture_file_path(&dir, PIX_TEMPLATE, PIX_EXTENSION),
            dir.join("pix_capture.wpix")
        );

        fs::write(dir.join("pix_capture.wpix"), b"").unwrap();
        fs::write(dir.join("pix_capture_2.wpix"), b"").unwrap();
        assert_eq!(
            capture_file_path(&dir, PIX_TEMPLATE, PIX_EXTENSION),
            dir.join("pix_capture_3.wpix")
        );
    }

    #[test]
    fn test_renderdoc_prefix_follows_highest_index() {
        let dir = scratch_dir("renderdoc_names");
        assert_eq!(next_renderdoc_prefix(&dir).unwrap(), "rdc_0");

        fs::write(dir.join("rdc_0_capture.rdc"), b"").unwrap();
        fs::write(dir.join("rdc_4_capture_2.rdc"), b"").unwrap();
        fs::write(dir.join("rdc_x_capture.rdc"), b"").unwrap();
        fs::write(dir.join("notes.txt"), b"").unwrap();
        assert_eq!(next_renderdoc_prefix(&dir).unwrap(), "rdc_5");
    }

    #[test]
    fn test_missing_directory_starts_at_zero() {
        let dir = std::env::temp_dir().join("compute_playground_no_such_capture_dir");
        let _ = fs::remove_dir_all(&dir);
        assert_eq!(next_renderdoc_prefix(&dir).unwrap(), "rdc_0");
    }

    #[test]
    fn test_none_tool_is_null() {
        let mut capture = GpuCapture::from_config(&CaptureConfig::default());
        assert!(!capture.is_active());

        capture.start_capture();
        assert_eq!(capture.end_capture(), None);
        capture.open_capture(Path::new("captures/pix_capture.wpix"));
    }
}
