//! 配置管理模块
//!
//! 提供平台配置的加载、解析和管理功能。
//! 支持从 TOML 配置文件加载，也支持命令行参数覆盖。
//!
//! # 配置文件格式 (config.toml)
//!
//! ```toml
//! [window]
//! width = 1280
//! height = 720
//! title = "Compute Playground"
//!
//! [graphics]
//! backend = "dx12"          # 或 "headless"
//! back_buffer_count = 3
//! pipeline_path = "auto"    # auto, legacy, generic
//!
//! [debug]
//! validation_layer = true
//!
//! [capture]
//! tool = "pix"              # none, pix, renderdoc
//!
//! [logging]
//! level = "info"            # trace, debug, info, warn, error
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::error::{ConfigError, Result};

/// 平台配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// 窗口配置
    #[serde(default)]
    pub window: WindowConfig,

    /// 图形配置
    #[serde(default)]
    pub graphics: GraphicsConfig,

    /// 调试层配置
    #[serde(default)]
    pub debug: DebugConfig,

    /// GPU 抓帧配置
    #[serde(default)]
    pub capture: CaptureConfig,

    /// 着色器配置
    #[serde(default)]
    pub shader: ShaderConfig,

    /// 日志配置
    #[serde(default)]
    pub logging: LoggingConfig,

    /// 运行控制
    #[serde(default)]
    pub run: RunConfig,
}

/// 窗口配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowConfig {
    #[serde(default = "default_width")]
    pub width: u32,

    #[serde(default = "default_height")]
    pub height: u32,

    #[serde(default = "default_title")]
    pub title: String,

    #[serde(default = "default_resizable")]
    pub resizable: bool,
}

/// 图形配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphicsConfig {
    /// 设备后端
    #[serde(default = "default_backend")]
    pub backend: GraphicsBackendKind,

    /// 后备缓冲数量，同时也是在途帧的数量
    #[serde(default = "default_back_buffer_count")]
    pub back_buffer_count: u32,

    /// 垂直同步
    #[serde(default = "default_vsync")]
    pub vsync: bool,

    /// 着色器可见的 CBV/SRV/UAV 堆容量
    #[serde(default = "default_resource_descriptors")]
    pub resource_descriptor_capacity: u32,

    /// 采样器堆容量
    #[serde(default = "default_sampler_descriptors")]
    pub sampler_descriptor_capacity: u32,

    /// RTV 堆容量（仅 CPU 可见）
    #[serde(default = "default_rtv_descriptors")]
    pub rtv_descriptor_capacity: u32,

    /// DSV 堆容量（仅 CPU 可见）
    #[serde(default = "default_dsv_descriptors")]
    pub dsv_descriptor_capacity: u32,

    /// 管线构建路径
    #[serde(default = "default_pipeline_path")]
    pub pipeline_path: PipelinePreference,
}

/// 设备后端类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GraphicsBackendKind {
    /// DirectX 12 后端（仅 Windows）
    Dx12,
    /// 软件模拟设备，无需 GPU
    Headless,
}

/// 管线构建路径偏好
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelinePreference {
    /// 根据设备能力自动选择
    Auto,
    /// 强制使用传统 PSO
    Legacy,
    /// 强制使用通用程序（state object）路径，设备不支持时启动失败
    Generic,
}

/// 调试层配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebugConfig {
    #[serde(default = "default_validation_layer")]
    pub validation_layer: bool,

    #[serde(default)]
    pub gpu_based_validation: bool,

    /// info queue 遇到错误时中断
    #[serde(default = "default_break_on_error")]
    pub break_on_error: bool,
}

/// GPU 抓帧配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    #[serde(default = "default_capture_tool")]
    pub tool: CaptureTool,

    /// 抓帧文件输出目录（相对当前工作目录）
    #[serde(default = "default_capture_directory")]
    pub directory: PathBuf,
}

/// 抓帧工具
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureTool {
    None,
    Pix,
    RenderDoc,
}

/// 着色器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShaderConfig {
    /// 着色器源文件目录，同时作为 include 目录
    #[serde(default = "default_shader_directory")]
    pub directory: PathBuf,

    /// 调试编译（-Od -Zi），否则 -O3
    #[serde(default = "default_shader_debug")]
    pub debug: bool,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: LogLevel,

    #[serde(default = "default_file_output")]
    pub file_output: bool,

    #[serde(default = "default_log_file")]
    pub log_file: String,
}

/// 日志级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// 运行控制
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunConfig {
    /// 最多渲染的帧数，0 表示直到窗口关闭
    #[serde(default)]
    pub max_frames: u64,
}

// 默认值函数
fn default_width() -> u32 { 1280 }
fn default_height() -> u32 { 720 }
fn default_title() -> String { "Compute Playground".to_string() }
fn default_resizable() -> bool { true }
fn default_backend() -> GraphicsBackendKind {
    if cfg!(target_os = "windows") {
        GraphicsBackendKind::Dx12
    } else {
        GraphicsBackendKind::Headless
    }
}
fn default_back_buffer_count() -> u32 { 3 }
fn default_vsync() -> bool { true }
fn default_resource_descriptors() -> u32 { 4096 }
fn default_sampler_descriptors() -> u32 { 64 }
fn default_rtv_descriptors() -> u32 { 16 }
fn default_dsv_descriptors() -> u32 { 8 }
fn default_pipeline_path() -> PipelinePreference { PipelinePreference::Auto }
fn default_validation_layer() -> bool { cfg!(debug_assertions) }
fn default_break_on_error() -> bool { cfg!(debug_assertions) }
fn default_capture_tool() -> CaptureTool { CaptureTool::None }
fn default_capture_directory() -> PathBuf { PathBuf::from("captures") }
fn default_shader_directory() -> PathBuf { PathBuf::from("shaders") }
fn default_shader_debug() -> bool { cfg!(debug_assertions) }
fn default_log_level() -> LogLevel { LogLevel::Info }
fn default_file_output() -> bool { false }
fn default_log_file() -> String { "compute_playground.log".to_string() }

/// 描述符堆容量上限（资源绑定 Tier 1/2 的着色器可见堆上限）
const MAX_SHADER_VISIBLE_DESCRIPTORS: u32 = 1_000_000;
/// 着色器可见采样器堆的上限
const MAX_SHADER_VISIBLE_SAMPLERS: u32 = 2048;

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
            title: default_title(),
            resizable: default_resizable(),
        }
    }
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            back_buffer_count: default_back_buffer_count(),
            vsync: default_vsync(),
            resource_descriptor_capacity: default_resource_descriptors(),
            sampler_descriptor_capacity: default_sampler_descriptors(),
            rtv_descriptor_capacity: default_rtv_descriptors(),
            dsv_descriptor_capacity: default_dsv_descriptors(),
            pipeline_path: default_pipeline_path(),
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layer: default_validation_layer(),
            gpu_based_validation: false,
            break_on_error: default_break_on_error(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            tool: default_capture_tool(),
            directory: default_capture_directory(),
        }
    }
}

impl Default for ShaderConfig {
    fn default() -> Self {
        Self {
            directory: default_shader_directory(),
            debug: default_shader_debug(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file_output: default_file_output(),
            log_file: default_log_file(),
        }
    }
}

impl Config {
    /// 从配置文件加载
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();

        let contents = std::fs::read_to_string(path)
            .map_err(|_| ConfigError::FileNotFound(path_str.clone()))?;

        Self::from_toml_str(&contents)
    }

    /// 从 TOML 文本解析
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| ConfigError::ParseError(e.to_string()).into())
    }

    /// 从配置文件加载，如果文件不存在或无法解析则使用默认配置
    pub fn from_file_or_default<P: AsRef<Path>>(path: P) -> Self {
        Self::from_file(path).unwrap_or_default()
    }

    /// 从命令行参数覆盖配置
    ///
    /// 支持的参数：
    /// - `--dx12` / `--headless`：选择设备后端
    /// - `--width <value>` / `--height <value>`：窗口尺寸
    /// - `--frames <value>`：渲染指定帧数后退出
    /// - `--capture <pix|renderdoc>`：启用抓帧工具
    /// - `--legacy` / `--generic`：强制管线构建路径
    pub fn apply_args<I>(&mut self, args: I)
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let args: Vec<String> = args.into_iter().map(|s| s.as_ref().to_string()).collect();

        if args.iter().any(|a| a == "--dx12") {
            self.graphics.backend = GraphicsBackendKind::Dx12;
        }
        if args.iter().any(|a| a == "--headless") {
            self.graphics.backend = GraphicsBackendKind::Headless;
        }
        if args.iter().any(|a| a == "--legacy") {
            self.graphics.pipeline_path = PipelinePreference::Legacy;
        }
        if args.iter().any(|a| a == "--generic") {
            self.graphics.pipeline_path = PipelinePreference::Generic;
        }

        if let Some(width) = value_after(&args, "--width").and_then(|v| v.parse().ok()) {
            self.window.width = width;
        }
        if let Some(height) = value_after(&args, "--height").and_then(|v| v.parse().ok()) {
            self.window.height = height;
        }
        if let Some(frames) = value_after(&args, "--frames").and_then(|v| v.parse().ok()) {
            self.run.max_frames = frames;
        }

        match value_after(&args, "--capture") {
            Some("pix") => self.capture.tool = CaptureTool::Pix,
            Some("renderdoc") => self.capture.tool = CaptureTool::RenderDoc,
            Some("none") => self.capture.tool = CaptureTool::None,
            _ => {}
        }
    }

    /// 验证配置的有效性
    pub fn validate(&self) -> Result<()> {
        if self.window.width == 0 || self.window.height == 0 {
            return Err(invalid("window.width/height", "Window dimensions must be greater than 0"));
        }

        if !(2..=3).contains(&self.graphics.back_buffer_count) {
            return Err(invalid("graphics.back_buffer_count", "Back buffer count must be 2 or 3"));
        }

        let resources = self.graphics.resource_descriptor_capacity;
        if resources == 0 || resources > MAX_SHADER_VISIBLE_DESCRIPTORS {
            return Err(invalid(
                "graphics.resource_descriptor_capacity",
                "Must be in 1..=1000000",
            ));
        }

        let samplers = self.graphics.sampler_descriptor_capacity;
        if samplers == 0 || samplers > MAX_SHADER_VISIBLE_SAMPLERS {
            return Err(invalid("graphics.sampler_descriptor_capacity", "Must be in 1..=2048"));
        }

        // 每个后备缓冲都需要一个 RTV
        if self.graphics.rtv_descriptor_capacity < self.graphics.back_buffer_count {
            return Err(invalid(
                "graphics.rtv_descriptor_capacity",
                "Must hold at least one view per back buffer",
            ));
        }

        if self.graphics.dsv_descriptor_capacity == 0 {
            return Err(invalid("graphics.dsv_descriptor_capacity", "Must be greater than 0"));
        }

        #[cfg(not(target_os = "windows"))]
        if self.graphics.backend == GraphicsBackendKind::Dx12 {
            return Err(invalid("graphics.backend", "DirectX 12 is only available on Windows"));
        }

        Ok(())
    }
}

fn value_after<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    let idx = args.iter().position(|a| a == flag)?;
    args.get(idx + 1).map(String::as_str)
}

fn invalid(field: &str, reason: &str) -> super::error::PlaygroundError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

impl GraphicsBackendKind {
    /// 获取后端名称
    pub fn name(&self) -> &'static str {
        match self {
            GraphicsBackendKind::Dx12 => "DirectX 12",
            GraphicsBackendKind::Headless => "Headless",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.window.width, 1280);
        assert_eq!(config.window.height, 720);
        assert_eq!(config.graphics.back_buffer_count, 3);
        assert_eq!(config.graphics.pipeline_path, PipelinePreference::Auto);
        assert_eq!(config.capture.tool, CaptureTool::None);
        assert_eq!(config.capture.directory, PathBuf::from("captures"));
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        config.graphics.backend = GraphicsBackendKind::Headless;
        assert!(config.validate().is_ok());

        config.window.width = 0;
        assert!(config.validate().is_err());

        config.window.width = 640;
        config.graphics.back_buffer_count = 4;
        assert!(config.validate().is_err());

        config.graphics.back_buffer_count = 3;
        config.graphics.rtv_descriptor_capacity = 2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = Config::from_toml_str(
            r#"
            [graphics]
            backend = "headless"
            pipeline_path = "generic"

            [capture]
            tool = "renderdoc"
            "#,
        )
        .unwrap();

        assert_eq!(config.graphics.backend, GraphicsBackendKind::Headless);
        assert_eq!(config.graphics.pipeline_path, PipelinePreference::Generic);
        assert_eq!(config.graphics.resource_descriptor_capacity, 4096);
        assert_eq!(config.capture.tool, CaptureTool::RenderDoc);
        assert_eq!(config.window.width, 1280);
    }

    #[test]
    fn test_apply_args() {
        let mut config = Config::default();
        config.apply_args([
            "playground", "--headless", "--width", "320", "--frames", "5", "--capture", "pix",
            "--legacy",
        ]);

        assert_eq!(config.graphics.backend, GraphicsBackendKind::Headless);
        assert_eq!(config.window.width, 320);
        assert_eq!(config.window.height, 720);
        assert_eq!(config.run.max_frames, 5);
        assert_eq!(config.capture.tool, CaptureTool::Pix);
        assert_eq!(config.graphics.pipeline_path, PipelinePreference::Legacy);
    }
}
