//! 错误处理模块
//!
//! 定义了整个实验平台使用的统一错误类型。所有设备调用边界都返回
//! [`Result`]，由调用方决定是向上传播还是记录后终止进程。
//!
//! # 设计原则
//!
//! - 每个错误都携带足够的上下文（错误码、解码后的消息、调用位置）
//! - 不做任何重试：这里的失败通常意味着编程错误或环境错误
//! - 易于模式匹配，测试可以精确断言错误种类

use std::fmt;
use std::panic::Location;

/// 统一的 Result 类型
pub type Result<T> = std::result::Result<T, PlaygroundError>;

/// 平台的顶层错误类型
#[derive(Debug)]
pub enum PlaygroundError {
    /// 配置错误
    Config(ConfigError),

    /// 图形 API 错误
    Graphics(GraphicsError),

    /// IO 错误
    Io(std::io::Error),

    /// 日志系统错误
    Log(String),

    /// 初始化错误
    Initialization(String),

    /// 运行时错误
    Runtime(String),
}

/// 配置相关的错误
#[derive(Debug)]
pub enum ConfigError {
    /// 配置文件未找到
    FileNotFound(String),

    /// 配置文件解析失败
    ParseError(String),

    /// 配置值无效
    InvalidValue { field: String, reason: String },
}

/// 图形 API 相关的错误
#[derive(Debug)]
pub enum GraphicsError {
    /// 设备创建失败
    DeviceCreation(String),

    /// 设备已被移除（驱动崩溃、TDR 等）
    DeviceRemoved(String),

    /// 某个设备调用返回了失败状态
    ApiCall(ApiCallError),

    /// 交换链错误
    SwapchainError(String),

    /// 着色器编译失败
    ShaderCompilation(String),

    /// 资源创建失败
    ResourceCreation(String),

    /// 命令录制或提交失败
    CommandExecution(String),

    /// 设备不支持所需的功能
    CapabilityUnsupported(String),

    /// 描述符堆容量耗尽
    DescriptorHeapExhausted { heap: &'static str, capacity: u32 },
}

/// 单次设备调用失败的完整诊断信息
///
/// 由 `#[track_caller]` 辅助函数构造，`location` 指向发起调用的源码位置。
#[derive(Debug, Clone)]
pub struct ApiCallError {
    /// 失败的调用名
    pub call: &'static str,
    /// 原始错误码（HRESULT）
    pub code: i32,
    /// 解码后的错误消息
    pub message: String,
    /// 调用位置
    pub location: &'static Location<'static>,
}

impl ApiCallError {
    #[track_caller]
    pub fn new(call: &'static str, code: i32, message: impl Into<String>) -> Self {
        Self {
            call,
            code,
            message: message.into(),
            location: Location::caller(),
        }
    }
}

impl PlaygroundError {
    /// 记录完整的诊断信息
    ///
    /// 致命错误在进程退出前调用此函数，保证错误码、解码消息与调用位置都被输出。
    pub fn report(&self) {
        match self {
            PlaygroundError::Graphics(GraphicsError::ApiCall(api)) => {
                tracing::error!(
                    call = api.call,
                    file = api.location.file(),
                    line = api.location.line(),
                    "Error at {} line {}",
                    api.call,
                    api.location.line()
                );
                tracing::error!("Error Code {:#010x}: {}", api.code as u32, api.message);
            }
            other => tracing::error!("{}", other),
        }
    }

    /// 返回错误发生的源码位置（若有）
    pub fn location(&self) -> Option<&'static Location<'static>> {
        match self {
            PlaygroundError::Graphics(GraphicsError::ApiCall(api)) => Some(api.location),
            _ => None,
        }
    }
}

impl fmt::Display for PlaygroundError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlaygroundError::Config(e) => write!(f, "Configuration error: {}", e),
            PlaygroundError::Graphics(e) => write!(f, "Graphics error: {}", e),
            PlaygroundError::Io(e) => write!(f, "IO error: {}", e),
            PlaygroundError::Log(msg) => write!(f, "Log error: {}", msg),
            PlaygroundError::Initialization(msg) => write!(f, "Initialization error: {}", msg),
            PlaygroundError::Runtime(msg) => write!(f, "Runtime error: {}", msg),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::FileNotFound(path) => write!(f, "Config file not found: {}", path),
            ConfigError::ParseError(msg) => write!(f, "Failed to parse config: {}", msg),
            ConfigError::InvalidValue { field, reason } => {
                write!(f, "Invalid value for '{}': {}", field, reason)
            }
        }
    }
}

impl fmt::Display for ApiCallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} failed at {}:{} with {:#010x}: {}",
            self.call,
            self.location.file(),
            self.location.line(),
            self.code as u32,
            self.message
        )
    }
}

impl fmt::Display for GraphicsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphicsError::DeviceCreation(msg) => write!(f, "Device creation failed: {}", msg),
            GraphicsError::DeviceRemoved(msg) => write!(f, "Device removed: {}", msg),
            GraphicsError::ApiCall(api) => write!(f, "{}", api),
            GraphicsError::SwapchainError(msg) => write!(f, "Swapchain error: {}", msg),
            GraphicsError::ShaderCompilation(msg) => write!(f, "Shader compilation failed: {}", msg),
            GraphicsError::ResourceCreation(msg) => write!(f, "Resource creation failed: {}", msg),
            GraphicsError::CommandExecution(msg) => write!(f, "Command execution failed: {}", msg),
            GraphicsError::CapabilityUnsupported(msg) => write!(f, "Capability unsupported: {}", msg),
            GraphicsError::DescriptorHeapExhausted { heap, capacity } => {
                write!(f, "Descriptor heap '{}' exhausted (capacity {})", heap, capacity)
            }
        }
    }
}

impl std::error::Error for PlaygroundError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PlaygroundError::Io(e) => Some(e),
            PlaygroundError::Config(e) => Some(e),
            PlaygroundError::Graphics(e) => Some(e),
            _ => None,
        }
    }
}

impl std::error::Error for ConfigError {}
impl std::error::Error for GraphicsError {}

impl From<std::io::Error> for PlaygroundError {
    fn from(err: std::io::Error) -> Self {
        PlaygroundError::Io(err)
    }
}

impl From<ConfigError> for PlaygroundError {
    fn from(err: ConfigError) -> Self {
        PlaygroundError::Config(err)
    }
}

impl From<GraphicsError> for PlaygroundError {
    fn from(err: GraphicsError) -> Self {
        PlaygroundError::Graphics(err)
    }
}

impl From<ApiCallError> for PlaygroundError {
    fn from(err: ApiCallError) -> Self {
        PlaygroundError::Graphics(GraphicsError::ApiCall(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_call_error_captures_call_site() {
        let line = line!() + 1;
        let err = ApiCallError::new("CreateCommittedResource", 0x887A0005u32 as i32, "device removed");
        assert_eq!(err.location.line(), line);
        assert!(err.location.file().ends_with("error.rs"));

        let err: PlaygroundError = err.into();
        assert!(err.location().is_some());
        let text = err.to_string();
        assert!(text.contains("CreateCommittedResource"));
        assert!(text.contains("0x887a0005"));
    }

    #[test]
    fn test_exhaustion_message() {
        let err: PlaygroundError = GraphicsError::DescriptorHeapExhausted {
            heap: "resources",
            capacity: 4,
        }
        .into();
        assert_eq!(
            err.to_string(),
            "Graphics error: Descriptor heap 'resources' exhausted (capacity 4)"
        );
        assert!(err.location().is_none());
    }
}
