//! 核心功能模块
//!
//! 提供与具体图形 API 无关的基础设施：日志、配置、错误处理和窗口事件。
//!
//! # 模块组织
//!
//! - `log`：日志系统，基于 tracing 的结构化日志
//! - `config`：配置管理，支持从 config.toml 加载并被命令行覆盖
//! - `error`：错误处理，定义统一的错误类型
//! - `event`：帧驱动消费的窗口事件
//! - `units`：字节数换算

pub mod config;
pub mod error;
pub mod event;
pub mod log;
pub mod units;

pub use config::Config;
pub use error::{ApiCallError, ConfigError, GraphicsError, PlaygroundError, Result};
pub use event::{FrameEvent, KeyCode, LoopControl};
