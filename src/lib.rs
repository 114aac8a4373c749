//! Compute Playground - GPU 管线实验平台
//!
//! 建立图形设备、编译着色器、构建传统 PSO 与通用程序（state object），
//! 并驱动每帧的命令提交循环：计算调度、间接绘制与 GPU 工作图。
//!
//! # 模块结构
//!
//! - `core`: 核心功能模块（日志、配置、错误处理、窗口事件）
//! - `renderer`: 设备上下文、资源、描述符、程序构建与帧驱动
//! - `gfx`: 设备后端（DirectX 12 与软件模拟设备）
//!
//! # 使用示例
//!
//! ```no_run
//! use compute_playground::gfx::HeadlessBackend;
//! use compute_playground::renderer::{ContextDesc, DeviceContext};
//!
//! let mut context = DeviceContext::new(HeadlessBackend::new(), &ContextDesc::default())?;
//! context.init_command_lists()?;
//! context.execute_command_list_graphics()?;
//! context.flush(3)?;
//! # Ok::<(), compute_playground::core::PlaygroundError>(())
//! ```

pub mod core;
pub mod gfx;
pub mod renderer;
