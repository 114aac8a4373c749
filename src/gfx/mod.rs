//! 图形后端模块
//!
//! 本模块封装了设备层的具体实现：
//! - DirectX 12：Windows 平台的真实设备（`windows` crate）
//! - Headless：软件模拟设备，测试与无 GPU 环境使用
//!
//! 所有后端都实现了统一的 `GraphicsBackend` trait，
//! 上层的 `DeviceContext` 与帧驱动对具体后端一无所知。

pub mod backend;
#[cfg(target_os = "windows")]
pub mod dx12;
pub mod headless;

pub use backend::GraphicsBackend;
#[cfg(target_os = "windows")]
pub use dx12::Dx12Backend;
pub use headless::HeadlessBackend;
