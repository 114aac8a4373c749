//! DirectX 12 设备后端
//!
//! - `context`：设备、队列、命令列表与 fence（[`Dx12Backend`]）
//! - `descriptor`：描述符堆
//! - `program`：根签名、PSO 与工作图 state object
//! - `query`：能力探测
//! - `compiler`：DXC 编译器
//! - `swapchain`：DXGI 交换链
//! - `capture`：PIX / RenderDoc 抓帧
//! - `debug`：调试层与信息队列

pub mod capture;
mod check;
pub mod compiler;
pub mod context;
mod convert;
pub mod debug;
pub mod descriptor;
pub mod program;
pub mod query;
mod resource;
pub mod swapchain;

pub use compiler::DxcCompiler;
pub use context::Dx12Backend;
pub use program::Dx12Program;
pub use swapchain::Dx12Presenter;
