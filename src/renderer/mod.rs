//! 渲染核心模块
//!
//! 与具体图形 API 无关的帧资源与命令提交生命周期。设备调用通过
//! [`GraphicsBackend`](crate::gfx::GraphicsBackend) 交给 `gfx` 中的后端。
//!
//! # 模块组织
//!
//! - `context`：设备上下文，三条命令流、共享 fence、状态转换与视图创建
//! - `sync`：fence 值、帧槽位与延迟释放队列
//! - `command`：命令流状态机
//! - `descriptor`：描述符堆与无绑定槽位分配
//! - `resource`：缓冲、顶点缓冲与纹理
//! - `capability`：设备能力查询结果
//! - `shader` / `pipeline`：着色器编译接口与程序构建
//! - `capture`：PIX / RenderDoc 抓帧
//! - `frame`：帧驱动与交换链接口

pub mod capability;
pub mod capture;
pub mod command;
pub mod context;
pub mod descriptor;
pub mod frame;
pub mod pipeline;
pub mod resource;
pub mod shader;
pub mod sync;

pub use context::{ContextDesc, DeviceContext};
pub use frame::{FrameDriver, Presenter};
pub use pipeline::{PipelinePath, Program, ProgramDesc};
pub use resource::{Resource, ResourceState};
