//! 设备后端的统一抽象接口
//!
//! [`DeviceContext`](crate::renderer::context::DeviceContext) 负责所有与 API 无关的
//! 记账（命令流状态、fence 值、描述符槽位、资源状态），真正的设备调用通过本 trait
//! 交给具体后端：
//!
//! - `Dx12Backend`：Windows 上的 Direct3D 12 设备
//! - `HeadlessBackend`：软件模拟设备，提交在 CPU 等待时才执行，并像验证层一样
//!   检查每条命令执行时资源所处的状态
//!
//! 后端本身不做状态检查以外的策略决策，也不重试失败的调用。

use std::fmt::Debug;

use crate::core::error::Result;
use crate::renderer::capability::{DeviceCapabilities, FormatSupport};
use crate::renderer::command::QueueType;
use crate::renderer::descriptor::{DescriptorHeapDescriptor, DescriptorHeapLayout, DescriptorSlot, DescriptorType};
use crate::renderer::pipeline::{PipelinePath, ProgramDesc};
use crate::renderer::resource::{ResourceInfo, ResourceState, TextureFormat, VertexBufferView};
use crate::renderer::sync::FenceValue;

/// 视图维度
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewDimension {
    /// 结构化或原始缓冲，`stride == 0` 表示原始 (R32_TYPELESS) 视图
    Buffer { first_element: u64, num_elements: u32, stride: u32 },
    Texture2D { format: TextureFormat },
    /// 整个缓冲作为常量缓冲
    ConstantBuffer,
}

/// 视图描述
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewDesc {
    pub kind: DescriptorType,
    pub dimension: ViewDimension,
}

impl ViewDesc {
    pub fn texture2d(kind: DescriptorType, format: TextureFormat) -> Self {
        Self {
            kind,
            dimension: ViewDimension::Texture2D { format },
        }
    }

    pub fn structured_buffer(kind: DescriptorType, num_elements: u32, stride: u32) -> Self {
        Self {
            kind,
            dimension: ViewDimension::Buffer {
                first_element: 0,
                num_elements,
                stride,
            },
        }
    }

    pub fn constant_buffer() -> Self {
        Self {
            kind: DescriptorType::ConstantBufferView,
            dimension: ViewDimension::ConstantBuffer,
        }
    }
}

/// 录制到命令列表的一条命令
///
/// 命令只借用原生对象；上下文保证被引用的对象活到这次提交完成。
pub enum GpuCommand<'a, B: GraphicsBackend + ?Sized> {
    Barrier {
        resource: &'a B::Resource,
        before: ResourceState,
        after: ResourceState,
    },
    CopyResource {
        dst: &'a B::Resource,
        src: &'a B::Resource,
    },
    /// 纹理按 `row_pitch` 行距写入缓冲（placed footprint）
    CopyTextureToBuffer {
        dst: &'a B::Resource,
        src: &'a B::Resource,
        row_pitch: u64,
    },
    SetProgram(&'a B::Program),
    SetRootConstants {
        constants: &'a [u32],
        dest_offset: u32,
    },
    Dispatch {
        x: u32,
        y: u32,
        z: u32,
    },
    /// 从 CPU 提供的种子记录启动工作图
    DispatchGraph {
        program: &'a B::Program,
        records: &'a [u8],
        num_records: u32,
        record_stride: u32,
    },
    ClearRenderTarget {
        rtv: DescriptorSlot,
        color: [f32; 4],
    },
    SetRenderTarget {
        rtv: DescriptorSlot,
    },
    SetViewport {
        width: u32,
        height: u32,
    },
    SetVertexBuffer(VertexBufferView),
    DrawInstanced {
        vertex_count: u32,
        instance_count: u32,
    },
    /// 参数缓冲中存放一个 `D3D12_DRAW_ARGUMENTS`
    DrawIndirect {
        args: &'a B::Resource,
        offset: u64,
    },
}

impl<B: GraphicsBackend + ?Sized> GpuCommand<'_, B> {
    /// 用于日志与错误消息
    pub fn name(&self) -> &'static str {
        match self {
            GpuCommand::Barrier { .. } => "ResourceBarrier",
            GpuCommand::CopyResource { .. } => "CopyResource",
            GpuCommand::CopyTextureToBuffer { .. } => "CopyTextureRegion",
            GpuCommand::SetProgram(_) => "SetProgram",
            GpuCommand::SetRootConstants { .. } => "SetRoot32BitConstants",
            GpuCommand::Dispatch { .. } => "Dispatch",
            GpuCommand::DispatchGraph { .. } => "DispatchGraph",
            GpuCommand::ClearRenderTarget { .. } => "ClearRenderTargetView",
            GpuCommand::SetRenderTarget { .. } => "OMSetRenderTargets",
            GpuCommand::SetViewport { .. } => "RSSetViewports",
            GpuCommand::SetVertexBuffer(_) => "IASetVertexBuffers",
            GpuCommand::DrawInstanced { .. } => "DrawInstanced",
            GpuCommand::DrawIndirect { .. } => "ExecuteIndirect",
        }
    }
}

/// 设备后端的统一接口
///
/// 所有方法都可能失败，失败立即以 [`Result`] 返回给调用方。
pub trait GraphicsBackend {
    /// 原生资源句柄
    type Resource: Clone + Debug;
    /// 原生程序对象（PSO 或 state object）
    type Program: Clone;

    fn backend_name(&self) -> &str;

    /// 查询设备能力，每次调用都重新探测
    fn query_capabilities(&self) -> Result<DeviceCapabilities>;

    fn format_support(&self, format: TextureFormat) -> Result<FormatSupport>;

    fn create_descriptor_heap(&mut self, desc: &DescriptorHeapDescriptor) -> Result<DescriptorHeapLayout>;

    /// 在 `slot` 处写入视图
    fn create_view(&mut self, resource: &Self::Resource, view: &ViewDesc, slot: &DescriptorSlot) -> Result<()>;

    /// 重置 `queue` 的分配器与命令列表，并绑定着色器可见堆
    fn reset_command_list(&mut self, queue: QueueType, allocator_index: usize) -> Result<()>;

    fn close_command_list(&mut self, queue: QueueType) -> Result<()>;

    fn execute_command_list(&mut self, queue: QueueType) -> Result<()>;

    fn record(&mut self, queue: QueueType, command: GpuCommand<'_, Self>) -> Result<()>;

    /// 在 `queue` 上 signal 共享 fence
    fn signal(&mut self, queue: QueueType, value: FenceValue) -> Result<()>;

    /// 阻塞直到 fence 达到 `value`（无超时）；设备移除时返回 `DeviceRemoved`
    fn wait_for_fence(&mut self, value: FenceValue) -> Result<()>;

    fn completed_fence_value(&self) -> Result<FenceValue>;

    fn create_committed_resource(&mut self, info: &ResourceInfo, name: &str) -> Result<Self::Resource>;

    /// 销毁原生资源，调用方保证 GPU 不再引用它
    fn destroy_resource(&mut self, resource: Self::Resource) {
        drop(resource);
    }

    fn gpu_virtual_address(&self, resource: &Self::Resource) -> u64;

    /// 写入 upload 堆缓冲
    fn write_buffer(&mut self, resource: &Self::Resource, offset: u64, data: &[u8]) -> Result<()>;

    /// 读取 readback 堆缓冲
    fn read_buffer(&mut self, resource: &Self::Resource, offset: u64, out: &mut [u8]) -> Result<()>;

    fn build_program(&mut self, desc: &ProgramDesc, path: PipelinePath) -> Result<Self::Program>;
}
