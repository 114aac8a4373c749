//! 软件模拟设备
//!
//! 不依赖 GPU 的 [`GraphicsBackend`] 实现，用于测试与 `--headless` 运行：
//!
//! - 提交在 CPU 等待 fence 时才执行，完成值不会自行前进
//! - 每条命令执行时检查资源的 GPU 侧状态，不一致记录为验证错误
//! - 计算与工作图程序按程序名映射到 CPU 内核（见 [`kernels`]）

pub mod compiler;
mod device;
pub mod kernels;
pub mod presenter;

use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::core::error::{GraphicsError, Result};
use crate::gfx::backend::{GpuCommand, GraphicsBackend, ViewDesc};
use crate::renderer::capability::{
    DeviceCapabilities, FeatureLevel, FormatSupport, MeshShaderTier, RaytracingTier, ResourceBindingTier,
    ResourceHeapTier, RootSignatureVersion, SamplerFeedbackTier, ShaderModel, VariableShadingRateTier,
    WaveLaneCount, WorkGraphsTier,
};
use crate::renderer::command::QueueType;
use crate::renderer::descriptor::{
    CpuDescriptorHandle, DescriptorHeapDescriptor, DescriptorHeapKind, DescriptorHeapLayout, DescriptorSlot,
    GpuDescriptorHandle,
};
use crate::renderer::pipeline::{PipelinePath, ProgramDesc, ProgramKind};
use crate::renderer::resource::{ResourceInfo, ResourceState, TextureFormat};
use crate::renderer::sync::FenceValue;

use device::{HeadlessDevice, Recorded, ResourceRecord, ViewRecord};
pub use compiler::HeadlessCompiler;
pub use device::ExecutionStats;
pub use kernels::{KernelContext, KernelRegistry};
pub use presenter::HeadlessPresenter;

/// 软件描述符大小
const DESCRIPTOR_SIZE: u32 = 32;

/// 软件设备报告的能力：支持无绑定、工作图与 SM 6.8
pub fn default_capabilities() -> DeviceCapabilities {
    DeviceCapabilities {
        adapter_name: "Headless Software Device".to_string(),
        dedicated_video_memory: 4 * 1024 * 1024 * 1024,
        feature_level: FeatureLevel::L12_2,
        shader_model: ShaderModel::SM_6_8,
        resource_binding_tier: ResourceBindingTier::Tier3,
        resource_heap_tier: ResourceHeapTier::Tier2,
        root_signature_version: RootSignatureVersion::V1_1,
        raytracing_tier: RaytracingTier::NotSupported,
        variable_shading_rate_tier: VariableShadingRateTier::NotSupported,
        mesh_shader_tier: MeshShaderTier::NotSupported,
        sampler_feedback_tier: SamplerFeedbackTier::NotSupported,
        enhanced_barriers: false,
        wave_lanes: WaveLaneCount { min: 32, max: 32 },
        work_graphs_tier: WorkGraphsTier::Tier1_0,
    }
}

/// 软件设备上的资源句柄
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeadlessResource {
    id: u64,
}

impl HeadlessResource {
    pub fn id(&self) -> u64 {
        self.id
    }
}

struct ProgramObject {
    name: String,
    kind: ProgramKind,
}

/// 软件设备上的程序对象，克隆共享同一个对象
#[derive(Clone)]
pub struct HeadlessProgram(Arc<ProgramObject>);

impl HeadlessProgram {
    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn kind(&self) -> ProgramKind {
        self.0.kind
    }

    /// 除自身外仍持有该程序的引用数（命令列表、延迟释放队列）
    pub fn extra_references(&self) -> usize {
        Arc::strong_count(&self.0) - 1
    }
}

impl fmt::Debug for HeadlessProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HeadlessProgram({})", self.0.name)
    }
}

/// 命令列表在后端的状态
#[derive(Default)]
struct CommandListRecord {
    recording: bool,
    commands: Vec<Recorded>,
    closed: Option<Vec<Recorded>>,
}

/// 软件设备后端
pub struct HeadlessBackend {
    device: HeadlessDevice,
    capabilities: DeviceCapabilities,
    lists: [CommandListRecord; 3],
    next_resource_id: u64,
}

impl HeadlessBackend {
    pub fn new() -> Self {
        Self::with_capabilities(default_capabilities())
    }

    /// 模拟能力不同的设备，例如不支持工作图的显卡
    pub fn with_capabilities(capabilities: DeviceCapabilities) -> Self {
        Self {
            device: HeadlessDevice::new(KernelRegistry::with_builtins()),
            capabilities,
            lists: Default::default(),
            next_resource_id: 1,
        }
    }

    pub fn kernels_mut(&mut self) -> &mut KernelRegistry {
        &mut self.device.kernels
    }

    /// 执行期间发现的所有状态错误
    pub fn validation_errors(&self) -> &[String] {
        &self.device.validation_errors
    }

    pub fn execution_stats(&self) -> ExecutionStats {
        self.device.stats
    }

    /// 资源在已执行命令之后的 GPU 侧状态
    pub fn resource_state(&self, resource: &HeadlessResource) -> Option<ResourceState> {
        self.device.resources.get(&resource.id).map(|r| r.gpu_state)
    }

    pub fn resource_data(&self, resource: &HeadlessResource) -> Option<&[u8]> {
        self.device
            .resources
            .get(&resource.id)
            .filter(|r| !r.destroyed)
            .map(|r| r.data.as_slice())
    }

    pub fn live_resource_count(&self) -> usize {
        self.device.resources.values().filter(|r| !r.destroyed).count()
    }

    /// 之后的 fence 等待都会失败
    pub fn simulate_device_removed(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(reason = %reason, "Headless device removed");
        self.device.removed_reason = Some(reason);
    }

    /// 在图形队列时间线上排入一次呈现
    pub fn queue_present(&mut self, back_buffer: &HeadlessResource) {
        self.device.present(back_buffer.id);
    }

    fn list(&mut self, queue: QueueType) -> &mut CommandListRecord {
        &mut self.lists[queue.index()]
    }

    fn buffer_range(&self, resource: &HeadlessResource, offset: u64, len: usize) -> Result<std::ops::Range<usize>> {
        let record = self
            .device
            .resources
            .get(&resource.id)
            .filter(|r| !r.destroyed)
            .ok_or_else(|| GraphicsError::CommandExecution(format!("resource {} does not exist", resource.id)))?;

        let range = usize::try_from(offset)
            .ok()
            .and_then(|start| Some(start..start.checked_add(len)?))
            .filter(|range| range.end <= record.data.len());
        range.ok_or_else(|| {
            GraphicsError::CommandExecution(format!(
                "{} bytes at offset {} outside '{}' ({} bytes)",
                len,
                offset,
                record.name,
                record.data.len()
            ))
            .into()
        })
    }
}

impl Default for HeadlessBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphicsBackend for HeadlessBackend {
    type Resource = HeadlessResource;
    type Program = HeadlessProgram;

    fn backend_name(&self) -> &str {
        "Headless"
    }

    fn query_capabilities(&self) -> Result<DeviceCapabilities> {
        Ok(self.capabilities.clone())
    }

    fn format_support(&self, format: TextureFormat) -> Result<FormatSupport> {
        Ok(FormatSupport {
            render_target: !format.is_depth() && format != TextureFormat::R32Uint,
            typed_uav_store: !format.is_depth(),
            shader_sample: format != TextureFormat::R32Uint,
        })
    }

    fn create_descriptor_heap(&mut self, desc: &DescriptorHeapDescriptor) -> Result<DescriptorHeapLayout> {
        let base = match desc.kind {
            DescriptorHeapKind::Resources => 1u64,
            DescriptorHeapKind::Sampler => 2,
            DescriptorHeapKind::Rtv => 3,
            DescriptorHeapKind::Dsv => 4,
        } << 32;

        Ok(DescriptorHeapLayout {
            cpu_start: CpuDescriptorHandle::new(base as usize),
            gpu_start: desc.shader_visible.then(|| GpuDescriptorHandle::new(base << 8)),
            increment_size: DESCRIPTOR_SIZE,
        })
    }

    fn create_view(&mut self, resource: &HeadlessResource, view: &ViewDesc, slot: &DescriptorSlot) -> Result<()> {
        self.device
            .check_view(resource.id, view)
            .map_err(GraphicsError::ResourceCreation)?;

        self.device.views.insert(
            (slot.heap, slot.bindless_index),
            ViewRecord {
                resource: resource.id,
                view: *view,
            },
        );
        Ok(())
    }

    fn reset_command_list(&mut self, queue: QueueType, _allocator_index: usize) -> Result<()> {
        let list = self.list(queue);
        if list.recording {
            return Err(GraphicsError::CommandExecution(format!("{} command list reset while recording", queue)).into());
        }
        list.recording = true;
        list.commands.clear();
        Ok(())
    }

    fn close_command_list(&mut self, queue: QueueType) -> Result<()> {
        let list = self.list(queue);
        if !list.recording {
            return Err(GraphicsError::CommandExecution(format!("{} command list is not recording", queue)).into());
        }
        list.recording = false;
        list.closed = Some(std::mem::take(&mut list.commands));
        Ok(())
    }

    fn execute_command_list(&mut self, queue: QueueType) -> Result<()> {
        let commands = self
            .list(queue)
            .closed
            .take()
            .ok_or_else(|| GraphicsError::CommandExecution(format!("{} command list was not closed", queue)))?;
        self.device.submit(queue, commands);
        Ok(())
    }

    fn record(&mut self, queue: QueueType, command: GpuCommand<'_, Self>) -> Result<()> {
        let recorded = match command {
            GpuCommand::Barrier { resource, before, after } => Recorded::Barrier {
                resource: resource.id,
                before,
                after,
            },
            GpuCommand::CopyResource { dst, src } => Recorded::CopyResource { dst: dst.id, src: src.id },
            GpuCommand::CopyTextureToBuffer { dst, src, row_pitch } => Recorded::CopyTextureToBuffer {
                dst: dst.id,
                src: src.id,
                row_pitch,
            },
            GpuCommand::SetProgram(program) => Recorded::SetProgram(program.clone()),
            GpuCommand::SetRootConstants { constants, dest_offset } => Recorded::SetRootConstants {
                constants: constants.to_vec(),
                dest_offset,
            },
            GpuCommand::Dispatch { x, y, z } => Recorded::Dispatch { x, y, z },
            GpuCommand::DispatchGraph {
                program,
                records,
                num_records,
                record_stride,
            } => Recorded::DispatchGraph {
                program: program.clone(),
                records: records.to_vec(),
                num_records,
                record_stride,
            },
            GpuCommand::ClearRenderTarget { rtv, color } => Recorded::ClearRenderTarget {
                rtv: rtv.bindless_index,
                color,
            },
            GpuCommand::SetRenderTarget { rtv } => Recorded::SetRenderTarget { rtv: rtv.bindless_index },
            GpuCommand::SetViewport { width, height } => Recorded::SetViewport { width, height },
            GpuCommand::SetVertexBuffer(view) => Recorded::SetVertexBuffer(view),
            GpuCommand::DrawInstanced {
                vertex_count,
                instance_count,
            } => Recorded::DrawInstanced {
                vertex_count,
                instance_count,
            },
            GpuCommand::DrawIndirect { args, offset } => Recorded::DrawIndirect { args: args.id, offset },
        };

        let list = self.list(queue);
        if !list.recording {
            return Err(GraphicsError::CommandExecution(format!("{} command list is not recording", queue)).into());
        }
        list.commands.push(recorded);
        Ok(())
    }

    fn signal(&mut self, queue: QueueType, value: FenceValue) -> Result<()> {
        self.device.signal(queue, value);
        Ok(())
    }

    fn wait_for_fence(&mut self, value: FenceValue) -> Result<()> {
        if let Some(reason) = &self.device.removed_reason {
            return Err(GraphicsError::DeviceRemoved(reason.clone()).into());
        }
        if !self.device.will_reach(value) {
            return Err(GraphicsError::CommandExecution(format!(
                "waiting for fence {} that is never signaled",
                value
            ))
            .into());
        }

        self.device.run_until(value);
        Ok(())
    }

    fn completed_fence_value(&self) -> Result<FenceValue> {
        Ok(self.device.completed())
    }

    fn create_committed_resource(&mut self, info: &ResourceInfo, name: &str) -> Result<HeadlessResource> {
        let id = self.next_resource_id;
        self.next_resource_id += 1;
        self.device.resources.insert(id, ResourceRecord::new(*info, name));
        Ok(HeadlessResource { id })
    }

    fn destroy_resource(&mut self, resource: HeadlessResource) {
        if let Some(record) = self.device.resources.get_mut(&resource.id) {
            debug!(name = %record.name, "Headless resource destroyed");
            record.destroyed = true;
            record.data = Vec::new();
        }
    }

    fn gpu_virtual_address(&self, resource: &HeadlessResource) -> u64 {
        resource.id << 32
    }

    fn write_buffer(&mut self, resource: &HeadlessResource, offset: u64, data: &[u8]) -> Result<()> {
        let range = self.buffer_range(resource, offset, data.len())?;
        if let Some(record) = self.device.resources.get_mut(&resource.id) {
            record.data[range].copy_from_slice(data);
        }
        Ok(())
    }

    fn read_buffer(&mut self, resource: &HeadlessResource, offset: u64, out: &mut [u8]) -> Result<()> {
        let range = self.buffer_range(resource, offset, out.len())?;
        out.copy_from_slice(&self.device.resources[&resource.id].data[range]);
        Ok(())
    }

    fn build_program(&mut self, desc: &ProgramDesc, path: PipelinePath) -> Result<HeadlessProgram> {
        debug!(program = %desc.name, %path, "Headless program built");
        Ok(HeadlessProgram(Arc::new(ProgramObject {
            name: desc.name.clone(),
            kind: desc.kind,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::resource::{HeapType, ResourceFlags};

    fn buffer(backend: &mut HeadlessBackend, heap: HeapType, size: u64) -> HeadlessResource {
        let info = ResourceInfo::buffer(heap, ResourceFlags::NONE, size);
        backend.create_committed_resource(&info, "Buffer").unwrap()
    }

    #[test]
    fn test_work_runs_only_when_waited() {
        let mut backend = HeadlessBackend::new();
        let upload = buffer(&mut backend, HeapType::Upload, 4);
        let readback = buffer(&mut backend, HeapType::Readback, 4);
        backend.write_buffer(&upload, 0, &[1, 2, 3, 4]).unwrap();

        backend.reset_command_list(QueueType::Copy, 0).unwrap();
        backend
            .record(QueueType::Copy, GpuCommand::CopyResource { dst: &readback, src: &upload })
            .unwrap();
        backend.close_command_list(QueueType::Copy).unwrap();
        backend.execute_command_list(QueueType::Copy).unwrap();
        backend.signal(QueueType::Copy, FenceValue::new(1)).unwrap();

        assert_eq!(backend.completed_fence_value().unwrap(), FenceValue::ZERO);
        assert_eq!(backend.resource_data(&readback), Some(&[0u8, 0, 0, 0][..]));

        backend.wait_for_fence(FenceValue::new(1)).unwrap();
        assert_eq!(backend.completed_fence_value().unwrap(), FenceValue::new(1));
        assert_eq!(backend.resource_data(&readback), Some(&[1u8, 2, 3, 4][..]));
        assert!(backend.validation_errors().is_empty());
    }

    #[test]
    fn test_barrier_mismatch_is_reported() {
        let mut backend = HeadlessBackend::new();
        let target = buffer(&mut backend, HeapType::Default, 16);

        backend.reset_command_list(QueueType::Graphics, 0).unwrap();
        backend
            .record(
                QueueType::Graphics,
                GpuCommand::Barrier {
                    resource: &target,
                    before: ResourceState::CopySource,
                    after: ResourceState::CopyDest,
                },
            )
            .unwrap();
        backend.close_command_list(QueueType::Graphics).unwrap();
        backend.execute_command_list(QueueType::Graphics).unwrap();
        backend.signal(QueueType::Graphics, FenceValue::new(1)).unwrap();
        backend.wait_for_fence(FenceValue::new(1)).unwrap();

        assert_eq!(backend.validation_errors().len(), 1);
        assert_eq!(backend.resource_state(&target), Some(ResourceState::Common));
    }

    #[test]
    fn test_wait_without_signal_fails() {
        let mut backend = HeadlessBackend::new();
        assert!(backend.wait_for_fence(FenceValue::new(3)).is_err());
        assert!(backend.wait_for_fence(FenceValue::ZERO).is_ok());
    }

    #[test]
    fn test_device_removed_surfaces_on_wait() {
        let mut backend = HeadlessBackend::new();
        backend.signal(QueueType::Graphics, FenceValue::new(1)).unwrap();
        backend.simulate_device_removed("DXGI_ERROR_DEVICE_HUNG");

        match backend.wait_for_fence(FenceValue::new(1)) {
            Err(crate::core::error::PlaygroundError::Graphics(GraphicsError::DeviceRemoved(reason))) => {
                assert!(reason.contains("HUNG"))
            }
            other => panic!("expected device removal, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_clear_fills_target_and_draw_needs_viewport() {
        use crate::gfx::backend::ViewDimension;
        use crate::renderer::descriptor::{DescriptorType, GpuDescriptorHandle};
        use crate::renderer::resource::VertexBufferView;
        use crate::renderer::shader::{ShaderBlob, ShaderDesc, ShaderStage};

        let mut backend = HeadlessBackend::new();
        let info = ResourceInfo::texture2d(
            HeapType::Default,
            ResourceFlags::ALLOW_RENDER_TARGET,
            2,
            2,
            TextureFormat::Rgba8Unorm,
        )
        .with_initial_state(ResourceState::RenderTarget);
        let target = backend.create_committed_resource(&info, "Target").unwrap();
        let rtv = DescriptorSlot {
            heap: DescriptorHeapKind::Rtv,
            cpu: CpuDescriptorHandle::new(0),
            gpu: None::<GpuDescriptorHandle>,
            bindless_index: 0,
        };
        let view = ViewDesc {
            kind: DescriptorType::RenderTargetView,
            dimension: ViewDimension::Texture2D {
                format: TextureFormat::Rgba8Unorm,
            },
        };
        backend.create_view(&target, &view, &rtv).unwrap();

        let blob = |stage| ShaderBlob::from_bytes(ShaderDesc::new(stage, "Triangle.hlsl", "main"), vec![0]);
        let program = backend
            .build_program(
                &ProgramDesc::graphics(
                    "Triangle",
                    blob(ShaderStage::Vertex),
                    blob(ShaderStage::Pixel),
                    TextureFormat::Rgba8Unorm,
                ),
                PipelinePath::LegacyPso,
            )
            .unwrap();
        let vertices = VertexBufferView {
            buffer_location: 0,
            size_in_bytes: 84,
            stride_in_bytes: 28,
        };

        let queue = QueueType::Graphics;
        backend.reset_command_list(queue, 0).unwrap();
        for command in [
            GpuCommand::ClearRenderTarget {
                rtv,
                color: [1.0, 0.5, 0.0, 1.0],
            },
            GpuCommand::SetProgram(&program),
            GpuCommand::SetRenderTarget { rtv },
            GpuCommand::SetVertexBuffer(vertices),
            GpuCommand::DrawInstanced {
                vertex_count: 3,
                instance_count: 1,
            },
            GpuCommand::SetViewport { width: 2, height: 2 },
            GpuCommand::DrawInstanced {
                vertex_count: 3,
                instance_count: 1,
            },
        ] {
            backend.record(queue, command).unwrap();
        }
        backend.close_command_list(queue).unwrap();
        backend.execute_command_list(queue).unwrap();
        backend.signal(queue, FenceValue::new(1)).unwrap();
        backend.wait_for_fence(FenceValue::new(1)).unwrap();

        let pixels = backend.resource_data(&target).unwrap();
        assert_eq!(&pixels[..4], &[255, 128, 0, 255]);
        assert_eq!(&pixels[12..], &[255, 128, 0, 255]);
        assert_eq!(backend.validation_errors().len(), 1);
        assert!(backend.validation_errors()[0].contains("viewport"));
        assert_eq!(backend.execution_stats().draws, 1);
    }

    #[test]
    fn test_record_requires_recording_list() {
        let mut backend = HeadlessBackend::new();
        assert!(backend
            .record(QueueType::Compute, GpuCommand::Dispatch { x: 1, y: 1, z: 1 })
            .is_err());
        assert!(backend.close_command_list(QueueType::Compute).is_err());
        assert!(backend.execute_command_list(QueueType::Compute).is_err());
    }
}
