//! 设备上下文
//!
//! 平台的核心：持有一个设备后端、三条命令流（图形、计算、复制）、一个共享的
//! 单调 fence、帧槽位、描述符堆，以及以 fence 为门槛的延迟释放队列。所有资源
//! 状态转换、视图创建与提交都经过这里。
//!
//! # 提交模型
//!
//! - `execute_command_list_*`：关闭、提交、signal 并等待（同步）
//! - `end_frame`：提交图形命令流后只 signal，不等待；复用帧槽位时
//!   `begin_frame` 只等待该槽位的 fence
//! - `flush(n)`：连续 n 次 signal-and-wait，之后 GPU 空闲
//! - 释放：有命令流录了命令尚未提交时，被释放的对象等这些命令流提交后才以
//!   那次提交的 fence 值进入延迟释放队列
//!
//! # 线程模型
//!
//! 单线程录制与提交。上下文不是线程安全的，程序顺序即 GPU 顺序。

use tracing::{debug, info, trace, warn};

use crate::core::config::GraphicsConfig;
use crate::core::error::{GraphicsError, PlaygroundError, Result};
use crate::gfx::backend::{GpuCommand, GraphicsBackend, ViewDesc, ViewDimension};

use super::capability::DeviceCapabilities;
use super::command::{CommandStream, QueueType};
use super::descriptor::{
    DescriptorHeapDescriptor, DescriptorHeapKind, DescriptorHeapLayout, DescriptorHeapStats, DescriptorManager,
    DescriptorSlot, DescriptorType,
};
use super::pipeline::{Program, ProgramKind};
use super::resource::{
    HeapType, Resource, ResourceDimension, ResourceFlags, ResourceInfo, ResourceState, VertexBufferResource,
    CONSTANT_BUFFER_ALIGNMENT,
};
use super::sync::{DeferredReleaseQueue, FenceCounter, FenceValue, FramePool, SubmissionHold};

/// 单个维度上 Dispatch 线程组数量的上限
pub const MAX_DISPATCH_GROUPS: u32 = 65535;
/// `D3D12_DRAW_ARGUMENTS` 的大小
pub const DRAW_ARGUMENTS_SIZE: u64 = 16;

/// 上下文创建参数
#[derive(Debug, Clone)]
pub struct ContextDesc {
    /// 帧槽位数量，等于后备缓冲数
    pub frame_count: usize,
    /// 按 [`DescriptorHeapKind::ALL`] 顺序给出的堆容量
    pub heap_capacities: [u32; 4],
}

impl ContextDesc {
    pub fn from_config(graphics: &GraphicsConfig) -> Self {
        Self {
            frame_count: graphics.back_buffer_count as usize,
            heap_capacities: [
                graphics.resource_descriptor_capacity,
                graphics.sampler_descriptor_capacity,
                graphics.rtv_descriptor_capacity,
                graphics.dsv_descriptor_capacity,
            ],
        }
    }
}

impl Default for ContextDesc {
    fn default() -> Self {
        Self {
            frame_count: 3,
            heap_capacities: [4096, 64, 16, 8],
        }
    }
}

/// 运行统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContextStats {
    pub signal_and_waits: u64,
    pub flushes: u64,
    pub barriers: u64,
    pub submissions: u64,
    pub frames: u64,
}

/// 命令列表上当前绑定的程序
#[derive(Debug, Clone, Copy)]
struct BoundProgram {
    kind: ProgramKind,
    root_constant_count: Option<u32>,
}

/// 设备上下文
pub struct DeviceContext<B: GraphicsBackend> {
    backend: B,
    streams: [CommandStream; 3],
    fence: FenceCounter,
    frames: FramePool,
    descriptors: DescriptorManager,
    retired_resources: DeferredReleaseQueue<B::Resource>,
    retained_programs: DeferredReleaseQueue<B::Program>,
    /// 释放时仍有未提交命令的对象，等对应命令流提交后才进入上面的队列
    held_descriptors: SubmissionHold<DescriptorSlot>,
    held_resources: SubmissionHold<B::Resource>,
    held_programs: SubmissionHold<B::Program>,
    /// 每条命令流自打开以来引用的程序
    recording_programs: [Vec<B::Program>; 3],
    bound_programs: [Option<BoundProgram>; 3],
    stats: ContextStats,
}

impl<B: GraphicsBackend> DeviceContext<B> {
    /// 创建上下文并建立四个描述符堆
    pub fn new(mut backend: B, desc: &ContextDesc) -> Result<Self> {
        if desc.frame_count == 0 {
            return Err(PlaygroundError::Initialization(
                "At least one frame slot required".to_string(),
            ));
        }

        let capabilities = backend.query_capabilities()?;
        info!(
            backend = backend.backend_name(),
            adapter = %capabilities.adapter_name,
            frames = desc.frame_count,
            "Device context created"
        );
        debug!("Device capabilities:\n{}", capabilities.dump());

        let [resources, samplers, rtvs, dsvs] = desc.heap_capacities;
        let heap_descs = [
            DescriptorHeapDescriptor::resources(resources),
            DescriptorHeapDescriptor::sampler(samplers),
            DescriptorHeapDescriptor::rtv(rtvs),
            DescriptorHeapDescriptor::dsv(dsvs),
        ];

        let mut layouts = Vec::with_capacity(heap_descs.len());
        for heap_desc in &heap_descs {
            layouts.push(backend.create_descriptor_heap(heap_desc)?);
            debug!(
                heap = heap_desc.kind.name(),
                capacity = heap_desc.num_descriptors,
                shader_visible = heap_desc.shader_visible,
                "Descriptor heap created"
            );
        }
        let layouts: [DescriptorHeapLayout; 4] = layouts
            .try_into()
            .map_err(|_| PlaygroundError::Initialization("descriptor heap layout count mismatch".to_string()))?;

        Ok(Self {
            backend,
            streams: QueueType::ALL.map(|queue| CommandStream::new(queue, desc.frame_count)),
            fence: FenceCounter::new(),
            frames: FramePool::new(desc.frame_count),
            descriptors: DescriptorManager::new(desc.heap_capacities, layouts),
            retired_resources: DeferredReleaseQueue::new(),
            retained_programs: DeferredReleaseQueue::new(),
            held_descriptors: SubmissionHold::new(),
            held_resources: SubmissionHold::new(),
            held_programs: SubmissionHold::new(),
            recording_programs: [Vec::new(), Vec::new(), Vec::new()],
            bound_programs: [None; 3],
            stats: ContextStats::default(),
        })
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// 重新探测设备能力
    pub fn capabilities(&self) -> Result<DeviceCapabilities> {
        self.backend.query_capabilities()
    }

    pub fn stats(&self) -> ContextStats {
        self.stats
    }

    pub fn stream(&self, queue: QueueType) -> &CommandStream {
        &self.streams[queue.index()]
    }

    pub fn is_open(&self, queue: QueueType) -> bool {
        self.stream(queue).is_open()
    }

    /// 最后一次 signal 的 fence 值
    pub fn fence_value(&self) -> FenceValue {
        self.fence.current_value()
    }

    pub fn completed_fence_value(&self) -> FenceValue {
        self.fence.completed_value()
    }

    /// 所有已 signal 的工作都已完成
    pub fn is_idle(&self) -> bool {
        self.fence.is_idle()
    }

    pub fn frame_index(&self) -> usize {
        self.frames.current_index()
    }

    pub fn frame_count(&self) -> usize {
        self.frames.count()
    }

    /// 某个帧槽位最后一次提交的 fence 值
    pub fn frame_fence(&self, index: usize) -> Option<FenceValue> {
        self.frames.get(index).map(|slot| slot.fence_value)
    }

    fn refresh_completed(&mut self) -> Result<FenceValue> {
        let value = self.backend.completed_fence_value()?;
        self.fence.update_completed_value(value);
        Ok(self.fence.completed_value())
    }

    // ---------------------------------------------------------------------
    // 命令流
    // ---------------------------------------------------------------------

    /// 打开所有尚未打开的命令流
    ///
    /// 使用当前帧槽位的分配器；分配器上一次提交必须已经完成。
    pub fn init_command_lists(&mut self) -> Result<()> {
        let completed = self.refresh_completed()?;
        let allocator = self.frames.current_index();

        for queue in QueueType::ALL {
            let stream = &mut self.streams[queue.index()];
            if stream.is_open() {
                continue;
            }

            stream.begin(allocator, completed)?;
            self.backend.reset_command_list(queue, allocator)?;
            self.bound_programs[queue.index()] = None;
            trace!(queue = %queue, allocator, "Command list opened");
        }

        Ok(())
    }

    pub fn execute_command_list_graphics(&mut self) -> Result<()> {
        self.execute_command_list(QueueType::Graphics).map(|_| ())
    }

    pub fn execute_command_list_compute(&mut self) -> Result<()> {
        self.execute_command_list(QueueType::Compute).map(|_| ())
    }

    pub fn execute_command_list_copy(&mut self) -> Result<()> {
        self.execute_command_list(QueueType::Copy).map(|_| ())
    }

    /// 关闭并提交 `queue` 的命令列表，然后在该队列上 signal 并等待
    pub fn execute_command_list(&mut self, queue: QueueType) -> Result<FenceValue> {
        self.submit(queue)?;
        let value = self.signal_and_wait_on(queue)?;
        self.finish_submission(queue, value);
        Ok(value)
    }

    fn submit(&mut self, queue: QueueType) -> Result<()> {
        let stream = &mut self.streams[queue.index()];
        stream.close()?;
        self.backend.close_command_list(queue)?;
        self.backend.execute_command_list(queue)?;
        self.stats.submissions += 1;
        Ok(())
    }

    fn finish_submission(&mut self, queue: QueueType, value: FenceValue) {
        let index = queue.index();
        self.streams[index].mark_submitted(value);
        self.bound_programs[index] = None;
        for program in self.recording_programs[index].drain(..) {
            self.retained_programs.push(value, program);
        }

        for slot in self.held_descriptors.submitted(index) {
            self.descriptors.defer(slot, value);
        }
        for resource in self.held_resources.submitted(index) {
            self.retired_resources.push(value, resource);
        }
        for program in self.held_programs.submitted(index) {
            self.retained_programs.push(value, program);
        }
        trace!(queue = %queue, fence = %value, "Command list submitted");
    }

    /// 在图形队列上 signal 一个新值并阻塞等待
    pub fn signal_and_wait(&mut self) -> Result<FenceValue> {
        self.signal_and_wait_on(QueueType::Graphics)
    }

    fn signal_and_wait_on(&mut self, queue: QueueType) -> Result<FenceValue> {
        let value = self.fence.next_value();
        self.backend.signal(queue, value)?;
        self.backend.wait_for_fence(value)?;
        self.refresh_completed()?;
        self.fence.update_completed_value(value);
        self.stats.signal_and_waits += 1;
        Ok(value)
    }

    /// 连续 signal-and-wait `count` 次，之后回收所有已完成的延迟释放
    pub fn flush(&mut self, count: usize) -> Result<()> {
        for _ in 0..count {
            self.signal_and_wait()?;
        }

        self.stats.flushes += 1;
        let completed = self.fence.completed_value();
        self.frames.update_availability(completed);
        self.reclaim(completed);
        debug!(count, fence = %completed, "Flushed");
        Ok(())
    }

    // ---------------------------------------------------------------------
    // 帧
    // ---------------------------------------------------------------------

    /// 开始一帧
    ///
    /// 只等待将被复用的帧槽位，然后回收已完成的延迟释放并打开命令流。
    pub fn begin_frame(&mut self) -> Result<usize> {
        if let Some(value) = self.frames.pending_wait() {
            trace!(slot = self.frames.current_index(), fence = %value, "Waiting for frame slot");
            self.backend.wait_for_fence(value)?;
            self.fence.update_completed_value(value);
        }

        let completed = self.refresh_completed()?;
        self.frames.update_availability(completed);
        self.reclaim(completed);
        self.init_command_lists()?;
        Ok(self.frames.current_index())
    }

    /// 结束一帧：提交图形命令流并 signal（不等待），然后前进到下一个槽位
    pub fn end_frame(&mut self) -> Result<FenceValue> {
        self.submit(QueueType::Graphics)?;

        let value = self.fence.next_value();
        self.backend.signal(QueueType::Graphics, value)?;
        self.finish_submission(QueueType::Graphics, value);

        self.frames.current_mut().mark_in_flight(value);
        self.frames.advance();
        self.stats.frames += 1;
        Ok(value)
    }

    fn reclaim(&mut self, completed: FenceValue) {
        let descriptors = self.descriptors.reclaim_completed(completed);

        let resources = self.retired_resources.drain_completed(completed);
        let resource_count = resources.len();
        for resource in resources {
            self.backend.destroy_resource(resource);
        }

        let programs = self.retained_programs.drain_completed(completed).len();

        if descriptors + resource_count + programs > 0 {
            trace!(
                fence = %completed,
                descriptors,
                resources = resource_count,
                programs,
                "Reclaimed deferred releases"
            );
        }
    }

    // ---------------------------------------------------------------------
    // 资源状态
    // ---------------------------------------------------------------------

    /// 在图形命令列表上转换资源状态，状态相同时不记录屏障
    pub fn transition(&mut self, new_state: ResourceState, resource: &mut Resource<B>) -> Result<bool> {
        self.transition_on(QueueType::Graphics, new_state, resource)
    }

    /// 在指定命令列表上转换资源状态
    ///
    /// 返回是否记录了屏障。`present` 与 `common` 在 GPU 上是同一状态，
    /// 二者之间的转换只更新记录的状态。
    pub fn transition_on(
        &mut self,
        queue: QueueType,
        new_state: ResourceState,
        resource: &mut Resource<B>,
    ) -> Result<bool> {
        let current = resource.state();
        if current == new_state {
            return Ok(false);
        }
        if current.is_equivalent(new_state) {
            resource.set_state(new_state);
            return Ok(false);
        }

        if let Some(info) = resource.info() {
            if info.heap_type.required_initial_state().is_some() {
                return Err(GraphicsError::CommandExecution(format!(
                    "{:?} heap resource '{}' cannot leave {}",
                    info.heap_type,
                    resource.name(),
                    current
                ))
                .into());
            }
        }

        if queue == QueueType::Copy && !(current.is_copy_queue_compatible() && new_state.is_copy_queue_compatible()) {
            return Err(GraphicsError::CommandExecution(format!(
                "copy queue cannot transition '{}' from {} to {}",
                resource.name(),
                current,
                new_state
            ))
            .into());
        }

        let stream = &mut self.streams[queue.index()];
        stream.require_open("ResourceBarrier")?;
        let native = resource.require_native()?;
        self.backend.record(
            queue,
            GpuCommand::Barrier {
                resource: native,
                before: current,
                after: new_state,
            },
        )?;

        stream.note_barrier();
        self.stats.barriers += 1;
        trace!(resource = resource.name(), from = %current, to = %new_state, "Barrier");
        resource.set_state(new_state);
        Ok(true)
    }

    // ---------------------------------------------------------------------
    // 描述符
    // ---------------------------------------------------------------------

    pub fn descriptor_allocate(&mut self, heap: DescriptorHeapKind) -> Result<DescriptorSlot> {
        self.descriptors.allocate(heap)
    }

    /// 释放槽位
    ///
    /// 没有未提交命令时，下一次 signal 完成后即可复用；否则等所有录有命令的
    /// 命令流提交，并以那次提交的 fence 值为准。
    pub fn release_descriptor(&mut self, slot: DescriptorSlot) -> Result<()> {
        self.descriptors.retire(slot)?;
        match self.pending_streams() {
            Some(streams) => self.held_descriptors.hold(streams, slot),
            None => self.descriptors.defer(slot, self.fence.current_value().next()),
        }
        Ok(())
    }

    /// 正在录制且已有命令的命令流，全部为空时返回 `None`
    fn pending_streams(&self) -> Option<[bool; 3]> {
        let streams = self.streams.each_ref().map(CommandStream::has_pending_commands);
        streams.contains(&true).then_some(streams)
    }

    /// 按无绑定索引释放资源堆中的视图
    pub fn release_view(&mut self, bindless_index: u32) -> Result<()> {
        let slot = self
            .descriptors
            .allocator(DescriptorHeapKind::Resources)
            .slot(bindless_index);
        self.release_descriptor(slot)
    }

    pub fn descriptor_stats(&self, heap: DescriptorHeapKind) -> DescriptorHeapStats {
        self.descriptors.stats(heap)
    }

    pub fn create_uav(&mut self, resource: &Resource<B>, dimension: ViewDimension) -> Result<u32> {
        let slot = self.create_view(resource, DescriptorType::UnorderedAccessView, dimension)?;
        Ok(slot.bindless_index)
    }

    pub fn create_srv(&mut self, resource: &Resource<B>, dimension: ViewDimension) -> Result<u32> {
        let slot = self.create_view(resource, DescriptorType::ShaderResourceView, dimension)?;
        Ok(slot.bindless_index)
    }

    pub fn create_cbv(&mut self, resource: &Resource<B>) -> Result<u32> {
        let slot = self.create_view(resource, DescriptorType::ConstantBufferView, ViewDimension::ConstantBuffer)?;
        Ok(slot.bindless_index)
    }

    /// 渲染目标视图位于 CPU 堆，返回整个槽位
    pub fn create_rtv(&mut self, resource: &Resource<B>) -> Result<DescriptorSlot> {
        let info = resource.require_info()?;
        let format = match info.dimension {
            ResourceDimension::Texture2D { format, .. } => format,
            ResourceDimension::Buffer { .. } => {
                return Err(view_error(resource, "render target view needs a texture"));
            }
        };
        self.create_view(
            resource,
            DescriptorType::RenderTargetView,
            ViewDimension::Texture2D { format },
        )
    }

    fn create_view(
        &mut self,
        resource: &Resource<B>,
        kind: DescriptorType,
        dimension: ViewDimension,
    ) -> Result<DescriptorSlot> {
        let info = resource.require_info()?;
        validate_view(resource, info, kind, dimension)?;
        let native = resource.require_native()?;

        let slot = self.descriptors.allocate(kind.heap_kind())?;
        let view = ViewDesc { kind, dimension };
        if let Err(err) = self.backend.create_view(native, &view, &slot) {
            // 槽位从未被 GPU 引用
            self.descriptors.release(slot, FenceValue::ZERO)?;
            return Err(err);
        }

        trace!(
            resource = resource.name(),
            view = kind.name(),
            index = slot.bindless_index,
            "View created"
        );
        Ok(slot)
    }

    // ---------------------------------------------------------------------
    // 资源
    // ---------------------------------------------------------------------

    pub fn create_committed_resource(&mut self, info: &ResourceInfo, name: &str) -> Result<B::Resource> {
        info.validate()?;
        let native = self.backend.create_committed_resource(info, name)?;
        debug!(
            name,
            heap = ?info.heap_type,
            size = info.size_in_bytes(),
            state = %info.initial_state,
            "Resource created"
        );
        Ok(native)
    }

    /// 延迟释放：原生对象保留到覆盖它最后一次使用的 fence 完成
    pub fn release_resource(&mut self, resource: &mut Resource<B>) {
        if let Some(native) = resource.take_native() {
            match self.pending_streams() {
                Some(streams) => {
                    trace!(resource = resource.name(), "Resource retired until submission");
                    self.held_resources.hold(streams, native);
                }
                None => {
                    let fence = self.fence.current_value().next();
                    trace!(resource = resource.name(), fence = %fence, "Resource retired");
                    self.retired_resources.push(fence, native);
                }
            }
        }
    }

    /// 延迟释放程序对象
    pub fn release_program(&mut self, program: Program<B>) {
        let native = program.native().clone();
        match self.pending_streams() {
            Some(streams) => self.held_programs.hold(streams, native),
            None => self.retained_programs.push(self.fence.current_value().next(), native),
        }
    }

    /// 立即销毁，只在 GPU 空闲时允许（例如交换链缓冲在 resize 前）
    pub fn destroy_resource_now(&mut self, resource: &mut Resource<B>) -> Result<()> {
        if !self.fence.is_idle() {
            return Err(GraphicsError::CommandExecution(format!(
                "'{}' destroyed while fence {} is still pending",
                resource.name(),
                self.fence.current_value()
            ))
            .into());
        }
        if let Some(native) = resource.take_native() {
            self.backend.destroy_resource(native);
        }
        Ok(())
    }

    /// 尚未销毁的已释放资源，包括等待命令流提交的
    pub fn pending_releases(&self) -> usize {
        self.retired_resources.len() + self.held_resources.len()
    }

    /// 写入 upload 堆缓冲
    pub fn write_buffer(&mut self, resource: &Resource<B>, offset: u64, data: &[u8]) -> Result<()> {
        check_cpu_access(resource, HeapType::Upload, offset, data.len())?;
        self.backend.write_buffer(resource.require_native()?, offset, data)
    }

    /// 读取 readback 堆缓冲，调用方保证写入它的提交已经完成
    pub fn read_buffer(&mut self, resource: &Resource<B>, offset: u64, out: &mut [u8]) -> Result<()> {
        check_cpu_access(resource, HeapType::Readback, offset, out.len())?;
        self.backend.read_buffer(resource.require_native()?, offset, out)
    }

    // ---------------------------------------------------------------------
    // 命令录制
    // ---------------------------------------------------------------------

    fn record(&mut self, queue: QueueType, command: GpuCommand<'_, B>) -> Result<()> {
        let stream = &mut self.streams[queue.index()];
        stream.require_open(command.name())?;
        self.backend.record(queue, command)?;
        stream.note_command();
        Ok(())
    }

    pub fn copy_resource(&mut self, queue: QueueType, dst: &Resource<B>, src: &Resource<B>) -> Result<()> {
        require_copy_states(dst, src)?;

        let (dst_info, src_info) = (dst.require_info()?, src.require_info()?);
        if dst_info.dimension != src_info.dimension {
            return Err(GraphicsError::CommandExecution(format!(
                "CopyResource needs identical layouts ('{}' vs '{}')",
                dst.name(),
                src.name()
            ))
            .into());
        }

        self.record(
            queue,
            GpuCommand::CopyResource {
                dst: dst.require_native()?,
                src: src.require_native()?,
            },
        )
    }

    /// 把纹理按 256 字节对齐的行距拷贝进缓冲
    pub fn copy_texture_to_buffer(&mut self, queue: QueueType, dst: &Resource<B>, src: &Resource<B>) -> Result<()> {
        require_copy_states(dst, src)?;

        let src_info = src.require_info()?;
        let row_pitch = src_info
            .row_pitch()
            .ok_or_else(|| view_error(src, "copy source is not a texture"))?;
        let dst_info = dst.require_info()?;
        if !dst_info.is_buffer() || dst_info.size_in_bytes() < src_info.size_in_bytes() {
            return Err(GraphicsError::CommandExecution(format!(
                "buffer '{}' ({} bytes) cannot hold texture '{}' footprint ({} bytes)",
                dst.name(),
                dst_info.size_in_bytes(),
                src.name(),
                src_info.size_in_bytes()
            ))
            .into());
        }

        self.record(
            queue,
            GpuCommand::CopyTextureToBuffer {
                dst: dst.require_native()?,
                src: src.require_native()?,
                row_pitch,
            },
        )
    }

    pub fn set_program(&mut self, queue: QueueType, program: &Program<B>) -> Result<()> {
        let allowed = match program.kind() {
            ProgramKind::Graphics => queue.allows_draw(),
            ProgramKind::Compute | ProgramKind::WorkGraph => queue.allows_dispatch(),
        };
        if !allowed {
            return Err(GraphicsError::CommandExecution(format!(
                "{} program '{}' cannot be set on the {} queue",
                program.kind().name(),
                program.name(),
                queue
            ))
            .into());
        }

        self.record(queue, GpuCommand::SetProgram(program.native()))?;
        self.recording_programs[queue.index()].push(program.native().clone());
        self.bound_programs[queue.index()] = Some(BoundProgram {
            kind: program.kind(),
            root_constant_count: program.root_constant_count(),
        });
        Ok(())
    }

    pub fn set_root_constants(&mut self, queue: QueueType, constants: &[u32], dest_offset: u32) -> Result<()> {
        let bound = self.bound_program(queue, "SetRoot32BitConstants")?;
        if let Some(count) = bound.root_constant_count {
            if dest_offset as usize + constants.len() > count as usize {
                return Err(GraphicsError::CommandExecution(format!(
                    "{} root constants at offset {} exceed the {} declared",
                    constants.len(),
                    dest_offset,
                    count
                ))
                .into());
            }
        }

        self.record(queue, GpuCommand::SetRootConstants { constants, dest_offset })
    }

    fn bound_program(&self, queue: QueueType, operation: &str) -> Result<BoundProgram> {
        self.bound_programs[queue.index()].ok_or_else(|| {
            GraphicsError::CommandExecution(format!("{} on {} queue without a program", operation, queue)).into()
        })
    }

    pub fn dispatch(&mut self, queue: QueueType, x: u32, y: u32, z: u32) -> Result<()> {
        if !queue.allows_dispatch() {
            return Err(GraphicsError::CommandExecution(format!("Dispatch on the {} queue", queue)).into());
        }
        if x > MAX_DISPATCH_GROUPS || y > MAX_DISPATCH_GROUPS || z > MAX_DISPATCH_GROUPS {
            return Err(GraphicsError::CommandExecution(format!(
                "Dispatch({}, {}, {}) exceeds {} groups per dimension",
                x, y, z, MAX_DISPATCH_GROUPS
            ))
            .into());
        }
        if self.bound_program(queue, "Dispatch")?.kind != ProgramKind::Compute {
            return Err(GraphicsError::CommandExecution("Dispatch needs a compute program".to_string()).into());
        }

        self.record(queue, GpuCommand::Dispatch { x, y, z })
    }

    /// 启动工作图，返回实际提交的记录数
    ///
    /// 程序须先经 [`set_program`](Self::set_program) 绑定，根常量随后设置。
    /// 记录数为 0 时按最少一条处理，提交一条全零记录。
    pub fn dispatch_graph(
        &mut self,
        queue: QueueType,
        program: &Program<B>,
        records: &[u8],
        record_stride: u32,
    ) -> Result<u32> {
        if program.kind() != ProgramKind::WorkGraph {
            return Err(GraphicsError::CommandExecution(format!(
                "DispatchGraph needs a work graph, '{}' is {}",
                program.name(),
                program.kind().name()
            ))
            .into());
        }
        if record_stride == 0 || records.len() % record_stride as usize != 0 {
            return Err(GraphicsError::CommandExecution(format!(
                "{} record bytes are not a multiple of stride {}",
                records.len(),
                record_stride
            ))
            .into());
        }

        if self.bound_program(queue, "DispatchGraph")?.kind != ProgramKind::WorkGraph {
            return Err(GraphicsError::CommandExecution(format!(
                "DispatchGraph '{}' before its program was set",
                program.name()
            ))
            .into());
        }

        let mut num_records = (records.len() / record_stride as usize) as u32;
        let zeroed;
        let records = if num_records == 0 {
            debug!(graph = program.name(), "DispatchGraph with zero records, submitting one");
            zeroed = vec![0u8; record_stride as usize];
            num_records = 1;
            zeroed.as_slice()
        } else {
            records
        };

        self.record(
            queue,
            GpuCommand::DispatchGraph {
                program: program.native(),
                records,
                num_records,
                record_stride,
            },
        )?;
        Ok(num_records)
    }

    pub fn clear_render_target(&mut self, target: &Resource<B>, rtv: DescriptorSlot, color: [f32; 4]) -> Result<()> {
        require_state(target, ResourceState::RenderTarget, "ClearRenderTargetView")?;
        require_rtv(rtv)?;
        self.record(QueueType::Graphics, GpuCommand::ClearRenderTarget { rtv, color })
    }

    pub fn set_render_target(&mut self, target: &Resource<B>, rtv: DescriptorSlot) -> Result<()> {
        require_state(target, ResourceState::RenderTarget, "OMSetRenderTargets")?;
        require_rtv(rtv)?;
        self.record(QueueType::Graphics, GpuCommand::SetRenderTarget { rtv })
    }

    pub fn set_viewport(&mut self, width: u32, height: u32) -> Result<()> {
        self.record(QueueType::Graphics, GpuCommand::SetViewport { width, height })
    }

    pub fn set_vertex_buffer(&mut self, buffer: &VertexBufferResource<B>) -> Result<()> {
        let resource = buffer.resource();
        if resource.state() != ResourceState::GenericRead {
            require_state(resource, ResourceState::VertexAndConstantBuffer, "IASetVertexBuffers")?;
        }
        let view = buffer
            .view()
            .ok_or_else(|| view_error(resource, "vertex buffer view not created"))?;
        self.record(QueueType::Graphics, GpuCommand::SetVertexBuffer(view))
    }

    pub fn draw_instanced(&mut self, vertex_count: u32, instance_count: u32) -> Result<()> {
        self.require_graphics_program("DrawInstanced")?;
        self.record(
            QueueType::Graphics,
            GpuCommand::DrawInstanced {
                vertex_count,
                instance_count,
            },
        )
    }

    /// 从参数缓冲读取一次绘制
    pub fn draw_indirect(&mut self, args: &Resource<B>, offset: u64) -> Result<()> {
        self.require_graphics_program("ExecuteIndirect")?;
        require_state(args, ResourceState::IndirectArgument, "ExecuteIndirect")?;
        if offset
            .checked_add(DRAW_ARGUMENTS_SIZE)
            .is_none_or(|end| end > args.size_in_bytes())
        {
            return Err(GraphicsError::CommandExecution(format!(
                "indirect arguments at offset {} overrun '{}'",
                offset,
                args.name()
            ))
            .into());
        }

        self.record(
            QueueType::Graphics,
            GpuCommand::DrawIndirect {
                args: args.require_native()?,
                offset,
            },
        )
    }

    fn require_graphics_program(&self, operation: &str) -> Result<()> {
        match self.bound_program(QueueType::Graphics, operation)?.kind {
            ProgramKind::Graphics => Ok(()),
            kind => Err(GraphicsError::CommandExecution(format!(
                "{} with a {} program bound",
                operation,
                kind.name()
            ))
            .into()),
        }
    }

    // ---------------------------------------------------------------------
    // 销毁
    // ---------------------------------------------------------------------

    /// 等待 GPU 空闲并销毁所有延迟释放的对象
    pub fn shutdown(&mut self) -> Result<()> {
        self.flush(self.frames.count())?;

        let completed = self.fence.completed_value();
        self.reclaim(completed);
        // 未提交的命令列表不会再执行，挂起的对象可以直接销毁
        let held = self.held_resources.drain();
        for resource in self.retired_resources.drain_completed(FenceValue::new(u64::MAX)).into_iter().chain(held) {
            self.backend.destroy_resource(resource);
        }
        self.retained_programs.drain_completed(FenceValue::new(u64::MAX));
        self.held_programs.drain();

        info!(
            frames = self.stats.frames,
            submissions = self.stats.submissions,
            barriers = self.stats.barriers,
            "Device context shut down"
        );
        Ok(())
    }
}

impl<B: GraphicsBackend> Drop for DeviceContext<B> {
    fn drop(&mut self) {
        if !self.fence.is_idle() {
            if let Err(err) = self.signal_and_wait() {
                warn!("Failed to drain GPU work on drop: {}", err);
                return;
            }
        }
        let held = self.held_resources.drain();
        for resource in self.retired_resources.drain_completed(FenceValue::new(u64::MAX)).into_iter().chain(held) {
            self.backend.destroy_resource(resource);
        }
    }
}

fn view_error<B: GraphicsBackend>(resource: &Resource<B>, reason: &str) -> PlaygroundError {
    GraphicsError::ResourceCreation(format!("'{}': {}", resource.name(), reason)).into()
}

fn validate_view<B: GraphicsBackend>(
    resource: &Resource<B>,
    info: &ResourceInfo,
    kind: DescriptorType,
    dimension: ViewDimension,
) -> Result<()> {
    match kind {
        DescriptorType::UnorderedAccessView if !info.flags.contains(ResourceFlags::ALLOW_UNORDERED_ACCESS) => {
            return Err(view_error(resource, "UAV needs ALLOW_UNORDERED_ACCESS"));
        }
        DescriptorType::RenderTargetView if !info.flags.contains(ResourceFlags::ALLOW_RENDER_TARGET) => {
            return Err(view_error(resource, "RTV needs ALLOW_RENDER_TARGET"));
        }
        DescriptorType::ShaderResourceView if info.flags.contains(ResourceFlags::DENY_SHADER_RESOURCE) => {
            return Err(view_error(resource, "SRV on a resource that denies shader access"));
        }
        DescriptorType::ConstantBufferView if info.size_in_bytes() % CONSTANT_BUFFER_ALIGNMENT != 0 => {
            return Err(view_error(resource, "CBV size must be a multiple of 256 bytes"));
        }
        DescriptorType::DepthStencilView | DescriptorType::Sampler => {
            return Err(view_error(resource, "view kind is not created from a resource here"));
        }
        _ => {}
    }

    match (dimension, info.dimension) {
        (ViewDimension::Texture2D { .. }, ResourceDimension::Texture2D { .. }) => Ok(()),
        (ViewDimension::ConstantBuffer, ResourceDimension::Buffer { .. }) => Ok(()),
        (
            ViewDimension::Buffer {
                first_element,
                num_elements,
                stride,
            },
            ResourceDimension::Buffer { size_in_bytes },
        ) => {
            let element = if stride == 0 { 4 } else { stride as u64 };
            if (first_element + num_elements as u64) * element > size_in_bytes {
                Err(view_error(resource, "buffer view exceeds the buffer"))
            } else {
                Ok(())
            }
        }
        _ => Err(view_error(resource, "view dimension does not match the resource")),
    }
}

fn require_state<B: GraphicsBackend>(resource: &Resource<B>, expected: ResourceState, operation: &str) -> Result<()> {
    if resource.state().is_equivalent(expected) {
        Ok(())
    } else {
        Err(GraphicsError::CommandExecution(format!(
            "{}: '{}' is in {}, expected {}",
            operation,
            resource.name(),
            resource.state(),
            expected
        ))
        .into())
    }
}

/// upload 堆资源常驻 generic-read，可作为拷贝源
fn require_copy_states<B: GraphicsBackend>(dst: &Resource<B>, src: &Resource<B>) -> Result<()> {
    require_state(dst, ResourceState::CopyDest, "copy destination")?;
    if src.state() == ResourceState::GenericRead {
        return Ok(());
    }
    require_state(src, ResourceState::CopySource, "copy source")
}

fn require_rtv(rtv: DescriptorSlot) -> Result<()> {
    if rtv.heap == DescriptorHeapKind::Rtv {
        Ok(())
    } else {
        Err(GraphicsError::CommandExecution(format!(
            "descriptor {} is in the {} heap, not rtv",
            rtv.bindless_index,
            rtv.heap.name()
        ))
        .into())
    }
}

fn check_cpu_access<B: GraphicsBackend>(resource: &Resource<B>, heap: HeapType, offset: u64, len: usize) -> Result<()> {
    let info = resource.require_info()?;
    if info.heap_type != heap {
        return Err(GraphicsError::CommandExecution(format!(
            "'{}' is on the {:?} heap, CPU access needs {:?}",
            resource.name(),
            info.heap_type,
            heap
        ))
        .into());
    }
    if offset
        .checked_add(len as u64)
        .is_none_or(|end| end > info.size_in_bytes())
    {
        return Err(GraphicsError::CommandExecution(format!(
            "{} bytes at offset {} overrun '{}' ({} bytes)",
            len,
            offset,
            resource.name(),
            info.size_in_bytes()
        ))
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gfx::headless::HeadlessBackend;
    use crate::renderer::resource::TextureFormat;

    fn context() -> DeviceContext<HeadlessBackend> {
        let desc = ContextDesc {
            frame_count: 2,
            heap_capacities: [8, 2, 4, 1],
        };
        DeviceContext::new(HeadlessBackend::new(), &desc).unwrap()
    }

    fn uav_texture(ctx: &mut DeviceContext<HeadlessBackend>) -> Resource<HeadlessBackend> {
        let mut texture = Resource::with_info(ResourceInfo::texture2d(
            HeapType::Default,
            ResourceFlags::ALLOW_UNORDERED_ACCESS,
            4,
            4,
            TextureFormat::R32Uint,
        ));
        texture.create_resource(ctx, "Texture").unwrap();
        texture
    }

    #[test]
    fn test_transition_is_idempotent() {
        let mut ctx = context();
        let mut texture = uav_texture(&mut ctx);
        ctx.init_command_lists().unwrap();

        assert!(ctx.transition(ResourceState::UnorderedAccess, &mut texture).unwrap());
        assert!(!ctx.transition(ResourceState::UnorderedAccess, &mut texture).unwrap());
        assert_eq!(ctx.stream(QueueType::Graphics).barriers_recorded(), 1);
        assert_eq!(texture.state(), ResourceState::UnorderedAccess);
    }

    #[test]
    fn test_transition_requires_open_list() {
        let mut ctx = context();
        let mut texture = uav_texture(&mut ctx);
        assert!(ctx.transition(ResourceState::CopySource, &mut texture).is_err());
        assert_eq!(texture.state(), ResourceState::Common);
    }

    #[test]
    fn test_present_and_common_need_no_barrier() {
        let mut ctx = context();
        let mut texture = uav_texture(&mut ctx);
        ctx.init_command_lists().unwrap();

        assert!(!ctx.transition(ResourceState::Present, &mut texture).unwrap());
        assert_eq!(texture.state(), ResourceState::Present);
        assert_eq!(ctx.stats().barriers, 0);
    }

    #[test]
    fn test_copy_queue_rejects_shader_states() {
        let mut ctx = context();
        let mut texture = uav_texture(&mut ctx);
        ctx.init_command_lists().unwrap();

        assert!(ctx
            .transition_on(QueueType::Copy, ResourceState::UnorderedAccess, &mut texture)
            .is_err());
        assert!(ctx
            .transition_on(QueueType::Copy, ResourceState::CopySource, &mut texture)
            .unwrap());
    }

    #[test]
    fn test_execute_requires_open_list() {
        let mut ctx = context();
        assert!(ctx.execute_command_list_compute().is_err());

        ctx.init_command_lists().unwrap();
        ctx.execute_command_list_compute().unwrap();
        assert!(!ctx.is_open(QueueType::Compute));
        assert!(ctx.is_open(QueueType::Graphics));
        assert_eq!(ctx.fence_value(), FenceValue::new(1));
        assert!(ctx.is_idle());
    }

    #[test]
    fn test_fence_is_monotonic() {
        let mut ctx = context();
        let mut last = ctx.fence_value();
        for _ in 0..4 {
            let value = ctx.signal_and_wait().unwrap();
            assert!(value > last);
            assert_eq!(ctx.completed_fence_value(), value);
            last = value;
        }

        ctx.flush(3).unwrap();
        assert_eq!(ctx.fence_value(), FenceValue::new(7));
        assert_eq!(ctx.stats().signal_and_waits, 7);
    }

    #[test]
    fn test_uav_needs_flag() {
        let mut ctx = context();
        let mut plain = Resource::with_info(ResourceInfo::buffer(HeapType::Default, ResourceFlags::NONE, 64));
        plain.create_resource(&mut ctx, "Plain").unwrap();

        let view = ViewDimension::Buffer {
            first_element: 0,
            num_elements: 16,
            stride: 4,
        };
        assert!(ctx.create_uav(&plain, view).is_err());
        assert!(ctx.create_srv(&plain, view).is_ok());
        assert_eq!(ctx.descriptor_stats(DescriptorHeapKind::Resources).live, 1);
    }

    #[test]
    fn test_descriptor_exhaustion_is_an_error() {
        let mut ctx = context();
        ctx.descriptor_allocate(DescriptorHeapKind::Dsv).unwrap();
        assert!(matches!(
            ctx.descriptor_allocate(DescriptorHeapKind::Dsv),
            Err(PlaygroundError::Graphics(GraphicsError::DescriptorHeapExhausted { heap: "dsv", capacity: 1 }))
        ));
    }

    #[test]
    fn test_released_view_reused_after_fence() {
        let mut ctx = context();
        let texture = uav_texture(&mut ctx);
        let view = ViewDimension::Texture2D {
            format: TextureFormat::R32Uint,
        };

        let index = ctx.create_uav(&texture, view).unwrap();
        ctx.release_view(index).unwrap();
        let stats = ctx.descriptor_stats(DescriptorHeapKind::Resources);
        assert_eq!(stats.pending, 1);

        ctx.flush(1).unwrap();
        assert_eq!(ctx.descriptor_stats(DescriptorHeapKind::Resources).free, 1);
        assert_eq!(ctx.create_uav(&texture, view).unwrap(), index);
    }

    #[test]
    fn test_resource_release_is_deferred() {
        let mut ctx = context();
        let mut texture = uav_texture(&mut ctx);
        ctx.release_resource(&mut texture);
        assert!(!texture.is_created());
        assert_eq!(ctx.pending_releases(), 1);
        assert_eq!(ctx.backend().live_resource_count(), 1);

        ctx.flush(1).unwrap();
        assert_eq!(ctx.pending_releases(), 0);
        assert_eq!(ctx.backend().live_resource_count(), 0);
    }

    #[test]
    fn test_release_outlives_flush_while_list_is_open() {
        let mut ctx = context();
        let mut texture = uav_texture(&mut ctx);
        ctx.init_command_lists().unwrap();
        ctx.transition(ResourceState::UnorderedAccess, &mut texture).unwrap();

        // 屏障还在未提交的图形命令列表里
        ctx.release_resource(&mut texture);
        ctx.flush(1).unwrap();
        assert_eq!(ctx.pending_releases(), 1);
        assert_eq!(ctx.backend().live_resource_count(), 1);

        ctx.execute_command_list_graphics().unwrap();
        assert!(ctx.backend().validation_errors().is_empty());
        assert_eq!(ctx.backend().live_resource_count(), 1);

        ctx.flush(1).unwrap();
        assert_eq!(ctx.pending_releases(), 0);
        assert_eq!(ctx.backend().live_resource_count(), 0);
    }

    #[test]
    fn test_released_view_not_reissued_before_submission() {
        let mut ctx = context();
        let mut texture = uav_texture(&mut ctx);
        let view = ViewDimension::Texture2D {
            format: TextureFormat::R32Uint,
        };

        let index = ctx.create_uav(&texture, view).unwrap();
        ctx.init_command_lists().unwrap();
        ctx.transition(ResourceState::UnorderedAccess, &mut texture).unwrap();
        ctx.release_view(index).unwrap();
        assert!(ctx.release_view(index).is_err());

        ctx.flush(1).unwrap();
        let other = ctx.create_uav(&texture, view).unwrap();
        assert_ne!(other, index);

        ctx.execute_command_list_graphics().unwrap();
        ctx.flush(1).unwrap();
        assert_eq!(ctx.create_uav(&texture, view).unwrap(), index);
    }

    #[test]
    fn test_empty_open_list_does_not_hold_releases() {
        let mut ctx = context();
        let mut texture = uav_texture(&mut ctx);
        ctx.init_command_lists().unwrap();

        ctx.release_resource(&mut texture);
        ctx.flush(1).unwrap();
        assert_eq!(ctx.backend().live_resource_count(), 0);
    }

    #[test]
    fn test_allocated_resource_cannot_be_reconfigured() {
        let mut ctx = context();
        let mut texture = uav_texture(&mut ctx);
        let info = *texture.info().unwrap();
        ctx.init_command_lists().unwrap();
        ctx.transition(ResourceState::UnorderedAccess, &mut texture).unwrap();

        assert!(texture.configure(info).is_err());
        assert!(texture
            .set_resource_info(HeapType::Default, ResourceFlags::NONE, 64)
            .is_err());
        assert_eq!(texture.state(), ResourceState::UnorderedAccess);

        ctx.transition(ResourceState::CopySource, &mut texture).unwrap();
        ctx.execute_command_list_graphics().unwrap();
        assert!(ctx.backend().validation_errors().is_empty());

        // 释放后可以重新配置
        ctx.release_resource(&mut texture);
        texture.configure(info).unwrap();
        assert_eq!(texture.state(), ResourceState::Common);
    }

    #[test]
    fn test_begin_frame_waits_only_for_reused_slot() {
        let mut ctx = context();
        assert_eq!(ctx.begin_frame().unwrap(), 0);
        let first = ctx.end_frame().unwrap();
        assert!(!ctx.is_idle());

        assert_eq!(ctx.begin_frame().unwrap(), 1);
        assert_eq!(ctx.completed_fence_value(), FenceValue::ZERO);
        ctx.end_frame().unwrap();

        // 槽位 0 被复用，只等待第一帧
        assert_eq!(ctx.begin_frame().unwrap(), 0);
        assert!(ctx.completed_fence_value() >= first);
        assert_eq!(ctx.frame_fence(0), Some(first));
    }

    #[test]
    fn test_cpu_access_checks_heap() {
        let mut ctx = context();
        let mut upload = Resource::with_info(ResourceInfo::buffer(HeapType::Upload, ResourceFlags::NONE, 16));
        upload.create_resource(&mut ctx, "Upload").unwrap();

        assert!(ctx.write_buffer(&upload, 0, &[1, 2, 3, 4]).is_ok());
        assert!(ctx.write_buffer(&upload, 14, &[1, 2, 3, 4]).is_err());
        // 偏移加长度溢出 u64 也按越界报错
        assert!(ctx.write_buffer(&upload, u64::MAX, &[1]).is_err());
        assert!(ctx.write_buffer(&upload, u64::MAX - 1, &[1, 2, 3, 4]).is_err());
        let mut out = [0u8; 4];
        assert!(ctx.read_buffer(&upload, 0, &mut out).is_err());
    }
}
