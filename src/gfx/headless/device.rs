//! 软件设备的执行引擎
//!
//! 提交按全局顺序排在一条时间线上，CPU 等待某个 fence 值时才依次执行。
//! 执行时逐条检查资源的 GPU 侧状态，不一致的地方记录为验证错误，行为上
//! 相当于打开了调试层的真实设备。

use std::collections::{HashMap, VecDeque};

use tracing::{error, trace};

use crate::gfx::backend::{ViewDesc, ViewDimension};
use crate::renderer::command::QueueType;
use crate::renderer::descriptor::{DescriptorHeapKind, DescriptorType};
use crate::renderer::pipeline::ProgramKind;
use crate::renderer::resource::{ResourceDimension, ResourceInfo, ResourceState, TextureFormat, VertexBufferView};
use crate::renderer::sync::FenceValue;

use super::kernels::{Kernel, KernelContext, KernelRegistry};
use super::HeadlessProgram;

/// 软件设备上的一个资源
#[derive(Debug)]
pub(crate) struct ResourceRecord {
    pub info: ResourceInfo,
    pub name: String,
    pub data: Vec<u8>,
    /// GPU 执行到当前位置时资源所处的状态
    pub gpu_state: ResourceState,
    pub destroyed: bool,
}

impl ResourceRecord {
    pub fn new(info: ResourceInfo, name: &str) -> Self {
        let size = match info.dimension {
            ResourceDimension::Buffer { size_in_bytes } => size_in_bytes as usize,
            ResourceDimension::Texture2D { width, height, format } => {
                width as usize * height as usize * format.bytes_per_pixel() as usize
            }
        };

        Self {
            info,
            name: name.to_string(),
            data: vec![0; size],
            gpu_state: info.initial_state,
            destroyed: false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct ViewRecord {
    pub resource: u64,
    pub view: ViewDesc,
}

/// 录制下来的命令，持有执行所需的全部数据
#[derive(Clone)]
pub(crate) enum Recorded {
    Barrier { resource: u64, before: ResourceState, after: ResourceState },
    CopyResource { dst: u64, src: u64 },
    CopyTextureToBuffer { dst: u64, src: u64, row_pitch: u64 },
    SetProgram(HeadlessProgram),
    SetRootConstants { constants: Vec<u32>, dest_offset: u32 },
    Dispatch { x: u32, y: u32, z: u32 },
    DispatchGraph { program: HeadlessProgram, records: Vec<u8>, num_records: u32, record_stride: u32 },
    ClearRenderTarget { rtv: u32, color: [f32; 4] },
    SetRenderTarget { rtv: u32 },
    SetViewport { width: u32, height: u32 },
    SetVertexBuffer(VertexBufferView),
    DrawInstanced { vertex_count: u32, instance_count: u32 },
    DrawIndirect { args: u64, offset: u64 },
}

enum Submission {
    Commands { queue: QueueType, commands: Vec<Recorded> },
    Signal { queue: QueueType, value: FenceValue },
    Present { resource: u64 },
}

/// 执行统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionStats {
    pub command_lists: u64,
    pub barriers: u64,
    pub copies: u64,
    pub dispatches: u64,
    pub thread_groups: u64,
    pub graph_dispatches: u64,
    pub graph_records: u64,
    pub draws: u64,
    pub vertices: u64,
    pub clears: u64,
    pub presents: u64,
}

/// 命令列表执行期间的管线状态
#[derive(Default)]
struct ExecutionState {
    program: Option<HeadlessProgram>,
    root_constants: Vec<u32>,
    render_target: Option<u32>,
    viewport: Option<(u32, u32)>,
    vertex_buffer: Option<VertexBufferView>,
}

pub(crate) struct HeadlessDevice {
    pub resources: HashMap<u64, ResourceRecord>,
    pub views: HashMap<(DescriptorHeapKind, u32), ViewRecord>,
    pub kernels: KernelRegistry,
    timeline: VecDeque<Submission>,
    completed: FenceValue,
    pub validation_errors: Vec<String>,
    pub stats: ExecutionStats,
    pub removed_reason: Option<String>,
}

impl HeadlessDevice {
    pub fn new(kernels: KernelRegistry) -> Self {
        Self {
            resources: HashMap::new(),
            views: HashMap::new(),
            kernels,
            timeline: VecDeque::new(),
            completed: FenceValue::ZERO,
            validation_errors: Vec::new(),
            stats: ExecutionStats::default(),
            removed_reason: None,
        }
    }

    pub fn completed(&self) -> FenceValue {
        self.completed
    }

    pub fn submit(&mut self, queue: QueueType, commands: Vec<Recorded>) {
        self.timeline.push_back(Submission::Commands { queue, commands });
    }

    pub fn signal(&mut self, queue: QueueType, value: FenceValue) {
        self.timeline.push_back(Submission::Signal { queue, value });
    }

    pub fn present(&mut self, resource: u64) {
        self.timeline.push_back(Submission::Present { resource });
    }

    /// 是否有任何尚未执行的 signal 能让 fence 达到 `value`
    pub fn will_reach(&self, value: FenceValue) -> bool {
        self.completed >= value
            || self
                .timeline
                .iter()
                .any(|s| matches!(s, Submission::Signal { value: v, .. } if *v >= value))
    }

    /// 执行时间线直到 fence 达到 `value`
    pub fn run_until(&mut self, value: FenceValue) {
        while self.completed < value {
            let Some(submission) = self.timeline.pop_front() else {
                break;
            };

            match submission {
                Submission::Commands { queue, commands } => self.execute(queue, commands),
                Submission::Signal { queue, value } => {
                    trace!(queue = %queue, fence = %value, "Headless fence signaled");
                    self.completed = self.completed.max(value);
                }
                Submission::Present { resource } => self.execute_present(resource),
            }
        }
    }

    pub fn report(&mut self, message: String) {
        error!(target: "validation", "{}", message);
        self.validation_errors.push(message);
    }

    /// 执行时取资源，已销毁或不存在时记录错误
    fn live(&mut self, id: u64, operation: &str) -> Option<&mut ResourceRecord> {
        let usable = self.resources.get(&id).map(|r| !r.destroyed);
        match usable {
            Some(true) => self.resources.get_mut(&id),
            Some(false) => {
                let name = self.resources[&id].name.clone();
                self.report(format!("{}: resource '{}' used after destruction", operation, name));
                None
            }
            None => {
                self.report(format!("{}: unknown resource {}", operation, id));
                None
            }
        }
    }

    fn expect_state(&mut self, id: u64, allowed: &[ResourceState], operation: &str) -> bool {
        let Some(record) = self.live(id, operation) else {
            return false;
        };
        let state = record.gpu_state;
        if allowed.iter().any(|s| s.is_equivalent(state)) {
            return true;
        }

        let name = record.name.clone();
        self.report(format!(
            "{}: resource '{}' is in {} on the GPU, expected {}",
            operation,
            name,
            state,
            allowed.iter().map(|s| s.name()).collect::<Vec<_>>().join(" or ")
        ));
        false
    }

    fn execute(&mut self, queue: QueueType, commands: Vec<Recorded>) {
        self.stats.command_lists += 1;
        let mut state = ExecutionState::default();

        for command in commands {
            match command {
                Recorded::Barrier { resource, before, after } => {
                    self.stats.barriers += 1;
                    if self.expect_state(resource, &[before], "ResourceBarrier") {
                        if let Some(record) = self.resources.get_mut(&resource) {
                            record.gpu_state = after;
                        }
                    }
                }
                Recorded::CopyResource { dst, src } => self.execute_copy(dst, src, None),
                Recorded::CopyTextureToBuffer { dst, src, row_pitch } => self.execute_copy(dst, src, Some(row_pitch)),
                Recorded::SetProgram(program) => {
                    state.program = Some(program);
                    state.root_constants.clear();
                }
                Recorded::SetRootConstants { constants, dest_offset } => {
                    let end = dest_offset as usize + constants.len();
                    if state.root_constants.len() < end {
                        state.root_constants.resize(end, 0);
                    }
                    state.root_constants[dest_offset as usize..end].copy_from_slice(&constants);
                }
                Recorded::Dispatch { x, y, z } => self.execute_dispatch(queue, &state, [x, y, z]),
                Recorded::DispatchGraph {
                    program,
                    records,
                    num_records,
                    record_stride,
                } => self.execute_graph(&state, &program, &records, num_records, record_stride),
                Recorded::ClearRenderTarget { rtv, color } => {
                    self.stats.clears += 1;
                    if self.expect_render_target(rtv, "ClearRenderTargetView") {
                        self.execute_clear(rtv, color);
                    }
                }
                Recorded::SetRenderTarget { rtv } => {
                    if self.expect_render_target(rtv, "OMSetRenderTargets") {
                        state.render_target = Some(rtv);
                    }
                }
                Recorded::SetViewport { width, height } => {
                    if width == 0 || height == 0 {
                        self.report(format!("RSSetViewports: empty viewport {}x{}", width, height));
                    }
                    state.viewport = Some((width, height));
                }
                Recorded::SetVertexBuffer(view) => state.vertex_buffer = Some(view),
                Recorded::DrawInstanced {
                    vertex_count,
                    instance_count,
                } => self.execute_draw(&state, vertex_count as u64 * instance_count as u64, "DrawInstanced"),
                Recorded::DrawIndirect { args, offset } => {
                    if !self.expect_state(args, &[ResourceState::IndirectArgument], "ExecuteIndirect") {
                        continue;
                    }
                    let data = &self.resources[&args].data;
                    let start = offset as usize;
                    let vertex_count = read_u32(data, start);
                    let instance_count = read_u32(data, start.saturating_add(4));
                    self.execute_draw(&state, vertex_count as u64 * instance_count as u64, "ExecuteIndirect");
                }
            }
        }
    }

    fn execute_copy(&mut self, dst: u64, src: u64, row_pitch: Option<u64>) {
        self.stats.copies += 1;
        let src_ok = self.expect_state(
            src,
            &[ResourceState::CopySource, ResourceState::GenericRead],
            "copy source",
        );
        let dst_ok = self.expect_state(dst, &[ResourceState::CopyDest], "copy destination");
        if !(src_ok && dst_ok) {
            return;
        }

        let source = &self.resources[&src];
        let bytes = match (row_pitch, source.info.dimension) {
            (Some(pitch), ResourceDimension::Texture2D { width, height, format }) => {
                let row = width as usize * format.bytes_per_pixel() as usize;
                let mut out = vec![0u8; pitch as usize * height as usize];
                for y in 0..height as usize {
                    let (from, to) = (y * row, y * pitch as usize);
                    out[to..to + row].copy_from_slice(&source.data[from..from + row]);
                }
                out
            }
            _ => source.data.clone(),
        };

        if let Some(target) = self.resources.get_mut(&dst) {
            let len = bytes.len().min(target.data.len());
            target.data[..len].copy_from_slice(&bytes[..len]);
        }
    }

    fn expect_render_target(&mut self, rtv: u32, operation: &str) -> bool {
        match self.views.get(&(DescriptorHeapKind::Rtv, rtv)).copied() {
            Some(view) => self.expect_state(view.resource, &[ResourceState::RenderTarget], operation),
            None => {
                self.report(format!("{}: rtv {} holds no view", operation, rtv));
                false
            }
        }
    }

    fn execute_dispatch(&mut self, queue: QueueType, state: &ExecutionState, groups: [u32; 3]) {
        self.stats.dispatches += 1;
        self.stats.thread_groups += groups.iter().map(|&g| g as u64).product::<u64>();

        let Some(program) = state.program.as_ref().filter(|p| p.kind() == ProgramKind::Compute) else {
            self.report(format!("Dispatch on {} queue without a compute program", queue));
            return;
        };

        let Some(kernel) = self.kernels.get(program.name()) else {
            trace!(program = program.name(), "No kernel registered, dispatch skipped");
            return;
        };

        self.run_kernel(kernel, &state.root_constants, groups, &[], 0, 0);
    }

    fn execute_graph(
        &mut self,
        state: &ExecutionState,
        program: &HeadlessProgram,
        records: &[u8],
        num_records: u32,
        record_stride: u32,
    ) {
        self.stats.graph_dispatches += 1;
        self.stats.graph_records += num_records as u64;

        if num_records == 0 {
            self.report(format!("DispatchGraph '{}' with zero records", program.name()));
            return;
        }
        if program.kind() != ProgramKind::WorkGraph {
            self.report(format!("DispatchGraph with non-graph program '{}'", program.name()));
            return;
        }

        if let Some(kernel) = self.kernels.get(program.name()) {
            self.run_kernel(kernel, &state.root_constants, [1, 1, 1], records, num_records, record_stride);
        }
    }

    fn run_kernel(
        &mut self,
        kernel: Kernel,
        root_constants: &[u32],
        groups: [u32; 3],
        records: &[u8],
        num_records: u32,
        record_stride: u32,
    ) {
        let mut ctx = KernelContext {
            resources: &mut self.resources,
            views: &self.views,
            root_constants,
            groups,
            records,
            num_records,
            record_stride,
            errors: Vec::new(),
        };
        kernel(&mut ctx);

        let errors = std::mem::take(&mut ctx.errors);
        for message in errors {
            self.report(message);
        }
    }

    fn execute_draw(&mut self, state: &ExecutionState, vertices: u64, operation: &str) {
        let graphics = state
            .program
            .as_ref()
            .is_some_and(|p| p.kind() == ProgramKind::Graphics);
        if !graphics {
            self.report(format!("{} without a graphics program", operation));
            return;
        }
        if state.render_target.is_none() {
            self.report(format!("{} without a render target", operation));
            return;
        }
        if state.vertex_buffer.is_none() {
            self.report(format!("{} without a vertex buffer", operation));
            return;
        }
        if state.viewport.is_none() {
            self.report(format!("{} without a viewport", operation));
            return;
        }

        self.stats.draws += 1;
        self.stats.vertices += vertices;
    }

    /// 用清除色填满渲染目标，半精度格式不写入
    fn execute_clear(&mut self, rtv: u32, color: [f32; 4]) {
        let Some(view) = self.views.get(&(DescriptorHeapKind::Rtv, rtv)).copied() else {
            return;
        };
        let Some(record) = self.resources.get_mut(&view.resource) else {
            return;
        };
        let ResourceDimension::Texture2D { format, .. } = record.info.dimension else {
            return;
        };
        let Some(pixel) = clear_pixel(format, color) else {
            return;
        };
        for chunk in record.data.chunks_exact_mut(pixel.len()) {
            chunk.copy_from_slice(&pixel);
        }
    }

    fn execute_present(&mut self, resource: u64) {
        self.stats.presents += 1;
        self.expect_state(resource, &[ResourceState::Present], "Present");
    }

    /// 校验视图与资源的搭配
    pub fn check_view(&self, resource: u64, view: &ViewDesc) -> Result<(), String> {
        let record = self
            .resources
            .get(&resource)
            .filter(|r| !r.destroyed)
            .ok_or_else(|| format!("view on missing resource {}", resource))?;

        let texture = matches!(record.info.dimension, ResourceDimension::Texture2D { .. });
        let wants_texture = matches!(view.dimension, ViewDimension::Texture2D { .. });
        if texture != wants_texture {
            return Err(format!("{} dimension mismatch on '{}'", view.kind.name(), record.name));
        }
        if view.kind == DescriptorType::Sampler {
            return Err("samplers are not resource views".to_string());
        }
        Ok(())
    }
}

fn unorm8(value: f32) -> u8 {
    (value.clamp(0.0, 1.0) * 255.0).round() as u8
}

/// 一个像素的清除值
fn clear_pixel(format: TextureFormat, [r, g, b, a]: [f32; 4]) -> Option<Vec<u8>> {
    let pixel = match format {
        TextureFormat::Rgba8Unorm => vec![unorm8(r), unorm8(g), unorm8(b), unorm8(a)],
        TextureFormat::Bgra8Unorm => vec![unorm8(b), unorm8(g), unorm8(r), unorm8(a)],
        TextureFormat::Rgba32Float => bytemuck::bytes_of(&[r, g, b, a]).to_vec(),
        TextureFormat::R32Float => bytemuck::bytes_of(&r).to_vec(),
        TextureFormat::R32Uint => bytemuck::bytes_of(&(r as u32)).to_vec(),
        TextureFormat::Rgba16Float | TextureFormat::Depth32Float => return None,
    };
    Some(pixel)
}

fn word_range(offset: usize) -> Option<std::ops::Range<usize>> {
    Some(offset..offset.checked_add(std::mem::size_of::<u32>())?)
}

/// 越界时返回 0
pub(crate) fn read_u32(data: &[u8], offset: usize) -> u32 {
    word_range(offset)
        .and_then(|range| data.get(range))
        .map(|bytes| u32::from_le(bytemuck::pod_read_unaligned(bytes)))
        .unwrap_or(0)
}

pub(crate) fn write_u32(data: &mut [u8], offset: usize, value: u32) -> bool {
    match word_range(offset).and_then(|range| data.get_mut(range)) {
        Some(slot) => {
            slot.copy_from_slice(bytemuck::bytes_of(&value.to_le()));
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_words_are_little_endian_and_bounded() {
        let mut data = vec![0u8; 8];
        assert!(write_u32(&mut data, 2, 0x0403_0201));
        assert_eq!(data, [0, 0, 1, 2, 3, 4, 0, 0]);
        assert_eq!(read_u32(&data, 2), 0x0403_0201);

        assert!(!write_u32(&mut data, 6, 1));
        assert!(!write_u32(&mut data, usize::MAX, 1));
        assert_eq!(read_u32(&data, 5), 0);
        assert_eq!(read_u32(&data, usize::MAX - 1), 0);
    }
}
