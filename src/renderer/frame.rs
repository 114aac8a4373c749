//! 帧驱动
//!
//! 顶层循环只规定顺序：
//!
//! 1. `begin_frame` 等待将被复用的帧槽位，读取并记录该槽位上一次的回读结果
//! 2. 后备缓冲转到 render-target 并清屏
//! 3. 计算着色器写 UAV 纹理，再拷贝进该槽位的回读缓冲
//! 4. 三角形绘制与间接绘制
//! 5. 通用程序路径上启动工作图
//! 6. 后备缓冲转回 present，`end_frame` 提交，交换链呈现
//!
//! 窗口尺寸变化时先 `flush(back_buffer_count)`，再释放并重建后备缓冲与
//! 依赖尺寸的资源。

use bytemuck::{Pod, Zeroable};
use tracing::{debug, info, warn};

use crate::core::config::Config;
use crate::core::error::Result;
use crate::core::event::{FrameEvent, KeyCode, LoopControl};
use crate::gfx::backend::{GraphicsBackend, ViewDimension};

use super::capture::GpuCapture;
use super::command::QueueType;
use super::context::DeviceContext;
use super::descriptor::DescriptorSlot;
use super::pipeline::{PipelinePath, Program, ProgramDesc};
use super::resource::{
    HeapType, Resource, ResourceFlags, ResourceInfo, ResourceState, TextureFormat, TextureResource,
    VertexBufferResource,
};
use super::shader::{ShaderCompiler, ShaderDesc, ShaderStage};
use super::sync::FenceValue;

/// 清屏颜色 (85, 230, 23)
pub const CLEAR_COLOR: [f32; 4] = [85.0 / 255.0, 230.0 / 255.0, 23.0 / 255.0, 1.0];

/// `ResolutionFill.hlsl` 的线程组边长
pub const FILL_GROUP_SIZE: u32 = 8;

/// 工作图输入记录的大小（`uint increment`）
pub const GRAPH_RECORD_STRIDE: u32 = 4;

/// 工作图计数器：`[节点调用次数, 增量之和]`
const GRAPH_COUNTER_SIZE: u64 = 8;

/// 交换链与后备缓冲
///
/// 窗口系统的薄封装。后备缓冲在 `release_buffers` 之前必须不再被 GPU 引用，
/// 调用方通过 `flush` 保证这一点。
pub trait Presenter<B: GraphicsBackend> {
    fn back_buffer_count(&self) -> usize;

    fn current_back_buffer_index(&self) -> usize;

    fn back_buffer_mut(&mut self, index: usize) -> &mut Resource<B>;

    fn rtv(&self, index: usize) -> DescriptorSlot;

    fn size(&self) -> (u32, u32);

    fn format(&self) -> TextureFormat;

    /// 释放所有后备缓冲及其 RTV
    fn release_buffers(&mut self, context: &mut DeviceContext<B>) -> Result<()>;

    /// 按新尺寸重建后备缓冲
    fn resize_buffers(&mut self, context: &mut DeviceContext<B>, width: u32, height: u32) -> Result<()>;

    /// 在图形队列上呈现当前后备缓冲
    fn present(&mut self, context: &mut DeviceContext<B>, vsync: bool) -> Result<()>;

    fn set_fullscreen(&mut self, fullscreen: bool) -> Result<()>;

    fn is_fullscreen(&self) -> bool;
}

/// 三角形顶点
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub color: [f32; 4],
}

const TRIANGLE: [Vertex; 3] = [
    Vertex {
        position: [0.0, 0.5, 0.0],
        color: [1.0, 0.0, 0.0, 1.0],
    },
    Vertex {
        position: [0.5, -0.5, 0.0],
        color: [0.0, 1.0, 0.0, 1.0],
    },
    Vertex {
        position: [-0.5, -0.5, 0.0],
        color: [0.0, 0.0, 1.0, 1.0],
    },
];

/// `D3D12_DRAW_ARGUMENTS`：VertexCountPerInstance、InstanceCount、StartVertex、StartInstance
const DRAW_ARGUMENTS: [u32; 4] = [3, 1, 0, 0];

/// 某个帧槽位的回读结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadbackSample {
    pub frame: u64,
    /// 计算输出纹理 (0, 0) 处的值
    pub first_pixel: u32,
    /// 工作图计数器，未启用工作图时为 `None`
    pub graph_counter: Option<[u32; 2]>,
}

/// 每个帧槽位独享的回读缓冲
struct FrameReadback<B: GraphicsBackend> {
    texture: Resource<B>,
    counter: Option<Resource<B>>,
    /// 写入它的那一帧
    pending: Option<(u64, FenceValue)>,
}

struct WorkGraph<B: GraphicsBackend> {
    program: Program<B>,
    counter: Resource<B>,
    counter_uav: u32,
}

/// 帧驱动
pub struct FrameDriver<B: GraphicsBackend, P: Presenter<B>> {
    context: DeviceContext<B>,
    presenter: P,
    path: PipelinePath,
    vsync: bool,

    fill_program: Program<B>,
    triangle_program: Program<B>,
    work_graph: Option<WorkGraph<B>>,

    vertex_buffer: VertexBufferResource<B>,
    indirect_args: Resource<B>,

    fill_texture: TextureResource<B>,
    fill_uav: u32,
    readbacks: Vec<FrameReadback<B>>,

    capture: GpuCapture,
    capture_requested: bool,
    frame_number: u64,
    last_readback: Option<ReadbackSample>,
}

impl<B: GraphicsBackend, P: Presenter<B>> FrameDriver<B, P> {
    /// 编译着色器、构建程序并上传静态几何
    pub fn new(
        mut context: DeviceContext<B>,
        presenter: P,
        compiler: &dyn ShaderCompiler,
        config: &Config,
    ) -> Result<Self> {
        let capabilities = context.capabilities()?;
        let path = PipelinePath::select(&capabilities, config.graphics.pipeline_path)?;

        let fill_shader = compiler.compile(
            &capabilities,
            &ShaderDesc::new(ShaderStage::Compute, "ResolutionFill.hlsl", "main"),
        )?;
        let fill_program = context.create_program(&ProgramDesc::compute("ResolutionFill", fill_shader, 3), path)?;

        let vertex = compiler.compile(
            &capabilities,
            &ShaderDesc::new(ShaderStage::Vertex, "Triangle.hlsl", "VSMain"),
        )?;
        let pixel = compiler.compile(
            &capabilities,
            &ShaderDesc::new(ShaderStage::Pixel, "Triangle.hlsl", "PSMain"),
        )?;
        let triangle_program = context.create_program(
            &ProgramDesc::graphics("Triangle", vertex, pixel, presenter.format()),
            path,
        )?;

        let work_graph = if path.supports_work_graphs() {
            Some(create_work_graph(&mut context, compiler, path)?)
        } else {
            info!("Legacy pipeline path, work graph disabled");
            None
        };

        let (vertex_buffer, indirect_args) = upload_geometry(&mut context)?;

        let mut driver = Self {
            context,
            presenter,
            path,
            vsync: config.graphics.vsync,
            fill_program,
            triangle_program,
            work_graph,
            vertex_buffer,
            indirect_args,
            fill_texture: TextureResource::new(),
            fill_uav: 0,
            readbacks: Vec::new(),
            capture: GpuCapture::from_config(&config.capture),
            capture_requested: false,
            frame_number: 0,
            last_readback: None,
        };

        let (width, height) = driver.presenter.size();
        driver.create_size_dependent(width, height)?;
        info!(width, height, path = %path, "Frame driver ready");
        Ok(driver)
    }

    pub fn context(&self) -> &DeviceContext<B> {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut DeviceContext<B> {
        &mut self.context
    }

    pub fn presenter(&self) -> &P {
        &self.presenter
    }

    pub fn path(&self) -> PipelinePath {
        self.path
    }

    /// 已提交的帧数
    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    /// 最近一次读取到的回读结果
    pub fn last_readback(&self) -> Option<ReadbackSample> {
        self.last_readback
    }

    pub fn capture_requested(&self) -> bool {
        self.capture_requested
    }

    /// 处理窗口事件
    pub fn handle_event(&mut self, event: FrameEvent) -> Result<LoopControl> {
        debug!(%event, "Frame event");
        match event {
            FrameEvent::CloseRequested | FrameEvent::KeyDown(KeyCode::Escape) => return Ok(LoopControl::Exit),
            FrameEvent::KeyDown(KeyCode::F1) => {
                if self.capture.is_active() {
                    self.capture_requested = true;
                } else {
                    warn!("No capture tool loaded, F1 ignored");
                }
            }
            FrameEvent::KeyDown(KeyCode::F11) => {
                let fullscreen = !self.presenter.is_fullscreen();
                self.presenter.set_fullscreen(fullscreen)?;
                info!(fullscreen, "Fullscreen toggled");
            }
            FrameEvent::KeyDown(KeyCode::Other(_)) => {}
            FrameEvent::Resize { width, height } => self.resize(width, height)?,
        }
        Ok(LoopControl::Continue)
    }

    /// 先等 GPU 空闲再重建后备缓冲
    fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        if width == 0 || height == 0 {
            debug!("Window minimized, resize skipped");
            return Ok(());
        }
        if (width, height) == self.presenter.size() {
            return Ok(());
        }

        self.context.flush(self.presenter.back_buffer_count())?;
        self.release_size_dependent()?;
        self.presenter.release_buffers(&mut self.context)?;
        self.presenter.resize_buffers(&mut self.context, width, height)?;
        self.create_size_dependent(width, height)?;

        info!(width, height, "Resized");
        Ok(())
    }

    /// 计算输出纹理与每个槽位的回读缓冲
    fn create_size_dependent(&mut self, width: u32, height: u32) -> Result<()> {
        self.fill_texture.set_resource_info(
            HeapType::Default,
            ResourceFlags::ALLOW_UNORDERED_ACCESS,
            width,
            height,
            TextureFormat::R32Uint,
        )?;
        self.fill_texture.create_resource(&mut self.context, "ResolutionFill Output")?;
        self.fill_uav = self.context.create_uav(
            self.fill_texture.resource(),
            ViewDimension::Texture2D {
                format: TextureFormat::R32Uint,
            },
        )?;

        let footprint = self.fill_texture.resource().size_in_bytes();
        let graph = self.work_graph.is_some();
        self.readbacks.clear();
        for slot in 0..self.context.frame_count() {
            let mut texture = Resource::with_info(ResourceInfo::buffer(HeapType::Readback, ResourceFlags::NONE, footprint));
            texture.create_resource(&mut self.context, &format!("Fill Readback {}", slot))?;

            let counter = if graph {
                let mut counter =
                    Resource::with_info(ResourceInfo::buffer(HeapType::Readback, ResourceFlags::NONE, GRAPH_COUNTER_SIZE));
                counter.create_resource(&mut self.context, &format!("Graph Readback {}", slot))?;
                Some(counter)
            } else {
                None
            };

            self.readbacks.push(FrameReadback {
                texture,
                counter,
                pending: None,
            });
        }
        Ok(())
    }

    /// GPU 必须空闲
    fn release_size_dependent(&mut self) -> Result<()> {
        self.context.release_view(self.fill_uav)?;
        self.context.destroy_resource_now(self.fill_texture.resource_mut())?;
        for mut readback in self.readbacks.drain(..) {
            self.context.destroy_resource_now(&mut readback.texture)?;
            if let Some(counter) = readback.counter.as_mut() {
                self.context.destroy_resource_now(counter)?;
            }
        }
        Ok(())
    }

    /// 读取某个槽位的回读缓冲，写入它的那一帧尚未完成时返回 `None`
    pub fn read_back(&mut self, slot: usize) -> Result<Option<ReadbackSample>> {
        let completed = self.context.completed_fence_value();
        let Some(readback) = self.readbacks.get(slot) else {
            return Ok(None);
        };
        let Some((frame, fence)) = readback.pending else {
            return Ok(None);
        };
        if fence > completed {
            return Ok(None);
        }

        let mut pixel = [0u8; 4];
        self.context.read_buffer(&readback.texture, 0, &mut pixel)?;

        let graph_counter = match &readback.counter {
            Some(counter) => {
                let mut bytes = [0u8; GRAPH_COUNTER_SIZE as usize];
                self.context.read_buffer(counter, 0, &mut bytes)?;
                let values: [u32; 2] = bytemuck::cast(bytes);
                Some(values)
            }
            None => None,
        };

        Ok(Some(ReadbackSample {
            frame,
            first_pixel: bytemuck::cast(pixel),
            graph_counter,
        }))
    }

    /// 录制并提交一帧
    pub fn render_frame(&mut self) -> Result<()> {
        let capturing = std::mem::take(&mut self.capture_requested);
        if capturing {
            self.capture.start_capture();
        }

        let slot = self.context.begin_frame()?;
        if let Some(sample) = self.read_back(slot)? {
            debug!(
                frame = sample.frame,
                first_pixel = sample.first_pixel,
                graph = ?sample.graph_counter,
                "Readback"
            );
            self.last_readback = Some(sample);
        }

        let index = self.presenter.current_back_buffer_index();
        let rtv = self.presenter.rtv(index);
        let (width, height) = self.presenter.size();
        let queue = QueueType::Graphics;

        let back_buffer = self.presenter.back_buffer_mut(index);
        self.context.transition(ResourceState::RenderTarget, back_buffer)?;
        self.context.clear_render_target(back_buffer, rtv, CLEAR_COLOR)?;

        // 计算写入，然后拷贝到本槽位的回读缓冲
        self.context
            .transition(ResourceState::UnorderedAccess, self.fill_texture.resource_mut())?;
        self.context.set_program(queue, &self.fill_program)?;
        self.context.set_root_constants(queue, &[self.fill_uav, width, height], 0)?;
        self.context.dispatch(
            queue,
            width.div_ceil(FILL_GROUP_SIZE),
            height.div_ceil(FILL_GROUP_SIZE),
            1,
        )?;
        self.context
            .transition(ResourceState::CopySource, self.fill_texture.resource_mut())?;
        self.context
            .copy_texture_to_buffer(queue, &self.readbacks[slot].texture, self.fill_texture.resource())?;

        // 三角形与间接绘制
        let back_buffer = self.presenter.back_buffer_mut(index);
        self.context.set_program(queue, &self.triangle_program)?;
        self.context.set_render_target(back_buffer, rtv)?;
        self.context.set_viewport(width, height)?;
        self.context.set_vertex_buffer(&self.vertex_buffer)?;
        self.context.draw_instanced(self.vertex_buffer.count(), 1)?;
        self.context.draw_indirect(&self.indirect_args, 0)?;

        if let Some(graph) = self.work_graph.as_mut() {
            self.context
                .transition(ResourceState::UnorderedAccess, &mut graph.counter)?;
            self.context.set_program(queue, &graph.program)?;
            self.context.set_root_constants(queue, &[graph.counter_uav], 0)?;
            self.context
                .dispatch_graph(queue, &graph.program, &[], GRAPH_RECORD_STRIDE)?;
            self.context.transition(ResourceState::CopySource, &mut graph.counter)?;
            if let Some(target) = &self.readbacks[slot].counter {
                self.context.copy_resource(queue, target, &graph.counter)?;
            }
        }

        let back_buffer = self.presenter.back_buffer_mut(index);
        self.context.transition(ResourceState::Present, back_buffer)?;

        let fence = self.context.end_frame()?;
        self.readbacks[slot].pending = Some((self.frame_number, fence));
        self.frame_number += 1;

        self.presenter.present(&mut self.context, self.vsync)?;

        if capturing {
            if let Some(path) = self.capture.end_capture() {
                self.capture.open_capture(&path);
            }
        }
        Ok(())
    }

    /// 等待所有在途帧并释放全部 GPU 对象
    pub fn shutdown(mut self) -> Result<()> {
        let frames = self.presenter.back_buffer_count();
        self.context.flush(frames)?;

        self.release_size_dependent()?;
        self.context.destroy_resource_now(&mut self.indirect_args)?;
        self.context.destroy_resource_now(self.vertex_buffer.resource_mut())?;
        if let Some(mut graph) = self.work_graph.take() {
            self.context.release_view(graph.counter_uav)?;
            self.context.destroy_resource_now(&mut graph.counter)?;
            self.context.release_program(graph.program);
        }
        self.presenter.release_buffers(&mut self.context)?;

        info!(frames = self.frame_number, "Frame driver shut down");
        self.context.shutdown()
    }
}

fn create_work_graph<B: GraphicsBackend>(
    context: &mut DeviceContext<B>,
    compiler: &dyn ShaderCompiler,
    path: PipelinePath,
) -> Result<WorkGraph<B>> {
    let capabilities = context.capabilities()?;
    let library = compiler.compile(&capabilities, &ShaderDesc::new(ShaderStage::Library, "WorkGraph.hlsl", ""))?;
    let program = context.create_program(&ProgramDesc::work_graph("BroadcastGraph", library, 1), path)?;

    let mut counter = Resource::with_info(ResourceInfo::buffer(
        HeapType::Default,
        ResourceFlags::ALLOW_UNORDERED_ACCESS,
        GRAPH_COUNTER_SIZE,
    ));
    counter.create_resource(context, "Graph Counter")?;
    let counter_uav = context.create_uav(
        &counter,
        ViewDimension::Buffer {
            first_element: 0,
            num_elements: (GRAPH_COUNTER_SIZE / 4) as u32,
            stride: 4,
        },
    )?;

    Ok(WorkGraph {
        program,
        counter,
        counter_uav,
    })
}

/// 经由 upload 堆把三角形与间接参数拷到默认堆
fn upload_geometry<B: GraphicsBackend>(context: &mut DeviceContext<B>) -> Result<(VertexBufferResource<B>, Resource<B>)> {
    let vertex_bytes: &[u8] = bytemuck::cast_slice(&TRIANGLE);
    let args_bytes: &[u8] = bytemuck::cast_slice(&DRAW_ARGUMENTS);

    let mut vertex_buffer = VertexBufferResource::new();
    vertex_buffer.set_resource_info(
        HeapType::Default,
        ResourceFlags::NONE,
        vertex_bytes.len() as u64,
        std::mem::size_of::<Vertex>() as u32,
    )?;
    vertex_buffer.create_resource(context, "Triangle Vertices")?;

    let mut indirect_args =
        Resource::with_info(ResourceInfo::buffer(HeapType::Default, ResourceFlags::NONE, args_bytes.len() as u64));
    indirect_args.create_resource(context, "Draw Arguments")?;

    let mut vertex_staging =
        Resource::with_info(ResourceInfo::buffer(HeapType::Upload, ResourceFlags::NONE, vertex_bytes.len() as u64));
    vertex_staging.create_resource(context, "Triangle Staging")?;
    context.write_buffer(&vertex_staging, 0, vertex_bytes)?;

    let mut args_staging =
        Resource::with_info(ResourceInfo::buffer(HeapType::Upload, ResourceFlags::NONE, args_bytes.len() as u64));
    args_staging.create_resource(context, "Draw Arguments Staging")?;
    context.write_buffer(&args_staging, 0, args_bytes)?;

    let queue = QueueType::Graphics;
    context.init_command_lists()?;
    context.transition(ResourceState::CopyDest, vertex_buffer.resource_mut())?;
    context.copy_resource(queue, vertex_buffer.resource(), &vertex_staging)?;
    context.transition(ResourceState::VertexAndConstantBuffer, vertex_buffer.resource_mut())?;

    context.transition(ResourceState::CopyDest, &mut indirect_args)?;
    context.copy_resource(queue, &indirect_args, &args_staging)?;
    context.transition(ResourceState::IndirectArgument, &mut indirect_args)?;
    context.execute_command_list_graphics()?;

    context.release_resource(&mut vertex_staging);
    context.release_resource(&mut args_staging);
    debug!(vertices = vertex_buffer.count(), "Geometry uploaded");
    Ok((vertex_buffer, indirect_args))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vertex_layout() {
        assert_eq!(std::mem::size_of::<Vertex>(), 28);
        assert_eq!(bytemuck::cast_slice::<Vertex, u8>(&TRIANGLE).len(), 84);
    }

    #[test]
    fn test_clear_color() {
        assert!((CLEAR_COLOR[1] - 230.0 / 255.0).abs() < f32::EPSILON);
        assert_eq!(CLEAR_COLOR[3], 1.0);
    }
}
