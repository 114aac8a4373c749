//! 软件交换链
//!
//! 后备缓冲是普通的渲染目标纹理，呈现操作排在图形队列时间线上，执行时检查
//! 缓冲处于 present 状态。每次释放、创建、呈现都会记入事件列表，供测试核对
//! resize 的顺序。

use tracing::{debug, info};

use crate::core::error::{GraphicsError, Result};
use crate::renderer::context::DeviceContext;
use crate::renderer::descriptor::DescriptorSlot;
use crate::renderer::frame::Presenter;
use crate::renderer::resource::{HeapType, Resource, ResourceFlags, ResourceInfo, ResourceState, TextureFormat};
use crate::renderer::sync::FenceValue;

use super::HeadlessBackend;

/// 交换链上发生的事情
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenterEvent {
    /// 后备缓冲被释放时 GPU 是否空闲
    Released { gpu_idle: bool, fence: FenceValue },
    Created { width: u32, height: u32, count: usize },
    Presented { index: usize },
}

struct BackBuffer {
    resource: Resource<HeadlessBackend>,
    rtv: DescriptorSlot,
}

pub struct HeadlessPresenter {
    buffers: Vec<BackBuffer>,
    buffer_count: usize,
    width: u32,
    height: u32,
    current: usize,
    fullscreen: bool,
    events: Vec<PresenterEvent>,
}

impl HeadlessPresenter {
    pub const FORMAT: TextureFormat = TextureFormat::Rgba8Unorm;

    pub fn new(
        context: &mut DeviceContext<HeadlessBackend>,
        buffer_count: usize,
        width: u32,
        height: u32,
    ) -> Result<Self> {
        let mut presenter = Self {
            buffers: Vec::with_capacity(buffer_count),
            buffer_count,
            width,
            height,
            current: 0,
            fullscreen: false,
            events: Vec::new(),
        };
        presenter.create_buffers(context)?;
        Ok(presenter)
    }

    pub fn events(&self) -> &[PresenterEvent] {
        &self.events
    }

    pub fn back_buffer(&self, index: usize) -> &Resource<HeadlessBackend> {
        &self.buffer(index).resource
    }

    fn create_buffers(&mut self, context: &mut DeviceContext<HeadlessBackend>) -> Result<()> {
        for index in 0..self.buffer_count {
            let info = ResourceInfo::texture2d(
                HeapType::Default,
                ResourceFlags::ALLOW_RENDER_TARGET,
                self.width,
                self.height,
                Self::FORMAT,
            )
            .with_initial_state(ResourceState::Present);

            let mut resource = Resource::with_info(info);
            resource.create_resource(context, &format!("Back Buffer {}", index))?;
            let rtv = context.create_rtv(&resource)?;
            self.buffers.push(BackBuffer { resource, rtv });
        }

        self.current = 0;
        self.events.push(PresenterEvent::Created {
            width: self.width,
            height: self.height,
            count: self.buffer_count,
        });
        debug!(width = self.width, height = self.height, "Headless back buffers created");
        Ok(())
    }

    fn buffer(&self, index: usize) -> &BackBuffer {
        &self.buffers[index % self.buffers.len()]
    }
}

impl Presenter<HeadlessBackend> for HeadlessPresenter {
    fn back_buffer_count(&self) -> usize {
        self.buffer_count
    }

    fn current_back_buffer_index(&self) -> usize {
        self.current
    }

    fn back_buffer_mut(&mut self, index: usize) -> &mut Resource<HeadlessBackend> {
        let len = self.buffers.len();
        &mut self.buffers[index % len].resource
    }

    fn rtv(&self, index: usize) -> DescriptorSlot {
        self.buffer(index).rtv
    }

    fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn format(&self) -> TextureFormat {
        Self::FORMAT
    }

    fn release_buffers(&mut self, context: &mut DeviceContext<HeadlessBackend>) -> Result<()> {
        self.events.push(PresenterEvent::Released {
            gpu_idle: context.is_idle(),
            fence: context.fence_value(),
        });

        for mut buffer in self.buffers.drain(..) {
            context.release_descriptor(buffer.rtv)?;
            context.destroy_resource_now(&mut buffer.resource)?;
        }
        Ok(())
    }

    fn resize_buffers(&mut self, context: &mut DeviceContext<HeadlessBackend>, width: u32, height: u32) -> Result<()> {
        if !self.buffers.is_empty() {
            return Err(GraphicsError::SwapchainError("resize with back buffers still alive".to_string()).into());
        }
        self.width = width;
        self.height = height;
        self.create_buffers(context)
    }

    fn present(&mut self, context: &mut DeviceContext<HeadlessBackend>, _vsync: bool) -> Result<()> {
        let index = self.current;
        let native = *self.buffer(index).resource.require_native()?;
        context.backend_mut().queue_present(&native);

        self.events.push(PresenterEvent::Presented { index });
        self.current = (self.current + 1) % self.buffer_count;
        Ok(())
    }

    fn set_fullscreen(&mut self, fullscreen: bool) -> Result<()> {
        info!(fullscreen, "Headless fullscreen state changed");
        self.fullscreen = fullscreen;
        Ok(())
    }

    fn is_fullscreen(&self) -> bool {
        self.fullscreen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::context::ContextDesc;

    #[test]
    fn test_release_requires_idle_gpu() {
        let mut ctx = DeviceContext::new(HeadlessBackend::new(), &ContextDesc::default()).unwrap();
        let mut presenter = HeadlessPresenter::new(&mut ctx, 2, 64, 32).unwrap();

        ctx.begin_frame().unwrap();
        ctx.end_frame().unwrap();
        assert!(presenter.release_buffers(&mut ctx).is_err());

        ctx.flush(2).unwrap();
        let mut presenter = HeadlessPresenter::new(&mut ctx, 2, 64, 32).unwrap();
        presenter.release_buffers(&mut ctx).unwrap();
        presenter.resize_buffers(&mut ctx, 128, 64).unwrap();
        assert_eq!(presenter.size(), (128, 64));
        assert!(matches!(
            presenter.events().last(),
            Some(PresenterEvent::Created { width: 128, height: 64, count: 2 })
        ));
    }

    #[test]
    fn test_back_buffers_start_presentable() {
        let mut ctx = DeviceContext::new(HeadlessBackend::new(), &ContextDesc::default()).unwrap();
        let mut presenter = HeadlessPresenter::new(&mut ctx, 3, 16, 16).unwrap();
        assert_eq!(presenter.back_buffer_mut(2).state(), ResourceState::Present);
        assert_eq!(ctx.backend().live_resource_count(), 3);
    }
}
