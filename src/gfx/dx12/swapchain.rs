//! DXGI 交换链
//!
//! 后备缓冲作为 [`Resource`] 交给上下文跟踪状态，初始状态为 present。
//! `ResizeBuffers` 要求所有对后备缓冲的引用都已释放，因此帧驱动在 resize
//! 前先刷新 GPU，再调用 [`Presenter::release_buffers`]。

use tracing::{debug, info};
use windows::core::Interface;
use windows::Win32::Foundation::{DXGI_ERROR_DEVICE_REMOVED, DXGI_ERROR_DEVICE_RESET, HWND};
use windows::Win32::Graphics::Direct3D12::ID3D12Resource;
use windows::Win32::Graphics::Dxgi::Common::*;
use windows::Win32::Graphics::Dxgi::*;
use winit::raw_window_handle::{HasWindowHandle, RawWindowHandle};
use winit::window::Window;

use crate::core::error::{GraphicsError, Result};
use crate::renderer::context::DeviceContext;
use crate::renderer::descriptor::DescriptorSlot;
use crate::renderer::frame::Presenter;
use crate::renderer::resource::{HeapType, Resource, ResourceFlags, ResourceInfo, ResourceState, TextureFormat};

use super::check::{api_error, check};
use super::convert::dxgi_format;
use super::Dx12Backend;

struct BackBuffer {
    resource: Resource<Dx12Backend>,
    rtv: DescriptorSlot,
}

pub struct Dx12Presenter {
    swap_chain: IDXGISwapChain3,
    buffers: Vec<BackBuffer>,
    buffer_count: usize,
    width: u32,
    height: u32,
    current: usize,
    fullscreen: bool,
}

/// 从 winit 窗口取出 Win32 句柄
pub fn window_hwnd(window: &Window) -> Result<HWND> {
    let handle = window
        .window_handle()
        .map_err(|err| GraphicsError::SwapchainError(format!("window handle unavailable: {}", err)))?;
    match handle.as_raw() {
        RawWindowHandle::Win32(win32) => Ok(HWND(win32.hwnd.get() as *mut core::ffi::c_void)),
        _ => Err(GraphicsError::SwapchainError("expected a Win32 window handle".to_string()).into()),
    }
}

impl Dx12Presenter {
    pub const FORMAT: TextureFormat = TextureFormat::Rgba8Unorm;

    pub fn new(
        context: &mut DeviceContext<Dx12Backend>,
        window: &Window,
        buffer_count: usize,
        width: u32,
        height: u32,
    ) -> Result<Self> {
        let hwnd = window_hwnd(window)?;
        let backend = context.backend();

        let desc = DXGI_SWAP_CHAIN_DESC1 {
            Width: width,
            Height: height,
            Format: dxgi_format(Self::FORMAT),
            SampleDesc: DXGI_SAMPLE_DESC { Count: 1, Quality: 0 },
            BufferUsage: DXGI_USAGE_RENDER_TARGET_OUTPUT,
            BufferCount: buffer_count as u32,
            SwapEffect: DXGI_SWAP_EFFECT_FLIP_DISCARD,
            ..Default::default()
        };

        let swap_chain = unsafe {
            let swap_chain: IDXGISwapChain1 = check(
                "CreateSwapChainForHwnd",
                backend
                    .factory()
                    .CreateSwapChainForHwnd(backend.graphics_queue(), hwnd, &desc, None, None),
            )?;
            // Alt+Enter 由帧驱动的 F11 处理
            check(
                "MakeWindowAssociation",
                backend.factory().MakeWindowAssociation(hwnd, DXGI_MWA_NO_ALT_ENTER),
            )?;
            check("QueryInterface(IDXGISwapChain3)", swap_chain.cast::<IDXGISwapChain3>())?
        };
        info!(width, height, buffers = buffer_count, "Swap chain created");

        let mut presenter = Self {
            swap_chain,
            buffers: Vec::with_capacity(buffer_count),
            buffer_count,
            width,
            height,
            current: 0,
            fullscreen: false,
        };
        presenter.create_buffers(context)?;
        Ok(presenter)
    }

    fn create_buffers(&mut self, context: &mut DeviceContext<Dx12Backend>) -> Result<()> {
        for index in 0..self.buffer_count {
            let native: ID3D12Resource =
                unsafe { check("IDXGISwapChain::GetBuffer", self.swap_chain.GetBuffer(index as u32))? };
            let info = ResourceInfo::texture2d(
                HeapType::Default,
                ResourceFlags::ALLOW_RENDER_TARGET,
                self.width,
                self.height,
                Self::FORMAT,
            )
            .with_initial_state(ResourceState::Present);

            let resource = Resource::from_native(native, info, ResourceState::Present, format!("Back Buffer {}", index));
            let rtv = context.create_rtv(&resource)?;
            self.buffers.push(BackBuffer { resource, rtv });
        }

        self.current = unsafe { self.swap_chain.GetCurrentBackBufferIndex() } as usize;
        debug!(width = self.width, height = self.height, "Back buffers acquired");
        Ok(())
    }
}

impl Presenter<Dx12Backend> for Dx12Presenter {
    fn back_buffer_count(&self) -> usize {
        self.buffer_count
    }

    fn current_back_buffer_index(&self) -> usize {
        self.current
    }

    fn back_buffer_mut(&mut self, index: usize) -> &mut Resource<Dx12Backend> {
        let len = self.buffers.len();
        &mut self.buffers[index % len].resource
    }

    fn rtv(&self, index: usize) -> DescriptorSlot {
        self.buffers[index % self.buffers.len()].rtv
    }

    fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn format(&self) -> TextureFormat {
        Self::FORMAT
    }

    fn release_buffers(&mut self, context: &mut DeviceContext<Dx12Backend>) -> Result<()> {
        for mut buffer in self.buffers.drain(..) {
            context.release_descriptor(buffer.rtv)?;
            context.destroy_resource_now(&mut buffer.resource)?;
        }
        Ok(())
    }

    fn resize_buffers(&mut self, context: &mut DeviceContext<Dx12Backend>, width: u32, height: u32) -> Result<()> {
        if !self.buffers.is_empty() {
            return Err(GraphicsError::SwapchainError("resize with back buffers still alive".to_string()).into());
        }

        unsafe {
            check(
                "IDXGISwapChain::ResizeBuffers",
                self.swap_chain.ResizeBuffers(
                    self.buffer_count as u32,
                    width,
                    height,
                    DXGI_FORMAT_UNKNOWN,
                    DXGI_SWAP_CHAIN_FLAG(0),
                ),
            )?;
        }
        self.width = width;
        self.height = height;
        info!(width, height, "Swap chain resized");
        self.create_buffers(context)
    }

    fn present(&mut self, context: &mut DeviceContext<Dx12Backend>, vsync: bool) -> Result<()> {
        let sync_interval = if vsync { 1 } else { 0 };
        let result = unsafe { self.swap_chain.Present(sync_interval, DXGI_PRESENT(0)) };
        if result == DXGI_ERROR_DEVICE_REMOVED || result == DXGI_ERROR_DEVICE_RESET {
            context.backend().check_device_removed()?;
        }
        if let Err(err) = result.ok() {
            return Err(api_error("IDXGISwapChain::Present", &err));
        }

        self.current = unsafe { self.swap_chain.GetCurrentBackBufferIndex() } as usize;
        Ok(())
    }

    fn set_fullscreen(&mut self, fullscreen: bool) -> Result<()> {
        unsafe {
            check(
                "IDXGISwapChain::SetFullscreenState",
                self.swap_chain.SetFullscreenState(fullscreen, None),
            )?;
        }
        self.fullscreen = fullscreen;
        info!(fullscreen, "Fullscreen state changed");
        Ok(())
    }

    fn is_fullscreen(&self) -> bool {
        self.fullscreen
    }
}

impl Drop for Dx12Presenter {
    fn drop(&mut self) {
        // 全屏状态下释放交换链是非法的
        if self.fullscreen {
            unsafe {
                let _ = self.swap_chain.SetFullscreenState(false, None);
            }
        }
    }
}
