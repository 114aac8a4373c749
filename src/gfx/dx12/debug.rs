//! 调试层与信息队列
//!
//! 调试层必须在创建设备之前启用。信息队列中的消息在每次提交后转发到
//! `tracing`，错误级别消息按配置中断到调试器。

use tracing::{debug, error, info, warn};
use windows::Win32::Graphics::Direct3D12::*;
use windows::Win32::Graphics::Dxgi::{
    DXGIGetDebugInterface1, IDXGIDebug1, DXGI_DEBUG_ALL, DXGI_DEBUG_RLO_DETAIL, DXGI_DEBUG_RLO_IGNORE_INTERNAL,
};

use crate::core::config::DebugConfig;
use crate::core::error::Result;

use super::check::check;

/// 启用 D3D12 调试层，可选 GPU 端验证
pub fn enable_debug_layer(config: &DebugConfig) -> Result<()> {
    unsafe {
        let mut debug: Option<ID3D12Debug> = None;
        check("D3D12GetDebugInterface", D3D12GetDebugInterface(&mut debug))?;
        let Some(debug) = debug else {
            warn!("D3D12 debug interface unavailable");
            return Ok(());
        };
        debug.EnableDebugLayer();

        if config.gpu_based_validation {
            match windows::core::Interface::cast::<ID3D12Debug1>(&debug) {
                Ok(debug1) => debug1.SetEnableGPUBasedValidation(true),
                Err(err) => warn!("GPU based validation unavailable: {}", err),
            }
        }
    }

    info!(gpu_based_validation = config.gpu_based_validation, "D3D12 debug layer enabled");
    Ok(())
}

/// 信息队列
pub struct InfoQueue {
    queue: ID3D12InfoQueue,
}

impl InfoQueue {
    /// 调试层未启用时设备没有信息队列，返回 `None`
    pub fn attach(device: &ID3D12Device, config: &DebugConfig) -> Option<Self> {
        let queue = windows::core::Interface::cast::<ID3D12InfoQueue>(device).ok()?;
        unsafe {
            if config.break_on_error {
                let _ = queue.SetBreakOnSeverity(D3D12_MESSAGE_SEVERITY_CORRUPTION, true);
                let _ = queue.SetBreakOnSeverity(D3D12_MESSAGE_SEVERITY_ERROR, true);
            }
        }
        Some(Self { queue })
    }

    /// 把积累的消息写入日志并清空，返回错误级别消息的数量
    pub fn drain(&self) -> usize {
        let mut errors = 0;
        unsafe {
            let count = self.queue.GetNumStoredMessages();
            for index in 0..count {
                let mut length = 0usize;
                if self.queue.GetMessage(index, None, &mut length).is_err() || length == 0 {
                    continue;
                }

                // D3D12_MESSAGE 之后紧跟描述字符串，按 8 字节对齐分配
                let mut storage = vec![0u64; length.div_ceil(8)];
                let message = storage.as_mut_ptr() as *mut D3D12_MESSAGE;
                if self.queue.GetMessage(index, Some(message), &mut length).is_err() {
                    continue;
                }

                let message = &*message;
                let text = std::ffi::CStr::from_ptr(message.pDescription as *const _).to_string_lossy();
                match message.Severity {
                    D3D12_MESSAGE_SEVERITY_CORRUPTION | D3D12_MESSAGE_SEVERITY_ERROR => {
                        errors += 1;
                        error!(id = message.ID.0, "D3D12: {}", text);
                    }
                    D3D12_MESSAGE_SEVERITY_WARNING => warn!(id = message.ID.0, "D3D12: {}", text),
                    _ => debug!(id = message.ID.0, "D3D12: {}", text),
                }
            }
            self.queue.ClearStoredMessages();
        }
        errors
    }
}

/// 关闭时报告仍存活的 DXGI/D3D12 对象
pub fn report_live_objects() {
    unsafe {
        if let Ok(debug) = DXGIGetDebugInterface1::<IDXGIDebug1>(0) {
            let flags = DXGI_DEBUG_RLO_DETAIL | DXGI_DEBUG_RLO_IGNORE_INTERNAL;
            if let Err(err) = debug.ReportLiveObjects(DXGI_DEBUG_ALL, flags) {
                warn!("ReportLiveObjects failed: {}", err);
            }
        }
    }
}
