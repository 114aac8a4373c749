//! 窗口事件模块
//!
//! 帧驱动只关心三类窗口事件：尺寸变化、按键按下和关闭请求。
//! 窗口层（winit）负责把平台事件翻译成 [`FrameEvent`]，帧驱动据此决定
//! 刷新、重建后备缓冲、抓帧或退出。

use std::fmt;

/// 帧驱动关心的按键
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyCode {
    /// 关闭窗口
    Escape,
    /// 请求抓取下一帧
    F1,
    /// 切换全屏
    F11,
    /// 其他按键（以平台扫描码表示）
    Other(u32),
}

/// 窗口事件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameEvent {
    /// 客户区尺寸变化
    Resize { width: u32, height: u32 },
    /// 按键按下
    KeyDown(KeyCode),
    /// 用户请求关闭窗口
    CloseRequested,
}

/// 帧驱动处理事件后的主循环指令
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopControl {
    Continue,
    Exit,
}

impl fmt::Display for FrameEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameEvent::Resize { width, height } => write!(f, "Resize({}x{})", width, height),
            FrameEvent::KeyDown(key) => write!(f, "KeyDown({:?})", key),
            FrameEvent::CloseRequested => write!(f, "CloseRequested"),
        }
    }
}

impl FrameEvent {
    /// 最小化时窗口会报告 0x0，这种尺寸不能用于重建交换链
    pub fn is_degenerate_resize(&self) -> bool {
        matches!(self, FrameEvent::Resize { width, height } if *width == 0 || *height == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_degenerate_resize() {
        assert!(FrameEvent::Resize { width: 0, height: 600 }.is_degenerate_resize());
        assert!(!FrameEvent::Resize { width: 800, height: 600 }.is_degenerate_resize());
        assert!(!FrameEvent::CloseRequested.is_degenerate_resize());
    }

    #[test]
    fn test_event_display() {
        assert_eq!(FrameEvent::Resize { width: 640, height: 480 }.to_string(), "Resize(640x480)");
        assert_eq!(FrameEvent::KeyDown(KeyCode::F1).to_string(), "KeyDown(F1)");
    }
}
