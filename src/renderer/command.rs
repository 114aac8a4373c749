//! 命令流管理模块
//!
//! 每种队列类型（图形、计算、复制）对应一条命令流：一个队列、每个帧槽位一个
//! 命令分配器、一个命令列表，以及 `is_open` 标志。本模块只维护与 API 无关的
//! 状态机，原生对象由后端持有。
//!
//! # 状态转换
//!
//! ```text
//! Closed --begin--> Recording --close--> Closed --submit--> (分配器记录 fence)
//! ```
//!
//! 分配器只有在其上一次提交的 fence 完成后才能重置。

use std::fmt;

use crate::core::error::{GraphicsError, Result};

use super::sync::FenceValue;

/// 队列类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueType {
    /// 图形队列，可以执行所有命令
    Graphics,
    /// 计算队列，可以执行计算与复制命令
    Compute,
    /// 复制队列，只能执行复制命令
    Copy,
}

impl QueueType {
    pub const ALL: [QueueType; 3] = [QueueType::Graphics, QueueType::Compute, QueueType::Copy];

    /// 在命令流数组中的下标
    pub fn index(self) -> usize {
        match self {
            QueueType::Graphics => 0,
            QueueType::Compute => 1,
            QueueType::Copy => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            QueueType::Graphics => "graphics",
            QueueType::Compute => "compute",
            QueueType::Copy => "copy",
        }
    }

    /// 是否可以录制 Dispatch / SetProgram
    pub fn allows_dispatch(self) -> bool {
        !matches!(self, QueueType::Copy)
    }

    /// 是否可以录制绘制与渲染目标操作
    pub fn allows_draw(self) -> bool {
        matches!(self, QueueType::Graphics)
    }
}

impl fmt::Display for QueueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 命令列表状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandListState {
    /// 已关闭（初始状态或提交之后）
    Closed,
    /// 已重置，正在录制
    Recording,
}

/// 一条命令流的 CPU 侧状态
#[derive(Debug)]
pub struct CommandStream {
    queue_type: QueueType,
    state: CommandListState,
    /// 当前录制使用的分配器
    allocator_index: usize,
    /// 每个分配器最后一次提交对应的 fence 值
    allocator_fences: Vec<FenceValue>,
    /// 自本次打开以来录制的屏障数
    barriers_recorded: u64,
    /// 自本次打开以来录制的命令数（含屏障）
    commands_recorded: u64,
    submissions: u64,
}

impl CommandStream {
    pub fn new(queue_type: QueueType, allocator_count: usize) -> Self {
        assert!(allocator_count >= 1, "At least one command allocator required");

        Self {
            queue_type,
            state: CommandListState::Closed,
            allocator_index: 0,
            allocator_fences: vec![FenceValue::ZERO; allocator_count],
            barriers_recorded: 0,
            commands_recorded: 0,
            submissions: 0,
        }
    }

    pub fn queue_type(&self) -> QueueType {
        self.queue_type
    }

    pub fn state(&self) -> CommandListState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == CommandListState::Recording
    }

    pub fn allocator_index(&self) -> usize {
        self.allocator_index
    }

    pub fn barriers_recorded(&self) -> u64 {
        self.barriers_recorded
    }

    /// 正在录制且已有命令，提交前其中的命令可能引用任何对象
    pub fn has_pending_commands(&self) -> bool {
        self.is_open() && self.commands_recorded > 0
    }

    pub fn submissions(&self) -> u64 {
        self.submissions
    }

    /// 打开命令流
    ///
    /// 选定的分配器上一次提交必须已经完成，否则重置它会破坏 GPU 仍在读取的命令。
    pub fn begin(&mut self, allocator_index: usize, completed: FenceValue) -> Result<()> {
        if self.is_open() {
            return Err(GraphicsError::CommandExecution(format!(
                "{} command list is already open",
                self.queue_type
            ))
            .into());
        }

        let last_use = *self.allocator_fences.get(allocator_index).ok_or_else(|| {
            GraphicsError::CommandExecution(format!(
                "{} stream has no command allocator {}",
                self.queue_type, allocator_index
            ))
        })?;

        if last_use > completed {
            return Err(GraphicsError::CommandExecution(format!(
                "{} command allocator {} is still in flight (fence {}, completed {})",
                self.queue_type, allocator_index, last_use, completed
            ))
            .into());
        }

        self.allocator_index = allocator_index;
        self.state = CommandListState::Recording;
        self.barriers_recorded = 0;
        self.commands_recorded = 0;
        Ok(())
    }

    /// 关闭命令流，返回所用分配器的索引
    pub fn close(&mut self) -> Result<usize> {
        self.require_open("Close")?;
        self.state = CommandListState::Closed;
        Ok(self.allocator_index)
    }

    /// 记录本次提交对应的 fence 值
    pub fn mark_submitted(&mut self, fence_value: FenceValue) {
        self.allocator_fences[self.allocator_index] = fence_value;
        self.submissions += 1;
    }

    /// 录制命令前的检查
    pub fn require_open(&self, operation: &str) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(GraphicsError::CommandExecution(format!(
                "{} on {} command list that was never opened",
                operation, self.queue_type
            ))
            .into())
        }
    }

    pub fn note_barrier(&mut self) {
        self.barriers_recorded += 1;
        self.commands_recorded += 1;
    }

    pub fn note_command(&mut self) {
        self.commands_recorded += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_capabilities() {
        assert!(QueueType::Graphics.allows_draw());
        assert!(QueueType::Compute.allows_dispatch());
        assert!(!QueueType::Compute.allows_draw());
        assert!(!QueueType::Copy.allows_dispatch());
        assert_eq!(QueueType::ALL.map(QueueType::index), [0, 1, 2]);
    }

    #[test]
    fn test_close_requires_open() {
        let mut stream = CommandStream::new(QueueType::Compute, 2);
        assert!(stream.close().is_err());

        stream.begin(1, FenceValue::ZERO).unwrap();
        assert!(stream.is_open());
        assert!(stream.begin(1, FenceValue::ZERO).is_err());
        assert_eq!(stream.close().unwrap(), 1);
        assert!(!stream.is_open());
    }

    #[test]
    fn test_allocator_reuse_is_fence_gated() {
        let mut stream = CommandStream::new(QueueType::Graphics, 2);
        stream.begin(0, FenceValue::ZERO).unwrap();
        stream.close().unwrap();
        stream.mark_submitted(FenceValue::new(4));

        // 另一个分配器不受影响
        stream.begin(1, FenceValue::new(3)).unwrap();
        stream.close().unwrap();

        assert!(stream.begin(0, FenceValue::new(3)).is_err());
        stream.begin(0, FenceValue::new(4)).unwrap();
        assert_eq!(stream.submissions(), 1);
    }

    #[test]
    fn test_pending_commands_reset_on_begin() {
        let mut stream = CommandStream::new(QueueType::Graphics, 1);
        stream.begin(0, FenceValue::ZERO).unwrap();
        assert!(!stream.has_pending_commands());

        stream.note_command();
        assert!(stream.has_pending_commands());
        stream.close().unwrap();
        assert!(!stream.has_pending_commands());

        stream.begin(0, FenceValue::ZERO).unwrap();
        assert!(!stream.has_pending_commands());
    }
}
