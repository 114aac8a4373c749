//! GPU 同步机制模块
//!
//! CPU 侧的 fence 记账：单调递增的 fence 值、按在途帧划分的帧槽位，以及
//! 以 fence 值为门槛的延迟释放队列。真正的 GPU fence 对象由后端持有，
//! 这里只负责"哪个值代表哪批工作"。
//!
//! # 使用场景
//!
//! 1. **同步提交**：每次 signal-and-wait 都从 [`FenceCounter::next_value`] 取一个新值
//! 2. **帧同步**：[`FramePool`] 记录每个帧槽位最后一次提交的 fence 值，
//!    复用槽位前只等待这一个值
//! 3. **资源回收**：描述符、资源与程序对象在 fence 越过释放时的值之后才真正回收，
//!    释放时尚未提交的命令流先由 [`SubmissionHold`] 挂起

use std::collections::VecDeque;
use std::fmt;

/// Fence 值
///
/// 用于 CPU-GPU 同步的单调递增值。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FenceValue(u64);

impl FenceValue {
    pub const ZERO: FenceValue = FenceValue(0);

    /// 创建新的 Fence 值
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// 获取内部值
    pub fn value(&self) -> u64 {
        self.0
    }

    /// 下一个 Fence 值
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for FenceValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// CPU 侧的 fence 计数器
///
/// `cpu_value` 是最后一次 signal 使用的值，`completed_value` 是 CPU 最后一次
/// 观察到的 GPU 完成值。两者都只增不减。
#[derive(Debug, Default)]
pub struct FenceCounter {
    cpu_value: FenceValue,
    completed_value: FenceValue,
}

impl FenceCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// 最后一次 signal 的值
    pub fn current_value(&self) -> FenceValue {
        self.cpu_value
    }

    /// 已观察到的 GPU 完成值
    pub fn completed_value(&self) -> FenceValue {
        self.completed_value
    }

    /// 递增计数器并返回新值，每次 signal 恰好调用一次
    pub fn next_value(&mut self) -> FenceValue {
        self.cpu_value = self.cpu_value.next();
        self.cpu_value
    }

    /// 更新已完成的 Fence 值，旧值会被忽略
    pub fn update_completed_value(&mut self, value: FenceValue) {
        if value > self.completed_value {
            self.completed_value = value;
        }
    }

    /// 检查特定 Fence 值是否已完成
    pub fn is_completed(&self, value: FenceValue) -> bool {
        self.completed_value >= value
    }

    /// 所有已 signal 的工作都已完成
    pub fn is_idle(&self) -> bool {
        self.completed_value >= self.cpu_value
    }
}

/// 帧槽位
///
/// 每个后备缓冲对应一个槽位，槽位内的命令分配器和回读缓冲在
/// `fence_value` 完成之前不能复用。
#[derive(Debug, Clone)]
pub struct FrameSlot {
    /// 槽位索引
    pub index: usize,
    /// 该槽位最后一次提交的 fence 值
    pub fence_value: FenceValue,
    /// GPU 可能仍在使用该槽位
    pub in_flight: bool,
}

impl FrameSlot {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            fence_value: FenceValue::ZERO,
            in_flight: false,
        }
    }

    /// 标记为在途（GPU 正在使用）
    pub fn mark_in_flight(&mut self, fence_value: FenceValue) {
        self.in_flight = true;
        self.fence_value = fence_value;
    }
}

/// 帧槽位池
///
/// 循环使用固定数量的槽位，数量等于后备缓冲数。
pub struct FramePool {
    slots: Vec<FrameSlot>,
    current_index: usize,
}

impl FramePool {
    /// 创建新的帧槽位池
    ///
    /// # 参数
    ///
    /// * `count` - 槽位数量（通常为 2 或 3）
    pub fn new(count: usize) -> Self {
        assert!(count >= 1, "At least one frame slot required");

        Self {
            slots: (0..count).map(FrameSlot::new).collect(),
            current_index: 0,
        }
    }

    pub fn count(&self) -> usize {
        self.slots.len()
    }

    pub fn current_index(&self) -> usize {
        self.current_index
    }

    pub fn current(&self) -> &FrameSlot {
        &self.slots[self.current_index]
    }

    pub fn current_mut(&mut self) -> &mut FrameSlot {
        &mut self.slots[self.current_index]
    }

    pub fn get(&self, index: usize) -> Option<&FrameSlot> {
        self.slots.get(index)
    }

    /// 移动到下一个槽位，返回新的槽位索引
    pub fn advance(&mut self) -> usize {
        self.current_index = (self.current_index + 1) % self.slots.len();
        self.current_index
    }

    /// 根据已完成的 Fence 值更新槽位状态
    pub fn update_availability(&mut self, completed: FenceValue) {
        for slot in &mut self.slots {
            if slot.in_flight && slot.fence_value <= completed {
                slot.in_flight = false;
            }
        }
    }

    /// 复用当前槽位前需要等待的 Fence 值（若无需等待则为 `None`）
    pub fn pending_wait(&self) -> Option<FenceValue> {
        let slot = self.current();
        slot.in_flight.then_some(slot.fence_value)
    }

    /// 所有槽位中最大的在途 Fence 值
    pub fn latest_in_flight(&self) -> Option<FenceValue> {
        self.slots
            .iter()
            .filter(|s| s.in_flight)
            .map(|s| s.fence_value)
            .max()
    }
}

/// 以 Fence 值为门槛的延迟释放队列
///
/// 条目在 `fence.completed >= 记录值` 之前不会被交还。
#[derive(Debug)]
pub struct DeferredReleaseQueue<T> {
    pending: VecDeque<(FenceValue, T)>,
}

impl<T> DeferredReleaseQueue<T> {
    pub fn new() -> Self {
        Self {
            pending: VecDeque::new(),
        }
    }

    pub fn push(&mut self, fence_value: FenceValue, item: T) {
        self.pending.push_back((fence_value, item));
    }

    /// 取出所有记录值不大于 `completed` 的条目
    ///
    /// 记录值不要求单调，整个队列都会被扫描。
    pub fn drain_completed(&mut self, completed: FenceValue) -> Vec<T> {
        let mut done = Vec::new();
        let mut remaining = VecDeque::with_capacity(self.pending.len());

        for (fence_value, item) in self.pending.drain(..) {
            if fence_value <= completed {
                done.push(item);
            } else {
                remaining.push_back((fence_value, item));
            }
        }

        self.pending = remaining;
        done
    }

    /// 某个条目是否仍在等待
    pub fn contains_where(&self, mut pred: impl FnMut(&T) -> bool) -> bool {
        self.pending.iter().any(|(_, item)| pred(item))
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl<T> Default for DeferredReleaseQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// 等待命令流提交的释放
///
/// 释放时仍在录制且已录制命令的命令流可能引用了该对象，此时还不知道哪个
/// fence 值覆盖这些命令。条目记下这些命令流（按队列下标），在它们全部提交后
/// 由 [`submitted`](Self::submitted) 交还，调用方再以最后一次提交的 fence 值
/// 放入 [`DeferredReleaseQueue`]。
#[derive(Debug)]
pub struct SubmissionHold<T> {
    entries: Vec<([bool; 3], T)>,
}

impl<T> SubmissionHold<T> {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn hold(&mut self, streams: [bool; 3], item: T) {
        self.entries.push((streams, item));
    }

    /// 命令流 `stream` 已提交，返回不再等待任何命令流的条目
    pub fn submitted(&mut self, stream: usize) -> Vec<T> {
        let mut done = Vec::new();
        let mut remaining = Vec::with_capacity(self.entries.len());

        for (mut streams, item) in self.entries.drain(..) {
            streams[stream] = false;
            if streams.iter().any(|&waiting| waiting) {
                remaining.push((streams, item));
            } else {
                done.push(item);
            }
        }

        self.entries = remaining;
        done
    }

    /// 取出全部条目，只在这些命令流不会再提交时使用
    pub fn drain(&mut self) -> Vec<T> {
        self.entries.drain(..).map(|(_, item)| item).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T> Default for SubmissionHold<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fence_counter_is_monotonic() {
        let mut fence = FenceCounter::new();
        assert!(fence.is_idle());

        let v1 = fence.next_value();
        let v2 = fence.next_value();
        assert_eq!(v1.value(), 1);
        assert_eq!(v2.value(), 2);
        assert!(!fence.is_idle());

        fence.update_completed_value(v2);
        fence.update_completed_value(v1);
        assert_eq!(fence.completed_value(), v2);
        assert!(fence.is_completed(v1));
        assert!(fence.is_idle());
    }

    #[test]
    fn test_frame_pool_waits_only_for_reused_slot() {
        let mut pool = FramePool::new(3);
        assert_eq!(pool.pending_wait(), None);

        pool.current_mut().mark_in_flight(FenceValue::new(1));
        pool.advance();
        pool.current_mut().mark_in_flight(FenceValue::new(2));
        pool.advance();
        pool.current_mut().mark_in_flight(FenceValue::new(3));
        assert_eq!(pool.advance(), 0);

        assert_eq!(pool.pending_wait(), Some(FenceValue::new(1)));
        assert_eq!(pool.latest_in_flight(), Some(FenceValue::new(3)));

        pool.update_availability(FenceValue::new(1));
        assert_eq!(pool.pending_wait(), None);
        assert!(pool.get(1).unwrap().in_flight);
    }

    #[test]
    fn test_deferred_release_respects_fence() {
        let mut queue = DeferredReleaseQueue::new();
        queue.push(FenceValue::new(5), "late");
        queue.push(FenceValue::new(2), "early");

        assert!(queue.drain_completed(FenceValue::new(1)).is_empty());
        assert_eq!(queue.drain_completed(FenceValue::new(2)), vec!["early"]);
        assert!(queue.contains_where(|item| *item == "late"));
        assert_eq!(queue.drain_completed(FenceValue::new(9)), vec!["late"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_hold_waits_for_every_recording_stream() {
        let mut hold = SubmissionHold::new();
        hold.hold([true, true, false], "shared");
        hold.hold([true, false, false], "graphics");

        assert_eq!(hold.submitted(2), Vec::<&str>::new());
        assert_eq!(hold.submitted(0), vec!["graphics"]);
        assert_eq!(hold.len(), 1);
        assert_eq!(hold.submitted(1), vec!["shared"]);
        assert!(hold.is_empty());
    }
}
