//! 描述符管理模块
//!
//! 固定容量的描述符堆分配器。每个堆的槽位由 (CPU 句柄, GPU 句柄, 无绑定索引)
//! 三元组表示，无绑定索引直接写入着色器根常量。
//!
//! # 堆类型
//!
//! - **Resources**：CBV/SRV/UAV，着色器可见
//! - **Sampler**：采样器，着色器可见
//! - **RTV** / **DSV**：仅 CPU 可见
//!
//! # 槽位生命周期
//!
//! ```text
//! never-used ──allocate──> live ──release(fence)──> pending ──reclaim(completed >= fence)──> free
//!                           ^                                                                 │
//!                           └──────────────────────────allocate───────────────────────────────┘
//! ```
//!
//! 一个槽位在释放时记录的 fence 值完成之前不会被再次分配，因为 GPU 上
//! 可能仍有读取它的命令列表。容量耗尽不会扩容，直接返回错误。

use crate::core::error::{GraphicsError, PlaygroundError, Result};

use super::sync::{DeferredReleaseQueue, FenceValue};

/// 描述符堆类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorHeapKind {
    /// CBV/SRV/UAV
    Resources,
    Sampler,
    Rtv,
    Dsv,
}

impl DescriptorHeapKind {
    pub const ALL: [DescriptorHeapKind; 4] = [
        DescriptorHeapKind::Resources,
        DescriptorHeapKind::Sampler,
        DescriptorHeapKind::Rtv,
        DescriptorHeapKind::Dsv,
    ];

    pub fn is_shader_visible(self) -> bool {
        matches!(self, DescriptorHeapKind::Resources | DescriptorHeapKind::Sampler)
    }

    pub fn name(self) -> &'static str {
        match self {
            DescriptorHeapKind::Resources => "resources",
            DescriptorHeapKind::Sampler => "sampler",
            DescriptorHeapKind::Rtv => "rtv",
            DescriptorHeapKind::Dsv => "dsv",
        }
    }

    fn index(self) -> usize {
        match self {
            DescriptorHeapKind::Resources => 0,
            DescriptorHeapKind::Sampler => 1,
            DescriptorHeapKind::Rtv => 2,
            DescriptorHeapKind::Dsv => 3,
        }
    }
}

/// 视图类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorType {
    /// 渲染目标视图 (RTV)
    RenderTargetView,
    /// 深度模板视图 (DSV)
    DepthStencilView,
    /// 常量缓冲视图 (CBV)
    ConstantBufferView,
    /// 着色资源视图 (SRV)
    ShaderResourceView,
    /// 无序访问视图 (UAV)
    UnorderedAccessView,
    /// 采样器
    Sampler,
}

impl DescriptorType {
    /// 该类型的描述符所在的堆
    pub fn heap_kind(&self) -> DescriptorHeapKind {
        match self {
            DescriptorType::RenderTargetView => DescriptorHeapKind::Rtv,
            DescriptorType::DepthStencilView => DescriptorHeapKind::Dsv,
            DescriptorType::ConstantBufferView
            | DescriptorType::ShaderResourceView
            | DescriptorType::UnorderedAccessView => DescriptorHeapKind::Resources,
            DescriptorType::Sampler => DescriptorHeapKind::Sampler,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DescriptorType::RenderTargetView => "RTV",
            DescriptorType::DepthStencilView => "DSV",
            DescriptorType::ConstantBufferView => "CBV",
            DescriptorType::ShaderResourceView => "SRV",
            DescriptorType::UnorderedAccessView => "UAV",
            DescriptorType::Sampler => "Sampler",
        }
    }
}

/// 描述符堆描述信息
#[derive(Debug, Clone)]
pub struct DescriptorHeapDescriptor {
    pub kind: DescriptorHeapKind,
    pub num_descriptors: u32,
    pub shader_visible: bool,
    pub name: String,
}

impl DescriptorHeapDescriptor {
    pub fn new(kind: DescriptorHeapKind, num_descriptors: u32, name: impl Into<String>) -> Self {
        Self {
            kind,
            num_descriptors,
            shader_visible: kind.is_shader_visible(),
            name: name.into(),
        }
    }

    pub fn resources(num_descriptors: u32) -> Self {
        Self::new(DescriptorHeapKind::Resources, num_descriptors, "Resources Heap")
    }

    pub fn sampler(num_descriptors: u32) -> Self {
        Self::new(DescriptorHeapKind::Sampler, num_descriptors, "Sampler Heap")
    }

    pub fn rtv(num_descriptors: u32) -> Self {
        Self::new(DescriptorHeapKind::Rtv, num_descriptors, "RTV Heap")
    }

    pub fn dsv(num_descriptors: u32) -> Self {
        Self::new(DescriptorHeapKind::Dsv, num_descriptors, "DSV Heap")
    }
}

/// 描述符句柄（CPU 可见）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuDescriptorHandle {
    pub ptr: usize,
}

impl CpuDescriptorHandle {
    pub fn new(ptr: usize) -> Self {
        Self { ptr }
    }

    /// 偏移 `count` 个描述符
    pub fn offset(&self, count: u32, increment_size: u32) -> Self {
        Self {
            ptr: self.ptr + count as usize * increment_size as usize,
        }
    }
}

/// 描述符句柄（GPU 可见）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuDescriptorHandle {
    pub ptr: u64,
}

impl GpuDescriptorHandle {
    pub fn new(ptr: u64) -> Self {
        Self { ptr }
    }

    pub fn offset(&self, count: u32, increment_size: u32) -> Self {
        Self {
            ptr: self.ptr + count as u64 * increment_size as u64,
        }
    }
}

/// 后端创建堆之后报告的布局
#[derive(Debug, Clone, Copy)]
pub struct DescriptorHeapLayout {
    pub cpu_start: CpuDescriptorHandle,
    /// 仅着色器可见的堆有 GPU 起始句柄
    pub gpu_start: Option<GpuDescriptorHandle>,
    pub increment_size: u32,
}

/// 一个描述符槽位
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorSlot {
    pub heap: DescriptorHeapKind,
    pub cpu: CpuDescriptorHandle,
    pub gpu: Option<GpuDescriptorHandle>,
    /// 槽位在堆内的索引，着色器通过它访问 `ResourceDescriptorHeap[i]`
    pub bindless_index: u32,
}

/// 描述符堆统计信息
#[derive(Debug, Clone, PartialEq)]
pub struct DescriptorHeapStats {
    pub kind: DescriptorHeapKind,
    pub capacity: u32,
    /// 已分配且未释放
    pub live: u32,
    /// 已释放、等待 fence
    pub pending: u32,
    /// 可立即复用
    pub free: u32,
    /// 从未使用过
    pub never_used: u32,
}

impl DescriptorHeapStats {
    /// 使用率 (0.0 - 1.0)
    pub fn usage_ratio(&self) -> f32 {
        if self.capacity == 0 {
            0.0
        } else {
            (self.live + self.pending) as f32 / self.capacity as f32
        }
    }
}

/// 描述符分配器
///
/// 先复用空闲列表，其次取下一个从未使用过的槽位，二者都没有时报告容量耗尽。
pub struct DescriptorAllocator {
    kind: DescriptorHeapKind,
    capacity: u32,
    layout: DescriptorHeapLayout,
    /// 下一个从未使用过的槽位
    next_unused: u32,
    free_list: Vec<u32>,
    pending: DeferredReleaseQueue<u32>,
    live: Vec<bool>,
    live_count: u32,
}

impl DescriptorAllocator {
    pub fn new(kind: DescriptorHeapKind, capacity: u32, layout: DescriptorHeapLayout) -> Self {
        Self {
            kind,
            capacity,
            layout,
            next_unused: 0,
            free_list: Vec::new(),
            pending: DeferredReleaseQueue::new(),
            live: vec![false; capacity as usize],
            live_count: 0,
        }
    }

    pub fn kind(&self) -> DescriptorHeapKind {
        self.kind
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// 分配一个槽位
    pub fn allocate(&mut self) -> Result<DescriptorSlot> {
        let index = match self.free_list.pop() {
            Some(index) => index,
            None if self.next_unused < self.capacity => {
                let index = self.next_unused;
                self.next_unused += 1;
                index
            }
            None => {
                return Err(GraphicsError::DescriptorHeapExhausted {
                    heap: self.kind.name(),
                    capacity: self.capacity,
                }
                .into())
            }
        };

        self.live[index as usize] = true;
        self.live_count += 1;
        Ok(self.slot(index))
    }

    /// 释放槽位
    ///
    /// 槽位进入等待列表，直到 `fence_value` 完成后才会被 [`reclaim_completed`]
    /// 放回空闲列表。
    ///
    /// [`reclaim_completed`]: DescriptorAllocator::reclaim_completed
    pub fn release(&mut self, slot: DescriptorSlot, fence_value: FenceValue) -> Result<()> {
        self.retire(slot)?;
        self.defer(slot, fence_value);
        Ok(())
    }

    /// 把槽位标记为不再存活，但还不放入等待列表
    ///
    /// 用于覆盖它的 fence 值尚未确定的情况，之后必须调用 [`defer`](Self::defer)。
    pub fn retire(&mut self, slot: DescriptorSlot) -> Result<()> {
        let index = slot.bindless_index;
        if slot.heap != self.kind || index >= self.capacity || !self.live[index as usize] {
            return Err(PlaygroundError::Runtime(format!(
                "Descriptor {} is not live in the {} heap",
                index,
                self.kind.name()
            )));
        }

        self.live[index as usize] = false;
        self.live_count -= 1;
        Ok(())
    }

    /// 已退役的槽位在 `fence_value` 完成后可复用
    pub fn defer(&mut self, slot: DescriptorSlot, fence_value: FenceValue) {
        self.pending.push(fence_value, slot.bindless_index);
    }

    /// 回收所有记录值不大于 `completed` 的槽位，返回回收数量
    pub fn reclaim_completed(&mut self, completed: FenceValue) -> usize {
        let reclaimed = self.pending.drain_completed(completed);
        let count = reclaimed.len();
        self.free_list.extend(reclaimed);
        count
    }

    /// 根据索引计算槽位句柄
    pub fn slot(&self, index: u32) -> DescriptorSlot {
        let increment = self.layout.increment_size;
        DescriptorSlot {
            heap: self.kind,
            cpu: self.layout.cpu_start.offset(index, increment),
            gpu: self.layout.gpu_start.map(|g| g.offset(index, increment)),
            bindless_index: index,
        }
    }

    pub fn is_live(&self, index: u32) -> bool {
        self.live.get(index as usize).copied().unwrap_or(false)
    }

    pub fn stats(&self) -> DescriptorHeapStats {
        DescriptorHeapStats {
            kind: self.kind,
            capacity: self.capacity,
            live: self.live_count,
            pending: self.pending.len() as u32,
            free: self.free_list.len() as u32,
            never_used: self.capacity - self.next_unused,
        }
    }
}

/// 描述符管理器
///
/// 持有四个堆的分配器，按堆类型分派。
pub struct DescriptorManager {
    allocators: [DescriptorAllocator; 4],
}

impl DescriptorManager {
    /// `layouts` 与 `capacities` 按 [`DescriptorHeapKind::ALL`] 的顺序给出
    pub fn new(capacities: [u32; 4], layouts: [DescriptorHeapLayout; 4]) -> Self {
        let allocators = DescriptorHeapKind::ALL
            .map(|kind| DescriptorAllocator::new(kind, capacities[kind.index()], layouts[kind.index()]));
        Self { allocators }
    }

    pub fn allocator(&self, kind: DescriptorHeapKind) -> &DescriptorAllocator {
        &self.allocators[kind.index()]
    }

    pub fn allocate(&mut self, kind: DescriptorHeapKind) -> Result<DescriptorSlot> {
        self.allocators[kind.index()].allocate()
    }

    pub fn release(&mut self, slot: DescriptorSlot, fence_value: FenceValue) -> Result<()> {
        self.allocators[slot.heap.index()].release(slot, fence_value)
    }

    pub fn retire(&mut self, slot: DescriptorSlot) -> Result<()> {
        self.allocators[slot.heap.index()].retire(slot)
    }

    pub fn defer(&mut self, slot: DescriptorSlot, fence_value: FenceValue) {
        self.allocators[slot.heap.index()].defer(slot, fence_value)
    }

    /// 帧边界调用，回收所有堆中已完成的槽位
    pub fn reclaim_completed(&mut self, completed: FenceValue) -> usize {
        self.allocators
            .iter_mut()
            .map(|a| a.reclaim_completed(completed))
            .sum()
    }

    pub fn stats(&self, kind: DescriptorHeapKind) -> DescriptorHeapStats {
        self.allocator(kind).stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn layout(shader_visible: bool) -> DescriptorHeapLayout {
        DescriptorHeapLayout {
            cpu_start: CpuDescriptorHandle::new(0x1000),
            gpu_start: shader_visible.then(|| GpuDescriptorHandle::new(0x8000_0000)),
            increment_size: 32,
        }
    }

    #[test]
    fn test_slot_handles_follow_increment() {
        let mut allocator = DescriptorAllocator::new(DescriptorHeapKind::Resources, 8, layout(true));
        let first = allocator.allocate().unwrap();
        let second = allocator.allocate().unwrap();

        assert_eq!(first.bindless_index, 0);
        assert_eq!(second.cpu.ptr, 0x1000 + 32);
        assert_eq!(second.gpu.unwrap().ptr, 0x8000_0000 + 32);

        let mut rtv = DescriptorAllocator::new(DescriptorHeapKind::Rtv, 2, layout(false));
        assert!(rtv.allocate().unwrap().gpu.is_none());
    }

    #[test]
    fn test_indices_unique_and_in_range() {
        let capacity = 64;
        let mut allocator = DescriptorAllocator::new(DescriptorHeapKind::Resources, capacity, layout(true));
        let mut seen = HashSet::new();

        for _ in 0..capacity {
            let slot = allocator.allocate().unwrap();
            assert!(slot.bindless_index < capacity);
            assert!(seen.insert(slot.bindless_index));
        }

        // 释放但未回收的槽位不能被复用
        let victim = allocator.slot(10);
        allocator.release(victim, FenceValue::new(3)).unwrap();
        assert!(allocator.allocate().is_err());
    }

    #[test]
    fn test_deferred_reclaim() {
        let mut allocator = DescriptorAllocator::new(DescriptorHeapKind::Resources, 2, layout(true));
        let a = allocator.allocate().unwrap();
        let _b = allocator.allocate().unwrap();

        allocator.release(a, FenceValue::new(5)).unwrap();
        assert_eq!(allocator.reclaim_completed(FenceValue::new(4)), 0);
        assert!(allocator.allocate().is_err());

        assert_eq!(allocator.reclaim_completed(FenceValue::new(5)), 1);
        let reused = allocator.allocate().unwrap();
        assert_eq!(reused, a);
    }

    #[test]
    fn test_exhaustion_is_deterministic() {
        let mut allocator = DescriptorAllocator::new(DescriptorHeapKind::Sampler, 3, layout(true));
        for _ in 0..3 {
            allocator.allocate().unwrap();
        }

        for _ in 0..2 {
            match allocator.allocate() {
                Err(PlaygroundError::Graphics(GraphicsError::DescriptorHeapExhausted { heap, capacity })) => {
                    assert_eq!(heap, "sampler");
                    assert_eq!(capacity, 3);
                }
                other => panic!("expected exhaustion, got {:?}", other.map(|s| s.bindless_index)),
            }
        }
        assert_eq!(allocator.stats().live, 3);
    }

    #[test]
    fn test_double_release_rejected() {
        let mut allocator = DescriptorAllocator::new(DescriptorHeapKind::Resources, 4, layout(true));
        let slot = allocator.allocate().unwrap();
        allocator.release(slot, FenceValue::new(1)).unwrap();
        assert!(allocator.release(slot, FenceValue::new(2)).is_err());

        let stats = allocator.stats();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.never_used, 3);
    }

    #[test]
    fn test_manager_routes_by_heap() {
        let mut manager = DescriptorManager::new(
            [16, 4, 3, 1],
            [layout(true), layout(true), layout(false), layout(false)],
        );

        let dsv = manager.allocate(DescriptorHeapKind::Dsv).unwrap();
        assert!(manager.allocate(DescriptorHeapKind::Dsv).is_err());
        assert_eq!(manager.stats(DescriptorHeapKind::Resources).live, 0);

        manager.release(dsv, FenceValue::new(1)).unwrap();
        assert_eq!(manager.reclaim_completed(FenceValue::new(1)), 1);
        assert_eq!(manager.allocate(DescriptorHeapKind::Dsv).unwrap(), dsv);
        assert_eq!(DescriptorType::UnorderedAccessView.heap_kind(), DescriptorHeapKind::Resources);
    }
}
