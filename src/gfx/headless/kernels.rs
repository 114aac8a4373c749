//! CPU 端的着色器内核
//!
//! 软件设备不执行字节码，而是按程序名查找注册的内核闭包。内置内核与
//! `shaders/` 下的 HLSL 行为一致，测试也可以注册自己的内核。
//!
//! 内核只能通过描述符访问资源，和着色器中的 `ResourceDescriptorHeap[i]` 一样：
//! 视图必须存在、类型正确，且资源在执行时处于 unordered-access 状态才能写入。

use std::collections::HashMap;
use std::sync::Arc;

use crate::gfx::backend::ViewDimension;
use crate::renderer::descriptor::{DescriptorHeapKind, DescriptorType};
use crate::renderer::resource::{ResourceDimension, ResourceState};

use super::device::{read_u32, write_u32, ResourceRecord, ViewRecord};

/// `ResolutionFill` 的线程组大小
pub const RESOLUTION_FILL_GROUP_SIZE: u32 = 8;

pub type Kernel = Arc<dyn Fn(&mut KernelContext<'_>) + Send + Sync>;

/// 按程序名索引的内核表
#[derive(Clone, Default)]
pub struct KernelRegistry {
    kernels: HashMap<String, Kernel>,
}

impl KernelRegistry {
    /// 包含内置内核的注册表
    pub fn with_builtins() -> Self {
        let mut registry = Self::default();
        registry.register("ResolutionFill", resolution_fill);
        registry.register("BroadcastGraph", broadcast_graph);
        registry
    }

    pub fn register<F>(&mut self, program: impl Into<String>, kernel: F)
    where
        F: Fn(&mut KernelContext<'_>) + Send + Sync + 'static,
    {
        self.kernels.insert(program.into(), Arc::new(kernel));
    }

    pub fn get(&self, program: &str) -> Option<Kernel> {
        self.kernels.get(program).cloned()
    }
}

/// 内核执行时可见的状态
pub struct KernelContext<'a> {
    pub(super) resources: &'a mut HashMap<u64, ResourceRecord>,
    pub(super) views: &'a HashMap<(DescriptorHeapKind, u32), ViewRecord>,
    pub(super) root_constants: &'a [u32],
    pub(super) groups: [u32; 3],
    pub(super) records: &'a [u8],
    pub(super) num_records: u32,
    pub(super) record_stride: u32,
    pub(super) errors: Vec<String>,
}

impl KernelContext<'_> {
    /// 未设置的根常量读作 0
    pub fn root_constant(&self, index: usize) -> u32 {
        self.root_constants.get(index).copied().unwrap_or(0)
    }

    pub fn group_count(&self) -> [u32; 3] {
        self.groups
    }

    pub fn num_records(&self) -> u32 {
        self.num_records
    }

    /// 第 `index` 条工作图输入记录
    pub fn record(&self, index: u32) -> &[u8] {
        let stride = self.record_stride as usize;
        let start = index as usize * stride;
        self.records.get(start..start + stride).unwrap_or(&[])
    }

    pub fn record_u32(&self, index: u32, field: usize) -> u32 {
        read_u32(self.record(index), field * 4)
    }

    /// 写 `RWTexture2D<uint>` 的一个纹素
    pub fn write_texel_u32(&mut self, bindless: u32, x: u32, y: u32, value: u32) {
        let Some(record) = self.writable(bindless, ViewShape::Texture, "texture store") else {
            return;
        };

        let ResourceDimension::Texture2D { width, height, format } = record.info.dimension else {
            return;
        };
        if x >= width || y >= height {
            return;
        }

        let offset = (y as usize * width as usize + x as usize) * format.bytes_per_pixel() as usize;
        write_u32(&mut record.data, offset, value);
    }

    /// 读 `ByteAddressBuffer` / `StructuredBuffer<uint>` 的一个元素
    pub fn read_u32(&mut self, bindless: u32, element: u32) -> u32 {
        let Some(view) = self.view(bindless, "buffer load") else {
            return 0;
        };
        let Some(record) = self.resources.get(&view.resource) else {
            return 0;
        };
        read_u32(&record.data, element_offset(&view, element))
    }

    /// `InterlockedAdd`，返回原值
    pub fn atomic_add_u32(&mut self, bindless: u32, element: u32, value: u32) -> u32 {
        let Some(view) = self.view(bindless, "atomic add") else {
            return 0;
        };
        let offset = element_offset(&view, element);
        let Some(record) = self.writable(bindless, ViewShape::Buffer, "atomic add") else {
            return 0;
        };

        let original = read_u32(&record.data, offset);
        if !write_u32(&mut record.data, offset, original.wrapping_add(value)) {
            let message = format!("atomic add out of bounds at element {}", element);
            self.errors.push(message);
        }
        original
    }

    fn view(&mut self, bindless: u32, operation: &str) -> Option<ViewRecord> {
        let view = self.views.get(&(DescriptorHeapKind::Resources, bindless)).copied();
        if view.is_none() {
            self.errors
                .push(format!("{}: descriptor {} holds no view", operation, bindless));
        }
        view
    }

    /// UAV 写入前的检查
    fn writable(&mut self, bindless: u32, expected: ViewShape, operation: &str) -> Option<&mut ResourceRecord> {
        let view = self.view(bindless, operation)?;

        if view.view.kind != DescriptorType::UnorderedAccessView || ViewShape::of(&view.view.dimension) != expected {
            self.errors.push(format!(
                "{}: descriptor {} is a {} view of the wrong dimension",
                operation,
                bindless,
                view.view.kind.name()
            ));
            return None;
        }

        let (state, destroyed, name) = match self.resources.get(&view.resource) {
            Some(r) => (r.gpu_state, r.destroyed, r.name.clone()),
            None => return None,
        };
        if destroyed {
            self.errors
                .push(format!("{}: resource '{}' used after destruction", operation, name));
            return None;
        }
        if state != ResourceState::UnorderedAccess {
            self.errors.push(format!(
                "{}: resource '{}' is in {} on the GPU, expected unordered-access",
                operation, name, state
            ));
            return None;
        }

        self.resources.get_mut(&view.resource)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ViewShape {
    Texture,
    Buffer,
}

impl ViewShape {
    fn of(dimension: &ViewDimension) -> Self {
        match dimension {
            ViewDimension::Texture2D { .. } => ViewShape::Texture,
            _ => ViewShape::Buffer,
        }
    }
}

fn element_offset(view: &ViewRecord, element: u32) -> usize {
    match view.view.dimension {
        ViewDimension::Buffer {
            first_element, stride, ..
        } => {
            let stride = if stride == 0 { 4 } else { stride as u64 };
            ((first_element + element as u64) * stride) as usize
        }
        _ => element as usize * 4,
    }
}

/// 每个像素写入 `resolution.x * (y + 1) + x`，因此 (0, 0) 等于分辨率宽度
///
/// 根常量：`[uav, width, height]`
fn resolution_fill(ctx: &mut KernelContext<'_>) {
    let uav = ctx.root_constant(0);
    let (width, height) = (ctx.root_constant(1), ctx.root_constant(2));
    let [gx, gy, _] = ctx.group_count();

    for y in 0..(gy * RESOLUTION_FILL_GROUP_SIZE).min(height) {
        for x in 0..(gx * RESOLUTION_FILL_GROUP_SIZE).min(width) {
            ctx.write_texel_u32(uav, x, y, width * (y + 1) + x);
        }
    }
}

/// 广播节点：每条记录让 `counter[0]` 加 1，`counter[1]` 加上记录中的增量
///
/// 根常量：`[counter uav]`；记录：`{ uint increment; }`
fn broadcast_graph(ctx: &mut KernelContext<'_>) {
    let counter = ctx.root_constant(0);
    for index in 0..ctx.num_records() {
        let increment = ctx.record_u32(index, 0);
        ctx.atomic_add_u32(counter, 0, 1);
        ctx.atomic_add_u32(counter, 1, increment);
    }
}
