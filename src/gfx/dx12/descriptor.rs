//! DirectX 12 描述符堆
//!
//! 封装 `ID3D12DescriptorHeap`，向上只报告布局（起始句柄与增量），
//! 槽位分配由 [`DescriptorManager`](crate::renderer::descriptor::DescriptorManager) 负责。

use tracing::debug;
use windows::Win32::Graphics::Direct3D12::*;

use crate::core::error::Result;
use crate::renderer::descriptor::{CpuDescriptorHandle, DescriptorHeapDescriptor, DescriptorHeapLayout, GpuDescriptorHandle};

use super::check::check;
use super::convert::descriptor_heap_type;
use super::resource::set_name;

/// DX12 描述符堆
pub struct Dx12DescriptorHeap {
    heap: ID3D12DescriptorHeap,
    layout: DescriptorHeapLayout,
}

impl Dx12DescriptorHeap {
    pub fn new(device: &ID3D12Device, desc: &DescriptorHeapDescriptor) -> Result<Self> {
        let heap_type = descriptor_heap_type(desc.kind);
        let flags = if desc.shader_visible {
            D3D12_DESCRIPTOR_HEAP_FLAG_SHADER_VISIBLE
        } else {
            D3D12_DESCRIPTOR_HEAP_FLAG_NONE
        };

        let heap_desc = D3D12_DESCRIPTOR_HEAP_DESC {
            Type: heap_type,
            NumDescriptors: desc.num_descriptors,
            Flags: flags,
            NodeMask: 0,
        };

        unsafe {
            let heap: ID3D12DescriptorHeap = check("CreateDescriptorHeap", device.CreateDescriptorHeap(&heap_desc))?;
            set_name(&heap, &desc.name);

            let increment_size = device.GetDescriptorHandleIncrementSize(heap_type);
            let cpu_start = CpuDescriptorHandle::new(heap.GetCPUDescriptorHandleForHeapStart().ptr);
            // 非着色器可见的堆调用 GetGPUDescriptorHandleForHeapStart 会触发验证错误
            let gpu_start = desc
                .shader_visible
                .then(|| GpuDescriptorHandle::new(heap.GetGPUDescriptorHandleForHeapStart().ptr));

            debug!(heap = %desc.name, increment_size, "D3D12 descriptor heap created");
            Ok(Self {
                heap,
                layout: DescriptorHeapLayout {
                    cpu_start,
                    gpu_start,
                    increment_size,
                },
            })
        }
    }

    pub fn heap(&self) -> &ID3D12DescriptorHeap {
        &self.heap
    }

    pub fn layout(&self) -> DescriptorHeapLayout {
        self.layout
    }
}

pub fn cpu_handle(handle: CpuDescriptorHandle) -> D3D12_CPU_DESCRIPTOR_HANDLE {
    D3D12_CPU_DESCRIPTOR_HANDLE { ptr: handle.ptr }
}
