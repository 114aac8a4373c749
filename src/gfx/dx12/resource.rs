//! 提交资源的创建与映射

use std::ffi::c_void;
use std::ptr;

use windows::core::PCWSTR;
use windows::Win32::Graphics::Direct3D12::*;
use windows::Win32::Graphics::Dxgi::Common::*;

use crate::core::error::{GraphicsError, Result};
use crate::renderer::resource::{HeapType, ResourceDimension, ResourceInfo};

use super::check::{check, wide};
use super::convert::{dxgi_format, heap_type, resource_flags, resource_state};

pub fn resource_desc(info: &ResourceInfo) -> D3D12_RESOURCE_DESC {
    match info.dimension {
        ResourceDimension::Buffer { size_in_bytes } => D3D12_RESOURCE_DESC {
            Dimension: D3D12_RESOURCE_DIMENSION_BUFFER,
            Alignment: 0,
            Width: size_in_bytes,
            Height: 1,
            DepthOrArraySize: 1,
            MipLevels: 1,
            Format: DXGI_FORMAT_UNKNOWN,
            SampleDesc: DXGI_SAMPLE_DESC { Count: 1, Quality: 0 },
            Layout: D3D12_TEXTURE_LAYOUT_ROW_MAJOR,
            Flags: resource_flags(info.flags),
        },
        ResourceDimension::Texture2D { width, height, format } => D3D12_RESOURCE_DESC {
            Dimension: D3D12_RESOURCE_DIMENSION_TEXTURE2D,
            Alignment: 0,
            Width: width as u64,
            Height: height,
            DepthOrArraySize: 1,
            MipLevels: 1,
            Format: dxgi_format(format),
            SampleDesc: DXGI_SAMPLE_DESC { Count: 1, Quality: 0 },
            Layout: D3D12_TEXTURE_LAYOUT_UNKNOWN,
            Flags: resource_flags(info.flags),
        },
    }
}

/// 在隐式堆上创建资源并设置调试名
pub fn create_committed(device: &ID3D12Device, info: &ResourceInfo, name: &str) -> Result<ID3D12Resource> {
    let heap_props = D3D12_HEAP_PROPERTIES {
        Type: heap_type(info.heap_type),
        CreationNodeMask: 1,
        VisibleNodeMask: 1,
        ..Default::default()
    };
    let desc = resource_desc(info);

    let mut resource: Option<ID3D12Resource> = None;
    unsafe {
        check(
            "CreateCommittedResource",
            device.CreateCommittedResource(
                &heap_props,
                D3D12_HEAP_FLAG_NONE,
                &desc,
                resource_state(info.initial_state),
                None,
                &mut resource,
            ),
        )?;
    }
    let resource = resource
        .ok_or_else(|| GraphicsError::ResourceCreation(format!("CreateCommittedResource returned nothing for '{}'", name)))?;

    set_name(&resource, name);
    Ok(resource)
}

pub fn set_name(object: &ID3D12Object, name: &str) {
    let name = wide(name);
    unsafe {
        let _ = object.SetName(PCWSTR(name.as_ptr()));
    }
}

/// 映射 CPU 可见的缓冲，对映射区域执行 `f`
pub fn with_mapped<R>(
    resource: &ID3D12Resource,
    heap: HeapType,
    f: impl FnOnce(*mut u8) -> R,
) -> Result<R> {
    // upload 堆不会被 CPU 读取，readback 堆读取整个范围
    let read_range = D3D12_RANGE { Begin: 0, End: 0 };
    let read_range = match heap {
        HeapType::Upload => Some(&read_range as *const D3D12_RANGE),
        _ => None,
    };

    let mut data: *mut c_void = ptr::null_mut();
    unsafe {
        check("Map", resource.Map(0, read_range, Some(&mut data)))?;
    }
    let result = f(data as *mut u8);
    unsafe {
        resource.Unmap(0, None);
    }
    Ok(result)
}
