//! 平台无关类型到 D3D12 枚举的转换

use windows::Win32::Graphics::Direct3D::*;
use windows::Win32::Graphics::Direct3D12::*;
use windows::Win32::Graphics::Dxgi::Common::*;

use crate::renderer::command::QueueType;
use crate::renderer::descriptor::DescriptorHeapKind;
use crate::renderer::pipeline::PrimitiveTopology;
use crate::renderer::resource::{HeapType, ResourceFlags, ResourceState, TextureFormat};

pub fn dxgi_format(format: TextureFormat) -> DXGI_FORMAT {
    match format {
        TextureFormat::Rgba8Unorm => DXGI_FORMAT_R8G8B8A8_UNORM,
        TextureFormat::Bgra8Unorm => DXGI_FORMAT_B8G8R8A8_UNORM,
        TextureFormat::Rgba16Float => DXGI_FORMAT_R16G16B16A16_FLOAT,
        TextureFormat::Rgba32Float => DXGI_FORMAT_R32G32B32A32_FLOAT,
        TextureFormat::R32Float => DXGI_FORMAT_R32_FLOAT,
        TextureFormat::R32Uint => DXGI_FORMAT_R32_UINT,
        TextureFormat::Depth32Float => DXGI_FORMAT_D32_FLOAT,
    }
}

/// `Common` 与 `Present` 在 D3D12 中是同一个值
pub fn resource_state(state: ResourceState) -> D3D12_RESOURCE_STATES {
    match state {
        ResourceState::Common => D3D12_RESOURCE_STATE_COMMON,
        ResourceState::Present => D3D12_RESOURCE_STATE_PRESENT,
        ResourceState::VertexAndConstantBuffer => D3D12_RESOURCE_STATE_VERTEX_AND_CONSTANT_BUFFER,
        ResourceState::IndexBuffer => D3D12_RESOURCE_STATE_INDEX_BUFFER,
        ResourceState::RenderTarget => D3D12_RESOURCE_STATE_RENDER_TARGET,
        ResourceState::UnorderedAccess => D3D12_RESOURCE_STATE_UNORDERED_ACCESS,
        ResourceState::DepthWrite => D3D12_RESOURCE_STATE_DEPTH_WRITE,
        ResourceState::DepthRead => D3D12_RESOURCE_STATE_DEPTH_READ,
        ResourceState::NonPixelShaderResource => D3D12_RESOURCE_STATE_NON_PIXEL_SHADER_RESOURCE,
        ResourceState::PixelShaderResource => D3D12_RESOURCE_STATE_PIXEL_SHADER_RESOURCE,
        ResourceState::IndirectArgument => D3D12_RESOURCE_STATE_INDIRECT_ARGUMENT,
        ResourceState::CopyDest => D3D12_RESOURCE_STATE_COPY_DEST,
        ResourceState::CopySource => D3D12_RESOURCE_STATE_COPY_SOURCE,
        ResourceState::GenericRead => D3D12_RESOURCE_STATE_GENERIC_READ,
    }
}

pub fn heap_type(heap: HeapType) -> D3D12_HEAP_TYPE {
    match heap {
        HeapType::Default => D3D12_HEAP_TYPE_DEFAULT,
        HeapType::Upload => D3D12_HEAP_TYPE_UPLOAD,
        HeapType::Readback => D3D12_HEAP_TYPE_READBACK,
    }
}

pub fn resource_flags(flags: ResourceFlags) -> D3D12_RESOURCE_FLAGS {
    let mut out = D3D12_RESOURCE_FLAG_NONE;
    if flags.contains(ResourceFlags::ALLOW_RENDER_TARGET) {
        out |= D3D12_RESOURCE_FLAG_ALLOW_RENDER_TARGET;
    }
    if flags.contains(ResourceFlags::ALLOW_DEPTH_STENCIL) {
        out |= D3D12_RESOURCE_FLAG_ALLOW_DEPTH_STENCIL;
    }
    if flags.contains(ResourceFlags::ALLOW_UNORDERED_ACCESS) {
        out |= D3D12_RESOURCE_FLAG_ALLOW_UNORDERED_ACCESS;
    }
    if flags.contains(ResourceFlags::DENY_SHADER_RESOURCE) {
        out |= D3D12_RESOURCE_FLAG_DENY_SHADER_RESOURCE;
    }
    out
}

pub fn command_list_type(queue: QueueType) -> D3D12_COMMAND_LIST_TYPE {
    match queue {
        QueueType::Graphics => D3D12_COMMAND_LIST_TYPE_DIRECT,
        QueueType::Compute => D3D12_COMMAND_LIST_TYPE_COMPUTE,
        QueueType::Copy => D3D12_COMMAND_LIST_TYPE_COPY,
    }
}

pub fn descriptor_heap_type(kind: DescriptorHeapKind) -> D3D12_DESCRIPTOR_HEAP_TYPE {
    match kind {
        DescriptorHeapKind::Resources => D3D12_DESCRIPTOR_HEAP_TYPE_CBV_SRV_UAV,
        DescriptorHeapKind::Sampler => D3D12_DESCRIPTOR_HEAP_TYPE_SAMPLER,
        DescriptorHeapKind::Rtv => D3D12_DESCRIPTOR_HEAP_TYPE_RTV,
        DescriptorHeapKind::Dsv => D3D12_DESCRIPTOR_HEAP_TYPE_DSV,
    }
}

pub fn heap_index(kind: DescriptorHeapKind) -> usize {
    match kind {
        DescriptorHeapKind::Resources => 0,
        DescriptorHeapKind::Sampler => 1,
        DescriptorHeapKind::Rtv => 2,
        DescriptorHeapKind::Dsv => 3,
    }
}

pub fn topology_type(topology: PrimitiveTopology) -> D3D12_PRIMITIVE_TOPOLOGY_TYPE {
    match topology {
        PrimitiveTopology::PointList => D3D12_PRIMITIVE_TOPOLOGY_TYPE_POINT,
        PrimitiveTopology::LineList => D3D12_PRIMITIVE_TOPOLOGY_TYPE_LINE,
        PrimitiveTopology::TriangleList | PrimitiveTopology::TriangleStrip => D3D12_PRIMITIVE_TOPOLOGY_TYPE_TRIANGLE,
    }
}

pub fn topology(topology: PrimitiveTopology) -> D3D_PRIMITIVE_TOPOLOGY {
    match topology {
        PrimitiveTopology::PointList => D3D_PRIMITIVE_TOPOLOGY_POINTLIST,
        PrimitiveTopology::LineList => D3D_PRIMITIVE_TOPOLOGY_LINELIST,
        PrimitiveTopology::TriangleList => D3D_PRIMITIVE_TOPOLOGY_TRIANGLELIST,
        PrimitiveTopology::TriangleStrip => D3D_PRIMITIVE_TOPOLOGY_TRIANGLESTRIP,
    }
}
