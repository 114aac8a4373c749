//! 资源管理模块
//!
//! [`Resource`] 包装一次 GPU 分配（缓冲或纹理）以及它当前被记录的状态。
//! 配置（`set_resource_info`）与分配（`create_resource`）分两步进行：
//! 配置是纯 CPU 操作，分配之后资源的状态等于配置的初始状态，不记录任何屏障。
//!
//! 状态只能通过 [`DeviceContext::transition`] 改变，从而保证记录的状态与
//! GPU 在命令执行时观察到的状态一致。
//!
//! [`DeviceContext::transition`]: super::context::DeviceContext::transition

use std::fmt;
use std::ops::BitOr;

use crate::core::error::{GraphicsError, Result};
use crate::gfx::backend::GraphicsBackend;

use super::context::DeviceContext;

/// 纹理拷贝到缓冲时行距的对齐要求
pub const TEXTURE_ROW_PITCH_ALIGNMENT: u64 = 256;
/// 常量缓冲大小的对齐要求
pub const CONSTANT_BUFFER_ALIGNMENT: u64 = 256;

/// 将大小对齐到常量缓冲要求的 256 字节边界
pub fn align_constant_buffer_size(size: u64) -> u64 {
    (size + CONSTANT_BUFFER_ALIGNMENT - 1) & !(CONSTANT_BUFFER_ALIGNMENT - 1)
}

/// 堆类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeapType {
    /// GPU 本地内存
    Default,
    /// CPU 写、GPU 读
    Upload,
    /// GPU 写、CPU 读
    Readback,
}

impl HeapType {
    /// 该堆上资源必须使用的初始状态
    ///
    /// upload 堆资源只能处于 generic-read，readback 堆资源只能处于 copy-dest。
    pub fn required_initial_state(self) -> Option<ResourceState> {
        match self {
            HeapType::Default => None,
            HeapType::Upload => Some(ResourceState::GenericRead),
            HeapType::Readback => Some(ResourceState::CopyDest),
        }
    }

    pub fn is_cpu_visible(self) -> bool {
        !matches!(self, HeapType::Default)
    }
}

/// 资源用途标志
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ResourceFlags(u32);

impl ResourceFlags {
    pub const NONE: ResourceFlags = ResourceFlags(0);
    pub const ALLOW_RENDER_TARGET: ResourceFlags = ResourceFlags(0x1);
    pub const ALLOW_DEPTH_STENCIL: ResourceFlags = ResourceFlags(0x2);
    pub const ALLOW_UNORDERED_ACCESS: ResourceFlags = ResourceFlags(0x4);
    pub const DENY_SHADER_RESOURCE: ResourceFlags = ResourceFlags(0x8);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: ResourceFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ResourceFlags {
    type Output = ResourceFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        ResourceFlags(self.0 | rhs.0)
    }
}

/// 资源状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceState {
    Common,
    /// 与 `Common` 对应同一个原生状态，只在语义上区分交换链缓冲
    Present,
    VertexAndConstantBuffer,
    IndexBuffer,
    RenderTarget,
    UnorderedAccess,
    DepthWrite,
    DepthRead,
    NonPixelShaderResource,
    PixelShaderResource,
    IndirectArgument,
    CopyDest,
    CopySource,
    GenericRead,
}

impl ResourceState {
    /// 两个状态在 GPU 上是否相同
    pub fn is_equivalent(self, other: ResourceState) -> bool {
        self.canonical() == other.canonical()
    }

    fn canonical(self) -> ResourceState {
        match self {
            ResourceState::Present => ResourceState::Common,
            state => state,
        }
    }

    /// 复制队列只接受这几种状态
    pub fn is_copy_queue_compatible(self) -> bool {
        matches!(
            self.canonical(),
            ResourceState::Common | ResourceState::CopyDest | ResourceState::CopySource
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            ResourceState::Common => "common",
            ResourceState::Present => "present",
            ResourceState::VertexAndConstantBuffer => "vertex-and-constant-buffer",
            ResourceState::IndexBuffer => "index-buffer",
            ResourceState::RenderTarget => "render-target",
            ResourceState::UnorderedAccess => "unordered-access",
            ResourceState::DepthWrite => "depth-write",
            ResourceState::DepthRead => "depth-read",
            ResourceState::NonPixelShaderResource => "non-pixel-shader-resource",
            ResourceState::PixelShaderResource => "pixel-shader-resource",
            ResourceState::IndirectArgument => "indirect-argument",
            ResourceState::CopyDest => "copy-dest",
            ResourceState::CopySource => "copy-source",
            ResourceState::GenericRead => "generic-read",
        }
    }
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 纹理格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    Rgba8Unorm,
    Bgra8Unorm,
    Rgba16Float,
    Rgba32Float,
    R32Float,
    R32Uint,
    Depth32Float,
}

impl TextureFormat {
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            TextureFormat::Rgba8Unorm | TextureFormat::Bgra8Unorm => 4,
            TextureFormat::Rgba16Float => 8,
            TextureFormat::Rgba32Float => 16,
            TextureFormat::R32Float | TextureFormat::R32Uint | TextureFormat::Depth32Float => 4,
        }
    }

    pub fn is_depth(self) -> bool {
        matches!(self, TextureFormat::Depth32Float)
    }

    pub fn name(self) -> &'static str {
        match self {
            TextureFormat::Rgba8Unorm => "R8G8B8A8_UNORM",
            TextureFormat::Bgra8Unorm => "B8G8R8A8_UNORM",
            TextureFormat::Rgba16Float => "R16G16B16A16_FLOAT",
            TextureFormat::Rgba32Float => "R32G32B32A32_FLOAT",
            TextureFormat::R32Float => "R32_FLOAT",
            TextureFormat::R32Uint => "R32_UINT",
            TextureFormat::Depth32Float => "D32_FLOAT",
        }
    }
}

/// 资源维度
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceDimension {
    Buffer { size_in_bytes: u64 },
    Texture2D { width: u32, height: u32, format: TextureFormat },
}

/// 资源配置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceInfo {
    pub heap_type: HeapType,
    pub flags: ResourceFlags,
    pub dimension: ResourceDimension,
    pub initial_state: ResourceState,
}

impl ResourceInfo {
    /// 缓冲配置，初始状态为 common（upload/readback 堆使用其必需状态）
    pub fn buffer(heap_type: HeapType, flags: ResourceFlags, size_in_bytes: u64) -> Self {
        Self {
            heap_type,
            flags,
            dimension: ResourceDimension::Buffer { size_in_bytes },
            initial_state: heap_type.required_initial_state().unwrap_or(ResourceState::Common),
        }
    }

    /// 常量缓冲，大小对齐到 256 字节
    pub fn constant_buffer(heap_type: HeapType, size_in_bytes: u64) -> Self {
        Self::buffer(heap_type, ResourceFlags::NONE, align_constant_buffer_size(size_in_bytes))
    }

    pub fn texture2d(
        heap_type: HeapType,
        flags: ResourceFlags,
        width: u32,
        height: u32,
        format: TextureFormat,
    ) -> Self {
        Self {
            heap_type,
            flags,
            dimension: ResourceDimension::Texture2D { width, height, format },
            initial_state: ResourceState::Common,
        }
    }

    pub fn with_initial_state(mut self, state: ResourceState) -> Self {
        self.initial_state = state;
        self
    }

    pub fn is_buffer(&self) -> bool {
        matches!(self.dimension, ResourceDimension::Buffer { .. })
    }

    /// 缓冲大小；纹理返回其行距对齐后的回读足迹大小
    pub fn size_in_bytes(&self) -> u64 {
        match self.dimension {
            ResourceDimension::Buffer { size_in_bytes } => size_in_bytes,
            ResourceDimension::Texture2D { height, .. } => {
                self.row_pitch().unwrap_or(0) * height as u64
            }
        }
    }

    /// 纹理拷贝到缓冲时每行占用的字节数（按 256 对齐）
    pub fn row_pitch(&self) -> Option<u64> {
        match self.dimension {
            ResourceDimension::Buffer { .. } => None,
            ResourceDimension::Texture2D { width, format, .. } => {
                let tight = width as u64 * format.bytes_per_pixel() as u64;
                Some(tight.div_ceil(TEXTURE_ROW_PITCH_ALIGNMENT) * TEXTURE_ROW_PITCH_ALIGNMENT)
            }
        }
    }

    /// 检查配置是否能在设备上分配
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(GraphicsError::ResourceCreation(msg).into());

        match self.dimension {
            ResourceDimension::Buffer { size_in_bytes: 0 } => {
                return fail("buffer size must be greater than 0".to_string())
            }
            ResourceDimension::Texture2D { width, height, .. } if width == 0 || height == 0 => {
                return fail(format!("texture dimensions {}x{} are empty", width, height))
            }
            ResourceDimension::Texture2D { .. } if self.heap_type != HeapType::Default => {
                return fail("textures must live on the default heap".to_string())
            }
            _ => {}
        }

        if let Some(required) = self.heap_type.required_initial_state() {
            if self.initial_state != required {
                return fail(format!(
                    "{:?} heap resources must start in {}, not {}",
                    self.heap_type, required, self.initial_state
                ));
            }
            if self.flags.contains(ResourceFlags::ALLOW_UNORDERED_ACCESS) {
                return fail(format!("{:?} heap resources cannot allow unordered access", self.heap_type));
            }
        }

        let target_flags = ResourceFlags::ALLOW_RENDER_TARGET | ResourceFlags::ALLOW_DEPTH_STENCIL;
        if self.is_buffer() && (self.flags.bits() & target_flags.bits()) != 0 {
            return fail("buffers cannot be render or depth targets".to_string());
        }

        Ok(())
    }
}

/// 一次 GPU 分配及其记录状态
pub struct Resource<B: GraphicsBackend> {
    info: Option<ResourceInfo>,
    state: ResourceState,
    native: Option<B::Resource>,
    name: String,
}

impl<B: GraphicsBackend> Resource<B> {
    /// 未配置的空资源
    pub fn new() -> Self {
        Self {
            info: None,
            state: ResourceState::Common,
            native: None,
            name: String::new(),
        }
    }

    /// 以给定配置创建（尚未分配）
    pub fn with_info(info: ResourceInfo) -> Self {
        Self {
            info: Some(info),
            state: info.initial_state,
            ..Self::new()
        }
    }

    /// 包装一个已经存在的原生资源（例如交换链缓冲）
    pub fn from_native(native: B::Resource, info: ResourceInfo, state: ResourceState, name: impl Into<String>) -> Self {
        Self {
            info: Some(info),
            state,
            native: Some(native),
            name: name.into(),
        }
    }

    /// 配置缓冲布局，不调用设备
    pub fn set_resource_info(&mut self, heap_type: HeapType, flags: ResourceFlags, size_in_bytes: u64) -> Result<()> {
        self.configure(ResourceInfo::buffer(heap_type, flags, size_in_bytes))
    }

    /// 使用完整配置（纹理、覆盖初始状态等）
    ///
    /// 已分配的资源不能重新配置：记录的状态必须与 GPU 上的一致，先释放再配置。
    pub fn configure(&mut self, info: ResourceInfo) -> Result<()> {
        self.require_unallocated()?;
        self.state = info.initial_state;
        self.info = Some(info);
        Ok(())
    }

    fn require_unallocated(&self) -> Result<()> {
        if self.native.is_some() {
            return Err(GraphicsError::ResourceCreation(format!(
                "resource '{}' is allocated and cannot be reconfigured",
                self.name
            ))
            .into());
        }
        Ok(())
    }

    /// 在设备上分配
    ///
    /// 分配后的状态等于配置的初始状态，不记录屏障。
    pub fn create_resource(&mut self, context: &mut DeviceContext<B>, name: &str) -> Result<()> {
        let info = self.info.ok_or_else(|| {
            GraphicsError::ResourceCreation(format!("resource '{}' has no configuration", name))
        })?;

        if self.native.is_some() {
            return Err(GraphicsError::ResourceCreation(format!(
                "resource '{}' is already allocated",
                name
            ))
            .into());
        }

        let native = context.create_committed_resource(&info, name)?;
        self.native = Some(native);
        self.state = info.initial_state;
        self.name = name.to_string();
        Ok(())
    }

    pub fn info(&self) -> Option<&ResourceInfo> {
        self.info.as_ref()
    }

    /// 已配置的信息，未配置时报错
    pub fn require_info(&self) -> Result<&ResourceInfo> {
        self.info.as_ref().ok_or_else(|| {
            GraphicsError::ResourceCreation(format!("resource '{}' has no configuration", self.name)).into()
        })
    }

    pub fn state(&self) -> ResourceState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: ResourceState) {
        self.state = state;
    }

    pub fn native(&self) -> Option<&B::Resource> {
        self.native.as_ref()
    }

    /// 原生资源，未分配时报错
    pub fn require_native(&self) -> Result<&B::Resource> {
        self.native.as_ref().ok_or_else(|| {
            GraphicsError::CommandExecution(format!("resource '{}' is not allocated", self.name)).into()
        })
    }

    pub(crate) fn take_native(&mut self) -> Option<B::Resource> {
        self.native.take()
    }

    pub fn is_created(&self) -> bool {
        self.native.is_some()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size_in_bytes(&self) -> u64 {
        self.info.map(|i| i.size_in_bytes()).unwrap_or(0)
    }
}

impl<B: GraphicsBackend> Default for Resource<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: GraphicsBackend> fmt::Debug for Resource<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("info", &self.info)
            .field("created", &self.native.is_some())
            .finish()
    }
}

/// 顶点缓冲视图
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexBufferView {
    pub buffer_location: u64,
    pub size_in_bytes: u32,
    pub stride_in_bytes: u32,
}

/// 顶点缓冲
pub struct VertexBufferResource<B: GraphicsBackend> {
    resource: Resource<B>,
    stride: u32,
    count: u32,
    view: Option<VertexBufferView>,
}

impl<B: GraphicsBackend> VertexBufferResource<B> {
    pub fn new() -> Self {
        Self {
            resource: Resource::new(),
            stride: 0,
            count: 0,
            view: None,
        }
    }

    /// 配置缓冲与步长，顶点数量由 `size / stride` 得出
    pub fn set_resource_info(
        &mut self,
        heap_type: HeapType,
        flags: ResourceFlags,
        size_in_bytes: u64,
        stride: u32,
    ) -> Result<()> {
        if stride == 0 || size_in_bytes % stride as u64 != 0 {
            return Err(GraphicsError::ResourceCreation(format!(
                "vertex buffer size {} is not a multiple of stride {}",
                size_in_bytes, stride
            ))
            .into());
        }

        self.resource.set_resource_info(heap_type, flags, size_in_bytes)?;
        self.stride = stride;
        self.count = (size_in_bytes / stride as u64) as u32;
        self.view = None;
        Ok(())
    }

    pub fn create_resource(&mut self, context: &mut DeviceContext<B>, name: &str) -> Result<()> {
        self.resource.create_resource(context, name)?;
        let native = self.resource.require_native()?;
        self.view = Some(VertexBufferView {
            buffer_location: context.backend().gpu_virtual_address(native),
            size_in_bytes: self.resource.size_in_bytes() as u32,
            stride_in_bytes: self.stride,
        });
        Ok(())
    }

    pub fn stride(&self) -> u32 {
        self.stride
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn view(&self) -> Option<VertexBufferView> {
        self.view
    }

    pub fn resource(&self) -> &Resource<B> {
        &self.resource
    }

    pub fn resource_mut(&mut self) -> &mut Resource<B> {
        &mut self.resource
    }
}

impl<B: GraphicsBackend> Default for VertexBufferResource<B> {
    fn default() -> Self {
        Self::new()
    }
}

/// 二维纹理
pub struct TextureResource<B: GraphicsBackend> {
    resource: Resource<B>,
    width: u32,
    height: u32,
    format: TextureFormat,
}

impl<B: GraphicsBackend> TextureResource<B> {
    pub fn new() -> Self {
        Self {
            resource: Resource::new(),
            width: 0,
            height: 0,
            format: TextureFormat::Rgba8Unorm,
        }
    }

    pub fn set_resource_info(
        &mut self,
        heap_type: HeapType,
        flags: ResourceFlags,
        width: u32,
        height: u32,
        format: TextureFormat,
    ) -> Result<()> {
        self.configure(ResourceInfo::texture2d(heap_type, flags, width, height, format))
    }

    /// 使用完整配置（例如覆盖初始状态）
    pub fn configure(&mut self, info: ResourceInfo) -> Result<()> {
        self.resource.configure(info)?;
        if let ResourceDimension::Texture2D { width, height, format } = info.dimension {
            self.width = width;
            self.height = height;
            self.format = format;
        }
        Ok(())
    }

    pub fn create_resource(&mut self, context: &mut DeviceContext<B>, name: &str) -> Result<()> {
        self.resource.create_resource(context, name)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> TextureFormat {
        self.format
    }

    pub fn resource(&self) -> &Resource<B> {
        &self.resource
    }

    pub fn resource_mut(&mut self) -> &mut Resource<B> {
        &mut self.resource
    }
}

impl<B: GraphicsBackend> Default for TextureResource<B> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_buffer_alignment() {
        assert_eq!(align_constant_buffer_size(100), 256);
        assert_eq!(align_constant_buffer_size(256), 256);
        assert_eq!(align_constant_buffer_size(300), 512);
        assert_eq!(ResourceInfo::constant_buffer(HeapType::Upload, 12).size_in_bytes(), 256);
    }

    #[test]
    fn test_initial_state_follows_heap() {
        let default = ResourceInfo::buffer(HeapType::Default, ResourceFlags::NONE, 64);
        assert_eq!(default.initial_state, ResourceState::Common);

        let upload = ResourceInfo::buffer(HeapType::Upload, ResourceFlags::NONE, 64);
        assert_eq!(upload.initial_state, ResourceState::GenericRead);

        let readback = ResourceInfo::buffer(HeapType::Readback, ResourceFlags::NONE, 64);
        assert_eq!(readback.initial_state, ResourceState::CopyDest);

        assert!(default.validate().is_ok());
        assert!(readback.with_initial_state(ResourceState::Common).validate().is_err());
    }

    #[test]
    fn test_validation_rules() {
        let uav_readback = ResourceInfo::buffer(HeapType::Readback, ResourceFlags::ALLOW_UNORDERED_ACCESS, 64);
        assert!(uav_readback.validate().is_err());

        let empty = ResourceInfo::buffer(HeapType::Default, ResourceFlags::NONE, 0);
        assert!(empty.validate().is_err());

        let rt_buffer = ResourceInfo::buffer(HeapType::Default, ResourceFlags::ALLOW_RENDER_TARGET, 64);
        assert!(rt_buffer.validate().is_err());

        let upload_texture = ResourceInfo::texture2d(HeapType::Upload, ResourceFlags::NONE, 4, 4, TextureFormat::R32Float);
        assert!(upload_texture.validate().is_err());
    }

    #[test]
    fn test_texture_row_pitch() {
        let info = ResourceInfo::texture2d(
            HeapType::Default,
            ResourceFlags::ALLOW_UNORDERED_ACCESS,
            100,
            3,
            TextureFormat::R32Uint,
        );
        assert_eq!(info.row_pitch(), Some(512));
        assert_eq!(info.size_in_bytes(), 1536);
    }

    #[test]
    fn test_present_is_common_on_gpu() {
        assert!(ResourceState::Present.is_equivalent(ResourceState::Common));
        assert!(!ResourceState::Present.is_equivalent(ResourceState::RenderTarget));
        assert!(ResourceState::CopySource.is_copy_queue_compatible());
        assert!(!ResourceState::UnorderedAccess.is_copy_queue_compatible());
    }

    #[test]
    fn test_flags() {
        let flags = ResourceFlags::ALLOW_UNORDERED_ACCESS | ResourceFlags::ALLOW_RENDER_TARGET;
        assert!(flags.contains(ResourceFlags::ALLOW_UNORDERED_ACCESS));
        assert!(!flags.contains(ResourceFlags::ALLOW_DEPTH_STENCIL));
        assert!(flags.contains(ResourceFlags::NONE));
    }
}
