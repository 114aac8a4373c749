//! DirectX 12 设备后端
//!
//! 持有设备、三个命令队列、每个帧槽位一组命令分配器、共享 fence 与四个
//! 描述符堆。所有策略（状态跟踪、fence 值分配、描述符槽位）都在
//! [`DeviceContext`](crate::renderer::context::DeviceContext) 中，这里只把
//! 调用翻译成 D3D12 API。
//!
//! # 初始化流程
//!
//! 1. 启用调试层（可选 GPU 端验证）
//! 2. 创建 DXGI 工厂，按高性能优先枚举适配器，跳过软件适配器
//! 3. 在第一个支持 11_0 的适配器上创建设备，挂接信息队列
//! 4. 为图形、计算、复制各建一个队列、一组分配器和一个命令列表
//! 5. 创建共享 fence、等待事件与设备移除事件
//! 6. 创建 `ExecuteIndirect` 使用的绘制命令签名

use std::ffi::c_void;
use std::mem::ManuallyDrop;

use tracing::{debug, error, info, warn};
use windows::core::Interface;
use windows::Win32::Foundation::{CloseHandle, HANDLE, S_OK, WAIT_FAILED, WAIT_OBJECT_0};
use windows::Win32::Graphics::Direct3D::*;
use windows::Win32::Graphics::Direct3D12::*;
use windows::Win32::Graphics::Dxgi::*;
use windows::Win32::System::Threading::{CreateEventW, WaitForMultipleObjects, INFINITE};

use crate::core::config::DebugConfig;
use crate::core::error::{GraphicsError, PlaygroundError, Result};
use crate::gfx::backend::{GpuCommand, GraphicsBackend, ViewDesc, ViewDimension};
use crate::renderer::capability::{DeviceCapabilities, FormatSupport};
use crate::renderer::command::QueueType;
use crate::renderer::context::DRAW_ARGUMENTS_SIZE;
use crate::renderer::descriptor::{DescriptorHeapDescriptor, DescriptorHeapKind, DescriptorHeapLayout, DescriptorSlot, DescriptorType};
use crate::renderer::pipeline::{PipelinePath, ProgramDesc};
use crate::renderer::resource::{HeapType, ResourceInfo, TextureFormat};
use crate::renderer::sync::FenceValue;

use super::check::{api_error, check, removed_reason};
use super::convert::{command_list_type, dxgi_format, heap_index, resource_state};
use super::debug::{enable_debug_layer, InfoQueue};
use super::descriptor::{cpu_handle, Dx12DescriptorHeap};
use super::program::{build_program, Dx12Program, ProgramObject};
use super::query::{adapter_name, format_support, query_capabilities};
use super::resource::{create_committed, set_name, with_mapped};

/// 对三个队列各执行一次 `f`
fn per_queue<T>(mut f: impl FnMut(QueueType) -> Result<T>) -> Result<[T; 3]> {
    let [graphics, compute, copy] = QueueType::ALL;
    Ok([f(graphics)?, f(compute)?, f(copy)?])
}

/// DirectX 12 设备后端
pub struct Dx12Backend {
    factory: IDXGIFactory6,
    adapter: IDXGIAdapter1,
    device: ID3D12Device,
    info_queue: Option<InfoQueue>,
    queues: [ID3D12CommandQueue; 3],
    allocators: [Vec<ID3D12CommandAllocator>; 3],
    lists: [ID3D12GraphicsCommandList; 3],
    fence: ID3D12Fence,
    fence_event: HANDLE,
    /// 设备移除时 fence 变为 `u64::MAX`，该事件随之触发
    removed_event: HANDLE,
    heaps: [Option<Dx12DescriptorHeap>; 4],
    draw_signature: ID3D12CommandSignature,
    bound: [Option<Dx12Program>; 3],
    validation_layer: bool,
}

impl Dx12Backend {
    /// 创建设备与队列，`frame_count` 决定每个队列的分配器数量
    pub fn new(debug: &DebugConfig, frame_count: usize) -> Result<Self> {
        if debug.validation_layer {
            enable_debug_layer(debug)?;
        }

        unsafe {
            let factory_flags = if debug.validation_layer {
                DXGI_CREATE_FACTORY_DEBUG
            } else {
                DXGI_CREATE_FACTORY_FLAGS(0)
            };
            let factory: IDXGIFactory6 = check("CreateDXGIFactory2", CreateDXGIFactory2(factory_flags))?;
            let (adapter, device) = select_adapter(&factory)?;

            let info_queue = if debug.validation_layer {
                InfoQueue::attach(&device, debug)
            } else {
                None
            };

            let queues = per_queue(|queue| {
                let desc = D3D12_COMMAND_QUEUE_DESC {
                    Type: command_list_type(queue),
                    Priority: 0,
                    Flags: D3D12_COMMAND_QUEUE_FLAG_NONE,
                    NodeMask: 0,
                };
                let command_queue: ID3D12CommandQueue = check("CreateCommandQueue", device.CreateCommandQueue(&desc))?;
                set_name(&command_queue, &format!("{} Queue", queue.name()));
                Ok(command_queue)
            })?;

            let allocators = per_queue(|queue| {
                (0..frame_count.max(1))
                    .map(|index| {
                        let allocator: ID3D12CommandAllocator = check(
                            "CreateCommandAllocator",
                            device.CreateCommandAllocator(command_list_type(queue)),
                        )?;
                        set_name(&allocator, &format!("{} Allocator {}", queue.name(), index));
                        Ok(allocator)
                    })
                    .collect::<Result<Vec<_>>>()
            })?;

            // 命令列表创建后立即关闭，与上下文中"已关闭"的初始状态一致
            let lists = per_queue(|queue| {
                let list: ID3D12GraphicsCommandList = check(
                    "CreateCommandList",
                    device.CreateCommandList(0, command_list_type(queue), &allocators[queue.index()][0], None),
                )?;
                check("ID3D12GraphicsCommandList::Close", list.Close())?;
                set_name(&list, &format!("{} Command List", queue.name()));
                Ok(list)
            })?;

            let fence: ID3D12Fence = check("CreateFence", device.CreateFence(0, D3D12_FENCE_FLAG_NONE))?;
            set_name(&fence, "Shared Fence");
            let fence_event = check("CreateEventW", CreateEventW(None, false, false, None))?;
            let removed_event = check("CreateEventW", CreateEventW(None, false, false, None))?;
            check(
                "SetEventOnCompletion",
                fence.SetEventOnCompletion(u64::MAX, removed_event),
            )?;

            let argument = D3D12_INDIRECT_ARGUMENT_DESC {
                Type: D3D12_INDIRECT_ARGUMENT_TYPE_DRAW,
                ..Default::default()
            };
            let signature_desc = D3D12_COMMAND_SIGNATURE_DESC {
                ByteStride: DRAW_ARGUMENTS_SIZE as u32,
                NumArgumentDescs: 1,
                pArgumentDescs: &argument,
                NodeMask: 0,
            };
            let mut draw_signature: Option<ID3D12CommandSignature> = None;
            check(
                "CreateCommandSignature",
                device.CreateCommandSignature(&signature_desc, None, &mut draw_signature),
            )?;
            let draw_signature = draw_signature
                .ok_or_else(|| PlaygroundError::Initialization("CreateCommandSignature returned nothing".to_string()))?;

            info!(frames = frame_count, validation = debug.validation_layer, "DX12 backend initialized");

            Ok(Self {
                factory,
                adapter,
                device,
                info_queue,
                queues,
                allocators,
                lists,
                fence,
                fence_event,
                removed_event,
                heaps: [None, None, None, None],
                draw_signature,
                bound: [None, None, None],
                validation_layer: debug.validation_layer,
            })
        }
    }

    pub fn device(&self) -> &ID3D12Device {
        &self.device
    }

    pub fn factory(&self) -> &IDXGIFactory6 {
        &self.factory
    }

    /// 交换链绑定在图形队列上
    pub fn graphics_queue(&self) -> &ID3D12CommandQueue {
        &self.queues[QueueType::Graphics.index()]
    }

    /// 把信息队列中的消息写入日志
    pub fn drain_debug_messages(&self) -> usize {
        self.info_queue.as_ref().map(InfoQueue::drain).unwrap_or(0)
    }

    /// 设备已被移除时返回带原因的错误
    pub fn check_device_removed(&self) -> Result<()> {
        let code = match unsafe { self.device.GetDeviceRemovedReason() } {
            Ok(()) => S_OK,
            Err(err) => err.code(),
        };
        if code == S_OK {
            return Ok(());
        }

        let reason = removed_reason(code);
        error!("Device removed: {}", reason);
        self.drain_debug_messages();
        Err(GraphicsError::DeviceRemoved(reason).into())
    }

    fn list(&self, queue: QueueType) -> &ID3D12GraphicsCommandList {
        &self.lists[queue.index()]
    }

    fn heap(&self, kind: DescriptorHeapKind) -> Option<&ID3D12DescriptorHeap> {
        self.heaps[heap_index(kind)].as_ref().map(Dx12DescriptorHeap::heap)
    }

    fn buffer_size(resource: &ID3D12Resource) -> u64 {
        unsafe { resource.GetDesc().Width }
    }

    fn check_range(resource: &ID3D12Resource, offset: u64, len: usize) -> Result<()> {
        let size = Self::buffer_size(resource);
        if offset.checked_add(len as u64).is_none_or(|end| end > size) {
            return Err(GraphicsError::CommandExecution(format!(
                "buffer access [{}, +{}) outside {} bytes",
                offset, len, size
            ))
            .into());
        }
        Ok(())
    }

    unsafe fn record_work_graph(&self, list: &ID3D12GraphicsCommandList, program: &Dx12Program) -> Result<()> {
        let ProgramObject::WorkGraph {
            root_signature,
            identifier,
            backing,
            backing_size,
            ..
        } = &*program.0
        else {
            return Ok(());
        };

        let list10: ID3D12GraphicsCommandList10 = check("QueryInterface(ID3D12GraphicsCommandList10)", list.cast())?;
        list.SetComputeRootSignature(root_signature);

        let flags = if program.take_initialize() {
            D3D12_SET_WORK_GRAPH_FLAG_INITIALIZE
        } else {
            D3D12_SET_WORK_GRAPH_FLAG_NONE
        };
        let desc = D3D12_SET_PROGRAM_DESC {
            Type: D3D12_PROGRAM_TYPE_WORK_GRAPH,
            Anonymous: D3D12_SET_PROGRAM_DESC_0 {
                WorkGraph: D3D12_SET_WORK_GRAPH_DESC {
                    ProgramIdentifier: *identifier,
                    Flags: flags,
                    BackingMemory: D3D12_GPU_VIRTUAL_ADDRESS_RANGE {
                        StartAddress: backing.as_ref().map(|b| b.GetGPUVirtualAddress()).unwrap_or(0),
                        SizeInBytes: *backing_size,
                    },
                    NodeLocalRootArgumentsTable: D3D12_GPU_VIRTUAL_ADDRESS_RANGE_AND_STRIDE::default(),
                },
            },
        };
        list10.SetProgram(&desc);
        Ok(())
    }
}

unsafe fn select_adapter(factory: &IDXGIFactory6) -> Result<(IDXGIAdapter1, ID3D12Device)> {
    let mut index = 0;
    while let Ok(adapter) = factory.EnumAdapterByGpuPreference::<IDXGIAdapter1>(index, DXGI_GPU_PREFERENCE_HIGH_PERFORMANCE) {
        index += 1;
        let desc = check("GetDesc1", adapter.GetDesc1())?;
        if (desc.Flags & DXGI_ADAPTER_FLAG_SOFTWARE.0 as u32) != 0 {
            debug!(adapter = %adapter_name(&desc), "Skipping software adapter");
            continue;
        }

        let mut device: Option<ID3D12Device> = None;
        if D3D12CreateDevice(&adapter, D3D_FEATURE_LEVEL_11_0, &mut device).is_ok() {
            if let Some(device) = device {
                info!(adapter = %adapter_name(&desc), "D3D12 device created");
                return Ok((adapter, device));
            }
        }
        warn!(adapter = %adapter_name(&desc), "Adapter does not support feature level 11_0");
    }

    Err(GraphicsError::DeviceCreation("no hardware adapter supports feature level 11_0".to_string()).into())
}

fn transition_barrier(
    resource: &ID3D12Resource,
    before: D3D12_RESOURCE_STATES,
    after: D3D12_RESOURCE_STATES,
) -> D3D12_RESOURCE_BARRIER {
    D3D12_RESOURCE_BARRIER {
        Type: D3D12_RESOURCE_BARRIER_TYPE_TRANSITION,
        Flags: D3D12_RESOURCE_BARRIER_FLAG_NONE,
        Anonymous: D3D12_RESOURCE_BARRIER_0 {
            Transition: ManuallyDrop::new(D3D12_RESOURCE_TRANSITION_BARRIER {
                pResource: ManuallyDrop::new(Some(resource.clone())),
                Subresource: D3D12_RESOURCE_BARRIER_ALL_SUBRESOURCES,
                StateBefore: before,
                StateAfter: after,
            }),
        },
    }
}

fn copy_location(resource: &ID3D12Resource, kind: D3D12_TEXTURE_COPY_TYPE, anonymous: D3D12_TEXTURE_COPY_LOCATION_0) -> D3D12_TEXTURE_COPY_LOCATION {
    D3D12_TEXTURE_COPY_LOCATION {
        pResource: ManuallyDrop::new(Some(resource.clone())),
        Type: kind,
        Anonymous: anonymous,
    }
}

impl GraphicsBackend for Dx12Backend {
    type Resource = ID3D12Resource;
    type Program = Dx12Program;

    fn backend_name(&self) -> &str {
        "DirectX 12"
    }

    fn query_capabilities(&self) -> Result<DeviceCapabilities> {
        query_capabilities(&self.device, &self.adapter)
    }

    fn format_support(&self, format: TextureFormat) -> Result<FormatSupport> {
        format_support(&self.device, format)
    }

    fn create_descriptor_heap(&mut self, desc: &DescriptorHeapDescriptor) -> Result<DescriptorHeapLayout> {
        let heap = Dx12DescriptorHeap::new(&self.device, desc)?;
        let layout = heap.layout();
        self.heaps[heap_index(desc.kind)] = Some(heap);
        Ok(layout)
    }

    fn create_view(&mut self, resource: &ID3D12Resource, view: &ViewDesc, slot: &DescriptorSlot) -> Result<()> {
        let handle = cpu_handle(slot.cpu);
        unsafe {
            match (view.kind, view.dimension) {
                (
                    DescriptorType::UnorderedAccessView,
                    ViewDimension::Buffer {
                        first_element,
                        num_elements,
                        stride,
                    },
                ) => {
                    let (format, flags) = if stride == 0 {
                        (windows::Win32::Graphics::Dxgi::Common::DXGI_FORMAT_R32_TYPELESS, D3D12_BUFFER_UAV_FLAG_RAW)
                    } else {
                        (windows::Win32::Graphics::Dxgi::Common::DXGI_FORMAT_UNKNOWN, D3D12_BUFFER_UAV_FLAG_NONE)
                    };
                    let desc = D3D12_UNORDERED_ACCESS_VIEW_DESC {
                        Format: format,
                        ViewDimension: D3D12_UAV_DIMENSION_BUFFER,
                        Anonymous: D3D12_UNORDERED_ACCESS_VIEW_DESC_0 {
                            Buffer: D3D12_BUFFER_UAV {
                                FirstElement: first_element,
                                NumElements: num_elements,
                                StructureByteStride: stride,
                                CounterOffsetInBytes: 0,
                                Flags: flags,
                            },
                        },
                    };
                    self.device.CreateUnorderedAccessView(resource, None, Some(&desc), handle);
                }
                (DescriptorType::UnorderedAccessView, ViewDimension::Texture2D { format }) => {
                    let desc = D3D12_UNORDERED_ACCESS_VIEW_DESC {
                        Format: dxgi_format(format),
                        ViewDimension: D3D12_UAV_DIMENSION_TEXTURE2D,
                        Anonymous: D3D12_UNORDERED_ACCESS_VIEW_DESC_0 {
                            Texture2D: D3D12_TEX2D_UAV { MipSlice: 0, PlaneSlice: 0 },
                        },
                    };
                    self.device.CreateUnorderedAccessView(resource, None, Some(&desc), handle);
                }
                (
                    DescriptorType::ShaderResourceView,
                    ViewDimension::Buffer {
                        first_element,
                        num_elements,
                        stride,
                    },
                ) => {
                    let (format, flags) = if stride == 0 {
                        (windows::Win32::Graphics::Dxgi::Common::DXGI_FORMAT_R32_TYPELESS, D3D12_BUFFER_SRV_FLAG_RAW)
                    } else {
                        (windows::Win32::Graphics::Dxgi::Common::DXGI_FORMAT_UNKNOWN, D3D12_BUFFER_SRV_FLAG_NONE)
                    };
                    let desc = D3D12_SHADER_RESOURCE_VIEW_DESC {
                        Format: format,
                        ViewDimension: D3D12_SRV_DIMENSION_BUFFER,
                        Shader4ComponentMapping: D3D12_DEFAULT_SHADER_4_COMPONENT_MAPPING,
                        Anonymous: D3D12_SHADER_RESOURCE_VIEW_DESC_0 {
                            Buffer: D3D12_BUFFER_SRV {
                                FirstElement: first_element,
                                NumElements: num_elements,
                                StructureByteStride: stride,
                                Flags: flags,
                            },
                        },
                    };
                    self.device.CreateShaderResourceView(resource, Some(&desc), handle);
                }
                (DescriptorType::ShaderResourceView, ViewDimension::Texture2D { format }) => {
                    let desc = D3D12_SHADER_RESOURCE_VIEW_DESC {
                        Format: dxgi_format(format),
                        ViewDimension: D3D12_SRV_DIMENSION_TEXTURE2D,
                        Shader4ComponentMapping: D3D12_DEFAULT_SHADER_4_COMPONENT_MAPPING,
                        Anonymous: D3D12_SHADER_RESOURCE_VIEW_DESC_0 {
                            Texture2D: D3D12_TEX2D_SRV {
                                MostDetailedMip: 0,
                                MipLevels: 1,
                                PlaneSlice: 0,
                                ResourceMinLODClamp: 0.0,
                            },
                        },
                    };
                    self.device.CreateShaderResourceView(resource, Some(&desc), handle);
                }
                (DescriptorType::ConstantBufferView, ViewDimension::ConstantBuffer) => {
                    let desc = D3D12_CONSTANT_BUFFER_VIEW_DESC {
                        BufferLocation: resource.GetGPUVirtualAddress(),
                        SizeInBytes: Self::buffer_size(resource) as u32,
                    };
                    self.device.CreateConstantBufferView(Some(&desc), handle);
                }
                (DescriptorType::RenderTargetView, ViewDimension::Texture2D { format }) => {
                    let desc = D3D12_RENDER_TARGET_VIEW_DESC {
                        Format: dxgi_format(format),
                        ViewDimension: D3D12_RTV_DIMENSION_TEXTURE2D,
                        Anonymous: D3D12_RENDER_TARGET_VIEW_DESC_0 {
                            Texture2D: D3D12_TEX2D_RTV { MipSlice: 0, PlaneSlice: 0 },
                        },
                    };
                    self.device.CreateRenderTargetView(resource, Some(&desc), handle);
                }
                (DescriptorType::DepthStencilView, ViewDimension::Texture2D { format }) => {
                    let desc = D3D12_DEPTH_STENCIL_VIEW_DESC {
                        Format: dxgi_format(format),
                        ViewDimension: D3D12_DSV_DIMENSION_TEXTURE2D,
                        Flags: D3D12_DSV_FLAG_NONE,
                        Anonymous: D3D12_DEPTH_STENCIL_VIEW_DESC_0 {
                            Texture2D: D3D12_TEX2D_DSV { MipSlice: 0 },
                        },
                    };
                    self.device.CreateDepthStencilView(resource, Some(&desc), handle);
                }
                (kind, dimension) => {
                    return Err(GraphicsError::ResourceCreation(format!(
                        "{} cannot describe {:?}",
                        kind.name(),
                        dimension
                    ))
                    .into());
                }
            }
        }
        Ok(())
    }

    fn reset_command_list(&mut self, queue: QueueType, allocator_index: usize) -> Result<()> {
        let allocators = &self.allocators[queue.index()];
        let allocator = &allocators[allocator_index % allocators.len()];
        let list = self.list(queue);

        unsafe {
            check("ID3D12CommandAllocator::Reset", allocator.Reset())?;
            check("ID3D12GraphicsCommandList::Reset", list.Reset(allocator, None))?;

            // 复制列表不能绑定描述符堆
            if queue != QueueType::Copy {
                let heaps: Vec<Option<ID3D12DescriptorHeap>> = [DescriptorHeapKind::Resources, DescriptorHeapKind::Sampler]
                    .into_iter()
                    .filter_map(|kind| self.heap(kind).cloned().map(Some))
                    .collect();
                if !heaps.is_empty() {
                    list.SetDescriptorHeaps(&heaps);
                }
            }
        }

        self.bound[queue.index()] = None;
        Ok(())
    }

    fn close_command_list(&mut self, queue: QueueType) -> Result<()> {
        unsafe { check("ID3D12GraphicsCommandList::Close", self.list(queue).Close()) }
    }

    fn execute_command_list(&mut self, queue: QueueType) -> Result<()> {
        let list: ID3D12CommandList = check("QueryInterface(ID3D12CommandList)", self.list(queue).cast())?;
        unsafe {
            self.queues[queue.index()].ExecuteCommandLists(&[Some(list)]);
        }
        if self.validation_layer {
            self.drain_debug_messages();
        }
        Ok(())
    }

    fn record(&mut self, queue: QueueType, command: GpuCommand<'_, Self>) -> Result<()> {
        let list = self.list(queue).clone();
        unsafe {
            match command {
                GpuCommand::Barrier { resource, before, after } => {
                    let barrier = transition_barrier(resource, resource_state(before), resource_state(after));
                    list.ResourceBarrier(std::slice::from_ref(&barrier));
                    let D3D12_RESOURCE_BARRIER { Anonymous, .. } = barrier;
                    let transition = ManuallyDrop::into_inner(Anonymous.Transition);
                    drop(ManuallyDrop::into_inner(transition.pResource));
                }
                GpuCommand::CopyResource { dst, src } => list.CopyResource(dst, src),
                GpuCommand::CopyTextureToBuffer { dst, src, row_pitch } => {
                    let desc = src.GetDesc();
                    let dst_location = copy_location(
                        dst,
                        D3D12_TEXTURE_COPY_TYPE_PLACED_FOOTPRINT,
                        D3D12_TEXTURE_COPY_LOCATION_0 {
                            PlacedFootprint: D3D12_PLACED_SUBRESOURCE_FOOTPRINT {
                                Offset: 0,
                                Footprint: D3D12_SUBRESOURCE_FOOTPRINT {
                                    Format: desc.Format,
                                    Width: desc.Width as u32,
                                    Height: desc.Height,
                                    Depth: 1,
                                    RowPitch: row_pitch as u32,
                                },
                            },
                        },
                    );
                    let src_location = copy_location(
                        src,
                        D3D12_TEXTURE_COPY_TYPE_SUBRESOURCE_INDEX,
                        D3D12_TEXTURE_COPY_LOCATION_0 { SubresourceIndex: 0 },
                    );
                    list.CopyTextureRegion(&dst_location, 0, 0, 0, &src_location, None);
                    drop(ManuallyDrop::into_inner(dst_location.pResource));
                    drop(ManuallyDrop::into_inner(src_location.pResource));
                }
                GpuCommand::SetProgram(program) => {
                    match &*program.0 {
                        ProgramObject::Compute { pso, root_signature } => {
                            list.SetComputeRootSignature(root_signature);
                            list.SetPipelineState(pso);
                        }
                        ProgramObject::Graphics {
                            pso,
                            root_signature,
                            topology,
                        } => {
                            list.SetGraphicsRootSignature(root_signature);
                            list.SetPipelineState(pso);
                            list.IASetPrimitiveTopology(*topology);
                        }
                        ProgramObject::WorkGraph { .. } => self.record_work_graph(&list, program)?,
                    }
                    self.bound[queue.index()] = Some(program.clone());
                }
                GpuCommand::SetRootConstants { constants, dest_offset } => {
                    let compute = self.bound[queue.index()].as_ref().is_none_or(Dx12Program::is_compute);
                    let data = constants.as_ptr() as *const c_void;
                    if compute {
                        list.SetComputeRoot32BitConstants(0, constants.len() as u32, data, dest_offset);
                    } else {
                        list.SetGraphicsRoot32BitConstants(0, constants.len() as u32, data, dest_offset);
                    }
                }
                GpuCommand::Dispatch { x, y, z } => list.Dispatch(x, y, z),
                GpuCommand::DispatchGraph {
                    program: _,
                    records,
                    num_records,
                    record_stride,
                } => {
                    let list10: ID3D12GraphicsCommandList10 =
                        check("QueryInterface(ID3D12GraphicsCommandList10)", list.cast())?;
                    // CPU 输入记录在录制时被运行时拷贝
                    let desc = D3D12_DISPATCH_GRAPH_DESC {
                        Mode: D3D12_DISPATCH_MODE_NODE_CPU_INPUT,
                        Anonymous: D3D12_DISPATCH_GRAPH_DESC_0 {
                            NodeCPUInput: D3D12_NODE_CPU_INPUT {
                                EntrypointIndex: 0,
                                NumRecords: num_records,
                                pRecords: records.as_ptr() as *const c_void,
                                RecordStrideInBytes: record_stride as u64,
                            },
                        },
                    };
                    list10.DispatchGraph(&desc);
                }
                GpuCommand::ClearRenderTarget { rtv, color } => {
                    list.ClearRenderTargetView(cpu_handle(rtv.cpu), &color, None);
                }
                GpuCommand::SetRenderTarget { rtv } => {
                    let handle = cpu_handle(rtv.cpu);
                    list.OMSetRenderTargets(1, Some(&handle), false, None);
                }
                GpuCommand::SetViewport { width, height } => {
                    let viewport = D3D12_VIEWPORT {
                        TopLeftX: 0.0,
                        TopLeftY: 0.0,
                        Width: width as f32,
                        Height: height as f32,
                        MinDepth: D3D12_MIN_DEPTH,
                        MaxDepth: D3D12_MAX_DEPTH,
                    };
                    let scissor = windows::Win32::Foundation::RECT {
                        left: 0,
                        top: 0,
                        right: width as i32,
                        bottom: height as i32,
                    };
                    list.RSSetViewports(&[viewport]);
                    list.RSSetScissorRects(&[scissor]);
                }
                GpuCommand::SetVertexBuffer(view) => {
                    let view = D3D12_VERTEX_BUFFER_VIEW {
                        BufferLocation: view.buffer_location,
                        SizeInBytes: view.size_in_bytes,
                        StrideInBytes: view.stride_in_bytes,
                    };
                    list.IASetVertexBuffers(0, Some(&[view]));
                }
                GpuCommand::DrawInstanced {
                    vertex_count,
                    instance_count,
                } => list.DrawInstanced(vertex_count, instance_count, 0, 0),
                GpuCommand::DrawIndirect { args, offset } => {
                    list.ExecuteIndirect(&self.draw_signature, 1, args, offset, None, 0);
                }
            }
        }
        Ok(())
    }

    fn signal(&mut self, queue: QueueType, value: FenceValue) -> Result<()> {
        let command_queue = &self.queues[queue.index()];
        let value = value.value();
        unsafe {
            // 先等前一个值，保证不同队列上的 signal 也按分配顺序到达
            if value > 1 {
                check("ID3D12CommandQueue::Wait", command_queue.Wait(&self.fence, value - 1))?;
            }
            check("ID3D12CommandQueue::Signal", command_queue.Signal(&self.fence, value))
        }
    }

    fn wait_for_fence(&mut self, value: FenceValue) -> Result<()> {
        let target = value.value();
        unsafe {
            let completed = self.fence.GetCompletedValue();
            if completed == u64::MAX {
                return self.check_device_removed();
            }
            if completed >= target {
                return Ok(());
            }

            check("SetEventOnCompletion", self.fence.SetEventOnCompletion(target, self.fence_event))?;
            let result = WaitForMultipleObjects(&[self.fence_event, self.removed_event], false, INFINITE);
            if result == WAIT_FAILED {
                return Err(api_error("WaitForMultipleObjects", &windows::core::Error::from_win32()));
            }
            if result.0 == WAIT_OBJECT_0.0 + 1 {
                self.check_device_removed()?;
                return Err(GraphicsError::DeviceRemoved("fence reached u64::MAX".to_string()).into());
            }
        }

        if self.validation_layer {
            self.drain_debug_messages();
        }
        Ok(())
    }

    fn completed_fence_value(&self) -> Result<FenceValue> {
        let completed = unsafe { self.fence.GetCompletedValue() };
        if completed == u64::MAX {
            self.check_device_removed()?;
        }
        Ok(FenceValue::new(completed))
    }

    fn create_committed_resource(&mut self, info: &ResourceInfo, name: &str) -> Result<ID3D12Resource> {
        create_committed(&self.device, info, name)
    }

    fn gpu_virtual_address(&self, resource: &ID3D12Resource) -> u64 {
        unsafe { resource.GetGPUVirtualAddress() }
    }

    fn write_buffer(&mut self, resource: &ID3D12Resource, offset: u64, data: &[u8]) -> Result<()> {
        Self::check_range(resource, offset, data.len())?;
        with_mapped(resource, HeapType::Upload, |mapped| unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), mapped.add(offset as usize), data.len());
        })
    }

    fn read_buffer(&mut self, resource: &ID3D12Resource, offset: u64, out: &mut [u8]) -> Result<()> {
        Self::check_range(resource, offset, out.len())?;
        with_mapped(resource, HeapType::Readback, |mapped| unsafe {
            std::ptr::copy_nonoverlapping(mapped.add(offset as usize), out.as_mut_ptr(), out.len());
        })
    }

    fn build_program(&mut self, desc: &ProgramDesc, path: PipelinePath) -> Result<Dx12Program> {
        build_program(&self.device, desc, path)
    }
}

impl Drop for Dx12Backend {
    fn drop(&mut self) {
        self.drain_debug_messages();
        unsafe {
            let _ = CloseHandle(self.fence_event);
            let _ = CloseHandle(self.removed_event);
        }
    }
}
