//! 程序构建：根签名、PSO 与工作图 state object
//!
//! 计算与图形程序在两条路径上都编译为 PSO；工作图只能走 state object，
//! 由一个全局根签名、一个 DXIL 库与一个工作图子对象组成。工作图的后备内存
//! 在构建时按运行时报告的最大需求分配，第一次 `SetProgram` 时初始化。

use std::ffi::c_void;
use std::mem::ManuallyDrop;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info};
use windows::core::{Interface, PCWSTR};
use windows::Win32::Graphics::Direct3D::*;
use windows::Win32::Graphics::Direct3D12::*;
use windows::Win32::Graphics::Dxgi::Common::*;

use crate::core::error::{GraphicsError, Result};
use crate::renderer::pipeline::{PipelinePath, PrimitiveTopology, ProgramDesc, ProgramKind, RootSignatureSource, Subobject};
use crate::renderer::resource::{HeapType, ResourceFlags, ResourceInfo};
use crate::renderer::shader::{ShaderBlob, ShaderStage};

use super::check::{check, wide};
use super::convert::{dxgi_format, topology, topology_type};
use super::resource::{create_committed, set_name};

/// 已构建的原生程序
#[derive(Clone)]
pub struct Dx12Program(pub(crate) Arc<ProgramObject>);

pub(crate) enum ProgramObject {
    Compute {
        pso: ID3D12PipelineState,
        root_signature: ID3D12RootSignature,
    },
    Graphics {
        pso: ID3D12PipelineState,
        root_signature: ID3D12RootSignature,
        topology: D3D_PRIMITIVE_TOPOLOGY,
    },
    WorkGraph {
        state_object: ID3D12StateObject,
        root_signature: ID3D12RootSignature,
        identifier: D3D12_PROGRAM_IDENTIFIER,
        backing: Option<ID3D12Resource>,
        backing_size: u64,
        initialized: AtomicBool,
    },
}

impl Dx12Program {
    pub fn is_compute(&self) -> bool {
        !matches!(*self.0, ProgramObject::Graphics { .. })
    }

    /// 第一次绑定时返回 true，之后返回 false
    pub(crate) fn take_initialize(&self) -> bool {
        match &*self.0 {
            ProgramObject::WorkGraph { initialized, .. } => !initialized.swap(true, Ordering::AcqRel),
            _ => false,
        }
    }
}

fn bytecode(blob: &ShaderBlob) -> D3D12_SHADER_BYTECODE {
    D3D12_SHADER_BYTECODE {
        pShaderBytecode: blob.bytecode.as_ptr() as *const c_void,
        BytecodeLength: blob.bytecode.len(),
    }
}

fn program_error(desc: &ProgramDesc, reason: impl std::fmt::Display) -> GraphicsError {
    GraphicsError::CommandExecution(format!("program '{}': {}", desc.name, reason))
}

/// 只有根常量、可直接索引描述符堆的根签名
fn bindless_root_signature(device: &ID3D12Device, num_constants: u32) -> Result<ID3D12RootSignature> {
    let parameters = [D3D12_ROOT_PARAMETER1 {
        ParameterType: D3D12_ROOT_PARAMETER_TYPE_32BIT_CONSTANTS,
        Anonymous: D3D12_ROOT_PARAMETER1_0 {
            Constants: D3D12_ROOT_CONSTANTS {
                ShaderRegister: 0,
                RegisterSpace: 0,
                Num32BitValues: num_constants,
            },
        },
        ShaderVisibility: D3D12_SHADER_VISIBILITY_ALL,
    }];
    let count = if num_constants > 0 { 1 } else { 0 };

    let desc = D3D12_VERSIONED_ROOT_SIGNATURE_DESC {
        Version: D3D_ROOT_SIGNATURE_VERSION_1_1,
        Anonymous: D3D12_VERSIONED_ROOT_SIGNATURE_DESC_0 {
            Desc_1_1: D3D12_ROOT_SIGNATURE_DESC1 {
                NumParameters: count,
                pParameters: parameters.as_ptr(),
                NumStaticSamplers: 0,
                pStaticSamplers: std::ptr::null(),
                Flags: D3D12_ROOT_SIGNATURE_FLAG_CBV_SRV_UAV_HEAP_DIRECTLY_INDEXED
                    | D3D12_ROOT_SIGNATURE_FLAG_SAMPLER_HEAP_DIRECTLY_INDEXED,
            },
        },
    };

    unsafe {
        let mut blob: Option<ID3DBlob> = None;
        let mut error: Option<ID3DBlob> = None;
        if let Err(err) = D3D12SerializeVersionedRootSignature(&desc, &mut blob, Some(&mut error)) {
            if let Some(error) = error {
                let message = std::slice::from_raw_parts(error.GetBufferPointer() as *const u8, error.GetBufferSize());
                return Err(GraphicsError::CommandExecution(format!(
                    "root signature serialization failed: {}",
                    String::from_utf8_lossy(message).trim_end_matches('\0')
                ))
                .into());
            }
            return check("D3D12SerializeVersionedRootSignature", Err(err));
        }
        let blob = blob.ok_or_else(|| GraphicsError::CommandExecution("empty root signature blob".to_string()))?;

        check(
            "CreateRootSignature",
            device.CreateRootSignature(
                0,
                std::slice::from_raw_parts(blob.GetBufferPointer() as *const u8, blob.GetBufferSize()),
            ),
        )
    }
}

fn root_signature(device: &ID3D12Device, desc: &ProgramDesc) -> Result<ID3D12RootSignature> {
    match desc.root_signature() {
        Some(RootSignatureSource::Bindless { num_constants }) => bindless_root_signature(device, num_constants),
        Some(RootSignatureSource::Embedded { shader }) => {
            let blob = desc
                .shaders
                .get(shader)
                .ok_or_else(|| program_error(desc, "embedded root signature shader missing"))?;
            // 字节码中的 RTS0 部分
            unsafe { check("CreateRootSignature", device.CreateRootSignature(0, &blob.bytecode)) }
        }
        None => Err(program_error(desc, "no root signature").into()),
    }
}

fn compute_pso(device: &ID3D12Device, desc: &ProgramDesc, root_signature: &ID3D12RootSignature) -> Result<ID3D12PipelineState> {
    let shader = desc
        .shader(ShaderStage::Compute)
        .ok_or_else(|| program_error(desc, "compute shader missing"))?;

    let pso_desc = D3D12_COMPUTE_PIPELINE_STATE_DESC {
        pRootSignature: ManuallyDrop::new(Some(root_signature.clone())),
        CS: bytecode(shader),
        NodeMask: 0,
        CachedPSO: D3D12_CACHED_PIPELINE_STATE::default(),
        Flags: D3D12_PIPELINE_STATE_FLAG_NONE,
    };
    let pso = unsafe { check("CreateComputePipelineState", device.CreateComputePipelineState(&pso_desc)) };
    drop(ManuallyDrop::into_inner(pso_desc.pRootSignature));
    pso
}

fn graphics_pso(device: &ID3D12Device, desc: &ProgramDesc, root_signature: &ID3D12RootSignature) -> Result<ID3D12PipelineState> {
    let vertex = desc
        .shader(ShaderStage::Vertex)
        .ok_or_else(|| program_error(desc, "vertex shader missing"))?;
    let pixel = desc
        .shader(ShaderStage::Pixel)
        .ok_or_else(|| program_error(desc, "pixel shader missing"))?;

    // 与 `Vertex` 的内存布局一致
    let input_elements = [
        D3D12_INPUT_ELEMENT_DESC {
            SemanticName: windows::core::s!("POSITION"),
            SemanticIndex: 0,
            Format: DXGI_FORMAT_R32G32B32_FLOAT,
            InputSlot: 0,
            AlignedByteOffset: 0,
            InputSlotClass: D3D12_INPUT_CLASSIFICATION_PER_VERTEX_DATA,
            InstanceDataStepRate: 0,
        },
        D3D12_INPUT_ELEMENT_DESC {
            SemanticName: windows::core::s!("COLOR"),
            SemanticIndex: 0,
            Format: DXGI_FORMAT_R32G32B32A32_FLOAT,
            InputSlot: 0,
            AlignedByteOffset: 12,
            InputSlotClass: D3D12_INPUT_CLASSIFICATION_PER_VERTEX_DATA,
            InstanceDataStepRate: 0,
        },
    ];

    let mut pso_desc = D3D12_GRAPHICS_PIPELINE_STATE_DESC::default();
    pso_desc.pRootSignature = ManuallyDrop::new(Some(root_signature.clone()));
    pso_desc.VS = bytecode(vertex);
    pso_desc.PS = bytecode(pixel);
    pso_desc.BlendState.RenderTarget[0] = D3D12_RENDER_TARGET_BLEND_DESC {
        RenderTargetWriteMask: D3D12_COLOR_WRITE_ENABLE_ALL.0 as u8,
        ..Default::default()
    };
    pso_desc.RasterizerState = D3D12_RASTERIZER_DESC {
        FillMode: D3D12_FILL_MODE_SOLID,
        CullMode: D3D12_CULL_MODE_NONE,
        DepthClipEnable: true.into(),
        ..Default::default()
    };
    pso_desc.DepthStencilState = D3D12_DEPTH_STENCIL_DESC::default();
    pso_desc.SampleMask = u32::MAX;
    pso_desc.InputLayout = D3D12_INPUT_LAYOUT_DESC {
        pInputElementDescs: input_elements.as_ptr(),
        NumElements: input_elements.len() as u32,
    };
    pso_desc.PrimitiveTopologyType = topology_type(desc.topology().unwrap_or(PrimitiveTopology::TriangleList));

    let formats = desc.render_target_formats();
    if formats.len() > pso_desc.RTVFormats.len() {
        return Err(program_error(desc, "too many render targets").into());
    }
    pso_desc.NumRenderTargets = formats.len() as u32;
    for (slot, format) in pso_desc.RTVFormats.iter_mut().zip(formats) {
        *slot = dxgi_format(*format);
    }
    if let Some(depth) = desc.subobjects.iter().find_map(|s| match s {
        Subobject::DepthStencilFormat(format) => Some(*format),
        _ => None,
    }) {
        pso_desc.DSVFormat = dxgi_format(depth);
    }
    pso_desc.SampleDesc.Count = 1;

    let pso = unsafe { check("CreateGraphicsPipelineState", device.CreateGraphicsPipelineState(&pso_desc)) };
    drop(ManuallyDrop::into_inner(pso_desc.pRootSignature));
    pso
}

fn work_graph(device: &ID3D12Device, desc: &ProgramDesc, root_signature: &ID3D12RootSignature) -> Result<ProgramObject> {
    let device5: ID3D12Device5 = check("QueryInterface(ID3D12Device5)", device.cast())?;

    let (library_index, exports) = desc
        .subobjects
        .iter()
        .find_map(|s| match s {
            Subobject::DxilLibrary { shader, exports } => Some((*shader, exports)),
            _ => None,
        })
        .ok_or_else(|| program_error(desc, "DXIL library subobject missing"))?;
    let library = desc
        .shaders
        .get(library_index)
        .ok_or_else(|| program_error(desc, "library shader missing"))?;

    let (graph_name, include_all, entry_points) = desc
        .subobjects
        .iter()
        .find_map(|s| match s {
            Subobject::WorkGraph {
                name,
                include_all_available_nodes,
                entry_points,
            } => Some((name, *include_all_available_nodes, entry_points)),
            _ => None,
        })
        .ok_or_else(|| program_error(desc, "work graph subobject missing"))?;

    // 子对象描述中的指针引用下列本地存储，必须活到 CreateStateObject 返回
    let export_names: Vec<Vec<u16>> = exports.iter().map(|e| wide(e)).collect();
    let mut export_descs: Vec<D3D12_EXPORT_DESC> = export_names
        .iter()
        .map(|name| D3D12_EXPORT_DESC {
            Name: PCWSTR(name.as_ptr()),
            ExportToRename: PCWSTR::null(),
            Flags: D3D12_EXPORT_FLAG_NONE,
        })
        .collect();
    let entry_names: Vec<Vec<u16>> = entry_points.iter().map(|e| wide(e)).collect();
    let entry_ids: Vec<D3D12_NODE_ID> = entry_names
        .iter()
        .map(|name| D3D12_NODE_ID {
            Name: PCWSTR(name.as_ptr()),
            ArrayIndex: 0,
        })
        .collect();
    let program_name = wide(graph_name);

    let global_root = D3D12_GLOBAL_ROOT_SIGNATURE {
        pGlobalRootSignature: ManuallyDrop::new(Some(root_signature.clone())),
    };
    let library_desc = D3D12_DXIL_LIBRARY_DESC {
        DXILLibrary: bytecode(library),
        NumExports: export_descs.len() as u32,
        pExports: if export_descs.is_empty() {
            std::ptr::null_mut()
        } else {
            export_descs.as_mut_ptr()
        },
    };
    let graph_desc = D3D12_WORK_GRAPH_DESC {
        ProgramName: PCWSTR(program_name.as_ptr()),
        Flags: if include_all {
            D3D12_WORK_GRAPH_FLAG_INCLUDE_ALL_AVAILABLE_NODES
        } else {
            D3D12_WORK_GRAPH_FLAG_NONE
        },
        NumEntrypoints: entry_ids.len() as u32,
        pEntrypoints: entry_ids.as_ptr(),
        NumExplicitlyDefinedNodes: 0,
        pExplicitlyDefinedNodes: std::ptr::null(),
    };

    let subobjects = [
        D3D12_STATE_SUBOBJECT {
            Type: D3D12_STATE_SUBOBJECT_TYPE_GLOBAL_ROOT_SIGNATURE,
            pDesc: &global_root as *const _ as *const c_void,
        },
        D3D12_STATE_SUBOBJECT {
            Type: D3D12_STATE_SUBOBJECT_TYPE_DXIL_LIBRARY,
            pDesc: &library_desc as *const _ as *const c_void,
        },
        D3D12_STATE_SUBOBJECT {
            Type: D3D12_STATE_SUBOBJECT_TYPE_WORK_GRAPH,
            pDesc: &graph_desc as *const _ as *const c_void,
        },
    ];
    let state_desc = D3D12_STATE_OBJECT_DESC {
        Type: D3D12_STATE_OBJECT_TYPE_EXECUTABLE,
        NumSubobjects: subobjects.len() as u32,
        pSubobjects: subobjects.as_ptr(),
    };

    let state_object: Result<ID3D12StateObject> =
        unsafe { check("CreateStateObject", device5.CreateStateObject(&state_desc)) };
    drop(ManuallyDrop::into_inner(global_root.pGlobalRootSignature));
    let state_object = state_object?;

    let properties: ID3D12StateObjectProperties1 =
        check("QueryInterface(ID3D12StateObjectProperties1)", state_object.cast())?;
    let graph_properties: ID3D12WorkGraphProperties =
        check("QueryInterface(ID3D12WorkGraphProperties)", state_object.cast())?;

    let (identifier, requirements) = unsafe {
        let name = PCWSTR(program_name.as_ptr());
        let identifier = properties.GetProgramIdentifier(name);
        let index = graph_properties.GetWorkGraphIndex(name);
        let mut requirements = D3D12_WORK_GRAPH_MEMORY_REQUIREMENTS::default();
        graph_properties.GetWorkGraphMemoryRequirements(index, &mut requirements);
        (identifier, requirements)
    };

    let backing_size = requirements.MaxSizeInBytes;
    let backing = if backing_size > 0 {
        let info = ResourceInfo::buffer(HeapType::Default, ResourceFlags::ALLOW_UNORDERED_ACCESS, backing_size);
        Some(create_committed(device, &info, &format!("{} Backing Memory", desc.name))?)
    } else {
        None
    };
    debug!(program = %desc.name, backing_size, "Work graph memory allocated");

    Ok(ProgramObject::WorkGraph {
        state_object,
        root_signature: root_signature.clone(),
        identifier,
        backing,
        backing_size,
        initialized: AtomicBool::new(false),
    })
}

pub fn build_program(device: &ID3D12Device, desc: &ProgramDesc, path: PipelinePath) -> Result<Dx12Program> {
    let root_signature = root_signature(device, desc)?;
    set_name(&root_signature, &format!("{} Root Signature", desc.name));

    let object = match desc.kind {
        ProgramKind::Compute => {
            let pso = compute_pso(device, desc, &root_signature)?;
            set_name(&pso, &desc.name);
            ProgramObject::Compute { pso, root_signature }
        }
        ProgramKind::Graphics => {
            let pso = graphics_pso(device, desc, &root_signature)?;
            set_name(&pso, &desc.name);
            ProgramObject::Graphics {
                pso,
                root_signature,
                topology: topology(desc.topology().unwrap_or(PrimitiveTopology::TriangleList)),
            }
        }
        ProgramKind::WorkGraph => work_graph(device, desc, &root_signature)?,
    };

    info!(program = %desc.name, kind = desc.kind.name(), path = %path, "Program built");
    Ok(Dx12Program(Arc::new(object)))
}
