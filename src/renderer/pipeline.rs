//! 管线与程序构建
//!
//! 着色器字节码加上一小组声明式子对象（根签名来源、图元拓扑、渲染目标格式、
//! 工作图节点集合）构建成一个不透明的程序对象，供命令列表 `SetProgram` 使用。
//!
//! 两条构建路径：
//!
//! - **LegacyPso**：传统的计算/图形管线状态对象
//! - **GenericProgram**：state object 形式的通用程序，同时支持工作图
//!
//! 路径在启动时由 [`PipelinePath::select`] 根据设备能力选择一次，运行期间不会改变。

use std::fmt;

use tracing::{debug, info};

use crate::core::config::PipelinePreference;
use crate::core::error::{GraphicsError, Result};
use crate::gfx::backend::GraphicsBackend;

use super::capability::DeviceCapabilities;
use super::context::DeviceContext;
use super::resource::TextureFormat;
use super::shader::{ShaderBlob, ShaderStage};

/// 程序构建路径
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelinePath {
    LegacyPso,
    GenericProgram,
}

impl PipelinePath {
    /// 根据设备能力与配置选择路径
    ///
    /// `Auto` 在设备支持通用程序时选择 `GenericProgram`；显式要求 `Generic`
    /// 而设备不支持时返回 `CapabilityUnsupported`。
    pub fn select(capabilities: &DeviceCapabilities, preference: PipelinePreference) -> Result<Self> {
        let supported = capabilities.supports_generic_programs();
        let path = match preference {
            PipelinePreference::Legacy => PipelinePath::LegacyPso,
            PipelinePreference::Auto if supported => PipelinePath::GenericProgram,
            PipelinePreference::Auto => PipelinePath::LegacyPso,
            PipelinePreference::Generic if supported => PipelinePath::GenericProgram,
            PipelinePreference::Generic => {
                return Err(GraphicsError::CapabilityUnsupported(format!(
                    "generic programs need work graphs and SM 6_8 (work graphs {}, SM {})",
                    capabilities.work_graphs_tier, capabilities.shader_model
                ))
                .into())
            }
        };

        info!(path = %path, ?preference, "Pipeline path selected");
        Ok(path)
    }

    pub fn supports_work_graphs(self) -> bool {
        self == PipelinePath::GenericProgram
    }

    pub fn name(self) -> &'static str {
        match self {
            PipelinePath::LegacyPso => "legacy-pso",
            PipelinePath::GenericProgram => "generic-program",
        }
    }
}

impl fmt::Display for PipelinePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 程序类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProgramKind {
    Compute,
    Graphics,
    WorkGraph,
}

impl ProgramKind {
    pub fn name(self) -> &'static str {
        match self {
            ProgramKind::Compute => "compute",
            ProgramKind::Graphics => "graphics",
            ProgramKind::WorkGraph => "work-graph",
        }
    }
}

/// 根签名来源
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootSignatureSource {
    /// 根签名已嵌入 `shaders[index]` 的字节码中
    Embedded { shader: usize },
    /// 无绑定根签名：只有根常量，资源通过 `ResourceDescriptorHeap` 直接索引
    Bindless { num_constants: u32 },
}

/// 图元拓扑
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimitiveTopology {
    PointList,
    LineList,
    TriangleList,
    TriangleStrip,
}

/// 程序子对象
#[derive(Debug, Clone, PartialEq)]
pub enum Subobject {
    RootSignature(RootSignatureSource),
    /// DXIL 库，`exports` 为空时导出全部符号
    DxilLibrary { shader: usize, exports: Vec<String> },
    PrimitiveTopology(PrimitiveTopology),
    RenderTargetFormats(Vec<TextureFormat>),
    DepthStencilFormat(TextureFormat),
    WorkGraph {
        name: String,
        include_all_available_nodes: bool,
        entry_points: Vec<String>,
    },
}

/// 程序描述
#[derive(Debug, Clone)]
pub struct ProgramDesc {
    pub name: String,
    pub kind: ProgramKind,
    pub shaders: Vec<ShaderBlob>,
    pub subobjects: Vec<Subobject>,
}

impl ProgramDesc {
    /// 单个计算着色器，使用无绑定根签名
    pub fn compute(name: impl Into<String>, shader: ShaderBlob, num_constants: u32) -> Self {
        Self {
            name: name.into(),
            kind: ProgramKind::Compute,
            shaders: vec![shader],
            subobjects: vec![Subobject::RootSignature(RootSignatureSource::Bindless { num_constants })],
        }
    }

    /// 顶点 + 像素着色器，根签名嵌入在顶点着色器中
    pub fn graphics(
        name: impl Into<String>,
        vertex: ShaderBlob,
        pixel: ShaderBlob,
        render_target_format: TextureFormat,
    ) -> Self {
        Self {
            name: name.into(),
            kind: ProgramKind::Graphics,
            shaders: vec![vertex, pixel],
            subobjects: vec![
                Subobject::RootSignature(RootSignatureSource::Embedded { shader: 0 }),
                Subobject::PrimitiveTopology(PrimitiveTopology::TriangleList),
                Subobject::RenderTargetFormats(vec![render_target_format]),
            ],
        }
    }

    /// 工作图：一个库、全部可用节点
    pub fn work_graph(name: impl Into<String>, library: ShaderBlob, num_constants: u32) -> Self {
        let name = name.into();
        Self {
            kind: ProgramKind::WorkGraph,
            shaders: vec![library],
            subobjects: vec![
                Subobject::RootSignature(RootSignatureSource::Bindless { num_constants }),
                Subobject::DxilLibrary { shader: 0, exports: Vec::new() },
                Subobject::WorkGraph {
                    name: name.clone(),
                    include_all_available_nodes: true,
                    entry_points: Vec::new(),
                },
            ],
            name,
        }
    }

    pub fn root_signature(&self) -> Option<RootSignatureSource> {
        self.subobjects.iter().find_map(|s| match s {
            Subobject::RootSignature(source) => Some(*source),
            _ => None,
        })
    }

    /// 根常量数量，嵌入式根签名无法得知时为 `None`
    pub fn root_constant_count(&self) -> Option<u32> {
        match self.root_signature()? {
            RootSignatureSource::Bindless { num_constants } => Some(num_constants),
            RootSignatureSource::Embedded { .. } => None,
        }
    }

    pub fn shader(&self, stage: ShaderStage) -> Option<&ShaderBlob> {
        self.shaders.iter().find(|s| s.stage() == stage)
    }

    pub fn render_target_formats(&self) -> &[TextureFormat] {
        self.subobjects
            .iter()
            .find_map(|s| match s {
                Subobject::RenderTargetFormats(formats) => Some(formats.as_slice()),
                _ => None,
            })
            .unwrap_or(&[])
    }

    pub fn topology(&self) -> Option<PrimitiveTopology> {
        self.subobjects.iter().find_map(|s| match s {
            Subobject::PrimitiveTopology(t) => Some(*t),
            _ => None,
        })
    }

    /// 检查子对象组合在给定路径下是否合法
    pub fn validate(&self, path: PipelinePath) -> Result<()> {
        let fail = |reason: String| -> Result<()> {
            Err(GraphicsError::CommandExecution(format!("program '{}': {}", self.name, reason)).into())
        };

        if self.name.is_empty() {
            return fail("program name is empty".to_string());
        }
        if self.shaders.iter().any(ShaderBlob::is_empty) {
            return fail("shader bytecode is empty".to_string());
        }

        let root_signatures = self
            .subobjects
            .iter()
            .filter(|s| matches!(s, Subobject::RootSignature(_)))
            .count();
        if root_signatures != 1 {
            return fail(format!("expected one root signature subobject, found {}", root_signatures));
        }

        for subobject in &self.subobjects {
            match subobject {
                Subobject::RootSignature(RootSignatureSource::Embedded { shader })
                | Subobject::DxilLibrary { shader, .. }
                    if *shader >= self.shaders.len() =>
                {
                    return fail(format!("subobject references missing shader {}", shader));
                }
                Subobject::DxilLibrary { shader, .. } if self.shaders[*shader].stage() != ShaderStage::Library => {
                    return fail("DXIL library subobject must reference a library shader".to_string());
                }
                Subobject::DxilLibrary { .. } | Subobject::WorkGraph { .. } if path == PipelinePath::LegacyPso => {
                    return fail("library subobjects need the generic program path".to_string());
                }
                Subobject::WorkGraph {
                    include_all_available_nodes: false,
                    entry_points,
                    ..
                } if entry_points.is_empty() => {
                    return fail("work graph without nodes".to_string());
                }
                _ => {}
            }
        }

        match self.kind {
            ProgramKind::Compute if self.shader(ShaderStage::Compute).is_none() => {
                fail("compute program needs a compute shader".to_string())
            }
            ProgramKind::Graphics
                if self.shader(ShaderStage::Vertex).is_none() || self.shader(ShaderStage::Pixel).is_none() =>
            {
                fail("graphics program needs vertex and pixel shaders".to_string())
            }
            ProgramKind::Graphics if self.render_target_formats().is_empty() => {
                fail("graphics program needs at least one render target format".to_string())
            }
            ProgramKind::WorkGraph if !path.supports_work_graphs() => Err(GraphicsError::CapabilityUnsupported(
                format!("work graph '{}' needs the generic program path", self.name),
            )
            .into()),
            ProgramKind::WorkGraph
                if !self.subobjects.iter().any(|s| matches!(s, Subobject::WorkGraph { .. })) =>
            {
                fail("work graph subobject missing".to_string())
            }
            _ => Ok(()),
        }
    }
}

/// 已构建的程序
///
/// 原生对象在录制引用它的命令时会被上下文额外持有，直到那次提交的 fence 完成。
pub struct Program<B: GraphicsBackend> {
    name: String,
    kind: ProgramKind,
    path: PipelinePath,
    root_constant_count: Option<u32>,
    native: B::Program,
}

impl<B: GraphicsBackend> Program<B> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ProgramKind {
        self.kind
    }

    pub fn path(&self) -> PipelinePath {
        self.path
    }

    pub fn root_constant_count(&self) -> Option<u32> {
        self.root_constant_count
    }

    pub fn native(&self) -> &B::Program {
        &self.native
    }
}

impl<B: GraphicsBackend> fmt::Debug for Program<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Program")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("path", &self.path)
            .finish()
    }
}

impl<B: GraphicsBackend> DeviceContext<B> {
    /// 构建程序对象
    pub fn create_program(&mut self, desc: &ProgramDesc, path: PipelinePath) -> Result<Program<B>> {
        desc.validate(path)?;

        let native = self.backend_mut().build_program(desc, path)?;
        debug!(name = %desc.name, kind = desc.kind.name(), %path, "Program created");

        Ok(Program {
            name: desc.name.clone(),
            kind: desc.kind,
            path,
            root_constant_count: desc.root_constant_count(),
            native,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::capability::{ShaderModel, WorkGraphsTier};
    use crate::renderer::shader::ShaderDesc;

    fn blob(stage: ShaderStage) -> ShaderBlob {
        ShaderBlob::from_bytes(ShaderDesc::new(stage, "Test.hlsl", "main"), vec![0xDE, 0xAD])
    }

    #[test]
    fn test_path_selection() {
        let mut caps = crate::gfx::headless::default_capabilities();
        assert_eq!(
            PipelinePath::select(&caps, PipelinePreference::Auto).unwrap(),
            PipelinePath::GenericProgram
        );
        assert_eq!(
            PipelinePath::select(&caps, PipelinePreference::Legacy).unwrap(),
            PipelinePath::LegacyPso
        );

        caps.work_graphs_tier = WorkGraphsTier::NotSupported;
        assert_eq!(
            PipelinePath::select(&caps, PipelinePreference::Auto).unwrap(),
            PipelinePath::LegacyPso
        );
        assert!(PipelinePath::select(&caps, PipelinePreference::Generic).is_err());

        caps.work_graphs_tier = WorkGraphsTier::Tier1_0;
        caps.shader_model = ShaderModel::SM_6_6;
        assert_eq!(
            PipelinePath::select(&caps, PipelinePreference::Auto).unwrap(),
            PipelinePath::LegacyPso
        );
    }

    #[test]
    fn test_work_graph_needs_generic_path() {
        let desc = ProgramDesc::work_graph("BroadcastGraph", blob(ShaderStage::Library), 2);
        assert!(desc.validate(PipelinePath::GenericProgram).is_ok());
        assert!(desc.validate(PipelinePath::LegacyPso).is_err());
        assert_eq!(desc.root_constant_count(), Some(2));
    }

    #[test]
    fn test_graphics_desc() {
        let desc = ProgramDesc::graphics(
            "Triangle",
            blob(ShaderStage::Vertex),
            blob(ShaderStage::Pixel),
            TextureFormat::Rgba8Unorm,
        );
        assert!(desc.validate(PipelinePath::LegacyPso).is_ok());
        assert_eq!(desc.root_constant_count(), None);
        assert_eq!(desc.topology(), Some(PrimitiveTopology::TriangleList));

        let mut broken = desc.clone();
        broken.subobjects.push(Subobject::RootSignature(RootSignatureSource::Embedded { shader: 5 }));
        assert!(broken.validate(PipelinePath::LegacyPso).is_err());
    }

    #[test]
    fn test_library_must_be_library_stage() {
        let mut desc = ProgramDesc::work_graph("Graph", blob(ShaderStage::Compute), 0);
        desc.kind = ProgramKind::WorkGraph;
        assert!(desc.validate(PipelinePath::GenericProgram).is_err());

        let compute = ProgramDesc::compute("Fill", blob(ShaderStage::Compute), 3);
        assert!(compute.validate(PipelinePath::GenericProgram).is_ok());
    }
}
