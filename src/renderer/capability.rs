//! 设备能力查询结果
//!
//! 后端把原始的特性查询翻译成这里的强类型结果（tier 枚举、布尔值、字节数）。
//! 查询本身是对设备的只读探测，不缓存，可以在管线路径选择时反复调用。

use std::fmt;
use std::fmt::Write as _;

use crate::core::error::{GraphicsError, Result};
use crate::core::units::to_mb;

macro_rules! tier_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $label:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn name(&self) -> &'static str {
                match self {
                    $($name::$variant => $label),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.name())
            }
        }
    };
}

tier_enum!(
    /// 设备支持的最高特性级别
    FeatureLevel {
        L11_0 => "11_0",
        L11_1 => "11_1",
        L12_0 => "12_0",
        L12_1 => "12_1",
        L12_2 => "12_2",
    }
);

tier_enum!(ResourceBindingTier { Tier1 => "Tier 1", Tier2 => "Tier 2", Tier3 => "Tier 3" });

tier_enum!(ResourceHeapTier { Tier1 => "Tier 1", Tier2 => "Tier 2" });

tier_enum!(RootSignatureVersion { V1_0 => "1.0", V1_1 => "1.1", V1_2 => "1.2" });

tier_enum!(RaytracingTier {
    NotSupported => "Not supported",
    Tier1_0 => "Tier 1.0",
    Tier1_1 => "Tier 1.1",
});

tier_enum!(VariableShadingRateTier {
    NotSupported => "Not supported",
    Tier1 => "Tier 1",
    Tier2 => "Tier 2",
});

tier_enum!(MeshShaderTier { NotSupported => "Not supported", Tier1 => "Tier 1" });

tier_enum!(SamplerFeedbackTier {
    NotSupported => "Not supported",
    Tier0_9 => "Tier 0.9",
    Tier1_0 => "Tier 1.0",
});

tier_enum!(WorkGraphsTier {
    NotSupported => "Not supported",
    Tier1_0 => "Tier 1.0",
    Tier1_1 => "Tier 1.1",
});

/// 着色器模型
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ShaderModel {
    pub major: u8,
    pub minor: u8,
}

impl ShaderModel {
    pub const SM_5_1: ShaderModel = ShaderModel::new(5, 1);
    pub const SM_6_0: ShaderModel = ShaderModel::new(6, 0);
    pub const SM_6_6: ShaderModel = ShaderModel::new(6, 6);
    pub const SM_6_8: ShaderModel = ShaderModel::new(6, 8);

    /// 从高到低探测的顺序
    pub const PROBE_ORDER: [ShaderModel; 10] = [
        ShaderModel::new(6, 8),
        ShaderModel::new(6, 7),
        ShaderModel::new(6, 6),
        ShaderModel::new(6, 5),
        ShaderModel::new(6, 4),
        ShaderModel::new(6, 3),
        ShaderModel::new(6, 2),
        ShaderModel::new(6, 1),
        ShaderModel::new(6, 0),
        ShaderModel::new(5, 1),
    ];

    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    /// D3D_SHADER_MODEL 编码（0x68 表示 6.8）
    pub fn encoded(&self) -> u32 {
        ((self.major as u32) << 4) | self.minor as u32
    }

    pub fn from_encoded(value: u32) -> Self {
        Self::new(((value >> 4) & 0xF) as u8, (value & 0xF) as u8)
    }
}

impl fmt::Display for ShaderModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.major, self.minor)
    }
}

/// 波（wave）宽度范围
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaveLaneCount {
    pub min: u32,
    pub max: u32,
}

/// 纹理格式支持情况
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FormatSupport {
    pub render_target: bool,
    pub typed_uav_store: bool,
    pub shader_sample: bool,
}

/// 一次能力查询的完整结果
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceCapabilities {
    pub adapter_name: String,
    pub dedicated_video_memory: u64,
    pub feature_level: FeatureLevel,
    pub shader_model: ShaderModel,
    pub resource_binding_tier: ResourceBindingTier,
    pub resource_heap_tier: ResourceHeapTier,
    pub root_signature_version: RootSignatureVersion,
    pub raytracing_tier: RaytracingTier,
    pub variable_shading_rate_tier: VariableShadingRateTier,
    pub mesh_shader_tier: MeshShaderTier,
    pub sampler_feedback_tier: SamplerFeedbackTier,
    pub enhanced_barriers: bool,
    pub wave_lanes: WaveLaneCount,
    pub work_graphs_tier: WorkGraphsTier,
}

impl DeviceCapabilities {
    /// 着色器可以直接索引 `ResourceDescriptorHeap`
    pub fn supports_bindless(&self) -> bool {
        self.resource_binding_tier >= ResourceBindingTier::Tier3 && self.shader_model >= ShaderModel::SM_6_6
    }

    pub fn supports_work_graphs(&self) -> bool {
        self.work_graphs_tier != WorkGraphsTier::NotSupported
    }

    /// 通用程序 state object 与工作图随同一版本的运行时发布，且需要 SM 6.8
    pub fn supports_generic_programs(&self) -> bool {
        self.supports_work_graphs() && self.shader_model >= ShaderModel::SM_6_8
    }

    pub fn require_feature_level(&self, min: FeatureLevel) -> Result<()> {
        if self.feature_level >= min {
            Ok(())
        } else {
            Err(unsupported(format!(
                "feature level {} required, device supports {}",
                min, self.feature_level
            )))
        }
    }

    pub fn require_shader_model(&self, min: ShaderModel) -> Result<()> {
        if self.shader_model >= min {
            Ok(())
        } else {
            Err(unsupported(format!(
                "shader model {} required, device supports {}",
                min, self.shader_model
            )))
        }
    }

    pub fn require_bindless(&self) -> Result<()> {
        if self.supports_bindless() {
            Ok(())
        } else {
            Err(unsupported(format!(
                "bindless resources need binding tier 3 and SM 6_6 (have {}, SM {})",
                self.resource_binding_tier, self.shader_model
            )))
        }
    }

    /// 人类可读的能力报告，每行 `名称\t值`
    pub fn dump(&self) -> String {
        let rows: [(&str, String); 15] = [
            ("Adapter", self.adapter_name.clone()),
            ("Dedicated video memory", format!("{} MB", to_mb(self.dedicated_video_memory))),
            ("Max feature level", self.feature_level.to_string()),
            ("Max shader model", self.shader_model.to_string()),
            ("Resource binding tier", self.resource_binding_tier.to_string()),
            ("Resource heap tier", self.resource_heap_tier.to_string()),
            ("Root signature version", self.root_signature_version.to_string()),
            ("Raytracing tier", self.raytracing_tier.to_string()),
            ("Variable shading rate tier", self.variable_shading_rate_tier.to_string()),
            ("Mesh shader tier", self.mesh_shader_tier.to_string()),
            ("Sampler feedback tier", self.sampler_feedback_tier.to_string()),
            ("Enhanced barriers", yes_no(self.enhanced_barriers).to_string()),
            ("Wave lane count", format!("{}-{}", self.wave_lanes.min, self.wave_lanes.max)),
            ("Work graphs tier", self.work_graphs_tier.to_string()),
            ("Bindless", yes_no(self.supports_bindless()).to_string()),
        ];

        let mut out = String::new();
        for (name, value) in rows {
            let _ = writeln!(out, "{}\t{}", name, value);
        }
        out
    }
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "Yes"
    } else {
        "No"
    }
}

fn unsupported(message: String) -> crate::core::error::PlaygroundError {
    GraphicsError::CapabilityUnsupported(message).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps() -> DeviceCapabilities {
        DeviceCapabilities {
            adapter_name: "Test Adapter".to_string(),
            dedicated_video_memory: 8 * 1024 * 1024 * 1024,
            feature_level: FeatureLevel::L12_1,
            shader_model: ShaderModel::SM_6_6,
            resource_binding_tier: ResourceBindingTier::Tier3,
            resource_heap_tier: ResourceHeapTier::Tier2,
            root_signature_version: RootSignatureVersion::V1_1,
            raytracing_tier: RaytracingTier::Tier1_1,
            variable_shading_rate_tier: VariableShadingRateTier::Tier2,
            mesh_shader_tier: MeshShaderTier::Tier1,
            sampler_feedback_tier: SamplerFeedbackTier::NotSupported,
            enhanced_barriers: true,
            wave_lanes: WaveLaneCount { min: 32, max: 32 },
            work_graphs_tier: WorkGraphsTier::NotSupported,
        }
    }

    #[test]
    fn test_shader_model_ordering_and_encoding() {
        assert!(ShaderModel::SM_6_8 > ShaderModel::SM_6_6);
        assert!(ShaderModel::new(6, 0) > ShaderModel::SM_5_1);
        assert_eq!(ShaderModel::SM_6_8.encoded(), 0x68);
        assert_eq!(ShaderModel::from_encoded(0x65), ShaderModel::new(6, 5));
        assert_eq!(ShaderModel::SM_6_6.to_string(), "6_6");
        assert!(ShaderModel::PROBE_ORDER.windows(2).all(|w| w[0] > w[1]));
    }

    #[test]
    fn test_generic_programs_need_work_graphs_and_sm68() {
        let mut c = caps();
        assert!(c.supports_bindless());
        assert!(!c.supports_generic_programs());

        c.work_graphs_tier = WorkGraphsTier::Tier1_0;
        assert!(!c.supports_generic_programs());

        c.shader_model = ShaderModel::SM_6_8;
        assert!(c.supports_generic_programs());
    }

    #[test]
    fn test_requirements() {
        let c = caps();
        assert!(c.require_feature_level(FeatureLevel::L12_0).is_ok());
        assert!(c.require_feature_level(FeatureLevel::L12_2).is_err());
        assert!(c.require_shader_model(ShaderModel::SM_6_8).is_err());
        assert!(c.require_bindless().is_ok());
    }

    #[test]
    fn test_dump_is_tab_separated() {
        let dump = caps().dump();
        assert!(dump.contains("Max shader model\t6_6\n"));
        assert!(dump.contains("Dedicated video memory\t8192 MB\n"));
        assert!(dump.contains("Work graphs tier\tNot supported\n"));
        assert!(dump.lines().all(|line| line.split('\t').count() == 2));
    }
}
