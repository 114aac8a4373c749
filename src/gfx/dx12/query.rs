//! 设备能力查询
//!
//! 用 `CheckFeatureSupport` 逐项探测。着色器模型与根签名版本需要从高到低
//! 尝试：运行时不认识的版本会让调用失败，而不是返回较低的值。

use std::ffi::c_void;
use std::mem::size_of;

use tracing::debug;
use windows::Win32::Graphics::Direct3D::*;
use windows::Win32::Graphics::Direct3D12::*;
use windows::Win32::Graphics::Dxgi::{IDXGIAdapter1, DXGI_ADAPTER_DESC1};

use crate::core::error::Result;
use crate::renderer::capability::{
    DeviceCapabilities, FeatureLevel, FormatSupport, MeshShaderTier, RaytracingTier, ResourceBindingTier,
    ResourceHeapTier, RootSignatureVersion, SamplerFeedbackTier, ShaderModel, VariableShadingRateTier,
    WaveLaneCount, WorkGraphsTier,
};
use crate::renderer::resource::TextureFormat;

use super::check::check;
use super::convert::dxgi_format;

unsafe fn feature<T: Default>(device: &ID3D12Device, feature: D3D12_FEATURE) -> windows::core::Result<T> {
    let mut data = T::default();
    device.CheckFeatureSupport(feature, &mut data as *mut T as *mut c_void, size_of::<T>() as u32)?;
    Ok(data)
}

/// 适配器名称（去掉结尾的 0）
pub fn adapter_name(desc: &DXGI_ADAPTER_DESC1) -> String {
    let len = desc.Description.iter().position(|&c| c == 0).unwrap_or(desc.Description.len());
    String::from_utf16_lossy(&desc.Description[..len])
}

pub fn query_capabilities(device: &ID3D12Device, adapter: &IDXGIAdapter1) -> Result<DeviceCapabilities> {
    unsafe {
        let adapter_desc = check("GetDesc1", adapter.GetDesc1())?;

        let requested = [
            D3D_FEATURE_LEVEL_12_2,
            D3D_FEATURE_LEVEL_12_1,
            D3D_FEATURE_LEVEL_12_0,
            D3D_FEATURE_LEVEL_11_1,
            D3D_FEATURE_LEVEL_11_0,
        ];
        let mut levels = D3D12_FEATURE_DATA_FEATURE_LEVELS {
            NumFeatureLevels: requested.len() as u32,
            pFeatureLevelsRequested: requested.as_ptr(),
            MaxSupportedFeatureLevel: D3D_FEATURE_LEVEL_11_0,
        };
        check(
            "CheckFeatureSupport(FEATURE_LEVELS)",
            device.CheckFeatureSupport(
                D3D12_FEATURE_FEATURE_LEVELS,
                &mut levels as *mut _ as *mut c_void,
                size_of::<D3D12_FEATURE_DATA_FEATURE_LEVELS>() as u32,
            ),
        )?;

        let options: D3D12_FEATURE_DATA_D3D12_OPTIONS =
            check("CheckFeatureSupport(OPTIONS)", feature(device, D3D12_FEATURE_D3D12_OPTIONS))?;
        let options1: D3D12_FEATURE_DATA_D3D12_OPTIONS1 = feature(device, D3D12_FEATURE_D3D12_OPTIONS1).unwrap_or_default();
        let options5: D3D12_FEATURE_DATA_D3D12_OPTIONS5 = feature(device, D3D12_FEATURE_D3D12_OPTIONS5).unwrap_or_default();
        let options6: D3D12_FEATURE_DATA_D3D12_OPTIONS6 = feature(device, D3D12_FEATURE_D3D12_OPTIONS6).unwrap_or_default();
        let options7: D3D12_FEATURE_DATA_D3D12_OPTIONS7 = feature(device, D3D12_FEATURE_D3D12_OPTIONS7).unwrap_or_default();
        let options12: D3D12_FEATURE_DATA_D3D12_OPTIONS12 =
            feature(device, D3D12_FEATURE_D3D12_OPTIONS12).unwrap_or_default();
        // 旧运行时不认识 OPTIONS21，视为不支持工作图
        let options21: D3D12_FEATURE_DATA_D3D12_OPTIONS21 =
            feature(device, D3D12_FEATURE_D3D12_OPTIONS21).unwrap_or_default();

        let capabilities = DeviceCapabilities {
            adapter_name: adapter_name(&adapter_desc),
            dedicated_video_memory: adapter_desc.DedicatedVideoMemory as u64,
            feature_level: feature_level(levels.MaxSupportedFeatureLevel),
            shader_model: highest_shader_model(device),
            resource_binding_tier: match options.ResourceBindingTier {
                D3D12_RESOURCE_BINDING_TIER_1 => ResourceBindingTier::Tier1,
                D3D12_RESOURCE_BINDING_TIER_2 => ResourceBindingTier::Tier2,
                _ => ResourceBindingTier::Tier3,
            },
            resource_heap_tier: match options.ResourceHeapTier {
                D3D12_RESOURCE_HEAP_TIER_1 => ResourceHeapTier::Tier1,
                _ => ResourceHeapTier::Tier2,
            },
            root_signature_version: highest_root_signature(device),
            raytracing_tier: match options5.RaytracingTier {
                D3D12_RAYTRACING_TIER_1_0 => RaytracingTier::Tier1_0,
                D3D12_RAYTRACING_TIER_1_1 => RaytracingTier::Tier1_1,
                _ => RaytracingTier::NotSupported,
            },
            variable_shading_rate_tier: match options6.VariableShadingRateTier {
                D3D12_VARIABLE_SHADING_RATE_TIER_1 => VariableShadingRateTier::Tier1,
                D3D12_VARIABLE_SHADING_RATE_TIER_2 => VariableShadingRateTier::Tier2,
                _ => VariableShadingRateTier::NotSupported,
            },
            mesh_shader_tier: match options7.MeshShaderTier {
                D3D12_MESH_SHADER_TIER_1 => MeshShaderTier::Tier1,
                _ => MeshShaderTier::NotSupported,
            },
            sampler_feedback_tier: match options7.SamplerFeedbackTier {
                D3D12_SAMPLER_FEEDBACK_TIER_0_9 => SamplerFeedbackTier::Tier0_9,
                D3D12_SAMPLER_FEEDBACK_TIER_1_0 => SamplerFeedbackTier::Tier1_0,
                _ => SamplerFeedbackTier::NotSupported,
            },
            enhanced_barriers: options12.EnhancedBarriersSupported.as_bool(),
            wave_lanes: WaveLaneCount {
                min: options1.WaveLaneCountMin,
                max: options1.WaveLaneCountMax,
            },
            work_graphs_tier: work_graphs_tier(options21.WorkGraphsTier.0),
        };

        debug!(adapter = %capabilities.adapter_name, "Device capabilities queried");
        Ok(capabilities)
    }
}

fn feature_level(level: D3D_FEATURE_LEVEL) -> FeatureLevel {
    match level {
        D3D_FEATURE_LEVEL_12_2 => FeatureLevel::L12_2,
        D3D_FEATURE_LEVEL_12_1 => FeatureLevel::L12_1,
        D3D_FEATURE_LEVEL_12_0 => FeatureLevel::L12_0,
        D3D_FEATURE_LEVEL_11_1 => FeatureLevel::L11_1,
        _ => FeatureLevel::L11_0,
    }
}

/// D3D12_WORK_GRAPHS_TIER：0 不支持，10 为 1.0，11 为 1.1
fn work_graphs_tier(raw: i32) -> WorkGraphsTier {
    match raw {
        11.. => WorkGraphsTier::Tier1_1,
        10 => WorkGraphsTier::Tier1_0,
        _ => WorkGraphsTier::NotSupported,
    }
}

unsafe fn highest_shader_model(device: &ID3D12Device) -> ShaderModel {
    for model in ShaderModel::PROBE_ORDER {
        let mut data = D3D12_FEATURE_DATA_SHADER_MODEL {
            HighestShaderModel: D3D_SHADER_MODEL(model.encoded() as i32),
        };
        let probed = device.CheckFeatureSupport(
            D3D12_FEATURE_SHADER_MODEL,
            &mut data as *mut _ as *mut c_void,
            size_of::<D3D12_FEATURE_DATA_SHADER_MODEL>() as u32,
        );
        if probed.is_ok() {
            return ShaderModel::from_encoded(data.HighestShaderModel.0 as u32);
        }
    }
    ShaderModel::SM_5_1
}

unsafe fn highest_root_signature(device: &ID3D12Device) -> RootSignatureVersion {
    let probes = [
        (D3D_ROOT_SIGNATURE_VERSION(3), RootSignatureVersion::V1_2),
        (D3D_ROOT_SIGNATURE_VERSION_1_1, RootSignatureVersion::V1_1),
    ];
    for (version, result) in probes {
        let mut data = D3D12_FEATURE_DATA_ROOT_SIGNATURE { HighestVersion: version };
        let probed = device.CheckFeatureSupport(
            D3D12_FEATURE_ROOT_SIGNATURE,
            &mut data as *mut _ as *mut c_void,
            size_of::<D3D12_FEATURE_DATA_ROOT_SIGNATURE>() as u32,
        );
        if probed.is_ok() && data.HighestVersion == version {
            return result;
        }
    }
    RootSignatureVersion::V1_0
}

pub fn format_support(device: &ID3D12Device, format: TextureFormat) -> Result<FormatSupport> {
    let mut data = D3D12_FEATURE_DATA_FORMAT_SUPPORT {
        Format: dxgi_format(format),
        ..Default::default()
    };
    unsafe {
        check(
            "CheckFeatureSupport(FORMAT_SUPPORT)",
            device.CheckFeatureSupport(
                D3D12_FEATURE_FORMAT_SUPPORT,
                &mut data as *mut _ as *mut c_void,
                size_of::<D3D12_FEATURE_DATA_FORMAT_SUPPORT>() as u32,
            ),
        )?;
    }

    Ok(FormatSupport {
        render_target: (data.Support1 & D3D12_FORMAT_SUPPORT1_RENDER_TARGET) == D3D12_FORMAT_SUPPORT1_RENDER_TARGET,
        typed_uav_store: (data.Support2 & D3D12_FORMAT_SUPPORT2_UAV_TYPED_STORE)
            == D3D12_FORMAT_SUPPORT2_UAV_TYPED_STORE,
        shader_sample: (data.Support1 & D3D12_FORMAT_SUPPORT1_SHADER_SAMPLE) == D3D12_FORMAT_SUPPORT1_SHADER_SAMPLE,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_work_graph_tier_values() {
        assert_eq!(work_graphs_tier(0), WorkGraphsTier::NotSupported);
        assert_eq!(work_graphs_tier(10), WorkGraphsTier::Tier1_0);
        assert_eq!(work_graphs_tier(11), WorkGraphsTier::Tier1_1);
    }

    #[test]
    fn test_feature_level_mapping() {
        assert_eq!(feature_level(D3D_FEATURE_LEVEL_12_1), FeatureLevel::L12_1);
        assert_eq!(feature_level(D3D_FEATURE_LEVEL_11_0), FeatureLevel::L11_0);
    }
}
