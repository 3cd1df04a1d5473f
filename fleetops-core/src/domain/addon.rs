//! Addon templates

use serde::{Deserialize, Serialize};

use crate::domain::meta::ObjectMeta;

/// GPU resource name advertised by AMD nodes
pub const AMD_GPU_RESOURCE: &str = "amd.com/gpu";
/// GPU resource name advertised by NVIDIA nodes
pub const NVIDIA_GPU_RESOURCE: &str = "nvidia.com/gpu";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AddonTemplate {
    pub metadata: ObjectMeta,
    pub spec: AddonTemplateSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddonTemplateSpec {
    #[serde(default)]
    pub gpu_chip: GpuChip,

    /// Base64 encoded shell script
    #[serde(default)]
    pub action: String,

    /// A failing required addon fails the node
    #[serde(default)]
    pub required: bool,
}

/// GPU vendor an addon targets
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum GpuChip {
    #[default]
    #[serde(rename = "")]
    Any,
    #[serde(rename = "amd")]
    Amd,
    #[serde(rename = "nvidia")]
    Nvidia,
}

impl GpuChip {
    /// True if an addon for this chip applies to a node advertising `gpu_resource`
    pub fn matches(self, gpu_resource: Option<&str>) -> bool {
        match self {
            GpuChip::Any => true,
            GpuChip::Amd => gpu_resource == Some(AMD_GPU_RESOURCE),
            GpuChip::Nvidia => gpu_resource == Some(NVIDIA_GPU_RESOURCE),
        }
    }
}

impl AddonTemplate {
    pub fn name(&self) -> &str {
        &self.metadata.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gpu_chip_matching() {
        assert!(GpuChip::Any.matches(None));
        assert!(GpuChip::Amd.matches(Some(AMD_GPU_RESOURCE)));
        assert!(!GpuChip::Amd.matches(Some(NVIDIA_GPU_RESOURCE)));
        assert!(!GpuChip::Nvidia.matches(None));
    }
}
