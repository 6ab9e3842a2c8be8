//! Hardware table: GPU model -> provider and instance-type naming.
//!
//! Instance type naming:
//! - CloudRift: `{base}.{gpu_count}`, e.g. `rtx49-10c-kn.4`
//! - GCP: `{base}-{gpu_count}g`, e.g. `a3-highgpu-8g`
//! - GCP g4: `g4-standard-{gpu_count * 48}`, e.g. `g4-standard-192`

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::CoreError;

/// Cloud provider backing a GPU model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// REST-based spot-style provider.
    CloudRift,
    /// Google Cloud via the `gcloud` CLI.
    Gcp,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CloudRift => f.write_str("cloudrift"),
            Self::Gcp => f.write_str("gcp"),
        }
    }
}

/// One candidate placement for a GPU model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceCandidate {
    pub provider: ProviderKind,
    pub base_instance_type: &'static str,
}

impl InstanceCandidate {
    /// Full instance type name for a given GPU count.
    pub fn instance_type(&self, gpu_count: u32) -> String {
        match self.provider {
            ProviderKind::CloudRift => format!("{}.{}", self.base_instance_type, gpu_count),
            ProviderKind::Gcp if self.base_instance_type == "g4-standard" => {
                format!("g4-standard-{}", gpu_count * 48)
            }
            ProviderKind::Gcp => format!("{}-{}g", self.base_instance_type, gpu_count),
        }
    }
}

const fn rift(base: &'static str) -> InstanceCandidate {
    InstanceCandidate {
        provider: ProviderKind::CloudRift,
        base_instance_type: base,
    }
}

const fn gcp(base: &'static str) -> InstanceCandidate {
    InstanceCandidate {
        provider: ProviderKind::Gcp,
        base_instance_type: base,
    }
}

/// GPU model -> candidates in preference order.
static GPU_INSTANCE_TYPES: &[(&str, &[InstanceCandidate])] = &[
    (
        "NVIDIA GeForce RTX 4090",
        &[
            rift("rtx49-10c-kn"),
            rift("rtx49-7-50-500-nr"),
            rift("rtx49-15-80-400-ec"),
            rift("rtx49-7c-kn"),
        ],
    ),
    (
        "NVIDIA GeForce RTX 5090",
        &[
            rift("rtx59-7-50-400-ec"),
            rift("rtx59-15-80-400-ec"),
            rift("rtx59-16c-nr"),
            rift("rtx59-11-56-850-1lg"),
        ],
    ),
    (
        "NVIDIA RTX PRO 6000 Workstation Edition",
        &[
            rift("rtxpro6000-12-100-1500-nr"),
            rift("rtxpro6000-4-100-1000-ti"),
            rift("rtxpro6000-11-50-500-1l"),
        ],
    ),
    ("NVIDIA RTX PRO 6000 Server Edition", &[gcp("g4-standard")]),
    ("NVIDIA L40S", &[rift("l40s-24c-kn")]),
    ("NVIDIA H100 80GB", &[gcp("a3-highgpu")]),
    ("NVIDIA H200 141GB", &[gcp("a3-ultragpu")]),
    ("NVIDIA B200", &[gcp("a4-highgpu")]),
    ("NVIDIA A100 40GB", &[gcp("a2-highgpu")]),
    ("NVIDIA A100 80GB", &[gcp("a2-ultragpu")]),
    ("AMD Instinct MI350X", &[rift("mi350x-15-250-1000-gv")]),
];

static GPU_SHORT_NAMES: &[(&str, &str)] = &[
    ("NVIDIA GeForce RTX 4090", "rtx4090"),
    ("NVIDIA GeForce RTX 5090", "rtx5090"),
    ("NVIDIA RTX PRO 6000 Workstation Edition", "pro6000"),
    ("NVIDIA RTX PRO 6000 Server Edition", "pro6000"),
    ("NVIDIA L40S", "l40s"),
    ("NVIDIA H100 80GB", "h100"),
    ("NVIDIA H200 141GB", "h200"),
    ("NVIDIA B200", "b200"),
    ("NVIDIA A100 40GB", "a100"),
    ("NVIDIA A100 80GB", "a100"),
    ("AMD Instinct MI350X", "mi350x"),
];

/// All candidates for a GPU model, in preference order.
pub fn candidates(gpu_name: &str) -> Result<&'static [InstanceCandidate], CoreError> {
    GPU_INSTANCE_TYPES
        .iter()
        .find(|(name, _)| *name == gpu_name)
        .map(|(_, candidates)| *candidates)
        .ok_or_else(|| CoreError::UnknownGpu(gpu_name.to_string()))
}

/// Preferred candidate for a GPU model.
pub fn resolve(gpu_name: &str) -> Result<InstanceCandidate, CoreError> {
    candidates(gpu_name)?
        .first()
        .copied()
        .ok_or_else(|| CoreError::UnknownGpu(gpu_name.to_string()))
}

/// Short GPU name for variant labels and file names.
///
/// Falls back to the lower-cased alphanumeric characters of the full name.
pub fn gpu_short_name(full_name: &str) -> String {
    if let Some((_, short)) = GPU_SHORT_NAMES.iter().find(|(name, _)| *name == full_name) {
        return (*short).to_string();
    }
    full_name
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cloudrift_instance_type() {
        let candidate = resolve("NVIDIA GeForce RTX 4090").unwrap();
        assert_eq!(candidate.provider, ProviderKind::CloudRift);
        assert_eq!(candidate.instance_type(4), "rtx49-10c-kn.4");
    }

    #[test]
    fn test_gcp_instance_type() {
        let candidate = resolve("NVIDIA H100 80GB").unwrap();
        assert_eq!(candidate.provider, ProviderKind::Gcp);
        assert_eq!(candidate.instance_type(8), "a3-highgpu-8g");
    }

    #[test]
    fn test_g4_standard_scales_with_gpu_count() {
        let candidate = resolve("NVIDIA RTX PRO 6000 Server Edition").unwrap();
        assert_eq!(candidate.instance_type(4), "g4-standard-192");
        assert_eq!(candidate.instance_type(1), "g4-standard-48");
    }

    #[test]
    fn test_unknown_gpu() {
        let err = resolve("NVIDIA Imaginary 9000").unwrap_err();
        assert!(matches!(err, CoreError::UnknownGpu(_)));
    }

    #[test]
    fn test_multiple_candidates_keep_order() {
        let all = candidates("NVIDIA GeForce RTX 5090").unwrap();
        assert_eq!(all.len(), 4);
        assert_eq!(all[0].base_instance_type, "rtx59-7-50-400-ec");
    }

    #[test]
    fn test_short_names() {
        assert_eq!(gpu_short_name("NVIDIA GeForce RTX 5090"), "rtx5090");
        assert_eq!(gpu_short_name("NVIDIA A100 80GB"), "a100");
        assert_eq!(gpu_short_name("Some New-GPU 12"), "somenewgpu12");
    }
}
