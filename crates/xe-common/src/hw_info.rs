//! Hardware description and the per-family traits registry.
//!
//! Family-specific constants (state record sizes, walker variant, GRF layout,
//! prefetch slack) live in a process-wide table keyed by [`HwFamily`]. The
//! table is built on first access and is read-only afterwards.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::OnceLock;

use crate::math::{KB, PAGE_SIZE};

/// GPU core family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HwFamily {
    Gen9,
    Gen12Lp,
    XeHpg,
    XeHpc,
}

impl HwFamily {
    pub const ALL: [Self; 4] = [Self::Gen9, Self::Gen12Lp, Self::XeHpg, Self::XeHpc];
}

impl std::fmt::Display for HwFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Gen9 => write!(f, "gen9"),
            Self::Gen12Lp => write!(f, "gen12lp"),
            Self::XeHpg => write!(f, "xehpg"),
            Self::XeHpc => write!(f, "xehpc"),
        }
    }
}

impl std::str::FromStr for HwFamily {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "gen9" => Ok(Self::Gen9),
            "gen12lp" => Ok(Self::Gen12Lp),
            "xehpg" => Ok(Self::XeHpg),
            "xehpc" => Ok(Self::XeHpc),
            other => Err(format!("unknown hardware family: {other}")),
        }
    }
}

/// Which walker command the family uses to launch a dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkerKind {
    /// Interface descriptor lives in the dynamic state heap and is loaded
    /// with a separate command before the walker.
    GpgpuWalker,
    /// Interface descriptor is carried inline in the walker.
    ComputeWalker,
}

/// Per-family constants consumed by the encoder and payload builder.
#[derive(Debug, Clone, PartialEq)]
pub struct FamilyTraits {
    pub family: HwFamily,
    pub name: &'static str,
    pub walker: WalkerKind,
    pub surface_state_size: usize,
    pub sampler_state_size: usize,
    pub interface_descriptor_size: usize,
    pub surface_state_alignment: usize,
    pub indirect_object_alignment: usize,
    pub grf_size: usize,
    pub default_grf_count: u32,
    pub large_grf_count: u32,
    /// Bytes appended to ISA allocations so instruction prefetch stays in bounds.
    pub isa_padding: usize,
    /// Slack appended to command buffers for command-streamer prefetch.
    pub command_stream_overfetch: usize,
    pub supports_aux_translation: bool,
    pub supports_timestamp_packets: bool,
    pub supports_bindless: bool,
    pub supports_large_grf: bool,
    pub timestamp_period_ns: f64,
}

impl FamilyTraits {
    /// Mask applied to the 64-bit GPU timestamp counter.
    #[must_use]
    pub const fn timestamp_valid_bits(&self) -> u32 {
        match self.family {
            HwFamily::Gen9 | HwFamily::Gen12Lp => 36,
            HwFamily::XeHpg | HwFamily::XeHpc => 64,
        }
    }
}

fn builtin_families() -> HashMap<HwFamily, FamilyTraits> {
    let gen9 = FamilyTraits {
        family: HwFamily::Gen9,
        name: "Gen9",
        walker: WalkerKind::GpgpuWalker,
        surface_state_size: 64,
        sampler_state_size: 16,
        interface_descriptor_size: 64,
        surface_state_alignment: 64,
        indirect_object_alignment: 64,
        grf_size: 32,
        default_grf_count: 128,
        large_grf_count: 128,
        isa_padding: 512,
        command_stream_overfetch: PAGE_SIZE,
        supports_aux_translation: false,
        supports_timestamp_packets: false,
        supports_bindless: false,
        supports_large_grf: false,
        timestamp_period_ns: 83.333,
    };
    let gen12lp = FamilyTraits {
        family: HwFamily::Gen12Lp,
        name: "Gen12LP",
        supports_aux_translation: true,
        supports_timestamp_packets: true,
        timestamp_period_ns: 52.083,
        ..gen9.clone()
    };
    let xe_hpg = FamilyTraits {
        family: HwFamily::XeHpg,
        name: "XeHPG",
        walker: WalkerKind::ComputeWalker,
        isa_padding: 3 * KB,
        supports_bindless: true,
        supports_large_grf: true,
        large_grf_count: 256,
        timestamp_period_ns: 41.666,
        ..gen12lp.clone()
    };
    let xe_hpc = FamilyTraits {
        family: HwFamily::XeHpc,
        name: "XeHPC",
        grf_size: 64,
        supports_aux_translation: false,
        timestamp_period_ns: 26.666,
        ..xe_hpg.clone()
    };
    [gen9, gen12lp, xe_hpg, xe_hpc]
        .into_iter()
        .map(|traits| (traits.family, traits))
        .collect()
}

static FAMILY_REGISTRY: OnceLock<HashMap<HwFamily, FamilyTraits>> = OnceLock::new();

fn registry() -> &'static HashMap<HwFamily, FamilyTraits> {
    FAMILY_REGISTRY.get_or_init(builtin_families)
}

/// Look up the traits for a family.
///
/// Every [`HwFamily`] variant is registered, so this cannot fail.
#[must_use]
pub fn family_traits(family: HwFamily) -> &'static FamilyTraits {
    &registry()[&family]
}

/// Families present in the registry, sorted.
#[must_use]
pub fn registered_families() -> Vec<HwFamily> {
    let mut families: Vec<_> = registry().keys().copied().collect();
    families.sort();
    families
}

/// Feature flags reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FeatureTable {
    pub ftr_local_memory: bool,
    pub ftr_kmd_migration: bool,
    pub ftr_svm: bool,
    pub ftr_render_compressed_buffers: bool,
}

/// Description of one GPU device instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HwInfo {
    pub family: HwFamily,
    pub device_name: String,
    pub eu_count: u32,
    pub subslice_count: u32,
    pub threads_per_eu: u32,
    pub max_work_group_size: u32,
    pub slm_size_bytes: u32,
    pub features: FeatureTable,
}

impl HwInfo {
    /// A representative configuration for `family`.
    #[must_use]
    pub fn for_family(family: HwFamily) -> Self {
        match family {
            HwFamily::Gen9 => Self {
                family,
                device_name: "Gen9 GT2".into(),
                eu_count: 24,
                subslice_count: 3,
                threads_per_eu: 7,
                max_work_group_size: 256,
                slm_size_bytes: 64 * 1024,
                features: FeatureTable {
                    ftr_svm: true,
                    ..FeatureTable::default()
                },
            },
            HwFamily::Gen12Lp => Self {
                family,
                device_name: "Gen12LP GT2".into(),
                eu_count: 96,
                subslice_count: 12,
                threads_per_eu: 7,
                max_work_group_size: 512,
                slm_size_bytes: 64 * 1024,
                features: FeatureTable {
                    ftr_svm: true,
                    ftr_render_compressed_buffers: true,
                    ..FeatureTable::default()
                },
            },
            HwFamily::XeHpg => Self {
                family,
                device_name: "XeHPG 512EU".into(),
                eu_count: 512,
                subslice_count: 32,
                threads_per_eu: 8,
                max_work_group_size: 1024,
                slm_size_bytes: 64 * 1024,
                features: FeatureTable {
                    ftr_local_memory: true,
                    ftr_kmd_migration: false,
                    ftr_svm: true,
                    ftr_render_compressed_buffers: true,
                },
            },
            HwFamily::XeHpc => Self {
                family,
                device_name: "XeHPC 1-tile".into(),
                eu_count: 448,
                subslice_count: 56,
                threads_per_eu: 8,
                max_work_group_size: 1024,
                slm_size_bytes: 128 * 1024,
                features: FeatureTable {
                    ftr_local_memory: true,
                    ftr_kmd_migration: true,
                    ftr_svm: true,
                    ftr_render_compressed_buffers: false,
                },
            },
        }
    }

    #[must_use]
    pub fn traits(&self) -> &'static FamilyTraits {
        family_traits(self.family)
    }

    #[must_use]
    pub const fn eus_per_subslice(&self) -> u32 {
        if self.subslice_count == 0 {
            self.eu_count
        } else {
            self.eu_count / self.subslice_count
        }
    }

    /// Hardware threads a single work-group may occupy.
    #[must_use]
    pub const fn max_threads_per_subslice(&self) -> u32 {
        self.eus_per_subslice() * self.threads_per_eu
    }

    #[must_use]
    pub const fn total_hw_threads(&self) -> u32 {
        self.eu_count * self.threads_per_eu
    }
}

impl Default for HwInfo {
    fn default() -> Self {
        Self::for_family(HwFamily::Gen12Lp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_family_is_registered() {
        assert_eq!(registered_families(), HwFamily::ALL.to_vec());
        for family in HwFamily::ALL {
            assert_eq!(family_traits(family).family, family);
        }
    }

    #[test]
    fn registry_returns_same_static_entry() {
        let a = family_traits(HwFamily::XeHpg) as *const FamilyTraits;
        let b = family_traits(HwFamily::XeHpg) as *const FamilyTraits;
        assert_eq!(a, b);
    }

    #[test]
    fn walker_variant_by_family() {
        assert_eq!(family_traits(HwFamily::Gen9).walker, WalkerKind::GpgpuWalker);
        assert_eq!(family_traits(HwFamily::Gen12Lp).walker, WalkerKind::GpgpuWalker);
        assert_eq!(family_traits(HwFamily::XeHpg).walker, WalkerKind::ComputeWalker);
        assert!(!family_traits(HwFamily::Gen9).supports_timestamp_packets);
        assert!(family_traits(HwFamily::Gen12Lp).supports_aux_translation);
    }

    #[test]
    fn family_display_roundtrip() {
        for family in HwFamily::ALL {
            let parsed: HwFamily = family.to_string().parse().unwrap();
            assert_eq!(parsed, family);
        }
        assert!("gen7".parse::<HwFamily>().is_err());
    }

    #[test]
    fn derived_thread_counts() {
        let hw = HwInfo::for_family(HwFamily::Gen12Lp);
        assert_eq!(hw.eus_per_subslice(), 8);
        assert_eq!(hw.max_threads_per_subslice(), 56);
        assert_eq!(hw.total_hw_threads(), 672);
    }
}
