//! Samplers as kernel arguments.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddressingMode {
    None,
    #[default]
    ClampToEdge,
    /// Clamp to border colour.
    Clamp,
    Repeat,
    MirroredRepeat,
}

impl AddressingMode {
    /// Value the kernel reads from its addressing-mode slot.
    #[must_use]
    pub const fn patch_value(self) -> u32 {
        match self {
            Self::None => 0x00,
            Self::Clamp => 0x01,
            Self::ClampToEdge => 0x02,
            Self::Repeat => 0x03,
            Self::MirroredRepeat => 0x04,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterMode {
    #[default]
    Nearest,
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Sampler {
    pub normalized_coords: bool,
    pub addressing_mode: AddressingMode,
    pub filter_mode: FilterMode,
}

impl Sampler {
    #[must_use]
    pub const fn normalized_coords_value(&self) -> u32 {
        if self.normalized_coords { 0x08 } else { 0x00 }
    }

    /// Clamp-to-border with nearest filtering needs the coordinate snap
    /// workaround enabled in the kernel.
    #[must_use]
    pub const fn snap_workaround_value(&self) -> u32 {
        match (self.addressing_mode, self.filter_mode) {
            (AddressingMode::Clamp, FilterMode::Nearest) => u32::MAX,
            _ => 0,
        }
    }
}

/// Produces sampler-state records.
pub trait SamplerStateEncoder: Send + Sync + fmt::Debug {
    /// A blob of exactly `sampler_state_size` bytes describing `sampler`.
    fn encode(&self, sampler: &Sampler, sampler_state_size: usize) -> Vec<u8>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BasicSamplerStateEncoder;

impl SamplerStateEncoder for BasicSamplerStateEncoder {
    fn encode(&self, sampler: &Sampler, sampler_state_size: usize) -> Vec<u8> {
        let filter = match sampler.filter_mode {
            FilterMode::Nearest => 0u32,
            FilterMode::Linear => 1,
        };
        let mut blob = Vec::with_capacity(sampler_state_size);
        for value in [
            sampler.addressing_mode.patch_value(),
            filter,
            u32::from(sampler.normalized_coords),
        ] {
            blob.extend_from_slice(&value.to_le_bytes());
        }
        blob.resize(sampler_state_size, 0);
        blob
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snap_workaround_only_for_clamp_nearest() {
        let clamp_nearest = Sampler {
            addressing_mode: AddressingMode::Clamp,
            filter_mode: FilterMode::Nearest,
            normalized_coords: false,
        };
        assert_eq!(clamp_nearest.snap_workaround_value(), u32::MAX);
        let clamp_linear = Sampler {
            filter_mode: FilterMode::Linear,
            ..clamp_nearest
        };
        assert_eq!(clamp_linear.snap_workaround_value(), 0);
        assert_eq!(Sampler::default().snap_workaround_value(), 0);
    }

    #[test]
    fn encoder_respects_state_size() {
        let blob = BasicSamplerStateEncoder.encode(&Sampler::default(), 16);
        assert_eq!(blob.len(), 16);
        assert_eq!(&blob[..4], &AddressingMode::ClampToEdge.patch_value().to_le_bytes());
    }
}
