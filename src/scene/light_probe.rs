//! Light probes

use glam::Vec3;

use super::transform::Transform;
use crate::backend::*;
use crate::resources::{Texture, LIGHT_PROBE_SIZE};

/// Captured environment around a point, sampled as ambient light
#[derive(Debug, Clone)]
pub struct LightProbe {
    pub name: String,
    pub transform: Transform,
    /// Prefiltered cube; lower mips hold rougher reflections.
    pub texture_probe: Option<Texture>,
    pub captured: bool,
}

impl LightProbe {
    pub fn new(name: &str, position: Vec3) -> Self {
        Self {
            name: name.to_string(),
            transform: Transform::from_position(position),
            texture_probe: None,
            captured: false,
        }
    }

    pub fn position(&self) -> Vec3 {
        self.transform.position()
    }

    /// Request a new capture on the next frame.
    pub fn invalidate(&mut self) {
        self.captured = false;
    }

    /// Cube descriptor the probe renders into.
    pub fn cube_descriptor(name: &str) -> TextureDescriptor {
        TextureDescriptor {
            label: name.to_string(),
            target: TextureTarget::Cube,
            width: LIGHT_PROBE_SIZE,
            height: LIGHT_PROBE_SIZE,
            depth: 1,
            format: TextureFormat::Rgba16Float,
            sampler: SamplerState {
                min_filter: FilterMode::LinearMipmapLinear,
                mag_filter: FilterMode::Linear,
                wrap: WrapMode::ClampToEdge,
                ..Default::default()
            },
            attachment: true,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_cube_has_mips() {
        let desc = LightProbe::cube_descriptor("probe");
        assert_eq!(desc.layers(), 6);
        assert_eq!(desc.mip_levels(), LIGHT_PROBE_SIZE.trailing_zeros() + 1);
    }
}
