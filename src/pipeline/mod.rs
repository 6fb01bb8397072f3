//! Deferred pass schedule and fixed-function state per pass.
//!
//! Shader packages route their material nodes into numbered pass slots; this
//! module owns the slot numbering, the execution order of the passes and the
//! attachment/blend/depth state each one uses. Slots for passes the renderer
//! does not execute yet (shadows, distortion, water) are reserved so package
//! routing tables keep their indices.

pub mod bindings;
pub mod cache;

use ash::vk;

/// Number of pass slots a routing node carries. Reserved slots included.
pub const PASS_COUNT: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PassName {
    /// Depth-only pre-pass for opaque geometry.
    ZOpaque,
    /// Geometry attributes into the G-buffer.
    GOpaque,
    /// Reconstruct per-pixel view-space position from depth.
    LightingOpaqueViewPosition,
    /// Accumulate diffuse and specular light.
    LightingOpaque,
    /// Final shading, semi-transparent geometry blended on top.
    CompositeSemiTransparency,
    // Reserved slots, routed but never executed.
    Shadow,
    Distortion,
    Water,
}

impl PassName {
    /// Slot index inside a routing node's pass table.
    pub fn slot(self) -> usize {
        match self {
            PassName::ZOpaque => 0,
            PassName::GOpaque => 1,
            PassName::Shadow => 2,
            PassName::LightingOpaqueViewPosition => 3,
            PassName::LightingOpaque => 4,
            PassName::Distortion => 5,
            PassName::Water => 6,
            PassName::CompositeSemiTransparency => 7,
        }
    }
}

/// Executed passes, in submission order within a frame.
pub const PASS_ORDER: [PassName; 5] = [
    PassName::ZOpaque,
    PassName::GOpaque,
    PassName::LightingOpaqueViewPosition,
    PassName::LightingOpaque,
    PassName::CompositeSemiTransparency,
];

/// Fixed-function state for one pass, consumed at pipeline build time.
#[derive(Debug, Clone, Copy)]
pub struct PassSpec {
    pub name: PassName,
    pub color_count: usize,
    pub color_format: vk::Format,
    pub has_depth: bool,
    pub depth_test: bool,
    pub depth_write: bool,
    pub blend: bool,
}

impl PassSpec {
    pub fn for_pass(name: PassName) -> PassSpec {
        match name {
            PassName::ZOpaque => PassSpec {
                name,
                color_count: 1,
                color_format: vk::Format::R8G8B8A8_UNORM,
                has_depth: true,
                depth_test: true,
                depth_write: true,
                blend: false,
            },
            PassName::GOpaque => PassSpec {
                name,
                color_count: 5,
                color_format: vk::Format::R8G8B8A8_UNORM,
                has_depth: true,
                depth_test: true,
                depth_write: true,
                blend: false,
            },
            PassName::LightingOpaqueViewPosition => PassSpec {
                name,
                color_count: 1,
                color_format: vk::Format::R16G16B16A16_SFLOAT,
                has_depth: false,
                depth_test: false,
                depth_write: false,
                blend: false,
            },
            PassName::LightingOpaque => PassSpec {
                name,
                color_count: 2,
                color_format: vk::Format::R16G16B16A16_SFLOAT,
                has_depth: false,
                depth_test: false,
                depth_write: false,
                blend: false,
            },
            PassName::CompositeSemiTransparency => PassSpec {
                name,
                color_count: 1,
                color_format: vk::Format::B8G8R8A8_SRGB,
                has_depth: true,
                depth_test: true,
                depth_write: false,
                blend: true,
            },
            // Reserved passes carry placeholder state.
            PassName::Shadow | PassName::Distortion | PassName::Water => PassSpec {
                name,
                color_count: 1,
                color_format: vk::Format::R8G8B8A8_UNORM,
                has_depth: true,
                depth_test: true,
                depth_write: true,
                blend: false,
            },
        }
    }

    pub fn color_formats(&self) -> Vec<vk::Format> {
        vec![self.color_format; self.color_count]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_are_unique_and_in_range() {
        let all = [
            PassName::ZOpaque,
            PassName::GOpaque,
            PassName::Shadow,
            PassName::LightingOpaqueViewPosition,
            PassName::LightingOpaque,
            PassName::Distortion,
            PassName::Water,
            PassName::CompositeSemiTransparency,
        ];
        let mut seen = [false; PASS_COUNT];
        for pass in all {
            let slot = pass.slot();
            assert!(slot < PASS_COUNT);
            assert!(!seen[slot], "duplicate slot {slot}");
            seen[slot] = true;
        }
    }

    #[test]
    fn executed_passes_match_expected_attachment_counts() {
        assert_eq!(PassSpec::for_pass(PassName::ZOpaque).color_count, 1);
        assert_eq!(PassSpec::for_pass(PassName::GOpaque).color_count, 5);
        assert_eq!(PassSpec::for_pass(PassName::LightingOpaque).color_count, 2);
        let composite = PassSpec::for_pass(PassName::CompositeSemiTransparency);
        assert!(composite.blend);
        assert!(composite.depth_test);
        assert!(!composite.depth_write);
        let view_pos = PassSpec::for_pass(PassName::LightingOpaqueViewPosition);
        assert!(!view_pos.has_depth);
    }
}
