use bevy::{
    prelude::*,
    render::render_resource::{
        BlendComponent,
        BlendFactor,
        BlendOperation,
        BlendState,
        TextureFormat,
    },
};
use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};
use static_assertions::const_assert_eq;

use crate::atlas::AtlasSlot;

pub mod headless;
pub mod image;


/// One splat quad: two triangles.
pub const SPLAT_VERTEX_COUNT: u32 = 6;


#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("failed to allocate {slot:?} texture with side {dimension}")]
    TextureAllocation {
        slot: AtlasSlot,
        dimension: u32,
    },
    #[error("{slot:?} texture is not allocated")]
    MissingTexture {
        slot: AtlasSlot,
    },
    #[error("{slot:?} texture holds {expected} bytes, got {actual}")]
    TextureSize {
        slot: AtlasSlot,
        expected: usize,
        actual: usize,
    },
    #[error("shader program {0:?} is unavailable")]
    MissingProgram(ShaderProgram),
    #[error("draw failed: {0}")]
    Draw(String),
}


#[derive(
    Clone,
    Copy,
    Debug,
    Eq,
    Hash,
    PartialEq,
    Reflect,
    Serialize,
    Deserialize,
)]
pub enum ShaderProgram {
    Main,
    /// point preview, owned by adapters
    Wire,
}


#[derive(
    Clone,
    Copy,
    Debug,
    Eq,
    PartialEq,
)]
pub struct DepthState {
    pub test: bool,
    pub write: bool,
}


/// `(1 - dst_alpha, 1)` with add for both color and alpha. Splats are drawn
/// front to back, each one filling what earlier splats left uncovered.
pub fn splat_blend_state() -> BlendState {
    let component = BlendComponent {
        src_factor: BlendFactor::OneMinusDstAlpha,
        dst_factor: BlendFactor::One,
        operation: BlendOperation::Add,
    };

    BlendState {
        color: component,
        alpha: component,
    }
}

pub fn splat_depth_state() -> DepthState {
    DepthState {
        test: true,
        write: false,
    }
}


/// Uniform block of the main splat program. Dimensions of atlases that were
/// not allocated are 0.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Pod,
    Zeroable,
)]
#[repr(C)]
pub struct SplatUniforms {
    pub origin: [f32; 3],
    pub splat_count: u32,

    pub world_camera_position: [f32; 3],
    pub vertex_count: u32,

    pub sorted_index_dimension: u32,
    pub attributes_dimension: u32,
    /// degree 1 and 2 (or combined) atlas, then degree 3 atlas
    pub sh_dimensions: [u32; 2],

    pub sh_order: u32,
    pub sh_enabled: u32,
    pub index_normalized: u32,
    pub _pad: u32,
}

const_assert_eq!(std::mem::size_of::<SplatUniforms>(), 64);


/// What the compositor needs from the host graphics context. Every call that
/// touches a GPU resource may fail; the compositor then skips the frame.
pub trait RenderContext {
    /// World space position of the viewing camera.
    fn camera_position(&self) -> Vec3;

    /// (Re)allocates the texture behind `slot`. A zero `dimension` releases it.
    fn allocate_texture(
        &mut self,
        slot: AtlasSlot,
        format: TextureFormat,
        dimension: u32,
    ) -> Result<(), RenderError>;

    /// Replaces the whole contents of an allocated texture.
    fn write_texture(&mut self, slot: AtlasSlot, bytes: &[u8]) -> Result<(), RenderError>;

    fn bind_program(&mut self, program: ShaderProgram) -> Result<(), RenderError>;

    fn push_blend(&mut self, blend: BlendState);
    fn pop_blend(&mut self);

    fn push_depth(&mut self, depth: DepthState);
    fn pop_depth(&mut self);

    fn bind_texture(&mut self, slot: AtlasSlot, unit: u32) -> Result<(), RenderError>;

    fn set_uniforms(&mut self, uniforms: &SplatUniforms);

    fn draw_instanced(&mut self, vertex_count: u32, instance_count: u32) -> Result<(), RenderError>;
}


/// Bytes of a square texture of side `dimension`.
pub fn texture_bytes(format: TextureFormat, dimension: u32) -> usize {
    let texel = format.block_copy_size(None).unwrap_or(0) as usize;
    (dimension as usize).pow(2) * texel
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blend_fills_behind_existing_coverage() {
        let blend = splat_blend_state();

        assert_eq!(blend.color, blend.alpha);
        assert_eq!(blend.color.src_factor, BlendFactor::OneMinusDstAlpha);
        assert_eq!(blend.color.dst_factor, BlendFactor::One);
        assert_eq!(blend.color.operation, BlendOperation::Add);
    }

    #[test]
    fn depth_is_tested_not_written() {
        let depth = splat_depth_state();
        assert!(depth.test);
        assert!(!depth.write);
    }

    #[test]
    fn texture_byte_sizes() {
        assert_eq!(texture_bytes(TextureFormat::Rgba16Float, 4), 16 * 8);
        assert_eq!(texture_bytes(TextureFormat::R32Uint, 8), 64 * 4);
        assert_eq!(texture_bytes(TextureFormat::R32Float, 0), 0);
    }
}
