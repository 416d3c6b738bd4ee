use std::collections::{BTreeMap, HashMap};

use bevy::{
    prelude::*,
    render::render_resource::{BlendState, TextureFormat},
};

use crate::{
    atlas::AtlasSlot,
    render::{
        DepthState,
        RenderContext,
        RenderError,
        ShaderProgram,
        SplatUniforms,
        texture_bytes,
    },
};


#[derive(Clone, Debug, PartialEq)]
pub struct HeadlessTexture {
    pub format: TextureFormat,
    pub dimension: u32,
    pub bytes: Vec<u8>,
}


#[derive(Clone, Debug, PartialEq)]
pub struct DrawCall {
    pub program: Option<ShaderProgram>,
    pub blend: Option<BlendState>,
    pub depth: Option<DepthState>,
    pub bindings: BTreeMap<u32, AtlasSlot>,
    pub uniforms: Option<SplatUniforms>,
    pub vertex_count: u32,
    pub instance_count: u32,
}


/// CPU side render context. Textures are plain byte buffers and draws are
/// recorded instead of executed.
#[derive(Debug, Default)]
pub struct HeadlessContext {
    pub camera_position: Vec3,
    pub textures: HashMap<AtlasSlot, HeadlessTexture>,
    pub draws: Vec<DrawCall>,
    pub allocations: usize,
    pub writes: usize,

    program: Option<ShaderProgram>,
    blend_stack: Vec<BlendState>,
    depth_stack: Vec<DepthState>,
    bindings: BTreeMap<u32, AtlasSlot>,
    uniforms: Option<SplatUniforms>,
    failing_allocations: usize,
    failing_draws: usize,
}

impl HeadlessContext {
    pub fn new(camera_position: Vec3) -> Self {
        Self {
            camera_position,
            ..default()
        }
    }

    /// The next `count` non-empty allocations fail.
    pub fn fail_allocations(&mut self, count: usize) {
        self.failing_allocations = count;
    }

    pub fn fail_draws(&mut self, count: usize) {
        self.failing_draws = count;
    }

    pub fn texture(&self, slot: AtlasSlot) -> Option<&HeadlessTexture> {
        self.textures.get(&slot)
    }

    pub fn last_draw(&self) -> Option<&DrawCall> {
        self.draws.last()
    }

    /// True once every pushed blend and depth state was popped again.
    pub fn state_restored(&self) -> bool {
        self.blend_stack.is_empty() && self.depth_stack.is_empty()
    }

    /// Indices stored in an integer sorted index texture.
    pub fn sorted_indices(&self) -> Option<Vec<u32>> {
        let texture = self.texture(AtlasSlot::SortedIndex)?;
        (texture.format == TextureFormat::R32Uint).then(|| {
            texture
                .bytes
                .chunks_exact(4)
                .map(bytemuck::pod_read_unaligned::<u32>)
                .collect()
        })
    }
}

impl RenderContext for HeadlessContext {
    fn camera_position(&self) -> Vec3 {
        self.camera_position
    }

    fn allocate_texture(
        &mut self,
        slot: AtlasSlot,
        format: TextureFormat,
        dimension: u32,
    ) -> Result<(), RenderError> {
        if dimension == 0 {
            self.textures.remove(&slot);
            return Ok(());
        }

        if self.failing_allocations > 0 {
            self.failing_allocations -= 1;
            self.textures.remove(&slot);
            return Err(RenderError::TextureAllocation { slot, dimension });
        }

        self.allocations += 1;
        self.textures.insert(
            slot,
            HeadlessTexture {
                format,
                dimension,
                bytes: vec![0; texture_bytes(format, dimension)],
            },
        );

        Ok(())
    }

    fn write_texture(&mut self, slot: AtlasSlot, bytes: &[u8]) -> Result<(), RenderError> {
        let texture = self
            .textures
            .get_mut(&slot)
            .ok_or(RenderError::MissingTexture { slot })?;

        if texture.bytes.len() != bytes.len() {
            return Err(RenderError::TextureSize {
                slot,
                expected: texture.bytes.len(),
                actual: bytes.len(),
            });
        }

        texture.bytes.copy_from_slice(bytes);
        self.writes += 1;

        Ok(())
    }

    fn bind_program(&mut self, program: ShaderProgram) -> Result<(), RenderError> {
        self.program = Some(program);
        self.bindings.clear();
        Ok(())
    }

    fn push_blend(&mut self, blend: BlendState) {
        self.blend_stack.push(blend);
    }

    fn pop_blend(&mut self) {
        self.blend_stack.pop();
    }

    fn push_depth(&mut self, depth: DepthState) {
        self.depth_stack.push(depth);
    }

    fn pop_depth(&mut self) {
        self.depth_stack.pop();
    }

    fn bind_texture(&mut self, slot: AtlasSlot, unit: u32) -> Result<(), RenderError> {
        if !self.textures.contains_key(&slot) {
            return Err(RenderError::MissingTexture { slot });
        }

        self.bindings.insert(unit, slot);
        Ok(())
    }

    fn set_uniforms(&mut self, uniforms: &SplatUniforms) {
        self.uniforms = Some(*uniforms);
    }

    fn draw_instanced(&mut self, vertex_count: u32, instance_count: u32) -> Result<(), RenderError> {
        if self.failing_draws > 0 {
            self.failing_draws -= 1;
            return Err(RenderError::Draw("injected failure".into()));
        }

        self.draws.push(DrawCall {
            program: self.program,
            blend: self.blend_stack.last().copied(),
            depth: self.depth_stack.last().copied(),
            bindings: self.bindings.clone(),
            uniforms: self.uniforms,
            vertex_count,
            instance_count,
        });

        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_must_match_allocation() {
        let mut ctx = HeadlessContext::default();
        ctx.allocate_texture(AtlasSlot::SortedIndex, TextureFormat::R32Uint, 2).unwrap();

        assert!(ctx.write_texture(AtlasSlot::SortedIndex, &[0; 16]).is_ok());
        assert!(matches!(
            ctx.write_texture(AtlasSlot::SortedIndex, &[0; 8]),
            Err(RenderError::TextureSize { expected: 16, actual: 8, .. })
        ));
        assert!(matches!(
            ctx.write_texture(AtlasSlot::Attributes, &[0; 8]),
            Err(RenderError::MissingTexture { .. })
        ));
    }

    #[test]
    fn injected_allocation_failures_run_out() {
        let mut ctx = HeadlessContext::default();
        ctx.fail_allocations(1);

        assert!(ctx.allocate_texture(AtlasSlot::Attributes, TextureFormat::Rgba16Float, 4).is_err());
        assert!(ctx.texture(AtlasSlot::Attributes).is_none());

        assert!(ctx.allocate_texture(AtlasSlot::Attributes, TextureFormat::Rgba16Float, 4).is_ok());
        assert_eq!(ctx.texture(AtlasSlot::Attributes).unwrap().bytes.len(), 16 * 8);
    }

    #[test]
    fn zero_dimension_releases_texture() {
        let mut ctx = HeadlessContext::default();
        ctx.allocate_texture(AtlasSlot::ShDeg3, TextureFormat::Rgba16Float, 2).unwrap();
        ctx.allocate_texture(AtlasSlot::ShDeg3, TextureFormat::Rgba16Float, 0).unwrap();

        assert!(ctx.texture(AtlasSlot::ShDeg3).is_none());
        assert_eq!(ctx.allocations, 1);
    }

    #[test]
    fn draw_records_current_state() {
        let mut ctx = HeadlessContext::default();
        ctx.allocate_texture(AtlasSlot::Attributes, TextureFormat::Rgba16Float, 2).unwrap();

        ctx.bind_program(ShaderProgram::Main).unwrap();
        ctx.push_blend(crate::render::splat_blend_state());
        ctx.bind_texture(AtlasSlot::Attributes, 1).unwrap();
        ctx.draw_instanced(6, 3).unwrap();
        ctx.pop_blend();

        let draw = ctx.last_draw().unwrap();
        assert_eq!(draw.program, Some(ShaderProgram::Main));
        assert_eq!(draw.blend, Some(crate::render::splat_blend_state()));
        assert_eq!(draw.depth, None);
        assert_eq!(draw.bindings.get(&1), Some(&AtlasSlot::Attributes));
        assert_eq!(draw.instance_count, 3);
        assert!(ctx.state_restored());
    }
}
