use std::collections::HashMap;

use bevy::{
    prelude::*,
    render::{
        extract_resource::ExtractResource,
        render_asset::RenderAssetUsages,
        render_resource::{
            BlendState,
            Extent3d,
            TextureDimension,
            TextureFormat,
            TextureUsages,
        },
    },
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


/// Image assets backing each allocated atlas.
#[derive(Resource, Clone, Debug, Default)]
pub struct SplatAtlasImages {
    pub handles: HashMap<AtlasSlot, Handle<Image>>,
}


#[derive(Clone, Debug, PartialEq)]
pub struct SplatTextureBinding {
    pub unit: u32,
    pub slot: AtlasSlot,
    pub image: Handle<Image>,
}

/// The frame's splat draw, handed to the render world. `instance_count` is
/// 0 when nothing is drawn.
#[derive(Resource, ExtractResource, Clone, Debug, Default)]
pub struct SplatDrawCommand {
    pub program: Option<ShaderProgram>,
    pub blend: Option<BlendState>,
    pub depth: Option<DepthState>,
    pub textures: Vec<SplatTextureBinding>,
    pub uniforms: SplatUniforms,
    pub vertex_count: u32,
    pub instance_count: u32,
}


pub struct ImageRenderContext<'a> {
    pub images: &'a mut Assets<Image>,
    pub atlas_images: &'a mut SplatAtlasImages,
    pub command: &'a mut SplatDrawCommand,
    pub camera_position: Vec3,
    blend_stack: Vec<BlendState>,
    depth_stack: Vec<DepthState>,
}

impl<'a> ImageRenderContext<'a> {
    pub fn new(
        images: &'a mut Assets<Image>,
        atlas_images: &'a mut SplatAtlasImages,
        command: &'a mut SplatDrawCommand,
        camera_position: Vec3,
    ) -> Self {
        Self {
            images,
            atlas_images,
            command,
            camera_position,
            blend_stack: Vec::new(),
            depth_stack: Vec::new(),
        }
    }

    fn handle(&self, slot: AtlasSlot) -> Result<&Handle<Image>, RenderError> {
        self.atlas_images
            .handles
            .get(&slot)
            .ok_or(RenderError::MissingTexture { slot })
    }
}

impl RenderContext for ImageRenderContext<'_> {
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
            if let Some(handle) = self.atlas_images.handles.remove(&slot) {
                self.images.remove(&handle);
            }
            return Ok(());
        }

        let mut image = Image::new(
            Extent3d {
                width: dimension,
                height: dimension,
                depth_or_array_layers: 1,
            },
            TextureDimension::D2,
            vec![0; texture_bytes(format, dimension)],
            format,
            RenderAssetUsages::default(),
        );
        image.texture_descriptor.label = Some(slot.label());
        image.texture_descriptor.usage = TextureUsages::COPY_DST | TextureUsages::TEXTURE_BINDING;

        match self.atlas_images.handles.get(&slot) {
            Some(handle) => {
                let existing = self
                    .images
                    .get_mut(handle)
                    .ok_or(RenderError::TextureAllocation { slot, dimension })?;
                *existing = image;
            }
            None => {
                let handle = self.images.add(image);
                self.atlas_images.handles.insert(slot, handle);
            }
        }

        debug!(?slot, dimension, "allocated splat atlas image");
        Ok(())
    }

    fn write_texture(&mut self, slot: AtlasSlot, bytes: &[u8]) -> Result<(), RenderError> {
        let handle = self.handle(slot)?.clone();
        let image = self
            .images
            .get_mut(&handle)
            .ok_or(RenderError::MissingTexture { slot })?;

        let data = image.data.get_or_insert_with(Vec::new);
        if data.len() != bytes.len() {
            return Err(RenderError::TextureSize {
                slot,
                expected: data.len(),
                actual: bytes.len(),
            });
        }

        data.copy_from_slice(bytes);
        Ok(())
    }

    fn bind_program(&mut self, program: ShaderProgram) -> Result<(), RenderError> {
        self.command.program = Some(program);
        self.command.textures.clear();
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
        let image = self.handle(slot)?.clone();
        self.command.textures.retain(|binding| binding.unit != unit);
        self.command.textures.push(SplatTextureBinding { unit, slot, image });
        Ok(())
    }

    fn set_uniforms(&mut self, uniforms: &SplatUniforms) {
        self.command.uniforms = *uniforms;
    }

    fn draw_instanced(&mut self, vertex_count: u32, instance_count: u32) -> Result<(), RenderError> {
        if self.command.program.is_none() {
            return Err(RenderError::MissingProgram(ShaderProgram::Main));
        }

        self.command.blend = self.blend_stack.last().copied();
        self.command.depth = self.depth_stack.last().copied();
        self.command.vertex_count = vertex_count;
        self.command.instance_count = instance_count;
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::{splat_blend_state, splat_depth_state};

    #[test]
    fn allocation_reuses_handle_per_slot() {
        let mut images = Assets::<Image>::default();
        let mut atlas_images = SplatAtlasImages::default();
        let mut command = SplatDrawCommand::default();
        let mut ctx = ImageRenderContext::new(&mut images, &mut atlas_images, &mut command, Vec3::ZERO);

        ctx.allocate_texture(AtlasSlot::Attributes, TextureFormat::Rgba16Float, 2).unwrap();
        let first = ctx.handle(AtlasSlot::Attributes).unwrap().clone();

        ctx.allocate_texture(AtlasSlot::Attributes, TextureFormat::Rgba16Float, 4).unwrap();
        let second = ctx.handle(AtlasSlot::Attributes).unwrap().clone();
        assert_eq!(first, second);

        let image = ctx.images.get(&second).unwrap();
        assert_eq!(image.texture_descriptor.size.width, 4);
        assert_eq!(image.data.as_ref().map(Vec::len), Some(16 * 8));

        ctx.allocate_texture(AtlasSlot::Attributes, TextureFormat::Rgba16Float, 0).unwrap();
        assert!(ctx.handle(AtlasSlot::Attributes).is_err());
        assert!(ctx.images.get(&second).is_none());
    }

    #[test]
    fn draw_fills_command() {
        let mut images = Assets::<Image>::default();
        let mut atlas_images = SplatAtlasImages::default();
        let mut command = SplatDrawCommand::default();

        {
            let mut ctx = ImageRenderContext::new(&mut images, &mut atlas_images, &mut command, Vec3::ONE);
            ctx.allocate_texture(AtlasSlot::SortedIndex, TextureFormat::R32Uint, 2).unwrap();
            ctx.write_texture(AtlasSlot::SortedIndex, &[1; 16]).unwrap();

            ctx.bind_program(ShaderProgram::Main).unwrap();
            ctx.push_blend(splat_blend_state());
            ctx.push_depth(splat_depth_state());
            ctx.bind_texture(AtlasSlot::SortedIndex, 0).unwrap();
            ctx.draw_instanced(6, 4).unwrap();
            ctx.pop_depth();
            ctx.pop_blend();
        }

        assert_eq!(command.program, Some(ShaderProgram::Main));
        assert_eq!(command.blend, Some(splat_blend_state()));
        assert_eq!(command.depth, Some(splat_depth_state()));
        assert_eq!(command.textures.len(), 1);
        assert_eq!(command.textures[0].slot, AtlasSlot::SortedIndex);
        assert_eq!(command.instance_count, 4);
    }
}
