use std::collections::HashMap;

use bevy::{
    prelude::*,
    render::render_resource::TextureFormat,
};
use serde::Serialize;

use crate::{
    atlas::{
        AtlasPacker,
        AtlasSlot,
        MergedFrameDataset,
        SortedIndexAtlas,
        dimension_for,
    },
    batch::{BatchError, SH_MAX_DEGREE, SplatAttributes, SplatBatch},
    log::{LogKind, OnceLog},
    registry::{CacheVersion, ContentKey, OwnerId, SplatRegistry},
    render::{
        RenderContext,
        RenderError,
        SPLAT_VERTEX_COUNT,
        ShaderProgram,
        SplatUniforms,
        splat_blend_state,
        splat_depth_state,
    },
    settings::CompositorSettings,
    sort::SortEngine,
};


#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Eq,
    PartialEq,
    Serialize,
)]
pub struct CompositorStats {
    pub entries: usize,
    pub active: usize,
    pub splat_count: usize,
    pub truncated: usize,
    pub composes: u64,
    pub resorts: u64,
    pub draws: u64,
}


/// Owns every splat entry and the GPU atlases built from them. Driven once
/// per redraw: [`Compositor::compose`], [`Compositor::draw`], then
/// [`Compositor::end_of_frame`].
#[derive(Resource, Debug)]
pub struct Compositor {
    registry: SplatRegistry,
    packer: AtlasPacker,
    sorter: SortEngine,
    merged: MergedFrameDataset,
    allocated: HashMap<AtlasSlot, (TextureFormat, u32)>,
    index_generation: Option<u64>,

    rendering_enabled: bool,
    explicit_camera_position: Option<Vec3>,
    sh_order: u32,
    stale_after_frames: Option<u32>,

    log: OnceLog,
    composes: u64,
    resorts: u64,
    draws: u64,
}

impl Default for Compositor {
    fn default() -> Self {
        Self::new(&CompositorSettings::default())
    }
}

impl Compositor {
    pub fn new(settings: &CompositorSettings) -> Self {
        let mut compositor = Self {
            registry: SplatRegistry::default(),
            packer: AtlasPacker {
                layout: settings.layout,
                max_splats: settings.max_splats,
                origin_shift: settings.origin_shift,
            },
            sorter: SortEngine::new(settings.sort_mode, settings.sort_threshold),
            merged: MergedFrameDataset::default(),
            allocated: HashMap::new(),
            index_generation: None,
            rendering_enabled: settings.enabled,
            explicit_camera_position: settings.explicit_camera_position,
            sh_order: 0,
            stale_after_frames: settings.stale_after_frames,
            log: OnceLog::default(),
            composes: 0,
            resorts: 0,
            draws: 0,
        };
        compositor.set_sh_order(settings.sh_order);

        compositor
    }

    /// Applies everything but the rendering flag, which the host sets per frame.
    pub fn apply_settings(&mut self, settings: &CompositorSettings) {
        self.sorter.set_mode(settings.sort_mode);
        self.sorter.set_threshold(settings.sort_threshold);
        self.set_sh_order(settings.sh_order);
        self.explicit_camera_position = settings.explicit_camera_position;
        self.stale_after_frames = settings.stale_after_frames;

        let packer = AtlasPacker {
            layout: settings.layout,
            max_splats: settings.max_splats,
            origin_shift: settings.origin_shift,
        };
        if packer.layout != self.packer.layout
            || packer.max_splats != self.packer.max_splats
            || packer.origin_shift != self.packer.origin_shift
        {
            debug!(?packer, "atlas packing changed, forcing rebuild");
            self.packer = packer;
            self.registry.invalidate_composed();
        }
    }

    /// Converts adapter attributes, substituting defaults for missing ones
    /// and warning once per missing attribute.
    pub fn assemble(&mut self, attributes: SplatAttributes) -> Result<SplatBatch, BatchError> {
        attributes.into_batch(&mut self.log)
    }

    pub fn register(
        &mut self,
        owner: OwnerId,
        first_splat: u64,
        version: CacheVersion,
        origin: Vec3,
        batch: SplatBatch,
    ) -> ContentKey {
        self.registry.register(owner, first_splat, version, origin, batch)
    }

    pub fn mark_visible(&mut self, key: &ContentKey) -> bool {
        self.registry.mark_visible(key)
    }

    pub fn evict_owner(&mut self, key: &ContentKey) -> usize {
        self.registry.evict_owner(key)
    }

    pub fn set_rendering_enabled(&mut self, enabled: bool) {
        self.rendering_enabled = enabled;
    }

    pub fn set_explicit_camera_position(&mut self, position: Option<Vec3>) {
        self.explicit_camera_position = position;
    }

    /// Orders above the supported degree disable view dependent shading.
    pub fn set_sh_order(&mut self, order: u32) {
        if order > SH_MAX_DEGREE {
            self.log.warn(
                LogKind::InvalidShOrder,
                &format!("sh order {order} is outside 0..={SH_MAX_DEGREE}, disabling spherical harmonics"),
            );
            self.sh_order = 0;
            return;
        }

        self.log.clear(LogKind::InvalidShOrder);
        self.sh_order = order;
    }

    pub fn sh_order(&self) -> u32 {
        self.sh_order
    }

    pub fn is_current(&self) -> bool {
        self.registry.is_current()
    }

    pub fn registry(&self) -> &SplatRegistry {
        &self.registry
    }

    pub fn merged(&self) -> &MergedFrameDataset {
        &self.merged
    }

    pub fn sorter(&self) -> &SortEngine {
        &self.sorter
    }

    pub fn log(&self) -> &OnceLog {
        &self.log
    }

    pub fn log_mut(&mut self) -> &mut OnceLog {
        &mut self.log
    }

    pub fn stats(&self) -> CompositorStats {
        CompositorStats {
            entries: self.registry.len(),
            active: self.registry.active_keys().count(),
            splat_count: self.merged.splat_count(),
            truncated: self.merged.truncated,
            composes: self.composes,
            resorts: self.resorts,
            draws: self.draws,
        }
    }

    /// Rebuilds the merged dataset and its atlases unless the active set is
    /// unchanged since the last successful compose. Returns whether a rebuild
    /// happened. A failed upload leaves nothing to draw and is retried on the
    /// next call.
    pub fn compose<C: RenderContext>(&mut self, ctx: &mut C) -> bool {
        if self.registry.is_current() {
            return false;
        }

        let merged = self.packer.rebuild(
            self.registry
                .iter()
                .filter(|(_, entry)| entry.active)
                .map(|(_, entry)| entry),
        );

        self.sorter.invalidate();
        self.index_generation = None;

        if let Err(err) = self.upload(ctx, &merged) {
            self.log.warn(
                LogKind::TextureAllocation,
                &format!("skipping splat compose this frame: {err}"),
            );
            self.merged = MergedFrameDataset::default();
            // contents of every texture are unknown now, reallocate on retry
            self.allocated.clear();
            self.registry.invalidate_composed();
            return false;
        }
        self.log.clear(LogKind::TextureAllocation);

        self.merged = merged;
        self.registry.capture_composed();
        self.composes += 1;

        true
    }

    fn upload<C: RenderContext>(&mut self, ctx: &mut C, merged: &MergedFrameDataset) -> Result<(), RenderError> {
        let layout = self.packer.layout;

        // textures of a previous layout
        let stale: Vec<AtlasSlot> = self
            .allocated
            .keys()
            .filter(|slot| !layout.slots().any(|wanted| wanted == **slot))
            .copied()
            .collect();
        for slot in stale {
            ensure_texture(&mut self.allocated, ctx, slot, layout.format(slot), 0)?;
        }

        let index_dimension = if merged.is_empty() { 0 } else { dimension_for(merged.splat_count()) };
        ensure_texture(
            &mut self.allocated,
            ctx,
            AtlasSlot::SortedIndex,
            layout.format(AtlasSlot::SortedIndex),
            index_dimension,
        )?;

        for slot in layout.slots().filter(|slot| *slot != AtlasSlot::SortedIndex) {
            match merged.atlas(slot) {
                Some(atlas) => {
                    ensure_texture(&mut self.allocated, ctx, slot, atlas.format, atlas.dimension)?;
                    if atlas.dimension > 0 {
                        ctx.write_texture(slot, atlas.bytes())?;
                    }
                }
                None => ensure_texture(&mut self.allocated, ctx, slot, layout.format(slot), 0)?,
            }
        }

        Ok(())
    }

    /// Draws the merged splats in camera distance order. Returns whether a
    /// draw was issued.
    pub fn draw<C: RenderContext>(&mut self, ctx: &mut C) -> bool {
        if !self.rendering_enabled || !self.registry.any_active() || self.merged.is_empty() {
            return false;
        }

        let camera_position = self
            .explicit_camera_position
            .unwrap_or_else(|| ctx.camera_position());

        match self.try_draw(ctx, camera_position) {
            Ok(()) => {
                self.log.clear(LogKind::DrawFailure);
                self.draws += 1;
                true
            }
            Err(err) => {
                self.log.warn(LogKind::DrawFailure, &format!("skipping splat draw this frame: {err}"));
                false
            }
        }
    }

    fn try_draw<C: RenderContext>(&mut self, ctx: &mut C, camera_position: Vec3) -> Result<(), RenderError> {
        if self.sorter.update(&self.merged.positions, camera_position) {
            self.resorts += 1;
        }

        if self.index_generation != Some(self.sorter.generation()) {
            let index = SortedIndexAtlas::encode(&self.packer.layout, self.sorter.sorted());
            ctx.write_texture(AtlasSlot::SortedIndex, index.bytes())?;
            self.index_generation = Some(self.sorter.generation());
        }

        ctx.bind_program(ShaderProgram::Main)?;
        ctx.push_blend(splat_blend_state());
        ctx.push_depth(splat_depth_state());

        let drawn = self.bind_and_draw(ctx, camera_position);

        ctx.pop_depth();
        ctx.pop_blend();

        drawn
    }

    fn bind_and_draw<C: RenderContext>(&self, ctx: &mut C, camera_position: Vec3) -> Result<(), RenderError> {
        let layout = self.packer.layout;

        for (unit, slot) in layout.slots().enumerate() {
            if self.dimension(slot) > 0 {
                ctx.bind_texture(slot, unit as u32)?;
            }
        }

        let mut sh_dimensions = [0; 2];
        for (dimension, sh_atlas) in sh_dimensions.iter_mut().zip(layout.sh_atlases()) {
            *dimension = self.dimension(sh_atlas.slot);
        }

        let splat_count = self.merged.splat_count() as u32;
        let uniforms = SplatUniforms {
            origin: self.merged.origin.to_array(),
            splat_count,
            world_camera_position: camera_position.to_array(),
            vertex_count: SPLAT_VERTEX_COUNT * splat_count,
            sorted_index_dimension: self.dimension(AtlasSlot::SortedIndex),
            attributes_dimension: self.dimension(AtlasSlot::Attributes),
            sh_dimensions,
            sh_order: self.sh_order,
            sh_enabled: (self.merged.sh_present && self.sh_order > 0) as u32,
            index_normalized: (layout.format(AtlasSlot::SortedIndex) == TextureFormat::R32Float) as u32,
            _pad: 0,
        };
        ctx.set_uniforms(&uniforms);

        ctx.draw_instanced(SPLAT_VERTEX_COUNT, splat_count)
    }

    fn dimension(&self, slot: AtlasSlot) -> u32 {
        self.allocated.get(&slot).map_or(0, |(_, dimension)| *dimension)
    }

    /// Ages entries and clears visibility for the next frame. Returns the
    /// number of entries evicted as stale.
    pub fn end_of_frame(&mut self) -> usize {
        self.registry.end_of_frame(self.stale_after_frames)
    }
}


/// Allocates only when the format or side of `slot` changed.
fn ensure_texture<C: RenderContext>(
    allocated: &mut HashMap<AtlasSlot, (TextureFormat, u32)>,
    ctx: &mut C,
    slot: AtlasSlot,
    format: TextureFormat,
    dimension: u32,
) -> Result<(), RenderError> {
    if allocated.get(&slot) == Some(&(format, dimension)) {
        return Ok(());
    }

    allocated.remove(&slot);
    ctx.allocate_texture(slot, format, dimension)?;

    if dimension > 0 {
        allocated.insert(slot, (format, dimension));
    }

    Ok(())
}
