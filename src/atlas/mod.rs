use bevy::{
    prelude::*,
    render::render_resource::TextureFormat,
};
use half::f16;

#[cfg(feature = "sort_rayon")]
use rayon::prelude::*;

use crate::{
    registry::RegistryEntry,
    sort::SortEntry,
};

pub mod layout;

pub use layout::{
    ATTRIBUTE_TEXELS_PER_SPLAT,
    AtlasLayout,
    AtlasSlot,
    IndexEncoding,
    ShAtlas,
    ShPacking,
    TEXEL_CHANNELS,
};


/// Default hard cap on merged splats per frame.
pub const DEFAULT_MAX_SPLATS: usize = 1 << 23;


/// Side of the smallest power of two square holding `element_count` texels,
/// never less than 2.
pub fn dimension_for(element_count: usize) -> u32 {
    if element_count <= 1 {
        return 2;
    }

    let mut side = element_count.isqrt();
    if side * side < element_count {
        side += 1;
    }

    side.next_power_of_two().max(2) as u32
}


/// A square rgba16f atlas. `dimension` is 0 when nothing was allocated.
#[derive(Clone, Debug, PartialEq)]
pub struct PackedAtlas {
    pub slot: AtlasSlot,
    pub format: TextureFormat,
    pub dimension: u32,
    pub texels: Vec<f16>,
}

impl PackedAtlas {
    fn square(slot: AtlasSlot, format: TextureFormat, texel_count: usize) -> Self {
        let dimension = dimension_for(texel_count);
        let side = dimension as usize;

        Self {
            slot,
            format,
            dimension,
            texels: vec![f16::ZERO; side * side * TEXEL_CHANNELS],
        }
    }

    fn empty(slot: AtlasSlot, format: TextureFormat) -> Self {
        Self {
            slot,
            format,
            dimension: 0,
            texels: Vec::new(),
        }
    }

    pub fn bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.texels)
    }

    /// Channels of texel `index` in row major order.
    pub fn texel(&self, index: usize) -> &[f16] {
        &self.texels[index * TEXEL_CHANNELS..(index + 1) * TEXEL_CHANNELS]
    }
}


#[derive(Clone, Debug, PartialEq)]
pub enum IndexTexels {
    Integer(Vec<u32>),
    NormalizedFloat(Vec<f32>),
}

/// Draw order indirection: texel `k` names the splat of distance rank `k`.
#[derive(Clone, Debug, PartialEq)]
pub struct SortedIndexAtlas {
    pub format: TextureFormat,
    pub dimension: u32,
    pub texels: IndexTexels,
}

impl SortedIndexAtlas {
    pub fn encode(layout: &AtlasLayout, sorted: &[SortEntry]) -> Self {
        let dimension = dimension_for(sorted.len());
        let capacity = (dimension as usize).pow(2);

        let texels = match layout.index_encoding {
            IndexEncoding::Integer => {
                let mut texels = vec![0u32; capacity];
                for (texel, entry) in texels.iter_mut().zip(sorted) {
                    *texel = entry.index;
                }
                IndexTexels::Integer(texels)
            }
            IndexEncoding::NormalizedFloat => {
                let count = sorted.len().max(1) as f32;
                let mut texels = vec![0.0f32; capacity];
                for (texel, entry) in texels.iter_mut().zip(sorted) {
                    *texel = entry.index as f32 / count;
                }
                IndexTexels::NormalizedFloat(texels)
            }
        };

        Self {
            format: layout.format(AtlasSlot::SortedIndex),
            dimension,
            texels,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        match &self.texels {
            IndexTexels::Integer(texels) => bytemuck::cast_slice(texels),
            IndexTexels::NormalizedFloat(texels) => bytemuck::cast_slice(texels),
        }
    }
}


/// Every active entry concatenated into one global splat index space.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MergedFrameDataset {
    /// world space, unshifted, indexed by global splat index
    pub positions: Vec<Vec3>,
    /// subtracted from positions before they were packed
    pub origin: Vec3,
    pub sh_present: bool,
    /// splats dropped by the budget
    pub truncated: usize,
    pub attributes: Option<PackedAtlas>,
    pub sh: Vec<PackedAtlas>,
}

impl MergedFrameDataset {
    pub fn splat_count(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn atlases(&self) -> impl Iterator<Item = &PackedAtlas> {
        self.attributes.iter().chain(self.sh.iter())
    }

    pub fn atlas(&self, slot: AtlasSlot) -> Option<&PackedAtlas> {
        self.atlases().find(|atlas| atlas.slot == slot)
    }
}


#[derive(Clone, Debug)]
pub struct AtlasPacker {
    pub layout: AtlasLayout,
    pub max_splats: usize,
    pub origin_shift: bool,
}

impl Default for AtlasPacker {
    fn default() -> Self {
        Self {
            layout: AtlasLayout::default(),
            max_splats: DEFAULT_MAX_SPLATS,
            origin_shift: true,
        }
    }
}

impl AtlasPacker {
    /// Concatenates `entries` in iteration order, cutting the tail once the
    /// budget is spent.
    pub fn rebuild<'a>(&self, entries: impl IntoIterator<Item = &'a RegistryEntry>) -> MergedFrameDataset {
        let mut remaining = self.max_splats;
        let mut truncated = 0;
        let mut contributing: Vec<(&RegistryEntry, usize)> = Vec::new();

        for entry in entries {
            let take = entry.splat_count().min(remaining);
            truncated += entry.splat_count() - take;
            remaining -= take;

            if take > 0 {
                contributing.push((entry, take));
            }
        }

        let splat_count: usize = contributing.iter().map(|(_, take)| take).sum();
        let sh_present = contributing.iter().any(|(entry, _)| entry.batch.has_sh());

        let origin = if self.origin_shift && !contributing.is_empty() {
            contributing.iter().map(|(entry, _)| entry.origin).sum::<Vec3>() / contributing.len() as f32
        } else {
            Vec3::ZERO
        };

        let mut positions = Vec::with_capacity(splat_count);
        for (entry, take) in &contributing {
            positions.extend_from_slice(&entry.batch.positions()[..*take]);
        }

        if splat_count == 0 {
            return MergedFrameDataset {
                truncated,
                ..default()
            };
        }

        let mut attributes = PackedAtlas::square(
            AtlasSlot::Attributes,
            self.layout.format(AtlasSlot::Attributes),
            splat_count * ATTRIBUTE_TEXELS_PER_SPLAT,
        );
        pack_attributes(&mut attributes.texels, &contributing, origin);

        let sh = self
            .layout
            .sh_atlases()
            .iter()
            .map(|sh_atlas| {
                let format = self.layout.format(sh_atlas.slot);
                if !sh_present {
                    return PackedAtlas::empty(sh_atlas.slot, format);
                }

                let mut atlas = PackedAtlas::square(
                    sh_atlas.slot,
                    format,
                    splat_count * sh_atlas.texels_per_splat,
                );
                pack_sh(&mut atlas.texels, &contributing, sh_atlas);
                atlas
            })
            .collect();

        debug!(
            splat_count,
            truncated,
            sh_present,
            dimension = attributes.dimension,
            "rebuilt splat atlases",
        );

        MergedFrameDataset {
            positions,
            origin,
            sh_present,
            truncated,
            attributes: Some(attributes),
            sh,
        }
    }
}


fn pack_attributes(texels: &mut [f16], contributing: &[(&RegistryEntry, usize)], origin: Vec3) {
    let stride = ATTRIBUTE_TEXELS_PER_SPLAT * TEXEL_CHANNELS;
    let mut offset = 0;

    for (entry, take) in contributing {
        let batch = &entry.batch;
        let span = &mut texels[offset * stride..(offset + take) * stride];

        for_each_splat(span, stride, |i, splat| {
            let position = batch.positions()[i] - origin;
            let [r, g, b] = batch.colors()[i];
            let [sx, sy, sz] = batch.scales()[i];
            let [w, x, y, z] = batch.orientations()[i];

            splat.copy_from_slice(&[
                f16::from_f32(position.x), f16::from_f32(position.y), f16::from_f32(position.z), f16::ZERO,
                r, g, b, f16::from_f32(batch.alphas()[i]),
                sx, sy, sz, f16::ZERO,
                x, y, z, w,
            ]);
        });

        offset += take;
    }
}

fn pack_sh(texels: &mut [f16], contributing: &[(&RegistryEntry, usize)], sh_atlas: &ShAtlas) {
    let stride = sh_atlas.texels_per_splat * TEXEL_CHANNELS;
    let mut offset = 0;

    for (entry, take) in contributing {
        // entries without coefficients stay zero filled
        if let Some(sh) = entry.batch.sh() {
            let span = &mut texels[offset * stride..(offset + take) * stride];

            for_each_splat(span, stride, |i, splat| {
                for (texel, coefficient) in sh_atlas.coefficients.clone().enumerate() {
                    let [r, g, b] = sh.coefficient(i, coefficient);
                    splat[texel * TEXEL_CHANNELS..(texel + 1) * TEXEL_CHANNELS]
                        .copy_from_slice(&[r, g, b, f16::ZERO]);
                }
            });
        }

        offset += take;
    }
}

#[cfg(feature = "sort_rayon")]
fn for_each_splat<F>(texels: &mut [f16], stride: usize, fill: F)
where
    F: Fn(usize, &mut [f16]) + Send + Sync,
{
    texels
        .par_chunks_mut(stride)
        .enumerate()
        .for_each(|(i, splat)| fill(i, splat));
}

#[cfg(not(feature = "sort_rayon"))]
fn for_each_splat<F>(texels: &mut [f16], stride: usize, fill: F)
where
    F: Fn(usize, &mut [f16]),
{
    for_each_splat_serial(texels, stride, fill);
}

#[cfg_attr(all(feature = "sort_rayon", not(test)), allow(dead_code))]
fn for_each_splat_serial<F>(texels: &mut [f16], stride: usize, fill: F)
where
    F: Fn(usize, &mut [f16]),
{
    texels
        .chunks_mut(stride)
        .enumerate()
        .for_each(|(i, splat)| fill(i, splat));
}
