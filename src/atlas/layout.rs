use std::ops::Range;

use bevy::{
    prelude::*,
    render::render_resource::TextureFormat,
};
use serde::{Deserialize, Serialize};

use crate::batch::SH_COEFF_COUNT;


/// Half float channels per atlas texel.
pub const TEXEL_CHANNELS: usize = 4;

/// position, color + alpha, scale, orientation
pub const ATTRIBUTE_TEXELS_PER_SPLAT: usize = 4;


#[derive(
    Clone,
    Copy,
    Debug,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Reflect,
    Serialize,
    Deserialize,
)]
pub enum AtlasSlot {
    SortedIndex,
    Attributes,
    Sh,
    ShDeg1And2,
    ShDeg3,
}

impl AtlasSlot {
    pub fn label(&self) -> &'static str {
        match self {
            Self::SortedIndex => "splat_sorted_index_texture",
            Self::Attributes => "splat_pos_color_alpha_scale_orient_texture",
            Self::Sh => "splat_sh_texture",
            Self::ShDeg1And2 => "splat_sh_deg1_and_2_texture",
            Self::ShDeg3 => "splat_sh_deg3_texture",
        }
    }
}


/// One spherical harmonic atlas: which coefficients it stores and how many
/// texels each splat occupies (kept a power of two).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShAtlas {
    pub slot: AtlasSlot,
    pub coefficients: Range<usize>,
    pub texels_per_splat: usize,
}

static SPLIT_SH: [ShAtlas; 2] = [
    ShAtlas {
        slot: AtlasSlot::ShDeg1And2,
        coefficients: 0..8,
        texels_per_splat: 8,
    },
    ShAtlas {
        slot: AtlasSlot::ShDeg3,
        coefficients: 8..SH_COEFF_COUNT,
        texels_per_splat: 8,
    },
];

static COMBINED_SH: [ShAtlas; 1] = [
    ShAtlas {
        slot: AtlasSlot::Sh,
        coefficients: 0..SH_COEFF_COUNT,
        texels_per_splat: 16,
    },
];


#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Eq,
    Hash,
    PartialEq,
    Reflect,
    Serialize,
    Deserialize,
)]
pub enum ShPacking {
    /// degree 1 and 2 in one atlas, degree 3 in another
    #[default]
    Split,
    Combined,
}

#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Eq,
    Hash,
    PartialEq,
    Reflect,
    Serialize,
    Deserialize,
)]
pub enum IndexEncoding {
    #[default]
    Integer,
    /// index divided by the splat count, for targets without integer sampling
    NormalizedFloat,
}


/// Texture layout policy, chosen once when the compositor is created.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Eq,
    Hash,
    PartialEq,
    Reflect,
    Serialize,
    Deserialize,
)]
pub struct AtlasLayout {
    pub sh_packing: ShPacking,
    pub index_encoding: IndexEncoding,
}

impl AtlasLayout {
    pub fn sh_atlases(&self) -> &'static [ShAtlas] {
        match self.sh_packing {
            ShPacking::Split => &SPLIT_SH,
            ShPacking::Combined => &COMBINED_SH,
        }
    }

    pub fn slots(&self) -> impl Iterator<Item = AtlasSlot> {
        [AtlasSlot::SortedIndex, AtlasSlot::Attributes]
            .into_iter()
            .chain(self.sh_atlases().iter().map(|atlas| atlas.slot))
    }

    pub fn format(&self, slot: AtlasSlot) -> TextureFormat {
        match slot {
            AtlasSlot::SortedIndex => match self.index_encoding {
                IndexEncoding::Integer => TextureFormat::R32Uint,
                IndexEncoding::NormalizedFloat => TextureFormat::R32Float,
            },
            // rgb coefficient atlases are padded to rgba, no three channel formats exist
            AtlasSlot::Attributes | AtlasSlot::Sh | AtlasSlot::ShDeg1And2 | AtlasSlot::ShDeg3 => {
                TextureFormat::Rgba16Float
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sh_atlases_cover_every_coefficient_once() {
        for packing in [ShPacking::Split, ShPacking::Combined] {
            let layout = AtlasLayout {
                sh_packing: packing,
                ..default()
            };

            let mut covered: Vec<usize> = layout
                .sh_atlases()
                .iter()
                .flat_map(|atlas| {
                    assert!(atlas.coefficients.len() <= atlas.texels_per_splat);
                    assert!(atlas.texels_per_splat.is_power_of_two());
                    atlas.coefficients.clone()
                })
                .collect();
            covered.sort_unstable();

            assert_eq!(covered, (0..SH_COEFF_COUNT).collect::<Vec<_>>());
        }
    }

    #[test]
    fn index_format_follows_encoding() {
        let integer = AtlasLayout::default();
        assert_eq!(integer.format(AtlasSlot::SortedIndex), TextureFormat::R32Uint);

        let normalized = AtlasLayout {
            index_encoding: IndexEncoding::NormalizedFloat,
            ..default()
        };
        assert_eq!(normalized.format(AtlasSlot::SortedIndex), TextureFormat::R32Float);
        assert_eq!(normalized.format(AtlasSlot::ShDeg3), TextureFormat::Rgba16Float);
    }

    #[test]
    fn split_layout_slots() {
        let slots: Vec<_> = AtlasLayout::default().slots().collect();
        assert_eq!(
            slots,
            vec![
                AtlasSlot::SortedIndex,
                AtlasSlot::Attributes,
                AtlasSlot::ShDeg1And2,
                AtlasSlot::ShDeg3,
            ]
        );
    }
}
