use bevy::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{
    atlas::{AtlasLayout, DEFAULT_MAX_SPLATS},
    batch::SH_MAX_DEGREE,
    sort::SortMode,
};


#[derive(Resource, Reflect, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[reflect(Resource)]
#[serde(default)]
pub struct CompositorSettings {
    pub enabled: bool,
    pub sort_mode: SortMode,
    /// camera travel tolerated before a resort, 0 resorts on any movement
    pub sort_threshold: f32,
    pub sh_order: u32,
    pub max_splats: usize,
    pub layout: AtlasLayout,
    pub origin_shift: bool,
    pub explicit_camera_position: Option<Vec3>,
    /// evict entries left undrawn for more than this many frames
    pub stale_after_frames: Option<u32>,
}

impl Default for CompositorSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            sort_mode: SortMode::default(),
            sort_threshold: 0.0,
            sh_order: SH_MAX_DEGREE,
            max_splats: DEFAULT_MAX_SPLATS,
            layout: AtlasLayout::default(),
            origin_shift: true,
            explicit_camera_position: None,
            stale_after_frames: None,
        }
    }
}
