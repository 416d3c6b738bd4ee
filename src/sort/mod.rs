use bevy::prelude::*;
use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};
use static_assertions::assert_cfg;

#[cfg(feature = "sort_rayon")]
pub mod rayon;

#[cfg(feature = "sort_std")]
pub mod std_sort;


assert_cfg!(
    any(
        feature = "sort_rayon",
        feature = "sort_std",
    ),
    "no sort mode enabled",
);


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
pub enum SortMode {
    #[cfg(feature = "sort_rayon")]
    Rayon,

    #[cfg(feature = "sort_std")]
    Std,
}

impl Default for SortMode {
    #[allow(unreachable_code)]
    fn default() -> Self {
        #[cfg(feature = "sort_rayon")]
        return Self::Rayon;

        #[cfg(feature = "sort_std")]
        return Self::Std;
    }
}


/// Squared camera distance (as `f32` bits) and the global splat index it
/// belongs to. Distances are never negative, so ordering the raw bits orders
/// the distances.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Pod,
    Zeroable,
)]
#[repr(C)]
pub struct SortEntry {
    pub key: u32,
    pub index: u32,
}

impl SortEntry {
    pub fn new(index: usize, position: Vec3, camera_position: Vec3) -> Self {
        let delta = camera_position - position;

        Self {
            key: bytemuck::cast(delta.length_squared()),
            index: index as u32,
        }
    }

    pub fn distance_squared(&self) -> f32 {
        bytemuck::cast(self.key)
    }
}


/// Camera distance ordering of the merged splats, recomputed only when the
/// merged set changed or the camera moved past the threshold.
#[derive(Debug, Default)]
pub struct SortEngine {
    mode: SortMode,
    threshold: f32,
    last_camera_position: Vec3,
    displacement: f32,
    fresh: bool,
    sorted: Vec<SortEntry>,
    generation: u64,
}

impl SortEngine {
    pub fn new(mode: SortMode, threshold: f32) -> Self {
        Self {
            mode,
            threshold,
            fresh: true,
            ..default()
        }
    }

    pub fn set_mode(&mut self, mode: SortMode) {
        self.mode = mode;
    }

    pub fn set_threshold(&mut self, threshold: f32) {
        self.threshold = threshold.max(0.0);
    }

    /// Drops the cached order, the merged index space it refers to is gone.
    pub fn invalidate(&mut self) {
        self.fresh = true;
        self.sorted.clear();
        self.displacement = 0.0;
    }

    /// Accumulates the camera displacement since the last call and reports
    /// whether the cached order must be recomputed for `splat_count` splats.
    pub fn needs_resort(&mut self, splat_count: usize, camera_position: Vec3) -> bool {
        let forced = self.fresh || self.sorted.len() != splat_count || self.sorted.is_empty();

        self.displacement += (camera_position - self.last_camera_position).length_squared();
        self.last_camera_position = camera_position;

        forced || self.displacement > self.threshold * self.threshold
    }

    /// Orders `positions` by ascending squared distance to `camera_position`.
    pub fn resort(&mut self, positions: &[Vec3], camera_position: Vec3) -> &[SortEntry] {
        match self.mode {
            #[cfg(feature = "sort_rayon")]
            SortMode::Rayon => rayon::sort_by_distance(positions, camera_position, &mut self.sorted),

            #[cfg(feature = "sort_std")]
            SortMode::Std => std_sort::sort_by_distance(positions, camera_position, &mut self.sorted),
        }

        self.fresh = false;
        self.displacement = 0.0;
        self.last_camera_position = camera_position;
        self.generation += 1;

        &self.sorted
    }

    /// Resorts when needed, returning whether a sort was performed.
    pub fn update(&mut self, positions: &[Vec3], camera_position: Vec3) -> bool {
        if !self.needs_resort(positions.len(), camera_position) {
            return false;
        }

        self.resort(positions, camera_position);
        true
    }

    pub fn sorted(&self) -> &[SortEntry] {
        &self.sorted
    }

    pub fn permutation(&self) -> impl ExactSizeIterator<Item = u32> + '_ {
        self.sorted.iter().map(|entry| entry.index)
    }

    /// Incremented by every resort, unchanged while the cached order is reused.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}
