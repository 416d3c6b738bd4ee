use bevy::prelude::*;
use rayon::prelude::*;

use crate::sort::SortEntry;


pub fn sort_by_distance(
    positions: &[Vec3],
    camera_position: Vec3,
    sorted: &mut Vec<SortEntry>,
) {
    sorted.resize(positions.len(), SortEntry::default());

    positions
        .par_iter()
        .zip(sorted.par_iter_mut())
        .enumerate()
        .for_each(|(idx, (position, sort_entry))| {
            *sort_entry = SortEntry::new(idx, *position, camera_position);
        });

    sorted.par_sort_unstable_by_key(|entry| entry.key);
}
