use bevy::prelude::*;

use crate::sort::SortEntry;


pub fn sort_by_distance(
    positions: &[Vec3],
    camera_position: Vec3,
    sorted: &mut Vec<SortEntry>,
) {
    sorted.clear();
    sorted.extend(
        positions
            .iter()
            .enumerate()
            .map(|(idx, position)| SortEntry::new(idx, *position, camera_position)),
    );

    sorted.sort_unstable_by_key(|entry| entry.key);
}
