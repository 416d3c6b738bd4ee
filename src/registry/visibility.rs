use bevy::prelude::*;

use crate::registry::{ContentKey, SplatRegistry};


impl SplatRegistry {
    /// Flags the entry for drawing this frame. Unknown keys are ignored, an
    /// adapter may call this after its registration was evicted.
    pub fn mark_visible(&mut self, key: &ContentKey) -> bool {
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.active = true;
                true
            }
            None => false,
        }
    }

    pub fn active_keys(&self) -> impl Iterator<Item = &ContentKey> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.active)
            .map(|(key, _)| key)
    }

    pub fn any_active(&self) -> bool {
        self.entries.values().any(|entry| entry.active)
    }

    /// True when the active set matches the set captured at the last
    /// successful compose. Version changes surface as new keys, so key
    /// membership is enough.
    pub fn is_current(&self) -> bool {
        self.active_keys().eq(self.composed.iter())
    }

    /// Records the current active set as composed.
    pub fn capture_composed(&mut self) {
        self.composed = self.active_keys().copied().collect();
    }

    /// Forgets the composed set so the next compose always rebuilds.
    pub fn invalidate_composed(&mut self) {
        self.composed.clear();
    }

    /// Ages every entry and clears this frame's visibility marks. When
    /// `stale_after` is set, entries left undrawn for longer than that many
    /// frames are evicted; returns the number evicted.
    pub fn end_of_frame(&mut self, stale_after: Option<u32>) -> usize {
        for entry in self.entries.values_mut() {
            if entry.active {
                entry.age_since_last_active = Some(0);
            } else if let Some(age) = entry.age_since_last_active.as_mut() {
                *age = age.saturating_add(1);
            }

            entry.active = false;
            entry.age = Some(entry.age.map_or(0, |age| age.saturating_add(1)));
        }

        let Some(limit) = stale_after else {
            return 0;
        };

        let before = self.entries.len();
        self.entries.retain(|_, entry| {
            let idle = entry.age_since_last_active.or(entry.age).unwrap_or(0);
            idle <= limit
        });

        let evicted = before - self.entries.len();
        if evicted > 0 {
            debug!(evicted, limit, "evicted stale splat entries");
        }

        evicted
    }
}
