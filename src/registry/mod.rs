use std::{
    collections::{BTreeMap, BTreeSet},
    num::NonZeroU64,
    ops::RangeInclusive,
};

use bevy::prelude::*;
use serde::{Deserialize, Serialize};

use crate::batch::SplatBatch;

pub mod visibility;


/// Opaque identity of the scene object that owns one or more entries.
/// Zero is not a valid owner, so the type cannot hold it.
#[derive(
    Clone,
    Copy,
    Debug,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
    Deserialize,
)]
pub struct OwnerId(NonZeroU64);

impl OwnerId {
    pub fn new(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Self)
    }

    /// Entity bits carry a non-zero generation, so they are never zero.
    pub fn from_entity(entity: Entity) -> Self {
        Self(NonZeroU64::new(entity.to_bits()).unwrap_or(NonZeroU64::MAX))
    }

    pub fn get(&self) -> u64 {
        self.0.get()
    }
}


/// Four component geometry cache version. A new version for an owner means
/// every entry registered under an older version is stale.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Reflect,
    Serialize,
    Deserialize,
)]
pub struct CacheVersion(pub [u64; 4]);

impl CacheVersion {
    pub const MIN: Self = Self([0; 4]);
    pub const MAX: Self = Self([u64::MAX; 4]);
}

impl From<[u64; 4]> for CacheVersion {
    fn from(version: [u64; 4]) -> Self {
        Self(version)
    }
}


/// Identity of one registered batch. Ordering puts the owner first so all
/// entries of an owner form one contiguous key range.
#[derive(
    Clone,
    Copy,
    Debug,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
    Deserialize,
)]
pub struct ContentKey {
    pub owner: OwnerId,
    pub first_splat: u64,
    pub version: CacheVersion,
}

impl ContentKey {
    fn owner_range(owner: OwnerId) -> RangeInclusive<ContentKey> {
        ContentKey {
            owner,
            first_splat: 0,
            version: CacheVersion::MIN,
        }..=ContentKey {
            owner,
            first_splat: u64::MAX,
            version: CacheVersion::MAX,
        }
    }
}


#[derive(Clone, Debug)]
pub struct RegistryEntry {
    pub batch: SplatBatch,
    pub origin: Vec3,
    pub active: bool,
    /// frames since registration, `None` until the first end of frame
    pub age: Option<u32>,
    /// frames since the entry was last drawn, `None` if never drawn
    pub age_since_last_active: Option<u32>,
}

impl RegistryEntry {
    fn new(batch: SplatBatch, origin: Vec3) -> Self {
        Self {
            batch,
            origin,
            active: false,
            age: None,
            age_since_last_active: None,
        }
    }

    pub fn splat_count(&self) -> usize {
        self.batch.len()
    }
}


#[derive(Debug, Default)]
pub struct SplatRegistry {
    entries: BTreeMap<ContentKey, RegistryEntry>,
    composed: BTreeSet<ContentKey>,
}

impl SplatRegistry {
    /// Inserts or refreshes the entry for `(owner, first_splat, version)`,
    /// first erasing every entry of `owner` registered under another version.
    pub fn register(
        &mut self,
        owner: OwnerId,
        first_splat: u64,
        version: CacheVersion,
        origin: Vec3,
        batch: SplatBatch,
    ) -> ContentKey {
        let key = ContentKey {
            owner,
            first_splat,
            version,
        };

        let stale: Vec<ContentKey> = self
            .entries
            .range(ContentKey::owner_range(owner))
            .filter(|(existing, _)| existing.version != version)
            .map(|(existing, _)| *existing)
            .collect();

        for existing in &stale {
            self.entries.remove(existing);
        }

        if !stale.is_empty() {
            debug!(owner = owner.get(), evicted = stale.len(), "evicted stale splat entries");
        }

        let splat_count = batch.len();
        // refreshing an existing key resets its lifecycle just like a new one
        self.entries.insert(key, RegistryEntry::new(batch, origin));

        debug!(owner = owner.get(), first_splat, splat_count, "registered splat entry");

        key
    }

    /// Removes every entry sharing the owner of `key`. Unknown keys are ignored.
    pub fn evict_owner(&mut self, key: &ContentKey) -> usize {
        if !self.entries.contains_key(key) {
            return 0;
        }

        let before = self.entries.len();
        let range = ContentKey::owner_range(key.owner);
        self.entries.retain(|existing, _| !range.contains(existing));

        let evicted = before - self.entries.len();
        debug!(owner = key.owner.get(), evicted, "evicted splat owner");

        evicted
    }

    pub fn get(&self, key: &ContentKey) -> Option<&RegistryEntry> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &ContentKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn owner_entries(&self, owner: OwnerId) -> impl Iterator<Item = (&ContentKey, &RegistryEntry)> {
        self.entries.range(ContentKey::owner_range(owner))
    }

    /// Entries in key order, which is the merge order of the frame dataset.
    pub fn iter(&self) -> impl Iterator<Item = (&ContentKey, &RegistryEntry)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::random_batch;

    fn owner(raw: u64) -> OwnerId {
        OwnerId::new(raw).unwrap()
    }

    #[test]
    fn zero_is_not_an_owner() {
        assert!(OwnerId::new(0).is_none());
        assert_eq!(owner(7).get(), 7);
    }

    #[test]
    fn entity_owners_are_distinct() {
        let a = OwnerId::from_entity(Entity::from_raw(0));
        let b = OwnerId::from_entity(Entity::from_raw(1));
        assert_ne!(a, b);
    }

    #[test]
    fn entity_owner_keeps_entity_bits() {
        for entity in [Entity::from_raw(0), Entity::from_raw(7), Entity::from_raw(u32::MAX - 1)] {
            assert_eq!(OwnerId::from_entity(entity).get(), entity.to_bits());
        }
    }

    #[test]
    fn new_version_evicts_older_entries() {
        let mut registry = SplatRegistry::default();
        let owner_a = owner(1);

        registry.register(owner_a, 5, [1, 0, 0, 0].into(), Vec3::ZERO, random_batch(4, false));
        let newer = registry.register(owner_a, 5, [1, 0, 0, 1].into(), Vec3::ZERO, random_batch(4, false));

        let remaining: Vec<_> = registry.owner_entries(owner_a).map(|(key, _)| *key).collect();
        assert_eq!(remaining, vec![newer]);
        assert_eq!(newer.version, CacheVersion([1, 0, 0, 1]));
    }

    #[test]
    fn same_version_keeps_other_offsets() {
        let mut registry = SplatRegistry::default();
        let owner_a = owner(1);
        let version = CacheVersion([2, 0, 0, 0]);

        registry.register(owner_a, 0, version, Vec3::ZERO, random_batch(4, false));
        registry.register(owner_a, 4, version, Vec3::ZERO, random_batch(4, false));

        assert_eq!(registry.owner_entries(owner_a).count(), 2);
    }

    #[test]
    fn other_owners_are_untouched() {
        let mut registry = SplatRegistry::default();

        registry.register(owner(1), 0, [0, 0, 0, 0].into(), Vec3::ZERO, random_batch(4, false));
        let kept = registry.register(owner(2), 0, [0, 0, 0, 0].into(), Vec3::ZERO, random_batch(4, false));
        registry.register(owner(1), 0, [0, 0, 0, 1].into(), Vec3::ZERO, random_batch(4, false));

        assert!(registry.contains(&kept));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn refresh_replaces_buffers_and_resets_state() {
        let mut registry = SplatRegistry::default();
        let version = CacheVersion::default();

        let key = registry.register(owner(3), 0, version, Vec3::ZERO, random_batch(4, false));
        registry.mark_visible(&key);
        registry.end_of_frame(None);

        let refreshed = registry.register(owner(3), 0, version, Vec3::X, random_batch(9, false));
        assert_eq!(key, refreshed);

        let entry = registry.get(&key).unwrap();
        assert_eq!(entry.splat_count(), 9);
        assert_eq!(entry.origin, Vec3::X);
        assert!(!entry.active);
        assert_eq!(entry.age, None);
        assert_eq!(entry.age_since_last_active, None);
    }

    #[test]
    fn evict_owner_removes_all_owner_entries() {
        let mut registry = SplatRegistry::default();
        let version = CacheVersion::default();

        let key = registry.register(owner(1), 0, version, Vec3::ZERO, random_batch(2, false));
        registry.register(owner(1), 2, version, Vec3::ZERO, random_batch(2, false));
        let other = registry.register(owner(9), 0, version, Vec3::ZERO, random_batch(2, false));

        assert_eq!(registry.evict_owner(&key), 2);
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(&other));
    }

    #[test]
    fn evict_unknown_key_is_noop() {
        let mut registry = SplatRegistry::default();
        registry.register(owner(1), 0, CacheVersion::default(), Vec3::ZERO, random_batch(2, false));

        let unknown = ContentKey {
            owner: owner(1),
            first_splat: 99,
            version: CacheVersion::default(),
        };

        assert_eq!(registry.evict_owner(&unknown), 0);
        assert_eq!(registry.len(), 1);
    }
}
