use bevy::prelude::*;
use half::f16;

use bevy_splat_compositor::{
    CacheVersion,
    Compositor,
    CompositorSettings,
    HeadlessContext,
    OwnerId,
    SplatAttributes,
    atlas::{AtlasSlot, TEXEL_CHANNELS},
    batch::random_batch,
    dimension_for,
    log::OnceLog,
};


fn owner(raw: u64) -> OwnerId {
    OwnerId::new(raw).unwrap()
}


#[test]
fn one_owner_end_to_end() {
    let mut compositor = Compositor::default();
    let mut ctx = HeadlessContext::new(Vec3::new(0.0, 5.0, 25.0));

    let batch = SplatAttributes {
        positions: (0..10).map(|i| Vec3::new(i as f32, 0.0, -(i as f32))).collect(),
        colors: Some(vec![Vec3::new(1.0, 0.5, 0.25); 10]),
        opacities: Some(vec![0.75; 10]),
        scales: Some(vec![Vec3::splat(0.1); 10]),
        orientations: Some(vec![Quat::IDENTITY; 10]),
        spherical_harmonics: None,
    }
    .into_batch(&mut OnceLog::default())
    .unwrap();

    let key = compositor.register(owner(1), 0, CacheVersion([0, 0, 0, 0]), Vec3::ZERO, batch);
    compositor.mark_visible(&key);

    assert!(!compositor.is_current());
    assert!(compositor.compose(&mut ctx));
    assert!(compositor.is_current());
    assert!(compositor.draw(&mut ctx));

    assert_eq!(compositor.merged().splat_count(), 10);
    assert_eq!(dimension_for(10), 4);
    assert_eq!(dimension_for(40), 8);
    assert_eq!(ctx.texture(AtlasSlot::SortedIndex).unwrap().dimension, 4);
    assert_eq!(ctx.texture(AtlasSlot::Attributes).unwrap().dimension, 8);

    let draw = ctx.last_draw().unwrap();
    assert_eq!(draw.instance_count, 10);
    assert_eq!(draw.vertex_count, 6);
    assert!(ctx.state_restored());

    compositor.end_of_frame();
    let entry = compositor.registry().get(&key).unwrap();
    assert_eq!(entry.age, Some(0));
    assert_eq!(entry.age_since_last_active, Some(0));
    assert!(!entry.active);
}

#[test]
fn compose_twice_is_byte_identical() {
    let mut compositor = Compositor::default();
    let mut ctx = HeadlessContext::default();

    for raw in 1..=3 {
        let key = compositor.register(owner(raw), 0, CacheVersion::default(), Vec3::ZERO, random_batch(50, raw == 2));
        compositor.mark_visible(&key);
    }

    compositor.compose(&mut ctx);
    let first = ctx.textures.clone();

    assert!(!compositor.compose(&mut ctx));
    assert_eq!(ctx.textures, first);
}

#[test]
fn newer_version_leaves_one_entry() {
    let mut compositor = Compositor::default();
    let owner_a = owner(42);

    compositor.register(owner_a, 5, CacheVersion([1, 0, 0, 0]), Vec3::ZERO, random_batch(3, false));
    let newer = compositor.register(owner_a, 5, CacheVersion([1, 0, 0, 1]), Vec3::ZERO, random_batch(3, false));

    let entries: Vec<_> = compositor
        .registry()
        .owner_entries(owner_a)
        .map(|(key, _)| *key)
        .collect();
    assert_eq!(entries, vec![newer]);
}

#[test]
fn budget_caps_merged_splats() {
    let settings = CompositorSettings {
        max_splats: 100,
        ..default()
    };
    let mut compositor = Compositor::new(&settings);
    let mut ctx = HeadlessContext::default();

    for raw in 1..=3 {
        let key = compositor.register(owner(raw), 0, CacheVersion::default(), Vec3::ZERO, random_batch(60, true));
        compositor.mark_visible(&key);
    }

    compositor.compose(&mut ctx);
    assert!(compositor.draw(&mut ctx));

    let stats = compositor.stats();
    assert_eq!(stats.splat_count, 100);
    assert_eq!(stats.truncated, 80);
    assert_eq!(ctx.last_draw().unwrap().instance_count, 100);

    let attributes = ctx.texture(AtlasSlot::Attributes).unwrap();
    assert_eq!(attributes.dimension, dimension_for(400));
    assert!(attributes.bytes.len() >= 400 * TEXEL_CHANNELS * std::mem::size_of::<f16>());

    let indices = ctx.sorted_indices().unwrap();
    assert!(indices[..100].iter().all(|index| *index < 100));
}

#[test]
fn slow_camera_reuses_cached_order() {
    let settings = CompositorSettings {
        sort_threshold: 1.0,
        ..default()
    };
    let mut compositor = Compositor::new(&settings);
    let mut ctx = HeadlessContext::new(Vec3::ZERO);

    let key = compositor.register(owner(1), 0, CacheVersion::default(), Vec3::ZERO, random_batch(64, false));

    let mut generations = Vec::new();
    for step in 0..4 {
        compositor.mark_visible(&key);
        ctx.camera_position = Vec3::new(0.1 * step as f32, 0.0, 0.0);

        compositor.compose(&mut ctx);
        compositor.draw(&mut ctx);
        compositor.end_of_frame();

        generations.push(compositor.sorter().generation());
    }

    assert_eq!(generations, vec![1, 1, 1, 1]);
    assert_eq!(compositor.stats().resorts, 1);

    compositor.mark_visible(&key);
    ctx.camera_position = Vec3::new(5.0, 0.0, 0.0);
    compositor.draw(&mut ctx);
    assert_eq!(compositor.sorter().generation(), 2);
}

#[test]
fn absent_sh_disables_sh_everywhere() {
    let mut compositor = Compositor::default();
    let mut ctx = HeadlessContext::default();

    let key = compositor.register(owner(1), 0, CacheVersion::default(), Vec3::ZERO, random_batch(16, false));
    compositor.mark_visible(&key);

    compositor.compose(&mut ctx);
    compositor.draw(&mut ctx);

    assert!(!compositor.merged().sh_present);
    assert!(compositor.merged().sh.iter().all(|atlas| atlas.dimension == 0));
    assert!(ctx.texture(AtlasSlot::ShDeg1And2).is_none());
    assert!(ctx.texture(AtlasSlot::ShDeg3).is_none());

    let uniforms = ctx.last_draw().unwrap().uniforms.unwrap();
    assert_eq!(uniforms.sh_enabled, 0);
    assert_eq!(uniforms.sh_dimensions, [0, 0]);
}

#[test]
fn evicted_owner_is_dropped_on_next_compose() {
    let mut compositor = Compositor::default();
    let mut ctx = HeadlessContext::default();

    let kept = compositor.register(owner(1), 0, CacheVersion::default(), Vec3::ZERO, random_batch(8, false));
    let evicted = compositor.register(owner(2), 0, CacheVersion::default(), Vec3::ZERO, random_batch(8, false));
    compositor.mark_visible(&kept);
    compositor.mark_visible(&evicted);
    compositor.compose(&mut ctx);
    compositor.end_of_frame();

    assert_eq!(compositor.evict_owner(&evicted), 1);
    assert!(!compositor.mark_visible(&evicted));
    compositor.mark_visible(&kept);

    assert!(compositor.compose(&mut ctx));
    assert_eq!(compositor.merged().splat_count(), 8);
}
