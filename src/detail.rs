use bevy::{
    prelude::*,
    render::{
        extract_resource::ExtractResourcePlugin,
        view::{
            VisibilityClass,
            visibility::{VisibilitySystems, add_visibility_class},
        },
    },
};

use crate::{
    batch::SplatBatch,
    compositor::Compositor,
    log::LogKind,
    registry::{CacheVersion, ContentKey, OwnerId},
    render::image::{ImageRenderContext, SplatAtlasImages, SplatDrawCommand},
    settings::CompositorSettings,
};


/// A scene object contributing splats. Any change to the component registers
/// its batch under a fresh version, `version` only seeds it.
#[derive(Component, Clone, Debug)]
#[require(Transform, Visibility, VisibilityClass)]
#[component(on_add = add_visibility_class::<SplatDetail>)]
pub struct SplatDetail {
    pub batch: SplatBatch,
    pub version: CacheVersion,
    pub first_splat: u64,
    pub origin: Vec3,
}

impl SplatDetail {
    pub fn new(batch: SplatBatch) -> Self {
        Self {
            batch,
            version: CacheVersion::default(),
            first_splat: 0,
            origin: Vec3::ZERO,
        }
    }
}


/// Key of the detail's current registration.
#[derive(Component, Clone, Copy, Debug, PartialEq, Eq)]
pub struct SplatDetailKey(pub ContentKey);


/// The camera whose position drives the splat sort. Without one the first
/// `Camera` is used.
#[derive(Component, Clone, Copy, Debug, Default, Reflect)]
#[reflect(Component)]
pub struct SplatCamera;


#[derive(Default)]
pub struct SplatCompositorPlugin {
    pub settings: Option<CompositorSettings>,
}

impl Plugin for SplatCompositorPlugin {
    fn build(&self, app: &mut App) {
        app.register_type::<CompositorSettings>();
        app.register_type::<SplatCamera>();

        let settings = self.settings.clone().unwrap_or_default();
        app.insert_resource(Compositor::new(&settings));
        app.insert_resource(settings);
        app.init_resource::<SplatAtlasImages>();
        app.init_resource::<SplatDrawCommand>();

        app.add_plugins(ExtractResourcePlugin::<SplatDrawCommand>::default());

        app.add_systems(
            PostUpdate,
            (register_details, mark_visible_details)
                .chain()
                .after(VisibilitySystems::CheckVisibility),
        );
        app.add_systems(
            Last,
            (evict_removed_details, compose_and_draw, end_of_frame).chain(),
        );
    }
}


/// Registered version of a detail: the user version with the change tick
/// folded into its last component, so every mutation gets a new key.
fn detail_version(detail: &Ref<SplatDetail>) -> CacheVersion {
    let CacheVersion([a, b, c, d]) = detail.version;
    let tick = u64::from(detail.last_changed().get());
    CacheVersion([a, b, c, d.rotate_left(32) ^ tick])
}

fn register_detail(
    compositor: &mut Compositor,
    entity: Entity,
    detail: &Ref<SplatDetail>,
) -> ContentKey {
    compositor.register(
        OwnerId::from_entity(entity),
        detail.first_splat,
        detail_version(detail),
        detail.origin,
        detail.batch.clone(),
    )
}

pub fn register_details(
    mut commands: Commands,
    mut compositor: ResMut<Compositor>,
    details: Query<(Entity, Ref<SplatDetail>), Changed<SplatDetail>>,
) {
    for (entity, detail) in &details {
        let key = register_detail(&mut compositor, entity, &detail);
        commands.entity(entity).try_insert(SplatDetailKey(key));
    }
}

pub fn mark_visible_details(
    mut compositor: ResMut<Compositor>,
    mut details: Query<(Entity, Ref<SplatDetail>, &mut SplatDetailKey, &ViewVisibility)>,
) {
    for (entity, detail, mut key, visibility) in &mut details {
        if !visibility.get() {
            continue;
        }

        if compositor.mark_visible(&key.0) {
            continue;
        }

        // the entry was evicted while the detail stayed alive
        key.0 = register_detail(&mut compositor, entity, &detail);
        compositor.mark_visible(&key.0);
    }
}

pub fn evict_removed_details(
    mut compositor: ResMut<Compositor>,
    mut removed: RemovedComponents<SplatDetail>,
) {
    for entity in removed.read() {
        let owner = OwnerId::from_entity(entity);
        let key = compositor
            .registry()
            .owner_entries(owner)
            .map(|(key, _)| *key)
            .next();

        if let Some(key) = key {
            let evicted = compositor.evict_owner(&key);
            debug!(?entity, evicted, "evicted removed splat detail");
        }
    }
}

pub fn compose_and_draw(
    mut compositor: ResMut<Compositor>,
    settings: Res<CompositorSettings>,
    mut images: ResMut<Assets<Image>>,
    mut atlas_images: ResMut<SplatAtlasImages>,
    mut command: ResMut<SplatDrawCommand>,
    splat_cameras: Query<&GlobalTransform, With<SplatCamera>>,
    cameras: Query<&GlobalTransform, With<Camera>>,
) {
    if settings.is_changed() {
        compositor.apply_settings(&settings);
    }
    compositor.set_rendering_enabled(settings.enabled);

    let camera = splat_cameras
        .iter()
        .next()
        .or_else(|| cameras.iter().next())
        .map(GlobalTransform::translation);

    let camera_position = match camera {
        Some(position) => {
            compositor.log_mut().clear(LogKind::MissingCamera);
            position
        }
        None => {
            if settings.explicit_camera_position.is_none() {
                compositor.log_mut().warn(
                    LogKind::MissingCamera,
                    "no SplatCamera or Camera found, sorting splats from the world origin",
                );
            }
            Vec3::ZERO
        }
    };

    *command = SplatDrawCommand::default();
    let mut ctx = ImageRenderContext::new(
        &mut images,
        &mut atlas_images,
        &mut command,
        camera_position,
    );

    compositor.compose(&mut ctx);
    compositor.draw(&mut ctx);
}

pub fn end_of_frame(mut compositor: ResMut<Compositor>) {
    let evicted = compositor.end_of_frame();
    if evicted > 0 {
        debug!(evicted, "evicted stale splat entries at end of frame");
    }
}
