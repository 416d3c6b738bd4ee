pub use atlas::{
    AtlasLayout,
    AtlasPacker,
    IndexEncoding,
    MergedFrameDataset,
    ShPacking,
    dimension_for,
};
pub use batch::{
    SplatAttributes,
    SplatBatch,
};
pub use compositor::{
    Compositor,
    CompositorStats,
};
pub use detail::{
    SplatCamera,
    SplatCompositorPlugin,
    SplatDetail,
};
pub use registry::{
    CacheVersion,
    ContentKey,
    OwnerId,
};
pub use render::{
    RenderContext,
    headless::HeadlessContext,
};
pub use settings::CompositorSettings;
pub use sort::SortMode;

pub mod atlas;
pub mod batch;
pub mod compositor;
pub mod detail;
pub mod log;
pub mod registry;
pub mod render;
pub mod settings;
pub mod sort;
