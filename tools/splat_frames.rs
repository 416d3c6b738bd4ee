use std::time::Instant;

use bevy::prelude::*;
use clap::Parser;

use bevy_splat_compositor::{
    CacheVersion,
    Compositor,
    CompositorSettings,
    HeadlessContext,
    OwnerId,
    batch::random_batch,
};


#[derive(Debug, Parser)]
#[command(about = "drive synthetic splat frames through the compositor", version, long_about = None)]
struct SplatFrames {
    /// json compositor settings, missing fields use defaults
    #[arg(long)]
    settings: Option<String>,

    #[arg(long, default_value = "4")]
    owners: u64,

    #[arg(long, default_value = "25000")]
    splats_per_owner: usize,

    #[arg(long, default_value = "120")]
    frames: u32,

    #[arg(long, default_value = "false")]
    sh: bool,

    /// bump every owner's version each n frames, 0 never recooks
    #[arg(long, default_value = "0")]
    recook_every: u32,

    #[arg(long, default_value = "60.0")]
    orbit_radius: f32,

    #[arg(long)]
    sort_threshold: Option<f32>,

    #[arg(long)]
    max_splats: Option<usize>,

    /// print final statistics as json
    #[arg(long, default_value = "false")]
    json: bool,
}

fn load_settings(args: &SplatFrames) -> CompositorSettings {
    let mut settings = match &args.settings {
        Some(path) => {
            let text = std::fs::read_to_string(path).expect("failed to read settings file");
            serde_json::from_str(&text).expect("failed to parse settings file")
        }
        None => CompositorSettings::default(),
    };

    if let Some(threshold) = args.sort_threshold {
        settings.sort_threshold = threshold;
    }
    if let Some(max_splats) = args.max_splats {
        settings.max_splats = max_splats;
    }

    settings
}

fn main() {
    let args = SplatFrames::parse();
    let settings = load_settings(&args);

    let mut compositor = Compositor::new(&settings);
    let mut ctx = HeadlessContext::default();

    let batches: Vec<_> = (0..args.owners)
        .map(|_| random_batch(args.splats_per_owner, args.sh))
        .collect();

    let owners: Vec<OwnerId> = (1..=args.owners).filter_map(OwnerId::new).collect();
    let mut keys = Vec::with_capacity(owners.len());

    let start = Instant::now();

    for frame in 0..args.frames {
        let recook = frame == 0 || (args.recook_every > 0 && frame % args.recook_every == 0);
        if recook {
            let version = CacheVersion([0, 0, 0, frame as u64]);
            keys = owners
                .iter()
                .zip(&batches)
                .map(|(owner, batch)| compositor.register(*owner, 0, version, Vec3::ZERO, batch.clone()))
                .collect();
        }

        for key in &keys {
            compositor.mark_visible(key);
        }

        let angle = frame as f32 / args.frames.max(1) as f32 * std::f32::consts::TAU;
        ctx.camera_position = Vec3::new(angle.cos(), 0.3, angle.sin()) * args.orbit_radius;

        compositor.compose(&mut ctx);
        compositor.draw(&mut ctx);
        compositor.end_of_frame();
    }

    let elapsed = start.elapsed();
    let stats = compositor.stats();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&stats).expect("stats serialize"));
        return;
    }

    println!("frames:      {}", args.frames);
    println!("entries:     {}", stats.entries);
    println!("splats:      {}", stats.splat_count);
    println!("truncated:   {}", stats.truncated);
    println!("composes:    {}", stats.composes);
    println!("resorts:     {}", stats.resorts);
    println!("draws:       {}", stats.draws);
    println!(
        "frame time:  {:.3} ms",
        elapsed.as_secs_f64() * 1000.0 / args.frames.max(1) as f64,
    );
}
