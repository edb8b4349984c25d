//! Vegetation streaming demo: walks a viewer across a procedurally scattered field.
//!
//! Usage: `vegetation_demo [meshes.glb ...]`. Mesh nodes must be named `<name>_LOD<0-2>`.
//! Without arguments a built-in grass/shrub/rock set is used. Renders offscreen when a GPU
//! adapter is available, otherwise streams on the CPU only.

use anyhow::Result;
use engine_core::{Time, Vec3};
use image::{Rgba, RgbaImage};
use physics::PhysicsWorld;
use procgen::ScatterGenerator;
use renderer::{
    import_meshes, Atlas, Camera, GpuContext, MaterialMaps, MeshData, OffscreenTarget, Renderable, DEPTH_FORMAT,
    OFFSCREEN_COLOR_FORMAT,
};
use std::path::Path;
use vegetation::{
    BatchSettings, ChunkTracker, ScatterSource, SourceMesh, VegetationAssets, VegetationConfig, VegetationLayer,
    VegetationRenderer,
};

type DemoRenderer = VegetationRenderer<ScatterSource, PhysicsWorld>;

const FRAMES: u32 = 240;
const WALK_SPEED: f32 = 1.5;
const FETCH_LATENCY_TICKS: u32 = 2;

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = VegetationConfig::load();
    log::info!("Starting vegetation demo (seed {}, view range {})", config.seed, config.view_range);

    let paths: Vec<String> = std::env::args().skip(1).collect();
    let sources = if paths.is_empty() {
        builtin_meshes()
    } else {
        load_meshes(&paths)?
    };

    let assets = VegetationAssets::build(sources, config.limits(), config.atlas_config())?;
    if assets.atlas.downscaled() {
        log::warn!("Material atlas was downscaled to {:.2}x", assets.atlas.scale);
    }

    let mut physics = PhysicsWorld::new();
    physics.add_ground_plane();

    let source = ScatterSource::new(ScatterGenerator::new(config.scatter_config()), FETCH_LATENCY_TICKS);
    let settings = BatchSettings {
        chunk_size: config.chunk_size,
        collide: config.collide,
        frame_skip: config.frame_skip,
    };
    let renderer = VegetationRenderer::new(assets.registry, assets.allocator, source, physics, settings);
    let mut tracker = ChunkTracker::new(config.chunk_size, config.view_range, config.lod_count);

    let renderer = match GpuContext::headless() {
        Ok(ctx) => run_gpu(&ctx, renderer, &assets.atlas, &mut tracker),
        Err(e) => {
            log::warn!("No GPU available ({}), streaming without rendering", e);
            run_cpu(renderer, &mut tracker)
        }
    };

    finish(renderer);
    Ok(())
}

fn viewer_at(frame: u32) -> Vec3 {
    Vec3::new(frame as f32 * WALK_SPEED, 1.7, 8.0)
}

/// One streaming tick: feed tracker events to the renderer and report readiness back.
fn stream(renderer: &mut DemoRenderer, tracker: &mut ChunkTracker, viewer: Vec3) {
    for event in tracker.update(viewer) {
        renderer.handle_event(event);
    }
    for key in renderer.tick() {
        if let Some(add) = tracker.mark_ready(key) {
            renderer.handle_event(add);
        }
    }
}

fn run_cpu(mut renderer: DemoRenderer, tracker: &mut ChunkTracker) -> DemoRenderer {
    let mut time = Time::new();
    for frame in 0..FRAMES {
        time.update();
        stream(&mut renderer, tracker, viewer_at(frame));
        renderer.end_frame();
        if frame % 60 == 0 {
            log_stats(&renderer, frame);
        }
    }
    log::info!("Streamed {} frames in {:.2?}", time.frame_count(), time.elapsed());
    renderer
}

fn run_gpu(
    ctx: &GpuContext,
    renderer: DemoRenderer,
    atlas: &Atlas,
    tracker: &mut ChunkTracker,
) -> DemoRenderer {
    let target = OffscreenTarget::new(&ctx.device, 1280, 720);
    let mut layer = VegetationLayer::new(
        &ctx.device,
        &ctx.queue,
        OFFSCREEN_COLOR_FORMAT,
        Some(DEPTH_FORMAT),
        renderer,
        atlas,
    );
    let mut camera = Camera::new(viewer_at(0));
    camera.aspect = target.aspect();
    let mut time = Time::new();

    for frame in 0..FRAMES {
        time.update();
        let viewer = viewer_at(frame);
        stream(layer.renderer_mut(), tracker, viewer);

        camera.transform.position = viewer;
        camera.look_at(viewer + Vec3::new(10.0, -1.0, 0.0));
        layer.prepare(&ctx.queue, &camera);
        let frustum = camera.frustum();
        let draws = target.render(ctx, wgpu::Color { r: 0.55, g: 0.7, b: 0.9, a: 1.0 }, |pass| {
            layer.draw(pass, &frustum)
        });
        layer.renderer_mut().end_frame();

        if frame % 60 == 0 {
            log::info!("Frame {}: {} draw calls", frame, draws);
            log_stats(layer.renderer(), frame);
        }
    }
    log::info!("Rendered {} frames in {:.2?}", time.frame_count(), time.elapsed());
    layer.into_renderer()
}

fn log_stats(renderer: &DemoRenderer, frame: u32) {
    log::info!(
        "Frame {}: {} chunks ({} fetching), {} live slots, {} colliders",
        frame,
        renderer.chunk_count(),
        renderer.pending_count(),
        renderer.allocator().live_slots().count(),
        renderer.collider_count()
    );
}

/// Pick the first instance in front of the viewer, then tear everything down.
fn finish(mut renderer: DemoRenderer) {
    let viewer = viewer_at(FRAMES);
    renderer.collision_mut().update_query_pipeline();
    let picked = [Vec3::X, Vec3::Z, -Vec3::X, -Vec3::Z]
        .into_iter()
        .find_map(|dir| {
            renderer
                .collision()
                .pick_vegetation(Vec3::new(viewer.x, 0.3, viewer.z), dir, 50.0)
        });
    match picked {
        Some(hit) => {
            if let Some(instance) = renderer.resolve_instance(hit.collider) {
                log::info!(
                    "Picked {} ({}) at {} in chunk {}, slot {} local {}",
                    instance.metadata.name,
                    instance.metadata.item_type,
                    instance.transform.position,
                    instance.chunk,
                    instance.slot,
                    instance.local
                );
            }
            if let Some(grabbed) = renderer.grab_instance(hit.collider) {
                log::info!("Grabbed one {}", grabbed.name);
            }
        }
        None => log::info!("Nothing to pick near the viewer"),
    }

    let handles = renderer.physics_handles().len();
    renderer.shutdown();
    log::info!(
        "Released {} colliders, {} remain in the physics world",
        handles,
        renderer.collision().collider_count()
    );
}

fn load_meshes(paths: &[String]) -> Result<Vec<SourceMesh>> {
    let mut sources = Vec::new();
    for path in paths {
        let item_type = Path::new(path)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "vegetation".to_owned());
        for imported in import_meshes(path)? {
            sources.push(SourceMesh::new(imported.name, item_type.clone(), imported.mesh, imported.maps));
        }
    }
    Ok(sources)
}

/// Striped tile so the atlas has something to show.
fn tile(base: [u8; 3], stripe: [u8; 3]) -> RgbaImage {
    RgbaImage::from_fn(64, 64, |x, y| {
        let c = if (x / 8 + y / 16) % 2 == 0 { base } else { stripe };
        // Transparent border keeps card edges ragged.
        let alpha = if x < 2 || x > 61 { 0 } else { 255 };
        Rgba([c[0], c[1], c[2], alpha])
    })
}

fn builtin_meshes() -> Vec<SourceMesh> {
    let grass = MaterialMaps {
        color: Some(tile([70, 140, 50], [90, 170, 60])),
        normal: None,
    };
    let shrub = MaterialMaps {
        color: Some(tile([40, 100, 40], [30, 80, 35])),
        normal: None,
    };
    let rock = MaterialMaps {
        color: Some(tile([120, 120, 115], [100, 100, 98])),
        normal: None,
    };
    vec![
        SourceMesh::new("grass_LOD0", "plants", MeshData::cross_quads(0.8, 0.6), grass.clone()),
        SourceMesh::new("grass_LOD1", "plants", MeshData::cross_quads(0.8, 0.5), grass),
        SourceMesh::new("shrub_LOD0", "plants", MeshData::cross_quads(1.6, 1.4), shrub),
        SourceMesh::new("rock_LOD0", "rocks", MeshData::cube(Vec3::new(0.5, 0.35, 0.4)), rock.clone()),
        SourceMesh::new("rock_LOD2", "rocks", MeshData::cube(Vec3::new(0.5, 0.35, 0.4)), rock),
    ]
}
