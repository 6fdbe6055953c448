use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use image::{GrayImage, Luma, Rgb, RgbImage};
use nalgebra::{Point2, UnitQuaternion, Vector3};
use rand::Rng;
use tracing::info;
use tracing_subscriber::EnvFilter;

use semantic_vslam::atlas::map::{KeyFrameId, MapPointId};
use semantic_vslam::geometry::{CameraModel, SE3};
use semantic_vslam::optimizer::WeightedPoseOptimizer;
use semantic_vslam::semantic::{factory_from, DynamicClassifier, SegmentationService, SemanticConfig};
use semantic_vslam::system::{SemanticSystem, SharedState};

const WIDTH: u32 = 320;
const HEIGHT: u32 = 240;
const NUM_KEYFRAMES: usize = 12;

/// Image region occupied by the walking person in every frame.
const PERSON_COLS: (u32, u32) = (120, 200);
const PERSON_ROWS: (u32, u32) = (60, 180);

/// Labels red pixels as person (class 1), everything else as background.
struct ColorSegmenter;

impl SegmentationService for ColorSegmenter {
    fn segment(&mut self, images: &[Arc<RgbImage>]) -> Result<Vec<Option<GrayImage>>> {
        Ok(images
            .iter()
            .map(|img| {
                Some(GrayImage::from_fn(img.width(), img.height(), |x, y| {
                    let p = img.get_pixel(x, y);
                    Luma([u8::from(p[0] > 200 && p[1] < 50)])
                }))
            })
            .collect())
    }

    fn name(&self) -> &str {
        "color-threshold"
    }
}

fn in_person(uv: &Point2<f64>) -> bool {
    uv.x >= PERSON_COLS.0 as f64
        && uv.x < PERSON_COLS.1 as f64
        && uv.y >= PERSON_ROWS.0 as f64
        && uv.y < PERSON_ROWS.1 as f64
}

fn render_frame() -> RgbImage {
    RgbImage::from_fn(WIDTH, HEIGHT, |x, y| {
        if in_person(&Point2::new(x as f64, y as f64)) {
            Rgb([230, 20, 20])
        } else {
            Rgb([90, 110, 90])
        }
    })
}

/// Scene: a textured wall 4 m ahead, and a person walking along with the
/// camera so that it stays at the image center.
struct Scene {
    camera: CameraModel,
    wall: Vec<Vector3<f64>>,
    person: Vec<Vector3<f64>>,
}

impl Scene {
    fn new(camera: CameraModel) -> Self {
        let mut wall = Vec::new();
        let mut person = Vec::new();
        for i in -6..=6 {
            for j in -4..=4 {
                let p = Vector3::new(i as f64 * 0.35, j as f64 * 0.3, 4.0);
                match camera.project(&p) {
                    Some(uv) if in_person(&uv) => person.push(Vector3::new(p.x * 0.5, p.y * 0.5, 2.0)),
                    Some(_) => wall.push(p),
                    None => {}
                }
            }
        }
        Self {
            camera,
            wall,
            person,
        }
    }

    fn true_pose(i: usize) -> SE3 {
        SE3::from_rt(
            UnitQuaternion::from_euler_angles(0.0, 0.01 * i as f64, 0.0),
            Vector3::new(0.06 * i as f64, 0.0, 0.0),
        )
    }
}

fn build_map(shared: &SharedState, scene: &Scene) -> Result<(Vec<KeyFrameId>, Vec<MapPointId>, Vec<MapPointId>)> {
    let mut rng = rand::thread_rng();
    let image = Arc::new(render_frame());
    let mut keyframes = Vec::with_capacity(NUM_KEYFRAMES);
    let mut wall_ids = Vec::new();
    let mut person_ids = Vec::new();

    for i in 0..NUM_KEYFRAMES {
        let pose_wc = Scene::true_pose(i);
        let pose_cw = pose_wc.inverse();

        // Static points reproject through the camera motion, person points
        // move with the camera and keep their first-frame pixel.
        let mut keypoints = Vec::new();
        let mut observed = Vec::new();
        for (k, p) in scene.wall.iter().enumerate() {
            if let Some(uv) = scene.camera.project(&pose_cw.transform_point(p)) {
                let noisy = Point2::new(uv.x + rng.gen_range(-0.5..0.5), uv.y + rng.gen_range(-0.5..0.5));
                keypoints.push(noisy);
                observed.push((false, k));
            }
        }
        for (k, p) in scene.person.iter().enumerate() {
            if let Some(uv) = scene.camera.project(p) {
                keypoints.push(uv);
                observed.push((true, k));
            }
        }

        // Odometry drift on the initial estimate
        let drift = SE3::from_rt(
            UnitQuaternion::identity(),
            Vector3::new(rng.gen_range(-0.03..0.03), rng.gen_range(-0.03..0.03), 0.0),
        );
        let kf_id = shared
            .create_keyframe(i as u64 * 50_000_000, pose_wc.compose(&drift), Arc::clone(&image), keypoints)
            .context("creating keyframe")?;

        for (idx, (is_person, k)) in observed.into_iter().enumerate() {
            let ids = if is_person { &mut person_ids } else { &mut wall_ids };
            let points = if is_person { &scene.person } else { &scene.wall };
            if i == 0 {
                ids.push(shared.create_map_point(points[k], kf_id)?);
            }
            if let Some(&mp_id) = ids.get(k) {
                shared.associate(kf_id, idx, mp_id);
            }
        }
        keyframes.push(kf_id);
    }
    Ok((keyframes, wall_ids, person_ids))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) => SemanticConfig::load(&path).with_context(|| format!("loading {}", path))?,
        None => SemanticConfig::default(),
    };
    let stats_path = args.next();

    let camera = CameraModel::new(250.0, 250.0, WIDTH as f64 / 2.0, HEIGHT as f64 / 2.0);
    let scene = Scene::new(camera);
    info!(
        "Synthetic scene: {} wall points, {} person points",
        scene.wall.len(),
        scene.person.len()
    );

    let shared = SharedState::new();
    let (keyframes, wall_ids, person_ids) = build_map(&shared, &scene)?;

    let optimizer = Arc::new(WeightedPoseOptimizer::new(
        camera,
        DynamicClassifier::new(config.dynamic_threshold),
    ));
    let system = SemanticSystem::new(config, Arc::clone(&shared), factory_from(ColorSegmenter), optimizer)?;
    system.start()?;
    info!(
        "Semantic pipeline running, batch size {}, warm-up {} keyframes",
        system.config().batch_size,
        system.config().warmup_keyframes
    );

    for &kf_id in &keyframes {
        system.insert_keyframe(kf_id);
        std::thread::sleep(Duration::from_millis(20));
    }

    let last = keyframes.last().copied();
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while system.latest_labeled_keyframe_id() < last && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    system.request_finish();

    let dynamic_person = person_ids.iter().filter(|&&mp| system.is_dynamic_point(mp)).count();
    let dynamic_wall = wall_ids.iter().filter(|&&mp| system.is_dynamic_point(mp)).count();
    println!(
        "Person points flagged dynamic: {}/{}",
        dynamic_person,
        person_ids.len()
    );
    println!("Wall points flagged dynamic: {}/{}", dynamic_wall, wall_ids.len());

    let atlas = shared.atlas.read();
    let mut total_error = 0.0;
    for (i, &kf_id) in keyframes.iter().enumerate() {
        if let Some(kf) = atlas.keyframe(kf_id) {
            total_error += (kf.pose.translation - Scene::true_pose(i).translation).norm();
        }
    }
    drop(atlas);
    println!(
        "Mean translation error after semantic tracking: {:.4} m",
        total_error / keyframes.len() as f64
    );

    println!("{}", system.stats().summary());
    if let Some(path) = stats_path {
        system.stats().write_csv(&path)?;
        println!("Stats written to {}", path);
    }
    Ok(())
}
