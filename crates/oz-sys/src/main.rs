// Headless runner: configure, build a small test range, run the simulation
// and AI threads, optionally save the world on exit.
//
//   openzone [config.toml] [--save <path>]

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{error, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use oz_common::bsp::{Bsp, Material};
use oz_common::cvar::CvarContext;
use oz_common::error::{OzError, OzResult};
use oz_common::math::{Bounds, Rotation};
use oz_matrix::matrix::{Matrix, MatrixConfig, MatrixThread, TICK_TIME};
use oz_matrix::nirvana::WanderMind;

const STATS_INTERVAL: Duration = Duration::from_secs(1);
const OBJECT_CLASSES: [&str; 3] = ["crate", "barrel", "climber"];

struct Args {
    config: Option<PathBuf>,
    save: Option<PathBuf>,
}

fn parse_args() -> OzResult<Args> {
    let mut args = Args {
        config: None,
        save: None,
    };
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--save" => {
                let path = it
                    .next()
                    .ok_or_else(|| OzError::Config("--save needs a path".into()))?;
                args.save = Some(PathBuf::from(path));
            }
            _ if args.config.is_none() && !arg.starts_with("--") => args.config = Some(PathBuf::from(arg)),
            _ => return Err(OzError::Config(format!("unexpected argument '{}'", arg))),
        }
    }
    Ok(args)
}

/// A hut, a pool and a ladder tower around the origin, on top of whatever
/// models the configuration loaded.
fn build_range(matrix: &mut Matrix) {
    let floor = matrix.config().terra_height;
    let hut = Bsp::from_boxes(
        &[
            (Bounds::new([-4.0, -4.0, 0.0], [4.0, -3.5, 3.0]), Material::STRUCT),
            (Bounds::new([-4.0, 3.5, 0.0], [4.0, 4.0, 3.0]), Material::STRUCT),
            (Bounds::new([3.5, -3.5, 0.0], [4.0, 3.5, 3.0]), Material::STRUCT),
            (Bounds::new([-4.0, -4.0, 3.0], [4.0, 4.0, 3.5]), Material::STRUCT),
            (Bounds::new([-3.5, -3.5, 0.0], [3.5, 3.5, 0.1]), Material::SLICK),
        ],
        400.0,
    )
    .with_resistance(10.0);
    let pool = Bsp::from_boxes(
        &[
            (Bounds::new([-6.0, -6.0, -0.5], [6.0, 6.0, 0.0]), Material::STRUCT),
            (Bounds::new([-6.0, -6.0, 0.0], [-5.5, 6.0, 2.0]), Material::STRUCT),
            (Bounds::new([5.5, -6.0, 0.0], [6.0, 6.0, 2.0]), Material::STRUCT),
            (Bounds::new([-5.5, -6.0, 0.0], [5.5, -5.5, 2.0]), Material::STRUCT),
            (Bounds::new([-5.5, 5.5, 0.0], [5.5, 6.0, 2.0]), Material::STRUCT),
            (Bounds::new([-5.5, -5.5, 0.0], [5.5, 5.5, 1.6]), Material::WATER),
        ],
        1000.0,
    );
    let tower = Bsp::from_boxes(
        &[
            (Bounds::new([-1.0, -1.0, 0.0], [1.0, 1.0, 8.0]), Material::STRUCT),
            (Bounds::new([1.0, -0.5, 0.0], [1.2, 0.5, 8.0]), Material::LADDER),
        ],
        800.0,
    );

    let hut = matrix.world.add_bsp(Arc::new(hut));
    let pool = matrix.world.add_bsp(Arc::new(pool));
    let tower = matrix.world.add_bsp(Arc::new(tower));
    matrix.add_structure(hut, [20.0, 0.0, floor], Rotation::R0);
    matrix.add_structure(hut, [0.0, 20.0, floor], Rotation::R90);
    matrix.add_structure(pool, [-20.0, 0.0, floor], Rotation::R0);
    matrix.add_structure(tower, [0.0, -20.0, floor], Rotation::R180);
}

fn spawn_objects(matrix: &mut Matrix, count: usize, rng: &mut StdRng) {
    let floor = matrix.config().terra_height;
    let extent = 40.0;
    let mut placed = 0;
    for _ in 0..count {
        let class = OBJECT_CLASSES[rng.gen_range(0..OBJECT_CLASSES.len())];
        let p = [
            rng.gen_range(-extent..=extent),
            rng.gen_range(-extent..=extent),
            floor + rng.gen_range(1.0..=10.0),
        ];
        if matrix.add_object_by_class(class, p).is_some() {
            placed += 1;
        }
    }
    info!("spawned {} objects", placed);
}

fn run() -> OzResult<()> {
    let args = parse_args()?;

    let mut cvars = CvarContext::new();
    MatrixConfig::register(&mut cvars);
    if let Some(path) = &args.config {
        cvars.load_file(path)?;
    }
    let config = MatrixConfig::from_cvars(&cvars)?;
    let mut rng = StdRng::seed_from_u64(config.seed);

    let mut matrix = Matrix::load(config.clone())?;
    build_range(&mut matrix);
    spawn_objects(&mut matrix, config.spawn_objects, &mut rng);
    if config.spawn_particles > 0 {
        matrix.gen_particles(config.spawn_particles, [0.0, 0.0, 20.0], [0.0, 0.0, 5.0], 6.0, 1.6, 0.01, 5.0);
    }

    info!(
        "running {} ticks ({:.1} s of world time)",
        config.ticks,
        config.ticks as f32 * TICK_TIME
    );
    let handle = MatrixThread::spawn(matrix, Box::new(WanderMind::new(config.seed)))?;
    while !handle.is_finished() {
        thread::sleep(STATS_INTERVAL);
        let stats = handle.snapshot().stats;
        info!(
            "tick {}: {} structures, {} objects, {} particles, {:.2} ms",
            stats.tick, stats.structures, stats.objects, stats.particles, stats.tick_millis
        );
    }

    let matrix = handle
        .join()
        .ok_or_else(|| OzError::Config("simulation thread ended without returning the world".into()))?;
    info!("stopped after {} ticks", matrix.tick_count());

    if let Some(path) = &args.save {
        matrix.world.save(path)?;
    }
    Ok(())
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
