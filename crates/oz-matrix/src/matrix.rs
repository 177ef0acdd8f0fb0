// matrix.rs: Tick driver: owns the world and runs the simulation thread.
//
// One tick clears last tick's events, applies the AI commands, moves
// particles and objects, destroys what ran out of life and finally lets the
// world recycle indices freed two ticks ago.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{bounded, Receiver, Sender};
use log::{debug, info, warn};
use parking_lot::RwLock;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use oz_common::bsp::Bsp;
use oz_common::cvar::{CvarContext, CvarFlags};
use oz_common::error::{OzError, OzResult};
use oz_common::math::{vector_add, vector_length_squared, Rotation, Vec3, EPSILON};
use oz_common::terra::{Terra, QUAD_SIZE};

use crate::collider::Collider;
use crate::nirvana::{Command, Commands, Mind, Snapshot, Stats};
use crate::object::{ClassRegistry, ObjectFlags, Particle};
use crate::physics::{Physics, PhysicsConfig, MAX_VELOCITY2};
use crate::world::{World, CELL_SIZE, MAX_CELLS};

pub const TICK_TIME: f32 = 1.0 / 60.0;
pub const TICK_MILLIS: u64 = 16;

/// Particles thrown out by a collapsing structure.
const BURST_PARTICLES: usize = 24;
const BURST_SPREAD: f32 = 4.0;

// ============================================================
// Configuration
// ============================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatrixConfig {
    pub cell_size: f32,
    pub cells: usize,
    pub terra_quads: usize,
    /// Height of the generated flat terrain when no terrain file is given.
    pub terra_height: f32,
    pub terra_path: Option<PathBuf>,
    pub bsp_paths: Vec<PathBuf>,
    pub tick_millis: u64,
    pub gravity: f32,
    pub max_velocity2: f32,
    /// Ticks to run; 0 runs until stopped.
    pub ticks: u64,
    pub spawn_objects: usize,
    pub spawn_particles: usize,
    pub seed: u64,
}

impl Default for MatrixConfig {
    fn default() -> Self {
        Self {
            cell_size: CELL_SIZE,
            cells: MAX_CELLS,
            terra_quads: 256,
            terra_height: 0.0,
            terra_path: None,
            bsp_paths: Vec::new(),
            tick_millis: TICK_MILLIS,
            gravity: PhysicsConfig::default().gravity,
            max_velocity2: MAX_VELOCITY2,
            ticks: 600,
            spawn_objects: 64,
            spawn_particles: 0,
            seed: 1,
        }
    }
}

impl MatrixConfig {
    /// Registers every variable the matrix reads, with its default.
    pub fn register(cvars: &mut CvarContext) {
        let d = Self::default();
        let archive = CvarFlags::ARCHIVE;
        cvars.get("world.cell_size", &d.cell_size.to_string(), archive | CvarFlags::LATCH);
        cvars.get("world.cells", &d.cells.to_string(), archive | CvarFlags::LATCH);
        cvars.get("terra.quads", &d.terra_quads.to_string(), archive | CvarFlags::LATCH);
        cvars.get("terra.height", &d.terra_height.to_string(), archive);
        cvars.get("terra.path", "", archive);
        cvars.get("bsp.paths", "", archive);
        cvars.get("matrix.tick_millis", &d.tick_millis.to_string(), archive);
        cvars.get("physics.gravity", &d.gravity.to_string(), archive);
        cvars.get("physics.max_velocity2", &d.max_velocity2.to_string(), archive);
        cvars.get("run.ticks", &d.ticks.to_string(), CvarFlags::empty());
        cvars.get("spawn.objects", &d.spawn_objects.to_string(), archive);
        cvars.get("spawn.particles", &d.spawn_particles.to_string(), archive);
        cvars.get("spawn.seed", &d.seed.to_string(), CvarFlags::empty());
    }

    pub fn from_cvars(cvars: &CvarContext) -> OzResult<Self> {
        let count = |name: &str| -> OzResult<usize> {
            let v = cvars.variable_value(name);
            if v < 0.0 || v.fract() != 0.0 {
                return Err(OzError::Config(format!("{} must be a whole number, got {}", name, v)));
            }
            Ok(v as usize)
        };
        let path = |name: &str| {
            let s = cvars.variable_string(name);
            (!s.is_empty()).then(|| PathBuf::from(s))
        };

        let config = Self {
            cell_size: cvars.variable_value("world.cell_size"),
            cells: count("world.cells")?,
            terra_quads: count("terra.quads")?,
            terra_height: cvars.variable_value("terra.height"),
            terra_path: path("terra.path"),
            bsp_paths: cvars.variable_list("bsp.paths").into_iter().map(PathBuf::from).collect(),
            tick_millis: count("matrix.tick_millis")? as u64,
            gravity: cvars.variable_value("physics.gravity"),
            max_velocity2: cvars.variable_value("physics.max_velocity2"),
            ticks: count("run.ticks")? as u64,
            spawn_objects: count("spawn.objects")?,
            spawn_particles: count("spawn.particles")?,
            seed: count("spawn.seed")? as u64,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> OzResult<()> {
        if self.cells == 0 || self.cell_size <= 0.0 {
            return Err(OzError::Config(format!(
                "world needs a positive grid, got {} cells of {}",
                self.cells, self.cell_size
            )));
        }
        if self.terra_quads == 0 {
            return Err(OzError::Config("terra.quads must be positive".into()));
        }
        if self.max_velocity2 <= 0.0 {
            return Err(OzError::Config("physics.max_velocity2 must be positive".into()));
        }
        Ok(())
    }

    pub fn physics(&self) -> PhysicsConfig {
        PhysicsConfig {
            gravity: self.gravity,
            tick_time: TICK_TIME,
        }
    }
}

// ============================================================
// Matrix
// ============================================================

pub struct Matrix {
    pub world: World,
    pub physics: Physics,
    pub classes: ClassRegistry,
    config: MatrixConfig,
    ticks: u64,
    rng: StdRng,
    last_tick_millis: f32,
}

impl Matrix {
    /// Empty world over generated flat terrain.
    pub fn new(config: MatrixConfig) -> Self {
        let terra = Terra::flat(config.terra_quads, QUAD_SIZE, config.terra_height);
        Self::with_terra(config, terra)
    }

    fn with_terra(config: MatrixConfig, terra: Terra) -> Self {
        let world_dim = config.cell_size * config.cells as f32 * 0.5;
        if (terra.dim - world_dim).abs() > EPSILON {
            warn!("terrain half-size {} differs from world half-size {}", terra.dim, world_dim);
        }
        Self {
            world: World::new(config.cell_size, config.cells, terra),
            physics: Physics::new(config.physics()),
            classes: ClassRegistry::with_defaults(),
            rng: StdRng::seed_from_u64(config.seed),
            config,
            ticks: 0,
            last_tick_millis: 0.0,
        }
    }

    /// Loads the terrain and BSP models named in the configuration.
    pub fn load(config: MatrixConfig) -> OzResult<Self> {
        config.validate()?;
        let terra = match &config.terra_path {
            Some(path) => Terra::load(path, Some(config.terra_quads))?,
            None => Terra::flat(config.terra_quads, QUAD_SIZE, config.terra_height),
        };
        let bsps = config
            .bsp_paths
            .iter()
            .map(|path| Bsp::load(path).map(Arc::new))
            .collect::<OzResult<Vec<_>>>()?;

        let mut matrix = Self::with_terra(config, terra);
        for bsp in bsps {
            matrix.world.add_bsp(bsp);
        }
        info!(
            "matrix loaded: {}x{} cells, {} models",
            matrix.config.cells,
            matrix.config.cells,
            matrix.world.bsps.len()
        );
        Ok(matrix)
    }

    pub fn config(&self) -> &MatrixConfig {
        &self.config
    }

    pub fn tick_count(&self) -> u64 {
        self.ticks
    }

    pub fn stats(&self) -> Stats {
        Stats {
            tick: self.ticks,
            structures: self.world.structures().count(),
            objects: self.world.objects().count(),
            particles: self.world.particles().count(),
            tick_millis: self.last_tick_millis,
        }
    }

    pub fn add_structure(&mut self, bsp_id: usize, p: Vec3, rotation: Rotation) -> usize {
        self.world.add_structure(bsp_id, p, rotation)
    }

    /// Creates an object of a registered class. A dynamic object placed
    /// inside something gets one de-penetration attempt.
    pub fn add_object_by_class(&mut self, name: &str, p: Vec3) -> Option<usize> {
        let obj = self.classes.create(name, p)?;
        let dynamic = obj.is_dynamic();
        let i = self.world.add_object(obj);
        if dynamic && self.physics.depenetrate(&mut self.world, i) {
            debug!("object {} ({}) nudged out of solid geometry", i, name);
        }
        Some(i)
    }

    /// Spawns `count` particles at `p`, each with `velocity` plus a random
    /// offset of up to `spread` per axis.
    pub fn gen_particles(
        &mut self,
        count: usize,
        p: Vec3,
        velocity: Vec3,
        spread: f32,
        rejection: f32,
        mass: f32,
        lifetime: f32,
    ) {
        for _ in 0..count {
            let jitter = [
                self.rng.gen_range(-spread..=spread),
                self.rng.gen_range(-spread..=spread),
                self.rng.gen_range(-spread..=spread),
            ];
            let mut part = Particle::new(p, vector_add(&velocity, &jitter), rejection, mass, lifetime);
            part.rot_velocity = [
                self.rng.gen_range(-1.0..=1.0),
                self.rng.gen_range(-1.0..=1.0),
                self.rng.gen_range(-1.0..=1.0),
            ];
            part.colour = [self.rng.gen_range(0.5..=1.0); 3];
            self.world.add_particle(part);
        }
    }

    fn apply(&mut self, commands: &Commands) {
        for command in commands.iter() {
            match *command {
                Command::Push { object, momentum } => {
                    if let Some(obj) = self.world.object_mut(object) {
                        obj.flags -= ObjectFlags::DISABLED;
                        if let Some(d) = obj.dynamic_mut() {
                            d.momentum = vector_add(&d.momentum, &momentum);
                        }
                    }
                }
                Command::Use { object } => {
                    if let Some(obj) = self.world.object_mut(object) {
                        let class = self.classes.get(&obj.class);
                        obj.use_by(class);
                    }
                }
                Command::Damage { object, amount } => {
                    if let Some(obj) = self.world.object_mut(object) {
                        obj.damage(amount);
                    }
                }
                Command::Remove { object } => {
                    if let Some(obj) = self.world.object_mut(object) {
                        obj.destroy();
                    }
                }
            }
        }
    }

    /// Advances the simulation by one tick.
    pub fn tick(&mut self, commands: &Commands) {
        let start = Instant::now();

        for i in 0..self.world.object_slots() {
            if let Some(obj) = self.world.object_mut(i) {
                obj.events.clear();
            }
        }
        self.apply(commands);

        self.tick_particles();
        self.tick_objects();
        self.tick_structures();

        self.world.update();
        self.ticks += 1;
        self.last_tick_millis = start.elapsed().as_secs_f32() * 1000.0;
    }

    fn tick_particles(&mut self) {
        let max_velocity2 = self.config.max_velocity2;
        for i in 0..self.world.particle_slots() {
            let Some(part) = self.world.particle_mut(i) else {
                continue;
            };
            part.update();
            self.physics.update_particle(&mut self.world, i);

            let spent = self
                .world
                .particle(i)
                .map_or(false, |p| p.lifetime <= 0.0 || vector_length_squared(&p.velocity) > max_velocity2);
            if spent {
                self.world.remove_particle(i);
            }
        }
    }

    fn tick_objects(&mut self) {
        let max_velocity2 = self.config.max_velocity2;
        for i in 0..self.world.object_slots() {
            let Some(obj) = self.world.object_mut(i) else {
                continue;
            };
            // Destroyed last tick, so observers have seen the DESTROY event.
            if obj.flags.contains(ObjectFlags::DESTROYED) {
                self.world.remove_object(i);
                debug!("object {} removed", i);
                continue;
            }

            let class = self.classes.get(&obj.class);
            obj.update(class);

            if obj.is_dynamic() && obj.cell.is_some() {
                self.physics.update_object(&mut self.world, i);
                let lost = self
                    .world
                    .object(i)
                    .map_or(false, |o| vector_length_squared(&o.velocity()) > max_velocity2);
                if lost {
                    warn!("object {} left the world at excessive speed", i);
                    self.world.remove_object(i);
                    continue;
                }
            }

            if let Some(obj) = self.world.object_mut(i) {
                if obj.life <= 0.0 {
                    obj.destroy();
                    debug!("object {} ({}) destroyed", i, obj.class);
                }
            }
        }
    }

    fn tick_structures(&mut self) {
        for i in 0..self.world.structure_slots() {
            let Some(s) = self.world.structure(i) else {
                continue;
            };
            if s.life > 0.0 {
                continue;
            }
            let bounds = s.bounds;
            Collider::touch_overlaps(&mut self.world, &bounds.to_aabb(), 4.0 * EPSILON);
            self.gen_particles(BURST_PARTICLES, bounds.center(), [0.0; 3], BURST_SPREAD, 1.5, 0.0, 2.0);
            self.world.remove_structure(i);
            debug!("structure {} collapsed", i);
        }
    }
}

// ============================================================
// Threads
// ============================================================

/// Owner of the running simulation. Readers take the snapshot; `join`
/// returns the matrix once the loop ends.
pub struct MatrixHandle {
    shutdown: Arc<AtomicBool>,
    snapshot: Arc<RwLock<Arc<Snapshot>>>,
    matrix_thread: JoinHandle<Option<Matrix>>,
    nirvana_thread: JoinHandle<()>,
}

impl MatrixHandle {
    /// Latest tick-boundary snapshot.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot.read().clone()
    }

    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    pub fn is_finished(&self) -> bool {
        self.matrix_thread.is_finished()
    }

    /// Waits for both threads. `None` if the AI thread went away while it
    /// held the matrix.
    pub fn join(self) -> Option<Matrix> {
        let matrix = self.matrix_thread.join().ok().flatten();
        if self.nirvana_thread.join().is_err() {
            warn!("nirvana thread panicked");
        }
        matrix
    }
}

pub struct MatrixThread;

impl MatrixThread {
    /// Starts the simulation and AI threads. The loop runs `config.ticks`
    /// ticks, or until stopped when that is 0.
    pub fn spawn(matrix: Matrix, mind: Box<dyn Mind>) -> OzResult<MatrixHandle> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let snapshot = Arc::new(RwLock::new(Arc::new(Snapshot::capture(&matrix.world, matrix.stats()))));

        // Rendezvous: the matrix itself travels to the AI thread and back.
        let (to_nirvana, nirvana_rx) = bounded::<Matrix>(0);
        let (nirvana_tx, from_nirvana) = bounded::<(Matrix, Commands)>(0);

        let nirvana_thread = thread::Builder::new()
            .name("nirvana".into())
            .spawn(move || nirvana_loop(mind, nirvana_rx, nirvana_tx))?;

        let loop_shutdown = shutdown.clone();
        let loop_snapshot = snapshot.clone();
        let matrix_thread = thread::Builder::new()
            .name("matrix".into())
            .spawn(move || matrix_loop(matrix, loop_shutdown, loop_snapshot, to_nirvana, from_nirvana))?;

        Ok(MatrixHandle {
            shutdown,
            snapshot,
            matrix_thread,
            nirvana_thread,
        })
    }
}

fn matrix_loop(
    mut matrix: Matrix,
    shutdown: Arc<AtomicBool>,
    snapshot: Arc<RwLock<Arc<Snapshot>>>,
    to_nirvana: Sender<Matrix>,
    from_nirvana: Receiver<(Matrix, Commands)>,
) -> Option<Matrix> {
    let budget = Duration::from_millis(matrix.config.tick_millis);
    let limit = matrix.config.ticks;
    let mut commands = Commands::new();

    info!("matrix thread started");
    while !shutdown.load(Ordering::Relaxed) && (limit == 0 || matrix.tick_count() < limit) {
        let start = Instant::now();

        matrix.tick(&commands);
        let snap = Snapshot::capture(&matrix.world, matrix.stats());
        *snapshot.write() = Arc::new(snap);

        if to_nirvana.send(matrix).is_err() {
            warn!("nirvana thread is gone");
            return None;
        }
        (matrix, commands) = match from_nirvana.recv() {
            Ok(reply) => reply,
            Err(_) => {
                warn!("nirvana thread dropped the matrix");
                return None;
            }
        };

        let elapsed = start.elapsed();
        if elapsed > budget {
            warn!(
                "tick {} took {} ms, budget {} ms",
                matrix.tick_count(),
                elapsed.as_millis(),
                budget.as_millis()
            );
        } else {
            thread::sleep(budget - elapsed);
        }
    }
    info!("matrix thread stopped after {} ticks", matrix.tick_count());
    Some(matrix)
}

fn nirvana_loop(mut mind: Box<dyn Mind>, rx: Receiver<Matrix>, tx: Sender<(Matrix, Commands)>) {
    while let Ok(matrix) = rx.recv() {
        let mut commands = Commands::new();
        mind.think(&matrix.world, &mut commands);
        if tx.send((matrix, commands)).is_err() {
            break;
        }
    }
    debug!("nirvana thread stopped");
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nirvana::{IdleMind, WanderMind};
    use crate::object::EventId;
    use oz_common::bsp::Material;

    fn small_config() -> MatrixConfig {
        MatrixConfig {
            cell_size: 4.0,
            cells: 16,
            terra_quads: 4,
            ticks: 5,
            tick_millis: 1,
            spawn_objects: 0,
            ..Default::default()
        }
    }

    #[test]
    fn test_config_from_toml_cvars() {
        let mut cvars = CvarContext::new();
        MatrixConfig::register(&mut cvars);
        cvars
            .load_str("[world]\ncells = 32\n[physics]\ngravity = -5.0\n[bsp]\npaths = \"a.bsp, b.bsp\"\n")
            .unwrap();
        let config = MatrixConfig::from_cvars(&cvars).unwrap();
        assert_eq!(config.cells, 32);
        assert_eq!(config.cell_size, CELL_SIZE);
        assert_eq!(config.gravity, -5.0);
        assert_eq!(config.bsp_paths, vec![PathBuf::from("a.bsp"), PathBuf::from("b.bsp")]);
        assert_eq!(config.terra_path, None);

        cvars.set("world.cells", "0");
        assert!(matches!(MatrixConfig::from_cvars(&cvars), Err(OzError::Config(_))));
        cvars.set("world.cells", "2.5");
        assert!(MatrixConfig::from_cvars(&cvars).is_err());
    }

    #[test]
    fn test_missing_bsp_aborts_load() {
        let config = MatrixConfig {
            bsp_paths: vec![PathBuf::from("/nonexistent/oz/model.bsp")],
            ..small_config()
        };
        assert!(matches!(Matrix::load(config), Err(OzError::Io(_))));
    }

    #[test]
    fn test_destroyed_object_removed_next_tick() {
        let mut m = Matrix::new(small_config());
        let i = m.add_object_by_class("crate", [0.0, 0.0, 0.6]).unwrap();

        let mut commands = Commands::new();
        commands.remove(i);
        m.tick(&commands);
        let obj = m.world.object(i).unwrap();
        assert!(obj.flags.contains(ObjectFlags::DESTROYED));
        assert!(obj.events.iter().any(|e| e.id == EventId::Destroy));

        m.tick(&Commands::new());
        assert!(m.world.object(i).is_none());
        // Not reusable until another tick boundary passes.
        let j = m.add_object_by_class("crate", [4.0, 0.0, 0.6]).unwrap();
        assert_ne!(i, j);
    }

    #[test]
    fn test_push_wakes_and_moves() {
        let mut m = Matrix::new(small_config());
        let i = m.add_object_by_class("crate", [0.0, 0.0, 0.502]).unwrap();
        for _ in 0..10 {
            m.tick(&Commands::new());
        }
        assert!(m.world.object(i).unwrap().flags.contains(ObjectFlags::DISABLED));

        let mut commands = Commands::new();
        commands.push(i, [5.0, 0.0, 0.0]);
        m.tick(&commands);
        let obj = m.world.object(i).unwrap();
        assert!(!obj.flags.contains(ObjectFlags::DISABLED));
        assert!(obj.aabb.p[0] > 0.0);
    }

    #[test]
    fn test_particles_expire() {
        let mut m = Matrix::new(small_config());
        m.gen_particles(10, [0.0, 0.0, 5.0], [0.0; 3], 1.0, 1.5, 0.0, 2.0 * TICK_TIME);
        assert_eq!(m.stats().particles, 10);
        m.tick(&Commands::new());
        assert_eq!(m.stats().particles, 10);
        m.tick(&Commands::new());
        assert_eq!(m.stats().particles, 0);
    }

    #[test]
    fn test_lost_object_removed() {
        let mut m = Matrix::new(small_config());
        let i = m.add_object_by_class("crate", [0.0, 0.0, 10.0]).unwrap();
        let mut commands = Commands::new();
        commands.push(i, [0.0, 0.0, 2000.0]);
        m.tick(&commands);
        assert!(m.world.object(i).is_none());
    }

    #[test]
    fn test_collapsing_structure_bursts_and_wakes() {
        let mut m = Matrix::new(small_config());
        let id = m.world.add_bsp(Arc::new(Bsp::single_brush([-1.0, -1.0, 0.0], [1.0, 1.0, 2.0], Material::STRUCT)));
        let s = m.add_structure(id, [0.0, 0.0, 0.0], Rotation::R0);
        let top = m.add_object_by_class("crate", [0.0, 0.0, 2.502]).unwrap();
        for _ in 0..10 {
            m.tick(&Commands::new());
        }
        assert!(m.world.object(top).unwrap().flags.contains(ObjectFlags::DISABLED));

        m.world.structure_mut(s).unwrap().life = 0.0;
        m.tick(&Commands::new());
        assert!(m.world.structure(s).is_none());
        assert!(m.stats().particles > 0);
        assert!(!m.world.object(top).unwrap().flags.contains(ObjectFlags::DISABLED));
    }

    #[test]
    fn test_threads_run_to_limit() {
        let mut m = Matrix::new(small_config());
        m.add_object_by_class("crate", [0.0, 0.0, 3.0]);
        let handle = MatrixThread::spawn(m, Box::new(IdleMind)).unwrap();
        let m = handle.join().unwrap();
        assert_eq!(m.tick_count(), 5);
    }

    #[test]
    fn test_threads_stop_and_publish() {
        let mut config = small_config();
        config.ticks = 0;
        let mut m = Matrix::new(config);
        m.add_object_by_class("barrel", [2.0, 2.0, 3.0]);
        let handle = MatrixThread::spawn(m, Box::new(WanderMind::new(3))).unwrap();
        while handle.snapshot().stats.tick < 3 {
            thread::sleep(Duration::from_millis(1));
        }
        handle.stop();
        let snap = handle.snapshot();
        assert_eq!(snap.objects.len(), 1);
        let m = handle.join().unwrap();
        assert!(m.tick_count() >= 3);
    }
}
