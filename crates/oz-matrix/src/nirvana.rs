// nirvana.rs: The AI side of the tick handoff, and the snapshot readers see.
//
// A mind only ever gets `&World`, and only while the matrix thread is parked
// waiting for its commands. Everything it wants changed goes through
// `Commands`, applied by the matrix at the start of the next tick.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use oz_common::math::Vec3;

use crate::object::{Event, ObjectFlags};
use crate::world::World;

// ============================================================
// Commands
// ============================================================

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Adds to the pending momentum of a dynamic object and wakes it.
    Push { object: usize, momentum: Vec3 },
    Use { object: usize },
    Damage { object: usize, amount: f32 },
    /// Destroys the object; its slot is freed on the following tick.
    Remove { object: usize },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Commands {
    queue: Vec<Command>,
}

impl Commands {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, object: usize, momentum: Vec3) {
        self.queue.push(Command::Push { object, momentum });
    }

    pub fn use_object(&mut self, object: usize) {
        self.queue.push(Command::Use { object });
    }

    pub fn damage(&mut self, object: usize, amount: f32) {
        self.queue.push(Command::Damage { object, amount });
    }

    pub fn remove(&mut self, object: usize) {
        self.queue.push(Command::Remove { object });
    }

    pub fn iter(&self) -> impl Iterator<Item = &Command> {
        self.queue.iter()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

// ============================================================
// Minds
// ============================================================

pub trait Mind: Send {
    fn think(&mut self, world: &World, commands: &mut Commands);
}

/// Does nothing.
#[derive(Debug, Default)]
pub struct IdleMind;

impl Mind for IdleMind {
    fn think(&mut self, _world: &World, _commands: &mut Commands) {}
}

/// Nudges random dynamic objects around.
pub struct WanderMind {
    rng: StdRng,
    /// Probability per object per tick of a push.
    pub chance: f64,
    /// Largest horizontal momentum of a push.
    pub strength: f32,
}

impl WanderMind {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            chance: 0.01,
            strength: 2.0,
        }
    }
}

impl Mind for WanderMind {
    fn think(&mut self, world: &World, commands: &mut Commands) {
        for (i, obj) in world.objects() {
            if !obj.is_dynamic() || obj.flags.intersects(ObjectFlags::DESTROYED | ObjectFlags::CUT) {
                continue;
            }
            if self.rng.gen_bool(self.chance) {
                let s = self.strength;
                let momentum = [self.rng.gen_range(-s..=s), self.rng.gen_range(-s..=s), 0.0];
                commands.push(i, momentum);
            }
        }
    }
}

// ============================================================
// Snapshot
// ============================================================

/// What a reader needs of one object.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectView {
    pub class: String,
    pub p: Vec3,
    pub velocity: Vec3,
    pub flags: ObjectFlags,
    pub events: Vec<Event>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Stats {
    pub tick: u64,
    pub structures: usize,
    pub objects: usize,
    pub particles: usize,
    /// Wall-clock time of the last tick's simulation work.
    pub tick_millis: f32,
}

/// Consistent copy of the world taken at a tick boundary. Slots mirror the
/// world tables, so a `None` at a previously live index means removal.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub stats: Stats,
    pub structures: Vec<Option<f32>>,
    pub objects: Vec<Option<ObjectView>>,
    pub particles: Vec<Option<Vec3>>,
}

impl Snapshot {
    pub fn capture(world: &World, stats: Stats) -> Self {
        let structures = (0..world.structure_slots())
            .map(|i| world.structure(i).map(|s| s.life))
            .collect();
        let objects = (0..world.object_slots())
            .map(|i| {
                world.object(i).map(|o| ObjectView {
                    class: o.class.clone(),
                    p: o.aabb.p,
                    velocity: o.velocity(),
                    flags: o.flags,
                    events: o.events.clone(),
                })
            })
            .collect();
        let particles = (0..world.particle_slots())
            .map(|i| world.particle(i).map(|p| p.p))
            .collect();
        Self {
            stats,
            structures,
            objects,
            particles,
        }
    }
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{ClassRegistry, EventId};
    use oz_common::terra::Terra;

    fn small_world() -> World {
        World::new(4.0, 8, Terra::flat(2, 16.0, 0.0))
    }

    #[test]
    fn test_wander_pushes_dynamic_objects_only() {
        let mut w = small_world();
        let reg = ClassRegistry::with_defaults();
        let crate_i = w.add_object(reg.create("crate", [0.0, 0.0, 1.0]).unwrap());
        let rock = w.add_object(reg.create("rock", [4.0, 0.0, 1.0]).unwrap());

        let mut mind = WanderMind::new(7);
        mind.chance = 1.0;
        let mut commands = Commands::new();
        mind.think(&w, &mut commands);

        assert_eq!(commands.len(), 1);
        match commands.iter().next() {
            Some(Command::Push { object, momentum }) => {
                assert_eq!(*object, crate_i);
                assert_ne!(*object, rock);
                assert!(momentum[0].abs() <= mind.strength && momentum[1].abs() <= mind.strength);
                assert_eq!(momentum[2], 0.0);
            }
            other => panic!("unexpected command {:?}", other),
        };
    }

    #[test]
    fn test_wander_is_reproducible() {
        let mut w = small_world();
        let reg = ClassRegistry::with_defaults();
        for x in 0..5 {
            w.add_object(reg.create("barrel", [x as f32 * 2.0 - 4.0, 0.0, 1.0]).unwrap());
        }
        let run = || {
            let mut mind = WanderMind::new(42);
            mind.chance = 0.5;
            let mut c = Commands::new();
            mind.think(&w, &mut c);
            c
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_snapshot_mirrors_slots() {
        let mut w = small_world();
        let reg = ClassRegistry::with_defaults();
        let a = w.add_object(reg.create("crate", [1.0, 2.0, 3.0]).unwrap());
        let b = w.add_object(reg.create("crate", [-1.0, 0.0, 3.0]).unwrap());
        w.remove_object(a);

        let snap = Snapshot::capture(&w, Stats { tick: 9, ..Default::default() });
        assert_eq!(snap.stats.tick, 9);
        assert_eq!(snap.objects.len(), 2);
        assert!(snap.objects[a].is_none());
        let view = snap.objects[b].as_ref().unwrap();
        assert_eq!(view.p, [-1.0, 0.0, 3.0]);
        assert_eq!(view.class, "crate");
        assert_eq!(view.events[0].id, EventId::Create);
    }

    #[test]
    fn test_commands_queue() {
        let mut c = Commands::new();
        assert!(c.is_empty());
        c.push(1, [1.0, 0.0, 0.0]);
        c.use_object(2);
        c.damage(3, 10.0);
        c.remove(4);
        assert_eq!(c.len(), 4);
        assert_eq!(c.iter().last(), Some(&Command::Remove { object: 4 }));
        c.clear();
        assert!(c.is_empty());
    }
}
