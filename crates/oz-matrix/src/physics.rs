// physics.rs: Per-tick integrator for dynamic objects and particles.
//
// Each body gets friction and gravity folded into its momentum, then the
// displacement is swept through the collider with up to three re-traces that
// slide along the surfaces hit on the way.

use serde::{Deserialize, Serialize};

use oz_common::bsp::Material;
use oz_common::math::{
    cross_product, dot_product, vector_add, vector_is_zero, vector_length_squared, vector_ma,
    vector_normalize, vector_scale, vector_subtract, Aabb, Bounds, Vec3, EPSILON, VEC3_ORIGIN,
};

use crate::collider::{Collider, Hit};
use crate::matrix::TICK_TIME;
use crate::object::{Dynamic, EventId, Object, ObjectFlags, ObjectKind};
use crate::world::World;

// ============================================================
// Physics constants
// ============================================================

pub const CLIP_BACKOFF: f32 = EPSILON;
pub const HIT_THRESHOLD: f32 = -2.0;
pub const SPLASH_THRESHOLD: f32 = -2.0;
pub const FLOOR_NORMAL_Z: f32 = 0.60;
pub const WEIGHT_FACTOR: f32 = 0.1;

pub const STICK_VELOCITY: f32 = 0.015;
pub const SLICK_STICK_VELOCITY: f32 = 0.0001;
pub const AIR_STICK_VELOCITY: f32 = 0.0001;

pub const AIR_FRICTION: f32 = 0.02;
pub const IN_WATER_FRICTION: f32 = 0.08;
pub const LADDER_FRICTION: f32 = 0.65;
pub const FLOOR_FRICTION: f32 = 0.40;
pub const OBJ_FRICTION: f32 = 0.40;
pub const SLICK_FRICTION: f32 = 0.02;

pub const PART_HIT_VELOCITY2: f32 = 100.0;
pub const PART_DESTROY_VELOCITY2: f32 = 900.0;

/// Bodies faster than this are lost and removed by the matrix.
pub const MAX_VELOCITY2: f32 = 1_000_000.0;

const MAX_TRACE_SPLITS: usize = 3;

/// Particles only collide with static geometry.
const PARTICLE_MASK: Material = Material::TERRAIN.union(Material::STRUCT).union(Material::SLICK);

const FLOOR_CLEAR_MASK: ObjectFlags = ObjectFlags::DISABLED
    .union(ObjectFlags::ON_FLOOR)
    .union(ObjectFlags::IN_WATER)
    .union(ObjectFlags::ON_LADDER)
    .union(ObjectFlags::ON_SLICK);

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhysicsConfig {
    pub gravity: f32,
    pub tick_time: f32,
}

impl Default for PhysicsConfig {
    fn default() -> Self {
        Self {
            gravity: -9.81,
            tick_time: TICK_TIME,
        }
    }
}

/// Motion of the dynamic object another one is standing on.
#[derive(Debug, Clone, Copy)]
struct Lower {
    velocity: Vec3,
    disabled: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Physics {
    pub config: PhysicsConfig,
}

impl Physics {
    pub fn new(config: PhysicsConfig) -> Self {
        Self { config }
    }

    /// Velocity gained from gravity in one tick.
    #[inline]
    pub fn g_velocity(&self) -> f32 {
        self.config.gravity * self.config.tick_time
    }

    // ============================================================
    // Particles
    // ============================================================

    pub fn update_particle(&self, world: &mut World, index: usize) {
        let Some(part) = world.particle(index) else {
            return;
        };
        let mut p = part.p;
        let mut velocity = part.velocity;
        let mut lifetime = part.lifetime;
        let (rejection, mass) = (part.rejection, part.mass);

        velocity[2] += self.g_velocity();
        let mut mv = vector_scale(&velocity, self.config.tick_time);
        let mut damage = Vec::new();

        let collider = Collider::new(world).with_mask(PARTICLE_MASK);
        let mut splits = 0;
        loop {
            let hit = collider.translate_point(&p, &mv);
            p = vector_ma(&p, hit.ratio, &mv);
            if hit.ratio == 1.0 {
                break;
            }

            let velocity2 = vector_length_squared(&velocity);
            if velocity2 >= PART_HIT_VELOCITY2 {
                if velocity2 >= PART_DESTROY_VELOCITY2 {
                    lifetime = 0.0;
                }
                if let Some(s) = hit.structure.filter(|_| mass != 0.0) {
                    damage.push((s, velocity2 * mass));
                }
            }
            let hit_momentum = dot_product(&velocity, &hit.normal);
            velocity = vector_ma(&velocity, -rejection * hit_momentum, &hit.normal);

            // A spent particle must not bounce on and hit something else.
            if splits >= MAX_TRACE_SPLITS || lifetime <= 0.0 {
                break;
            }
            splits += 1;
            mv = clip_move(&mv, &hit);
        }

        for (s, amount) in damage {
            if let Some(s) = world.structure_mut(s) {
                s.damage(amount);
            }
        }
        if let Some(part) = world.particle_mut(index) {
            part.p = p;
            part.velocity = velocity;
            part.lifetime = lifetime;
        }
        world.reposition_particle(index);
    }

    // ============================================================
    // Objects
    // ============================================================

    pub fn update_object(&self, world: &mut World, index: usize) {
        let Some(obj) = world.object_mut(index) else {
            return;
        };
        debug_assert!(obj.is_dynamic(), "physics on static object {}", index);
        if obj.cell.is_none() {
            return;
        }
        obj.flags -= ObjectFlags::TICK_CLEAR_MASK;

        let lower = obj.dynamic().and_then(|d| d.lower);
        let lower = lower.and_then(|l| {
            world
                .object(l)
                .filter(|o| o.cell.is_some())
                .map(|o| Lower {
                    velocity: o.velocity(),
                    disabled: o.flags.contains(ObjectFlags::DISABLED),
                })
        });

        let Some(obj) = world.object_mut(index) else {
            return;
        };
        let dim_z = obj.aabb.dim[2];
        let old_p = obj.aabb.p;
        let Parts { flags, dynamic } = split(obj);
        let Some(dynamic) = dynamic else {
            return;
        };

        match lower {
            None if dynamic.lower.is_some() => {
                *flags -= ObjectFlags::DISABLED;
                dynamic.lower = None;
            }
            Some(l) if !l.disabled => *flags -= ObjectFlags::DISABLED,
            _ => {}
        }
        if flags.contains(ObjectFlags::DISABLED) {
            return;
        }

        if self.friction(flags, dynamic, dim_z, lower) {
            self.move_object(world, index);
            if let Some(obj) = world.object_mut(index) {
                let moved = vector_subtract(&obj.aabb.p, &old_p);
                let newly_fricting = obj.flags.contains(ObjectFlags::FRICTING)
                    && !obj.old_flags.contains(ObjectFlags::FRICTING);
                if let Some(d) = obj.dynamic_mut() {
                    d.velocity = vector_scale(&moved, 1.0 / self.config.tick_time);
                    d.momentum = d.velocity;
                }
                if newly_fricting {
                    obj.add_event(EventId::Fricting, 1.0);
                }
            }
        } else {
            debug_assert!(vector_is_zero(&dynamic.momentum));
            *flags |= ObjectFlags::DISABLED;
            dynamic.velocity = VEC3_ORIGIN;
        }
    }

    /// Applies friction and gravity to the momentum. Returns false when the
    /// object has come to rest and may be disabled.
    fn friction(
        &self,
        flags: &mut ObjectFlags,
        d: &mut Dynamic,
        dim_z: f32,
        lower: Option<Lower>,
    ) -> bool {
        let g = self.g_velocity();
        let lift = (0.5 * d.depth / dim_z) * d.lift * self.config.tick_time;
        let m = &mut d.momentum;

        if flags.intersects(ObjectFlags::HOVER | ObjectFlags::ON_LADDER) || d.depth >= dim_z {
            if flags.contains(ObjectFlags::HOVER) {
                if vector_length_squared(m) <= AIR_STICK_VELOCITY {
                    *m = VEC3_ORIGIN;
                } else {
                    *m = vector_scale(m, 1.0 - AIR_FRICTION);
                }
            } else if flags.contains(ObjectFlags::IN_WATER) {
                *m = vector_scale(m, 1.0 - IN_WATER_FRICTION);
                m[2] += lift + g;
            } else if flags.contains(ObjectFlags::ON_LADDER) {
                if vector_length_squared(m) <= STICK_VELOCITY {
                    *m = VEC3_ORIGIN;
                } else {
                    *m = vector_scale(m, 1.0 - LADDER_FRICTION);
                }
            }
        } else {
            if flags.contains(ObjectFlags::IN_WATER) {
                m[2] += lift;
            }

            if let Some(lower) = lower {
                if m[0] != 0.0 || m[1] != 0.0 || !lower.disabled {
                    let dx = lower.velocity[0] - m[0];
                    let dy = lower.velocity[1] - m[1];

                    if dx * dx + dy * dy > STICK_VELOCITY {
                        m[0] += dx * OBJ_FRICTION;
                        m[1] += dy * OBJ_FRICTION;
                        m[2] += g;
                        *flags |= ObjectFlags::FRICTING;
                    } else {
                        m[0] = lower.velocity[0];
                        m[1] = lower.velocity[1];
                        m[2] += g;

                        if lower.disabled && m[2] < 0.0 {
                            *m = VEC3_ORIGIN;
                            return false;
                        }
                    }
                } else if m[2] > 0.0 {
                    m[2] += g;
                } else {
                    m[2] = 0.0;
                    return false;
                }
            } else if flags.contains(ObjectFlags::ON_FLOOR) {
                let (stick, friction) = if flags.contains(ObjectFlags::ON_SLICK) {
                    (SLICK_STICK_VELOCITY, SLICK_FRICTION)
                } else {
                    (STICK_VELOCITY, FLOOR_FRICTION)
                };

                if m[0] * m[0] + m[1] * m[1] > stick {
                    m[0] *= 1.0 - friction;
                    m[1] *= 1.0 - friction;
                    *m = vector_ma(m, g * d.floor[2], &d.floor);
                    *flags |= ObjectFlags::FRICTING;
                } else {
                    m[0] = 0.0;
                    m[1] = 0.0;

                    if m[2] > 0.0 {
                        m[2] += g;
                    } else {
                        m[2] = 0.0;
                        return false;
                    }
                }
            } else {
                m[0] *= 1.0 - AIR_FRICTION;
                m[1] *= 1.0 - AIR_FRICTION;
                m[2] += g;
            }
        }

        *flags -= FLOOR_CLEAR_MASK;
        d.lower = None;
        true
    }

    fn move_object(&self, world: &mut World, index: usize) {
        let Some(momentum) = world.object(index).and_then(|o| o.dynamic()).map(|d| d.momentum)
        else {
            return;
        };
        let mut mv = vector_scale(&momentum, self.config.tick_time);
        let mut dir = mv;
        vector_normalize(&mut dir);
        let mut last_normals = [VEC3_ORIGIN; 2];

        let mut splits = 0;
        let hit = loop {
            let hit = Collider::new(world).translate_object(index, &mv);
            if let Some(obj) = world.object_mut(index) {
                obj.aabb.p = vector_ma(&obj.aabb.p, hit.ratio, &mv);
            }
            if hit.ratio == 1.0 {
                break hit;
            }
            self.hit_object(world, index, &hit);

            if splits >= MAX_TRACE_SPLITS {
                break hit;
            }
            splits += 1;
            mv = hold_direction(&clip_move(&mv, &hit), &dir);

            // Sharp corners fold the move along their crease.
            if splits == 1 {
                last_normals[0] = hit.normal;
            } else {
                fold_corner(&mut mv, &last_normals[0], &hit.normal);
                if splits == 2 {
                    last_normals[1] = last_normals[0];
                    last_normals[0] = hit.normal;
                } else {
                    fold_corner(&mut mv, &last_normals[1], &hit.normal);
                }
            }
        };

        if let Some(obj) = world.object_mut(index) {
            if hit.in_water {
                obj.flags |= ObjectFlags::IN_WATER;
            }
            if hit.on_ladder {
                obj.flags |= ObjectFlags::ON_LADDER;
            }
            if obj.flags.intersects(ObjectFlags::IN_WATER | ObjectFlags::ON_LADDER) {
                obj.flags -= ObjectFlags::ON_FLOOR | ObjectFlags::ON_SLICK;
            }
            let dim_z = obj.aabb.dim[2];
            let entered = obj.flags.contains(ObjectFlags::IN_WATER)
                && !obj.old_flags.contains(ObjectFlags::IN_WATER);
            let mut splash = None;
            if let Some(d) = obj.dynamic_mut() {
                d.depth = hit.water_depth.min(2.0 * dim_z);
                if entered && d.velocity[2] <= SPLASH_THRESHOLD {
                    splash = Some(d.velocity[2]);
                }
            }
            if let Some(v) = splash {
                obj.splash(v);
            }
        }
        world.reposition_object(index);
    }

    /// Collision response for object `index` against whatever `hit` found.
    fn hit_object(&self, world: &mut World, index: usize, hit: &Hit) {
        let n = hit.normal;
        let other = hit
            .object
            .filter(|&j| world.object(j).is_some_and(|o| o.is_dynamic()));

        if let Some(j) = other {
            let Some((obj, s_obj)) = world.object_pair_mut(index, j) else {
                return;
            };
            let pusher = obj.flags.contains(ObjectFlags::PUSHER);
            let (Some(a), Some(b)) = (obj.dynamic(), s_obj.dynamic()) else {
                return;
            };
            let total = a.mass + b.mass;
            let momentum = if total > 0.0 {
                vector_scale(
                    &vector_add(&vector_scale(&a.momentum, a.mass), &vector_scale(&b.momentum, b.mass)),
                    1.0 / total,
                )
            } else {
                VEC3_ORIGIN
            };
            let hit_momentum = dot_product(&vector_subtract(&a.momentum, &b.momentum), &n);
            let hit_velocity = dot_product(&a.velocity, &n);
            let mass = a.mass;

            if hit_momentum <= HIT_THRESHOLD && hit_velocity <= HIT_THRESHOLD {
                obj.hit(hit_momentum);
                s_obj.hit(hit_momentum);
            }

            if n[2] == 0.0 {
                s_obj.flags -= ObjectFlags::DISABLED;
                let (Some(a), Some(b)) = (obj.dynamic_mut(), s_obj.dynamic_mut()) else {
                    return;
                };
                if pusher {
                    a.momentum[0] = b.velocity[0];
                    a.momentum[1] = b.velocity[1];
                    b.momentum[0] = momentum[0];
                    b.momentum[1] = momentum[1];
                } else if n[1] == 0.0 {
                    a.momentum[0] = b.velocity[0];
                    b.momentum[0] = momentum[0];
                } else {
                    a.momentum[1] = b.velocity[1];
                    b.momentum[1] = momentum[1];
                }
            } else if n[2] < 0.0 {
                // Bumped into something from below; it now rests on us.
                obj.flags |= ObjectFlags::UPPER;
                s_obj.flags -= ObjectFlags::DISABLED | ObjectFlags::ON_FLOOR;
                let (Some(a), Some(b)) = (obj.dynamic_mut(), s_obj.dynamic_mut()) else {
                    return;
                };
                b.lower = Some(index);
                a.momentum[2] = b.velocity[2];
                b.momentum[2] = momentum[2];
            } else {
                s_obj.damage(mass * WEIGHT_FACTOR);
                obj.flags -= ObjectFlags::ON_FLOOR;
                let lower_disabled = s_obj.flags.contains(ObjectFlags::DISABLED);
                let (Some(a), Some(b)) = (obj.dynamic_mut(), s_obj.dynamic_mut()) else {
                    return;
                };
                a.lower = Some(j);
                if lower_disabled {
                    a.momentum[2] = 0.0;
                } else {
                    a.momentum[2] = b.velocity[2];
                    b.momentum[2] = momentum[2];
                }
            }
            return;
        }

        let Some(obj) = world.object_mut(index) else {
            return;
        };
        let Some(d) = obj.dynamic_mut() else {
            return;
        };
        let hit_momentum = dot_product(&d.momentum, &n);
        let hit_velocity = dot_product(&d.velocity, &n);
        d.momentum = vector_ma(&d.momentum, -hit_momentum, &n);

        let on_floor = n[2] >= FLOOR_NORMAL_Z;
        if on_floor {
            d.lower = None;
            d.floor = n;
            obj.flags |= ObjectFlags::ON_FLOOR;
            if hit.material.contains(Material::SLICK) {
                obj.flags |= ObjectFlags::ON_SLICK;
            }
        }

        if hit_momentum <= HIT_THRESHOLD && hit_velocity <= HIT_THRESHOLD {
            obj.hit(hit_momentum);
            if let Some(s_obj) = hit.object.and_then(|j| world.object_mut(j)) {
                s_obj.hit(hit_momentum);
            }
        }
    }

    // ============================================================
    // De-penetration
    // ============================================================

    /// Single best-effort push of an object out of whatever it was placed
    /// into. The object moves by at most its own size along one axis; if it is
    /// still blocked afterwards it is put back. Returns true if it moved.
    pub fn depenetrate(&self, world: &mut World, index: usize) -> bool {
        let Some(obj) = world.object(index) else {
            return false;
        };
        let aabb = obj.aabb;
        let collider = Collider::new(world).excluding(index);
        if !collider.test_aabb(&aabb) {
            return false;
        }

        let mut obstacles: Vec<Bounds> = Vec::new();
        let (mut objects, mut structures) = (Vec::new(), Vec::new());
        collider.get_overlaps(&aabb, 0.0, Some(&mut objects), Some(&mut structures));
        obstacles.extend(
            objects
                .iter()
                .filter_map(|&j| world.object(j))
                .filter(|o| o.flags.contains(ObjectFlags::CLIP))
                .map(|o| o.aabb.to_bounds(0.0)),
        );
        obstacles.extend(structures.iter().filter_map(|&s| world.structure(s)).map(|s| s.bounds));

        let mut best: Option<Vec3> = None;
        let mut consider = |push: Vec3| {
            if best.map_or(true, |b| vector_length_squared(&push) < vector_length_squared(&b)) {
                best = Some(push);
            }
        };

        let ground = world.terra.height(aabb.p[0], aabb.p[1]);
        let bottom = aabb.p[2] - aabb.dim[2];
        if bottom < ground && ground - bottom + EPSILON <= 2.0 * aabb.dim[2] {
            consider([0.0, 0.0, ground - bottom + EPSILON]);
        }
        for ob in &obstacles {
            for axis in 0..3 {
                let size = 2.0 * aabb.dim[axis];
                let up = ob.maxs[axis] - (aabb.p[axis] - aabb.dim[axis]) + EPSILON;
                let down = (aabb.p[axis] + aabb.dim[axis]) - ob.mins[axis] + EPSILON;
                for push in [up, -down] {
                    if push.abs() <= size {
                        let mut v = VEC3_ORIGIN;
                        v[axis] = push;
                        consider(v);
                    }
                }
            }
        }

        let Some(push) = best else {
            return false;
        };
        let moved = Aabb::new(vector_add(&aabb.p, &push), aabb.dim);
        if collider.test_aabb(&moved) {
            return false;
        }
        if let Some(obj) = world.object_mut(index) {
            obj.aabb = moved;
        }
        world.reposition_object(index);
        true
    }
}

/// Disjoint borrows of the parts of an object the integrator mutates together.
struct Parts<'a> {
    flags: &'a mut ObjectFlags,
    dynamic: Option<&'a mut Dynamic>,
}

fn split(obj: &mut Object) -> Parts<'_> {
    let dynamic = match &mut obj.kind {
        ObjectKind::Dynamic(d) => Some(d),
        ObjectKind::Static => None,
    };
    Parts {
        flags: &mut obj.flags,
        dynamic,
    }
}

/// Remaining displacement after a hit, slid along the surface and backed off it.
fn clip_move(mv: &Vec3, hit: &Hit) -> Vec3 {
    let rest = vector_scale(mv, 1.0 - hit.ratio);
    let into = dot_product(&rest, &hit.normal) - CLIP_BACKOFF;
    vector_ma(&rest, -into, &hit.normal)
}

/// Cuts any part of the move that runs back against the original direction,
/// so bodies in obtuse corners don't oscillate.
fn hold_direction(mv: &Vec3, dir: &Vec3) -> Vec3 {
    let back = (dot_product(mv, dir) + CLIP_BACKOFF).min(0.0);
    vector_ma(mv, -back, dir)
}

/// In an acute corner between two hit surfaces, keeps only the move along
/// the crease and nudges the body out of it. Opposed surfaces stop it.
fn fold_corner(mv: &mut Vec3, last: &Vec3, normal: &Vec3) {
    if dot_product(last, normal) >= 0.0 {
        return;
    }
    let mut cross = cross_product(normal, last);
    let length = vector_normalize(&mut cross);
    if length == 0.0 {
        *mv = VEC3_ORIGIN;
        return;
    }
    *mv = vector_scale(&cross, dot_product(mv, &cross));
    *mv = vector_ma(mv, 3.0 * CLIP_BACKOFF / length, &vector_add(normal, last));
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{ClassRegistry, Particle};
    use approx::assert_abs_diff_eq;
    use oz_common::bsp::Bsp;
    use oz_common::math::Rotation;
    use oz_common::terra::Terra;
    use std::sync::Arc;

    fn flat_world(height: f32) -> World {
        World::new(4.0, 16, Terra::flat(4, 16.0, height))
    }

    fn drop_crate(w: &mut World, p: Vec3, momentum: Vec3) -> usize {
        let mut obj = ClassRegistry::with_defaults().create("crate", p).unwrap();
        obj.dynamic_mut().unwrap().momentum = momentum;
        w.add_object(obj)
    }

    fn run(physics: &Physics, w: &mut World, index: usize, ticks: usize) {
        for _ in 0..ticks {
            physics.update_object(w, index);
            if let Some(o) = w.object_mut(index) {
                o.old_flags = o.flags;
            }
        }
    }

    #[test]
    fn test_falling_object_settles_on_terrain() {
        let mut w = flat_world(0.0);
        let physics = Physics::default();
        let i = drop_crate(&mut w, [0.0, 0.0, 5.0], [0.0, 0.0, -10.0]);
        run(&physics, &mut w, i, 120);

        let obj = w.object(i).unwrap();
        let bottom = obj.aabb.p[2] - obj.aabb.dim[2];
        assert_abs_diff_eq!(bottom, 0.0, epsilon = 0.01);
        assert!(obj.flags.contains(ObjectFlags::ON_FLOOR));
        assert!(obj.flags.contains(ObjectFlags::DISABLED));
        assert_abs_diff_eq!(obj.velocity()[2], 0.0, epsilon = 1e-4);
        assert!(obj.events.iter().any(|e| e.id == EventId::Hit));
    }

    #[test]
    fn test_gravity_in_air() {
        let mut w = flat_world(-20.0);
        let physics = Physics::default();
        let i = drop_crate(&mut w, [0.0, 0.0, 10.0], VEC3_ORIGIN);
        physics.update_object(&mut w, i);
        let obj = w.object(i).unwrap();
        assert_abs_diff_eq!(obj.velocity()[2], physics.g_velocity(), epsilon = 1e-4);
        assert_abs_diff_eq!(obj.aabb.p[2], 10.0 + physics.g_velocity() * TICK_TIME, epsilon = 1e-5);
        assert!(!obj.flags.contains(ObjectFlags::IN_WATER));
    }

    #[test]
    fn test_floor_friction_stops_sliding() {
        let mut w = flat_world(0.0);
        let physics = Physics::default();
        let i = drop_crate(&mut w, [0.0, 0.0, 0.501], [3.0, 0.0, 0.0]);
        run(&physics, &mut w, i, 200);
        let obj = w.object(i).unwrap();
        assert!(obj.flags.contains(ObjectFlags::DISABLED));
        assert!(obj.aabb.p[0] > 0.0);
        assert_eq!(obj.velocity(), VEC3_ORIGIN);
    }

    #[test]
    fn test_hover_ignores_gravity() {
        let mut w = flat_world(-20.0);
        let physics = Physics::default();
        let i = drop_crate(&mut w, [0.0; 3], VEC3_ORIGIN);
        w.object_mut(i).unwrap().flags |= ObjectFlags::HOVER;
        physics.update_object(&mut w, i);
        let obj = w.object(i).unwrap();
        assert_eq!(obj.aabb.p, [0.0; 3]);
        assert_eq!(obj.velocity(), VEC3_ORIGIN);
    }

    #[test]
    fn test_stacked_object_rests_on_lower() {
        let mut w = flat_world(0.0);
        let physics = Physics::default();
        let bottom = drop_crate(&mut w, [0.0, 0.0, 0.6], VEC3_ORIGIN);
        let top = drop_crate(&mut w, [0.0, 0.0, 2.5], VEC3_ORIGIN);
        for _ in 0..150 {
            for i in [bottom, top] {
                physics.update_object(&mut w, i);
                let o = w.object_mut(i).unwrap();
                o.old_flags = o.flags;
            }
        }
        let lower = w.object(bottom).unwrap();
        let upper = w.object(top).unwrap();
        assert_eq!(upper.dynamic().unwrap().lower, Some(bottom));
        assert!(upper.flags.contains(ObjectFlags::DISABLED));
        let gap = (upper.aabb.p[2] - upper.aabb.dim[2]) - (lower.aabb.p[2] + lower.aabb.dim[2]);
        assert_abs_diff_eq!(gap, 0.0, epsilon = 0.01);
    }

    #[test]
    fn test_woken_when_lower_vanishes() {
        let mut w = flat_world(-20.0);
        let physics = Physics::default();
        let i = drop_crate(&mut w, [0.0; 3], VEC3_ORIGIN);
        {
            let o = w.object_mut(i).unwrap();
            o.flags |= ObjectFlags::DISABLED;
            o.dynamic_mut().unwrap().lower = Some(7);
        }
        physics.update_object(&mut w, i);
        let o = w.object(i).unwrap();
        assert_eq!(o.dynamic().unwrap().lower, None);
        assert!(o.aabb.p[2] < 0.0, "falls once woken");
    }

    #[test]
    fn test_sideways_hit_shares_momentum() {
        let mut w = flat_world(-20.0);
        let physics = Physics::default();
        let a = drop_crate(&mut w, [0.0, 0.0, 0.0], [30.0, 0.0, 0.0]);
        let b = drop_crate(&mut w, [1.2, 0.0, 0.0], VEC3_ORIGIN);
        physics.update_object(&mut w, a);

        let mb = w.object(b).unwrap().dynamic().unwrap().momentum;
        // Equal masses: the struck body gets the average.
        assert_abs_diff_eq!(mb[0], 15.0, epsilon = 0.5);
        let pa = w.object(a).unwrap().aabb.p[0];
        assert!(pa + 0.5 <= 1.2 - 0.5 + EPSILON);
    }

    #[test]
    fn test_entering_water_splashes() {
        let mut w = flat_world(-8.0);
        let pool = Bsp::single_brush([-6.0, -6.0, -8.0], [6.0, 6.0, 0.0], Material::WATER);
        let id = w.add_bsp(Arc::new(pool));
        w.add_structure(id, VEC3_ORIGIN, Rotation::R0);
        let physics = Physics::default();
        let i = drop_crate(&mut w, [0.0, 0.0, 1.0], [0.0, 0.0, -6.0]);

        let mut splashed = false;
        for _ in 0..30 {
            physics.update_object(&mut w, i);
            let o = w.object_mut(i).unwrap();
            splashed |= o.events.iter().any(|e| e.id == EventId::Splash);
            o.old_flags = o.flags;
        }
        let o = w.object(i).unwrap();
        assert!(splashed);
        assert!(o.flags.contains(ObjectFlags::IN_WATER));
        assert!(o.dynamic().unwrap().depth > 0.0);
    }

    #[test]
    fn test_floor_cleared_on_ladder_and_in_water() {
        let mut w = flat_world(0.0);
        let ladder = Bsp::single_brush([0.3, -1.0, 0.0], [0.5, 1.0, 3.0], Material::LADDER);
        let id = w.add_bsp(Arc::new(ladder));
        w.add_structure(id, VEC3_ORIGIN, Rotation::R0);
        let physics = Physics::default();
        let climber = ClassRegistry::with_defaults().create("climber", [0.0, 0.0, 0.901]).unwrap();
        let i = w.add_object(climber);
        w.object_mut(i).unwrap().dynamic_mut().unwrap().momentum = [1.0, 0.0, 0.0];

        for _ in 0..5 {
            run(&physics, &mut w, i, 1);
            let flags = w.object(i).unwrap().flags;
            assert!(flags.contains(ObjectFlags::ON_LADDER));
            assert!(!flags.intersects(ObjectFlags::ON_FLOOR | ObjectFlags::ON_SLICK), "{:?}", flags);
        }

        // Resting on the sea bed.
        let mut w = flat_world(-1.0);
        let i = drop_crate(&mut w, [0.0, 0.0, -0.499], [0.5, 0.0, 0.0]);
        for _ in 0..5 {
            run(&physics, &mut w, i, 1);
            let flags = w.object(i).unwrap().flags;
            assert!(flags.contains(ObjectFlags::IN_WATER));
            assert!(!flags.contains(ObjectFlags::ON_FLOOR), "{:?}", flags);
        }
    }

    #[test]
    fn test_opposed_surfaces_stop_the_move() {
        let mut mv = [1.0, 1.0, 0.0];
        fold_corner(&mut mv, &[1.0, 0.0, 0.0], &[-1.0, 0.0, 0.0]);
        assert_eq!(mv, VEC3_ORIGIN);
    }

    #[test]
    fn test_acute_corner_slides_along_crease() {
        let mut mv = [1.0, 1.0, 0.0];
        fold_corner(&mut mv, &[-0.8, 0.0, 0.6], &[0.8, 0.0, 0.6]);
        assert_abs_diff_eq!(mv[0], 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(mv[1], 1.0, epsilon = 1e-6);
        assert!(mv[2] > 0.0, "pushed out of the crease");

        // Obtuse corners are left alone.
        let mut mv = [1.0, 1.0, 0.0];
        fold_corner(&mut mv, &[0.0, 0.0, 1.0], &[-0.6, 0.0, 0.8]);
        assert_eq!(mv, [1.0, 1.0, 0.0]);
    }

    #[test]
    fn test_move_never_turns_back() {
        let dir = [1.0, 0.0, 0.0];
        let mv = hold_direction(&[-0.5, 1.0, 0.0], &dir);
        assert!(dot_product(&mv, &dir) >= -CLIP_BACKOFF - 1e-6);
        assert_abs_diff_eq!(mv[1], 1.0);
        assert_eq!(hold_direction(&[0.3, 1.0, 0.0], &dir), [0.3, 1.0, 0.0]);
    }

    #[test]
    fn test_momentum_follows_velocity() {
        let mut w = flat_world(0.0);
        let id = w.add_bsp(Arc::new(Bsp::single_brush([2.0, -4.0, -1.0], [3.0, 4.0, 4.0], Material::STRUCT)));
        w.add_structure(id, VEC3_ORIGIN, Rotation::R0);
        let physics = Physics::default();
        let i = drop_crate(&mut w, [1.3, 0.0, 0.501], [30.0, 0.0, 0.0]);
        physics.update_object(&mut w, i);

        let obj = w.object(i).unwrap();
        let d = obj.dynamic().unwrap();
        assert_eq!(d.momentum, d.velocity);
        assert!(obj.aabb.p[0] + obj.aabb.dim[0] <= 2.0);
        // 0.2 of travel in one tick, not the requested 0.5.
        assert_abs_diff_eq!(d.momentum[0], 0.2 / TICK_TIME, epsilon = 0.5);
    }

    #[test]
    fn test_particle_bounces_and_damages_structure() {
        let mut w = flat_world(0.0);
        let physics = Physics::default();

        let i = w.add_particle(Particle::new([0.0, 0.0, 0.05], [0.0, 0.0, -5.0], 2.0, 0.0, 5.0));
        physics.update_particle(&mut w, i);
        let part = w.particle(i).unwrap();
        assert!(part.velocity[2] > 0.0, "elastic bounce");
        assert!(part.p[2] >= 0.0);

        let id = w.add_bsp(Arc::new(Bsp::single_brush([2.0, -4.0, -4.0], [3.0, 4.0, 4.0], Material::STRUCT)));
        let s = w.add_structure(id, VEC3_ORIGIN, Rotation::R0);
        let life = w.structure(s).unwrap().life;
        let fast = w.add_particle(Particle::new([1.5, 0.0, 2.0], [60.0, 0.0, 0.0], 1.0, 1.0, 5.0));
        physics.update_particle(&mut w, fast);

        assert_eq!(w.particle(fast).unwrap().lifetime, 0.0);
        assert!(w.structure(s).unwrap().life < life);
        assert!(w.particle(fast).unwrap().p[0] < 2.0);
    }

    #[test]
    fn test_depenetrate_pushes_out_of_wall() {
        let mut w = flat_world(-20.0);
        let id = w.add_bsp(Arc::new(Bsp::single_brush([2.0, -4.0, -4.0], [3.0, 4.0, 4.0], Material::STRUCT)));
        w.add_structure(id, VEC3_ORIGIN, Rotation::R0);
        let physics = Physics::default();
        let i = drop_crate(&mut w, [1.7, 0.0, 0.0], VEC3_ORIGIN);

        assert!(physics.depenetrate(&mut w, i));
        let obj = w.object(i).unwrap();
        assert!(obj.aabb.p[0] + obj.aabb.dim[0] <= 2.0);
        assert!(!Collider::new(&w).excluding(i).test_aabb(&obj.aabb));
        assert!(!physics.depenetrate(&mut w, i), "already free");
    }
}
