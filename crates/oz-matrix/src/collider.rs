// collider.rs: Point and box queries against terrain, structures and objects.
//
// Broad phase is the world grid; narrow phase walks each candidate
// structure's BSP tree in its local frame. Swept queries report the earliest
// obstruction as a ratio in [0, 1] of the requested move.

use oz_common::bsp::{Brush, Bsp, BspChild, Material};
use oz_common::math::{
    vector_add, vector_ma, vector_max, vector_min, vector_subtract, Aabb, Bounds, Rotation, Vec3,
    EPSILON, VEC3_ORIGIN,
};
use oz_common::terra::Terra;

use crate::object::ObjectFlags;
use crate::world::{Span, World};

/// Largest horizontal half-extent of any object. Objects are filed by their
/// center, so queries widen their cell span by this much.
pub const MAX_DIM_XY: f32 = 3.0;

const AXIS_NORMALS: [Vec3; 6] = [
    [1.0, 0.0, 0.0],
    [-1.0, 0.0, 0.0],
    [0.0, 1.0, 0.0],
    [0.0, -1.0, 0.0],
    [0.0, 0.0, 1.0],
    [0.0, 0.0, -1.0],
];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Hit {
    pub ratio: f32,
    pub normal: Vec3,
    pub material: Material,
    pub structure: Option<usize>,
    pub object: Option<usize>,
    pub water_depth: f32,
    pub in_water: bool,
    pub on_ladder: bool,
}

impl Hit {
    pub fn miss() -> Self {
        Self {
            ratio: 1.0,
            normal: VEC3_ORIGIN,
            material: Material::empty(),
            structure: None,
            object: None,
            water_depth: 0.0,
            in_water: false,
            on_ladder: false,
        }
    }

    pub fn is_miss(&self) -> bool {
        self.ratio == 1.0
    }

    fn set_static(&mut self, ratio: f32, normal: Vec3, material: Material, structure: Option<usize>) {
        self.ratio = ratio;
        self.normal = normal;
        self.material = material;
        self.structure = structure;
        self.object = None;
    }
}

impl Default for Hit {
    fn default() -> Self {
        Self::miss()
    }
}

/// Earliest crossing of a convex set of half-spaces by a moving box.
///
/// `sides` yields `(normal, start_dist, end_dist)` with the box extent
/// already subtracted. Returns the ratio and the side normal.
fn clip_convex(sides: impl Iterator<Item = (Vec3, f32, f32)>) -> Option<(f32, Vec3)> {
    let mut min_ratio = -1.0;
    let mut max_ratio = 1.0;
    let mut normal = None;
    let mut inside = true;
    // Least penetrated side, for movers that start inside.
    let mut nearest: Option<(Vec3, f32, f32)> = None;

    for (n, sd, ed) in sides {
        if sd >= 0.0 {
            inside = false;
        } else if nearest.map_or(true, |(_, best, _)| sd > best) {
            nearest = Some((n, sd, ed));
        }

        if ed > EPSILON {
            if sd < 0.0 {
                max_ratio = f32::min(max_ratio, sd / (sd - ed));
            } else {
                return None;
            }
        } else if sd >= 0.0 && ed <= sd {
            let ratio = (sd - EPSILON).max(0.0) / (sd - ed + EPSILON);
            if ratio > min_ratio {
                min_ratio = ratio;
                normal = Some(n);
            }
        }
    }

    if inside {
        // Stuck movers may still leave through the nearest face.
        return match nearest {
            Some((n, sd, ed)) if ed <= sd => Some((0.0, n)),
            _ => None,
        };
    }
    match normal {
        Some(n) if min_ratio < max_ratio => Some((min_ratio, n)),
        _ => None,
    }
}

/// Structure being traversed, with the mover's extents in its frame.
struct Local<'a> {
    bsp: &'a Bsp,
    index: usize,
    rotation: Rotation,
    dim: Vec3,
}

/// Per-query state of a swept test.
struct Sweep {
    dim: Vec3,
    start: Vec3,
    end: Vec3,
    mask: Material,
    hit: Hit,
}

impl Sweep {
    fn terra(&mut self, terra: &Terra) {
        // The box meets the terrain with the center of its bottom face.
        let mut start = self.start;
        let mut end = self.end;
        start[2] -= self.dim[2];
        end[2] -= self.dim[2];
        let mv = vector_subtract(&end, &start);

        let bounds = Bounds {
            mins: vector_min(&start, &end),
            maxs: vector_max(&start, &end),
        }
        .expanded(EPSILON);
        let span = terra.span(&bounds);

        for qy in span.min_y..=span.max_y {
            for qx in span.min_x..=span.max_x {
                let px = qx as f32 * terra.quad_size - terra.dim;
                let py = qy as f32 * terra.quad_size - terra.dim;
                let (x0, y0) = (px - EPSILON, py - EPSILON);
                let (x1, y1) = (px + terra.quad_size + EPSILON, py + terra.quad_size + EPSILON);

                for (tri, plane) in terra.planes(qx, qy).iter().enumerate() {
                    let sd = plane.distance(&start);
                    let ed = plane.distance(&end);
                    if !(ed <= EPSILON && ed <= sd) {
                        continue;
                    }
                    let ratio = (sd - EPSILON).max(0.0) / (sd - ed + EPSILON);
                    let ix = start[0] + ratio * mv[0];
                    let iy = start[1] + ratio * mv[1];
                    let (lx, ly) = (ix - px, iy - py);
                    let on_triangle = if tri == 0 { lx >= ly - EPSILON } else { lx <= ly + EPSILON };

                    if on_triangle
                        && x0 <= ix && ix <= x1
                        && y0 <= iy && iy <= y1
                        && ratio < self.hit.ratio
                    {
                        self.hit.set_static(ratio, plane.normal, Material::TERRAIN, None);
                    }
                }
            }
        }
    }

    fn node(&mut self, s: &Local, child: BspChild, r0: f32, r1: f32, sp: Vec3, ep: Vec3) {
        let n = match child {
            BspChild::Leaf(l) => return self.leaf(s, l, r0, r1, &sp, &ep),
            BspChild::Node(n) => n,
        };
        let node = s.bsp.nodes[n];
        let plane = &s.bsp.planes[node.plane];
        let front = BspChild::from_raw(node.front);
        let back = BspChild::from_raw(node.back);

        let offset = plane.aabb_offset(&s.dim) + 2.0 * EPSILON;
        let sd = plane.distance(&sp);
        let ed = plane.distance(&ep);

        let lerp = |t: f32| -> (f32, Vec3) {
            let d = vector_subtract(&ep, &sp);
            (r0 + t * (r1 - r0), [sp[0] + t * d[0], sp[1] + t * d[1], sp[2] + t * d[2]])
        };

        if sd > offset && ed > offset {
            self.node(s, front, r0, r1, sp, ep);
        } else if sd < -offset && ed < -offset {
            self.node(s, back, r0, r1, sp, ep);
        } else if sd < ed {
            let inv = 1.0 / (sd - ed);
            let (m1, p1) = lerp(((sd - offset) * inv).clamp(0.0, 1.0));
            let (m2, p2) = lerp(((sd + offset) * inv).clamp(0.0, 1.0));
            self.node(s, back, r0, m1, sp, p1);
            self.node(s, front, m2, r1, p2, ep);
        } else if ed < sd {
            let inv = 1.0 / (sd - ed);
            let (m1, p1) = lerp(((sd + offset) * inv).clamp(0.0, 1.0));
            let (m2, p2) = lerp(((sd - offset) * inv).clamp(0.0, 1.0));
            self.node(s, front, r0, m1, sp, p1);
            self.node(s, back, m2, r1, p2, ep);
        } else {
            self.node(s, front, r0, r1, sp, ep);
            self.node(s, back, r0, r1, sp, ep);
        }
    }

    fn leaf(&mut self, s: &Local, leaf: usize, r0: f32, r1: f32, sp: &Vec3, ep: &Vec3) {
        let leaf = s.bsp.leaves[leaf];
        for &b in s.bsp.leaf_brush_indices(&leaf) {
            let brush = &s.bsp.brushes[b as usize];
            if brush.material.is_solid() && brush.material.intersects(self.mask) {
                self.brush(s, brush, r0, r1, sp, ep);
            }
        }
    }

    fn brush(&mut self, s: &Local, brush: &Brush, r0: f32, r1: f32, sp: &Vec3, ep: &Vec3) {
        let sides = s.bsp.brush_planes(brush).map(|plane| {
            let offset = plane.aabb_offset(&s.dim);
            (plane.normal, plane.distance(sp) - offset, plane.distance(ep) - offset)
        });
        if let Some((ratio, normal)) = clip_convex(sides) {
            let ratio = r0 + ratio * (r1 - r0);
            if ratio < self.hit.ratio {
                self.hit
                    .set_static(ratio, s.rotation.to_world(&normal), brush.material, Some(s.index));
            }
        }
    }

    fn object(&mut self, index: usize, aabb: &Aabb) {
        let sides = AXIS_NORMALS.iter().enumerate().map(|(i, n)| {
            let j = i >> 1;
            let extent = self.dim[j] + aabb.dim[j];
            let sd = (self.start[j] - aabb.p[j]) * n[j] - extent;
            let ed = (self.end[j] - aabb.p[j]) * n[j] - extent;
            (*n, sd, ed)
        });
        let Some((ratio, normal)) = clip_convex(sides) else {
            return;
        };
        let earlier = ratio < self.hit.ratio
            || (ratio == self.hit.ratio && matches!(self.hit.object, Some(j) if index < j));
        if earlier {
            self.hit.ratio = ratio;
            self.hit.normal = normal;
            self.hit.material = Material::OBJECT;
            self.hit.structure = None;
            self.hit.object = Some(index);
        }
    }
}

/// True if a box at `p` with half-extents `dim` intersects the brush.
fn brush_overlaps(bsp: &Bsp, brush: &Brush, p: &Vec3, dim: &Vec3) -> bool {
    bsp.brush_planes(brush)
        .all(|plane| plane.distance(p) - plane.aabb_offset(dim) <= EPSILON)
}

/// Height of water over the bottom of a box at `p`, at most the box height.
/// The surface is the lowest upward-facing side of the brush above (x, y).
fn water_depth(bsp: &Bsp, brush: &Brush, p: &Vec3, dim: &Vec3) -> f32 {
    let top = bsp
        .brush_planes(brush)
        .filter(|plane| plane.normal[2] > EPSILON)
        .map(|plane| (plane.dist - plane.normal[0] * p[0] - plane.normal[1] * p[1]) / plane.normal[2])
        .fold(f32::INFINITY, f32::min);
    (top - (p[2] - dim[2])).clamp(0.0, 2.0 * dim[2])
}

/// Calls `f` for every non-solid brush the box overlaps. A brush filed in
/// several leaves may be reported more than once.
fn media_overlaps(bsp: &Bsp, child: BspChild, p: &Vec3, dim: &Vec3, f: &mut impl FnMut(&Brush)) {
    match child {
        BspChild::Leaf(l) => {
            for &b in bsp.leaf_brush_indices(&bsp.leaves[l]) {
                let brush = &bsp.brushes[b as usize];
                if !brush.material.is_solid() && brush_overlaps(bsp, brush, p, dim) {
                    f(brush);
                }
            }
        }
        BspChild::Node(n) => {
            let node = bsp.nodes[n];
            let plane = &bsp.planes[node.plane];
            let offset = plane.aabb_offset(dim) + 2.0 * EPSILON;
            let dist = plane.distance(p);
            if dist >= -offset {
                media_overlaps(bsp, BspChild::from_raw(node.front), p, dim, f);
            }
            if dist <= offset {
                media_overlaps(bsp, BspChild::from_raw(node.back), p, dim, f);
            }
        }
    }
}

fn solid_overlap(bsp: &Bsp, child: BspChild, p: &Vec3, dim: &Vec3, mask: Material) -> bool {
    match child {
        BspChild::Leaf(l) => bsp.leaf_brush_indices(&bsp.leaves[l]).iter().any(|&b| {
            let brush = &bsp.brushes[b as usize];
            brush.material.is_solid()
                && brush.material.intersects(mask)
                && bsp.brush_planes(brush).all(|plane| plane.distance(p) - plane.aabb_offset(dim) < -EPSILON)
        }),
        BspChild::Node(n) => {
            let node = bsp.nodes[n];
            let plane = &bsp.planes[node.plane];
            let offset = plane.aabb_offset(dim) + 2.0 * EPSILON;
            let dist = plane.distance(p);
            let front = BspChild::from_raw(node.front);
            let back = BspChild::from_raw(node.back);
            if dist > offset {
                solid_overlap(bsp, front, p, dim, mask)
            } else if dist < -offset {
                solid_overlap(bsp, back, p, dim, mask)
            } else {
                solid_overlap(bsp, front, p, dim, mask) || solid_overlap(bsp, back, p, dim, mask)
            }
        }
    }
}

// ============================================================
// Collider
// ============================================================

pub struct Collider<'w> {
    world: &'w World,
    pub exclude: Option<usize>,
    pub mask: Material,
}

impl<'w> Collider<'w> {
    pub const DEFAULT_MASK: Material = Material::TERRAIN
        .union(Material::STRUCT)
        .union(Material::OBJECT)
        .union(Material::SLICK);

    pub fn new(world: &'w World) -> Self {
        Self {
            world,
            exclude: None,
            mask: Self::DEFAULT_MASK,
        }
    }

    pub fn excluding(mut self, object: usize) -> Self {
        self.exclude = Some(object);
        self
    }

    pub fn with_mask(mut self, mask: Material) -> Self {
        self.mask = mask;
        self
    }

    fn span(&self, bounds: &Bounds) -> Span {
        self.world.cell_span(bounds, MAX_DIM_XY)
    }

    /// Structures filed in the span, each once, in index order.
    fn structures_in(&self, span: Span) -> Vec<usize> {
        let mut out: Vec<usize> = span
            .cells()
            .flat_map(|c| self.world.cell(c).structures.iter().copied())
            .collect();
        out.sort_unstable();
        out.dedup();
        out
    }

    /// Solid objects other than the excluded one.
    fn clip_objects_in(&self, span: Span) -> impl Iterator<Item = (usize, &'w Aabb)> + '_ {
        let world = self.world;
        span.cells()
            .flat_map(move |c| world.cell_objects(c))
            .filter(move |&i| Some(i) != self.exclude)
            .filter_map(move |i| {
                let obj = world.object(i)?;
                obj.flags.contains(ObjectFlags::CLIP).then_some((i, &obj.aabb))
            })
    }

    // ============================================================
    // Static tests
    // ============================================================

    /// True if the point is blocked.
    pub fn test_point(&self, p: &Vec3) -> bool {
        self.test_aabb(&Aabb::new(*p, VEC3_ORIGIN))
    }

    /// True if the box overlaps terrain, a solid brush or a solid object.
    pub fn test_aabb(&self, aabb: &Aabb) -> bool {
        if self.test_aabb_static(aabb) {
            return true;
        }
        if !self.mask.contains(Material::OBJECT) {
            return false;
        }
        let bounds = aabb.to_bounds(0.0);
        self.clip_objects_in(self.span(&bounds))
            .any(|(_, other)| other.overlaps(aabb, -EPSILON))
    }

    fn over_terra(&self, p: &Vec3) -> bool {
        let dim = self.world.terra.dim;
        self.mask.contains(Material::TERRAIN) && p[0].abs() <= dim && p[1].abs() <= dim
    }

    /// Terrain and structures only. Outside the terrain's extent there is
    /// no ground, matching what swept tests see.
    pub fn test_aabb_static(&self, aabb: &Aabb) -> bool {
        let world = self.world;
        if self.over_terra(&aabb.p)
            && aabb.p[2] - aabb.dim[2] < world.terra.height(aabb.p[0], aabb.p[1])
        {
            return true;
        }
        let bounds = aabb.to_bounds(0.0);
        self.structures_in(self.span(&bounds)).into_iter().any(|i| {
            world
                .structure(i)
                .filter(|s| s.bounds.overlaps(&bounds, EPSILON))
                .is_some_and(|s| {
                    let p = s.rotation.to_local(&vector_subtract(&aabb.p, &s.p));
                    let dim = s.rotation.to_local_dim(&aabb.dim);
                    solid_overlap(&s.bsp, s.bsp.root(), &p, &dim, self.mask)
                })
        })
    }

    // ============================================================
    // Swept tests
    // ============================================================

    fn sweep(&self, aabb: &Aabb, mv: &Vec3, media: bool, climber: bool) -> Hit {
        let world = self.world;
        let mut sweep = Sweep {
            dim: aabb.dim,
            start: aabb.p,
            end: vector_add(&aabb.p, mv),
            mask: self.mask,
            hit: Hit::miss(),
        };
        let trace = Bounds::sweep(aabb, mv, EPSILON);
        let span = self.span(&trace);

        if self.mask.contains(Material::TERRAIN) {
            sweep.terra(&world.terra);
        }
        for i in self.structures_in(span) {
            let Some(s) = world.structure(i) else {
                continue;
            };
            if !s.bounds.overlaps(&trace, EPSILON) {
                continue;
            }
            let local = Local {
                bsp: &s.bsp,
                index: i,
                rotation: s.rotation,
                dim: s.rotation.to_local_dim(&aabb.dim),
            };
            let sp = s.rotation.to_local(&vector_subtract(&sweep.start, &s.p));
            let ep = s.rotation.to_local(&vector_subtract(&sweep.end, &s.p));
            sweep.node(&local, s.bsp.root(), 0.0, 1.0, sp, ep);
        }
        if self.mask.contains(Material::OBJECT) {
            for (i, other) in self.clip_objects_in(span) {
                if other.to_bounds(0.0).overlaps(&trace, EPSILON) {
                    sweep.object(i, other);
                }
            }
        }

        sweep.hit.ratio = sweep.hit.ratio.clamp(0.0, 1.0);
        if media {
            let stop = Aabb::new(vector_ma(&aabb.p, sweep.hit.ratio, mv), aabb.dim);
            self.media_at(&stop, climber, &mut sweep.hit);
        }
        sweep.hit
    }

    /// Water and ladder volumes around a box where a sweep stopped. Below
    /// z = 0 over the terrain is open sea.
    fn media_at(&self, aabb: &Aabb, climber: bool, hit: &mut Hit) {
        let world = self.world;
        let bottom = aabb.p[2] - aabb.dim[2];
        if self.over_terra(&aabb.p) && bottom < 0.0 {
            hit.in_water = true;
            hit.water_depth = hit.water_depth.max((-bottom).min(2.0 * aabb.dim[2]));
        }

        let bounds = aabb.to_bounds(0.0);
        for i in self.structures_in(self.span(&bounds)) {
            let Some(s) = world.structure(i) else {
                continue;
            };
            if !s.bounds.overlaps(&bounds, EPSILON) {
                continue;
            }
            let p = s.rotation.to_local(&vector_subtract(&aabb.p, &s.p));
            let dim = s.rotation.to_local_dim(&aabb.dim);
            media_overlaps(&s.bsp, s.bsp.root(), &p, &dim, &mut |brush: &Brush| {
                if brush.material.contains(Material::WATER) {
                    hit.in_water = true;
                    hit.water_depth = hit.water_depth.max(water_depth(&s.bsp, brush, &p, &dim));
                } else if climber && brush.material.contains(Material::LADDER) {
                    hit.on_ladder = true;
                }
            });
        }
    }

    pub fn translate_point(&self, p: &Vec3, mv: &Vec3) -> Hit {
        self.sweep(&Aabb::new(*p, VEC3_ORIGIN), mv, false, false)
    }

    pub fn translate_aabb(&self, aabb: &Aabb, mv: &Vec3) -> Hit {
        self.sweep(aabb, mv, true, false)
    }

    /// Sweep of a world object, excluding itself and reporting the water and
    /// ladder volumes around the position it stops at.
    pub fn translate_object(&self, index: usize, mv: &Vec3) -> Hit {
        let Some(obj) = self.world.object(index) else {
            return Hit::miss();
        };
        let climber = obj.flags.contains(ObjectFlags::CLIMBER);
        let collider = Collider {
            world: self.world,
            exclude: Some(index),
            mask: self.mask,
        };
        collider.sweep(&obj.aabb, mv, true, climber)
    }

    // ============================================================
    // Overlaps
    // ============================================================

    /// Objects and structures overlapping the box. Either list may be skipped.
    pub fn get_overlaps(
        &self,
        aabb: &Aabb,
        eps: f32,
        objects: Option<&mut Vec<usize>>,
        structures: Option<&mut Vec<usize>>,
    ) {
        let world = self.world;
        let bounds = aabb.to_bounds(eps);
        let span = self.span(&bounds);

        if let Some(structures) = structures {
            let dim = [aabb.dim[0] + eps, aabb.dim[1] + eps, aabb.dim[2] + eps];
            for i in self.structures_in(span) {
                let Some(s) = world.structure(i) else {
                    continue;
                };
                if !s.bounds.overlaps(&bounds, 0.0) {
                    continue;
                }
                let p = s.rotation.to_local(&vector_subtract(&aabb.p, &s.p));
                let dim = s.rotation.to_local_dim(&dim);
                if solid_overlap(&s.bsp, s.bsp.root(), &p, &dim, Material::all()) {
                    structures.push(i);
                }
            }
        }
        if let Some(objects) = objects {
            for c in span.cells() {
                for i in world.cell_objects(c) {
                    if Some(i) == self.exclude {
                        continue;
                    }
                    if world.object(i).is_some_and(|o| o.aabb.overlaps(aabb, eps)) {
                        objects.push(i);
                    }
                }
            }
        }
    }

    /// Objects lying wholly inside the box.
    pub fn get_includes(&self, aabb: &Aabb, eps: f32, objects: &mut Vec<usize>) {
        let world = self.world;
        for c in self.span(&aabb.to_bounds(eps)).cells() {
            for i in world.cell_objects(c) {
                if Some(i) != self.exclude && world.object(i).is_some_and(|o| aabb.includes(&o.aabb, eps)) {
                    objects.push(i);
                }
            }
        }
    }

    /// Wakes every dynamic object overlapping the box.
    pub fn touch_overlaps(world: &mut World, aabb: &Aabb, eps: f32) {
        let mut objects = Vec::new();
        Collider::new(world).get_overlaps(aabb, eps, Some(&mut objects), None);
        for i in objects {
            if let Some(obj) = world.object_mut(i) {
                if obj.is_dynamic() {
                    obj.flags -= ObjectFlags::DISABLED;
                }
            }
        }
    }
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ClassRegistry;
    use approx::assert_abs_diff_eq;
    use oz_common::math::dot_product;
    use std::sync::Arc;

    fn along(hit: &Hit, v: &Vec3) -> f32 {
        dot_product(&hit.normal, v)
    }

    /// 16x16 cells of size 4 over terrain far below.
    fn empty_world() -> World {
        World::new(4.0, 16, Terra::flat(4, 16.0, -20.0))
    }

    fn world_with_box(mins: Vec3, maxs: Vec3, material: Material, p: Vec3, rot: Rotation) -> World {
        let mut w = empty_world();
        let bsp = w.add_bsp(Arc::new(Bsp::single_brush(mins, maxs, material)));
        w.add_structure(bsp, p, rot);
        w
    }

    fn wall() -> World {
        // x in [2, 3], tall and wide
        world_with_box([2.0, -5.0, -5.0], [3.0, 5.0, 5.0], Material::STRUCT, VEC3_ORIGIN, Rotation::R0)
    }

    fn half_box(p: Vec3) -> Aabb {
        Aabb::new(p, [0.5, 0.5, 0.5])
    }

    #[test]
    fn test_aabb_sweep_stops_at_wall() {
        let w = wall();
        let hit = Collider::new(&w).translate_aabb(&half_box([-1.0, 0.0, 0.0]), &[10.0, 0.0, 0.0]);
        assert_abs_diff_eq!(hit.ratio, 0.25, epsilon = 1e-3);
        assert_abs_diff_eq!(hit.normal[0], -1.0);
        assert_eq!(hit.material, Material::STRUCT);
        assert_eq!(hit.structure, Some(0));
        assert_eq!(hit.object, None);
    }

    #[test]
    fn test_point_containment() {
        let w = wall();
        let c = Collider::new(&w);
        assert!(c.test_point(&[2.5, 0.0, 0.0]));
        assert!(!c.test_point(&[1.0, 0.0, 0.0]));
        assert!(!c.test_point(&[2.5, 7.0, 0.0]));
        assert!(c.test_point(&[0.0, 0.0, -25.0]), "below terrain is solid");
        assert!(c.test_aabb(&half_box([1.7, 0.0, 0.0])));
        assert!(!c.test_aabb(&half_box([1.2, 0.0, 0.0])));
    }

    #[test]
    fn test_sweep_monotonic_when_shortened() {
        let w = wall();
        let c = Collider::new(&w);
        let start = half_box([-1.0, 0.3, 0.2]);
        let full = [10.0, 1.0, -0.5];
        let mut last_distance = f32::INFINITY;
        for k in [1.0, 0.8, 0.5, 0.3, 0.26, 0.1] {
            let mv = [full[0] * k, full[1] * k, full[2] * k];
            let hit = c.translate_aabb(&start, &mv);
            // Distance travelled before contact never grows as the move shrinks.
            let travelled = hit.ratio * k;
            assert!(travelled <= last_distance + 1e-4, "k = {}", k);
            last_distance = travelled;
        }
    }

    #[test]
    fn test_no_tunnelling_through_thin_brush() {
        let w = world_with_box([0.0, -4.0, -4.0], [0.05, 4.0, 4.0], Material::STRUCT, VEC3_ORIGIN, Rotation::R0);
        let c = Collider::new(&w);
        for mv in [[50.0, 0.0, 0.0], [-50.0, 1.0, 0.0], [20.0, -1.0, 0.5]] {
            let from = if mv[0] > 0.0 { [-1.0, 0.0, 0.0] } else { [1.0, 0.0, 0.0] };
            let hit = c.translate_point(&from, &mv);
            assert!(hit.ratio < 1.0);
            assert!(along(&hit, &mv) < 0.0);
        }
    }

    #[test]
    fn test_rotated_structure_sweep() {
        // Local box x in [0, 4], y in [0, 1]; a quarter turn puts it at
        // world x in [9, 10], y in [0, 4].
        let w = world_with_box([0.0, 0.0, -2.0], [4.0, 1.0, 2.0], Material::STRUCT, [10.0, 0.0, 0.0], Rotation::R90);
        let c = Collider::new(&w);
        assert!(c.test_point(&[9.5, 3.0, 0.0]));
        assert!(!c.test_point(&[11.0, 0.5, 0.0]));

        let hit = c.translate_point(&[5.0, 2.0, 0.0], &[8.0, 0.0, 0.0]);
        assert_abs_diff_eq!(hit.ratio, 0.5, epsilon = 1e-3);
        assert_abs_diff_eq!(hit.normal[0], -1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_start_inside_reports_zero() {
        let w = wall();
        let c = Collider::new(&w);
        let hit = c.translate_aabb(&Aabb::new([2.5, 0.0, 0.0], [0.1; 3]), &[0.0, 0.0, -1.0]);
        assert_eq!(hit.ratio, 0.0);
        // Leaving through the nearest face is allowed.
        let out = c.translate_aabb(&Aabb::new([2.9, 0.0, 0.0], [0.05; 3]), &[1.0, 0.0, 0.0]);
        assert!(out.is_miss());
    }

    #[test]
    fn test_terrain_sweep_and_height() {
        let w = World::new(4.0, 16, Terra::flat(4, 16.0, 0.0));
        let c = Collider::new(&w);
        let hit = c.translate_aabb(&half_box([0.0, 0.0, 5.0]), &[0.0, 0.0, -10.0]);
        assert_abs_diff_eq!(hit.ratio, 0.45, epsilon = 1e-3);
        assert_abs_diff_eq!(hit.normal[2], 1.0);
        assert_eq!(hit.material, Material::TERRAIN);
        assert!(c.test_aabb(&half_box([0.0, 0.0, 0.4])));
        assert!(!c.test_aabb(&half_box([0.0, 0.0, 0.6])));
    }

    #[test]
    fn test_objects_block_and_tie_break() {
        let mut w = empty_world();
        let reg = ClassRegistry::with_defaults();
        let a = w.add_object(reg.create("crate", [3.0, 0.0, 0.0]).unwrap());
        let b = w.add_object(reg.create("crate", [3.0, 0.0, 0.0]).unwrap());
        let mut ghost = reg.create("crate", [1.5, 0.0, 0.0]).unwrap();
        ghost.flags -= ObjectFlags::CLIP;
        w.add_object(ghost);

        let c = Collider::new(&w);
        let hit = c.translate_aabb(&half_box([0.0, 0.0, 0.0]), &[4.0, 0.0, 0.0]);
        assert_eq!(hit.object, Some(a.min(b)));
        assert_eq!(hit.material, Material::OBJECT);
        assert_abs_diff_eq!(hit.ratio, 0.5, epsilon = 1e-3);

        let hit = Collider::new(&w).excluding(a).translate_aabb(&half_box(VEC3_ORIGIN), &[4.0, 0.0, 0.0]);
        assert_eq!(hit.object, Some(b));

        let hit = Collider::new(&w).with_mask(Material::TERRAIN | Material::STRUCT)
            .translate_aabb(&half_box(VEC3_ORIGIN), &[4.0, 0.0, 0.0]);
        assert!(hit.is_miss());
    }

    #[test]
    fn test_nearer_object_beats_wall() {
        let mut w = wall();
        let obj = ClassRegistry::with_defaults().create("crate", [1.5, 0.0, 0.0]).unwrap();
        w.add_object(obj);
        let hit = Collider::new(&w).translate_point(&[0.0, 0.0, 0.0], &[4.0, 0.0, 0.0]);
        assert_eq!(hit.object, Some(0));

        let hit = Collider::new(&w).translate_point(&[0.0, 0.0, 0.3], &[4.0, 0.0, 0.0]);
        assert!(hit.ratio < 0.5);
    }

    #[test]
    fn test_world_bounds_are_not_solid() {
        let w = empty_world();
        let c = Collider::new(&w);
        assert!(c.translate_point(&[30.0, 0.0, 0.0], &[100.0, 0.0, 0.0]).is_miss());
        assert!(!c.test_point(&[500.0, 500.0, 0.0]));
    }

    #[test]
    fn test_water_and_ladder() {
        let mut w = empty_world();
        let pool = Bsp::from_boxes(
            &[
                (Bounds::new([-4.0, -4.0, -4.0], [4.0, 4.0, 0.0]), Material::WATER),
                (Bounds::new([6.0, -1.0, -4.0], [7.0, 1.0, 4.0]), Material::LADDER),
            ],
            100.0,
        );
        let id = w.add_bsp(Arc::new(pool));
        w.add_structure(id, VEC3_ORIGIN, Rotation::R0);
        let reg = ClassRegistry::with_defaults();
        let swimmer = w.add_object(reg.create("crate", [0.0, 0.0, 0.3]).unwrap());
        let climber = w.add_object(reg.create("climber", [5.5, 0.0, 0.0]).unwrap());
        let plain = w.add_object(reg.create("crate", [5.5, 2.5, 0.0]).unwrap());

        let c = Collider::new(&w);
        let hit = c.translate_object(swimmer, &[0.0, 0.0, -0.1]);
        assert!(hit.is_miss(), "water is not solid");
        assert!(hit.in_water);
        assert_abs_diff_eq!(hit.water_depth, 0.3, epsilon = 1e-4);

        let hit = c.translate_object(climber, &[0.3, 0.0, 0.0]);
        assert!(hit.on_ladder);
        let hit = c.translate_object(plain, &[0.0, -2.5, 0.0]);
        assert!(!hit.on_ladder, "only climbers use ladders");
    }

    #[test]
    fn test_media_found_where_sweep_stops() {
        // A floor slab over a pool: the box lands on the slab and never
        // reaches the water below it.
        let mut w = empty_world();
        let pool = Bsp::from_boxes(
            &[
                (Bounds::new([-4.0, -4.0, 0.0], [4.0, 4.0, 0.2]), Material::STRUCT),
                (Bounds::new([-4.0, -4.0, -3.0], [4.0, 4.0, 0.0]), Material::WATER),
            ],
            100.0,
        );
        let id = w.add_bsp(Arc::new(pool));
        w.add_structure(id, VEC3_ORIGIN, Rotation::R0);
        let c = Collider::new(&w);

        let hit = c.translate_aabb(&half_box([0.0, 0.0, 1.0]), &[0.0, 0.0, -1.5]);
        assert!(hit.ratio < 1.0);
        assert_abs_diff_eq!(hit.normal[2], 1.0);
        assert!(!hit.in_water);
        assert_eq!(hit.water_depth, 0.0);

        let hit = c.translate_aabb(&half_box([0.0, 0.0, -1.0]), &[0.1, 0.0, 0.0]);
        assert!(hit.is_miss());
        assert!(hit.in_water);
        assert_abs_diff_eq!(hit.water_depth, 1.0, epsilon = 1e-4);
    }

    #[test]
    fn test_sea_below_zero() {
        let w = empty_world();
        let c = Collider::new(&w);

        let hit = c.translate_aabb(&half_box([0.0, 0.0, 0.2]), &[0.1, 0.0, 0.0]);
        assert!(hit.in_water);
        assert_abs_diff_eq!(hit.water_depth, 0.3, epsilon = 1e-4);

        let hit = c.translate_aabb(&half_box([0.0, 0.0, 2.0]), &[0.0, 0.0, -1.0]);
        assert!(!hit.in_water, "bottom stays at 0.5");

        let deep = c.translate_aabb(&half_box([0.0, 0.0, -5.0]), &[0.1, 0.0, 0.0]);
        assert_abs_diff_eq!(deep.water_depth, 1.0, epsilon = 1e-4);
        assert!(!c.translate_point(&[0.0, 0.0, -5.0], &[0.1, 0.0, 0.0]).in_water);
        assert!(!c.test_aabb(&half_box([0.0, 0.0, -5.0])), "water never blocks");
    }

    #[test]
    fn test_terrain_ends_at_its_extent() {
        // Terrain covers x, y in [-16, 16] of a world spanning [-32, 32].
        let w = World::new(4.0, 16, Terra::flat(2, 16.0, 0.0));
        let c = Collider::new(&w);

        assert!(!c.test_point(&[20.0, 0.0, -1.0]));
        assert!(c.translate_point(&[20.0, 0.0, 1.0], &[0.0, 0.0, -3.0]).is_miss());

        assert!(c.test_point(&[10.0, 0.0, -1.0]));
        assert!(!c.translate_point(&[10.0, 0.0, 1.0], &[0.0, 0.0, -3.0]).is_miss());
    }

    #[test]
    fn test_overlaps_and_includes() {
        let mut w = wall();
        let reg = ClassRegistry::with_defaults();
        let inside = w.add_object(reg.create("crate", [0.0, 0.0, 0.0]).unwrap());
        let edge = w.add_object(reg.create("crate", [1.8, 0.0, 0.0]).unwrap());
        let far = w.add_object(reg.create("crate", [-20.0, 0.0, 0.0]).unwrap());

        let area = Aabb::new([0.5, 0.0, 0.0], [1.5, 1.5, 1.5]);
        let c = Collider::new(&w);
        let (mut objects, mut structures) = (Vec::new(), Vec::new());
        c.get_overlaps(&area, 0.0, Some(&mut objects), Some(&mut structures));
        objects.sort_unstable();
        assert_eq!(objects, vec![inside, edge]);
        assert!(structures.is_empty(), "area stops short of the wall");

        let mut includes = Vec::new();
        c.get_includes(&area, 0.0, &mut includes);
        assert_eq!(includes, vec![inside]);
        assert!(!includes.contains(&far));

        let mut structures = Vec::new();
        c.get_overlaps(&Aabb::new([2.0, 0.0, 0.0], [0.5; 3]), 0.0, None, Some(&mut structures));
        assert_eq!(structures, vec![0]);
    }

    #[test]
    fn test_touch_overlaps_wakes_dynamic() {
        let mut w = empty_world();
        let reg = ClassRegistry::with_defaults();
        let i = w.add_object(reg.create("crate", [0.0; 3]).unwrap());
        if let Some(o) = w.object_mut(i) {
            o.flags |= ObjectFlags::DISABLED;
        }
        Collider::touch_overlaps(&mut w, &Aabb::new([0.8, 0.0, 0.0], [0.5; 3]), EPSILON);
        assert!(!w.object(i).unwrap().flags.contains(ObjectFlags::DISABLED));
    }
}
