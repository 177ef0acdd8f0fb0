// math.rs: Vector math and geometry primitives shared by the asset loaders
// and the simulation core.

use serde::{Deserialize, Serialize};

// ============================================================
// Basic types
// ============================================================

pub type Vec3 = [f32; 3];

pub const VEC3_ORIGIN: Vec3 = [0.0, 0.0, 0.0];

/// Tolerance used by every containment and sweep test.
pub const EPSILON: f32 = 0.001;

// ============================================================
// MATHLIB: Vector operations
// ============================================================

#[inline]
pub fn dot_product(a: &Vec3, b: &Vec3) -> f32 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

#[inline]
pub fn vector_subtract(a: &Vec3, b: &Vec3) -> Vec3 {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

#[inline]
pub fn vector_add(a: &Vec3, b: &Vec3) -> Vec3 {
    [a[0] + b[0], a[1] + b[1], a[2] + b[2]]
}

/// veca + scale * vecb
#[inline]
pub fn vector_ma(veca: &Vec3, scale: f32, vecb: &Vec3) -> Vec3 {
    [
        veca[0] + scale * vecb[0],
        veca[1] + scale * vecb[1],
        veca[2] + scale * vecb[2],
    ]
}

#[inline]
pub fn vector_scale(v: &Vec3, scale: f32) -> Vec3 {
    [v[0] * scale, v[1] * scale, v[2] * scale]
}

pub fn cross_product(v1: &Vec3, v2: &Vec3) -> Vec3 {
    [
        v1[1] * v2[2] - v1[2] * v2[1],
        v1[2] * v2[0] - v1[0] * v2[2],
        v1[0] * v2[1] - v1[1] * v2[0],
    ]
}

pub fn vector_length_squared(v: &Vec3) -> f32 {
    v[0] * v[0] + v[1] * v[1] + v[2] * v[2]
}

pub fn vector_length(v: &Vec3) -> f32 {
    vector_length_squared(v).sqrt()
}

/// Normalize in place, returns original length.
pub fn vector_normalize(v: &mut Vec3) -> f32 {
    let length = vector_length(v);
    if length != 0.0 {
        let ilength = 1.0 / length;
        v[0] *= ilength;
        v[1] *= ilength;
        v[2] *= ilength;
    }
    length
}

#[inline]
pub fn vector_is_zero(v: &Vec3) -> bool {
    v[0] == 0.0 && v[1] == 0.0 && v[2] == 0.0
}

pub fn vector_min(a: &Vec3, b: &Vec3) -> Vec3 {
    [a[0].min(b[0]), a[1].min(b[1]), a[2].min(b[2])]
}

pub fn vector_max(a: &Vec3, b: &Vec3) -> Vec3 {
    [a[0].max(b[0]), a[1].max(b[1]), a[2].max(b[2])]
}

// ============================================================
// Bounds
// ============================================================

/// Axis-aligned box given by its corners.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Bounds {
    pub mins: Vec3,
    pub maxs: Vec3,
}

impl Bounds {
    pub fn new(mins: Vec3, maxs: Vec3) -> Self {
        debug_assert!(
            mins[0] <= maxs[0] && mins[1] <= maxs[1] && mins[2] <= maxs[2],
            "malformed bounds {:?} .. {:?}",
            mins,
            maxs
        );
        Self { mins, maxs }
    }

    /// Bounds of a point expanded by `eps` on every side.
    pub fn around_point(p: &Vec3, eps: f32) -> Self {
        Self {
            mins: [p[0] - eps, p[1] - eps, p[2] - eps],
            maxs: [p[0] + eps, p[1] + eps, p[2] + eps],
        }
    }

    /// Bounds covering the whole path of `aabb` moving by `mv`.
    pub fn sweep(aabb: &Aabb, mv: &Vec3, eps: f32) -> Self {
        let end = vector_add(&aabb.p, mv);
        let lo = vector_min(&aabb.p, &end);
        let hi = vector_max(&aabb.p, &end);
        Self {
            mins: [
                lo[0] - aabb.dim[0] - eps,
                lo[1] - aabb.dim[1] - eps,
                lo[2] - aabb.dim[2] - eps,
            ],
            maxs: [
                hi[0] + aabb.dim[0] + eps,
                hi[1] + aabb.dim[1] + eps,
                hi[2] + aabb.dim[2] + eps,
            ],
        }
    }

    pub fn center(&self) -> Vec3 {
        [
            (self.mins[0] + self.maxs[0]) * 0.5,
            (self.mins[1] + self.maxs[1]) * 0.5,
            (self.mins[2] + self.maxs[2]) * 0.5,
        ]
    }

    pub fn expanded(&self, eps: f32) -> Self {
        Self {
            mins: [self.mins[0] - eps, self.mins[1] - eps, self.mins[2] - eps],
            maxs: [self.maxs[0] + eps, self.maxs[1] + eps, self.maxs[2] + eps],
        }
    }

    pub fn contains_point(&self, p: &Vec3, eps: f32) -> bool {
        (0..3).all(|i| self.mins[i] - eps <= p[i] && p[i] <= self.maxs[i] + eps)
    }

    pub fn overlaps(&self, b: &Bounds, eps: f32) -> bool {
        (0..3).all(|i| b.mins[i] - eps <= self.maxs[i] && self.mins[i] <= b.maxs[i] + eps)
    }

    /// True if `b` lies wholly inside these bounds.
    pub fn includes(&self, b: &Bounds, eps: f32) -> bool {
        (0..3).all(|i| self.mins[i] - eps <= b.mins[i] && b.maxs[i] <= self.maxs[i] + eps)
    }

    pub fn to_aabb(&self) -> Aabb {
        Aabb {
            p: self.center(),
            dim: [
                (self.maxs[0] - self.mins[0]) * 0.5,
                (self.maxs[1] - self.mins[1]) * 0.5,
                (self.maxs[2] - self.mins[2]) * 0.5,
            ],
        }
    }
}

// ============================================================
// AABB
// ============================================================

/// Axis-aligned box given by its center and half-extents.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Aabb {
    pub p: Vec3,
    pub dim: Vec3,
}

impl Aabb {
    pub fn new(p: Vec3, dim: Vec3) -> Self {
        debug_assert!(
            dim[0] >= 0.0 && dim[1] >= 0.0 && dim[2] >= 0.0,
            "negative half-extents {:?}",
            dim
        );
        Self { p, dim }
    }

    pub fn to_bounds(&self, eps: f32) -> Bounds {
        Bounds {
            mins: [
                self.p[0] - self.dim[0] - eps,
                self.p[1] - self.dim[1] - eps,
                self.p[2] - self.dim[2] - eps,
            ],
            maxs: [
                self.p[0] + self.dim[0] + eps,
                self.p[1] + self.dim[1] + eps,
                self.p[2] + self.dim[2] + eps,
            ],
        }
    }

    pub fn overlaps(&self, b: &Aabb, eps: f32) -> bool {
        (0..3).all(|i| (b.p[i] - self.p[i]).abs() <= self.dim[i] + b.dim[i] + eps)
    }

    /// True if `b` lies wholly inside this box.
    pub fn includes(&self, b: &Aabb, eps: f32) -> bool {
        (0..3).all(|i| (b.p[i] - self.p[i]).abs() + b.dim[i] <= self.dim[i] + eps)
    }
}

// ============================================================
// Sphere
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Sphere {
    pub p: Vec3,
    pub radius: f32,
}

impl Sphere {
    pub fn new(p: Vec3, radius: f32) -> Self {
        debug_assert!(radius >= 0.0);
        Self { p, radius }
    }

    pub fn contains_point(&self, p: &Vec3, eps: f32) -> bool {
        let d = vector_subtract(p, &self.p);
        let r = self.radius + eps;
        vector_length_squared(&d) <= r * r
    }

    /// Closest-point test against a box.
    pub fn overlaps_aabb(&self, aabb: &Aabb, eps: f32) -> bool {
        let mut dist2 = 0.0;
        for i in 0..3 {
            let d = (self.p[i] - aabb.p[i]).abs() - aabb.dim[i];
            if d > 0.0 {
                dist2 += d * d;
            }
        }
        let r = self.radius + eps;
        dist2 <= r * r
    }
}

// ============================================================
// Plane
// ============================================================

/// Plane `normal · p == dist`; the front side is where the expression is positive.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Plane {
    pub normal: Vec3,
    pub dist: f32,
}

impl Plane {
    pub fn new(normal: Vec3, dist: f32) -> Self {
        debug_assert!(
            (vector_length(&normal) - 1.0).abs() < 1e-3,
            "plane normal {:?} is not unit length",
            normal
        );
        Self { normal, dist }
    }

    /// Plane through three points, counter-clockwise winding facing the front.
    pub fn from_points(a: &Vec3, b: &Vec3, c: &Vec3) -> Self {
        let mut normal = cross_product(&vector_subtract(b, a), &vector_subtract(c, a));
        vector_normalize(&mut normal);
        Self {
            normal,
            dist: dot_product(&normal, a),
        }
    }

    #[inline]
    pub fn distance(&self, p: &Vec3) -> f32 {
        dot_product(&self.normal, p) - self.dist
    }

    /// How far the plane must be pushed out so a box with half-extents `dim`
    /// touches it with its leading corner.
    #[inline]
    pub fn aabb_offset(&self, dim: &Vec3) -> f32 {
        (self.normal[0] * dim[0]).abs()
            + (self.normal[1] * dim[1]).abs()
            + (self.normal[2] * dim[2]).abs()
    }
}

// ============================================================
// Discrete rotations around the z axis
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(i32)]
pub enum Rotation {
    #[default]
    R0 = 0,
    R90 = 1,
    R180 = 2,
    R270 = 3,
}

impl Rotation {
    pub fn from_i32(v: i32) -> Option<Self> {
        match v {
            0 => Some(Rotation::R0),
            1 => Some(Rotation::R90),
            2 => Some(Rotation::R180),
            3 => Some(Rotation::R270),
            _ => None,
        }
    }

    /// World-space direction into the rotated frame.
    pub fn to_local(self, v: &Vec3) -> Vec3 {
        match self {
            Rotation::R0 => *v,
            Rotation::R90 => [v[1], -v[0], v[2]],
            Rotation::R180 => [-v[0], -v[1], v[2]],
            Rotation::R270 => [-v[1], v[0], v[2]],
        }
    }

    /// Rotated-frame direction back to world space (counter-clockwise turns).
    pub fn to_world(self, v: &Vec3) -> Vec3 {
        match self {
            Rotation::R0 => *v,
            Rotation::R90 => [-v[1], v[0], v[2]],
            Rotation::R180 => [-v[0], -v[1], v[2]],
            Rotation::R270 => [v[1], -v[0], v[2]],
        }
    }

    /// Half-extents are symmetric, so only x and y swap on quarter turns.
    pub fn to_local_dim(self, dim: &Vec3) -> Vec3 {
        match self {
            Rotation::R0 | Rotation::R180 => *dim,
            Rotation::R90 | Rotation::R270 => [dim[1], dim[0], dim[2]],
        }
    }

    /// World bounds of local bounds placed at `p` with this rotation.
    pub fn rotate_bounds(self, mins: &Vec3, maxs: &Vec3, p: &Vec3) -> Bounds {
        let (lo, hi) = match self {
            Rotation::R0 => (*mins, *maxs),
            Rotation::R90 => ([-maxs[1], mins[0], mins[2]], [-mins[1], maxs[0], maxs[2]]),
            Rotation::R180 => ([-maxs[0], -maxs[1], mins[2]], [-mins[0], -mins[1], maxs[2]]),
            Rotation::R270 => ([mins[1], -maxs[0], mins[2]], [maxs[1], -mins[0], maxs[2]]),
        };
        Bounds {
            mins: vector_add(&lo, p),
            maxs: vector_add(&hi, p),
        }
    }
}

// ============================================================
// Tests
// ============================================================
