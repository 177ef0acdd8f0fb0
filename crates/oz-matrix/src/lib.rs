#![allow(clippy::too_many_arguments, clippy::needless_range_loop, clippy::float_cmp,
         clippy::manual_range_contains)]

pub mod object;
pub mod world;
pub mod collider;
pub mod physics;
pub mod matrix;
pub mod nirvana;
