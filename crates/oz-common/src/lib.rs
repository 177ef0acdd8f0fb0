#![allow(clippy::too_many_arguments, clippy::needless_range_loop, clippy::float_cmp,
         clippy::manual_range_contains, clippy::neg_cmp_op_on_partial_ord)]

pub mod math;
pub mod error;
pub mod stream;
pub mod crc;
pub mod compression;
pub mod cvar;
pub mod bsp;
pub mod terra;
