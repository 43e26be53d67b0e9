//! Hash primitives shared by every chain component

mod hash;

pub use hash::*;
