//! Storage module - Append-only archive of settled blocks

mod archive;

pub use archive::*;
