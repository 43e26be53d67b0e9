//! Consensus module - Chain records, fork choice and petrification

mod record;
mod index;
mod petrify;

pub use record::*;
pub use index::*;
pub use petrify::*;
