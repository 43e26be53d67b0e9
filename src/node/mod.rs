//! Node module - Chain coordinator, change feed and configuration

mod config;
mod feed;
mod chain;
mod shared;

pub use config::*;
pub use feed::*;
pub use chain::*;
pub use shared::*;
