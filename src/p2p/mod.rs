//! P2P module - Chain views and block locators for header sync

mod view;

pub use view::*;
