//! Driver Module
//!
//! Constructor registry and the per-category managers built from it.

pub mod manager;
pub mod registry;

pub use manager::*;
pub use registry::*;
