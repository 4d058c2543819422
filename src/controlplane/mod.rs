//! Control Plane Module
//!
//! The orchestrator that builds and owns the per-category driver managers.

pub mod orchestrator;

pub use orchestrator::*;
