//! Domain layer - Value entities and port definitions
//!
//! This module defines the driver traits (ports) that concrete drivers
//! implement and the plain records they return.

pub mod ports;
pub mod types;

pub use ports::*;
pub use types::*;
