//! Hardware Module
//!
//! Local block device allocation for volume attachment.

pub mod allocation;

pub use allocation::*;
