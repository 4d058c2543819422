//! Allocation Module
//!
//! Local block device allocation for volume attachment.

pub mod allocator;
pub mod partitions;

pub use allocator::*;
pub use partitions::*;
