//! Operation Lifecycle
//!
//! The synchronous/asynchronous contract for mutating storage calls: a
//! backend port, the polling primitives, and a storage driver that ties the
//! two together.

pub mod backend;
pub mod driver;
pub mod wait;

pub use backend::*;
pub use driver::*;
pub use wait::*;
