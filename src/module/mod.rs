//! Module Layer
//!
//! Pluggable network-facing adapters, the supervisor that starts them, and
//! the built-in admin HTTP module.

pub mod address;
pub mod admin;
pub mod supervisor;

pub use address::*;
pub use admin::{AdminModule, AdminState, ADMIN_MODULE_NAME, DEFAULT_ADMIN_ADDRESS};
pub use supervisor::*;
