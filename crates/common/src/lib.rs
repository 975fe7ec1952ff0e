//! Shared infrastructure for the sync engines: the runtime abstraction,
//! environment-backed knobs, and the persistence records and store traits
//! the core consumes from its database driver.

pub mod knobs;
pub mod persistence;
pub mod runtime;

#[cfg(any(test, feature = "testing"))]
pub mod testing;
