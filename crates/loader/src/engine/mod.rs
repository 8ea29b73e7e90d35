//! Cache loader engine -- owns the per-database pools and drives runners to completion.
//!
//! Split into focused submodules:
//! - `core`: CacheLoaderEngine struct, pool registry, runner and spawner creation, monitors
//! - `scheduling`: the wait-for-signal / advance-runners loop and shutdown
//! - `pool`: ThreadPoolHolder, one conveyor plus worker pool per database
//! - `shared`: outstanding-work counter and state reached from worker threads

mod core;
mod pool;
mod scheduling;
mod shared;
#[cfg(test)]
mod tests;

pub use self::core::CacheLoaderEngine;
pub use self::pool::ThreadPoolHolder;
pub(crate) use self::pool::RunnerTask;
pub(crate) use self::shared::EngineShared;
