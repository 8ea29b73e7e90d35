//! Thread primitives for the cache loader: a blocking queue with two
//! insertion modes, a fixed worker pool draining it, and the CPU/IO conveyor
//! that feeds the pool.

pub mod budget;
pub mod conveyor;
pub mod dual_queue;
pub mod error;
pub mod executor;

pub use budget::AbandonedThreadBudget;
pub use conveyor::{CpuIoConveyor, CpuTask, IoTaskBuilder};
pub use dual_queue::DualCapacityBlockingQueue;
pub use error::QueueError;
pub use executor::{ExceptionHandler, ExternalQueueThreadExecutor, Runnable};
