pub mod pool;
pub mod runner;

pub use pool::WorkerPool;
pub use runner::{JobOutcome, JobRunner};
