//! Concurrency and resource-control primitives for the runner.

pub mod limits;
pub mod timeout;
