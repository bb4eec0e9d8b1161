//! Local backend: jobs run as child processes, arrays are simulated.

pub mod adapter;
mod registry;

pub use adapter::{ARRAY_TASK_ENV, LocalConfig, LocalScheduler};
