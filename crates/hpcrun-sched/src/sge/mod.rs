//! Grid Engine backend.

pub mod adapter;
pub mod parser;

pub use adapter::{SgeConfig, SgeScheduler, sge_args};
