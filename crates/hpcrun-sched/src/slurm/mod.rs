//! SLURM backend.

pub mod adapter;
pub mod parser;

pub use adapter::{SlurmConfig, SlurmScheduler, slurm_args};
