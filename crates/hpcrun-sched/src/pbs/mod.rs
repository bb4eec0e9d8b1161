//! PBS backend (PBS Pro, OpenPBS, Torque).

pub mod adapter;
pub mod parser;

pub use adapter::{PbsConfig, PbsScheduler, pbs_args};
