//! CLI command implementations.

pub mod cancel;
pub mod common;
pub mod detect;
pub mod run;
pub mod status;
pub mod wait;
