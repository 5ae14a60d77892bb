//! `cadence-core` — configuration, errors and identity types shared by the
//! Cadence scheduler and controller crates.

pub mod config;
pub mod error;
pub mod types;

pub use config::CadenceConfig;
pub use error::{CadenceError, Result};
pub use types::{ObjectKey, Uid};
