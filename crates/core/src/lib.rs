// crates/core/src/lib.rs
pub mod config;
pub mod error;
pub mod pacing;
pub mod paths;
pub mod plan;
pub mod upstream;

pub use config::*;
pub use error::*;
pub use pacing::{Backoff, RequestPacer};
pub use plan::*;
