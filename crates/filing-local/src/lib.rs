//! Local filesystem backend for filing.
//!
//! One file per key under a root directory. Conditional writes are made atomic
//! with a per-key `fs2` latch file and temp-file + rename replacement.

mod config;
mod driver;

pub use config::LocalConfig;
pub use driver::LocalDriver;
