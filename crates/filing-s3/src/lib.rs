//! S3-compatible object store backend for filing.
//!
//! One object per key. Conditional writes use the store's native
//! `If-None-Match: *` and `If-Match: <etag>` headers; versions are ETags.

mod config;
mod driver;

pub use config::S3Config;
pub use driver::S3Driver;
