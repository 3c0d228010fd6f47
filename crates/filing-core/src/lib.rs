//! Core abstractions for filing storage backends.
//!
//! A uniform record interface over heterogeneous backing stores, with atomic
//! read-modify-write and lease-based locking derived from conditional writes:
//! - `BackendDriver`: get, conditional put, conditional delete, sorted listing
//! - `RetryPolicy` / `RetryingDriver`: capped exponential backoff for transient faults
//! - `RecordStore`: create, optimistic update, delete, listing helpers
//! - `LockCoordinator`: advisory leases stored as records
//! - `JsonStore`: serde-typed records on top of a `RecordStore`
//! - `MemoryDriver`: in-process driver with fault injection

mod config;
mod driver;
mod error;
mod json;
mod lock;
mod memory;
mod retry;
mod store;
mod types;

pub use config::{LockConfig, RetryConfig, StoreConfig};
pub use driver::{BackendDriver, EntryStream};
pub use error::{Result, StorageError, TransientKind};
pub use json::JsonStore;
pub use lock::{Lock, LockCoordinator};
pub use memory::MemoryDriver;
pub use retry::{RetryPolicy, RetryingDriver};
pub use store::RecordStore;
pub use types::{validate_key, ListingEntry, Precondition, Record, Version};
