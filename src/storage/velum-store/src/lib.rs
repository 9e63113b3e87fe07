//! # Velum Store
//!
//! Resource store seam for the encryption reconciler:
//! - [`ResourceStore`] — get/list/update with optimistic concurrency plus
//!   raw reads exposing the encrypted-by marker
//! - [`MemoryStore`] — in-memory backend standing in for the API server,
//!   sealing writes with the currently published write provider
//! - [`ConfigStore`] — typed compare-and-swap adapter over the encryption
//!   config object

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod object;
pub mod store;

pub use config::ConfigStore;
pub use error::StoreError;
pub use object::{ObjectMeta, ObjectPage, RawRecord, StoredObject};
pub use store::{MemoryStore, ResourceStore, CONFIG_OBJECT_KEY};
