//! Role-scoped tool catalogs.
//!
//! - [`types`]: tool descriptors and the TTL-stamped cached set
//! - [`cache`]: injected cache object with per-role refresh coalescing

pub mod cache;
pub mod types;

pub use cache::ToolCatalogCache;
pub use types::{CachedToolSet, ToolDescriptor};
