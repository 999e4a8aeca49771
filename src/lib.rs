#![warn(clippy::all)]
#![warn(rust_2018_idioms)]

//! A concurrent, reference-aware expiring cache.
//!
//! `refcache` provides a thread-safe key/value store whose values live behind
//! *reclaimable slots*: the cache never pins a value harder than its
//! [`Strength`] allows, readers hold values alive through [`ValueRef`] guards,
//! and a cooperative maintenance pass purges entries whose values were
//! reclaimed. On top of that, entries expire on time-to-live and time-to-idle
//! rules (cache-wide defaults with per-entry overrides), concurrent loads for
//! the same missing key are collapsed into a single flight, and a removal
//! listener observes every removal exactly once with its [`RemovalCause`].
//!
//! There is no background thread: every public operation first drains the
//! pending reclamations, so maintenance cost is spread across the callers.
//!
//! # Example
//!
//! ```rust
//! use refcache::{Cache, RemovalCause};
//!
//! use std::time::Duration;
//!
//! let cache: Cache<String, String> = Cache::builder()
//!     .time_to_live(Duration::from_secs(30 * 60))
//!     .removal_listener(|key, cause| {
//!         if cause == RemovalCause::Expired {
//!             eprintln!("{key} expired");
//!         }
//!     })
//!     .build();
//!
//! cache.insert("user:1".to_string(), "Alice".to_string());
//!
//! // A read hands out a guard; the value cannot be reclaimed while the
//! // guard is held.
//! if let Some(hit) = cache.get(&"user:1".to_string()) {
//!     assert_eq!(hit.value().map(String::as_str), Some("Alice"));
//! }
//!
//! // Concurrent callers of get_with for the same key share one loader run.
//! let value = cache.get_with("user:2".to_string(), || {
//!     Some("Bob".to_string())
//! });
//! assert_eq!(
//!     value.and_then(|v| v.value().cloned()),
//!     Some("Bob".to_string())
//! );
//! ```

mod builder;
mod cache;
pub(crate) mod common;
mod entry;
pub mod notification;
mod policy;
mod slot;
mod table;
mod value;
mod value_initializer;

pub use builder::CacheBuilder;
pub use cache::Cache;
pub use common::error::ExpirationError;
pub use notification::{RemovalCause, RemovalListener};
pub use policy::{EntryExpiration, Policy, Strength};
pub use value::{CacheValue, ValueRef};
