//! # rescache
//!
//! A keyed cache of eagerly-started asynchronous lookups, with sliding
//! time-to-live eviction and request deduplication.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use rescache::{CacheConfig, Resource, ResourceCache, ResourceState};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let cache = ResourceCache::<String, String>::new(CacheConfig::with_ttl(Duration::from_secs(5)))?;
//!     cache.start();
//!
//!     let pikachu = cache.get_or_create("Pikachu", |name| {
//!         let name = name.to_owned();
//!         Resource::new(async move { Ok(format!("{name} is an electric type")) })
//!     });
//!
//!     match pikachu.read() {
//!         ResourceState::Pending => println!("still loading"),
//!         ResourceState::Resolved(info) => println!("{info}"),
//!         ResourceState::Rejected(e) => println!("lookup failed: {e}"),
//!     }
//!
//!     println!("{}", pikachu.settled().await?);
//!     cache.stop().await;
//!     Ok(())
//! }
//! ```

// ── Core ──────────────────────────────────────────────────────────────────────
pub mod cache;
pub mod resource;

// ── Sweep timer and view-layer integration ────────────────────────────────────
pub mod background;
pub mod scheduling;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use cache::{CacheConfig, CacheKey, CacheStatsSnapshot, ConfigError, ResourceCache};
pub use resource::{Fetch, Resource, ResourceError, ResourceState};
pub use scheduling::{ResourceSlot, Transition, TransitionConfig, TransitionOutcome};
