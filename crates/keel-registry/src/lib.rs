//! Mirror registry client for the Keel module system.
//!
//! Speaks the versioned fetch protocol against an ordered chain of mirror
//! registries: version lists, latest-revision queries, version metadata,
//! manifest bytes, and size-capped archive streams. Each logical operation
//! walks the mirror chain in order, falling back according to each mirror's
//! policy, and reports the most actionable error when every mirror fails.
//!
//! The crate also provides the local content cache keyed by module identity
//! and the integrity records used to detect tampered artifacts.

pub mod cache;
pub mod client;
pub mod error;
pub mod integrity;
pub mod mirror;
pub mod origin;
pub mod singleflight;

// Re-exports for convenience.
pub use cache::ModuleCache;
pub use client::{MirrorClient, RevisionInfo};
pub use error::{ErrorRank, RegistryError, Result};
pub use integrity::ContentHash;
pub use mirror::{parse_mirror_list, try_mirrors, RegistrySpec};
pub use origin::Origin;
pub use singleflight::OnceMap;
