//! In-memory reference backend.
//!
//! Implements the [`crate::session::Session`] boundary over a versioned
//! store so the pool, translator and transaction layers can be exercised
//! without a live backend.

mod predicate;
pub mod session;
pub mod store;

pub use session::{MAX_FID_CONSTRAINT, MemBackend, MemSession};
pub use store::VersionedStore;
