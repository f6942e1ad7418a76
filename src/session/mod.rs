//! The opaque backend session boundary.
//!
//! A [`Session`] is an expensive, stateful, single-threaded handle to one
//! backend connection. All backend quirks (column ordering, shape-column
//! placement, FID batch limits) stay behind this trait; the pool and the
//! executor only see the operations below. Exclusive access is enforced
//! by the pool's lease discipline, never by locking a session.

use async_trait::async_trait;

use crate::core::{Envelope, FeatureSchema, Result, Row, Value};

/// Backend version-state pointer.
pub type StateId = u64;

/// The committed baseline every AUTO_COMMIT operation works against.
pub const DEFAULT_STATE: StateId = 0;

/// A spatial constraint pushed down to the backend: the qualified
/// geometry column must intersect the envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct SpatialConstraint {
    pub column: String,
    pub envelope: Envelope,
}

/// The backend-native description of one query, as handed to the
/// aggregate operations. Mirrors what `prepare_query` and the constraint
/// setters received, so count/extent run against the same row set as the
/// open cursor without touching it.
#[derive(Debug, Clone)]
pub struct QueryInfo {
    pub columns: Vec<String>,
    pub tables: Vec<String>,
    pub where_clause: Option<String>,
    pub spatial: Vec<SpatialConstraint>,
    pub fids: Option<Vec<u64>>,
    /// Qualified geometry column used by extent aggregation.
    pub geometry_column: Option<String>,
}

#[async_trait]
pub trait Session: Send {
    fn id(&self) -> u64;
    fn is_closed(&self) -> bool;

    // Catalog
    async fn describe(&mut self, table: &str) -> Result<FeatureSchema>;
    async fn list_tables(&mut self) -> Result<Vec<String>>;
    async fn create_table(&mut self, schema: FeatureSchema) -> Result<()>;

    // Query lifecycle. One query at a time per session.
    async fn prepare_query(
        &mut self,
        columns: &[String],
        tables: &[String],
        where_clause: Option<&str>,
    ) -> Result<()>;
    async fn set_spatial_constraints(&mut self, constraints: &[SpatialConstraint]) -> Result<()>;
    async fn set_fid_constraint(&mut self, fids: &[u64]) -> Result<()>;
    async fn execute(&mut self) -> Result<()>;
    async fn fetch(&mut self) -> Result<Option<Row>>;
    async fn close_query(&mut self) -> Result<()>;

    // Aggregates, computed backend-side and independent of the cursor.
    async fn calculate_count(&mut self, info: &QueryInfo) -> Result<u64>;
    async fn calculate_extent(&mut self, info: &QueryInfo) -> Result<Envelope>;

    // Writes, applied to the session's current version state.
    async fn insert(&mut self, table: &str, values: &[(String, Value)]) -> Result<u64>;
    async fn update(
        &mut self,
        table: &str,
        where_clause: Option<&str>,
        assignments: &[(String, Value)],
    ) -> Result<usize>;
    async fn delete(&mut self, table: &str, where_clause: Option<&str>) -> Result<usize>;

    // Transaction and version-state primitives.
    async fn start_transaction(&mut self) -> Result<()>;
    async fn commit_transaction(&mut self) -> Result<()>;
    async fn rollback_transaction(&mut self) -> Result<()>;
    async fn create_state(&mut self, parent: StateId) -> Result<StateId>;
    async fn change_version_state(&mut self, state: StateId) -> Result<()>;
    async fn trim_state_tree(&mut self, parent: StateId, state: StateId) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

/// Creates sessions for the pool. A real deployment connects to the
/// backend here; tests plug in the in-memory backend.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn create_session(&self, id: u64) -> Result<Box<dyn Session>>;
}
