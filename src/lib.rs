//! geostore: a pooled, versioned data-access layer for spatial feature
//! stores.
//!
//! The crate is layered. [`DataStore`] is the public facade: it owns a
//! bounded [`SessionPool`], translates generic [`Query`] values into
//! backend-native [`QueryPlan`]s (splitting filters, qualifying and
//! reordering projections, batching FID constraints), and runs them
//! through a [`QueryExecutor`] state machine on an exclusively leased
//! [`Session`]. Writes and queries alike run under a [`Transaction`]
//! visibility context: AUTO_COMMIT against the committed baseline, or a
//! versioned overlay state that commit publishes atomically.
//!
//! ```no_run
//! use geostore::{DataStore, Filter, Query, Transaction, Value};
//!
//! # async fn demo() -> geostore::Result<()> {
//! let store = DataStore::in_memory().await?;
//! let mut cursor = store
//!     .query(
//!         Query::new("roads").filter(
//!             Filter::eq("surface", Value::Text("paved".into()))
//!                 .and(Filter::bbox(0.0, 0.0, 100.0, 100.0)),
//!         ),
//!         Transaction::AutoCommit,
//!     )
//!     .await?;
//! while let Some(row) = cursor.fetch().await? {
//!     println!("{:?}", row);
//! }
//! cursor.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod core;
pub mod exec;
pub mod facade;
pub mod filter;
pub mod plan;
pub mod pool;
pub mod session;
pub mod txn;
pub mod view;

pub use crate::core::{
    AttributeDescriptor, DataType, Envelope, FeatureSchema, GeoError, Result, Row, Shape, Value,
};
pub use exec::{ExecutorState, QueryExecutor};
pub use facade::DataStore;
pub use filter::{ComparisonOp, Filter};
pub use plan::{FID_BATCH_LIMIT, Query, QueryPlan, Transaction};
pub use pool::{PoolConfig, PoolStats, SessionPool};
pub use session::{DEFAULT_STATE, Session, SessionFactory, StateId};
pub use view::{ViewDefinition, ViewRegistry};
