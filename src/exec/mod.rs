//! Query execution over a leased session.
//!
//! A [`QueryExecutor`] owns one pool lease for its whole lifetime and
//! walks a strict state machine: `Created` → `Prepared` → `Executing` →
//! `Closed`. FID constraints wider than the backend batch limit are
//! transparently re-executed batch by batch inside `fetch`, so callers
//! see one continuous cursor. Aggregates run against the same plan and
//! visibility state without disturbing the cursor.

use std::fmt;

use tracing::debug;

use crate::core::{Envelope, FeatureSchema, GeoError, Result, Row};
use crate::plan::QueryPlan;
use crate::pool::PoolGuard;
use crate::session::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorState {
    Created,
    Prepared,
    Executing,
    Closed,
}

pub struct QueryExecutor {
    plan: QueryPlan,
    guard: Option<PoolGuard>,
    state: ExecutorState,
    /// Next FID batch to run, when the plan carries an FID constraint.
    next_batch: usize,
    /// Set once the cursor (and all batches) have been drained.
    exhausted: bool,
}

// The pool lease is opaque, so derive is out.
impl fmt::Debug for QueryExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryExecutor")
            .field("type_name", &self.plan.type_name)
            .field("state", &self.state)
            .field("next_batch", &self.next_batch)
            .field("exhausted", &self.exhausted)
            .finish_non_exhaustive()
    }
}

impl QueryExecutor {
    pub fn new(guard: PoolGuard, plan: QueryPlan) -> Self {
        Self {
            plan,
            guard: Some(guard),
            state: ExecutorState::Created,
            next_batch: 0,
            exhausted: false,
        }
    }

    pub fn state(&self) -> ExecutorState {
        self.state
    }

    pub fn plan(&self) -> &QueryPlan {
        &self.plan
    }

    /// Result schema, in the order `fetch` returns values.
    pub fn schema(&self) -> &FeatureSchema {
        &self.plan.schema
    }

    fn session(&mut self) -> Result<&mut dyn Session> {
        match self.guard.as_mut() {
            Some(guard) => Ok(guard.session()),
            None => Err(GeoError::IllegalState("executor is closed".into())),
        }
    }

    fn expect_state(&self, expected: ExecutorState, op: &str) -> Result<()> {
        if self.state != expected {
            return Err(GeoError::IllegalState(format!(
                "{} requires state {:?}, executor is {:?}",
                op, expected, self.state
            )));
        }
        Ok(())
    }

    /// Push the plan down to the session.
    pub async fn prepare(&mut self) -> Result<()> {
        self.expect_state(ExecutorState::Created, "prepare")?;
        let state = self.plan.state;
        let columns = self.plan.columns.clone();
        let tables = self.plan.tables.clone();
        let where_clause = self.plan.where_clause.clone();
        let spatial = self.plan.spatial.clone();

        let session = self.session()?;
        session.change_version_state(state).await?;
        session
            .prepare_query(&columns, &tables, where_clause.as_deref())
            .await?;
        if !spatial.is_empty() {
            session.set_spatial_constraints(&spatial).await?;
        }
        self.state = ExecutorState::Prepared;
        Ok(())
    }

    /// Execute the prepared query and open the cursor.
    pub async fn execute(&mut self) -> Result<()> {
        self.expect_state(ExecutorState::Prepared, "execute")?;
        match self.plan.fids.as_deref() {
            Some([]) => {
                // An empty FID constraint matches nothing; never touch
                // the backend.
                self.exhausted = true;
            }
            Some(fids) => {
                let batch = fids.chunks(crate::plan::FID_BATCH_LIMIT)
                    .next()
                    .map(<[u64]>::to_vec)
                    .unwrap_or_default();
                let session = self.session()?;
                session.set_fid_constraint(&batch).await?;
                session.execute().await?;
                self.next_batch = 1;
            }
            None => {
                self.session()?.execute().await?;
            }
        }
        self.state = ExecutorState::Executing;
        Ok(())
    }

    /// Next row, advancing FID batches as they drain.
    pub async fn fetch(&mut self) -> Result<Option<Row>> {
        self.expect_state(ExecutorState::Executing, "fetch")?;
        if self.exhausted {
            return Ok(None);
        }
        loop {
            if let Some(row) = self.session()?.fetch().await? {
                return Ok(Some(row));
            }
            if !self.advance_batch().await? {
                self.exhausted = true;
                return Ok(None);
            }
        }
    }

    /// Drain the whole cursor.
    pub async fn fetch_all(&mut self) -> Result<Vec<Row>> {
        let mut rows = Vec::new();
        while let Some(row) = self.fetch().await? {
            rows.push(row);
        }
        Ok(rows)
    }

    async fn advance_batch(&mut self) -> Result<bool> {
        let batch = {
            let Some(mut batches) = self.plan.fid_batches() else {
                return Ok(false);
            };
            match batches.nth(self.next_batch) {
                Some(batch) => batch.to_vec(),
                None => return Ok(false),
            }
        };
        self.next_batch += 1;
        debug!(batch = self.next_batch, size = batch.len(), "advancing FID batch");

        let columns = self.plan.columns.clone();
        let tables = self.plan.tables.clone();
        let where_clause = self.plan.where_clause.clone();
        let spatial = self.plan.spatial.clone();

        let session = self.session()?;
        session.close_query().await?;
        session
            .prepare_query(&columns, &tables, where_clause.as_deref())
            .await?;
        if !spatial.is_empty() {
            session.set_spatial_constraints(&spatial).await?;
        }
        session.set_fid_constraint(&batch).await?;
        session.execute().await?;
        Ok(true)
    }

    /// Number of features the plan matches, computed backend-side.
    ///
    /// Independent of the cursor: counting never consumes rows, and
    /// batched FID constraints are summed across batches.
    pub async fn calculate_result_count(&mut self) -> Result<u64> {
        self.check_not_closed("calculate_result_count")?;
        let state = self.plan.state;
        match self.plan.fids.clone() {
            None => {
                let info = self.plan.query_info(None);
                let session = self.session()?;
                session.change_version_state(state).await?;
                session.calculate_count(&info).await
            }
            Some(fids) => {
                let mut total = 0u64;
                for batch in fids.chunks(crate::plan::FID_BATCH_LIMIT) {
                    let info = self.plan.query_info(Some(batch));
                    let session = self.session()?;
                    session.change_version_state(state).await?;
                    total += session.calculate_count(&info).await?;
                }
                Ok(total)
            }
        }
    }

    /// Bounding envelope of every matched feature's shape.
    pub async fn calculate_query_extent(&mut self) -> Result<Envelope> {
        self.check_not_closed("calculate_query_extent")?;
        if self.plan.geometry_column.is_none() {
            return Err(GeoError::UnsupportedQueryShape(format!(
                "extent of '{}' requires a projected shape column",
                self.plan.type_name
            )));
        }
        let state = self.plan.state;
        match self.plan.fids.clone() {
            None => {
                let info = self.plan.query_info(None);
                let session = self.session()?;
                session.change_version_state(state).await?;
                session.calculate_extent(&info).await
            }
            Some(fids) => {
                let mut extent = Envelope::empty();
                for batch in fids.chunks(crate::plan::FID_BATCH_LIMIT) {
                    let info = self.plan.query_info(Some(batch));
                    let session = self.session()?;
                    session.change_version_state(state).await?;
                    extent = extent.union(&session.calculate_extent(&info).await?);
                }
                Ok(extent)
            }
        }
    }

    fn check_not_closed(&self, op: &str) -> Result<()> {
        if self.state == ExecutorState::Closed {
            return Err(GeoError::IllegalState(format!(
                "{} on a closed executor",
                op
            )));
        }
        Ok(())
    }

    /// Close the cursor and return the session to the pool.
    ///
    /// Idempotent; the lease is released exactly once.
    pub async fn close(&mut self) -> Result<()> {
        let Some(mut guard) = self.guard.take() else {
            return Ok(());
        };
        self.state = ExecutorState::Closed;
        let result = guard.session().close_query().await;
        // Do not leak versioned visibility into the idle pool.
        let _ = guard
            .session()
            .change_version_state(crate::session::DEFAULT_STATE)
            .await;
        guard.release().await?;
        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::backend::MemBackend;
    use crate::core::{AttributeDescriptor, DataType, Value};
    use crate::filter::Filter;
    use crate::plan::{self, Query};
    use crate::pool::{PoolConfig, SessionPool};
    use crate::session::DEFAULT_STATE;

    async fn seeded() -> (SessionPool, FeatureSchema) {
        let backend = MemBackend::new();
        let schema = FeatureSchema::new(
            "points",
            "fid",
            vec![
                AttributeDescriptor::new("fid", DataType::Int).not_null(),
                AttributeDescriptor::new("label", DataType::Text),
                AttributeDescriptor::new("shape", DataType::Geometry),
            ],
        );
        {
            let store = backend.store();
            let mut store = store.write().unwrap();
            store.create_table(schema.clone()).unwrap();
            for i in 0..5i64 {
                store
                    .insert(
                        "points",
                        DEFAULT_STATE,
                        &[
                            ("label".to_string(), Value::Text(format!("p{}", i))),
                            (
                                "shape".to_string(),
                                Value::Geometry(crate::core::Shape::point(i as f64, i as f64)),
                            ),
                        ],
                    )
                    .unwrap();
            }
        }
        let pool = SessionPool::new(PoolConfig::new("sde", "sde"), Arc::new(backend))
            .await
            .unwrap();
        (pool, schema)
    }

    async fn run(pool: &SessionPool, plan: plan::QueryPlan) -> QueryExecutor {
        let guard = pool.lease().await.unwrap();
        let mut exec = QueryExecutor::new(guard, plan);
        exec.prepare().await.unwrap();
        exec.execute().await.unwrap();
        exec
    }

    #[tokio::test]
    async fn test_lifecycle_enforced() {
        let (pool, schema) = seeded().await;
        let plan = plan::translate(&Query::new("points"), &schema, DEFAULT_STATE).unwrap();
        let guard = pool.lease().await.unwrap();
        let mut exec = QueryExecutor::new(guard, plan);

        assert_eq!(exec.state(), ExecutorState::Created);
        assert!(exec.fetch().await.is_err());
        assert!(exec.execute().await.is_err());
        exec.prepare().await.unwrap();
        assert_eq!(exec.state(), ExecutorState::Prepared);
        assert!(exec.prepare().await.is_err());
        exec.execute().await.unwrap();
        assert_eq!(exec.state(), ExecutorState::Executing);
        assert!(exec.fetch().await.unwrap().is_some());
        exec.close().await.unwrap();
        assert_eq!(exec.state(), ExecutorState::Closed);
        assert!(exec.fetch().await.is_err());
        // A second close is a no-op.
        exec.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_fetch_drains_all_rows() {
        let (pool, schema) = seeded().await;
        let plan = plan::translate(&Query::new("points"), &schema, DEFAULT_STATE).unwrap();
        let mut exec = run(&pool, plan).await;
        let rows = exec.fetch_all().await.unwrap();
        assert_eq!(rows.len(), 5);
        assert!(exec.fetch().await.unwrap().is_none());
        exec.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_count_does_not_consume_cursor() {
        let (pool, schema) = seeded().await;
        let plan = plan::translate(&Query::new("points"), &schema, DEFAULT_STATE).unwrap();
        let mut exec = run(&pool, plan).await;

        assert_eq!(exec.calculate_result_count().await.unwrap(), 5);
        assert_eq!(exec.fetch_all().await.unwrap().len(), 5);
        exec.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_aggregates_mid_iteration_leave_cursor_intact() {
        let (pool, schema) = seeded().await;
        let query = Query::new("points").filter(Filter::bbox(1.0, 1.0, 4.0, 4.0));
        let plan = plan::translate(&query, &schema, DEFAULT_STATE).unwrap();
        let mut exec = run(&pool, plan).await;

        assert!(exec.fetch().await.unwrap().is_some());
        assert!(exec.fetch().await.unwrap().is_some());

        // Aggregates mid-stream see the whole result set.
        assert_eq!(exec.calculate_result_count().await.unwrap(), 4);
        assert_eq!(
            exec.calculate_query_extent().await.unwrap(),
            Envelope::new(1.0, 1.0, 4.0, 4.0)
        );

        // And the cursor picks up exactly where it left off.
        assert_eq!(exec.fetch_all().await.unwrap().len(), 2);
        exec.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_fid_constraint_yields_nothing() {
        let (pool, schema) = seeded().await;
        let query = Query::new("points")
            .filter(Filter::fids([100]).and(Filter::fids([200])));
        let plan = plan::translate(&query, &schema, DEFAULT_STATE).unwrap();
        assert_eq!(plan.fids.as_deref(), Some(&[][..]));

        let mut exec = run(&pool, plan).await;
        assert!(exec.fetch().await.unwrap().is_none());
        assert_eq!(exec.calculate_result_count().await.unwrap(), 0);
        exec.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_session_returns_to_pool_on_close() {
        let (pool, schema) = seeded().await;
        let plan = plan::translate(&Query::new("points"), &schema, DEFAULT_STATE).unwrap();
        let mut exec = run(&pool, plan).await;
        exec.close().await.unwrap();

        let stats = pool.stats().await;
        assert_eq!(stats.available_sessions, 1);
        assert_eq!(stats.active_sessions, 0);
    }
}
