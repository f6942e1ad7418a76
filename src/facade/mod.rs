//! The public entry point: a pooled, versioned spatial feature store.
//!
//! [`DataStore`] ties the layers together: it resolves feature types
//! against the backend catalog and the view registry, translates
//! queries into backend plans, runs them on leased sessions and routes
//! every operation through the visibility state of its transaction
//! argument. Sessions never leak transaction state: visibility is set
//! per lease and reset before a session rejoins the pool.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use crate::backend::MemBackend;
use crate::core::{DataType, Envelope, FeatureSchema, GeoError, Result, Value};
use crate::exec::QueryExecutor;
use crate::filter::{self, Filter};
use crate::plan::{self, Query, Transaction};
use crate::pool::{PoolConfig, PoolGuard, PoolStats, SessionPool};
use crate::session::{DEFAULT_STATE, SessionFactory, StateId};
use crate::txn::{TransactionStatus, TransactionTable};
use crate::view::{ViewDefinition, ViewRegistry};

pub struct DataStore {
    pool: SessionPool,
    views: ViewRegistry,
    transactions: TransactionTable,
}

impl DataStore {
    /// Open a store against a session factory.
    pub async fn connect(config: PoolConfig, factory: Arc<dyn SessionFactory>) -> Result<Self> {
        info!(
            host = %config.host,
            instance = %config.instance,
            max_sessions = config.max_sessions,
            "opening data store"
        );
        Ok(Self {
            pool: SessionPool::new(config, factory).await?,
            views: ViewRegistry::new(),
            transactions: TransactionTable::new(),
        })
    }

    /// Open a store over a fresh in-memory backend.
    pub async fn in_memory() -> Result<Self> {
        Self::connect(PoolConfig::default(), Arc::new(MemBackend::new())).await
    }

    // ------------------------------------------------------------------
    // Catalog
    // ------------------------------------------------------------------

    pub async fn create_schema(&self, schema: FeatureSchema) -> Result<()> {
        let fid = schema
            .attribute(&schema.fid_column)
            .ok_or_else(|| {
                GeoError::IllegalState(format!(
                    "FID column '{}' is not among the attributes of '{}'",
                    schema.fid_column, schema.type_name
                ))
            })?;
        if fid.data_type != DataType::Int {
            return Err(GeoError::TypeMismatch(format!(
                "FID column '{}' must be an integer",
                schema.fid_column
            )));
        }
        if self.views.get(&schema.type_name)?.is_some() {
            return Err(GeoError::IllegalState(format!(
                "'{}' is already registered as a view",
                schema.type_name
            )));
        }

        let mut guard = self.pool.lease().await?;
        let result = guard.session().create_table(schema).await;
        guard.release().await?;
        result
    }

    /// Every known feature type: base tables plus registered views.
    pub async fn type_names(&self) -> Result<Vec<String>> {
        let mut guard = self.pool.lease().await?;
        let tables = guard.session().list_tables().await;
        guard.release().await?;

        let mut names = tables?;
        names.extend(self.views.names()?);
        names.sort();
        names.dedup();
        Ok(names)
    }

    /// Schema of a base table or the merged schema of a view.
    pub async fn schema(&self, type_name: &str) -> Result<FeatureSchema> {
        if let Some(view) = self.views.get(type_name)? {
            return Ok(view.schema.clone());
        }
        let mut guard = self.pool.lease().await?;
        let result = guard.session().describe(type_name).await;
        guard.release().await?;
        result
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Run a query and hand back its open cursor.
    ///
    /// The executor owns a pool lease until closed; callers must call
    /// [`QueryExecutor::close`] when done.
    pub async fn query(&self, query: Query, txn: Transaction) -> Result<QueryExecutor> {
        let state = self.resolve_state(txn)?;
        let mut guard = self.pool.lease().await?;
        let plan = match self.build_plan(&query, state, &mut guard).await {
            Ok(plan) => plan,
            Err(e) => {
                guard.release().await?;
                return Err(e);
            }
        };

        let mut executor = QueryExecutor::new(guard, plan);
        let started = async {
            executor.prepare().await?;
            executor.execute().await
        }
        .await;
        match started {
            Ok(()) => Ok(executor),
            Err(e) => {
                executor.close().await?;
                Err(e)
            }
        }
    }

    /// Number of features the query matches.
    pub async fn count(&self, query: Query, txn: Transaction) -> Result<u64> {
        let mut executor = self.aggregate_executor(query, txn).await?;
        let result = executor.calculate_result_count().await;
        executor.close().await?;
        result
    }

    /// Bounding envelope of the shapes the query matches.
    pub async fn extent(&self, query: Query, txn: Transaction) -> Result<Envelope> {
        let mut executor = self.aggregate_executor(query, txn).await?;
        let result = executor.calculate_query_extent().await;
        executor.close().await?;
        result
    }

    async fn aggregate_executor(&self, query: Query, txn: Transaction) -> Result<QueryExecutor> {
        let state = self.resolve_state(txn)?;
        let mut guard = self.pool.lease().await?;
        match self.build_plan(&query, state, &mut guard).await {
            Ok(plan) => Ok(QueryExecutor::new(guard, plan)),
            Err(e) => {
                guard.release().await?;
                Err(e)
            }
        }
    }

    async fn build_plan(
        &self,
        query: &Query,
        state: StateId,
        guard: &mut PoolGuard,
    ) -> Result<plan::QueryPlan> {
        if let Some(view) = self.views.get(&query.type_name)? {
            return plan::translate_view(query, &view, state);
        }
        let schema = guard.session().describe(&query.type_name).await?;
        plan::translate(query, &schema, state)
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Insert a feature; returns its assigned FID.
    pub async fn insert(
        &self,
        type_name: &str,
        values: &[(String, Value)],
        txn: Transaction,
    ) -> Result<u64> {
        self.check_writable(type_name)?;
        let state = self.resolve_state(txn)?;

        let mut guard = self.pool.lease().await?;
        let result = async {
            guard.session().change_version_state(state).await?;
            guard.session().insert(type_name, values).await
        }
        .await;
        Self::reset_and_release(guard).await?;
        result
    }

    /// Update every feature the filter matches; returns the count.
    ///
    /// Only attribute filters can drive a write; spatial and FID
    /// predicates are rejected.
    pub async fn update(
        &self,
        type_name: &str,
        filter: &Filter,
        assignments: &[(String, Value)],
        txn: Transaction,
    ) -> Result<usize> {
        self.check_writable(type_name)?;
        let state = self.resolve_state(txn)?;

        let mut guard = self.pool.lease().await?;
        let result = async {
            let where_clause =
                Self::write_predicate(filter, &guard.session().describe(type_name).await?)?;
            guard.session().change_version_state(state).await?;
            guard
                .session()
                .update(type_name, where_clause.as_deref(), assignments)
                .await
        }
        .await;
        Self::reset_and_release(guard).await?;
        result
    }

    /// Delete every feature the filter matches; returns the count.
    pub async fn delete(
        &self,
        type_name: &str,
        filter: &Filter,
        txn: Transaction,
    ) -> Result<usize> {
        self.check_writable(type_name)?;
        let state = self.resolve_state(txn)?;

        let mut guard = self.pool.lease().await?;
        let result = async {
            let where_clause =
                Self::write_predicate(filter, &guard.session().describe(type_name).await?)?;
            guard.session().change_version_state(state).await?;
            guard
                .session()
                .delete(type_name, where_clause.as_deref())
                .await
        }
        .await;
        Self::reset_and_release(guard).await?;
        result
    }

    fn check_writable(&self, type_name: &str) -> Result<()> {
        if self.views.get(type_name)?.is_some() {
            return Err(GeoError::IllegalState(format!(
                "view '{}' is read-only",
                type_name
            )));
        }
        Ok(())
    }

    fn write_predicate(filter: &Filter, schema: &FeatureSchema) -> Result<Option<String>> {
        let split = filter::split(filter)?;
        if !split.spatial.is_empty() || split.fids.is_some() {
            return Err(GeoError::UnsupportedQueryShape(
                "writes accept attribute filters only".into(),
            ));
        }
        let table = schema.type_name.clone();
        let qualify = move |attribute: &str| -> Result<String> {
            if schema.attribute(attribute).is_none() {
                return Err(GeoError::AttributeNotFound(
                    table.clone(),
                    attribute.to_string(),
                ));
            }
            Ok(format!("{}.{}", table, attribute))
        };
        split
            .attribute
            .as_ref()
            .map(|attr| filter::encode(attr, &qualify))
            .transpose()
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    /// Open a transaction: a private version state writes accumulate in
    /// until commit publishes them atomically.
    pub async fn begin_transaction(&self) -> Result<Transaction> {
        let mut guard = self.pool.lease().await?;
        let result = async {
            guard.session().start_transaction().await?;
            guard.session().create_state(DEFAULT_STATE).await
        }
        .await;
        Self::reset_and_release(guard).await?;

        let context = self.transactions.begin(result?)?;
        Ok(context.transaction())
    }

    /// Publish a transaction's pending state into the baseline.
    pub async fn commit_transaction(&self, txn: Transaction) -> Result<()> {
        let context = self.require_versioned(txn)?;

        let mut guard = self.pool.lease().await?;
        let result = async {
            guard
                .session()
                .change_version_state(context.pending_state)
                .await?;
            guard.session().commit_transaction().await
        }
        .await;
        Self::reset_and_release(guard).await?;

        // A failed backend commit leaves the handle active so the
        // caller can still roll back.
        result?;
        self.transactions
            .finish(context.handle, TransactionStatus::Committed)?;
        debug!(handle = %context.handle, "transaction committed");
        Ok(())
    }

    /// Discard a transaction's pending state.
    pub async fn rollback_transaction(&self, txn: Transaction) -> Result<()> {
        let context = self.require_versioned(txn)?;

        let mut guard = self.pool.lease().await?;
        let result = async {
            guard
                .session()
                .change_version_state(context.pending_state)
                .await?;
            guard.session().rollback_transaction().await?;
            // Rollback of an already-discarded state is a no-op.
            guard
                .session()
                .trim_state_tree(context.base_state, context.pending_state)
                .await
        }
        .await;
        Self::reset_and_release(guard).await?;

        result?;
        self.transactions
            .finish(context.handle, TransactionStatus::RolledBack)?;
        debug!(handle = %context.handle, "transaction rolled back");
        Ok(())
    }

    fn require_versioned(&self, txn: Transaction) -> Result<crate::txn::TransactionContext> {
        match txn {
            Transaction::AutoCommit => Err(GeoError::IllegalState(
                "AUTO_COMMIT has no transaction to finish".into(),
            )),
            Transaction::Versioned { handle, .. } => self.transactions.active(handle),
        }
    }

    fn resolve_state(&self, txn: Transaction) -> Result<StateId> {
        match txn {
            Transaction::AutoCommit => Ok(DEFAULT_STATE),
            Transaction::Versioned { handle, .. } => {
                Ok(self.transactions.active(handle)?.pending_state)
            }
        }
    }

    /// Reset a session's visibility before it rejoins the idle set.
    async fn reset_and_release(mut guard: PoolGuard) -> Result<()> {
        let _ = guard.session().change_version_state(DEFAULT_STATE).await;
        guard.release().await
    }

    // ------------------------------------------------------------------
    // Views
    // ------------------------------------------------------------------

    /// Parse and register a view over two base tables.
    pub async fn register_view(&self, name: &str, sql: &str) -> Result<()> {
        let mut guard = self.pool.lease().await?;
        let catalog = async {
            let tables = guard.session().list_tables().await?;
            if tables.iter().any(|t| t == name) {
                return Err(GeoError::IllegalViewDefinition(format!(
                    "'{}' already names a base table",
                    name
                )));
            }
            let mut catalog = HashMap::new();
            for table in tables {
                let schema = guard.session().describe(&table).await?;
                catalog.insert(table, schema);
            }
            Ok(catalog)
        }
        .await;
        guard.release().await?;

        let definition = ViewDefinition::parse(name, sql, &catalog?)?;
        self.views.register(definition)?;
        debug!(view = name, "view registered");
        Ok(())
    }

    /// Remove a registered view. Returns whether it existed.
    pub fn unregister_view(&self, name: &str) -> Result<bool> {
        self.views.unregister(name)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    pub async fn stats(&self) -> PoolStats {
        self.pool.stats().await
    }

    /// Close idle sessions and refuse further work.
    pub async fn shutdown(&self) -> Result<()> {
        info!("shutting down data store");
        self.pool.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{AttributeDescriptor, Shape};

    fn roads_schema() -> FeatureSchema {
        FeatureSchema::new(
            "roads",
            "fid",
            vec![
                AttributeDescriptor::new("fid", DataType::Int).not_null(),
                AttributeDescriptor::new("name", DataType::Text),
                AttributeDescriptor::new("shape", DataType::Geometry),
            ],
        )
    }

    #[tokio::test]
    async fn test_insert_then_query_roundtrip() {
        let store = DataStore::in_memory().await.unwrap();
        store.create_schema(roads_schema()).await.unwrap();

        let fid = store
            .insert(
                "roads",
                &[
                    ("name".to_string(), Value::Text("main".into())),
                    (
                        "shape".to_string(),
                        Value::Geometry(Shape::point(1.0, 2.0)),
                    ),
                ],
                Transaction::AutoCommit,
            )
            .await
            .unwrap();

        let mut exec = store
            .query(
                Query::new("roads").filter(Filter::fids([fid])),
                Transaction::AutoCommit,
            )
            .await
            .unwrap();
        let rows = exec.fetch_all().await.unwrap();
        exec.close().await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn test_fid_column_rules_enforced_on_create() {
        let store = DataStore::in_memory().await.unwrap();
        let schema = FeatureSchema::new(
            "bad",
            "missing",
            vec![AttributeDescriptor::new("name", DataType::Text)],
        );
        assert!(store.create_schema(schema).await.is_err());
    }

    #[tokio::test]
    async fn test_views_are_read_only() {
        let store = DataStore::in_memory().await.unwrap();
        store.create_schema(roads_schema()).await.unwrap();
        store
            .create_schema(FeatureSchema::new(
                "surfaces",
                "id",
                vec![
                    AttributeDescriptor::new("id", DataType::Int).not_null(),
                    AttributeDescriptor::new("material", DataType::Text),
                ],
            ))
            .await
            .unwrap();
        store
            .register_view(
                "v",
                "SELECT roads.name, surfaces.material FROM roads, surfaces \
                 WHERE roads.fid = surfaces.id",
            )
            .await
            .unwrap();

        let err = store
            .insert(
                "v",
                &[("name".to_string(), Value::Text("x".into()))],
                Transaction::AutoCommit,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GeoError::IllegalState(_)));
    }

    #[tokio::test]
    async fn test_type_names_merge_tables_and_views() {
        let store = DataStore::in_memory().await.unwrap();
        store.create_schema(roads_schema()).await.unwrap();
        store
            .create_schema(FeatureSchema::new(
                "surfaces",
                "id",
                vec![
                    AttributeDescriptor::new("id", DataType::Int).not_null(),
                    AttributeDescriptor::new("material", DataType::Text),
                ],
            ))
            .await
            .unwrap();
        store
            .register_view(
                "paved",
                "SELECT roads.name FROM roads, surfaces WHERE roads.fid = surfaces.id",
            )
            .await
            .unwrap();

        assert_eq!(
            store.type_names().await.unwrap(),
            vec!["paved", "roads", "surfaces"]
        );
        assert!(store.unregister_view("paved").unwrap());
        assert_eq!(store.type_names().await.unwrap(), vec!["roads", "surfaces"]);
    }
}
