//! In-memory implementation of the backend [`Session`].
//!
//! Reproduces the backend quirks the translator has to respect: the
//! shape column must be the last column of a prepared select list, an
//! FID constraint is limited to [`MAX_FID_CONSTRAINT`] identifiers per
//! prepare, and one query runs at a time per session.

use std::collections::VecDeque;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::debug;

use crate::core::{Envelope, FeatureSchema, GeoError, Result, Row, Value};
use crate::session::{
    DEFAULT_STATE, QueryInfo, Session, SessionFactory, SpatialConstraint, StateId,
};

use super::predicate::Predicate;
use super::store::VersionedStore;

/// Largest FID set one prepared query accepts.
pub const MAX_FID_CONSTRAINT: usize = 1000;

struct PendingQuery {
    columns: Vec<String>,
    tables: Vec<String>,
    where_clause: Option<String>,
    spatial: Vec<SpatialConstraint>,
    fids: Option<Vec<u64>>,
}

pub struct MemSession {
    id: u64,
    store: Arc<RwLock<VersionedStore>>,
    closed: bool,
    current_state: StateId,
    pending: Option<PendingQuery>,
    cursor: Option<VecDeque<Row>>,
}

impl MemSession {
    fn new(id: u64, store: Arc<RwLock<VersionedStore>>) -> Self {
        Self {
            id,
            store,
            closed: false,
            current_state: DEFAULT_STATE,
            pending: None,
            cursor: None,
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(GeoError::BackendIo(format!("session {} is closed", self.id)));
        }
        Ok(())
    }

    fn pending_mut(&mut self) -> Result<&mut PendingQuery> {
        self.pending
            .as_mut()
            .ok_or_else(|| GeoError::IllegalState("no prepared query on this session".into()))
    }

    fn parse_predicate(where_clause: Option<&str>) -> Result<Option<Predicate>> {
        where_clause.map(Predicate::parse).transpose()
    }
}

#[async_trait]
impl Session for MemSession {
    fn id(&self) -> u64 {
        self.id
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    async fn describe(&mut self, table: &str) -> Result<FeatureSchema> {
        self.check_open()?;
        let store = self.store.read()?;
        store.schema(table).cloned()
    }

    async fn list_tables(&mut self) -> Result<Vec<String>> {
        self.check_open()?;
        let store = self.store.read()?;
        Ok(store.table_names())
    }

    async fn create_table(&mut self, schema: FeatureSchema) -> Result<()> {
        self.check_open()?;
        let mut store = self.store.write()?;
        store.create_table(schema)
    }

    async fn prepare_query(
        &mut self,
        columns: &[String],
        tables: &[String],
        where_clause: Option<&str>,
    ) -> Result<()> {
        self.check_open()?;
        if self.cursor.is_some() {
            return Err(GeoError::IllegalState(
                "a query is already executing on this session".into(),
            ));
        }

        // The backend rejects a select list with the shape column
        // anywhere but last.
        {
            let store = self.store.read()?;
            for (index, column) in columns.iter().enumerate() {
                let Some((table, attr)) = column.split_once('.') else {
                    return Err(GeoError::BackendIo(format!(
                        "column '{}' is not table-qualified",
                        column
                    )));
                };
                if !tables.iter().any(|t| t == table) {
                    return Err(GeoError::BackendIo(format!(
                        "column '{}' references a table outside the FROM list",
                        column
                    )));
                }
                let schema = store.schema(table)?;
                if schema.attribute(attr).is_none() {
                    return Err(GeoError::BackendIo(format!(
                        "unknown column '{}'",
                        column
                    )));
                }
                if schema.is_geometry(attr) && index != columns.len() - 1 {
                    return Err(GeoError::BackendIo(
                        "shape column must be the last column of the select list".into(),
                    ));
                }
            }
        }

        self.pending = Some(PendingQuery {
            columns: columns.to_vec(),
            tables: tables.to_vec(),
            where_clause: where_clause.map(|w| w.to_string()),
            spatial: Vec::new(),
            fids: None,
        });
        Ok(())
    }

    async fn set_spatial_constraints(&mut self, constraints: &[SpatialConstraint]) -> Result<()> {
        self.check_open()?;
        self.pending_mut()?.spatial = constraints.to_vec();
        Ok(())
    }

    async fn set_fid_constraint(&mut self, fids: &[u64]) -> Result<()> {
        self.check_open()?;
        if fids.len() > MAX_FID_CONSTRAINT {
            return Err(GeoError::BackendIo(format!(
                "FID constraint of {} exceeds the batch limit of {}",
                fids.len(),
                MAX_FID_CONSTRAINT
            )));
        }
        let mut sorted = fids.to_vec();
        sorted.sort_unstable();
        self.pending_mut()?.fids = Some(sorted);
        Ok(())
    }

    async fn execute(&mut self) -> Result<()> {
        self.check_open()?;
        let pending = self
            .pending
            .take()
            .ok_or_else(|| GeoError::IllegalState("execute without a prepared query".into()))?;
        let info = QueryInfo {
            columns: pending.columns,
            tables: pending.tables,
            where_clause: pending.where_clause,
            spatial: pending.spatial,
            fids: pending.fids,
            geometry_column: None,
        };
        let rows = {
            let store = self.store.read()?;
            store.scan(&info, self.current_state)?
        };
        debug!(session = self.id, rows = rows.len(), "query executed");
        self.cursor = Some(rows.into());
        Ok(())
    }

    async fn fetch(&mut self) -> Result<Option<Row>> {
        self.check_open()?;
        let cursor = self
            .cursor
            .as_mut()
            .ok_or_else(|| GeoError::IllegalState("fetch without an executed query".into()))?;
        Ok(cursor.pop_front())
    }

    async fn close_query(&mut self) -> Result<()> {
        self.pending = None;
        self.cursor = None;
        Ok(())
    }

    async fn calculate_count(&mut self, info: &QueryInfo) -> Result<u64> {
        self.check_open()?;
        let store = self.store.read()?;
        store.count(info, self.current_state)
    }

    async fn calculate_extent(&mut self, info: &QueryInfo) -> Result<Envelope> {
        self.check_open()?;
        let store = self.store.read()?;
        store.extent(info, self.current_state)
    }

    async fn insert(&mut self, table: &str, values: &[(String, Value)]) -> Result<u64> {
        self.check_open()?;
        let mut store = self.store.write()?;
        store.insert(table, self.current_state, values)
    }

    async fn update(
        &mut self,
        table: &str,
        where_clause: Option<&str>,
        assignments: &[(String, Value)],
    ) -> Result<usize> {
        self.check_open()?;
        let predicate = Self::parse_predicate(where_clause)?;
        let mut store = self.store.write()?;
        store.update(table, self.current_state, predicate.as_ref(), assignments)
    }

    async fn delete(&mut self, table: &str, where_clause: Option<&str>) -> Result<usize> {
        self.check_open()?;
        let predicate = Self::parse_predicate(where_clause)?;
        let mut store = self.store.write()?;
        store.delete(table, self.current_state, predicate.as_ref())
    }

    async fn start_transaction(&mut self) -> Result<()> {
        self.check_open()
    }

    async fn commit_transaction(&mut self) -> Result<()> {
        self.check_open()?;
        if self.current_state == DEFAULT_STATE {
            return Err(GeoError::IllegalState(
                "no version state selected for commit".into(),
            ));
        }
        let state = self.current_state;
        {
            let mut store = self.store.write()?;
            store.commit_state(state)?;
        }
        debug!(session = self.id, state, "version state committed");
        self.current_state = DEFAULT_STATE;
        Ok(())
    }

    async fn rollback_transaction(&mut self) -> Result<()> {
        self.check_open()?;
        if self.current_state == DEFAULT_STATE {
            return Err(GeoError::IllegalState(
                "no version state selected for rollback".into(),
            ));
        }
        let state = self.current_state;
        {
            let mut store = self.store.write()?;
            store.remove_state(state);
        }
        debug!(session = self.id, state, "version state rolled back");
        self.current_state = DEFAULT_STATE;
        Ok(())
    }

    async fn create_state(&mut self, parent: StateId) -> Result<StateId> {
        self.check_open()?;
        let mut store = self.store.write()?;
        store.create_state(parent)
    }

    async fn change_version_state(&mut self, state: StateId) -> Result<()> {
        self.check_open()?;
        {
            let store = self.store.read()?;
            if !store.has_state(state) {
                return Err(GeoError::IllegalState(format!(
                    "version state {} is not open",
                    state
                )));
            }
        }
        self.current_state = state;
        Ok(())
    }

    async fn trim_state_tree(&mut self, _parent: StateId, state: StateId) -> Result<()> {
        self.check_open()?;
        let mut store = self.store.write()?;
        store.remove_state(state);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.pending = None;
        self.cursor = None;
        self.closed = true;
        Ok(())
    }
}

/// Session factory over a shared [`VersionedStore`].
#[derive(Clone)]
pub struct MemBackend {
    store: Arc<RwLock<VersionedStore>>,
}

impl Default for MemBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemBackend {
    pub fn new() -> Self {
        Self {
            store: Arc::new(RwLock::new(VersionedStore::new())),
        }
    }

    pub fn store(&self) -> Arc<RwLock<VersionedStore>> {
        Arc::clone(&self.store)
    }
}

#[async_trait]
impl SessionFactory for MemBackend {
    async fn create_session(&self, id: u64) -> Result<Box<dyn Session>> {
        Ok(Box::new(MemSession::new(id, Arc::clone(&self.store))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{AttributeDescriptor, DataType};

    async fn session_with_table() -> Box<dyn Session> {
        let backend = MemBackend::new();
        let mut session = backend.create_session(1).await.unwrap();
        session
            .create_table(FeatureSchema::new(
                "roads",
                "fid",
                vec![
                    AttributeDescriptor::new("fid", DataType::Int).not_null(),
                    AttributeDescriptor::new("name", DataType::Text),
                    AttributeDescriptor::new("shape", DataType::Geometry),
                ],
            ))
            .await
            .unwrap();
        session
    }

    #[tokio::test]
    async fn test_fetch_before_execute_fails() {
        let mut session = session_with_table().await;
        let columns = vec!["roads.fid".to_string(), "roads.name".to_string()];
        let tables = vec!["roads".to_string()];
        session
            .prepare_query(&columns, &tables, None)
            .await
            .unwrap();
        assert!(matches!(
            session.fetch().await,
            Err(GeoError::IllegalState(_))
        ));
    }

    #[tokio::test]
    async fn test_geometry_not_last_rejected() {
        let mut session = session_with_table().await;
        let columns = vec!["roads.shape".to_string(), "roads.name".to_string()];
        let tables = vec!["roads".to_string()];
        assert!(matches!(
            session.prepare_query(&columns, &tables, None).await,
            Err(GeoError::BackendIo(_))
        ));
    }

    #[tokio::test]
    async fn test_fid_constraint_batch_limit() {
        let mut session = session_with_table().await;
        let columns = vec!["roads.fid".to_string()];
        let tables = vec!["roads".to_string()];
        session
            .prepare_query(&columns, &tables, None)
            .await
            .unwrap();

        let oversized: Vec<u64> = (0..=MAX_FID_CONSTRAINT as u64).collect();
        assert!(matches!(
            session.set_fid_constraint(&oversized).await,
            Err(GeoError::BackendIo(_))
        ));

        let allowed: Vec<u64> = (0..MAX_FID_CONSTRAINT as u64).collect();
        assert!(session.set_fid_constraint(&allowed).await.is_ok());
    }

    #[tokio::test]
    async fn test_closed_session_rejects_operations() {
        let mut session = session_with_table().await;
        session.close().await.unwrap();
        assert!(session.is_closed());
        assert!(session.describe("roads").await.is_err());
    }
}
