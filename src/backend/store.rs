//! Versioned in-memory feature store behind the backend session.
//!
//! Committed rows live at the default state. Each transaction works in a
//! private overlay state created from the baseline: inserts and updates
//! shadow committed rows by FID, deletes mark committed FIDs invisible.
//! Committing a state publishes its overlay into the baseline; trimming
//! discards it.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::core::{DataType, Envelope, FeatureSchema, GeoError, Result, Row, Value};
use crate::session::{DEFAULT_STATE, QueryInfo, StateId};

use super::predicate::Predicate;

/// One stored feature: attribute name to value.
pub type Feature = HashMap<String, Value>;

/// One scan row before projection: qualified column name to value.
pub type CombinedRow = Vec<(String, Value)>;

struct Table {
    schema: FeatureSchema,
    rows: BTreeMap<u64, Feature>,
}

#[derive(Default)]
struct StateOverlay {
    inserts: HashMap<String, BTreeMap<u64, Feature>>,
    deletes: HashMap<String, BTreeSet<u64>>,
}

pub struct VersionedStore {
    tables: HashMap<String, Table>,
    states: HashMap<StateId, StateOverlay>,
    next_state: StateId,
    next_fid: u64,
}

impl Default for VersionedStore {
    fn default() -> Self {
        Self::new()
    }
}

impl VersionedStore {
    pub fn new() -> Self {
        Self {
            tables: HashMap::new(),
            states: HashMap::new(),
            next_state: DEFAULT_STATE + 1,
            next_fid: 1,
        }
    }

    // ------------------------------------------------------------------
    // Catalog
    // ------------------------------------------------------------------

    pub fn create_table(&mut self, schema: FeatureSchema) -> Result<()> {
        let name = schema.type_name.clone();
        if self.tables.contains_key(&name) {
            return Err(GeoError::IllegalState(format!(
                "feature type '{}' already exists",
                name
            )));
        }
        self.tables.insert(
            name,
            Table {
                schema,
                rows: BTreeMap::new(),
            },
        );
        Ok(())
    }

    pub fn schema(&self, table: &str) -> Result<&FeatureSchema> {
        self.tables
            .get(table)
            .map(|t| &t.schema)
            .ok_or_else(|| GeoError::TypeNotFound(table.to_string()))
    }

    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.keys().cloned().collect();
        names.sort();
        names
    }

    // ------------------------------------------------------------------
    // Version states
    // ------------------------------------------------------------------

    pub fn create_state(&mut self, parent: StateId) -> Result<StateId> {
        if parent != DEFAULT_STATE && !self.states.contains_key(&parent) {
            return Err(GeoError::IllegalState(format!(
                "unknown parent state {}",
                parent
            )));
        }
        let id = self.next_state;
        self.next_state += 1;
        self.states.insert(id, StateOverlay::default());
        Ok(id)
    }

    /// Publish the overlay into the committed baseline and drop the state.
    pub fn commit_state(&mut self, state: StateId) -> Result<()> {
        let overlay = self.states.remove(&state).ok_or_else(|| {
            GeoError::IllegalState(format!("version state {} is not open", state))
        })?;

        for (table, fids) in overlay.deletes {
            if let Some(t) = self.tables.get_mut(&table) {
                for fid in fids {
                    t.rows.remove(&fid);
                }
            }
        }
        for (table, rows) in overlay.inserts {
            if let Some(t) = self.tables.get_mut(&table) {
                t.rows.extend(rows);
            }
        }
        Ok(())
    }

    /// Discard an overlay state. Idempotent: trimming a state that was
    /// already removed is not an error.
    pub fn remove_state(&mut self, state: StateId) -> bool {
        self.states.remove(&state).is_some()
    }

    pub fn has_state(&self, state: StateId) -> bool {
        state == DEFAULT_STATE || self.states.contains_key(&state)
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    pub fn insert(
        &mut self,
        table: &str,
        state: StateId,
        values: &[(String, Value)],
    ) -> Result<u64> {
        let schema = self.schema(table)?.clone();
        for (name, value) in values {
            let attr = schema
                .attribute(name)
                .ok_or_else(|| GeoError::AttributeNotFound(table.to_string(), name.clone()))?;
            check_type(attr.data_type, value)?;
        }

        let fid = self.next_fid;
        self.next_fid += 1;

        let mut feature: Feature = schema
            .attributes
            .iter()
            .map(|a| (a.name.clone(), Value::Null))
            .collect();
        for (name, value) in values {
            feature.insert(name.clone(), value.clone());
        }
        feature.insert(schema.fid_column.clone(), Value::Int(fid as i64));

        if state == DEFAULT_STATE {
            self.table_mut(table)?.rows.insert(fid, feature);
        } else {
            self.overlay_mut(state)?
                .inserts
                .entry(table.to_string())
                .or_default()
                .insert(fid, feature);
        }
        Ok(fid)
    }

    pub fn update(
        &mut self,
        table: &str,
        state: StateId,
        predicate: Option<&Predicate>,
        assignments: &[(String, Value)],
    ) -> Result<usize> {
        let schema = self.schema(table)?.clone();
        for (name, value) in assignments {
            let attr = schema
                .attribute(name)
                .ok_or_else(|| GeoError::AttributeNotFound(table.to_string(), name.clone()))?;
            check_type(attr.data_type, value)?;
        }

        let matched = self.matching_fids(table, state, predicate)?;
        for (fid, mut feature) in matched.clone() {
            for (name, value) in assignments {
                feature.insert(name.clone(), value.clone());
            }
            if state == DEFAULT_STATE {
                self.table_mut(table)?.rows.insert(fid, feature);
            } else {
                // Shadow the committed row with the updated copy.
                self.overlay_mut(state)?
                    .inserts
                    .entry(table.to_string())
                    .or_default()
                    .insert(fid, feature);
            }
        }
        Ok(matched.len())
    }

    pub fn delete(
        &mut self,
        table: &str,
        state: StateId,
        predicate: Option<&Predicate>,
    ) -> Result<usize> {
        let matched = self.matching_fids(table, state, predicate)?;
        for (fid, _) in &matched {
            if state == DEFAULT_STATE {
                self.table_mut(table)?.rows.remove(fid);
            } else {
                let overlay = self.overlay_mut(state)?;
                if let Some(rows) = overlay.inserts.get_mut(table) {
                    rows.remove(fid);
                }
                overlay
                    .deletes
                    .entry(table.to_string())
                    .or_default()
                    .insert(*fid);
            }
        }
        Ok(matched.len())
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Rows visible at the given state: committed minus overlay deletes,
    /// with overlay inserts shadowing committed rows by FID.
    fn visible_rows(&self, table: &str, state: StateId) -> Result<BTreeMap<u64, Feature>> {
        let t = self
            .tables
            .get(table)
            .ok_or_else(|| GeoError::TypeNotFound(table.to_string()))?;

        let mut rows = t.rows.clone();
        if state != DEFAULT_STATE {
            let overlay = self.states.get(&state).ok_or_else(|| {
                GeoError::IllegalState(format!("version state {} is not open", state))
            })?;
            if let Some(deletes) = overlay.deletes.get(table) {
                for fid in deletes {
                    rows.remove(fid);
                }
            }
            if let Some(inserts) = overlay.inserts.get(table) {
                for (fid, feature) in inserts {
                    rows.insert(*fid, feature.clone());
                }
            }
        }
        Ok(rows)
    }

    fn matching_fids(
        &self,
        table: &str,
        state: StateId,
        predicate: Option<&Predicate>,
    ) -> Result<Vec<(u64, Feature)>> {
        let rows = self.visible_rows(table, state)?;
        let mut matched = Vec::new();
        for (fid, feature) in rows {
            let keep = match predicate {
                Some(p) => {
                    let resolve = single_table_resolver(table, &feature);
                    p.matches(&resolve)?
                }
                None => true,
            };
            if keep {
                matched.push((fid, feature));
            }
        }
        Ok(matched)
    }

    /// Combined rows matching the query info: join, WHERE, spatial and
    /// FID constraints applied, projection not yet.
    pub fn query_rows(&self, info: &QueryInfo, state: StateId) -> Result<Vec<CombinedRow>> {
        let predicate = info
            .where_clause
            .as_deref()
            .map(Predicate::parse)
            .transpose()?;

        let mut combined: Vec<CombinedRow> = match info.tables.len() {
            1 => {
                let table = &info.tables[0];
                let schema = self.schema(table)?.clone();
                let rows = self.visible_rows(table, state)?;
                rows.into_iter()
                    .filter(|(fid, _)| match &info.fids {
                        Some(fids) => fids.binary_search(fid).is_ok(),
                        None => true,
                    })
                    .map(|(_, feature)| qualify_feature(table, &schema, feature))
                    .collect()
            }
            2 => {
                if info.fids.is_some() {
                    return Err(GeoError::BackendIo(
                        "FID constraints are not supported on joined tables".into(),
                    ));
                }
                let (ta, tb) = (&info.tables[0], &info.tables[1]);
                let sa = self.schema(ta)?.clone();
                let sb = self.schema(tb)?.clone();
                let ra = self.visible_rows(ta, state)?;
                let rb = self.visible_rows(tb, state)?;
                let mut out = Vec::new();
                for fa in ra.values() {
                    for fb in rb.values() {
                        let mut row = qualify_feature(ta, &sa, fa.clone());
                        row.extend(qualify_feature(tb, &sb, fb.clone()));
                        out.push(row);
                    }
                }
                out
            }
            n => {
                return Err(GeoError::BackendIo(format!(
                    "backend supports one or two tables per query, got {}",
                    n
                )));
            }
        };

        if let Some(p) = &predicate {
            let mut kept = Vec::with_capacity(combined.len());
            for row in combined {
                let keep = {
                    let resolve = combined_resolver(&row);
                    p.matches(&resolve)?
                };
                if keep {
                    kept.push(row);
                }
            }
            combined = kept;
        }

        for constraint in &info.spatial {
            combined.retain(|row| {
                row.iter()
                    .find(|(name, _)| name == &constraint.column)
                    .and_then(|(_, value)| value.as_geometry())
                    .map(|shape| shape.envelope().intersects(&constraint.envelope))
                    .unwrap_or(false)
            });
        }

        Ok(combined)
    }

    pub fn scan(&self, info: &QueryInfo, state: StateId) -> Result<Vec<Row>> {
        let rows = self.query_rows(info, state)?;
        rows.into_iter()
            .map(|row| {
                info.columns
                    .iter()
                    .map(|column| {
                        row.iter()
                            .find(|(name, _)| name == column)
                            .map(|(_, value)| value.clone())
                            .ok_or_else(|| {
                                GeoError::BackendIo(format!("unknown column '{}'", column))
                            })
                    })
                    .collect::<Result<Row>>()
            })
            .collect()
    }

    pub fn count(&self, info: &QueryInfo, state: StateId) -> Result<u64> {
        Ok(self.query_rows(info, state)?.len() as u64)
    }

    pub fn extent(&self, info: &QueryInfo, state: StateId) -> Result<Envelope> {
        let column = info.geometry_column.as_deref().ok_or_else(|| {
            GeoError::BackendIo("extent aggregate requires a geometry column".into())
        })?;
        let mut extent = Envelope::empty();
        for row in self.query_rows(info, state)? {
            if let Some(shape) = row
                .iter()
                .find(|(name, _)| name == column)
                .and_then(|(_, value)| value.as_geometry())
            {
                extent.expand_to_include(shape.envelope());
            }
        }
        Ok(extent)
    }

    // ------------------------------------------------------------------

    fn table_mut(&mut self, table: &str) -> Result<&mut Table> {
        self.tables
            .get_mut(table)
            .ok_or_else(|| GeoError::TypeNotFound(table.to_string()))
    }

    fn overlay_mut(&mut self, state: StateId) -> Result<&mut StateOverlay> {
        self.states
            .get_mut(&state)
            .ok_or_else(|| GeoError::IllegalState(format!("version state {} is not open", state)))
    }
}

fn qualify_feature(table: &str, schema: &FeatureSchema, feature: Feature) -> CombinedRow {
    let mut row = Vec::with_capacity(schema.attributes.len());
    for attr in &schema.attributes {
        let value = feature.get(&attr.name).cloned().unwrap_or(Value::Null);
        row.push((format!("{}.{}", table, attr.name), value));
    }
    row
}

fn single_table_resolver<'a>(
    table: &'a str,
    feature: &'a Feature,
) -> impl Fn(&str) -> Option<Value> + 'a {
    move |name: &str| {
        let bare = name.strip_prefix(&format!("{}.", table)).unwrap_or(name);
        feature.get(bare).cloned()
    }
}

fn combined_resolver<'a>(row: &'a CombinedRow) -> impl Fn(&str) -> Option<Value> + 'a {
    move |name: &str| {
        if name.contains('.') {
            row.iter()
                .find(|(n, _)| n == name)
                .map(|(_, v)| v.clone())
        } else {
            row.iter()
                .find(|(n, _)| n.ends_with(&format!(".{}", name)))
                .map(|(_, v)| v.clone())
        }
    }
}

fn check_type(expected: DataType, value: &Value) -> Result<()> {
    match value.data_type() {
        None => Ok(()), // NULL fits any column
        Some(actual) if actual == expected => Ok(()),
        // Numeric widening, same as comparison coercion
        Some(DataType::Int) if expected == DataType::Float => Ok(()),
        Some(actual) => Err(GeoError::TypeMismatch(format!(
            "expected {:?}, got {:?}",
            expected, actual
        ))),
    }
}
