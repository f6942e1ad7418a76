//! Registered two-table views.
//!
//! A view is registered from a restricted SQL SELECT and thereafter
//! behaves like a read-only feature type: it has a merged schema, can be
//! queried with the same filters as a base table (minus FID filters),
//! and participates in count/extent aggregation. Registration is a
//! client-side affair; the backend only ever sees the substituted
//! two-table query.

mod parse;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::core::{FeatureSchema, GeoError, Result};

/// One projected column of a view, resolved to its base table.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectedColumn {
    pub table: String,
    pub column: String,
    pub alias: Option<String>,
}

impl SelectedColumn {
    /// Name the column is exposed under in the view's schema.
    pub fn output_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.column)
    }

    /// Backend column reference.
    pub fn qualified(&self) -> String {
        format!("{}.{}", self.table, self.column)
    }
}

/// A parsed and validated view definition.
#[derive(Debug, Clone)]
pub struct ViewDefinition {
    pub name: String,
    /// The two base tables, in FROM order.
    pub tables: [String; 2],
    /// Projection in declaration order.
    pub columns: Vec<SelectedColumn>,
    /// The single cross-table join equality, rendered as backend SQL.
    pub join_predicate: String,
    /// Residual WHERE conjuncts baked into every query through the view.
    pub where_clause: Option<String>,
    /// Merged schema exposed to callers.
    pub schema: FeatureSchema,
}

impl ViewDefinition {
    /// Parse a restricted SELECT against the given base-table catalog.
    pub fn parse(
        name: &str,
        sql: &str,
        catalog: &HashMap<String, FeatureSchema>,
    ) -> Result<Self> {
        parse::parse_view(name, sql, catalog)
    }

    /// Resolve an exposed attribute name to its backend column reference.
    pub fn qualify(&self, attribute: &str) -> Result<String> {
        self.columns
            .iter()
            .find(|c| c.output_name() == attribute)
            .map(SelectedColumn::qualified)
            .ok_or_else(|| {
                GeoError::AttributeNotFound(self.name.clone(), attribute.to_string())
            })
    }
}

/// Thread-safe name-to-definition map.
///
/// Registration takes the write lock for the whole check-and-insert so
/// two concurrent registrations of the same name cannot both succeed.
#[derive(Default)]
pub struct ViewRegistry {
    views: RwLock<HashMap<String, Arc<ViewDefinition>>>,
}

impl ViewRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, definition: ViewDefinition) -> Result<()> {
        let mut views = self.views.write()?;
        if views.contains_key(&definition.name) {
            return Err(GeoError::IllegalViewDefinition(format!(
                "view '{}' is already registered",
                definition.name
            )));
        }
        views.insert(definition.name.clone(), Arc::new(definition));
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> Result<bool> {
        Ok(self.views.write()?.remove(name).is_some())
    }

    pub fn get(&self, name: &str) -> Result<Option<Arc<ViewDefinition>>> {
        Ok(self.views.read()?.get(name).cloned())
    }

    pub fn names(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.views.read()?.keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}
