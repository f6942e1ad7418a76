//! Query translation: a generic [`Query`] becomes a backend-native
//! [`QueryPlan`].
//!
//! Translation is where every backend requirement is satisfied up
//! front: the filter is split into its three conjunctive channels, the
//! projection is qualified and reordered so the shape column comes
//! last, the FID column is forced into base-table projections, and view
//! queries are substituted with their two-table form. The executor then
//! only sequences session calls.

use crate::core::{AttributeDescriptor, FeatureSchema, GeoError, Result};
use crate::filter;
use crate::session::{QueryInfo, SpatialConstraint, StateId};
use crate::view::ViewDefinition;

use super::Query;

/// Upper bound on FIDs per backend query. Larger FID constraints are
/// split into successive batches by the executor.
pub const FID_BATCH_LIMIT: usize = 1000;

/// A fully translated, backend-ready query.
///
/// Invariant: when `geometry_column` is present it is the last entry of
/// `columns`, and `schema` lists attributes in the same order the
/// backend will return them.
#[derive(Debug, Clone)]
pub struct QueryPlan {
    pub type_name: String,
    /// Base tables the backend joins; one for a table, two for a view.
    pub tables: Vec<String>,
    /// Qualified projection in backend order.
    pub columns: Vec<String>,
    pub where_clause: Option<String>,
    pub spatial: Vec<SpatialConstraint>,
    /// Sorted, deduplicated FID constraint. Never set for views.
    pub fids: Option<Vec<u64>>,
    /// Qualified geometry column, when projected.
    pub geometry_column: Option<String>,
    /// Result schema in projection order.
    pub schema: FeatureSchema,
    pub state: StateId,
}

impl QueryPlan {
    /// FID constraint batches, each within the backend limit.
    pub fn fid_batches(&self) -> Option<std::slice::Chunks<'_, u64>> {
        self.fids.as_deref().map(|fids| fids.chunks(FID_BATCH_LIMIT))
    }

    /// The backend-native description of this plan, restricted to one
    /// FID batch. Used both per-batch by the executor and whole by the
    /// aggregate calls (which loop batches themselves).
    pub fn query_info(&self, batch: Option<&[u64]>) -> QueryInfo {
        QueryInfo {
            columns: self.columns.clone(),
            tables: self.tables.clone(),
            where_clause: self.where_clause.clone(),
            spatial: self.spatial.clone(),
            fids: batch.map(<[u64]>::to_vec),
            geometry_column: self.geometry_column.clone(),
        }
    }

    /// Projection invariant check, run at construction.
    fn check_geometry_last(&self) -> Result<()> {
        if let Some(geom) = &self.geometry_column {
            if self.columns.last().map(String::as_str) != Some(geom.as_str()) {
                return Err(GeoError::IllegalState(format!(
                    "shape column '{}' is not the last projected column",
                    geom
                )));
            }
        }
        Ok(())
    }
}

/// Translate a query against a base table.
pub fn translate(query: &Query, schema: &FeatureSchema, state: StateId) -> Result<QueryPlan> {
    let split = filter::split(&query.filter)?;
    let table = &schema.type_name;
    let qualify = |attribute: &str| -> Result<String> {
        if schema.attribute(attribute).is_none() {
            return Err(GeoError::AttributeNotFound(
                table.clone(),
                attribute.to_string(),
            ));
        }
        Ok(format!("{}.{}", table, attribute))
    };

    let mut names = projection_names(query, schema)?;
    // The FID column always travels with base-table results so every
    // fetched feature can be addressed again.
    if !names.iter().any(|n| n == &schema.fid_column) {
        names.push(schema.fid_column.clone());
    }
    let names = geometry_last(names, schema);

    let where_clause = match &split.attribute {
        Some(attr) => Some(filter::encode(attr, &qualify)?),
        None => None,
    };
    let spatial = spatial_constraints(&split.spatial, schema, &qualify)?;
    let geometry_column = names
        .iter()
        .find(|n| schema.is_geometry(n))
        .map(|n| format!("{}.{}", table, n));

    let plan = QueryPlan {
        type_name: schema.type_name.clone(),
        tables: vec![table.clone()],
        columns: names.iter().map(|n| format!("{}.{}", table, n)).collect(),
        where_clause,
        spatial,
        fids: split.fids,
        geometry_column,
        schema: result_schema(schema, &names)?,
        state,
    };
    plan.check_geometry_last()?;
    Ok(plan)
}

/// Translate a query against a registered view by substituting its
/// two-table definition.
pub fn translate_view(query: &Query, view: &ViewDefinition, state: StateId) -> Result<QueryPlan> {
    let split = filter::split(&query.filter)?;
    if split.fids.is_some() {
        return Err(GeoError::UnsupportedQueryShape(format!(
            "FID filters cannot target view '{}'; views carry no row identifier",
            view.name
        )));
    }

    let schema = &view.schema;
    let names = geometry_last(projection_names(query, schema)?, schema);

    // The view's join predicate and residual WHERE always apply; the
    // caller's attribute filter is resolved through the view's columns
    // and AND-ed on.
    let mut conjuncts = vec![format!("({})", view.join_predicate)];
    if let Some(residual) = &view.where_clause {
        conjuncts.push(format!("({})", residual));
    }
    if let Some(attr) = &split.attribute {
        let qualify = |attribute: &str| view.qualify(attribute);
        conjuncts.push(format!("({})", filter::encode(attr, &qualify)?));
    }

    let qualify = |attribute: &str| view.qualify(attribute);
    let spatial = spatial_constraints(&split.spatial, schema, &qualify)?;
    let geometry_column = match names.iter().find(|n| schema.is_geometry(n)) {
        Some(name) => Some(view.qualify(name)?),
        None => None,
    };

    let columns = names
        .iter()
        .map(|n| view.qualify(n))
        .collect::<Result<Vec<_>>>()?;

    let plan = QueryPlan {
        type_name: view.name.clone(),
        tables: view.tables.to_vec(),
        columns,
        where_clause: Some(conjuncts.join(" AND ")),
        spatial,
        fids: None,
        geometry_column,
        schema: result_schema(schema, &names)?,
        state,
    };
    plan.check_geometry_last()?;
    Ok(plan)
}

/// The requested projection in caller order, validated against the
/// schema. Empty projections mean every attribute.
fn projection_names(query: &Query, schema: &FeatureSchema) -> Result<Vec<String>> {
    if query.columns.is_empty() {
        return Ok(schema.attributes.iter().map(|a| a.name.clone()).collect());
    }
    let mut names = Vec::with_capacity(query.columns.len());
    for name in &query.columns {
        if schema.attribute(name).is_none() {
            return Err(GeoError::AttributeNotFound(
                schema.type_name.clone(),
                name.clone(),
            ));
        }
        if names.contains(name) {
            return Err(GeoError::UnsupportedQueryShape(format!(
                "attribute '{}' requested twice",
                name
            )));
        }
        names.push(name.clone());
    }
    Ok(names)
}

/// Relocate the geometry column to the end of the projection, keeping
/// every other attribute in caller order.
fn geometry_last(mut names: Vec<String>, schema: &FeatureSchema) -> Vec<String> {
    if let Some(pos) = names.iter().position(|n| schema.is_geometry(n)) {
        let geom = names.remove(pos);
        names.push(geom);
    }
    names
}

fn spatial_constraints(
    envelopes: &[crate::core::Envelope],
    schema: &FeatureSchema,
    qualify: &dyn Fn(&str) -> Result<String>,
) -> Result<Vec<SpatialConstraint>> {
    if envelopes.is_empty() {
        return Ok(Vec::new());
    }
    let geometry = schema.geometry_column.as_deref().ok_or_else(|| {
        GeoError::UnsupportedQueryShape(format!(
            "spatial filter against '{}', which has no shape column",
            schema.type_name
        ))
    })?;
    let column = qualify(geometry)?;
    Ok(envelopes
        .iter()
        .map(|envelope| SpatialConstraint {
            column: column.clone(),
            envelope: *envelope,
        })
        .collect())
}

fn result_schema(schema: &FeatureSchema, names: &[String]) -> Result<FeatureSchema> {
    let attributes = names
        .iter()
        .map(|name| {
            schema
                .attribute(name)
                .cloned()
                .ok_or_else(|| {
                    GeoError::AttributeNotFound(schema.type_name.clone(), name.clone())
                })
        })
        .collect::<Result<Vec<AttributeDescriptor>>>()?;
    Ok(FeatureSchema::new(
        &schema.type_name,
        &schema.fid_column,
        attributes,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{DataType, Value};
    use crate::filter::Filter;
    use crate::session::DEFAULT_STATE;

    fn roads() -> FeatureSchema {
        FeatureSchema::new(
            "roads",
            "fid",
            vec![
                AttributeDescriptor::new("fid", DataType::Int).not_null(),
                AttributeDescriptor::new("name", DataType::Text),
                AttributeDescriptor::new("shape", DataType::Geometry),
                AttributeDescriptor::new("lanes", DataType::Int),
            ],
        )
    }

    #[test]
    fn test_projection_keeps_caller_order_geometry_last() {
        let query = Query::new("roads").columns(["lanes", "shape", "name"]);
        let plan = translate(&query, &roads(), DEFAULT_STATE).unwrap();
        assert_eq!(
            plan.columns,
            vec!["roads.lanes", "roads.name", "roads.fid", "roads.shape"]
        );
        assert_eq!(plan.geometry_column.as_deref(), Some("roads.shape"));
        assert_eq!(
            plan.schema.attribute_names(),
            vec!["lanes", "name", "fid", "shape"]
        );
    }

    #[test]
    fn test_fid_column_forced_into_projection() {
        let query = Query::new("roads").columns(["name"]);
        let plan = translate(&query, &roads(), DEFAULT_STATE).unwrap();
        assert_eq!(plan.columns, vec!["roads.name", "roads.fid"]);
        assert!(plan.geometry_column.is_none());
    }

    #[test]
    fn test_filter_channels_land_in_plan() {
        let query = Query::new("roads").filter(
            Filter::eq("name", Value::Text("main".into()))
                .and(Filter::bbox(0.0, 0.0, 5.0, 5.0))
                .and(Filter::fids([7, 3, 3])),
        );
        let plan = translate(&query, &roads(), DEFAULT_STATE).unwrap();
        assert_eq!(plan.where_clause.as_deref(), Some("roads.name = 'main'"));
        assert_eq!(plan.spatial.len(), 1);
        assert_eq!(plan.spatial[0].column, "roads.shape");
        assert_eq!(plan.fids, Some(vec![3, 7]));
    }

    #[test]
    fn test_fid_batches_chunk_at_limit() {
        let fids: Vec<u64> = (0..2500).collect();
        let query = Query::new("roads").filter(Filter::fids(fids));
        let plan = translate(&query, &roads(), DEFAULT_STATE).unwrap();
        let batches: Vec<usize> = plan.fid_batches().unwrap().map(<[u64]>::len).collect();
        assert_eq!(batches, vec![1000, 1000, 500]);
    }

    #[test]
    fn test_unknown_attribute_rejected() {
        let query = Query::new("roads").columns(["nope"]);
        assert!(matches!(
            translate(&query, &roads(), DEFAULT_STATE),
            Err(GeoError::AttributeNotFound(_, _))
        ));
    }

    #[test]
    fn test_spatial_filter_without_geometry_rejected() {
        let schema = FeatureSchema::new(
            "notes",
            "fid",
            vec![
                AttributeDescriptor::new("fid", DataType::Int).not_null(),
                AttributeDescriptor::new("body", DataType::Text),
            ],
        );
        let query = Query::new("notes").filter(Filter::bbox(0.0, 0.0, 1.0, 1.0));
        assert!(matches!(
            translate(&query, &schema, DEFAULT_STATE),
            Err(GeoError::UnsupportedQueryShape(_))
        ));
    }

    #[test]
    fn test_view_translation_substitutes_definition() {
        use std::collections::HashMap;

        let surfaces = FeatureSchema::new(
            "surfaces",
            "id",
            vec![
                AttributeDescriptor::new("id", DataType::Int).not_null(),
                AttributeDescriptor::new("material", DataType::Text),
            ],
        );
        let mut roads = roads();
        roads
            .attributes
            .push(AttributeDescriptor::new("surface_id", DataType::Int));
        let catalog: HashMap<String, FeatureSchema> =
            HashMap::from([("roads".into(), roads), ("surfaces".into(), surfaces)]);

        let view = ViewDefinition::parse(
            "paved",
            "SELECT roads.name, surfaces.material, roads.shape FROM roads, surfaces \
             WHERE roads.surface_id = surfaces.id",
            &catalog,
        )
        .unwrap();

        let query = Query::new("paved")
            .filter(Filter::eq("material", Value::Text("asphalt".into())));
        let plan = translate_view(&query, &view, DEFAULT_STATE).unwrap();

        assert_eq!(plan.tables, vec!["roads", "surfaces"]);
        assert_eq!(
            plan.columns,
            vec!["roads.name", "surfaces.material", "roads.shape"]
        );
        assert_eq!(
            plan.where_clause.as_deref(),
            Some("(roads.surface_id = surfaces.id) AND (surfaces.material = 'asphalt')")
        );
        assert_eq!(plan.geometry_column.as_deref(), Some("roads.shape"));
    }

    #[test]
    fn test_view_fid_filter_rejected() {
        use std::collections::HashMap;

        let surfaces = FeatureSchema::new(
            "surfaces",
            "id",
            vec![
                AttributeDescriptor::new("id", DataType::Int).not_null(),
                AttributeDescriptor::new("material", DataType::Text),
            ],
        );
        let mut roads = roads();
        roads
            .attributes
            .push(AttributeDescriptor::new("surface_id", DataType::Int));
        let catalog: HashMap<String, FeatureSchema> =
            HashMap::from([("roads".into(), roads), ("surfaces".into(), surfaces)]);
        let view = ViewDefinition::parse(
            "paved",
            "SELECT roads.name FROM roads, surfaces WHERE roads.surface_id = surfaces.id",
            &catalog,
        )
        .unwrap();

        let query = Query::new("paved").filter(Filter::fids([1, 2]));
        assert!(matches!(
            translate_view(&query, &view, DEFAULT_STATE),
            Err(GeoError::UnsupportedQueryShape(_))
        ));
    }
}
