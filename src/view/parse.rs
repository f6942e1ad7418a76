//! Restricted-SQL parsing for view registration.
//!
//! A view definition is a single SELECT joining exactly two base tables
//! through one cross-table equality in the WHERE clause. Everything the
//! backend cannot register is rejected here, before any session is
//! touched: set operations, explicit JOIN syntax, grouping, limits,
//! computed projections, table aliases.

use std::collections::HashMap;

use sqlparser::ast::{
    BinaryOperator, Expr, GroupByExpr, ObjectName, Select, SelectItem,
    SelectItemQualifiedWildcardKind, SetExpr, Statement, TableFactor,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

use crate::core::{AttributeDescriptor, DataType, FeatureSchema, GeoError, Result};

use super::{SelectedColumn, ViewDefinition};

pub(super) fn parse_view(
    name: &str,
    sql: &str,
    catalog: &HashMap<String, FeatureSchema>,
) -> Result<ViewDefinition> {
    let statements = Parser::parse_sql(&PostgreSqlDialect {}, sql)
        .map_err(|e| GeoError::ParseError(e.to_string()))?;
    let [statement] = statements.as_slice() else {
        return Err(illegal("view definition must be a single statement"));
    };
    let Statement::Query(query) = statement else {
        return Err(illegal("view definition must be a SELECT"));
    };

    if query.with.is_some() {
        return Err(illegal("WITH clauses are not supported in views"));
    }
    if query.order_by.is_some() {
        return Err(illegal("ORDER BY is not supported in views"));
    }
    if query.limit_clause.is_some() {
        return Err(illegal("LIMIT/OFFSET is not supported in views"));
    }

    let select = match query.body.as_ref() {
        SetExpr::Select(select) => select,
        SetExpr::SetOperation { .. } => {
            return Err(illegal("set operations are not supported in views"));
        }
        _ => return Err(illegal("view definition must be a plain SELECT")),
    };

    if select.distinct.is_some() {
        return Err(illegal("DISTINCT is not supported in views"));
    }
    match &select.group_by {
        GroupByExpr::Expressions(exprs, _) if exprs.is_empty() => {}
        _ => return Err(illegal("GROUP BY is not supported in views")),
    }
    if select.having.is_some() {
        return Err(illegal("HAVING is not supported in views"));
    }

    let tables = extract_tables(select)?;
    for table in &tables {
        if !catalog.contains_key(table) {
            return Err(GeoError::TypeNotFound(table.clone()));
        }
    }

    let (join_predicate, where_clause) = split_selection(select, &tables)?;
    let mut columns = extract_columns(select, &tables, catalog)?;
    // The merged column list carries the shape column last, like any
    // other projection handed to the backend.
    if let Some(pos) = columns.iter().position(|c| {
        catalog[&c.table]
            .attribute(&c.column)
            .is_some_and(|a| a.data_type == DataType::Geometry)
    }) {
        let geom = columns.remove(pos);
        columns.push(geom);
    }
    let schema = merge_schema(name, &columns, &tables, catalog)?;

    Ok(ViewDefinition {
        name: name.to_string(),
        tables,
        columns,
        join_predicate,
        where_clause,
        schema,
    })
}

fn illegal(msg: &str) -> GeoError {
    GeoError::IllegalViewDefinition(msg.to_string())
}

/// The two base tables, in FROM order. Explicit JOIN syntax and aliases
/// are rejected so the WHERE text can be handed to the backend verbatim.
fn extract_tables(select: &Select) -> Result<[String; 2]> {
    let mut tables = Vec::new();
    for twj in &select.from {
        if !twj.joins.is_empty() {
            return Err(illegal(
                "explicit JOIN syntax is not supported; join through the WHERE clause",
            ));
        }
        match &twj.relation {
            TableFactor::Table { name, alias, .. } => {
                if alias.is_some() {
                    return Err(illegal("table aliases are not supported in views"));
                }
                tables.push(object_name(name)?);
            }
            _ => return Err(illegal("views may only select from base tables")),
        }
    }
    match <[String; 2]>::try_from(tables) {
        Ok(pair) if pair[0] != pair[1] => Ok(pair),
        Ok(_) => Err(illegal("a view must join two distinct tables")),
        Err(_) => Err(illegal("a view must select from exactly two tables")),
    }
}

fn object_name(name: &ObjectName) -> Result<String> {
    let [part] = name.0.as_slice() else {
        return Err(illegal("schema-qualified table names are not supported"));
    };
    Ok(part.to_string())
}

/// Split the WHERE conjuncts into the single required cross-table
/// equality and the residual per-row predicate.
fn split_selection(select: &Select, tables: &[String; 2]) -> Result<(String, Option<String>)> {
    let Some(selection) = &select.selection else {
        return Err(illegal("a view requires a WHERE clause joining its tables"));
    };

    let mut join = None;
    let mut residual = Vec::new();
    for conjunct in flatten_and(selection) {
        if is_cross_table_equality(conjunct, tables) {
            if join.replace(conjunct.to_string()).is_some() {
                return Err(illegal("a view must join through exactly one equality"));
            }
        } else {
            residual.push(format!("({})", conjunct));
        }
    }

    let join = join.ok_or_else(|| illegal("a view requires one cross-table join equality"))?;
    let residual = if residual.is_empty() {
        None
    } else {
        Some(residual.join(" AND "))
    };
    Ok((join, residual))
}

fn flatten_and(expr: &Expr) -> Vec<&Expr> {
    match expr {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            let mut out = flatten_and(left);
            out.extend(flatten_and(right));
            out
        }
        Expr::Nested(inner) => flatten_and(inner),
        other => vec![other],
    }
}

fn is_cross_table_equality(expr: &Expr, tables: &[String; 2]) -> bool {
    let Expr::BinaryOp {
        left,
        op: BinaryOperator::Eq,
        right,
    } = expr
    else {
        return false;
    };
    match (qualified_table(left), qualified_table(right)) {
        (Some(a), Some(b)) => a != b && tables.contains(&a) && tables.contains(&b),
        _ => false,
    }
}

fn qualified_table(expr: &Expr) -> Option<String> {
    match expr {
        Expr::CompoundIdentifier(parts) if parts.len() == 2 => Some(parts[0].value.clone()),
        _ => None,
    }
}

fn extract_columns(
    select: &Select,
    tables: &[String; 2],
    catalog: &HashMap<String, FeatureSchema>,
) -> Result<Vec<SelectedColumn>> {
    let mut columns = Vec::new();
    for item in &select.projection {
        match item {
            SelectItem::UnnamedExpr(expr) => {
                columns.push(column_ref(expr, tables, catalog, None)?);
            }
            SelectItem::ExprWithAlias { expr, alias } => {
                columns.push(column_ref(expr, tables, catalog, Some(alias.value.clone()))?);
            }
            SelectItem::Wildcard(_) => {
                for table in tables {
                    expand_table(table, catalog, &mut columns);
                }
            }
            SelectItem::QualifiedWildcard(kind, _) => {
                let SelectItemQualifiedWildcardKind::ObjectName(name) = kind else {
                    return Err(illegal("unsupported wildcard expression"));
                };
                let table = object_name(name)?;
                if !tables.contains(&table) {
                    return Err(GeoError::TypeNotFound(table));
                }
                expand_table(&table, catalog, &mut columns);
            }
        }
    }
    if columns.is_empty() {
        return Err(illegal("a view must select at least one column"));
    }
    Ok(columns)
}

fn column_ref(
    expr: &Expr,
    tables: &[String; 2],
    catalog: &HashMap<String, FeatureSchema>,
    alias: Option<String>,
) -> Result<SelectedColumn> {
    match expr {
        Expr::Identifier(ident) => {
            // Bare column: it must belong to exactly one of the tables.
            let owners: Vec<&String> = tables
                .iter()
                .filter(|t| catalog[*t].attribute(&ident.value).is_some())
                .collect();
            match owners.as_slice() {
                [table] => Ok(SelectedColumn {
                    table: (*table).clone(),
                    column: ident.value.clone(),
                    alias,
                }),
                [] => Err(GeoError::AttributeNotFound(
                    tables.join(", "),
                    ident.value.clone(),
                )),
                _ => Err(illegal(&format!(
                    "column '{}' is ambiguous; qualify it with its table",
                    ident.value
                ))),
            }
        }
        Expr::CompoundIdentifier(parts) if parts.len() == 2 => {
            let table = parts[0].value.clone();
            let column = parts[1].value.clone();
            if !tables.contains(&table) {
                return Err(GeoError::TypeNotFound(table));
            }
            if catalog[&table].attribute(&column).is_none() {
                return Err(GeoError::AttributeNotFound(table, column));
            }
            Ok(SelectedColumn {
                table,
                column,
                alias,
            })
        }
        _ => Err(illegal(
            "view projections must be plain column references",
        )),
    }
}

fn expand_table(
    table: &str,
    catalog: &HashMap<String, FeatureSchema>,
    columns: &mut Vec<SelectedColumn>,
) {
    for attr in &catalog[table].attributes {
        columns.push(SelectedColumn {
            table: table.to_string(),
            column: attr.name.clone(),
            alias: None,
        });
    }
}

fn merge_schema(
    name: &str,
    columns: &[SelectedColumn],
    tables: &[String; 2],
    catalog: &HashMap<String, FeatureSchema>,
) -> Result<FeatureSchema> {
    let mut attributes = Vec::with_capacity(columns.len());
    let mut geometry_count = 0usize;
    for col in columns {
        let source = catalog[&col.table]
            .attribute(&col.column)
            .ok_or_else(|| GeoError::AttributeNotFound(col.table.clone(), col.column.clone()))?;
        let out_name = col.output_name().to_string();
        if attributes
            .iter()
            .any(|a: &AttributeDescriptor| a.name == out_name)
        {
            return Err(illegal(&format!(
                "duplicate column name '{}' in view; alias one side",
                out_name
            )));
        }
        if source.data_type == DataType::Geometry {
            geometry_count += 1;
        }
        attributes.push(AttributeDescriptor {
            name: out_name,
            data_type: source.data_type,
            nullable: source.nullable,
        });
    }
    if geometry_count > 1 {
        return Err(illegal("a view may expose at most one shape column"));
    }

    // Views are read-only and carry no row identifier of their own; the
    // left table's FID column is recorded for diagnostics only.
    let fid_column = format!("{}.{}", tables[0], catalog[&tables[0]].fid_column);
    Ok(FeatureSchema::new(name, &fid_column, attributes))
}
