//! WHERE-clause evaluation for the in-memory backend.
//!
//! The backend receives the clause as SQL text, exactly like the real
//! one would. It is parsed once per scan and evaluated against each
//! combined row.

use std::cmp::Ordering;

use regex::Regex;
use sqlparser::ast as sql_ast;
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

use crate::core::{GeoError, Result, Value};

pub struct Predicate {
    expr: sql_ast::Expr,
}

impl Predicate {
    pub fn parse(clause: &str) -> Result<Self> {
        let sql = format!("SELECT * FROM _t WHERE {}", clause);
        let mut statements = Parser::parse_sql(&PostgreSqlDialect {}, &sql)
            .map_err(|e| GeoError::BackendIo(format!("invalid WHERE clause: {}", e)))?;
        if statements.len() != 1 {
            return Err(GeoError::BackendIo("invalid WHERE clause".into()));
        }
        let sql_ast::Statement::Query(query) = statements.remove(0) else {
            return Err(GeoError::BackendIo("invalid WHERE clause".into()));
        };
        let sql_ast::SetExpr::Select(select) = *query.body else {
            return Err(GeoError::BackendIo("invalid WHERE clause".into()));
        };
        let expr = select
            .selection
            .ok_or_else(|| GeoError::BackendIo("empty WHERE clause".into()))?;
        Ok(Self { expr })
    }

    /// Evaluate against one row. `resolve` maps a column reference
    /// (qualified or bare) to its value.
    pub fn matches(&self, resolve: &dyn Fn(&str) -> Option<Value>) -> Result<bool> {
        match eval(&self.expr, resolve)? {
            Value::Bool(b) => Ok(b),
            Value::Null => Ok(false),
            other => Err(GeoError::BackendIo(format!(
                "WHERE clause evaluated to non-boolean {}",
                other.type_name()
            ))),
        }
    }
}

fn eval(expr: &sql_ast::Expr, resolve: &dyn Fn(&str) -> Option<Value>) -> Result<Value> {
    match expr {
        sql_ast::Expr::Identifier(ident) => lookup(&ident.value, resolve),
        sql_ast::Expr::CompoundIdentifier(idents) => {
            let name = idents
                .iter()
                .map(|i| i.value.clone())
                .collect::<Vec<_>>()
                .join(".");
            lookup(&name, resolve)
        }
        sql_ast::Expr::Value(val) => literal(&val.value),
        sql_ast::Expr::Nested(inner) => eval(inner, resolve),
        sql_ast::Expr::IsNull(inner) => Ok(Value::Bool(eval(inner, resolve)?.is_null())),
        sql_ast::Expr::IsNotNull(inner) => Ok(Value::Bool(!eval(inner, resolve)?.is_null())),
        sql_ast::Expr::UnaryOp {
            op: sql_ast::UnaryOperator::Not,
            expr: inner,
        } => match eval(inner, resolve)? {
            Value::Bool(b) => Ok(Value::Bool(!b)),
            Value::Null => Ok(Value::Null),
            other => Err(GeoError::BackendIo(format!(
                "NOT applied to {}",
                other.type_name()
            ))),
        },
        sql_ast::Expr::UnaryOp {
            op: sql_ast::UnaryOperator::Minus,
            expr: inner,
        } => match eval(inner, resolve)? {
            Value::Int(i) => Ok(Value::Int(-i)),
            Value::Float(f) => Ok(Value::Float(-f)),
            other => Err(GeoError::BackendIo(format!(
                "unary minus applied to {}",
                other.type_name()
            ))),
        },
        sql_ast::Expr::BinaryOp { left, op, right } => {
            eval_binary(left, op, right, resolve)
        }
        sql_ast::Expr::Like {
            negated,
            expr: inner,
            pattern,
            ..
        } => {
            let text = eval(inner, resolve)?;
            let pattern = eval(pattern, resolve)?;
            match (text, pattern) {
                (Value::Null, _) | (_, Value::Null) => Ok(Value::Bool(false)),
                (Value::Text(t), Value::Text(p)) => {
                    let hit = like_match(&t, &p)?;
                    Ok(Value::Bool(if *negated { !hit } else { hit }))
                }
                (t, p) => Err(GeoError::BackendIo(format!(
                    "LIKE requires text operands, got {} and {}",
                    t.type_name(),
                    p.type_name()
                ))),
            }
        }
        other => Err(GeoError::BackendIo(format!(
            "unsupported WHERE expression: {}",
            other
        ))),
    }
}

fn eval_binary(
    left: &sql_ast::Expr,
    op: &sql_ast::BinaryOperator,
    right: &sql_ast::Expr,
    resolve: &dyn Fn(&str) -> Option<Value>,
) -> Result<Value> {
    use sql_ast::BinaryOperator as Op;

    match op {
        Op::And => {
            let l = eval(left, resolve)?;
            if matches!(l, Value::Bool(false)) {
                return Ok(Value::Bool(false));
            }
            let r = eval(right, resolve)?;
            match (l, r) {
                (Value::Bool(a), Value::Bool(b)) => Ok(Value::Bool(a && b)),
                (Value::Null, _) | (_, Value::Null) => Ok(Value::Null),
                _ => Err(GeoError::BackendIo("AND requires boolean operands".into())),
            }
        }
        Op::Or => {
            let l = eval(left, resolve)?;
            if matches!(l, Value::Bool(true)) {
                return Ok(Value::Bool(true));
            }
            let r = eval(right, resolve)?;
            match (l, r) {
                (Value::Bool(a), Value::Bool(b)) => Ok(Value::Bool(a || b)),
                (Value::Null, _) | (_, Value::Null) => Ok(Value::Null),
                _ => Err(GeoError::BackendIo("OR requires boolean operands".into())),
            }
        }
        Op::Eq | Op::NotEq | Op::Lt | Op::LtEq | Op::Gt | Op::GtEq => {
            let l = eval(left, resolve)?;
            let r = eval(right, resolve)?;
            // SQL semantics: comparison with NULL is not a match
            if l.is_null() || r.is_null() {
                return Ok(Value::Bool(false));
            }
            let ordering = l
                .compare(&r)
                .map_err(|e| GeoError::BackendIo(e.to_string()))?;
            let hit = match op {
                Op::Eq => ordering == Ordering::Equal,
                Op::NotEq => ordering != Ordering::Equal,
                Op::Lt => ordering == Ordering::Less,
                Op::LtEq => ordering != Ordering::Greater,
                Op::Gt => ordering == Ordering::Greater,
                Op::GtEq => ordering != Ordering::Less,
                _ => unreachable!(),
            };
            Ok(Value::Bool(hit))
        }
        other => Err(GeoError::BackendIo(format!(
            "unsupported operator in WHERE clause: {:?}",
            other
        ))),
    }
}

fn lookup(name: &str, resolve: &dyn Fn(&str) -> Option<Value>) -> Result<Value> {
    resolve(name).ok_or_else(|| GeoError::BackendIo(format!("unknown column '{}'", name)))
}

fn literal(val: &sql_ast::Value) -> Result<Value> {
    match val {
        sql_ast::Value::Number(n, _) => {
            if let Ok(i) = n.parse::<i64>() {
                Ok(Value::Int(i))
            } else if let Ok(f) = n.parse::<f64>() {
                Ok(Value::Float(f))
            } else {
                Err(GeoError::BackendIo(format!("invalid number: {}", n)))
            }
        }
        sql_ast::Value::SingleQuotedString(s) | sql_ast::Value::DoubleQuotedString(s) => {
            Ok(Value::Text(s.clone()))
        }
        sql_ast::Value::Boolean(b) => Ok(Value::Bool(*b)),
        sql_ast::Value::Null => Ok(Value::Null),
        other => Err(GeoError::BackendIo(format!(
            "unsupported literal: {:?}",
            other
        ))),
    }
}

/// SQL LIKE with `%` and `_` wildcards, escaped with `\`.
fn like_match(text: &str, pattern: &str) -> Result<bool> {
    // Fast path: no wildcards means plain equality
    if !pattern.contains('%') && !pattern.contains('_') && !pattern.contains('\\') {
        return Ok(text == pattern);
    }

    let mut regex = String::with_capacity(pattern.len() + 2);
    regex.push('^');
    let chars: Vec<char> = pattern.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '%' => regex.push_str(".*"),
            '_' => regex.push('.'),
            '\\' if i + 1 < chars.len() => {
                i += 1;
                regex.push_str(&regex::escape(&chars[i].to_string()));
            }
            c => regex.push_str(&regex::escape(&c.to_string())),
        }
        i += 1;
    }
    regex.push('$');

    let compiled = Regex::new(&regex)
        .map_err(|e| GeoError::BackendIo(format!("invalid LIKE pattern: {}", e)))?;
    Ok(compiled.is_match(text))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: Vec<(&'static str, Value)>) -> impl Fn(&str) -> Option<Value> {
        move |name: &str| {
            pairs.iter().find_map(|(n, v)| {
                if *n == name || n.ends_with(&format!(".{}", name)) {
                    Some(v.clone())
                } else {
                    None
                }
            })
        }
    }

    #[test]
    fn test_comparison() {
        let p = Predicate::parse("roads.lanes >= 2").unwrap();
        let resolve = row(vec![("roads.lanes", Value::Int(4))]);
        assert!(p.matches(&resolve).unwrap());

        let resolve = row(vec![("roads.lanes", Value::Int(1))]);
        assert!(!p.matches(&resolve).unwrap());
    }

    #[test]
    fn test_and_or_not() {
        let p = Predicate::parse("(lanes = 2) AND (NOT (name = 'spur'))").unwrap();
        let resolve = row(vec![
            ("roads.lanes", Value::Int(2)),
            ("roads.name", Value::Text("main".into())),
        ]);
        assert!(p.matches(&resolve).unwrap());

        let p = Predicate::parse("lanes = 9 OR name = 'main'").unwrap();
        assert!(p.matches(&resolve).unwrap());
    }

    #[test]
    fn test_null_comparison_is_no_match() {
        let p = Predicate::parse("name = 'main'").unwrap();
        let resolve = row(vec![("roads.name", Value::Null)]);
        assert!(!p.matches(&resolve).unwrap());

        let p = Predicate::parse("name IS NULL").unwrap();
        assert!(p.matches(&resolve).unwrap());
    }

    #[test]
    fn test_like() {
        let p = Predicate::parse("name LIKE 'main%'").unwrap();
        let resolve = row(vec![("roads.name", Value::Text("main street".into()))]);
        assert!(p.matches(&resolve).unwrap());

        let p = Predicate::parse("name LIKE '%avenue'").unwrap();
        assert!(!p.matches(&resolve).unwrap());
    }

    #[test]
    fn test_unknown_column_errors() {
        let p = Predicate::parse("bogus = 1").unwrap();
        let resolve = row(vec![("roads.lanes", Value::Int(1))]);
        assert!(p.matches(&resolve).is_err());
    }
}
