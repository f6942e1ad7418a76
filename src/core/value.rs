use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::geom::Shape;
use crate::core::types::DataType;
use crate::core::{GeoError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
    Bool(bool),
    Timestamp(DateTime<Utc>),
    Geometry(Shape),
}

impl Value {
    pub fn compare(&self, other: &Value) -> Result<Ordering> {
        match (self, other) {
            // NULL sorts last
            (Value::Null, Value::Null) => Ok(Ordering::Equal),
            (Value::Null, _) => Ok(Ordering::Greater),
            (_, Value::Null) => Ok(Ordering::Less),

            (Value::Int(a), Value::Int(b)) => Ok(a.cmp(b)),

            (Value::Float(a), Value::Float(b)) => Ok(cmp_f64(*a, *b)),

            (Value::Text(a), Value::Text(b)) => Ok(a.cmp(b)),

            (Value::Bool(a), Value::Bool(b)) => Ok(a.cmp(b)),

            (Value::Timestamp(a), Value::Timestamp(b)) => Ok(a.cmp(b)),

            // Mixed numeric types: implicit coercion
            (Value::Int(a), Value::Float(b)) => Ok(cmp_f64(*a as f64, *b)),
            (Value::Float(a), Value::Int(b)) => Ok(cmp_f64(*a, *b as f64)),

            _ => Err(GeoError::TypeMismatch(format!(
                "cannot compare {} and {}",
                self.type_name(),
                other.type_name()
            ))),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "NULL",
            Self::Int(_) => "INT",
            Self::Float(_) => "FLOAT",
            Self::Text(_) => "TEXT",
            Self::Bool(_) => "BOOL",
            Self::Timestamp(_) => "TIMESTAMP",
            Self::Geometry(_) => "GEOMETRY",
        }
    }

    pub fn data_type(&self) -> Option<DataType> {
        match self {
            Self::Null => None,
            Self::Int(_) => Some(DataType::Int),
            Self::Float(_) => Some(DataType::Float),
            Self::Text(_) => Some(DataType::Text),
            Self::Bool(_) => Some(DataType::Bool),
            Self::Timestamp(_) => Some(DataType::Timestamp),
            Self::Geometry(_) => Some(DataType::Geometry),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Float(f) if f.is_finite() => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            Self::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_geometry(&self) -> Option<&Shape> {
        match self {
            Self::Geometry(s) => Some(s),
            _ => None,
        }
    }

    /// Render as a backend SQL literal for WHERE-clause construction.
    ///
    /// Geometry never appears in a WHERE clause; the spatial constraint
    /// channel carries it instead.
    pub fn sql_literal(&self) -> Result<String> {
        match self {
            Self::Null => Ok("NULL".to_string()),
            Self::Int(i) => Ok(i.to_string()),
            Self::Float(f) => Ok(f.to_string()),
            Self::Bool(b) => Ok(if *b { "TRUE" } else { "FALSE" }.to_string()),
            Self::Text(s) => Ok(format!("'{}'", s.replace('\'', "''"))),
            Self::Timestamp(t) => Ok(format!("'{}'", t.to_rfc3339())),
            Self::Geometry(_) => Err(GeoError::TypeMismatch(
                "geometry cannot be rendered as a SQL literal".into(),
            )),
        }
    }
}

fn cmp_f64(a: f64, b: f64) -> Ordering {
    // NaN compares equal to NaN and greater than everything else
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Geometry(a), Value::Geometry(b)) => a == b,
            (Value::Null, Value::Null) => true,
            _ => matches!(self.compare(other), Ok(Ordering::Equal)),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Int(i) => write!(f, "{}", i),
            Self::Float(v) => write!(f, "{}", v),
            Self::Text(s) => write!(f, "{}", s),
            Self::Bool(b) => write!(f, "{}", b),
            Self::Timestamp(t) => write!(f, "{}", t.to_rfc3339()),
            Self::Geometry(s) => {
                let e = s.envelope();
                write!(
                    f,
                    "GEOMETRY[{} {} {} {}]",
                    e.min_x, e.min_y, e.max_x, e.max_y
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_coercion() {
        assert_eq!(
            Value::Int(3).compare(&Value::Float(3.0)).unwrap(),
            Ordering::Equal
        );
        assert_eq!(
            Value::Float(2.5).compare(&Value::Int(3)).unwrap(),
            Ordering::Less
        );
    }

    #[test]
    fn test_null_sorts_last() {
        assert_eq!(
            Value::Null.compare(&Value::Int(1)).unwrap(),
            Ordering::Greater
        );
        assert_eq!(
            Value::Text("a".into()).compare(&Value::Null).unwrap(),
            Ordering::Less
        );
    }

    #[test]
    fn test_incompatible_comparison_errors() {
        assert!(Value::Int(1).compare(&Value::Text("a".into())).is_err());
        assert!(
            Value::Geometry(Shape::point(0.0, 0.0))
                .compare(&Value::Int(1))
                .is_err()
        );
    }

    #[test]
    fn test_sql_literal_quoting() {
        assert_eq!(
            Value::Text("O'Hare".into()).sql_literal().unwrap(),
            "'O''Hare'"
        );
        assert_eq!(Value::Int(42).sql_literal().unwrap(), "42");
        assert_eq!(Value::Null.sql_literal().unwrap(), "NULL");
        assert!(Value::Geometry(Shape::point(0.0, 0.0)).sql_literal().is_err());
    }
}
