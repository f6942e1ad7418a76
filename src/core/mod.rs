pub mod error;
pub mod geom;
pub mod types;
pub mod value;

pub use error::{GeoError, Result};
pub use geom::{Envelope, Shape};
pub use types::{AttributeDescriptor, DataType, FeatureSchema};
pub use value::Value;

/// A fetched row, ordered exactly like the plan's column list.
pub type Row = Vec<Value>;
