use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    Int,
    Float,
    Text,
    Bool,
    Timestamp,
    Geometry,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeDescriptor {
    pub name: String,
    pub data_type: DataType,
    pub nullable: bool,
}

impl AttributeDescriptor {
    pub fn new(name: &str, data_type: DataType) -> Self {
        Self {
            name: name.to_string(),
            data_type,
            nullable: true,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }
}

/// Schema of a feature type (base table or registered view).
///
/// Attribute order is the schema-declared order; the geometry column may
/// sit anywhere here. Only a `QueryPlan` enforces geometry-last.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSchema {
    pub type_name: String,
    pub attributes: Vec<AttributeDescriptor>,
    /// Row-identifier column. Always present in the backend table even
    /// when a caller's projection omits it.
    pub fid_column: String,
    pub geometry_column: Option<String>,
}

impl FeatureSchema {
    pub fn new(type_name: &str, fid_column: &str, attributes: Vec<AttributeDescriptor>) -> Self {
        let geometry_column = attributes
            .iter()
            .find(|a| a.data_type == DataType::Geometry)
            .map(|a| a.name.clone());
        Self {
            type_name: type_name.to_string(),
            attributes,
            fid_column: fid_column.to_string(),
            geometry_column,
        }
    }

    pub fn attribute(&self, name: &str) -> Option<&AttributeDescriptor> {
        self.attributes.iter().find(|a| a.name == name)
    }

    pub fn attribute_names(&self) -> Vec<&str> {
        self.attributes.iter().map(|a| a.name.as_str()).collect()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.attributes.iter().position(|a| a.name == name)
    }

    pub fn is_geometry(&self, name: &str) -> bool {
        self.geometry_column.as_deref() == Some(name)
    }
}
