use uuid::Uuid;

use crate::filter::Filter;
use crate::session::StateId;

/// A caller-facing query: a feature type, an optional projection and a
/// filter. Translation turns this into a backend [`QueryPlan`].
///
/// [`QueryPlan`]: super::QueryPlan
#[derive(Debug, Clone)]
pub struct Query {
    pub type_name: String,
    /// Requested attributes in caller order; empty means all.
    pub columns: Vec<String>,
    pub filter: Filter,
}

impl Query {
    pub fn new(type_name: &str) -> Self {
        Self {
            type_name: type_name.to_string(),
            columns: Vec::new(),
            filter: Filter::Include,
        }
    }

    pub fn columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }
}

/// Visibility context an operation runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transaction {
    /// Committed baseline; every write publishes immediately.
    AutoCommit,
    /// Pending version state of an open transaction.
    Versioned { handle: Uuid, state: StateId },
}
