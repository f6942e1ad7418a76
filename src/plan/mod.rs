//! Query model and translation to backend-native plans.

mod query;
mod translate;

pub use query::{Query, Transaction};
pub use translate::{FID_BATCH_LIMIT, QueryPlan, translate, translate_view};
