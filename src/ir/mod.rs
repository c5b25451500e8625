//! The declarative query IR: a source plus an ordered sequence of tabular
//! transformation steps, shared across both folding targets.

mod aggregation;
mod formula;
mod merge;
mod predicate;
mod sort;
mod types;
mod value;

pub use aggregation::{Aggregation, AggregationOp};
pub use formula::{BinaryOp, FormulaCall, FormulaExpr, UnaryOp};
pub use merge::{JoinMode, JoinType, MergeKeys, MergeOp};
pub use predicate::{Comparison, ComparisonOp, FilterPredicate};
pub use sort::{NullsOrder, SortDirection, SortSpec};
pub use types::ColumnType;
pub use value::ScalarValue;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::sql::Dialect;

/// A named, registered query. The `id` is how `merge`/`append`/`query`
/// sources refer to one another (spec §3, §4.D "Connection identity").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub id: String,
    pub source: QuerySource,
    pub steps: Vec<Step>,
}

impl Query {
    pub fn new(id: impl Into<String>, source: QuerySource) -> Self {
        Query {
            id: id.into(),
            source,
            steps: Vec::new(),
        }
    }

    pub fn with_step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }
}

/// A single transformation step. `id` and `name` are for display/explain
/// purposes only; folding dispatches on `operation`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub name: String,
    pub operation: QueryOperation,
}

impl Step {
    pub fn new(id: impl Into<String>, name: impl Into<String>, operation: QueryOperation) -> Self {
        Step {
            id: id.into(),
            name: name.into(),
            operation,
        }
    }
}

/// Where a query's rows come from. Only `Database`, `Query`, and (for the
/// OData engine) `OData` are foldable; all other connector sources always
/// compile to a fully local plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum QuerySource {
    Database {
        connection: String,
        #[serde(default)]
        connection_id: Option<String>,
        /// The source SQL text this query is layered on top of.
        query: String,
        #[serde(default)]
        dialect: Option<Dialect>,
        #[serde(default)]
        columns: Option<Vec<String>>,
    },
    OData {
        url: String,
    },
    /// A reference to another registered query (`options.queries`).
    Query {
        query_id: String,
    },
    Csv {
        path: String,
    },
    Json {
        path: String,
    },
    Parquet {
        path: String,
    },
    Api {
        url: String,
    },
    Range {
        from: i64,
        to: i64,
    },
    Table {
        rows: Vec<HashMap<String, ScalarValue>>,
    },
}

impl QuerySource {
    pub fn is_foldable_kind(&self) -> bool {
        matches!(
            self,
            QuerySource::Database { .. } | QuerySource::OData { .. } | QuerySource::Query { .. }
        )
    }
}

/// Operations relevant to folding. Any other operation a host IR might carry
/// is intentionally outside this enum — the engines never see it and always
/// treat it as an unconditional local step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum QueryOperation {
    SelectColumns {
        columns: Vec<String>,
    },
    RemoveColumns {
        columns: Vec<String>,
    },
    FilterRows {
        predicate: FilterPredicate,
    },
    SortRows {
        specs: Vec<SortSpec>,
    },
    DistinctRows {
        #[serde(default)]
        columns: Option<Vec<String>>,
    },
    GroupBy {
        #[serde(default)]
        group_columns: Vec<String>,
        #[serde(default)]
        aggregations: Vec<Aggregation>,
    },
    RenameColumn {
        from: String,
        to: String,
    },
    ChangeType {
        column: String,
        target: ColumnType,
    },
    TransformColumns {
        column: String,
        formula: FormulaExpr,
        new_type: ColumnType,
    },
    AddColumn {
        name: String,
        formula: FormulaExpr,
    },
    Merge(MergeOp),
    ExpandTableColumn {
        column: String,
        columns: Vec<String>,
        #[serde(default)]
        new_column_names: Option<Vec<String>>,
    },
    Append {
        other_query_ids: Vec<String>,
    },
    Take {
        count: i64,
    },
    Skip {
        count: i64,
    },
}

impl QueryOperation {
    /// Short machine-readable name, used in diagnostics and explain traces.
    pub fn kind_name(&self) -> &'static str {
        match self {
            QueryOperation::SelectColumns { .. } => "selectColumns",
            QueryOperation::RemoveColumns { .. } => "removeColumns",
            QueryOperation::FilterRows { .. } => "filterRows",
            QueryOperation::SortRows { .. } => "sortRows",
            QueryOperation::DistinctRows { .. } => "distinctRows",
            QueryOperation::GroupBy { .. } => "groupBy",
            QueryOperation::RenameColumn { .. } => "renameColumn",
            QueryOperation::ChangeType { .. } => "changeType",
            QueryOperation::TransformColumns { .. } => "transformColumns",
            QueryOperation::AddColumn { .. } => "addColumn",
            QueryOperation::Merge(_) => "merge",
            QueryOperation::ExpandTableColumn { .. } => "expandTableColumn",
            QueryOperation::Append { .. } => "append",
            QueryOperation::Take { .. } => "take",
            QueryOperation::Skip { .. } => "skip",
        }
    }
}

/// A map from query id to `Query`, used to resolve `query`-typed sources and
/// the right-hand sides of `merge`/`append` (spec §6).
pub type QueryMap = HashMap<String, Query>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_builder_appends_steps() {
        let q = Query::new(
            "q1",
            QuerySource::Database {
                connection: "db1".into(),
                connection_id: None,
                query: "SELECT * FROM sales".into(),
                dialect: Some(Dialect::Postgres),
                columns: None,
            },
        )
        .with_step(Step::new(
            "s1",
            "Filtered Rows",
            QueryOperation::FilterRows {
                predicate: FilterPredicate::comparison(
                    "Region",
                    ComparisonOp::Equals,
                    Some(ScalarValue::String("East".into())),
                ),
            },
        ));
        assert_eq!(q.steps.len(), 1);
        assert_eq!(q.steps[0].operation.kind_name(), "filterRows");
    }
}
