//! Query-folding compiler for a Power-Query-style data-preparation engine.
//!
//! Takes a declarative [`ir::Query`] — a source plus an ordered list of
//! tabular transformation steps — and pushes as large a prefix of those
//! steps as possible down into a single native query, either SQL across
//! four dialects ([`sql`]) or an OData v4 URL ([`odata`]). Whatever doesn't
//! fold runs locally at the caller; [`explain`] reports exactly which steps
//! folded and why the rest didn't.
//!
//! You probably want to start with [`compile_sql`] or [`compile_odata`].

mod connection;
mod error;
mod explain;
mod ir;
mod odata;
mod options;
mod sql;

pub use connection::{ConnectionIdentity, ConnectionIdentityHook};
pub use error::{FatalError, FatalReason, FatalResult};
pub use explain::{ExplainResult, Plan, PrivacyDiagnostic, Reason, StepStatus, StepTrace};
pub use ir::{
    Aggregation, AggregationOp, BinaryOp, ColumnType, Comparison, ComparisonOp, FilterPredicate,
    FormulaCall, FormulaExpr, JoinMode, JoinType, MergeKeys, MergeOp, NullsOrder, Query, QueryMap,
    QueryOperation, QuerySource, ScalarValue, SortDirection, SortSpec, Step, UnaryOp,
};
pub use odata::ODataQueryOptions;
pub use options::{CompileOptions, PrivacyLevel, PrivacyMode};
pub use sql::Dialect;

/// Folds `query` into SQL against the dialect named in `query`'s source (or
/// `options.dialect` when the source omits one), or as much of a prefix of
/// it as the dialect and cross-query graph allow.
///
/// Returns `Err` only for the fatal classes in [`FatalError`] — a
/// placeholder/parameter mismatch or an unrecognised dialect — never for an
/// ordinary "this step can't fold" outcome, which is instead recorded in the
/// returned [`ExplainResult`].
pub fn compile_sql(query: &ir::Query, options: &options::CompileOptions) -> FatalResult<(Plan, ExplainResult)> {
    sql::compile(query, options)
}

/// Folds `query` into an OData v4 URL. Only meaningful when `query.source`
/// is [`QuerySource::OData`]; any other source kind compiles to a fully
/// local plan, matching the SQL engine's treatment of non-foldable sources.
pub fn compile_odata(query: &ir::Query) -> FatalResult<(Plan, ExplainResult)> {
    odata::compile(query)
}
