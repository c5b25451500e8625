//! The OData folding engine (spec §4.E): step-by-step compilation over an
//! evolving [`ODataState`], governed by OData's fixed evaluation order
//! `$filter` → `$orderby` → `$skip` → `$top`.

use itertools::Itertools;

use crate::error::FatalError;
use crate::explain::{ExplainResult, Plan, Reason, StepTrace};
use crate::ir::{FilterPredicate, Query, QueryOperation, QuerySource};
use crate::odata::filter;
use crate::odata::options::{build_url, parse_url, ODataQueryOptions};

/// The OData fold-time rolling state, the OData analogue of [`crate::sql::SqlState`].
#[derive(Debug, Clone)]
struct ODataState {
    base: String,
    options: ODataQueryOptions,
    extra_params: Vec<(String, String)>,
    columns: Option<Vec<String>>,
}

enum StepOutcome {
    Folded(ODataState),
    Local(Reason),
}

fn local(reason: Reason) -> Result<StepOutcome, FatalError> {
    Ok(StepOutcome::Local(reason))
}

/// Compiles `query` against an OData source. Only valid when `query.source`
/// is [`QuerySource::OData`]; any other source kind is a fully local plan,
/// matching the "foldable kind" gate the SQL engine applies to its own
/// sources.
pub fn compile(query: &Query) -> Result<(Plan, ExplainResult), FatalError> {
    let QuerySource::OData { url } = &query.source else {
        let steps = query.steps.iter().map(|s| s.id.clone()).collect();
        let explain = ExplainResult::from_traces(Vec::new(), query.steps.len());
        return Ok((Plan::Local { steps, diagnostics: Vec::new() }, explain));
    };

    let parsed = parse_url(url);
    let mut current = ODataState {
        base: parsed.base,
        options: parsed.options,
        extra_params: parsed.extra_params,
        columns: None,
    };

    let mut traces = Vec::new();
    let mut folded_count = 0usize;
    let steps = &query.steps;
    let mut i = 0usize;

    while i < steps.len() {
        match apply_step(&current, &steps[i].operation)? {
            StepOutcome::Folded(next) => {
                traces.push(StepTrace::folded(steps[i].id.clone(), build_url(&next.base, &next.options, &next.extra_params)));
                current = next;
                folded_count += 1;
                i += 1;
            }
            StepOutcome::Local(reason) => {
                log::debug!("step {} did not fold: {reason}", steps[i].id);
                traces.push(StepTrace::local(steps[i].id.clone(), reason));
                break;
            }
        }
    }

    let explain = ExplainResult::from_traces(traces, steps.len());

    if folded_count == 0 {
        let steps_ids = steps.iter().map(|s| s.id.clone()).collect();
        return Ok((Plan::Local { steps: steps_ids, diagnostics: Vec::new() }, explain));
    }

    let url = build_url(&current.base, &current.options, &current.extra_params);

    if folded_count == steps.len() {
        Ok((
            Plan::Native { sql_or_url: url, params: Vec::new(), diagnostics: Vec::new() },
            explain,
        ))
    } else {
        let local_steps = steps[i..].iter().map(|s| s.id.clone()).collect();
        Ok((
            Plan::Hybrid { sql_or_url: url, params: Vec::new(), local_steps, diagnostics: Vec::new() },
            explain,
        ))
    }
}

/// Once `$top` or `$skip` is present — whether parsed from the base URL or
/// set by an earlier step — `$filter`/`$orderby` can no longer be appended,
/// since OData evaluates `$filter`/`$orderby` before `$skip`/`$top` and a
/// later filter would silently apply to the wrong row set.
fn pagination_started(state: &ODataState) -> bool {
    state.options.top.is_some() || state.options.skip.is_some()
}

fn has_duplicates(items: &[String]) -> bool {
    !items.iter().all_unique()
}

fn apply_step(state: &ODataState, op: &QueryOperation) -> Result<StepOutcome, FatalError> {
    match op {
        QueryOperation::SelectColumns { columns } => select_columns(state, columns),
        QueryOperation::RemoveColumns { columns } => remove_columns(state, columns),
        QueryOperation::FilterRows { predicate } => filter_rows(state, predicate),
        QueryOperation::SortRows { specs } => sort_rows(state, specs),
        QueryOperation::Skip { count } => skip(state, *count),
        QueryOperation::Take { count } => take(state, *count),
        QueryOperation::DistinctRows { .. }
        | QueryOperation::GroupBy { .. }
        | QueryOperation::RenameColumn { .. }
        | QueryOperation::ChangeType { .. }
        | QueryOperation::TransformColumns { .. }
        | QueryOperation::AddColumn { .. }
        | QueryOperation::Merge(_)
        | QueryOperation::ExpandTableColumn { .. }
        | QueryOperation::Append { .. } => local(Reason::UnsupportedOp),
    }
}

fn select_columns(state: &ODataState, columns: &[String]) -> Result<StepOutcome, FatalError> {
    if columns.is_empty() || has_duplicates(&columns.to_vec()) {
        return local(Reason::InvalidSelect);
    }
    if let Some(known) = &state.columns {
        if columns.iter().any(|c| !known.contains(c)) {
            return local(Reason::UnknownProjection);
        }
    }
    // Intersects with any current $select projection rather than replacing
    // it outright, matching the spec's "selectColumns intersects with any
    // current projection".
    let new_select: Vec<String> = match &state.options.select {
        Some(prev) => columns.iter().filter(|c| prev.contains(c)).cloned().collect(),
        None => columns.to_vec(),
    };
    if new_select.is_empty() {
        return local(Reason::InvalidSelect);
    }
    let mut next = state.clone();
    next.columns = Some(new_select.clone());
    next.options.select = Some(new_select);
    Ok(StepOutcome::Folded(next))
}

fn remove_columns(state: &ODataState, columns: &[String]) -> Result<StepOutcome, FatalError> {
    let Some(known) = &state.columns else {
        return local(Reason::InvalidProjection);
    };
    if columns.iter().any(|c| !known.contains(c)) {
        return local(Reason::UnknownProjection);
    }
    let remaining: Vec<String> = known.iter().filter(|c| !columns.contains(c)).cloned().collect();
    if remaining.is_empty() {
        return local(Reason::InvalidProjection);
    }
    let mut next = state.clone();
    next.columns = Some(remaining.clone());
    next.options.select = Some(remaining);
    Ok(StepOutcome::Folded(next))
}

fn filter_rows(state: &ODataState, predicate: &FilterPredicate) -> Result<StepOutcome, FatalError> {
    if pagination_started(state) {
        return local(Reason::UnsupportedOp);
    }
    let Some(compiled) = filter::compile_predicate(predicate) else {
        return local(Reason::UnsupportedPredicate);
    };
    let mut next = state.clone();
    next.options.filter = Some(match &state.options.filter {
        Some(existing) => format!("({existing}) and ({compiled})"),
        None => compiled,
    });
    Ok(StepOutcome::Folded(next))
}

fn sort_rows(state: &ODataState, specs: &[crate::ir::SortSpec]) -> Result<StepOutcome, FatalError> {
    if specs.is_empty() {
        return Ok(StepOutcome::Folded(state.clone()));
    }
    if pagination_started(state) {
        return local(Reason::UnsupportedOp);
    }
    // OData has no portable NULLS FIRST/LAST; a spec that asks for explicit
    // nulls positioning can't be expressed and must stay local.
    if specs.iter().any(|s| s.nulls.is_some()) {
        return local(Reason::UnsupportedOp);
    }
    let orderby = specs
        .iter()
        .map(|s| {
            let dir = match s.direction {
                crate::ir::SortDirection::Ascending => "asc",
                crate::ir::SortDirection::Descending => "desc",
            };
            format!("{} {dir}", s.column)
        })
        .collect::<Vec<_>>()
        .join(",");
    let mut next = state.clone();
    next.options.orderby = Some(orderby);
    Ok(StepOutcome::Folded(next))
}

fn skip(state: &ODataState, count: i64) -> Result<StepOutcome, FatalError> {
    // $skip is applied before $top; a skip arriving after take is already
    // pinned cannot be expressed without changing which rows $top selects.
    if state.options.top.is_some() {
        return local(Reason::UnsupportedOp);
    }
    let mut next = state.clone();
    next.options.skip = Some(count);
    Ok(StepOutcome::Folded(next))
}

fn take(state: &ODataState, count: i64) -> Result<StepOutcome, FatalError> {
    let new_top = match state.options.top {
        Some(existing) => existing.min(count),
        None => count,
    };
    let mut next = state.clone();
    next.options.top = Some(new_top);
    Ok(StepOutcome::Folded(next))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Comparison, ComparisonOp, ScalarValue, SortDirection, SortSpec, Step};

    fn odata_query(id: &str, url: &str) -> Query {
        Query::new(id, QuerySource::OData { url: url.to_string() })
    }

    #[test]
    fn stricter_existing_top_wins_over_a_later_take() {
        let query = odata_query("q1", "https://x/odata/P?$top=5").with_step(Step::new(
            "s1",
            "take",
            QueryOperation::Take { count: 10 },
        ));
        let (plan, _explain) = compile(&query).unwrap();
        match plan {
            Plan::Native { sql_or_url, .. } => assert!(sql_or_url.contains("$top=5")),
            other => panic!("expected native plan, got {other:?}"),
        }
    }

    #[test]
    fn skip_then_filter_yields_hybrid_with_local_filter() {
        let query = odata_query("q1", "https://x/odata/P")
            .with_step(Step::new("s1", "skip", QueryOperation::Skip { count: 5 }))
            .with_step(Step::new(
                "s2",
                "filter",
                QueryOperation::FilterRows {
                    predicate: FilterPredicate::Comparison(Comparison {
                        column: "Price".into(),
                        operator: ComparisonOp::GreaterThan,
                        value: Some(ScalarValue::Int(20)),
                        case_sensitive: None,
                    }),
                },
            ));
        let (plan, explain) = compile(&query).unwrap();
        match plan {
            Plan::Hybrid { sql_or_url, local_steps, .. } => {
                assert!(sql_or_url.contains("$skip=5"));
                assert_eq!(local_steps, vec!["s2".to_string()]);
            }
            other => panic!("expected hybrid plan, got {other:?}"),
        }
        assert_eq!(explain.steps[1].reason, Some(Reason::UnsupportedOp));
    }

    #[test]
    fn skip_after_take_breaks_folding() {
        let query = odata_query("q1", "https://x/odata/P")
            .with_step(Step::new("s1", "take", QueryOperation::Take { count: 10 }))
            .with_step(Step::new("s2", "skip", QueryOperation::Skip { count: 5 }));
        let (plan, _explain) = compile(&query).unwrap();
        match plan {
            Plan::Hybrid { local_steps, .. } => assert_eq!(local_steps, vec!["s2".to_string()]),
            other => panic!("expected hybrid plan, got {other:?}"),
        }
    }

    #[test]
    fn sort_with_explicit_nulls_ordering_cannot_fold() {
        let query = odata_query("q1", "https://x/odata/P").with_step(Step::new(
            "s1",
            "sort",
            QueryOperation::SortRows {
                specs: vec![SortSpec {
                    column: "Name".into(),
                    direction: SortDirection::Ascending,
                    nulls: Some(crate::ir::NullsOrder::First),
                }],
            },
        ));
        let (plan, _explain) = compile(&query).unwrap();
        assert!(matches!(plan, Plan::Local { .. }));
    }
}
