//! The SQL folding engine (spec §4.D): step-by-step compilation over an
//! evolving [`SqlState`], cross-query resolution with cycle detection,
//! the privacy firewall, nested-join+expand fusion, and finalisation.

use std::collections::HashSet;

use itertools::Itertools;

use crate::connection::{connections_match, resolve_connection_id};
use crate::error::FatalError;
use crate::explain::{ExplainResult, Plan, PrivacyDiagnostic, Reason, StepTrace};
use crate::ir::{
    AggregationOp, ColumnType, FormulaExpr, JoinType, MergeOp, Query, QueryOperation, QuerySource,
    ScalarValue, SortSpec,
};
use crate::options::{CompileOptions, PrivacyMode};
use crate::sql::casts;
use crate::sql::dialect::{Dialect, DialectHandler};
use crate::sql::expr;
use crate::sql::placeholder;
use crate::sql::state::SqlState;

const ALIAS: &str = "t";
const RIGHT_ALIAS: &str = "t2";

/// A successfully folded query: its rolling state plus the dialect it is
/// folding against (needed by every later step to pick the right handler).
struct Folded {
    state: SqlState,
    dialect: Dialect,
}

enum StepOutcome {
    Folded(Folded),
    Local(Reason, Option<PrivacyDiagnostic>),
}

fn local(reason: Reason) -> Result<StepOutcome, FatalError> {
    Ok(StepOutcome::Local(reason, None))
}

/// Compiles `query` against `options`, producing a plan and its explain
/// trace. This is the single public entry point for SQL folding.
pub fn compile(query: &Query, options: &CompileOptions) -> Result<(Plan, ExplainResult), FatalError> {
    let mut call_stack = HashSet::new();
    call_stack.insert(query.id.clone());

    let source_outcome = compile_source(options, &query.source, &mut call_stack)?;
    let mut current = match source_outcome {
        StepOutcome::Folded(f) => f,
        StepOutcome::Local(reason, diagnostic) => {
            log::debug!("source for query {} did not fold: {reason}", query.id);
            let mut traces = Vec::new();
            if let Some(first) = query.steps.first() {
                traces.push(StepTrace::local(first.id.clone(), reason));
            }
            let explain = ExplainResult::from_traces(traces, query.steps.len());
            let diagnostics = diagnostic.into_iter().collect();
            let steps = query.steps.iter().map(|s| s.id.clone()).collect();
            return Ok((Plan::Local { steps, diagnostics }, explain));
        }
    };

    let mut traces = Vec::new();
    let mut diagnostics = Vec::new();
    let mut folded_count = 0usize;
    let steps = &query.steps;
    let mut i = 0usize;

    while i < steps.len() {
        // Nested-join + expand fusion: a `merge{nested, newColumnName}`
        // immediately followed by `expandTableColumn{column: newColumnName}`
        // folds as one unit and consumes both steps.
        if let QueryOperation::Merge(merge_op) = &steps[i].operation {
            if merge_op.join_mode == crate::ir::JoinMode::Nested {
                if let Some(next) = steps.get(i + 1) {
                    if let QueryOperation::ExpandTableColumn {
                        column,
                        columns,
                        new_column_names,
                    } = &next.operation
                    {
                        if merge_op.new_column_name.as_deref() == Some(column.as_str()) {
                            match fold_nested_join_expand(
                                options,
                                &current,
                                merge_op,
                                columns,
                                new_column_names.as_deref(),
                                &mut call_stack,
                            )? {
                                StepOutcome::Folded(next_state) => {
                                    let fragment = next_state.state.fragment.sql.clone();
                                    traces.push(StepTrace::folded(steps[i].id.clone(), fragment.clone()));
                                    traces.push(StepTrace::folded(next.id.clone(), fragment));
                                    current = next_state;
                                    folded_count += 2;
                                    i += 2;
                                    continue;
                                }
                                StepOutcome::Local(reason, diagnostic) => {
                                    log::debug!("step {} did not fold: {reason}", steps[i].id);
                                    traces.push(StepTrace::local(steps[i].id.clone(), reason));
                                    diagnostics.extend(diagnostic);
                                    break;
                                }
                            }
                        }
                    }
                }
            }
        }

        match apply_step(options, &current, &steps[i].operation, &mut call_stack)? {
            StepOutcome::Folded(next) => {
                traces.push(StepTrace::folded(steps[i].id.clone(), next.state.fragment.sql.clone()));
                current = next;
                folded_count += 1;
                i += 1;
            }
            StepOutcome::Local(reason, diagnostic) => {
                log::debug!("step {} did not fold: {reason}", steps[i].id);
                traces.push(StepTrace::local(steps[i].id.clone(), reason));
                diagnostics.extend(diagnostic);
                break;
            }
        }
    }

    let explain = ExplainResult::from_traces(traces, steps.len());

    if folded_count == 0 {
        let steps_ids = steps.iter().map(|s| s.id.clone()).collect();
        return Ok((Plan::Local { steps: steps_ids, diagnostics }, explain));
    }

    let finalized = finalize(&current);
    let handler = current.dialect.handler();
    let sql = placeholder::normalize(
        &finalized.sql,
        handler.placeholder_style(),
        finalized.params.len(),
    )?;

    if folded_count == steps.len() {
        Ok((
            Plan::Native {
                sql_or_url: sql,
                params: finalized.params,
                diagnostics,
            },
            explain,
        ))
    } else {
        let local_steps = steps[i..].iter().map(|s| s.id.clone()).collect();
        Ok((
            Plan::Hybrid {
                sql_or_url: sql,
                params: finalized.params,
                local_steps,
                diagnostics,
            },
            explain,
        ))
    }
}

fn finalize(folded: &Folded) -> crate::sql::state::SqlFragment {
    if let Some(specs) = &folded.state.sort_by {
        if !folded.state.sort_in_fragment && !specs.is_empty() {
            let handler = folded.dialect.handler();
            let order_by = specs
                .iter()
                .map(|s| handler.sort_spec_to_sql(ALIAS, s))
                .collect::<Vec<_>>()
                .join(", ");
            let new_sql = format!(
                "SELECT * FROM ({}) AS {ALIAS} ORDER BY {order_by}",
                folded.state.fragment.sql
            );
            return crate::sql::state::SqlFragment::new(new_sql, folded.state.fragment.params.clone());
        }
    }
    folded.state.fragment.clone()
}

fn privacy_key(state: &SqlState) -> &str {
    state.connection_id.as_deref().unwrap_or(&state.connection)
}

/// Checks the privacy firewall for a cross-source operation. Returns
/// `Some(diagnostic)` when the fold must be refused.
fn privacy_check(
    options: &CompileOptions,
    operation: &'static str,
    left: &SqlState,
    right: &SqlState,
) -> Option<PrivacyDiagnostic> {
    if options.privacy_mode == PrivacyMode::Ignore {
        return None;
    }
    let left_level = options.privacy_level_of(privacy_key(left));
    let right_level = options.privacy_level_of(privacy_key(right));
    if left_level == right_level {
        return None;
    }
    log::warn!(
        "privacy firewall refused {operation}: left={left_level} right={right_level} mode={:?}",
        options.privacy_mode
    );
    Some(PrivacyDiagnostic {
        operation,
        left_level,
        right_level,
        warn_only: options.privacy_mode == PrivacyMode::Warn,
    })
}

fn compile_source(
    options: &CompileOptions,
    source: &QuerySource,
    call_stack: &mut HashSet<String>,
) -> Result<StepOutcome, FatalError> {
    match source {
        QuerySource::Database {
            connection,
            connection_id: _,
            query: sql,
            dialect,
            columns,
        } => {
            let Some(dialect) = dialect.as_ref().copied().or(options.dialect) else {
                return local(Reason::MissingDialect);
            };
            let handler = dialect.handler();
            if !handler.allows_order_by_in_derived_table() && has_unsafe_trailing_order_by(sql) {
                return local(Reason::SqlserverOrderByInSource);
            }
            let resolved_id =
                resolve_connection_id(source, options.get_connection_identity.as_deref());
            let state = SqlState::from_source(sql.clone(), connection.clone())
                .with_columns(columns.clone())
                .with_connection_id(resolved_id);
            Ok(StepOutcome::Folded(Folded { state, dialect }))
        }
        QuerySource::Query { query_id } => {
            if call_stack.contains(query_id) {
                return local(Reason::QueryCycle);
            }
            let Some(referenced) = options.queries.get(query_id) else {
                return local(Reason::MissingQuery);
            };
            call_stack.insert(query_id.clone());
            let result = compile_query_to_state(options, referenced, call_stack)?;
            call_stack.remove(query_id);
            match result {
                Some(folded) => Ok(StepOutcome::Folded(folded)),
                None => local(Reason::MissingQueries),
            }
        }
        QuerySource::OData { .. }
        | QuerySource::Csv { .. }
        | QuerySource::Json { .. }
        | QuerySource::Parquet { .. }
        | QuerySource::Api { .. }
        | QuerySource::Range { .. }
        | QuerySource::Table { .. } => local(Reason::UnsupportedOp),
    }
}

/// Fully compiles `query` (source plus every step) into a single state, or
/// `None` if any part fails to fold. Used to resolve `query`-typed sources
/// and the right-hand side of `merge`/`append`, which require a complete
/// native fragment rather than a partial plan.
fn compile_query_to_state(
    options: &CompileOptions,
    query: &Query,
    call_stack: &mut HashSet<String>,
) -> Result<Option<Folded>, FatalError> {
    let outcome = compile_source(options, &query.source, call_stack)?;
    let mut current = match outcome {
        StepOutcome::Folded(f) => f,
        StepOutcome::Local(..) => return Ok(None),
    };
    for step in &query.steps {
        match apply_step(options, &current, &step.operation, call_stack)? {
            StepOutcome::Folded(next) => current = next,
            StepOutcome::Local(..) => return Ok(None),
        }
    }
    Ok(Some(current))
}

/// A lexer-lite scan for a top-level `ORDER BY` not paired with `TOP`/
/// `OFFSET`/`FETCH`, skipping string/identifier literals, comments, and
/// anything inside parentheses (subqueries have their own scope).
fn has_unsafe_trailing_order_by(sql: &str) -> bool {
    let upper = sql.to_ascii_uppercase();
    let mut depth: i32 = 0;
    let chars: Vec<char> = sql.chars().collect();
    let upper_chars: Vec<char> = upper.chars().collect();
    let mut i = 0usize;
    let mut top_level_order_by_at: Option<usize> = None;
    while i < chars.len() {
        match chars[i] {
            '\'' => {
                i += 1;
                while i < chars.len() && chars[i] != '\'' {
                    i += 1;
                }
            }
            '"' | '[' => {
                let close = if chars[i] == '[' { ']' } else { '"' };
                i += 1;
                while i < chars.len() && chars[i] != close {
                    i += 1;
                }
            }
            '(' => depth += 1,
            ')' => depth -= 1,
            _ => {
                if depth == 0 && matches_keyword_at(&upper_chars, i, "ORDER BY") {
                    top_level_order_by_at = Some(i);
                }
            }
        }
        i += 1;
    }
    let Some(pos) = top_level_order_by_at else {
        return false;
    };
    let tail = &upper[pos..];
    !(tail.contains("TOP") || tail.contains("OFFSET") || tail.contains("FETCH"))
        && !upper[..pos].contains("TOP (")
}

fn matches_keyword_at(upper_chars: &[char], i: usize, keyword: &str) -> bool {
    let kw_chars: Vec<char> = keyword.chars().collect();
    if i + kw_chars.len() > upper_chars.len() {
        return false;
    }
    upper_chars[i..i + kw_chars.len()] == kw_chars[..]
}

fn apply_step(
    options: &CompileOptions,
    folded: &Folded,
    op: &QueryOperation,
    call_stack: &mut HashSet<String>,
) -> Result<StepOutcome, FatalError> {
    let handler = folded.dialect.handler();
    match op {
        QueryOperation::SelectColumns { columns } => select_columns(folded, handler.as_ref(), columns),
        QueryOperation::RemoveColumns { columns } => remove_columns(folded, handler.as_ref(), columns),
        QueryOperation::FilterRows { predicate } => filter_rows(folded, handler.as_ref(), predicate),
        QueryOperation::SortRows { specs } => sort_rows(folded, handler.as_ref(), specs),
        QueryOperation::DistinctRows { columns } => distinct_rows(folded, handler.as_ref(), columns),
        QueryOperation::GroupBy {
            group_columns,
            aggregations,
        } => group_by(folded, handler.as_ref(), group_columns, aggregations),
        QueryOperation::RenameColumn { from, to } => rename_column(folded, handler.as_ref(), from, to),
        QueryOperation::ChangeType { column, target } => {
            change_type(folded, handler.as_ref(), column, *target)
        }
        QueryOperation::TransformColumns {
            column,
            formula,
            new_type,
        } => transform_columns(folded, handler.as_ref(), column, formula, *new_type),
        QueryOperation::AddColumn { name, formula } => add_column(folded, handler.as_ref(), name, formula),
        QueryOperation::Merge(merge_op) => merge(options, folded, merge_op, call_stack),
        QueryOperation::ExpandTableColumn { .. } => local(Reason::UnsupportedOp),
        QueryOperation::Append { other_query_ids } => {
            append(options, folded, other_query_ids, call_stack)
        }
        QueryOperation::Take { count } => take(folded, handler.as_ref(), *count),
        QueryOperation::Skip { count } => skip(folded, handler.as_ref(), *count),
    }
}

fn has_duplicates(items: &[String]) -> bool {
    !items.iter().all_unique()
}

fn select_columns(
    folded: &Folded,
    handler: &dyn DialectHandler,
    columns: &[String],
) -> Result<StepOutcome, FatalError> {
    if columns.is_empty() || has_duplicates(&columns.to_vec()) {
        return local(Reason::InvalidSelect);
    }
    if let Some(known) = &folded.state.columns {
        if columns.iter().any(|c| !known.contains(c)) {
            return local(Reason::UnknownProjection);
        }
    }
    if let Some(specs) = &folded.state.sort_by {
        if specs.iter().any(|s| !columns.contains(&s.column)) {
            return local(Reason::InvalidSelect);
        }
    }
    let select_list = columns
        .iter()
        .map(|c| format!("{ALIAS}.{}", handler.quote_identifier(c)))
        .collect::<Vec<_>>()
        .join(", ");
    let new_sql = format!(
        "SELECT {select_list} FROM ({}) AS {ALIAS}",
        folded.state.fragment.sql
    );
    let mut next_state = SqlState {
        fragment: folded.state.wrap(new_sql, vec![]),
        columns: Some(columns.to_vec()),
        sort_by: folded.state.sort_by.clone(),
        sort_in_fragment: folded.state.sort_in_fragment,
        connection_id: folded.state.connection_id.clone(),
        connection: folded.state.connection.clone(),
    };
    next_state.sort_in_fragment = false;
    Ok(StepOutcome::Folded(Folded {
        state: next_state,
        dialect: folded.dialect,
    }))
}

fn remove_columns(
    folded: &Folded,
    handler: &dyn DialectHandler,
    columns: &[String],
) -> Result<StepOutcome, FatalError> {
    let Some(known) = &folded.state.columns else {
        return local(Reason::InvalidProjection);
    };
    if columns.iter().any(|c| !known.contains(c)) {
        return local(Reason::UnknownProjection);
    }
    let remaining: Vec<String> = known.iter().filter(|c| !columns.contains(*c)).cloned().collect();
    if remaining.is_empty() {
        return local(Reason::InvalidProjection);
    }
    let select_list = remaining
        .iter()
        .map(|c| format!("{ALIAS}.{}", handler.quote_identifier(c)))
        .collect::<Vec<_>>()
        .join(", ");
    let new_sql = format!(
        "SELECT {select_list} FROM ({}) AS {ALIAS}",
        folded.state.fragment.sql
    );
    Ok(StepOutcome::Folded(Folded {
        state: SqlState {
            fragment: folded.state.wrap(new_sql, vec![]),
            columns: Some(remaining),
            sort_by: folded.state.sort_by.clone(),
            sort_in_fragment: false,
            connection_id: folded.state.connection_id.clone(),
            connection: folded.state.connection.clone(),
        },
        dialect: folded.dialect,
    }))
}

fn filter_rows(
    folded: &Folded,
    handler: &dyn DialectHandler,
    predicate: &crate::ir::FilterPredicate,
) -> Result<StepOutcome, FatalError> {
    let Some(compiled) = expr::compile_predicate(predicate, ALIAS, handler) else {
        return local(Reason::UnsupportedPredicate);
    };
    let new_sql = format!(
        "SELECT * FROM ({}) AS {ALIAS} WHERE ({})",
        folded.state.fragment.sql, compiled.sql
    );
    Ok(StepOutcome::Folded(Folded {
        state: SqlState {
            fragment: folded.state.wrap(new_sql, compiled.params),
            columns: folded.state.columns.clone(),
            sort_by: folded.state.sort_by.clone(),
            sort_in_fragment: false,
            connection_id: folded.state.connection_id.clone(),
            connection: folded.state.connection.clone(),
        },
        dialect: folded.dialect,
    }))
}

fn sort_rows(
    folded: &Folded,
    handler: &dyn DialectHandler,
    specs: &[SortSpec],
) -> Result<StepOutcome, FatalError> {
    if specs.is_empty() {
        return Ok(StepOutcome::Folded(Folded {
            state: folded.state.clone(),
            dialect: folded.dialect,
        }));
    }
    if !handler.allows_order_by_in_derived_table() {
        return Ok(StepOutcome::Folded(Folded {
            state: SqlState {
                sort_by: Some(specs.to_vec()),
                ..folded.state.clone()
            },
            dialect: folded.dialect,
        }));
    }
    let order_by = specs
        .iter()
        .map(|s| handler.sort_spec_to_sql(ALIAS, s))
        .collect::<Vec<_>>()
        .join(", ");
    let new_sql = format!(
        "SELECT * FROM ({}) AS {ALIAS} ORDER BY {order_by}",
        folded.state.fragment.sql
    );
    Ok(StepOutcome::Folded(Folded {
        state: SqlState {
            fragment: folded.state.wrap(new_sql, vec![]),
            columns: folded.state.columns.clone(),
            sort_by: None,
            sort_in_fragment: true,
            connection_id: folded.state.connection_id.clone(),
            connection: folded.state.connection.clone(),
        },
        dialect: folded.dialect,
    }))
}

fn distinct_rows(
    folded: &Folded,
    _handler: &dyn DialectHandler,
    columns: &Option<Vec<String>>,
) -> Result<StepOutcome, FatalError> {
    if columns.is_some() {
        return local(Reason::UnsupportedOp);
    }
    if folded.state.columns.is_none() {
        return local(Reason::InvalidProjection);
    }
    let new_sql = format!(
        "SELECT DISTINCT {ALIAS}.* FROM ({}) AS {ALIAS}",
        folded.state.fragment.sql
    );
    Ok(StepOutcome::Folded(Folded {
        state: SqlState {
            fragment: folded.state.wrap(new_sql, vec![]),
            columns: folded.state.columns.clone(),
            sort_by: folded.state.sort_by.clone(),
            sort_in_fragment: false,
            connection_id: folded.state.connection_id.clone(),
            connection: folded.state.connection.clone(),
        },
        dialect: folded.dialect,
    }))
}

fn group_by(
    folded: &Folded,
    handler: &dyn DialectHandler,
    group_columns: &[String],
    aggregations: &[crate::ir::Aggregation],
) -> Result<StepOutcome, FatalError> {
    if group_columns.is_empty() && aggregations.is_empty() {
        return local(Reason::InvalidArgument);
    }
    let mut output_names: Vec<&str> = group_columns.iter().map(String::as_str).collect();
    output_names.extend(aggregations.iter().map(|a| a.output_name()));
    if has_duplicates(&output_names.iter().map(|s| s.to_string()).collect::<Vec<_>>()) {
        return local(Reason::InvalidArgument);
    }

    let needs_numeric_cast = aggregations
        .iter()
        .any(|a| matches!(a.op, AggregationOp::Sum | AggregationOp::Average));
    if needs_numeric_cast && !handler.supports_safe_cast() {
        return local(Reason::UnsupportedType);
    }

    let mut select_parts: Vec<String> = group_columns
        .iter()
        .map(|c| format!("{ALIAS}.{}", handler.quote_identifier(c)))
        .collect();

    for agg in aggregations {
        let col_ref = format!("{ALIAS}.{}", handler.quote_identifier(&agg.column));
        let expr_sql = match agg.op {
            AggregationOp::Sum => {
                let cast = casts::safe_numeric_cast(folded.dialect, &col_ref).unwrap();
                format!("SUM({cast})")
            }
            AggregationOp::Average => {
                let cast = casts::safe_numeric_cast(folded.dialect, &col_ref).unwrap();
                format!("AVG({cast})")
            }
            AggregationOp::Count => format!("COUNT({col_ref})"),
            AggregationOp::Min => format!("MIN({col_ref})"),
            AggregationOp::Max => format!("MAX({col_ref})"),
            AggregationOp::CountDistinct => format!(
                "(COUNT(DISTINCT {col_ref}) + MAX(CASE WHEN {col_ref} IS NULL THEN 1 ELSE 0 END))"
            ),
        };
        select_parts.push(format!("{expr_sql} AS {}", handler.quote_identifier(agg.output_name())));
    }

    let group_by_clause = if group_columns.is_empty() {
        "'_grp'".to_string()
    } else {
        group_columns
            .iter()
            .map(|c| format!("{ALIAS}.{}", handler.quote_identifier(c)))
            .collect::<Vec<_>>()
            .join(", ")
    };

    let new_sql = format!(
        "SELECT {} FROM ({}) AS {ALIAS} GROUP BY {group_by_clause}",
        select_parts.join(", "),
        folded.state.fragment.sql
    );
    let output_columns: Vec<String> = group_columns
        .iter()
        .cloned()
        .chain(aggregations.iter().map(|a| a.output_name().to_string()))
        .collect();
    Ok(StepOutcome::Folded(Folded {
        state: SqlState {
            fragment: folded.state.wrap(new_sql, vec![]),
            columns: Some(output_columns),
            sort_by: None,
            sort_in_fragment: false,
            connection_id: folded.state.connection_id.clone(),
            connection: folded.state.connection.clone(),
        },
        dialect: folded.dialect,
    }))
}

fn rename_column(
    folded: &Folded,
    handler: &dyn DialectHandler,
    from: &str,
    to: &str,
) -> Result<StepOutcome, FatalError> {
    if from == to {
        return Ok(StepOutcome::Folded(Folded {
            state: folded.state.clone(),
            dialect: folded.dialect,
        }));
    }
    let Some(known) = &folded.state.columns else {
        return local(Reason::InvalidProjection);
    };
    if !known.contains(&from.to_string()) {
        return local(Reason::UnknownProjection);
    }
    if known.contains(&to.to_string()) {
        return local(Reason::InvalidArgument);
    }
    let select_list = known
        .iter()
        .map(|c| {
            if c == from {
                format!(
                    "{ALIAS}.{} AS {}",
                    handler.quote_identifier(c),
                    handler.quote_identifier(to)
                )
            } else {
                format!("{ALIAS}.{}", handler.quote_identifier(c))
            }
        })
        .collect::<Vec<_>>()
        .join(", ");
    let new_sql = format!(
        "SELECT {select_list} FROM ({}) AS {ALIAS}",
        folded.state.fragment.sql
    );
    let new_columns: Vec<String> = known
        .iter()
        .map(|c| if c == from { to.to_string() } else { c.clone() })
        .collect();
    let new_sort_by = folded.state.sort_by.as_ref().map(|specs| {
        specs
            .iter()
            .map(|s| {
                let mut s = s.clone();
                if s.column == from {
                    s.column = to.to_string();
                }
                s
            })
            .collect()
    });
    Ok(StepOutcome::Folded(Folded {
        state: SqlState {
            fragment: folded.state.wrap(new_sql, vec![]),
            columns: Some(new_columns),
            sort_by: new_sort_by,
            sort_in_fragment: folded.state.sort_in_fragment,
            connection_id: folded.state.connection_id.clone(),
            connection: folded.state.connection.clone(),
        },
        dialect: folded.dialect,
    }))
}

fn cast_expr_for_target(
    dialect: Dialect,
    handler: &dyn DialectHandler,
    col_ref: &str,
    target: ColumnType,
) -> Option<String> {
    match target {
        ColumnType::Any => None,
        ColumnType::String => Some(handler.cast_text(col_ref)),
        ColumnType::Number | ColumnType::Decimal => casts::safe_numeric_cast(dialect, col_ref),
        ColumnType::Boolean => {
            casts::sql_type_for(dialect, target).map(|t| format!("CAST({col_ref} AS {t})"))
        }
        ColumnType::Date | ColumnType::DateTime | ColumnType::DateTimeZone | ColumnType::Time => {
            casts::sql_type_for(dialect, target)
                .and_then(|t| casts::safe_datetime_cast(dialect, col_ref, t))
        }
        ColumnType::Duration | ColumnType::Binary => None,
    }
}

fn change_type(
    folded: &Folded,
    handler: &dyn DialectHandler,
    column: &str,
    target: ColumnType,
) -> Result<StepOutcome, FatalError> {
    if target == ColumnType::Any {
        return Ok(StepOutcome::Folded(Folded {
            state: folded.state.clone(),
            dialect: folded.dialect,
        }));
    }
    let Some(known) = &folded.state.columns else {
        return local(Reason::InvalidProjection);
    };
    if !known.contains(&column.to_string()) {
        return local(Reason::UnknownProjection);
    }
    if let Some(specs) = &folded.state.sort_by {
        if specs.iter().any(|s| s.column == column) {
            return local(Reason::InvalidArgument);
        }
    }
    let col_ref = format!("{ALIAS}.{}", handler.quote_identifier(column));
    let Some(cast_sql) = cast_expr_for_target(folded.dialect, handler, &col_ref, target) else {
        return local(Reason::UnsupportedType);
    };
    let select_list = known
        .iter()
        .map(|c| {
            if c == column {
                format!("{cast_sql} AS {}", handler.quote_identifier(c))
            } else {
                format!("{ALIAS}.{}", handler.quote_identifier(c))
            }
        })
        .collect::<Vec<_>>()
        .join(", ");
    let new_sql = format!(
        "SELECT {select_list} FROM ({}) AS {ALIAS}",
        folded.state.fragment.sql
    );
    Ok(StepOutcome::Folded(Folded {
        state: SqlState {
            fragment: folded.state.wrap(new_sql, vec![]),
            columns: Some(known.clone()),
            sort_by: folded.state.sort_by.clone(),
            sort_in_fragment: folded.state.sort_in_fragment,
            connection_id: folded.state.connection_id.clone(),
            connection: folded.state.connection.clone(),
        },
        dialect: folded.dialect,
    }))
}

fn transform_columns(
    folded: &Folded,
    handler: &dyn DialectHandler,
    column: &str,
    formula: &FormulaExpr,
    new_type: ColumnType,
) -> Result<StepOutcome, FatalError> {
    if !formula.is_identity() || new_type == ColumnType::Any {
        return local(Reason::UnsafeFormula);
    }
    change_type(folded, handler, column, new_type)
}

fn add_column(
    folded: &Folded,
    handler: &dyn DialectHandler,
    name: &str,
    formula: &FormulaExpr,
) -> Result<StepOutcome, FatalError> {
    let Some(compiled) = expr::compile_formula_value(formula, ALIAS, handler) else {
        return local(Reason::UnsafeFormula);
    };
    let final_sql = format!(
        "SELECT {ALIAS}.*, {} AS {} FROM ({}) AS {ALIAS}",
        compiled.sql,
        handler.quote_identifier(name),
        folded.state.fragment.sql
    );
    let new_columns = folded
        .state
        .columns
        .as_ref()
        .map(|cols| cols.iter().cloned().chain(std::iter::once(name.to_string())).collect());
    Ok(StepOutcome::Folded(Folded {
        state: SqlState {
            fragment: folded.state.wrap_with_leading_params(final_sql, compiled.params),
            columns: new_columns,
            sort_by: folded.state.sort_by.clone(),
            sort_in_fragment: folded.state.sort_in_fragment,
            connection_id: folded.state.connection_id.clone(),
            connection: folded.state.connection.clone(),
        },
        dialect: folded.dialect,
    }))
}

fn join_keyword(join_type: JoinType) -> &'static str {
    match join_type {
        JoinType::Inner => "INNER JOIN",
        JoinType::Left => "LEFT JOIN",
        JoinType::Right => "RIGHT JOIN",
        JoinType::Full => "FULL OUTER JOIN",
        _ => unreachable!("semi/anti filtered out before reaching join_keyword"),
    }
}

fn supports_join_type(dialect: Dialect, join_type: JoinType) -> bool {
    match dialect {
        Dialect::SQLite => !matches!(join_type, JoinType::Right | JoinType::Full),
        Dialect::MySql => !matches!(join_type, JoinType::Full),
        Dialect::Postgres | Dialect::MsSql => true,
    }
}

fn null_safe_eq(dialect: Dialect, l: &str, r: &str) -> String {
    match dialect {
        Dialect::Postgres => format!("{l} IS NOT DISTINCT FROM {r}"),
        Dialect::MySql => format!("{l} <=> {r}"),
        Dialect::SQLite => format!("{l} IS {r}"),
        Dialect::MsSql => format!("({l} = {r} OR ({l} IS NULL AND {r} IS NULL))"),
    }
}

fn merge(
    options: &CompileOptions,
    folded: &Folded,
    op: &MergeOp,
    call_stack: &mut HashSet<String>,
) -> Result<StepOutcome, FatalError> {
    if op.join_mode == crate::ir::JoinMode::Nested {
        return local(Reason::UnsupportedJoinMode);
    }
    if op.join_type.is_semi_or_anti() {
        return local(Reason::UnsupportedJoinType);
    }
    if !supports_join_type(folded.dialect, op.join_type) {
        return local(Reason::UnsupportedJoinType);
    }
    let Some(right_query) = options.queries.get(&op.right_query_id) else {
        return local(Reason::MissingQuery);
    };
    if call_stack.contains(&op.right_query_id) {
        return local(Reason::QueryCycle);
    }
    call_stack.insert(op.right_query_id.clone());
    let right_result = compile_query_to_state(options, right_query, call_stack)?;
    call_stack.remove(&op.right_query_id);
    let Some(right) = right_result else {
        return local(Reason::MissingQueries);
    };

    if !connections_match(
        &folded.state.connection_id,
        &folded.state.connection,
        &right.state.connection_id,
        &right.state.connection,
    ) {
        return local(Reason::DifferentConnection);
    }

    if let Some(diagnostic) = privacy_check(options, "merge", &folded.state, &right.state) {
        return Ok(StepOutcome::Local(Reason::PrivacyFirewall, Some(diagnostic)));
    }

    let left_keys = op.left_keys.as_list();
    let right_keys = op.right_keys.as_list();
    if left_keys.is_empty() || left_keys.len() != right_keys.len() {
        return local(Reason::UnsupportedComparer);
    }

    let (Some(left_cols), Some(right_cols)) = (&folded.state.columns, &right.state.columns) else {
        return local(Reason::IncompatibleSchema);
    };

    let handler = folded.dialect.handler();
    let right_handler = right.dialect.handler();

    let right_non_key: Vec<&String> = right_cols.iter().filter(|c| !right_keys.contains(*c)).collect();
    let restricted: Vec<&String> = match &op.right_columns {
        Some(wanted) => right_non_key.into_iter().filter(|c| wanted.contains(*c)).collect(),
        None => right_non_key,
    };

    let mut output_columns: Vec<String> = left_cols.clone();
    let mut select_parts: Vec<String> = left_cols
        .iter()
        .map(|c| format!("{ALIAS}.{} AS {}", handler.quote_identifier(c), handler.quote_identifier(c)))
        .collect();
    for c in &restricted {
        let out_name = if left_cols.contains(*c) {
            let mut candidate = format!("{c}.1");
            let mut n = 1;
            while output_columns.contains(&candidate) {
                n += 1;
                candidate = format!("{c}.{n}");
            }
            candidate
        } else {
            (*c).clone()
        };
        select_parts.push(format!(
            "{RIGHT_ALIAS}.{} AS {}",
            right_handler.quote_identifier(c),
            handler.quote_identifier(&out_name)
        ));
        output_columns.push(out_name);
    }

    let on_clause = left_keys
        .iter()
        .zip(right_keys.iter())
        .map(|(l, r)| {
            null_safe_eq(
                folded.dialect,
                &format!("{ALIAS}.{}", handler.quote_identifier(l)),
                &format!("{RIGHT_ALIAS}.{}", right_handler.quote_identifier(r)),
            )
        })
        .collect::<Vec<_>>()
        .join(" AND ");

    let new_sql = format!(
        "SELECT {} FROM ({}) AS {ALIAS} {} ({}) AS {RIGHT_ALIAS} ON {on_clause}",
        select_parts.join(", "),
        folded.state.fragment.sql,
        join_keyword(op.join_type),
        right.state.fragment.sql
    );

    let mut params = folded.state.fragment.params.clone();
    params.extend(right.state.fragment.params.clone());

    Ok(StepOutcome::Folded(Folded {
        state: SqlState {
            fragment: crate::sql::state::SqlFragment::new(new_sql, params),
            columns: Some(output_columns),
            sort_by: folded.state.sort_by.clone(),
            sort_in_fragment: false,
            connection_id: folded.state.connection_id.clone(),
            connection: folded.state.connection.clone(),
        },
        dialect: folded.dialect,
    }))
}

fn fold_nested_join_expand(
    options: &CompileOptions,
    folded: &Folded,
    op: &MergeOp,
    expand_columns: &[String],
    new_column_names: Option<&[String]>,
    call_stack: &mut HashSet<String>,
) -> Result<StepOutcome, FatalError> {
    if op.join_type.is_semi_or_anti() || !supports_join_type(folded.dialect, op.join_type) {
        return local(Reason::UnsupportedJoinType);
    }
    let Some(right_query) = options.queries.get(&op.right_query_id) else {
        return local(Reason::MissingQuery);
    };
    if call_stack.contains(&op.right_query_id) {
        return local(Reason::QueryCycle);
    }
    call_stack.insert(op.right_query_id.clone());
    let right_result = compile_query_to_state(options, right_query, call_stack)?;
    call_stack.remove(&op.right_query_id);
    let Some(right) = right_result else {
        return local(Reason::MissingQueries);
    };
    if !connections_match(
        &folded.state.connection_id,
        &folded.state.connection,
        &right.state.connection_id,
        &right.state.connection,
    ) {
        return local(Reason::DifferentConnection);
    }
    if let Some(diagnostic) = privacy_check(options, "merge", &folded.state, &right.state) {
        return Ok(StepOutcome::Local(Reason::PrivacyFirewall, Some(diagnostic)));
    }
    let left_keys = op.left_keys.as_list();
    let right_keys = op.right_keys.as_list();
    if left_keys.is_empty() || left_keys.len() != right_keys.len() {
        return local(Reason::UnsupportedComparer);
    }
    let (Some(left_cols), Some(right_cols)) = (&folded.state.columns, &right.state.columns) else {
        return local(Reason::IncompatibleSchema);
    };

    let handler = folded.dialect.handler();
    let right_handler = right.dialect.handler();

    let wanted_right: Vec<&String> = if expand_columns.is_empty() {
        right_cols.iter().collect()
    } else {
        right_cols.iter().filter(|c| expand_columns.contains(*c)).collect()
    };

    let mut output_columns: Vec<String> = left_cols.clone();
    let mut select_parts: Vec<String> = left_cols
        .iter()
        .map(|c| format!("{ALIAS}.{} AS {}", handler.quote_identifier(c), handler.quote_identifier(c)))
        .collect();
    for (idx, c) in wanted_right.iter().enumerate() {
        let base = new_column_names
            .and_then(|names| names.get(idx))
            .cloned()
            .unwrap_or_else(|| (*c).clone());
        let mut candidate = base.clone();
        let mut n = 0;
        while output_columns.contains(&candidate) {
            n += 1;
            candidate = format!("{base}.{n}");
        }
        select_parts.push(format!(
            "{RIGHT_ALIAS}.{} AS {}",
            right_handler.quote_identifier(c),
            handler.quote_identifier(&candidate)
        ));
        output_columns.push(candidate);
    }

    let on_clause = left_keys
        .iter()
        .zip(right_keys.iter())
        .map(|(l, r)| {
            null_safe_eq(
                folded.dialect,
                &format!("{ALIAS}.{}", handler.quote_identifier(l)),
                &format!("{RIGHT_ALIAS}.{}", right_handler.quote_identifier(r)),
            )
        })
        .collect::<Vec<_>>()
        .join(" AND ");

    let new_sql = format!(
        "SELECT {} FROM ({}) AS {ALIAS} {} ({}) AS {RIGHT_ALIAS} ON {on_clause}",
        select_parts.join(", "),
        folded.state.fragment.sql,
        join_keyword(op.join_type),
        right.state.fragment.sql
    );
    let mut params = folded.state.fragment.params.clone();
    params.extend(right.state.fragment.params.clone());

    Ok(StepOutcome::Folded(Folded {
        state: SqlState {
            fragment: crate::sql::state::SqlFragment::new(new_sql, params),
            columns: Some(output_columns),
            sort_by: folded.state.sort_by.clone(),
            sort_in_fragment: false,
            connection_id: folded.state.connection_id.clone(),
            connection: folded.state.connection.clone(),
        },
        dialect: folded.dialect,
    }))
}

fn append(
    options: &CompileOptions,
    folded: &Folded,
    other_query_ids: &[String],
    call_stack: &mut HashSet<String>,
) -> Result<StepOutcome, FatalError> {
    let Some(left_cols) = folded.state.columns.clone() else {
        return local(Reason::IncompatibleSchema);
    };
    let handler = folded.dialect.handler();
    let left_set: HashSet<&String> = left_cols.iter().collect();

    let mut branch_sqls = Vec::new();
    let mut params = folded.state.fragment.params.clone();
    let left_select = left_cols
        .iter()
        .map(|c| format!("{ALIAS}.{}", handler.quote_identifier(c)))
        .collect::<Vec<_>>()
        .join(", ");
    branch_sqls.push(format!(
        "SELECT {left_select} FROM ({}) AS {ALIAS}",
        folded.state.fragment.sql
    ));

    for query_id in other_query_ids {
        let Some(q) = options.queries.get(query_id) else {
            return local(Reason::MissingQueries);
        };
        if call_stack.contains(query_id) {
            return local(Reason::QueryCycle);
        }
        call_stack.insert(query_id.clone());
        let result = compile_query_to_state(options, q, call_stack)?;
        call_stack.remove(query_id);
        let Some(branch) = result else {
            return local(Reason::MissingQueries);
        };
        if !connections_match(
            &folded.state.connection_id,
            &folded.state.connection,
            &branch.state.connection_id,
            &branch.state.connection,
        ) {
            return local(Reason::DifferentConnection);
        }
        if let Some(diagnostic) = privacy_check(options, "append", &folded.state, &branch.state) {
            return Ok(StepOutcome::Local(Reason::PrivacyFirewall, Some(diagnostic)));
        }
        let Some(branch_cols) = &branch.state.columns else {
            return local(Reason::IncompatibleSchema);
        };
        let branch_set: HashSet<&String> = branch_cols.iter().collect();
        if branch_set != left_set {
            return local(Reason::IncompatibleSchema);
        }
        let branch_handler = branch.dialect.handler();
        let select_list = left_cols
            .iter()
            .map(|c| format!("{ALIAS}.{}", branch_handler.quote_identifier(c)))
            .collect::<Vec<_>>()
            .join(", ");
        branch_sqls.push(format!(
            "SELECT {select_list} FROM ({}) AS {ALIAS}",
            branch.state.fragment.sql
        ));
        params.extend(branch.state.fragment.params.clone());
    }

    let new_sql = branch_sqls
        .iter()
        .map(|s| format!("({s})"))
        .collect::<Vec<_>>()
        .join(" UNION ALL ");

    Ok(StepOutcome::Folded(Folded {
        state: SqlState {
            fragment: crate::sql::state::SqlFragment::new(new_sql, params),
            columns: Some(left_cols),
            sort_by: None,
            sort_in_fragment: false,
            connection_id: folded.state.connection_id.clone(),
            connection: folded.state.connection.clone(),
        },
        dialect: folded.dialect,
    }))
}

fn take(folded: &Folded, handler: &dyn DialectHandler, count: i64) -> Result<StepOutcome, FatalError> {
    let param = ScalarValue::Int(count);
    let fragment = match folded.dialect {
        Dialect::Postgres | Dialect::SQLite | Dialect::MySql => {
            let sql = format!("SELECT * FROM ({}) AS {ALIAS} LIMIT ?", folded.state.fragment.sql);
            folded.state.wrap(sql, vec![param])
        }
        Dialect::MsSql => {
            let order_by = folded.state.sort_by.as_ref().filter(|s| !s.is_empty()).map(|specs| {
                specs
                    .iter()
                    .map(|s| handler.sort_spec_to_sql(ALIAS, s))
                    .collect::<Vec<_>>()
                    .join(", ")
            });
            let sql = match &order_by {
                Some(ob) => format!(
                    "SELECT TOP (?) * FROM ({}) AS {ALIAS} ORDER BY {ob}",
                    folded.state.fragment.sql
                ),
                None => format!("SELECT TOP (?) * FROM ({}) AS {ALIAS}", folded.state.fragment.sql),
            };
            folded.state.wrap_with_leading_params(sql, vec![param])
        }
    };
    let sort_by = if matches!(folded.dialect, Dialect::MsSql) { None } else { folded.state.sort_by.clone() };
    let sort_in_fragment = matches!(folded.dialect, Dialect::MsSql) && folded.state.sort_by.is_some();
    Ok(StepOutcome::Folded(Folded {
        state: SqlState {
            fragment,
            columns: folded.state.columns.clone(),
            sort_by,
            sort_in_fragment,
            connection_id: folded.state.connection_id.clone(),
            connection: folded.state.connection.clone(),
        },
        dialect: folded.dialect,
    }))
}

fn skip(folded: &Folded, handler: &dyn DialectHandler, count: i64) -> Result<StepOutcome, FatalError> {
    let param = ScalarValue::Int(count);
    let fragment = match folded.dialect {
        Dialect::Postgres => {
            let sql = format!("SELECT * FROM ({}) AS {ALIAS} OFFSET ?", folded.state.fragment.sql);
            folded.state.wrap(sql, vec![param])
        }
        Dialect::SQLite => {
            let sql = format!(
                "SELECT * FROM ({}) AS {ALIAS} LIMIT -1 OFFSET ?",
                folded.state.fragment.sql
            );
            folded.state.wrap(sql, vec![param])
        }
        Dialect::MySql => {
            let sql = format!(
                "SELECT * FROM ({}) AS {ALIAS} LIMIT 18446744073709551615 OFFSET ?",
                folded.state.fragment.sql
            );
            folded.state.wrap(sql, vec![param])
        }
        Dialect::MsSql => {
            let order_by = folded
                .state
                .sort_by
                .as_ref()
                .filter(|s| !s.is_empty())
                .map(|specs| {
                    specs
                        .iter()
                        .map(|s| handler.sort_spec_to_sql(ALIAS, s))
                        .collect::<Vec<_>>()
                        .join(", ")
                })
                .unwrap_or_else(|| "(SELECT NULL)".to_string());
            let sql = format!(
                "SELECT * FROM ({}) AS {ALIAS} ORDER BY {order_by} OFFSET ? ROWS",
                folded.state.fragment.sql
            );
            folded.state.wrap(sql, vec![param])
        }
    };
    Ok(StepOutcome::Folded(Folded {
        state: SqlState {
            fragment,
            columns: folded.state.columns.clone(),
            sort_by: None,
            sort_in_fragment: true,
            connection_id: folded.state.connection_id.clone(),
            connection: folded.state.connection.clone(),
        },
        dialect: folded.dialect,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{
        Comparison, ComparisonOp, FilterPredicate, Query, QuerySource, SortDirection, SortSpec, Step,
    };
    use crate::options::CompileOptions;

    fn db_query(id: &str, sql: &str, dialect: Dialect) -> Query {
        Query::new(
            id,
            QuerySource::Database {
                connection: "db1".into(),
                connection_id: None,
                query: sql.into(),
                dialect: Some(dialect),
                columns: Some(vec!["Region".into(), "Sales".into()]),
            },
        )
    }

    #[test]
    fn scenario_a_select_filter_group_by_folds_natively() {
        let query = db_query("q1", "SELECT * FROM sales", Dialect::Postgres)
            .with_step(Step::new(
                "s1",
                "select",
                QueryOperation::SelectColumns {
                    columns: vec!["Region".into(), "Sales".into()],
                },
            ))
            .with_step(Step::new(
                "s2",
                "filter",
                QueryOperation::FilterRows {
                    predicate: FilterPredicate::Comparison(Comparison {
                        column: "Region".into(),
                        operator: ComparisonOp::Equals,
                        value: Some(ScalarValue::String("East".into())),
                        case_sensitive: None,
                    }),
                },
            ))
            .with_step(Step::new(
                "s3",
                "group",
                QueryOperation::GroupBy {
                    group_columns: vec!["Region".into()],
                    aggregations: vec![crate::ir::Aggregation {
                        column: "Sales".into(),
                        op: AggregationOp::Sum,
                        as_name: Some("Total".into()),
                    }],
                },
            ));
        let options = CompileOptions::default();
        let (plan, explain) = compile(&query, &options).unwrap();
        match plan {
            Plan::Native { sql_or_url, params, .. } => {
                assert!(sql_or_url.contains("WHERE"));
                assert!(sql_or_url.contains("GROUP BY"));
                assert_eq!(params, vec![ScalarValue::String("East".into())]);
            }
            other => panic!("expected native plan, got {other:?}"),
        }
        assert_eq!(explain.steps.len(), 3);
    }

    #[test]
    fn scenario_b_sqlserver_sort_then_take_emits_top_with_order_by() {
        let query = db_query("q1", "SELECT * FROM sales", Dialect::MsSql)
            .with_step(Step::new(
                "s1",
                "sort",
                QueryOperation::SortRows {
                    specs: vec![SortSpec {
                        column: "Sales".into(),
                        direction: SortDirection::Ascending,
                        nulls: Some(crate::ir::NullsOrder::First),
                    }],
                },
            ))
            .with_step(Step::new("s2", "take", QueryOperation::Take { count: 5 }));
        let options = CompileOptions::default();
        let (plan, _explain) = compile(&query, &options).unwrap();
        match plan {
            Plan::Native { sql_or_url, params, .. } => {
                assert!(sql_or_url.contains("TOP (@p1)"));
                assert!(sql_or_url.contains("CASE WHEN"));
                assert_eq!(params, vec![ScalarValue::Int(5)]);
            }
            other => panic!("expected native plan, got {other:?}"),
        }
    }

    #[test]
    fn merge_across_different_connections_breaks_folding() {
        let left = db_query("left", "SELECT * FROM a", Dialect::Postgres).with_step(Step::new(
            "s1",
            "merge",
            QueryOperation::Merge(MergeOp {
                right_query_id: "right".into(),
                join_mode: crate::ir::JoinMode::Flat,
                join_type: JoinType::Left,
                left_keys: crate::ir::MergeKeys::Scalar("Id".into()),
                right_keys: crate::ir::MergeKeys::Scalar("Id".into()),
                new_column_name: None,
                right_columns: None,
            }),
        ));
        let mut right_source_cols = Some(vec!["Id".into(), "Extra".into()]);
        let right = Query::new(
            "right",
            QuerySource::Database {
                connection: "db2".into(),
                connection_id: None,
                query: "SELECT * FROM b".into(),
                dialect: Some(Dialect::Postgres),
                columns: right_source_cols.take(),
            },
        );
        let mut options = CompileOptions::default();
        options.queries.insert("right".to_string(), right);
        let (plan, explain) = compile(&left, &options).unwrap();
        assert!(matches!(plan, Plan::Local { .. }));
        assert_eq!(explain.steps[0].reason, Some(Reason::DifferentConnection));
    }

    #[test]
    fn cyclic_query_reference_breaks_without_overflow() {
        let query = Query::new(
            "q1",
            QuerySource::Query {
                query_id: "q1".to_string(),
            },
        );
        let mut options = CompileOptions::default();
        options.queries.insert("q1".to_string(), query.clone());
        let (plan, _explain) = compile(&query, &options).unwrap();
        assert!(matches!(plan, Plan::Local { .. }));
    }

    #[test]
    fn add_column_prepends_its_params_before_wrapped_fragment_params() {
        let query = db_query("q1", "SELECT * FROM sales", Dialect::SQLite)
            .with_step(Step::new(
                "s1",
                "add",
                QueryOperation::AddColumn {
                    name: "Injected".into(),
                    formula: FormulaExpr::Literal(ScalarValue::String("x".into())),
                },
            ))
            .with_step(Step::new(
                "s2",
                "filter",
                QueryOperation::FilterRows {
                    predicate: FilterPredicate::comparison(
                        "Region",
                        ComparisonOp::Equals,
                        Some(ScalarValue::String("East".into())),
                    ),
                },
            ));
        let options = CompileOptions::default();
        let (plan, _explain) = compile(&query, &options).unwrap();
        match plan {
            Plan::Native { params, .. } => {
                assert_eq!(
                    params,
                    vec![
                        ScalarValue::String("x".into()),
                        ScalarValue::String("East".into())
                    ]
                );
            }
            other => panic!("expected native plan, got {other:?}"),
        }
    }
}
