//! Invariant 10: the placeholder normaliser never rewrites a `?` that sits
//! inside a lexical context that isn't an actual bind site — single-quoted
//! strings, quoted identifiers, comments, or a dollar-quoted body. Exercised
//! against the public API only, by planting adversarial `?`s in a source
//! query's own SQL text and folding one real parameter on top of it.

use foldc::{ComparisonOp, CompileOptions, Dialect, FilterPredicate, Plan, Query, QueryOperation, QuerySource, ScalarValue, Step};

fn source_query(sql: &str) -> Query {
    Query::new(
        "q1",
        QuerySource::Database {
            connection: "db1".into(),
            connection_id: None,
            query: sql.to_string(),
            dialect: Some(Dialect::Postgres),
            columns: None,
        },
    )
}

fn with_one_filter(query: Query) -> Query {
    query.with_step(Step::new(
        "s1",
        "Filtered Rows",
        QueryOperation::FilterRows {
            predicate: FilterPredicate::comparison(
                "Region",
                ComparisonOp::Equals,
                Some(ScalarValue::String("East".into())),
            ),
        },
    ))
}

fn compiled_native_sql(query: &Query) -> String {
    let options = CompileOptions::default();
    let (plan, _explain) = foldc::compile_sql(query, &options).unwrap();
    match plan {
        Plan::Native { sql_or_url, .. } => sql_or_url,
        other => panic!("expected native plan, got {other:?}"),
    }
}

#[test]
fn question_mark_inside_single_quoted_string_is_untouched() {
    let query = with_one_filter(source_query("SELECT * FROM sales WHERE note = 'what?'"));
    let sql = compiled_native_sql(&query);
    assert!(sql.contains("'what?'"));
    assert!(sql.contains("$1"));
    assert!(!sql.contains("$2"));
}

#[test]
fn question_mark_inside_double_quoted_identifier_is_untouched() {
    let query = with_one_filter(source_query(r#"SELECT "weird?col" FROM sales"#));
    let sql = compiled_native_sql(&query);
    assert!(sql.contains(r#""weird?col""#));
    assert!(sql.contains("$1"));
}

#[test]
fn question_mark_inside_line_comment_is_untouched() {
    let query = with_one_filter(source_query("SELECT * FROM sales -- is this ok?\n"));
    let sql = compiled_native_sql(&query);
    assert!(sql.contains("is this ok?"));
    assert!(sql.contains("$1"));
}

#[test]
fn question_mark_inside_block_comment_is_untouched() {
    let query = with_one_filter(source_query("SELECT * FROM sales /* really? */"));
    let sql = compiled_native_sql(&query);
    assert!(sql.contains("really?"));
    assert!(sql.contains("$1"));
}

#[test]
fn question_mark_inside_dollar_quoted_body_is_untouched() {
    let query = with_one_filter(source_query("SELECT * FROM sales WHERE note = $tag$has a ? inside$tag$"));
    let sql = compiled_native_sql(&query);
    assert!(sql.contains("$tag$has a ? inside$tag$"));
    assert!(sql.contains("$1"));
}

/// Property-style sweep (§8 invariant 3): adversarial strings carried as a
/// parameter value must never be inlined into the SQL text, only appear in
/// `params`.
#[test]
fn adversarial_values_round_trip_through_params_never_inlined() {
    let adversarial = [
        "plain",
        "with'quote",
        "with\";semicolon",
        "with--dashdash",
        "with/*block*/",
        "with$tag$body",
        "unicode \u{1f980}\u{00e9}\u{4e2d}",
    ];
    for value in adversarial {
        let query = source_query("SELECT * FROM sales").with_step(Step::new(
            "s1",
            "Filtered Rows",
            QueryOperation::FilterRows {
                predicate: FilterPredicate::comparison(
                    "Region",
                    ComparisonOp::Equals,
                    Some(ScalarValue::String(value.to_string())),
                ),
            },
        ));
        let options = CompileOptions::default();
        let (plan, _explain) = foldc::compile_sql(&query, &options).unwrap();
        match plan {
            Plan::Native { sql_or_url, params, .. } => {
                assert!(!sql_or_url.contains(value), "value {value:?} leaked into SQL text");
                assert_eq!(params, vec![ScalarValue::String(value.to_string())]);
            }
            other => panic!("expected native plan, got {other:?}"),
        }
    }
}
