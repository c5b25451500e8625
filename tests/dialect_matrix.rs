//! Cross-dialect integration tests, parameterised with `rstest` (spec
//! §10.4 "test tooling"), against the public API only.

use rstest::rstest;

use foldc::{CompileOptions, Dialect, Plan, Query, QueryOperation, QuerySource, Step};

fn db_query(dialect: Dialect, column: &str) -> Query {
    Query::new(
        "q1",
        QuerySource::Database {
            connection: "db1".into(),
            connection_id: None,
            query: "SELECT * FROM sales".into(),
            dialect: Some(dialect),
            columns: Some(vec![column.to_string()]),
        },
    )
}

/// Invariant 4: identifier quoting round-trips a dialect's own quote
/// character by doubling it, across all four dialects.
#[rstest]
#[case(Dialect::Postgres, r#"wei"rd"#, r#""wei""rd""#)]
#[case(Dialect::SQLite, r#"wei"rd"#, r#""wei""rd""#)]
#[case(Dialect::MySql, "wei`rd", "`wei``rd`")]
#[case(Dialect::MsSql, "a]b", "[a]]b]")]
fn identifier_quoting_doubles_the_quote_character(
    #[case] dialect: Dialect,
    #[case] column: &str,
    #[case] expected_quoted: &str,
) {
    let query = db_query(dialect, column).with_step(Step::new(
        "s1",
        "Selected Columns",
        QueryOperation::SelectColumns {
            columns: vec![column.to_string()],
        },
    ));
    let options = CompileOptions::default();
    let (plan, _explain) = foldc::compile_sql(&query, &options).unwrap();
    match plan {
        Plan::Native { sql_or_url, .. } => assert!(
            sql_or_url.contains(expected_quoted),
            "expected {sql_or_url:?} to contain {expected_quoted:?}"
        ),
        other => panic!("expected native plan, got {other:?}"),
    }
}

/// `take` then `skip` folds on every dialect, each emitting its own
/// pagination syntax.
#[rstest]
#[case(Dialect::Postgres, "LIMIT @@", "OFFSET @@")]
#[case(Dialect::SQLite, "LIMIT @@", "OFFSET @@")]
#[case(Dialect::MySql, "LIMIT @@", "OFFSET @@")]
#[case(Dialect::MsSql, "TOP (@@)", "OFFSET @@ ROWS")]
fn take_then_skip_folds_on_every_dialect(
    #[case] dialect: Dialect,
    #[case] take_marker: &str,
    #[case] skip_marker: &str,
) {
    let query = db_query(dialect, "Sales")
        .with_step(Step::new("s1", "Kept First Rows", QueryOperation::Take { count: 10 }))
        .with_step(Step::new("s2", "Skipped Rows", QueryOperation::Skip { count: 5 }));
    let options = CompileOptions::default();
    let (plan, explain) = foldc::compile_sql(&query, &options).unwrap();
    assert_eq!(explain.steps.len(), 2);
    match plan {
        Plan::Native { sql_or_url, .. } => {
            let placeholder = match dialect {
                Dialect::Postgres => "$1",
                Dialect::SQLite | Dialect::MySql => "?",
                Dialect::MsSql => "@p1",
            };
            assert!(sql_or_url.contains(&take_marker.replace("@@", placeholder)));
            let skip_placeholder = match dialect {
                Dialect::Postgres => "$2",
                Dialect::SQLite | Dialect::MySql => "?",
                Dialect::MsSql => "@p2",
            };
            assert!(sql_or_url.contains(&skip_marker.replace("@@", skip_placeholder)));
        }
        other => panic!("expected native plan, got {other:?}"),
    }
}
