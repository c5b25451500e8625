//! Integration tests for the lettered OData scenarios, against the public
//! API only (`foldc::compile_odata`).

use foldc::{Comparison, ComparisonOp, Plan, Query, QueryOperation, QuerySource, ScalarValue, Step};

fn odata_query(id: &str, url: &str) -> Query {
    Query::new(id, QuerySource::OData { url: url.to_string() })
}

/// Scenario (c): an existing `$top=5` wins over a later, looser `take 10`.
#[test]
fn existing_top_caps_a_later_looser_take() {
    let query = odata_query("q1", "https://x/odata/P?$top=5")
        .with_step(Step::new("s1", "Kept First Rows", QueryOperation::Take { count: 10 }));

    let (plan, explain) = foldc::compile_odata(&query).unwrap();
    assert_eq!(explain.steps.len(), 1);
    match plan {
        Plan::Native { sql_or_url, .. } => assert!(sql_or_url.contains("$top=5")),
        other => panic!("expected native plan, got {other:?}"),
    }
}

/// Scenario (d): `skip` folds into `$skip`, but a filter arriving after
/// pagination has already started can't be expressed and runs locally.
#[test]
fn skip_then_filter_yields_hybrid_with_local_filter() {
    let query = odata_query("q1", "https://x/odata/P")
        .with_step(Step::new("s1", "Skipped Rows", QueryOperation::Skip { count: 5 }))
        .with_step(Step::new(
            "s2",
            "Filtered Rows",
            QueryOperation::FilterRows {
                predicate: foldc::FilterPredicate::Comparison(Comparison {
                    column: "Price".into(),
                    operator: ComparisonOp::GreaterThan,
                    value: Some(ScalarValue::Int(20)),
                    case_sensitive: None,
                }),
            },
        ));

    let (plan, explain) = foldc::compile_odata(&query).unwrap();
    match plan {
        Plan::Hybrid { sql_or_url, local_steps, .. } => {
            assert!(sql_or_url.contains("$skip=5"));
            assert_eq!(local_steps, vec!["s2".to_string()]);
        }
        other => panic!("expected hybrid plan, got {other:?}"),
    }
    assert_eq!(explain.steps[1].reason, Some(foldc::Reason::UnsupportedOp));
}
