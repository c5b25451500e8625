//! Filter predicate → OData `$filter` compiler (spec §4.C "Filter predicate →
//! OData"). Shares the same [`FilterPredicate`] algebra as the SQL side
//! ([`crate::sql::expr`]) but targets OData v4 filter syntax directly, with
//! no parameter list — every value is rendered as an inline literal, which is
//! how `$filter` expressions work.

use crate::ir::{Comparison, ComparisonOp, FilterPredicate, ScalarValue};

/// Renders a [`ScalarValue`] as an OData v4 literal. `None` when the value
/// has no portable OData literal form.
fn render_literal(value: &ScalarValue) -> Option<String> {
    Some(match value {
        ScalarValue::Null => "null".to_string(),
        ScalarValue::Bool(b) => b.to_string(),
        ScalarValue::Int(i) => i.to_string(),
        ScalarValue::Float(f) => f.to_string(),
        ScalarValue::Decimal(s) => s.clone(),
        ScalarValue::String(s) => format!("'{}'", s.replace('\'', "''")),
        ScalarValue::Date(s) => s.clone(),
        ScalarValue::DateTime(s) => s.clone(),
        ScalarValue::Time(s) => s.clone(),
        ScalarValue::Duration(s) => s.clone(),
        ScalarValue::Binary(_) => return None,
    })
}

/// Compiles a [`FilterPredicate`] to an OData v4 `$filter` expression.
/// Returns `None` when the predicate can't be folded: a non-scalar
/// comparison value, or a LIKE-family operator against an empty needle
/// (OData's `contains(x, '')` semantics differ from local stringification).
pub fn compile_predicate(pred: &FilterPredicate) -> Option<String> {
    match pred {
        FilterPredicate::And { predicates } => {
            if predicates.is_empty() {
                return Some("true".to_string());
            }
            compile_connective(predicates, "and")
        }
        FilterPredicate::Or { predicates } => {
            if predicates.is_empty() {
                return Some("false".to_string());
            }
            compile_connective(predicates, "or")
        }
        FilterPredicate::Not { predicate } => {
            let inner = compile_predicate(predicate)?;
            Some(format!("(not ({inner}))"))
        }
        FilterPredicate::Comparison(cmp) => compile_comparison(cmp),
    }
}

fn compile_connective(predicates: &[FilterPredicate], connective: &str) -> Option<String> {
    let parts = predicates
        .iter()
        .map(|p| compile_predicate(p).map(|s| format!("({s})")))
        .collect::<Option<Vec<_>>>()?;
    Some(parts.join(&format!(" {connective} ")))
}

fn compile_comparison(cmp: &Comparison) -> Option<String> {
    let col = &cmp.column;

    if cmp.operator.is_nullity_check() {
        return Some(match cmp.operator {
            ComparisonOp::IsNull => format!("{col} eq null"),
            ComparisonOp::IsNotNull => format!("{col} ne null"),
            _ => unreachable!(),
        });
    }

    let value = cmp.value.as_ref()?;

    if cmp.operator.is_ordered() && value.is_null() {
        return Some("false".to_string());
    }

    match cmp.operator {
        ComparisonOp::Equals | ComparisonOp::NotEquals => {
            let op = if cmp.operator == ComparisonOp::Equals { "eq" } else { "ne" };
            let literal = render_literal(value)?;
            Some(format!("{col} {op} {literal}"))
        }
        ComparisonOp::GreaterThan
        | ComparisonOp::GreaterThanOrEqual
        | ComparisonOp::LessThan
        | ComparisonOp::LessThanOrEqual => {
            let op = match cmp.operator {
                ComparisonOp::GreaterThan => "gt",
                ComparisonOp::GreaterThanOrEqual => "ge",
                ComparisonOp::LessThan => "lt",
                ComparisonOp::LessThanOrEqual => "le",
                _ => unreachable!(),
            };
            let literal = render_literal(value)?;
            Some(format!("{col} {op} {literal}"))
        }
        ComparisonOp::Contains | ComparisonOp::StartsWith | ComparisonOp::EndsWith => {
            let needle = value.stringify();
            if needle.is_empty() {
                return None;
            }
            let escaped = needle.replace('\'', "''");
            let func = match cmp.operator {
                ComparisonOp::Contains => "contains",
                ComparisonOp::StartsWith => "startswith",
                ComparisonOp::EndsWith => "endswith",
                _ => unreachable!(),
            };
            let (col_expr, needle_expr) = if cmp.is_case_sensitive() {
                (col.clone(), format!("'{escaped}'"))
            } else {
                (
                    format!("tolower(cast({col}, Edm.String))"),
                    format!("tolower('{escaped}')"),
                )
            };
            Some(format!("{func}({col_expr}, {needle_expr})"))
        }
        ComparisonOp::IsNull | ComparisonOp::IsNotNull => unreachable!(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::ScalarValue;

    #[test]
    fn equals_renders_inline_literal() {
        let pred = FilterPredicate::comparison("Region", ComparisonOp::Equals, Some(ScalarValue::String("East".into())));
        assert_eq!(compile_predicate(&pred).unwrap(), "Region eq 'East'");
    }

    #[test]
    fn ordered_comparison_against_null_folds_to_false() {
        let pred = FilterPredicate::comparison("Sales", ComparisonOp::GreaterThan, Some(ScalarValue::Null));
        assert_eq!(compile_predicate(&pred).unwrap(), "false");
    }

    #[test]
    fn contains_wraps_in_tolower_by_default() {
        let pred = FilterPredicate::comparison("Name", ComparisonOp::Contains, Some(ScalarValue::String("abc".into())));
        let sql = compile_predicate(&pred).unwrap();
        assert!(sql.starts_with("contains(tolower("));
    }

    #[test]
    fn empty_needle_like_family_is_refused() {
        let pred = FilterPredicate::comparison("Name", ComparisonOp::StartsWith, Some(ScalarValue::String(String::new())));
        assert!(compile_predicate(&pred).is_none());
    }

    #[test]
    fn and_of_two_comparisons_parenthesises_each_branch() {
        let pred = FilterPredicate::And {
            predicates: vec![
                FilterPredicate::comparison("A", ComparisonOp::Equals, Some(ScalarValue::Int(1))),
                FilterPredicate::comparison("B", ComparisonOp::Equals, Some(ScalarValue::Int(2))),
            ],
        };
        assert_eq!(compile_predicate(&pred).unwrap(), "(A eq 1) and (B eq 2)");
    }
}
