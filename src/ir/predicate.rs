//! The filter-predicate algebra shared by the SQL and OData compilers.

use serde::{Deserialize, Serialize};

use super::value::ScalarValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "camelCase")]
pub enum ComparisonOp {
    Equals,
    NotEquals,
    GreaterThan,
    GreaterThanOrEqual,
    LessThan,
    LessThanOrEqual,
    Contains,
    StartsWith,
    EndsWith,
    IsNull,
    IsNotNull,
}

impl ComparisonOp {
    pub fn is_ordered(&self) -> bool {
        matches!(
            self,
            ComparisonOp::GreaterThan
                | ComparisonOp::GreaterThanOrEqual
                | ComparisonOp::LessThan
                | ComparisonOp::LessThanOrEqual
        )
    }

    pub fn is_like_family(&self) -> bool {
        matches!(
            self,
            ComparisonOp::Contains | ComparisonOp::StartsWith | ComparisonOp::EndsWith
        )
    }

    pub fn is_nullity_check(&self) -> bool {
        matches!(self, ComparisonOp::IsNull | ComparisonOp::IsNotNull)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comparison {
    pub column: String,
    pub operator: ComparisonOp,
    pub value: Option<ScalarValue>,
    /// Defaults to `false` (case-insensitive) when absent. `equals`/
    /// `notEquals` ignore this flag entirely and always compare
    /// case-sensitively regardless of what is requested here; only the
    /// LIKE-family operators honour it.
    pub case_sensitive: Option<bool>,
}

impl Comparison {
    pub fn is_case_sensitive(&self) -> bool {
        self.case_sensitive.unwrap_or(false)
    }
}

/// Recursive filter-predicate algebra. Shared between the SQL and OData
/// compilers; each target compiles this same tree to its own syntax.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum FilterPredicate {
    And { predicates: Vec<FilterPredicate> },
    Or { predicates: Vec<FilterPredicate> },
    Not { predicate: Box<FilterPredicate> },
    Comparison(Comparison),
}

impl FilterPredicate {
    pub fn comparison(
        column: impl Into<String>,
        operator: ComparisonOp,
        value: Option<ScalarValue>,
    ) -> Self {
        FilterPredicate::Comparison(Comparison {
            column: column.into(),
            operator,
            value,
            case_sensitive: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordered_ops_exclude_equality() {
        assert!(ComparisonOp::GreaterThan.is_ordered());
        assert!(!ComparisonOp::Equals.is_ordered());
    }

    #[test]
    fn default_case_sensitivity_is_false() {
        let cmp = Comparison {
            column: "Name".into(),
            operator: ComparisonOp::Contains,
            value: Some(ScalarValue::String("a".into())),
            case_sensitive: None,
        };
        assert!(!cmp.is_case_sensitive());
    }
}
