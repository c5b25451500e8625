//! Dynamically-typed scalar values that can flow through predicates, row
//! formulas, and limit/offset arguments.

use enum_as_inner::EnumAsInner;
use serde::{Deserialize, Serialize};

/// A value carried by a [`crate::ir::FilterPredicate::Comparison`] or a row
/// formula literal.
///
/// Only the variants here may ever be emitted as a SQL or OData parameter.
/// Anything a host hands the compiler outside of this set (arbitrary byte
/// arrays, opaque host objects, nested tables) breaks folding at the
/// predicate-value check described in the spec's "Dynamic typing" note.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, EnumAsInner)]
pub enum ScalarValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// String-backed to avoid floating-point rounding of exact decimals.
    Decimal(String),
    String(String),
    Binary(Vec<u8>),
    Date(String),
    /// ISO-8601 datetime, may carry a UTC offset.
    DateTime(String),
    Time(String),
    /// ISO-8601 duration, e.g. `PT1H30M`.
    Duration(String),
}

impl ScalarValue {
    /// Whether this value may be emitted as a SQL bind parameter.
    ///
    /// Every variant of `ScalarValue` is SQL-scalar by construction — this
    /// exists so callers that hold a wider host value type can check before
    /// constructing a `ScalarValue` at all, and so `Self` stays obviously
    /// exhaustive as the enum grows.
    pub fn is_sql_scalar(&self) -> bool {
        true
    }

    /// Stringifies the value the way the local (row-at-a-time) engine would
    /// when asked to treat it as text, e.g. for `contains`/`startsWith`.
    /// `Null` stringifies to the empty string, matching local semantics.
    pub fn stringify(&self) -> String {
        match self {
            ScalarValue::Null => String::new(),
            ScalarValue::Bool(b) => b.to_string(),
            ScalarValue::Int(i) => i.to_string(),
            ScalarValue::Float(f) => f.to_string(),
            ScalarValue::Decimal(s)
            | ScalarValue::String(s)
            | ScalarValue::Date(s)
            | ScalarValue::DateTime(s)
            | ScalarValue::Time(s)
            | ScalarValue::Duration(s) => s.clone(),
            ScalarValue::Binary(b) => format!("{b:?}"),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, ScalarValue::Null)
    }
}
