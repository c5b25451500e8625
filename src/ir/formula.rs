//! The restricted row-formula expression language used by `addColumn` and
//! identity `transformColumns` steps (spec §4.C "Row-formula → SQL").

use serde::{Deserialize, Serialize};

use super::value::ScalarValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "camelCase")]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
pub enum BinaryOp {
    #[strum(serialize = "+")]
    Add,
    #[strum(serialize = "-")]
    Sub,
    #[strum(serialize = "*")]
    Mul,
    #[strum(serialize = "/")]
    Div,
    #[strum(serialize = "==")]
    Eq,
    #[strum(serialize = "!=")]
    Ne,
    #[strum(serialize = ">")]
    Gt,
    #[strum(serialize = ">=")]
    Ge,
    #[strum(serialize = "<")]
    Lt,
    #[strum(serialize = "<=")]
    Le,
    #[strum(serialize = "&&")]
    And,
    #[strum(serialize = "||")]
    Or,
}

/// Whitelisted function calls. Anything outside this set is a bare
/// host-function reference and is never folded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum FormulaCall {
    TextUpper,
    TextLower,
    TextTrim,
    TextLength,
    TextContains,
    NumberRound,
    DateAddDays,
    DateFromText,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FormulaExpr {
    Literal(ScalarValue),
    /// Reference to another column on the current row.
    Column(String),
    /// The implicit row value, `_`, used by identity `transformColumns`.
    Value,
    Unary {
        op: UnaryOp,
        expr: Box<FormulaExpr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<FormulaExpr>,
        right: Box<FormulaExpr>,
    },
    Ternary {
        cond: Box<FormulaExpr>,
        if_true: Box<FormulaExpr>,
        if_false: Box<FormulaExpr>,
    },
    Call {
        func: FormulaCall,
        args: Vec<FormulaExpr>,
    },
}

impl FormulaExpr {
    /// Whether this formula is exactly the identity row-value reference,
    /// which is the only shape `transformColumns` folds (spec §4.D).
    pub fn is_identity(&self) -> bool {
        matches!(self, FormulaExpr::Value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_formula_is_bare_value() {
        assert!(FormulaExpr::Value.is_identity());
        assert!(!FormulaExpr::Literal(ScalarValue::Null).is_identity());
    }
}
