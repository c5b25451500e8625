//! The predicate and row-formula compilers, SQL side (spec §4.C).

use crate::ir::{
    BinaryOp, Comparison, ComparisonOp, FilterPredicate, FormulaCall, FormulaExpr, ScalarValue,
    UnaryOp,
};
use crate::sql::dialect::{Dialect, DialectHandler};

/// A compiled SQL expression: its text plus the parameters it binds, in the
/// order they occur in the text.
pub struct Compiled {
    pub sql: String,
    pub params: Vec<ScalarValue>,
}

impl Compiled {
    fn leaf(sql: impl Into<String>) -> Self {
        Compiled {
            sql: sql.into(),
            params: Vec::new(),
        }
    }
}

fn escape_like_needle(needle: &str) -> String {
    needle
        .replace('!', "!!")
        .replace('%', "!%")
        .replace('_', "!_")
}

/// Reformats a `Date`/`DateTime` scalar through the dialect's own date-param
/// convention before it is bound as a parameter; every other variant passes
/// through unchanged.
fn format_param_value(value: &ScalarValue, handler: &dyn DialectHandler) -> ScalarValue {
    match value {
        ScalarValue::Date(s) => ScalarValue::Date(handler.format_date_param(s)),
        ScalarValue::DateTime(s) => ScalarValue::DateTime(handler.format_date_param(s)),
        other => other.clone(),
    }
}

/// Compiles a [`FilterPredicate`] against rows aliased `alias`. Returns
/// `None` when the predicate cannot be folded (spec: non-scalar comparison
/// values; LIKE-family operators are exempt since they always stringify —
/// moot here since every [`ScalarValue`] is SQL-scalar by construction, but
/// kept so the shape matches the spec's refusal path).
pub fn compile_predicate(
    pred: &FilterPredicate,
    alias: &str,
    handler: &dyn DialectHandler,
) -> Option<Compiled> {
    match pred {
        FilterPredicate::And { predicates } => {
            if predicates.is_empty() {
                return Some(Compiled::leaf("TRUE"));
            }
            compile_connective(predicates, "AND", alias, handler)
        }
        FilterPredicate::Or { predicates } => {
            if predicates.is_empty() {
                return Some(Compiled::leaf("FALSE"));
            }
            compile_connective(predicates, "OR", alias, handler)
        }
        FilterPredicate::Not { predicate } => {
            let inner = compile_predicate(predicate, alias, handler)?;
            Some(Compiled {
                sql: format!("(NOT ({}))", inner.sql),
                params: inner.params,
            })
        }
        FilterPredicate::Comparison(cmp) => compile_comparison(cmp, alias, handler),
    }
}

fn compile_connective(
    predicates: &[FilterPredicate],
    connective: &str,
    alias: &str,
    handler: &dyn DialectHandler,
) -> Option<Compiled> {
    let mut parts = Vec::with_capacity(predicates.len());
    let mut params = Vec::new();
    for p in predicates {
        let compiled = compile_predicate(p, alias, handler)?;
        parts.push(format!("({})", compiled.sql));
        params.extend(compiled.params);
    }
    Some(Compiled {
        sql: parts.join(&format!(" {connective} ")),
        params,
    })
}

fn compile_comparison(
    cmp: &Comparison,
    alias: &str,
    handler: &dyn DialectHandler,
) -> Option<Compiled> {
    let col = format!("{alias}.{}", handler.quote_identifier(&cmp.column));

    if cmp.operator.is_nullity_check() {
        let sql = match cmp.operator {
            ComparisonOp::IsNull => format!("{col} IS NULL"),
            ComparisonOp::IsNotNull => format!("{col} IS NOT NULL"),
            _ => unreachable!(),
        };
        return Some(Compiled::leaf(sql));
    }

    let value = cmp.value.as_ref()?;
    if !value.is_sql_scalar() && !cmp.operator.is_like_family() {
        return None;
    }

    if cmp.operator.is_ordered() && value.is_null() {
        return Some(Compiled::leaf("FALSE"));
    }

    match cmp.operator {
        ComparisonOp::Equals | ComparisonOp::NotEquals => {
            let op_sql = if cmp.operator == ComparisonOp::Equals {
                "="
            } else {
                "<>"
            };
            Some(Compiled {
                sql: format!("{col} {op_sql} ?"),
                params: vec![format_param_value(value, handler)],
            })
        }
        ComparisonOp::GreaterThan
        | ComparisonOp::GreaterThanOrEqual
        | ComparisonOp::LessThan
        | ComparisonOp::LessThanOrEqual => {
            let op_sql = match cmp.operator {
                ComparisonOp::GreaterThan => ">",
                ComparisonOp::GreaterThanOrEqual => ">=",
                ComparisonOp::LessThan => "<",
                ComparisonOp::LessThanOrEqual => "<=",
                _ => unreachable!(),
            };
            Some(Compiled {
                sql: format!("{col} {op_sql} ?"),
                params: vec![format_param_value(value, handler)],
            })
        }
        ComparisonOp::Contains | ComparisonOp::StartsWith | ComparisonOp::EndsWith => {
            let needle = escape_like_needle(&value.stringify());
            let pattern = match cmp.operator {
                ComparisonOp::Contains => format!("%{needle}%"),
                ComparisonOp::StartsWith => format!("{needle}%"),
                ComparisonOp::EndsWith => format!("%{needle}"),
                _ => unreachable!(),
            };
            let mut haystack = format!("COALESCE({}, '')", handler.cast_text(&col));
            let mut pattern_expr = handler.cast_text("?");
            if !cmp.is_case_sensitive() {
                haystack = format!("LOWER({haystack})");
                pattern_expr = format!("LOWER({pattern_expr})");
            }
            Some(Compiled {
                sql: format!("{haystack} LIKE {pattern_expr} ESCAPE '!'"),
                params: vec![ScalarValue::String(pattern)],
            })
        }
        ComparisonOp::IsNull | ComparisonOp::IsNotNull => unreachable!(),
    }
}

/// Whether a formula node, compiled generically, produces a SQL boolean —
/// used to know when SQL Server needs a `CASE WHEN ... THEN bit ELSE bit END`
/// wrapper to present it in a value position.
fn produces_boolean(expr: &FormulaExpr) -> bool {
    matches!(
        expr,
        FormulaExpr::Unary {
            op: UnaryOp::Not,
            ..
        } | FormulaExpr::Binary {
            op: BinaryOp::Eq
                | BinaryOp::Ne
                | BinaryOp::Gt
                | BinaryOp::Ge
                | BinaryOp::Lt
                | BinaryOp::Le
                | BinaryOp::And
                | BinaryOp::Or,
            ..
        }
    )
}

/// Compiles `expr` as a boolean operand (the condition of a ternary, or an
/// operand of `&&`/`||`/unary `!`). A bare column reference needs explicit
/// `= 1` coercion under SQL Server, which has no implicit bit-to-boolean
/// conversion in predicate position.
fn compile_boolean_operand(
    expr: &FormulaExpr,
    alias: &str,
    handler: &dyn DialectHandler,
) -> Option<Compiled> {
    if let FormulaExpr::Column(name) = expr {
        if handler.dialect() == Dialect::MsSql {
            let col = format!("{alias}.{}", handler.quote_identifier(name));
            return Some(Compiled::leaf(format!("{col} = 1")));
        }
    }
    compile_formula(expr, alias, handler)
}

/// Compiles a [`FormulaExpr`] for `addColumn` (or the identity `changeType`
/// case, though that path never reaches the `Call`/`Binary` arms). Returns
/// `None` for shapes outside the whitelist — a bare `Value` node used
/// outside the one case the engine recognises specially, or a `+` whose
/// operands look string-typed (string concatenation via `+` is refused to
/// avoid the operator-polymorphism trap; use a dedicated call instead).
pub fn compile_formula(
    expr: &FormulaExpr,
    alias: &str,
    handler: &dyn DialectHandler,
) -> Option<Compiled> {
    match expr {
        FormulaExpr::Literal(v) => Some(Compiled {
            sql: "?".to_string(),
            params: vec![format_param_value(v, handler)],
        }),
        FormulaExpr::Column(name) => Some(Compiled::leaf(format!(
            "{alias}.{}",
            handler.quote_identifier(name)
        ))),
        FormulaExpr::Value => None,
        FormulaExpr::Unary { op, expr } => match op {
            UnaryOp::Neg => {
                let inner = compile_formula(expr, alias, handler)?;
                Some(Compiled {
                    sql: format!("(-{})", inner.sql),
                    params: inner.params,
                })
            }
            UnaryOp::Not => {
                let inner = compile_boolean_operand(expr, alias, handler)?;
                Some(Compiled {
                    sql: format!("(NOT ({}))", inner.sql),
                    params: inner.params,
                })
            }
        },
        FormulaExpr::Binary { op, left, right } => compile_binary(*op, left, right, alias, handler),
        FormulaExpr::Ternary {
            cond,
            if_true,
            if_false,
        } => {
            let cond = compile_boolean_operand(cond, alias, handler)?;
            let if_true = compile_formula(if_true, alias, handler)?;
            let if_false = compile_formula(if_false, alias, handler)?;
            let mut params = cond.params;
            params.extend(if_true.params);
            params.extend(if_false.params);
            Some(Compiled {
                sql: format!(
                    "(CASE WHEN {} THEN {} ELSE {} END)",
                    cond.sql, if_true.sql, if_false.sql
                ),
                params,
            })
        }
        FormulaExpr::Call { func, args } => compile_call(*func, args, alias, handler),
    }
}

/// Like [`compile_formula`] but, on SQL Server, additionally coerces a
/// boolean-producing expression to `BIT` so it can appear in a SELECT list
/// value position. Other dialects return a native boolean unchanged.
pub fn compile_formula_value(
    expr: &FormulaExpr,
    alias: &str,
    handler: &dyn DialectHandler,
) -> Option<Compiled> {
    if produces_boolean(expr) && handler.dialect() == Dialect::MsSql {
        let inner = compile_boolean_operand(expr, alias, handler)?;
        return Some(Compiled {
            sql: format!(
                "(CASE WHEN {} THEN CAST(1 AS BIT) ELSE CAST(0 AS BIT) END)",
                inner.sql
            ),
            params: inner.params,
        });
    }
    compile_formula(expr, alias, handler)
}

fn is_string_literal(expr: &FormulaExpr) -> bool {
    matches!(expr, FormulaExpr::Literal(ScalarValue::String(_)))
}

fn compile_binary(
    op: BinaryOp,
    left: &FormulaExpr,
    right: &FormulaExpr,
    alias: &str,
    handler: &dyn DialectHandler,
) -> Option<Compiled> {
    match op {
        BinaryOp::Add => {
            if is_string_literal(left) || is_string_literal(right) {
                return None;
            }
            let l = compile_formula(left, alias, handler)?;
            let r = compile_formula(right, alias, handler)?;
            let mut params = l.params;
            params.extend(r.params);
            Some(Compiled {
                sql: format!("({} + {})", l.sql, r.sql),
                params,
            })
        }
        BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div => {
            let symbol = match op {
                BinaryOp::Sub => "-",
                BinaryOp::Mul => "*",
                BinaryOp::Div => "/",
                _ => unreachable!(),
            };
            let l = compile_formula(left, alias, handler)?;
            let r = compile_formula(right, alias, handler)?;
            let mut params = l.params;
            params.extend(r.params);
            Some(Compiled {
                sql: format!("({} {symbol} {})", l.sql, r.sql),
                params,
            })
        }
        BinaryOp::Eq | BinaryOp::Ne => {
            if matches!(right, FormulaExpr::Literal(ScalarValue::Null)) {
                let l = compile_formula(left, alias, handler)?;
                let suffix = if op == BinaryOp::Eq {
                    "IS NULL"
                } else {
                    "IS NOT NULL"
                };
                return Some(Compiled {
                    sql: format!("({} {suffix})", l.sql),
                    params: l.params,
                });
            }
            let symbol = if op == BinaryOp::Eq { "=" } else { "<>" };
            let l = compile_formula(left, alias, handler)?;
            let r = compile_formula(right, alias, handler)?;
            let mut params = l.params;
            params.extend(r.params);
            Some(Compiled {
                sql: format!("({} {symbol} {})", l.sql, r.sql),
                params,
            })
        }
        BinaryOp::Gt | BinaryOp::Ge | BinaryOp::Lt | BinaryOp::Le => {
            let symbol = match op {
                BinaryOp::Gt => ">",
                BinaryOp::Ge => ">=",
                BinaryOp::Lt => "<",
                BinaryOp::Le => "<=",
                _ => unreachable!(),
            };
            let l = compile_formula(left, alias, handler)?;
            let r = compile_formula(right, alias, handler)?;
            let mut params = l.params;
            params.extend(r.params);
            Some(Compiled {
                sql: format!("({} {symbol} {})", l.sql, r.sql),
                params,
            })
        }
        BinaryOp::And | BinaryOp::Or => {
            let connective = if op == BinaryOp::And { "AND" } else { "OR" };
            let l = compile_boolean_operand(left, alias, handler)?;
            let r = compile_boolean_operand(right, alias, handler)?;
            let mut params = l.params;
            params.extend(r.params);
            Some(Compiled {
                sql: format!("({} {connective} {})", l.sql, r.sql),
                params,
            })
        }
    }
}

fn compile_call(
    func: FormulaCall,
    args: &[FormulaExpr],
    alias: &str,
    handler: &dyn DialectHandler,
) -> Option<Compiled> {
    let compiled_args: Vec<Compiled> = args
        .iter()
        .map(|a| compile_formula(a, alias, handler))
        .collect::<Option<Vec<_>>>()?;
    let mut params = Vec::new();
    for a in &compiled_args {
        params.extend(a.params.iter().cloned());
    }
    let arg_sql: Vec<&str> = compiled_args.iter().map(|c| c.sql.as_str()).collect();

    let sql = match func {
        FormulaCall::TextUpper => format!("UPPER({})", arg_sql.first()?),
        FormulaCall::TextLower => format!("LOWER({})", arg_sql.first()?),
        FormulaCall::TextTrim => format!("TRIM({})", arg_sql.first()?),
        FormulaCall::TextLength => format!("{}({})", handler.text_length_fn(), arg_sql.first()?),
        FormulaCall::TextContains => {
            let haystack = arg_sql.first()?;
            let needle = arg_sql.get(1)?;
            let pattern = handler.concat(&["'%'".to_string(), needle.to_string(), "'%'".to_string()]);
            format!("({haystack} LIKE {pattern})")
        }
        FormulaCall::NumberRound => {
            format!("ROUND({}, {})", arg_sql.first()?, arg_sql.get(1).unwrap_or(&"0"))
        }
        FormulaCall::DateAddDays => handler.date_add_days(arg_sql.first()?, arg_sql.get(1)?),
        FormulaCall::DateFromText => format!("CAST({} AS DATE)", arg_sql.first()?),
    };

    Some(Compiled { sql, params })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::ComparisonOp;
    use crate::sql::dialect::PostgresDialect;

    #[test]
    fn equals_against_null_emits_param_not_is_null() {
        let handler = PostgresDialect;
        let pred = FilterPredicate::comparison("Region", ComparisonOp::Equals, Some(ScalarValue::Null));
        let compiled = compile_predicate(&pred, "t", &handler).unwrap();
        assert_eq!(compiled.sql, r#"t."Region" = ?"#);
        assert_eq!(compiled.params, vec![ScalarValue::Null]);
    }

    #[test]
    fn ordered_comparison_against_null_folds_to_false_literal() {
        let handler = PostgresDialect;
        let pred = FilterPredicate::comparison(
            "Sales",
            ComparisonOp::GreaterThan,
            Some(ScalarValue::Null),
        );
        let compiled = compile_predicate(&pred, "t", &handler).unwrap();
        assert_eq!(compiled.sql, "FALSE");
        assert!(compiled.params.is_empty());
    }

    #[test]
    fn contains_builds_escaped_like_pattern_case_insensitive_by_default() {
        let handler = PostgresDialect;
        let pred = FilterPredicate::comparison(
            "Name",
            ComparisonOp::Contains,
            Some(ScalarValue::String("50%_off".into())),
        );
        let compiled = compile_predicate(&pred, "t", &handler).unwrap();
        assert!(compiled.sql.contains("LOWER"));
        assert!(compiled.sql.ends_with("ESCAPE '!'"));
        assert_eq!(
            compiled.params,
            vec![ScalarValue::String("%50!%!_off%".into())]
        );
    }

    #[test]
    fn empty_and_folds_to_true() {
        let handler = PostgresDialect;
        let pred = FilterPredicate::And { predicates: vec![] };
        let compiled = compile_predicate(&pred, "t", &handler).unwrap();
        assert_eq!(compiled.sql, "TRUE");
    }

    #[test]
    fn string_literal_plus_is_refused() {
        let handler = PostgresDialect;
        let expr = FormulaExpr::Binary {
            op: BinaryOp::Add,
            left: Box::new(FormulaExpr::Literal(ScalarValue::String("a".into()))),
            right: Box::new(FormulaExpr::Column("b".into())),
        };
        assert!(compile_formula(&expr, "t", &handler).is_none());
    }

    #[test]
    fn literal_is_always_parameterised() {
        let handler = PostgresDialect;
        let expr = FormulaExpr::Literal(ScalarValue::String("x".into()));
        let compiled = compile_formula(&expr, "t", &handler).unwrap();
        assert_eq!(compiled.sql, "?");
        assert_eq!(compiled.params, vec![ScalarValue::String("x".into())]);
    }

    #[test]
    fn mysql_datetime_comparison_param_is_reformatted_for_the_driver() {
        use crate::sql::dialect::MySqlDialect;

        let handler = MySqlDialect;
        let pred = FilterPredicate::comparison(
            "CreatedAt",
            ComparisonOp::Equals,
            Some(ScalarValue::DateTime("2024-01-02T03:04:05Z".into())),
        );
        let compiled = compile_predicate(&pred, "t", &handler).unwrap();
        assert_eq!(
            compiled.params,
            vec![ScalarValue::DateTime("2024-01-02 03:04:05".into())]
        );
    }
}
