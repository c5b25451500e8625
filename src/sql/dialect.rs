//! Per-dialect SQL surface (spec §4.A "Dialect table").
//!
//! Each dialect differs in identifier quoting, null-ordering emulation,
//! placeholder style, and which safe casts it is willing to perform. The
//! folding engine never special-cases a dialect directly; it always goes
//! through a [`DialectHandler`].

use crate::ir::SortSpec;

/// SQL dialect a query is folding against.
#[derive(
    Debug,
    PartialEq,
    Eq,
    Clone,
    Copy,
    Hash,
    serde::Serialize,
    serde::Deserialize,
    strum::Display,
    strum::EnumString,
    strum::VariantNames,
)]
#[strum(serialize_all = "camelCase")]
pub enum Dialect {
    Postgres,
    MySql,
    #[strum(serialize = "sqlite")]
    SQLite,
    MsSql,
}

impl Dialect {
    pub fn handler(&self) -> Box<dyn DialectHandler> {
        match self {
            Dialect::Postgres => Box::new(PostgresDialect),
            Dialect::MySql => Box::new(MySqlDialect),
            Dialect::SQLite => Box::new(SQLiteDialect),
            Dialect::MsSql => Box::new(MsSqlDialect),
        }
    }
}

/// The placeholder form a dialect's driver expects, emitted by
/// [`crate::sql::placeholder::normalize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceholderStyle {
    /// `$1`, `$2`, ...
    Dollar,
    /// `@p1`, `@p2`, ...
    AtP,
    /// Neutral `?`, passed through unchanged (MySQL, SQLite).
    Question,
}

/// Per-dialect behavior needed by the SQL folding engine. Implementations
/// are zero-sized marker types dispatched through `Dialect::handler`, mirroring
/// how a sql-emitting compiler keeps per-dialect quirks out of the core
/// translation logic.
pub trait DialectHandler {
    fn dialect(&self) -> Dialect;

    fn placeholder_style(&self) -> PlaceholderStyle;

    /// Wraps an identifier in the dialect's quoting form, doubling any
    /// internal occurrence of the quote character.
    fn quote_identifier(&self, ident: &str) -> String;

    /// Formats an ISO-8601 date/datetime scalar the way this dialect's
    /// driver expects it to be bound as a parameter value.
    fn format_date_param(&self, iso8601: &str) -> String;

    /// Wraps `expr` in a cast to this dialect's wide text type.
    fn cast_text(&self, expr: &str) -> String;

    /// Whether this dialect can safely perform `changeType` to numeric or
    /// datetime targets via a regex-gated CASE expression. SQLite refuses:
    /// it has no reliable way to detect cast failure short of a regex against
    /// TEXT affinity columns, which the engine does not consider safe enough.
    fn supports_safe_cast(&self) -> bool {
        true
    }

    /// One or more `ORDER BY` expressions implementing `spec`, including
    /// nulls-ordering emulation where the dialect has no native syntax for it.
    fn sort_spec_to_sql(&self, alias: &str, spec: &SortSpec) -> String;

    /// Whether `ORDER BY` is permitted directly inside a derived table
    /// (subquery) for this dialect. SQL Server rejects `ORDER BY` in a
    /// subquery unless paired with `TOP`/`OFFSET`, so the engine must defer
    /// sorting to the outermost wrapper.
    fn allows_order_by_in_derived_table(&self) -> bool {
        true
    }

    /// String concatenation of two or more already-compiled SQL expressions.
    fn concat(&self, parts: &[String]) -> String {
        parts.join(" || ")
    }

    /// The length-of-string function name.
    fn text_length_fn(&self) -> &'static str {
        "LENGTH"
    }

    /// Adds `days_expr` (an integer SQL expression) days to a date/datetime
    /// expression.
    fn date_add_days(&self, expr: &str, days_expr: &str) -> String;
}

#[derive(Debug)]
pub struct PostgresDialect;
#[derive(Debug)]
pub struct MySqlDialect;
#[derive(Debug)]
pub struct SQLiteDialect;
#[derive(Debug)]
pub struct MsSqlDialect;

fn quote_doubling(ident: &str, open: char, close: char) -> String {
    let escaped = ident.replace(close, &format!("{close}{close}"));
    format!("{open}{escaped}{close}")
}

/// Whether a dialect-native `ASC`/`DESC` would already put nulls where
/// `spec.nulls` asks for, given each dialect's default (nulls-last for
/// ascending, nulls-first for descending, same as Postgres's defaults).
fn needs_nulls_emulation(spec: &SortSpec) -> bool {
    let nulls_last_by_default = matches!(spec.direction, crate::ir::SortDirection::Ascending);
    match spec.nulls {
        Some(crate::ir::NullsOrder::First) => nulls_last_by_default,
        Some(crate::ir::NullsOrder::Last) => !nulls_last_by_default,
        None => false,
    }
}

impl DialectHandler for PostgresDialect {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    fn placeholder_style(&self) -> PlaceholderStyle {
        PlaceholderStyle::Dollar
    }

    fn quote_identifier(&self, ident: &str) -> String {
        quote_doubling(ident, '"', '"')
    }

    fn format_date_param(&self, iso8601: &str) -> String {
        iso8601.to_string()
    }

    fn cast_text(&self, expr: &str) -> String {
        format!("({expr})::text")
    }

    fn sort_spec_to_sql(&self, alias: &str, spec: &SortSpec) -> String {
        let dir = match spec.direction {
            crate::ir::SortDirection::Ascending => "ASC",
            crate::ir::SortDirection::Descending => "DESC",
        };
        let nulls = match spec.nulls {
            Some(crate::ir::NullsOrder::First) => " NULLS FIRST",
            Some(crate::ir::NullsOrder::Last) => " NULLS LAST",
            None => "",
        };
        format!(
            "{}.{} {}{}",
            alias,
            self.quote_identifier(&spec.column),
            dir,
            nulls
        )
    }

    fn date_add_days(&self, expr: &str, days_expr: &str) -> String {
        format!("({expr} + make_interval(days => {days_expr}))")
    }
}

impl DialectHandler for MySqlDialect {
    fn dialect(&self) -> Dialect {
        Dialect::MySql
    }

    fn placeholder_style(&self) -> PlaceholderStyle {
        PlaceholderStyle::Question
    }

    fn quote_identifier(&self, ident: &str) -> String {
        quote_doubling(ident, '`', '`')
    }

    fn format_date_param(&self, iso8601: &str) -> String {
        // Truncates the `T`/zone suffix of an ISO-8601 instant to MySQL's
        // `DATETIME` literal form; any offset other than Z is dropped, same
        // as MySQL's own DATETIME (zoneless) storage.
        let trimmed = iso8601.trim_end_matches('Z');
        trimmed.replacen('T', " ", 1)
    }

    fn cast_text(&self, expr: &str) -> String {
        format!("CAST({expr} AS CHAR)")
    }

    fn sort_spec_to_sql(&self, alias: &str, spec: &SortSpec) -> String {
        let quoted_col = format!("{}.{}", alias, self.quote_identifier(&spec.column));
        let dir = match spec.direction {
            crate::ir::SortDirection::Ascending => "ASC",
            crate::ir::SortDirection::Descending => "DESC",
        };
        if needs_nulls_emulation(spec) {
            let nulls_dir = match spec.nulls {
                Some(crate::ir::NullsOrder::First) => "ASC",
                _ => "DESC",
            };
            format!("({quoted_col} IS NULL) {nulls_dir}, {quoted_col} {dir}")
        } else {
            format!("{quoted_col} {dir}")
        }
    }

    fn concat(&self, parts: &[String]) -> String {
        format!("CONCAT({})", parts.join(", "))
    }

    fn date_add_days(&self, expr: &str, days_expr: &str) -> String {
        format!("DATE_ADD({expr}, INTERVAL {days_expr} DAY)")
    }
}

impl DialectHandler for SQLiteDialect {
    fn dialect(&self) -> Dialect {
        Dialect::SQLite
    }

    fn placeholder_style(&self) -> PlaceholderStyle {
        PlaceholderStyle::Question
    }

    fn quote_identifier(&self, ident: &str) -> String {
        quote_doubling(ident, '"', '"')
    }

    fn format_date_param(&self, iso8601: &str) -> String {
        iso8601.to_string()
    }

    fn cast_text(&self, expr: &str) -> String {
        format!("CAST({expr} AS TEXT)")
    }

    fn supports_safe_cast(&self) -> bool {
        false
    }

    fn sort_spec_to_sql(&self, alias: &str, spec: &SortSpec) -> String {
        let quoted_col = format!("{}.{}", alias, self.quote_identifier(&spec.column));
        let dir = match spec.direction {
            crate::ir::SortDirection::Ascending => "ASC",
            crate::ir::SortDirection::Descending => "DESC",
        };
        if needs_nulls_emulation(spec) {
            let nulls_dir = match spec.nulls {
                Some(crate::ir::NullsOrder::First) => "ASC",
                _ => "DESC",
            };
            format!("({quoted_col} IS NULL) {nulls_dir}, {quoted_col} {dir}")
        } else {
            format!("{quoted_col} {dir}")
        }
    }

    fn date_add_days(&self, expr: &str, days_expr: &str) -> String {
        format!("DATE({expr}, {days_expr} || ' days')")
    }
}

impl DialectHandler for MsSqlDialect {
    fn dialect(&self) -> Dialect {
        Dialect::MsSql
    }

    fn placeholder_style(&self) -> PlaceholderStyle {
        PlaceholderStyle::AtP
    }

    fn quote_identifier(&self, ident: &str) -> String {
        quote_doubling(ident, '[', ']')
    }

    fn format_date_param(&self, iso8601: &str) -> String {
        iso8601.to_string()
    }

    fn cast_text(&self, expr: &str) -> String {
        format!("CAST({expr} AS NVARCHAR(MAX))")
    }

    fn sort_spec_to_sql(&self, alias: &str, spec: &SortSpec) -> String {
        let quoted_col = format!("{}.{}", alias, self.quote_identifier(&spec.column));
        let dir = match spec.direction {
            crate::ir::SortDirection::Ascending => "ASC",
            crate::ir::SortDirection::Descending => "DESC",
        };
        let nulls_last_by_default = matches!(spec.direction, crate::ir::SortDirection::Ascending);
        let wants_first = matches!(spec.nulls, Some(crate::ir::NullsOrder::First));
        let wants_last = matches!(spec.nulls, Some(crate::ir::NullsOrder::Last));
        let needs_emulation =
            (wants_first && nulls_last_by_default) || (wants_last && !nulls_last_by_default);
        if needs_emulation {
            let nulls_dir = if wants_first { "ASC" } else { "DESC" };
            format!(
                "CASE WHEN {quoted_col} IS NULL THEN 1 ELSE 0 END {nulls_dir}, {quoted_col} {dir}"
            )
        } else {
            format!("{quoted_col} {dir}")
        }
    }

    fn allows_order_by_in_derived_table(&self) -> bool {
        false
    }

    fn concat(&self, parts: &[String]) -> String {
        parts.join(" + ")
    }

    fn text_length_fn(&self) -> &'static str {
        "LEN"
    }

    fn date_add_days(&self, expr: &str, days_expr: &str) -> String {
        format!("DATEADD(day, {days_expr}, {expr})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{NullsOrder, SortDirection, SortSpec};

    #[test]
    fn postgres_quotes_with_doubled_double_quotes() {
        let h = PostgresDialect;
        assert_eq!(h.quote_identifier(r#"wei"rd"#), r#""wei""rd""#);
    }

    #[test]
    fn mysql_quotes_with_backticks() {
        let h = MySqlDialect;
        assert_eq!(h.quote_identifier("Region"), "`Region`");
    }

    #[test]
    fn mssql_quotes_with_brackets_and_doubles_close_bracket() {
        let h = MsSqlDialect;
        assert_eq!(h.quote_identifier("a]b"), "[a]]b]");
    }

    #[test]
    fn mysql_format_date_param_truncates_to_space_separated_form() {
        let h = MySqlDialect;
        assert_eq!(
            h.format_date_param("2024-01-02T03:04:05Z"),
            "2024-01-02 03:04:05"
        );
    }

    #[test]
    fn postgres_sort_spec_uses_native_nulls_clause() {
        let h = PostgresDialect;
        let spec = SortSpec {
            column: "amount".into(),
            direction: SortDirection::Descending,
            nulls: Some(NullsOrder::Last),
        };
        assert_eq!(h.sort_spec_to_sql("t", &spec), r#"t."amount" DESC NULLS LAST"#);
    }

    #[test]
    fn mssql_emulates_nulls_first_with_case_expression() {
        let h = MsSqlDialect;
        let spec = SortSpec {
            column: "amount".into(),
            direction: SortDirection::Ascending,
            nulls: Some(NullsOrder::First),
        };
        let sql = h.sort_spec_to_sql("t", &spec);
        assert!(sql.starts_with("CASE WHEN t.[amount] IS NULL THEN 1 ELSE 0 END ASC"));
    }

    #[test]
    fn sqlite_refuses_safe_cast() {
        assert!(!SQLiteDialect.supports_safe_cast());
    }

    #[test]
    fn mssql_does_not_allow_order_by_in_derived_table() {
        assert!(!MsSqlDialect.allows_order_by_in_derived_table());
    }
}
