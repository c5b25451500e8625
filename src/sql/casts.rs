//! Safe numeric and datetime casts (spec §4.D "Safe numeric and datetime
//! casts"): non-parseable input becomes `NULL` instead of raising, matching
//! local `changeType` semantics.

use crate::sql::dialect::Dialect;

const NUMERIC_PATTERN: &str = r"^[+-]?([0-9]+([.][0-9]*)?|[.][0-9]+)([eE][+-]?[0-9]+)?$";
const DATETIME_PATTERN: &str =
    r"^[0-9]{4}-[0-9]{2}-[0-9]{2}([T ][0-9]{2}:[0-9]{2}(:[0-9]{2}(\.[0-9]+)?)?(Z|[+-][0-9]{2}:?[0-9]{2})?)?$";

/// Whether `dialect` can perform either safe cast at all. SQLite has no
/// regex function and refuses both.
pub fn supports_safe_cast(dialect: Dialect) -> bool {
    !matches!(dialect, Dialect::SQLite)
}

/// Emits a regex-gated `CASE` expression casting `expr` (already a plain
/// column/value reference, not wrapped) to a numeric type, yielding `NULL`
/// when the text doesn't match a numeric literal or isn't finite.
///
/// Returns `None` for SQLite, which has no safe path.
pub fn safe_numeric_cast(dialect: Dialect, expr: &str) -> Option<String> {
    if !supports_safe_cast(dialect) {
        return None;
    }
    let text = format!("TRIM(CAST({expr} AS TEXT))");
    Some(match dialect {
        Dialect::Postgres => format!(
            "CASE WHEN {text} ~ '{NUMERIC_PATTERN}' AND isfinite(CAST({text} AS DOUBLE PRECISION)) \
             THEN CAST({text} AS DOUBLE PRECISION) ELSE NULL END"
        ),
        Dialect::MySql => format!(
            "CASE WHEN {text} REGEXP '{NUMERIC_PATTERN}' \
             AND ABS(CAST({text} AS DOUBLE)) < 1.7976931348623157e308 \
             THEN CAST({text} AS DOUBLE) ELSE NULL END"
        ),
        Dialect::MsSql => format!("TRY_CAST(NULLIF({text}, '') AS FLOAT)"),
        Dialect::SQLite => unreachable!("guarded by supports_safe_cast"),
    })
}

/// Emits a regex-gated cast to a datetime type; `NULL` on a non-ISO-8601
/// shape. Returns `None` for SQLite.
pub fn safe_datetime_cast(dialect: Dialect, expr: &str, target_sql_type: &str) -> Option<String> {
    if !supports_safe_cast(dialect) {
        return None;
    }
    let text = format!("TRIM(CAST({expr} AS TEXT))");
    Some(match dialect {
        Dialect::Postgres => format!(
            "CASE WHEN {text} ~ '{DATETIME_PATTERN}' THEN CAST({text} AS {target_sql_type}) ELSE NULL END"
        ),
        Dialect::MySql => format!(
            "CASE WHEN {text} REGEXP '{DATETIME_PATTERN}' THEN CAST({text} AS {target_sql_type}) ELSE NULL END"
        ),
        Dialect::MsSql => format!("TRY_CAST(NULLIF({text}, '') AS {target_sql_type})"),
        Dialect::SQLite => unreachable!("guarded by supports_safe_cast"),
    })
}

/// SQL type name used for a `changeType` target under `dialect`, or `None`
/// when the dialect has no safe representation for it (the step must then
/// refuse to fold, per the dialect type table in spec §4.A).
pub fn sql_type_for(dialect: Dialect, target: crate::ir::ColumnType) -> Option<&'static str> {
    use crate::ir::ColumnType::*;
    use Dialect::*;
    match (dialect, target) {
        (_, Any) => None,
        (Postgres, String) => Some("TEXT"),
        (MySql, String) => Some("CHAR"),
        (SQLite, String) => Some("TEXT"),
        (MsSql, String) => Some("NVARCHAR(MAX)"),

        (Postgres, Number) => Some("DOUBLE PRECISION"),
        (MySql, Number) => Some("DOUBLE"),
        (MsSql, Number) => Some("FLOAT"),
        (SQLite, Number) => None,

        (Postgres, Decimal) => Some("NUMERIC"),
        (MySql, Decimal) => Some("DECIMAL(38,10)"),
        (MsSql, Decimal) => Some("DECIMAL(38,10)"),
        (SQLite, Decimal) => None,

        (Postgres, Date) => Some("DATE"),
        (MySql, Date) => Some("DATE"),
        (MsSql, Date) => Some("DATE"),
        (SQLite, Date) => None,

        (Postgres, DateTime) => Some("TIMESTAMP"),
        (MySql, DateTime) => Some("DATETIME"),
        (MsSql, DateTime) => Some("DATETIME2"),
        (SQLite, DateTime) => None,

        // MySQL has no zone-aware temporal type; mapping to DATETIME drops
        // the offset, matching the open question recorded for this dialect.
        (Postgres, DateTimeZone) => Some("TIMESTAMPTZ"),
        (MySql, DateTimeZone) => Some("DATETIME"),
        (MsSql, DateTimeZone) => Some("DATETIMEOFFSET"),
        (SQLite, DateTimeZone) => None,

        (Postgres, Time) => Some("TIME"),
        (MySql, Time) => Some("TIME"),
        (MsSql, Time) => Some("TIME"),
        (SQLite, Time) => None,

        (Postgres, Boolean) => Some("BOOLEAN"),
        (MsSql, Boolean) => Some("BIT"),
        (MySql, Boolean) => None,
        (SQLite, Boolean) => None,

        // Duration and binary targets have no safe cast surface in any
        // dialect; the compiler never attempts them.
        (_, Duration) => None,
        (_, Binary) => None,
    }
}
