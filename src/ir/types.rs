use serde::{Deserialize, Serialize};

/// Target types for `changeType`. `Any` is always a no-op; the rest map
/// through the per-dialect type table (spec §4.A).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "camelCase")]
pub enum ColumnType {
    Any,
    String,
    Number,
    Boolean,
    Date,
    DateTime,
    DateTimeZone,
    Time,
    Duration,
    Decimal,
    Binary,
}
