use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "camelCase")]
pub enum AggregationOp {
    Sum,
    Count,
    Average,
    Min,
    Max,
    CountDistinct,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Aggregation {
    pub column: String,
    pub op: AggregationOp,
    /// Output column name; defaults to `column` when absent.
    #[serde(rename = "as")]
    pub as_name: Option<String>,
}

impl Aggregation {
    pub fn output_name(&self) -> &str {
        self.as_name.as_deref().unwrap_or(&self.column)
    }
}
