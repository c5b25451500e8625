use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "camelCase")]
pub enum JoinMode {
    Flat,
    Nested,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "camelCase")]
pub enum JoinType {
    Inner,
    Left,
    Right,
    Full,
    LeftAnti,
    RightAnti,
    LeftSemi,
    RightSemi,
}

impl JoinType {
    /// Semi/anti joins require local deduplication/existence semantics this
    /// engine never folds (spec §4.D merge).
    pub fn is_semi_or_anti(&self) -> bool {
        matches!(
            self,
            JoinType::LeftAnti | JoinType::RightAnti | JoinType::LeftSemi | JoinType::RightSemi
        )
    }
}

/// Either a single legacy scalar key or an explicit list; the list always
/// takes precedence when both would otherwise be meaningful.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MergeKeys {
    Scalar(String),
    List(Vec<String>),
}

impl MergeKeys {
    pub fn as_list(&self) -> Vec<String> {
        match self {
            MergeKeys::Scalar(s) => vec![s.clone()],
            MergeKeys::List(v) => v.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeOp {
    pub right_query_id: String,
    pub join_mode: JoinMode,
    pub join_type: JoinType,
    pub left_keys: MergeKeys,
    pub right_keys: MergeKeys,
    /// New column name for the nested table column (nested mode only).
    pub new_column_name: Option<String>,
    /// Projection restricting which right-side columns survive (flat mode).
    pub right_columns: Option<Vec<String>>,
}
