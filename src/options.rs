//! Compile-time options (spec §6 "External interfaces").

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::connection::ConnectionIdentityHook;
use crate::ir::QueryMap;
use crate::sql::Dialect;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, Default)]
#[strum(serialize_all = "camelCase")]
pub enum PrivacyMode {
    Ignore,
    #[default]
    Enforce,
    Warn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "camelCase")]
pub enum PrivacyLevel {
    Public,
    Organizational,
    Private,
    Unknown,
}

/// Options threaded through every top-level `compile_*` call. Constructed
/// with `Default` and field assignment rather than a config file — the
/// compiler owns no on-disk configuration surface (see SPEC_FULL §10.3).
#[derive(Clone, Default)]
pub struct CompileOptions {
    /// Explicit dialect override, used when the source carries none or the
    /// caller wants to force one.
    pub dialect: Option<Dialect>,
    /// Other registered queries, for resolving `query` sources and the
    /// right-hand sides of `merge`/`append`.
    pub queries: QueryMap,
    pub get_connection_identity: Option<Arc<dyn ConnectionIdentityHook>>,
    pub privacy_mode: PrivacyMode,
    pub privacy_levels_by_source_id: HashMap<String, PrivacyLevel>,
}

impl std::fmt::Debug for CompileOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompileOptions")
            .field("dialect", &self.dialect)
            .field("queries", &self.queries.keys().collect::<Vec<_>>())
            .field(
                "get_connection_identity",
                &self.get_connection_identity.is_some(),
            )
            .field("privacy_mode", &self.privacy_mode)
            .field(
                "privacy_levels_by_source_id",
                &self.privacy_levels_by_source_id,
            )
            .finish()
    }
}

impl CompileOptions {
    pub fn privacy_level_of(&self, source_id: &str) -> PrivacyLevel {
        self.privacy_levels_by_source_id
            .get(source_id)
            .copied()
            .unwrap_or(PrivacyLevel::Unknown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_privacy_mode_is_enforce() {
        assert_eq!(CompileOptions::default().privacy_mode, PrivacyMode::Enforce);
    }

    #[test]
    fn unregistered_source_has_unknown_privacy_level() {
        let opts = CompileOptions::default();
        assert_eq!(opts.privacy_level_of("missing"), PrivacyLevel::Unknown);
    }
}
