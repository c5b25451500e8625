//! Connection-identity resolution and matching (spec §4.D).
//!
//! `merge`/`append`/`query`-source folding across two branches is only safe
//! when both sides address the same backend. This module is the single
//! place that decides "same backend or not" for the SQL folding engine.

use crate::ir::QuerySource;

/// Either a host-opaque identity string, or a structural value that gets
/// hashed into one. Mirrors the two outcomes a real `getConnectionIdentity`
/// hook can return per the spec: "on a string result, uses it directly; on
/// a structural result, hashes it with a stable deterministic value hasher".
pub enum ConnectionIdentity {
    Str(String),
    Structural(serde_json::Value),
}

/// A host-provided hook resolving a connection handle to a stable identity.
pub trait ConnectionIdentityHook: Send + Sync {
    fn identity_for(&self, connection: &str) -> Option<ConnectionIdentity>;
}

/// FNV-1a over the value's canonical JSON serialization. Chosen over
/// `std::hash::DefaultHasher` because that hasher's algorithm is explicitly
/// unspecified across Rust versions; this identity may be compared or
/// cached across process boundaries, so it needs to be stable.
fn stable_hash(value: &serde_json::Value) -> u64 {
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    let mut hash: u64 = 0xcbf29ce484222325;
    for b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// Resolves a stable connection id for a `database` source.
///
/// Resolution order: explicit `connection_id` on the source, then the host
/// hook (string directly, structural value hashed), then — absent a hook —
/// the raw connection string is accepted as its own identity (the "last
/// resort heuristic" in the spec).
pub fn resolve_connection_id(
    source: &QuerySource,
    hook: Option<&dyn ConnectionIdentityHook>,
) -> Option<String> {
    let QuerySource::Database {
        connection,
        connection_id,
        ..
    } = source
    else {
        return None;
    };

    if let Some(id) = connection_id {
        return Some(id.clone());
    }

    if let Some(hook) = hook {
        return match hook.identity_for(connection) {
            Some(ConnectionIdentity::Str(s)) => Some(s),
            Some(ConnectionIdentity::Structural(v)) => Some(format!("h:{:x}", stable_hash(&v))),
            None => None,
        };
    }

    Some(connection.clone())
}

/// Whether two resolved connection identities should be treated as the same
/// backend. Folds `merge`/`append` only when both resolve and agree; absent
/// both, falls back to reference equality on the raw `connection` string (the
/// spec's fallback) rather than refusing outright — a hook that returns
/// `None` for an untracked connection shouldn't stop two sources with the
/// literal same connection string from folding together.
pub fn connections_match(
    left_id: &Option<String>,
    left_connection: &str,
    right_id: &Option<String>,
    right_connection: &str,
) -> bool {
    match (left_id, right_id) {
        (Some(l), Some(r)) => l == r,
        (None, None) => left_connection == right_connection,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticHook(Option<ConnectionIdentity>);
    impl ConnectionIdentityHook for StaticHook {
        fn identity_for(&self, _connection: &str) -> Option<ConnectionIdentity> {
            match &self.0 {
                Some(ConnectionIdentity::Str(s)) => Some(ConnectionIdentity::Str(s.clone())),
                Some(ConnectionIdentity::Structural(v)) => {
                    Some(ConnectionIdentity::Structural(v.clone()))
                }
                None => None,
            }
        }
    }

    fn db_source(connection: &str, connection_id: Option<&str>) -> QuerySource {
        QuerySource::Database {
            connection: connection.to_string(),
            connection_id: connection_id.map(str::to_string),
            query: "SELECT 1".into(),
            dialect: None,
            columns: None,
        }
    }

    #[test]
    fn explicit_connection_id_wins_over_hook() {
        let hook = StaticHook(Some(ConnectionIdentity::Str("from-hook".into())));
        let source = db_source("db1", Some("explicit"));
        assert_eq!(
            resolve_connection_id(&source, Some(&hook)),
            Some("explicit".to_string())
        );
    }

    #[test]
    fn structural_identity_hashes_deterministically() {
        let hook = StaticHook(Some(ConnectionIdentity::Structural(
            serde_json::json!({"host": "db1", "port": 5432}),
        )));
        let source = db_source("db1", None);
        let a = resolve_connection_id(&source, Some(&hook));
        let b = resolve_connection_id(&source, Some(&hook));
        assert_eq!(a, b);
        assert!(a.unwrap().starts_with("h:"));
    }

    #[test]
    fn absent_hook_falls_back_to_raw_connection_string() {
        let source = db_source("db1", None);
        assert_eq!(
            resolve_connection_id(&source, None),
            Some("db1".to_string())
        );
    }

    #[test]
    fn two_unresolved_identities_fall_back_to_raw_connection_equality() {
        assert!(connections_match(&None, "local-duckdb", &None, "local-duckdb"));
        assert!(!connections_match(&None, "local-duckdb", &None, "other-duckdb"));
    }

    #[test]
    fn one_unresolved_identity_never_matches() {
        let a = Some("db1".to_string());
        assert!(!connections_match(&a, "db1", &None, "db1"));
    }

    #[test]
    fn matching_identities_match() {
        let a = Some("db1".to_string());
        let b = Some("db1".to_string());
        assert!(connections_match(&a, "irrelevant", &b, "irrelevant-too"));
    }
}
