//! The fatal-error channel (spec §7, §9 "Exceptions for control flow").
//!
//! Unsupported operations are never an `Err` — they break folding locally
//! and are recorded as a reason in the explain trace (see [`crate::explain`]).
//! `FatalError` exists only for invariant violations that indicate a bug in
//! the compiler or its inputs: a placeholder-count mismatch after
//! normalisation, an unknown dialect, or a predicate/operation variant the
//! compiler has no case for (which can only happen if the IR was
//! constructed by a mismatched version of this crate).

use std::fmt::{self, Debug, Display, Formatter};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FatalReason {
    /// The placeholder normaliser rewrote a different number of `?` than
    /// there are parameters in the running list.
    PlaceholderCountMismatch { expected: usize, found: usize },
    /// A dialect name a host resolved outside the typed `Dialect` enum (e.g.
    /// via `Dialect::from_str` on a config string) didn't match any of the
    /// four supported dialects. A source or option already carrying a typed
    /// `Dialect` can never trigger this; an absent dialect is instead the
    /// soft `missing_dialect` explain reason, not a fatal error.
    UnknownDialect(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FatalError {
    pub reason: FatalReason,
    pub context: Option<String>,
}

impl FatalError {
    pub fn new(reason: FatalReason) -> Self {
        FatalError {
            reason,
            context: None,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

impl Display for FatalReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            FatalReason::PlaceholderCountMismatch { expected, found } => write!(
                f,
                "placeholder count mismatch: expected {expected} parameters, rewrote {found} placeholders"
            ),
            FatalReason::UnknownDialect(name) => write!(f, "unknown SQL dialect `{name}`"),
        }
    }
}

impl Display for FatalError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.reason, f)?;
        if let Some(context) = &self.context {
            write!(f, " ({context})")?;
        }
        Ok(())
    }
}

impl std::error::Error for FatalError {}

pub type FatalResult<T> = Result<T, FatalError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context() {
        let err = FatalError::new(FatalReason::UnknownDialect("oracle".into()))
            .with_context("query q1");
        assert_eq!(err.to_string(), "unknown SQL dialect `oracle` (query q1)");
    }
}
