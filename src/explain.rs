//! The explain layer (spec §4.F): per-step fold/local traces, the
//! discriminated compiled plan, and privacy-firewall diagnostics.

use serde::{Deserialize, Serialize};

use crate::options::PrivacyLevel;

/// The closed set of machine-readable reasons a step can fail to fold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum Reason {
    UnsupportedOp,
    UnsupportedPredicate,
    InvalidProjection,
    UnknownProjection,
    UnsupportedType,
    InvalidArgument,
    InvalidSelect,
    UnsafeFormula,
    MissingQuery,
    MissingQueries,
    QueryCycle,
    DifferentConnection,
    PrivacyFirewall,
    UnsupportedJoinType,
    UnsupportedJoinMode,
    UnsupportedComparer,
    IncompatibleSchema,
    SqlserverOrderByInSource,
    MissingDialect,
    FoldingStopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum StepStatus {
    Folded,
    Local,
}

/// A single step's outcome: whether it folded, and if not, why. A folded
/// step carries the fragment (partial SQL or URL) as it stood immediately
/// after that step, for debugging/telemetry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepTrace {
    pub step_id: String,
    pub status: StepStatus,
    pub reason: Option<Reason>,
    pub fragment: Option<String>,
}

impl StepTrace {
    pub fn folded(step_id: impl Into<String>, fragment: impl Into<String>) -> Self {
        StepTrace {
            step_id: step_id.into(),
            status: StepStatus::Folded,
            reason: None,
            fragment: Some(fragment.into()),
        }
    }

    pub fn local(step_id: impl Into<String>, reason: Reason) -> Self {
        StepTrace {
            step_id: step_id.into(),
            status: StepStatus::Local,
            reason: Some(reason),
            fragment: None,
        }
    }
}

/// A privacy-firewall refusal attached to a plan (spec §4.F "Privacy
/// firewall").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrivacyDiagnostic {
    pub operation: &'static str,
    pub left_level: PrivacyLevel,
    pub right_level: PrivacyLevel,
    /// `true` when the refusing mode was `warn` rather than `enforce` —
    /// both refuse the fold, but the phase is worth distinguishing for a
    /// host that wants to log warnings differently from hard failures.
    pub warn_only: bool,
}

/// The compiled plan: how much of the step list folded, and into what.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Plan {
    /// Nothing folded — run every step locally. Can still carry a privacy
    /// diagnostic when the very first cross-source step is what refused.
    Local {
        steps: Vec<String>,
        diagnostics: Vec<PrivacyDiagnostic>,
    },
    /// The entire step list folded into one native query.
    Native {
        sql_or_url: String,
        params: Vec<crate::ir::ScalarValue>,
        diagnostics: Vec<PrivacyDiagnostic>,
    },
    /// A prefix folded; the remainder runs locally.
    Hybrid {
        sql_or_url: String,
        params: Vec<crate::ir::ScalarValue>,
        local_steps: Vec<String>,
        diagnostics: Vec<PrivacyDiagnostic>,
    },
}

impl Plan {
    pub fn diagnostics(&self) -> &[PrivacyDiagnostic] {
        match self {
            Plan::Local { diagnostics, .. } => diagnostics,
            Plan::Native { diagnostics, .. } => diagnostics,
            Plan::Hybrid { diagnostics, .. } => diagnostics,
        }
    }
}

/// The per-step trace for an entire query, produced alongside (or instead
/// of) a `Plan` for debugging/telemetry (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExplainResult {
    pub steps: Vec<StepTrace>,
}

impl ExplainResult {
    /// Builds the trace from a list of per-step outcomes collected during
    /// folding, then pads any steps that were never attempted (because an
    /// earlier step already broke folding) with `folding_stopped`.
    pub fn from_traces(mut traces: Vec<StepTrace>, total_steps: usize) -> Self {
        while traces.len() < total_steps {
            let idx = traces.len();
            traces.push(StepTrace {
                step_id: format!("__unreached_{idx}"),
                status: StepStatus::Local,
                reason: Some(Reason::FoldingStopped),
                fragment: None,
            });
        }
        ExplainResult { steps: traces }
    }
}
