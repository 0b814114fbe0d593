/// Core types shared by probes, the execution context and the aggregator
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Independent grouping of probes with its own verdict
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Category {
    #[serde(rename = "sandbox")]
    Sandbox,
    #[serde(rename = "virtual_machine")]
    VirtualMachine,
    #[serde(rename = "auto_analysis")]
    AutoAnalysis,
}

impl Category {
    /// Default run order. The category holding a terminal probe runs last.
    pub const ALL: [Category; 3] = [
        Category::Sandbox,
        Category::AutoAnalysis,
        Category::VirtualMachine,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Sandbox => "sandbox",
            Category::VirtualMachine => "virtual_machine",
            Category::AutoAnalysis => "auto_analysis",
        }
    }

    /// Human-readable heading used by presenters
    pub fn heading(self) -> &'static str {
        match self {
            Category::Sandbox => "Testing sandboxed environment",
            Category::VirtualMachine => "Testing virtualized environment",
            Category::AutoAnalysis => "Testing automated analysis",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Category {
    type Err = ProbeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sandbox" => Ok(Category::Sandbox),
            "vm" | "virtual_machine" | "virtual-machine" => Ok(Category::VirtualMachine),
            "auto" | "auto_analysis" | "auto-analysis" => Ok(Category::AutoAnalysis),
            other => Err(ProbeError::Config(format!("unknown category: {other}"))),
        }
    }
}

/// Declared execution hazard; drives how the execution context dispatches a probe
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Hazard {
    /// Ordinary OS-call latency, cannot fault
    #[serde(rename = "none")]
    None,
    /// Executes a privileged or protocol-violating operation that may raise a fault
    #[serde(rename = "may_fault")]
    MayFault,
    /// Blocks for seconds (timing windows, event monitoring)
    #[serde(rename = "may_block_unbounded")]
    MayBlockUnbounded,
}

/// Tri-state evidence
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Finding {
    /// Environment anomaly detected
    #[serde(rename = "positive")]
    Positive,
    /// Checked and not detected
    #[serde(rename = "negative")]
    Negative,
    /// No evidential value
    #[serde(rename = "inconclusive")]
    Inconclusive,
}

impl Finding {
    pub fn from_detected(detected: bool) -> Self {
        if detected {
            Finding::Positive
        } else {
            Finding::Negative
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Finding::Positive => "Detected!",
            Finding::Negative => "Not detected!",
            Finding::Inconclusive => "Inconclusive",
        }
    }
}

/// Result of a single probe invocation. Never mutated after creation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub finding: Finding,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
}

impl ProbeResult {
    pub fn new(finding: Finding) -> Self {
        Self {
            finding,
            diagnostic: None,
        }
    }

    pub fn with_diagnostic(finding: Finding, diagnostic: impl Into<String>) -> Self {
        Self {
            finding,
            diagnostic: Some(diagnostic.into()),
        }
    }

    pub fn positive() -> Self {
        Self::new(Finding::Positive)
    }

    pub fn negative() -> Self {
        Self::new(Finding::Negative)
    }

    pub fn detected(detected: bool) -> Self {
        Self::new(Finding::from_detected(detected))
    }

    pub fn inconclusive(reason: impl Into<String>) -> Self {
        Self::with_diagnostic(Finding::Inconclusive, reason)
    }
}

impl From<Finding> for ProbeResult {
    fn from(finding: Finding) -> Self {
        ProbeResult::new(finding)
    }
}

/// The operation was rejected for lack of privilege, which carries no evidence
/// about the environment itself.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PermissionMiss(pub String);

impl fmt::Display for PermissionMiss {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a probe body hands back to the execution context
pub type ProbeOutput = std::result::Result<ProbeResult, PermissionMiss>;

/// Value returned by the execution context for one probe
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    /// The probe ran to completion
    Completed { result: ProbeResult },
    /// A contained fault (or panic) occurred; `result` is the probe's own fault policy
    Crashed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signal: Option<i32>,
        result: ProbeResult,
    },
    /// The deadline was reached; `result` is evaluated from partial evidence
    TimedOut { result: ProbeResult },
    /// Rejected for lack of privilege
    PermissionDenied { detail: String },
}

impl ExecutionOutcome {
    pub fn completed(result: ProbeResult) -> Self {
        ExecutionOutcome::Completed { result }
    }

    /// Effective tri-state used by aggregation
    pub fn finding(&self) -> Finding {
        match self {
            ExecutionOutcome::Completed { result }
            | ExecutionOutcome::Crashed { result, .. }
            | ExecutionOutcome::TimedOut { result } => result.finding,
            ExecutionOutcome::PermissionDenied { .. } => Finding::Inconclusive,
        }
    }

    pub fn result(&self) -> Option<&ProbeResult> {
        match self {
            ExecutionOutcome::Completed { result }
            | ExecutionOutcome::Crashed { result, .. }
            | ExecutionOutcome::TimedOut { result } => Some(result),
            ExecutionOutcome::PermissionDenied { .. } => None,
        }
    }

    pub fn diagnostic(&self) -> Option<&str> {
        match self {
            ExecutionOutcome::PermissionDenied { detail } => Some(detail.as_str()),
            other => other.result().and_then(|r| r.diagnostic.as_deref()),
        }
    }

    pub fn status_name(&self) -> &'static str {
        match self {
            ExecutionOutcome::Completed { .. } => "completed",
            ExecutionOutcome::Crashed { .. } => "crashed",
            ExecutionOutcome::TimedOut { .. } => "timed_out",
            ExecutionOutcome::PermissionDenied { .. } => "permission_denied",
        }
    }
}

/// Errors raised while setting the framework up. Probe evaluation itself never
/// produces one of these; it collapses into an [`ExecutionOutcome`].
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Duplicate probe '{name}' in category {category}")]
    DuplicateProbe { category: Category, name: String },

    #[error("Category {category} already has terminal probe '{existing}'")]
    TerminalSlotTaken { category: Category, existing: String },

    #[error("Signal handling error: {0}")]
    Signal(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Probe registry already initialized")]
    AlreadyInitialized,
}

impl From<nix::errno::Errno> for ProbeError {
    fn from(err: nix::errno::Errno) -> Self {
        ProbeError::Process(err.to_string())
    }
}

/// Result type alias for framework set-up operations
pub type Result<T> = std::result::Result<T, ProbeError>;

/// Default informational timeout for probes with no blocking behaviour
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_denied_is_inconclusive() {
        let outcome = ExecutionOutcome::PermissionDenied {
            detail: "EACCES".to_string(),
        };
        assert_eq!(outcome.finding(), Finding::Inconclusive);
        assert_eq!(outcome.diagnostic(), Some("EACCES"));
    }

    #[test]
    fn test_crashed_uses_probe_fault_policy() {
        let outcome = ExecutionOutcome::Crashed {
            signal: Some(libc::SIGSEGV),
            result: ProbeResult::negative(),
        };
        assert_eq!(outcome.finding(), Finding::Negative);
        assert_eq!(outcome.status_name(), "crashed");
    }

    #[test]
    fn test_category_parse() {
        assert_eq!("vm".parse::<Category>().unwrap(), Category::VirtualMachine);
        assert_eq!(
            "auto-analysis".parse::<Category>().unwrap(),
            Category::AutoAnalysis
        );
        assert!("desktop".parse::<Category>().is_err());
    }

    #[test]
    fn test_outcome_serializes_with_status_tag() {
        let outcome = ExecutionOutcome::TimedOut {
            result: ProbeResult::positive(),
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "timed_out");
        assert_eq!(json["result"]["finding"], "positive");
    }
}
