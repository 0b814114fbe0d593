//! Category verdicts over tri-state evidence
//!
//! Policy: one `Positive` is enough to mark a category detected. `Inconclusive`
//! outcomes neither confirm nor deny; they stay in the report for diagnostics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::types::{Category, ExecutionOutcome, Finding, Hazard};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Detected,
    NotDetected,
}

impl Verdict {
    pub fn is_detected(self) -> bool {
        self == Verdict::Detected
    }
}

/// Count of outcomes per effective finding
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceTally {
    pub positive: usize,
    pub negative: usize,
    pub inconclusive: usize,
}

impl EvidenceTally {
    pub fn record(&mut self, finding: Finding) {
        match finding {
            Finding::Positive => self.positive += 1,
            Finding::Negative => self.negative += 1,
            Finding::Inconclusive => self.inconclusive += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.positive + self.negative + self.inconclusive
    }

    /// Share of outcomes that carried evidence, 0.0 for an empty report
    pub fn evidential_ratio(&self) -> f64 {
        match self.total() {
            0 => 0.0,
            total => (self.positive + self.negative) as f64 / total as f64,
        }
    }
}

/// One probe's line in a category report
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReportEntry {
    pub name: String,
    pub description: String,
    pub hazard: Hazard,
    pub outcome: ExecutionOutcome,
    pub elapsed_ms: u64,
}

impl ReportEntry {
    pub fn finding(&self) -> Finding {
        self.outcome.finding()
    }
}

/// Outcomes of one category run, in registration order
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CategoryReport {
    pub category: Category,
    pub entries: Vec<ReportEntry>,
    pub verdict: Verdict,
    pub tally: EvidenceTally,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
}

impl CategoryReport {
    /// Aggregate `entries` into a report
    pub fn new(
        category: Category,
        entries: Vec<ReportEntry>,
        started_at: DateTime<Utc>,
        elapsed_ms: u64,
    ) -> Self {
        let (verdict, tally) = VerdictClassifier::classify(&entries);
        Self {
            category,
            entries,
            verdict,
            tally,
            started_at,
            elapsed_ms,
        }
    }

    pub fn is_detected(&self) -> bool {
        self.verdict.is_detected()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Names of the probes that produced positive evidence
    pub fn positive_probes(&self) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .filter(|entry| entry.finding() == Finding::Positive)
            .map(|entry| entry.name.as_str())
    }
}

/// Verdict classifier - pure function over recorded outcomes
pub struct VerdictClassifier;

impl VerdictClassifier {
    /// Logical OR over positive findings; no weighting
    pub fn classify(entries: &[ReportEntry]) -> (Verdict, EvidenceTally) {
        let tally = Self::tally(entries.iter().map(ReportEntry::finding));
        let verdict = if tally.positive > 0 {
            Verdict::Detected
        } else {
            Verdict::NotDetected
        };
        (verdict, tally)
    }

    pub fn tally(findings: impl IntoIterator<Item = Finding>) -> EvidenceTally {
        let mut tally = EvidenceTally::default();
        for finding in findings {
            tally.record(finding);
        }
        tally
    }
}

/// Reports of one full run across categories
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Assessment {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub reports: Vec<CategoryReport>,
    /// Any category detected
    pub detected: bool,
}

impl Assessment {
    pub fn new(started_at: DateTime<Utc>, reports: Vec<CategoryReport>) -> Self {
        let detected = reports.iter().any(CategoryReport::is_detected);
        Self {
            run_id: Uuid::new_v4(),
            started_at,
            reports,
            detected,
        }
    }

    pub fn report(&self, category: Category) -> Option<&CategoryReport> {
        self.reports.iter().find(|report| report.category == category)
    }
}
