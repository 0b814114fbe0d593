//! Evidence aggregation
//!
//! Derives category verdicts as pure functions over the recorded outcomes.

pub mod verdict;

pub use verdict::{
    Assessment, CategoryReport, EvidenceTally, ReportEntry, Verdict, VerdictClassifier,
};
