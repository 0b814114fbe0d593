//! Probe descriptors
//!
//! A [`Probe`] is an immutable, named unit of work in one [`Category`]. Its
//! [`ProbeBody`] tells the execution context how it has to be dispatched:
//!
//! - `Inline`: ordinary (or deadline-aware blocking) closure run in-process
//! - `Contained`: fault-seeking body run in a forked child; `on_fault` is the
//!   probe's own reading of a fault
//! - `Terminal`: fault-seeking body run in-process under an exit-on-fault
//!   handler; a fault ends the run

pub mod builtin;
pub mod kinds;

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::types::{
    Category, Finding, Hazard, ProbeOutput, ProbeResult, DEFAULT_PROBE_TIMEOUT,
};
use crate::kernel::process::ChildFinding;

pub use kinds::{ProbeKind, ProbeSpec};

/// In-process probe body
pub type ProbeFn = Arc<dyn Fn(&ProbeContext) -> ProbeOutput + Send + Sync>;

/// How a probe body is invoked
#[derive(Clone)]
pub enum ProbeBody {
    Inline(ProbeFn),
    /// Runs in a forked child, so it must stay async-signal-safe
    Contained {
        body: fn() -> ChildFinding,
        on_fault: Finding,
    },
    /// Runs in-process; a fault exits the process with `exit_code`
    Terminal {
        body: fn() -> Finding,
        exit_code: i32,
    },
}

/// Per-invocation view handed to in-process bodies
#[derive(Clone, Copy, Debug)]
pub struct ProbeContext {
    started: Instant,
    deadline: Instant,
}

impl ProbeContext {
    pub fn new(timeout: Duration) -> Self {
        let started = Instant::now();
        Self {
            started,
            deadline: started + timeout,
        }
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    /// Point in time by which a blocking body must have decided
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn expired(&self) -> bool {
        Instant::now() >= self.deadline
    }
}

/// Side of a measurement that counts as anomalous
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Threshold {
    AtMost(u64),
    Below(u64),
    Above(u64),
}

impl Threshold {
    pub fn is_anomalous(self, value: u64) -> bool {
        match self {
            Threshold::AtMost(limit) => value <= limit,
            Threshold::Below(limit) => value < limit,
            Threshold::Above(limit) => value > limit,
        }
    }
}

impl fmt::Display for Threshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Threshold::AtMost(limit) => write!(f, "<= {limit}"),
            Threshold::Below(limit) => write!(f, "< {limit}"),
            Threshold::Above(limit) => write!(f, "> {limit}"),
        }
    }
}

/// A registered check. Identity is `name` within `category`.
#[derive(Clone)]
pub struct Probe {
    pub name: String,
    pub description: String,
    pub category: Category,
    pub hazard: Hazard,
    pub timeout: Duration,
    pub body: ProbeBody,
}

impl Probe {
    /// Non-hazardous probe run directly on the calling thread
    pub fn inline<F>(name: impl Into<String>, category: Category, run: F) -> Self
    where
        F: Fn(&ProbeContext) -> ProbeOutput + Send + Sync + 'static,
    {
        let name = name.into();
        Self {
            description: name.clone(),
            name,
            category,
            hazard: Hazard::None,
            timeout: DEFAULT_PROBE_TIMEOUT,
            body: ProbeBody::Inline(Arc::new(run)),
        }
    }

    /// Probe that blocks up to `timeout`; it reads its deadline from the context
    pub fn blocking<F>(name: impl Into<String>, category: Category, timeout: Duration, run: F) -> Self
    where
        F: Fn(&ProbeContext) -> ProbeOutput + Send + Sync + 'static,
    {
        let mut probe = Self::inline(name, category, run);
        probe.hazard = Hazard::MayBlockUnbounded;
        probe.timeout = timeout;
        probe
    }

    /// Fault-seeking probe run in a forked child
    pub fn contained(
        name: impl Into<String>,
        category: Category,
        body: fn() -> ChildFinding,
        on_fault: Finding,
    ) -> Self {
        let name = name.into();
        Self {
            description: name.clone(),
            name,
            category,
            hazard: Hazard::MayFault,
            timeout: DEFAULT_PROBE_TIMEOUT,
            body: ProbeBody::Contained { body, on_fault },
        }
    }

    /// Fault-seeking probe whose fault ends the process; always scheduled last
    pub fn terminal(
        name: impl Into<String>,
        category: Category,
        body: fn() -> Finding,
        exit_code: i32,
    ) -> Self {
        let name = name.into();
        Self {
            description: name.clone(),
            name,
            category,
            hazard: Hazard::MayFault,
            timeout: DEFAULT_PROBE_TIMEOUT,
            body: ProbeBody::Terminal { body, exit_code },
        }
    }

    /// Compare a measured quantity against a fixed threshold. A measurement of
    /// `None` is inconclusive.
    pub fn threshold<M>(
        name: impl Into<String>,
        category: Category,
        measure: M,
        threshold: Threshold,
    ) -> Self
    where
        M: Fn() -> Option<u64> + Send + Sync + 'static,
    {
        Self::inline(name, category, move |_| {
            Ok(match measure() {
                Some(value) => ProbeResult::with_diagnostic(
                    Finding::from_detected(threshold.is_anomalous(value)),
                    format!("measured {value}, anomalous when {threshold}"),
                ),
                None => ProbeResult::inconclusive("measurement unavailable"),
            })
        })
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Whether a fault in this probe ends the process
    pub fn is_terminal(&self) -> bool {
        matches!(self.body, ProbeBody::Terminal { .. })
    }
}

impl fmt::Debug for Probe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let body = match &self.body {
            ProbeBody::Inline(_) => "inline",
            ProbeBody::Contained { .. } => "contained",
            ProbeBody::Terminal { .. } => "terminal",
        };
        f.debug_struct("Probe")
            .field("name", &self.name)
            .field("category", &self.category)
            .field("hazard", &self.hazard)
            .field("timeout", &self.timeout)
            .field("body", &body)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn child_negative() -> ChildFinding {
        ChildFinding::Negative
    }

    fn no_backdoor() -> Finding {
        Finding::Negative
    }

    #[test]
    fn test_threshold_sides() {
        assert!(Threshold::AtMost(1).is_anomalous(1));
        assert!(!Threshold::AtMost(1).is_anomalous(4));
        assert!(Threshold::Below(8).is_anomalous(7));
        assert!(!Threshold::Below(8).is_anomalous(8));
        assert!(Threshold::Above(750).is_anomalous(751));
    }

    #[test]
    fn test_constructors_set_hazard() {
        let inline = Probe::inline("a", Category::Sandbox, |_| Ok(ProbeResult::negative()));
        assert_eq!(inline.hazard, Hazard::None);
        assert!(!inline.is_terminal());

        let blocking = Probe::blocking("b", Category::AutoAnalysis, Duration::from_secs(1), |_| {
            Ok(ProbeResult::negative())
        });
        assert_eq!(blocking.hazard, Hazard::MayBlockUnbounded);
        assert_eq!(blocking.timeout, Duration::from_secs(1));

        let contained =
            Probe::contained("c", Category::Sandbox, child_negative, Finding::Inconclusive);
        assert_eq!(contained.hazard, Hazard::MayFault);

        let terminal = Probe::terminal("d", Category::VirtualMachine, no_backdoor, 0)
            .with_description("Checking IN instruction");
        assert!(terminal.is_terminal());
        assert_eq!(terminal.description, "Checking IN instruction");
    }

    #[test]
    fn test_threshold_probe_evaluates_measurement() {
        let probe = Probe::threshold("cores", Category::Sandbox, || Some(4), Threshold::AtMost(1));
        let ProbeBody::Inline(run) = &probe.body else {
            panic!("threshold probes run inline");
        };
        let ctx = ProbeContext::new(probe.timeout);
        assert_eq!(run(&ctx).unwrap().finding, Finding::Negative);

        let probe = Probe::threshold("cores", Category::Sandbox, || None, Threshold::AtMost(1));
        let ProbeBody::Inline(run) = &probe.body else {
            panic!("threshold probes run inline");
        };
        assert_eq!(run(&ctx).unwrap().finding, Finding::Inconclusive);
    }

    #[test]
    fn test_context_deadline() {
        let ctx = ProbeContext::new(Duration::from_millis(20));
        assert!(!ctx.expired());
        assert!(ctx.remaining() <= Duration::from_millis(20));
        std::thread::sleep(Duration::from_millis(30));
        assert!(ctx.expired());
        assert_eq!(ctx.remaining(), Duration::ZERO);
    }
}
