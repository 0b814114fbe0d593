//! Probe runner and category entry points
//!
//! Probes of one category run sequentially in registry order. Outcomes are
//! streamed to a [`ReportSink`] as they are produced, so a terminal probe that
//! ends the process loses no earlier evidence.

use chrono::{DateTime, Utc};
use log::{debug, info};
use std::time::{Duration, Instant};

use crate::config::types::{Category, ExecutionOutcome, Finding, ProbeResult};
use crate::exec::ExecutionContext;
use crate::probe::Probe;
use crate::registry::{global_registry, ProbeRegistry};
use crate::verdict::{Assessment, CategoryReport, ReportEntry};

/// Receives outcomes while a run is in progress
pub trait ReportSink {
    fn category_started(&mut self, _category: Category, _probes: usize) {}

    fn probe_finished(&mut self, category: Category, entry: &ReportEntry);

    /// Called right before a terminal probe runs; anything buffered must be
    /// flushed here
    ///
    /// `on_fault` is the entry the probe would have if it faulted. The returned
    /// text is written to stdout as the process ends on such a fault, in place
    /// of the `probe_finished` call that never happens.
    fn before_terminal(
        &mut self,
        _category: Category,
        _probe: &Probe,
        _on_fault: &ReportEntry,
    ) -> Option<String> {
        None
    }

    fn category_finished(&mut self, _report: &CategoryReport) {}
}

/// Sink that discards everything
#[derive(Debug, Default)]
pub struct NullSink;

impl ReportSink for NullSink {
    fn probe_finished(&mut self, _category: Category, _entry: &ReportEntry) {}
}

#[derive(Clone, Copy, Debug, Default)]
pub struct RunOptions {
    /// Record terminal probes as inconclusive instead of running them
    pub skip_terminal: bool,
}

pub struct Runner<'r> {
    registry: &'r ProbeRegistry,
    context: ExecutionContext,
    options: RunOptions,
}

impl<'r> Runner<'r> {
    pub fn new(registry: &'r ProbeRegistry) -> Self {
        Self {
            registry,
            context: ExecutionContext::default(),
            options: RunOptions::default(),
        }
    }

    pub fn with_context(mut self, context: ExecutionContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    /// Run every probe of `category`; one entry per registered probe
    pub fn run_category(&self, category: Category, sink: &mut dyn ReportSink) -> CategoryReport {
        let started_at = Utc::now();
        let clock = Instant::now();
        let probes = self.registry.probes(category);
        info!("Running {} probes for {}", probes.len(), category);
        sink.category_started(category, probes.len());

        let entries = probes
            .into_iter()
            .map(|probe| self.dispatch(probe, sink))
            .collect();

        let report = CategoryReport::new(category, entries, started_at, millis(clock.elapsed()));
        info!(
            "{}: {:?} ({} positive, {} negative, {} inconclusive)",
            category,
            report.verdict,
            report.tally.positive,
            report.tally.negative,
            report.tally.inconclusive
        );
        sink.category_finished(&report);
        report
    }

    /// Run `categories` one after another on the calling thread
    pub fn run_all(&self, categories: &[Category], sink: &mut dyn ReportSink) -> Assessment {
        let started_at = Utc::now();
        let reports = categories
            .iter()
            .map(|&category| self.run_category(category, sink))
            .collect();
        Assessment::new(started_at, reports)
    }

    /// Run `categories` on scoped worker threads
    ///
    /// Hazardous probes still serialize on the execution lock. Terminal probes
    /// are held back until every worker has joined, then run in category order,
    /// so no category is cut short by another's terminal probe.
    pub fn run_all_concurrently(&self, categories: &[Category]) -> Assessment {
        let started_at = Utc::now();

        let partial: Vec<(Category, DateTime<Utc>, Instant, Vec<ReportEntry>)> =
            std::thread::scope(|scope| {
                let handles: Vec<_> = categories
                    .iter()
                    .map(|&category| {
                        scope.spawn(move || {
                            let started_at = Utc::now();
                            let clock = Instant::now();
                            let entries = self
                                .registry
                                .probes(category)
                                .into_iter()
                                .filter(|probe| !probe.is_terminal())
                                .map(|probe| self.dispatch(probe, &mut NullSink))
                                .collect();
                            (category, started_at, clock, entries)
                        })
                    })
                    .collect();
                handles
                    .into_iter()
                    .map(|handle| {
                        handle
                            .join()
                            .unwrap_or_else(|payload| std::panic::resume_unwind(payload))
                    })
                    .collect()
            });

        let reports = partial
            .into_iter()
            .map(|(category, category_started, clock, mut entries)| {
                if let Some(terminal) = self.registry.terminal(category) {
                    entries.push(self.dispatch(terminal, &mut NullSink));
                }
                CategoryReport::new(category, entries, category_started, millis(clock.elapsed()))
            })
            .collect();
        Assessment::new(started_at, reports)
    }

    fn dispatch(&self, probe: &Probe, sink: &mut dyn ReportSink) -> ReportEntry {
        let category = probe.category;
        let started = Instant::now();

        let outcome = if probe.is_terminal() && self.options.skip_terminal {
            debug!("Skipping terminal probe {}/{}", category, probe.name);
            ExecutionOutcome::completed(ProbeResult::inconclusive("terminal probe skipped"))
        } else {
            let notice = if probe.is_terminal() {
                sink.before_terminal(category, probe, &terminal_fault_entry(probe))
            } else {
                None
            };
            self.context.execute_with_notice(probe, notice.as_deref())
        };

        let entry = ReportEntry {
            name: probe.name.clone(),
            description: probe.description.clone(),
            hazard: probe.hazard,
            outcome,
            elapsed_ms: millis(started.elapsed()),
        };
        sink.probe_finished(category, &entry);
        entry
    }
}

/// Entry of a terminal probe whose fault ends the run. No backdoor answered, so
/// the probe reads as Negative.
fn terminal_fault_entry(probe: &Probe) -> ReportEntry {
    ReportEntry {
        name: probe.name.clone(),
        description: probe.description.clone(),
        hazard: probe.hazard,
        outcome: ExecutionOutcome::Crashed {
            signal: None,
            result: ProbeResult::with_diagnostic(Finding::Negative, "fault ended the run"),
        },
        elapsed_ms: 0,
    }
}

fn millis(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

/// Run the sandbox probes of the process-wide registry
pub fn detect_sandbox() -> CategoryReport {
    Runner::new(global_registry()).run_category(Category::Sandbox, &mut NullSink)
}

/// Run the virtual-machine probes of the process-wide registry
///
/// With the built-in tables this ends with the terminal backdoor probe, which
/// exits the process outside VMware.
pub fn detect_virtual_machine() -> CategoryReport {
    Runner::new(global_registry()).run_category(Category::VirtualMachine, &mut NullSink)
}

/// Run the automated-analysis probes of the process-wide registry
pub fn detect_auto_analysis() -> CategoryReport {
    Runner::new(global_registry()).run_category(Category::AutoAnalysis, &mut NullSink)
}
