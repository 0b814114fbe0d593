//! Fault-safe probe dispatch
//!
//! Every probe goes through [`ExecutionContext::execute`], which never fails and
//! never lets a probe end the process, terminal probes excepted:
//!
//! - inline bodies run under `catch_unwind`
//! - `MayBlockUnbounded` bodies run on a worker thread that is abandoned at
//!   `timeout + slack`
//! - contained bodies run in a forked child while this process holds the
//!   execution lock and the scoped fault handler
//! - terminal bodies run in-process under an exit-on-fault handler

use crossbeam_channel::{bounded, RecvTimeoutError};
use log::{debug, info, warn};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::{Duration, Instant};

use crate::config::types::{
    ExecutionOutcome, Finding, Hazard, PermissionMiss, ProbeOutput, ProbeResult,
};
use crate::kernel::process::{run_contained, ChildFinding, ContainedExit};
use crate::kernel::signal::{acquire_execution_lock, FaultMode, FaultSlot};
use crate::probe::{Probe, ProbeBody, ProbeContext, ProbeFn};

/// Default grace period past a blocking probe's timeout (one input polling tick)
pub const DEFAULT_SLACK: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug)]
pub struct ExecutionContext {
    slack: Duration,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new(DEFAULT_SLACK)
    }
}

impl ExecutionContext {
    pub fn new(slack: Duration) -> Self {
        Self { slack }
    }

    pub fn slack(&self) -> Duration {
        self.slack
    }

    /// Run one probe to an outcome
    pub fn execute(&self, probe: &Probe) -> ExecutionOutcome {
        self.execute_with_notice(probe, None)
    }

    /// Like [`execute`](Self::execute); a terminal probe that faults writes
    /// `notice` to stdout before the process ends
    pub fn execute_with_notice(&self, probe: &Probe, notice: Option<&str>) -> ExecutionOutcome {
        debug!(
            "Dispatching probe {}/{} ({:?}, timeout {:?})",
            probe.category, probe.name, probe.hazard, probe.timeout
        );
        let started = Instant::now();

        let outcome = match &probe.body {
            ProbeBody::Inline(run) if probe.hazard == Hazard::MayBlockUnbounded => {
                self.run_bounded(probe, run.clone())
            }
            ProbeBody::Inline(run) => run_inline(probe, run),
            ProbeBody::Contained { body, on_fault } => run_fault_contained(probe, *body, *on_fault),
            ProbeBody::Terminal { body, exit_code } => {
                run_terminal(probe, *body, *exit_code, notice)
            }
        };

        debug!(
            "Probe {}/{} -> {} {:?} in {:?}",
            probe.category,
            probe.name,
            outcome.status_name(),
            outcome.finding(),
            started.elapsed()
        );
        outcome
    }

    /// Blocking body on a worker thread; waits at most `timeout + slack`
    fn run_bounded(&self, probe: &Probe, run: ProbeFn) -> ExecutionOutcome {
        let ctx = ProbeContext::new(probe.timeout);
        let deadline = ctx.deadline();
        let (tx, rx) = bounded::<ProbeOutput>(1);

        let spawned = std::thread::Builder::new()
            .name(worker_name(&probe.name))
            .spawn(move || {
                let output = run(&ctx);
                // The receiver may have given up already.
                let _ = tx.send(output);
            });
        if let Err(e) = spawned {
            warn!("Failed to spawn worker for probe {}: {}", probe.name, e);
            return ExecutionOutcome::completed(ProbeResult::inconclusive(format!(
                "worker spawn failed: {e}"
            )));
        }

        match rx.recv_deadline(deadline + self.slack) {
            Ok(output) => {
                let reached_deadline = Instant::now() >= deadline;
                match output {
                    Err(miss) => permission_denied(probe, miss),
                    // Evaluated from whatever the body gathered up to its deadline.
                    Ok(result) if reached_deadline => ExecutionOutcome::TimedOut { result },
                    Ok(result) => ExecutionOutcome::completed(result),
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "Probe {} did not return within {:?} + {:?}; abandoning worker",
                    probe.name, probe.timeout, self.slack
                );
                ExecutionOutcome::TimedOut {
                    result: ProbeResult::inconclusive("no decision before the deadline"),
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                warn!("Probe {} panicked on its worker thread", probe.name);
                ExecutionOutcome::Crashed {
                    signal: None,
                    result: ProbeResult::inconclusive("probe panicked"),
                }
            }
        }
    }
}

/// Thread name for a blocking body. `Builder::spawn` panics on interior NULs.
fn worker_name(probe_name: &str) -> String {
    let cleaned: String = probe_name
        .chars()
        .map(|c| if c.is_control() { '?' } else { c })
        .collect();
    format!("probe-{cleaned}")
}

fn run_inline(probe: &Probe, run: &ProbeFn) -> ExecutionOutcome {
    let ctx = ProbeContext::new(probe.timeout);
    match catch_unwind(AssertUnwindSafe(|| run(&ctx))) {
        Ok(Ok(result)) => ExecutionOutcome::completed(result),
        Ok(Err(miss)) => permission_denied(probe, miss),
        Err(_) => {
            warn!("Probe {} panicked", probe.name);
            ExecutionOutcome::Crashed {
                signal: None,
                result: ProbeResult::inconclusive("probe panicked"),
            }
        }
    }
}

fn run_fault_contained(
    probe: &Probe,
    body: fn() -> ChildFinding,
    on_fault: Finding,
) -> ExecutionOutcome {
    let lock = acquire_execution_lock();
    let slot = match FaultSlot::install(&lock, FaultMode::Contain) {
        Ok(slot) => slot,
        Err(e) => {
            warn!("Probe {} not run: {}", probe.name, e);
            return ExecutionOutcome::completed(ProbeResult::inconclusive(e.to_string()));
        }
    };
    let exit = run_contained(body, probe.timeout);
    // Restore before the next probe can be dispatched, whatever the child did.
    drop(slot);
    drop(lock);

    match exit {
        Ok(ContainedExit::Finished(ChildFinding::Denied)) => permission_denied(
            probe,
            PermissionMiss("operation not permitted".to_string()),
        ),
        Ok(ContainedExit::Finished(finding)) => {
            ExecutionOutcome::completed(ProbeResult::new(finding.finding()))
        }
        Ok(ContainedExit::Faulted { signal }) => {
            info!(
                "Probe {} faulted (signal {:?}); contained as {:?}",
                probe.name, signal, on_fault
            );
            ExecutionOutcome::Crashed {
                signal,
                result: ProbeResult::with_diagnostic(on_fault, "fault contained"),
            }
        }
        Ok(ContainedExit::Panicked) => {
            warn!("Probe {} panicked in its child", probe.name);
            ExecutionOutcome::Crashed {
                signal: None,
                result: ProbeResult::inconclusive("probe panicked"),
            }
        }
        Ok(ContainedExit::TimedOut) => ExecutionOutcome::TimedOut {
            result: ProbeResult::inconclusive("child killed at the deadline"),
        },
        Ok(ContainedExit::Unexpected(detail)) => {
            warn!("Probe {} child ended unexpectedly: {}", probe.name, detail);
            ExecutionOutcome::Crashed {
                signal: None,
                result: ProbeResult::inconclusive(detail),
            }
        }
        Err(e) => {
            warn!("Probe {} could not be contained: {}", probe.name, e);
            ExecutionOutcome::completed(ProbeResult::inconclusive(e.to_string()))
        }
    }
}

fn run_terminal(
    probe: &Probe,
    body: fn() -> Finding,
    exit_code: i32,
    notice: Option<&str>,
) -> ExecutionOutcome {
    let lock = acquire_execution_lock();
    let slot = match FaultSlot::install(&lock, FaultMode::Terminal { exit_code }) {
        Ok(slot) => slot,
        Err(e) => {
            warn!("Terminal probe {} not run: {}", probe.name, e);
            return ExecutionOutcome::completed(ProbeResult::inconclusive(e.to_string()));
        }
    };
    if let Some(notice) = notice {
        slot.set_terminal_notice(notice.as_bytes());
    }
    info!(
        "Running terminal probe {}; a fault ends the process with status {}",
        probe.name, exit_code
    );
    let finding = body();
    drop(slot);
    ExecutionOutcome::completed(ProbeResult::new(finding))
}

fn permission_denied(probe: &Probe, miss: PermissionMiss) -> ExecutionOutcome {
    info!("Probe {} lacks privilege: {}", probe.name, miss);
    ExecutionOutcome::PermissionDenied { detail: miss.0 }
}
