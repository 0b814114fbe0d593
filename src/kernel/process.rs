//! Fork-contained execution of fault-seeking probe bodies.
//!
//! The body runs in a forked child so a fault (or a hang) can never take the
//! parent down. The child reports its finding through its exit status; the
//! parent polls `waitpid` against a deadline and kills the child when it expires.

use log::{debug, warn};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use std::time::{Duration, Instant};

use crate::config::types::{Finding, ProbeError, Result};
use crate::kernel::signal::{FAULT_EXIT_CODE, FAULT_SIGNALS};

const EXIT_NEGATIVE: i32 = 80;
const EXIT_POSITIVE: i32 = 81;
const EXIT_INCONCLUSIVE: i32 = 82;
const EXIT_DENIED: i32 = 83;
const EXIT_PANICKED: i32 = 84;

const POLL_INTERVAL: Duration = Duration::from_millis(2);

/// Finding reported from inside a contained child
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChildFinding {
    Positive,
    Negative,
    Inconclusive,
    /// The operation was rejected for lack of privilege
    Denied,
}

impl ChildFinding {
    fn exit_code(self) -> i32 {
        match self {
            ChildFinding::Positive => EXIT_POSITIVE,
            ChildFinding::Negative => EXIT_NEGATIVE,
            ChildFinding::Inconclusive => EXIT_INCONCLUSIVE,
            ChildFinding::Denied => EXIT_DENIED,
        }
    }

    /// The tri-state this child finding contributes; `Denied` carries no evidence
    pub fn finding(self) -> Finding {
        match self {
            ChildFinding::Positive => Finding::Positive,
            ChildFinding::Negative => Finding::Negative,
            ChildFinding::Inconclusive | ChildFinding::Denied => Finding::Inconclusive,
        }
    }
}

impl From<Finding> for ChildFinding {
    fn from(finding: Finding) -> Self {
        match finding {
            Finding::Positive => ChildFinding::Positive,
            Finding::Negative => ChildFinding::Negative,
            Finding::Inconclusive => ChildFinding::Inconclusive,
        }
    }
}

/// How a contained child ended
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ContainedExit {
    Finished(ChildFinding),
    /// A fault signal killed the child or its fault handler fired
    Faulted { signal: Option<i32> },
    Panicked,
    /// Killed after the deadline
    TimedOut,
    /// Any other termination (unexpected exit code or signal)
    Unexpected(String),
}

/// Run `body` in a forked child and wait for it until `timeout`
///
/// The child must only use async-signal-safe operations: the parent may be
/// multi-threaded and locks held by other threads are not released in the child.
pub fn run_contained(body: fn() -> ChildFinding, timeout: Duration) -> Result<ContainedExit> {
    // SAFETY: the child calls `body` and terminates with _exit; it never returns
    // into the parent's stack frames nor runs destructors or atexit hooks.
    match unsafe { fork() }.map_err(|e| ProbeError::Process(format!("fork: {e}")))? {
        ForkResult::Child => {
            let code = match std::panic::catch_unwind(body) {
                Ok(finding) => finding.exit_code(),
                Err(_) => EXIT_PANICKED,
            };
            // SAFETY: terminate the child without unwinding into parent state.
            unsafe { libc::_exit(code) }
        }
        ForkResult::Parent { child } => wait_with_deadline(child, timeout),
    }
}

fn wait_with_deadline(child: Pid, timeout: Duration) -> Result<ContainedExit> {
    let started = Instant::now();
    loop {
        match waitpid(child, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {
                if started.elapsed() >= timeout {
                    warn!("Contained child {} exceeded {:?}, killing", child, timeout);
                    let _ = kill(child, Signal::SIGKILL);
                    reap(child);
                    return Ok(ContainedExit::TimedOut);
                }
                std::thread::sleep(POLL_INTERVAL);
            }
            Ok(WaitStatus::Exited(_, code)) => {
                debug!("Contained child {} exited with {}", child, code);
                return Ok(decode_exit(code));
            }
            Ok(WaitStatus::Signaled(_, sig, _)) => {
                if FAULT_SIGNALS.contains(&sig) {
                    return Ok(ContainedExit::Faulted {
                        signal: Some(sig as i32),
                    });
                }
                return Ok(ContainedExit::Unexpected(format!("killed by {sig:?}")));
            }
            Ok(_) => continue,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(ProbeError::Process(format!("waitpid({child}): {e}"))),
        }
    }
}

fn reap(child: Pid) {
    loop {
        match waitpid(child, None) {
            Err(nix::errno::Errno::EINTR) => continue,
            _ => return,
        }
    }
}

fn decode_exit(code: i32) -> ContainedExit {
    match code {
        EXIT_POSITIVE => ContainedExit::Finished(ChildFinding::Positive),
        EXIT_NEGATIVE => ContainedExit::Finished(ChildFinding::Negative),
        EXIT_INCONCLUSIVE => ContainedExit::Finished(ChildFinding::Inconclusive),
        EXIT_DENIED => ContainedExit::Finished(ChildFinding::Denied),
        EXIT_PANICKED => ContainedExit::Panicked,
        FAULT_EXIT_CODE => ContainedExit::Faulted { signal: None },
        other => ContainedExit::Unexpected(format!("exit code {other}")),
    }
}
