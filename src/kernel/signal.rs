//! Process-wide fault handler slot
//!
//! Signal dispositions are process state, so at most one hazardous probe may own
//! them at a time. Ownership is expressed as two nested guards:
//! [`ExecutionLock`] serializes hazardous dispatch across threads, and
//! [`FaultSlot`] installs the fault handler and restores the previous
//! dispositions when dropped, on every exit path.

use log::{debug, warn};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::config::types::{ProbeError, Result};

/// Signals a fault-seeking probe can raise
pub const FAULT_SIGNALS: [Signal; 4] = [
    Signal::SIGSEGV,
    Signal::SIGILL,
    Signal::SIGBUS,
    Signal::SIGFPE,
];

/// Exit status used by a contained child whose fault handler fired
pub const FAULT_EXIT_CODE: i32 = 86;

const UNSAVED: Option<SigAction> = None;

const MODE_CONTAIN: u8 = 0;
const MODE_TERMINAL: u8 = 1;

/// Serializes "install handler -> run hazardous probe -> restore handler"
static EXECUTION_LOCK: Mutex<()> = Mutex::new(());

/// Handler state read from signal context (async-safe atomics only)
static HANDLER_MODE: AtomicU8 = AtomicU8::new(MODE_CONTAIN);
static OWNER_PID: AtomicI32 = AtomicI32::new(0);
static TERMINAL_EXIT_CODE: AtomicI32 = AtomicI32::new(0);

/// Largest pre-rendered report line the terminal handler can emit
pub const TERMINAL_NOTICE_CAPACITY: usize = 4096;

#[allow(clippy::declare_interior_mutable_const)]
const NOTICE_BYTE: AtomicU8 = AtomicU8::new(0);

/// Line written to stdout by the terminal handler before it exits
static TERMINAL_NOTICE: [AtomicU8; TERMINAL_NOTICE_CAPACITY] =
    [NOTICE_BYTE; TERMINAL_NOTICE_CAPACITY];
static TERMINAL_NOTICE_LEN: AtomicUsize = AtomicUsize::new(0);

static SLOT_OCCUPIED: AtomicBool = AtomicBool::new(false);
static INSTALLATIONS: AtomicU64 = AtomicU64::new(0);

/// What the installed handler does when a fault arrives
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultMode {
    /// A forked child running the probe exits with [`FAULT_EXIT_CODE`]
    Contain,
    /// The process writes a fixed notice to stderr and exits with `exit_code`
    Terminal { exit_code: i32 },
}

/// Cross-thread lock guarding the handler slot
pub struct ExecutionLock {
    _guard: MutexGuard<'static, ()>,
}

/// Block until no other hazardous probe owns the handler slot
pub fn acquire_execution_lock() -> ExecutionLock {
    // A panic while holding the lock cannot leave the slot installed: FaultSlot
    // restores on unwind. Poisoning carries no information here.
    let guard = EXECUTION_LOCK
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    ExecutionLock { _guard: guard }
}

/// Installed fault handler; restores the previous dispositions on drop
pub struct FaultSlot<'l> {
    previous: [Option<SigAction>; FAULT_SIGNALS.len()],
    _lock: &'l ExecutionLock,
}

impl<'l> FaultSlot<'l> {
    /// Install the fault handler for every signal in [`FAULT_SIGNALS`]
    ///
    /// Requires the execution lock, which ties the slot's lifetime to it.
    pub fn install(lock: &'l ExecutionLock, mode: FaultMode) -> Result<Self> {
        match mode {
            FaultMode::Contain => HANDLER_MODE.store(MODE_CONTAIN, Ordering::SeqCst),
            FaultMode::Terminal { exit_code } => {
                TERMINAL_EXIT_CODE.store(exit_code, Ordering::SeqCst);
                HANDLER_MODE.store(MODE_TERMINAL, Ordering::SeqCst);
            }
        }
        OWNER_PID.store(std::process::id() as i32, Ordering::SeqCst);

        let action = SigAction::new(
            SigHandler::Handler(on_fault),
            SaFlags::empty(),
            SigSet::empty(),
        );

        let mut slot = FaultSlot {
            previous: [UNSAVED; FAULT_SIGNALS.len()],
            _lock: lock,
        };
        for (index, sig) in FAULT_SIGNALS.iter().enumerate() {
            // SAFETY: on_fault only touches atomics and async-signal-safe libc calls.
            // On failure the partially filled slot is dropped and restores what it saved.
            let previous = unsafe { signal::sigaction(*sig, &action) }
                .map_err(|e| ProbeError::Signal(format!("failed to install {sig:?} handler: {e}")))?;
            slot.previous[index] = Some(previous);
        }

        SLOT_OCCUPIED.store(true, Ordering::SeqCst);
        INSTALLATIONS.fetch_add(1, Ordering::SeqCst);
        debug!("Fault handler installed ({:?})", mode);
        Ok(slot)
    }

    /// Report line the terminal handler writes to stdout before exiting
    ///
    /// Truncated to [`TERMINAL_NOTICE_CAPACITY`] bytes. Cleared when the slot is
    /// dropped.
    pub fn set_terminal_notice(&self, notice: &[u8]) {
        let len = notice.len().min(TERMINAL_NOTICE_CAPACITY);
        TERMINAL_NOTICE_LEN.store(0, Ordering::SeqCst);
        for (cell, byte) in TERMINAL_NOTICE.iter().zip(&notice[..len]) {
            cell.store(*byte, Ordering::Relaxed);
        }
        TERMINAL_NOTICE_LEN.store(len, Ordering::SeqCst);
    }
}

impl Drop for FaultSlot<'_> {
    fn drop(&mut self) {
        for (index, sig) in FAULT_SIGNALS.iter().enumerate() {
            if let Some(previous) = self.previous[index].take() {
                // SAFETY: restoring a disposition previously returned by sigaction.
                if let Err(e) = unsafe { signal::sigaction(*sig, &previous) } {
                    warn!("Failed to restore {:?} disposition: {}", sig, e);
                }
            }
        }
        HANDLER_MODE.store(MODE_CONTAIN, Ordering::SeqCst);
        TERMINAL_NOTICE_LEN.store(0, Ordering::SeqCst);
        SLOT_OCCUPIED.store(false, Ordering::SeqCst);
        debug!("Fault handler removed");
    }
}

/// Async-safe fault handler
extern "C" fn on_fault(sig: libc::c_int) {
    if HANDLER_MODE.load(Ordering::SeqCst) == MODE_TERMINAL {
        let msg = b"trustprobe: terminal probe faulted, ending run\n";
        let notice_len = TERMINAL_NOTICE_LEN.load(Ordering::SeqCst);
        // SAFETY: write(2) and _exit(2) are async-signal-safe. AtomicU8 has the
        // in-memory representation of u8 and the notice is not written while the
        // slot is installed and its probe runs.
        unsafe {
            if notice_len > 0 {
                libc::write(1, TERMINAL_NOTICE.as_ptr() as *const libc::c_void, notice_len);
            }
            libc::write(2, msg.as_ptr() as *const libc::c_void, msg.len());
            libc::_exit(TERMINAL_EXIT_CODE.load(Ordering::SeqCst));
        }
    }

    // SAFETY: getpid(2) is async-signal-safe.
    if unsafe { libc::getpid() } != OWNER_PID.load(Ordering::SeqCst) {
        // SAFETY: contained child; nothing to unwind.
        unsafe { libc::_exit(FAULT_EXIT_CODE) };
    }

    // The owning process itself faulted outside any contained child. Fall back to
    // the default action; returning re-executes the faulting instruction.
    // SAFETY: signal(2) with SIG_DFL is async-signal-safe.
    unsafe {
        libc::signal(sig, libc::SIG_DFL);
    }
}

/// Whether a handler is currently held by a hazardous probe
pub fn slot_occupied() -> bool {
    SLOT_OCCUPIED.load(Ordering::SeqCst)
}

/// Number of handler installations since process start
pub fn installation_count() -> u64 {
    INSTALLATIONS.load(Ordering::SeqCst)
}

/// Query the kernel for whether our fault handler is the active disposition of
/// any fault signal
pub fn fault_handler_installed() -> bool {
    FAULT_SIGNALS.iter().any(|sig| {
        // SAFETY: zeroed sigaction is a valid out-parameter; a null `act` only queries.
        let mut current: libc::sigaction = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::sigaction(*sig as libc::c_int, std::ptr::null(), &mut current) };
        rc == 0 && current.sa_sigaction == on_fault as *const () as libc::sighandler_t
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_installs_and_restores() {
        let lock = acquire_execution_lock();
        {
            let _slot = FaultSlot::install(&lock, FaultMode::Contain).unwrap();
            assert!(slot_occupied());
            assert!(fault_handler_installed());
        }
        assert!(!slot_occupied());
        assert!(!fault_handler_installed());
    }

    #[test]
    fn test_back_to_back_installations_are_independent() {
        let lock = acquire_execution_lock();
        let before = installation_count();

        let first = FaultSlot::install(&lock, FaultMode::Contain).unwrap();
        drop(first);
        assert!(!fault_handler_installed());

        let second = FaultSlot::install(&lock, FaultMode::Terminal { exit_code: 3 }).unwrap();
        assert!(fault_handler_installed());
        drop(second);

        assert!(!fault_handler_installed());
        assert!(installation_count() >= before + 2);
    }

    #[test]
    fn test_terminal_notice_is_cleared_with_the_slot() {
        let lock = acquire_execution_lock();
        {
            let slot = FaultSlot::install(&lock, FaultMode::Terminal { exit_code: 3 }).unwrap();
            slot.set_terminal_notice(b"vm backdoor Not detected!\n");
            assert_eq!(TERMINAL_NOTICE_LEN.load(Ordering::SeqCst), 26);
            assert_eq!(TERMINAL_NOTICE[0].load(Ordering::SeqCst), b'v');

            slot.set_terminal_notice(&[b'x'; TERMINAL_NOTICE_CAPACITY + 10]);
            assert_eq!(
                TERMINAL_NOTICE_LEN.load(Ordering::SeqCst),
                TERMINAL_NOTICE_CAPACITY
            );
        }
        assert_eq!(TERMINAL_NOTICE_LEN.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_contained_child_fault_exits_with_fault_code() {
        use nix::sys::wait::{waitpid, WaitStatus};
        use nix::unistd::{fork, ForkResult};

        let lock = acquire_execution_lock();
        let slot = FaultSlot::install(&lock, FaultMode::Contain).unwrap();
        match unsafe { fork() }.unwrap() {
            ForkResult::Child => unsafe {
                libc::raise(libc::SIGSEGV);
                libc::_exit(0);
            },
            ForkResult::Parent { child } => {
                drop(slot);
                let status = waitpid(child, None).unwrap();
                assert_eq!(status, WaitStatus::Exited(child, FAULT_EXIT_CODE));
            }
        }
    }
}
