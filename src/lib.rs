//! trustprobe: environment-trust probing
//! Decides at startup whether the process runs in a sandbox, a virtual machine
//! or an automated-analysis harness.
//!
//! # Architecture
//!
//! The crate is organized leaves first:
//!
//! ## Kernel Primitives ([`kernel`])
//! - [`kernel::signal`]: Process-wide fault handler slot and execution lock
//! - [`kernel::process`]: Fork-contained execution of fault-seeking bodies
//! - [`kernel::cpu`]: CPUID, RDTSC and the VMware backdoor port
//! - [`kernel::trace`]: ptrace-based tracer detection
//! - [`kernel::input`]: epoll input-event monitor
//!
//! ## Evidence Sources ([`evidence`])
//! - File and directory scans, host facts ([`evidence::host`]), clocks
//!   ([`evidence::clock`])
//!
//! ## Probes ([`probe`])
//! - [`probe::Probe`]: Named, categorized check with a declared hazard
//! - [`probe::kinds`]: Data-driven probe kinds built from configuration
//! - [`probe::builtin`]: Probes over the kernel primitives
//!
//! ## Execution ([`exec`])
//! - [`exec::context`]: Fault containment, deadlines, privilege misses
//!
//! ## Registry & Runner ([`registry`], [`runner`])
//! - Ordered probe lists per category, terminal probe last
//! - [`runner::detect_sandbox`], [`runner::detect_virtual_machine`],
//!   [`runner::detect_auto_analysis`]: category entry points
//!
//! ## Verdict ([`verdict`])
//! - [`verdict::VerdictClassifier`]: OR over positive evidence
//!
//! ## Configuration ([`config`])
//! - [`config::types`]: Shared type definitions and closed enums
//! - [`config::loader`]: JSON probe tables
//! - [`config::presets`]: Built-in probe tables
//! - [`config::validator`]: Configuration checks
//!
//! # Design Principles
//!
//! 1. **Stay alive and report** - No probe failure ends the run, except the one
//!    documented terminal probe, which always runs last
//! 2. **Inconclusive is not negative** - A denied or unreadable check carries no evidence
//! 3. **Scoped global state** - The fault handler slot is installed and restored
//!    around exactly one hazardous probe
//! 4. **Bounded blocking** - Every blocking probe has a deadline
//! 5. **Minimal unsafe** - Thin wrappers in [`kernel`] with explicit preconditions

// Kernel Primitives
pub mod kernel;

// Evidence Sources
pub mod evidence;

// Probes
pub mod probe;

// Execution
pub mod exec;

// Registry & Runner
pub mod registry;
pub mod runner;

// Verdict
pub mod verdict;

// Configuration
pub mod config;

// CLI entrypoint
pub mod cli;

// Re-export commonly used types for convenience
pub use config::types::*;
pub use config::ProbeConfig;
pub use exec::ExecutionContext;
pub use probe::{Probe, ProbeContext, Threshold};
pub use registry::{global_registry, init_registry, ProbeRegistry};
pub use runner::{detect_auto_analysis, detect_sandbox, detect_virtual_machine, ReportSink, RunOptions, Runner};
pub use verdict::{Assessment, CategoryReport, Verdict};
