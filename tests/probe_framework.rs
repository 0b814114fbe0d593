//! Integration tests for the probe framework
//!
//! Registry -> runner -> execution context -> aggregator, end to end.
//! Environment-dependent probes are only asserted to stay alive and within
//! their deadlines, never for a particular finding.

use std::path::Path;
use std::time::{Duration, Instant};

use trustprobe::config::types::{Category, ExecutionOutcome, Finding, Hazard, ProbeResult};
use trustprobe::evidence::{directory_contains_any_name, file_contains_any};
use trustprobe::exec::ExecutionContext;
use trustprobe::kernel::process::ChildFinding;
use trustprobe::kernel::signal::{acquire_execution_lock, fault_handler_installed, slot_occupied};
use trustprobe::probe::builtin;
use trustprobe::runner::NullSink;
use trustprobe::{Probe, ProbeConfig, ProbeRegistry, RunOptions, Runner, Threshold, Verdict};

fn fixed(name: &str, category: Category, finding: Finding) -> Probe {
    Probe::inline(name, category, move |_| Ok(ProbeResult::new(finding)))
}

fn privileged_instruction() -> ChildFinding {
    // SAFETY: runs inside the contained child; the fault is the expected path.
    unsafe {
        libc::raise(libc::SIGILL);
    }
    ChildFinding::Positive
}

fn segfaulting_instruction() -> ChildFinding {
    // SAFETY: runs inside the contained child.
    unsafe {
        libc::raise(libc::SIGSEGV);
    }
    ChildFinding::Positive
}

#[test]
fn test_aggregation_scenarios() {
    let cases = [
        (
            vec![Finding::Negative, Finding::Inconclusive, Finding::Positive],
            Verdict::Detected,
        ),
        (
            vec![Finding::Negative, Finding::Inconclusive, Finding::Negative],
            Verdict::NotDetected,
        ),
        (vec![], Verdict::NotDetected),
    ];

    for (findings, expected) in cases {
        let mut registry = ProbeRegistry::new();
        for (index, finding) in findings.iter().enumerate() {
            registry
                .register(fixed(&format!("p{index}"), Category::Sandbox, *finding))
                .unwrap();
        }
        let report = Runner::new(&registry).run_category(Category::Sandbox, &mut NullSink);
        assert_eq!(report.verdict, expected, "findings {:?}", findings);
        assert_eq!(report.len(), findings.len());
    }
}

#[test]
fn test_single_core_threshold_on_multi_core_host() {
    let mut registry = ProbeRegistry::new();
    registry
        .register(Probe::threshold(
            "cpu_cores",
            Category::Sandbox,
            || Some(4),
            Threshold::AtMost(1),
        ))
        .unwrap();

    let report = Runner::new(&registry).run_category(Category::Sandbox, &mut NullSink);
    assert_eq!(report.entries[0].finding(), Finding::Negative);
    assert!(matches!(
        report.entries[0].outcome,
        ExecutionOutcome::Completed { .. }
    ));
    assert_eq!(report.verdict, Verdict::NotDetected);
}

#[test]
fn test_fault_seeking_probe_is_contained_and_run_continues() {
    let mut registry = ProbeRegistry::new();
    registry
        .register(Probe::contained(
            "in_instruction",
            Category::VirtualMachine,
            privileged_instruction,
            Finding::Negative,
        ))
        .unwrap();
    registry
        .register(fixed("after", Category::VirtualMachine, Finding::Positive))
        .unwrap();

    let report = Runner::new(&registry).run_category(Category::VirtualMachine, &mut NullSink);

    assert_eq!(report.len(), 2);
    match &report.entries[0].outcome {
        ExecutionOutcome::Crashed { result, .. } => assert_eq!(result.finding, Finding::Negative),
        other => panic!("expected a contained crash, got {other:?}"),
    }
    assert_eq!(report.entries[0].hazard, Hazard::MayFault);
    // The process survived to run the next probe.
    assert_eq!(report.entries[1].finding(), Finding::Positive);
}

#[test]
fn test_back_to_back_hazardous_probes_release_the_slot() {
    let context = ExecutionContext::default();
    let first = Probe::contained("first", Category::Sandbox, segfaulting_instruction, Finding::Negative);
    let second = Probe::contained("second", Category::Sandbox, privileged_instruction, Finding::Positive);

    let outcome = context.execute(&first);
    assert_eq!(outcome.finding(), Finding::Negative);
    {
        let _lock = acquire_execution_lock();
        assert!(!slot_occupied());
        assert!(!fault_handler_installed());
    }

    let outcome = context.execute(&second);
    assert_eq!(outcome.finding(), Finding::Positive);
    let _lock = acquire_execution_lock();
    assert!(!slot_occupied());
    assert!(!fault_handler_installed());
}

#[test]
fn test_blocking_probe_returns_within_timeout_plus_slack() {
    // Tolerance: one tick of slack plus 100 ms of scheduling noise.
    let dir = tempfile::tempdir().unwrap();
    let fifo = dir.path().join("event0");
    let c_path = std::ffi::CString::new(fifo.to_str().unwrap()).unwrap();
    assert_eq!(unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) }, 0);
    let _writer = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(&fifo)
        .unwrap();

    let window = Duration::from_millis(400);
    let tick = Duration::from_millis(100);
    let probe = builtin::input_events(
        "input_events",
        Category::AutoAnalysis,
        dir.path().to_path_buf(),
        window,
        tick,
        10,
    );

    let started = Instant::now();
    let outcome = ExecutionContext::new(tick).execute(&probe);
    let elapsed = started.elapsed();

    assert!(elapsed >= window);
    assert!(elapsed < window + tick + Duration::from_millis(100));
    // No events arrived: too few for a human at the keyboard.
    assert_eq!(
        outcome,
        ExecutionOutcome::TimedOut {
            result: ProbeResult::with_diagnostic(Finding::Positive, "0 events on 1 devices")
        }
    );
}

#[test]
fn test_unreadable_input_devices_are_not_negative() {
    let probe = builtin::input_events(
        "input_events",
        Category::AutoAnalysis,
        "/nonexistent/input".into(),
        Duration::from_millis(100),
        Duration::from_millis(10),
        10,
    );
    let outcome = ExecutionContext::default().execute(&probe);
    assert_eq!(outcome.finding(), Finding::Inconclusive);
}

#[test]
fn test_unreadable_input_devices_are_permission_denied() {
    use std::os::unix::fs::PermissionsExt;

    if unsafe { libc::geteuid() } == 0 {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let device = dir.path().join("event0");
    std::fs::File::create(&device).unwrap();
    std::fs::set_permissions(&device, std::fs::Permissions::from_mode(0o000)).unwrap();

    let probe = builtin::input_events(
        "input_events",
        Category::AutoAnalysis,
        dir.path().to_path_buf(),
        Duration::from_millis(100),
        Duration::from_millis(10),
        10,
    );
    let outcome = ExecutionContext::default().execute(&probe);
    assert!(
        matches!(outcome, ExecutionOutcome::PermissionDenied { .. }),
        "{outcome:?}"
    );
    assert_eq!(outcome.finding(), Finding::Inconclusive);
}

#[test]
fn test_empty_category_is_not_an_error() {
    let registry = ProbeRegistry::from_config(&ProbeConfig::empty()).unwrap();
    for category in Category::ALL {
        let report = Runner::new(&registry).run_category(category, &mut NullSink);
        assert!(report.is_empty());
        assert_eq!(report.verdict, Verdict::NotDetected);
    }
}

#[test]
fn test_concurrent_categories_share_the_execution_lock() {
    let mut registry = ProbeRegistry::new();
    for category in Category::ALL {
        for index in 0..3 {
            registry
                .register(Probe::contained(
                    format!("fault{index}"),
                    category,
                    segfaulting_instruction,
                    Finding::Negative,
                ))
                .unwrap();
        }
        registry
            .register(fixed("clean", category, Finding::Negative))
            .unwrap();
    }

    let assessment = Runner::new(&registry).run_all_concurrently(&Category::ALL);
    assert_eq!(assessment.reports.len(), 3);
    for report in &assessment.reports {
        assert_eq!(report.len(), 4);
        assert!(report
            .entries
            .iter()
            .take(3)
            .all(|entry| entry.outcome.status_name() == "crashed"));
    }
    assert!(!assessment.detected);
    let _lock = acquire_execution_lock();
    assert!(!fault_handler_installed());
}

#[test]
fn test_concurrent_run_defers_terminal_probes() {
    fn no_backdoor() -> Finding {
        Finding::Negative
    }

    let mut registry = ProbeRegistry::new();
    registry
        .register(Probe::terminal("in", Category::VirtualMachine, no_backdoor, 0))
        .unwrap();
    registry
        .register(fixed("bios", Category::VirtualMachine, Finding::Negative))
        .unwrap();
    registry
        .register(fixed("cores", Category::Sandbox, Finding::Positive))
        .unwrap();

    let assessment = Runner::new(&registry)
        .run_all_concurrently(&[Category::VirtualMachine, Category::Sandbox]);
    let vm = assessment.report(Category::VirtualMachine).unwrap();
    let names: Vec<&str> = vm.entries.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["bios", "in"]);
    assert!(assessment.detected);
}

#[test]
fn test_builtin_sandbox_run_is_repeatable() {
    // Drop the slow and hazardous probes; the rest read stable host state.
    let mut config = ProbeConfig::default();
    config.sandbox.retain(|spec| spec.kind.hazard() == Hazard::None);
    config.virtual_machine.retain(|spec| spec.kind.hazard() == Hazard::None);
    config.auto_analysis.clear();
    let registry = ProbeRegistry::from_config(&config).unwrap();
    let runner = Runner::new(&registry).with_options(RunOptions {
        skip_terminal: true,
    });

    let first = runner.run_category(Category::Sandbox, &mut NullSink);
    let second = runner.run_category(Category::Sandbox, &mut NullSink);
    let findings = |report: &trustprobe::CategoryReport| {
        report.entries.iter().map(|e| e.finding()).collect::<Vec<_>>()
    };
    assert_eq!(first.len(), registry.len(Category::Sandbox));
    assert_eq!(findings(&first), findings(&second));
    assert_eq!(first.verdict, second.verdict);

    let vm = runner.run_category(Category::VirtualMachine, &mut NullSink);
    assert_eq!(vm.len(), registry.len(Category::VirtualMachine));
}

fn tracer_pid() -> String {
    std::fs::read_to_string("/proc/self/status")
        .unwrap()
        .lines()
        .find(|line| line.starts_with("TracerPid:"))
        .unwrap()
        .to_string()
}

#[test]
fn test_builtin_ptrace_probes_do_not_trace_the_runner() {
    let before = tracer_pid();
    let context = ExecutionContext::default();
    for probe in [
        builtin::ptrace_attach("ptrace_attach", Category::Sandbox),
        builtin::ptrace_intercepted("ptrace_intercepted", Category::Sandbox),
    ] {
        let outcome = context.execute(&probe);
        // The finding depends on Yama and on whether the test runner is traced.
        assert_ne!(outcome.status_name(), "crashed", "{}: {:?}", probe.name, outcome);
    }
    assert_eq!(tracer_pid(), before);
}

#[test]
fn test_evidence_primitives_never_fail() {
    assert!(!file_contains_any(Path::new("/nonexistent"), &["x"]));
    let dir = tempfile::tempdir().unwrap();
    assert!(!directory_contains_any_name(dir.path(), &["gdb"]));
}
