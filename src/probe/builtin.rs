//! Built-in probes over the kernel primitives: tracer detection, CPU
//! instructions, the VMware backdoor, input-event monitoring and sleep drift.

use log::debug;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::types::{Category, Finding, PermissionMiss, ProbeResult};
use crate::evidence::{measure_drift_under_sleep, ClockSource};
use crate::kernel::input::{monitor_input_events, InputError};
use crate::kernel::process::ChildFinding;
use crate::kernel::{cpu, trace};
use crate::probe::{Probe, Threshold};

const UNSUPPORTED_ARCH: &str = "unsupported architecture";

/// PTRACE_SEIZE of the prober from a child; positive when a tracer holds it
pub fn ptrace_attach(name: &str, category: Category) -> Probe {
    Probe::contained(name, category, trace::seize_parent, Finding::Inconclusive)
}

/// Two PTRACE_TRACEME calls from a child; positive when both succeed
pub fn ptrace_intercepted(name: &str, category: Category) -> Probe {
    Probe::contained(name, category, trace::traceme_twice, Finding::Inconclusive)
}

pub fn cpuid_hypervisor_bit(name: &str, category: Category) -> Probe {
    Probe::inline(name, category, |_| {
        Ok(match cpu::hypervisor_bit() {
            Some(set) => ProbeResult::detected(set),
            None => ProbeResult::inconclusive(UNSUPPORTED_ARCH),
        })
    })
}

/// Hypervisor leaf vendor equals one of `signatures`
pub fn cpuid_vendor(name: &str, category: Category, signatures: Vec<String>) -> Probe {
    Probe::inline(name, category, move |_| {
        let Some(vendor) = cpu::hypervisor_vendor() else {
            return Ok(ProbeResult::inconclusive(UNSUPPORTED_ARCH));
        };
        let detected = signatures.iter().any(|signature| *signature == vendor);
        Ok(ProbeResult::with_diagnostic(
            Finding::from_detected(detected),
            format!("vendor {vendor:?}"),
        ))
    })
}

/// Mean TSC cost of a forced VM exit, sampled every `interval`
///
/// Sampling stops at the deadline; the mean covers the samples actually taken.
/// A negative mean (TSC going backwards) is as anomalous as a slow exit.
pub fn vmexit_latency(
    name: &str,
    category: Category,
    samples: u32,
    interval: Duration,
    max_cycles: u64,
    timeout: Duration,
) -> Probe {
    let threshold = Threshold::Above(max_cycles);
    let label = name.to_string();
    Probe::blocking(name, category, timeout, move |ctx| {
        let mut sum: i128 = 0;
        let mut taken: u32 = 0;
        for index in 0..samples {
            if ctx.expired() {
                break;
            }
            let Some(cycles) = cpu::vmexit_cycles() else {
                return Ok(ProbeResult::inconclusive(UNSUPPORTED_ARCH));
            };
            sum += i128::from(cycles);
            taken += 1;
            if index + 1 < samples {
                std::thread::sleep(interval.min(ctx.remaining()));
            }
        }
        if taken == 0 {
            return Ok(ProbeResult::inconclusive("no sample before the deadline"));
        }

        let mean = sum / i128::from(taken);
        let anomalous = match u64::try_from(mean) {
            Ok(mean) => threshold.is_anomalous(mean),
            Err(_) => mean < 0,
        };
        debug!("{}: mean {} cycles over {} samples", label, mean, taken);
        Ok(ProbeResult::with_diagnostic(
            Finding::from_detected(anomalous),
            format!("mean {mean} cycles over {taken}/{samples} samples"),
        ))
    })
}

fn backdoor_in_child() -> ChildFinding {
    cpu::vmware_backdoor_answers().into()
}

/// VMware backdoor GETVERSION
///
/// Outside VMware the `in` faults. As a terminal probe that fault ends the run
/// with `exit_code`; otherwise it is contained and reads as negative.
pub fn vmware_backdoor(name: &str, category: Category, terminal: bool, exit_code: i32) -> Probe {
    if terminal {
        Probe::terminal(name, category, cpu::vmware_backdoor_answers, exit_code)
    } else {
        Probe::contained(name, category, backdoor_in_child, Finding::Negative)
    }
}

/// Fewer than `min_events` input events within the window
pub fn input_events(
    name: &str,
    category: Category,
    dir: PathBuf,
    window: Duration,
    tick: Duration,
    min_events: u64,
) -> Probe {
    Probe::blocking(name, category, window, move |ctx| {
        let deadline = ctx.deadline().min(ctx.started() + window);
        match monitor_input_events(&dir, deadline, tick) {
            Ok(tally) => Ok(ProbeResult::with_diagnostic(
                Finding::from_detected(tally.events < min_events),
                format!("{} events on {} devices", tally.events, tally.devices),
            )),
            Err(InputError::Denied(detail)) => Err(PermissionMiss(detail)),
            Err(InputError::NoDevices) => Ok(ProbeResult::inconclusive(format!(
                "no input devices under {}",
                dir.display()
            ))),
            Err(InputError::Epoll(detail)) => Ok(ProbeResult::inconclusive(detail)),
        }
    })
}

/// Sleep and compare the monotonic clock against `reference`
///
/// Positive when either clock advanced less than `sleep - tolerance`. A sleep
/// that would overrun the deadline is not started.
pub fn sleep_drift(
    name: &str,
    category: Category,
    reference: ClockSource,
    sleep: Duration,
    tolerance: Duration,
    timeout: Duration,
) -> Probe {
    Probe::blocking(name, category, timeout, move |ctx| {
        if sleep > ctx.remaining() {
            return Ok(ProbeResult::inconclusive(format!(
                "sleep of {sleep:?} exceeds the deadline"
            )));
        }
        let measurement = measure_drift_under_sleep(sleep, ClockSource::Monotonic, reference);
        let diagnostic = format!(
            "monotonic {:?}, {} {:?}",
            measurement.elapsed_a,
            reference.as_str(),
            measurement.elapsed_b
        );
        Ok(match measurement.accelerated(tolerance) {
            Some(accelerated) => {
                ProbeResult::with_diagnostic(Finding::from_detected(accelerated), diagnostic)
            }
            None => ProbeResult::inconclusive(diagnostic),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{ProbeBody, ProbeContext};

    fn run_inline(probe: &Probe) -> crate::config::types::ProbeOutput {
        let ProbeBody::Inline(run) = &probe.body else {
            panic!("{} is not inline", probe.name);
        };
        run(&ProbeContext::new(probe.timeout))
    }

    #[test]
    fn test_cpuid_probes_never_panic() {
        let bit = cpuid_hypervisor_bit("hv_bit", Category::VirtualMachine);
        assert!(run_inline(&bit).is_ok());

        let vendor = cpuid_vendor(
            "hv_vendor",
            Category::VirtualMachine,
            vec!["VMwareVMware".to_string(), "KVMKVMKVM".to_string()],
        );
        assert!(run_inline(&vendor).is_ok());
    }

    #[test]
    fn test_vmexit_latency_respects_deadline() {
        let probe = vmexit_latency(
            "vmexit",
            Category::VirtualMachine,
            10,
            Duration::from_millis(100),
            750,
            Duration::from_millis(250),
        );
        let started = std::time::Instant::now();
        let result = run_inline(&probe).unwrap();
        assert!(started.elapsed() < Duration::from_millis(400));
        assert!(result.diagnostic.is_some());
    }

    #[test]
    fn test_sleep_longer_than_deadline_is_inconclusive() {
        let probe = sleep_drift(
            "drift",
            Category::Sandbox,
            ClockSource::ProcUptime,
            Duration::from_secs(20),
            Duration::from_millis(50),
            Duration::from_secs(1),
        );
        let started = std::time::Instant::now();
        let result = run_inline(&probe).unwrap();
        assert_eq!(result.finding, Finding::Inconclusive);
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn test_short_sleep_drift_is_not_accelerated() {
        // /proc/uptime has centisecond granularity; 50 ms covers it.
        let probe = sleep_drift(
            "drift",
            Category::Sandbox,
            ClockSource::ProcUptime,
            Duration::from_millis(300),
            Duration::from_millis(50),
            Duration::from_secs(2),
        );
        assert_eq!(run_inline(&probe).unwrap().finding, Finding::Negative);
    }

    #[test]
    fn test_input_events_without_devices_is_inconclusive() {
        let dir = tempfile::tempdir().unwrap();
        let probe = input_events(
            "input",
            Category::AutoAnalysis,
            dir.path().to_path_buf(),
            Duration::from_millis(50),
            Duration::from_millis(10),
            10,
        );
        assert_eq!(run_inline(&probe).unwrap().finding, Finding::Inconclusive);
    }

    #[test]
    fn test_backdoor_variants() {
        assert!(vmware_backdoor("in", Category::VirtualMachine, true, 0).is_terminal());
        let contained = vmware_backdoor("in", Category::VirtualMachine, false, 0);
        assert!(matches!(
            contained.body,
            ProbeBody::Contained {
                on_fault: Finding::Negative,
                ..
            }
        ));
    }
}
