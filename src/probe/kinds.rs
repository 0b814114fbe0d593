//! Data-driven probe kinds
//!
//! Every heuristic table (vendor strings, tool names, MAC prefixes, thresholds)
//! lives in configuration as a [`ProbeSpec`]; this module turns a spec into a
//! [`Probe`] over the generic evidence primitives.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::types::{Category, Finding, Hazard, ProbeResult, DEFAULT_PROBE_TIMEOUT};
use crate::evidence::host::{self, is_hex_digest};
use crate::evidence::{self, ClockSource, FileScan};
use crate::probe::{builtin, Probe, Threshold};

/// Hex digits in an MD5 digest
pub const MD5_HEX_LEN: usize = 32;

pub const DEFAULT_INPUT_WINDOW_MS: u64 = 10_000;
pub const DEFAULT_INPUT_TICK_MS: u64 = 1_000;
pub const DEFAULT_MIN_INPUT_EVENTS: u64 = 10;
pub const DEFAULT_SLEEP_MS: u64 = 20_000;
pub const DEFAULT_VMEXIT_SAMPLES: u32 = 10;
pub const DEFAULT_VMEXIT_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_VMEXIT_MAX_CYCLES: u64 = 750;

/// Extra time granted to timing probes past their nominal measurement window
const TIMING_HEADROOM_MS: u64 = 1_000;

fn default_true() -> bool {
    true
}
fn default_proc_root() -> PathBuf {
    PathBuf::from("/proc")
}
fn default_net_dir() -> PathBuf {
    PathBuf::from("/sys/class/net")
}
fn default_input_dir() -> PathBuf {
    PathBuf::from("/dev/input")
}
fn default_disk_path() -> PathBuf {
    PathBuf::from(".")
}
fn default_hex_len() -> usize {
    MD5_HEX_LEN
}
fn default_sleep_ms() -> u64 {
    DEFAULT_SLEEP_MS
}
fn default_input_window_ms() -> u64 {
    DEFAULT_INPUT_WINDOW_MS
}
fn default_input_tick_ms() -> u64 {
    DEFAULT_INPUT_TICK_MS
}
fn default_min_input_events() -> u64 {
    DEFAULT_MIN_INPUT_EVENTS
}
fn default_vmexit_samples() -> u32 {
    DEFAULT_VMEXIT_SAMPLES
}
fn default_vmexit_interval_ms() -> u64 {
    DEFAULT_VMEXIT_INTERVAL_MS
}
fn default_vmexit_max_cycles() -> u64 {
    DEFAULT_VMEXIT_MAX_CYCLES
}

/// One configured probe
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeSpec {
    pub name: String,
    /// Shown by presenters; defaults to the name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Overrides the kind's default timeout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    pub kind: ProbeKind,
}

impl ProbeSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>, kind: ProbeKind) -> Self {
        Self {
            name: name.into(),
            description: Some(description.into()),
            enabled: true,
            timeout_ms: None,
            kind,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.kind.default_timeout())
    }

    /// Build the probe this spec describes
    pub fn build(&self, category: Category) -> Probe {
        let probe = self.kind.build(&self.name, category, self.timeout());
        match &self.description {
            Some(description) => probe.with_description(description.clone()),
            None => probe,
        }
    }
}

/// Generic probe kinds, tagged by `type` in JSON
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProbeKind {
    FileContainsAny {
        path: PathBuf,
        words: Vec<String>,
    },
    /// Positive when the file is readable and no line contains any word
    FileLacksAll {
        path: PathBuf,
        words: Vec<String>,
    },
    DirectoryContainsAnyName {
        dirs: Vec<PathBuf>,
        names: Vec<String>,
    },
    DirectoryContainsNamePrefix {
        dirs: Vec<PathBuf>,
        prefixes: Vec<String>,
    },
    ProcessNameContainsAny {
        #[serde(default = "default_proc_root")]
        proc_root: PathBuf,
        names: Vec<String>,
    },
    ExecutableNameContainsAny {
        words: Vec<String>,
    },
    ExecutableNameIsHexDigest {
        #[serde(default = "default_hex_len")]
        length: usize,
    },
    MacAddressPrefix {
        #[serde(default = "default_net_dir")]
        net_dir: PathBuf,
        prefixes: Vec<String>,
    },
    CpuCoresAtMost {
        max: u64,
    },
    DiskCapacityBelow {
        #[serde(default = "default_disk_path")]
        path: PathBuf,
        bytes: u64,
    },
    DiskAvailableBelow {
        #[serde(default = "default_disk_path")]
        path: PathBuf,
        bytes: u64,
    },
    SleepDrift {
        reference: ClockSource,
        #[serde(default = "default_sleep_ms")]
        sleep_ms: u64,
        tolerance_ms: u64,
    },
    CpuidHypervisorBit,
    CpuidVendor {
        signatures: Vec<String>,
    },
    VmexitLatency {
        #[serde(default = "default_vmexit_samples")]
        samples: u32,
        #[serde(default = "default_vmexit_interval_ms")]
        interval_ms: u64,
        #[serde(default = "default_vmexit_max_cycles")]
        max_cycles: u64,
    },
    VmwareBackdoor {
        #[serde(default = "default_true")]
        terminal: bool,
        #[serde(default)]
        exit_code: i32,
    },
    PtraceAttach,
    PtraceIntercepted,
    InputEvents {
        #[serde(default = "default_input_dir")]
        dir: PathBuf,
        #[serde(default = "default_input_window_ms")]
        window_ms: u64,
        #[serde(default = "default_input_tick_ms")]
        tick_ms: u64,
        #[serde(default = "default_min_input_events")]
        min_events: u64,
    },
}

impl ProbeKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            ProbeKind::FileContainsAny { .. } => "file_contains_any",
            ProbeKind::FileLacksAll { .. } => "file_lacks_all",
            ProbeKind::DirectoryContainsAnyName { .. } => "directory_contains_any_name",
            ProbeKind::DirectoryContainsNamePrefix { .. } => "directory_contains_name_prefix",
            ProbeKind::ProcessNameContainsAny { .. } => "process_name_contains_any",
            ProbeKind::ExecutableNameContainsAny { .. } => "executable_name_contains_any",
            ProbeKind::ExecutableNameIsHexDigest { .. } => "executable_name_is_hex_digest",
            ProbeKind::MacAddressPrefix { .. } => "mac_address_prefix",
            ProbeKind::CpuCoresAtMost { .. } => "cpu_cores_at_most",
            ProbeKind::DiskCapacityBelow { .. } => "disk_capacity_below",
            ProbeKind::DiskAvailableBelow { .. } => "disk_available_below",
            ProbeKind::SleepDrift { .. } => "sleep_drift",
            ProbeKind::CpuidHypervisorBit => "cpuid_hypervisor_bit",
            ProbeKind::CpuidVendor { .. } => "cpuid_vendor",
            ProbeKind::VmexitLatency { .. } => "vmexit_latency",
            ProbeKind::VmwareBackdoor { .. } => "vmware_backdoor",
            ProbeKind::PtraceAttach => "ptrace_attach",
            ProbeKind::PtraceIntercepted => "ptrace_intercepted",
            ProbeKind::InputEvents { .. } => "input_events",
        }
    }

    pub fn hazard(&self) -> Hazard {
        match self {
            ProbeKind::SleepDrift { .. }
            | ProbeKind::VmexitLatency { .. }
            | ProbeKind::InputEvents { .. } => Hazard::MayBlockUnbounded,
            ProbeKind::VmwareBackdoor { .. }
            | ProbeKind::PtraceAttach
            | ProbeKind::PtraceIntercepted => Hazard::MayFault,
            _ => Hazard::None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ProbeKind::VmwareBackdoor { terminal: true, .. })
    }

    /// Timeout when the spec does not set one; covers the kind's own window
    pub fn default_timeout(&self) -> Duration {
        match self {
            ProbeKind::SleepDrift { sleep_ms, .. } => {
                Duration::from_millis(sleep_ms.saturating_add(TIMING_HEADROOM_MS))
            }
            ProbeKind::VmexitLatency {
                samples,
                interval_ms,
                ..
            } => Duration::from_millis(
                u64::from(*samples)
                    .saturating_mul(*interval_ms)
                    .saturating_add(TIMING_HEADROOM_MS),
            ),
            ProbeKind::InputEvents { window_ms, .. } => Duration::from_millis(*window_ms),
            _ => DEFAULT_PROBE_TIMEOUT,
        }
    }

    /// Nominal blocking window, used to sanity-check configured timeouts
    pub fn measurement_window(&self) -> Option<Duration> {
        match self {
            ProbeKind::SleepDrift { sleep_ms, .. } => Some(Duration::from_millis(*sleep_ms)),
            ProbeKind::VmexitLatency {
                samples,
                interval_ms,
                ..
            } => Some(Duration::from_millis(
                u64::from(samples.saturating_sub(1)).saturating_mul(*interval_ms),
            )),
            ProbeKind::InputEvents { window_ms, .. } => Some(Duration::from_millis(*window_ms)),
            _ => None,
        }
    }

    /// Marker list the kind matches against, if it has one
    pub fn markers(&self) -> Option<&[String]> {
        match self {
            ProbeKind::FileContainsAny { words, .. }
            | ProbeKind::FileLacksAll { words, .. }
            | ProbeKind::ExecutableNameContainsAny { words } => Some(words),
            ProbeKind::DirectoryContainsAnyName { names, .. }
            | ProbeKind::ProcessNameContainsAny { names, .. } => Some(names),
            ProbeKind::DirectoryContainsNamePrefix { prefixes, .. }
            | ProbeKind::MacAddressPrefix { prefixes, .. } => Some(prefixes),
            ProbeKind::CpuidVendor { signatures } => Some(signatures),
            _ => None,
        }
    }

    pub fn build(&self, name: &str, category: Category, timeout: Duration) -> Probe {
        let probe = match self.clone() {
            ProbeKind::FileContainsAny { path, words } => {
                Probe::inline(name, category, move |_| {
                    Ok(ProbeResult::detected(evidence::file_contains_any(&path, &words)))
                })
            }
            ProbeKind::FileLacksAll { path, words } => Probe::inline(name, category, move |_| {
                Ok(match evidence::scan_file(&path, &words) {
                    FileScan::Unreadable => {
                        ProbeResult::inconclusive(format!("{} unreadable", path.display()))
                    }
                    FileScan::NoMatch => ProbeResult::positive(),
                    FileScan::Match { .. } => ProbeResult::negative(),
                })
            }),
            ProbeKind::DirectoryContainsAnyName { dirs, names } => {
                Probe::inline(name, category, move |_| {
                    let hit = dirs
                        .iter()
                        .find(|dir| evidence::directory_contains_any_name(dir, &names));
                    Ok(directory_hit(hit))
                })
            }
            ProbeKind::DirectoryContainsNamePrefix { dirs, prefixes } => {
                Probe::inline(name, category, move |_| {
                    let hit = dirs
                        .iter()
                        .find(|dir| evidence::directory_contains_name_prefix(dir, &prefixes));
                    Ok(directory_hit(hit))
                })
            }
            ProbeKind::ProcessNameContainsAny { proc_root, names } => {
                Probe::inline(name, category, move |_| {
                    let hit = host::running_process_names(&proc_root)
                        .into_iter()
                        .find(|comm| names.iter().any(|n| comm.contains(n.as_str())));
                    Ok(match hit {
                        Some(comm) => ProbeResult::with_diagnostic(
                            Finding::Positive,
                            format!("process {comm:?}"),
                        ),
                        None => ProbeResult::negative(),
                    })
                })
            }
            ProbeKind::ExecutableNameContainsAny { words } => {
                Probe::inline(name, category, move |_| {
                    Ok(match host::executable_name() {
                        Some(exe) => {
                            ProbeResult::detected(words.iter().any(|w| exe.contains(w.as_str())))
                        }
                        None => ProbeResult::inconclusive("executable name unavailable"),
                    })
                })
            }
            ProbeKind::ExecutableNameIsHexDigest { length } => {
                Probe::inline(name, category, move |_| {
                    Ok(match host::executable_name() {
                        Some(exe) => ProbeResult::detected(is_hex_digest(&exe, length)),
                        None => ProbeResult::inconclusive("executable name unavailable"),
                    })
                })
            }
            ProbeKind::MacAddressPrefix { net_dir, prefixes } => {
                Probe::inline(name, category, move |_| {
                    let hit = host::interface_addresses(&net_dir)
                        .into_iter()
                        .find(|(_, mac)| has_mac_prefix(mac, &prefixes));
                    Ok(match hit {
                        Some((iface, mac)) => ProbeResult::with_diagnostic(
                            Finding::Positive,
                            format!("{iface} {mac}"),
                        ),
                        None => ProbeResult::negative(),
                    })
                })
            }
            ProbeKind::CpuCoresAtMost { max } => Probe::threshold(
                name,
                category,
                host::online_cpu_count,
                Threshold::AtMost(max),
            ),
            ProbeKind::DiskCapacityBelow { path, bytes } => Probe::threshold(
                name,
                category,
                move || host::filesystem_space(&path).map(|space| space.capacity),
                Threshold::Below(bytes),
            ),
            ProbeKind::DiskAvailableBelow { path, bytes } => Probe::threshold(
                name,
                category,
                move || host::filesystem_space(&path).map(|space| space.available),
                Threshold::Below(bytes),
            ),
            ProbeKind::SleepDrift {
                reference,
                sleep_ms,
                tolerance_ms,
            } => builtin::sleep_drift(
                name,
                category,
                reference,
                Duration::from_millis(sleep_ms),
                Duration::from_millis(tolerance_ms),
                timeout,
            ),
            ProbeKind::CpuidHypervisorBit => builtin::cpuid_hypervisor_bit(name, category),
            ProbeKind::CpuidVendor { signatures } => {
                builtin::cpuid_vendor(name, category, signatures)
            }
            ProbeKind::VmexitLatency {
                samples,
                interval_ms,
                max_cycles,
            } => builtin::vmexit_latency(
                name,
                category,
                samples,
                Duration::from_millis(interval_ms),
                max_cycles,
                timeout,
            ),
            ProbeKind::VmwareBackdoor {
                terminal,
                exit_code,
            } => builtin::vmware_backdoor(name, category, terminal, exit_code),
            ProbeKind::PtraceAttach => builtin::ptrace_attach(name, category),
            ProbeKind::PtraceIntercepted => builtin::ptrace_intercepted(name, category),
            ProbeKind::InputEvents {
                dir,
                window_ms,
                tick_ms,
                min_events,
            } => builtin::input_events(
                name,
                category,
                dir,
                Duration::from_millis(window_ms),
                Duration::from_millis(tick_ms),
                min_events,
            ),
        };
        probe.with_timeout(timeout)
    }
}

fn directory_hit(hit: Option<&PathBuf>) -> ProbeResult {
    match hit {
        Some(dir) => ProbeResult::with_diagnostic(Finding::Positive, dir.display().to_string()),
        None => ProbeResult::negative(),
    }
}

/// Case-insensitive MAC prefix comparison
fn has_mac_prefix(mac: &str, prefixes: &[String]) -> bool {
    let mac = mac.to_ascii_lowercase();
    prefixes
        .iter()
        .any(|prefix| mac.starts_with(&prefix.to_ascii_lowercase()))
}

/// Directories a kind reads from; used by `list` output
pub fn kind_paths(kind: &ProbeKind) -> Vec<&Path> {
    match kind {
        ProbeKind::FileContainsAny { path, .. } | ProbeKind::FileLacksAll { path, .. } => {
            vec![path.as_path()]
        }
        ProbeKind::DirectoryContainsAnyName { dirs, .. }
        | ProbeKind::DirectoryContainsNamePrefix { dirs, .. } => {
            dirs.iter().map(PathBuf::as_path).collect()
        }
        ProbeKind::ProcessNameContainsAny { proc_root, .. } => vec![proc_root.as_path()],
        ProbeKind::MacAddressPrefix { net_dir, .. } => vec![net_dir.as_path()],
        ProbeKind::DiskCapacityBelow { path, .. } | ProbeKind::DiskAvailableBelow { path, .. } => {
            vec![path.as_path()]
        }
        ProbeKind::InputEvents { dir, .. } => vec![dir.as_path()],
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{ProbeBody, ProbeContext};
    use std::fs;

    fn evaluate(spec: &ProbeSpec) -> Finding {
        let probe = spec.build(Category::Sandbox);
        let ProbeBody::Inline(run) = &probe.body else {
            panic!("{} is not inline", probe.name);
        };
        run(&ProbeContext::new(probe.timeout)).unwrap().finding
    }

    #[test]
    fn test_kind_parses_from_json() {
        let spec: ProbeSpec = serde_json::from_str(
            r#"{"name": "bios", "kind": {"type": "file_contains_any",
                "path": "/sys/class/dmi/id/bios_vendor", "words": ["innotek"]}}"#,
        )
        .unwrap();
        assert!(spec.enabled);
        assert_eq!(spec.kind.type_name(), "file_contains_any");
        assert_eq!(spec.timeout(), DEFAULT_PROBE_TIMEOUT);

        let backdoor: ProbeKind = serde_json::from_str(r#"{"type": "vmware_backdoor"}"#).unwrap();
        assert_eq!(
            backdoor,
            ProbeKind::VmwareBackdoor {
                terminal: true,
                exit_code: 0
            }
        );
        assert!(backdoor.is_terminal());
    }

    #[test]
    fn test_blocking_kinds_get_window_timeouts() {
        let input: ProbeKind = serde_json::from_str(r#"{"type": "input_events"}"#).unwrap();
        assert_eq!(input.hazard(), Hazard::MayBlockUnbounded);
        assert_eq!(input.default_timeout(), Duration::from_millis(10_000));

        let drift: ProbeKind =
            serde_json::from_str(r#"{"type": "sleep_drift", "reference": "proc_uptime", "tolerance_ms": 50}"#)
                .unwrap();
        assert_eq!(drift.default_timeout(), Duration::from_millis(21_000));

        let vmexit: ProbeKind = serde_json::from_str(r#"{"type": "vmexit_latency"}"#).unwrap();
        assert_eq!(vmexit.measurement_window(), Some(Duration::from_millis(9_000)));
    }

    #[test]
    fn test_file_lacks_all_tells_unreadable_apart() {
        let dir = tempfile::tempdir().unwrap();
        let status = dir.path().join("status");
        fs::write(&status, "Name:\tprobe\nTracerPid:\t0\n").unwrap();

        let traced = |path: PathBuf| {
            ProbeSpec::new(
                "tracer_pid",
                "TracerPid",
                ProbeKind::FileLacksAll {
                    path,
                    words: vec!["TracerPid:\t0".to_string()],
                },
            )
        };
        assert_eq!(evaluate(&traced(status.clone())), Finding::Negative);

        fs::write(&status, "Name:\tprobe\nTracerPid:\t4242\n").unwrap();
        assert_eq!(evaluate(&traced(status)), Finding::Positive);

        assert_eq!(
            evaluate(&traced(PathBuf::from("/nonexistent/status"))),
            Finding::Inconclusive
        );
    }

    #[test]
    fn test_directory_kinds_scan_every_dir() {
        let empty = tempfile::tempdir().unwrap();
        let tools = tempfile::tempdir().unwrap();
        fs::write(tools.path().join("radare2"), "").unwrap();

        let spec = ProbeSpec::new(
            "tools",
            "installed tools",
            ProbeKind::DirectoryContainsAnyName {
                dirs: vec![empty.path().to_path_buf(), tools.path().to_path_buf()],
                names: vec!["radare2".to_string()],
            },
        );
        assert_eq!(evaluate(&spec), Finding::Positive);

        let spec = ProbeSpec::new(
            "vm_tools",
            "VM tools",
            ProbeKind::DirectoryContainsNamePrefix {
                dirs: vec![empty.path().to_path_buf()],
                prefixes: vec!["vbox".to_string()],
            },
        );
        assert_eq!(evaluate(&spec), Finding::Negative);
    }

    #[test]
    fn test_mac_prefix_matches_any_interface_case_insensitively() {
        let net = tempfile::tempdir().unwrap();
        for (iface, mac) in [("lo", "00:00:00:00:00:00"), ("enp0s3", "08:00:27:1A:2B:3C")] {
            fs::create_dir(net.path().join(iface)).unwrap();
            fs::write(net.path().join(iface).join("address"), format!("{mac}\n")).unwrap();
        }
        let spec = ProbeSpec::new(
            "mac",
            "MAC address",
            ProbeKind::MacAddressPrefix {
                net_dir: net.path().to_path_buf(),
                prefixes: vec!["00:0C:29".to_string(), "08:00:27".to_string()],
            },
        );
        assert_eq!(evaluate(&spec), Finding::Positive);
        assert!(has_mac_prefix("00:0c:29:aa:bb:cc", &["00:0C:29".to_string()]));
    }

    #[test]
    fn test_process_names_use_substring_match() {
        let proc_root = tempfile::tempdir().unwrap();
        let pid = proc_root.path().join("17");
        fs::create_dir(&pid).unwrap();
        fs::write(pid.join("comm"), "gdbserver\n").unwrap();

        let spec = ProbeSpec::new(
            "tools_running",
            "active tools",
            ProbeKind::ProcessNameContainsAny {
                proc_root: proc_root.path().to_path_buf(),
                names: vec!["gdb".to_string()],
            },
        );
        assert_eq!(evaluate(&spec), Finding::Positive);
    }

    #[test]
    fn test_timeout_override() {
        let mut spec = ProbeSpec::new("cores", "cores", ProbeKind::CpuCoresAtMost { max: 1 });
        spec.timeout_ms = Some(250);
        let probe = spec.build(Category::Sandbox);
        assert_eq!(probe.timeout, Duration::from_millis(250));
        assert_eq!(probe.description, "cores");
    }
}
