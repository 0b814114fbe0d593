/// Built-in probe tables
///
/// The default probe set per category, in run order. Everything here is plain
/// data fed to the generic probe kinds; a JSON configuration can replace any of it.
use std::path::PathBuf;

use crate::config::loader::ProbeConfig;
use crate::evidence::ClockSource;
use crate::probe::kinds::{
    ProbeKind, ProbeSpec, DEFAULT_INPUT_TICK_MS, DEFAULT_INPUT_WINDOW_MS,
    DEFAULT_MIN_INPUT_EVENTS, DEFAULT_SLEEP_MS, DEFAULT_VMEXIT_INTERVAL_MS,
    DEFAULT_VMEXIT_MAX_CYCLES, DEFAULT_VMEXIT_SAMPLES, MD5_HEX_LEN,
};

const GIB: u64 = 1024 * 1024 * 1024;

pub const ANALYSIS_TOOLS: &[&str] = &[
    "x32dbg", "x64dbg", "ghidra", "r2", "radare2", "gdb", "ida", "binwalk", "olly", "wireshark",
    "windbg", "immunity", "dumpcap",
];

pub const COMMON_PROGRAM_NAMES: &[&str] = &[
    "sample", "bot", "sandbox", "malware", "test", "klavme", "myapp", "testapp",
];

pub const TOOL_INSTALL_DIRS: &[&str] = &["/bin", "/sbin", "/usr/bin", "/usr/sbin"];

const VM_VENDORS: &[&str] = &["VMware", "VirtualBox", "Phoenix", "innotek"];

pub const VM_MAC_PREFIXES: &[&str] = &["00:05:69", "00:0c:29", "00:1c:14", "00:50:56", "08:00:27"];

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn paths(items: &[&str]) -> Vec<PathBuf> {
    items.iter().map(PathBuf::from).collect()
}

fn contains(path: &str, words: &[&str]) -> ProbeKind {
    ProbeKind::FileContainsAny {
        path: PathBuf::from(path),
        words: strings(words),
    }
}

pub fn sandbox_probes() -> Vec<ProbeSpec> {
    vec![
        ProbeSpec::new(
            "tracer_pid_procfs",
            "Checking if program is traced with proc file system",
            ProbeKind::FileLacksAll {
                path: PathBuf::from("/proc/self/status"),
                words: strings(&["TracerPid:\t0"]),
            },
        ),
        ProbeSpec::new(
            "ptrace_attach",
            "Checking if program is traced with ptrace()",
            ProbeKind::PtraceAttach,
        ),
        ProbeSpec::new(
            "ptrace_intercepted",
            "Checking if ptrace is monkey patched",
            ProbeKind::PtraceIntercepted,
        ),
        ProbeSpec::new(
            "analysis_tools_running",
            "Checking for active analysis tools",
            ProbeKind::ProcessNameContainsAny {
                proc_root: PathBuf::from("/proc"),
                names: strings(ANALYSIS_TOOLS),
            },
        ),
        ProbeSpec::new(
            "analysis_tools_installed",
            "Checking for installed analysis tools",
            ProbeKind::DirectoryContainsAnyName {
                dirs: paths(TOOL_INSTALL_DIRS),
                names: strings(ANALYSIS_TOOLS),
            },
        ),
        ProbeSpec::new(
            "program_name_common",
            "Checking program name for common names",
            ProbeKind::ExecutableNameContainsAny {
                words: strings(COMMON_PROGRAM_NAMES),
            },
        ),
        ProbeSpec::new(
            "program_name_md5",
            "Checking is program name md5 hash",
            ProbeKind::ExecutableNameIsHexDigest {
                length: MD5_HEX_LEN,
            },
        ),
        ProbeSpec::new(
            "cpu_cores",
            "Checking number of cpu cores",
            ProbeKind::CpuCoresAtMost { max: 1 },
        ),
        ProbeSpec::new(
            "disk_capacity",
            "Checking total disk size",
            ProbeKind::DiskCapacityBelow {
                path: PathBuf::from("."),
                bytes: 8 * GIB,
            },
        ),
        ProbeSpec::new(
            "disk_available",
            "Checking available disk size",
            ProbeKind::DiskAvailableBelow {
                path: PathBuf::from("."),
                bytes: 5 * GIB,
            },
        ),
        ProbeSpec::new(
            "sleep_drift_sysinfo",
            "Checking for accelerated sleep via sysinfo",
            ProbeKind::SleepDrift {
                reference: ClockSource::SysinfoUptime,
                sleep_ms: DEFAULT_SLEEP_MS,
                tolerance_ms: 1_000,
            },
        ),
        ProbeSpec::new(
            "sleep_drift_proc_uptime",
            "Checking for accelerated sleep via /proc/uptime",
            ProbeKind::SleepDrift {
                reference: ClockSource::ProcUptime,
                sleep_ms: DEFAULT_SLEEP_MS,
                tolerance_ms: 50,
            },
        ),
    ]
}

pub fn virtual_machine_probes() -> Vec<ProbeSpec> {
    let board_vendors = [VM_VENDORS, &["Oracle"]].concat();
    vec![
        ProbeSpec::new(
            "dmi_bios_vendor",
            "Checking bios vendor",
            contains(
                "/sys/class/dmi/id/bios_vendor",
                &["vmware", "vbox", "Phoenix", "innotek"],
            ),
        ),
        ProbeSpec::new(
            "dmi_product_name",
            "Checking product vendor",
            contains("/sys/class/dmi/id/product_name", VM_VENDORS),
        ),
        ProbeSpec::new(
            "dmi_sys_vendor",
            "Checking system vendor",
            contains("/sys/class/dmi/id/sys_vendor", VM_VENDORS),
        ),
        ProbeSpec::new(
            "dmi_board_vendor",
            "Checking board vendor",
            contains("/sys/class/dmi/id/board_vendor", &board_vendors),
        ),
        ProbeSpec::new(
            "kernel_modules",
            "Checking Kernel modules",
            contains(
                "/proc/modules",
                &["vmw_balloon", "vmwfgx", "vboxvideo", "vboxguest"],
            ),
        ),
        ProbeSpec::new(
            "scsi_devices",
            "Checking SCSI",
            contains("/proc/scsi/scsi", &["VMware", "VBOX"]),
        ),
        ProbeSpec::new(
            "cpuinfo_hypervisor_flag",
            "Checking Hypervisor flag",
            contains("/proc/cpuinfo", &["hypervisor"]),
        ),
        ProbeSpec::new(
            "vm_tools_installed",
            "Checking VM presence",
            ProbeKind::DirectoryContainsNamePrefix {
                dirs: paths(&["/usr/bin"]),
                prefixes: strings(&["vmware-", "vbox", "qemu"]),
            },
        ),
        ProbeSpec::new(
            "mac_address_vendor",
            "Checking MAC address",
            ProbeKind::MacAddressPrefix {
                net_dir: PathBuf::from("/sys/class/net"),
                prefixes: strings(VM_MAC_PREFIXES),
            },
        ),
        ProbeSpec::new(
            "cpuid_hypervisor_bit",
            "Checking Hypervisor bit",
            ProbeKind::CpuidHypervisorBit,
        ),
        ProbeSpec::new(
            "vmexit_latency",
            "Checking time of VMEXIT",
            ProbeKind::VmexitLatency {
                samples: DEFAULT_VMEXIT_SAMPLES,
                interval_ms: DEFAULT_VMEXIT_INTERVAL_MS,
                max_cycles: DEFAULT_VMEXIT_MAX_CYCLES,
            },
        ),
        ProbeSpec::new(
            "cpuid_hypervisor_vendor",
            "Checking virtualization vendor",
            ProbeKind::CpuidVendor {
                signatures: strings(&["VMwareVMware", "KVMKVMKVM"]),
            },
        ),
        // Ends the run outside VMware.
        ProbeSpec::new(
            "vmware_backdoor",
            "Checking IN instruction",
            ProbeKind::VmwareBackdoor {
                terminal: true,
                exit_code: 0,
            },
        ),
    ]
}

pub fn auto_analysis_probes() -> Vec<ProbeSpec> {
    vec![ProbeSpec::new(
        "input_events",
        "Checking input events",
        ProbeKind::InputEvents {
            dir: PathBuf::from("/dev/input"),
            window_ms: DEFAULT_INPUT_WINDOW_MS,
            tick_ms: DEFAULT_INPUT_TICK_MS,
            min_events: DEFAULT_MIN_INPUT_EVENTS,
        },
    )]
}

/// The complete built-in configuration
pub fn builtin_config() -> ProbeConfig {
    ProbeConfig {
        sandbox: sandbox_probes(),
        virtual_machine: virtual_machine_probes(),
        auto_analysis: auto_analysis_probes(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_keep_terminal_probe_last() {
        let vm = virtual_machine_probes();
        assert!(vm.last().unwrap().kind.is_terminal());
        assert_eq!(vm.iter().filter(|spec| spec.kind.is_terminal()).count(), 1);
        assert!(!sandbox_probes().iter().any(|spec| spec.kind.is_terminal()));
    }

    #[test]
    fn test_preset_counts() {
        let config = builtin_config();
        assert_eq!(config.sandbox.len(), 12);
        assert_eq!(config.virtual_machine.len(), 13);
        assert_eq!(config.auto_analysis.len(), 1);
    }

    #[test]
    fn test_board_vendor_adds_oracle() {
        let board = &virtual_machine_probes()[3];
        assert_eq!(board.kind.markers().unwrap().last().unwrap(), "Oracle");
    }
}
