//! Host facts read from the kernel: CPU count, filesystem capacity, process
//! identity, running processes, network interface addresses.

use std::fs;
use std::path::Path;

/// Online processors, as sysconf(_SC_NPROCESSORS_ONLN) reports them
pub fn online_cpu_count() -> Option<u64> {
    // SAFETY: sysconf has no memory-safety preconditions.
    let count = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    u64::try_from(count).ok().filter(|&n| n > 0)
}

/// Filesystem capacity figures in bytes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SpaceInfo {
    pub capacity: u64,
    pub available: u64,
}

/// statvfs of the filesystem holding `path`
pub fn filesystem_space(path: &Path) -> Option<SpaceInfo> {
    let stat = nix::sys::statvfs::statvfs(path).ok()?;
    let fragment = stat.fragment_size() as u64;
    Some(SpaceInfo {
        capacity: (stat.blocks() as u64).saturating_mul(fragment),
        available: (stat.blocks_available() as u64).saturating_mul(fragment),
    })
}

/// File name of the running executable (via /proc/self/exe)
pub fn executable_name() -> Option<String> {
    let target = fs::read_link("/proc/self/exe").ok()?;
    target
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
}

/// `comm` of every process visible under `proc_root`
pub fn running_process_names(proc_root: &Path) -> Vec<String> {
    let Ok(entries) = fs::read_dir(proc_root) else {
        return Vec::new();
    };
    entries
        .flatten()
        .filter(|entry| is_number(&entry.file_name().to_string_lossy()))
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| fs::read_to_string(entry.path().join("comm")).ok())
        .map(|comm| comm.lines().next().unwrap_or_default().to_string())
        .collect()
}

/// MAC address of every interface under `net_dir` (e.g. /sys/class/net)
pub fn interface_addresses(net_dir: &Path) -> Vec<(String, String)> {
    let Ok(entries) = fs::read_dir(net_dir) else {
        return Vec::new();
    };
    entries
        .flatten()
        .filter_map(|entry| {
            let address = fs::read_to_string(entry.path().join("address")).ok()?;
            let address = address.split_whitespace().next()?.to_string();
            Some((entry.file_name().to_string_lossy().into_owned(), address))
        })
        .collect()
}

pub fn is_number(text: &str) -> bool {
    !text.is_empty() && text.bytes().all(|b| b.is_ascii_digit())
}

/// `name` consists of exactly `length` hexadecimal digits (an MD5 is 32)
pub fn is_hex_digest(name: &str, length: usize) -> bool {
    name.len() == length && name.bytes().all(|b| b.is_ascii_hexdigit())
}
