//! ptrace-based tracer detection.
//!
//! Both bodies run inside a contained child (see [`crate::kernel::process`]) so
//! the probing process itself never becomes a tracee. They use raw syscalls only.

use nix::errno::Errno;
use nix::sys::ptrace;
use nix::unistd::getppid;

use crate::kernel::process::ChildFinding;

/// Try to seize the parent (the probing process)
///
/// Success means nobody traces it. EPERM means either a tracer is already
/// attached or policy (Yama, LSM) forbids the attach; the parent's TracerPid
/// separates the two, so a denial never reads as a negative.
pub fn seize_parent() -> ChildFinding {
    let parent = getppid();
    match ptrace::seize(parent, ptrace::Options::empty()) {
        // Exiting detaches; the parent is never stopped by a seize.
        Ok(()) => ChildFinding::Negative,
        Err(Errno::EPERM) => match tracer_pid_of(parent.as_raw()) {
            Some(0) => ChildFinding::Denied,
            Some(_) => ChildFinding::Positive,
            None => ChildFinding::Inconclusive,
        },
        Err(Errno::EACCES) => ChildFinding::Denied,
        Err(_) => ChildFinding::Inconclusive,
    }
}

/// Call PTRACE_TRACEME twice
///
/// The second call must fail once the first made us a tracee. Two successes
/// mean the call is intercepted. A failing first call means this child is
/// already traced, which is indistinguishable from interception here.
pub fn traceme_twice() -> ChildFinding {
    if ptrace::traceme().is_err() {
        return ChildFinding::Inconclusive;
    }
    match ptrace::traceme() {
        Ok(()) => ChildFinding::Positive,
        Err(_) => ChildFinding::Negative,
    }
}

/// Read TracerPid of `pid` without allocating
fn tracer_pid_of(pid: i32) -> Option<i32> {
    let mut path = [0u8; 32];
    let prefix = b"/proc/";
    let suffix = b"/status\0";
    path[..prefix.len()].copy_from_slice(prefix);
    let digits = write_decimal(u32::try_from(pid).ok()?, &mut path[prefix.len()..]);
    let end = prefix.len() + digits;
    path[end..end + suffix.len()].copy_from_slice(suffix);

    // SAFETY: `path` is NUL-terminated and outlives the call.
    let fd = unsafe { libc::open(path.as_ptr() as *const libc::c_char, libc::O_RDONLY | libc::O_CLOEXEC) };
    if fd < 0 {
        return None;
    }

    let mut buf = [0u8; 4096];
    let mut len = 0usize;
    while len < buf.len() {
        // SAFETY: writing into the unfilled tail of a stack buffer we own.
        let n = unsafe {
            libc::read(
                fd,
                buf[len..].as_mut_ptr() as *mut libc::c_void,
                buf.len() - len,
            )
        };
        if n <= 0 {
            break;
        }
        len += n as usize;
    }
    // SAFETY: fd was opened above and is closed exactly once.
    unsafe { libc::close(fd) };

    parse_tracer_pid(&buf[..len])
}

fn write_decimal(mut value: u32, out: &mut [u8]) -> usize {
    let mut reversed = [0u8; 10];
    let mut count = 0;
    loop {
        reversed[count] = b'0' + (value % 10) as u8;
        value /= 10;
        count += 1;
        if value == 0 {
            break;
        }
    }
    for i in 0..count {
        out[i] = reversed[count - 1 - i];
    }
    count
}

/// Extract the TracerPid field from `/proc/<pid>/status` contents
pub(crate) fn parse_tracer_pid(status: &[u8]) -> Option<i32> {
    const KEY: &[u8] = b"TracerPid:";
    let start = status.windows(KEY.len()).position(|w| w == KEY)? + KEY.len();
    let mut value: i32 = 0;
    let mut seen_digit = false;
    for &byte in &status[start..] {
        match byte {
            b' ' | b'\t' if !seen_digit => continue,
            b'0'..=b'9' => {
                value = value.checked_mul(10)?.checked_add(i32::from(byte - b'0'))?;
                seen_digit = true;
            }
            _ => break,
        }
    }
    seen_digit.then_some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tracer_pid() {
        let status = b"Name:\tcat\nState:\tR (running)\nTracerPid:\t4242\nUid:\t0\n";
        assert_eq!(parse_tracer_pid(status), Some(4242));
        assert_eq!(parse_tracer_pid(b"TracerPid:\t0\n"), Some(0));
        assert_eq!(parse_tracer_pid(b"Name:\tcat\n"), None);
        assert_eq!(parse_tracer_pid(b"TracerPid:\t\n"), None);
    }

    #[test]
    fn test_write_decimal() {
        let mut out = [0u8; 10];
        let n = write_decimal(31337, &mut out);
        assert_eq!(&out[..n], b"31337");
        let n = write_decimal(0, &mut out);
        assert_eq!(&out[..n], b"0");
    }

    #[test]
    fn test_tracer_pid_of_self_is_readable() {
        let own = std::process::id() as i32;
        assert!(tracer_pid_of(own).is_some());
    }
}
