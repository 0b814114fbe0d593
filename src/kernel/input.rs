//! Input-device event monitoring over epoll.
//!
//! Counts `struct input_event` records readable from the devices under an input
//! directory until a deadline. The polling loop never sleeps past the deadline:
//! each `epoll_wait` is bounded by `min(tick, remaining)`.

use log::{debug, warn};
use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Read};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::time::{Duration, Instant};

const MAX_EVENTS: usize = 32;
const RECORD_SIZE: usize = std::mem::size_of::<libc::input_event>();

/// Evidence gathered by one monitoring window
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InputTally {
    /// Devices successfully registered with epoll
    pub devices: usize,
    /// Input event records read before the deadline
    pub events: u64,
}

#[derive(Debug, PartialEq, Eq)]
pub enum InputError {
    /// No readable device under the directory
    NoDevices,
    /// Devices exist but none could be opened for lack of privilege
    Denied(String),
    /// epoll itself failed
    Epoll(String),
}

/// Watch every device under `dir` until `deadline`, polling in `tick` steps
pub fn monitor_input_events(
    dir: &Path,
    deadline: Instant,
    tick: Duration,
) -> Result<InputTally, InputError> {
    let devices = open_devices(dir)?;

    // SAFETY: epoll_create1 with a valid flag; the fd is owned below.
    let raw = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
    if raw < 0 {
        return Err(InputError::Epoll(io::Error::last_os_error().to_string()));
    }
    // SAFETY: `raw` is a fresh descriptor nobody else owns.
    let epoll = unsafe { OwnedFd::from_raw_fd(raw) };

    let mut registered = 0usize;
    for (index, device) in devices.iter().enumerate() {
        let mut event = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: index as u64,
        };
        // SAFETY: both descriptors are open; `event` is initialized.
        let rc = unsafe {
            libc::epoll_ctl(
                epoll.as_raw_fd(),
                libc::EPOLL_CTL_ADD,
                device.as_raw_fd(),
                &mut event,
            )
        };
        if rc < 0 {
            warn!("epoll_ctl(ADD) failed: {}", io::Error::last_os_error());
        } else {
            registered += 1;
        }
    }
    if registered == 0 {
        return Err(InputError::Epoll("no device could be registered".to_string()));
    }

    let mut tally = InputTally {
        devices: registered,
        events: 0,
    };
    let mut ready = [libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];
    let mut buffer = [0u8; RECORD_SIZE * 64];

    loop {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        let wait = tick.min(deadline - now);
        let timeout_ms = wait.as_millis().clamp(1, i32::MAX as u128) as i32;

        // SAFETY: `ready` has room for MAX_EVENTS entries.
        let n = unsafe {
            libc::epoll_wait(
                epoll.as_raw_fd(),
                ready.as_mut_ptr(),
                MAX_EVENTS as i32,
                timeout_ms,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == ErrorKind::Interrupted {
                continue;
            }
            return Err(InputError::Epoll(err.to_string()));
        }

        for event in &ready[..n as usize] {
            let index = event.u64 as usize;
            let flags = event.events;
            let Some(device) = devices.get(index) else {
                continue;
            };
            if flags & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
                // Unplugged or broken device; stop watching it.
                // SAFETY: DEL ignores the event argument on modern kernels.
                unsafe {
                    libc::epoll_ctl(
                        epoll.as_raw_fd(),
                        libc::EPOLL_CTL_DEL,
                        device.as_raw_fd(),
                        std::ptr::null_mut(),
                    );
                }
                continue;
            }
            tally.events += drain_records(device, &mut buffer);
        }
    }

    debug!(
        "Input monitor saw {} events on {} devices",
        tally.events, tally.devices
    );
    Ok(tally)
}

fn open_devices(dir: &Path) -> Result<Vec<File>, InputError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::PermissionDenied => {
            return Err(InputError::Denied(format!("{}: {}", dir.display(), e)))
        }
        Err(_) => return Err(InputError::NoDevices),
    };

    let mut devices = Vec::new();
    let mut denied = 0usize;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            continue;
        }
        match OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK | libc::O_CLOEXEC)
            .open(&path)
        {
            Ok(file) => devices.push(file),
            Err(e) if e.kind() == ErrorKind::PermissionDenied => denied += 1,
            Err(e) => debug!("Skipping {}: {}", path.display(), e),
        }
    }

    if devices.is_empty() {
        if denied > 0 {
            return Err(InputError::Denied(format!(
                "{denied} input devices under {} are not readable",
                dir.display()
            )));
        }
        return Err(InputError::NoDevices);
    }
    Ok(devices)
}

fn drain_records(mut device: &File, buffer: &mut [u8]) -> u64 {
    let mut records = 0u64;
    loop {
        match device.read(buffer) {
            Ok(0) => break,
            Ok(n) => records += (n / RECORD_SIZE) as u64,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
    records
}
