//! Evidence Source primitives
//!
//! Pure functions over OS state. None of them fail: an unreadable resource
//! collapses to a negative answer so one missing pseudo-file never aborts the
//! evaluation of sibling probes. Probes that need to tell "unreadable" from
//! "not found" use [`scan_file`] / [`list_directory_names`] directly.

pub mod clock;
pub mod host;

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

pub use clock::{measure_drift_under_sleep, ClockSource, DriftMeasurement};

/// Outcome of a line-by-line file scan
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FileScan {
    Unreadable,
    NoMatch,
    /// First matching line (1-based) and the word that matched
    Match { line: usize, word: String },
}

/// Stream `path` line by line, stopping at the first line containing any of
/// `words` (case-sensitive substring match)
pub fn scan_file<S: AsRef<str>>(path: &Path, words: &[S]) -> FileScan {
    let Ok(file) = File::open(path) else {
        return FileScan::Unreadable;
    };
    let mut reader = BufReader::new(file);
    let mut raw = Vec::new();
    let mut line_number = 0usize;

    loop {
        raw.clear();
        match reader.read_until(b'\n', &mut raw) {
            Ok(0) => return FileScan::NoMatch,
            Ok(_) => {
                line_number += 1;
                // Pseudo-files may carry arbitrary bytes; match on a lossy view.
                let line = String::from_utf8_lossy(&raw);
                let found = words
                    .iter()
                    .map(|w| w.as_ref())
                    .find(|w: &&str| line.contains(*w));
                if let Some(word) = found {
                    return FileScan::Match {
                        line: line_number,
                        word: word.to_string(),
                    };
                }
            }
            // A read error part-way (e.g. EIO on a sysfs attribute) ends the scan.
            Err(_) if line_number == 0 => return FileScan::Unreadable,
            Err(_) => return FileScan::NoMatch,
        }
    }
}

/// True on the first line of `path` containing any of `words`; false when the
/// file cannot be opened
pub fn file_contains_any<S: AsRef<str>>(path: &Path, words: &[S]) -> bool {
    matches!(scan_file(path, words), FileScan::Match { .. })
}

/// Entry names of `path` (one level), or `None` when it cannot be listed
pub fn list_directory_names(path: &Path) -> Option<Vec<String>> {
    let entries = std::fs::read_dir(path).ok()?;
    Some(
        entries
            .flatten()
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect(),
    )
}

/// True if any entry of `path` is named exactly one of `names`
pub fn directory_contains_any_name<S: AsRef<str>>(path: &Path, names: &[S]) -> bool {
    list_directory_names(path)
        .map(|entries| {
            entries
                .iter()
                .any(|entry| names.iter().any(|name| name.as_ref() == entry.as_str()))
        })
        .unwrap_or(false)
}

/// True if any entry name of `path` starts with one of `prefixes`
pub fn directory_contains_name_prefix<S: AsRef<str>>(path: &Path, prefixes: &[S]) -> bool {
    list_directory_names(path)
        .map(|entries| {
            entries.iter().any(|entry| {
                prefixes.iter().any(|prefix| {
                    let prefix: &str = prefix.as_ref();
                    entry.starts_with(prefix)
                })
            })
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_missing_file_is_false_not_error() {
        assert!(!file_contains_any(Path::new("/nonexistent"), &["x"]));
        assert_eq!(
            scan_file(Path::new("/nonexistent"), &["x"]),
            FileScan::Unreadable
        );
    }

    #[test]
    fn test_scan_reports_first_matching_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("modules");
        fs::write(&path, "ext4 1 0\nvboxguest 2 0\nvmw_balloon 3 0\n").unwrap();

        assert_eq!(
            scan_file(&path, &["vmw_balloon", "vboxguest"]),
            FileScan::Match {
                line: 2,
                word: "vboxguest".to_string()
            }
        );
        assert!(!file_contains_any(&path, &["VBOXGUEST"]));
    }

    #[test]
    fn test_scan_tolerates_non_utf8() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bios_vendor");
        fs::write(&path, b"\xff\xfe innotek GmbH\n").unwrap();
        assert!(file_contains_any(&path, &["innotek"]));
    }

    #[test]
    fn test_empty_directory_has_no_names() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!directory_contains_any_name(dir.path(), &["gdb"]));
        assert_eq!(list_directory_names(dir.path()), Some(vec![]));
    }

    #[test]
    fn test_directory_exact_and_prefix_matching() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("vmware-toolbox-cmd"), "").unwrap();
        fs::write(dir.path().join("gdb"), "").unwrap();

        assert!(directory_contains_any_name(dir.path(), &["gdb"]));
        assert!(!directory_contains_any_name(dir.path(), &["vmware-"]));
        assert!(directory_contains_name_prefix(dir.path(), &["vmware-"]));
        assert!(!directory_contains_any_name(Path::new("/nonexistent"), &["gdb"]));
    }
}
