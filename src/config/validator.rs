// Probe configuration validation
// Errors are fatal at registry-build time; warnings are logged and tolerated.

use std::collections::HashSet;
use std::time::Duration;

use crate::config::loader::ProbeConfig;
use crate::config::types::{Category, ProbeError, Result};
use crate::probe::{ProbeKind, ProbeSpec};

/// Validation result with detailed errors
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_error(&mut self, error: String) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Check every category of `config`
pub fn validate_config(config: &ProbeConfig) -> ValidationResult {
    let mut result = ValidationResult::new();
    for category in Category::ALL {
        validate_category(category, config.specs(category), &mut result);
    }
    result
}

/// Like [`validate_config`], but errors become a [`ProbeError::Config`]
pub fn ensure_valid(config: &ProbeConfig) -> Result<ValidationResult> {
    let result = validate_config(config);
    if !result.is_valid() {
        return Err(ProbeError::Config(format!(
            "Probe configuration is invalid:\n{}",
            result.errors.join("\n")
        )));
    }
    Ok(result)
}

fn validate_category(category: Category, specs: &[ProbeSpec], result: &mut ValidationResult) {
    let mut names = HashSet::new();
    let enabled: Vec<&ProbeSpec> = specs.iter().filter(|spec| spec.enabled).collect();

    for spec in specs {
        if spec.name.trim().is_empty() {
            result.add_error(format!("{category}: probe with an empty name"));
        } else if spec.name.chars().any(char::is_control) {
            result.add_error(format!(
                "{category}: probe name {:?} contains control characters",
                spec.name
            ));
        } else if !names.insert(spec.name.as_str()) {
            result.add_error(format!("{category}: duplicate probe name '{}'", spec.name));
        }
        validate_spec(category, spec, result);
    }

    let terminals: Vec<usize> = enabled
        .iter()
        .enumerate()
        .filter(|(_, spec)| spec.kind.is_terminal())
        .map(|(index, _)| index)
        .collect();
    if terminals.len() > 1 {
        result.add_error(format!(
            "{category}: {} terminal probes configured, at most one allowed",
            terminals.len()
        ));
    }
    if let Some(&index) = terminals.first() {
        if index + 1 != enabled.len() {
            result.add_error(format!(
                "{category}: terminal probe '{}' must be the last enabled probe",
                enabled[index].name
            ));
        }
    }
}

fn validate_spec(category: Category, spec: &ProbeSpec, result: &mut ValidationResult) {
    let name = &spec.name;

    if let Some(markers) = spec.kind.markers() {
        if markers.is_empty() {
            result.add_error(format!(
                "{category}/{name}: {} needs at least one marker",
                spec.kind.type_name()
            ));
        } else if markers.iter().any(|marker| marker.is_empty()) {
            result.add_error(format!("{category}/{name}: empty marker string"));
        }
    }

    match &spec.kind {
        ProbeKind::DirectoryContainsAnyName { dirs, .. }
        | ProbeKind::DirectoryContainsNamePrefix { dirs, .. }
            if dirs.is_empty() =>
        {
            result.add_error(format!("{category}/{name}: no directories to scan"));
        }
        ProbeKind::ExecutableNameIsHexDigest { length: 0 } => {
            result.add_error(format!("{category}/{name}: digest length cannot be zero"));
        }
        ProbeKind::SleepDrift {
            reference,
            sleep_ms,
            tolerance_ms,
        } => {
            if *sleep_ms == 0 {
                result.add_error(format!("{category}/{name}: sleep_ms cannot be zero"));
            }
            if tolerance_ms >= sleep_ms {
                result.add_warning(format!(
                    "{category}/{name}: tolerance {tolerance_ms} ms swallows the whole sleep"
                ));
            }
            if Duration::from_millis(*tolerance_ms) < reference.granularity() {
                result.add_warning(format!(
                    "{category}/{name}: tolerance {tolerance_ms} ms is finer than {} resolution {:?}",
                    reference.as_str(),
                    reference.granularity()
                ));
            }
        }
        ProbeKind::VmexitLatency {
            samples,
            interval_ms,
            ..
        } => {
            if *samples == 0 {
                result.add_error(format!("{category}/{name}: samples cannot be zero"));
            }
            if *interval_ms == 0 {
                result.add_warning(format!(
                    "{category}/{name}: zero interval samples back to back"
                ));
            }
        }
        ProbeKind::InputEvents {
            window_ms, tick_ms, ..
        } => {
            if *window_ms == 0 {
                result.add_error(format!("{category}/{name}: window_ms cannot be zero"));
            }
            if *tick_ms == 0 {
                result.add_error(format!("{category}/{name}: tick_ms cannot be zero"));
            }
        }
        _ => {}
    }

    if spec.timeout_ms == Some(0) {
        result.add_error(format!("{category}/{name}: timeout_ms cannot be zero"));
    }
    if let Some(window) = spec.kind.measurement_window() {
        if spec.timeout() < window {
            result.add_warning(format!(
                "{category}/{name}: timeout {:?} is shorter than its measurement window {:?}",
                spec.timeout(),
                window
            ));
        }
    }
}
