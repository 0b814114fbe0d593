//! Probe registry
//!
//! Ordered, append-only probe lists per category. A category holds at most one
//! terminal probe, kept in a dedicated slot so it is always yielded last.
//! The process-wide instance is built once and read-only thereafter.

use log::{debug, error, info, warn};
use std::collections::BTreeMap;
use std::sync::OnceLock;

use crate::config::types::{Category, ProbeError, Result};
use crate::config::validator::ensure_valid;
use crate::config::ProbeConfig;
use crate::probe::Probe;

static GLOBAL_REGISTRY: OnceLock<ProbeRegistry> = OnceLock::new();

#[derive(Debug, Default)]
struct CategoryProbes {
    ordered: Vec<Probe>,
    terminal: Option<Probe>,
}

impl CategoryProbes {
    fn contains(&self, name: &str) -> bool {
        self.iter().any(|probe| probe.name == name)
    }

    fn iter(&self) -> impl Iterator<Item = &Probe> {
        self.ordered.iter().chain(self.terminal.iter())
    }

    fn len(&self) -> usize {
        self.ordered.len() + usize::from(self.terminal.is_some())
    }
}

#[derive(Debug, Default)]
pub struct ProbeRegistry {
    categories: BTreeMap<Category, CategoryProbes>,
}

impl ProbeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry over the built-in probe tables
    pub fn builtin() -> Result<Self> {
        Self::from_config(&ProbeConfig::default())
    }

    /// Validate `config` and register every enabled probe in table order
    pub fn from_config(config: &ProbeConfig) -> Result<Self> {
        let validation = ensure_valid(config)?;
        for warning in &validation.warnings {
            warn!("Configuration warning: {}", warning);
        }

        let mut registry = Self::new();
        for category in Category::ALL {
            for spec in config.specs(category) {
                if !spec.enabled {
                    debug!("Skipping disabled probe {}/{}", category, spec.name);
                    continue;
                }
                registry.register(spec.build(category))?;
            }
        }
        Ok(registry)
    }

    /// Append `probe` to its category
    ///
    /// Names are unique within a category. A terminal probe takes the category's
    /// terminal slot, which holds one probe.
    pub fn register(&mut self, probe: Probe) -> Result<()> {
        let category = probe.category;
        let entry = self.categories.entry(category).or_default();

        if entry.contains(&probe.name) {
            return Err(ProbeError::DuplicateProbe {
                category,
                name: probe.name,
            });
        }
        if probe.is_terminal() {
            if let Some(existing) = &entry.terminal {
                return Err(ProbeError::TerminalSlotTaken {
                    category,
                    existing: existing.name.clone(),
                });
            }
            debug!("Registered terminal probe {}/{}", category, probe.name);
            entry.terminal = Some(probe);
        } else {
            debug!("Registered probe {}/{}", category, probe.name);
            entry.ordered.push(probe);
        }
        Ok(())
    }

    /// Probes of `category` in execution order, terminal probe last
    pub fn probes(&self, category: Category) -> Vec<&Probe> {
        self.categories
            .get(&category)
            .map(|entry| entry.iter().collect())
            .unwrap_or_default()
    }

    pub fn get(&self, category: Category, name: &str) -> Option<&Probe> {
        self.categories
            .get(&category)?
            .iter()
            .find(|probe| probe.name == name)
    }

    pub fn terminal(&self, category: Category) -> Option<&Probe> {
        self.categories.get(&category)?.terminal.as_ref()
    }

    pub fn len(&self, category: Category) -> usize {
        self.categories.get(&category).map_or(0, CategoryProbes::len)
    }

    pub fn total(&self) -> usize {
        self.categories.values().map(CategoryProbes::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

/// Build the process-wide registry from `config`
///
/// Fails with [`ProbeError::AlreadyInitialized`] once a registry exists,
/// including one created lazily by [`global_registry`].
pub fn init_registry(config: &ProbeConfig) -> Result<()> {
    let registry = ProbeRegistry::from_config(config)?;
    let total = registry.total();
    GLOBAL_REGISTRY
        .set(registry)
        .map_err(|_| ProbeError::AlreadyInitialized)?;
    info!("Probe registry initialized with {} probes", total);
    Ok(())
}

/// The process-wide registry, built from the default configuration on first use
pub fn global_registry() -> &'static ProbeRegistry {
    GLOBAL_REGISTRY.get_or_init(|| {
        let config = ProbeConfig::load_default().unwrap_or_else(|e| {
            warn!("{}; using built-in probe tables", e);
            ProbeConfig::default()
        });
        ProbeRegistry::from_config(&config)
            .or_else(|e| {
                warn!("{}; using built-in probe tables", e);
                ProbeRegistry::builtin()
            })
            .unwrap_or_else(|e| {
                error!("Built-in probe tables rejected: {}", e);
                ProbeRegistry::new()
            })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::{Finding, ProbeResult};

    fn probe(name: &str, category: Category) -> Probe {
        Probe::inline(name, category, |_| Ok(ProbeResult::negative()))
    }

    fn no_backdoor() -> Finding {
        Finding::Negative
    }

    #[test]
    fn test_registration_order_is_kept_and_terminal_runs_last() {
        let mut registry = ProbeRegistry::new();
        registry
            .register(Probe::terminal("in", Category::VirtualMachine, no_backdoor, 0))
            .unwrap();
        registry.register(probe("bios", Category::VirtualMachine)).unwrap();
        registry.register(probe("scsi", Category::VirtualMachine)).unwrap();

        let names: Vec<&str> = registry
            .probes(Category::VirtualMachine)
            .iter()
            .map(|probe| probe.name.as_str())
            .collect();
        assert_eq!(names, vec!["bios", "scsi", "in"]);
        assert_eq!(registry.len(Category::VirtualMachine), 3);
        assert_eq!(registry.terminal(Category::VirtualMachine).unwrap().name, "in");
    }

    #[test]
    fn test_duplicates_are_rejected() {
        let mut registry = ProbeRegistry::new();
        registry.register(probe("cores", Category::Sandbox)).unwrap();
        let err = registry.register(probe("cores", Category::Sandbox)).unwrap_err();
        assert!(matches!(err, ProbeError::DuplicateProbe { .. }));

        // Same name in another category is a different probe.
        registry.register(probe("cores", Category::VirtualMachine)).unwrap();

        registry
            .register(Probe::terminal("in", Category::Sandbox, no_backdoor, 0))
            .unwrap();
        let err = registry
            .register(Probe::terminal("in2", Category::Sandbox, no_backdoor, 0))
            .unwrap_err();
        assert!(matches!(err, ProbeError::TerminalSlotTaken { .. }));
    }

    #[test]
    fn test_empty_category() {
        let registry = ProbeRegistry::new();
        assert!(registry.probes(Category::AutoAnalysis).is_empty());
        assert_eq!(registry.len(Category::AutoAnalysis), 0);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_builtin_registry_matches_tables() {
        let registry = ProbeRegistry::builtin().unwrap();
        let config = ProbeConfig::default();
        for category in Category::ALL {
            assert_eq!(registry.len(category), config.specs(category).len());
        }
        assert!(registry.get(Category::Sandbox, "cpu_cores").is_some());
    }

    #[test]
    fn test_disabled_specs_are_not_registered() {
        let mut config = ProbeConfig::default();
        config.sandbox[0].enabled = false;
        let registry = ProbeRegistry::from_config(&config).unwrap();
        assert_eq!(registry.len(Category::Sandbox), config.sandbox.len() - 1);
        assert!(registry.get(Category::Sandbox, "tracer_pid_procfs").is_none());
    }
}
