use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::io::{self, IsTerminal, Write};
use std::path::PathBuf;

use crate::config::types::{Category, Finding};
use crate::config::validator::validate_config;
use crate::config::ProbeConfig;
use crate::probe::kinds::kind_paths;
use crate::probe::Probe;
use crate::registry::{global_registry, init_registry};
use crate::runner::{ReportSink, RunOptions, Runner};
use crate::verdict::{Assessment, CategoryReport, ReportEntry};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run detection probes (all categories by default)
    Run {
        /// Category to run; repeatable (sandbox, vm, auto-analysis)
        #[arg(long = "category", short = 'c', value_name = "CATEGORY")]
        categories: Vec<Category>,
        /// Probe configuration file (default: ./trustprobe.json or built-in tables)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Emit JSON lines instead of the console report
        #[arg(long)]
        json: bool,
        /// Record terminal probes as inconclusive instead of running them
        #[arg(long)]
        skip_terminal: bool,
        /// Run categories on separate threads (no streaming output)
        #[arg(long)]
        concurrent: bool,
    },
    /// List registered probes
    List {
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Validate a probe configuration file
    CheckConfig {
        path: PathBuf,
    },
}

/// Console presenter; prints every outcome as soon as it is known
struct ConsoleSink {
    color: bool,
    /// The terminal probe's description is already on screen
    terminal_pending: bool,
}

impl ConsoleSink {
    fn new() -> Self {
        Self {
            color: io::stdout().is_terminal(),
            terminal_pending: false,
        }
    }

    fn label(&self, finding: Finding) -> String {
        let code = match finding {
            Finding::Positive => "1;31",
            Finding::Negative => "1;32",
            Finding::Inconclusive => "1;33",
        };
        if self.color {
            format!("\x1b[{code}m{}\x1b[0m", finding.label())
        } else {
            finding.label().to_string()
        }
    }
}

impl ReportSink for ConsoleSink {
    fn category_started(&mut self, category: Category, _probes: usize) {
        println!("{}:", category.heading());
    }

    fn probe_finished(&mut self, _category: Category, entry: &ReportEntry) {
        let finding = entry.finding();
        let mut line = if self.terminal_pending {
            self.terminal_pending = false;
            self.label(finding)
        } else {
            format!("\t{}: {}", entry.description, self.label(finding))
        };
        if finding == Finding::Inconclusive {
            if let Some(reason) = entry.outcome.diagnostic() {
                line.push_str(&format!(" ({reason})"));
            }
        }
        println!("{line}");
    }

    fn before_terminal(
        &mut self,
        _category: Category,
        probe: &Probe,
        on_fault: &ReportEntry,
    ) -> Option<String> {
        print!("\t{}: ", probe.description);
        // Everything printed so far must survive the probe ending the process.
        let _ = io::stdout().flush();
        self.terminal_pending = true;
        Some(format!("{}\n", self.label(on_fault.finding())))
    }

    fn category_finished(&mut self, report: &CategoryReport) {
        let verdict = if report.is_detected() {
            self.label(Finding::Positive)
        } else {
            self.label(Finding::Negative)
        };
        println!("\t=> {} {}\n", report.category, verdict);
    }
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum JsonLine<'a> {
    Probe {
        category: Category,
        #[serde(flatten)]
        entry: &'a ReportEntry,
    },
    Assessment(&'a Assessment),
}

fn render_json(line: &JsonLine<'_>) -> Option<String> {
    match serde_json::to_string(line) {
        Ok(json) => Some(json),
        Err(e) => {
            log::error!("Failed to serialize report line: {}", e);
            None
        }
    }
}

fn emit_json(line: &JsonLine<'_>) {
    if let Some(json) = render_json(line) {
        println!("{json}");
    }
}

/// JSON-lines presenter: one line per probe, then the assessment
struct JsonSink;

impl ReportSink for JsonSink {
    fn probe_finished(&mut self, category: Category, entry: &ReportEntry) {
        emit_json(&JsonLine::Probe { category, entry });
    }

    fn before_terminal(
        &mut self,
        category: Category,
        _probe: &Probe,
        on_fault: &ReportEntry,
    ) -> Option<String> {
        let _ = io::stdout().flush();
        render_json(&JsonLine::Probe {
            category,
            entry: on_fault,
        })
        .map(|json| json + "\n")
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<ProbeConfig> {
    let config = match path {
        Some(path) => ProbeConfig::load_from_file(path)?,
        None => ProbeConfig::load_default()?,
    };
    Ok(config)
}

pub fn run() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Run {
        categories: Vec::new(),
        config: None,
        json: false,
        skip_terminal: false,
        concurrent: false,
    });

    match command {
        Commands::Run {
            categories,
            config,
            json,
            skip_terminal,
            concurrent,
        } => {
            let config = load_config(config.as_ref())?;
            init_registry(&config).context("Failed to build probe registry")?;
            let categories = if categories.is_empty() {
                Category::ALL.to_vec()
            } else {
                categories
            };

            let runner =
                Runner::new(global_registry()).with_options(RunOptions { skip_terminal });
            if concurrent {
                let assessment = runner.run_all_concurrently(&categories);
                if json {
                    for report in &assessment.reports {
                        for entry in &report.entries {
                            emit_json(&JsonLine::Probe {
                                category: report.category,
                                entry,
                            });
                        }
                    }
                    emit_json(&JsonLine::Assessment(&assessment));
                } else {
                    let mut sink = ConsoleSink::new();
                    for report in &assessment.reports {
                        sink.category_started(report.category, report.len());
                        for entry in &report.entries {
                            sink.probe_finished(report.category, entry);
                        }
                        sink.category_finished(report);
                    }
                }
            } else if json {
                let assessment = runner.run_all(&categories, &mut JsonSink);
                emit_json(&JsonLine::Assessment(&assessment));
            } else {
                runner.run_all(&categories, &mut ConsoleSink::new());
            }
        }
        Commands::List { config } => {
            let config = load_config(config.as_ref())?;
            init_registry(&config).context("Failed to build probe registry")?;
            let registry = global_registry();
            for category in Category::ALL {
                println!("{} ({} probes)", category, registry.len(category));
                for probe in registry.probes(category) {
                    let spec = config
                        .specs(category)
                        .iter()
                        .find(|spec| spec.name == probe.name);
                    let kind = spec.map_or("custom", |spec| spec.kind.type_name());
                    let marker = if probe.is_terminal() { " [terminal]" } else { "" };
                    println!(
                        "  {:<26} {:<30} {:?}, timeout {:?}{}",
                        probe.name, kind, probe.hazard, probe.timeout, marker
                    );
                    if let Some(spec) = spec {
                        for path in kind_paths(&spec.kind) {
                            println!("  {:<26} reads {}", "", path.display());
                        }
                    }
                }
            }
        }
        Commands::CheckConfig { path } => {
            let config = ProbeConfig::load_from_file(&path)?;
            let result = validate_config(&config);
            for warning in &result.warnings {
                println!("warning: {warning}");
            }
            for error in &result.errors {
                println!("error: {error}");
            }
            if !result.is_valid() {
                anyhow::bail!(
                    "{} is invalid ({} errors)",
                    path.display(),
                    result.errors.len()
                );
            }
            let total: usize = Category::ALL
                .iter()
                .map(|&category| config.specs(category).len())
                .sum();
            println!("{}: {} probes, configuration is valid", path.display(), total);
        }
    }

    Ok(())
}
