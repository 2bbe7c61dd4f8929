use std::path::PathBuf;

use anyhow::Result;

use {
    warden_config::{Severity, ValidationResult, WardenConfig, validate},
    warden_extensions::{BundledSource, ExtensionSource},
};

/// ANSI color codes.
const RED: &str = "\x1b[31m";
const YELLOW: &str = "\x1b[33m";
const CYAN: &str = "\x1b[36m";
const BOLD: &str = "\x1b[1m";
const RESET: &str = "\x1b[0m";

/// Names of the extensions compiled into this binary.
pub fn bundled_names() -> Vec<String> {
    BundledSource
        .available()
        .iter()
        .map(|f| f.name().to_string())
        .collect()
}

/// Validate `config` against the bundled extensions.
pub fn diagnose(config: &WardenConfig) -> ValidationResult {
    let known = bundled_names();
    validate(config, Some(known.as_slice()))
}

/// Print diagnostics to stderr. Returns the number of errors.
pub fn report(result: &ValidationResult, verbose: bool) -> usize {
    let mut shown = 0;
    for d in &result.diagnostics {
        if d.severity == Severity::Info && !verbose {
            continue;
        }

        let (color, label) = match d.severity {
            Severity::Error => (RED, "error"),
            Severity::Warning => (YELLOW, "warning"),
            Severity::Info => (CYAN, "info"),
        };

        if d.path.is_empty() {
            eprintln!("  {BOLD}{color}{label}{RESET} {}", d.message);
        } else {
            eprintln!("  {BOLD}{color}{label}{RESET} {}: {}", d.path, d.message);
        }
        shown += 1;
    }
    if shown > 0 {
        eprintln!();
    }
    result.count(Severity::Error)
}

pub fn check(config: &WardenConfig, path: Option<PathBuf>, verbose: bool) -> Result<()> {
    let mut result = diagnose(config);
    result.config_path = path;

    if let Some(ref path) = result.config_path {
        eprintln!("Checking {}\n", path.display());
    } else {
        eprintln!("No config file found; checking defaults.\n");
    }

    let errors = report(&result, verbose);
    let warnings = result.count(Severity::Warning);

    if errors == 0 && warnings == 0 {
        eprintln!("No issues found.");
    } else {
        eprintln!("{errors} error(s), {warnings} warning(s)");
    }

    if errors > 0 {
        std::process::exit(1);
    }

    Ok(())
}

pub fn list_extensions() {
    let mut factories = BundledSource.available();
    factories.sort_by(|a, b| a.name().cmp(b.name()));
    for factory in factories {
        println!(
            "  {:<16} {:<11} {}",
            factory.name(),
            factory.scope().to_string(),
            factory.description()
        );
    }
}
