use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Instant;

use accountability_engine::composite::{read_profiles, SchoolProfiles};
use accountability_engine::config::{self, Config};
use accountability_engine::orchestrator::{self, COMPOSITE_TABLE};
use accountability_engine::records::{read_records, RecordTable};
use accountability_engine::store::CsvTableStore;
use accountability_engine::{indicator, output, table, telemetry, EngineError};

const EXIT_SUCCESS: i32 = 0;
const EXIT_INPUT: i32 = 1;
const EXIT_STORE: i32 = 2;
const EXIT_CONFIG: i32 = 4;

/// File stem of the school profile table in the input directory
const PROFILES_FILE: &str = "schools";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Table,
    Tsv,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write the starter configuration
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
    /// Check the configuration and list every problem found
    Validate,
    /// Score every indicator and the composites for one fiscal year
    Run {
        #[arg(long)]
        fiscal_year: i32,
        /// Directory of <source>.csv record tables (plus schools.csv)
        #[arg(long)]
        input: PathBuf,
        /// Directory holding <fiscal_year>/<table>.csv results
        #[arg(long)]
        store: PathBuf,
        #[arg(long, value_enum, default_value_t = Format::Table)]
        format: Format,
    },
    /// Print the statewide reference distribution of one indicator
    Reference {
        #[arg(long)]
        indicator: String,
        /// Directory of <source>.csv record tables
        #[arg(long)]
        input: PathBuf,
    },
}

#[derive(Parser, Debug)]
#[command(name = "accountability-engine")]
#[command(about = "School accountability scoring and composite grades", long_about = None)]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to config file (defaults to ~/.config/accountability-engine/config.yaml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

fn main() {
    let cli = Cli::parse();
    let start_time = Instant::now();
    let config_path = cli.config.map(PathBuf::from);

    if let Commands::Init { force } = cli.command {
        let path = match config_path.map(Ok).unwrap_or_else(config::get_config_path) {
            Ok(p) => p,
            Err(e) => {
                eprintln!("Config error: {:#}", e);
                std::process::exit(EXIT_CONFIG);
            }
        };
        if let Err(e) = config::write_starter_config(&path, force) {
            eprintln!("Config error: {:#}", e);
            std::process::exit(EXIT_CONFIG);
        }
        println!("Wrote starter config to {}", path.display());
        std::process::exit(EXIT_SUCCESS);
    }

    let config = match config::load_config(config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Config error: {:#}", e);
            std::process::exit(EXIT_CONFIG);
        }
    };

    let level = telemetry::log_level(config.log_level.as_deref(), cli.verbose);
    if let Err(e) = telemetry::init(&level) {
        eprintln!("Config error: {}", e);
        std::process::exit(EXIT_CONFIG);
    }

    if let Err(EngineError::Configuration(errors)) = config::ensure_valid(&config) {
        eprintln!("Configuration errors:");
        for error in errors {
            eprintln!("  - {}", error);
        }
        std::process::exit(EXIT_CONFIG);
    }

    let code = match cli.command {
        Commands::Init { .. } => EXIT_SUCCESS,
        Commands::Validate => {
            println!(
                "Configuration OK: {} indicators, {} models",
                config.indicators.len(),
                config.models.len()
            );
            EXIT_SUCCESS
        }
        Commands::Run {
            fiscal_year,
            input,
            store,
            format,
        } => run(&config, fiscal_year, &input, &store, format, start_time),
        Commands::Reference { indicator, input } => reference(&config, &indicator, &input),
    };

    std::process::exit(code);
}

fn exit_code(err: &EngineError) -> i32 {
    match err {
        EngineError::Configuration(_) => EXIT_CONFIG,
        EngineError::Schema { .. } | EngineError::Csv(_) | EngineError::Io(_) => EXIT_INPUT,
        EngineError::Store { .. } | EngineError::Json(_) => EXIT_STORE,
    }
}

fn run(config: &Config, fiscal_year: i32, input: &Path, store_root: &Path, format: Format, start_time: Instant) -> i32 {
    let (sources, profiles) = match load_inputs(config, input) {
        Ok(inputs) => inputs,
        Err(e) => {
            eprintln!("Input error: {:#}", e);
            return EXIT_INPUT;
        }
    };

    let mut store = CsvTableStore::new(store_root);
    match store.fiscal_years(COMPOSITE_TABLE) {
        Ok(years) => tracing::info!(?years, "composite results on file"),
        Err(e) => tracing::warn!(error = %e, "could not list stored fiscal years"),
    }

    match store.previous_manifest(fiscal_year) {
        Ok(Some(previous)) => tracing::info!(
            fiscal_year,
            finished_at = %previous.finished_at,
            warnings = previous.warnings.len(),
            "replacing results of an earlier run"
        ),
        Ok(None) => {}
        Err(e) => tracing::warn!(error = %e, "could not read the earlier run manifest"),
    }

    let started_at = chrono::Utc::now();
    let run_output = match orchestrator::run(config, fiscal_year, &sources, &profiles, &mut store) {
        Ok(o) => o,
        Err(e) => {
            eprintln!("Run failed: {}", e);
            return exit_code(&e);
        }
    };

    if let Err(e) = store.save_manifest(&run_output.manifest(started_at)) {
        eprintln!("Store error: {:#}", e);
        return EXIT_STORE;
    }

    let use_colors = output::should_use_colors();
    match format {
        Format::Table => {
            println!("{}", output::format_composite_table(&run_output.composites, use_colors));
            eprintln!();
            eprintln!(
                "{}",
                output::format_run_summary(&run_output, start_time.elapsed(), use_colors)
            );
        }
        Format::Tsv | Format::Json => {
            let column = config
                .composite_history
                .as_ref()
                .map(|h| h.column.as_str())
                .unwrap_or("history");
            let composite = table::composite_table(&run_output.composites, config.decimals, column);
            if format == Format::Tsv {
                println!("{}", output::format_tsv(&composite));
            } else {
                println!("{}", output::format_json(&composite));
            }
            if !run_output.warnings.is_empty() {
                eprintln!(
                    "{}",
                    output::format_run_summary(&run_output, start_time.elapsed(), false)
                );
            }
        }
    }

    EXIT_SUCCESS
}

fn reference(config: &Config, name: &str, input: &Path) -> i32 {
    let Some(indicator) = config.indicator(name) else {
        eprintln!("Unknown indicator '{}'", name);
        return EXIT_CONFIG;
    };

    let path = input.join(format!("{}.csv", indicator.source));
    let records = match read_table_file(&path) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("Input error: {:#}", e);
            return EXIT_INPUT;
        }
    };

    let result = records
        .check_schema(indicator)
        .and_then(|()| indicator::reference_for(indicator, config, &records.records));
    match result {
        Ok(references) => {
            println!(
                "{}",
                output::format_references(&references, output::should_use_colors())
            );
            EXIT_SUCCESS
        }
        Err(e) => {
            eprintln!("{}", e);
            exit_code(&e)
        }
    }
}

fn read_table_file(path: &Path) -> anyhow::Result<RecordTable> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let table = read_records(file).with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(table)
}

/// Read every `<source>.csv` the configuration names from `input`, plus the
/// optional school profile table.
fn load_inputs(config: &Config, input: &Path) -> anyhow::Result<(BTreeMap<String, RecordTable>, SchoolProfiles)> {
    let pattern = input.join("*.csv");
    let pattern = pattern
        .to_str()
        .with_context(|| format!("Input path is not valid UTF-8: {}", input.display()))?
        .to_string();

    let mut sources = BTreeMap::new();
    let mut profiles = SchoolProfiles::new();
    for entry in glob::glob(&pattern).with_context(|| format!("Invalid input pattern {}", pattern))? {
        let path = entry.context("Failed to list input directory")?;
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
            continue;
        };

        if stem == PROFILES_FILE {
            let file = File::open(&path).with_context(|| format!("Failed to open {}", path.display()))?;
            profiles = read_profiles(file).with_context(|| format!("Failed to read {}", path.display()))?;
        } else if config.indicators.iter().any(|i| i.source == stem) {
            let table = read_table_file(&path)?;
            tracing::info!(source = %stem, records = table.records.len(), "loaded records");
            sources.insert(stem, table);
        } else {
            tracing::debug!(file = %path.display(), "ignoring input not named by any indicator");
        }
    }

    if profiles.is_empty() {
        tracing::info!("no school profile table; no bonus, ineligibility or identification data");
    }

    Ok((sources, profiles))
}
