//! CLI entrypoint for the chainalloc harness.

use std::io::Write;
use std::path::PathBuf;

use chainalloc_harness::scenarios;
use chainalloc_harness::stress::{self, BackendKind, StressConfig};
use chainalloc_harness::structured_log::LogEmitter;
use clap::{Parser, Subcommand};

/// Scenario and stress tooling for chainalloc.
#[derive(Debug, Parser)]
#[command(name = "chainalloc-harness")]
#[command(about = "Scenario and stress harness for chainalloc")]
struct Cli {
    /// Log filter for the harness and allocator (`RUST_LOG` syntax).
    #[arg(long, global = true, default_value = "info")]
    log: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run shared-instance multi-thread stress and emit a JSON report.
    Stress {
        #[arg(long, default_value_t = 4)]
        threads: usize,
        #[arg(long, default_value_t = 10_000)]
        rounds: usize,
        /// Largest request size in bytes.
        #[arg(long, default_value_t = 3 * 4096)]
        max_size: usize,
        /// Root seed (decimal or 0x...).
        #[arg(long, default_value = "0xC4A1A110C0000001")]
        seed: String,
        #[arg(long, value_enum, default_value_t = BackendKind::Buffered)]
        backend: BackendKind,
        /// Routing page size; the system backend should keep the OS page size.
        #[arg(long)]
        page_size: Option<usize>,
        /// Output JSON path (if omitted, prints to stdout).
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Run the named scenarios and emit JSONL verdicts.
    Scenarios {
        /// Only run scenarios whose name contains this string.
        #[arg(long)]
        filter: Option<String>,
        /// Also emit every allocator lifecycle record.
        #[arg(long)]
        lifecycle: bool,
        #[arg(long, default_value = "local")]
        run_id: String,
        /// Output JSONL path (if omitted, prints to stdout).
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// List scenario names.
    List,
}

fn parse_seed(raw: &str) -> Result<u64, String> {
    let cleaned = raw.replace('_', "");
    let parsed = match cleaned.strip_prefix("0x").or_else(|| cleaned.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => cleaned.parse(),
    };
    parsed.map_err(|e| format!("invalid seed '{raw}': {e}"))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log))
        .format_timestamp_millis()
        .init();

    match cli.command {
        Command::Stress {
            threads,
            rounds,
            max_size,
            seed,
            backend,
            page_size,
            output,
        } => {
            let config = StressConfig {
                threads,
                rounds,
                max_size,
                seed: parse_seed(&seed)?,
                backend,
                page_size: page_size.unwrap_or_else(|| match backend {
                    BackendKind::Buffered => StressConfig::default().page_size,
                    BackendKind::System => chainalloc_core::config::system_page_size(),
                }),
            };
            let report = stress::run(&config)?;
            let json = serde_json::to_string_pretty(&report)?;
            match output {
                Some(path) => {
                    std::fs::write(&path, json + "\n")?;
                    eprintln!("Wrote stress report to {}", path.display());
                }
                None => println!("{json}"),
            }
            if !report.passed() {
                return Err(chainalloc_harness::HarnessError::Violations(
                    usize::try_from(report.violations).unwrap_or(usize::MAX),
                )
                .into());
            }
        }
        Command::Scenarios {
            filter,
            lifecycle,
            run_id,
            output,
        } => {
            let outcomes = scenarios::run_all(filter.as_deref());
            let failed = outcomes.iter().filter(|o| !o.passed).count();
            match output {
                Some(path) => {
                    let mut emitter = LogEmitter::to_file(&path, &run_id)?;
                    scenarios::emit(&mut emitter, &outcomes, lifecycle)?;
                    eprintln!("Wrote {} records to {}", emitter.emitted(), path.display());
                }
                None => {
                    let mut emitter = LogEmitter::new(std::io::stdout().lock(), &run_id);
                    scenarios::emit(&mut emitter, &outcomes, lifecycle)?;
                }
            }
            eprintln!(
                "{} scenarios, {} passed, {} failed",
                outcomes.len(),
                outcomes.len() - failed,
                failed
            );
            if failed > 0 {
                return Err(format!("{failed} scenario(s) failed").into());
            }
        }
        Command::List => {
            let mut out = std::io::stdout().lock();
            for name in scenarios::names() {
                writeln!(out, "{name}")?;
            }
        }
    }

    Ok(())
}
