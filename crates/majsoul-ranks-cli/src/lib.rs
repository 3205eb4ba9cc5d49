//! Command surfaces for the `majsoul-fetch` and `majsoul-analyze` binaries.
//!
//! Both binaries parse with clap, open and migrate the store, then hand off to
//! [`run_fetch`] or [`run_analyze`]. Errors bubble up as `anyhow::Error` and are
//! rendered by the binary as `Error: ...` with exit code 1.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use majsoul_ranks_core::{now_ms, trailing_window_ms, LevelBin, Mode, RanksError};
use majsoul_ranks_fetch::{ApiConfig, FetchPlan, HttpGameSource, PaginationEngine, StopReason};
use majsoul_ranks_store_sqlite::report::{
    correlate_levels, export_records, head_to_head, summarize_by_rank, summarize_head_to_head,
    CompareAllRow, HeadToHead, ReportFilter, COMPARE_ALL_HEADER, COMPARISON_HEADER,
    CORRELATION_HEADER, EXPORT_HEADER, INSTANCE_HEADER, SUMMARY_HEADER,
};
use majsoul_ranks_store_sqlite::SqliteGameStore;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Trailing window used when `--start-ms` or `--end-ms` is omitted.
pub const DEFAULT_WINDOW_DAYS: i64 = 30;

pub const EXIT_INVALID_WINDOW: u8 = 2;
pub const EXIT_INTERRUPTED: u8 = 130;

const NO_ROWS: &str = "No rows match the filter.";
const NO_INSTANCES: &str = "No head-to-head instances found for the provided levels and filters.";

fn parse_mode(raw: &str) -> Result<Mode, RanksError> {
    Mode::parse(raw)
}

#[derive(Debug, Parser)]
#[command(name = "majsoul-fetch")]
#[command(about = "Fetch Mahjong Soul four-player game records into SQLite")]
pub struct FetchCli {
    /// Game mode: 9 Gold South, 12 Jade South, 16 Throne South.
    #[arg(long, default_value = "12", value_parser = parse_mode)]
    pub mode: Mode,
    /// Oldest bound of the window in epoch milliseconds (default: 30 days ago).
    #[arg(long)]
    pub start_ms: Option<i64>,
    /// Newest bound of the window in epoch milliseconds (default: now).
    #[arg(long)]
    pub end_ms: Option<i64>,
    #[arg(long, default_value = "games.sqlite")]
    pub db: PathBuf,
    /// Records requested per page.
    #[arg(long, default_value_t = 100_000)]
    pub limit: usize,
    /// Seconds to wait between pages.
    #[arg(long, default_value_t = 0.5)]
    pub sleep: f64,
    /// Stop after this many pages (0 = unlimited).
    #[arg(long, default_value_t = 0)]
    pub max_pages: usize,
    /// Stop after inserting this many new games, ignoring --start-ms (0 = off).
    #[arg(long, default_value_t = 0)]
    pub recent: usize,
    #[arg(long)]
    pub verbose: bool,
}

#[derive(Debug, Parser)]
#[command(name = "majsoul-analyze")]
#[command(about = "Reports over stored Mahjong Soul game records")]
pub struct AnalyzeCli {
    #[arg(long, global = true, default_value = "games.sqlite")]
    pub db: PathBuf,
    /// Only games of this mode (9, 12 or 16).
    #[arg(long, global = true, value_parser = parse_mode)]
    pub mode: Option<Mode>,
    #[arg(long, global = true)]
    pub start_ms: Option<i64>,
    #[arg(long, global = true)]
    pub end_ms: Option<i64>,
    #[arg(long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: AnalyzeCommand,
}

#[derive(Debug, Subcommand)]
pub enum AnalyzeCommand {
    /// Count, share and averages per placement.
    Summary,
    /// One CSV row per player per game.
    Export(ExportArgs),
    /// Placement distribution per level bucket.
    RankCorrelation(RankCorrelationArgs),
    /// Head-to-head results between two level buckets.
    CompareLevels(CompareLevelsArgs),
    /// Head-to-head summaries over the preset level sweeps.
    CompareAll(CompareAllArgs),
}

#[derive(Debug, Args)]
pub struct ExportArgs {
    #[arg(long)]
    pub csv: PathBuf,
}

#[derive(Debug, Args)]
pub struct RankCorrelationArgs {
    #[arg(long, value_enum, default_value_t = LevelBinArg::Level)]
    pub level_bin: LevelBinArg,
}

#[derive(Debug, Args)]
pub struct CompareLevelsArgs {
    #[arg(long)]
    pub level_a: i64,
    #[arg(long)]
    pub level_b: i64,
    #[arg(long, value_enum, default_value_t = LevelBinArg::Level)]
    pub level_bin: LevelBinArg,
    /// Also write every instance to this CSV file.
    #[arg(long)]
    pub csv: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct CompareAllArgs {
    #[arg(long)]
    pub csv: PathBuf,
    #[arg(long, value_enum, default_value_t = LevelBinArg::Level)]
    pub level_bin: LevelBinArg,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LevelBinArg {
    Level,
    Level10,
}

fn map_level_bin(value: LevelBinArg) -> LevelBin {
    match value {
        LevelBinArg::Level => LevelBin::Exact,
        LevelBinArg::Level10 => LevelBin::Tens,
    }
}

/// Installs the stderr subscriber. `RUST_LOG` wins over `--verbose` when set.
pub fn init_logging(verbose: bool) {
    let level = if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .try_init();
}

/// Resolves the fetch window in milliseconds.
///
/// With `recent` set the start is 0 and a missing end becomes `now_ms`;
/// otherwise each missing side falls back to the trailing default window.
#[must_use]
pub fn resolve_window(
    start_ms: Option<i64>,
    end_ms: Option<i64>,
    recent: bool,
    default_window: (i64, i64),
) -> (i64, i64) {
    let (default_start, default_end) = default_window;
    if recent {
        (0, end_ms.unwrap_or(default_end))
    } else {
        (start_ms.unwrap_or(default_start), end_ms.unwrap_or(default_end))
    }
}

/// Runs one fetch and returns the process exit code.
///
/// # Errors
/// Returns an error when the store cannot be opened or migrated, the Ctrl-C
/// handler cannot be installed, or a page cannot be committed.
pub fn run_fetch(cli: &FetchCli) -> Result<ExitCode> {
    let recent = cli.recent > 0;
    let default_window = if recent {
        (0, now_ms())
    } else {
        trailing_window_ms(DEFAULT_WINDOW_DAYS)
    };
    let (start_ms, end_ms) = resolve_window(cli.start_ms, cli.end_ms, recent, default_window);
    if recent {
        tracing::debug!(start_ms, end_ms, "recent mode ignores --start-ms");
    } else if cli.start_ms.is_none() || cli.end_ms.is_none() {
        tracing::info!(start_ms, end_ms, "using default {DEFAULT_WINDOW_DAYS}d window for missing bounds");
    }

    if end_ms < start_ms {
        tracing::error!(start_ms, end_ms, "end-ms must be >= start-ms");
        return Ok(ExitCode::from(EXIT_INVALID_WINDOW));
    }

    let delay = Duration::try_from_secs_f64(cli.sleep.max(0.0))
        .with_context(|| format!("invalid --sleep value {}", cli.sleep))?;
    let plan = FetchPlan {
        start_ms,
        end_ms,
        mode: cli.mode,
        limit: cli.limit,
        target: recent.then_some(cli.recent),
        max_pages: (cli.max_pages > 0).then_some(cli.max_pages),
        delay,
    };

    let interrupt = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&interrupt);
    ctrlc::set_handler(move || {
        tracing::warn!("Ctrl-C received, stopping after the current step");
        handler_flag.store(true, Ordering::SeqCst);
    })
    .context("failed to install Ctrl-C handler")?;

    let mut store = SqliteGameStore::open(&cli.db)?;
    store.migrate()?;

    let source = HttpGameSource::new(ApiConfig::from_env());
    let report = PaginationEngine::new(&source)
        .with_interrupt(interrupt)
        .run(&mut store, &plan)?;

    tracing::info!(
        stop = report.stop.as_str(),
        duplicates = report.duplicates,
        rejected = report.rejected,
        failed = report.failed,
        "fetch finished"
    );
    println!(
        "Done. Pages: {}, total inserted: {}",
        report.pages, report.inserted
    );

    if report.stop == StopReason::Interrupted {
        println!("Interrupted by user.");
        return Ok(ExitCode::from(EXIT_INTERRUPTED));
    }
    Ok(ExitCode::SUCCESS)
}

/// Executes one analysis subcommand.
///
/// # Errors
/// Returns an error when the store cannot be opened, a query fails, an output
/// file cannot be written, or `compare-levels` is given the same level twice.
pub fn run_analyze(cli: &AnalyzeCli) -> Result<()> {
    let filter = ReportFilter {
        mode: cli.mode,
        start_ms: cli.start_ms,
        end_ms: cli.end_ms,
    };

    let mut store = SqliteGameStore::open_existing(&cli.db)?;
    store.migrate()?;

    let mut stdout = std::io::stdout().lock();
    run_report(&cli.command, &store, &filter, &mut stdout)
}

/// Runs a report against an open store, writing the console part to `out`.
///
/// # Errors
/// Returns an error when a query fails or an output file cannot be written.
pub fn run_report(
    command: &AnalyzeCommand,
    store: &SqliteGameStore,
    filter: &ReportFilter,
    out: &mut impl Write,
) -> Result<()> {
    match command {
        AnalyzeCommand::Summary => {
            let rows = summarize_by_rank(&store.load_games(filter)?);
            if rows.is_empty() {
                writeln!(out, "{NO_ROWS}")?;
                return Ok(());
            }
            writeln!(out, "{SUMMARY_HEADER}")?;
            for row in &rows {
                writeln!(out, "{}", row.csv_record())?;
            }
        }
        AnalyzeCommand::Export(args) => {
            let games = store.load_games(filter)?;
            write_csv(
                &args.csv,
                EXPORT_HEADER,
                games.iter().flat_map(export_records),
            )?;
            tracing::info!(games = games.len(), path = %args.csv.display(), "exported games");
        }
        AnalyzeCommand::RankCorrelation(args) => {
            let rows = correlate_levels(&store.load_games(filter)?, map_level_bin(args.level_bin));
            if rows.is_empty() {
                writeln!(out, "{NO_ROWS}")?;
                return Ok(());
            }
            writeln!(out, "{CORRELATION_HEADER}")?;
            for row in &rows {
                writeln!(out, "{}", row.csv_record())?;
            }
        }
        AnalyzeCommand::CompareLevels(args) => {
            if args.level_a == args.level_b {
                return Err(anyhow!("--level-a and --level-b must be different"));
            }
            let games = store.load_games(filter)?;
            let instances = head_to_head(
                &games,
                map_level_bin(args.level_bin),
                args.level_a,
                args.level_b,
            );
            if let Some(path) = &args.csv {
                write_csv(path, INSTANCE_HEADER, instances.iter().map(HeadToHead::csv_record))?;
                tracing::info!(instances = instances.len(), path = %path.display(), "wrote instances");
            }

            let Some(summary) = summarize_head_to_head(args.level_a, args.level_b, &instances)
            else {
                writeln!(out, "{NO_INSTANCES}")?;
                return Ok(());
            };
            writeln!(out, "{COMPARISON_HEADER}")?;
            writeln!(out, "{}", summary.csv_record())?;
        }
        AnalyzeCommand::CompareAll(args) => {
            let rows = store.compare_all(filter, map_level_bin(args.level_bin))?;
            write_csv(&args.csv, COMPARE_ALL_HEADER, rows.iter().map(CompareAllRow::csv_record))?;
            tracing::info!(rows = rows.len(), path = %args.csv.display(), "wrote comparisons");
        }
    }
    Ok(())
}

fn write_csv(path: &Path, header: &str, records: impl IntoIterator<Item = String>) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    writeln!(writer, "{header}")?;
    for record in records {
        writeln!(writer, "{record}")?;
    }
    writer
        .flush()
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}
