//! Binary entry point for the penumbra administrative CLI.
#![forbid(unsafe_code)]

use std::error::Error;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use penumbra::admin::{
    checkpoint, free_space, header_report, AdminOpenOptions, CheckpointReport, FreeSpaceReport,
    HeaderReport,
};
use penumbra::primitives::pager::PageRange;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "penumbra",
    version,
    about = "Administrative CLI for penumbra database files",
    disable_help_subcommand = true
)]
struct Cli {
    #[command(flatten)]
    open: OpenArgs,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for structured responses"
    )]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct OpenArgs {
    #[arg(long, global = true, help = "Override buffer pool size (pages)")]
    cache_pages: Option<usize>,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(about = "Print the header at page 0 without opening the database")]
    Header {
        #[arg(value_name = "DB")]
        db_path: PathBuf,
    },

    #[command(about = "List free page runs of the last checkpoint")]
    FreeSpace {
        #[arg(value_name = "DB")]
        db_path: PathBuf,

        #[arg(long, default_value_t = 0, help = "Index of the first entry to print")]
        offset: usize,

        #[arg(long, default_value_t = 100, help = "Maximum number of entries to print")]
        limit: usize,
    },

    #[command(about = "Recover if needed, then checkpoint the database")]
    Checkpoint {
        #[arg(value_name = "DB")]
        db_path: PathBuf,
    },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

fn main() {
    init_tracing();
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let open_opts = build_open_options(&cli.open);

    match cli.command {
        Command::Header { db_path } => {
            let report = header_report(&db_path)?;
            emit(&cli.format, &report, || print_header_text(&report))?;
        }
        Command::FreeSpace {
            db_path,
            offset,
            limit,
        } => {
            let report = free_space(&db_path, &open_opts, offset, limit)?;
            emit(&cli.format, &report, || print_free_space_text(&report))?;
        }
        Command::Checkpoint { db_path } => {
            let report = checkpoint(&db_path, &open_opts)?;
            emit(&cli.format, &report, || print_checkpoint_text(&report))?;
        }
    }
    Ok(())
}

fn build_open_options(args: &OpenArgs) -> AdminOpenOptions {
    let mut opts = AdminOpenOptions::default();
    if let Some(pages) = args.cache_pages {
        opts.buffer_pool_pages = pages;
    }
    opts
}

fn emit<T, F>(format: &OutputFormat, value: &T, printer: F) -> Result<(), Box<dyn Error>>
where
    T: serde::Serialize,
    F: Fn(),
{
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{json}");
        }
        OutputFormat::Text => printer(),
    }
    Ok(())
}

fn print_header_text(report: &HeaderReport) {
    println!(
        "File: path={} size={} pages={} page_size={}",
        report.path, report.file_size_bytes, report.num_pages, report.page_size
    );
    match &report.header {
        Some(header) => {
            println!("Header: storage_version={}", header.storage_version);
            println!("  catalog={}", header.catalog_page_range);
            println!("  metadata={}", header.metadata_page_range);
        }
        None => println!("Header: none (no checkpoint yet)"),
    }
    println!(
        "WAL: records={} pending_shadow_replay={} shadow_exists={}",
        report.wal_records, report.pending_shadow_replay, report.shadow_exists
    );
}

fn print_free_space_text(report: &FreeSpaceReport) {
    println!(
        "Free space: entries={} pages={} pending={}",
        report.total_entries, report.total_free_pages, report.pending_entries
    );
    for (idx, entry) in report.entries.iter().enumerate() {
        let range = PageRange::new(entry.start_page_idx, entry.num_pages);
        println!("  #{} {}", report.offset + idx, range);
    }
}

fn print_checkpoint_text(report: &CheckpointReport) {
    println!(
        "Checkpoint completed in {:.2} ms (recovery={:?} catalog_written={} metadata_written={} shadow_pages={})",
        report.duration_ms,
        report.recovery,
        report.catalog_written,
        report.metadata_written,
        report.shadow_pages
    );
    println!(
        "  catalog={} metadata={}",
        report.header.catalog_page_range, report.header.metadata_page_range
    );
}
