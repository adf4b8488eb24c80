use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use spellscrape_core::config::{ImageTarget, Language, OutputSchema, RunConfig, RunOverrides};
use spellscrape_core::fetch::HttpFetcher;
use spellscrape_core::ingest::{IngestReport, run_ingest};
use spellscrape_core::rename::{RenameReport, rename_from_catalog_file};
use spellscrape_core::runtime::{
    PathOverrides, ResolutionContext, RuntimeLayout, normalize_for_display, resolve_runtime,
};
use tracing::{error, info};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

const DEFAULT_LOG_FILTER: &str = "spellscrape=info,spellscrape_core=info";

#[derive(Debug, Parser)]
#[command(
    name = "spellscrape",
    version,
    about = "Mirror the Waven spell catalog into a local folder tree"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    project_root: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH", help = "Root of the spell folder tree")]
    output_dir: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH", help = "Intermediate catalog JSON file")]
    catalog_file: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    log_file: Option<PathBuf>,
    #[arg(long, global = true, value_enum, help = "Language used for file and folder names")]
    lang: Option<LangArg>,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[arg(long, global = true, help = "Print the run report as JSON")]
    json: bool,
    #[command(flatten)]
    ingest: IngestArgs,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    project_root: Option<PathBuf>,
    output_dir: Option<PathBuf>,
    config: Option<PathBuf>,
    catalog_file: Option<PathBuf>,
    log_file: Option<PathBuf>,
    lang: Option<Language>,
    diagnostics: bool,
    json: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            project_root: cli.project_root.clone(),
            output_dir: cli.output_dir.clone(),
            config: cli.config.clone(),
            catalog_file: cli.catalog_file.clone(),
            log_file: cli.log_file.clone(),
            lang: cli.lang.map(Language::from),
            diagnostics: cli.diagnostics,
            json: cli.json,
        }
    }

    fn path_overrides(&self) -> PathOverrides {
        PathOverrides {
            project_root: self.project_root.clone(),
            output_dir: self.output_dir.clone(),
            config: self.config.clone(),
            catalog_file: self.catalog_file.clone(),
            log_file: self.log_file.clone(),
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Fetch the catalog and materialize records and images (default)")]
    Ingest,
    #[command(about = "Rename identifier folders to display names using the saved catalog")]
    Rename,
}

#[derive(Debug, Clone, Default, Args)]
struct IngestArgs {
    #[arg(long, global = true, value_enum, help = "Record file layout")]
    schema: Option<SchemaArg>,
    #[arg(long, global = true, value_enum, help = "Image format written next to each record")]
    target_format: Option<TargetArg>,
    #[arg(
        long,
        global = true,
        value_name = "N",
        help = "Records processed in parallel (1 = sequential)"
    )]
    workers: Option<usize>,
    #[arg(long, global = true, value_name = "SECS", help = "Per-request timeout")]
    timeout_secs: Option<u64>,
    #[arg(
        long,
        global = true,
        value_name = "SECS",
        help = "Wall-clock limit for all network activity"
    )]
    deadline_secs: Option<u64>,
    #[arg(long, global = true, value_name = "N", help = "Retries for transient fetch failures")]
    retries: Option<usize>,
    #[arg(long, global = true, overrides_with = "discard_failed_intermediates")]
    keep_failed_intermediates: bool,
    #[arg(long, global = true, overrides_with = "keep_failed_intermediates")]
    discard_failed_intermediates: bool,
    #[arg(long, global = true, help = "Write record files only")]
    skip_images: bool,
    #[arg(long, global = true, help = "Rename identifier folders to display names after ingestion")]
    rename_folders: bool,
}

impl IngestArgs {
    fn overrides(&self, lang: Option<Language>) -> RunOverrides {
        let keep_failed_intermediates = if self.discard_failed_intermediates {
            Some(false)
        } else if self.keep_failed_intermediates {
            Some(true)
        } else {
            None
        };
        RunOverrides {
            language: lang,
            schema: self.schema.map(OutputSchema::from),
            image_target: self.target_format.map(ImageTarget::from),
            workers: self.workers,
            timeout_ms: self.timeout_secs.map(|secs| secs.saturating_mul(1000)),
            retries: self.retries,
            deadline_secs: self.deadline_secs,
            keep_failed_intermediates,
            skip_images: self.skip_images,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LangArg {
    En,
    Fr,
    Es,
    De,
    Pt,
}

impl From<LangArg> for Language {
    fn from(value: LangArg) -> Self {
        match value {
            LangArg::En => Language::En,
            LangArg::Fr => Language::Fr,
            LangArg::Es => Language::Es,
            LangArg::De => Language::De,
            LangArg::Pt => Language::Pt,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SchemaArg {
    Raw,
    Normalized,
}

impl From<SchemaArg> for OutputSchema {
    fn from(value: SchemaArg) -> Self {
        match value {
            SchemaArg::Raw => OutputSchema::Raw,
            SchemaArg::Normalized => OutputSchema::Normalized,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TargetArg {
    Png,
    Jpeg,
}

impl From<TargetArg> for ImageTarget {
    fn from(value: TargetArg) -> Self {
        match value {
            TargetArg::Png => ImageTarget::Png,
            TargetArg::Jpeg => ImageTarget::Jpeg,
        }
    }
}

#[derive(Debug, Serialize)]
struct CommandOutput<'a> {
    command: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    ingest: Option<&'a IngestReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rename: Option<&'a RenameReport>,
}

fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    let runtime = RuntimeOptions::from_cli(&cli);

    match cli.command {
        Some(Commands::Ingest) | None => run_ingest_command(&runtime, &cli.ingest),
        Some(Commands::Rename) => run_rename_command(&runtime),
    }
}

fn run_ingest_command(runtime: &RuntimeOptions, args: &IngestArgs) -> Result<()> {
    let (layout, config) = resolve_run(runtime, &args.overrides(runtime.lang))?;
    init_logging(&layout.paths.log_path)?;
    info!(
        page_url = %config.page_url,
        output_root = %config.output_root.display(),
        language = %config.language,
        workers = config.workers,
        "starting ingestion"
    );

    let fetcher = HttpFetcher::new(config.http.clone())?;
    let report = run_ingest(&config, &fetcher).context("ingestion aborted")?;

    let rename = if args.rename_folders {
        match rename_from_catalog_file(&config.catalog_path, &config.output_root, config.language) {
            Ok(report) => Some(report),
            Err(failure) => {
                error!(%failure, "folder rename pass failed");
                None
            }
        }
    } else {
        None
    };

    if runtime.json {
        let output = CommandOutput {
            command: "ingest",
            ingest: Some(&report),
            rename: rename.as_ref(),
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("spellscrape ingest");
    println!("project_root: {}", normalize_for_display(&layout.paths.project_root));
    println!("output_root: {}", normalize_for_display(&config.output_root));
    println!("catalog_path: {}", normalize_for_display(&report.catalog_path));
    println!("log_path: {}", normalize_for_display(&layout.paths.log_path));
    println!("language: {}", config.language);
    println!("schema: {}", config.schema.as_str());
    println!("records_total: {}", report.total_records);
    println!("records_saved: {}", report.saved_records);
    println!("images_saved: {}", report.saved_images);
    println!("skipped: {}", report.skipped);
    println!("failed: {}", report.failed);
    println!("image_failures: {}", report.image_failures);
    println!("directories_created: {}", report.directories_created);
    println!("distinct_directories: {}", report.distinct_directories);
    println!("requests: {}", report.request_count);
    print_errors(&report.errors);
    if let Some(rename) = &rename {
        print_rename(rename);
    }
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", layout.paths.diagnostics());
        println!("{}", config.summary());
    }

    Ok(())
}

fn run_rename_command(runtime: &RuntimeOptions) -> Result<()> {
    let (layout, config) = resolve_run(runtime, &IngestArgs::default().overrides(runtime.lang))?;
    init_logging(&layout.paths.log_path)?;

    let report =
        rename_from_catalog_file(&config.catalog_path, &config.output_root, config.language)
            .context("folder rename failed")?;

    if runtime.json {
        let output = CommandOutput {
            command: "rename",
            ingest: None,
            rename: Some(&report),
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("spellscrape rename");
    println!("output_root: {}", normalize_for_display(&config.output_root));
    println!("catalog_path: {}", normalize_for_display(&config.catalog_path));
    println!("language: {}", config.language);
    print_rename(&report);
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", layout.paths.diagnostics());
    }

    Ok(())
}

/// Resolve paths and the run configuration. Touches nothing on disk apart
/// from reading the config file, so bad settings fail before any output.
fn resolve_run(
    runtime: &RuntimeOptions,
    overrides: &RunOverrides,
) -> Result<(RuntimeLayout, RunConfig)> {
    let context = ResolutionContext::from_process()?;
    let layout = resolve_runtime(&context, &runtime.path_overrides())?;
    let config = RunConfig::resolve(&layout.paths, &layout.config, overrides)
        .context("invalid configuration")?;
    Ok((layout, config))
}

/// Events go to stderr and, without ANSI colours, to a log file that is
/// truncated on every start.
fn init_logging(log_path: &Path) -> Result<()> {
    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let file = File::create(log_path)
        .with_context(|| format!("failed to open log file {}", log_path.display()))?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()))
        .with(fmt::layer().with_writer(io::stderr))
        .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        .init();
    Ok(())
}

fn print_errors(errors: &[String]) {
    if errors.is_empty() {
        return;
    }
    println!("errors:");
    for error in errors {
        println!("  - {error}");
    }
}

fn print_rename(report: &RenameReport) {
    println!("folders_scanned: {}", report.scanned);
    println!("folders_renamed: {}", report.renamed.len());
    for renamed in &report.renamed {
        println!(
            "  - {} -> {}",
            normalize_for_display(&renamed.from),
            normalize_for_display(&renamed.to)
        );
    }
    if !report.skipped.is_empty() {
        println!("folders_skipped:");
        for skipped in &report.skipped {
            println!(
                "  - {}: {}",
                normalize_for_display(&skipped.path),
                skipped.reason
            );
        }
    }
}
