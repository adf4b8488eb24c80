//! Batch orchestration: page fetch, catalog extraction, then one pass over every
//! record with per-record failure isolation.

use std::path::{Path, PathBuf};

use image::ImageFormat;
use rayon::prelude::*;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::catalog::{CatalogPayload, Record, extract_catalog};
use crate::config::RunConfig;
use crate::error::{ErrorKind, FailurePolicy, IngestError};
use crate::fetch::{AssetFetcher, FetchBudget, fetch_with_retry};
use crate::layout::LayoutResolver;
use crate::persist::{
    persist_record, remove_if_exists, sanitize_display_name, write_bytes, write_catalog_file,
};
use crate::transcode::{TranscodeOptions, transcode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    /// Record file and image both written (or images disabled).
    Complete,
    /// Record file written, image step failed.
    ImageFailed,
    /// No display name in the selected language.
    Skipped,
    /// Nothing written for this record.
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordOutcome {
    pub index: usize,
    pub identity: String,
    pub status: RecordStatus,
    pub record_file: Option<PathBuf>,
    pub image_file: Option<PathBuf>,
    pub created_directory: bool,
    pub error_kind: Option<ErrorKind>,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub success: bool,
    pub total_records: usize,
    pub saved_records: usize,
    pub saved_images: usize,
    pub skipped: usize,
    pub failed: usize,
    pub image_failures: usize,
    pub directories_created: usize,
    pub distinct_directories: usize,
    pub classifiers: usize,
    pub request_count: usize,
    pub catalog_path: PathBuf,
    pub errors: Vec<String>,
    pub records: Vec<RecordOutcome>,
}

struct IngestContext<'a, F: AssetFetcher + ?Sized> {
    config: &'a RunConfig,
    fetcher: &'a F,
    budget: &'a FetchBudget,
    layout: &'a LayoutResolver,
    transcode: TranscodeOptions,
}

pub fn run_ingest<F: AssetFetcher + ?Sized>(
    config: &RunConfig,
    fetcher: &F,
) -> Result<IngestReport, IngestError> {
    let budget = FetchBudget::with_deadline(config.deadline);
    run_ingest_with_budget(config, fetcher, &budget)
}

/// Full ingestion run. Returns `Err` only for run-aborting failures: page fetch,
/// catalog extraction, catalog file write, or invalid configuration. Everything
/// that goes wrong for a single record is logged and recorded in the report.
pub fn run_ingest_with_budget<F: AssetFetcher + ?Sized>(
    config: &RunConfig,
    fetcher: &F,
    budget: &FetchBudget,
) -> Result<IngestReport, IngestError> {
    let source = source_format(&config.image_source_ext)?;

    let page = fetch_with_retry(fetcher, &config.page_url, budget, &config.http).inspect_err(
        |error| error!(url = %config.page_url, %error, "catalog page fetch failed"),
    )?;
    info!(url = %config.page_url, bytes = page.bytes.len(), "fetched catalog page");

    let catalog = extract_catalog(
        &page.text(),
        &config.container_selector,
        &config.payload_attribute,
    )
    .inspect_err(|error| error!(%error, "catalog extraction failed"))?;
    info!(
        records = catalog.records.len(),
        classifiers = catalog.classifiers.len(),
        "extracted catalog"
    );

    write_catalog_file(&catalog.document, &config.catalog_path)
        .inspect_err(|error| error!(%error, "failed to save catalog file"))?;
    info!(path = %config.catalog_path.display(), "saved catalog file");

    let layout = LayoutResolver::new(&config.output_root);
    let context = IngestContext {
        config,
        fetcher,
        budget,
        layout: &layout,
        transcode: TranscodeOptions {
            source,
            target: config.image_target.format(),
            background: config.background,
        },
    };

    let outcomes = process_records(&context, &catalog)?;
    let mut report = summarize(&catalog, outcomes, &config.catalog_path);
    report.distinct_directories = layout.resolved_count();
    report.request_count = fetcher.request_count();
    info!(
        saved_records = report.saved_records,
        saved_images = report.saved_images,
        skipped = report.skipped,
        failed = report.failed,
        image_failures = report.image_failures,
        "ingestion finished"
    );
    Ok(report)
}

fn process_records<F: AssetFetcher + ?Sized>(
    context: &IngestContext<'_, F>,
    catalog: &CatalogPayload,
) -> Result<Vec<RecordOutcome>, IngestError> {
    let outcomes: Vec<Result<RecordOutcome, IngestError>> = if context.config.workers <= 1 {
        catalog
            .records
            .iter()
            .enumerate()
            .map(|(index, record)| process_record(context, index, record))
            .collect()
    } else {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(context.config.workers)
            .thread_name(|index| format!("spellscrape-worker-{index}"))
            .build()
            .map_err(|error| {
                IngestError::Config(format!("failed to start worker pool: {error}"))
            })?;
        pool.install(|| {
            catalog
                .records
                .par_iter()
                .enumerate()
                .map(|(index, record)| process_record(context, index, record))
                .collect()
        })
    };
    outcomes.into_iter().collect()
}

/// Process one record. Per-record failures become a `Failed`/`ImageFailed`
/// outcome; only kinds whose policy is `AbortRun` escape as `Err`.
fn process_record<F: AssetFetcher + ?Sized>(
    context: &IngestContext<'_, F>,
    index: usize,
    record: &Record,
) -> Result<RecordOutcome, IngestError> {
    let identity = record.identity();
    let mut outcome = RecordOutcome {
        index,
        identity: identity.clone(),
        status: RecordStatus::Failed,
        record_file: None,
        image_file: None,
        created_directory: false,
        error_kind: None,
        detail: None,
    };
    info!(index, record = %identity, "processing record");

    let language = context.config.language;
    let Some(display_name) = record.display_name(language) else {
        warn!(index, record = %identity, %language, "skipping record without a display name");
        outcome.status = RecordStatus::Skipped;
        outcome.detail = Some(format!("missing `{}`", language.name_key()));
        return Ok(outcome);
    };

    let dir = match save_record(context, record, display_name, &mut outcome) {
        Ok(dir) => dir,
        Err(failure) => return absorb(failure, outcome, "record"),
    };

    if !context.config.download_images {
        outcome.status = RecordStatus::Complete;
        return Ok(outcome);
    }
    match save_image(context, record, &dir, display_name) {
        Ok(path) => {
            info!(index, record = %identity, path = %path.display(), "saved image");
            outcome.image_file = Some(path);
            outcome.status = RecordStatus::Complete;
            Ok(outcome)
        }
        Err(failure) => {
            outcome.status = RecordStatus::ImageFailed;
            absorb(failure, outcome, "image")
        }
    }
}

fn save_record<F: AssetFetcher + ?Sized>(
    context: &IngestContext<'_, F>,
    record: &Record,
    display_name: &str,
    outcome: &mut RecordOutcome,
) -> Result<PathBuf, IngestError> {
    let family = record.family()?;
    let weapon = record.weapon()?;
    let resolved = context.layout.resolve(&family, weapon.as_ref())?;
    outcome.created_directory = resolved.created;

    let path = persist_record(record, context.config.schema, &resolved.path, display_name)?;
    info!(
        index = outcome.index,
        record = %outcome.identity,
        path = %path.display(),
        "saved record"
    );
    outcome.record_file = Some(path);
    Ok(resolved.path)
}

/// Fetch the source image, keep it on disk as the intermediate file while
/// transcoding, write the target file and drop the intermediate.
fn save_image<F: AssetFetcher + ?Sized>(
    context: &IngestContext<'_, F>,
    record: &Record,
    dir: &Path,
    display_name: &str,
) -> Result<PathBuf, IngestError> {
    let config = context.config;
    let image_id = record.image_id()?;
    let url = config.image_url(&image_id);
    let asset = fetch_with_retry(context.fetcher, &url, context.budget, &config.http)?;

    let stem = sanitize_display_name(display_name);
    let intermediate = dir.join(format!("{stem}.{}", config.image_source_ext));
    let target = dir.join(format!("{stem}.{}", config.image_target.extension()));
    // Same path when the source extension already names the target format.
    let distinct = intermediate != target;
    write_bytes(&intermediate, &asset.bytes)?;

    let written = transcode(&asset.bytes, &context.transcode)
        .and_then(|image| write_bytes(&target, &image.bytes));
    match written {
        Ok(()) => {
            if distinct {
                remove_if_exists(&intermediate)?;
            }
            Ok(target)
        }
        Err(failure) => {
            if distinct
                && !config.keep_failed_intermediates
                && let Err(cleanup) = remove_if_exists(&intermediate)
            {
                warn!(%cleanup, "failed to remove intermediate image");
            }
            Err(failure)
        }
    }
}

fn absorb(
    failure: IngestError,
    mut outcome: RecordOutcome,
    stage: &str,
) -> Result<RecordOutcome, IngestError> {
    let kind = failure.kind();
    if kind.policy() == FailurePolicy::AbortRun {
        return Err(failure);
    }
    error!(
        index = outcome.index,
        record = %outcome.identity,
        stage,
        kind = kind.as_str(),
        error = %failure,
        "record failed"
    );
    outcome.error_kind = Some(kind);
    outcome.detail = Some(format!("{stage}: {failure}"));
    Ok(outcome)
}

fn summarize(
    catalog: &CatalogPayload,
    outcomes: Vec<RecordOutcome>,
    catalog_path: &Path,
) -> IngestReport {
    let mut report = IngestReport {
        success: true,
        total_records: catalog.records.len(),
        saved_records: 0,
        saved_images: 0,
        skipped: 0,
        failed: 0,
        image_failures: 0,
        directories_created: 0,
        distinct_directories: 0,
        classifiers: catalog.classifiers.len(),
        request_count: 0,
        catalog_path: catalog_path.to_path_buf(),
        errors: Vec::new(),
        records: Vec::with_capacity(outcomes.len()),
    };
    for outcome in outcomes {
        if outcome.record_file.is_some() {
            report.saved_records += 1;
        }
        if outcome.image_file.is_some() {
            report.saved_images += 1;
        }
        if outcome.created_directory {
            report.directories_created += 1;
        }
        match outcome.status {
            RecordStatus::Complete => {}
            RecordStatus::ImageFailed => report.image_failures += 1,
            RecordStatus::Skipped => report.skipped += 1,
            RecordStatus::Failed => report.failed += 1,
        }
        if let Some(detail) = &outcome.detail
            && outcome.error_kind.is_some()
        {
            report.errors.push(format!("{}: {detail}", outcome.identity));
        }
        report.records.push(outcome);
    }
    report.success = report.errors.is_empty();
    report
}

fn source_format(extension: &str) -> Result<ImageFormat, IngestError> {
    let last = extension.rsplit('.').next().unwrap_or(extension);
    ImageFormat::from_extension(last).ok_or_else(|| {
        IngestError::Config(format!("unknown source image extension: {extension}"))
    })
}
