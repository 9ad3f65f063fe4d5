use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::discover::{self, MetadataOverrides};
use crate::epub::{CoverImage, EpubPackager, Packager};
use crate::error::PackagingError;
use crate::fetch::{FetchEngine, FetchPolicy};
use crate::formats::{DownloadStatus, SeriesMetadata};
use crate::plan::{self, Volume};
use crate::process::{self, ChapterCleaner, Normalizer, SkippedUnit};
use crate::slug;
use crate::status_store::StatusStore;
use crate::walker::{ChainWalker, UnitFailure, WalkOutcome};
use crate::workspace::{self, Workspace};

/// Inputs naming a series to acquire.
#[derive(Debug, Clone)]
pub struct SeriesRequest {
    /// Series overview page or any unit page.
    pub source_url: Url,
    /// Authoritative first unit, replacing whatever discovery finds.
    pub start_unit_url: Option<Url>,
    pub slug: Option<String>,
    pub overrides: MetadataOverrides,
    pub refresh_tail: bool,
}

impl SeriesRequest {
    pub fn new(source_url: Url) -> Self {
        Self {
            source_url,
            start_unit_url: None,
            slug: None,
            overrides: MetadataOverrides::default(),
            refresh_tail: false,
        }
    }

    /// Explicit slug if given, else derived from the source URL.
    pub fn resolve_slug(&self) -> anyhow::Result<String> {
        match &self.slug {
            Some(explicit) => validate_slug(explicit),
            None => Ok(slug::slug_from_url(&self.source_url)),
        }
    }
}

pub fn validate_slug(candidate: &str) -> anyhow::Result<String> {
    let sanitized = slug::sanitize_slug(candidate);
    if sanitized.is_empty() || sanitized != candidate {
        anyhow::bail!("invalid series slug '{candidate}' (use lowercase letters, digits, '-' and '_')");
    }
    Ok(sanitized)
}

#[derive(Debug, Clone)]
pub struct AssembleOptions {
    /// 0 packs everything into one volume.
    pub units_per_volume: usize,
    pub keep_intermediates: bool,
    pub overrides: MetadataOverrides,
}

impl Default for AssembleOptions {
    fn default() -> Self {
        Self {
            units_per_volume: 50,
            keep_intermediates: true,
            overrides: MetadataOverrides::default(),
        }
    }
}

/// Counts for every stage that ran. Printed even when a stage failed.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub slug: String,
    pub walk_outcome: Option<WalkOutcome>,
    pub fetched: usize,
    pub adopted: usize,
    pub failed: usize,
    pub processed: usize,
    pub skipped: usize,
    pub volumes_written: usize,
    pub volumes: Vec<PathBuf>,
    pub cleaned_up: bool,
    /// Fetched positions left out of this assembly (e.g. skipped by
    /// processing). Their intermediates are kept for a later run.
    pub unpackaged: Vec<u64>,
    pub unit_failures: Vec<UnitFailure>,
    pub skipped_units: Vec<SkippedUnit>,
    pub cancelled: bool,
    pub failure: Option<String>,
}

impl PipelineReport {
    fn new(slug: &str) -> Self {
        Self {
            slug: slug.to_owned(),
            walk_outcome: None,
            fetched: 0,
            adopted: 0,
            failed: 0,
            processed: 0,
            skipped: 0,
            volumes_written: 0,
            volumes: Vec::new(),
            cleaned_up: false,
            unpackaged: Vec::new(),
            unit_failures: Vec::new(),
            skipped_units: Vec::new(),
            cancelled: false,
            failure: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }

    /// Keeps the counts gathered so far and records why the run stopped.
    fn fail_stage(&mut self, stage: &str, err: anyhow::Error) {
        tracing::error!(slug = %self.slug, stage, err = %format!("{err:#}"), "stage failed");
        self.failure = Some(format!("{stage}: {err:#}"));
    }
}

impl fmt::Display for PipelineReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "series: {}", self.slug)?;
        if let Some(outcome) = self.walk_outcome {
            writeln!(f, "walk: {outcome:?}")?;
        }
        writeln!(
            f,
            "fetched: {} (adopted {}), failed: {}, processed: {}, skipped: {}, volumes written: {}",
            self.fetched,
            self.adopted,
            self.failed,
            self.processed,
            self.skipped,
            self.volumes_written
        )?;
        for failure in &self.unit_failures {
            writeln!(
                f,
                "  failed unit {} ({}): {}",
                failure.position, failure.url, failure.reason
            )?;
        }
        for skipped in &self.skipped_units {
            writeln!(
                f,
                "  skipped unit {} ({}): {}",
                skipped.position, skipped.url, skipped.reason
            )?;
        }
        for volume in &self.volumes {
            writeln!(f, "volume: {}", volume.display())?;
        }
        if self.cleaned_up {
            writeln!(f, "intermediates removed")?;
        }
        if !self.unpackaged.is_empty() {
            writeln!(
                f,
                "intermediates kept: units {:?} are not packaged yet",
                self.unpackaged
            )?;
        }
        if self.cancelled {
            writeln!(f, "cancelled; state saved for resume")?;
        }
        if let Some(failure) = &self.failure {
            writeln!(f, "failure: {failure}")?;
        }
        Ok(())
    }
}

/// Sequences discovery, the fetch walk, processing and packaging for one
/// series at a time. Every operation takes the series lock first.
pub struct Pipeline {
    workspace: Workspace,
    policy: FetchPolicy,
    normalizer: Arc<dyn Normalizer>,
    packager: Option<Arc<dyn Packager>>,
    cancel: CancellationToken,
    lang: String,
}

impl Pipeline {
    pub fn new(workspace: Workspace, policy: FetchPolicy) -> Self {
        Self {
            workspace,
            policy,
            normalizer: Arc::new(ChapterCleaner::default()),
            packager: None,
            cancel: CancellationToken::new(),
            lang: "en".to_owned(),
        }
    }

    /// Replaces the default EPUB writer (which also fetches the cover).
    pub fn with_packager(mut self, packager: Arc<dyn Packager>) -> Self {
        self.packager = Some(packager);
        self
    }

    pub fn with_normalizer(mut self, normalizer: Arc<dyn Normalizer>) -> Self {
        self.normalizer = normalizer;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_language(mut self, lang: impl Into<String>) -> Self {
        self.lang = lang.into();
        self.normalizer = Arc::new(ChapterCleaner::new(self.lang.clone()));
        self
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub async fn discover_and_fetch(&self, request: &SeriesRequest) -> anyhow::Result<PipelineReport> {
        let slug = request.resolve_slug()?;
        let _lock = self.workspace.lock_series(&slug)?;
        let mut report = PipelineReport::new(&slug);
        self.fetch_stage(&slug, request, &mut report).await?;
        Ok(report)
    }

    pub fn process(&self, slug: &str) -> anyhow::Result<PipelineReport> {
        let slug = validate_slug(slug)?;
        let _lock = self.workspace.lock_series(&slug)?;
        let mut report = PipelineReport::new(&slug);
        self.process_stage(&slug, &mut report)?;
        Ok(report)
    }

    pub async fn assemble(&self, slug: &str, options: &AssembleOptions) -> anyhow::Result<PipelineReport> {
        let slug = validate_slug(slug)?;
        let _lock = self.workspace.lock_series(&slug)?;
        let mut report = PipelineReport::new(&slug);
        self.assemble_stage(&slug, options, &mut report).await?;
        Ok(report)
    }

    /// Discovery, walk, processing and packaging under one lock.
    /// Intermediates are removed only when every volume was written, every
    /// fetched unit made it into a volume, and `options.keep_intermediates`
    /// is false. A processing or packaging error is reported in
    /// `PipelineReport::failure` together with the counts gathered so far.
    pub async fn run_full(
        &self,
        request: &SeriesRequest,
        options: &AssembleOptions,
    ) -> anyhow::Result<PipelineReport> {
        let slug = request.resolve_slug()?;
        let _lock = self.workspace.lock_series(&slug)?;
        let mut report = PipelineReport::new(&slug);

        tracing::info!(%slug, "full-process: download");
        self.fetch_stage(&slug, request, &mut report)
            .await
            .context("download")?;
        if report.cancelled {
            return Ok(report);
        }

        tracing::info!(%slug, "full-process: process");
        if let Err(err) = self.process_stage_blocking(&slug, &mut report).await {
            report.fail_stage("process", err);
            return Ok(report);
        }
        if report.cancelled {
            return Ok(report);
        }

        tracing::info!(%slug, "full-process: assemble");
        let mut options = options.clone();
        options.overrides = MetadataOverrides::default();
        if let Err(err) = self.assemble_stage(&slug, &options, &mut report).await {
            report.fail_stage("assemble", err);
        }
        Ok(report)
    }

    /// The persisted download state, read without taking the lock.
    pub fn status(&self, slug: &str) -> anyhow::Result<DownloadStatus> {
        let slug = validate_slug(slug)?;
        StatusStore::new(self.workspace.clone()).load(&slug)
    }

    async fn fetch_stage(
        &self,
        slug: &str,
        request: &SeriesRequest,
        report: &mut PipelineReport,
    ) -> anyhow::Result<()> {
        let store = StatusStore::new(self.workspace.clone());
        let mut status = store.load(slug).context("load download status")?;
        let mut engine = FetchEngine::new(self.policy.clone(), self.cancel.clone())?;

        let fresh = status.units.is_empty() && status.cursor.next_url.is_none();
        if fresh || status.series.title.is_none() || request.start_unit_url.is_some() {
            let discovery = discover::discover(
                &engine,
                &request.source_url,
                request.start_unit_url.as_ref(),
            )
            .await
            .context("discover series")?;
            status.series.fill_missing_from(&discovery.metadata);

            match (&request.start_unit_url, discovery.first_unit_url) {
                (Some(start), _) => store.apply_start_override(&mut status, start.as_str())?,
                (None, Some(first)) if fresh => store.apply_start_override(&mut status, first.as_str())?,
                (None, None) if fresh => anyhow::bail!(
                    "no unit link found at {}; pass a unit URL or --start-unit-url",
                    request.source_url
                ),
                _ => {}
            }
        } else {
            tracing::info!(slug, cursor = ?status.cursor.next_url, "resuming from recorded cursor");
        }

        if status.series.title.is_none() {
            status.series.title = Some(slug::title_from_slug(slug));
        }
        request.overrides.apply(&mut status.series);
        store.save(&mut status).context("save series metadata")?;

        let mut walker = ChainWalker::new(&self.workspace, &store, &mut engine, self.cancel.clone())
            .with_tail_refresh(request.refresh_tail);
        let walk = walker.run(&mut status).await.context("walk chain")?;

        report.walk_outcome = Some(walk.outcome);
        report.fetched += walk.fetched;
        report.adopted += walk.adopted;
        report.failed += walk.failed;
        report.unit_failures.extend(walk.failures);
        report.cancelled |= walk.outcome == WalkOutcome::Cancelled;
        Ok(())
    }

    fn process_stage(&self, slug: &str, report: &mut PipelineReport) -> anyhow::Result<()> {
        let processed =
            process::process_pending(&self.workspace, slug, self.normalizer.as_ref(), &self.cancel)?;
        absorb_processing(report, processed);
        Ok(())
    }

    /// Same as `process_stage`, off the async worker threads.
    async fn process_stage_blocking(
        &self,
        slug: &str,
        report: &mut PipelineReport,
    ) -> anyhow::Result<()> {
        let workspace = self.workspace.clone();
        let normalizer = self.normalizer.clone();
        let cancel = self.cancel.clone();
        let slug = slug.to_owned();
        let processed = tokio::task::spawn_blocking(move || {
            process::process_pending(&workspace, &slug, normalizer.as_ref(), &cancel)
        })
        .await
        .context("processing task")??;
        absorb_processing(report, processed);
        Ok(())
    }

    async fn assemble_stage(
        &self,
        slug: &str,
        options: &AssembleOptions,
        report: &mut PipelineReport,
    ) -> anyhow::Result<()> {
        let store = StatusStore::new(self.workspace.clone());
        let mut status = store.load(slug).context("load download status")?;
        if !options.overrides.is_empty() {
            options.overrides.apply(&mut status.series);
            store.save(&mut status).context("save series metadata")?;
        }

        let units = process::processed_units(&self.workspace, slug)?;
        if units.is_empty() {
            tracing::info!(slug, "no processed units awaiting packaging");
            return Ok(());
        }
        let volumes = plan::plan_volumes(units, options.units_per_volume);
        tracing::info!(slug, volumes = volumes.len(), "planned volumes");

        let packager = self.packager_for(&status.series).await?;
        let volumes_dir = self.workspace.volumes_dir();
        for volume in &volumes {
            if self.cancel.is_cancelled() {
                report.cancelled = true;
                report.failure = Some("cancelled before every volume was written".to_owned());
                return Ok(());
            }
            let path = volumes_dir.join(plan::volume_file_name(slug, volume));
            let written = {
                let packager = packager.clone();
                let series = status.series.clone();
                let units = volume.units.clone();
                let path = path.clone();
                tokio::task::spawn_blocking(move || packager.write_volume(&series, &units, &path))
                    .await
                    .context("packaging task")?
            };
            if let Err(source) = written {
                let err = PackagingError {
                    index: volume.index,
                    path: path.display().to_string(),
                    source,
                };
                tracing::error!(slug, index = volume.index, err = %format!("{err:#}"), "packaging failed; keeping intermediates");
                report.failure = Some(format!("{:#}", anyhow::Error::from(err)));
                return Ok(());
            }
            report.volumes_written += 1;
            report.volumes.push(path);
        }

        if options.keep_intermediates {
            return Ok(());
        }
        let packaged: HashSet<u64> = volumes
            .iter()
            .flat_map(|volume| volume.units.iter().map(|unit| unit.position))
            .collect();
        report.unpackaged = status
            .awaiting_packaging()
            .map(|unit| unit.position)
            .filter(|position| !packaged.contains(position))
            .collect();
        if !report.unpackaged.is_empty() {
            tracing::warn!(slug, unpackaged = ?report.unpackaged, "some fetched units were not packaged; keeping intermediates");
            return Ok(());
        }
        self.cleanup(&store, &mut status, &volumes)?;
        report.cleaned_up = true;
        Ok(())
    }

    /// Runs only after every planned volume was written.
    fn cleanup(
        &self,
        store: &StatusStore,
        status: &mut DownloadStatus,
        volumes: &[Volume],
    ) -> anyhow::Result<()> {
        let slug = status.slug.clone();
        let packaged = volumes.iter().map(Volume::last_position).max();
        status.packaged_through = status.packaged_through.max(packaged);
        store.save(status).context("record packaged units")?;

        workspace::remove_dir_if_exists(&self.workspace.raw_dir(&slug))?;
        workspace::remove_dir_if_exists(&self.workspace.processed_dir(&slug))?;
        workspace::remove_file_if_exists(&self.workspace.markers_path(&slug))?;
        tracing::info!(slug, packaged_through = ?status.packaged_through, "removed intermediates");
        Ok(())
    }

    async fn packager_for(&self, series: &SeriesMetadata) -> anyhow::Result<Arc<dyn Packager>> {
        if let Some(packager) = &self.packager {
            return Ok(packager.clone());
        }
        let cover = match &series.cover_url {
            Some(cover_url) => self.fetch_cover(cover_url).await?,
            None => None,
        };
        Ok(Arc::new(EpubPackager::new(self.lang.clone()).with_cover(cover)))
    }

    async fn fetch_cover(&self, cover_url: &str) -> anyhow::Result<Option<CoverImage>> {
        let Ok(url) = Url::parse(cover_url) else {
            tracing::warn!(cover_url, "cover url is not absolute; skipping cover");
            return Ok(None);
        };
        let engine = FetchEngine::new(self.policy.clone(), self.cancel.clone())?;
        match engine.fetch_bytes(&url).await {
            Ok(bytes) => {
                let cover = CoverImage::from_bytes(bytes, cover_url);
                if cover.is_none() {
                    tracing::warn!(cover_url, "cover is not a recognised image; skipping");
                }
                Ok(cover)
            }
            Err(err) => {
                tracing::warn!(cover_url, %err, "cover download failed; packaging without it");
                Ok(None)
            }
        }
    }
}

fn absorb_processing(report: &mut PipelineReport, processed: process::ProcessReport) {
    report.processed += processed.processed;
    report.skipped += processed.skipped.len();
    report.skipped_units.extend(processed.skipped);
    report.cancelled |= processed.cancelled;
}
