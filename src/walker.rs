use std::collections::HashSet;

use anyhow::Context as _;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::FetchError;
use crate::fetch::FetchEngine;
use crate::formats::{DownloadStatus, UnitStatus};
use crate::page;
use crate::raw_store;
use crate::status_store::{FetchedContent, StatusStore};
use crate::workspace::Workspace;

/// Why a walk stopped. Only `Exhausted` means the chain has no more units
/// for now; none of these is an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WalkOutcome {
    Exhausted,
    Cancelled,
    /// A unit failed without exposing a forward link; the next run retries it.
    Stalled,
    /// Too many units failed in this run.
    BudgetSpent,
    /// The per-run unit cap was reached.
    UnitCap,
}

#[derive(Debug, Clone, Serialize)]
pub struct UnitFailure {
    pub position: u64,
    pub url: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct WalkReport {
    pub outcome: WalkOutcome,
    pub fetched: usize,
    /// Pending units whose raw file survived a crash and was taken as-is.
    pub adopted: usize,
    pub failed: usize,
    pub failures: Vec<UnitFailure>,
}

impl WalkReport {
    fn new() -> Self {
        Self {
            outcome: WalkOutcome::Exhausted,
            fetched: 0,
            adopted: 0,
            failed: 0,
            failures: Vec::new(),
        }
    }
}

/// Follows forward links one page at a time, starting at the persisted
/// cursor. Each step is fetch, write raw, record, advance.
pub struct ChainWalker<'a> {
    workspace: &'a Workspace,
    store: &'a StatusStore,
    engine: &'a mut FetchEngine,
    cancel: CancellationToken,
    refresh_tail: bool,
}

impl<'a> ChainWalker<'a> {
    pub fn new(
        workspace: &'a Workspace,
        store: &'a StatusStore,
        engine: &'a mut FetchEngine,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            workspace,
            store,
            engine,
            cancel,
            refresh_tail: false,
        }
    }

    /// Re-read the last unit once when the chain looks exhausted.
    pub fn with_tail_refresh(mut self, refresh_tail: bool) -> Self {
        self.refresh_tail = refresh_tail;
        self
    }

    pub async fn run(&mut self, status: &mut DownloadStatus) -> anyhow::Result<WalkReport> {
        let mut report = WalkReport::new();
        let mut visited: HashSet<String> = HashSet::new();
        let mut tail_checked = false;
        let max_failures = self.engine.policy().max_unit_failures.max(1);
        let max_units = self.engine.policy().max_units;

        loop {
            if self.cancel.is_cancelled() {
                report.outcome = WalkOutcome::Cancelled;
                break;
            }

            let Some(cursor) = status.cursor.next_url.clone() else {
                if self.refresh_tail && !tail_checked {
                    tail_checked = true;
                    if self.extend_from_tail(status).await? {
                        continue;
                    }
                }
                report.outcome = WalkOutcome::Exhausted;
                break;
            };

            if !visited.insert(cursor.clone()) {
                tracing::warn!(url = %cursor, "next link revisits a unit from this walk; stopping");
                report.outcome = WalkOutcome::Exhausted;
                break;
            }

            if let Some(unit) = status.unit_by_url(&cursor) {
                let is_last = unit.position + 1 == status.next_position();
                let settled = match unit.status {
                    UnitStatus::Fetched => true,
                    UnitStatus::Failed => unit.next_url.is_some() || !is_last,
                    UnitStatus::Pending => false,
                };
                if settled {
                    tracing::debug!(url = %cursor, position = unit.position, "unit already recorded; following its link");
                    self.store
                        .follow_known(status, &cursor)
                        .context("advance past recorded unit")?;
                    continue;
                }
            }

            if max_units.is_some_and(|max| report.fetched + report.failed >= max) {
                report.outcome = WalkOutcome::UnitCap;
                break;
            }

            let url = Url::parse(&cursor).with_context(|| format!("parse cursor url {cursor}"))?;
            let position = self
                .store
                .record_pending(status, &cursor)
                .context("record pending unit")?;
            let raw_path = raw_store::raw_unit_path(self.workspace, &status.slug, position);

            if raw_path.exists() && self.adopt(status, &url, position, &raw_path)? {
                report.adopted += 1;
                continue;
            }

            match self.engine.fetch_unit(&url).await {
                Ok(fetched) => {
                    let resolved_url = (fetched.final_url != url).then(|| fetched.final_url.to_string());
                    if let Some(resolved) = &resolved_url {
                        self.store
                            .record_redirect(status, &cursor, resolved)
                            .context("record redirect")?;
                    }
                    let content_sha256 = raw_store::write_raw_unit(&raw_path, &fetched.html)?;
                    let title = fetched
                        .page
                        .title
                        .unwrap_or_else(|| fallback_title(position));
                    tracing::info!(position, url = %cursor, %title, "fetched unit");
                    self.store
                        .record_fetched(
                            status,
                            &cursor,
                            FetchedContent {
                                title,
                                filename: raw_store::raw_unit_file_name(position),
                                content_sha256,
                                next_url: fetched.page.next_url.map(|next| next.to_string()),
                                resolved_url,
                            },
                        )
                        .context("record fetched unit")?;
                    report.fetched += 1;
                }
                Err(FetchError::Cancelled { .. }) => {
                    report.outcome = WalkOutcome::Cancelled;
                    break;
                }
                Err(err) => {
                    let reason = err.to_string();
                    tracing::warn!(position, url = %cursor, %reason, "unit failed");
                    self.store
                        .record_failed(status, &cursor, &reason)
                        .context("record failed unit")?;
                    report.failed += 1;
                    report.failures.push(UnitFailure {
                        position,
                        url: cursor.clone(),
                        reason,
                    });

                    let next_url = match err {
                        FetchError::Permanent { next_url, .. } => next_url,
                        _ => None,
                    };
                    let Some(next) = next_url else {
                        report.outcome = WalkOutcome::Stalled;
                        break;
                    };
                    self.store
                        .skip_failed(status, &cursor, &next)
                        .context("skip failed unit")?;
                    if report.failed >= max_failures {
                        report.outcome = WalkOutcome::BudgetSpent;
                        break;
                    }
                }
            }
        }

        tracing::info!(
            slug = %status.slug,
            outcome = ?report.outcome,
            fetched = report.fetched,
            adopted = report.adopted,
            failed = report.failed,
            "walk finished"
        );
        Ok(report)
    }

    /// Takes over a raw file written by a run that died before recording it.
    fn adopt(
        &self,
        status: &mut DownloadStatus,
        url: &Url,
        position: u64,
        raw_path: &std::path::Path,
    ) -> anyhow::Result<bool> {
        let html = raw_store::read_raw_unit(raw_path)?;
        let resolved_url = status
            .unit_by_url(url.as_str())
            .and_then(|unit| unit.resolved_url.clone());
        let base = match resolved_url.as_deref().map(Url::parse) {
            Some(Ok(resolved)) => resolved,
            _ => url.clone(),
        };
        let parsed = page::parse_unit(&base, &html);
        if !parsed.has_content {
            tracing::debug!(position, path = %raw_path.display(), "leftover raw file unusable; refetching");
            return Ok(false);
        }
        tracing::info!(position, url = %url, "adopting raw unit from an interrupted run");
        self.store
            .record_fetched(
                status,
                url.as_str(),
                FetchedContent {
                    title: parsed.title.unwrap_or_else(|| fallback_title(position)),
                    filename: raw_store::raw_unit_file_name(position),
                    content_sha256: crate::workspace::sha256_hex(html.as_bytes()),
                    next_url: parsed.next_url.map(|next| next.to_string()),
                    resolved_url,
                },
            )
            .context("record adopted unit")?;
        Ok(true)
    }

    async fn extend_from_tail(&mut self, status: &mut DownloadStatus) -> anyhow::Result<bool> {
        let Some(last) = status.units.last() else {
            return Ok(false);
        };
        if last.status != UnitStatus::Fetched {
            return Ok(false);
        }
        let last_url = Url::parse(&last.url).with_context(|| format!("parse unit url {}", last.url))?;

        let fetched = match self.engine.fetch_page(&last_url).await {
            Ok(fetched) => fetched,
            Err(err) => {
                tracing::warn!(url = %last_url, %err, "tail refresh failed");
                return Ok(false);
            }
        };
        let parsed = page::parse_unit(&fetched.final_url, &fetched.html);
        match parsed.next_url {
            Some(next) if status.unit_by_url(next.as_str()).is_none() => {
                tracing::info!(next = %next, "tail refresh found a new unit");
                self.store
                    .extend_tail(status, next.as_str())
                    .context("extend chain tail")?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

fn fallback_title(position: u64) -> String {
    format!("Chapter {}", position + 1)
}
