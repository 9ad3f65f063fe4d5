use std::collections::HashSet;

use anyhow::Context as _;
use chrono::Utc;

use crate::error::StateError;
use crate::formats::{DOWNLOAD_STATUS_FORMAT_VERSION, DownloadStatus, UnitRecord, UnitStatus};
use crate::raw_store;
use crate::workspace::{self, Workspace};

/// What a successful fetch contributes to a unit record.
#[derive(Debug, Clone)]
pub struct FetchedContent {
    pub title: String,
    pub filename: String,
    pub content_sha256: String,
    pub next_url: Option<String>,
    /// Set when the unit URL redirected.
    pub resolved_url: Option<String>,
}

/// Durable per-series download progress.
///
/// Every `record_*` call mutates the in-memory document and then persists
/// it with write-temp-then-rename before returning, so the file on disk
/// never lags behind a state transition the caller has acted on.
#[derive(Debug, Clone)]
pub struct StatusStore {
    workspace: Workspace,
}

impl StatusStore {
    pub fn new(workspace: Workspace) -> Self {
        Self { workspace }
    }

    /// Returns the stored document, or an empty one for a fresh series.
    pub fn load(&self, slug: &str) -> anyhow::Result<DownloadStatus> {
        let path = self.workspace.status_path(slug);
        let status: Option<DownloadStatus> = workspace::read_json(&path).map_err(|err| {
            StateError::Corruption {
                slug: slug.to_owned(),
                reason: format!("{err:#}"),
            }
        })?;
        let Some(status) = status else {
            return Ok(DownloadStatus::new(slug));
        };
        validate(&status, slug)?;
        tracing::debug!(
            slug,
            units = status.units.len(),
            cursor = ?status.cursor.next_url,
            "loaded download status"
        );
        Ok(status)
    }

    pub fn save(&self, status: &mut DownloadStatus) -> anyhow::Result<()> {
        validate(status, &status.slug)?;
        status.updated_at = Some(Utc::now());
        let path = self.workspace.status_path(&status.slug);
        workspace::write_json_atomic(&path, status)
            .with_context(|| format!("save download status: {}", path.display()))
    }

    /// Registers `url` before it is requested. A new unit gets the next
    /// contiguous position; a known unit keeps the one it has.
    pub fn record_pending(&self, status: &mut DownloadStatus, url: &str) -> anyhow::Result<u64> {
        let last_index = status.units.len().checked_sub(1);
        let position = match status.units.iter().position(|unit| unit.url == url) {
            Some(index) => {
                let unit = &mut status.units[index];
                unit.attempts = unit.attempts.saturating_add(1);
                if Some(index) == last_index && unit.status != UnitStatus::Fetched {
                    unit.status = UnitStatus::Pending;
                }
                unit.position
            }
            None => {
                self.settle_interrupted_tail(status);
                let position = status.next_position();
                status.units.push(UnitRecord {
                    url: url.to_owned(),
                    resolved_url: None,
                    title: String::new(),
                    filename: String::new(),
                    position,
                    status: UnitStatus::Pending,
                    fetched_at: None,
                    next_url: None,
                    content_sha256: None,
                    attempts: 1,
                    failure: None,
                });
                position
            }
        };
        self.save(status)?;
        Ok(position)
    }

    /// A run that stopped mid-fetch leaves its last unit pending. Before the
    /// chain grows elsewhere (an override detour), that unit is dropped if
    /// nothing of it reached disk, else kept as failed so its raw file is
    /// never adopted under another position.
    fn settle_interrupted_tail(&self, status: &mut DownloadStatus) {
        let Some(last) = status.units.last_mut() else {
            return;
        };
        if last.status != UnitStatus::Pending {
            return;
        }
        let raw_path = raw_store::raw_unit_path(&self.workspace, &status.slug, last.position);
        if raw_path.exists() {
            tracing::warn!(url = %last.url, position = last.position, "keeping interrupted unit as failed");
            last.status = UnitStatus::Failed;
            last.failure = Some("interrupted before the fetch was recorded".to_owned());
        } else {
            tracing::debug!(url = %last.url, position = last.position, "dropping interrupted unit");
            status.units.pop();
        }
    }

    /// Remembers where a unit's URL redirected to, before its raw page is
    /// written, so the page can be re-parsed against the same base later.
    pub fn record_redirect(
        &self,
        status: &mut DownloadStatus,
        url: &str,
        resolved_url: &str,
    ) -> anyhow::Result<()> {
        let unit = unit_mut(status, url)?;
        if unit.resolved_url.as_deref() == Some(resolved_url) {
            return Ok(());
        }
        unit.resolved_url = Some(resolved_url.to_owned());
        self.save(status)
    }

    /// Marks the unit fetched and moves the cursor to its forward link.
    /// Callers must have written the raw content first.
    pub fn record_fetched(
        &self,
        status: &mut DownloadStatus,
        url: &str,
        content: FetchedContent,
    ) -> anyhow::Result<()> {
        let unit = unit_mut(status, url)?;
        unit.status = UnitStatus::Fetched;
        unit.fetched_at = Some(Utc::now());
        unit.title = content.title;
        unit.filename = content.filename;
        unit.content_sha256 = Some(content.content_sha256);
        unit.next_url = content.next_url.clone();
        unit.resolved_url = content.resolved_url;
        unit.failure = None;
        move_cursor(status, content.next_url);
        self.save(status)
    }

    /// Marks the unit failed. The cursor stays put so a later run retries it.
    pub fn record_failed(
        &self,
        status: &mut DownloadStatus,
        url: &str,
        reason: &str,
    ) -> anyhow::Result<()> {
        let unit = unit_mut(status, url)?;
        unit.status = UnitStatus::Failed;
        unit.failure = Some(reason.to_owned());
        self.save(status)
    }

    /// Continues the chain past a permanently failed unit whose page still
    /// exposed a forward link.
    pub fn skip_failed(
        &self,
        status: &mut DownloadStatus,
        url: &str,
        next_url: &str,
    ) -> anyhow::Result<()> {
        let unit = unit_mut(status, url)?;
        if unit.status != UnitStatus::Failed {
            anyhow::bail!("only failed units can be skipped: {url}");
        }
        unit.next_url = Some(next_url.to_owned());
        move_cursor(status, Some(next_url.to_owned()));
        self.save(status)
    }

    /// Moves the cursor along an already-recorded unit without fetching it.
    pub fn follow_known(&self, status: &mut DownloadStatus, url: &str) -> anyhow::Result<()> {
        let next = status
            .unit_by_url(url)
            .ok_or_else(|| anyhow::anyhow!("unit not recorded: {url}"))?
            .next_url
            .clone();
        move_cursor(status, next);
        self.save(status)
    }

    /// Points the cursor at a caller-chosen unit. Takes precedence over
    /// whatever the chain says.
    pub fn apply_start_override(
        &self,
        status: &mut DownloadStatus,
        url: &str,
    ) -> anyhow::Result<()> {
        move_cursor(status, Some(url.to_owned()));
        self.save(status)
    }

    /// Re-opens an exhausted chain when the last unit grew a forward link.
    pub fn extend_tail(&self, status: &mut DownloadStatus, next_url: &str) -> anyhow::Result<()> {
        let last = status
            .units
            .last_mut()
            .ok_or_else(|| anyhow::anyhow!("no units recorded"))?;
        last.next_url = Some(next_url.to_owned());
        move_cursor(status, Some(next_url.to_owned()));
        self.save(status)
    }
}

fn unit_mut<'a>(status: &'a mut DownloadStatus, url: &str) -> anyhow::Result<&'a mut UnitRecord> {
    status
        .units
        .iter_mut()
        .find(|unit| unit.url == url)
        .ok_or_else(|| anyhow::anyhow!("unit not recorded: {url}"))
}

/// Sets the cursor, recording it as an override whenever it departs from
/// the chain. Running off the end of a detour falls back to the chain.
fn move_cursor(status: &mut DownloadStatus, next: Option<String>) {
    let chain = status.chain_cursor();
    match next {
        Some(url) if status.units.is_empty() || chain.as_deref() == Some(url.as_str()) => {
            status.start_override = None;
            status.cursor.next_url = Some(url);
        }
        Some(url) => {
            status.start_override = Some(url.clone());
            status.cursor.next_url = Some(url);
        }
        None => {
            status.start_override = None;
            status.cursor.next_url = chain;
        }
    }
}

/// Invariant checks run on every load and save.
pub fn validate(status: &DownloadStatus, slug: &str) -> Result<(), StateError> {
    let corrupt = |reason: String| StateError::Corruption {
        slug: slug.to_owned(),
        reason,
    };

    if status.format_version != DOWNLOAD_STATUS_FORMAT_VERSION {
        return Err(corrupt(format!(
            "unsupported format_version {}",
            status.format_version
        )));
    }
    if status.slug != slug {
        return Err(corrupt(format!("document belongs to '{}'", status.slug)));
    }

    let mut seen = HashSet::new();
    let last_index = status.units.len().saturating_sub(1);
    for (index, unit) in status.units.iter().enumerate() {
        if unit.position != index as u64 {
            return Err(corrupt(format!(
                "unit {} has position {}, expected {index}",
                unit.url, unit.position
            )));
        }
        if !seen.insert(unit.url.as_str()) {
            return Err(corrupt(format!("duplicate unit url {}", unit.url)));
        }
        if unit.status == UnitStatus::Pending && index != last_index {
            return Err(corrupt(format!(
                "pending unit {} is not the last unit",
                unit.url
            )));
        }
        if unit.status == UnitStatus::Fetched && unit.fetched_at.is_none() {
            return Err(corrupt(format!("fetched unit {} has no fetched_at", unit.url)));
        }
    }

    if !status.units.is_empty() {
        let cursor = status.cursor.next_url.as_deref();
        let follows_chain = cursor == status.chain_cursor().as_deref();
        let follows_override =
            status.start_override.is_some() && cursor == status.start_override.as_deref();
        if !follows_chain && !follows_override {
            return Err(corrupt(format!(
                "cursor {cursor:?} matches neither the chain nor an override"
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(n: u32) -> String {
        format!("https://example.com/fiction/1/s/chapter/{n}/c{n}")
    }

    fn content(n: u32, next: Option<u32>) -> FetchedContent {
        FetchedContent {
            title: format!("Chapter {n}"),
            filename: format!("unit_{n:05}.html"),
            content_sha256: "00".to_owned(),
            next_url: next.map(url),
            resolved_url: None,
        }
    }

    fn store() -> anyhow::Result<(tempfile::TempDir, StatusStore)> {
        let temp = tempfile::TempDir::new()?;
        let store = StatusStore::new(Workspace::new(temp.path()));
        Ok((temp, store))
    }

    #[test]
    fn missing_document_loads_empty() -> anyhow::Result<()> {
        let (_temp, store) = store()?;
        let status = store.load("fresh")?;
        assert!(status.units.is_empty());
        assert_eq!(status.cursor.next_url, None);
        Ok(())
    }

    #[test]
    fn fetch_fail_resume_keeps_positions_contiguous() -> anyhow::Result<()> {
        let (_temp, store) = store()?;
        let mut status = store.load("s")?;
        store.apply_start_override(&mut status, &url(0))?;

        assert_eq!(store.record_pending(&mut status, &url(0))?, 0);
        store.record_fetched(&mut status, &url(0), content(0, Some(1)))?;
        assert_eq!(status.cursor.next_url, Some(url(1)));

        assert_eq!(store.record_pending(&mut status, &url(1))?, 1);
        store.record_failed(&mut status, &url(1), "HTTP 503")?;
        assert_eq!(status.cursor.next_url, Some(url(1)), "failure keeps cursor");

        // Resume in a new "process".
        let mut status = store.load("s")?;
        assert_eq!(store.record_pending(&mut status, &url(1))?, 1, "position reused");
        store.record_fetched(&mut status, &url(1), content(1, Some(2)))?;
        assert_eq!(store.record_pending(&mut status, &url(2))?, 2);
        store.record_failed(&mut status, &url(2), "no content")?;
        store.skip_failed(&mut status, &url(2), &url(3))?;
        assert_eq!(store.record_pending(&mut status, &url(3))?, 3);
        store.record_fetched(&mut status, &url(3), content(3, None))?;

        let reloaded = store.load("s")?;
        let positions: Vec<u64> = reloaded.units.iter().map(|u| u.position).collect();
        assert_eq!(positions, vec![0, 1, 2, 3]);
        assert_eq!(reloaded.cursor.next_url, None);
        assert_eq!(reloaded.start_override, None);
        assert_eq!(reloaded.units[2].status, UnitStatus::Failed);
        assert_eq!(reloaded.units[1].attempts, 2);
        Ok(())
    }

    #[test]
    fn override_detour_is_valid_and_returns_to_chain() -> anyhow::Result<()> {
        let (_temp, store) = store()?;
        let mut status = store.load("s")?;
        store.apply_start_override(&mut status, &url(0))?;
        store.record_pending(&mut status, &url(0))?;
        store.record_fetched(&mut status, &url(0), content(0, Some(1)))?;
        store.record_pending(&mut status, &url(1))?;
        store.record_fetched(&mut status, &url(1), content(1, None))?;
        assert_eq!(status.cursor.next_url, None);

        store.apply_start_override(&mut status, &url(0))?;
        assert_eq!(status.start_override, Some(url(0)));
        let reloaded = store.load("s")?;
        assert_eq!(reloaded.cursor.next_url, Some(url(0)));

        store.follow_known(&mut status, &url(0))?;
        assert_eq!(status.cursor.next_url, Some(url(1)));
        store.follow_known(&mut status, &url(1))?;
        assert_eq!(status.cursor.next_url, None);
        assert_eq!(status.start_override, None);
        Ok(())
    }

    #[test]
    fn corrupt_documents_are_rejected() -> anyhow::Result<()> {
        let (temp, store) = store()?;
        let path = Workspace::new(temp.path()).status_path("s");

        let gap = serde_json::json!({
            "format_version": 1,
            "slug": "s",
            "units": [
                {"url": url(0), "position": 0, "status": "fetched", "fetched_at": "2024-01-01T00:00:00Z", "next_url": url(1)},
                {"url": url(1), "position": 2, "status": "fetched", "fetched_at": "2024-01-01T00:00:00Z"}
            ],
            "cursor": {"next_url": null}
        });
        workspace::write_json_atomic(&path, &gap)?;
        let err = store.load("s").expect_err("gap must be rejected");
        assert!(matches!(
            err.downcast_ref::<StateError>(),
            Some(StateError::Corruption { .. })
        ));

        let stray_cursor = serde_json::json!({
            "format_version": 1,
            "slug": "s",
            "units": [
                {"url": url(0), "position": 0, "status": "fetched", "fetched_at": "2024-01-01T00:00:00Z", "next_url": url(1)}
            ],
            "cursor": {"next_url": url(7)}
        });
        workspace::write_json_atomic(&path, &stray_cursor)?;
        assert!(store.load("s").is_err());

        std::fs::write(&path, b"{ not json")?;
        let err = store.load("s").expect_err("garbage must be rejected");
        assert!(matches!(
            err.downcast_ref::<StateError>(),
            Some(StateError::Corruption { .. })
        ));
        Ok(())
    }

    #[test]
    fn tail_extension_reopens_exhausted_chain() -> anyhow::Result<()> {
        let (_temp, store) = store()?;
        let mut status = store.load("s")?;
        store.apply_start_override(&mut status, &url(0))?;
        store.record_pending(&mut status, &url(0))?;
        store.record_fetched(&mut status, &url(0), content(0, None))?;
        store.extend_tail(&mut status, &url(1))?;
        assert_eq!(status.cursor.next_url, Some(url(1)));
        assert_eq!(status.start_override, None);
        Ok(())
    }

    #[test]
    fn override_after_interrupted_fetch_settles_pending_tail() -> anyhow::Result<()> {
        let (temp, store) = store()?;
        let mut status = store.load("s")?;
        store.apply_start_override(&mut status, &url(0))?;
        store.record_pending(&mut status, &url(0))?;
        store.record_fetched(&mut status, &url(0), content(0, Some(1)))?;
        store.record_pending(&mut status, &url(1))?;

        // Nothing of unit 1 reached disk, so it is dropped.
        store.apply_start_override(&mut status, &url(5))?;
        assert_eq!(store.record_pending(&mut status, &url(5))?, 1);
        assert!(status.unit_by_url(&url(1)).is_none());

        // Unit 5 left a raw file behind, so it stays as failed.
        let raw = raw_store::raw_unit_path(&Workspace::new(temp.path()), "s", 1);
        raw_store::write_raw_unit(&raw, "<html><body>x</body></html>")?;
        store.apply_start_override(&mut status, &url(9))?;
        assert_eq!(store.record_pending(&mut status, &url(9))?, 2);
        assert_eq!(status.units[1].status, UnitStatus::Failed);

        let reloaded = store.load("s")?;
        let urls: Vec<&str> = reloaded.units.iter().map(|u| u.url.as_str()).collect();
        assert_eq!(urls, vec![url(0), url(5), url(9)]);
        Ok(())
    }

    #[test]
    fn redirect_is_kept_until_the_next_fetch() -> anyhow::Result<()> {
        let (_temp, store) = store()?;
        let mut status = store.load("s")?;
        store.apply_start_override(&mut status, &url(0))?;
        store.record_pending(&mut status, &url(0))?;
        store.record_redirect(&mut status, &url(0), &url(100))?;
        assert_eq!(store.load("s")?.units[0].resolved_url, Some(url(100)));

        store.record_fetched(&mut status, &url(0), content(0, None))?;
        assert_eq!(status.units[0].resolved_url, None);
        Ok(())
    }
}
