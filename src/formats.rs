use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DOWNLOAD_STATUS_FORMAT_VERSION: u32 = 1;
pub const PROCESSED_MARKERS_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Pending,
    Fetched,
    Failed,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SeriesMetadata {
    #[serde(default)]
    pub source_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cover_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publisher: Option<String>,
}

impl SeriesMetadata {
    /// Fills display fields that are still unknown. Fields chosen by an
    /// earlier run are never replaced here; explicit overrides go through
    /// [`crate::discover::MetadataOverrides`].
    pub fn fill_missing_from(&mut self, discovered: &SeriesMetadata) {
        if self.source_url.is_empty() {
            self.source_url = discovered.source_url.clone();
        }
        fill(&mut self.title, &discovered.title);
        fill(&mut self.author, &discovered.author);
        fill(&mut self.cover_url, &discovered.cover_url);
        fill(&mut self.description, &discovered.description);
        fill(&mut self.publisher, &discovered.publisher);
        if self.tags.is_empty() {
            self.tags = discovered.tags.clone();
        }
    }
}

fn fill(slot: &mut Option<String>, candidate: &Option<String>) {
    if slot.is_none() {
        slot.clone_from(candidate);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UnitRecord {
    pub url: String,
    /// Where `url` redirected to; relative links on the page resolve
    /// against this.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_url: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub filename: String,
    pub position: u64,
    pub status: UnitStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fetched_at: Option<DateTime<Utc>>,
    /// Forward link as found on this unit's page.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_sha256: Option<String>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Cursor {
    #[serde(default)]
    pub next_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DownloadStatus {
    #[serde(default = "default_status_version")]
    pub format_version: u32,
    pub slug: String,
    #[serde(default)]
    pub series: SeriesMetadata,
    #[serde(default)]
    pub units: Vec<UnitRecord>,
    #[serde(default)]
    pub cursor: Cursor,
    /// Caller-supplied start URL that replaced the chain cursor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_override: Option<String>,
    /// Highest position already packaged and cleaned up.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub packaged_through: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

fn default_status_version() -> u32 {
    DOWNLOAD_STATUS_FORMAT_VERSION
}

impl DownloadStatus {
    pub fn new(slug: &str) -> Self {
        Self {
            format_version: DOWNLOAD_STATUS_FORMAT_VERSION,
            slug: slug.to_owned(),
            series: SeriesMetadata::default(),
            units: Vec::new(),
            cursor: Cursor::default(),
            start_override: None,
            packaged_through: None,
            updated_at: None,
        }
    }

    pub fn unit_by_url(&self, url: &str) -> Option<&UnitRecord> {
        self.units.iter().find(|unit| unit.url == url)
    }

    /// Fetched units not yet covered by a packaged volume.
    pub fn awaiting_packaging(&self) -> impl Iterator<Item = &UnitRecord> {
        self.units.iter().filter(move |unit| {
            unit.status == UnitStatus::Fetched
                && self
                    .packaged_through
                    .is_none_or(|packaged| unit.position > packaged)
        })
    }

    pub fn next_position(&self) -> u64 {
        self.units.len() as u64
    }

    pub fn count_with_status(&self, status: UnitStatus) -> usize {
        self.units.iter().filter(|unit| unit.status == status).count()
    }

    pub fn last_fetched(&self) -> Option<&UnitRecord> {
        self.units
            .iter()
            .rev()
            .find(|unit| unit.status == UnitStatus::Fetched)
    }

    /// The cursor implied by the chain alone: where the walk would continue
    /// if no caller override had been applied.
    pub fn chain_cursor(&self) -> Option<String> {
        let last = self.units.last()?;
        match last.status {
            UnitStatus::Fetched => last.next_url.clone(),
            UnitStatus::Pending => Some(last.url.clone()),
            UnitStatus::Failed => last.next_url.clone().or_else(|| Some(last.url.clone())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessedMarker {
    pub position: u64,
    pub source_url: String,
    #[serde(default)]
    pub title: String,
    pub filename: String,
    /// `fetched_at` of the raw unit this output was produced from.
    pub fetched_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_sha256: Option<String>,
    pub processed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessedMarkers {
    #[serde(default = "default_markers_version")]
    pub format_version: u32,
    pub slug: String,
    #[serde(default)]
    pub markers: Vec<ProcessedMarker>,
}

fn default_markers_version() -> u32 {
    PROCESSED_MARKERS_FORMAT_VERSION
}

impl ProcessedMarkers {
    pub fn new(slug: &str) -> Self {
        Self {
            format_version: PROCESSED_MARKERS_FORMAT_VERSION,
            slug: slug.to_owned(),
            markers: Vec::new(),
        }
    }

    /// A marker only counts when it was produced from the unit's current fetch.
    pub fn is_current_for(&self, unit: &UnitRecord) -> bool {
        let Some(fetched_at) = unit.fetched_at else {
            return false;
        };
        self.markers.iter().any(|marker| {
            marker.position == unit.position
                && marker.source_url == unit.url
                && marker.fetched_at == fetched_at
        })
    }

    pub fn upsert(&mut self, marker: ProcessedMarker) {
        self.markers.retain(|m| m.position != marker.position);
        self.markers.push(marker);
        self.markers.sort_by_key(|m| m.position);
    }
}

/// A normalised unit ready for packaging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedUnit {
    pub position: u64,
    pub source_url: String,
    pub title: String,
    pub path: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(position: u64, status: UnitStatus, next_url: Option<&str>) -> UnitRecord {
        UnitRecord {
            url: format!("https://example.com/chapter/{position}"),
            resolved_url: None,
            title: format!("Chapter {position}"),
            filename: format!("unit_{position:05}.html"),
            position,
            status,
            fetched_at: None,
            next_url: next_url.map(str::to_owned),
            content_sha256: None,
            attempts: 1,
            failure: None,
        }
    }

    #[test]
    fn chain_cursor_follows_last_unit_state() {
        let mut status = DownloadStatus::new("s");
        assert_eq!(status.chain_cursor(), None);

        status.units.push(unit(0, UnitStatus::Fetched, Some("https://example.com/chapter/1")));
        assert_eq!(
            status.chain_cursor().as_deref(),
            Some("https://example.com/chapter/1")
        );

        status.units.push(unit(1, UnitStatus::Failed, None));
        assert_eq!(
            status.chain_cursor().as_deref(),
            Some("https://example.com/chapter/1"),
            "failed unit without a known next link is retried"
        );

        status.units[1].next_url = Some("https://example.com/chapter/2".to_owned());
        assert_eq!(
            status.chain_cursor().as_deref(),
            Some("https://example.com/chapter/2")
        );
    }

    #[test]
    fn download_status_ignores_unknown_fields() -> anyhow::Result<()> {
        let json = r#"{
            "format_version": 1,
            "slug": "s",
            "future_field": {"anything": true},
            "units": [{
                "url": "https://example.com/chapter/0",
                "position": 0,
                "status": "fetched",
                "fetched_at": "2024-01-01T00:00:00Z",
                "also_new": 3
            }],
            "cursor": {"next_url": null}
        }"#;
        let status: DownloadStatus = serde_json::from_str(json)?;
        assert_eq!(status.units.len(), 1);
        assert_eq!(status.units[0].status, UnitStatus::Fetched);
        assert_eq!(status.cursor.next_url, None);
        Ok(())
    }

    #[test]
    fn fill_missing_keeps_existing_display_fields() {
        let mut series = SeriesMetadata {
            title: Some("Chosen".to_owned()),
            ..SeriesMetadata::default()
        };
        let discovered = SeriesMetadata {
            source_url: "https://example.com/fiction/1/s".to_owned(),
            title: Some("Other".to_owned()),
            author: Some("Author".to_owned()),
            ..SeriesMetadata::default()
        };
        series.fill_missing_from(&discovered);
        assert_eq!(series.title.as_deref(), Some("Chosen"));
        assert_eq!(series.author.as_deref(), Some("Author"));
        assert_eq!(series.source_url, "https://example.com/fiction/1/s");
    }
}
