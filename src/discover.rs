use anyhow::Context as _;
use url::Url;

use crate::fetch::FetchEngine;
use crate::formats::SeriesMetadata;
use crate::page;
use crate::slug::UNIT_SEGMENT;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// Series landing page with metadata and a link to the first unit.
    Overview,
    /// A specific unit; the walk starts right there.
    Unit,
}

pub fn classify(url: &Url) -> SourceKind {
    let is_unit = url
        .path_segments()
        .is_some_and(|mut segments| segments.any(|segment| segment == UNIT_SEGMENT));
    if is_unit {
        SourceKind::Unit
    } else {
        SourceKind::Overview
    }
}

/// Display fields supplied explicitly by the caller. They always win over
/// discovered or previously stored values.
#[derive(Debug, Clone, Default)]
pub struct MetadataOverrides {
    pub title: Option<String>,
    pub author: Option<String>,
    pub cover_url: Option<String>,
    pub description: Option<String>,
    pub tags: Option<Vec<String>>,
    pub publisher: Option<String>,
}

impl MetadataOverrides {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.author.is_none()
            && self.cover_url.is_none()
            && self.description.is_none()
            && self.tags.is_none()
            && self.publisher.is_none()
    }

    pub fn apply(&self, series: &mut SeriesMetadata) {
        let set = |slot: &mut Option<String>, value: &Option<String>| {
            if let Some(value) = value {
                *slot = Some(value.clone());
            }
        };
        set(&mut series.title, &self.title);
        set(&mut series.author, &self.author);
        set(&mut series.cover_url, &self.cover_url);
        set(&mut series.description, &self.description);
        set(&mut series.publisher, &self.publisher);
        if let Some(tags) = &self.tags {
            series.tags.clone_from(tags);
        }
    }
}

#[derive(Debug, Clone)]
pub struct Discovery {
    pub kind: SourceKind,
    pub metadata: SeriesMetadata,
    /// Where the walk should begin. `None` only when the overview page had
    /// no recognisable unit link.
    pub first_unit_url: Option<Url>,
}

/// Resolves series metadata and the first unit to fetch.
///
/// `start_override` takes precedence over the overview's own first-unit
/// link. With an override in hand, an unreachable overview page only costs
/// the metadata.
pub async fn discover(
    engine: &FetchEngine,
    source: &Url,
    start_override: Option<&Url>,
) -> anyhow::Result<Discovery> {
    let kind = classify(source);
    let bare = SeriesMetadata {
        source_url: source.to_string(),
        ..SeriesMetadata::default()
    };

    if kind == SourceKind::Unit {
        return Ok(Discovery {
            kind,
            metadata: bare,
            first_unit_url: Some(start_override.unwrap_or(source).clone()),
        });
    }

    let overview = match engine.fetch_page(source).await {
        Ok(fetched) => page::parse_overview(&fetched.final_url, &fetched.html),
        Err(err) if start_override.is_some() => {
            tracing::warn!(url = %source, %err, "overview page unavailable; using start override");
            return Ok(Discovery {
                kind,
                metadata: bare,
                first_unit_url: start_override.cloned(),
            });
        }
        Err(err) => return Err(err).with_context(|| format!("fetch overview page {source}")),
    };

    let mut metadata = overview.metadata;
    metadata.source_url = source.to_string();

    if let (Some(override_url), Some(found)) = (start_override, &overview.first_unit_url)
        && override_url != found
    {
        tracing::info!(
            discovered = %found,
            start = %override_url,
            "start override replaces discovered first unit"
        );
    }
    let first_unit_url = start_override.cloned().or(overview.first_unit_url);
    if first_unit_url.is_none() {
        tracing::warn!(url = %source, "overview page exposes no unit link");
    }

    Ok(Discovery {
        kind,
        metadata,
        first_unit_url,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_unit_and_overview_urls() {
        let unit = Url::parse("https://example.com/fiction/1/s/chapter/9/x").expect("url");
        let overview = Url::parse("https://example.com/fiction/1/s").expect("url");
        assert_eq!(classify(&unit), SourceKind::Unit);
        assert_eq!(classify(&overview), SourceKind::Overview);
    }

    #[test]
    fn overrides_replace_only_given_fields() {
        let mut series = SeriesMetadata {
            title: Some("Found".to_owned()),
            author: Some("Writer".to_owned()),
            tags: vec!["a".to_owned()],
            ..SeriesMetadata::default()
        };
        let overrides = MetadataOverrides {
            title: Some("Chosen".to_owned()),
            tags: Some(vec!["x".to_owned(), "y".to_owned()]),
            ..MetadataOverrides::default()
        };
        assert!(!overrides.is_empty());
        overrides.apply(&mut series);
        assert_eq!(series.title.as_deref(), Some("Chosen"));
        assert_eq!(series.author.as_deref(), Some("Writer"));
        assert_eq!(series.tags, vec!["x", "y"]);
    }
}
