use std::path::PathBuf;

use anyhow::Context as _;
use chrono::Utc;
use scraper::node::Node;
use scraper::{ElementRef, Html, Selector};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::error::StateError;
use crate::formats::{
    PROCESSED_MARKERS_FORMAT_VERSION, ProcessedMarker, ProcessedMarkers, ProcessedUnit,
    UnitRecord,
};
use crate::page::CONTENT_SELECTORS;
use crate::raw_store;
use crate::status_store::StatusStore;
use crate::workspace::{self, Workspace};
use crate::xhtml::{self, VOID_TAGS, xml_escape};

/// Content transform applied to every fetched unit.
pub trait Normalizer: Send + Sync {
    /// Turns a raw unit page into a standalone XHTML document.
    fn normalize(&self, unit: &UnitRecord, raw_html: &str) -> anyhow::Result<String>;
}

const DROPPED_ELEMENTS: &[&str] = &[
    "script", "style", "noscript", "iframe", "object", "embed", "form", "button", "link", "meta",
];

/// Notices some sources inject into the text to flag scraped copies.
const NOTICE_PHRASES: &[&str] = &[
    "unauthorized tale usage",
    "if you spot this story on amazon",
    "this content has been unlawfully taken",
];

/// Keeps the unit's content container and drops scripts, comments and
/// injected notices.
#[derive(Debug, Clone)]
pub struct ChapterCleaner {
    lang: String,
}

impl ChapterCleaner {
    pub fn new(lang: impl Into<String>) -> Self {
        Self { lang: lang.into() }
    }
}

impl Default for ChapterCleaner {
    fn default() -> Self {
        Self::new("en")
    }
}

impl Normalizer for ChapterCleaner {
    fn normalize(&self, unit: &UnitRecord, raw_html: &str) -> anyhow::Result<String> {
        let document = Html::parse_document(raw_html);
        let container = CONTENT_SELECTORS
            .iter()
            .filter_map(|selector| Selector::parse(selector).ok())
            .find_map(|selector| document.select(&selector).next())
            .ok_or_else(|| anyhow::anyhow!("no content container in raw unit"))?;

        let mut body = String::new();
        write_children(container, &mut body);
        if body.trim().is_empty() {
            anyhow::bail!("content container is empty");
        }

        let section = format!(
            "<section class=\"unit\">\n<h1>{}</h1>\n{}\n</section>",
            xml_escape(&unit.title),
            body.trim()
        );
        Ok(xhtml::wrap_document(&unit.title, &self.lang, &section))
    }
}

fn write_children(element: ElementRef<'_>, out: &mut String) {
    for child in element.children() {
        match child.value() {
            Node::Text(text) => out.push_str(&xml_escape(text)),
            Node::Element(el) => {
                let Some(child_ref) = ElementRef::wrap(child) else {
                    continue;
                };
                let name = el.name().to_ascii_lowercase();
                if DROPPED_ELEMENTS.contains(&name.as_str()) || is_notice(&name, child_ref) {
                    continue;
                }
                out.push('<');
                out.push_str(&name);
                let mut attrs: Vec<(&str, &str)> =
                    el.attrs().filter(|(attr, _)| keep_attribute(attr)).collect();
                attrs.sort_unstable();
                for (attr, value) in attrs {
                    out.push_str(&format!(" {}=\"{}\"", attr, xml_escape(value)));
                }
                if VOID_TAGS.contains(&name.as_str()) {
                    out.push_str(" />");
                    continue;
                }
                out.push('>');
                write_children(child_ref, out);
                out.push_str("</");
                out.push_str(&name);
                out.push('>');
            }
            _ => {}
        }
    }
}

fn is_notice(name: &str, element: ElementRef<'_>) -> bool {
    if name != "span" && name != "p" && name != "div" {
        return false;
    }
    let text = element.text().collect::<String>().to_lowercase();
    text.len() < 400 && NOTICE_PHRASES.iter().any(|phrase| text.contains(phrase))
}

/// Event handlers and inline styles go, as do names XML cannot carry.
fn keep_attribute(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    if lower.starts_with("on") || lower == "style" {
        return false;
    }
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

pub fn processed_unit_path(workspace: &Workspace, slug: &str, position: u64) -> PathBuf {
    workspace
        .processed_dir(slug)
        .join(format!("unit_{position:05}.xhtml"))
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedUnit {
    pub position: u64,
    pub url: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProcessReport {
    pub processed: usize,
    /// Units whose marker already matched their current fetch.
    pub up_to_date: usize,
    pub skipped: Vec<SkippedUnit>,
    pub cancelled: bool,
}

/// Loads the idempotence markers, or an empty set when none exist yet.
pub fn load_markers(workspace: &Workspace, slug: &str) -> anyhow::Result<ProcessedMarkers> {
    let path = workspace.markers_path(slug);
    let corrupt = |reason: String| StateError::Corruption {
        slug: slug.to_owned(),
        reason,
    };
    let markers: Option<ProcessedMarkers> =
        workspace::read_json(&path).map_err(|err| corrupt(format!("processed markers: {err:#}")))?;
    let Some(markers) = markers else {
        return Ok(ProcessedMarkers::new(slug));
    };
    if markers.format_version != PROCESSED_MARKERS_FORMAT_VERSION {
        return Err(corrupt(format!(
            "unsupported processed markers format_version {}",
            markers.format_version
        ))
        .into());
    }
    if markers.slug != slug {
        return Err(corrupt(format!("processed markers belong to '{}'", markers.slug)).into());
    }
    Ok(markers)
}

/// Normalises every fetched unit that lacks a current marker.
///
/// One bad unit is recorded in the report and skipped; only failures to
/// read or write state abort the batch. A second run with nothing new
/// writes nothing.
pub fn process_pending(
    workspace: &Workspace,
    slug: &str,
    normalizer: &dyn Normalizer,
    cancel: &CancellationToken,
) -> anyhow::Result<ProcessReport> {
    let status = StatusStore::new(workspace.clone())
        .load(slug)
        .context("load download status")?;
    let mut markers = load_markers(workspace, slug)?;
    let markers_path = workspace.markers_path(slug);
    let mut report = ProcessReport::default();

    for unit in status.awaiting_packaging() {
        if cancel.is_cancelled() {
            tracing::info!(slug, "processing cancelled");
            report.cancelled = true;
            break;
        }

        let out_path = processed_unit_path(workspace, slug, unit.position);
        if markers.is_current_for(unit) && out_path.exists() {
            report.up_to_date += 1;
            continue;
        }

        let Some(fetched_at) = unit.fetched_at else {
            continue;
        };
        let raw_path = raw_store::raw_unit_path(workspace, slug, unit.position);
        let normalized = raw_store::read_raw_unit(&raw_path)
            .and_then(|raw| normalizer.normalize(unit, &raw).map(|xhtml| (raw, xhtml)));
        let (raw, xhtml) = match normalized {
            Ok(pair) => pair,
            Err(err) => {
                tracing::warn!(position = unit.position, url = %unit.url, err = %format!("{err:#}"), "skipping unit");
                report.skipped.push(SkippedUnit {
                    position: unit.position,
                    url: unit.url.clone(),
                    reason: format!("{err:#}"),
                });
                continue;
            }
        };

        workspace::write_atomic(&out_path, xhtml.as_bytes())
            .with_context(|| format!("write processed unit {}", unit.position))?;
        markers.upsert(ProcessedMarker {
            position: unit.position,
            source_url: unit.url.clone(),
            title: unit.title.clone(),
            filename: out_path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default(),
            fetched_at,
            raw_sha256: Some(workspace::sha256_hex(raw.as_bytes())),
            processed_at: Utc::now(),
        });
        workspace::write_json_atomic(&markers_path, &markers).context("save processed markers")?;
        tracing::debug!(position = unit.position, "processed unit");
        report.processed += 1;
    }

    tracing::info!(
        slug,
        processed = report.processed,
        up_to_date = report.up_to_date,
        skipped = report.skipped.len(),
        "processing finished"
    );
    Ok(report)
}

/// Processed units ready for packaging, ordered by position.
pub fn processed_units(workspace: &Workspace, slug: &str) -> anyhow::Result<Vec<ProcessedUnit>> {
    let status = StatusStore::new(workspace.clone())
        .load(slug)
        .context("load download status")?;
    let markers = load_markers(workspace, slug)?;

    let mut units: Vec<ProcessedUnit> = status
        .awaiting_packaging()
        .filter(|unit| markers.is_current_for(unit))
        .map(|unit| ProcessedUnit {
            position: unit.position,
            source_url: unit.url.clone(),
            title: unit.title.clone(),
            path: processed_unit_path(workspace, slug, unit.position),
        })
        .filter(|unit| unit.path.exists())
        .collect();
    units.sort_by_key(|unit| unit.position);
    Ok(units)
}
