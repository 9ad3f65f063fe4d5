//! Page-level parsing for overview and unit pages.
//!
//! Everything here is a pure function of `(url, html)`, so a raw unit saved
//! to disk can be re-parsed later without touching the network.

use scraper::{ElementRef, Html, Selector};
use serde_json::Value;
use url::Url;

use crate::formats::SeriesMetadata;
use crate::slug::UNIT_SEGMENT;

/// Containers that hold the body of a unit, in order of preference.
pub const CONTENT_SELECTORS: &[&str] = &[
    "div.chapter-content",
    "div.chapter-inner",
    "div.prose",
    "article",
];

const NEXT_WORDS: &[&str] = &["next", "próximo", "proximo"];
const PREVIOUS_WORDS: &[&str] = &["previous", "prev", "anterior"];

#[derive(Debug, Clone, Default)]
pub struct OverviewPage {
    pub metadata: SeriesMetadata,
    pub first_unit_url: Option<Url>,
}

#[derive(Debug, Clone, Default)]
pub struct UnitPage {
    pub title: Option<String>,
    pub has_content: bool,
    pub next_url: Option<Url>,
}

pub fn parse_overview(page_url: &Url, html: &str) -> OverviewPage {
    let document = Html::parse_document(html);
    let json_ld = first_json_ld_object(&document);

    let title = select_text(&document, "div.fic-title h1")
        .or_else(|| json_ld.as_ref().and_then(|ld| json_str(ld, "name")))
        .or_else(|| {
            select_text(&document, "title")
                .map(|t| t.split('|').next().unwrap_or_default().trim().to_owned())
        })
        .filter(|t| !t.is_empty());

    let author = select_text(&document, "div.fic-title a[href*=\"/profile/\"]")
        .or_else(|| json_ld.as_ref().and_then(json_ld_author))
        .or_else(|| select_attr(&document, "meta[name=\"author\"]", "content"))
        .filter(|a| !a.is_empty());

    let description = select_attr(&document, "meta[property=\"og:description\"]", "content")
        .or_else(|| select_attr(&document, "meta[name=\"twitter:description\"]", "content"))
        .or_else(|| json_ld.as_ref().and_then(|ld| json_str(ld, "description")))
        .filter(|d| !d.is_empty());

    let cover_url = select_attr(&document, "meta[property=\"og:image\"]", "content")
        .or_else(|| select_attr(&document, "meta[name=\"twitter:image\"]", "content"))
        .or_else(|| json_ld.as_ref().and_then(json_ld_image))
        .and_then(|href| resolve_link(page_url, &href))
        .map(|url| url.to_string());

    let publisher = json_ld.as_ref().and_then(|ld| {
        ld.get("publisher")
            .and_then(|p| json_str(p, "name"))
            .or_else(|| ld.get("sourceOrganization").and_then(|p| json_str(p, "name")))
    });

    let mut tags = Vec::new();
    if let Some(keywords) = select_attr(&document, "meta[name=\"keywords\"]", "content") {
        tags.extend(split_tags(&keywords));
    }
    if let Some(ld) = &json_ld {
        tags.extend(json_string_list(ld.get("genre")));
        tags.extend(json_string_list(ld.get("keywords")));
    }
    tags.sort();
    tags.dedup();

    let first_unit_url = [
        "a.btn.btn-primary[href*=\"/chapter/\"]",
        "table#chapters tbody tr[data-url] a[href]",
        "a[href*=\"/chapter/\"]",
    ]
    .iter()
    .find_map(|selector| {
        select_attr(&document, selector, "href").and_then(|href| resolve_link(page_url, &href))
    });

    OverviewPage {
        metadata: SeriesMetadata {
            source_url: page_url.to_string(),
            title,
            author,
            cover_url,
            description,
            tags,
            publisher,
        },
        first_unit_url,
    }
}

pub fn parse_unit(page_url: &Url, html: &str) -> UnitPage {
    let document = Html::parse_document(html);

    let title = [
        "div.fic-header h1",
        "h1.break-word[property=\"name\"]",
        "div.chapter-content h1",
        "h1",
    ]
    .iter()
    .find_map(|selector| select_text(&document, selector))
    .or_else(|| select_text(&document, "title").map(|t| title_from_head(&t)))
    .filter(|t| !t.is_empty());

    let has_content = CONTENT_SELECTORS
        .iter()
        .any(|selector| select_first(&document, selector).is_some());

    let next_url = find_next_link(&document, page_url)
        .filter(|next| !same_page(next, page_url));

    UnitPage {
        title,
        has_content,
        next_url,
    }
}

fn find_next_link(document: &Html, page_url: &Url) -> Option<Url> {
    if let Some(url) = ["link[rel~=\"next\"]", "a[rel~=\"next\"]"]
        .iter()
        .find_map(|selector| {
            select_attr(document, selector, "href").and_then(|href| resolve_link(page_url, &href))
        })
    {
        return Some(url);
    }

    let anchors = Selector::parse("a[href]").ok()?;
    let candidates: Vec<(ElementRef<'_>, String)> = document
        .select(&anchors)
        .map(|a| (a, element_text(&a).to_lowercase()))
        .filter(|(_, text)| {
            NEXT_WORDS.iter().any(|w| text.contains(w))
                && !PREVIOUS_WORDS.iter().any(|w| text.contains(w))
        })
        .collect();

    // Navigation buttons first, then any "next" link that looks like a unit.
    let button = candidates.iter().find_map(|(a, _)| {
        let class = a.value().attr("class").unwrap_or_default().to_lowercase();
        if class.contains("btn") || class.contains("button") || class.contains("next") {
            a.value().attr("href").and_then(|href| resolve_link(page_url, href))
        } else {
            None
        }
    });
    if button.is_some() {
        return button;
    }

    candidates.iter().find_map(|(a, _)| {
        let href = a.value().attr("href")?;
        let url = resolve_link(page_url, href)?;
        looks_like_unit_url(&url).then_some(url)
    })
}

fn looks_like_unit_url(url: &Url) -> bool {
    let path = url.path();
    path.contains(&format!("/{UNIT_SEGMENT}/"))
        || path.contains("/fiction/")
        || path
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .is_some_and(|last| !last.is_empty() && last.chars().all(|c| c.is_ascii_digit()))
}

/// Resolves `href` against the page, dropping fragments and non-http targets.
pub fn resolve_link(page_url: &Url, href: &str) -> Option<Url> {
    let href = href.trim();
    if href.is_empty() || href == "#" || href.to_ascii_lowercase().starts_with("javascript:") {
        return None;
    }
    let mut url = page_url.join(href).ok()?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return None;
    }
    url.set_fragment(None);
    Some(url)
}

fn same_page(a: &Url, b: &Url) -> bool {
    let mut a = a.clone();
    let mut b = b.clone();
    a.set_fragment(None);
    b.set_fragment(None);
    a.as_str().trim_end_matches('/') == b.as_str().trim_end_matches('/')
}

/// `<title>` often reads "Chapter - Story | Site"; keep the chapter part.
fn title_from_head(head_title: &str) -> String {
    let full = head_title.split('|').next().unwrap_or_default().trim();
    let parts: Vec<&str> = full.split(" - ").collect();
    if parts.len() > 1 && parts[0].len() < parts[1].len() {
        parts[0].trim().to_owned()
    } else {
        full.to_owned()
    }
}

fn select_first<'a>(document: &'a Html, selector: &str) -> Option<ElementRef<'a>> {
    let selector = Selector::parse(selector).ok()?;
    document.select(&selector).next()
}

fn select_text(document: &Html, selector: &str) -> Option<String> {
    select_first(document, selector)
        .map(|el| element_text(&el))
        .filter(|text| !text.is_empty())
}

fn select_attr(document: &Html, selector: &str, attr: &str) -> Option<String> {
    let selector = Selector::parse(selector).ok()?;
    document
        .select(&selector)
        .find_map(|el| el.value().attr(attr))
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn element_text(element: &ElementRef<'_>) -> String {
    element
        .text()
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn first_json_ld_object(document: &Html) -> Option<Value> {
    let selector = Selector::parse("script[type=\"application/ld+json\"]").ok()?;
    document.select(&selector).find_map(|script| {
        let text = script.inner_html();
        match serde_json::from_str::<Value>(text.trim()) {
            Ok(Value::Array(items)) => items.into_iter().find(Value::is_object),
            Ok(value @ Value::Object(_)) => Some(value),
            Ok(_) => None,
            Err(err) => {
                tracing::debug!(?err, "skipping unparsable JSON-LD block");
                None
            }
        }
    })
}

fn json_str(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(|s| s.trim().to_owned())
        .filter(|s| !s.is_empty())
}

fn json_ld_author(ld: &Value) -> Option<String> {
    let author = ld.get("author")?;
    let first = match author {
        Value::Array(items) => items.first()?,
        other => other,
    };
    match first {
        Value::String(name) => Some(name.trim().to_owned()),
        Value::Object(_) => json_str(first, "name"),
        _ => None,
    }
}

fn json_ld_image(ld: &Value) -> Option<String> {
    let image = ld.get("image")?;
    let first = match image {
        Value::Array(items) => items.first()?,
        other => other,
    };
    match first {
        Value::String(url) => Some(url.trim().to_owned()),
        Value::Object(_) => json_str(first, "url"),
        _ => None,
    }
}

fn json_string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::String(s)) => split_tags(s),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(|s| s.trim().to_owned())
            .filter(|s| !s.is_empty())
            .collect(),
        _ => Vec::new(),
    }
}

pub fn split_tags(input: &str) -> Vec<String> {
    input
        .split(',')
        .map(|tag| tag.trim().to_owned())
        .filter(|tag| !tag.is_empty())
        .collect()
}
