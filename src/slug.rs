use url::Url;

const MAX_SLUG_LEN: usize = 100;

/// Path segments that name a section of the site rather than a series.
const GENERIC_SEGMENTS: &[&str] = &["fiction", "story", "stories", "novel", "series", "book", "read"];

/// Path segment that marks a unit URL (`.../chapter/<id>/<name>`).
pub const UNIT_SEGMENT: &str = "chapter";

/// Derives the series identifier from a series or unit URL.
///
/// The segments before the unit marker identify the series; the last
/// non-numeric, non-generic one wins (`/fiction/123/my-story/chapter/9/x`
/// gives `my-story`). A bare numeric id gives `story-<id>`, and a URL without
/// a usable path falls back to the host.
pub fn slug_from_url(url: &Url) -> String {
    let segments: Vec<&str> = url
        .path_segments()
        .map(|segments| segments.filter(|s| !s.is_empty()).collect())
        .unwrap_or_default();
    let series_segments = match segments.iter().position(|s| *s == UNIT_SEGMENT) {
        Some(idx) => &segments[..idx],
        None => &segments[..],
    };

    let named = series_segments.iter().rev().find(|segment| {
        !segment.chars().all(|c| c.is_ascii_digit())
            && !GENERIC_SEGMENTS.contains(&segment.to_ascii_lowercase().as_str())
    });
    if let Some(named) = named {
        let slug = sanitize_slug(named);
        if !slug.is_empty() {
            return slug;
        }
    }

    let numeric = series_segments
        .iter()
        .rev()
        .find(|segment| segment.chars().all(|c| c.is_ascii_digit()));
    if let Some(id) = numeric {
        return format!("story-{id}");
    }

    let host = url.host_str().unwrap_or("series");
    sanitize_slug(host)
}

/// Lowercases and reduces to `[a-z0-9_-]`, collapsing runs of separators.
pub fn sanitize_slug(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut last_was_dash = false;
    for ch in input.trim().chars() {
        let ch = ch.to_ascii_lowercase();
        if ch.is_ascii_alphanumeric() || ch == '_' {
            out.push(ch);
            last_was_dash = false;
        } else if !last_was_dash && !out.is_empty() {
            out.push('-');
            last_was_dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    out.truncate(MAX_SLUG_LEN);
    out
}

/// "my-story_name" -> "My Story Name".
pub fn title_from_slug(slug: &str) -> String {
    slug.split(['-', '_'])
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
