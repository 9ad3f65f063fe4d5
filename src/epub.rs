use std::io::Write as _;
use std::path::Path;

use anyhow::Context as _;
use chrono::Utc;
use zip::write::SimpleFileOptions;

use crate::formats::{ProcessedUnit, SeriesMetadata};
use crate::workspace;
use crate::xhtml::{self, xml_escape};

/// Writes one volume artifact. Implementations must either produce the
/// complete file at `out_path` or return an error.
pub trait Packager: Send + Sync {
    fn write_volume(
        &self,
        series: &SeriesMetadata,
        units: &[ProcessedUnit],
        out_path: &Path,
    ) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct CoverImage {
    pub bytes: Vec<u8>,
    pub media_type: &'static str,
    pub extension: &'static str,
}

impl CoverImage {
    /// Sniffs the image type from its magic bytes, falling back to the
    /// source URL's extension. Unknown types are rejected.
    pub fn from_bytes(bytes: Vec<u8>, source_url: &str) -> Option<Self> {
        let (media_type, extension) = sniff_image(&bytes).or_else(|| {
            let path = source_url.split(['?', '#']).next().unwrap_or_default();
            match media_type_for_asset(path) {
                "application/octet-stream" => None,
                media_type => Some((media_type, extension_for(media_type))),
            }
        })?;
        Some(Self {
            bytes,
            media_type,
            extension,
        })
    }
}

fn sniff_image(bytes: &[u8]) -> Option<(&'static str, &'static str)> {
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some(("image/jpeg", "jpg"))
    } else if bytes.starts_with(b"\x89PNG\r\n\x1a\n") {
        Some(("image/png", "png"))
    } else if bytes.starts_with(b"GIF8") {
        Some(("image/gif", "gif"))
    } else if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        Some(("image/webp", "webp"))
    } else {
        None
    }
}

fn extension_for(media_type: &str) -> &'static str {
    match media_type {
        "image/png" => "png",
        "image/gif" => "gif",
        "image/svg+xml" => "svg",
        "image/webp" => "webp",
        "image/avif" => "avif",
        _ => "jpg",
    }
}

/// EPUB 3 writer with an NCX fallback for older readers.
#[derive(Debug, Clone)]
pub struct EpubPackager {
    lang: String,
    cover: Option<CoverImage>,
}

impl Default for EpubPackager {
    fn default() -> Self {
        Self::new("en")
    }
}

impl EpubPackager {
    pub fn new(lang: impl Into<String>) -> Self {
        let lang = lang.into();
        let lang = if lang.trim().is_empty() {
            "und".to_owned()
        } else {
            lang.trim().to_owned()
        };
        Self { lang, cover: None }
    }

    pub fn with_cover(mut self, cover: Option<CoverImage>) -> Self {
        self.cover = cover;
        self
    }
}

impl Packager for EpubPackager {
    fn write_volume(
        &self,
        series: &SeriesMetadata,
        units: &[ProcessedUnit],
        out_path: &Path,
    ) -> anyhow::Result<()> {
        let (Some(first), Some(last)) = (units.first(), units.last()) else {
            anyhow::bail!("volume has no units: {}", out_path.display());
        };
        let base_title = series.title.as_deref().unwrap_or("Untitled Serial");
        let title = format!(
            "{base_title} (Ch {}-{})",
            first.position + 1,
            last.position + 1
        );

        let chapters = units
            .iter()
            .map(|unit| {
                let xhtml = std::fs::read_to_string(&unit.path)
                    .with_context(|| format!("read processed unit: {}", unit.path.display()))?;
                anyhow::Ok(ChapterSpec {
                    stem: format!("unit_{:05}", unit.position),
                    title: unit.title.clone(),
                    xhtml,
                })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        let book = BookSpec {
            title: &title,
            lang: &self.lang,
            series,
            uuid: uuid::Uuid::new_v4(),
            modified: Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            cover: self.cover.as_ref(),
        };

        let bytes = build_epub(&book, &chapters).context("assemble epub")?;
        workspace::write_atomic(out_path, &bytes)
            .with_context(|| format!("write epub: {}", out_path.display()))?;
        tracing::info!(path = %out_path.display(), units = units.len(), "wrote volume");
        Ok(())
    }
}

#[derive(Debug)]
struct ChapterSpec {
    stem: String,
    title: String,
    xhtml: String,
}

struct BookSpec<'a> {
    title: &'a str,
    lang: &'a str,
    series: &'a SeriesMetadata,
    uuid: uuid::Uuid,
    modified: String,
    cover: Option<&'a CoverImage>,
}

fn build_epub(book: &BookSpec<'_>, chapters: &[ChapterSpec]) -> anyhow::Result<Vec<u8>> {
    let mut zip = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));

    // `mimetype` must be the first entry and stored uncompressed.
    let mimetype_options = SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Stored)
        .unix_permissions(0o644);
    zip.start_file("mimetype", mimetype_options)
        .context("epub start_file mimetype")?;
    zip.write_all(b"application/epub+zip")
        .context("epub write mimetype")?;

    let deflated = SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .unix_permissions(0o644);

    let mut entries: Vec<(String, Vec<u8>)> = vec![
        (
            "META-INF/container.xml".to_owned(),
            render_container_xml().into_bytes(),
        ),
        (
            "OEBPS/content.opf".to_owned(),
            render_content_opf(book, chapters).into_bytes(),
        ),
        (
            "OEBPS/nav.xhtml".to_owned(),
            render_nav_xhtml(book.title, book.lang, chapters).into_bytes(),
        ),
        (
            "OEBPS/toc.ncx".to_owned(),
            render_toc_ncx(book.title, book.uuid, chapters).into_bytes(),
        ),
        ("OEBPS/style.css".to_owned(), default_style_css().into_bytes()),
    ];
    if let Some(cover) = book.cover {
        entries.push((
            format!("OEBPS/cover.{}", cover.extension),
            cover.bytes.clone(),
        ));
        entries.push((
            "OEBPS/cover.xhtml".to_owned(),
            render_cover_xhtml(book.title, book.lang, cover).into_bytes(),
        ));
    }
    for chapter in chapters {
        entries.push((
            format!("OEBPS/{}.xhtml", chapter.stem),
            chapter.xhtml.clone().into_bytes(),
        ));
    }

    for (name, data) in entries {
        zip.start_file(name.as_str(), deflated)
            .with_context(|| format!("epub start_file {name}"))?;
        zip.write_all(&data)
            .with_context(|| format!("epub write {name}"))?;
    }

    let cursor = zip.finish().context("epub finish zip")?;
    Ok(cursor.into_inner())
}

fn render_container_xml() -> String {
    r#"<?xml version="1.0" encoding="UTF-8"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles>
    <rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/>
  </rootfiles>
</container>
"#
    .to_string()
}

fn default_style_css() -> String {
    r#"@charset "utf-8";

html { font-family: serif; }
body { margin: 0; padding: 0 1.2em; line-height: 1.6; }
h1 { text-align: center; margin: 1.5em 0 1em; }
p { margin: 0 0 0.8em; text-indent: 1.2em; }
img { max-width: 100%; height: auto; }
table { border-collapse: collapse; margin: 1em 0; }
td, th { border: 1px solid #999; padding: 0.3em 0.5em; }
.cover { text-align: center; padding: 0; margin: 0; }
"#
    .to_string()
}

fn render_cover_xhtml(title: &str, lang: &str, cover: &CoverImage) -> String {
    let body = format!(
        "<div class=\"cover\"><img src=\"cover.{}\" alt=\"{}\" /></div>",
        cover.extension,
        xml_escape(title)
    );
    xhtml::wrap_document(title, lang, &body)
}

fn render_nav_xhtml(title: &str, lang: &str, chapters: &[ChapterSpec]) -> String {
    let mut body = String::new();
    body.push_str(&format!("  <h1>{}</h1>\n", xml_escape(title)));
    body.push_str("  <nav epub:type=\"toc\" id=\"toc\">\n");
    body.push_str("    <ol>\n");
    for ch in chapters {
        body.push_str(&format!(
            "      <li><a href=\"{}.xhtml\">{}</a></li>\n",
            xml_escape(&ch.stem),
            xml_escape(&ch.title)
        ));
    }
    body.push_str("    </ol>\n");
    body.push_str("  </nav>\n");
    xhtml::wrap_document(title, lang, &body)
}

fn render_toc_ncx(title: &str, uuid: uuid::Uuid, chapters: &[ChapterSpec]) -> String {
    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
    out.push_str(
        "<!DOCTYPE ncx PUBLIC \"-//NISO//DTD ncx 2005-1//EN\" \"http://www.daisy.org/z3986/2005/ncx-2005-1.dtd\">\n",
    );
    out.push_str("<ncx xmlns=\"http://www.daisy.org/z3986/2005/ncx/\" version=\"2005-1\">\n");
    out.push_str("  <head>\n");
    out.push_str(&format!(
        "    <meta name=\"dtb:uid\" content=\"urn:uuid:{uuid}\" />\n"
    ));
    out.push_str("    <meta name=\"dtb:depth\" content=\"1\" />\n");
    out.push_str("    <meta name=\"dtb:totalPageCount\" content=\"0\" />\n");
    out.push_str("    <meta name=\"dtb:maxPageNumber\" content=\"0\" />\n");
    out.push_str("  </head>\n");
    out.push_str(&format!(
        "  <docTitle><text>{}</text></docTitle>\n",
        xml_escape(title)
    ));
    out.push_str("  <navMap>\n");
    for (idx, ch) in chapters.iter().enumerate() {
        let play = idx + 1;
        out.push_str(&format!(
            "    <navPoint id=\"navPoint-{play}\" playOrder=\"{play}\">\n"
        ));
        out.push_str(&format!(
            "      <navLabel><text>{}</text></navLabel>\n",
            xml_escape(&ch.title)
        ));
        out.push_str(&format!(
            "      <content src=\"{}.xhtml\" />\n",
            xml_escape(&ch.stem)
        ));
        out.push_str("    </navPoint>\n");
    }
    out.push_str("  </navMap>\n");
    out.push_str("</ncx>\n");
    out
}

fn render_content_opf(book: &BookSpec<'_>, chapters: &[ChapterSpec]) -> String {
    let series = book.series;
    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
    out.push_str(&format!(
        "<package xmlns=\"http://www.idpf.org/2007/opf\" unique-identifier=\"bookid\" version=\"3.0\" xml:lang=\"{}\">\n",
        xml_escape(book.lang)
    ));
    out.push_str("  <metadata xmlns:dc=\"http://purl.org/dc/elements/1.1/\">\n");
    out.push_str(&format!(
        "    <dc:identifier id=\"bookid\">urn:uuid:{}</dc:identifier>\n",
        book.uuid
    ));
    out.push_str(&format!(
        "    <dc:title>{}</dc:title>\n",
        xml_escape(book.title)
    ));
    out.push_str(&format!(
        "    <dc:language>{}</dc:language>\n",
        xml_escape(book.lang)
    ));
    if let Some(author) = &series.author {
        out.push_str(&format!(
            "    <dc:creator id=\"creator\">{}</dc:creator>\n",
            xml_escape(author)
        ));
    }
    if let Some(description) = &series.description {
        out.push_str(&format!(
            "    <dc:description>{}</dc:description>\n",
            xml_escape(description)
        ));
    }
    if let Some(publisher) = &series.publisher {
        out.push_str(&format!(
            "    <dc:publisher>{}</dc:publisher>\n",
            xml_escape(publisher)
        ));
    }
    for tag in &series.tags {
        out.push_str(&format!("    <dc:subject>{}</dc:subject>\n", xml_escape(tag)));
    }
    if !series.source_url.is_empty() {
        out.push_str(&format!(
            "    <dc:source>{}</dc:source>\n",
            xml_escape(&series.source_url)
        ));
    }
    if book.cover.is_some() {
        out.push_str("    <meta name=\"cover\" content=\"cover-image\" />\n");
    }
    out.push_str(&format!(
        "    <meta property=\"dcterms:modified\">{}</meta>\n",
        xml_escape(&book.modified)
    ));
    out.push_str("  </metadata>\n");

    out.push_str("  <manifest>\n");
    out.push_str(
        "    <item id=\"nav\" href=\"nav.xhtml\" media-type=\"application/xhtml+xml\" properties=\"nav\" />\n",
    );
    out.push_str(
        "    <item id=\"ncx\" href=\"toc.ncx\" media-type=\"application/x-dtbncx+xml\" />\n",
    );
    out.push_str("    <item id=\"css\" href=\"style.css\" media-type=\"text/css\" />\n");
    if let Some(cover) = book.cover {
        out.push_str(&format!(
            "    <item id=\"cover-image\" href=\"cover.{}\" media-type=\"{}\" properties=\"cover-image\" />\n",
            cover.extension, cover.media_type
        ));
        out.push_str(
            "    <item id=\"cover\" href=\"cover.xhtml\" media-type=\"application/xhtml+xml\" />\n",
        );
    }
    for ch in chapters {
        out.push_str(&format!(
            "    <item id=\"{}\" href=\"{}.xhtml\" media-type=\"application/xhtml+xml\" />\n",
            xml_escape(&ch.stem),
            xml_escape(&ch.stem)
        ));
    }
    out.push_str("  </manifest>\n");

    out.push_str("  <spine toc=\"ncx\">\n");
    if book.cover.is_some() {
        out.push_str("    <itemref idref=\"cover\" linear=\"no\" />\n");
    }
    out.push_str("    <itemref idref=\"nav\" />\n");
    for ch in chapters {
        out.push_str(&format!(
            "    <itemref idref=\"{}\" />\n",
            xml_escape(&ch.stem)
        ));
    }
    out.push_str("  </spine>\n");
    out.push_str("</package>\n");
    out
}

fn media_type_for_asset(rel_path: &str) -> &'static str {
    let ext = Path::new(rel_path)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "webp" => "image/webp",
        "avif" => "image/avif",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read as _;

    use super::*;

    fn write_unit(dir: &Path, position: u64, title: &str) -> anyhow::Result<ProcessedUnit> {
        let path = dir.join(format!("unit_{position:05}.xhtml"));
        let body = format!("<section><h1>{}</h1><p>body</p></section>", xml_escape(title));
        std::fs::write(&path, xhtml::wrap_document(title, "en", &body))?;
        Ok(ProcessedUnit {
            position,
            source_url: format!("https://example.com/chapter/{position}"),
            title: title.to_owned(),
            path,
        })
    }

    fn read_entry(archive: &mut zip::ZipArchive<std::fs::File>, name: &str) -> anyhow::Result<String> {
        let mut out = String::new();
        archive.by_name(name)?.read_to_string(&mut out)?;
        Ok(out)
    }

    #[test]
    fn volume_has_mimetype_first_and_series_metadata() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let units = vec![
            write_unit(temp.path(), 4, "Five")?,
            write_unit(temp.path(), 5, "Six & Seven")?,
        ];
        let series = SeriesMetadata {
            source_url: "https://example.com/fiction/1/s".to_owned(),
            title: Some("My Story".to_owned()),
            author: Some("Jane".to_owned()),
            tags: vec!["Fantasy".to_owned()],
            publisher: Some("Example Press".to_owned()),
            ..SeriesMetadata::default()
        };
        let out = temp.path().join("volumes").join("s_vol001.epub");
        let cover = CoverImage::from_bytes(b"\x89PNG\r\n\x1a\nrest".to_vec(), "https://x/c")
            .expect("png sniffed");
        EpubPackager::default()
            .with_cover(Some(cover))
            .write_volume(&series, &units, &out)?;

        let mut archive = zip::ZipArchive::new(std::fs::File::open(&out)?)?;
        assert_eq!(archive.by_index(0)?.name(), "mimetype");
        let opf = read_entry(&mut archive, "OEBPS/content.opf")?;
        assert!(opf.contains("<dc:title>My Story (Ch 5-6)</dc:title>"));
        assert!(opf.contains("<dc:creator id=\"creator\">Jane</dc:creator>"));
        assert!(opf.contains("<dc:subject>Fantasy</dc:subject>"));
        assert!(opf.contains("properties=\"cover-image\""));
        let nav = read_entry(&mut archive, "OEBPS/nav.xhtml")?;
        assert!(nav.contains("Six &amp; Seven"));
        assert!(archive.by_name("OEBPS/unit_00004.xhtml").is_ok());
        assert!(archive.by_name("OEBPS/cover.png").is_ok());
        Ok(())
    }

    #[test]
    fn missing_unit_file_fails_without_output() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let units = vec![ProcessedUnit {
            position: 0,
            source_url: "u".to_owned(),
            title: "t".to_owned(),
            path: temp.path().join("missing.xhtml"),
        }];
        let out = temp.path().join("v.epub");
        assert!(
            EpubPackager::default()
                .write_volume(&SeriesMetadata::default(), &units, &out)
                .is_err()
        );
        assert!(!out.exists());
        Ok(())
    }

    #[test]
    fn cover_type_falls_back_to_url_extension() {
        let cover = CoverImage::from_bytes(vec![1, 2, 3], "https://x/cover.webp?size=2").expect("webp");
        assert_eq!(cover.media_type, "image/webp");
        assert!(CoverImage::from_bytes(vec![1, 2, 3], "https://x/cover").is_none());
    }
}
