//! Content extraction: raw bytes + declared content type → normalized text.
//!
//! Dispatches on the normalized MIME type. PDF runs a primary extractor
//! with a secondary fallback; OOXML is unpacked with `zip` + `quick-xml`;
//! HTML keeps only visible text, preferring `<main>`/`<article>` content.
//! Everything else is treated as text (UTF-8, then Latin-1 — never fatal).
//!
//! All output is normalized: CRLF/CR collapsed to LF, lines trimmed,
//! blank lines dropped.

use std::io::Read;

use scraper::{ElementRef, Html, Selector};

use crate::error::PipelineError;

pub const MIME_PDF: &str = "application/pdf";
pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
pub const MIME_DOC: &str = "application/msword";
pub const MIME_HTML: &str = "text/html";
pub const MIME_XHTML: &str = "application/xhtml+xml";

/// Decompressed-bytes cap for a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

pub fn is_html_type(content_type: &str) -> bool {
    matches!(content_type, MIME_HTML | MIME_XHTML)
}

pub fn is_supported_type(content_type: &str) -> bool {
    matches!(
        content_type,
        MIME_HTML | MIME_XHTML | MIME_PDF | MIME_DOCX | MIME_DOC
    )
}

/// Lowercase the MIME type and strip parameters (`; charset=...`).
pub fn normalize_mime(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_lowercase()
}

/// Extraction result: normalized text plus the page title for HTML input.
#[derive(Debug, Clone)]
pub struct ParsedDocument {
    pub text: String,
    pub title: Option<String>,
}

/// Extract normalized plain text from raw bytes.
pub fn extract_text(bytes: &[u8], content_type: &str) -> Result<ParsedDocument, PipelineError> {
    let mime = normalize_mime(content_type);
    match mime.as_str() {
        MIME_PDF => Ok(ParsedDocument {
            text: normalize_text(&extract_pdf(bytes)?),
            title: None,
        }),
        MIME_DOCX | MIME_DOC => Ok(ParsedDocument {
            text: normalize_text(&extract_docx(bytes)?),
            title: None,
        }),
        MIME_HTML | MIME_XHTML => {
            let html = decode_text(bytes);
            let doc = Html::parse_document(&html);
            Ok(ParsedDocument {
                text: normalize_text(&visible_text(&doc)),
                title: title_of(&doc),
            })
        }
        _ => Ok(ParsedDocument {
            text: normalize_text(&decode_text(bytes)),
            title: None,
        }),
    }
}

// ============ PDF ============

/// Per-page extraction through the primary extractor, falling back to the
/// secondary when the primary errors or yields only whitespace. Fails
/// only when both extractors come up empty.
fn extract_pdf(bytes: &[u8]) -> Result<String, PipelineError> {
    let primary = match pdf_extract::extract_text_from_mem(bytes) {
        Ok(text) if !text.trim().is_empty() => return Ok(text),
        Ok(_) => "primary extractor returned empty text".to_string(),
        Err(e) => e.to_string(),
    };

    match extract_pdf_fallback(bytes) {
        Ok(text) => Ok(text),
        Err(secondary) => Err(PipelineError::Parse(format!(
            "PDF extraction failed: {}; fallback: {}",
            primary, secondary
        ))),
    }
}

fn extract_pdf_fallback(bytes: &[u8]) -> Result<String, String> {
    let doc = lopdf::Document::load_mem(bytes).map_err(|e| e.to_string())?;

    let mut pages = Vec::new();
    for (page_no, _object_id) in doc.get_pages() {
        let text = doc.extract_text(&[page_no]).map_err(|e| e.to_string())?;
        if !text.trim().is_empty() {
            pages.push(text);
        }
    }

    if pages.is_empty() {
        return Err("no readable page text".to_string());
    }
    Ok(pages.join("\n"))
}

// ============ DOCX / legacy DOC ============

/// OOXML body text: `word/document.xml` → the `<w:t>` runs, with a line
/// break at every paragraph end. Legacy binary `.doc` files are not ZIP
/// archives and fail here, which is fatal for the document.
fn extract_docx(bytes: &[u8]) -> Result<String, PipelineError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| PipelineError::Parse(format!("OOXML archive: {}", e)))?;

    let entry = archive
        .by_name("word/document.xml")
        .map_err(|e| PipelineError::Parse(format!("word/document.xml: {}", e)))?;

    let mut xml = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut xml)
        .map_err(|e| PipelineError::Parse(format!("word/document.xml: {}", e)))?;
    if xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(PipelineError::Parse(
            "word/document.xml exceeds size limit".to_string(),
        ));
    }

    extract_paragraph_runs(&xml)
}

fn extract_paragraph_runs(xml: &[u8]) -> Result<String, PipelineError> {
    // Text is only collected inside <w:t> runs, so inter-tag whitespace
    // never leaks; runs keep their own spacing.
    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut in_text_run = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => {
                if e.local_name().as_ref() == b"t" {
                    in_text_run = true;
                }
            }
            Ok(quick_xml::events::Event::Text(t)) if in_text_run => {
                out.push_str(t.unescape().unwrap_or_default().as_ref());
            }
            Ok(quick_xml::events::Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text_run = false,
                b"p" => out.push('\n'),
                _ => {}
            },
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(PipelineError::Parse(format!("OOXML body: {}", e))),
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}

// ============ HTML ============

/// Visible page text. Prefers `<main>`, then `<article>`, then `<body>`,
/// then the whole document; text inside `script`/`style`/`noscript`/
/// `template` subtrees is never emitted.
pub fn visible_text(doc: &Html) -> String {
    let root = select_first(doc, "main")
        .or_else(|| select_first(doc, "article"))
        .or_else(|| select_first(doc, "body"))
        .unwrap_or_else(|| doc.root_element());

    let mut out = String::new();
    for node in root.descendants() {
        if let Some(text) = node.value().as_text() {
            let hidden = node.ancestors().any(|ancestor| {
                ancestor.value().as_element().is_some_and(|el| {
                    matches!(el.name(), "script" | "style" | "noscript" | "template")
                })
            });
            if !hidden {
                out.push_str(text);
                out.push('\n');
            }
        }
    }
    out
}

/// The `<title>` text, trimmed; `None` when absent or blank.
pub fn title_of(doc: &Html) -> Option<String> {
    let el = select_first(doc, "title")?;
    let title = el.text().collect::<String>().trim().to_string();
    if title.is_empty() {
        None
    } else {
        Some(title)
    }
}

/// Raw `href` values of all anchors, in document order.
pub fn html_links(doc: &Html) -> Vec<String> {
    let Some(selector) = Selector::parse("a[href]").ok() else {
        return Vec::new();
    };
    doc.select(&selector)
        .filter_map(|a| a.value().attr("href"))
        .map(|href| href.trim().to_string())
        .filter(|href| !href.is_empty())
        .collect()
}

fn select_first<'a>(doc: &'a Html, css: &str) -> Option<ElementRef<'a>> {
    let selector = Selector::parse(css).ok()?;
    doc.select(&selector).next()
}

// ============ Plain text ============

/// UTF-8 with a Latin-1 fallback. Latin-1 maps every byte, so decoding
/// never fails.
pub fn decode_text(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => bytes.iter().map(|&b| b as char).collect(),
    }
}

/// Collapse CRLF/CR to LF, trim every line, drop blank lines.
pub fn normalize_text(raw: &str) -> String {
    raw.replace("\r\n", "\n")
        .replace('\r', "\n")
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}
