//! Per-page text extraction for uploaded documents.
//!
//! [`TextExtractor`] turns raw bytes into one string per page. Pages that
//! yield no text come back as empty strings so page numbering stays
//! aligned with the source document.
//!
//! | Format | Pages |
//! |--------|-------|
//! | PDF | one per PDF page (`pdf-extract`) |
//! | DOCX | a single page, paragraphs separated by blank lines |
//! | PPTX | one per slide, in slide order |
//! | text / markdown | split on form feed, else a single page |
//!
//! Extraction is CPU-bound and synchronous; the pipeline runs it on the
//! blocking pool.

use std::io::Read;

use thiserror::Error;

pub const MIME_PDF: &str = "application/pdf";
pub const MIME_TEXT: &str = "text/plain";
pub const MIME_MARKDOWN: &str = "text/markdown";
pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
pub const MIME_PPTX: &str =
    "application/vnd.openxmlformats-officedocument.presentationml.presentation";

/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

/// Maximum slides read from a presentation.
const PPTX_MAX_SLIDES: usize = 1000;

const PAGE_BREAK: char = '\u{c}';

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExtractError {
    #[error("unsupported content-type: {0}")]
    UnsupportedContentType(String),
    #[error("content does not match declared type {declared}")]
    ContentMismatch { declared: String },
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("OOXML extraction failed: {0}")]
    Ooxml(String),
    #[error("text is not valid UTF-8")]
    Encoding,
}

impl ExtractError {
    /// Whether the failure is the uploader's fault (wrong or unsupported
    /// type) rather than a damaged file.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            ExtractError::UnsupportedContentType(_) | ExtractError::ContentMismatch { .. }
        )
    }
}

/// Turns document bytes into page texts.
pub trait TextExtractor: Send + Sync {
    /// `pages[0]` is page 1. Never panics on malformed input.
    fn extract_pages(&self, bytes: &[u8], content_type: &str)
        -> Result<Vec<String>, ExtractError>;
}

/// Extractor for every built-in format.
#[derive(Debug, Default, Clone, Copy)]
pub struct FormatExtractor;

impl TextExtractor for FormatExtractor {
    fn extract_pages(
        &self,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<Vec<String>, ExtractError> {
        match resolve_content_type(content_type, bytes)? {
            MIME_PDF => extract_pdf(bytes),
            MIME_DOCX => extract_docx(bytes).map(|text| vec![text]),
            MIME_PPTX => extract_pptx(bytes),
            MIME_TEXT | MIME_MARKDOWN => extract_plain(bytes),
            other => Err(ExtractError::UnsupportedContentType(other.to_string())),
        }
    }
}

/// Lowercased MIME type without parameters (`text/plain; charset=utf-8` → `text/plain`).
pub fn normalize_content_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Reconcile the declared type with the bytes.
///
/// A generic or missing declaration (`application/octet-stream`, empty) is
/// replaced by the sniffed type. A specific declaration must agree with
/// the content's magic bytes.
pub fn resolve_content_type(declared: &str, bytes: &[u8]) -> Result<&'static str, ExtractError> {
    let declared = normalize_content_type(declared);
    match declared.as_str() {
        "" | "application/octet-stream" => {
            sniff_content_type(bytes).ok_or(ExtractError::UnsupportedContentType(declared))
        }
        MIME_PDF if bytes.starts_with(b"%PDF-") => Ok(MIME_PDF),
        MIME_DOCX if zip_contains(bytes, "word/document.xml") => Ok(MIME_DOCX),
        MIME_PPTX if zip_contains(bytes, "ppt/presentation.xml") => Ok(MIME_PPTX),
        MIME_TEXT | MIME_MARKDOWN | "text/x-markdown" => {
            if is_binary(bytes) {
                Err(ExtractError::ContentMismatch { declared })
            } else if declared == MIME_TEXT {
                Ok(MIME_TEXT)
            } else {
                Ok(MIME_MARKDOWN)
            }
        }
        MIME_PDF | MIME_DOCX | MIME_PPTX => Err(ExtractError::ContentMismatch { declared }),
        _ => Err(ExtractError::UnsupportedContentType(declared)),
    }
}

/// Guess a supported type from magic bytes.
pub fn sniff_content_type(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(b"%PDF-") {
        Some(MIME_PDF)
    } else if zip_contains(bytes, "word/document.xml") {
        Some(MIME_DOCX)
    } else if zip_contains(bytes, "ppt/presentation.xml") {
        Some(MIME_PPTX)
    } else if !is_binary(bytes) {
        Some(MIME_TEXT)
    } else {
        None
    }
}

fn is_binary(bytes: &[u8]) -> bool {
    std::str::from_utf8(bytes).is_err() || bytes.contains(&0)
}

fn zip_contains(bytes: &[u8], entry: &str) -> bool {
    if !bytes.starts_with(b"PK\x03\x04") {
        return false;
    }
    zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map(|archive| archive.file_names().any(|n| n == entry))
        .unwrap_or(false)
}

fn extract_pdf(bytes: &[u8]) -> Result<Vec<String>, ExtractError> {
    pdf_extract::extract_text_from_mem_by_pages(bytes)
        .map(|pages| pages.into_iter().map(|p| p.trim().to_string()).collect())
        .map_err(|e| ExtractError::Pdf(e.to_string()))
}

fn extract_plain(bytes: &[u8]) -> Result<Vec<String>, ExtractError> {
    let text = std::str::from_utf8(bytes).map_err(|_| ExtractError::Encoding)?;
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    Ok(text
        .split(PAGE_BREAK)
        .map(|page| page.replace("\r\n", "\n"))
        .collect())
}

fn read_zip_entry_bounded(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
    name: &str,
    max_bytes: u64,
) -> Result<Vec<u8>, ExtractError> {
    let entry = archive
        .by_name(name)
        .map_err(|e| ExtractError::Ooxml(format!("{}: {}", name, e)))?;
    let mut out = Vec::new();
    entry
        .take(max_bytes)
        .read_to_end(&mut out)
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    if out.len() as u64 >= max_bytes {
        return Err(ExtractError::Ooxml(format!(
            "ZIP entry {} exceeds size limit ({} bytes)",
            name, max_bytes
        )));
    }
    Ok(out)
}

fn extract_docx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    let xml = read_zip_entry_bounded(&mut archive, "word/document.xml", MAX_XML_ENTRY_BYTES)?;
    collect_paragraphs(&xml, "\n\n")
}

fn extract_pptx(bytes: &[u8]) -> Result<Vec<String>, ExtractError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    let mut slide_names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with("ppt/slides/slide") && n.ends_with(".xml"))
        .map(|s| s.to_string())
        .collect();
    slide_names.sort_by_key(|name| {
        name.trim_start_matches("ppt/slides/slide")
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });

    let mut pages = Vec::with_capacity(slide_names.len());
    for name in slide_names.into_iter().take(PPTX_MAX_SLIDES) {
        let xml = read_zip_entry_bounded(&mut archive, &name, MAX_XML_ENTRY_BYTES)?;
        pages.push(collect_paragraphs(&xml, "\n")?);
    }
    Ok(pages)
}

/// Concatenate `<*:t>` text runs, ending each `<*:p>` paragraph with `separator`.
///
/// Works for both WordprocessingML (`w:`) and DrawingML (`a:`) since only
/// local names are compared.
fn collect_paragraphs(xml: &[u8], separator: &str) -> Result<String, ExtractError> {
    use quick_xml::events::Event;

    let mut out = String::new();
    let mut paragraph = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut in_text = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_text = true,
            Ok(Event::Text(te)) if in_text => {
                let text = te
                    .unescape()
                    .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
                paragraph.push_str(&text);
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => {
                    let trimmed = paragraph.trim();
                    if !trimmed.is_empty() {
                        if !out.is_empty() {
                            out.push_str(separator);
                        }
                        out.push_str(trimmed);
                    }
                    paragraph.clear();
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    let trailing = paragraph.trim();
    if !trailing.is_empty() {
        if !out.is_empty() {
            out.push_str(separator);
        }
        out.push_str(trailing);
    }
    Ok(out)
}
