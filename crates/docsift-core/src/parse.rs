//! Source-format handling ahead of chunking.
//!
//! Uploads are typed by extension and rejected early when the type is not
//! supported. Markdown and OpenAPI sources are decoded as text; PDF and DOCX
//! go through an in-memory extractor and fail the upload when extraction
//! fails. Markdown additionally goes through a clean-up pass that removes
//! presentation noise (badges, images, HTML comments, horizontal rules)
//! outside fenced code blocks.

use std::io::{Cursor, Read};
use std::path::Path;
use std::sync::LazyLock;

use anyhow::Result;
use quick_xml::events::Event;
use regex::Regex;
use thiserror::Error;

use crate::error::IndexError;
use crate::models::FileType;

/// Decompressed bytes read from one ZIP entry before giving up.
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

const DOCX_BODY_ENTRY: &str = "word/document.xml";

static BADGE_LINK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[!\[[^\]]*\]\([^)]*\)\]\([^)]*\)").expect("badge regex"));
static STANDALONE_IMAGE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^[ \t]*!\[[^\]]*\]\([^)]*\)[ \t]*$").expect("image regex"));
static HTML_COMMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<!--.*?-->").expect("comment regex"));
static IMG_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<img\b[^>]*>").expect("img regex"));
static HORIZONTAL_RULE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^[ \t]*(?:-{3,}|\*{3,}|_{3,})[ \t]*$").expect("hr regex"));
static EXCESS_BLANK_LINES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n(?:[ \t]*\n){2,}").expect("blank line regex"));

/// Text extraction failure for a binary format.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractError {
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("DOCX extraction failed: {0}")]
    Docx(String),
}

/// Map a filename to its [`FileType`] by extension (case-insensitive).
///
/// Fails with [`IndexError::InvalidParams`] for anything unsupported, so
/// the caller can reject the upload before storing or chunking it.
pub fn detect_file_type(filename: &str) -> Result<FileType> {
    let ext = Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    match ext.as_deref() {
        Some("md") | Some("markdown") => Ok(FileType::Markdown),
        Some("pdf") => Ok(FileType::Pdf),
        Some("docx") => Ok(FileType::Docx),
        Some("json") | Some("yaml") | Some("yml") => Ok(FileType::Swagger),
        Some(other) => Err(IndexError::InvalidParams(format!(
            "unsupported file type '.{}' for {}",
            other, filename
        ))
        .into()),
        None => Err(IndexError::InvalidParams(format!(
            "cannot determine file type of {} (no extension)",
            filename
        ))
        .into()),
    }
}

/// Extract and clean the text that will be chunked.
pub fn parse_document(bytes: &[u8], file_type: FileType) -> Result<String> {
    let text = extract_text(bytes, file_type)?;
    Ok(preprocess(text, file_type))
}

/// Plain text of a source file, with line endings normalized to `\n`.
///
/// Text formats are decoded lossily; PDF and DOCX fail with
/// [`ExtractError`] when the bytes cannot be read as that format.
pub fn extract_text(bytes: &[u8], file_type: FileType) -> Result<String, ExtractError> {
    let text = match file_type {
        FileType::Markdown | FileType::Swagger => return Ok(decode_text(bytes)),
        FileType::Pdf => extract_pdf(bytes)?,
        FileType::Docx => extract_docx(bytes)?,
    };
    Ok(text.replace("\r\n", "\n"))
}

/// Lossy UTF-8 decode with line endings normalized to `\n`.
pub fn decode_text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).replace("\r\n", "\n")
}

/// Format-specific clean-up; only markdown is rewritten.
pub fn preprocess(text: String, file_type: FileType) -> String {
    match file_type {
        FileType::Markdown => preprocess_markdown(&text),
        FileType::Swagger | FileType::Pdf | FileType::Docx => text,
    }
}

/// Strip markdown constructs that carry no retrievable content.
///
/// Fenced code blocks are copied through untouched.
pub fn preprocess_markdown(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for (segment, fenced) in fence_segments(text) {
        if fenced {
            out.push_str(segment);
        } else {
            out.push_str(&clean_prose(segment));
        }
    }
    out.trim().to_string()
}

fn clean_prose(text: &str) -> String {
    let text = BADGE_LINK.replace_all(text, "");
    let text = STANDALONE_IMAGE.replace_all(&text, "");
    let text = HTML_COMMENT.replace_all(&text, "");
    let text = IMG_TAG.replace_all(&text, "");
    let text = HORIZONTAL_RULE.replace_all(&text, "");
    EXCESS_BLANK_LINES.replace_all(&text, "\n\n").into_owned()
}

/// Split `text` into consecutive `(segment, fenced)` slices. A fenced
/// segment spans its opening and closing ```` ``` ```` lines; an
/// unterminated fence runs to the end.
fn fence_segments(text: &str) -> Vec<(&str, bool)> {
    let mut segments = Vec::new();
    let mut start = 0;
    let mut offset = 0;
    let mut in_fence = false;

    for line in text.split_inclusive('\n') {
        let is_fence = line.trim_start().starts_with("```");
        if is_fence && !in_fence {
            if offset > start {
                segments.push((&text[start..offset], false));
            }
            start = offset;
            in_fence = true;
        } else if is_fence && in_fence {
            let end = offset + line.len();
            segments.push((&text[start..end], true));
            start = end;
            in_fence = false;
        }
        offset += line.len();
    }
    if start < text.len() {
        segments.push((&text[start..], in_fence));
    }
    segments
}

fn extract_pdf(bytes: &[u8]) -> Result<String, ExtractError> {
    // pdf-extract panics on some malformed fonts and streams.
    match std::panic::catch_unwind(|| pdf_extract::extract_text_from_mem(bytes)) {
        Ok(result) => result.map_err(|e| ExtractError::Pdf(e.to_string())),
        Err(_) => Err(ExtractError::Pdf("malformed document".to_string())),
    }
}

fn extract_docx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive =
        zip::ZipArchive::new(Cursor::new(bytes)).map_err(|e| ExtractError::Docx(e.to_string()))?;
    let entry = archive
        .by_name(DOCX_BODY_ENTRY)
        .map_err(|e| ExtractError::Docx(format!("{}: {}", DOCX_BODY_ENTRY, e)))?;

    let mut xml = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut xml)
        .map_err(|e| ExtractError::Docx(e.to_string()))?;
    if xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ExtractError::Docx(format!(
            "{} exceeds size limit ({} bytes)",
            DOCX_BODY_ENTRY, MAX_XML_ENTRY_BYTES
        )));
    }
    docx_paragraphs(&xml)
}

/// Concatenate `<w:t>` runs, one blank-line separated paragraph per `<w:p>`.
fn docx_paragraphs(xml: &[u8]) -> Result<String, ExtractError> {
    let mut paragraphs: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut in_text = false;

    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_text = true,
            Ok(Event::Text(te)) if in_text => {
                let text = te.unescape().map_err(|e| ExtractError::Docx(e.to_string()))?;
                current.push_str(&text);
            }
            Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"tab" => current.push('\t'),
                b"br" => current.push('\n'),
                _ => {}
            },
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => {
                    let paragraph = current.trim();
                    if !paragraph.is_empty() {
                        paragraphs.push(paragraph.to_string());
                    }
                    current.clear();
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Docx(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    let tail = current.trim();
    if !tail.is_empty() {
        paragraphs.push(tail.to_string());
    }
    Ok(paragraphs.join("\n\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{classify, ErrorKind};
    use std::io::Write;

    fn docx_with_body(body: &str) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let mut zip = zip::ZipWriter::new(Cursor::new(&mut buf));
            zip.start_file(DOCX_BODY_ENTRY, zip::write::SimpleFileOptions::default())
                .unwrap();
            let xml = format!(
                "<?xml version=\"1.0\"?><w:document xmlns:w=\"http://schemas.openxmlformats.org/wordprocessingml/2006/main\"><w:body>{}</w:body></w:document>",
                body
            );
            zip.write_all(xml.as_bytes()).unwrap();
            zip.finish().unwrap();
        }
        buf
    }

    #[test]
    fn test_detects_supported_extensions() {
        assert_eq!(detect_file_type("guide.md").unwrap(), FileType::Markdown);
        assert_eq!(detect_file_type("GUIDE.MARKDOWN").unwrap(), FileType::Markdown);
        assert_eq!(detect_file_type("manual.pdf").unwrap(), FileType::Pdf);
        assert_eq!(detect_file_type("notes.docx").unwrap(), FileType::Docx);
        assert_eq!(detect_file_type("openapi.yaml").unwrap(), FileType::Swagger);
        assert_eq!(detect_file_type("openapi.yml").unwrap(), FileType::Swagger);
        assert_eq!(detect_file_type("api.json").unwrap(), FileType::Swagger);
    }

    #[test]
    fn test_rejects_unknown_extensions_as_invalid_params() {
        for name in ["script.sh", "README"] {
            let err = detect_file_type(name).unwrap_err();
            assert_eq!(classify(&err), ErrorKind::InvalidParams, "{}", name);
        }
    }

    #[test]
    fn test_markdown_cleanup_removes_noise() {
        let input = "# Title\n\n[![build](https://ci/badge.svg)](https://ci)\n\n\
                     ![diagram](img/arch.png)\n\n<!-- internal note -->\n\n\
                     Real content with <img src=\"x.png\"> inline.\n\n---\n\n\n\nMore content.";
        let out = preprocess_markdown(input);
        assert!(!out.contains("badge"));
        assert!(!out.contains("arch.png"));
        assert!(!out.contains("internal note"));
        assert!(!out.contains("<img"));
        assert!(!out.contains("---"));
        assert!(!out.contains("\n\n\n"));
        assert!(out.starts_with("# Title"));
        assert!(out.contains("Real content with  inline."));
        assert!(out.ends_with("More content."));
    }

    #[test]
    fn test_inline_images_inside_prose_are_kept() {
        let out = preprocess_markdown("See ![icon](i.png) for details.");
        assert_eq!(out, "See ![icon](i.png) for details.");
    }

    #[test]
    fn test_fenced_blocks_survive_cleanup() {
        let input = "# Config\n\n```yaml\n---\nkey: value\n---\nother: 1\n```\n";
        let out = parse_document(input.as_bytes(), FileType::Markdown).unwrap();
        assert_eq!(out, "# Config\n\n```yaml\n---\nkey: value\n---\nother: 1\n```");
    }

    #[test]
    fn test_cleanup_resumes_after_fence() {
        let input = "Intro\n\n```\n![kept](a.png)\n\n\n\nstill code\n```\n\n---\n\n![gone](b.png)\n\nOutro";
        let out = preprocess_markdown(input);
        assert!(out.contains("![kept](a.png)\n\n\n\nstill code"));
        assert!(!out.contains("b.png"));
        assert!(!out.contains("---"));
        assert!(out.ends_with("Outro"));
    }

    #[test]
    fn test_unterminated_fence_kept_to_end() {
        let input = "Text\n\n```sh\n***\necho hi";
        assert_eq!(preprocess_markdown(input), input);
    }

    #[test]
    fn test_swagger_passes_through() {
        let raw = "openapi: 3.0.0\n\n\n\ninfo:\n  title: Pets";
        assert_eq!(parse_document(raw.as_bytes(), FileType::Swagger).unwrap(), raw);
    }

    #[test]
    fn test_invalid_utf8_is_replaced_not_rejected() {
        let text = parse_document(&[b'o', b'k', 0xff, b'!'], FileType::Markdown).unwrap();
        assert!(text.starts_with("ok"));
        assert!(text.ends_with('!'));
    }

    #[test]
    fn test_docx_paragraphs_extracted() {
        let bytes = docx_with_body(
            "<w:p><w:r><w:t>Channels pass</w:t></w:r><w:r><w:t xml:space=\"preserve\"> messages.</w:t></w:r></w:p>\
             <w:p><w:r><w:t>Tom &amp; Jerry</w:t></w:r></w:p>",
        );
        let text = parse_document(&bytes, FileType::Docx).unwrap();
        assert_eq!(text, "Channels pass messages.\n\nTom & Jerry");
    }

    #[test]
    fn test_docx_without_body_is_an_error() {
        let mut buf = Vec::new();
        {
            let mut zip = zip::ZipWriter::new(Cursor::new(&mut buf));
            zip.start_file("other.xml", zip::write::SimpleFileOptions::default())
                .unwrap();
            zip.write_all(b"<x/>").unwrap();
            zip.finish().unwrap();
        }
        let err = extract_text(&buf, FileType::Docx).unwrap_err();
        assert!(matches!(err, ExtractError::Docx(_)));
    }

    #[test]
    fn test_binary_formats_reject_garbage() {
        assert!(matches!(
            extract_text(b"not a pdf", FileType::Pdf).unwrap_err(),
            ExtractError::Pdf(_)
        ));
        assert!(matches!(
            extract_text(b"not a zip", FileType::Docx).unwrap_err(),
            ExtractError::Docx(_)
        ));
        assert!(parse_document(b"not a pdf", FileType::Pdf).is_err());
    }
}
