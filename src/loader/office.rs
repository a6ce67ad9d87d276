//! Binary document loaders: PDF and OOXML (docx, pptx, xlsx).
//!
//! PDF text comes from `pdf-extract`; pages are split on form feeds when the
//! extractor emits them. OOXML files are ZIP archives whose XML parts are
//! streamed through `quick-xml`. Every ZIP entry read is bounded to guard
//! against decompression bombs.
//!
//! OOXML titles come from `docProps/core.xml` when present.

use std::io::Read;
use std::path::Path;

use localrag_core::error::LoadError;
use localrag_core::models::{LoadedText, Section};
use quick_xml::events::Event;

use super::Loader;

/// Maximum sheets to process in an xlsx.
const XLSX_MAX_SHEETS: usize = 100;
/// Maximum cells to process per sheet.
const XLSX_MAX_CELLS_PER_SHEET: usize = 100_000;
/// Maximum decompressed bytes to read from a single ZIP entry.
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

type Archive<'a> = zip::ZipArchive<std::io::Cursor<&'a [u8]>>;

fn corrupt(format: &str, message: impl std::fmt::Display) -> LoadError {
    LoadError::Corrupt {
        format: format.to_string(),
        message: message.to_string(),
    }
}

/// Concatenate parts with blank lines, recording one section per part.
fn join_parts(parts: Vec<(String, String)>) -> LoadedText {
    let mut text = String::new();
    let mut sections = Vec::new();
    let mut pos = 0usize;
    for (label, body) in parts {
        let body = body.trim();
        if body.is_empty() {
            continue;
        }
        if !text.is_empty() {
            text.push_str("\n\n");
            pos += 2;
        }
        let len = body.chars().count();
        sections.push(Section {
            label,
            start: pos,
            end: pos + len,
        });
        text.push_str(body);
        pos += len;
    }
    LoadedText {
        text,
        title: None,
        sections,
    }
}

// ============ PDF ============

pub struct PdfLoader;

impl Loader for PdfLoader {
    fn format(&self) -> &'static str {
        "pdf"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["pdf"]
    }

    fn load(&self, _path: &Path, bytes: &[u8]) -> Result<LoadedText, LoadError> {
        // pdf-extract panics on some malformed inputs.
        let extracted =
            std::panic::catch_unwind(|| pdf_extract::extract_text_from_mem(bytes))
                .map_err(|_| corrupt("pdf", "extractor panicked on malformed input"))?
                .map_err(|e| corrupt("pdf", e))?;

        if !extracted.contains('\x0c') {
            return Ok(LoadedText {
                text: extracted.trim().to_string(),
                title: None,
                sections: Vec::new(),
            });
        }
        let pages = extracted
            .split('\x0c')
            .enumerate()
            .map(|(i, page)| (format!("page {}", i + 1), page.to_string()))
            .collect();
        Ok(join_parts(pages))
    }
}

// ============ OOXML helpers ============

fn open_archive<'a>(format: &str, bytes: &'a [u8]) -> Result<Archive<'a>, LoadError> {
    zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(|e| corrupt(format, e))
}

fn read_entry_bounded(
    format: &str,
    archive: &mut Archive<'_>,
    name: &str,
) -> Result<Vec<u8>, LoadError> {
    let entry = archive.by_name(name).map_err(|e| corrupt(format, e))?;
    let mut out = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(|e| corrupt(format, e))?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(corrupt(
            format,
            format!("ZIP entry {} exceeds size limit ({} bytes)", name, MAX_XML_ENTRY_BYTES),
        ));
    }
    Ok(out)
}

/// Numbered part names (`prefix1.xml`, `prefix2.xml`, ...) in numeric order.
fn numbered_parts(archive: &Archive<'_>, prefix: &str) -> Vec<String> {
    let mut names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with(prefix) && n.ends_with(".xml"))
        .map(|s| s.to_string())
        .collect();
    names.sort_by_key(|name| {
        name.trim_start_matches(prefix)
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });
    names
}

/// `dc:title` from `docProps/core.xml`; absent or unreadable means no title.
fn core_title(archive: &mut Archive<'_>) -> Option<String> {
    let xml = read_entry_bounded("ooxml", archive, "docProps/core.xml").ok()?;
    let mut reader = quick_xml::Reader::from_reader(xml.as_slice());
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut in_title = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"title" => in_title = true,
            Ok(Event::Text(te)) if in_title => {
                let title = te.unescape().ok()?.trim().to_string();
                return (!title.is_empty()).then_some(title);
            }
            Ok(Event::End(_)) => in_title = false,
            Ok(Event::Eof) | Err(_) => return None,
            _ => {}
        }
        buf.clear();
    }
}

/// Text of every `<t>` element; a newline after each element named
/// `block` (paragraphs in Word and slides).
fn text_elements(format: &str, xml: &[u8], block: &[u8]) -> Result<String, LoadError> {
    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(false);
    let mut buf = Vec::new();
    let mut in_t = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_t = true,
            Ok(Event::Text(te)) if in_t => {
                let text = te.unescape().map_err(|e| corrupt(format, e))?;
                out.push_str(&text);
            }
            Ok(Event::End(e)) => {
                let name = e.local_name();
                if name.as_ref() == b"t" {
                    in_t = false;
                } else if name.as_ref() == block && !out.ends_with('\n') {
                    out.push('\n');
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(corrupt(format, e)),
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}

// ============ DOCX ============

pub struct DocxLoader;

impl Loader for DocxLoader {
    fn format(&self) -> &'static str {
        "docx"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["docx"]
    }

    fn load(&self, _path: &Path, bytes: &[u8]) -> Result<LoadedText, LoadError> {
        let mut archive = open_archive(self.format(), bytes)?;
        let xml = read_entry_bounded(self.format(), &mut archive, "word/document.xml")?;
        let text = text_elements(self.format(), &xml, b"p")?;
        Ok(LoadedText {
            text: text.trim().to_string(),
            title: core_title(&mut archive),
            sections: Vec::new(),
        })
    }
}

// ============ PPTX ============

pub struct PptxLoader;

impl Loader for PptxLoader {
    fn format(&self) -> &'static str {
        "pptx"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["pptx"]
    }

    fn load(&self, _path: &Path, bytes: &[u8]) -> Result<LoadedText, LoadError> {
        let mut archive = open_archive(self.format(), bytes)?;
        let mut slides = Vec::new();
        for (i, name) in numbered_parts(&archive, "ppt/slides/slide")
            .into_iter()
            .enumerate()
        {
            let xml = read_entry_bounded(self.format(), &mut archive, &name)?;
            let text = text_elements(self.format(), &xml, b"p")?;
            slides.push((format!("slide {}", i + 1), text));
        }
        let mut loaded = join_parts(slides);
        loaded.title = core_title(&mut archive);
        Ok(loaded)
    }
}

// ============ XLSX ============

pub struct XlsxLoader;

impl Loader for XlsxLoader {
    fn format(&self) -> &'static str {
        "xlsx"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["xlsx"]
    }

    fn load(&self, _path: &Path, bytes: &[u8]) -> Result<LoadedText, LoadError> {
        let mut archive = open_archive(self.format(), bytes)?;
        let shared = if archive.file_names().any(|n| n == "xl/sharedStrings.xml") {
            let xml = read_entry_bounded(self.format(), &mut archive, "xl/sharedStrings.xml")?;
            shared_strings(&xml)?
        } else {
            Vec::new()
        };

        let mut sheets = Vec::new();
        for (i, name) in numbered_parts(&archive, "xl/worksheets/sheet")
            .into_iter()
            .take(XLSX_MAX_SHEETS)
            .enumerate()
        {
            let xml = read_entry_bounded(self.format(), &mut archive, &name)?;
            sheets.push((format!("sheet {}", i + 1), sheet_cells(&xml, &shared)?));
        }
        let mut loaded = join_parts(sheets);
        loaded.title = core_title(&mut archive);
        Ok(loaded)
    }
}

fn shared_strings(xml: &[u8]) -> Result<Vec<String>, LoadError> {
    let mut strings = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut current: Option<String> = None;
    let mut in_t = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"si" => current = Some(String::new()),
                b"t" => in_t = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_t => {
                if let Some(s) = current.as_mut() {
                    s.push_str(&te.unescape().map_err(|e| corrupt("xlsx", e))?);
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"si" => strings.extend(current.take()),
                b"t" => in_t = false,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(corrupt("xlsx", e)),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

/// Cell values of one sheet, one row per line, cells tab-separated.
fn sheet_cells(xml: &[u8], shared: &[String]) -> Result<String, LoadError> {
    let mut rows: Vec<String> = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut in_value = false;
    let mut cell_type: Option<Vec<u8>> = None;
    let mut cells = 0usize;
    loop {
        if cells >= XLSX_MAX_CELLS_PER_SHEET {
            break;
        }
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"c" => {
                    cell_type = e
                        .attributes()
                        .flatten()
                        .find(|a| a.key.as_ref() == b"t")
                        .map(|a| a.value.into_owned());
                }
                b"v" | b"t" => in_value = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_value => {
                let raw = te.unescape().map_err(|e| corrupt("xlsx", e))?;
                let raw = raw.trim();
                let value = match cell_type.as_deref() {
                    Some(b"s") => raw
                        .parse::<usize>()
                        .ok()
                        .and_then(|i| shared.get(i).cloned()),
                    _ => Some(raw.to_string()),
                };
                if let Some(v) = value.filter(|v| !v.is_empty()) {
                    row.push(v);
                    cells += 1;
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"v" | b"t" => in_value = false,
                b"c" => cell_type = None,
                b"row" => {
                    if !row.is_empty() {
                        rows.push(row.join("\t"));
                        row.clear();
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(corrupt("xlsx", e)),
            _ => {}
        }
        buf.clear();
    }
    if !row.is_empty() {
        rows.push(row.join("\t"));
    }
    Ok(rows.join("\n"))
}
