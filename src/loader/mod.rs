//! Format loaders and the registry that dispatches to them.
//!
//! A [`Loader`] turns the bytes of one file into [`LoadedText`]: the text
//! to chunk, an optional title, and page/slide/sheet/heading sections where
//! the format has them. The [`LoaderRegistry`] maps file extensions to
//! loaders; it is built once at startup and consulted per file.
//!
//! | Format id | Extensions | Loader |
//! |-----------|------------|--------|
//! | `text` | `txt`, `text`, `log` | [`PlainTextLoader`] |
//! | `markdown` | `md`, `markdown` | [`MarkdownLoader`] |
//! | `pdf` | `pdf` | [`office::PdfLoader`] |
//! | `docx` | `docx` | [`office::DocxLoader`] |
//! | `pptx` | `pptx` | [`office::PptxLoader`] |
//! | `xlsx` | `xlsx` | [`office::XlsxLoader`] |
//!
//! Loaders never retry; a corrupt file will not become readable.

pub mod office;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use localrag_core::error::LoadError;
use localrag_core::models::{LoadedText, Section};

/// Extracts text from one file format.
pub trait Loader: Send + Sync {
    /// Format identifier stored on the document (e.g. `"pdf"`).
    fn format(&self) -> &'static str;

    /// Lower-case file extensions handled, without the dot.
    fn extensions(&self) -> &'static [&'static str];

    fn load(&self, path: &Path, bytes: &[u8]) -> Result<LoadedText, LoadError>;
}

/// Extension → loader dispatch table.
#[derive(Clone, Default)]
pub struct LoaderRegistry {
    by_extension: HashMap<String, Arc<dyn Loader>>,
}

impl LoaderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in loader.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(PlainTextLoader));
        registry.register(Arc::new(MarkdownLoader));
        registry.register(Arc::new(office::PdfLoader));
        registry.register(Arc::new(office::DocxLoader));
        registry.register(Arc::new(office::PptxLoader));
        registry.register(Arc::new(office::XlsxLoader));
        registry
    }

    /// Add a loader; later registrations win for shared extensions.
    pub fn register(&mut self, loader: Arc<dyn Loader>) {
        for ext in loader.extensions() {
            self.by_extension.insert(ext.to_string(), loader.clone());
        }
    }

    pub fn resolve(&self, path: &Path) -> Option<Arc<dyn Loader>> {
        let ext = path.extension()?.to_string_lossy().to_lowercase();
        self.by_extension.get(&ext).cloned()
    }

    /// Format id for `path`, or `None` if unsupported.
    pub fn format_of(&self, path: &Path) -> Option<&'static str> {
        self.resolve(path).map(|l| l.format())
    }

    /// Load `bytes` read from `path` with the matching loader.
    pub fn load(&self, path: &Path, bytes: &[u8]) -> Result<LoadedText, LoadError> {
        let loader = self.resolve(path).ok_or_else(|| {
            LoadError::UnsupportedFormat(
                path.extension()
                    .map(|e| e.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "(no extension)".to_string()),
            )
        })?;
        loader.load(path, bytes)
    }
}

fn decode_utf8(format: &str, bytes: &[u8]) -> Result<String, LoadError> {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    String::from_utf8(bytes.to_vec()).map_err(|e| LoadError::Corrupt {
        format: format.to_string(),
        message: format!("not valid UTF-8: {}", e.utf8_error()),
    })
}

// ============ Plain text ============

pub struct PlainTextLoader;

impl Loader for PlainTextLoader {
    fn format(&self) -> &'static str {
        "text"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["txt", "text", "log"]
    }

    fn load(&self, _path: &Path, bytes: &[u8]) -> Result<LoadedText, LoadError> {
        Ok(LoadedText {
            text: decode_utf8(self.format(), bytes)?,
            title: None,
            sections: Vec::new(),
        })
    }
}

// ============ Markdown ============

/// Markdown loader.
///
/// YAML front matter is stripped from the text; its `title:` key, or else
/// the first level-one heading, becomes the title. Every ATX heading opens a
/// section that runs to the next heading.
pub struct MarkdownLoader;

impl Loader for MarkdownLoader {
    fn format(&self) -> &'static str {
        "markdown"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["md", "markdown"]
    }

    fn load(&self, _path: &Path, bytes: &[u8]) -> Result<LoadedText, LoadError> {
        let raw = decode_utf8(self.format(), bytes)?;
        let (front_title, body) = split_front_matter(&raw);
        let (heading_title, sections) = heading_sections(body);
        Ok(LoadedText {
            text: body.to_string(),
            title: front_title.or(heading_title),
            sections,
        })
    }
}

/// Returns the front-matter title, if any, and the text after the block.
fn split_front_matter(raw: &str) -> (Option<String>, &str) {
    let Some(rest) = raw.strip_prefix("---\n").or_else(|| raw.strip_prefix("---\r\n")) else {
        return (None, raw);
    };
    let mut offset = 0usize;
    for line in rest.split_inclusive('\n') {
        let trimmed = line.trim_end();
        if trimmed == "---" || trimmed == "..." {
            let title = rest[..offset].lines().find_map(|l| {
                l.strip_prefix("title:")
                    .map(|v| v.trim().trim_matches('"').trim_matches('\'').to_string())
                    .filter(|v| !v.is_empty())
            });
            return (title, &rest[offset + line.len()..]);
        }
        offset += line.len();
    }
    (None, raw)
}

fn heading_sections(text: &str) -> (Option<String>, Vec<Section>) {
    let mut title = None;
    let mut starts: Vec<(usize, String)> = Vec::new();
    let mut char_pos = 0usize;
    let mut in_fence = false;

    for line in text.split_inclusive('\n') {
        let trimmed = line.trim();
        if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
            in_fence = !in_fence;
        } else if !in_fence {
            let level = trimmed.chars().take_while(|c| *c == '#').count();
            if (1..=6).contains(&level) && trimmed[level..].starts_with(' ') {
                let label = trimmed[level..].trim().trim_end_matches('#').trim().to_string();
                if level == 1 && title.is_none() && !label.is_empty() {
                    title = Some(label.clone());
                }
                starts.push((char_pos, label));
            }
        }
        char_pos += line.chars().count();
    }

    let total = char_pos;
    let sections = starts
        .iter()
        .enumerate()
        .map(|(i, (start, label))| Section {
            label: label.clone(),
            start: *start,
            end: starts.get(i + 1).map(|(s, _)| *s).unwrap_or(total),
        })
        .collect();
    (title, sections)
}
