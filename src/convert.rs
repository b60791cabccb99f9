use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use thiserror::Error;
use tracing::{debug, warn};

use crate::chunk::{chunk_text, ChunkMode, ChunkPolicy};
use crate::config::RepocapsuleConfig;
use crate::decode::decode_bytes;
use crate::interfaces::{Extractor, FileExtractor, FileItem, RepoContext};
use crate::records::{build_record, Record, RecordFields};

#[derive(Debug, Error)]
pub enum HandlerError {
    /// The format was recognized but this build has no handler for it; the
    /// dispatcher treats this as a silent skip.
    #[error("unsupported binary: {0}")]
    Unsupported(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Handler for a binary format, dispatched by an ordered sniff registry.
/// The first handler whose `sniff` matches wins; a handler error falls
/// through to the generic text path.
pub trait BytesHandler: Send + Sync {
    fn name(&self) -> &'static str;
    fn sniff(&self, data: &[u8], rel_path: &str) -> bool;
    fn handle(
        &self,
        data: &[u8],
        rel_path: &str,
        context: Option<&RepoContext>,
        policy: &ChunkPolicy,
    ) -> Result<Option<Vec<Record>>, HandlerError>;
}

/// Built-in PDF registration. Real extraction is a plug-in; this build
/// recognizes the format so the dispatcher can skip it cleanly.
pub struct PdfBytesHandler;

impl BytesHandler for PdfBytesHandler {
    fn name(&self) -> &'static str {
        "pdf"
    }

    fn sniff(&self, data: &[u8], rel_path: &str) -> bool {
        rel_path.to_lowercase().ends_with(".pdf") || data.starts_with(b"%PDF-")
    }

    fn handle(
        &self,
        _data: &[u8],
        _rel_path: &str,
        _context: Option<&RepoContext>,
        _policy: &ChunkPolicy,
    ) -> Result<Option<Vec<Record>>, HandlerError> {
        Err(HandlerError::Unsupported(
            "pdf support is not installed".to_string(),
        ))
    }
}

pub struct EvtxBytesHandler;

impl BytesHandler for EvtxBytesHandler {
    fn name(&self) -> &'static str {
        "evtx"
    }

    fn sniff(&self, data: &[u8], rel_path: &str) -> bool {
        if rel_path.to_lowercase().ends_with(".evtx") || data.starts_with(b"ElfFile") {
            return true;
        }
        let head = &data[..data.len().min(1_048_576)];
        head.windows(7).any(|w| w == b"ElfChnk")
    }

    fn handle(
        &self,
        _data: &[u8],
        _rel_path: &str,
        _context: Option<&RepoContext>,
        _policy: &ChunkPolicy,
    ) -> Result<Option<Vec<Record>>, HandlerError> {
        Err(HandlerError::Unsupported(
            "evtx support is not installed".to_string(),
        ))
    }
}

// ---------------------------------------------------------------------------
// Mode / format inference
// ---------------------------------------------------------------------------

const MD_EXTS: &[&str] = &["md", "mdx", "markdown"];
const DOC_EXTS: &[&str] = &["md", "mdx", "markdown", "rst", "adoc", "txt"];

/// `(mode, fmt)` hints from the filename; everything non-doc chunks as code.
pub fn infer_mode_and_fmt(rel_path: &str) -> (ChunkMode, Option<&'static str>) {
    let ext = std::path::Path::new(rel_path)
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    if MD_EXTS.contains(&ext.as_str()) {
        return (ChunkMode::Doc, Some("md"));
    }
    if ext == "rst" {
        return (ChunkMode::Doc, Some("rst"));
    }
    if DOC_EXTS.contains(&ext.as_str()) {
        return (ChunkMode::Doc, None);
    }
    (ChunkMode::Code, None)
}

// ---------------------------------------------------------------------------
// Record creation for a single file
// ---------------------------------------------------------------------------

pub struct FileTextInput<'a> {
    pub text: &'a str,
    pub rel_path: &'a str,
    pub encoding: &'a str,
    pub had_replacement: bool,
}

/// Turn decoded text into records: user extractors first (first non-empty
/// batch wins, failures are logged and skipped), then format-aware chunking
/// with one record per chunk.
pub fn make_records_for_file(
    input: &FileTextInput<'_>,
    policy: &ChunkPolicy,
    context: Option<&RepoContext>,
    extractors: &[Box<dyn Extractor>],
) -> Vec<Record> {
    let rp = input.rel_path.replace('\\', "/");

    for ex in extractors {
        match ex.extract(input.text, &rp, context) {
            Ok(Some(records)) if !records.is_empty() => return records,
            Ok(_) => {}
            Err(e) => {
                warn!("extractor {} failed for {}: {}", ex.name(), rp, e);
            }
        }
    }

    let (mode, fmt) = infer_mode_and_fmt(&rp);
    let chunks = chunk_text(input.text, mode, fmt, policy);

    let n = chunks.len();
    chunks
        .into_iter()
        .enumerate()
        .map(|(i, ch)| {
            build_record(
                &ch.text,
                &rp,
                &RecordFields {
                    repo_full_name: context.and_then(|c| c.repo_full_name.as_deref()),
                    repo_url: context.and_then(|c| c.repo_url.as_deref()),
                    license_id: context.and_then(|c| c.license_id.as_deref()),
                    lang: ch.lang.as_deref(),
                    encoding: input.encoding,
                    had_replacement: input.had_replacement,
                    chunk_id: Some(i + 1),
                    n_chunks: Some(n),
                    extra_meta: None,
                },
            )
        })
        .collect()
}

/// bytes → records: registered bytes handlers first, then the generic
/// decode/chunk/build path.
pub fn iter_records_from_bytes(
    data: &[u8],
    rel_path: &str,
    config: &RepocapsuleConfig,
    context: Option<&RepoContext>,
    handlers: &[Box<dyn BytesHandler>],
    extractors: &[Box<dyn Extractor>],
    handler_errors: &AtomicU64,
) -> Vec<Record> {
    for handler in handlers {
        if !handler.sniff(data, rel_path) {
            continue;
        }
        match handler.handle(data, rel_path, context, &config.chunk) {
            Ok(Some(records)) if !records.is_empty() => return records,
            Ok(_) => {}
            Err(HandlerError::Unsupported(reason)) => {
                debug!("skipping {}: {}", rel_path, reason);
                return Vec::new();
            }
            Err(HandlerError::Other(e)) => {
                handler_errors.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "bytes handler {} failed for {}: {}; falling through to text path",
                    handler.name(),
                    rel_path,
                    e
                );
            }
        }
        break; // first sniff match wins
    }

    let decoded = decode_bytes(data, &config.decode);
    make_records_for_file(
        &FileTextInput {
            text: &decoded.text,
            rel_path,
            encoding: &decoded.encoding,
            had_replacement: decoded.had_replacement,
        },
        &config.chunk,
        context,
        extractors,
    )
}

/// Default `FileExtractor`: bytes-handler dispatch plus decode/chunk/build.
pub struct DefaultExtractor {
    handlers: Arc<Vec<Box<dyn BytesHandler>>>,
    extractors: Vec<Box<dyn Extractor>>,
    handler_errors: AtomicU64,
}

impl DefaultExtractor {
    pub fn new(handlers: Arc<Vec<Box<dyn BytesHandler>>>, extractors: Vec<Box<dyn Extractor>>) -> Self {
        Self {
            handlers,
            extractors,
            handler_errors: AtomicU64::new(0),
        }
    }
}

impl FileExtractor for DefaultExtractor {
    fn extract(
        &self,
        item: &FileItem,
        config: &RepocapsuleConfig,
        context: Option<&RepoContext>,
    ) -> Result<Vec<Record>> {
        Ok(iter_records_from_bytes(
            &item.data,
            &item.path,
            config,
            context,
            &self.handlers,
            &self.extractors,
            &self.handler_errors,
        ))
    }

    fn handler_error_count(&self) -> u64 {
        self.handler_errors.load(Ordering::Relaxed)
    }
}
