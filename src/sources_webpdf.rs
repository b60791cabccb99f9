use std::collections::HashSet;
use std::sync::{Arc, OnceLock};

use anyhow::Result;
use regex::Regex;
use tracing::{debug, warn};
use url::Url;

use crate::interfaces::{FileItem, RepoContext, Source};
use crate::safe_http::SafeHttpClient;

const DEFAULT_MAX_PDF_BYTES: u64 = 200 * 1024 * 1024;
const PAGE_FETCH_CAP: u64 = 5 * 1024 * 1024;

fn looks_like_pdf(head: &[u8]) -> bool {
    head.starts_with(b"%PDF-")
}

// ---------------------------------------------------------------------------
// Filename resolution
// ---------------------------------------------------------------------------

fn cdisp_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"(?ix)^\s*(?:inline|attachment)\s*;\s*(?:filename\*=(?P<fnstar>[^;]+)|filename=(?P<fn>[^;]+))?"#,
        )
        .unwrap()
    })
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(v) =
                u8::from_str_radix(std::str::from_utf8(&bytes[i + 1..i + 3]).unwrap_or(""), 16)
            {
                out.push(v);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Pragmatic parser for `Content-Disposition` filename / RFC 5987 filename*.
pub fn filename_from_content_disposition(hval: Option<&str>) -> Option<String> {
    let hval = hval?;
    let caps = cdisp_regex().captures(hval)?;
    let val = caps
        .name("fnstar")
        .or_else(|| caps.name("fn"))?
        .as_str()
        .trim()
        .trim_matches('"')
        .trim_matches('\'')
        .to_string();
    if val.is_empty() {
        return None;
    }
    // RFC 5987/6266: filename*=utf-8''encoded
    if let Some(idx) = val.find("''") {
        return Some(percent_decode(&val[idx + 2..]));
    }
    Some(val)
}

/// Keep just a safe basename with a conservative character set.
pub fn sanitize_name(name: &str, fallback: &str) -> String {
    let base = name
        .replace('\\', "/")
        .rsplit('/')
        .next()
        .unwrap_or(fallback)
        .to_string();
    let base = percent_decode(&base);
    let mut cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '+' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        cleaned = fallback.to_string();
    }
    cleaned
}

fn name_from_url(u: &str) -> String {
    Url::parse(u)
        .ok()
        .and_then(|url| {
            url.path_segments()
                .and_then(|segs| segs.last().map(str::to_string))
        })
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "document.pdf".to_string())
}

// ---------------------------------------------------------------------------
// WebPdfListSource
// ---------------------------------------------------------------------------

/// Downloads a list of PDF URLs and yields them as `FileItem`s.
///
/// Filenames prefer `Content-Disposition` over the URL path, are sanitized
/// with `.pdf` enforced, and collide into `name__N.pdf`. Responses that do
/// not sniff as PDF are skipped when `require_pdf` is set.
pub struct WebPdfListSource {
    urls: Vec<String>,
    client: Arc<SafeHttpClient>,
    max_pdf_bytes: u64,
    require_pdf: bool,
    add_prefix: Option<String>,
    context: Option<RepoContext>,
}

impl WebPdfListSource {
    pub fn new(urls: Vec<String>, client: Arc<SafeHttpClient>) -> Self {
        Self {
            urls,
            client,
            max_pdf_bytes: DEFAULT_MAX_PDF_BYTES,
            require_pdf: true,
            add_prefix: None,
            context: None,
        }
    }

    pub fn with_max_pdf_bytes(mut self, cap: u64) -> Self {
        self.max_pdf_bytes = cap;
        self
    }

    pub fn with_require_pdf(mut self, require: bool) -> Self {
        self.require_pdf = require;
        self
    }

    pub fn with_add_prefix(mut self, prefix: Option<String>) -> Self {
        self.add_prefix = prefix
            .map(|p| p.trim().trim_matches('/').replace('\\', "/"))
            .filter(|p| !p.is_empty());
        self
    }

    pub fn with_context(mut self, context: Option<RepoContext>) -> Self {
        self.context = context;
        self
    }
}

struct PdfDownloadIter {
    urls: std::vec::IntoIter<String>,
    client: Arc<SafeHttpClient>,
    max_pdf_bytes: u64,
    require_pdf: bool,
    add_prefix: Option<String>,
    used_names: HashSet<String>,
}

impl Iterator for PdfDownloadIter {
    type Item = Result<FileItem>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let url = self.urls.next()?;
            let body = match self.client.get_bytes(&url, self.max_pdf_bytes) {
                Ok(b) => b,
                Err(e) => {
                    // Skip on fetch error; the engine counts it.
                    debug!("pdf fetch failed for {url}: {e}");
                    return Some(Err(e));
                }
            };

            let cd_name =
                filename_from_content_disposition(body.content_disposition.as_deref());
            let mut name = sanitize_name(
                &cd_name.unwrap_or_else(|| name_from_url(&url)),
                "document.pdf",
            );
            if !name.to_lowercase().ends_with(".pdf") {
                name = format!("{name}.pdf");
            }

            if self.require_pdf && !looks_like_pdf(&body.data[..body.data.len().min(8)]) {
                debug!("skipping non-PDF response from {url}");
                continue;
            }

            // Deduplicate colliding filenames.
            let orig = name.clone();
            let mut n = 1;
            while self.used_names.contains(&name) {
                name = match orig.rsplit_once('.') {
                    Some((stem, ext)) => format!("{stem}__{n}.{ext}"),
                    None => format!("{orig}__{n}"),
                };
                n += 1;
            }
            self.used_names.insert(name.clone());

            if let Some(prefix) = &self.add_prefix {
                name = format!("{prefix}/{name}");
            }

            return Some(Ok(FileItem::new(name, body.data)));
        }
    }
}

impl Source for WebPdfListSource {
    fn iter_files<'a>(&'a mut self) -> Box<dyn Iterator<Item = Result<FileItem>> + Send + 'a> {
        Box::new(PdfDownloadIter {
            urls: self.urls.clone().into_iter(),
            client: self.client.clone(),
            max_pdf_bytes: self.max_pdf_bytes,
            require_pdf: self.require_pdf,
            add_prefix: self.add_prefix.clone(),
            used_names: HashSet::new(),
        })
    }

    fn context(&self) -> Option<RepoContext> {
        self.context.clone()
    }

    fn is_heavy(&self) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// WebPagePdfSource
// ---------------------------------------------------------------------------

fn base_href_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?is)<base\b[^>]*?href\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s>]+))"#).unwrap()
    })
}

fn link_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?is)<(?:a|area|link)\b[^>]*?href\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s>]+))"#)
            .unwrap()
    })
}

fn capture_href(caps: &regex::Captures<'_>) -> Option<String> {
    caps.get(1)
        .or_else(|| caps.get(2))
        .or_else(|| caps.get(3))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Scrapes one HTML page for PDF links, then delegates downloads to
/// `WebPdfListSource`.
pub struct WebPagePdfSource {
    page_url: String,
    client: Arc<SafeHttpClient>,
    same_domain: bool,
    max_links: usize,
    match_regex: Option<Regex>,
    include_ambiguous: bool,
    max_pdf_bytes: u64,
    require_pdf: bool,
    add_prefix: Option<String>,
    context: Option<RepoContext>,
}

impl WebPagePdfSource {
    pub fn new(page_url: impl Into<String>, client: Arc<SafeHttpClient>) -> Self {
        Self {
            page_url: page_url.into(),
            client,
            same_domain: true,
            max_links: 200,
            match_regex: None,
            include_ambiguous: false,
            max_pdf_bytes: DEFAULT_MAX_PDF_BYTES,
            require_pdf: true,
            add_prefix: None,
            context: None,
        }
    }

    pub fn with_same_domain(mut self, same: bool) -> Self {
        self.same_domain = same;
        self
    }

    pub fn with_max_links(mut self, max_links: usize) -> Self {
        self.max_links = max_links.max(1);
        self
    }

    pub fn with_match_regex(mut self, pattern: Option<&str>) -> Result<Self> {
        self.match_regex = pattern.map(Regex::new).transpose()?;
        Ok(self)
    }

    pub fn with_include_ambiguous(mut self, include: bool) -> Self {
        self.include_ambiguous = include;
        self
    }

    pub fn with_max_pdf_bytes(mut self, cap: u64) -> Self {
        self.max_pdf_bytes = cap;
        self
    }

    pub fn with_require_pdf(mut self, require: bool) -> Self {
        self.require_pdf = require;
        self
    }

    pub fn with_add_prefix(mut self, prefix: Option<String>) -> Self {
        self.add_prefix = prefix;
        self
    }

    pub fn with_context(mut self, context: Option<RepoContext>) -> Self {
        self.context = context;
        self
    }

    /// Collect candidate PDF URLs from page HTML: hrefs of a/area/link tags
    /// resolved against `<base href>` when present, filtered by host, regex,
    /// and `.pdf` suffix, capped at `max_links`.
    pub fn discover_pdf_links(&self, html: &str) -> Vec<String> {
        let page = match Url::parse(&self.page_url) {
            Ok(u) => u,
            Err(_) => return Vec::new(),
        };
        let base = base_href_regex()
            .captures(html)
            .and_then(|c| capture_href(&c))
            .and_then(|href| page.join(&href).ok())
            .unwrap_or_else(|| page.clone());
        let base_host = page.host_str().unwrap_or_default().to_string();

        let mut found: Vec<String> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        for caps in link_regex().captures_iter(html) {
            let Some(href) = capture_href(&caps) else {
                continue;
            };
            let Ok(abs) = base.join(&href) else { continue };
            if self.same_domain && abs.host_str().unwrap_or_default() != base_host {
                continue;
            }
            let abs_str = abs.to_string();
            if let Some(re) = &self.match_regex {
                if !re.is_match(&abs_str) {
                    continue;
                }
            }
            let looks_pdf = abs.path().to_lowercase().ends_with(".pdf");
            if !looks_pdf && !self.include_ambiguous {
                continue;
            }
            if seen.insert(abs_str.clone()) {
                found.push(abs_str);
                if found.len() >= self.max_links {
                    break;
                }
            }
        }
        found
    }
}

impl Source for WebPagePdfSource {
    fn iter_files<'a>(&'a mut self) -> Box<dyn Iterator<Item = Result<FileItem>> + Send + 'a> {
        let html = match self.client.get_text(&self.page_url, PAGE_FETCH_CAP) {
            Ok(html) => html,
            Err(e) => {
                warn!("failed to fetch {}: {}", self.page_url, e);
                return Box::new(std::iter::empty());
            }
        };
        let urls = self.discover_pdf_links(&html);
        if urls.is_empty() {
            return Box::new(std::iter::empty());
        }
        let mut inner = WebPdfListSource::new(urls, self.client.clone())
            .with_max_pdf_bytes(self.max_pdf_bytes)
            .with_require_pdf(self.require_pdf)
            .with_add_prefix(self.add_prefix.clone());
        let items: Vec<Result<FileItem>> = inner.iter_files().collect();
        Box::new(items.into_iter())
    }

    fn context(&self) -> Option<RepoContext> {
        self.context.clone()
    }

    fn is_heavy(&self) -> bool {
        true
    }
}
