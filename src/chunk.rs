use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// A contiguous slice of source text with byte offsets into the original.
///
/// `start < end` and chunks within a file are in non-decreasing `start`
/// order; overlap between consecutive chunks is allowed. For chunks whose
/// text was not rewritten (no overlap seeding, no sentence re-joining),
/// `&text[start..end] == chunk.text` holds exactly.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub text: String,
    pub start: usize,
    pub end: usize,
    pub est_tokens: usize,
    pub lang: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChunkMode {
    #[default]
    Auto,
    Doc,
    Code,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkPolicy {
    pub mode: ChunkMode,
    pub target_tokens: usize,
    pub overlap_tokens: usize,
    pub min_tokens: usize,
    pub semantic_doc: bool,
    pub semantic_tokens_per_block: Option<usize>,
}

impl Default for ChunkPolicy {
    fn default() -> Self {
        Self {
            mode: ChunkMode::Auto,
            target_tokens: 800,
            overlap_tokens: 100,
            min_tokens: 200,
            semantic_doc: false,
            semantic_tokens_per_block: None,
        }
    }
}

impl ChunkPolicy {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.target_tokens == 0 {
            anyhow::bail!("chunk.target_tokens must be > 0");
        }
        if self.min_tokens > self.target_tokens {
            anyhow::bail!("chunk.min_tokens must be <= chunk.target_tokens");
        }
        if let Some(limit) = self.semantic_tokens_per_block {
            if limit == 0 {
                anyhow::bail!("chunk.semantic_tokens_per_block must be > 0 when set");
            }
        }
        Ok(())
    }
}

// ----------------------
// Token estimation utils
// ----------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Doc,
    Code,
}

const PUNCT: &str = "()[]{}<>=:+-*/%,.;$#@\\|`~^";

fn is_punct(ch: char) -> bool {
    PUNCT.contains(ch)
}

/// Estimated *chars per token* ratio. Code has more symbols and shorter
/// identifiers, so fewer chars per token; clamp into a reasonable band.
fn char_token_ratio(kind: TokenKind, text: &str) -> f64 {
    let n = text.chars().count();
    if n == 0 {
        return 4.0;
    }
    let mut sym = 0usize;
    let mut digits = 0usize;
    let mut spaces = 0usize;
    for ch in text.chars() {
        if is_punct(ch) {
            sym += 1;
        }
        if ch.is_ascii_digit() {
            digits += 1;
        }
        if ch == ' ' || ch == '\n' || ch == '\t' {
            spaces += 1;
        }
    }
    let n_f = n as f64;
    let sym_density = (sym + digits) as f64 / n_f;
    let space_density = spaces as f64 / n_f;
    let base = match kind {
        TokenKind::Code => 3.2,
        TokenKind::Doc => 4.0,
    };
    (base - 0.8 * sym_density + 0.2 * space_density).clamp(2.8, 4.6)
}

/// Estimate tokens from character length using a symbols-aware ratio.
///
/// Intentionally approximate; call-sites can plug in a real tokenizer later.
pub fn approx_token_count(text: &str, kind: TokenKind) -> usize {
    if text.is_empty() {
        return 0;
    }
    let ratio = char_token_ratio(kind, text);
    (text.chars().count() as f64 / ratio).ceil() as usize
}

// -----------------------
// Prose / Markdown parser
// -----------------------

fn re_fence_open() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*([`~]{3,})([A-Za-z0-9_+-]*)\s*$").unwrap())
}

fn re_fence_close() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*([`~]{3,})\s*$").unwrap())
}

fn re_heading() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s{0,3}#{1,6}\s+\S").unwrap())
}

fn re_list() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s{0,3}(?:[-*+]|\d+\.)\s+\S").unwrap())
}

fn re_table_row() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\|.*\|").unwrap())
}

fn re_hr() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s{0,3}(?:-\s?){3,}\s*$|^\s{0,3}(?:\*\s?){3,}\s*$|^\s{0,3}(?:_\s?){3,}\s*$")
            .unwrap()
    })
}

fn re_indented_code() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(?:\t| {4,})\S").unwrap())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Fence,
    Table,
    IndentedCode,
    Heading,
    Hr,
    ListItem,
    Paragraph,
}

#[derive(Debug, Clone)]
struct MdBlock {
    text: String,
    start: usize,
    end: usize,
    kind: BlockKind,
    /// Fence info string ("rust", "py", ...) for fenced code blocks.
    fence_lang: Option<String>,
}

/// Split Markdown-ish text into structural blocks with byte offsets.
/// Keeps code fences, tables, and indented code runs intact.
fn split_markdown_blocks(text: &str) -> Vec<MdBlock> {
    let lines: Vec<&str> = text.split_inclusive('\n').collect();
    let mut blocks: Vec<MdBlock> = Vec::new();
    let mut buf = String::new();
    let mut buf_start = 0usize;
    let mut pos = 0usize;
    let mut i = 0usize;

    macro_rules! flush_paragraph {
        () => {
            if !buf.is_empty() {
                blocks.push(MdBlock {
                    start: buf_start,
                    end: buf_start + buf.len(),
                    text: std::mem::take(&mut buf),
                    kind: BlockKind::Paragraph,
                    fence_lang: None,
                });
            }
        };
    }

    while i < lines.len() {
        let line = lines[i];

        if let Some(m) = re_fence_open().captures(line) {
            flush_paragraph!();
            let fence = m.get(1).unwrap().as_str();
            let fence_char = fence.chars().next().unwrap();
            let fence_len = fence.len();
            let info = m.get(2).map(|g| g.as_str().to_string()).filter(|s| !s.is_empty());
            let fence_start = pos;
            let mut fence_buf = String::from(line);
            pos += line.len();
            i += 1;
            // consume until a closing fence of >= same length and same char
            while i < lines.len() {
                let l = lines[i];
                fence_buf.push_str(l);
                pos += l.len();
                i += 1;
                if let Some(m2) = re_fence_close().captures(l) {
                    let close = m2.get(1).unwrap().as_str();
                    if close.starts_with(fence_char) && close.len() >= fence_len {
                        break;
                    }
                }
            }
            blocks.push(MdBlock {
                start: fence_start,
                end: pos,
                text: fence_buf,
                kind: BlockKind::Fence,
                fence_lang: info,
            });
            continue;
        }

        // Table block: maximal run of lines containing |...|
        if re_table_row().is_match(line) {
            flush_paragraph!();
            let tstart = pos;
            let mut tbuf = String::from(line);
            pos += line.len();
            i += 1;
            while i < lines.len() && re_table_row().is_match(lines[i]) {
                tbuf.push_str(lines[i]);
                pos += lines[i].len();
                i += 1;
            }
            blocks.push(MdBlock {
                start: tstart,
                end: pos,
                text: tbuf,
                kind: BlockKind::Table,
                fence_lang: None,
            });
            continue;
        }

        // Indented code run, with interleaved blank lines.
        if re_indented_code().is_match(line) {
            flush_paragraph!();
            let cstart = pos;
            let mut cbuf = String::from(line);
            pos += line.len();
            i += 1;
            while i < lines.len()
                && (lines[i].trim().is_empty() || re_indented_code().is_match(lines[i]))
            {
                cbuf.push_str(lines[i]);
                pos += lines[i].len();
                i += 1;
            }
            blocks.push(MdBlock {
                start: cstart,
                end: pos,
                text: cbuf,
                kind: BlockKind::IndentedCode,
                fence_lang: None,
            });
            continue;
        }

        // Headings, HRs, and list items each form their own block.
        let single = if re_heading().is_match(line) {
            Some(BlockKind::Heading)
        } else if re_hr().is_match(line) {
            Some(BlockKind::Hr)
        } else if re_list().is_match(line) {
            Some(BlockKind::ListItem)
        } else {
            None
        };
        if let Some(kind) = single {
            flush_paragraph!();
            blocks.push(MdBlock {
                start: pos,
                end: pos + line.len(),
                text: line.to_string(),
                kind,
                fence_lang: None,
            });
            pos += line.len();
            i += 1;
            continue;
        }

        // Paragraph: accumulate until a blank line flushes.
        if buf.is_empty() {
            buf_start = pos;
        }
        buf.push_str(line);
        pos += line.len();
        i += 1;
        if line.trim().is_empty() {
            flush_paragraph!();
        }
    }

    flush_paragraph!();
    blocks
}

/// Sentence boundaries: a terminator, whitespace, then optional closing
/// quotes/parens and an uppercase letter or digit.
fn split_paragraph_into_sentences(p: &str) -> Vec<String> {
    let trimmed = p.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    let chars: Vec<char> = trimmed.chars().collect();
    let mut parts: Vec<String> = Vec::new();
    let mut start = 0usize;
    let mut i = 0usize;
    while i < chars.len() {
        if matches!(chars[i], '.' | '!' | '?') {
            let mut j = i + 1;
            while j < chars.len() && chars[j].is_whitespace() {
                j += 1;
            }
            if j > i + 1 && j < chars.len() {
                let mut k = j;
                while k < chars.len() && matches!(chars[k], '"' | '\'' | ')') {
                    k += 1;
                }
                if k < chars.len() && (chars[k].is_ascii_uppercase() || chars[k].is_ascii_digit()) {
                    parts.push(chars[start..=i].iter().collect());
                    start = j;
                    i = j;
                    continue;
                }
            }
        }
        i += 1;
    }
    if start < chars.len() {
        parts.push(chars[start..].iter().collect());
    }
    parts
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Take the last `n` characters of `s` as a subslice.
fn char_tail(s: &str, n: usize) -> &str {
    if n == 0 {
        return "";
    }
    let total = s.chars().count();
    if total <= n {
        return s;
    }
    let skip = total - n;
    match s.char_indices().nth(skip) {
        Some((idx, _)) => &s[idx..],
        None => s,
    }
}

// ---------------------
// Chunking: paragraphs
// ---------------------

struct ParagraphPacker {
    target_tokens: usize,
    overlap_tokens: usize,
    min_tokens: usize,
    chunks: Vec<Chunk>,
    cur: Vec<String>,
    cur_start: usize,
    pending_lang: Option<String>,
}

impl ParagraphPacker {
    fn cur_text(&self) -> String {
        self.cur.concat()
    }

    fn cur_tokens(&self, kind: TokenKind) -> usize {
        approx_token_count(&self.cur_text(), kind)
    }

    /// Emit the current buffer as a chunk and seed the overlap tail.
    fn flush(&mut self, kind: TokenKind) {
        if self.cur.is_empty() {
            return;
        }
        let chunk_text = self.cur_text();
        if chunk_text.is_empty() {
            self.cur.clear();
            return;
        }
        let est = approx_token_count(&chunk_text, kind);
        let start = self.cur_start;
        let end = start + chunk_text.len();
        let lang = self.pending_lang.take();
        if self.overlap_tokens > 0 {
            let ratio = char_token_ratio(TokenKind::Doc, &chunk_text);
            let tail_chars = (self.overlap_tokens as f64 * ratio) as usize;
            let tail = char_tail(&chunk_text, tail_chars).to_string();
            self.cur_start = end - tail.len();
            self.cur = vec![tail];
        } else {
            self.cur.clear();
            self.cur_start = end;
        }
        self.chunks.push(Chunk {
            text: chunk_text,
            start,
            end,
            est_tokens: est,
            lang,
        });
    }
}

/// Greedy structural packer for prose/Markdown.
///
/// Keeps fenced code blocks, tables, and lists intact; packs blocks up to
/// ~`target_tokens`; splits oversized blocks by lines (code, with fence
/// re-wrapping) or by sentences (prose); seeds a character tail between
/// chunks to approximate `overlap_tokens`.
pub fn chunk_by_paragraphs(text: &str, policy: &ChunkPolicy) -> Vec<Chunk> {
    let pack_target = match (policy.semantic_doc, policy.semantic_tokens_per_block) {
        (true, Some(limit)) => policy.target_tokens.min(limit),
        _ => policy.target_tokens,
    };
    let min_tokens = policy.min_tokens.min(pack_target);
    let blocks = split_markdown_blocks(text);

    let mut p = ParagraphPacker {
        target_tokens: pack_target,
        overlap_tokens: policy.overlap_tokens,
        min_tokens,
        chunks: Vec::new(),
        cur: Vec::new(),
        cur_start: 0,
        pending_lang: None,
    };

    for block in &blocks {
        if block.text.trim().is_empty() {
            continue;
        }
        let b_tokens = approx_token_count(&block.text, TokenKind::Doc);

        // Headings prefer to start a new chunk once the current one is viable.
        if block.kind == BlockKind::Heading
            && !p.cur.is_empty()
            && p.cur_tokens(TokenKind::Doc) >= p.min_tokens
        {
            p.flush(TokenKind::Doc);
        }

        // A block that overshoots badly gets split on its own.
        if b_tokens > 2 * p.target_tokens {
            if matches!(block.kind, BlockKind::Fence | BlockKind::IndentedCode)
                || block.text.contains("```")
            {
                pack_oversized_code_block(&mut p, block);
            } else {
                pack_oversized_prose_block(&mut p, block);
            }
            continue;
        }

        let candidate_tokens =
            approx_token_count(&(p.cur_text() + &block.text), TokenKind::Doc);
        if candidate_tokens > p.target_tokens && p.cur_tokens(TokenKind::Doc) >= p.min_tokens {
            p.flush(TokenKind::Doc);
            // Replace the buffer outright; the overlap tail only survives
            // inside oversized-block splitting.
            p.cur = vec![block.text.clone()];
            p.cur_start = block.start;
        } else {
            if p.cur.is_empty() {
                p.cur_start = block.start;
            }
            p.cur.push(block.text.clone());
        }
    }

    p.flush(TokenKind::Doc);

    if p.chunks.is_empty() && !text.is_empty() {
        p.chunks.push(Chunk {
            text: text.to_string(),
            start: 0,
            end: text.len(),
            est_tokens: approx_token_count(text, TokenKind::Doc),
            lang: None,
        });
    }
    p.chunks
}

/// Split an oversized fenced/indented code block by lines, re-wrapping each
/// emitted fragment with the detected fences so every chunk stays valid
/// Markdown. The final remainder is left in the buffer for later blocks to
/// pack with (subsequent flushes drain it).
fn pack_oversized_code_block(p: &mut ParagraphPacker, block: &MdBlock) {
    let mut lines: Vec<&str> = block.text.split_inclusive('\n').collect();
    let mut fence_prefix = "";
    let mut fence_suffix = "";
    if let Some(&first) = lines.first() {
        let t = first.trim_start();
        if t.starts_with("```") || t.starts_with("~~~") {
            fence_prefix = first;
            lines.remove(0);
            if let Some(&last) = lines.last() {
                let lt = last.trim();
                if lt.starts_with("```") || lt.starts_with("~~~") {
                    fence_suffix = last;
                    lines.pop();
                }
            }
        }
    }

    let rewrap = |body: &str| -> String {
        if fence_prefix.is_empty() {
            return body.to_string();
        }
        let close = if fence_suffix.is_empty() {
            // Reuse the opening fence without its newline as the closer.
            fence_prefix.trim_end_matches('\n').to_string()
        } else {
            fence_suffix.trim_end_matches('\n').to_string()
        };
        format!("{}{}{}", fence_prefix, body, close)
    };

    let body_offset = block.start + fence_prefix.len();
    let mut pack = String::new();
    let mut consumed = 0usize;
    for line in &lines {
        pack.push_str(line);
        consumed += line.len();
        if approx_token_count(&pack, TokenKind::Code) >= p.target_tokens {
            if p.cur.is_empty() {
                p.cur_start = p.cur_start.max(body_offset + consumed - pack.len());
            }
            p.pending_lang = block.fence_lang.clone();
            let sub = rewrap(&pack);
            p.cur.push(sub);
            p.flush(TokenKind::Code);
            pack.clear();
        }
    }
    if !pack.is_empty() {
        if p.cur.is_empty() {
            p.cur_start = p.cur_start.max(body_offset + consumed - pack.len());
        }
        p.pending_lang = block.fence_lang.clone();
        p.cur.push(rewrap(&pack));
        // No flush here: following blocks may still pack in.
    }
}

/// Split an oversized prose block by sentences, hard-splitting by a fixed
/// character stride when no sentence boundaries are found.
fn pack_oversized_prose_block(p: &mut ParagraphPacker, block: &MdBlock) {
    let sentences = split_paragraph_into_sentences(&block.text);
    if sentences.is_empty() {
        // Hard split by fixed character stride.
        let ratio = char_token_ratio(TokenKind::Doc, &block.text);
        let step_chars = ((p.target_tokens as f64 * ratio) as usize).max(1);
        let chars: Vec<(usize, char)> = block.text.char_indices().collect();
        let mut idx = 0usize;
        while idx < chars.len() {
            let end_idx = (idx + step_chars).min(chars.len());
            let byte_start = chars[idx].0;
            let byte_end = if end_idx == chars.len() {
                block.text.len()
            } else {
                chars[end_idx].0
            };
            if p.cur.is_empty() {
                p.cur_start = p.cur_start.max(block.start + byte_start);
            }
            p.cur.push(block.text[byte_start..byte_end].to_string());
            p.flush(TokenKind::Doc);
            idx = end_idx;
        }
        return;
    }

    let mut pack: Vec<String> = Vec::new();
    for s in sentences {
        let candidate = if pack.is_empty() {
            s.clone()
        } else {
            format!("{} {}", pack.join(" "), s)
        };
        if approx_token_count(&candidate, TokenKind::Doc) > p.target_tokens && !pack.is_empty() {
            if p.cur.is_empty() {
                p.cur_start = p.cur_start.max(block.start);
            }
            p.cur.push(format!("{}\n", pack.join(" ").trim()));
            p.flush(TokenKind::Doc);
            pack = vec![s];
        } else {
            pack.push(s);
        }
    }
    if !pack.is_empty() {
        if p.cur.is_empty() {
            p.cur_start = p.cur_start.max(block.start);
        }
        p.cur.push(format!("{}\n", pack.join(" ").trim()));
        // Remainder stays unflushed so following blocks can pack in.
    }
}

// -----------------
// Chunking: by lines
// -----------------

/// Chunk code deterministically by lines, accumulating until ~`target_tokens`
/// with an optional line-tail overlap carried into the next buffer.
pub fn chunk_by_lines(text: &str, target_tokens: usize, overlap_lines: usize) -> Vec<Chunk> {
    let lines: Vec<&str> = text.split_inclusive('\n').collect();
    let mut chunks: Vec<Chunk> = Vec::new();
    let mut buf: Vec<&str> = Vec::new();
    let mut buf_start = 0usize;
    let mut seeded_overlap = 0usize; // byte length of the seeded tail
    let mut pos = 0usize;

    for (i, line) in lines.iter().enumerate() {
        if buf.is_empty() {
            buf_start = pos;
            seeded_overlap = 0;
        }
        buf.push(line);
        pos += line.len();
        let s = buf.concat();
        if approx_token_count(&s, TokenKind::Code) >= target_tokens {
            let est = approx_token_count(&s, TokenKind::Code);
            let end = buf_start + s.len();
            chunks.push(Chunk {
                text: s,
                start: buf_start,
                end,
                est_tokens: est,
                lang: None,
            });
            buf.clear();
            if overlap_lines > 0 {
                let tail_from = (i + 1).saturating_sub(overlap_lines);
                buf.extend_from_slice(&lines[tail_from..=i]);
                seeded_overlap = buf.iter().map(|l| l.len()).sum();
                buf_start = end - seeded_overlap;
            }
        }
    }

    if !buf.is_empty() {
        let s = buf.concat();
        if s.len() > seeded_overlap {
            let est = approx_token_count(&s, TokenKind::Code);
            chunks.push(Chunk {
                end: buf_start + s.len(),
                start: buf_start,
                est_tokens: est,
                text: s,
                lang: None,
            });
        }
    }

    if chunks.is_empty() && !text.is_empty() {
        chunks.push(Chunk {
            text: text.to_string(),
            start: 0,
            end: text.len(),
            est_tokens: approx_token_count(text, TokenKind::Code),
            lang: None,
        });
    }
    chunks
}

// -------------------------
// High-level policy wrapper
// -------------------------

/// Quick heuristic: lots of punctuation, or mostly short lines.
fn looks_like_code(text: &str) -> bool {
    if text.is_empty() {
        return false;
    }
    let n = text.chars().count();
    let punct = text.chars().filter(|c| is_punct(*c)).count();
    let total_lines = text.lines().count().max(1);
    let short_lines = text.lines().filter(|l| l.chars().count() <= 60).count();
    punct as f64 / n.max(1) as f64 > 0.06
        || (short_lines as f64 / total_lines as f64 > 0.7 && total_lines > 6)
}

/// Chunk `text` according to `policy`, with `mode` and `fmt` hints from the
/// caller (typically inferred from the file extension). `policy.mode` wins
/// when explicit; an `Auto` hint falls back to content classification.
pub fn chunk_text(text: &str, mode: ChunkMode, _fmt: Option<&str>, policy: &ChunkPolicy) -> Vec<Chunk> {
    if text.is_empty() {
        return Vec::new();
    }
    let effective = match policy.mode {
        ChunkMode::Doc => ChunkMode::Doc,
        ChunkMode::Code => ChunkMode::Code,
        ChunkMode::Auto => match mode {
            ChunkMode::Auto => {
                if looks_like_code(text) {
                    ChunkMode::Code
                } else {
                    ChunkMode::Doc
                }
            }
            explicit => explicit,
        },
    };
    match effective {
        ChunkMode::Code => chunk_by_lines(text, policy.target_tokens, 0),
        _ => chunk_by_paragraphs(text, policy),
    }
}
