use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

use crate::chunk::{approx_token_count, TokenKind};
use crate::config::RepocapsuleConfig;

pub type JsonMap = Map<String, Value>;

/// A single JSONL record: chunk text plus provenance metadata.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Record {
    pub text: String,
    #[serde(default)]
    pub meta: JsonMap,
}

impl Record {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            meta: JsonMap::new(),
        }
    }

    /// Best-effort path for log messages.
    pub fn path(&self) -> &str {
        self.meta
            .get("path")
            .and_then(Value::as_str)
            .unwrap_or("<unknown>")
    }

    pub fn kind(&self) -> Option<&str> {
        self.meta.get("kind").and_then(Value::as_str)
    }
}

// -----------------------
// Extension classifications
// -----------------------

/// File kind derived from the extension; unknowns default to doc, which is
/// the safer choice for tokenization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Code,
    Doc,
}

const DOC_EXTS: &[&str] = &["md", "mdx", "markdown", "rst", "adoc", "txt"];

const CODE_EXTS: &[&str] = &[
    // programming / scripting
    "py", "pyw", "py3", "ipynb", "ps1", "psm1", "psd1", "bat", "cmd", "sh", "bash", "zsh", "c",
    "h", "cpp", "hpp", "cc", "hh", "cxx", "hxx", "cs", "java", "kt", "kts", "scala", "go", "rs",
    "swift", "ts", "tsx", "js", "jsx", "mjs", "cjs", "rb", "php", "pl", "pm", "lua", "r", "jl",
    "sql", "sparql",
    // config / structured (code-ish token ratios)
    "json", "jsonc", "yaml", "yml", "toml", "ini", "cfg", "xml", "xslt",
    // data / rules
    "yara", "yar", "sigma", "ndjson", "log",
];

fn ext_lang(ext: &str) -> Option<&'static str> {
    let lang = match ext {
        "py" | "pyw" | "py3" | "ipynb" => "python",
        "ps1" | "psm1" | "psd1" => "powershell",
        "bat" | "cmd" => "batch",
        "sh" | "bash" => "bash",
        "zsh" => "zsh",
        "c" | "h" => "c",
        "cpp" | "hpp" | "cc" | "hh" | "cxx" | "hxx" => "cpp",
        "cs" => "csharp",
        "java" => "java",
        "kt" | "kts" => "kotlin",
        "scala" => "scala",
        "go" => "go",
        "rs" => "rust",
        "swift" => "swift",
        "ts" | "tsx" => "typescript",
        "js" | "jsx" | "mjs" | "cjs" => "javascript",
        "rb" => "ruby",
        "php" => "php",
        "pl" | "pm" => "perl",
        "lua" => "lua",
        "r" => "r",
        "jl" => "julia",
        "sql" => "sql",
        "sparql" => "sparql",
        "json" | "jsonc" => "json",
        "yaml" | "yml" => "yaml",
        "toml" => "toml",
        "ini" | "cfg" => "ini",
        "xml" | "xslt" => "xml",
        "yara" | "yar" => "yara",
        "sigma" => "sigma",
        "ndjson" => "ndjson",
        "log" => "log",
        "md" | "mdx" | "markdown" => "markdown",
        "rst" => "restructuredtext",
        "adoc" => "asciidoc",
        "txt" => "text",
        _ => return None,
    };
    Some(lang)
}

/// Presentation names where plain capitalization is wrong.
fn lang_display_override(ext: &str) -> Option<&'static str> {
    let name = match ext {
        "ipynb" => "Python",
        "ps1" | "psm1" | "psd1" => "PowerShell",
        "js" | "jsx" => "JavaScript",
        "ts" | "tsx" => "TypeScript",
        "yml" => "YAML",
        "md" => "Markdown",
        "rst" => "reStructuredText",
        "ndjson" => "NDJSON",
        "json" => "JSON",
        "xml" => "XML",
        "ini" => "INI",
        "toml" => "TOML",
        _ => return None,
    };
    Some(name)
}

fn ext_of(path: &str) -> String {
    std::path::Path::new(path)
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

/// Return `(kind, lang)` for a path: kind drives the token-ratio heuristic,
/// lang is a coarse lowercase language tag.
pub fn guess_lang_from_path(path: &str) -> (FileKind, String) {
    let ext = ext_of(path);
    let kind = if CODE_EXTS.contains(&ext.as_str()) {
        FileKind::Code
    } else {
        FileKind::Doc
    };
    let lang = ext_lang(&ext)
        .map(str::to_string)
        .unwrap_or_else(|| if ext.is_empty() { "text".to_string() } else { ext.clone() });
    (kind, lang)
}

pub fn is_code_file(path: &str) -> bool {
    CODE_EXTS.contains(&ext_of(path).as_str())
}

// -----------------------
// Hashing
// -----------------------

/// Hex sha256 of the UTF-8 bytes of `text`.
pub fn sha256_text(text: &str) -> String {
    let mut h = Sha256::new();
    h.update(text.as_bytes());
    hex::encode(h.finalize())
}

// -----------------------
// Record assembly
// -----------------------

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase(),
        None => String::new(),
    }
}

#[derive(Debug, Clone, Default)]
pub struct RecordFields<'a> {
    pub repo_full_name: Option<&'a str>,
    pub repo_url: Option<&'a str>,
    pub license_id: Option<&'a str>,
    pub lang: Option<&'a str>,
    pub encoding: &'a str,
    pub had_replacement: bool,
    pub chunk_id: Option<usize>,
    pub n_chunks: Option<usize>,
    pub extra_meta: Option<&'a JsonMap>,
}

/// Assemble the canonical JSONL record for one chunk.
///
/// Null-valued keys are dropped; `extra_meta` entries are merged only when
/// the key is not already present.
pub fn build_record(text: &str, rel_path: &str, fields: &RecordFields<'_>) -> Record {
    let rp = rel_path.replace('\\', "/");
    let (kind, lang_hint) = guess_lang_from_path(&rp);

    let lang = match fields.lang {
        Some(l) => l.to_string(),
        None => {
            let ext = ext_of(&rp);
            lang_display_override(&ext)
                .map(str::to_string)
                .unwrap_or_else(|| {
                    if lang_hint.is_empty() {
                        "Text".to_string()
                    } else {
                        capitalize(&lang_hint)
                    }
                })
        }
    };

    let source = fields
        .repo_url
        .map(str::to_string)
        .or_else(|| {
            fields
                .repo_full_name
                .map(|n| format!("https://github.com/{n}"))
        });

    let token_kind = match kind {
        FileKind::Code => TokenKind::Code,
        FileKind::Doc => TokenKind::Doc,
    };
    let tokens = approx_token_count(text, token_kind);
    let bytes = text.len();

    let mut meta = JsonMap::new();
    let mut put = |k: &str, v: Value| {
        if !v.is_null() {
            meta.insert(k.to_string(), v);
        }
    };
    put("source", source.map(Value::from).unwrap_or(Value::Null));
    put(
        "repo",
        fields.repo_full_name.map(Value::from).unwrap_or(Value::Null),
    );
    put("path", json!(rp));
    put(
        "license",
        fields.license_id.map(Value::from).unwrap_or(Value::Null),
    );
    put("lang", json!(lang));
    put("chunk_id", json!(fields.chunk_id.unwrap_or(1)));
    put("n_chunks", json!(fields.n_chunks.unwrap_or(1)));
    put("encoding", json!(fields.encoding));
    put("had_replacement", json!(fields.had_replacement));
    put("sha256", json!(sha256_text(text)));
    put("tokens", json!(tokens));
    put("bytes", json!(bytes));

    if let Some(extra) = fields.extra_meta {
        for (k, v) in extra {
            if !meta.contains_key(k) {
                meta.insert(k.clone(), v.clone());
            }
        }
    }

    Record {
        text: text.to_string(),
        meta,
    }
}

// -----------------------
// Run header / summary
// -----------------------

pub const KIND_RUN_HEADER: &str = "run_header";
pub const KIND_RUN_SUMMARY: &str = "run_summary";

/// First line of every JSONL output: the effective configuration snapshot.
pub fn build_run_header_record(cfg: &RepocapsuleConfig) -> Record {
    let mut meta = JsonMap::new();
    meta.insert("kind".into(), json!(KIND_RUN_HEADER));
    meta.insert(
        "config".into(),
        serde_json::to_value(cfg).unwrap_or(Value::Null),
    );
    meta.insert(
        "metadata".into(),
        serde_json::to_value(&cfg.metadata).unwrap_or(Value::Null),
    );
    Record {
        text: String::new(),
        meta,
    }
}

/// Last line of every JSONL output: run stats plus the QC summary.
pub fn build_run_summary_record(
    cfg: &RepocapsuleConfig,
    stats: Value,
    qc_summary: Option<Value>,
) -> Record {
    let mut meta = JsonMap::new();
    meta.insert("kind".into(), json!(KIND_RUN_SUMMARY));
    meta.insert(
        "config".into(),
        serde_json::to_value(cfg).unwrap_or(Value::Null),
    );
    meta.insert("stats".into(), stats);
    meta.insert("qc".into(), qc_summary.unwrap_or(Value::Null));
    meta.insert(
        "metadata".into(),
        serde_json::to_value(&cfg.metadata).unwrap_or(Value::Null),
    );
    Record {
        text: String::new(),
        meta,
    }
}

// -----------------------
// Meta helpers for QC
// -----------------------

/// Insert the entries of `defaults` that are not yet present in the meta.
pub fn merge_meta_defaults(record: &mut Record, defaults: &JsonMap) {
    for (k, v) in defaults {
        if !record.meta.contains_key(k) {
            record.meta.insert(k.clone(), v.clone());
        }
    }
}

/// Split a QC result into canonical meta fields and free-form signals.
/// `tokens` is handled separately by the controller.
pub fn filter_qc_meta(qc_result: &JsonMap) -> (JsonMap, JsonMap) {
    const CANONICAL: &[&str] = &["score", "near_dup", "dup_family_id"];
    let mut canonical = JsonMap::new();
    let mut signals = JsonMap::new();
    for (k, v) in qc_result {
        if v.is_null() || k == "tokens" {
            continue;
        }
        if CANONICAL.contains(&k.as_str()) {
            canonical.insert(k.clone(), v.clone());
        } else {
            signals.insert(k.clone(), v.clone());
        }
    }
    (canonical, signals)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guesses_kind_and_lang() {
        let (kind, lang) = guess_lang_from_path("src/hello.py");
        assert_eq!(kind, FileKind::Code);
        assert_eq!(lang, "python");

        let (kind, lang) = guess_lang_from_path("README.md");
        assert_eq!(kind, FileKind::Doc);
        assert_eq!(lang, "markdown");

        let (kind, lang) = guess_lang_from_path("notes.unknownext");
        assert_eq!(kind, FileKind::Doc);
        assert_eq!(lang, "unknownext");
    }

    #[test]
    fn sha256_is_hex_of_utf8() {
        let digest = sha256_text("print('hi')\n");
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
        // Stable: same input, same output.
        assert_eq!(digest, sha256_text("print('hi')\n"));
    }

    #[test]
    fn build_record_canonical_keys() {
        let rec = build_record(
            "print('hi')\n",
            "src\\hello.py",
            &RecordFields {
                repo_full_name: Some("owner/repo"),
                repo_url: Some("https://github.com/owner/repo"),
                license_id: Some("MIT"),
                encoding: "utf-8",
                chunk_id: Some(1),
                n_chunks: Some(3),
                ..Default::default()
            },
        );
        assert_eq!(rec.meta["path"], "src/hello.py");
        assert_eq!(rec.meta["lang"], "Python");
        assert_eq!(rec.meta["repo"], "owner/repo");
        assert_eq!(rec.meta["source"], "https://github.com/owner/repo");
        assert_eq!(rec.meta["license"], "MIT");
        assert_eq!(rec.meta["chunk_id"], 1);
        assert_eq!(rec.meta["n_chunks"], 3);
        assert_eq!(rec.meta["had_replacement"], false);
        assert_eq!(rec.meta["bytes"], rec.text.len());
        assert_eq!(rec.meta["sha256"], sha256_text(&rec.text));
        assert!(rec.meta["tokens"].as_u64().unwrap() >= 1);
    }

    #[test]
    fn build_record_drops_null_and_merges_extra() {
        let mut extra = JsonMap::new();
        extra.insert("lang".into(), serde_json::json!("ShouldNotWin"));
        extra.insert("custom".into(), serde_json::json!("kept"));
        let rec = build_record(
            "text",
            "a.txt",
            &RecordFields {
                encoding: "utf-8",
                extra_meta: Some(&extra),
                ..Default::default()
            },
        );
        assert!(!rec.meta.contains_key("repo"));
        assert!(!rec.meta.contains_key("license"));
        assert!(!rec.meta.contains_key("source"));
        assert_eq!(rec.meta["lang"], "Text");
        assert_eq!(rec.meta["custom"], "kept");
    }

    #[test]
    fn source_falls_back_to_repo_full_name() {
        let rec = build_record(
            "x",
            "a.rs",
            &RecordFields {
                repo_full_name: Some("owner/name"),
                encoding: "utf-8",
                ..Default::default()
            },
        );
        assert_eq!(rec.meta["source"], "https://github.com/owner/name");
        assert_eq!(rec.meta["lang"], "Rust");
    }

    #[test]
    fn display_overrides_apply() {
        for (path, want) in [
            ("x.ts", "TypeScript"),
            ("x.jsx", "JavaScript"),
            ("x.yml", "YAML"),
            ("doc.rst", "reStructuredText"),
            ("x.toml", "TOML"),
        ] {
            let rec = build_record(
                "x",
                path,
                &RecordFields {
                    encoding: "utf-8",
                    ..Default::default()
                },
            );
            assert_eq!(rec.meta["lang"], *want, "for {path}");
        }
    }

    #[test]
    fn filter_qc_meta_splits_canonical_from_signals() {
        let mut qc = JsonMap::new();
        qc.insert("score".into(), serde_json::json!(88.5));
        qc.insert("near_dup".into(), serde_json::json!(false));
        qc.insert("tokens".into(), serde_json::json!(42));
        qc.insert("repetition_rate".into(), serde_json::json!(0.1));
        qc.insert("nothing".into(), serde_json::Value::Null);
        let (canonical, signals) = filter_qc_meta(&qc);
        assert!(canonical.contains_key("score"));
        assert!(canonical.contains_key("near_dup"));
        assert!(!canonical.contains_key("tokens"));
        assert!(signals.contains_key("repetition_rate"));
        assert!(!signals.contains_key("nothing"));
    }
}
