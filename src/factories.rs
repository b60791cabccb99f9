use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde_json::Value;

use crate::config::{SinkSpec, SourceSpec};
use crate::csv_source::{CsvSourceOptions, CsvTextSource};
use crate::interfaces::{
    Sink, SinkFactory, SinkFactoryContext, SinkFactoryResult, Source, SourceFactory,
    SourceFactoryContext,
};
use crate::jsonl_source::JsonlTextSource;
use crate::records::JsonMap;
use crate::sinks::{JsonlSink, PromptTextSink};
use crate::sources_fs::{LocalDirOptions, LocalDirSource};
use crate::sources_webpdf::{WebPagePdfSource, WebPdfListSource};
use crate::sources_zip::{ZipArchiveSource, ZipLocation};
use crate::sqlite_source::{SqliteSource, SqliteSourceOptions};

/// Expand a leading `~` to the home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let Some(s) = path.to_str() else {
        return path.to_path_buf();
    };
    if s == "~" {
        return dirs::home_dir().unwrap_or_else(|| path.to_path_buf());
    }
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

fn opt_str(options: &JsonMap, key: &str) -> Option<String> {
    options.get(key).and_then(Value::as_str).map(str::to_string)
}

fn opt_u64(options: &JsonMap, key: &str) -> Option<u64> {
    options.get(key).and_then(Value::as_u64)
}

fn opt_bool(options: &JsonMap, key: &str) -> Option<bool> {
    options.get(key).and_then(Value::as_bool)
}

fn opt_str_list(options: &JsonMap, key: &str) -> Vec<String> {
    match options.get(key) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        Some(Value::String(s)) => vec![s.clone()],
        _ => Vec::new(),
    }
}

// ---------------------------------------------------------------------------
// Source factories
// ---------------------------------------------------------------------------

pub struct LocalDirSourceFactory;

impl SourceFactory for LocalDirSourceFactory {
    fn id(&self) -> &'static str {
        "local_dir"
    }

    fn build(
        &self,
        ctx: &SourceFactoryContext<'_>,
        spec: &SourceSpec,
    ) -> Result<Vec<Box<dyn Source>>> {
        let options = ctx.options_with_defaults(self.id(), spec);
        let Some(root) = opt_str(&options, "root_dir") else {
            bail!("local_dir source spec requires root_dir");
        };
        let opts = LocalDirOptions {
            root_dir: expand_tilde(Path::new(&root)),
            max_file_bytes: opt_u64(&options, "max_file_bytes"),
            exclude_dir_names: opt_str_list(&options, "exclude_dir_names"),
            include_globs: opt_str_list(&options, "include_globs"),
            exclude_globs: opt_str_list(&options, "exclude_globs"),
        };
        Ok(vec![Box::new(LocalDirSource::new(
            opts,
            ctx.repo_context.cloned(),
        ))])
    }
}

pub struct ZipArchiveSourceFactory;

impl SourceFactory for ZipArchiveSourceFactory {
    fn id(&self) -> &'static str {
        "zip_archive"
    }

    fn build(
        &self,
        ctx: &SourceFactoryContext<'_>,
        spec: &SourceSpec,
    ) -> Result<Vec<Box<dyn Source>>> {
        let options = ctx.options_with_defaults(self.id(), spec);
        let location = match (opt_str(&options, "path"), opt_str(&options, "url")) {
            (Some(path), _) => ZipLocation::Path(expand_tilde(Path::new(&path))),
            (None, Some(url)) => ZipLocation::Url(url),
            (None, None) => bail!("zip_archive source spec requires 'path' or 'url'"),
        };
        let mut source = ZipArchiveSource::new(location, ctx.repo_context.cloned())
            .with_per_file_cap(opt_u64(&options, "per_file_cap"))
            .with_strip_root(opt_bool(&options, "strip_root").unwrap_or(true));
        if let Some(client) = &ctx.http_client {
            source = source.with_client(client.clone());
        }
        if let Some(cap) = opt_u64(&options, "download_max_bytes") {
            source = source.with_download_cap(cap);
        }
        Ok(vec![Box::new(source)])
    }
}

pub struct WebPdfListSourceFactory;

impl SourceFactory for WebPdfListSourceFactory {
    fn id(&self) -> &'static str {
        "web_pdf_list"
    }

    fn build(
        &self,
        ctx: &SourceFactoryContext<'_>,
        spec: &SourceSpec,
    ) -> Result<Vec<Box<dyn Source>>> {
        let options = ctx.options_with_defaults(self.id(), spec);
        let urls = opt_str_list(&options, "urls");
        if urls.is_empty() {
            bail!("web_pdf_list source spec requires urls");
        }
        let client = ctx
            .http_client
            .clone()
            .unwrap_or_else(|| ctx.http_config.build_client());
        let mut source = WebPdfListSource::new(urls, client)
            .with_add_prefix(opt_str(&options, "add_prefix"))
            .with_context(ctx.repo_context.cloned());
        if let Some(cap) = opt_u64(&options, "max_pdf_bytes") {
            source = source.with_max_pdf_bytes(cap);
        }
        if let Some(require) = opt_bool(&options, "require_pdf") {
            source = source.with_require_pdf(require);
        }
        Ok(vec![Box::new(source)])
    }
}

pub struct WebPagePdfSourceFactory;

impl SourceFactory for WebPagePdfSourceFactory {
    fn id(&self) -> &'static str {
        "web_page_pdf"
    }

    fn build(
        &self,
        ctx: &SourceFactoryContext<'_>,
        spec: &SourceSpec,
    ) -> Result<Vec<Box<dyn Source>>> {
        let options = ctx.options_with_defaults(self.id(), spec);
        let Some(page_url) = opt_str(&options, "page_url") else {
            bail!("web_page_pdf source spec requires page_url");
        };
        let client = ctx
            .http_client
            .clone()
            .unwrap_or_else(|| ctx.http_config.build_client());
        let mut source = WebPagePdfSource::new(page_url, client)
            .with_add_prefix(opt_str(&options, "add_prefix"))
            .with_context(ctx.repo_context.cloned())
            .with_match_regex(opt_str(&options, "match_regex").as_deref())?;
        if let Some(same) = opt_bool(&options, "same_domain") {
            source = source.with_same_domain(same);
        }
        if let Some(max_links) = opt_u64(&options, "max_links") {
            source = source.with_max_links(max_links as usize);
        }
        if let Some(include) = opt_bool(&options, "include_ambiguous") {
            source = source.with_include_ambiguous(include);
        }
        if let Some(cap) = opt_u64(&options, "max_pdf_bytes") {
            source = source.with_max_pdf_bytes(cap);
        }
        if let Some(require) = opt_bool(&options, "require_pdf") {
            source = source.with_require_pdf(require);
        }
        Ok(vec![Box::new(source)])
    }
}

pub struct CsvTextSourceFactory;

impl SourceFactory for CsvTextSourceFactory {
    fn id(&self) -> &'static str {
        "csv_text"
    }

    fn build(
        &self,
        ctx: &SourceFactoryContext<'_>,
        spec: &SourceSpec,
    ) -> Result<Vec<Box<dyn Source>>> {
        let options = ctx.options_with_defaults(self.id(), spec);
        let mut paths = opt_str_list(&options, "paths");
        if paths.is_empty() {
            if let Some(single) = opt_str(&options, "path") {
                paths.push(single);
            }
        }
        if paths.is_empty() {
            bail!("csv_text source spec requires 'paths' (list) or 'path'");
        }
        let opts = CsvSourceOptions {
            paths: paths.iter().map(|p| expand_tilde(Path::new(p))).collect(),
            text_column: opt_str(&options, "text_column").unwrap_or_else(|| "text".to_string()),
            delimiter: opt_str(&options, "delimiter").and_then(|d| d.chars().next()),
            has_header: opt_bool(&options, "has_header").unwrap_or(true),
            text_column_index: opt_u64(&options, "text_column_index").unwrap_or(0) as usize,
        };
        Ok(vec![Box::new(CsvTextSource::new(
            opts,
            ctx.repo_context.cloned(),
        ))])
    }
}

pub struct JsonlTextSourceFactory;

impl SourceFactory for JsonlTextSourceFactory {
    fn id(&self) -> &'static str {
        "jsonl_text"
    }

    fn build(
        &self,
        ctx: &SourceFactoryContext<'_>,
        spec: &SourceSpec,
    ) -> Result<Vec<Box<dyn Source>>> {
        let options = ctx.options_with_defaults(self.id(), spec);
        let mut paths = opt_str_list(&options, "paths");
        if paths.is_empty() {
            if let Some(single) = opt_str(&options, "path") {
                paths.push(single);
            }
        }
        if paths.is_empty() {
            bail!("jsonl_text source spec requires 'paths' (list) or 'path'");
        }
        let text_key = opt_str(&options, "text_key").unwrap_or_else(|| "text".to_string());
        Ok(vec![Box::new(JsonlTextSource::new(
            paths.iter().map(|p| expand_tilde(Path::new(p))).collect(),
            text_key,
            ctx.repo_context.cloned(),
        ))])
    }
}

pub struct SqliteSourceFactory;

impl SourceFactory for SqliteSourceFactory {
    fn id(&self) -> &'static str {
        "sqlite"
    }

    fn build(
        &self,
        ctx: &SourceFactoryContext<'_>,
        spec: &SourceSpec,
    ) -> Result<Vec<Box<dyn Source>>> {
        let options = ctx.options_with_defaults(self.id(), spec);
        let Some(db_path) = opt_str(&options, "db_path") else {
            bail!("sqlite source spec requires db_path");
        };
        let mut text_columns = opt_str_list(&options, "text_columns");
        if text_columns.is_empty() {
            if let Some(single) = opt_str(&options, "text_column") {
                text_columns.push(single);
            } else {
                text_columns.push("text".to_string());
            }
        }
        let opts = SqliteSourceOptions {
            db_path: expand_tilde(Path::new(&db_path)),
            table: opt_str(&options, "table"),
            sql: opt_str(&options, "sql"),
            text_columns,
            id_column: opt_str(&options, "id_column"),
            where_clause: opt_str(&options, "where"),
            batch_size: opt_u64(&options, "batch_size").unwrap_or(500) as usize,
        };
        Ok(vec![Box::new(SqliteSource::new(
            opts,
            ctx.repo_context.cloned(),
        ))])
    }
}

// ---------------------------------------------------------------------------
// Sink factories
// ---------------------------------------------------------------------------

fn default_prompt_path(jsonl_path: &Path) -> PathBuf {
    let name = jsonl_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let base = name
        .strip_suffix(".jsonl.gz")
        .or_else(|| name.strip_suffix(".jsonl"))
        .unwrap_or(&name);
    jsonl_path.with_file_name(format!("{base}.prompt.txt"))
}

/// Build the canonical JSONL + prompt sinks for a sink config.
pub fn build_default_sinks(
    ctx: &SinkFactoryContext,
    jsonl_path: Option<&str>,
    prompt_path: Option<&str>,
    basename: Option<&str>,
) -> Result<SinkFactoryResult> {
    let cfg = &ctx.sink_config;
    if basename.is_some() && jsonl_path.is_some() {
        bail!("provide either basename or jsonl_path, not both");
    }

    let jsonl_path: PathBuf = match jsonl_path {
        Some(p) => expand_tilde(Path::new(p)),
        None => {
            let base = basename
                .map(str::to_string)
                .or_else(|| cfg.jsonl_basename.clone())
                .context("a basename or jsonl_path is required")?;
            let suffix = if cfg.compress_jsonl { ".jsonl.gz" } else { ".jsonl" };
            let dir = cfg
                .output_dir
                .clone()
                .unwrap_or_else(|| PathBuf::from("."));
            expand_tilde(&dir).join(format!("{base}{suffix}"))
        }
    };
    let jsonl_str = jsonl_path.to_string_lossy().into_owned();

    let mut sinks: Vec<Box<dyn Sink>> = vec![Box::new(JsonlSink::new(&jsonl_path))];

    let prompt_target: Option<PathBuf> = match prompt_path {
        Some(p) => Some(expand_tilde(Path::new(p))),
        None if cfg.prompt.include_prompt_file => Some(default_prompt_path(&jsonl_path)),
        None => None,
    };
    if let Some(prompt) = &prompt_target {
        sinks.push(Box::new(PromptTextSink::new(
            prompt,
            cfg.prompt.heading_fmt.clone(),
        )));
    }

    let mut sink_config = cfg.clone();
    sink_config.primary_jsonl_name = Some(jsonl_str.clone());
    if sink_config.context.is_none() {
        sink_config.context = ctx.repo_context.clone();
    }

    let mut metadata = JsonMap::new();
    metadata.insert("primary_jsonl".into(), Value::String(jsonl_str));
    if let Some(prompt) = &prompt_target {
        metadata.insert(
            "prompt_path".into(),
            Value::String(prompt.to_string_lossy().into_owned()),
        );
    }

    Ok(SinkFactoryResult {
        sinks,
        sink_config,
        metadata,
    })
}

pub struct DefaultJsonlPromptSinkFactory;

impl SinkFactory for DefaultJsonlPromptSinkFactory {
    fn id(&self) -> &'static str {
        "default_jsonl_prompt"
    }

    fn build(&self, ctx: &SinkFactoryContext, spec: &SinkSpec) -> Result<SinkFactoryResult> {
        let jsonl_path = opt_str(&spec.options, "jsonl_path");
        let prompt_path = opt_str(&spec.options, "prompt_path");
        let basename = opt_str(&spec.options, "basename");
        if jsonl_path.is_none() && basename.is_none() && ctx.sink_config.jsonl_basename.is_none() {
            bail!("default_jsonl_prompt sink spec requires jsonl_path or a basename");
        }
        build_default_sinks(
            ctx,
            jsonl_path.as_deref(),
            prompt_path.as_deref(),
            basename.as_deref(),
        )
    }
}

/// Columnar output is a plug-in; this build registers the kind so specs
/// naming it fail with a clear message instead of an unknown-kind error.
pub struct ParquetDatasetSinkFactory;

impl SinkFactory for ParquetDatasetSinkFactory {
    fn id(&self) -> &'static str {
        "parquet_dataset"
    }

    fn build(&self, _ctx: &SinkFactoryContext, spec: &SinkSpec) -> Result<SinkFactoryResult> {
        if opt_str(&spec.options, "path").is_none() {
            bail!("parquet_dataset sink spec requires path");
        }
        bail!("parquet sink support is not installed in this build")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HttpConfig, SinkConfig};
    use std::collections::BTreeMap;

    fn source_ctx<'a>(
        http: &'a HttpConfig,
        defaults: &'a BTreeMap<String, JsonMap>,
    ) -> SourceFactoryContext<'a> {
        SourceFactoryContext {
            repo_context: None,
            http_client: None,
            http_config: http,
            source_defaults: defaults,
        }
    }

    #[test]
    fn local_dir_factory_requires_root() {
        let http = HttpConfig::default();
        let defaults = BTreeMap::new();
        let ctx = source_ctx(&http, &defaults);
        let spec = SourceSpec {
            kind: "local_dir".into(),
            options: JsonMap::new(),
        };
        assert!(LocalDirSourceFactory.build(&ctx, &spec).is_err());
    }

    #[test]
    fn source_defaults_merge_under_options() {
        let http = HttpConfig::default();
        let mut defaults = BTreeMap::new();
        let mut d = JsonMap::new();
        d.insert("max_file_bytes".into(), serde_json::json!(1234));
        defaults.insert("local_dir".to_string(), d);
        let ctx = source_ctx(&http, &defaults);

        let mut options = JsonMap::new();
        options.insert("root_dir".into(), serde_json::json!("/tmp"));
        let spec = SourceSpec {
            kind: "local_dir".into(),
            options,
        };
        let merged = ctx.options_with_defaults("local_dir", &spec);
        assert_eq!(merged["max_file_bytes"], 1234);
        assert_eq!(merged["root_dir"], "/tmp");
    }

    #[test]
    fn default_sinks_build_jsonl_and_prompt() {
        let dir = tempfile::tempdir().unwrap();
        let jsonl = dir.path().join("out/data.jsonl");
        let ctx = SinkFactoryContext {
            repo_context: None,
            sink_config: SinkConfig::default(),
        };
        let result =
            build_default_sinks(&ctx, Some(jsonl.to_str().unwrap()), None, None).unwrap();
        assert_eq!(result.sinks.len(), 2);
        assert_eq!(
            result.sink_config.primary_jsonl_name.as_deref(),
            Some(jsonl.to_str().unwrap())
        );
        assert!(result.metadata["prompt_path"]
            .as_str()
            .unwrap()
            .ends_with("data.prompt.txt"));
    }

    #[test]
    fn prompt_file_can_be_disabled() {
        let ctx = SinkFactoryContext {
            repo_context: None,
            sink_config: SinkConfig {
                prompt: crate::config::PromptConfig {
                    include_prompt_file: false,
                    heading_fmt: None,
                },
                ..SinkConfig::default()
            },
        };
        let result = build_default_sinks(&ctx, Some("x.jsonl"), None, None).unwrap();
        assert_eq!(result.sinks.len(), 1);
        assert!(!result.metadata.contains_key("prompt_path"));
    }

    #[test]
    fn basename_mode_uses_output_dir_and_compression() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = SinkFactoryContext {
            repo_context: None,
            sink_config: SinkConfig {
                output_dir: Some(dir.path().to_path_buf()),
                compress_jsonl: true,
                ..SinkConfig::default()
            },
        };
        let result = build_default_sinks(&ctx, None, None, Some("corpus")).unwrap();
        let primary = result.sink_config.primary_jsonl_name.unwrap();
        assert!(primary.ends_with("corpus.jsonl.gz"));
    }

    #[test]
    fn parquet_sink_reports_unavailable() {
        let ctx = SinkFactoryContext {
            repo_context: None,
            sink_config: SinkConfig::default(),
        };
        let mut options = JsonMap::new();
        options.insert("path".into(), serde_json::json!("out/ds"));
        let spec = SinkSpec {
            kind: "parquet_dataset".into(),
            options,
        };
        let err = ParquetDatasetSinkFactory.build(&ctx, &spec).unwrap_err();
        assert!(err.to_string().contains("not installed"));
    }

    #[test]
    fn default_prompt_path_strips_jsonl_suffixes() {
        assert_eq!(
            default_prompt_path(Path::new("out/d.jsonl")),
            PathBuf::from("out/d.prompt.txt")
        );
        assert_eq!(
            default_prompt_path(Path::new("out/d.jsonl.gz")),
            PathBuf::from("out/d.prompt.txt")
        );
    }
}
