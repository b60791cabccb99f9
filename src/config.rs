use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::chunk::ChunkPolicy;
use crate::decode::DecodeOptions;
use crate::interfaces::RepoContext;
use crate::records::JsonMap;
use crate::safe_http::SafeHttpClient;

/// Declarative pipeline configuration. Pure data: runtime objects (sources,
/// sinks, clients, scorers) are never representable here and are resolved by
/// the plan builder instead.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepocapsuleConfig {
    pub sources: SourcesConfig,
    pub sinks: SinkConfig,
    pub pipeline: PipelineConfig,
    pub http: HttpConfig,
    pub qc: QCConfig,
    pub chunk: ChunkPolicy,
    pub decode: DecodeOptions,
    pub metadata: RunMetadata,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourcesConfig {
    pub specs: Vec<SourceSpec>,
    /// Per-kind option defaults applied under explicit spec options.
    pub defaults: BTreeMap<String, JsonMap>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceSpec {
    pub kind: String,
    pub options: JsonMap,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkSpec {
    pub kind: String,
    pub options: JsonMap,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    pub specs: Vec<SinkSpec>,
    pub context: Option<RepoContext>,
    pub output_dir: Option<PathBuf>,
    pub primary_jsonl_name: Option<String>,
    pub jsonl_basename: Option<String>,
    pub compress_jsonl: bool,
    pub prompt: PromptConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptConfig {
    pub include_prompt_file: bool,
    pub heading_fmt: Option<String>,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            include_prompt_file: true,
            heading_fmt: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorKind {
    #[default]
    Auto,
    Thread,
    Process,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// 0 means "use available parallelism".
    pub max_workers: usize,
    /// In-flight submission window; clamped to at least `max_workers`.
    pub submit_window: usize,
    pub executor_kind: ExecutorKind,
    pub fail_fast: bool,
    pub include_exts: Vec<String>,
    pub exclude_exts: Vec<String>,
    pub skip_hidden: bool,
    pub max_file_bytes: Option<u64>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_workers: 0,
            submit_window: 0,
            executor_kind: ExecutorKind::Auto,
            fail_fast: false,
            include_exts: Vec::new(),
            exclude_exts: Vec::new(),
            skip_hidden: true,
            max_file_bytes: Some(200 * 1024 * 1024),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub timeout_secs: u64,
    pub retries: u32,
    pub allowed_redirect_suffixes: Vec<String>,
    /// Hostnames exempt from the private/reserved address block.
    pub allow_hosts: Vec<String>,
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            retries: 1,
            allowed_redirect_suffixes: Vec::new(),
            allow_hosts: Vec::new(),
            user_agent: format!("repocapsule/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl HttpConfig {
    pub fn build_client(&self) -> Arc<SafeHttpClient> {
        Arc::new(SafeHttpClient::from_config(self))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum QCMode {
    Off,
    Post,
    #[default]
    Inline,
    Advisory,
}

impl std::fmt::Display for QCMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            QCMode::Off => "off",
            QCMode::Post => "post",
            QCMode::Inline => "inline",
            QCMode::Advisory => "advisory",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QCConfig {
    pub enabled: bool,
    pub mode: QCMode,
    pub min_score: Option<f64>,
    pub drop_near_dups: bool,
    pub scorer_id: Option<String>,
    pub scorer_options: JsonMap,
    pub write_csv: bool,
    pub csv_suffix: Option<String>,
    pub fail_on_error: bool,
    pub parallel_inline: bool,
}

impl Default for QCConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: QCMode::Inline,
            min_score: None,
            drop_near_dups: false,
            scorer_id: None,
            scorer_options: JsonMap::new(),
            write_csv: false,
            csv_suffix: None,
            fail_on_error: false,
            parallel_inline: false,
        }
    }
}

impl QCConfig {
    pub fn validate(&self) -> Result<()> {
        if self.enabled && self.mode == QCMode::Off {
            bail!("qc.enabled is true but qc.mode is 'off'");
        }
        if let Some(score) = self.min_score {
            if !score.is_finite() {
                bail!("qc.min_score must be finite");
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunMetadata {
    pub primary_jsonl: Option<String>,
    pub prompt_path: Option<String>,
    pub repo_url: Option<String>,
    pub dataset_name: Option<String>,
    pub extra: JsonMap,
}

impl RunMetadata {
    /// Merge non-null entries that are not already set.
    pub fn merged(&self, extra: &JsonMap) -> Self {
        let mut out = self.clone();
        for (k, v) in extra {
            if v.is_null() {
                continue;
            }
            match k.as_str() {
                "primary_jsonl" if out.primary_jsonl.is_none() => {
                    out.primary_jsonl = v.as_str().map(str::to_string);
                }
                "prompt_path" if out.prompt_path.is_none() => {
                    out.prompt_path = v.as_str().map(str::to_string);
                }
                "repo_url" if out.repo_url.is_none() => {
                    out.repo_url = v.as_str().map(str::to_string);
                }
                "dataset_name" if out.dataset_name.is_none() => {
                    out.dataset_name = v.as_str().map(str::to_string);
                }
                _ => {
                    out.extra.entry(k.clone()).or_insert_with(|| v.clone());
                }
            }
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl LoggingConfig {
    /// Install the tracing subscriber; a no-op when one is already set.
    pub fn apply(&self) {
        use tracing_subscriber::EnvFilter;
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.level.clone()));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init();
    }
}

// -----------------------------------------------------------------------------
// Validation and (de)serialization
// -----------------------------------------------------------------------------

/// Lexically normalize a path so `out/./x` and `out/x` compare equal.
fn normalized(path: &str) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in Path::new(path).components() {
        match comp {
            std::path::Component::CurDir => {}
            std::path::Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

impl RepocapsuleConfig {
    pub fn validate(&self) -> Result<()> {
        self.qc.validate()?;
        self.chunk.validate()?;

        let primary = self
            .sinks
            .primary_jsonl_name
            .as_deref()
            .or(self.metadata.primary_jsonl.as_deref());
        let prompt = self.metadata.prompt_path.as_deref();
        if let (Some(p), Some(q)) = (primary, prompt) {
            let same_target = p == q
                || normalized(p) == normalized(q)
                || match (std::fs::canonicalize(p), std::fs::canonicalize(q)) {
                    (Ok(a), Ok(b)) => a == b,
                    _ => false,
                };
            if same_target {
                bail!("primary_jsonl and prompt_path refer to the same file path: {p}");
            }
        }
        Ok(())
    }

    pub fn to_dict(&self) -> Value {
        serde_json::to_value(self).expect("config serialization cannot fail")
    }

    pub fn from_dict(value: Value) -> Result<Self> {
        serde_json::from_value(value).context("invalid repocapsule config")
    }

    pub fn from_json_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("invalid JSON config {}", path.display()))
    }

    pub fn from_toml_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("invalid TOML config {}", path.display()))
    }

    pub fn to_json_path(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text)
            .with_context(|| format!("failed to write config {}", path.display()))
    }
}

/// Load a config file, dispatching on the extension (.json or .toml).
pub fn load_config_from_path(path: &Path) -> Result<RepocapsuleConfig> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => RepocapsuleConfig::from_json_path(path),
        Some("toml") => RepocapsuleConfig::from_toml_path(path),
        other => bail!(
            "unsupported config extension {:?} for {}",
            other,
            path.display()
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_roundtrip_to_from_dict() {
        let mut cfg = RepocapsuleConfig::default();
        cfg.metadata.primary_jsonl = Some("out/data.jsonl".into());
        cfg.metadata.repo_url = Some("https://example.com/repo".into());
        cfg.sources.specs.push(SourceSpec {
            kind: "local_dir".into(),
            options: serde_json::from_value(serde_json::json!({"root_dir": "/tmp/x"})).unwrap(),
        });
        cfg.qc.enabled = true;
        cfg.qc.mode = QCMode::Advisory;

        let roundtripped = RepocapsuleConfig::from_dict(cfg.to_dict()).unwrap();
        assert_eq!(roundtripped, cfg);
    }

    #[test]
    fn config_roundtrip_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut cfg = RepocapsuleConfig::default();
        cfg.metadata.repo_url = Some("https://example.com/repo".into());
        cfg.to_json_path(&path).unwrap();
        let loaded = load_config_from_path(&path).unwrap();
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn config_loads_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[metadata]\nrepo_url = \"https://example.com/repo\"\n\n[qc]\nenabled = true\nmode = \"post\"\n",
        )
        .unwrap();
        let loaded = load_config_from_path(&path).unwrap();
        assert_eq!(
            loaded.metadata.repo_url.as_deref(),
            Some("https://example.com/repo")
        );
        assert_eq!(loaded.qc.mode, QCMode::Post);
    }

    #[test]
    fn qc_enabled_off_is_rejected() {
        let qc = QCConfig {
            enabled: true,
            mode: QCMode::Off,
            ..QCConfig::default()
        };
        assert!(qc.validate().is_err());
    }

    #[test]
    fn same_output_paths_are_rejected() {
        let mut cfg = RepocapsuleConfig::default();
        cfg.metadata.primary_jsonl = Some("out/data.jsonl".into());
        cfg.metadata.prompt_path = Some("out/data.jsonl".into());
        assert!(cfg.validate().is_err());

        cfg.metadata.prompt_path = Some("out/./data.jsonl".into());
        assert!(cfg.validate().is_err());

        cfg.metadata.prompt_path = Some("out/data.prompt.txt".into());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn metadata_merge_prefers_existing() {
        let meta = RunMetadata {
            primary_jsonl: Some("a.jsonl".into()),
            ..RunMetadata::default()
        };
        let mut extra = JsonMap::new();
        extra.insert("primary_jsonl".into(), serde_json::json!("b.jsonl"));
        extra.insert("prompt_path".into(), serde_json::json!("p.txt"));
        extra.insert("custom".into(), serde_json::json!(1));
        let merged = meta.merged(&extra);
        assert_eq!(merged.primary_jsonl.as_deref(), Some("a.jsonl"));
        assert_eq!(merged.prompt_path.as_deref(), Some("p.txt"));
        assert_eq!(merged.extra["custom"], 1);
    }
}
