use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;

use anyhow::Result;
use flate2::read::MultiGzDecoder;
use serde_json::Value;
use tracing::warn;

use crate::interfaces::{FileItem, RepoContext, Source};

/// Emits one `FileItem` per JSONL line, taking text from `text_key`.
/// Lines that fail to parse or lack the key are skipped with a warning.
pub struct JsonlTextSource {
    paths: Vec<PathBuf>,
    text_key: String,
    context: Option<RepoContext>,
}

impl JsonlTextSource {
    pub fn new(paths: Vec<PathBuf>, text_key: impl Into<String>, context: Option<RepoContext>) -> Self {
        Self {
            paths,
            text_key: text_key.into(),
            context,
        }
    }

    fn open_reader(path: &PathBuf) -> Result<Box<dyn Read + Send>> {
        let file = File::open(path)?;
        if path.to_string_lossy().to_lowercase().ends_with(".gz") {
            Ok(Box::new(MultiGzDecoder::new(file)))
        } else {
            Ok(Box::new(file))
        }
    }

    fn items_for_path(&self, path: &PathBuf) -> Vec<Result<FileItem>> {
        let reader = match Self::open_reader(path) {
            Ok(r) => r,
            Err(e) => {
                return vec![Err(anyhow::anyhow!(
                    "failed to open JSONL file {}: {e}",
                    path.display()
                ))];
            }
        };
        let file_label = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned());
        let mut out = Vec::new();
        for (i, line) in BufReader::new(reader).lines().enumerate() {
            let lineno = i + 1;
            let line = match line {
                Ok(l) => l,
                Err(e) => {
                    warn!("read failed at {}:{}: {}", file_label, lineno, e);
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            let value: Value = match serde_json::from_str(&line) {
                Ok(v) => v,
                Err(e) => {
                    warn!("bad JSONL line {}:{}: {}", file_label, lineno, e);
                    continue;
                }
            };
            let Some(text) = value
                .get(&self.text_key)
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|t| !t.is_empty())
            else {
                continue;
            };
            let rel = value
                .get("path")
                .and_then(Value::as_str)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| format!("{file_label}:#{lineno}"));
            out.push(Ok(FileItem::new(rel, text.as_bytes().to_vec())));
        }
        out
    }
}

impl Source for JsonlTextSource {
    fn iter_files<'a>(&'a mut self) -> Box<dyn Iterator<Item = Result<FileItem>> + Send + 'a> {
        let mut all = Vec::new();
        for path in self.paths.clone() {
            all.extend(self.items_for_path(&path));
        }
        Box::new(all.into_iter())
    }

    fn context(&self) -> Option<RepoContext> {
        self.context.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_text_key_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rows.jsonl");
        std::fs::write(
            &path,
            concat!(
                "{\"text\": \"first body\", \"path\": \"a.md\"}\n",
                "{\"text\": \"\"}\n",
                "not json\n",
                "{\"other\": 1}\n",
                "{\"text\": \"second body\"}\n",
            ),
        )
        .unwrap();
        let mut src = JsonlTextSource::new(vec![path], "text", None);
        let items: Vec<FileItem> = src.iter_files().map(|r| r.unwrap()).collect();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].path, "a.md");
        assert_eq!(items[0].data, b"first body");
        assert_eq!(items[1].path, "rows.jsonl:#5");
    }

    #[test]
    fn custom_text_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rows.jsonl");
        std::fs::write(&path, "{\"content\": \"body here\"}\n").unwrap();
        let mut src = JsonlTextSource::new(vec![path], "content", None);
        let items: Vec<FileItem> = src.iter_files().map(|r| r.unwrap()).collect();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].data, b"body here");
    }

    #[test]
    fn missing_file_yields_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut src = JsonlTextSource::new(vec![dir.path().join("nope.jsonl")], "text", None);
        let items: Vec<_> = src.iter_files().collect();
        assert_eq!(items.len(), 1);
        assert!(items[0].is_err());
    }
}
