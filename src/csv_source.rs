use std::fs::File;
use std::io::Read;
use std::path::PathBuf;

use anyhow::Result;
use flate2::read::MultiGzDecoder;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::interfaces::{FileItem, RepoContext, Source};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CsvSourceOptions {
    pub paths: Vec<PathBuf>,
    pub text_column: String,
    /// Explicit delimiter; inferred from the suffix (`.tsv` → tab) when unset.
    pub delimiter: Option<char>,
    pub has_header: bool,
    pub text_column_index: usize,
}

impl Default for CsvSourceOptions {
    fn default() -> Self {
        Self {
            paths: Vec::new(),
            text_column: "text".to_string(),
            delimiter: None,
            has_header: true,
            text_column_index: 0,
        }
    }
}

/// Emits one `FileItem` per CSV row, taking text from a named column
/// (header mode) or a positional index. Gzip-compressed files are detected
/// by suffix.
pub struct CsvTextSource {
    opts: CsvSourceOptions,
    context: Option<RepoContext>,
}

impl CsvTextSource {
    pub fn new(opts: CsvSourceOptions, context: Option<RepoContext>) -> Self {
        Self { opts, context }
    }

    fn resolve_delimiter(&self, path: &PathBuf) -> u8 {
        if let Some(d) = self.opts.delimiter {
            return d as u8;
        }
        let name = path.to_string_lossy().to_lowercase();
        if name.contains(".tsv") {
            b'\t'
        } else {
            b','
        }
    }

    fn open_reader(path: &PathBuf) -> Result<Box<dyn Read + Send>> {
        let file = File::open(path)?;
        let name = path.to_string_lossy().to_lowercase();
        if name.ends_with(".gz") {
            Ok(Box::new(MultiGzDecoder::new(file)))
        } else {
            Ok(Box::new(file))
        }
    }

    // Unreadable files and misconfigured columns are benign for this
    // source: warn and yield nothing, like the other row skips.
    fn items_for_path(&self, path: &PathBuf) -> Vec<Result<FileItem>> {
        let reader = match Self::open_reader(path) {
            Ok(r) => r,
            Err(e) => {
                warn!("failed to open CSV file {}: {}", path.display(), e);
                return Vec::new();
            }
        };
        let mut rdr = csv::ReaderBuilder::new()
            .delimiter(self.resolve_delimiter(path))
            .has_headers(self.opts.has_header)
            .flexible(true)
            .from_reader(reader);

        let file_label = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned());
        let mut out = Vec::new();

        if self.opts.has_header {
            let headers = match rdr.headers() {
                Ok(h) => h.clone(),
                Err(e) => {
                    warn!("failed to read CSV header {}: {}", path.display(), e);
                    return Vec::new();
                }
            };
            let text_idx = headers
                .iter()
                .position(|h| h == self.opts.text_column);
            let Some(text_idx) = text_idx else {
                warn!(
                    "CSV {} has no column named {:?}; skipping file",
                    path.display(),
                    self.opts.text_column
                );
                return Vec::new();
            };
            let path_idx = ["path", "filepath", "file_path", "id"]
                .iter()
                .find_map(|key| headers.iter().position(|h| h == *key));

            for (i, row) in rdr.records().enumerate() {
                let lineno = i + 2; // line 1 is the header
                let row = match row {
                    Ok(r) => r,
                    Err(e) => {
                        warn!("bad CSV row {}:{}: {}", file_label, lineno, e);
                        continue;
                    }
                };
                let Some(text) = row.get(text_idx).map(str::trim).filter(|t| !t.is_empty())
                else {
                    continue;
                };
                let rel = path_idx
                    .and_then(|idx| row.get(idx))
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("{file_label}:#{lineno}"));
                out.push(Ok(FileItem::new(rel, text.as_bytes().to_vec())));
            }
        } else {
            for (i, row) in rdr.records().enumerate() {
                let lineno = i + 1;
                let row = match row {
                    Ok(r) => r,
                    Err(e) => {
                        warn!("bad CSV row {}:{}: {}", file_label, lineno, e);
                        continue;
                    }
                };
                let Some(text) = row
                    .get(self.opts.text_column_index)
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                else {
                    continue;
                };
                let rel = format!("{file_label}:#{lineno}");
                out.push(Ok(FileItem::new(rel, text.as_bytes().to_vec())));
            }
        }
        out
    }
}

impl Source for CsvTextSource {
    fn iter_files<'a>(&'a mut self) -> Box<dyn Iterator<Item = Result<FileItem>> + Send + 'a> {
        let paths = self.opts.paths.clone();
        let mut all: Vec<Result<FileItem>> = Vec::new();
        for path in &paths {
            all.extend(self.items_for_path(path));
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
    use std::io::Write;

    fn source_for(paths: Vec<PathBuf>, opts: CsvSourceOptions) -> CsvTextSource {
        CsvTextSource::new(CsvSourceOptions { paths, ..opts }, None)
    }

    #[test]
    fn header_mode_reads_named_column_and_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rows.csv");
        std::fs::write(
            &path,
            "path,text\nsrc/a.py,print('a')\n,skipped-no-path-still-kept\nsrc/b.py,\n",
        )
        .unwrap();
        let mut src = source_for(vec![path], CsvSourceOptions::default());
        let items: Vec<FileItem> = src.iter_files().map(|r| r.unwrap()).collect();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].path, "src/a.py");
        assert_eq!(items[0].data, b"print('a')");
        // Missing path column value falls back to file:#line.
        assert_eq!(items[1].path, "rows.csv:#3");
    }

    #[test]
    fn positional_mode_uses_index() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain.csv");
        std::fs::write(&path, "alpha,one\nbeta,two\n").unwrap();
        let mut src = source_for(
            vec![path],
            CsvSourceOptions {
                has_header: false,
                text_column_index: 1,
                ..CsvSourceOptions::default()
            },
        );
        let items: Vec<FileItem> = src.iter_files().map(|r| r.unwrap()).collect();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].path, "plain.csv:#1");
        assert_eq!(items[0].data, b"one");
        assert_eq!(items[1].data, b"two");
    }

    #[test]
    fn tsv_suffix_switches_delimiter() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rows.tsv");
        std::fs::write(&path, "text\tpath\nhello world\tdoc/x.md\n").unwrap();
        let mut src = source_for(vec![path], CsvSourceOptions::default());
        let items: Vec<FileItem> = src.iter_files().map(|r| r.unwrap()).collect();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].path, "doc/x.md");
        assert_eq!(items[0].data, b"hello world");
    }

    #[test]
    fn gzip_csv_is_transparent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rows.csv.gz");
        let file = File::create(&path).unwrap();
        let mut enc = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        enc.write_all(b"text\ncompressed row\n").unwrap();
        enc.finish().unwrap();

        let mut src = source_for(vec![path], CsvSourceOptions::default());
        let items: Vec<FileItem> = src.iter_files().map(|r| r.unwrap()).collect();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].data, b"compressed row");
    }

    #[test]
    fn missing_file_is_skipped_quietly() {
        let dir = tempfile::tempdir().unwrap();
        let mut src = source_for(
            vec![dir.path().join("nope.csv")],
            CsvSourceOptions::default(),
        );
        let items: Vec<_> = src.iter_files().collect();
        assert!(items.is_empty());
    }

    #[test]
    fn missing_text_column_yields_no_items() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rows.csv");
        std::fs::write(&path, "a,b\n1,2\n").unwrap();
        let mut src = source_for(vec![path], CsvSourceOptions::default());
        let items: Vec<_> = src.iter_files().collect();
        assert!(items.is_empty());
    }

    #[test]
    fn unreadable_file_does_not_block_later_paths() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("rows.csv");
        std::fs::write(&good, "text\nstill processed\n").unwrap();
        let mut src = source_for(
            vec![dir.path().join("nope.csv"), good],
            CsvSourceOptions::default(),
        );
        let items: Vec<FileItem> = src.iter_files().map(|r| r.unwrap()).collect();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].data, b"still processed");
    }
}
