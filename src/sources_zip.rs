use std::fs::File;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, warn};
use zip::ZipArchive;

use crate::interfaces::{FileItem, RepoContext, Source};
use crate::safe_http::SafeHttpClient;

const DEFAULT_ARCHIVE_CAP: u64 = 2 * 1024 * 1024 * 1024; // 2 GiB download guard

/// Where the archive lives: a local file or a URL fetched through the safe
/// HTTP client into a temp file (zipballs from hosted git services).
#[derive(Debug, Clone)]
pub enum ZipLocation {
    Path(PathBuf),
    Url(String),
}

/// Streams the members of a zip archive as `FileItem`s.
///
/// Directory entries are skipped, per-file bytes are capped, and the shared
/// leading segment (the `repo-ref/` root of zipballs) is stripped when
/// requested.
pub struct ZipArchiveSource {
    location: ZipLocation,
    per_file_cap: Option<u64>,
    strip_root: bool,
    context: Option<RepoContext>,
    client: Option<Arc<SafeHttpClient>>,
    download_cap: u64,
    staged: Option<tempfile::NamedTempFile>,
}

impl ZipArchiveSource {
    pub fn new(location: ZipLocation, context: Option<RepoContext>) -> Self {
        Self {
            location,
            per_file_cap: None,
            strip_root: true,
            context,
            client: None,
            download_cap: DEFAULT_ARCHIVE_CAP,
            staged: None,
        }
    }

    pub fn with_per_file_cap(mut self, cap: Option<u64>) -> Self {
        self.per_file_cap = cap;
        self
    }

    pub fn with_strip_root(mut self, strip: bool) -> Self {
        self.strip_root = strip;
        self
    }

    pub fn with_client(mut self, client: Arc<SafeHttpClient>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn with_download_cap(mut self, cap: u64) -> Self {
        self.download_cap = cap;
        self
    }

    fn resolve_archive_path(&mut self) -> Result<PathBuf> {
        match &self.location {
            ZipLocation::Path(p) => Ok(p.clone()),
            ZipLocation::Url(url) => {
                if let Some(staged) = &self.staged {
                    return Ok(staged.path().to_path_buf());
                }
                let client = self
                    .client
                    .clone()
                    .ok_or_else(|| anyhow::anyhow!("zip source for {url} needs an HTTP client"))?;
                let body = client.get_bytes(url, self.download_cap)?;
                let mut staged =
                    tempfile::NamedTempFile::new().context("failed to stage zip download")?;
                staged.write_all(&body.data)?;
                staged.flush()?;
                let path = staged.path().to_path_buf();
                self.staged = Some(staged);
                Ok(path)
            }
        }
    }
}

struct ZipIter {
    archive: ZipArchive<File>,
    index: usize,
    per_file_cap: Option<u64>,
    strip_root: bool,
}

impl Iterator for ZipIter {
    type Item = Result<FileItem>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.index < self.archive.len() {
            let i = self.index;
            self.index += 1;
            let mut entry = match self.archive.by_index(i) {
                Ok(e) => e,
                Err(e) => {
                    warn!("failed to read zip entry {i}: {e}");
                    continue;
                }
            };
            if entry.is_dir() {
                continue;
            }
            if let Some(cap) = self.per_file_cap {
                if entry.size() > cap {
                    debug!("skipping oversized zip member {}", entry.name());
                    continue;
                }
            }
            let mut name = entry.name().replace('\\', "/");
            if self.strip_root {
                if let Some(idx) = name.find('/') {
                    name = name[idx + 1..].to_string();
                }
            }
            if name.is_empty() {
                continue;
            }
            let mut data = Vec::with_capacity(entry.size() as usize);
            if let Err(e) = entry.read_to_end(&mut data) {
                warn!("failed to inflate zip member {name}: {e}");
                continue;
            }
            return Some(Ok(FileItem::new(name, data)));
        }
        None
    }
}

impl Source for ZipArchiveSource {
    fn iter_files<'a>(&'a mut self) -> Box<dyn Iterator<Item = Result<FileItem>> + Send + 'a> {
        let path = match self.resolve_archive_path() {
            Ok(p) => p,
            Err(e) => return Box::new(std::iter::once(Err(e))),
        };
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(e) => {
                return Box::new(std::iter::once(Err(anyhow::anyhow!(
                    "failed to open zip archive {}: {e}",
                    path.display()
                ))));
            }
        };
        let archive = match ZipArchive::new(file) {
            Ok(a) => a,
            Err(e) => {
                return Box::new(std::iter::once(Err(anyhow::anyhow!(
                    "invalid zip archive {}: {e}",
                    path.display()
                ))));
            }
        };
        Box::new(ZipIter {
            archive,
            index: 0,
            per_file_cap: self.per_file_cap,
            strip_root: self.strip_root,
        })
    }

    fn context(&self) -> Option<RepoContext> {
        self.context.clone()
    }

    fn close(&mut self) {
        self.staged = None;
    }

    fn is_heavy(&self) -> bool {
        matches!(self.location, ZipLocation::Url(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zip::write::FileOptions;

    fn make_zip(entries: &[(&str, &[u8])]) -> tempfile::NamedTempFile {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let mut writer = zip::ZipWriter::new(tmp.reopen().unwrap());
        for (name, data) in entries {
            writer
                .start_file(*name, FileOptions::default())
                .unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap();
        tmp
    }

    #[test]
    fn yields_members_with_root_stripped() {
        let tmp = make_zip(&[
            ("repo-main/src/lib.rs", b"pub fn x() {}\n"),
            ("repo-main/README.md", b"# readme\n"),
        ]);
        let mut src =
            ZipArchiveSource::new(ZipLocation::Path(tmp.path().to_path_buf()), None);
        let mut paths: Vec<String> = src
            .iter_files()
            .map(|r| r.unwrap().path)
            .collect();
        paths.sort();
        assert_eq!(paths, vec!["README.md", "src/lib.rs"]);
    }

    #[test]
    fn keeps_full_paths_without_strip() {
        let tmp = make_zip(&[("root/a.txt", b"a")]);
        let mut src = ZipArchiveSource::new(ZipLocation::Path(tmp.path().to_path_buf()), None)
            .with_strip_root(false);
        let paths: Vec<String> = src.iter_files().map(|r| r.unwrap().path).collect();
        assert_eq!(paths, vec!["root/a.txt"]);
    }

    #[test]
    fn per_file_cap_skips_large_members() {
        let big = vec![b'x'; 4096];
        let tmp = make_zip(&[("r/small.txt", b"ok"), ("r/big.bin", &big)]);
        let mut src = ZipArchiveSource::new(ZipLocation::Path(tmp.path().to_path_buf()), None)
            .with_per_file_cap(Some(100));
        let paths: Vec<String> = src.iter_files().map(|r| r.unwrap().path).collect();
        assert_eq!(paths, vec!["small.txt"]);
    }

    #[test]
    fn invalid_archive_yields_one_error() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), b"definitely not a zip").unwrap();
        let mut src =
            ZipArchiveSource::new(ZipLocation::Path(tmp.path().to_path_buf()), None);
        let items: Vec<_> = src.iter_files().collect();
        assert_eq!(items.len(), 1);
        assert!(items[0].is_err());
    }
}
