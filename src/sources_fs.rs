use std::path::PathBuf;

use anyhow::Result;
use ignore::overrides::{Override, OverrideBuilder};
use ignore::WalkBuilder;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::interfaces::{FileItem, RepoContext, Source};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalDirOptions {
    pub root_dir: PathBuf,
    pub max_file_bytes: Option<u64>,
    /// Directory *names* to skip anywhere in the tree (e.g. "generated").
    pub exclude_dir_names: Vec<String>,
    /// Whitelist globs; when non-empty only matching paths are yielded.
    pub include_globs: Vec<String>,
    /// Globs to exclude on top of the standard filters.
    pub exclude_globs: Vec<String>,
}

fn build_overrides(opts: &LocalDirOptions) -> Result<Override> {
    let mut ob = OverrideBuilder::new(&opts.root_dir);
    for glob in &opts.include_globs {
        ob.add(glob)?;
    }
    for glob in &opts.exclude_globs {
        ob.add(&format!("!{glob}"))?;
    }
    for d in &opts.exclude_dir_names {
        let d = d.trim().trim_matches('/');
        if d.is_empty() {
            continue;
        }
        ob.add(&format!("!**/{d}"))?;
        ob.add(&format!("!**/{d}/**"))?;
    }
    Ok(ob.build()?)
}

/// Walks a local directory and yields file bytes.
///
/// `.gitignore` and hidden files are respected via the walker's standard
/// filters; unreadable entries are skipped quietly.
pub struct LocalDirSource {
    opts: LocalDirOptions,
    context: Option<RepoContext>,
}

impl LocalDirSource {
    pub fn new(opts: LocalDirOptions, context: Option<RepoContext>) -> Self {
        Self { opts, context }
    }
}

/// Walk the tree and collect candidate file paths. Collecting paths up
/// front keeps the walker out of the worker threads; file bytes are still
/// read lazily, one item at a time.
fn scan_paths(opts: &LocalDirOptions) -> Result<Vec<PathBuf>> {
    let overrides = build_overrides(opts)?;
    let walker = WalkBuilder::new(&opts.root_dir)
        .standard_filters(true)
        .overrides(overrides)
        .build();
    let mut paths = Vec::new();
    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(_) => continue,
        };
        if !entry.file_type().map(|ft| ft.is_file()).unwrap_or(false) {
            continue;
        }
        let abs = entry.into_path();
        if let Some(cap) = opts.max_file_bytes {
            match std::fs::metadata(&abs) {
                Ok(m) if m.len() > cap => {
                    debug!("skipping oversized file {}", abs.display());
                    continue;
                }
                Ok(_) => {}
                Err(_) => continue,
            }
        }
        paths.push(abs);
    }
    paths.sort();
    Ok(paths)
}

impl Source for LocalDirSource {
    fn iter_files<'a>(&'a mut self) -> Box<dyn Iterator<Item = Result<FileItem>> + Send + 'a> {
        let root = self.opts.root_dir.clone();
        if !root.is_dir() {
            let err = anyhow::anyhow!("source root is not a directory: {}", root.display());
            return Box::new(std::iter::once(Err(err)));
        }
        let paths = match scan_paths(&self.opts) {
            Ok(paths) => paths,
            Err(e) => {
                return Box::new(std::iter::once(Err(
                    e.context("invalid local_dir include/exclude globs")
                )));
            }
        };

        let iter = paths.into_iter().filter_map(move |abs| {
            let data = match std::fs::read(&abs) {
                Ok(d) => d,
                Err(e) => {
                    debug!("skipping unreadable file {}: {}", abs.display(), e);
                    return None;
                }
            };
            let rel = abs
                .strip_prefix(&root)
                .unwrap_or(&abs)
                .to_string_lossy()
                .replace('\\', "/");
            Some(Ok(FileItem::new(rel, data)))
        });
        Box::new(iter)
    }

    fn context(&self) -> Option<RepoContext> {
        self.context.clone()
    }
}

/// Build a local source for `root` with the default scan options.
pub fn make_local_dir_source(
    root: impl Into<PathBuf>,
    context: Option<RepoContext>,
) -> LocalDirSource {
    LocalDirSource::new(
        LocalDirOptions {
            root_dir: root.into(),
            ..LocalDirOptions::default()
        },
        context,
    )
}
