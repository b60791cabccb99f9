use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::interfaces::{FileItem, RepoContext, Source};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SqliteSourceOptions {
    pub db_path: PathBuf,
    /// Table to read; ignored when `sql` is given.
    pub table: Option<String>,
    /// Full SELECT overriding table/where assembly.
    pub sql: Option<String>,
    pub text_columns: Vec<String>,
    pub id_column: Option<String>,
    pub where_clause: Option<String>,
    pub batch_size: usize,
}

impl Default for SqliteSourceOptions {
    fn default() -> Self {
        Self {
            db_path: PathBuf::new(),
            table: None,
            sql: None,
            text_columns: vec!["text".to_string()],
            id_column: None,
            where_clause: None,
            batch_size: 500,
        }
    }
}

/// Reads rows from a SQLite database and materializes the configured text
/// column(s) as one `FileItem` per row. Rows are fetched in LIMIT/OFFSET
/// batches so arbitrarily large tables stream with bounded memory.
pub struct SqliteSource {
    opts: SqliteSourceOptions,
    context: Option<RepoContext>,
}

impl SqliteSource {
    pub fn new(opts: SqliteSourceOptions, context: Option<RepoContext>) -> Self {
        Self { opts, context }
    }

    fn base_sql(&self) -> Result<String> {
        if let Some(sql) = &self.opts.sql {
            return Ok(sql.clone());
        }
        let Some(table) = &self.opts.table else {
            bail!("sqlite source requires either 'sql' or 'table'");
        };
        if self.opts.text_columns.is_empty() {
            bail!("sqlite source requires at least one text column");
        }
        let mut cols: Vec<String> = Vec::new();
        if let Some(id) = &self.opts.id_column {
            cols.push(format!("\"{id}\""));
        }
        cols.extend(self.opts.text_columns.iter().map(|c| format!("\"{c}\"")));
        let mut sql = format!("SELECT {} FROM \"{table}\"", cols.join(", "));
        if let Some(cond) = &self.opts.where_clause {
            sql.push_str(&format!(" WHERE {cond}"));
        }
        Ok(sql)
    }
}

struct SqliteRowIter {
    conn: Connection,
    base_sql: String,
    has_id: bool,
    n_text_cols: usize,
    label: String,
    batch_size: usize,
    offset: u64,
    batch: std::vec::IntoIter<FileItem>,
    done: bool,
    row_counter: u64,
}

impl SqliteRowIter {
    fn fetch_batch(&mut self) -> Result<Vec<FileItem>> {
        let sql = format!(
            "{} LIMIT {} OFFSET {}",
            self.base_sql, self.batch_size, self.offset
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let n_text = self.n_text_cols;
        let has_id = self.has_id;
        let mut items = Vec::new();
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            self.row_counter += 1;
            let id: Option<String> = if has_id {
                row.get::<_, Option<String>>(0).unwrap_or(None)
            } else {
                None
            };
            let first_text = usize::from(has_id);
            let mut parts: Vec<String> = Vec::with_capacity(n_text);
            for col in first_text..first_text + n_text {
                if let Ok(Some(v)) = row.get::<_, Option<String>>(col) {
                    let v = v.trim().to_string();
                    if !v.is_empty() {
                        parts.push(v);
                    }
                }
            }
            if parts.is_empty() {
                continue;
            }
            let text = parts.join("\n\n");
            let rel = match id {
                Some(id) if !id.is_empty() => format!("{}:{}", self.label, id),
                _ => format!("{}:#{}", self.label, self.row_counter),
            };
            items.push(FileItem::new(rel, text.into_bytes()));
        }
        Ok(items)
    }
}

impl Iterator for SqliteRowIter {
    type Item = Result<FileItem>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.batch.next() {
                return Some(Ok(item));
            }
            if self.done {
                return None;
            }
            let before = self.row_counter;
            match self.fetch_batch() {
                Ok(items) => {
                    let fetched_rows = self.row_counter - before;
                    self.offset += fetched_rows;
                    if fetched_rows < self.batch_size as u64 {
                        self.done = true;
                    }
                    if items.is_empty() && self.done {
                        return None;
                    }
                    self.batch = items.into_iter();
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

impl Source for SqliteSource {
    fn iter_files<'a>(&'a mut self) -> Box<dyn Iterator<Item = Result<FileItem>> + Send + 'a> {
        let base_sql = match self.base_sql() {
            Ok(sql) => sql,
            Err(e) => return Box::new(std::iter::once(Err(e))),
        };
        let conn = match Connection::open(&self.opts.db_path)
            .with_context(|| format!("failed to open sqlite db {}", self.opts.db_path.display()))
        {
            Ok(c) => c,
            Err(e) => return Box::new(std::iter::once(Err(e))),
        };
        let label = self
            .opts
            .db_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "sqlite".to_string());
        Box::new(SqliteRowIter {
            conn,
            base_sql,
            has_id: self.opts.id_column.is_some() && self.opts.sql.is_none(),
            n_text_cols: self.opts.text_columns.len().max(1),
            label,
            batch_size: self.opts.batch_size.max(1),
            offset: 0,
            batch: Vec::new().into_iter(),
            done: false,
            row_counter: 0,
        })
    }

    fn context(&self) -> Option<RepoContext> {
        self.context.clone()
    }
}
