use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::interfaces::{RepoContext, Sink};
use crate::records::Record;

enum JsonlWriter {
    Plain(BufWriter<File>),
    Gzip(GzEncoder<BufWriter<File>>),
}

impl JsonlWriter {
    fn write_line(&mut self, line: &str) -> Result<()> {
        match self {
            JsonlWriter::Plain(w) => {
                w.write_all(line.as_bytes())?;
                w.write_all(b"\n")?;
            }
            JsonlWriter::Gzip(w) => {
                w.write_all(line.as_bytes())?;
                w.write_all(b"\n")?;
            }
        }
        Ok(())
    }

    fn finish(self) -> Result<()> {
        match self {
            JsonlWriter::Plain(mut w) => w.flush()?,
            JsonlWriter::Gzip(w) => {
                w.finish()?.flush()?;
            }
        }
        Ok(())
    }
}

/// Streams records as JSONL, one compact object per line, LF-terminated.
///
/// Line order: the header record (when set), then data records in write
/// order, then any finalize records as the footer.
pub struct JsonlSink {
    path: PathBuf,
    gzip: bool,
    writer: Option<JsonlWriter>,
    header: Option<Record>,
}

impl JsonlSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path: PathBuf = path.into();
        let gzip = path.to_string_lossy().to_lowercase().ends_with(".gz");
        Self {
            path,
            gzip,
            writer: None,
            header: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_record_line(&mut self, record: &Record) -> Result<()> {
        let line = serde_json::to_string(record)?;
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("jsonl sink {} is not open", self.path.display()))?;
        writer.write_line(&line)
    }
}

impl Sink for JsonlSink {
    fn open(&mut self, _context: Option<&RepoContext>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }
        let file = File::create(&self.path)
            .with_context(|| format!("failed to create {}", self.path.display()))?;
        let buf = BufWriter::new(file);
        self.writer = Some(if self.gzip {
            JsonlWriter::Gzip(GzEncoder::new(buf, Compression::default()))
        } else {
            JsonlWriter::Plain(buf)
        });
        if let Some(header) = self.header.clone() {
            self.write_record_line(&header)?;
        }
        Ok(())
    }

    fn write(&mut self, record: &Record) -> Result<()> {
        self.write_record_line(record)
    }

    fn close(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.take() {
            writer.finish()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        match self.writer.as_mut() {
            Some(JsonlWriter::Plain(w)) => w.flush()?,
            Some(JsonlWriter::Gzip(w)) => w.flush()?,
            None => {}
        }
        Ok(())
    }

    fn set_header_record(&mut self, record: Record) {
        self.header = Some(record);
    }

    fn supports_finalize(&self) -> bool {
        true
    }

    fn finalize(&mut self, extra_records: &[Record]) -> Result<()> {
        for record in extra_records {
            self.write_record_line(record)?;
        }
        Ok(())
    }

    fn consumes_summary_footer(&self) -> bool {
        true
    }
}

/// Append one record as a JSONL line, starting a fresh gzip member for
/// `.gz` targets (concatenated members stay a valid gzip stream).
pub fn append_jsonl_line(path: &Path, record: &Record) -> Result<()> {
    let line = serde_json::to_string(record)?;
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open {} for append", path.display()))?;
    if path.to_string_lossy().to_lowercase().ends_with(".gz") {
        let mut enc = GzEncoder::new(BufWriter::new(file), Compression::default());
        enc.write_all(line.as_bytes())?;
        enc.write_all(b"\n")?;
        enc.finish()?.flush()?;
    } else {
        let mut w = BufWriter::new(file);
        w.write_all(line.as_bytes())?;
        w.write_all(b"\n")?;
        w.flush()?;
    }
    Ok(())
}

/// Writes records as prompt text blocks:
/// `### {path} [{chunk_id}/{n_chunks}] (lang={lang})`, blank line, the chunk
/// text with a guaranteed trailing newline, blank line.
pub struct PromptTextSink {
    path: PathBuf,
    heading_fmt: Option<String>,
    writer: Option<BufWriter<File>>,
}

impl PromptTextSink {
    pub fn new(path: impl Into<PathBuf>, heading_fmt: Option<String>) -> Self {
        Self {
            path: path.into(),
            heading_fmt,
            writer: None,
        }
    }

    fn heading(&self, record: &Record) -> String {
        let meta = &record.meta;
        let get = |key: &str, default: &str| -> String {
            meta.get(key)
                .map(|v| match v {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .unwrap_or_else(|| default.to_string())
        };
        let path = get("path", "unknown");
        let chunk_id = get("chunk_id", "?");
        let n_chunks = get("n_chunks", "?");
        let lang = get("lang", "?");
        match &self.heading_fmt {
            Some(fmt) => fmt
                .replace("{path}", &path)
                .replace("{chunk_id}", &chunk_id)
                .replace("{n_chunks}", &n_chunks)
                .replace("{lang}", &lang),
            None => format!("### {path} [{chunk_id}/{n_chunks}] (lang={lang})"),
        }
    }
}

impl Sink for PromptTextSink {
    fn open(&mut self, _context: Option<&RepoContext>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }
        let file = File::create(&self.path)
            .with_context(|| format!("failed to create {}", self.path.display()))?;
        self.writer = Some(BufWriter::new(file));
        Ok(())
    }

    fn write(&mut self, record: &Record) -> Result<()> {
        let heading = self.heading(record);
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("prompt sink {} is not open", self.path.display()))?;
        writer.write_all(heading.as_bytes())?;
        writer.write_all(b"\n\n")?;
        writer.write_all(record.text.as_bytes())?;
        if !record.text.ends_with('\n') {
            writer.write_all(b"\n")?;
        }
        writer.write_all(b"\n")?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::MultiGzDecoder;
    use std::io::Read;

    fn record(path: &str, text: &str) -> Record {
        let mut rec = Record::new(text);
        rec.meta
            .insert("path".into(), serde_json::Value::String(path.into()));
        rec.meta.insert("chunk_id".into(), serde_json::json!(1));
        rec.meta.insert("n_chunks".into(), serde_json::json!(2));
        rec.meta
            .insert("lang".into(), serde_json::Value::String("Python".into()));
        rec
    }

    #[test]
    fn jsonl_header_records_footer_ordering() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.jsonl");
        let mut sink = JsonlSink::new(&path);

        let mut header = Record::new("");
        header.meta.insert("kind".into(), serde_json::json!("run_header"));
        sink.set_header_record(header);

        sink.open(None).unwrap();
        sink.write(&record("file.txt", "body")).unwrap();

        let mut summary = Record::new("");
        summary
            .meta
            .insert("kind".into(), serde_json::json!("run_summary"));
        sink.finalize(&[summary]).unwrap();
        sink.close().unwrap();
        sink.close().unwrap(); // idempotent

        let lines: Vec<String> = std::fs::read_to_string(&path)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect();
        assert_eq!(lines.len(), 3);
        let kinds: Vec<Option<String>> = lines
            .iter()
            .map(|l| {
                let rec: Record = serde_json::from_str(l).unwrap();
                rec.kind().map(str::to_string)
            })
            .collect();
        assert_eq!(kinds[0].as_deref(), Some("run_header"));
        assert_eq!(kinds[1], None);
        assert_eq!(kinds[2].as_deref(), Some("run_summary"));
    }

    #[test]
    fn gzip_jsonl_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.jsonl.gz");
        let mut sink = JsonlSink::new(&path);
        sink.open(None).unwrap();
        sink.write(&record("a.txt", "alpha")).unwrap();
        sink.close().unwrap();

        // Footer appended as a second gzip member must still read back.
        let mut summary = Record::new("");
        summary
            .meta
            .insert("kind".into(), serde_json::json!("run_summary"));
        append_jsonl_line(&path, &summary).unwrap();

        let mut text = String::new();
        MultiGzDecoder::new(File::open(&path).unwrap())
            .read_to_string(&mut text)
            .unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("alpha"));
        assert!(lines[1].contains("run_summary"));
    }

    #[test]
    fn write_on_unopened_sink_errors() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = JsonlSink::new(dir.path().join("x.jsonl"));
        assert!(sink.write(&record("a", "b")).is_err());
    }

    #[test]
    fn prompt_text_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.prompt.txt");
        let mut sink = PromptTextSink::new(&path, None);
        sink.open(None).unwrap();
        sink.write(&record("src/x.py", "print('hi')")).unwrap();
        sink.close().unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "### src/x.py [1/2] (lang=Python)\n\nprint('hi')\n\n");
    }

    #[test]
    fn prompt_custom_heading() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.txt");
        let mut sink =
            PromptTextSink::new(&path, Some(">> {path} ({chunk_id}/{n_chunks})".to_string()));
        sink.open(None).unwrap();
        sink.write(&record("a.md", "body\n")).unwrap();
        sink.close().unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with(">> a.md (1/2)\n\nbody\n"));
    }
}
