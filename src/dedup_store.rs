use std::path::Path;

use anyhow::{bail, Context, Result};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};

use crate::qc_utils::signature_jaccard;

/// Outcome of a `check_and_add` probe.
#[derive(Debug, Clone, PartialEq)]
pub struct DuplicateResult {
    pub is_duplicate: bool,
    pub match_id: Option<String>,
    pub score: f64,
}

impl DuplicateResult {
    fn none() -> Self {
        Self {
            is_duplicate: false,
            match_id: None,
            score: 0.0,
        }
    }
}

/// Persistent MinHash-LSH store backed by SQLite.
///
/// Three tables: `signatures(doc_id, signature, content_hash)`,
/// `lsh_index(band_key, doc_id)`, `metadata(key, value)`. The metadata rows
/// pin `(n_perm, bands, jaccard_threshold)`; reopening with different
/// parameters is refused.
#[derive(Debug)]
pub struct GlobalDedupStore {
    conn: Connection,
    n_perm: usize,
    bands: usize,
    band_width: usize,
    jaccard_threshold: f64,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS signatures (
    doc_id TEXT PRIMARY KEY,
    signature BLOB NOT NULL,
    content_hash TEXT
);
CREATE TABLE IF NOT EXISTS lsh_index (
    band_key TEXT NOT NULL,
    doc_id TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_lsh_band ON lsh_index(band_key);
CREATE INDEX IF NOT EXISTS idx_sig_content_hash ON signatures(content_hash);
CREATE TABLE IF NOT EXISTS metadata (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
";

impl GlobalDedupStore {
    pub fn open(
        path: &Path,
        n_perm: usize,
        bands: usize,
        jaccard_threshold: f64,
    ) -> Result<Self> {
        Self::validate_params(n_perm, bands, jaccard_threshold)?;
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open dedup store at {}", path.display()))?;
        conn.execute_batch(SCHEMA)?;
        let store = Self {
            conn,
            n_perm,
            bands,
            band_width: n_perm / bands,
            jaccard_threshold,
        };
        store.migrate_content_hash_column()?;
        store.check_or_write_metadata()?;
        Ok(store)
    }

    /// Open an existing store without write access; a missing file is an
    /// error rather than an implicit empty store.
    pub fn open_read_only(
        path: &Path,
        n_perm: usize,
        bands: usize,
        jaccard_threshold: f64,
    ) -> Result<Self> {
        Self::validate_params(n_perm, bands, jaccard_threshold)?;
        if !path.exists() {
            bail!("dedup store not found: {}", path.display());
        }
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
            .with_context(|| format!("failed to open dedup store at {}", path.display()))?;
        let store = Self {
            conn,
            n_perm,
            bands,
            band_width: n_perm / bands,
            jaccard_threshold,
        };
        store.check_metadata_only()?;
        Ok(store)
    }

    fn validate_params(n_perm: usize, bands: usize, jaccard_threshold: f64) -> Result<()> {
        if n_perm == 0 {
            bail!("n_perm must be > 0");
        }
        if n_perm > crate::qc_utils::MINHASH_MAX_PERMS {
            bail!(
                "n_perm must be <= {}; got {n_perm}",
                crate::qc_utils::MINHASH_MAX_PERMS
            );
        }
        if bands == 0 || n_perm % bands != 0 {
            bail!("n_perm ({n_perm}) must be divisible by bands ({bands})");
        }
        if !(0.0..=1.0).contains(&jaccard_threshold) {
            bail!("jaccard_threshold must be within [0, 1]; got {jaccard_threshold}");
        }
        Ok(())
    }

    /// Older databases predate the content_hash column; add it in place.
    fn migrate_content_hash_column(&self) -> Result<()> {
        let mut stmt = self.conn.prepare("PRAGMA table_info(signatures)")?;
        let cols: Vec<String> = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<std::result::Result<_, _>>()?;
        if !cols.iter().any(|c| c == "content_hash") {
            self.conn
                .execute("ALTER TABLE signatures ADD COLUMN content_hash TEXT", [])?;
            self.conn.execute(
                "CREATE INDEX IF NOT EXISTS idx_sig_content_hash ON signatures(content_hash)",
                [],
            )?;
        }
        Ok(())
    }

    fn read_meta(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .conn
            .query_row(
                "SELECT value FROM metadata WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn check_or_write_metadata(&self) -> Result<()> {
        match self.read_meta("n_perm")? {
            Some(_) => self.check_metadata_only(),
            None => {
                self.conn.execute(
                    "INSERT OR REPLACE INTO metadata (key, value) VALUES
                     ('n_perm', ?1), ('bands', ?2), ('jaccard_threshold', ?3)",
                    params![
                        self.n_perm.to_string(),
                        self.bands.to_string(),
                        self.jaccard_threshold.to_string()
                    ],
                )?;
                Ok(())
            }
        }
    }

    fn check_metadata_only(&self) -> Result<()> {
        let stored_n_perm = self.read_meta("n_perm")?;
        let stored_bands = self.read_meta("bands")?;
        let stored_threshold = self.read_meta("jaccard_threshold")?;
        let matches = stored_n_perm.as_deref() == Some(self.n_perm.to_string().as_str())
            && stored_bands.as_deref() == Some(self.bands.to_string().as_str())
            && stored_threshold
                .as_deref()
                .and_then(|s| s.parse::<f64>().ok())
                .map(|t| (t - self.jaccard_threshold).abs() < 1e-9)
                .unwrap_or(false);
        if stored_n_perm.is_some() && !matches {
            bail!(
                "dedup store parameter mismatch: stored (n_perm={:?}, bands={:?}, threshold={:?}) \
                 vs requested (n_perm={}, bands={}, threshold={})",
                stored_n_perm,
                stored_bands,
                stored_threshold,
                self.n_perm,
                self.bands,
                self.jaccard_threshold
            );
        }
        Ok(())
    }

    fn signature_blob(sig: &[u32]) -> Vec<u8> {
        let mut blob = Vec::with_capacity(sig.len() * 4);
        for v in sig {
            blob.extend_from_slice(&v.to_le_bytes());
        }
        blob
    }

    fn signature_from_blob(blob: &[u8]) -> Vec<u32> {
        blob.chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    fn band_key(&self, band: usize, row: &[u32]) -> String {
        let mut bytes = Vec::with_capacity(8 + row.len() * 4);
        bytes.extend_from_slice(&(band as u64).to_le_bytes());
        for v in row {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        format!("{band:02x}:{:016x}", xxhash_rust::xxh3::xxh3_64(&bytes))
    }

    fn band_keys(&self, sig: &[u32]) -> Vec<String> {
        (0..self.bands)
            .map(|b| self.band_key(b, &sig[b * self.band_width..(b + 1) * self.band_width]))
            .collect()
    }

    fn assert_signature(&self, sig: &[u32]) {
        assert_eq!(
            sig.len(),
            self.n_perm,
            "signature length {} does not match n_perm {}",
            sig.len(),
            self.n_perm
        );
    }

    /// Probe for a duplicate of `sig` and optionally insert it.
    ///
    /// An identical `content_hash` short-circuits with score 1.0 before any
    /// LSH probing; otherwise candidates sharing any band key are scored by
    /// exact signature Jaccard against `jaccard_threshold`.
    pub fn check_and_add(
        &mut self,
        doc_id: &str,
        sig: &[u32],
        content_hash: Option<&str>,
        add_if_missing: bool,
    ) -> Result<DuplicateResult> {
        self.assert_signature(sig);

        if let Some(hash) = content_hash {
            let existing: Option<String> = self
                .conn
                .query_row(
                    "SELECT doc_id FROM signatures WHERE content_hash = ?1 AND doc_id != ?2 LIMIT 1",
                    params![hash, doc_id],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(match_id) = existing {
                return Ok(DuplicateResult {
                    is_duplicate: true,
                    match_id: Some(match_id),
                    score: 1.0,
                });
            }
        }

        let keys = self.band_keys(sig);
        let mut candidates: Vec<String> = Vec::new();
        {
            let mut stmt = self
                .conn
                .prepare_cached("SELECT doc_id FROM lsh_index WHERE band_key = ?1")?;
            for key in &keys {
                let ids = stmt.query_map(params![key], |row| row.get::<_, String>(0))?;
                for id in ids {
                    let id = id?;
                    if id != doc_id && !candidates.contains(&id) {
                        candidates.push(id);
                    }
                }
            }
        }

        let mut best: Option<(String, f64)> = None;
        {
            let mut stmt = self
                .conn
                .prepare_cached("SELECT signature FROM signatures WHERE doc_id = ?1")?;
            for cand in &candidates {
                let blob: Option<Vec<u8>> = stmt
                    .query_row(params![cand], |row| row.get(0))
                    .optional()?;
                let Some(blob) = blob else { continue };
                let other = Self::signature_from_blob(&blob);
                if other.len() != sig.len() {
                    continue;
                }
                let score = signature_jaccard(sig, &other);
                if best.as_ref().map(|(_, s)| score > *s).unwrap_or(true) {
                    best = Some((cand.clone(), score));
                }
            }
        }

        let result = match best {
            Some((match_id, score)) if score >= self.jaccard_threshold => DuplicateResult {
                is_duplicate: true,
                match_id: Some(match_id),
                score,
            },
            _ => DuplicateResult::none(),
        };

        if add_if_missing {
            self.insert(doc_id, sig, content_hash, &keys)?;
        }
        Ok(result)
    }

    fn insert(
        &mut self,
        doc_id: &str,
        sig: &[u32],
        content_hash: Option<&str>,
        keys: &[String],
    ) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT OR REPLACE INTO signatures (doc_id, signature, content_hash) VALUES (?1, ?2, ?3)",
            params![doc_id, Self::signature_blob(sig), content_hash],
        )?;
        tx.execute("DELETE FROM lsh_index WHERE doc_id = ?1", params![doc_id])?;
        for key in keys {
            tx.execute(
                "INSERT INTO lsh_index (band_key, doc_id) VALUES (?1, ?2)",
                params![key, doc_id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Insert several signatures without duplicate probing.
    pub fn bulk_add(&mut self, rows: &[(String, Vec<u32>, Option<String>)]) -> Result<()> {
        for (_, sig, _) in rows {
            self.assert_signature(sig);
        }
        for (doc_id, sig, content_hash) in rows {
            let keys = self.band_keys(sig);
            self.insert(doc_id, sig, content_hash.as_deref(), &keys)?;
        }
        Ok(())
    }

    pub fn len(&self) -> Result<u64> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM signatures", [], |row| row.get(0))?)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig_range(n: usize) -> Vec<u32> {
        (0..n as u32).collect()
    }

    #[test]
    fn check_and_add_flags_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("dedup.db");
        let mut store = GlobalDedupStore::open(&db, 64, 16, 0.8).unwrap();
        let sig = sig_range(64);
        let first = store.check_and_add("a", &sig, Some("h1"), true).unwrap();
        assert!(!first.is_duplicate);
        let second = store.check_and_add("b", &sig, Some("h1"), true).unwrap();
        assert!(second.is_duplicate);
        assert_eq!(second.match_id.as_deref(), Some("a"));
        assert!((second.score - 1.0).abs() < 1e-12);
    }

    #[test]
    fn lsh_match_without_content_hash() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("dedup.db");
        let mut store = GlobalDedupStore::open(&db, 64, 16, 0.8).unwrap();
        let sig = sig_range(64);
        store.check_and_add("a", &sig, None, true).unwrap();
        let res = store.check_and_add("b", &sig, None, false).unwrap();
        assert!(res.is_duplicate);
        assert_eq!(res.match_id.as_deref(), Some("a"));
        assert!((res.score - 1.0).abs() < 1e-12);
    }

    #[test]
    fn disjoint_signatures_are_not_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("dedup.db");
        let mut store = GlobalDedupStore::open(&db, 64, 16, 0.8).unwrap();
        store.check_and_add("a", &sig_range(64), None, true).unwrap();
        let other: Vec<u32> = (1000..1064).collect();
        let res = store.check_and_add("b", &other, None, true).unwrap();
        assert!(!res.is_duplicate);
        assert_eq!(store.len().unwrap(), 2);
    }

    #[test]
    #[should_panic(expected = "signature length")]
    fn signature_length_mismatch_panics() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("dedup.db");
        let mut store = GlobalDedupStore::open(&db, 64, 16, 0.8).unwrap();
        let bad = sig_range(10);
        let _ = store.check_and_add("a", &bad, None, true);
    }

    #[test]
    #[should_panic(expected = "signature length")]
    fn bulk_add_length_mismatch_panics() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("dedup.db");
        let mut store = GlobalDedupStore::open(&db, 64, 16, 0.8).unwrap();
        let _ = store.bulk_add(&[("b".to_string(), sig_range(10), None)]);
    }

    #[test]
    fn read_only_missing_db_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.db");
        assert!(GlobalDedupStore::open_read_only(&missing, 64, 16, 0.8).is_err());
    }

    #[test]
    fn metadata_parameter_mismatch_errors() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("dedup.db");
        drop(GlobalDedupStore::open(&db, 128, 32, 0.82).unwrap());
        let err = GlobalDedupStore::open(&db, 256, 32, 0.82).unwrap_err();
        assert!(err.to_string().contains("parameter mismatch"));
    }

    #[test]
    fn invalid_params_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("dedup.db");
        assert!(GlobalDedupStore::open(&db, 0, 1, 0.8).is_err());
        assert!(GlobalDedupStore::open(&db, 10, 3, 0.8).is_err());
        assert!(GlobalDedupStore::open(&db, 10, 5, 1.5).is_err());
    }

    #[test]
    fn exact_dedup_short_circuit() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("dedup.db");
        let mut store = GlobalDedupStore::open(&db, 64, 16, 0.8).unwrap();
        let sig_a = sig_range(64);
        let sig_b: Vec<u32> = sig_a.iter().rev().copied().collect();
        store
            .check_and_add("a", &sig_a, Some("samehash"), true)
            .unwrap();
        let res = store
            .check_and_add("b", &sig_b, Some("samehash"), true)
            .unwrap();
        assert!(res.is_duplicate);
        assert_eq!(res.match_id.as_deref(), Some("a"));
        assert!((res.score - 1.0).abs() < 1e-12);
    }

    #[test]
    fn schema_migration_adds_content_hash() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("old.db");
        {
            let conn = Connection::open(&db).unwrap();
            conn.execute_batch(
                "CREATE TABLE signatures (doc_id TEXT PRIMARY KEY, signature BLOB);
                 CREATE TABLE lsh_index (band_key TEXT, doc_id TEXT);
                 CREATE TABLE metadata (key TEXT PRIMARY KEY, value TEXT);",
            )
            .unwrap();
        }
        drop(GlobalDedupStore::open(&db, 64, 16, 0.8).unwrap());
        let conn = Connection::open(&db).unwrap();
        let mut stmt = conn.prepare("PRAGMA table_info(signatures)").unwrap();
        let cols: Vec<String> = stmt
            .query_map([], |row| row.get::<_, String>(1))
            .unwrap()
            .collect::<std::result::Result<_, _>>()
            .unwrap();
        assert!(cols.iter().any(|c| c == "content_hash"));
    }

    #[test]
    fn reopen_with_same_params_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("dedup.db");
        {
            let mut store = GlobalDedupStore::open(&db, 64, 16, 0.8).unwrap();
            store.check_and_add("a", &sig_range(64), None, true).unwrap();
        }
        let store = GlobalDedupStore::open(&db, 64, 16, 0.8).unwrap();
        assert_eq!(store.len().unwrap(), 1);
    }
}
