use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, OnceLock};

use anyhow::{bail, Result};
use blake2::digest::consts::U8;
use blake2::{Blake2b, Digest};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const MINHASH_SEED: u64 = 0x5EED_5EED;
pub const MINHASH_PRIME: u64 = 4_294_967_311; // prime > 2^32
pub const MINHASH_MAX_PERMS: usize = 8192;

type Blake2b64 = Blake2b<U8>;

/// Stable 64-bit hash used for SimHash tokens and MinHash shingles.
fn blake2b64(data: &[u8]) -> u64 {
    let mut h = Blake2b64::new();
    h.update(data);
    let out: [u8; 8] = h.finalize().into();
    u64::from_le_bytes(out)
}

// -----------------------
// SimHash
// -----------------------

/// 64-bit SimHash over lowercased whitespace tokens.
///
/// Deterministic and pure; a single-token input short-circuits to the raw
/// token hash.
pub fn simhash64(text: &str, max_tokens: Option<usize>) -> u64 {
    let cap = max_tokens.unwrap_or(usize::MAX);
    let mut counters = [0i64; 64];
    let mut first_hash = None;
    let mut n_tokens = 0usize;
    for token in text.split_whitespace().take(cap) {
        let h = blake2b64(token.to_lowercase().as_bytes());
        n_tokens += 1;
        if n_tokens == 1 {
            first_hash = Some(h);
        }
        for (i, counter) in counters.iter_mut().enumerate() {
            if (h >> i) & 1 == 1 {
                *counter += 1;
            } else {
                *counter -= 1;
            }
        }
    }
    if n_tokens == 1 {
        return first_hash.unwrap_or(0);
    }
    let mut out = 0u64;
    for (i, counter) in counters.iter().enumerate() {
        if *counter > 0 {
            out |= 1 << i;
        }
    }
    out
}

/// Hamming distance between two SimHash values.
pub fn simhash_distance(a: u64, b: u64) -> u32 {
    (a ^ b).count_ones()
}

// -----------------------
// MinHash coefficients
// -----------------------

struct CoeffInner {
    rng: ChaCha20Rng,
    coeffs: Vec<(u64, u64)>,
}

/// Deterministic `(a, b)` coefficient stream for MinHash permutations.
///
/// Coefficients are grown monotonically under a mutex so concurrent callers
/// always observe a consistent prefix.
pub struct MinhashCoefficients {
    inner: Mutex<CoeffInner>,
}

impl MinhashCoefficients {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(CoeffInner {
                rng: ChaCha20Rng::seed_from_u64(MINHASH_SEED),
                coeffs: Vec::new(),
            }),
        }
    }

    /// Return the first `n_perm` coefficient pairs, generating as needed.
    pub fn prefix(&self, n_perm: usize) -> Result<Vec<(u64, u64)>> {
        if n_perm > MINHASH_MAX_PERMS {
            bail!("n_perm must be <= {MINHASH_MAX_PERMS}; got {n_perm}");
        }
        let mut inner = self.inner.lock().expect("minhash coefficient lock");
        while inner.coeffs.len() < n_perm {
            let a = inner.rng.gen_range(1..MINHASH_PRIME - 1);
            let b = inner.rng.gen_range(0..MINHASH_PRIME - 1);
            inner.coeffs.push((a, b));
        }
        Ok(inner.coeffs[..n_perm].to_vec())
    }
}

impl Default for MinhashCoefficients {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-wide coefficient table shared by the pure-function API.
pub fn shared_coefficients() -> &'static MinhashCoefficients {
    static SHARED: OnceLock<MinhashCoefficients> = OnceLock::new();
    SHARED.get_or_init(MinhashCoefficients::new)
}

// -----------------------
// MinHash signatures
// -----------------------

fn shingle_hashes(text: &str, k: usize, max_shingles: Option<usize>) -> Vec<u32> {
    if k == 0 {
        return Vec::new();
    }
    let mut chars: Vec<char> = text.chars().collect();
    if let Some(cap) = max_shingles {
        chars.truncate(cap + k - 1);
    }
    if chars.len() < k {
        return Vec::new();
    }
    chars
        .windows(k)
        .map(|w| {
            let s: String = w.iter().collect();
            blake2b64(s.as_bytes()) as u32
        })
        .collect()
}

/// Compute a MinHash signature using explicit coefficient pairs.
pub fn minhash_signature_with_coeffs(
    text: &str,
    k: usize,
    coeffs: &[(u64, u64)],
    max_shingles: Option<usize>,
) -> Vec<u32> {
    let hashes = shingle_hashes(text, k, max_shingles);
    coeffs
        .iter()
        .map(|(a, b)| {
            hashes
                .iter()
                .map(|h| (((*a as u128) * (*h as u128) + (*b as u128)) % MINHASH_PRIME as u128) as u32)
                .min()
                .unwrap_or(0xFFFF_FFFF)
        })
        .collect()
}

/// Build a deterministic MinHash signature for `text`.
///
/// Prefix-extension invariant: the first `m` values of an `n`-wide signature
/// equal the `m`-wide signature for every `m <= n`.
pub fn minhash_signature_for_text(
    text: &str,
    k: usize,
    n_perm: usize,
    max_shingles: Option<usize>,
) -> Result<Vec<u32>> {
    let coeffs = shared_coefficients().prefix(n_perm)?;
    Ok(minhash_signature_with_coeffs(text, k, &coeffs, max_shingles))
}

/// Exact Jaccard estimate between two equal-length signatures.
pub fn signature_jaccard(a: &[u32], b: &[u32]) -> f64 {
    assert_eq!(a.len(), b.len(), "signature lengths must match");
    if a.is_empty() {
        return 0.0;
    }
    let equal = a.iter().zip(b.iter()).filter(|(x, y)| x == y).count();
    equal as f64 / a.len() as f64
}

// -----------------------
// Cheap text heuristics
// -----------------------

/// Share of repeated character k-grams, in [0, 1]. `max_grams` caps the
/// number of grams considered so the cost stays bounded on huge inputs.
pub fn repetition_rate(text: &str, k: usize, max_grams: Option<usize>) -> f64 {
    if k == 0 {
        return 0.0;
    }
    let mut chars: Vec<char> = text.chars().collect();
    if let Some(cap) = max_grams {
        chars.truncate(cap + k - 1);
    }
    if chars.len() < k {
        return 0.0;
    }
    let total = chars.len() - k + 1;
    let mut seen: HashSet<String> = HashSet::with_capacity(total.min(4096));
    for w in chars.windows(k) {
        seen.insert(w.iter().collect());
    }
    1.0 - seen.len() as f64 / total as f64
}

// -----------------------
// Duplicate family tracking
// -----------------------

pub const DUP_FAMILY_MAX_EXAMPLES: usize = 3;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DupFamily {
    pub count: u64,
    pub examples: Vec<String>,
}

/// Increment counts for a duplicate family and keep a few sample paths.
pub fn update_dup_family_counts(
    storage: &mut BTreeMap<String, DupFamily>,
    family_id: Option<&str>,
    path: Option<&str>,
) {
    let Some(family_id) = family_id.filter(|f| !f.is_empty()) else {
        return;
    };
    let entry = storage.entry(family_id.to_string()).or_default();
    entry.count += 1;
    if let Some(path) = path {
        if entry.examples.len() < DUP_FAMILY_MAX_EXAMPLES
            && !entry.examples.iter().any(|e| e == path)
        {
            entry.examples.push(path.to_string());
        }
    }
}

/// Largest duplicate families ordered by member count.
pub fn top_dup_families(
    storage: &BTreeMap<String, DupFamily>,
    k: usize,
    min_count: u64,
) -> Vec<Value> {
    let mut rows: Vec<(&String, &DupFamily)> = storage
        .iter()
        .filter(|(_, fam)| fam.count >= min_count)
        .collect();
    rows.sort_by(|a, b| b.1.count.cmp(&a.1.count));
    rows.into_iter()
        .take(k)
        .map(|(id, fam)| {
            json!({
                "dup_family_id": id,
                "count": fam.count,
                "examples": fam.examples,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simhash_single_token_matches_raw_hash() {
        let expected = blake2b64("token".as_bytes());
        assert_eq!(simhash64("Token", None), expected);
    }

    #[test]
    fn simhash_is_deterministic_and_pure() {
        let text = "the quick brown fox jumps over the lazy dog";
        assert_eq!(simhash64(text, None), simhash64(text, None));
        assert_ne!(simhash64(text, None), simhash64("something else here", None));
    }

    #[test]
    fn simhash_max_tokens_caps_input() {
        let a = simhash64("alpha beta gamma delta", Some(2));
        let b = simhash64("alpha beta", None);
        assert_eq!(a, b);
    }

    #[test]
    fn simhash_similar_texts_have_small_distance() {
        let a = simhash64("the quick brown fox jumps over the lazy dog again and again", None);
        let b = simhash64("the quick brown fox jumps over the lazy cat again and again", None);
        let c = simhash64("completely unrelated words about database migrations", None);
        assert!(simhash_distance(a, b) < simhash_distance(a, c));
    }

    #[test]
    fn minhash_prefix_extension_invariant() {
        let text = "abcdefg ".repeat(200);
        let sig = minhash_signature_for_text(&text, 5, 256, None).unwrap();
        assert_eq!(sig.len(), 256);
        assert!(sig[128..].iter().any(|v| *v != 0xFFFF_FFFF));
        assert_eq!(sig, minhash_signature_for_text(&text, 5, 256, None).unwrap());
        assert_eq!(
            sig[..128],
            minhash_signature_for_text(&text, 5, 128, None).unwrap()[..]
        );
    }

    #[test]
    fn minhash_caps_shingles_consistently() {
        let text = "abcd ".repeat(200);
        let k = 4;
        let max_shingles = 20;
        let truncated: String = text.chars().take(max_shingles + k - 1).collect();
        assert_eq!(
            minhash_signature_for_text(&text, k, 32, Some(max_shingles)).unwrap(),
            minhash_signature_for_text(&truncated, k, 32, None).unwrap()
        );
    }

    #[test]
    fn minhash_empty_shingles_yield_sentinel() {
        let sig = minhash_signature_for_text("ab", 5, 8, None).unwrap();
        assert_eq!(sig, vec![0xFFFF_FFFF; 8]);
    }

    #[test]
    fn minhash_rejects_excessive_perm_counts() {
        assert!(minhash_signature_for_text("abc", 2, MINHASH_MAX_PERMS + 1, None).is_err());
    }

    #[test]
    fn minhash_coefficients_are_a_consistent_prefix() {
        let svc = MinhashCoefficients::new();
        let small = svc.prefix(8).unwrap();
        let big = svc.prefix(64).unwrap();
        assert_eq!(small[..], big[..8]);
        for (a, b) in &big {
            assert!(*a >= 1 && *a < MINHASH_PRIME - 1);
            assert!(*b < MINHASH_PRIME - 1);
        }
    }

    #[test]
    fn identical_signatures_have_jaccard_one() {
        let text = "shared content for jaccard".repeat(4);
        let a = minhash_signature_for_text(&text, 5, 64, None).unwrap();
        let b = minhash_signature_for_text(&text, 5, 64, None).unwrap();
        assert_eq!(signature_jaccard(&a, &b), 1.0);
    }

    #[test]
    fn repetition_rate_caps_grams_deterministically() {
        let text = "abcd ".repeat(50);
        let k = 4;
        let max_grams = 10;
        let truncated: String = text.chars().take(max_grams + k - 1).collect();
        let capped = repetition_rate(&text, k, Some(max_grams));
        let reference = repetition_rate(&truncated, k, None);
        assert!((capped - reference).abs() < 1e-12);
    }

    #[test]
    fn repetition_rate_detects_loops() {
        let repetitive = "spam ".repeat(100);
        let varied: String = (0..100).map(|i| format!("word{i} ")).collect();
        assert!(repetition_rate(&repetitive, 4, None) > repetition_rate(&varied, 4, None));
    }

    #[test]
    fn dup_family_counts_and_examples() {
        let mut storage = BTreeMap::new();
        for i in 0..5 {
            update_dup_family_counts(&mut storage, Some("fam"), Some(&format!("p{i}")));
        }
        update_dup_family_counts(&mut storage, None, Some("ignored"));
        update_dup_family_counts(&mut storage, Some("solo"), None);
        let fam = &storage["fam"];
        assert_eq!(fam.count, 5);
        assert_eq!(fam.examples.len(), DUP_FAMILY_MAX_EXAMPLES);

        let top = top_dup_families(&storage, 5, 2);
        assert_eq!(top.len(), 1);
        assert_eq!(top[0]["dup_family_id"], "fam");
        assert_eq!(top[0]["count"], 5);
    }
}
