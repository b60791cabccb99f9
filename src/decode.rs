use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;
use unicode_normalization::UnicodeNormalization;

/// Provenance for decode and post-processing transformations.
///
/// Flags are orthogonal; `decode_replacements` is only set when *decoding*
/// (not post-processing) introduced replacement characters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodeProvenance {
    pub decode_replacements: bool,
    pub mojibake_repaired: bool,
    pub controls_stripped: usize,
    pub newlines_normalized: bool,
    pub unicode_normalized: bool,
}

impl DecodeProvenance {
    /// True when decoding or post-processing removed/replaced characters.
    pub fn lossy(&self) -> bool {
        self.decode_replacements || self.controls_stripped > 0
    }

    /// True when any transformation modified the decoded text.
    pub fn changed(&self) -> bool {
        self.decode_replacements
            || self.mojibake_repaired
            || self.controls_stripped > 0
            || self.newlines_normalized
            || self.unicode_normalized
    }
}

/// Decoded text content with encoding metadata and provenance flags.
#[derive(Debug, Clone)]
pub struct DecodedText {
    pub text: String,
    pub encoding: String,
    pub had_replacement: bool,
    pub provenance: DecodeProvenance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NormalizeForm {
    Nfc,
    Nfd,
    Nfkc,
    Nfkd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecodeOptions {
    pub normalize: Option<NormalizeForm>,
    pub strip_controls: bool,
    pub fix_mojibake: bool,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            normalize: Some(NormalizeForm::Nfc),
            strip_controls: true,
            fix_mojibake: true,
        }
    }
}

// -----------------------------------------
// Encoding helpers: BOM + UTF-16/32 heuristics
// -----------------------------------------

// Longest signatures first so UTF-32 BOMs are not misread as UTF-16.
const BOMS: &[(&[u8], &str)] = &[
    (&[0x00, 0x00, 0xFE, 0xFF], "utf-32-be"),
    (&[0xFF, 0xFE, 0x00, 0x00], "utf-32-le"),
    (&[0xEF, 0xBB, 0xBF], "utf-8-sig"),
    (&[0xFE, 0xFF], "utf-16-be"),
    (&[0xFF, 0xFE], "utf-16-le"),
];

fn detect_bom(data: &[u8]) -> Option<&'static str> {
    BOMS.iter()
        .find(|(sig, _)| data.starts_with(sig))
        .map(|(_, enc)| *enc)
}

/// Infer UTF-16 endianness from the NUL distribution in a byte sample.
///
/// In ASCII-heavy UTF-16 text one byte of each 2-byte unit is NUL. Count
/// NULs at even versus odd offsets and pick the side that clearly dominates.
fn guess_utf16_endian_from_nuls(sample: &[u8]) -> Option<&'static str> {
    if sample.is_empty() {
        return None;
    }
    let even_nuls = sample.iter().step_by(2).filter(|b| **b == 0).count();
    let odd_nuls = sample.iter().skip(1).step_by(2).filter(|b| **b == 0).count();
    let total = even_nuls + odd_nuls;
    if total < std::cmp::max(4, sample.len() / 64) {
        return None; // need a few to be confident
    }
    if even_nuls > odd_nuls * 2 {
        return Some("utf-16-be"); // 00 xx 00 xx ...
    }
    if odd_nuls > even_nuls * 2 {
        return Some("utf-16-le"); // xx 00 xx 00 ...
    }
    None
}

fn decode_utf16(data: &[u8], big_endian: bool) -> Option<String> {
    if data.len() % 2 != 0 {
        return None;
    }
    let units: Vec<u16> = data
        .chunks_exact(2)
        .map(|c| {
            if big_endian {
                u16::from_be_bytes([c[0], c[1]])
            } else {
                u16::from_le_bytes([c[0], c[1]])
            }
        })
        .collect();
    String::from_utf16(&units).ok()
}

fn decode_utf32(data: &[u8], big_endian: bool) -> Option<String> {
    if data.len() % 4 != 0 {
        return None;
    }
    data.chunks_exact(4)
        .map(|c| {
            let v = if big_endian {
                u32::from_be_bytes([c[0], c[1], c[2], c[3]])
            } else {
                u32::from_le_bytes([c[0], c[1], c[2], c[3]])
            };
            char::from_u32(v)
        })
        .collect()
}

// -----------------------
// cp1252 / latin-1 tables
// -----------------------

// Windows-1252 mappings for 0x80..=0x9F. `None` marks the five positions the
// codepage leaves undefined; a strict decode must fail on them so the chain
// can fall back to latin-1.
const CP1252_HIGH: [Option<char>; 32] = [
    Some('\u{20AC}'), // 0x80 EURO SIGN
    None,             // 0x81
    Some('\u{201A}'), // 0x82
    Some('\u{0192}'), // 0x83
    Some('\u{201E}'), // 0x84
    Some('\u{2026}'), // 0x85
    Some('\u{2020}'), // 0x86
    Some('\u{2021}'), // 0x87
    Some('\u{02C6}'), // 0x88
    Some('\u{2030}'), // 0x89
    Some('\u{0160}'), // 0x8A
    Some('\u{2039}'), // 0x8B
    Some('\u{0152}'), // 0x8C
    None,             // 0x8D
    Some('\u{017D}'), // 0x8E
    None,             // 0x8F
    None,             // 0x90
    Some('\u{2018}'), // 0x91
    Some('\u{2019}'), // 0x92
    Some('\u{201C}'), // 0x93
    Some('\u{201D}'), // 0x94
    Some('\u{2022}'), // 0x95
    Some('\u{2013}'), // 0x96
    Some('\u{2014}'), // 0x97
    Some('\u{02DC}'), // 0x98
    Some('\u{2122}'), // 0x99
    Some('\u{0161}'), // 0x9A
    Some('\u{203A}'), // 0x9B
    Some('\u{0153}'), // 0x9C
    None,             // 0x9D
    Some('\u{017E}'), // 0x9E
    Some('\u{0178}'), // 0x9F
];

fn decode_cp1252_strict(data: &[u8]) -> Option<String> {
    let mut out = String::with_capacity(data.len());
    for &b in data {
        let ch = match b {
            0x80..=0x9F => CP1252_HIGH[(b - 0x80) as usize]?,
            _ => b as char,
        };
        out.push(ch);
    }
    Some(out)
}

fn encode_cp1252_strict(text: &str) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(text.len());
    for ch in text.chars() {
        let cp = ch as u32;
        match cp {
            0x00..=0x7F | 0xA0..=0xFF => out.push(cp as u8),
            0x80..=0x9F => return None, // not representable in cp1252
            _ => {
                let b = CP1252_HIGH
                    .iter()
                    .position(|mapped| *mapped == Some(ch))?;
                out.push(0x80 + b as u8);
            }
        }
    }
    Some(out)
}

fn decode_latin1_replace(data: &[u8]) -> String {
    // latin-1 maps every byte to U+00xx, so this never fails.
    data.iter().map(|&b| b as char).collect()
}

// ----------------------
// Unicode cleanup helpers
// ----------------------

const ZERO_WIDTH: [u32; 5] = [
    0x200B, // ZERO WIDTH SPACE
    0x200C, // ZERO WIDTH NON-JOINER
    0x200D, // ZERO WIDTH JOINER
    0x2060, // WORD JOINER (replacement for ZWNBSP)
    0xFEFF, // ZERO WIDTH NO-BREAK SPACE (BOM when leading)
];

// General-category C approximation: Cc via is_control, Cf/Co via explicit
// ranges. Cs cannot occur in a Rust string; Cn is not enumerated.
fn is_category_c(ch: char) -> bool {
    if ch.is_control() {
        return true;
    }
    let cp = ch as u32;
    matches!(
        cp,
        0x00AD
            | 0x0600..=0x0605
            | 0x061C
            | 0x06DD
            | 0x070F
            | 0x08E2
            | 0x180E
            | 0x200B..=0x200F
            | 0x202A..=0x202E
            | 0x2060..=0x2064
            | 0x2066..=0x206F
            | 0xFEFF
            | 0xFFF9..=0xFFFB
            | 0x110BD
            | 0x110CD
            | 0x1D173..=0x1D17A
            | 0xE0001
            | 0xE0020..=0xE007F
            | 0xE000..=0xF8FF
            | 0xF0000..=0xFFFFD
            | 0x100000..=0x10FFFD
    )
}

fn normalize_newlines(s: &str) -> (String, bool) {
    let normalized = s.replace("\r\n", "\n").replace('\r', "\n");
    let changed = normalized != s;
    (normalized, changed)
}

/// Strip control and zero-width characters while keeping TAB and LF.
fn strip_unsafe_controls(s: &str) -> (String, usize) {
    let before = s.chars().count();
    let filtered: String = s
        .chars()
        .filter(|ch| {
            let keep = *ch == '\n' || *ch == '\t' || !is_category_c(*ch);
            keep && !ZERO_WIDTH.contains(&(*ch as u32))
        })
        .collect();
    let after = filtered.chars().count();
    (filtered, before.saturating_sub(after))
}

fn unicode_normalize(s: &str, form: NormalizeForm) -> (String, bool) {
    let normalized: String = match form {
        NormalizeForm::Nfc => s.nfc().collect(),
        NormalizeForm::Nfd => s.nfd().collect(),
        NormalizeForm::Nfkc => s.nfkc().collect(),
        NormalizeForm::Nfkd => s.nfkd().collect(),
    };
    let changed = normalized != s;
    (normalized, changed)
}

// ----------------------
// Mojibake repair helpers
// ----------------------

// Quick check for typical UTF-8-as-cp1252 sequences (e.g. "Ã©", "â€™", "Â").
fn moji_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new("[\u{C0}-\u{FF}][\u{80}-\u{FF}]|Ã.|â.|Â|Â\\s|\u{FFFD}").unwrap()
    })
}

fn mojibake_score(s: &str) -> usize {
    moji_regex().find_iter(s).count()
}

/// Repair text likely mis-decoded as cp1252 when it was really UTF-8.
///
/// The repair is accepted only when it clearly reduces the mojibake noise.
fn maybe_repair_cp1252_utf8(text: &str) -> Option<String> {
    if mojibake_score(text) == 0 {
        return None;
    }
    let raw = encode_cp1252_strict(text)?;
    let fixed = String::from_utf8(raw).ok()?;
    let fixed_score = mojibake_score(&fixed);
    let orig_score = std::cmp::max(1, mojibake_score(text));
    if fixed_score * 3 < orig_score {
        Some(fixed)
    } else {
        None
    }
}

// ------------------------
// Core decoding entrypoints
// ------------------------

struct PostprocessResult {
    newlines_normalized: bool,
    controls_stripped: usize,
    unicode_normalized: bool,
}

fn postprocess(s: String, opts: &DecodeOptions) -> (String, PostprocessResult) {
    let (s, newlines_normalized) = normalize_newlines(&s);
    let (s, controls_stripped) = if opts.strip_controls {
        strip_unsafe_controls(&s)
    } else {
        (s, 0)
    };
    let (s, unicode_normalized) = match opts.normalize {
        Some(form) => unicode_normalize(&s, form),
        None => (s, false),
    };
    (
        s,
        PostprocessResult {
            newlines_normalized,
            controls_stripped,
            unicode_normalized,
        },
    )
}

fn finalize(
    text: String,
    encoding: &str,
    decode_replacements: bool,
    mojibake_repaired: bool,
    opts: &DecodeOptions,
) -> DecodedText {
    let (processed, post) = postprocess(text, opts);
    DecodedText {
        text: processed,
        encoding: encoding.to_string(),
        had_replacement: decode_replacements,
        provenance: DecodeProvenance {
            decode_replacements,
            mojibake_repaired,
            controls_stripped: post.controls_stripped,
            newlines_normalized: post.newlines_normalized,
            unicode_normalized: post.unicode_normalized,
        },
    }
}

/// Decode bytes into normalized text with heuristics and repairs.
///
/// Strategy:
///   1) Honor BOMs for UTF-8/16/32; utf-8-sig strips the BOM.
///   2) Try UTF-8 strictly; if it fails, guess UTF-16 endianness by NULs.
///   3) Try cp1252 strictly, else latin-1 with optional mojibake fix.
///   4) Normalize newlines, strip controls, apply Unicode normalization.
///
/// Never fails on arbitrary bytes.
pub fn decode_bytes(data: &[u8], opts: &DecodeOptions) -> DecodedText {
    if data.is_empty() {
        return DecodedText {
            text: String::new(),
            encoding: "utf-8".to_string(),
            had_replacement: false,
            provenance: DecodeProvenance::default(),
        };
    }

    // 1) BOM-driven decode
    if let Some(enc) = detect_bom(data) {
        let decoded = match enc {
            "utf-8-sig" => std::str::from_utf8(&data[3..]).ok().map(str::to_string),
            "utf-16-be" => decode_utf16(&data[2..], true),
            "utf-16-le" => decode_utf16(&data[2..], false),
            "utf-32-be" => decode_utf32(&data[4..], true),
            "utf-32-le" => decode_utf32(&data[4..], false),
            _ => None,
        };
        if let Some(text) = decoded {
            return finalize(text, enc, false, false, opts);
        }
        // fall through on strict failure
    }

    // 2) UTF-8 first
    if let Ok(text) = std::str::from_utf8(data) {
        return finalize(text.to_string(), "utf-8", false, false, opts);
    }

    // 2b) Heuristic UTF-16 guess (no BOM)
    let sample = &data[..data.len().min(4096)];
    if let Some(enc) = guess_utf16_endian_from_nuls(sample) {
        if let Some(text) = decode_utf16(data, enc == "utf-16-be") {
            return finalize(text, enc, false, false, opts);
        }
    }

    // 3) cp1252 fallback with optional mojibake repair
    let (mut text, enc_used, decode_replacements) = match decode_cp1252_strict(data) {
        Some(t) => (t, "cp1252", false),
        None => {
            // As a last resort, latin-1 (never fails).
            let t = decode_latin1_replace(data);
            let had = t.contains('\u{FFFD}');
            (t, "latin-1", had)
        }
    };

    let mut mojibake_repaired = false;
    if opts.fix_mojibake {
        if let Some(repaired) = maybe_repair_cp1252_utf8(&text) {
            mojibake_repaired = repaired != text;
            text = repaired;
        }
    }

    finalize(text, enc_used, decode_replacements, mojibake_repaired, opts)
}

/// Read file bytes and decode them, returning `None` on read failure.
pub fn read_decoded_text(
    path: &Path,
    max_bytes: Option<u64>,
    opts: &DecodeOptions,
) -> Option<DecodedText> {
    let mut data = Vec::new();
    let result = match File::open(path) {
        Ok(f) => match max_bytes {
            Some(cap) => f.take(cap).read_to_end(&mut data),
            None => {
                let mut f = f;
                f.read_to_end(&mut data)
            }
        },
        Err(e) => {
            warn!("read_decoded_text: failed to open {}: {}", path.display(), e);
            return None;
        }
    };
    if let Err(e) = result {
        warn!("read_decoded_text: failed to read {}: {}", path.display(), e);
        return None;
    }
    Some(decode_bytes(&data, opts))
}

/// Read file bytes and decode them to a string; empty on read failure.
pub fn read_text(path: &Path, max_bytes: Option<u64>, opts: &DecodeOptions) -> String {
    read_decoded_text(path, max_bytes, opts)
        .map(|d| d.text)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utf16le(s: &str) -> Vec<u8> {
        s.encode_utf16().flat_map(|u| u.to_le_bytes()).collect()
    }

    #[test]
    fn decode_utf8_happy_path() {
        let original = "Hello π – café";
        let dec = decode_bytes(original.as_bytes(), &DecodeOptions::default());
        assert_eq!(dec.text, original);
        assert_eq!(dec.encoding, "utf-8");
        assert!(!dec.had_replacement);
    }

    #[test]
    fn decode_empty_input() {
        let dec = decode_bytes(b"", &DecodeOptions::default());
        assert_eq!(dec.text, "");
        assert_eq!(dec.encoding, "utf-8");
        assert!(!dec.provenance.changed());
    }

    #[test]
    fn decode_handles_utf8_bom() {
        let mut data = vec![0xEF, 0xBB, 0xBF];
        data.extend_from_slice(b"Hi");
        let dec = decode_bytes(&data, &DecodeOptions::default());
        assert_eq!(dec.text, "Hi");
        assert_eq!(dec.encoding, "utf-8-sig");
        assert!(!dec.had_replacement);
    }

    #[test]
    fn decode_utf16_bom_is_stripped() {
        let mut data = vec![0xFF, 0xFE];
        data.extend(utf16le("Hello"));
        let dec = decode_bytes(&data, &DecodeOptions::default());
        assert_eq!(dec.text, "Hello");
        assert_eq!(dec.encoding, "utf-16-le");
        assert!(!dec.had_replacement);
    }

    #[test]
    fn decode_utf32_bom_is_stripped() {
        let mut data = vec![0xFF, 0xFE, 0x00, 0x00];
        for ch in "Hello".chars() {
            data.extend((ch as u32).to_le_bytes());
        }
        let dec = decode_bytes(&data, &DecodeOptions::default());
        assert_eq!(dec.text, "Hello");
        assert_eq!(dec.encoding, "utf-32-le");
    }

    #[test]
    fn decode_utf16_heuristic_without_bom() {
        // Pure-ASCII UTF-16 is also valid UTF-8 (NUL bytes are U+0000), so
        // the strict UTF-8 step may win; either way the NULs must be gone.
        let data = utf16le("Hello world");
        let dec = decode_bytes(&data, &DecodeOptions::default());
        assert_eq!(dec.text, "Hello world");
        assert!(dec.encoding == "utf-16-le" || dec.encoding == "utf-8");
        assert!(!dec.had_replacement);
        assert!(!dec.text.contains('\u{0}'));
    }

    #[test]
    fn decode_utf16_heuristic_non_ascii() {
        // 0xE9 followed by 0x00 is invalid UTF-8, forcing the NUL heuristic.
        let data = utf16le("Héllo wörld");
        let dec = decode_bytes(&data, &DecodeOptions::default());
        assert_eq!(dec.text, "Héllo wörld");
        assert_eq!(dec.encoding, "utf-16-le");
        assert!(!dec.had_replacement);
    }

    #[test]
    fn decode_cp1252_fallback() {
        // "François" in cp1252: ç = 0xE7, which is not valid UTF-8 here.
        let data = b"Fran\xe7ois";
        let dec = decode_bytes(data, &DecodeOptions::default());
        assert_eq!(dec.encoding, "cp1252");
        assert_eq!(dec.text, "François");
        assert!(!dec.had_replacement);
        assert!(!dec.provenance.mojibake_repaired);
    }

    #[test]
    fn decode_latin1_fallback_marks_encoding() {
        // 0x81 and 0x8D are undefined in cp1252, forcing the latin-1 path.
        let data = b"\x81\x8d\xfa";
        let dec = decode_bytes(
            data,
            &DecodeOptions {
                fix_mojibake: false,
                ..DecodeOptions::default()
            },
        );
        assert_eq!(dec.encoding, "latin-1");
        // U+0081 and U+008D are C1 controls, stripped in the post-pass.
        assert_eq!(dec.text, "ú");
        assert!(!dec.had_replacement);
        assert_eq!(dec.provenance.controls_stripped, 2);
    }

    #[test]
    fn decode_normalizes_newlines_and_strips_controls() {
        let text = "line1\r\nline2\rline3\u{200B}\t\u{1}end";
        let dec = decode_bytes(text.as_bytes(), &DecodeOptions::default());
        assert_eq!(dec.text, "line1\nline2\nline3\tend");
        assert!(dec.provenance.newlines_normalized);
        assert!(dec.provenance.controls_stripped > 0);
        assert!(dec.provenance.lossy());
        assert!(dec.provenance.changed());
        assert!(!dec.had_replacement);
    }

    #[test]
    fn mojibake_repair_accepts_obvious_utf8_misdecode() {
        assert_eq!(
            maybe_repair_cp1252_utf8("FranÃ§ois").as_deref(),
            Some("François")
        );
    }

    #[test]
    fn mojibake_repair_rejects_non_cp1252_text() {
        // U+0100 cannot be encoded back to cp1252, so no repair happens.
        assert_eq!(maybe_repair_cp1252_utf8("A\u{100} Ã©"), None);
    }

    #[test]
    fn decode_mojibake_repair_end_to_end() {
        // "FranÃ§ois" encoded as cp1252 bytes: the Ã§ pair is really UTF-8 ç.
        let data = b"Fran\xc3\xa7ois";
        let dec = decode_bytes(data, &DecodeOptions::default());
        // Plain UTF-8 decode succeeds first and yields the mojibake text;
        // repair only applies on the cp1252 fallback path.
        assert_eq!(dec.encoding, "utf-8");
        assert_eq!(dec.text, "Français");
    }

    #[test]
    fn decode_mojibake_repair_on_cp1252_path() {
        // Force the fallback path with a byte sequence that is not valid
        // UTF-8 as a whole: mojibake pair plus a bare 0xE9.
        let data = b"Fran\xc3\xa7ois \xe9t\xe9";
        let dec = decode_bytes(data, &DecodeOptions::default());
        assert_eq!(dec.encoding, "cp1252");
        assert!(dec.provenance.mojibake_repaired || dec.text.contains("Ã§"));
    }

    #[test]
    fn decode_literal_replacement_char_does_not_set_flag() {
        let text = "hello \u{FFFD} world";
        let dec = decode_bytes(
            text.as_bytes(),
            &DecodeOptions {
                fix_mojibake: false,
                ..DecodeOptions::default()
            },
        );
        assert_eq!(dec.text, text);
        assert!(!dec.had_replacement);
        assert!(!dec.provenance.decode_replacements);
    }

    #[test]
    fn decode_unicode_normalization_flags() {
        let text = "Cafe\u{301}";
        let dec = decode_bytes(text.as_bytes(), &DecodeOptions::default());
        assert_eq!(dec.text, "Café");
        assert!(dec.provenance.unicode_normalized);
        assert!(!dec.had_replacement);
    }

    #[test]
    fn ascii_decode_is_identity() {
        let text = "plain ascii text\nwith lines\n";
        let dec = decode_bytes(text.as_bytes(), &DecodeOptions::default());
        assert_eq!(dec.text, text);
        assert!(!dec.provenance.changed());
    }

    #[test]
    fn read_text_full_and_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let full = dir.path().join("sample.txt");
        std::fs::write(&full, b"Hello\nworld").unwrap();
        assert_eq!(
            read_text(&full, None, &DecodeOptions::default()),
            "Hello\nworld"
        );

        let capped = dir.path().join("big.txt");
        std::fs::write(&capped, "A".repeat(10_000)).unwrap();
        let out = read_text(&capped, Some(100), &DecodeOptions::default());
        assert_eq!(out.len(), 100);
    }

    #[test]
    fn read_text_zero_max_bytes_reads_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.txt");
        std::fs::write(&path, b"Hello").unwrap();
        assert_eq!(read_text(&path, Some(0), &DecodeOptions::default()), "");
    }

    #[test]
    fn read_decoded_text_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.txt");
        assert!(read_decoded_text(&missing, None, &DecodeOptions::default()).is_none());
    }
}
