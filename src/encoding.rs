//! Character-encoding detection and normalization.
//!
//! Raw document bytes arrive in unknown encodings (UTF-8 with or without a
//! byte-order mark, the GB family of Chinese encodings, UTF-16). The
//! [`EncodingDetector`] tries a fixed, configurable list of [`Candidate`]s in
//! priority order and returns the text of the first candidate that decodes
//! without a single invalid sequence.
//!
//! # Algorithm
//!
//! 1. Walk the candidate list in order.
//! 2. Each candidate performs a *strict* decode: any malformed sequence
//!    rejects the candidate outright (no replacement characters).
//! 3. The first success wins. UTF-8 is listed first by default because it is
//!    the most constrained encoding: bytes that validate as strict UTF-8 are
//!    very unlikely to be a false positive for anything else.
//! 4. When nothing validates, [`EncodingDetector::detect_lossy`] decodes with
//!    the highest-priority candidate using replacement characters and marks
//!    the result `degraded`.
//!
//! GB2312 and GBK have no dedicated strict decoder in `encoding_rs` (both
//! labels map to the GBK decoder), so their strictness comes from a byte
//! structure check run before decoding: EUC-CN pairs for GB2312 and
//! one/two-byte sequences only for GBK.
//!
//! # Example
//!
//! ```rust
//! use kbase::encoding::{Encoding, EncodingDetector};
//!
//! let detector = EncodingDetector::default();
//! let decoded = detector.detect("plain text".as_bytes()).unwrap();
//! assert_eq!(decoded.encoding, Encoding::Utf8);
//! assert!(!decoded.degraded);
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{KbError, Result};

const UTF8_BOM: [u8; 3] = [0xEF, 0xBB, 0xBF];
const UTF16_LE_BOM: [u8; 2] = [0xFF, 0xFE];
const UTF16_BE_BOM: [u8; 2] = [0xFE, 0xFF];

/// An encoding the detector may try, in configuration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Candidate {
    #[serde(rename = "utf-8-bom")]
    Utf8Bom,
    #[serde(rename = "utf-8")]
    Utf8,
    #[serde(rename = "gb18030")]
    Gb18030,
    #[serde(rename = "gb2312")]
    Gb2312,
    #[serde(rename = "gbk")]
    Gbk,
    /// UTF-16, endianness taken from the byte-order mark.
    #[serde(rename = "utf-16")]
    Utf16,
}

impl Candidate {
    /// Default priority order.
    pub fn defaults() -> Vec<Candidate> {
        vec![
            Candidate::Utf8Bom,
            Candidate::Utf8,
            Candidate::Gb18030,
            Candidate::Gb2312,
            Candidate::Gbk,
            Candidate::Utf16,
        ]
    }

    fn decode_strict(self, bytes: &[u8]) -> Option<(String, Encoding)> {
        match self {
            Candidate::Utf8Bom => {
                let rest = bytes.strip_prefix(&UTF8_BOM)?;
                let text = std::str::from_utf8(rest).ok()?;
                Some((text.to_string(), Encoding::Utf8Bom))
            }
            Candidate::Utf8 => {
                let text = std::str::from_utf8(bytes).ok()?;
                Some((text.to_string(), Encoding::Utf8))
            }
            Candidate::Gb18030 => encoding_rs::GB18030
                .decode_without_bom_handling_and_without_replacement(bytes)
                .map(|text| (text.into_owned(), Encoding::Gb18030)),
            Candidate::Gb2312 => {
                if !is_euc_cn(bytes) {
                    return None;
                }
                encoding_rs::GBK
                    .decode_without_bom_handling_and_without_replacement(bytes)
                    .map(|text| (text.into_owned(), Encoding::Gb2312))
            }
            Candidate::Gbk => {
                if !is_gbk_structured(bytes) {
                    return None;
                }
                encoding_rs::GBK
                    .decode_without_bom_handling_and_without_replacement(bytes)
                    .map(|text| (text.into_owned(), Encoding::Gbk))
            }
            Candidate::Utf16 => {
                let (encoding, payload) = if let Some(rest) = bytes.strip_prefix(&UTF16_LE_BOM) {
                    (Encoding::Utf16Le, rest)
                } else if let Some(rest) = bytes.strip_prefix(&UTF16_BE_BOM) {
                    (Encoding::Utf16Be, rest)
                } else {
                    return None;
                };
                let decoder = if encoding == Encoding::Utf16Le {
                    encoding_rs::UTF_16LE
                } else {
                    encoding_rs::UTF_16BE
                };
                decoder
                    .decode_without_bom_handling_and_without_replacement(payload)
                    .map(|text| (text.into_owned(), encoding))
            }
        }
    }

    fn decode_lossy(self, bytes: &[u8]) -> (String, Encoding) {
        match self {
            Candidate::Utf8Bom => {
                let rest = bytes.strip_prefix(&UTF8_BOM).unwrap_or(bytes);
                (String::from_utf8_lossy(rest).into_owned(), Encoding::Utf8Bom)
            }
            Candidate::Utf8 => (String::from_utf8_lossy(bytes).into_owned(), Encoding::Utf8),
            Candidate::Gb18030 => {
                let (text, _) = encoding_rs::GB18030.decode_without_bom_handling(bytes);
                (text.into_owned(), Encoding::Gb18030)
            }
            Candidate::Gb2312 | Candidate::Gbk => {
                let (text, _) = encoding_rs::GBK.decode_without_bom_handling(bytes);
                let label = if self == Candidate::Gb2312 {
                    Encoding::Gb2312
                } else {
                    Encoding::Gbk
                };
                (text.into_owned(), label)
            }
            Candidate::Utf16 => {
                if let Some(rest) = bytes.strip_prefix(&UTF16_BE_BOM) {
                    let (text, _) = encoding_rs::UTF_16BE.decode_without_bom_handling(rest);
                    (text.into_owned(), Encoding::Utf16Be)
                } else {
                    let rest = bytes.strip_prefix(&UTF16_LE_BOM).unwrap_or(bytes);
                    let (text, _) = encoding_rs::UTF_16LE.decode_without_bom_handling(rest);
                    (text.into_owned(), Encoding::Utf16Le)
                }
            }
        }
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Candidate::Utf8Bom => "utf-8-bom",
            Candidate::Utf8 => "utf-8",
            Candidate::Gb18030 => "gb18030",
            Candidate::Gb2312 => "gb2312",
            Candidate::Gbk => "gbk",
            Candidate::Utf16 => "utf-16",
        };
        f.write_str(label)
    }
}

/// The encoding a document was actually decoded with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Encoding {
    #[serde(rename = "utf-8-bom")]
    Utf8Bom,
    #[serde(rename = "utf-8")]
    Utf8,
    #[serde(rename = "gb18030")]
    Gb18030,
    #[serde(rename = "gb2312")]
    Gb2312,
    #[serde(rename = "gbk")]
    Gbk,
    #[serde(rename = "utf-16le")]
    Utf16Le,
    #[serde(rename = "utf-16be")]
    Utf16Be,
}

impl Encoding {
    /// Encode `text` in this encoding, including any byte-order mark.
    ///
    /// Characters the GB encoders cannot represent are written as HTML
    /// numeric character references, matching `encoding_rs`.
    pub fn encode(self, text: &str) -> Vec<u8> {
        match self {
            Encoding::Utf8Bom => {
                let mut out = UTF8_BOM.to_vec();
                out.extend_from_slice(text.as_bytes());
                out
            }
            Encoding::Utf8 => text.as_bytes().to_vec(),
            Encoding::Gb18030 => encoding_rs::GB18030.encode(text).0.into_owned(),
            Encoding::Gb2312 | Encoding::Gbk => encoding_rs::GBK.encode(text).0.into_owned(),
            Encoding::Utf16Le => {
                let mut out = UTF16_LE_BOM.to_vec();
                for unit in text.encode_utf16() {
                    out.extend_from_slice(&unit.to_le_bytes());
                }
                out
            }
            Encoding::Utf16Be => {
                let mut out = UTF16_BE_BOM.to_vec();
                for unit in text.encode_utf16() {
                    out.extend_from_slice(&unit.to_be_bytes());
                }
                out
            }
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Encoding::Utf8Bom => "utf-8-bom",
            Encoding::Utf8 => "utf-8",
            Encoding::Gb18030 => "gb18030",
            Encoding::Gb2312 => "gb2312",
            Encoding::Gbk => "gbk",
            Encoding::Utf16Le => "utf-16le",
            Encoding::Utf16Be => "utf-16be",
        };
        f.write_str(label)
    }
}

/// Canonical text produced by the detector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    pub text: String,
    pub encoding: Encoding,
    /// True when no candidate validated and the text came from a lossy decode.
    pub degraded: bool,
}

/// Tries candidate encodings in priority order. Pure; holds no state besides
/// the candidate list.
#[derive(Debug, Clone)]
pub struct EncodingDetector {
    candidates: Vec<Candidate>,
}

impl Default for EncodingDetector {
    fn default() -> Self {
        Self {
            candidates: Candidate::defaults(),
        }
    }
}

impl EncodingDetector {
    /// Build a detector over `candidates`, tried in the given order.
    ///
    /// # Errors
    ///
    /// `Config` when the list is empty or names a candidate twice.
    pub fn new(candidates: Vec<Candidate>) -> Result<Self> {
        if candidates.is_empty() {
            return Err(KbError::Config(
                "encoding candidate list must not be empty".to_string(),
            ));
        }
        for (i, c) in candidates.iter().enumerate() {
            if candidates[..i].contains(c) {
                return Err(KbError::Config(format!(
                    "encoding candidate '{}' listed more than once",
                    c
                )));
            }
        }
        Ok(Self { candidates })
    }

    pub fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }

    /// Strict detection: the first candidate that decodes losslessly wins.
    ///
    /// # Errors
    ///
    /// `Decode` when no candidate validates.
    pub fn detect(&self, bytes: &[u8]) -> Result<Decoded> {
        self.candidates
            .iter()
            .find_map(|c| c.decode_strict(bytes))
            .map(|(text, encoding)| Decoded {
                text,
                encoding,
                degraded: false,
            })
            .ok_or_else(|| {
                KbError::Decode(format!(
                    "no candidate encoding ({}) decodes {} bytes without errors",
                    self.candidate_labels(),
                    bytes.len()
                ))
            })
    }

    /// Like [`detect`](Self::detect), falling back to a lossy decode with the
    /// highest-priority candidate (flagged `degraded`).
    pub fn detect_lossy(&self, bytes: &[u8]) -> Decoded {
        match self.detect(bytes) {
            Ok(decoded) => decoded,
            Err(_) => {
                let first = self.candidates.first().copied().unwrap_or(Candidate::Utf8);
                let (text, encoding) = first.decode_lossy(bytes);
                Decoded {
                    text,
                    encoding,
                    degraded: true,
                }
            }
        }
    }

    /// Decode honoring the `allow_degraded` policy.
    pub fn decode(&self, bytes: &[u8], allow_degraded: bool) -> Result<Decoded> {
        if allow_degraded {
            Ok(self.detect_lossy(bytes))
        } else {
            self.detect(bytes)
        }
    }

    fn candidate_labels(&self) -> String {
        self.candidates
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// True when every non-ASCII byte pair lies in the EUC-CN (GB2312) grid.
fn is_euc_cn(bytes: &[u8]) -> bool {
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if b < 0x80 {
            i += 1;
            continue;
        }
        if !(0xA1..=0xF7).contains(&b) {
            return false;
        }
        match bytes.get(i + 1) {
            Some(t) if (0xA1..=0xFE).contains(t) => i += 2,
            _ => return false,
        }
    }
    true
}

/// True when the bytes consist of GBK one- and two-byte sequences only
/// (GB18030 four-byte sequences are rejected).
fn is_gbk_structured(bytes: &[u8]) -> bool {
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if b <= 0x80 {
            // 0x80 is the single-byte euro sign in GBK.
            i += 1;
            continue;
        }
        if b == 0xFF {
            return false;
        }
        match bytes.get(i + 1) {
            Some(&t) if (0x40..=0x7E).contains(&t) || (0x80..=0xFE).contains(&t) => i += 2,
            _ => return false,
        }
    }
    true
}
