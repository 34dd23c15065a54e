// SPDX-License-Identifier: MIT OR Apache-2.0
//! Deterministic ZIP bundles.
//!
//! The writer emits store-only entries with a fixed DOS timestamp
//! (2000-01-01T00:00:00), fixed external attributes, entries sorted
//! lexicographically by path, and no extra fields. Two bundles of identical
//! files are byte-identical across OS and clock — which is what lets an
//! artifact hash bind to bytes on disk.
//!
//! The reader is budgeted and fail-closed: entry counts, path bytes, file
//! and total sizes, and the compression ratio are all capped, and unsafe
//! paths (absolute, `..`, backslashes, duplicates, non-NFC) are rejected
//! before any byte is inflated.
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Bundle manifest binding ZIP entries to declared roles.
pub mod manifest;

use unicode_normalization::is_nfc;

pub use manifest::{build_bundle, verify_bundle, BundleManifest, ManifestFile};

/// Fixed DOS date for every entry: 2000-01-01.
const DOS_DATE: u16 = ((2000 - 1980) << 9) | (1 << 5) | 1;
/// Fixed DOS time for every entry: 00:00:00.
const DOS_TIME: u16 = 0;
/// Version needed to extract (2.0 — plain store).
const VERSION_NEEDED: u16 = 20;
/// Version made by: UNIX (3), spec 2.0.
const VERSION_MADE_BY: u16 = (3 << 8) | 20;
/// General-purpose flag: UTF-8 names.
const FLAG_UTF8: u16 = 1 << 11;
/// External attributes: regular file, mode 0644.
const EXTERNAL_ATTRS: u32 = 0o100644 << 16;

// ---------------------------------------------------------------------------
// Budgets and errors
// ---------------------------------------------------------------------------

/// Resource budgets enforced by [`safe_unzip`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnzipBudget {
    /// Maximum number of entries.
    pub max_entries: usize,
    /// Maximum path length in bytes.
    pub max_path_bytes: usize,
    /// Maximum uncompressed size of a single file.
    pub max_file_bytes: u64,
    /// Maximum total uncompressed size.
    pub max_total_bytes: u64,
    /// Maximum uncompressed/compressed ratio for any entry.
    pub max_compression_ratio: u64,
}

impl Default for UnzipBudget {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            max_path_bytes: 512,
            max_file_bytes: 64 * 1024 * 1024,
            max_total_bytes: 256 * 1024 * 1024,
            max_compression_ratio: 100,
        }
    }
}

/// Errors from ZIP writing and reading.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ZipError {
    /// A budget was exceeded.
    #[error("ZIP_BUDGET_EXCEEDED: {which} {actual} > {limit}")]
    BudgetExceeded {
        /// Which budget overflowed.
        which: &'static str,
        /// The configured limit.
        limit: u64,
        /// The observed value.
        actual: u64,
    },

    /// An entry path is unsafe.
    #[error("ZIP_UNSAFE_ENTRY: {path:?}: {reason}")]
    UnsafeEntry {
        /// The offending path.
        path: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// The archive bytes are structurally invalid.
    #[error("malformed archive: {reason}")]
    Malformed {
        /// Parser detail.
        reason: &'static str,
    },
}

impl ZipError {
    /// The stable error-code string for this failure.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::BudgetExceeded { .. } => "ZIP_BUDGET_EXCEEDED",
            Self::UnsafeEntry { .. } | Self::Malformed { .. } => "ZIP_UNSAFE_ENTRY",
        }
    }
}

// ---------------------------------------------------------------------------
// Path safety
// ---------------------------------------------------------------------------

fn check_path(path: &str, budget: &UnzipBudget) -> Result<(), ZipError> {
    let reject = |reason| {
        Err(ZipError::UnsafeEntry {
            path: path.to_string(),
            reason,
        })
    };
    if path.is_empty() {
        return reject("empty path");
    }
    if path.len() > budget.max_path_bytes {
        return Err(ZipError::BudgetExceeded {
            which: "maxPathBytes",
            limit: budget.max_path_bytes as u64,
            actual: path.len() as u64,
        });
    }
    if path.starts_with('/') {
        return reject("absolute path");
    }
    if path.contains('\\') {
        return reject("backslash separator");
    }
    if path.contains(':') {
        return reject("drive or scheme separator");
    }
    if path.ends_with('/') {
        return reject("directory entry");
    }
    if path.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..") {
        return reject("dot or empty path segment");
    }
    if path.chars().any(char::is_control) {
        return reject("control character");
    }
    if !is_nfc(path) {
        return reject("path is not NFC-normalized");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

fn push_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn push_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

/// Write a deterministic store-only archive.
///
/// Entries are sorted lexicographically by path before emission, so input
/// order never leaks into the bytes. Duplicate or unsafe paths are rejected.
///
/// # Errors
///
/// Returns [`ZipError::UnsafeEntry`] for bad paths or duplicates, or
/// [`ZipError::BudgetExceeded`] if an entry would not fit a plain ZIP.
pub fn write_deterministic_zip(files: &[(String, Vec<u8>)]) -> Result<Vec<u8>, ZipError> {
    let budget = UnzipBudget::default();
    let mut sorted: Vec<(&str, &[u8])> = files
        .iter()
        .map(|(p, b)| (p.as_str(), b.as_slice()))
        .collect();
    sorted.sort_by(|a, b| a.0.cmp(b.0));

    for pair in sorted.windows(2) {
        if pair[0].0 == pair[1].0 {
            return Err(ZipError::UnsafeEntry {
                path: pair[0].0.to_string(),
                reason: "duplicate entry",
            });
        }
    }

    let mut out = Vec::new();
    let mut central = Vec::new();
    let entry_count = sorted.len();

    for (path, data) in sorted {
        check_path(path, &budget)?;
        if data.len() as u64 > u64::from(u32::MAX) {
            return Err(ZipError::BudgetExceeded {
                which: "maxFileBytes",
                limit: u64::from(u32::MAX),
                actual: data.len() as u64,
            });
        }
        let crc = crc32fast::hash(data);
        let size = data.len() as u32;
        let offset = out.len() as u32;
        let name = path.as_bytes();

        // Local file header.
        push_u32(&mut out, 0x0403_4b50);
        push_u16(&mut out, VERSION_NEEDED);
        push_u16(&mut out, FLAG_UTF8);
        push_u16(&mut out, 0); // store
        push_u16(&mut out, DOS_TIME);
        push_u16(&mut out, DOS_DATE);
        push_u32(&mut out, crc);
        push_u32(&mut out, size); // compressed == uncompressed
        push_u32(&mut out, size);
        push_u16(&mut out, name.len() as u16);
        push_u16(&mut out, 0); // no extra field
        out.extend_from_slice(name);
        out.extend_from_slice(data);

        // Central directory header.
        push_u32(&mut central, 0x0201_4b50);
        push_u16(&mut central, VERSION_MADE_BY);
        push_u16(&mut central, VERSION_NEEDED);
        push_u16(&mut central, FLAG_UTF8);
        push_u16(&mut central, 0);
        push_u16(&mut central, DOS_TIME);
        push_u16(&mut central, DOS_DATE);
        push_u32(&mut central, crc);
        push_u32(&mut central, size);
        push_u32(&mut central, size);
        push_u16(&mut central, name.len() as u16);
        push_u16(&mut central, 0); // extra
        push_u16(&mut central, 0); // comment
        push_u16(&mut central, 0); // disk start
        push_u16(&mut central, 0); // internal attrs
        push_u32(&mut central, EXTERNAL_ATTRS);
        push_u32(&mut central, offset);
        central.extend_from_slice(name);
    }

    let cd_offset = out.len() as u32;
    let cd_size = central.len() as u32;
    out.extend_from_slice(&central);

    // End of central directory.
    push_u32(&mut out, 0x0605_4b50);
    push_u16(&mut out, 0); // this disk
    push_u16(&mut out, 0); // cd start disk
    push_u16(&mut out, entry_count as u16);
    push_u16(&mut out, entry_count as u16);
    push_u32(&mut out, cd_size);
    push_u32(&mut out, cd_offset);
    push_u16(&mut out, 0); // comment len

    Ok(out)
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn at(bytes: &'a [u8], pos: usize) -> Self {
        Self { bytes, pos }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ZipError> {
        let end = self.pos.checked_add(n).ok_or(ZipError::Malformed {
            reason: "offset overflow",
        })?;
        if end > self.bytes.len() {
            return Err(ZipError::Malformed {
                reason: "truncated archive",
            });
        }
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u16(&mut self) -> Result<u16, ZipError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, ZipError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
}

fn find_eocd(bytes: &[u8]) -> Result<usize, ZipError> {
    // EOCD is 22 bytes plus a comment of up to 64 KiB; scan backwards.
    const EOCD_MIN: usize = 22;
    if bytes.len() < EOCD_MIN {
        return Err(ZipError::Malformed {
            reason: "too small for EOCD",
        });
    }
    let floor = bytes.len().saturating_sub(EOCD_MIN + 0xFFFF);
    let mut pos = bytes.len() - EOCD_MIN;
    loop {
        if bytes[pos..pos + 4] == [0x50, 0x4b, 0x05, 0x06] {
            return Ok(pos);
        }
        if pos == floor {
            return Err(ZipError::Malformed {
                reason: "missing EOCD signature",
            });
        }
        pos -= 1;
    }
}

/// Read a budgeted, store-only archive into `(path, bytes)` pairs in central
/// directory order.
///
/// # Errors
///
/// [`ZipError::BudgetExceeded`], [`ZipError::UnsafeEntry`], or
/// [`ZipError::Malformed`]; all fail closed before returning any data.
pub fn safe_unzip(bytes: &[u8], budget: &UnzipBudget) -> Result<Vec<(String, Vec<u8>)>, ZipError> {
    let eocd_pos = find_eocd(bytes)?;
    let mut eocd = Cursor::at(bytes, eocd_pos + 4);
    let _disk = eocd.u16()?;
    let _cd_disk = eocd.u16()?;
    let _entries_this_disk = eocd.u16()?;
    let entry_count = eocd.u16()? as usize;
    let _cd_size = eocd.u32()?;
    let cd_offset = eocd.u32()? as usize;

    if entry_count > budget.max_entries {
        return Err(ZipError::BudgetExceeded {
            which: "maxEntries",
            limit: budget.max_entries as u64,
            actual: entry_count as u64,
        });
    }

    let mut cd = Cursor::at(bytes, cd_offset);
    let mut out = Vec::with_capacity(entry_count);
    let mut seen = std::collections::BTreeSet::new();
    let mut total: u64 = 0;

    for _ in 0..entry_count {
        if cd.u32()? != 0x0201_4b50 {
            return Err(ZipError::Malformed {
                reason: "bad central directory signature",
            });
        }
        let _made_by = cd.u16()?;
        let _needed = cd.u16()?;
        let _flags = cd.u16()?;
        let method = cd.u16()?;
        let _time = cd.u16()?;
        let _date = cd.u16()?;
        let crc = cd.u32()?;
        let compressed = u64::from(cd.u32()?);
        let uncompressed = u64::from(cd.u32()?);
        let name_len = cd.u16()? as usize;
        let extra_len = cd.u16()? as usize;
        let comment_len = cd.u16()? as usize;
        let _disk_start = cd.u16()?;
        let _internal = cd.u16()?;
        let external = cd.u32()?;
        let lfh_offset = cd.u32()? as usize;
        let name_bytes = cd.take(name_len)?;
        cd.take(extra_len)?;
        cd.take(comment_len)?;

        let path = std::str::from_utf8(name_bytes)
            .map_err(|_| ZipError::Malformed {
                reason: "entry name is not UTF-8",
            })?
            .to_string();
        check_path(&path, budget)?;
        // Symlinks carry S_IFLNK in the unix mode bits.
        if (external >> 16) & 0o170_000 == 0o120_000 {
            return Err(ZipError::UnsafeEntry {
                path,
                reason: "symlink entry",
            });
        }
        if !seen.insert(path.clone()) {
            return Err(ZipError::UnsafeEntry {
                path,
                reason: "duplicate entry",
            });
        }
        if method != 0 {
            return Err(ZipError::UnsafeEntry {
                path,
                reason: "non-store compression method",
            });
        }
        if uncompressed > budget.max_file_bytes {
            return Err(ZipError::BudgetExceeded {
                which: "maxFileBytes",
                limit: budget.max_file_bytes,
                actual: uncompressed,
            });
        }
        if compressed > 0 && uncompressed / compressed > budget.max_compression_ratio {
            return Err(ZipError::BudgetExceeded {
                which: "maxCompressionRatio",
                limit: budget.max_compression_ratio,
                actual: uncompressed / compressed,
            });
        }
        total = total
            .checked_add(uncompressed)
            .ok_or(ZipError::Malformed {
                reason: "total size overflow",
            })?;
        if total > budget.max_total_bytes {
            return Err(ZipError::BudgetExceeded {
                which: "maxTotalBytes",
                limit: budget.max_total_bytes,
                actual: total,
            });
        }

        // Read data via the local header (its name/extra lengths may differ).
        let mut lfh = Cursor::at(bytes, lfh_offset);
        if lfh.u32()? != 0x0403_4b50 {
            return Err(ZipError::Malformed {
                reason: "bad local header signature",
            });
        }
        let _needed = lfh.u16()?;
        let _flags = lfh.u16()?;
        let _method = lfh.u16()?;
        let _time = lfh.u16()?;
        let _date = lfh.u16()?;
        let _crc = lfh.u32()?;
        let _csize = lfh.u32()?;
        let _usize = lfh.u32()?;
        let lfh_name_len = lfh.u16()? as usize;
        let lfh_extra_len = lfh.u16()? as usize;
        lfh.take(lfh_name_len)?;
        lfh.take(lfh_extra_len)?;
        let data = lfh.take(uncompressed as usize)?.to_vec();

        if crc32fast::hash(&data) != crc {
            return Err(ZipError::Malformed {
                reason: "crc mismatch",
            });
        }
        out.push((path, data));
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn files() -> Vec<(String, Vec<u8>)> {
        vec![
            ("manifest.json".to_string(), br#"{"a":1}"#.to_vec()),
            ("evidence/log.txt".to_string(), b"line one\n".to_vec()),
            ("report.json".to_string(), b"{}".to_vec()),
        ]
    }

    #[test]
    fn identical_inputs_yield_identical_bytes() {
        let a = write_deterministic_zip(&files()).unwrap();
        let b = write_deterministic_zip(&files()).unwrap();
        assert_eq!(a, b);
        assert_eq!(
            settld_canon::sha256_hex(&a),
            settld_canon::sha256_hex(&b)
        );
    }

    #[test]
    fn input_order_does_not_leak_into_bytes() {
        let mut reversed = files();
        reversed.reverse();
        assert_eq!(
            write_deterministic_zip(&files()).unwrap(),
            write_deterministic_zip(&reversed).unwrap()
        );
    }

    #[test]
    fn roundtrip_preserves_content_in_sorted_order() {
        let zipped = write_deterministic_zip(&files()).unwrap();
        let out = safe_unzip(&zipped, &UnzipBudget::default()).unwrap();
        let paths: Vec<&str> = out.iter().map(|(p, _)| p.as_str()).collect();
        assert_eq!(paths, vec!["evidence/log.txt", "manifest.json", "report.json"]);
        assert_eq!(out[1].1, br#"{"a":1}"#);
    }

    #[test]
    fn duplicate_paths_rejected_at_write() {
        let dup = vec![
            ("a.txt".to_string(), vec![1]),
            ("a.txt".to_string(), vec![2]),
        ];
        let err = write_deterministic_zip(&dup).unwrap_err();
        assert_eq!(err.code(), "ZIP_UNSAFE_ENTRY");
    }

    #[test]
    fn unsafe_paths_rejected() {
        for path in [
            "/abs.txt",
            "../escape.txt",
            "a/../b.txt",
            "a\\b.txt",
            "c:drive.txt",
            "trailing/",
            "",
        ] {
            let err =
                write_deterministic_zip(&[(path.to_string(), vec![0])]).unwrap_err();
            assert!(
                matches!(err, ZipError::UnsafeEntry { .. }),
                "{path:?} should be unsafe, got {err:?}"
            );
        }
    }

    #[test]
    fn non_nfc_path_rejected() {
        // "é" as 'e' + combining acute is NFD, not NFC.
        let nfd = format!("caf{}{}.txt", 'e', '\u{0301}');
        let err = write_deterministic_zip(&[(nfd, vec![0])]).unwrap_err();
        assert!(matches!(
            err,
            ZipError::UnsafeEntry {
                reason: "path is not NFC-normalized",
                ..
            }
        ));
    }

    #[test]
    fn entry_budget_enforced() {
        let many: Vec<(String, Vec<u8>)> =
            (0..5).map(|i| (format!("f{i}.txt"), vec![0])).collect();
        let zipped = write_deterministic_zip(&many).unwrap();
        let budget = UnzipBudget {
            max_entries: 3,
            ..UnzipBudget::default()
        };
        let err = safe_unzip(&zipped, &budget).unwrap_err();
        assert_eq!(err.code(), "ZIP_BUDGET_EXCEEDED");
    }

    #[test]
    fn file_and_total_budgets_enforced() {
        let zipped =
            write_deterministic_zip(&[("big.bin".to_string(), vec![0u8; 2048])]).unwrap();
        let err = safe_unzip(
            &zipped,
            &UnzipBudget {
                max_file_bytes: 1024,
                ..UnzipBudget::default()
            },
        )
        .unwrap_err();
        assert_eq!(err.code(), "ZIP_BUDGET_EXCEEDED");

        let two = write_deterministic_zip(&[
            ("a.bin".to_string(), vec![0u8; 700]),
            ("b.bin".to_string(), vec![0u8; 700]),
        ])
        .unwrap();
        let err = safe_unzip(
            &two,
            &UnzipBudget {
                max_total_bytes: 1000,
                ..UnzipBudget::default()
            },
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ZipError::BudgetExceeded {
                which: "maxTotalBytes",
                ..
            }
        ));
    }

    #[test]
    fn tampered_data_fails_crc() {
        let mut zipped = write_deterministic_zip(&files()).unwrap();
        // Flip one byte inside the first entry's data region (after the
        // 30-byte local header and the path).
        let data_start = 30 + "evidence/log.txt".len();
        zipped[data_start] ^= 0xFF;
        let err = safe_unzip(&zipped, &UnzipBudget::default()).unwrap_err();
        assert!(matches!(err, ZipError::Malformed { reason: "crc mismatch" }));
    }

    #[test]
    fn garbage_is_malformed_not_panic() {
        assert!(safe_unzip(b"PK", &UnzipBudget::default()).is_err());
        assert!(safe_unzip(&[0u8; 100], &UnzipBudget::default()).is_err());
    }
}
