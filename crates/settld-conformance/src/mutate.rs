// SPDX-License-Identifier: MIT OR Apache-2.0
//! Mutation operators.
//!
//! Mutations are part of the case schema, applied to the staged copy of a
//! fixture before verification. The operator set is deliberately small:
//! JSON pointer edits, byte flips, truncation, and file deletion cover every
//! tamper scenario the harness exercises.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::Path;

/// Errors from applying mutations.
#[derive(Debug, thiserror::Error)]
pub enum MutateError {
    /// File I/O failed.
    #[error("mutation io error on {file}: {source}")]
    Io {
        /// Target file.
        file: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The target file is not valid JSON.
    #[error("mutation target {file} is not JSON: {reason}")]
    NotJson {
        /// Target file.
        file: String,
        /// Parse detail.
        reason: String,
    },

    /// A JSON pointer did not resolve.
    #[error("pointer {pointer} not found in {file}")]
    PointerNotFound {
        /// Target file.
        file: String,
        /// The unresolved pointer.
        pointer: String,
    },

    /// A byte offset is out of range.
    #[error("offset {offset} out of range for {file} ({len} bytes)")]
    OffsetOutOfRange {
        /// Target file.
        file: String,
        /// Requested offset.
        offset: usize,
        /// File length.
        len: usize,
    },
}

/// One mutation operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Mutation {
    /// Set the value at a JSON pointer.
    SetJson {
        /// File relative to the staging dir.
        file: String,
        /// JSON pointer (`/a/b/0`).
        pointer: String,
        /// Replacement value.
        value: Value,
    },
    /// Remove the member at a JSON pointer.
    RemoveJson {
        /// File relative to the staging dir.
        file: String,
        /// JSON pointer to the member.
        pointer: String,
    },
    /// XOR one byte with `0xFF`.
    FlipByte {
        /// File relative to the staging dir.
        file: String,
        /// Byte offset.
        offset: usize,
    },
    /// Truncate the file to `len` bytes.
    Truncate {
        /// File relative to the staging dir.
        file: String,
        /// New length.
        len: usize,
    },
    /// Delete the file.
    DeleteFile {
        /// File relative to the staging dir.
        file: String,
    },
}

impl Mutation {
    /// Apply this mutation inside `dir`.
    ///
    /// # Errors
    ///
    /// Returns [`MutateError`] when the target cannot be edited as asked.
    pub fn apply(&self, dir: &Path) -> Result<(), MutateError> {
        match self {
            Self::SetJson { file, pointer, value } => {
                edit_json(dir, file, |doc| {
                    let target = doc.pointer_mut(pointer).ok_or_else(|| {
                        MutateError::PointerNotFound {
                            file: file.clone(),
                            pointer: pointer.clone(),
                        }
                    })?;
                    *target = value.clone();
                    Ok(())
                })
            }
            Self::RemoveJson { file, pointer } => {
                edit_json(dir, file, |doc| {
                    remove_pointer(doc, pointer).ok_or_else(|| MutateError::PointerNotFound {
                        file: file.clone(),
                        pointer: pointer.clone(),
                    })
                })
            }
            Self::FlipByte { file, offset } => {
                let path = dir.join(file);
                let mut bytes = read(&path, file)?;
                if *offset >= bytes.len() {
                    return Err(MutateError::OffsetOutOfRange {
                        file: file.clone(),
                        offset: *offset,
                        len: bytes.len(),
                    });
                }
                bytes[*offset] ^= 0xFF;
                write(&path, file, &bytes)
            }
            Self::Truncate { file, len } => {
                let path = dir.join(file);
                let mut bytes = read(&path, file)?;
                bytes.truncate(*len);
                write(&path, file, &bytes)
            }
            Self::DeleteFile { file } => {
                fs::remove_file(dir.join(file)).map_err(|source| MutateError::Io {
                    file: file.clone(),
                    source,
                })
            }
        }
    }
}

fn read(path: &Path, file: &str) -> Result<Vec<u8>, MutateError> {
    fs::read(path).map_err(|source| MutateError::Io {
        file: file.to_string(),
        source,
    })
}

fn write(path: &Path, file: &str, bytes: &[u8]) -> Result<(), MutateError> {
    fs::write(path, bytes).map_err(|source| MutateError::Io {
        file: file.to_string(),
        source,
    })
}

fn edit_json(
    dir: &Path,
    file: &str,
    edit: impl FnOnce(&mut Value) -> Result<(), MutateError>,
) -> Result<(), MutateError> {
    let path = dir.join(file);
    let bytes = read(&path, file)?;
    let mut doc: Value = serde_json::from_slice(&bytes).map_err(|e| MutateError::NotJson {
        file: file.to_string(),
        reason: e.to_string(),
    })?;
    edit(&mut doc)?;
    let out = serde_json::to_vec(&doc).map_err(|e| MutateError::NotJson {
        file: file.to_string(),
        reason: e.to_string(),
    })?;
    write(&path, file, &out)
}

/// Remove the member a pointer names. Returns `None` when the pointer does
/// not resolve.
fn remove_pointer(doc: &mut Value, pointer: &str) -> Option<()> {
    let (parent_ptr, leaf) = pointer.rsplit_once('/')?;
    let parent = doc.pointer_mut(parent_ptr)?;
    match parent {
        Value::Object(map) => map.remove(&leaf.replace("~1", "/").replace("~0", "~")).map(|_| ()),
        Value::Array(items) => {
            let index: usize = leaf.parse().ok()?;
            if index < items.len() {
                items.remove(index);
                Some(())
            } else {
                None
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn staged(content: &[u8]) -> (tempfile::TempDir, &'static str) {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("fixture.json"), content).unwrap();
        (dir, "fixture.json")
    }

    #[test]
    fn set_json_replaces_pointer_target() {
        let (dir, file) = staged(br#"{"a": {"b": 1}}"#);
        Mutation::SetJson {
            file: file.into(),
            pointer: "/a/b".into(),
            value: json!(2),
        }
        .apply(dir.path())
        .unwrap();
        let doc: Value =
            serde_json::from_slice(&fs::read(dir.path().join(file)).unwrap()).unwrap();
        assert_eq!(doc["a"]["b"], 2);
    }

    #[test]
    fn remove_json_drops_member() {
        let (dir, file) = staged(br#"{"a": {"b": 1, "c": 2}}"#);
        Mutation::RemoveJson {
            file: file.into(),
            pointer: "/a/b".into(),
        }
        .apply(dir.path())
        .unwrap();
        let doc: Value =
            serde_json::from_slice(&fs::read(dir.path().join(file)).unwrap()).unwrap();
        assert_eq!(doc, json!({"a": {"c": 2}}));
    }

    #[test]
    fn flip_byte_xors_offset() {
        let (dir, file) = staged(b"\x00\x01\x02");
        Mutation::FlipByte {
            file: file.into(),
            offset: 1,
        }
        .apply(dir.path())
        .unwrap();
        assert_eq!(fs::read(dir.path().join(file)).unwrap(), b"\x00\xFE\x02");
    }

    #[test]
    fn unknown_pointer_is_an_error() {
        let (dir, file) = staged(br#"{"a": 1}"#);
        let err = Mutation::SetJson {
            file: file.into(),
            pointer: "/missing".into(),
            value: json!(0),
        }
        .apply(dir.path())
        .unwrap_err();
        assert!(matches!(err, MutateError::PointerNotFound { .. }));
    }

    #[test]
    fn truncate_and_delete() {
        let (dir, file) = staged(b"0123456789");
        Mutation::Truncate {
            file: file.into(),
            len: 4,
        }
        .apply(dir.path())
        .unwrap();
        assert_eq!(fs::read(dir.path().join(file)).unwrap(), b"0123");
        Mutation::DeleteFile { file: file.into() }
            .apply(dir.path())
            .unwrap();
        assert!(!dir.path().join(file).exists());
    }

    #[test]
    fn mutation_serde_uses_op_tags() {
        let m: Mutation = serde_json::from_value(json!({
            "op": "flip_byte",
            "file": "cert.json",
            "offset": 12,
        }))
        .unwrap();
        assert_eq!(
            m,
            Mutation::FlipByte {
                file: "cert.json".into(),
                offset: 12
            }
        );
    }
}
