/*
 * Description: The canonical fileset manifest and its deterministic identity.
 *
 * Copyright (C) 2023 Danny McClanahan <dmcC2@hypnicjerk.ai>
 * SPDX-License-Identifier: Apache-2.0
 *
 * Licensed under the Apache License, Version 2.0 (see LICENSE).
 */

//! The canonical fileset manifest and its deterministic identity.
//!
//! A fileset id is the SHA-256 of a canonical text rendering of the final
//! entry list, so any two archives that normalize to the same contents get
//! the same id no matter how their bytes were arranged.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Manifest schema marker.
pub const MANIFEST_SCHEMA: &str = "fileset.v1";

/// One file of a fileset: normalized path, raw-content hash, raw size.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesetFile {
  pub path: String,
  pub sha256: String,
  pub size: u64,
}

/// The stored manifest document.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FilesetManifest {
  pub schema: String,
  pub fileset_id: String,
  pub file_count: u64,
  pub total_bytes: u64,
  pub files: Vec<FilesetFile>,
  pub warnings: Vec<String>,
}

/// The canonical text form hashed into a fileset id. `files` must already be
/// in final (sorted, deduplicated) order.
pub fn canonical_string(files: &[FilesetFile]) -> String {
  let mut canonical = String::new();
  for FilesetFile { path, sha256, size } in files.iter() {
    canonical.push_str(path);
    canonical.push_str(" sha256:");
    canonical.push_str(sha256);
    canonical.push(' ');
    canonical.push_str(&size.to_string());
    canonical.push('\n');
  }
  canonical
}

/// `SHA-256("v1 " || canonical)`, lowercase hex.
pub fn fileset_id(files: &[FilesetFile]) -> String {
  let mut sha = Sha256::new();
  sha.update(b"v1 ");
  sha.update(canonical_string(files).as_bytes());
  hex::encode(sha.finalize())
}

impl FilesetManifest {
  /// Sort the final entries into canonical order and derive the identity and
  /// totals. Callers have already resolved duplicate paths.
  pub fn assemble(mut files: Vec<FilesetFile>, warnings: Vec<String>) -> Self {
    files.par_sort_unstable_by(|a, b| a.path.cmp(&b.path));
    let fileset_id = fileset_id(&files);
    let total_bytes = files.iter().map(|f| f.size).sum();
    Self {
      schema: MANIFEST_SCHEMA.to_string(),
      fileset_id,
      file_count: files.len() as u64,
      total_bytes,
      files,
      warnings,
    }
  }

  pub fn to_json(&self) -> serde_json::Result<Vec<u8>> { serde_json::to_vec_pretty(self) }
}

#[cfg(test)]
mod test {
  use super::*;

  fn file(path: &str, sha256: &str, size: u64) -> FilesetFile {
    FilesetFile {
      path: path.to_string(),
      sha256: sha256.to_string(),
      size,
    }
  }

  #[test]
  fn canonical_string_shape() {
    let files = vec![
      file("a.txt", "aa".repeat(32).as_str(), 3),
      file("b/c.txt", "bb".repeat(32).as_str(), 10),
    ];
    let expected = format!(
      "a.txt sha256:{} 3\nb/c.txt sha256:{} 10\n",
      "aa".repeat(32),
      "bb".repeat(32)
    );
    assert_eq!(canonical_string(&files), expected);
  }

  #[test]
  fn empty_fileset_id_is_the_hash_of_the_bare_prefix() {
    assert_eq!(fileset_id(&[]), hex::encode(Sha256::digest(b"v1 ")));
  }

  #[test]
  fn assemble_sorts_by_code_point_and_totals() {
    let manifest = FilesetManifest::assemble(
      vec![
        file("b.txt", &"11".repeat(32), 2),
        file("a/z.txt", &"22".repeat(32), 5),
        file("a.txt", &"33".repeat(32), 1),
      ],
      vec![],
    );
    let paths: Vec<&str> = manifest.files.iter().map(|f| f.path.as_str()).collect();
    assert_eq!(paths, vec!["a.txt", "a/z.txt", "b.txt"]);
    assert_eq!(manifest.file_count, 3);
    assert_eq!(manifest.total_bytes, 8);
    assert_eq!(manifest.schema, MANIFEST_SCHEMA);
    assert_eq!(manifest.fileset_id, fileset_id(&manifest.files));
  }

  #[test]
  fn identity_is_order_independent() {
    let forward = FilesetManifest::assemble(
      vec![file("a", &"11".repeat(32), 1), file("b", &"22".repeat(32), 2)],
      vec![],
    );
    let backward = FilesetManifest::assemble(
      vec![file("b", &"22".repeat(32), 2), file("a", &"11".repeat(32), 1)],
      vec![],
    );
    assert_eq!(forward.fileset_id, backward.fileset_id);
  }

  #[test]
  fn manifest_json_round_trips() {
    let manifest = FilesetManifest::assemble(
      vec![file("x.bin", &"ab".repeat(32), 7)],
      vec!["Duplicate path: x.bin (last wins)".to_string()],
    );
    let json = manifest.to_json().unwrap();
    let parsed: FilesetManifest = serde_json::from_slice(&json).unwrap();
    assert_eq!(parsed.fileset_id, manifest.fileset_id);
    assert_eq!(parsed.files, manifest.files);
    assert_eq!(parsed.warnings, manifest.warnings);
  }
}
