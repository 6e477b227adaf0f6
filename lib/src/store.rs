/*
 * Description: Sharded on-disk layout for objects, fileset manifests, refs,
 * and scratch space, with atomic rename publishing.
 *
 * Copyright (C) 2023 Danny McClanahan <dmcC2@hypnicjerk.ai>
 * SPDX-License-Identifier: Apache-2.0
 *
 * Licensed under the Apache License, Version 2.0 (see LICENSE).
 */

//! Sharded on-disk layout for objects, fileset manifests, refs, and scratch
//! space, with atomic rename publishing.
//!
//! Nothing is ever mutated in place: every write goes to an exclusively
//! created file under `tmp/` and is published into its final path in one
//! atomic step. Objects are immutable, so they publish by `link(2)` and an
//! `EEXIST` loser simply discards its scratch copy; manifests and refs are
//! last-writer-wins, so they publish by rename.

use displaydoc::Display;
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::task;

use std::{
  io::{self, Write},
  path::{Path, PathBuf},
  sync::Arc,
};

const OBJECTS_DIR: &str = "objects";
const FILESETS_DIR: &str = "filesets";
const REFS_DIR: &str = "refs";
const TMP_DIR: &str = "tmp";

/// Errors from store lookups and publishes.
#[derive(Debug, Display, Error)]
pub enum SthenoStoreError {
  /// i/o error in the store: {0}
  Io(#[from] io::Error),
  /// error joining store i/o: {0}
  Join(#[from] task::JoinError),
  /// not a sha256 hex id: {0:?}
  InvalidHash(String),
  /// invalid ref name: {0:?}
  InvalidRefName(String),
}

/// Check a 64-char lowercase hex object/fileset id.
pub fn validate_hash(hash: &str) -> Result<(), SthenoStoreError> {
  let well_formed = hash.len() == 64
    && hash
      .bytes()
      .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
  if well_formed {
    Ok(())
  } else {
    Err(SthenoStoreError::InvalidHash(hash.to_string()))
  }
}

/// Ref names become single path segments under `refs/`; reject anything that
/// could escape or alias.
pub fn validate_ref_name(name: &str) -> Result<(), SthenoStoreError> {
  let ok = !name.is_empty()
    && name != "."
    && name != ".."
    && !name.contains(['/', '\\', '\0']);
  if ok {
    Ok(())
  } else {
    Err(SthenoStoreError::InvalidRefName(name.to_string()))
  }
}

/// Handle on a store root. Cheap to clone; all coordination is the
/// filesystem itself.
#[derive(Clone, Debug)]
pub struct SthenoStore {
  root: Arc<PathBuf>,
}

impl SthenoStore {
  /// Open (creating the layout if needed) a store at `root`.
  pub async fn open(root: impl AsRef<Path>) -> Result<Self, SthenoStoreError> {
    let root: PathBuf = root.as_ref().to_path_buf();
    let store = Self { root: Arc::new(root) };
    {
      let store = store.clone();
      task::spawn_blocking(move || {
        for dir in [OBJECTS_DIR, FILESETS_DIR, REFS_DIR, TMP_DIR] {
          std::fs::create_dir_all(store.root.join(dir))?;
        }
        Ok::<(), io::Error>(())
      })
      .await??;
    }
    Ok(store)
  }

  pub fn root(&self) -> &Path { &self.root }

  fn object_path(&self, hash: &str) -> PathBuf {
    self.root.join(OBJECTS_DIR).join(&hash[..2]).join(&hash[2..])
  }

  fn fileset_path(&self, fileset_id: &str) -> PathBuf {
    self
      .root
      .join(FILESETS_DIR)
      .join(&fileset_id[..2])
      .join(format!("{}.json", &fileset_id[2..]))
  }

  fn ref_path(&self, name: &str) -> PathBuf { self.root.join(REFS_DIR).join(name) }

  pub(crate) fn tmp_dir(&self) -> PathBuf { self.root.join(TMP_DIR) }

  /// Exclusively created scratch file under `tmp/`, on the same filesystem
  /// as its eventual home so the publishing rename stays atomic.
  pub(crate) fn scratch_file_blocking(&self) -> io::Result<NamedTempFile> {
    tempfile::Builder::new()
      .prefix("stheno-")
      .tempfile_in(self.tmp_dir())
  }

  /// Publish a fully written scratch file as the object `hash`. Returns
  /// false when the object already existed (the scratch copy is discarded).
  pub(crate) fn commit_object_blocking(
    &self,
    scratch: NamedTempFile,
    hash: &str,
  ) -> io::Result<bool> {
    let dest = self.object_path(hash);
    if dest.exists() {
      /* Dedup: whoever got there first wrote identical bytes. */
      drop(scratch);
      return Ok(false);
    }
    std::fs::create_dir_all(dest.parent().expect("object paths are sharded"))?;
    /* Link-then-unlink rather than rename: link(2) fails with EEXIST when a
     * concurrent commit won the race, so the loser keeps the winner's copy
     * intact and discards its own. The scratch unlinks itself on drop. */
    match std::fs::hard_link(scratch.path(), &dest) {
      Ok(()) => Ok(true),
      Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
      Err(e) => Err(e),
    }
  }

  pub async fn has_object(&self, hash: &str) -> Result<bool, SthenoStoreError> {
    validate_hash(hash)?;
    Ok(tokio::fs::try_exists(self.object_path(hash)).await?)
  }

  /// Open a stored object (brotli bytes) for reading, with its on-disk
  /// length. `None` when absent.
  pub async fn open_object(
    &self,
    hash: &str,
  ) -> Result<Option<(tokio::fs::File, u64)>, SthenoStoreError> {
    validate_hash(hash)?;
    match tokio::fs::File::open(self.object_path(hash)).await {
      Ok(file) => {
        let len = file.metadata().await?.len();
        Ok(Some((file, len)))
      },
      Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
      Err(e) => Err(e.into()),
    }
  }

  /// Write (or rewrite: last writer wins) a manifest document.
  pub async fn write_manifest(
    &self,
    fileset_id: &str,
    manifest_json: Vec<u8>,
  ) -> Result<(), SthenoStoreError> {
    validate_hash(fileset_id)?;
    let store = self.clone();
    let dest = self.fileset_path(fileset_id);
    task::spawn_blocking(move || {
      let mut scratch = store.scratch_file_blocking()?;
      scratch.write_all(&manifest_json)?;
      std::fs::create_dir_all(dest.parent().expect("fileset paths are sharded"))?;
      scratch.persist(dest).map_err(|e| e.error)?;
      Ok::<(), io::Error>(())
    })
    .await??;
    Ok(())
  }

  pub async fn read_manifest(&self, fileset_id: &str) -> Result<Option<Vec<u8>>, SthenoStoreError> {
    validate_hash(fileset_id)?;
    match tokio::fs::read(self.fileset_path(fileset_id)).await {
      Ok(bytes) => Ok(Some(bytes)),
      Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
      Err(e) => Err(e.into()),
    }
  }

  /// Point `refs/<name>` at a fileset id (last writer wins).
  pub async fn write_ref(&self, name: &str, fileset_id: &str) -> Result<(), SthenoStoreError> {
    validate_ref_name(name)?;
    validate_hash(fileset_id)?;
    let store = self.clone();
    let dest = self.ref_path(name);
    let content = format!("{}\n", fileset_id);
    task::spawn_blocking(move || {
      let mut scratch = store.scratch_file_blocking()?;
      scratch.write_all(content.as_bytes())?;
      scratch.persist(dest).map_err(|e| e.error)?;
      Ok::<(), io::Error>(())
    })
    .await??;
    Ok(())
  }

  /// Resolve a ref to the fileset id it points at, trimmed.
  pub async fn read_ref(&self, name: &str) -> Result<Option<String>, SthenoStoreError> {
    validate_ref_name(name)?;
    match tokio::fs::read_to_string(self.ref_path(name)).await {
      Ok(content) => Ok(Some(content.trim().to_string())),
      Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
      Err(e) => Err(e.into()),
    }
  }
}
