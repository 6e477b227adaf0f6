/*
 * Description: Streaming zip ingest into a content-addressable fileset store.
 *
 * Copyright (C) 2023 Danny McClanahan <dmcC2@hypnicjerk.ai>
 * SPDX-License-Identifier: Apache-2.0
 *
 * Licensed under the Apache License, Version 2.0 (see LICENSE).
 */

//! Streaming zip ingest into a content-addressable fileset store.
//!
//! An upload is torn into two concurrent consumers: a spool file on disk and a
//! forward zip parser over the same bytes. Entry payloads are hashed, brotli
//! compressed and committed into the store as they stream past; the central
//! directory is then read back off the spool to reconcile every entry and to
//! recover the ones the forward pass could not safely frame.

/* These clippy lint descriptions are purely non-functional and do not affect the functionality
 * or correctness of the code. */
// #![warn(missing_docs)]

/* Note: run clippy with: rustup run nightly cargo-clippy! */
#![deny(unsafe_code)]
/* Ensure any doctest warnings fails the doctest! */
#![doc(test(attr(deny(warnings))))]
/* Enable all clippy lints except for many of the pedantic ones. It's a shame this needs to be
 * copied and pasted across crates, but there doesn't appear to be a way to include inner
 * attributes from a common source. */
#![deny(
  clippy::all,
  clippy::default_trait_access,
  clippy::expl_impl_clone_on_copy,
  clippy::if_not_else,
  clippy::needless_continue,
  clippy::single_match_else,
  clippy::unseparated_literal_suffix,
  clippy::used_underscore_binding
)]
/* It is often more clear to show that nothing is being moved. */
#![allow(clippy::match_ref_pats)]
/* Subjective style. */
#![allow(
  clippy::derived_hash_with_manual_eq,
  clippy::len_without_is_empty,
  clippy::redundant_field_names,
  clippy::too_many_arguments,
  clippy::single_component_path_imports,
  clippy::double_must_use
)]
/* Default isn't as big a deal as people seem to think it is. */
#![allow(clippy::new_without_default, clippy::new_ret_no_self)]
/* Arc<Mutex> can be more clear than needing to grok Orderings. */
#![allow(clippy::mutex_atomic)]

use displaydoc::Display;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use std::{cmp, fmt};

/// Zip entry names we refuse to map into a fileset.
#[derive(Debug, Display, Error)]
pub enum SthenoNameFormatError {
  /// Invalid filename (NUL): {0:?}
  NameContainsNul(String),
  /// Absolute paths not allowed: {0}
  NameIsAbsolute(String),
  /// Parent path not allowed: {0}
  NameHasParent(String),
}

/// A normalized, forward-slash-separated relative path inside a fileset.
///
/// Produced from central directory filenames by [`EntryName::normalize`]; the
/// manifest is ordered by plain code-point comparison of these.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryName {
  name: String,
}

impl fmt::Display for EntryName {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result { write!(f, "'{}'", self.name) }
}

impl cmp::PartialOrd for EntryName {
  fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> { Some(self.cmp(other)) }
}

impl cmp::Ord for EntryName {
  fn cmp(&self, other: &Self) -> cmp::Ordering { self.name.cmp(&other.name) }
}

impl EntryName {
  pub fn as_str(&self) -> &str { &self.name }

  pub fn into_string(self) -> String { self.name }

  /// Normalize a decoded zip filename into a relative fileset path.
  ///
  /// Backslashes are folded to `/`, repeated leading `./` are stripped, and
  /// empty or `.` components are dropped. Returns `Ok(None)` when nothing is
  /// left over (such entries are simply not part of the fileset).
  pub fn normalize(name: String) -> Result<Option<Self>, SthenoNameFormatError> {
    if name.contains('\0') {
      return Err(SthenoNameFormatError::NameContainsNul(name));
    }
    let slashed = name.replace('\\', "/");
    let mut stripped: &str = &slashed;
    while let Some(rest) = stripped.strip_prefix("./") {
      stripped = rest;
    }
    if stripped.starts_with('/') {
      return Err(SthenoNameFormatError::NameIsAbsolute(name));
    }
    let mut components: Vec<&str> = Vec::new();
    for component in stripped.split('/') {
      if component.is_empty() || component == "." {
        continue;
      }
      if component == ".." {
        return Err(SthenoNameFormatError::NameHasParent(name));
      }
      components.push(component);
    }
    if components.is_empty() {
      return Ok(None);
    }
    Ok(Some(Self {
      name: components.join("/"),
    }))
  }
}

/// Resource caps applied to a single ingest.
#[derive(Copy, Clone, Debug)]
pub struct IngestLimits {
  /// Maximum number of local file headers accepted from one archive.
  pub max_entries: u64,
  /// Maximum decompressed size of any single entry.
  pub max_file_bytes: u64,
  /// Maximum sum of decompressed entry sizes.
  pub max_total_bytes: u64,
  /// Maximum size of the uploaded archive itself.
  pub max_zip_bytes: u64,
}

impl Default for IngestLimits {
  fn default() -> Self {
    Self {
      max_entries: 8_000,
      max_file_bytes: 500 * 1024 * 1024,
      max_total_bytes: 2 * 1024 * 1024 * 1024,
      max_zip_bytes: 300 * 1024 * 1024,
    }
  }
}

pub mod queue;

pub mod stream;

pub mod central;

pub mod spool;

pub mod process;

pub mod store;

pub mod manifest;

pub mod ingest;
