/*
 * Description: End-to-end ingest tests over deterministic hand-built archives.
 *
 * Copyright (C) 2023 Danny McClanahan <dmcC2@hypnicjerk.ai>
 * SPDX-License-Identifier: Apache-2.0
 *
 * Licensed under the Apache License, Version 2.0 (see LICENSE).
 */

//! End-to-end ingest tests over deterministic hand-built archives.
//!
//! The builder below writes zip32 bytes directly so tests can produce the
//! awkward corners (data descriptors, stored-with-descriptor entries, bare
//! zip64 sentinels, bad local-header checksums) that a well-behaved zip
//! library refuses to emit.

use libstheno_cas::{
  ingest::{IngestOutcome, SthenoIngest, SthenoIngestError},
  manifest::{fileset_id, FilesetFile},
  process::EntryProcessError,
  spool::SpoolError,
  store::SthenoStore,
  stream::ZipStreamError,
  IngestLimits, SthenoNameFormatError,
};

use bytes::Bytes;
use sha2::{Digest, Sha256};

use std::{convert::Infallible, io::Read, io::Write};

const METHOD_STORE: u16 = 0;
const METHOD_DEFLATE: u16 = 8;

#[derive(Clone)]
struct TestEntry {
  name: Vec<u8>,
  payload: Vec<u8>,
  method: u16,
  data_descriptor: bool,
  /// Wrong CRC to plant in the local header (the CD keeps the real one).
  lfh_crc_override: Option<u32>,
  /// Write the compressed size as the 0xFFFFFFFF sentinel with no zip64
  /// extra field behind it.
  lfh_csize_sentinel: bool,
}

impl TestEntry {
  fn store(name: &str, payload: &[u8]) -> Self {
    Self {
      name: name.as_bytes().to_vec(),
      payload: payload.to_vec(),
      method: METHOD_STORE,
      data_descriptor: false,
      lfh_crc_override: None,
      lfh_csize_sentinel: false,
    }
  }

  fn deflate(name: &str, payload: &[u8]) -> Self {
    Self {
      method: METHOD_DEFLATE,
      ..Self::store(name, payload)
    }
  }

  fn with_descriptor(mut self) -> Self {
    self.data_descriptor = true;
    self
  }
}

/// Write zip32 bytes for the given entries: local headers with payloads (and
/// descriptors where asked), then a central directory whose values are
/// always correct.
fn build_zip(entries: &[TestEntry]) -> Vec<u8> {
  let mut out: Vec<u8> = Vec::new();
  let mut cd: Vec<u8> = Vec::new();

  for entry in entries {
    let crc = {
      let mut hasher = crc32fast::Hasher::new();
      hasher.update(&entry.payload);
      hasher.finalize()
    };
    let data = if entry.method == METHOD_DEFLATE {
      let mut encoder =
        flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::default());
      encoder.write_all(&entry.payload).unwrap();
      encoder.finish().unwrap()
    } else {
      entry.payload.clone()
    };

    let flags: u16 = if entry.data_descriptor { 0x0008 } else { 0 };
    let (lfh_crc, lfh_csize, lfh_usize) = if entry.data_descriptor {
      (0, 0, 0)
    } else {
      (
        entry.lfh_crc_override.unwrap_or(crc),
        if entry.lfh_csize_sentinel {
          0xFFFF_FFFF
        } else {
          data.len() as u32
        },
        entry.payload.len() as u32,
      )
    };

    let local_offset = out.len() as u32;
    out.extend_from_slice(&0x0403_4b50_u32.to_le_bytes());
    out.extend_from_slice(&20_u16.to_le_bytes());
    out.extend_from_slice(&flags.to_le_bytes());
    out.extend_from_slice(&entry.method.to_le_bytes());
    out.extend_from_slice(&0_u16.to_le_bytes());
    out.extend_from_slice(&0_u16.to_le_bytes());
    out.extend_from_slice(&lfh_crc.to_le_bytes());
    out.extend_from_slice(&lfh_csize.to_le_bytes());
    out.extend_from_slice(&lfh_usize.to_le_bytes());
    out.extend_from_slice(&(entry.name.len() as u16).to_le_bytes());
    out.extend_from_slice(&0_u16.to_le_bytes());
    out.extend_from_slice(&entry.name);
    out.extend_from_slice(&data);
    if entry.data_descriptor {
      out.extend_from_slice(&0x0807_4b50_u32.to_le_bytes());
      out.extend_from_slice(&crc.to_le_bytes());
      out.extend_from_slice(&(data.len() as u32).to_le_bytes());
      out.extend_from_slice(&(entry.payload.len() as u32).to_le_bytes());
    }

    cd.extend_from_slice(&0x0201_4b50_u32.to_le_bytes());
    cd.extend_from_slice(&20_u16.to_le_bytes());
    cd.extend_from_slice(&20_u16.to_le_bytes());
    cd.extend_from_slice(&flags.to_le_bytes());
    cd.extend_from_slice(&entry.method.to_le_bytes());
    cd.extend_from_slice(&0_u16.to_le_bytes());
    cd.extend_from_slice(&0_u16.to_le_bytes());
    cd.extend_from_slice(&crc.to_le_bytes());
    cd.extend_from_slice(&(data.len() as u32).to_le_bytes());
    cd.extend_from_slice(&(entry.payload.len() as u32).to_le_bytes());
    cd.extend_from_slice(&(entry.name.len() as u16).to_le_bytes());
    cd.extend_from_slice(&0_u16.to_le_bytes());
    cd.extend_from_slice(&0_u16.to_le_bytes());
    cd.extend_from_slice(&0_u16.to_le_bytes());
    cd.extend_from_slice(&0_u16.to_le_bytes());
    cd.extend_from_slice(&0_u32.to_le_bytes());
    cd.extend_from_slice(&local_offset.to_le_bytes());
    cd.extend_from_slice(&entry.name);
  }

  let cd_offset = out.len() as u32;
  out.extend_from_slice(&cd);
  out.extend_from_slice(&0x0605_4b50_u32.to_le_bytes());
  out.extend_from_slice(&0_u16.to_le_bytes());
  out.extend_from_slice(&0_u16.to_le_bytes());
  out.extend_from_slice(&(entries.len() as u16).to_le_bytes());
  out.extend_from_slice(&(entries.len() as u16).to_le_bytes());
  out.extend_from_slice(&(cd.len() as u32).to_le_bytes());
  out.extend_from_slice(&cd_offset.to_le_bytes());
  out.extend_from_slice(&0_u16.to_le_bytes());
  out
}

/// Chunk archive bytes the way an HTTP body would arrive, with awkward split
/// points.
fn body_of(bytes: Vec<u8>) -> impl futures::Stream<Item=Result<Bytes, Infallible>> {
  let chunks: Vec<Result<Bytes, Infallible>> = bytes
    .chunks(7)
    .map(|c| Ok(Bytes::copy_from_slice(c)))
    .collect();
  futures::stream::iter(chunks)
}

async fn fresh_store() -> (tempfile::TempDir, SthenoStore) {
  let dir = tempfile::tempdir().unwrap();
  let store = SthenoStore::open(dir.path().join("store")).await.unwrap();
  (dir, store)
}

async fn run_ingest(
  store: &SthenoStore,
  limits: IngestLimits,
  bytes: Vec<u8>,
) -> Result<IngestOutcome, SthenoIngestError> {
  SthenoIngest {
    store: store.clone(),
    limits,
    update_ref: Some("latest".to_string()),
    keep_spool: false,
  }
  .ingest(body_of(bytes))
  .await
}

async fn read_object(store: &SthenoStore, sha: &str) -> Vec<u8> {
  let (file, _len) = store.open_object(sha).await.unwrap().unwrap();
  let mut decoded = Vec::new();
  brotli::Decompressor::new(file.into_std().await, 4096)
    .read_to_end(&mut decoded)
    .unwrap();
  decoded
}

fn sha_hex(payload: &[u8]) -> String { hex::encode(Sha256::digest(payload)) }

#[tokio::test]
async fn empty_archive_yields_the_empty_fileset() {
  let (_dir, store) = fresh_store().await;
  let outcome = run_ingest(&store, IngestLimits::default(), build_zip(&[]))
    .await
    .unwrap();

  assert!(outcome.manifest.files.is_empty());
  assert_eq!(outcome.manifest.file_count, 0);
  assert_eq!(outcome.manifest.total_bytes, 0);
  assert_eq!(
    outcome.manifest.fileset_id,
    hex::encode(Sha256::digest(b"v1 "))
  );
  assert_eq!(outcome.updated_ref.as_deref(), Some("latest"));
  assert_eq!(
    store.read_ref("latest").await.unwrap().unwrap(),
    outcome.manifest.fileset_id
  );
}

#[tokio::test]
async fn single_store_entry_round_trips() {
  let (_dir, store) = fresh_store().await;
  let zip = build_zip(&[TestEntry::store("hello.txt", b"hello\n")]);
  let outcome = run_ingest(&store, IngestLimits::default(), zip).await.unwrap();

  assert_eq!(outcome.manifest.files, vec![FilesetFile {
    path: "hello.txt".to_string(),
    sha256: "5891b5b522d5df086d0ff0b110fbd9d21bb4fc7163af34d08286a2e846f6be03".to_string(),
    size: 6,
  }]);
  assert_eq!(outcome.manifest.total_bytes, 6);
  assert_eq!(
    read_object(&store, &outcome.manifest.files[0].sha256).await,
    b"hello\n"
  );
}

#[tokio::test]
async fn deflate_with_data_descriptor_streams_through() {
  let (_dir, store) = fresh_store().await;
  let zip = build_zip(&[TestEntry::deflate("a/b.txt", b"ABC").with_descriptor()]);
  let outcome = run_ingest(&store, IngestLimits::default(), zip).await.unwrap();

  assert_eq!(outcome.manifest.files.len(), 1);
  let file = &outcome.manifest.files[0];
  assert_eq!(file.path, "a/b.txt");
  assert_eq!(file.size, 3);
  assert_eq!(file.sha256, sha_hex(b"ABC"));
  assert_eq!(read_object(&store, &file.sha256).await, b"ABC");
  assert!(outcome.manifest.warnings.is_empty());
}

#[tokio::test]
async fn store_with_descriptor_defers_to_the_fallback() {
  let (_dir, store) = fresh_store().await;
  /* The stored-with-descriptor entry cannot be framed in the forward pass;
   * it and everything after it must come back through the spool. */
  let zip = build_zip(&[
    TestEntry::store("first.bin", b"stored with dd").with_descriptor(),
    TestEntry::deflate("second.txt", b"after the deferral"),
  ]);
  let outcome = run_ingest(&store, IngestLimits::default(), zip).await.unwrap();

  assert_eq!(outcome.manifest.files.len(), 2);
  assert!(outcome
    .manifest
    .warnings
    .iter()
    .any(|w| w == "Deferred STORE+DD at offset 0"));
  assert_eq!(read_object(&store, &sha_hex(b"stored with dd")).await, b"stored with dd");
  assert_eq!(
    read_object(&store, &sha_hex(b"after the deferral")).await,
    b"after the deferral"
  );
}

#[tokio::test]
async fn duplicate_paths_last_wins_with_a_warning() {
  let (_dir, store) = fresh_store().await;
  let zip = build_zip(&[
    TestEntry::store("dup.txt", b"1"),
    TestEntry::store("dup.txt", b"2"),
  ]);
  let outcome = run_ingest(&store, IngestLimits::default(), zip).await.unwrap();

  assert_eq!(outcome.manifest.files, vec![FilesetFile {
    path: "dup.txt".to_string(),
    sha256: sha_hex(b"2"),
    size: 1,
  }]);
  assert!(outcome
    .manifest
    .warnings
    .contains(&"Duplicate path: dup.txt (last wins)".to_string()));
}

#[tokio::test]
async fn directories_and_empty_normalizations_are_dropped() {
  let (_dir, store) = fresh_store().await;
  let zip = build_zip(&[
    TestEntry::store("dir/", b""),
    TestEntry::store("dir/file.txt", b"contents"),
    TestEntry::store("./", b""),
  ]);
  let outcome = run_ingest(&store, IngestLimits::default(), zip).await.unwrap();

  let paths: Vec<&str> = outcome.manifest.files.iter().map(|f| f.path.as_str()).collect();
  assert_eq!(paths, vec!["dir/file.txt"]);
}

#[tokio::test]
async fn backslash_paths_normalize() {
  let (_dir, store) = fresh_store().await;
  let zip = build_zip(&[TestEntry::store("\\windows\\path\\z.txt", b"w")]);
  let outcome = run_ingest(&store, IngestLimits::default(), zip).await.unwrap();
  assert_eq!(outcome.manifest.files[0].path, "windows/path/z.txt");
}

#[tokio::test]
async fn parent_traversal_fails_the_ingest() {
  let (_dir, store) = fresh_store().await;
  let zip = build_zip(&[TestEntry::store("./x/../y.txt", b"evil")]);
  let err = run_ingest(&store, IngestLimits::default(), zip).await.unwrap_err();
  assert!(matches!(
    err,
    SthenoIngestError::NameFormat(SthenoNameFormatError::NameHasParent(_))
  ));
}

#[tokio::test]
async fn absolute_paths_fail_the_ingest() {
  let (_dir, store) = fresh_store().await;
  let zip = build_zip(&[TestEntry::store("/abs.txt", b"evil")]);
  let err = run_ingest(&store, IngestLimits::default(), zip).await.unwrap_err();
  assert!(matches!(
    err,
    SthenoIngestError::NameFormat(SthenoNameFormatError::NameIsAbsolute(_))
  ));
}

#[tokio::test]
async fn zip64_sentinel_without_extra_is_fatal() {
  let (_dir, store) = fresh_store().await;
  let mut entry = TestEntry::store("big.bin", b"not actually big");
  entry.lfh_csize_sentinel = true;
  let zip = build_zip(&[entry]);
  let err = run_ingest(&store, IngestLimits::default(), zip).await.unwrap_err();
  assert!(matches!(
    err,
    SthenoIngestError::Stream(ZipStreamError::Zip64CompressedSizeMissing(0))
  ));
}

#[tokio::test]
async fn local_header_crc_lies_are_caught() {
  let (_dir, store) = fresh_store().await;
  let mut entry = TestEntry::store("liar.txt", b"contents");
  entry.lfh_crc_override = Some(0x1234_5678);
  let zip = build_zip(&[entry]);
  let err = run_ingest(&store, IngestLimits::default(), zip).await.unwrap_err();
  assert!(matches!(
    err,
    SthenoIngestError::CrcMismatchLocalHeader { offset: 0, .. }
  ));
}

#[tokio::test]
async fn oversize_upload_is_rejected_at_the_cap() {
  let (_dir, store) = fresh_store().await;
  let zip = build_zip(&[TestEntry::store("a.txt", &[b'a'; 256])]);
  let cap = zip.len() as u64 - 1;
  let limits = IngestLimits {
    max_zip_bytes: cap,
    ..IngestLimits::default()
  };
  let err = run_ingest(&store, limits, zip).await.unwrap_err();
  assert!(matches!(
    err,
    SthenoIngestError::Spool(SpoolError::ZipTooLarge(n)) if n == cap
  ));
}

#[tokio::test]
async fn entry_count_cap_is_enforced() {
  let (_dir, store) = fresh_store().await;
  let zip = build_zip(&[
    TestEntry::store("a", b"1"),
    TestEntry::store("b", b"2"),
    TestEntry::store("c", b"3"),
  ]);
  let limits = IngestLimits {
    max_entries: 2,
    ..IngestLimits::default()
  };
  let err = run_ingest(&store, limits, zip).await.unwrap_err();
  assert!(matches!(err, SthenoIngestError::TooManyEntries(2)));
}

#[tokio::test]
async fn per_file_cap_is_enforced() {
  let (_dir, store) = fresh_store().await;
  let zip = build_zip(&[TestEntry::store("big.txt", b"abcdef")]);
  let limits = IngestLimits {
    max_file_bytes: 4,
    ..IngestLimits::default()
  };
  let err = run_ingest(&store, limits, zip).await.unwrap_err();
  assert!(matches!(
    err,
    SthenoIngestError::Process(EntryProcessError::FileTooLarge(4))
  ));
}

#[tokio::test]
async fn total_cap_is_enforced() {
  let (_dir, store) = fresh_store().await;
  let zip = build_zip(&[
    TestEntry::store("a.txt", b"aaaa"),
    TestEntry::store("b.txt", b"bbbb"),
  ]);
  let limits = IngestLimits {
    max_total_bytes: 6,
    ..IngestLimits::default()
  };
  let err = run_ingest(&store, limits, zip).await.unwrap_err();
  assert!(matches!(err, SthenoIngestError::TotalTooLarge(6)));
}

#[tokio::test]
async fn truncated_uploads_fail() {
  let (_dir, store) = fresh_store().await;
  let mut zip = build_zip(&[TestEntry::store("a.txt", b"payload")]);
  zip.truncate(zip.len() / 2);
  assert!(run_ingest(&store, IngestLimits::default(), zip).await.is_err());
}

#[tokio::test]
async fn reingest_is_deterministic_and_idempotent() {
  let (_dir, store) = fresh_store().await;
  let zip = build_zip(&[
    TestEntry::store("b.txt", b"two"),
    TestEntry::deflate("a.txt", b"one"),
  ]);
  let first = run_ingest(&store, IngestLimits::default(), zip.clone()).await.unwrap();
  let second = run_ingest(&store, IngestLimits::default(), zip).await.unwrap();
  assert_eq!(first.manifest.fileset_id, second.manifest.fileset_id);

  /* The manifest is sorted by code point, independent of archive order. */
  let paths: Vec<&str> = first.manifest.files.iter().map(|f| f.path.as_str()).collect();
  assert_eq!(paths, vec!["a.txt", "b.txt"]);
  assert_eq!(
    first.manifest.fileset_id,
    fileset_id(&first.manifest.files)
  );
}

#[tokio::test]
async fn equivalent_archives_share_a_fileset_id() {
  let (_dir, store) = fresh_store().await;
  /* Same normalized contents, different wire encodings. */
  let stored = build_zip(&[TestEntry::store("x.txt", b"same bytes")]);
  let deflated = build_zip(&[TestEntry::deflate("x.txt", b"same bytes").with_descriptor()]);

  let a = run_ingest(&store, IngestLimits::default(), stored).await.unwrap();
  let b = run_ingest(&store, IngestLimits::default(), deflated).await.unwrap();
  assert_eq!(a.manifest.fileset_id, b.manifest.fileset_id);
}

#[tokio::test]
async fn archives_from_the_zip_library_ingest_cleanly() {
  let (_dir, store) = fresh_store().await;

  let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
  let deflated: zip::write::FileOptions =
    zip::write::FileOptions::default().compression_method(zip::CompressionMethod::Deflated);
  let stored: zip::write::FileOptions =
    zip::write::FileOptions::default().compression_method(zip::CompressionMethod::Stored);
  writer.add_directory("src", stored).unwrap();
  writer.start_file("src/main.rs", deflated).unwrap();
  writer.write_all(b"fn main() { println!(\"hi\"); }\n").unwrap();
  writer.start_file("README.md", stored).unwrap();
  writer.write_all(b"# readme\n").unwrap();
  let bytes = writer.finish().unwrap().into_inner();

  let outcome = run_ingest(&store, IngestLimits::default(), bytes).await.unwrap();
  let paths: Vec<&str> = outcome.manifest.files.iter().map(|f| f.path.as_str()).collect();
  assert_eq!(paths, vec!["README.md", "src/main.rs"]);
  assert_eq!(
    read_object(&store, &outcome.manifest.files[1].sha256).await,
    b"fn main() { println!(\"hi\"); }\n"
  );
  assert_eq!(
    outcome.manifest.total_bytes,
    outcome.manifest.files.iter().map(|f| f.size).sum::<u64>()
  );
}

#[tokio::test]
async fn ingest_failure_leaves_no_manifest_or_ref() {
  let (_dir, store) = fresh_store().await;
  let zip = build_zip(&[
    TestEntry::store("good.txt", b"good"),
    TestEntry::store("/bad.txt", b"bad"),
  ]);
  let err = run_ingest(&store, IngestLimits::default(), zip).await.unwrap_err();
  assert!(matches!(err, SthenoIngestError::NameFormat(_)));
  /* The failed ingest must not have moved the ref. */
  assert!(store.read_ref("latest").await.unwrap().is_none());
}
