/*
 * Description: Per-entry pipeline: raw-deflate decompression, digest/length
 * accounting, brotli compression, atomic store commit.
 *
 * Copyright (C) 2023 Danny McClanahan <dmcC2@hypnicjerk.ai>
 * SPDX-License-Identifier: Apache-2.0
 *
 * Licensed under the Apache License, Version 2.0 (see LICENSE).
 */

//! Per-entry pipeline: raw-deflate decompression, digest/length accounting,
//! brotli compression, atomic store commit.
//!
//! The hashing and compression are synchronous, so each entry runs on a
//! blocking task fed over a bounded channel; the async side pushing raw bytes
//! gets sink-driven backpressure for free.

use crate::store::SthenoStore;

use bytes::Bytes;
use displaydoc::Display;
use flate2::{Decompress, DecompressError, FlushDecompress, Status};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::{sync::mpsc, task};

use std::io::{self, Write};

/// Brotli encoder internal buffer size.
const BROTLI_BUFFER_SIZE: usize = 4096;
/// Brotli quality used for stored objects.
const BROTLI_QUALITY: u32 = 5;
/// Brotli window size (log2).
const BROTLI_LG_WINDOW: u32 = 22;

/// How many raw chunks may be in flight toward one entry's encoder.
const ENTRY_CHANNEL_DEPTH: usize = 8;

/// Errors from one entry's processing pipeline.
#[derive(Debug, Display, Error)]
pub enum EntryProcessError {
  /// i/o error in the entry pipeline: {0}
  Io(#[from] io::Error),
  /// error joining the entry pipeline: {0}
  Join(#[from] task::JoinError),
  /// File too large: entry exceeded the {0} byte cap
  FileTooLarge(u64),
  /// raw-deflate error: {0}
  Inflate(#[from] DecompressError),
  /// the entry pipeline shut down early
  PipelineGone,
}

/// What processing one entry yields: the identity and checks of its raw
/// bytes. Keyed within an ingest by the entry's local header offset.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessedEntry {
  pub sha256hex: String,
  pub raw_size: u64,
  pub crc32: u32,
}

/// Accounting tap over the raw (post-decompression) byte run: SHA-256,
/// CRC-32 (the zip/IEEE polynomial) and length, with a hard size cap.
pub struct DigestTap {
  sha: Sha256,
  crc: crc32fast::Hasher,
  raw_size: u64,
  cap: u64,
}

impl DigestTap {
  pub fn new(cap: u64) -> Self {
    Self {
      sha: Sha256::new(),
      crc: crc32fast::Hasher::new(),
      raw_size: 0,
      cap,
    }
  }

  pub fn update(&mut self, chunk: &[u8]) -> Result<(), EntryProcessError> {
    self.raw_size += chunk.len() as u64;
    if self.raw_size > self.cap {
      return Err(EntryProcessError::FileTooLarge(self.cap));
    }
    self.sha.update(chunk);
    self.crc.update(chunk);
    Ok(())
  }

  pub fn finalize(self) -> ProcessedEntry {
    let Self { sha, crc, raw_size, .. } = self;
    ProcessedEntry {
      sha256hex: hex::encode(sha.finalize()),
      raw_size,
      crc32: crc.finalize(),
    }
  }
}

/// Push-mode raw DEFLATE decoder (no zlib wrapper).
///
/// Reports how much of each input slice it actually consumed, which is how
/// the streaming phase finds the end of a data-descriptor entry without
/// scanning for descriptor signatures.
pub struct RawInflater {
  inner: Decompress,
}

impl RawInflater {
  pub fn new() -> Self {
    Self {
      inner: Decompress::new(false),
    }
  }

  /// Feed compressed input, appending decompressed bytes to `out`. Returns
  /// `(consumed, finished)`; once finished, any unconsumed input belongs to
  /// whatever follows the entry body.
  pub fn push(
    &mut self,
    input: &[u8],
    out: &mut Vec<u8>,
  ) -> Result<(usize, bool), DecompressError> {
    let mut consumed = 0_usize;
    loop {
      let before_in = self.inner.total_in();
      out.reserve(32 * 1024);
      let status = self.inner.decompress_vec(&input[consumed..], out, FlushDecompress::None)?;
      consumed += (self.inner.total_in() - before_in) as usize;
      match status {
        Status::StreamEnd => return Ok((consumed, true)),
        Status::Ok | Status::BufError => {
          if consumed == input.len() {
            return Ok((consumed, false));
          }
          /* Unconsumed input with no stream end means the output vector was
           * full; the reserve() above makes progress next round. */
        },
      }
    }
  }

  /// Total compressed bytes consumed over the decoder's lifetime.
  pub fn total_in(&self) -> u64 { self.inner.total_in() }
}

/// Async handle feeding raw bytes into one entry's pipeline.
pub struct EntrySink {
  tx: mpsc::Sender<Bytes>,
}

impl EntrySink {
  /// Push one raw chunk. An error here means the pipeline already failed;
  /// await its join handle for the real cause.
  pub async fn push(&self, chunk: Bytes) -> Result<(), EntryProcessError> {
    self
      .tx
      .send(chunk)
      .await
      .map_err(|_| EntryProcessError::PipelineGone)
  }
}

/// Spawn the blocking half of one entry's pipeline: tap, brotli encoder,
/// scratch file, atomic commit. Dropping the sink finishes the entry.
pub fn spawn_entry_pipeline(
  store: SthenoStore,
  max_file_bytes: u64,
) -> (EntrySink, task::JoinHandle<Result<ProcessedEntry, EntryProcessError>>) {
  let (tx, mut rx) = mpsc::channel::<Bytes>(ENTRY_CHANNEL_DEPTH);
  let handle = task::spawn_blocking(move || {
    let scratch = store.scratch_file_blocking()?;
    let mut tap = DigestTap::new(max_file_bytes);
    {
      let mut encoder = brotli::CompressorWriter::new(
        scratch.reopen()?,
        BROTLI_BUFFER_SIZE,
        BROTLI_QUALITY,
        BROTLI_LG_WINDOW,
      );
      while let Some(chunk) = rx.blocking_recv() {
        tap.update(&chunk)?;
        encoder.write_all(&chunk)?;
      }
      encoder.flush()?;
      /* Dropping the encoder writes the brotli stream terminator. */
    }
    let processed = tap.finalize();
    store.commit_object_blocking(scratch, &processed.sha256hex)?;
    Ok(processed)
  });
  (EntrySink { tx }, handle)
}
