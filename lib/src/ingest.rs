/*
 * Description: Ingest orchestration: the streaming phase, central directory
 * reconciliation with spool fallback, and manifest/ref commit.
 *
 * Copyright (C) 2023 Danny McClanahan <dmcC2@hypnicjerk.ai>
 * SPDX-License-Identifier: Apache-2.0
 *
 * Licensed under the Apache License, Version 2.0 (see LICENSE).
 */

//! Ingest orchestration: the streaming phase, central directory
//! reconciliation with spool fallback, and manifest/ref commit.
//!
//! The streaming pass handles every entry it can frame as the upload arrives;
//! results are keyed by local header offset, the one value the local headers
//! and the central directory share verbatim. Whatever the forward pass could
//! not reach (deferred STORE-with-descriptor entries, or anything after a
//! malformed signature) is re-read from the spool at the offsets the central
//! directory vouches for.

use crate::{
  central::{read_central_directory, CentralDirectoryEntry, CentralDirectoryError},
  manifest::{FilesetFile, FilesetManifest},
  process::{spawn_entry_pipeline, EntryProcessError, EntrySink, ProcessedEntry, RawInflater},
  queue::{ByteQueue, ByteQueueError},
  spool::{spool_tee, SpoolError},
  store::{SthenoStore, SthenoStoreError},
  stream::{le_u16, le_u32, ZipStreamError, ZipStreamReader, LOCAL_FILE_HEADER_SIGNATURE},
  EntryName, IngestLimits, SthenoNameFormatError,
};

use bytes::Bytes;
use displaydoc::Display;
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::{
  io::{AsyncReadExt, AsyncSeekExt},
  task,
};

use std::{cmp, collections::HashMap, fmt, io};

/// All types of errors an ingest can die with. Every one of these is fatal:
/// no manifest is written and no ref is moved.
#[derive(Debug, Display, Error)]
pub enum SthenoIngestError {
  /// {0}
  Queue(#[from] ByteQueueError),
  /// {0}
  Stream(#[from] ZipStreamError),
  /// {0}
  Spool(#[from] SpoolError),
  /// central directory error: {0}
  Central(#[from] CentralDirectoryError),
  /// {0}
  Process(#[from] EntryProcessError),
  /// {0}
  Store(#[from] SthenoStoreError),
  /// {0}
  NameFormat(#[from] SthenoNameFormatError),
  /// i/o error during ingest: {0}
  Io(#[from] io::Error),
  /// error joining an ingest task: {0}
  Join(#[from] task::JoinError),
  /// error serializing the manifest: {0}
  ManifestJson(#[from] serde_json::Error),
  /// Too many entries: archive has more than {0}
  TooManyEntries(u64),
  /// Total too large: archive contents exceeded the {0} byte cap
  TotalTooLarge(u64),
  /// Unsupported method in CD: method {method} for {filename:?}
  UnsupportedMethodInCd { filename: String, method: u16 },
  /// deflate body at offset {0} ended before the stream was complete
  DeflateTruncated(u64),
  /// Size mismatch (local header) at offset {offset}: expected {expected}, got {actual}
  SizeMismatchLocalHeader { offset: u64, expected: u64, actual: u64 },
  /// CRC mismatch (local header) at offset {offset}: expected {expected:08x}, got {actual:08x}
  CrcMismatchLocalHeader { offset: u64, expected: u32, actual: u32 },
  /// Size mismatch (DD) at offset {offset}: expected {expected}, got {actual}
  SizeMismatchDescriptor { offset: u64, expected: u64, actual: u64 },
  /// CRC mismatch (DD) at offset {offset}: expected {expected:08x}, got {actual:08x}
  CrcMismatchDescriptor { offset: u64, expected: u32, actual: u32 },
  /// Size mismatch vs CD for {path:?}: CD says {expected}, streamed {actual}
  SizeMismatchCentral { path: String, expected: u64, actual: u64 },
  /// CRC mismatch vs CD for {path:?}: CD says {expected:08x}, streamed {actual:08x}
  CrcMismatchCentral { path: String, expected: u32, actual: u32 },
  /// Fallback size mismatch for {path:?}: CD says {expected}, read {actual}
  FallbackSizeMismatch { path: String, expected: u64, actual: u64 },
  /// Fallback CRC mismatch for {path:?}: CD says {expected:08x}, read {actual:08x}
  FallbackCrcMismatch { path: String, expected: u32, actual: u32 },
  /// Signature mismatch: no local header at spool offset {0}
  FallbackSignatureMismatch(u64),
}

/// One successful ingest: the committed manifest and the ref that now points
/// at it, if any.
#[derive(Clone, Debug)]
pub struct IngestOutcome {
  pub manifest: FilesetManifest,
  pub updated_ref: Option<String>,
}

/// A single archive ingest against a store.
#[derive(Clone, Debug)]
pub struct SthenoIngest {
  pub store: SthenoStore,
  pub limits: IngestLimits,
  /// Ref name to point at the new fileset once the manifest is durable.
  pub update_ref: Option<String>,
  /// Retain the upload spool on disk instead of unlinking it.
  pub keep_spool: bool,
}

struct StreamingOutcome {
  /// Processed entries keyed by `local_header_offset.to_string()`.
  results: HashMap<String, ProcessedEntry>,
  warnings: Vec<String>,
  total_bytes: u64,
}

impl SthenoIngest {
  /// Run the whole ingest over an upload body.
  pub async fn ingest<S, E>(self, body: S) -> Result<IngestOutcome, SthenoIngestError>
  where
    S: futures::Stream<Item=Result<Bytes, E>>+Send+'static,
    E: fmt::Display+Send+'static,
  {
    let Self {
      store,
      limits,
      update_ref,
      keep_spool,
    } = self;

    let (queue, spool_handle) = spool_tee(body, limits.max_zip_bytes);
    let mut reader = ZipStreamReader::new(queue);

    let mut streamed = match streaming_phase(&mut reader, &store, &limits).await {
      Ok(streamed) => {
        /* Let the producer run out so the spool receives the central
         * directory. */
        reader.finish();
        streamed
      },
      Err(stream_error) => {
        drop(reader);
        /* A dead upload shows up to the parser as truncation; the spool side
         * knows whether the body itself was the problem. */
        return Err(match spool_handle.complete().await {
          Err(e @ SpoolError::ZipTooLarge(_)) | Err(e @ SpoolError::Body(_)) => e.into(),
          _ => stream_error,
        });
      },
    };

    let spool = spool_handle.complete().await?;

    let mut cd_file = spool.reopen()?;
    let central = task::spawn_blocking(move || read_central_directory(&mut cd_file)).await??;

    let mut warnings = std::mem::take(&mut streamed.warnings);
    warnings.extend(central.warnings);
    let mut total_bytes = streamed.total_bytes;

    /* Reconcile every CD entry against the streamed results, falling back to
     * spool re-reads for anything the forward pass never produced. */
    let mut files: Vec<FilesetFile> = Vec::new();
    let mut by_path: HashMap<String, usize> = HashMap::new();
    for entry in central.entries.into_iter() {
      if entry.is_directory {
        continue;
      }
      if entry.method != 0 && entry.method != 8 {
        return Err(SthenoIngestError::UnsupportedMethodInCd {
          filename: entry.filename,
          method: entry.method,
        });
      }
      let name = match EntryName::normalize(entry.filename.clone())? {
        Some(name) => name,
        None => continue,
      };

      let key = entry.local_header_offset.to_string();
      let processed = match streamed.results.get(&key) {
        Some(processed) => {
          if processed.raw_size != entry.uncompressed_size {
            return Err(SthenoIngestError::SizeMismatchCentral {
              path: name.into_string(),
              expected: entry.uncompressed_size,
              actual: processed.raw_size,
            });
          }
          if processed.crc32 != entry.crc32 {
            return Err(SthenoIngestError::CrcMismatchCentral {
              path: name.into_string(),
              expected: entry.crc32,
              actual: processed.crc32,
            });
          }
          processed.clone()
        },
        None => {
          let processed = fallback_entry(&store, &limits, &spool, &entry).await?;
          total_bytes += processed.raw_size;
          if total_bytes > limits.max_total_bytes {
            return Err(SthenoIngestError::TotalTooLarge(limits.max_total_bytes));
          }
          if processed.raw_size != entry.uncompressed_size {
            return Err(SthenoIngestError::FallbackSizeMismatch {
              path: name.into_string(),
              expected: entry.uncompressed_size,
              actual: processed.raw_size,
            });
          }
          if processed.crc32 != entry.crc32 {
            return Err(SthenoIngestError::FallbackCrcMismatch {
              path: name.into_string(),
              expected: entry.crc32,
              actual: processed.crc32,
            });
          }
          processed
        },
      };

      let path = name.into_string();
      let file = FilesetFile {
        path: path.clone(),
        sha256: processed.sha256hex,
        size: processed.raw_size,
      };
      match by_path.get(&path).copied() {
        Some(i) => {
          warnings.push(format!("Duplicate path: {} (last wins)", path));
          files[i] = file;
        },
        None => {
          by_path.insert(path, files.len());
          files.push(file);
        },
      }
    }

    let manifest = FilesetManifest::assemble(files, warnings);
    store
      .write_manifest(&manifest.fileset_id, manifest.to_json()?)
      .await?;

    let updated_ref = match update_ref {
      Some(name) if !name.is_empty() => {
        store.write_ref(&name, &manifest.fileset_id).await?;
        Some(name)
      },
      _ => None,
    };

    if keep_spool {
      match spool.keep() {
        Ok((_file, path)) => tracing::info!(spool = %path.display(), "retained ingest spool"),
        Err(e) => tracing::warn!("failed to retain spool: {}", e),
      }
    }
    /* Otherwise the spool unlinks itself on drop; unlink errors are
     * swallowed there too. */

    Ok(IngestOutcome {
      manifest,
      updated_ref,
    })
  }
}

/// Walk local file headers as they arrive, processing every entry the
/// forward pass can frame.
async fn streaming_phase(
  reader: &mut ZipStreamReader,
  store: &SthenoStore,
  limits: &IngestLimits,
) -> Result<StreamingOutcome, SthenoIngestError> {
  let mut results: HashMap<String, ProcessedEntry> = HashMap::new();
  let mut warnings: Vec<String> = Vec::new();
  let mut total_bytes: u64 = 0;
  let mut entry_count: u64 = 0;

  while let Some(header) = reader.next_header().await? {
    entry_count += 1;
    if entry_count > limits.max_entries {
      return Err(SthenoIngestError::TooManyEntries(limits.max_entries));
    }

    if header.has_data_descriptor() && header.is_stored() {
      /* A stored body of unknown length cannot be bounded without scanning
       * for descriptor signatures, which can collide with payload bytes.
       * Stop here; the central directory knows where everything lives. */
      warnings.push(format!(
        "Deferred STORE+DD at offset {}",
        header.local_header_offset
      ));
      tracing::debug!(
        offset = header.local_header_offset,
        "deferring STORE+DD entry to central directory fallback"
      );
      break;
    }

    let offset = header.local_header_offset;
    let (sink, handle) = spawn_entry_pipeline(store.clone(), limits.max_file_bytes);

    let fed: Result<Option<u64>, SthenoIngestError> = if header.has_data_descriptor() {
      feed_unknown_deflate(reader.queue_mut(), offset, &sink)
        .await
        .map(Some)
    } else {
      feed_exact(
        reader.queue_mut(),
        header.compressed_size,
        header.method,
        offset,
        &sink,
      )
      .await
      .map(|()| None)
    };
    drop(sink);

    /* The descriptor (if any) sits right after the body; read it before
     * looking at the pipeline result so the queue stays positioned. */
    let descriptor = match (&fed, header.has_data_descriptor()) {
      (Ok(_), true) => Some(reader.read_data_descriptor(header.zip64_sizes).await?),
      _ => None,
    };

    let (compressed_consumed, processed) = match (fed, handle.await?) {
      (_, Err(pipeline_error)) => return Err(pipeline_error.into()),
      (Err(feed_error), Ok(_)) => return Err(feed_error),
      (Ok(compressed_consumed), Ok(processed)) => (compressed_consumed, processed),
    };

    /* The running total is accounted (and capped) before any cross-checks,
     * the same order the fallback path uses. */
    total_bytes += processed.raw_size;
    if total_bytes > limits.max_total_bytes {
      return Err(SthenoIngestError::TotalTooLarge(limits.max_total_bytes));
    }

    if let Some(descriptor) = descriptor {
      let compressed_consumed =
        compressed_consumed.expect("descriptor entries count compressed bytes");
      if descriptor.compressed_size != compressed_consumed {
        return Err(SthenoIngestError::SizeMismatchDescriptor {
          offset,
          expected: descriptor.compressed_size,
          actual: compressed_consumed,
        });
      }
      if descriptor.uncompressed_size != processed.raw_size {
        return Err(SthenoIngestError::SizeMismatchDescriptor {
          offset,
          expected: descriptor.uncompressed_size,
          actual: processed.raw_size,
        });
      }
      if descriptor.crc32 != processed.crc32 {
        return Err(SthenoIngestError::CrcMismatchDescriptor {
          offset,
          expected: descriptor.crc32,
          actual: processed.crc32,
        });
      }
    } else {
      /* Without a descriptor the local header had real values; hold the
       * entry to them when they were actually filled in. */
      if header.uncompressed_size != 0 && header.uncompressed_size != processed.raw_size {
        return Err(SthenoIngestError::SizeMismatchLocalHeader {
          offset,
          expected: header.uncompressed_size,
          actual: processed.raw_size,
        });
      }
      if header.crc32 != 0 && header.crc32 != processed.crc32 {
        return Err(SthenoIngestError::CrcMismatchLocalHeader {
          offset,
          expected: header.crc32,
          actual: processed.crc32,
        });
      }
    }

    results.insert(offset.to_string(), processed);
  }

  Ok(StreamingOutcome {
    results,
    warnings,
    total_bytes,
  })
}

/// Feed a known-length body into an entry pipeline, inflating if deflated.
async fn feed_exact(
  queue: &mut ByteQueue,
  compressed_size: u64,
  method: u16,
  offset: u64,
  sink: &EntrySink,
) -> Result<(), SthenoIngestError> {
  let mut inflater = (method == 8).then(RawInflater::new);
  let mut finished = method != 8;
  let mut body = queue.body_exact(compressed_size);
  while let Some(chunk) = body.next_chunk().await? {
    match inflater.as_mut() {
      None => sink.push(chunk).await?,
      Some(inflater) => {
        if finished {
          /* The deflate stream ended inside the advertised length; the rest
           * of the body is positioning, not payload. */
          continue;
        }
        let mut out: Vec<u8> = Vec::new();
        let (_consumed, done) = inflater
          .push(&chunk, &mut out)
          .map_err(EntryProcessError::Inflate)?;
        if !out.is_empty() {
          sink.push(Bytes::from(out)).await?;
        }
        finished = done;
      },
    }
  }
  if !finished {
    return Err(SthenoIngestError::DeflateTruncated(offset));
  }
  Ok(())
}

/// Feed an unknown-length deflated body, stopping at the deflate stream end
/// and handing unconsumed bytes back to the queue. Returns the compressed
/// byte count for the descriptor cross-check.
async fn feed_unknown_deflate(
  queue: &mut ByteQueue,
  offset: u64,
  sink: &EntrySink,
) -> Result<u64, SthenoIngestError> {
  let mut inflater = RawInflater::new();
  let mut leftover: Option<Bytes> = None;
  let mut finished = false;
  {
    let mut body = queue.body_unknown();
    while let Some(chunk) = body.next_chunk().await? {
      let mut out: Vec<u8> = Vec::new();
      let (consumed, done) = inflater
        .push(&chunk, &mut out)
        .map_err(EntryProcessError::Inflate)?;
      if !out.is_empty() {
        sink.push(Bytes::from(out)).await?;
      }
      if done {
        if consumed < chunk.len() {
          leftover = Some(chunk.slice(consumed..));
        }
        finished = true;
        break;
      }
    }
  }
  if !finished {
    return Err(SthenoIngestError::DeflateTruncated(offset));
  }
  if let Some(extra) = leftover {
    queue.unread(extra);
  }
  Ok(inflater.total_in())
}

/// Re-process one entry by random access to the spool, for anything the
/// streaming phase never produced.
async fn fallback_entry(
  store: &SthenoStore,
  limits: &IngestLimits,
  spool: &NamedTempFile,
  entry: &CentralDirectoryEntry,
) -> Result<ProcessedEntry, SthenoIngestError> {
  let mut file = tokio::fs::File::from_std(spool.reopen()?);
  file
    .seek(io::SeekFrom::Start(entry.local_header_offset))
    .await?;
  let mut lfh = [0_u8; 30];
  file.read_exact(&mut lfh).await?;
  if le_u32(&lfh, 0) != LOCAL_FILE_HEADER_SIGNATURE {
    return Err(SthenoIngestError::FallbackSignatureMismatch(
      entry.local_header_offset,
    ));
  }
  let name_len = le_u16(&lfh, 26) as i64;
  let extra_len = le_u16(&lfh, 28) as i64;
  file.seek(io::SeekFrom::Current(name_len + extra_len)).await?;

  let (sink, handle) = spawn_entry_pipeline(store.clone(), limits.max_file_bytes);
  let fed: Result<(), SthenoIngestError> = async {
    let mut inflater = (entry.method == 8).then(RawInflater::new);
    let mut finished = entry.method != 8;
    let mut remaining = entry.compressed_size;
    let mut buf = vec![0_u8; 64 * 1024];
    while remaining > 0 {
      let want = cmp::min(buf.len() as u64, remaining) as usize;
      let got = file.read(&mut buf[..want]).await?;
      if got == 0 {
        return Err(
          io::Error::new(io::ErrorKind::UnexpectedEof, "spool ended inside an entry body").into(),
        );
      }
      remaining -= got as u64;
      match inflater.as_mut() {
        None => sink.push(Bytes::copy_from_slice(&buf[..got])).await?,
        Some(inflater) => {
          if finished {
            continue;
          }
          let mut out: Vec<u8> = Vec::new();
          let (_consumed, done) = inflater
            .push(&buf[..got], &mut out)
            .map_err(EntryProcessError::Inflate)?;
          if !out.is_empty() {
            sink.push(Bytes::from(out)).await?;
          }
          finished = done;
        },
      }
    }
    if !finished {
      return Err(SthenoIngestError::DeflateTruncated(entry.local_header_offset));
    }
    Ok(())
  }
  .await;
  drop(sink);

  match (fed, handle.await?) {
    (_, Err(pipeline_error)) => Err(pipeline_error.into()),
    (Err(feed_error), Ok(_)) => Err(feed_error),
    (Ok(()), Ok(processed)) => Ok(processed),
  }
}
