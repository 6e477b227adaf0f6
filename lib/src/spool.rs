/*
 * Description: Duplicates the upload body into an on-disk spool file and the
 * byte-queue feeding the zip stream reader.
 *
 * Copyright (C) 2023 Danny McClanahan <dmcC2@hypnicjerk.ai>
 * SPDX-License-Identifier: Apache-2.0
 *
 * Licensed under the Apache License, Version 2.0 (see LICENSE).
 */

//! Duplicates the upload body into an on-disk spool file and the byte-queue
//! feeding the zip stream reader.
//!
//! The spool is an exclusively created temp file in the OS temp directory; it
//! unlinks itself on drop, which is also how post-ingest cleanup happens. The
//! queue push comes after the spool write so that a paused parser pauses the
//! upload, never the other way around.

use crate::queue::{byte_queue, ByteQueue, ByteQueueWriter};

use bytes::Bytes;
use displaydoc::Display;
use futures::stream::StreamExt;
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::{io::AsyncWriteExt, task};

use std::{fmt, io};

/// Ways the upload can fail before zip parsing even matters.
#[derive(Debug, Display, Error)]
pub enum SpoolError {
  /// i/o error writing the spool: {0}
  Io(#[from] io::Error),
  /// ZIP too large: upload exceeded the {0} byte cap
  ZipTooLarge(u64),
  /// error reading the upload body: {0}
  Body(String),
  /// the zip parser went away mid-upload
  QueueClosed,
  /// error joining the spool writer: {0}
  Join(#[from] task::JoinError),
}

/// Completion future for the spool writer. Resolves to the spool temp file
/// once every body chunk is durably written to it.
pub struct SpoolHandle {
  task: task::JoinHandle<Result<NamedTempFile, SpoolError>>,
}

impl SpoolHandle {
  pub async fn complete(self) -> Result<NamedTempFile, SpoolError> { self.task.await? }
}

/// Start teeing `body` into a fresh spool file and a byte-queue. Returns the
/// consumer half of the queue and the spool completion handle.
pub fn spool_tee<S, E>(body: S, max_zip_bytes: u64) -> (ByteQueue, SpoolHandle)
where
  S: futures::Stream<Item=Result<Bytes, E>>+Send+'static,
  E: fmt::Display+Send+'static,
{
  let (writer, queue) = byte_queue();
  let task = task::spawn(run_tee(body, writer, max_zip_bytes));
  (queue, SpoolHandle { task })
}

async fn run_tee<S, E>(
  body: S,
  writer: ByteQueueWriter,
  max_zip_bytes: u64,
) -> Result<NamedTempFile, SpoolError>
where
  S: futures::Stream<Item=Result<Bytes, E>>+Send+'static,
  E: fmt::Display+Send+'static,
{
  let tmp = task::spawn_blocking(NamedTempFile::new).await??;
  let mut spool = tokio::fs::File::from_std(tmp.reopen()?);

  let mut written: u64 = 0;
  futures::pin_mut!(body);
  while let Some(chunk) = body.next().await {
    let chunk = chunk.map_err(|e| SpoolError::Body(e.to_string()))?;
    written += chunk.len() as u64;
    if written > max_zip_bytes {
      return Err(SpoolError::ZipTooLarge(max_zip_bytes));
    }
    spool.write_all(&chunk).await?;
    writer
      .push(chunk)
      .await
      .map_err(|_| SpoolError::QueueClosed)?;
  }
  spool.flush().await?;

  Ok(tmp)
}
