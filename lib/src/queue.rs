/*
 * Description: Asynchronous byte reservoir between the upload producer and the
 * forward zip parser.
 *
 * Copyright (C) 2023 Danny McClanahan <dmcC2@hypnicjerk.ai>
 * SPDX-License-Identifier: Apache-2.0
 *
 * Licensed under the Apache License, Version 2.0 (see LICENSE).
 */

//! Asynchronous byte reservoir between the upload producer and the forward zip
//! parser.
//!
//! The producer half is a bounded channel, so a slow parser pauses the upload
//! instead of buffering it. The consumer half keeps a running `consumed_total`
//! which is how local header offsets are recovered without ever seeking.

use bytes::{Bytes, BytesMut};
use displaydoc::Display;
use thiserror::Error;
use tokio::{sync::mpsc, task};

use std::{cmp, collections::VecDeque};

/// Errors produced by queue consumers.
#[derive(Debug, Display, Error)]
pub enum ByteQueueError {
  /// input truncated: stream ended {0} byte(s) short
  InputTruncated(u64),
}

/// How many in-flight chunks the producer may send before it is paused.
const QUEUE_DEPTH: usize = 16;

/// Create a connected producer/consumer pair.
pub fn byte_queue() -> (ByteQueueWriter, ByteQueue) {
  let (tx, rx) = mpsc::channel::<Bytes>(QUEUE_DEPTH);
  (ByteQueueWriter { tx }, ByteQueue {
    rx,
    buf: VecDeque::new(),
    buffered: 0,
    consumed_total: 0,
    ended: false,
  })
}

/// Producer half: owned by the spool tee.
pub struct ByteQueueWriter {
  tx: mpsc::Sender<Bytes>,
}

impl ByteQueueWriter {
  /// Push one chunk, suspending while the consumer is behind.
  pub async fn push(&self, chunk: Bytes) -> Result<(), mpsc::error::SendError<Bytes>> {
    self.tx.send(chunk).await
  }
}

/// Consumer half: owned by the zip stream reader.
pub struct ByteQueue {
  rx: mpsc::Receiver<Bytes>,
  buf: VecDeque<Bytes>,
  buffered: usize,
  consumed_total: u64,
  ended: bool,
}

impl ByteQueue {
  /// Total bytes consumed so far; equals the archive offset of the next
  /// unread byte.
  pub fn consumed_total(&self) -> u64 { self.consumed_total }

  /// Receive chunks until at least one non-empty chunk is buffered. Returns
  /// false once the producer has ended and nothing more will arrive.
  async fn fill_one(&mut self) -> bool {
    while !self.ended {
      match self.rx.recv().await {
        Some(chunk) => {
          if chunk.is_empty() {
            continue;
          }
          self.buffered += chunk.len();
          self.buf.push_back(chunk);
          return true;
        },
        None => {
          self.ended = true;
        },
      }
    }
    false
  }

  /// Suspend until at least `n` bytes are buffered.
  pub async fn ensure(&mut self, n: usize) -> Result<(), ByteQueueError> {
    while self.buffered < n {
      if !self.fill_one().await {
        return Err(ByteQueueError::InputTruncated((n - self.buffered) as u64));
      }
    }
    Ok(())
  }

  /// Consume and return exactly `n` bytes. The caller must have `ensure`d
  /// them first.
  pub fn read(&mut self, n: usize) -> Bytes {
    assert!(n <= self.buffered, "read() called without ensure()");
    if n == 0 {
      return Bytes::new();
    }
    self.buffered -= n;
    self.consumed_total += n as u64;

    /* Common case: the front chunk covers the whole read. */
    {
      let front = self.buf.front_mut().expect("ensured bytes must be present");
      if front.len() >= n {
        let out = front.split_to(n);
        if front.is_empty() {
          self.buf.pop_front();
        }
        return out;
      }
    }

    let mut out = BytesMut::with_capacity(n);
    let mut remaining = n;
    while remaining > 0 {
      let mut chunk = self.buf.pop_front().expect("ensured bytes must be present");
      if chunk.len() > remaining {
        out.extend_from_slice(&chunk.split_to(remaining));
        self.buf.push_front(chunk);
        remaining = 0;
      } else {
        remaining -= chunk.len();
        out.extend_from_slice(&chunk);
      }
    }
    out.freeze()
  }

  /// Non-consuming little-endian u32 read. Does not move `consumed_total`,
  /// even when the four bytes span chunk boundaries.
  pub async fn peek_u32_le(&mut self) -> Result<u32, ByteQueueError> {
    self.ensure(4).await?;
    let mut le = [0_u8; 4];
    let mut filled = 0_usize;
    'chunks: for chunk in self.buf.iter() {
      for byte in chunk.iter() {
        le[filled] = *byte;
        filled += 1;
        if filled == 4 {
          break 'chunks;
        }
      }
    }
    Ok(u32::from_le_bytes(le))
  }

  /// Push decoder leftovers back onto the front of the buffer, rewinding
  /// `consumed_total` accordingly.
  pub fn unread(&mut self, chunk: Bytes) {
    if chunk.is_empty() {
      return;
    }
    self.buffered += chunk.len();
    self.consumed_total -= chunk.len() as u64;
    self.buf.push_front(chunk);
  }

  /// A lazy byte run of exactly `len` bytes. Not restartable.
  pub fn body_exact(&mut self, len: u64) -> ExactBody<'_> {
    ExactBody {
      queue: self,
      remaining: len,
    }
  }

  /// A lazy byte run that ends when the producer ends. Not restartable.
  pub fn body_unknown(&mut self) -> UnknownBody<'_> { UnknownBody { queue: self } }

  /// Drop everything buffered and silently absorb the rest of the producer's
  /// output, so the upload side never observes a closed channel.
  pub fn discard_future(self) {
    let Self { mut rx, .. } = self;
    task::spawn(async move { while rx.recv().await.is_some() {} });
  }
}

/// See [`ByteQueue::body_exact`].
pub struct ExactBody<'a> {
  queue: &'a mut ByteQueue,
  remaining: u64,
}

impl<'a> ExactBody<'a> {
  pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, ByteQueueError> {
    if self.remaining == 0 {
      return Ok(None);
    }
    if self.queue.buf.is_empty() && !self.queue.fill_one().await {
      return Err(ByteQueueError::InputTruncated(self.remaining));
    }
    let front_len = self.queue.buf.front().expect("just filled").len();
    let take = cmp::min(front_len as u64, self.remaining) as usize;
    let out = self.queue.read(take);
    self.remaining -= take as u64;
    Ok(Some(out))
  }
}

/// See [`ByteQueue::body_unknown`].
pub struct UnknownBody<'a> {
  queue: &'a mut ByteQueue,
}

impl<'a> UnknownBody<'a> {
  pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, ByteQueueError> {
    if self.queue.buf.is_empty() && !self.queue.fill_one().await {
      return Ok(None);
    }
    let front_len = self.queue.buf.front().expect("just filled").len();
    let out = self.queue.read(front_len);
    Ok(Some(out))
  }
}
