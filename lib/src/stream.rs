/*
 * Description: Forward, single-pass parser over the byte-queue: local file
 * headers, entry body framing, data descriptors, zip64 extras.
 *
 * Copyright (C) 2023 Danny McClanahan <dmcC2@hypnicjerk.ai>
 * SPDX-License-Identifier: Apache-2.0
 *
 * Licensed under the Apache License, Version 2.0 (see LICENSE).
 */

//! Forward, single-pass parser over the byte-queue: local file headers, entry
//! body framing, data descriptors, zip64 extras.

use crate::queue::{ByteQueue, ByteQueueError};

use displaydoc::Display;
use thiserror::Error;

/// `PK\x03\x04`
pub const LOCAL_FILE_HEADER_SIGNATURE: u32 = 0x0403_4b50;
/// `PK\x01\x02`
pub const CENTRAL_DIRECTORY_SIGNATURE: u32 = 0x0201_4b50;
/// `PK\x05\x06`
pub const END_OF_CENTRAL_DIRECTORY_SIGNATURE: u32 = 0x0605_4b50;
/// `PK\x06\x06`
pub const ZIP64_END_OF_CENTRAL_DIRECTORY_SIGNATURE: u32 = 0x0606_4b50;
/// `PK\x06\x07`
pub const ZIP64_LOCATOR_SIGNATURE: u32 = 0x0706_4b50;
/// `PK\x07\x08` (optional, in front of a data descriptor)
pub const DATA_DESCRIPTOR_SIGNATURE: u32 = 0x0807_4b50;

/// Extra-field tag carrying 64-bit sizes/offsets.
pub const ZIP64_EXTRA_TAG: u16 = 0x0001;
/// 32-bit "see the zip64 extra field" marker.
pub const U32_SENTINEL: u32 = 0xFFFF_FFFF;
/// 16-bit "see the zip64 EOCD" marker.
pub const U16_SENTINEL: u16 = 0xFFFF;

pub(crate) fn le_u16(buf: &[u8], off: usize) -> u16 {
  u16::from_le_bytes(buf[off..off + 2].try_into().expect("two bytes"))
}

pub(crate) fn le_u32(buf: &[u8], off: usize) -> u32 {
  u32::from_le_bytes(buf[off..off + 4].try_into().expect("four bytes"))
}

pub(crate) fn le_u64(buf: &[u8], off: usize) -> u64 {
  u64::from_le_bytes(buf[off..off + 8].try_into().expect("eight bytes"))
}

/// Errors from the forward parsing pass.
#[derive(Debug, Display, Error)]
pub enum ZipStreamError {
  /// byte queue error: {0}
  Queue(#[from] ByteQueueError),
  /// Unsupported method {method} at offset {offset}
  UnsupportedMethod { method: u16, offset: u64 },
  /// Zip64 usize missing at offset {0}
  Zip64UncompressedSizeMissing(u64),
  /// Zip64 csize missing at offset {0}
  Zip64CompressedSizeMissing(u64),
  /// Zip64 local header offset missing for central directory record at {0}
  Zip64OffsetMissing(u64),
}

/// The fields of one local file header after zip64 substitution.
#[derive(Clone, Debug)]
pub struct StreamedHeader {
  pub local_header_offset: u64,
  pub filename_bytes: Vec<u8>,
  pub extra_bytes: Vec<u8>,
  pub method: u16,
  pub flags: u16,
  pub compressed_size: u64,
  pub uncompressed_size: u64,
  pub crc32: u32,
  /// Whether the header advertised zip64 sizes; this also decides the width
  /// of any trailing data descriptor.
  pub zip64_sizes: bool,
}

impl StreamedHeader {
  pub fn has_data_descriptor(&self) -> bool { self.flags & 0x0008 != 0 }

  pub fn is_stored(&self) -> bool { self.method == 0 }
}

/// A data descriptor trailing an entry body.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DataDescriptor {
  pub crc32: u32,
  pub compressed_size: u64,
  pub uncompressed_size: u64,
}

/// Substitute zip64 values for any 32-bit sentinels, requiring exactly the
/// fields asked for to be present in the `0x0001` extra block.
pub(crate) fn apply_zip64_extra(
  extra: &[u8],
  offset: u64,
  compressed_size: &mut u64,
  uncompressed_size: &mut u64,
  local_header_offset: Option<&mut u64>,
) -> Result<(), ZipStreamError> {
  let need_usize = *uncompressed_size == U32_SENTINEL as u64;
  let need_csize = *compressed_size == U32_SENTINEL as u64;
  let mut need_offset = false;
  if let Some(off) = local_header_offset.as_deref() {
    need_offset = *off == U32_SENTINEL as u64;
  }
  if !need_usize && !need_csize && !need_offset {
    return Ok(());
  }

  let mut local_header_offset = local_header_offset;
  let mut i = 0_usize;
  while i + 4 <= extra.len() {
    let tag = le_u16(extra, i);
    let len = le_u16(extra, i + 2) as usize;
    i += 4;
    if i + len > extra.len() {
      break;
    }
    if tag == ZIP64_EXTRA_TAG {
      let data = &extra[i..i + len];
      let mut cursor = 0_usize;
      /* Field order is fixed: uncompressed size, compressed size, offset. */
      if need_usize {
        if cursor + 8 > data.len() {
          return Err(ZipStreamError::Zip64UncompressedSizeMissing(offset));
        }
        *uncompressed_size = le_u64(data, cursor);
        cursor += 8;
      }
      if need_csize {
        if cursor + 8 > data.len() {
          return Err(ZipStreamError::Zip64CompressedSizeMissing(offset));
        }
        *compressed_size = le_u64(data, cursor);
        cursor += 8;
      }
      if need_offset {
        if cursor + 8 > data.len() {
          return Err(ZipStreamError::Zip64OffsetMissing(offset));
        }
        **local_header_offset.as_mut().expect("need_offset implies Some") = le_u64(data, cursor);
      }
      return Ok(());
    }
    i += len;
  }

  if need_usize {
    Err(ZipStreamError::Zip64UncompressedSizeMissing(offset))
  } else if need_csize {
    Err(ZipStreamError::Zip64CompressedSizeMissing(offset))
  } else {
    Err(ZipStreamError::Zip64OffsetMissing(offset))
  }
}

/// Single forward pass over an archive as it streams in.
pub struct ZipStreamReader {
  queue: ByteQueue,
}

impl ZipStreamReader {
  pub fn new(queue: ByteQueue) -> Self { Self { queue } }

  /// Direct access for body framing (`body_exact` / `body_unknown` /
  /// descriptor reads happen between headers).
  pub fn queue_mut(&mut self) -> &mut ByteQueue { &mut self.queue }

  /// Streaming is over; let the producer run out silently so the spool still
  /// receives the central directory.
  pub fn finish(self) { self.queue.discard_future(); }

  /// Parse the next local file header, or `None` once the central directory
  /// (or anything that is not a local header) is reached.
  pub async fn next_header(&mut self) -> Result<Option<StreamedHeader>, ZipStreamError> {
    let signature = self.queue.peek_u32_le().await?;
    if signature != LOCAL_FILE_HEADER_SIGNATURE {
      /* CD or EOCD means a well-formed end; anything else also ends the
       * streaming phase and is left to central directory reconciliation. */
      return Ok(None);
    }

    let local_header_offset = self.queue.consumed_total();
    self.queue.ensure(30).await?;
    let fixed = self.queue.read(30);
    let flags = le_u16(&fixed, 6);
    let method = le_u16(&fixed, 8);
    let crc32 = le_u32(&fixed, 14);
    let mut compressed_size = le_u32(&fixed, 18) as u64;
    let mut uncompressed_size = le_u32(&fixed, 22) as u64;
    let name_len = le_u16(&fixed, 26) as usize;
    let extra_len = le_u16(&fixed, 28) as usize;

    if method != 0 && method != 8 {
      return Err(ZipStreamError::UnsupportedMethod {
        method,
        offset: local_header_offset,
      });
    }

    self.queue.ensure(name_len + extra_len).await?;
    let filename_bytes = self.queue.read(name_len).to_vec();
    let extra_bytes = self.queue.read(extra_len).to_vec();

    apply_zip64_extra(
      &extra_bytes,
      local_header_offset,
      &mut compressed_size,
      &mut uncompressed_size,
      None,
    )?;
    let zip64_sizes =
      compressed_size > U32_SENTINEL as u64 || uncompressed_size > U32_SENTINEL as u64;

    Ok(Some(StreamedHeader {
      local_header_offset,
      filename_bytes,
      extra_bytes,
      method,
      flags,
      compressed_size,
      uncompressed_size,
      crc32,
      zip64_sizes,
    }))
  }

  /// Read the descriptor trailing a flag-bit-3 entry. The optional signature
  /// word is tolerated; size width follows the header's zip64-ness.
  pub async fn read_data_descriptor(
    &mut self,
    zip64: bool,
  ) -> Result<DataDescriptor, ZipStreamError> {
    if self.queue.peek_u32_le().await? == DATA_DESCRIPTOR_SIGNATURE {
      self.queue.ensure(4).await?;
      self.queue.read(4);
    }
    let size_width = if zip64 { 8 } else { 4 };
    let need = 4 + 2 * size_width;
    self.queue.ensure(need).await?;
    let buf = self.queue.read(need);
    let crc32 = le_u32(&buf, 0);
    let (compressed_size, uncompressed_size) = if zip64 {
      (le_u64(&buf, 4), le_u64(&buf, 12))
    } else {
      (le_u32(&buf, 4) as u64, le_u32(&buf, 8) as u64)
    };
    Ok(DataDescriptor {
      crc32,
      compressed_size,
      uncompressed_size,
    })
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::queue::byte_queue;

  use bytes::Bytes;

  fn lfh(
    flags: u16,
    method: u16,
    crc32: u32,
    csize: u32,
    usize_: u32,
    name: &[u8],
    extra: &[u8],
  ) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&LOCAL_FILE_HEADER_SIGNATURE.to_le_bytes());
    out.extend_from_slice(&20_u16.to_le_bytes());
    out.extend_from_slice(&flags.to_le_bytes());
    out.extend_from_slice(&method.to_le_bytes());
    out.extend_from_slice(&0_u16.to_le_bytes());
    out.extend_from_slice(&0_u16.to_le_bytes());
    out.extend_from_slice(&crc32.to_le_bytes());
    out.extend_from_slice(&csize.to_le_bytes());
    out.extend_from_slice(&usize_.to_le_bytes());
    out.extend_from_slice(&(name.len() as u16).to_le_bytes());
    out.extend_from_slice(&(extra.len() as u16).to_le_bytes());
    out.extend_from_slice(name);
    out.extend_from_slice(extra);
    out
  }

  async fn reader_over(bytes: Vec<u8>) -> ZipStreamReader {
    let (writer, queue) = byte_queue();
    tokio::task::spawn(async move {
      let _ = writer.push(Bytes::from(bytes)).await;
    });
    ZipStreamReader::new(queue)
  }

  #[tokio::test]
  async fn parses_a_plain_stored_header() {
    let mut bytes = lfh(0, 0, 0xdead_beef, 6, 6, b"hello.txt", b"");
    bytes.extend_from_slice(b"hello\n");
    bytes.extend_from_slice(&END_OF_CENTRAL_DIRECTORY_SIGNATURE.to_le_bytes());
    let mut reader = reader_over(bytes).await;

    let header = reader.next_header().await.unwrap().unwrap();
    assert_eq!(header.local_header_offset, 0);
    assert_eq!(header.filename_bytes, b"hello.txt");
    assert_eq!(header.method, 0);
    assert_eq!(header.compressed_size, 6);
    assert_eq!(header.uncompressed_size, 6);
    assert_eq!(header.crc32, 0xdead_beef);
    assert!(!header.has_data_descriptor());
    assert!(!header.zip64_sizes);
  }

  #[tokio::test]
  async fn eocd_signature_ends_the_stream() {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&END_OF_CENTRAL_DIRECTORY_SIGNATURE.to_le_bytes());
    bytes.extend_from_slice(&[0_u8; 18]);
    let mut reader = reader_over(bytes).await;
    assert!(reader.next_header().await.unwrap().is_none());
  }

  #[tokio::test]
  async fn rejects_unsupported_methods() {
    let bytes = lfh(0, 12, 0, 4, 4, b"a.bz2", b"");
    let mut reader = reader_over(bytes).await;
    assert!(matches!(
      reader.next_header().await.unwrap_err(),
      ZipStreamError::UnsupportedMethod { method: 12, offset: 0 }
    ));
  }

  #[tokio::test]
  async fn zip64_extra_substitutes_sizes() {
    let true_size: u64 = 5_000_000_000;
    let mut extra = Vec::new();
    extra.extend_from_slice(&ZIP64_EXTRA_TAG.to_le_bytes());
    extra.extend_from_slice(&16_u16.to_le_bytes());
    extra.extend_from_slice(&true_size.to_le_bytes());
    extra.extend_from_slice(&true_size.to_le_bytes());
    let bytes = lfh(0, 0, 0, U32_SENTINEL, U32_SENTINEL, b"big.bin", &extra);
    let mut reader = reader_over(bytes).await;

    let header = reader.next_header().await.unwrap().unwrap();
    assert_eq!(header.uncompressed_size, true_size);
    assert_eq!(header.compressed_size, true_size);
    assert!(header.zip64_sizes);
  }

  #[tokio::test]
  async fn zip64_sentinel_without_extra_is_an_error() {
    let bytes = lfh(0, 0, 0, U32_SENTINEL, 4, b"big.bin", b"");
    let mut reader = reader_over(bytes).await;
    assert!(matches!(
      reader.next_header().await.unwrap_err(),
      ZipStreamError::Zip64CompressedSizeMissing(0)
    ));
  }

  #[tokio::test]
  async fn data_descriptor_with_and_without_signature() {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&DATA_DESCRIPTOR_SIGNATURE.to_le_bytes());
    bytes.extend_from_slice(&0x1111_2222_u32.to_le_bytes());
    bytes.extend_from_slice(&5_u32.to_le_bytes());
    bytes.extend_from_slice(&3_u32.to_le_bytes());
    /* A second, signature-less descriptor follows. */
    bytes.extend_from_slice(&0x3333_4444_u32.to_le_bytes());
    bytes.extend_from_slice(&7_u32.to_le_bytes());
    bytes.extend_from_slice(&9_u32.to_le_bytes());
    let mut reader = reader_over(bytes).await;

    let first = reader.read_data_descriptor(false).await.unwrap();
    assert_eq!(first, DataDescriptor {
      crc32: 0x1111_2222,
      compressed_size: 5,
      uncompressed_size: 3,
    });
    let second = reader.read_data_descriptor(false).await.unwrap();
    assert_eq!(second, DataDescriptor {
      crc32: 0x3333_4444,
      compressed_size: 7,
      uncompressed_size: 9,
    });
  }
}
