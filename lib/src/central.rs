/*
 * Description: Random-access central directory parser over the completed
 * spool file.
 *
 * Copyright (C) 2023 Danny McClanahan <dmcC2@hypnicjerk.ai>
 * SPDX-License-Identifier: Apache-2.0
 *
 * Licensed under the Apache License, Version 2.0 (see LICENSE).
 */

//! Random-access central directory parser over the completed spool file.
//!
//! The EOCD is found by scanning backwards through the final 64 KiB-and-change
//! of the file (its distance from EOF is bounded by the comment field). These
//! are blocking reads; callers run the whole thing under
//! [`tokio::task::spawn_blocking`].

use crate::stream::{
  apply_zip64_extra, le_u16, le_u32, le_u64, ZipStreamError, CENTRAL_DIRECTORY_SIGNATURE,
  END_OF_CENTRAL_DIRECTORY_SIGNATURE, U16_SENTINEL, U32_SENTINEL,
  ZIP64_END_OF_CENTRAL_DIRECTORY_SIGNATURE, ZIP64_LOCATOR_SIGNATURE,
};

use displaydoc::Display;
use thiserror::Error;

use std::{
  cmp,
  io::{self, Read, Seek, SeekFrom},
};

/// EOCD fixed part (22) plus the maximum comment length (65535).
const EOCD_SEARCH_SPAN: u64 = 65_557;

/// Unicode Path Extra Field.
const UNICODE_PATH_EXTRA_TAG: u16 = 0x7075;

/// UTF-8 filename flag in the general purpose bits.
const UTF8_NAME_FLAG: u16 = 1 << 11;

/// Errors locating or enumerating the central directory.
#[derive(Debug, Display, Error)]
pub enum CentralDirectoryError {
  /// i/o error reading the spool: {0}
  Io(#[from] io::Error),
  /// end of central directory record not found
  EocdNotFound,
  /// bad zip64 EOCD signature 0x{0:08x}
  BadZip64EocdSignature(u32),
  /// bad central directory record signature 0x{0:08x} for entry {1}
  BadRecordSignature(u32, u64),
  /// zip64 field error in central directory: {0}
  Zip64(#[from] ZipStreamError),
}

/// One central directory record, sizes and offset already zip64-substituted.
#[derive(Clone, Debug)]
pub struct CentralDirectoryEntry {
  pub filename: String,
  pub is_directory: bool,
  pub method: u16,
  pub flags: u16,
  pub crc32: u32,
  pub compressed_size: u64,
  pub uncompressed_size: u64,
  pub local_header_offset: u64,
}

/// The enumerated directory plus any structural warnings hit along the way.
#[derive(Debug)]
pub struct CentralDirectory {
  pub entries: Vec<CentralDirectoryEntry>,
  pub warnings: Vec<String>,
}

/// Decode a central directory filename.
///
/// Order is: the UTF-8 general purpose flag wins; then the Unicode Path Extra
/// Field (tag 0x7075, version 1); then a strict Shift-JIS attempt; then
/// Latin-1, which cannot fail.
fn decode_filename(name_bytes: &[u8], flags: u16, extra: &[u8]) -> String {
  if flags & UTF8_NAME_FLAG != 0 {
    return String::from_utf8_lossy(name_bytes).into_owned();
  }
  if let Some(unicode) = unicode_path_override(extra) {
    return String::from_utf8_lossy(unicode).into_owned();
  }
  if let Some(decoded) =
    encoding_rs::SHIFT_JIS.decode_without_bom_handling_and_without_replacement(name_bytes)
  {
    return decoded.into_owned();
  }
  name_bytes.iter().map(|b| char::from(*b)).collect()
}

/// Locate a version-1 Unicode Path Extra Field and return its override bytes.
fn unicode_path_override(extra: &[u8]) -> Option<&[u8]> {
  let mut i = 0_usize;
  while i + 4 <= extra.len() {
    let tag = le_u16(extra, i);
    let len = le_u16(extra, i + 2) as usize;
    i += 4;
    if i + len > extra.len() {
      return None;
    }
    /* Layout: version (1 byte), crc32 of the original name (4 bytes), then
     * the UTF-8 override. */
    if tag == UNICODE_PATH_EXTRA_TAG && len >= 5 && extra[i] == 1 {
      return Some(&extra[i + 5..i + len]);
    }
    i += len;
  }
  None
}

fn read_exact_at(file: &mut std::fs::File, offset: u64, buf: &mut [u8]) -> io::Result<()> {
  file.seek(SeekFrom::Start(offset))?;
  file.read_exact(buf)
}

/// Read the whole central directory off the spool.
pub fn read_central_directory(
  file: &mut std::fs::File,
) -> Result<CentralDirectory, CentralDirectoryError> {
  let mut warnings: Vec<String> = Vec::new();

  let file_size = file.seek(SeekFrom::End(0))?;
  let tail_len = cmp::min(file_size, EOCD_SEARCH_SPAN);
  let tail_start = file_size - tail_len;
  let mut tail = vec![0_u8; tail_len as usize];
  read_exact_at(file, tail_start, &mut tail)?;

  let eocd_in_tail = (0..tail.len().saturating_sub(21))
    .rev()
    .find(|i| le_u32(&tail, *i) == END_OF_CENTRAL_DIRECTORY_SIGNATURE)
    .ok_or(CentralDirectoryError::EocdNotFound)?;
  let eocd_offset = tail_start + eocd_in_tail as u64;
  let eocd = &tail[eocd_in_tail..];

  let total_entries_16 = le_u16(eocd, 10);
  let cd_size_32 = le_u32(eocd, 12);
  let cd_off_32 = le_u32(eocd, 16);

  let mut total_entries = total_entries_16 as u64;
  let mut cd_offset = cd_off_32 as u64;

  if total_entries_16 == U16_SENTINEL || cd_size_32 == U32_SENTINEL || cd_off_32 == U32_SENTINEL {
    match read_zip64_eocd(file, eocd_offset)? {
      Some((zip64_total, zip64_cd_offset)) => {
        total_entries = zip64_total;
        cd_offset = zip64_cd_offset;
      },
      None => {
        warnings
          .push("Zip64 needed but Zip64 locator not found; using 32-bit CD fields".to_string());
      },
    }
  }

  let mut entries: Vec<CentralDirectoryEntry> = Vec::new();
  file.seek(SeekFrom::Start(cd_offset))?;
  for index in 0..total_entries {
    let mut fixed = [0_u8; 46];
    file.read_exact(&mut fixed)?;
    let signature = le_u32(&fixed, 0);
    if signature != CENTRAL_DIRECTORY_SIGNATURE {
      return Err(CentralDirectoryError::BadRecordSignature(signature, index));
    }

    let flags = le_u16(&fixed, 8);
    let method = le_u16(&fixed, 10);
    let crc32 = le_u32(&fixed, 16);
    let mut compressed_size = le_u32(&fixed, 20) as u64;
    let mut uncompressed_size = le_u32(&fixed, 24) as u64;
    let name_len = le_u16(&fixed, 28) as usize;
    let extra_len = le_u16(&fixed, 30) as usize;
    let comment_len = le_u16(&fixed, 32) as usize;
    let mut local_header_offset = le_u32(&fixed, 42) as u64;

    let mut name_bytes = vec![0_u8; name_len];
    file.read_exact(&mut name_bytes)?;
    let mut extra = vec![0_u8; extra_len];
    file.read_exact(&mut extra)?;
    if comment_len > 0 {
      file.seek(SeekFrom::Current(comment_len as i64))?;
    }

    apply_zip64_extra(
      &extra,
      local_header_offset,
      &mut compressed_size,
      &mut uncompressed_size,
      Some(&mut local_header_offset),
    )?;

    let filename = decode_filename(&name_bytes, flags, &extra);
    let is_directory = filename.ends_with('/');

    entries.push(CentralDirectoryEntry {
      filename,
      is_directory,
      method,
      flags,
      crc32,
      compressed_size,
      uncompressed_size,
      local_header_offset,
    });
  }

  Ok(CentralDirectory { entries, warnings })
}

/// Follow the zip64 EOCD locator (20 bytes ending right before the EOCD) to
/// the zip64 EOCD record. `Ok(None)` means no locator was present.
fn read_zip64_eocd(
  file: &mut std::fs::File,
  eocd_offset: u64,
) -> Result<Option<(u64, u64)>, CentralDirectoryError> {
  if eocd_offset < 20 {
    return Ok(None);
  }
  let mut locator = [0_u8; 20];
  read_exact_at(file, eocd_offset - 20, &mut locator)?;
  if le_u32(&locator, 0) != ZIP64_LOCATOR_SIGNATURE {
    return Ok(None);
  }
  let zip64_eocd_offset = le_u64(&locator, 8);

  let mut record = [0_u8; 56];
  read_exact_at(file, zip64_eocd_offset, &mut record)?;
  let signature = le_u32(&record, 0);
  if signature != ZIP64_END_OF_CENTRAL_DIRECTORY_SIGNATURE {
    return Err(CentralDirectoryError::BadZip64EocdSignature(signature));
  }
  let total_entries = le_u64(&record, 32);
  let cd_offset = le_u64(&record, 48);
  Ok(Some((total_entries, cd_offset)))
}
