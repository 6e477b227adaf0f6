/*
 * Description: Error-to-status mapping for the HTTP surface.
 *
 * Copyright (C) 2023 Danny McClanahan <dmcC2@hypnicjerk.ai>
 * SPDX-License-Identifier: Apache-2.0
 *
 * Licensed under the Apache License, Version 2.0 (see LICENSE).
 */

//! Error-to-status mapping for the HTTP surface.
//!
//! Every ingest failure maps to 500, including client-caused ones (oversized
//! bodies, malformed archives); that matches the store's observable contract,
//! even though a 413/422 split would be friendlier. Lookups distinguish 404
//! (absent) from 400 (ids that are not even well formed).

use axum::{
  http::StatusCode,
  response::{IntoResponse, Response},
};
use displaydoc::Display;
use thiserror::Error;

use libstheno_cas::{ingest::SthenoIngestError, store::SthenoStoreError};

/// Failures a handler can answer with.
#[derive(Debug, Display, Error)]
pub enum ApiError {
  /// Expected Content-Type: application/zip
  UnsupportedMediaType,
  /// Not Acceptable (need br)
  NotAcceptable,
  /// not found
  NotFound,
  /// bad request: {0}
  BadRequest(String),
  /// ingest failed: {0}
  Ingest(#[from] SthenoIngestError),
  /// store error: {0}
  Store(SthenoStoreError),
}

impl From<SthenoStoreError> for ApiError {
  fn from(e: SthenoStoreError) -> Self {
    match e {
      /* Hostile-shaped ids are a client problem, not a server one. */
      SthenoStoreError::InvalidHash(_) | SthenoStoreError::InvalidRefName(_) => {
        Self::BadRequest(e.to_string())
      },
      other => Self::Store(other),
    }
  }
}

impl ApiError {
  fn status(&self) -> StatusCode {
    match self {
      Self::UnsupportedMediaType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
      Self::NotAcceptable => StatusCode::NOT_ACCEPTABLE,
      Self::NotFound => StatusCode::NOT_FOUND,
      Self::BadRequest(_) => StatusCode::BAD_REQUEST,
      Self::Ingest(_) | Self::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
  }
}

impl IntoResponse for ApiError {
  fn into_response(self) -> Response {
    let status = self.status();
    match &self {
      Self::Ingest(e) => tracing::warn!(error = %e, "ingest failed"),
      Self::Store(e) => tracing::error!(error = %e, "store error"),
      _ => {},
    }
    (status, self.to_string()).into_response()
  }
}
