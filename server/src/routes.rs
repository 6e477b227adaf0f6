/*
 * Description: Route handlers: ingest, manifest/object/ref retrieval, health.
 *
 * Copyright (C) 2023 Danny McClanahan <dmcC2@hypnicjerk.ai>
 * SPDX-License-Identifier: Apache-2.0
 *
 * Licensed under the Apache License, Version 2.0 (see LICENSE).
 */

//! Route handlers: ingest, manifest/object/ref retrieval, health.
//!
//! Objects are served exactly as stored (brotli bytes with
//! `Content-Encoding: br`); a client whose `Accept-Encoding` rules that out
//! gets 406 rather than a transcode. Everything is immutable once committed,
//! so object responses carry a year-long immutable cache policy and honor
//! `If-None-Match`.

use axum::{
  body::Body,
  extract::{Path, Query, Request, State},
  http::{header, HeaderMap, HeaderValue, StatusCode},
  response::{IntoResponse, Response},
  routing::{get, post},
  Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;
use utoipa::ToSchema;

use libstheno_cas::{
  ingest::SthenoIngest,
  manifest::FilesetManifest,
  store::{validate_hash, validate_ref_name},
};

use crate::{error::ApiError, AppState};

pub fn router() -> Router<AppState> {
  Router::new()
    .route("/health", get(health))
    .route("/filesets", post(create_fileset))
    .route("/filesets/:id", get(get_fileset))
    .route("/objects/:sha", get(get_object))
    .route("/refs/:name", get(get_ref))
}

/// Successful ingest response body (JSON form).
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct FilesetCreateResponse {
  pub fileset_id: String,
  pub updated_ref: Option<String>,
  #[schema(value_type = Object)]
  pub manifest: FilesetManifest,
}

#[derive(Debug, Deserialize)]
pub struct CreateFilesetParams {
  /// Ref to move to the new fileset. Defaults to `latest`; an empty string
  /// disables the update.
  pub update_ref: Option<String>,
}

fn content_type_is_zip(headers: &HeaderMap) -> bool {
  headers
    .get(header::CONTENT_TYPE)
    .and_then(|v| v.to_str().ok())
    .map(|v| {
      v.split(';')
        .next()
        .unwrap_or("")
        .trim()
        .eq_ignore_ascii_case("application/zip")
    })
    .unwrap_or(false)
}

fn accept_includes_json(headers: &HeaderMap) -> bool {
  headers
    .get(header::ACCEPT)
    .and_then(|v| v.to_str().ok())
    .map(|v| {
      v.split(',').any(|item| {
        let essence = item.split(';').next().unwrap_or("").trim();
        essence.eq_ignore_ascii_case("application/json") || essence == "*/*"
      })
    })
    .unwrap_or(false)
}

/// An absent `Accept-Encoding` accepts anything; a present one must include
/// `br` or `*` since objects only exist in brotli form.
fn accept_encoding_allows_br(headers: &HeaderMap) -> bool {
  match headers.get(header::ACCEPT_ENCODING) {
    None => true,
    Some(v) => v
      .to_str()
      .ok()
      .map(|v| {
        v.split(',').any(|item| {
          let essence = item.split(';').next().unwrap_or("").trim();
          essence.eq_ignore_ascii_case("br") || essence == "*"
        })
      })
      .unwrap_or(false),
  }
}

fn if_none_match_contains(headers: &HeaderMap, etag: &str) -> bool {
  headers
    .get(header::IF_NONE_MATCH)
    .and_then(|v| v.to_str().ok())
    .map(|v| v.split(',').any(|item| item.trim() == etag))
    .unwrap_or(false)
}

fn sha256_etag(id: &str) -> HeaderValue {
  HeaderValue::from_str(&format!("\"sha256:{}\"", id)).expect("hex ids are header-safe")
}

#[utoipa::path(
  get,
  path = "/health",
  responses((status = 200, description = "The process is up", body = String)),
  tag = "health"
)]
async fn health() -> &'static str { "ok" }

#[utoipa::path(
  post,
  path = "/filesets",
  request_body(content = Vec<u8>, content_type = "application/zip"),
  params(
    ("update_ref" = Option<String>, Query,
     description = "Ref to point at the new fileset (default `latest`; empty disables)"),
  ),
  responses(
    (status = 201, description = "Archive ingested", body = FilesetCreateResponse),
    (status = 415, description = "Body was not application/zip"),
    (status = 500, description = "Malformed archive or a cap was exceeded"),
  ),
  tag = "filesets"
)]
async fn create_fileset(
  State(state): State<AppState>,
  Query(params): Query<CreateFilesetParams>,
  request: Request,
) -> Result<Response, ApiError> {
  let (parts, body) = request.into_parts();
  if !content_type_is_zip(&parts.headers) {
    return Err(ApiError::UnsupportedMediaType);
  }

  let update_ref = {
    let name = params.update_ref.unwrap_or_else(|| "latest".to_string());
    if name.is_empty() {
      None
    } else {
      /* Refuse hostile ref names before any bytes are accepted. */
      validate_ref_name(&name)?;
      Some(name)
    }
  };

  let ingest = SthenoIngest {
    store: state.store.clone(),
    limits: state.limits,
    update_ref,
    keep_spool: state.keep_spool,
  };
  let outcome = ingest.ingest(body.into_data_stream()).await?;

  tracing::info!(
    fileset_id = %outcome.manifest.fileset_id,
    file_count = outcome.manifest.file_count,
    total_bytes = outcome.manifest.total_bytes,
    warnings = outcome.manifest.warnings.len(),
    updated_ref = outcome.updated_ref.as_deref().unwrap_or(""),
    "ingested fileset"
  );

  let location = HeaderValue::from_str(&format!("/filesets/{}", outcome.manifest.fileset_id))
    .expect("fileset ids are header-safe");
  let mut response = if accept_includes_json(&parts.headers) {
    (
      StatusCode::CREATED,
      Json(FilesetCreateResponse {
        fileset_id: outcome.manifest.fileset_id.clone(),
        updated_ref: outcome.updated_ref,
        manifest: outcome.manifest,
      }),
    )
      .into_response()
  } else {
    (StatusCode::CREATED, outcome.manifest.fileset_id).into_response()
  };
  response.headers_mut().insert(header::LOCATION, location);
  Ok(response)
}

#[utoipa::path(
  get,
  path = "/filesets/{id}",
  params(("id" = String, Path, description = "Fileset id (sha256 hex)")),
  responses(
    (status = 200, description = "The manifest document"),
    (status = 304, description = "Client already has it"),
    (status = 404, description = "No such fileset"),
    (status = 400, description = "Malformed id"),
  ),
  tag = "filesets"
)]
async fn get_fileset(
  State(state): State<AppState>,
  Path(id): Path<String>,
  headers: HeaderMap,
) -> Result<Response, ApiError> {
  if id.is_empty() {
    return Err(ApiError::BadRequest("empty fileset id".to_string()));
  }
  validate_hash(&id)?;
  let etag = sha256_etag(&id);
  if if_none_match_contains(&headers, etag.to_str().expect("ascii")) {
    return Ok(([(header::ETAG, etag)], StatusCode::NOT_MODIFIED).into_response());
  }
  let manifest_json = state
    .store
    .read_manifest(&id)
    .await?
    .ok_or(ApiError::NotFound)?;
  Ok(
    (
      [
        (header::ETAG, etag),
        (
          header::CONTENT_TYPE,
          HeaderValue::from_static("application/json"),
        ),
      ],
      manifest_json,
    )
      .into_response(),
  )
}

#[utoipa::path(
  get,
  path = "/objects/{sha}",
  params(("sha" = String, Path, description = "Object id (sha256 hex of the raw bytes)")),
  responses(
    (status = 200, description = "The stored object, brotli-encoded"),
    (status = 304, description = "Client already has it"),
    (status = 406, description = "Client refuses brotli"),
    (status = 404, description = "No such object"),
    (status = 400, description = "Malformed id"),
  ),
  tag = "objects"
)]
async fn get_object(
  State(state): State<AppState>,
  Path(sha): Path<String>,
  headers: HeaderMap,
) -> Result<Response, ApiError> {
  if sha.is_empty() {
    return Err(ApiError::BadRequest("empty object id".to_string()));
  }
  validate_hash(&sha)?;
  if !accept_encoding_allows_br(&headers) {
    return Err(ApiError::NotAcceptable);
  }

  let etag = sha256_etag(&sha);
  if if_none_match_contains(&headers, etag.to_str().expect("ascii")) {
    return Ok(([(header::ETAG, etag)], StatusCode::NOT_MODIFIED).into_response());
  }

  let (file, _len) = state
    .store
    .open_object(&sha)
    .await?
    .ok_or(ApiError::NotFound)?;
  Ok(
    (
      [
        (
          header::CONTENT_TYPE,
          HeaderValue::from_static("application/octet-stream"),
        ),
        (header::CONTENT_ENCODING, HeaderValue::from_static("br")),
        (header::ETAG, etag),
        (
          header::CACHE_CONTROL,
          HeaderValue::from_static("public, max-age=31536000, immutable"),
        ),
      ],
      Body::from_stream(ReaderStream::new(file)),
    )
      .into_response(),
  )
}

#[utoipa::path(
  get,
  path = "/refs/{name}",
  params(("name" = String, Path, description = "Ref name")),
  responses(
    (status = 200, description = "The fileset id the ref points at", body = String),
    (status = 404, description = "No such ref"),
    (status = 400, description = "Malformed ref name"),
  ),
  tag = "refs"
)]
async fn get_ref(
  State(state): State<AppState>,
  Path(name): Path<String>,
) -> Result<Response, ApiError> {
  let value = state.store.read_ref(&name).await?.ok_or(ApiError::NotFound)?;
  Ok(value.into_response())
}
