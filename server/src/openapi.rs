/*
 * Description: OpenAPI document assembly and the static doc endpoints.
 *
 * Copyright (C) 2023 Danny McClanahan <dmcC2@hypnicjerk.ai>
 * SPDX-License-Identifier: Apache-2.0
 *
 * Licensed under the Apache License, Version 2.0 (see LICENSE).
 */

//! OpenAPI document assembly and the static doc endpoints.

use axum::{
  http::{header, HeaderValue},
  response::{Html, IntoResponse},
  routing::get,
  Json, Router,
};
use utoipa::OpenApi;

use crate::AppState;

/// The assembled spec for the whole surface.
#[derive(OpenApi)]
#[openapi(
  info(
    title = "stheno-cas",
    version = "0.2.0",
    description = "Zip ingest into a content-addressable fileset store.\n\n\
      POST an archive to `/filesets` and every entry is stored by the sha256 \
      of its raw bytes; the resulting manifest is itself content-addressed \
      and can be pinned by a named ref. Objects are served in their stored \
      brotli form.",
    license(name = "Apache-2.0")
  ),
  paths(
    crate::routes::health,
    crate::routes::create_fileset,
    crate::routes::get_fileset,
    crate::routes::get_object,
    crate::routes::get_ref,
  ),
  components(schemas(crate::routes::FilesetCreateResponse)),
  tags(
    (name = "filesets", description = "Archive ingest and manifest retrieval"),
    (name = "objects", description = "Content-addressed object retrieval"),
    (name = "refs", description = "Named fileset pointers"),
    (name = "health", description = "Liveness"),
  )
)]
pub struct ApiDoc;

const APIDOCS_HTML: &str = r#"<!DOCTYPE html>
<html>
  <head>
    <title>stheno-cas API</title>
    <meta charset="utf-8"/>
    <meta name="viewport" content="width=device-width, initial-scale=1">
    <style>body { margin: 0; padding: 0; }</style>
  </head>
  <body>
    <redoc spec-url="/openapi.json"></redoc>
    <script src="https://cdn.redoc.ly/redoc/latest/bundles/redoc.standalone.js"></script>
  </body>
</html>
"#;

pub fn router() -> Router<AppState> {
  Router::new()
    .route("/openapi.json", get(openapi_json))
    .route("/openapi.yaml", get(openapi_yaml))
    .route("/apidocs", get(apidocs))
}

async fn openapi_json() -> impl IntoResponse { Json(ApiDoc::openapi()) }

async fn openapi_yaml() -> impl IntoResponse {
  match serde_yaml::to_string(&ApiDoc::openapi()) {
    Ok(yaml) => (
      [(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/yaml"),
      )],
      yaml,
    )
      .into_response(),
    Err(e) => (
      axum::http::StatusCode::INTERNAL_SERVER_ERROR,
      format!("failed to render the OpenAPI document: {}", e),
    )
      .into_response(),
  }
}

async fn apidocs() -> Html<&'static str> { Html(APIDOCS_HTML) }
