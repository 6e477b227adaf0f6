/*
 * Description: HTTP surface for the stheno content-addressable fileset store.
 *
 * Copyright (C) 2023 Danny McClanahan <dmcC2@hypnicjerk.ai>
 * SPDX-License-Identifier: Apache-2.0
 *
 * Licensed under the Apache License, Version 2.0 (see LICENSE).
 */

//! HTTP surface for the stheno content-addressable fileset store.
//!
//! Everything interesting lives in [`libstheno_cas`]; this crate is the
//! transport shell: routing, header negotiation, error-to-status mapping, and
//! the OpenAPI document.

/* These clippy lint descriptions are purely non-functional and do not affect the functionality
 * or correctness of the code. */
#![deny(unsafe_code)]
/* Ensure any doctest warnings fails the doctest! */
#![doc(test(attr(deny(warnings))))]
#![deny(
  clippy::all,
  clippy::default_trait_access,
  clippy::expl_impl_clone_on_copy,
  clippy::if_not_else,
  clippy::needless_continue,
  clippy::single_match_else,
  clippy::unseparated_literal_suffix,
  clippy::used_underscore_binding
)]
/* It is often more clear to show that nothing is being moved. */
#![allow(clippy::match_ref_pats)]
/* Subjective style. */
#![allow(
  clippy::len_without_is_empty,
  clippy::redundant_field_names,
  clippy::too_many_arguments
)]
/* Default isn't as big a deal as people seem to think it is. */
#![allow(clippy::new_without_default, clippy::new_ret_no_self)]

use axum::Router;
use tower_http::trace::TraceLayer;

use libstheno_cas::{store::SthenoStore, IngestLimits};

pub mod config;

pub mod error;

pub mod openapi;

pub mod routes;

/// Shared handler state: the store plus the ingest policy knobs.
#[derive(Clone)]
pub struct AppState {
  pub store: SthenoStore,
  pub limits: IngestLimits,
  pub keep_spool: bool,
}

/// Assemble the full application router.
pub fn app(state: AppState) -> Router {
  Router::new()
    .merge(routes::router())
    .merge(openapi::router())
    .layer(TraceLayer::new_for_http())
    .with_state(state)
}
