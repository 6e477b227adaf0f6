/*
 * Description: Binary entry point: config, tracing, bind, serve.
 *
 * Copyright (C) 2023 Danny McClanahan <dmcC2@hypnicjerk.ai>
 * SPDX-License-Identifier: Apache-2.0
 *
 * Licensed under the Apache License, Version 2.0 (see LICENSE).
 */

//! Binary entry point: config, tracing, bind, serve.

use stheno_cas::{app, config::ServerConfig, AppState};

use libstheno_cas::store::SthenoStore;

#[tokio::main]
async fn main() -> eyre::Result<()> {
  use eyre::WrapErr;

  tracing_subscriber::fmt()
    .with_env_filter(
      tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
    )
    .init();

  let config = ServerConfig::from_env().wrap_err("bad environment configuration")?;

  let store = SthenoStore::open(&config.store_dir)
    .await
    .wrap_err_with(|| format!("could not open store at {}", config.store_dir.display()))?;

  let state = AppState {
    store,
    limits: config.limits,
    keep_spool: config.keep_spool,
  };
  let router = app(state);

  let addr = format!("{}:{}", config.host, config.port);
  let listener = tokio::net::TcpListener::bind(&addr)
    .await
    .wrap_err_with(|| format!("could not bind {}", addr))?;
  tracing::info!(
    store = %config.store_dir.display(),
    "stheno-cas listening on http://{}",
    addr
  );
  axum::serve(listener, router).await.wrap_err("server exited")?;

  Ok(())
}
