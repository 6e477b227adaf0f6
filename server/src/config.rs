/*
 * Description: Environment-driven server configuration.
 *
 * Copyright (C) 2023 Danny McClanahan <dmcC2@hypnicjerk.ai>
 * SPDX-License-Identifier: Apache-2.0
 *
 * Licensed under the Apache License, Version 2.0 (see LICENSE).
 */

//! Environment-driven server configuration.

use libstheno_cas::IngestLimits;

use std::{env, path::PathBuf, str::FromStr};

/// Everything the binary reads from its environment.
#[derive(Clone, Debug)]
pub struct ServerConfig {
  pub host: String,
  pub port: u16,
  pub store_dir: PathBuf,
  pub keep_spool: bool,
  pub limits: IngestLimits,
}

fn env_parse<T: FromStr>(key: &str, default: T) -> eyre::Result<T> {
  match env::var(key) {
    Ok(raw) => raw
      .parse()
      .map_err(|_| eyre::eyre!("could not parse {}={:?}", key, raw)),
    Err(_) => Ok(default),
  }
}

fn env_truthy(key: &str) -> bool {
  match env::var(key) {
    Ok(raw) => !matches!(raw.to_lowercase().as_str(), "" | "0" | "false" | "no" | "off"),
    Err(_) => false,
  }
}

impl ServerConfig {
  pub fn from_env() -> eyre::Result<Self> {
    let defaults = IngestLimits::default();
    Ok(Self {
      host: env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
      port: env_parse("PORT", 8787_u16)?,
      store_dir: env::var("STORE_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./store")),
      keep_spool: env_truthy("KEEP_SPOOL"),
      limits: IngestLimits {
        max_entries: env_parse("MAX_ENTRIES", defaults.max_entries)?,
        max_file_bytes: env_parse("MAX_FILE_BYTES", defaults.max_file_bytes)?,
        max_total_bytes: env_parse("MAX_TOTAL_BYTES", defaults.max_total_bytes)?,
        max_zip_bytes: env_parse("MAX_ZIP_BYTES", defaults.max_zip_bytes)?,
      },
    })
  }
}
