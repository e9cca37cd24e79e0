// This file is part of Detection Supervisor, a CCTV parking-violation detector.
// Copyright (C) 2026 The Detection Supervisor Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Loads the TOML config file and applies `SUP__SECTION__KEY` environment
//! overrides before handing it to `domain::config`'s schema.

use std::path::Path;

use base::{format_err_t, Error};
use serde::Deserialize as _;

/// Parses a scalar env var value into the most specific TOML type it fits:
/// bool, then integer, then float, falling back to string.
fn parse_scalar(raw: &str) -> toml::Value {
    if let Ok(b) = raw.parse::<bool>() {
        toml::Value::Boolean(b)
    } else if let Ok(i) = raw.parse::<i64>() {
        toml::Value::Integer(i)
    } else if let Ok(f) = raw.parse::<f64>() {
        toml::Value::Float(f)
    } else {
        toml::Value::String(raw.to_owned())
    }
}

/// `SUP__BACKEND__BASE_URL=http://x` overrides `[backend] base_url = "..."`.
/// Doesn't support the `streams` array; there's no sane section/field mapping
/// for a list of tables, so per-stream config stays file-only.
fn apply_env_overrides(mut value: toml::Value) -> Result<toml::Value, Error> {
    let table = value
        .as_table_mut()
        .ok_or_else(|| format_err_t!(Config, "config file root must be a table"))?;
    for (key, raw) in std::env::vars() {
        let Some(rest) = key.strip_prefix("SUP__") else {
            continue;
        };
        let Some((section, field)) = rest.split_once("__") else {
            continue;
        };
        let section = section.to_lowercase();
        let field = field.to_lowercase();
        let entry = table
            .entry(section.clone())
            .or_insert_with(|| toml::Value::Table(Default::default()));
        let Some(section_table) = entry.as_table_mut() else {
            return Err(format_err_t!(
                Config,
                "env var {}: [{}] is not a table in the config file",
                key,
                section
            ));
        };
        section_table.insert(field, parse_scalar(&raw));
    }
    Ok(value)
}

pub fn load(path: &Path) -> Result<domain::config::ConfigFile, Error> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| format_err_t!(Config, "reading {}: {}", path.display(), e))?;
    let value: toml::Value =
        toml::from_str(&raw).map_err(|e| format_err_t!(Config, "parsing {}: {}", path.display(), e))?;
    let value = apply_env_overrides(value)?;
    domain::config::ConfigFile::deserialize(value)
        .map_err(|e| format_err_t!(Config, "config {}: {}", path.display(), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn minimal_config() -> &'static str {
        r#"
        [backend]
        base_url = "http://backend.example"

        [models]
        base_url = "http://models.example"
        "#
    }

    #[test]
    fn loads_minimal_config_with_defaults() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(minimal_config().as_bytes()).unwrap();
        let cfg = load(f.path()).unwrap();
        assert_eq!(cfg.backend.base_url, "http://backend.example");
        assert_eq!(cfg.pipeline.workers, 3);
        assert!(cfg.streams.is_empty());
    }

    #[test]
    fn env_override_replaces_section_field() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(minimal_config().as_bytes()).unwrap();
        std::env::set_var("SUP__BACKEND__BASE_URL", "http://overridden.example");
        std::env::set_var("SUP__PIPELINE__WORKERS", "7");
        let cfg = load(f.path()).unwrap();
        std::env::remove_var("SUP__BACKEND__BASE_URL");
        std::env::remove_var("SUP__PIPELINE__WORKERS");
        assert_eq!(cfg.backend.base_url, "http://overridden.example");
        assert_eq!(cfg.pipeline.workers, 7);
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let err = load(Path::new("/nonexistent/detection-supervisor.toml")).unwrap_err();
        assert_eq!(err.kind(), base::ErrorKind::Config);
    }
}
