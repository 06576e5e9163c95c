//! Service configuration.
//!
//! Two layers: process environment read once at startup, and per-workspace
//! defaults persisted in the `settings` table.

use crate::db;
use crate::error::{ResultsError, Result};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;

pub const RESULTS_DEFAULTS_KEY: &str = "results.defaults";

pub const DEFAULT_TEST_SET_NAME: &str = "Monthly Test Set";
pub const DEFAULT_CLEAN_SAMPLE_SIZE: i64 = 100_000;
pub const DEFAULT_AUTOSAVE_QUIET_MS: u64 = 400;

pub const LOG_ENV: &str = "RESULTSD_LOG";
pub const WORKSPACE_ENV: &str = "RESULTSD_WORKSPACE";

/// Values used when a period has no stored meta yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResultsDefaults {
    pub test_set_name: String,
    pub clean_sample_size: i64,
    pub autosave_quiet_ms: u64,
}

impl Default for ResultsDefaults {
    fn default() -> Self {
        ResultsDefaults {
            test_set_name: DEFAULT_TEST_SET_NAME.to_string(),
            clean_sample_size: DEFAULT_CLEAN_SAMPLE_SIZE,
            autosave_quiet_ms: DEFAULT_AUTOSAVE_QUIET_MS,
        }
    }
}

impl ResultsDefaults {
    pub fn autosave_quiet(&self) -> Duration {
        Duration::from_millis(self.autosave_quiet_ms)
    }

    /// Loads the workspace defaults; a missing or unreadable entry falls back
    /// to built-in values.
    pub fn load(conn: &Connection) -> Self {
        match db::settings_get_json(conn, RESULTS_DEFAULTS_KEY) {
            Ok(Some(v)) => match serde_json::from_value(v) {
                Ok(d) => d,
                Err(e) => {
                    tracing::warn!(error = %e, "ignoring malformed results defaults");
                    ResultsDefaults::default()
                }
            },
            Ok(None) => ResultsDefaults::default(),
            Err(e) => {
                tracing::warn!(error = %e, "failed to read results defaults");
                ResultsDefaults::default()
            }
        }
    }

    /// Merges `params` into the stored defaults and persists the result.
    pub fn update(conn: &Connection, params: &serde_json::Value) -> Result<Self> {
        let mut next = ResultsDefaults::load(conn);
        if let Some(v) = params.get("testSetName") {
            let name = v
                .as_str()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .ok_or_else(|| ResultsError::validation("testSetName must be a non-empty string"))?;
            next.test_set_name = name.to_string();
        }
        if let Some(v) = params.get("cleanSampleSize") {
            next.clean_sample_size = v.as_i64().filter(|n| *n >= 0).ok_or_else(|| {
                ResultsError::validation_with(
                    "cleanSampleSize must be a non-negative integer",
                    json!({ "cleanSampleSize": v }),
                )
            })?;
        }
        if let Some(v) = params.get("autosaveQuietMs") {
            next.autosave_quiet_ms = v.as_u64().ok_or_else(|| {
                ResultsError::validation_with(
                    "autosaveQuietMs must be a non-negative integer",
                    json!({ "autosaveQuietMs": v }),
                )
            })?;
        }
        let value = serde_json::to_value(&next).map_err(anyhow::Error::from)?;
        db::settings_set_json(conn, RESULTS_DEFAULTS_KEY, &value)?;
        Ok(next)
    }
}

/// Startup configuration taken from the environment.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub log_filter: String,
    pub workspace: Option<PathBuf>,
}

impl DaemonConfig {
    pub fn from_env() -> Self {
        DaemonConfig {
            log_filter: std::env::var(LOG_ENV).unwrap_or_else(|_| "warn".to_string()),
            workspace: std::env::var_os(WORKSPACE_ENV)
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
        }
    }
}
