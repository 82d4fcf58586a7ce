//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`NbeSettings::default()`]
//! 2. If `~/.nbe/settings.json` exists, deep-merge user values over defaults
//! 3. Apply `NBE_*` environment overrides

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::NbeSettings;

/// The NBE home directory (`~/.nbe`).
pub fn nbe_home() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".nbe")
}

/// Resolve the path to the settings file (`~/.nbe/settings.json`).
pub fn settings_path() -> PathBuf {
    nbe_home().join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<NbeSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<NbeSettings> {
    let mut settings = load_file_layer(path)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

fn load_file_layer(path: &Path) -> Result<NbeSettings> {
    let defaults = serde_json::to_value(NbeSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

/// Recursive deep merge of two JSON values.
///
/// Objects merge per key; arrays and primitives in `source` replace the
/// target; `null` in `source` keeps the target value.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `NBE_*` process environment overrides.
pub fn apply_env_overrides(settings: &mut NbeSettings) {
    apply_overrides(settings, |name| std::env::var(name).ok());
}

/// Apply overrides read through `lookup`.
///
/// Numbers must parse and fall inside their range; anything else is logged
/// and ignored, leaving the file/default value in place. Empty strings count
/// as unset.
pub fn apply_overrides<F>(settings: &mut NbeSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let env = EnvReader { lookup };

    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = env.string("NBE_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.u16("NBE_PORT", 1, 65535) {
        settings.server.port = v;
    }

    // ── Dispatch ────────────────────────────────────────────────────
    if let Some(v) = env.usize("NBE_FLUSH_SIZE", 1, 100_000) {
        settings.dispatch.flush_size = v;
    }
    if let Some(v) = env.u64("NBE_FLUSH_INTERVAL_MS", 10, 3_600_000) {
        settings.dispatch.flush_interval_ms = v;
    }

    // ── Hub ─────────────────────────────────────────────────────────
    if let Some(v) = env.usize("NBE_COMPLETION_BATCH_SIZE", 1, 100_000) {
        settings.hub.completion_batch_size = v;
    }
    if let Some(v) = env.u64("NBE_LIVENESS_TIMEOUT_MS", 1_000, 86_400_000) {
        settings.hub.liveness_timeout_ms = v;
    }
    if let Some(v) = env.u64("NBE_LIVENESS_SWEEP_INTERVAL_MS", 1_000, 86_400_000) {
        settings.hub.liveness_sweep_interval_ms = v;
    }

    // ── Paths ───────────────────────────────────────────────────────
    if let Some(v) = env.string("NBE_DB_PATH") {
        settings.database.path = v;
    }
    if let Some(v) = env.string("NBE_STATIC_DIR") {
        settings.proxy.static_dir = v;
    }
    if let Some(v) = env.string("NBE_STATIC_SRC_DIR") {
        settings.proxy.static_src_dir = v;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = env.string("NBE_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.bool("NBE_LOG_JSON") {
        settings.logging.json = v;
    }
}

// ── Pure parsing functions ──────────────────────────────────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u16` within an inclusive range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.trim().parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}

/// Parse a string as a `u64` within an inclusive range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}

/// Parse a string as a `usize` within an inclusive range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.trim().parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}

// ── Env readers ─────────────────────────────────────────────────────────────

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn parsed<T>(&self, name: &str, kind: &str, parse: impl FnOnce(&str) -> Option<T>) -> Option<T> {
        let val = self.string(name)?;
        let result = parse(&val);
        if result.is_none() {
            warn!(key = name, value = %val, kind, "invalid env var, ignoring");
        }
        result
    }

    fn bool(&self, name: &str) -> Option<bool> {
        self.parsed(name, "bool", parse_bool)
    }

    fn u16(&self, name: &str, min: u16, max: u16) -> Option<u16> {
        self.parsed(name, "u16", |v| parse_u16_range(v, min, max))
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        self.parsed(name, "u64", |v| parse_u64_range(v, min, max))
    }

    fn usize(&self, name: &str, min: usize, max: usize) -> Option<usize> {
        self.parsed(name, "usize", |v| parse_usize_range(v, min, max))
    }
}
