//! Config loading from the YAML surface.
//!
//! Unknown sections and keys are warned about and ignored; a missing
//! file yields the built-in defaults.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use serde_yaml::Value;

use super::Config;
use crate::{Error, Result};

pub fn load(path: &Path) -> Result<Config> {
    let contents = fs::read_to_string(path)
        .map_err(|e| Error::bad_request(format!("failed to read {}: {e}", path.display())))?;
    let raw: Value = serde_yaml::from_str(&contents)
        .map_err(|e| Error::bad_request(format!("failed to parse {}: {e}", path.display())))?;
    warn_unknown_keys(&raw);
    serde_yaml::from_value(raw)
        .map_err(|e| Error::bad_request(format!("failed to load {}: {e}", path.display())))
}

pub fn load_or_default(path: &Path) -> Config {
    if !path.exists() {
        tracing::info!("no config at {}, using defaults", path.display());
        return Config::default();
    }
    match load(path) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::warn!("config load failed, using defaults: {e}");
            Config::default()
        }
    }
}

const KNOWN_SECTIONS: &[&str] = &["bluetooth", "database", "de1", "http", "logging", "mqtt"];

fn warn_unknown_keys(raw: &Value) {
    let Value::Mapping(sections) = raw else {
        return;
    };
    for (section, body) in sections {
        let Some(section) = section.as_str() else {
            continue;
        };
        if !KNOWN_SECTIONS.contains(&section) {
            tracing::warn!("unrecognized config section '{section}'");
            continue;
        }
        if let Value::Mapping(keys) = body {
            let known = known_keys_for(section);
            for key in keys.keys() {
                if let Some(key) = key.as_str()
                    && !known.contains(key)
                {
                    tracing::warn!("unrecognized config key '{section}.{key}'");
                }
            }
        }
    }
}

fn known_keys_for(section: &str) -> BTreeSet<&'static str> {
    let keys: &[&str] = match section {
        "bluetooth" => &[
            "SCAN_TIME",
            "CONNECT_TIMEOUT",
            "DISCONNECT_TIMEOUT",
            "RECONNECT_RETRY_COUNT",
            "RECONNECT_GAP",
            "ID_FILE_DIRECTORY",
            "ID_FILE_SUFFIX",
        ],
        "database" => &["FILENAME", "BACKUP_TIMEOUT"],
        "de1" => &[
            "LINE_FREQUENCY",
            "DEFAULT_AUTO_OFF_TIME",
            "STOP_AT_WEIGHT_ADJUST",
            "MAX_WAIT_FOR_READY_EVENTS",
            "SEQUENCE_WATCHDOG_TIMEOUT",
            "PRE_SEQUENCE_WINDOW",
        ],
        "http" => &[
            "SERVER_HOST",
            "SERVER_PORT",
            "PATCH_SIZE_LIMIT",
            "ASYNC_TIMEOUT",
            "PROFILE_TIMEOUT",
        ],
        "logging" => &["LOG_DIRECTORY", "LEVEL_MAIN", "LEVEL_STDERR"],
        "mqtt" => &["TOPIC_ROOT", "BROKER_HOSTNAME", "BROKER_PORT"],
        _ => &[],
    };
    keys.iter().copied().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let cfg = load_or_default(Path::new("/nonexistent/pyde1.conf"));
        assert_eq!(cfg.http.server_port, 1234);
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pyde1.conf");
        fs::write(&path, "http:\n  SERVER_PORT: 9876\n").unwrap();
        let cfg = load(&path).unwrap();
        assert_eq!(cfg.http.server_port, 9876);
    }

    #[test]
    fn unknown_keys_do_not_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pyde1.conf");
        fs::write(&path, "de1:\n  NOT_A_KEY: 1\nnot_a_section:\n  x: 2\n").unwrap();
        let cfg = load(&path).unwrap();
        assert_eq!(cfg.de1.line_frequency, 50);
    }
}
