//! Typed configuration record.
//!
//! Keys keep the upper-case names of the YAML surface so existing config
//! files load unchanged. Every key is optional; missing keys take the
//! documented defaults below.

mod load;

pub use load::{load, load_or_default};

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::paths;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub bluetooth: BluetoothConfig,
    pub database: DatabaseConfig,
    pub de1: De1Config,
    pub http: HttpConfig,
    pub logging: LoggingConfig,
    pub mqtt: MqttConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BluetoothConfig {
    #[serde(rename = "SCAN_TIME")]
    pub scan_time: f64,
    #[serde(rename = "CONNECT_TIMEOUT")]
    pub connect_timeout: f64,
    #[serde(rename = "DISCONNECT_TIMEOUT")]
    pub disconnect_timeout: f64,
    #[serde(rename = "RECONNECT_RETRY_COUNT")]
    pub reconnect_retry_count: u32,
    #[serde(rename = "RECONNECT_GAP")]
    pub reconnect_gap: f64,
    #[serde(rename = "ID_FILE_DIRECTORY")]
    pub id_file_directory: PathBuf,
    #[serde(rename = "ID_FILE_SUFFIX")]
    pub id_file_suffix: String,
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            scan_time: 5.0,
            connect_timeout: 10.0,
            disconnect_timeout: 5.0,
            reconnect_retry_count: 10,
            reconnect_gap: 10.0,
            id_file_directory: paths::default_id_file_directory(),
            id_file_suffix: ".btid".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    #[serde(rename = "FILENAME")]
    pub filename: PathBuf,
    #[serde(rename = "BACKUP_TIMEOUT")]
    pub backup_timeout: f64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            filename: paths::default_database_path(),
            backup_timeout: 60.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct De1Config {
    #[serde(rename = "LINE_FREQUENCY")]
    pub line_frequency: u32,
    #[serde(rename = "DEFAULT_AUTO_OFF_TIME")]
    pub default_auto_off_time: Option<f64>,
    /// Seconds; larger increases the weight left in the cup.
    #[serde(rename = "STOP_AT_WEIGHT_ADJUST")]
    pub stop_at_weight_adjust: f64,
    #[serde(rename = "MAX_WAIT_FOR_READY_EVENTS")]
    pub max_wait_for_ready_events: f64,
    #[serde(rename = "SEQUENCE_WATCHDOG_TIMEOUT")]
    pub sequence_watchdog_timeout: f64,
    /// Lookback interval for retroactive capture into a new sequence.
    #[serde(rename = "PRE_SEQUENCE_WINDOW")]
    pub pre_sequence_window: f64,
}

impl Default for De1Config {
    fn default() -> Self {
        Self {
            line_frequency: 50,
            default_auto_off_time: None,
            stop_at_weight_adjust: -0.07,
            max_wait_for_ready_events: 3.0,
            sequence_watchdog_timeout: 270.0,
            pre_sequence_window: 2.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    #[serde(rename = "SERVER_HOST")]
    pub server_host: String,
    #[serde(rename = "SERVER_PORT")]
    pub server_port: u16,
    #[serde(rename = "PATCH_SIZE_LIMIT")]
    pub patch_size_limit: usize,
    #[serde(rename = "ASYNC_TIMEOUT")]
    pub async_timeout: f64,
    #[serde(rename = "PROFILE_TIMEOUT")]
    pub profile_timeout: f64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            server_host: String::new(),
            server_port: 1234,
            patch_size_limit: 16384,
            async_timeout: 1.0,
            profile_timeout: 4.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    #[serde(rename = "LOG_DIRECTORY")]
    pub log_directory: PathBuf,
    #[serde(rename = "LEVEL_MAIN")]
    pub level_main: String,
    #[serde(rename = "LEVEL_STDERR")]
    pub level_stderr: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_directory: paths::default_log_directory(),
            level_main: "info".to_string(),
            level_stderr: "warn".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    #[serde(rename = "TOPIC_ROOT")]
    pub topic_root: String,
    #[serde(rename = "BROKER_HOSTNAME")]
    pub broker_hostname: String,
    #[serde(rename = "BROKER_PORT")]
    pub broker_port: u16,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            topic_root: "pyDE1".to_string(),
            broker_hostname: "::1".to_string(),
            broker_port: 1883,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.bluetooth.connect_timeout, 10.0);
        assert_eq!(cfg.de1.sequence_watchdog_timeout, 270.0);
        assert_eq!(cfg.de1.stop_at_weight_adjust, -0.07);
        assert_eq!(cfg.bluetooth.id_file_suffix, ".btid");
    }

    #[test]
    fn yaml_keys_keep_upper_case_names() {
        let yaml = "
bluetooth:
  CONNECT_TIMEOUT: 20.0
  RECONNECT_RETRY_COUNT: 3
de1:
  SEQUENCE_WATCHDOG_TIMEOUT: 300
";
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.bluetooth.connect_timeout, 20.0);
        assert_eq!(cfg.bluetooth.reconnect_retry_count, 3);
        assert_eq!(cfg.de1.sequence_watchdog_timeout, 300.0);
        // Untouched sections fall back to defaults.
        assert_eq!(cfg.database.backup_timeout, 60.0);
    }
}
