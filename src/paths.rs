//! Default filesystem locations.

use std::path::PathBuf;

pub const VAR_LIB_DIR: &str = "/var/lib/pyde1";
pub const CONF_DIR: &str = "/usr/local/etc/pyde1";

pub fn default_database_path() -> PathBuf {
    PathBuf::from(VAR_LIB_DIR).join("pyde1.sqlite3")
}

pub fn default_config_path() -> PathBuf {
    PathBuf::from(CONF_DIR).join("pyde1.conf")
}

pub fn default_id_file_directory() -> PathBuf {
    PathBuf::from(VAR_LIB_DIR)
}

pub fn default_log_directory() -> PathBuf {
    PathBuf::from("/var/log/pyde1")
}
