//! Store schema and versioned upgrades.
//!
//! `user_version` is the schema generation. A lower version on disk is
//! upgraded in place after a timestamped file-copy backup; a higher one
//! is fatal (this binary is too old for that store).

use std::fs;
use std::path::Path;

use rusqlite::Connection;
use time::OffsetDateTime;
use time::macros::format_description;

use crate::{Error, Result};

pub const CURRENT_USER_VERSION: i64 = 3;

const SCHEMA_V1: &str = "
CREATE TABLE profile (
    id              TEXT NOT NULL PRIMARY KEY,
    source          BLOB NOT NULL,
    source_format   TEXT NOT NULL,
    fingerprint     TEXT NOT NULL,
    date_added      REAL,
    title           TEXT,
    author          TEXT,
    notes           TEXT,
    beverage_type   TEXT
);

CREATE TABLE sequence (
    id              TEXT NOT NULL PRIMARY KEY,
    active_state    TEXT,
    start_sequence  REAL,
    start_flow      REAL,
    end_flow        REAL,
    end_sequence    REAL,
    profile_id      TEXT REFERENCES profile(id),
    profile_assumed INTEGER,
    resource_version                            TEXT,
    resource_de1_id                             TEXT,
    resource_de1_read_once                      TEXT,
    resource_de1_calibration_flow_multiplier    TEXT,
    resource_de1_control_mode                   TEXT,
    resource_de1_control_tank_water_threshold   TEXT,
    resource_de1_setting_before_flow            TEXT,
    resource_de1_setting_steam                  TEXT,
    resource_de1_setting_target_group_temp      TEXT,
    resource_scale_id                           TEXT
);

CREATE TABLE shot_sample_with_volume_update (
    sequence_id     TEXT NOT NULL,
    version         TEXT,
    sender          TEXT,
    arrival_time    REAL,
    create_time     REAL,
    event_time      REAL,
    de1_time        REAL,
    group_pressure  REAL,
    group_flow      REAL,
    mix_temp        REAL,
    head_temp       REAL,
    frame_number    INTEGER,
    volume_preinfuse REAL,
    volume_pour     REAL,
    volume_total    REAL
);
CREATE INDEX idx_sswvu_sequence ON shot_sample_with_volume_update(sequence_id);

CREATE TABLE weight_and_flow_update (
    sequence_id     TEXT NOT NULL,
    version         TEXT,
    sender          TEXT,
    arrival_time    REAL,
    create_time     REAL,
    event_time      REAL,
    scale_time      REAL,
    current_weight  REAL,
    current_weight_time REAL,
    average_flow    REAL,
    average_flow_time REAL
);
CREATE INDEX idx_wafu_sequence ON weight_and_flow_update(sequence_id);

CREATE TABLE state_update (
    sequence_id     TEXT NOT NULL,
    version         TEXT,
    sender          TEXT,
    arrival_time    REAL,
    create_time     REAL,
    event_time      REAL,
    state           TEXT,
    substate        TEXT,
    previous_state  TEXT,
    previous_substate TEXT
);
CREATE INDEX idx_state_update_sequence ON state_update(sequence_id);

CREATE TABLE sequencer_gate_notification (
    sequence_id     TEXT NOT NULL,
    version         TEXT,
    sender          TEXT,
    arrival_time    REAL,
    create_time     REAL,
    event_time      REAL,
    name            TEXT,
    action          TEXT,
    active_state    TEXT
);
CREATE INDEX idx_sgn_sequence ON sequencer_gate_notification(sequence_id);

CREATE TABLE stop_at_notification (
    sequence_id     TEXT NOT NULL,
    version         TEXT,
    sender          TEXT,
    arrival_time    REAL,
    create_time     REAL,
    event_time      REAL,
    stop_at         TEXT,
    action          TEXT,
    target_value    REAL,
    current_value   REAL,
    active_state    TEXT
);

CREATE TABLE water_level_update (
    sequence_id     TEXT NOT NULL,
    version         TEXT,
    sender          TEXT,
    arrival_time    REAL,
    create_time     REAL,
    event_time      REAL,
    level           REAL,
    start_fill_level REAL
);

CREATE TABLE scale_tare_seen (
    sequence_id     TEXT NOT NULL,
    version         TEXT,
    sender          TEXT,
    arrival_time    REAL,
    create_time     REAL,
    event_time      REAL,
    scale_time      REAL
);

CREATE TABLE auto_tare_notification (
    sequence_id     TEXT NOT NULL,
    version         TEXT,
    sender          TEXT,
    arrival_time    REAL,
    create_time     REAL,
    event_time      REAL,
    action          TEXT
);

CREATE TABLE scale_button_press (
    sequence_id     TEXT NOT NULL,
    version         TEXT,
    sender          TEXT,
    arrival_time    REAL,
    create_time     REAL,
    event_time      REAL,
    button          INTEGER
);

CREATE TABLE connectivity_change (
    sequence_id     TEXT NOT NULL,
    version         TEXT,
    sender          TEXT,
    arrival_time    REAL,
    create_time     REAL,
    event_time      REAL,
    state           TEXT,
    id              TEXT,
    name            TEXT
);

CREATE TABLE persist_hkv (
    header          TEXT NOT NULL,
    key             TEXT NOT NULL,
    value           TEXT,
    PRIMARY KEY (header, key)
);
";

const UPGRADE_001_002: &str = "
CREATE TABLE IF NOT EXISTS device_availability (
    sequence_id     TEXT NOT NULL,
    version         TEXT,
    sender          TEXT,
    arrival_time    REAL,
    create_time     REAL,
    event_time      REAL,
    role            TEXT,
    state           TEXT,
    id              TEXT,
    name            TEXT,
    reason          TEXT
);

CREATE TABLE IF NOT EXISTS scale_change (
    sequence_id     TEXT NOT NULL,
    version         TEXT,
    sender          TEXT,
    arrival_time    REAL,
    create_time     REAL,
    event_time      REAL,
    id              TEXT,
    model           TEXT
);
";

const UPGRADE_002_003: &str = "
CREATE TABLE IF NOT EXISTS bluedot_update (
    sequence_id     TEXT NOT NULL,
    version         TEXT,
    sender          TEXT,
    arrival_time    REAL,
    create_time     REAL,
    event_time      REAL,
    temperature     REAL,
    high_alarm      REAL,
    units           TEXT
);
";

fn user_version(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
}

fn set_user_version(conn: &Connection, version: i64) -> Result<()> {
    conn.execute_batch(&format!("PRAGMA user_version = {version}"))?;
    Ok(())
}

/// Bring the store to `CURRENT_USER_VERSION`, backing up first when an
/// older store is about to be touched.
pub fn ensure_schema(conn: &Connection, db_path: &Path, wall_now: f64) -> Result<()> {
    let found = user_version(conn)?;
    if found == CURRENT_USER_VERSION {
        tracing::debug!("confirmed user_version {found}");
        return Ok(());
    }
    if found > CURRENT_USER_VERSION {
        return Err(Error::fatal(format!(
            "store user_version {found} is newer than supported {CURRENT_USER_VERSION}"
        )));
    }

    if found == 0 {
        tracing::info!("installing schema version {CURRENT_USER_VERSION}");
        conn.execute_batch(SCHEMA_V1)?;
        conn.execute_batch(UPGRADE_001_002)?;
        conn.execute_batch(UPGRADE_002_003)?;
        set_user_version(conn, CURRENT_USER_VERSION)?;
        return Ok(());
    }

    backup_before_upgrade(db_path, wall_now)?;
    let mut version = found;
    while version < CURRENT_USER_VERSION {
        let (step, next) = match version {
            1 => (UPGRADE_001_002, 2),
            2 => (UPGRADE_002_003, 3),
            other => {
                return Err(Error::fatal(format!(
                    "no upgrade path from user_version {other}"
                )));
            }
        };
        tracing::info!("upgrading store {version} -> {next}");
        conn.execute_batch(step)?;
        set_user_version(conn, next)?;
        version = next;
    }
    Ok(())
}

/// Timestamped file copy alongside the store, `<db>.YYYYmmdd_HHMM`.
fn backup_before_upgrade(db_path: &Path, wall_now: f64) -> Result<()> {
    let stamp = OffsetDateTime::from_unix_timestamp(wall_now as i64)
        .map_err(|e| Error::fatal(format!("bad wall clock for backup stamp: {e}")))?
        .format(format_description!("[year][month][day]_[hour][minute]"))
        .map_err(|e| Error::fatal(format!("backup stamp format: {e}")))?;
    let backup = db_path.with_file_name(format!(
        "{}.{stamp}",
        db_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("pyde1.sqlite3")
    ));
    if backup.exists() {
        return Err(Error::fatal(format!(
            "backup destination exists: {}",
            backup.display()
        )));
    }
    tracing::info!("backing up store to {}", backup.display());
    fs::copy(db_path, &backup)?;
    Ok(())
}

/// The v1 DDL, for building fixture stores in tests.
pub fn schema_v1_for_tests() -> &'static str {
    SCHEMA_V1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_store_lands_on_current_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pyde1.sqlite3");
        let conn = Connection::open(&path).unwrap();
        ensure_schema(&conn, &path, 1_700_000_000.0).unwrap();
        assert_eq!(user_version(&conn).unwrap(), CURRENT_USER_VERSION);
        // Spot-check tables across all three generations.
        for table in ["sequence", "device_availability", "bluedot_update"] {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                    [table],
                    |row| row.get(0),
                )
                .unwrap();
            assert_eq!(count, 1, "missing table {table}");
        }
    }

    #[test]
    fn newer_store_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pyde1.sqlite3");
        let conn = Connection::open(&path).unwrap();
        set_user_version(&conn, 99).unwrap();
        let err = ensure_schema(&conn, &path, 1_700_000_000.0).unwrap_err();
        assert_eq!(err.code(), "fatal");
    }
}
