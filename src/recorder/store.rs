//! The history store: single-file, WAL-journaled, one writer.
//!
//! All writes funnel through this connection. Readers elsewhere open
//! their own read-only connections against the same file.

use std::path::{Path, PathBuf};

use rusqlite::{Connection, OpenFlags, params};
use serde::Serialize;

use super::schema;
use crate::event::{Envelope, Payload};
use crate::profile::{Profile, SourceFormat};
use crate::{Error, Result};

/// Child rows captured before any sequence opened carry this id.
pub const PRE_SEQUENCE_ID: &str = "(pre-sequence)";

/// The one writer connection, shared between the recorder thread and
/// the profile registry. The lock is held only over individual
/// statements and batch boundaries.
pub type SharedStore = std::sync::Arc<std::sync::Mutex<HistoryStore>>;

pub fn into_shared(store: HistoryStore) -> SharedStore {
    std::sync::Arc::new(std::sync::Mutex::new(store))
}

/// Snapshot columns for a new sequence row, fetched from cached state.
#[derive(Debug, Clone, Default)]
pub struct SequenceSnapshots {
    pub resource_version: String,
    pub de1_id: String,
    pub de1_read_once: String,
    pub de1_calibration_flow_multiplier: String,
    pub de1_control_mode: String,
    pub de1_control_tank_water_threshold: String,
    pub de1_setting_before_flow: String,
    pub de1_setting_steam: String,
    pub de1_setting_target_group_temp: String,
    pub scale_id: String,
}

#[derive(Debug, Clone)]
pub struct SequenceRow {
    pub id: String,
    pub active_state: String,
    pub start_sequence: f64,
    pub profile_id: Option<String>,
    pub profile_assumed: bool,
    pub snapshots: SequenceSnapshots,
}

#[derive(Debug)]
pub struct HistoryStore {
    conn: Connection,
    path: PathBuf,
    in_batch: bool,
}

impl HistoryStore {
    pub fn open(path: &Path, wall_now: f64) -> Result<Self> {
        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            std::fs::create_dir_all(dir)?;
        }
        let conn = Connection::open(path)?;
        // journal_mode answers with the resulting mode.
        let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        schema::ensure_schema(&conn, path, wall_now)?;
        Ok(Self {
            conn,
            path: path.to_path_buf(),
            in_batch: false,
        })
    }

    /// Read-only companion connection to the same file.
    pub fn open_reader(&self) -> Result<Connection> {
        Ok(Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY,
        )?)
    }

    // === Batching ===

    /// Writes between `begin_batch` and `commit_batch` share one
    /// transaction; the recorder commits on a short interval to
    /// amortise syncs.
    pub fn begin_batch(&mut self) -> Result<()> {
        if !self.in_batch {
            self.conn.execute_batch("BEGIN")?;
            self.in_batch = true;
        }
        Ok(())
    }

    pub fn commit_batch(&mut self) -> Result<()> {
        if self.in_batch {
            self.conn.execute_batch("COMMIT")?;
            self.in_batch = false;
        }
        Ok(())
    }

    // === Profiles ===

    /// Content-addressed and duplicate-safe: inserting the same source
    /// twice is a no-op. Returns whether a row was added.
    pub fn insert_profile(&mut self, profile: &Profile) -> Result<bool> {
        let existing: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM profile WHERE id = ?1",
            [&profile.id],
            |row| row.get(0),
        )?;
        if existing > 0 {
            tracing::info!("profile {} already in profile table", profile.id);
            return Ok(false);
        }
        self.conn.execute(
            "INSERT INTO profile (id, source, source_format, fingerprint,
                 date_added, title, author, notes, beverage_type)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                profile.id,
                profile.source,
                profile.source_format.as_str(),
                profile.fingerprint,
                profile.date_added,
                profile.title,
                profile.author,
                profile.notes,
                profile.beverage_type,
            ],
        )?;
        tracing::info!("profile {} added to profile table", profile.id);
        Ok(true)
    }

    pub fn get_profile(&self, id: &str) -> Result<Option<Profile>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, source, source_format, fingerprint, date_added,
                    title, author, notes, beverage_type
             FROM profile WHERE id = ?1",
        )?;
        let mut rows = stmt.query([id])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };
        let format: String = row.get(2)?;
        if format != SourceFormat::JsonV2.as_str() {
            return Err(Error::fatal(format!(
                "profile {id} has unrecognized source format '{format}'"
            )));
        }
        Ok(Some(Profile {
            id: row.get(0)?,
            source: row.get(1)?,
            source_format: SourceFormat::JsonV2,
            fingerprint: row.get(3)?,
            date_added: row.get::<_, Option<f64>>(4)?.unwrap_or(0.0),
            title: row.get(5)?,
            author: row.get(6)?,
            notes: row.get(7)?,
            beverage_type: row.get(8)?,
        }))
    }

    // === persist_hkv ===

    pub fn set_persist_value(&mut self, header: &str, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO persist_hkv (header, key, value) VALUES (?1, ?2, ?3)
             ON CONFLICT (header, key) DO UPDATE SET value = excluded.value",
            params![header, key, value],
        )?;
        Ok(())
    }

    pub fn get_persist_value(&self, header: &str, key: &str) -> Result<Option<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT value FROM persist_hkv WHERE header = ?1 AND key = ?2")?;
        let mut rows = stmt.query([header, key])?;
        match rows.next()? {
            Some(row) => Ok(row.get(0)?),
            None => Ok(None),
        }
    }

    pub fn set_last_profile(&mut self, id: &str, when: f64) -> Result<()> {
        self.set_persist_value("last_profile", "id", id)?;
        self.set_persist_value("last_profile", "datetime", &when.to_string())?;
        Ok(())
    }

    pub fn last_profile_id(&self) -> Result<Option<String>> {
        self.get_persist_value("last_profile", "id")
    }

    // === Sequences ===

    pub fn insert_sequence(&mut self, row: &SequenceRow) -> Result<()> {
        let s = &row.snapshots;
        self.conn.execute(
            "INSERT INTO sequence
                (id, active_state, start_sequence, profile_id, profile_assumed,
                 resource_version, resource_de1_id, resource_de1_read_once,
                 resource_de1_calibration_flow_multiplier, resource_de1_control_mode,
                 resource_de1_control_tank_water_threshold, resource_de1_setting_before_flow,
                 resource_de1_setting_steam, resource_de1_setting_target_group_temp,
                 resource_scale_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                row.id,
                row.active_state,
                row.start_sequence,
                row.profile_id,
                row.profile_assumed,
                s.resource_version,
                s.de1_id,
                s.de1_read_once,
                s.de1_calibration_flow_multiplier,
                s.de1_control_mode,
                s.de1_control_tank_water_threshold,
                s.de1_setting_before_flow,
                s.de1_setting_steam,
                s.de1_setting_target_group_temp,
                s.scale_id,
            ],
        )?;
        Ok(())
    }

    pub fn set_sequence_start_flow(&mut self, id: &str, when: f64) -> Result<()> {
        self.set_sequence_time(id, "start_flow", when)
    }

    pub fn set_sequence_end_flow(&mut self, id: &str, when: f64) -> Result<()> {
        self.set_sequence_time(id, "end_flow", when)
    }

    pub fn set_sequence_end(&mut self, id: &str, when: f64) -> Result<()> {
        self.set_sequence_time(id, "end_sequence", when)
    }

    fn set_sequence_time(&mut self, id: &str, column: &str, when: f64) -> Result<()> {
        // Column names come from the three setters above, never from
        // callers.
        let sql = format!("UPDATE sequence SET {column} = ?1 WHERE id = ?2");
        self.conn.execute(&sql, params![when, id])?;
        Ok(())
    }

    pub fn sequence_times(&self, id: &str) -> Result<Option<(f64, Option<f64>, Option<f64>, Option<f64>)>> {
        let mut stmt = self.conn.prepare(
            "SELECT start_sequence, start_flow, end_flow, end_sequence
             FROM sequence WHERE id = ?1",
        )?;
        let mut rows = stmt.query([id])?;
        match rows.next()? {
            Some(row) => Ok(Some((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))),
            None => Ok(None),
        }
    }

    // === Event rows ===

    /// Persist one bus envelope under `sequence_id`. Kinds with no
    /// table of their own are skipped.
    pub fn insert_notification(&mut self, env: &Envelope, sequence_id: &str) -> Result<bool> {
        match &env.payload {
            Payload::ShotSample(p) => {
                let mut stmt = self.conn.prepare_cached(
                    "INSERT INTO shot_sample_with_volume_update
                     (sequence_id, version, sender, arrival_time, create_time, event_time,
                      de1_time, group_pressure, group_flow, mix_temp, head_temp,
                      frame_number, volume_preinfuse, volume_pour, volume_total)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)",
                )?;
                stmt.execute(params![
                    sequence_id,
                    env.version,
                    env.sender,
                    env.arrival_time,
                    env.create_time,
                    env.event_time,
                    p.de1_time,
                    p.group_pressure,
                    p.group_flow,
                    p.mix_temp,
                    p.head_temp,
                    p.frame_number,
                    p.volume_preinfuse,
                    p.volume_pour,
                    p.volume_total,
                ])?;
                Ok(true)
            }
            Payload::WeightAndFlow(p) => {
                self.conn.execute(
                    "INSERT INTO weight_and_flow_update
                     (sequence_id, version, sender, arrival_time, create_time, event_time,
                      scale_time, current_weight, current_weight_time, average_flow,
                      average_flow_time)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)",
                    params![
                        sequence_id,
                        env.version,
                        env.sender,
                        env.arrival_time,
                        env.create_time,
                        env.event_time,
                        p.scale_time,
                        p.current_weight,
                        p.current_weight_time,
                        p.average_flow,
                        p.average_flow_time,
                    ],
                )?;
                Ok(true)
            }
            Payload::StateUpdate(p) => {
                self.conn.execute(
                    "INSERT INTO state_update
                     (sequence_id, version, sender, arrival_time, create_time, event_time,
                      state, substate, previous_state, previous_substate)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)",
                    params![
                        sequence_id,
                        env.version,
                        env.sender,
                        env.arrival_time,
                        env.create_time,
                        env.event_time,
                        enum_str(&p.state),
                        enum_str(&p.substate),
                        enum_str(&p.previous_state),
                        enum_str(&p.previous_substate),
                    ],
                )?;
                Ok(true)
            }
            Payload::SequencerGate(p) => {
                self.conn.execute(
                    "INSERT INTO sequencer_gate_notification
                     (sequence_id, version, sender, arrival_time, create_time, event_time,
                      name, action, active_state)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
                    params![
                        sequence_id,
                        env.version,
                        env.sender,
                        env.arrival_time,
                        env.create_time,
                        env.event_time,
                        enum_str(&p.name),
                        enum_str(&p.action),
                        enum_str(&p.active_state),
                    ],
                )?;
                Ok(true)
            }
            Payload::StopAt(p) => {
                self.conn.execute(
                    "INSERT INTO stop_at_notification
                     (sequence_id, version, sender, arrival_time, create_time, event_time,
                      stop_at, action, target_value, current_value, active_state)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)",
                    params![
                        sequence_id,
                        env.version,
                        env.sender,
                        env.arrival_time,
                        env.create_time,
                        env.event_time,
                        enum_str(&p.stop_at),
                        enum_str(&p.action),
                        p.target_value,
                        p.current_value,
                        enum_str(&p.active_state),
                    ],
                )?;
                Ok(true)
            }
            Payload::WaterLevel(p) => {
                self.conn.execute(
                    "INSERT INTO water_level_update
                     (sequence_id, version, sender, arrival_time, create_time, event_time,
                      level, start_fill_level)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
                    params![
                        sequence_id,
                        env.version,
                        env.sender,
                        env.arrival_time,
                        env.create_time,
                        env.event_time,
                        p.level,
                        p.start_fill_level,
                    ],
                )?;
                Ok(true)
            }
            Payload::ScaleTare(p) => {
                self.conn.execute(
                    "INSERT INTO scale_tare_seen
                     (sequence_id, version, sender, arrival_time, create_time, event_time,
                      scale_time)
                     VALUES (?1,?2,?3,?4,?5,?6,?7)",
                    params![
                        sequence_id,
                        env.version,
                        env.sender,
                        env.arrival_time,
                        env.create_time,
                        env.event_time,
                        p.scale_time,
                    ],
                )?;
                Ok(true)
            }
            Payload::AutoTare(p) => {
                self.conn.execute(
                    "INSERT INTO auto_tare_notification
                     (sequence_id, version, sender, arrival_time, create_time, event_time,
                      action)
                     VALUES (?1,?2,?3,?4,?5,?6,?7)",
                    params![
                        sequence_id,
                        env.version,
                        env.sender,
                        env.arrival_time,
                        env.create_time,
                        env.event_time,
                        enum_str(&p.action),
                    ],
                )?;
                Ok(true)
            }
            Payload::ScaleButton(p) => {
                self.conn.execute(
                    "INSERT INTO scale_button_press
                     (sequence_id, version, sender, arrival_time, create_time, event_time,
                      button)
                     VALUES (?1,?2,?3,?4,?5,?6,?7)",
                    params![
                        sequence_id,
                        env.version,
                        env.sender,
                        env.arrival_time,
                        env.create_time,
                        env.event_time,
                        p.button,
                    ],
                )?;
                Ok(true)
            }
            Payload::Connectivity(p) => {
                self.conn.execute(
                    "INSERT INTO connectivity_change
                     (sequence_id, version, sender, arrival_time, create_time, event_time,
                      state, id, name)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
                    params![
                        sequence_id,
                        env.version,
                        env.sender,
                        env.arrival_time,
                        env.create_time,
                        env.event_time,
                        enum_str(&p.state),
                        p.id,
                        p.name,
                    ],
                )?;
                Ok(true)
            }
            Payload::DeviceAvailability(p) => {
                self.conn.execute(
                    "INSERT INTO device_availability
                     (sequence_id, version, sender, arrival_time, create_time, event_time,
                      role, state, id, name, reason)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)",
                    params![
                        sequence_id,
                        env.version,
                        env.sender,
                        env.arrival_time,
                        env.create_time,
                        env.event_time,
                        enum_str(&p.role),
                        enum_str(&p.state),
                        p.id,
                        p.name,
                        p.reason,
                    ],
                )?;
                Ok(true)
            }
            Payload::ScaleChange(p) => {
                self.conn.execute(
                    "INSERT INTO scale_change
                     (sequence_id, version, sender, arrival_time, create_time, event_time,
                      id, model)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
                    params![
                        sequence_id,
                        env.version,
                        env.sender,
                        env.arrival_time,
                        env.create_time,
                        env.event_time,
                        p.id,
                        p.model,
                    ],
                )?;
                Ok(true)
            }
            Payload::BlueDotUpdate(p) => {
                self.conn.execute(
                    "INSERT INTO bluedot_update
                     (sequence_id, version, sender, arrival_time, create_time, event_time,
                      temperature, high_alarm, units)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
                    params![
                        sequence_id,
                        env.version,
                        env.sender,
                        env.arrival_time,
                        env.create_time,
                        env.event_time,
                        p.temperature,
                        p.high_alarm,
                        p.units,
                    ],
                )?;
                Ok(true)
            }
            // Handle-model changes and scan results are bus-only.
            Payload::DeviceChanged(_) | Payload::ScanReport(_) => Ok(false),
        }
    }

    /// Rows in `table` attributed to `sequence_id`; test and export
    /// support.
    pub fn count_rows(&self, table: &str, sequence_id: &str) -> Result<i64> {
        if !table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(Error::bad_request(format!("bad table name '{table}'")));
        }
        let sql = format!("SELECT COUNT(*) FROM {table} WHERE sequence_id = ?1");
        Ok(self.conn.query_row(&sql, [sequence_id], |row| row.get(0))?)
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl Drop for HistoryStore {
    fn drop(&mut self) {
        if self.in_batch {
            let _ = self.conn.execute_batch("COMMIT");
        }
    }
}

/// Single-token rendering of a serde enum, for TEXT columns.
fn enum_str<T: Serialize>(value: &T) -> String {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => s,
        Ok(other) => other.to_string(),
        Err(_) => String::new(),
    }
}
