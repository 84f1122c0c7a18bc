//! Export of a closed sequence to the legacy shot-file format.
//!
//! A side path for external plotting tools, not part of the capture
//! pipeline. The format is line-oriented: `name {value ...}` with
//! series as whitespace-separated lists in elapsed-seconds order.

use std::fmt::Write as _;

use rusqlite::Connection;

use crate::{Error, Result};

struct SampleRow {
    elapsed: f64,
    pressure: f64,
    flow: f64,
}

struct WeightRow {
    elapsed: f64,
    weight: f64,
    flow: f64,
}

/// Render one sequence. Refuses sequences that have not closed.
pub fn export_shot_file(conn: &Connection, sequence_id: &str) -> Result<String> {
    let (start, end): (f64, Option<f64>) = conn
        .query_row(
            "SELECT start_sequence, end_sequence FROM sequence WHERE id = ?1",
            [sequence_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .map_err(|_| Error::bad_request(format!("no sequence {sequence_id}")))?;
    if end.is_none() {
        return Err(Error::IncompleteSequenceRecord {
            sequence_id: sequence_id.to_string(),
        });
    }

    let mut samples = Vec::new();
    let mut stmt = conn.prepare(
        "SELECT arrival_time, group_pressure, group_flow
         FROM shot_sample_with_volume_update
         WHERE sequence_id = ?1 ORDER BY arrival_time",
    )?;
    let mut rows = stmt.query([sequence_id])?;
    while let Some(row) = rows.next()? {
        let t: f64 = row.get(0)?;
        samples.push(SampleRow {
            elapsed: t - start,
            pressure: row.get(1)?,
            flow: row.get(2)?,
        });
    }

    let mut weights = Vec::new();
    let mut stmt = conn.prepare(
        "SELECT arrival_time, current_weight, average_flow
         FROM weight_and_flow_update
         WHERE sequence_id = ?1 ORDER BY arrival_time",
    )?;
    let mut rows = stmt.query([sequence_id])?;
    while let Some(row) = rows.next()? {
        let t: f64 = row.get(0)?;
        weights.push(WeightRow {
            elapsed: t - start,
            weight: row.get(1)?,
            flow: row.get(2)?,
        });
    }

    let profile_title: Option<String> = conn
        .query_row(
            "SELECT p.title FROM sequence s JOIN profile p ON p.id = s.profile_id
             WHERE s.id = ?1",
            [sequence_id],
            |row| row.get(0),
        )
        .unwrap_or(None);

    let mut out = String::new();
    let _ = writeln!(out, "clock {}", start as i64);
    let _ = writeln!(out, "sequence_id {{{sequence_id}}}");
    write_series(&mut out, "espresso_elapsed", samples.iter().map(|s| s.elapsed));
    write_series(
        &mut out,
        "espresso_pressure",
        samples.iter().map(|s| s.pressure),
    );
    write_series(&mut out, "espresso_flow", samples.iter().map(|s| s.flow));
    write_series(
        &mut out,
        "espresso_flow_weight",
        weights.iter().map(|w| w.flow),
    );
    write_series(
        &mut out,
        "espresso_weight_elapsed",
        weights.iter().map(|w| w.elapsed),
    );
    write_series(&mut out, "espresso_weight", weights.iter().map(|w| w.weight));
    let _ = writeln!(
        out,
        "settings {{\n  profile_title {{{}}}\n}}",
        profile_title.unwrap_or_default()
    );
    Ok(out)
}

fn write_series(out: &mut String, name: &str, values: impl Iterator<Item = f64>) {
    let rendered: Vec<String> = values.map(|v| format!("{v:.2}")).collect();
    let _ = writeln!(out, "{name} {{{}}}", rendered.join(" "));
}
