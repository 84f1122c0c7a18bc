//! Store schema upgrades: backup first, then stepwise to the current
//! generation.

use rusqlite::Connection;

use de1d::recorder::{CURRENT_USER_VERSION, HistoryStore, schema_v1_for_tests};

fn table_exists(conn: &Connection, table: &str) -> bool {
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
            [table],
            |row| row.get(0),
        )
        .unwrap();
    count == 1
}

#[test]
fn version_1_store_upgrades_to_3_with_backup() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("pyde1.sqlite3");

    // Build a generation-1 store the way an old daemon would have left
    // it.
    {
        let conn = Connection::open(&db_path).unwrap();
        conn.execute_batch(schema_v1_for_tests()).unwrap();
        conn.execute_batch("PRAGMA user_version = 1").unwrap();
        conn.execute(
            "INSERT INTO persist_hkv (header, key, value)
             VALUES ('last_profile', 'id', 'cafe1234')",
            [],
        )
        .unwrap();
    }

    // 2023-11-14 22:13:20 UTC.
    let store = HistoryStore::open(&db_path, 1_700_000_000.0).unwrap();

    let version: i64 = store
        .connection()
        .query_row("PRAGMA user_version", [], |row| row.get(0))
        .unwrap();
    assert_eq!(version, CURRENT_USER_VERSION);

    for table in ["device_availability", "scale_change", "bluedot_update"] {
        assert!(table_exists(store.connection(), table), "missing {table}");
    }

    // Existing data survived the upgrade.
    assert_eq!(store.last_profile_id().unwrap(), Some("cafe1234".into()));

    // A timestamped file-copy backup appeared beside the store.
    let backup = dir.path().join("pyde1.sqlite3.20231114_2213");
    assert!(backup.exists(), "expected backup at {}", backup.display());
    let backup_version: i64 = Connection::open(&backup)
        .unwrap()
        .query_row("PRAGMA user_version", [], |row| row.get(0))
        .unwrap();
    assert_eq!(backup_version, 1);
}

#[test]
fn version_2_store_takes_only_the_last_step() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("pyde1.sqlite3");
    {
        let conn = Connection::open(&db_path).unwrap();
        conn.execute_batch(schema_v1_for_tests()).unwrap();
        conn.execute_batch(
            "CREATE TABLE device_availability (sequence_id TEXT NOT NULL);
             CREATE TABLE scale_change (sequence_id TEXT NOT NULL);
             PRAGMA user_version = 2;",
        )
        .unwrap();
    }
    let store = HistoryStore::open(&db_path, 1_700_000_000.0).unwrap();
    assert!(table_exists(store.connection(), "bluedot_update"));
}

#[test]
fn future_store_refuses_to_open() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("pyde1.sqlite3");
    {
        let conn = Connection::open(&db_path).unwrap();
        conn.execute_batch("PRAGMA user_version = 9").unwrap();
    }
    let err = HistoryStore::open(&db_path, 1_700_000_000.0).unwrap_err();
    assert_eq!(err.code(), "fatal");
}

#[test]
fn fresh_store_needs_no_backup() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("pyde1.sqlite3");
    let _store = HistoryStore::open(&db_path, 1_700_000_000.0).unwrap();
    let leftovers: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| {
            let name = e.file_name();
            let name = name.to_string_lossy();
            name.starts_with("pyde1.sqlite3.") && !name.ends_with("-wal") && !name.ends_with("-shm")
        })
        .collect();
    assert!(leftovers.is_empty());
}
