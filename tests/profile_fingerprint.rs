//! Profile identity: id follows the bytes, fingerprint follows the
//! machine program.

use de1d::profile::ProfileRegistry;
use de1d::recorder::{HistoryStore, into_shared};

fn profile_json(title: &str) -> String {
    format!(
        r#"{{
  "version": "2.0",
  "title": "{title}",
  "author": "integration",
  "target_volume": 36,
  "target_weight": 36,
  "target_volume_count_start": 1,
  "steps": [
    {{
      "pump": "pressure", "sensor": "coffee", "transition": "fast",
      "pressure": "8.6", "temperature": "92.0", "seconds": "25.0", "volume": "100"
    }},
    {{
      "pump": "flow", "sensor": "coffee", "transition": "smooth",
      "flow": "2.2", "temperature": "90.0", "seconds": "30.0", "volume": "100",
      "limiter": {{"value": "8.8", "range": "0.6"}}
    }}
  ]
}}"#
    )
}

#[test]
fn metadata_only_change_shares_fingerprint_but_not_id() {
    let dir = tempfile::tempdir().unwrap();
    let store = into_shared(
        HistoryStore::open(&dir.path().join("pyde1.sqlite3"), 1_700_000_000.0).unwrap(),
    );
    let registry = ProfileRegistry::new(store.clone());

    let s1 = profile_json("morning blend");
    let s2 = profile_json("evening blend");
    let first = registry.insert(s1.as_bytes(), 1.0).unwrap();
    let second = registry.insert(s2.as_bytes(), 2.0).unwrap();

    assert_ne!(first.profile.id, second.profile.id);
    assert_eq!(first.profile.fingerprint, second.profile.fingerprint);
    assert!(first.newly_added);
    assert!(second.newly_added);

    // Both rows are present and carry their own bytes.
    let p1 = registry.get(&first.profile.id).unwrap();
    let p2 = registry.get(&second.profile.id).unwrap();
    assert_eq!(p1.source, s1.as_bytes());
    assert_eq!(p2.source, s2.as_bytes());
    assert_eq!(p1.fingerprint, p2.fingerprint);

    // A program change moves the fingerprint.
    let s3 = profile_json("hotter").replace("92.0", "94.0");
    let third = registry.insert(s3.as_bytes(), 3.0).unwrap();
    assert_ne!(third.profile.fingerprint, first.profile.fingerprint);
}

#[test]
fn ids_and_fingerprints_are_sha1_hex() {
    let dir = tempfile::tempdir().unwrap();
    let store = into_shared(
        HistoryStore::open(&dir.path().join("pyde1.sqlite3"), 1_700_000_000.0).unwrap(),
    );
    let registry = ProfileRegistry::new(store);
    let outcome = registry
        .insert(profile_json("hex check").as_bytes(), 1.0)
        .unwrap();
    for digest in [&outcome.profile.id, &outcome.profile.fingerprint] {
        assert_eq!(digest.len(), 40);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
