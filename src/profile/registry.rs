//! Content-addressed profile registry over the history store.

use crate::recorder::store::SharedStore;
use crate::{Error, Result};

use super::{FrameProfile, Profile};

pub struct InsertOutcome {
    pub profile: Profile,
    pub decoded: FrameProfile,
    pub newly_added: bool,
}

pub struct ProfileRegistry {
    store: SharedStore,
}

impl ProfileRegistry {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    /// Parse, fingerprint, and store source bytes. Duplicate-safe:
    /// re-uploading identical bytes touches nothing but
    /// `last_uploaded`.
    pub fn insert(&self, source: &[u8], when: f64) -> Result<InsertOutcome> {
        let (profile, decoded) = Profile::from_source(source, when)?;
        let mut store = self.lock();
        let newly_added = store.insert_profile(&profile)?;
        store.set_last_profile(&profile.id, when)?;
        Ok(InsertOutcome {
            profile,
            decoded,
            newly_added,
        })
    }

    pub fn get(&self, id: &str) -> Result<Profile> {
        self.lock()
            .get_profile(id)?
            .ok_or_else(|| Error::bad_request(format!("no profile with id {id}")))
    }

    /// Id of the most recently uploaded profile, surviving restarts.
    pub fn last_uploaded(&self) -> Result<Option<String>> {
        self.lock().last_profile_id()
    }

    pub fn touch_last_uploaded(&self, id: &str, when: f64) -> Result<()> {
        self.lock().set_last_profile(id, when)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, crate::recorder::HistoryStore> {
        self.store.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::store::into_shared;
    use crate::recorder::HistoryStore;

    fn registry() -> (ProfileRegistry, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store =
            HistoryStore::open(&dir.path().join("pyde1.sqlite3"), 1_700_000_000.0).unwrap();
        (ProfileRegistry::new(into_shared(store)), dir)
    }

    fn profile_json(title: &str) -> String {
        format!(
            r#"{{"version": "2.0", "title": "{title}",
"target_volume": 36, "target_volume_count_start": 1,
"steps": [{{"pump": "pressure", "sensor": "coffee", "transition": "fast",
"pressure": "8.6", "temperature": "92.0", "seconds": "25.0", "volume": "100"}}]}}"#
        )
    }

    #[test]
    fn insert_retrieves_identical_bytes() {
        let (reg, _dir) = registry();
        let source = profile_json("roundtrip");
        let outcome = reg.insert(source.as_bytes(), 10.0).unwrap();
        assert!(outcome.newly_added);
        let back = reg.get(&outcome.profile.id).unwrap();
        assert_eq!(back.source, source.as_bytes());
    }

    #[test]
    fn last_uploaded_tracks_inserts() {
        let (reg, _dir) = registry();
        assert_eq!(reg.last_uploaded().unwrap(), None);
        let first = reg.insert(profile_json("a").as_bytes(), 1.0).unwrap();
        let second = reg.insert(profile_json("b").as_bytes(), 2.0).unwrap();
        assert_ne!(first.profile.id, second.profile.id);
        assert_eq!(reg.last_uploaded().unwrap(), Some(second.profile.id));
    }

    #[test]
    fn duplicate_upload_is_safe() {
        let (reg, _dir) = registry();
        let source = profile_json("same");
        let first = reg.insert(source.as_bytes(), 1.0).unwrap();
        let again = reg.insert(source.as_bytes(), 2.0).unwrap();
        assert!(first.newly_added);
        assert!(!again.newly_added);
        assert_eq!(first.profile.id, again.profile.id);
    }
}
