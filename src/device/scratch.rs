//! Connection scratch files for crash recovery.
//!
//! BlueZ does not clean up sessions when a process dies ungracefully.
//! One file per captured address lets a startup pass (or an external
//! supervisor) force the OS to drop whatever was left behind.

use std::fs;
use std::path::{Path, PathBuf};

use crate::{Error, Result};

pub struct ScratchArea {
    directory: PathBuf,
    suffix: String,
}

impl ScratchArea {
    pub fn new(directory: impl Into<PathBuf>, suffix: &str) -> Self {
        let suffix = if suffix.starts_with('.') {
            suffix.to_string()
        } else {
            format!(".{suffix}")
        };
        Self {
            directory: directory.into(),
            suffix,
        }
    }

    fn file_for(&self, address: &str) -> Result<PathBuf> {
        let hex_only: String = address.chars().filter(|c| c.is_ascii_hexdigit()).collect();
        if hex_only.len() != 12 {
            return Err(Error::bad_request(format!(
                "hex-filtered ID '{hex_only}' from '{address}' is not 12 characters"
            )));
        }
        Ok(self.directory.join(format!("{hex_only}{}", self.suffix)))
    }

    /// Record a capture in progress; content is the address only.
    pub fn persist(&self, address: &str) -> Result<()> {
        let path = self.file_for(address)?;
        fs::write(&path, address)?;
        Ok(())
    }

    /// Clean release; missing file is fine.
    pub fn remove(&self, address: &str) -> Result<()> {
        let path = self.file_for(address)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Addresses left over from an ungraceful exit.
    pub fn leftover_addresses(&self) -> Result<Vec<String>> {
        let mut found = Vec::new();
        let entries = match fs::read_dir(&self.directory) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(found),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if path_has_suffix(&path, &self.suffix) {
                let contents = fs::read_to_string(&path)?;
                let address = contents.trim().to_string();
                if !address.is_empty() {
                    found.push(address);
                }
            }
        }
        found.sort();
        Ok(found)
    }

    /// Force-drop any leftover sessions, then remove their files.
    pub fn cleanup(&self, force_disconnect: &mut dyn FnMut(&str)) -> Result<usize> {
        let leftovers = self.leftover_addresses()?;
        let count = leftovers.len();
        for address in leftovers {
            tracing::warn!("dropping stale Bluetooth session for {address}");
            force_disconnect(&address);
            self.remove(&address)?;
        }
        Ok(count)
    }
}

fn path_has_suffix(path: &Path, suffix: &str) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.ends_with(suffix))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persist_and_remove_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let area = ScratchArea::new(dir.path(), ".btid");
        area.persist("D9:B2:48:AA:BB:CC").unwrap();
        assert_eq!(area.leftover_addresses().unwrap(), vec!["D9:B2:48:AA:BB:CC"]);
        area.remove("D9:B2:48:AA:BB:CC").unwrap();
        assert!(area.leftover_addresses().unwrap().is_empty());
        // Removing again is fine.
        area.remove("D9:B2:48:AA:BB:CC").unwrap();
    }

    #[test]
    fn rejects_malformed_addresses() {
        let dir = tempfile::tempdir().unwrap();
        let area = ScratchArea::new(dir.path(), "btid");
        assert!(area.persist("not-an-address").is_err());
    }

    #[test]
    fn cleanup_forces_and_removes() {
        let dir = tempfile::tempdir().unwrap();
        let area = ScratchArea::new(dir.path(), ".btid");
        area.persist("D9:B2:48:AA:BB:CC").unwrap();
        area.persist("11:22:33:44:55:66").unwrap();
        let mut dropped = Vec::new();
        let count = area
            .cleanup(&mut |addr| dropped.push(addr.to_string()))
            .unwrap();
        assert_eq!(count, 2);
        assert_eq!(dropped.len(), 2);
        assert!(area.leftover_addresses().unwrap().is_empty());
    }
}
