//! Profiles: frame encoding, parsing, identity, and the registry.
//!
//! A profile has two hashes. `id` is over the source bytes exactly as
//! uploaded; `fingerprint` is over the machine program those bytes
//! generate. Profiles that differ only in metadata share a fingerprint
//! but never an id.

pub mod frames;
mod json_v2;
mod registry;

pub use frames::{ShotDescHeader, ShotExtFrame, ShotFrame, ShotTail};
pub use registry::ProfileRegistry;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceFormat {
    #[serde(rename = "JSONv2")]
    JsonV2,
}

impl SourceFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceFormat::JsonV2 => "JSONv2",
        }
    }
}

/// The decoded machine program plus the operational and descriptive
/// extras a v2 profile carries.
#[derive(Debug, Clone)]
pub struct FrameProfile {
    pub header: ShotDescHeader,
    pub frames: Vec<ShotFrame>,
    /// Indexed alongside `frames`; `None` where a step has no limiter.
    pub ext_frames: Vec<Option<ShotExtFrame>>,
    pub tail: ShotTail,
    pub tank_temperature: Option<f64>,
    pub target_weight: Option<f64>,
    pub target_volume: Option<f64>,
    pub number_of_preinfuse_frames: Option<u8>,
    pub title: Option<String>,
    pub author: Option<String>,
    pub notes: Option<String>,
    pub beverage_type: Option<String>,
    pub move_on_weight: Vec<Option<f64>>,
}

impl FrameProfile {
    pub fn parse(source: &[u8]) -> Result<Self> {
        json_v2::parse(source)
    }

    /// Hash over the canonical program byte sequence: header, frames by
    /// ascending index, extension frames by ascending index as produced,
    /// tail. Metadata and external parameters are excluded.
    pub fn fingerprint(&self) -> Result<String> {
        let mut hasher = Sha1::new();
        hasher.update(self.header.as_wire_bytes()?);
        for frame in &self.frames {
            hasher.update(frame.as_wire_bytes()?);
        }
        for ext in self.ext_frames.iter().flatten() {
            hasher.update(ext.as_wire_bytes()?);
        }
        hasher.update(self.tail.as_wire_bytes()?);
        Ok(hex::encode(hasher.finalize()))
    }
}

/// A stored profile: content-addressed source plus its program
/// fingerprint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    #[serde(skip)]
    pub source: Vec<u8>,
    pub source_format: SourceFormat,
    pub fingerprint: String,
    pub date_added: f64,
    pub title: Option<String>,
    pub author: Option<String>,
    pub notes: Option<String>,
    pub beverage_type: Option<String>,
}

impl Profile {
    /// Parse, hash, and fingerprint source bytes.
    pub fn from_source(source: &[u8], date_added: f64) -> Result<(Profile, FrameProfile)> {
        let decoded = FrameProfile::parse(source)?;
        let fingerprint = decoded.fingerprint()?;
        let profile = Profile {
            id: source_id(source),
            source: source.to_vec(),
            source_format: SourceFormat::JsonV2,
            fingerprint,
            date_added,
            title: decoded.title.clone(),
            author: decoded.author.clone(),
            notes: decoded.notes.clone(),
            beverage_type: decoded.beverage_type.clone(),
        };
        Ok((profile, decoded))
    }
}

/// Content address of the source bytes.
pub fn source_id(source: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(source);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile_json(title: &str) -> String {
        format!(
            r#"{{"version": "2.0", "title": "{title}",
"target_volume": 36, "target_volume_count_start": 1,
"steps": [{{"pump": "pressure", "sensor": "coffee", "transition": "fast",
"pressure": "8.6", "temperature": "92.0", "seconds": "25.0", "volume": "100"}}]}}"#
        )
    }

    #[test]
    fn id_is_over_source_bytes() {
        let a = profile_json("one");
        assert_eq!(source_id(a.as_bytes()).len(), 40);
        assert_eq!(source_id(a.as_bytes()), source_id(a.as_bytes()));
        assert_ne!(
            source_id(a.as_bytes()),
            source_id(profile_json("two").as_bytes())
        );
    }

    #[test]
    fn metadata_does_not_change_the_fingerprint() {
        let (p1, _) = Profile::from_source(profile_json("morning").as_bytes(), 0.0).unwrap();
        let (p2, _) = Profile::from_source(profile_json("evening").as_bytes(), 0.0).unwrap();
        assert_ne!(p1.id, p2.id);
        assert_eq!(p1.fingerprint, p2.fingerprint);
    }

    #[test]
    fn program_changes_change_the_fingerprint() {
        let base = profile_json("x");
        let hotter = base.replace("92.0", "94.0");
        let (p1, _) = Profile::from_source(base.as_bytes(), 0.0).unwrap();
        let (p2, _) = Profile::from_source(hotter.as_bytes(), 0.0).unwrap();
        assert_ne!(p1.fingerprint, p2.fingerprint);
    }

    #[test]
    fn fingerprint_covers_extension_frames() {
        let without = profile_json("x");
        let with = without.replace(
            r#""volume": "100"}"#,
            r#""volume": "100", "limiter": {"value": "8.8", "range": "0.6"}}"#,
        );
        let (p1, _) = Profile::from_source(without.as_bytes(), 0.0).unwrap();
        let (p2, _) = Profile::from_source(with.as_bytes(), 0.0).unwrap();
        assert_ne!(p1.fingerprint, p2.fingerprint);
    }
}
