//! Advertisement-name dispatch over device models.
//!
//! A device arrives generic; the first advertisement seen while
//! capturing selects the specific model by name prefix. Longest prefix
//! wins; the empty prefix is the generic fallback.

use serde::{Deserialize, Serialize};

use super::DeviceRole;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceModel {
    GenericScale,
    AtomaxSkaleII,
    DecentScale,
    FelicitaArc,
    AcaiaLunar,
    BlueDot,
}

impl DeviceModel {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceModel::GenericScale => "GenericScale",
            DeviceModel::AtomaxSkaleII => "AtomaxSkaleII",
            DeviceModel::DecentScale => "DecentScale",
            DeviceModel::FelicitaArc => "FelicitaArc",
            DeviceModel::AcaiaLunar => "AcaiaLunar",
            DeviceModel::BlueDot => "BlueDot",
        }
    }
}

pub struct ModelRegistry {
    entries: Vec<(&'static str, DeviceModel, DeviceRole)>,
}

impl ModelRegistry {
    /// The registry shipped at startup. Prefixes are those the devices
    /// actually advertise.
    pub fn standard() -> Self {
        Self {
            entries: vec![
                ("Skale", DeviceModel::AtomaxSkaleII, DeviceRole::Scale),
                ("Decent Scale", DeviceModel::DecentScale, DeviceRole::Scale),
                ("FELICITA", DeviceModel::FelicitaArc, DeviceRole::Scale),
                ("LUNAR", DeviceModel::AcaiaLunar, DeviceRole::Scale),
                ("BlueDOT", DeviceModel::BlueDot, DeviceRole::Thermometer),
            ],
        }
    }

    /// Resolve an advertised name; `None` when nothing matches and the
    /// caller should stay generic.
    pub fn classify(&self, advertised_name: &str) -> Option<(DeviceModel, DeviceRole)> {
        self.entries
            .iter()
            .filter(|(prefix, _, _)| advertised_name.starts_with(prefix))
            .max_by_key(|(prefix, _, _)| prefix.len())
            .map(|(_, model, role)| (*model, *role))
    }

    pub fn prefixes_for_role(&self, role: DeviceRole) -> Vec<&'static str> {
        self.entries
            .iter()
            .filter(|(_, _, r)| *r == role)
            .map(|(p, _, _)| *p)
            .collect()
    }
}
