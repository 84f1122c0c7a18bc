//! Typed request/response surface the inbound worker drives over IPC.
//!
//! The HTTP server itself lives in a worker process; the core side is
//! this dispatcher. Errors carry fixed status semantics (see
//! `Error::http_status`) so the worker can answer without inspecting
//! messages.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::device::DeviceRole;
use crate::sequencer::MachineState;
use crate::{Error, Result};

pub const MAPPING_VERSION: &str = "4.1.0";
pub const RESOURCE_VERSION: &str = "3.0.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verb {
    Get,
    Put,
    Patch,
}

/// A dispatchable resource. `parse` accepts the path form used on the
/// wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resource {
    Version,
    De1State,
    De1Mode,
    De1FeatureFlags,
    De1Availability,
    ScaleAvailability,
    Scan,
    De1Control(MachineState),
    De1Profile,
    De1ProfileId,
    Logs,
    Log(String),
}

impl Resource {
    pub fn parse(path: &str) -> Option<Resource> {
        let path = path.trim_matches('/');
        match path {
            "version" => Some(Resource::Version),
            "de1/state" => Some(Resource::De1State),
            "de1/mode" => Some(Resource::De1Mode),
            "de1/feature_flags" => Some(Resource::De1FeatureFlags),
            "de1/availability" => Some(Resource::De1Availability),
            "scale/availability" => Some(Resource::ScaleAvailability),
            "scan" => Some(Resource::Scan),
            "de1/control/espresso" => Some(Resource::De1Control(MachineState::Espresso)),
            "de1/control/steam" => Some(Resource::De1Control(MachineState::Steam)),
            "de1/control/hot_water" => Some(Resource::De1Control(MachineState::HotWater)),
            "de1/control/hot_water_rinse" => {
                Some(Resource::De1Control(MachineState::HotWaterRinse))
            }
            "de1/profile" => Some(Resource::De1Profile),
            "de1/profile/id" => Some(Resource::De1ProfileId),
            "logs" => Some(Resource::Logs),
            other => other
                .strip_prefix("log/")
                .filter(|id| !id.is_empty())
                .map(|id| Resource::Log(id.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiRequest {
    pub verb: Verb,
    pub resource: String,
    #[serde(default)]
    pub body: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
}

impl ApiResponse {
    pub fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }

    pub fn from_error(err: &Error) -> Self {
        Self {
            status: err.http_status(),
            body: json!({
                "error": err.code(),
                "message": err.to_string(),
            }),
        }
    }
}

/// One entry of a PATCH result array.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetterResult {
    pub setting: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

impl SetterResult {
    pub fn ok(setting: &str) -> Self {
        Self {
            setting: setting.to_string(),
            ok: true,
            error: None,
        }
    }

    pub fn failed(setting: &str, error: impl Into<String>) -> Self {
        Self {
            setting: setting.to_string(),
            ok: false,
            error: Some(error.into()),
        }
    }
}

/// What the core exposes to the request surface.
pub trait ApiBackend {
    fn version(&self) -> Value;
    fn de1_state(&self) -> Result<Value>;
    fn de1_feature_flags(&self) -> Result<Value>;
    fn request_mode(&mut self, mode: MachineState) -> Result<()>;
    fn patch_availability(&mut self, role: DeviceRole, body: &Value)
    -> Result<Vec<SetterResult>>;
    fn begin_scan(&mut self, body: &Value) -> Result<Vec<SetterResult>>;
    fn get_control(&self, mode: MachineState) -> Result<Value>;
    fn patch_control(&mut self, mode: MachineState, body: &Value) -> Result<Vec<SetterResult>>;
    fn put_profile(&mut self, source: &[u8]) -> Result<Vec<SetterResult>>;
    fn put_profile_by_id(&mut self, id: &str) -> Result<Vec<SetterResult>>;
    fn list_logs(&self) -> Result<Value>;
    fn get_log(&self, id: &str) -> Result<Value>;
}

pub fn dispatch(backend: &mut dyn ApiBackend, req: &ApiRequest) -> ApiResponse {
    match dispatch_inner(backend, req) {
        Ok(body) => ApiResponse::ok(body),
        Err(e) => ApiResponse::from_error(&e),
    }
}

fn dispatch_inner(backend: &mut dyn ApiBackend, req: &ApiRequest) -> Result<Value> {
    let Some(resource) = Resource::parse(&req.resource) else {
        return Err(Error::bad_request(format!(
            "no such resource '{}'",
            req.resource
        )));
    };

    match (req.verb, resource) {
        (Verb::Get, Resource::Version) => Ok(backend.version()),
        (Verb::Get, Resource::De1State) => backend.de1_state(),
        (Verb::Get, Resource::De1FeatureFlags) => backend.de1_feature_flags(),
        (Verb::Patch, Resource::De1Mode) => {
            let mode = req
                .body
                .get("mode")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::bad_request("mode must be a string"))?;
            let mode = parse_mode(mode)?;
            backend.request_mode(mode)?;
            Ok(json!([SetterResult::ok("mode")]))
        }
        (Verb::Patch, Resource::De1Availability) => {
            let results = backend.patch_availability(DeviceRole::De1, &req.body)?;
            Ok(serde_json::to_value(results).unwrap_or_default())
        }
        (Verb::Patch, Resource::ScaleAvailability) => {
            let results = backend.patch_availability(DeviceRole::Scale, &req.body)?;
            Ok(serde_json::to_value(results).unwrap_or_default())
        }
        (Verb::Patch, Resource::Scan) => {
            let results = backend.begin_scan(&req.body)?;
            Ok(serde_json::to_value(results).unwrap_or_default())
        }
        (Verb::Get, Resource::De1Control(mode)) => backend.get_control(mode),
        (Verb::Patch, Resource::De1Control(mode)) => {
            let results = backend.patch_control(mode, &req.body)?;
            Ok(serde_json::to_value(results).unwrap_or_default())
        }
        (Verb::Put, Resource::De1Profile) => {
            // Profile source arrives verbatim, either as a JSON string
            // or as the JSON document itself.
            let source = match &req.body {
                Value::String(s) => s.clone().into_bytes(),
                other => serde_json::to_vec(other)
                    .map_err(|e| Error::bad_request(format!("unreadable profile body: {e}")))?,
            };
            let results = backend.put_profile(&source)?;
            Ok(serde_json::to_value(results).unwrap_or_default())
        }
        (Verb::Put, Resource::De1ProfileId) => {
            let id = req
                .body
                .get("id")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::bad_request("id must be a string"))?;
            let results = backend.put_profile_by_id(id)?;
            Ok(serde_json::to_value(results).unwrap_or_default())
        }
        (Verb::Get, Resource::Logs) => backend.list_logs(),
        (Verb::Get, Resource::Log(id)) => backend.get_log(&id),
        (verb, _) => Err(Error::MethodNotSupported {
            reason: format!("{verb:?} on {}", req.resource),
        }),
    }
}

fn parse_mode(mode: &str) -> Result<MachineState> {
    serde_json::from_value(Value::String(mode.to_string()))
        .map_err(|_| Error::bad_request(format!("unrecognized mode '{mode}'")))
}
