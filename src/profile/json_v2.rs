//! Parser for version-2 JSON profiles.
//!
//! Values are carried through unrounded so the stored source and the
//! fingerprint both reflect exactly what was uploaded.

use serde_json::Value;

use super::frames::{
    MAX_FRAMES, ShotDescHeader, ShotExtFrame, ShotFrame, ShotTail, frame_flags,
};
use super::FrameProfile;
use crate::{Error, Result};

const HEADER_V: u8 = 1;
const MINIMUM_PRESSURE_DEFAULT: f64 = 0.0;
const MAXIMUM_FLOW_DEFAULT: f64 = 10.0;
const IGNORE_LIMIT_DEFAULT: bool = true;
const IGNORE_PI_DEFAULT: bool = true;

pub fn parse(source: &[u8]) -> Result<FrameProfile> {
    let json: Value = serde_json::from_slice(source)
        .map_err(|e| validation(format!("profile is not valid JSON: {e}")))?;

    let version = json
        .get("version")
        .map(value_as_string)
        .ok_or_else(|| validation("only version 2 profiles are recognized, no version found"))?;
    if version.split('.').next() != Some("2") {
        return Err(validation(format!(
            "only version 2 profiles are recognized, not '{version}'"
        )));
    }

    let steps = json
        .get("steps")
        .and_then(Value::as_array)
        .ok_or_else(|| validation("profile has no steps"))?;
    if steps.is_empty() || steps.len() > MAX_FRAMES {
        return Err(validation(format!(
            "profile must have 1 to {MAX_FRAMES} steps, has {}",
            steps.len()
        )));
    }

    let mut frames = Vec::with_capacity(steps.len());
    let mut ext_frames: Vec<Option<ShotExtFrame>> = Vec::with_capacity(steps.len());
    let mut move_on_weight = Vec::new();

    for step in steps {
        let mut flag = 0u8;

        let pump = require_str(step, "pump")?;
        match pump {
            "flow" => flag |= frame_flags::CTRL_F,
            "pressure" => {}
            other => return Err(validation(format!("unrecognized pump: {other}"))),
        }

        if let Some(exit) = step.get("exit") {
            flag |= frame_flags::DO_COMPARE;
            match require_str(exit, "condition")? {
                "over" => flag |= frame_flags::DC_GT,
                "under" => {}
                other => return Err(validation(format!("unrecognized exit condition: {other}"))),
            }
            match require_str(exit, "type")? {
                "flow" => flag |= frame_flags::DC_COMP_F,
                "pressure" => {}
                other => return Err(validation(format!("unrecognized exit type: {other}"))),
            }
        }

        match require_str(step, "sensor")? {
            "water" => flag |= frame_flags::T_MIX_TEMP,
            "coffee" => {}
            other => return Err(validation(format!("unrecognized sensor: {other}"))),
        }

        match require_str(step, "transition")? {
            "smooth" => flag |= frame_flags::INTERPOLATE,
            "fast" => {}
            other => return Err(validation(format!("unrecognized transition: {other}"))),
        }

        if IGNORE_LIMIT_DEFAULT {
            flag |= frame_flags::IGNORE_LIMIT;
        }

        let set_val = if pump == "pressure" {
            require_f64(step, "pressure")?
        } else {
            require_f64(step, "flow")?
        };
        let trigger_val = if flag & frame_flags::DO_COMPARE != 0 {
            step.get("exit")
                .map(|e| require_f64(e, "value"))
                .transpose()?
                .unwrap_or(0.0)
        } else {
            0.0
        };

        move_on_weight.push(optional_f64(step, "weight")?);

        frames.push(ShotFrame {
            flag,
            set_val,
            temp: require_f64(step, "temperature")?,
            frame_len: require_f64(step, "seconds")?,
            trigger_val,
            max_vol: require_f64(step, "volume")?,
        });

        let limiter = step
            .get("limiter")
            .map(|l| -> Result<Option<ShotExtFrame>> {
                let value = require_f64(l, "value")?;
                if (value * 100.0).round() > 0.0 {
                    Ok(Some(ShotExtFrame {
                        max_flow_or_pressure: value,
                        max_fop_range: require_f64(l, "range")?,
                    }))
                } else {
                    Ok(None)
                }
            })
            .transpose()?
            .flatten();
        ext_frames.push(limiter);
    }

    while move_on_weight.last() == Some(&None) {
        move_on_weight.pop();
    }

    let target_volume = require_f64(&json, "target_volume")?;
    let preinfuse_frames = require_f64(&json, "target_volume_count_start")?.round() as u8;

    let header = ShotDescHeader {
        header_v: HEADER_V,
        number_of_frames: frames.len() as u8,
        number_of_preinfuse_frames: preinfuse_frames,
        minimum_pressure: MINIMUM_PRESSURE_DEFAULT,
        maximum_flow: MAXIMUM_FLOW_DEFAULT,
    };
    let tail = ShotTail {
        max_total_volume: target_volume.round() as u16,
        ignore_pi: IGNORE_PI_DEFAULT,
    };

    Ok(FrameProfile {
        header,
        frames,
        ext_frames,
        tail,
        tank_temperature: optional_f64(&json, "tank_temperature")?,
        target_weight: optional_f64(&json, "target_weight")?,
        target_volume: Some(target_volume),
        number_of_preinfuse_frames: Some(preinfuse_frames),
        title: optional_string(&json, "title"),
        author: optional_string(&json, "author"),
        notes: optional_string(&json, "notes"),
        beverage_type: optional_string(&json, "beverage_type"),
        move_on_weight,
    })
}

fn validation(reason: impl Into<String>) -> Error {
    Error::ProfileValidation {
        reason: reason.into(),
    }
}

fn value_as_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn require_str<'a>(obj: &'a Value, key: &str) -> Result<&'a str> {
    obj.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| validation(format!("missing or non-string '{key}'")))
}

fn require_f64(obj: &Value, key: &str) -> Result<f64> {
    let v = obj
        .get(key)
        .ok_or_else(|| validation(format!("missing '{key}'")))?;
    numeric(v).ok_or_else(|| validation(format!("non-numeric '{key}'")))
}

fn optional_f64(obj: &Value, key: &str) -> Result<Option<f64>> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => numeric(v)
            .map(Some)
            .ok_or_else(|| validation(format!("non-numeric '{key}'"))),
    }
}

// Profiles in the wild carry numbers as both JSON numbers and strings.
fn numeric(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn optional_string(obj: &Value, key: &str) -> Option<String> {
    obj.get(key).and_then(Value::as_str).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn minimal_profile_json(title: &str) -> String {
        format!(
            r#"{{
  "version": "2.0",
  "title": "{title}",
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
      "exit": {{"condition": "over", "type": "pressure", "value": "9.0"}},
      "limiter": {{"value": "8.8", "range": "0.6"}}
    }}
  ]
}}"#
        )
    }

    #[test]
    fn parses_a_two_step_profile() {
        let p = parse(minimal_profile_json("test").as_bytes()).unwrap();
        assert_eq!(p.frames.len(), 2);
        assert_eq!(p.header.number_of_frames, 2);
        assert_eq!(p.header.number_of_preinfuse_frames, 1);
        assert_eq!(p.tail.max_total_volume, 36);
        assert_eq!(p.target_weight, Some(36.0));
        assert_eq!(p.title.as_deref(), Some("test"));

        let first = &p.frames[0];
        assert_eq!(first.flag & frame_flags::CTRL_F, 0); // pressure frame
        assert_eq!(first.set_val, 8.6);

        let second = &p.frames[1];
        assert_ne!(second.flag & frame_flags::CTRL_F, 0);
        assert_ne!(second.flag & frame_flags::DO_COMPARE, 0);
        assert_ne!(second.flag & frame_flags::DC_GT, 0);
        assert_eq!(second.trigger_val, 9.0);
        assert!(p.ext_frames[0].is_none());
        assert!(p.ext_frames[1].is_some());
    }

    #[test]
    fn rejects_version_1() {
        let err = parse(br#"{"version": "1.0", "steps": []}"#).unwrap_err();
        assert_eq!(err.code(), "profile_validation");
    }

    #[test]
    fn rejects_unknown_pump() {
        let json = minimal_profile_json("x").replace("\"pump\": \"pressure\"", "\"pump\": \"jet\"");
        assert!(parse(json.as_bytes()).is_err());
    }
}
