//! On-wire frame encoding for the DE1 shot program.
//!
//! Field packings follow the machine's fixed-point conventions: U8P4
//! (sixteenths), U8P1 (halves), F8_1_7 (tenths below 12.75 s, whole
//! seconds above), U10P0 volumes.

use crate::{Error, Result};

pub const MAX_FRAMES: usize = 20;
/// Extension frames address their base frame at this offset.
pub const EXT_FRAME_OFFSET: u8 = 32;

pub mod frame_flags {
    pub const CTRL_F: u8 = 0x01;
    pub const DO_COMPARE: u8 = 0x02;
    pub const DC_GT: u8 = 0x04;
    pub const DC_COMP_F: u8 = 0x08;
    pub const T_MIX_TEMP: u8 = 0x10;
    pub const INTERPOLATE: u8 = 0x20;
    pub const IGNORE_LIMIT: u8 = 0x40;
}

#[derive(Debug, Clone, PartialEq)]
pub struct ShotDescHeader {
    pub header_v: u8,
    pub number_of_frames: u8,
    pub number_of_preinfuse_frames: u8,
    pub minimum_pressure: f64,
    pub maximum_flow: f64,
}

impl ShotDescHeader {
    pub fn as_wire_bytes(&self) -> Result<[u8; 5]> {
        if self.header_v != 1 {
            return Err(Error::ProfileValidation {
                reason: format!("HeaderV must be 1, not {}", self.header_v),
            });
        }
        Ok([
            self.header_v,
            self.number_of_frames,
            self.number_of_preinfuse_frames,
            p4(self.minimum_pressure)?,
            p4(self.maximum_flow)?,
        ])
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ShotFrame {
    pub flag: u8,
    pub set_val: f64,
    pub temp: f64,
    pub frame_len: f64,
    pub trigger_val: f64,
    pub max_vol: f64,
}

impl ShotFrame {
    pub fn as_wire_bytes(&self) -> Result<[u8; 7]> {
        let max_vol = p0_u10(self.max_vol)?;
        Ok([
            self.flag,
            p4(self.set_val)?,
            p1(self.temp)?,
            f8_1_7(self.frame_len)?,
            p4(self.trigger_val)?,
            (max_vol >> 8) as u8,
            (max_vol & 0xff) as u8,
        ])
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ShotExtFrame {
    pub max_flow_or_pressure: f64,
    pub max_fop_range: f64,
}

impl ShotExtFrame {
    pub fn as_wire_bytes(&self) -> Result<[u8; 7]> {
        Ok([
            p4(self.max_flow_or_pressure)?,
            p4(self.max_fop_range)?,
            0,
            0,
            0,
            0,
            0,
        ])
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ShotTail {
    pub max_total_volume: u16,
    pub ignore_pi: bool,
}

impl ShotTail {
    pub fn as_wire_bytes(&self) -> Result<[u8; 7]> {
        if self.max_total_volume > 0x03ff {
            return Err(Error::ProfileValidation {
                reason: format!("MaxTotalVolume out of range ({})", self.max_total_volume),
            });
        }
        let mut value = self.max_total_volume;
        if self.ignore_pi {
            value |= 0x8000;
        }
        let le = value.to_le_bytes();
        Ok([le[0], le[1], 0, 0, 0, 0, 0])
    }
}

fn scale_check(value: f64, bits: u32, fractional_bits: i32, what: &str) -> Result<u32> {
    let scaled = (value * f64::powi(2.0, fractional_bits)).round();
    if !(scaled >= 0.0 && scaled <= (f64::powi(2.0, bits as i32) - 1.0)) {
        return Err(Error::ProfileValidation {
            reason: format!("{value} out of range for {what}"),
        });
    }
    Ok(scaled as u32)
}

/// U8P4: unsigned, four fractional bits.
fn p4(value: f64) -> Result<u8> {
    Ok(scale_check(value, 8, 4, "U8P4")? as u8)
}

/// U8P1: unsigned, one fractional bit.
fn p1(value: f64) -> Result<u8> {
    Ok(scale_check(value, 8, 1, "U8P1")? as u8)
}

/// U10P0 volume in a u16 field.
fn p0_u10(value: f64) -> Result<u16> {
    Ok(scale_check(value, 10, 0, "U10P0")? as u16)
}

/// F8_1_7: tenths of a second below 12.75 s, whole seconds (high bit
/// set) up to 127.5 s.
pub fn f8_1_7(value: f64) -> Result<u8> {
    if value < 0.0 {
        Err(Error::ProfileValidation {
            reason: format!("{value} out of range for F8_1_7"),
        })
    } else if value < 12.75 {
        Ok((value * 10.0).round() as u8)
    } else if value < 127.5 {
        Ok((value.round() as u8) | 0x80)
    } else {
        Err(Error::ProfileValidation {
            reason: format!("{value} out of range for F8_1_7"),
        })
    }
}

pub fn f8_1_7_decode(value: u8) -> f64 {
    let mantissa = (value & 0x7f) as f64;
    if value & 0x80 != 0 {
        mantissa
    } else {
        mantissa * 0.1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_packs_to_five_bytes() {
        let header = ShotDescHeader {
            header_v: 1,
            number_of_frames: 5,
            number_of_preinfuse_frames: 1,
            minimum_pressure: 0.0,
            maximum_flow: 10.0,
        };
        assert_eq!(header.as_wire_bytes().unwrap(), [1, 5, 1, 0, 160]);
    }

    #[test]
    fn frame_packs_like_the_machine_expects() {
        // Mirrors a frame observed on the wire: flags CtrlF|DC_GT|
        // IgnoreLimit, 5.0 set, 93.5 C, 20 s, 4.0 trigger.
        let frame = ShotFrame {
            flag: 0x47,
            set_val: 5.0,
            temp: 93.5,
            frame_len: 20.0,
            trigger_val: 4.0,
            max_vol: 100.0,
        };
        assert_eq!(
            frame.as_wire_bytes().unwrap(),
            [0x47, 0x50, 0xbb, 0x94, 0x40, 0x00, 0x64]
        );
    }

    #[test]
    fn f8_1_7_boundary() {
        assert_eq!(f8_1_7(0.0).unwrap(), 0);
        assert_eq!(f8_1_7(2.0).unwrap(), 20);
        assert_eq!(f8_1_7(12.7).unwrap(), 127);
        assert_eq!(f8_1_7(13.0).unwrap(), 0x80 | 13);
        assert_eq!(f8_1_7(127.0).unwrap(), 0x80 | 127);
        assert!(f8_1_7(127.5).is_err());
        assert!(f8_1_7(-0.1).is_err());
        assert_eq!(f8_1_7_decode(0x94), 20.0);
        assert_eq!(f8_1_7_decode(20), 2.0);
    }

    #[test]
    fn tail_sets_ignore_pi_bit() {
        let tail = ShotTail {
            max_total_volume: 100,
            ignore_pi: true,
        };
        let bytes = tail.as_wire_bytes().unwrap();
        assert_eq!(bytes[0], 100);
        assert_eq!(bytes[1], 0x80);
        assert!(
            ShotTail {
                max_total_volume: 1024,
                ignore_pi: false
            }
            .as_wire_bytes()
            .is_err()
        );
    }

    #[test]
    fn ext_frame_pads_to_seven() {
        let ext = ShotExtFrame {
            max_flow_or_pressure: 8.5,
            max_fop_range: 1.0,
        };
        assert_eq!(ext.as_wire_bytes().unwrap(), [136, 16, 0, 0, 0, 0, 0]);
    }
}
