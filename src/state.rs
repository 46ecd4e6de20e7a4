//! Decoders for the response payloads of the charger.
//!
//! Every payload starts with fields that all firmware generations send. Later firmware
//! appends further fields, which are only detectable by the length of the payload. Each
//! decoder therefore reads its stable prefix and then walks an ordered table of
//! `(threshold, field group)` gates; a group is decoded when the payload is at least
//! `threshold` hex digits long. Fields of groups that are not reached stay `None`.

use crate::protocol::{decode_boolean, decode_string, HexReader};
use crate::Error;
use chrono::NaiveDate;
use std::net::Ipv4Addr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// A group of trailing fields unlocked once the payload reaches a given length.
type Gate<T> = (usize, fn(&mut HexReader<'_>, &mut T));

fn apply_gates<T>(reader: &mut HexReader<'_>, target: &mut T, gates: &[Gate<T>]) {
    for (threshold, group) in gates {
        if reader.len() < *threshold {
            log::trace!(
                "payload length {} below gate {threshold}, skipping remaining fields",
                reader.len()
            );
            break;
        }
        group(reader, target);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ChargerMode {
    OnePhase,
    ThreePhase,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Model {
    pub mode: ChargerMode,
    pub name: String,
}

impl Model {
    pub fn decode(data: &str) -> Self {
        let mut reader = HexReader::new(data);
        let mode = match reader.u8() {
            1 => ChargerMode::OnePhase,
            3 => ChargerMode::ThreePhase,
            other => {
                log::warn!("Unknown phase count {other}, assuming one phase");
                ChargerMode::OnePhase
            }
        };
        Self {
            mode,
            name: decode_string(reader.slice(reader.position(), reader.len())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct IpAddress {
    pub ip: Ipv4Addr,
    pub device_code: String,
}

impl IpAddress {
    pub fn decode(data: &str) -> Self {
        let mut reader = HexReader::new(data);
        let ip = Ipv4Addr::new(reader.u8(), reader.u8(), reader.u8(), reader.u8());
        Self {
            ip,
            device_code: decode_string(reader.slice(reader.position(), reader.len())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ChargerState {
    Abnormal,
    Unplugged,
    Standby,
    NotReady,
    Charging,
    SelfChecking,
}

impl From<u8> for ChargerState {
    fn from(value: u8) -> Self {
        match value {
            0 => ChargerState::Abnormal,
            1 | 4 => ChargerState::Unplugged,
            2 | 3 => ChargerState::Standby,
            5 => ChargerState::NotReady,
            6 => ChargerState::Charging,
            7 => ChargerState::SelfChecking,
            other => {
                log::warn!("Unknown charger state {other}");
                ChargerState::Abnormal
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FaultStatus {
    pub over_voltage: bool,
    pub under_voltage: bool,
    pub over_current: bool,
    pub over_temperature: bool,
    pub leakage: bool,
    pub grounding: bool,
    pub emergency_stop: bool,
    pub control_pilot: bool,
    pub short_circuit: bool,
    pub communication: bool,
    pub meter: bool,
    pub motor_lock: bool,
    pub sticking: Option<bool>,
    pub contactor: Option<bool>,
}

impl FaultStatus {
    const GATES: &'static [Gate<Self>] = &[(26, Self::decode_relay_faults)];

    fn decode_relay_faults(reader: &mut HexReader<'_>, status: &mut Self) {
        status.sticking = Some(reader.flag());
        status.contactor = Some(reader.flag());
    }

    pub fn decode(data: &str) -> Self {
        let mut reader = HexReader::new(data);
        let mut status = Self {
            over_voltage: reader.flag(),
            under_voltage: reader.flag(),
            over_current: reader.flag(),
            over_temperature: reader.flag(),
            leakage: reader.flag(),
            grounding: reader.flag(),
            emergency_stop: reader.flag(),
            control_pilot: reader.flag(),
            short_circuit: reader.flag(),
            communication: reader.flag(),
            meter: reader.flag(),
            motor_lock: reader.flag(),
            sticking: None,
            contactor: None,
        };
        apply_gates(&mut reader, &mut status, Self::GATES);
        status
    }

    pub fn has_fault(&self) -> bool {
        self.over_voltage
            || self.under_voltage
            || self.over_current
            || self.over_temperature
            || self.leakage
            || self.grounding
            || self.emergency_stop
            || self.control_pilot
            || self.short_circuit
            || self.communication
            || self.meter
            || self.motor_lock
            || self.sticking == Some(true)
            || self.contactor == Some(true)
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Electrical {
    OnePhase { current: u16, voltage: u16 },
    ThreePhase { currents: [u8; 3], voltages: [u16; 3] },
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RealTimeData {
    pub electrical: Electrical,
    /// kW
    pub power: f32,
    /// kWh
    pub total_power: f32,
    /// °C
    pub temperature: i16,
    pub state: ChargerState,
    pub timed_charge_enabled: bool,
    pub start_charge_time: String,
    pub end_charge_time: String,
    pub max_current: Option<u8>,
    pub max_power: Option<u8>,
    pub is_reservation: Option<bool>,
    pub is_maximum: Option<bool>,
    pub is_extreme_mode: Option<bool>,
}

impl RealTimeData {
    const ONE_PHASE_GATES: &'static [Gate<Self>] = &[
        (36, Self::decode_limits),
        (42, Self::decode_maximum),
        (44, Self::decode_extreme_mode),
    ];
    const THREE_PHASE_GATES: &'static [Gate<Self>] = &[
        (46, Self::decode_limits),
        (52, Self::decode_maximum),
        (54, Self::decode_extreme_mode),
    ];

    // These three are read at fixed offsets for both modes. They only line up with the
    // cursor on three phase chargers.
    fn decode_limits(reader: &mut HexReader<'_>, data: &mut Self) {
        data.max_current = Some(HexReader::new(reader.slice(46, 2)).u8());
        data.max_power = Some(HexReader::new(reader.slice(48, 2)).u8());
        data.is_reservation = Some(decode_boolean(reader.slice(50, 2)));
        reader.skip(6);
    }

    fn decode_maximum(reader: &mut HexReader<'_>, data: &mut Self) {
        data.is_maximum = Some(reader.flag());
    }

    fn decode_extreme_mode(reader: &mut HexReader<'_>, data: &mut Self) {
        data.is_extreme_mode = Some(reader.flag());
    }

    pub fn decode(data: &str, mode: ChargerMode) -> Self {
        let mut reader = HexReader::new(data);
        let electrical = match mode {
            ChargerMode::OnePhase => Electrical::OnePhase {
                current: reader.u16(),
                voltage: reader.u16(),
            },
            ChargerMode::ThreePhase => Electrical::ThreePhase {
                currents: [reader.u8(), reader.u8(), reader.u8()],
                voltages: [reader.u16(), reader.u16(), reader.u16()],
            },
        };
        let mut realtime = Self {
            electrical,
            power: reader.decimal(),
            total_power: reader.decimal(),
            // An offset of 100 is added by the charger to transfer negative values
            temperature: reader.u8() as i16 - 100,
            state: ChargerState::from(reader.u8()),
            timed_charge_enabled: reader.nonzero(),
            start_charge_time: reader.time(),
            end_charge_time: reader.time(),
            max_current: None,
            max_power: None,
            is_reservation: None,
            is_maximum: None,
            is_extreme_mode: None,
        };
        let gates = match mode {
            ChargerMode::OnePhase => Self::ONE_PHASE_GATES,
            ChargerMode::ThreePhase => Self::THREE_PHASE_GATES,
        };
        apply_gates(&mut reader, &mut realtime, gates);
        realtime
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ControlsState {
    pub rfid: bool,
    pub app_control_charging: bool,
    /// Some firmware reports a third, undocumented value; any nonzero value counts as enabled.
    pub dlb: bool,
    pub grounding_detection: bool,
    pub temperature_threshold: u8,
    pub max_current: u16,
    pub dlb_pattern: u8,
    pub dlb_max_current: u8,
    /// Seven characters, `1` for every reserved day.
    pub reservation_days: Option<String>,
    /// `HHMM`
    pub reservation_start: Option<String>,
    /// `HHMM`
    pub reservation_end: Option<String>,
    pub max_monthly_power: Option<u16>,
    pub emergency_stop_protection: Option<bool>,
    pub extreme_mode: Option<bool>,
    pub night_mode: Option<bool>,
}

impl ControlsState {
    const GATES: &'static [Gate<Self>] = &[
        (20, Self::decode_reservation),
        (30, Self::decode_monthly_limit),
        (36, Self::decode_modes),
    ];

    fn decode_reservation(reader: &mut HexReader<'_>, state: &mut Self) {
        let days = reader.u8();
        if days & 0x80 != 0 {
            log::warn!("reservation days {days:#04x} has bit 7 set, only seven days are reported");
        }
        state.reservation_days = Some(format!("{:07b}", days & 0x7f));
        state.reservation_start = Some(reader.hour_minute());
        state.reservation_end = Some(reader.hour_minute());
        reader.seek(28);
    }

    fn decode_monthly_limit(reader: &mut HexReader<'_>, state: &mut Self) {
        state.max_monthly_power = Some(reader.u16());
        state.emergency_stop_protection = Some(reader.flag());
    }

    fn decode_modes(reader: &mut HexReader<'_>, state: &mut Self) {
        state.extreme_mode = Some(reader.flag());
        state.night_mode = Some(reader.flag());
    }

    pub fn decode(data: &str) -> Self {
        let mut reader = HexReader::new(data);
        let mut state = Self {
            rfid: reader.flag(),
            app_control_charging: reader.flag(),
            dlb: reader.nonzero(),
            grounding_detection: reader.flag(),
            temperature_threshold: reader.u8(),
            max_current: reader.u16(),
            dlb_pattern: reader.u8(),
            dlb_max_current: reader.u8(),
            reservation_days: None,
            reservation_start: None,
            reservation_end: None,
            max_monthly_power: None,
            emergency_stop_protection: None,
            extreme_mode: None,
            night_mode: None,
        };
        apply_gates(&mut reader, &mut state, Self::GATES);
        state
    }
}

const DAY_BUCKETS: usize = 20;
const MONTH_BUCKETS: usize = 12;
const YEAR_BUCKETS: usize = 10;

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ConsumptionRecords {
    /// kWh of the most recent days.
    pub days: Vec<f32>,
    /// kWh of the most recent months.
    pub months: Vec<f32>,
    pub years: Option<Vec<u16>>,
}

impl ConsumptionRecords {
    const GATES: &'static [Gate<Self>] = &[(130, Self::decode_years)];

    fn decode_years(reader: &mut HexReader<'_>, records: &mut Self) {
        records.years = Some((0..YEAR_BUCKETS).map(|_| reader.u16()).collect());
    }

    pub fn decode(data: &str) -> Self {
        let mut reader = HexReader::new(data);
        let mut records = Self {
            days: (0..DAY_BUCKETS).map(|_| reader.decimal()).collect(),
            months: (0..MONTH_BUCKETS).map(|_| reader.decimal()).collect(),
            years: None,
        };
        apply_gates(&mut reader, &mut records, Self::GATES);
        records
    }
}

pub fn days_in_month(year: i32, month: u32) -> Result<u32, Error> {
    let first = NaiveDate::from_ymd_opt(year, month, 1).ok_or(Error::RangeError)?;
    let next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    }
    .ok_or(Error::RangeError)?;
    Ok(next.signed_duration_since(first).num_days() as u32)
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ConsumptionRecordsOfMonth {
    pub year: i32,
    pub month: u32,
    pub is_effective: bool,
    /// kWh per day, always one entry per calendar day.
    pub days: Vec<f32>,
}

impl ConsumptionRecordsOfMonth {
    pub fn decode(data: &str, year: i32, month: u32) -> Result<Self, Error> {
        let n_days = days_in_month(year, month)? as usize;
        let mut reader = HexReader::new(data);
        let is_effective = reader.flag();
        let expected = 2 + n_days * 4;
        if reader.len() < expected {
            log::warn!(
                "Short consumption payload for {year}-{month:02} - required={expected} received={}",
                reader.len()
            );
        }
        Ok(Self {
            year,
            month,
            is_effective,
            days: (0..n_days).map(|_| reader.decimal()).collect(),
        })
    }
}
