use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::parse::{Strategy, first_match, group, strategy};

/// One `AT+CBC` answer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatteryReading {
    /// `<bcs>`, unreliable on most boards.
    pub charge_status: Option<u8>,
    /// `<bcl>`, percent.
    pub level: u8,
    /// Volts, absent when the firmware only reports two fields.
    pub voltage: Option<f64>,
}

/// A reading with a voltage, as kept in the history.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BatterySample {
    pub timestamp: DateTime<Utc>,
    pub voltage: f64,
    pub level: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ChargingStatus {
    Charging,
    Discharging,
    Stable,
    InsufficientData,
}

impl fmt::Display for ChargingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Charging => "Charging",
            Self::Discharging => "Discharging",
            Self::Stable => "Stable",
            Self::InsufficientData => "Insufficient data",
        };
        f.write_str(s)
    }
}

/// Voltage band of a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BatteryAlert {
    Normal,
    Warning,
    Critical,
}

impl BatteryAlert {
    pub fn classify(voltage: f64, warning: f64, critical: f64) -> Self {
        if voltage <= critical {
            Self::Critical
        } else if voltage <= warning {
            Self::Warning
        } else {
            Self::Normal
        }
    }
}

fn millivolts(c: &regex::Captures<'_>) -> Option<BatteryReading> {
    let mv: u32 = group(c, 3)?;
    Some(BatteryReading {
        charge_status: group(c, 1),
        level: percent(group(c, 2)?)?,
        voltage: Some(f64::from(mv) / 1000.0),
    })
}

fn level_only(c: &regex::Captures<'_>) -> Option<BatteryReading> {
    Some(BatteryReading {
        charge_status: group(c, 1),
        level: percent(group(c, 2)?)?,
        voltage: None,
    })
}

fn percent(level: u32) -> Option<u8> {
    u8::try_from(level).ok().filter(|level| *level <= 100)
}

static STRATEGIES: [Strategy<BatteryReading>; 7] = [
    strategy!("decimal volts", r"\+CBC:\s*(\d+),(\d+),(\d+\.\d+)V", |c| {
        Some(BatteryReading {
            charge_status: group(c, 1),
            level: percent(group(c, 2)?)?,
            voltage: Some(group(c, 3)?),
        })
    }),
    strategy!("millivolts", r"\+CBC:\s*(\d+),(\d+),(\d+)", millivolts),
    strategy!("untagged millivolts", r"CBC:\s*(\d+),(\d+),(\d+)", millivolts),
    strategy!("level only", r"\+CBC:\s*(\d+),(\d+)", level_only),
    strategy!("untagged level only", r"CBC:\s*(\d+),(\d+)", level_only),
    strategy!("bare triple", r"(\d+),(\d+),(\d+)", millivolts),
    strategy!("bare pair", r"(\d+),(\d+)", level_only),
];

/// Reads an `AT+CBC` response, returning the strategy that matched.
pub fn parse_battery(text: &str) -> Option<(&'static str, BatteryReading)> {
    first_match(&STRATEGIES, text)
}

/// Trend of `voltages` (oldest first) from the mean delta between successive
/// samples, in millivolts.
pub fn charging_status(
    voltages: &[f64],
    charging_threshold_mv: f64,
    discharging_threshold_mv: f64,
) -> ChargingStatus {
    if voltages.len() < 2 {
        return ChargingStatus::InsufficientData;
    }
    let total: f64 = voltages
        .windows(2)
        .map(|pair| (pair[1] - pair[0]) * 1000.0)
        .sum();
    let mean = total / (voltages.len() - 1) as f64;

    if mean > charging_threshold_mv {
        ChargingStatus::Charging
    } else if mean < discharging_threshold_mv {
        ChargingStatus::Discharging
    } else {
        ChargingStatus::Stable
    }
}

/// Bounded, chronologically ordered battery samples. Only ever appended to;
/// the oldest sample goes when capacity is reached.
#[derive(Debug, Clone)]
pub struct VoltageHistory {
    samples: VecDeque<BatterySample>,
    capacity: usize,
}

impl VoltageHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, sample: BatterySample) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn last(&self) -> Option<&BatterySample> {
        self.samples.back()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn to_vec(&self) -> Vec<BatterySample> {
        self.samples.iter().copied().collect()
    }

    /// Voltages of the newest `window` samples, oldest first.
    pub fn recent_voltages(&self, window: usize) -> Vec<f64> {
        let skip = self.samples.len().saturating_sub(window);
        self.samples.iter().skip(skip).map(|s| s.voltage).collect()
    }
}
