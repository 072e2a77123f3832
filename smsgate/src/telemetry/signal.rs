use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::SignalBands;
use crate::parse::{Strategy, first_match, group, strategy};

/// rssi value meaning "not known or not detectable".
pub const RSSI_UNKNOWN: u8 = 99;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SignalQuality {
    Unknown,
    NoSignal,
    VeryPoor,
    Poor,
    Fair,
    Good,
    Excellent,
}

impl SignalQuality {
    pub fn from_rssi(rssi: u8, bands: &SignalBands) -> Self {
        match rssi {
            RSSI_UNKNOWN => Self::Unknown,
            0 => Self::NoSignal,
            r if r >= bands.excellent => Self::Excellent,
            r if r >= bands.good => Self::Good,
            r if r >= bands.fair => Self::Fair,
            r if r >= bands.poor => Self::Poor,
            _ => Self::VeryPoor,
        }
    }
}

impl fmt::Display for SignalQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unknown => "Unknown",
            Self::NoSignal => "No signal",
            Self::VeryPoor => "Very poor",
            Self::Poor => "Poor",
            Self::Fair => "Fair",
            Self::Good => "Good",
            Self::Excellent => "Excellent",
        };
        f.write_str(s)
    }
}

/// Estimated received power for rssi 1 to 30. 31 only says "-51 dBm or
/// better" and gets no estimate.
pub fn rssi_to_dbm(rssi: u8) -> Option<i32> {
    (1..=30).contains(&rssi).then(|| -113 + 2 * i32::from(rssi))
}

/// Rough strength in percent of the best reportable rssi.
pub fn rssi_to_percent(rssi: u8) -> u8 {
    match rssi {
        RSSI_UNKNOWN => 0,
        r if r >= 31 => 100,
        r => (u32::from(r) * 100 / 31) as u8,
    }
}

/// One `AT+CSQ` answer with its derived values.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignalSample {
    pub timestamp: DateTime<Utc>,
    pub rssi: u8,
    /// Bit error rate class, 99 when unknown.
    pub ber: u8,
    pub quality: SignalQuality,
    pub dbm: Option<i32>,
    pub percent: u8,
}

static STRATEGIES: [Strategy<(u8, u8)>; 2] = [
    strategy!("tagged", r"\+CSQ:\s*(\d+),(\d+)", |c| Some((group(c, 1)?, group(c, 2)?))),
    strategy!("untagged", r"CSQ:\s*(\d+),(\d+)", |c| Some((group(c, 1)?, group(c, 2)?))),
];

pub fn parse_signal(
    text: &str,
    bands: &SignalBands,
    timestamp: DateTime<Utc>,
) -> Option<SignalSample> {
    let (_, (rssi, ber)) = first_match(&STRATEGIES, text)?;
    Some(SignalSample {
        timestamp,
        rssi,
        ber,
        quality: SignalQuality::from_rssi(rssi, bands),
        dbm: rssi_to_dbm(rssi),
        percent: rssi_to_percent(rssi),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_parses_csq() {
        let sample =
            parse_signal("\r\n+CSQ: 15,99\r\n\r\nOK\r\n", &SignalBands::default(), Utc::now())
                .unwrap();
        assert_eq!(sample.rssi, 15);
        assert_eq!(sample.ber, 99);
        assert_eq!(sample.quality, SignalQuality::Fair);
        assert_eq!(sample.quality.to_string(), "Fair");
        assert_eq!(sample.dbm, Some(-83));
        assert_eq!(sample.percent, 48);
    }

    #[test]
    fn it_bands_rssi() {
        let bands = SignalBands::default();
        let quality = |rssi| SignalQuality::from_rssi(rssi, &bands);
        assert_eq!(quality(99), SignalQuality::Unknown);
        assert_eq!(quality(0), SignalQuality::NoSignal);
        assert_eq!(quality(1), SignalQuality::VeryPoor);
        assert_eq!(quality(4), SignalQuality::VeryPoor);
        assert_eq!(quality(5), SignalQuality::Poor);
        assert_eq!(quality(10), SignalQuality::Fair);
        assert_eq!(quality(16), SignalQuality::Good);
        assert_eq!(quality(20), SignalQuality::Excellent);
        assert_eq!(quality(31), SignalQuality::Excellent);
    }

    #[test]
    fn it_only_estimates_dbm_for_measured_rssi() {
        assert_eq!(rssi_to_dbm(1), Some(-111));
        assert_eq!(rssi_to_dbm(30), Some(-53));
        assert_eq!(rssi_to_dbm(31), None);
        assert_eq!(rssi_to_dbm(0), None);
        assert_eq!(rssi_to_dbm(99), None);
        assert_eq!(rssi_to_percent(99), 0);
        assert_eq!(rssi_to_percent(31), 100);
    }

    #[test]
    fn it_rejects_garbage() {
        assert!(parse_signal("ERROR", &SignalBands::default(), Utc::now()).is_none());
    }
}
