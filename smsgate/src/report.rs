use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::session::{RegistrationState, SessionPhase, SessionStatus};
use crate::sms::SmsCounters;
use crate::telemetry::TelemetrySnapshot;
use crate::telemetry::battery::ChargingStatus;

/// Periodic summary of the engine's view of the modem.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub generated_at: DateTime<Utc>,
    pub phase: SessionPhase,
    pub registration: RegistrationState,
    pub voltage: Option<f64>,
    pub battery_level: Option<u8>,
    pub charging: ChargingStatus,
    pub rssi: Option<u8>,
    pub signal: Option<String>,
    pub operator: Option<String>,
    pub sms: SmsCounters,
    pub low_battery_alerts: u64,
}

impl StatusReport {
    pub fn compose(
        status: &SessionStatus,
        telemetry: &TelemetrySnapshot,
        sms: SmsCounters,
    ) -> Self {
        Self {
            generated_at: Utc::now(),
            phase: status.phase,
            registration: status.registration,
            voltage: telemetry.last_battery.map(|b| b.voltage),
            battery_level: telemetry.last_battery.map(|b| b.level),
            charging: telemetry.charging,
            rssi: telemetry.last_signal.as_ref().map(|s| s.rssi),
            signal: telemetry
                .last_signal
                .as_ref()
                .map(|s| s.quality.to_string()),
            operator: telemetry
                .last_operator
                .as_ref()
                .and_then(|o| o.operator.clone()),
            sms,
            low_battery_alerts: telemetry.low_battery_alerts,
        }
    }
}

/// Compact text, short enough for a single SMS.
impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Status {}", self.generated_at.format("%Y-%m-%d %H:%M"))?;
        write!(f, "\nNet: {:?}", self.registration)?;
        if let Some(operator) = &self.operator {
            write!(f, " ({operator})")?;
        }
        match (self.voltage, self.battery_level) {
            (Some(v), Some(level)) => write!(f, "\nBatt: {v:.2}V {level}% {}", self.charging)?,
            _ => write!(f, "\nBatt: unknown")?,
        }
        match (&self.signal, self.rssi) {
            (Some(quality), Some(rssi)) => write!(f, "\nSignal: {quality} ({rssi})")?,
            _ => write!(f, "\nSignal: unknown")?,
        }
        write!(
            f,
            "\nSMS: {} in, {} out, {} failed",
            self.sms.received, self.sms.sent, self.sms.send_failures
        )
    }
}
