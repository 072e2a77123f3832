//! Battery, signal and operator sampling.
//!
//! The samplers only read from the modem and may run concurrently from the
//! poller and from on-demand callers; they serialize on the dispatcher.
//! The history and last samples live in a [`State`] that only this module
//! writes.

pub mod battery;
pub mod operator;
pub mod signal;

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::TelemetryConfig;
use crate::dispatcher::{Dispatcher, Response};
use crate::error::{ModemError, Result};
use crate::sink::{EventSink, LogLevel, SystemLog};
use crate::state::State;

use battery::{BatteryAlert, BatteryReading, BatterySample, ChargingStatus, VoltageHistory};
use operator::OperatorSample;
use signal::SignalSample;

/// Result of one battery sample.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatteryStatus {
    pub reading: BatteryReading,
    /// Set when the reading carried a voltage and went into the history.
    pub sample: Option<BatterySample>,
    pub charging: ChargingStatus,
    pub alert: Option<BatteryAlert>,
    /// Name of the pattern that understood the response.
    pub format: &'static str,
    pub raw: String,
}

#[derive(Debug, Clone)]
pub struct TelemetryState {
    pub history: VoltageHistory,
    pub last_battery: Option<BatteryReading>,
    pub last_signal: Option<SignalSample>,
    pub last_operator: Option<OperatorSample>,
    pub low_battery_alerts: u64,
}

impl TelemetryState {
    fn new(capacity: usize) -> Self {
        Self {
            history: VoltageHistory::new(capacity),
            last_battery: None,
            last_signal: None,
            last_operator: None,
            low_battery_alerts: 0,
        }
    }
}

/// Read-only copy of the telemetry state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetrySnapshot {
    pub last_battery: Option<BatterySample>,
    pub history: Vec<BatterySample>,
    pub charging: ChargingStatus,
    pub last_signal: Option<SignalSample>,
    pub last_operator: Option<OperatorSample>,
    pub low_battery_alerts: u64,
}

pub struct Telemetry {
    dispatcher: Arc<Dispatcher>,
    config: TelemetryConfig,
    state: State<TelemetryState>,
    sink: Arc<dyn EventSink>,
}

impl Telemetry {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        config: TelemetryConfig,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let state = State::new(TelemetryState::new(config.history_capacity));
        Self {
            dispatcher,
            config,
            state,
            sink,
        }
    }

    pub fn config(&self) -> &TelemetryConfig {
        &self.config
    }

    /// Issues `command` and runs `parse` on whatever came back. A response
    /// that did not end in `OK` is still worth a parse attempt; only when
    /// that fails too is it reported as the command's failure.
    fn query<T>(
        &self,
        command: &str,
        what: &'static str,
        parse: impl FnOnce(&str) -> Option<T>,
    ) -> Result<(T, Response)> {
        let response = self.dispatcher.execute(command)?;
        if let Some(value) = parse(&response.raw) {
            return Ok((value, response));
        }
        let response = response.require()?;
        Err(ModemError::Parse {
            what,
            raw: response.raw,
        })
    }

    /// `AT+CBC`: reads the battery, extends the history, recomputes the
    /// charging trend and raises low-voltage alerts.
    pub fn sample_battery(&self) -> Result<BatteryStatus> {
        let ((format, reading), response) =
            self.query("AT+CBC", "battery status", battery::parse_battery)?;

        let sample = reading.voltage.map(|voltage| BatterySample {
            timestamp: Utc::now(),
            voltage,
            level: reading.level,
        });
        let alert = sample.map(|s| {
            BatteryAlert::classify(
                s.voltage,
                self.config.low_battery_warning_v,
                self.config.low_battery_critical_v,
            )
        });

        let charging = self.state.write(|state| {
            if let Some(sample) = sample {
                state.history.push(sample);
            }
            if matches!(alert, Some(BatteryAlert::Warning | BatteryAlert::Critical)) {
                state.low_battery_alerts += 1;
            }
            state.last_battery = Some(reading.clone());
            self.trend(&state.history)
        });

        match sample {
            Some(sample) => {
                debug!(
                    voltage = sample.voltage,
                    level = sample.level,
                    %charging,
                    format,
                    "battery sampled"
                );
                self.sink.battery_sampled(&sample);
            }
            None => debug!(level = reading.level, format, "battery level without voltage"),
        }
        if let (Some(alert), Some(sample)) = (alert, sample) {
            self.raise(alert, &sample);
        }

        Ok(BatteryStatus {
            reading,
            sample,
            charging,
            alert,
            format,
            raw: response.raw,
        })
    }

    fn trend(&self, history: &VoltageHistory) -> ChargingStatus {
        battery::charging_status(
            &history.recent_voltages(self.config.trend_window),
            self.config.charging_threshold_mv,
            self.config.discharging_threshold_mv,
        )
    }

    fn raise(&self, alert: BatteryAlert, sample: &BatterySample) {
        let level = match alert {
            BatteryAlert::Normal => return,
            BatteryAlert::Warning => LogLevel::Warning,
            BatteryAlert::Critical => LogLevel::Critical,
        };
        warn!(voltage = sample.voltage, ?alert, "battery low");
        self.sink.system_log(&SystemLog::new(
            level,
            "battery",
            format!(
                "battery low: {:.3} V ({}%)",
                sample.voltage, sample.level
            ),
        ));
    }

    /// `AT+CSQ`
    pub fn sample_signal(&self) -> Result<SignalSample> {
        let (sample, _) = self.query("AT+CSQ", "signal quality", |raw| {
            signal::parse_signal(raw, &self.config.signal_bands, Utc::now())
        })?;
        debug!(rssi = sample.rssi, quality = %sample.quality, "signal sampled");
        self.state
            .write(|state| state.last_signal = Some(sample.clone()));
        Ok(sample)
    }

    /// `AT+COPS?`
    pub fn sample_operator(&self) -> Result<OperatorSample> {
        let (sample, _) = self.query("AT+COPS?", "operator", |raw| {
            operator::parse_operator(raw, Utc::now())
        })?;
        debug!(operator = ?sample.operator, mode = ?sample.mode, "operator sampled");
        self.state
            .write(|state| state.last_operator = Some(sample.clone()));
        Ok(sample)
    }

    /// Always derived from the current history, never cached.
    pub fn charging_status(&self) -> ChargingStatus {
        self.state.read(|state| self.trend(&state.history))
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        self.state.read(|state| TelemetrySnapshot {
            last_battery: state.history.last().copied(),
            history: state.history.to_vec(),
            charging: self.trend(&state.history),
            last_signal: state.last_signal.clone(),
            last_operator: state.last_operator.clone(),
            low_battery_alerts: state.low_battery_alerts,
        })
    }
}
