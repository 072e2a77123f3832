//! Outbound records. The engine pushes what it observes to an [`EventSink`]
//! and never reads anything back.

use std::fmt;

use chrono::{DateTime, Utc};
use flume::Sender;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::sms::SmsRecord;
use crate::telemetry::battery::BatterySample;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LogLevel {
    Info,
    Warning,
    Error,
    Critical,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
            Self::Critical => "CRITICAL",
        };
        f.write_str(s)
    }
}

/// A line for the system log kept by whoever persists engine output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemLog {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub component: &'static str,
    pub message: String,
}

impl SystemLog {
    pub fn new(level: LogLevel, component: &'static str, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            component,
            message: message.into(),
        }
    }
}

/// Receiver of normalized engine output. Implementations must not block for
/// long; they run on the engine's threads.
pub trait EventSink: Send + Sync {
    fn sms_received(&self, sms: &SmsRecord);

    fn system_log(&self, entry: &SystemLog);

    fn battery_sampled(&self, _sample: &BatterySample) {}
}

/// Logs everything and keeps nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn sms_received(&self, sms: &SmsRecord) {
        info!(
            slot = ?sms.slot,
            sender = %sms.sender,
            timestamp = %sms.timestamp,
            "SMS received: {}",
            sms.body
        );
    }

    fn system_log(&self, entry: &SystemLog) {
        match entry.level {
            LogLevel::Info => info!(component = entry.component, "{}", entry.message),
            LogLevel::Warning => warn!(component = entry.component, "{}", entry.message),
            LogLevel::Error | LogLevel::Critical => {
                error!(component = entry.component, level = %entry.level, "{}", entry.message)
            }
        }
    }
}

/// Everything a [`ChannelSink`] forwards.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    Sms(SmsRecord),
    Log(SystemLog),
    Battery(BatterySample),
}

/// Forwards events to whoever holds the receiving end, typically a request
/// layer that stores them.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: Sender<EngineEvent>,
}

impl ChannelSink {
    pub fn new(tx: Sender<EngineEvent>) -> Self {
        Self { tx }
    }

    /// A sink together with an unbounded receiver for its events.
    pub fn unbounded() -> (Self, flume::Receiver<EngineEvent>) {
        let (tx, rx) = flume::unbounded();
        (Self { tx }, rx)
    }

    fn forward(&self, event: EngineEvent) {
        if self.tx.send(event).is_err() {
            warn!("event receiver dropped, discarding engine event");
        }
    }
}

impl EventSink for ChannelSink {
    fn sms_received(&self, sms: &SmsRecord) {
        self.forward(EngineEvent::Sms(sms.clone()));
    }

    fn system_log(&self, entry: &SystemLog) {
        self.forward(EngineEvent::Log(entry.clone()));
    }

    fn battery_sampled(&self, sample: &BatterySample) {
        self.forward(EngineEvent::Battery(*sample));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_forwards_events_in_order() {
        let (sink, rx) = ChannelSink::unbounded();
        sink.system_log(&SystemLog::new(LogLevel::Warning, "battery", "low"));
        let sample = BatterySample {
            timestamp: Utc::now(),
            voltage: 3.4,
            level: 12,
        };
        sink.battery_sampled(&sample);

        assert!(matches!(
            rx.try_recv().unwrap(),
            EngineEvent::Log(SystemLog { level: LogLevel::Warning, component: "battery", .. })
        ));
        assert_eq!(rx.try_recv().unwrap(), EngineEvent::Battery(sample));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn it_tolerates_a_dropped_receiver() {
        let (sink, rx) = ChannelSink::unbounded();
        drop(rx);
        sink.system_log(&SystemLog::new(LogLevel::Info, "engine", "ignored"));
    }

    #[test]
    fn it_serializes_events_with_a_tag() {
        let event = EngineEvent::Log(SystemLog::new(LogLevel::Critical, "battery", "empty"));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "log");
        assert_eq!(json["level"], "Critical");
    }
}
