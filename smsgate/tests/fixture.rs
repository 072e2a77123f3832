#![allow(dead_code)]
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use mockall::mock;
use smsgate::Engine;
use smsgate::config::{Config, Timings, TransportConfig};
use smsgate::sink::{ChannelSink, EngineEvent, EventSink, SystemLog};
use smsgate::sms::SmsRecord;
use smsgate::transport::SimulatedModem;

mock! {
    pub Sink {}
    impl EventSink for Sink {
        fn sms_received(&self, sms: &SmsRecord);

        fn system_log(&self, entry: &SystemLog);
    }
}

/// Timings scaled down so a full bring-up takes milliseconds.
pub fn fast_timings() -> Timings {
    Timings::default().compressed(50)
}

pub fn config() -> Config {
    Config {
        transport: TransportConfig::Simulated,
        timings: fast_timings(),
        ..Config::default()
    }
}

pub struct Fixture {
    pub modem: SimulatedModem,
    pub engine: Engine,
    pub events: flume::Receiver<EngineEvent>,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_config(config())
    }

    pub fn with_config(config: Config) -> Self {
        let modem = SimulatedModem::new();
        let (sink, events) = ChannelSink::unbounded();
        let engine = Engine::with_transport(config, Box::new(modem.clone()), Arc::new(sink));
        Self {
            modem,
            engine,
            events,
        }
    }

    pub fn with_sink(config: Config, sink: Arc<dyn EventSink>) -> (SimulatedModem, Engine) {
        let modem = SimulatedModem::new();
        let engine = Engine::with_transport(config, Box::new(modem.clone()), sink);
        (modem, engine)
    }

    /// Next received SMS, skipping other events.
    pub fn next_sms(&self, timeout: Duration) -> Option<SmsRecord> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.events.recv_deadline(deadline).ok()? {
                EngineEvent::Sms(sms) => return Some(sms),
                _ => continue,
            }
        }
    }

    /// Next system log line from `component`, skipping other events.
    pub fn next_log(&self, component: &str, timeout: Duration) -> Option<SystemLog> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.events.recv_deadline(deadline).ok()? {
                EngineEvent::Log(entry) if entry.component == component => return Some(entry),
                _ => continue,
            }
        }
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        self.engine.shutdown();
    }
}

pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

pub fn count(commands: &[String], command: &str) -> usize {
    commands.iter().filter(|c| *c == command).count()
}

pub fn position(commands: &[String], command: &str) -> Option<usize> {
    commands.iter().position(|c| c == command)
}
