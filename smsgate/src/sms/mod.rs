//! Reading, deleting and sending text messages.

pub mod listener;
pub mod parser;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::SmsConfig;
use crate::dispatcher::{Dispatcher, Response, Terminal};
use crate::error::{ModemError, Result};
use crate::sink::{EventSink, LogLevel, SystemLog};

const CTRL_Z: u8 = 0x1a;
const ESC: u8 = 0x1b;

/// `<stat>` of a stored message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SmsStatus {
    Unread,
    Read,
    Unsent,
    Sent,
    Other(String),
}

impl SmsStatus {
    pub fn parse(status: &str) -> Self {
        match status.trim() {
            "REC UNREAD" | "0" => Self::Unread,
            "REC READ" | "1" => Self::Read,
            "STO UNSENT" | "2" => Self::Unsent,
            "STO SENT" | "3" => Self::Sent,
            other => Self::Other(other.to_owned()),
        }
    }
}

/// One message, normalized from whichever form the modem delivered it in.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SmsRecord {
    /// Storage slot, `None` for messages pushed straight to the host.
    pub slot: Option<u32>,
    pub status: SmsStatus,
    pub sender: String,
    /// Service centre timestamp as the modem printed it.
    pub timestamp: String,
    pub body: String,
    pub received_at: DateTime<Utc>,
}

/// Running totals, mostly for status reports.
#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    sent: AtomicU64,
    send_failures: AtomicU64,
    deleted: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SmsCounters {
    pub received: u64,
    pub sent: u64,
    pub send_failures: u64,
    pub deleted: u64,
}

pub struct SmsService {
    dispatcher: Arc<Dispatcher>,
    config: SmsConfig,
    sink: Arc<dyn EventSink>,
    text_mode: AtomicBool,
    notifications: AtomicBool,
    counters: Counters,
}

impl SmsService {
    pub fn new(dispatcher: Arc<Dispatcher>, config: SmsConfig, sink: Arc<dyn EventSink>) -> Self {
        Self {
            dispatcher,
            config,
            sink,
            text_mode: AtomicBool::new(false),
            notifications: AtomicBool::new(false),
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> &SmsConfig {
        &self.config
    }

    pub fn counters(&self) -> SmsCounters {
        SmsCounters {
            received: self.counters.received.load(Ordering::Relaxed),
            sent: self.counters.sent.load(Ordering::Relaxed),
            send_failures: self.counters.send_failures.load(Ordering::Relaxed),
            deleted: self.counters.deleted.load(Ordering::Relaxed),
        }
    }

    /// Forgets the per-session modem settings, after a reboot.
    pub fn reset_session(&self) {
        self.text_mode.store(false, Ordering::SeqCst);
        self.notifications.store(false, Ordering::SeqCst);
    }

    /// Text mode and new-message notices, each configured once per session.
    pub fn prepare(&self) -> Result<()> {
        self.ensure_text_mode()?;
        self.ensure_notifications()
    }

    fn ensure_text_mode(&self) -> Result<()> {
        if !self.text_mode.load(Ordering::SeqCst) {
            self.dispatcher.execute_ok("AT+CMGF=1")?;
            self.text_mode.store(true, Ordering::SeqCst);
            debug!("SMS text mode enabled");
        }
        Ok(())
    }

    fn ensure_notifications(&self) -> Result<()> {
        if !self.notifications.load(Ordering::SeqCst) {
            self.dispatcher.execute_ok("AT+CNMI=2,1,0,0,0")?;
            self.notifications.store(true, Ordering::SeqCst);
            debug!("new message notices enabled");
        }
        Ok(())
    }

    fn deliver(&self, record: &SmsRecord) {
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        info!(slot = ?record.slot, sender = %record.sender, "SMS received");
        self.sink.sms_received(record);
    }

    /// Handles a `+CMTI` notice: read the announced slot, hand the record
    /// to the sink, then delete the slot if configured to. An unparseable
    /// notice triggers a full storage scan instead.
    pub fn on_notification(&self, line: &str) -> Result<Vec<SmsRecord>> {
        let Some((storage, slot)) = parser::parse_new_message_notice(line) else {
            warn!(line, "unreadable new message notice, scanning storage");
            return self.catch_up_backlog();
        };
        debug!(storage = %storage, slot, "new message notice");

        let Some(record) = self.read_slot(slot)? else {
            warn!(slot, "announced slot is empty");
            return Ok(Vec::new());
        };
        self.deliver(&record);
        if self.config.auto_delete {
            self.delete_or_warn(slot);
        }
        Ok(vec![record])
    }

    /// Handles a message pushed straight to the host.
    pub fn on_delivery(&self, header: &str, body: &str) -> Option<SmsRecord> {
        let Some(record) = parser::parse_delivered(header, body) else {
            warn!(header, "unreadable direct delivery header");
            return None;
        };
        self.deliver(&record);
        Some(record)
    }

    /// Reads one slot, falling back to a full listing when the single read
    /// comes back without a usable header.
    pub fn read_slot(&self, slot: u32) -> Result<Option<SmsRecord>> {
        self.ensure_text_mode()?;
        let response = self.dispatcher.execute(&format!("AT+CMGR={slot}"))?;
        if response.matched()
            && let Some(record) = parser::parse_read(&response.raw, slot)
        {
            return Ok(Some(record));
        }

        debug!(slot, raw = %response.raw.trim(), "single read unusable, listing storage");
        Ok(self
            .list_all()?
            .into_iter()
            .find(|record| record.slot == Some(slot)))
    }

    /// Every stored message, in storage order.
    pub fn list_all(&self) -> Result<Vec<SmsRecord>> {
        self.ensure_text_mode()?;
        let response = self.dispatcher.execute_ok("AT+CMGL=\"ALL\"")?;
        Ok(parser::parse_list(&response.raw))
    }

    /// Processes everything already stored, as if each had just been
    /// announced.
    pub fn catch_up_backlog(&self) -> Result<Vec<SmsRecord>> {
        let records = self.list_all()?;
        if !records.is_empty() {
            info!(count = records.len(), "processing stored messages");
        }
        for record in &records {
            self.deliver(record);
            if self.config.auto_delete
                && let Some(slot) = record.slot
            {
                self.delete_or_warn(slot);
            }
        }
        Ok(records)
    }

    pub fn delete_slot(&self, slot: u32) -> Result<()> {
        self.dispatcher.execute_ok(&format!("AT+CMGD={slot}"))?;
        self.counters.deleted.fetch_add(1, Ordering::Relaxed);
        debug!(slot, "deleted SMS");
        Ok(())
    }

    fn delete_or_warn(&self, slot: u32) {
        if let Err(e) = self.delete_slot(slot) {
            warn!(slot, "failed to delete SMS: {e}");
        }
    }

    pub fn delete_all(&self) -> Result<()> {
        self.ensure_text_mode()?;
        self.dispatcher.execute_ok("AT+CMGDA=\"DEL ALL\"")?;
        info!("deleted every stored SMS");
        Ok(())
    }

    /// Sends `text` to `number` and returns the modem's message reference.
    pub fn send(&self, number: &str, text: &str) -> Result<u32> {
        validate_recipient(number)?;
        if text.is_empty() {
            return Err(ModemError::InvalidArgument("message text is empty".into()));
        }
        if text.bytes().any(|b| b == CTRL_Z || b == ESC) {
            return Err(ModemError::InvalidArgument(
                "message text contains control characters".into(),
            ));
        }
        self.ensure_text_mode()?;

        let result = self.submit(number, text).and_then(|response| {
            let reference = parser::parse_send_reference(&response.raw);
            match reference {
                Some(reference) if response.matched() => Ok(reference),
                _ => response.require().and_then(|response| {
                    Err(ModemError::CommandFailed {
                        command: response.command,
                        raw: response.raw,
                    })
                }),
            }
        });

        match &result {
            Ok(reference) => {
                self.counters.sent.fetch_add(1, Ordering::Relaxed);
                info!(number, reference, "SMS sent");
            }
            Err(e) => {
                self.counters.send_failures.fetch_add(1, Ordering::Relaxed);
                warn!(number, "SMS send failed: {e}");
                self.sink.system_log(&SystemLog::new(
                    LogLevel::Error,
                    "sms",
                    format!("failed to send SMS to {number}: {e}"),
                ));
            }
        }
        result
    }

    /// Prompt, body and confirmation under one lock hold.
    fn submit(&self, number: &str, text: &str) -> Result<Response> {
        let timings = self.dispatcher.timings();
        let command = format!("AT+CMGS=\"{number}\"");
        let prompt_timeout = timings.timeouts.for_command(&command);

        self.dispatcher.transaction(|link| {
            let prompt = link.exchange(&command, Terminal::Prompt, prompt_timeout)?;
            if !prompt.matched() {
                // leave no half-open prompt behind
                link.send_raw(&[ESC])?;
                return prompt.require();
            }

            let mut payload = text.as_bytes().to_vec();
            payload.push(CTRL_Z);
            link.send_raw(&payload)?;

            let mut response = link.collect(&command, Terminal::Ok, timings.sms_send)?;
            if !response.raw.contains("+CMGS") && response.terminal != Some(Terminal::Error) {
                debug!("no confirmation yet, waiting for the network");
                let more = link.collect(&command, Terminal::Ok, timings.sms_confirm)?;
                response.raw.push_str(&more.raw);
                response.terminal = more.terminal;
                response.timed_out = more.timed_out;
                response.elapsed += more.elapsed;
            }
            Ok(response)
        })
    }
}

fn validate_recipient(number: &str) -> Result<()> {
    let digits = number.strip_prefix('+').unwrap_or(number);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ModemError::InvalidArgument(format!(
            "invalid phone number {number:?}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use test_log::test;

    use super::*;
    use crate::config::Timings;
    use crate::transport::SimulatedModem;
    use crate::transport::simulated::Reply;

    #[derive(Default)]
    struct Collected(Mutex<Vec<SmsRecord>>);

    impl EventSink for Collected {
        fn sms_received(&self, sms: &SmsRecord) {
            self.0.lock().unwrap().push(sms.clone());
        }

        fn system_log(&self, _entry: &SystemLog) {}
    }

    fn service(config: SmsConfig) -> (SimulatedModem, Arc<Collected>, SmsService) {
        let modem = SimulatedModem::new();
        let dispatcher = Arc::new(Dispatcher::new(
            Box::new(modem.clone()),
            Timings::default().compressed(20),
        ));
        let sink = Arc::new(Collected::default());
        let service = SmsService::new(dispatcher, config, sink.clone());
        (modem, sink, service)
    }

    #[test]
    fn it_reads_then_deletes_a_notified_slot() {
        let (modem, sink, service) = service(SmsConfig::default());
        let slot = modem.store_sms("+100", "ping");
        let records = service
            .on_notification(&format!("+CMTI: \"SM\",{slot}"))
            .unwrap();
        assert_eq!(records[0].body, "ping");
        assert_eq!(sink.0.lock().unwrap().len(), 1);
        assert!(modem.stored_slots().is_empty());

        let commands = modem.commands();
        let read = commands.iter().position(|c| *c == format!("AT+CMGR={slot}"));
        let delete = commands.iter().position(|c| *c == format!("AT+CMGD={slot}"));
        assert!(read.unwrap() < delete.unwrap());
        assert_eq!(service.counters().deleted, 1);
    }

    #[test]
    fn it_keeps_messages_without_auto_delete() {
        let (modem, _sink, service) = service(SmsConfig {
            auto_delete: false,
            ..SmsConfig::default()
        });
        let slot = modem.store_sms("+100", "keep me");
        service
            .on_notification(&format!("+CMTI: \"SM\",{slot}"))
            .unwrap();
        assert_eq!(modem.stored_slots(), [slot]);
        assert!(!modem.commands().iter().any(|c| c.starts_with("AT+CMGD")));
    }

    #[test]
    fn it_falls_back_to_listing_on_a_garbled_read() {
        let (modem, _sink, service) = service(SmsConfig::default());
        let slot = modem.store_sms("+200", "via list");
        modem.script(&format!("AT+CMGR={slot}"), [Reply::ok("garbage")]);
        let record = service.read_slot(slot).unwrap().unwrap();
        assert_eq!(record.sender, "+200");
        assert_eq!(record.body, "via list");
        assert!(modem.commands().iter().any(|c| c == "AT+CMGL=\"ALL\""));
    }

    #[test]
    fn it_never_deletes_what_it_could_not_read() {
        let (modem, _sink, service) = service(SmsConfig::default());
        let records = service.on_notification("+CMTI: \"SM\",9").unwrap();
        assert!(records.is_empty());
        assert!(!modem.commands().iter().any(|c| c.starts_with("AT+CMGD")));
    }

    #[test]
    fn it_catches_up_on_stored_messages() {
        let (modem, sink, service) = service(SmsConfig::default());
        modem.store_sms("+1", "one");
        modem.store_sms("+2", "two");
        let records = service.catch_up_backlog().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(sink.0.lock().unwrap()[1].body, "two");
        assert!(modem.stored_slots().is_empty());
    }

    #[test]
    fn it_sends_a_message() {
        let (modem, _sink, service) = service(SmsConfig::default());
        let reference = service.send("+4412345", "hello there").unwrap();
        assert_eq!(reference, 1);
        let sent = modem.sent();
        assert_eq!(sent[0].number, "+4412345");
        assert_eq!(sent[0].body, "hello there");
        assert_eq!(service.counters().sent, 1);
        // text mode was switched on once
        service.send("+4412345", "again").unwrap();
        let text_mode = modem
            .commands()
            .iter()
            .filter(|c| *c == "AT+CMGF=1")
            .count();
        assert_eq!(text_mode, 1);
    }

    #[test]
    fn it_reports_a_refused_send() {
        let (modem, _sink, service) = service(SmsConfig::default());
        modem.script("AT+CMGS=\"+100\"", [Reply::raw("\r\n+CMS ERROR: 330\r\n")]);
        let err = service.send("+100", "hi").unwrap_err();
        assert!(matches!(err, ModemError::CommandFailed { .. }));
        assert_eq!(service.counters().send_failures, 1);
        assert!(modem.sent().is_empty());
    }

    #[test]
    fn it_validates_send_arguments() {
        let (_modem, _sink, service) = service(SmsConfig::default());
        assert!(matches!(
            service.send("12ab", "x"),
            Err(ModemError::InvalidArgument(_))
        ));
        assert!(matches!(
            service.send("+1", ""),
            Err(ModemError::InvalidArgument(_))
        ));
        assert!(matches!(
            service.send("+1", "bad\x1a"),
            Err(ModemError::InvalidArgument(_))
        ));
    }
}
