//! An in-process model of a SIM800-class modem.
//!
//! Good enough to run the whole engine without hardware: it answers the AT
//! commands the engine issues, keeps SMS slots, accepts outgoing messages
//! and can push unsolicited lines. Individual commands can be scripted to
//! reproduce odd firmware behaviour.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use super::Transport;

const CTRL_Z: u8 = 0x1a;
const ESC: u8 = 0x1b;

/// A scripted answer to one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Bytes sent back verbatim.
    Raw(String),
    /// No answer at all.
    Silent,
}

impl Reply {
    /// `body` lines followed by `OK`, framed the way the modem frames them.
    pub fn ok(body: &str) -> Self {
        if body.is_empty() {
            Self::Raw("\r\nOK\r\n".into())
        } else {
            Self::Raw(format!("\r\n{body}\r\n\r\nOK\r\n"))
        }
    }

    pub fn error() -> Self {
        Self::Raw("\r\nERROR\r\n".into())
    }

    pub fn raw(text: &str) -> Self {
        Self::Raw(text.into())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSms {
    pub sender: String,
    pub timestamp: String,
    pub body: String,
    pub read: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentSms {
    pub number: String,
    pub body: String,
}

#[derive(Debug)]
struct Chunk {
    ready_at: Instant,
    bytes: VecDeque<u8>,
}

#[derive(Debug)]
struct Model {
    outbox: VecDeque<Chunk>,
    line: Vec<u8>,
    composing: Option<(String, Vec<u8>)>,
    echo: bool,
    log: Vec<String>,
    scripts: HashMap<String, VecDeque<Reply>>,
    silent_for: u32,
    pin: Option<String>,
    sim_unlocked: bool,
    puk_locked: bool,
    registration: VecDeque<u8>,
    operator_mode: u8,
    messages: BTreeMap<u32, StoredSms>,
    sent: Vec<SentSms>,
    next_reference: u32,
    read_chunk: Option<usize>,
    latency: Duration,
}

impl Default for Model {
    fn default() -> Self {
        Self {
            outbox: VecDeque::new(),
            line: Vec::new(),
            composing: None,
            echo: true,
            log: Vec::new(),
            scripts: HashMap::new(),
            silent_for: 0,
            pin: None,
            sim_unlocked: true,
            puk_locked: false,
            registration: VecDeque::from([1]),
            operator_mode: 0,
            messages: BTreeMap::new(),
            sent: Vec::new(),
            next_reference: 1,
            read_chunk: None,
            latency: Duration::ZERO,
        }
    }
}

/// Cloneable handle to one simulated modem. Every clone sees the same
/// modem, so tests keep one handle while the engine owns another.
#[derive(Debug, Clone, Default)]
pub struct SimulatedModem {
    model: Arc<Mutex<Model>>,
}

impl SimulatedModem {
    pub fn new() -> Self {
        Self::default()
    }

    fn model(&self) -> MutexGuard<'_, Model> {
        self.model.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Answers `command` with `replies` in order. The last reply keeps
    /// being used once the others were consumed.
    pub fn script(&self, command: &str, replies: impl IntoIterator<Item = Reply>) {
        self.model()
            .scripts
            .insert(command.to_owned(), replies.into_iter().collect());
    }

    /// Registration status codes returned by successive `AT+CREG?` polls.
    /// The last code sticks.
    pub fn set_registration(&self, codes: impl IntoIterator<Item = u8>) {
        self.model().registration = codes.into_iter().collect();
    }

    /// Locks the SIM behind `pin`.
    pub fn require_pin(&self, pin: &str) {
        let mut model = self.model();
        model.pin = Some(pin.to_owned());
        model.sim_unlocked = false;
    }

    pub fn lock_puk(&self) {
        self.model().puk_locked = true;
    }

    /// Ignores the next `count` commands, like a modem still booting.
    pub fn set_silent(&self, count: u32) {
        self.model().silent_for = count;
    }

    /// Hands out at most `size` bytes per read.
    pub fn set_read_chunk(&self, size: Option<usize>) {
        self.model().read_chunk = size;
    }

    /// Delays every answer by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.model().latency = latency;
    }

    /// Stores a message without notifying the host.
    pub fn store_sms(&self, sender: &str, body: &str) -> u32 {
        let mut model = self.model();
        let slot = (1..)
            .find(|slot| !model.messages.contains_key(slot))
            .unwrap_or(1);
        model.messages.insert(
            slot,
            StoredSms {
                sender: sender.to_owned(),
                timestamp: now_timestamp(),
                body: body.to_owned(),
                read: false,
            },
        );
        slot
    }

    /// Stores a message and pushes the `+CMTI` notice for it.
    pub fn deliver_sms(&self, sender: &str, body: &str) -> u32 {
        let slot = self.store_sms(sender, body);
        self.inject(&format!("\r\n+CMTI: \"SM\",{slot}\r\n"));
        slot
    }

    /// Pushes a message straight to the host, as `AT+CNMI=2,2` does.
    pub fn deliver_direct(&self, sender: &str, body: &str) {
        let timestamp = now_timestamp();
        self.inject(&format!("\r\n+CMT: \"{sender}\",\"\",\"{timestamp}\"\r\n{body}\r\n"));
    }

    /// Queues unsolicited bytes.
    pub fn inject(&self, text: &str) {
        self.model().emit(text);
    }

    /// Every command received so far, without line terminators.
    pub fn commands(&self) -> Vec<String> {
        self.model().log.clone()
    }

    pub fn clear_commands(&self) {
        self.model().log.clear();
    }

    pub fn stored_slots(&self) -> Vec<u32> {
        self.model().messages.keys().copied().collect()
    }

    pub fn sent(&self) -> Vec<SentSms> {
        self.model().sent.clone()
    }

    pub fn pin(&self) -> Option<String> {
        self.model().pin.clone()
    }
}

impl Model {
    fn emit(&mut self, text: &str) {
        self.outbox.push_back(Chunk {
            ready_at: Instant::now() + self.latency,
            bytes: text.bytes().collect(),
        });
    }

    fn ok(&mut self, body: &str) {
        if let Reply::Raw(text) = Reply::ok(body) {
            self.emit(&text);
        }
    }

    fn error(&mut self) {
        self.emit("\r\nERROR\r\n");
    }

    fn receive(&mut self, byte: u8) {
        if let Some((_, body)) = self.composing.as_mut() {
            match byte {
                CTRL_Z => self.finish_send(),
                ESC => {
                    self.composing = None;
                    self.ok("");
                }
                // the line feed that followed the command itself
                b'\n' if body.is_empty() => {}
                _ => body.push(byte),
            }
            return;
        }
        if byte == ESC {
            return;
        }

        if byte == b'\r' || byte == b'\n' {
            if !self.line.is_empty() {
                let line = String::from_utf8_lossy(&self.line).into_owned();
                self.line.clear();
                self.handle(line.trim());
            }
        } else {
            self.line.push(byte);
        }
    }

    fn finish_send(&mut self) {
        let Some((number, body)) = self.composing.take() else {
            return;
        };
        let reference = self.next_reference;
        self.next_reference += 1;
        self.sent.push(SentSms {
            number,
            body: String::from_utf8_lossy(&body).into_owned(),
        });
        self.ok(&format!("+CMGS: {reference}"));
    }

    fn handle(&mut self, command: &str) {
        self.log.push(command.to_owned());
        if self.silent_for > 0 {
            self.silent_for -= 1;
            return;
        }
        if self.echo {
            self.emit(&format!("{command}\r"));
        }

        if let Some(queue) = self.scripts.get_mut(command) {
            let reply = if queue.len() > 1 {
                queue.pop_front()
            } else {
                queue.front().cloned()
            };
            if let Some(Reply::Raw(text)) = reply {
                self.emit(&text);
            }
            return;
        }

        self.builtin(command);
    }

    fn builtin(&mut self, command: &str) {
        match command {
            "AT" | "ATE1" => self.ok(""),
            "ATE0" => {
                self.echo = false;
                self.ok("");
            }
            "AT+CPIN?" => {
                let state = if self.puk_locked {
                    "SIM PUK"
                } else if self.sim_unlocked {
                    "READY"
                } else {
                    "SIM PIN"
                };
                self.ok(&format!("+CPIN: {state}"));
            }
            "AT+CREG?" => {
                let stat = if self.registration.len() > 1 {
                    self.registration.pop_front()
                } else {
                    self.registration.front().copied()
                }
                .unwrap_or(0);
                self.ok(&format!("+CREG: 1,{stat}"));
            }
            "AT+COPS?" => {
                let answer = if self.operator_mode == 0 {
                    "+COPS: 0,0,\"SIMNET\"".to_owned()
                } else {
                    format!("+COPS: {}", self.operator_mode)
                };
                self.ok(&answer);
            }
            "AT+CBC" => self.ok("+CBC: 0,87,4156"),
            "AT+CSQ" => self.ok("+CSQ: 15,99"),
            "AT+CPAS" => self.ok("+CPAS: 0"),
            "AT+CMGL=\"ALL\"" => self.list(),
            "AT+CMGDA=\"DEL ALL\"" => {
                self.messages.clear();
                self.ok("");
            }
            "AT+CFUN=1,1" => {
                self.ok("");
                self.echo = true;
                self.sim_unlocked = self.pin.is_none();
            }
            _ => self.builtin_with_args(command),
        }
    }

    fn builtin_with_args(&mut self, command: &str) {
        if let Some(pin) = command.strip_prefix("AT+CPIN=") {
            let pin = pin.trim_matches('"');
            if self.pin.as_deref() == Some(pin) && !self.puk_locked {
                self.sim_unlocked = true;
                self.ok("");
            } else {
                self.error();
            }
        } else if let Some(args) = command.strip_prefix("AT+CPWD=") {
            let fields: Vec<&str> = args.split(',').map(|f| f.trim_matches('"')).collect();
            let current = self.pin.clone();
            match (fields.as_slice(), current.as_deref()) {
                (["SC", old, new], Some(current)) if *old == current => {
                    self.pin = Some((*new).to_owned());
                    self.ok("");
                }
                _ => self.error(),
            }
        } else if let Some(slot) = command.strip_prefix("AT+CMGR=") {
            match slot.parse::<u32>().ok().and_then(|s| self.messages.get_mut(&s)) {
                Some(sms) => {
                    let status = if sms.read { "REC READ" } else { "REC UNREAD" };
                    sms.read = true;
                    let answer = format!(
                        "+CMGR: \"{status}\",\"{}\",\"\",\"{}\"\r\n{}",
                        sms.sender, sms.timestamp, sms.body
                    );
                    self.ok(&answer);
                }
                None => self.ok(""),
            }
        } else if let Some(slot) = command.strip_prefix("AT+CMGD=") {
            match slot.split(',').next().and_then(|s| s.parse::<u32>().ok()) {
                Some(slot) => {
                    self.messages.remove(&slot);
                    self.ok("");
                }
                None => self.error(),
            }
        } else if let Some(number) = command.strip_prefix("AT+CMGS=") {
            self.composing = Some((number.trim_matches('"').to_owned(), Vec::new()));
            self.emit("\r\n> ");
        } else if let Some(mode) = command.strip_prefix("AT+COPS=") {
            match mode.split(',').next().and_then(|m| m.parse::<u8>().ok()) {
                Some(mode) => {
                    self.operator_mode = mode;
                    self.ok("");
                }
                None => self.error(),
            }
        } else if ["AT+CREG=", "AT+CGREG=", "AT+CMGF=", "AT+CNMI=", "AT+CFUN=", "AT+CMEE="]
            .iter()
            .any(|prefix| command.starts_with(prefix))
        {
            self.ok("");
        } else {
            self.error();
        }
    }

    fn list(&mut self) {
        let mut answer = String::new();
        for (slot, sms) in &mut self.messages {
            let status = if sms.read { "REC READ" } else { "REC UNREAD" };
            sms.read = true;
            answer.push_str(&format!(
                "\r\n+CMGL: {slot},\"{status}\",\"{}\",\"\",\"{}\"\r\n{}",
                sms.sender, sms.timestamp, sms.body
            ));
        }
        answer.push_str("\r\n\r\nOK\r\n");
        self.emit(&answer);
    }
}

fn now_timestamp() -> String {
    chrono::Utc::now().format("%y/%m/%d,%H:%M:%S+00").to_string()
}

impl Transport for SimulatedModem {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        let mut model = self.model();
        for &byte in bytes {
            model.receive(byte);
        }
        Ok(())
    }

    fn read_available(&mut self, buf: &mut Vec<u8>) -> io::Result<usize> {
        let mut model = self.model();
        let limit = model.read_chunk.unwrap_or(usize::MAX);
        let now = Instant::now();
        let mut n = 0;
        while n < limit {
            let Some(chunk) = model.outbox.front_mut() else {
                break;
            };
            if chunk.ready_at > now {
                break;
            }
            while n < limit {
                match chunk.bytes.pop_front() {
                    Some(byte) => {
                        buf.push(byte);
                        n += 1;
                    }
                    None => break,
                }
            }
            if chunk.bytes.is_empty() {
                model.outbox.pop_front();
            }
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(modem: &mut SimulatedModem, command: &str) -> String {
        modem.write_all(format!("{command}\r\n").as_bytes()).unwrap();
        String::from_utf8(modem.flush().unwrap()).unwrap()
    }

    #[test]
    fn it_echoes_until_echo_is_disabled() {
        let mut modem = SimulatedModem::new();
        assert_eq!(roundtrip(&mut modem, "AT"), "AT\r\r\nOK\r\n");
        roundtrip(&mut modem, "ATE0");
        assert_eq!(roundtrip(&mut modem, "AT"), "\r\nOK\r\n");
    }

    #[test]
    fn it_has_nothing_to_read_after_flush() {
        let mut modem = SimulatedModem::new();
        modem.deliver_sms("+100", "hello");
        modem.write_all(b"AT+CSQ\r\n").unwrap();
        assert!(!modem.flush().unwrap().is_empty());
        let mut buf = Vec::new();
        assert_eq!(modem.read_available(&mut buf).unwrap(), 0);
        assert!(buf.is_empty());
    }

    #[test]
    fn it_hands_out_reads_in_chunks() {
        let mut modem = SimulatedModem::new();
        modem.set_read_chunk(Some(3));
        modem.write_all(b"ATE0\r\n").unwrap();
        let mut buf = Vec::new();
        assert_eq!(modem.read_available(&mut buf).unwrap(), 3);
        assert_eq!(buf, b"ATE");
    }

    #[test]
    fn it_accepts_an_sms_after_the_prompt() {
        let mut modem = SimulatedModem::new();
        assert!(roundtrip(&mut modem, "AT+CMGS=\"+4411\"").ends_with("\r\n> "));
        modem.write_all(b"hi there\x1a").unwrap();
        let answer = String::from_utf8(modem.flush().unwrap()).unwrap();
        assert_eq!(answer, "\r\n+CMGS: 1\r\n\r\nOK\r\n");
        assert_eq!(
            modem.sent(),
            [SentSms {
                number: "+4411".into(),
                body: "hi there".into()
            }]
        );
    }

    #[test]
    fn it_replays_the_last_scripted_reply() {
        let mut modem = SimulatedModem::new();
        modem.script("AT+CSQ", [Reply::ok("+CSQ: 1,0"), Reply::error()]);
        roundtrip(&mut modem, "ATE0");
        assert!(roundtrip(&mut modem, "AT+CSQ").contains("+CSQ: 1,0"));
        assert!(roundtrip(&mut modem, "AT+CSQ").contains("ERROR"));
        assert!(roundtrip(&mut modem, "AT+CSQ").contains("ERROR"));
    }

    #[test]
    fn it_changes_the_pin_only_with_the_old_one() {
        let mut modem = SimulatedModem::new();
        modem.require_pin("1111");
        roundtrip(&mut modem, "ATE0");
        assert!(roundtrip(&mut modem, "AT+CPWD=\"SC\",\"0000\",\"2222\"").contains("ERROR"));
        assert!(roundtrip(&mut modem, "AT+CPWD=\"SC\",\"1111\",\"2222\"").contains("OK"));
        assert_eq!(modem.pin().as_deref(), Some("2222"));
    }
}
