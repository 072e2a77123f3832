//! Command/response correlation over the one shared serial line.
//!
//! Every exchange happens inside a transaction that owns the line for its
//! whole flush, write and read sequence, so two callers can never interleave
//! bytes into each other's responses.

use std::borrow::Cow;
use std::sync::{Mutex, MutexGuard, PoisonError, TryLockError};
use std::thread;
use std::time::{Duration, Instant};

use flume::{Receiver, Sender, TrySendError};
use tracing::{debug, trace, warn};

use crate::config::Timings;
use crate::error::{ModemError, Result};
use crate::transport::Transport;
use crate::urc::{self, Urc, UrcScanner};

const URC_BACKLOG: usize = 64;

/// How a response ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminal {
    /// `\r\nOK\r\n`
    Ok,
    /// `\r\nERROR\r\n`, or a complete `+CME ERROR:`/`+CMS ERROR:` line
    Error,
    /// `\n> `, the modem waits for message text
    Prompt,
}

impl Terminal {
    fn locate(self, buf: &[u8]) -> Option<usize> {
        match self {
            Self::Ok => find(buf, b"\r\nOK\r\n"),
            Self::Prompt => find(buf, b"\n> "),
            Self::Error => [
                find(buf, b"\r\nERROR\r\n"),
                find_line(buf, b"+CME ERROR:"),
                find_line(buf, b"+CMS ERROR:"),
            ]
            .into_iter()
            .flatten()
            .min(),
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Position of `prefix` if the line it starts is complete.
fn find_line(haystack: &[u8], prefix: &[u8]) -> Option<usize> {
    let start = find(haystack, prefix)?;
    find(&haystack[start..], b"\r\n").map(|_| start)
}

/// Earliest terminal token in `buf`.
///
/// Once a stored message record (`+CMGR:`/`+CMGL:`) has started, message
/// text may itself read `OK`, `ERROR` or `> `. Only a final result on its
/// own line after the blank line that closes the last record counts then.
pub fn find_terminal(buf: &[u8]) -> Option<Terminal> {
    if let Some(start) = record_start(buf) {
        let records = &buf[start..];
        return [
            (find(records, b"\r\n\r\nOK\r\n"), Terminal::Ok),
            (find(records, b"\r\n\r\nERROR\r\n"), Terminal::Error),
        ]
        .into_iter()
        .filter_map(|(pos, t)| pos.map(|pos| (pos, t)))
        .min_by_key(|(pos, _)| *pos)
        .map(|(_, t)| t);
    }

    [Terminal::Ok, Terminal::Error, Terminal::Prompt]
        .into_iter()
        .filter_map(|t| t.locate(buf).map(|pos| (pos, t)))
        .min_by_key(|(pos, _)| *pos)
        .map(|(_, t)| t)
}

fn record_start(buf: &[u8]) -> Option<usize> {
    [find(buf, b"+CMGR:"), find(buf, b"+CMGL:")]
        .into_iter()
        .flatten()
        .min()
}

/// Everything collected for one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub command: String,
    /// Text as received, minus unsolicited pushes that were handed to the
    /// listener.
    pub raw: String,
    pub expected: Terminal,
    pub terminal: Option<Terminal>,
    /// The absolute deadline passed before a terminal token arrived.
    pub timed_out: bool,
    pub elapsed: Duration,
}

impl Response {
    /// A terminal token was captured before the deadline.
    pub fn success(&self) -> bool {
        self.terminal.is_some()
    }

    /// Bytes arrived but no terminal token did.
    pub fn partial(&self) -> bool {
        self.terminal.is_none() && self.lines().next().is_some()
    }

    /// The response ended with the terminator the caller asked for.
    pub fn matched(&self) -> bool {
        self.terminal == Some(self.expected)
    }

    /// Non-empty trimmed lines, without the echoed command.
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.raw
            .lines()
            .map(str::trim)
            .filter(move |line| !line.is_empty() && *line != self.command)
    }

    /// First line starting with `prefix`.
    pub fn line_with(&self, prefix: &str) -> Option<&str> {
        self.lines().find(|line| line.starts_with(prefix))
    }

    /// Turns an unmatched response into the matching error.
    pub fn require(self) -> Result<Self> {
        if self.matched() {
            Ok(self)
        } else if self.terminal.is_none() && self.timed_out {
            Err(ModemError::CommandTimeout {
                command: self.command,
                raw: self.raw,
            })
        } else {
            Err(ModemError::CommandFailed {
                command: self.command,
                raw: self.raw,
            })
        }
    }
}

/// Exclusive access to the line for the duration of a transaction.
pub struct Link<'a> {
    transport: &'a mut dyn Transport,
    scanner: &'a mut UrcScanner,
    timings: &'a Timings,
    urc_tx: &'a Sender<Urc>,
}

impl Link<'_> {
    /// Flush, send `command` with a line terminator and collect the answer.
    pub fn exchange(
        &mut self,
        command: &str,
        expected: Terminal,
        timeout: Duration,
    ) -> Result<Response> {
        let stale = self.transport.flush()?;
        self.reclaim(&stale);

        debug!(command = %redact(command), ?timeout, "sending AT command");
        self.transport.write_all(format!("{command}\r\n").as_bytes())?;
        let response = self.collect(command, expected, timeout)?;

        if response.matched() {
            debug!(
                command = %redact(command),
                raw = %response.raw.trim(),
                "AT command response"
            );
        } else {
            warn!(
                command = %redact(command),
                terminal = ?response.terminal,
                timed_out = response.timed_out,
                raw = %response.raw.trim(),
                "AT command did not complete as expected"
            );
        }
        Ok(response)
    }

    /// Reads until a terminal token, a quiet period after some payload, or
    /// the deadline. Does not write anything.
    pub fn collect(
        &mut self,
        command: &str,
        expected: Terminal,
        timeout: Duration,
    ) -> Result<Response> {
        let started = Instant::now();
        let deadline = started + timeout;
        let mut buf = Vec::new();
        let mut last_payload: Option<Instant> = None;
        let mut terminal = None;
        let mut timed_out = false;

        loop {
            let n = self.transport.read_available(&mut buf)?;
            let now = Instant::now();
            if n > 0 {
                if let Some(found) = find_terminal(&buf) {
                    thread::sleep(self.timings.trailing_grace);
                    self.transport.read_available(&mut buf)?;
                    terminal = Some(found);
                    break;
                }
                if has_payload(&buf, command) {
                    last_payload = Some(now);
                }
            } else if last_payload
                .is_some_and(|at| now.duration_since(at) >= self.timings.silence_window)
            {
                break;
            }

            if now >= deadline {
                timed_out = true;
                break;
            }
            thread::sleep(self.timings.read_poll.min(deadline - now));
        }

        let (raw, pushes) = urc::split_unsolicited(&String::from_utf8_lossy(&buf));
        self.forward(pushes);

        Ok(Response {
            command: command.to_owned(),
            raw,
            expected,
            terminal,
            timed_out,
            elapsed: started.elapsed(),
        })
    }

    /// Writes bytes without collecting anything.
    pub fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.transport.write_all(bytes)?;
        Ok(())
    }

    /// Collects whatever arrives during `duration`.
    pub fn listen(&mut self, duration: Duration) -> Result<String> {
        let deadline = Instant::now() + duration;
        let mut buf = Vec::new();
        loop {
            self.transport.read_available(&mut buf)?;
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep(self.timings.read_poll.min(deadline - now));
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// Takes everything currently buffered, pushes included.
    pub fn drain(&mut self) -> Result<Vec<u8>> {
        Ok(self.transport.flush()?)
    }

    /// Takes everything currently buffered and returns the pushes it
    /// completed. A line still being received is kept for the next call or
    /// for the stale flush of the next command.
    pub fn take_pushes(&mut self) -> Result<Vec<Urc>> {
        let bytes = self.transport.flush()?;
        let mut stray = Vec::new();
        let found = self.scanner.feed(&bytes, &mut stray);
        for line in stray {
            debug!(line, "ignoring unsolicited line");
        }
        Ok(found)
    }

    /// Settles bytes nobody asked for before a command goes out. They may
    /// finish a line an earlier [`Link::take_pushes`] started; whatever is
    /// still unterminated is closed off so the answer cannot absorb it.
    fn reclaim(&mut self, stale: &[u8]) {
        let mut stray = Vec::new();
        let mut found = self.scanner.feed(stale, &mut stray);
        found.extend(self.scanner.finish(&mut stray));
        for line in stray {
            trace!(line, "discarding stale line");
        }
        self.forward(found);
    }

    fn forward(&self, pushes: Vec<Urc>) {
        for push in pushes {
            debug!(?push, "salvaged unsolicited line");
            if let Err(TrySendError::Full(push)) = self.urc_tx.try_send(push) {
                warn!(?push, "unsolicited backlog full, dropping");
            }
        }
    }
}

/// Hides PIN arguments from logs.
fn redact(command: &str) -> Cow<'_, str> {
    match ["AT+CPIN=", "AT+CPWD="]
        .into_iter()
        .find(|prefix| command.starts_with(prefix))
    {
        Some(prefix) => Cow::Owned(format!("{prefix}<redacted>")),
        None => Cow::Borrowed(command),
    }
}

fn has_payload(buf: &[u8], command: &str) -> bool {
    let text = String::from_utf8_lossy(buf);
    let text = text.trim();
    !text.is_empty() && text != command
}

struct Line {
    transport: Box<dyn Transport>,
    scanner: UrcScanner,
}

/// Serializes every caller onto one [`Transport`].
pub struct Dispatcher {
    line: Mutex<Line>,
    timings: Timings,
    urc_tx: Sender<Urc>,
    urc_rx: Receiver<Urc>,
}

impl Dispatcher {
    pub fn new(transport: Box<dyn Transport>, timings: Timings) -> Self {
        let (urc_tx, urc_rx) = flume::bounded(URC_BACKLOG);
        Self {
            line: Mutex::new(Line {
                transport,
                scanner: UrcScanner::new(),
            }),
            timings,
            urc_tx,
            urc_rx,
        }
    }

    pub fn timings(&self) -> &Timings {
        &self.timings
    }

    /// Pushes salvaged from command responses, for the listener.
    pub fn unsolicited(&self) -> &Receiver<Urc> {
        &self.urc_rx
    }

    /// Runs `f` with the line held, blocking until it is free.
    pub fn transaction<R>(&self, f: impl FnOnce(&mut Link<'_>) -> Result<R>) -> Result<R> {
        let mut guard = self.line.lock().unwrap_or_else(PoisonError::into_inner);
        self.run(&mut guard, f)
    }

    /// Runs `f` only if the line is free right now.
    pub fn try_transaction<R>(
        &self,
        f: impl FnOnce(&mut Link<'_>) -> Result<R>,
    ) -> Option<Result<R>> {
        let mut guard = match self.line.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return None,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };
        Some(self.run(&mut guard, f))
    }

    fn run<R>(
        &self,
        guard: &mut MutexGuard<'_, Line>,
        f: impl FnOnce(&mut Link<'_>) -> Result<R>,
    ) -> Result<R> {
        let Line { transport, scanner } = &mut **guard;
        let mut link = Link {
            transport: transport.as_mut(),
            scanner,
            timings: &self.timings,
            urc_tx: &self.urc_tx,
        };
        f(&mut link)
    }

    /// Sends `command` and collects its response using the command-class
    /// timeout. Only I/O failures are errors, the response says whether the
    /// modem answered.
    pub fn execute(&self, command: &str) -> Result<Response> {
        self.execute_with(command, Terminal::Ok, None)
    }

    pub fn execute_with(
        &self,
        command: &str,
        expected: Terminal,
        timeout: Option<Duration>,
    ) -> Result<Response> {
        let timeout = timeout.unwrap_or_else(|| self.timings.timeouts.for_command(command));
        self.transaction(|link| link.exchange(command, expected, timeout))
    }

    /// [`Dispatcher::execute`], failing unless the modem answered `OK`.
    pub fn execute_ok(&self, command: &str) -> Result<Response> {
        self.execute(command)?.require()
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;
    use crate::transport::SimulatedModem;
    use crate::transport::simulated::Reply;

    fn dispatcher() -> (SimulatedModem, Dispatcher) {
        let modem = SimulatedModem::new();
        let timings = Timings::default().compressed(20);
        (modem.clone(), Dispatcher::new(Box::new(modem), timings))
    }

    #[test]
    fn it_finds_the_earliest_terminal() {
        assert_eq!(find_terminal(b"\r\n+CSQ: 1,0\r\n\r\nOK\r\n"), Some(Terminal::Ok));
        assert_eq!(find_terminal(b"\r\nERROR\r\n"), Some(Terminal::Error));
        assert_eq!(find_terminal(b"\r\n> "), Some(Terminal::Prompt));
        assert_eq!(find_terminal(b"\r\n+CME ERROR: 10\r\n"), Some(Terminal::Error));
        assert_eq!(find_terminal(b"\r\n+CME ERROR: 1"), None);
        assert_eq!(find_terminal(b"\r\nOK"), None);
    }

    #[test]
    fn it_reads_past_message_text_that_looks_final() {
        let header = "\r\n+CMGR: \"REC UNREAD\",\"+1\",\"\",\"ts\"\r\n";
        for body in ["OK", "ERROR", "> quoted", "+CMS ERROR: 500"] {
            let partial = format!("{header}{body}\r\n");
            assert_eq!(find_terminal(partial.as_bytes()), None, "{body}");
            let complete = format!("{partial}\r\nOK\r\n");
            assert_eq!(find_terminal(complete.as_bytes()), Some(Terminal::Ok), "{body}");
        }
        assert_eq!(
            find_terminal(b"\r\n+CMGL: 1,\"REC READ\",\"+1\",\"\",\"ts\"\r\nOK\r\n"),
            None
        );
        // an empty slot or an empty listing has no record to protect
        assert_eq!(find_terminal(b"\r\n\r\nOK\r\n"), Some(Terminal::Ok));
    }

    #[test]
    fn it_redacts_pins() {
        assert_eq!(redact("AT+CPIN=1234"), "AT+CPIN=<redacted>");
        assert_eq!(redact("AT+CSQ"), "AT+CSQ");
    }

    #[test]
    fn it_collects_a_complete_response() {
        let (_modem, dispatcher) = dispatcher();
        let response = dispatcher.execute("AT+CSQ").unwrap();
        assert!(response.success());
        assert!(response.matched());
        assert_eq!(response.line_with("+CSQ:"), Some("+CSQ: 15,99"));
        assert!(!response.lines().any(|line| line == "AT+CSQ"));
    }

    #[test]
    fn it_times_out_on_silence() {
        let (modem, dispatcher) = dispatcher();
        modem.script("AT+CBC", [Reply::Silent]);
        let response = dispatcher.execute("AT+CBC").unwrap();
        assert!(!response.success());
        assert!(response.timed_out);
        // echo only, no payload
        assert!(!response.partial());
        let timings = dispatcher.timings();
        let slack = Duration::from_millis(25);
        assert!(response.elapsed <= timings.timeouts.default + timings.trailing_grace + slack);
        assert!(matches!(
            response.require(),
            Err(ModemError::CommandTimeout { .. })
        ));
    }

    #[test]
    fn it_stops_after_a_quiet_period() {
        let (modem, dispatcher) = dispatcher();
        modem.script("AT+CPAS", [Reply::raw("\r\n+CPAS: 0\r\n")]);
        let response = dispatcher.execute("AT+CPAS").unwrap();
        assert!(!response.success());
        assert!(!response.timed_out);
        assert!(response.partial());
        assert!(matches!(
            response.require(),
            Err(ModemError::CommandFailed { .. })
        ));
    }

    #[test]
    fn it_discards_stale_bytes_before_sending() {
        let (modem, dispatcher) = dispatcher();
        modem.inject("\r\n+CSQ: 31,0\r\n\r\nOK\r\n");
        let response = dispatcher.execute("AT+CSQ").unwrap();
        assert_eq!(response.line_with("+CSQ:"), Some("+CSQ: 15,99"));
    }

    #[test]
    fn it_forwards_pushes_found_in_responses() {
        let (modem, dispatcher) = dispatcher();
        modem.script(
            "AT+CSQ",
            [Reply::raw("\r\n+CMTI: \"SM\",4\r\n\r\n+CSQ: 15,99\r\n\r\nOK\r\n")],
        );
        let response = dispatcher.execute_ok("AT+CSQ").unwrap();
        assert!(!response.raw.contains("CMTI"));
        assert_eq!(
            dispatcher.unsolicited().try_recv().unwrap(),
            Urc::MessageStored("+CMTI: \"SM\",4".into())
        );
    }

    #[test]
    fn it_joins_a_push_split_across_a_command() {
        let (modem, dispatcher) = dispatcher();
        modem.inject("\r\n+CMTI: \"SM\"");
        assert!(dispatcher.transaction(|link| link.take_pushes()).unwrap().is_empty());

        modem.inject(",12\r\n");
        dispatcher.execute_ok("AT").unwrap();
        assert_eq!(
            dispatcher.unsolicited().try_recv().unwrap(),
            Urc::MessageStored("+CMTI: \"SM\",12".into())
        );
    }

    #[test]
    fn it_flags_a_push_cut_off_by_a_command() {
        let (modem, dispatcher) = dispatcher();
        modem.inject("\r\n+CMTI: \"SM\",1");
        assert!(dispatcher.transaction(|link| link.take_pushes()).unwrap().is_empty());

        let response = dispatcher.execute_ok("AT+CSQ").unwrap();
        assert!(!response.raw.contains("CMTI"));
        assert_eq!(
            dispatcher.unsolicited().try_recv().unwrap(),
            Urc::Incomplete("+CMTI: \"SM\",1".into())
        );
    }

    #[test]
    fn it_refuses_a_busy_line_without_blocking() {
        let (_modem, dispatcher) = dispatcher();
        dispatcher
            .transaction(|_link| {
                assert!(dispatcher.try_transaction(|_| Ok(())).is_none());
                Ok(())
            })
            .unwrap();
        assert!(dispatcher.try_transaction(|_| Ok(())).is_some());
    }
}
