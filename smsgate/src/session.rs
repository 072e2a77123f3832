//! Bringing a modem from power-on to a registered, usable session.

use std::fmt;
use std::thread;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::dispatcher::{Dispatcher, Terminal};
use crate::error::{ModemError, Result};

/// Where the session is in its bring-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionPhase {
    Init,
    CommVerified,
    SimUnlocked,
    NetworkRegistered,
    Ready,
}

/// Network attachment as reported by `+CREG`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RegistrationState {
    Idle,
    Searching,
    RegisteredHome,
    RegisteredRoaming,
    Denied,
    Unknown,
}

impl RegistrationState {
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => Self::Idle,
            1 => Self::RegisteredHome,
            2 => Self::Searching,
            3 => Self::Denied,
            5 => Self::RegisteredRoaming,
            _ => Self::Unknown,
        }
    }

    pub fn is_registered(self) -> bool {
        matches!(self, Self::RegisteredHome | Self::RegisteredRoaming)
    }

    /// Reads the status out of either `+CREG: <n>,<stat>[,...]` or the pushed
    /// `+CREG: <stat>[,"lac","ci"]`.
    pub fn from_response(text: &str) -> Option<Self> {
        let line = text
            .lines()
            .map(str::trim)
            .find(|line| line.starts_with("+CREG:"))?;
        let fields: Vec<&str> = line["+CREG:".len()..].split(',').map(str::trim).collect();
        let stat = match fields.as_slice() {
            [stat] => *stat,
            [first, second, ..] if second.starts_with('"') => *first,
            [_, stat, ..] => *stat,
            [] => return None,
        };
        stat.parse().ok().map(Self::from_code)
    }
}

/// SIM lock state from `+CPIN`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SimState {
    Ready,
    PinRequired,
    PukRequired,
    NotInserted,
    Other(String),
}

impl SimState {
    fn parse(state: &str) -> Self {
        match state.trim() {
            "READY" => Self::Ready,
            "SIM PIN" => Self::PinRequired,
            "SIM PUK" => Self::PukRequired,
            "NOT INSERTED" => Self::NotInserted,
            other => Self::Other(other.to_owned()),
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::Ready => "READY".into(),
            Self::PinRequired => "SIM PIN".into(),
            Self::PukRequired => "SIM PUK".into(),
            Self::NotInserted => "NOT INSERTED".into(),
            Self::Other(other) => other.clone(),
        }
    }
}

impl fmt::Display for SimState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

/// What the engine currently knows about its session. Written by the
/// bring-up and by registration pushes, read by anyone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub phase: SessionPhase,
    pub registration: RegistrationState,
    pub sim: Option<SimState>,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self {
            phase: SessionPhase::Init,
            registration: RegistrationState::Unknown,
            sim: None,
        }
    }
}

fn valid_pin(pin: &str) -> bool {
    (4..=8).contains(&pin.len()) && pin.bytes().all(|b| b.is_ascii_digit())
}

/// The bring-up procedures, issued through one [`Dispatcher`].
pub struct Session<'a> {
    dispatcher: &'a Dispatcher,
    config: &'a SessionConfig,
}

impl<'a> Session<'a> {
    pub fn new(dispatcher: &'a Dispatcher, config: &'a SessionConfig) -> Self {
        Self { dispatcher, config }
    }

    fn ping(&self, timeout: Option<Duration>) -> Result<bool> {
        Ok(self
            .dispatcher
            .execute_with("AT", Terminal::Ok, timeout)?
            .matched())
    }

    /// Fires `count` pings `interval` apart, then listens for any `OK`.
    fn burst(&self, count: u32, interval: Duration) -> Result<bool> {
        let listen = self.dispatcher.timings().burst_listen;
        self.dispatcher.transaction(|link| {
            link.drain()?;
            for _ in 0..count {
                link.send_raw(b"AT\r\n")?;
                thread::sleep(interval);
            }
            Ok(link.listen(listen)?.contains("OK"))
        })
    }

    /// Pings until the modem answers, escalating from a plain ping to a
    /// slower one, then a wake burst, then an autobaud burst.
    pub fn verify_communication(&self) -> Result<()> {
        let timings = self.dispatcher.timings();
        let attempts = self.config.verify_attempts.max(1);

        for attempt in 1..=attempts {
            if self.ping(None)? {
                info!(attempt, "modem answered");
                return Ok(());
            }
            debug!(attempt, "no answer, retrying with slower timing");
            if self.ping(Some(timings.slow_ping_timeout))? {
                info!(attempt, "modem answered slow ping");
                return Ok(());
            }
            debug!(attempt, "still silent, sending wake burst");
            if self.burst(self.config.wake_pings, timings.wake_ping_interval)? {
                info!(attempt, "modem woke up");
                return Ok(());
            }
            debug!(attempt, "still silent, sending autobaud burst");
            if self.burst(self.config.autobaud_pings, timings.autobaud_ping_interval)? {
                info!(attempt, "modem locked onto baud rate");
                return Ok(());
            }
            if attempt < attempts {
                warn!(attempt, "modem did not answer, retrying");
                thread::sleep(timings.verify_retry);
            }
        }

        Err(ModemError::NoCommunication { attempts })
    }

    pub fn disable_echo(&self) {
        if let Err(e) = self.dispatcher.execute_ok("ATE0") {
            warn!("failed to disable echo: {e}");
        }
    }

    pub fn sim_state(&self) -> Result<SimState> {
        let response = self.dispatcher.execute("AT+CPIN?")?;
        if let Some(line) = response.line_with("+CPIN:") {
            return Ok(SimState::parse(&line["+CPIN:".len()..]));
        }
        if response.line_with("+CME ERROR: 10").is_some() {
            return Ok(SimState::NotInserted);
        }
        Err(ModemError::Parse {
            what: "SIM state",
            raw: response.raw,
        })
    }

    /// Submits `pin` if the SIM asks for it. A rejected PIN is final.
    pub fn unlock(&self, pin: Option<&str>) -> Result<()> {
        match self.sim_state()? {
            SimState::Ready => {
                debug!("SIM already unlocked");
                Ok(())
            }
            SimState::PinRequired => {
                let pin = pin.ok_or(ModemError::PinRequired)?;
                info!("submitting SIM PIN");
                let response = self.dispatcher.execute(&format!("AT+CPIN={pin}"))?;
                if response.terminal == Some(Terminal::Error) {
                    return Err(ModemError::PinRejected { raw: response.raw });
                }
                response.require()?;

                thread::sleep(self.dispatcher.timings().pin_settle);
                match self.sim_state()? {
                    SimState::Ready => {
                        info!("SIM unlocked");
                        Ok(())
                    }
                    other => Err(ModemError::SimLocked {
                        state: other.describe(),
                    }),
                }
            }
            other => Err(ModemError::SimLocked {
                state: other.describe(),
            }),
        }
    }

    /// Drives registration to a terminal state. `on_poll` sees every polled
    /// state.
    pub fn register_network(
        &self,
        mut on_poll: impl FnMut(RegistrationState),
    ) -> Result<RegistrationState> {
        let timings = self.dispatcher.timings();

        if let Err(e) = self.dispatcher.execute_ok("AT+CFUN=1") {
            warn!("failed to set full functionality: {e}");
        }
        match self.dispatcher.execute_ok("AT+CREG=1") {
            Ok(_) => thread::sleep(timings.radio_settle),
            Err(e) => warn!("failed to enable registration notices: {e}"),
        }
        let selection = self.dispatcher.execute("AT+COPS?")?;
        if !selection.raw.contains("+COPS: 0") {
            info!("requesting automatic operator selection");
            if let Err(e) = self.dispatcher.execute_ok("AT+COPS=0") {
                warn!("automatic operator selection failed: {e}");
            }
        }

        let attempts = self.config.registration_attempts;
        let mut idle_seen = 0;
        let mut last = RegistrationState::Unknown;

        for attempt in 1..=attempts {
            let response = self.dispatcher.execute("AT+CREG?")?;
            let state = RegistrationState::from_response(&response.raw)
                .unwrap_or(RegistrationState::Unknown);
            last = state;
            on_poll(state);
            debug!(attempt, attempts, ?state, "registration poll");

            match state {
                RegistrationState::RegisteredHome | RegistrationState::RegisteredRoaming => {
                    info!(?state, attempt, "registered on network");
                    return Ok(state);
                }
                RegistrationState::Denied => {
                    return Err(ModemError::RegistrationDenied { raw: response.raw });
                }
                RegistrationState::Idle => {
                    idle_seen += 1;
                    if idle_seen < self.config.idle_escalation_after {
                        debug!("modem not searching, re-enabling registration");
                        self.soft_retry("AT+CREG=1");
                        thread::sleep(timings.registration_idle_retry);
                    } else {
                        warn!(idle_seen, "modem still not searching, forcing selection");
                        if let Err(e) = self.dispatcher.execute_with(
                            "AT+COPS=0",
                            Terminal::Ok,
                            Some(timings.forced_selection_timeout),
                        ) {
                            warn!("forced operator selection failed: {e}");
                        }
                        self.soft_retry("AT+CGREG=1");
                        thread::sleep(timings.registration_escalated_retry);
                    }
                }
                RegistrationState::Searching => {
                    thread::sleep(timings.registration_searching);
                }
                RegistrationState::Unknown => {
                    thread::sleep(timings.registration_unknown);
                }
            }
        }

        Err(ModemError::RegistrationExhausted { attempts, last })
    }

    fn soft_retry(&self, command: &str) {
        if let Err(e) = self.dispatcher.execute_ok(command) {
            debug!("{command} failed: {e}");
        }
    }

    /// Changes the SIM PIN from `old` to `new`.
    pub fn change_pin(&self, old: &str, new: &str) -> Result<()> {
        if !valid_pin(new) {
            return Err(ModemError::InvalidArgument(
                "PIN must be 4 to 8 digits".into(),
            ));
        }
        let response = self
            .dispatcher
            .execute(&format!("AT+CPWD=\"SC\",\"{old}\",\"{new}\""))?;
        if response.terminal == Some(Terminal::Error) {
            return Err(ModemError::PinRejected { raw: response.raw });
        }
        response.require()?;
        info!("SIM PIN changed");
        Ok(())
    }

    /// Full functionality reset; the modem reboots and needs the whole
    /// bring-up again afterwards.
    pub fn reboot(&self) -> Result<()> {
        self.dispatcher.execute_ok("AT+CFUN=1,1")?;
        info!("modem rebooting");
        thread::sleep(self.dispatcher.timings().restart_delay);
        Ok(())
    }
}
