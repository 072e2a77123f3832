//! The one object every caller shares: owns the dispatcher (and through it
//! the transport), the telemetry cache, the session status and the
//! background tasks.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tracing::{info, warn};

use crate::config::Config;
use crate::dispatcher::{Dispatcher, Response};
use crate::error::{ModemError, Result};
use crate::session::{Session, SessionPhase, SessionStatus, SimState};
use crate::sink::{EventSink, LogLevel, SystemLog};
use crate::sms::listener::Listener;
use crate::sms::{SmsCounters, SmsRecord, SmsService};
use crate::state::State;
use crate::tasks::{self, ReportSources, Task};
use crate::telemetry::operator::OperatorSample;
use crate::telemetry::signal::SignalSample;
use crate::telemetry::{BatteryStatus, Telemetry, TelemetrySnapshot};
use crate::transport::{self, Transport};

const DIAGNOSTIC_COMMANDS: [&str; 5] = ["AT", "AT+CBC", "AT+CPAS", "AT+CSQ", "AT+CREG?"];

/// Read-only view of everything the engine tracks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineSnapshot {
    pub session: SessionStatus,
    pub telemetry: TelemetrySnapshot,
    pub sms: SmsCounters,
    pub listening: bool,
}

#[derive(Default)]
struct Tasks {
    listener: Option<Task>,
    battery: Option<Task>,
    report: Option<Task>,
}

pub struct Engine {
    config: Config,
    dispatcher: Arc<Dispatcher>,
    sms: Arc<SmsService>,
    telemetry: Arc<Telemetry>,
    status: State<SessionStatus>,
    sink: Arc<dyn EventSink>,
    pin: Mutex<Option<String>>,
    tasks: Mutex<Tasks>,
}

impl Engine {
    /// Opens the configured transport. Failing to reach the serial backend
    /// is fatal; nothing here retries.
    pub fn connect(config: Config, sink: Arc<dyn EventSink>) -> Result<Self> {
        let transport = transport::open(&config.transport).inspect_err(|e| {
            sink.system_log(&SystemLog::new(
                LogLevel::Critical,
                "engine",
                format!("cannot open modem transport: {e}"),
            ));
        })?;
        info!(transport = ?config.transport, "modem transport open");
        Ok(Self::with_transport(config, transport, sink))
    }

    pub fn with_transport(
        config: Config,
        transport: Box<dyn Transport>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let dispatcher = Arc::new(Dispatcher::new(transport, config.timings.clone()));
        let sms = Arc::new(SmsService::new(
            dispatcher.clone(),
            config.sms.clone(),
            sink.clone(),
        ));
        let telemetry = Arc::new(Telemetry::new(
            dispatcher.clone(),
            config.telemetry.clone(),
            sink.clone(),
        ));
        let pin = Mutex::new(config.session.pin.clone());

        Self {
            config,
            dispatcher,
            sms,
            telemetry,
            status: State::default(),
            sink,
            pin,
            tasks: Mutex::new(Tasks::default()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    fn tasks(&self) -> MutexGuard<'_, Tasks> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current_pin(&self) -> Option<String> {
        self.pin
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_phase(&self, phase: SessionPhase) {
        self.status.write(|s| s.phase = phase);
        info!(?phase, "session phase");
    }

    fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.sink
            .system_log(&SystemLog::new(level, "engine", message));
    }

    /// Runs the whole bring-up: communication, echo off, SIM unlock,
    /// registration and SMS setup. Each failure is reported and returned.
    pub fn initialize(&self) -> Result<()> {
        let result = self.bring_up();
        match &result {
            Ok(()) => self.log(LogLevel::Info, "modem initialized"),
            Err(e) => self.log(LogLevel::Error, format!("modem initialization failed: {e}")),
        }
        result
    }

    fn bring_up(&self) -> Result<()> {
        self.set_phase(SessionPhase::Init);
        let session = Session::new(&self.dispatcher, &self.config.session);

        session.verify_communication()?;
        session.disable_echo();
        self.set_phase(SessionPhase::CommVerified);

        let pin = self.current_pin();
        let unlocked = session.unlock(pin.as_deref());
        let sim = match &unlocked {
            Ok(()) => SimState::Ready,
            Err(ModemError::PinRequired | ModemError::PinRejected { .. }) => SimState::PinRequired,
            Err(ModemError::SimLocked { state }) => SimState::Other(state.clone()),
            Err(_) => SimState::Other("unknown".into()),
        };
        self.status.write(|s| s.sim = Some(sim));
        unlocked?;
        self.set_phase(SessionPhase::SimUnlocked);

        session.register_network(|state| self.status.write(|s| s.registration = state))?;
        self.set_phase(SessionPhase::NetworkRegistered);

        self.sms.prepare()?;
        self.set_phase(SessionPhase::Ready);
        Ok(())
    }

    fn require_ready(&self) -> Result<()> {
        if self.status.read(|s| s.phase) == SessionPhase::Ready {
            Ok(())
        } else {
            Err(ModemError::NotInitialized)
        }
    }

    /// Starts the SMS listener. Does nothing if it already runs.
    pub fn start_listening(&self) -> Result<()> {
        self.require_ready()?;
        let mut tasks = self.tasks();
        if tasks.listener.as_ref().is_some_and(Task::is_running) {
            return Ok(());
        }
        let listener = Listener::new(
            self.dispatcher.clone(),
            self.sms.clone(),
            self.status.clone(),
            self.sink.clone(),
        );
        tasks.listener = Some(tasks::start_listener(listener)?);
        Ok(())
    }

    /// Stops the listener, returning whether it was running.
    pub fn stop_listening(&self) -> bool {
        let task = self.tasks().listener.take();
        match task {
            Some(task) => {
                let running = task.is_running();
                task.stop(self.config.timings.task_join);
                running
            }
            None => false,
        }
    }

    pub fn is_listening(&self) -> bool {
        self.tasks().listener.as_ref().is_some_and(Task::is_running)
    }

    pub fn start_battery_poller(&self) -> Result<()> {
        let mut tasks = self.tasks();
        if tasks.battery.as_ref().is_some_and(Task::is_running) {
            return Ok(());
        }
        tasks.battery = Some(tasks::start_battery_poller(
            self.telemetry.clone(),
            self.config.telemetry.battery_poll_interval,
        )?);
        Ok(())
    }

    /// Starts periodic reports if an interval is configured.
    pub fn start_report_scheduler(&self) -> Result<()> {
        let mut tasks = self.tasks();
        if tasks.report.as_ref().is_some_and(Task::is_running) {
            return Ok(());
        }
        tasks.report = tasks::start_report_scheduler(self.report_sources(), &self.config.report)?;
        Ok(())
    }

    fn report_sources(&self) -> ReportSources {
        ReportSources {
            telemetry: self.telemetry.clone(),
            sms: self.sms.clone(),
            status: self.status.clone(),
            sink: self.sink.clone(),
        }
    }

    /// Stops every background task, each with a bounded wait.
    pub fn shutdown(&self) {
        let wait = self.config.timings.task_join;
        let Tasks {
            listener,
            battery,
            report,
        } = std::mem::take(&mut *self.tasks());
        for task in [listener, battery, report].into_iter().flatten() {
            task.stop(wait);
        }
        info!("engine stopped");
    }

    pub fn send_sms(&self, number: &str, text: &str) -> Result<u32> {
        self.require_ready()?;
        self.sms.send(number, text)
    }

    pub fn list_sms(&self) -> Result<Vec<SmsRecord>> {
        self.sms.list_all()
    }

    pub fn delete_sms(&self, slot: u32) -> Result<()> {
        self.sms.delete_slot(slot)
    }

    pub fn delete_all_sms(&self) -> Result<()> {
        self.sms.delete_all()
    }

    pub fn get_battery_status(&self) -> Result<BatteryStatus> {
        self.telemetry.sample_battery()
    }

    pub fn get_signal(&self) -> Result<SignalSample> {
        self.telemetry.sample_signal()
    }

    pub fn get_operator(&self) -> Result<OperatorSample> {
        self.telemetry.sample_operator()
    }

    pub fn sim_status(&self) -> Result<SimState> {
        let state = Session::new(&self.dispatcher, &self.config.session).sim_state()?;
        self.status.write(|s| s.sim = Some(state.clone()));
        Ok(state)
    }

    /// Changes the SIM PIN and remembers the new one for later unlocks.
    pub fn set_pin(&self, new_pin: &str) -> Result<()> {
        let old = self.current_pin().ok_or_else(|| {
            ModemError::InvalidArgument("no current PIN is configured".into())
        })?;
        Session::new(&self.dispatcher, &self.config.session).change_pin(&old, new_pin)?;
        *self.pin.lock().unwrap_or_else(PoisonError::into_inner) = Some(new_pin.to_owned());
        self.log(LogLevel::Info, "SIM PIN changed");
        Ok(())
    }

    /// Reboots the modem and runs the bring-up again. A running listener
    /// is stopped first and restarted afterwards.
    pub fn restart_modem(&self) -> Result<()> {
        let was_listening = self.stop_listening();
        self.log(LogLevel::Warning, "restarting modem");

        Session::new(&self.dispatcher, &self.config.session).reboot()?;
        self.sms.reset_session();
        self.initialize()?;

        if was_listening {
            self.start_listening()?;
        }
        Ok(())
    }

    /// Basic liveness commands with their raw answers.
    pub fn diagnostics(&self) -> Result<Vec<Response>> {
        DIAGNOSTIC_COMMANDS
            .into_iter()
            .map(|command| self.dispatcher.execute(command))
            .collect()
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            session: self.status.read(Clone::clone),
            telemetry: self.telemetry.snapshot(),
            sms: self.sms.counters(),
            listening: self.is_listening(),
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let tasks = std::mem::take(&mut *self.tasks());
        if tasks.listener.is_some() || tasks.battery.is_some() || tasks.report.is_some() {
            warn!("engine dropped with tasks running, signalling them to stop");
        }
    }
}
