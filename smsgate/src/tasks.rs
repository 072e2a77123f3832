//! Long-running background threads and how they are stopped.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::config::ReportConfig;
use crate::error::Result;
use crate::report::StatusReport;
use crate::session::SessionStatus;
use crate::sink::{EventSink, LogLevel, SystemLog};
use crate::sms::SmsService;
use crate::sms::listener::Listener;
use crate::state::State;
use crate::telemetry::Telemetry;

const STOP_POLL: Duration = Duration::from_millis(10);

/// A named thread that runs until its flag is cleared. Threads are never
/// killed; they check the flag every iteration.
pub struct Task {
    name: String,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Task {
    pub fn spawn(
        name: &str,
        body: impl FnOnce(Arc<AtomicBool>) + Send + 'static,
    ) -> Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let handle = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || body(flag))?;
        debug!(task = name, "task spawned");

        Ok(Self {
            name: name.to_owned(),
            running,
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
            && self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Clears the run flag and waits up to `wait` for the thread to exit.
    /// Returns whether it did; a thread still busy is left detached.
    pub fn stop(mut self, wait: Duration) -> bool {
        self.running.store(false, Ordering::SeqCst);
        let Some(handle) = self.handle.take() else {
            return true;
        };

        let deadline = Instant::now() + wait;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                warn!(task = %self.name, ?wait, "task did not stop in time, detaching");
                return false;
            }
            thread::sleep(STOP_POLL);
        }
        if handle.join().is_err() {
            error!(task = %self.name, "task panicked");
        }
        info!(task = %self.name, "task stopped");
        true
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

/// Sleeps for `total` in short slices, returning early once `running` is
/// cleared. Returns whether the task should keep going.
pub fn sleep_while_running(running: &AtomicBool, total: Duration) -> bool {
    let deadline = Instant::now() + total;
    loop {
        if !running.load(Ordering::SeqCst) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep((deadline - now).min(STOP_POLL * 10));
    }
}

pub fn start_listener(listener: Listener) -> Result<Task> {
    Task::spawn("sms-listener", move |running| listener.run(&running))
}

/// Samples the battery every `interval`, starting immediately.
pub fn start_battery_poller(telemetry: Arc<Telemetry>, interval: Duration) -> Result<Task> {
    info!(?interval, "starting battery poller");
    Task::spawn("battery-poller", move |running| {
        loop {
            if let Err(e) = telemetry.sample_battery() {
                warn!("failed to sample battery: {e}");
            }
            if !sleep_while_running(&running, interval) {
                break;
            }
        }
    })
}

/// What the report scheduler reads from.
pub struct ReportSources {
    pub telemetry: Arc<Telemetry>,
    pub sms: Arc<SmsService>,
    pub status: State<SessionStatus>,
    pub sink: Arc<dyn EventSink>,
}

impl ReportSources {
    /// Takes fresh signal and operator samples, then summarizes.
    pub fn compose(&self) -> StatusReport {
        if let Err(e) = self.telemetry.sample_signal() {
            debug!("signal unavailable for report: {e}");
        }
        if let Err(e) = self.telemetry.sample_operator() {
            debug!("operator unavailable for report: {e}");
        }
        let status = self.status.read(Clone::clone);
        StatusReport::compose(&status, &self.telemetry.snapshot(), self.sms.counters())
    }

    fn publish(&self, recipient: Option<&str>) {
        let report = self.compose();
        info!(%report, "status report");
        self.sink
            .system_log(&SystemLog::new(LogLevel::Info, "report", report.to_string()));
        if let Some(recipient) = recipient
            && let Err(e) = self.sms.send(recipient, &report.to_string())
        {
            warn!(recipient, "failed to send status report: {e}");
        }
    }
}

/// Publishes a report every `config.interval`, the first one after a full
/// interval. Returns `None` when reports are disabled.
pub fn start_report_scheduler(
    sources: ReportSources,
    config: &ReportConfig,
) -> Result<Option<Task>> {
    let Some(interval) = config.interval else {
        return Ok(None);
    };
    let recipient = config.recipient.clone();
    info!(?interval, ?recipient, "starting report scheduler");

    Task::spawn("report-scheduler", move |running| {
        while sleep_while_running(&running, interval) {
            sources.publish(recipient.as_deref());
        }
    })
    .map(Some)
}
