//! The background loop that watches the line for unsolicited pushes.
//!
//! It samples the raw byte stream between foreground commands. The line is
//! only ever taken with a non-blocking attempt and released before every
//! sleep, so a slow foreground command delays it but never blocks it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use tracing::{debug, info, trace, warn};

use super::SmsService;
use crate::dispatcher::Dispatcher;
use crate::session::{RegistrationState, SessionStatus};
use crate::sink::{EventSink, LogLevel, SystemLog};
use crate::state::State;
use crate::urc::Urc;

pub struct Listener {
    dispatcher: Arc<Dispatcher>,
    sms: Arc<SmsService>,
    status: State<SessionStatus>,
    sink: Arc<dyn EventSink>,
}

impl Listener {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        sms: Arc<SmsService>,
        status: State<SessionStatus>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            dispatcher,
            sms,
            status,
            sink,
        }
    }

    /// Runs until `running` is cleared.
    pub fn run(&self, running: &AtomicBool) {
        let timings = self.dispatcher.timings();

        info!("SMS listener started");
        if self.sms.config().catch_up_backlog
            && let Err(e) = self.sms.catch_up_backlog()
        {
            warn!("backlog catch-up failed: {e}");
        }

        while running.load(Ordering::SeqCst) {
            while let Ok(push) = self.dispatcher.unsolicited().try_recv() {
                self.handle(push);
            }

            match self.dispatcher.try_transaction(|link| link.take_pushes()) {
                None => {
                    trace!("line busy, backing off");
                    thread::sleep(timings.listener_backoff);
                    continue;
                }
                Some(Err(e)) => warn!("failed to sample the line: {e}"),
                Some(Ok(pushes)) => {
                    for push in pushes {
                        self.handle(push);
                    }
                }
            }

            thread::sleep(timings.listener_poll);
        }
        info!("SMS listener stopped");
    }

    fn handle(&self, push: Urc) {
        match push {
            Urc::MessageStored(line) => {
                if let Err(e) = self.sms.on_notification(&line) {
                    warn!(line, "failed to process new message: {e}");
                    self.sink.system_log(&SystemLog::new(
                        LogLevel::Error,
                        "sms",
                        format!("failed to process {line}: {e}"),
                    ));
                }
            }
            Urc::MessageDelivered { header, body } => {
                self.sms.on_delivery(&header, &body);
            }
            Urc::Registration(line) => match RegistrationState::from_response(&line) {
                Some(state) => {
                    let previous = self.status.write(|s| {
                        std::mem::replace(&mut s.registration, state)
                    });
                    if previous != state {
                        info!(?previous, ?state, "registration changed");
                    }
                }
                None => debug!(line, "unreadable registration push"),
            },
            // the slot may be wrong, so look at everything stored
            Urc::Incomplete(line) if line.starts_with("+CMTI:") => {
                warn!(line, "new message notice was cut off, scanning storage");
                if let Err(e) = self.sms.catch_up_backlog() {
                    warn!("storage scan failed: {e}");
                }
            }
            Urc::Incomplete(line) => warn!(line, "dropping a cut off push"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use test_log::test;

    use super::*;
    use crate::config::{SmsConfig, Timings};
    use crate::sink::TracingSink;
    use crate::transport::SimulatedModem;

    #[test]
    fn it_tracks_registration_pushes() {
        let modem = SimulatedModem::new();
        let dispatcher = Arc::new(Dispatcher::new(
            Box::new(modem.clone()),
            Timings::default().compressed(20),
        ));
        let sink: Arc<dyn EventSink> = Arc::new(TracingSink);
        let sms = Arc::new(SmsService::new(
            dispatcher.clone(),
            SmsConfig::default(),
            sink.clone(),
        ));
        let status = State::new(SessionStatus::default());
        let listener = Listener::new(dispatcher, sms, status.clone(), sink);

        let running = Arc::new(AtomicBool::new(true));
        let handle = {
            let running = running.clone();
            thread::spawn(move || listener.run(&running))
        };

        modem.inject("\r\n+CREG: 5\r\n");
        let mut waited = Duration::ZERO;
        while status.read(|s| s.registration) != RegistrationState::RegisteredRoaming
            && waited < Duration::from_secs(2)
        {
            thread::sleep(Duration::from_millis(10));
            waited += Duration::from_millis(10);
        }

        running.store(false, Ordering::SeqCst);
        handle.join().unwrap();
        assert_eq!(
            status.read(|s| s.registration),
            RegistrationState::RegisteredRoaming
        );
    }
}
