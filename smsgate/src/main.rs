use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use color_eyre::eyre::{Result, WrapErr as _};
use flume::{Receiver, Selector};
use nix::sys::signal::{SigSet, Signal};
use smsgate::Engine;
use smsgate::config::{Cli, Config};
use smsgate::sink::{ChannelSink, EngineEvent, EventSink as _, TracingSink};
use smsgate_logging::LoggingConfig;
use tracing::{debug, info, warn};

const SYSLOG_IDENTIFIER: &str = "smsgated";

enum Wake {
    Signal(Signal),
    Event(EngineEvent),
    Closed,
}

fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    let logging = LoggingConfig::new()
        .with_journald(SYSLOG_IDENTIFIER)
        .with_wire_trace(cli.show_raw_debug)
        .try_init()?;
    debug!("initialized logging");

    let result = run(&cli);
    logging.flush_blocking();
    result
}

fn run(cli: &Cli) -> Result<()> {
    // Workers inherit the mask, so only the signal thread ever sees these.
    let mut signals = SigSet::empty();
    signals.add(Signal::SIGINT);
    signals.add(Signal::SIGTERM);
    signals
        .thread_block()
        .wrap_err("failed to block termination signals")?;
    let signal_rx = spawn_signal_waiter(signals)?;

    let config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::from_cli(cli),
    };
    debug!(transport = ?config.transport, "starting smsgated");

    let (sink, events) = ChannelSink::unbounded();
    let engine =
        Engine::connect(config, Arc::new(sink)).wrap_err("failed to open the modem transport")?;
    engine
        .initialize()
        .wrap_err("failed to initialize the modem")?;

    engine.start_listening()?;
    engine.start_battery_poller()?;
    engine.start_report_scheduler()?;
    info!("smsgated ready");

    let deadline = cli
        .run_for
        .map(|secs| Instant::now() + Duration::from_secs(secs));
    loop {
        let selector = Selector::new()
            .recv(&signal_rx, |r| r.map_or(Wake::Closed, Wake::Signal))
            .recv(&events, |r| r.map_or(Wake::Closed, Wake::Event));
        let wake = match deadline {
            Some(deadline) => match selector.wait_deadline(deadline) {
                Ok(wake) => wake,
                Err(_) => {
                    info!("run time elapsed");
                    break;
                }
            },
            None => selector.wait(),
        };

        match wake {
            Wake::Signal(signal) => {
                info!(?signal, "shutting down");
                break;
            }
            Wake::Event(event) => log_event(event),
            Wake::Closed => {
                warn!("wake-up channel closed");
                break;
            }
        }
    }

    engine.shutdown();
    Ok(())
}

fn spawn_signal_waiter(signals: SigSet) -> Result<Receiver<Signal>> {
    let (tx, rx) = flume::bounded(1);
    thread::Builder::new()
        .name("signals".into())
        .spawn(move || match signals.wait() {
            Ok(signal) => {
                let _ = tx.send(signal);
            }
            Err(e) => warn!("failed waiting for signals: {e}"),
        })
        .wrap_err("failed to spawn the signal thread")?;
    Ok(rx)
}

fn log_event(event: EngineEvent) {
    match event {
        EngineEvent::Sms(sms) => TracingSink.sms_received(&sms),
        EngineEvent::Log(entry) => TracingSink.system_log(&entry),
        EngineEvent::Battery(sample) => {
            debug!(voltage = sample.voltage, level = sample.level, "battery sample")
        }
    }
}
