mod fixture;

use std::time::Duration;

use fixture::{Fixture, config, count, position};
use smsgate::ModemError;
use smsgate::config::SessionConfig;
use smsgate::session::{RegistrationState, SessionPhase, SimState};
use smsgate::telemetry::battery::ChargingStatus;
use smsgate::telemetry::signal::SignalQuality;
use smsgate::transport::simulated::Reply;
use test_log::test;

#[test]
fn it_brings_a_session_up() {
    let f = Fixture::new();
    f.engine.initialize().unwrap();

    let snapshot = f.engine.snapshot();
    assert_eq!(snapshot.session.phase, SessionPhase::Ready);
    assert_eq!(snapshot.session.registration, RegistrationState::RegisteredHome);
    assert_eq!(snapshot.session.sim, Some(SimState::Ready));
    assert!(!snapshot.listening);

    let commands = f.modem.commands();
    let echo_off = position(&commands, "ATE0").unwrap();
    let text_mode = position(&commands, "AT+CMGF=1").unwrap();
    let notices = position(&commands, "AT+CNMI=2,1,0,0,0").unwrap();
    assert!(echo_off < text_mode && text_mode < notices);
    assert!(position(&commands, "AT+CFUN=1").unwrap() < position(&commands, "AT+CREG?").unwrap());
}

#[test]
fn it_converges_after_searching() {
    let f = Fixture::new();
    f.modem.set_registration([2, 2, 2, 1]);
    f.engine.initialize().unwrap();
    assert_eq!(count(&f.modem.commands(), "AT+CREG?"), 4);
    assert_eq!(
        f.engine.snapshot().session.registration,
        RegistrationState::RegisteredHome
    );
}

#[test]
fn it_stops_on_denied_registration() {
    let f = Fixture::new();
    f.modem.set_registration([3]);
    let err = f.engine.initialize().unwrap_err();
    assert!(matches!(err, ModemError::RegistrationDenied { .. }));
    assert!(count(&f.modem.commands(), "AT+CREG?") <= 30);

    let snapshot = f.engine.snapshot();
    assert_eq!(snapshot.session.phase, SessionPhase::SimUnlocked);
    assert_eq!(snapshot.session.registration, RegistrationState::Denied);
    assert!(f.next_log("engine", Duration::from_secs(1)).is_some());
}

#[test]
fn it_reports_registration_exhaustion() {
    let mut config = config();
    config.session = SessionConfig {
        registration_attempts: 5,
        ..SessionConfig::default()
    };
    let f = Fixture::with_config(config);
    f.modem.set_registration([2]);
    let err = f.engine.initialize().unwrap_err();
    assert!(matches!(
        err,
        ModemError::RegistrationExhausted {
            attempts: 5,
            last: RegistrationState::Searching
        }
    ));
    assert_eq!(count(&f.modem.commands(), "AT+CREG?"), 5);
}

#[test]
fn it_unlocks_the_sim_once() {
    let mut config = config();
    config.session.pin = Some("0000".into());
    let f = Fixture::with_config(config);
    f.modem.require_pin("1234");

    let err = f.engine.initialize().unwrap_err();
    assert!(matches!(err, ModemError::PinRejected { .. }));
    assert!(!err.is_recoverable());
    assert_eq!(count(&f.modem.commands(), "AT+CPIN=0000"), 1);
    assert_eq!(f.engine.snapshot().session.phase, SessionPhase::CommVerified);
}

#[test]
fn it_refuses_operations_before_initialization() {
    let f = Fixture::new();
    assert!(matches!(
        f.engine.send_sms("+100", "hi"),
        Err(ModemError::NotInitialized)
    ));
    assert!(matches!(
        f.engine.start_listening(),
        Err(ModemError::NotInitialized)
    ));
    assert!(f.modem.sent().is_empty());
}

#[test]
fn it_samples_telemetry_on_demand() {
    let f = Fixture::new();
    assert!(f.engine.snapshot().telemetry.last_battery.is_none());

    let battery = f.engine.get_battery_status().unwrap();
    assert_eq!(battery.reading.voltage, Some(4.156));
    assert_eq!(battery.reading.level, 87);
    assert_eq!(battery.charging, ChargingStatus::InsufficientData);

    let signal = f.engine.get_signal().unwrap();
    assert_eq!(signal.rssi, 15);
    assert_eq!(signal.quality, SignalQuality::Fair);
    assert_eq!(signal.quality.to_string(), "Fair");
    assert_eq!(signal.dbm, Some(-83));

    let operator = f.engine.get_operator().unwrap();
    assert_eq!(operator.operator.as_deref(), Some("SIMNET"));

    let snapshot = f.engine.snapshot();
    assert_eq!(snapshot.telemetry.last_battery.map(|b| b.voltage), Some(4.156));
    assert_eq!(snapshot.telemetry.history.len(), 1);
    assert!(snapshot.telemetry.last_signal.is_some());
}

#[test]
fn it_tracks_the_charging_trend() {
    let f = Fixture::new();
    f.modem.script(
        "AT+CBC",
        ["4100", "4050", "4000"].map(|mv| Reply::ok(&format!("+CBC: 0,80,{mv}"))),
    );
    for _ in 0..3 {
        f.engine.get_battery_status().unwrap();
    }
    assert_eq!(
        f.engine.snapshot().telemetry.charging,
        ChargingStatus::Discharging
    );
}

#[test]
fn it_changes_the_pin_and_uses_it_after_a_restart() {
    let mut config = config();
    config.session.pin = Some("1234".into());
    let f = Fixture::with_config(config);
    f.modem.require_pin("1234");
    f.engine.initialize().unwrap();
    f.engine.start_listening().unwrap();
    assert!(fixture::wait_until(Duration::from_secs(2), || {
        count(&f.modem.commands(), "AT+CMGL=\"ALL\"") > 0
    }));

    f.engine.set_pin("5678").unwrap();
    assert_eq!(f.modem.pin().as_deref(), Some("5678"));

    f.modem.clear_commands();
    f.engine.restart_modem().unwrap();
    let commands = f.modem.commands();
    assert_eq!(commands.first().map(String::as_str), Some("AT+CFUN=1,1"));
    assert_eq!(count(&commands, "AT+CPIN=5678"), 1);
    assert_eq!(count(&commands, "AT+CMGF=1"), 1);
    assert!(f.engine.is_listening());
    assert_eq!(f.engine.snapshot().session.phase, SessionPhase::Ready);
}

#[test]
fn it_rejects_malformed_pins() {
    let mut config = config();
    config.session.pin = Some("1234".into());
    let f = Fixture::with_config(config);
    f.modem.require_pin("1234");
    f.engine.initialize().unwrap();
    assert!(matches!(
        f.engine.set_pin("12"),
        Err(ModemError::InvalidArgument(_))
    ));
    assert_eq!(f.modem.pin().as_deref(), Some("1234"));
}

#[test]
fn it_reports_the_sim_state() {
    let f = Fixture::new();
    assert_eq!(f.engine.sim_status().unwrap(), SimState::Ready);
    f.modem.lock_puk();
    assert_eq!(f.engine.sim_status().unwrap(), SimState::PukRequired);
    assert_eq!(
        f.engine.snapshot().session.sim,
        Some(SimState::PukRequired)
    );
}

#[test]
fn it_runs_diagnostics() {
    let f = Fixture::new();
    let responses = f.engine.diagnostics().unwrap();
    let commands: Vec<&str> = responses.iter().map(|r| r.command.as_str()).collect();
    assert_eq!(commands, ["AT", "AT+CBC", "AT+CPAS", "AT+CSQ", "AT+CREG?"]);
    assert!(responses.iter().all(|r| r.success()));
    assert_eq!(responses[2].line_with("+CPAS:"), Some("+CPAS: 0"));
}

#[test]
fn it_publishes_periodic_reports() {
    let mut config = config();
    config.report.interval = Some(Duration::from_millis(50));
    config.report.recipient = Some("+4400".into());
    let f = Fixture::with_config(config);
    f.engine.initialize().unwrap();
    f.engine.start_report_scheduler().unwrap();

    let report = f.next_log("report", Duration::from_secs(2)).unwrap();
    assert!(report.message.contains("Net: RegisteredHome"));
    assert!(fixture::wait_until(Duration::from_secs(2), || {
        f.modem.sent().iter().any(|sms| sms.number == "+4400")
    }));
}
