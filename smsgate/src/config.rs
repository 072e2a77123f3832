use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Primary engine configuration struct
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Which serial backend to drive the modem through
    pub transport: TransportConfig,

    /// Boot verification, SIM unlock and registration knobs
    pub session: SessionConfig,

    /// SMS subsystem policy
    pub sms: SmsConfig,

    /// Battery, signal and operator sampling
    pub telemetry: TelemetryConfig,

    /// Optional periodic status report
    pub report: ReportConfig,

    /// Every delay and timeout the engine waits on
    pub timings: Timings,
}

/// Serial backend selection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportConfig {
    /// Bit-banged serial through the pigpio daemon socket
    Pigpio {
        host: String,
        port: u16,
        rx_pin: u32,
        tx_pin: u32,
        baud: u32,
    },
    /// Hardware UART
    Serial { device: PathBuf, baud: u32 },
    /// In-process modem model
    Simulated,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::Pigpio {
            host: "localhost".into(),
            port: 8888,
            rx_pin: 13,
            tx_pin: 12,
            baud: 9600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// PIN submitted when the SIM asks for one
    pub pin: Option<String>,

    /// Full ping/escalation rounds before giving up on the modem
    pub verify_attempts: u32,

    /// Pings in the wake burst
    pub wake_pings: u32,

    /// Pings in the autobaud burst
    pub autobaud_pings: u32,

    /// Registration status polls before reporting exhaustion
    pub registration_attempts: u32,

    /// Idle observations answered by re-enabling registration before
    /// escalating to forced operator selection
    pub idle_escalation_after: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            pin: None,
            verify_attempts: 3,
            wake_pings: 3,
            autobaud_pings: 5,
            registration_attempts: 30,
            idle_escalation_after: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmsConfig {
    /// Delete a slot once its message has been read and handed to the sink
    pub auto_delete: bool,

    /// Process messages already stored on the SIM when listening starts
    pub catch_up_backlog: bool,
}

impl Default for SmsConfig {
    fn default() -> Self {
        Self {
            auto_delete: true,
            catch_up_backlog: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub history_capacity: usize,

    /// Samples considered when deriving the charging status
    pub trend_window: usize,

    /// Mean successive delta (mV) above which the battery is charging
    pub charging_threshold_mv: f64,

    /// Mean successive delta (mV) below which the battery is discharging
    pub discharging_threshold_mv: f64,

    pub low_battery_warning_v: f64,
    pub low_battery_critical_v: f64,

    pub battery_poll_interval: Duration,

    pub signal_bands: SignalBands,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            history_capacity: 20,
            trend_window: 5,
            charging_threshold_mv: 10.0,
            discharging_threshold_mv: -5.0,
            low_battery_warning_v: 3.5,
            low_battery_critical_v: 3.3,
            battery_poll_interval: Duration::from_secs(5 * 60),
            signal_bands: SignalBands::default(),
        }
    }
}

/// Lowest rssi of each quality band. Anything in `1..poor` is very poor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalBands {
    pub excellent: u8,
    pub good: u8,
    pub fair: u8,
    pub poor: u8,
}

impl Default for SignalBands {
    fn default() -> Self {
        Self {
            excellent: 20,
            good: 16,
            fair: 10,
            poor: 5,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    /// Disabled when unset
    pub interval: Option<Duration>,

    /// Also send each report as an SMS to this number
    pub recipient: Option<String>,
}

/// Per-command timeouts, selected by command prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutPolicy {
    /// `AT+COPS=`
    pub operator_selection: Duration,
    /// `AT+CFUN=`
    pub functionality: Duration,
    /// `AT+CPIN=`
    pub pin_submission: Duration,
    /// Anything containing `?`
    pub query: Duration,
    pub default: Duration,
}

impl TimeoutPolicy {
    pub fn for_command(&self, command: &str) -> Duration {
        let command = command.trim();
        if command.starts_with("AT+COPS=") {
            self.operator_selection
        } else if command.starts_with("AT+CFUN=") {
            self.functionality
        } else if command.starts_with("AT+CPIN=") {
            self.pin_submission
        } else if command.contains('?') {
            self.query
        } else {
            self.default
        }
    }
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            operator_selection: Duration::from_secs(15),
            functionality: Duration::from_secs(8),
            pin_submission: Duration::from_secs(5),
            query: Duration::from_secs(3),
            default: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timings {
    pub timeouts: TimeoutPolicy,

    /// Extra wait after a terminal token before the final drain
    pub trailing_grace: Duration,

    /// Quiet period that ends an unterminated response
    pub silence_window: Duration,

    /// Sleep between reads while collecting a response
    pub read_poll: Duration,

    /// Sleep between listener iterations
    pub listener_poll: Duration,

    /// Sleep after the listener lost the race for the lock
    pub listener_backoff: Duration,

    /// Timeout for the slower ping used when the plain ping stays silent
    pub slow_ping_timeout: Duration,
    pub wake_ping_interval: Duration,
    pub autobaud_ping_interval: Duration,

    /// How long to listen after a ping burst
    pub burst_listen: Duration,
    pub verify_retry: Duration,

    /// Wait after PIN submission before re-checking the SIM
    pub pin_settle: Duration,

    /// Wait after enabling functionality or registration notices
    pub radio_settle: Duration,

    pub registration_idle_retry: Duration,
    pub registration_escalated_retry: Duration,
    pub registration_searching: Duration,
    pub registration_unknown: Duration,

    /// Timeout of the forced `AT+COPS=0` on escalation
    pub forced_selection_timeout: Duration,

    /// Initial wait for `+CMGS` after the body was sent
    pub sms_send: Duration,

    /// Additional wait for the network to confirm a send
    pub sms_confirm: Duration,

    /// Wait after `AT+CFUN=1,1` before talking to the modem again
    pub restart_delay: Duration,

    /// Upper bound on joining a stopped background task
    pub task_join: Duration,
}

impl Timings {
    /// Divides every delay by `divisor`. Used to run the engine against a
    /// modem model that answers instantly.
    #[must_use]
    pub fn compressed(&self, divisor: u32) -> Self {
        let divisor = divisor.max(1);
        let c = |d: Duration| d / divisor;
        Self {
            timeouts: TimeoutPolicy {
                operator_selection: c(self.timeouts.operator_selection),
                functionality: c(self.timeouts.functionality),
                pin_submission: c(self.timeouts.pin_submission),
                query: c(self.timeouts.query),
                default: c(self.timeouts.default),
            },
            trailing_grace: c(self.trailing_grace),
            silence_window: c(self.silence_window),
            read_poll: c(self.read_poll),
            listener_poll: c(self.listener_poll),
            listener_backoff: c(self.listener_backoff),
            slow_ping_timeout: c(self.slow_ping_timeout),
            wake_ping_interval: c(self.wake_ping_interval),
            autobaud_ping_interval: c(self.autobaud_ping_interval),
            burst_listen: c(self.burst_listen),
            verify_retry: c(self.verify_retry),
            pin_settle: c(self.pin_settle),
            radio_settle: c(self.radio_settle),
            registration_idle_retry: c(self.registration_idle_retry),
            registration_escalated_retry: c(self.registration_escalated_retry),
            registration_searching: c(self.registration_searching),
            registration_unknown: c(self.registration_unknown),
            forced_selection_timeout: c(self.forced_selection_timeout),
            sms_send: c(self.sms_send),
            sms_confirm: c(self.sms_confirm),
            restart_delay: c(self.restart_delay),
            task_join: c(self.task_join),
        }
    }
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            timeouts: TimeoutPolicy::default(),
            trailing_grace: Duration::from_millis(50),
            silence_window: Duration::from_millis(500),
            read_poll: Duration::from_millis(10),
            listener_poll: Duration::from_millis(200),
            listener_backoff: Duration::from_millis(50),
            slow_ping_timeout: Duration::from_secs(5),
            wake_ping_interval: Duration::from_millis(500),
            autobaud_ping_interval: Duration::from_millis(100),
            burst_listen: Duration::from_secs(3),
            verify_retry: Duration::from_secs(2),
            pin_settle: Duration::from_secs(3),
            radio_settle: Duration::from_secs(2),
            registration_idle_retry: Duration::from_secs(2),
            registration_escalated_retry: Duration::from_secs(5),
            registration_searching: Duration::from_secs(2),
            registration_unknown: Duration::from_secs(1),
            forced_selection_timeout: Duration::from_secs(10),
            sms_send: Duration::from_secs(5),
            sms_confirm: Duration::from_secs(25),
            restart_delay: Duration::from_secs(10),
            task_join: Duration::from_secs(5),
        }
    }
}

impl Config {
    /// Loads a JSON config. Missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })
    }

    /// Create a new config from CLI arguments
    pub fn from_cli(cli: &Cli) -> Self {
        let transport = match cli.transport {
            TransportKind::Pigpio => TransportConfig::Pigpio {
                host: cli.pigpio_host.clone(),
                port: cli.pigpio_port,
                rx_pin: cli.rx_pin,
                tx_pin: cli.tx_pin,
                baud: cli.baudrate,
            },
            TransportKind::Serial => TransportConfig::Serial {
                device: PathBuf::from(&cli.device),
                baud: cli.baudrate,
            },
            TransportKind::Simulated => TransportConfig::Simulated,
        };

        let session = SessionConfig {
            pin: cli.sim_pin.clone().filter(|pin| !pin.is_empty()),
            ..SessionConfig::default()
        };

        let sms = SmsConfig {
            auto_delete: cli.auto_delete_sms,
            catch_up_backlog: !cli.no_backlog,
        };

        let telemetry = TelemetryConfig {
            battery_poll_interval: Duration::from_secs(cli.battery_interval),
            ..TelemetryConfig::default()
        };

        let report = ReportConfig {
            interval: (cli.report_interval > 0)
                .then(|| Duration::from_secs(cli.report_interval * 60 * 60)),
            recipient: cli.report_recipient.clone(),
        };

        let timings = if cli.transport == TransportKind::Simulated {
            Timings::default().compressed(20)
        } else {
            Timings::default()
        };

        Self {
            transport,
            session,
            sms,
            telemetry,
            report,
            timings,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TransportKind {
    Pigpio,
    Serial,
    Simulated,
}

#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Cli {
    #[arg(
        long = "transport",
        value_enum,
        default_value = "pigpio",
        env = "SMSGATE_TRANSPORT",
        help = "Serial backend used to reach the modem"
    )]
    pub transport: TransportKind,

    #[arg(
        long = "pigpio-host",
        default_value = "localhost",
        env = "PIGPIO_ADDR",
        help = "Host running the pigpio daemon"
    )]
    pub pigpio_host: String,

    #[arg(
        long = "pigpio-port",
        default_value = "8888",
        env = "PIGPIO_PORT",
        help = "Port of the pigpio daemon socket"
    )]
    pub pigpio_port: u16,

    #[arg(
        long = "rx-pin",
        default_value = "13",
        env = "RX_PIN",
        help = "GPIO wired to the modem TX line"
    )]
    pub rx_pin: u32,

    #[arg(
        long = "tx-pin",
        default_value = "12",
        env = "TX_PIN",
        help = "GPIO wired to the modem RX line"
    )]
    pub tx_pin: u32,

    #[arg(
        short = 'd',
        long = "device",
        default_value = "/dev/ttyS0",
        env = "SMSGATE_DEVICE",
        help = "Serial device, used with --transport serial"
    )]
    pub device: String,

    #[arg(long = "baudrate", default_value = "9600", env = "BAUDRATE")]
    pub baudrate: u32,

    #[arg(long = "sim-pin", env = "SIM_PIN", help = "PIN to unlock the SIM with")]
    pub sim_pin: Option<String>,

    #[arg(
        long = "auto-delete-sms",
        env = "AUTO_DELETE_SMS",
        default_value = "true",
        action = clap::ArgAction::Set,
        help = "Delete messages from the SIM once they were processed"
    )]
    pub auto_delete_sms: bool,

    #[arg(long = "no-backlog", help = "Skip messages already stored on the SIM")]
    pub no_backlog: bool,

    #[arg(
        long = "show-raw-debug",
        env = "SHOW_RAW_DEBUG",
        default_value = "false",
        action = clap::ArgAction::Set,
        help = "Log every byte exchanged with the modem"
    )]
    pub show_raw_debug: bool,

    #[arg(
        long = "battery-interval",
        default_value = "300",
        help = "Seconds between battery samples"
    )]
    pub battery_interval: u64,

    #[arg(
        long = "report-interval",
        default_value = "0",
        help = "Hours between status reports, 0 disables them"
    )]
    pub report_interval: u64,

    #[arg(long = "report-recipient", help = "Also send status reports to this number")]
    pub report_recipient: Option<String>,

    #[arg(short = 'c', long = "config", help = "JSON file overriding the whole config")]
    pub config: Option<PathBuf>,

    #[arg(long = "run-for", help = "Exit after this many seconds")]
    pub run_for: Option<u64>,
}
