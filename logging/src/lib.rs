//! Standardized logging for smsgate binaries.
//!
//! Start with [`LoggingConfig::new()`].

use std::io::{IsTerminal as _, Write as _};

use tracing::level_filters::LevelFilter;
use tracing_subscriber::{
    EnvFilter, filter::Directive, layer::SubscriberExt as _,
    util::SubscriberInitExt as _,
};

/// Target used for raw serial traffic. Enabled through
/// [`LoggingConfig::with_wire_trace`].
pub const WIRE_TARGET: &str = "smsgate::wire";

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("invalid filter directive `{directive}`: {source}")]
    Directive {
        directive: String,
        source: tracing_subscriber::filter::ParseError,
    },
    #[error(transparent)]
    Init(#[from] tracing_subscriber::util::TryInitError),
}

/// Where formatted events end up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Output<'a> {
    Journald(&'a str),
    Stderr,
}

/// Journald only makes sense for a daemon: with a terminal attached, or
/// without an identifier, events go to stderr.
fn pick_output(syslog_identifier: Option<&str>, attached_to_terminal: bool) -> Output<'_> {
    match syslog_identifier {
        Some(identifier) if !attached_to_terminal => Output::Journald(identifier),
        _ => Output::Stderr,
    }
}

/// The toplevel logging config. Start here.
#[derive(Debug)]
pub struct LoggingConfig {
    syslog_identifier: Option<String>,
    wire_trace: bool,
}

impl LoggingConfig {
    #[expect(clippy::new_without_default, reason = "may add required args later")]
    #[must_use]
    pub fn new() -> Self {
        Self {
            syslog_identifier: None,
            wire_trace: false,
        }
    }

    /// Sends events to journald under `syslog_identifier` when not running
    /// in a terminal.
    #[must_use]
    pub fn with_journald(self, syslog_identifier: &str) -> Self {
        Self {
            syslog_identifier: Some(syslog_identifier.to_owned()),
            ..self
        }
    }

    /// Logs every byte written to and read from the modem at TRACE level.
    #[must_use]
    pub fn with_wire_trace(self, enabled: bool) -> Self {
        Self {
            wire_trace: enabled,
            ..self
        }
    }

    /// `RUST_LOG`, INFO by default, plus the wire target when enabled.
    fn filter(&self) -> Result<EnvFilter, LoggingError> {
        let filter = EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy();
        if !self.wire_trace {
            return Ok(filter);
        }
        let directive = format!("{WIRE_TARGET}=trace");
        let parsed: Directive = directive
            .parse()
            .map_err(|source| LoggingError::Directive {
                directive: directive.clone(),
                source,
            })?;
        Ok(filter.add_directive(parsed))
    }

    /// Installs the global subscriber. Call this only once, at the beginning of
    /// the program.
    pub fn try_init(self) -> Result<LogFlusher, LoggingError> {
        let filter = self.filter()?;

        let journald = match pick_output(
            self.syslog_identifier.as_deref(),
            std::io::stderr().is_terminal(),
        ) {
            Output::Journald(identifier) => match tracing_journald::layer() {
                Ok(layer) => Some(layer.with_syslog_identifier(identifier.to_owned())),
                Err(err) => {
                    eprintln!("journald unavailable, logging to stderr: {err}");
                    None
                }
            },
            Output::Stderr => None,
        };
        let stderr = journald
            .is_none()
            .then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr));

        tracing_subscriber::registry()
            .with(filter)
            .with(journald)
            .with(stderr)
            .try_init()?;

        Ok(LogFlusher { _priv: () })
    }
}

/// Flushes buffered log output.
#[must_use = "call .flush_blocking at the end of the program, otherwise logs may get lost"]
pub struct LogFlusher {
    _priv: (),
}

impl LogFlusher {
    /// Call this at the end of the program.
    pub fn flush_blocking(self) {
        std::io::stderr().flush().ok();
        std::io::stdout().flush().ok();
    }
}

/// Renders raw modem bytes for the wire trace: printable text with control
/// characters escaped.
pub fn escape_wire(bytes: &[u8]) -> String {
    bytes.escape_ascii().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_escapes_control_characters() {
        assert_eq!(escape_wire(b"AT\r\n"), "AT\\r\\n");
        assert_eq!(escape_wire(b"hi\x1a"), "hi\\x1a");
    }

    #[test]
    fn it_uses_journald_only_for_daemons() {
        assert_eq!(pick_output(Some("smsgated"), false), Output::Journald("smsgated"));
        assert_eq!(pick_output(Some("smsgated"), true), Output::Stderr);
        assert_eq!(pick_output(None, false), Output::Stderr);
    }

    #[test]
    fn it_accepts_wire_trace_directive() -> color_eyre::Result<()> {
        let _directive: Directive = format!("{WIRE_TARGET}=trace").parse()?;
        Ok(())
    }
}
