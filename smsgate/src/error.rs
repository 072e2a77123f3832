use thiserror::Error;

use crate::session::RegistrationState;

#[derive(Error, Debug)]
pub enum ModemError {
    #[error("modem transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("`{command}` timed out, collected {raw:?}")]
    CommandTimeout { command: String, raw: String },

    #[error("`{command}` failed: {raw:?}")]
    CommandFailed { command: String, raw: String },

    #[error("could not parse {what} from {raw:?}")]
    Parse { what: &'static str, raw: String },

    #[error("SIM is locked ({state})")]
    SimLocked { state: String },

    #[error("SIM asks for a PIN but none is configured")]
    PinRequired,

    #[error("SIM rejected the PIN: {raw:?}")]
    PinRejected { raw: String },

    #[error("network registration denied: {raw:?}")]
    RegistrationDenied { raw: String },

    #[error("registration did not converge after {attempts} polls, last state {last:?}")]
    RegistrationExhausted {
        attempts: u32,
        last: RegistrationState,
    },

    #[error("modem stayed silent through {attempts} ping rounds")]
    NoCommunication { attempts: u32 },

    #[error("modem session is not initialized")]
    NotInitialized,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl ModemError {
    /// Modem text retained for diagnostics, if the failure carried any.
    pub fn raw(&self) -> Option<&str> {
        match self {
            Self::CommandTimeout { raw, .. }
            | Self::CommandFailed { raw, .. }
            | Self::Parse { raw, .. }
            | Self::PinRejected { raw }
            | Self::RegistrationDenied { raw } => Some(raw),
            Self::SimLocked { state } => Some(state),
            _ => None,
        }
    }

    /// Whether a caller may retry the operation that produced this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::CommandTimeout { .. }
                | Self::CommandFailed { .. }
                | Self::Parse { .. }
                | Self::SimLocked { .. }
                | Self::Io(_)
        )
    }
}

// Result type alias for functions in this crate
pub type Result<T> = std::result::Result<T, ModemError>;
