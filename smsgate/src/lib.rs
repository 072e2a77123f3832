pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod parse;
pub mod report;
pub mod session;
pub mod sink;
pub mod sms;
pub mod state;
pub mod tasks;
pub mod telemetry;
pub mod transport;
pub mod urc;

pub use engine::{Engine, EngineSnapshot};
pub use error::{ModemError, Result};
