use std::fmt;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GpioError {
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("The channel sent is invalid on this board: {0}")]
    InvalidChannel(u32),
    #[error("Channel must be an integer, got {0:?}")]
    NotAnInteger(String),
    #[error("{field} must be a number of milliseconds, got {raw:?}")]
    NotANumber { field: &'static str, raw: String },
    #[error("Number of channels != number of values ({channels} != {values})")]
    LengthMismatch { channels: usize, values: usize },
    #[error("GPIO error: {0}")]
    Gpio(String),
}

/// Coarse failure tiers callers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    State,
    Validation,
    Transport,
}

impl GpioError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GpioError::Configuration(_) => ErrorKind::Configuration,
            GpioError::InvalidState(_) => ErrorKind::State,
            GpioError::InvalidChannel(_)
            | GpioError::NotAnInteger(_)
            | GpioError::NotANumber { .. }
            | GpioError::LengthMismatch { .. } => ErrorKind::Validation,
            GpioError::Gpio(_) => ErrorKind::Transport,
        }
    }

    pub(crate) fn not_set_up(channel: u32) -> Self {
        GpioError::InvalidState(format!(
            "channel {channel} must be set up with setup() first"
        ))
    }
}

/// Non-fatal conditions reported while an operation still completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Warning {
    AlreadyInUse { channel: u32 },
    PullResistorFitted { channel: u32 },
    NothingToCleanUp,
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Warning::AlreadyInUse { channel } => write!(
                f,
                "channel {channel} is already in use, continuing anyway. Use set_warnings(false) to disable warnings"
            ),
            Warning::PullResistorFitted { channel } => write!(
                f,
                "a physical pull up resistor is fitted on channel {channel}"
            ),
            Warning::NothingToCleanUp => write!(
                f,
                "no channels have been set up yet - nothing to clean up! Try cleaning up at the end of your program instead"
            ),
        }
    }
}
