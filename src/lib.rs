mod backend;
mod channel;
mod config;
mod error;
mod event;
mod gpio;
mod pwm;
mod registry;

pub use channel::{Channels, Levels, OneOrMany, millis_from_i64, millis_from_str};
pub use config::{BoardConfig, GpioConfig, PhysicalPin};
pub use error::{ErrorKind, GpioError, Warning};
pub use event::EdgeCallback;
pub use gpio::{
    Direction, Edge, EdgeSample, GpioBackend, GpioManager, Level, NumberingMode, PinFunction,
    PullMode,
};
pub use registry::PinState;

#[cfg(feature = "hardware-gpio")]
pub use backend::LibgpiodBackend;
pub use backend::{MockGpioBackend, SysfsBackend};
