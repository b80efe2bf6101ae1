use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use libgpiod::{chip::Chip, line, line::EventClock, request};
use log::debug;
use parking_lot::{FairMutex, RwLock, RwLockUpgradableReadGuard};
use rustc_hash::FxHashMap;

use crate::error::GpioError;
use crate::gpio::{Direction, Edge, EdgeSample, GpioBackend, Level, PinFunction, PullMode};

const LIBGPIOD_EVENT_BUFFER_CAPACITY: usize = 64;
const DEFAULT_CHIP: &str = "/dev/gpiochip0";

/// Character-device backend. Each claimed line holds its own line request.
pub struct LibgpiodBackend {
    chip: PathBuf,
    lines: RwLock<FxHashMap<u32, Arc<FairMutex<LineHandle>>>>, // keyed by gpio
}

struct LineHandle {
    request: request::Request,
    buffer: request::Buffer,
    direction: Direction,
    pull: PullMode,
    edge: Option<Edge>,
    pending: VecDeque<EdgeSample>,
}

impl LineHandle {
    fn reconfigure(&mut self, gpio: u32, initial: Option<Level>) -> Result<(), GpioError> {
        let settings = make_line_settings(self.direction, self.pull, initial, self.edge)?;
        let line_cfg = make_line_config(gpio, settings)?;
        self.request
            .reconfigure_lines(&line_cfg)
            .map_err(|e| GpioError::Gpio(format!("reconfigure lines: {e}")))?;
        self.pending.clear();
        Ok(())
    }
}

fn make_line_settings(
    direction: Direction,
    pull: PullMode,
    initial: Option<Level>,
    edge: Option<Edge>,
) -> Result<line::Settings, GpioError> {
    let mut ls =
        line::Settings::new().map_err(|e| GpioError::Gpio(format!("libgpiod settings: {e}")))?;

    match direction {
        Direction::Output => {
            ls.set_direction(line::Direction::Output)
                .map_err(|e| GpioError::Gpio(format!("set direction: {e}")))?;
            if let Some(level) = initial {
                ls.set_output_value(to_value(level))
                    .map_err(|e| GpioError::Gpio(format!("set output value: {e}")))?;
            }
        }
        Direction::Input => {
            ls.set_direction(line::Direction::Input)
                .map_err(|e| GpioError::Gpio(format!("set direction: {e}")))?;
            let bias = match pull {
                PullMode::Off => None,
                PullMode::Up => Some(line::Bias::PullUp),
                PullMode::Down => Some(line::Bias::PullDown),
            };
            ls.set_bias(bias)
                .map_err(|e| GpioError::Gpio(format!("set bias: {e}")))?;

            let edge = edge.map(|edge| match edge {
                Edge::Rising => line::Edge::Rising,
                Edge::Falling => line::Edge::Falling,
                Edge::Both => line::Edge::Both,
            });
            ls.set_edge_detection(edge)
                .map_err(|e| GpioError::Gpio(format!("set edge detection: {e}")))?;
            ls.set_event_clock(EventClock::Monotonic)
                .map_err(|e| GpioError::Gpio(format!("set event clock: {e}")))?;
        }
    }

    Ok(ls)
}

fn make_line_config(offset: u32, settings: line::Settings) -> Result<line::Config, GpioError> {
    let mut cfg = line::Config::new().map_err(|e| GpioError::Gpio(format!("line config: {e}")))?;
    cfg.add_line_settings(&[offset], settings)
        .map_err(|e| GpioError::Gpio(format!("line config add settings: {e}")))?;
    Ok(cfg)
}

fn to_value(level: Level) -> line::Value {
    match level {
        Level::Low => line::Value::InActive,
        Level::High => line::Value::Active,
    }
}

impl LibgpiodBackend {
    pub fn new() -> Self {
        Self::with_chip(DEFAULT_CHIP)
    }

    pub fn with_chip(chip: impl Into<PathBuf>) -> Self {
        Self {
            chip: chip.into(),
            lines: RwLock::new(FxHashMap::default()),
        }
    }

    fn open_chip(&self) -> Result<Chip, GpioError> {
        Chip::open(&self.chip)
            .map_err(|e| GpioError::Gpio(format!("open chip {}: {e}", self.chip.display())))
    }

    fn request_line(&self, line_cfg: &line::Config) -> Result<request::Request, GpioError> {
        let chip = self.open_chip()?;
        let mut req_cfg =
            request::Config::new().map_err(|e| GpioError::Gpio(format!("request config: {e}")))?;
        req_cfg
            .set_consumer(env!("CARGO_PKG_NAME"))
            .map_err(|e| GpioError::Gpio(format!("request consumer: {e}")))?;
        chip.request_lines(Some(&req_cfg), line_cfg)
            .map_err(|e| GpioError::Gpio(format!("request lines: {e}")))
    }

    fn handle(&self, gpio: u32) -> Result<Arc<FairMutex<LineHandle>>, GpioError> {
        self.lines.read().get(&gpio).cloned().ok_or_else(|| {
            GpioError::InvalidState(format!("gpio {gpio} is not configured, set direction first"))
        })
    }
}

impl Default for LibgpiodBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl GpioBackend for LibgpiodBackend {
    // lines are requested lazily by `set_direction`
    fn export(&self, _gpio: u32) -> Result<(), GpioError> {
        Ok(())
    }

    fn unexport(&self, gpio: u32) -> Result<(), GpioError> {
        // dropping the request releases the line
        self.lines.write().remove(&gpio);
        Ok(())
    }

    fn is_exported(&self, gpio: u32) -> Result<bool, GpioError> {
        if self.lines.read().contains_key(&gpio) {
            return Ok(true);
        }
        let info = self
            .open_chip()?
            .line_info(gpio)
            .map_err(|e| GpioError::Gpio(format!("line info {gpio}: {e}")))?;
        Ok(info.is_used())
    }

    fn set_direction(
        &self,
        gpio: u32,
        direction: Direction,
        pull: PullMode,
        initial: Option<Level>,
    ) -> Result<(), GpioError> {
        let lines = self.lines.upgradable_read();

        if let Some(handle) = lines.get(&gpio) {
            let mut handle = handle.lock();
            handle.direction = direction;
            handle.pull = pull;
            handle.edge = None;
            return handle.reconfigure(gpio, initial);
        }

        // the upgradable guard is exclusive, so requesting before upgrading is race free
        let settings = make_line_settings(direction, pull, initial, None)?;
        let line_cfg = make_line_config(gpio, settings)?;
        let request = self.request_line(&line_cfg)?;
        let buffer = request::Buffer::new(LIBGPIOD_EVENT_BUFFER_CAPACITY)
            .map_err(|e| GpioError::Gpio(format!("event buffer: {e}")))?;

        let handle = LineHandle {
            request,
            buffer,
            direction,
            pull,
            edge: None,
            pending: VecDeque::new(),
        };
        RwLockUpgradableReadGuard::upgrade(lines).insert(gpio, Arc::new(FairMutex::new(handle)));
        debug!("requested line {gpio} on {}", self.chip.display());

        Ok(())
    }

    fn function(&self, gpio: u32) -> Result<PinFunction, GpioError> {
        if let Some(handle) = self.lines.read().get(&gpio) {
            return Ok(handle.lock().direction.into());
        }

        let info = self
            .open_chip()?
            .line_info(gpio)
            .map_err(|e| GpioError::Gpio(format!("line info {gpio}: {e}")))?;
        Ok(match info.direction() {
            Ok(line::Direction::Input) => PinFunction::Input,
            Ok(line::Direction::Output) => PinFunction::Output,
            _ => PinFunction::Unknown,
        })
    }

    fn read_level(&self, gpio: u32) -> Result<Level, GpioError> {
        let handle = self.handle(gpio)?;
        let value = handle
            .lock()
            .request
            .value(gpio)
            .map_err(|e| GpioError::Gpio(format!("get value: {e}")))?;
        Ok(match value {
            line::Value::InActive => Level::Low,
            line::Value::Active => Level::High,
        })
    }

    fn write_level(&self, gpio: u32, level: Level) -> Result<(), GpioError> {
        let handle = self.handle(gpio)?;
        let mut handle = handle.lock();
        if handle.direction != Direction::Output {
            return Err(GpioError::InvalidState(
                "line must be an output to set its value".into(),
            ));
        }
        handle
            .request
            .set_value(gpio, to_value(level))
            .map_err(|e| GpioError::Gpio(format!("set value: {e}")))?;
        Ok(())
    }

    fn set_edge(&self, gpio: u32, edge: Option<Edge>) -> Result<(), GpioError> {
        let handle = self.handle(gpio)?;
        let mut handle = handle.lock();
        if handle.direction != Direction::Input {
            return Err(GpioError::InvalidState(
                "edge detection requires an input line".into(),
            ));
        }
        handle.edge = edge;
        handle.reconfigure(gpio, None)
    }

    fn block_until_edge(
        &self,
        gpio: u32,
        timeout: Duration,
    ) -> Result<Option<EdgeSample>, GpioError> {
        let handle = self.handle(gpio)?;
        let mut handle = handle.lock();
        if let Some(sample) = handle.pending.pop_front() {
            return Ok(Some(sample));
        }

        let has_event = handle
            .request
            .wait_edge_events(Some(timeout))
            .map_err(|e| GpioError::Gpio(format!("wait edge events: {e}")))?;
        if !has_event {
            return Ok(None);
        }

        let LineHandle {
            request,
            buffer,
            pending,
            ..
        } = &mut *handle;
        let events = request
            .read_edge_events(buffer)
            .map_err(|e| GpioError::Gpio(format!("read edge events: {e}")))?;
        for evt in events {
            let evt = match evt {
                Ok(e) => e,
                Err(_) => continue,
            };
            let level = match evt.event_type() {
                Ok(line::EdgeKind::Rising) => Level::High,
                Ok(line::EdgeKind::Falling) => Level::Low,
                Err(_) => continue,
            };
            pending.push_back(EdgeSample {
                level,
                timestamp: evt.timestamp(),
            });
        }

        Ok(pending.pop_front())
    }
}
