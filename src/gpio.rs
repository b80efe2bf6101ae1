use std::collections::{BTreeMap, VecDeque};
use std::ops::Not;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::channel::{self, Channels, Levels, ResolvedPin};
use crate::config::GpioConfig;
use crate::error::{GpioError, Warning};
use crate::event::{EdgeCallback, EdgeWatcher, WatchConfig};
use crate::pwm::{self, SoftPwm};
use crate::registry::{ModeContext, PinRegistry, PinSlot, PinState, WatcherEntry};

#[derive(Debug, Default, Hash, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum NumberingMode {
    #[default]
    Unset,
    Board,
    Bcm,
}

#[derive(Debug, Hash, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Direction {
    Input,
    Output,
}

#[derive(Debug, Default, Hash, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum PullMode {
    #[default]
    Off,
    Up,
    Down,
}

#[derive(Debug, Hash, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Level {
    Low,
    High,
}

impl From<bool> for Level {
    fn from(value: bool) -> Self {
        if value { Level::High } else { Level::Low }
    }
}

impl From<Level> for bool {
    fn from(level: Level) -> Self {
        level == Level::High
    }
}

impl Not for Level {
    type Output = Level;

    fn not(self) -> Level {
        match self {
            Level::Low => Level::High,
            Level::High => Level::Low,
        }
    }
}

#[derive(Debug, Hash, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Edge {
    Rising,
    Falling,
    Both,
}

impl Edge {
    /// Whether a transition that settled at `level` is one this edge reports.
    pub fn accepts(&self, level: Level) -> bool {
        match self {
            Edge::Rising => level == Level::High,
            Edge::Falling => level == Level::Low,
            Edge::Both => true,
        }
    }
}

/// What a line is currently muxed to.
#[derive(Debug, Hash, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum PinFunction {
    Input,
    Output,
    Pwm,
    Serial,
    I2c,
    Spi,
    Unknown,
}

impl From<Direction> for PinFunction {
    fn from(direction: Direction) -> Self {
        match direction {
            Direction::Input => PinFunction::Input,
            Direction::Output => PinFunction::Output,
        }
    }
}

fn parse_keyword<T: Copy>(
    raw: &str,
    table: &[(&str, T)],
    message: &str,
) -> Result<T, GpioError> {
    let key = raw.trim().to_ascii_lowercase();
    table
        .iter()
        .find(|(name, _)| *name == key)
        .map(|(_, value)| *value)
        .ok_or_else(|| GpioError::Configuration(format!("{message}, got {raw:?}")))
}

impl FromStr for NumberingMode {
    type Err = GpioError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_keyword(
            s,
            &[("board", NumberingMode::Board), ("bcm", NumberingMode::Bcm)],
            "An invalid mode was passed, expected BOARD or BCM",
        )
    }
}

impl FromStr for Direction {
    type Err = GpioError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_keyword(
            s,
            &[
                ("in", Direction::Input),
                ("input", Direction::Input),
                ("out", Direction::Output),
                ("output", Direction::Output),
            ],
            "An invalid direction was passed, expected IN or OUT",
        )
    }
}

impl FromStr for PullMode {
    type Err = GpioError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_keyword(
            s,
            &[
                ("off", PullMode::Off),
                ("up", PullMode::Up),
                ("down", PullMode::Down),
            ],
            "Invalid value for pull_up_down - should be either OFF, UP or DOWN",
        )
    }
}

impl FromStr for Edge {
    type Err = GpioError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_keyword(
            s,
            &[
                ("rising", Edge::Rising),
                ("falling", Edge::Falling),
                ("both", Edge::Both),
            ],
            "The edge must be set to RISING, FALLING or BOTH",
        )
    }
}

/// One transition reported by a backend: the level it settled at and when it
/// happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeSample {
    pub level: Level,
    /// Monotonic time of the transition. Only differences between samples
    /// from the same backend are meaningful.
    pub timestamp: Duration,
}

/// Hardware transport. Lines are addressed by GPIO number.
pub trait GpioBackend: Send + Sync {
    fn export(&self, gpio: u32) -> Result<(), GpioError>;
    fn unexport(&self, gpio: u32) -> Result<(), GpioError>;
    /// Whether the line is already held, by this or any other process.
    fn is_exported(&self, gpio: u32) -> Result<bool, GpioError>;
    fn set_direction(
        &self,
        gpio: u32,
        direction: Direction,
        pull: PullMode,
        initial: Option<Level>,
    ) -> Result<(), GpioError>;
    fn function(&self, gpio: u32) -> Result<PinFunction, GpioError>;
    fn read_level(&self, gpio: u32) -> Result<Level, GpioError>;
    fn write_level(&self, gpio: u32, level: Level) -> Result<(), GpioError>;
    /// Arms (`Some`) or disarms (`None`) edge reporting. Transitions before
    /// arming are never reported.
    fn set_edge(&self, gpio: u32, edge: Option<Edge>) -> Result<(), GpioError>;
    /// Blocks up to `timeout` for the next armed transition.
    fn block_until_edge(
        &self,
        gpio: u32,
        timeout: Duration,
    ) -> Result<Option<EdgeSample>, GpioError>;
}

/// Process-wide GPIO context: numbering mode, claimed pins, edge watchers and
/// software PWM, all mediated through one backend.
pub struct GpioManager {
    config: Arc<GpioConfig>,
    backend: Arc<dyn GpioBackend>,
    context: RwLock<ModeContext>,
    registry: PinRegistry,
    warning_log: Mutex<VecDeque<Warning>>,
}

impl GpioManager {
    pub fn new(config: Arc<GpioConfig>, backend: Arc<dyn GpioBackend>) -> Self {
        let context = ModeContext::new(config.warnings);

        Self {
            config,
            backend,
            context: RwLock::new(context),
            registry: PinRegistry::default(),
            warning_log: Mutex::new(VecDeque::new()),
        }
    }

    pub fn board_info(&self) -> &BTreeMap<String, String> {
        &self.config.board.info
    }

    pub fn set_mode(&self, mode: NumberingMode) -> Result<(), GpioError> {
        if mode == NumberingMode::Unset {
            return Err(GpioError::Configuration(
                "An invalid mode was passed to set_mode()".into(),
            ));
        }
        if mode == NumberingMode::Board && !self.config.board.supports_board_numbering() {
            return Err(GpioError::InvalidState(
                "BOARD numbering system not applicable on compute module".into(),
            ));
        }

        let mut context = self.context.write();
        if context.mode != NumberingMode::Unset && context.mode != mode {
            return Err(GpioError::InvalidState(
                "A different mode has already been set!".into(),
            ));
        }
        context.mode = mode;

        Ok(())
    }

    pub fn get_mode(&self) -> NumberingMode {
        self.context.read().mode
    }

    pub fn set_warnings(&self, enabled: bool) {
        self.context.write().warnings = enabled;
    }

    pub fn warnings_enabled(&self) -> bool {
        self.context.read().warnings
    }

    /// Drains the advisory warnings recorded so far, oldest first.
    pub fn take_warnings(&self) -> Vec<Warning> {
        self.warning_log.lock().drain(..).collect()
    }

    fn warn(&self, warning: Warning) {
        if !self.warnings_enabled() {
            return;
        }
        warn!("{warning}");

        let mut log = self.warning_log.lock();
        while log.len() >= self.config.warning_history_capacity.max(1) {
            log.pop_front();
        }
        log.push_back(warning);
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.config.edge_poll_interval_ms.max(1))
    }

    fn resolve_all(&self, channels: &Channels) -> Result<Vec<ResolvedPin>, GpioError> {
        let mode = self.get_mode();
        channel::resolve_all(&self.config.board, mode, channels)
    }

    fn resolve(&self, channel: u32) -> Result<ResolvedPin, GpioError> {
        let mode = self.get_mode();
        channel::resolve(&self.config.board, mode, channel)
    }

    pub fn setup(
        &self,
        channels: impl Into<Channels>,
        direction: Direction,
        pull: PullMode,
        initial: Option<Level>,
    ) -> Result<(), GpioError> {
        if direction == Direction::Output && pull != PullMode::Off {
            return Err(GpioError::Configuration(
                "pull_up_down parameter is not valid for outputs".into(),
            ));
        }
        if direction == Direction::Input && initial.is_some() {
            return Err(GpioError::Configuration(
                "initial parameter is not valid for inputs".into(),
            ));
        }

        let pins = self.resolve_all(&channels.into())?;
        for pin in pins {
            self.setup_one(pin, direction, pull, initial)?;
        }

        Ok(())
    }

    fn setup_one(
        &self,
        pin: ResolvedPin,
        direction: Direction,
        pull: PullMode,
        initial: Option<Level>,
    ) -> Result<(), GpioError> {
        let slot = self.registry.slot(pin.gpio);
        // stop anything still running from a previous setup before reconfiguring
        let mut slot = PinSlot::lock_idle(&slot);

        if slot.state.is_none() {
            let foreign = self.backend.is_exported(pin.gpio)?
                || self.backend.function(pin.gpio)? != PinFunction::Input;
            if foreign {
                self.warn(Warning::AlreadyInUse {
                    channel: pin.channel,
                });
            }
        }

        if pull != PullMode::Off && self.config.board.has_pull_fitted(pin.gpio) {
            self.warn(Warning::PullResistorFitted {
                channel: pin.channel,
            });
        }

        self.backend.export(pin.gpio)?;
        self.backend
            .set_direction(pin.gpio, direction, pull, initial)?;

        slot.state = Some(PinState {
            channel: pin.channel,
            direction,
            pull,
            last_level: initial,
        });
        debug!(
            "claimed channel {} (gpio {}) as {direction:?}, pull {pull:?}",
            pin.channel, pin.gpio
        );

        Ok(())
    }

    pub fn output(
        &self,
        channels: impl Into<Channels>,
        values: impl Into<Levels>,
    ) -> Result<(), GpioError> {
        let channels = channels.into();
        let values = values.into();
        let pins = self.resolve_all(&channels)?;

        let levels = match values.as_slice() {
            [level] => vec![*level; pins.len()],
            levels if levels.len() == pins.len() => levels.to_vec(),
            _ => {
                return Err(GpioError::LengthMismatch {
                    channels: channels.len(),
                    values: values.len(),
                });
            }
        };

        for pin in &pins {
            self.require_direction(pin, Direction::Output)?;
        }

        for (pin, level) in pins.iter().zip(levels) {
            let slot = self.registry.slot(pin.gpio);
            let mut slot = slot.lock();
            let Some(state) = slot.state.as_mut() else {
                return Err(GpioError::not_set_up(pin.channel));
            };
            self.backend.write_level(pin.gpio, level)?;
            state.last_level = Some(level);
        }

        Ok(())
    }

    fn require_direction(&self, pin: &ResolvedPin, direction: Direction) -> Result<(), GpioError> {
        let state = self.claimed(pin.gpio);

        match state {
            Some(state) if state.direction == direction => Ok(()),
            _ => Err(GpioError::InvalidState(match direction {
                Direction::Output => "The GPIO channel has not been set up as an OUTPUT".into(),
                Direction::Input => "You must setup() the GPIO channel as an input first".into(),
            })),
        }
    }

    /// What this process has configured on `channel`, if it claimed it.
    pub fn pin_state(&self, channel: u32) -> Result<Option<PinState>, GpioError> {
        let pin = self.resolve(channel)?;
        Ok(self.claimed(pin.gpio))
    }

    fn claimed(&self, gpio: u32) -> Option<PinState> {
        let slot = self.registry.existing(gpio)?;
        let state = slot.lock().state;
        state
    }

    pub fn input(&self, channel: u32) -> Result<Level, GpioError> {
        let pin = self.resolve(channel)?;
        let slot = self
            .registry
            .existing(pin.gpio)
            .ok_or_else(|| GpioError::not_set_up(channel))?;

        let mut slot = slot.lock();
        let Some(state) = slot.state.as_mut() else {
            return Err(GpioError::not_set_up(channel));
        };
        let level = self.backend.read_level(pin.gpio)?;
        state.last_level = Some(level);

        Ok(level)
    }

    pub fn gpio_function(&self, channel: u32) -> Result<PinFunction, GpioError> {
        let pin = self.resolve(channel)?;
        match self.claimed(pin.gpio) {
            Some(state) => Ok(state.direction.into()),
            None => self.backend.function(pin.gpio),
        }
    }

    /// Releases `channels`, or every claimed pin and the numbering mode when
    /// `None`.
    pub fn cleanup(&self, channels: Option<Channels>) -> Result<(), GpioError> {
        match channels {
            Some(channels) => {
                let pins = self.resolve_all(&channels)?;
                for pin in pins {
                    self.release(pin.gpio)?;
                }
                Ok(())
            }
            None => {
                let mut found = false;
                let mut first_error = None;
                for gpio in self.registry.gpios() {
                    match self.release(gpio) {
                        Ok(released) => found |= released,
                        Err(e) => {
                            warn!("cleanup of gpio {gpio} failed: {e}");
                            first_error.get_or_insert(e);
                        }
                    }
                }

                self.context.write().mode = NumberingMode::Unset;
                if !found && first_error.is_none() {
                    self.warn(Warning::NothingToCleanUp);
                }

                first_error.map_or(Ok(()), Err)
            }
        }
    }

    /// Stops watchers and PWM on the pin, then hands the line back. Returns
    /// whether the pin was claimed.
    fn release(&self, gpio: u32) -> Result<bool, GpioError> {
        let Some(slot) = self.registry.existing(gpio) else {
            return Ok(false);
        };

        let mut slot = PinSlot::lock_idle(&slot);
        slot.last_edge = Default::default();
        let Some(state) = slot.state.take() else {
            return Ok(false);
        };

        self.backend
            .set_direction(gpio, Direction::Input, PullMode::Off, None)?;
        self.backend.unexport(gpio)?;
        debug!("released channel {} (gpio {gpio})", state.channel);

        Ok(true)
    }

    pub fn add_event_detect(
        &self,
        channel: u32,
        edge: Edge,
        callback: Option<EdgeCallback>,
        bouncetime: Duration,
    ) -> Result<(), GpioError> {
        let pin = self.resolve(channel)?;
        self.require_direction(&pin, Direction::Input)?;

        let slot = self.registry.slot(pin.gpio);
        let mut slot = slot.lock();
        if slot.watcher.is_some() {
            return Err(GpioError::InvalidState(
                "Conflicting edge detection already enabled for this GPIO channel".into(),
            ));
        }

        let config = WatchConfig {
            edge,
            bounce: bouncetime,
        };
        let watcher = EdgeWatcher::spawn(
            self.backend.clone(),
            pin,
            config,
            slot.last_edge.clone(),
            self.poll_interval(),
        )?;
        if let Some(callback) = callback {
            watcher.add_callback(callback);
        }
        slot.watcher = Some(WatcherEntry {
            watcher,
            detect_owned: true,
            waiters: 0,
        });

        Ok(())
    }

    pub fn add_event_callback(&self, channel: u32, callback: EdgeCallback) -> Result<(), GpioError> {
        let pin = self.resolve(channel)?;
        self.require_direction(&pin, Direction::Input)?;

        let slot = self.registry.slot(pin.gpio);
        let slot = slot.lock();
        match slot.watcher.as_ref() {
            Some(entry) if entry.detect_owned => {
                entry.watcher.add_callback(callback);
                Ok(())
            }
            _ => Err(GpioError::InvalidState(
                "Add event detection using add_event_detect first before adding a callback".into(),
            )),
        }
    }

    /// Reads and clears the pin's event flag.
    pub fn event_detected(&self, channel: u32) -> Result<bool, GpioError> {
        let pin = self.resolve(channel)?;

        let Some(slot) = self.registry.existing(pin.gpio) else {
            return Ok(false);
        };
        let slot = slot.lock();

        Ok(slot
            .watcher
            .as_ref()
            .is_some_and(|entry| entry.watcher.shared().take_event()))
    }

    pub fn remove_event_detect(&self, channel: u32) -> Result<(), GpioError> {
        let pin = self.resolve(channel)?;
        let Some(slot) = self.registry.existing(pin.gpio) else {
            return Ok(());
        };

        let entry = {
            let mut slot = slot.lock();
            slot.last_edge = Default::default();
            slot.take_watcher()
        };
        // joins the dispatcher outside the pin lock
        drop(entry);

        Ok(())
    }

    /// Blocks until a debounced `edge` or `timeout`. Returns the channel on an
    /// edge and `None` on timeout.
    pub fn wait_for_edge(
        &self,
        channel: u32,
        edge: Edge,
        bouncetime: Duration,
        timeout: Option<Duration>,
    ) -> Result<Option<u32>, GpioError> {
        let pin = self.resolve(channel)?;
        self.require_direction(&pin, Direction::Input)?;

        let config = WatchConfig {
            edge,
            bounce: bouncetime,
        };
        let slot = self.registry.slot(pin.gpio);

        let (shared, since) = {
            let mut slot = slot.lock();
            match slot.watcher.as_mut() {
                Some(entry) => {
                    if entry.watcher.config() != config || entry.watcher.has_callbacks() {
                        return Err(GpioError::InvalidState(
                            "Conflicting edge detection events already exist for this GPIO channel"
                                .into(),
                        ));
                    }
                    entry.waiters += 1;
                    let shared = entry.watcher.shared();
                    let since = shared.edge_count();
                    (shared, since)
                }
                None => {
                    let watcher = EdgeWatcher::spawn(
                        self.backend.clone(),
                        pin,
                        config,
                        slot.last_edge.clone(),
                        self.poll_interval(),
                    )?;
                    let shared = watcher.shared();
                    slot.watcher = Some(WatcherEntry {
                        watcher,
                        detect_owned: false,
                        waiters: 1,
                    });
                    (shared, 0)
                }
            }
        };

        let fired = shared.wait_since(since, timeout);

        let finished = {
            let mut slot = slot.lock();
            let same = slot
                .watcher
                .as_ref()
                .is_some_and(|entry| Arc::ptr_eq(&entry.watcher.shared(), &shared));
            if same {
                let idle = slot.watcher.as_mut().is_some_and(|entry| {
                    entry.waiters = entry.waiters.saturating_sub(1);
                    entry.waiters == 0 && !entry.detect_owned
                });
                if idle {
                    slot.take_watcher()
                } else {
                    None
                }
            } else {
                None
            }
        };
        drop(finished);

        Ok(fired.then_some(channel))
    }

    pub fn pwm_start(
        &self,
        channel: u32,
        frequency_hz: f64,
        duty_cycle: f64,
    ) -> Result<(), GpioError> {
        pwm::validate_frequency(frequency_hz)?;
        pwm::validate_duty_cycle(duty_cycle)?;
        let pin = self.resolve(channel)?;
        self.require_direction(&pin, Direction::Output)?;

        let slot = self.registry.slot(pin.gpio);
        let mut slot = slot.lock();
        if slot.pwm.is_some() {
            return Err(GpioError::InvalidState(
                "A PWM object already exists for this GPIO channel".into(),
            ));
        }
        slot.pwm = Some(SoftPwm::start(
            self.backend.clone(),
            pin.gpio,
            frequency_hz,
            duty_cycle,
        )?);

        Ok(())
    }

    pub fn pwm_change_duty_cycle(&self, channel: u32, duty_cycle: f64) -> Result<(), GpioError> {
        pwm::validate_duty_cycle(duty_cycle)?;
        self.with_pwm(channel, |pwm| pwm.set_duty_cycle(duty_cycle))
    }

    pub fn pwm_change_frequency(&self, channel: u32, frequency_hz: f64) -> Result<(), GpioError> {
        pwm::validate_frequency(frequency_hz)?;
        self.with_pwm(channel, |pwm| pwm.set_frequency(frequency_hz))
    }

    /// Stops PWM on the pin. The final level is whatever the loop last wrote.
    pub fn pwm_stop(&self, channel: u32) -> Result<(), GpioError> {
        let pin = self.resolve(channel)?;
        if let Some(slot) = self.registry.existing(pin.gpio) {
            let pwm = slot.lock().pwm.take();
            drop(pwm);
        }

        Ok(())
    }

    fn with_pwm(&self, channel: u32, f: impl FnOnce(&SoftPwm)) -> Result<(), GpioError> {
        let pin = self.resolve(channel)?;
        let slot = self.registry.slot(pin.gpio);
        let slot = slot.lock();
        let pwm = slot.pwm.as_ref().ok_or_else(|| {
            GpioError::InvalidState(format!("PWM has not been started on channel {channel}"))
        })?;
        f(pwm);

        Ok(())
    }
}

impl Drop for GpioManager {
    fn drop(&mut self) {
        for gpio in self.registry.gpios() {
            if let Some(slot) = self.registry.existing(gpio) {
                let detached = slot.lock().detach();
                drop(detached);
            }
        }
    }
}
