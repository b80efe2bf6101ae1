use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;

use crate::error::GpioError;
use crate::gpio::{
    Direction, Edge, EdgeSample, GpioBackend, Level, PinFunction, PullMode,
};

/// In-memory lines. Outputs can be wired to inputs with [`connect`] and
/// inputs driven from outside with [`drive`], which makes loopback tests
/// possible without hardware.
///
/// [`connect`]: MockGpioBackend::connect
/// [`drive`]: MockGpioBackend::drive
pub struct MockGpioBackend {
    state: Mutex<MockState>,
    edge_cond: Condvar,
    epoch: Instant,
}

impl Default for MockGpioBackend {
    fn default() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            edge_cond: Condvar::new(),
            epoch: Instant::now(),
        }
    }
}

#[derive(Default)]
struct MockState {
    pins: FxHashMap<u32, MockPin>,
    links: FxHashMap<u32, u32>, // input gpio -> output gpio
}

#[derive(Clone)]
struct MockPin {
    exported: bool,
    function: PinFunction,
    pull: PullMode,
    driven: Level,
    external: Option<Level>,
    level: Level,
    edge: Option<Edge>,
    pending: VecDeque<EdgeSample>,
}

impl Default for MockPin {
    fn default() -> Self {
        Self {
            exported: false,
            function: PinFunction::Input,
            pull: PullMode::Off,
            driven: Level::Low,
            external: None,
            level: Level::Low,
            edge: None,
            pending: VecDeque::new(),
        }
    }
}

impl MockState {
    fn pin(&mut self, gpio: u32) -> &mut MockPin {
        self.pins.entry(gpio).or_default()
    }

    fn target_level(&self, gpio: u32) -> Level {
        let Some(pin) = self.pins.get(&gpio) else {
            return Level::Low;
        };
        if pin.function == PinFunction::Output {
            return pin.driven;
        }
        if let Some(level) = pin.external {
            return level;
        }
        if let Some(source) = self.links.get(&gpio).and_then(|src| self.pins.get(src))
            && source.function == PinFunction::Output
        {
            return source.driven;
        }
        match pin.pull {
            PullMode::Up => Level::High,
            PullMode::Off | PullMode::Down => Level::Low,
        }
    }

    /// Recomputes every level and queues edges on armed lines. Returns whether
    /// anything was queued.
    fn settle(&mut self, now: Duration) -> bool {
        let targets: Vec<(u32, Level)> = self
            .pins
            .keys()
            .map(|gpio| (*gpio, self.target_level(*gpio)))
            .collect();

        let mut queued = false;
        for (gpio, target) in targets {
            let Some(pin) = self.pins.get_mut(&gpio) else {
                continue;
            };
            if pin.level == target {
                continue;
            }
            pin.level = target;
            if let Some(edge) = pin.edge
                && edge.accepts(target)
            {
                pin.pending.push_back(EdgeSample {
                    level: target,
                    timestamp: now,
                });
                queued = true;
            }
        }
        queued
    }
}

impl MockGpioBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn update(&self, f: impl FnOnce(&mut MockState)) {
        let mut state = self.state.lock();
        f(&mut state);
        if state.settle(self.epoch.elapsed()) {
            self.edge_cond.notify_all();
        }
    }

    /// Wires `output` to `input` as if by a jumper.
    pub fn connect(&self, output: u32, input: u32) {
        self.update(|state| {
            state.pin(output);
            state.pin(input);
            state.links.insert(input, output);
        });
    }

    /// Forces an input from outside, as a switch would. `None` lets it float
    /// back to its link or pull.
    pub fn drive(&self, gpio: u32, level: Option<Level>) {
        self.update(|state| state.pin(gpio).external = level);
    }

    /// Marks a line as held by another process or muxed to `function`.
    pub fn claim_externally(&self, gpio: u32, function: PinFunction) {
        self.update(|state| {
            let pin = state.pin(gpio);
            pin.exported = true;
            pin.function = function;
        });
    }

    pub fn level(&self, gpio: u32) -> Level {
        self.state
            .lock()
            .pins
            .get(&gpio)
            .map_or(Level::Low, |pin| pin.level)
    }

    pub fn pull(&self, gpio: u32) -> PullMode {
        self.state
            .lock()
            .pins
            .get(&gpio)
            .map_or(PullMode::Off, |pin| pin.pull)
    }

    pub fn armed_edge(&self, gpio: u32) -> Option<Edge> {
        self.state.lock().pins.get(&gpio).and_then(|pin| pin.edge)
    }
}

impl GpioBackend for MockGpioBackend {
    fn export(&self, gpio: u32) -> Result<(), GpioError> {
        self.state.lock().pin(gpio).exported = true;
        Ok(())
    }

    fn unexport(&self, gpio: u32) -> Result<(), GpioError> {
        self.update(|state| {
            let pin = state.pin(gpio);
            pin.exported = false;
            pin.function = PinFunction::Input;
            pin.pull = PullMode::Off;
            pin.edge = None;
            pin.pending.clear();
        });
        Ok(())
    }

    fn is_exported(&self, gpio: u32) -> Result<bool, GpioError> {
        Ok(self
            .state
            .lock()
            .pins
            .get(&gpio)
            .is_some_and(|pin| pin.exported))
    }

    fn set_direction(
        &self,
        gpio: u32,
        direction: Direction,
        pull: PullMode,
        initial: Option<Level>,
    ) -> Result<(), GpioError> {
        self.update(|state| {
            let pin = state.pin(gpio);
            pin.function = direction.into();
            pin.pull = pull;
            if let Some(level) = initial {
                pin.driven = level;
            }
        });
        Ok(())
    }

    fn function(&self, gpio: u32) -> Result<PinFunction, GpioError> {
        Ok(self
            .state
            .lock()
            .pins
            .get(&gpio)
            .map_or(PinFunction::Input, |pin| pin.function))
    }

    fn read_level(&self, gpio: u32) -> Result<Level, GpioError> {
        Ok(self.level(gpio))
    }

    fn write_level(&self, gpio: u32, level: Level) -> Result<(), GpioError> {
        let mut state = self.state.lock();
        let pin = state.pin(gpio);
        if pin.function != PinFunction::Output {
            return Err(GpioError::Gpio(format!("gpio {gpio} is not an output")));
        }
        pin.driven = level;
        if state.settle(self.epoch.elapsed()) {
            self.edge_cond.notify_all();
        }
        Ok(())
    }

    fn set_edge(&self, gpio: u32, edge: Option<Edge>) -> Result<(), GpioError> {
        let mut state = self.state.lock();
        let pin = state.pin(gpio);
        pin.edge = edge;
        pin.pending.clear();
        Ok(())
    }

    fn block_until_edge(
        &self,
        gpio: u32,
        timeout: Duration,
    ) -> Result<Option<EdgeSample>, GpioError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();

        loop {
            if let Some(sample) = state
                .pins
                .get_mut(&gpio)
                .and_then(|pin| pin.pending.pop_front())
            {
                return Ok(Some(sample));
            }
            if self.edge_cond.wait_until(&mut state, deadline).timed_out() {
                return Ok(state
                    .pins
                    .get_mut(&gpio)
                    .and_then(|pin| pin.pending.pop_front()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_follows_output() {
        let mock = MockGpioBackend::new();
        mock.connect(25, 23);
        mock.set_direction(25, Direction::Output, PullMode::Off, Some(Level::High))
            .unwrap();
        mock.set_direction(23, Direction::Input, PullMode::Off, None)
            .unwrap();
        assert_eq!(mock.read_level(23).unwrap(), Level::High);

        mock.write_level(25, Level::Low).unwrap();
        assert_eq!(mock.read_level(23).unwrap(), Level::Low);
    }

    #[test]
    fn pull_decides_floating_input() {
        let mock = MockGpioBackend::new();
        mock.set_direction(24, Direction::Input, PullMode::Up, None)
            .unwrap();
        assert_eq!(mock.read_level(24).unwrap(), Level::High);
        mock.drive(24, Some(Level::Low));
        assert_eq!(mock.read_level(24).unwrap(), Level::Low);
        mock.drive(24, None);
        assert_eq!(mock.read_level(24).unwrap(), Level::High);
    }

    #[test]
    fn only_armed_edges_are_queued() {
        let mock = MockGpioBackend::new();
        mock.set_direction(24, Direction::Input, PullMode::Off, None)
            .unwrap();
        mock.drive(24, Some(Level::High));
        mock.set_edge(24, Some(Edge::Falling)).unwrap();
        assert_eq!(
            mock.block_until_edge(24, Duration::from_millis(5)).unwrap(),
            None
        );

        mock.drive(24, Some(Level::Low));
        let sample = mock
            .block_until_edge(24, Duration::from_millis(5))
            .unwrap()
            .expect("falling edge");
        assert_eq!(sample.level, Level::Low);

        mock.drive(24, Some(Level::High));
        assert_eq!(
            mock.block_until_edge(24, Duration::from_millis(5)).unwrap(),
            None
        );
    }

    #[test]
    fn writing_an_input_fails() {
        let mock = MockGpioBackend::new();
        mock.set_direction(18, Direction::Input, PullMode::Off, None)
            .unwrap();
        assert!(mock.write_level(18, Level::High).is_err());
    }
}
