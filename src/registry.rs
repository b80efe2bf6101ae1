use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard, RwLock, RwLockUpgradableReadGuard};
use rustc_hash::FxHashMap;

use crate::event::{EdgeWatcher, LastEdge};
use crate::gpio::{Direction, Level, NumberingMode, PullMode};
use crate::pwm::SoftPwm;

#[derive(Debug)]
pub(crate) struct ModeContext {
    pub mode: NumberingMode,
    pub warnings: bool,
}

impl ModeContext {
    pub fn new(warnings: bool) -> Self {
        Self {
            mode: NumberingMode::Unset,
            warnings,
        }
    }
}

/// What this process has configured on a claimed line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinState {
    pub channel: u32,
    pub direction: Direction,
    pub pull: PullMode,
    pub last_level: Option<Level>,
}

pub(crate) struct WatcherEntry {
    pub watcher: EdgeWatcher,
    /// Installed by `add_event_detect` rather than by a blocking wait.
    pub detect_owned: bool,
    pub waiters: usize,
}

#[derive(Default)]
pub(crate) struct PinSlot {
    pub state: Option<PinState>,
    pub watcher: Option<WatcherEntry>,
    pub pwm: Option<SoftPwm>,
    pub last_edge: LastEdge,
}

/// Threads taken off a pin. Dropping it joins them, so drop it only after the
/// slot lock is released.
pub(crate) struct Detached {
    _watcher: Option<WatcherEntry>,
    _pwm: Option<SoftPwm>,
}

impl PinSlot {
    pub fn detach(&mut self) -> Detached {
        Detached {
            _watcher: self.take_watcher(),
            _pwm: self.pwm.take(),
        }
    }

    /// Removes the watcher with its listener already stopped, so a watcher
    /// installed next owns the line's edges alone. The dispatcher is joined
    /// when the entry drops.
    pub fn take_watcher(&mut self) -> Option<WatcherEntry> {
        let mut entry = self.watcher.take()?;
        entry.watcher.stop();
        Some(entry)
    }

    fn is_idle(&self) -> bool {
        self.watcher.is_none() && self.pwm.is_none()
    }

    /// Locks the slot with no watcher or PWM left on it. Anything found is
    /// stopped outside the lock and the slot is checked again.
    pub fn lock_idle(slot: &Mutex<PinSlot>) -> MutexGuard<'_, PinSlot> {
        loop {
            let mut guard = slot.lock();
            if guard.is_idle() {
                return guard;
            }
            let detached = guard.detach();
            drop(guard);
            drop(detached);
        }
    }
}

/// Per-line slots, keyed by GPIO number. Slots are created on first use and
/// kept for the life of the manager.
#[derive(Default)]
pub(crate) struct PinRegistry {
    slots: RwLock<FxHashMap<u32, Arc<Mutex<PinSlot>>>>,
}

impl PinRegistry {
    pub fn slot(&self, gpio: u32) -> Arc<Mutex<PinSlot>> {
        let slots = self.slots.upgradable_read();
        if let Some(slot) = slots.get(&gpio) {
            return slot.clone();
        }

        let mut slots = RwLockUpgradableReadGuard::upgrade(slots);
        slots
            .entry(gpio)
            .or_insert_with(|| Arc::new(Mutex::new(PinSlot::default())))
            .clone()
    }

    pub fn existing(&self, gpio: u32) -> Option<Arc<Mutex<PinSlot>>> {
        self.slots.read().get(&gpio).cloned()
    }

    pub fn gpios(&self) -> Vec<u32> {
        let mut gpios: Vec<u32> = self.slots.read().keys().copied().collect();
        gpios.sort_unstable();
        gpios
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_is_shared_per_gpio() {
        let registry = PinRegistry::default();
        assert!(registry.existing(18).is_none());

        let a = registry.slot(18);
        let b = registry.slot(18);
        assert!(Arc::ptr_eq(&a, &b));

        a.lock().state = Some(PinState {
            channel: 12,
            direction: Direction::Output,
            pull: PullMode::Off,
            last_level: None,
        });
        let seen = registry.existing(18).and_then(|s| s.lock().state);
        assert_eq!(seen.map(|s| s.channel), Some(12));

        registry.slot(4);
        assert_eq!(registry.gpios(), vec![4, 18]);
    }

    #[test]
    fn detach_empties_slot() {
        let mut slot = PinSlot::default();
        let _detached = slot.detach();
        assert!(slot.watcher.is_none());
        assert!(slot.pwm.is_none());
    }

    #[test]
    fn lock_idle_returns_empty_slot() {
        let slot = Mutex::new(PinSlot::default());
        *slot.lock().last_edge.lock() = Some(std::time::Duration::from_millis(5));

        let guard = PinSlot::lock_idle(&slot);
        assert!(guard.is_idle());
        assert!(guard.last_edge.lock().is_some());
    }
}
