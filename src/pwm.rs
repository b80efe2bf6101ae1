use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, warn};
use parking_lot::{Condvar, Mutex};

use crate::error::GpioError;
use crate::gpio::{GpioBackend, Level};

pub(crate) fn validate_frequency(frequency_hz: f64) -> Result<(), GpioError> {
    if !(frequency_hz.is_finite() && frequency_hz > 0.0) {
        return Err(GpioError::Configuration(
            "frequency must be greater than 0.0".into(),
        ));
    }
    // the period has to fit a Duration
    Duration::try_from_secs_f64(1.0 / frequency_hz)
        .map(|_| ())
        .map_err(|_| GpioError::Configuration(format!("frequency {frequency_hz}Hz is too low")))
}

pub(crate) fn validate_duty_cycle(duty_cycle: f64) -> Result<(), GpioError> {
    if (0.0..=100.0).contains(&duty_cycle) {
        Ok(())
    } else {
        Err(GpioError::Configuration(
            "dutycycle must have a value from 0.0 to 100.0".into(),
        ))
    }
}

#[derive(Debug, Clone, Copy)]
struct PwmParams {
    frequency_hz: f64,
    duty_cycle: f64,
}

impl PwmParams {
    /// High and low time of one period.
    fn periods(&self) -> Result<(Duration, Duration), GpioError> {
        let period = 1.0 / self.frequency_hz;
        let high = period * self.duty_cycle / 100.0;
        let to_duration = |secs: f64| {
            Duration::try_from_secs_f64(secs)
                .map_err(|e| GpioError::Configuration(format!("pwm period {secs}s: {e}")))
        };
        Ok((to_duration(high)?, to_duration((period - high).max(0.0))?))
    }
}

struct PwmShared {
    params: Mutex<PwmParams>,
    stopped: Mutex<bool>,
    wake: Condvar,
}

impl PwmShared {
    /// Sleeps for `duration` unless stopped first. Returns whether stopped.
    fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now().checked_add(duration);
        let mut stopped = self.stopped.lock();
        while !*stopped {
            match deadline {
                Some(deadline) => {
                    if self.wake.wait_until(&mut stopped, deadline).timed_out() {
                        break;
                    }
                }
                None => self.wake.wait(&mut stopped),
            }
        }
        *stopped
    }
}

/// Software PWM on one output line, driven by a dedicated thread.
pub(crate) struct SoftPwm {
    gpio: u32,
    shared: Arc<PwmShared>,
    handle: Option<JoinHandle<()>>,
}

impl SoftPwm {
    pub fn start(
        backend: Arc<dyn GpioBackend>,
        gpio: u32,
        frequency_hz: f64,
        duty_cycle: f64,
    ) -> Result<Self, GpioError> {
        validate_frequency(frequency_hz)?;
        validate_duty_cycle(duty_cycle)?;

        let shared = Arc::new(PwmShared {
            params: Mutex::new(PwmParams {
                frequency_hz,
                duty_cycle,
            }),
            stopped: Mutex::new(false),
            wake: Condvar::new(),
        });

        let worker = shared.clone();
        let handle = thread::Builder::new()
            .name(format!("gpio{gpio}-pwm"))
            .spawn(move || run(backend, gpio, worker))
            .map_err(|e| GpioError::Gpio(format!("spawn pwm thread: {e}")))?;
        debug!("started pwm on gpio {gpio} at {frequency_hz}Hz, {duty_cycle}%");

        Ok(Self {
            gpio,
            shared,
            handle: Some(handle),
        })
    }

    pub fn set_duty_cycle(&self, duty_cycle: f64) {
        self.shared.params.lock().duty_cycle = duty_cycle;
    }

    pub fn set_frequency(&self, frequency_hz: f64) {
        self.shared.params.lock().frequency_hz = frequency_hz;
    }
}

impl Drop for SoftPwm {
    fn drop(&mut self) {
        *self.shared.stopped.lock() = true;
        self.shared.wake.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        debug!("stopped pwm on gpio {}", self.gpio);
    }
}

fn run(backend: Arc<dyn GpioBackend>, gpio: u32, shared: Arc<PwmShared>) {
    let mut written: Option<Level> = None;
    let mut drive = |level: Level| -> bool {
        if written == Some(level) {
            return true;
        }
        match backend.write_level(gpio, level) {
            Ok(()) => {
                written = Some(level);
                true
            }
            Err(e) => {
                warn!("pwm write failed on gpio {gpio}, stopping: {e}");
                false
            }
        }
    };

    loop {
        if *shared.stopped.lock() {
            break;
        }
        let params = *shared.params.lock();
        let (high, low) = match params.periods() {
            Ok(periods) => periods,
            Err(e) => {
                warn!("pwm on gpio {gpio} stopping: {e}");
                break;
            }
        };

        if !high.is_zero() && (!drive(Level::High) || shared.sleep(high)) {
            break;
        }
        if !low.is_zero() && (!drive(Level::Low) || shared.sleep(low)) {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_parameters() {
        assert!(validate_frequency(50.0).is_ok());
        assert!(validate_frequency(0.0).is_err());
        assert!(validate_frequency(-1.0).is_err());
        assert!(validate_frequency(f64::NAN).is_err());
        assert!(validate_frequency(1e-300).is_err());
        assert!(validate_frequency(1e-6).is_ok());
        assert!(validate_duty_cycle(0.0).is_ok());
        assert!(validate_duty_cycle(100.0).is_ok());
        assert!(validate_duty_cycle(100.5).is_err());
        assert!(validate_duty_cycle(-0.1).is_err());
    }

    #[test]
    fn periods_split_by_duty_cycle() {
        let params = PwmParams {
            frequency_hz: 100.0,
            duty_cycle: 25.0,
        };
        let (high, low) = params.periods().unwrap();
        assert!((high.as_secs_f64() - 0.0025).abs() < 1e-6);
        assert!((low.as_secs_f64() - 0.0075).abs() < 1e-6);

        let full = PwmParams {
            frequency_hz: 100.0,
            duty_cycle: 100.0,
        };
        assert_eq!(full.periods().unwrap().1, Duration::ZERO);
    }

    #[test]
    fn unrepresentable_period_is_an_error() {
        let params = PwmParams {
            frequency_hz: 1e-300,
            duty_cycle: 50.0,
        };
        assert!(matches!(params.periods(), Err(GpioError::Configuration(_))));
    }
}
