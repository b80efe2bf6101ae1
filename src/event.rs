use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, warn};
use parking_lot::{Condvar, Mutex};

use crate::channel::ResolvedPin;
use crate::error::GpioError;
use crate::gpio::{Edge, GpioBackend};

/// Invoked with the caller's channel number after each debounced edge.
pub type EdgeCallback = Arc<dyn Fn(u32) + Send + Sync + 'static>;

/// Timestamp of the last accepted edge on a pin. Outlives any one watcher so
/// back-to-back waits debounce against each other.
pub(crate) type LastEdge = Arc<Mutex<Option<Duration>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WatchConfig {
    pub edge: Edge,
    pub bounce: Duration,
}

struct EdgeCounter {
    seq: u64,
    closed: bool,
}

/// State shared between a watcher's threads and anyone blocked on it.
pub(crate) struct EdgeShared {
    channel: u32,
    config: WatchConfig,
    event_flag: AtomicBool,
    callbacks: Mutex<Vec<EdgeCallback>>,
    counter: Mutex<EdgeCounter>,
    edge_cond: Condvar,
}

impl EdgeShared {
    fn accept(&self) {
        self.event_flag.store(true, Ordering::Release);
        self.counter.lock().seq += 1;
        self.edge_cond.notify_all();
    }

    fn close(&self) {
        self.counter.lock().closed = true;
        self.callbacks.lock().clear();
        self.edge_cond.notify_all();
    }

    fn is_closed(&self) -> bool {
        self.counter.lock().closed
    }

    pub fn take_event(&self) -> bool {
        self.event_flag.swap(false, Ordering::AcqRel)
    }

    pub fn edge_count(&self) -> u64 {
        self.counter.lock().seq
    }

    /// Blocks until an edge past `since`. `false` on timeout or when the
    /// watcher was torn down first.
    pub fn wait_since(&self, since: u64, timeout: Option<Duration>) -> bool {
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let mut counter = self.counter.lock();

        loop {
            if counter.seq > since {
                return true;
            }
            if counter.closed {
                return false;
            }
            match deadline {
                Some(deadline) => {
                    if self.edge_cond.wait_until(&mut counter, deadline).timed_out() {
                        return counter.seq > since;
                    }
                }
                None => self.edge_cond.wait(&mut counter),
            }
        }
    }

    fn dispatch(&self) {
        // snapshot so callbacks may register further callbacks
        let callbacks = self.callbacks.lock().clone();
        for callback in callbacks {
            if self.is_closed() {
                return;
            }
            if panic::catch_unwind(AssertUnwindSafe(|| callback(self.channel))).is_err() {
                error!("edge callback for channel {} panicked", self.channel);
            }
        }
    }
}

/// Background listener for one line: filters and debounces edges, raises the
/// event flag, wakes waiters and queues callback dispatch.
pub(crate) struct EdgeWatcher {
    gpio: u32,
    shared: Arc<EdgeShared>,
    backend: Arc<dyn GpioBackend>,
    cancel: Arc<AtomicBool>,
    listener: Option<JoinHandle<()>>,
    dispatcher: Option<JoinHandle<()>>,
}

impl EdgeWatcher {
    pub fn spawn(
        backend: Arc<dyn GpioBackend>,
        pin: ResolvedPin,
        config: WatchConfig,
        last_edge: LastEdge,
        poll_interval: Duration,
    ) -> Result<Self, GpioError> {
        backend.set_edge(pin.gpio, Some(config.edge))?;

        let shared = Arc::new(EdgeShared {
            channel: pin.channel,
            config,
            event_flag: AtomicBool::new(false),
            callbacks: Mutex::new(Vec::new()),
            counter: Mutex::new(EdgeCounter {
                seq: 0,
                closed: false,
            }),
            edge_cond: Condvar::new(),
        });
        let cancel = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel::<()>();

        let threads = Self::spawn_dispatcher(pin.gpio, shared.clone(), rx).and_then(|dispatcher| {
            let listener = Listener {
                gpio: pin.gpio,
                backend: backend.clone(),
                shared: shared.clone(),
                cancel: cancel.clone(),
                tx,
                last_edge,
                poll_interval,
            };
            thread::Builder::new()
                .name(format!("gpio{}-edge", pin.gpio))
                .spawn(move || listener.run())
                .map(|listener| (listener, dispatcher))
                .map_err(|e| GpioError::Gpio(format!("spawn edge listener: {e}")))
        });

        let (listener, dispatcher) = match threads {
            Ok(threads) => threads,
            Err(e) => {
                let _ = backend.set_edge(pin.gpio, None);
                return Err(e);
            }
        };
        debug!(
            "watching gpio {} for {:?} edges, bounce {:?}",
            pin.gpio, config.edge, config.bounce
        );

        Ok(Self {
            gpio: pin.gpio,
            shared,
            backend,
            cancel,
            listener: Some(listener),
            dispatcher: Some(dispatcher),
        })
    }

    fn spawn_dispatcher(
        gpio: u32,
        shared: Arc<EdgeShared>,
        rx: mpsc::Receiver<()>,
    ) -> Result<JoinHandle<()>, GpioError> {
        thread::Builder::new()
            .name(format!("gpio{gpio}-dispatch"))
            .spawn(move || {
                // ends once the listener drops its sender
                for () in rx {
                    shared.dispatch();
                }
            })
            .map_err(|e| GpioError::Gpio(format!("spawn edge dispatcher: {e}")))
    }

    pub fn shared(&self) -> Arc<EdgeShared> {
        self.shared.clone()
    }

    pub fn config(&self) -> WatchConfig {
        self.shared.config
    }

    pub fn add_callback(&self, callback: EdgeCallback) {
        self.shared.callbacks.lock().push(callback);
    }

    pub fn has_callbacks(&self) -> bool {
        !self.shared.callbacks.lock().is_empty()
    }

    /// Stops listening and disarms the line. No callback starts after this
    /// returns. Never waits on the dispatcher, so it may run under the pin
    /// lock.
    pub fn stop(&mut self) {
        self.cancel.store(true, Ordering::Relaxed);
        // nothing dispatches once closed, including an edge already queued
        self.shared.close();
        let Some(handle) = self.listener.take() else {
            return;
        };
        let _ = handle.join();
        if let Err(e) = self.backend.set_edge(self.gpio, None) {
            warn!("failed to disarm edge detection on gpio {}: {e}", self.gpio);
        }
    }
}

impl Drop for EdgeWatcher {
    fn drop(&mut self) {
        self.stop();
        if let Some(handle) = self.dispatcher.take() {
            if handle.thread().id() == thread::current().id() {
                // torn down from one of our own callbacks; the dispatcher
                // skips what is left and exits on its own
                debug!("edge watcher on gpio {} dropped from its dispatcher", self.gpio);
            } else {
                let _ = handle.join();
            }
        }
    }
}

struct Listener {
    gpio: u32,
    backend: Arc<dyn GpioBackend>,
    shared: Arc<EdgeShared>,
    cancel: Arc<AtomicBool>,
    tx: mpsc::Sender<()>,
    last_edge: LastEdge,
    poll_interval: Duration,
}

impl Listener {
    fn run(self) {
        let config = self.shared.config;

        while !self.cancel.load(Ordering::Relaxed) {
            let sample = match self.backend.block_until_edge(self.gpio, self.poll_interval) {
                Ok(Some(sample)) => sample,
                Ok(None) => continue,
                Err(e) => {
                    warn!("wait edge error for gpio {}: {e}", self.gpio);
                    thread::sleep(self.poll_interval);
                    continue;
                }
            };

            if self.cancel.load(Ordering::Relaxed) {
                break;
            }
            if !config.edge.accepts(sample.level) {
                continue;
            }
            {
                let mut last = self.last_edge.lock();
                if let Some(prev) = *last
                    && sample.timestamp.saturating_sub(prev) < config.bounce
                {
                    continue;
                }
                *last = Some(sample.timestamp);
            }

            self.shared.accept();
            if self.tx.send(()).is_err() {
                break;
            }
        }
    }
}
