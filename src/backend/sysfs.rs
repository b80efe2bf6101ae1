use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::debug;
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::error::GpioError;
use crate::gpio::{Direction, Edge, EdgeSample, GpioBackend, Level, PinFunction, PullMode};

const SYSFS_GPIO_ROOT: &str = "/sys/class/gpio";
// udev may still be fixing permissions right after export
const SYSFS_PERMISSION_RETRIES: u32 = 100;
const SYSFS_PERMISSION_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Legacy `/sys/class/gpio` interface. Edges are waited for with `poll(2)`
/// on the line's `value` attribute.
pub struct SysfsBackend {
    root: PathBuf,
    armed: Mutex<FxHashMap<u32, Arc<File>>>, // value files of lines with edge detection on
    epoch: Instant,
}

impl Default for SysfsBackend {
    fn default() -> Self {
        Self::with_root(SYSFS_GPIO_ROOT)
    }
}

impl SysfsBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            armed: Mutex::new(FxHashMap::default()),
            epoch: Instant::now(),
        }
    }

    fn line_dir(&self, gpio: u32) -> PathBuf {
        self.root.join(format!("gpio{gpio}"))
    }

    fn attr(&self, gpio: u32, name: &str) -> PathBuf {
        self.line_dir(gpio).join(name)
    }

    fn write_attr(path: &Path, value: &str) -> Result<(), GpioError> {
        let mut attempts = 0;
        loop {
            let result = OpenOptions::new()
                .write(true)
                .open(path)
                .and_then(|mut f| f.write_all(value.as_bytes()));
            match result {
                Ok(()) => return Ok(()),
                Err(e)
                    if e.kind() == io::ErrorKind::PermissionDenied
                        && attempts < SYSFS_PERMISSION_RETRIES =>
                {
                    attempts += 1;
                    thread::sleep(SYSFS_PERMISSION_RETRY_DELAY);
                }
                Err(e) => {
                    return Err(GpioError::Gpio(format!(
                        "write {value:?} to {}: {e}",
                        path.display()
                    )));
                }
            }
        }
    }

    fn read_attr(path: &Path) -> Result<String, GpioError> {
        fs::read_to_string(path)
            .map(|s| s.trim().to_string())
            .map_err(|e| GpioError::Gpio(format!("read {}: {e}", path.display())))
    }

    fn parse_level(raw: &str, gpio: u32) -> Result<Level, GpioError> {
        match raw.trim() {
            "0" => Ok(Level::Low),
            "1" => Ok(Level::High),
            other => Err(GpioError::Gpio(format!(
                "unexpected value {other:?} on gpio {gpio}"
            ))),
        }
    }

    fn read_open(file: &File, gpio: u32) -> Result<Level, GpioError> {
        let mut file = file;
        let mut buf = String::new();
        file.seek(SeekFrom::Start(0))
            .and_then(|_| file.read_to_string(&mut buf))
            .map_err(|e| GpioError::Gpio(format!("read value of gpio {gpio}: {e}")))?;
        Self::parse_level(&buf, gpio)
    }
}

impl GpioBackend for SysfsBackend {
    fn export(&self, gpio: u32) -> Result<(), GpioError> {
        if self.line_dir(gpio).exists() {
            return Ok(());
        }
        Self::write_attr(&self.root.join("export"), &gpio.to_string())
    }

    fn unexport(&self, gpio: u32) -> Result<(), GpioError> {
        self.armed.lock().remove(&gpio);
        if !self.line_dir(gpio).exists() {
            return Ok(());
        }
        Self::write_attr(&self.root.join("unexport"), &gpio.to_string())
    }

    fn is_exported(&self, gpio: u32) -> Result<bool, GpioError> {
        Ok(self.line_dir(gpio).exists())
    }

    fn set_direction(
        &self,
        gpio: u32,
        direction: Direction,
        pull: PullMode,
        initial: Option<Level>,
    ) -> Result<(), GpioError> {
        if pull != PullMode::Off {
            debug!("sysfs cannot configure pull resistors, ignoring {pull:?} on gpio {gpio}");
        }

        let value = match (direction, initial) {
            (Direction::Input, _) => "in",
            (Direction::Output, Some(Level::High)) => "high",
            (Direction::Output, Some(Level::Low)) => "low",
            (Direction::Output, None) => "out",
        };
        Self::write_attr(&self.attr(gpio, "direction"), value)
    }

    fn function(&self, gpio: u32) -> Result<PinFunction, GpioError> {
        if !self.line_dir(gpio).exists() {
            return Ok(PinFunction::Input);
        }
        Ok(match Self::read_attr(&self.attr(gpio, "direction"))?.as_str() {
            "in" => PinFunction::Input,
            "out" => PinFunction::Output,
            _ => PinFunction::Unknown,
        })
    }

    fn read_level(&self, gpio: u32) -> Result<Level, GpioError> {
        let raw = Self::read_attr(&self.attr(gpio, "value"))?;
        Self::parse_level(&raw, gpio)
    }

    fn write_level(&self, gpio: u32, level: Level) -> Result<(), GpioError> {
        let raw = match level {
            Level::Low => "0",
            Level::High => "1",
        };
        Self::write_attr(&self.attr(gpio, "value"), raw)
    }

    fn set_edge(&self, gpio: u32, edge: Option<Edge>) -> Result<(), GpioError> {
        let raw = match edge {
            None => "none",
            Some(Edge::Rising) => "rising",
            Some(Edge::Falling) => "falling",
            Some(Edge::Both) => "both",
        };
        Self::write_attr(&self.attr(gpio, "edge"), raw)?;

        let mut armed = self.armed.lock();
        if edge.is_none() {
            armed.remove(&gpio);
            return Ok(());
        }

        let path = self.attr(gpio, "value");
        let file = File::open(&path)
            .map_err(|e| GpioError::Gpio(format!("open {}: {e}", path.display())))?;
        // the first read clears the interrupt already pending from open
        Self::read_open(&file, gpio)?;
        armed.insert(gpio, Arc::new(file));

        Ok(())
    }

    fn block_until_edge(
        &self,
        gpio: u32,
        timeout: Duration,
    ) -> Result<Option<EdgeSample>, GpioError> {
        let file = self
            .armed
            .lock()
            .get(&gpio)
            .cloned()
            .ok_or_else(|| {
                GpioError::InvalidState(format!("edge detection is not armed on gpio {gpio}"))
            })?;

        // sysfs signals a changed value as an exceptional condition
        let pollfd = PollFd::new(file.as_fd(), PollFlags::POLLPRI | PollFlags::POLLERR);
        let timeout = PollTimeout::try_from(timeout.as_millis()).unwrap_or(PollTimeout::MAX);

        match poll(&mut [pollfd], timeout) {
            Ok(0) | Err(Errno::EINTR) => return Ok(None),
            Ok(_) => {}
            Err(e) => return Err(GpioError::Gpio(format!("poll gpio {gpio}: {e}"))),
        }

        let timestamp = self.epoch.elapsed();
        let level = Self::read_open(&file, gpio)?;
        Ok(Some(EdgeSample { level, timestamp }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_root() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("export"), "").unwrap();
        fs::write(dir.path().join("unexport"), "").unwrap();
        dir
    }

    fn fake_line(root: &Path, gpio: u32, value: &str) {
        let line = root.join(format!("gpio{gpio}"));
        fs::create_dir(&line).unwrap();
        fs::write(line.join("direction"), "in").unwrap();
        fs::write(line.join("value"), value).unwrap();
        fs::write(line.join("edge"), "none").unwrap();
    }

    #[test]
    fn export_writes_line_number() {
        let root = fake_root();
        let backend = SysfsBackend::with_root(root.path());

        assert!(!backend.is_exported(17).unwrap());
        backend.export(17).unwrap();
        assert_eq!(fs::read_to_string(root.path().join("export")).unwrap(), "17");
    }

    #[test]
    fn export_skips_existing_line() {
        let root = fake_root();
        fake_line(root.path(), 18, "0");
        let backend = SysfsBackend::with_root(root.path());

        assert!(backend.is_exported(18).unwrap());
        backend.export(18).unwrap();
        assert_eq!(fs::read_to_string(root.path().join("export")).unwrap(), "");
    }

    #[test]
    fn direction_and_value_attributes() {
        let root = fake_root();
        fake_line(root.path(), 18, "0\n");
        let backend = SysfsBackend::with_root(root.path());

        backend
            .set_direction(18, Direction::Output, PullMode::Off, Some(Level::High))
            .unwrap();
        let direction = root.path().join("gpio18/direction");
        assert_eq!(fs::read_to_string(&direction).unwrap(), "high");

        // the kernel reports plain "out" back
        fs::write(&direction, "out").unwrap();
        assert_eq!(backend.function(18).unwrap(), PinFunction::Output);
        assert_eq!(backend.read_level(18).unwrap(), Level::Low);

        backend.write_level(18, Level::High).unwrap();
        assert_eq!(backend.read_level(18).unwrap(), Level::High);
    }

    #[test]
    fn unexported_line_reads_as_input() {
        let root = fake_root();
        let backend = SysfsBackend::with_root(root.path());
        assert_eq!(backend.function(4).unwrap(), PinFunction::Input);
    }

    #[test]
    fn edge_attribute_and_disarm() {
        let root = fake_root();
        fake_line(root.path(), 23, "1");
        let backend = SysfsBackend::with_root(root.path());

        backend.set_edge(23, Some(Edge::Both)).unwrap();
        assert_eq!(
            fs::read_to_string(root.path().join("gpio23/edge")).unwrap(),
            "both"
        );
        assert!(backend.armed.lock().contains_key(&23));

        backend.set_edge(23, None).unwrap();
        assert!(!backend.armed.lock().contains_key(&23));
        assert!(matches!(
            backend.block_until_edge(23, Duration::from_millis(1)),
            Err(GpioError::InvalidState(_))
        ));
    }

    #[test]
    fn armed_line_without_change_times_out() {
        let root = fake_root();
        fake_line(root.path(), 23, "0");
        let backend = SysfsBackend::with_root(root.path());
        backend.set_edge(23, Some(Edge::Rising)).unwrap();

        // a plain file never raises POLLPRI
        let sample = backend.block_until_edge(23, Duration::from_millis(20)).unwrap();
        assert_eq!(sample, None);
    }

    #[test]
    fn garbage_value_is_transport_error() {
        let root = fake_root();
        fake_line(root.path(), 24, "x");
        let backend = SysfsBackend::with_root(root.path());
        assert!(matches!(backend.read_level(24), Err(GpioError::Gpio(_))));
    }
}
