use std::str::FromStr;
use std::time::Duration;

use crate::config::BoardConfig;
use crate::error::GpioError;
use crate::gpio::{Level, NumberingMode};

/// A single argument or an ordered batch of them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OneOrMany<T> {
    Single(T),
    Many(Vec<T>),
}

pub type Channels = OneOrMany<u32>;
pub type Levels = OneOrMany<Level>;

impl<T> OneOrMany<T> {
    pub fn len(&self) -> usize {
        match self {
            OneOrMany::Single(_) => 1,
            OneOrMany::Many(items) => items.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_slice(&self) -> &[T] {
        match self {
            OneOrMany::Single(item) => std::slice::from_ref(item),
            OneOrMany::Many(items) => items,
        }
    }
}

impl From<u32> for Channels {
    fn from(channel: u32) -> Self {
        OneOrMany::Single(channel)
    }
}

impl From<Vec<u32>> for Channels {
    fn from(channels: Vec<u32>) -> Self {
        OneOrMany::Many(channels)
    }
}

impl From<&[u32]> for Channels {
    fn from(channels: &[u32]) -> Self {
        OneOrMany::Many(channels.to_vec())
    }
}

impl<const N: usize> From<[u32; N]> for Channels {
    fn from(channels: [u32; N]) -> Self {
        OneOrMany::Many(channels.to_vec())
    }
}

impl From<Level> for Levels {
    fn from(level: Level) -> Self {
        OneOrMany::Single(level)
    }
}

impl From<bool> for Levels {
    fn from(level: bool) -> Self {
        OneOrMany::Single(level.into())
    }
}

impl From<Vec<Level>> for Levels {
    fn from(levels: Vec<Level>) -> Self {
        OneOrMany::Many(levels)
    }
}

impl<const N: usize> From<[Level; N]> for Levels {
    fn from(levels: [Level; N]) -> Self {
        OneOrMany::Many(levels.to_vec())
    }
}

fn parse_channel(raw: &str) -> Result<u32, GpioError> {
    let raw = raw.trim();
    raw.parse::<u32>()
        .map_err(|_| GpioError::NotAnInteger(raw.to_string()))
}

/// Accepts `"7"`, `"7,11"` or `"[7, 11]"`.
impl FromStr for Channels {
    type Err = GpioError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (list, bracketed) = match s.strip_prefix('[').and_then(|r| r.strip_suffix(']')) {
            Some(inner) => (inner, true),
            None => (s, false),
        };

        if !bracketed && !list.contains(',') {
            return parse_channel(list).map(OneOrMany::Single);
        }

        list.split(',')
            .filter(|part| !part.trim().is_empty())
            .map(parse_channel)
            .collect::<Result<Vec<_>, _>>()
            .map(OneOrMany::Many)
    }
}

/// Validates a millisecond count such as a bounce time or timeout.
pub fn millis_from_i64(field: &'static str, raw: i64) -> Result<Duration, GpioError> {
    u64::try_from(raw)
        .map(Duration::from_millis)
        .map_err(|_| GpioError::Configuration(format!("{field} must be greater than or equal to 0")))
}

pub fn millis_from_str(field: &'static str, raw: &str) -> Result<Duration, GpioError> {
    let value = raw.trim().parse::<i64>().map_err(|_| GpioError::NotANumber {
        field,
        raw: raw.to_string(),
    })?;
    millis_from_i64(field, value)
}

/// A caller channel together with the line it resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedPin {
    pub channel: u32,
    pub gpio: u32,
}

pub(crate) fn mode_not_set() -> GpioError {
    GpioError::InvalidState(
        "Please set pin numbering mode using set_mode(NumberingMode::Board) or set_mode(NumberingMode::Bcm)"
            .into(),
    )
}

pub(crate) fn resolve(
    board: &BoardConfig,
    mode: NumberingMode,
    channel: u32,
) -> Result<ResolvedPin, GpioError> {
    if mode == NumberingMode::Unset {
        return Err(mode_not_set());
    }
    match board.lookup(channel, mode) {
        Some(pin) if pin.usable => Ok(ResolvedPin {
            channel,
            gpio: pin.gpio,
        }),
        _ => Err(GpioError::InvalidChannel(channel)),
    }
}

/// Resolves every channel before any caller touches hardware.
pub(crate) fn resolve_all(
    board: &BoardConfig,
    mode: NumberingMode,
    channels: &Channels,
) -> Result<Vec<ResolvedPin>, GpioError> {
    channels
        .as_slice()
        .iter()
        .map(|channel| resolve(board, mode, *channel))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_and_batches() {
        assert_eq!("7".parse::<Channels>().unwrap(), OneOrMany::Single(7));
        assert_eq!(
            "7, 11".parse::<Channels>().unwrap(),
            OneOrMany::Many(vec![7, 11])
        );
        assert_eq!(
            "[12]".parse::<Channels>().unwrap(),
            OneOrMany::Many(vec![12])
        );
    }

    #[test]
    fn non_integer_channel_is_distinct_from_invalid_channel() {
        let err = "d".parse::<Channels>().unwrap_err();
        assert!(matches!(err, GpioError::NotAnInteger(ref raw) if raw == "d"));

        let err = "[d, 12]".parse::<Channels>().unwrap_err();
        assert!(matches!(err, GpioError::NotAnInteger(_)));

        let board = BoardConfig::raspberry_pi_rev3();
        let err = resolve(&board, NumberingMode::Board, 6).unwrap_err();
        assert!(matches!(err, GpioError::InvalidChannel(6)));
        assert_ne!(
            GpioError::NotAnInteger("d".into()).to_string(),
            GpioError::InvalidChannel(6).to_string()
        );
    }

    #[test]
    fn resolve_all_fails_on_any_bad_channel() {
        let board = BoardConfig::raspberry_pi_rev3();
        let ok = resolve_all(&board, NumberingMode::Board, &vec![12u32, 22].into()).unwrap();
        assert_eq!(
            ok,
            vec![
                ResolvedPin { channel: 12, gpio: 18 },
                ResolvedPin { channel: 22, gpio: 25 }
            ]
        );

        let err = resolve_all(&board, NumberingMode::Board, &vec![12u32, 6].into()).unwrap_err();
        assert!(matches!(err, GpioError::InvalidChannel(6)));

        let err = resolve_all(&board, NumberingMode::Unset, &12u32.into()).unwrap_err();
        assert!(matches!(err, GpioError::InvalidState(_)));
    }

    #[test]
    fn millis_rejects_negative_and_text() {
        assert_eq!(
            millis_from_i64("bouncetime", 200).unwrap(),
            Duration::from_millis(200)
        );
        assert!(matches!(
            millis_from_i64("bouncetime", -1),
            Err(GpioError::Configuration(_))
        ));
        assert!(matches!(
            millis_from_str("timeout", "beer"),
            Err(GpioError::NotANumber { field: "timeout", .. })
        ));
        assert!(matches!(
            millis_from_str("timeout", "-1234"),
            Err(GpioError::Configuration(_))
        ));
        assert_eq!(
            millis_from_str("timeout", " 200 ").unwrap(),
            Duration::from_millis(200)
        );
    }

    #[test]
    fn batch_lengths() {
        let levels: Levels = [Level::High, Level::Low].into();
        assert_eq!(levels.len(), 2);
        let single: Levels = true.into();
        assert_eq!(single.as_slice(), &[Level::High]);
    }
}
