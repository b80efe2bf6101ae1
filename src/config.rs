use std::{collections::BTreeMap, fs, path::Path};

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::GpioError;
use crate::gpio::NumberingMode;

const BCM_GPIO_LINES: u32 = 54;

// Physical header layouts, indexed by BOARD pin number. -1 marks power and ground.
const HEADER_REV1: [i32; 27] = [
    -1, -1, -1, 0, -1, 1, -1, 4, 14, -1, 15, 17, 18, 21, -1, 22, 23, -1, 24, 10, -1, 9, 25, 11, 8,
    -1, 7,
];
const HEADER_REV2: [i32; 27] = [
    -1, -1, -1, 2, -1, 3, -1, 4, 14, -1, 15, 17, 18, 27, -1, 22, 23, -1, 24, 10, -1, 9, 25, 11, 8,
    -1, 7,
];
const HEADER_REV3: [i32; 41] = [
    -1, -1, -1, 2, -1, 3, -1, 4, 14, -1, 15, 17, 18, 27, -1, 22, 23, -1, 24, 10, -1, 9, 25, 11, 8,
    -1, 7, -1, -1, 5, -1, 6, 12, 13, -1, 19, 16, 26, 20, -1, 21,
];

// Pine A64 routes both numbering schemes through its own tables. BOARD pins
// 27/28 carry the ID EEPROM lines.
const PINE_A64_HEADER: [i32; 41] = [
    -1, -1, -1, 227, -1, 226, -1, 362, 32, -1, 33, 71, 72, 233, -1, 76, 77, -1, 78, 64, -1, 65,
    79, 66, 67, -1, 231, 361, 360, 229, -1, 230, 68, 69, -1, 73, 70, 80, 74, -1, 75,
];
const PINE_A64_BCM: [i32; 28] = [
    -1, -1, 227, 226, 362, 229, 230, 231, 67, 65, 64, 66, 68, 69, 32, 33, 70, 71, 72, 73, 74, 75,
    76, 77, 78, 79, 80, 233,
];

/// A GPIO line resolved from a caller channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysicalPin {
    pub gpio: u32,
    pub usable: bool,
}

/// Identity and pin layout of the board the process runs on.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct BoardConfig {
    pub info: BTreeMap<String, String>,
    pub header_pins: u32,
    pub header: FxHashMap<u32, u32>,
    pub gpio_lines: u32,
    /// BCM channel to line. Without it BCM numbers are the line numbers.
    #[serde(default)]
    pub bcm: Option<FxHashMap<u32, u32>>,
    #[serde(default)]
    pub reserved: Vec<u32>,
    #[serde(default)]
    pub pull_fitted: Vec<u32>,
}

impl BoardConfig {
    pub fn raspberry_pi_rev1() -> Self {
        Self::from_header(1, "Model B", "256M", &HEADER_REV1, &[0, 1])
    }

    pub fn raspberry_pi_rev2() -> Self {
        Self::from_header(2, "Model B", "512M", &HEADER_REV2, &[2, 3])
    }

    pub fn raspberry_pi_rev3() -> Self {
        Self::from_header(3, "Pi 3 Model B", "1G", &HEADER_REV3, &[2, 3])
    }

    /// Compute modules expose no header, so only BCM numbering applies.
    pub fn compute_module() -> Self {
        Self {
            info: Self::info(0, "Compute Module", "512M"),
            header_pins: 0,
            header: FxHashMap::default(),
            gpio_lines: BCM_GPIO_LINES,
            bcm: None,
            reserved: Vec::new(),
            pull_fitted: Vec::new(),
        }
    }

    pub fn pine_a64() -> Self {
        let mut board = Self::from_header(0, "Pine A64+", "2G", &PINE_A64_HEADER, &[]);
        board.info.insert("MANUFACTURER".into(), "Pine64".into());
        board.info.insert("PROCESSOR".into(), "A64".into());
        board.gpio_lines = PINE_A64_BCM.len() as u32;
        board.bcm = Some(line_table(&PINE_A64_BCM));
        board
    }

    fn from_header(
        p1_revision: u32,
        model: &str,
        ram: &str,
        table: &[i32],
        pull_fitted: &[u32],
    ) -> Self {
        Self {
            info: Self::info(p1_revision, model, ram),
            header_pins: (table.len() - 1) as u32,
            header: line_table(table),
            gpio_lines: BCM_GPIO_LINES,
            bcm: None,
            reserved: Vec::new(),
            pull_fitted: pull_fitted.to_vec(),
        }
    }

    fn info(p1_revision: u32, model: &str, ram: &str) -> BTreeMap<String, String> {
        [
            ("P1_REVISION", p1_revision.to_string()),
            ("TYPE", model.to_string()),
            ("MANUFACTURER", "Unknown".to_string()),
            ("PROCESSOR", "Unknown".to_string()),
            ("RAM", ram.to_string()),
            ("REVISION", "0000".to_string()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
    }

    pub fn supports_board_numbering(&self) -> bool {
        self.header_pins > 0
    }

    /// Maps a channel under `mode` to its line. `None` when the board has no
    /// such channel or the channel is a power/ground pin.
    pub fn lookup(&self, channel: u32, mode: NumberingMode) -> Option<PhysicalPin> {
        let gpio = match mode {
            NumberingMode::Unset => return None,
            NumberingMode::Board => {
                if channel == 0 || channel > self.header_pins {
                    return None;
                }
                *self.header.get(&channel)?
            }
            NumberingMode::Bcm => {
                if channel >= self.gpio_lines {
                    return None;
                }
                match &self.bcm {
                    Some(bcm) => *bcm.get(&channel)?,
                    None => channel,
                }
            }
        };

        Some(PhysicalPin {
            gpio,
            usable: !self.reserved.contains(&gpio),
        })
    }

    pub fn has_pull_fitted(&self, gpio: u32) -> bool {
        self.pull_fitted.contains(&gpio)
    }
}

fn line_table(table: &[i32]) -> FxHashMap<u32, u32> {
    table
        .iter()
        .enumerate()
        .filter_map(|(pin, gpio)| u32::try_from(*gpio).ok().map(|g| (pin as u32, g)))
        .collect()
}

fn default_warnings() -> bool {
    true
}

fn default_edge_poll_interval_ms() -> u64 {
    10
}

fn default_warning_history_capacity() -> usize {
    64
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GpioConfig {
    pub board: BoardConfig,
    #[serde(default = "default_warnings")]
    pub warnings: bool,
    #[serde(default = "default_edge_poll_interval_ms")]
    pub edge_poll_interval_ms: u64,
    #[serde(default = "default_warning_history_capacity")]
    pub warning_history_capacity: usize,
}

impl GpioConfig {
    pub fn new(board: BoardConfig) -> Self {
        Self {
            board,
            warnings: default_warnings(),
            edge_poll_interval_ms: default_edge_poll_interval_ms(),
            warning_history_capacity: default_warning_history_capacity(),
        }
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, GpioError> {
        let contents = fs::read_to_string(&path)
            .map_err(|e| GpioError::Configuration(format!("Failed to read config: {e}")))?;
        serde_json::from_str(&contents)
            .map_err(|e| GpioError::Configuration(format!("Invalid config json: {e}")))
    }
}

impl Default for GpioConfig {
    fn default() -> Self {
        Self::new(BoardConfig::raspberry_pi_rev3())
    }
}
