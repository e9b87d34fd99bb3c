//! Baud rate selection
//!
//! Rates are chosen by symbol (`115200`, `B115200`, `auto`). With `auto` the
//! link probes the rates in [`PROBE_RATES`] in turn until the peer answers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Supported line rates
pub const STANDARD_RATES: [u32; 12] = [
    1200, 2400, 4800, 9600, 19200, 38400, 57600, 115200, 230400, 460800, 921600, 1000000,
];

/// Rates tried in turn by automatic selection
pub const PROBE_RATES: [u32; 2] = [9600, 115200];

/// Unknown baud rate symbol
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unsupported baud rate: {0}")]
pub struct BaudRateError(pub String);

/// Configured baud rate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum BaudSelection {
    /// Always this rate
    Fixed(u32),
    /// Cycle through [`PROBE_RATES`] after failed connects
    Auto,
}

impl Default for BaudSelection {
    fn default() -> Self {
        Self::Fixed(115200)
    }
}

impl FromStr for BaudSelection {
    type Err = BaudRateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let symbol = s.trim();
        if symbol.eq_ignore_ascii_case("auto") {
            return Ok(Self::Auto);
        }
        let digits = symbol.strip_prefix(['B', 'b']).unwrap_or(symbol);
        digits
            .parse::<u32>()
            .ok()
            .filter(|rate| STANDARD_RATES.contains(rate))
            .map(Self::Fixed)
            .ok_or_else(|| BaudRateError(s.to_string()))
    }
}

impl TryFrom<String> for BaudSelection {
    type Error = BaudRateError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BaudSelection> for String {
    fn from(value: BaudSelection) -> Self {
        value.to_string()
    }
}

impl fmt::Display for BaudSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(rate) => write!(f, "{rate}"),
            Self::Auto => f.write_str("auto"),
        }
    }
}

/// Rate currently in use for a link
#[derive(Debug, Clone)]
pub struct BaudRate {
    selection: BaudSelection,
    probe_index: usize,
}

impl BaudRate {
    /// Start at the first rate of `selection`
    pub fn new(selection: BaudSelection) -> Self {
        Self {
            selection,
            probe_index: 0,
        }
    }

    /// Rate to open the device with
    pub fn current(&self) -> u32 {
        match self.selection {
            BaudSelection::Fixed(rate) => rate,
            BaudSelection::Auto => PROBE_RATES[self.probe_index],
        }
    }

    /// Is the rate being probed?
    pub fn is_auto(&self) -> bool {
        self.selection == BaudSelection::Auto
    }

    /// Move on to the next probe rate. Returns `true` if the rate changed.
    pub fn toggle(&mut self) -> bool {
        if !self.is_auto() {
            return false;
        }
        self.probe_index = (self.probe_index + 1) % PROBE_RATES.len();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_symbols() {
        assert_eq!("115200".parse(), Ok(BaudSelection::Fixed(115200)));
        assert_eq!("B9600".parse(), Ok(BaudSelection::Fixed(9600)));
        assert_eq!("AUTO".parse(), Ok(BaudSelection::Auto));
        assert!("12345".parse::<BaudSelection>().is_err());
        assert!("fast".parse::<BaudSelection>().is_err());
    }

    #[test]
    fn test_auto_toggles() {
        let mut rate = BaudRate::new(BaudSelection::Auto);
        assert_eq!(rate.current(), 9600);
        assert!(rate.toggle());
        assert_eq!(rate.current(), 115200);
        rate.toggle();
        assert_eq!(rate.current(), 9600);
    }

    #[test]
    fn test_fixed_does_not_toggle() {
        let mut rate = BaudRate::new(BaudSelection::Fixed(57600));
        assert!(!rate.toggle());
        assert_eq!(rate.current(), 57600);
    }

    #[test]
    fn test_serde_as_string() {
        #[derive(Deserialize)]
        struct Wrapper {
            baud: BaudSelection,
        }
        let parsed: Wrapper = toml::from_str("baud = \"auto\"").unwrap();
        assert_eq!(parsed.baud, BaudSelection::Auto);
    }
}
