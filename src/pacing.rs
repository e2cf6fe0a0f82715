//! Transmission pacing.
//!
//! A sender that must emit more than one packet waits one pacing delay
//! between transmissions:
//!
//! ```text
//! delay = packet_size_bytes * 8 / data_rate_bps
//! ```

use serde::Deserialize;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Data rate in bits per second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(try_from = "String")]
pub struct DataRate(u64);

/// Errors from parsing a data rate string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DataRateError {
    #[error("empty data rate")]
    Empty,
    #[error("invalid number in data rate '{0}'")]
    InvalidNumber(String),
    #[error("unknown data rate unit '{0}'")]
    UnknownUnit(String),
    #[error("data rate must be greater than zero")]
    Zero,
}

impl DataRate {
    pub const fn from_bps(bps: u64) -> Self {
        Self(bps)
    }

    pub const fn from_kbps(kbps: u64) -> Self {
        Self(kbps.saturating_mul(1000))
    }

    pub const fn bps(&self) -> u64 {
        self.0
    }

    /// Time needed to put `bytes` on a link running at this rate.
    pub fn transmit_time(&self, bytes: usize) -> Duration {
        transmit_delay(bytes, *self)
    }
}

impl Default for DataRate {
    fn default() -> Self {
        Self::from_kbps(56)
    }
}

impl fmt::Display for DataRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            bps if bps >= 1_000_000 && bps % 1_000_000 == 0 => write!(f, "{}Mbps", bps / 1_000_000),
            bps if bps >= 1000 && bps % 1000 == 0 => write!(f, "{}kbps", bps / 1000),
            bps => write!(f, "{bps}bps"),
        }
    }
}

impl FromStr for DataRate {
    type Err = DataRateError;

    /// Accepts `<number><unit>` where unit is one of `bps`, `kbps`, `Mbps`,
    /// `Gbps` (case-insensitive, `b/s` spelling also accepted).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(DataRateError::Empty);
        }

        let split = s
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(s.len());
        let (number, unit) = s.split_at(split);

        let value: f64 = number
            .parse()
            .map_err(|_| DataRateError::InvalidNumber(s.to_string()))?;

        let multiplier = match unit.trim().to_ascii_lowercase().as_str() {
            "" | "bps" | "b/s" => 1.0,
            "kbps" | "kb/s" => 1e3,
            "mbps" | "mb/s" => 1e6,
            "gbps" | "gb/s" => 1e9,
            other => return Err(DataRateError::UnknownUnit(other.to_string())),
        };

        let bps = (value * multiplier).round() as u64;
        if bps == 0 {
            return Err(DataRateError::Zero);
        }
        Ok(Self(bps))
    }
}

impl TryFrom<String> for DataRate {
    type Error = DataRateError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Delay before the next packet of `packet_size_bytes` may be sent at `rate`.
///
/// Saturates at `Duration::MAX` when the rate is zero or the delay does not
/// fit in a `Duration`.
pub fn transmit_delay(packet_size_bytes: usize, rate: DataRate) -> Duration {
    if packet_size_bytes == 0 {
        return Duration::ZERO;
    }
    let bits = packet_size_bytes as f64 * 8.0;
    Duration::try_from_secs_f64(bits / rate.bps() as f64).unwrap_or(Duration::MAX)
}
