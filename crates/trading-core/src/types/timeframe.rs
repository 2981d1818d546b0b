//! Candle timeframe definitions.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Timeframe for candles.
///
/// Every variant has a fixed length, so bucket boundaries are a plain
/// floor of the epoch timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    #[default]
    Minute1,
    #[serde(rename = "3m")]
    Minute3,
    #[serde(rename = "5m")]
    Minute5,
    #[serde(rename = "15m")]
    Minute15,
    #[serde(rename = "30m")]
    Minute30,
    #[serde(rename = "1h")]
    Hour1,
    #[serde(rename = "4h")]
    Hour4,
    #[serde(rename = "1d")]
    Daily,
    #[serde(rename = "1w")]
    Weekly,
}

impl Timeframe {
    /// Get the duration of the timeframe in seconds.
    pub fn as_secs(&self) -> u64 {
        match self {
            Timeframe::Minute1 => 60,
            Timeframe::Minute3 => 180,
            Timeframe::Minute5 => 300,
            Timeframe::Minute15 => 900,
            Timeframe::Minute30 => 1800,
            Timeframe::Hour1 => 3600,
            Timeframe::Hour4 => 14400,
            Timeframe::Daily => 86400,
            Timeframe::Weekly => 604800,
        }
    }

    /// Get the duration of the timeframe in milliseconds.
    pub fn as_millis(&self) -> i64 {
        self.as_secs() as i64 * 1000
    }

    /// Start of the bucket containing `timestamp_ms`.
    ///
    /// Weekly buckets are aligned to the Unix epoch (a Thursday), not to
    /// calendar weeks.
    pub fn bucket_start(&self, timestamp_ms: i64) -> i64 {
        timestamp_ms.div_euclid(self.as_millis()) * self.as_millis()
    }

    /// End (exclusive) of the bucket containing `timestamp_ms`.
    pub fn bucket_end(&self, timestamp_ms: i64) -> i64 {
        self.bucket_start(timestamp_ms) + self.as_millis()
    }

    /// Check if this is an intraday timeframe.
    pub fn is_intraday(&self) -> bool {
        self.as_secs() < 86400
    }

    /// Get all available timeframes.
    pub fn all() -> &'static [Timeframe] {
        &[
            Timeframe::Minute1,
            Timeframe::Minute3,
            Timeframe::Minute5,
            Timeframe::Minute15,
            Timeframe::Minute30,
            Timeframe::Hour1,
            Timeframe::Hour4,
            Timeframe::Daily,
            Timeframe::Weekly,
        ]
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Timeframe::Minute1 => "1m",
            Timeframe::Minute3 => "3m",
            Timeframe::Minute5 => "5m",
            Timeframe::Minute15 => "15m",
            Timeframe::Minute30 => "30m",
            Timeframe::Hour1 => "1h",
            Timeframe::Hour4 => "4h",
            Timeframe::Daily => "1d",
            Timeframe::Weekly => "1w",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for Timeframe {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "1m" | "1min" | "minute" => Ok(Timeframe::Minute1),
            "3m" | "3min" => Ok(Timeframe::Minute3),
            "5m" | "5min" => Ok(Timeframe::Minute5),
            "15m" | "15min" => Ok(Timeframe::Minute15),
            "30m" | "30min" => Ok(Timeframe::Minute30),
            "1h" | "1hour" | "hour" | "60m" => Ok(Timeframe::Hour1),
            "4h" | "4hour" | "240m" => Ok(Timeframe::Hour4),
            "1d" | "day" | "daily" => Ok(Timeframe::Daily),
            "1w" | "week" | "weekly" => Ok(Timeframe::Weekly),
            _ => Err(format!("Invalid timeframe: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeframe_duration() {
        assert_eq!(Timeframe::Minute1.as_secs(), 60);
        assert_eq!(Timeframe::Hour1.as_millis(), 3_600_000);
        assert_eq!(Timeframe::Daily.as_secs(), 86400);
    }

    #[test]
    fn test_bucket_boundaries() {
        let tf = Timeframe::Minute5;
        // 2024-01-01 00:07:30 UTC
        let ts = 1_704_067_650_000;
        assert_eq!(tf.bucket_start(ts), 1_704_067_500_000);
        assert_eq!(tf.bucket_end(ts), 1_704_067_800_000);
        // exact boundary belongs to the bucket it starts
        assert_eq!(tf.bucket_start(1_704_067_800_000), 1_704_067_800_000);
    }

    #[test]
    fn test_timeframe_parse() {
        assert_eq!(Timeframe::from_str("1m").unwrap(), Timeframe::Minute1);
        assert_eq!(Timeframe::from_str("4H").unwrap(), Timeframe::Hour4);
        assert_eq!(Timeframe::from_str("daily").unwrap(), Timeframe::Daily);
        assert!(Timeframe::from_str("7m").is_err());
    }

    #[test]
    fn test_timeframe_display_roundtrip() {
        for tf in Timeframe::all() {
            assert_eq!(Timeframe::from_str(&tf.to_string()).unwrap(), *tf);
        }
    }

    #[test]
    fn test_is_intraday() {
        assert!(Timeframe::Minute1.is_intraday());
        assert!(Timeframe::Hour4.is_intraday());
        assert!(!Timeframe::Daily.is_intraday());
    }
}
