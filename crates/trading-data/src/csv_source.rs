//! CSV candle source for replay.

use chrono::{NaiveDate, NaiveDateTime};
use csv::ReaderBuilder;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use trading_core::error::DataError;
use trading_core::types::Candle;

/// CSV record format.
#[derive(Debug, Deserialize)]
struct CsvRecord {
    #[serde(alias = "Date", alias = "date", alias = "Timestamp", alias = "time", alias = "open_time")]
    timestamp: String,
    #[serde(alias = "Open")]
    open: f64,
    #[serde(alias = "High")]
    high: f64,
    #[serde(alias = "Low")]
    low: f64,
    #[serde(alias = "Close")]
    close: f64,
    #[serde(alias = "Volume", default)]
    volume: f64,
    #[serde(alias = "taker_buy_volume", default)]
    buy_volume: Option<f64>,
    #[serde(alias = "quote_asset_volume", default)]
    quote_volume: Option<f64>,
    #[serde(alias = "trade_count", alias = "number_of_trades", default)]
    trades: Option<u64>,
}

/// Loads historical candles from a CSV file.
///
/// Required columns are `timestamp, open, high, low, close`; `volume`,
/// `buy_volume`, `quote_volume` and `trades` are optional.
#[derive(Debug, Clone)]
pub struct CsvCandleSource {
    path: PathBuf,
}

impl CsvCandleSource {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, DataError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(DataError::NoDataAvailable(path.display().to_string()));
        }
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load every candle in the file, sorted by open time.
    pub fn load(&self) -> Result<Vec<Candle>, DataError> {
        let reader = ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_path(&self.path)
            .map_err(|e| DataError::ParseError(e.to_string()))?;

        let candles = read_candles(reader)?;
        info!(path = %self.path.display(), candles = candles.len(), "Loaded candles from CSV");
        Ok(candles)
    }
}

/// Load candles from a CSV file.
pub fn load_candles(path: impl AsRef<Path>) -> Result<Vec<Candle>, DataError> {
    CsvCandleSource::new(path)?.load()
}

fn read_candles<R: std::io::Read>(mut reader: csv::Reader<R>) -> Result<Vec<Candle>, DataError> {
    let mut candles = Vec::new();

    for (row, result) in reader.deserialize().enumerate() {
        let record: CsvRecord =
            result.map_err(|e| DataError::ParseError(format!("row {}: {}", row + 1, e)))?;
        candles.push(to_candle(record, row + 1)?);
    }

    candles.sort_by_key(|c| c.open_time);
    let before = candles.len();
    candles.dedup_by_key(|c| c.open_time);
    if candles.len() != before {
        debug!(dropped = before - candles.len(), "Dropped duplicate candle rows");
    }

    Ok(candles)
}

fn to_candle(record: CsvRecord, row: usize) -> Result<Candle, DataError> {
    let open_time = parse_timestamp(&record.timestamp)?;

    if record.low > record.high
        || record.open < record.low
        || record.open > record.high
        || record.close < record.low
        || record.close > record.high
    {
        return Err(DataError::ParseError(format!(
            "row {}: prices outside the high/low range",
            row
        )));
    }

    let mut candle = Candle::new(
        open_time,
        record.open,
        record.high,
        record.low,
        record.close,
        record.volume,
    );
    if let Some(buy) = record.buy_volume {
        candle.buy_volume = buy.clamp(0.0, candle.volume);
    }
    if let Some(quote) = record.quote_volume {
        candle.quote_volume = quote;
    }
    if let Some(trades) = record.trades {
        candle.trade_count = trades;
    }
    Ok(candle)
}

/// Parse ISO dates, `%Y-%m-%d %H:%M:%S`, or Unix seconds/milliseconds.
fn parse_timestamp(value: &str) -> Result<i64, DataError> {
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(value) {
        return Ok(dt.timestamp_millis());
    }

    let datetime_formats = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y/%m/%d %H:%M:%S"];
    for format in datetime_formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(value, format) {
            return Ok(dt.and_utc().timestamp_millis());
        }
    }

    for format in ["%Y-%m-%d", "%Y/%m/%d"] {
        if let Ok(d) = NaiveDate::parse_from_str(value, format) {
            if let Some(dt) = d.and_hms_opt(0, 0, 0) {
                return Ok(dt.and_utc().timestamp_millis());
            }
        }
    }

    if let Ok(ts) = value.parse::<i64>() {
        // Assume milliseconds if > 10 digits
        return Ok(if ts > 10_000_000_000 { ts } else { ts * 1000 });
    }

    Err(DataError::ParseError(format!("Could not parse timestamp: {}", value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reader(data: &str) -> csv::Reader<&[u8]> {
        ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(data.as_bytes())
    }

    #[test]
    fn test_parse_timestamp() {
        assert_eq!(parse_timestamp("1970-01-02").unwrap(), 86_400_000);
        assert_eq!(parse_timestamp("1970-01-01 00:01:00").unwrap(), 60_000);
        assert_eq!(parse_timestamp("1970-01-01T00:00:01Z").unwrap(), 1_000);
        assert_eq!(parse_timestamp("1705312800000").unwrap(), 1_705_312_800_000);
        assert_eq!(parse_timestamp("1705312800").unwrap(), 1_705_312_800_000);
        assert!(parse_timestamp("yesterday").is_err());
    }

    #[test]
    fn test_read_with_optional_columns() {
        let data = "\
timestamp,open,high,low,close,volume,buy_volume,quote_volume,trades
120,10,12,9,11,5,3,55,7
60,9,10,8,10,4,,,
";
        let candles = read_candles(reader(data)).unwrap();

        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].open_time, 60_000);
        assert_eq!(candles[0].buy_volume, 0.0);
        assert_eq!(candles[0].trade_count, 0);

        let second = &candles[1];
        assert_eq!(second.buy_volume, 3.0);
        assert_eq!(second.quote_volume, 55.0);
        assert_eq!(second.trade_count, 7);
        assert!(second.closed);
    }

    #[test]
    fn test_header_aliases() {
        let data = "Date,Open,High,Low,Close,Volume\n2024-01-01,1,2,0.5,1.5,10\n";
        let candles = read_candles(reader(data)).unwrap();
        assert_eq!(candles.len(), 1);
        assert_eq!(candles[0].close, 1.5);
    }

    #[test]
    fn test_rejects_inconsistent_row() {
        let data = "timestamp,open,high,low,close\n60,10,9,8,10\n";
        assert!(matches!(read_candles(reader(data)), Err(DataError::ParseError(_))));
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            CsvCandleSource::new("/nonexistent/candles.csv"),
            Err(DataError::NoDataAvailable(_))
        ));
    }
}
