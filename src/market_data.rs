use crate::error::DataError;
use crate::models::{Bar, BarSeries};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use log::info;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

pub const BAR_SNAPSHOT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct BarSnapshot {
    version: u32,
    generated_at: DateTime<Utc>,
    series: Vec<BarSeries>,
}

#[derive(Debug, Deserialize)]
struct CsvBar {
    timestamp: String,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
    #[serde(default)]
    gap: Option<String>,
}

/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS`, `YYYY-MM-DD`, or unix seconds.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Ok(parsed.with_timezone(&Utc));
    }
    if let Ok(parsed) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Ok(Utc.from_utc_datetime(&parsed));
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        if let Some(midnight) = date.and_hms_opt(0, 0, 0) {
            return Ok(Utc.from_utc_datetime(&midnight));
        }
    }
    if let Ok(seconds) = raw.parse::<i64>() {
        if let Some(parsed) = Utc.timestamp_opt(seconds, 0).single() {
            return Ok(parsed);
        }
    }
    Err(anyhow!("Unrecognized timestamp '{}'", raw))
}

fn parse_gap_flag(raw: Option<&str>) -> bool {
    matches!(
        raw.map(|value| value.trim().to_ascii_lowercase()).as_deref(),
        Some("1" | "true" | "yes" | "y")
    )
}

/// Read `timestamp,open,high,low,close,volume[,gap]` rows. Rows are kept in
/// file order; ordering problems surface later as data errors. A row that
/// does not parse is a `DataError::MalformedBar` at its bar index.
pub fn read_csv_bars<R: Read>(reader: R) -> Result<Vec<Bar>> {
    let mut rdr = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(reader);

    let mut bars = Vec::new();
    for (row, record) in rdr.deserialize::<CsvBar>().enumerate() {
        let record = record.map_err(|err| DataError::MalformedBar {
            index: row,
            reason: format!("CSV parse error in data row {}: {}", row + 1, err),
        })?;
        let timestamp =
            parse_timestamp(&record.timestamp).map_err(|err| DataError::MalformedBar {
                index: row,
                reason: format!("invalid timestamp in data row {}: {}", row + 1, err),
            })?;
        bars.push(Bar {
            timestamp,
            open: record.open,
            high: record.high,
            low: record.low,
            close: record.close,
            volume: record.volume,
            gap: parse_gap_flag(record.gap.as_deref()),
        });
    }
    Ok(bars)
}

pub fn load_csv(path: &Path, symbol: &str, timeframe: &str) -> Result<BarSeries> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open bar file {}", path.display()))?;
    let bars = read_csv_bars(BufReader::new(file))
        .with_context(|| format!("Failed to read bars from {}", path.display()))?;
    info!(
        "Loaded {} bars for {} ({}) from {}",
        bars.len(),
        symbol,
        timeframe,
        path.display()
    );
    Ok(BarSeries::new(symbol, timeframe, bars))
}

pub fn save_snapshot<P: AsRef<Path>>(path: P, series: &[BarSeries]) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create snapshot directory {}", parent.display())
            })?;
        }
    }

    let file = File::create(path)
        .with_context(|| format!("Unable to create bar snapshot at {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    let snapshot = BarSnapshot {
        version: BAR_SNAPSHOT_VERSION,
        generated_at: Utc::now(),
        series: series.to_vec(),
    };
    bincode::serialize_into(&mut writer, &snapshot)
        .context("Failed to serialize bar snapshot")?;
    writer
        .flush()
        .context("Failed to flush bar snapshot to disk")?;
    Ok(())
}

pub fn load_snapshot<P: AsRef<Path>>(path: P) -> Result<Vec<BarSeries>> {
    let path = path.as_ref();
    let file = File::open(path)
        .with_context(|| format!("Failed to open bar snapshot at {}", path.display()))?;
    let snapshot: BarSnapshot = bincode::deserialize_from(BufReader::new(file))
        .context("Snapshot decode failed")?;

    if snapshot.version != BAR_SNAPSHOT_VERSION {
        return Err(anyhow!(
            "Bar snapshot version mismatch (found {}, expected {})",
            snapshot.version,
            BAR_SNAPSHOT_VERSION
        ));
    }

    info!(
        "Loaded {} series from snapshot {} (generated {})",
        snapshot.series.len(),
        path.display(),
        snapshot.generated_at
    );
    Ok(snapshot.series)
}

/// Load one data argument: a `.bin` snapshot yields every series it holds,
/// anything else is read as CSV named after `symbol` or the file stem.
pub fn load_series(path: &Path, symbol: Option<&str>, timeframe: &str) -> Result<Vec<BarSeries>> {
    let is_snapshot = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("bin"))
        .unwrap_or(false);

    if is_snapshot {
        let mut series = load_snapshot(path)?;
        if let Some(symbol) = symbol {
            series.retain(|s| s.symbol == symbol);
            if series.is_empty() {
                return Err(anyhow!(
                    "Snapshot {} has no series for {}",
                    path.display(),
                    symbol
                ));
            }
        }
        return Ok(series);
    }

    let symbol = match symbol {
        Some(symbol) => symbol.to_string(),
        None => file_symbol(path)
            .ok_or_else(|| anyhow!("Cannot derive a symbol from {}", path.display()))?,
    };
    Ok(vec![load_csv(path, &symbol, timeframe)?])
}

/// Symbol implied by a bar file name (its stem).
pub fn file_symbol(path: &Path) -> Option<String> {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .map(str::to_string)
}

/// Structured data error behind a failed `load_series`. Errors that are not
/// about bar content (missing file, bad snapshot) become `Unreadable`.
pub fn load_error(path: &Path, err: &anyhow::Error) -> DataError {
    match err.downcast_ref::<DataError>() {
        Some(data_error) => data_error.clone(),
        None => DataError::Unreadable {
            path: path.display().to_string(),
            reason: format!("{:#}", err),
        },
    }
}
