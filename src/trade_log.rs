use crate::models::Trade;
use crate::orchestrator::RunReport;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Column order of the closed-trade log. Matches the field order of `TradeLogRow`.
pub const TRADE_LOG_HEADER: [&str; 11] = [
    "symbol",
    "entry_time",
    "exit_time",
    "side",
    "entry_price",
    "exit_price",
    "quantity",
    "pnl",
    "commission",
    "pnl_percent",
    "exit_reason",
];

#[derive(Serialize)]
struct TradeLogRow<'a> {
    symbol: &'a str,
    entry_time: DateTime<Utc>,
    exit_time: DateTime<Utc>,
    side: &'static str,
    entry_price: f64,
    exit_price: f64,
    quantity: f64,
    pnl: f64,
    commission: f64,
    pnl_percent: f64,
    exit_reason: &'static str,
}

impl<'a> From<&'a Trade> for TradeLogRow<'a> {
    fn from(trade: &'a Trade) -> Self {
        Self {
            symbol: &trade.symbol,
            entry_time: trade.entry_time,
            exit_time: trade.exit_time,
            side: trade.side.as_str(),
            entry_price: trade.entry_price,
            exit_price: trade.exit_price,
            quantity: trade.quantity,
            pnl: trade.pnl,
            commission: trade.commission,
            pnl_percent: trade.pnl_percent,
            exit_reason: trade.exit_reason.as_str(),
        }
    }
}

/// Write `trades` as CSV. The header is always written, so an empty ledger
/// still yields a readable file. Returns the number of trade rows.
pub fn write_trades<'a, W, I>(writer: W, trades: I) -> Result<usize>
where
    W: Write,
    I: IntoIterator<Item = &'a Trade>,
{
    let mut wtr = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(writer);
    wtr.write_record(TRADE_LOG_HEADER)
        .context("Failed to write trade log header")?;

    let mut rows = 0usize;
    for trade in trades {
        wtr.serialize(TradeLogRow::from(trade))
            .with_context(|| format!("Failed to write trade row for {}", trade.symbol))?;
        rows += 1;
    }
    wtr.flush().context("Failed to flush trade log")?;
    Ok(rows)
}

/// Export the closed trades of every successful task in `report`, in key order.
pub fn export_trade_log(path: &Path, report: &RunReport) -> Result<usize> {
    let file = File::create(path)
        .with_context(|| format!("Unable to create trade log at {}", path.display()))?;
    let rows = write_trades(
        BufWriter::new(file),
        report
            .successes()
            .flat_map(|(_, result)| result.trades.iter()),
    )?;

    if rows == 0 {
        warn!("No closed trades to export; {} holds only a header", path.display());
    } else {
        info!("Trade log with {} trade(s) exported to {}", rows, path.display());
    }
    Ok(rows)
}
