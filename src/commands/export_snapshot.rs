use crate::market_data::{file_symbol, load_csv, save_snapshot};
use anyhow::{anyhow, Result};
use log::info;
use std::path::{Path, PathBuf};

/// Pack CSV bar files into a single bincode snapshot.
pub fn run(
    inputs: &[PathBuf],
    symbol: Option<&str>,
    timeframe: &str,
    output: &Path,
) -> Result<()> {
    if inputs.is_empty() {
        return Err(anyhow!("At least one --input CSV file is required"));
    }
    if symbol.is_some() && inputs.len() > 1 {
        return Err(anyhow!("--symbol can only be used with a single --input file"));
    }

    let mut series = Vec::with_capacity(inputs.len());
    for path in inputs {
        let name = match symbol {
            Some(symbol) => symbol.to_string(),
            None => file_symbol(path)
                .ok_or_else(|| anyhow!("Cannot derive a symbol from {}", path.display()))?,
        };
        series.push(load_csv(path, &name, timeframe)?);
    }

    save_snapshot(output, &series)?;
    info!(
        "Exported {} series ({} bars) to {}",
        series.len(),
        series.iter().map(|s| s.bars.len()).sum::<usize>(),
        output.display()
    );
    Ok(())
}
