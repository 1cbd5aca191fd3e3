use crate::cache::{FileIndicatorCache, IndicatorCache};
use anyhow::{Context, Result};
use log::info;
use std::path::Path;

pub fn run(cache_dir: &Path) -> Result<()> {
    FileIndicatorCache::new(cache_dir)
        .clear()
        .with_context(|| format!("Failed to clear indicator cache at {}", cache_dir.display()))?;
    info!("Cleared indicator cache at {}", cache_dir.display());
    Ok(())
}
