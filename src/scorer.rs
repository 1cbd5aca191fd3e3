use crate::models::{Bar, MlScore, SignalAction};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;

/// A model that turns a trailing window of bars into an optional trade opinion.
///
/// Implementations must be deterministic for a given window; the engine calls
/// them once per bar with `bars[..=i]` truncated to [`Scorer::lookback`].
pub trait Scorer: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Number of trailing bars the scorer wants to see.
    fn lookback(&self) -> usize;

    fn predict(&self, window: &[Bar]) -> Option<MlScore>;
}

/// Scorer that never has an opinion.
#[derive(Debug, Default, Clone, Copy)]
pub struct NeutralScorer;

impl Scorer for NeutralScorer {
    fn name(&self) -> &str {
        "neutral"
    }

    fn lookback(&self) -> usize {
        1
    }

    fn predict(&self, _window: &[Bar]) -> Option<MlScore> {
        None
    }
}

#[derive(Debug, Deserialize)]
struct ScoreRecord {
    timestamp: DateTime<Utc>,
    action: String,
    confidence: f64,
}

/// Scores produced ahead of time by an external model, looked up by bar timestamp.
#[derive(Debug, Clone, Default)]
pub struct PrecomputedScorer {
    name: String,
    scores: HashMap<DateTime<Utc>, MlScore>,
}

impl PrecomputedScorer {
    pub fn new(name: impl Into<String>, scores: HashMap<DateTime<Utc>, MlScore>) -> Self {
        Self {
            name: name.into(),
            scores,
        }
    }

    /// Load `[{"timestamp": "...", "action": "buy", "confidence": 0.7}, ...]`.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read score file {}", path.display()))?;
        let records: Vec<ScoreRecord> = serde_json::from_str(&raw)
            .with_context(|| format!("Score file {} is not valid JSON", path.display()))?;

        let mut scores = HashMap::with_capacity(records.len());
        for record in records {
            let action: SignalAction = record.action.parse()?;
            if !record.confidence.is_finite() {
                return Err(anyhow!(
                    "Score at {} has non-finite confidence",
                    record.timestamp
                ));
            }
            scores.insert(
                record.timestamp,
                MlScore {
                    action,
                    confidence: record.confidence.clamp(0.0, 1.0),
                },
            );
        }

        let name = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or("precomputed")
            .to_string();
        Ok(Self::new(name, scores))
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }
}

impl Scorer for PrecomputedScorer {
    fn name(&self) -> &str {
        &self.name
    }

    fn lookback(&self) -> usize {
        1
    }

    fn predict(&self, window: &[Bar]) -> Option<MlScore> {
        let bar = window.last()?;
        self.scores.get(&bar.timestamp).copied()
    }
}

/// Score every bar of a series without look-ahead.
pub fn score_series(scorer: &dyn Scorer, bars: &[Bar]) -> Vec<Option<MlScore>> {
    let lookback = scorer.lookback().max(1);
    (0..bars.len())
        .map(|i| {
            let start = (i + 1).saturating_sub(lookback);
            scorer.predict(&bars[start..=i])
        })
        .collect()
}
