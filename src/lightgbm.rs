use crate::indicators::calculate_sma;
use crate::models::{Bar, MlScore, SignalAction};
use crate::scorer::Scorer;
use anyhow::{anyhow, Context, Result};
use statrs::statistics::Statistics;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

const EPSILON: f64 = 1e-12;
const BUY_PROBABILITY_THRESHOLD: f64 = 0.5;

/// Bars needed to build one feature vector.
pub const FEATURE_WINDOW: usize = 21;
pub const FEATURE_COUNT: usize = 9;
pub const FEATURE_NAMES: [&str; FEATURE_COUNT] = [
    "return_1",
    "return_3",
    "return_5",
    "return_10",
    "sma_10_distance",
    "sma_20_distance",
    "bar_range",
    "volatility_10",
    "volume_change",
];

fn trailing_return(closes: &[f64], lag: usize) -> Option<f64> {
    let last = *closes.last()?;
    let base = *closes.get(closes.len().checked_sub(lag + 1)?)?;
    if base <= 0.0 {
        return None;
    }
    Some(last / base - 1.0)
}

fn sma_distance(closes: &[f64], period: usize) -> Option<f64> {
    if closes.len() < period {
        return None;
    }
    let last = *closes.last()?;
    let sma = calculate_sma(&closes[closes.len() - period..], period)
        .last()
        .copied()
        .flatten()?;
    if sma <= 0.0 {
        return None;
    }
    Some(last / sma - 1.0)
}

/// Feature vector for the last bar of `window`, or `None` when the window is too short.
pub fn window_features(window: &[Bar]) -> Option<Vec<f64>> {
    if window.len() < FEATURE_WINDOW {
        return None;
    }
    let window = &window[window.len() - FEATURE_WINDOW..];
    let closes: Vec<f64> = window.iter().map(|b| b.close).collect();
    let last = window.last()?;
    let prev = &window[window.len() - 2];

    let one_bar_returns: Vec<f64> = closes[closes.len() - 11..]
        .windows(2)
        .map(|pair| if pair[0] > 0.0 { pair[1] / pair[0] - 1.0 } else { 0.0 })
        .collect();
    let volatility = one_bar_returns.std_dev();
    let volume_change = if prev.volume > 0.0 {
        last.volume / prev.volume - 1.0
    } else {
        0.0
    };
    let bar_range = if last.close > 0.0 {
        (last.high - last.low) / last.close
    } else {
        return None;
    };

    let features = vec![
        trailing_return(&closes, 1)?,
        trailing_return(&closes, 3)?,
        trailing_return(&closes, 5)?,
        trailing_return(&closes, 10)?,
        sma_distance(&closes, 10)?,
        sma_distance(&closes, 20)?,
        bar_range,
        if volatility.is_finite() { volatility } else { 0.0 },
        volume_change,
    ];

    if features.iter().all(|v| v.is_finite()) {
        Some(features)
    } else {
        None
    }
}

#[derive(Debug)]
struct Tree {
    split_features: Vec<usize>,
    thresholds: Vec<f64>,
    left_child: Vec<i32>,
    right_child: Vec<i32>,
    leaf_values: Vec<f64>,
    shrinkage: f64,
}

impl Tree {
    fn parse(lines: &mut std::iter::Peekable<std::str::Lines<'_>>) -> Result<Self> {
        let mut num_leaves: Option<usize> = None;
        let mut split_features: Vec<usize> = Vec::new();
        let mut thresholds: Vec<f64> = Vec::new();
        let mut left_child: Vec<i32> = Vec::new();
        let mut right_child: Vec<i32> = Vec::new();
        let mut leaf_values: Vec<f64> = Vec::new();
        let mut shrinkage = 1.0;

        while let Some(peeked) = lines.peek() {
            let peeked = peeked.trim();
            if peeked.starts_with("Tree=") || peeked == "end of trees" {
                break;
            }
            let Some(line) = lines.next().map(str::trim) else {
                break;
            };

            if let Some(raw) = line.strip_prefix("num_leaves=") {
                num_leaves = Some(parse_value(raw, "num_leaves")?);
            } else if let Some(raw) = line.strip_prefix("split_feature=") {
                split_features = parse_array(raw, "split_feature")?;
            } else if let Some(raw) = line.strip_prefix("threshold=") {
                thresholds = parse_array(raw, "threshold")?;
            } else if let Some(raw) = line.strip_prefix("left_child=") {
                left_child = parse_array(raw, "left_child")?;
            } else if let Some(raw) = line.strip_prefix("right_child=") {
                right_child = parse_array(raw, "right_child")?;
            } else if let Some(raw) = line.strip_prefix("leaf_value=") {
                leaf_values = parse_array(raw, "leaf_value")?;
            } else if let Some(raw) = line.strip_prefix("shrinkage=") {
                shrinkage = parse_value(raw, "shrinkage")?;
            }
        }

        let internal_nodes = split_features.len();
        if thresholds.len() != internal_nodes
            || left_child.len() != internal_nodes
            || right_child.len() != internal_nodes
        {
            return Err(anyhow!(
                "LightGBM tree definition invalid: split/child/threshold length mismatch"
            ));
        }

        let declared_leaves = num_leaves.unwrap_or(leaf_values.len());
        if declared_leaves != leaf_values.len() || leaf_values.is_empty() {
            return Err(anyhow!(
                "LightGBM tree leaf count mismatch: expected {declared_leaves}, found {}",
                leaf_values.len()
            ));
        }

        // Children must point forward or at a leaf, which also rules out cycles
        for (node, (&left, &right)) in left_child.iter().zip(right_child.iter()).enumerate() {
            for child in [left, right] {
                let valid = if child < 0 {
                    ((-child - 1) as usize) < leaf_values.len()
                } else {
                    (child as usize) > node && (child as usize) < internal_nodes
                };
                if !valid {
                    return Err(anyhow!(
                        "LightGBM tree node {node} has invalid child reference {child}"
                    ));
                }
            }
        }

        Ok(Self {
            split_features,
            thresholds,
            left_child,
            right_child,
            leaf_values,
            shrinkage,
        })
    }

    fn predict(&self, features: &[f64]) -> f64 {
        if self.split_features.is_empty() {
            return self.leaf_values[0] * self.shrinkage;
        }

        let mut node = 0usize;
        loop {
            let feature_value = features
                .get(self.split_features[node])
                .copied()
                .unwrap_or(0.0);
            let child = if feature_value <= self.thresholds[node] {
                self.left_child[node]
            } else {
                self.right_child[node]
            };

            if child < 0 {
                return self.leaf_values[(-child - 1) as usize] * self.shrinkage;
            }
            node = child as usize;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Objective {
    Binary,
    Multiclass,
}

/// A gradient-boosted tree model parsed from LightGBM's text dump format.
#[derive(Debug)]
pub struct Booster {
    trees: Vec<Tree>,
    feature_count: usize,
    sigmoid: f64,
    num_classes: usize,
    trees_per_iteration: usize,
    objective: Objective,
}

impl Booster {
    pub fn from_model_text(text: &str) -> Result<Self> {
        let mut lines = text.lines().peekable();
        let mut trees = Vec::new();
        let mut max_feature_idx: Option<usize> = None;
        let mut sigmoid = 1.0;
        let mut num_classes: usize = 1;
        let mut trees_per_iteration: usize = 1;
        let mut objective = Objective::Binary;

        while let Some(line) = lines.next() {
            let trimmed = line.trim();
            if trimmed == "end of trees" {
                break;
            }

            if trimmed.starts_with("objective=") {
                sigmoid = extract_sigmoid(trimmed);
                objective = if trimmed.contains("multiclass") {
                    Objective::Multiclass
                } else {
                    Objective::Binary
                };
            } else if let Some(raw) = trimmed.strip_prefix("num_class=") {
                num_classes = parse_value(raw, "num_class")?;
            } else if let Some(raw) = trimmed.strip_prefix("num_tree_per_iteration=") {
                trees_per_iteration = parse_value(raw, "num_tree_per_iteration")?;
            } else if let Some(raw) = trimmed.strip_prefix("max_feature_idx=") {
                max_feature_idx = Some(parse_value(raw, "max_feature_idx")?);
            } else if trimmed.starts_with("Tree=") {
                trees.push(Tree::parse(&mut lines)?);
            }
        }

        if trees.is_empty() {
            return Err(anyhow!("LightGBM model contained no trees"));
        }

        let inferred_max_feature = trees
            .iter()
            .flat_map(|tree| tree.split_features.iter())
            .copied()
            .max()
            .unwrap_or(0);
        let feature_count = max_feature_idx
            .map(|idx| idx + 1)
            .unwrap_or(inferred_max_feature + 1);
        if trees_per_iteration == 0 {
            trees_per_iteration = 1;
        }
        if objective == Objective::Multiclass && num_classes < 2 {
            num_classes = trees_per_iteration.max(2);
        }

        Ok(Self {
            trees,
            feature_count,
            sigmoid,
            num_classes,
            trees_per_iteration,
            objective,
        })
    }

    pub fn num_features(&self) -> usize {
        self.feature_count
    }

    pub fn num_classes(&self) -> usize {
        match self.objective {
            Objective::Binary => 2,
            Objective::Multiclass => self.num_classes,
        }
    }

    /// Class probabilities; binary models return `[p(negative), p(positive)]`.
    pub fn predict_distribution(&self, features: &[f64]) -> Option<Vec<f64>> {
        if features.len() < self.feature_count {
            return None;
        }

        let mut raw_scores = vec![0.0; self.trees_per_iteration];
        for (tree_idx, tree) in self.trees.iter().enumerate() {
            raw_scores[tree_idx % self.trees_per_iteration] += tree.predict(features);
        }

        match self.objective {
            Objective::Binary => {
                let logit = raw_scores[0] * self.sigmoid;
                let probability = (1.0 / (1.0 + (-logit).exp())).clamp(0.0, 1.0);
                Some(vec![1.0 - probability, probability])
            }
            Objective::Multiclass => {
                raw_scores.truncate(self.num_classes.max(2));
                let max_score = raw_scores
                    .iter()
                    .copied()
                    .fold(f64::NEG_INFINITY, f64::max);
                let mut exp_scores: Vec<f64> = raw_scores
                    .iter()
                    .map(|score| (score - max_score).exp())
                    .collect();
                let denom = exp_scores.iter().sum::<f64>();
                if !denom.is_finite() || denom <= EPSILON {
                    return None;
                }
                for score in exp_scores.iter_mut() {
                    *score /= denom;
                }
                Some(exp_scores)
            }
        }
    }
}

fn parse_value<T>(raw: &str, field: &str) -> Result<T>
where
    T: FromStr,
    <T as FromStr>::Err: std::fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|err| anyhow!("Failed to parse {field} value \"{raw}\" in LightGBM model: {err}"))
}

fn parse_array<T>(raw: &str, field: &str) -> Result<Vec<T>>
where
    T: FromStr,
    <T as FromStr>::Err: std::fmt::Display,
{
    raw.split_whitespace()
        .map(|token| {
            token
                .parse::<T>()
                .map_err(|err| anyhow!("Failed to parse {field} entry {token}: {err}"))
        })
        .collect()
}

fn extract_sigmoid(objective_line: &str) -> f64 {
    objective_line
        .split_whitespace()
        .find_map(|token| token.strip_prefix("sigmoid:"))
        .and_then(|raw| raw.parse::<f64>().ok())
        .filter(|value| value.is_finite() && *value > 0.0)
        .unwrap_or(1.0)
}

/// Scorer adapter over a LightGBM model trained on [`window_features`].
///
/// Binary models read the positive class as "buy"; three-class models are
/// read as `[sell, hold, buy]`.
#[derive(Debug, Clone)]
pub struct LightGbmScorer {
    name: String,
    booster: Arc<Booster>,
}

impl LightGbmScorer {
    pub fn from_model_text(name: impl Into<String>, text: &str) -> Result<Self> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(anyhow!("LightGBM model text was empty."));
        }
        let booster = Booster::from_model_text(trimmed)?;
        if booster.num_features() > FEATURE_COUNT {
            return Err(anyhow!(
                "LightGBM model expects {} features but only {} are available",
                booster.num_features(),
                FEATURE_COUNT
            ));
        }
        let classes = booster.num_classes();
        if classes != 2 && classes != 3 {
            return Err(anyhow!(
                "LightGBM model has {} classes; expected binary or 3-class",
                classes
            ));
        }
        Ok(Self {
            name: name.into(),
            booster: Arc::new(booster),
        })
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read LightGBM model {}", path.display()))?;
        let name = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or("lightgbm")
            .to_string();
        Self::from_model_text(name, &text)
    }
}

impl Scorer for LightGbmScorer {
    fn name(&self) -> &str {
        &self.name
    }

    fn lookback(&self) -> usize {
        FEATURE_WINDOW
    }

    fn predict(&self, window: &[Bar]) -> Option<MlScore> {
        let features = window_features(window)?;
        let distribution = self.booster.predict_distribution(&features)?;

        if distribution.len() == 2 {
            let probability = distribution[1];
            return Some(if probability >= BUY_PROBABILITY_THRESHOLD {
                MlScore {
                    action: SignalAction::Buy,
                    confidence: probability,
                }
            } else {
                MlScore {
                    action: SignalAction::Sell,
                    confidence: 1.0 - probability,
                }
            });
        }

        let (class, probability) = distribution
            .iter()
            .copied()
            .enumerate()
            .fold((0usize, f64::NEG_INFINITY), |best, (idx, p)| {
                if p > best.1 {
                    (idx, p)
                } else {
                    best
                }
            });
        let action = match class {
            0 => SignalAction::Sell,
            2 => SignalAction::Buy,
            _ => SignalAction::Hold,
        };
        Some(MlScore {
            action,
            confidence: probability,
        })
    }
}
