use anyhow::{anyhow, Result};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Extract a parameter as f64 with a default value
pub fn get_param_f64(params: &HashMap<String, f64>, key: &str, default: f64) -> f64 {
    params.get(key).copied().unwrap_or(default)
}

/// Get a parameter as usize with a minimum value
pub fn get_usize_param_min(
    params: &HashMap<String, f64>,
    key: &str,
    default: usize,
    min: usize,
) -> usize {
    params
        .get(key)
        .copied()
        .filter(|v| v.is_finite())
        .map(|v| v.round().max(min as f64) as usize)
        .unwrap_or(default)
}

/// Get a finite parameter value, returns None if not found or not finite
pub fn finite_param(params: &HashMap<String, f64>, key: &str) -> Option<f64> {
    params.get(key).copied().filter(|v| v.is_finite())
}

pub fn coerce_binary_param(value: f64, default: bool) -> bool {
    if !value.is_finite() {
        return default;
    }
    value >= 0.5
}

/// Read a 0/1 flag parameter
pub fn get_flag_param(params: &HashMap<String, f64>, key: &str, default: bool) -> bool {
    params
        .get(key)
        .map(|&v| coerce_binary_param(v, default))
        .unwrap_or(default)
}

/// Parse a `key=value` assignment as passed on the command line
pub fn parse_param_assignment(raw: &str) -> Result<(String, f64)> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("Parameter '{}' must be in key=value form", raw))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(anyhow!("Parameter '{}' has an empty key", raw));
    }
    let value = parse_param_value(value.trim())
        .ok_or_else(|| anyhow!("Parameter {} must be a number (value: {})", key, value))?;
    Ok((key.to_string(), value))
}

/// Parse a `key=v1,v2,...` grid axis as passed on the command line
pub fn parse_grid_axis(raw: &str) -> Result<(String, Vec<f64>)> {
    let (key, values) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("Grid axis '{}' must be in key=v1,v2 form", raw))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(anyhow!("Grid axis '{}' has an empty key", raw));
    }
    let values = values
        .split(',')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(|token| {
            parse_param_value(token)
                .ok_or_else(|| anyhow!("Grid value {} for {} must be a number", token, key))
        })
        .collect::<Result<Vec<f64>>>()?;
    if values.is_empty() {
        return Err(anyhow!("Grid axis {} has no values", key));
    }
    Ok((key.to_string(), values))
}

fn parse_param_value(raw: &str) -> Option<f64> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" => Some(1.0),
        "false" | "no" | "off" => Some(0.0),
        other => other.parse::<f64>().ok().filter(|v| v.is_finite()),
    }
}

fn variation_key(params: &HashMap<String, f64>) -> String {
    let mut sorted_params: Vec<_> = params.iter().collect();
    sorted_params.sort_by(|a, b| a.0.cmp(b.0));
    format!("{:?}", sorted_params)
}

/// Expand a parameter grid into the cartesian product of its axes.
///
/// Axes are visited in key order so the output order is stable; duplicate
/// combinations (from repeated axis values) are dropped.
pub fn expand_parameter_grid(axes: &BTreeMap<String, Vec<f64>>) -> Vec<HashMap<String, f64>> {
    let mut variations: Vec<HashMap<String, f64>> = vec![HashMap::new()];
    for (key, values) in axes {
        if values.is_empty() {
            continue;
        }
        let mut next = Vec::with_capacity(variations.len() * values.len());
        for base in &variations {
            for &value in values {
                let mut params = base.clone();
                params.insert(key.clone(), value);
                next.push(params);
            }
        }
        variations = next;
    }

    let mut seen_variations = HashSet::new();
    variations.retain(|params| seen_variations.insert(variation_key(params)));
    variations
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usize_param_rounds_and_respects_minimum() {
        let mut params = HashMap::new();
        params.insert("period".to_string(), 13.6);
        params.insert("tiny".to_string(), 0.0);
        params.insert("bad".to_string(), f64::NAN);

        assert_eq!(get_usize_param_min(&params, "period", 5, 1), 14);
        assert_eq!(get_usize_param_min(&params, "tiny", 5, 1), 1);
        assert_eq!(get_usize_param_min(&params, "bad", 5, 1), 5);
        assert_eq!(get_usize_param_min(&params, "missing", 5, 1), 5);
    }

    #[test]
    fn flag_param_uses_half_threshold() {
        let mut params = HashMap::new();
        params.insert("on".to_string(), 1.0);
        params.insert("off".to_string(), 0.2);
        assert!(get_flag_param(&params, "on", false));
        assert!(!get_flag_param(&params, "off", true));
        assert!(get_flag_param(&params, "missing", true));
    }

    #[test]
    fn parses_assignments_and_grid_axes() {
        assert_eq!(
            parse_param_assignment("maxRiskFraction=0.01").unwrap(),
            ("maxRiskFraction".to_string(), 0.01)
        );
        assert_eq!(
            parse_param_assignment("allowShort=false").unwrap(),
            ("allowShort".to_string(), 0.0)
        );
        assert!(parse_param_assignment("noequals").is_err());
        assert!(parse_param_assignment("x=abc").is_err());

        let (key, values) = parse_grid_axis("emaFast=20, 30,40").unwrap();
        assert_eq!(key, "emaFast");
        assert_eq!(values, vec![20.0, 30.0, 40.0]);
        assert!(parse_grid_axis("emaFast=").is_err());
    }

    #[test]
    fn grid_expands_to_cartesian_product_without_duplicates() {
        let mut axes = BTreeMap::new();
        axes.insert("a".to_string(), vec![1.0, 2.0]);
        axes.insert("b".to_string(), vec![10.0, 20.0, 10.0]);

        let variations = expand_parameter_grid(&axes);
        assert_eq!(variations.len(), 4);
        assert_eq!(variations[0]["a"], 1.0);
        assert_eq!(variations[0]["b"], 10.0);
        assert_eq!(variations[3]["a"], 2.0);
        assert_eq!(variations[3]["b"], 20.0);
    }

    #[test]
    fn empty_grid_yields_single_base_variation() {
        let variations = expand_parameter_grid(&BTreeMap::new());
        assert_eq!(variations.len(), 1);
        assert!(variations[0].is_empty());
    }
}
