//! Numerically stable softmax helpers over raw logits.

/// Softmax of `logits / temperature`.
///
/// Uses the max-shift so large logits do not overflow. An empty slice yields
/// an empty vector.
pub fn softmax_with_temperature(logits: &[f64], temperature: f64) -> Vec<f64> {
    if logits.is_empty() {
        return Vec::new();
    }
    let max = logits
        .iter()
        .map(|l| l / temperature)
        .fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = logits
        .iter()
        .map(|l| (l / temperature - max).exp())
        .collect();
    let sum: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// `log softmax(logits / temperature)[class]`
pub fn log_prob(logits: &[f64], temperature: f64, class: usize) -> f64 {
    let scaled: Vec<f64> = logits.iter().map(|l| l / temperature).collect();
    let max = scaled.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let log_sum = scaled.iter().map(|s| (s - max).exp()).sum::<f64>().ln() + max;
    scaled.get(class).copied().unwrap_or(f64::NEG_INFINITY) - log_sum
}

/// Index and value of the largest probability. Ties go to the lowest index.
pub fn top_class(probs: &[f64]) -> Option<(usize, f64)> {
    let mut best: Option<(usize, f64)> = None;
    for (i, &p) in probs.iter().enumerate() {
        match best {
            Some((_, bp)) if p <= bp => {}
            _ => best = Some((i, p)),
        }
    }
    best
}
