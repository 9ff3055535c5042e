//! Calibration diagnostics: negative log-likelihood and expected calibration error.

use crate::scores::prob::{log_prob, softmax_with_temperature, top_class};

/// One labeled logit vector at a single exit
#[derive(Debug, Clone, Copy)]
pub struct ExitSample<'a> {
    pub logits: &'a [f64],
    pub label: usize,
}

/// Mean negative log-likelihood of the true labels at `temperature`.
///
/// Returns `0.0` for an empty sample set.
pub fn mean_nll(samples: &[ExitSample<'_>], temperature: f64) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let total: f64 = samples
        .iter()
        .map(|s| -log_prob(s.logits, temperature, s.label))
        .sum();
    total / samples.len() as f64
}

/// Derivative of the mean NLL with respect to `log T`, up to a positive factor.
///
/// Equals `mean(z_y - E_p[z]) / T`; only the sign matters to the search and it
/// is non-decreasing in `T`.
pub(crate) fn nll_slope(samples: &[ExitSample<'_>], temperature: f64) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let total: f64 = samples
        .iter()
        .map(|s| {
            let probs = softmax_with_temperature(s.logits, temperature);
            let expected: f64 = probs.iter().zip(s.logits).map(|(p, z)| p * z).sum();
            s.logits.get(s.label).copied().unwrap_or(0.0) - expected
        })
        .sum();
    total / samples.len() as f64 / temperature
}

/// Expected calibration error of top-class confidence at `temperature`.
///
/// Equal-width bins over `[0, 1]`: `[0, 1/B), ..., [(B-1)/B, 1]`. Returns
/// `0.0` for empty input or zero bins.
pub fn expected_calibration_error(
    samples: &[ExitSample<'_>],
    temperature: f64,
    num_bins: usize,
) -> f64 {
    if samples.is_empty() || num_bins == 0 {
        return 0.0;
    }

    let mut bin_conf = vec![0.0_f64; num_bins];
    let mut bin_correct = vec![0.0_f64; num_bins];
    let mut bin_counts = vec![0_usize; num_bins];

    for sample in samples {
        let probs = softmax_with_temperature(sample.logits, temperature);
        let Some((class, conf)) = top_class(&probs) else {
            continue;
        };
        let conf = conf.clamp(0.0, 1.0);
        let bin = ((conf * num_bins as f64) as usize).min(num_bins - 1);
        bin_conf[bin] += conf;
        if class == sample.label {
            bin_correct[bin] += 1.0;
        }
        bin_counts[bin] += 1;
    }

    let n = samples.len() as f64;
    (0..num_bins)
        .filter(|&b| bin_counts[b] > 0)
        .map(|b| {
            let count = bin_counts[b] as f64;
            (count / n) * (bin_conf[b] / count - bin_correct[b] / count).abs()
        })
        .sum()
}
