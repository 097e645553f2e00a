//! Distribution fitting and scoring of raw anomaly magnitudes.

use crate::likelihood::{AnomalyParams, Distribution, EstimatorError, MetricSample};

/// Floor for the fitted variance so a flat stream does not produce a
/// degenerate distribution.
const MIN_VARIANCE: f64 = 1.5e-5;

/// Distribution used when every sample falls inside the skipped prefix.
const NULL_DISTRIBUTION: Distribution = Distribution {
    mean: 0.5,
    variance: 1.0e6,
    stdev: 1.0e3,
};

/// How many trailing likelihoods are kept in [`AnomalyParams`].
const HISTORICAL_LIKELIHOODS: usize = 10;

/// Fits distribution params from a window of samples and scores new samples
/// against them.
pub trait LikelihoodEstimator: Send + Sync {
    /// Fit on `samples` (ascending), ignoring the first `skip_records`.
    fn fit(&self, samples: &[MetricSample], skip_records: usize) -> Result<AnomalyParams, EstimatorError>;

    /// Likelihood of `sample` under `params`, in `(0, 1]`.
    fn score(&self, sample: &MetricSample, params: &AnomalyParams) -> f64;
}

/// Gaussian fit over raw anomaly scores. The likelihood is the upper-tail
/// probability of the raw score, so only unusually *high* raw scores are
/// unlikely.
#[derive(Debug, Clone, Copy, Default)]
pub struct GaussianTailEstimator;

impl GaussianTailEstimator {
    fn tail_likelihood(raw: f64, distribution: &Distribution) -> f64 {
        if raw <= distribution.mean {
            return 1.0;
        }
        let z = (raw - distribution.mean) / distribution.stdev;
        erfc(z / std::f64::consts::SQRT_2).clamp(f64::MIN_POSITIVE, 1.0)
    }
}

impl LikelihoodEstimator for GaussianTailEstimator {
    fn fit(&self, samples: &[MetricSample], skip_records: usize) -> Result<AnomalyParams, EstimatorError> {
        let raw: Vec<f64> = samples.iter().filter_map(|s| s.raw_anomaly_score).collect();
        if raw.is_empty() {
            return Err(EstimatorError::EmptySamples);
        }

        let distribution = if raw.len() <= skip_records {
            NULL_DISTRIBUTION
        } else {
            let values = &raw[skip_records..];
            let n = values.len() as f64;
            let mean = values.iter().sum::<f64>() / n;
            let variance = values
                .iter()
                .map(|&x| (x - mean).powi(2))
                .sum::<f64>()
                / n;
            let variance = variance.max(MIN_VARIANCE);
            Distribution {
                mean,
                variance,
                stdev: variance.sqrt(),
            }
        };

        let tail_start = raw.len().saturating_sub(HISTORICAL_LIKELIHOODS);
        let historical_likelihoods = raw[tail_start..]
            .iter()
            .map(|&x| Self::tail_likelihood(x, &distribution))
            .collect();

        Ok(AnomalyParams {
            distribution,
            historical_likelihoods,
        })
    }

    fn score(&self, sample: &MetricSample, params: &AnomalyParams) -> f64 {
        let raw = sample.raw_anomaly_score.unwrap_or_default();
        Self::tail_likelihood(raw, &params.distribution)
    }
}

/// Complementary error function, Chebyshev fit with fractional error below
/// 1.2e-7 everywhere.
fn erfc(x: f64) -> f64 {
    let z = x.abs();
    let t = 1.0 / (1.0 + 0.5 * z);
    let poly = -z * z - 1.265_512_23
        + t * (1.000_023_68
            + t * (0.374_091_96
                + t * (0.096_784_18
                    + t * (-0.186_288_06
                        + t * (0.278_868_07
                            + t * (-1.135_203_98
                                + t * (1.488_515_87 + t * (-0.822_152_23 + t * 0.170_872_77))))))));
    let r = t * poly.exp();
    if x >= 0.0 {
        r
    } else {
        2.0 - r
    }
}
