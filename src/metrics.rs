use std::fmt;

use nalgebra::{DMatrix, DVector, SymmetricEigen};

use crate::error::{GanError, Result};

fn mean_and_covariance(activations: &DMatrix<f64>) -> Result<(DVector<f64>, DMatrix<f64>)> {
    let n = activations.nrows();
    if n < 2 {
        return Err(GanError::data(format!(
            "need at least 2 activation rows to estimate a covariance, got {n}"
        )));
    }

    let mean = activations.row_mean().transpose();
    let mut centered = activations.clone();
    for mut row in centered.row_iter_mut() {
        row -= mean.transpose();
    }
    let covariance = centered.transpose() * &centered / (n - 1) as f64;

    Ok((mean, covariance))
}

// Square root of a symmetric positive semi-definite matrix; negative eigenvalues from
// round-off are clamped to zero.
fn sqrtm_psd(matrix: DMatrix<f64>) -> DMatrix<f64> {
    let eigen = SymmetricEigen::new(matrix);
    let roots = eigen.eigenvalues.map(|v| v.max(0.0).sqrt());
    &eigen.eigenvectors * DMatrix::from_diagonal(&roots) * eigen.eigenvectors.transpose()
}

/// Fréchet distance between Gaussians fitted to two `[N, F]` activation sets:
/// `|mu_r - mu_f|^2 + tr(S_r) + tr(S_f) - 2 tr(sqrt(S_r S_f))`.
pub fn frechet_distance(real: &DMatrix<f64>, fake: &DMatrix<f64>) -> Result<f64> {
    if real.ncols() != fake.ncols() {
        return Err(GanError::data(format!(
            "activation widths differ: {} vs {}",
            real.ncols(),
            fake.ncols()
        )));
    }
    let (mu_r, sigma_r) = mean_and_covariance(real)?;
    let (mu_f, sigma_f) = mean_and_covariance(fake)?;
    Ok(frechet_distance_from_moments(&mu_r, &sigma_r, &mu_f, &sigma_f))
}

/// Fréchet distance between two Gaussians given by their means and covariances.
///
/// Not clamped: round-off can make the result slightly negative for near identical
/// distributions.
pub fn frechet_distance_from_moments(
    mu_r: &DVector<f64>,
    sigma_r: &DMatrix<f64>,
    mu_f: &DVector<f64>,
    sigma_f: &DMatrix<f64>,
) -> f64 {
    // tr(sqrt(S_r S_f)) == tr(sqrt(sqrt(S_r) S_f sqrt(S_r))), and the latter is symmetric.
    let sqrt_r = sqrtm_psd(sigma_r.clone());
    let inner = &sqrt_r * sigma_f * &sqrt_r;
    let inner = (&inner + inner.transpose()) * 0.5;
    let trace_sqrt = sqrtm_psd(inner).trace();

    let diff = mu_r - mu_f;
    diff.dot(&diff) + sigma_r.trace() + sigma_f.trace() - 2.0 * trace_sqrt
}

/// `exp(E_x[KL(p(y|x) || p(y))])` over `[N, K]` classifier logits.
pub fn inception_score(logits: &DMatrix<f64>) -> Result<f64> {
    let n = logits.nrows();
    if n < 2 {
        return Err(GanError::data(format!(
            "need at least 2 logit rows for an inception score, got {n}"
        )));
    }

    let mut log_probs = logits.clone();
    for mut row in log_probs.row_iter_mut() {
        let max = row.max();
        let log_sum_exp = max + row.iter().map(|v| (v - max).exp()).sum::<f64>().ln();
        row.add_scalar_mut(-log_sum_exp);
    }

    let probs = log_probs.map(f64::exp);
    let marginal = probs.row_mean();
    let log_marginal = marginal.map(|p| p.ln());

    let mean_kl = probs
        .row_iter()
        .zip(log_probs.row_iter())
        .map(|(p, log_p)| {
            p.iter()
                .zip(log_p.iter())
                .zip(log_marginal.iter())
                .filter(|((p, _), _)| **p > 0.0)
                .map(|((p, log_p), log_m)| p * (log_p - log_m))
                .sum::<f64>()
        })
        .sum::<f64>()
        / n as f64;

    Ok(mean_kl.exp())
}

/// Mean and population standard deviation of a metric across checkpoints.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricSummary {
    pub mean: f64,
    pub std: f64,
}

impl MetricSummary {
    pub fn from_values(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        Some(Self {
            mean,
            std: var.sqrt(),
        })
    }
}

impl fmt::Display for MetricSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+-{}", self.mean, self.std)
    }
}
