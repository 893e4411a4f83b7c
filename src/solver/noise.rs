//! Gaussian noise models used to whiten factor residuals.

use nalgebra::{DMatrix, DVector};

/// Smallest admissible standard deviation.
pub const MIN_SIGMA: f64 = 1e-9;

/// Gaussian noise on a factor residual.
///
/// Stores the square-root information matrix `L⁻¹` so a residual `r` is
/// whitened as `L⁻¹ r` and its cost is `½‖L⁻¹ r‖²`.
#[derive(Debug, Clone, PartialEq)]
pub struct NoiseModel {
    sqrt_info: DMatrix<f64>,
    diagonal: Option<DVector<f64>>,
}

impl NoiseModel {
    /// Independent components with the given standard deviations.
    pub fn diagonal_sigmas(sigmas: &[f64]) -> Self {
        let sigmas = DVector::from_iterator(sigmas.len(), sigmas.iter().map(|s| s.abs().max(MIN_SIGMA)));
        let sqrt_info = DMatrix::from_diagonal(&sigmas.map(|s| 1.0 / s));
        Self {
            sqrt_info,
            diagonal: Some(sigmas),
        }
    }

    /// Independent components with the given variances.
    pub fn diagonal_variances(variances: &[f64]) -> Self {
        let sigmas: Vec<f64> = variances.iter().map(|v| v.abs().sqrt()).collect();
        Self::diagonal_sigmas(&sigmas)
    }

    /// Same standard deviation on every component.
    pub fn isotropic(dim: usize, sigma: f64) -> Self {
        Self::diagonal_sigmas(&vec![sigma; dim])
    }

    /// Full covariance. Returns `None` if it is not positive definite.
    pub fn from_covariance(covariance: DMatrix<f64>) -> Option<Self> {
        let symmetric = (&covariance + covariance.transpose()) * 0.5;
        let chol = symmetric.cholesky()?;
        let l = chol.l();
        let sqrt_info = l.try_inverse()?;
        Some(Self {
            sqrt_info,
            diagonal: None,
        })
    }

    pub fn dim(&self) -> usize {
        self.sqrt_info.nrows()
    }

    /// Standard deviations when the model is diagonal.
    pub fn sigmas(&self) -> Option<&DVector<f64>> {
        self.diagonal.as_ref()
    }

    pub fn sqrt_information(&self) -> &DMatrix<f64> {
        &self.sqrt_info
    }

    pub fn whiten(&self, residual: &DVector<f64>) -> DVector<f64> {
        &self.sqrt_info * residual
    }

    pub fn whiten_jacobian(&self, jacobian: &DMatrix<f64>) -> DMatrix<f64> {
        &self.sqrt_info * jacobian
    }

    /// Squared Mahalanobis norm `‖L⁻¹ r‖²`.
    pub fn mahalanobis_squared(&self, residual: &DVector<f64>) -> f64 {
        self.whiten(residual).norm_squared()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_diagonal_whitening() {
        let noise = NoiseModel::diagonal_variances(&[0.04, 0.25]);
        let r = DVector::from_vec(vec![0.2, 1.0]);
        assert_relative_eq!(noise.whiten(&r), DVector::from_vec(vec![1.0, 2.0]), epsilon = 1e-12);
        assert_relative_eq!(noise.mahalanobis_squared(&r), 5.0, epsilon = 1e-12);
    }

    #[test]
    fn test_full_covariance_matches_inverse() {
        let cov = DMatrix::from_row_slice(2, 2, &[2.0, 0.5, 0.5, 1.0]);
        let noise = NoiseModel::from_covariance(cov.clone()).unwrap();
        let r = DVector::from_vec(vec![0.3, -0.7]);

        let expected = (r.transpose() * cov.try_inverse().unwrap() * &r)[(0, 0)];
        assert_relative_eq!(noise.mahalanobis_squared(&r), expected, epsilon = 1e-12);
        assert!(noise.sigmas().is_none());
    }

    #[test]
    fn test_non_positive_covariance_rejected() {
        let cov = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 1.0]);
        assert!(NoiseModel::from_covariance(cov).is_none());
    }

    #[test]
    fn test_zero_sigma_clamped() {
        let noise = NoiseModel::isotropic(3, 0.0);
        assert!(noise.sqrt_information().iter().all(|v| v.is_finite()));
    }
}
