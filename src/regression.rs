use ndarray::{Array1, Array2, ArrayView1, Axis};
use statrs::distribution::{ContinuousCDF, Normal, StudentsT};

use crate::error::{DmrError, Result};
use crate::utils::mad;

/// Huber tuning constant (95% efficiency under normal errors)
pub const HUBER_K: f64 = 1.345;
/// MAD to standard deviation under normality
const MAD_SCALE: f64 = 0.6744897501960817;

#[derive(Clone, Debug)]
pub struct LinearFit {
    pub coefficients: Array1<f64>,
    /// covariance matrix of the coefficients
    pub covariance: Array2<f64>,
    pub residuals: Array1<f64>,
    pub df_residual: usize,
    pub sigma2: f64,
    /// final IRLS weights, `None` for plain least squares
    pub weights: Option<Array1<f64>>,
}

impl LinearFit {
    pub fn std_error(&self, j: usize) -> f64 {
        self.covariance[[j, j]].max(0.0).sqrt()
    }

    /// Two-sided t-test of coefficient `j` against zero
    pub fn t_test(&self, j: usize) -> Result<(f64, f64)> {
        let se = self.std_error(j);
        if !(se > 0.0) || !se.is_finite() {
            return Err(DmrError::ModelFit(format!("zero standard error for coefficient {}", j)));
        }
        let t = self.coefficients[j] / se;
        Ok((t, two_sided_t_p_value(t, self.df_residual as f64)))
    }
}

pub fn two_sided_t_p_value(t: f64, df: f64) -> f64 {
    match StudentsT::new(0.0, 1.0, df) {
        Ok(dist) => 2.0 * dist.sf(t.abs()),
        Err(_) => f64::NAN,
    }
}

pub fn two_sided_normal_p_value(z: f64) -> f64 {
    let normal = Normal::new(0.0, 1.0).unwrap();
    2.0 * normal.sf(z.abs())
}

/// Lower-triangular Cholesky factor, `None` when `a` is not numerically positive definite
pub fn cholesky(a: &Array2<f64>) -> Option<Array2<f64>> {
    let n = a.nrows();
    let max_diag = a.diag().iter().fold(0.0_f64, |m, v| m.max(v.abs()));
    let eps = 1e-12 * max_diag.max(1e-300);

    let mut l = Array2::<f64>::zeros((n, n));
    for j in 0..n {
        let mut d = a[[j, j]];
        for k in 0..j {
            d -= l[[j, k]] * l[[j, k]];
        }
        if !(d > eps) {
            return None;
        }
        let d = d.sqrt();
        l[[j, j]] = d;
        for i in (j + 1)..n {
            let mut s = a[[i, j]];
            for k in 0..j {
                s -= l[[i, k]] * l[[j, k]];
            }
            l[[i, j]] = s / d;
        }
    }
    Some(l)
}

/// log-determinant from a Cholesky factor
pub fn log_det_cholesky(l: &Array2<f64>) -> f64 {
    2.0 * l.diag().iter().map(|d| d.ln()).sum::<f64>()
}

/// Inverse of a symmetric positive definite matrix through its Cholesky factor
pub fn invert_spd(a: &Array2<f64>) -> Result<Array2<f64>> {
    let l = cholesky(a).ok_or_else(|| DmrError::ModelFit("singular design matrix".to_string()))?;
    let n = l.nrows();
    let mut inv = Array2::<f64>::zeros((n, n));

    for col in 0..n {
        // forward substitution L z = e_col
        let mut z = vec![0.0; n];
        for i in 0..n {
            let mut s = if i == col { 1.0 } else { 0.0 };
            for k in 0..i {
                s -= l[[i, k]] * z[k];
            }
            z[i] = s / l[[i, i]];
        }
        // back substitution L^T x = z
        for i in (0..n).rev() {
            let mut s = z[i];
            for k in (i + 1)..n {
                s -= l[[k, i]] * inv[[k, col]];
            }
            inv[[i, col]] = s / l[[i, i]];
        }
    }
    Ok(inv)
}

fn check_shape(x: &Array2<f64>, y: &Array1<f64>) -> Result<()> {
    if x.nrows() != y.len() {
        return Err(DmrError::ModelFit(format!(
            "design has {} rows for {} observations",
            x.nrows(),
            y.len()
        )));
    }
    if x.nrows() <= x.ncols() {
        return Err(DmrError::ModelFit(format!(
            "{} observations cannot fit {} coefficients",
            x.nrows(),
            x.ncols()
        )));
    }
    if y.iter().any(|v| !v.is_finite()) {
        return Err(DmrError::ModelFit("non-finite response value".to_string()));
    }
    Ok(())
}

/// Ordinary least squares
pub fn ols(x: &Array2<f64>, y: &Array1<f64>) -> Result<LinearFit> {
    check_shape(x, y)?;
    let xtx_inv = invert_spd(&x.t().dot(x))?;
    let coefficients = xtx_inv.dot(&x.t().dot(y));
    let residuals = y - &x.dot(&coefficients);

    let df_residual = x.nrows() - x.ncols();
    let sigma2 = residuals.dot(&residuals) / df_residual as f64;

    Ok(LinearFit {
        coefficients,
        covariance: xtx_inv * sigma2,
        residuals,
        df_residual,
        sigma2,
        weights: None,
    })
}

/// Weighted least squares with non-negative observation weights
pub fn wls(x: &Array2<f64>, y: &Array1<f64>, w: &Array1<f64>) -> Result<LinearFit> {
    check_shape(x, y)?;
    let sw = w.mapv(|v| v.max(0.0).sqrt());
    let xw = x * &sw.view().insert_axis(Axis(1));
    let yw = y * &sw;

    let xtx_inv = invert_spd(&xw.t().dot(&xw))?;
    let coefficients = xtx_inv.dot(&xw.t().dot(&yw));
    let residuals = y - &x.dot(&coefficients);

    let df_residual = x.nrows() - x.ncols();
    let sigma2 = residuals
        .iter()
        .zip(w.iter())
        .map(|(r, w)| w * r * r)
        .sum::<f64>()
        / df_residual as f64;

    Ok(LinearFit {
        coefficients,
        covariance: xtx_inv * sigma2,
        residuals,
        df_residual,
        sigma2,
        weights: Some(w.clone()),
    })
}

pub fn huber_weights(residuals: ArrayView1<f64>, scale: f64) -> Array1<f64> {
    residuals.mapv(|r| {
        let u = (r / scale).abs();
        if u <= HUBER_K {
            1.0
        } else {
            HUBER_K / u
        }
    })
}

/// Huber M-estimation by iteratively reweighted least squares, scale from the residual MAD
pub fn huber(x: &Array2<f64>, y: &Array1<f64>, max_iter: usize, tolerance: f64) -> Result<LinearFit> {
    let mut fit = ols(x, y)?;
    let mut weights = Array1::<f64>::ones(y.len());

    for _ in 0..max_iter {
        let residuals = fit.residuals.to_vec();
        let mut scale = mad(&residuals) / MAD_SCALE;
        if !(scale > 1e-12) {
            scale = fit.sigma2.sqrt();
        }
        if !(scale > 1e-12) {
            // exact fit, nothing to downweight
            fit.weights = Some(weights);
            return Ok(fit);
        }

        weights = huber_weights(fit.residuals.view(), scale);
        let next = wls(x, y, &weights)?;

        let delta = (&next.coefficients - &fit.coefficients)
            .iter()
            .fold(0.0_f64, |m, d| m.max(d.abs()));
        let size = next.coefficients.iter().fold(0.0_f64, |m, b| m.max(b.abs()));
        fit = next;
        if delta <= tolerance * (1.0 + size) {
            return Ok(fit);
        }
    }

    Err(DmrError::ModelFit(format!("Huber IRLS did not converge in {} iterations", max_iter)))
}

/// Exchangeable correlation block `(1 - rho) I + rho J` of size `m`
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Exchangeable {
    pub rho: f64,
    pub m: usize,
}

impl Exchangeable {
    pub fn new(rho: f64, m: usize) -> Exchangeable {
        Exchangeable { rho, m }
    }

    /// Open interval of `rho` keeping the block positive definite
    pub fn bounds(m: usize) -> (f64, f64) {
        let lower = if m > 1 { -1.0 / (m as f64 - 1.0) } else { -1.0 };
        (lower, 1.0)
    }

    pub fn log_det(&self) -> f64 {
        let m = self.m as f64;
        (m - 1.0) * (1.0 - self.rho).ln() + (1.0 + (m - 1.0) * self.rho).ln()
    }

    /// R^{-1/2} v, using R = (1-rho)(I - P) + (1+(m-1)rho) P with P the averaging projector
    pub fn inv_sqrt_apply(&self, v: ArrayView1<f64>) -> Array1<f64> {
        let m = self.m as f64;
        let mean = v.sum() / m;
        let a = 1.0 / (1.0 - self.rho).sqrt();
        let b = 1.0 / (1.0 + (m - 1.0) * self.rho).sqrt();
        v.mapv(|x| a * (x - mean) + b * mean)
    }
}

/// Whitens grouped data block by block: each group of `m` consecutive rows is multiplied by R^{-1/2}
pub fn whiten(x: &Array2<f64>, y: &Array1<f64>, block: Exchangeable) -> (Array2<f64>, Array1<f64>) {
    let mut xw = x.clone();
    let mut yw = y.clone();
    let m = block.m;

    for g in 0..(x.nrows() / m) {
        let rows = g * m..(g + 1) * m;
        let y_block = block.inv_sqrt_apply(y.slice(ndarray::s![rows.clone()]));
        yw.slice_mut(ndarray::s![rows.clone()]).assign(&y_block);
        for j in 0..x.ncols() {
            let col = block.inv_sqrt_apply(x.slice(ndarray::s![rows.clone(), j]));
            xw.slice_mut(ndarray::s![rows.clone(), j]).assign(&col);
        }
    }
    (xw, yw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn assert_close(a: f64, b: f64, tol: f64, msg: &str) {
        assert!((a - b).abs() < tol, "{}: {} vs {}", msg, a, b);
    }

    #[test]
    fn test_invert_spd() {
        let a = array![[4.0, 2.0], [2.0, 3.0]];
        let inv = invert_spd(&a).unwrap();
        let id = a.dot(&inv);
        assert_close(id[[0, 0]], 1.0, 1e-12, "identity diagonal");
        assert_close(id[[0, 1]], 0.0, 1e-12, "identity off-diagonal");
        assert_close(id[[1, 1]], 1.0, 1e-12, "identity diagonal");

        let singular = array![[1.0, 2.0], [2.0, 4.0]];
        assert!(matches!(invert_spd(&singular), Err(DmrError::ModelFit(_))), "a singular matrix cannot be inverted");
    }

    #[test]
    fn test_ols_simple_line() {
        let x = array![[1.0, 0.0], [1.0, 1.0], [1.0, 2.0], [1.0, 3.0]];
        let y = array![1.0, 3.1, 4.9, 7.0];
        let fit = ols(&x, &y).unwrap();
        assert_close(fit.coefficients[0], 1.03, 1e-10, "intercept");
        assert_close(fit.coefficients[1], 1.98, 1e-10, "slope");
        assert_eq!(fit.df_residual, 2);

        let (t, p) = fit.t_test(1).unwrap();
        assert!(t > 10.0, "a near-perfect line has a large t statistic");
        assert!(p > 0.0 && p < 0.01);
    }

    #[test]
    fn test_ols_requires_more_rows_than_columns() {
        let x = array![[1.0, 0.0], [1.0, 1.0]];
        let y = array![1.0, 2.0];
        assert!(matches!(ols(&x, &y), Err(DmrError::ModelFit(_))));
    }

    #[test]
    fn test_wls_unit_weights_match_ols() {
        let x = array![[1.0, 0.0], [1.0, 1.0], [1.0, 2.0], [1.0, 4.0], [1.0, 5.0]];
        let y = array![0.5, 1.7, 2.2, 4.4, 5.1];
        let a = ols(&x, &y).unwrap();
        let b = wls(&x, &y, &Array1::ones(5)).unwrap();
        for j in 0..2 {
            assert_close(a.coefficients[j], b.coefficients[j], 1e-12, "coefficients");
            assert_close(a.covariance[[j, j]], b.covariance[[j, j]], 1e-12, "variances");
        }
    }

    #[test]
    fn test_huber_resists_outlier() {
        let x = Array2::from_shape_fn((8, 2), |(i, j)| if j == 0 { 1.0 } else { i as f64 });
        let mut y = Array1::from_shape_fn(8, |i| 2.0 + 0.5 * i as f64 + if i % 2 == 0 { 0.05 } else { -0.05 });
        y[7] = 40.0;

        let plain = ols(&x, &y).unwrap();
        let robust = huber(&x, &y, 100, 1e-8).unwrap();
        assert!((robust.coefficients[1] - 0.5).abs() < (plain.coefficients[1] - 0.5).abs(),
            "the robust slope must be closer to the truth than the OLS slope");
        let w = robust.weights.unwrap();
        assert!(w[7] < 0.5, "the outlier must be downweighted");
    }

    #[test]
    fn test_p_values() {
        assert_close(two_sided_normal_p_value(1.959963984540054), 0.05, 1e-9, "normal 97.5% quantile");
        assert_close(two_sided_normal_p_value(0.0), 1.0, 1e-12, "z=0");
        assert_close(two_sided_t_p_value(2.570581835636314, 5.0), 0.05, 1e-6, "t(5) 97.5% quantile");
    }

    #[test]
    fn test_exchangeable_whitening() {
        let block = Exchangeable::new(0.4, 3);
        // R^{-1/2} R R^{-1/2} must be the identity
        let r = Array2::from_shape_fn((3, 3), |(i, j)| if i == j { 1.0 } else { 0.4 });
        let mut half = Array2::<f64>::zeros((3, 3));
        for j in 0..3 {
            half.column_mut(j).assign(&block.inv_sqrt_apply(r.column(j)));
        }
        let mut full = Array2::<f64>::zeros((3, 3));
        for i in 0..3 {
            full.row_mut(i).assign(&block.inv_sqrt_apply(half.row(i)));
        }
        for i in 0..3 {
            for j in 0..3 {
                assert_close(full[[i, j]], if i == j { 1.0 } else { 0.0 }, 1e-12, "whitened block");
            }
        }

        let l = cholesky(&r).unwrap();
        assert_close(block.log_det(), log_det_cholesky(&l), 1e-12, "closed-form log-determinant");
    }

    #[test]
    fn test_whiten_zero_rho_is_identity() {
        let x = Array2::from_shape_fn((4, 2), |(i, j)| (i + j) as f64);
        let y = array![1.0, 2.0, 3.0, 4.0];
        let (xw, yw) = whiten(&x, &y, Exchangeable::new(0.0, 2));
        assert_eq!(xw, x);
        assert_eq!(yw, y);
    }
}
