use crate::traits::*;
use ndarray::prelude::*;
use rand::Rng;
use rand_distr::{Distribution, Normal};

/// Gaussian parameter matrix kept in natural parameters
///
/// x[i,j] ~ N(m0, v0) a priori and the posterior is tracked by
/// the precision `λ` and the precision-weighted mean `η`.
#[derive(Clone, Debug)]
pub struct GaussianMatrix {
    num_rows: usize,
    num_columns: usize,
    //////////////////////
    // hyper parameters //
    //////////////////////
    mean0: f64,
    var0: f64,
    ///////////////////////////
    // sufficient statistics //
    ///////////////////////////
    eta_stat: Array2<f64>,
    lambda_stat: Array2<f64>,
    //////////////////////////
    // estimated parameters //
    //////////////////////////
    estimated_mean: Array2<f64>,
    estimated_var: Array2<f64>,
    estimated_sd: Array2<f64>,
    estimated_sq_mean: Array2<f64>,
}

impl GaussianMatrix {
    pub fn posterior_var(&self) -> &Array2<f64> {
        &self.estimated_var
    }

    /// `E[x^2] = mean^2 + var`
    pub fn posterior_sq_mean(&self) -> &Array2<f64> {
        &self.estimated_sq_mean
    }

    pub fn prior_mean(&self) -> f64 {
        self.mean0
    }

    pub fn prior_var(&self) -> f64 {
        self.var0
    }

    /// Set posterior mean and variance directly
    pub fn set_mean_var(&mut self, mean: &Array2<f64>, var: &Array2<f64>) {
        self.lambda_stat = var.mapv(|v| 1. / v);
        self.eta_stat = mean * &self.lambda_stat;
        self.calibrate();
    }

    /// Column `k` update restricted to `rows`
    ///
    /// Each selected entry is replaced by the full-conditional update;
    /// the other rows keep their current statistics.
    pub fn update_stat_col_rows(
        &mut self,
        add_eta: &Array1<f64>,
        add_lambda: &Array1<f64>,
        k: usize,
        rows: &[usize],
    ) {
        debug_assert_eq!(add_eta.len(), rows.len());
        let eta0 = self.mean0 / self.var0;
        let lambda0 = 1. / self.var0;
        for (r, &i) in rows.iter().enumerate() {
            self.eta_stat[(i, k)] = eta0 + add_eta[r];
            self.lambda_stat[(i, k)] = lambda0 + add_lambda[r];
        }
        self.calibrate();
    }
}

impl TwoStatParam for GaussianMatrix {
    type Mat = Array2<f64>;
    type Scalar = f64;

    /// New Gaussian parameter matrix
    ///
    /// #Arguments
    /// * `dims` - dimensions of the matrix (num of rows, num of columns)
    /// * `mean0` - prior mean
    /// * `var0` - prior variance
    ///
    fn new(dims: (usize, usize), mean0: Self::Scalar, var0: Self::Scalar) -> Self {
        let mut ret = Self {
            num_rows: dims.0,
            num_columns: dims.1,
            mean0,
            var0,
            eta_stat: Self::Mat::zeros(dims),
            lambda_stat: Self::Mat::zeros(dims),
            estimated_mean: Self::Mat::zeros(dims),
            estimated_var: Self::Mat::zeros(dims),
            estimated_sd: Self::Mat::zeros(dims),
            estimated_sq_mean: Self::Mat::zeros(dims),
        };
        ret.reset_stat();
        ret
    }

    fn update_stat(&mut self, add_eta: &Self::Mat, add_lambda: &Self::Mat, rho: Self::Scalar) {
        let eta0 = self.mean0 / self.var0;
        let lambda0 = 1. / self.var0;
        self.eta_stat
            .zip_mut_with(add_eta, |x, &a| *x = (1. - rho) * *x + rho * (eta0 + a));
        self.lambda_stat
            .zip_mut_with(add_lambda, |x, &a| *x = (1. - rho) * *x + rho * (lambda0 + a));
        self.calibrate();
    }

    fn update_stat_col(
        &mut self,
        add_eta: &Array1<Self::Scalar>,
        add_lambda: &Array1<Self::Scalar>,
        k: usize,
        rho: Self::Scalar,
    ) {
        let eta0 = self.mean0 / self.var0;
        let lambda0 = 1. / self.var0;
        self.eta_stat
            .column_mut(k)
            .zip_mut_with(add_eta, |x, &a| *x = (1. - rho) * *x + rho * (eta0 + a));
        self.lambda_stat
            .column_mut(k)
            .zip_mut_with(add_lambda, |x, &a| *x = (1. - rho) * *x + rho * (lambda0 + a));
        self.calibrate();
    }

    fn reset_stat(&mut self) {
        self.eta_stat.fill(self.mean0 / self.var0);
        self.lambda_stat.fill(1. / self.var0);
        self.calibrate();
    }

    fn remove_columns(&mut self, drop: &[usize]) {
        let kept = kept_columns(self.num_columns, drop);
        self.eta_stat = self.eta_stat.select(Axis(1), &kept);
        self.lambda_stat = self.lambda_stat.select(Axis(1), &kept);
        self.num_columns = kept.len();
        self.calibrate();
    }

    fn calibrate(&mut self) {
        assert!(
            self.lambda_stat.iter().all(|&l| l > 0.),
            "gaussian precision must be positive"
        );
        self.estimated_var = self.lambda_stat.mapv(|l| 1. / l);
        self.estimated_sd = self.estimated_var.mapv(f64::sqrt);
        self.estimated_mean = &self.eta_stat * &self.estimated_var;
        self.estimated_sq_mean = &self.estimated_mean * &self.estimated_mean + &self.estimated_var;
    }
}

impl Inference for GaussianMatrix {
    type Mat = Array2<f64>;
    type Scalar = f64;

    fn posterior_mean(&self) -> &Self::Mat {
        &self.estimated_mean
    }

    fn posterior_sd(&self) -> &Self::Mat {
        &self.estimated_sd
    }

    /// `-KL(q || p)`
    fn elbo(&self) -> Self::Scalar {
        let (m0, v0) = (self.mean0, self.var0);
        self.estimated_mean
            .iter()
            .zip(self.estimated_var.iter())
            .map(|(&m, &v)| 0.5 * ((v / v0).ln() + 1. - (v + (m - m0).powi(2)) / v0))
            .sum()
    }

    fn sample<R: Rng + ?Sized>(&self, which: Which, rng: &mut R) -> anyhow::Result<Self::Mat> {
        let mut ret = Array2::zeros((self.num_rows, self.num_columns));
        for ((i, j), x) in ret.indexed_iter_mut() {
            let (m, s) = match which {
                Which::Prior => (self.mean0, self.var0.sqrt()),
                Which::Posterior => (self.estimated_mean[(i, j)], self.estimated_sd[(i, j)]),
            };
            let pdf = Normal::new(m, s).map_err(|e| anyhow::anyhow!("normal({}, {}): {}", m, s, e))?;
            *x = pdf.sample(rng);
        }
        Ok(ret)
    }

    fn nrows(&self) -> usize {
        self.num_rows
    }

    fn ncols(&self) -> usize {
        self.num_columns
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn natural_parameter_update() {
        let mut param = GaussianMatrix::new((2, 2), 0.0, 1.0);
        approx::assert_abs_diff_eq!(param.elbo(), 0.0, epsilon = 1e-12);

        // precision 1 + 3, precision-weighted mean 0 + 2
        param.update_stat_col(&array![2.0, 2.0], &array![3.0, 3.0], 1, 1.0);
        approx::assert_abs_diff_eq!(param.posterior_mean()[(0, 1)], 0.5);
        approx::assert_abs_diff_eq!(param.posterior_var()[(1, 1)], 0.25);
        approx::assert_abs_diff_eq!(param.posterior_sq_mean()[(0, 1)], 0.5);
        approx::assert_abs_diff_eq!(param.posterior_mean()[(0, 0)], 0.0);

        param.update_stat_col_rows(&array![4.0], &array![1.0], 0, &[1]);
        approx::assert_abs_diff_eq!(param.posterior_mean()[(1, 0)], 2.0);
        approx::assert_abs_diff_eq!(param.posterior_mean()[(0, 0)], 0.0);

        param.remove_columns(&[0]);
        assert_eq!(param.ncols(), 1);
        approx::assert_abs_diff_eq!(param.posterior_mean()[(1, 0)], 0.5);
    }
}
