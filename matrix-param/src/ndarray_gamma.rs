extern crate special;

use crate::traits::*;
use ndarray::prelude::*;
use rand::Rng;
use rand_distr::{Distribution, Gamma};
use special::Gamma as SpecialGamma;

/// Gamma(a, b) parameter matrix with shape `a` and rate `b`
#[derive(Clone, Debug)]
pub struct GammaMatrix {
    num_rows: usize,
    num_columns: usize,
    //////////////////////
    // hyper parameters //
    //////////////////////
    a0: f64,
    b0: f64,
    ///////////////////////////
    // sufficient statistics //
    ///////////////////////////
    a_stat: Array2<f64>,
    b_stat: Array2<f64>,
    //////////////////////////
    // estimated parameters //
    //////////////////////////
    estimated_mean: Array2<f64>,
    estimated_sd: Array2<f64>,
    estimated_log_mean: Array2<f64>,
}

impl GammaMatrix {
    /// `E[ln x] = ψ(a) - ln(b)`
    pub fn posterior_log_mean(&self) -> &Array2<f64> {
        &self.estimated_log_mean
    }

    pub fn shape(&self) -> &Array2<f64> {
        &self.a_stat
    }

    pub fn rate(&self) -> &Array2<f64> {
        &self.b_stat
    }

    pub fn prior_shape(&self) -> f64 {
        self.a0
    }

    pub fn prior_rate(&self) -> f64 {
        self.b0
    }

    /// Overwrite the posterior statistics, e.g., for initialization
    pub fn set_stat(&mut self, a: f64, b: f64) {
        self.a_stat.fill(a);
        self.b_stat.fill(b);
        self.calibrate();
    }

    /// `Σ a0 * ln(b0) - lnΓ(a0)` over all elements
    pub fn prior_log_normalizer(&self) -> f64 {
        let nelem = (self.num_rows * self.num_columns) as f64;
        nelem * (self.a0 * self.b0.ln() - SpecialGamma::ln_gamma(self.a0).0)
    }

    /// ELBO contribution with a cached prior normalizer
    ///
    /// lb_p = lbconst + Σ (a0 - 1) E[ln x] - Σ b0 E[x]
    /// lb_q = Σ a ln(b) + Σ (a - 1) E[ln x] - Σ b E[x] - Σ lnΓ(a)
    ///
    pub fn elbo_given_normalizer(&self, lbconst: f64) -> f64 {
        let (a0, b0) = (self.a0, self.b0);

        let lb_p = lbconst + (a0 - 1.) * self.estimated_log_mean.sum()
            - b0 * self.estimated_mean.sum();

        let mut lb_q = 0_f64;
        for (((&a, &b), &lnx), &x) in self
            .a_stat
            .iter()
            .zip(self.b_stat.iter())
            .zip(self.estimated_log_mean.iter())
            .zip(self.estimated_mean.iter())
        {
            lb_q += a * b.ln() + (a - 1.) * lnx - b * x - SpecialGamma::ln_gamma(a).0;
        }

        lb_p - lb_q
    }

    fn blend(stat: &mut Array2<f64>, prior: f64, add: &Array2<f64>, rho: f64) {
        if rho >= 1. {
            stat.zip_mut_with(add, |x, &a| *x = prior + a);
        } else {
            stat.zip_mut_with(add, |x, &a| *x = (1. - rho) * *x + rho * (prior + a));
        }
    }
}

impl TwoStatParam for GammaMatrix {
    type Mat = Array2<f64>;
    type Scalar = f64;

    /// New Gamma parameter matrix
    ///
    /// x[i,j] ~ Gamma(a0, b0)
    ///
    /// #Arguments
    /// * `dims` - dimensions of the matrix (num of rows, num of columns)
    /// * `a` - hyper parameter a0 (shape)
    /// * `b` - hyper parameter b0 (rate)
    ///
    fn new(dims: (usize, usize), a: Self::Scalar, b: Self::Scalar) -> Self {
        let mut ret = Self {
            num_rows: dims.0,
            num_columns: dims.1,
            a0: a,
            b0: b,
            a_stat: Self::Mat::zeros(dims),
            b_stat: Self::Mat::zeros(dims),
            estimated_mean: Self::Mat::zeros(dims),
            estimated_sd: Self::Mat::zeros(dims),
            estimated_log_mean: Self::Mat::zeros(dims),
        };
        ret.reset_stat();
        ret
    }

    fn update_stat(&mut self, add_a: &Self::Mat, add_b: &Self::Mat, rho: Self::Scalar) {
        Self::blend(&mut self.a_stat, self.a0, add_a, rho);
        Self::blend(&mut self.b_stat, self.b0, add_b, rho);
        self.calibrate();
    }

    fn update_stat_col(
        &mut self,
        add_a: &Array1<Self::Scalar>,
        add_b: &Array1<Self::Scalar>,
        k: usize,
        rho: Self::Scalar,
    ) {
        let (a0, b0) = (self.a0, self.b0);
        self.a_stat
            .column_mut(k)
            .zip_mut_with(add_a, |x, &a| *x = (1. - rho) * *x + rho * (a0 + a));
        self.b_stat
            .column_mut(k)
            .zip_mut_with(add_b, |x, &b| *x = (1. - rho) * *x + rho * (b0 + b));
        self.calibrate();
    }

    fn reset_stat(&mut self) {
        self.a_stat.fill(self.a0);
        self.b_stat.fill(self.b0);
        self.calibrate();
    }

    fn remove_columns(&mut self, drop: &[usize]) {
        let kept = kept_columns(self.num_columns, drop);
        self.a_stat = self.a_stat.select(Axis(1), &kept);
        self.b_stat = self.b_stat.select(Axis(1), &kept);
        self.num_columns = kept.len();
        self.calibrate();
    }

    fn calibrate(&mut self) {
        assert!(
            self.a_stat.iter().all(|&a| a > 0.) && self.b_stat.iter().all(|&b| b > 0.),
            "gamma parameters must be positive"
        );
        self.estimated_mean = &self.a_stat / &self.b_stat;
        self.estimated_sd = &self.a_stat.mapv(f64::sqrt) / &self.b_stat;
        self.estimated_log_mean =
            &self.a_stat.mapv(|a| a.digamma()) - &self.b_stat.mapv(f64::ln);
    }
}

impl Inference for GammaMatrix {
    type Mat = Array2<f64>;
    type Scalar = f64;

    fn posterior_mean(&self) -> &Self::Mat {
        &self.estimated_mean
    }

    fn posterior_sd(&self) -> &Self::Mat {
        &self.estimated_sd
    }

    fn elbo(&self) -> Self::Scalar {
        self.elbo_given_normalizer(self.prior_log_normalizer())
    }

    fn sample<R: Rng + ?Sized>(&self, which: Which, rng: &mut R) -> anyhow::Result<Self::Mat> {
        let dims = (self.num_rows, self.num_columns);
        let mut ret = Array2::zeros(dims);
        for ((i, j), x) in ret.indexed_iter_mut() {
            let (a, b) = match which {
                Which::Prior => (self.a0, self.b0),
                Which::Posterior => (self.a_stat[(i, j)], self.b_stat[(i, j)]),
            };
            let pdf = Gamma::new(a, 1. / b)
                .map_err(|e| anyhow::anyhow!("gamma({}, {}): {}", a, b, e))?;
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
    use rand::SeedableRng;

    #[test]
    fn prior_equals_posterior_has_zero_elbo() {
        let param = GammaMatrix::new((1, 7), 1e-3, 2.5);
        approx::assert_abs_diff_eq!(param.elbo(), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn gamma_moments_and_removal() {
        let mut param = GammaMatrix::new((2, 3), 1.0, 1.0);
        let add_a = array![[1.0, 2.0, 3.0], [1.0, 2.0, 3.0]];
        let add_b = array![[1.0, 1.0, 1.0], [3.0, 3.0, 3.0]];
        param.update_stat(&add_a, &add_b, 1.0);

        approx::assert_abs_diff_eq!(param.posterior_mean()[(0, 2)], 4.0 / 2.0);
        approx::assert_abs_diff_eq!(param.posterior_mean()[(1, 0)], 2.0 / 4.0);
        approx::assert_abs_diff_eq!(
            param.posterior_log_mean()[(0, 0)],
            2_f64.digamma() - 2_f64.ln(),
            epsilon = 1e-12
        );
        assert!(param.elbo() < 0.0);

        param.remove_columns(&[1]);
        assert_eq!(param.ncols(), 2);
        approx::assert_abs_diff_eq!(param.shape()[(0, 1)], 4.0);
    }

    #[test]
    fn blended_update_moves_partially() {
        let mut param = GammaMatrix::new((1, 1), 1.0, 1.0);
        param.update_stat(&array![[4.0]], &array![[2.0]], 0.5);
        approx::assert_abs_diff_eq!(param.shape()[(0, 0)], 3.0);
        approx::assert_abs_diff_eq!(param.rate()[(0, 0)], 2.0);
    }

    #[test]
    fn gamma_sampling_positive() -> anyhow::Result<()> {
        let mut rng = rand::rngs::StdRng::seed_from_u64(1);
        let param = GammaMatrix::new((3, 4), 2.0, 1.0);
        let x = param.sample(Which::Posterior, &mut rng)?;
        assert_eq!(x.dim(), (3, 4));
        assert!(x.iter().all(|&v| v > 0.));
        Ok(())
    }
}
