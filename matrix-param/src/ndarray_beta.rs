use crate::traits::*;
use ndarray::prelude::*;
use rand::Rng;
use rand_distr::{Beta, Distribution};
use special::Gamma as SpecialGamma;

fn ln_beta(a: f64, b: f64) -> f64 {
    SpecialGamma::ln_gamma(a).0 + SpecialGamma::ln_gamma(b).0 - SpecialGamma::ln_gamma(a + b).0
}

/// Beta(a, b) parameter matrix
#[derive(Clone, Debug)]
pub struct BetaMatrix {
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
    estimated_log_one_minus_mean: Array2<f64>,
}

impl BetaMatrix {
    /// `E[ln x] = ψ(a) - ψ(a + b)`
    pub fn posterior_log_mean(&self) -> &Array2<f64> {
        &self.estimated_log_mean
    }

    /// `E[ln(1 - x)] = ψ(b) - ψ(a + b)`
    pub fn posterior_log_one_minus_mean(&self) -> &Array2<f64> {
        &self.estimated_log_one_minus_mean
    }

    pub fn a(&self) -> &Array2<f64> {
        &self.a_stat
    }

    pub fn b(&self) -> &Array2<f64> {
        &self.b_stat
    }

    pub fn prior_a(&self) -> f64 {
        self.a0
    }

    pub fn prior_b(&self) -> f64 {
        self.b0
    }

    pub fn set_stat(&mut self, a: f64, b: f64) {
        self.a_stat.fill(a);
        self.b_stat.fill(b);
        self.calibrate();
    }
}

impl TwoStatParam for BetaMatrix {
    type Mat = Array2<f64>;
    type Scalar = f64;

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
            estimated_log_one_minus_mean: Self::Mat::zeros(dims),
        };
        ret.reset_stat();
        ret
    }

    fn update_stat(&mut self, add_a: &Self::Mat, add_b: &Self::Mat, rho: Self::Scalar) {
        let (a0, b0) = (self.a0, self.b0);
        self.a_stat
            .zip_mut_with(add_a, |x, &a| *x = (1. - rho) * *x + rho * (a0 + a));
        self.b_stat
            .zip_mut_with(add_b, |x, &b| *x = (1. - rho) * *x + rho * (b0 + b));
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
            "beta parameters must be positive"
        );
        let ab = &self.a_stat + &self.b_stat;
        self.estimated_mean = &self.a_stat / &ab;
        self.estimated_sd = ndarray::Zip::from(&self.a_stat)
            .and(&self.b_stat)
            .map_collect(|&a, &b| (a * b / ((a + b).powi(2) * (a + b + 1.))).sqrt());
        let psi_ab = ab.mapv(|x| x.digamma());
        self.estimated_log_mean = &self.a_stat.mapv(|a| a.digamma()) - &psi_ab;
        self.estimated_log_one_minus_mean = &self.b_stat.mapv(|b| b.digamma()) - &psi_ab;
    }
}

impl Inference for BetaMatrix {
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
        let (a0, b0) = (self.a0, self.b0);
        let lnb0 = ln_beta(a0, b0);
        let mut ret = 0_f64;
        for (((&a, &b), &lnx), &ln1mx) in self
            .a_stat
            .iter()
            .zip(self.b_stat.iter())
            .zip(self.estimated_log_mean.iter())
            .zip(self.estimated_log_one_minus_mean.iter())
        {
            let lb_p = (a0 - 1.) * lnx + (b0 - 1.) * ln1mx - lnb0;
            let lb_q = (a - 1.) * lnx + (b - 1.) * ln1mx - ln_beta(a, b);
            ret += lb_p - lb_q;
        }
        ret
    }

    fn sample<R: Rng + ?Sized>(&self, which: Which, rng: &mut R) -> anyhow::Result<Self::Mat> {
        let mut ret = Array2::zeros((self.num_rows, self.num_columns));
        for ((i, j), x) in ret.indexed_iter_mut() {
            let (a, b) = match which {
                Which::Prior => (self.a0, self.b0),
                Which::Posterior => (self.a_stat[(i, j)], self.b_stat[(i, j)]),
            };
            let pdf =
                Beta::new(a, b).map_err(|e| anyhow::anyhow!("beta({}, {}): {}", a, b, e))?;
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
    fn beta_moments() {
        let mut param = BetaMatrix::new((1, 2), 1.0, 1.0);
        approx::assert_abs_diff_eq!(param.elbo(), 0.0, epsilon = 1e-12);

        param.update_stat(&array![[3.0, 0.0]], &array![[1.0, 8.0]], 1.0);
        approx::assert_abs_diff_eq!(param.posterior_mean()[(0, 0)], 4.0 / 6.0);
        approx::assert_abs_diff_eq!(param.posterior_mean()[(0, 1)], 1.0 / 10.0);
        approx::assert_abs_diff_eq!(
            param.posterior_log_one_minus_mean()[(0, 1)],
            9_f64.digamma() - 10_f64.digamma(),
            epsilon = 1e-12
        );
        assert!(param.elbo() < 0.0);
    }

    #[test]
    fn beta_elbo_is_negative_kl() {
        // KL(Beta(2,1) || Beta(1,1)) = ln 2 + ψ(2) - ψ(3) = ln 2 - 1/2
        let mut param = BetaMatrix::new((1, 1), 1.0, 1.0);
        param.update_stat(&array![[1.0]], &array![[0.0]], 1.0);
        approx::assert_abs_diff_eq!(param.elbo(), 0.5 - 2_f64.ln(), epsilon = 1e-10);
        approx::assert_abs_diff_eq!(ln_beta(2.0, 1.0), -(2_f64.ln()), epsilon = 1e-12);
    }
}
