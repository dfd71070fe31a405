use rand::Rng;

/// Which member of a (prior, posterior) pair to use
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Which {
    Prior,
    Posterior,
}

/// Posterior summaries of a variational parameter matrix
pub trait Inference {
    type Mat;
    type Scalar;

    fn posterior_mean(&self) -> &Self::Mat;
    fn posterior_sd(&self) -> &Self::Mat;

    /// `E_q[ln p(x)] - E_q[ln q(x)]` summed over all elements
    fn elbo(&self) -> Self::Scalar;

    /// Draw one matrix from the prior or from the posterior
    fn sample<R: Rng + ?Sized>(&self, which: Which, rng: &mut R) -> anyhow::Result<Self::Mat>;

    fn nrows(&self) -> usize;
    fn ncols(&self) -> usize;
}

/// A parameter matrix with two types of statistics
/// with hyper parameters a0 and b0
///
/// Every update is expressed as `prior + added statistic`:
/// * Gamma: `(a, b) = (a0 + add_a, b0 + add_b)`
/// * Beta: `(a, b) = (a0 + add_a, b0 + add_b)`
/// * Gaussian: `(η, λ) = (μ0/σ0² + add_a, 1/σ0² + add_b)`
///
/// `rho` blends the new statistic with the current one,
/// `stat = (1 - rho) * stat + rho * (prior + add)`, so that
/// `rho = 1` is the ordinary coordinate ascent step.
pub trait TwoStatParam {
    type Mat;
    type Scalar;

    fn new(dims: (usize, usize), a0: Self::Scalar, b0: Self::Scalar) -> Self;
    fn update_stat(&mut self, add_a: &Self::Mat, add_b: &Self::Mat, rho: Self::Scalar);
    fn update_stat_col(
        &mut self,
        add_a: &ndarray::Array1<Self::Scalar>,
        add_b: &ndarray::Array1<Self::Scalar>,
        k: usize,
        rho: Self::Scalar,
    );
    fn reset_stat(&mut self);

    /// Drop columns (factors) from every array
    fn remove_columns(&mut self, drop: &[usize]);

    fn calibrate(&mut self);
}

/// Indices of `0..ncol` that are not in `drop`
pub fn kept_columns(ncol: usize, drop: &[usize]) -> Vec<usize> {
    (0..ncol).filter(|k| !drop.contains(k)).collect()
}
