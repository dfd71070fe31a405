use crate::backend::ComputeBackend;
use crate::node::tau::expected_residual_ss;
use crate::node::*;

use rand_distr::{Distribution, Normal};
use std::f64::consts::PI;

/// Values of one view with missing entries stored as zero
#[derive(Clone, Debug)]
pub struct ObservedView {
    /// N x D, missing entries are 0
    pub values: Array2<f64>,
    /// N x D, 1 if observed, 0 if missing
    pub observed: Array2<f64>,
}

impl ObservedView {
    /// `NaN` entries are treated as missing
    pub fn from_raw(raw: &Array2<f64>) -> Self {
        let observed = raw.mapv(|x| if x.is_finite() { 1. } else { 0. });
        let values = raw.mapv(|x| if x.is_finite() { x } else { 0. });
        Self { values, observed }
    }

    pub fn select_rows(&self, ix: &[usize]) -> Self {
        Self {
            values: self.values.select(Axis(0), ix),
            observed: self.observed.select(Axis(0), ix),
        }
    }

    /// number of observed samples per feature
    pub fn nobs_per_feature(&self) -> Array1<f64> {
        self.observed.sum_axis(Axis(0))
    }

    /// values with `NaN` in missing entries
    pub fn raw(&self) -> Array2<f64> {
        ndarray::Zip::from(&self.values)
            .and(&self.observed)
            .map_collect(|&y, &o| if o > 0. { y } else { f64::NAN })
    }

    pub fn nrows(&self) -> usize {
        self.values.nrows()
    }

    pub fn ncols(&self) -> usize {
        self.values.ncols()
    }
}

/// Observed data node `Y`, one block per view
///
/// Nothing is inferred here; the node carries the Gaussian
/// log-likelihood term of the ELBO.
pub struct DataNode {
    views: Vec<ObservedView>,
    batch: Option<Vec<ObservedView>>,
    tau_trick: bool,
    likconst: f64,
    backend: ComputeBackend,
}

impl DataNode {
    pub fn new(raw: &[Array2<f64>], backend: ComputeBackend) -> anyhow::Result<Self> {
        if raw.is_empty() {
            anyhow::bail!("no data views");
        }
        let nn = raw[0].nrows();
        if raw.iter().any(|y| y.nrows() != nn) {
            anyhow::bail!("every view needs the same number of samples");
        }
        let views: Vec<_> = raw.iter().map(ObservedView::from_raw).collect();
        Ok(Self {
            likconst: Self::log_likelihood_constant(&views),
            views,
            batch: None,
            tau_trick: true,
            backend,
        })
    }

    /// `-0.5 * Σ n_obs * ln(2π)`
    fn log_likelihood_constant(views: &[ObservedView]) -> f64 {
        let nobs: f64 = views.iter().map(|v| v.observed.sum()).sum();
        -0.5 * nobs * (2. * PI).ln()
    }

    pub fn num_views(&self) -> usize {
        self.views.len()
    }

    pub fn num_samples(&self) -> usize {
        self.views[0].nrows()
    }

    pub fn view(&self, m: usize) -> &ObservedView {
        &self.views[m]
    }

    /// rows of the current mini-batch, or the full view
    pub fn batch_view(&self, m: usize) -> &ObservedView {
        match &self.batch {
            Some(batch) => &batch[m],
            None => &self.views[m],
        }
    }

    pub fn set_tau_trick(&mut self, tau_trick: bool) {
        self.tau_trick = tau_trick;
    }
}

impl VariationalNode for DataNode {
    fn kind(&self) -> NodeKind {
        NodeKind::Y
    }

    fn precompute(&mut self, _nb: &Neighbours, opts: &TrainOptions) -> anyhow::Result<()> {
        self.likconst = Self::log_likelihood_constant(&self.views);
        self.tau_trick = opts.y_elbo_tau_trick;
        Ok(())
    }

    fn update(&mut self, _nb: &Neighbours, _step: &UpdateStep) -> anyhow::Result<()> {
        Ok(())
    }

    fn calculate_elbo(&self, nb: &Neighbours) -> anyhow::Result<f64> {
        let tau = nb.noise();

        let mut lik = self.likconst;
        for (m, y) in self.views.iter().enumerate() {
            let nobs = y.nobs_per_feature();
            let tau_mean = tau.mean(m);
            let tau_log_mean = tau.log_mean(m);

            let half_rss = if self.tau_trick {
                tau.rate_minus_prior(m)
            } else {
                let z = nb.factors();
                let w = nb.loadings();
                let ss = expected_residual_ss(y, z.mean(), z.sq_mean(), w.e(m), w.e2(m), &self.backend)?;
                ss * 0.5
            };

            lik += 0.5 * (&nobs * &tau_log_mean).sum() - (&tau_mean * &half_rss).sum();
        }
        Ok(lik)
    }

    fn expectations(&self, _expand: bool) -> Vec<Moments> {
        self.views
            .iter()
            .map(|y| Moments::from([("E", y.raw()), ("obs", y.observed.clone())]))
            .collect()
    }

    fn parameters(&self) -> Vec<Moments> {
        self.views
            .iter()
            .map(|y| Moments::from([("obs", y.observed.clone())]))
            .collect()
    }

    /// Draw `y = E[Z] E[W]' + ε` with `ε ~ N(0, 1/E[τ])`
    ///
    /// The data node has no distribution of its own, so both prior and
    /// posterior draws use the neighbours' current expectations.
    fn sample(
        &self,
        nb: &Neighbours,
        _which: Which,
        rng: &mut dyn RngCore,
    ) -> anyhow::Result<Vec<Array2<f64>>> {
        let z = nb.factors();
        let w = nb.loadings();
        let tau = nb.noise();
        let mut ret = Vec::with_capacity(self.views.len());
        for m in 0..self.views.len() {
            let mut y = self.backend.matmul_nt(z.mean(), w.e(m))?;
            let tau_mean = tau.mean(m);
            for ((_, j), y_ij) in y.indexed_iter_mut() {
                let sd = 1. / tau_mean[j].sqrt();
                let pdf = Normal::new(0., sd).map_err(|e| anyhow::anyhow!("noise: {}", e))?;
                *y_ij += pdf.sample(rng);
            }
            ret.push(y);
        }
        Ok(ret)
    }

    fn define_mini_batch(&mut self, ix: Option<&[usize]>) {
        self.batch = ix.map(|ix| self.views.iter().map(|y| y.select_rows(ix)).collect());
    }
}
