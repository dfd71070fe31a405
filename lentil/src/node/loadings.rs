use crate::backend::ComputeBackend;
use crate::node::*;

use matrix_param::traits::kept_columns;
use rand_distr::{Bernoulli, Distribution, Normal};

fn sigmoid(x: f64) -> f64 {
    1. / (1. + (-x).exp())
}

fn xlogx(x: f64) -> f64 {
    if x > 0. {
        x * x.ln()
    } else {
        0.
    }
}

/// Spike-and-slab loadings of one view, D x K
///
/// `w = s * b` with `s ~ Bernoulli(θ_k)` and `b ~ N(0, 1/α_k)`
#[derive(Clone, Debug)]
struct SpikeSlabBlock {
    ///////////////////////////
    // natural parameters    //
    ///////////////////////////
    slab_precision: Array2<f64>,
    slab_eta: Array2<f64>,
    logit_inclusion: Array2<f64>,
    //////////////////////////
    // estimated parameters //
    //////////////////////////
    inclusion: Array2<f64>,
    slab_mean: Array2<f64>,
    slab_var: Array2<f64>,
    mean: Array2<f64>,
    sq_mean: Array2<f64>,
}

impl SpikeSlabBlock {
    fn new(slab_mean: &Array2<f64>, slab_var: f64, inclusion: f64) -> Self {
        let dims = slab_mean.dim();
        let slab_precision = Array2::from_elem(dims, 1. / slab_var);
        let slab_eta = slab_mean * &slab_precision;
        let p = inclusion.clamp(1e-8, 1. - 1e-8);
        let logit_inclusion = Array2::from_elem(dims, (p / (1. - p)).ln());
        let mut ret = Self {
            slab_precision,
            slab_eta,
            logit_inclusion,
            inclusion: Array2::zeros(dims),
            slab_mean: Array2::zeros(dims),
            slab_var: Array2::zeros(dims),
            mean: Array2::zeros(dims),
            sq_mean: Array2::zeros(dims),
        };
        ret.calibrate();
        ret
    }

    fn calibrate(&mut self) {
        assert!(
            self.slab_precision.iter().all(|&l| l > 0.),
            "slab precision must be positive"
        );
        self.slab_var = self.slab_precision.mapv(|l| 1. / l);
        self.slab_mean = &self.slab_eta * &self.slab_var;
        self.inclusion = self.logit_inclusion.mapv(sigmoid);
        self.mean = &self.inclusion * &self.slab_mean;
        self.sq_mean =
            &self.inclusion * &(&self.slab_mean * &self.slab_mean + &self.slab_var);
    }

    fn blend_col(&mut self, k: usize, precision: &Array1<f64>, eta: &Array1<f64>, logit: &Array1<f64>, rho: f64) {
        let mix = |x: &mut f64, &y: &f64| *x = (1. - rho) * *x + rho * y;
        self.slab_precision.column_mut(k).zip_mut_with(precision, mix);
        self.slab_eta.column_mut(k).zip_mut_with(eta, mix);
        self.logit_inclusion.column_mut(k).zip_mut_with(logit, mix);
        self.calibrate();
    }

    fn remove_columns(&mut self, drop: &[usize]) {
        let kept = kept_columns(self.slab_precision.ncols(), drop);
        self.slab_precision = self.slab_precision.select(Axis(1), &kept);
        self.slab_eta = self.slab_eta.select(Axis(1), &kept);
        self.logit_inclusion = self.logit_inclusion.select(Axis(1), &kept);
        self.calibrate();
    }
}

/// Loadings `W` of every view
pub struct LoadingNode {
    blocks: Vec<SpikeSlabBlock>,
    num_samples: usize,
    backend: ComputeBackend,
}

impl LoadingNode {
    /// # Arguments
    /// * `init_mean` - D x K initial slab means of each view
    /// * `init_var` - initial slab variance
    /// * `init_inclusion` - initial inclusion probability
    pub fn new(
        num_samples: usize,
        init_mean: &[Array2<f64>],
        init_var: f64,
        init_inclusion: f64,
        backend: ComputeBackend,
    ) -> Self {
        let blocks = init_mean
            .iter()
            .map(|mu| SpikeSlabBlock::new(mu, init_var, init_inclusion))
            .collect();
        Self {
            blocks,
            num_samples,
            backend,
        }
    }

    /// `E[s w]`, D x K
    pub fn e(&self, m: usize) -> &Array2<f64> {
        &self.blocks[m].mean
    }

    /// `E[(s w)²] = S (μ² + σ²)`, D x K
    pub fn e2(&self, m: usize) -> &Array2<f64> {
        &self.blocks[m].sq_mean
    }

    /// posterior inclusion probability `S`, D x K
    pub fn inclusion(&self, m: usize) -> &Array2<f64> {
        &self.blocks[m].inclusion
    }

    /// `E[w²]` including the spike, `S (μ² + σ²) + (1 - S) / E[α]`
    pub fn sq_mean_with_spike(&self, m: usize, alpha_mean: &Array1<f64>) -> Array2<f64> {
        let block = &self.blocks[m];
        let spike = (1. - &block.inclusion) / &alpha_mean.view().insert_axis(Axis(0));
        &block.sq_mean + &spike
    }
}

impl VariationalNode for LoadingNode {
    fn kind(&self) -> NodeKind {
        NodeKind::W
    }

    /// Column-wise coordinate ascent over factors in each view
    ///
    /// With `foo = T' E[z²_k]` and `bar = (T ⊙ R_k)' E[z_k]`
    /// * σ² = 1 / (E[α_k] + foo)
    /// * μ = σ² bar
    /// * logit S = ½ ln E[α_k] - ½ ln(E[α_k] + foo)
    ///   + ½ bar² / (E[α_k] + foo) + E[ln θ_k] - E[ln(1 - θ_k)]
    ///
    /// On a mini-batch, foo and bar are scaled by N/|batch| and the
    /// natural parameters are blended with the step size.
    fn update(&mut self, nb: &Neighbours, step: &UpdateStep) -> anyhow::Result<()> {
        let y = nb.data();
        let z = nb.factors();
        let tau = nb.noise();
        let alpha = nb.ard();
        let theta = nb.sparsity();

        let scale = step.scale(self.num_samples);
        let z_mean = select_rows(z.mean(), step.batch);
        let z_sq_mean = select_rows(z.sq_mean(), step.batch);

        for m in 0..self.blocks.len() {
            let y_m = match step.batch {
                Some(_) => y.batch_view(m),
                None => y.view(m),
            };
            let tt = tau.masked_expanded_mean(m, y_m);
            let mut resid = &y_m.values - &self.backend.matmul_nt(&z_mean, self.e(m))?;

            let alpha_mean = alpha.mean(m);
            let theta_log_odds = theta.log_mean(m) - theta.log_one_minus_mean(m);

            for k in 0..z_mean.ncols() {
                let z_k = z_mean.column(k);
                let z2_k = z_sq_mean.column(k);

                let w_k_old = self.blocks[m].mean.column(k).to_owned();
                resid.zip_mut_with(
                    &(&z_k.insert_axis(Axis(1)) * &w_k_old.view().insert_axis(Axis(0))),
                    |r, &x| *r += x,
                );

                let foo = tt.t().dot(&z2_k) * scale;
                let bar = (&tt * &resid).t().dot(&z_k) * scale;

                let a_k = alpha_mean[k];
                let precision = foo.mapv(|f| a_k + f);
                let eta = bar.clone();
                let logit = ndarray::Zip::from(&foo).and(&bar).map_collect(|&f, &b| {
                    0.5 * a_k.ln() - 0.5 * (a_k + f).ln() + 0.5 * b * b / (a_k + f)
                        + theta_log_odds[k]
                });

                self.blocks[m].blend_col(k, &precision, &eta, &logit, step.rho);

                let w_k_new = self.blocks[m].mean.column(k);
                resid.zip_mut_with(
                    &(&z_k.insert_axis(Axis(1)) * &w_k_new.insert_axis(Axis(0))),
                    |r, &x| *r -= x,
                );
            }
        }
        Ok(())
    }

    fn calculate_elbo(&self, nb: &Neighbours) -> anyhow::Result<f64> {
        let alpha = nb.ard();
        let theta = nb.sparsity();

        let mut elbo = 0_f64;
        for (m, block) in self.blocks.iter().enumerate() {
            let (dd, kk) = block.mean.dim();
            let alpha_mean = alpha.mean(m);
            let alpha_log_mean = alpha.log_mean(m);
            let theta_log = theta.log_mean(m);
            let theta_log1m = theta.log_one_minus_mean(m);

            let w2 = self.sq_mean_with_spike(m, &alpha_mean);
            let alpha_w2: f64 = (&w2 * &alpha_mean.view().insert_axis(Axis(0))).sum();
            let lb_pw = 0.5 * (dd as f64 * alpha_log_mean.sum() - alpha_w2);

            let mut entropy = 0_f64;
            let mut lb_ps = 0_f64;
            let mut lb_qs = 0_f64;
            for ((d, k), &s) in block.inclusion.indexed_iter() {
                entropy += s * block.slab_var[(d, k)].ln() + (1. - s) * (1. / alpha_mean[k]).ln();
                lb_ps += s * theta_log[k] + (1. - s) * theta_log1m[k];
                lb_qs += xlogx(s) + xlogx(1. - s);
            }
            let lb_qw = -0.5 * (dd * kk) as f64 - 0.5 * entropy;

            elbo += lb_pw - lb_qw + lb_ps - lb_qs;
        }
        Ok(elbo)
    }

    fn expectations(&self, _expand: bool) -> Vec<Moments> {
        self.blocks
            .iter()
            .map(|block| {
                Moments::from([
                    ("E", block.mean.clone()),
                    ("E2", block.sq_mean.clone()),
                    ("ES", block.inclusion.clone()),
                    ("EW", block.slab_mean.clone()),
                    ("EW2", &block.slab_mean * &block.slab_mean + &block.slab_var),
                ])
            })
            .collect()
    }

    fn parameters(&self) -> Vec<Moments> {
        self.blocks
            .iter()
            .map(|block| {
                Moments::from([
                    ("mean", block.slab_mean.clone()),
                    ("var", block.slab_var.clone()),
                    ("theta", block.inclusion.clone()),
                ])
            })
            .collect()
    }

    fn remove_factors(&mut self, drop: &[usize]) {
        for block in self.blocks.iter_mut() {
            block.remove_columns(drop);
        }
    }

    fn num_factors(&self) -> Option<usize> {
        self.blocks.first().map(|b| b.mean.ncols())
    }

    fn sample(
        &self,
        nb: &Neighbours,
        which: Which,
        rng: &mut dyn RngCore,
    ) -> anyhow::Result<Vec<Array2<f64>>> {
        let alpha = nb.ard();
        let theta = nb.sparsity();

        let mut ret = Vec::with_capacity(self.blocks.len());
        for (m, block) in self.blocks.iter().enumerate() {
            let alpha_mean = alpha.mean(m);
            let theta_mean = theta.mean(m);
            let mut w = Array2::zeros(block.mean.dim());
            for ((d, k), w_dk) in w.indexed_iter_mut() {
                let (p, mu, sd) = match which {
                    Which::Prior => (theta_mean[k], 0., (1. / alpha_mean[k]).sqrt()),
                    Which::Posterior => (
                        block.inclusion[(d, k)],
                        block.slab_mean[(d, k)],
                        block.slab_var[(d, k)].sqrt(),
                    ),
                };
                let s = Bernoulli::new(p)
                    .map_err(|e| anyhow::anyhow!("bernoulli({}): {}", p, e))?
                    .sample(rng);
                if s {
                    *w_dk = Normal::new(mu, sd)
                        .map_err(|e| anyhow::anyhow!("normal({}, {}): {}", mu, sd, e))?
                        .sample(rng);
                }
            }
            ret.push(w);
        }
        Ok(ret)
    }
}
