use crate::backend::ComputeBackend;
use crate::node::data::ObservedView;
use crate::node::*;

use matrix_param::ndarray_gamma::GammaMatrix;
use matrix_param::traits::*;

/// Expected residual sum of squares of each feature over observed entries
///
/// `Σ_n E[(y - z w')²]` expands to
/// `term1 + term2 + term3 - term4` with
/// * term1 = Σ y²
/// * term2 = Σ E[z²] E[w²]'
/// * term3 = Σ (E[z] E[w]')² - Σ E[z]² (E[w]²)'
/// * term4 = 2 Σ (E[z] E[w]') y
///
pub fn expected_residual_ss(
    y: &ObservedView,
    z_mean: &Array2<f64>,
    z_sq_mean: &Array2<f64>,
    w_mean: &Array2<f64>,
    w_sq_mean: &Array2<f64>,
    backend: &ComputeBackend,
) -> anyhow::Result<Array1<f64>> {
    let obs = &y.observed;

    let term1 = masked_col_sum(&y.values.mapv(|x| x * x), obs);

    let term2 = masked_col_sum(&backend.matmul_nt(z_sq_mean, w_sq_mean)?, obs);

    let zw = backend.matmul_nt(z_mean, w_mean)?;
    let zz_ww = backend.matmul_nt(&z_mean.mapv(|x| x * x), &w_mean.mapv(|x| x * x))?;
    let term3 = masked_col_sum(&zw.mapv(|x| x * x), obs) - masked_col_sum(&zz_ww, obs);

    let term4 = masked_col_sum(&(&zw * &y.values), obs) * 2.;

    Ok(term1 + term2 + term3 - term4)
}

/// Noise precision `τ_d ~ Gamma(a, b)` of every feature, one block per view
pub struct NoisePrecisionNode {
    num_samples: usize,
    params: Vec<GammaMatrix>,
    ////////////////////////////////
    // cached in `precompute`     //
    ////////////////////////////////
    lbconst: Vec<f64>,
    a_pre: Vec<Array1<f64>>,
    batch: Option<Vec<usize>>,
    backend: ComputeBackend,
}

impl NoisePrecisionNode {
    /// # Arguments
    /// * `num_samples` - N
    /// * `num_features` - D of each view
    /// * `(a0, b0)` - prior shape and rate
    /// * `init` - initial posterior (shape, rate)
    pub fn new(
        num_samples: usize,
        num_features: &[usize],
        (a0, b0): (f64, f64),
        init: (f64, f64),
        backend: ComputeBackend,
    ) -> Self {
        let params = num_features
            .iter()
            .map(|&dd| {
                let mut param = GammaMatrix::new((1, dd), a0, b0);
                param.set_stat(init.0, init.1);
                param
            })
            .collect::<Vec<_>>();
        let lbconst = params.iter().map(|p| p.prior_log_normalizer()).collect();
        let a_pre = num_features.iter().map(|&dd| Array1::from_elem(dd, a0)).collect();
        Self {
            num_samples,
            params,
            lbconst,
            a_pre,
            batch: None,
            backend,
        }
    }

    pub fn param(&self, m: usize) -> &GammaMatrix {
        &self.params[m]
    }

    /// `E[τ]` of each feature
    pub fn mean(&self, m: usize) -> Array1<f64> {
        self.params[m].posterior_mean().row(0).to_owned()
    }

    /// `E[ln τ]` of each feature
    pub fn log_mean(&self, m: usize) -> Array1<f64> {
        self.params[m].posterior_log_mean().row(0).to_owned()
    }

    /// `b_Q - b_P`, half the expected residual sum of squares at the
    /// last update
    pub fn rate_minus_prior(&self, m: usize) -> Array1<f64> {
        let b0 = self.params[m].prior_rate();
        self.params[m].rate().row(0).mapv(|b| b - b0)
    }

    /// `E[τ]` broadcast to `rows x D`, zero at missing entries
    pub fn masked_expanded_mean(&self, m: usize, y: &ObservedView) -> Array2<f64> {
        &y.observed * &self.params[m].posterior_mean().row(0)
    }
}

impl VariationalNode for NoisePrecisionNode {
    fn kind(&self) -> NodeKind {
        NodeKind::Tau
    }

    fn precompute(&mut self, nb: &Neighbours, _opts: &TrainOptions) -> anyhow::Result<()> {
        let y = nb.data();
        for (m, param) in self.params.iter().enumerate() {
            self.lbconst[m] = param.prior_log_normalizer();
            let a0 = param.prior_shape();
            self.a_pre[m] = y.view(m).nobs_per_feature().mapv(|n| a0 + n / 2.);
        }
        Ok(())
    }

    fn update(&mut self, nb: &Neighbours, step: &UpdateStep) -> anyhow::Result<()> {
        let y = nb.data();
        let z = nb.factors();
        let w = nb.loadings();

        let batch = self.batch.as_deref().or(step.batch);
        let scale = UpdateStep { batch, ..*step }.scale(self.num_samples);

        let z_mean = select_rows(z.mean(), batch);
        let z_sq_mean = select_rows(z.sq_mean(), batch);

        for m in 0..self.params.len() {
            let y_m = match batch {
                Some(_) => y.batch_view(m),
                None => y.view(m),
            };
            let ss = expected_residual_ss(y_m, &z_mean, &z_sq_mean, w.e(m), w.e2(m), &self.backend)?;

            let add_a = match batch {
                Some(_) => y_m.nobs_per_feature() * (0.5 * scale),
                None => &self.a_pre[m] - self.params[m].prior_shape(),
            };
            let add_b = ss * (0.5 * scale);

            let dd = add_a.len();
            let add_a = add_a.into_shape_with_order((1, dd))?;
            let add_b = add_b.into_shape_with_order((1, dd))?;
            self.params[m].update_stat(&add_a, &add_b, step.rho);
        }
        Ok(())
    }

    fn calculate_elbo(&self, _nb: &Neighbours) -> anyhow::Result<f64> {
        Ok(self
            .params
            .iter()
            .zip(self.lbconst.iter())
            .map(|(param, &lbconst)| param.elbo_given_normalizer(lbconst))
            .sum())
    }

    fn expectations(&self, expand: bool) -> Vec<Moments> {
        let nn = self.num_samples;
        self.params
            .iter()
            .map(|param| {
                let (e, lne) = (param.posterior_mean(), param.posterior_log_mean());
                if expand {
                    let dims = (nn, param.ncols());
                    Moments::from([
                        ("E", e.broadcast(dims).map(|x| x.to_owned()).unwrap_or_default()),
                        ("lnE", lne.broadcast(dims).map(|x| x.to_owned()).unwrap_or_default()),
                    ])
                } else {
                    Moments::from([("E", e.clone()), ("lnE", lne.clone())])
                }
            })
            .collect()
    }

    fn parameters(&self) -> Vec<Moments> {
        self.params
            .iter()
            .map(|param| {
                Moments::from([
                    ("a", param.shape().clone()),
                    ("b", param.rate().clone()),
                    ("prior_a", Array2::from_elem((1, 1), param.prior_shape())),
                    ("prior_b", Array2::from_elem((1, 1), param.prior_rate())),
                ])
            })
            .collect()
    }

    fn sample(
        &self,
        _nb: &Neighbours,
        which: Which,
        rng: &mut dyn RngCore,
    ) -> anyhow::Result<Vec<Array2<f64>>> {
        self.params.iter().map(|param| param.sample(which, rng)).collect()
    }

    fn define_mini_batch(&mut self, ix: Option<&[usize]>) {
        self.batch = ix.map(|ix| ix.to_vec());
    }
}
