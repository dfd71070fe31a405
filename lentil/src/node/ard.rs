use crate::node::*;

use matrix_param::ndarray_gamma::GammaMatrix;
use matrix_param::traits::*;

/// ARD precision `α_k ~ Gamma(a0, b0)` of each view and factor
pub struct ArdNode {
    params: Vec<GammaMatrix>,
    num_features: Vec<usize>,
}

impl ArdNode {
    pub fn new(num_features: &[usize], kk: usize, (a0, b0): (f64, f64), init: (f64, f64)) -> Self {
        let params = num_features
            .iter()
            .map(|_| {
                let mut param = GammaMatrix::new((1, kk), a0, b0);
                param.set_stat(init.0, init.1);
                param
            })
            .collect();
        Self {
            params,
            num_features: num_features.to_vec(),
        }
    }

    pub fn mean(&self, m: usize) -> Array1<f64> {
        self.params[m].posterior_mean().row(0).to_owned()
    }

    pub fn log_mean(&self, m: usize) -> Array1<f64> {
        self.params[m].posterior_log_mean().row(0).to_owned()
    }
}

impl VariationalNode for ArdNode {
    fn kind(&self) -> NodeKind {
        NodeKind::AlphaW
    }

    /// `a = a0 + D/2`, `b = b0 + Σ_d E[w²_dk] / 2`
    fn update(&mut self, nb: &Neighbours, step: &UpdateStep) -> anyhow::Result<()> {
        let w = nb.loadings();
        for (m, param) in self.params.iter_mut().enumerate() {
            let alpha_mean = param.posterior_mean().row(0).to_owned();
            let w2 = w.sq_mean_with_spike(m, &alpha_mean);
            let add_b = (w2.sum_axis(Axis(0)) * 0.5).insert_axis(Axis(0));
            let add_a = Array2::from_elem(add_b.dim(), self.num_features[m] as f64 / 2.);
            param.update_stat(&add_a, &add_b, step.rho);
        }
        Ok(())
    }

    fn calculate_elbo(&self, _nb: &Neighbours) -> anyhow::Result<f64> {
        Ok(self.params.iter().map(|p| p.elbo()).sum())
    }

    fn expectations(&self, expand: bool) -> Vec<Moments> {
        self.params
            .iter()
            .zip(self.num_features.iter())
            .map(|(param, &dd)| {
                let (e, lne) = (param.posterior_mean(), param.posterior_log_mean());
                if expand {
                    let dims = (dd, param.ncols());
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

    fn remove_factors(&mut self, drop: &[usize]) {
        for param in self.params.iter_mut() {
            param.remove_columns(drop);
        }
    }

    fn num_factors(&self) -> Option<usize> {
        self.params.first().map(|p| p.ncols())
    }

    fn sample(
        &self,
        _nb: &Neighbours,
        which: Which,
        rng: &mut dyn RngCore,
    ) -> anyhow::Result<Vec<Array2<f64>>> {
        self.params.iter().map(|param| param.sample(which, rng)).collect()
    }
}
