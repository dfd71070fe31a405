use crate::node::*;

use matrix_param::ndarray_beta::BetaMatrix;
use matrix_param::traits::*;

/// Sparsity level `θ_k ~ Beta(a0, b0)` of each view and factor
pub struct SparsityNode {
    params: Vec<BetaMatrix>,
    num_features: Vec<usize>,
}

impl SparsityNode {
    pub fn new(num_features: &[usize], kk: usize, (a0, b0): (f64, f64), init: (f64, f64)) -> Self {
        let params = num_features
            .iter()
            .map(|_| {
                let mut param = BetaMatrix::new((1, kk), a0, b0);
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

    pub fn log_one_minus_mean(&self, m: usize) -> Array1<f64> {
        self.params[m].posterior_log_one_minus_mean().row(0).to_owned()
    }
}

impl VariationalNode for SparsityNode {
    fn kind(&self) -> NodeKind {
        NodeKind::ThetaW
    }

    /// `a = a0 + Σ_d S_dk`, `b = b0 + D - Σ_d S_dk`
    fn update(&mut self, nb: &Neighbours, step: &UpdateStep) -> anyhow::Result<()> {
        let w = nb.loadings();
        for (m, param) in self.params.iter_mut().enumerate() {
            let dd = self.num_features[m] as f64;
            let add_a = w.inclusion(m).sum_axis(Axis(0)).insert_axis(Axis(0));
            let add_b = add_a.mapv(|s| dd - s);
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
                let moments = [
                    ("E", param.posterior_mean()),
                    ("lnE", param.posterior_log_mean()),
                    ("lnEInv", param.posterior_log_one_minus_mean()),
                ];
                moments
                    .into_iter()
                    .map(|(name, x)| {
                        let x = if expand {
                            x.broadcast((dd, param.ncols()))
                                .map(|x| x.to_owned())
                                .unwrap_or_default()
                        } else {
                            x.clone()
                        };
                        (name, x)
                    })
                    .collect()
            })
            .collect()
    }

    fn parameters(&self) -> Vec<Moments> {
        self.params
            .iter()
            .map(|param| {
                Moments::from([
                    ("a", param.a().clone()),
                    ("b", param.b().clone()),
                    ("prior_a", Array2::from_elem((1, 1), param.prior_a())),
                    ("prior_b", Array2::from_elem((1, 1), param.prior_b())),
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
