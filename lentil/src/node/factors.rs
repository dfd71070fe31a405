use crate::backend::ComputeBackend;
use crate::node::*;

use matrix_param::ndarray_gaussian::GaussianMatrix;
use matrix_param::traits::*;

/// Factor scores `z[n,k] ~ N(m0, v0)`
pub struct FactorNode {
    param: GaussianMatrix,
    backend: ComputeBackend,
}

impl FactorNode {
    /// # Arguments
    /// * `init_mean` - N x K initial posterior mean
    /// * `(mean0, var0)` - prior mean and variance
    pub fn new(init_mean: &Array2<f64>, (mean0, var0): (f64, f64), backend: ComputeBackend) -> Self {
        let mut param = GaussianMatrix::new(init_mean.dim(), mean0, var0);
        param.set_mean_var(init_mean, &Array2::ones(init_mean.dim()));
        Self { param, backend }
    }

    pub fn param(&self) -> &GaussianMatrix {
        &self.param
    }

    /// `E[z]`, N x K
    pub fn mean(&self) -> &Array2<f64> {
        self.param.posterior_mean()
    }

    /// `E[z²]`, N x K
    pub fn sq_mean(&self) -> &Array2<f64> {
        self.param.posterior_sq_mean()
    }
}

impl VariationalNode for FactorNode {
    fn kind(&self) -> NodeKind {
        NodeKind::Z
    }

    /// Column-wise coordinate ascent over factors
    ///
    /// For factor k with residual `R_k = Y - Σ_{j≠k} E[z_j] E[w_j]'`
    /// * λ = 1/v0 + Σ_m T_m E[w²_k]
    /// * η = m0/v0 + Σ_m (T_m ⊙ R_k) E[w_k]
    ///
    /// Scores are local, so a mini-batch only replaces its own rows.
    fn update(&mut self, nb: &Neighbours, step: &UpdateStep) -> anyhow::Result<()> {
        let y = nb.data();
        let w = nb.loadings();
        let tau = nb.noise();

        let rows: Vec<usize> = match step.batch {
            Some(ix) => ix.to_vec(),
            None => (0..self.param.nrows()).collect(),
        };
        let views: Vec<_> = (0..y.num_views())
            .map(|m| match step.batch {
                Some(_) => y.batch_view(m),
                None => y.view(m),
            })
            .collect();

        let z_mean = self.mean().select(Axis(0), &rows);

        let mut residuals = Vec::with_capacity(views.len());
        let mut precisions = Vec::with_capacity(views.len());
        for (m, y_m) in views.iter().enumerate() {
            residuals.push(&y_m.values - &self.backend.matmul_nt(&z_mean, w.e(m))?);
            precisions.push(tau.masked_expanded_mean(m, y_m));
        }

        for k in 0..self.param.ncols() {
            let z_k_old = self.mean().column(k).select(Axis(0), &rows);

            let mut add_eta = Array1::<f64>::zeros(rows.len());
            let mut add_lambda = Array1::<f64>::zeros(rows.len());

            for m in 0..views.len() {
                let w_k = w.e(m).column(k);
                let w2_k = w.e2(m).column(k);
                let resid = &mut residuals[m];

                // add factor k back into the residual
                resid.zip_mut_with(
                    &(&z_k_old.view().insert_axis(Axis(1)) * &w_k.insert_axis(Axis(0))),
                    |r, &x| *r += x,
                );

                add_lambda += &precisions[m].dot(&w2_k);
                add_eta += &(&precisions[m] * &*resid).dot(&w_k);
            }

            match step.batch {
                Some(_) => self
                    .param
                    .update_stat_col_rows(&add_eta, &add_lambda, k, &rows),
                None => self.param.update_stat_col(&add_eta, &add_lambda, k, 1.),
            }

            let z_k_new = self.mean().column(k).select(Axis(0), &rows);
            for (m, resid) in residuals.iter_mut().enumerate() {
                let w_k = w.e(m).column(k);
                resid.zip_mut_with(
                    &(&z_k_new.view().insert_axis(Axis(1)) * &w_k.insert_axis(Axis(0))),
                    |r, &x| *r -= x,
                );
            }
        }
        Ok(())
    }

    fn calculate_elbo(&self, _nb: &Neighbours) -> anyhow::Result<f64> {
        Ok(self.param.elbo())
    }

    fn expectations(&self, _expand: bool) -> Vec<Moments> {
        vec![Moments::from([
            ("E", self.param.posterior_mean().clone()),
            ("E2", self.param.posterior_sq_mean().clone()),
            ("V", self.param.posterior_var().clone()),
        ])]
    }

    fn parameters(&self) -> Vec<Moments> {
        vec![Moments::from([
            ("mean", self.param.posterior_mean().clone()),
            ("var", self.param.posterior_var().clone()),
            ("prior_mean", Array2::from_elem((1, 1), self.param.prior_mean())),
            ("prior_var", Array2::from_elem((1, 1), self.param.prior_var())),
        ])]
    }

    fn remove_factors(&mut self, drop: &[usize]) {
        self.param.remove_columns(drop);
    }

    fn num_factors(&self) -> Option<usize> {
        Some(self.param.ncols())
    }

    fn sample(
        &self,
        _nb: &Neighbours,
        which: Which,
        rng: &mut dyn RngCore,
    ) -> anyhow::Result<Vec<Array2<f64>>> {
        Ok(vec![self.param.sample(which, rng)?])
    }
}
