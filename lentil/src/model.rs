use crate::backend::ComputeBackend;
use crate::bayesnet::BayesNet;
use crate::dims::Dims;
use crate::node::*;

use anyhow::bail;
use matrix_util::traits::*;
use ndarray::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;

/// Hyper parameters of the priors
#[derive(Clone, Debug, PartialEq)]
pub struct Priors {
    /// Gamma(shape, rate) of the noise precision
    pub tau: (f64, f64),
    /// Gamma(shape, rate) of the ARD precision
    pub alpha: (f64, f64),
    /// Beta(a, b) of the sparsity level
    pub theta: (f64, f64),
    /// N(mean, var) of the factors
    pub z: (f64, f64),
}

impl Default for Priors {
    fn default() -> Self {
        Self {
            tau: (1e-14, 1e-14),
            alpha: (1e-14, 1e-14),
            theta: (1., 1.),
            z: (0., 1.),
        }
    }
}

/// Assembles the standard multi-view factor model
pub struct ModelBuilder {
    views: Vec<Array2<f64>>,
    num_factors: usize,
    groups: Option<Vec<usize>>,
    priors: Priors,
    backend: ComputeBackend,
    seed: u64,
    centre: bool,
    init_factors: Option<Array2<f64>>,
    init_loadings: Option<Vec<Array2<f64>>>,
}

impl ModelBuilder {
    /// # Arguments
    /// * `views` - N x D_m data of each view, `NaN` for missing
    /// * `num_factors` - initial number of factors K
    pub fn new(views: Vec<Array2<f64>>, num_factors: usize) -> Self {
        Self {
            views,
            num_factors,
            groups: None,
            priors: Priors::default(),
            backend: ComputeBackend::Ndarray,
            seed: 42,
            centre: true,
            init_factors: None,
            init_loadings: None,
        }
    }

    /// group index of each sample; all samples in one group by default
    pub fn groups(mut self, groups: Vec<usize>) -> Self {
        self.groups = Some(groups);
        self
    }

    pub fn priors(mut self, priors: Priors) -> Self {
        self.priors = priors;
        self
    }

    pub fn backend(mut self, backend: ComputeBackend) -> Self {
        self.backend = backend;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// centre each feature over observed samples (default: true)
    pub fn centre(mut self, centre: bool) -> Self {
        self.centre = centre;
        self
    }

    /// N x K initial factor means
    pub fn init_factors(mut self, z: Array2<f64>) -> Self {
        self.init_factors = Some(z);
        self
    }

    /// D_m x K initial slab means of each view
    pub fn init_loadings(mut self, w: Vec<Array2<f64>>) -> Self {
        self.init_loadings = Some(w);
        self
    }

    pub fn build(self) -> anyhow::Result<BayesNet> {
        let kk = self.num_factors;
        if kk == 0 {
            bail!("need at least one factor");
        }
        if self.views.is_empty() {
            bail!("need at least one view");
        }
        let nn = self.views[0].nrows();
        if nn == 0 || self.views.iter().any(|y| y.nrows() != nn) {
            bail!("views must share the same (non-zero) number of samples");
        }

        let groups = self.groups.unwrap_or_else(|| vec![0; nn]);
        let gg = groups.iter().max().map(|&g| g + 1).unwrap_or(1);
        let features: Vec<usize> = self.views.iter().map(|y| y.ncols()).collect();
        let dims = Dims::new(nn, kk, gg, features.clone());

        let views = if self.centre {
            self.views.iter().map(|y| y.centre_columns()).collect::<Vec<_>>()
        } else {
            self.views
        };

        let mut rng = StdRng::seed_from_u64(self.seed);

        let z0 = match self.init_factors {
            Some(z) => {
                if z.dim() != (nn, kk) {
                    bail!("initial factors must be {} x {}", nn, kk);
                }
                z
            }
            None => Array2::<f64>::rnorm(nn, kk, &mut rng),
        };

        let w0 = match self.init_loadings {
            Some(w) => {
                if w.len() != features.len()
                    || w.iter().zip(features.iter()).any(|(w, &dd)| w.dim() != (dd, kk))
                {
                    bail!("initial loadings must be D_m x {} in each view", kk);
                }
                w
            }
            None => features
                .iter()
                .map(|&dd| Array2::<f64>::rnorm(dd, kk, &mut rng))
                .collect(),
        };

        let backend = self.backend;
        let priors = self.priors;

        let nodes = vec![
            Node::Y(DataNode::new(&views, backend.clone())?),
            Node::Z(FactorNode::new(&z0, priors.z, backend.clone())),
            Node::W(LoadingNode::new(nn, &w0, 1., 0.5, backend.clone())),
            Node::AlphaW(ArdNode::new(&features, kk, priors.alpha, (1., 1.))),
            Node::ThetaW(SparsityNode::new(&features, kk, priors.theta, (1., 1.))),
            Node::Tau(NoisePrecisionNode::new(nn, &features, priors.tau, (1., 1.), backend)),
        ];

        BayesNet::new(dims, nodes, groups)
    }
}
