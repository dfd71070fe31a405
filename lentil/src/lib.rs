/// matrix products on ndarray or candle
pub mod backend;
/// the training loop, pruning and variance explained
pub mod bayesnet;
/// relative-change convergence test
pub mod convergence;
pub mod dims;
/// per-node ELBO records
pub mod elbo;
/// assembling a multi-view factor model from data
pub mod model;
/// variational nodes and the node contract
pub mod node;
/// training options
pub mod options;
/// synthetic multi-view data
pub mod simulate;
/// mini-batches and step sizes
pub mod stochastic;

pub use bayesnet::{BayesNet, TrainingStats};
pub use model::{ModelBuilder, Priors};
pub use options::{ConvergenceMode, TrainOptions};
pub use stochastic::StochasticBayesNet;
