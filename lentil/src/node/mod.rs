pub mod ard;
pub mod data;
pub mod factors;
pub mod loadings;
pub mod sparsity;
pub mod tau;

pub use ard::ArdNode;
pub use data::DataNode;
pub use factors::FactorNode;
pub use loadings::LoadingNode;
pub use sparsity::SparsityNode;
pub use tau::NoisePrecisionNode;

use crate::options::TrainOptions;

use anyhow::bail;
use matrix_param::traits::Which;
use ndarray::prelude::*;
use rand::RngCore;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// The closed set of node kinds in a multi-view factor model
#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NodeKind {
    Y,
    Z,
    W,
    AlphaW,
    ThetaW,
    Tau,
}

impl NodeKind {
    pub const COUNT: usize = 6;

    pub const ALL: [NodeKind; NodeKind::COUNT] = [
        NodeKind::Y,
        NodeKind::Z,
        NodeKind::W,
        NodeKind::AlphaW,
        NodeKind::ThetaW,
        NodeKind::Tau,
    ];

    pub fn index(&self) -> usize {
        *self as usize
    }

    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::Y => "Y",
            NodeKind::Z => "Z",
            NodeKind::W => "W",
            NodeKind::AlphaW => "AlphaW",
            NodeKind::ThetaW => "ThetaW",
            NodeKind::Tau => "Tau",
        }
    }

    /// Sparsity nodes are held fixed until `start_sparsity`
    pub fn is_sparsity(&self) -> bool {
        matches!(self, NodeKind::ThetaW)
    }

    /// Neighbours whose expectations this kind reads
    pub fn markov_blanket(&self) -> &'static [NodeKind] {
        match self {
            NodeKind::Y => &[NodeKind::Z, NodeKind::W, NodeKind::Tau],
            NodeKind::Z => &[NodeKind::Y, NodeKind::W, NodeKind::Tau],
            NodeKind::W => &[
                NodeKind::Y,
                NodeKind::Z,
                NodeKind::Tau,
                NodeKind::AlphaW,
                NodeKind::ThetaW,
            ],
            NodeKind::AlphaW => &[NodeKind::W],
            NodeKind::ThetaW => &[NodeKind::W],
            NodeKind::Tau => &[NodeKind::Y, NodeKind::Z, NodeKind::W],
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for NodeKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match NodeKind::ALL.iter().find(|k| k.name() == s) {
            Some(k) => Ok(*k),
            None => bail!("unknown node: {}", s),
        }
    }
}

/// Stable position of a node in the arena
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeHandle(pub usize);

/// Resolved neighbour handles of one node
#[derive(Clone, Debug, Default)]
pub struct MarkovBlanket {
    handles: [Option<NodeHandle>; NodeKind::COUNT],
}

impl MarkovBlanket {
    /// Resolve `kind`'s declared neighbours against the arena
    pub fn resolve(kind: NodeKind, nodes: &[Node]) -> anyhow::Result<Self> {
        let mut ret = Self::default();
        for &nb in kind.markov_blanket() {
            match nodes.iter().position(|x| x.kind() == nb) {
                Some(h) => ret.handles[nb.index()] = Some(NodeHandle(h)),
                None => bail!("node {} needs {} in its Markov blanket", kind, nb),
            }
        }
        Ok(ret)
    }

    pub fn get(&self, kind: NodeKind) -> Option<NodeHandle> {
        self.handles[kind.index()]
    }
}

/// Named moment (or parameter) matrices of one block, e.g., one view
pub type Moments = BTreeMap<&'static str, Array2<f64>>;

/// What one call of `update` should do
#[derive(Clone, Copy, Debug)]
pub struct UpdateStep<'a> {
    /// sample indices of the current mini-batch, `None` for all samples
    pub batch: Option<&'a [usize]>,
    /// step size; 1 replaces the posterior
    pub rho: f64,
}

impl UpdateStep<'_> {
    pub fn full() -> Self {
        UpdateStep {
            batch: None,
            rho: 1.,
        }
    }

    /// N / |batch|, the factor that unbiases extensive statistics
    pub fn scale(&self, n: usize) -> f64 {
        match self.batch {
            Some(ix) if !ix.is_empty() => n as f64 / ix.len() as f64,
            _ => 1.,
        }
    }
}

/// A node holding a prior P and an approximate posterior Q
///
/// `update` may only mutate this node's own Q; every other piece of
/// state is read through the `Neighbours` view.
pub trait VariationalNode {
    fn kind(&self) -> NodeKind;

    /// One-time setup before the first ELBO evaluation
    fn precompute(&mut self, _nb: &Neighbours, _opts: &TrainOptions) -> anyhow::Result<()> {
        Ok(())
    }

    fn update(&mut self, nb: &Neighbours, step: &UpdateStep) -> anyhow::Result<()>;

    /// `E_q[ln p(x | parents)] - E_q[ln q(x)]`
    fn calculate_elbo(&self, nb: &Neighbours) -> anyhow::Result<f64>;

    /// Moments of each block; `expand` broadcasts per-feature
    /// quantities along the sample axis
    fn expectations(&self, expand: bool) -> Vec<Moments>;

    /// The first moment of each block
    fn expectation(&self, expand: bool) -> Vec<Array2<f64>> {
        self.expectations(expand)
            .into_iter()
            .map(|mut x| x.remove("E").unwrap_or_default())
            .collect()
    }

    /// Prior and posterior parameters of each block
    fn parameters(&self) -> Vec<Moments>;

    /// Drop factors (columns); no-op for nodes without a factor axis
    fn remove_factors(&mut self, _drop: &[usize]) {}

    /// Number of factors, `None` for nodes without a factor axis
    fn num_factors(&self) -> Option<usize> {
        None
    }

    /// Draw each block from the prior or from the posterior
    fn sample(
        &self,
        nb: &Neighbours,
        which: Which,
        rng: &mut dyn RngCore,
    ) -> anyhow::Result<Vec<Array2<f64>>>;

    /// Restrict the next updates to these sample indices
    fn define_mini_batch(&mut self, _ix: Option<&[usize]>) {}
}

pub enum Node {
    Y(DataNode),
    Z(FactorNode),
    W(LoadingNode),
    AlphaW(ArdNode),
    ThetaW(SparsityNode),
    Tau(NoisePrecisionNode),
}

impl Node {
    pub fn kind(&self) -> NodeKind {
        self.as_variational().kind()
    }

    pub fn as_variational(&self) -> &dyn VariationalNode {
        match self {
            Node::Y(x) => x,
            Node::Z(x) => x,
            Node::W(x) => x,
            Node::AlphaW(x) => x,
            Node::ThetaW(x) => x,
            Node::Tau(x) => x,
        }
    }

    pub fn as_variational_mut(&mut self) -> &mut dyn VariationalNode {
        match self {
            Node::Y(x) => x,
            Node::Z(x) => x,
            Node::W(x) => x,
            Node::AlphaW(x) => x,
            Node::ThetaW(x) => x,
            Node::Tau(x) => x,
        }
    }
}

/// Read-only view of the arena without the node being visited
pub struct Neighbours<'a> {
    before: &'a [Node],
    after: &'a [Node],
    at: usize,
    blanket: &'a MarkovBlanket,
}

impl<'a> Neighbours<'a> {
    /// Split the arena into the node at `at` (mutable) and its neighbours
    pub fn split_mut(
        nodes: &'a mut [Node],
        at: usize,
        blanket: &'a MarkovBlanket,
    ) -> (&'a mut Node, Neighbours<'a>) {
        let (before, rest) = nodes.split_at_mut(at);
        let (node, after) = rest.split_first_mut().expect("node handle out of range");
        (
            node,
            Neighbours {
                before,
                after,
                at,
                blanket,
            },
        )
    }

    pub fn split(
        nodes: &'a [Node],
        at: usize,
        blanket: &'a MarkovBlanket,
    ) -> (&'a Node, Neighbours<'a>) {
        let (before, rest) = nodes.split_at(at);
        let (node, after) = rest.split_first().expect("node handle out of range");
        (
            node,
            Neighbours {
                before,
                after,
                at,
                blanket,
            },
        )
    }

    fn lookup(&self, kind: NodeKind) -> &'a Node {
        let NodeHandle(h) = self
            .blanket
            .get(kind)
            .unwrap_or_else(|| panic!("{} is not in this Markov blanket", kind));
        assert_ne!(h, self.at, "a node is not its own neighbour");
        if h < self.at {
            &self.before[h]
        } else {
            &self.after[h - self.at - 1]
        }
    }

    pub fn data(&self) -> &'a DataNode {
        match self.lookup(NodeKind::Y) {
            Node::Y(x) => x,
            _ => unreachable!("handle of Y points elsewhere"),
        }
    }

    pub fn factors(&self) -> &'a FactorNode {
        match self.lookup(NodeKind::Z) {
            Node::Z(x) => x,
            _ => unreachable!("handle of Z points elsewhere"),
        }
    }

    pub fn loadings(&self) -> &'a LoadingNode {
        match self.lookup(NodeKind::W) {
            Node::W(x) => x,
            _ => unreachable!("handle of W points elsewhere"),
        }
    }

    pub fn ard(&self) -> &'a ArdNode {
        match self.lookup(NodeKind::AlphaW) {
            Node::AlphaW(x) => x,
            _ => unreachable!("handle of AlphaW points elsewhere"),
        }
    }

    pub fn sparsity(&self) -> &'a SparsityNode {
        match self.lookup(NodeKind::ThetaW) {
            Node::ThetaW(x) => x,
            _ => unreachable!("handle of ThetaW points elsewhere"),
        }
    }

    pub fn noise(&self) -> &'a NoisePrecisionNode {
        match self.lookup(NodeKind::Tau) {
            Node::Tau(x) => x,
            _ => unreachable!("handle of Tau points elsewhere"),
        }
    }
}

/// Sum over observed entries of each column of `x`
pub(crate) fn masked_col_sum(x: &Array2<f64>, observed: &Array2<f64>) -> Array1<f64> {
    (x * observed).sum_axis(Axis(0))
}

/// Rows `ix` of `x`, or a copy of `x` when no batch is given
pub(crate) fn select_rows(x: &Array2<f64>, ix: Option<&[usize]>) -> Array2<f64> {
    match ix {
        Some(ix) => x.select(Axis(0), ix),
        None => x.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_kind_names_round_trip() -> anyhow::Result<()> {
        for k in NodeKind::ALL {
            assert_eq!(k.name().parse::<NodeKind>()?, k);
            assert_eq!(NodeKind::ALL[k.index()], k);
        }
        assert!("Sigma".parse::<NodeKind>().is_err());
        Ok(())
    }

    #[test]
    fn blankets_never_contain_self() {
        for k in NodeKind::ALL {
            assert!(!k.markov_blanket().contains(&k));
        }
        assert!(NodeKind::ThetaW.is_sparsity());
        assert!(!NodeKind::AlphaW.is_sparsity());
    }

    #[test]
    fn batch_scale() {
        let ix = [0, 3, 5, 9];
        let step = UpdateStep {
            batch: Some(&ix),
            rho: 0.5,
        };
        approx::assert_abs_diff_eq!(step.scale(10), 2.5);
        approx::assert_abs_diff_eq!(UpdateStep::full().scale(10), 1.0);
    }
}
