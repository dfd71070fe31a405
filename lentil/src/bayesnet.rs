use crate::convergence::ConvergenceMonitor;
use crate::dims::Dims;
use crate::elbo::{ElboLedger, ElboRecord};
use crate::node::*;
use crate::options::TrainOptions;

use anyhow::bail;
use log::{info, warn};
use matrix_param::traits::Which;
use ndarray::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Instant;

/// How each iteration picks its samples and step size
pub trait BatchSchedule {
    /// Mini-batch indices (`None` for all samples) and step size of
    /// iteration `iter`
    fn next_batch(&mut self, iter: usize) -> (Option<Vec<usize>>, f64);

    fn is_stochastic(&self) -> bool {
        false
    }
}

/// Every iteration sees all samples with step size 1
pub struct FullBatch;

impl BatchSchedule for FullBatch {
    fn next_batch(&mut self, _iter: usize) -> (Option<Vec<usize>>, f64) {
        (None, 1.)
    }
}

/// Per-iteration statistics, index 0 is the state before training
#[derive(Clone, Debug, Default)]
pub struct TrainingStats {
    /// wall time of each iteration in seconds
    pub time: Vec<f64>,
    pub number_factors: Vec<usize>,
    /// total ELBO, `NaN` on iterations without a checkpoint
    pub elbo: Vec<f64>,
    pub ledger: ElboLedger,
    pub converged: bool,
}

/// Coordinate ascent over a fixed arena of variational nodes
pub struct BayesNet {
    dims: Dims,
    nodes: Vec<Node>,
    blankets: Vec<MarkovBlanket>,
    groups: Vec<usize>,
    options: TrainOptions,
    rng: StdRng,
    stats: Option<TrainingStats>,
}

impl BayesNet {
    /// # Arguments
    /// * `dims` - model dimensions
    /// * `nodes` - the arena; each kind at most once
    /// * `groups` - group membership of each sample in `0..dims.g`
    pub fn new(dims: Dims, nodes: Vec<Node>, groups: Vec<usize>) -> anyhow::Result<Self> {
        for (i, node) in nodes.iter().enumerate() {
            if nodes[..i].iter().any(|x| x.kind() == node.kind()) {
                bail!("duplicate node {}", node.kind());
            }
            if let Some(kk) = node.as_variational().num_factors() {
                if kk != dims.k {
                    bail!("node {} has {} factors, expected {}", node.kind(), kk, dims.k);
                }
            }
        }

        if groups.len() != dims.n {
            bail!("{} group labels for {} samples", groups.len(), dims.n);
        }
        if groups.iter().any(|&g| g >= dims.g) {
            bail!("group labels must be in 0..{}", dims.g);
        }

        let blankets = nodes
            .iter()
            .map(|x| MarkovBlanket::resolve(x.kind(), &nodes))
            .collect::<anyhow::Result<Vec<_>>>()?;

        let options = TrainOptions::default();
        Ok(Self {
            dims,
            nodes,
            blankets,
            groups,
            rng: StdRng::seed_from_u64(options.seed),
            options,
            stats: None,
        })
    }

    pub fn set_train_options(&mut self, options: TrainOptions) -> anyhow::Result<()> {
        options.validate()?;
        for kind in options.schedule.iter() {
            if self.handle(*kind).is_none() {
                bail!("scheduled node {} is not in the model", kind);
            }
        }
        if options.stochastic {
            let sopts = options.stochastic_options()?;
            if sopts.batch_size * (self.dims.n as f64) < 1. {
                bail!("batch_size {} leaves empty mini-batches", sopts.batch_size);
            }
        }
        self.rng = StdRng::seed_from_u64(options.seed);
        self.options = options;
        Ok(())
    }

    pub fn options(&self) -> &TrainOptions {
        &self.options
    }

    pub fn dims(&self) -> &Dims {
        &self.dims
    }

    pub fn groups(&self) -> &[usize] {
        &self.groups
    }

    pub fn handle(&self, kind: NodeKind) -> Option<NodeHandle> {
        self.nodes.iter().position(|x| x.kind() == kind).map(NodeHandle)
    }

    pub fn node(&self, kind: NodeKind) -> Option<&Node> {
        self.handle(kind).map(|NodeHandle(h)| &self.nodes[h])
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn training_stats(&self) -> Option<&TrainingStats> {
        self.stats.as_ref()
    }

    fn require(&self, kind: NodeKind) -> anyhow::Result<&Node> {
        self.node(kind)
            .ok_or_else(|| anyhow::anyhow!("no {} node in the model", kind))
    }

    pub fn parameters(&self, kind: NodeKind) -> anyhow::Result<Vec<Moments>> {
        Ok(self.require(kind)?.as_variational().parameters())
    }

    pub fn expectations(&self, kind: NodeKind, expand: bool) -> anyhow::Result<Vec<Moments>> {
        Ok(self.require(kind)?.as_variational().expectations(expand))
    }

    /// First moments of a node's blocks
    pub fn expectation_of(&self, kind: NodeKind) -> anyhow::Result<Vec<Array2<f64>>> {
        Ok(self.require(kind)?.as_variational().expectation(false))
    }

    /// Draw a node's blocks from its prior or posterior
    pub fn sample(&mut self, kind: NodeKind, which: Which) -> anyhow::Result<Vec<Array2<f64>>> {
        let NodeHandle(h) = self
            .handle(kind)
            .ok_or_else(|| anyhow::anyhow!("no {} node in the model", kind))?;
        let (node, nb) = Neighbours::split(&self.nodes, h, &self.blankets[h]);
        node.as_variational().sample(&nb, which, &mut self.rng)
    }

    /// One-time setup of every node and the ELBO before training
    ///
    /// The initial ELBO is computed without the Tau trick of `Y`, since
    /// the precision has not been fit to the data yet.
    pub fn precompute(&mut self) -> anyhow::Result<ElboRecord> {
        for h in 0..self.nodes.len() {
            let (node, nb) = Neighbours::split_mut(&mut self.nodes, h, &self.blankets[h]);
            node.as_variational_mut().precompute(&nb, &self.options)?;
        }

        self.set_tau_trick(false);
        let elbo = self.calculate_elbo(0);
        self.set_tau_trick(self.options.y_elbo_tau_trick);
        let elbo = elbo?;

        if !self.options.quiet {
            if self.options.verbose {
                info!("ELBO before training: {}", format_terms(&elbo));
            }
            info!("ELBO before training: {:.2}", elbo.total());
        }
        Ok(elbo)
    }

    fn set_tau_trick(&mut self, tau_trick: bool) {
        for node in self.nodes.iter_mut() {
            if let Node::Y(y) = node {
                y.set_tau_trick(tau_trick);
            }
        }
    }

    /// Evaluate every node's ELBO term
    pub fn calculate_elbo(&self, iter: usize) -> anyhow::Result<ElboRecord> {
        let mut ret = ElboRecord::new(iter);
        for h in 0..self.nodes.len() {
            let (node, nb) = Neighbours::split(&self.nodes, h, &self.blankets[h]);
            ret.set(node.kind(), node.as_variational().calculate_elbo(&nb)?);
        }
        Ok(ret)
    }

    pub fn update_node(&mut self, kind: NodeKind, step: &UpdateStep) -> anyhow::Result<()> {
        let NodeHandle(h) = self
            .handle(kind)
            .ok_or_else(|| anyhow::anyhow!("no {} node in the model", kind))?;
        let (node, nb) = Neighbours::split_mut(&mut self.nodes, h, &self.blankets[h]);
        node.as_variational_mut().update(&nb, step)
    }

    /// Restrict index-aware nodes to `ix`, or release them with `None`
    pub fn define_mini_batch(&mut self, ix: Option<&[usize]>) {
        for node in self.nodes.iter_mut() {
            node.as_variational_mut().define_mini_batch(ix);
        }
    }

    /// Fraction of variance explained by each factor
    ///
    /// Returns one `M x K` matrix per group,
    /// `1 - Σ_obs (y - E[z_k] E[w_k]')² / Σ_obs y²`; a view without any
    /// signal in a group gets 0.
    pub fn calculate_variance_explained(&self) -> anyhow::Result<Vec<Array2<f64>>> {
        let (y, z, w) = self.data_factors_loadings()?;
        let (mm, kk, gg) = (self.dims.m, self.dims.k, self.dims.g);

        let mut ret = vec![Array2::<f64>::zeros((mm, kk)); gg];
        for (g, r2) in ret.iter_mut().enumerate() {
            let rows = self.group_rows(g);
            let z_g = z.mean().select(Axis(0), &rows);
            let zz_g = z_g.mapv(|x| x * x);

            for m in 0..mm {
                let y_m = y.view(m).select_rows(&rows);
                let w_m = w.e(m);
                let ss = y_m.values.mapv(|x| x * x).sum();
                if ss <= 0. {
                    continue;
                }

                // Σ_obs (y - z w)² = ss - 2 z'Yw + (z²)'O(w²)
                let yw = y_m.values.dot(w_m);
                let ow2 = y_m.observed.dot(&w_m.mapv(|x| x * x));
                let cross = (&z_g * &yw).sum_axis(Axis(0));
                let quad = (&zz_g * &ow2).sum_axis(Axis(0));

                for k in 0..kk {
                    let res = ss - 2. * cross[k] + quad[k];
                    r2[(m, k)] = 1. - res / ss;
                }
            }
        }
        Ok(ret)
    }

    /// Fraction of variance explained by all factors in each view
    pub fn calculate_total_variance_explained(&self) -> anyhow::Result<Array1<f64>> {
        let (y, z, w) = self.data_factors_loadings()?;
        let mut ret = Array1::zeros(self.dims.m);
        for (m, r2) in ret.iter_mut().enumerate() {
            let y_m = y.view(m);
            let ss = y_m.values.mapv(|x| x * x).sum();
            if ss <= 0. {
                continue;
            }
            let pred = z.mean().dot(&w.e(m).t());
            let res = (&(&y_m.values - &pred).mapv(|x| x * x) * &y_m.observed).sum();
            *r2 = 1. - res / ss;
        }
        Ok(ret)
    }

    fn data_factors_loadings(&self) -> anyhow::Result<(&DataNode, &FactorNode, &LoadingNode)> {
        match (
            self.require(NodeKind::Y)?,
            self.require(NodeKind::Z)?,
            self.require(NodeKind::W)?,
        ) {
            (Node::Y(y), Node::Z(z), Node::W(w)) => Ok((y, z, w)),
            _ => bail!("arena kinds out of sync"),
        }
    }

    fn group_rows(&self, g: usize) -> Vec<usize> {
        self.groups
            .iter()
            .enumerate()
            .filter_map(|(i, &x)| (x == g).then_some(i))
            .collect()
    }

    /// Drop one factor that explains at most `min_r2` of the variance
    /// in every view of every group
    ///
    /// Among all such factors, one is picked uniformly at random.
    /// Returns the dropped factor indices.
    pub fn remove_inactive_factors(&mut self, min_r2: f64) -> anyhow::Result<Vec<usize>> {
        let r2 = self.calculate_variance_explained()?;

        let mut candidates: Vec<usize> = (0..self.dims.k).collect();
        for r2_g in r2.iter() {
            candidates.retain(|&k| r2_g.column(k).iter().all(|&x| x <= min_r2));
        }

        let drop = if candidates.is_empty() {
            vec![]
        } else {
            vec![candidates[self.rng.random_range(0..candidates.len())]]
        };

        if !drop.is_empty() {
            for node in self.nodes.iter_mut() {
                node.as_variational_mut().remove_factors(&drop);
            }
            self.dims.k -= drop.len();
            if !self.options.quiet {
                info!("dropped factor {:?}; {} factors left", drop, self.dims.k);
            }
        }

        if self.dims.k == 0 {
            bail!("all factors shut down, no structure found in the data");
        }
        Ok(drop)
    }

    /// Run coordinate ascent on all samples
    pub fn iterate(&mut self) -> anyhow::Result<&TrainingStats> {
        self.run(&mut FullBatch)
    }

    /// The training loop shared by full-batch and stochastic inference
    pub fn run<S: BatchSchedule>(&mut self, schedule: &mut S) -> anyhow::Result<&TrainingStats> {
        let opts = self.options.clone();
        let stochastic = schedule.is_stochastic();

        let mut stats = TrainingStats::default();
        let elbo0 = self.precompute()?;
        let first_total = elbo0.total();
        stats.time.push(0.);
        stats.number_factors.push(self.dims.k);
        stats.elbo.push(first_total);
        stats.ledger.push(elbo0);

        let mut monitor = ConvergenceMonitor::new(opts.convergence_mode);
        let mut last_total = first_total;

        for i in 1..opts.maxiter {
            let t = Instant::now();

            let (batch, rho) = schedule.next_batch(i);
            if stochastic {
                self.define_mini_batch(batch.as_deref());
            }

            if i >= opts.start_drop && i % opts.freq_drop == 0 {
                if let Some(min_r2) = opts.drop.min_r2 {
                    self.remove_inactive_factors(min_r2)?;
                }
            }

            let t_updates = Instant::now();
            let step = UpdateStep {
                batch: batch.as_deref(),
                rho,
            };
            for &kind in opts.schedule.iter() {
                if kind.is_sparsity() && i < opts.start_sparsity {
                    continue;
                }
                self.update_node(kind, &step)?;
            }
            let t_updates = t_updates.elapsed().as_secs_f64();

            let mut elbo_i = f64::NAN;
            let mut converged = false;

            if i >= opts.start_elbo && (i - opts.start_elbo) % opts.elbofreq == 0 {
                let t_elbo = Instant::now();
                let record = self.calculate_elbo(i)?;
                let t_elbo = t_elbo.elapsed().as_secs_f64();

                elbo_i = record.total();
                let delta = elbo_i - last_total;
                last_total = elbo_i;

                if !opts.quiet {
                    let rel = ConvergenceMonitor::relative_delta(delta, first_total);
                    if stochastic {
                        info!(
                            "iteration {}: time={:.2}, ELBO={:.2}, delta={:.3} ({:.9}%), factors={}, step={:.4}",
                            i,
                            t.elapsed().as_secs_f64(),
                            elbo_i,
                            delta,
                            rel,
                            self.dims.k,
                            rho
                        );
                    } else {
                        info!(
                            "iteration {}: time={:.2}, ELBO={:.2}, delta={:.3} ({:.9}%), factors={}",
                            i,
                            t.elapsed().as_secs_f64(),
                            elbo_i,
                            delta,
                            rel,
                            self.dims.k
                        );
                        if delta < 0. {
                            warn!("lower bound is decreasing at iteration {}", i);
                        }
                    }
                    if opts.verbose {
                        info!("{}", format_terms(&record));
                        info!(
                            "time spent in ELBO computation: {:.1}%",
                            100. * t_elbo / (t_updates + t_elbo)
                        );
                    }
                }
                stats.ledger.push(record);

                if !opts.forceiter {
                    converged = monitor.check(delta, first_total);
                }
            } else if !opts.quiet {
                info!(
                    "iteration {}: time={:.2}, factors={}",
                    i,
                    t.elapsed().as_secs_f64(),
                    self.dims.k
                );
            }

            if opts.verbose && !opts.quiet {
                let r2 = self.calculate_total_variance_explained()?;
                let r2 = r2
                    .iter()
                    .enumerate()
                    .map(|(m, x)| format!("view {}: {:.3}%", m, 100. * x))
                    .collect::<Vec<_>>();
                info!("variance explained: {}", r2.join("  "));
            }

            stats.time.push(t.elapsed().as_secs_f64());
            stats.number_factors.push(self.dims.k);
            stats.elbo.push(elbo_i);

            if converged {
                stats.converged = true;
                if !opts.quiet {
                    info!("converged at iteration {}", i);
                }
                break;
            }
        }

        if stochastic {
            self.define_mini_batch(None);
        }

        Ok(self.stats.insert(stats))
    }
}

fn format_terms(record: &ElboRecord) -> String {
    let mut ret = record
        .terms()
        .map(|(k, v)| format!("{}={:.2}", k, v))
        .collect::<Vec<_>>();
    ret.push(format!("total={:.2}", record.total()));
    ret.join("  ")
}
