use crate::bayesnet::{BatchSchedule, BayesNet, TrainingStats};
use crate::options::{StochasticOptions, TrainOptions};

use anyhow::bail;
use log::info;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

/// Robbins-Monro step size `lr / (1 + fr * epoch)^(3/4)`
pub fn step_size(learning_rate: f64, forgetting_rate: f64, epoch: usize) -> f64 {
    learning_rate / (1. + forgetting_rate * epoch as f64).powf(0.75)
}

/// Mini-batches without replacement
///
/// Each epoch shuffles all N indices once and cuts them into
/// `⌈1/batch_size⌉` consecutive chunks `[⌊b S⌋, ⌊(b+1) S⌋)` with
/// `S = batch_size * N`; the last chunk always runs to N.
pub struct MiniBatchSampler {
    num_samples: usize,
    batch_size: f64,
    shuffled: Vec<usize>,
    rng: StdRng,
}

impl MiniBatchSampler {
    pub fn new(num_samples: usize, batch_size: f64, seed: u64) -> Self {
        Self {
            num_samples,
            batch_size,
            shuffled: (0..num_samples).collect(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn num_batches(&self) -> usize {
        (1. / self.batch_size).ceil() as usize
    }

    /// Indices and epoch of the `j`-th stochastic iteration (from 0)
    pub fn sample(&mut self, j: usize) -> (Vec<usize>, usize) {
        let nb = self.num_batches();
        let (b, epoch) = (j % nb, j / nb);
        if b == 0 {
            self.shuffled = (0..self.num_samples).collect();
            self.shuffled.shuffle(&mut self.rng);
        }

        let nn = self.num_samples;
        let ss = self.batch_size * nn as f64;
        let lb = ((b as f64 * ss).floor() as usize).min(nn);
        let ub = if b + 1 == nb {
            nn
        } else {
            (((b + 1) as f64 * ss).floor() as usize).min(nn)
        };
        (self.shuffled[lb..ub].to_vec(), epoch)
    }
}

/// Full batches with step size 1 until `start_stochastic`, then
/// mini-batches with a decaying step size
struct StochasticSchedule {
    sampler: MiniBatchSampler,
    options: StochasticOptions,
    quiet: bool,
}

impl BatchSchedule for StochasticSchedule {
    fn next_batch(&mut self, iter: usize) -> (Option<Vec<usize>>, f64) {
        if iter < self.options.start_stochastic {
            return (None, 1.);
        }
        let j = iter - self.options.start_stochastic;
        let (ix, epoch) = self.sampler.sample(j);
        if !self.quiet && j % self.sampler.num_batches() == 0 {
            info!("epoch {}", epoch + 1);
        }
        let rho = step_size(
            self.options.learning_rate,
            self.options.forgetting_rate,
            epoch,
        );
        (Some(ix), rho)
    }

    fn is_stochastic(&self) -> bool {
        true
    }
}

/// Stochastic variational inference on top of `BayesNet`
pub struct StochasticBayesNet {
    net: BayesNet,
}

impl StochasticBayesNet {
    pub fn new(net: BayesNet) -> Self {
        Self { net }
    }

    pub fn set_train_options(&mut self, options: TrainOptions) -> anyhow::Result<()> {
        if !options.stochastic {
            bail!("stochastic inference needs `stochastic: true`");
        }
        self.net.set_train_options(options)
    }

    pub fn net(&self) -> &BayesNet {
        &self.net
    }

    pub fn net_mut(&mut self) -> &mut BayesNet {
        &mut self.net
    }

    pub fn into_inner(self) -> BayesNet {
        self.net
    }

    pub fn iterate(&mut self) -> anyhow::Result<&TrainingStats> {
        let opts = self.net.options();
        let sopts = opts.stochastic_options()?;
        let quiet = opts.quiet;
        let seed = opts.seed;

        if !quiet {
            info!(
                "stochastic inference: batch size {:.2}%, forgetting rate {:.2}, \
		 learning rate {:.2}, starting at iteration {}",
                100. * sopts.batch_size,
                sopts.forgetting_rate,
                sopts.learning_rate,
                sopts.start_stochastic
            );
        }

        let mut schedule = StochasticSchedule {
            sampler: MiniBatchSampler::new(self.net.dims().n, sopts.batch_size, seed.wrapping_add(1)),
            options: sopts,
            quiet,
        };
        self.net.run(&mut schedule)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_size_decays() {
        approx::assert_abs_diff_eq!(step_size(1.0, 0.5, 0), 1.0);
        let rho = (0..20).map(|e| step_size(1.0, 0.5, e)).collect::<Vec<_>>();
        assert!(rho.windows(2).all(|x| x[1] < x[0]));
        approx::assert_abs_diff_eq!(rho[2], 2_f64.powf(-0.75), epsilon = 1e-12);
    }

    #[test]
    fn epoch_covers_all_samples() {
        let mut sampler = MiniBatchSampler::new(97, 0.3, 42);
        assert_eq!(sampler.num_batches(), 4);

        for epoch in 0..3 {
            let mut seen = vec![];
            for b in 0..4 {
                let (ix, e) = sampler.sample(epoch * 4 + b);
                assert_eq!(e, epoch);
                assert!(!ix.is_empty());
                seen.extend(ix);
            }
            seen.sort();
            assert_eq!(seen, (0..97).collect::<Vec<_>>());
        }
    }

    #[test]
    fn uneven_fraction_still_covers() {
        let mut sampler = MiniBatchSampler::new(7, 0.21, 1);
        let nb = sampler.num_batches();
        assert_eq!(nb, 5);
        let mut seen = (0..nb).flat_map(|b| sampler.sample(b).0).collect::<Vec<_>>();
        seen.sort();
        assert_eq!(seen, (0..7).collect::<Vec<_>>());
    }

    #[test]
    fn epochs_reshuffle() {
        let mut sampler = MiniBatchSampler::new(50, 0.5, 3);
        let (first, _) = sampler.sample(0);
        let (second_epoch, _) = sampler.sample(2);
        assert_eq!(first.len(), 25);
        assert_ne!(first, second_epoch);
    }
}
