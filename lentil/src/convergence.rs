use crate::options::ConvergenceMode;

/// Counts consecutive small relative ELBO changes
///
/// The first checkpoint is compared against the pre-training ELBO and
/// only arms the monitor. After that, each change below the threshold
/// increments the token and any other change resets it to 1; training
/// has converged once the token reaches 5.
#[derive(Clone, Debug)]
pub struct ConvergenceMonitor {
    threshold: f64,
    token: usize,
    armed: bool,
}

impl ConvergenceMonitor {
    pub const PATIENCE: usize = 5;

    pub fn new(mode: ConvergenceMode) -> Self {
        Self {
            threshold: mode.threshold(),
            token: 1,
            armed: false,
        }
    }

    /// Relative change in percent, `100 |delta / elbo0|`
    pub fn relative_delta(delta: f64, elbo0: f64) -> f64 {
        100. * (delta / elbo0).abs()
    }

    /// Feed one checkpoint and report whether training has converged
    pub fn check(&mut self, delta: f64, elbo0: f64) -> bool {
        if !self.armed {
            self.armed = true;
            return false;
        }
        if Self::relative_delta(delta, elbo0) < self.threshold {
            self.token += 1;
        } else {
            self.token = 1;
        }
        self.token >= Self::PATIENCE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converges_on_fifth_small_change() {
        let mut monitor = ConvergenceMonitor::new(ConvergenceMode::Medium);
        let elbo0 = -1e4;
        let small = 1e-9;
        let converged = (0..5).map(|_| monitor.check(small, elbo0)).collect::<Vec<_>>();
        assert_eq!(converged, vec![false, false, false, false, true]);
    }

    #[test]
    fn large_change_resets() {
        let mut monitor = ConvergenceMonitor::new(ConvergenceMode::Medium);
        let elbo0 = -1e4;
        let small = 1e-9;
        let deltas = [small, small, small, 1.0, small, small, small, small];
        let converged = deltas
            .iter()
            .map(|&d| monitor.check(d, elbo0))
            .collect::<Vec<_>>();
        assert_eq!(converged.iter().position(|&c| c), Some(7));
    }

    #[test]
    fn thresholds_by_mode() {
        // 2e-7 percent
        let (delta, elbo0) = (2e-5, 1e4);
        assert!(ConvergenceMonitor::relative_delta(delta, elbo0) < ConvergenceMode::Fast.threshold());
        assert!(ConvergenceMonitor::relative_delta(delta, elbo0) < ConvergenceMode::Medium.threshold());
        assert!(!(ConvergenceMonitor::relative_delta(delta, elbo0) < ConvergenceMode::Slow.threshold()));
    }
}
