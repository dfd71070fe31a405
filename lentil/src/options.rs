use crate::node::NodeKind;

use anyhow::bail;
use clap::ValueEnum;
use serde::Deserialize;
use std::str::FromStr;

/// How strict the relative ELBO change test is
#[derive(ValueEnum, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[clap(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ConvergenceMode {
    Fast,
    Medium,
    Slow,
}

impl ConvergenceMode {
    /// threshold on `100 * |delta / elbo(0)|`
    pub fn threshold(&self) -> f64 {
        match self {
            ConvergenceMode::Fast => 1e-5,
            ConvergenceMode::Medium => 1e-6,
            ConvergenceMode::Slow => 1e-7,
        }
    }
}

impl FromStr for ConvergenceMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "fast" => Ok(ConvergenceMode::Fast),
            "medium" => Ok(ConvergenceMode::Medium),
            "slow" => Ok(ConvergenceMode::Slow),
            _ => bail!("unknown convergence mode: {}", s),
        }
    }
}

#[derive(Deserialize, Clone, Debug, Default, PartialEq)]
pub struct DropOptions {
    /// drop a factor once its R² falls at or below this in every view
    #[serde(default)]
    pub min_r2: Option<f64>,
}

/// Options of the stochastic phase, all present
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StochasticOptions {
    pub batch_size: f64,
    pub learning_rate: f64,
    pub forgetting_rate: f64,
    pub start_stochastic: usize,
}

fn default_seed() -> u64 {
    42
}

fn default_tau_trick() -> bool {
    true
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
pub struct TrainOptions {
    pub maxiter: usize,
    pub start_drop: usize,
    pub freq_drop: usize,
    pub verbose: bool,
    pub quiet: bool,
    pub tolerance: f64,
    pub convergence_mode: ConvergenceMode,
    pub forceiter: bool,
    pub schedule: Vec<NodeKind>,
    pub start_sparsity: usize,
    pub gpu_mode: bool,
    pub start_elbo: usize,
    pub elbofreq: usize,
    pub drop: DropOptions,
    pub stochastic: bool,

    ////////////////////////////////
    // only used with stochastic  //
    ////////////////////////////////
    #[serde(default)]
    pub batch_size: Option<f64>,
    #[serde(default)]
    pub learning_rate: Option<f64>,
    #[serde(default)]
    pub forgetting_rate: Option<f64>,
    #[serde(default)]
    pub start_stochastic: Option<usize>,

    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_tau_trick")]
    pub y_elbo_tau_trick: bool,
}

impl Default for TrainOptions {
    fn default() -> Self {
        Self {
            maxiter: 1000,
            start_drop: 1,
            freq_drop: 1,
            verbose: false,
            quiet: false,
            tolerance: 1e-2,
            convergence_mode: ConvergenceMode::Fast,
            forceiter: false,
            schedule: vec![
                NodeKind::Y,
                NodeKind::W,
                NodeKind::Z,
                NodeKind::AlphaW,
                NodeKind::ThetaW,
                NodeKind::Tau,
            ],
            start_sparsity: 100,
            gpu_mode: false,
            start_elbo: 1,
            elbofreq: 1,
            drop: DropOptions::default(),
            stochastic: false,
            batch_size: None,
            learning_rate: None,
            forgetting_rate: None,
            start_stochastic: None,
            seed: default_seed(),
            y_elbo_tau_trick: default_tau_trick(),
        }
    }
}

impl TrainOptions {
    /// Parse and validate a JSON options document
    pub fn from_json_str(json: &str) -> anyhow::Result<Self> {
        let ret: Self = serde_json::from_str(json)?;
        ret.validate()?;
        Ok(ret)
    }

    pub fn from_json_file(file: &str) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(file)
            .map_err(|e| anyhow::anyhow!("failed to read {}: {}", file, e))?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.maxiter == 0 {
            bail!("maxiter must be positive");
        }
        if self.elbofreq == 0 {
            bail!("elbofreq must be positive");
        }
        if self.freq_drop == 0 {
            bail!("freq_drop must be positive");
        }
        if self.schedule.is_empty() {
            bail!("empty update schedule");
        }
        for (i, k) in self.schedule.iter().enumerate() {
            if self.schedule[..i].contains(k) {
                bail!("node {} scheduled twice", k);
            }
        }
        if let Some(r2) = self.drop.min_r2 {
            if !r2.is_finite() {
                bail!("drop.min_r2 must be finite");
            }
        }
        if self.stochastic {
            self.stochastic_options()?;
        }
        Ok(())
    }

    /// Stochastic settings, checked for presence and range
    pub fn stochastic_options(&self) -> anyhow::Result<StochasticOptions> {
        let (Some(batch_size), Some(learning_rate), Some(forgetting_rate), Some(start_stochastic)) = (
            self.batch_size,
            self.learning_rate,
            self.forgetting_rate,
            self.start_stochastic,
        ) else {
            bail!(
                "stochastic inference needs batch_size, learning_rate, \
		 forgetting_rate and start_stochastic"
            );
        };

        if !(batch_size > 0. && batch_size <= 1.) {
            bail!("batch_size must be in (0, 1], got {}", batch_size);
        }
        if !(learning_rate > 0. && learning_rate <= 1.) {
            bail!("learning_rate must be in (0, 1], got {}", learning_rate);
        }
        if !(forgetting_rate >= 0.) {
            bail!("forgetting_rate must be non-negative, got {}", forgetting_rate);
        }
        if start_stochastic < 1 {
            bail!("start_stochastic must be at least 1");
        }

        Ok(StochasticOptions {
            batch_size,
            learning_rate,
            forgetting_rate,
            start_stochastic,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"{
        "maxiter": 10, "start_drop": 1, "freq_drop": 1,
        "verbose": false, "quiet": true, "tolerance": 0.01,
        "convergence_mode": "medium", "forceiter": false,
        "schedule": ["Y", "W", "Z", "AlphaW", "ThetaW", "Tau"],
        "start_sparsity": 1, "gpu_mode": false,
        "start_elbo": 1, "elbofreq": 1,
        "drop": {"min_r2": 0.01},
        "stochastic": false
    }"#;

    #[test]
    fn parse_complete_document() -> anyhow::Result<()> {
        let opts = TrainOptions::from_json_str(FULL)?;
        assert_eq!(opts.convergence_mode, ConvergenceMode::Medium);
        assert_eq!(opts.schedule.len(), 6);
        assert_eq!(opts.drop.min_r2, Some(0.01));
        assert_eq!(opts.seed, 42);
        assert!(opts.y_elbo_tau_trick);
        Ok(())
    }

    #[test]
    fn reject_missing_key() {
        let json = FULL.replace(r#""elbofreq": 1,"#, "");
        let err = TrainOptions::from_json_str(&json).unwrap_err();
        assert!(err.to_string().contains("elbofreq"));
    }

    #[test]
    fn reject_unknown_convergence_mode() {
        let json = FULL.replace(r#""medium""#, r#""sluggish""#);
        assert!(TrainOptions::from_json_str(&json).is_err());
        assert!("sluggish".parse::<ConvergenceMode>().is_err());
    }

    #[test]
    fn stochastic_requires_its_keys() {
        let json = FULL.replace(r#""stochastic": false"#, r#""stochastic": true"#);
        assert!(TrainOptions::from_json_str(&json).is_err());

        let json = FULL.replace(
            r#""stochastic": false"#,
            r#""stochastic": true, "batch_size": 1.5, "learning_rate": 1.0,
               "forgetting_rate": 0.5, "start_stochastic": 1"#,
        );
        assert!(TrainOptions::from_json_str(&json).is_err());

        let json = json.replace("1.5", "0.5");
        let opts = TrainOptions::from_json_str(&json).unwrap();
        assert_eq!(opts.stochastic_options().unwrap().batch_size, 0.5);
    }

    #[test]
    fn reject_zero_elbofreq() {
        let opts = TrainOptions {
            elbofreq: 0,
            ..Default::default()
        };
        assert!(opts.validate().is_err());
    }
}
