use log::info;
use matrix_util::common_io::write_types;
use matrix_util::traits::*;
use ndarray::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Bernoulli, Distribution, Normal};

pub struct SimArgs {
    pub rows: usize,
    pub features: Vec<usize>,
    pub factors: usize,
    pub groups: usize,
    /// standard deviation of the Gaussian noise
    pub noise_sd: f64,
    /// probability that a factor is active in a view
    pub active: f64,
    /// fraction of missing entries
    pub missing: f64,
    pub rseed: u64,
}

impl Default for SimArgs {
    fn default() -> Self {
        Self {
            rows: 100,
            features: vec![50, 50],
            factors: 5,
            groups: 1,
            noise_sd: 0.5,
            active: 1.0,
            missing: 0.,
            rseed: 42,
        }
    }
}

pub struct SimOut {
    /// N x D of each view, `NaN` for missing
    pub views: Vec<Array2<f64>>,
    /// N x K
    pub z: Array2<f64>,
    /// D x K of each view
    pub w: Vec<Array2<f64>>,
    pub groups: Vec<usize>,
}

/// Generate multi-view data from a linear factor model
///
/// ```text
/// Y_m(n, d) = Σ_k z(n, k) w_m(d, k) + ε,  ε ~ N(0, noise_sd²)
/// w_m(d, k) ~ N(0, 1) if factor k is active in view m, else 0
/// ```
///
pub fn generate_factor_data(args: &SimArgs) -> anyhow::Result<SimOut> {
    if args.factors == 0 || args.rows == 0 || args.features.is_empty() {
        anyhow::bail!("need at least one sample, feature, view and factor");
    }
    if args.groups == 0 || args.groups > args.rows {
        anyhow::bail!("groups must be in 1..={}", args.rows);
    }

    let mut rng = StdRng::seed_from_u64(args.rseed);
    let (nn, kk) = (args.rows, args.factors);

    let z = Array2::<f64>::rnorm(nn, kk, &mut rng);

    let active = Bernoulli::new(args.active)?;
    let missing = Bernoulli::new(args.missing)?;
    let noise = Normal::new(0., args.noise_sd)?;

    let mut views = Vec::with_capacity(args.features.len());
    let mut w = Vec::with_capacity(args.features.len());

    for &dd in args.features.iter() {
        let mut w_m = Array2::<f64>::rnorm(dd, kk, &mut rng);
        for mut w_k in w_m.columns_mut() {
            if !active.sample(&mut rng) {
                w_k.fill(0.);
            }
        }

        let mut y_m = z.dot(&w_m.t());
        y_m.mapv_inplace(|y| y + noise.sample(&mut rng));
        y_m.mapv_inplace(|y| if missing.sample(&mut rng) { f64::NAN } else { y });

        views.push(y_m);
        w.push(w_m);
    }

    let groups = (0..nn).map(|i| i * args.groups / nn).collect();

    Ok(SimOut { views, z, w, groups })
}

/// Write simulated data under `out`
///
/// * `{out}.view{m}.tsv.gz` - observed data
/// * `{out}.z.tsv.gz` - true factors
/// * `{out}.w{m}.tsv.gz` - true loadings
/// * `{out}.groups.gz` - group membership
///
pub fn generate_factor_data_files(args: &SimArgs, out: &str) -> anyhow::Result<Vec<Box<str>>> {
    let sim = generate_factor_data(args)?;

    let mut data_files = vec![];
    for (m, (y_m, w_m)) in sim.views.iter().zip(sim.w.iter()).enumerate() {
        let data_file = format!("{}.view{}.tsv.gz", out, m);
        y_m.to_tsv(&data_file)?;
        w_m.to_tsv(&format!("{}.w{}.tsv.gz", out, m))?;
        data_files.push(data_file.into_boxed_str());
    }
    sim.z.to_tsv(&format!("{}.z.tsv.gz", out))?;
    write_types(&sim.groups, &format!("{}.groups.gz", out))?;

    info!("wrote {} views: {:?}", data_files.len(), data_files);
    Ok(data_files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_shapes_and_missing() -> anyhow::Result<()> {
        let args = SimArgs {
            rows: 40,
            features: vec![10, 7],
            factors: 3,
            groups: 2,
            missing: 0.2,
            ..Default::default()
        };
        let sim = generate_factor_data(&args)?;
        assert_eq!(sim.views[0].dim(), (40, 10));
        assert_eq!(sim.views[1].dim(), (40, 7));
        assert_eq!(sim.w[1].dim(), (7, 3));
        assert_eq!(sim.groups.iter().filter(|&&g| g == 1).count(), 20);

        let nmiss = sim.views[0].iter().filter(|x| x.is_nan()).count();
        assert!(nmiss > 0 && nmiss < 400);
        Ok(())
    }
}
