use lentil::backend::ComputeBackend;
use lentil::node::{NodeKind, UpdateStep};
use lentil::options::{DropOptions, TrainOptions};
use lentil::simulate::{generate_factor_data, SimArgs};
use lentil::{BayesNet, ModelBuilder, Priors, StochasticBayesNet};

fn simulated_net(seed: u64, backend: ComputeBackend) -> anyhow::Result<BayesNet> {
    let sim = generate_factor_data(&SimArgs {
        rows: 100,
        features: vec![30, 20],
        factors: 5,
        missing: 0.05,
        rseed: seed,
        ..Default::default()
    })?;
    ModelBuilder::new(sim.views, 5)
        .backend(backend)
        .seed(seed)
        .build()
}

fn full_batch_options() -> TrainOptions {
    TrainOptions {
        maxiter: 50,
        start_elbo: 0,
        elbofreq: 1,
        forceiter: true,
        quiet: true,
        start_sparsity: 1,
        ..Default::default()
    }
}

#[test]
fn full_batch_run_is_reproducible() -> anyhow::Result<()> {
    let mut elbo_bits = vec![];

    for _ in 0..2 {
        let mut net = simulated_net(7, ComputeBackend::Ndarray)?;
        net.set_train_options(full_batch_options())?;
        let stats = net.iterate()?;

        assert_eq!(stats.elbo.len(), 50);
        assert_eq!(stats.number_factors.len(), 50);
        assert!(stats.elbo.iter().all(|x| x.is_finite()));
        assert!(stats.number_factors.windows(2).all(|k| k[1] <= k[0]));
        assert!(!stats.converged);

        elbo_bits.push(stats.elbo.iter().map(|x| x.to_bits()).collect::<Vec<_>>());
    }

    assert_eq!(elbo_bits[0], elbo_bits[1]);
    Ok(())
}

#[test]
fn ledger_total_is_sum_of_node_terms() -> anyhow::Result<()> {
    let mut net = simulated_net(11, ComputeBackend::Ndarray)?;
    net.set_train_options(TrainOptions {
        maxiter: 10,
        ..full_batch_options()
    })?;
    let stats = net.iterate()?;

    assert_eq!(stats.ledger.len(), 10);
    for record in stats.ledger.records() {
        assert_eq!(record.terms().count(), NodeKind::COUNT);
        let sum: f64 = record.terms().map(|(_, v)| v).sum();
        approx::assert_relative_eq!(record.total(), sum, max_relative = 1e-6);
    }
    Ok(())
}

#[test]
fn training_explains_variance() -> anyhow::Result<()> {
    let mut net = simulated_net(3, ComputeBackend::Ndarray)?;
    net.set_train_options(full_batch_options())?;
    net.iterate()?;

    let r2 = net.calculate_total_variance_explained()?;
    assert_eq!(r2.len(), 2);
    assert!(r2.iter().all(|&x| x > 0.5), "r2 = {:?}", r2);

    let r2_k = net.calculate_variance_explained()?;
    assert_eq!(r2_k.len(), 1);
    assert_eq!(r2_k[0].dim(), (2, 5));
    Ok(())
}

#[test]
fn convergence_stops_early() -> anyhow::Result<()> {
    let mut net = simulated_net(5, ComputeBackend::Ndarray)?;
    net.set_train_options(TrainOptions {
        maxiter: 2000,
        forceiter: false,
        convergence_mode: lentil::ConvergenceMode::Fast,
        ..full_batch_options()
    })?;
    let stats = net.iterate()?;
    if stats.converged {
        assert!(stats.elbo.len() < 2000);
        assert!(stats.elbo.last().is_some_and(|x| x.is_finite()));
    } else {
        assert_eq!(stats.elbo.len(), 2000);
    }
    Ok(())
}

#[test]
fn pruning_removes_exactly_one_inactive_factor() -> anyhow::Result<()> {
    let sim = generate_factor_data(&SimArgs {
        rows: 80,
        features: vec![25, 15],
        factors: 3,
        groups: 2,
        noise_sd: 0.1,
        ..Default::default()
    })?;

    // a fourth factor with no loadings explains nothing
    let mut z0 = ndarray::Array2::<f64>::zeros((80, 4));
    z0.slice_mut(ndarray::s![.., ..3]).assign(&sim.z);
    z0.column_mut(3).fill(1.0);
    let w0 = sim
        .w
        .iter()
        .map(|w| {
            let mut w0 = ndarray::Array2::<f64>::zeros((w.nrows(), 4));
            w0.slice_mut(ndarray::s![.., ..3]).assign(w);
            w0
        })
        .collect::<Vec<_>>();

    let mut net = ModelBuilder::new(sim.views, 4)
        .groups(sim.groups)
        .centre(false)
        .init_factors(z0)
        .init_loadings(w0)
        .build()?;
    net.set_train_options(TrainOptions {
        quiet: true,
        drop: DropOptions { min_r2: Some(0.01) },
        ..Default::default()
    })?;

    let r2 = net.calculate_variance_explained()?;
    assert_eq!(r2.len(), 2);
    for r2_g in r2.iter() {
        assert!(r2_g.column(3).iter().all(|&x| x.abs() < 1e-12));
        assert!(r2_g.slice(ndarray::s![.., ..3]).iter().all(|&x| x > 0.01));
    }

    let dropped = net.remove_inactive_factors(0.01)?;
    assert_eq!(dropped, vec![3]);
    assert_eq!(net.dims().k, 3);

    for node in net.nodes() {
        if let Some(kk) = node.as_variational().num_factors() {
            assert_eq!(kk, 3, "{}", node.kind());
        }
    }
    for kind in [NodeKind::Z, NodeKind::W, NodeKind::AlphaW, NodeKind::ThetaW] {
        for moments in net.expectations(kind, false)? {
            assert!(moments.values().all(|x| x.ncols() == 3), "{}", kind);
        }
    }

    let dropped = net.remove_inactive_factors(0.01)?;
    assert!(dropped.is_empty());
    Ok(())
}

#[test]
fn losing_every_factor_is_fatal() -> anyhow::Result<()> {
    let sim = generate_factor_data(&SimArgs {
        rows: 30,
        features: vec![8],
        factors: 2,
        ..Default::default()
    })?;
    let mut net = ModelBuilder::new(sim.views, 2).build()?;
    net.set_train_options(TrainOptions {
        maxiter: 10,
        quiet: true,
        drop: DropOptions { min_r2: Some(1.0) },
        ..Default::default()
    })?;

    let err = net.iterate().unwrap_err();
    assert!(err.to_string().contains("no structure found"));
    assert_eq!(net.dims().k, 0);
    Ok(())
}

#[test]
fn noise_precision_elbo_vanishes_when_posterior_equals_prior() -> anyhow::Result<()> {
    let sim = generate_factor_data(&SimArgs::default())?;
    let net = ModelBuilder::new(sim.views, 3)
        .priors(Priors {
            tau: (1., 1.),
            ..Default::default()
        })
        .build()?;

    let record = net.calculate_elbo(0)?;
    approx::assert_abs_diff_eq!(record.get(NodeKind::Tau).unwrap_or(f64::NAN), 0.0, epsilon = 1e-10);
    Ok(())
}

#[test]
fn backends_agree_on_noise_precision() -> anyhow::Result<()> {
    let mut taus = vec![];
    for backend in [
        ComputeBackend::Ndarray,
        ComputeBackend::Candle(candle_core::Device::Cpu),
    ] {
        let mut net = simulated_net(13, backend)?;
        net.set_train_options(TrainOptions {
            quiet: true,
            ..Default::default()
        })?;
        net.precompute()?;
        net.update_node(NodeKind::Tau, &UpdateStep::full())?;
        taus.push(net.expectation_of(NodeKind::Tau)?);
    }

    for (a, b) in taus[0].iter().zip(taus[1].iter()) {
        approx::assert_abs_diff_eq!(a, b, epsilon = 1e-10);
    }
    Ok(())
}

#[test]
fn noise_precision_matches_brute_force() -> anyhow::Result<()> {
    let sim = generate_factor_data(&SimArgs {
        rows: 20,
        features: vec![6, 4],
        factors: 3,
        missing: 0.2,
        ..Default::default()
    })?;
    let raw = sim.views.clone();
    let priors = Priors::default();

    let mut net = ModelBuilder::new(sim.views, 3).centre(false).build()?;
    net.set_train_options(TrainOptions {
        quiet: true,
        ..Default::default()
    })?;
    net.precompute()?;
    net.update_node(NodeKind::Tau, &UpdateStep::full())?;

    let z = &net.expectations(NodeKind::Z, false)?[0];
    let (ez, ez2) = (&z["E"], &z["E2"]);
    let w = net.expectations(NodeKind::W, false)?;
    let tau = net.parameters(NodeKind::Tau)?;

    for (m, y) in raw.iter().enumerate() {
        let (ew, ew2) = (&w[m]["E"], &w[m]["E2"]);
        for d in 0..y.ncols() {
            let mut ss = 0.;
            let mut nobs = 0.;
            for n in 0..y.nrows() {
                let y_nd = y[(n, d)];
                if !y_nd.is_finite() {
                    continue;
                }
                nobs += 1.;
                let mut pred = 0.;
                let mut var = 0.;
                for k in 0..3 {
                    pred += ez[(n, k)] * ew[(d, k)];
                    var += ez2[(n, k)] * ew2[(d, k)] - (ez[(n, k)] * ew[(d, k)]).powi(2);
                }
                ss += (y_nd - pred).powi(2) + var;
            }
            approx::assert_relative_eq!(tau[m]["b"][(0, d)], priors.tau.1 + 0.5 * ss, max_relative = 1e-9);
            approx::assert_relative_eq!(tau[m]["a"][(0, d)], priors.tau.0 + 0.5 * nobs, max_relative = 1e-9);
        }
    }
    Ok(())
}

#[test]
fn stochastic_run_is_reproducible() -> anyhow::Result<()> {
    let options = TrainOptions {
        maxiter: 30,
        stochastic: true,
        batch_size: Some(0.25),
        learning_rate: Some(1.0),
        forgetting_rate: Some(0.5),
        start_stochastic: Some(5),
        ..full_batch_options()
    };

    let mut elbo_bits = vec![];
    for _ in 0..2 {
        let mut svi = StochasticBayesNet::new(simulated_net(17, ComputeBackend::Ndarray)?);
        svi.set_train_options(options.clone())?;
        let stats = svi.iterate()?;
        assert_eq!(stats.elbo.len(), 30);
        assert!(stats.elbo.iter().all(|x| x.is_finite()));
        elbo_bits.push(stats.elbo.iter().map(|x| x.to_bits()).collect::<Vec<_>>());
    }
    assert_eq!(elbo_bits[0], elbo_bits[1]);
    Ok(())
}

#[test]
fn invalid_settings_are_rejected() -> anyhow::Result<()> {
    let mut net = simulated_net(1, ComputeBackend::Ndarray)?;

    assert!(net
        .set_train_options(TrainOptions {
            elbofreq: 0,
            ..Default::default()
        })
        .is_err());

    assert!(net
        .set_train_options(TrainOptions {
            stochastic: true,
            batch_size: Some(0.001),
            learning_rate: Some(1.0),
            forgetting_rate: Some(0.5),
            start_stochastic: Some(1),
            ..Default::default()
        })
        .is_err());

    let mut svi = StochasticBayesNet::new(net);
    assert!(svi.set_train_options(TrainOptions::default()).is_err());
    Ok(())
}

fn precomputed_net(seed: u64) -> anyhow::Result<BayesNet> {
    let mut net = simulated_net(seed, ComputeBackend::Ndarray)?;
    net.set_train_options(TrainOptions {
        quiet: true,
        ..Default::default()
    })?;
    net.precompute()?;
    Ok(net)
}

#[test]
fn mini_batch_noise_precision_averages_to_full_batch() -> anyhow::Result<()> {
    let mut full = precomputed_net(19)?;
    full.update_node(NodeKind::Tau, &UpdateStep::full())?;
    let tau_full = full.parameters(NodeKind::Tau)?;

    let mut net = precomputed_net(19)?;
    assert_eq!(net.dims().n, 100);
    let batches: Vec<Vec<usize>> = (0..4).map(|b| (b * 25..(b + 1) * 25).collect()).collect();

    let mut sum_a: Vec<ndarray::Array2<f64>> = vec![];
    let mut sum_b: Vec<ndarray::Array2<f64>> = vec![];
    for batch in batches.iter() {
        net.define_mini_batch(Some(batch.as_slice()));
        net.update_node(
            NodeKind::Tau,
            &UpdateStep {
                batch: Some(batch.as_slice()),
                rho: 1.0,
            },
        )?;
        for (m, tau_m) in net.parameters(NodeKind::Tau)?.iter().enumerate() {
            if sum_a.len() <= m {
                sum_a.push(tau_m["a"].clone());
                sum_b.push(tau_m["b"].clone());
            } else {
                sum_a[m] += &tau_m["a"];
                sum_b[m] += &tau_m["b"];
            }
        }
    }
    net.define_mini_batch(None);

    for (m, tau_m) in tau_full.iter().enumerate() {
        let avg_a = &sum_a[m] / 4.0;
        let avg_b = &sum_b[m] / 4.0;
        approx::assert_relative_eq!(avg_a, tau_m["a"], max_relative = 1e-10);
        approx::assert_relative_eq!(avg_b, tau_m["b"], max_relative = 1e-10);
    }
    Ok(())
}

#[test]
fn batch_of_all_samples_matches_full_update() -> anyhow::Result<()> {
    let kinds = [NodeKind::W, NodeKind::Z, NodeKind::Tau];

    let mut full = precomputed_net(23)?;
    for kind in kinds {
        full.update_node(kind, &UpdateStep::full())?;
    }

    let mut net = precomputed_net(23)?;
    let all: Vec<usize> = (0..net.dims().n).collect();
    net.define_mini_batch(Some(all.as_slice()));
    let step = UpdateStep {
        batch: Some(all.as_slice()),
        rho: 1.0,
    };
    for kind in kinds {
        net.update_node(kind, &step)?;
    }
    net.define_mini_batch(None);

    for kind in kinds {
        let expected = full.expectations(kind, false)?;
        let observed = net.expectations(kind, false)?;
        assert_eq!(expected.len(), observed.len());
        for (e, o) in expected.iter().zip(observed.iter()) {
            for (key, x) in e.iter() {
                approx::assert_relative_eq!(x, &o[key], max_relative = 1e-10, epsilon = 1e-12);
            }
        }
    }
    Ok(())
}

#[test]
fn sparsity_waits_for_start_sparsity() -> anyhow::Result<()> {
    let mut net = simulated_net(29, ComputeBackend::Ndarray)?;
    let theta0 = net.parameters(NodeKind::ThetaW)?;
    net.set_train_options(TrainOptions {
        maxiter: 10,
        start_sparsity: 100,
        ..full_batch_options()
    })?;
    net.iterate()?;

    let theta = net.parameters(NodeKind::ThetaW)?;
    for (t0, t) in theta0.iter().zip(theta.iter()) {
        assert_eq!(t0["a"], t["a"]);
        assert_eq!(t0["b"], t["b"]);
    }

    let mut net = simulated_net(29, ComputeBackend::Ndarray)?;
    net.set_train_options(TrainOptions {
        maxiter: 10,
        start_sparsity: 5,
        ..full_batch_options()
    })?;
    net.iterate()?;
    let theta = net.parameters(NodeKind::ThetaW)?;
    assert!(theta0.iter().zip(theta.iter()).any(|(t0, t)| t0["a"] != t["a"]));
    Ok(())
}
