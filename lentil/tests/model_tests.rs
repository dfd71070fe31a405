use lentil::backend::ComputeBackend;
use lentil::dims::Dims;
use lentil::node::*;
use lentil::simulate::{generate_factor_data, generate_factor_data_files, SimArgs};
use lentil::{BayesNet, ModelBuilder};

use matrix_param::traits::Which;
use matrix_util::traits::IoOps;
use ndarray::Array2;

fn small_views() -> anyhow::Result<Vec<Array2<f64>>> {
    Ok(generate_factor_data(&SimArgs {
        rows: 12,
        features: vec![5, 3],
        factors: 2,
        ..Default::default()
    })?
    .views)
}

#[test]
fn missing_neighbour_is_a_construction_error() -> anyhow::Result<()> {
    let views = small_views()?;
    let features = vec![5, 3];
    let backend = ComputeBackend::Ndarray;

    // no noise precision: Y, Z and W all need Tau
    let nodes = vec![
        Node::Y(DataNode::new(&views, backend.clone())?),
        Node::Z(FactorNode::new(&Array2::zeros((12, 2)), (0., 1.), backend.clone())),
        Node::W(LoadingNode::new(
            12,
            &[Array2::zeros((5, 2)), Array2::zeros((3, 2))],
            1.,
            0.5,
            backend,
        )),
        Node::AlphaW(ArdNode::new(&features, 2, (1e-3, 1e-3), (1., 1.))),
        Node::ThetaW(SparsityNode::new(&features, 2, (1., 1.), (1., 1.))),
    ];

    let err = BayesNet::new(Dims::new(12, 2, 1, features), nodes, vec![0; 12])
        .err()
        .map(|e| e.to_string())
        .unwrap_or_default();
    assert!(err.contains("Tau"), "{}", err);
    Ok(())
}

#[test]
fn inconsistent_models_are_rejected() -> anyhow::Result<()> {
    let views = small_views()?;

    assert!(ModelBuilder::new(views.clone(), 0).build().is_err());
    assert!(ModelBuilder::new(vec![], 2).build().is_err());
    assert!(ModelBuilder::new(views.clone(), 2)
        .groups(vec![0; 11])
        .build()
        .is_err());
    assert!(ModelBuilder::new(views.clone(), 2)
        .init_factors(Array2::zeros((12, 3)))
        .build()
        .is_err());

    let mut short = views.clone();
    short[1] = Array2::zeros((10, 3));
    assert!(ModelBuilder::new(short, 2).build().is_err());

    let net = ModelBuilder::new(views, 2).build()?;
    assert_eq!(net.dims().total_features(), 8);
    assert_eq!(net.nodes().len(), NodeKind::COUNT);
    Ok(())
}

#[test]
fn sampling_follows_block_shapes() -> anyhow::Result<()> {
    let mut net = ModelBuilder::new(small_views()?, 2).build()?;

    for which in [Which::Prior, Which::Posterior] {
        let z = net.sample(NodeKind::Z, which)?;
        assert_eq!(z[0].dim(), (12, 2));

        let w = net.sample(NodeKind::W, which)?;
        assert_eq!(w[0].dim(), (5, 2));
        assert_eq!(w[1].dim(), (3, 2));

        let tau = net.sample(NodeKind::Tau, which)?;
        assert!(tau.iter().all(|t| t.iter().all(|&x| x > 0.)));

        let theta = net.sample(NodeKind::ThetaW, which)?;
        assert!(theta.iter().all(|t| t.iter().all(|&x| (0. ..=1.).contains(&x))));

        let y = net.sample(NodeKind::Y, which)?;
        assert_eq!(y[1].dim(), (12, 3));
    }
    Ok(())
}

#[test]
fn simulated_files_read_back() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let out = dir.path().join("sim");
    let out = out.to_str().unwrap_or_default();

    let args = SimArgs {
        rows: 15,
        features: vec![4, 6],
        factors: 2,
        missing: 0.1,
        ..Default::default()
    };
    let files = generate_factor_data_files(&args, out)?;
    assert_eq!(files.len(), 2);

    let sim = generate_factor_data(&args)?;
    for (file, y) in files.iter().zip(sim.views.iter()) {
        let y_read = Array2::<f64>::from_tsv(file, None)?;
        assert_eq!(y_read.dim(), y.dim());
        for (a, b) in y_read.iter().zip(y.iter()) {
            if b.is_nan() {
                assert!(a.is_nan());
            } else {
                approx::assert_relative_eq!(a, b, max_relative = 1e-6);
            }
        }
    }
    Ok(())
}
