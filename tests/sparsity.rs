use symad::{api, AdMode, Function, FunctionOptions, Partition, Sparsity, Sx, SxMatrix};

fn scenario_two() -> Function {
    let x = SxMatrix::sym("x", 2, 1);
    let (x0, x1) = (&x.data()[0], &x.data()[1]);
    let f = SxMatrix::column(vec![x0 * x1, x1 * x1]);
    Function::new("f", vec![x], vec![f]).unwrap()
}

/// `n` inputs, `n` outputs; output `i` mixes a handful of inputs picked
/// by a fixed stride pattern, so the Jacobian is sparse but irregular.
fn scattered(n: usize, options: FunctionOptions) -> (Function, Vec<Vec<usize>>) {
    let x = SxMatrix::sym("x", n, 1);
    let v = x.data();
    let mut deps = Vec::with_capacity(n);
    let mut outs = Vec::with_capacity(n);
    for i in 0..n {
        let mut cols = vec![i, (i * 7 + 3) % n, (i * 13 + 5) % n];
        cols.sort_unstable();
        cols.dedup();
        let mut e = Sx::zero();
        for &c in &cols {
            e = e + (&v[c] * (1.0 + c as f64)).sin();
        }
        outs.push(e);
        deps.push(cols);
    }
    let f = Function::with_options(vec![x], vec![SxMatrix::column(outs)], options).unwrap();
    (f, deps)
}

#[test_log::test]
fn scenario_two_pattern_and_values() {
    let mut f = scenario_two();
    let sp = f.jac_sparsity(0, 0, true, false).unwrap();
    assert_eq!(sp.shape(), (2, 2));
    // x1*x1 does not depend on x0
    assert_eq!(sp.nnz(), 3);
    assert!(sp.contains(0, 0) && sp.contains(0, 1) && sp.contains(1, 1));
    assert!(!sp.contains(1, 0));

    // the columns share row 0
    let partition = f.partition(0, 0, true, false).unwrap();
    assert!(partition.is_forward());
    assert_eq!(partition.ncolors(), 2);

    f.set_input(0, &[2.0, 3.0]).unwrap();
    let j = f.sparse_jacobian_values(0, 0, false).unwrap();
    assert_eq!(j.to_dense(), vec![vec![3.0, 2.0], vec![0.0, 6.0]]);
}

#[test_log::test]
fn detected_pattern_matches_construction() {
    for hierarchical in [false, true] {
        let opts = FunctionOptions {
            hierarchical_sparsity: hierarchical,
            ..FunctionOptions::default()
        };
        let (f, deps) = scattered(150, opts);
        let sp = f.jac_sparsity(0, 0, true, false).unwrap();
        for (i, cols) in deps.iter().enumerate() {
            assert_eq!(sp.row(i), cols.as_slice(), "row {i}, hierarchical {hierarchical}");
        }
    }
}

#[test_log::test]
fn pattern_covers_every_finite_difference_nonzero() {
    let (mut f, _) = scattered(40, FunctionOptions::default());
    let sp = f.jac_sparsity(0, 0, true, false).unwrap();
    let x: Vec<f64> = (0..40).map(|i| 0.1 + 0.03 * i as f64).collect();
    f.set_input(0, &x).unwrap();
    for c in 0..40 {
        let mut dir = vec![0.0; 40];
        dir[c] = 1.0;
        let col = api::central_difference(&mut f, 0, 0, &dir, 1e-6).unwrap();
        for (r, v) in col.iter().enumerate() {
            if v.abs() > 1e-8 {
                assert!(sp.contains(r, c), "({r}, {c}) = {v} missing from the pattern");
            }
        }
    }
}

#[test_log::test]
fn sweep_direction_does_not_change_the_pattern() {
    let patterns: Vec<Sparsity> = [AdMode::Forward, AdMode::Reverse, AdMode::Automatic]
        .into_iter()
        .flat_map(|ad_mode| {
            [false, true].into_iter().map(move |hierarchical| {
                let opts = FunctionOptions {
                    ad_mode,
                    hierarchical_sparsity: hierarchical,
                    ..FunctionOptions::default()
                };
                scattered(90, opts).0.jac_sparsity(0, 0, true, false).unwrap()
            })
        })
        .collect();
    for p in &patterns[1..] {
        assert_eq!(p, &patterns[0]);
    }
}

#[test_log::test]
fn non_compact_pattern_uses_element_indices() {
    let x = SxMatrix::sym_with("x", Sparsity::diagonal(3));
    let v = x.data();
    let f = SxMatrix::column(vec![&v[0] + &v[1], v[2].sq()]);
    let fun = Function::new("f", vec![x.clone()], vec![f]).unwrap();

    let compact = fun.jac_sparsity(0, 0, true, false).unwrap();
    assert_eq!(compact.shape(), (2, 3));
    assert_eq!(compact.triplets(), vec![(0, 0), (0, 1), (1, 2)]);

    // diagonal nonzeros of a 3x3 sit at elements 0, 4 and 8
    let full = fun.jac_sparsity(0, 0, false, false).unwrap();
    assert_eq!(full.shape(), (2, 9));
    assert_eq!(full.triplets(), vec![(0, 0), (0, 4), (1, 8)]);
}

#[test_log::test]
fn symmetric_request_needs_a_square_block() {
    let (f, _) = scattered(5, FunctionOptions::default());
    assert!(f.jac_sparsity(0, 0, true, true).is_ok());

    let x = SxMatrix::sym("x", 3, 1);
    let g = SxMatrix::column(vec![&x.data()[0] + &x.data()[1]]);
    let g = Function::new("g", vec![x], vec![g]).unwrap();
    assert!(matches!(
        g.jac_sparsity(0, 0, true, true),
        Err(symad::Error::InvalidSparsity(_))
    ));
}

#[test_log::test]
fn independent_blocks_are_empty() {
    let x = Sx::sym("x");
    let y = Sx::sym("y");
    let f = Function::new("f", vec![x.clone().into(), y.into()], vec![x.sq().into()]).unwrap();
    let sp = f.jac_sparsity(1, 0, true, false).unwrap();
    assert_eq!(sp.shape(), (1, 1));
    assert_eq!(sp.nnz(), 0);
}

#[test_log::test]
fn patterns_and_partitions_are_cached_per_definition() {
    let (f, _) = scattered(30, FunctionOptions::default());
    let g = f.clone();
    let a = f.partition(0, 0, true, false).unwrap();
    let b = g.partition(0, 0, true, false).unwrap();
    assert_eq!(a, b);
    // every column sits in at most three rows of at most three columns
    match a {
        Partition::Forward(seeds) | Partition::Adjoint(seeds) => assert!(seeds.nrow() <= 7),
    }
}
