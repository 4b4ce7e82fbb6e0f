use approx::assert_relative_eq;
use symad::{Error, Function, FunctionOptions, Sx, SxMatrix};

fn scenario_three() -> Function {
    let x = SxMatrix::sym("x", 2, 1);
    let (x0, x1) = (&x.data()[0], &x.data()[1]);
    let f = x0 * x0 * x1;
    Function::new("f", vec![x], vec![f.into()]).unwrap()
}

/// f = x0^2 + x0 * (x1^2 + ... + x_{n-1}^2), whose Hessian is an arrow.
fn arrow(n: usize, options: FunctionOptions) -> Function {
    let x = SxMatrix::sym("x", n, 1);
    let v = x.data();
    let mut tail = Sx::zero();
    for xi in &v[1..] {
        tail = tail + xi.sq();
    }
    let f = v[0].sq() + &v[0] * tail;
    Function::with_options(vec![x], vec![f.into()], options).unwrap()
}

fn arrow_hessian(x: &[f64]) -> Vec<Vec<f64>> {
    let n = x.len();
    let mut h = vec![vec![0.0; n]; n];
    h[0][0] = 2.0;
    for i in 1..n {
        h[0][i] = 2.0 * x[i];
        h[i][0] = 2.0 * x[i];
        h[i][i] = 2.0 * x[0];
    }
    h
}

fn point(n: usize) -> Vec<f64> {
    (0..n).map(|i| 0.5 + 0.25 * i as f64).collect()
}

#[test_log::test]
fn scenario_three_hessian() {
    let f = scenario_three();
    let mut hess = f.hessian(0, 0).unwrap();
    assert_eq!(hess.name(), "hess_f");
    assert_eq!(hess.n_out(), 3);

    let out = hess.call(&[&[1.0, 1.0]]).unwrap();
    assert_eq!(hess.output_matrix(0).unwrap().to_dense(), vec![vec![2.0, 2.0], vec![2.0, 0.0]]);
    assert_eq!(out[1], vec![2.0, 1.0]);
    assert_eq!(out[2], vec![1.0]);

    hess.set_input(0, &[3.0, -2.0]).unwrap();
    hess.evaluate().unwrap();
    // [[2y, 2x], [2x, 0]]
    assert_eq!(hess.output_matrix(0).unwrap().to_dense(), vec![vec![-4.0, 6.0], vec![6.0, 0.0]]);
}

#[test_log::test]
fn hessian_of_vector_output_is_rejected() {
    let x = SxMatrix::sym("x", 2, 1);
    let (x0, x1) = (&x.data()[0], &x.data()[1]);
    let f = SxMatrix::column(vec![x0 * x1, x1.sin()]);
    let fun = Function::new("f", vec![x], vec![f]).unwrap();
    assert_eq!(
        fun.hessian(0, 0).unwrap_err(),
        Error::NonScalarOutput {
            what: "hessians",
            index: 0,
            nrow: 2,
            ncol: 1,
        }
    );
    assert!(matches!(
        fun.gradient(0, 0),
        Err(Error::NonScalarOutput { what: "gradients", .. })
    ));
}

#[test_log::test]
fn star_coloring_compresses_the_arrow() {
    let n = 12;
    let f = arrow(n, FunctionOptions::default());
    let g = f.gradient(0, 0).unwrap();

    let sp = g.jac_sparsity(0, 0, true, true).unwrap();
    assert!(sp.is_symmetric());
    assert_eq!(sp.nnz(), 3 * n - 2);
    assert_eq!(g.partition(0, 0, true, true).unwrap().ncolors(), 2);
    // the dense first row defeats a unidirectional coloring
    assert_eq!(g.partition(0, 0, true, false).unwrap().ncolors(), n);

    let x = point(n);
    let mut hess = f.hessian(0, 0).unwrap();
    hess.set_input(0, &x).unwrap();
    hess.evaluate().unwrap();
    let h = hess.output_matrix(0).unwrap().to_dense();
    let expected = arrow_hessian(&x);
    for i in 0..n {
        for j in 0..n {
            assert_relative_eq!(h[i][j], expected[i][j], epsilon = 1e-13);
        }
    }
}

#[test_log::test]
fn symmetric_values_from_the_gradient() {
    let n = 7;
    let f = arrow(n, FunctionOptions::default());
    let mut g = f.gradient(0, 0).unwrap();
    let x = point(n);
    g.set_input(0, &x).unwrap();
    let h = g.sparse_jacobian_values(0, 0, true).unwrap().to_dense();
    assert_eq!(g.stats().fwd_sweeps, 2);
    let expected = arrow_hessian(&x);
    for i in 0..n {
        for j in 0..n {
            assert_relative_eq!(h[i][j], expected[i][j], epsilon = 1e-13);
        }
    }
}

#[test_log::test]
fn numeric_hessian_agrees() {
    let n = 5;
    let opts = FunctionOptions {
        numeric_hessian: true,
        ..FunctionOptions::default()
    };
    let mut hess = arrow(n, opts).hessian(0, 0).unwrap();
    let x = point(n);
    hess.set_input(0, &x).unwrap();
    hess.evaluate().unwrap();
    let h = hess.output_matrix(0).unwrap().to_dense();
    let expected = arrow_hessian(&x);
    for i in 0..n {
        for j in 0..n {
            assert_relative_eq!(h[i][j], expected[i][j], epsilon = 1e-6);
        }
    }

    // the gradient output is exact
    let g = hess.output(1).unwrap();
    assert_relative_eq!(g[0], 2.0 * x[0] + x[1..].iter().map(|v| v * v).sum::<f64>(), epsilon = 1e-12);
    for i in 1..n {
        assert_relative_eq!(g[i], 2.0 * x[0] * x[i], epsilon = 1e-12);
    }
}

#[test_log::test]
fn hessian_is_cached_like_other_derivatives() {
    let f = scenario_three();
    let a = f.hessian(0, 0).unwrap();
    let b = f.hessian(0, 0).unwrap();
    assert!(a.same_definition(&b));
    assert!(!a.same_definition(&f.gradient(0, 0).unwrap()));
}

/// f = sign(x0) * x1^2. The gradient has a structurally empty first entry,
/// so its bit pattern is not symmetric on its own.
fn signed_square(options: FunctionOptions) -> Function {
    let x = SxMatrix::sym("x", 2, 1);
    let (x0, x1) = (&x.data()[0], &x.data()[1]);
    let f = x0.sign() * x1.sq();
    Function::with_options(vec![x], vec![f.into()], options).unwrap()
}

#[test_log::test]
fn one_sided_gradient_patterns_are_symmetrized() {
    for hierarchical in [true, false] {
        let opts = FunctionOptions {
            hierarchical_sparsity: hierarchical,
            ..FunctionOptions::named("f")
        };
        let f = signed_square(opts);
        let g = f.gradient(0, 0).unwrap();
        let pattern = g.jac_sparsity(0, 0, true, true).unwrap();
        assert!(pattern.is_symmetric(), "hierarchical = {hierarchical}");
        assert!(pattern.contains(1, 1));

        let mut hess = f.hessian(0, 0).unwrap();
        hess.call(&[&[1.0, 3.0]]).unwrap();
        assert_eq!(
            hess.output_matrix(0).unwrap().to_dense(),
            vec![vec![0.0, 0.0], vec![0.0, 2.0]],
            "hierarchical = {hierarchical}"
        );
    }
}

#[test_log::test]
fn hessian_without_block_refinement() {
    let n = 9;
    let opts = FunctionOptions {
        hierarchical_sparsity: false,
        ..FunctionOptions::default()
    };
    let f = arrow(n, opts);
    let x = point(n);
    let expected = arrow_hessian(&x);

    let mut hess = f.hessian(0, 0).unwrap();
    hess.set_input(0, &x).unwrap();
    hess.evaluate().unwrap();
    let h = hess.output_matrix(0).unwrap().to_dense();

    let mut g = f.gradient(0, 0).unwrap();
    g.set_input(0, &x).unwrap();
    let hv = g.sparse_jacobian_values(0, 0, true).unwrap().to_dense();
    assert_eq!(g.stats().fwd_sweeps, 2);
    for i in 0..n {
        for j in 0..n {
            assert_relative_eq!(h[i][j], expected[i][j], epsilon = 1e-13);
            assert_relative_eq!(hv[i][j], expected[i][j], epsilon = 1e-13);
        }
    }
}
