use approx::assert_relative_eq;
use symad::{AdMode, Function, FunctionOptions, Sx, SxMatrix};

/// f_i = x_{i-1} * x_i + sin(x_{i+1}), missing neighbours dropped.
fn tridiagonal(n: usize, options: FunctionOptions) -> Function {
    let x = SxMatrix::sym("x", n, 1);
    let v = x.data();
    let outs = (0..n)
        .map(|i| {
            let mut e = v[i].sq();
            if i > 0 {
                e = &v[i - 1] * &v[i];
            }
            if i + 1 < n {
                e = e + v[i + 1].sin();
            }
            e
        })
        .collect();
    Function::with_options(vec![x], vec![SxMatrix::column(outs)], options).unwrap()
}

fn tridiagonal_jacobian(x: &[f64]) -> Vec<Vec<f64>> {
    let n = x.len();
    let mut j = vec![vec![0.0; n]; n];
    for i in 0..n {
        if i > 0 {
            j[i][i - 1] = x[i];
            j[i][i] = x[i - 1];
        } else {
            j[i][i] = 2.0 * x[i];
        }
        if i + 1 < n {
            j[i][i + 1] = x[i + 1].cos();
        }
    }
    j
}

/// Two outputs of thirty inputs, both dense.
fn wide(options: FunctionOptions) -> Function {
    let x = SxMatrix::sym("x", 30, 1);
    let mut sum = Sx::zero();
    let mut weighted = Sx::zero();
    for (i, xi) in x.data().iter().enumerate() {
        sum = sum + xi.sin();
        weighted = weighted + xi.sq() * (i as f64 + 1.0);
    }
    let f = SxMatrix::column(vec![sum, weighted]);
    Function::with_options(vec![x], vec![f], options).unwrap()
}

fn assert_dense_eq(a: &[Vec<f64>], b: &[Vec<f64>], tol: f64) {
    assert_eq!(a.len(), b.len());
    for (ra, rb) in a.iter().zip(b) {
        assert_eq!(ra.len(), rb.len());
        for (x, y) in ra.iter().zip(rb) {
            assert_relative_eq!(x, y, epsilon = tol, max_relative = tol);
        }
    }
}

fn point(n: usize) -> Vec<f64> {
    (0..n).map(|i| 0.3 + 0.1 * i as f64).collect()
}

#[test_log::test]
fn tridiagonal_values_with_three_sweeps() {
    let mut f = tridiagonal(20, FunctionOptions::default());
    let partition = f.partition(0, 0, true, false).unwrap();
    assert!(partition.is_forward());
    assert_eq!(partition.ncolors(), 3);

    let x = point(20);
    f.set_input(0, &x).unwrap();
    let j = f.sparse_jacobian_values(0, 0, false).unwrap();
    assert_eq!(j.nnz(), 20 + 2 * 19);
    assert_dense_eq(&j.to_dense(), &tridiagonal_jacobian(&x), 1e-14);

    // one direction allocated: one evaluation per color
    assert_eq!(f.stats().fwd_sweeps, 3);
    assert_eq!(f.stats().evaluations, 3);

    f.reset_stats();
    let again = f.sparse_jacobian_values(0, 0, false).unwrap().into_data();
    assert_eq!(again, j.data());
    assert_eq!(f.stats().fwd_sweeps, 3);
}

#[test_log::test]
fn colors_are_batched_into_allocated_directions() {
    let opts = FunctionOptions {
        number_of_fwd_dir: 64,
        ..FunctionOptions::default()
    };
    let mut f = tridiagonal(20, opts);
    f.set_input(0, &point(20)).unwrap();
    f.sparse_jacobian_values(0, 0, false).unwrap();
    assert_eq!(f.stats().fwd_sweeps, 3);
    assert_eq!(f.stats().evaluations, 1);
}

#[test_log::test]
fn jacobian_function_outputs_jacobian_then_outputs() {
    let f = tridiagonal(8, FunctionOptions::default());
    let mut jac = f.jacobian(0, 0).unwrap();
    assert_eq!(jac.name(), "jac_unnamed_function");
    assert_eq!(jac.n_out(), 2);
    assert_eq!(jac.sparsity_out(0).unwrap().shape(), (8, 8));

    let x = point(8);
    jac.set_input(0, &x).unwrap();
    jac.evaluate().unwrap();
    assert_dense_eq(&jac.output_matrix(0).unwrap().to_dense(), &tridiagonal_jacobian(&x), 1e-14);

    let mut f = f;
    let y = f.call(&[&x]).unwrap();
    for (a, b) in jac.output(1).unwrap().iter().zip(&y[0]) {
        assert_relative_eq!(a, b, epsilon = 1e-14);
    }
}

#[test_log::test]
fn derived_functions_are_shared_while_alive() {
    let f = tridiagonal(6, FunctionOptions::default());
    let a = f.jacobian(0, 0).unwrap();
    let b = f.jacobian(0, 0).unwrap();
    assert!(a.same_definition(&b));

    let compact = f.jacobian_with(0, 0, true, false).unwrap();
    assert!(!a.same_definition(&compact));

    // another instance of the parent sees the same cache
    let g = f.clone();
    assert!(g.jacobian(0, 0).unwrap().same_definition(&a));

    drop((a, b));
    let mut c = f.jacobian(0, 0).unwrap();
    c.set_input(0, &point(6)).unwrap();
    c.evaluate().unwrap();
    assert_dense_eq(&c.output_matrix(0).unwrap().to_dense(), &tridiagonal_jacobian(&point(6)), 1e-14);
}

#[test_log::test]
fn wide_block_prefers_adjoint_sweeps() {
    let mut f = wide(FunctionOptions::default());
    let partition = f.partition(0, 0, true, false).unwrap();
    assert!(!partition.is_forward());
    assert_eq!(partition.ncolors(), 2);

    let x = point(30);
    f.set_input(0, &x).unwrap();
    let j = f.sparse_jacobian_values(0, 0, false).unwrap().to_dense();
    assert_eq!(f.stats().adj_sweeps, 2);
    assert_eq!(f.stats().fwd_sweeps, 0);
    for (i, xi) in x.iter().enumerate() {
        assert_relative_eq!(j[0][i], xi.cos(), epsilon = 1e-14);
        assert_relative_eq!(j[1][i], 2.0 * xi * (i as f64 + 1.0), epsilon = 1e-12);
    }
}

#[test_log::test]
fn forced_forward_mode_is_respected() {
    let opts = FunctionOptions {
        ad_mode: AdMode::Forward,
        ..FunctionOptions::default()
    };
    let mut f = wide(opts);
    let partition = f.partition(0, 0, true, false).unwrap();
    assert!(partition.is_forward());
    assert_eq!(partition.ncolors(), 30);

    f.set_input(0, &point(30)).unwrap();
    let forward = f.sparse_jacobian_values(0, 0, false).unwrap().to_dense();
    let adjoint = {
        let mut g = wide(FunctionOptions::default());
        g.set_input(0, &point(30)).unwrap();
        g.sparse_jacobian_values(0, 0, false).unwrap().to_dense()
    };
    assert_dense_eq(&forward, &adjoint, 1e-13);
}

#[test_log::test]
fn numeric_jacobian_matches_symbolic() {
    let x = point(10);
    let mut symbolic = tridiagonal(10, FunctionOptions::default()).jacobian(0, 0).unwrap();
    let numeric_opts = FunctionOptions {
        numeric_jacobian: true,
        ..FunctionOptions::default()
    };
    let mut numeric = tridiagonal(10, numeric_opts).jacobian(0, 0).unwrap();
    // brute force: every entry is structurally present
    assert!(numeric.sparsity_out(0).unwrap().is_dense());

    symbolic.set_input(0, &x).unwrap();
    numeric.set_input(0, &x).unwrap();
    symbolic.evaluate().unwrap();
    numeric.evaluate().unwrap();
    assert_dense_eq(
        &symbolic.output_matrix(0).unwrap().to_dense(),
        &numeric.output_matrix(0).unwrap().to_dense(),
        1e-14,
    );
    for (a, b) in symbolic.output(1).unwrap().iter().zip(numeric.output(1).unwrap()) {
        assert_relative_eq!(a, b, epsilon = 1e-14);
    }
}

#[test_log::test]
fn derivative_function_layout() {
    let x = Sx::sym("x");
    let y = Sx::sym("y");
    let f = Function::new("f", vec![x.clone().into(), y.clone().into()], vec![(&x * &y + x.sin()).into()]).unwrap();
    let mut d = f.derivative(1, 1).unwrap();
    assert_eq!(d.name(), "fwd1_adj1_f");
    // inputs: x, y, fwd seeds (x, y), adj seed (f)
    assert_eq!(d.n_in(), 5);
    // outputs: f, fwd sens (f), adj sens (x, y)
    assert_eq!(d.n_out(), 4);

    let out = d.call(&[&[2.0], &[3.0], &[1.0], &[0.0], &[1.0]]).unwrap();
    assert_relative_eq!(out[0][0], 6.0 + 2f64.sin(), epsilon = 1e-12);
    assert_relative_eq!(out[1][0], 3.0 + 2f64.cos(), epsilon = 1e-12);
    assert_relative_eq!(out[2][0], 3.0 + 2f64.cos(), epsilon = 1e-12);
    assert_relative_eq!(out[3][0], 2.0, epsilon = 1e-12);
}

#[test_log::test]
fn gradient_lives_on_the_input_sparsity() {
    let x = SxMatrix::sym("x", 2, 2);
    let v = x.data();
    let f = &v[0] * &v[3] - &v[1] * &v[2];
    let fun = Function::new("det", vec![x], vec![f.into()]).unwrap();
    let mut g = fun.gradient(0, 0).unwrap();
    assert_eq!(g.sparsity_out(0).unwrap().shape(), (2, 2));
    let out = g.call(&[&[1.0, 2.0, 3.0, 4.0]]).unwrap();
    assert_eq!(out[0], vec![4.0, -3.0, -2.0, 1.0]);
    assert_eq!(out[1], vec![-2.0]);
}
