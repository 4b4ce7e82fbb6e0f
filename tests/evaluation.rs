use approx::assert_relative_eq;
use symad::{api, Function, FunctionOptions, Sx, SxMatrix};

/// f(x, y) = x*y + sin(x)
fn xy_plus_sin() -> Function {
    let x = Sx::sym("x");
    let y = Sx::sym("y");
    let f = &x * &y + x.sin();
    Function::new("f", vec![x.into(), y.into()], vec![f.into()]).unwrap()
}

/// Three inputs, three outputs, most elementary operations.
fn mixed(options: FunctionOptions) -> Function {
    let x = SxMatrix::sym("x", 3, 1);
    let v = x.data();
    let (x0, x1, x2) = (&v[0], &v[1], &v[2]);
    let f0 = x0.exp() * x1.sin() + x2.sqrt();
    let f1 = x0.atan2(x2) - x1.powf(3.0) + (x0 * x1).tanh();
    let f2 = (x0 / x2).ln() * x1.cos() + x2.sq() / (1.0 + x0.abs());
    let f = SxMatrix::column(vec![f0, f1, f2]);
    Function::with_options(vec![x], vec![f], options).unwrap()
}

#[test_log::test]
fn plain_evaluation() {
    let mut f = xy_plus_sin();
    f.set_input(0, &[2.0]).unwrap();
    f.set_input(1, &[3.0]).unwrap();
    let report = f.evaluate().unwrap();
    assert!(report.is_regular());
    assert_relative_eq!(f.output(0).unwrap()[0], 6.0 + 2f64.sin(), epsilon = 1e-12);
    assert_relative_eq!(f.output(0).unwrap()[0], 6.909297, epsilon = 1e-6);
}

#[test_log::test]
fn forward_direction() {
    let mut f = xy_plus_sin();
    f.set_input(0, &[2.0]).unwrap();
    f.set_input(1, &[3.0]).unwrap();
    f.set_fwd_seed(0, 0, &[1.0]).unwrap();
    f.set_fwd_seed(0, 1, &[0.0]).unwrap();
    f.evaluate_with(1, 0).unwrap();
    assert_relative_eq!(f.fwd_sens(0, 0).unwrap()[0], 3.0 + 2f64.cos(), epsilon = 1e-12);
    assert_relative_eq!(f.fwd_sens(0, 0).unwrap()[0], 2.583853, epsilon = 1e-6);
    // outputs are computed along with the sensitivities
    assert_relative_eq!(f.output(0).unwrap()[0], 6.0 + 2f64.sin(), epsilon = 1e-12);
}

#[test_log::test]
fn adjoint_direction() {
    let mut f = xy_plus_sin();
    f.set_input(0, &[2.0]).unwrap();
    f.set_input(1, &[3.0]).unwrap();
    f.set_adj_seed(0, 0, &[1.0]).unwrap();
    f.evaluate_with(0, 1).unwrap();
    assert_relative_eq!(f.adj_sens(0, 0).unwrap()[0], 3.0 + 2f64.cos(), epsilon = 1e-12);
    assert_relative_eq!(f.adj_sens(0, 1).unwrap()[0], 2.0, epsilon = 1e-12);
}

#[test_log::test]
fn forward_adjoint_and_finite_differences_agree() {
    let mut f = mixed(FunctionOptions::default());
    let x = [0.7, 1.3, 2.1];
    let v = [0.3, -0.5, 0.8];
    let w = [1.0, -2.0, 0.5];
    f.set_input(0, &x).unwrap();
    f.set_fwd_seed(0, 0, &v).unwrap();
    f.set_adj_seed(0, 0, &w).unwrap();
    f.evaluate_with(1, 1).unwrap();
    let jv = f.fwd_sens(0, 0).unwrap().to_vec();
    let jtw = f.adj_sens(0, 0).unwrap().to_vec();

    let fd = api::central_difference(&mut f, 0, 0, &v, 1e-6).unwrap();
    for (a, b) in jv.iter().zip(&fd) {
        assert_relative_eq!(a, b, epsilon = 1e-7, max_relative = 1e-6);
    }

    // w . (J v) == (J^T w) . v
    let lhs: f64 = w.iter().zip(&jv).map(|(a, b)| a * b).sum();
    let rhs: f64 = jtw.iter().zip(&v).map(|(a, b)| a * b).sum();
    assert_relative_eq!(lhs, rhs, epsilon = 1e-12, max_relative = 1e-12);

    // central_difference leaves the inputs as they were
    assert_eq!(f.input(0).unwrap(), &x);
}

#[test_log::test]
fn several_directions_in_one_call() {
    let opts = FunctionOptions {
        number_of_fwd_dir: 3,
        number_of_adj_dir: 3,
        ..FunctionOptions::default()
    };
    let mut batched = mixed(opts);
    let mut single = mixed(FunctionOptions::default());
    let x = [0.4, 0.9, 1.7];
    batched.set_input(0, &x).unwrap();
    single.set_input(0, &x).unwrap();

    let seeds = [[1.0, 0.0, 0.0], [0.0, 2.0, 0.0], [0.5, 0.5, 0.5]];
    for (d, s) in seeds.iter().enumerate() {
        batched.set_fwd_seed(d, 0, s).unwrap();
        batched.set_adj_seed(d, 0, s).unwrap();
    }
    batched.evaluate_with(3, 3).unwrap();

    for (d, s) in seeds.iter().enumerate() {
        single.set_fwd_seed(0, 0, s).unwrap();
        single.set_adj_seed(0, 0, s).unwrap();
        single.evaluate_with(1, 1).unwrap();
        for (a, b) in batched.fwd_sens(d, 0).unwrap().iter().zip(single.fwd_sens(0, 0).unwrap()) {
            assert_relative_eq!(a, b, epsilon = 1e-14);
        }
        for (a, b) in batched.adj_sens(d, 0).unwrap().iter().zip(single.adj_sens(0, 0).unwrap()) {
            assert_relative_eq!(a, b, epsilon = 1e-14);
        }
    }
}

#[test_log::test]
fn repeated_evaluation_reuses_the_tape() {
    let mut f = xy_plus_sin();
    for k in 0..5 {
        let x = k as f64 * 0.5;
        let out = f.call(&[&[x], &[1.5]]).unwrap();
        assert_relative_eq!(out[0][0], x * 1.5 + x.sin(), epsilon = 1e-12);
    }
    assert_eq!(f.stats().evaluations, 5);
    assert_eq!(f.stats().fwd_sweeps, 0);
}

#[test_log::test]
fn call_batch_matches_call() {
    let mut f = xy_plus_sin();
    let batch: Vec<Vec<Vec<f64>>> = (0..4).map(|k| vec![vec![k as f64], vec![2.0]]).collect();
    let out = f.call_batch(&batch).unwrap();
    for (k, o) in out.iter().enumerate() {
        let x = k as f64;
        assert_relative_eq!(o[0][0], 2.0 * x + x.sin(), epsilon = 1e-12);
    }
}

#[test_log::test]
fn direction_requests_are_capped() {
    let opts = FunctionOptions {
        max_number_of_fwd_dir: 4,
        max_number_of_adj_dir: 2,
        ..FunctionOptions::default()
    };
    let mut f = mixed(opts);
    f.set_input(0, &[0.7, 1.3, 2.1]).unwrap();
    assert_eq!(f.directions(), (1, 1));
    assert_eq!(f.request_directions(10, 1), (4, 1));
    assert_eq!(f.request_directions(0, 5), (4, 2));
    // never shrinks
    assert_eq!(f.request_directions(1, 1), (4, 2));
    assert!(f.evaluate_with(5, 0).is_err());
    assert!(f.fwd_sens(4, 0).is_err());
    assert!(f.evaluate_with(4, 2).is_ok());
}

#[test_log::test]
fn symbolic_replay_reproduces_the_expressions() {
    let f = xy_plus_sin();
    let a = Sx::sym("a");
    let out = f.eval_sx(&[a.clone().into(), Sx::constant(3.0).into()]).unwrap();
    let g = Function::new("g", vec![a.into()], out).unwrap();
    let mut g = g;
    let y = g.call(&[&[2.0]]).unwrap();
    assert_relative_eq!(y[0][0], 6.0 + 2f64.sin(), epsilon = 1e-12);
}

#[test_log::test]
fn structurally_zero_inputs_get_zero_adjoints() {
    let x = Sx::sym("x");
    let unused = Sx::sym("u");
    let f = x.sq();
    let mut fun = Function::new("f", vec![x.into(), unused.into()], vec![f.into()]).unwrap();
    fun.set_input(0, &[3.0]).unwrap();
    fun.set_input(1, &[7.0]).unwrap();
    fun.set_adj_seed(0, 0, &[1.0]).unwrap();
    fun.evaluate_with(0, 1).unwrap();
    assert_relative_eq!(fun.adj_sens(0, 0).unwrap()[0], 6.0);
    assert_eq!(fun.adj_sens(0, 1).unwrap()[0], 0.0);

    // a second seed must not pick up leftovers of the first
    fun.set_adj_seed(0, 0, &[2.0]).unwrap();
    fun.evaluate_with(0, 1).unwrap();
    assert_relative_eq!(fun.adj_sens(0, 0).unwrap()[0], 12.0);
}
