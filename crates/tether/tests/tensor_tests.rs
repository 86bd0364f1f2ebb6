// Integration tests for tether-core: tensor ops and autograd
//
// Gradients are checked against hand-derived values on small inputs.

use tether::prelude::*;
use tether::{is_grad_enabled, Op};

fn approx_eq(a: f64, b: f64, tol: f64) -> bool {
    (a - b).abs() < tol
}

fn assert_vec_approx(got: &[f64], expected: &[f64], tol: f64) {
    assert_eq!(
        got.len(),
        expected.len(),
        "length mismatch: {} vs {}",
        got.len(),
        expected.len()
    );
    for (i, (g, e)) in got.iter().zip(expected.iter()).enumerate() {
        assert!(
            approx_eq(*g, *e, tol),
            "index {}: got {} expected {} (tol {})",
            i,
            g,
            e,
            tol
        );
    }
}

fn grad_of(grads: &GradStore, t: &Tensor) -> Vec<f64> {
    grads.get(t).unwrap().to_f64_vec().unwrap()
}

#[test]
fn test_broadcast_add_gradients() -> tether::Result<()> {
    let a = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], (2, 3))?.set_variable();
    let b = Tensor::from_vec(vec![10.0, 20.0, 30.0], (1, 3))?.set_variable();
    let c = a.add(&b)?;
    assert_eq!(c.dims(), &[2, 3]);
    assert_vec_approx(&c.to_f64_vec()?, &[11.0, 22.0, 33.0, 14.0, 25.0, 36.0], 1e-12);

    let grads = c.sum_all()?.backward()?;
    assert_vec_approx(&grad_of(&grads, &a), &[1.0; 6], 1e-12);
    // b was broadcast over two rows
    assert_vec_approx(&grad_of(&grads, &b), &[2.0, 2.0, 2.0], 1e-12);
    Ok(())
}

#[test]
fn test_scalar_broadcast_mul() -> tether::Result<()> {
    let w = Tensor::scalar(3.0).set_variable();
    let x = Tensor::from_vec(vec![1.0, 2.0, 3.0], 3)?;
    let y = x.mul(&w)?.sum_all()?;
    assert!(approx_eq(y.to_scalar_f64()?, 18.0, 1e-12));
    let grads = y.backward()?;
    assert_vec_approx(&grad_of(&grads, &w), &[6.0], 1e-12);
    Ok(())
}

#[test]
fn test_matmul_gradients() -> tether::Result<()> {
    let a = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], (2, 2))?.set_variable();
    let b = Tensor::from_vec(vec![5.0, 6.0, 7.0, 8.0], (2, 2))?.set_variable();
    let c = a.matmul(&b)?;
    assert_vec_approx(&c.to_f64_vec()?, &[19.0, 22.0, 43.0, 50.0], 1e-12);

    let grads = c.sum_all()?.backward()?;
    // dA = 1 @ Bᵀ: row sums of B; dB = Aᵀ @ 1: column sums of A
    assert_vec_approx(&grad_of(&grads, &a), &[11.0, 15.0, 11.0, 15.0], 1e-12);
    assert_vec_approx(&grad_of(&grads, &b), &[4.0, 4.0, 6.0, 6.0], 1e-12);
    Ok(())
}

#[test]
fn test_matmul_shape_mismatch() -> tether::Result<()> {
    let a = Tensor::zeros((2, 3))?;
    let b = Tensor::zeros((2, 3))?;
    assert!(matches!(a.matmul(&b), Err(Error::MatmulShapeMismatch { .. })));
    Ok(())
}

#[test]
fn test_narrow_and_cat_gradients() -> tether::Result<()> {
    let x = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], 4)?.set_variable();
    let head = x.narrow(0, 0, 2)?;
    let tail = x.narrow(0, 2, 2)?;
    let joined = Tensor::cat(&[tail.mul_scalar(3.0)?, head], 0)?;
    assert_vec_approx(&joined.to_f64_vec()?, &[9.0, 12.0, 1.0, 2.0], 1e-12);

    let grads = joined.sum_all()?.backward()?;
    assert_vec_approx(&grad_of(&grads, &x), &[1.0, 1.0, 3.0, 3.0], 1e-12);
    Ok(())
}

#[test]
fn test_unary_chain_gradient() -> tether::Result<()> {
    // d/dx relu(x)^2 = 2x for x > 0, 0 otherwise
    let x = Tensor::from_vec(vec![-1.0, 0.5, 2.0], 3)?.set_variable();
    let y = x.relu()?.square()?.sum_all()?;
    assert!(approx_eq(y.to_scalar_f64()?, 4.25, 1e-12));
    let grads = y.backward()?;
    assert_vec_approx(&grad_of(&grads, &x), &[0.0, 1.0, 4.0], 1e-12);
    Ok(())
}

#[test]
fn test_mean_dim_gradient() -> tether::Result<()> {
    let x = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], (2, 3))?.set_variable();
    let m = x.mean(1, false)?;
    assert_eq!(m.dims(), &[2]);
    assert_vec_approx(&m.to_f64_vec()?, &[2.0, 5.0], 1e-12);
    let grads = m.sum_all()?.backward()?;
    assert_vec_approx(&grad_of(&grads, &x), &[1.0 / 3.0; 6], 1e-12);
    Ok(())
}

#[test]
fn test_stack_and_select() -> tether::Result<()> {
    let a = Tensor::from_vec(vec![1.0, 2.0], 2)?;
    let b = Tensor::from_vec(vec![3.0, 4.0], 2)?;
    let s = Tensor::stack(&[a, b], 1)?;
    assert_eq!(s.dims(), &[2, 2]);
    assert_vec_approx(&s.to_f64_vec()?, &[1.0, 3.0, 2.0, 4.0], 1e-12);
    assert_vec_approx(&s.select(1, 1)?.to_f64_vec()?, &[3.0, 4.0], 1e-12);
    Ok(())
}

#[test]
fn test_no_grad_records_nothing() -> tether::Result<()> {
    let x = Tensor::from_vec(vec![1.0, 2.0], 2)?.set_variable();
    assert!(is_grad_enabled());
    let y = no_grad(|| {
        assert!(!is_grad_enabled());
        x.mul_scalar(2.0)?.exp()
    })?;
    assert!(is_grad_enabled());
    assert!(matches!(y.op(), Op::None));

    let z = x.mul_scalar(2.0)?;
    assert!(!matches!(z.op(), Op::None));
    Ok(())
}

#[test]
fn test_backward_requires_scalar() -> tether::Result<()> {
    let x = Tensor::from_vec(vec![1.0, 2.0], 2)?.set_variable();
    assert!(x.mul_scalar(2.0)?.backward().is_err());
    Ok(())
}

#[test]
fn test_update_inplace_visible_through_clones() -> tether::Result<()> {
    let p = Tensor::zeros(3)?.set_variable();
    let alias = p.clone();
    p.update_data_inplace(&[1.0, 2.0, 3.0])?;
    assert_vec_approx(&alias.to_f64_vec()?, &[1.0, 2.0, 3.0], 1e-12);
    assert!(p.update_data_inplace(&[1.0]).is_err());
    Ok(())
}

#[test]
fn test_data_dict_require_names_context() -> tether::Result<()> {
    let mut d = DataDict::new();
    d.insert("x", Tensor::scalar(1.0));
    assert!(d.require("x", "test").is_ok());
    match d.require("y", "node 'f'") {
        Err(Error::MissingKey { key, context }) => {
            assert_eq!(key, "y");
            assert_eq!(context, "node 'f'");
        }
        other => panic!("expected MissingKey, got {other:?}"),
    }
    Ok(())
}
