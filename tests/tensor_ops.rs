use approx::assert_abs_diff_eq;
use briny_net::backend::Device;
use briny_net::error::Error;
use briny_net::ops::dispatch::Dispatcher;
use briny_net::tensor::Tensor;

fn t(shape: &[usize], data: &[f32]) -> Tensor {
    Tensor::from_vec(shape, data.to_vec(), Device::Cpu).unwrap()
}

#[test]
fn test_from_vec_rejects_wrong_length() {
    assert!(Tensor::from_vec(&[2, 2], vec![1.0, 2.0, 3.0], Device::Cpu).is_err());
}

#[test]
fn test_eqsize() {
    let a = Tensor::zeros(&[2, 3], Device::Cpu);
    let b = Tensor::zeros(&[2, 3], Device::Fpga(0));
    let c = Tensor::zeros(&[3, 2], Device::Cpu);
    assert!(Tensor::eqsize(&a, &b));
    assert!(!Tensor::eqsize(&a, &c));
}

#[test]
fn test_add_overwrites_and_accumulates() {
    let ops = Dispatcher::default();
    let a = t(&[3], &[1.0, 2.0, 3.0]);
    let b = t(&[3], &[1.0, 1.0, 1.0]);
    let c = t(&[3], &[5.0, 5.0, 5.0]);

    ops.add(2.0, &a, -1.0, &b, &c, false).unwrap();
    assert_eq!(c.to_vec(), vec![1.0, 3.0, 5.0]);

    ops.add(1.0, &a, 0.0, &b, &c, true).unwrap();
    assert_eq!(c.to_vec(), vec![2.0, 5.0, 8.0]);
}

#[test]
fn test_inc_is_a_true_accumulate() {
    let ops = Dispatcher::default();
    let a = t(&[2], &[1.0, 2.0]);
    let b = t(&[2], &[10.0, 20.0]);
    ops.inc(&a, &b).unwrap();
    ops.inc(&a, &b).unwrap();
    assert_eq!(b.to_vec(), vec![12.0, 24.0]);

    // across devices too
    let f = Tensor::zeros(&[2], Device::Fpga(0));
    ops.inc(&a, &f).unwrap();
    assert_eq!(f.to_vec(), vec![1.0, 2.0]);
}

#[test]
fn test_shape_and_device_mismatch() {
    let ops = Dispatcher::default();
    let a = Tensor::zeros(&[2, 2], Device::Cpu);
    let b = Tensor::zeros(&[4], Device::Cpu);
    let c = Tensor::zeros(&[2, 2], Device::Fpga(0));
    assert!(matches!(
        ops.add(1.0, &a, 1.0, &b, &a, false),
        Err(Error::ShapeMismatch { .. })
    ));
    assert!(matches!(ops.relu(&a, &c), Err(Error::DeviceMismatch { .. })));
}

#[test]
fn test_mult2d_plain() {
    let ops = Dispatcher::default();
    let a = t(&[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    let b = t(&[3, 2], &[7.0, 8.0, 9.0, 10.0, 11.0, 12.0]);
    let c = Tensor::zeros(&[2, 2], Device::Cpu);
    ops.mult2d(&a, false, &b, false, &c, false).unwrap();
    assert_eq!(c.to_vec(), vec![58.0, 64.0, 139.0, 154.0]);

    let bad = Tensor::zeros(&[3, 3], Device::Cpu);
    assert!(ops.mult2d(&a, false, &b, false, &bad, false).is_err());
}

#[test]
fn test_softmax_rows_sum_to_one() {
    let ops = Dispatcher::default();
    let a = t(&[2, 3], &[1.0, 2.0, 3.0, -1.0, 0.0, 4.0]);
    let c = Tensor::zeros(&[2, 3], Device::Cpu);
    ops.softmax(&a, &c).unwrap();
    let v = c.to_vec();
    assert_abs_diff_eq!(v[..3].iter().sum::<f32>(), 1.0, epsilon = 1e-6);
    assert_abs_diff_eq!(v[3..].iter().sum::<f32>(), 1.0, epsilon = 1e-6);
}

#[test]
fn test_softmax_is_shift_invariant() {
    let ops = Dispatcher::default();
    let a = t(&[1, 3], &[1.0, 2.0, 3.0]);
    let b = t(&[1, 3], &[1001.0, 1002.0, 1003.0]);
    let (ca, cb) = (Tensor::zeros(&[1, 3], Device::Cpu), Tensor::zeros(&[1, 3], Device::Cpu));
    ops.softmax(&a, &ca).unwrap();
    ops.softmax(&b, &cb).unwrap();
    for (x, y) in ca.to_vec().iter().zip(cb.to_vec()) {
        assert_abs_diff_eq!(*x, y, epsilon = 1e-6);
    }
}

#[test]
fn test_softmax_gradient_matches_finite_differences() {
    let ops = Dispatcher::default();
    let x = [0.5, -1.0, 2.0, 0.1, 1.5, 0.3, -0.7, 0.0];
    let w = [1.0, -2.0, 0.5, 3.0, -1.0, 0.25, 2.0, -0.5];
    let objective = |x: &[f32]| -> f32 {
        let y = Tensor::zeros(&[2, 4], Device::Cpu);
        ops.softmax(&t(&[2, 4], x), &y).unwrap();
        y.to_vec().iter().zip(&w).map(|(a, b)| a * b).sum()
    };

    let y = Tensor::zeros(&[2, 4], Device::Cpu);
    ops.softmax(&t(&[2, 4], &x), &y).unwrap();
    let pd = t(&[2, 4], &[1.0; 8]);
    ops.d_softmax(&t(&[2, 4], &w), &y, &pd).unwrap();

    let eps = 1e-2;
    for (i, got) in pd.to_vec().into_iter().enumerate() {
        let (mut hi, mut lo) = (x, x);
        hi[i] += eps;
        lo[i] -= eps;
        let want = (objective(&hi) - objective(&lo)) / (2.0 * eps);
        // d_softmax accumulates onto the 1.0 already in pd
        assert_abs_diff_eq!(got - 1.0, want, epsilon = 2e-3);
    }
}

#[test]
fn test_relu_and_gradient() {
    let ops = Dispatcher::default();
    let a = t(&[4], &[-1.0, 0.0, 2.0, -3.0]);
    let y = Tensor::zeros(&[4], Device::Cpu);
    ops.relu(&a, &y).unwrap();
    assert_eq!(y.to_vec(), vec![0.0, 0.0, 2.0, 0.0]);

    let d = t(&[4], &[1.0, 1.0, 1.0, 1.0]);
    let pd = t(&[4], &[0.5, 0.5, 0.5, 0.5]);
    ops.d_relu(&d, &a, &pd).unwrap();
    assert_eq!(pd.to_vec(), vec![0.5, 1.5, 1.5, 0.5]);
}

#[test]
fn test_cent_values() {
    let ops = Dispatcher::default();
    let target = t(&[1, 2], &[1.0, 0.0]);
    let pred = t(&[1, 2], &[0.5, 0.25]);
    let c = Tensor::zeros(&[1, 2], Device::Cpu);
    ops.cent(&target, &pred, &c).unwrap();
    let v = c.to_vec();
    assert_abs_diff_eq!(v[0], -(0.5f32.ln()), epsilon = 1e-6);
    assert_abs_diff_eq!(v[1], -(0.75f32.ln()), epsilon = 1e-6);
}

#[test]
fn test_reduce_and_select() {
    let ops = Dispatcher::default();
    let a = t(&[3, 2], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    let cols = Tensor::zeros(&[2], Device::Cpu);
    ops.reduce_sum2d(&a, &cols, 0, false).unwrap();
    assert_eq!(cols.to_vec(), vec![9.0, 12.0]);

    let rows = Tensor::zeros(&[2, 2], Device::Cpu);
    ops.select(&a, &rows, &[2, 0, 1], 0, 2).unwrap();
    assert_eq!(rows.to_vec(), vec![5.0, 6.0, 1.0, 2.0]);
    assert!(ops.select(&a, &rows, &[7, 0], 0, 2).is_err());
}

#[test]
fn test_fpga_operations_are_emulated() {
    let ops = Dispatcher::default();
    let a = Tensor::from_vec(&[3], vec![-1.0, 0.5, 2.0], Device::Fpga(0)).unwrap();
    let c = Tensor::zeros(&[3], Device::Fpga(0));
    ops.relu(&a, &c).unwrap();
    assert_eq!(c.to_vec(), vec![0.0, 0.5, 2.0]);
    assert_abs_diff_eq!(ops.total_sum(&c).unwrap(), 2.5);
}
