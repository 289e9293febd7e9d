use approx::assert_abs_diff_eq;
use briny_net::backend::Device;
use briny_net::descriptors::{ConvDescriptor, Padding, PoolDescriptor};
use briny_net::error::Error;
use briny_net::graph::Graph;
use briny_net::ops::dispatch::Dispatcher;
use briny_net::tensor::Tensor;

fn t(shape: &[usize], data: &[f32]) -> Tensor {
    Tensor::from_vec(shape, data.to_vec(), Device::Cpu).unwrap()
}

/// Deterministic values in `[-0.6, 0.6] * scale`.
fn pattern(n: usize, scale: f32) -> Vec<f32> {
    (0..n).map(|i| ((i * 7 % 13) as f32 - 6.0) * 0.1 * scale).collect()
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Central differences of `f` around `x`.
fn numeric_grad(x: &[f32], eps: f32, f: impl Fn(&[f32]) -> f32) -> Vec<f32> {
    (0..x.len())
        .map(|i| {
            let mut hi = x.to_vec();
            let mut lo = x.to_vec();
            hi[i] += eps;
            lo[i] -= eps;
            (f(&hi) - f(&lo)) / (2.0 * eps)
        })
        .collect()
}

fn assert_all_close(got: &[f32], want: &[f32], tol: f32) {
    assert_eq!(got.len(), want.len());
    for (g, w) in got.iter().zip(want) {
        assert_abs_diff_eq!(*g, *w, epsilon = tol);
    }
}

#[test]
fn test_pool_valid_output_shape() {
    let mut pd = PoolDescriptor::new(&[3, 3], &[2, 2], "valid").unwrap();
    pd.build(&[1, 1, 5, 5], Device::Cpu).unwrap();
    assert_eq!(pd.output_shape(), Some(vec![1, 1, 2, 2]));
    assert_eq!(pd.padding(), Padding::Valid);
}

#[test]
fn test_none_means_valid() {
    let pd = PoolDescriptor::new(&[2, 2], &[2, 2], "none").unwrap();
    assert_eq!(pd.padding(), Padding::Valid);
}

#[test]
fn test_pool_same_keeps_size_at_stride_one() {
    let mut pd = PoolDescriptor::new(&[3, 3], &[1, 1], "same").unwrap();
    pd.build(&[2, 3, 5, 5], Device::Cpu).unwrap();
    assert_eq!(pd.output_shape(), Some(vec![2, 3, 5, 5]));
    let w = pd.window().unwrap();
    assert_eq!((w.pad_top, w.pad_bottom, w.pad_left, w.pad_right), (1, 1, 1, 1));
}

#[test]
fn test_invalid_padding_mode() {
    assert!(matches!(
        PoolDescriptor::new(&[2, 2], &[2, 2], "reflect"),
        Err(Error::InvalidPadding { .. })
    ));
}

#[test]
fn test_pool_rejects_non_4d_input() {
    let mut pd = PoolDescriptor::new(&[2, 2], &[2, 2], "valid").unwrap();
    assert!(matches!(
        pd.build(&[1, 5, 5], Device::Cpu),
        Err(Error::RankMismatch { expected: 4, got: 3, .. })
    ));
}

#[test]
fn test_kernel_larger_than_input() {
    let mut pd = PoolDescriptor::new(&[7, 7], &[1, 1], "valid").unwrap();
    assert!(matches!(
        pd.build(&[1, 1, 5, 5], Device::Cpu),
        Err(Error::InvalidGeometry { .. })
    ));
}

#[test]
fn test_kernel_needs_two_entries() {
    assert!(PoolDescriptor::new(&[2], &[2, 2], "valid").is_err());
    assert!(ConvDescriptor::new(4, &[3, 3], &[1, 1, 1], "same").is_err());
}

#[test]
fn test_resize_moves_batch_only() {
    let mut cd = ConvDescriptor::new(4, &[3, 3], &[1, 1], "same").unwrap();
    cd.build(&[1, 2, 6, 6], Device::Cpu).unwrap();
    cd.resize(8).unwrap();
    assert_eq!(cd.output_shape(), Some(vec![8, 4, 6, 6]));
}

#[test]
fn test_unbuilt_descriptor() {
    let mut pd = PoolDescriptor::new(&[2, 2], &[2, 2], "valid").unwrap();
    assert!(pd.output().is_none());
    assert!(matches!(pd.resize(4), Err(Error::NotBuilt { .. })));
}

#[test]
fn test_maxpool_layer_forward() {
    let mut g = Graph::with_seed(0);
    let x = g.input("x", &[1, 4, 4]).unwrap();
    let p = g.maxpool2d("pool", x, &[2, 2], &[2, 2], "valid").unwrap();

    let ops = Dispatcher::default();
    let input = g.layer(x).unwrap().output();
    let data: Vec<f32> = (0..16).map(|v| v as f32).collect();
    ops.copy(&Tensor::from_vec(&[1, 1, 4, 4], data, Device::Cpu).unwrap(), input)
        .unwrap();

    let pool = g.layer(p).unwrap();
    pool.forward(&ops).unwrap();
    assert_eq!(pool.output().to_vec(), vec![5.0, 7.0, 13.0, 15.0]);
}

#[test]
fn test_conv_layer_shapes() {
    let mut g = Graph::with_seed(0);
    let x = g.input("x", &[3, 8, 8]).unwrap();
    let c = g.conv2d("conv", x, 5, &[3, 3], &[2, 2], "same").unwrap();
    let conv = g.layer(c).unwrap();
    assert_eq!(conv.output().shape(), vec![1, 5, 4, 4]);
    assert_eq!(conv.params()[0].shape(), vec![5, 3, 3, 3]);
    assert_eq!(conv.params()[1].shape(), vec![5]);

    let ops = Dispatcher::default();
    conv.forward(&ops).unwrap();
}

#[test]
fn test_explicit_pool_padding() {
    let mut pd = PoolDescriptor::with_padding(&[2, 2], &[2, 2], &[1, 0, 1, 0]).unwrap();
    pd.build(&[1, 1, 4, 4], Device::Cpu).unwrap();
    // (4 + 1 + 0 - 2) / 2 + 1
    assert_eq!(pd.output_shape(), Some(vec![1, 1, 2, 2]));
    assert_eq!(pd.padding(), Padding::Explicit([1, 0, 1, 0]));

    let ops = Dispatcher::default();
    let x = t(&[1, 1, 4, 4], &(0..16).map(|v| v as f32).collect::<Vec<_>>());
    ops.mpool2d(&pd, &x).unwrap();
    assert_eq!(pd.output().unwrap().to_vec(), vec![0.0, 2.0, 8.0, 10.0]);
}

#[test]
fn test_explicit_padding_geometry_errors() {
    assert!(matches!(
        PoolDescriptor::with_padding(&[2, 2], &[1, 1], &[1, 1]),
        Err(Error::RankMismatch { expected: 4, got: 2, .. })
    ));
    let mut pd = PoolDescriptor::with_padding(&[5, 5], &[1, 1], &[0, 0, 0, 0]).unwrap();
    assert!(matches!(
        pd.build(&[1, 1, 4, 4], Device::Cpu),
        Err(Error::InvalidGeometry { .. })
    ));
}

#[test]
fn test_padded_pool_layer() {
    let mut g = Graph::with_seed(0);
    let x = g.input("x", &[1, 4, 4]).unwrap();
    let p = g.maxpool2d_padded("pool", x, &[2, 2], &[2, 2], &[1, 0, 1, 0]).unwrap();
    assert_eq!(g.layer(p).unwrap().output().shape(), vec![1, 1, 2, 2]);
}

#[test]
fn test_window_ops_reject_batch_mismatch() {
    let ops = Dispatcher::default();

    let mut pd = PoolDescriptor::new(&[2, 2], &[2, 2], "valid").unwrap();
    pd.build(&[2, 1, 4, 4], Device::Cpu).unwrap();
    let small = Tensor::zeros(&[1, 1, 4, 4], Device::Cpu);
    assert!(matches!(ops.mpool2d(&pd, &small), Err(Error::ShapeMismatch { .. })));
    let out = pd.output().unwrap();
    assert!(matches!(
        ops.mpool2d_back(&pd, out, &small),
        Err(Error::ShapeMismatch { .. })
    ));

    let mut cd = ConvDescriptor::new(2, &[3, 3], &[1, 1], "same").unwrap();
    cd.build(&[1, 1, 4, 4], Device::Cpu).unwrap();
    let kernel = Tensor::zeros(&[2, 1, 3, 3], Device::Cpu);
    let wide = Tensor::zeros(&[2, 1, 4, 4], Device::Cpu);
    let delta = Tensor::zeros(&[1, 2, 4, 4], Device::Cpu);
    assert!(matches!(
        ops.conv2d(&cd, &wide, &kernel, None),
        Err(Error::ShapeMismatch { .. })
    ));
    assert!(matches!(
        ops.conv2d_grad(&cd, &wide, &delta, &kernel),
        Err(Error::ShapeMismatch { .. })
    ));
    assert!(matches!(
        ops.conv2d_back(&cd, &delta, &kernel, &wide),
        Err(Error::ShapeMismatch { .. })
    ));
}

#[test]
fn test_conv_gradients_match_finite_differences() {
    let ops = Dispatcher::default();
    let mut cd = ConvDescriptor::new(2, &[3, 3], &[2, 2], "same").unwrap();
    cd.build(&[2, 2, 5, 5], Device::Cpu).unwrap();
    assert_eq!(cd.output_shape(), Some(vec![2, 2, 3, 3]));

    let (xs, ks, bs) = ([2, 2, 5, 5], [2, 2, 3, 3], [2]);
    let x = pattern(100, 1.0);
    let k = pattern(36, 0.5);
    let b = vec![0.3, -0.2];
    // objective: sum(out * w), so d objective / d out = w
    let w = pattern(36, 2.0);
    let objective = |x: &[f32], k: &[f32], b: &[f32]| {
        ops.conv2d(&cd, &t(&xs, x), &t(&ks, k), Some(&t(&bs, b))).unwrap();
        dot(&cd.output().unwrap().to_vec(), &w)
    };

    let delta = t(&[2, 2, 3, 3], &w);
    let input = t(&xs, &x);
    let kernel = t(&ks, &k);

    let gk = Tensor::zeros(&ks, Device::Cpu);
    ops.conv2d_grad(&cd, &input, &delta, &gk).unwrap();
    let want = numeric_grad(&k, 1e-2, |k| objective(&x, k, &b));
    assert_all_close(&gk.to_vec(), &want, 1e-2);

    let gb = Tensor::zeros(&bs, Device::Cpu);
    ops.conv2d_bias_grad(&cd, &delta, &gb).unwrap();
    let want = numeric_grad(&b, 1e-2, |b| objective(&x, &k, b));
    assert_all_close(&gb.to_vec(), &want, 1e-2);

    let gx = Tensor::zeros(&xs, Device::Cpu);
    ops.conv2d_back(&cd, &delta, &kernel, &gx).unwrap();
    let want = numeric_grad(&x, 1e-2, |x| objective(x, &k, &b));
    assert_all_close(&gx.to_vec(), &want, 1e-2);
}

#[test]
fn test_same_padded_pool_backward_matches_finite_differences() {
    let ops = Dispatcher::default();
    let mut pd = PoolDescriptor::new(&[3, 3], &[2, 2], "same").unwrap();
    pd.build(&[1, 2, 5, 5], Device::Cpu).unwrap();
    let w = pd.window().unwrap();
    assert_eq!((w.pad_top, w.pad_bottom, w.pad_left, w.pad_right), (1, 1, 1, 1));
    assert_eq!(w.positions(), 18);

    // distinct values 0.1 apart keep every argmax stable under the difference step
    let x: Vec<f32> = (0..50).map(|i| (i * 7 % 50) as f32 * 0.1).collect();
    let g = pattern(18, 1.0);
    let objective = |x: &[f32]| {
        ops.mpool2d(&pd, &t(&[1, 2, 5, 5], x)).unwrap();
        dot(&pd.output().unwrap().to_vec(), &g)
    };
    let want = numeric_grad(&x, 1e-2, objective);

    ops.mpool2d(&pd, &t(&[1, 2, 5, 5], &x)).unwrap();
    let gx = Tensor::zeros(&[1, 2, 5, 5], Device::Cpu);
    ops.mpool2d_back(&pd, &t(&[1, 2, 3, 3], &g), &gx).unwrap();
    assert_all_close(&gx.to_vec(), &want, 1e-3);
}

#[test]
fn test_reshape_layer_round_trip() {
    let mut g = Graph::with_seed(0);
    let x = g.input("x", &[2, 3]).unwrap();
    let r = g.reshape("r", x, &[3, 2]).unwrap();
    assert!(g.reshape("bad", x, &[4, 2]).is_err());

    let ops = Dispatcher::default();
    let data: Vec<f32> = (0..6).map(|v| v as f32).collect();
    ops.copy(&t(&[1, 2, 3], &data), g.layer(x).unwrap().output()).unwrap();

    let layer = g.layer(r).unwrap();
    layer.forward(&ops).unwrap();
    assert_eq!(layer.output().shape(), vec![1, 3, 2]);
    assert_eq!(layer.output().to_vec(), data);

    ops.fill(layer.delta(), 1.5).unwrap();
    layer.backward(&ops).unwrap();
    layer.backward(&ops).unwrap();
    assert_eq!(g.layer(x).unwrap().delta().to_vec(), vec![3.0; 6]);
}
