use std::sync::Arc;

use approx::assert_abs_diff_eq;
use briny_net::prelude::*;

fn one_hot(n: usize, classes: usize) -> Tensor {
    let mut data = vec![0.0; n * classes];
    for i in 0..n {
        data[i * classes + i % classes] = 1.0;
    }
    Tensor::from_vec(&[n, classes], data, Device::Cpu).unwrap()
}

/// Sample `i` belongs to class `i % 3`; feature `i % 3` is hot, the rest is
/// small deterministic noise.
fn inputs(n: usize, features: usize) -> Tensor {
    let mut data = Vec::with_capacity(n * features);
    for i in 0..n {
        for j in 0..features {
            let noise = ((i * 7 + j * 3) % 11) as f32 / 55.0;
            data.push(if j == i % 3 { 1.0 + noise } else { noise });
        }
    }
    Tensor::from_vec(&[n, features], data, Device::Cpu).unwrap()
}

fn classifier(seed: u64, service: ComputeService) -> Network {
    let mut g = Graph::with_seed(seed);
    let x = g.input("x", &[5]).unwrap();
    let h = g.dense("hidden", x, 8).unwrap();
    let r = g.relu("act", h).unwrap();
    let o = g.dense("logits", r, 3).unwrap();
    let y = g.softmax("probs", o).unwrap();
    let mut net = Network::new(g, &[x], &[y]).unwrap();
    net.build(
        Box::new(Sgd::new(0.2)),
        vec![Box::new(SoftCrossEntropy)],
        vec![Box::new(CategoricalAccuracy)],
        service,
    )
    .unwrap();
    net.set_seed(17);
    net
}

fn params(net: &Network) -> Vec<Vec<f32>> {
    net.layers()
        .iter()
        .flat_map(|l| l.params().iter().map(|p| p.to_vec()))
        .collect()
}

fn assert_params_close(a: &[Vec<f32>], b: &[Vec<f32>]) {
    assert_eq!(a.len(), b.len());
    for (x, y) in a.iter().zip(b) {
        for (u, v) in x.iter().zip(y) {
            assert_abs_diff_eq!(*u, *v, epsilon = 1e-5);
        }
    }
}

#[test]
fn test_split_is_deferred_until_batch_fits() {
    let mut net = classifier(1, ComputeService::cpu(4));
    assert!(net.replicas().is_empty());

    net.resize(10).unwrap();
    net.split(&[Device::Cpu; 4]).unwrap();
    let sizes: Vec<usize> = net.replicas().iter().map(Network::batch_size).collect();
    assert_eq!(sizes, vec![2, 2, 2, 4]);
}

#[test]
fn test_cpu_replicas_share_parameters() {
    let mut net = classifier(2, ComputeService::cpu(2));
    net.resize(4).unwrap();
    net.split(&[Device::Cpu, Device::Cpu]).unwrap();

    let parent = net.get_layer("hidden").unwrap();
    for rep in net.replicas() {
        let l = rep.get_layer("hidden").unwrap();
        assert!(Arc::ptr_eq(&l.params()[0], &parent.params()[0]));
        assert!(Arc::ptr_eq(&l.grads()[0], &parent.grads()[0]));
        assert!(!Arc::ptr_eq(l.output(), parent.output()));
        assert_eq!(l.output().batch(), 2);
    }

    let before = params(&net);
    net.sync_weights().unwrap();
    assert_params_close(&before, &params(&net));
}

#[test]
fn test_fpga_replicas_clone_and_sync_is_idempotent() {
    let mut net = classifier(3, ComputeService::fpga(vec![true, true]));
    net.resize(6).unwrap();
    net.split(&[Device::Fpga(0), Device::Fpga(1)]).unwrap();

    let parent = net.get_layer("logits").unwrap();
    for (i, rep) in net.replicas().iter().enumerate() {
        let l = rep.get_layer("logits").unwrap();
        assert!(!Arc::ptr_eq(&l.params()[0], &parent.params()[0]));
        assert_eq!(l.params()[0].device(), Device::Fpga(i));
        assert_eq!(l.params()[0].to_vec(), parent.params()[0].to_vec());
        assert_eq!(l.grads()[0].to_vec(), vec![0.0; 24]);
    }

    let before = params(&net);
    net.sync_weights().unwrap();
    assert_params_close(&before, &params(&net));
}

#[test]
fn test_too_many_replicas() {
    let mut net = classifier(4, ComputeService::cpu(1));
    net.resize(2).unwrap();
    assert!(matches!(
        net.split(&[Device::Cpu; 3]),
        Err(Error::TooManyReplicas { replicas: 3, batch: 2 })
    ));

    let mut wide = classifier(4, ComputeService::cpu(4));
    let (x, y) = (inputs(12, 5), one_hot(12, 3));
    assert!(matches!(
        wide.fit(&[&x], &[&y], 3, 1),
        Err(Error::TooManyReplicas { .. })
    ));
}

#[test]
fn test_multi_replica_cpu_training() {
    let mut net = classifier(5, ComputeService::cpu(3));
    let (x, y) = (inputs(24, 5), one_hot(24, 3));
    let history = net.fit(&[&x], &[&y], 6, 15).unwrap();
    assert_eq!(net.replicas().len(), 3);
    assert!(history[14].scores[0].loss < history[0].scores[0].loss);
}

#[test]
fn test_single_fpga_replica_matches_cpu() {
    let mut cpu = classifier(6, ComputeService::cpu(1));
    let mut fpga = classifier(6, ComputeService::fpga(vec![true]));
    let (x, y) = (inputs(16, 5), one_hot(16, 3));

    let a = cpu.fit(&[&x], &[&y], 4, 2).unwrap();
    let b = fpga.fit(&[&x], &[&y], 4, 2).unwrap();

    assert_abs_diff_eq!(a[1].scores[0].loss, b[1].scores[0].loss, epsilon = 1e-5);
    assert_params_close(&params(&cpu), &params(&fpga));
}

#[test]
fn test_fpga_replicas_agree_after_fit() {
    let mut net = classifier(7, ComputeService::fpga(vec![true, false, true]));
    let (x, y) = (inputs(20, 5), one_hot(20, 3));
    let history = net.fit(&[&x], &[&y], 4, 10).unwrap();
    assert!(history[9].scores[0].loss < history[0].scores[0].loss);

    let parent = params(&net);
    for rep in net.replicas() {
        assert_params_close(&parent, &params(rep));
    }
}

#[test]
fn test_sync_interval_delays_averaging() {
    let service = ComputeService::LocalFpga {
        devices: vec![true, true],
        sync_interval: 3,
    };
    let mut net = classifier(8, service);
    let (x, y) = (inputs(8, 5), one_hot(8, 3));
    let indices: Vec<usize> = (0..8).collect();

    let start = params(&net);
    net.train_batch(&[&x], &[&y], &indices).unwrap();
    assert_eq!(params(&net), start);
    assert_ne!(params(&net.replicas()[0]), start);

    net.train_batch(&[&x], &[&y], &indices).unwrap();
    net.train_batch(&[&x], &[&y], &indices).unwrap();
    let parent = params(&net);
    assert_ne!(parent, start);
    for rep in net.replicas() {
        assert_params_close(&parent, &params(rep));
    }
}

#[test]
fn test_denied_emulation_surfaces_not_implemented() {
    let mut g = Graph::with_seed(0);
    let x = g.input("x", &[2]).unwrap();
    let y = g.softmax("y", x).unwrap();
    let mut net = Network::new(g, &[x], &[y]).unwrap();
    net.set_backend_caps(BackendCaps::default().deny_emulation(DeviceKind::Fpga))
        .unwrap();
    net.build(
        Box::new(Sgd::new(0.1)),
        vec![Box::new(SoftCrossEntropy)],
        vec![Box::new(CategoricalAccuracy)],
        ComputeService::fpga(vec![true]),
    )
    .unwrap();

    let (xs, ys) = (inputs(2, 2), one_hot(2, 2));
    assert!(matches!(
        net.fit(&[&xs], &[&ys], 2, 1),
        Err(Error::NotImplemented { backend: "FPGA", .. })
    ));
}

#[test]
fn test_evaluate_sums_over_replicas() {
    let mut net = classifier(9, ComputeService::cpu(2));
    let (x, y) = (inputs(8, 5), one_hot(8, 3));
    net.resize(4).unwrap();
    let split = net.evaluate(&[&x], &[&y]).unwrap();

    let mut single = classifier(9, ComputeService::cpu(1));
    single.resize(4).unwrap();
    let whole = single.evaluate(&[&x], &[&y]).unwrap();

    assert_abs_diff_eq!(split[0].loss, whole[0].loss, epsilon = 1e-5);
    assert_abs_diff_eq!(split[0].metric, whole[0].metric, epsilon = 1e-6);
}

#[test]
fn test_evaluate_before_fit_fills_every_replica() {
    let (x, y) = (inputs(8, 5), one_hot(8, 3));

    let mut net = classifier(9, ComputeService::cpu(2));
    assert_eq!(net.batch_size(), 1);
    let split = net.evaluate(&[&x], &[&y]).unwrap();
    assert_eq!(net.replicas().len(), 2);

    let mut single = classifier(9, ComputeService::cpu(1));
    let whole = single.evaluate(&[&x], &[&y]).unwrap();

    assert_abs_diff_eq!(split[0].loss, whole[0].loss, epsilon = 1e-5);
    assert_abs_diff_eq!(split[0].metric, whole[0].metric, epsilon = 1e-6);
}

#[test]
fn test_shared_cpu_replicas_match_single_replica() {
    let mut wide = classifier(10, ComputeService::cpu(3));
    let mut single = classifier(10, ComputeService::cpu(1));
    let (x, y) = (inputs(12, 5), one_hot(12, 3));
    assert_params_close(&params(&wide), &params(&single));

    for _ in 0..3 {
        let a = wide.train_on_batch(&[&x], &[&y]).unwrap();
        let b = single.train_on_batch(&[&x], &[&y]).unwrap();
        assert_abs_diff_eq!(a[0].loss, b[0].loss, epsilon = 1e-5);
    }
    assert_eq!(wide.replicas().len(), 3);
    assert_params_close(&params(&wide), &params(&single));
}
