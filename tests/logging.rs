use std::sync::Mutex;

use briny_net::prelude::*;
use log::{LevelFilter, Log, Metadata, Record};

struct Capture(Mutex<Vec<String>>);

impl Log for Capture {
    fn enabled(&self, _: &Metadata<'_>) -> bool {
        true
    }

    fn log(&self, record: &Record<'_>) {
        if let Ok(mut lines) = self.0.lock() {
            lines.push(record.args().to_string());
        }
    }

    fn flush(&self) {}
}

static LOGGER: Capture = Capture(Mutex::new(Vec::new()));

#[test]
fn test_build_and_fit_report_devices_and_batch_timings() {
    log::set_logger(&LOGGER).unwrap();
    log::set_max_level(LevelFilter::Debug);

    let mut g = Graph::with_seed(1);
    let x = g.input("x", &[3]).unwrap();
    let h = g.dense("fc", x, 2).unwrap();
    let y = g.softmax("probs", h).unwrap();
    let mut net = Network::new(g, &[x], &[y]).unwrap();
    net.build(
        Box::new(Sgd::new(0.1)),
        vec![Box::new(SoftCrossEntropy)],
        vec![Box::new(CategoricalAccuracy)],
        ComputeService::cpu(1),
    )
    .unwrap();

    let xs = Tensor::zeros(&[4, 3], Device::Cpu);
    let ys = Tensor::from_vec(&[4, 2], [0.0, 1.0].repeat(4), Device::Cpu).unwrap();
    net.fit(&[&xs], &[&ys], 2, 1).unwrap();

    let lines = LOGGER.0.lock().unwrap();
    assert!(lines.iter().any(|l| l.starts_with("net running on CPU")), "{lines:?}");
    assert!(
        lines
            .iter()
            .any(|l| l.starts_with("epoch 1 batch 2/2: loss") && l.contains(" in ")),
        "{lines:?}"
    );
}
