//! Training passes and the data-parallel batch driver.

use std::any::Any;
use std::thread;
use std::time::Instant;

use log::{debug, info, warn};
use rand::Rng;

use super::{EpochStats, Network, Phase, Score};
use crate::error::{Error, Result};
use crate::tensor::Tensor;

fn panic_reason(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[allow(clippy::cast_precision_loss)]
fn mean(scores: &[Score], samples: usize) -> Vec<Score> {
    let n = samples.max(1) as f32;
    scores
        .iter()
        .map(|s| Score {
            loss: s.loss / n,
            metric: s.metric / n,
        })
        .collect()
}

impl Network {
    /// Zeroes every layer's delta.
    pub fn reset(&self) -> Result<()> {
        for l in &self.layers {
            l.reset(&self.ops)?;
        }
        Ok(())
    }

    pub fn reset_scores(&mut self) {
        self.scores.iter_mut().for_each(|s| *s = Score::default());
    }

    /// Runs every layer in forward schedule order.
    pub fn forward(&self) -> Result<()> {
        for id in &self.fts {
            self.layers[id.0].forward(&self.ops)?;
        }
        Ok(())
    }

    /// Scores the outputs against the targets, replacing the stored scores
    /// with this batch's sums.
    pub fn loss(&mut self) -> Result<()> {
        for (j, o) in self.outputs.iter().enumerate() {
            let pred = &self.layers[o.0].output;
            self.scores[j] = Score {
                loss: self.losses[j].value(&self.ops, &self.targets[j], pred)?,
                metric: self.metrics[j].value(&self.ops, &self.targets[j], pred)?,
            };
        }
        Ok(())
    }

    /// Seeds the output deltas from the losses.
    pub fn delta(&self) -> Result<()> {
        for (j, o) in self.outputs.iter().enumerate() {
            let l = &self.layers[o.0];
            self.losses[j].delta(&self.ops, &self.targets[j], &l.output, &l.delta)?;
        }
        Ok(())
    }

    /// Runs every layer in backward schedule order.
    pub fn backward(&self) -> Result<()> {
        for id in &self.bts {
            self.layers[id.0].backward(&self.ops)?;
        }
        Ok(())
    }

    /// Applies and clears the accumulated gradients of `batch` samples.
    pub fn apply_gradients(&mut self, batch: usize) -> Result<()> {
        let opt = self
            .optimizer
            .as_mut()
            .ok_or(Error::NotBuilt { op: "apply_gradients" })?;
        opt.apply_gradients(batch, &self.ops)
    }

    /// One replica step over the data already staged in its inputs/targets.
    fn step(&mut self, training: bool, apply: bool) -> Result<()> {
        self.reset()?;
        self.forward()?;
        self.loss()?;
        if training {
            self.delta()?;
            self.backward()?;
            if apply {
                self.apply_gradients(self.batch)?;
            }
        }
        Ok(())
    }

    /// Resizes to `batch` and makes sure replicas exist.
    fn prepare(&mut self, batch: usize) -> Result<()> {
        if self.phase == Phase::Unbuilt {
            return Err(Error::NotBuilt { op: "train" });
        }
        self.resize(batch)?;
        if self.phase == Phase::Built {
            let devices = self.service.replica_devices();
            self.split(&devices)?;
        }
        Ok(())
    }

    /// Moves every layer, target and replica to a new batch size.
    ///
    /// Replicas are rebuilt over the same devices.
    pub fn resize(&mut self, batch: usize) -> Result<()> {
        if batch == 0 {
            return Err(Error::config("resize", "batch size must be positive"));
        }
        if batch == self.batch {
            return Ok(());
        }
        if self.phase == Phase::Split && batch < self.replicas.len() {
            return Err(Error::TooManyReplicas {
                replicas: self.replicas.len(),
                batch,
            });
        }
        for l in &mut self.layers {
            l.resize(batch)?;
        }
        for t in &self.targets {
            t.resize_batch(batch);
        }
        self.batch = batch;
        debug!("resized network to batch {batch}");
        if self.phase == Phase::Split {
            let devices: Vec<_> = self.replicas.iter().map(|r| r.device).collect();
            self.split(&devices)?;
        }
        Ok(())
    }

    /// Number of samples in `x`/`y`, after checking they match the network.
    fn sample_count(&self, op: &'static str, x: &[&Tensor], y: &[&Tensor]) -> Result<usize> {
        if x.len() != self.inputs.len() || y.len() != self.outputs.len() {
            return Err(Error::config(
                op,
                format!(
                    "got {} inputs and {} targets for a network with {} inputs and {} outputs",
                    x.len(),
                    y.len(),
                    self.inputs.len(),
                    self.outputs.len()
                ),
            ));
        }
        let n = x[0].batch();
        if let Some(t) = x.iter().chain(y).find(|t| t.batch() != n) {
            return Err(Error::config(
                op,
                format!("sample counts differ: {n} vs {}", t.batch()),
            ));
        }
        if n == 0 {
            return Err(Error::config(op, "no samples"));
        }
        Ok(n)
    }

    /// Trains on the rows of `x`/`y` picked by `indices`.
    ///
    /// The batch is split over the replicas in order: replica `i` takes the
    /// next `replica.batch_size()` indices. Replicas run concurrently; the
    /// first failing replica's error is returned. Resizes the network when
    /// `indices.len()` differs from the current batch size.
    pub fn train_batch(&mut self, x: &[&Tensor], y: &[&Tensor], indices: &[usize]) -> Result<()> {
        self.run_batch(x, y, indices, true)
    }

    fn run_batch(&mut self, x: &[&Tensor], y: &[&Tensor], indices: &[usize], training: bool) -> Result<()> {
        self.sample_count("train_batch", x, y)?;
        if indices.is_empty() {
            return Err(Error::config("train_batch", "empty batch"));
        }
        self.prepare(indices.len())?;

        let mut start = 0;
        for (i, rep) in self.replicas.iter().enumerate() {
            let end = start + rep.batch;
            for (j, xt) in x.iter().enumerate() {
                self.ops.select(xt, &self.xs[i][j], indices, start, end)?;
                self.ops.copy(&self.xs[i][j], &rep.layers[rep.inputs[j].0].output)?;
            }
            for (j, yt) in y.iter().enumerate() {
                self.ops.select(yt, &self.ys[i][j], indices, start, end)?;
                self.ops.copy(&self.ys[i][j], &rep.targets[j])?;
            }
            start = end;
        }

        let owners: Vec<bool> = self.replicas.iter().map(|r| self.owns_params(r)).collect();
        let results: Vec<Result<()>> = if self.replicas.len() == 1 {
            vec![self.replicas[0].step(training, owners[0])]
        } else {
            thread::scope(|s| {
                let mut handles = Vec::with_capacity(self.replicas.len());
                for (i, (rep, &own)) in self.replicas.iter_mut().zip(&owners).enumerate() {
                    let h = thread::Builder::new()
                        .name(format!("replica-{i}"))
                        .spawn_scoped(s, move || rep.step(training, own))
                        .map_err(|e| Error::Backend(format!("replica {i}: {e}")));
                    handles.push(h);
                }
                handles
                    .into_iter()
                    .enumerate()
                    .map(|(i, h)| {
                        h?.join().unwrap_or_else(|p| {
                            Err(Error::Worker {
                                replica: i,
                                reason: panic_reason(p.as_ref()),
                            })
                        })
                    })
                    .collect()
            })
        };
        for r in results {
            r?;
        }

        if training {
            let shared: usize = self
                .replicas
                .iter()
                .zip(&owners)
                .filter(|(_, own)| !**own)
                .map(|(r, _)| r.batch)
                .sum();
            if shared > 0 {
                self.apply_gradients(shared)?;
            }
            if owners.iter().any(|&o| o) {
                self.pending_sync += 1;
                if self.pending_sync >= self.sync_interval {
                    self.sync_weights()?;
                }
            }
        }

        for (j, s) in self.scores.iter_mut().enumerate() {
            for r in &self.replicas {
                s.loss += r.scores[j].loss;
                s.metric += r.scores[j].metric;
            }
        }
        Ok(())
    }

    /// Trains once on all of `x`/`y` as a single batch and returns the mean
    /// per-sample scores.
    pub fn train_on_batch(&mut self, x: &[&Tensor], y: &[&Tensor]) -> Result<Vec<Score>> {
        let n = self.sample_count("train_on_batch", x, y)?;
        let indices: Vec<usize> = (0..n).collect();
        self.reset_scores();
        self.run_batch(x, y, &indices, true)?;
        if self.pending_sync > 0 {
            self.sync_weights()?;
        }
        Ok(mean(&self.scores, n))
    }

    /// Trains for `epochs` passes of randomly sampled batches.
    ///
    /// Each epoch draws `samples / batch` batches of uniformly random rows;
    /// leftover samples that do not fill a batch are not used. Replica
    /// weights are synchronized at the end of every epoch.
    #[allow(clippy::cast_precision_loss)]
    pub fn fit(&mut self, x: &[&Tensor], y: &[&Tensor], batch: usize, epochs: usize) -> Result<Vec<EpochStats>> {
        let n = self.sample_count("fit", x, y)?;
        if batch == 0 || batch > n {
            return Err(Error::config("fit", format!("batch size {batch} for {n} samples")));
        }
        self.prepare(batch)?;
        let batches = n / batch;
        if n % batch != 0 {
            warn!("fit: {} of {n} samples do not fill a batch of {batch}", n % batch);
        }
        info!(
            "fit: {n} samples, {batches} batches of {batch}, {} replicas, {epochs} epochs",
            self.replicas.len()
        );

        let mut history = Vec::with_capacity(epochs);
        for epoch in 1..=epochs {
            let started = Instant::now();
            self.reset_scores();
            for b in 0..batches {
                let indices: Vec<usize> = (0..batch).map(|_| self.rng.random_range(0..n)).collect();
                let batch_started = Instant::now();
                self.run_batch(x, y, &indices, true)?;
                debug!(
                    "epoch {epoch} batch {}/{batches}: loss {:.4} in {:?}",
                    b + 1,
                    self.scores.first().map_or(0.0, |s| s.loss) / ((b + 1) * batch) as f32,
                    batch_started.elapsed()
                );
            }
            if self.pending_sync > 0 {
                self.sync_weights()?;
            }
            let stats = EpochStats {
                epoch,
                scores: mean(&self.scores, batches * batch),
                elapsed: started.elapsed(),
            };
            info!("{stats}");
            history.push(stats);
        }
        Ok(history)
    }

    /// Mean per-sample scores over `x`/`y` at the current batch size.
    ///
    /// The batch grows to one sample per replica when it is smaller. Rows are
    /// taken in order; trailing samples that do not fill a batch are not
    /// evaluated.
    pub fn evaluate(&mut self, x: &[&Tensor], y: &[&Tensor]) -> Result<Vec<Score>> {
        let n = self.sample_count("evaluate", x, y)?;
        let replicas = if self.phase == Phase::Split {
            self.replicas.len()
        } else {
            self.service.replica_devices().len()
        };
        let batch = self.batch.max(replicas).min(n);
        self.prepare(batch)?;
        let batches = n / batch;
        if n % batch != 0 {
            warn!("evaluate: {} of {n} samples do not fill a batch of {batch}", n % batch);
        }
        self.reset_scores();
        for b in 0..batches {
            let indices: Vec<usize> = (b * batch..(b + 1) * batch).collect();
            self.run_batch(x, y, &indices, false)?;
        }
        let scores = mean(&self.scores, batches * batch);
        info!("evaluate: {scores:?}");
        Ok(scores)
    }
}
