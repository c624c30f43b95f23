use candle_core::{Device, Tensor};
use futures::future::BoxFuture;
use labeled_data::{DataError, Example, FoldManifest, PartitionId};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use crate::{loss::BatchLabels, TrainingError};

/// Result alias for data pipeline fallible operations.
pub type Result<T> = std::result::Result<T, TrainingError>;

/// Batch returned by fold loaders.
#[derive(Debug)]
pub struct DataBatch {
    /// `[batch, max_length]` token ids.
    pub input_ids: Tensor,
    /// `[batch, max_length]`, 1.0 on valid positions.
    pub attention_mask: Tensor,
    pub labels: BatchLabels,
    pub example_ids: Vec<u64>,
    pub micro_batch_index: usize,
    pub micro_batches_per_step: usize,
    pub global_step: usize,
    pub epoch: usize,
}

impl DataBatch {
    pub fn len(&self) -> usize {
        self.example_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.example_ids.is_empty()
    }

    /// True for the micro-batch that completes an optimizer step.
    pub fn closes_step(&self) -> bool {
        self.micro_batch_index + 1 == self.micro_batches_per_step
    }
}

/// Asynchronous-compatible loader abstraction.
pub trait DataLoader: Send {
    fn next_batch(&mut self) -> BoxFuture<'_, Result<Option<DataBatch>>>;
}

/// Blocking adapter around an async-friendly loader.
pub struct BlockingDataLoader<L>
where
    L: DataLoader,
{
    inner: L,
}

impl<L> BlockingDataLoader<L>
where
    L: DataLoader,
{
    pub fn new(inner: L) -> Self {
        Self { inner }
    }

    pub fn next_batch(&mut self) -> Result<Option<DataBatch>> {
        futures::executor::block_on(self.inner.next_batch())
    }

    pub fn get_mut(&mut self) -> &mut L {
        &mut self.inner
    }

    pub fn get_ref(&self) -> &L {
        &self.inner
    }

    pub fn into_inner(self) -> L {
        self.inner
    }
}

/// Read every example of `partitions`, in partition order, checking that
/// label paths have the hierarchy's depth.
pub fn load_partitions(manifest: &FoldManifest, partitions: &[PartitionId], depth: usize) -> Result<Vec<Example>> {
    let mut examples = Vec::new();
    for partition in partitions {
        for example in manifest.open(*partition)? {
            let example = example?;
            if example.labels.len() != depth {
                return Err(DataError::DataIntegrity(format!(
                    "example {} in {partition:?} has label depth {}, hierarchy has {depth}",
                    example.id,
                    example.labels.len()
                ))
                .into());
            }
            examples.push(example);
        }
    }
    Ok(examples)
}

fn materialize(examples: &[&Example], device: &Device) -> Result<(Tensor, Tensor, BatchLabels, Vec<u64>)> {
    let rows = examples.len();
    let width = examples.first().map_or(0, |example| example.input_ids.len());
    let mut ids = Vec::with_capacity(rows * width);
    let mut mask = Vec::with_capacity(rows * width);
    for example in examples {
        if example.input_ids.len() != width {
            return Err(DataError::DataIntegrity(format!(
                "example {} has length {}, batch width is {width}",
                example.id,
                example.input_ids.len()
            ))
            .into());
        }
        ids.extend_from_slice(&example.input_ids);
        mask.extend(example.attention_mask.iter().map(|m| *m as f32));
    }
    let input_ids = Tensor::from_vec(ids, (rows, width), device)?;
    let attention_mask = Tensor::from_vec(mask, (rows, width), device)?;
    let labels = BatchLabels::from_paths(examples.iter().map(|example| example.labels.as_slice()))?;
    let example_ids = examples.iter().map(|example| example.id).collect();
    Ok((input_ids, attention_mask, labels, example_ids))
}

/// Training loader over the non-held-out folds.
///
/// Each epoch visits the examples in a fresh order drawn from
/// `seed + epoch`; a trailing remainder smaller than a batch is skipped.
/// The loader cycles forever and tags every micro-batch with the committed
/// step it belongs to.
pub struct FoldBatchLoader {
    examples: Vec<Example>,
    device: Device,
    batch_size: usize,
    micro_batches_per_step: usize,
    seed: u64,
    epoch: usize,
    order: Vec<usize>,
    cursor: usize,
    global_step: usize,
    micro_batch_index: usize,
}

impl FoldBatchLoader {
    pub fn new(
        examples: Vec<Example>,
        device: Device,
        batch_size: usize,
        gradient_accumulation_steps: usize,
        seed: u64,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(TrainingError::initialization("batch size must be greater than zero"));
        }
        if examples.len() < batch_size {
            return Err(TrainingError::initialization(format!(
                "training folds hold {} examples, fewer than one batch of {batch_size}",
                examples.len()
            )));
        }
        let mut loader = Self {
            examples,
            device,
            batch_size,
            micro_batches_per_step: gradient_accumulation_steps.max(1),
            seed,
            epoch: 0,
            order: Vec::new(),
            cursor: 0,
            global_step: 0,
            micro_batch_index: 0,
        };
        loader.shuffle_epoch(0);
        Ok(loader)
    }

    pub fn examples(&self) -> &[Example] {
        &self.examples
    }

    pub fn batches_per_epoch(&self) -> usize {
        self.examples.len() / self.batch_size
    }

    /// Committed steps in one pass over the training folds.
    pub fn steps_per_epoch(&self) -> usize {
        (self.batches_per_epoch() / self.micro_batches_per_step).max(1)
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// Position the loader where it would be after `committed_steps` full
    /// optimizer steps from a fresh start.
    pub fn seek_to_step(&mut self, committed_steps: usize) {
        let consumed = committed_steps * self.micro_batches_per_step;
        let per_epoch = self.batches_per_epoch().max(1);
        let epoch = consumed / per_epoch;
        self.shuffle_epoch(epoch);
        self.cursor = (consumed % per_epoch) * self.batch_size;
        self.global_step = committed_steps;
        self.micro_batch_index = 0;
    }

    fn shuffle_epoch(&mut self, epoch: usize) {
        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
        self.order = (0..self.examples.len()).collect();
        self.order.shuffle(&mut rng);
        self.epoch = epoch;
        self.cursor = 0;
    }

    fn build_batch(&mut self) -> Result<DataBatch> {
        if self.cursor + self.batch_size > self.order.len() {
            let next = self.epoch + 1;
            tracing::debug!(epoch = next, "reshuffling training folds");
            self.shuffle_epoch(next);
        }
        let rows: Vec<&Example> = self.order[self.cursor..self.cursor + self.batch_size]
            .iter()
            .map(|index| &self.examples[*index])
            .collect();
        let (input_ids, attention_mask, labels, example_ids) = materialize(&rows, &self.device)?;
        self.cursor += self.batch_size;

        let micro_batch_index = self.micro_batch_index;
        let global_step = self.global_step;
        if micro_batch_index + 1 == self.micro_batches_per_step {
            self.micro_batch_index = 0;
            self.global_step += 1;
        } else {
            self.micro_batch_index += 1;
        }

        Ok(DataBatch {
            input_ids,
            attention_mask,
            labels,
            example_ids,
            micro_batch_index,
            micro_batches_per_step: self.micro_batches_per_step,
            global_step,
            epoch: self.epoch,
        })
    }
}

impl DataLoader for FoldBatchLoader {
    fn next_batch(&mut self) -> BoxFuture<'_, Result<Option<DataBatch>>> {
        Box::pin(async move { self.build_batch().map(Some) })
    }
}

/// Single ordered pass over an evaluation partition, final batch may be short.
pub struct EvalBatchLoader {
    examples: Vec<Example>,
    device: Device,
    batch_size: usize,
    cursor: usize,
}

impl EvalBatchLoader {
    pub fn new(examples: Vec<Example>, device: Device, batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(TrainingError::initialization(
                "evaluation batch size must be greater than zero",
            ));
        }
        Ok(Self {
            examples,
            device,
            batch_size,
            cursor: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    pub fn reset(&mut self) {
        self.cursor = 0;
    }

    fn build_batch(&mut self) -> Result<Option<DataBatch>> {
        if self.cursor >= self.examples.len() {
            return Ok(None);
        }
        let end = (self.cursor + self.batch_size).min(self.examples.len());
        let rows: Vec<&Example> = self.examples[self.cursor..end].iter().collect();
        let (input_ids, attention_mask, labels, example_ids) = materialize(&rows, &self.device)?;
        let index = self.cursor / self.batch_size;
        self.cursor = end;
        Ok(Some(DataBatch {
            input_ids,
            attention_mask,
            labels,
            example_ids,
            micro_batch_index: index,
            micro_batches_per_step: 1,
            global_step: 0,
            epoch: 0,
        }))
    }
}

impl DataLoader for EvalBatchLoader {
    fn next_batch(&mut self) -> BoxFuture<'_, Result<Option<DataBatch>>> {
        Box::pin(async move { self.build_batch() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn examples(count: usize) -> Vec<Example> {
        (0..count)
            .map(|i| Example {
                id: i as u64,
                input_ids: vec![1, i as u32 + 2, 0],
                attention_mask: vec![1, 1, 0],
                labels: vec![(i % 2) as u32, (i % 4) as u32],
            })
            .collect()
    }

    #[test]
    fn epoch_covers_each_example_once_and_drops_remainder() {
        let loader = FoldBatchLoader::new(examples(10), Device::Cpu, 3, 1, 5).unwrap();
        let mut loader = BlockingDataLoader::new(loader);
        let mut seen = HashSet::new();
        for _ in 0..3 {
            let batch = loader.next_batch().unwrap().unwrap();
            assert_eq!(batch.len(), 3);
            assert_eq!(batch.epoch, 0);
            for id in batch.example_ids {
                assert!(seen.insert(id));
            }
        }
        let next = loader.next_batch().unwrap().unwrap();
        assert_eq!(next.epoch, 1);
        assert_eq!(next.input_ids.dims(), &[3, 3]);
        assert_eq!(next.labels.depth(), 2);
    }

    #[test]
    fn micro_batches_carry_step_positions() {
        let loader = FoldBatchLoader::new(examples(12), Device::Cpu, 2, 3, 0).unwrap();
        assert_eq!(loader.steps_per_epoch(), 2);
        let mut loader = BlockingDataLoader::new(loader);
        let tags: Vec<(usize, usize)> = (0..4)
            .map(|_| {
                let batch = loader.next_batch().unwrap().unwrap();
                (batch.global_step, batch.micro_batch_index)
            })
            .collect();
        assert_eq!(tags, vec![(0, 0), (0, 1), (0, 2), (1, 0)]);
    }

    #[test]
    fn seeking_reproduces_the_same_stream() {
        let mut straight = BlockingDataLoader::new(
            FoldBatchLoader::new(examples(10), Device::Cpu, 2, 2, 9).unwrap(),
        );
        for _ in 0..6 {
            straight.next_batch().unwrap();
        }
        let expected: Vec<Vec<u64>> = (0..4)
            .map(|_| straight.next_batch().unwrap().unwrap().example_ids)
            .collect();

        let mut resumed = FoldBatchLoader::new(examples(10), Device::Cpu, 2, 2, 9).unwrap();
        resumed.seek_to_step(3);
        let mut resumed = BlockingDataLoader::new(resumed);
        let actual: Vec<Vec<u64>> = (0..4)
            .map(|_| resumed.next_batch().unwrap().unwrap().example_ids)
            .collect();
        assert_eq!(actual, expected);
    }

    #[test]
    fn too_few_examples_for_a_batch() {
        assert!(FoldBatchLoader::new(examples(3), Device::Cpu, 4, 1, 0).is_err());
    }

    #[test]
    fn evaluation_pass_is_ordered_and_keeps_short_tail() {
        let mut loader =
            BlockingDataLoader::new(EvalBatchLoader::new(examples(5), Device::Cpu, 2).unwrap());
        let mut ids = Vec::new();
        let mut sizes = Vec::new();
        while let Some(batch) = loader.next_batch().unwrap() {
            sizes.push(batch.len());
            ids.extend(batch.example_ids);
        }
        assert_eq!(sizes, vec![2, 2, 1]);
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
        assert!(loader.next_batch().unwrap().is_none());
        loader.get_mut().reset();
        assert!(loader.next_batch().unwrap().is_some());
    }
}
