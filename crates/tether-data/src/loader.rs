// DictLoader — batching, shuffling, iteration over a DictDataset

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;

use tether_core::{DataDict, Result, Tensor};

use crate::dataset::DictDataset;
use crate::source::BatchSource;

/// Configuration for the DictLoader.
#[derive(Debug, Clone)]
pub struct DataLoaderConfig {
    /// Number of samples per batch.
    pub batch_size: usize,
    /// Whether to shuffle indices each epoch.
    pub shuffle: bool,
    /// Whether to drop the last incomplete batch.
    pub drop_last: bool,
    /// Gather keys in parallel when > 0 (0 = sequential).
    pub num_workers: usize,
    /// Optional random seed for reproducible shuffling.
    pub seed: Option<u64>,
}

impl Default for DataLoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            shuffle: true,
            drop_last: false,
            num_workers: 0,
            seed: None,
        }
    }
}

impl DataLoaderConfig {
    pub fn batch_size(mut self, bs: usize) -> Self {
        self.batch_size = bs;
        self
    }

    pub fn shuffle(mut self, s: bool) -> Self {
        self.shuffle = s;
        self
    }

    pub fn drop_last(mut self, d: bool) -> Self {
        self.drop_last = d;
        self
    }

    pub fn num_workers(mut self, n: usize) -> Self {
        self.num_workers = n;
        self
    }

    pub fn seed(mut self, s: u64) -> Self {
        self.seed = Some(s);
        self
    }
}

/// Produces shuffled mini-batches of a [`DictDataset`] as [`DataDict`]s.
///
/// Each batch holds every dataset key with the sample dimension cut down to
/// the batch rows.
pub struct DictLoader {
    dataset: DictDataset,
    config: DataLoaderConfig,
    indices: Vec<usize>,
    rng: StdRng,
}

impl DictLoader {
    pub fn new(dataset: DictDataset, config: DataLoaderConfig) -> Self {
        let indices: Vec<usize> = (0..dataset.len()).collect();
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            dataset,
            config,
            indices,
            rng,
        }
    }

    /// The number of batches per epoch.
    pub fn num_batches(&self) -> usize {
        let bs = self.config.batch_size.max(1);
        if self.config.drop_last {
            self.dataset.len() / bs
        } else {
            self.dataset.len().div_ceil(bs)
        }
    }

    pub fn len(&self) -> usize {
        self.dataset.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dataset.is_empty()
    }

    pub fn dataset(&self) -> &DictDataset {
        &self.dataset
    }

    pub fn config(&self) -> &DataLoaderConfig {
        &self.config
    }

    /// Reshuffle indices (called at the start of each epoch).
    pub fn reshuffle(&mut self) {
        if self.config.shuffle {
            self.indices.shuffle(&mut self.rng);
        }
    }

    /// Build the batch at position `batch_idx` of the current ordering.
    pub fn batch(&self, batch_idx: usize) -> Result<DataDict> {
        let bs = self.config.batch_size.max(1);
        let start = batch_idx * bs;
        let end = (start + bs).min(self.indices.len());
        let rows = &self.indices[start.min(end)..end];
        if self.config.num_workers > 0 {
            let entries: Vec<(&String, &Tensor)> = self.dataset.tensors().iter().collect();
            let gathered = entries
                .par_iter()
                .map(|(k, t)| t.index_select(0, rows).map(|b| ((*k).clone(), b)))
                .collect::<Result<Vec<_>>>()?;
            Ok(gathered.into_iter().collect())
        } else {
            self.dataset.gather(rows)
        }
    }

    /// Produce all batches for one epoch.
    pub fn epoch_batches(&mut self) -> Result<Vec<DataDict>> {
        self.reshuffle();
        let n = DictLoader::num_batches(self);
        (0..n).map(|i| self.batch(i)).collect()
    }
}

impl BatchSource for DictLoader {
    fn iter_batches(&mut self) -> Result<Box<dyn Iterator<Item = Result<DataDict>> + '_>> {
        self.reshuffle();
        let n = DictLoader::num_batches(self);
        tracing::trace!(batches = n, "starting data pass");
        let this: &DictLoader = self;
        Ok(Box::new((0..n).map(move |i| this.batch(i))))
    }

    fn num_batches(&self) -> Option<usize> {
        Some(DictLoader::num_batches(self))
    }
}
