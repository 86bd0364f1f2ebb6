// DictDataset — named tensors that share a leading sample dimension
//
// Every entry is stored whole; a sample is a row along dim 0 of each entry.
// Gathering rows for a batch copies them out with `index_select`.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use tether_core::{DataDict, Error, Result, Tensor};

/// A dataset of named tensors indexed along dim 0.
#[derive(Clone, Debug)]
pub struct DictDataset {
    tensors: DataDict,
    len: usize,
}

impl DictDataset {
    /// Build a dataset; every entry must have rank ≥ 1 and the same dim-0 size.
    pub fn new(tensors: DataDict) -> Result<Self> {
        let mut len = None;
        for (key, t) in tensors.iter() {
            if t.rank() == 0 {
                return Err(Error::msg(format!(
                    "dataset entry '{key}' is a scalar; entries need a sample dimension"
                )));
            }
            let n = t.dims()[0];
            match len {
                None => len = Some(n),
                Some(expected) if expected != n => {
                    return Err(Error::msg(format!(
                        "dataset entry '{key}' has {n} samples, expected {expected}"
                    )))
                }
                Some(_) => {}
            }
        }
        Ok(DictDataset {
            tensors,
            len: len.unwrap_or(0),
        })
    }

    /// Build a dataset from `(name, tensor)` pairs.
    pub fn from_pairs<K: Into<String>>(pairs: impl IntoIterator<Item = (K, Tensor)>) -> Result<Self> {
        Self::new(pairs.into_iter().collect())
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys()
    }

    /// The full, unbatched tensors.
    pub fn tensors(&self) -> &DataDict {
        &self.tensors
    }

    /// Rows `indices` of every entry, keeping the sample dimension.
    pub fn gather(&self, indices: &[usize]) -> Result<DataDict> {
        let mut batch = DataDict::new();
        for (k, t) in self.tensors.iter() {
            batch.insert(k.clone(), t.index_select(0, indices)?);
        }
        Ok(batch)
    }

    /// A single sample as a batch of one.
    pub fn get(&self, index: usize) -> Result<DataDict> {
        self.gather(&[index])
    }

    /// A new dataset holding only `indices`, in that order.
    pub fn subset(&self, indices: &[usize]) -> Result<Self> {
        Self::new(self.gather(indices)?)
    }
}

/// Randomly partition `dataset` into pieces of the given sizes.
///
/// The sizes must add up to the dataset length. The same seed always yields
/// the same split.
pub fn random_split(dataset: &DictDataset, sizes: &[usize], seed: u64) -> Result<Vec<DictDataset>> {
    let total: usize = sizes.iter().sum();
    if total != dataset.len() {
        return Err(Error::msg(format!(
            "random_split: sizes sum to {total} but the dataset has {} samples",
            dataset.len()
        )));
    }
    let mut indices: Vec<usize> = (0..dataset.len()).collect();
    indices.shuffle(&mut StdRng::seed_from_u64(seed));

    let mut parts = Vec::with_capacity(sizes.len());
    let mut offset = 0;
    for &size in sizes {
        parts.push(dataset.subset(&indices[offset..offset + size])?);
        offset += size;
    }
    Ok(parts)
}
