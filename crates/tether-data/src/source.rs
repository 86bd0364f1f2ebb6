// BatchSource — what the trainer iterates each epoch
//
// A source yields dictionaries of named tensors, one per batch. Calling
// `iter_batches` again starts a fresh pass, so the same source serves
// every epoch. Batches are produced lazily and may fail individually.

use tether_core::{DataDict, Result};

/// A restartable, lazy sequence of batches.
pub trait BatchSource {
    /// Begin a new pass over the data.
    fn iter_batches(&mut self) -> Result<Box<dyn Iterator<Item = Result<DataDict>> + '_>>;

    /// Number of batches in one pass, when known up front.
    fn num_batches(&self) -> Option<usize> {
        None
    }
}

/// Pre-built batches, replayed in order every pass.
impl BatchSource for Vec<DataDict> {
    fn iter_batches(&mut self) -> Result<Box<dyn Iterator<Item = Result<DataDict>> + '_>> {
        Ok(Box::new(self.iter().cloned().map(Ok)))
    }

    fn num_batches(&self) -> Option<usize> {
        Some(self.len())
    }
}

impl<S: BatchSource + ?Sized> BatchSource for &mut S {
    fn iter_batches(&mut self) -> Result<Box<dyn Iterator<Item = Result<DataDict>> + '_>> {
        (**self).iter_batches()
    }

    fn num_batches(&self) -> Option<usize> {
        (**self).num_batches()
    }
}
