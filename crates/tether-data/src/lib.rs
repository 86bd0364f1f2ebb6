//! # tether-data
//!
//! Feeding batches of named tensors to the trainer.
//!
//! - [`BatchSource`] — restartable lazy batch sequence the trainer consumes
//! - [`DictDataset`] — named tensors sharing a sample dimension
//! - [`DictLoader`] — shuffling mini-batch loader, optionally parallel
//! - [`random_split`] — seeded train/dev/test partitioning

pub mod dataset;
pub mod loader;
pub mod source;

pub use dataset::{random_split, DictDataset};
pub use loader::{DataLoaderConfig, DictLoader};
pub use source::BatchSource;
