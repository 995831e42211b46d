//! Batches and the datasets that produce them.

pub mod batch;
pub mod dataset;

pub use batch::{Batch, BatchNormalizer, ClassImageBatch, RawBatch, TextBatch, TextInput};
pub use dataset::{DatasetConfig, FolderDataset};
