pub mod pretrained;

pub use pretrained::{save_component, CompactPreset, ModelSource};
