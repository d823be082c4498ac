//! Application layer: pagination and the assembled acceleration facade.

pub mod accelerator;
pub mod error;
pub mod pagination;

pub use accelerator::{Accelerator, AcceleratorStats};
