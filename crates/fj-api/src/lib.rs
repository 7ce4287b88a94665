#![forbid(unsafe_code)]

pub mod errors;
pub mod transforms;

pub use errors::ApiError;
pub use transforms::{LogicalSize, MaskedFn, MaskedOutputs};
pub use transforms::{mask, shapecheck};
