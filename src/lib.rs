pub mod acc;
pub mod device;
pub mod error;
pub mod ops;
pub mod registry;
pub mod tensor;

pub use crate::error::Error;
pub use crate::tensor::{DataType, Tensor, TensorDesc};
