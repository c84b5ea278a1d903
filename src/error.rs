use crate::device::{DeviceError, DeviceKind};
use crate::ops::OperatorKind;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid configuration: {reason}")]
    Config { reason: String },

    #[error("shape mismatch: {reason}")]
    Shape { reason: String },

    #[error("device error")]
    Device(#[from] DeviceError),

    #[error("no accelerator registered for {kind:?} on device {device:?}")]
    UnsupportedOperator {
        device: DeviceKind,
        kind: OperatorKind,
    },

    #[error("accelerator is not initialized")]
    NotInitialized,
}

impl Error {
    pub fn config<S>(reason: S) -> Self
    where
        S: Into<String>,
    {
        Error::Config {
            reason: reason.into(),
        }
    }

    pub fn shape<S>(reason: S) -> Self
    where
        S: Into<String>,
    {
        Error::Shape {
            reason: reason.into(),
        }
    }
}
