use crate::device::DeviceContext;
use crate::error::Error;
use crate::ops::{OperatorConfig, OperatorResource};
use crate::tensor::Tensor;
use std::fmt::Debug;
use std::sync::Arc;

pub mod conv;
pub mod relu;

/// Device- and operator-specific execution unit for one graph node.
///
/// Implementations are driven through [`AcceleratorInstance`], which enforces
/// the lifecycle: `init` runs exactly once, stages resources synchronously and
/// must finish with an internal `reshape` so a successful init is run-ready;
/// `reshape` follows every shape change and is the only place shape-dependent
/// state (descriptors, algorithm, workspace) may be rebuilt; `run` executes
/// with cached state and allocates nothing.
pub trait Accelerator: Debug {
    fn init(
        &mut self,
        ctx: Arc<DeviceContext>,
        config: &OperatorConfig,
        resource: &OperatorResource,
        inputs: &[Tensor],
        outputs: &[Tensor],
    ) -> Result<(), Error>;

    fn reshape(&mut self, inputs: &[Tensor], outputs: &[Tensor]) -> Result<(), Error>;

    fn run(&mut self, inputs: &[Tensor], outputs: &[Tensor]) -> Result<(), Error>;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum State {
    Uninitialized,
    Ready,
    Failed,
}

/// Owns one accelerator and its lifecycle state machine.
///
/// `Uninitialized -> Ready` on a successful init, `Ready -> Ready` across
/// reshapes and runs. Any failed transition is terminal: the instance moves to
/// `Failed` and every further call reports [`Error::NotInitialized`]. There is
/// no way back to `Uninitialized`.
#[derive(Debug)]
pub struct AcceleratorInstance {
    acc: Box<dyn Accelerator>,
    state: State,
}

impl AcceleratorInstance {
    pub fn new(acc: Box<dyn Accelerator>) -> Self {
        AcceleratorInstance {
            acc,
            state: State::Uninitialized,
        }
    }

    pub fn init(
        &mut self,
        ctx: Arc<DeviceContext>,
        config: &OperatorConfig,
        resource: &OperatorResource,
        inputs: &[Tensor],
        outputs: &[Tensor],
    ) -> Result<(), Error> {
        if self.state != State::Uninitialized {
            return Err(Error::config("accelerator is already initialized"));
        }
        match self.acc.init(ctx, config, resource, inputs, outputs) {
            Ok(()) => {
                self.state = State::Ready;
                Ok(())
            }
            Err(e) => {
                self.state = State::Failed;
                Err(e)
            }
        }
    }

    pub fn reshape(&mut self, inputs: &[Tensor], outputs: &[Tensor]) -> Result<(), Error> {
        self.transition(|acc| acc.reshape(inputs, outputs))
    }

    pub fn run(&mut self, inputs: &[Tensor], outputs: &[Tensor]) -> Result<(), Error> {
        self.transition(|acc| acc.run(inputs, outputs))
    }

    pub fn is_ready(&self) -> bool {
        self.state == State::Ready
    }

    fn transition<F>(&mut self, f: F) -> Result<(), Error>
    where
        F: FnOnce(&mut dyn Accelerator) -> Result<(), Error>,
    {
        if self.state != State::Ready {
            return Err(Error::NotInitialized);
        }
        match f(self.acc.as_mut()) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.state = State::Failed;
                Err(e)
            }
        }
    }
}

/// The single input/output most accelerators in this crate bind to.
pub(crate) fn single<'t>(tensors: &'t [Tensor], op: &str, side: &str) -> Result<&'t Tensor, Error> {
    match tensors {
        [tensor] => Ok(tensor),
        _ => Err(Error::config(format!(
            "{} expects exactly one {} tensor, got {}",
            op,
            side,
            tensors.len()
        ))),
    }
}
