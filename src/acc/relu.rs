use crate::acc::{single, Accelerator};
use crate::device::DeviceContext;
use crate::error::Error;
use crate::ops::{OperatorConfig, OperatorResource};
use crate::tensor::Tensor;
use std::sync::Arc;

/// Resource-free elementwise activation; the smallest instance of the
/// contract. No weights to stage, no workspace, descriptors degenerate to a
/// cached element count.
#[derive(Default, Debug)]
pub struct ReluAccelerator {
    bound: Option<Bound>,
}

#[derive(Debug)]
struct Bound {
    ctx: Arc<DeviceContext>,
    count: usize,
}

impl Accelerator for ReluAccelerator {
    fn init(
        &mut self,
        ctx: Arc<DeviceContext>,
        config: &OperatorConfig,
        resource: &OperatorResource,
        inputs: &[Tensor],
        outputs: &[Tensor],
    ) -> Result<(), Error> {
        match config {
            OperatorConfig::Relu => {}
            other => {
                return Err(Error::config(format!(
                    "operator config {:?} is not an activation",
                    other
                )))
            }
        }
        match resource {
            OperatorResource::None => {}
            _ => return Err(Error::config("activation accelerators take no resource")),
        }

        self.bound = Some(Bound { ctx, count: 0 });
        self.reshape(inputs, outputs)
    }

    fn reshape(&mut self, inputs: &[Tensor], outputs: &[Tensor]) -> Result<(), Error> {
        let bound = self.bound.as_mut().ok_or(Error::NotInitialized)?;
        let input = single(inputs, "activation", "input")?;
        let output = single(outputs, "activation", "output")?;

        if input.desc() != output.desc() {
            return Err(Error::shape(format!(
                "activation output {:?} must match its input {:?}",
                output.desc(),
                input.desc()
            )));
        }
        bound.count = input.desc().size();
        Ok(())
    }

    fn run(&mut self, inputs: &[Tensor], outputs: &[Tensor]) -> Result<(), Error> {
        let bound = self.bound.as_ref().ok_or(Error::NotInitialized)?;
        let input = single(inputs, "activation", "input")?;
        let output = single(outputs, "activation", "output")?;

        bound.ctx.backend().relu_forward(
            bound.ctx.stream(),
            bound.count,
            input.data().handle(),
            output.data().handle(),
        )?;
        Ok(())
    }
}
