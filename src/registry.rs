use crate::acc::conv::ConvAccelerator;
use crate::acc::relu::ReluAccelerator;
use crate::acc::{Accelerator, AcceleratorInstance};
use crate::device::DeviceKind;
use crate::error::Error;
use crate::ops::OperatorKind;
use std::collections::hash_map::Entry;
use std::collections::HashMap;

pub type AcceleratorFactory = fn() -> Box<dyn Accelerator>;

/// Write-once-then-read-many mapping from (device, operator kind) to the
/// factory producing a fresh accelerator for one graph node. Built explicitly
/// at startup and passed by reference to the graph builder; a duplicate
/// registration is surfaced as a startup error, never silently overwritten.
pub struct Registry {
    factories: HashMap<(DeviceKind, OperatorKind), AcceleratorFactory>,
}

fn conv_factory() -> Box<dyn Accelerator> {
    Box::<ConvAccelerator>::default()
}

fn relu_factory() -> Box<dyn Accelerator> {
    Box::<ReluAccelerator>::default()
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            factories: HashMap::new(),
        }
    }

    /// Every accelerator compiled into this build.
    pub fn with_builtins() -> Self {
        let mut registry = Registry::new();
        // the convolution accelerator serves both the 2-d and 3-d kinds
        for kind in [OperatorKind::Convolution, OperatorKind::Convolution3d] {
            registry
                .register(DeviceKind::Native, kind, conv_factory)
                .expect("builtin kinds are distinct");
        }
        registry
            .register(DeviceKind::Native, OperatorKind::Relu, relu_factory)
            .expect("builtin kinds are distinct");
        registry
    }

    pub fn register(
        &mut self,
        device: DeviceKind,
        kind: OperatorKind,
        factory: AcceleratorFactory,
    ) -> Result<(), Error> {
        match self.factories.entry((device, kind)) {
            Entry::Occupied(_) => Err(Error::config(format!(
                "duplicate accelerator registration for {:?} on {:?}",
                kind, device
            ))),
            Entry::Vacant(entry) => {
                log::trace!("registered accelerator for {:?} on {:?}", kind, device);
                entry.insert(factory);
                Ok(())
            }
        }
    }

    pub fn find(&self, device: DeviceKind, kind: OperatorKind) -> Result<AcceleratorFactory, Error> {
        self.factories
            .get(&(device, kind))
            .copied()
            .ok_or(Error::UnsupportedOperator { device, kind })
    }

    /// Fresh, still-uninitialized accelerator for one graph node.
    pub fn build(&self, device: DeviceKind, kind: OperatorKind) -> Result<AcceleratorInstance, Error> {
        Ok(AcceleratorInstance::new(self.find(device, kind)?()))
    }
}

impl Default for Registry {
    fn default() -> Self {
        Registry::new()
    }
}
