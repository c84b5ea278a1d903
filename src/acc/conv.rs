use crate::acc::{single, Accelerator};
use crate::device::{
    Buffer, ConvAlgorithm, ConvDesc, ConvForwardArgs, DeviceContext, FilterDesc, NdDesc,
};
use crate::error::Error;
use crate::ops::{OperatorConfig, OperatorResource};
use crate::tensor::Tensor;
use itertools::Itertools;
use std::sync::Arc;

/// Convolution accelerator, the hardest instance of the contract: it stages
/// weights once at init, rebuilds shape-dependent descriptors and re-selects
/// the forward algorithm on every reshape, and keeps a grow-only scratch
/// workspace so repeated shape oscillations do not thrash the allocator.
#[derive(Default, Debug)]
pub struct ConvAccelerator {
    bound: Option<Bound>,
}

#[derive(Debug)]
struct Bound {
    ctx: Arc<DeviceContext>,
    conv_desc: ConvDesc,
    filter_desc: FilterDesc,
    bias_desc: Option<NdDesc>,
    weights: Buffer,
    bias: Option<Buffer>,
    input_desc: NdDesc,
    output_desc: NdDesc,
    algorithm: Option<ConvAlgorithm>,
    workspace: Option<Buffer>,
    workspace_bytes: usize,
}

impl ConvAccelerator {
    /// Currently allocated workspace size. Never shrinks.
    pub fn workspace_bytes(&self) -> usize {
        self.bound.as_ref().map_or(0, |b| b.workspace_bytes)
    }
}

impl Accelerator for ConvAccelerator {
    fn init(
        &mut self,
        ctx: Arc<DeviceContext>,
        config: &OperatorConfig,
        resource: &OperatorResource,
        inputs: &[Tensor],
        outputs: &[Tensor],
    ) -> Result<(), Error> {
        let config = config.as_conv()?;
        let resource = resource.as_conv()?;
        let input = single(inputs, "convolution", "input")?;
        let output = single(outputs, "convolution", "output")?;

        if config.kernel.contains(&0)
            || config.stride.contains(&0)
            || config.dilation.contains(&0)
            || config.groups == 0
        {
            return Err(Error::config(
                "kernel, stride, dilation and group extents must be positive",
            ));
        }

        let data_type = input.desc().data_type();
        if output.desc().data_type() != data_type {
            return Err(Error::config("input and output element types differ"));
        }

        let [_, in_c, ..] = input.desc().as_ncdhw()?;
        let [_, out_c, ..] = output.desc().as_ncdhw()?;
        if in_c % config.groups != 0 || out_c % config.groups != 0 {
            return Err(Error::config(format!(
                "group count {} does not divide channel counts {} and {}",
                config.groups, in_c, out_c
            )));
        }

        let expected = config.weight_size(in_c, out_c);
        if resource.weights.len() != expected {
            return Err(Error::config(format!(
                "weight resource has {} elements, config implies {}",
                resource.weights.len(),
                expected
            )));
        }

        let conv_desc = ConvDesc {
            padding: config.padding,
            stride: config.stride,
            dilation: config.dilation,
            groups: config.groups,
        };
        let filter_desc = FilterDesc {
            extents: [
                out_c,
                in_c / config.groups,
                config.kernel[0],
                config.kernel[1],
                config.kernel[2],
            ],
        };

        // Staging is synchronous; run assumes the weights are resident. On
        // any failure below, the buffers are still locals and unwind cleanly.
        let weights = ctx.alloc(expected * data_type.byte_size())?;
        weights.write(&resource.weights)?;

        let (bias, bias_desc) = match (config.bias, &resource.bias) {
            (true, Some(values)) => {
                if values.len() != out_c {
                    return Err(Error::config(format!(
                        "bias resource has {} elements, output has {} channels",
                        values.len(),
                        out_c
                    )));
                }
                let buffer = ctx.alloc(out_c * data_type.byte_size())?;
                buffer.write(values)?;
                let desc = NdDesc {
                    extents: [1, out_c, 1, 1, 1],
                    data_type,
                };
                (Some(buffer), Some(desc))
            }
            (false, None) => (None, None),
            (true, None) => {
                return Err(Error::config("bias flag is set but the resource carries no bias"))
            }
            (false, Some(_)) => {
                return Err(Error::config("resource carries a bias but the bias flag is not set"))
            }
        };

        let input_desc = NdDesc {
            extents: input.desc().as_ncdhw()?,
            data_type,
        };
        let output_desc = NdDesc {
            extents: output.desc().as_ncdhw()?,
            data_type,
        };

        self.bound = Some(Bound {
            ctx,
            conv_desc,
            filter_desc,
            bias_desc,
            weights,
            bias,
            input_desc,
            output_desc,
            algorithm: None,
            workspace: None,
            workspace_bytes: 0,
        });

        // A successful init must leave the instance run-ready.
        self.reshape(inputs, outputs)
    }

    fn reshape(&mut self, inputs: &[Tensor], outputs: &[Tensor]) -> Result<(), Error> {
        let bound = self.bound.as_mut().ok_or(Error::NotInitialized)?;
        let input = single(inputs, "convolution", "input")?;
        let output = single(outputs, "convolution", "output")?;

        let data_type = input.desc().data_type();
        let input_desc = NdDesc {
            extents: input.desc().as_ncdhw()?,
            data_type,
        };

        let backend = bound.ctx.backend();
        let derived = backend.conv_output_extents(&bound.conv_desc, &input_desc, &bound.filter_desc)?;
        let assigned = output.desc().as_ncdhw()?;
        if derived != assigned {
            return Err(Error::shape(format!(
                "derived output extents [{}] disagree with the assigned tensor [{}]",
                derived.iter().join(", "),
                assigned.iter().join(", ")
            )));
        }
        let output_desc = NdDesc {
            extents: derived,
            data_type,
        };

        let algorithm =
            backend.conv_algorithm(&bound.conv_desc, &input_desc, &bound.filter_desc, &output_desc)?;
        let needed = backend.conv_workspace_size(
            &bound.conv_desc,
            &input_desc,
            &bound.filter_desc,
            &output_desc,
            algorithm,
        )?;
        log::debug!(
            "convolution reshape: algorithm {:?}, workspace {} bytes",
            algorithm,
            needed
        );

        // The workspace only ever grows; shape oscillations reuse the largest
        // buffer seen so far.
        if needed > bound.workspace_bytes {
            bound.workspace = None;
            bound.workspace = Some(bound.ctx.alloc(needed)?);
            bound.workspace_bytes = needed;
        }

        bound.input_desc = input_desc;
        bound.output_desc = output_desc;
        bound.algorithm = Some(algorithm);
        Ok(())
    }

    fn run(&mut self, inputs: &[Tensor], outputs: &[Tensor]) -> Result<(), Error> {
        let bound = self.bound.as_ref().ok_or(Error::NotInitialized)?;
        let algorithm = bound.algorithm.ok_or(Error::NotInitialized)?;
        let input = single(inputs, "convolution", "input")?;
        let output = single(outputs, "convolution", "output")?;

        let backend = bound.ctx.backend();
        backend.conv_forward(
            bound.ctx.stream(),
            ConvForwardArgs {
                conv: &bound.conv_desc,
                input_desc: &bound.input_desc,
                filter_desc: &bound.filter_desc,
                output_desc: &bound.output_desc,
                algorithm,
                input: input.data().handle(),
                weights: bound.weights.handle(),
                workspace: bound.workspace.as_ref().map(|w| w.handle()),
                workspace_bytes: bound.workspace_bytes,
                output: output.data().handle(),
            },
        )?;

        if let (Some(bias), Some(bias_desc)) = (&bound.bias, &bound.bias_desc) {
            backend.add_channel_bias(
                bound.ctx.stream(),
                bias_desc,
                bias.handle(),
                &bound.output_desc,
                output.data().handle(),
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::native::NativeBackend;
    use crate::device::{Backend, DeviceError, DeviceKind, Stream};
    use crate::ops::{ConvConfig, ConvResource};
    use crate::tensor::{DataType, TensorDesc};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Device-layer double: delegates to the native backend while recording
    /// allocation sizes, optionally failing after a scripted number of
    /// allocations and overriding reported workspace requirements.
    struct TrackingBackend {
        inner: NativeBackend,
        allocs: Mutex<Vec<usize>>,
        allow: Mutex<Option<usize>>,
        workspace_script: Mutex<VecDeque<usize>>,
    }

    impl TrackingBackend {
        fn new() -> Arc<Self> {
            Arc::new(TrackingBackend {
                inner: NativeBackend::default(),
                allocs: Mutex::new(Vec::new()),
                allow: Mutex::new(None),
                workspace_script: Mutex::new(VecDeque::new()),
            })
        }

        fn allow_allocs(&self, n: usize) {
            *self.allow.lock().unwrap() = Some(n);
        }

        fn script_workspace(&self, sizes: &[usize]) {
            self.workspace_script.lock().unwrap().extend(sizes);
        }

        fn alloc_sizes(&self) -> Vec<usize> {
            self.allocs.lock().unwrap().clone()
        }

        fn live(&self) -> usize {
            self.inner.live_buffers()
        }
    }

    impl Backend for TrackingBackend {
        fn kind(&self) -> DeviceKind {
            self.inner.kind()
        }

        fn alloc(&self, bytes: usize) -> Result<u64, DeviceError> {
            let mut allow = self.allow.lock().unwrap();
            if let Some(remaining) = allow.as_mut() {
                if *remaining == 0 {
                    return Err(DeviceError::Alloc { bytes });
                }
                *remaining -= 1;
            }
            self.allocs.lock().unwrap().push(bytes);
            self.inner.alloc(bytes)
        }

        fn free(&self, handle: u64) -> Result<(), DeviceError> {
            self.inner.free(handle)
        }

        fn write(&self, handle: u64, data: &[f32]) -> Result<(), DeviceError> {
            self.inner.write(handle, data)
        }

        fn read(&self, handle: u64) -> Result<Vec<f32>, DeviceError> {
            self.inner.read(handle)
        }

        fn conv_output_extents(
            &self,
            conv: &ConvDesc,
            input: &NdDesc,
            filter: &FilterDesc,
        ) -> Result<[usize; 5], DeviceError> {
            self.inner.conv_output_extents(conv, input, filter)
        }

        fn conv_algorithm(
            &self,
            conv: &ConvDesc,
            input: &NdDesc,
            filter: &FilterDesc,
            output: &NdDesc,
        ) -> Result<ConvAlgorithm, DeviceError> {
            self.inner.conv_algorithm(conv, input, filter, output)
        }

        fn conv_workspace_size(
            &self,
            conv: &ConvDesc,
            input: &NdDesc,
            filter: &FilterDesc,
            output: &NdDesc,
            algorithm: ConvAlgorithm,
        ) -> Result<usize, DeviceError> {
            if let Some(size) = self.workspace_script.lock().unwrap().pop_front() {
                return Ok(size);
            }
            self.inner
                .conv_workspace_size(conv, input, filter, output, algorithm)
        }

        fn conv_forward(
            &self,
            stream: &Stream,
            args: ConvForwardArgs<'_>,
        ) -> Result<(), DeviceError> {
            self.inner.conv_forward(stream, args)
        }

        fn add_channel_bias(
            &self,
            stream: &Stream,
            bias_desc: &NdDesc,
            bias: u64,
            output_desc: &NdDesc,
            output: u64,
        ) -> Result<(), DeviceError> {
            self.inner
                .add_channel_bias(stream, bias_desc, bias, output_desc, output)
        }

        fn relu_forward(
            &self,
            stream: &Stream,
            count: usize,
            input: u64,
            output: u64,
        ) -> Result<(), DeviceError> {
            self.inner.relu_forward(stream, count, input, output)
        }
    }

    fn ctx() -> Arc<DeviceContext> {
        Arc::new(DeviceContext::new(NativeBackend::new()))
    }

    fn ones_tensor(ctx: &DeviceContext, extents: [usize; 4]) -> Tensor {
        let desc = TensorDesc::new(extents, DataType::Float);
        let data = vec![1.0f32; desc.size()];
        Tensor::from_slice(ctx, desc, &data).unwrap()
    }

    fn unit_conv(bias: bool) -> (OperatorConfig, OperatorResource) {
        let mut config = ConvConfig::new_2d([3, 3], [1, 1], [1, 1], [1, 1]);
        let mut resource = ConvResource {
            weights: vec![1.0; 9],
            bias: None,
        };
        if bias {
            config = config.with_bias();
            resource.bias = Some(vec![1.0]);
        }
        (
            OperatorConfig::Convolution(config),
            OperatorResource::Convolution(resource),
        )
    }

    #[test]
    fn run_ready_right_after_init() {
        let ctx = ctx();
        let (config, resource) = unit_conv(false);
        let input = ones_tensor(&ctx, [1, 1, 3, 3]);
        let output = Tensor::zeros(&ctx, TensorDesc::new([1, 1, 3, 3], DataType::Float)).unwrap();

        let mut acc = ConvAccelerator::default();
        acc.init(
            ctx.clone(),
            &config,
            &resource,
            std::slice::from_ref(&input),
            std::slice::from_ref(&output),
        )
        .unwrap();
        // no explicit reshape in between
        acc.run(std::slice::from_ref(&input), std::slice::from_ref(&output))
            .unwrap();

        assert_eq!(
            output.to_vec().unwrap(),
            vec![4.0, 6.0, 4.0, 6.0, 9.0, 6.0, 4.0, 6.0, 4.0]
        );
    }

    #[test]
    fn bias_adds_one_per_element() {
        let ctx = ctx();
        let input = ones_tensor(&ctx, [1, 1, 3, 3]);
        let output = Tensor::zeros(&ctx, TensorDesc::new([1, 1, 3, 3], DataType::Float)).unwrap();

        let (config, resource) = unit_conv(false);
        let mut plain = ConvAccelerator::default();
        plain
            .init(ctx.clone(), &config, &resource, std::slice::from_ref(&input), std::slice::from_ref(&output))
            .unwrap();
        plain
            .run(std::slice::from_ref(&input), std::slice::from_ref(&output))
            .unwrap();
        let without = output.to_vec().unwrap();

        let (config, resource) = unit_conv(true);
        let mut biased = ConvAccelerator::default();
        biased
            .init(ctx.clone(), &config, &resource, std::slice::from_ref(&input), std::slice::from_ref(&output))
            .unwrap();
        biased
            .run(std::slice::from_ref(&input), std::slice::from_ref(&output))
            .unwrap();
        let with = output.to_vec().unwrap();

        for (a, b) in without.iter().zip(with.iter()) {
            assert_eq!(*b, *a + 1.0);
        }
    }

    #[test]
    fn weight_size_mismatch_allocates_nothing() {
        let backend = TrackingBackend::new();
        let ctx = Arc::new(DeviceContext::new(backend.clone()));
        let input = ones_tensor(&ctx, [1, 1, 3, 3]);
        let output = Tensor::zeros(&ctx, TensorDesc::new([1, 1, 3, 3], DataType::Float)).unwrap();
        let before = backend.alloc_sizes().len();

        let config = OperatorConfig::Convolution(ConvConfig::new_2d([3, 3], [1, 1], [1, 1], [1, 1]));
        let resource = OperatorResource::Convolution(ConvResource {
            weights: vec![1.0; 8], // one element short
            bias: None,
        });

        let mut acc = ConvAccelerator::default();
        let err = acc
            .init(ctx, &config, &resource, std::slice::from_ref(&input), std::slice::from_ref(&output))
            .unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
        assert_eq!(backend.alloc_sizes().len(), before);
    }

    #[test]
    fn failed_staging_leaks_nothing() {
        let backend = TrackingBackend::new();
        let ctx = Arc::new(DeviceContext::new(backend.clone()));
        let input = ones_tensor(&ctx, [1, 1, 3, 3]);
        let output = Tensor::zeros(&ctx, TensorDesc::new([1, 1, 3, 3], DataType::Float)).unwrap();
        let live_before = backend.live();

        // weights stage, then the bias allocation fails
        backend.allow_allocs(1);
        let (config, resource) = unit_conv(true);
        let mut acc = ConvAccelerator::default();
        let err = acc
            .init(ctx, &config, &resource, std::slice::from_ref(&input), std::slice::from_ref(&output))
            .unwrap_err();
        assert!(matches!(err, Error::Device(DeviceError::Alloc { .. })));
        assert_eq!(backend.live(), live_before);
    }

    #[test]
    fn workspace_grows_monotonically() {
        let backend = TrackingBackend::new();
        let ctx = Arc::new(DeviceContext::new(backend.clone()));
        let input = ones_tensor(&ctx, [1, 1, 3, 3]);
        let output = Tensor::zeros(&ctx, TensorDesc::new([1, 1, 3, 3], DataType::Float)).unwrap();

        backend.script_workspace(&[1000, 500, 2000]);
        let (config, resource) = unit_conv(false);
        let mut acc = ConvAccelerator::default();
        acc.init(ctx, &config, &resource, std::slice::from_ref(&input), std::slice::from_ref(&output))
            .unwrap();
        assert_eq!(acc.workspace_bytes(), 1000);

        acc.reshape(std::slice::from_ref(&input), std::slice::from_ref(&output))
            .unwrap();
        assert_eq!(acc.workspace_bytes(), 1000); // 500 fits, buffer retained

        acc.reshape(std::slice::from_ref(&input), std::slice::from_ref(&output))
            .unwrap();
        assert_eq!(acc.workspace_bytes(), 2000);

        let workspace_allocs: Vec<usize> = backend
            .alloc_sizes()
            .into_iter()
            .filter(|b| *b == 1000 || *b == 500 || *b == 2000)
            .collect();
        assert_eq!(workspace_allocs, vec![1000, 2000]);
    }

    #[test]
    fn identical_reshape_is_idempotent() {
        let backend = TrackingBackend::new();
        let ctx = Arc::new(DeviceContext::new(backend.clone()));
        let input = ones_tensor(&ctx, [1, 1, 3, 3]);
        let output = Tensor::zeros(&ctx, TensorDesc::new([1, 1, 3, 3], DataType::Float)).unwrap();

        let (config, resource) = unit_conv(false);
        let mut acc = ConvAccelerator::default();
        acc.init(ctx, &config, &resource, std::slice::from_ref(&input), std::slice::from_ref(&output))
            .unwrap();
        let allocs = backend.alloc_sizes().len();
        let workspace = acc.workspace_bytes();

        acc.reshape(std::slice::from_ref(&input), std::slice::from_ref(&output))
            .unwrap();
        assert_eq!(backend.alloc_sizes().len(), allocs);
        assert_eq!(acc.workspace_bytes(), workspace);
    }

    #[test]
    fn derived_shape_disagreement_is_fatal() {
        let ctx = ctx();
        let (config, resource) = unit_conv(false);
        let input = ones_tensor(&ctx, [1, 1, 3, 3]);
        // executor pre-allocated the wrong extents
        let output = Tensor::zeros(&ctx, TensorDesc::new([1, 1, 4, 4], DataType::Float)).unwrap();

        let mut acc = ConvAccelerator::default();
        let err = acc
            .init(ctx, &config, &resource, std::slice::from_ref(&input), std::slice::from_ref(&output))
            .unwrap_err();
        assert!(matches!(err, Error::Shape { .. }));
    }

    #[test]
    fn config_kind_mismatch_fails_cleanly() {
        let ctx = ctx();
        let input = ones_tensor(&ctx, [1, 1, 3, 3]);
        let output = Tensor::zeros(&ctx, TensorDesc::new([1, 1, 3, 3], DataType::Float)).unwrap();

        let mut acc = ConvAccelerator::default();
        let err = acc
            .init(
                ctx,
                &OperatorConfig::Relu,
                &OperatorResource::None,
                std::slice::from_ref(&input),
                std::slice::from_ref(&output),
            )
            .unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }

    #[test]
    fn bias_flag_and_resource_must_agree() {
        let ctx = ctx();
        let input = ones_tensor(&ctx, [1, 1, 3, 3]);
        let output = Tensor::zeros(&ctx, TensorDesc::new([1, 1, 3, 3], DataType::Float)).unwrap();

        let config = OperatorConfig::Convolution(
            ConvConfig::new_2d([3, 3], [1, 1], [1, 1], [1, 1]).with_bias(),
        );
        let resource = OperatorResource::Convolution(ConvResource {
            weights: vec![1.0; 9],
            bias: None,
        });
        let mut acc = ConvAccelerator::default();
        assert!(matches!(
            acc.init(ctx, &config, &resource, std::slice::from_ref(&input), std::slice::from_ref(&output)),
            Err(Error::Config { .. })
        ));
    }

    #[test]
    fn batch_change_reshapes_and_runs() {
        let ctx = ctx();
        let (config, resource) = unit_conv(false);
        let input = ones_tensor(&ctx, [1, 1, 3, 3]);
        let output = Tensor::zeros(&ctx, TensorDesc::new([1, 1, 3, 3], DataType::Float)).unwrap();

        let mut acc = ConvAccelerator::default();
        acc.init(ctx.clone(), &config, &resource, std::slice::from_ref(&input), std::slice::from_ref(&output))
            .unwrap();

        let input = ones_tensor(&ctx, [2, 1, 3, 3]);
        let output = Tensor::zeros(&ctx, TensorDesc::new([2, 1, 3, 3], DataType::Float)).unwrap();
        acc.reshape(std::slice::from_ref(&input), std::slice::from_ref(&output))
            .unwrap();
        acc.run(std::slice::from_ref(&input), std::slice::from_ref(&output))
            .unwrap();

        let result = output.to_vec().unwrap();
        assert_eq!(result.len(), 18);
        // both batch elements see the same 3x3 stencil sums
        assert_eq!(&result[..9], &result[9..]);
        assert_eq!(result[4], 9.0);
    }

    #[test]
    fn grouped_convolution_routes_channels() {
        let ctx = ctx();
        // two groups, each 1 -> 1 channels with a 1x1 kernel scaling by 2 and 3
        let config = OperatorConfig::Convolution(
            ConvConfig::new_2d([1, 1], [1, 1], [0, 0], [1, 1]).with_groups(2),
        );
        let resource = OperatorResource::Convolution(ConvResource {
            weights: vec![2.0, 3.0],
            bias: None,
        });

        let desc = TensorDesc::new([1, 2, 2, 2], DataType::Float);
        let input = Tensor::from_slice(&ctx, desc.clone(), &[1.0; 8]).unwrap();
        let output = Tensor::zeros(&ctx, desc).unwrap();

        let mut acc = ConvAccelerator::default();
        acc.init(ctx, &config, &resource, std::slice::from_ref(&input), std::slice::from_ref(&output))
            .unwrap();
        acc.run(std::slice::from_ref(&input), std::slice::from_ref(&output))
            .unwrap();

        assert_eq!(
            output.to_vec().unwrap(),
            vec![2.0, 2.0, 2.0, 2.0, 3.0, 3.0, 3.0, 3.0]
        );
    }
}
