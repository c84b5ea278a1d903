//! Reference backend executing on host memory. It plays the role a vendor
//! driver + math-library pair plays for a real device: buffers live behind
//! opaque handles and every math entry point goes through the [`Backend`]
//! trait, so the accelerator layer cannot tell it apart from real hardware.

use crate::device::{
    Backend, ConvAlgorithm, ConvDesc, ConvForwardArgs, DeviceError, DeviceKind, FilterDesc,
    NdDesc, Stream,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Default)]
pub struct NativeBackend {
    buffers: Mutex<HashMap<u64, Arc<Mutex<Vec<f32>>>>>,
    next_handle: AtomicU64,
}

impl NativeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(NativeBackend::default())
    }

    fn buffer(&self, handle: u64) -> Result<Arc<Mutex<Vec<f32>>>, DeviceError> {
        self.buffers
            .lock()
            .unwrap()
            .get(&handle)
            .cloned()
            .ok_or(DeviceError::InvalidHandle(handle))
    }

    /// Number of live allocations; resource-discipline tests watch this.
    pub fn live_buffers(&self) -> usize {
        self.buffers.lock().unwrap().len()
    }
}

/// Output extent along one spatial axis, `None` when the dilated kernel does
/// not fit the padded input.
fn conv_out(input: usize, kernel: usize, stride: usize, padding: usize, dilation: usize) -> Option<usize> {
    let effective = dilation * (kernel - 1) + 1;
    (input + 2 * padding)
        .checked_sub(effective)
        .map(|rest| rest / stride + 1)
}

impl Backend for NativeBackend {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Native
    }

    fn alloc(&self, bytes: usize) -> Result<u64, DeviceError> {
        let elements = (bytes + 3) / 4;
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.buffers
            .lock()
            .unwrap()
            .insert(handle, Arc::new(Mutex::new(vec![0.0; elements])));
        Ok(handle)
    }

    fn free(&self, handle: u64) -> Result<(), DeviceError> {
        self.buffers
            .lock()
            .unwrap()
            .remove(&handle)
            .map(|_| ())
            .ok_or(DeviceError::InvalidHandle(handle))
    }

    fn write(&self, handle: u64, data: &[f32]) -> Result<(), DeviceError> {
        let buffer = self.buffer(handle)?;
        let mut buffer = buffer.lock().unwrap();
        if data.len() > buffer.len() {
            return Err(DeviceError::execution(format!(
                "write of {} elements overruns a buffer of {}",
                data.len(),
                buffer.len()
            )));
        }
        buffer[..data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read(&self, handle: u64) -> Result<Vec<f32>, DeviceError> {
        let buffer = self.buffer(handle)?;
        let buffer = buffer.lock().unwrap();
        Ok(buffer.clone())
    }

    fn conv_output_extents(
        &self,
        conv: &ConvDesc,
        input: &NdDesc,
        filter: &FilterDesc,
    ) -> Result<[usize; 5], DeviceError> {
        let kernel = filter.kernel();
        if kernel.contains(&0) || conv.stride.contains(&0) || conv.dilation.contains(&0) {
            return Err(DeviceError::execution(
                "kernel, stride and dilation extents must be positive",
            ));
        }

        let [n, c, d, h, w] = input.extents;
        if c != filter.channels_per_group() * conv.groups {
            return Err(DeviceError::execution(format!(
                "input has {} channels, filter expects {} x {} groups",
                c,
                filter.channels_per_group(),
                conv.groups
            )));
        }

        let mut out = [n, filter.output_channels(), 0, 0, 0];
        for (axis, extent) in [d, h, w].into_iter().enumerate() {
            out[axis + 2] = conv_out(
                extent,
                kernel[axis],
                conv.stride[axis],
                conv.padding[axis],
                conv.dilation[axis],
            )
            .ok_or_else(|| {
                DeviceError::execution(format!(
                    "kernel extent {} does not fit input extent {}",
                    kernel[axis], extent
                ))
            })?;
        }
        Ok(out)
    }

    fn conv_algorithm(
        &self,
        _conv: &ConvDesc,
        _input: &NdDesc,
        filter: &FilterDesc,
        _output: &NdDesc,
    ) -> Result<ConvAlgorithm, DeviceError> {
        // Prefer-fastest policy with no workspace bound: the GEMM path wins
        // whenever the kernel is non-trivial.
        let kernel_volume: usize = filter.kernel().iter().product();
        Ok(if kernel_volume == 1 {
            ConvAlgorithm::Direct
        } else {
            ConvAlgorithm::Im2colGemm
        })
    }

    fn conv_workspace_size(
        &self,
        _conv: &ConvDesc,
        input: &NdDesc,
        filter: &FilterDesc,
        output: &NdDesc,
        algorithm: ConvAlgorithm,
    ) -> Result<usize, DeviceError> {
        match algorithm {
            ConvAlgorithm::Direct => Ok(0),
            ConvAlgorithm::Im2colGemm => {
                let kernel_volume: usize = filter.kernel().iter().product();
                let rows = filter.channels_per_group() * kernel_volume;
                let cols: usize = output.extents[2..].iter().product();
                Ok(rows * cols * input.data_type.byte_size())
            }
        }
    }

    fn conv_forward(&self, _stream: &Stream, args: ConvForwardArgs<'_>) -> Result<(), DeviceError> {
        if args.input == args.output {
            return Err(DeviceError::execution("in-place convolution is not supported"));
        }

        let input = self.buffer(args.input)?;
        let weights = self.buffer(args.weights)?;
        let output = self.buffer(args.output)?;
        let input = input.lock().unwrap();
        let weights = weights.lock().unwrap();
        let mut output = output.lock().unwrap();

        if input.len() < args.input_desc.size() || output.len() < args.output_desc.size() {
            return Err(DeviceError::execution(
                "tensor buffer is smaller than its descriptor implies",
            ));
        }

        match args.algorithm {
            ConvAlgorithm::Direct => {
                conv_direct(
                    args.conv,
                    args.input_desc,
                    args.filter_desc,
                    args.output_desc,
                    &input,
                    &weights,
                    &mut output,
                );
            }
            ConvAlgorithm::Im2colGemm => {
                let kernel_volume: usize = args.filter_desc.kernel().iter().product();
                let rows = args.filter_desc.channels_per_group() * kernel_volume;
                let cols: usize = args.output_desc.extents[2..].iter().product();

                let handle = args
                    .workspace
                    .ok_or_else(|| DeviceError::execution("im2col requires a workspace"))?;
                let workspace = self.buffer(handle)?;
                let mut workspace = workspace.lock().unwrap();
                if workspace.len() < rows * cols {
                    return Err(DeviceError::execution(format!(
                        "workspace of {} elements is smaller than the {} required",
                        workspace.len(),
                        rows * cols
                    )));
                }

                conv_im2col(
                    args.conv,
                    args.input_desc,
                    args.filter_desc,
                    args.output_desc,
                    &input,
                    &weights,
                    &mut workspace,
                    &mut output,
                );
            }
        }
        Ok(())
    }

    fn add_channel_bias(
        &self,
        _stream: &Stream,
        bias_desc: &NdDesc,
        bias: u64,
        output_desc: &NdDesc,
        output: u64,
    ) -> Result<(), DeviceError> {
        let [_, channels, ..] = output_desc.extents;
        if bias_desc.extents != [1, channels, 1, 1, 1] {
            return Err(DeviceError::execution(format!(
                "bias descriptor {:?} does not broadcast over {:?}",
                bias_desc.extents, output_desc.extents
            )));
        }

        let bias = self.buffer(bias)?;
        let output = self.buffer(output)?;
        let bias = bias.lock().unwrap();
        let mut output = output.lock().unwrap();

        let [n, _, d, h, w] = output_desc.extents;
        let spatial = d * h * w;
        for b in 0..n {
            for c in 0..channels {
                let base = (b * channels + c) * spatial;
                for i in 0..spatial {
                    output[base + i] += bias[c];
                }
            }
        }
        Ok(())
    }

    fn relu_forward(
        &self,
        _stream: &Stream,
        count: usize,
        input: u64,
        output: u64,
    ) -> Result<(), DeviceError> {
        if input == output {
            let buffer = self.buffer(input)?;
            let mut buffer = buffer.lock().unwrap();
            for x in buffer.iter_mut().take(count) {
                *x = x.max(0.0);
            }
            return Ok(());
        }

        let input = self.buffer(input)?;
        let output = self.buffer(output)?;
        let input = input.lock().unwrap();
        let mut output = output.lock().unwrap();
        if input.len() < count || output.len() < count {
            return Err(DeviceError::execution(
                "tensor buffer is smaller than its descriptor implies",
            ));
        }
        for i in 0..count {
            output[i] = input[i].max(0.0);
        }
        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
fn conv_direct(
    conv: &ConvDesc,
    input: &NdDesc,
    filter: &FilterDesc,
    output: &NdDesc,
    x: &[f32],
    w: &[f32],
    y: &mut [f32],
) {
    let [n, c_in, id, ih, iw] = input.extents;
    let [_, c_out, od, oh, ow] = output.extents;
    let [kd, kh, kw] = filter.kernel();
    let cpg = filter.channels_per_group();
    let opg = c_out / conv.groups;

    for b in 0..n {
        for oc in 0..c_out {
            let group = oc / opg;
            for oz in 0..od {
                for oy in 0..oh {
                    for ox in 0..ow {
                        let mut acc = 0.0f32;
                        for ic in 0..cpg {
                            let c = group * cpg + ic;
                            for fz in 0..kd {
                                let Some(iz) = source_coord(oz, fz, conv.stride[0], conv.padding[0], conv.dilation[0], id) else { continue };
                                for fy in 0..kh {
                                    let Some(iy) = source_coord(oy, fy, conv.stride[1], conv.padding[1], conv.dilation[1], ih) else { continue };
                                    for fx in 0..kw {
                                        let Some(ix) = source_coord(ox, fx, conv.stride[2], conv.padding[2], conv.dilation[2], iw) else { continue };
                                        let xi = (((b * c_in + c) * id + iz) * ih + iy) * iw + ix;
                                        let wi = (((oc * cpg + ic) * kd + fz) * kh + fy) * kw + fx;
                                        acc += x[xi] * w[wi];
                                    }
                                }
                            }
                        }
                        let yi = (((b * c_out + oc) * od + oz) * oh + oy) * ow + ox;
                        y[yi] = acc;
                    }
                }
            }
        }
    }
}

/// Input coordinate feeding output position `o` through filter tap `f`, or
/// `None` when the tap lands in the padding.
fn source_coord(o: usize, f: usize, stride: usize, padding: usize, dilation: usize, extent: usize) -> Option<usize> {
    let padded = o * stride + f * dilation;
    if padded < padding {
        return None;
    }
    let i = padded - padding;
    (i < extent).then_some(i)
}

#[allow(clippy::too_many_arguments)]
fn conv_im2col(
    conv: &ConvDesc,
    input: &NdDesc,
    filter: &FilterDesc,
    output: &NdDesc,
    x: &[f32],
    w: &[f32],
    workspace: &mut [f32],
    y: &mut [f32],
) {
    let [n, c_in, id, ih, iw] = input.extents;
    let [_, c_out, od, oh, ow] = output.extents;
    let [kd, kh, kw] = filter.kernel();
    let cpg = filter.channels_per_group();
    let opg = c_out / conv.groups;
    let kernel_volume = kd * kh * kw;
    let rows = cpg * kernel_volume;
    let cols = od * oh * ow;

    for b in 0..n {
        for group in 0..conv.groups {
            // unfold one (batch, group) slab into the workspace
            for r in 0..rows {
                let ic = r / kernel_volume;
                let rest = r % kernel_volume;
                let fz = rest / (kh * kw);
                let fy = (rest / kw) % kh;
                let fx = rest % kw;
                let c = group * cpg + ic;

                for col in 0..cols {
                    let oz = col / (oh * ow);
                    let oy = (col / ow) % oh;
                    let ox = col % ow;

                    let value = match (
                        source_coord(oz, fz, conv.stride[0], conv.padding[0], conv.dilation[0], id),
                        source_coord(oy, fy, conv.stride[1], conv.padding[1], conv.dilation[1], ih),
                        source_coord(ox, fx, conv.stride[2], conv.padding[2], conv.dilation[2], iw),
                    ) {
                        (Some(iz), Some(iy), Some(ix)) => {
                            x[(((b * c_in + c) * id + iz) * ih + iy) * iw + ix]
                        }
                        _ => 0.0,
                    };
                    workspace[r * cols + col] = value;
                }
            }

            // y[group block] = W_group x col
            for o in 0..opg {
                let oc = group * opg + o;
                let w_row = &w[oc * rows..(oc + 1) * rows];
                for col in 0..cols {
                    let mut acc = 0.0f32;
                    for r in 0..rows {
                        acc += w_row[r] * workspace[r * cols + col];
                    }
                    y[(b * c_out + oc) * cols + col] = acc;
                }
            }
        }
    }
}
