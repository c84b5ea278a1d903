use crate::error::Error;
use std::fmt::{Debug, Formatter};

/// Discriminator identifying which computation a graph node performs.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum OperatorKind {
    Convolution,
    Convolution3d,
    Relu,
}

/// Immutable convolution parameters, fixed at model-load time.
///
/// All spatial triples are ordered (depth, height, width); 2-d nodes carry a
/// unit depth axis. Invariant: `groups` divides both the input and output
/// channel counts of the tensors the node is bound to.
#[derive(Clone, Debug)]
pub struct ConvConfig {
    pub kernel: [usize; 3],
    pub stride: [usize; 3],
    pub padding: [usize; 3],
    pub dilation: [usize; 3],
    pub groups: usize,
    pub bias: bool,
}

impl ConvConfig {
    pub fn new_2d(
        kernel: [usize; 2],
        stride: [usize; 2],
        padding: [usize; 2],
        dilation: [usize; 2],
    ) -> Self {
        ConvConfig {
            kernel: [1, kernel[0], kernel[1]],
            stride: [1, stride[0], stride[1]],
            padding: [0, padding[0], padding[1]],
            dilation: [1, dilation[0], dilation[1]],
            groups: 1,
            bias: false,
        }
    }

    pub fn new_3d(
        kernel: [usize; 3],
        stride: [usize; 3],
        padding: [usize; 3],
        dilation: [usize; 3],
    ) -> Self {
        ConvConfig {
            kernel,
            stride,
            padding,
            dilation,
            groups: 1,
            bias: false,
        }
    }

    pub fn with_groups(mut self, groups: usize) -> Self {
        self.groups = groups;
        self
    }

    pub fn with_bias(mut self) -> Self {
        self.bias = true;
        self
    }

    /// Filter element count implied by this config and the bound channels.
    pub fn weight_size(&self, input_c: usize, output_c: usize) -> usize {
        output_c * (input_c / self.groups) * self.kernel.iter().product::<usize>()
    }
}

/// Per-node parameters, a closed set keyed by operator kind. The accelerator
/// converts to its own variant exactly once, at initialization, and a kind
/// mismatch is a configuration error rather than an unchecked cast.
#[derive(Clone, Debug)]
pub enum OperatorConfig {
    Convolution(ConvConfig),
    Relu,
}

impl OperatorConfig {
    pub fn as_conv(&self) -> Result<&ConvConfig, Error> {
        match self {
            OperatorConfig::Convolution(conv) => Ok(conv),
            other => Err(Error::config(format!(
                "operator config {:?} is not a convolution",
                other
            ))),
        }
    }
}

/// Trained weights for one convolution node, host-resident until staged.
#[derive(Clone)]
pub struct ConvResource {
    pub weights: Vec<f32>,
    pub bias: Option<Vec<f32>>,
}

impl Debug for ConvResource {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ConvResource {{ weights: {}, bias: {:?} }}",
            self.weights.len(),
            self.bias.as_ref().map(Vec::len)
        )
    }
}

/// Trained parameters for one graph node, keyed like [`OperatorConfig`].
#[derive(Clone, Debug)]
pub enum OperatorResource {
    Convolution(ConvResource),
    None,
}

impl OperatorResource {
    pub fn as_conv(&self) -> Result<&ConvResource, Error> {
        match self {
            OperatorResource::Convolution(res) => Ok(res),
            OperatorResource::None => {
                Err(Error::config("convolution accelerator requires a weight resource"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ConvConfig, OperatorConfig, OperatorResource};
    use crate::error::Error;

    #[test]
    fn new_2d_pads_the_depth_axis() {
        let config = ConvConfig::new_2d([3, 3], [1, 1], [1, 1], [1, 1]);
        assert_eq!(config.kernel, [1, 3, 3]);
        assert_eq!(config.stride, [1, 1, 1]);
        assert_eq!(config.padding, [0, 1, 1]);
        assert_eq!(config.groups, 1);
        assert!(!config.bias);
    }

    #[test]
    fn weight_size_accounts_for_groups() {
        let config = ConvConfig::new_2d([3, 3], [1, 1], [0, 0], [1, 1]).with_groups(2);
        // 4 output channels, 6 / 2 input channels per group, 1x3x3 kernel
        assert_eq!(config.weight_size(6, 4), 4 * 3 * 9);
    }

    #[test]
    fn kind_mismatch_is_a_config_error() {
        assert!(matches!(
            OperatorConfig::Relu.as_conv(),
            Err(Error::Config { .. })
        ));
        assert!(matches!(
            OperatorResource::None.as_conv(),
            Err(Error::Config { .. })
        ));
    }
}
