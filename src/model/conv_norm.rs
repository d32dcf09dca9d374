use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        BatchNorm, BatchNormConfig, PaddingConfig2d,
    },
    tensor::{self, backend::Backend, Tensor},
};

#[derive(Module, Debug, Clone, Default)]
pub struct ReLU6 {}

impl ReLU6 {
    pub fn forward<B: Backend, const D: usize>(&self, input: Tensor<B, D>) -> Tensor<B, D> {
        tensor::activation::relu(input).clamp_max(6)
    }
}

/// Convolution followed by batch normalization and ReLU6.
#[derive(Module, Debug)]
pub struct Conv2dNormActivation<B: Backend> {
    conv: Conv2d<B>,
    norm: BatchNorm<B, 2>,
    activation: ReLU6,
}

#[derive(Config, Debug)]
pub struct Conv2dNormActivationConfig {
    pub in_channels: usize,
    pub out_channels: usize,

    #[config(default = "3")]
    pub kernel_size: usize,

    #[config(default = "1")]
    pub stride: usize,

    #[config(default = "1")]
    pub groups: usize,

    #[config(default = "1")]
    pub dilation: usize,
}

impl Conv2dNormActivationConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Conv2dNormActivation<B> {
        // Same padding for odd kernels
        let padding = (self.kernel_size - 1) / 2 * self.dilation;

        Conv2dNormActivation {
            conv: Conv2dConfig::new(
                [self.in_channels, self.out_channels],
                [self.kernel_size, self.kernel_size],
            )
            .with_padding(PaddingConfig2d::Explicit(padding, padding))
            .with_stride([self.stride, self.stride])
            .with_bias(false)
            .with_dilation([self.dilation, self.dilation])
            .with_groups(self.groups)
            .init(device),
            norm: BatchNormConfig::new(self.out_channels).init(device),
            activation: ReLU6 {},
        }
    }
}

impl<B: Backend> Conv2dNormActivation<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(input);
        let x = self.norm.forward(x);
        self.activation.forward(x)
    }

    pub(crate) fn collect_shapes(&self, shapes: &mut Vec<Vec<usize>>) {
        shapes.push(self.conv.weight.dims().to_vec());
        norm_shapes(&self.norm, shapes);
    }

    pub(crate) fn with_norm_momentum(mut self, momentum: f64) -> Self {
        self.norm.momentum = momentum;
        self
    }

    pub(crate) fn norm_momentum(&self) -> f64 {
        self.norm.momentum
    }
}

/// Learnable parameters and running statistics of a batch norm layer.
pub(crate) fn norm_shapes<B: Backend>(norm: &BatchNorm<B, 2>, shapes: &mut Vec<Vec<usize>>) {
    shapes.push(norm.gamma.dims().to_vec());
    shapes.push(norm.beta.dims().to_vec());
    shapes.push(norm.running_mean.value().dims().to_vec());
    shapes.push(norm.running_var.value().dims().to_vec());
}
