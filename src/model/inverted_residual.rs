use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        BatchNorm, BatchNormConfig, PaddingConfig2d,
    },
    tensor::{backend::Backend, Tensor},
};

use super::conv_norm::{norm_shapes, Conv2dNormActivation, Conv2dNormActivationConfig};

#[derive(Module, Debug)]
pub struct PointWiseLinear<B: Backend> {
    conv: Conv2d<B>,
    norm: BatchNorm<B, 2>,
}

impl<B: Backend> PointWiseLinear<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.norm.forward(self.conv.forward(x))
    }

    fn collect_shapes(&self, shapes: &mut Vec<Vec<usize>>) {
        shapes.push(self.conv.weight.dims().to_vec());
        norm_shapes(&self.norm, shapes);
    }
}

/// [Inverted Residual Block](https://paperswithcode.com/method/inverted-residual-block):
/// pointwise expansion, depthwise convolution and a linear pointwise projection.
#[derive(Module, Debug)]
pub struct InvertedResidual<B: Backend> {
    use_res_connect: bool,
    pw: Option<Conv2dNormActivation<B>>, // pointwise, only when expand ratio != 1
    dw: Conv2dNormActivation<B>,
    pw_linear: PointWiseLinear<B>,
}

/// [InvertedResidual](InvertedResidual) configuration.
#[derive(Config, Debug)]
pub struct InvertedResidualConfig {
    pub inp: usize,
    pub oup: usize,
    pub stride: usize,
    pub expand_ratio: usize,
}

impl InvertedResidualConfig {
    /// Initialize a new [InvertedResidual](InvertedResidual) module.
    pub fn init<B: Backend>(&self, device: &B::Device) -> InvertedResidual<B> {
        let hidden_dim = self.inp * self.expand_ratio;
        let pw = (self.expand_ratio != 1).then(|| {
            Conv2dNormActivationConfig::new(self.inp, hidden_dim)
                .with_kernel_size(1)
                .init(device)
        });
        let dw = Conv2dNormActivationConfig::new(hidden_dim, hidden_dim)
            .with_stride(self.stride)
            .with_groups(hidden_dim)
            .init(device);
        let pw_linear = PointWiseLinear {
            conv: Conv2dConfig::new([hidden_dim, self.oup], [1, 1])
                .with_stride([1, 1])
                .with_padding(PaddingConfig2d::Explicit(0, 0))
                .with_bias(false)
                .init(device),
            norm: BatchNormConfig::new(self.oup).init(device),
        };

        InvertedResidual {
            use_res_connect: self.stride == 1 && self.inp == self.oup,
            pw,
            dw,
            pw_linear,
        }
    }
}

impl<B: Backend> InvertedResidual<B> {
    pub fn forward(&self, x: &Tensor<B, 4>) -> Tensor<B, 4> {
        let mut out = x.clone();
        if let Some(pw) = &self.pw {
            out = pw.forward(out);
        }
        out = self.dw.forward(out);
        out = self.pw_linear.forward(out);

        if self.use_res_connect {
            out = out + x.clone();
        }
        out
    }

    pub(crate) fn collect_shapes(&self, shapes: &mut Vec<Vec<usize>>) {
        if let Some(pw) = &self.pw {
            pw.collect_shapes(shapes);
        }
        self.dw.collect_shapes(shapes);
        self.pw_linear.collect_shapes(shapes);
    }

    pub(crate) fn with_norm_momentum(mut self, momentum: f64) -> Self {
        self.pw = self.pw.map(|pw| pw.with_norm_momentum(momentum));
        self.dw = self.dw.with_norm_momentum(momentum);
        self.pw_linear.norm.momentum = momentum;
        self
    }
}
