use core::cmp::max;

use burn::{
    config::Config,
    module::Module,
    nn::{
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig},
        Dropout, DropoutConfig, Linear, LinearConfig,
    },
    tensor::{backend::Backend, Tensor},
};

use super::{
    conv_norm::{Conv2dNormActivation, Conv2dNormActivationConfig},
    inverted_residual::{InvertedResidual, InvertedResidualConfig},
};

#[cfg(feature = "pretrained")]
use {
    super::weights::{self, WeightsMeta},
    burn::{
        record::{FullPrecisionSettings, Recorder, RecorderError},
        tensor::Device,
    },
    burn_import::pytorch::{LoadArgs, PyTorchFileRecorder},
};

/// Network blocks structure
const INVERTED_RESIDUAL_SETTINGS: [[usize; 4]; 7] = [
    // (t = expansion factor; c = channels; n = num blocks; s = stride)
    // t, c, n, s
    [1, 16, 1, 1],
    [6, 24, 2, 2],
    [6, 32, 3, 2],
    [6, 64, 4, 2],
    [6, 96, 3, 1],
    [6, 160, 3, 2],
    [6, 320, 1, 1],
];
/// Round the number of channels in each layer to be a multiple of this number.
const ROUND_NEAREST: usize = 8;
/// Running statistics momentum of a freshly initialized batch norm layer.
const DEFAULT_NORM_MOMENTUM: f64 = 0.1;

#[derive(Debug, Module)]
pub struct MobileNetV2<B: Backend> {
    features: Vec<ConvBlock<B>>,
    classifier: Classifier<B>,
    avg_pool: AdaptiveAvgPool2d,
}

impl<B: Backend> MobileNetV2<B> {
    /// Class scores (logits) for a batch of normalized images.
    ///
    /// # Shapes
    ///
    /// - input: `[batch_size, 3, height, width]`
    /// - output: `[batch_size, num_classes]`
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 2> {
        let mut x = input;
        for layer in &self.features {
            match layer {
                ConvBlock::InvertedResidual(block) => {
                    x = block.forward(&x);
                }
                ConvBlock::Conv(conv) => {
                    x = conv.forward(x);
                }
            }
        }
        x = self.avg_pool.forward(x);
        // Reshape [B, C, 1, 1] -> [B, C]
        let x = x.flatten(1, 3);

        self.classifier.forward(x)
    }

    /// Number of scores produced by the final linear layer.
    pub fn num_classes(&self) -> usize {
        // Linear weights are stored as [d_input, d_output]
        self.classifier.linear.weight.dims()[1]
    }

    /// Replace the classification head with a freshly initialized linear layer producing
    /// `num_classes` scores. The feature extractor is left untouched.
    pub fn with_classes(mut self, num_classes: usize) -> Self {
        let [last_channel, _] = self.classifier.linear.weight.dims();
        let device = self.classifier.linear.weight.device();
        self.classifier.linear = LinearConfig::new(last_channel, num_classes).init(&device);
        self
    }

    /// Shapes of every parameter and batch norm statistic, in module order.
    ///
    /// Two models with equal shapes accept each other's records.
    pub fn param_shapes(&self) -> Vec<Vec<usize>> {
        let mut shapes = Vec::new();
        for layer in &self.features {
            match layer {
                ConvBlock::InvertedResidual(block) => block.collect_shapes(&mut shapes),
                ConvBlock::Conv(conv) => conv.collect_shapes(&mut shapes),
            }
        }
        shapes.push(self.classifier.linear.weight.dims().to_vec());
        if let Some(bias) = &self.classifier.linear.bias {
            shapes.push(bias.dims().to_vec());
        }
        shapes
    }

    /// Set the momentum of every batch norm running statistic update.
    ///
    /// A momentum of `1 / k` on the `k`-th training forward pass makes the running statistics
    /// the exact average over all passes so far.
    pub fn with_norm_momentum(mut self, momentum: f64) -> Self {
        self.features = self
            .features
            .into_iter()
            .map(|layer| match layer {
                ConvBlock::InvertedResidual(block) => {
                    ConvBlock::InvertedResidual(block.with_norm_momentum(momentum))
                }
                ConvBlock::Conv(conv) => ConvBlock::Conv(conv.with_norm_momentum(momentum)),
            })
            .collect();
        self
    }

    /// Momentum of the batch norm layers, read from the stem.
    pub fn norm_momentum(&self) -> f64 {
        match self.features.first() {
            Some(ConvBlock::Conv(conv)) => conv.norm_momentum(),
            _ => DEFAULT_NORM_MOMENTUM,
        }
    }

    /// Stop tracking gradients for the feature extractor so that only the
    /// classification head is fine-tuned.
    pub fn freeze_backbone(mut self) -> Self {
        self.features = self.features.no_grad();
        self
    }

    /// Load specified pre-trained PyTorch weights into the model.
    #[cfg(feature = "pretrained")]
    fn load_weights(
        model: Self,
        weights: &weights::Weights,
        device: &Device<B>,
    ) -> Result<Self, RecorderError> {
        // Download torch weights
        let torch_weights = weights.download().map_err(|err| {
            RecorderError::Unknown(format!("Could not download weights.\nError: {err}"))
        })?;

        // Load weights from torch state_dict
        let load_args = LoadArgs::new(torch_weights)
            // Map features.{0,18}.0.* -> features.{0,18}.conv.*
            .with_key_remap("features\\.(0|18)\\.0.(.+)", "features.$1.conv.$2")
            // Map features.{0,18}.1.* -> features.{0,18}.norm.*
            .with_key_remap("features\\.(0|18)\\.1.(.+)", "features.$1.norm.$2")
            // Map features.1.conv.0.0.* -> features.1.dw.conv.*
            .with_key_remap("features\\.1\\.conv.0.0.(.+)", "features.1.dw.conv.$1")
            // Map features.1.conv.0.1.* -> features.1.dw.norm.*
            .with_key_remap("features\\.1\\.conv.0.1.(.+)", "features.1.dw.norm.$1")
            // Map features.1.conv.1.* -> features.1.pw_linear.conv.*
            .with_key_remap("features\\.1\\.conv.1.(.+)", "features.1.pw_linear.conv.$1")
            // Map features.1.conv.2.* -> features.1.pw_linear.norm.*
            .with_key_remap("features\\.1\\.conv.2.(.+)", "features.1.pw_linear.norm.$1")
            // Map features.[i].conv.0.0.* -> features.[i].pw.conv.*
            .with_key_remap(
                "features\\.([2-9]|1[0-7])\\.conv.0.0.(.+)", // for i in [2, 17]
                "features.$1.pw.conv.$2",
            )
            // Map features.[i].conv.0.1.* -> features.[i].pw.norm.*
            .with_key_remap(
                "features\\.([2-9]|1[0-7])\\.conv.0.1.(.+)", // for i in [2, 17]
                "features.$1.pw.norm.$2",
            )
            // Map features.[i].conv.1.0.* -> features.[i].dw.conv.*
            .with_key_remap(
                "features\\.([2-9]|1[0-7])\\.conv.1.0.(.+)", // for i in [2, 17]
                "features.$1.dw.conv.$2",
            )
            // Map features.[i].conv.1.1.* -> features.[i].dw.norm.*
            .with_key_remap(
                "features\\.([2-9]|1[0-7])\\.conv.1.1.(.+)", // for i in [2, 17]
                "features.$1.dw.norm.$2",
            )
            // Map features.[i].conv.2.* -> features.[i].pw_linear.conv.*
            .with_key_remap(
                "features\\.([2-9]|1[0-7])\\.conv.2.(.+)", // for i in [2, 17]
                "features.$1.pw_linear.conv.$2",
            )
            // Map features.[i].conv.3.* -> features.[i].pw_linear.norm.*
            .with_key_remap(
                "features\\.([2-9]|1[0-7])\\.conv.3.(.+)", // for i in [2, 17]
                "features.$1.pw_linear.norm.$2",
            )
            // Map classifier.1.* -> classifier.linear.*
            .with_key_remap("classifier.1.(.+)", "classifier.linear.$1");

        let record: MobileNetV2Record<B> =
            PyTorchFileRecorder::<FullPrecisionSettings>::new().load(load_args, device)?;

        Ok(model.load_record(record))
    }

    /// MobileNetV2 from [`MobileNetV2: Inverted Residuals and Linear Bottlenecks`](https://arxiv.org/abs/1801.04381)
    /// with pre-trained weights.
    ///
    /// The returned model still carries the ImageNet head; call [`with_classes`](Self::with_classes)
    /// to size it for the task at hand.
    #[cfg(feature = "pretrained")]
    pub fn pretrained(weights: weights::MobileNetV2, device: &Device<B>) -> Result<Self, RecorderError> {
        let weights = weights.weights();
        let model = MobileNetV2Config::new(weights.num_classes).init(device);
        Self::load_weights(model, &weights, device)
    }
}

#[allow(clippy::large_enum_variant)]
#[derive(Module, Debug)]
enum ConvBlock<B: Backend> {
    InvertedResidual(InvertedResidual<B>),
    Conv(Conv2dNormActivation<B>),
}

#[derive(Module, Debug)]
struct Classifier<B: Backend> {
    dropout: Dropout,
    linear: Linear<B>,
}

impl<B: Backend> Classifier<B> {
    fn forward(&self, input: Tensor<B, 2>) -> Tensor<B, 2> {
        let x = self.dropout.forward(input);
        self.linear.forward(x)
    }
}

/// MobileNetV2 from [`MobileNetV2: Inverted Residuals and Linear Bottlenecks`](https://arxiv.org/abs/1801.04381).
#[derive(Debug, Config)]
pub struct MobileNetV2Config {
    pub num_classes: usize,

    #[config(default = "1.0")]
    pub width_mult: f32,

    #[config(default = "0.2")]
    pub dropout: f64,
}

impl MobileNetV2Config {
    /// Initialize a MobileNetV2 from
    /// [`MobileNetV2: Inverted Residuals and Linear Bottlenecks`](https://arxiv.org/abs/1801.04381).
    ///
    /// # Arguments
    ///
    /// * `device` - Device to create the module on.
    ///
    /// # Returns
    ///
    /// A MobileNetV2 module.
    pub fn init<B: Backend>(&self, device: &B::Device) -> MobileNetV2<B> {
        let input_channel = 32;
        let last_channel = 1280;

        let mut input_channel =
            make_divisible(input_channel as f32 * self.width_mult, ROUND_NEAREST);
        let last_channel = make_divisible(
            last_channel as f32 * f32::max(1.0, self.width_mult),
            ROUND_NEAREST,
        );

        // Feature extraction layers with inverted residual blocks
        let mut features = vec![ConvBlock::Conv(
            Conv2dNormActivationConfig::new(3, input_channel)
                .with_kernel_size(3)
                .with_stride(2)
                .init(device),
        )];
        for [t, c, n, s] in INVERTED_RESIDUAL_SETTINGS.into_iter() {
            let output_channel = make_divisible(c as f32 * self.width_mult, ROUND_NEAREST);
            for i in 0..n {
                let stride = if i == 0 { s } else { 1 };
                features.push(ConvBlock::InvertedResidual(
                    InvertedResidualConfig::new(input_channel, output_channel, stride, t)
                        .init(device),
                ));
                input_channel = output_channel;
            }
        }
        features.push(ConvBlock::Conv(
            Conv2dNormActivationConfig::new(input_channel, last_channel)
                .with_kernel_size(1)
                .init(device),
        ));

        let classifier = Classifier {
            dropout: DropoutConfig::new(self.dropout).init(),
            linear: LinearConfig::new(last_channel, self.num_classes).init(device),
        };

        MobileNetV2 {
            features,
            classifier,
            avg_pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
        }
    }
}

fn make_divisible(v: f32, divisor: usize) -> usize {
    let new_v = (v + divisor as f32 / 2.0) as usize / divisor * divisor;
    let mut new_v = max(new_v, divisor);

    // Make sure that round down does not go down by more than 10%
    if (new_v as f32) < 0.9 * v {
        new_v += divisor;
    }

    new_v
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type B = NdArray<f32>;

    #[test]
    fn channels_are_rounded_to_multiples_of_eight() {
        assert_eq!(make_divisible(32.0, 8), 32);
        assert_eq!(make_divisible(8.0, 8), 8);
        assert_eq!(make_divisible(4.0, 8), 8);
        assert_eq!(make_divisible(24.0 * 0.35, 8), 8);
        assert_eq!(make_divisible(1280.0, 8), 1280);
    }

    #[test]
    fn forward_produces_one_score_per_class() {
        let device = Default::default();
        let model = MobileNetV2Config::new(4)
            .with_width_mult(0.25)
            .init::<B>(&device);

        let input = Tensor::<B, 4>::zeros([2, 3, 64, 64], &device);
        let output = model.forward(input);

        assert_eq!(output.dims(), [2, 4]);
        assert_eq!(model.num_classes(), 4);
    }

    #[test]
    fn with_classes_resizes_the_head_only() {
        let device = Default::default();
        let model = MobileNetV2Config::new(1000)
            .with_width_mult(0.25)
            .init::<B>(&device)
            .with_classes(3);

        assert_eq!(model.num_classes(), 3);
        let output = model.forward(Tensor::<B, 4>::zeros([1, 3, 32, 32], &device));
        assert_eq!(output.dims(), [1, 3]);
    }

    #[test]
    fn width_multiplier_changes_the_parameter_shapes() {
        let device = Default::default();
        let narrow = MobileNetV2Config::new(2).with_width_mult(0.25);
        let wide = MobileNetV2Config::new(2).with_width_mult(0.5);

        assert_eq!(
            narrow.init::<B>(&device).param_shapes(),
            narrow.init::<B>(&device).param_shapes()
        );
        assert_ne!(
            narrow.init::<B>(&device).param_shapes(),
            wide.init::<B>(&device).param_shapes()
        );
        assert_eq!(
            narrow.init::<B>(&device).param_shapes().last(),
            Some(&vec![2])
        );
    }

    #[test]
    fn norm_momentum_reaches_every_layer() {
        let device = Default::default();
        let model = MobileNetV2Config::new(2)
            .with_width_mult(0.25)
            .init::<B>(&device);
        assert_eq!(model.norm_momentum(), DEFAULT_NORM_MOMENTUM);

        let model = model.with_norm_momentum(0.5);
        assert_eq!(model.norm_momentum(), 0.5);
        match model.features.last() {
            Some(ConvBlock::Conv(conv)) => assert_eq!(conv.norm_momentum(), 0.5),
            _ => panic!("the last feature layer is a convolution"),
        }
    }
}
