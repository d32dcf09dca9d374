mod conv_norm;
mod inverted_residual;
pub mod mobilenetv2;
#[cfg(feature = "pretrained")]
pub mod weights;

pub use mobilenetv2::{MobileNetV2, MobileNetV2Config, MobileNetV2Record};
