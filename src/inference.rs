use std::path::Path;

use burn::{prelude::*, tensor::activation::softmax};
use serde::{Deserialize, Serialize};

use crate::{
    checkpoint,
    data::{ClassMapping, ImagePreprocessor, PreparedImage},
    error::InferenceError,
    model::MobileNetV2,
};

/// Most likely class of one image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    #[serde(skip)]
    pub class_index: usize,
    /// Class name.
    pub prediction: String,
    /// Probability of the predicted class in percent, rounded to 2 decimals.
    pub confidence: f64,
}

/// Single image classification with a loaded model.
///
/// Run it on a backend without autodiff: batch norm layers then use their running
/// statistics and dropout is disabled.
#[derive(Debug, Clone)]
pub struct Predictor<B: Backend> {
    model: MobileNetV2<B>,
    classes: ClassMapping,
    preprocessor: ImagePreprocessor<B>,
    device: B::Device,
}

impl<B: Backend> Predictor<B> {
    pub fn new(
        model: MobileNetV2<B>,
        classes: ClassMapping,
        device: &B::Device,
    ) -> Result<Self, InferenceError> {
        let outputs = model.num_classes();
        if classes.is_empty() || outputs != classes.len() {
            return Err(InferenceError::DimensionMismatch {
                classes: classes.len(),
                outputs,
            });
        }

        Ok(Self {
            model: model.no_grad().to_device(device),
            classes,
            preprocessor: ImagePreprocessor::new(device),
            device: device.clone(),
        })
    }

    pub fn from_checkpoint<P: AsRef<Path>>(
        path: P,
        device: &B::Device,
    ) -> Result<Self, InferenceError> {
        let checkpoint = checkpoint::load::<B, _>(path, device)?;
        Self::new(checkpoint.model, checkpoint.classes, device)
    }

    pub fn classes(&self) -> &ClassMapping {
        &self.classes
    }

    /// Decode, preprocess and classify an encoded image.
    pub fn predict_bytes(&self, bytes: &[u8]) -> Result<Prediction, InferenceError> {
        let image = PreparedImage::from_bytes(bytes)?;
        self.predict_image(&image)
    }

    pub fn predict_image(&self, image: &PreparedImage) -> Result<Prediction, InferenceError> {
        let probabilities = self.probabilities(std::slice::from_ref(image))?;
        let (class_index, probability) = probabilities
            .first()
            .and_then(|probs| top_class(probs))
            .ok_or_else(|| InferenceError::InvalidOutput("no finite maximum".to_string()))?;

        let prediction = self
            .classes
            .name(class_index)
            .ok_or_else(|| InferenceError::InvalidOutput(format!("no class {class_index}")))?
            .to_string();

        Ok(Prediction {
            class_index,
            prediction,
            confidence: to_percent(probability),
        })
    }

    /// Class probabilities for each image, in class index order.
    pub fn probabilities(&self, images: &[PreparedImage]) -> Result<Vec<Vec<f32>>, InferenceError> {
        if images.is_empty() {
            return Ok(Vec::new());
        }

        let input = self.preprocessor.batch(images, &self.device);
        let scores = self.model.forward(input);
        let probs = softmax(scores, 1)
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|err| InferenceError::InvalidOutput(format!("{err:?}")))?;

        Ok(probs
            .chunks(self.classes.len())
            .map(<[f32]>::to_vec)
            .collect())
    }
}

/// Index and value of the largest probability, the first one on ties.
fn top_class(probs: &[f32]) -> Option<(usize, f32)> {
    let mut best: Option<(usize, f32)> = None;
    for (index, &p) in probs.iter().enumerate() {
        if !p.is_finite() {
            return None;
        }
        match best {
            Some((_, max)) if p <= max => {}
            _ => best = Some((index, p)),
        }
    }
    best
}

fn to_percent(probability: f32) -> f64 {
    let percent = (probability as f64 * 100.0).clamp(0.0, 100.0);
    (percent * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MobileNetV2Config;
    use burn::backend::NdArray;
    use image::{DynamicImage, Rgb, RgbImage};

    type B = NdArray<f32>;

    fn predictor(num_classes: usize) -> Predictor<B> {
        let device = Default::default();
        let model = MobileNetV2Config::new(num_classes)
            .with_width_mult(0.25)
            .init::<B>(&device);
        let classes = ClassMapping::new((0..num_classes).map(|i| format!("class_{i}")).collect());
        Predictor::new(model, classes, &device).unwrap()
    }

    fn leaf(seed: u8) -> PreparedImage {
        PreparedImage::from_dynamic(DynamicImage::ImageRgb8(RgbImage::from_fn(96, 64, |x, y| {
            Rgb([(x as u8).wrapping_mul(seed), (y as u8).wrapping_add(seed), seed])
        })))
        .unwrap()
    }

    #[test]
    fn top_class_prefers_the_first_maximum() {
        assert_eq!(top_class(&[0.1, 0.45, 0.45]), Some((1, 0.45)));
        assert_eq!(top_class(&[1.0]), Some((0, 1.0)));
        assert_eq!(top_class(&[0.5, f32::NAN]), None);
        assert_eq!(top_class(&[]), None);
    }

    #[test]
    fn confidence_is_a_rounded_percentage() {
        assert_eq!(to_percent(0.123456), 12.35);
        assert_eq!(to_percent(1.0), 100.0);
        assert_eq!(to_percent(1.000001), 100.0);
        assert_eq!(to_percent(0.0), 0.0);
    }

    #[test]
    fn model_and_mapping_must_agree() {
        let device = Default::default();
        let model = MobileNetV2Config::new(3)
            .with_width_mult(0.25)
            .init::<B>(&device);
        let classes = ClassMapping::new(vec!["blighted".into(), "healthy".into()]);

        let err = Predictor::new(model, classes, &device).unwrap_err();
        assert!(matches!(
            err,
            InferenceError::DimensionMismatch {
                classes: 2,
                outputs: 3
            }
        ));
    }

    #[test]
    fn prediction_is_the_most_probable_class() {
        let predictor = predictor(4);
        let images = [leaf(3), leaf(200)];

        let probabilities = predictor.probabilities(&images).unwrap();
        assert_eq!(probabilities.len(), 2);

        for (image, probs) in images.iter().zip(probabilities) {
            assert_eq!(probs.len(), 4);
            assert!((probs.iter().sum::<f32>() - 1.0).abs() < 1e-4);

            let prediction = predictor.predict_image(image).unwrap();
            let max = probs.iter().cloned().fold(f32::MIN, f32::max);
            assert!((0.0..=100.0).contains(&prediction.confidence));
            assert!((prediction.confidence - max as f64 * 100.0).abs() <= 0.01);
            assert_eq!(prediction.prediction, format!("class_{}", prediction.class_index));
        }
    }

    #[test]
    fn predictions_are_repeatable() {
        let predictor = predictor(2);
        let image = leaf(42);

        let first = predictor.predict_image(&image).unwrap();
        for _ in 0..3 {
            assert_eq!(predictor.predict_image(&image).unwrap(), first);
        }
    }

    #[test]
    fn undecodable_bytes_never_produce_a_label() {
        let predictor = predictor(2);
        let err = predictor.predict_bytes(b"<html>not an image</html>").unwrap_err();
        assert!(matches!(err, InferenceError::Preprocess(_)));
    }

    #[test]
    fn serializes_to_the_response_shape() {
        let prediction = Prediction {
            class_index: 1,
            prediction: "healthy".to_string(),
            confidence: 97.5,
        };
        let json = serde_json::to_value(&prediction).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"prediction": "healthy", "confidence": 97.5})
        );
    }
}
