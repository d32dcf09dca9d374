use std::path::Path;

use burn::tensor::{backend::Backend, Device, Tensor, TensorData};
use image::{imageops, ColorType, DynamicImage, RgbImage};

use crate::error::PreprocessError;

/// Side of the square input expected by the classifier.
pub const IMAGE_SIZE: usize = 224;

// ImageNet mean and std values
pub const MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Decode raw bytes (format guessed from the content) into an image.
pub fn decode(bytes: &[u8]) -> Result<DynamicImage, PreprocessError> {
    Ok(image::load_from_memory(bytes)?)
}

fn to_rgb(image: DynamicImage) -> Result<RgbImage, PreprocessError> {
    match image.color() {
        ColorType::L8
        | ColorType::La8
        | ColorType::Rgb8
        | ColorType::Rgba8
        | ColorType::L16
        | ColorType::La16
        | ColorType::Rgb16
        | ColorType::Rgba16
        | ColorType::Rgb32F
        | ColorType::Rgba32F => Ok(image.into_rgb8()),
        other => Err(PreprocessError::UnsupportedMode(format!("{other:?}"))),
    }
}

/// An RGB image resized to exactly `IMAGE_SIZE` x `IMAGE_SIZE`.
///
/// This is the only way images enter the model, for training and inference alike.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedImage {
    pixels: RgbImage,
}

impl PreparedImage {
    /// Coerce to 3 channels (alpha dropped, gray replicated) then resize with the bilinear filter.
    pub fn from_dynamic(image: DynamicImage) -> Result<Self, PreprocessError> {
        let rgb = to_rgb(image)?;
        let pixels = imageops::resize(
            &rgb,
            IMAGE_SIZE as u32,
            IMAGE_SIZE as u32,
            imageops::FilterType::Triangle, // also known as bilinear in 2D
        );
        Ok(Self { pixels })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PreprocessError> {
        Self::from_dynamic(decode(bytes)?)
    }

    /// Read and prepare an image file. The format is detected from the content, not the extension.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, PreprocessError> {
        let bytes = std::fs::read(path)?;
        Self::from_bytes(&bytes)
    }

    /// Mirror the image left to right (training augmentation only).
    pub fn flip_horizontal(&self) -> Self {
        Self {
            pixels: imageops::flip_horizontal(&self.pixels),
        }
    }

    /// Pixels in `[H, W, C]` order.
    pub fn as_raw(&self) -> &[u8] {
        self.pixels.as_raw()
    }
}

fn to_tensor<B: Backend>(image: &PreparedImage, device: &Device<B>) -> Tensor<B, 3> {
    Tensor::<B, 3>::from_data(
        TensorData::new(image.as_raw().to_vec(), [IMAGE_SIZE, IMAGE_SIZE, 3])
            .convert::<B::FloatElem>(),
        device,
    )
    // [H, W, C] -> [C, H, W]
    .permute([2, 0, 1])
        / 255 // normalize between [0, 1]
}

/// Normalizer with ImageNet values, the range the backbone was pre-trained on.
#[derive(Clone, Debug)]
pub struct Normalizer<B: Backend> {
    pub mean: Tensor<B, 4>,
    pub std: Tensor<B, 4>,
}

impl<B: Backend> Normalizer<B> {
    /// Creates a new normalizer.
    pub fn new(device: &Device<B>) -> Self {
        let mean = Tensor::<B, 1>::from_floats(MEAN, device).reshape([1, 3, 1, 1]);
        let std = Tensor::<B, 1>::from_floats(STD, device).reshape([1, 3, 1, 1]);
        Self { mean, std }
    }

    /// Normalizes the input image according to the ImageNet dataset.
    ///
    /// The input image should be in the range [0, 1].
    ///
    /// The normalization is done according to the following formula:
    /// `input = (input - mean) / std`
    pub fn normalize(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        (input - self.mean.clone()) / self.std.clone()
    }

    /// Inverse of [`normalize`](Self::normalize): `input * std + mean`.
    pub fn denormalize(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        input * self.std.clone() + self.mean.clone()
    }

    /// Returns a new normalizer on the given device.
    pub fn to_device(&self, device: &B::Device) -> Self {
        Self {
            mean: self.mean.clone().to_device(device),
            std: self.std.clone().to_device(device),
        }
    }
}

/// Turns prepared images into the normalized `[N, 3, 224, 224]` input of the classifier.
#[derive(Clone, Debug)]
pub struct ImagePreprocessor<B: Backend> {
    normalizer: Normalizer<B>,
}

impl<B: Backend> ImagePreprocessor<B> {
    pub fn new(device: &Device<B>) -> Self {
        Self {
            normalizer: Normalizer::new(device),
        }
    }

    pub fn normalizer(&self) -> &Normalizer<B> {
        &self.normalizer
    }

    /// Stack the images into one normalized batch.
    ///
    /// # Panics
    ///
    /// If `images` is empty.
    pub fn batch(&self, images: &[PreparedImage], device: &Device<B>) -> Tensor<B, 4> {
        assert!(!images.is_empty(), "Cannot build an empty image batch");

        let tensors = images
            .iter()
            .map(|image| to_tensor::<B>(image, device))
            .collect();
        let batch: Tensor<B, 4> = Tensor::stack(tensors, 0);

        self.normalizer.to_device(device).normalize(batch)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use burn::backend::NdArray;
    use image::{GrayImage, ImageOutputFormat, Luma, Rgb, Rgba, RgbaImage};
    use std::io::Cursor;

    type B = NdArray<f32>;

    pub(crate) fn encode_png(image: DynamicImage) -> Vec<u8> {
        let mut bytes = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut bytes), ImageOutputFormat::Png)
            .unwrap();
        bytes
    }

    fn gradient(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x * 7 % 256) as u8, (y * 3 % 256) as u8, ((x + y) % 256) as u8])
        })
    }

    fn values(tensor: Tensor<B, 4>) -> Vec<f32> {
        tensor.into_data().convert::<f32>().to_vec::<f32>().unwrap()
    }

    #[test]
    fn any_color_mode_yields_the_fixed_shape() {
        let device = Default::default();
        let preprocessor = ImagePreprocessor::<B>::new(&device);

        let inputs = [
            DynamicImage::ImageRgb8(gradient(300, 180)),
            DynamicImage::ImageRgba8(RgbaImage::from_pixel(17, 41, Rgba([10, 200, 30, 0]))),
            DynamicImage::ImageLuma8(GrayImage::from_pixel(500, 500, Luma([128]))),
        ];

        for input in inputs {
            let prepared = PreparedImage::from_bytes(&encode_png(input)).unwrap();
            assert_eq!(prepared.as_raw().len(), IMAGE_SIZE * IMAGE_SIZE * 3);

            let batch = preprocessor.batch(&[prepared], &device);
            assert_eq!(batch.dims(), [1, 3, IMAGE_SIZE, IMAGE_SIZE]);
        }
    }

    #[test]
    fn gray_is_replicated_and_alpha_dropped() {
        let gray = DynamicImage::ImageLuma8(GrayImage::from_pixel(10, 10, Luma([77])));
        let prepared = PreparedImage::from_bytes(&encode_png(gray)).unwrap();
        assert!(prepared.as_raw().iter().all(|&v| v == 77));

        let transparent =
            DynamicImage::ImageRgba8(RgbaImage::from_pixel(10, 10, Rgba([1, 2, 3, 0])));
        let prepared = PreparedImage::from_bytes(&encode_png(transparent)).unwrap();
        assert!(prepared.as_raw().chunks(3).all(|px| px == [1, 2, 3]));
    }

    #[test]
    fn invalid_bytes_are_a_decode_error() {
        let err = PreparedImage::from_bytes(b"definitely not an image").unwrap_err();
        assert!(matches!(err, PreprocessError::Decode(_)));
    }

    #[test]
    fn denormalize_recovers_the_scaled_resized_image() {
        let device = Default::default();
        let preprocessor = ImagePreprocessor::<B>::new(&device);
        let prepared = PreparedImage::from_dynamic(DynamicImage::ImageRgb8(gradient(640, 480)))
            .unwrap();

        let batch = preprocessor.batch(&[prepared.clone()], &device);
        let recovered = values(preprocessor.normalizer().denormalize(batch));

        // Expected values in [C, H, W] order
        let raw = prepared.as_raw();
        let plane = IMAGE_SIZE * IMAGE_SIZE;
        for (i, value) in recovered.iter().enumerate() {
            let channel = i / plane;
            let pixel = i % plane;
            let expected = raw[pixel * 3 + channel] as f32 / 255.0;
            assert!(
                (value - expected).abs() < 1e-5,
                "index {i}: {value} != {expected}"
            );
        }
    }

    #[test]
    fn normalization_uses_the_channel_constants() {
        let device = Default::default();
        let preprocessor = ImagePreprocessor::<B>::new(&device);
        let white = PreparedImage::from_dynamic(DynamicImage::ImageRgb8(RgbImage::from_pixel(
            8,
            8,
            Rgb([255, 255, 255]),
        )))
        .unwrap();

        let values = values(preprocessor.batch(&[white], &device));
        let plane = IMAGE_SIZE * IMAGE_SIZE;
        for channel in 0..3 {
            let expected = (1.0 - MEAN[channel]) / STD[channel];
            assert!((values[channel * plane] - expected).abs() < 1e-5);
        }
    }

    #[test]
    fn preprocessing_is_deterministic() {
        let bytes = encode_png(DynamicImage::ImageRgb8(gradient(333, 222)));
        let a = PreparedImage::from_bytes(&bytes).unwrap();
        let b = PreparedImage::from_bytes(&bytes).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.flip_horizontal().flip_horizontal(), a);
    }
}
