use anyhow::{ensure, Result};
use image::{imageops, GrayImage, RgbImage};
use ndarray::{s, Array4};

const MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Preprocessor for converting RGB images to model input tensors
pub struct Preprocessor {
    target_width: u32,
    target_height: u32,
}

impl Preprocessor {
    pub fn new(target_width: u32, target_height: u32) -> Self {
        Self {
            target_width,
            target_height,
        }
    }

    /// Preprocess an RGB image into a normalized NCHW tensor
    ///
    /// Steps:
    /// 1. Resize to target dimensions
    /// 2. Scale to [0, 1] and standardize with ImageNet mean/std
    /// 3. Transpose from HWC to NCHW format
    ///
    /// Returns: Array4<f32> with shape [1, 3, height, width]
    pub fn preprocess(&self, image: &RgbImage) -> Array4<f32> {
        let _span = tracing::debug_span!("preprocess").entered();

        let resized = if image.dimensions() != (self.target_width, self.target_height) {
            imageops::resize(
                image,
                self.target_width,
                self.target_height,
                imageops::FilterType::Lanczos3,
            )
        } else {
            image.clone()
        };

        let (width, height) = resized.dimensions();
        let mut tensor = Array4::<f32>::zeros((1, 3, height as usize, width as usize));

        for (x, y, pixel) in resized.enumerate_pixels() {
            for channel in 0..3 {
                let value = pixel[channel] as f32 / 255.0;
                tensor[[0, channel, y as usize, x as usize]] = (value - MEAN[channel]) / STD[channel];
            }
        }

        tensor
    }

    /// Stack several frames into one `[N, 3, height, width]` tensor
    pub fn preprocess_batch(&self, images: &[RgbImage]) -> Array4<f32> {
        let mut batch = Array4::<f32>::zeros((
            images.len(),
            3,
            self.target_height as usize,
            self.target_width as usize,
        ));
        for (index, image) in images.iter().enumerate() {
            batch
                .slice_mut(s![index..index + 1, .., .., ..])
                .assign(&self.preprocess(image));
        }
        batch
    }

    /// Turn a raw model mask into an 8-bit matte at the frame's size
    ///
    /// The mask is min-max normalized first, since saliency models do not
    /// emit calibrated probabilities.
    pub fn postprocess_mask(
        mask: &[f32],
        mask_width: u32,
        mask_height: u32,
        target_width: u32,
        target_height: u32,
    ) -> Result<GrayImage> {
        let _span = tracing::debug_span!("postprocess").entered();

        ensure!(
            mask.len() == mask_width as usize * mask_height as usize,
            "Mask has {} values, expected {}x{}",
            mask.len(),
            mask_width,
            mask_height
        );

        let (lo, hi) = mask
            .iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
        let range = if hi > lo { hi - lo } else { 1.0 };

        let gray = GrayImage::from_fn(mask_width, mask_height, |x, y| {
            let idx = (y * mask_width + x) as usize;
            let value = ((mask[idx] - lo) / range * 255.0).clamp(0.0, 255.0) as u8;
            image::Luma([value])
        });

        if (mask_width, mask_height) == (target_width, target_height) {
            return Ok(gray);
        }

        Ok(imageops::resize(
            &gray,
            target_width,
            target_height,
            imageops::FilterType::Lanczos3,
        ))
    }
}
