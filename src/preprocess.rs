//! Image preprocessing before OCR.
//!
//! The filters themselves come from the `image` and `imageproc` crates. We
//! just decide which ones to run, and in what order.

use std::io::Cursor;

use image::{DynamicImage, ImageFormat, imageops::FilterType};
use imageproc::{
    contrast::{equalize_histogram, otsu_level},
    filter::median_filter,
};

use crate::{async_utils::spawn_blocking_propagating_panics, pages::Page, prelude::*};

/// How to binarize an image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Threshold {
    /// Pick a level automatically using Otsu's method.
    Otsu,
    /// Pixels brighter than this become white, everything else black.
    Fixed(u8),
}

/// Which filters to apply. Filters run in the order of the fields below.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PreprocessOptions {
    /// Scale to this width, preserving aspect ratio.
    pub resize_width: Option<u32>,
    /// Convert to grayscale.
    pub grayscale: bool,
    /// Contrast adjustment. Positive values increase contrast.
    pub contrast: Option<f32>,
    /// Brightness adjustment. Positive values brighten.
    pub brightness: Option<i32>,
    /// Equalize the luminance histogram. Produces a grayscale image.
    pub normalize: bool,
    /// Apply a 3x3 median filter to remove speckle noise.
    pub denoise: bool,
    /// Apply an unsharp mask.
    pub sharpen: bool,
    /// Binarize the image. Always runs last.
    pub threshold: Option<Threshold>,
}

impl PreprocessOptions {
    /// The pipeline we use when preprocessing is requested without choosing
    /// any specific filters.
    pub fn recommended() -> Self {
        Self {
            grayscale: true,
            normalize: true,
            denoise: true,
            sharpen: true,
            ..Self::default()
        }
    }

    /// Does this enable any filters at all?
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Interface to an image preprocessor.
#[async_trait]
pub trait Preprocessor: Send + Sync + 'static {
    /// Apply `options` to `page`, returning a new page.
    async fn preprocess(&self, page: &Page, options: &PreprocessOptions) -> Result<Page>;
}

/// A [`Preprocessor`] built on the `image` and `imageproc` crates. Always
/// outputs PNG.
#[derive(Clone, Copy, Debug, Default)]
pub struct ImagePreprocessor;

#[async_trait]
impl Preprocessor for ImagePreprocessor {
    #[instrument(level = "debug", skip_all, fields(mime_type = %page.mime_type))]
    async fn preprocess(&self, page: &Page, options: &PreprocessOptions) -> Result<Page> {
        let data = page.data.clone();
        let options = options.clone();
        // Image filters are CPU-bound, so keep them off the executor.
        spawn_blocking_propagating_panics(move || -> Result<Page> {
            let image = image::load_from_memory(&data).context("cannot decode image")?;
            debug!(
                width = image.width(),
                height = image.height(),
                "Decoded image for preprocessing"
            );
            let image = apply_filters(image, &options)?;
            let mut png = vec![];
            image
                .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
                .context("cannot encode preprocessed image")?;
            Ok(Page::new("image/png", png))
        })
        .await
    }
}

/// Apply the filters selected in `options`.
pub fn apply_filters(
    mut image: DynamicImage,
    options: &PreprocessOptions,
) -> Result<DynamicImage> {
    if let Some(width) = options.resize_width {
        if width == 0 {
            return Err(anyhow!("resize width must be at least 1"));
        }
        if image.width() != width && image.width() > 0 {
            let height = (u64::from(image.height()) * u64::from(width)
                / u64::from(image.width()))
            .clamp(1, u64::from(u32::MAX)) as u32;
            image = image.resize_exact(width, height, FilterType::Lanczos3);
        }
    }
    if options.grayscale {
        image = image.grayscale();
    }
    if let Some(contrast) = options.contrast {
        image = image.adjust_contrast(contrast);
    }
    if let Some(brightness) = options.brightness {
        image = image.brighten(brightness);
    }
    if options.normalize {
        image = DynamicImage::ImageLuma8(equalize_histogram(&image.to_luma8()));
    }
    if options.denoise {
        image = match image {
            DynamicImage::ImageLuma8(gray) => {
                DynamicImage::ImageLuma8(median_filter(&gray, 1, 1))
            }
            other => DynamicImage::ImageRgba8(median_filter(&other.to_rgba8(), 1, 1)),
        };
    }
    if options.sharpen {
        image = image.unsharpen(1.0, 2);
    }
    if let Some(threshold) = options.threshold {
        let mut gray = image.to_luma8();
        let level = match threshold {
            Threshold::Otsu => otsu_level(&gray),
            Threshold::Fixed(level) => level,
        };
        trace!(level, "Binarizing image");
        for pixel in gray.pixels_mut() {
            pixel.0[0] = if pixel.0[0] > level { 255 } else { 0 };
        }
        image = DynamicImage::ImageLuma8(gray);
    }
    Ok(image)
}
