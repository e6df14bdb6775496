use std::io::Cursor;

use image::imageops::{self, FilterType};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use thiserror::Error;

pub const CANVAS_SIDE: u32 = 1024;
const EDIT_CANVAS_FILL: Rgb<u8> = Rgb([245, 245, 245]);
const PLACEHOLDER_FILL: Rgb<u8> = Rgb([250, 250, 250]);
const PLACEHOLDER_SQUARE_FILL: Rgb<u8> = Rgb([235, 235, 235]);
const PLACEHOLDER_SQUARE_SIDE: u32 = 600;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnhanceProfile {
    pub brightness: f32,
    pub contrast: f32,
    pub sharpness: f32,
}

impl Default for EnhanceProfile {
    fn default() -> Self {
        Self {
            brightness: 1.05,
            contrast: 1.1,
            sharpness: 1.15,
        }
    }
}

#[derive(Debug, Error)]
pub enum LocalImageOpError {
    #[error("failed to decode base image: {0}")]
    Decode(String),
    #[error("failed to encode PNG: {0}")]
    Encode(String),
}

/// Deterministic touch-up: fit the longest side to the canvas, mild enhance,
/// then center on a neutral square canvas.
pub fn local_quality_edit(base_image: &[u8]) -> Result<Vec<u8>, LocalImageOpError> {
    let decoded = image::load_from_memory(base_image)
        .map_err(|error| LocalImageOpError::Decode(error.to_string()))?;
    let rgb = decoded.to_rgb8();
    let fitted = fit_longest_side(&rgb, CANVAS_SIDE);
    let enhanced = enhance(fitted, EnhanceProfile::default());

    let mut canvas = RgbImage::from_pixel(CANVAS_SIDE, CANVAS_SIDE, EDIT_CANVAS_FILL);
    let x = (CANVAS_SIDE.saturating_sub(enhanced.width())) / 2;
    let y = (CANVAS_SIDE.saturating_sub(enhanced.height())) / 2;
    imageops::replace(&mut canvas, &enhanced, i64::from(x), i64::from(y));
    encode_png(canvas)
}

/// Neutral packshot placeholder; identical for every category.
pub fn local_placeholder(_category: &str) -> Result<Vec<u8>, LocalImageOpError> {
    let mut canvas = RgbImage::from_pixel(CANVAS_SIDE, CANVAS_SIDE, PLACEHOLDER_FILL);
    let square = RgbImage::from_pixel(
        PLACEHOLDER_SQUARE_SIDE,
        PLACEHOLDER_SQUARE_SIDE,
        PLACEHOLDER_SQUARE_FILL,
    );
    let offset = i64::from((CANVAS_SIDE - PLACEHOLDER_SQUARE_SIDE) / 2);
    imageops::replace(&mut canvas, &square, offset, offset);
    encode_png(canvas)
}

fn fit_longest_side(image: &RgbImage, target: u32) -> RgbImage {
    let (width, height) = image.dimensions();
    let longest = width.max(height).max(1);
    let scale = f64::from(target) / f64::from(longest);
    let new_width = ((f64::from(width) * scale) as u32).clamp(1, target);
    let new_height = ((f64::from(height) * scale) as u32).clamp(1, target);
    imageops::resize(image, new_width, new_height, FilterType::Lanczos3)
}

fn enhance(mut image: RgbImage, profile: EnhanceProfile) -> RgbImage {
    if (profile.brightness - 1.0).abs() > f32::EPSILON {
        apply_brightness_in_place(&mut image, profile.brightness);
    }
    if (profile.contrast - 1.0).abs() > f32::EPSILON {
        apply_contrast_in_place(&mut image, profile.contrast);
    }
    if (profile.sharpness - 1.0).abs() > f32::EPSILON {
        image = apply_sharpness(&image, profile.sharpness);
    }
    image
}

fn apply_brightness_in_place(image: &mut RgbImage, factor: f32) {
    for pixel in image.pixels_mut() {
        for i in 0..3 {
            pixel[i] = clamp_u8(f32::from(pixel[i]) * factor);
        }
    }
}

fn apply_contrast_in_place(image: &mut RgbImage, factor: f32) {
    for pixel in image.pixels_mut() {
        for i in 0..3 {
            let centered = f32::from(pixel[i]) - 128.0;
            pixel[i] = clamp_u8(centered * factor + 128.0);
        }
    }
}

fn apply_sharpness(image: &RgbImage, factor: f32) -> RgbImage {
    if factor <= 1.0 + f32::EPSILON {
        return image.clone();
    }
    let blurred = imageops::blur(image, 1.0);
    let amount = factor - 1.0;
    let mut out = image.clone();
    for (dst, (orig, blur)) in out.pixels_mut().zip(image.pixels().zip(blurred.pixels())) {
        for i in 0..3 {
            let val = f32::from(orig[i]) + amount * (f32::from(orig[i]) - f32::from(blur[i]));
            dst[i] = clamp_u8(val);
        }
    }
    out
}

fn encode_png(image: RgbImage) -> Result<Vec<u8>, LocalImageOpError> {
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(image)
        .write_to(&mut out, ImageFormat::Png)
        .map_err(|error| LocalImageOpError::Encode(error.to_string()))?;
    Ok(out.into_inner())
}

fn clamp_u8(value: f32) -> u8 {
    if !value.is_finite() {
        return 0;
    }
    value.clamp(0.0, 255.0).round() as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn png_of(width: u32, height: u32, fill: [u8; 3]) -> Vec<u8> {
        encode_png(RgbImage::from_pixel(width, height, Rgb(fill))).expect("png should encode")
    }

    #[test]
    fn placeholder_is_a_1024_png_with_centered_square() {
        let bytes = local_placeholder("saree").expect("placeholder should render");
        assert_eq!(
            image::guess_format(bytes.as_slice()).expect("format should be detected"),
            ImageFormat::Png
        );
        let image = image::load_from_memory(bytes.as_slice())
            .expect("placeholder should decode")
            .to_rgb8();
        assert_eq!(image.dimensions(), (1024, 1024));
        assert_eq!(image.get_pixel(0, 0), &PLACEHOLDER_FILL);
        assert_eq!(image.get_pixel(211, 211), &PLACEHOLDER_FILL);
        assert_eq!(image.get_pixel(212, 212), &PLACEHOLDER_SQUARE_FILL);
        assert_eq!(image.get_pixel(811, 811), &PLACEHOLDER_SQUARE_FILL);
        assert_eq!(image.get_pixel(812, 812), &PLACEHOLDER_FILL);
    }

    #[test]
    fn quality_edit_fits_and_centers_on_neutral_canvas() {
        let bytes = local_quality_edit(png_of(200, 100, [100, 100, 100]).as_slice())
            .expect("edit should succeed");
        let image = image::load_from_memory(bytes.as_slice())
            .expect("edit output should decode")
            .to_rgb8();
        assert_eq!(image.dimensions(), (1024, 1024));
        // 200x100 scales to 1024x512, leaving 256px bands above and below.
        assert_eq!(image.get_pixel(512, 10), &EDIT_CANVAS_FILL);
        assert_eq!(image.get_pixel(512, 1013), &EDIT_CANVAS_FILL);
        let center = image.get_pixel(512, 512);
        assert_ne!(center, &EDIT_CANVAS_FILL);
    }

    #[test]
    fn quality_edit_brightens_mid_grey() {
        let bytes = local_quality_edit(png_of(64, 64, [100, 100, 100]).as_slice())
            .expect("edit should succeed");
        let image = image::load_from_memory(bytes.as_slice())
            .expect("edit output should decode")
            .to_rgb8();
        // 100 * 1.05 = 105, then (105 - 128) * 1.1 + 128 = 102.7
        assert_eq!(image.get_pixel(512, 512)[0], 103);
    }

    #[test]
    fn quality_edit_rejects_undecodable_bytes() {
        let err = local_quality_edit(b"not an image").expect_err("garbage should not decode");
        assert!(matches!(err, LocalImageOpError::Decode(_)));
    }

    #[test]
    fn clamp_u8_handles_non_finite_and_out_of_range() {
        assert_eq!(clamp_u8(f32::NAN), 0);
        assert_eq!(clamp_u8(-4.0), 0);
        assert_eq!(clamp_u8(300.0), 255);
        assert_eq!(clamp_u8(12.4), 12);
    }
}
