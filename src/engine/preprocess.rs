//! Image decoding and geometry normalization
//!
//! Two independent normalization policies feed the models:
//! - adaptive downscaling before full-frame detection, bounding detector
//!   latency on large uploads;
//! - fixed 112x112 RGB normalization before recognition on a single crop.

use image::{imageops, DynamicImage, GenericImageView, ImageBuffer, Rgb, RgbImage};
use ndarray::Array4;

use crate::error::PipelineError;

/// Network input size for the face detector (SCRFD).
pub const DETECTOR_INPUT_SIZE: (u32, u32) = (640, 640);

/// Side length of a normalized face crop (ArcFace).
pub const NORMALIZED_FACE_SIZE: u32 = 112;

/// Decode an encoded raster image (JPEG, PNG, ...) from bytes.
///
/// Any decode failure resolves to [`PipelineError::InvalidImage`]; no partial
/// pixel data is ever returned. EXIF orientation is applied after decode so
/// phone uploads come out upright.
pub fn decode_image(data: &[u8]) -> Result<DynamicImage, PipelineError> {
    let image = image::load_from_memory(data)
        .map_err(|e| PipelineError::InvalidImage(e.to_string()))?;
    Ok(apply_exif_orientation(data, image))
}

/// Apply the EXIF orientation tag (1-8) to correct image rotation.
fn apply_exif_orientation(data: &[u8], image: DynamicImage) -> DynamicImage {
    use std::io::Cursor;

    let orientation = match exif::Reader::new().read_from_container(&mut Cursor::new(data)) {
        Ok(exif_data) => exif_data
            .get_field(exif::Tag::Orientation, exif::In::PRIMARY)
            .and_then(|field| field.value.get_uint(0))
            .unwrap_or(1) as u8,
        Err(_) => 1,
    };

    match orientation {
        2 => image.fliph(),
        3 => image.rotate180(),
        4 => image.flipv(),
        5 => image.rotate90().fliph(),
        6 => image.rotate90(),
        7 => image.rotate270().fliph(),
        8 => image.rotate270(),
        _ => image,
    }
}

/// Step function bounding detection cost on large frames.
///
/// The factor applies to both dimensions, so aspect ratio is preserved
/// exactly. Detection results are reported in the scaled frame's coordinate
/// space; callers carry the factor alongside the boxes.
pub fn adaptive_scale_factor(width: u32, height: u32) -> f32 {
    match width.max(height) {
        0..=320 => 1.0,
        321..=640 => 0.75,
        641..=1280 => 0.5,
        _ => 0.25,
    }
}

/// Downscale a frame by its adaptive factor, rounding each dimension to the
/// nearest pixel. A factor of 1.0 returns the input untouched.
pub fn scale_for_detection(image: DynamicImage) -> (DynamicImage, f32) {
    let (w, h) = image.dimensions();
    let factor = adaptive_scale_factor(w, h);
    if factor >= 1.0 {
        return (image, 1.0);
    }
    let new_w = (w as f32 * factor).round() as u32;
    let new_h = (h as f32 * factor).round() as u32;
    let scaled = image.resize_exact(new_w.max(1), new_h.max(1), imageops::FilterType::Triangle);
    (scaled, factor)
}

/// A face crop guaranteed to be exactly 112x112, 3-channel RGB.
///
/// The only constructor is [`NormalizedFace::from_image`], so holding one is
/// proof the geometry contract already holds.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedFace(RgbImage);

impl NormalizedFace {
    /// Normalize an arbitrary crop to the recognizer's input geometry.
    ///
    /// Grayscale input is replicated to three channels, alpha is dropped,
    /// and the crop is resized with linear interpolation only when its size
    /// differs. Normalizing an already-normalized face is a no-op: the
    /// output is bit-identical to the input.
    pub fn from_image(image: &DynamicImage) -> Self {
        let rgb = image.to_rgb8();
        if rgb.dimensions() == (NORMALIZED_FACE_SIZE, NORMALIZED_FACE_SIZE) {
            return Self(rgb);
        }
        Self(imageops::resize(
            &rgb,
            NORMALIZED_FACE_SIZE,
            NORMALIZED_FACE_SIZE,
            imageops::FilterType::Triangle,
        ))
    }

    pub fn as_rgb(&self) -> &RgbImage {
        &self.0
    }

    pub fn to_dynamic(&self) -> DynamicImage {
        DynamicImage::ImageRgb8(self.0.clone())
    }

    /// NCHW tensor in BGR channel order with (x - 127.5) / 128 scaling,
    /// the layout the ArcFace-family recognizers expect.
    pub fn to_bgr_tensor(&self) -> Array4<f32> {
        let side = NORMALIZED_FACE_SIZE as usize;
        let mut tensor = Array4::<f32>::zeros((1, 3, side, side));
        for (x, y, pixel) in self.0.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            tensor[[0, 0, y, x]] = (pixel[2] as f32 - 127.5) / 128.0;
            tensor[[0, 1, y, x]] = (pixel[1] as f32 - 127.5) / 128.0;
            tensor[[0, 2, y, x]] = (pixel[0] as f32 - 127.5) / 128.0;
        }
        tensor
    }
}

/// Letterbox an image onto the detector's fixed input canvas, preserving
/// aspect ratio and centering with black padding.
pub fn letterbox(image: &DynamicImage, target_w: u32, target_h: u32) -> DynamicImage {
    let (orig_w, orig_h) = image.dimensions();

    let scale = f32::min(
        target_w as f32 / orig_w as f32,
        target_h as f32 / orig_h as f32,
    );
    let new_w = ((orig_w as f32 * scale) as u32).max(1);
    let new_h = ((orig_h as f32 * scale) as u32).max(1);

    let resized = image.resize_exact(new_w, new_h, imageops::FilterType::Triangle);
    let mut padded = ImageBuffer::from_pixel(target_w, target_h, Rgb([0u8, 0, 0]));

    let offset_x = (target_w - new_w) / 2;
    let offset_y = (target_h - new_h) / 2;

    let rgb = resized.to_rgb8();
    for (x, y, pixel) in rgb.enumerate_pixels() {
        padded.put_pixel(x + offset_x, y + offset_y, *pixel);
    }

    DynamicImage::ImageRgb8(padded)
}

/// NCHW tensor in BGR order with (x - 127.5) / 128 scaling for detection.
pub fn to_detection_tensor(image: &DynamicImage) -> Array4<f32> {
    let rgb = image.to_rgb8();
    let (width, height) = rgb.dimensions();
    let mut tensor = Array4::<f32>::zeros((1, 3, height as usize, width as usize));
    for (x, y, pixel) in rgb.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        tensor[[0, 0, y, x]] = (pixel[2] as f32 - 127.5) / 128.0;
        tensor[[0, 1, y, x]] = (pixel[1] as f32 - 127.5) / 128.0;
        tensor[[0, 2, y, x]] = (pixel[0] as f32 - 127.5) / 128.0;
    }
    tensor
}

/// Mapping between the detector's padded canvas and the frame it was fed.
pub struct LetterboxInfo {
    pub scale: f32,
    pub offset_x: u32,
    pub offset_y: u32,
    pub frame_width: u32,
    pub frame_height: u32,
}

impl LetterboxInfo {
    pub fn new(frame: (u32, u32), canvas: (u32, u32)) -> Self {
        let (frame_w, frame_h) = frame;
        let (canvas_w, canvas_h) = canvas;

        let scale = f32::min(
            canvas_w as f32 / frame_w as f32,
            canvas_h as f32 / frame_h as f32,
        );
        let new_w = (frame_w as f32 * scale) as u32;
        let new_h = (frame_h as f32 * scale) as u32;

        Self {
            scale,
            offset_x: (canvas_w - new_w) / 2,
            offset_y: (canvas_h - new_h) / 2,
            frame_width: frame_w,
            frame_height: frame_h,
        }
    }

    /// Map a canvas coordinate back into the frame the detector was fed.
    pub fn to_frame(&self, x: f32, y: f32) -> (f32, f32) {
        (
            (x - self.offset_x as f32) / self.scale,
            (y - self.offset_y as f32) / self.scale,
        )
    }
}

/// Extract a face region from a frame, with a relative margin on each side,
/// clamped to the frame bounds.
///
/// Providers give no in-bounds guarantee, so even a box lying entirely
/// outside the frame must resolve to a valid (degenerate) crop.
pub fn crop_face(image: &DynamicImage, x1: f32, y1: f32, x2: f32, y2: f32, margin: f32) -> DynamicImage {
    let (img_w, img_h) = image.dimensions();

    let margin_x = (x2 - x1) * margin;
    let margin_y = (y2 - y1) * margin;

    let x1 = ((x1 - margin_x).max(0.0) as u32).min(img_w.saturating_sub(1));
    let y1 = ((y1 - margin_y).max(0.0) as u32).min(img_h.saturating_sub(1));
    let x2 = ((x2 + margin_x).min(img_w as f32) as u32).clamp(x1 + 1, img_w.max(x1 + 1));
    let y2 = ((y2 + margin_y).min(img_h as f32) as u32).clamp(y1 + 1, img_h.max(y1 + 1));

    image.crop_imm(x1, y1, x2 - x1, y2 - y1)
}
