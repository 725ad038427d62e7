//! Face region extraction.
//!
//! Clamps a located bounding box to the image, extracts the region and
//! resizes it to the fixed spatial input of the embedding model.

use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::RgbImage;

/// Integer pixel region fully inside an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Clamp `bbox` to `[0, width) × [0, height)`.
///
/// Box edges are rounded to the nearest pixel. Returns `None` when nothing
/// of the box remains inside the image.
pub fn clamp_region(bbox: &BoundingBox, width: u32, height: u32) -> Option<CropRegion> {
    if !(bbox.x.is_finite() && bbox.y.is_finite() && bbox.width.is_finite() && bbox.height.is_finite()) {
        return None;
    }

    let x0 = bbox.x.round().clamp(0.0, width as f32);
    let y0 = bbox.y.round().clamp(0.0, height as f32);
    let x1 = bbox.right().round().clamp(0.0, width as f32);
    let y1 = bbox.bottom().round().clamp(0.0, height as f32);

    let w = x1 - x0;
    let h = y1 - y0;
    if w <= 0.0 || h <= 0.0 {
        return None;
    }

    Some(CropRegion {
        x: x0 as u32,
        y: y0 as u32,
        width: w as u32,
        height: h as u32,
    })
}

/// Extract the clamped face region without resizing.
///
/// The returned buffer has the clamped dimensions, not the box's.
pub fn crop_region(image: &RgbImage, bbox: &BoundingBox) -> Option<RgbImage> {
    let region = clamp_region(bbox, image.width(), image.height())?;
    Some(imageops::crop_imm(image, region.x, region.y, region.width, region.height).to_image())
}

/// Extract the face region and resize it to exactly `target_width × target_height`.
///
/// Resizing is bilinear and deterministic: the same image and box always
/// produce byte-identical output. Returns `None` when the clamped region is
/// empty, which callers treat as "no usable face" rather than a failure.
pub fn crop_face(
    image: &RgbImage,
    bbox: &BoundingBox,
    target_width: u32,
    target_height: u32,
) -> Option<RgbImage> {
    if target_width == 0 || target_height == 0 {
        return None;
    }
    let face = crop_region(image, bbox)?;
    if face.dimensions() == (target_width, target_height) {
        return Some(face);
    }
    Some(imageops::resize(&face, target_width, target_height, FilterType::Triangle))
}
