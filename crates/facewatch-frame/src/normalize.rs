//! Frame normalization: raw planes to an upright, independently owned RGB buffer.

use crate::frame::{Frame, PixelFormat, Plane, Rotation};
use image::error::ImageError;
use image::{imageops, DynamicImage, ImageDecoder, ImageReader, RgbImage};
use std::io::Cursor;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("unsupported frame format: {0}")]
    UnsupportedFormat(String),
    #[error("decode failed: {0}")]
    Decode(String),
}

/// Convert a frame into an upright RGB buffer.
///
/// The output never borrows the frame's planes.
pub fn normalize(frame: &Frame) -> Result<RgbImage, NormalizeError> {
    let expected = frame.format.plane_count();
    if frame.planes.len() != expected {
        return Err(NormalizeError::UnsupportedFormat(format!(
            "{:?} needs {expected} plane(s), got {}",
            frame.format,
            frame.planes.len()
        )));
    }

    let rgb = match frame.format {
        PixelFormat::Encoded => decode_encoded(&frame.planes[0].data)?,
        format => {
            if frame.width == 0 || frame.height == 0 {
                return Err(NormalizeError::Decode(format!(
                    "empty {format:?} frame: {}x{}",
                    frame.width, frame.height
                )));
            }
            convert_raw(frame)?
        }
    };

    Ok(rotate_upright(rgb, frame.rotation))
}

/// Rotate clockwise by the frame's rotation. `Deg0` hands the buffer back untouched.
pub fn rotate_upright(image: RgbImage, rotation: Rotation) -> RgbImage {
    match rotation {
        Rotation::Deg0 => image,
        Rotation::Deg90 => imageops::rotate90(&image),
        Rotation::Deg180 => imageops::rotate180(&image),
        Rotation::Deg270 => imageops::rotate270(&image),
    }
}

fn convert_raw(frame: &Frame) -> Result<RgbImage, NormalizeError> {
    let (w, h) = (frame.width as usize, frame.height as usize);
    let planes = &frame.planes;

    match frame.format {
        PixelFormat::Rgb8 => {
            check_plane("RGB", &planes[0], w, h, 3)?;
            Ok(build(frame, |x, y| {
                let o = offset(&planes[0], x, y);
                let d = &planes[0].data;
                [d[o], d[o + 1], d[o + 2]]
            }))
        }
        PixelFormat::Rgba8 => {
            check_plane("RGBA", &planes[0], w, h, 4)?;
            Ok(build(frame, |x, y| {
                let o = offset(&planes[0], x, y);
                let d = &planes[0].data;
                [d[o], d[o + 1], d[o + 2]]
            }))
        }
        PixelFormat::Gray8 => {
            check_plane("GRAY", &planes[0], w, h, 1)?;
            Ok(build(frame, |x, y| {
                let v = planes[0].data[offset(&planes[0], x, y)];
                [v, v, v]
            }))
        }
        PixelFormat::Yuyv => {
            if w % 2 != 0 {
                return Err(NormalizeError::Decode(format!("YUYV width must be even, got {w}")));
            }
            let plane = &planes[0];
            check_len("YUYV", plane, extent("YUYV", h, plane.row_stride, w * 2)?)?;
            Ok(build(frame, |x, y| {
                let pair = y * plane.row_stride + (x / 2) * 4;
                let d = &plane.data;
                let luma = if x % 2 == 0 { d[pair] } else { d[pair + 2] };
                yuv_to_rgb(luma, d[pair + 1], d[pair + 3])
            }))
        }
        PixelFormat::Nv21 => {
            let (luma, vu) = (&planes[0], &planes[1]);
            check_plane("NV21 Y", luma, w, h, 1)?;
            check_len("NV21 VU", vu, extent("NV21 VU", h.div_ceil(2), vu.row_stride, w.div_ceil(2) * 2)?)?;
            Ok(build(frame, |x, y| {
                let c = (y / 2) * vu.row_stride + (x / 2) * 2;
                yuv_to_rgb(luma.data[offset(luma, x, y)], vu.data[c + 1], vu.data[c])
            }))
        }
        PixelFormat::Yuv420 => {
            let (luma, u, v) = (&planes[0], &planes[1], &planes[2]);
            check_plane("YUV420 Y", luma, w, h, 1)?;
            check_plane("YUV420 U", u, w.div_ceil(2), h.div_ceil(2), 1)?;
            check_plane("YUV420 V", v, w.div_ceil(2), h.div_ceil(2), 1)?;
            Ok(build(frame, |x, y| {
                yuv_to_rgb(
                    luma.data[offset(luma, x, y)],
                    u.data[offset(u, x / 2, y / 2)],
                    v.data[offset(v, x / 2, y / 2)],
                )
            }))
        }
        PixelFormat::Encoded => unreachable!("encoded frames are decoded separately"),
    }
}

fn build(frame: &Frame, mut pixel: impl FnMut(usize, usize) -> [u8; 3]) -> RgbImage {
    let mut out = RgbImage::new(frame.width, frame.height);
    for (x, y, p) in out.enumerate_pixels_mut() {
        p.0 = pixel(x as usize, y as usize);
    }
    out
}

fn offset(plane: &Plane, x: usize, y: usize) -> usize {
    y * plane.row_stride + x * plane.pixel_stride
}

/// Verify a `w × h` grid of `sample_bytes`-wide samples fits in the plane.
fn check_plane(name: &str, plane: &Plane, w: usize, h: usize, sample_bytes: usize) -> Result<(), NormalizeError> {
    let row_bytes = extent(name, w, plane.pixel_stride, sample_bytes)?;
    if plane.pixel_stride < sample_bytes || plane.row_stride < row_bytes {
        return Err(NormalizeError::UnsupportedFormat(format!(
            "{name} plane strides too small: row {}, pixel {}",
            plane.row_stride, plane.pixel_stride
        )));
    }
    check_len(name, plane, extent(name, h, plane.row_stride, row_bytes)?)
}

/// Bytes spanned by `count` items `stride` apart, the last one `last` bytes
/// wide: `(count - 1) * stride + last`. Overflow means the strides are bogus.
fn extent(name: &str, count: usize, stride: usize, last: usize) -> Result<usize, NormalizeError> {
    count
        .checked_sub(1)
        .and_then(|n| n.checked_mul(stride))
        .and_then(|span| span.checked_add(last))
        .ok_or_else(|| NormalizeError::UnsupportedFormat(format!("{name} plane stride {stride} out of range")))
}

fn check_len(name: &str, plane: &Plane, needed: usize) -> Result<(), NormalizeError> {
    if plane.data.len() < needed {
        return Err(NormalizeError::Decode(format!(
            "{name} plane too short: expected {needed}, got {}",
            plane.data.len()
        )));
    }
    Ok(())
}

/// Full-range BT.601 YUV to RGB.
fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let y = y as f32;
    let u = u as f32 - 128.0;
    let v = v as f32 - 128.0;

    let r = y + 1.402 * v;
    let g = y - 0.344_136 * u - 0.714_136 * v;
    let b = y + 1.772 * u;

    [
        r.round().clamp(0.0, 255.0) as u8,
        g.round().clamp(0.0, 255.0) as u8,
        b.round().clamp(0.0, 255.0) as u8,
    ]
}

/// Decode a compressed still image and apply its EXIF orientation.
fn decode_encoded(data: &[u8]) -> Result<RgbImage, NormalizeError> {
    let reader = ImageReader::new(Cursor::new(data))
        .with_guessed_format()
        .map_err(|e| NormalizeError::Decode(e.to_string()))?;
    if reader.format().is_none() {
        return Err(NormalizeError::UnsupportedFormat("unrecognized image container".into()));
    }

    let mut decoder = reader.into_decoder().map_err(image_error)?;
    let orientation = decoder.orientation().map_err(image_error)?;
    let mut image = DynamicImage::from_decoder(decoder).map_err(image_error)?;
    image.apply_orientation(orientation);

    Ok(image.into_rgb8())
}

fn image_error(e: ImageError) -> NormalizeError {
    match e {
        ImageError::Unsupported(u) => NormalizeError::UnsupportedFormat(u.to_string()),
        other => NormalizeError::Decode(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgb};

    /// Asymmetric test card: every pixel is unique, so any wrong rotation shows.
    fn card(w: u32, h: u32) -> RgbImage {
        RgbImage::from_fn(w, h, |x, y| Rgb([x as u8 * 10, y as u8 * 10, 7]))
    }

    fn rgb_frame(image: &RgbImage) -> Frame {
        Frame::packed(PixelFormat::Rgb8, image.width(), image.height(), image.as_raw().clone())
    }

    #[test]
    fn test_rgb_passthrough() {
        let upright = card(5, 3);
        assert_eq!(normalize(&rgb_frame(&upright)).unwrap(), upright);
    }

    #[test]
    fn test_rotation_always_upright() {
        let upright = card(6, 4);
        // What the sensor delivers for each declared rotation.
        let cases = [
            (Rotation::Deg0, upright.clone()),
            (Rotation::Deg90, imageops::rotate270(&upright)),
            (Rotation::Deg180, imageops::rotate180(&upright)),
            (Rotation::Deg270, imageops::rotate90(&upright)),
        ];
        for (rotation, raw) in cases {
            let frame = rgb_frame(&raw).with_rotation(rotation);
            let out = normalize(&frame).unwrap();
            assert_eq!(out, upright, "rotation {rotation:?}");
        }
    }

    #[test]
    fn test_rgba_drops_alpha() {
        let frame = Frame::packed(PixelFormat::Rgba8, 2, 1, vec![1, 2, 3, 255, 4, 5, 6, 0]);
        let out = normalize(&frame).unwrap();
        assert_eq!(out.as_raw(), &vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_rgb_row_padding() {
        // 2x2 with 2 bytes of padding per row.
        let data = vec![1, 1, 1, 2, 2, 2, 0, 0, 3, 3, 3, 4, 4, 4, 0, 0];
        let frame = Frame::new(PixelFormat::Rgb8, 2, 2, vec![Plane::new(data, 8, 3)]);
        let out = normalize(&frame).unwrap();
        assert_eq!(out.get_pixel(0, 1), &Rgb([3, 3, 3]));
        assert_eq!(out.get_pixel(1, 1), &Rgb([4, 4, 4]));
    }

    #[test]
    fn test_gray_replicates() {
        let frame = Frame::packed(PixelFormat::Gray8, 2, 1, vec![10, 200]);
        let out = normalize(&frame).unwrap();
        assert_eq!(out.get_pixel(1, 0), &Rgb([200, 200, 200]));
    }

    #[test]
    fn test_yuv_neutral_gray() {
        assert_eq!(yuv_to_rgb(128, 128, 128), [128, 128, 128]);
    }

    #[test]
    fn test_yuv_red() {
        assert_eq!(yuv_to_rgb(76, 85, 255), [254, 0, 0]);
    }

    #[test]
    fn test_yuyv_two_pixels() {
        let frame = Frame::packed(PixelFormat::Yuyv, 2, 1, vec![50, 128, 200, 128]);
        let out = normalize(&frame).unwrap();
        assert_eq!(out.get_pixel(0, 0), &Rgb([50, 50, 50]));
        assert_eq!(out.get_pixel(1, 0), &Rgb([200, 200, 200]));
    }

    #[test]
    fn test_yuyv_odd_width() {
        let frame = Frame::packed(PixelFormat::Yuyv, 3, 1, vec![0; 6]);
        assert!(matches!(normalize(&frame), Err(NormalizeError::Decode(_))));
    }

    #[test]
    fn test_nv21_chroma_order() {
        // 2x2 luma, one VU pair: V=255, U=85 -> red.
        let frame = Frame::new(
            PixelFormat::Nv21,
            2,
            2,
            vec![Plane::new(vec![76; 4], 2, 1), Plane::new(vec![255, 85], 2, 2)],
        );
        let out = normalize(&frame).unwrap();
        assert!(out.pixels().all(|p| *p == Rgb([254, 0, 0])));
    }

    #[test]
    fn test_yuv420_strided_chroma() {
        // Interleaved chroma exposed as two planes with pixel stride 2 (NV21 memory).
        let vu = vec![255, 85];
        let frame = Frame::new(
            PixelFormat::Yuv420,
            2,
            2,
            vec![
                Plane::new(vec![76; 4], 2, 1),
                Plane::new(vec![vu[1], vu[0]], 2, 2),
                Plane::new(vec![vu[0]], 2, 2),
            ],
        );
        let out = normalize(&frame).unwrap();
        assert!(out.pixels().all(|p| *p == Rgb([254, 0, 0])));
    }

    #[test]
    fn test_wrong_plane_count_is_unsupported() {
        let frame = Frame::new(PixelFormat::Yuv420, 2, 2, vec![Plane::new(vec![0; 4], 2, 1)]);
        assert!(matches!(normalize(&frame), Err(NormalizeError::UnsupportedFormat(_))));
    }

    #[test]
    fn test_huge_stride_is_unsupported() {
        let frame = Frame::new(PixelFormat::Gray8, 2, 3, vec![Plane::new(vec![0; 16], usize::MAX / 2 + 1, 1)]);
        assert!(matches!(normalize(&frame), Err(NormalizeError::UnsupportedFormat(_))));

        let frame = Frame::new(PixelFormat::Yuyv, 2, 3, vec![Plane::new(vec![0; 16], usize::MAX / 2 + 1, 2)]);
        assert!(matches!(normalize(&frame), Err(NormalizeError::UnsupportedFormat(_))));

        let frame = Frame::new(PixelFormat::Rgb8, 3, 1, vec![Plane::new(vec![0; 16], 9, usize::MAX / 2)]);
        assert!(matches!(normalize(&frame), Err(NormalizeError::UnsupportedFormat(_))));
    }

    #[test]
    fn test_short_plane_is_decode_error() {
        let frame = Frame::packed(PixelFormat::Rgb8, 4, 4, vec![0; 10]);
        assert!(matches!(normalize(&frame), Err(NormalizeError::Decode(_))));
    }

    #[test]
    fn test_encoded_png() {
        let upright = card(7, 5);
        let mut bytes = Vec::new();
        upright.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png).unwrap();
        let out = normalize(&Frame::encoded(bytes)).unwrap();
        assert_eq!(out, upright);
    }

    #[test]
    fn test_encoded_garbage_is_unsupported() {
        let frame = Frame::encoded(vec![0x00, 0x01, 0x02, 0x03]);
        assert!(matches!(normalize(&frame), Err(NormalizeError::UnsupportedFormat(_))));
    }

    #[test]
    fn test_encoded_truncated_jpeg_fails() {
        let frame = Frame::encoded(vec![0xFF, 0xD8, 0xFF, 0xE0, 0x00]);
        assert!(normalize(&frame).is_err());
    }

    #[test]
    fn test_output_is_independent_copy() {
        let upright = card(3, 3);
        let frame = rgb_frame(&upright);
        let out = normalize(&frame).unwrap();
        drop(frame);
        assert_eq!(out, upright);
    }
}
