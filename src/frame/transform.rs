// Rotation and down-scaling applied between RGB conversion and compression

use image::imageops::{self, FilterType};

use super::RasterFrame;

const SCALE_TOLERANCE: f32 = 1e-5;

/// Maximum output size in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// Uniform scale factor that fits `width`x`height` inside `max`.
/// Returns 1.0 when the image already fits.
pub fn scale_to_fit(width: u32, height: u32, max: Resolution) -> f32 {
    if width == 0 || height == 0 || (width <= max.width && height <= max.height) {
        return 1.0;
    }
    let by_height = max.height as f32 / height as f32;
    let by_width = max.width as f32 / width as f32;
    by_height.min(by_width)
}

/// Rotate by `rotation_degrees` then scale uniformly by `scale`.
///
/// Returns the input untouched when there is nothing to do, otherwise a new
/// raster (the input is consumed and dropped). Camera rotations are quarter
/// turns; anything else is snapped to the nearest quarter turn.
pub fn transform(frame: RasterFrame, rotation_degrees: i32, scale: f32) -> RasterFrame {
    let rotation = rotation_degrees.rem_euclid(360);
    let change_rotation = rotation != 0;
    let change_scale = (scale - 1.0).abs() > SCALE_TOLERANCE;
    if !change_rotation && !change_scale {
        return frame;
    }

    let mut image = frame.into_image();

    if change_rotation {
        let quarter = ((rotation as f32 / 90.0).round() as i32).rem_euclid(4);
        if rotation % 90 != 0 {
            log::warn!(
                "Rotation of {} degrees is not a quarter turn, using {}",
                rotation,
                quarter * 90
            );
        }
        image = match quarter {
            1 => imageops::rotate90(&image),
            2 => imageops::rotate180(&image),
            3 => imageops::rotate270(&image),
            _ => image,
        };
    }

    if change_scale && scale > 0.0 {
        let width = ((image.width() as f32 * scale).round() as u32).max(1);
        let height = ((image.height() as f32 * scale).round() as u32).max(1);
        image = imageops::resize(&image, width, height, FilterType::Triangle);
    }

    RasterFrame::from_image(image)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_returns_same_raster() {
        let frame = RasterFrame::solid(4, 2, [1, 2, 3]);
        let out = transform(frame.clone(), 360, 1.000001);
        assert_eq!(out, frame);
    }

    #[test]
    fn quarter_turn_swaps_dimensions() {
        let mut pixels = vec![0u8; 4 * 2 * 3];
        // mark the top-left pixel
        pixels[0..3].copy_from_slice(&[255, 0, 0]);
        let frame = RasterFrame::from_rgb(4, 2, pixels).unwrap();

        let out = transform(frame, 90, 1.0);
        assert_eq!((out.width(), out.height()), (2, 4));
        // clockwise: top-left moves to top-right
        assert_eq!(out.pixel(1, 0), [255, 0, 0]);
    }

    #[test]
    fn negative_rotation_is_normalised() {
        let frame = RasterFrame::solid(4, 2, [0, 0, 0]);
        let out = transform(frame, -90, 1.0);
        assert_eq!((out.width(), out.height()), (2, 4));
    }

    #[test]
    fn rotate_then_scale() {
        let frame = RasterFrame::solid(40, 20, [9, 9, 9]);
        let out = transform(frame, 270, 0.5);
        assert_eq!((out.width(), out.height()), (10, 20));
    }

    #[test]
    fn scale_only_applies_when_too_large() {
        let max = Resolution::new(1280, 720);
        assert_eq!(scale_to_fit(640, 480, max), 1.0);
        assert_eq!(scale_to_fit(2560, 1440, max), 0.5);
        // height-bound
        let s = scale_to_fit(1280, 1440, max);
        assert!((s - 0.5).abs() < 1e-6);
    }
}
