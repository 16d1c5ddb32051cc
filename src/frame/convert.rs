//! YUV 4:2:0 / JPEG to RGB conversion
//!
//! Camera buffers arrive as three planes with independent row and pixel
//! strides. The converter first gathers them into a tightly packed NV21
//! buffer (all Y samples, then interleaved V/U pairs) and then runs a
//! BT.601 colour pass over that buffer to produce the RGB raster.
//!
//! The NV21 staging buffer lives in a [`ConversionArena`] owned by the
//! converter, so steady-state conversion at a fixed resolution does not
//! allocate anything except the output raster.

use image::{ImageFormat, RgbImage};

use super::{ConvertError, CropRect, PixelFormat, Plane, RasterFrame, RawFrame, Result};

/// Average bits per pixel of a 4:2:0 image (8 luma + 4 chroma)
const YUV420_BITS_PER_PIXEL: usize = 12;

/// Neutral chroma value
const CHROMA_ZERO: u8 = 128;

/// Reusable staging memory for YUV gathering.
///
/// Sized lazily on first use and reallocated only when the crop
/// resolution changes.
#[derive(Debug, Default)]
pub struct ConversionArena {
    resolution: Option<(u32, u32)>,
    yuv: Vec<u8>,
    row: Vec<u8>,
}

impl ConversionArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolution the staging buffer is currently sized for
    pub fn resolution(&self) -> Option<(u32, u32)> {
        self.resolution
    }

    /// Capacity of the staging buffer in bytes
    pub fn capacity(&self) -> usize {
        self.yuv.len()
    }

    fn prepare(&mut self, width: u32, height: u32) {
        if self.resolution == Some((width, height)) {
            return;
        }
        let pixel_count = width as usize * height as usize;
        let size = pixel_count * YUV420_BITS_PER_PIXEL / 8;
        log::debug!("Sizing YUV arena for {}x{} ({} bytes)", width, height, size);
        self.yuv = vec![0; size];
        self.resolution = Some((width, height));
    }

    fn row_scratch(&mut self, len: usize) -> &mut [u8] {
        if self.row.len() < len {
            self.row.resize(len, 0);
        }
        &mut self.row[..len]
    }
}

/// Converts camera frames into RGB rasters
#[derive(Debug, Default)]
pub struct PixelFormatConverter {
    arena: ConversionArena,
}

impl PixelFormatConverter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arena(&self) -> &ConversionArena {
        &self.arena
    }

    /// Convert one camera frame into an RGB raster.
    ///
    /// Only YUV420 and JPEG are understood; any other tag fails with
    /// [`ConvertError::UnsupportedFormat`].
    pub fn convert(&mut self, frame: &RawFrame<'_>) -> Result<RasterFrame> {
        match frame.format {
            PixelFormat::Jpeg => decode_jpeg(frame),
            PixelFormat::Yuv420 => self.convert_yuv420(frame),
            other => Err(ConvertError::UnsupportedFormat(other)),
        }
    }

    fn convert_yuv420(&mut self, frame: &RawFrame<'_>) -> Result<RasterFrame> {
        if frame.planes.len() < 3 {
            return Err(ConvertError::InvalidPlanes(format!(
                "YUV420 needs 3 planes, got {}",
                frame.planes.len()
            )));
        }
        // Chroma is subsampled in 2x2 blocks
        let crop = frame.crop.to_even();
        if crop.width() == 0 || crop.height() == 0 {
            return Err(ConvertError::InvalidPlanes(format!("empty crop {:?}", frame.crop)));
        }
        if crop != frame.crop {
            log::trace!("Crop {:?} snapped to {:?}", frame.crop, crop);
        }

        self.arena.prepare(crop.width(), crop.height());
        self.gather_nv21(frame, crop)?;

        let image = nv21_to_rgb(&self.arena.yuv, crop.width(), crop.height());
        Ok(RasterFrame::from_image(image))
    }

    /// Copy the three planes into the arena as NV21
    fn gather_nv21(&mut self, frame: &RawFrame<'_>, crop: CropRect) -> Result<()> {
        let pixel_count = crop.width() as usize * crop.height() as usize;

        for (index, plane) in frame.planes.iter().enumerate() {
            // (output stride, output offset): Y is packed, V lands on even
            // and U on odd bytes of the chroma half
            let (output_stride, output_offset) = match index {
                0 => (1, 0),
                1 => (2, pixel_count + 1),
                2 => (2, pixel_count),
                _ => {
                    log::warn!("Ignoring unexpected plane {} of YUV420 frame", index);
                    continue;
                }
            };

            let plane_crop = if index == 0 { crop } else { crop.half() };
            self.copy_plane(plane, plane_crop, output_offset, output_stride)
                .map_err(|e| ConvertError::InvalidPlanes(format!("plane {}: {}", index, e)))?;
        }
        Ok(())
    }

    fn copy_plane(
        &mut self,
        plane: &Plane<'_>,
        crop: CropRect,
        mut output_offset: usize,
        output_stride: usize,
    ) -> std::result::Result<(), String> {
        let plane_width = crop.width() as usize;
        let plane_height = crop.height() as usize;
        if plane_width == 0 || plane_height == 0 {
            return Ok(());
        }
        let pixel_stride = plane.pixel_stride.max(1);
        let packed = pixel_stride == 1 && output_stride == 1;

        // A strided row only needs to reach the last sample it reads
        let row_length = if packed {
            plane_width
        } else {
            (plane_width - 1) * pixel_stride + 1
        };

        for row in 0..plane_height {
            let start = (row + crop.top as usize) * plane.row_stride
                + crop.left as usize * pixel_stride;
            let source = plane
                .data
                .get(start..start + row_length)
                .ok_or_else(|| {
                    format!(
                        "row {} needs bytes {}..{} but plane has {}",
                        row,
                        start,
                        start + row_length,
                        plane.data.len()
                    )
                })?;

            if packed {
                let end = output_offset + row_length;
                let out = self
                    .arena
                    .yuv
                    .get_mut(output_offset..end)
                    .ok_or("output overflow")?;
                out.copy_from_slice(source);
                output_offset = end;
            } else {
                let scratch = self.arena.row_scratch(row_length);
                scratch.copy_from_slice(source);
                for col in 0..plane_width {
                    let sample = self.arena.row[col * pixel_stride];
                    let slot = self
                        .arena
                        .yuv
                        .get_mut(output_offset)
                        .ok_or("output overflow")?;
                    *slot = sample;
                    output_offset += output_stride;
                }
            }
        }
        Ok(())
    }
}

fn decode_jpeg(frame: &RawFrame<'_>) -> Result<RasterFrame> {
    let plane = frame
        .planes
        .first()
        .ok_or_else(|| ConvertError::InvalidPlanes("JPEG frame has no planes".into()))?;
    let decoded = image::load_from_memory_with_format(plane.data, ImageFormat::Jpeg)?;
    Ok(RasterFrame::from_image(decoded.to_rgb8()))
}

/// BT.601 limited-range NV21 to RGB
fn nv21_to_rgb(nv21: &[u8], width: u32, height: u32) -> RgbImage {
    let w = width as usize;
    let h = height as usize;
    let pixel_count = w * h;
    let chroma_width = w / 2;
    let chroma_height = h / 2;

    let mut rgb = Vec::with_capacity(pixel_count * 3);
    for y in 0..h {
        for x in 0..w {
            let luma = nv21[y * w + x];
            let (u, v) = if chroma_width == 0 || chroma_height == 0 {
                (CHROMA_ZERO, CHROMA_ZERO)
            } else {
                let cx = (x / 2).min(chroma_width - 1);
                let cy = (y / 2).min(chroma_height - 1);
                let base = pixel_count + (cy * chroma_width + cx) * 2;
                (nv21[base + 1], nv21[base])
            };
            rgb.extend_from_slice(&yuv_to_rgb(luma, u, v));
        }
    }

    // The vector is exactly width * height * 3 long
    RgbImage::from_raw(width, height, rgb).unwrap_or_else(|| RgbImage::new(width, height))
}

#[inline]
fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    let r = (298 * c + 409 * e + 128) >> 8;
    let g = (298 * c - 100 * d - 208 * e + 128) >> 8;
    let b = (298 * c + 516 * d + 128) >> 8;
    [clamp(r), clamp(g), clamp(b)]
}

#[inline]
fn clamp(value: i32) -> u8 {
    value.clamp(0, 255) as u8
}
