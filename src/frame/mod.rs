// Camera frame types
//
// RawFrame is the borrowed view the camera collaborator hands us for the
// duration of one callback. RasterFrame is the owned RGB image we produce
// from it and keep until it has been compressed into the frame store.

pub mod convert;
pub mod transform;

pub use convert::PixelFormatConverter;
pub use transform::{scale_to_fit, transform, Resolution};

use image::RgbImage;

/// Error type for frame conversion
#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    #[error("Unsupported pixel format: {0:?}")]
    UnsupportedFormat(PixelFormat),

    #[error("Invalid plane layout: {0}")]
    InvalidPlanes(String),

    #[error("Image decode error: {0}")]
    Decode(#[from] image::ImageError),
}

pub type Result<T> = std::result::Result<T, ConvertError>;

/// Pixel format tag carried by a camera frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// Planar / semi-planar YUV 4:2:0 (three planes, Y U V)
    Yuv420,
    /// Single-plane JPEG bitstream
    Jpeg,
    /// Anything else the camera may report, by its platform code
    Other(i32),
}

/// Sub-region of a plane that holds valid image data.
/// `right` and `bottom` are exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRect {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

impl CropRect {
    pub fn new(left: u32, top: u32, right: u32, bottom: u32) -> Self {
        Self { left, top, right, bottom }
    }

    /// Crop covering a full `width`x`height` image
    pub fn full(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }

    pub fn width(&self) -> u32 {
        self.right.saturating_sub(self.left)
    }

    pub fn height(&self) -> u32 {
        self.bottom.saturating_sub(self.top)
    }

    /// Shrink to even bounds so the chroma rectangle is exactly half size
    pub fn to_even(&self) -> Self {
        let left = self.left & !1;
        let top = self.top & !1;
        let width = self.right.saturating_sub(left) & !1;
        let height = self.bottom.saturating_sub(top) & !1;
        Self::new(left, top, left + width, top + height)
    }

    /// The same rectangle in half-resolution chroma coordinates
    pub fn half(&self) -> Self {
        Self::new(self.left / 2, self.top / 2, self.right / 2, self.bottom / 2)
    }
}

/// One plane of a camera buffer
#[derive(Debug, Clone, Copy)]
pub struct Plane<'a> {
    pub data: &'a [u8],
    /// Bytes between the starts of consecutive rows
    pub row_stride: usize,
    /// Bytes between consecutive samples within a row
    pub pixel_stride: usize,
}

/// Immutable view over a multi-plane camera buffer
#[derive(Debug, Clone)]
pub struct RawFrame<'a> {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub planes: Vec<Plane<'a>>,
    pub crop: CropRect,
    pub rotation_degrees: i32,
}

impl<'a> RawFrame<'a> {
    /// Frame whose crop rectangle covers the whole buffer
    pub fn new(width: u32, height: u32, format: PixelFormat, planes: Vec<Plane<'a>>) -> Self {
        Self {
            width,
            height,
            format,
            planes,
            crop: CropRect::full(width, height),
            rotation_degrees: 0,
        }
    }

    pub fn with_crop(mut self, crop: CropRect) -> Self {
        self.crop = crop;
        self
    }

    pub fn with_rotation(mut self, degrees: i32) -> Self {
        self.rotation_degrees = degrees;
        self
    }
}

/// Decoded, interleaved RGB raster
#[derive(Debug, Clone, PartialEq)]
pub struct RasterFrame {
    image: RgbImage,
}

impl RasterFrame {
    pub fn from_image(image: RgbImage) -> Self {
        Self { image }
    }

    /// Build from packed RGB bytes; `None` if the length doesn't match
    pub fn from_rgb(width: u32, height: u32, pixels: Vec<u8>) -> Option<Self> {
        RgbImage::from_raw(width, height, pixels).map(Self::from_image)
    }

    /// Raster filled with a single colour
    pub fn solid(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        Self::from_image(RgbImage::from_pixel(width, height, image::Rgb(rgb)))
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn pixels(&self) -> &[u8] {
        self.image.as_raw()
    }

    pub fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
        self.image.get_pixel(x, y).0
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn into_image(self) -> RgbImage {
        self.image
    }
}
