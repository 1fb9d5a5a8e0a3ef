use crate::error::NormalizeError;
use image::{ColorType, DynamicImage, ImageBuffer, ImageFormat};
use serde::Serialize;
use std::io::Cursor;

/// Container format detected from the leading bytes of an upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceFormat {
    Png,
    Jpeg,
    Tiff,
    Bmp,
    Pdf,
}

impl SourceFormat {
    pub const fn mime(self) -> &'static str {
        match self {
            SourceFormat::Png => "image/png",
            SourceFormat::Jpeg => "image/jpeg",
            SourceFormat::Tiff => "image/tiff",
            SourceFormat::Bmp => "image/bmp",
            SourceFormat::Pdf => "application/pdf",
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            SourceFormat::Png => "png",
            SourceFormat::Jpeg => "jpeg",
            SourceFormat::Tiff => "tiff",
            SourceFormat::Bmp => "bmp",
            SourceFormat::Pdf => "pdf",
        }
    }

    /// Whether a client supplied MIME type names this format.
    pub fn matches_mime(self, declared: &str) -> bool {
        let essence = declared
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        match self {
            SourceFormat::Jpeg => matches!(essence.as_str(), "image/jpeg" | "image/jpg" | "image/pjpeg"),
            SourceFormat::Bmp => matches!(essence.as_str(), "image/bmp" | "image/x-bmp" | "image/x-ms-bmp"),
            SourceFormat::Tiff => matches!(essence.as_str(), "image/tiff" | "image/tif"),
            other => essence == other.mime(),
        }
    }

    pub(crate) const fn image_format(self) -> Option<ImageFormat> {
        match self {
            SourceFormat::Png => Some(ImageFormat::Png),
            SourceFormat::Jpeg => Some(ImageFormat::Jpeg),
            SourceFormat::Tiff => Some(ImageFormat::Tiff),
            SourceFormat::Bmp => Some(ImageFormat::Bmp),
            SourceFormat::Pdf => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorMode {
    Luma8,
    Rgb8,
    Rgba8,
}

impl ColorMode {
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            ColorMode::Luma8 => 1,
            ColorMode::Rgb8 => 3,
            ColorMode::Rgba8 => 4,
        }
    }

    const fn color_type(self) -> ColorType {
        match self {
            ColorMode::Luma8 => ColorType::L8,
            ColorMode::Rgb8 => ColorType::Rgb8,
            ColorMode::Rgba8 => ColorType::Rgba8,
        }
    }
}

/// Decoded 8-bit pixel buffer handed to recognizers.
///
/// Construction checks `width > 0`, `height > 0` and
/// `pixels.len() == width * height * bytes_per_pixel`, so every value of this
/// type can be re-encoded without further validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedImage {
    pixels: Vec<u8>,
    width: u32,
    height: u32,
    color: ColorMode,
    source: SourceFormat,
}

impl NormalizedImage {
    pub fn new(
        pixels: Vec<u8>,
        width: u32,
        height: u32,
        color: ColorMode,
        source: SourceFormat,
    ) -> Result<Self, NormalizeError> {
        if width == 0 || height == 0 {
            return Err(NormalizeError::CorruptImage(format!(
                "zero-sized image {width}x{height}"
            )));
        }
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|px| px.checked_mul(color.bytes_per_pixel()))
            .ok_or_else(|| NormalizeError::ImageTooLarge(format!("{width}x{height} overflows")))?;
        if pixels.len() != expected {
            return Err(NormalizeError::CorruptImage(format!(
                "pixel buffer holds {} bytes, {width}x{height} {:?} needs {expected}",
                pixels.len(),
                color
            )));
        }
        Ok(Self {
            pixels,
            width,
            height,
            color,
            source,
        })
    }

    /// Collapses any decoded image to the nearest 8-bit layout.
    pub fn from_dynamic(image: DynamicImage, source: SourceFormat) -> Result<Self, NormalizeError> {
        let color_type = image.color();
        let (width, height) = (image.width(), image.height());
        let (color, pixels) = if color_type.has_alpha() {
            (ColorMode::Rgba8, image.into_rgba8().into_raw())
        } else if color_type.has_color() {
            (ColorMode::Rgb8, image.into_rgb8().into_raw())
        } else {
            (ColorMode::Luma8, image.into_luma8().into_raw())
        };
        Self::new(pixels, width, height, color, source)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn color(&self) -> ColorMode {
        self.color
    }

    pub fn source(&self) -> SourceFormat {
        self.source
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn pixel_count(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn to_dynamic(&self) -> Option<DynamicImage> {
        let (w, h) = self.dimensions();
        let pixels = self.pixels.clone();
        match self.color {
            ColorMode::Luma8 => ImageBuffer::from_raw(w, h, pixels).map(DynamicImage::ImageLuma8),
            ColorMode::Rgb8 => ImageBuffer::from_raw(w, h, pixels).map(DynamicImage::ImageRgb8),
            ColorMode::Rgba8 => ImageBuffer::from_raw(w, h, pixels).map(DynamicImage::ImageRgba8),
        }
    }

    pub fn encode_png(&self) -> Result<Vec<u8>, image::ImageError> {
        let mut cursor = Cursor::new(Vec::with_capacity(self.pixels.len() / 2));
        image::write_buffer_with_format(
            &mut cursor,
            &self.pixels,
            self.width,
            self.height,
            self.color.color_type(),
            ImageFormat::Png,
        )?;
        Ok(cursor.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Rgb, RgbImage, Rgba, RgbaImage};

    #[test]
    fn rejects_buffer_length_mismatch() {
        let err = NormalizedImage::new(vec![0; 11], 2, 2, ColorMode::Rgb8, SourceFormat::Png)
            .unwrap_err();
        assert!(matches!(err, NormalizeError::CorruptImage(_)));
    }

    #[test]
    fn rejects_zero_dimensions() {
        let err = NormalizedImage::new(Vec::new(), 0, 4, ColorMode::Luma8, SourceFormat::Bmp)
            .unwrap_err();
        assert!(matches!(err, NormalizeError::CorruptImage(_)));
    }

    #[test]
    fn picks_color_mode_from_decoded_layout() {
        let gray = DynamicImage::ImageLuma8(GrayImage::new(3, 2));
        let rgb = DynamicImage::ImageRgb8(RgbImage::from_pixel(3, 2, Rgb([1, 2, 3])));
        let rgba = DynamicImage::ImageRgba8(RgbaImage::from_pixel(3, 2, Rgba([1, 2, 3, 4])));

        let gray = NormalizedImage::from_dynamic(gray, SourceFormat::Png).unwrap();
        let rgb = NormalizedImage::from_dynamic(rgb, SourceFormat::Jpeg).unwrap();
        let rgba = NormalizedImage::from_dynamic(rgba, SourceFormat::Tiff).unwrap();

        assert_eq!(gray.color(), ColorMode::Luma8);
        assert_eq!(gray.pixels().len(), 6);
        assert_eq!(rgb.color(), ColorMode::Rgb8);
        assert_eq!(rgb.pixels().len(), 18);
        assert_eq!(rgba.color(), ColorMode::Rgba8);
        assert_eq!(rgba.pixels().len(), 24);
    }

    #[test]
    fn png_encoding_keeps_dimensions() {
        let rgb = DynamicImage::ImageRgb8(RgbImage::from_pixel(7, 5, Rgb([9, 9, 9])));
        let image = NormalizedImage::from_dynamic(rgb, SourceFormat::Bmp).unwrap();
        let png = image.encode_png().unwrap();
        let decoded = image::load_from_memory(&png).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (7, 5));
    }

    #[test]
    fn mime_aliases() {
        assert!(SourceFormat::Jpeg.matches_mime("image/jpg"));
        assert!(SourceFormat::Png.matches_mime("image/PNG; charset=binary"));
        assert!(!SourceFormat::Png.matches_mime("image/jpeg"));
    }
}
