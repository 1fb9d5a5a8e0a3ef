use crate::error::NormalizeError;
use crate::pdf;
use crate::raster::{NormalizedImage, SourceFormat};
use image::imageops::FilterType;
use image::{DynamicImage, ImageDecoder, ImageReader};
use std::io::Cursor;
use tracing::debug;

pub const DEFAULT_MAX_PIXEL_BUDGET: u64 = 25_000_000; // ~25MP, 5000x5000
pub const DEFAULT_MAX_INPUT_BYTES: usize = 10 * 1024 * 1024;
pub const DEFAULT_PDF_RENDER_DPI: u32 = 200;

const SIGNATURES: &[(SourceFormat, &[u8])] = &[
    (SourceFormat::Png, b"\x89PNG\r\n\x1a\n"),
    (SourceFormat::Jpeg, &[0xFF, 0xD8, 0xFF]),
    (SourceFormat::Tiff, b"II*\0"),
    (SourceFormat::Tiff, b"MM\0*"),
    (SourceFormat::Bmp, b"BM"),
    (SourceFormat::Pdf, b"%PDF-"),
];

/// Outcome of matching the leading bytes against known magic numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signature {
    Exact(SourceFormat),
    /// Enough of a magic number matched to identify the format, the rest is damaged.
    Damaged(SourceFormat),
    Unknown,
}

pub fn sniff(bytes: &[u8]) -> Signature {
    if let Some((format, _)) = SIGNATURES.iter().find(|(_, magic)| bytes.starts_with(magic)) {
        return Signature::Exact(*format);
    }

    SIGNATURES
        .iter()
        .filter_map(|(format, magic)| {
            let shared = bytes
                .iter()
                .zip(magic.iter())
                .take_while(|(a, b)| a == b)
                .count();
            // at least half of the magic (and never fewer than two bytes)
            let needed = magic.len().div_ceil(2).max(2);
            (shared >= needed && shared < magic.len()).then_some((shared, *format))
        })
        .max_by_key(|(shared, _)| *shared)
        .map_or(Signature::Unknown, |(_, format)| Signature::Damaged(format))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NormalizerLimits {
    pub max_pixel_budget: u64,
    pub max_input_bytes: usize,
    pub pdf_render_dpi: u32,
}

impl Default for NormalizerLimits {
    fn default() -> Self {
        Self {
            max_pixel_budget: DEFAULT_MAX_PIXEL_BUDGET,
            max_input_bytes: DEFAULT_MAX_INPUT_BYTES,
            pdf_render_dpi: DEFAULT_PDF_RENDER_DPI,
        }
    }
}

/// Per-request normalization switches. Both transforms are opt-in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NormalizeOptions {
    pub auto_orient: bool,
    pub max_side: Option<u32>,
    /// 1-based page, only read for PDF input.
    pub page: u32,
}

impl Default for NormalizeOptions {
    fn default() -> Self {
        Self {
            auto_orient: false,
            max_side: None,
            page: 1,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ImageNormalizer {
    limits: NormalizerLimits,
}

impl ImageNormalizer {
    pub fn new(limits: NormalizerLimits) -> Self {
        Self { limits }
    }

    /// Validates and decodes an upload. The declared MIME type is only
    /// compared against the sniffed format for diagnostics.
    pub fn normalize(
        &self,
        bytes: &[u8],
        declared_mime: Option<&str>,
        options: &NormalizeOptions,
    ) -> Result<NormalizedImage, NormalizeError> {
        if bytes.is_empty() {
            return Err(NormalizeError::UnsupportedFormat("empty payload".into()));
        }
        if bytes.len() > self.limits.max_input_bytes {
            return Err(NormalizeError::ImageTooLarge(format!(
                "{} bytes exceeds the {} byte limit",
                bytes.len(),
                self.limits.max_input_bytes
            )));
        }

        let format = match sniff(bytes) {
            Signature::Exact(format) => format,
            Signature::Damaged(format) => {
                return Err(NormalizeError::CorruptImage(format!(
                    "damaged {} signature",
                    format.name()
                )))
            }
            Signature::Unknown => {
                return Err(NormalizeError::UnsupportedFormat(format!(
                    "no supported signature (declared {})",
                    declared_mime.unwrap_or("none")
                )))
            }
        };

        if let Some(declared) = declared_mime {
            if !format.matches_mime(declared) {
                debug!(
                    target: "ocr.normalize",
                    event = "normalize.mime_mismatch",
                    declared,
                    detected = format.mime(),
                );
            }
        }

        let decoded = match format.image_format() {
            Some(image_format) => self.decode_raster(bytes, image_format, options.auto_orient)?,
            None => pdf::rasterize_page(
                bytes,
                options.page,
                self.limits.pdf_render_dpi,
                self.limits.max_pixel_budget,
            )?,
        };

        let decoded = downscale(decoded, options.max_side);
        NormalizedImage::from_dynamic(decoded, format)
    }

    fn decode_raster(
        &self,
        bytes: &[u8],
        format: image::ImageFormat,
        auto_orient: bool,
    ) -> Result<DynamicImage, NormalizeError> {
        let reader = ImageReader::with_format(Cursor::new(bytes), format);
        let mut decoder = reader.into_decoder().map_err(NormalizeError::corrupt)?;

        let (width, height) = decoder.dimensions();
        check_pixel_budget(width, height, self.limits.max_pixel_budget)?;

        let orientation = if auto_orient {
            decoder.orientation().ok()
        } else {
            None
        };

        let mut image = DynamicImage::from_decoder(decoder).map_err(NormalizeError::corrupt)?;
        if (image.width(), image.height()) != (width, height) {
            return Err(NormalizeError::CorruptImage(format!(
                "header declares {width}x{height}, decoded {}x{}",
                image.width(),
                image.height()
            )));
        }
        if let Some(orientation) = orientation {
            image.apply_orientation(orientation);
        }
        Ok(image)
    }
}

pub(crate) fn check_pixel_budget(width: u32, height: u32, budget: u64) -> Result<(), NormalizeError> {
    if width == 0 || height == 0 {
        return Err(NormalizeError::CorruptImage(format!(
            "zero-sized image {width}x{height}"
        )));
    }
    let pixels = width as u64 * height as u64;
    if pixels > budget {
        return Err(NormalizeError::ImageTooLarge(format!(
            "{width}x{height} = {pixels} pixels exceeds the budget of {budget}"
        )));
    }
    Ok(())
}

fn downscale(image: DynamicImage, max_side: Option<u32>) -> DynamicImage {
    match max_side {
        Some(max) if max > 0 && image.width().max(image.height()) > max => {
            image.resize(max, max, FilterType::Triangle)
        }
        _ => image,
    }
}
