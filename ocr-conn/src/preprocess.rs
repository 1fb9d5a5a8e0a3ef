use crate::raster::NormalizedImage;
use image::{imageops, DynamicImage, ImageFormat};
use std::io::Cursor;

const CONTRAST_BOOST: f32 = 12.0;

/// PNG bytes handed to the local engine, optionally contrast-boosted.
pub fn engine_payload(image: &NormalizedImage, enhance: bool) -> Result<Vec<u8>, image::ImageError> {
    if !enhance {
        return image.encode_png();
    }
    let Some(decoded) = image.to_dynamic() else {
        return image.encode_png();
    };
    let enhanced = enhance_contrast(decoded);
    let mut cursor = Cursor::new(Vec::new());
    enhanced.write_to(&mut cursor, ImageFormat::Png)?;
    Ok(cursor.into_inner())
}

fn enhance_contrast(image: DynamicImage) -> DynamicImage {
    let rgba = image.to_rgba8();
    let adjusted = imageops::contrast(&rgba, CONTRAST_BOOST);
    DynamicImage::ImageRgba8(adjusted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::{ColorMode, SourceFormat};

    #[test]
    fn payload_is_png_with_same_size() {
        let image = NormalizedImage::new(vec![128; 12 * 9], 12, 9, ColorMode::Luma8, SourceFormat::Jpeg)
            .unwrap();
        for enhance in [false, true] {
            let png = engine_payload(&image, enhance).unwrap();
            assert_eq!(image::guess_format(&png).unwrap(), ImageFormat::Png);
            let decoded = image::load_from_memory(&png).unwrap();
            assert_eq!((decoded.width(), decoded.height()), (12, 9));
        }
    }
}
