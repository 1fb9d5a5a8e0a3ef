use crate::error::NormalizeError;
use crate::normalize::check_pixel_budget;
use image::DynamicImage;
use pdf2image::{Pages, RenderOptionsBuilder, DPI};
use std::io::Write;
use std::process::{Command, Stdio};
use tracing::debug;

const MIN_RENDER_DPI: u32 = 72;
const MAX_RENDER_DPI: u32 = 600;
const POINTS_PER_INCH: f64 = 72.0;

/// Renders one page of a PDF through poppler. Out-of-range pages are clamped
/// to the document's page count.
pub fn rasterize_page(
    bytes: &[u8],
    page: u32,
    dpi: u32,
    max_pixel_budget: u64,
) -> Result<DynamicImage, NormalizeError> {
    let pdf = pdf2image::PDF::from_bytes(bytes.to_vec())
        .map_err(|e| NormalizeError::CorruptImage(format!("unreadable pdf: {e}")))?;

    let page_count = pdf.page_count();
    if page_count == 0 {
        return Err(NormalizeError::CorruptImage("pdf has no pages".into()));
    }
    let page = page.clamp(1, page_count);
    let dpi = dpi.clamp(MIN_RENDER_DPI, MAX_RENDER_DPI);
    debug!(
        target: "ocr.normalize",
        event = "normalize.pdf_render",
        page,
        page_count,
        dpi,
    );

    // poppler allocates the full page, so reject oversized pages up front
    match page_size_points(bytes, page) {
        Some(size) => {
            let (width, height) = pixel_size(size, dpi);
            check_pixel_budget(width, height, max_pixel_budget)?;
        }
        None => debug!(
            target: "ocr.normalize",
            event = "normalize.pdf_size_unknown",
            page,
        ),
    }

    let mut binding = RenderOptionsBuilder::default();
    let builder = binding.pdftocairo(true).resolution(DPI::Uniform(dpi));
    let options = builder
        .build()
        .map_err(|e| NormalizeError::CorruptImage(format!("pdf render options: {e}")))?;

    let image = pdf
        .render(Pages::Range(page..=page), options)
        .map_err(|e| NormalizeError::CorruptImage(format!("pdf page {page} failed to render: {e}")))?
        .into_iter()
        .next()
        .ok_or_else(|| NormalizeError::CorruptImage(format!("pdf page {page} rendered nothing")))?;

    check_pixel_budget(image.width(), image.height(), max_pixel_budget)?;
    Ok(image)
}

/// Page size in points as reported by `pdfinfo`.
fn page_size_points(bytes: &[u8], page: u32) -> Option<(f64, f64)> {
    let page_arg = page.to_string();
    let mut child = Command::new(poppler_executable("pdfinfo"))
        .args(["-f", &page_arg, "-l", &page_arg, "-"])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .ok()?;
    // stdin is dropped right after writing so pdfinfo sees EOF
    let written = child.stdin.take().map(|mut stdin| stdin.write_all(bytes));
    let output = child.wait_with_output().ok()?;
    if matches!(written, Some(Err(_))) || !output.status.success() {
        return None;
    }
    parse_page_size(&String::from_utf8_lossy(&output.stdout))
}

// same lookup pdf2image uses for the poppler tools
fn poppler_executable(command: &str) -> String {
    match std::env::var("PDF2IMAGE_POPPLER_PATH") {
        Ok(dir) if cfg!(windows) => format!("{dir}\\{command}.exe"),
        Ok(dir) => format!("{dir}/{command}"),
        Err(_) if cfg!(windows) => format!("{command}.exe"),
        Err(_) => command.to_string(),
    }
}

/// Reads `Page    3 size: 612 x 792 pts (letter)` or `Page size: 612 x 792 pts`.
fn parse_page_size(pdfinfo: &str) -> Option<(f64, f64)> {
    pdfinfo.lines().find_map(|line| {
        if !line.starts_with("Page") {
            return None;
        }
        let (_, rest) = line.split_once("size:")?;
        let mut parts = rest.split_whitespace();
        let width: f64 = parts.next()?.parse().ok()?;
        if parts.next()? != "x" {
            return None;
        }
        let height: f64 = parts.next()?.parse().ok()?;
        (width.is_finite() && height.is_finite() && width > 0.0 && height > 0.0).then_some((width, height))
    })
}

fn pixel_size((width_pt, height_pt): (f64, f64), dpi: u32) -> (u32, u32) {
    let scale = dpi as f64 / POINTS_PER_INCH;
    // `as` saturates for floats
    ((width_pt * scale).ceil() as u32, (height_pt * scale).ceil() as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn garbage_after_pdf_magic_is_corrupt() {
        let err = rasterize_page(b"%PDF-1.7\nnot really a pdf", 1, 150, u64::MAX).unwrap_err();
        assert!(matches!(err, NormalizeError::CorruptImage(_)));
    }

    #[test]
    fn reads_page_size_from_pdfinfo_output() {
        let output = "Producer:       test\nPages:          2\nPage    2 size: 612 x 792 pts (letter)\nPage    2 rot:  0\n";
        assert_eq!(parse_page_size(output), Some((612.0, 792.0)));
        assert_eq!(parse_page_size("Page size:      595.276 x 841.89 pts (A4)\n"), Some((595.276, 841.89)));
        assert_eq!(parse_page_size("Pages:          2\n"), None);
        assert_eq!(parse_page_size("Page    1 size: 0 x 792 pts\n"), None);
    }

    #[test]
    fn page_estimate_rejects_large_pages_before_rendering() {
        // letter page at 600 dpi is 5100 x 6600
        let (width, height) = pixel_size((612.0, 792.0), 600);
        assert_eq!((width, height), (5100, 6600));
        let err = check_pixel_budget(width, height, 25_000_000).unwrap_err();
        assert!(matches!(err, NormalizeError::ImageTooLarge(_)));

        let (width, height) = pixel_size((612.0, 792.0), 200);
        assert_eq!((width, height), (1700, 2200));
        assert!(check_pixel_budget(width, height, 25_000_000).is_ok());
    }
}
