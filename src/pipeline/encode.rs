//! Image encoding: `DynamicImage` → PNG bytes → base64 `ImageData`.
//!
//! The page PNG is produced once at rasterisation time and reused by the OCR
//! engine (from its temp file) and by every generation call that attaches the
//! page (base64 data-URI). PNG keeps glyph edges crisp; JPEG artefacts on
//! rendered text hurt both OCR and the vision model.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use image::DynamicImage;
use std::io::Cursor;
use tracing::debug;

/// Encode a rasterised page as PNG bytes.
pub fn png_bytes(img: &DynamicImage) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;
    Ok(buf)
}

/// Wrap PNG bytes as a base64 image attachment for the generation service.
///
/// `detail: "high"` asks tiling vision models to keep fine print legible.
pub fn image_data(png: &[u8]) -> ImageData {
    let b64 = STANDARD.encode(png);
    debug!("Encoded page image → {} bytes base64", b64.len());
    ImageData::new(b64, "image/png").with_detail("high")
}
