//! Rasterisation: turn a page artifact into PNG images for the VLM.
//!
//! ## Why spawn_blocking?
//!
//! `pdfium-render` wraps the pdfium C++ library, which keeps thread-local
//! state and blocks on CPU-heavy rendering. [`render_artifact`] moves the work
//! onto tokio's blocking pool so runtime threads keep driving other workers
//! and the rate limiter.
//!
//! ## Why cap pixels as well as DPI?
//!
//! Page sizes vary wildly. Pages are scaled by `dpi / 72`, then
//! `max_rendered_pixels` caps the longest edge regardless of physical size,
//! keeping memory bounded and staying in the image-size sweet spot of vision
//! models.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use image::DynamicImage;
use pdfium_render::prelude::*;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Bind to a pdfium shared library.
///
/// Resolution order: `PDFIUM_LIB_PATH` (file or directory), the working
/// directory, then the system library search path.
pub fn bind_pdfium() -> Result<Pdfium, String> {
    let bindings = match std::env::var_os("PDFIUM_LIB_PATH") {
        Some(configured) => {
            let configured = PathBuf::from(configured);
            let lib = if configured.is_dir() {
                PathBuf::from(Pdfium::pdfium_platform_library_name_at_path(&configured))
            } else {
                configured
            };
            Pdfium::bind_to_library(&lib)
                .map_err(|e| format!("PDFIUM_LIB_PATH={}: {:?}", lib.display(), e))?
        }
        None => Pdfium::bind_to_library(&PathBuf::from(
            Pdfium::pdfium_platform_library_name_at_path("./"),
        ))
        .or_else(|_| Pdfium::bind_to_system_library())
        .map_err(|e| format!("pdfium library not found: {:?}", e))?,
    };
    Ok(Pdfium::new(bindings))
}

/// Rendering parameters taken from the conversion config.
#[derive(Debug, Clone, Copy)]
pub struct RenderSettings {
    pub dpi: u32,
    pub max_rendered_pixels: u32,
}

/// Rasterise every page of `artifact` and encode each as a PNG `ImageData`.
///
/// A single-page artifact yields one image; a whole-document artifact yields
/// one image per page in order.
pub async fn render_artifact(
    artifact: &Path,
    password: Option<&str>,
    settings: RenderSettings,
) -> Result<Vec<ImageData>, String> {
    let path = artifact.to_path_buf();
    let password = password.map(str::to_string);

    tokio::task::spawn_blocking(move || {
        let images = render_blocking(&path, password.as_deref(), settings)?;
        images
            .iter()
            .map(|img| encode_png(img).map_err(|e| format!("PNG encoding failed: {e}")))
            .collect()
    })
    .await
    .map_err(|e| format!("render task panicked: {e}"))?
}

fn render_blocking(
    path: &Path,
    password: Option<&str>,
    settings: RenderSettings,
) -> Result<Vec<DynamicImage>, String> {
    let pdfium = bind_pdfium()?;
    let document = pdfium
        .load_pdf_from_file(path, password)
        .map_err(|e| format!("{:?}", e))?;

    let render_config = PdfRenderConfig::new()
        .scale_page_by_factor(settings.dpi as f32 / 72.0)
        .set_maximum_width(settings.max_rendered_pixels as i32)
        .set_maximum_height(settings.max_rendered_pixels as i32);

    let pages = document.pages();
    let mut images = Vec::with_capacity(pages.len() as usize);
    for (idx, page) in pages.iter().enumerate() {
        let bitmap = page
            .render_with_config(&render_config)
            .map_err(|e| format!("page {}: {:?}", idx + 1, e))?;
        let image = bitmap.as_image();
        debug!(
            "Rendered {} page {} → {}x{} px",
            path.display(),
            idx + 1,
            image.width(),
            image.height()
        );
        images.push(image);
    }
    Ok(images)
}

/// Lossless PNG keeps small glyphs (Arabic diacritics, subscripts) legible.
fn encode_png(img: &DynamicImage) -> Result<ImageData, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;
    let b64 = STANDARD.encode(&buf);
    Ok(ImageData::new(b64, "image/png").with_detail("high"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    #[test]
    fn png_encoding_is_valid_base64() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(8, 8, Rgba([0, 0, 0, 255])));
        let data = encode_png(&img).unwrap();
        assert_eq!(data.mime_type, "image/png");
        let decoded = STANDARD.decode(&data.data).unwrap();
        assert_eq!(&decoded[1..4], b"PNG");
    }
}
