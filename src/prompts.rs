//! Prompts for VLM-based PDF-to-HTML conversion.
//!
//! Callers can override the system prompt via
//! [`crate::config::ConversionConfig::system_prompt`]. The per-call
//! instruction built here is always sent: it carries the placeholder
//! contract the resolver depends on.

use crate::manifest::ImageRegion;

/// Default system prompt for converting PDF pages to HTML.
pub const DEFAULT_SYSTEM_PROMPT: &str = r#"You are an expert document converter. Convert the attached PDF page images into one complete, valid HTML5 document.

1. TEXT
   - Preserve ALL text exactly, in human reading order.
   - Keep Arabic text in Arabic script and English text in Latin script; never transliterate or translate.

2. LANGUAGE AND DIRECTION
   - Set lang and dir on <html> for the dominant language (e.g. <html lang="ar" dir="rtl">).
   - Mark passages in the other language with their own lang/dir attributes.

3. STRUCTURE
   - Use semantic elements: h1–h4, p, ul/ol, table, blockquote, figure.
   - Reproduce tables with <table>, including merged cells.

4. MATH
   - Write formulas as LaTeX between $…$ (inline) or $$…$$ (display).

5. IMAGES
   - Never embed image data or invent image URLs.
   - For every figure, chart or photo write a placeholder on its own line:
     [IMAGE_PLACEHOLDER:IMAGE_ID:short description]
   - Use the image ids listed in the instruction when they are given.

6. OUTPUT
   - Output ONLY the HTML document, starting with <!DOCTYPE html>.
   - No markdown fences, no commentary, no external fonts or scripts."#;

/// Per-call instruction listing the image ids the page may reference.
///
/// `page_num` is `None` for a whole-document call.
pub fn generation_instruction(page_num: Option<usize>, images: &[&ImageRegion]) -> String {
    let scope = match page_num {
        Some(n) => format!("This is page {n} of the document."),
        None => "These are all pages of the document, in order.".to_string(),
    };

    if images.is_empty() {
        return format!(
            "{scope} No extracted images are registered; use \
             [IMAGE_PLACEHOLDER:img_N:description] with sequential ids for any figures."
        );
    }

    let listing = images
        .iter()
        .map(|r| {
            let page = r.page.map(|p| format!(" (page {p})")).unwrap_or_default();
            if r.description.is_empty() {
                format!("- {}{}", r.id, page)
            } else {
                format!("- {}{}: {}", r.id, page, r.description)
            }
        })
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "{scope} Extracted images available for placeholders:\n{listing}\n\
         Reference each one exactly once as [IMAGE_PLACEHOLDER:<id>:<description>] where it appears."
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn region(id: &str, page: usize, desc: &str) -> ImageRegion {
        ImageRegion {
            id: id.into(),
            filename: format!("{id}.png"),
            path: PathBuf::from(format!("{id}.png")),
            description: desc.into(),
            kind: None,
            confidence: None,
            page: Some(page),
            coords_normalized: None,
            coords_pixels: None,
        }
    }

    #[test]
    fn default_prompt_states_placeholder_syntax() {
        assert!(DEFAULT_SYSTEM_PROMPT.contains("[IMAGE_PLACEHOLDER:IMAGE_ID:"));
    }

    #[test]
    fn instruction_lists_page_ids() {
        let a = region("fig_1", 3, "Bar chart");
        let b = region("fig_2", 3, "");
        let text = generation_instruction(Some(3), &[&a, &b]);
        assert!(text.contains("page 3"));
        assert!(text.contains("- fig_1 (page 3): Bar chart"));
        assert!(text.contains("- fig_2 (page 3)"));
    }

    #[test]
    fn instruction_without_images_still_asks_for_placeholders() {
        let text = generation_instruction(None, &[]);
        assert!(text.contains("IMAGE_PLACEHOLDER"));
    }
}
