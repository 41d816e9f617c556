//! Sanitising: deterministic cleanup of VLM-generated HTML.
//!
//! Even well-prompted models wrap their answer in ```` ```html ```` fences,
//! pull in web fonts, or invent `<img>` tags pointing at files that do not
//! exist. These rules fix such quirks without touching content. Each is a
//! pure `&str → String` function with its own test.
//!
//! ## Rule Order
//!
//! Fences go first so the remaining rules see bare markup; line endings are
//! normalised before whitespace trimming; the final-newline pass runs last.
//!
//! Placeholder tokens belong to [`crate::pipeline::placeholder`]. Bare
//! tokens pass through untouched; a token the model wrapped in an `<img>`
//! tag is unwrapped back to its bare form.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

/// Apply all sanitising rules to the raw model output.
///
/// Rules (applied in order):
/// 1. Strip outer code fences (```` ```html ```` … ```` ``` ````), also when only one side is present
/// 2. Normalise line endings (CRLF → LF)
/// 3. Trim trailing whitespace per line
/// 4. Collapse 3+ consecutive blank lines down to 2
/// 5. Remove external web-font links and imports
/// 6. Unwrap placeholder tokens written as `<img>`; replace other hallucinated `<img>` tags with their alt text
/// 7. Strip invisible Unicode (zero-width space, BOM, soft hyphen, word joiner)
/// 8. Ensure the markup ends with exactly one newline
pub fn clean_html(input: &str) -> String {
    let s = strip_code_fences(input);
    let s = normalise_line_endings(&s);
    let s = trim_trailing_whitespace(&s);
    let s = collapse_blank_lines(&s);
    let s = remove_external_fonts(&s);
    let s = remove_hallucinated_images(&s);
    let s = remove_invisible_chars(&s);
    ensure_final_newline(&s)
}

// ── Rule 1: Strip outer code fences ──────────────────────────────────────────

static RE_OPENING_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^```[A-Za-z]*[ \t]*\r?\n?").unwrap());
static RE_CLOSING_FENCE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\r?\n?```\s*$").unwrap());

/// Truncated responses often carry the opening fence without the closing
/// one, so each side is stripped independently.
fn strip_code_fences(input: &str) -> String {
    let trimmed = input.trim();
    let s = RE_OPENING_FENCE.replace(trimmed, "");
    RE_CLOSING_FENCE.replace(&s, "").to_string()
}

// ── Rule 2: Normalise line endings ───────────────────────────────────────────

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

// ── Rule 3: Trim trailing whitespace per line ────────────────────────────────

fn trim_trailing_whitespace(input: &str) -> String {
    input
        .lines()
        .map(|line| line.trim_end())
        .collect::<Vec<_>>()
        .join("\n")
}

// ── Rule 4: Collapse excessive blank lines ───────────────────────────────────

static RE_BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{4,}").unwrap());

fn collapse_blank_lines(input: &str) -> String {
    RE_BLANK_LINES.replace_all(input, "\n\n\n").to_string()
}

// ── Rule 5: Remove external web fonts ────────────────────────────────────────
//
// Offline readers (EPUB, DOCX via pandoc) cannot fetch them and pandoc
// warns on every unreachable resource.

static RE_FONT_LINK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)<link\b[^>]*fonts\.(?:googleapis|gstatic)\.com[^>]*>\n?"#).unwrap()
});
static RE_FONT_IMPORT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)@import\s+url\([^)]*fonts\.(?:googleapis|gstatic)\.com[^)]*\)\s*;?"#)
        .unwrap()
});

fn remove_external_fonts(input: &str) -> String {
    let s = RE_FONT_LINK.replace_all(input, "");
    RE_FONT_IMPORT.replace_all(&s, "").to_string()
}

// ── Rule 6: Remove hallucinated images ───────────────────────────────────────
//
// The prompt asks for placeholders instead of images, so any `<img>` the
// model writes points at nothing: a made-up file name, an example domain, or
// an inline data blob. Real figures are attached later from the manifest.
// A tag carrying an `IMAGE_PLACEHOLDER` token in `src` or `alt` is turned back
// into the bare token so the resolver still sees it.

static RE_IMG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<img\b[^>]*>").unwrap());
static RE_SRC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?is)\bsrc\s*=\s*(?:"([^"]*)"|'([^']*)')"#).unwrap());
static RE_ALT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?is)\balt\s*=\s*(?:"([^"]*)"|'([^']*)')"#).unwrap());

fn attr<'a>(re: &Regex, tag: &'a str) -> Option<&'a str> {
    re.captures(tag)
        .and_then(|c| c.get(1).or_else(|| c.get(2)))
        .map(|m| m.as_str())
}

fn is_placeholder_src(src: &str) -> bool {
    let u = src.trim();
    if u.is_empty() || u.starts_with("data:") {
        return true;
    }
    if !u.starts_with("http://") && !u.starts_with("https://") {
        return true;
    }
    let fake_domains = [
        "example.com",
        "placeholder.com",
        "via.placeholder.com",
        "dummyimage.com",
        "placehold.it",
        "picsum.photos",
    ];
    fake_domains.iter().any(|d| u.contains(d))
}

/// The bare `[IMAGE_PLACEHOLDER:id:desc]` token carried by an `<img>` tag.
fn embedded_token(src: &str, alt: Option<&str>) -> Option<String> {
    const MARKER: &str = "IMAGE_PLACEHOLDER";
    let alt = alt.map(str::trim).unwrap_or("");
    let (carrier, from_src) = if src.contains(MARKER) {
        (src, true)
    } else if alt.contains(MARKER) {
        (alt, false)
    } else {
        return None;
    };

    let start = carrier.find(MARKER)?;
    let body = carrier[start..].trim_end().trim_end_matches(']').trim_end();
    let has_desc = body[MARKER.len()..].trim_start().trim_start_matches(':').contains(':');
    if from_src && !has_desc && !alt.is_empty() && !alt.contains(MARKER) {
        Some(format!("[{body}:{alt}]"))
    } else {
        Some(format!("[{body}]"))
    }
}

fn remove_hallucinated_images(input: &str) -> String {
    RE_IMG
        .replace_all(input, |caps: &Captures<'_>| {
            let tag = &caps[0];
            let src = attr(&RE_SRC, tag).unwrap_or("");
            if let Some(token) = embedded_token(src, attr(&RE_ALT, tag)) {
                return token;
            }
            if !is_placeholder_src(src) {
                return tag.to_string();
            }
            match attr(&RE_ALT, tag).map(str::trim) {
                Some(alt) if !alt.is_empty() => format!("<em>{alt}</em>"),
                _ => String::new(),
            }
        })
        .to_string()
}

// ── Rule 7: Remove invisible Unicode characters ─────────────────────────────
//
// ZWJ/ZWNJ (U+200D/U+200C) are kept: Arabic and Persian shaping needs them.

fn remove_invisible_chars(input: &str) -> String {
    input.replace(['\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{2060}'], "")
}

// ── Rule 8: Ensure file ends with single newline ─────────────────────────────

fn ensure_final_newline(input: &str) -> String {
    let trimmed = input.trim_end();
    if trimmed.is_empty() {
        String::from("\n")
    } else {
        format!("{}\n", trimmed)
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
