//! Language and writing-direction detection for generated pages.
//!
//! The model is asked to declare `lang`/`dir` on `<html>`, but it does not
//! always comply. Detection therefore prefers explicit attributes (on
//! `<html>`, then `<body>`) and falls back to counting Arabic-script letters.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Languages written right-to-left.
pub const RTL_LANGS: &[&str] = &["ar", "he", "fa", "ur", "ps"];

/// Writing direction of a page or document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Ltr,
    Rtl,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Ltr => "ltr",
            Direction::Rtl => "rtl",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ltr" => Some(Direction::Ltr),
            "rtl" => Some(Direction::Rtl),
            _ => None,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Detected language tag and direction; either may be unknown.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanguageInfo {
    pub lang: Option<String>,
    pub dir: Option<Direction>,
}

impl LanguageInfo {
    pub fn is_unknown(&self) -> bool {
        self.lang.is_none() && self.dir.is_none()
    }

    /// Fill unknown fields from `fallback`.
    pub fn or(self, fallback: &LanguageInfo) -> LanguageInfo {
        LanguageInfo {
            lang: self.lang.or_else(|| fallback.lang.clone()),
            dir: self.dir.or(fallback.dir),
        }
    }
}

/// Whether `lang` (e.g. `ar`, `fa-IR`) is written right-to-left.
pub fn is_rtl_lang(lang: &str) -> bool {
    let primary = lang.split(['-', '_']).next().unwrap_or("").to_ascii_lowercase();
    RTL_LANGS.contains(&primary.as_str())
}

static RE_HTML_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<html\b[^>]*>").unwrap());
static RE_BODY_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<body\b[^>]*>").unwrap());
static RE_LANG_ATTR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)\blang\s*=\s*["']([A-Za-z0-9_\-]+)["']"#).unwrap());
static RE_DIR_ATTR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)\bdir\s*=\s*["']([A-Za-z]+)["']"#).unwrap());

/// Arabic, Arabic Supplement and Arabic Extended-A blocks.
pub static RE_ARABIC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[\x{0600}-\x{06FF}\x{0750}-\x{077F}\x{08A0}-\x{08FF}]").unwrap());
static RE_LATIN: Lazy<Regex> = Lazy::new(|| Regex::new(r"[A-Za-z]").unwrap());
static RE_TAGS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<[^>]*>").unwrap());

fn tag_attrs(tag: Option<regex::Match<'_>>) -> LanguageInfo {
    let Some(tag) = tag else {
        return LanguageInfo::default();
    };
    let tag = tag.as_str();
    LanguageInfo {
        lang: RE_LANG_ATTR
            .captures(tag)
            .map(|c| c[1].to_ascii_lowercase()),
        dir: RE_DIR_ATTR.captures(tag).and_then(|c| Direction::parse(&c[1])),
    }
}

/// Detect the language and direction of a page's markup.
pub fn detect(markup: &str) -> LanguageInfo {
    let html = tag_attrs(RE_HTML_TAG.find(markup));
    let body = tag_attrs(RE_BODY_TAG.find(markup));
    let mut info = html.or(&body);

    if info.lang.is_none() {
        let text = RE_TAGS.replace_all(markup, " ");
        let arabic = RE_ARABIC.find_iter(&text).count();
        let latin = RE_LATIN.find_iter(&text).count();
        if arabic > 0 && arabic >= latin {
            info.lang = Some("ar".to_string());
        }
    }

    if info.dir.is_none() {
        info.dir = info.lang.as_deref().map(|l| {
            if is_rtl_lang(l) {
                Direction::Rtl
            } else {
                Direction::Ltr
            }
        });
    }
    info
}

/// Whether the markup contains any Arabic-script character.
pub fn contains_arabic(markup: &str) -> bool {
    RE_ARABIC.is_match(markup)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_html_attributes_win() {
        let info = detect(r#"<html lang="en" dir="ltr"><body><p>مرحبا بالعالم</p></body></html>"#);
        assert_eq!(info.lang.as_deref(), Some("en"));
        assert_eq!(info.dir, Some(Direction::Ltr));
    }

    #[test]
    fn body_attributes_fill_gaps() {
        let info = detect(r#"<html><body lang="fa"><p>x</p></body></html>"#);
        assert_eq!(info.lang.as_deref(), Some("fa"));
        assert_eq!(info.dir, Some(Direction::Rtl));
    }

    #[test]
    fn arabic_text_without_attributes() {
        let info = detect("<p>هذا نص عربي مع بعض الكلمات</p>");
        assert_eq!(info.lang.as_deref(), Some("ar"));
        assert_eq!(info.dir, Some(Direction::Rtl));
    }

    #[test]
    fn mostly_english_with_arabic_quote_is_not_flagged() {
        let info = detect("<p>The word سلام means peace in Arabic and is widely used.</p>");
        assert!(info.is_unknown());
        assert!(contains_arabic("<p>سلام</p>"));
    }

    #[test]
    fn rtl_lang_handles_regions() {
        assert!(is_rtl_lang("ar-EG"));
        assert!(is_rtl_lang("HE"));
        assert!(!is_rtl_lang("en-US"));
    }

    #[test]
    fn fallback_fills_only_missing_fields() {
        let page = LanguageInfo {
            lang: Some("en".into()),
            dir: None,
        };
        let doc = LanguageInfo {
            lang: Some("ar".into()),
            dir: Some(Direction::Rtl),
        };
        let merged = page.or(&doc);
        assert_eq!(merged.lang.as_deref(), Some("en"));
        assert_eq!(merged.dir, Some(Direction::Rtl));
    }
}
