//! Document assembly: stitch per-page HTML into one `{stem}.html`.
//!
//! Each page is a full HTML document on its own. The assembler keeps the
//! `<head>` of the first successful page, lifts every page's `<body>` content
//! into a `<section class="page">` carrying that page's own `lang`/`dir`
//! (falling back to the first page's when the page has none), and wraps the
//! lot in a shell whose `lang`/`dir` are the first page's.
//! Direction authored inside a page body is left untouched.

use crate::config::{FailedPagePolicy, PageSeparator};
use crate::output::PageResult;
use crate::pipeline::lang::{Direction, LanguageInfo};
use crate::pipeline::placeholder::escape_html;
use once_cell::sync::Lazy;
use regex::Regex;

static RE_HEAD: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<head\b[^>]*>(.*?)</head\s*>").unwrap());
static RE_BODY: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<body\b[^>]*>(.*)</body\s*>").unwrap());
static RE_BODY_OPEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<body\b[^>]*>").unwrap());
static RE_WRAPPERS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<!DOCTYPE[^>]*>|<html\b[^>]*>|</html\s*>|<head\b[^>]*>.*?</head\s*>|</body\s*>")
        .unwrap()
});
static RE_META_CHARSET: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)<meta\b[^>]*charset").unwrap());
static RE_TITLE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<title\b[^>]*>.*?</title\s*>").unwrap());

/// Assembly knobs taken from the conversion config.
#[derive(Debug, Clone)]
pub struct AssemblyOptions {
    pub failed_pages: FailedPagePolicy,
    pub separator: PageSeparator,
    /// Used for `<title>` when no page supplies a head.
    pub title: String,
}

/// The assembled document.
#[derive(Debug, Clone)]
pub struct AssembledDocument {
    pub html: String,
    /// Language and direction written on `<html>`.
    pub language: LanguageInfo,
    /// Page sections actually emitted (failed pages count under the
    /// placeholder policy, not under omit).
    pub sections: usize,
}

/// Assemble `pages` (any order) into one document.
pub fn assemble(pages: &[PageResult], options: &AssemblyOptions) -> AssembledDocument {
    let mut ordered: Vec<&PageResult> = pages.iter().collect();
    ordered.sort_by_key(|p| p.page_num);

    let first_ok = ordered.iter().find(|p| p.is_success()).copied();
    let language = first_ok
        .map(|p| LanguageInfo {
            lang: p.lang.clone(),
            dir: p.dir,
        })
        .unwrap_or_default();

    let head = build_head(first_ok.map(|p| p.markup.as_str()), &options.title);

    let mut body = String::new();
    let mut sections = 0;
    for (i, page) in ordered.iter().enumerate() {
        if i > 0 {
            body.push_str(&options.separator.render(page.page_num));
        }
        match &page.error {
            None => {
                sections += 1;
                body.push_str(&page_section(page, &language));
            }
            Some(err) => match options.failed_pages {
                FailedPagePolicy::Placeholder => {
                    sections += 1;
                    body.push_str(&format!(
                        "<section class=\"page page-failed\" id=\"page-{n}\" data-page=\"{n}\">\n<p class=\"page-error\">Page {n} could not be converted: {msg}</p>\n</section>",
                        n = page.page_num,
                        msg = escape_html(&err.to_string())
                    ));
                }
                FailedPagePolicy::Omit => {
                    body.push_str(&format!(
                        "<!-- page {} failed: {} -->",
                        page.page_num,
                        comment_safe(&err.to_string())
                    ));
                }
            },
        }
    }

    let html = format!(
        "<!DOCTYPE html>\n<html{}>\n<head>\n{}\n</head>\n<body>\n{}\n</body>\n</html>\n",
        lang_attrs(language.lang.as_deref(), language.dir),
        head,
        body
    );

    AssembledDocument {
        html,
        language,
        sections,
    }
}

/// Inner HTML of `<body>`, or the markup minus document wrappers when the
/// page has no body element.
pub fn body_inner(markup: &str) -> String {
    if let Some(c) = RE_BODY.captures(markup) {
        return c[1].trim().to_string();
    }
    let without_open = match RE_BODY_OPEN.find(markup) {
        Some(m) => &markup[m.end()..],
        None => markup,
    };
    RE_WRAPPERS.replace_all(without_open, "").trim().to_string()
}

fn page_section(page: &PageResult, fallback: &LanguageInfo) -> String {
    let own = LanguageInfo {
        lang: page.lang.clone(),
        dir: page.dir,
    };
    let language = own.or(fallback);
    format!(
        "<section class=\"page\" id=\"page-{n}\" data-page=\"{n}\"{attrs}>\n{inner}\n</section>",
        n = page.page_num,
        attrs = lang_attrs(language.lang.as_deref(), language.dir),
        inner = body_inner(&page.markup)
    )
}

fn build_head(first_page: Option<&str>, title: &str) -> String {
    let mut head = first_page
        .and_then(|m| RE_HEAD.captures(m))
        .map(|c| c[1].trim().to_string())
        .unwrap_or_default();

    if !RE_TITLE.is_match(&head) {
        head = format!("<title>{}</title>\n{}", escape_html(title), head);
    }
    if !RE_META_CHARSET.is_match(&head) {
        head = format!("<meta charset=\"utf-8\"/>\n{head}");
    }
    head.trim_end().to_string()
}

fn lang_attrs(lang: Option<&str>, dir: Option<Direction>) -> String {
    let mut s = String::new();
    if let Some(l) = lang {
        s.push_str(&format!(" lang=\"{}\"", escape_html(l)));
    }
    if let Some(d) = dir {
        s.push_str(&format!(" dir=\"{d}\""));
    }
    s
}

/// `--` may not appear inside an HTML comment.
fn comment_safe(s: &str) -> String {
    s.replace("--", "- -")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PageError;

    fn ok(n: usize, lang: &str, dir: Direction, body: &str) -> PageResult {
        PageResult {
            page_num: n,
            markup: format!(
                "<!DOCTYPE html>\n<html lang=\"{lang}\" dir=\"{dir}\">\n<head><meta charset=\"utf-8\"><title>p{n}</title><style>p{{margin:0}}</style></head>\n<body>\n{body}\n</body>\n</html>\n"
            ),
            output_path: None,
            lang: Some(lang.into()),
            dir: Some(dir),
            duration_ms: 10,
            reused: false,
            error: None,
        }
    }

    fn options(policy: FailedPagePolicy) -> AssemblyOptions {
        AssemblyOptions {
            failed_pages: policy,
            separator: PageSeparator::None,
            title: "paper".into(),
        }
    }

    #[test]
    fn sections_are_ordered_regardless_of_input_order() {
        let pages = vec![
            ok(3, "en", Direction::Ltr, "<p>three</p>"),
            ok(1, "ar", Direction::Rtl, "<p>واحد</p>"),
            ok(2, "en", Direction::Ltr, "<p>two</p>"),
        ];
        let doc = assemble(&pages, &options(FailedPagePolicy::Placeholder));
        let p1 = doc.html.find("data-page=\"1\"").unwrap();
        let p2 = doc.html.find("data-page=\"2\"").unwrap();
        let p3 = doc.html.find("data-page=\"3\"").unwrap();
        assert!(p1 < p2 && p2 < p3);
        assert_eq!(doc.sections, 3);
        assert_eq!(doc.html.matches("<section class=\"page\"").count(), 3);
    }

    #[test]
    fn shell_takes_first_page_language_and_sections_keep_their_own() {
        let pages = vec![
            ok(1, "ar", Direction::Rtl, "<p>مرحبا</p>"),
            ok(2, "en", Direction::Ltr, "<p>hello</p>"),
        ];
        let doc = assemble(&pages, &options(FailedPagePolicy::Placeholder));
        assert!(doc.html.contains("<html lang=\"ar\" dir=\"rtl\">"));
        assert!(doc
            .html
            .contains("<section class=\"page\" id=\"page-2\" data-page=\"2\" lang=\"en\" dir=\"ltr\">"));
        // Head comes from page 1 only.
        assert!(doc.html.contains("<title>p1</title>"));
        assert!(!doc.html.contains("<title>p2</title>"));
        assert_eq!(doc.html.matches("<body>").count(), 1);
    }

    #[test]
    fn undetected_page_falls_back_to_first_page_language() {
        let unknown = PageResult {
            markup: "<body><p>١٢٣</p></body>".into(),
            lang: None,
            dir: None,
            ..ok(2, "en", Direction::Ltr, "")
        };
        let half = PageResult {
            lang: None,
            ..ok(3, "en", Direction::Ltr, "<p>three</p>")
        };
        let pages = vec![ok(1, "ar", Direction::Rtl, "<p>مرحبا</p>"), unknown, half];
        let doc = assemble(&pages, &options(FailedPagePolicy::Placeholder));
        assert!(doc
            .html
            .contains("<section class=\"page\" id=\"page-2\" data-page=\"2\" lang=\"ar\" dir=\"rtl\">"));
        assert!(doc
            .html
            .contains("<section class=\"page\" id=\"page-3\" data-page=\"3\" lang=\"ar\" dir=\"ltr\">"));
    }

    #[test]
    fn failed_page_placeholder_is_visible() {
        let pages = vec![
            ok(1, "en", Direction::Ltr, "<p>one</p>"),
            PageResult::failed(2, PageError::Timeout { page: 2, secs: 300 }, 300_000),
        ];
        let doc = assemble(&pages, &options(FailedPagePolicy::Placeholder));
        assert!(doc.html.contains("page-failed"));
        assert!(doc.html.contains("Page 2 could not be converted"));
        assert_eq!(doc.sections, 2);
    }

    #[test]
    fn omitted_failure_leaves_a_comment_trace() {
        let pages = vec![
            PageResult::failed(
                1,
                PageError::GenerationFailed {
                    page: 1,
                    detail: "quota -- exceeded".into(),
                },
                5,
            ),
            ok(2, "en", Direction::Ltr, "<p>two</p>"),
        ];
        let doc = assemble(&pages, &options(FailedPagePolicy::Omit));
        assert_eq!(doc.sections, 1);
        assert!(doc.html.contains("<!-- page 1 failed:"));
        assert!(!doc.html.contains("quota -- exceeded"));
        // The shell falls back to the first successful page.
        assert!(doc.html.contains("<html lang=\"en\" dir=\"ltr\">"));
    }

    #[test]
    fn separators_go_between_pages() {
        let pages = vec![
            ok(1, "en", Direction::Ltr, "<p>a</p>"),
            ok(2, "en", Direction::Ltr, "<p>b</p>"),
        ];
        let mut opts = options(FailedPagePolicy::Placeholder);
        opts.separator = PageSeparator::Comment;
        let doc = assemble(&pages, &opts);
        assert_eq!(doc.html.matches("<!-- page 2 -->").count(), 1);
        assert!(!doc.html.contains("<!-- page 1 -->"));
    }

    #[test]
    fn headless_pages_get_a_default_head() {
        let page = PageResult {
            markup: "<p>bare fragment</p>\n".into(),
            lang: None,
            dir: None,
            ..ok(1, "en", Direction::Ltr, "")
        };
        let doc = assemble(&[page], &options(FailedPagePolicy::Placeholder));
        assert!(doc.html.contains("<meta charset=\"utf-8\"/>"));
        assert!(doc.html.contains("<title>paper</title>"));
        assert!(doc.html.contains("<html>\n"));
        assert!(doc.html.contains("<p>bare fragment</p>"));
    }

    #[test]
    fn body_inner_strips_document_wrappers() {
        assert_eq!(body_inner("<html><body dir=\"rtl\"><p>x</p></body></html>"), "<p>x</p>");
        assert_eq!(
            body_inner("<!DOCTYPE html><html><head><title>t</title></head><p>y</p></html>"),
            "<p>y</p>"
        );
    }
}
