//! Placeholder resolution: swap `IMAGE_PLACEHOLDER` tokens for real figures.
//!
//! The generator is told which image ids a page may reference, but it
//! paraphrases ids, drops brackets, numbers figures its own way, or forgets
//! some altogether. The resolver therefore matches each token against the
//! manifest scope in four increasingly loose steps:
//!
//! 1. exact id,
//! 2. filename stem (`paper_page_003_fig_1` for `paper_page_003_fig_1.png`),
//! 3. positional: next unmatched region of the token's page,
//! 4. global: next unmatched region anywhere in scope.
//!
//! A token nothing matches stays in the markup so the gap is visible.
//! Regions no token claimed are appended as a trailing "Extracted Figures"
//! section, so no extracted image is ever silently lost.
//!
//! ## Idempotence
//!
//! A region whose relative path is already referenced by an `src` attribute
//! counts as matched before any token is looked at. Resolved markup has no
//! tokens left and every region referenced, so a second pass changes nothing.

use crate::manifest::ImageRegion;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

static RE_TOKEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?P<open><p\b[^>]*>\s*)?\[?\s*IMAGE_PLACEHOLDER\s*:\s*(?P<id>[^:\]\[<>\s"']+)(?:\s*:(?P<desc>[^\]\[<>\n]*))?\s*\]?(?P<close>\s*</p>)?"#,
    )
    .unwrap()
});

static RE_PAGE_IN_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)page[_\-\s]?0*(\d+)").unwrap());

static RE_BOILERPLATE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^\s*(?:(?:a\s+|short\s+)?description(?:\s+of\s+(?:the\s+)?(?:image|figure))?|image\s*\d*(?:\s+(?:from|on)\s+page\s*\d+)?|figure\s*\d*|picture|no\s+description|n/?a)\s*\.?\s*$",
    )
    .unwrap()
});

static RE_BODY_CLOSE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)</body\s*>").unwrap());

/// How a token found its region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    ExactId,
    FilenameStem,
    Positional,
    Global,
}

/// One token that was replaced by a figure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenMatch {
    pub token_id: String,
    pub region_id: String,
    pub kind: MatchKind,
}

/// Outcome of one resolver pass.
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    pub markup: String,
    pub matches: Vec<TokenMatch>,
    /// Ids of regions surfaced in the trailing section.
    pub appended: Vec<String>,
    /// Token ids left in the markup.
    pub unresolved: Vec<String>,
}

/// Resolves placeholders against a manifest scope.
///
/// `output_dir` is the directory of the HTML file the markup will be written
/// to; every `src` is made relative to it.
#[derive(Debug, Clone)]
pub struct PlaceholderResolver {
    output_dir: PathBuf,
}

impl PlaceholderResolver {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    /// Resolve every token in `markup`.
    ///
    /// `scope` holds the candidate regions in manifest order: one page's images
    /// in per-page mode, every image in whole-document mode. `page` is the
    /// page the markup belongs to, when known.
    pub fn resolve(&self, markup: &str, scope: &[&ImageRegion], page: Option<usize>) -> Resolution {
        let srcs: Vec<String> = scope
            .iter()
            .map(|r| relative_src(&r.path, &self.output_dir))
            .collect();

        let mut matched: Vec<bool> = srcs
            .iter()
            .map(|src| markup.contains(&format!("src=\"{}\"", escape_html(src))))
            .collect();

        let mut out = String::with_capacity(markup.len());
        let mut matches = Vec::new();
        let mut unresolved = Vec::new();
        let mut last = 0;

        for caps in RE_TOKEN.captures_iter(markup) {
            let whole = caps.get(0).map(|m| m.range()).unwrap_or(0..0);
            out.push_str(&markup[last..whole.start]);
            last = whole.end;

            let token_id = caps.name("id").map(|m| m.as_str()).unwrap_or("");
            let token_desc = caps.name("desc").map(|m| m.as_str().trim()).unwrap_or("");
            let open = caps.name("open").map(|m| m.as_str());
            let close = caps.name("close").map(|m| m.as_str());

            let context = page.or_else(|| page_from_id(token_id));
            match find_region(scope, &matched, token_id, context) {
                Some((idx, kind)) => {
                    matched[idx] = true;
                    let region = scope[idx];
                    debug!(
                        "Placeholder '{}' → {} ({:?})",
                        token_id, region.id, kind
                    );
                    let description = if token_desc.is_empty() {
                        region.description.as_str()
                    } else {
                        token_desc
                    };
                    let figure = render_figure(region, &srcs[idx], description);
                    // A token alone in a paragraph replaces the paragraph.
                    match (open, close) {
                        (Some(_), Some(_)) => out.push_str(&figure),
                        (Some(o), None) => {
                            out.push_str(o);
                            out.push_str(&figure);
                        }
                        (None, Some(c)) => {
                            out.push_str(&figure);
                            out.push_str(c);
                        }
                        (None, None) => out.push_str(&figure),
                    }
                    matches.push(TokenMatch {
                        token_id: token_id.to_string(),
                        region_id: region.id.clone(),
                        kind,
                    });
                }
                None => {
                    out.push_str(&markup[whole]);
                    unresolved.push(token_id.to_string());
                }
            }
        }
        out.push_str(&markup[last..]);

        let leftovers: Vec<usize> = (0..scope.len()).filter(|&i| !matched[i]).collect();
        let appended: Vec<String> = leftovers.iter().map(|&i| scope[i].id.clone()).collect();
        if !leftovers.is_empty() {
            let figures = leftovers
                .iter()
                .map(|&i| render_figure(scope[i], &srcs[i], &scope[i].description))
                .collect::<Vec<_>>()
                .join("\n");
            out = insert_before_body_close(
                &out,
                &format!(
                    "<section class=\"extracted-figures\">\n<hr/>\n<h2>Extracted Figures</h2>\n{figures}\n</section>\n"
                ),
            );
        }

        if !unresolved.is_empty() {
            debug!("{} placeholder(s) left unresolved", unresolved.len());
        }

        Resolution {
            markup: out,
            matches,
            appended,
            unresolved,
        }
    }
}

impl PlaceholderResolver {
    /// How many regions of `scope` the markup references.
    pub fn embedded_count(&self, markup: &str, scope: &[&ImageRegion]) -> usize {
        scope
            .iter()
            .filter(|r| {
                let src = relative_src(&r.path, &self.output_dir);
                markup.contains(&format!("src=\"{}\"", escape_html(&src)))
            })
            .count()
    }
}

/// Placeholder tokens remaining in `markup`.
pub fn unresolved_count(markup: &str) -> usize {
    RE_TOKEN.find_iter(markup).count()
}

fn find_region(
    scope: &[&ImageRegion],
    matched: &[bool],
    token_id: &str,
    context: Option<usize>,
) -> Option<(usize, MatchKind)> {
    // Duplicate ids across pages are legal in whole-document scope: prefer an
    // unmatched candidate, then one on the token's page.
    let pick = |pred: &dyn Fn(&ImageRegion) -> bool| -> Option<usize> {
        let candidates: Vec<usize> = (0..scope.len()).filter(|&i| pred(scope[i])).collect();
        let on_page = |i: &&usize| context.is_none() || scope[**i].page == context;
        candidates
            .iter()
            .filter(|i| !matched[**i])
            .find(on_page)
            .or_else(|| candidates.iter().find(|i| !matched[**i]))
            .or_else(|| candidates.iter().find(on_page))
            .or_else(|| candidates.first())
            .copied()
    };

    if let Some(i) = pick(&|r: &ImageRegion| r.id == token_id) {
        return Some((i, MatchKind::ExactId));
    }

    let token_stem = Path::new(token_id)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(token_id);
    if let Some(i) = pick(&|r: &ImageRegion| r.filename_stem() == Some(token_stem)) {
        return Some((i, MatchKind::FilenameStem));
    }

    if let Some(page) = context {
        if let Some(i) = (0..scope.len()).find(|&i| !matched[i] && scope[i].page == Some(page)) {
            return Some((i, MatchKind::Positional));
        }
    }

    (0..scope.len())
        .find(|&i| !matched[i])
        .map(|i| (i, MatchKind::Global))
}

/// Page number embedded in an id such as `doc_page_003_fig_1`.
fn page_from_id(id: &str) -> Option<usize> {
    RE_PAGE_IN_ID
        .captures(id)
        .and_then(|c| c[1].parse().ok())
}

/// Whether a caption adds nothing over the image itself.
fn is_boilerplate(description: &str, id: &str) -> bool {
    let d = description.trim();
    d.is_empty() || d.eq_ignore_ascii_case(id) || RE_BOILERPLATE.is_match(d)
}

fn render_figure(region: &ImageRegion, src: &str, description: &str) -> String {
    let description = description.trim();
    let alt = if description.is_empty() {
        region.id.as_str()
    } else {
        description
    };
    let caption = if is_boilerplate(description, &region.id) {
        String::new()
    } else {
        format!("<figcaption>{}</figcaption>", escape_html(description))
    };
    format!(
        "<figure class=\"extracted-figure\" data-image-id=\"{}\"><img src=\"{}\" alt=\"{}\"/>{}</figure>",
        escape_html(&region.id),
        escape_html(src),
        escape_html(alt),
        caption
    )
}

fn insert_before_body_close(markup: &str, block: &str) -> String {
    match RE_BODY_CLOSE.find_iter(markup).last() {
        Some(m) => {
            let mut s = String::with_capacity(markup.len() + block.len() + 1);
            s.push_str(&markup[..m.start()]);
            if !s.ends_with('\n') {
                s.push('\n');
            }
            s.push_str(block);
            s.push_str(&markup[m.start()..]);
            s
        }
        None => {
            let mut s = markup.trim_end().to_string();
            s.push('\n');
            s.push_str(block);
            s
        }
    }
}

/// Escape text for use in HTML content and double-quoted attributes.
pub(crate) fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// `target` relative to directory `base`, with `/` separators.
pub(crate) fn relative_src(target: &Path, base: &Path) -> String {
    let target = lexical(&absolutize(target));
    let base = lexical(&absolutize(base));

    let common = target
        .iter()
        .zip(base.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut parts: Vec<String> = Vec::new();
    parts.extend(std::iter::repeat_n("..".to_string(), base.len() - common));
    parts.extend(target[common..].iter().cloned());
    parts.join("/")
}

fn absolutize(p: &Path) -> PathBuf {
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(p))
            .unwrap_or_else(|_| p.to_path_buf())
    }
}

/// Path components with `.` and `..` folded away.
fn lexical(p: &Path) -> Vec<String> {
    let mut parts: Vec<String> = Vec::new();
    for c in p.components() {
        match c {
            Component::CurDir => {}
            Component::ParentDir => {
                parts.pop();
            }
            Component::Normal(s) => parts.push(s.to_string_lossy().into_owned()),
            Component::RootDir | Component::Prefix(_) => {
                parts.clear();
                parts.push(c.as_os_str().to_string_lossy().into_owned());
            }
        }
    }
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(id: &str, page: usize, desc: &str) -> ImageRegion {
        let filename = format!("paper_page_{page:03}_{id}.png");
        ImageRegion {
            id: id.into(),
            path: PathBuf::from("/data/imgs/paper").join(&filename),
            filename,
            description: desc.into(),
            kind: None,
            confidence: None,
            page: Some(page),
            coords_normalized: None,
            coords_pixels: None,
        }
    }

    fn resolver() -> PlaceholderResolver {
        PlaceholderResolver::new("/data/out")
    }

    #[test]
    fn exact_id_match_embeds_figure() {
        let fig = region("fig_1", 3, "Bar chart");
        let res = resolver().resolve(
            "<p>[IMAGE_PLACEHOLDER:fig_1:Revenue by year]</p>",
            &[&fig],
            Some(3),
        );
        assert_eq!(res.matches[0].kind, MatchKind::ExactId);
        assert!(res
            .markup
            .contains(r#"src="../imgs/paper/paper_page_003_fig_1.png""#));
        assert!(res.markup.contains("<figcaption>Revenue by year</figcaption>"));
        assert!(!res.markup.contains("<p>"), "paragraph wrapper should go: {}", res.markup);
        assert!(res.appended.is_empty());
    }

    #[test]
    fn bracketless_token_with_filename_stem() {
        let fig = region("fig_1", 3, "");
        let res = resolver().resolve(
            "<div>IMAGE_PLACEHOLDER:paper_page_003_fig_1.png</div>",
            &[&fig],
            Some(3),
        );
        assert_eq!(res.matches[0].kind, MatchKind::FilenameStem);
        assert!(res.markup.starts_with("<div><figure"));
        assert!(!res.markup.contains("figcaption"));
    }

    #[test]
    fn mismatched_id_takes_the_only_unmatched_region_on_its_page() {
        let fig = region("fig_1", 4, "Map");
        let res = resolver().resolve("[IMAGE_PLACEHOLDER:img_7:A map]", &[&fig], Some(4));
        assert_eq!(res.matches[0].kind, MatchKind::Positional);
        assert_eq!(res.matches[0].region_id, "fig_1");
    }

    #[test]
    fn page_is_inferred_from_id_in_document_scope() {
        let a = region("fig_1", 2, "");
        let b = region("fig_1", 5, "");
        let res = resolver().resolve("[IMAGE_PLACEHOLDER:page_5_image:Photo]", &[&a, &b], None);
        assert_eq!(res.matches[0].kind, MatchKind::Positional);
        assert!(res.markup.contains("paper_page_005_fig_1.png"));
        assert_eq!(res.appended, vec!["fig_1".to_string()]);
    }

    #[test]
    fn global_fallback_uses_next_unmatched() {
        let a = region("fig_1", 1, "");
        let b = region("fig_2", 1, "");
        let res = resolver().resolve(
            "[IMAGE_PLACEHOLDER:fig_1:x]\n[IMAGE_PLACEHOLDER:chart:y]",
            &[&a, &b],
            None,
        );
        assert_eq!(res.matches[1].kind, MatchKind::Global);
        assert_eq!(res.matches[1].region_id, "fig_2");
    }

    #[test]
    fn unmatched_region_is_surfaced_before_body_close() {
        let fig1 = region("fig_1", 3, "Bar chart");
        let fig2 = region("fig_2", 3, "Line chart");
        let markup = "<html><body>\n<p>[IMAGE_PLACEHOLDER:fig_1:Bar chart]</p>\n</body></html>";
        let res = resolver().resolve(markup, &[&fig1, &fig2], Some(3));
        assert_eq!(res.appended, vec!["fig_2".to_string()]);
        let section = res.markup.find("Extracted Figures").unwrap();
        let body_close = res.markup.find("</body>").unwrap();
        assert!(section < body_close);
        assert!(res.markup.contains("paper_page_003_fig_2.png"));
    }

    #[test]
    fn unknown_token_without_regions_stays() {
        let markup = "<p>[IMAGE_PLACEHOLDER:fig_9:Lost]</p>";
        let res = resolver().resolve(markup, &[], Some(1));
        assert_eq!(res.markup, markup);
        assert_eq!(res.unresolved, vec!["fig_9".to_string()]);
        assert_eq!(unresolved_count(&res.markup), 1);
    }

    #[test]
    fn resolving_twice_is_a_no_op() {
        let fig1 = region("fig_1", 3, "Bar chart");
        let fig2 = region("fig_2", 3, "");
        let scope = [&fig1, &fig2];
        let once = resolver().resolve(
            "<body><p>[IMAGE_PLACEHOLDER:fig_1:Bar chart]</p></body>",
            &scope,
            Some(3),
        );
        let twice = resolver().resolve(&once.markup, &scope, Some(3));
        assert_eq!(once.markup, twice.markup);
        assert!(twice.matches.is_empty());
        assert!(twice.appended.is_empty());
        assert_eq!(resolver().embedded_count(&twice.markup, &scope), 2);
    }

    #[test]
    fn token_id_stops_at_attribute_quotes() {
        let fig = region("fig_4", 2, "");
        let res = resolver().resolve(
            r#"<div title="IMAGE_PLACEHOLDER:fig_4">x</div>"#,
            &[&fig],
            Some(2),
        );
        assert_eq!(res.matches[0].token_id, "fig_4");
        assert_eq!(res.matches[0].kind, MatchKind::ExactId);
    }

    #[test]
    fn boilerplate_captions_are_dropped() {
        assert!(is_boilerplate("Description of image", "fig_1"));
        assert!(is_boilerplate("Image 2 from page 4", "fig_1"));
        assert!(is_boilerplate("fig_1", "fig_1"));
        assert!(!is_boilerplate("Enrolment by region, 2020", "fig_1"));
    }

    #[test]
    fn captions_are_escaped() {
        let fig = region("fig_1", 1, "");
        let res = resolver().resolve(
            "[IMAGE_PLACEHOLDER:fig_1:Sales & \"net\" margin]",
            &[&fig],
            Some(1),
        );
        assert!(res
            .markup
            .contains("<figcaption>Sales &amp; &quot;net&quot; margin</figcaption>"));
    }

    #[test]
    fn relative_src_walks_up_and_down() {
        assert_eq!(
            relative_src(Path::new("/a/imgs/x.png"), Path::new("/a/out")),
            "../imgs/x.png"
        );
        assert_eq!(
            relative_src(Path::new("/a/out/./f/x.png"), Path::new("/a/out")),
            "f/x.png"
        );
    }
}
