use ego_tree::NodeId;
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::node::Node;
use scraper::{ElementRef, Html, Selector};
use url::Url;

use crate::marker::Marker;

// ── Constants ────────────────────────────────────────────────────────────────

/// A candidate container must carry more visible text than this to be
/// treated as the page's main content.
pub const MIN_MAIN_CONTENT_LEN: usize = 500;

/// Extractions shorter than this are not worth sending to the model.
pub const MIN_VIABLE_LEN: usize = 60;

const MIN_TABLE_LEN: usize = 10;
const MIN_CHART_LEN: usize = 5;
const MAX_CAPTION_LEN: usize = 200;

/// Elements browsers never render, whatever their styles say.
const NON_RENDERED_TAGS: &[&str] = &[
    "script", "style", "noscript", "template", "head", "title", "meta", "link",
];

const MAIN_CONTENT_SELECTORS: &[&str] = &[
    "article",
    "main",
    "[role=\"main\"]",
    ".article-content",
    ".post-content",
    ".entry-content",
    ".content",
    "#content",
    ".post",
    ".entry",
    "#main",
];

const NOISE_SELECTORS: &[&str] = &[
    "nav",
    "aside",
    "iframe",
    "[role=\"navigation\"]",
    "[role=\"complementary\"]",
    "[aria-modal=\"true\"]",
    "[class*=\"cookie\"]",
    "[id*=\"cookie\"]",
    "[class*=\"consent\"]",
    "[id*=\"consent\"]",
    "[class*=\"advert\"]",
    "[id*=\"advert\"]",
    ".ad",
    ".ads",
    "[class^=\"ad-\"]",
    "[class*=\" ad-\"]",
    "[class*=\"sponsor\"]",
    "[class*=\"sidebar\"]",
    "[id*=\"sidebar\"]",
    "[class*=\"social\"]",
    "[class*=\"share\"]",
    "[class*=\"comment\"]",
    "[id*=\"comment\"]",
    "[class*=\"popup\"]",
    "[class*=\"modal\"]",
    "[class*=\"newsletter\"]",
];

// ── Lazy statics ─────────────────────────────────────────────────────────────

static PROMO_TEXT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)click here|subscribe|donate|sign up").unwrap());

static DOLLAR_AMOUNT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\$\s?\d[\d,]*(?:\.\d+)?$").unwrap());

static PROMO_HREF_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)donate|subscribe").unwrap());

static ICON_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)icon|avatar|gravatar|logo|sprite|emoji|badge|pixel|spacer").unwrap()
});

static CANDIDATE_SELS: Lazy<Vec<Selector>> = Lazy::new(|| {
    MAIN_CONTENT_SELECTORS
        .iter()
        .map(|s| Selector::parse(s).unwrap())
        .collect()
});

static NOISE_SEL: Lazy<Selector> =
    Lazy::new(|| Selector::parse(&NOISE_SELECTORS.join(", ")).unwrap());

static BODY_SEL: Lazy<Selector> = Lazy::new(|| Selector::parse("body").unwrap());
static ANCHOR_SEL: Lazy<Selector> = Lazy::new(|| Selector::parse("a[href]").unwrap());
static IMG_SEL: Lazy<Selector> = Lazy::new(|| Selector::parse("img").unwrap());
static TABLE_SEL: Lazy<Selector> = Lazy::new(|| Selector::parse("table").unwrap());
static ROW_SEL: Lazy<Selector> = Lazy::new(|| Selector::parse("tr").unwrap());
static CHART_SEL: Lazy<Selector> = Lazy::new(|| {
    Selector::parse("[class*=\"chart\"], [class*=\"graph\"], [id*=\"chart\"], [id*=\"graph\"]")
        .unwrap()
});

// ── Options ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractMode {
    /// Main-content detection with noise exclusion; used for summaries and chat.
    Content,
    /// Whole body, including tables and charts; used for rewrites.
    FullPage,
}

#[derive(Debug, Clone)]
pub struct ExtractOptions {
    /// Budget in characters.
    pub max_chars: usize,
    pub mode: ExtractMode,
    /// Relative link and image URLs are resolved against this when set.
    pub base_url: Option<Url>,
}

impl ExtractOptions {
    pub fn content(max_chars: usize) -> Self {
        ExtractOptions {
            max_chars,
            mode: ExtractMode::Content,
            base_url: None,
        }
    }

    pub fn full_page(max_chars: usize) -> Self {
        ExtractOptions {
            max_chars,
            mode: ExtractMode::FullPage,
            base_url: None,
        }
    }

    pub fn with_base_url(mut self, base_url: Url) -> Self {
        self.base_url = Some(base_url);
        self
    }

    fn link_cap(&self) -> usize {
        match self.mode {
            ExtractMode::Content => 5,
            ExtractMode::FullPage => 10,
        }
    }

    fn image_cap(&self) -> usize {
        match self.mode {
            ExtractMode::Content => 5,
            ExtractMode::FullPage => 10,
        }
    }
}

// ── Extracted document ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Text(String),
    Marker(Marker),
}

impl Segment {
    fn flattened(&self) -> String {
        match self {
            Segment::Text(text) => format!("{}\n", text),
            Segment::Marker(marker) => format!("\n{}", marker),
        }
    }
}

/// Ordered text chunks and markers gathered from a page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedDocument {
    segments: Vec<Segment>,
    max_chars: usize,
}

impl ExtractedDocument {
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Flatten into at most `max_chars` characters.
    ///
    /// Only a suffix is ever dropped. A marker that does not fit is dropped
    /// whole; a text chunk may be cut short.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        let mut used = 0;
        for segment in &self.segments {
            let piece = segment.flattened();
            let len = piece.chars().count();
            if used + len <= self.max_chars {
                out.push_str(&piece);
                used += len;
                continue;
            }
            if let Segment::Text(_) = segment {
                out.extend(piece.chars().take(self.max_chars - used));
            }
            break;
        }
        out
    }
}

// ── Public API ───────────────────────────────────────────────────────────────

/// Extract annotated text from `document`, bounded by `options.max_chars`.
pub fn extract(document: &mut Html, options: &ExtractOptions) -> String {
    extract_document(document, options).to_text()
}

pub fn extract_document(document: &mut Html, options: &ExtractOptions) -> ExtractedDocument {
    match options.mode {
        ExtractMode::Content => {
            let root = find_main_content(document);
            with_noise_detached(document, root, |doc| collect(doc, root, options))
        }
        ExtractMode::FullPage => {
            let root = body_or_root(document);
            collect(document, root, options)
        }
    }
}

/// True when an extraction carries enough text to be worth a request.
pub fn is_viable(text: &str) -> bool {
    text.trim().chars().count() >= MIN_VIABLE_LEN
}

// ── Container selection ──────────────────────────────────────────────────────

/// The first candidate container with enough visible text, else `<body>`.
pub fn find_main_content(document: &Html) -> NodeId {
    let root = document.root_element();
    for sel in CANDIDATE_SELS.iter() {
        for el in root.select(sel) {
            if is_hidden(el) {
                continue;
            }
            let text_len = normalize_text(collect_text(el)).chars().count();
            if text_len > MIN_MAIN_CONTENT_LEN {
                return el.id();
            }
        }
    }
    body_or_root(document)
}

fn body_or_root(document: &Html) -> NodeId {
    let root = document.root_element();
    root.select(&BODY_SEL).next().unwrap_or(root).id()
}

// ── Noise exclusion ──────────────────────────────────────────────────────────

struct Detached {
    id: NodeId,
    parent: NodeId,
    next_sibling: Option<NodeId>,
}

/// Keeps noise elements out of the tree for as long as it lives.
///
/// Dropping the guard puts every element back at its recorded position, in
/// reverse detach order, so nested noise is restored inside its ancestor
/// before the ancestor itself goes back.
struct NoiseGuard<'a> {
    document: &'a mut Html,
    detached: Vec<Detached>,
}

impl<'a> NoiseGuard<'a> {
    fn detach(document: &'a mut Html, root: NodeId) -> Self {
        let targets: Vec<NodeId> = match document.tree.get(root).and_then(ElementRef::wrap) {
            Some(root_el) => root_el
                .select(&NOISE_SEL)
                .map(|el| el.id())
                .filter(|id| *id != root)
                .collect(),
            None => Vec::new(),
        };

        let mut detached = Vec::with_capacity(targets.len());
        for id in targets {
            let Some(node) = document.tree.get(id) else {
                continue;
            };
            let Some(parent) = node.parent().map(|p| p.id()) else {
                continue;
            };
            let next_sibling = node.next_sibling().map(|s| s.id());
            if let Some(mut node) = document.tree.get_mut(id) {
                node.detach();
                detached.push(Detached {
                    id,
                    parent,
                    next_sibling,
                });
            }
        }

        if !detached.is_empty() {
            tracing::debug!(count = detached.len(), "detached noise elements");
        }
        NoiseGuard { document, detached }
    }
}

impl Drop for NoiseGuard<'_> {
    fn drop(&mut self) {
        let tree = &mut self.document.tree;
        for d in self.detached.drain(..).rev() {
            if let Some(mut sibling) = d.next_sibling.and_then(|s| tree.get_mut(s)) {
                sibling.insert_id_before(d.id);
                continue;
            }
            if let Some(mut parent) = tree.get_mut(d.parent) {
                parent.append_id(d.id);
            }
        }
    }
}

/// Run `f` with noise elements under `root` detached from `document`.
///
/// The elements are restored on every exit path, including a panic in `f`.
pub fn with_noise_detached<R>(
    document: &mut Html,
    root: NodeId,
    f: impl FnOnce(&Html) -> R,
) -> R {
    let guard = NoiseGuard::detach(document, root);
    let result = f(&*guard.document);
    drop(guard);
    result
}

// ── Collection ───────────────────────────────────────────────────────────────

struct Collector<'o> {
    options: &'o ExtractOptions,
    segments: Vec<Segment>,
    /// Flattened text so far, for de-duplicating URLs.
    seen: String,
    len: usize,
}

impl Collector<'_> {
    fn push(&mut self, segment: Segment) {
        let flat = segment.flattened();
        self.len += flat.chars().count();
        self.seen.push_str(&flat);
        self.segments.push(segment);
    }
}

fn collect(document: &Html, root: NodeId, options: &ExtractOptions) -> ExtractedDocument {
    let mut c = Collector {
        options,
        segments: Vec::new(),
        seen: String::new(),
        len: 0,
    };

    if let Some(root_el) = document.tree.get(root).and_then(ElementRef::wrap) {
        walk_text(root_el, &mut c);
        collect_links(root_el, &mut c);
        collect_images(root_el, &mut c);
        if options.mode == ExtractMode::FullPage {
            collect_tables(root_el, &mut c);
            collect_charts(root_el, &mut c);
        }
    }

    tracing::debug!(
        segments = c.segments.len(),
        chars = c.len,
        "collected page content"
    );
    ExtractedDocument {
        segments: c.segments,
        max_chars: options.max_chars,
    }
}

fn walk_text(root: ElementRef<'_>, c: &mut Collector<'_>) {
    for node in root.descendants() {
        if c.len >= c.options.max_chars {
            break;
        }
        let Node::Text(text) = node.value() else {
            continue;
        };
        let chunk = normalize_text((&*text.text).to_string());
        if chunk.is_empty() {
            continue;
        }
        let Some(parent) = node.parent().and_then(ElementRef::wrap) else {
            continue;
        };
        if is_hidden(parent) || is_promotional(&chunk) {
            continue;
        }
        c.push(Segment::Text(chunk));
    }
}

fn collect_links(root: ElementRef<'_>, c: &mut Collector<'_>) {
    let mut count = 0;
    for anchor in root.select(&ANCHOR_SEL) {
        if count >= c.options.link_cap() {
            break;
        }
        let Some(href) = anchor.value().attr("href").map(str::trim) else {
            continue;
        };
        if href.is_empty()
            || href.starts_with('#')
            || href.to_ascii_lowercase().starts_with("javascript:")
        {
            continue;
        }
        let text = normalize_text(collect_text(anchor));
        if text.is_empty() || is_hidden(anchor) {
            continue;
        }
        let url = resolve_url(href, c.options.base_url.as_ref());
        if c.seen.contains(&url) || PROMO_HREF_RE.is_match(&url) {
            continue;
        }
        c.push(Segment::Marker(Marker::Link { text, url }));
        count += 1;
    }
}

fn collect_images(root: ElementRef<'_>, c: &mut Collector<'_>) {
    let mut count = 0;
    for img in root.select(&IMG_SEL) {
        if count >= c.options.image_cap() {
            break;
        }
        if is_hidden(img) {
            continue;
        }
        let Some(url) = resolve_img_src(img, c.options.base_url.as_ref()) else {
            continue;
        };
        if url.starts_with("data:") {
            continue;
        }
        let v = img.value();
        let alt = v
            .attr("alt")
            .or_else(|| v.attr("title"))
            .map(|s| normalize_text(s.to_string()))
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "Image".to_string());
        if ICON_RE.is_match(&url) || ICON_RE.is_match(&alt) || c.seen.contains(&url) {
            continue;
        }
        let context = figure_caption(img);
        c.push(Segment::Marker(Marker::Image { alt, context, url }));
        count += 1;
    }
}

fn collect_tables(root: ElementRef<'_>, c: &mut Collector<'_>) {
    for table in root.select(&TABLE_SEL) {
        if is_hidden(table) {
            continue;
        }
        let raw_text = flatten_table(table);
        if raw_text.chars().count() > MIN_TABLE_LEN {
            c.push(Segment::Marker(Marker::Table { raw_text }));
        }
    }
}

fn collect_charts(root: ElementRef<'_>, c: &mut Collector<'_>) {
    for chart in root.select(&CHART_SEL) {
        if is_hidden(chart) {
            continue;
        }
        let text = normalize_text(collect_text(chart));
        let image_url = find_first_tag(chart, "img")
            .and_then(|img| resolve_img_src(img, c.options.base_url.as_ref()))
            .filter(|u| !u.starts_with("data:"));
        if text.chars().count() > MIN_CHART_LEN || image_url.is_some() {
            c.push(Segment::Marker(Marker::Chart { text, image_url }));
        }
    }
}

fn flatten_table(table: ElementRef<'_>) -> String {
    table
        .select(&ROW_SEL)
        .map(|row| {
            row.children()
                .filter_map(ElementRef::wrap)
                .filter(|cell| matches!(cell.value().name(), "th" | "td"))
                .map(|cell| normalize_text(collect_text(cell)))
                .filter(|cell| !cell.is_empty())
                .collect::<Vec<_>>()
                .join("\t")
        })
        .filter(|row| !row.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn figure_caption(img: ElementRef<'_>) -> Option<String> {
    let figure = img
        .ancestors()
        .filter_map(ElementRef::wrap)
        .find(|el| el.value().name() == "figure")?;
    let caption = normalize_text(collect_text(find_first_tag(figure, "figcaption")?));
    if caption.is_empty() {
        return None;
    }
    Some(caption.chars().take(MAX_CAPTION_LEN).collect())
}

// ── Filters ──────────────────────────────────────────────────────────────────

/// Approximates computed visibility from markup: non-rendered tags, the
/// `hidden` attribute and inline `display`/`visibility` declarations.
fn is_hidden(el: ElementRef<'_>) -> bool {
    let mut visibility: Option<bool> = None;
    let mut current = Some(el);
    while let Some(e) = current {
        let v = e.value();
        if NON_RENDERED_TAGS.contains(&v.name()) || v.attr("hidden").is_some() {
            return true;
        }
        if let Some(style) = v.attr("style") {
            for decl in style.split(';') {
                let Some((name, value)) = decl.split_once(':') else {
                    continue;
                };
                let name = name.trim().to_ascii_lowercase();
                let value = value
                    .trim()
                    .trim_end_matches("!important")
                    .trim()
                    .to_ascii_lowercase();
                match name.as_str() {
                    "display" if value == "none" => return true,
                    // Nearest declaration wins; visibility inherits.
                    "visibility" if visibility.is_none() => {
                        visibility = Some(value == "hidden" || value == "collapse");
                    }
                    _ => {}
                }
            }
        }
        current = e.parent().and_then(ElementRef::wrap);
    }
    visibility.unwrap_or(false)
}

fn is_promotional(chunk: &str) -> bool {
    PROMO_TEXT_RE.is_match(chunk) || DOLLAR_AMOUNT_RE.is_match(chunk)
}

// ── URL helpers ──────────────────────────────────────────────────────────────

/// Absolute URLs are kept verbatim; relative ones are joined onto `base`.
fn resolve_url(raw: &str, base: Option<&Url>) -> String {
    if Url::parse(raw).is_ok() {
        return raw.to_string();
    }
    base.and_then(|b| b.join(raw).ok())
        .map(|u| u.to_string())
        .unwrap_or_else(|| raw.to_string())
}

fn resolve_img_src(el: ElementRef<'_>, base: Option<&Url>) -> Option<String> {
    let v = el.value();

    // Priority: src → lazy-load attributes → largest srcset candidate.
    let src = v
        .attr("src")
        .or_else(|| v.attr("data-src"))
        .or_else(|| v.attr("data-lazy-src"))
        .or_else(|| v.attr("data-original"))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .or_else(|| {
            v.attr("srcset")
                .or_else(|| v.attr("data-srcset"))
                .and_then(best_src_from_srcset)
        })?;

    Some(resolve_url(&src, base))
}

fn best_src_from_srcset(srcset: &str) -> Option<String> {
    let mut best: Option<(f64, String)> = None;

    for part in srcset.split(',') {
        let mut pieces = part.split_whitespace();
        let Some(url) = pieces.next() else {
            continue;
        };
        let score = pieces
            .next()
            .and_then(|desc| {
                desc.strip_suffix('w')
                    .or_else(|| desc.strip_suffix('x'))
                    .and_then(|n| n.parse::<f64>().ok())
            })
            .unwrap_or(0.0);
        // Ties keep the later candidate.
        if best.as_ref().map_or(true, |(s, _)| score >= *s) {
            best = Some((score, url.to_string()));
        }
    }

    best.map(|(_, url)| url)
}

// ── DOM utility helpers ──────────────────────────────────────────────────────

/// Recursively collect rendered text from an element and its descendants.
fn collect_text(el: ElementRef<'_>) -> String {
    let mut parts = Vec::new();
    for child in el.children() {
        match child.value() {
            Node::Text(text) => parts.push((&*text.text).to_string()),
            Node::Element(element) => {
                if NON_RENDERED_TAGS.contains(&element.name()) {
                    continue;
                }
                if let Some(child_el) = ElementRef::wrap(child) {
                    parts.push(collect_text(child_el));
                }
            }
            _ => {}
        }
    }
    parts.join(" ")
}

/// Collapse whitespace runs to single spaces and trim.
fn normalize_text(text: String) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Depth-first search for the first element with the given tag name.
fn find_first_tag<'a>(el: ElementRef<'a>, tag: &str) -> Option<ElementRef<'a>> {
    for child in el.children() {
        if let Some(child_el) = ElementRef::wrap(child) {
            if child_el.value().name() == tag {
                return Some(child_el);
            }
            if let Some(found) = find_first_tag(child_el, tag) {
                return Some(found);
            }
        }
    }
    None
}
