use once_cell::sync::Lazy;
use regex::Regex;
use scraper::node::Node;
use scraper::{ElementRef, Html};

use crate::marker::{split_markers, Marker, Piece};
use crate::theme::ThemeColors;

// ── Constants ────────────────────────────────────────────────────────────────

/// Id of the element that holds rewritten content; the stylesheet is scoped to it.
pub const CONTAINER_ID: &str = "engagified-content";

const ALLOWED_TAGS: &[&str] = &[
    "h1", "h2", "h3", "h4", "h5", "h6", "p", "ul", "ol", "li", "strong", "em", "b", "i", "a",
    "img", "span", "div", "br", "table", "thead", "tbody", "tr", "th", "td", "figure",
    "figcaption", "blockquote",
];

/// Removed together with everything inside them.
const DROPPED_TAGS: &[&str] = &[
    "script", "style", "noscript", "iframe", "object", "embed", "template", "svg", "math", "head",
    "title", "textarea", "select",
];

const VOID_TAGS: &[&str] = &["br", "img"];

/// Attribute of the empty `<span>` that stands in for a marker while the
/// surrounding markup is parsed.
const MARKER_ATTR: &str = "data-engagify-marker";

// ── Lazy static regexes ──────────────────────────────────────────────────────

static FENCE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"```[\s\S]*?```").unwrap());

static OPEN_FENCE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"```[\s\S]*$").unwrap());

static STYLE_BLOCK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<style\b.*?</style\s*>").unwrap());

static BOLD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\*\*([^*\n]+)\*\*").unwrap());

static ITALIC_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\*([^*\n]+)\*").unwrap());

static MARKER_ATTR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)data-engagify-marker").unwrap());

static UNSAFE_SCHEME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(?:java|vb)script:|livescript:").unwrap());

// ── Fragment tree ────────────────────────────────────────────────────────────

/// Sanitized output tree. Only allow-listed tags and attributes can be
/// represented, so serializing it cannot reintroduce markup the walk dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FragmentNode {
    Element {
        tag: &'static str,
        attrs: Vec<(&'static str, String)>,
        children: Vec<FragmentNode>,
    },
    Text(String),
}

impl FragmentNode {
    fn element(
        tag: &'static str,
        attrs: Vec<(&'static str, String)>,
        children: Vec<FragmentNode>,
    ) -> Self {
        FragmentNode::Element {
            tag,
            attrs,
            children,
        }
    }

    fn text(s: impl Into<String>) -> Self {
        FragmentNode::Text(s.into())
    }
}

/// Sanitized model output, ready to be placed inside [`CONTAINER_ID`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedFragment {
    pub html: String,
    pub stylesheet: String,
    pub theme: ThemeColors,
    /// Characters of visible text, whitespace excluded.
    pub text_len: usize,
}

// ── Public API ───────────────────────────────────────────────────────────────

/// Turn raw model output into a safe HTML fragment styled with `theme`.
pub fn render(raw: &str, theme: &ThemeColors) -> RenderedFragment {
    let nodes = sanitize(raw);
    let mut html = String::new();
    for node in &nodes {
        write_node(node, &mut html);
    }
    RenderedFragment {
        html,
        stylesheet: theme.stylesheet(),
        theme: theme.clone(),
        text_len: text_len(&nodes),
    }
}

/// Clean `raw` and parse it into an allow-listed fragment tree.
///
/// Markers are lifted out of the raw text before parsing, so their text and
/// URLs never pass through entity decoding or tag recognition.
pub fn sanitize(raw: &str) -> Vec<FragmentNode> {
    let (cleaned, markers) = lift_markers(&strip_fences(raw));
    let cleaned = STYLE_BLOCK_RE.replace_all(&cleaned, "");
    let cleaned = convert_emphasis(&cleaned);
    let fragment = Html::parse_fragment(&cleaned);

    let mut markers: Vec<Option<Marker>> = markers.into_iter().map(Some).collect();
    let mut nodes = Vec::new();
    sanitize_children(fragment.root_element(), &mut nodes, &mut markers, false);
    nodes
}

// ── Text-level cleanup ───────────────────────────────────────────────────────

fn strip_fences(raw: &str) -> String {
    let without_fences = FENCE_RE.replace_all(raw, "");
    OPEN_FENCE_RE.replace_all(&without_fences, "").into_owned()
}

/// Swap every marker for a numbered placeholder span. Placeholder attributes
/// already present in the text are renamed so only ours are expanded.
fn lift_markers(text: &str) -> (String, Vec<Marker>) {
    let mut out = String::with_capacity(text.len());
    let mut markers = Vec::new();
    for piece in split_markers(text) {
        match piece {
            Piece::Text(t) => out.push_str(&MARKER_ATTR_RE.replace_all(t, "data-marker")),
            Piece::Marker(marker) => {
                out.push_str(&format!("<span {}={}></span>", MARKER_ATTR, markers.len()));
                markers.push(marker);
            }
        }
    }
    (out, markers)
}

fn convert_emphasis(text: &str) -> String {
    let bold = BOLD_RE.replace_all(text, "<strong>${1}</strong>");
    ITALIC_RE.replace_all(&bold, "<em>${1}</em>").into_owned()
}

// ── Tree walk ────────────────────────────────────────────────────────────────

fn sanitize_children(
    parent: ElementRef<'_>,
    out: &mut Vec<FragmentNode>,
    markers: &mut [Option<Marker>],
    in_link: bool,
) {
    for child in parent.children() {
        match child.value() {
            Node::Text(text) => out.push(FragmentNode::text(&*text.text)),
            Node::Element(_) => {
                if let Some(el) = ElementRef::wrap(child) {
                    sanitize_element(el, out, markers, in_link);
                }
            }
            _ => {}
        }
    }
}

fn sanitize_element(
    el: ElementRef<'_>,
    out: &mut Vec<FragmentNode>,
    markers: &mut [Option<Marker>],
    in_link: bool,
) {
    let name = el.value().name();
    if DROPPED_TAGS.contains(&name) {
        return;
    }
    if name == "span" {
        if let Some(marker) = take_marker(el, markers) {
            out.push(expand_marker(marker, in_link));
            return;
        }
    }

    let Some(tag) = ALLOWED_TAGS.iter().copied().find(|t| *t == name) else {
        // Unknown wrapper: keep what is inside it.
        sanitize_children(el, out, markers, in_link);
        return;
    };

    let attrs = allowed_attrs(tag, el);
    if tag == "img" && !attrs.iter().any(|(k, _)| *k == "src") {
        return;
    }

    let mut children = Vec::new();
    if !VOID_TAGS.contains(&tag) {
        sanitize_children(el, &mut children, markers, in_link || tag == "a");
    }
    out.push(FragmentNode::element(tag, attrs, children));
}

fn allowed_attrs(tag: &'static str, el: ElementRef<'_>) -> Vec<(&'static str, String)> {
    let mut attrs = Vec::new();
    let mut has_href = false;

    for (name, value) in el.value().attrs() {
        let name = name.to_ascii_lowercase();
        if name.starts_with("on") || UNSAFE_SCHEME_RE.is_match(value) {
            continue;
        }
        let key: &'static str = match (tag, name.as_str()) {
            (_, "title") => "title",
            (_, "class") => "class",
            (_, "style") if is_safe_style(value) => "style",
            ("a", "href") => match safe_url(value, false) {
                Some(_) => {
                    has_href = true;
                    "href"
                }
                None => continue,
            },
            ("img", "src") if safe_url(value, true).is_some() => "src",
            ("img", "alt") => "alt",
            ("img", "width") => "width",
            ("img", "height") => "height",
            ("th" | "td", "colspan") => "colspan",
            ("th" | "td", "rowspan") => "rowspan",
            ("ol", "start") => "start",
            _ => continue,
        };
        attrs.push((key, value.trim().to_string()));
    }

    if tag == "a" && has_href {
        attrs.push(("target", "_blank".to_string()));
        attrs.push(("rel", "noopener".to_string()));
    }
    attrs
}

fn is_safe_style(value: &str) -> bool {
    let compact: String = value
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_ascii_lowercase();
    !(compact.contains("expression(") || compact.contains("url(") || compact.contains("@import"))
}

/// `None` for URLs with a scriptable or otherwise unsuitable scheme.
fn safe_url(url: &str, image: bool) -> Option<&str> {
    let trimmed = url.trim();
    if trimmed.is_empty() {
        return None;
    }
    let compact: String = trimmed
        .chars()
        .filter(|c| !c.is_whitespace() && !c.is_control())
        .collect::<String>()
        .to_ascii_lowercase();
    if UNSAFE_SCHEME_RE.is_match(&compact) {
        return None;
    }
    if compact.starts_with("data:") && !(image && compact.starts_with("data:image/")) {
        return None;
    }
    Some(trimmed)
}

// ── Marker expansion ─────────────────────────────────────────────────────────

/// Each lifted marker is expanded at most once.
fn take_marker(el: ElementRef<'_>, markers: &mut [Option<Marker>]) -> Option<Marker> {
    let index = el.value().attr(MARKER_ATTR)?.parse::<usize>().ok()?;
    markers.get_mut(index)?.take()
}

fn expand_marker(marker: Marker, in_link: bool) -> FragmentNode {
    match marker {
        Marker::Link { text, url } => match safe_url(&url, false) {
            Some(href) if !in_link => FragmentNode::element(
                "a",
                vec![
                    ("href", href.to_string()),
                    ("target", "_blank".to_string()),
                    ("rel", "noopener".to_string()),
                ],
                vec![FragmentNode::text(text)],
            ),
            _ => FragmentNode::text(text),
        },

        Marker::Image { alt, context, url } => {
            let Some(src) = safe_url(&url, true) else {
                return FragmentNode::text(alt);
            };
            let img = FragmentNode::element(
                "img",
                vec![("src", src.to_string()), ("alt", alt)],
                Vec::new(),
            );
            match context {
                Some(ctx) => FragmentNode::element(
                    "figure",
                    Vec::new(),
                    vec![
                        img,
                        FragmentNode::element("figcaption", Vec::new(), vec![FragmentNode::text(ctx)]),
                    ],
                ),
                None => img,
            }
        }

        Marker::Table { raw_text } => {
            let rows = table_rows(&raw_text);
            if rows.len() < 2 {
                return FragmentNode::text(Marker::Table { raw_text }.to_string());
            }
            let row_node = |cells: &[String], cell_tag: &'static str| {
                FragmentNode::element(
                    "tr",
                    Vec::new(),
                    cells
                        .iter()
                        .map(|c| FragmentNode::element(cell_tag, Vec::new(), vec![FragmentNode::text(c.clone())]))
                        .collect(),
                )
            };
            let head = FragmentNode::element("thead", Vec::new(), vec![row_node(&rows[0], "th")]);
            let body = FragmentNode::element(
                "tbody",
                Vec::new(),
                rows[1..].iter().map(|r| row_node(r, "td")).collect(),
            );
            FragmentNode::element("table", Vec::new(), vec![head, body])
        }

        Marker::Chart { text, image_url } => {
            let class = vec![("class", "engagify-chart".to_string())];
            let caption = format!("Chart: {}", text);
            match image_url.as_deref().and_then(|u| safe_url(u, true)) {
                Some(src) => FragmentNode::element(
                    "figure",
                    class,
                    vec![
                        FragmentNode::element(
                            "img",
                            vec![("src", src.to_string()), ("alt", text.clone())],
                            Vec::new(),
                        ),
                        FragmentNode::element("figcaption", Vec::new(), vec![FragmentNode::text(caption)]),
                    ],
                ),
                None => FragmentNode::element("div", class, vec![FragmentNode::text(caption)]),
            }
        }
    }
}

/// Non-empty rows, each split into non-empty tab-separated cells.
fn table_rows(raw: &str) -> Vec<Vec<String>> {
    raw.split('\n')
        .filter(|row| !row.trim().is_empty())
        .map(|row| {
            row.split('\t')
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .collect::<Vec<_>>()
        })
        .filter(|cells| !cells.is_empty())
        .collect()
}

// ── Serialization ────────────────────────────────────────────────────────────

fn write_node(node: &FragmentNode, out: &mut String) {
    match node {
        FragmentNode::Text(text) => escape_text(text, out),
        FragmentNode::Element {
            tag,
            attrs,
            children,
        } => {
            out.push('<');
            out.push_str(tag);
            for (key, value) in attrs {
                out.push(' ');
                out.push_str(key);
                out.push_str("=\"");
                escape_attr(value, out);
                out.push('"');
            }
            out.push('>');
            if VOID_TAGS.contains(tag) {
                return;
            }
            for child in children {
                write_node(child, out);
            }
            out.push_str("</");
            out.push_str(tag);
            out.push('>');
        }
    }
}

pub(crate) fn escape_text(text: &str, out: &mut String) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
}

fn escape_attr(value: &str, out: &mut String) {
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
}

fn text_len(nodes: &[FragmentNode]) -> usize {
    nodes
        .iter()
        .map(|node| match node {
            FragmentNode::Text(t) => t.chars().filter(|c| !c.is_whitespace()).count(),
            FragmentNode::Element { children, .. } => text_len(children),
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use scraper::Selector;

    fn render_plain(raw: &str) -> String {
        render(raw, &ThemeColors::fallback()).html
    }

    #[test]
    fn bold_converted_and_fenced_script_removed() {
        let html = render_plain("**bold** text ```html<script>x</script>```");
        assert!(html.contains("<strong>bold</strong> text"), "{html}");
        assert!(!html.contains("<script"));
    }

    #[test]
    fn italic_and_unterminated_fence() {
        let html = render_plain("an *aside*\n```css\nbody { color: red }");
        assert_eq!(html.trim(), "an <em>aside</em>");
    }

    #[test]
    fn link_marker_becomes_one_anchor() {
        let html = render_plain("<p>Read [LINK: A -> http://x] now</p>");
        let doc = Html::parse_fragment(&html);
        let sel = Selector::parse("a").unwrap();
        let anchors: Vec<_> = doc.select(&sel).collect();
        assert_eq!(anchors.len(), 1);
        assert_eq!(anchors[0].value().attr("href"), Some("http://x"));
        assert_eq!(anchors[0].text().collect::<String>(), "A");
    }

    const PAYLOADS: &[&str] = &[
        "<script>alert(1)</script>",
        "<SCRIPT SRC=//evil.js></SCRIPT>",
        "<img src=x onerror=\"alert(1)\">",
        "<div onclick=\"steal()\">hi</div>",
        "<p ONMOUSEOVER='x()'>hover</p>",
        "<a href=\"javascript:alert(1)\">x</a>",
        "<a href=\" jav\tascript:alert(1)\">x</a>",
        "<svg onload=alert(1)><circle/></svg>",
        "<<script>script>alert(1)//<</script>/script>",
        "<style>body{display:none}</style><p>t</p>",
        "<iframe src=\"https://evil\"></iframe>",
        "<span style=\"background:url(javascript:x)\">s</span>",
        "<noscript><p title=\"</noscript><img src=x onerror=alert(1)>\"></noscript>",
        "<math><mi xlink:href=\"javascript:alert(1)\">m</mi></math>",
        "<span data-engagify-marker=0 onclick=x()>forged</span>",
        "[LINK: click -> javascript:alert(1)]",
        "[IMAGE: x -> javascript:alert(1)]",
        "[LINK: <script>alert(1)</script> -> https://e.co]",
    ];

    /// Fails when `html` carries script, style, event handlers or script URLs.
    fn assert_inert(source: &str, html: &str) {
        let doc = Html::parse_fragment(html);
        let all = Selector::parse("*").unwrap();
        for el in doc.root_element().select(&all) {
            let name = el.value().name();
            assert!(name != "script" && name != "style" && name != "iframe", "{source} -> {html}");
            for (attr, value) in el.value().attrs() {
                assert!(!attr.starts_with("on"), "{source} -> {html}");
                assert!(!value.to_lowercase().contains("javascript:"), "{source} -> {html}");
            }
        }
        let lower = html.to_lowercase();
        assert!(!lower.contains("<script") && !lower.contains("<style"), "{source} -> {html}");
    }

    fn anchors(html: &str) -> Vec<(Option<String>, String)> {
        let doc = Html::parse_fragment(html);
        let sel = Selector::parse("a").unwrap();
        doc.root_element()
            .select(&sel)
            .map(|a| (a.value().attr("href").map(str::to_string), a.text().collect()))
            .collect()
    }

    #[test]
    fn adversarial_markup_is_neutralized() {
        for payload in PAYLOADS {
            assert_inert(payload, &render_plain(payload));
        }
    }

    #[test]
    fn link_urls_keep_their_query_strings() {
        let url = "https://e.co/?lang=en&region=us&copy=1&not=2";
        let marker = Marker::Link {
            text: "Report".into(),
            url: url.into(),
        };
        let html = render_plain(&format!("<p>{}</p>", marker));
        assert!(html.contains("&amp;region=us&amp;copy=1"), "{html}");
        assert_eq!(anchors(&html), vec![(Some(url.to_string()), "Report".to_string())]);
    }

    #[test]
    fn angle_brackets_in_link_text_stay_text() {
        let marker = Marker::Link {
            text: "a<b and <em>c</em>".into(),
            url: "http://x".into(),
        };
        let html = render_plain(&format!("**See** {} today", marker));
        assert_eq!(
            anchors(&html),
            vec![(Some("http://x".to_string()), "a<b and <em>c</em>".to_string())]
        );
        assert!(html.starts_with("<strong>See</strong> <a "), "{html}");
        assert!(html.ends_with("</a> today"), "{html}");
    }

    #[test]
    fn forged_placeholders_are_not_expanded() {
        let html = render_plain("<span data-engagify-marker=0>fake</span>[LINK: real -> http://x]");
        assert_eq!(anchors(&html), vec![(Some("http://x".to_string()), "real".to_string())]);
        assert!(html.starts_with("<span>fake</span>"), "{html}");
    }

    #[test]
    fn marker_inside_anchor_is_flattened() {
        let html = render_plain("<a href=\"https://e.co\">go [LINK: inner -> http://x]</a>");
        assert_eq!(anchors(&html), vec![(Some("https://e.co".to_string()), "go inner".to_string())]);
    }

    #[test]
    fn disallowed_wrappers_are_unwrapped() {
        let html = render_plain("<section><h2>Title</h2><font>kept</font></section>");
        assert_eq!(html, "<h2>Title</h2>kept");
    }

    #[test]
    fn single_row_table_stays_text() {
        let html = render_plain("[TABLE: just one row]");
        assert_eq!(html, "[TABLE: just one row]");
    }

    #[test]
    fn multi_row_table_becomes_table() {
        let html = render_plain("[TABLE: Name\tAge\nAda\t36\nAlan\t41]");
        assert_eq!(
            html,
            "<table><thead><tr><th>Name</th><th>Age</th></tr></thead>\
<tbody><tr><td>Ada</td><td>36</td></tr><tr><td>Alan</td><td>41</td></tr></tbody></table>"
        );
    }

    #[test]
    fn image_with_context_becomes_figure() {
        let html = render_plain("[IMAGE: Dog | Context: In the park -> https://e.co/d.jpg]");
        assert_eq!(
            html,
            "<figure><img src=\"https://e.co/d.jpg\" alt=\"Dog\"><figcaption>In the park</figcaption></figure>"
        );
    }

    #[test]
    fn chart_without_image_is_a_labelled_block() {
        let html = render_plain("[CHART: Sales by quarter]");
        assert_eq!(html, "<div class=\"engagify-chart\">Chart: Sales by quarter</div>");
    }

    #[test]
    fn text_is_escaped_and_counted() {
        let fragment = render("<p>a &lt;b&gt; c</p>", &ThemeColors::fallback());
        assert_eq!(fragment.html, "<p>a &lt;b&gt; c</p>");
        assert_eq!(fragment.text_len, 5);
        assert!(fragment.stylesheet.contains(CONTAINER_ID));
    }

    const MARKUP: &[&str] = &[
        "<p>",
        "</p>",
        "<h2>Title</h2>",
        "<ul><li>",
        "</li></ul>",
        "<a href=\"https://e.co\">",
        "</a>",
        "<strong>",
        "</strong>",
        "<div class=\"x\">",
        "</div>",
        "<table><tr><td>",
        "</td></tr></table>",
        "plain words ",
        "**bold** ",
        "&amp; ",
        "<",
        "[LINK: a -> https://e.co]",
        "[IMAGE: i -> https://e.co/i.png]",
    ];

    proptest! {
        #[test]
        fn any_link_marker_renders_one_matching_anchor(
            text in r#"[A-Za-z0-9<>&;'".,!?=/-]([A-Za-z0-9 <>&;'".,!?=/-]{0,18}[A-Za-z0-9<>&;'".,!?=/-])?"#,
            url in r"https://e\.co/[A-Za-z0-9/?=&;%._-]{0,30}",
        ) {
            let marker = Marker::Link { text: text.clone(), url: url.clone() };
            let html = render_plain(&format!("<p>{}</p>", marker));
            prop_assert_eq!(anchors(&html), vec![(Some(url), text)]);
        }

        #[test]
        fn any_image_marker_renders_one_matching_img(
            alt in r#"[A-Za-z0-9<>&;'".,!?-]([A-Za-z0-9 <>&;'".,!?-]{0,18}[A-Za-z0-9<>&;'".,!?-])?"#,
            url in r"https://e\.co/[A-Za-z0-9/?=&;%._-]{0,30}",
        ) {
            let marker = Marker::Image { alt: alt.clone(), context: None, url: url.clone() };
            let html = render_plain(&format!("<p>{}</p>", marker));
            let doc = Html::parse_fragment(&html);
            let sel = Selector::parse("img").unwrap();
            let imgs: Vec<_> = doc.root_element().select(&sel).collect();
            prop_assert_eq!(imgs.len(), 1);
            prop_assert_eq!(imgs[0].value().attr("src"), Some(url.as_str()));
            prop_assert_eq!(imgs[0].value().attr("alt"), Some(alt.as_str()));
        }

        #[test]
        fn injections_spliced_into_markup_stay_inert(
            pieces in prop::collection::vec(
                (prop::sample::select(MARKUP), prop::sample::select(PAYLOADS)),
                1..8,
            ),
        ) {
            let raw: String = pieces.iter().flat_map(|(m, p)| [*m, *p]).collect();
            assert_inert(&raw, &render_plain(&raw));
        }
    }
}
