//! In-place rewrite of a page's main content and the toggle back.

use ego_tree::{NodeId, NodeRef, Tree};
use once_cell::sync::Lazy;
use scraper::{ElementRef, Html, Node, Selector};

use crate::extract::find_main_content;
use crate::render::{RenderedFragment, CONTAINER_ID};

pub const STYLESHEET_ID: &str = "engagify-style";
pub const TOGGLE_ID: &str = "engagify-restore";

static HEAD_SEL: Lazy<Selector> = Lazy::new(|| Selector::parse("head").unwrap());
static BODY_SEL: Lazy<Selector> = Lazy::new(|| Selector::parse("body").unwrap());

#[derive(Debug, thiserror::Error)]
pub enum PageError {
    #[error("page has no content to rewrite")]
    NoTarget,
    #[error("could not build injected markup")]
    Markup,
}

/// Nodes added by a rewrite, plus the original nodes they stand in for.
///
/// Detached nodes stay in the document's arena, so switching views moves
/// existing nodes around instead of rebuilding them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Injection {
    parent: NodeId,
    original: Vec<NodeId>,
    content: NodeId,
    stylesheet: NodeId,
    stylesheet_parent: NodeId,
    toggle: NodeId,
    toggle_parent: NodeId,
}

/// Which view of the page is showing. A page has at most one injection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageView {
    Original(Option<Injection>),
    Rewritten(Injection),
}

impl Default for PageView {
    fn default() -> Self {
        PageView::Original(None)
    }
}

impl PageView {
    pub fn is_rewritten(&self) -> bool {
        matches!(self, PageView::Rewritten(_))
    }

    /// Replace the main content with `fragment`, discarding any earlier rewrite.
    pub fn rewrite(
        &mut self,
        document: &mut Html,
        fragment: &RenderedFragment,
    ) -> Result<(), PageError> {
        self.restore(document);

        let target = find_main_content(document);
        let (parent, original) = {
            let node = document.tree.get(target).ok_or(PageError::NoTarget)?;
            let is_body = ElementRef::wrap(node).is_some_and(|el| el.value().name() == "body");
            if is_body {
                (target, node.children().map(|c| c.id()).collect::<Vec<_>>())
            } else {
                let parent = node.parent().ok_or(PageError::NoTarget)?.id();
                (parent, vec![target])
            }
        };

        let root = document.root_element();
        let body = root.select(&BODY_SEL).next().map(|b| b.id()).unwrap_or(parent);
        let head = root.select(&HEAD_SEL).next().map(|h| h.id()).unwrap_or(body);

        let content = import_element(
            document,
            &format!("<div id=\"{}\">{}</div>", CONTAINER_ID, fragment.html),
        )?;
        let stylesheet = import_element(
            document,
            &format!("<style id=\"{}\">{}</style>", STYLESHEET_ID, fragment.stylesheet),
        )?;
        let toggle = import_element(
            document,
            &format!("<button type=\"button\" id=\"{}\">Restore Original</button>", TOGGLE_ID),
        )?;

        let injection = Injection {
            parent,
            original,
            content,
            stylesheet,
            stylesheet_parent: head,
            toggle,
            toggle_parent: body,
        };
        attach(document, &injection);
        tracing::debug!(nodes = injection.original.len(), "rewrote main content");
        *self = PageView::Rewritten(injection);
        Ok(())
    }

    /// Bring the original content back. Returns false if nothing was rewritten.
    pub fn restore(&mut self, document: &mut Html) -> bool {
        match std::mem::take(self) {
            PageView::Rewritten(injection) => {
                detach(document, &injection);
                *self = PageView::Original(Some(injection));
                true
            }
            original => {
                *self = original;
                false
            }
        }
    }

    /// Show the last rewrite again. Returns false if there is none to show.
    pub fn show(&mut self, document: &mut Html) -> bool {
        match std::mem::take(self) {
            PageView::Original(Some(injection)) => {
                attach(document, &injection);
                *self = PageView::Rewritten(injection);
                true
            }
            other => {
                let shown = other.is_rewritten();
                *self = other;
                shown
            }
        }
    }

    /// Flip between views; returns whether the rewrite is now showing.
    pub fn toggle(&mut self, document: &mut Html) -> bool {
        if self.is_rewritten() {
            self.restore(document);
            false
        } else {
            self.show(document)
        }
    }
}

fn attach(document: &mut Html, injection: &Injection) {
    let tree = &mut document.tree;
    let anchor = injection
        .original
        .first()
        .copied()
        .filter(|id| tree.get(*id).is_some_and(|n| n.parent().is_some()));
    let mut placed = false;
    if let Some(mut first) = anchor.and_then(|id| tree.get_mut(id)) {
        first.insert_id_before(injection.content);
        placed = true;
    }
    if !placed {
        if let Some(mut parent) = tree.get_mut(injection.parent) {
            parent.append_id(injection.content);
        }
    }
    for id in &injection.original {
        if let Some(mut node) = tree.get_mut(*id) {
            node.detach();
        }
    }
    if let Some(mut head) = tree.get_mut(injection.stylesheet_parent) {
        head.append_id(injection.stylesheet);
    }
    if let Some(mut body) = tree.get_mut(injection.toggle_parent) {
        body.append_id(injection.toggle);
    }
}

fn detach(document: &mut Html, injection: &Injection) {
    let tree = &mut document.tree;
    for id in &injection.original {
        if let Some(mut content) = tree.get_mut(injection.content) {
            content.insert_id_before(*id);
        }
    }
    for id in [injection.content, injection.stylesheet, injection.toggle] {
        if let Some(mut node) = tree.get_mut(id) {
            node.detach();
        }
    }
}

/// Parse `html` and copy its first element into `document` as an orphan.
fn import_element(document: &mut Html, html: &str) -> Result<NodeId, PageError> {
    let fragment = Html::parse_fragment(html);
    let source = fragment
        .root_element()
        .children()
        .find(|child| child.value().is_element())
        .ok_or(PageError::Markup)?;
    Ok(copy_subtree(&mut document.tree, source))
}

fn copy_subtree(tree: &mut Tree<Node>, source: NodeRef<'_, Node>) -> NodeId {
    let id = tree.orphan(source.value().clone()).id();
    for child in source.children() {
        let child_id = copy_subtree(tree, child);
        if let Some(mut parent) = tree.get_mut(id) {
            parent.append_id(child_id);
        }
    }
    id
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::render;
    use crate::theme::ThemeColors;

    fn article_page() -> Html {
        let words = vec!["original"; 120].join(" ");
        Html::parse_document(&format!(
            "<html><head><title>t</title></head><body><header>Site</header>\
             <article><p>{words}</p></article><footer>f</footer></body></html>"
        ))
    }

    fn fragment() -> RenderedFragment {
        render("<h1>New</h1><p>Rewritten **body**</p>", &ThemeColors::fallback())
    }

    #[test]
    fn rewrite_replaces_main_content() {
        let mut doc = article_page();
        let mut view = PageView::default();
        view.rewrite(&mut doc, &fragment()).unwrap();

        let html = doc.html();
        assert!(view.is_rewritten());
        assert!(html.contains("<div id=\"engagified-content\"><h1>New</h1>"));
        assert!(html.contains("<strong>body</strong>"));
        assert!(!html.contains("original original"));
        assert!(html.contains("<header>Site</header>"));
        assert!(html.contains("id=\"engagify-style\""));
        assert!(html.contains("Restore Original"));
    }

    #[test]
    fn restore_brings_back_identical_page() {
        let mut doc = article_page();
        let before = doc.html();
        let mut view = PageView::default();
        view.rewrite(&mut doc, &fragment()).unwrap();

        assert!(view.restore(&mut doc));
        assert_eq!(doc.html(), before);
        assert!(!view.restore(&mut doc));
    }

    #[test]
    fn toggling_reproduces_the_same_rewrite() {
        let mut doc = article_page();
        let mut view = PageView::default();
        view.rewrite(&mut doc, &fragment()).unwrap();
        let first = doc.html();

        for _ in 0..2 {
            assert!(!view.toggle(&mut doc));
            assert!(view.toggle(&mut doc));
            assert_eq!(doc.html(), first);
        }
    }

    #[test]
    fn body_level_rewrite_round_trips() {
        let mut doc = Html::parse_document("<html><head></head><body><p>short</p> tail</body></html>");
        let before = doc.html();
        let mut view = PageView::default();
        view.rewrite(&mut doc, &fragment()).unwrap();
        assert!(!doc.html().contains("short"));

        view.restore(&mut doc);
        assert_eq!(doc.html(), before);
    }

    #[test]
    fn second_rewrite_keeps_a_single_view() {
        let mut doc = article_page();
        let mut view = PageView::default();
        view.rewrite(&mut doc, &fragment()).unwrap();
        let other = render("<p>second version</p>", &ThemeColors::fallback());
        view.rewrite(&mut doc, &other).unwrap();

        let html = doc.html();
        assert_eq!(html.matches("id=\"engagified-content\"").count(), 1, "{html}");
        assert_eq!(html.matches("id=\"engagify-style\"").count(), 1);
        assert!(html.contains("second version"));
        assert!(!html.contains("Rewritten"));
        assert_eq!(html.matches(TOGGLE_ID).count(), 1);
    }

    #[test]
    fn show_without_rewrite_is_a_no_op() {
        let mut doc = article_page();
        let before = doc.html();
        let mut view = PageView::default();
        assert!(!view.show(&mut doc));
        assert!(!view.toggle(&mut doc));
        assert_eq!(doc.html(), before);
    }
}
