use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;

// ── Constants ────────────────────────────────────────────────────────────────

const ARROW: &str = " -> ";
const CONTEXT_SEP: &str = " | Context: ";

static MARKER_START_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[(LINK|IMAGE|TABLE|CHART_IMAGE|CHART): ").unwrap());

// ── Marker type ──────────────────────────────────────────────────────────────

/// Structured content that travels through the model inside plain text.
///
/// Every marker serializes to `[KIND: payload]`. Payload text escapes `\` and
/// `]` with a backslash so link text or captions containing a closing bracket
/// cannot terminate the marker early.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Marker {
    Link {
        text: String,
        url: String,
    },
    Image {
        alt: String,
        context: Option<String>,
        url: String,
    },
    /// Rows separated by `\n`, cells by `\t`.
    Table { raw_text: String },
    Chart {
        text: String,
        image_url: Option<String>,
    },
}

impl fmt::Display for Marker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Marker::Link { text, url } => {
                write!(f, "[LINK: {}{}{}]", escape(text), ARROW, escape(url))
            }
            Marker::Image { alt, context, url } => match context {
                Some(ctx) => write!(
                    f,
                    "[IMAGE: {}{}{}{}{}]",
                    escape(alt),
                    CONTEXT_SEP,
                    escape(ctx),
                    ARROW,
                    escape(url)
                ),
                None => write!(f, "[IMAGE: {}{}{}]", escape(alt), ARROW, escape(url)),
            },
            Marker::Table { raw_text } => write!(f, "[TABLE: {}]", escape(raw_text)),
            Marker::Chart { text, image_url } => match image_url {
                Some(url) => write!(f, "[CHART: {}{}{}]", escape(text), ARROW, escape(url)),
                None => write!(f, "[CHART: {}]", escape(text)),
            },
        }
    }
}

// ── Parsing ──────────────────────────────────────────────────────────────────

/// A run of free text or a recognized marker, in source order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Piece<'a> {
    Text(&'a str),
    Marker(Marker),
}

/// Split `text` into free text and markers.
///
/// Anything that looks like a marker but does not parse (missing `->`,
/// unterminated bracket) stays in the surrounding text untouched.
pub fn split_markers(text: &str) -> Vec<Piece<'_>> {
    let mut pieces = Vec::new();
    let mut cursor = 0;
    let mut search_from = 0;

    while let Some(caps) = MARKER_START_RE.captures_at(text, search_from) {
        let whole = match caps.get(0) {
            Some(m) => m,
            None => break,
        };
        let kind = &caps[1];
        let payload_start = whole.end();

        let Some(payload_end) = find_closing_bracket(&text[payload_start..]) else {
            break;
        };
        let payload = &text[payload_start..payload_start + payload_end];
        let marker_end = payload_start + payload_end + 1;

        match parse_payload(kind, payload) {
            Some(marker) => {
                if whole.start() > cursor {
                    pieces.push(Piece::Text(&text[cursor..whole.start()]));
                }
                pieces.push(Piece::Marker(marker));
                cursor = marker_end;
                search_from = marker_end;
            }
            None => {
                search_from = whole.start() + 1;
            }
        }
    }

    if cursor < text.len() {
        pieces.push(Piece::Text(&text[cursor..]));
    }
    pieces
}

fn parse_payload(kind: &str, payload: &str) -> Option<Marker> {
    match kind {
        "LINK" => {
            let (text, url) = payload.rsplit_once(ARROW)?;
            let text = unescape(text.trim());
            let url = unescape(url.trim());
            if text.is_empty() || url.is_empty() {
                return None;
            }
            Some(Marker::Link { text, url })
        }
        "IMAGE" => {
            let (head, url) = payload.rsplit_once(ARROW)?;
            let url = unescape(url.trim());
            if url.is_empty() {
                return None;
            }
            let (alt, context) = match head.split_once(CONTEXT_SEP) {
                Some((alt, ctx)) => {
                    let ctx = unescape(ctx.trim());
                    (unescape(alt.trim()), Some(ctx).filter(|c| !c.is_empty()))
                }
                None => (unescape(head.trim()), None),
            };
            Some(Marker::Image { alt, context, url })
        }
        "TABLE" => {
            let raw_text = unescape(payload.trim_matches(|c| c == ' '));
            if raw_text.trim().is_empty() {
                return None;
            }
            Some(Marker::Table { raw_text })
        }
        "CHART" | "CHART_IMAGE" => {
            let (text, image_url) = match payload.rsplit_once(ARROW) {
                Some((text, url)) if !url.trim().contains(' ') => {
                    (unescape(text.trim()), Some(unescape(url.trim())))
                }
                _ => (unescape(payload.trim()), None),
            };
            if text.is_empty() && image_url.is_none() {
                return None;
            }
            Some(Marker::Chart { text, image_url })
        }
        _ => None,
    }
}

/// Byte offset of the first unescaped `]`.
fn find_closing_bracket(s: &str) -> Option<usize> {
    let mut escaped = false;
    for (idx, c) in s.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' => escaped = true,
            ']' => return Some(idx),
            _ => {}
        }
    }
    None
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if c == '\\' || c == ']' {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(&next) = chars.peek() {
                if next == '\\' || next == ']' {
                    out.push(next);
                    chars.next();
                    continue;
                }
            }
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_serializes_with_arrow() {
        let marker = Marker::Link {
            text: "World".into(),
            url: "https://e.co".into(),
        };
        assert_eq!(marker.to_string(), "[LINK: World -> https://e.co]");
    }

    #[test]
    fn split_finds_markers_between_text() {
        let pieces = split_markers("see [LINK: A -> http://x] and [IMAGE: cat -> http://c.png]!");
        assert_eq!(pieces.len(), 5);
        assert_eq!(pieces[0], Piece::Text("see "));
        assert_eq!(
            pieces[1],
            Piece::Marker(Marker::Link {
                text: "A".into(),
                url: "http://x".into()
            })
        );
        assert_eq!(pieces[2], Piece::Text(" and "));
        assert_eq!(pieces[4], Piece::Text("!"));
    }

    #[test]
    fn image_context_is_parsed() {
        let pieces = split_markers("[IMAGE: A dog | Context: Park in spring -> https://i/dog.jpg]");
        assert_eq!(
            pieces,
            vec![Piece::Marker(Marker::Image {
                alt: "A dog".into(),
                context: Some("Park in spring".into()),
                url: "https://i/dog.jpg".into(),
            })]
        );
    }

    #[test]
    fn brackets_and_arrows_in_payload_survive() {
        let marker = Marker::Link {
            text: "step [1] -> step 2".into(),
            url: "https://e.co/a".into(),
        };
        let text = format!("x {} y", marker);
        let pieces = split_markers(&text);
        assert_eq!(pieces[1], Piece::Marker(marker));
        assert_eq!(pieces[2], Piece::Text(" y"));
    }

    #[test]
    fn malformed_markers_stay_text() {
        let input = "[LINK: no arrow here] and [TABLE: unterminated";
        assert_eq!(split_markers(input), vec![Piece::Text(input)]);
    }

    #[test]
    fn chart_image_alias_is_accepted() {
        let pieces = split_markers("[CHART_IMAGE: Revenue -> https://e.co/c.png]");
        assert_eq!(
            pieces,
            vec![Piece::Marker(Marker::Chart {
                text: "Revenue".into(),
                image_url: Some("https://e.co/c.png".into()),
            })]
        );
    }

    #[test]
    fn table_keeps_row_structure() {
        let marker = Marker::Table {
            raw_text: "a\tb\n1\t2".into(),
        };
        let text = marker.to_string();
        assert_eq!(split_markers(&text), vec![Piece::Marker(marker)]);
    }
}
