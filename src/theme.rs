//! Page color inspection and the palette used for rewritten content.
//!
//! Classification is a best-effort RGB threshold heuristic. It has no formal
//! contract beyond: unknown colors and ties resolve to [`ThemeKind::Plain`],
//! which selects the fixed green/grey palette.

use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};

use crate::render::CONTAINER_ID;

static RGB_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^rgba?\(\s*(\d{1,3})\s*[, ]\s*(\d{1,3})\s*[, ]\s*(\d{1,3})\s*(?:[,/]\s*([\d.]+%?)\s*)?\)$")
        .unwrap()
});

static CSS_RULE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"([^{}]+)\{([^}]*)\}").unwrap());

const LIGHT_BACKGROUND: f32 = 0.85;
const DARK_BACKGROUND: f32 = 0.35;
const DARK_TEXT: f32 = 0.3;
const DISTINCT_SATURATION: f32 = 0.3;

// ── Colors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rgb(pub u8, pub u8, pub u8);

impl Rgb {
    /// Approximate relative luminance in `0.0..=1.0`.
    pub fn luminance(self) -> f32 {
        (0.2126 * self.0 as f32 + 0.7152 * self.1 as f32 + 0.0722 * self.2 as f32) / 255.0
    }

    pub fn saturation(self) -> f32 {
        let max = self.0.max(self.1).max(self.2) as f32;
        let min = self.0.min(self.1).min(self.2) as f32;
        if max == 0.0 {
            0.0
        } else {
            (max - min) / max
        }
    }

    fn is_distinct(self) -> bool {
        self.saturation() > DISTINCT_SATURATION && self.luminance() > 0.05
    }
}

impl fmt::Display for Rgb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:02x}{:02x}{:02x}", self.0, self.1, self.2)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unrecognized color: {0}")]
pub struct ColorParseError(String);

impl FromStr for Rgb {
    type Err = ColorParseError;

    /// Accepts `#rgb`, `#rrggbb`, `rgb()`/`rgba()` and a few named colors.
    /// Fully transparent colors are rejected, as they say nothing about the
    /// page's look.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = s.trim().trim_end_matches("!important").trim().to_lowercase();
        let err = || ColorParseError(s.to_string());

        if let Some(hex) = value.strip_prefix('#') {
            let digits: Vec<u8> = hex
                .chars()
                .map(|c| c.to_digit(16).map(|d| d as u8))
                .collect::<Option<_>>()
                .ok_or_else(err)?;
            return match digits.len() {
                3 => Ok(Rgb(digits[0] * 17, digits[1] * 17, digits[2] * 17)),
                6 => Ok(Rgb(
                    digits[0] * 16 + digits[1],
                    digits[2] * 16 + digits[3],
                    digits[4] * 16 + digits[5],
                )),
                _ => Err(err()),
            };
        }

        if let Some(caps) = RGB_RE.captures(&value) {
            let channel = |i: usize| -> Result<u8, ColorParseError> {
                caps[i].parse::<u16>().map(|v| v.min(255) as u8).map_err(|_| err())
            };
            if let Some(alpha) = caps.get(4) {
                let alpha = alpha.as_str();
                let transparent = match alpha.strip_suffix('%') {
                    Some(pct) => pct.parse::<f32>().map(|v| v == 0.0).unwrap_or(false),
                    None => alpha.parse::<f32>().map(|v| v == 0.0).unwrap_or(false),
                };
                if transparent {
                    return Err(err());
                }
            }
            return Ok(Rgb(channel(1)?, channel(2)?, channel(3)?));
        }

        match value.as_str() {
            "black" => Ok(Rgb(0, 0, 0)),
            "white" => Ok(Rgb(255, 255, 255)),
            "gray" | "grey" => Ok(Rgb(128, 128, 128)),
            "silver" => Ok(Rgb(192, 192, 192)),
            "red" => Ok(Rgb(255, 0, 0)),
            "green" => Ok(Rgb(0, 128, 0)),
            "blue" => Ok(Rgb(0, 0, 255)),
            "navy" => Ok(Rgb(0, 0, 128)),
            "purple" => Ok(Rgb(128, 0, 128)),
            "orange" => Ok(Rgb(255, 165, 0)),
            "teal" => Ok(Rgb(0, 128, 128)),
            "maroon" => Ok(Rgb(128, 0, 0)),
            _ => Err(err()),
        }
    }
}

// ── Page inspection ──────────────────────────────────────────────────────────

/// Colors read from the host page. `None` means the page does not declare one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageColors {
    pub background: Option<Rgb>,
    pub text: Option<Rgb>,
    pub heading: Option<Rgb>,
    pub link: Option<Rgb>,
}

impl PageColors {
    /// Read colors from inline styles, legacy `<body>` attributes and simple
    /// `<style>` rules targeting `body`, headings and links. Inline styles win.
    pub fn from_document(document: &Html) -> Self {
        let sheet = StyleRules::from_document(document);
        let root = document.root_element();

        let body = first(root, "body");
        let heading = first(root, "h1, h2, h3, h4, h5, h6");
        let link = first(root, "a");

        let background = body
            .and_then(|b| {
                inline_color(b, &["background-color", "background"])
                    .or_else(|| b.value().attr("bgcolor").and_then(|v| v.parse().ok()))
            })
            .or_else(|| sheet.color(&["body", "html"], &["background-color", "background"]));

        let text = body
            .and_then(|b| {
                inline_color(b, &["color"])
                    .or_else(|| b.value().attr("text").and_then(|v| v.parse().ok()))
            })
            .or_else(|| sheet.color(&["body", "html"], &["color"]));

        let heading = heading
            .and_then(|h| inline_color(h, &["color"]))
            .or_else(|| sheet.color(&["h1", "h2", "h3"], &["color"]));

        let link = link
            .and_then(|a| inline_color(a, &["color"]))
            .or_else(|| {
                body.and_then(|b| b.value().attr("link"))
                    .and_then(|v| v.parse().ok())
            })
            .or_else(|| sheet.color(&["a"], &["color"]));

        PageColors {
            background,
            text,
            heading,
            link,
        }
    }
}

fn first<'a>(root: ElementRef<'a>, selector: &str) -> Option<ElementRef<'a>> {
    let sel = Selector::parse(selector).ok()?;
    root.select(&sel).next()
}

fn inline_color(el: ElementRef<'_>, properties: &[&str]) -> Option<Rgb> {
    let style = el.value().attr("style")?;
    declaration_color(style, properties)
}

/// Find the first parseable color among `properties` in a declaration block.
fn declaration_color(block: &str, properties: &[&str]) -> Option<Rgb> {
    for property in properties {
        for decl in block.split(';') {
            let Some((name, value)) = decl.split_once(':') else {
                continue;
            };
            if !name.trim().eq_ignore_ascii_case(property) {
                continue;
            }
            // `background` shorthand: take the first token that is a color.
            let parsed = value
                .parse::<Rgb>()
                .ok()
                .or_else(|| value.split_whitespace().find_map(|tok| tok.parse().ok()));
            if parsed.is_some() {
                return parsed;
            }
        }
    }
    None
}

struct StyleRules {
    rules: Vec<(Vec<String>, String)>,
}

impl StyleRules {
    fn from_document(document: &Html) -> Self {
        let mut rules = Vec::new();
        if let Ok(sel) = Selector::parse("style") {
            for style in document.root_element().select(&sel) {
                let css: String = style.text().collect();
                for caps in CSS_RULE_RE.captures_iter(&css) {
                    let selectors = caps[1]
                        .split(',')
                        .map(|s| s.trim().to_lowercase())
                        .collect();
                    rules.push((selectors, caps[2].to_string()));
                }
            }
        }
        StyleRules { rules }
    }

    /// Later rules win, as in the cascade for equal specificity.
    fn color(&self, selectors: &[&str], properties: &[&str]) -> Option<Rgb> {
        self.rules
            .iter()
            .rev()
            .filter(|(sels, _)| sels.iter().any(|s| selectors.contains(&s.as_str())))
            .find_map(|(_, block)| declaration_color(block, properties))
    }
}

// ── Classification ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThemeKind {
    /// Light background, dark text, nothing distinctly colored.
    Plain,
    Dark,
    Styled,
}

/// Classify a page from its declared colors.
pub fn classify_theme(colors: &PageColors) -> ThemeKind {
    if let Some(bg) = colors.background {
        if bg.luminance() < DARK_BACKGROUND {
            return ThemeKind::Dark;
        }
    }

    let light_background = colors
        .background
        .map_or(true, |bg| bg.luminance() >= LIGHT_BACKGROUND);
    let dark_text = colors.text.map_or(true, |t| t.luminance() <= DARK_TEXT);
    let distinct_heading = colors.heading.is_some_and(Rgb::is_distinct);
    let distinct_link = colors.link.is_some_and(Rgb::is_distinct);

    if light_background && dark_text && !distinct_heading && !distinct_link {
        ThemeKind::Plain
    } else {
        ThemeKind::Styled
    }
}

// ── Palette ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThemeColors {
    pub heading: Rgb,
    pub strong: Rgb,
    pub emphasis: Rgb,
    pub link: Rgb,
    pub background: Rgb,
    pub text: Rgb,
    pub table_header: Rgb,
}

impl ThemeColors {
    /// The fixed green/grey palette.
    pub fn fallback() -> Self {
        ThemeColors {
            heading: Rgb(0x15, 0x80, 0x3d),
            strong: Rgb(0x16, 0x65, 0x34),
            emphasis: Rgb(0x4b, 0x55, 0x63),
            link: Rgb(0x05, 0x96, 0x69),
            background: Rgb(0xf9, 0xfa, 0xfb),
            text: Rgb(0x1f, 0x29, 0x37),
            table_header: Rgb(0x15, 0x80, 0x3d),
        }
    }

    fn dark() -> Self {
        ThemeColors {
            heading: Rgb(0xa7, 0x8b, 0xfa),
            strong: Rgb(0xfb, 0xbf, 0x24),
            emphasis: Rgb(0x34, 0xd3, 0x99),
            link: Rgb(0x60, 0xa5, 0xfa),
            background: Rgb(0x1f, 0x29, 0x37),
            text: Rgb(0xf9, 0xfa, 0xfb),
            table_header: Rgb(0x7c, 0x3a, 0xed),
        }
    }

    /// Pick a palette for the page: the fallback for plain pages, otherwise
    /// the page's own colors where it declares them.
    pub fn for_page(colors: &PageColors) -> Self {
        let kind = classify_theme(colors);
        tracing::debug!(?kind, "classified page theme");
        match kind {
            ThemeKind::Plain => Self::fallback(),
            ThemeKind::Dark => Self::dark().preserving(colors),
            ThemeKind::Styled => Self::fallback().preserving(colors),
        }
    }

    fn preserving(mut self, colors: &PageColors) -> Self {
        if let Some(bg) = colors.background {
            self.background = bg;
        }
        if let Some(text) = colors.text {
            self.text = text;
        }
        if let Some(heading) = colors.heading {
            self.heading = heading;
            self.strong = heading;
            self.table_header = heading;
        }
        if let Some(link) = colors.link {
            self.link = link;
            self.emphasis = link;
        }
        self
    }

    /// A stylesheet scoped to the rewritten-content container.
    pub fn stylesheet(&self) -> String {
        let id = CONTAINER_ID;
        format!(
            "#{id} {{ font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, Arial, sans-serif; \
line-height: 1.7; color: {text}; background: {bg}; max-width: 900px; margin: 0 auto; padding: 30px; border-radius: 12px; }}\n\
#{id} h1 {{ font-size: 2.5rem; font-weight: 800; color: {heading}; margin: 2rem 0 1rem 0; line-height: 1.2; }}\n\
#{id} h2 {{ font-size: 2rem; font-weight: 700; color: {heading}; margin: 1.5rem 0 0.75rem 0; line-height: 1.3; }}\n\
#{id} h3, #{id} h4, #{id} h5, #{id} h6 {{ font-weight: 600; color: {heading}; margin: 1.25rem 0 0.5rem 0; }}\n\
#{id} p, #{id} li {{ font-size: 1.1rem; margin: 0.75rem 0; color: {text}; }}\n\
#{id} strong, #{id} b {{ font-weight: 700; color: {strong}; }}\n\
#{id} em, #{id} i {{ font-style: italic; color: {emphasis}; }}\n\
#{id} a {{ color: {link}; text-decoration: underline; font-weight: 600; }}\n\
#{id} img {{ max-width: 100%; height: auto; margin: 15px 0; border-radius: 8px; }}\n\
#{id} figcaption {{ font-size: 0.95rem; color: {emphasis}; }}\n\
#{id} blockquote {{ border-left: 4px solid {heading}; margin: 1rem 0; padding-left: 1rem; }}\n\
#{id} table {{ width: 100%; border-collapse: collapse; margin: 20px 0; border: 2px solid {header}; }}\n\
#{id} th {{ background-color: {header}; color: #ffffff; padding: 12px; text-align: left; }}\n\
#{id} td {{ padding: 12px; border: 1px solid #e5e7eb; }}\n\
#{id} .engagify-chart {{ border: 2px solid {header}; border-radius: 8px; padding: 15px; margin: 15px 0; }}\n",
            text = self.text,
            bg = self.background,
            heading = self.heading,
            strong = self.strong,
            emphasis = self.emphasis,
            link = self.link,
            header = self.table_header,
        )
    }
}
