use scraper::{Html, Node};

const BLOCK_ELEMENTS: &[&str] = &[
    "address", "article", "blockquote", "br", "dd", "div", "dl", "dt", "footer", "h1", "h2", "h3",
    "h4", "h5", "h6", "header", "hr", "li", "ol", "p", "pre", "section", "table", "td", "th", "tr",
    "ul",
];

/// The first `limit` characters of `body`, or all of it when `limit` is `None`.
pub fn head(body: &str, limit: Option<usize>) -> &str {
    match limit.and_then(|n| body.char_indices().nth(n)) {
        Some((byte_idx, _)) => &body[..byte_idx],
        None => body,
    }
}

/// Text content with tags dropped and entities decoded. Block boundaries become spaces.
pub fn strip_markup(html: &str) -> String {
    let fragment = Html::parse_fragment(html);
    let mut out = String::with_capacity(html.len());

    for node in fragment.root_element().descendants() {
        match node.value() {
            Node::Element(element) if BLOCK_ELEMENTS.contains(&element.name()) => out.push(' '),
            Node::Text(text) => {
                let hidden = node
                    .parent()
                    .and_then(|p| p.value().as_element().map(|e| e.name()))
                    .is_some_and(|name| matches!(name, "script" | "style" | "title"));
                if !hidden {
                    out.push_str(text);
                }
            }
            _ => {}
        }
    }
    out
}

/// Runs of whitespace and control characters become one space; ends are trimmed.
pub fn collapse_whitespace(text: &str) -> String {
    text.split(|c: char| c.is_whitespace() || c.is_control())
        .filter(|piece| !piece.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn pre_clean(body: &str, head_chars: Option<usize>) -> (String, String) {
    let raw = head(body, head_chars).to_string();
    let cleaned = collapse_whitespace(&strip_markup(&raw));
    (raw, cleaned)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn head_counts_characters_not_bytes() {
        assert_eq!(head("ééé-abc", Some(4)), "ééé-");
        assert_eq!(head("short", Some(100)), "short");
        assert_eq!(head("anything", None), "anything");
    }

    #[test]
    fn markup_is_removed_and_blocks_separated() {
        let html = "<html><head><style>p{color:red}</style></head><body><p>Buy&nbsp;<b>WDG</b> at&#36;50</p><p>Stop\t45</p><script>var x=1;</script></body></html>";
        let cleaned = collapse_whitespace(&strip_markup(html));
        assert_eq!(cleaned, "Buy WDG at$50 Stop 45");
    }

    #[test]
    fn plain_text_passes_through() {
        let (raw, cleaned) = pre_clean("  Widget Inc (NYSE: WDG)\r\n\r\nBuy at 50  ", None);
        assert_eq!(raw, "  Widget Inc (NYSE: WDG)\r\n\r\nBuy at 50  ");
        assert_eq!(cleaned, "Widget Inc (NYSE: WDG) Buy at 50");
    }
}
