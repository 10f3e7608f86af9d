use pulldown_cmark::{Event, Options, Parser, Tag, TagEnd};

/// Reduce markdown to the text a reader sees: markup dropped, block
/// boundaries turned into newlines, code kept verbatim.
pub fn to_plain_text(input: &str) -> String {
    let options = Options::ENABLE_STRIKETHROUGH | Options::ENABLE_TABLES;
    let parser = Parser::new_ext(input, options);

    let mut out = String::new();
    for event in parser {
        match event {
            Event::Text(text) | Event::Code(text) => out.push_str(&text),
            Event::SoftBreak => out.push(' '),
            Event::HardBreak => out.push('\n'),
            Event::Start(Tag::Item) => {
                if !out.is_empty() && !out.ends_with('\n') {
                    out.push('\n');
                }
            }
            Event::End(
                TagEnd::Paragraph
                | TagEnd::Heading(_)
                | TagEnd::Item
                | TagEnd::CodeBlock
                | TagEnd::TableRow
                | TagEnd::BlockQuote(_),
            ) => {
                if !out.ends_with('\n') {
                    out.push('\n');
                }
            }
            Event::End(TagEnd::TableCell) => out.push(' '),
            Event::Rule => out.push('\n'),
            _ => {}
        }
    }

    out.trim().to_string()
}

/// Single-line preview of at most `max_chars` characters.
pub fn preview(input: &str, max_chars: usize) -> String {
    let flat = to_plain_text(input)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    if flat.chars().count() <= max_chars {
        flat
    } else {
        let cut: String = flat.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{}...", cut.trim_end())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text() {
        assert_eq!(to_plain_text("Hello world"), "Hello world");
    }

    #[test]
    fn test_bold_italic_dropped() {
        assert_eq!(to_plain_text("**bold** and *italic*"), "bold and italic");
    }

    #[test]
    fn test_code_block_kept() {
        let text = to_plain_text("Run this:\n\n```rust\nfn main() {}\n```");
        assert_eq!(text, "Run this:\nfn main() {}");
    }

    #[test]
    fn test_heading_and_list() {
        let text = to_plain_text("# Title\n\n- one\n- two");
        assert_eq!(text, "Title\none\ntwo");
    }

    #[test]
    fn test_inline_code_and_link() {
        assert_eq!(
            to_plain_text("Use `cargo` from [the site](https://example.com)"),
            "Use cargo from the site"
        );
    }

    #[test]
    fn test_preview_truncates() {
        assert_eq!(preview("short", 10), "short");
        assert_eq!(preview("line one\n\nline two", 100), "line one line two");
        assert_eq!(preview("abcdefghijklmnop", 10), "abcdefg...");
    }
}
