//! Parsing utilities for outer-LM responses.
//!
//! The REPL loop cares about one thing in a model turn: the fenced code
//! blocks tagged with the configured sandbox language. Everything else is
//! prose for the transcript.

/// Extract fenced code blocks tagged with `language`, in document order.
///
/// A block opens with `` ```<language> `` on its own line and closes at the
/// next `` ``` ``. Fences with a different tag (including tags that merely
/// start with `language`) are ignored, as is an unterminated final fence.
pub fn extract_code_blocks(text: &str, language: &str) -> Vec<String> {
    let open_tag = format!("```{}", language);
    let mut blocks = Vec::new();
    let mut rest = text;

    while let Some(start) = rest.find(&open_tag) {
        let after_tag = &rest[start + open_tag.len()..];

        // The tag must end its line; "```rhaiscript" is a different tag.
        let Some(newline) = after_tag.find('\n') else {
            break;
        };
        if !after_tag[..newline].trim().is_empty() {
            rest = after_tag;
            continue;
        }

        let body = &after_tag[newline + 1..];
        let Some(end) = body.find("```") else {
            break;
        };
        let block = body[..end].trim();
        if !block.is_empty() {
            blocks.push(block.to_string());
        }
        rest = &body[end + 3..];
    }

    blocks
}
