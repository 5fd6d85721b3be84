//! The four stage executors.

pub mod fetch;
pub mod generate;
pub mod solve;
pub mod upload;

/// Outcome of a stage that can partially succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Done,
    DoneWithWarning(String),
}

/// Pulls the first fenced code block out of an LLM reply, preferring a
/// fence tagged with `lang`. Replies without fences are taken verbatim.
pub(crate) fn extract_code_block(text: &str, lang: &str) -> String {
    let tagged = format!("```{lang}");
    let start = text
        .find(&tagged)
        .map(|i| i + tagged.len())
        .or_else(|| text.find("```").map(|i| i + 3));
    let Some(start) = start else {
        return text.trim().to_string();
    };
    let rest = &text[start..];
    let rest = rest.strip_prefix('\n').unwrap_or(rest);
    match rest.find("```") {
        Some(end) => rest[..end].trim_end().to_string(),
        None => rest.trim().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_tagged_fence() {
        let reply = "Here is the generator:\n```python\nprint(1)\n```\nHope it helps.";
        assert_eq!(extract_code_block(reply, "python"), "print(1)");
    }

    #[test]
    fn falls_back_to_any_fence() {
        let reply = "```\nint main() {}\n```";
        assert_eq!(extract_code_block(reply, "cpp"), "int main() {}");
    }

    #[test]
    fn plain_reply_is_taken_verbatim() {
        assert_eq!(extract_code_block("  print(2)\n", "python"), "print(2)");
    }
}
