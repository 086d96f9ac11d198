//! Response text cleanup.
//!
//! Worker surfaces hand back rendered text: HTML entities, copy/download
//! button labels scraped along with the answer, and runs of blank lines.

use std::sync::LazyLock;

use regex::Regex;

static EXCESS_NEWLINES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n{3,}").unwrap_or_else(|e| panic!("invalid regex: {e}")));

static ARTIFACT_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^[ \t]*(?:Copy(?: code)?|Download)[ \t]*$\n?")
        .unwrap_or_else(|e| panic!("invalid regex: {e}"))
});

/// Normalizes a raw scraped response into deliverable text.
pub fn normalize(raw: &str) -> String {
    let decoded = decode_entities(raw);
    let stripped = ARTIFACT_LINE.replace_all(&decoded, "");
    let collapsed = EXCESS_NEWLINES.replace_all(&stripped, "\n\n");
    unwrap_fence(collapsed.trim()).to_string()
}

/// Surfaces sometimes wrap the whole answer in one code fence; unwrap it,
/// but leave fences that only cover part of the text alone.
fn unwrap_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let Some(inner) = rest.strip_suffix("```") else {
        return text;
    };
    // Drop the info string on the opening fence line.
    let body = match inner.split_once('\n') {
        Some((info, body)) if !info.contains("```") => body,
        _ => return text,
    };
    if body.contains("```") {
        return text;
    }
    body.trim()
}

fn decode_entities(text: &str) -> String {
    // &amp; last so freshly decoded ampersands are not re-expanded.
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_html_entities() {
        assert_eq!(normalize("a &lt; b &amp;&amp; c &gt; d"), "a < b && c > d");
        assert_eq!(normalize("&quot;hi&#39;s&quot;"), "\"hi's\"");
    }

    #[test]
    fn strips_button_artifacts() {
        let raw = "Here is the code:\nCopy\nfn main() {}\nDownload\ndone";
        assert_eq!(normalize(raw), "Here is the code:\nfn main() {}\ndone");
    }

    #[test]
    fn keeps_inline_copy_words() {
        assert_eq!(normalize("Copy this file to /tmp"), "Copy this file to /tmp");
    }

    #[test]
    fn collapses_blank_runs_and_trims() {
        assert_eq!(normalize("\n\na\n\n\n\n\nb\n\n"), "a\n\nb");
    }

    #[test]
    fn unwraps_whole_response_fence() {
        assert_eq!(normalize("```rust\nfn main() {}\n```"), "fn main() {}");
        // Partial fences stay intact.
        let mixed = "intro\n```rust\nfn main() {}\n```";
        assert_eq!(normalize(mixed), mixed);
    }
}
