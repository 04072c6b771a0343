//! Paragraph-boundary text splitter.
//!
//! Document content is split on blank-line boundaries and paragraphs are
//! merged greedily until a chunk reaches the minimum length, so short lines
//! (chat messages, bullet points) end up sharing a chunk with their
//! neighbors instead of polluting the indexes with fragments. A hard cap
//! keeps every chunk inside the store's content column budget.

/// Split `text` into chunks of at least `min_chars` (except possibly the
/// last) and at most roughly `max_chars`. Whitespace-only input yields no
/// chunks.
pub fn split_text(text: &str, min_chars: usize, max_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();

    for paragraph in paragraphs(text) {
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(&paragraph);

        while current.len() > max_chars {
            let head = take_head(&mut current, max_chars);
            chunks.push(head);
        }

        if current.len() > min_chars {
            chunks.push(std::mem::take(&mut current));
        }
    }

    if !current.is_empty() {
        chunks.push(current);
    }

    chunks
}

/// Paragraphs are runs of non-blank lines; a line of only whitespace is a
/// boundary.
fn paragraphs(text: &str) -> Vec<String> {
    let mut result = Vec::new();
    let mut current: Vec<&str> = Vec::new();

    for line in text.lines() {
        if line.trim().is_empty() {
            if !current.is_empty() {
                result.push(current.join("\n").trim().to_string());
                current.clear();
            }
        } else {
            current.push(line);
        }
    }
    if !current.is_empty() {
        result.push(current.join("\n").trim().to_string());
    }

    result.retain(|p| !p.is_empty());
    result
}

/// Remove and return roughly `max_chars` from the front of `current`,
/// preferring a whitespace boundary.
fn take_head(current: &mut String, max_chars: usize) -> String {
    // Round up to the next char boundary so the cut always makes progress.
    let mut cut = max_chars.min(current.len());
    while cut < current.len() && !current.is_char_boundary(cut) {
        cut += 1;
    }

    let boundary = current[..cut]
        .rfind(char::is_whitespace)
        .filter(|&pos| pos > 0)
        .unwrap_or(cut);

    let rest = current.split_off(boundary);
    let head = std::mem::replace(current, rest.trim_start().to_string());
    head.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIN: usize = 256;
    const MAX: usize = 2048;

    #[test]
    fn test_empty_input_has_no_chunks() {
        assert!(split_text("", MIN, MAX).is_empty());
        assert!(split_text("  \n\n \t\n", MIN, MAX).is_empty());
    }

    #[test]
    fn test_short_input_is_one_chunk() {
        let chunks = split_text("The quick brown fox jumps over the lazy dog.", MIN, MAX);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0], "The quick brown fox jumps over the lazy dog.");
    }

    #[test]
    fn test_small_paragraphs_merge() {
        let text = "First point.\n\nSecond point.\n\nThird point.";
        let chunks = split_text(text, MIN, MAX);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0], "First point. Second point. Third point.");
    }

    #[test]
    fn test_long_paragraphs_split() {
        let para = "word ".repeat(80).trim_end().to_string();
        let text = format!("{}\n\n{}\n\n{}", para, para, para);
        let chunks = split_text(&text, MIN, MAX);
        assert!(chunks.len() > 1);
        for chunk in &chunks[..chunks.len() - 1] {
            assert!(chunk.len() > MIN, "non-final chunk below minimum: {}", chunk.len());
        }
    }

    #[test]
    fn test_max_cap_enforced() {
        let huge = "a".repeat(10) + &" word".repeat(1200);
        let chunks = split_text(&huge, MIN, MAX);
        for chunk in &chunks {
            assert!(chunk.len() <= MAX, "chunk over cap: {}", chunk.len());
        }
        // Nothing is lost beyond whitespace normalization.
        let rejoined: usize = chunks.iter().map(|c| c.split_whitespace().count()).sum();
        assert_eq!(rejoined, huge.split_whitespace().count());
    }

    #[test]
    fn test_blank_lines_with_spaces_are_boundaries() {
        let text = "alpha\n   \nbeta";
        let chunks = split_text(text, 3, MAX);
        assert_eq!(chunks, vec!["alpha".to_string(), "beta".to_string()]);
    }

    #[test]
    fn test_has_chunk_iff_nonempty() {
        for text in ["", "\n\n", "x", "hello world", "a\n\nb"] {
            let chunks = split_text(text, MIN, MAX);
            assert_eq!(chunks.is_empty(), text.trim().is_empty());
        }
    }

    #[test]
    fn test_multibyte_input_does_not_panic() {
        let text = "ü".repeat(3000);
        let chunks = split_text(&text, MIN, MAX);
        assert!(!chunks.is_empty());
        let total: usize = chunks.iter().map(|c| c.chars().count()).sum();
        assert_eq!(total, 3000);
    }
}
