//! Word-window chunking for PDF text ahead of embedding.

/// Splits text into word windows of `chunk_size` words with `overlap`
/// words shared between neighbors. The final window may be shorter.
pub fn chunk_text(text: &str, chunk_size: usize, overlap: usize) -> Vec<String> {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.is_empty() || chunk_size == 0 {
        return Vec::new();
    }
    let step = chunk_size.saturating_sub(overlap).max(1);

    let mut chunks = Vec::new();
    let mut start = 0;
    while start < words.len() {
        let end = (start + chunk_size).min(words.len());
        chunks.push(words[start..end].join(" "));
        if end == words.len() {
            break;
        }
        start += step;
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(n: usize) -> String {
        (0..n).map(|i| format!("w{i}")).collect::<Vec<_>>().join(" ")
    }

    #[test]
    fn empty_text_yields_no_chunks() {
        assert!(chunk_text("", 500, 50).is_empty());
        assert!(chunk_text("   \n\t ", 500, 50).is_empty());
    }

    #[test]
    fn short_text_is_a_single_chunk() {
        let text = words(120);
        let chunks = chunk_text(&text, 500, 50);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0], text);
    }

    #[test]
    fn windows_advance_by_size_minus_overlap() {
        let text = words(1200);
        let chunks = chunk_text(&text, 500, 50);
        assert_eq!(chunks.len(), 3);
        assert!(chunks[0].starts_with("w0 "));
        assert!(chunks[1].starts_with("w450 "));
        assert!(chunks[2].starts_with("w900 "));
        assert!(chunks[2].ends_with("w1199"));
    }

    #[test]
    fn neighbors_share_the_overlap() {
        let text = words(600);
        let chunks = chunk_text(&text, 500, 50);
        assert_eq!(chunks.len(), 2);
        let first_tail: Vec<&str> = chunks[0].split_whitespace().rev().take(50).collect();
        let second_head: Vec<&str> = chunks[1].split_whitespace().take(50).collect();
        let mut first_tail = first_tail;
        first_tail.reverse();
        assert_eq!(first_tail, second_head);
    }

    #[test]
    fn exact_multiple_has_no_empty_tail() {
        let text = words(500);
        let chunks = chunk_text(&text, 500, 50);
        assert_eq!(chunks.len(), 1);
    }
}
