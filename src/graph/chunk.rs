/// Split document text into extraction chunks of at most `chunk_size_chars` characters.
///
/// Breaks at the last paragraph break inside the final 20% of a window, then at
/// the last whitespace or sentence end, and otherwise cuts hard. Chunks do not
/// overlap so a fact is only offered to the model once. Works on char
/// boundaries, so multi-byte text is never split mid-character.
pub fn chunk_text(text: &str, chunk_size_chars: usize) -> Vec<String> {
    let size = chunk_size_chars.max(1);
    let chars: Vec<(usize, char)> = text.char_indices().collect();
    let mut chunks = Vec::new();
    let mut start = 0usize;

    while start < chars.len() {
        let hard_end = (start + size).min(chars.len());
        let end = if hard_end < chars.len() {
            find_break(&chars, start, hard_end, size).unwrap_or(hard_end)
        } else {
            hard_end
        };

        let from = chars[start].0;
        let to = chars.get(end).map(|(byte, _)| *byte).unwrap_or(text.len());
        let piece = text[from..to].trim();
        if !piece.is_empty() {
            chunks.push(piece.to_string());
        }
        start = end;
    }

    chunks
}

/// Char index just past the best break point in the tail of `[start, hard_end)`.
fn find_break(chars: &[(usize, char)], start: usize, hard_end: usize, size: usize) -> Option<usize> {
    let window_start = hard_end.saturating_sub(size / 5).max(start + 1);
    let tail = &chars[window_start..hard_end];

    let paragraph = tail
        .windows(2)
        .rposition(|w| w[0].1 == '\n' && w[1].1 == '\n')
        .map(|i| window_start + i + 2);
    if paragraph.is_some() {
        return paragraph;
    }

    tail.iter()
        .rposition(|(_, c)| c.is_whitespace() || matches!(c, '.' | '!' | '?' | '。' | '！' | '？'))
        .map(|i| window_start + i + 1)
}
